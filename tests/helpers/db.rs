use sea_orm::{DatabaseConnection, EntityTrait, PaginatorTrait};
use sea_orm_migration::MigratorTrait;
use tempfile::NamedTempFile;

/// Test database with automatic cleanup
pub struct TestDb {
    connection: DatabaseConnection,
    _temp_file: NamedTempFile,
}

impl TestDb {
    /// Create a new test database with migrations applied
    pub async fn new() -> Self {
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let db_url = format!("sqlite://{}?mode=rwc", db_path);

        let connection = sea_orm::Database::connect(&db_url)
            .await
            .expect("Failed to connect to test database");

        migration::Migrator::up(&connection, None)
            .await
            .expect("Failed to run migrations");

        Self {
            connection,
            _temp_file: temp_file,
        }
    }

    /// Get database connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    pub async fn audit_count(&self) -> u64 {
        docvault::entities::AuditLog::find()
            .count(&self.connection)
            .await
            .expect("Failed to count audit rows")
    }

    pub async fn audit_rows(&self) -> Vec<docvault::entities::audit_log::Model> {
        use sea_orm::QueryOrder;
        docvault::entities::AuditLog::find()
            .order_by_asc(docvault::entities::audit_log::Column::CreatedAt)
            .all(&self.connection)
            .await
            .expect("Failed to load audit rows")
    }
}
