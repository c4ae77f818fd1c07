pub use sea_orm_migration::prelude::*;

mod m20250301_000001_initial_schema;
mod m20250302_000001_add_clients_engagements;
mod m20250305_000001_add_documents;
mod m20250310_000001_add_audit_logs;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_initial_schema::Migration),
            Box::new(m20250302_000001_add_clients_engagements::Migration),
            Box::new(m20250305_000001_add_documents::Migration),
            Box::new(m20250310_000001_add_audit_logs::Migration),
        ]
    }
}
