use docvault::entities::{client, engagement, firm, user};
use docvault::policy::{AuthUser, Role};
use docvault::storage::{self, NewUser};
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};

/// Builder for creating test users.
///
/// Without a password the row gets an unusable hash, which skips argon2 and
/// keeps tests fast. Login tests call `with_password`.
pub struct UserBuilder {
    firm_id: String,
    email: String,
    name: String,
    role: Role,
    password: Option<String>,
}

impl UserBuilder {
    pub fn new(firm_id: &str, email: &str) -> Self {
        Self {
            firm_id: firm_id.to_string(),
            email: email.to_string(),
            name: email.split('@').next().unwrap_or(email).to_string(),
            role: Role::Staff,
            password: None,
        }
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> user::Model {
        match self.password {
            Some(password) => storage::create_user(
                db,
                &self.firm_id,
                NewUser {
                    email: self.email,
                    name: self.name,
                    role: self.role,
                    password,
                },
            )
            .await
            .expect("Failed to create test user"),
            None => user::ActiveModel {
                id: Set(storage::new_id()),
                firm_id: Set(self.firm_id),
                email: Set(self.email.to_lowercase()),
                name: Set(self.name),
                role: Set(self.role.as_str().to_string()),
                password_hash: Set("!".to_string()),
                created_at: Set(storage::now()),
                last_login_at: Set(None),
            }
            .insert(db)
            .await
            .expect("Failed to insert test user"),
        }
    }
}

pub fn auth_user(user: &user::Model, firm: &firm::Model) -> AuthUser {
    AuthUser {
        id: user.id.clone(),
        firm_id: user.firm_id.clone(),
        email: user.email.clone(),
        name: user.name.clone(),
        role: user.role.parse().expect("valid role"),
        firm_name: firm.name.clone(),
    }
}

/// Builder for creating test clients without going through the audited service
pub struct ClientBuilder {
    firm_id: String,
    name: String,
}

impl ClientBuilder {
    pub fn new(firm_id: &str) -> Self {
        Self {
            firm_id: firm_id.to_string(),
            name: "Acme Pty Ltd".to_string(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> client::Model {
        client::ActiveModel {
            id: Set(storage::new_id()),
            firm_id: Set(self.firm_id),
            name: Set(self.name),
            external_reference: Set(None),
            status: Set("active".to_string()),
            created_at: Set(storage::now()),
        }
        .insert(db)
        .await
        .expect("Failed to insert test client")
    }
}

/// Builder for creating test engagements
pub struct EngagementBuilder {
    firm_id: String,
    client_id: String,
    name: String,
    financial_year: String,
}

impl EngagementBuilder {
    pub fn new(client: &client::Model) -> Self {
        Self {
            firm_id: client.firm_id.clone(),
            client_id: client.id.clone(),
            name: "Annual return".to_string(),
            financial_year: "FY2025".to_string(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn financial_year(mut self, year: &str) -> Self {
        self.financial_year = year.to_string();
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> engagement::Model {
        engagement::ActiveModel {
            id: Set(storage::new_id()),
            firm_id: Set(self.firm_id),
            client_id: Set(self.client_id),
            name: Set(self.name),
            financial_year: Set(self.financial_year),
            status: Set("open".to_string()),
            due_date: Set(None),
            created_at: Set(storage::now()),
        }
        .insert(db)
        .await
        .expect("Failed to insert test engagement")
    }
}

/// A firm with one user per role.
pub struct TestFirm {
    pub firm: firm::Model,
    pub admin: AuthUser,
    pub manager: AuthUser,
    pub staff: AuthUser,
}

impl TestFirm {
    pub async fn create(db: &DatabaseConnection, name: &str) -> Self {
        let firm = storage::create_firm(db, name)
            .await
            .expect("Failed to create test firm");
        let slug = name.to_lowercase().replace(' ', "-");

        let admin = UserBuilder::new(&firm.id, &format!("admin@{slug}.test"))
            .role(Role::Admin)
            .name("Ada Admin")
            .create(db)
            .await;
        let manager = UserBuilder::new(&firm.id, &format!("manager@{slug}.test"))
            .role(Role::Manager)
            .name("Max Manager")
            .create(db)
            .await;
        let staff = UserBuilder::new(&firm.id, &format!("staff@{slug}.test"))
            .role(Role::Staff)
            .name("Sam Staff")
            .create(db)
            .await;

        Self {
            admin: auth_user(&admin, &firm),
            manager: auth_user(&manager, &firm),
            staff: auth_user(&staff, &firm),
            firm,
        }
    }

    pub async fn add_staff(&self, db: &DatabaseConnection, email: &str) -> AuthUser {
        let user = UserBuilder::new(&self.firm.id, email).create(db).await;
        auth_user(&user, &self.firm)
    }
}
