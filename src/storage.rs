use crate::entities;
use crate::errors::DocError;
use crate::policy::{AuthUser, Role};
use crate::settings::Database as DbCfg;
use base64ct::Encoding;
use chrono::Utc;
use rand::RngCore;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait,
    QueryFilter, Set,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUser {
    pub email: String,
    pub name: String,
    pub role: Role,
    pub password: String,
}

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, DocError> {
    let db = Database::connect(&cfg.url).await?;
    Ok(db)
}

/// Opaque, URL-safe random token (192 bits). Used for session ids.
pub fn random_id() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

/// Entity primary key.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn now() -> i64 {
    Utc::now().timestamp()
}

// Firm functions

pub async fn create_firm<C: ConnectionTrait>(
    db: &C,
    name: &str,
) -> Result<entities::firm::Model, DocError> {
    let firm = entities::firm::ActiveModel {
        id: Set(new_id()),
        name: Set(name.to_string()),
        created_at: Set(now()),
    };

    Ok(firm.insert(db).await?)
}

pub async fn get_firm<C: ConnectionTrait>(
    db: &C,
    firm_id: &str,
) -> Result<Option<entities::firm::Model>, DocError> {
    Ok(entities::Firm::find_by_id(firm_id.to_string()).one(db).await?)
}

pub async fn get_firm_by_name<C: ConnectionTrait>(
    db: &C,
    name: &str,
) -> Result<Option<entities::firm::Model>, DocError> {
    use entities::firm::{Column, Entity};

    Ok(Entity::find().filter(Column::Name.eq(name)).one(db).await?)
}

// User management functions

fn hash_password(password: &str) -> Result<String, DocError> {
    use argon2::password_hash::{rand_core::OsRng, SaltString};
    use argon2::{Argon2, PasswordHasher};

    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| DocError::Other(format!("Password hashing failed: {}", e)))?
        .to_string())
}

pub async fn create_user<C: ConnectionTrait>(
    db: &C,
    firm_id: &str,
    input: NewUser,
) -> Result<entities::user::Model, DocError> {
    let email = input.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(DocError::BadRequest("a valid email is required".into()));
    }
    if input.password.len() < 8 {
        return Err(DocError::BadRequest(
            "password must be at least 8 characters".into(),
        ));
    }
    if get_user_by_email(db, &email).await?.is_some() {
        return Err(DocError::BadRequest(format!("email {email} is already registered")));
    }

    let user = entities::user::ActiveModel {
        id: Set(new_id()),
        firm_id: Set(firm_id.to_string()),
        email: Set(email),
        name: Set(input.name.trim().to_string()),
        role: Set(input.role.as_str().to_string()),
        password_hash: Set(hash_password(&input.password)?),
        created_at: Set(now()),
        last_login_at: Set(None),
    };

    Ok(user.insert(db).await?)
}

pub async fn get_user_by_email<C: ConnectionTrait>(
    db: &C,
    email: &str,
) -> Result<Option<entities::user::Model>, DocError> {
    use entities::user::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::Email.eq(email.trim().to_lowercase()))
        .one(db)
        .await?)
}

/// Firm-scoped user lookup; a user of another firm is reported as absent.
pub async fn get_firm_user<C: ConnectionTrait>(
    db: &C,
    firm_id: &str,
    user_id: &str,
) -> Result<Option<entities::user::Model>, DocError> {
    use entities::user::{Column, Entity};

    Ok(Entity::find()
        .filter(Column::Id.eq(user_id))
        .filter(Column::FirmId.eq(firm_id))
        .one(db)
        .await?)
}

/// Returns the user on a correct password, `None` otherwise.
pub async fn verify_user_password<C: ConnectionTrait>(
    db: &C,
    email: &str,
    password: &str,
) -> Result<Option<entities::user::Model>, DocError> {
    use argon2::{Argon2, PasswordHash, PasswordVerifier};

    let user = match get_user_by_email(db, email).await? {
        Some(u) => u,
        None => return Ok(None),
    };

    // Accounts without a usable hash cannot sign in
    let parsed_hash = match PasswordHash::new(&user.password_hash) {
        Ok(hash) => hash,
        Err(e) => {
            tracing::warn!(user_id = %user.id, error = %e, "stored password hash is unusable");
            return Ok(None);
        }
    };

    if Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
    {
        Ok(Some(user))
    } else {
        Ok(None)
    }
}

/// Updates display name and role; email and password are left alone.
pub async fn update_user_profile<C: ConnectionTrait>(
    db: &C,
    user: entities::user::Model,
    name: &str,
    role: Role,
) -> Result<entities::user::Model, DocError> {
    let mut active: entities::user::ActiveModel = user.into();
    active.name = Set(name.trim().to_string());
    active.role = Set(role.as_str().to_string());
    Ok(active.update(db).await?)
}

pub async fn record_login<C: ConnectionTrait>(db: &C, user_id: &str) -> Result<(), DocError> {
    if let Some(user) = entities::User::find_by_id(user_id.to_string()).one(db).await? {
        let mut active: entities::user::ActiveModel = user.into();
        active.last_login_at = Set(Some(now()));
        active.update(db).await?;
    }
    Ok(())
}

// Session management functions

pub async fn create_session<C: ConnectionTrait>(
    db: &C,
    user: &entities::user::Model,
    ttl_secs: i64,
) -> Result<entities::session::Model, DocError> {
    let now = now();

    let session = entities::session::ActiveModel {
        id: Set(random_id()),
        user_id: Set(user.id.clone()),
        firm_id: Set(user.firm_id.clone()),
        created_at: Set(now),
        expires_at: Set(now + ttl_secs),
        last_seen_at: Set(now),
    };

    Ok(session.insert(db).await?)
}

/// Resolves a session token to the acting user, refreshing `last_seen_at`.
/// Unknown, expired or orphaned sessions yield `None`.
pub async fn resolve_session<C: ConnectionTrait>(
    db: &C,
    session_id: &str,
) -> Result<Option<AuthUser>, DocError> {
    let session = match entities::Session::find_by_id(session_id.to_string())
        .one(db)
        .await?
    {
        Some(s) => s,
        None => return Ok(None),
    };

    let now = now();
    if now > session.expires_at {
        return Ok(None);
    }

    let user = match get_firm_user(db, &session.firm_id, &session.user_id).await? {
        Some(u) => u,
        None => return Ok(None),
    };
    let firm = match get_firm(db, &session.firm_id).await? {
        Some(f) => f,
        None => return Ok(None),
    };
    let role: Role = match user.role.parse() {
        Ok(r) => r,
        Err(_) => {
            tracing::warn!(user_id = %user.id, role = %user.role, "user has unknown role");
            return Ok(None);
        }
    };

    let mut active: entities::session::ActiveModel = session.into();
    active.last_seen_at = Set(now);
    active.update(db).await?;

    Ok(Some(AuthUser {
        id: user.id,
        firm_id: user.firm_id,
        email: user.email,
        name: user.name,
        role,
        firm_name: firm.name,
    }))
}

pub async fn delete_session<C: ConnectionTrait>(db: &C, session_id: &str) -> Result<(), DocError> {
    use entities::session::{Column, Entity};

    Entity::delete_many()
        .filter(Column::Id.eq(session_id))
        .exec(db)
        .await?;

    Ok(())
}

pub async fn cleanup_expired_sessions(db: &DatabaseConnection) -> Result<u64, DocError> {
    use entities::session::{Column, Entity};

    let result = Entity::delete_many()
        .filter(Column::ExpiresAt.lt(now()))
        .exec(db)
        .await?;

    Ok(result.rows_affected)
}
