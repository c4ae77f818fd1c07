use crate::policy::Role;
use crate::storage::{self, NewUser};
use miette::{IntoDiagnostic, Result};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::fs;

/// User definition from the seed file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedUser {
    pub email: String,
    pub name: String,
    pub role: Role,
    /// Plain text password (will be hashed). Only used when the user is created.
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedFirm {
    pub name: String,
    #[serde(default)]
    pub users: Vec<SeedUser>,
}

/// Root structure of the seed JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedFile {
    pub firms: Vec<SeedFirm>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedReport {
    pub firms_created: usize,
    pub users_created: usize,
    pub users_updated: usize,
    pub users_unchanged: usize,
    pub users_skipped: usize,
}

/// Sync firms and users from a JSON file (idempotent)
pub async fn seed_from_file(db: &DatabaseConnection, file_path: &str) -> Result<SeedReport> {
    tracing::info!("Loading seed data from {}", file_path);

    let content = fs::read_to_string(file_path)
        .into_diagnostic()
        .map_err(|e| miette::miette!("Failed to read seed file at '{}': {}", file_path, e))?;

    let seed: SeedFile = serde_json::from_str(&content)
        .into_diagnostic()
        .map_err(|e| {
            miette::miette!(
                "Failed to parse seed file: {}\n\nExpected format:\n{{\n  \"firms\": [\n    {{\n      \"name\": \"Example & Co\",\n      \"users\": [\n        {{ \"email\": \"admin@example.com\", \"name\": \"Admin\", \"role\": \"admin\", \"password\": \"change-me-now\" }}\n      ]\n    }}\n  ]\n}}",
                e
            )
        })?;

    let report = apply_seed(db, &seed).await?;
    tracing::info!(
        "Seed complete: {} firm(s) created, {} user(s) created, {} updated, {} unchanged, {} skipped",
        report.firms_created,
        report.users_created,
        report.users_updated,
        report.users_unchanged,
        report.users_skipped
    );
    Ok(report)
}

pub async fn apply_seed(db: &DatabaseConnection, seed: &SeedFile) -> Result<SeedReport> {
    let mut report = SeedReport::default();

    for firm_def in &seed.firms {
        let firm = match storage::get_firm_by_name(db, &firm_def.name)
            .await
            .into_diagnostic()?
        {
            Some(firm) => firm,
            None => {
                tracing::info!("Creating firm: {}", firm_def.name);
                report.firms_created += 1;
                storage::create_firm(db, &firm_def.name)
                    .await
                    .into_diagnostic()?
            }
        };

        for user_def in &firm_def.users {
            let existing = storage::get_user_by_email(db, &user_def.email)
                .await
                .into_diagnostic()?;

            match existing {
                None => {
                    tracing::info!("Creating user: {}", user_def.email);
                    storage::create_user(
                        db,
                        &firm.id,
                        NewUser {
                            email: user_def.email.clone(),
                            name: user_def.name.clone(),
                            role: user_def.role,
                            password: user_def.password.clone(),
                        },
                    )
                    .await
                    .into_diagnostic()?;
                    report.users_created += 1;
                }
                Some(user) if user.firm_id != firm.id => {
                    // Users never move between firms
                    tracing::warn!(
                        "User {} belongs to another firm; not moving it to {}",
                        user_def.email,
                        firm_def.name
                    );
                    report.users_skipped += 1;
                }
                Some(user) => {
                    if user.name == user_def.name.trim() && user.role == user_def.role.as_str() {
                        report.users_unchanged += 1;
                    } else {
                        tracing::info!("Updating user: {}", user_def.email);
                        storage::update_user_profile(db, user, &user_def.name, user_def.role)
                            .await
                            .into_diagnostic()?;
                        report.users_updated += 1;
                    }
                }
            }
        }
    }

    Ok(report)
}
