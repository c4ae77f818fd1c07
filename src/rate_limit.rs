//! Fixed-window request counters stored in the database, so every instance
//! behind a load balancer shares the same budget.

use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};

use crate::entities::rate_limit_counter::{self, Column, Entity};
use crate::errors::DocError;
use crate::storage;

/// Windows older than this many window lengths are deleted.
const PRUNE_AFTER_WINDOWS: i64 = 10;

pub fn login_ip_key(ip: &str) -> String {
    format!("login:ip:{ip}")
}

pub fn login_email_key(email: &str) -> String {
    format!("login:email:{}", email.trim().to_lowercase())
}

pub fn upload_user_key(user_id: &str) -> String {
    format!("upload:user:{user_id}")
}

fn window_start(now: i64, window_secs: i64) -> i64 {
    now - now.rem_euclid(window_secs)
}

/// Counts one hit against `key` and fails with `RateLimited` once the
/// window holds more than `limit` hits.
pub async fn check_and_increment<C: ConnectionTrait>(
    db: &C,
    key: &str,
    limit: i64,
    window_secs: i64,
) -> Result<(), DocError> {
    let window_secs = window_secs.max(1);
    let now = storage::now();
    let start = window_start(now, window_secs);

    let counter = rate_limit_counter::ActiveModel {
        key: Set(key.to_string()),
        window_start: Set(start),
        count: Set(1),
    };
    Entity::insert(counter)
        .on_conflict(
            OnConflict::columns([Column::Key, Column::WindowStart])
                .value(
                    Column::Count,
                    Expr::col((Entity, Column::Count)).add(1),
                )
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;

    let count = Entity::find_by_id((key.to_string(), start))
        .one(db)
        .await?
        .map(|c| c.count)
        .unwrap_or(1);

    Entity::delete_many()
        .filter(Column::Key.eq(key))
        .filter(Column::WindowStart.lt(now - PRUNE_AFTER_WINDOWS * window_secs))
        .exec(db)
        .await?;

    if count > limit {
        let retry_after_secs = (start + window_secs - now).max(1);
        tracing::warn!(key, count, limit, retry_after_secs, "rate limit exceeded");
        return Err(DocError::RateLimited { retry_after_secs });
    }

    Ok(())
}

/// Deletes every window older than ten of the longest configured window.
pub async fn prune_stale_windows<C: ConnectionTrait>(
    db: &C,
    longest_window_secs: i64,
) -> Result<u64, DocError> {
    let cutoff = storage::now() - PRUNE_AFTER_WINDOWS * longest_window_secs.max(1);
    let result = Entity::delete_many()
        .filter(Column::WindowStart.lt(cutoff))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_start_alignment() {
        assert_eq!(window_start(1_000, 60), 960);
        assert_eq!(window_start(960, 60), 960);
        assert_eq!(window_start(59, 60), 0);
    }

    #[test]
    fn test_keys() {
        assert_eq!(login_ip_key("10.0.0.1"), "login:ip:10.0.0.1");
        assert_eq!(login_email_key(" Ann@Example.com "), "login:email:ann@example.com");
        assert_eq!(upload_user_key("u1"), "upload:user:u1");
    }
}
