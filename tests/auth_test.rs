mod helpers;

use docvault::entities::{rate_limit_counter, RateLimitCounter, Session};
use docvault::errors::DocError;
use docvault::jobs;
use docvault::policy::Role;
use docvault::rate_limit;
use docvault::seed::{self, SeedFile, SeedFirm, SeedReport, SeedUser};
use docvault::settings::RateLimit;
use docvault::storage;
use helpers::{TestDb, TestFirm};
use sea_orm::{ActiveModelTrait, EntityTrait, PaginatorTrait, Set};

#[tokio::test]
async fn test_session_resolves_to_user() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let firm = TestFirm::create(db, "Sessions").await;
    let user = storage::get_firm_user(db, &firm.firm.id, &firm.manager.id)
        .await
        .unwrap()
        .unwrap();

    let session = storage::create_session(db, &user, 3600).await.unwrap();
    let resolved = storage::resolve_session(db, &session.id)
        .await
        .unwrap()
        .expect("session resolves");
    assert_eq!(resolved, firm.manager);
    assert_eq!(resolved.firm_name, "Sessions");

    storage::delete_session(db, &session.id).await.unwrap();
    assert!(storage::resolve_session(db, &session.id)
        .await
        .unwrap()
        .is_none());
    assert!(storage::resolve_session(db, "no-such-session")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_expired_sessions_are_rejected_and_cleaned() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let firm = TestFirm::create(db, "Expiry").await;
    let user = storage::get_firm_user(db, &firm.firm.id, &firm.staff.id)
        .await
        .unwrap()
        .unwrap();

    let expired = storage::create_session(db, &user, -10).await.unwrap();
    let live = storage::create_session(db, &user, 3600).await.unwrap();
    assert!(storage::resolve_session(db, &expired.id)
        .await
        .unwrap()
        .is_none());

    let removed = storage::cleanup_expired_sessions(db).await.unwrap();
    assert_eq!(removed, 1);
    assert!(Session::find_by_id(live.id).one(db).await.unwrap().is_some());
}

#[tokio::test]
async fn test_session_is_firm_bound() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let firm = TestFirm::create(db, "Bound").await;
    let user = storage::get_firm_user(db, &firm.firm.id, &firm.admin.id)
        .await
        .unwrap()
        .unwrap();
    let session = storage::create_session(db, &user, 3600).await.unwrap();

    // A session whose firm no longer matches the user resolves to nobody
    let mut active: docvault::entities::session::ActiveModel = session.clone().into();
    active.firm_id = Set("another-firm".to_string());
    active.update(db).await.unwrap();

    assert!(storage::resolve_session(db, &session.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_rate_limit_window() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();

    for _ in 0..3 {
        rate_limit::check_and_increment(db, "login:ip:192.0.2.1", 3, 3600)
            .await
            .unwrap();
    }
    match rate_limit::check_and_increment(db, "login:ip:192.0.2.1", 3, 3600).await {
        Err(DocError::RateLimited { retry_after_secs }) => {
            assert!((1..=3600).contains(&retry_after_secs));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }

    // Other keys have their own budget
    rate_limit::check_and_increment(db, "login:ip:192.0.2.2", 3, 3600)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_housekeeping_prunes_stale_state() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let firm = TestFirm::create(db, "Housekeeping").await;
    let user = storage::get_firm_user(db, &firm.firm.id, &firm.staff.id)
        .await
        .unwrap()
        .unwrap();
    storage::create_session(db, &user, -1).await.unwrap();

    rate_limit_counter::ActiveModel {
        key: Set("upload:user:old".to_string()),
        window_start: Set(0),
        count: Set(5),
    }
    .insert(db)
    .await
    .unwrap();
    rate_limit::check_and_increment(db, "upload:user:fresh", 10, 60)
        .await
        .unwrap();

    jobs::run_housekeeping(db, &RateLimit::default()).await;

    assert_eq!(Session::find().count(db).await.unwrap(), 0);
    let remaining = RateLimitCounter::find().all(db).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].key, "upload:user:fresh");
}

fn seed_file() -> SeedFile {
    SeedFile {
        firms: vec![SeedFirm {
            name: "Seeded & Co".to_string(),
            users: vec![
                SeedUser {
                    email: "admin@seeded.test".to_string(),
                    name: "Seeded Admin".to_string(),
                    role: Role::Admin,
                    password: "seeded-password-1".to_string(),
                },
                SeedUser {
                    email: "staff@seeded.test".to_string(),
                    name: "Seeded Staff".to_string(),
                    role: Role::Staff,
                    password: "seeded-password-2".to_string(),
                },
            ],
        }],
    }
}

#[tokio::test]
async fn test_seed_is_idempotent() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();

    let first = seed::apply_seed(db, &seed_file()).await.unwrap();
    assert_eq!(
        first,
        SeedReport {
            firms_created: 1,
            users_created: 2,
            ..Default::default()
        }
    );

    let second = seed::apply_seed(db, &seed_file()).await.unwrap();
    assert_eq!(
        second,
        SeedReport {
            users_unchanged: 2,
            ..Default::default()
        }
    );

    // Role changes are applied, passwords are left alone
    let mut changed = seed_file();
    changed.firms[0].users[1].role = Role::Manager;
    changed.firms[0].users[1].password = "a-new-password".to_string();
    let third = seed::apply_seed(db, &changed).await.unwrap();
    assert_eq!(third.users_updated, 1);

    let staff = storage::verify_user_password(db, "staff@seeded.test", "seeded-password-2")
        .await
        .unwrap()
        .expect("original password still valid");
    assert_eq!(staff.role, "manager");
}

#[tokio::test]
async fn test_seed_never_moves_users_between_firms() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    seed::apply_seed(db, &seed_file()).await.unwrap();

    let mut other = seed_file();
    other.firms[0].name = "Other Firm".to_string();
    other.firms[0].users.truncate(1);
    let report = seed::apply_seed(db, &other).await.unwrap();
    assert_eq!(report.firms_created, 1);
    assert_eq!(report.users_skipped, 1);

    let admin = storage::get_user_by_email(db, "admin@seeded.test")
        .await
        .unwrap()
        .unwrap();
    let original = storage::get_firm_by_name(db, "Seeded & Co")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(admin.firm_id, original.id);
}
