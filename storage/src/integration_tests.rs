use std::path::Path;

use chrono::DateTime;
use sqlx::{Connection, SqliteConnection};

use crate::export;
use crate::migration::{self, LATEST_VERSION, SCHEMA_V1};
use crate::{
    ActionKind, ActorStatus, ChipRegistration, EmailRegistration, LoggedAction, Storage,
    StorageError, StoreLocation, UserRecord,
};

async fn inspect(path: &Path) -> SqliteConnection {
    SqliteConnection::connect(&format!("sqlite:{}", path.display()))
        .await
        .unwrap()
}

async fn v1_store(path: &Path) {
    let mut conn = StoreLocation::from(path).connect().await.unwrap();
    sqlx::raw_sql(SCHEMA_V1).execute(&mut conn).await.unwrap();
    sqlx::raw_sql(
        r#"
        INSERT INTO Users (user_id, chip_id) VALUES (1, 1111);
        INSERT INTO Actions (user_id, timestamp, action_kind) VALUES (1, 1500000000.0, 1);
        "#,
    )
    .execute(&mut conn)
    .await
    .unwrap();
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_last_write_wins() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.sqlite3");
    let storage = Storage::init(path.clone());
    storage.write(ChipRegistration::new(10, 1));
    storage.write(EmailRegistration::new(10, "old@example.com"));
    storage.write(ChipRegistration::new(10, 2));
    storage.write(EmailRegistration::new(10, "new@example.com"));

    assert_eq!(
        storage.read_user(10).await.unwrap(),
        Some(ChipRegistration::new(10, 2))
    );
    storage.terminate().join().await.unwrap();

    let mut conn = inspect(&path).await;
    let users = UserRecord::load_all(&mut conn).await.unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].chip_id, 2);
    assert_eq!(users[0].email.as_deref(), Some("new@example.com"));
}

#[tokio::test]
async fn test_chip_upsert_leaves_one_row() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.sqlite3");
    let storage = Storage::init(path.clone());
    storage.write(ChipRegistration::new(3, 1000));
    storage.write(ChipRegistration::new(3, 2000));
    storage.terminate().join().await.unwrap();

    let mut conn = inspect(&path).await;
    let users = UserRecord::load_all(&mut conn).await.unwrap();
    assert_eq!(
        users,
        vec![UserRecord {
            user_id: 3,
            chip_id: 2000,
            email: None,
        }]
    );
}

#[tokio::test]
async fn test_absent_user_reads_none() {
    let storage = Storage::init(StoreLocation::Memory);
    storage.ready().await.unwrap();
    assert_eq!(storage.read_user(404).await.unwrap(), None);
    assert_eq!(storage.pending_reads(), 0);
}

#[tokio::test]
async fn test_concurrent_reads_from_one_caller() {
    let storage = Storage::init(StoreLocation::Memory);
    storage.write(ChipRegistration::new(1, 11));
    storage.write(ChipRegistration::new(2, 22));

    let (a, b, missing) = tokio::join!(
        storage.read_user(1),
        storage.read_user(2),
        storage.read_user(3)
    );
    assert_eq!(a.unwrap(), Some(ChipRegistration::new(1, 11)));
    assert_eq!(b.unwrap(), Some(ChipRegistration::new(2, 22)));
    assert_eq!(missing.unwrap(), None);
}

#[tokio::test]
async fn test_termination_drains_all_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.sqlite3");
    let storage = Storage::init(path.clone());

    const N: i64 = 200;
    for i in 0..N {
        storage.write(LoggedAction::new(
            i % 7,
            DateTime::from_timestamp(1_700_000_000 + i, 0).unwrap(),
            ActionKind::Sport,
        ));
    }
    let termination = storage.terminate();
    termination.join().await.unwrap();
    assert_eq!(storage.status(), ActorStatus::Stopped);

    let mut conn = inspect(&path).await;
    let actions = LoggedAction::load_all(&mut conn).await.unwrap();
    assert_eq!(actions.len() as i64, N);
    assert_eq!(actions[0].user_id, 0);
    assert_eq!(actions[N as usize - 1].timestamp.timestamp(), 1_700_000_000 + N - 1);
}

#[tokio::test]
async fn test_action_roundtrip_through_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.sqlite3");
    let storage = Storage::init(path.clone());

    let when = DateTime::from_timestamp(1_650_000_000, 123_456_000).unwrap();
    let mut action = LoggedAction::new(77, when, ActionKind::Unlisted);
    action.set_description("bike to work").unwrap();
    storage.write(action.clone());
    storage.terminate().join().await.unwrap();

    let mut conn = inspect(&path).await;
    let stored = LoggedAction::load_all(&mut conn).await.unwrap();
    assert_eq!(stored, vec![action]);
}

#[tokio::test]
async fn test_writes_after_termination_are_dropped() {
    let storage = Storage::init(StoreLocation::Memory);
    storage.write(ChipRegistration::new(1, 1));
    storage.terminate().join().await.unwrap();

    // Must neither panic nor hang.
    storage.write(ChipRegistration::new(2, 2));
    assert!(matches!(
        storage.read_user(1).await,
        Err(StorageError::ActorClosed)
    ));
    assert_eq!(storage.pending_reads(), 0);
}

#[tokio::test]
async fn test_terminate_twice() {
    let storage = Storage::init(StoreLocation::Memory);
    let first = storage.terminate();
    let second = storage.terminate();
    second.join().await.unwrap();
    first.join().await.unwrap();
}

#[tokio::test]
async fn test_open_migrates_v1_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.sqlite3");
    v1_store(&path).await;

    let storage = Storage::init(path.clone());
    storage.ready().await.unwrap();
    assert_eq!(
        storage.read_user(1).await.unwrap(),
        Some(ChipRegistration::new(1, 1111))
    );
    let mut action = LoggedAction::now(1, ActionKind::Unlisted);
    action.set_description("after upgrade").unwrap();
    storage.write(action);
    storage.terminate().join().await.unwrap();

    let mut conn = inspect(&path).await;
    assert_eq!(migration::read_version(&mut conn).await.unwrap(), LATEST_VERSION);
    let actions = LoggedAction::load_all(&mut conn).await.unwrap();
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[0].kind, ActionKind::FoodCarb);
    assert_eq!(actions[0].description(), None);
    assert_eq!(actions[1].description(), Some("after upgrade"));
}

#[tokio::test]
async fn test_failed_migration_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.sqlite3");
    {
        let mut conn = StoreLocation::from(path.as_path()).connect().await.unwrap();
        migration::install_latest(&mut conn).await.unwrap();
        sqlx::query("UPDATE SchemaVersion SET version_number = ?")
            .bind(LATEST_VERSION + 5)
            .execute(&mut conn)
            .await
            .unwrap();
        conn.close().await.unwrap();
    }

    let storage = Storage::init(path.clone());
    storage.write(ChipRegistration::new(1, 1));
    let err = storage.ready().await.unwrap_err();
    assert!(matches!(err, StorageError::ActorFailed(_)));
    assert!(matches!(storage.status(), ActorStatus::Failed(_)));
    assert!(matches!(
        storage.read_user(1).await,
        Err(StorageError::ActorClosed)
    ));
    assert!(storage.terminate().join().await.is_err());

    // Nothing was applied to the newer store.
    let mut conn = inspect(&path).await;
    assert!(UserRecord::load_all(&mut conn).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_upgrade_step_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.sqlite3");
    v1_store(&path).await;
    {
        // An empty version table still reads as version 1, but the upgrade
        // step cannot create it again.
        let mut conn = inspect(&path).await;
        sqlx::query("CREATE TABLE SchemaVersion (version_number INTEGER NOT NULL)")
            .execute(&mut conn)
            .await
            .unwrap();
        conn.close().await.unwrap();
    }

    let storage = Storage::init(path.clone());
    storage.write(ChipRegistration::new(2, 2222));
    let err = storage.ready().await.unwrap_err();
    assert!(matches!(err, StorageError::ActorFailed(_)));
    assert!(matches!(
        storage.terminate().join().await,
        Err(StorageError::Migration { from_version: 1, .. })
    ));

    let mut conn = inspect(&path).await;
    assert_eq!(migration::read_version(&mut conn).await.unwrap(), 1);
    let columns: Vec<(String,)> = sqlx::query_as("SELECT name FROM pragma_table_info('Actions')")
        .fetch_all(&mut conn)
        .await
        .unwrap();
    assert!(columns.iter().all(|(name,)| name != "description"));
    let users: Vec<(i64, i64)> = sqlx::query_as("SELECT user_id, chip_id FROM Users")
        .fetch_all(&mut conn)
        .await
        .unwrap();
    assert_eq!(users, vec![(1, 1111)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_read_from_plain_thread() {
    let storage = Storage::init(StoreLocation::Memory);
    storage.write(ChipRegistration::new(8, 88));

    let reader = storage.clone();
    let found = tokio::task::spawn_blocking(move || reader.read_user_blocking(8))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found, Some(ChipRegistration::new(8, 88)));
    storage.terminate().join().await.unwrap();
}

#[tokio::test]
async fn test_export_snapshot_after_join() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.sqlite3");
    let storage = Storage::init(path.clone());
    storage.write(ChipRegistration::new(1, 4321));
    storage.write(EmailRegistration::new(1, "one@example.com"));
    storage.write(LoggedAction::new(
        1,
        DateTime::from_timestamp(1_600_000_000, 0).unwrap(),
        ActionKind::Alcohol,
    ));
    storage.terminate().join().await.unwrap();

    let rows = export::snapshot(&path).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].to_line("\t"),
        "2020/09/13 12:26:40\talcohol\tone@example.com\t4321\t1\t"
    );
}

#[tokio::test]
async fn test_export_rejects_unmigrated_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.sqlite3");
    v1_store(&path).await;

    let err = export::snapshot(&path).await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::OutdatedSchema { stored: 1, .. }
    ));
}
