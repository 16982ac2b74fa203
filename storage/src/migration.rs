//! Schema versioning.
//!
//! The stored version lives in the one-row `SchemaVersion` table. Stores from
//! before that table existed are version 1. Upgraders are listed in
//! [`UPGRADERS`], where entry `i` moves a store from version `i + 1` to
//! `i + 2`. All steps of one migration share a single transaction, so a
//! failing step leaves the store exactly as it was.

use std::path::Path;

use sqlx::{Connection, Executor, SqliteConnection};

use crate::config::connect_read_only;
use crate::error::StorageError;

/// The schema version this build reads and writes.
pub const LATEST_VERSION: i64 = 2;

/// Version assumed when no `SchemaVersion` table exists.
pub const BASE_VERSION: i64 = 1;

/// One schema step, applied as a single multi-statement script.
#[derive(Debug, Clone, Copy)]
pub struct Upgrader {
    pub from_version: i64,
    pub description: &'static str,
    pub script: &'static str,
}

pub const UPGRADERS: &[Upgrader] = &[Upgrader {
    from_version: 1,
    description: "track schema version, add action descriptions",
    script: r#"
        CREATE TABLE SchemaVersion (version_number INTEGER NOT NULL);
        INSERT INTO SchemaVersion (version_number) VALUES (2);
        ALTER TABLE Actions ADD COLUMN description TEXT;
    "#,
}];

const LATEST_SCHEMA: &str = r#"
    CREATE TABLE Users (
        user_id INTEGER NOT NULL PRIMARY KEY,
        chip_id INTEGER NOT NULL,
        email TEXT
    );
    CREATE TABLE Actions (
        id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        timestamp REAL NOT NULL,
        action_kind INTEGER NOT NULL,
        description TEXT
    );
    CREATE TABLE SchemaVersion (version_number INTEGER NOT NULL);
"#;

/// Result of a [`migrate`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub from_version: i64,
    pub to_version: i64,
}

impl MigrationOutcome {
    pub fn is_noop(&self) -> bool {
        self.from_version == self.to_version
    }
}

async fn table_exists(conn: &mut SqliteConnection, name: &str) -> Result<bool, sqlx::Error> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(row.is_some())
}

/// A store without a `Users` table has never been initialized.
pub async fn is_fresh(conn: &mut SqliteConnection) -> Result<bool, sqlx::Error> {
    Ok(!table_exists(conn, "Users").await?)
}

pub async fn read_version(conn: &mut SqliteConnection) -> Result<i64, sqlx::Error> {
    if !table_exists(conn, "SchemaVersion").await? {
        return Ok(BASE_VERSION);
    }

    let row: Option<(i64,)> = sqlx::query_as("SELECT version_number FROM SchemaVersion")
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map_or(BASE_VERSION, |(v,)| v))
}

/// Read the schema version of the store file at `path` over a read-only
/// connection.
pub async fn stored_version(path: &Path) -> Result<i64, StorageError> {
    let mut conn = connect_read_only(path).await?;
    let version = read_version(&mut conn).await?;
    conn.close().await?;
    Ok(version)
}

async fn write_version(conn: &mut SqliteConnection, version: i64) -> Result<(), sqlx::Error> {
    let updated = sqlx::query("UPDATE SchemaVersion SET version_number = ?")
        .bind(version)
        .execute(&mut *conn)
        .await?;

    if updated.rows_affected() == 0 {
        sqlx::query("INSERT INTO SchemaVersion (version_number) VALUES (?)")
            .bind(version)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Create all tables at [`LATEST_VERSION`] in one transaction.
pub async fn install_latest(conn: &mut SqliteConnection) -> Result<(), StorageError> {
    let mut tx = conn.begin().await?;
    (&mut *tx).execute(sqlx::raw_sql(LATEST_SCHEMA)).await?;
    write_version(&mut tx, LATEST_VERSION).await?;
    tx.commit().await?;

    tracing::info!(version = LATEST_VERSION, "Installed schema");
    Ok(())
}

/// Upgrade the store to `target`. Running it on a store that is already at
/// `target` does nothing.
pub async fn migrate(
    conn: &mut SqliteConnection,
    target: i64,
) -> Result<MigrationOutcome, StorageError> {
    migrate_with(conn, UPGRADERS, target).await
}

pub(crate) async fn migrate_with(
    conn: &mut SqliteConnection,
    upgraders: &[Upgrader],
    target: i64,
) -> Result<MigrationOutcome, StorageError> {
    let current = read_version(conn).await?;
    if current > target {
        return Err(StorageError::UnsupportedVersion {
            stored: current,
            latest: target,
        });
    }
    if current == target {
        tracing::debug!(version = current, "Schema up to date");
        return Ok(MigrationOutcome {
            from_version: current,
            to_version: target,
        });
    }

    let mut tx = conn.begin().await?;
    for version in current..target {
        let upgrader = usize::try_from(version - 1)
            .ok()
            .and_then(|i| upgraders.get(i))
            .filter(|u| u.from_version == version)
            .ok_or(StorageError::MissingUpgrader(version))?;

        tracing::info!(
            from = version,
            to = version + 1,
            "Migrating schema: {}",
            upgrader.description
        );
        (&mut *tx)
            .execute(sqlx::raw_sql(upgrader.script))
            .await
            .map_err(|source| StorageError::Migration {
                from_version: version,
                source,
            })?;
    }
    write_version(&mut tx, target).await?;
    tx.commit().await?;

    Ok(MigrationOutcome {
        from_version: current,
        to_version: target,
    })
}

/// Bring a just-opened store to [`LATEST_VERSION`], installing the schema
/// directly when the store is new.
pub(crate) async fn bootstrap(conn: &mut SqliteConnection) -> Result<(), StorageError> {
    if is_fresh(conn).await? {
        return install_latest(conn).await;
    }

    let outcome = migrate(conn, LATEST_VERSION).await?;
    if !outcome.is_noop() {
        tracing::info!(
            from = outcome.from_version,
            to = outcome.to_version,
            "Schema migrated"
        );
    }
    Ok(())
}

/// The schema as it was before versioning, for migration tests.
#[cfg(test)]
pub(crate) const SCHEMA_V1: &str = r#"
    CREATE TABLE Users (
        user_id INTEGER NOT NULL PRIMARY KEY,
        chip_id INTEGER NOT NULL,
        email TEXT
    );
    CREATE TABLE Actions (
        id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        timestamp REAL NOT NULL,
        action_kind INTEGER NOT NULL
    );
"#;
