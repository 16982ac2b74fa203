//! Read-only export of the persisted tables as tab-separated text.
//!
//! Opens its own read-only connection, so it should run against a store whose
//! actor has been terminated and joined (or against a copy of the file).

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::Connection;

use crate::config::connect_read_only;
use crate::error::StorageError;
use crate::migration::{self, LATEST_VERSION};
use crate::records::{ActionKind, ChipId, LoggedAction, UserId, UserRecord};

pub const DATETIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

const COLUMNS: [&str; 6] = ["time", "action", "email", "chip_id", "tg_id", "description"];

/// One logged action joined with its user's registration.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRow {
    pub time: DateTime<Utc>,
    pub action: ActionKind,
    pub email: Option<String>,
    pub chip_id: Option<ChipId>,
    pub user_id: UserId,
    pub description: Option<String>,
}

impl ExportRow {
    pub fn header(sep: &str) -> String {
        COLUMNS.join(sep)
    }

    pub fn to_line(&self, sep: &str) -> String {
        [
            self.time.format(DATETIME_FORMAT).to_string(),
            self.action.name().to_string(),
            self.email.clone().unwrap_or_default(),
            self.chip_id.map(|c| c.to_string()).unwrap_or_default(),
            self.user_id.to_string(),
            self.description.clone().unwrap_or_default(),
        ]
        .join(sep)
    }
}

/// Join actions with users, keeping action order.
pub fn join_rows(actions: Vec<LoggedAction>, users: &[UserRecord]) -> Vec<ExportRow> {
    let by_id: HashMap<UserId, &UserRecord> = users.iter().map(|u| (u.user_id, u)).collect();

    actions
        .into_iter()
        .map(|action| {
            let user = by_id.get(&action.user_id);
            if user.is_none() {
                tracing::warn!(user_id = action.user_id, "Action without registered user");
            }
            ExportRow {
                time: action.timestamp,
                action: action.kind,
                email: user.and_then(|u| u.email.clone()),
                chip_id: user.map(|u| u.chip_id),
                user_id: action.user_id,
                description: action.description().map(str::to_string),
            }
        })
        .collect()
}

/// Read every action from the store at `path`.
pub async fn snapshot(path: &Path) -> Result<Vec<ExportRow>, StorageError> {
    let mut conn = connect_read_only(path).await?;

    let stored = migration::read_version(&mut conn).await?;
    if stored < LATEST_VERSION {
        return Err(StorageError::OutdatedSchema {
            stored,
            latest: LATEST_VERSION,
        });
    }
    if stored > LATEST_VERSION {
        return Err(StorageError::UnsupportedVersion {
            stored,
            latest: LATEST_VERSION,
        });
    }

    let users = UserRecord::load_all(&mut conn).await?;
    let actions = LoggedAction::load_all(&mut conn).await?;
    conn.close().await?;

    tracing::info!(users = users.len(), actions = actions.len(), "Loaded snapshot");
    Ok(join_rows(actions, &users))
}

/// Write a header line and one line per row.
pub fn write_tsv<W: Write>(rows: &[ExportRow], out: &mut W) -> io::Result<()> {
    writeln!(out, "{}", ExportRow::header("\t"))?;
    for row in rows {
        writeln!(out, "{}", row.to_line("\t"))?;
    }
    Ok(())
}
