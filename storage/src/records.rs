//! Persistable record types and the closed set of write commands.
//!
//! Each record knows how to apply itself to an open connection. None of them
//! commit: the storage actor wraps every `apply` in its own transaction and
//! commits it, so a failed write never leaves partial state behind.

use std::fmt;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::error::{RecordError, StorageError};

/// Chat-platform user identifier, the primary key of `Users`.
pub type UserId = i64;

/// Identifier of a registered chip, drawn from an external allow-list.
pub type ChipId = i64;

/// The kinds of actions a user can log. Stored as an integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    FoodCarb,
    FoodOther,
    Sport,
    Caffeine,
    Nicotine,
    Alcohol,
    Unlisted,
}

impl ActionKind {
    pub const ALL: [ActionKind; 7] = [
        ActionKind::FoodCarb,
        ActionKind::FoodOther,
        ActionKind::Sport,
        ActionKind::Caffeine,
        ActionKind::Nicotine,
        ActionKind::Alcohol,
        ActionKind::Unlisted,
    ];

    /// Integer code persisted in `Actions.action_kind`.
    pub fn code(self) -> i64 {
        match self {
            ActionKind::FoodCarb => 1,
            ActionKind::FoodOther => 2,
            ActionKind::Sport => 3,
            ActionKind::Caffeine => 4,
            ActionKind::Nicotine => 5,
            ActionKind::Alcohol => 6,
            ActionKind::Unlisted => 7,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, RecordError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.code() == code)
            .ok_or(RecordError::UnknownActionKind(code))
    }

    pub fn name(self) -> &'static str {
        match self {
            ActionKind::FoodCarb => "food_carb",
            ActionKind::FoodOther => "food_other",
            ActionKind::Sport => "sport",
            ActionKind::Caffeine => "caffeine",
            ActionKind::Nicotine => "nicotine",
            ActionKind::Alcohol => "alcohol",
            ActionKind::Unlisted => "unlisted",
        }
    }

    /// Only unlisted actions carry a free-text description.
    pub fn takes_description(self) -> bool {
        self == ActionKind::Unlisted
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── ChipRegistration ───────────────────────────────────────────────────

/// A user's chip. At most one per user; a later registration replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipRegistration {
    pub user_id: UserId,
    pub chip_id: ChipId,
}

impl ChipRegistration {
    pub fn new(user_id: UserId, chip_id: ChipId) -> Self {
        Self { user_id, chip_id }
    }

    /// Upsert: try the insert first and fall back to an update when the
    /// primary key already exists.
    pub(crate) async fn apply(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        let inserted = sqlx::query("INSERT INTO Users (user_id, chip_id) VALUES (?, ?)")
            .bind(self.user_id)
            .bind(self.chip_id)
            .execute(&mut *conn)
            .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                tracing::debug!(user_id = self.user_id, "User exists, updating chip");
                sqlx::query("UPDATE Users SET chip_id = ? WHERE user_id = ?")
                    .bind(self.chip_id)
                    .bind(self.user_id)
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Returns `None` if the user has no row.
    pub(crate) async fn lookup(
        conn: &mut SqliteConnection,
        user_id: UserId,
    ) -> Result<Option<Self>, sqlx::Error> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT user_id, chip_id FROM Users WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&mut *conn)
                .await?;

        Ok(row.map(|(user_id, chip_id)| Self { user_id, chip_id }))
    }
}

// ── EmailRegistration ──────────────────────────────────────────────────

/// Sets the email of an already registered user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailRegistration {
    pub user_id: UserId,
    pub email: String,
}

impl EmailRegistration {
    pub fn new(user_id: UserId, email: impl Into<String>) -> Self {
        Self {
            user_id,
            email: email.into(),
        }
    }

    /// Never creates a user row. Updating an unknown user is a no-op.
    pub(crate) async fn apply(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        let result = sqlx::query("UPDATE Users SET email = ? WHERE user_id = ?")
            .bind(&self.email)
            .bind(self.user_id)
            .execute(&mut *conn)
            .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                user_id = self.user_id,
                "Email update for unregistered user ignored"
            );
        }
        Ok(())
    }
}

// ── LoggedAction ───────────────────────────────────────────────────────

/// An append-only fact: a user did something at some point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedAction {
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub kind: ActionKind,
    description: Option<String>,
}

impl LoggedAction {
    pub fn new(user_id: UserId, timestamp: DateTime<Utc>, kind: ActionKind) -> Self {
        Self {
            user_id,
            timestamp,
            kind,
            description: None,
        }
    }

    pub fn now(user_id: UserId, kind: ActionKind) -> Self {
        Self::new(user_id, Utc::now(), kind)
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Attach the free-text description of an unlisted action. Can be set once.
    pub fn set_description(&mut self, text: impl Into<String>) -> Result<(), RecordError> {
        if !self.kind.takes_description() {
            return Err(RecordError::DescriptionNotAllowed(self.kind));
        }
        if self.description.is_some() {
            return Err(RecordError::DescriptionAlreadySet);
        }
        self.description = Some(text.into());
        Ok(())
    }

    pub(crate) async fn apply(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO Actions (user_id, timestamp, action_kind, description)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(self.user_id)
        .bind(encode_timestamp(&self.timestamp))
        .bind(self.kind.code())
        .bind(self.description.as_deref())
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Read every logged action, oldest first.
    pub async fn load_all(conn: &mut SqliteConnection) -> Result<Vec<Self>, StorageError> {
        let rows: Vec<(i64, f64, i64, Option<String>)> = sqlx::query_as(
            r#"
            SELECT user_id, timestamp, action_kind, description
            FROM Actions
            ORDER BY id
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;

        rows.into_iter()
            .map(|(user_id, timestamp, code, description)| -> Result<Self, StorageError> {
                Ok(Self {
                    user_id,
                    timestamp: decode_timestamp(timestamp)?,
                    kind: ActionKind::from_code(code)?,
                    description,
                })
            })
            .collect()
    }
}

// ── UserRecord ─────────────────────────────────────────────────────────

/// A full `Users` row, used by read-only tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: UserId,
    pub chip_id: ChipId,
    pub email: Option<String>,
}

impl UserRecord {
    pub async fn load_all(conn: &mut SqliteConnection) -> Result<Vec<Self>, StorageError> {
        let rows: Vec<(i64, i64, Option<String>)> =
            sqlx::query_as("SELECT user_id, chip_id, email FROM Users ORDER BY user_id")
                .fetch_all(&mut *conn)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, chip_id, email)| Self {
                user_id,
                chip_id,
                email,
            })
            .collect())
    }
}

// ── WriteCommand ───────────────────────────────────────────────────────

/// Every write the storage actor accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteCommand {
    Chip(ChipRegistration),
    Email(EmailRegistration),
    Action(LoggedAction),
}

impl WriteCommand {
    pub fn user_id(&self) -> UserId {
        match self {
            WriteCommand::Chip(r) => r.user_id,
            WriteCommand::Email(r) => r.user_id,
            WriteCommand::Action(r) => r.user_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            WriteCommand::Chip(_) => "chip",
            WriteCommand::Email(_) => "email",
            WriteCommand::Action(_) => "action",
        }
    }

    pub(crate) async fn apply(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        match self {
            WriteCommand::Chip(r) => r.apply(conn).await,
            WriteCommand::Email(r) => r.apply(conn).await,
            WriteCommand::Action(r) => r.apply(conn).await,
        }
    }
}

impl From<ChipRegistration> for WriteCommand {
    fn from(r: ChipRegistration) -> Self {
        WriteCommand::Chip(r)
    }
}

impl From<EmailRegistration> for WriteCommand {
    fn from(r: EmailRegistration) -> Self {
        WriteCommand::Email(r)
    }
}

impl From<LoggedAction> for WriteCommand {
    fn from(r: LoggedAction) -> Self {
        WriteCommand::Action(r)
    }
}

// ── timestamps ─────────────────────────────────────────────────────────

/// Floating-point epoch seconds with microsecond precision.
pub(crate) fn encode_timestamp(ts: &DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}

pub(crate) fn decode_timestamp(secs: f64) -> Result<DateTime<Utc>, RecordError> {
    if !secs.is_finite() {
        return Err(RecordError::TimestampOutOfRange(secs));
    }
    DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
        .ok_or(RecordError::TimestampOutOfRange(secs))
}
