//! Serialized single-writer storage for chipbot.
//!
//! ## Architecture
//!
//! One actor task owns the only connection to the SQLite store. Everything
//! else talks to it through a cloneable [`Storage`] handle:
//!
//! - **Writes** ([`Storage::write`]) are queued and forgotten. The actor
//!   applies each one in its own transaction and commits it immediately;
//!   failures are logged and the write is lost.
//! - **Reads** ([`Storage::read_user`]) are queued behind every earlier
//!   command, so a read always observes the writes submitted before it. The
//!   result comes back through the [`CorrelationTable`].
//! - **Startup** opens (or creates) the store and brings its schema to
//!   [`LATEST_VERSION`] before the mailbox is served. See [`migration`].
//! - **Shutdown** ([`Storage::terminate`]) lets the mailbox drain, flushes
//!   the write-ahead log and closes the connection. Join the returned
//!   [`Termination`] before the process exits.
//!
//! ## Persisted layout
//!
//! | Table | Columns |
//! |-------|---------|
//! | `Users` | `user_id` (PK), `chip_id`, `email` |
//! | `Actions` | `id` (autoincrement PK), `user_id`, `timestamp` (epoch seconds, `REAL`), `action_kind` (integer code), `description` |
//! | `SchemaVersion` | `version_number` (single row) |
//!
//! [`export`] reads this layout directly for reporting.

mod actor;
mod commands;
mod config;
mod correlation;
mod error;
mod handle;
#[cfg(test)]
mod integration_tests;

pub mod export;
pub mod migration;
pub mod records;

pub use commands::ActorStatus;
pub use config::StoreLocation;
pub use correlation::{CorrelationTable, RequestId};
pub use error::{RecordError, StorageError};
pub use handle::{Storage, Termination};
pub use migration::LATEST_VERSION;
pub use records::{
    ActionKind, ChipId, ChipRegistration, EmailRegistration, LoggedAction, UserId, UserRecord,
    WriteCommand,
};
