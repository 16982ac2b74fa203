use crate::correlation::RequestId;
use crate::error::StorageError;
use crate::records::{ChipRegistration, UserId, WriteCommand};

/// What a chip read resolves to.
pub(crate) type ReadResult = Result<Option<ChipRegistration>, StorageError>;

/// Mailbox items. Writes carry no reply; reads are answered through the
/// correlation table under their request id.
#[derive(Debug)]
pub(crate) enum StorageCommand {
    Write(WriteCommand),
    ReadUser {
        request_id: RequestId,
        user_id: UserId,
    },
}

/// Lifecycle of the storage actor as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorStatus {
    /// Opening the store and running migrations.
    Starting,
    /// Serving the mailbox.
    Ready,
    /// Drained and closed after `terminate`.
    Stopped,
    /// Startup or the final flush failed.
    Failed(String),
}

impl ActorStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, ActorStatus::Stopped | ActorStatus::Failed(_))
    }
}
