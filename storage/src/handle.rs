use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::actor::run_storage_actor;
use crate::commands::{ActorStatus, ReadResult, StorageCommand};
use crate::config::StoreLocation;
use crate::correlation::CorrelationTable;
use crate::error::StorageError;
use crate::records::{ChipRegistration, UserId, WriteCommand};

/// Cheap, cloneable handle to the storage actor.
///
/// Construct it once with [`Storage::init`] and hand clones to every
/// collaborator. All clones talk to the same actor, which is the only owner
/// of the store connection.
#[derive(Clone)]
pub struct Storage {
    cmd_tx: mpsc::UnboundedSender<StorageCommand>,
    results: Arc<CorrelationTable<ReadResult>>,
    shared: Arc<Shared>,
}

struct Shared {
    terminate_tx: watch::Sender<bool>,
    status_rx: watch::Receiver<ActorStatus>,
    task: Mutex<Option<JoinHandle<Result<(), StorageError>>>>,
}

impl Storage {
    /// Spawn the storage actor on the current Tokio runtime.
    ///
    /// Returns as soon as the actor task is launched. Opening the store and
    /// migrating it happen inside the actor; await [`Storage::ready`] to learn
    /// how that went. Commands submitted earlier wait in the mailbox.
    pub fn init(location: impl Into<StoreLocation>) -> Self {
        let location = location.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (terminate_tx, terminate_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(ActorStatus::Starting);
        let results = Arc::new(CorrelationTable::new());

        tracing::info!(location = %location, "Spawning storage actor");
        let task = tokio::spawn(run_storage_actor(
            location,
            cmd_rx,
            terminate_rx,
            results.clone(),
            status_tx,
        ));

        Self {
            cmd_tx,
            results,
            shared: Arc::new(Shared {
                terminate_tx,
                status_rx,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    /// Wait until the store is open and migrated.
    pub async fn ready(&self) -> Result<(), StorageError> {
        let mut status_rx = self.shared.status_rx.clone();
        let status = status_rx
            .wait_for(|s| *s != ActorStatus::Starting)
            .await
            .map_err(|_| StorageError::ActorClosed)?;
        match &*status {
            ActorStatus::Failed(msg) => Err(StorageError::ActorFailed(msg.clone())),
            _ => Ok(()),
        }
    }

    pub fn status(&self) -> ActorStatus {
        self.shared.status_rx.borrow().clone()
    }

    /// Queue a write. Fire-and-forget: failures are only logged by the actor.
    pub fn write(&self, record: impl Into<WriteCommand>) {
        let record = record.into();
        let (user_id, kind) = (record.user_id(), record.label());
        if self.cmd_tx.send(StorageCommand::Write(record)).is_err() {
            tracing::warn!(user_id, kind, "Storage actor has exited, write dropped");
        }
    }

    /// Look up a user's chip registration.
    ///
    /// Resolves after every command submitted before it has been applied.
    /// `Ok(None)` means the user is not registered.
    pub async fn read_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<ChipRegistration>, StorageError> {
        let rx = self.submit_read(user_id)?;
        let result = rx.await.map_err(|_| StorageError::ActorClosed)?;
        tracing::debug!(user_id, "Read user");
        result
    }

    /// Same as [`Storage::read_user`] for callers on plain threads.
    ///
    /// Panics if called from within an async execution context.
    pub fn read_user_blocking(
        &self,
        user_id: UserId,
    ) -> Result<Option<ChipRegistration>, StorageError> {
        let rx = self.submit_read(user_id)?;
        let result = rx.blocking_recv().map_err(|_| StorageError::ActorClosed)?;
        tracing::debug!(user_id, "Read user");
        result
    }

    fn submit_read(
        &self,
        user_id: UserId,
    ) -> Result<oneshot::Receiver<ReadResult>, StorageError> {
        let (request_id, rx) = self.results.register();
        if self
            .cmd_tx
            .send(StorageCommand::ReadUser {
                request_id,
                user_id,
            })
            .is_err()
        {
            self.results.cancel(request_id);
            return Err(StorageError::ActorClosed);
        }
        Ok(rx)
    }

    /// Ask the actor to stop once its mailbox is drained.
    ///
    /// Writes queued before this call are still applied. Await
    /// [`Termination::join`] before exiting the process so the final flush
    /// happens. Calling it again is harmless.
    pub fn terminate(&self) -> Termination {
        self.shared.terminate_tx.send_replace(true);
        tracing::info!("Storage termination requested");
        Termination {
            task: self.shared.task.lock().take(),
            status_rx: self.shared.status_rx.clone(),
        }
    }

    /// Reads still waiting for the actor.
    pub fn pending_reads(&self) -> usize {
        self.results.pending()
    }
}

/// Join handle returned by [`Storage::terminate`].
pub struct Termination {
    task: Option<JoinHandle<Result<(), StorageError>>>,
    status_rx: watch::Receiver<ActorStatus>,
}

impl Termination {
    /// Wait for the actor to drain, flush and exit.
    pub async fn join(self) -> Result<(), StorageError> {
        if let Some(task) = self.task {
            return task
                .await
                .map_err(|e| StorageError::ActorJoin(e.to_string()))?;
        }

        // Another caller owns the task handle; follow the status instead.
        let mut status_rx = self.status_rx;
        let status = status_rx
            .wait_for(ActorStatus::is_finished)
            .await
            .map_err(|_| StorageError::ActorClosed)?;
        match &*status {
            ActorStatus::Failed(msg) => Err(StorageError::ActorFailed(msg.clone())),
            _ => Ok(()),
        }
    }
}
