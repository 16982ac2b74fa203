use std::sync::Arc;

use sqlx::{Connection, SqliteConnection};
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

use crate::commands::{ActorStatus, ReadResult, StorageCommand};
use crate::config::StoreLocation;
use crate::correlation::CorrelationTable;
use crate::error::StorageError;
use crate::migration;
use crate::records::{ChipRegistration, WriteCommand};

/// The storage actor loop.
/// Owns the only connection to the store and processes the mailbox in order.
pub(crate) async fn run_storage_actor(
    location: StoreLocation,
    cmd_rx: mpsc::UnboundedReceiver<StorageCommand>,
    terminate_rx: watch::Receiver<bool>,
    results: Arc<CorrelationTable<ReadResult>>,
    status_tx: watch::Sender<ActorStatus>,
) -> Result<(), StorageError> {
    let span = tracing::info_span!("storage", location = %location);
    run_storage_actor_inner(location, cmd_rx, terminate_rx, results, status_tx)
        .instrument(span)
        .await
}

async fn run_storage_actor_inner(
    location: StoreLocation,
    mut cmd_rx: mpsc::UnboundedReceiver<StorageCommand>,
    mut terminate_rx: watch::Receiver<bool>,
    results: Arc<CorrelationTable<ReadResult>>,
    status_tx: watch::Sender<ActorStatus>,
) -> Result<(), StorageError> {
    tracing::info!("Storage actor started");

    let mut conn = match open_store(&location).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!("Storage startup failed: {}", e);
            // Nothing queued so far will ever be served.
            cmd_rx.close();
            results.close();
            status_tx.send_replace(ActorStatus::Failed(e.to_string()));
            return Err(e);
        }
    };
    status_tx.send_replace(ActorStatus::Ready);
    tracing::info!("Storage ready");

    loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => handle_command(&mut conn, cmd, &results).await,
                    None => {
                        tracing::info!("All storage handles dropped");
                        break;
                    }
                }
            }

            changed = terminate_rx.changed() => {
                if changed.is_err() || *terminate_rx.borrow() {
                    break;
                }
            }
        }
    }

    // Refuse new work, then serve whatever was queued before the close.
    cmd_rx.close();
    let mut drained = 0usize;
    while let Some(cmd) = cmd_rx.recv().await {
        handle_command(&mut conn, cmd, &results).await;
        drained += 1;
    }

    let result = flush_and_close(conn).await;
    let abandoned = results.close();
    match &result {
        Ok(()) => {
            status_tx.send_replace(ActorStatus::Stopped);
        }
        Err(e) => {
            tracing::error!("Final flush failed: {}", e);
            status_tx.send_replace(ActorStatus::Failed(e.to_string()));
        }
    }

    tracing::info!(drained, abandoned, "Storage actor terminated");
    result
}

async fn open_store(location: &StoreLocation) -> Result<SqliteConnection, StorageError> {
    let mut conn = location.connect().await?;
    migration::bootstrap(&mut conn).await?;
    Ok(conn)
}

async fn handle_command(
    conn: &mut SqliteConnection,
    cmd: StorageCommand,
    results: &CorrelationTable<ReadResult>,
) {
    match cmd {
        StorageCommand::Write(record) => match commit_write(conn, &record).await {
            Ok(()) => {
                tracing::debug!(
                    user_id = record.user_id(),
                    kind = record.label(),
                    "Committed write"
                );
            }
            Err(e) => {
                tracing::error!(
                    user_id = record.user_id(),
                    kind = record.label(),
                    "Write lost: {}",
                    e
                );
            }
        },
        StorageCommand::ReadUser {
            request_id,
            user_id,
        } => {
            let result = ChipRegistration::lookup(conn, user_id)
                .await
                .map_err(StorageError::from);
            if let Err(ref e) = result {
                tracing::error!(user_id, "Read failed: {}", e);
            }
            if !results.publish(request_id, result) {
                tracing::debug!(request_id, user_id, "Reader gone, result discarded");
            }
        }
    }
}

/// One transaction per write. An error drops the transaction, rolling it back.
async fn commit_write(
    conn: &mut SqliteConnection,
    record: &WriteCommand,
) -> Result<(), sqlx::Error> {
    let mut tx = conn.begin().await?;
    record.apply(&mut tx).await?;
    tx.commit().await
}

/// Fold the write-ahead log back into the main file so external readers see
/// everything once the actor is joined.
async fn flush_and_close(mut conn: SqliteConnection) -> Result<(), StorageError> {
    sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
        .execute(&mut conn)
        .await?;
    conn.close().await?;
    Ok(())
}
