/// Collapses bursts of change events into single non-forced syncs.
use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    error::{MemoryError, Result},
    sync::SyncReport,
};

/// Something that can be asked to bring its index up to date.
#[async_trait]
pub trait SyncTrigger: Send + Sync {
    async fn trigger_sync(&self) -> Result<SyncReport>;
}

/// Wait for an event, keep absorbing events until `quiet` passes without
/// one, then run one sync. Returns when the channel closes, the token is
/// cancelled, or the target reports it is closed.
pub async fn run_sync_trigger<E: Send>(
    target: Arc<dyn SyncTrigger>,
    mut rx: mpsc::UnboundedReceiver<E>,
    quiet: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => if event.is_none() { break },
        }

        let mut absorbed = 1usize;
        let mut closed = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                next = tokio::time::timeout(quiet, rx.recv()) => match next {
                    Ok(Some(_)) => absorbed += 1,
                    Ok(None) => {
                        closed = true;
                        break;
                    },
                    Err(_) => break,
                },
            }
        }

        debug!(events = absorbed, "change events settled, syncing");
        match target.trigger_sync().await {
            Ok(report) => debug!(indexed = report.indexed, removed = report.removed, "triggered sync done"),
            Err(MemoryError::Closed) => break,
            Err(e) => warn!(error = %e, "triggered sync failed"),
        }
        if closed {
            break;
        }
    }
    debug!("sync trigger stopped");
}
