//! The background compaction task.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use crate::Index;
use crate::LogStore;

/// The result of a finished compaction, reported back to the core.
#[derive(Debug)]
pub(crate) struct CompactionUpdate {
    /// The index the new snapshot covers.
    pub snapshot_index: Index,
    /// The commit index at which the next compaction becomes worthwhile.
    pub next_compaction_after: Index,
}

/// Spawn the compactor.
///
/// The task idles until the core reports a commit index over the wake
/// channel, then asks the log store to cut a snapshot `compaction_keep_size`
/// entries behind it and truncate the log before that point. The wake
/// channel has capacity one and wakes are sent with `try_send`, so a busy
/// compactor simply coalesces them; slight staleness of the reported commit
/// index is harmless, the next wake catches up.
pub(crate) fn spawn_compactor<L: LogStore>(
    storage: Arc<L>,
    compaction_keep_size: u64,
    mut rx_wake: mpsc::Receiver<Index>,
    tx_update: mpsc::Sender<CompactionUpdate>,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            while let Some(commit_index) = rx_wake.recv().await {
                if commit_index <= compaction_keep_size {
                    continue;
                }
                let upto = commit_index - compaction_keep_size;
                match storage.compact(upto).await {
                    Ok(true) => {
                        let next_compaction_after = match storage.next_compaction_after().await {
                            Ok(next) => next,
                            Err(err) => {
                                tracing::warn!({error=%err}, "could not read next compaction threshold");
                                upto + compaction_keep_size
                            }
                        };
                        let _ = tx_update
                            .send(CompactionUpdate {
                                snapshot_index: upto,
                                next_compaction_after,
                            })
                            .await;
                    }
                    Ok(false) => {
                        tracing::trace!(upto, "compaction had nothing to do");
                    }
                    Err(err) => {
                        tracing::warn!({error=%err, upto}, "compaction did not work");
                    }
                }
            }
        }
        .instrument(tracing::debug_span!("compactor")),
    )
}
