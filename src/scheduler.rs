//! Drives a torrent download across many peers concurrently.
//!
//! Pieces to fetch are distributed through an `async_channel` MPMC queue so
//! any idle peer worker can pull the next piece; completed (or failed)
//! pieces flow back to this task through an MPSC result channel. One
//! `tokio::task` runs per peer connection.
use crate::peer::session::{PeerSession, PieceResult, PieceTask};
use crate::torrent::file::TorrentFile;
use crate::tracker::Peer;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Number of times a piece may be requeued after a failed attempt before
/// it is given up on entirely.
const MAX_RETRIES: usize = 5;

enum WorkerEvent {
    Completed(PieceResult),
    Failed(PieceTask),
}

/// Errors raised by the scheduler's overall run, as opposed to per-session
/// errors which are handled by requeueing and never escape `download`.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("download stalled: only {completed} of {total} pieces collected (gave up on {failed:?} after exhausting retries)")]
    NoProgress {
        completed: usize,
        total: usize,
        failed: Vec<usize>,
    },
}

/// Result of a fully successful download: every piece, downloaded and
/// verified, in arrival order.
pub struct DownloadOutcome {
    pub pieces: Vec<PieceResult>,
}

/// Downloads every piece of `torrent`, spreading work across `peers`.
///
/// Returns `Err(SchedulerError::NoProgress)` if the task queue empties (every
/// peer session has failed or exited) before all pieces were collected.
#[instrument(skip(torrent, peers, peer_id), fields(pieces = torrent.num_pieces(), peers = peers.len()))]
pub async fn download(
    torrent: &TorrentFile,
    peers: Vec<Peer>,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
) -> Result<DownloadOutcome, SchedulerError> {
    let (task_tx, task_rx) = async_channel::unbounded::<PieceTask>();
    for index in 0..torrent.num_pieces() {
        let task = PieceTask {
            index,
            length: torrent.piece_size(index) as usize,
            hash: torrent.pieces_hash[index],
        };
        task_tx
            .send(task)
            .await
            .expect("task queue receiver outlives the initial fill while the scheduler holds it");
    }

    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<WorkerEvent>();

    for peer in peers {
        let task_rx = task_rx.clone();
        let task_tx = task_tx.clone();
        let result_tx = result_tx.clone();
        tokio::spawn(async move {
            run_peer_worker(peer, info_hash, peer_id, task_rx, task_tx, result_tx).await;
        });
    }
    drop(result_tx);

    let total = torrent.num_pieces();
    let mut retries: HashMap<usize, usize> = HashMap::new();
    let mut pieces = Vec::with_capacity(total);
    let mut failed = Vec::new();

    while pieces.len() + failed.len() < total {
        let Some(event) = result_rx.recv().await else {
            warn!(
                completed = pieces.len(),
                total, "all peer workers exited before every piece completed"
            );
            break;
        };

        match event {
            WorkerEvent::Completed(result) => {
                info!(piece = result.index, "piece completed");
                pieces.push(result);
            }
            WorkerEvent::Failed(task) => {
                let attempts = retries.entry(task.index).or_insert(0);
                *attempts += 1;
                if *attempts >= MAX_RETRIES {
                    warn!(
                        piece = task.index,
                        attempts = *attempts,
                        "giving up on piece after exceeding retry limit"
                    );
                    failed.push(task.index);
                } else {
                    debug!(piece = task.index, attempts = *attempts, "requeueing piece");
                    if task_tx.send(task).await.is_err() {
                        // Every worker has already exited; nothing left to
                        // serve this retry, so treat it as a final failure.
                        break;
                    }
                }
            }
        }
    }

    // Close the channel so any worker still blocked waiting for the next
    // task wakes up with an error and exits, regardless of how many sender
    // clones individual workers are still holding.
    task_rx.close();

    if pieces.len() < total {
        return Err(SchedulerError::NoProgress {
            completed: pieces.len(),
            total,
            failed,
        });
    }

    Ok(DownloadOutcome { pieces })
}

/// Drives a single peer connection: connects, reads its initial bitfield
/// (if any), then repeatedly pulls a piece task off the shared queue and
/// attempts to download it, reporting the outcome back to the scheduler.
///
/// Peers that never send a bitfield are given exactly one task attempt and
/// then dropped - without piece availability information there is no way to
/// know whether further requests to this peer stand any chance of
/// succeeding, so it is not worth tying up a worker slot on it indefinitely.
#[instrument(skip(info_hash, peer_id, task_rx, task_tx, result_tx), fields(peer = %format!("{}:{}", peer.ip, peer.port)))]
async fn run_peer_worker(
    peer: Peer,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    task_rx: async_channel::Receiver<PieceTask>,
    task_tx: async_channel::Sender<PieceTask>,
    result_tx: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut session = match PeerSession::connect(&peer, info_hash, peer_id).await {
        Ok(session) => session,
        Err(e) => {
            debug!(error = %e, "failed to connect to peer");
            return;
        }
    };

    if let Err(e) = session.read_initial_state().await {
        debug!(error = %e, "failed to read peer's initial state");
        return;
    }

    let has_bitfield = session.bitfield().is_some();

    loop {
        let Ok(task) = task_rx.recv().await else {
            return;
        };

        if let Some(bitfield) = session.bitfield() {
            if !bitfield.has_piece(task.index) {
                // Not a failure: this peer just doesn't have the piece.
                // Put it back for someone else and try the next one.
                let _ = task_tx.send(task).await;
                continue;
            }
        }

        let succeeded = match session.download_piece(&task).await {
            Ok(result) => {
                let _ = result_tx.send(WorkerEvent::Completed(result));
                true
            }
            Err(e) => {
                debug!(piece = task.index, error = %e, "piece download failed");
                let _ = result_tx.send(WorkerEvent::Failed(task));
                false
            }
        };

        // A peer that never announced a bitfield gets exactly one attempt,
        // win or lose, and is then released back to the pool.
        if !has_bitfield {
            return;
        }
        // A failed attempt against a peer we do have availability info for
        // usually means the socket is no longer usable (timeout, peer
        // choked and never unchoked, connection reset) - stop this worker
        // rather than spin requesting from a dead connection.
        if !succeeded {
            return;
        }
    }
}
