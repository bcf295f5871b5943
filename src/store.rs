use std::collections::HashSet;
use std::sync::Arc;

use sha1::{Digest, Sha1};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::piece::{PieceBuffer, PieceStatus};
use crate::torrent::Torrent;
use crate::writer::FileWriter;

/// What happened to one received block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Buffered; the piece is still incomplete.
    Buffered,
    /// The block completed its piece and the piece verified and hit disk.
    Verified(usize),
    /// The completed piece failed its hash check and is Missing again.
    HashMismatch(usize),
    /// A persistence failure was latched; the download is shutting down.
    Aborted,
}

/// Result of submitting a fully assembled piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Verified, written, and marked Verified.
    Accepted,
    /// The index was already Verified; the bytes were discarded unwritten.
    Duplicate,
    /// Hash mismatch; the piece stays eligible for re-download.
    Rejected,
    /// The write failed; the error is latched and shutdown signalled.
    Failed,
}

struct Slot {
    status: PieceStatus,
    buffer: PieceBuffer,
}

struct State {
    pieces: Vec<Slot>,
    verified: usize,
    fatal: Option<Error>,
}

/// Single authority over piece completion.
///
/// All piece state lives behind one async mutex; the Missing -> InFlight ->
/// Verified transition for an index is totally ordered by it, so exactly
/// one submission wins per index and duplicate writes cannot happen. The
/// disk write runs while the lock is held, which is what makes acceptance
/// and persistence one atomic step from every session's point of view.
pub struct PieceStore {
    torrent: Arc<Torrent>,
    writer: FileWriter,
    state: Mutex<State>,
    done_tx: watch::Sender<bool>,
}

impl PieceStore {
    pub fn new(torrent: Arc<Torrent>, writer: FileWriter) -> Self {
        let num_pieces = writer.layout().num_pieces();
        let pieces = (0..num_pieces)
            .map(|_| Slot {
                status: PieceStatus::Missing,
                buffer: PieceBuffer::default(),
            })
            .collect();
        let (done_tx, _) = watch::channel(false);
        Self {
            torrent,
            writer,
            state: Mutex::new(State {
                pieces,
                verified: 0,
                fatal: None,
            }),
            done_tx,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.writer.layout().num_pieces()
    }

    pub fn piece_size(&self, index: usize) -> usize {
        self.writer.layout().piece_size(index)
    }

    /// A receiver that flips to `true` when the download finishes, whether
    /// by completion or by a latched fatal error.
    pub fn subscribe_done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    /// Claims the first Missing piece the peer advertises, marking it
    /// InFlight so no other session downloads it concurrently.
    pub async fn claim(&self, available: &HashSet<usize>) -> Option<usize> {
        let mut state = self.state.lock().await;
        if state.fatal.is_some() {
            return None;
        }
        for index in 0..state.pieces.len() {
            if state.pieces[index].status == PieceStatus::Missing && available.contains(&index) {
                state.pieces[index].status = PieceStatus::InFlight;
                return Some(index);
            }
        }
        None
    }

    /// Returns a claimed piece to Missing, dropping any buffered blocks.
    /// Verified pieces never regress.
    pub async fn release(&self, index: usize) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.pieces.get_mut(index) {
            if slot.status == PieceStatus::InFlight {
                slot.status = PieceStatus::Missing;
                slot.buffer.clear();
            }
        }
    }

    /// Routes one received block into its piece buffer; when the buffer
    /// reaches the piece's expected size the piece is assembled, verified,
    /// and written.
    ///
    /// Errors are protocol violations attributable to the delivering peer
    /// (bogus index, block past the piece end, misaligned reassembly) and
    /// should end that session; everything else comes back as an outcome.
    pub async fn store_block(&self, index: usize, begin: u32, data: Vec<u8>) -> Result<BlockOutcome> {
        let expected = {
            if index >= self.num_pieces() {
                return Err(Error::PeerProtocol(format!("piece index {index} out of range")));
            }
            self.piece_size(index)
        };
        if begin as usize + data.len() > expected {
            return Err(Error::PeerProtocol(format!(
                "block at {begin}+{} overruns piece {index} of {expected} bytes",
                data.len()
            )));
        }

        let mut state = self.state.lock().await;
        if state.fatal.is_some() {
            return Ok(BlockOutcome::Aborted);
        }
        {
            let slot = &mut state.pieces[index];
            if slot.status != PieceStatus::InFlight {
                // Stale delivery for a piece this store no longer tracks
                // (released by a choked session, or already verified).
                return Ok(BlockOutcome::Buffered);
            }
            slot.buffer.insert(begin, data);
            if slot.buffer.received() < expected {
                return Ok(BlockOutcome::Buffered);
            }
        }

        let buffer = std::mem::take(&mut state.pieces[index].buffer);
        let Some(bytes) = buffer.assemble(expected) else {
            state.pieces[index].status = PieceStatus::Missing;
            return Err(Error::PeerProtocol(format!(
                "piece {index} reassembled with gaps"
            )));
        };

        let outcome = match self.commit(&mut state, index, bytes).await {
            Submission::Accepted | Submission::Duplicate => BlockOutcome::Verified(index),
            Submission::Rejected => BlockOutcome::HashMismatch(index),
            Submission::Failed => BlockOutcome::Aborted,
        };
        Ok(outcome)
    }

    /// Verifies and persists a fully assembled piece.
    ///
    /// Idempotent per index: a resubmission for an already-Verified piece
    /// is discarded without touching the disk.
    pub async fn submit_piece(&self, index: usize, bytes: Vec<u8>) -> Result<Submission> {
        if index >= self.num_pieces() {
            return Err(Error::PeerProtocol(format!("piece index {index} out of range")));
        }
        let mut state = self.state.lock().await;
        Ok(self.commit(&mut state, index, bytes).await)
    }

    async fn commit(&self, state: &mut State, index: usize, bytes: Vec<u8>) -> Submission {
        if state.pieces[index].status == PieceStatus::Verified {
            debug!(piece = index, "duplicate submission discarded");
            return Submission::Duplicate;
        }

        let digest = Sha1::digest(&bytes);
        let expected = self.torrent.piece_hash(index);
        if digest[..] != expected[..] {
            state.pieces[index].status = PieceStatus::Missing;
            state.pieces[index].buffer.clear();
            warn!(piece = index, "hash mismatch, piece discarded");
            return Submission::Rejected;
        }

        match self.writer.write_piece(index, &bytes).await {
            Ok(()) => {
                state.pieces[index].status = PieceStatus::Verified;
                state.verified += 1;
                debug!(piece = index, verified = state.verified, total = state.pieces.len(), "piece verified");
                if state.verified == state.pieces.len() {
                    info!("all pieces verified");
                    let _ = self.done_tx.send(true);
                }
                Submission::Accepted
            }
            Err(e) => {
                error!(error = %e, "persistence failure, aborting download");
                state.fatal = Some(e);
                let _ = self.done_tx.send(true);
                Submission::Failed
            }
        }
    }

    pub async fn is_complete(&self) -> bool {
        let state = self.state.lock().await;
        state.verified == state.pieces.len()
    }

    pub async fn verified_count(&self) -> usize {
        self.state.lock().await.verified
    }

    /// Indices that never reached Verified, in order.
    pub async fn missing_indices(&self) -> Vec<usize> {
        let state = self.state.lock().await;
        state
            .pieces
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.status != PieceStatus::Verified)
            .map(|(index, _)| index)
            .collect()
    }

    /// Takes the latched fatal error, if a write ever failed.
    pub async fn take_fatal(&self) -> Option<Error> {
        self.state.lock().await.fatal.take()
    }
}
