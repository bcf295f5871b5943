use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::{HANDSHAKE_LEN, Handshake, Message};
use crate::store::{BlockOutcome, PieceStore};
use crate::torrent::HASH_LEN;

/// Transfer granularity: pieces are requested whole but fetched in blocks
/// of this size to bound per-message latency and memory.
pub const BLOCK_SIZE: usize = 1 << 14;

/// Upper bound on a single frame; anything larger than a block message
/// plus slack for big bitfields is treated as garbage.
const MAX_FRAME_LEN: usize = 1 << 20;

/// A peer address as returned by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

type FrameReader = BufReader<ReadHalf<TcpStream>>;
type FrameWriter = BufWriter<WriteHalf<TcpStream>>;

/// One network conversation with one peer: handshake, message loop,
/// availability tracking, and block requests.
///
/// The session holds only the narrow capabilities it needs — the shared
/// [`PieceStore`] and the shutdown signal derived from it. Nothing holds a
/// reference back to the session; its errors are returned as outcome data
/// and never propagate to sibling sessions.
pub struct PeerSession {
    peer: Peer,
    store: Arc<PieceStore>,
    shutdown: watch::Receiver<bool>,
    connect_timeout: Duration,
    read_timeout: Duration,
    max_outstanding: usize,
    choked: bool,
    available: HashSet<usize>,
    outstanding: HashSet<usize>,
}

impl PeerSession {
    pub fn new(peer: Peer, store: Arc<PieceStore>, config: &Config) -> Self {
        let shutdown = store.subscribe_done();
        Self {
            peer,
            store,
            shutdown,
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            max_outstanding: config.max_outstanding_requests,
            choked: true,
            available: HashSet::new(),
            outstanding: HashSet::new(),
        }
    }

    /// Runs the session until global completion, peer close, or error.
    /// Pieces claimed by this session are always released on the way out.
    pub async fn run(mut self, info_hash: [u8; HASH_LEN], peer_id: [u8; HASH_LEN]) -> Result<()> {
        let result = self.drive(info_hash, peer_id).await;
        self.abandon().await;
        if let Err(e) = &result {
            debug!(peer = %self.peer, error = %e, "session ended with error");
        }
        result
    }

    async fn drive(&mut self, info_hash: [u8; HASH_LEN], peer_id: [u8; HASH_LEN]) -> Result<()> {
        let stream = match timeout(
            self.connect_timeout,
            TcpStream::connect((self.peer.ip, self.peer.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::PeerIo(e)),
            Err(_) => return Err(Error::PeerConnectTimeout),
        };
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        self.handshake(&mut reader, &mut writer, info_hash, peer_id)
            .await?;
        debug!(peer = %self.peer, "handshake complete");

        writer.write_all(&Message::Interested.encode()).await?;
        writer.flush().await?;

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let frame = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                frame = timeout(self.read_timeout, read_frame(&mut reader)) => match frame {
                    Ok(Ok(Some(msg))) => msg,
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        return Err(Error::PeerIo(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "read deadline exceeded",
                        )));
                    }
                },
            };
            self.handle(frame, &mut writer).await?;
        }
        Ok(())
    }

    async fn handshake(
        &mut self,
        reader: &mut FrameReader,
        writer: &mut FrameWriter,
        info_hash: [u8; HASH_LEN],
        peer_id: [u8; HASH_LEN],
    ) -> Result<()> {
        writer
            .write_all(&Handshake::new(info_hash, peer_id).encode())
            .await?;
        writer.flush().await?;

        let mut reply = [0u8; HANDSHAKE_LEN];
        reader.read_exact(&mut reply).await?;
        let reply = Handshake::decode(&reply)?;
        if reply.info_hash != info_hash {
            return Err(Error::PeerProtocol(
                "handshake answered for a different torrent".into(),
            ));
        }
        Ok(())
    }

    async fn handle(&mut self, msg: Message, writer: &mut FrameWriter) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                trace!(peer = %self.peer, "keep-alive");
            }
            Message::Choke => {
                debug!(peer = %self.peer, "choked");
                self.choked = true;
                self.abandon().await;
            }
            Message::Unchoke => {
                debug!(peer = %self.peer, "unchoked");
                self.choked = false;
                self.fill_requests(writer).await?;
            }
            Message::Have(index) => {
                self.available.insert(index as usize);
                if !self.choked {
                    self.fill_requests(writer).await?;
                }
            }
            Message::Bitfield(bits) => {
                merge_bitfield(&mut self.available, &bits, self.store.num_pieces());
                debug!(peer = %self.peer, available = self.available.len(), "bitfield received");
                if !self.choked {
                    self.fill_requests(writer).await?;
                }
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                match self.store.store_block(index as usize, begin, block).await? {
                    BlockOutcome::Buffered => {}
                    BlockOutcome::Verified(piece) => {
                        self.outstanding.remove(&piece);
                        if !self.choked {
                            self.fill_requests(writer).await?;
                        }
                    }
                    BlockOutcome::HashMismatch(piece) => {
                        warn!(peer = %self.peer, piece, "piece rejected, will be retried");
                        self.outstanding.remove(&piece);
                        if !self.choked {
                            self.fill_requests(writer).await?;
                        }
                    }
                    BlockOutcome::Aborted => {
                        // The shutdown signal ends the loop on the next turn.
                    }
                }
            }
            Message::Interested
            | Message::NotInterested
            | Message::Request { .. }
            | Message::Cancel { .. } => {
                // We never serve data, so upload-side traffic is ignored.
                trace!(peer = %self.peer, ?msg, "ignored");
            }
        }
        Ok(())
    }

    /// Claims eligible pieces up to the outstanding ceiling and requests
    /// each claimed piece as a run of block-sized requests.
    async fn fill_requests(&mut self, writer: &mut FrameWriter) -> Result<()> {
        while self.outstanding.len() < self.max_outstanding {
            let Some(index) = self.store.claim(&self.available).await else {
                break;
            };
            self.outstanding.insert(index);

            let size = self.store.piece_size(index);
            let mut begin = 0usize;
            while begin < size {
                let length = BLOCK_SIZE.min(size - begin);
                let request = Message::Request {
                    index: index as u32,
                    begin: begin as u32,
                    length: length as u32,
                };
                writer.write_all(&request.encode()).await?;
                begin += length;
            }
            trace!(peer = %self.peer, piece = index, bytes = size, "requested");
        }
        writer.flush().await?;
        Ok(())
    }

    /// Gives every claimed piece back to the store.
    async fn abandon(&mut self) {
        for index in std::mem::take(&mut self.outstanding) {
            self.store.release(index).await;
        }
    }
}

/// Reads one length-prefixed frame. `None` means the peer closed the
/// connection cleanly; a zero length is a keep-alive.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::PeerIo(e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(Some(Message::KeepAlive));
    }
    if len > MAX_FRAME_LEN {
        return Err(Error::PeerProtocol(format!("oversized frame: {len} bytes")));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(Error::PeerIo)?;
    Message::decode(body[0], &body[1..]).map(Some)
}

/// Folds a bitfield payload into the availability set. Bit 0 is the high
/// bit of byte 0; trailing bits past the piece count are ignored.
fn merge_bitfield(available: &mut HashSet<usize>, bits: &[u8], num_pieces: usize) {
    for (byte_index, byte) in bits.iter().enumerate() {
        for bit in 0..8 {
            let index = byte_index * 8 + bit;
            if index < num_pieces && byte & (0x80 >> bit) != 0 {
                available.insert(index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitfield_bit_zero_is_high_bit_of_byte_zero() {
        let mut available = HashSet::new();
        merge_bitfield(&mut available, &[0b1010_0000], 8);
        assert_eq!(available, HashSet::from([0, 2]));
    }

    #[test]
    fn bitfield_spans_bytes() {
        let mut available = HashSet::new();
        merge_bitfield(&mut available, &[0b0000_0001, 0b1000_0000], 16);
        assert_eq!(available, HashSet::from([7, 8]));
    }

    #[test]
    fn trailing_bits_past_piece_count_are_ignored() {
        let mut available = HashSet::new();
        merge_bitfield(&mut available, &[0b1111_1111], 3);
        assert_eq!(available, HashSet::from([0, 1, 2]));
    }

    #[test]
    fn merge_accumulates_have_messages() {
        let mut available = HashSet::new();
        merge_bitfield(&mut available, &[0b1000_0000], 8);
        available.insert(5);
        merge_bitfield(&mut available, &[0b0100_0000], 8);
        assert_eq!(available, HashSet::from([0, 1, 5]));
    }
}
