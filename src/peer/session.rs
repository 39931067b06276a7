//! Per-peer connection state machine.
//!
//! Handles one peer from handshake through repeatedly downloading pieces:
//! tracks choke/interested state and the peer's bitfield, and pipelines
//! block requests up to [`MAX_PIPELINED`] in flight at a time rather than
//! waiting for each 16 KiB block round-trip individually.
use crate::peer::bitfield::Bitfield;
use crate::peer::handshake::Handshake;
use crate::peer::message::Message;
use crate::peer::{PeerError, PeerResult};
use crate::tracker::Peer;
use byteorder::{BigEndian, ByteOrder};
use sha1::{Digest, Sha1};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Size of a single requested block, per the BitTorrent convention.
pub const BLOCK_SIZE: u32 = 16 * 1024;
/// Maximum number of block requests kept outstanding at once.
///
/// If fewer than this many blocks remain in the piece, only the remainder
/// is requested - this mirrors the pipelining behavior of sending a batch
/// of requests and draining the matching responses before sending more.
pub const MAX_PIPELINED: usize = 5;
/// Budget for any single read/write on the peer socket.
const OP_TIMEOUT: Duration = Duration::from_secs(30);

/// A single piece this session has been asked to fetch.
#[derive(Debug, Clone)]
pub struct PieceTask {
    pub index: usize,
    pub length: usize,
    pub hash: [u8; 20],
}

/// A piece downloaded and verified against `PieceTask::hash`.
#[derive(Debug)]
pub struct PieceResult {
    pub index: usize,
    pub data: Vec<u8>,
}

/// A live, handshaken connection to a single peer.
pub struct PeerSession {
    stream: TcpStream,
    peer_addr: String,
    peer_choking: bool,
    am_interested: bool,
    peer_bitfield: Option<Bitfield>,
}

impl PeerSession {
    /// Dials `peer`, performs the handshake, and returns a session ready to
    /// request pieces. Starts choked and not interested, per the protocol's
    /// default connection state.
    #[instrument(skip(info_hash, peer_id), fields(peer = %format!("{}:{}", peer.ip, peer.port)))]
    pub async fn connect(peer: &Peer, info_hash: [u8; 20], peer_id: [u8; 20]) -> PeerResult<Self> {
        let addr = format!("{}:{}", peer.ip, peer.port);
        let (stream, _handshake) = Handshake::do_handshake(addr.clone(), info_hash, peer_id)
            .await
            .map_err(|e| PeerError::Handshake(e.to_string()))?;

        Ok(Self {
            stream,
            peer_addr: addr,
            peer_choking: true,
            am_interested: false,
            peer_bitfield: None,
        })
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn bitfield(&self) -> Option<&Bitfield> {
        self.peer_bitfield.as_ref()
    }

    /// Reads messages until the peer's first `bitfield` or `have` message
    /// (or unchoke) arrives, recording availability as it goes. Some peers
    /// send no bitfield at all (they have nothing yet); in that case the
    /// caller is expected to try at most one piece task against this peer
    /// before giving up, per the no-bitfield policy.
    #[instrument(skip(self))]
    pub async fn read_initial_state(&mut self) -> PeerResult<()> {
        loop {
            match self.read_message().await? {
                Message::Bitfield(bits) => {
                    self.peer_bitfield = Some(Bitfield::from_bytes(bits));
                    return Ok(());
                }
                Message::Have(index) => {
                    self.peer_bitfield
                        .get_or_insert_with(|| Bitfield::new(0))
                        .set_piece(index as usize);
                    return Ok(());
                }
                Message::Unchoke => {
                    self.peer_choking = false;
                    return Ok(());
                }
                Message::KeepAlive => continue,
                _ => return Ok(()),
            }
        }
    }

    /// Downloads and SHA-1-verifies a single piece, pipelining block
    /// requests up to `MAX_PIPELINED` at a time.
    #[instrument(skip(self, task), fields(piece = task.index))]
    pub async fn download_piece(&mut self, task: &PieceTask) -> PeerResult<PieceResult> {
        if !self.am_interested {
            self.send_message(&Message::Interested).await?;
            self.am_interested = true;
        }

        while self.peer_choking {
            match self.read_message().await? {
                Message::Unchoke => self.peer_choking = false,
                Message::Choke => self.peer_choking = true,
                Message::Have(index) => {
                    self.peer_bitfield
                        .get_or_insert_with(|| Bitfield::new(0))
                        .set_piece(index as usize);
                }
                Message::KeepAlive => {}
                _ => {}
            }
        }

        let mut data = vec![0u8; task.length];
        let mut requested = 0usize;
        let mut received = 0usize;
        let mut in_flight = 0usize;

        while received < task.length {
            // While choked, stop issuing new requests and just wait for the
            // peer to send Unchoke (or more of the blocks already in
            // flight); the partial buffer and in-flight count are kept
            // rather than tearing the session down.
            if !self.peer_choking {
                while in_flight < MAX_PIPELINED && requested < task.length {
                    let begin = requested as u32;
                    let length =
                        std::cmp::min(BLOCK_SIZE as usize, task.length - requested) as u32;
                    self.send_message(&Message::Request(task.index as u32, begin, length))
                        .await?;
                    requested += length as usize;
                    in_flight += 1;
                }
            }

            match self.read_message().await? {
                Message::Piece(index, begin, block) => {
                    if index as usize != task.index {
                        return Err(PeerError::UnexpectedBlock);
                    }
                    let begin = begin as usize;
                    let end = begin
                        .checked_add(block.len())
                        .ok_or(PeerError::UnexpectedBlock)?;
                    if end > data.len() {
                        return Err(PeerError::UnexpectedBlock);
                    }
                    data[begin..end].copy_from_slice(&block);
                    received += block.len();
                    in_flight = in_flight.saturating_sub(1);
                }
                Message::Choke => {
                    debug!("peer choked mid-piece, pausing new requests");
                    self.peer_choking = true;
                }
                Message::Unchoke => {
                    self.peer_choking = false;
                }
                Message::Have(index) => {
                    self.peer_bitfield
                        .get_or_insert_with(|| Bitfield::new(0))
                        .set_piece(index as usize);
                }
                Message::KeepAlive => {}
                other => {
                    debug!(?other, "ignoring message while downloading piece");
                }
            }
        }

        verify_piece(task.index, &data, task.hash)?;
        self.send_message(&Message::Have(task.index as u32)).await?;
        Ok(PieceResult {
            index: task.index,
            data,
        })
    }

    async fn send_message(&mut self, message: &Message) -> PeerResult<()> {
        timeout(OP_TIMEOUT, self.stream.write_all(&message.encode()))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }

    async fn read_message(&mut self) -> PeerResult<Message> {
        let mut len_buf = [0u8; 4];
        timeout(OP_TIMEOUT, self.stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| PeerError::Timeout)??;
        let len = BigEndian::read_u32(&len_buf) as usize;

        if len == 0 {
            return Ok(Message::KeepAlive);
        }
        // A sanity cap well above any real block: refuses to allocate an
        // unbounded buffer for a peer sending a bogus length prefix.
        if len > (BLOCK_SIZE as usize) * 10 {
            return Err(PeerError::MalformedMessage(format!(
                "message length {} exceeds sanity limit",
                len
            )));
        }

        let mut body = vec![0u8; len];
        timeout(OP_TIMEOUT, self.stream.read_exact(&mut body))
            .await
            .map_err(|_| PeerError::Timeout)??;

        let mut frame = Vec::with_capacity(len);
        frame.extend_from_slice(&body);
        Message::decode(&frame)
    }
}

fn verify_piece(index: usize, data: &[u8], expected: [u8; 20]) -> PeerResult<()> {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest: [u8; 20] = hasher.finalize().into();
    if digest != expected {
        warn!(piece = index, "piece failed hash verification");
        return Err(PeerError::HashMismatch(index));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_piece_accepts_matching_hash() {
        let data = b"hello world";
        let mut hasher = Sha1::new();
        hasher.update(data);
        let hash: [u8; 20] = hasher.finalize().into();
        assert!(verify_piece(0, data, hash).is_ok());
    }

    #[test]
    fn verify_piece_rejects_mismatched_hash() {
        let data = b"hello world";
        assert!(verify_piece(0, data, [0u8; 20]).is_err());
    }
}
