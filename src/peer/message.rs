//! Peer wire message framing.
//!
//! Every message on the wire is a 4-byte big-endian length prefix followed
//! by that many bytes of payload; a length of zero is a keep-alive with no
//! further payload. The first payload byte (when present) is the message
//! ID, 0 through 8. IDs outside that range are a protocol error - in
//! particular, BEP-5's DHT `port` message (id 9) is out of scope and is
//! rejected like any other unknown ID.

use crate::peer::{PeerError, PeerResult};
use byteorder::{BigEndian, ByteOrder};

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(u32, u32, u32),
    Piece(u32, u32, Vec<u8>),
    Cancel(u32, u32, u32),
}

impl Message {
    fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(ID_CHOKE),
            Message::Unchoke => Some(ID_UNCHOKE),
            Message::Interested => Some(ID_INTERESTED),
            Message::NotInterested => Some(ID_NOT_INTERESTED),
            Message::Have(_) => Some(ID_HAVE),
            Message::Bitfield(_) => Some(ID_BITFIELD),
            Message::Request(..) => Some(ID_REQUEST),
            Message::Piece(..) => Some(ID_PIECE),
            Message::Cancel(..) => Some(ID_CANCEL),
        }
    }

    /// Serializes this message into its wire form, including the 4-byte
    /// length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        if let Some(id) = self.id() {
            payload.push(id);
        }
        match self {
            Message::Have(index) => payload.extend_from_slice(&index.to_be_bytes()),
            Message::Bitfield(bits) => payload.extend_from_slice(bits),
            Message::Request(index, begin, length) | Message::Cancel(index, begin, length) => {
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece(index, begin, block) => {
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
            }
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
        }

        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        buf
    }

    /// Parses a message from its payload bytes - the part of the frame
    /// after the 4-byte length prefix has already been stripped off by the
    /// caller's length-prefixed read loop. An empty slice is a keep-alive.
    pub fn decode(data: &[u8]) -> PeerResult<Message> {
        if data.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = data[0];
        let body = &data[1..];

        match id {
            ID_CHOKE => expect_empty(body, "choke").map(|_| Message::Choke),
            ID_UNCHOKE => expect_empty(body, "unchoke").map(|_| Message::Unchoke),
            ID_INTERESTED => expect_empty(body, "interested").map(|_| Message::Interested),
            ID_NOT_INTERESTED => {
                expect_empty(body, "not_interested").map(|_| Message::NotInterested)
            }
            ID_HAVE => {
                expect_len(body, 4, "have")?;
                Ok(Message::Have(BigEndian::read_u32(body)))
            }
            ID_BITFIELD => Ok(Message::Bitfield(body.to_vec())),
            ID_REQUEST => {
                expect_len(body, 12, "request")?;
                Ok(Message::Request(
                    BigEndian::read_u32(&body[0..4]),
                    BigEndian::read_u32(&body[4..8]),
                    BigEndian::read_u32(&body[8..12]),
                ))
            }
            ID_PIECE => {
                if body.len() < 8 {
                    return Err(PeerError::MalformedMessage(
                        "piece message shorter than index+begin header".to_string(),
                    ));
                }
                Ok(Message::Piece(
                    BigEndian::read_u32(&body[0..4]),
                    BigEndian::read_u32(&body[4..8]),
                    body[8..].to_vec(),
                ))
            }
            ID_CANCEL => {
                expect_len(body, 12, "cancel")?;
                Ok(Message::Cancel(
                    BigEndian::read_u32(&body[0..4]),
                    BigEndian::read_u32(&body[4..8]),
                    BigEndian::read_u32(&body[8..12]),
                ))
            }
            other => Err(PeerError::MalformedMessage(format!(
                "unknown message id {}",
                other
            ))),
        }
    }
}

fn expect_empty(body: &[u8], name: &str) -> PeerResult<()> {
    expect_len(body, 0, name)
}

fn expect_len(body: &[u8], expected: usize, name: &str) -> PeerResult<()> {
    if body.len() != expected {
        return Err(PeerError::MalformedMessage(format!(
            "{} message expected {} payload bytes, got {}",
            name,
            expected,
            body.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_payload(encoded: &[u8]) -> &[u8] {
        &encoded[4..]
    }

    #[test]
    fn keep_alive_round_trip() {
        let encoded = Message::KeepAlive.encode();
        assert_eq!(encoded, vec![0, 0, 0, 0]);
        assert_eq!(Message::decode(frame_payload(&encoded)).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn choke_round_trip() {
        let encoded = Message::Choke.encode();
        assert_eq!(encoded, vec![0, 0, 0, 1, ID_CHOKE]);
        assert_eq!(Message::decode(frame_payload(&encoded)).unwrap(), Message::Choke);
    }

    #[test]
    fn have_round_trip() {
        let msg = Message::Have(42);
        let encoded = msg.encode();
        assert_eq!(Message::decode(frame_payload(&encoded)).unwrap(), msg);
    }

    #[test]
    fn request_round_trip() {
        let msg = Message::Request(1, 16384, 16384);
        let encoded = msg.encode();
        assert_eq!(Message::decode(frame_payload(&encoded)).unwrap(), msg);
    }

    #[test]
    fn piece_round_trip_with_block_data() {
        let msg = Message::Piece(2, 0, vec![1, 2, 3, 4, 5]);
        let encoded = msg.encode();
        assert_eq!(Message::decode(frame_payload(&encoded)).unwrap(), msg);
    }

    #[test]
    fn bitfield_round_trip() {
        let msg = Message::Bitfield(vec![0b1111_0000, 0b0000_1111]);
        let encoded = msg.encode();
        assert_eq!(Message::decode(frame_payload(&encoded)).unwrap(), msg);
    }

    #[test]
    fn truncated_request_is_malformed() {
        assert!(Message::decode(&[ID_REQUEST, 0, 0]).is_err());
    }

    #[test]
    fn unknown_id_is_malformed() {
        assert!(Message::decode(&[200]).is_err());
    }

    #[test]
    fn port_id_is_out_of_scope_and_malformed() {
        // id 9 is BEP-5's DHT `port` message; out of scope, so it must be
        // rejected like any other unknown id rather than parsed.
        assert!(Message::decode(&[9, 0, 0]).is_err());
    }
}
