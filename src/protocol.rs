use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::torrent::HASH_LEN;

/// Protocol identifier exchanged in the handshake.
pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// Total size of a handshake message in either direction.
pub const HANDSHAKE_LEN: usize = 68;

/// The fixed 68-byte opening message: protocol string, 8 reserved bytes,
/// info hash, peer id.
pub struct Handshake {
    pub info_hash: [u8; HASH_LEN],
    pub peer_id: [u8; HASH_LEN],
}

impl Handshake {
    pub fn new(info_hash: [u8; HASH_LEN], peer_id: [u8; HASH_LEN]) -> Self {
        Self { info_hash, peer_id }
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        // bytes 20..28 stay zero (reserved)
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    pub fn decode(buf: &[u8; HANDSHAKE_LEN]) -> Result<Self> {
        if buf[0] as usize != PROTOCOL.len() || &buf[1..20] != PROTOCOL {
            return Err(Error::PeerProtocol("unrecognized handshake".into()));
        }
        let mut info_hash = [0u8; HASH_LEN];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; HASH_LEN];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Self { info_hash, peer_id })
    }
}

/// A peer-wire message after the handshake.
///
/// On the wire each message is `[4-byte BE length][1-byte id][payload]`
/// where the length counts id plus payload; a length of zero is a
/// keep-alive with neither.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;

impl Message {
    /// Serializes the full frame, length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::KeepAlive => {
                buf.write_u32::<BigEndian>(0).unwrap();
            }
            Message::Choke => encode_bare(&mut buf, ID_CHOKE),
            Message::Unchoke => encode_bare(&mut buf, ID_UNCHOKE),
            Message::Interested => encode_bare(&mut buf, ID_INTERESTED),
            Message::NotInterested => encode_bare(&mut buf, ID_NOT_INTERESTED),
            Message::Have(index) => {
                buf.write_u32::<BigEndian>(5).unwrap();
                buf.write_u8(ID_HAVE).unwrap();
                buf.write_u32::<BigEndian>(*index).unwrap();
            }
            Message::Bitfield(bits) => {
                buf.write_u32::<BigEndian>(1 + bits.len() as u32).unwrap();
                buf.write_u8(ID_BITFIELD).unwrap();
                buf.extend_from_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => encode_triple(&mut buf, ID_REQUEST, *index, *begin, *length),
            Message::Piece {
                index,
                begin,
                block,
            } => {
                buf.write_u32::<BigEndian>(9 + block.len() as u32).unwrap();
                buf.write_u8(ID_PIECE).unwrap();
                buf.write_u32::<BigEndian>(*index).unwrap();
                buf.write_u32::<BigEndian>(*begin).unwrap();
                buf.extend_from_slice(block);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => encode_triple(&mut buf, ID_CANCEL, *index, *begin, *length),
        }
        buf
    }

    /// Parses a frame body (everything after the length prefix) that has
    /// already been read off the wire. Keep-alives never reach this point:
    /// they have no body.
    pub fn decode(id: u8, mut payload: &[u8]) -> Result<Self> {
        let msg = match id {
            ID_CHOKE => expect_empty(payload, Message::Choke)?,
            ID_UNCHOKE => expect_empty(payload, Message::Unchoke)?,
            ID_INTERESTED => expect_empty(payload, Message::Interested)?,
            ID_NOT_INTERESTED => expect_empty(payload, Message::NotInterested)?,
            ID_HAVE => {
                if payload.len() != 4 {
                    return Err(Error::PeerProtocol("have payload must be 4 bytes".into()));
                }
                Message::Have(read_u32(&mut payload)?)
            }
            ID_BITFIELD => Message::Bitfield(payload.to_vec()),
            ID_REQUEST => {
                if payload.len() != 12 {
                    return Err(Error::PeerProtocol(
                        "request payload must be 12 bytes".into(),
                    ));
                }
                Message::Request {
                    index: read_u32(&mut payload)?,
                    begin: read_u32(&mut payload)?,
                    length: read_u32(&mut payload)?,
                }
            }
            ID_PIECE => {
                if payload.len() < 8 {
                    return Err(Error::PeerProtocol(
                        "piece payload must carry index and begin".into(),
                    ));
                }
                Message::Piece {
                    index: read_u32(&mut payload)?,
                    begin: read_u32(&mut payload)?,
                    block: payload.to_vec(),
                }
            }
            ID_CANCEL => {
                if payload.len() != 12 {
                    return Err(Error::PeerProtocol(
                        "cancel payload must be 12 bytes".into(),
                    ));
                }
                Message::Cancel {
                    index: read_u32(&mut payload)?,
                    begin: read_u32(&mut payload)?,
                    length: read_u32(&mut payload)?,
                }
            }
            other => {
                return Err(Error::PeerProtocol(format!("unknown message id {other}")));
            }
        };
        Ok(msg)
    }
}

fn encode_bare(buf: &mut Vec<u8>, id: u8) {
    buf.write_u32::<BigEndian>(1).unwrap();
    buf.write_u8(id).unwrap();
}

fn encode_triple(buf: &mut Vec<u8>, id: u8, index: u32, begin: u32, length: u32) {
    buf.write_u32::<BigEndian>(13).unwrap();
    buf.write_u8(id).unwrap();
    buf.write_u32::<BigEndian>(index).unwrap();
    buf.write_u32::<BigEndian>(begin).unwrap();
    buf.write_u32::<BigEndian>(length).unwrap();
}

fn expect_empty(payload: &[u8], msg: Message) -> Result<Message> {
    if payload.is_empty() {
        Ok(msg)
    } else {
        Err(Error::PeerProtocol("unexpected payload".into()))
    }
}

fn read_u32(payload: &mut &[u8]) -> Result<u32> {
    payload
        .read_u32::<BigEndian>()
        .map_err(|e| Error::PeerProtocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) -> Message {
        let frame = msg.encode();
        let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);
        Message::decode(frame[4], &frame[5..]).unwrap()
    }

    #[test]
    fn handshake_roundtrip() {
        let hs = Handshake::new([1u8; 20], *b"-LE0001-000000000042");
        let encoded = hs.encode();
        assert_eq!(encoded.len(), HANDSHAKE_LEN);
        assert_eq!(encoded[0], 19);
        assert_eq!(&encoded[20..28], &[0u8; 8]);

        let decoded = Handshake::decode(&encoded).unwrap();
        assert_eq!(decoded.info_hash, [1u8; 20]);
        assert_eq!(&decoded.peer_id, b"-LE0001-000000000042");
    }

    #[test]
    fn handshake_with_wrong_protocol_string_rejected() {
        let mut encoded = Handshake::new([1u8; 20], [2u8; 20]).encode();
        encoded[3] = b'x';
        assert!(Handshake::decode(&encoded).is_err());
    }

    #[test]
    fn keep_alive_is_a_zero_length_frame() {
        assert_eq!(Message::KeepAlive.encode(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn bare_messages_roundtrip() {
        for msg in [
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
        ] {
            assert_eq!(roundtrip(msg.clone()), msg);
        }
    }

    #[test]
    fn have_roundtrip() {
        assert_eq!(roundtrip(Message::Have(42)), Message::Have(42));
    }

    #[test]
    fn request_encodes_big_endian_fields() {
        let frame = Message::Request {
            index: 1,
            begin: 16_384,
            length: 16_384,
        }
        .encode();
        assert_eq!(frame[..4], [0, 0, 0, 13]);
        assert_eq!(frame[4], 6);
        assert_eq!(frame[5..9], [0, 0, 0, 1]);
        assert_eq!(frame[9..13], [0, 0, 0x40, 0]);
        assert_eq!(frame[13..17], [0, 0, 0x40, 0]);
    }

    #[test]
    fn piece_roundtrip_carries_block() {
        let msg = Message::Piece {
            index: 3,
            begin: 16_384,
            block: vec![9u8; 100],
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn bitfield_roundtrip() {
        let msg = Message::Bitfield(vec![0b1010_0000, 0b0000_0001]);
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn short_request_payload_rejected() {
        assert!(Message::decode(ID_REQUEST, &[0u8; 8]).is_err());
    }

    #[test]
    fn unknown_id_rejected() {
        assert!(Message::decode(99, &[]).is_err());
    }
}
