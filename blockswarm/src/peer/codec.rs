//! The peer wire protocol: the handshake that opens every connection and the
//! length prefixed messages that follow it.

use std::convert::TryFrom;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Bitfield, BlockInfo, PeerId, Sha1Hash};

use super::error::PeerError;

pub(crate) const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// The length of an encoded handshake: the protocol string and its length
/// prefix, the reserved bytes, the info hash and the peer id.
pub(crate) const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

/// The largest accepted message, length prefix excluded: a piece message
/// carrying 128 KiB of data.
pub(crate) const MAX_MSG_LEN: usize = 1 + 4 + 4 + (1 << 17);

/// The first message on a connection, in both directions.
///
/// The protocol string is implied: the codec always writes it, and rejects
/// any other when reading.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Handshake {
    /// Extension bits. We set none and ignore the peer's.
    pub reserved: [u8; 8],
    /// Identifies the transfer both sides mean to exchange.
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Ok(match id {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Piece,
            8 => Self::Cancel,
            _ => return Err(PeerError::ProtocolViolation("unknown message id")),
        })
    }
}

/// The messages exchanged after the handshake.
///
/// Every received message, including the keep alive, counts as a liveness
/// signal for the sending peer.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: u32,
    },
    /// The sender's verified pieces, one bit per piece, padded to whole bytes.
    Bitfield(Bitfield),
    Request(BlockInfo),
    /// A block of a piece, sent in answer to a request.
    ///
    /// The frame carries no length field: the block's length is that of the
    /// payload, so oversized blocks are refused rather than cut to size.
    Piece {
        piece_index: u32,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    /// Returns the id of the message, or `None` for the keep alive, which
    /// doesn't have one.
    pub fn id(&self) -> Option<MessageId> {
        let id = match self {
            Self::KeepAlive => return None,
            Self::Choke => MessageId::Choke,
            Self::Unchoke => MessageId::Unchoke,
            Self::Interested => MessageId::Interested,
            Self::NotInterested => MessageId::NotInterested,
            Self::Have { .. } => MessageId::Have,
            Self::Bitfield(_) => MessageId::Bitfield,
            Self::Request(_) => MessageId::Request,
            Self::Piece { .. } => MessageId::Piece,
            Self::Cancel(_) => MessageId::Cancel,
        };
        Some(id)
    }

    /// The value of the length prefix: the id and the payload.
    fn encoded_len(&self) -> usize {
        let payload_len = match self {
            Self::KeepAlive => return 0,
            Self::Choke | Self::Unchoke | Self::Interested | Self::NotInterested => 0,
            Self::Have { .. } => 4,
            // bytes, not bits
            Self::Bitfield(pieces) => pieces.as_raw_slice().len(),
            Self::Request(_) | Self::Cancel(_) => 3 * 4,
            Self::Piece { data, .. } => 2 * 4 + data.len(),
        };
        1 + payload_len
    }

    /// Parses the payload of a message with the given id. The payload must
    /// be complete.
    fn decode_payload(id: MessageId, mut payload: BytesMut) -> Result<Self, PeerError> {
        let expect_len = |len: usize, what: &'static str| {
            if payload.len() == len {
                Ok(())
            } else {
                Err(PeerError::ProtocolViolation(what))
            }
        };

        let msg = match id {
            MessageId::Choke => {
                expect_len(0, "choke with payload")?;
                Self::Choke
            }
            MessageId::Unchoke => {
                expect_len(0, "unchoke with payload")?;
                Self::Unchoke
            }
            MessageId::Interested => {
                expect_len(0, "interested with payload")?;
                Self::Interested
            }
            MessageId::NotInterested => {
                expect_len(0, "not interested with payload")?;
                Self::NotInterested
            }
            MessageId::Have => {
                expect_len(4, "have of invalid length")?;
                Self::Have {
                    piece_index: payload.get_u32(),
                }
            }
            MessageId::Bitfield => Self::Bitfield(Bitfield::from_vec(payload.to_vec())),
            MessageId::Request | MessageId::Cancel => {
                expect_len(12, "block info of invalid length")?;
                let block = BlockInfo {
                    piece_index: payload.get_u32() as usize,
                    offset: payload.get_u32(),
                    len: payload.get_u32(),
                };
                if id == MessageId::Request {
                    Self::Request(block)
                } else {
                    Self::Cancel(block)
                }
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(PeerError::ProtocolViolation("truncated piece message"));
                }
                let piece_index = payload.get_u32();
                let offset = payload.get_u32();
                Self::Piece {
                    piece_index,
                    offset,
                    data: payload.to_vec(),
                }
            }
        };
        Ok(msg)
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = PeerError;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<(), PeerError> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>, PeerError> {
        // whatever has arrived of the protocol string is checked right away,
        // so that other protocols are rejected without waiting on them
        let prefix_len = buf.len().min(1 + PROTOCOL_STRING.len());
        if prefix_len > 0 {
            let is_valid = buf[0] as usize == PROTOCOL_STRING.len()
                && buf[1..prefix_len] == PROTOCOL_STRING[..prefix_len - 1];
            if !is_valid {
                return Err(PeerError::HandshakeRejected("not a BitTorrent handshake"));
            }
        }
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        buf.advance(1 + PROTOCOL_STRING.len());
        let mut handshake = Handshake::new([0; 20], [0; 20]);
        buf.copy_to_slice(&mut handshake.reserved);
        buf.copy_to_slice(&mut handshake.info_hash);
        buf.copy_to_slice(&mut handshake.peer_id);
        Ok(Some(handshake))
    }
}

/// The codec of all messages following the handshake: each one is a 4 byte
/// big endian length prefix, followed by a 1 byte message id and the
/// message's payload. A zero length prefix is a keep alive.
pub struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = PeerError;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<(), PeerError> {
        let len = msg.encoded_len();
        buf.reserve(4 + len);
        buf.put_u32(len as u32);
        if let Some(id) = msg.id() {
            buf.put_u8(id as u8);
        }

        match msg {
            Message::Have { piece_index } => buf.put_u32(piece_index),
            Message::Bitfield(pieces) => buf.put_slice(pieces.as_raw_slice()),
            Message::Request(block) | Message::Cancel(block) => {
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(piece_index);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            _ => {}
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, PeerError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        // the prefix is only peeked: nothing is consumed until the whole
        // frame is buffered
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > MAX_MSG_LEN {
            return Err(PeerError::ProtocolViolation("message too long"));
        }
        if buf.len() < 4 + len {
            buf.reserve(4 + len - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        if len == 0 {
            return Ok(Some(Message::KeepAlive));
        }
        let mut frame = buf.split_to(len);
        let id = MessageId::try_from(frame.get_u8())?;
        Message::decode_payload(id, frame).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::BLOCK_LEN;

    /// Messages of each kind and their encoding, spelled out byte by byte.
    fn wire_samples() -> Vec<(Message, Vec<u8>)> {
        let block = BlockInfo {
            piece_index: 42,
            offset: BLOCK_LEN,
            len: BLOCK_LEN,
        };
        vec![
            (Message::KeepAlive, vec![0, 0, 0, 0]),
            (Message::Choke, vec![0, 0, 0, 1, 0]),
            (Message::Unchoke, vec![0, 0, 0, 1, 1]),
            (Message::Interested, vec![0, 0, 0, 1, 2]),
            (Message::NotInterested, vec![0, 0, 0, 1, 3]),
            (
                Message::Have { piece_index: 0x0102 },
                vec![0, 0, 0, 5, 4, 0, 0, 1, 2],
            ),
            (
                Message::Bitfield(Bitfield::from_vec(vec![0b1100_1001, 0b1000_0000])),
                vec![0, 0, 0, 3, 5, 0b1100_1001, 0b1000_0000],
            ),
            (
                Message::Request(block),
                vec![0, 0, 0, 13, 6, 0, 0, 0, 42, 0, 0, 0x40, 0, 0, 0, 0x40, 0],
            ),
            (
                Message::Piece {
                    piece_index: 42,
                    offset: BLOCK_LEN,
                    data: vec![0xde, 0xad, 0xbe, 0xef],
                },
                vec![0, 0, 0, 13, 7, 0, 0, 0, 42, 0, 0, 0x40, 0, 0xde, 0xad, 0xbe, 0xef],
            ),
            (
                Message::Cancel(block),
                vec![0, 0, 0, 13, 8, 0, 0, 0, 42, 0, 0, 0x40, 0, 0, 0, 0x40, 0],
            ),
        ]
    }

    #[test]
    fn test_message_encoding() {
        for (msg, expected) in wire_samples() {
            let mut buf = BytesMut::new();
            PeerCodec.encode(msg.clone(), &mut buf).unwrap();
            assert_eq!(&buf[..], &expected[..], "encoding {:?}", msg);
        }
    }

    // The handshake followed by every kind of message in one buffer: each
    // decode must consume exactly one frame.
    #[test]
    fn test_stream_decoding() {
        let handshake = Handshake::new([0xab; 20], *b"-BS0100-000000000000");
        let samples = wire_samples();

        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        for (_, encoded) in samples.iter().rev() {
            buf.extend_from_slice(encoded);
        }

        assert_eq!(HandshakeCodec.decode(&mut buf).unwrap(), Some(handshake));
        for (msg, _) in samples.into_iter().rev() {
            assert_eq!(PeerCodec.decode(&mut buf).unwrap(), Some(msg));
        }
        assert!(buf.is_empty());
        assert_eq!(PeerCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_handshake_layout() {
        let handshake = Handshake::new([0xab; 20], *b"-BS0100-000000000000");
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();

        assert_eq!(buf.len(), HANDSHAKE_LEN);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], b"BitTorrent protocol");
        assert_eq!(&buf[20..28], &[0; 8]);
        assert_eq!(&buf[28..48], &[0xab; 20]);
        assert_eq!(&buf[48..], b"-BS0100-000000000000");

        // a partial handshake is left in the buffer
        let mut partial = BytesMut::from(&buf[..30]);
        assert_eq!(HandshakeCodec.decode(&mut partial).unwrap(), None);
        assert_eq!(partial.len(), 30);
    }

    #[test]
    fn test_foreign_handshake_is_rejected() {
        // wrong length prefix
        let mut buf = BytesMut::from(&b"\x1bnot the BitTorrent protocol"[..]);
        assert!(matches!(
            HandshakeCodec.decode(&mut buf),
            Err(PeerError::HandshakeRejected(_))
        ));

        // right length, wrong string, rejected before the rest arrives
        let mut buf = BytesMut::from(&b"\x13BitTorrent_p"[..]);
        assert!(matches!(
            HandshakeCodec.decode(&mut buf),
            Err(PeerError::HandshakeRejected(_))
        ));

        // a valid prefix is waited on
        let mut buf = BytesMut::from(&b"\x13BitTorrent p"[..]);
        assert_eq!(HandshakeCodec.decode(&mut buf).unwrap(), None);
    }

    // A message split across arbitrary boundaries is only decoded once all
    // of it has arrived, and nothing is consumed before that.
    #[test]
    fn test_partial_frames_are_not_consumed() {
        let data: Vec<u8> = (0..BLOCK_LEN).map(|i| (i % 251) as u8).collect();
        let msg = Message::Piece {
            piece_index: 3,
            offset: 0,
            data,
        };
        let mut encoded = BytesMut::new();
        PeerCodec.encode(msg.clone(), &mut encoded).unwrap();

        let mut buf = BytesMut::new();
        for chunk in encoded.chunks(1000) {
            assert_eq!(PeerCodec.decode(&mut buf).unwrap(), None);
            assert_eq!(buf.len() % 1000, 0);
            buf.extend_from_slice(chunk);
        }
        assert_eq!(PeerCodec.decode(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());

        // only part of a keep alive's length prefix
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        assert_eq!(PeerCodec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 3);
        buf.put_u8(0);
        assert_eq!(PeerCodec.decode(&mut buf).unwrap(), Some(Message::KeepAlive));
    }

    #[test]
    fn test_invalid_messages() {
        let invalid: &[&[u8]] = &[
            // unknown id
            &[0, 0, 0, 1, 42],
            // have without a full piece index
            &[0, 0, 0, 2, 4, 0],
            // request with a truncated payload
            &[0, 0, 0, 9, 6, 0, 0, 0, 0, 0, 0, 0, 0],
            // choke with a payload
            &[0, 0, 0, 2, 0, 0],
            // piece without an offset
            &[0, 0, 0, 5, 7, 0, 0, 0, 1],
        ];
        for frame in invalid {
            let mut buf = BytesMut::from(*frame);
            assert!(
                matches!(PeerCodec.decode(&mut buf), Err(PeerError::ProtocolViolation(_))),
                "decoding {:?}",
                frame
            );
        }

        // too long, rejected from the prefix alone
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MSG_LEN as u32 + 1);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(PeerError::ProtocolViolation(_))
        ));
    }
}
