//! Kinstr and packet wire formats.
//!
//! Internally kinstrs are plain enums; they are lowered to fixed-width
//! 64-bit words only when a packet is framed for the network, and to bytes
//! only at the outbound channel boundary.
//!
//! # Instruction word layout (64 bits)
//!
//! | 63    | 62-8            | 15-8 (query only) | 7-0   |
//! |-------|-----------------|-------------------|-------|
//! | query | opaque payload  | query baseline    | ident |
//!
//! A compute word carries the opaque 55-bit payload in bits 62-8. An ident
//! query (query bit set) instead carries its baseline in bits 15-8 and its
//! aggregation round id in the ident field.
//!
//! # Header word layout (64 bits)
//!
//! | 46-45     | 44-40 | 39-32 | 31-24    | 23-16    | 15-8     | 7-0      |
//! |-----------|-------|-------|----------|----------|----------|----------|
//! | send type | kind  | count | source y | source x | target y | target x |

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

/// Bytes per framed network word.
pub const WORD_BYTES: usize = 8;

const QUERY_FLAG_SHIFT: u32 = 63;
const PAYLOAD_SHIFT: u32 = 8;
const PAYLOAD_MASK: u64 = (1 << 55) - 1;
const BASELINE_SHIFT: u32 = 8;
const IDENT_MASK: u64 = 0xFF;

const HDR_TARGET_X_SHIFT: u32 = 0;
const HDR_TARGET_Y_SHIFT: u32 = 8;
const HDR_SOURCE_X_SHIFT: u32 = 16;
const HDR_SOURCE_Y_SHIFT: u32 = 24;
const HDR_COUNT_SHIFT: u32 = 32;
const HDR_KIND_SHIFT: u32 = 40;
const HDR_KIND_MASK: u64 = 0x1F;
const HDR_SEND_TYPE_SHIFT: u32 = 45;
const HDR_SEND_TYPE_MASK: u64 = 0x3;

/// Errors from decoding framed packets.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet truncated: expected {expected} payload words, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("trailing bytes after packet payload")]
    TrailingBytes,
}

/// Destination descriptor for a kinstr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dest {
    /// A single kamlet, by flat index into the kamlet grid.
    Kamlet(u8),
    /// Every kamlet in the lamlet.
    Broadcast,
}

/// Kinstr operation.
///
/// The compute payload is opaque to the dispatch core; decode happens in
/// the kamlets. The ident query is the one opcode the dispatch core owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KinstrOp {
    /// Opaque compute/memory operation (opcode and operands packed by the
    /// decoder upstream of this core).
    Compute { payload: u64 },
    /// Reclamation query: ask every kamlet for the distance from `baseline`
    /// to its oldest still-active ident.
    IdentQuery { baseline: u8 },
}

/// An unsequenced kinstr as produced by instruction decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Kinstr {
    pub op: KinstrOp,
    pub dest: Dest,
    /// Element-order traffic (ordered indexed loads/stores) is dispatched
    /// ahead of normal traffic.
    pub ordered: bool,
}

impl Kinstr {
    /// A normal (unordered) compute kinstr.
    pub fn compute(payload: u64, dest: Dest) -> Self {
        Self { op: KinstrOp::Compute { payload }, dest, ordered: false }
    }

    /// An element-ordered compute kinstr.
    pub fn ordered(payload: u64, dest: Dest) -> Self {
        Self { op: KinstrOp::Compute { payload }, dest, ordered: true }
    }
}

/// A kinstr stamped with its sequence ident, ready for batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencedKinstr {
    /// Sequence ident for compute kinstrs; aggregation round id for ident
    /// queries.
    pub ident: u8,
    pub op: KinstrOp,
    pub dest: Dest,
    pub ordered: bool,
}

impl SequencedKinstr {
    /// Lower to the 64-bit instruction word.
    pub fn encode_word(&self) -> u64 {
        match self.op {
            KinstrOp::Compute { payload } => {
                ((payload & PAYLOAD_MASK) << PAYLOAD_SHIFT) | self.ident as u64
            }
            KinstrOp::IdentQuery { baseline } => {
                (1u64 << QUERY_FLAG_SHIFT)
                    | ((baseline as u64) << BASELINE_SHIFT)
                    | self.ident as u64
            }
        }
    }
}

/// Decoded form of a 64-bit instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedWord {
    Compute { payload: u64, ident: u8 },
    IdentQuery { baseline: u8, round: u8 },
}

/// Decode a 64-bit instruction word.
pub fn decode_word(word: u64) -> DecodedWord {
    let ident = (word & IDENT_MASK) as u8;
    if word >> QUERY_FLAG_SHIFT != 0 {
        DecodedWord::IdentQuery { baseline: ((word >> BASELINE_SHIFT) & 0xFF) as u8, round: ident }
    } else {
        DecodedWord::Compute { payload: (word >> PAYLOAD_SHIFT) & PAYLOAD_MASK, ident }
    }
}

/// Message kind carried in the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MessageKind {
    /// A batch of kinstrs for a kamlet's inbound instruction queue.
    #[default]
    Instructions = 0,
    /// Ident query result, root kamlet back to the lamlet.
    IdentQueryResp = 1,
    /// Reserved kinds (2+).
    Reserved = 2,
}

impl MessageKind {
    pub fn from_u8(val: u8) -> Self {
        match val & 0x1F {
            0 => Self::Instructions,
            1 => Self::IdentQueryResp,
            _ => Self::Reserved,
        }
    }
}

/// Unicast or broadcast delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SendType {
    #[default]
    Single = 0,
    Broadcast = 1,
}

impl SendType {
    pub fn from_u8(val: u8) -> Self {
        match val & 0x3 {
            1 => Self::Broadcast,
            _ => Self::Single,
        }
    }
}

/// Packet header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub target_x: u8,
    pub target_y: u8,
    pub source_x: u8,
    pub source_y: u8,
    /// Number of payload words following the header.
    pub count: u8,
    pub kind: MessageKind,
    pub send_type: SendType,
}

impl Header {
    /// Encode to the 64-bit header word.
    pub fn encode(&self) -> u64 {
        ((self.target_x as u64) << HDR_TARGET_X_SHIFT)
            | ((self.target_y as u64) << HDR_TARGET_Y_SHIFT)
            | ((self.source_x as u64) << HDR_SOURCE_X_SHIFT)
            | ((self.source_y as u64) << HDR_SOURCE_Y_SHIFT)
            | ((self.count as u64) << HDR_COUNT_SHIFT)
            | (((self.kind as u64) & HDR_KIND_MASK) << HDR_KIND_SHIFT)
            | (((self.send_type as u64) & HDR_SEND_TYPE_MASK) << HDR_SEND_TYPE_SHIFT)
    }

    /// Decode from the 64-bit header word.
    pub fn decode(word: u64) -> Self {
        Self {
            target_x: (word >> HDR_TARGET_X_SHIFT) as u8,
            target_y: (word >> HDR_TARGET_Y_SHIFT) as u8,
            source_x: (word >> HDR_SOURCE_X_SHIFT) as u8,
            source_y: (word >> HDR_SOURCE_Y_SHIFT) as u8,
            count: (word >> HDR_COUNT_SHIFT) as u8,
            kind: MessageKind::from_u8((word >> HDR_KIND_SHIFT) as u8),
            send_type: SendType::from_u8((word >> HDR_SEND_TYPE_SHIFT) as u8),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.send_type == SendType::Broadcast
    }
}

/// A framed packet: header word plus payload words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub words: Vec<u64>,
}

impl Packet {
    /// Serialize to little-endian bytes for the outbound channel.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity((1 + self.words.len()) * WORD_BYTES);
        out.write_u64::<LittleEndian>(self.header.encode()).expect("vec write");
        for word in &self.words {
            out.write_u64::<LittleEndian>(*word).expect("vec write");
        }
        out
    }

    /// Deserialize from the channel byte stream.
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, PacketError> {
        let header_word = bytes
            .read_u64::<LittleEndian>()
            .map_err(|_| PacketError::Truncated { expected: 1, got: 0 })?;
        let header = Header::decode(header_word);
        let mut words = Vec::with_capacity(header.count as usize);
        for got in 0..header.count as usize {
            let word = bytes
                .read_u64::<LittleEndian>()
                .map_err(|_| PacketError::Truncated { expected: header.count as usize, got })?;
            words.push(word);
        }
        if !bytes.is_empty() {
            return Err(PacketError::TrailingBytes);
        }
        Ok(Self { header, words })
    }
}

/// Reassembles packets from a word-at-a-time channel.
///
/// The outbound channel delivers one 64-bit word per cycle; the receiver
/// recognizes a header word by position (the channel is reliable and
/// in-order, so word `count` boundaries are unambiguous).
#[derive(Debug, Default)]
pub struct PacketAssembler {
    current: Option<(Header, Vec<u64>)>,
}

impl PacketAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one word; returns a completed packet once its last payload word
    /// arrives.
    pub fn push_word(&mut self, word: u64) -> Option<Packet> {
        match self.current.take() {
            None => {
                let header = Header::decode(word);
                if header.count == 0 {
                    return Some(Packet { header, words: Vec::new() });
                }
                self.current = Some((header, Vec::with_capacity(header.count as usize)));
                None
            }
            Some((header, mut words)) => {
                words.push(word);
                if words.len() == header.count as usize {
                    Some(Packet { header, words })
                } else {
                    self.current = Some((header, words));
                    None
                }
            }
        }
    }

    /// True while a packet is partially assembled.
    pub fn in_packet(&self) -> bool {
        self.current.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let header = Header {
            target_x: 3,
            target_y: 1,
            source_x: 0,
            source_y: 2,
            count: 4,
            kind: MessageKind::Instructions,
            send_type: SendType::Single,
        };
        assert_eq!(Header::decode(header.encode()), header);
    }

    #[test]
    fn test_header_field_maxima() {
        let header = Header {
            target_x: 0xFF,
            target_y: 0xFF,
            source_x: 0xFF,
            source_y: 0xFF,
            count: 0xFF,
            kind: MessageKind::IdentQueryResp,
            send_type: SendType::Broadcast,
        };
        let decoded = Header::decode(header.encode());
        assert_eq!(decoded, header);
        assert!(decoded.is_broadcast());
    }

    #[test]
    fn test_compute_word_round_trip() {
        let instr = SequencedKinstr {
            ident: 113,
            op: KinstrOp::Compute { payload: 0x00AB_CDEF_0123_4567 & ((1 << 55) - 1) },
            dest: Dest::Kamlet(2),
            ordered: false,
        };
        match decode_word(instr.encode_word()) {
            DecodedWord::Compute { payload, ident } => {
                assert_eq!(ident, 113);
                assert_eq!(payload, 0x00AB_CDEF_0123_4567 & ((1 << 55) - 1));
            }
            other => panic!("expected compute word, got {:?}", other),
        }
    }

    #[test]
    fn test_query_word_round_trip() {
        let instr = SequencedKinstr {
            ident: 2,
            op: KinstrOp::IdentQuery { baseline: 57 },
            dest: Dest::Broadcast,
            ordered: false,
        };
        assert_eq!(
            decode_word(instr.encode_word()),
            DecodedWord::IdentQuery { baseline: 57, round: 2 }
        );
    }

    #[test]
    fn test_packet_bytes_round_trip() {
        let packet = Packet {
            header: Header {
                target_x: 1,
                target_y: 0,
                source_x: 0,
                source_y: 0,
                count: 2,
                kind: MessageKind::Instructions,
                send_type: SendType::Single,
            },
            words: vec![0xDEAD_BEEF, 0x1234_5678_9ABC_DEF0],
        };
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), 3 * WORD_BYTES);
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_packet_truncated() {
        let packet = Packet {
            header: Header { count: 2, ..Default::default() },
            words: vec![1, 2],
        };
        let bytes = packet.to_bytes();
        assert_eq!(
            Packet::from_bytes(&bytes[..16]),
            Err(PacketError::Truncated { expected: 2, got: 1 })
        );
    }

    #[test]
    fn test_assembler_splits_packets() {
        let mut asm = PacketAssembler::new();
        let a = Packet {
            header: Header { count: 2, target_x: 1, ..Default::default() },
            words: vec![10, 11],
        };
        let b = Packet {
            header: Header { count: 1, target_x: 2, ..Default::default() },
            words: vec![20],
        };
        let mut stream: Vec<u64> = vec![a.header.encode()];
        stream.extend(&a.words);
        stream.push(b.header.encode());
        stream.extend(&b.words);

        let mut out = Vec::new();
        for word in stream {
            if let Some(pkt) = asm.push_word(word) {
                out.push(pkt);
            }
        }
        assert_eq!(out, vec![a, b]);
        assert!(!asm.in_packet());
    }
}
