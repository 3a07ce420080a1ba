//! Peer wire vocabulary (BitTorrent v1).
//!
//! The byte-level framing lives in the wire layer; the engine exchanges
//! already-framed messages with each peer session over channels.

use std::fmt::Display;
use std::ops::Range;

use bytes::Bytes;

use crate::bitfield::BitField;

/// Wire request granularity. We never request more than this and we reject
/// incoming requests for more.
pub const BLOCK_LENGTH: u32 = 16 * 1024;

/// Position and length of one block inside the torrent's piece space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl Block {
    /// Block index within its piece.
    pub fn index(&self) -> u32 {
        self.offset / BLOCK_LENGTH
    }

    pub fn range(&self) -> Range<usize> {
        let offset = self.offset as usize;
        offset..offset + self.length as usize
    }
}

impl Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "block in piece {} with offset {} and length {}",
            self.piece, self.offset, self.length
        )
    }
}

/// A block together with its payload, as carried by a PIECE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    pub piece: u32,
    pub offset: u32,
    pub bytes: Bytes,
}

impl DataBlock {
    pub fn new(piece: u32, offset: u32, bytes: Bytes) -> Self {
        Self {
            piece,
            offset,
            bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn block(&self) -> Block {
        Block {
            piece: self.piece,
            offset: self.offset,
            length: self.bytes.len() as u32,
        }
    }
}

impl Display for DataBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "data block in piece {} with offset {} and length {}",
            self.piece,
            self.offset,
            self.bytes.len()
        )
    }
}

/// A framed peer wire message.
///
/// The same type travels both directions: the wire layer decodes incoming
/// frames into it and encodes outgoing ones from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield { payload: BitField },
    Request(Block),
    Piece(DataBlock),
    Cancel(Block),
}

impl Display for PeerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerMessage::KeepAlive => write!(f, "KeepAlive"),
            PeerMessage::Choke => write!(f, "Choke"),
            PeerMessage::Unchoke => write!(f, "Unchoke"),
            PeerMessage::Interested => write!(f, "Interested"),
            PeerMessage::NotInterested => write!(f, "NotInterested"),
            PeerMessage::Have { index } => write!(f, "Have {index}"),
            PeerMessage::Bitfield { payload } => {
                write!(f, "Bitfield with {} bytes", payload.as_bytes().len())
            }
            PeerMessage::Request(block) => write!(f, "Request for {block}"),
            PeerMessage::Piece(data) => write!(f, "Piece with {data}"),
            PeerMessage::Cancel(block) => write!(f, "Cancel for {block}"),
        }
    }
}
