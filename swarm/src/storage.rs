//! Channel interface to the disk collaborator.
//!
//! Content writes, reads for serving uploads, and SHA-1 verification all
//! happen outside the engine. The engine pushes work through
//! [`StorageHandle`] and consumes [`StorageFeedback`] events on its loop;
//! back-pressure is the bounded channel itself.

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{Block, DataBlock};

#[derive(Debug)]
pub enum StorageMessage {
    /// Write a received block's bytes at its (piece, offset).
    WriteBlock(DataBlock),
    /// Hash-check a piece whose blocks are all on disk.
    VerifyPiece { piece: u32 },
    /// Read a block to serve a peer's REQUEST.
    ReadBlock { peer: Uuid, block: Block },
}

#[derive(Debug)]
pub enum StorageFeedback {
    /// Verification outcome for a completed piece.
    Verified { piece: u32, ok: bool },
    /// Result of a [`StorageMessage::ReadBlock`]; `None` when the read
    /// failed and the send should simply be dropped.
    BlockData {
        peer: Uuid,
        block: Block,
        bytes: Option<Bytes>,
    },
    /// A content write failed. Fatal to the torrent, not to the process.
    WriteFailed { piece: u32 },
}

#[derive(Debug, Clone)]
pub struct StorageHandle {
    pub message_tx: mpsc::Sender<StorageMessage>,
}

impl StorageHandle {
    pub fn new(message_tx: mpsc::Sender<StorageMessage>) -> Self {
        Self { message_tx }
    }

    pub fn try_write_block(&self, data: DataBlock) -> anyhow::Result<()> {
        self.message_tx.try_send(StorageMessage::WriteBlock(data))?;
        Ok(())
    }

    pub fn try_verify_piece(&self, piece: u32) -> anyhow::Result<()> {
        self.message_tx
            .try_send(StorageMessage::VerifyPiece { piece })?;
        Ok(())
    }

    pub fn try_read_block(&self, peer: Uuid, block: Block) -> anyhow::Result<()> {
        self.message_tx
            .try_send(StorageMessage::ReadBlock { peer, block })?;
        Ok(())
    }
}
