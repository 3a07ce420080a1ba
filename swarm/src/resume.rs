//! Memory-mapped resume file.
//!
//! Layout, in order: `⌈N/8⌉` bytes holding the verified-piece bits, then
//! for every piece `⌈piece_length/131072⌉` bytes holding one bit per
//! 16 KiB block that is already written to disk (even when the piece is
//! not verified yet). The file is mapped shared for its whole lifetime, so
//! bit flips dirty pages in place; explicit flushes happen on piece
//! completion and on unload.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;

use crate::bitfield::BitField;
use crate::error::Error;
use crate::protocol::BLOCK_LENGTH;

/// Per-piece bytes of block state: one bit per block, eight blocks per byte.
fn block_bytes(piece_length: u32) -> usize {
    (piece_length as usize).div_ceil(8 * BLOCK_LENGTH as usize)
}

#[derive(Debug)]
pub struct ResumeFile {
    mmap: MmapMut,
    npieces: usize,
    piece_block_bytes: usize,
}

impl ResumeFile {
    pub fn expected_len(npieces: usize, piece_length: u32) -> usize {
        npieces.div_ceil(8) + npieces * block_bytes(piece_length)
    }

    /// Map an existing resume file. A size mismatch means the file belongs
    /// to different metainfo and the torrent refuses to load.
    pub fn open(path: &Path, npieces: usize, piece_length: u32) -> Result<Self, Error> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let expected = Self::expected_len(npieces, piece_length);
        if len != expected as u64 {
            return Err(Error::Config(format!(
                "resume file {} has size {len}, expected {expected}",
                path.display()
            )));
        }
        let mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| Error::Resource(format!("mmap of {} failed: {e}", path.display())))?;
        Ok(Self {
            mmap,
            npieces,
            piece_block_bytes: block_bytes(piece_length),
        })
    }

    /// Create a fresh zeroed resume file and map it.
    pub fn create(path: &Path, npieces: usize, piece_length: u32) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(Self::expected_len(npieces, piece_length) as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| Error::Resource(format!("mmap of {} failed: {e}", path.display())))?;
        Ok(Self {
            mmap,
            npieces,
            piece_block_bytes: block_bytes(piece_length),
        })
    }

    pub fn load_or_create(path: &Path, npieces: usize, piece_length: u32) -> Result<Self, Error> {
        if path.exists() {
            Self::open(path, npieces, piece_length)
        } else {
            Self::create(path, npieces, piece_length)
        }
    }

    fn have_len(&self) -> usize {
        self.npieces.div_ceil(8)
    }

    /// Snapshot of the verified-piece bits.
    pub fn have_field(&self) -> BitField {
        BitField::new(&self.mmap[..self.have_len()])
    }

    pub fn set_have(&mut self, piece: u32) {
        debug_assert!((piece as usize) < self.npieces);
        self.mmap[piece as usize / 8] |= 0x80 >> (piece % 8);
    }

    fn block_offset(&self, piece: u32) -> usize {
        self.have_len() + piece as usize * self.piece_block_bytes
    }

    /// Snapshot of the on-disk block bits for one piece.
    pub fn blocks(&self, piece: u32) -> BitField {
        let start = self.block_offset(piece);
        BitField::new(&self.mmap[start..start + self.piece_block_bytes])
    }

    pub fn set_block(&mut self, piece: u32, block: u32) {
        let at = self.block_offset(piece) + block as usize / 8;
        self.mmap[at] |= 0x80 >> (block % 8);
    }

    /// Wipe a piece's block bits after a hash mismatch.
    pub fn clear_blocks(&mut self, piece: u32) {
        let start = self.block_offset(piece);
        self.mmap[start..start + self.piece_block_bytes].fill(0);
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.mmap.flush()
    }
}
