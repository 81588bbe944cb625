use std::{fs, path::Path};

use base64::{engine::general_purpose::URL_SAFE, Engine};
use sha1::{Digest, Sha1};

use crate::{block_count, error::*, BLOCK_LEN};

/// The length of a piece digest in bytes, before textual encoding.
pub const DIGEST_LEN: usize = 20;

/// A block's bytes. Unset block slots are empty.
pub type Block = Vec<u8>;

/// An ordered sequence of block slots.
///
/// A piece is created empty, with all its block slots unset, and is filled
/// block by block, either from the content on disk or from the network.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Piece {
    blocks: Vec<Block>,
}

impl Piece {
    /// Creates a piece with the given number of unset block slots.
    pub fn empty(block_count: usize) -> Self {
        let mut blocks = Vec::new();
        blocks.resize_with(block_count, Block::new);
        Self { blocks }
    }

    /// Creates a piece from its raw bytes, splitting them into blocks.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            blocks: buf
                .chunks(BLOCK_LEN as usize)
                .map(|chunk| chunk.to_vec())
                .collect(),
        }
    }

    /// Returns the block slots of this piece, in order.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Returns the block at the given slot, if the slot exists.
    pub fn block(&self, index: usize) -> Option<&[u8]> {
        self.blocks.get(index).map(|b| b.as_slice())
    }

    /// Returns the number of block slots.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Returns the summed length of all blocks currently in the piece.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrites the block slot at the index.
    ///
    /// # Panics
    ///
    /// Panics if the slot doesn't exist.
    pub(crate) fn set_block(&mut self, index: usize, data: &[u8]) {
        let slot = &mut self.blocks[index];
        slot.clear();
        slot.extend_from_slice(data);
    }

    /// Returns the textual digest of the concatenation of all blocks.
    pub fn hash(&self) -> String {
        let mut hasher = Sha1::new();
        for block in self.blocks.iter() {
            hasher.update(block);
        }
        encode_digest(&hasher.finalize())
    }
}

/// Returns the textual digest of the given bytes, the same way
/// [`Piece::hash`] does.
pub fn hash_bytes(buf: &[u8]) -> String {
    encode_digest(&Sha1::digest(buf))
}

/// Encodes the first 20 bytes of a digest as URL-safe base64.
pub fn encode_digest(digest: &[u8]) -> String {
    let len = digest.len().min(DIGEST_LEN);
    URL_SAFE.encode(&digest[..len])
}

/// Returns the number of pieces needed to hold `total_len` bytes.
pub fn piece_count(piece_len: u32, total_len: u64) -> usize {
    if piece_len == 0 {
        return 0;
    }
    let piece_len = piece_len as u64;
    ((total_len + piece_len - 1) / piece_len) as usize
}

/// Returns the actual length of the piece at the index, which is the nominal
/// piece length for all but the last piece.
///
/// Returns `None` if the index is outside the transfer.
pub fn piece_len_at(index: usize, piece_len: u32, total_len: u64) -> Option<u32> {
    let count = piece_count(piece_len, total_len);
    if index >= count {
        return None;
    }
    if index == count - 1 {
        let rem = total_len % piece_len as u64;
        if rem != 0 {
            return Some(rem as u32);
        }
    }
    Some(piece_len)
}

/// Reads the full content at the path and splits it into pieces of
/// `piece_len` bytes and blocks of [`BLOCK_LEN`] bytes. Only the last piece
/// and its last block may be shorter.
pub fn split_into_pieces(path: &Path, piece_len: u32) -> Result<Vec<Piece>> {
    if piece_len == 0 {
        return Err(Error::InvalidMetainfo);
    }
    let content = fs::read(path).map_err(|e| {
        log::warn!("Failed to read content {:?}: {}", path, e);
        Error::Io(e)
    })?;

    let count = piece_count(piece_len, content.len() as u64);
    log::debug!(
        "Splitting {} bytes of {:?} into {} piece(s)",
        content.len(),
        path,
        count
    );

    let pieces: Vec<_> = content
        .chunks(piece_len as usize)
        .map(Piece::from_bytes)
        .collect();
    debug_assert_eq!(pieces.len(), count);
    debug_assert!(pieces.iter().enumerate().all(|(i, p)| {
        let len = piece_len_at(i, piece_len, content.len() as u64);
        len.map(block_count) == Some(p.block_count())
    }));

    Ok(pieces)
}

/// Concatenates the blocks of all pieces in order and writes them to the path.
pub fn combine_pieces(path: &Path, pieces: &[Piece]) -> Result<()> {
    let len = pieces.iter().map(Piece::len).sum();
    let mut content = Vec::with_capacity(len);
    for block in pieces.iter().flat_map(|p| p.blocks.iter()) {
        content.extend_from_slice(block);
    }
    fs::write(path, &content).map_err(|e| {
        log::warn!("Failed to write content {:?}: {}", path, e);
        Error::Io(e)
    })
}
