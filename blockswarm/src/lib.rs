//! A small peer-to-peer block transfer engine.
//!
//! Content is split into fixed size pieces, each of which is split into
//! fixed size blocks. Peers exchange blocks over the BitTorrent peer wire
//! protocol and each piece is verified against its expected digest once all
//! its blocks have arrived. Progress is persisted so that transfers can
//! resume after a restart.

#[macro_use]
extern crate serde_derive;

#[macro_use]
mod peer;
pub mod client;
pub mod conf;
pub mod error;
pub mod metainfo;
pub mod store;
mod tracker;

use bitvec::prelude::{BitVec, Msb0};

pub use {
    client::Client,
    peer::{Message, PeerHandle},
};

pub type PeerId = [u8; 20];
pub type Sha1Hash = [u8; 20];

/// The index of a piece within the transfer.
pub type PieceIndex = usize;

/// The bitfield represents piece availability. It is a compact bool vector of
/// most significant bits to least significants bits, that is, where the first
/// highest bit represents the first piece, the second highest element the
/// second piece, and so on (e.g. `0b1100_0001` would mean pieces 0, 1, and
/// 7). A truthy value of a piece's position in this vector means that the
/// piece is owned, while a falsy value means it isn't.
///
/// The same type is used for the per-piece block trackers, in which case each
/// bit stands for one block slot of the piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// This is the only block length we're dealing with (16 KiB). The only block
/// that may be shorter is the last block of the last piece.
pub const BLOCK_LEN: u32 = 0x4000;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of the transfer. Both serving and receiving happen at this block
/// level granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes.
    pub len: u32,
}

impl BlockInfo {
    /// Returns the index of the block within its piece, assuming the offset
    /// is aligned to the block length.
    pub fn index_in_piece(&self) -> usize {
        (self.offset / BLOCK_LEN) as usize
    }
}

/// Returns the number of blocks in a piece of the given length.
pub(crate) fn block_count(piece_len: u32) -> usize {
    // all but the last piece are a multiple of the block length, but the
    // last piece may be shorter so we need to account for this by rounding
    // up before dividing to get the number of blocks in piece
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}

/// Returns the length of the block at the index in piece.
///
/// If the piece is not a multiple of the default block length, the returned
/// value is smaller for the last block.
///
/// # Panics
///
/// Panics if the index multiplied by the default block length would exceed the
/// piece length.
pub(crate) fn block_len(piece_len: u32, block_index: usize) -> u32 {
    let block_index = block_index as u32;
    let block_offset = block_index * BLOCK_LEN;
    assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_count() {
        assert_eq!(block_count(0), 0);
        assert_eq!(block_count(1), 1);
        assert_eq!(block_count(BLOCK_LEN), 1);
        assert_eq!(block_count(BLOCK_LEN + 1), 2);
        assert_eq!(block_count(16 * BLOCK_LEN), 16);
    }

    #[test]
    fn test_block_len() {
        let piece_len = 2 * BLOCK_LEN + 1000;
        assert_eq!(block_len(piece_len, 0), BLOCK_LEN);
        assert_eq!(block_len(piece_len, 1), BLOCK_LEN);
        assert_eq!(block_len(piece_len, 2), 1000);
    }

    #[test]
    fn test_block_index_in_piece() {
        let block = BlockInfo {
            piece_index: 3,
            offset: 5 * BLOCK_LEN,
            len: BLOCK_LEN,
        };
        assert_eq!(block.index_in_piece(), 5);
    }
}
