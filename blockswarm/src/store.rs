//! The piece store owns the authoritative copy of all pieces of a transfer,
//! as well as the bookkeeping of which pieces are verified and which blocks
//! of the in-progress pieces have arrived.

mod persist;
mod piece;

pub use {
    persist::{FilePersister, MemoryPersister, Persister},
    piece::{
        combine_pieces, encode_digest, hash_bytes, piece_count, piece_len_at,
        split_into_pieces, Block, Piece, DIGEST_LEN,
    },
};

use std::{collections::HashMap, fmt, path::Path};

use crate::{
    block_count, block_len, error::*, metainfo::Metainfo, BlockInfo, Bitfield,
    PieceIndex, BLOCK_LEN,
};

/// The reason a block request or delivery was refused.
///
/// Refusals are never sent to the remote peer, as the protocol has no
/// negative acknowledgement: the requester has to time out and re-request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestDenied {
    /// The piece index is outside the transfer.
    InvalidPieceIndex,
    /// The piece is not verified locally, so it can't be served.
    PieceNotOwned,
    /// The offset is not a multiple of the block length.
    MisalignedOffset,
    /// The offset is past the end of the piece.
    InvalidOffset,
    /// The length is not that of the block at the offset.
    InvalidLength,
}

impl fmt::Display for RequestDenied {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use RequestDenied::*;
        match self {
            InvalidPieceIndex => write!(fmt, "invalid piece index"),
            PieceNotOwned => write!(fmt, "piece not owned"),
            MisalignedOffset => write!(fmt, "misaligned block offset"),
            InvalidOffset => write!(fmt, "invalid block offset"),
            InvalidLength => write!(fmt, "invalid block length"),
        }
    }
}

/// The outcome of recording an incoming block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockWrite {
    /// The block violated the block policy and was dropped.
    Denied(RequestDenied),
    /// The piece is already verified, the block was dropped.
    AlreadyOwned,
    /// The block was stored but its piece still misses blocks.
    Stored,
    /// This was the last missing block and the piece matched its expected
    /// hash. The piece is now owned.
    PieceVerified,
    /// This was the last missing block but the piece did not match its
    /// expected hash. The piece's progress was discarded.
    PieceCorrupt,
}

/// The persisted form of the store.
#[derive(Serialize, Deserialize)]
struct State {
    piece_count: usize,
    pieces: Vec<Piece>,
    /// The raw bytes of the completion bitfield.
    completed: Vec<u8>,
}

pub struct PieceStore {
    /// The expected textual digest of each piece, from the metainfo.
    piece_hashes: Vec<String>,
    /// The nominal length of a piece.
    piece_len: u32,
    /// The length of the whole content.
    download_len: u64,
    /// All pieces, in index order. Block slots of pieces that haven't arrived
    /// yet are empty.
    pieces: Vec<Piece>,
    /// The global completion set: the pieces that are verified.
    own_pieces: Bitfield,
    /// The block trackers of the pieces that are in progress.
    ///
    /// A piece never has an entry here while it's set in `own_pieces`.
    in_progress: HashMap<PieceIndex, Bitfield>,
}

impl PieceStore {
    /// Creates an empty store: no piece is owned and all block slots are
    /// unset.
    pub fn new(piece_hashes: Vec<String>, piece_len: u32, download_len: u64) -> Self {
        let piece_count = piece_hashes.len();
        debug_assert_eq!(piece_count, piece::piece_count(piece_len, download_len));
        let pieces = (0..piece_count)
            .map(|index| {
                let len = piece_len_at(index, piece_len, download_len).unwrap_or(0);
                Piece::empty(block_count(len))
            })
            .collect();
        Self {
            piece_hashes,
            piece_len,
            download_len,
            pieces,
            own_pieces: Bitfield::repeat(false, piece_count),
            in_progress: HashMap::new(),
        }
    }

    pub fn from_metainfo(metainfo: &Metainfo) -> Self {
        Self::new(
            metainfo.piece_hashes(),
            metainfo.piece_len,
            metainfo.download_len,
        )
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Returns the length of the piece at the index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        piece_len_at(index, self.piece_len, self.download_len)
            .ok_or(Error::InvalidPieceIndex)
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    /// The global completion set.
    pub fn own_pieces(&self) -> &Bitfield {
        &self.own_pieces
    }

    pub fn has_piece(&self, index: PieceIndex) -> bool {
        index < self.own_pieces.len() && self.own_pieces[index]
    }

    pub fn is_complete(&self) -> bool {
        self.own_pieces.all()
    }

    /// Returns whether the piece has a block tracker, i.e. some but not all of
    /// its blocks arrived since it was started.
    pub fn is_in_progress(&self, index: PieceIndex) -> bool {
        self.in_progress.contains_key(&index)
    }

    /// Returns the number of bytes still missing.
    pub fn left(&self) -> u64 {
        (0..self.piece_count())
            .filter(|i| !self.own_pieces[*i])
            .filter_map(|i| self.piece_len(i).ok())
            .map(u64::from)
            .sum()
    }

    /// Splits the content at the path into pieces, replaces the stored pieces
    /// with them, and marks every piece that matches its expected hash as
    /// verified. Returns the number of verified pieces.
    ///
    /// Fails if the content can't be read or if its piece layout is different
    /// from that of the metainfo.
    pub fn seed(&mut self, path: &Path) -> Result<usize> {
        let pieces = split_into_pieces(path, self.piece_len)?;
        if pieces.len() != self.piece_count()
            || pieces.iter().map(Piece::len).sum::<usize>() as u64 != self.download_len
        {
            log::warn!(
                "Content {:?} has {} pieces, expected {}",
                path,
                pieces.len(),
                self.piece_count()
            );
            return Err(Error::ContentMismatch);
        }

        self.pieces = pieces;
        self.in_progress.clear();
        for index in 0..self.piece_count() {
            let is_valid = self.pieces[index].hash() == self.piece_hashes[index];
            if !is_valid {
                log::warn!("Piece {} of {:?} does not match its hash", index, path);
            }
            self.own_pieces.set(index, is_valid);
        }

        let count = self.own_pieces.count_ones();
        log::info!(
            "Seeding {} of {} piece(s) from {:?}",
            count,
            self.piece_count(),
            path
        );
        Ok(count)
    }

    /// Writes the concatenation of all pieces to the path.
    pub fn write_content(&self, path: &Path) -> Result<()> {
        combine_pieces(path, &self.pieces)
    }

    /// Checks that the block is within policy: the piece exists, the offset
    /// is a multiple of the block length and the length is exactly that of the
    /// block slot at the offset (which is [`BLOCK_LEN`] for all but the last
    /// block of the last piece). Returns the index of the block in its piece.
    fn validate_block(&self, block: &BlockInfo) -> Result<usize, RequestDenied> {
        let piece_len = self
            .piece_len(block.piece_index)
            .map_err(|_| RequestDenied::InvalidPieceIndex)?;
        if block.offset % BLOCK_LEN != 0 {
            return Err(RequestDenied::MisalignedOffset);
        }
        if block.offset >= piece_len {
            return Err(RequestDenied::InvalidOffset);
        }
        let index = block.index_in_piece();
        if block.len != block_len(piece_len, index) {
            return Err(RequestDenied::InvalidLength);
        }
        Ok(index)
    }

    /// Records a block received from a peer.
    ///
    /// Blocks that are not within policy are dropped without changing any
    /// state. Once all slots of the piece are filled, the piece is hashed: if
    /// it matches its expected hash, it's marked verified, otherwise its
    /// block tracker is discarded and the whole piece has to be downloaded
    /// again.
    ///
    /// Only the first `block.len` bytes of `data` are stored.
    pub fn record_block(&mut self, block: BlockInfo, data: &[u8]) -> BlockWrite {
        let block_index = match self.validate_block(&block) {
            Ok(index) => index,
            Err(reason) => {
                log::debug!("Dropping block {:?}: {}", block, reason);
                return BlockWrite::Denied(reason);
            }
        };
        if data.len() < block.len as usize {
            log::debug!(
                "Dropping block {:?}: only {} bytes of data",
                block,
                data.len()
            );
            return BlockWrite::Denied(RequestDenied::InvalidLength);
        }

        let index = block.piece_index;
        if self.own_pieces[index] {
            log::trace!("Piece {} already verified, dropping block", index);
            return BlockWrite::AlreadyOwned;
        }

        let piece = &mut self.pieces[index];
        piece.set_block(block_index, &data[..block.len as usize]);

        let block_count = piece.block_count();
        let tracker = self
            .in_progress
            .entry(index)
            .or_insert_with(|| Bitfield::repeat(false, block_count));
        tracker.set(block_index, true);
        if !tracker.all() {
            return BlockWrite::Stored;
        }

        // the tracker is moot from here on regardless of the hash result
        self.in_progress.remove(&index);
        if piece.hash() == self.piece_hashes[index] {
            log::info!("Piece {} is valid", index);
            self.own_pieces.set(index, true);
            BlockWrite::PieceVerified
        } else {
            log::warn!("Piece {} is NOT valid, discarding its blocks", index);
            BlockWrite::PieceCorrupt
        }
    }

    /// Returns the block for serving to a peer, or the reason for refusing.
    ///
    /// Only blocks of verified pieces are served, even if all blocks of a
    /// piece happen to be present.
    pub fn serve_block(&self, block: &BlockInfo) -> Result<&[u8], RequestDenied> {
        let block_index = self.validate_block(block)?;
        if !self.own_pieces[block.piece_index] {
            return Err(RequestDenied::PieceNotOwned);
        }
        self.pieces[block.piece_index]
            .block(block_index)
            .ok_or(RequestDenied::InvalidOffset)
    }

    /// Returns the textual digest of the piece at the index.
    pub fn hash_of(&self, index: PieceIndex) -> Result<String> {
        self.pieces
            .get(index)
            .map(Piece::hash)
            .ok_or(Error::InvalidPieceIndex)
    }

    /// Returns whether the peer has a piece that we don't.
    pub fn is_interested_in(&self, peer_pieces: &Bitfield) -> bool {
        (0..self.piece_count())
            .any(|i| !self.own_pieces[i] && bit(peer_pieces, i))
    }

    /// Picks at most `count` blocks to request from a peer that has the
    /// given pieces.
    ///
    /// Blocks of pieces we own, blocks that already arrived for in-progress
    /// pieces, and blocks for which `is_pending` returns true are skipped.
    /// Pieces are picked in index order, and earlier pieces are finished
    /// before new ones are started.
    pub fn pick_blocks(
        &self,
        peer_pieces: &Bitfield,
        count: usize,
        is_pending: impl Fn(&BlockInfo) -> bool,
    ) -> Vec<BlockInfo> {
        let mut blocks = Vec::new();
        if count == 0 {
            return blocks;
        }

        for index in 0..self.piece_count() {
            if self.own_pieces[index] || !bit(peer_pieces, index) {
                continue;
            }
            let piece_len = match self.piece_len(index) {
                Ok(len) => len,
                Err(_) => continue,
            };
            let tracker = self.in_progress.get(&index);
            for block_index in 0..block_count(piece_len) {
                if tracker.map(|t| t[block_index]).unwrap_or(false) {
                    continue;
                }
                let block = BlockInfo {
                    piece_index: index,
                    offset: block_index as u32 * BLOCK_LEN,
                    len: block_len(piece_len, block_index),
                };
                if is_pending(&block) {
                    continue;
                }
                blocks.push(block);
                if blocks.len() == count {
                    return blocks;
                }
            }
        }

        blocks
    }

    /// Serializes all pieces and the completion set into an opaque blob.
    pub fn persist(&self) -> Result<Vec<u8>> {
        let state = State {
            piece_count: self.piece_count(),
            pieces: self.pieces.clone(),
            completed: self.own_pieces.as_raw_slice().to_vec(),
        };
        Ok(bincode::serialize(&state)?)
    }

    /// Restores the pieces and the completion set from a blob produced by
    /// [`PieceStore::persist`]. An empty blob is a fresh start and leaves the
    /// store untouched.
    ///
    /// Pieces marked complete in the blob are verified again and are reset if
    /// they no longer match their hash.
    pub fn restore(&mut self, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            log::debug!("No state to restore");
            return Ok(());
        }

        let state: State = bincode::deserialize(buf)?;
        if state.piece_count != self.piece_count()
            || state.pieces.len() != self.piece_count()
        {
            log::warn!(
                "Persisted state has {} pieces, expected {}",
                state.piece_count,
                self.piece_count()
            );
            return Err(Error::ContentMismatch);
        }

        let mut completed = Bitfield::from_vec(state.completed);
        completed.resize(self.piece_count(), false);

        self.pieces = state.pieces;
        self.in_progress.clear();
        for index in 0..self.piece_count() {
            let expected_blocks = self.piece_len(index).map(block_count)?;
            if self.pieces[index].block_count() != expected_blocks {
                self.pieces[index] = Piece::empty(expected_blocks);
                completed.set(index, false);
                continue;
            }
            if completed[index] && self.pieces[index].hash() != self.piece_hashes[index] {
                log::warn!("Restored piece {} does not match its hash", index);
                completed.set(index, false);
            }
        }
        self.own_pieces = completed;

        log::info!(
            "Restored {} of {} verified piece(s)",
            self.own_pieces.count_ones(),
            self.piece_count()
        );
        Ok(())
    }
}

/// Returns the bit at the index, or false if it's out of bounds.
fn bit(bitfield: &Bitfield, index: usize) -> bool {
    bitfield.get(index).map(|b| *b).unwrap_or(false)
}
