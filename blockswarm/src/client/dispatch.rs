//! Routes the messages of connected peers to the piece store and the peer
//! registry, and drives the download from the resulting state changes.
//!
//! Everything here runs under the client's lock.

use std::{collections::HashSet, net::SocketAddr, time::Instant};

use crate::{
    peer::{error::PeerError, Message},
    store::BlockWrite,
    BlockInfo, PieceIndex,
};

use super::State;

impl State {
    /// Tells a newly registered peer which pieces we have.
    pub(super) fn on_connected(&mut self, addr: SocketAddr) {
        if let Some(peer) = self.peers.get(&addr) {
            peer_info!(
                addr,
                "Connected to client {}",
                String::from_utf8_lossy(&peer.id[..8])
            );
            let own_pieces = self.store.own_pieces();
            if own_pieces.any() {
                peer.send(Message::Bitfield(own_pieces.clone()));
            }
        }
    }

    /// Lets the remaining peers pick up the requests of a removed peer.
    pub(super) fn on_disconnected(&mut self) {
        for addr in self.peers.addrs() {
            self.make_requests(addr);
        }
    }

    /// Announces all our pieces to all peers, for when pieces were added
    /// other than by download.
    pub(super) fn announce_own_pieces(&mut self) {
        for index in (0..self.store.piece_count()).filter(|i| self.store.has_piece(*i)) {
            for peer in self.peers.iter() {
                peer.send(Message::Have {
                    piece_index: index as u32,
                });
            }
        }
        for addr in self.peers.addrs() {
            self.update_interest(addr);
        }
    }

    /// Handles a message of the peer.
    ///
    /// Returns the index of the piece the message completed, if any. An error
    /// means that the peer broke the protocol and must be disconnected.
    pub(super) fn dispatch(
        &mut self,
        addr: SocketAddr,
        msg: Message,
    ) -> Result<Option<PieceIndex>, PeerError> {
        let peer = match self.peers.get_mut(&addr) {
            Some(peer) => peer,
            None => {
                peer_debug!(addr, "Dropping message of unregistered peer");
                return Ok(None);
            }
        };
        peer_trace!(addr, "Received {:?}", msg.id());

        match msg {
            Message::KeepAlive => {
                // requests may have expired in the meantime
                self.make_requests(addr);
            }
            Message::Choke => {
                if !peer.status.is_choked {
                    peer_info!(addr, "Peer choked us");
                    peer.status.is_choked = true;
                    // the peer drops our pending requests when choking us
                    peer.outgoing_requests.clear();
                }
            }
            Message::Unchoke => {
                if peer.status.is_choked {
                    peer_info!(addr, "Peer unchoked us");
                    peer.status.is_choked = false;
                    self.make_requests(addr);
                }
            }
            Message::Interested => {
                peer.status.is_peer_interested = true;
                if peer.status.is_peer_choked {
                    peer_info!(addr, "Peer became interested, unchoking");
                    peer.status.is_peer_choked = false;
                    peer.send(Message::Unchoke);
                }
            }
            Message::NotInterested => {
                peer.status.is_peer_interested = false;
                if !peer.status.is_peer_choked {
                    peer_info!(addr, "Peer no longer interested, choking");
                    peer.status.is_peer_choked = true;
                    peer.send(Message::Choke);
                }
            }
            Message::Have { piece_index } => {
                let index = piece_index as usize;
                if index >= self.store.piece_count() {
                    peer_warn!(addr, "Peer has invalid piece {}", index);
                    return Err(PeerError::InvalidPieceIndex);
                }
                peer.pieces.set(index, true);
                self.update_interest(addr);
            }
            Message::Bitfield(mut pieces) => {
                // the bitfield is padded to a full byte, and a peer that
                // sends fewer bytes simply doesn't have the rest
                pieces.resize(self.store.piece_count(), false);
                peer_info!(addr, "Peer has {} piece(s)", pieces.count_ones());
                peer.pieces = pieces;
                self.update_interest(addr);
            }
            Message::Request(block) => self.serve_request(addr, block),
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                let block = BlockInfo {
                    piece_index: piece_index as usize,
                    offset,
                    len: data.len() as u32,
                };
                return Ok(self.receive_block(addr, block, &data));
            }
            Message::Cancel(block) => {
                // blocks are served right away, so there is never anything
                // queued to cancel
                peer_debug!(addr, "Ignoring cancel of {:?}", block);
            }
        }

        Ok(None)
    }

    /// Serves the block if the peer is unchoked and the request is within
    /// policy. Refused requests are silently dropped.
    fn serve_request(&mut self, addr: SocketAddr, block: BlockInfo) {
        let peer = match self.peers.get(&addr) {
            Some(peer) => peer,
            None => return,
        };
        if peer.status.is_peer_choked {
            peer_debug!(addr, "Ignoring request of choked peer: {:?}", block);
            return;
        }
        match self.store.serve_block(&block) {
            Ok(data) => {
                peer_trace!(addr, "Serving {:?}", block);
                peer.send(Message::Piece {
                    piece_index: block.piece_index as u32,
                    offset: block.offset,
                    data: data.to_vec(),
                });
                self.uploaded += u64::from(block.len);
            }
            Err(reason) => {
                peer_debug!(addr, "Denying request {:?}: {}", block, reason);
            }
        }
    }

    /// Records the block and, if it completed a piece, announces the piece to
    /// all peers.
    fn receive_block(
        &mut self,
        addr: SocketAddr,
        block: BlockInfo,
        data: &[u8],
    ) -> Option<PieceIndex> {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.outgoing_requests.retain(|(b, _)| {
                b.piece_index != block.piece_index || b.offset != block.offset
            });
        }

        let verified = match self.store.record_block(block, data) {
            BlockWrite::Stored => {
                self.downloaded += u64::from(block.len);
                None
            }
            BlockWrite::PieceVerified => {
                self.downloaded += u64::from(block.len);
                peer_info!(addr, "Completed piece {}", block.piece_index);
                Some(block.piece_index)
            }
            BlockWrite::PieceCorrupt => {
                peer_warn!(
                    addr,
                    "Piece {} failed verification, downloading it again",
                    block.piece_index
                );
                None
            }
            BlockWrite::AlreadyOwned => {
                peer_trace!(addr, "Already have piece of {:?}", block);
                None
            }
            BlockWrite::Denied(reason) => {
                peer_debug!(addr, "Dropping block {:?}: {}", block, reason);
                None
            }
        };

        if let Some(index) = verified {
            for peer in self.peers.iter() {
                peer.send(Message::Have {
                    piece_index: index as u32,
                });
            }
            // we may no longer need some of the peers
            for addr in self.peers.addrs() {
                self.update_interest(addr);
            }
        }
        self.make_requests(addr);

        verified
    }

    /// Sends interested or not interested to the peer if whether it has
    /// pieces we lack changed.
    fn update_interest(&mut self, addr: SocketAddr) {
        let peer = match self.peers.get_mut(&addr) {
            Some(peer) => peer,
            None => return,
        };
        let is_interested = self.store.is_interested_in(&peer.pieces);
        if is_interested != peer.status.is_interested {
            peer.status.is_interested = is_interested;
            if is_interested {
                peer_info!(addr, "Became interested in peer");
                peer.send(Message::Interested);
            } else {
                peer_info!(addr, "No longer interested in peer");
                peer.send(Message::NotInterested);
                peer.outgoing_requests.clear();
            }
        }
        if is_interested {
            self.make_requests(addr);
        }
    }

    /// Fills the peer's request pipeline, if it has unchoked us and we're
    /// interested in it.
    ///
    /// Requests older than the request timeout are forgotten first, as a
    /// refused request is never answered.
    fn make_requests(&mut self, addr: SocketAddr) {
        let now = Instant::now();
        let timeout = self.conf.request_timeout;

        let free_slots = match self.peers.get_mut(&addr) {
            Some(peer) => {
                if peer.status.is_choked || !peer.status.is_interested {
                    return;
                }
                let prev_count = peer.outgoing_requests.len();
                peer.outgoing_requests.retain(|(_, requested_at)| {
                    now.duration_since(*requested_at) < timeout
                });
                let expired_count = prev_count - peer.outgoing_requests.len();
                if expired_count > 0 {
                    peer_debug!(addr, "{} request(s) timed out", expired_count);
                }
                self.conf
                    .request_queue_len
                    .saturating_sub(peer.outgoing_requests.len())
            }
            None => return,
        };
        if free_slots == 0 {
            return;
        }

        // blocks requested from any peer are not requested again
        let pending: HashSet<BlockInfo> = self
            .peers
            .iter()
            .flat_map(|peer| peer.outgoing_requests.iter())
            .filter(|(_, requested_at)| now.duration_since(*requested_at) < timeout)
            .map(|(block, _)| *block)
            .collect();

        let peer = match self.peers.get_mut(&addr) {
            Some(peer) => peer,
            None => return,
        };
        let blocks = self.store.pick_blocks(&peer.pieces, free_slots, |block| {
            pending.contains(block)
        });
        if !blocks.is_empty() {
            peer_trace!(addr, "Requesting {} block(s)", blocks.len());
        }
        for block in blocks {
            peer.outgoing_requests.push((block, now));
            peer.send(Message::Request(block));
        }
    }
}
