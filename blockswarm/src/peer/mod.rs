#[macro_use]
mod peer_log;
pub(crate) mod codec;
pub(crate) mod error;
pub(crate) mod liveness;
pub(crate) mod registry;

use std::{net::SocketAddr, time::Instant};

use futures::stream::{SplitSink, SplitStream};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_util::codec::Framed;

use crate::{Bitfield, BlockInfo, PeerId};

pub use codec::Message;
use codec::PeerCodec;
use error::PeerError;

/// A peer connection after the handshake.
pub(crate) type Socket = Framed<TcpStream, PeerCodec>;
pub(crate) type Sink = SplitSink<Socket, Message>;
pub(crate) type Stream = SplitStream<Socket>;

/// The status of a peer connection.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Status {
    /// If we're choked, peer doesn't allow us to download pieces from them.
    pub is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    pub is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    pub is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we have.
    pub is_peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
        }
    }
}

/// A cheaply clonable handle for sending messages to a connected peer.
///
/// Messages are queued and written to the connection in order by the peer's
/// writer task.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<Message>,
}

impl PeerHandle {
    pub(crate) fn new(addr: SocketAddr, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { addr, tx }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queues the message for sending. Fails if the connection is gone.
    pub fn send(&self, msg: Message) -> Result<(), PeerError> {
        self.tx.send(msg)?;
        Ok(())
    }
}

/// The registry entry of a connected peer.
///
/// The entry owns the peer's background tasks, which in turn own the two
/// halves of the connection. Dropping the entry aborts the tasks, which closes
/// the connection.
pub(crate) struct Peer {
    pub addr: SocketAddr,
    /// The id the peer sent us in its handshake.
    pub id: PeerId,
    /// Distinguishes this connection from earlier ones with the same address,
    /// so that a late teardown of an old connection doesn't remove a new one.
    pub session_id: u64,
    /// The pieces the peer claims to have.
    pub pieces: Bitfield,
    pub status: Status,
    /// The blocks we requested from the peer and when.
    pub outgoing_requests: Vec<(BlockInfo, Instant)>,
    handle: PeerHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Peer {
    pub fn new(
        addr: SocketAddr,
        id: PeerId,
        session_id: u64,
        piece_count: usize,
        handle: PeerHandle,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            addr,
            id,
            session_id,
            pieces: Bitfield::repeat(false, piece_count),
            status: Status::default(),
            outgoing_requests: Vec::new(),
            handle,
            tasks,
        }
    }

    pub fn handle(&self) -> &PeerHandle {
        &self.handle
    }

    /// Queues the message for the peer. A failure only means that the writer
    /// task is gone, which tears the peer down on its own, so it's only
    /// logged.
    pub fn send(&self, msg: Message) {
        peer_trace!(self.addr, "Sending {:?}", msg.id());
        if let Err(e) = self.handle.send(msg) {
            peer_debug!(self.addr, "Cannot send message: {}", e);
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        peer_debug!(self.addr, "Closing connection");
        for task in self.tasks.iter() {
            task.abort();
        }
    }
}
