use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
};

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, time};
use tokio_util::codec::{Framed, FramedParts};

use crate::{conf::TorrentConf, PeerId};

use super::{
    codec::{Handshake, HandshakeCodec, Message, PeerCodec},
    error::{PeerError, Result},
    Peer, PeerHandle, Socket,
};

/// The single source of truth of which peers we're connected to, keyed by
/// their address.
///
/// The registry itself doesn't perform any IO so that it may be kept behind
/// the client's lock. Connection attempts are marked in the registry for their
/// duration instead, which is how concurrent attempts to the same address are
/// excluded without holding the lock across the network round trips.
#[derive(Default)]
pub(crate) struct PeerRegistry {
    peers: HashMap<SocketAddr, Peer>,
    dialing: HashSet<SocketAddr>,
    next_session_id: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts an outbound connection attempt to the address.
    ///
    /// Returns the peer's handle if it's already connected, in which case
    /// there is nothing to do, or an error if another attempt is under way.
    /// Otherwise the attempt is marked and `None` is returned: the caller
    /// must then dial and finally call [`PeerRegistry::end_dial`].
    pub fn begin_dial(&mut self, addr: SocketAddr) -> Result<Option<PeerHandle>> {
        if let Some(peer) = self.peers.get(&addr) {
            return Ok(Some(peer.handle().clone()));
        }
        if !self.dialing.insert(addr) {
            return Err(PeerError::DialInProgress);
        }
        Ok(None)
    }

    pub fn end_dial(&mut self, addr: SocketAddr) {
        self.dialing.remove(&addr);
    }

    pub fn is_dialing(&self, addr: &SocketAddr) -> bool {
        self.dialing.contains(addr)
    }

    /// Returns a session id that was never handed out before.
    pub fn next_session_id(&mut self) -> u64 {
        self.next_session_id += 1;
        self.next_session_id
    }

    /// Registers a connected peer. Fails if the address is already taken, in
    /// which case the peer is dropped, closing its connection.
    pub fn insert(&mut self, peer: Peer) -> Result<()> {
        if self.peers.contains_key(&peer.addr) {
            return Err(PeerError::AlreadyConnected);
        }
        peer_info!(peer.addr, "Registered peer {}", String::from_utf8_lossy(&peer.id));
        self.peers.insert(peer.addr, peer);
        Ok(())
    }

    /// Removes the peer and closes its connection. Removing an unknown address
    /// is a no-op.
    pub fn remove(&mut self, addr: &SocketAddr) -> Option<Peer> {
        let peer = self.peers.remove(addr);
        if peer.is_some() {
            peer_info!(addr, "Removed peer");
        }
        peer
    }

    /// Removes the peer only if it's still the same connection.
    pub fn remove_session(&mut self, addr: &SocketAddr, session_id: u64) -> Option<Peer> {
        match self.peers.get(addr) {
            Some(peer) if peer.session_id == session_id => self.remove(addr),
            _ => None,
        }
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.peers.contains_key(addr)
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&Peer> {
        self.peers.get(addr)
    }

    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut Peer> {
        self.peers.get_mut(addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.peers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Removes all peers, closing their connections.
    pub fn clear(&mut self) {
        self.peers.clear();
        self.dialing.clear();
    }
}

/// Connects to the peer at the address and exchanges handshakes, sending
/// ours first.
///
/// Returns the connection, switched to the message codec, and the peer's id.
pub(crate) async fn dial(
    addr: SocketAddr,
    conf: &TorrentConf,
    ours: Handshake,
) -> Result<(Socket, PeerId)> {
    peer_debug!(addr, "Dialing");
    let socket = match time::timeout(conf.dial_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(socket)) => socket,
        Ok(Err(e)) => {
            peer_debug!(addr, "Dial failed: {}", e);
            return Err(PeerError::Dial(e));
        }
        Err(_) => {
            peer_debug!(addr, "Dial timed out");
            return Err(PeerError::DialTimeout);
        }
    };

    let mut socket = Framed::new(socket, HandshakeCodec);
    socket.send(ours).await?;
    let theirs = receive_handshake(&mut socket, conf).await?;
    validate_handshake(&ours, &theirs).map_err(|e| {
        peer_warn!(addr, "Rejecting handshake: {}", e);
        e
    })?;
    peer_debug!(addr, "Handshake complete");

    Ok((switch_codec(socket), theirs.peer_id))
}

/// Receives the handshake of a peer that connected to us and, if it's
/// acceptable, replies with ours.
///
/// A rejected connection is closed without a reply.
pub(crate) async fn accept(
    socket: TcpStream,
    conf: &TorrentConf,
    ours: Handshake,
) -> Result<(Socket, PeerId)> {
    let addr = socket.peer_addr()?;
    let mut socket = Framed::new(socket, HandshakeCodec);
    let theirs = receive_handshake(&mut socket, conf).await.map_err(|e| {
        peer_warn!(addr, "Invalid handshake: {}", e);
        e
    })?;
    validate_handshake(&ours, &theirs).map_err(|e| {
        peer_warn!(addr, "Rejecting handshake: {}", e);
        e
    })?;
    socket.send(ours).await?;
    peer_debug!(addr, "Handshake complete");

    Ok((switch_codec(socket), theirs.peer_id))
}

async fn receive_handshake(
    socket: &mut Framed<TcpStream, HandshakeCodec>,
    conf: &TorrentConf,
) -> Result<Handshake> {
    match time::timeout(conf.handshake_timeout, socket.next()).await {
        Ok(Some(handshake)) => handshake,
        Ok(None) => Err(PeerError::HandshakeRejected(
            "connection closed before handshake",
        )),
        Err(_) => Err(PeerError::HandshakeRejected("handshake timed out")),
    }
}

fn validate_handshake(ours: &Handshake, theirs: &Handshake) -> Result<()> {
    if theirs.info_hash != ours.info_hash {
        return Err(PeerError::InvalidInfoHash);
    }
    if theirs.peer_id.iter().all(|b| *b == 0) {
        return Err(PeerError::HandshakeRejected("empty peer id"));
    }
    if theirs.peer_id == ours.peer_id {
        return Err(PeerError::HandshakeRejected("connected to ourselves"));
    }
    Ok(())
}

/// Switches the connection to the message codec.
///
/// The peer may have sent messages right after its handshake, which are
/// already in the read buffer, so the buffers are carried over.
fn switch_codec(socket: Framed<TcpStream, HandshakeCodec>) -> Socket {
    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new::<Message>(old_parts.io, PeerCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    Framed::from_parts(new_parts)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;
    use tokio::{io::AsyncReadExt, io::AsyncWriteExt, net::TcpListener, sync::mpsc};
    use tokio_util::codec::Encoder;

    use super::*;

    const INFO_HASH: [u8; 20] = [0xab; 20];

    fn make_peer(addr: SocketAddr, session_id: u64) -> Peer {
        let (tx, _rx) = mpsc::unbounded_channel();
        Peer::new(
            addr,
            [1; 20],
            session_id,
            8,
            PeerHandle::new(addr, tx),
            Vec::new(),
        )
    }

    fn encode_handshake(handshake: Handshake) -> BytesMut {
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_begin_dial_excludes_concurrent_attempts() {
        let mut registry = PeerRegistry::new();
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();

        assert!(registry.begin_dial(addr).unwrap().is_none());
        assert!(registry.is_dialing(&addr));
        assert!(matches!(
            registry.begin_dial(addr),
            Err(PeerError::DialInProgress)
        ));
        registry.end_dial(addr);
        assert!(!registry.is_dialing(&addr));

        // a connected peer is returned as is
        let session_id = registry.next_session_id();
        registry.insert(make_peer(addr, session_id)).unwrap();
        let handle = registry.begin_dial(addr).unwrap().unwrap();
        assert_eq!(handle.addr(), addr);
        assert!(!registry.is_dialing(&addr));
    }

    #[test]
    fn test_insert_and_remove() {
        let mut registry = PeerRegistry::new();
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();

        let first = registry.next_session_id();
        registry.insert(make_peer(addr, first)).unwrap();
        let duplicate = make_peer(addr, registry.next_session_id());
        assert!(matches!(
            registry.insert(duplicate),
            Err(PeerError::AlreadyConnected)
        ));
        assert_eq!(registry.len(), 1);

        // removing is idempotent
        assert!(registry.remove(&addr).is_some());
        assert!(registry.remove(&addr).is_none());
        assert!(registry.is_empty());

        // an old session can't remove a newer connection
        let second = registry.next_session_id();
        assert_ne!(first, second);
        registry.insert(make_peer(addr, second)).unwrap();
        assert!(registry.remove_session(&addr, first).is_none());
        assert!(registry.contains(&addr));
        assert!(registry.remove_session(&addr, second).is_some());
        assert!(!registry.contains(&addr));
    }

    #[tokio::test]
    async fn test_dial_and_accept() {
        let conf = TorrentConf::default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = Handshake::new(INFO_HASH, [1; 20]);
        let acceptor = Handshake::new(INFO_HASH, [2; 20]);

        let accept_conf = conf.clone();
        let accepted = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            accept(socket, &accept_conf, acceptor).await
        });
        let (mut dialed, acceptor_id) = dial(addr, &conf, dialer).await.unwrap();
        let (mut accepted, dialer_id) = accepted.await.unwrap().unwrap();
        assert_eq!(acceptor_id, [2; 20]);
        assert_eq!(dialer_id, [1; 20]);

        // both sides now speak the message codec
        dialed.send(Message::Interested).await.unwrap();
        assert_eq!(accepted.next().await.unwrap().unwrap(), Message::Interested);
        accepted.send(Message::Unchoke).await.unwrap();
        assert_eq!(dialed.next().await.unwrap().unwrap(), Message::Unchoke);
    }

    // Tests that a message that arrives in the same segment as the handshake
    // survives the codec switch.
    #[tokio::test]
    async fn test_message_right_after_handshake_is_kept() {
        let conf = TorrentConf::default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut raw = TcpStream::connect(addr).await.unwrap();
        let mut buf = encode_handshake(Handshake::new(INFO_HASH, [1; 20]));
        PeerCodec.encode(Message::Have { piece_index: 3 }, &mut buf).unwrap();
        raw.write_all(&buf).await.unwrap();

        let (socket, _) = listener.accept().await.unwrap();
        let (mut socket, _) =
            accept(socket, &conf, Handshake::new(INFO_HASH, [2; 20]))
                .await
                .unwrap();
        assert_eq!(
            socket.next().await.unwrap().unwrap(),
            Message::Have { piece_index: 3 }
        );
    }

    #[tokio::test]
    async fn test_accept_rejects_invalid_handshakes() {
        let conf = TorrentConf::default();
        let ours = Handshake::new(INFO_HASH, [2; 20]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let cases = vec![
            // another transfer
            Handshake::new([0xcd; 20], [1; 20]),
            // empty peer id
            Handshake::new(INFO_HASH, [0; 20]),
            // ourselves
            Handshake::new(INFO_HASH, [2; 20]),
        ];
        for theirs in cases {
            let mut raw = TcpStream::connect(addr).await.unwrap();
            raw.write_all(&encode_handshake(theirs)).await.unwrap();

            let (socket, _) = listener.accept().await.unwrap();
            let res = accept(socket, &conf, ours).await;
            assert!(matches!(
                res,
                Err(PeerError::InvalidInfoHash)
                    | Err(PeerError::HandshakeRejected(_))
            ));

            // the connection is closed without a reply
            let mut buf = [0; 68];
            let n = raw.read(&mut buf).await.unwrap_or(0);
            assert_eq!(n, 0);
        }

        // garbage instead of a handshake
        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        assert!(matches!(
            accept(socket, &conf, ours).await,
            Err(PeerError::HandshakeRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_accept_times_out_silent_peer() {
        let mut conf = TorrentConf::default();
        conf.handshake_timeout = Duration::from_millis(100);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _raw = TcpStream::connect(addr).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        assert!(matches!(
            accept(socket, &conf, Handshake::new(INFO_HASH, [2; 20])).await,
            Err(PeerError::HandshakeRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_dial_failure() {
        // bind and drop to get a port that is very likely closed
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let res = dial(
            addr,
            &TorrentConf::default(),
            Handshake::new(INFO_HASH, [1; 20]),
        )
        .await;
        assert!(matches!(
            res,
            Err(PeerError::Dial(_)) | Err(PeerError::DialTimeout)
        ));
    }
}
