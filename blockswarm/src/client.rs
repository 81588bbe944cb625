//! The client owns one transfer: the piece store and the peer registry behind
//! a single lock, the listener accepting inbound peers, and the tracker
//! announce loop.

mod dispatch;

use std::{
    io,
    net::SocketAddr,
    path::Path,
    sync::Arc,
};

use futures::StreamExt;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch, Mutex, Notify},
    task::JoinHandle,
    time,
};

use crate::{
    conf::{Conf, TorrentConf},
    error::*,
    metainfo::Metainfo,
    peer::{
        codec::Handshake,
        error::PeerError,
        liveness,
        registry::{self, PeerRegistry},
        Message, Peer, PeerHandle, Socket, Stream,
    },
    store::{PieceStore, Persister},
    tracker::{Announce, Event, Tracker},
    Bitfield, PeerId, Sha1Hash,
};

/// The number of peers asked from the tracker in each announce.
const ANNOUNCE_PEER_COUNT: usize = 50;

/// A transfer client.
///
/// All methods take `&self`: the client may be shared between tasks. Shared
/// state is guarded by one lock, which is held for each message dispatch and
/// each persistence, but never across network IO.
pub struct Client {
    shared: Arc<Shared>,
}

/// The shared mutable state of a client.
pub(crate) struct State {
    store: PieceStore,
    peers: PeerRegistry,
    conf: TorrentConf,
    /// The number of payload bytes received in accepted blocks.
    downloaded: u64,
    /// The number of payload bytes served.
    uploaded: u64,
    /// The listener and the announce loop.
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    conf: Conf,
    metainfo: Metainfo,
    state: Mutex<State>,
    persister: Box<dyn Persister>,
    // the receivers are kept so that sending never fails for lack of them
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    complete_tx: watch::Sender<bool>,
    complete_rx: watch::Receiver<bool>,
}

impl Client {
    /// Creates the client of the transfer described by the metainfo and
    /// restores its state from the persister, if any was saved.
    ///
    /// The client doesn't accept connections until [`Client::start`] is
    /// called.
    pub fn new(
        conf: Conf,
        metainfo: Metainfo,
        persister: impl Persister + 'static,
    ) -> Result<Self> {
        let mut store = PieceStore::from_metainfo(&metainfo);
        if let Some(state) = persister.read_state()? {
            store.restore(&state)?;
        }
        let is_complete = store.is_complete();
        log::info!(
            "Transfer {} ({}) has {} of {} piece(s)",
            metainfo.name,
            hex::encode(&metainfo.info_hash),
            store.own_pieces().count_ones(),
            store.piece_count()
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (complete_tx, complete_rx) = watch::channel(is_complete);
        let state = State {
            store,
            peers: PeerRegistry::new(),
            conf: conf.torrent.clone(),
            downloaded: 0,
            uploaded: 0,
            tasks: Vec::new(),
        };

        Ok(Self {
            shared: Arc::new(Shared {
                conf,
                metainfo,
                state: Mutex::new(state),
                persister: Box::new(persister),
                shutdown_tx,
                shutdown_rx,
                complete_tx,
                complete_rx,
            }),
        })
    }

    pub fn info_hash(&self) -> Sha1Hash {
        self.shared.metainfo.info_hash
    }

    pub fn client_id(&self) -> PeerId {
        self.shared.conf.engine.client_id
    }

    pub fn metainfo(&self) -> &Metainfo {
        &self.shared.metainfo
    }

    /// Loads the content at the path, marks every piece that matches the
    /// metainfo as verified and persists the result. Returns the number of
    /// verified pieces.
    pub async fn seed_from(&self, path: impl AsRef<Path>) -> Result<usize> {
        let mut state = self.shared.state.lock().await;
        let count = state.store.seed(path.as_ref())?;
        state.announce_own_pieces();
        self.shared.persist(&state)?;
        self.shared.update_completion(&state);
        Ok(count)
    }

    /// Binds the listener and starts accepting peers, as well as announcing
    /// to the tracker if the transfer has one. Returns the listen address.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.shared.is_shut_down() {
            return Err(Error::Shutdown);
        }
        let listener = TcpListener::bind(self.shared.conf.engine.listen_addr).await?;
        let listen_addr = listener.local_addr()?;
        log::info!("Listening on {}", listen_addr);

        let mut state = self.shared.state.lock().await;
        let shared = Arc::clone(&self.shared);
        state.tasks.push(tokio::spawn(shared.run_listener(listener)));

        if let Some(url) = &self.shared.metainfo.announce {
            log::info!("Announcing to {}", url);
            let tracker = Tracker::new(url.clone());
            let shared = Arc::clone(&self.shared);
            state
                .tasks
                .push(tokio::spawn(shared.run_announcer(tracker, listen_addr)));
        }

        Ok(listen_addr)
    }

    /// Returns the handle of the peer at the address, connecting to it first
    /// if it's not yet connected.
    pub async fn connect(&self, addr: SocketAddr) -> Result<PeerHandle> {
        self.shared.connect(addr).await
    }

    /// Sends the message to the peer at the address, connecting to it first
    /// if needed.
    pub async fn send(&self, addr: SocketAddr, msg: Message) -> Result<()> {
        let handle = self.connect(addr).await?;
        handle.send(msg)?;
        Ok(())
    }

    /// Performs the handshake on an inbound connection and registers the
    /// peer. This is what the listener calls for each connection, but it may
    /// also be used with an externally accepted connection.
    pub async fn handle_inbound(&self, socket: TcpStream) -> Result<PeerHandle> {
        self.shared.handle_inbound(socket).await
    }

    /// Disconnects the peer at the address and forgets it. Returns whether it
    /// was connected.
    pub async fn remove(&self, addr: SocketAddr) -> bool {
        let mut state = self.shared.state.lock().await;
        let was_connected = state.peers.remove(&addr).is_some();
        if was_connected {
            state.on_disconnected();
        }
        was_connected
    }

    pub async fn is_complete(&self) -> bool {
        self.shared.state.lock().await.store.is_complete()
    }

    /// Returns the set of verified pieces.
    pub async fn have(&self) -> Bitfield {
        self.shared.state.lock().await.store.own_pieces().clone()
    }

    /// Returns the textual digest of the piece currently stored at the index.
    pub async fn hash_of(&self, index: usize) -> Result<String> {
        self.shared.state.lock().await.store.hash_of(index)
    }

    pub async fn peer_count(&self) -> usize {
        self.shared.state.lock().await.peers.len()
    }

    pub async fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.shared.state.lock().await.peers.addrs()
    }

    /// Returns once all pieces are verified.
    pub async fn wait_for_completion(&self) {
        let mut complete = self.shared.complete_rx.clone();
        while !*complete.borrow() {
            if complete.changed().await.is_err() {
                return;
            }
        }
    }

    /// Writes the concatenation of all pieces to the path.
    pub async fn write_content(&self, path: impl AsRef<Path>) -> Result<()> {
        let state = self.shared.state.lock().await;
        state.store.write_content(path.as_ref())
    }

    /// Stops the listener and the announce loop and disconnects all peers.
    ///
    /// The client can't be started again afterwards.
    pub async fn shutdown(&self) {
        log::info!("Shutting down");
        // the receiver is held by `Shared`, so this can't fail
        let _ = self.shared.shutdown_tx.send(true);
        let mut state = self.shared.state.lock().await;
        for task in state.tasks.drain(..) {
            task.abort();
        }
        state.peers.clear();
    }
}

impl Shared {
    fn is_shut_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn handshake(&self) -> Handshake {
        Handshake::new(self.metainfo.info_hash, self.conf.engine.client_id)
    }

    /// Saves the store's state through the persister.
    fn persist(&self, state: &State) -> Result<()> {
        let blob = state.store.persist()?;
        self.persister.save_state(&blob)?;
        log::debug!("Persisted {} byte state", blob.len());
        Ok(())
    }

    fn update_completion(&self, state: &State) {
        let is_complete = state.store.is_complete();
        if is_complete != *self.complete_rx.borrow() {
            if is_complete {
                log::info!("Transfer {} complete", self.metainfo.name);
            }
            let _ = self.complete_tx.send(is_complete);
        }
    }

    async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<PeerHandle> {
        if self.is_shut_down() {
            return Err(Error::Shutdown);
        }
        if let Some(handle) = self.state.lock().await.peers.begin_dial(addr)? {
            return Ok(handle);
        }
        let mut guard = DialGuard {
            shared: Arc::clone(self),
            addr,
            is_armed: true,
        };

        let res = registry::dial(addr, &self.conf.torrent, self.handshake()).await;

        let mut state = self.state.lock().await;
        state.peers.end_dial(addr);
        guard.is_armed = false;
        let (socket, peer_id) = res?;
        Ok(self.register(&mut state, addr, socket, peer_id)?)
    }

    async fn handle_inbound(self: &Arc<Self>, socket: TcpStream) -> Result<PeerHandle> {
        if self.is_shut_down() {
            return Err(Error::Shutdown);
        }
        let addr = socket.peer_addr()?;
        let (socket, peer_id) =
            registry::accept(socket, &self.conf.torrent, self.handshake()).await?;

        let mut state = self.state.lock().await;
        Ok(self.register(&mut state, addr, socket, peer_id)?)
    }

    /// Registers a peer whose handshake succeeded and spawns its tasks: the
    /// reader, the writer that also sends keep alives, and the receive timeout
    /// enforcer. Whichever task stops first removes the peer, which aborts the
    /// other two.
    ///
    /// Handshakes that finish after shutdown are dropped here: the flag is
    /// set before shutdown takes the lock to clear the peers.
    fn register(
        self: &Arc<Self>,
        state: &mut State,
        addr: SocketAddr,
        socket: Socket,
        peer_id: PeerId,
    ) -> Result<PeerHandle> {
        if self.is_shut_down() {
            peer_debug!(addr, "Shut down, dropping new connection");
            return Err(Error::Shutdown);
        }
        if state.peers.contains(&addr) {
            peer_debug!(addr, "Already connected, dropping new connection");
            return Err(PeerError::AlreadyConnected.into());
        }
        let session_id = state.peers.next_session_id();
        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = PeerHandle::new(addr, tx);
        let signal = Arc::new(Notify::new());

        let reader = {
            let shared = Arc::clone(self);
            let signal = Arc::clone(&signal);
            tokio::spawn(async move {
                let reason = shared.run_reader(addr, stream, signal).await;
                shared.disconnect(addr, session_id, reason).await;
            })
        };
        let writer = {
            let shared = Arc::clone(self);
            let interval = self.conf.torrent.keep_alive_interval();
            tokio::spawn(async move {
                let reason = liveness::run_writer(addr, sink, rx, interval).await;
                shared.disconnect(addr, session_id, reason).await;
            })
        };
        let enforcer = {
            let shared = Arc::clone(self);
            let timeout = self.conf.torrent.peer_timeout;
            tokio::spawn(async move {
                let reason = liveness::enforce_timeout(addr, signal, timeout).await;
                shared.disconnect(addr, session_id, reason).await;
            })
        };

        let peer = Peer::new(
            addr,
            peer_id,
            session_id,
            state.store.piece_count(),
            handle.clone(),
            vec![reader, writer, enforcer],
        );
        state.peers.insert(peer)?;
        state.on_connected(addr);

        Ok(handle)
    }

    /// Removes the peer if it's still the connection that the stopped task
    /// belonged to.
    async fn disconnect(&self, addr: SocketAddr, session_id: u64, reason: PeerError) {
        let mut state = self.state.lock().await;
        if state.peers.remove_session(&addr, session_id).is_some() {
            peer_info!(addr, "Disconnected: {}", reason);
            state.on_disconnected();
        }
    }

    /// Reads and dispatches the peer's messages in order, signalling liveness
    /// for each one, until the connection fails or the peer breaks the
    /// protocol.
    async fn run_reader(
        &self,
        addr: SocketAddr,
        mut stream: Stream,
        signal: Arc<Notify>,
    ) -> PeerError {
        loop {
            let msg = match stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    peer_warn!(addr, "Read failed: {}", e);
                    return e;
                }
                None => {
                    peer_info!(addr, "Connection closed by peer");
                    return PeerError::Io(io::ErrorKind::UnexpectedEof.into());
                }
            };
            signal.notify_one();

            let mut state = self.state.lock().await;
            match state.dispatch(addr, msg) {
                Ok(Some(_)) => {
                    // whole state is written each time a piece completes
                    if let Err(e) = self.persist(&state) {
                        log::warn!("Failed to persist state: {}", e);
                    }
                    self.update_completion(&state);
                }
                Ok(None) => {}
                Err(e) => return e,
            }
        }
    }

    async fn run_listener(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((socket, addr)) => {
                        peer_debug!(addr, "Inbound connection");
                        // the handshake may take a while, so it mustn't hold
                        // up the accept loop
                        let shared = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = shared.handle_inbound(socket).await {
                                peer_debug!(addr, "Inbound connection failed: {}", e);
                            }
                        });
                    }
                    Err(e) => log::warn!("Failed to accept connection: {}", e),
                },
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
        }
        log::debug!("Listener stopped");
    }

    async fn run_announcer(self: Arc<Self>, tracker: Tracker, listen_addr: SocketAddr) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut event = Some(Event::Started);
        let mut tracker_id = None;
        // the completed event is only sent if we started incomplete
        let mut was_complete = *self.complete_rx.borrow();

        while !*shutdown.borrow() {
            let is_complete = *self.complete_rx.borrow();
            if event.is_none() && is_complete && !was_complete {
                event = Some(Event::Completed);
            }

            let params = {
                let state = self.state.lock().await;
                Announce {
                    info_hash: self.metainfo.info_hash,
                    peer_id: self.conf.engine.client_id,
                    port: listen_addr.port(),
                    downloaded: state.downloaded,
                    uploaded: state.uploaded,
                    left: state.store.left(),
                    peer_count: Some(ANNOUNCE_PEER_COUNT),
                    tracker_id: tracker_id.clone(),
                    event,
                }
            };

            let interval = match tracker.announce(params).await {
                Ok(resp) => {
                    log::debug!(
                        "Tracker {} returned {} peer(s)",
                        tracker,
                        resp.peers.len()
                    );
                    let interval =
                        resp.next_announce_in(self.conf.torrent.announce_interval);
                    event = None;
                    was_complete = is_complete;
                    if resp.tracker_id.is_some() {
                        tracker_id = resp.tracker_id;
                    }
                    let new_peers: Vec<_> = {
                        let state = self.state.lock().await;
                        resp.peers
                            .into_iter()
                            .filter(|addr| {
                                !is_own_addr(*addr, listen_addr)
                                    && !state.peers.contains(addr)
                                    && !state.peers.is_dialing(addr)
                            })
                            .collect()
                    };
                    for addr in new_peers {
                        let shared = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = shared.connect(addr).await {
                                peer_debug!(addr, "Cannot connect: {}", e);
                            }
                        });
                    }
                    interval
                }
                Err(e) => {
                    log::warn!("Announce to {} failed: {}", tracker, e);
                    self.conf.torrent.announce_interval
                }
            };

            tokio::select! {
                _ = time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        log::debug!("Announce loop stopped");
    }
}

/// Clears the dial marker of an address if the future dialing it is dropped
/// before it could clear the marker itself.
struct DialGuard {
    shared: Arc<Shared>,
    addr: SocketAddr,
    is_armed: bool,
}

impl Drop for DialGuard {
    fn drop(&mut self) {
        if !self.is_armed {
            return;
        }
        let addr = self.addr;
        if let Ok(mut state) = self.shared.state.try_lock() {
            peer_debug!(addr, "Dial cancelled");
            state.peers.end_dial(addr);
            return;
        }
        // the lock can't be awaited here, so clear the marker once it's free
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let shared = Arc::clone(&self.shared);
            runtime.spawn(async move {
                peer_debug!(addr, "Dial cancelled");
                shared.state.lock().await.peers.end_dial(addr);
            });
        }
    }
}

/// Returns whether the tracker returned our own listen address.
fn is_own_addr(addr: SocketAddr, listen_addr: SocketAddr) -> bool {
    addr.port() == listen_addr.port()
        && (addr.ip() == listen_addr.ip()
            || addr.ip().is_loopback()
            || listen_addr.ip().is_unspecified())
}
