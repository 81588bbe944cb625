use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use rand::{distributions::Alphanumeric, Rng};

use crate::PeerId;

/// The prefix of every client id generated by this crate, in the Azureus
/// style (`-<client code><version>-`).
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-BS0100-";

/// The global configuration of a client.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the default configuration with the given directory for the
    /// persisted transfer state.
    ///
    /// A fresh client id is generated and the listen address is an ephemeral
    /// port on all interfaces.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: generate_client_id(),
                listen_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
                state_dir: state_dir.into(),
            },
            torrent: TorrentConf::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The id advertised to peers in the handshake and to the tracker.
    pub client_id: PeerId,
    /// The address on which inbound connections are accepted.
    pub listen_addr: SocketAddr,
    /// The directory in which the transfer state is persisted.
    pub state_dir: PathBuf,
}

#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// If no message is received from a peer for this long, the peer is
    /// disconnected. Keep alive messages are sent at half this interval.
    pub peer_timeout: Duration,
    /// The upper bound on establishing an outbound TCP connection.
    pub dial_timeout: Duration,
    /// The upper bound on receiving the peer's handshake.
    pub handshake_timeout: Duration,
    /// How often the tracker is contacted if it doesn't say otherwise.
    pub announce_interval: Duration,
    /// The number of block requests kept outstanding per peer.
    pub request_queue_len: usize,
    /// Requests not served within this window are forgotten so that the
    /// blocks may be requested again.
    pub request_timeout: Duration,
}

impl TorrentConf {
    /// The interval at which keep alive messages are sent to peers.
    pub fn keep_alive_interval(&self) -> Duration {
        self.peer_timeout / 2
    }
}

impl Default for TorrentConf {
    fn default() -> Self {
        Self {
            peer_timeout: Duration::from_millis(2000),
            dial_timeout: Duration::from_millis(100),
            handshake_timeout: Duration::from_millis(2000),
            announce_interval: Duration::from_secs(1),
            request_queue_len: 16,
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Generates a client id: the fixed prefix followed by random alphanumeric
/// characters.
pub fn generate_client_id() -> PeerId {
    let mut id = [0; 20];
    id[..CLIENT_ID_PREFIX.len()].copy_from_slice(CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for b in id[CLIENT_ID_PREFIX.len()..].iter_mut() {
        *b = rng.sample(Alphanumeric);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let conf = Conf::new("/tmp");
        assert_eq!(conf.torrent.peer_timeout, Duration::from_millis(2000));
        assert_eq!(conf.torrent.dial_timeout, Duration::from_millis(100));
        assert_eq!(
            conf.torrent.keep_alive_interval(),
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn test_generate_client_id() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert_eq!(&a[..8], CLIENT_ID_PREFIX);
        assert!(a[8..].iter().all(|b| b.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
