//! The two activities that keep a peer connection alive, or tear it down once
//! it's dead: the writer, which also emits keep alive messages, and the
//! receive timeout enforcer.
//!
//! Both return the reason they stopped. The caller is expected to remove the
//! peer at that point.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::SinkExt;
use tokio::{
    sync::{mpsc, Notify},
    time::{self, Instant},
};

use super::{codec::Message, error::PeerError, Sink};

/// Writes queued messages to the peer and sends a keep alive every
/// `keep_alive_interval`.
///
/// Returns when a write fails, in which case the connection is presumed
/// dead, or when all senders of the queue are gone.
pub(crate) async fn run_writer(
    addr: SocketAddr,
    mut sink: Sink,
    mut rx: mpsc::UnboundedReceiver<Message>,
    keep_alive_interval: Duration,
) -> PeerError {
    let mut keep_alive = time::interval_at(
        Instant::now() + keep_alive_interval,
        keep_alive_interval,
    );
    loop {
        let msg = tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => return PeerError::Channel,
            },
            _ = keep_alive.tick() => {
                peer_trace!(addr, "Sending keep alive");
                Message::KeepAlive
            }
        };
        if let Err(e) = sink.send(msg).await {
            peer_debug!(addr, "Write failed: {}", e);
            return e;
        }
    }
}

/// Waits for liveness signals from the peer's reader and returns once none
/// arrives within `timeout`.
///
/// The signal is a single permit: a signal raised while nobody is waiting is
/// kept until the next wait, and several such signals collapse into one.
pub(crate) async fn enforce_timeout(
    addr: SocketAddr,
    signal: Arc<Notify>,
    timeout: Duration,
) -> PeerError {
    loop {
        if time::timeout(timeout, signal.notified()).await.is_err() {
            peer_info!(addr, "No message in {} ms, timing out", timeout.as_millis());
            return PeerError::Timeout;
        }
    }
}
