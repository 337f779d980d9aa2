//! Phase signaling for the sluice daemon.
//!
//! Sluice runs several periodic tasks and two HTTP listeners that must all
//! wind down in a coordinated fashion. The mechanism here has two halves, a
//! [`Broadcaster`] and a [`Watcher`]. The `Broadcaster` announces that a phase
//! -- in practice, shutdown -- has been entered. Each `Watcher` waits for that
//! announcement. There is exactly one `Broadcaster` per phase and as many
//! `Watcher` instances as there are interested tasks, created by cloning.
//!
//! The announcement is a one-time event. A `Broadcaster` that must also
//! confirm the phase was acted on calls [`Broadcaster::signal_and_wait`],
//! which blocks until every `Watcher` has either received the signal and been
//! dropped or dropped without ever listening.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tokio::sync::{
    Notify,
    broadcast::{self, error},
};
use tracing::info;

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    // The channel is never written to. Dropping the sender closes it, and the
    // closed state is the signal: it reaches every receiver exactly once, no
    // matter when they subscribe relative to the drop.
    let (sender, receiver) = broadcast::channel(1);
    let peers = Arc::new(AtomicU32::new(1));
    let notify = Arc::new(Notify::new());

    let w = Watcher {
        peers: Arc::clone(&peers),
        receiver,
        notify: Arc::clone(&notify),
    };

    let b = Broadcaster {
        peers,
        sender,
        notify,
    };

    (w, b)
}

#[derive(Debug)]
/// Mechanism to notify all [`Watcher`] instances that a phase has been
/// entered.
pub struct Broadcaster {
    /// The number of live `Watcher` peers. Used to determine when every
    /// watcher has dropped off.
    peers: Arc<AtomicU32>,
    /// Transmission point for the signal. Never written to; dropping it is
    /// the signal.
    sender: broadcast::Sender<()>,
    /// Allows `Watcher` instances to wake this struct when they drop.
    notify: Arc<Notify>,
}

impl Broadcaster {
    /// Send the signal to all `Watcher` instances.
    ///
    /// Does NOT wait for peers to acknowledge the signal.
    pub fn signal(self) {
        drop(self.sender);
    }

    /// Send the signal to all `Watcher` instances, then block until every
    /// peer has dropped.
    ///
    /// The registration order matters: we must subscribe for notification
    /// before loading the peer count, else a peer could decrement and notify
    /// in the gap and the wakeup would be lost.
    pub async fn signal_and_wait(self) {
        drop(self.sender);

        loop {
            let notified = self.notify.notified();

            let peers = self.peers.load(Ordering::SeqCst);
            if peers == 0 {
                break;
            }
            info!(peers, "waiting for peers to drain");

            notified.await;
        }
    }
}

#[derive(Debug)]
/// Mechanism to wait for a phase change, typically used to observe shutdown.
pub struct Watcher {
    /// The number of live peers, shared with the `Broadcaster`. This struct
    /// only ever decrements it, on drop.
    peers: Arc<AtomicU32>,
    /// Reception point for the signal from the `Broadcaster`.
    receiver: broadcast::Receiver<()>,
    /// Allows this struct to wake the `Broadcaster` when it drops.
    notify: Arc<Notify>,
}

impl Watcher {
    /// Receive the phase signal, blocking until it has been sent.
    ///
    /// Consumes the watcher: the drop is what tells a waiting `Broadcaster`
    /// that this peer has seen the signal and wound down.
    ///
    /// # Panics
    ///
    /// Panics if the underlying broadcast receiver reports lag, which cannot
    /// happen as nothing is ever written to the channel.
    pub async fn recv(mut self) {
        match self.receiver.recv().await {
            Ok(()) | Err(error::RecvError::Closed) => (),
            Err(error::RecvError::Lagged(_)) => {
                unreachable!("signal channel carries no messages and cannot lag");
            }
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        // Each watcher accounts for exactly one peer and Drop runs exactly
        // once, so a plain decrement cannot underflow.
        self.peers.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

impl Clone for Watcher {
    fn clone(&self) -> Self {
        self.peers.fetch_add(1, Ordering::SeqCst);
        Self {
            peers: Arc::clone(&self.peers),
            receiver: self.receiver.resubscribe(),
            notify: Arc::clone(&self.notify),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::signal;

    #[tokio::test]
    async fn watcher_unblocks_on_signal() {
        let (watcher, broadcaster) = signal();

        let handle = tokio::spawn(watcher.recv());
        broadcaster.signal();

        handle.await.expect("watcher task panicked");
    }

    #[tokio::test]
    async fn signal_before_recv_is_not_lost() {
        let (watcher, broadcaster) = signal();

        broadcaster.signal();
        watcher.recv().await;
    }

    #[tokio::test]
    async fn signal_and_wait_drains_all_peers() {
        let (watcher, broadcaster) = signal();
        let peer_one = watcher.clone();
        let peer_two = watcher.clone();
        drop(watcher);

        let h1 = tokio::spawn(peer_one.recv());
        let h2 = tokio::spawn(peer_two.recv());

        broadcaster.signal_and_wait().await;

        h1.await.expect("peer one panicked");
        h2.await.expect("peer two panicked");
    }

    #[tokio::test]
    async fn dropped_watcher_does_not_block_wait() {
        let (watcher, broadcaster) = signal();
        let peer = watcher.clone();
        drop(watcher);

        let handle = tokio::spawn(async move {
            // Never calls recv; the drop alone must release the broadcaster.
            drop(peer);
        });

        broadcaster.signal_and_wait().await;
        handle.await.expect("peer task panicked");
    }
}
