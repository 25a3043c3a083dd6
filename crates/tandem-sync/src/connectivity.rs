//! Online/offline awareness.
//!
//! The platform bridge (browser events, reachability callbacks) owns a
//! [`ConnectivityHandle`] and feeds transitions into it; everything else
//! observes through cloned [`ConnectivityMonitor`]s.

use tokio::sync::watch;
use tracing::{info, warn};

/// Write side, driven by the platform's connectivity-change signal.
pub struct ConnectivityHandle {
    tx: watch::Sender<bool>,
}

/// Read side: current state plus "wait until online".
#[derive(Clone)]
pub struct ConnectivityMonitor {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle/monitor pair.
pub fn connectivity(initially_online: bool) -> (ConnectivityHandle, ConnectivityMonitor) {
    let (tx, rx) = watch::channel(initially_online);
    (ConnectivityHandle { tx }, ConnectivityMonitor { rx })
}

impl ConnectivityHandle {
    /// Record a platform connectivity transition. Redundant signals are
    /// collapsed so observers only wake on real changes.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            if online {
                info!("connectivity: back online");
            } else {
                warn!("connectivity: offline");
            }
        }
    }
}

impl ConnectivityMonitor {
    /// Whether the platform currently reports connectivity.
    pub fn is_online(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the platform reports online; immediately if it already
    /// does.
    pub async fn once_online(&self) {
        let mut rx = self.rx.clone();
        // wait_for only errors when the handle is dropped; treat that as
        // "state frozen" and fall through with whatever we last saw.
        let _ = rx.wait_for(|online| *online).await;
    }

    /// Wait for the next offline→online transition. Unlike
    /// [`Self::once_online`] this does not resolve while already online.
    pub async fn next_online_transition(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|online| !*online).await;
        let _ = rx.wait_for(|online| *online).await;
    }
}
