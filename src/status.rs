//! Observable client state.
//!
//! The [`Status`] recorder is the single place every component reports into
//! and the only state a UI or CLI may read. All getters return point-in-time
//! snapshots; nothing hands out references into the shared state.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::sync::watch;

use crate::candidate::CandidateType;
use crate::key::PublicKey;

/// Lifecycle state of the whole client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DaemonState {
    #[default]
    Idle,
    Connecting,
    Connected,
    /// Management rejected our key; the user has to log in again.
    NeedsLogin,
    LoginFailed,
}

/// Connection state of a single remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Snapshot of the local peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalPeerStatus {
    pub ip: String,
    pub public_key: String,
    pub fqdn: String,
    pub kernel_interface: bool,
}

/// Snapshot of one remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub ip: String,
    pub public_key: PublicKey,
    pub fqdn: String,
    pub conn_status: ConnStatus,
    pub last_status_change: SystemTime,
    /// Whether the nominated path goes through a relay.
    pub relayed: bool,
    /// Whether a direct path is in use.
    pub direct: bool,
    pub local_ice_type: Option<CandidateType>,
    pub remote_ice_type: Option<CandidateType>,
    pub last_handshake: Option<SystemTime>,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
}

impl PeerStatus {
    fn new(public_key: PublicKey, ip: String, fqdn: String) -> Self {
        PeerStatus {
            ip,
            public_key,
            fqdn,
            conn_status: ConnStatus::default(),
            last_status_change: SystemTime::now(),
            relayed: false,
            direct: false,
            local_ice_type: None,
            remote_ice_type: None,
            last_handshake: None,
            bytes_rx: 0,
            bytes_tx: 0,
        }
    }
}

/// Snapshot of everything the recorder holds.
#[derive(Debug, Clone, Default)]
pub struct FullStatus {
    pub daemon: DaemonState,
    pub management_connected: bool,
    pub management_url: Option<String>,
    pub signal_connected: bool,
    pub signal_url: Option<String>,
    pub local_peer: LocalPeerStatus,
    pub peers: Vec<PeerStatus>,
}

#[derive(Debug, Default)]
struct StatusInner {
    management_connected: bool,
    management_url: Option<String>,
    signal_connected: bool,
    signal_url: Option<String>,
    local_peer: LocalPeerStatus,
    peers: HashMap<PublicKey, PeerStatus>,
}

/// Process-wide status recorder.
///
/// Cheap to clone; all clones share the same state.
#[derive(Debug, Clone)]
pub struct Status {
    inner: Arc<Mutex<StatusInner>>,
    daemon: watch::Sender<DaemonState>,
}

impl Default for Status {
    fn default() -> Self {
        let (daemon, _) = watch::channel(DaemonState::default());
        Status {
            inner: Default::default(),
            daemon,
        }
    }
}

impl Status {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_daemon_state(&self, state: DaemonState) {
        self.daemon.send_replace(state);
    }

    pub fn daemon_state(&self) -> DaemonState {
        *self.daemon.borrow()
    }

    /// Subscribe to daemon state transitions.
    pub fn subscribe(&self) -> watch::Receiver<DaemonState> {
        self.daemon.subscribe()
    }

    pub fn set_management(&self, connected: bool, url: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.management_connected = connected;
        if url.is_some() {
            inner.management_url = url;
        }
    }

    pub fn set_signal(&self, connected: bool, url: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.signal_connected = connected;
        if url.is_some() {
            inner.signal_url = url;
        }
    }

    pub fn set_local_peer(&self, local: LocalPeerStatus) {
        self.inner.lock().unwrap().local_peer = local;
    }

    pub fn clear_local_peer(&self) {
        self.inner.lock().unwrap().local_peer = LocalPeerStatus::default();
    }

    /// Registers a peer in the roster. Resets any previous entry.
    pub fn add_peer(&self, key: PublicKey, ip: String, fqdn: String) {
        let mut inner = self.inner.lock().unwrap();
        inner.peers.insert(key, PeerStatus::new(key, ip, fqdn));
    }

    pub fn remove_peer(&self, key: &PublicKey) {
        self.inner.lock().unwrap().peers.remove(key);
    }

    /// Applies `f` to the peer entry, stamping the status-change time when
    /// the connection state moved.
    pub fn update_peer<F>(&self, key: &PublicKey, f: F)
    where
        F: FnOnce(&mut PeerStatus),
    {
        let mut inner = self.inner.lock().unwrap();
        if let Some(peer) = inner.peers.get_mut(key) {
            let before = peer.conn_status;
            f(peer);
            if peer.conn_status != before {
                peer.last_status_change = SystemTime::now();
            }
        }
    }

    pub fn peer(&self, key: &PublicKey) -> Option<PeerStatus> {
        self.inner.lock().unwrap().peers.get(key).cloned()
    }

    /// A full snapshot for UI/CLI consumption.
    pub fn snapshot(&self) -> FullStatus {
        let inner = self.inner.lock().unwrap();
        let mut peers: Vec<PeerStatus> = inner.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.fqdn.cmp(&b.fqdn));
        FullStatus {
            daemon: self.daemon_state(),
            management_connected: inner.management_connected,
            management_url: inner.management_url.clone(),
            signal_connected: inner.signal_connected,
            signal_url: inner.signal_url.clone(),
            local_peer: inner.local_peer.clone(),
            peers,
        }
    }
}

/// Invoked by the transport clients on every connect and disconnect.
pub trait ConnStateNotifier: Send + Sync + 'static {
    fn on_connected(&self);
    fn on_disconnected(&self);
}

/// Feeds management transport state into the recorder.
pub(crate) struct ManagementNotifier(pub(crate) Status);

impl ConnStateNotifier for ManagementNotifier {
    fn on_connected(&self) {
        self.0.set_management(true, None);
    }

    fn on_disconnected(&self) {
        self.0.set_management(false, None);
    }
}

/// Feeds signal transport state into the recorder.
pub(crate) struct SignalNotifier(pub(crate) Status);

impl ConnStateNotifier for SignalNotifier {
    fn on_connected(&self) {
        self.0.set_signal(true, None);
    }

    fn on_disconnected(&self) {
        self.0.set_signal(false, None);
    }
}
