//! The tunnel device capability.
//!
//! The engine never talks to the OS tunnel driver directly; it is handed an
//! object implementing [`TunDevice`]. Two kinds of implementations exist in
//! deployments: a kernel-bound device and a userspace-bound one. The DNS
//! server asks [`TunDevice::is_userspace_bind`] to decide between a real UDP
//! listener and an in-memory service.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use ipnet::IpNet;

use crate::key::PublicKey;

/// Transfer statistics of one installed peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerStats {
    /// Wall time of the last completed tunnel handshake.
    pub last_handshake: Option<std::time::SystemTime>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// A peer entry as installed in the tunnel device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePeer {
    pub public_key: PublicKey,
    /// Overlay networks whose traffic is routed to this peer.
    pub allowed_ips: Vec<IpNet>,
    /// Transport endpoint; `None` keeps the entry but stops sending.
    pub endpoint: Option<SocketAddr>,
    /// Session pre-shared key.
    pub preshared_key: Option<[u8; 32]>,
    /// Persistent keepalive interval.
    pub keepalive: Option<Duration>,
}

/// Operations of the tunnel device.
#[async_trait]
pub trait TunDevice: Send + Sync + 'static {
    /// Brings the interface up under `name` with the overlay `address`,
    /// listening on `port`.
    async fn up(&self, name: &str, address: IpNet, port: u16) -> Result<()>;

    /// Installs or replaces a peer entry.
    async fn update_peer(&self, peer: DevicePeer) -> Result<()>;

    /// Removes a peer entry. Removing an absent peer is not an error.
    async fn remove_peer(&self, key: &PublicKey) -> Result<()>;

    /// Transfer statistics of an installed peer, `None` when absent.
    ///
    /// Read-only; the per-peer liveness loop polls this.
    async fn peer_stats(&self, key: &PublicKey) -> Result<Option<PeerStats>>;

    /// Tears the interface down, dropping all peer entries.
    async fn close(&self) -> Result<()>;

    /// Whether the device is bound in userspace rather than by the kernel.
    fn is_userspace_bind(&self) -> bool;
}

/// In-memory tunnel device used by the test suite.
///
/// Records every mutation so tests can assert the exact peer set after a
/// sequence of roster updates.
#[derive(Debug, Default)]
pub struct MemoryDevice {
    state: Mutex<MemoryDeviceState>,
    userspace: bool,
}

#[derive(Debug, Default)]
struct MemoryDeviceState {
    up: bool,
    name: String,
    peers: HashMap<PublicKey, DevicePeer>,
    stats: HashMap<PublicKey, PeerStats>,
    fail_peer_updates: bool,
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn userspace() -> Self {
        MemoryDevice {
            state: Mutex::default(),
            userspace: true,
        }
    }

    /// Current peer entries, keyed by public key.
    pub fn peers(&self) -> HashMap<PublicKey, DevicePeer> {
        self.state.lock().unwrap().peers.clone()
    }

    pub fn peer(&self, key: &PublicKey) -> Option<DevicePeer> {
        self.state.lock().unwrap().peers.get(key).cloned()
    }

    pub fn is_up(&self) -> bool {
        self.state.lock().unwrap().up
    }

    /// Makes every subsequent peer mutation fail, for fatal-error tests.
    pub fn fail_peer_updates(&self) {
        self.state.lock().unwrap().fail_peer_updates = true;
    }

    /// Sets the stats the next [`TunDevice::peer_stats`] call reports.
    pub fn set_peer_stats(&self, key: PublicKey, stats: PeerStats) {
        self.state.lock().unwrap().stats.insert(key, stats);
    }
}

#[async_trait]
impl TunDevice for MemoryDevice {
    async fn up(&self, name: &str, _address: IpNet, _port: u16) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.up {
            bail!("device {} is already up", state.name);
        }
        state.up = true;
        state.name = name.to_string();
        Ok(())
    }

    async fn update_peer(&self, peer: DevicePeer) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_peer_updates {
            bail!("device failure injected");
        }
        if !state.up {
            bail!("device is not up");
        }
        state.peers.insert(peer.public_key, peer);
        Ok(())
    }

    async fn remove_peer(&self, key: &PublicKey) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_peer_updates {
            bail!("device failure injected");
        }
        state.peers.remove(key);
        state.stats.remove(key);
        Ok(())
    }

    async fn peer_stats(&self, key: &PublicKey) -> Result<Option<PeerStats>> {
        let state = self.state.lock().unwrap();
        if !state.peers.contains_key(key) {
            return Ok(None);
        }
        Ok(Some(state.stats.get(key).copied().unwrap_or_default()))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.up = false;
        state.peers.clear();
        state.stats.clear();
        Ok(())
    }

    fn is_userspace_bind(&self) -> bool {
        self.userspace
    }
}
