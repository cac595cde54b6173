//! Route reconciliation for networks advertised through gateway peers.
//!
//! A route is installed while at least one connected gateway advertises its
//! destination. The same destination advertised by several gateways is
//! installed once and reference-counted, so losing one provider does not
//! drop the route.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use ipnet::IpNet;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::key::PublicKey;
use crate::netmap::Route;

/// Installs and removes OS routes through the tunnel interface.
#[async_trait]
pub trait RouteSink: Send + Sync + 'static {
    async fn add_route(&self, network: IpNet, iface: &str) -> Result<()>;
    async fn remove_route(&self, network: IpNet, iface: &str) -> Result<()>;
}

/// Reconciles advertised routes against gateway connectivity.
pub struct RouteManager {
    sink: Arc<dyn RouteSink>,
    iface: String,
    state: Mutex<RouteState>,
}

#[derive(Default)]
struct RouteState {
    /// Routes the network map advertises.
    desired: Vec<Route>,
    /// Gateways currently connected.
    connected: HashSet<PublicKey>,
    /// Installed destinations with their provider count.
    installed: HashMap<IpNet, usize>,
}

impl RouteManager {
    pub fn new(sink: Arc<dyn RouteSink>, iface: String) -> Self {
        RouteManager {
            sink,
            iface,
            state: Mutex::new(RouteState::default()),
        }
    }

    /// Replaces the advertised route set.
    pub async fn update_routes(&self, routes: Vec<Route>) {
        let mut state = self.state.lock().await;
        state.desired = routes;
        self.reconcile(&mut state).await;
    }

    /// Marks a gateway peer connected.
    pub async fn peer_connected(&self, key: PublicKey) {
        let mut state = self.state.lock().await;
        if state.connected.insert(key) {
            self.reconcile(&mut state).await;
        }
    }

    /// Marks a gateway peer disconnected.
    pub async fn peer_disconnected(&self, key: &PublicKey) {
        let mut state = self.state.lock().await;
        if state.connected.remove(key) {
            self.reconcile(&mut state).await;
        }
    }

    /// Removes every installed route.
    pub async fn flush(&self) {
        let mut state = self.state.lock().await;
        state.desired.clear();
        state.connected.clear();
        self.reconcile(&mut state).await;
    }

    /// Installed destinations, for observability.
    pub async fn installed(&self) -> Vec<IpNet> {
        let state = self.state.lock().await;
        let mut nets: Vec<IpNet> = state.installed.keys().copied().collect();
        nets.sort();
        nets
    }

    async fn reconcile(&self, state: &mut RouteState) {
        let mut wanted: HashMap<IpNet, usize> = HashMap::new();
        for route in &state.desired {
            if state.connected.contains(&route.gateway) {
                *wanted.entry(route.network).or_default() += 1;
            }
        }

        for (network, providers) in &wanted {
            if !state.installed.contains_key(network) {
                debug!(%network, "installing route");
                if let Err(err) = self.sink.add_route(*network, &self.iface).await {
                    warn!(%network, "installing route failed: {err:#}");
                    continue;
                }
            }
            state.installed.insert(*network, *providers);
        }

        let stale: Vec<IpNet> = state
            .installed
            .keys()
            .filter(|network| !wanted.contains_key(network))
            .copied()
            .collect();
        for network in stale {
            debug!(%network, "removing route");
            if let Err(err) = self.sink.remove_route(network, &self.iface).await {
                warn!(%network, "removing route failed: {err:#}");
            }
            state.installed.remove(&network);
        }
    }
}
