//! The connection engine.
//!
//! Owns the per-peer state table and everything derived from it: tunnel
//! device entries, the DNS server, routes and firewall rules. Network map
//! updates are applied strictly serialized, so the installed OS state always
//! corresponds to exactly one serial.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::candidate::{CandidateGatherer, CandidateType};
use crate::config::EngineConfig;
use crate::device::{DevicePeer, TunDevice};
use crate::dns::host::HostDnsConfigurator;
use crate::dns::{DnsExchange, DnsServer};
use crate::firewall::{FirewallApplier, FirewallManager, ResolvedRule};
use crate::key::{PublicKey, SecretKey};
use crate::netmap::{NetworkMap, RemotePeer};
use crate::peer::handshake::Kem;
use crate::peer::{self, PathProber, PeerConnConfig, PeerEvent, PeerHandle, KEEPALIVE};
use crate::routes::{RouteManager, RouteSink};
use crate::signal::SignalClient;
use crate::status::{ConnStatus, Status};

/// Everything the engine is constructed from. The OS-touching pieces are
/// capability objects so tests observe them directly.
pub struct EngineOptions {
    pub config: EngineConfig,
    pub secret_key: SecretKey,
    pub device: Arc<dyn TunDevice>,
    pub signal: SignalClient,
    pub status: Status,
    pub host_dns: Arc<dyn HostDnsConfigurator>,
    pub dns_exchange: Arc<dyn DnsExchange>,
    pub route_sink: Arc<dyn RouteSink>,
    pub firewall_applier: Arc<dyn FirewallApplier>,
    pub gatherer: Arc<dyn CandidateGatherer>,
    pub prober: Arc<dyn PathProber>,
    /// KEM for the supplementary handshake; `Some` iff post-quantum mode.
    pub kem: Option<Arc<dyn Kem>>,
    /// Root of the engine's cancellation tree.
    pub cancel: CancellationToken,
}

struct PeerEntry {
    handle: PeerHandle,
    roster: RemotePeer,
}

#[derive(Default)]
struct EngineState {
    peers: HashMap<PublicKey, PeerEntry>,
    /// Mirror of the device peer entries the engine installed.
    installed: HashMap<PublicKey, DevicePeer>,
    latest_serial: Option<u64>,
    started: bool,
}

/// The connection engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    public_key: PublicKey,
    device: Arc<dyn TunDevice>,
    signal: SignalClient,
    status: Status,
    dns: DnsServer,
    routes: Arc<RouteManager>,
    firewall: Option<FirewallManager>,
    gatherer: Arc<dyn CandidateGatherer>,
    prober: Arc<dyn PathProber>,
    kem: Option<Arc<dyn Kem>>,
    cancel: CancellationToken,
    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    fatal: watch::Sender<Option<String>>,
    state: Mutex<EngineState>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("public_key", &self.inner.public_key)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(options: EngineOptions) -> Result<Self> {
        let EngineOptions {
            config,
            secret_key,
            device,
            signal,
            status,
            host_dns,
            dns_exchange,
            route_sink,
            firewall_applier,
            gatherer,
            prober,
            kem,
            cancel,
        } = options;

        let dns = DnsServer::new(
            device.is_userspace_bind(),
            config.address.addr(),
            config.custom_dns_address,
            host_dns,
            dns_exchange,
            config.dns_liveness_deactivation,
            &cancel,
        );
        let routes = Arc::new(RouteManager::new(route_sink, config.iface_name.clone()));
        let firewall = match FirewallManager::new(firewall_applier, config.iface_name.clone()) {
            Ok(manager) => Some(manager),
            Err(err) => {
                warn!("firewall disabled: {err:#}");
                None
            }
        };

        let (events_tx, events_rx) = mpsc::channel(256);
        let (fatal, _) = watch::channel(None);
        Ok(Engine {
            inner: Arc::new(EngineInner {
                config,
                public_key: secret_key.public(),
                device,
                signal,
                status,
                dns,
                routes,
                firewall,
                gatherer,
                prober,
                kem,
                cancel,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                fatal,
                state: Mutex::new(EngineState::default()),
            }),
        })
    }

    /// Brings the tunnel device up and starts the event loop.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        inner
            .device
            .up(
                &inner.config.iface_name,
                inner.config.address,
                inner.config.tunnel_port,
            )
            .await
            .context("bringing up the tunnel device")?;

        let mut state = inner.state.lock().await;
        state.started = true;
        drop(state);

        let events_rx = inner
            .events_rx
            .lock()
            .await
            .take()
            .context("engine is already started")?;
        let engine = self.clone();
        tokio::spawn(
            async move { engine.event_loop(events_rx).await }
                .instrument(info_span!("engine.events")),
        );

        info!(
            iface = %inner.config.iface_name,
            address = %inner.config.address,
            "engine started"
        );
        Ok(())
    }

    /// Observes fatal failures; the supervisor tears the session down on a
    /// `Some` value.
    pub fn subscribe_fatal(&self) -> watch::Receiver<Option<String>> {
        self.inner.fatal.subscribe()
    }

    /// The DNS server, for surfaces that expose resolver details.
    pub fn dns(&self) -> DnsServer {
        self.inner.dns.clone()
    }

    /// Applies one network map update.
    ///
    /// Updates with a serial at or behind the last applied one are ignored.
    pub async fn apply_network_map(&self, map: NetworkMap) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        anyhow::ensure!(state.started, "engine is not started");

        if let Some(latest) = state.latest_serial {
            if map.serial <= latest {
                debug!(
                    serial = map.serial,
                    latest, "ignoring network map behind the applied serial"
                );
                return Ok(());
            }
        }
        debug!(serial = map.serial, peers = map.peers.len(), "applying network map");

        if let Some(local) = &map.local {
            inner.status.set_local_peer(crate::status::LocalPeerStatus {
                ip: local.address.to_string(),
                public_key: inner.public_key.to_string(),
                fqdn: local.fqdn.clone(),
                kernel_interface: !inner.device.is_userspace_bind(),
            });
        }

        let roster: HashMap<PublicKey, RemotePeer> = map
            .peers
            .iter()
            .filter(|peer| peer.public_key != inner.public_key)
            .map(|peer| (peer.public_key, peer.clone()))
            .collect();

        // removals first: a replacement connection may never overlap
        let removed: Vec<PublicKey> = state
            .peers
            .keys()
            .filter(|key| !roster.contains_key(key))
            .copied()
            .collect();
        for key in removed {
            if let Some(entry) = state.peers.remove(&key) {
                debug!(peer = %key.fmt_short(), "peer removed from roster");
                entry.handle.stop().await;
                inner.device.remove_peer(&key).await?;
                state.installed.remove(&key);
                inner.status.remove_peer(&key);
                inner.routes.peer_disconnected(&key).await;
            }
        }

        for (key, roster_peer) in &roster {
            let EngineState { peers, installed, .. } = &mut *state;
            match peers.get_mut(key) {
                Some(entry) => {
                    if entry.roster.metadata_differs(roster_peer) {
                        // metadata change: update in place, no teardown
                        if let Some(installed) = installed.get_mut(key) {
                            installed.allowed_ips = roster_peer.allowed_ips.clone();
                            inner.device.update_peer(installed.clone()).await?;
                        }
                        inner.status.update_peer(key, |p| {
                            p.fqdn = roster_peer.fqdn.clone();
                            if let Some(ip) = roster_peer.overlay_ip() {
                                p.ip = ip.to_string();
                            }
                        });
                        entry.roster = roster_peer.clone();
                    }
                }
                None => {
                    debug!(peer = %key.fmt_short(), "peer added to roster");
                    let device_peer = DevicePeer {
                        public_key: *key,
                        allowed_ips: roster_peer.allowed_ips.clone(),
                        endpoint: None,
                        preshared_key: None,
                        keepalive: None,
                    };
                    inner.device.update_peer(device_peer.clone()).await?;
                    state.installed.insert(*key, device_peer);

                    inner.status.add_peer(
                        *key,
                        roster_peer
                            .overlay_ip()
                            .map(|ip| ip.to_string())
                            .unwrap_or_default(),
                        roster_peer.fqdn.clone(),
                    );
                    let handle = peer::spawn(
                        PeerConnConfig {
                            remote_key: *key,
                            local_key: inner.public_key,
                            gatherer: inner.gatherer.clone(),
                            prober: inner.prober.clone(),
                            signal: inner.signal.clone(),
                            device: inner.device.clone(),
                            events: inner.events_tx.clone(),
                            status: inner.status.clone(),
                            preshared_key: inner.config.pre_shared_key,
                            kem: inner.kem.clone(),
                        },
                        inner.cancel.child_token(),
                    );
                    state.peers.insert(
                        *key,
                        PeerEntry {
                            handle,
                            roster: roster_peer.clone(),
                        },
                    );
                }
            }
        }

        if let Err(err) = inner.dns.update(map.serial, &map.dns).await {
            error!("applying DNS update: {err:#}");
        }

        inner.routes.update_routes(map.routes.clone()).await;

        if let Some(firewall) = &inner.firewall {
            let resolved: Vec<ResolvedRule> = map
                .firewall
                .iter()
                .filter_map(|rule| {
                    let ip = roster.get(&rule.peer).and_then(|p| p.overlay_ip())?;
                    Some(ResolvedRule {
                        peer_ip: ip,
                        direction: rule.direction,
                        action: rule.action,
                        protocol: rule.protocol,
                        port: rule.port,
                    })
                })
                .collect();
            firewall.update_rules(&resolved);
        }

        state.latest_serial = Some(map.serial);
        Ok(())
    }

    /// Consumes the management sync stream until it ends or the engine is
    /// cancelled. A stream ending while the engine runs is a transient
    /// failure the supervisor retries on.
    pub async fn run_sync(&self, mut updates: mpsc::Receiver<NetworkMap>) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return Ok(()),
                map = updates.recv() => match map {
                    Some(map) => {
                        if let Err(err) = self.apply_network_map(map).await {
                            // the only propagated failures here are tunnel
                            // device mutations, which end the session
                            error!("applying network map: {err:#}");
                            self.inner.fatal.send_replace(Some(format!("{err:#}")));
                            self.inner.cancel.cancel();
                            return Err(err);
                        }
                    }
                    None => anyhow::bail!("management sync stream closed"),
                },
            }
        }
    }

    /// Stops everything and releases OS state: peers and their device
    /// entries, DNS (restoring host config), routes and firewall rules, and
    /// finally the tunnel device itself.
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.cancel.cancel();

        let mut state = inner.state.lock().await;
        for (key, entry) in state.peers.drain() {
            entry.handle.stop().await;
            inner.status.remove_peer(&key);
        }
        state.installed.clear();
        state.started = false;
        drop(state);

        // DNS and route cleanup run before the device goes away
        inner.dns.stop().await;
        inner.routes.flush().await;
        if let Some(firewall) = &inner.firewall {
            firewall.flush();
        }
        if let Err(err) = inner.device.close().await {
            warn!("closing tunnel device: {err:#}");
        }
        inner.status.clear_local_peer();
        info!("engine stopped");
    }

    /// The applied serial, for observability.
    pub async fn latest_serial(&self) -> Option<u64> {
        self.inner.state.lock().await.latest_serial
    }

    async fn event_loop(&self, mut events: mpsc::Receiver<PeerEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let Err(err) = self.handle_peer_event(event).await {
                // device mutations failing is fatal for the session
                error!("handling peer event: {err:#}");
                self.inner.fatal.send_replace(Some(format!("{err:#}")));
                self.inner.cancel.cancel();
                break;
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn peer_count(&self) -> usize {
        self.inner.state.lock().await.peers.len()
    }

    async fn handle_peer_event(&self, event: PeerEvent) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        match event {
            PeerEvent::Nominated {
                key,
                endpoint,
                preshared_key,
                local_type,
                remote_type,
            } => {
                if !state.peers.contains_key(&key) {
                    debug!(peer = %key.fmt_short(), "nomination for a peer no longer in the roster");
                    return Ok(());
                }
                let Some(installed) = state.installed.get_mut(&key) else {
                    return Ok(());
                };
                installed.endpoint = Some(endpoint);
                installed.preshared_key = preshared_key;
                installed.keepalive = Some(KEEPALIVE);
                inner
                    .device
                    .update_peer(installed.clone())
                    .await
                    .context("installing nominated endpoint")?;

                let relayed = local_type == CandidateType::Relay
                    || remote_type == CandidateType::Relay;
                inner.status.update_peer(&key, |p| {
                    p.conn_status = ConnStatus::Connected;
                    p.relayed = relayed;
                    p.direct = !relayed;
                    p.local_ice_type = Some(local_type);
                    p.remote_ice_type = Some(remote_type);
                });
                inner.routes.peer_connected(key).await;
            }
            PeerEvent::Disconnected { key } => {
                if let Some(installed) = state.installed.get_mut(&key) {
                    // keep the allowed-ips so traffic routes again once the
                    // session is restored
                    installed.endpoint = None;
                    installed.preshared_key = None;
                    installed.keepalive = None;
                    inner
                        .device
                        .update_peer(installed.clone())
                        .await
                        .context("uninstalling endpoint")?;
                }
                inner.status.update_peer(&key, |p| {
                    p.conn_status = ConnStatus::Disconnected;
                    p.local_ice_type = None;
                    p.remote_ice_type = None;
                });
                inner.routes.peer_disconnected(&key).await;
            }
        }
        Ok(())
    }
}
