//! The DNS server: zone registration, update protocol and host integration.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::netmap::{CustomZone, DnsConfig, NameServerGroup, NameServerType, SimpleRecord, ROOT_ZONE};
use crate::util::with_dot;

use super::host::{DomainConfig, HostDnsConfig, HostDnsConfigurator};
use super::service::{DnsService, ListenerService, MemoryService};
use super::upstream::{DnsExchange, LivenessNotifier, NoopLiveness};
use super::{InMemoryDnsHandle, LocalResolver, QueryMux, UpstreamResolver, ZoneHandler, DEFAULT_DNS_PORT};

/// The local DNS server.
///
/// One instance lives as long as the engine; management updates reconcile
/// the registered zones, and the upstream liveness hooks temporarily pull
/// dead zones out of the host configuration without touching the applied
/// serial state.
#[derive(Clone)]
pub struct DnsServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    cancel: CancellationToken,
    service: DnsService,
    host: Arc<dyn HostDnsConfigurator>,
    exchange: Arc<dyn DnsExchange>,
    /// Per-platform capability: whether upstream liveness may deactivate
    /// zones.
    liveness_deactivation: bool,
    warned_custom_port: AtomicBool,
    state: Mutex<ServerState>,
}

struct ServerState {
    /// Config-level zone registrations; survives temporary deactivation.
    handlers: HashMap<String, ZoneHandler>,
    local: Arc<LocalResolver>,
    update_serial: u64,
    previous_config_hash: Option<u64>,
    /// The host configuration as of the last applied update, including any
    /// temporary deactivations.
    current_config: HostDnsConfig,
    /// The host's own resolvers, fed by the host DNS watcher; used for the
    /// root-zone fallback.
    host_dns: Vec<IpAddr>,
}

impl std::fmt::Debug for DnsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsServer")
            .field("addr", &self.dns_addr())
            .finish_non_exhaustive()
    }
}

impl DnsServer {
    /// Creates the server.
    ///
    /// Over a userspace-bound tunnel the service is in-memory (no socket);
    /// otherwise a UDP listener is bound on the overlay address, or on
    /// `custom_addr` when configured.
    pub fn new(
        userspace_bind: bool,
        overlay_ip: IpAddr,
        custom_addr: Option<SocketAddr>,
        host: Arc<dyn HostDnsConfigurator>,
        exchange: Arc<dyn DnsExchange>,
        liveness_deactivation: bool,
        parent: &CancellationToken,
    ) -> Self {
        let addr = custom_addr.unwrap_or_else(|| SocketAddr::new(overlay_ip, DEFAULT_DNS_PORT));
        let mux: QueryMux = Default::default();
        let service = if userspace_bind {
            DnsService::Memory(MemoryService::new(mux, addr))
        } else {
            DnsService::Listener(ListenerService::new(mux, addr))
        };

        DnsServer {
            inner: Arc::new(ServerInner {
                cancel: parent.child_token(),
                service,
                host,
                exchange,
                liveness_deactivation,
                warned_custom_port: AtomicBool::new(false),
                state: Mutex::new(ServerState {
                    handlers: HashMap::new(),
                    local: Arc::new(LocalResolver::default()),
                    update_serial: 0,
                    previous_config_hash: None,
                    current_config: HostDnsConfig::default(),
                    host_dns: Vec::new(),
                }),
            }),
        }
    }

    /// The resolver address host DNS config points at.
    pub fn dns_addr(&self) -> SocketAddr {
        self.inner.service.runtime_addr()
    }

    /// The in-memory query handle, when running over a userspace tunnel.
    pub fn in_memory_handle(&self) -> Option<InMemoryDnsHandle> {
        match &self.inner.service {
            DnsService::Memory(service) => Some(service.handle()),
            DnsService::Listener(_) => None,
        }
    }

    /// Search domains of the currently applied configuration.
    pub fn search_domains(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .unwrap()
            .current_config
            .search_domains()
    }

    /// Currently registered zones, for observability.
    pub fn zones(&self) -> Vec<String> {
        let mux = self.inner.service.mux().read().unwrap();
        let mut zones: Vec<String> = mux.keys().cloned().collect();
        zones.sort();
        zones
    }

    /// Updates the host's own resolver list.
    ///
    /// Applied as the root-zone fallback unless a configured root handler is
    /// registered.
    pub fn on_updated_host_dns(&self, addrs: Vec<IpAddr>) {
        let mut state = self.inner.state.lock().unwrap();
        state.host_dns = addrs;

        let has_root = self
            .inner
            .service
            .mux()
            .read()
            .unwrap()
            .contains_key(ROOT_ZONE);
        if has_root {
            debug!("new host DNS config, but a root handler is registered; not applying");
            return;
        }
        debug!(hosts = ?state.host_dns, "updating host DNS fallback");
        self.inner.add_host_root_zone(&mut state);
    }

    /// Processes a DNS configuration update from management.
    ///
    /// Structurally identical updates advance the serial without touching
    /// the OS.
    pub async fn update(&self, serial: u64, config: &DnsConfig) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            bail!("not updating DNS server, it is stopped");
        }

        {
            let state = self.inner.state.lock().unwrap();
            if serial < state.update_serial {
                bail!(
                    "not applying dns update, network update is {} behind the last applied update",
                    state.update_serial - serial
                );
            }
        }

        // the listener follows the enable flag before zones are reconciled
        if config.service_enable {
            if let Err(err) = self.inner.service.listen().await {
                error!("starting DNS service: {err:#}");
            }
        } else {
            self.inner.service.stop_listening().await;
        }

        let mut state = self.inner.state.lock().unwrap();
        let hash = config.canonical_hash();
        if state.previous_config_hash == Some(hash) {
            debug!("not applying the dns configuration update, nothing new");
            state.update_serial = serial;
            return Ok(());
        }

        apply_configuration(&self.inner, &mut state, config)?;
        state.update_serial = serial;
        state.previous_config_hash = Some(hash);
        Ok(())
    }

    /// Stops serving, restores host DNS and cancels probe loops.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        {
            let mut state = self.inner.state.lock().unwrap();
            for handler in state.handlers.values() {
                handler.stop();
            }
            state.handlers.clear();
            self.inner.service.mux().write().unwrap().clear();
            if let Err(err) = self.inner.host.restore() {
                error!("restoring host DNS: {err:#}");
            }
        }
        self.inner.service.stop_listening().await;
        info!("DNS server stopped");
    }
}

fn apply_configuration(
    inner: &Arc<ServerInner>,
    state: &mut ServerState,
    update: &DnsConfig,
) -> Result<()> {
    let (local_zones, local_records) = build_local_update(&update.custom_zones)?;
    let mut updates: Vec<(String, ZoneHandler)> = local_zones
        .into_iter()
        .map(|zone| (zone, ZoneHandler::Local(state.local.clone())))
        .collect();
    updates.extend(build_upstream_update(inner, &update.nameserver_groups)?);

    inner.update_mux(state, updates);
    state.local.replace_records(local_records);
    state.current_config = host_config_from(update, inner.service.runtime_addr());

    let mut host_update = state.current_config.clone();
    if inner.service.runtime_addr().port() != DEFAULT_DNS_PORT
        && !inner.host.support_custom_port()
    {
        if !inner.warned_custom_port.swap(true, Ordering::SeqCst) {
            warn!(
                "the DNS manager of this host doesn't support a custom resolver port, \
                 disabling primary DNS setup"
            );
        }
        host_update.route_all = false;
    }

    if let Err(err) = inner.host.apply(&host_update) {
        error!("applying host DNS config: {err:#}");
    }
    Ok(())
}

fn build_upstream_update(
    inner: &Arc<ServerInner>,
    groups: &[NameServerGroup],
) -> Result<Vec<(String, ZoneHandler)>> {
    let mut updates = Vec::new();
    for group in groups {
        if group.nameservers.is_empty() {
            warn!(group = %group.name, "received a nameserver group with an empty nameserver list");
            continue;
        }

        let servers: Vec<SocketAddr> = group
            .nameservers
            .iter()
            .filter(|ns| {
                if ns.ns_type == NameServerType::Udp {
                    true
                } else {
                    warn!(
                        nameserver = %ns,
                        "skipping nameserver, this peer supports only UDP"
                    );
                    false
                }
            })
            .map(|ns| ns.addr)
            .collect();
        if servers.is_empty() {
            error!(group = %group.name, "received a nameserver group with an invalid nameserver list");
            continue;
        }

        let domains: Vec<String> = group.domains.iter().map(|d| with_dot(d)).collect();
        let liveness = Arc::new(GroupLiveness {
            inner: Arc::downgrade(inner),
            domains: domains.clone(),
            primary: group.primary,
        });
        let resolver = Arc::new(UpstreamResolver::new(
            servers,
            inner.exchange.clone(),
            liveness,
            inner.liveness_deactivation,
            &inner.cancel,
        ));

        if group.primary {
            updates.push((ROOT_ZONE.to_string(), ZoneHandler::Upstream(resolver)));
            continue;
        }

        if domains.is_empty() {
            resolver.stop();
            bail!("received a non primary nameserver group with an empty domain list");
        }
        for domain in &domains {
            if domain == "." {
                resolver.stop();
                bail!("received a nameserver group with an empty domain element");
            }
            updates.push((domain.clone(), ZoneHandler::Upstream(resolver.clone())));
        }
    }
    Ok(updates)
}

impl ServerInner {
    /// Swaps the registered zones to `updates`.
    ///
    /// A replaced handler is stopped after its replacement is registered.
    /// When the root zone disappears without a replacement, the host
    /// fallback is re-added first so the root is never unhandled.
    fn update_mux(&self, state: &mut ServerState, updates: Vec<(String, ZoneHandler)>) {
        let mux = self.service.mux();
        let mut new_handlers: HashMap<String, ZoneHandler> = HashMap::new();
        let mut contains_root = false;

        for (zone, handler) in updates {
            mux.write().unwrap().insert(zone.clone(), handler.clone());
            if let Some(old) = state.handlers.remove(&zone) {
                stop_if_replaced(&old, &handler);
            }
            if zone == ROOT_ZONE {
                contains_root = true;
            }
            new_handlers.insert(zone, handler);
        }

        for (zone, old) in state.handlers.drain() {
            if new_handlers.contains_key(&zone) {
                continue;
            }
            if zone == ROOT_ZONE && !contains_root {
                // re-add the fallback before the old handler goes away
                if let Some(fallback) = self.host_root_handler(state.host_dns.clone()) {
                    mux.write()
                        .unwrap()
                        .insert(ROOT_ZONE.to_string(), fallback.clone());
                    new_handlers.insert(ROOT_ZONE.to_string(), fallback);
                } else {
                    mux.write().unwrap().remove(&zone);
                }
                old.stop();
            } else {
                old.stop();
                mux.write().unwrap().remove(&zone);
            }
        }

        state.handlers = new_handlers;
    }

    /// Builds the root-zone resolver from the host's own DNS servers.
    fn host_root_handler(&self, host_dns: Vec<IpAddr>) -> Option<ZoneHandler> {
        if host_dns.is_empty() {
            warn!("no host DNS servers known, leaving the root zone unhandled");
            return None;
        }
        let servers: Vec<SocketAddr> = host_dns
            .into_iter()
            .map(|ip| SocketAddr::new(ip, DEFAULT_DNS_PORT))
            .collect();
        let resolver = UpstreamResolver::new(
            servers,
            self.exchange.clone(),
            Arc::new(NoopLiveness),
            false,
            &self.cancel,
        );
        Some(ZoneHandler::Upstream(Arc::new(resolver)))
    }

    fn add_host_root_zone(&self, state: &mut ServerState) {
        let Some(handler) = self.host_root_handler(state.host_dns.clone()) else {
            return;
        };
        self.service
            .mux()
            .write()
            .unwrap()
            .insert(ROOT_ZONE.to_string(), handler.clone());
        state.handlers.insert(ROOT_ZONE.to_string(), handler);
    }
}

/// Stops the old handler unless old and new are the same shared resolver.
fn stop_if_replaced(old: &ZoneHandler, new: &ZoneHandler) {
    let same = match (old, new) {
        (ZoneHandler::Local(a), ZoneHandler::Local(b)) => Arc::ptr_eq(a, b),
        (ZoneHandler::Upstream(a), ZoneHandler::Upstream(b)) => Arc::ptr_eq(a, b),
        _ => false,
    };
    if !same {
        old.stop();
    }
}

/// The liveness hooks of one nameserver group.
///
/// Temporary deactivation flips the applied host state and the lookup mux
/// but never the serial-tracked configuration; management does not see it.
struct GroupLiveness {
    inner: Weak<ServerInner>,
    domains: Vec<String>,
    primary: bool,
}

impl LivenessNotifier for GroupLiveness {
    fn deactivate(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut state = inner.state.lock().unwrap();
        info!(domains = ?self.domains, "temporarily deactivating nameserver group");

        {
            let mut mux = inner.service.mux().write().unwrap();
            for domain in &self.domains {
                mux.remove(domain);
            }
            if self.primary {
                mux.remove(ROOT_ZONE);
                state.current_config.route_all = false;
            }
        }
        for item in &mut state.current_config.domains {
            if self.domains.contains(&item.domain) {
                item.disabled = true;
            }
        }

        if let Err(err) = inner.host.apply(&state.current_config) {
            error!("applying nameserver deactivation on the host: {err:#}");
        }
    }

    fn reactivate(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut state = inner.state.lock().unwrap();
        debug!(domains = ?self.domains, "reactivating temporarily disabled nameserver group");

        {
            let mut mux = inner.service.mux().write().unwrap();
            for domain in &self.domains {
                if let Some(handler) = state.handlers.get(domain) {
                    mux.insert(domain.clone(), handler.clone());
                }
            }
            if self.primary {
                if let Some(handler) = state.handlers.get(ROOT_ZONE) {
                    mux.insert(ROOT_ZONE.to_string(), handler.clone());
                }
                state.current_config.route_all = true;
            }
        }
        for item in &mut state.current_config.domains {
            if self.domains.contains(&item.domain) {
                item.disabled = false;
            }
        }

        if let Err(err) = inner.host.apply(&state.current_config) {
            error!("applying nameserver reactivation on the host: {err:#}");
        }
    }
}

fn build_local_update(zones: &[CustomZone]) -> Result<(Vec<String>, Vec<SimpleRecord>)> {
    let mut out_zones = Vec::new();
    let mut records = Vec::new();
    for zone in zones {
        if zone.records.is_empty() {
            bail!("received an empty list of records");
        }
        out_zones.push(with_dot(&zone.domain));
        records.extend(zone.records.iter().cloned());
    }
    Ok((out_zones, records))
}

fn host_config_from(update: &DnsConfig, resolver_addr: SocketAddr) -> HostDnsConfig {
    let mut domains = Vec::new();
    for zone in &update.custom_zones {
        domains.push(DomainConfig {
            domain: with_dot(&zone.domain),
            match_only: false,
            disabled: false,
        });
    }
    let mut route_all = false;
    for group in &update.nameserver_groups {
        if group.primary {
            route_all = true;
            continue;
        }
        for domain in &group.domains {
            domains.push(DomainConfig {
                domain: with_dot(domain),
                match_only: !group.search_domains_enabled,
                disabled: false,
            });
        }
    }
    HostDnsConfig {
        resolver_addr: Some(resolver_addr),
        route_all,
        domains,
    }
}
