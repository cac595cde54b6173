//! Split-horizon DNS for the overlay.
//!
//! A multiplexer maps DNS zones (with their trailing dot) to handlers. Two
//! handler kinds exist: the local resolver, authoritative for custom zones,
//! and upstream resolvers forwarding to per-zone nameservers. The zone `.`
//! (root) is registered iff a primary nameserver group claims it or the host
//! DNS fallback is active.
//!
//! Upstream resolvers track their own liveness: after enough sequential
//! failures a resolver deactivates its zones from the host configuration and
//! probes until an upstream answers again.

mod local;
mod server;
mod service;
pub(crate) mod upstream;

pub mod host;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use hickory_proto::op::Message;

pub use self::local::LocalResolver;
pub use self::server::DnsServer;
pub use self::service::InMemoryDnsHandle;
pub use self::upstream::{DnsExchange, ExchangeError, UdpExchange, UpstreamResolver};

/// The port the resolver serves on unless a custom address says otherwise.
pub const DEFAULT_DNS_PORT: u16 = 53;

/// A zone's handler. Closed set; the multiplexer needs to stop both kinds.
#[derive(Debug, Clone)]
pub(crate) enum ZoneHandler {
    Local(Arc<LocalResolver>),
    Upstream(Arc<UpstreamResolver>),
}

impl ZoneHandler {
    /// Produces the response for `query`.
    pub(crate) async fn handle(&self, query: &Message) -> Message {
        match self {
            ZoneHandler::Local(resolver) => resolver.handle(query),
            ZoneHandler::Upstream(resolver) => resolver.handle(query).await,
        }
    }

    /// Releases background resources. Idempotent.
    pub(crate) fn stop(&self) {
        match self {
            ZoneHandler::Local(_) => {}
            ZoneHandler::Upstream(resolver) => resolver.stop(),
        }
    }
}

/// The lookup-side multiplexer, shared between the serving front and the
/// server's update path.
///
/// Queries take the read lock only long enough to clone the handler
/// reference; the update path owns the write side.
pub(crate) type QueryMux = Arc<RwLock<HashMap<String, ZoneHandler>>>;

/// Picks the handler for a query name: the registered zone with the longest
/// suffix match wins; the root zone matches everything.
pub(crate) fn lookup_handler(mux: &QueryMux, qname: &str) -> Option<ZoneHandler> {
    let qname = crate::util::with_dot(&qname.to_ascii_lowercase());
    let mux = mux.read().unwrap();

    let mut best: Option<(&String, &ZoneHandler)> = None;
    for (zone, handler) in mux.iter() {
        let matches = zone == crate::netmap::ROOT_ZONE
            || qname == *zone
            || qname.ends_with(&format!(".{zone}"));
        if !matches {
            continue;
        }
        match best {
            Some((best_zone, _)) if best_zone.len() >= zone.len() => {}
            _ => best = Some((zone, handler)),
        }
    }
    best.map(|(_, handler)| handler.clone())
}
