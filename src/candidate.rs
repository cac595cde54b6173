//! Connection candidates and their gathering.
//!
//! A candidate is an address a peer believes it can be reached at. Host
//! candidates come straight from the local interfaces, server-reflexive ones
//! from a STUN round trip, relay ones from a TURN allocation. Candidates are
//! exchanged through the signal channel and paired up for connectivity
//! checks.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stun_rs::{
    attributes::stun::{Fingerprint, XorMappedAddress},
    attributes::StunAttribute,
    methods, MessageClass, MessageDecoder, MessageEncoderBuilder, StunMessageBuilder,
    TransactionId,
};
use tokio::net::UdpSocket;
use tracing::{debug, warn};
use turn::client::{Client as TurnClient, ClientConfig as TurnClientConfig};
use webrtc_util::Conn;

/// How long we wait for a single STUN response.
const STUN_TIMEOUT: Duration = Duration::from_secs(5);

/// A TURN server with the credentials management issued for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    pub addr: SocketAddr,
    pub username: String,
    pub password: String,
}

/// The ICE-style candidate class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    /// Type preference, the dominant term of the candidate priority.
    /// Host beats reflexive beats relay.
    pub fn preference(&self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relay => 0,
        }
    }
}

impl std::fmt::Display for CandidateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        };
        write!(f, "{s}")
    }
}

impl FromStr for CandidateType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::ServerReflexive),
            "prflx" => Ok(CandidateType::PeerReflexive),
            "relay" => Ok(CandidateType::Relay),
            other => anyhow::bail!("unknown candidate type {other:?}"),
        }
    }
}

/// One address a peer can possibly be reached at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub typ: CandidateType,
    pub addr: SocketAddr,
    /// The local address the candidate was derived from, for reflexive and
    /// relay candidates.
    pub base: Option<SocketAddr>,
}

impl Candidate {
    pub fn host(addr: SocketAddr) -> Self {
        Candidate {
            typ: CandidateType::Host,
            addr,
            base: None,
        }
    }

    pub fn server_reflexive(addr: SocketAddr, base: SocketAddr) -> Self {
        Candidate {
            typ: CandidateType::ServerReflexive,
            addr,
            base: Some(base),
        }
    }

    pub fn relay(addr: SocketAddr, base: SocketAddr) -> Self {
        Candidate {
            typ: CandidateType::Relay,
            addr,
            base: Some(base),
        }
    }

    /// Candidate priority: type preference dominates, then a local
    /// preference favouring IPv6, then the component (always RTP=1 here).
    pub fn priority(&self) -> u32 {
        let local_pref: u32 = if self.addr.is_ipv6() { 65535 } else { 65534 };
        (1 << 24) * self.typ.preference() + (1 << 8) * local_pref + 255
    }
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.typ, self.addr)
    }
}

/// A local/remote candidate pairing under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
}

impl CandidatePair {
    /// Pair priority per the ICE formula, so both sides order their check
    /// lists identically.
    pub fn priority(&self, controlling: bool) -> u64 {
        let (g, d) = if controlling {
            (self.local.priority() as u64, self.remote.priority() as u64)
        } else {
            (self.remote.priority() as u64, self.local.priority() as u64)
        };
        (1 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d)
    }
}

/// Produces the local candidate set.
///
/// Injected so tests script candidate sets and so platforms can swap the
/// network probing strategy.
#[async_trait]
pub trait CandidateGatherer: Send + Sync + 'static {
    async fn gather(&self) -> Result<Vec<Candidate>>;
}

/// Fixed candidate set, for tests.
#[derive(Debug, Clone)]
pub struct StaticGatherer(pub Vec<Candidate>);

#[async_trait]
impl CandidateGatherer for StaticGatherer {
    async fn gather(&self) -> Result<Vec<Candidate>> {
        Ok(self.0.clone())
    }
}

/// Gathers from the host network: interface addresses minus the blocked
/// list, server-reflexive addresses via STUN, relay addresses via TURN
/// allocations, and configured NAT-external overrides.
///
/// A STUN or TURN failure drops only that candidate class; the rest of the
/// set is still returned.
pub struct NetGatherer {
    /// Interface names never considered.
    blocked_interfaces: Vec<String>,
    /// Externally visible addresses overriding STUN discovery.
    nat_external_ips: Vec<SocketAddr>,
    /// STUN servers to derive server-reflexive candidates from.
    stun_servers: Vec<SocketAddr>,
    /// TURN servers to allocate relay candidates on.
    turn_servers: Vec<TurnServer>,
    /// The port the tunnel listens on; candidates advertise it.
    port: u16,
    /// Live allocations backing the advertised relay candidates. Replaced
    /// wholesale on every gathering cycle.
    allocations: Mutex<Vec<RelayAllocation>>,
}

impl fmt::Debug for NetGatherer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetGatherer")
            .field("stun_servers", &self.stun_servers)
            .field("turn_servers", &self.turn_servers.len())
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl NetGatherer {
    pub fn new(
        blocked_interfaces: Vec<String>,
        nat_external_ips: Vec<SocketAddr>,
        stun_servers: Vec<SocketAddr>,
        turn_servers: Vec<TurnServer>,
        port: u16,
    ) -> Self {
        NetGatherer {
            blocked_interfaces,
            nat_external_ips,
            stun_servers,
            turn_servers,
            port,
            allocations: Mutex::new(Vec::new()),
        }
    }

    /// Installs this cycle's allocations, releasing last cycle's in the
    /// background.
    fn store_allocations(&self, new: Vec<RelayAllocation>) {
        let old = std::mem::replace(&mut *self.allocations.lock().unwrap(), new);
        if !old.is_empty() {
            tokio::spawn(async move {
                for allocation in old {
                    allocation.close().await;
                }
            });
        }
    }
}

#[async_trait]
impl CandidateGatherer for NetGatherer {
    async fn gather(&self) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();

        for iface in default_net::get_interfaces() {
            if self.blocked_interfaces.iter().any(|b| b == &iface.name) {
                continue;
            }
            let v4 = iface.ipv4.iter().map(|net| IpAddr::V4(net.addr));
            let v6 = iface.ipv6.iter().map(|net| IpAddr::V6(net.addr));
            for ip in v4.chain(v6) {
                if ip.is_loopback() || ip.is_unspecified() {
                    continue;
                }
                candidates.push(Candidate::host(SocketAddr::new(ip, self.port)));
            }
        }

        if self.nat_external_ips.is_empty() {
            for server in &self.stun_servers {
                match stun_binding(*server).await {
                    Ok((mapped, base)) => {
                        if !candidates.iter().any(|c| c.addr == mapped) {
                            candidates.push(Candidate::server_reflexive(mapped, base));
                        }
                    }
                    Err(err) => {
                        warn!(%server, "STUN gathering failed: {err:#}");
                    }
                }
            }
        } else {
            // the operator knows the external mapping better than STUN does
            for external in &self.nat_external_ips {
                let addr = SocketAddr::new(external.ip(), self.port);
                candidates.push(Candidate::server_reflexive(
                    addr,
                    SocketAddr::new(IpAddr::from([0, 0, 0, 0]), self.port),
                ));
            }
        }

        let mut allocations = Vec::new();
        for server in &self.turn_servers {
            match allocate_relay(server).await {
                Ok(allocation) => {
                    candidates.push(Candidate::relay(allocation.relayed, allocation.base));
                    allocations.push(allocation);
                }
                Err(err) => {
                    warn!(server = %server.addr, "TURN allocation failed: {err:#}");
                }
            }
        }
        self.store_allocations(allocations);

        debug!(count = candidates.len(), "gathered candidates");
        Ok(candidates)
    }
}

/// A live TURN allocation.
///
/// Held for as long as its relay candidate is advertised; the allocation is
/// refreshed by the client until closed.
struct RelayAllocation {
    client: TurnClient,
    relay: Box<dyn Conn + Send + Sync>,
    relayed: SocketAddr,
    base: SocketAddr,
}

impl RelayAllocation {
    async fn close(self) {
        self.relay.close().await.ok();
        self.client.close().await.ok();
    }
}

/// Allocates a relayed address on a TURN server.
async fn allocate_relay(server: &TurnServer) -> Result<RelayAllocation> {
    let bind: SocketAddr = if server.addr.is_ipv4() {
        "0.0.0.0:0".parse().expect("valid addr")
    } else {
        "[::]:0".parse().expect("valid addr")
    };
    let socket = UdpSocket::bind(bind).await?;
    let base = socket.local_addr()?;

    let client = TurnClient::new(TurnClientConfig {
        stun_serv_addr: server.addr.to_string(),
        turn_serv_addr: server.addr.to_string(),
        username: server.username.clone(),
        password: server.password.clone(),
        realm: String::new(),
        software: String::new(),
        rto_in_ms: 0,
        conn: Arc::new(socket),
        vnet: None,
    })
    .await
    .context("creating TURN client")?;
    client.listen().await.context("starting TURN client")?;

    let relay = client.allocate().await.context("requesting TURN allocation")?;
    let relayed = relay.local_addr().context("reading relayed address")?;
    Ok(RelayAllocation {
        client,
        relay: Box::new(relay),
        relayed,
        base,
    })
}

/// Generates a binding request STUN packet.
fn stun_request(tx: TransactionId) -> Vec<u8> {
    let fp = Fingerprint::default();
    let msg = StunMessageBuilder::new(methods::BINDING, MessageClass::Request)
        .with_transaction_id(tx)
        .with_attribute(fp)
        .build();

    let encoder = MessageEncoderBuilder::default().build();
    let mut buffer = vec![0u8; 150];
    let size = encoder.encode(&mut buffer, &msg).expect("invalid encoding");
    buffer.truncate(size);
    buffer
}

/// Parses a successful binding response, extracting the mapped address.
fn parse_stun_response(b: &[u8]) -> Result<SocketAddr> {
    let decoder = MessageDecoder::default();
    let (msg, _) = decoder
        .decode(b)
        .map_err(|_| anyhow::anyhow!("invalid STUN message"))?;

    anyhow::ensure!(
        msg.class() == MessageClass::SuccessResponse,
        "not a success response"
    );

    let mut addr = None;
    let mut fallback_addr = None;
    for attr in msg.attributes() {
        match attr {
            StunAttribute::XorMappedAddress(a) => {
                let mut a = *a.socket_address();
                a.set_ip(a.ip().to_canonical());
                addr = Some(a);
            }
            StunAttribute::MappedAddress(a) => {
                let mut a = *a.socket_address();
                a.set_ip(a.ip().to_canonical());
                fallback_addr = Some(a);
            }
            _ => {}
        }
    }

    addr.or(fallback_addr).context("no mapped address attribute")
}

/// One STUN binding round trip. Returns the mapped address and the local
/// address it was observed from.
async fn stun_binding(server: SocketAddr) -> Result<(SocketAddr, SocketAddr)> {
    let bind: SocketAddr = if server.is_ipv4() {
        "0.0.0.0:0".parse().expect("valid addr")
    } else {
        "[::]:0".parse().expect("valid addr")
    };
    let socket = UdpSocket::bind(bind).await?;
    let tx = TransactionId::from(rand::random::<[u8; 12]>());
    socket.send_to(&stun_request(tx), server).await?;

    let mut buf = vec![0u8; 1500];
    let (len, _) = tokio::time::timeout(STUN_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .context("STUN timeout")??;
    let mapped = parse_stun_response(&buf[..len])?;
    let base = socket.local_addr()?;
    Ok((mapped, base))
}
