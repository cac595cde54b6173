//! The network map delivered by management.
//!
//! A [`NetworkMap`] is the full picture of the mesh as management wants this
//! peer to see it: the remote peer roster, DNS configuration, routes and
//! firewall rules. Every map carries a monotonically increasing serial; the
//! engine ignores maps whose serial is not strictly newer than the last one
//! it applied.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::key::PublicKey;

/// The DNS root zone, with the trailing dot every zone name carries.
pub const ROOT_ZONE: &str = ".";

/// Full roster and policy snapshot for this peer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkMap {
    /// Monotonic update counter stamped by management.
    pub serial: u64,
    /// Config of the local peer, if management changed it.
    pub local: Option<LocalPeerConfig>,
    /// All remote peers this peer may connect to.
    pub peers: Vec<RemotePeer>,
    /// DNS zones and nameserver groups.
    pub dns: DnsConfig,
    /// Networks routable through gateway peers.
    pub routes: Vec<Route>,
    /// Traffic policy.
    pub firewall: Vec<FirewallRule>,
}

/// The local peer's own config as assigned by management.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalPeerConfig {
    /// Overlay address, e.g. `100.64.0.5/16`.
    pub address: IpNet,
    /// Fully qualified name of this peer inside the mesh.
    pub fqdn: String,
}

/// One remote peer in the roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePeer {
    /// Static public key identifying the peer.
    pub public_key: PublicKey,
    /// Overlay addresses traffic for this peer is allowed to carry.
    pub allowed_ips: Vec<IpNet>,
    /// Fully qualified name inside the mesh.
    pub fqdn: String,
    /// ACL group identifiers this peer may send from.
    #[serde(default)]
    pub source_groups: Vec<String>,
    /// ACL group identifiers this peer may send to.
    #[serde(default)]
    pub destination_groups: Vec<String>,
}

impl RemotePeer {
    /// The peer's primary overlay address, if it has one.
    pub fn overlay_ip(&self) -> Option<IpAddr> {
        self.allowed_ips.first().map(|net| net.addr())
    }

    /// Whether metadata differs in a way the engine must propagate without
    /// tearing the tunnel down.
    pub fn metadata_differs(&self, other: &RemotePeer) -> bool {
        self.fqdn != other.fqdn
            || self.allowed_ips != other.allowed_ips
            || self.source_groups != other.source_groups
            || self.destination_groups != other.destination_groups
    }
}

/// A network reachable through a gateway peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination network.
    pub network: IpNet,
    /// The peer routing for this network.
    pub gateway: PublicKey,
}

/// Traffic direction a firewall rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleDirection {
    /// Traffic entering through the tunnel interface.
    Inbound,
    /// Traffic leaving through the tunnel interface.
    Outbound,
}

/// What a firewall rule does with matched traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleAction {
    Accept,
    Drop,
}

/// Transport protocol selector of a firewall rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleProtocol {
    All,
    Tcp,
    Udp,
    Icmp,
}

impl fmt::Display for RuleProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleProtocol::All => write!(f, "all"),
            RuleProtocol::Tcp => write!(f, "tcp"),
            RuleProtocol::Udp => write!(f, "udp"),
            RuleProtocol::Icmp => write!(f, "icmp"),
        }
    }
}

/// One ACL rule from the network map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FirewallRule {
    /// Source peer the rule applies to.
    pub peer: PublicKey,
    pub direction: RuleDirection,
    pub action: RuleAction,
    pub protocol: RuleProtocol,
    /// Destination port, when the protocol carries ports.
    pub port: Option<u16>,
}

/// DNS configuration carried in the network map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Whether the local resolver service should accept queries at all.
    pub service_enable: bool,
    /// Zones this peer answers authoritatively.
    pub custom_zones: Vec<CustomZone>,
    /// Upstream nameserver groups with their domain scoping.
    pub nameserver_groups: Vec<NameServerGroup>,
}

impl DnsConfig {
    /// A canonical form with deterministic ordering, used for structural
    /// hashing so that permuted-but-equal updates do not touch the OS.
    pub fn canonical_hash(&self) -> u64 {
        use std::hash::{Hash, Hasher};

        let mut zones: Vec<String> = Vec::new();
        for zone in &self.custom_zones {
            let mut records: Vec<String> = zone.records.iter().map(|r| r.to_string()).collect();
            records.sort();
            zones.push(format!("{}={}", zone.domain, records.join(",")));
        }
        zones.sort();

        let mut groups: Vec<String> = Vec::new();
        for group in &self.nameserver_groups {
            let servers: BTreeSet<String> =
                group.nameservers.iter().map(|ns| ns.to_string()).collect();
            let domains: BTreeSet<&str> = group.domains.iter().map(|d| d.as_str()).collect();
            groups.push(format!(
                "{}|{}|{:?}|{:?}|{}",
                group.name,
                group.primary,
                servers,
                domains,
                group.search_domains_enabled,
            ));
        }
        groups.sort();

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.service_enable.hash(&mut hasher);
        zones.hash(&mut hasher);
        groups.hash(&mut hasher);
        hasher.finish()
    }
}

/// A zone the local resolver answers authoritatively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomZone {
    /// Zone name with the trailing dot.
    pub domain: String,
    pub records: Vec<SimpleRecord>,
}

/// A single record in a custom zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleRecord {
    /// Fully qualified record name with the trailing dot.
    pub name: String,
    pub record_type: RecordType,
    pub class: RecordClass,
    pub ttl: u32,
    /// Textual record data: an address for A/AAAA, a name for CNAME, free
    /// text for TXT.
    pub rdata: String,
}

impl fmt::Display for SimpleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:?} {:?} {}",
            self.name, self.ttl, self.class, self.record_type, self.rdata
        )
    }
}

/// Record types the local resolver knows how to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    A,
    AAAA,
    CNAME,
    TXT,
}

/// Record classes the local resolver accepts; only IN is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordClass {
    IN,
}

/// A group of upstream nameservers and the domains they serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameServerGroup {
    pub name: String,
    /// A primary group claims the root zone.
    pub primary: bool,
    pub nameservers: Vec<NameServer>,
    /// Zones routed to this group; ignored for primary groups.
    pub domains: Vec<String>,
    /// Whether the group's domains are advertised as host search domains.
    #[serde(default)]
    pub search_domains_enabled: bool,
}

/// Protocol of an upstream nameserver. Only UDP upstreams are usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameServerType {
    Udp,
    Tcp,
}

/// One upstream nameserver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameServer {
    pub addr: SocketAddr,
    pub ns_type: NameServerType,
}

impl fmt::Display for NameServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.addr, self.ns_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str, domains: &[&str]) -> NameServerGroup {
        NameServerGroup {
            name: name.to_string(),
            primary: false,
            nameservers: vec![NameServer {
                addr: "10.0.0.2:53".parse().unwrap(),
                ns_type: NameServerType::Udp,
            }],
            domains: domains.iter().map(|d| d.to_string()).collect(),
            search_domains_enabled: false,
        }
    }

    #[test]
    fn test_dns_hash_ignores_ordering() {
        let a = DnsConfig {
            service_enable: true,
            custom_zones: vec![],
            nameserver_groups: vec![group("a", &["x.example."]), group("b", &["y.example."])],
        };
        let mut b = a.clone();
        b.nameserver_groups.reverse();
        assert_eq!(a.canonical_hash(), b.canonical_hash());
    }

    #[test]
    fn test_dns_hash_detects_changes() {
        let a = DnsConfig {
            service_enable: true,
            custom_zones: vec![],
            nameserver_groups: vec![group("a", &["x.example."])],
        };
        let mut b = a.clone();
        b.nameserver_groups[0].domains.push("z.example.".to_string());
        assert_ne!(a.canonical_hash(), b.canonical_hash());

        let mut c = a.clone();
        c.service_enable = false;
        assert_ne!(a.canonical_hash(), c.canonical_hash());
    }

    #[test]
    fn test_network_map_serde_roundtrip() {
        let map = NetworkMap {
            serial: 7,
            local: Some(LocalPeerConfig {
                address: "100.64.0.5/16".parse().unwrap(),
                fqdn: "host-a.mesh.example".to_string(),
            }),
            peers: vec![RemotePeer {
                public_key: crate::key::SecretKey::generate().public(),
                allowed_ips: vec!["100.64.0.7/32".parse().unwrap()],
                fqdn: "host-b.mesh.example".to_string(),
                source_groups: vec!["all".to_string()],
                destination_groups: vec![],
            }],
            dns: DnsConfig::default(),
            routes: vec![],
            firewall: vec![],
        };
        let ser = serde_json::to_string(&map).unwrap();
        let de: NetworkMap = serde_json::from_str(&ser).unwrap();
        assert_eq!(de.serial, 7);
        assert_eq!(de.peers, map.peers);
        assert_eq!(de.local, map.local);
    }
}
