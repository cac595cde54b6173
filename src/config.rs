//! Client configuration.
//!
//! Two shapes live here: the [`ClientConfig`] document persisted on disk
//! between runs, and the immutable [`EngineConfig`] derived from it (plus the
//! login response) for one engine instance.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::key::{SecretKey, SshKeyPair};

/// Default name of the tunnel interface.
pub const DEFAULT_IFACE_NAME: &str = "tl0";

/// Default listen port of the tunnel interface.
pub const DEFAULT_TUNNEL_PORT: u16 = 51820;

/// The configuration document persisted on disk.
///
/// Older documents may carry only `management_url`; [`ClientConfig::load`]
/// upgrades them in place to the current shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// URL of the management service. TLS is decided by the scheme.
    pub management_url: Url,
    /// URL of the admin web surface, shown to the user after login.
    #[serde(default)]
    pub admin_url: Option<Url>,
    /// Static identity key.
    #[serde(default)]
    pub private_key: Option<SecretKey>,
    /// Optional pre-shared key mixed into every tunnel session.
    #[serde(default)]
    pub pre_shared_key: Option<String>,
    /// Tunnel interface name.
    #[serde(default)]
    pub iface_name: Option<String>,
    /// Tunnel listen port.
    #[serde(default)]
    pub tunnel_port: Option<u16>,
    /// Physical interfaces never used for candidate gathering.
    #[serde(default)]
    pub blocked_interfaces: Vec<String>,
    /// Externally visible addresses overriding what gathering discovers.
    #[serde(default)]
    pub nat_external_ips: Vec<SocketAddr>,
    /// Custom address for the local DNS resolver to listen on.
    #[serde(default)]
    pub custom_dns_address: Option<SocketAddr>,
    /// Enables the supplementary post-quantum session handshake.
    #[serde(default)]
    pub post_quantum: bool,
    /// SSH private key in OpenSSH format.
    #[serde(default)]
    pub ssh_key: Option<String>,
}

impl ClientConfig {
    /// Creates a fresh config with generated key material.
    pub fn generate(management_url: Url) -> Result<Self> {
        let ssh = SshKeyPair::generate();
        Ok(ClientConfig {
            management_url,
            admin_url: None,
            private_key: Some(SecretKey::generate()),
            pre_shared_key: None,
            iface_name: Some(DEFAULT_IFACE_NAME.to_string()),
            tunnel_port: Some(DEFAULT_TUNNEL_PORT),
            blocked_interfaces: default_blocked_interfaces(),
            nat_external_ips: Vec::new(),
            custom_dns_address: None,
            post_quantum: false,
            ssh_key: Some(ssh.to_openssh()?.to_string()),
        })
    }

    /// Loads the document at `path`.
    ///
    /// Legacy documents carrying only a management URL are upgraded in
    /// place: missing key material is generated and the file rewritten.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;

        let mut config: ClientConfig =
            serde_json::from_str(&raw).context("parsing config document")?;
        if config.fill_missing()? {
            info!("config document upgraded, rewriting {}", path.display());
            config.store(path)?;
        }
        Ok(config)
    }

    /// Writes the document to `path`.
    pub fn store(&self, path: &Path) -> Result<()> {
        let ser = serde_json::to_string_pretty(self)?;
        std::fs::write(path, ser).with_context(|| format!("writing config {}", path.display()))
    }

    /// Fills fields a previous version did not persist. Returns whether
    /// anything changed.
    fn fill_missing(&mut self) -> Result<bool> {
        let mut changed = false;
        if self.private_key.is_none() {
            self.private_key = Some(SecretKey::generate());
            changed = true;
        }
        if self.iface_name.is_none() {
            self.iface_name = Some(DEFAULT_IFACE_NAME.to_string());
            changed = true;
        }
        if self.tunnel_port.is_none() {
            self.tunnel_port = Some(DEFAULT_TUNNEL_PORT);
            changed = true;
        }
        if self.ssh_key.is_none() {
            self.ssh_key = Some(SshKeyPair::generate().to_openssh()?.to_string());
            changed = true;
        }
        Ok(changed)
    }

    /// Whether the management connection uses TLS.
    pub fn management_tls(&self) -> bool {
        self.management_url.scheme() == "https"
    }

    pub fn secret_key(&self) -> Result<SecretKey> {
        self.private_key.clone().context("config has no private key")
    }

    pub fn ssh_keypair(&self) -> Result<SshKeyPair> {
        let raw = self.ssh_key.as_ref().context("config has no SSH key")?;
        SshKeyPair::try_from_openssh(raw.as_bytes())
    }
}

/// Interfaces that never yield useful candidates.
fn default_blocked_interfaces() -> Vec<String> {
    [DEFAULT_IFACE_NAME, "docker0", "lo", "virbr0"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Immutable configuration of one engine instance.
///
/// Combines the persisted document with the peer config management assigned
/// at login.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Tunnel interface name.
    pub iface_name: String,
    /// Overlay address assigned by management.
    pub address: IpNet,
    /// Tunnel listen port.
    pub tunnel_port: u16,
    /// Optional pre-shared key mixed into every session.
    pub pre_shared_key: Option<[u8; 32]>,
    /// Physical interfaces excluded from candidate gathering.
    pub blocked_interfaces: Vec<String>,
    /// Externally visible addresses overriding discovered ones.
    pub nat_external_ips: Vec<SocketAddr>,
    /// SSH keypair advertised at login.
    pub ssh_key: SshKeyPair,
    /// Custom DNS listen address.
    pub custom_dns_address: Option<SocketAddr>,
    /// Whether the supplementary post-quantum handshake runs per session.
    pub post_quantum: bool,
    /// Whether DNS upstream liveness may temporarily deactivate zones on
    /// this platform.
    pub dns_liveness_deactivation: bool,
}

impl EngineConfig {
    /// Builds the engine config from the persisted document and the address
    /// assigned at login.
    pub fn new(config: &ClientConfig, address: IpNet) -> Result<Self> {
        let pre_shared_key = match &config.pre_shared_key {
            Some(raw) => {
                let bytes = data_encoding::BASE64
                    .decode(raw.as_bytes())
                    .context("invalid pre-shared key")?;
                let bytes: [u8; 32] = bytes[..]
                    .try_into()
                    .context("pre-shared key must be 32 bytes")?;
                Some(bytes)
            }
            None => None,
        };

        Ok(EngineConfig {
            iface_name: config
                .iface_name
                .clone()
                .unwrap_or_else(|| DEFAULT_IFACE_NAME.to_string()),
            address,
            tunnel_port: config.tunnel_port.unwrap_or(DEFAULT_TUNNEL_PORT),
            pre_shared_key,
            blocked_interfaces: config.blocked_interfaces.clone(),
            nat_external_ips: config.nat_external_ips.clone(),
            ssh_key: config.ssh_keypair()?,
            custom_dns_address: config.custom_dns_address,
            post_quantum: config.post_quantum,
            dns_liveness_deactivation: true,
        })
    }
}
