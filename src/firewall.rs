//! Firewall rule translation and reconciliation.
//!
//! ACL rules from the network map are rendered into nftables or iptables
//! rule text with content-addressed keys, so re-applying the same policy
//! after a restart is idempotent: rules already present keep their key and
//! are left alone.
//!
//! Backend selection probes for nftables first (overridable with
//! `TRELLIS_FORCE_IPTABLES=true`), falls back to iptables, and reports "no
//! firewall support" when neither exists.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use tracing::{debug, info, warn};

use crate::netmap::{RuleAction, RuleDirection, RuleProtocol};

/// Environment flag forcing the iptables backend.
pub const FORCE_IPTABLES_ENV: &str = "TRELLIS_FORCE_IPTABLES";

/// The rule backends this peer can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallBackend {
    Nftables,
    Iptables,
}

/// A firewall rule with its peer reference resolved to an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedRule {
    pub peer_ip: IpAddr,
    pub direction: RuleDirection,
    pub action: RuleAction,
    pub protocol: RuleProtocol,
    pub port: Option<u16>,
}

/// Applies rendered rules to the OS.
///
/// Injected; tests capture the exact rule sets, production backends shell
/// out to the respective tooling.
pub trait FirewallApplier: Send + Sync + 'static {
    /// Whether the given backend's interface is present on this host.
    fn backend_available(&self, backend: FirewallBackend) -> bool;

    /// Installs a rule under a stable key. Applying an existing key is a
    /// no-op.
    fn apply_rule(&self, key: &str, rule: &str) -> Result<()>;

    fn remove_rule(&self, key: &str) -> Result<()>;
}

/// Reconciles the installed rule set against the network map policy.
pub struct FirewallManager {
    applier: Arc<dyn FirewallApplier>,
    backend: FirewallBackend,
    iface: String,
    installed: Mutex<HashMap<String, ResolvedRule>>,
}

impl std::fmt::Debug for FirewallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirewallManager")
            .field("backend", &self.backend)
            .field("iface", &self.iface)
            .field("installed", &self.installed)
            .finish()
    }
}

impl FirewallManager {
    /// Picks a backend and creates the manager.
    pub fn new(applier: Arc<dyn FirewallApplier>, iface: String) -> Result<Self> {
        let backend = select_backend(applier.as_ref())?;
        info!(?backend, "firewall backend selected");
        Ok(FirewallManager {
            applier,
            backend,
            iface,
            installed: Mutex::new(HashMap::new()),
        })
    }

    pub fn backend(&self) -> FirewallBackend {
        self.backend
    }

    /// Reconciles toward `rules`: new rules are applied, stale ones removed,
    /// unchanged ones untouched.
    pub fn update_rules(&self, rules: &[ResolvedRule]) {
        let mut installed = self.installed.lock().unwrap();

        let mut wanted: HashMap<String, ResolvedRule> = HashMap::new();
        for rule in rules {
            wanted.insert(self.rule_key(rule), rule.clone());
        }

        for (key, rule) in &wanted {
            if installed.contains_key(key) {
                continue;
            }
            let text = self.render(rule);
            debug!(key, rule = %text, "applying firewall rule");
            if let Err(err) = self.applier.apply_rule(key, &text) {
                warn!(key, "applying firewall rule failed: {err:#}");
                continue;
            }
            installed.insert(key.clone(), rule.clone());
        }

        let stale: Vec<String> = installed
            .keys()
            .filter(|key| !wanted.contains_key(*key))
            .cloned()
            .collect();
        for key in stale {
            debug!(key, "removing firewall rule");
            if let Err(err) = self.applier.remove_rule(&key) {
                warn!(key, "removing firewall rule failed: {err:#}");
            }
            installed.remove(&key);
        }
    }

    /// Removes every installed rule.
    pub fn flush(&self) {
        self.update_rules(&[]);
    }

    /// Installed rule keys, for observability.
    pub fn installed_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.installed.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Content-addressed rule key: identical rules map to identical keys
    /// across restarts and backends never collide.
    fn rule_key(&self, rule: &ResolvedRule) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.render(rule).as_bytes());
        let hash = hasher.finalize();
        format!("tl-{}", &hash.to_hex()[..16])
    }

    fn render(&self, rule: &ResolvedRule) -> String {
        match self.backend {
            FirewallBackend::Nftables => render_nftables(&self.iface, rule),
            FirewallBackend::Iptables => render_iptables(&self.iface, rule),
        }
    }
}

fn select_backend(applier: &dyn FirewallApplier) -> Result<FirewallBackend> {
    let force_iptables = std::env::var(FORCE_IPTABLES_ENV)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    if !force_iptables && applier.backend_available(FirewallBackend::Nftables) {
        return Ok(FirewallBackend::Nftables);
    }
    if applier.backend_available(FirewallBackend::Iptables) {
        return Ok(FirewallBackend::Iptables);
    }
    bail!("no firewall support on this host");
}

fn render_nftables(iface: &str, rule: &ResolvedRule) -> String {
    let mut parts = vec!["add rule inet trellis".to_string()];
    parts.push(match rule.direction {
        RuleDirection::Inbound => format!("input iifname {iface}"),
        RuleDirection::Outbound => format!("output oifname {iface}"),
    });
    parts.push(match rule.direction {
        RuleDirection::Inbound => format!("ip saddr {}", rule.peer_ip),
        RuleDirection::Outbound => format!("ip daddr {}", rule.peer_ip),
    });
    if rule.protocol != RuleProtocol::All {
        match rule.port {
            Some(port) => parts.push(format!("{} dport {port}", rule.protocol)),
            None => parts.push(format!("meta l4proto {}", rule.protocol)),
        }
    }
    parts.push(
        match rule.action {
            RuleAction::Accept => "accept",
            RuleAction::Drop => "drop",
        }
        .to_string(),
    );
    parts.join(" ")
}

fn render_iptables(iface: &str, rule: &ResolvedRule) -> String {
    let mut parts = vec![match rule.direction {
        RuleDirection::Inbound => format!("-A TRELLIS-IN -i {iface} -s {}", rule.peer_ip),
        RuleDirection::Outbound => format!("-A TRELLIS-OUT -o {iface} -d {}", rule.peer_ip),
    }];
    if rule.protocol != RuleProtocol::All {
        parts.push(format!("-p {}", rule.protocol));
        if let Some(port) = rule.port {
            parts.push(format!("--dport {port}"));
        }
    }
    parts.push(
        match rule.action {
            RuleAction::Accept => "-j ACCEPT",
            RuleAction::Drop => "-j DROP",
        }
        .to_string(),
    );
    parts.join(" ")
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Captures applied rules; availability is configurable.
    #[derive(Debug)]
    pub(crate) struct RecordingApplier {
        pub(crate) nftables: bool,
        pub(crate) iptables: bool,
        pub(crate) rules: Mutex<HashMap<String, String>>,
        pub(crate) apply_calls: Mutex<u32>,
    }

    impl RecordingApplier {
        pub(crate) fn nftables() -> Arc<Self> {
            Arc::new(RecordingApplier {
                nftables: true,
                iptables: true,
                rules: Mutex::new(HashMap::new()),
                apply_calls: Mutex::new(0),
            })
        }

        pub(crate) fn none() -> Arc<Self> {
            Arc::new(RecordingApplier {
                nftables: false,
                iptables: false,
                rules: Mutex::new(HashMap::new()),
                apply_calls: Mutex::new(0),
            })
        }
    }

    impl FirewallApplier for Arc<RecordingApplier> {
        fn backend_available(&self, backend: FirewallBackend) -> bool {
            match backend {
                FirewallBackend::Nftables => self.nftables,
                FirewallBackend::Iptables => self.iptables,
            }
        }

        fn apply_rule(&self, key: &str, rule: &str) -> Result<()> {
            *self.apply_calls.lock().unwrap() += 1;
            self.rules
                .lock()
                .unwrap()
                .insert(key.to_string(), rule.to_string());
            Ok(())
        }

        fn remove_rule(&self, key: &str) -> Result<()> {
            self.rules.lock().unwrap().remove(key);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingApplier;
    use super::*;

    fn rule(ip: &str, port: Option<u16>) -> ResolvedRule {
        ResolvedRule {
            peer_ip: ip.parse().unwrap(),
            direction: RuleDirection::Inbound,
            action: RuleAction::Accept,
            protocol: RuleProtocol::Tcp,
            port,
        }
    }

    #[test]
    fn test_reapply_is_idempotent() {
        let applier = RecordingApplier::nftables();
        let manager =
            FirewallManager::new(Arc::new(applier.clone()), "tl0".to_string()).unwrap();

        let rules = vec![rule("100.64.0.7", Some(22)), rule("100.64.0.8", None)];
        manager.update_rules(&rules);
        assert_eq!(*applier.apply_calls.lock().unwrap(), 2);

        // identical policy: nothing re-applied
        manager.update_rules(&rules);
        assert_eq!(*applier.apply_calls.lock().unwrap(), 2);
        assert_eq!(manager.installed_keys().len(), 2);
    }

    #[test]
    fn test_stale_rules_removed() {
        let applier = RecordingApplier::nftables();
        let manager =
            FirewallManager::new(Arc::new(applier.clone()), "tl0".to_string()).unwrap();

        manager.update_rules(&[rule("100.64.0.7", Some(22)), rule("100.64.0.8", None)]);
        manager.update_rules(&[rule("100.64.0.7", Some(22))]);
        assert_eq!(applier.rules.lock().unwrap().len(), 1);
        assert_eq!(manager.installed_keys().len(), 1);

        manager.flush();
        assert!(applier.rules.lock().unwrap().is_empty());
    }

    #[test]
    fn test_keys_are_content_addressed() {
        let applier = RecordingApplier::nftables();
        let manager =
            FirewallManager::new(Arc::new(applier), "tl0".to_string()).unwrap();
        let a = manager.rule_key(&rule("100.64.0.7", Some(22)));
        let b = manager.rule_key(&rule("100.64.0.7", Some(22)));
        let c = manager.rule_key(&rule("100.64.0.7", Some(23)));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("tl-"));
    }

    #[test]
    fn test_no_backend_is_an_error() {
        let applier = RecordingApplier::none();
        let err = FirewallManager::new(Arc::new(applier), "tl0".to_string()).unwrap_err();
        assert!(err.to_string().contains("no firewall support"));
    }

    #[test]
    fn test_rule_rendering() {
        let applier = RecordingApplier::nftables();
        let manager =
            FirewallManager::new(Arc::new(applier.clone()), "tl0".to_string()).unwrap();
        assert_eq!(manager.backend(), FirewallBackend::Nftables);

        manager.update_rules(&[rule("100.64.0.7", Some(22))]);
        let rules = applier.rules.lock().unwrap();
        let text = rules.values().next().unwrap();
        assert!(text.contains("ip saddr 100.64.0.7"));
        assert!(text.contains("tcp dport 22"));
        assert!(text.contains("accept"));
    }
}
