//! The host DNS capability.
//!
//! Applying resolver settings to the operating system is injected: every
//! platform configures DNS differently, and the tests need to observe the
//! exact sequence of applied configurations.

use std::net::SocketAddr;

use anyhow::Result;

/// One domain entry of the applied host configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainConfig {
    /// Zone name with the trailing dot.
    pub domain: String,
    /// Routed to the resolver but not advertised as a search domain.
    pub match_only: bool,
    /// Temporarily pulled from the host because its upstreams are dead.
    pub disabled: bool,
}

/// The DNS configuration applied to the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostDnsConfig {
    /// Address of the local resolver.
    pub resolver_addr: Option<SocketAddr>,
    /// Whether the local resolver becomes the host's primary resolver.
    pub route_all: bool,
    pub domains: Vec<DomainConfig>,
}

impl HostDnsConfig {
    /// Non-disabled, non-match-only domains, as handed to the host's search
    /// list.
    pub fn search_domains(&self) -> Vec<String> {
        self.domains
            .iter()
            .filter(|d| !d.disabled && !d.match_only)
            .map(|d| crate::util::trim_dot(&d.domain).to_string())
            .collect()
    }
}

/// Applies resolver settings to the operating system.
pub trait HostDnsConfigurator: Send + Sync + 'static {
    fn apply(&self, config: &HostDnsConfig) -> Result<()>;

    /// Restores whatever the host had before we touched it.
    fn restore(&self) -> Result<()>;

    /// Whether the host can point at a resolver on a non-53 port.
    fn support_custom_port(&self) -> bool;
}

/// Host configurator that applies nothing.
///
/// For platforms where an outer integration owns host DNS.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHostDns;

impl HostDnsConfigurator for NoopHostDns {
    fn apply(&self, _config: &HostDnsConfig) -> Result<()> {
        Ok(())
    }

    fn restore(&self) -> Result<()> {
        Ok(())
    }

    fn support_custom_port(&self) -> bool {
        true
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every applied configuration.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingHostDns {
        pub(crate) applied: Mutex<Vec<HostDnsConfig>>,
        pub(crate) restored: Mutex<u32>,
        pub(crate) custom_port: std::sync::atomic::AtomicBool,
    }

    impl RecordingHostDns {
        pub(crate) fn new() -> std::sync::Arc<Self> {
            let this = Self::default();
            this.custom_port
                .store(true, std::sync::atomic::Ordering::SeqCst);
            std::sync::Arc::new(this)
        }

        pub(crate) fn last(&self) -> Option<HostDnsConfig> {
            self.applied.lock().unwrap().last().cloned()
        }

        pub(crate) fn apply_count(&self) -> usize {
            self.applied.lock().unwrap().len()
        }
    }

    impl HostDnsConfigurator for std::sync::Arc<RecordingHostDns> {
        fn apply(&self, config: &HostDnsConfig) -> Result<()> {
            self.applied.lock().unwrap().push(config.clone());
            Ok(())
        }

        fn restore(&self) -> Result<()> {
            *self.restored.lock().unwrap() += 1;
            Ok(())
        }

        fn support_custom_port(&self) -> bool {
            self.custom_port.load(std::sync::atomic::Ordering::SeqCst)
        }
    }
}
