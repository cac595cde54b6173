//! The client supervisor.
//!
//! Brings the engine up and keeps it up: connect to management, log in,
//! open signal, start the engine, then hold the management sync stream.
//! Session failures restart everything under exponential backoff; a login
//! rejection is terminal and parks the client in `NeedsLogin`.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::candidate::{CandidateGatherer, NetGatherer};
use crate::config::{ClientConfig, EngineConfig};
use crate::device::TunDevice;
use crate::dns::host::HostDnsConfigurator;
use crate::dns::DnsExchange;
use crate::engine::{Engine, EngineOptions};
use crate::firewall::FirewallApplier;
use crate::key::PublicKey;
use crate::mgmt::{ManagementClient, ManagementTransport, MgmtError};
use crate::peer::handshake::{Kem, SealedBoxKem};
use crate::peer::PathProber;
use crate::routes::RouteSink;
use crate::signal::{SignalClient, SignalTransport};
use crate::status::{
    ConnStateNotifier, DaemonState, LocalPeerStatus, ManagementNotifier, SignalNotifier, Status,
};
use crate::sysinfo::SystemInfo;

/// Cap of the retry backoff between engine sessions.
const RETRY_MAX_INTERVAL: Duration = Duration::from_secs(15);

/// Total retry window; three months, like the rest of the fleet tooling.
const RETRY_MAX_ELAPSED: Duration = Duration::from_secs(3 * 30 * 24 * 60 * 60);

/// Pause between management sync reconnect attempts, capped.
const SYNC_RETRY_MAX_INTERVAL: Duration = Duration::from_secs(15);

/// Terminal outcome of the client run loop.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Management rejected our key; the user must log in again.
    #[error("permission denied by management")]
    Permission,
    /// Setup is unusable until reconfigured.
    #[error("precondition failed: {0}")]
    Precondition(String),
    /// Retries exhausted on transient failures.
    #[error("giving up after transient failures: {0}")]
    Transient(String),
    /// The engine hit an unrecoverable failure.
    #[error("fatal engine failure: {0}")]
    Fatal(String),
}

/// Produces signal transports for the URL management hands out at login.
pub trait SignalTransportProvider: Send + Sync + 'static {
    fn transport(
        &self,
        url: &Url,
        public_key: PublicKey,
    ) -> anyhow::Result<Arc<dyn SignalTransport>>;
}

/// Everything a client run needs. All OS- and network-touching pieces are
/// injected.
pub struct RunOptions {
    pub config: ClientConfig,
    pub status: Status,
    pub mgmt: Arc<dyn ManagementTransport>,
    pub signal: Arc<dyn SignalTransportProvider>,
    pub device: Arc<dyn TunDevice>,
    pub host_dns: Arc<dyn HostDnsConfigurator>,
    pub dns_exchange: Arc<dyn DnsExchange>,
    pub route_sink: Arc<dyn RouteSink>,
    pub firewall_applier: Arc<dyn FirewallApplier>,
    pub prober: Arc<dyn PathProber>,
    /// Candidate gatherer override; by default one is built from the STUN
    /// servers management returns at login.
    pub gatherer: Option<Arc<dyn CandidateGatherer>>,
    /// KEM override for post-quantum mode.
    pub kem: Option<Arc<dyn Kem>>,
}

enum SessionEnd {
    Cancelled,
    NeedsLogin,
    Retry(String),
    Fatal(String),
}

/// Runs the client until `ctx` is cancelled or a terminal error occurs.
pub async fn run_client(ctx: CancellationToken, options: RunOptions) -> Result<(), ClientError> {
    info!("starting client, version {}", env!("CARGO_PKG_VERSION"));
    let status = options.status.clone();

    let mut backoff = backoff::ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_randomization_factor(1.0)
        .with_multiplier(1.7)
        .with_max_interval(RETRY_MAX_INTERVAL)
        .with_max_elapsed_time(Some(RETRY_MAX_ELAPSED))
        .build();

    let result = loop {
        if ctx.is_cancelled() {
            break Ok(());
        }
        status.set_daemon_state(DaemonState::Connecting);

        let (end, was_connected) = run_session(&ctx, &options).await;
        if was_connected {
            backoff.reset();
        }

        match end {
            SessionEnd::Cancelled => break Ok(()),
            SessionEnd::NeedsLogin => {
                status.set_daemon_state(DaemonState::NeedsLogin);
                break Err(ClientError::Permission);
            }
            SessionEnd::Fatal(reason) => {
                error!("engine failed: {reason}");
                break Err(ClientError::Fatal(reason));
            }
            SessionEnd::Retry(reason) => {
                let Some(wait) = backoff.next_backoff() else {
                    status.set_daemon_state(DaemonState::LoginFailed);
                    break Err(ClientError::Transient(reason));
                };
                warn!("session ended ({reason}), retrying in {wait:?}");
                tokio::select! {
                    _ = ctx.cancelled() => break Ok(()),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
    };

    if status.daemon_state() != DaemonState::NeedsLogin {
        status.set_daemon_state(DaemonState::Idle);
    }
    info!("client stopped");
    result
}

/// One engine session: login, signal, engine, sync stream.
async fn run_session(ctx: &CancellationToken, options: &RunOptions) -> (SessionEnd, bool) {
    let status = &options.status;
    let mut was_connected = false;

    let secret_key = match options.config.secret_key() {
        Ok(key) => key,
        Err(err) => return (SessionEnd::Retry(format!("unusable private key: {err:#}")), false),
    };
    let ssh_public = match options
        .config
        .ssh_keypair()
        .and_then(|kp| kp.public_openssh().map_err(anyhow::Error::from))
    {
        Ok(key) => key,
        Err(err) => return (SessionEnd::Retry(format!("unusable SSH key: {err:#}")), false),
    };

    let session_cancel = ctx.child_token();
    // every exit path tears the session's task tree down
    let _session_guard = session_cancel.clone().drop_guard();
    let cleanup = SessionCleanup {
        status: status.clone(),
    };

    debug!(url = %options.config.management_url, "connecting to the management service");
    let mgmt_notifier: Arc<dyn ConnStateNotifier> =
        Arc::new(ManagementNotifier(status.clone()));
    let mgmt = ManagementClient::new(secret_key.clone(), options.mgmt.clone(), mgmt_notifier);

    let login = match mgmt.login(SystemInfo::default(), ssh_public).await {
        Ok(login) => login,
        Err(MgmtError::PermissionDenied) => {
            debug!("management login rejected");
            return (SessionEnd::NeedsLogin, false);
        }
        Err(err) => return (SessionEnd::Retry(format!("login failed: {err}")), false),
    };
    status.set_management(true, Some(options.config.management_url.to_string()));
    status.set_local_peer(LocalPeerStatus {
        ip: login.peer.address.to_string(),
        public_key: secret_key.public().to_string(),
        fqdn: login.peer.fqdn.clone(),
        kernel_interface: !options.device.is_userspace_bind(),
    });

    let engine_config = match EngineConfig::new(&options.config, login.peer.address) {
        Ok(config) => config,
        Err(err) => return (SessionEnd::Retry(format!("engine config: {err:#}")), false),
    };

    debug!(url = %login.signal_url, "connecting to the signal service");
    let signal_transport = match options
        .signal
        .transport(&login.signal_url, secret_key.public())
    {
        Ok(transport) => transport,
        Err(err) => return (SessionEnd::Retry(format!("signal transport: {err:#}")), false),
    };
    let signal = SignalClient::new(secret_key.clone(), signal_transport);
    status.set_signal(false, Some(login.signal_url.to_string()));
    let signal_notifier: Arc<dyn ConnStateNotifier> = Arc::new(SignalNotifier(status.clone()));
    signal.start(session_cancel.clone(), signal_notifier);

    let gatherer = options.gatherer.clone().unwrap_or_else(|| {
        Arc::new(NetGatherer::new(
            engine_config.blocked_interfaces.clone(),
            engine_config.nat_external_ips.clone(),
            login.stun_servers.clone(),
            login.turn_servers.clone(),
            engine_config.tunnel_port,
        ))
    });
    let kem = if engine_config.post_quantum {
        Some(
            options
                .kem
                .clone()
                .unwrap_or_else(|| Arc::new(SealedBoxKem) as Arc<dyn Kem>),
        )
    } else {
        None
    };

    let engine = match Engine::new(EngineOptions {
        config: engine_config,
        secret_key,
        device: options.device.clone(),
        signal,
        status: status.clone(),
        host_dns: options.host_dns.clone(),
        dns_exchange: options.dns_exchange.clone(),
        route_sink: options.route_sink.clone(),
        firewall_applier: options.firewall_applier.clone(),
        gatherer,
        prober: options.prober.clone(),
        kem,
        cancel: session_cancel.clone(),
    }) {
        Ok(engine) => engine,
        Err(err) => return (SessionEnd::Retry(format!("building engine: {err:#}")), false),
    };

    if let Err(err) = engine.start().await {
        error!("starting engine: {err:#}");
        return (SessionEnd::Retry(format!("starting engine: {err:#}")), false);
    }
    let mut fatal = engine.subscribe_fatal();

    // hold the sync stream; reconnects do not restart the engine, the
    // server re-sends the full map and stale serials are ignored
    let mut sync_backoff = backoff::ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(500))
        .with_max_interval(SYNC_RETRY_MAX_INTERVAL)
        .with_max_elapsed_time(None)
        .build();
    let end = loop {
        let stream = tokio::select! {
            _ = session_cancel.cancelled() => break SessionEnd::Cancelled,
            stream = mgmt.sync() => stream,
        };
        match stream {
            Ok(updates) => {
                sync_backoff.reset();
                status.set_daemon_state(DaemonState::Connected);
                was_connected = true;
                info!("client connected, overlay address {}", login.peer.address);

                let run = tokio::select! {
                    _ = session_cancel.cancelled() => break SessionEnd::Cancelled,
                    _ = fatal.changed() => {
                        let reason = fatal.borrow().clone().unwrap_or_default();
                        break SessionEnd::Fatal(reason);
                    }
                    run = engine.run_sync(updates) => run,
                };
                if let Err(err) = run {
                    mgmt.disconnected();
                    status.set_daemon_state(DaemonState::Connecting);
                    warn!("management sync lost: {err:#}");
                }
            }
            Err(MgmtError::PermissionDenied) => break SessionEnd::NeedsLogin,
            Err(err) => {
                warn!("management sync unavailable: {err}");
            }
        }

        let wait = sync_backoff
            .next_backoff()
            .unwrap_or(SYNC_RETRY_MAX_INTERVAL);
        tokio::select! {
            _ = session_cancel.cancelled() => break SessionEnd::Cancelled,
            _ = fatal.changed() => {
                let reason = fatal.borrow().clone().unwrap_or_default();
                break SessionEnd::Fatal(reason);
            }
            _ = tokio::time::sleep(wait) => {}
        }
    };

    session_cancel.cancel();
    engine.stop().await;
    drop(cleanup);
    (end, was_connected)
}

/// Resets the transport status fields when a session ends, however it ends.
struct SessionCleanup {
    status: Status,
}

impl Drop for SessionCleanup {
    fn drop(&mut self) {
        self.status.set_management(false, None);
        self.status.set_signal(false, None);
        self.status.clear_local_peer();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::candidate::{Candidate, StaticGatherer};
    use crate::device::MemoryDevice;
    use crate::dns::host::testing::RecordingHostDns;
    use crate::dns::upstream::testing::{ScriptedExchange, ScriptedResult};
    use crate::engine::testing::map_with;
    use crate::firewall::testing::RecordingApplier;
    use crate::key::SecretKey;
    use crate::mgmt::testing::InMemoryManagement;
    use crate::mgmt::LoginResponse;
    use crate::netmap::{LocalPeerConfig, RemotePeer};
    use crate::peer::testing::PermissiveProber;
    use crate::peer::{PeerConnConfig, PeerEvent};
    use crate::routes::testing::RecordingRouteSink;
    use crate::signal::testing::{InMemorySignalService, NullNotifier};
    use crate::status::ConnStatus;

    struct CountingProvider {
        service: Arc<InMemorySignalService>,
        calls: AtomicU32,
    }

    impl SignalTransportProvider for CountingProvider {
        fn transport(
            &self,
            _url: &Url,
            public_key: PublicKey,
        ) -> anyhow::Result<Arc<dyn SignalTransport>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.service.transport(public_key))
        }
    }

    struct Harness {
        mgmt: Arc<InMemoryManagement>,
        signal_service: Arc<InMemorySignalService>,
        provider: Arc<CountingProvider>,
        device: Arc<MemoryDevice>,
        host_dns: Arc<RecordingHostDns>,
        status: Status,
        options: RunOptions,
    }

    fn login_response() -> LoginResponse {
        LoginResponse {
            peer: LocalPeerConfig {
                address: "100.64.0.5/16".parse().unwrap(),
                fqdn: "host-a.mesh.example".to_string(),
            },
            signal_url: "http://signal.local:10000".parse().unwrap(),
            stun_servers: vec![],
            turn_servers: vec![],
        }
    }

    fn harness(secret: SecretKey) -> Harness {
        let mgmt = InMemoryManagement::new(login_response());
        let signal_service = Arc::new(InMemorySignalService::default());
        let provider = Arc::new(CountingProvider {
            service: signal_service.clone(),
            calls: AtomicU32::new(0),
        });
        let device = Arc::new(MemoryDevice::new());
        let host_dns = RecordingHostDns::new();
        let status = Status::new();

        let mut config =
            ClientConfig::generate("http://mgmt.local:10000".parse().unwrap()).unwrap();
        config.private_key = Some(secret);

        let options = RunOptions {
            config,
            status: status.clone(),
            mgmt: mgmt.clone(),
            signal: provider.clone(),
            device: device.clone(),
            host_dns: Arc::new(host_dns.clone()),
            dns_exchange: ScriptedExchange::new(&[ScriptedResult::Answer]),
            route_sink: Arc::new(Arc::new(RecordingRouteSink::default())),
            firewall_applier: Arc::new(RecordingApplier::nftables()),
            prober: Arc::new(PermissiveProber),
            gatherer: Some(Arc::new(StaticGatherer(vec![Candidate::host(
                "192.0.2.1:51820".parse().unwrap(),
            )]))),
            kem: None,
        };

        Harness {
            mgmt,
            signal_service,
            provider,
            device,
            host_dns,
            status,
            options,
        }
    }

    /// Generates a pair where the first key is the controlling side.
    fn ordered_keys() -> (SecretKey, SecretKey) {
        loop {
            let a = SecretKey::generate();
            let b = SecretKey::generate();
            if a.public().controls(&b.public()) {
                return (a, b);
            }
        }
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    /// Starts a bare remote peer side: signal client plus one connection
    /// state machine answering offers.
    async fn start_remote_peer(
        service: &Arc<InMemorySignalService>,
        secret: SecretKey,
        local_of_remote: PublicKey,
        candidate: &str,
    ) -> (crate::peer::PeerHandle, mpsc::Receiver<PeerEvent>) {
        let public = secret.public();
        let signal = SignalClient::new(secret, service.transport(public));
        let cancel = CancellationToken::new();
        signal.start(cancel.clone(), Arc::new(NullNotifier));
        let mut up = signal.subscribe_connected();
        while !*up.borrow() {
            up.changed().await.unwrap();
        }

        let device = Arc::new(MemoryDevice::new());
        device
            .up("tl1", "100.64.0.7/16".parse().unwrap(), 51820)
            .await
            .unwrap();
        let status = Status::new();
        status.add_peer(local_of_remote, String::new(), String::new());
        let (events_tx, events_rx) = mpsc::channel(16);

        let handle = crate::peer::spawn(
            PeerConnConfig {
                remote_key: local_of_remote,
                local_key: public,
                gatherer: Arc::new(StaticGatherer(vec![Candidate::host(
                    candidate.parse().unwrap(),
                )])),
                prober: Arc::new(PermissiveProber),
                signal,
                device,
                events: events_tx,
                status,
                preshared_key: None,
                kem: None,
            },
            cancel.child_token(),
        );
        (handle, events_rx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bring_up_establishes_tunnel() {
        crate::util::setup_logging();
        let (key_a, key_b) = ordered_keys();
        let pub_b = key_b.public();
        let h = harness(key_a.clone());

        // the remote side waits for our offer
        let (remote, _remote_events) =
            start_remote_peer(&h.signal_service, key_b, key_a.public(), "192.0.2.2:51820").await;

        let ctx = CancellationToken::new();
        let run = tokio::spawn(run_client(ctx.clone(), h.options));

        // roster with one member appears
        wait_for("sync subscriber", || {
            h.mgmt.push(map_with(
                1,
                vec![RemotePeer {
                    public_key: pub_b,
                    allowed_ips: vec!["100.64.0.7/32".parse().unwrap()],
                    fqdn: "host-b.mesh.example".to_string(),
                    source_groups: vec![],
                    destination_groups: vec![],
                }],
            ));
            h.device.peer(&pub_b).is_some()
        })
        .await;

        // the nominated endpoint lands in the device entry
        wait_for("nominated endpoint", || {
            h.device
                .peer(&pub_b)
                .map(|p| p.endpoint == Some("192.0.2.2:51820".parse().unwrap()))
                .unwrap_or(false)
        })
        .await;

        assert_eq!(h.device.peers().len(), 1);
        assert_eq!(h.status.daemon_state(), DaemonState::Connected);
        assert_eq!(
            h.status.peer(&pub_b).unwrap().conn_status,
            ConnStatus::Connected
        );

        remote.stop().await;
        ctx.cancel();
        let result = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(h.status.daemon_state(), DaemonState::Idle);
        assert!(!h.device.is_up());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_management_flap_keeps_peers() {
        crate::util::setup_logging();
        let (key_a, key_b) = ordered_keys();
        let pub_b = key_b.public();
        let h = harness(key_a.clone());

        let (remote, _remote_events) =
            start_remote_peer(&h.signal_service, key_b, key_a.public(), "192.0.2.2:51820").await;

        let ctx = CancellationToken::new();
        let run = tokio::spawn(run_client(ctx.clone(), h.options));

        let map = map_with(
            7,
            vec![RemotePeer {
                public_key: pub_b,
                allowed_ips: vec!["100.64.0.7/32".parse().unwrap()],
                fqdn: "host-b.mesh.example".to_string(),
                source_groups: vec![],
                destination_groups: vec![],
            }],
        );
        wait_for("roster applied", || {
            h.mgmt.push(map.clone());
            h.device
                .peer(&pub_b)
                .map(|p| p.endpoint.is_some())
                .unwrap_or(false)
        })
        .await;
        let applies_before = h.host_dns.apply_count();
        let peers_before = h.device.peers();

        // sever the stream: status drops to Connecting, peers stay up
        h.mgmt.sever_streams();
        wait_for("status connecting", || {
            h.status.daemon_state() == DaemonState::Connecting
        })
        .await;
        assert_eq!(h.device.peers(), peers_before);

        // reconnect delivers the same serial: no OS-level changes
        wait_for("status reconnected", || {
            h.status.daemon_state() == DaemonState::Connected
        })
        .await;
        h.mgmt.push(map.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(h.device.peers(), peers_before);
        assert_eq!(h.host_dns.apply_count(), applies_before);

        remote.stop().await;
        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_permission_denied_is_terminal() {
        let h = harness(SecretKey::generate());
        h.mgmt.deny_logins();

        let ctx = CancellationToken::new();
        let result = run_client(ctx, h.options).await;

        assert!(matches!(result, Err(ClientError::Permission)));
        assert_eq!(h.status.daemon_state(), DaemonState::NeedsLogin);
        // no signal connection was ever attempted
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 0);
    }
}
