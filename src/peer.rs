//! Per-peer connection state machine.
//!
//! One task per remote peer drives the cycle
//! `Gathering → Offering/Answering → Checking → Connected`, falling back to
//! `Gathering` whenever the session dies. The peer with the smaller public
//! key is the controlling side and sends the offer; the other side answers.
//!
//! The task never mutates the tunnel device itself: nominations and
//! disconnects are reported as [`PeerEvent`]s and the engine applies them,
//! so all device mutation stays serialized in one place.

pub mod handshake;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use backoff::backoff::Backoff;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::candidate::{Candidate, CandidateGatherer, CandidatePair, CandidateType};
use crate::device::TunDevice;
use crate::key::PublicKey;
use crate::signal::{SessionDescription, SignalClient, SignalMessage, SignalPayload};
use crate::status::{ConnStatus, Status};

use self::handshake::{derive_preshared_key, Kem, SessionHandshake};

/// Persistent keepalive installed with every session.
pub const KEEPALIVE: Duration = Duration::from_secs(25);

/// Without a completed handshake within this window the session is reset.
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(3 * 25);

/// The bounded window connectivity checks run in.
const CHECK_WINDOW: Duration = Duration::from_secs(10);

/// How long the controlling side waits for an answer before recycling.
const ANSWER_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap of the signal send retry backoff during offer/answer.
const SIGNAL_RETRY_MAX: Duration = Duration::from_secs(30);

/// Pause before restarting gathering after a failed cycle.
const RECYCLE_DELAY: Duration = Duration::from_secs(2);

/// Negotiation sub-phase, reported alongside the connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcePhase {
    Gathering,
    Checking,
    Succeeded,
    Failed,
}

/// Runs a connectivity check against a candidate pair.
///
/// Injected so tests script outcomes; a production prober performs the
/// actual on-wire check.
#[async_trait]
pub trait PathProber: Send + Sync + 'static {
    async fn check(&self, pair: &CandidatePair) -> bool;
}

/// What the state machine reports to the engine.
#[derive(Debug)]
pub enum PeerEvent {
    /// A pair was nominated and the session handshake completed; the engine
    /// installs the endpoint and keys.
    Nominated {
        key: PublicKey,
        endpoint: SocketAddr,
        preshared_key: Option<[u8; 32]>,
        local_type: CandidateType,
        remote_type: CandidateType,
    },
    /// Liveness lapsed or the peer went away; the engine uninstalls the
    /// endpoint but keeps the allowed-ips.
    Disconnected { key: PublicKey },
}

/// Everything one state machine instance needs.
pub struct PeerConnConfig {
    pub remote_key: PublicKey,
    pub local_key: PublicKey,
    pub gatherer: Arc<dyn CandidateGatherer>,
    pub prober: Arc<dyn PathProber>,
    pub signal: SignalClient,
    pub device: Arc<dyn TunDevice>,
    pub events: mpsc::Sender<PeerEvent>,
    pub status: Status,
    /// Engine-level pre-shared key from the configuration.
    pub preshared_key: Option<[u8; 32]>,
    /// KEM for the supplementary handshake; set iff post-quantum mode is on.
    pub kem: Option<Arc<dyn Kem>>,
}

/// Handle the engine keeps per roster member.
#[derive(Debug)]
pub struct PeerHandle {
    pub key: PublicKey,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl PeerHandle {
    /// Stops the state machine and waits for the task to finish, so a
    /// replacement connection can never overlap with this one.
    pub async fn stop(self) {
        self.cancel.cancel();
        self.task.await.ok();
    }
}

/// Spawns the state machine for one remote peer.
///
/// `cancel` is a child of the engine's token; cancelling it stops the task.
pub fn spawn(config: PeerConnConfig, cancel: CancellationToken) -> PeerHandle {
    let key = config.remote_key;
    let mailbox = config.signal.register(key);
    let span = info_span!("peer", remote = %key.fmt_short());
    let conn = PeerConn {
        config,
        mailbox,
        cancel: cancel.clone(),
    };
    let task = tokio::spawn(conn.run().instrument(span));
    PeerHandle { key, cancel, task }
}

struct PeerConn {
    config: PeerConnConfig,
    mailbox: mpsc::Receiver<SignalMessage>,
    cancel: CancellationToken,
}

/// Outcome of one negotiation cycle.
enum CycleEnd {
    /// Session established; hold until liveness or a signal tells us to
    /// recycle.
    Connected,
    /// Start over with gathering.
    Recycle,
    Cancelled,
}

impl PeerConn {
    fn controlling(&self) -> bool {
        self.config.local_key.controls(&self.config.remote_key)
    }

    async fn run(mut self) {
        debug!(controlling = self.controlling(), "peer connection starting");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.cycle().await {
                CycleEnd::Connected => match self.hold().await {
                    CycleEnd::Cancelled => break,
                    _ => {
                        self.send_event(PeerEvent::Disconnected {
                            key: self.config.remote_key,
                        })
                        .await;
                        self.set_status(ConnStatus::Disconnected, IcePhase::Failed);
                    }
                },
                CycleEnd::Recycle => {
                    self.set_status(ConnStatus::Disconnected, IcePhase::Failed);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECYCLE_DELAY) => {}
                    }
                }
                CycleEnd::Cancelled => break,
            }
        }
        self.config.signal.deregister(&self.config.remote_key);
        debug!("peer connection stopped");
    }

    /// One pass of gathering, offer/answer and checking.
    async fn cycle(&mut self) -> CycleEnd {
        self.set_status(ConnStatus::Connecting, IcePhase::Gathering);

        let local_candidates = match self.config.gatherer.gather().await {
            Ok(candidates) if !candidates.is_empty() => candidates,
            Ok(_) => {
                warn!("no local candidates gathered");
                return CycleEnd::Recycle;
            }
            Err(err) => {
                warn!("candidate gathering failed: {err:#}");
                return CycleEnd::Recycle;
            }
        };

        let kem = self.config.kem.clone();
        let session = SessionHandshake::new(if self.controlling() {
            kem.as_deref()
        } else {
            None
        });

        let (remote, kem_shared) = if self.controlling() {
            match self.offer_and_wait(&session, &local_candidates).await {
                Some(result) => result,
                None => return self.recycle_or_cancelled(),
            }
        } else {
            match self.wait_and_answer(&session, &local_candidates).await {
                Some(result) => result,
                None => return self.recycle_or_cancelled(),
            }
        };

        self.set_status(ConnStatus::Connecting, IcePhase::Checking);
        let Some(pair) = self.check_pairs(&local_candidates, &remote.candidates).await else {
            return self.recycle_or_cancelled();
        };

        let preshared_key = derive_preshared_key(self.config.preshared_key, kem_shared);
        debug!(pair = %format_args!("{} -> {}", pair.local, pair.remote), "nominated pair");
        self.send_event(PeerEvent::Nominated {
            key: self.config.remote_key,
            endpoint: pair.remote.addr,
            preshared_key,
            local_type: pair.local.typ,
            remote_type: pair.remote.typ,
        })
        .await;
        self.set_status(ConnStatus::Connected, IcePhase::Succeeded);
        CycleEnd::Connected
    }

    fn recycle_or_cancelled(&self) -> CycleEnd {
        if self.cancel.is_cancelled() {
            CycleEnd::Cancelled
        } else {
            CycleEnd::Recycle
        }
    }

    /// Controlling side: send the offer, wait for the answer.
    ///
    /// Returns the remote description and, in post-quantum mode, the KEM
    /// shared secret recovered from the answer.
    async fn offer_and_wait(
        &mut self,
        session: &SessionHandshake,
        local_candidates: &[Candidate],
    ) -> Option<(SessionDescription, Option<[u8; 32]>)> {
        let offer = SignalPayload::Offer(SessionDescription {
            candidates: local_candidates.to_vec(),
            session_key: session.session_key(),
            kem: session.kem_public(),
        });
        if !self.send_with_retry(&offer).await {
            return None;
        }

        let deadline = tokio::time::Instant::now() + ANSWER_TIMEOUT;
        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("no answer within {ANSWER_TIMEOUT:?}, recycling");
                    return None;
                }
                msg = self.mailbox.recv() => msg?,
            };
            match msg.payload {
                SignalPayload::Answer(remote) => {
                    let kem_shared = match (&self.config.kem, &remote.kem) {
                        (Some(kem), Some(ciphertext)) => {
                            match session.kem_open(kem.as_ref(), ciphertext) {
                                Ok(shared) => Some(shared),
                                Err(err) => {
                                    warn!("KEM answer rejected: {err:#}");
                                    return None;
                                }
                            }
                        }
                        (Some(_), None) => {
                            warn!("answer lacks KEM material in post-quantum mode");
                            return None;
                        }
                        _ => None,
                    };
                    return Some((remote, kem_shared));
                }
                SignalPayload::Offer(_) => {
                    // both sides believe they control; the key order says
                    // otherwise, so the remote will see our offer and yield
                    trace!("ignoring offer while controlling");
                }
                SignalPayload::Candidate(candidate) => {
                    trace!(%candidate, "trickled candidate before answer, ignoring");
                }
                SignalPayload::GoAway => return None,
            }
        }
    }

    /// Controlled side: wait for an offer, reply with the answer.
    async fn wait_and_answer(
        &mut self,
        session: &SessionHandshake,
        local_candidates: &[Candidate],
    ) -> Option<(SessionDescription, Option<[u8; 32]>)> {
        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                msg = self.mailbox.recv() => msg?,
            };
            match msg.payload {
                SignalPayload::Offer(remote) => {
                    let (kem_ciphertext, kem_shared) = match (&self.config.kem, &remote.kem) {
                        (Some(kem), Some(encap_key)) => match kem.encapsulate(encap_key) {
                            Ok(out) => (Some(out.ciphertext), Some(out.shared)),
                            Err(err) => {
                                warn!("KEM offer rejected: {err:#}");
                                return None;
                            }
                        },
                        _ => (None, None),
                    };

                    let answer = SignalPayload::Answer(SessionDescription {
                        candidates: local_candidates.to_vec(),
                        session_key: session.session_key(),
                        kem: kem_ciphertext,
                    });
                    if !self.send_with_retry(&answer).await {
                        return None;
                    }
                    return Some((remote, kem_shared));
                }
                SignalPayload::Answer(_) => {
                    trace!("ignoring answer while controlled");
                }
                SignalPayload::Candidate(candidate) => {
                    trace!(%candidate, "trickled candidate before offer, ignoring");
                }
                SignalPayload::GoAway => return None,
            }
        }
    }

    /// Sends through signal, retrying with backoff while the stream is down.
    ///
    /// Persistent signal loss keeps us cycling here rather than failing
    /// upward; only cancellation stops the retries.
    async fn send_with_retry(&self, payload: &SignalPayload) -> bool {
        let mut backoff = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(100))
            .with_max_interval(SIGNAL_RETRY_MAX)
            .with_max_elapsed_time(None)
            .build();
        loop {
            match self.config.signal.send(self.config.remote_key, payload).await {
                Ok(()) => return true,
                Err(err) => {
                    let wait = backoff.next_backoff().unwrap_or(SIGNAL_RETRY_MAX);
                    trace!("signal send failed, retrying in {wait:?}: {err:#}");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return false,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// Runs connectivity checks in priority order within the check window.
    async fn check_pairs(
        &self,
        local: &[Candidate],
        remote: &[Candidate],
    ) -> Option<CandidatePair> {
        let controlling = self.controlling();
        let mut pairs: Vec<CandidatePair> = local
            .iter()
            .flat_map(|l| {
                remote.iter().map(move |r| CandidatePair {
                    local: l.clone(),
                    remote: r.clone(),
                })
            })
            .filter(|pair| pair.local.addr.is_ipv4() == pair.remote.addr.is_ipv4())
            .collect();
        pairs.sort_by_key(|pair| std::cmp::Reverse(pair.priority(controlling)));

        let checks = async {
            for pair in &pairs {
                if self.config.prober.check(pair).await {
                    return Some(pair.clone());
                }
                trace!(pair = %format_args!("{} -> {}", pair.local, pair.remote), "check failed");
            }
            None
        };

        tokio::select! {
            _ = self.cancel.cancelled() => None,
            _ = tokio::time::sleep(CHECK_WINDOW) => {
                debug!("no pair passed a check within {CHECK_WINDOW:?}");
                None
            }
            nominated = checks => nominated,
        }
    }

    /// Holds an established session: watches liveness and the mailbox.
    async fn hold(&mut self) -> CycleEnd {
        let installed_at = SystemTime::now();
        let mut tick = tokio::time::interval(KEEPALIVE);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return CycleEnd::Cancelled,
                _ = tick.tick() => {
                    if self.liveness_lapsed(installed_at).await {
                        debug!("no handshake within {LIVENESS_WINDOW:?}, resetting");
                        return CycleEnd::Recycle;
                    }
                }
                msg = self.mailbox.recv() => match msg {
                    Some(msg) => match msg.payload {
                        SignalPayload::GoAway => {
                            debug!("peer sent go-away");
                            return CycleEnd::Recycle;
                        }
                        SignalPayload::Offer(_) => {
                            // remote restarted its cycle; renegotiate
                            debug!("offer while connected, renegotiating");
                            return CycleEnd::Recycle;
                        }
                        other => trace!(?other, "ignoring signal message while connected"),
                    },
                    None => return CycleEnd::Cancelled,
                },
            }
        }
    }

    /// Polls device stats and updates the status recorder as a side effect.
    async fn liveness_lapsed(&self, installed_at: SystemTime) -> bool {
        let stats = match self.config.device.peer_stats(&self.config.remote_key).await {
            Ok(Some(stats)) => stats,
            Ok(None) => return false, // not installed yet; the engine is behind us
            Err(err) => {
                warn!("reading peer stats failed: {err:#}");
                return false;
            }
        };

        self.config.status.update_peer(&self.config.remote_key, |p| {
            p.last_handshake = stats.last_handshake;
            p.bytes_rx = stats.rx_bytes;
            p.bytes_tx = stats.tx_bytes;
        });

        let anchor = stats.last_handshake.unwrap_or(installed_at);
        match SystemTime::now().duration_since(anchor) {
            Ok(elapsed) => elapsed > LIVENESS_WINDOW,
            Err(_) => false,
        }
    }

    async fn send_event(&self, event: PeerEvent) {
        if self.config.events.send(event).await.is_err() {
            trace!("engine event channel closed");
        }
    }

    fn set_status(&self, conn: ConnStatus, phase: IcePhase) {
        trace!(?conn, ?phase, "state transition");
        self.config.status.update_peer(&self.config.remote_key, |p| {
            p.conn_status = conn;
            if conn != ConnStatus::Connected {
                p.relayed = false;
                p.direct = false;
            }
        });
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::candidate::StaticGatherer;
    use crate::device::MemoryDevice;
    use crate::key::SecretKey;
    use crate::signal::testing::{InMemorySignalService, NullNotifier};

    struct TestPeer {
        secret: SecretKey,
        signal: SignalClient,
        status: Status,
        device: Arc<MemoryDevice>,
        events_rx: mpsc::Receiver<PeerEvent>,
        events_tx: mpsc::Sender<PeerEvent>,
    }

    async fn test_peer(service: &Arc<InMemorySignalService>) -> TestPeer {
        let secret = SecretKey::generate();
        let public = secret.public();
        let signal = SignalClient::new(secret.clone(), service.transport(public));
        let cancel = CancellationToken::new();
        signal.start(cancel, Arc::new(NullNotifier));
        let mut up = signal.subscribe_connected();
        while !*up.borrow() {
            up.changed().await.unwrap();
        }

        let device = Arc::new(MemoryDevice::new());
        device
            .up("tl0", "100.64.0.1/16".parse().unwrap(), 51820)
            .await
            .unwrap();
        let (events_tx, events_rx) = mpsc::channel(16);
        TestPeer {
            secret,
            signal,
            status: Status::new(),
            device,
            events_rx,
            events_tx,
        }
    }

    fn conn_config(
        local: &TestPeer,
        remote_key: PublicKey,
        candidates: Vec<Candidate>,
        prober: Arc<dyn PathProber>,
        kem: Option<Arc<dyn Kem>>,
    ) -> PeerConnConfig {
        local.status.add_peer(
            remote_key,
            "100.64.0.9".to_string(),
            "peer.mesh.example".to_string(),
        );
        PeerConnConfig {
            remote_key,
            local_key: local.secret.public(),
            gatherer: Arc::new(StaticGatherer(candidates)),
            prober,
            signal: local.signal.clone(),
            device: local.device.clone(),
            events: local.events_tx.clone(),
            status: local.status.clone(),
            preshared_key: None,
            kem,
        }
    }

    fn host(addr: &str) -> Candidate {
        Candidate::host(addr.parse().unwrap())
    }

    #[tokio::test]
    async fn test_offer_answer_nominates_on_both_sides() {
        let service = Arc::new(InMemorySignalService::default());
        let mut a = test_peer(&service).await;
        let mut b = test_peer(&service).await;
        let key_a = a.secret.public();
        let key_b = b.secret.public();

        let cancel = CancellationToken::new();
        let conn_a = spawn(
            conn_config(
                &a,
                key_b,
                vec![host("192.0.2.1:51820")],
                Arc::new(PermissiveProber),
                None,
            ),
            cancel.child_token(),
        );
        let conn_b = spawn(
            conn_config(
                &b,
                key_a,
                vec![host("192.0.2.2:51820")],
                Arc::new(PermissiveProber),
                None,
            ),
            cancel.child_token(),
        );

        let event_a = a.events_rx.recv().await.unwrap();
        let event_b = b.events_rx.recv().await.unwrap();

        match (&event_a, &event_b) {
            (
                PeerEvent::Nominated {
                    endpoint: endpoint_a,
                    ..
                },
                PeerEvent::Nominated {
                    endpoint: endpoint_b,
                    ..
                },
            ) => {
                // each side nominated the other's candidate
                assert_eq!(*endpoint_a, "192.0.2.2:51820".parse().unwrap());
                assert_eq!(*endpoint_b, "192.0.2.1:51820".parse().unwrap());
            }
            other => panic!("expected nominations, got {other:?}"),
        }

        assert_eq!(
            a.status.peer(&key_b).unwrap().conn_status,
            ConnStatus::Connected
        );
        conn_a.stop().await;
        conn_b.stop().await;
    }

    #[tokio::test]
    async fn test_post_quantum_pair_agrees_on_psk() {
        let service = Arc::new(InMemorySignalService::default());
        let mut a = test_peer(&service).await;
        let mut b = test_peer(&service).await;
        let key_a = a.secret.public();
        let key_b = b.secret.public();
        let kem: Arc<dyn Kem> = Arc::new(handshake::SealedBoxKem);

        let cancel = CancellationToken::new();
        let conn_a = spawn(
            conn_config(
                &a,
                key_b,
                vec![host("192.0.2.1:51820")],
                Arc::new(PermissiveProber),
                Some(kem.clone()),
            ),
            cancel.child_token(),
        );
        let conn_b = spawn(
            conn_config(
                &b,
                key_a,
                vec![host("192.0.2.2:51820")],
                Arc::new(PermissiveProber),
                Some(kem),
            ),
            cancel.child_token(),
        );

        let event_a = a.events_rx.recv().await.unwrap();
        let event_b = b.events_rx.recv().await.unwrap();
        match (event_a, event_b) {
            (
                PeerEvent::Nominated {
                    preshared_key: psk_a,
                    ..
                },
                PeerEvent::Nominated {
                    preshared_key: psk_b,
                    ..
                },
            ) => {
                assert!(psk_a.is_some());
                assert_eq!(psk_a, psk_b);
            }
            other => panic!("expected nominations, got {other:?}"),
        }
        conn_a.stop().await;
        conn_b.stop().await;
    }

    #[tokio::test]
    async fn test_nomination_prefers_higher_priority_pair() {
        let service = Arc::new(InMemorySignalService::default());
        let mut a = test_peer(&service).await;
        let b = test_peer(&service).await;
        let key_a = a.secret.public();
        let key_b = b.secret.public();

        // remote advertises a host and a relay candidate; both pass checks
        let remote_candidates = vec![
            Candidate::relay(
                "198.51.100.3:3478".parse().unwrap(),
                "192.0.2.2:51820".parse().unwrap(),
            ),
            host("192.0.2.2:51820"),
        ];

        let cancel = CancellationToken::new();
        let conn_a = spawn(
            conn_config(
                &a,
                key_b,
                vec![host("192.0.2.1:51820")],
                Arc::new(PermissiveProber),
                None,
            ),
            cancel.child_token(),
        );
        let conn_b = spawn(
            conn_config(
                &b,
                key_a,
                remote_candidates,
                Arc::new(PermissiveProber),
                None,
            ),
            cancel.child_token(),
        );

        let event_a = a.events_rx.recv().await.unwrap();
        match event_a {
            PeerEvent::Nominated {
                endpoint,
                remote_type,
                ..
            } => {
                assert_eq!(endpoint, "192.0.2.2:51820".parse().unwrap());
                assert_eq!(remote_type, CandidateType::Host);
            }
            other => panic!("expected nomination, got {other:?}"),
        }
        conn_a.stop().await;
        conn_b.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_lapse_reports_disconnect() {
        let service = Arc::new(InMemorySignalService::default());
        let mut a = test_peer(&service).await;
        let mut b = test_peer(&service).await;
        let key_a = a.secret.public();
        let key_b = b.secret.public();

        let cancel = CancellationToken::new();
        let conn_a = spawn(
            conn_config(
                &a,
                key_b,
                vec![host("192.0.2.1:51820")],
                Arc::new(PermissiveProber),
                None,
            ),
            cancel.child_token(),
        );
        let conn_b = spawn(
            conn_config(
                &b,
                key_a,
                vec![host("192.0.2.2:51820")],
                Arc::new(PermissiveProber),
                None,
            ),
            cancel.child_token(),
        );

        // both connected; install device entries the way the engine would
        let nominated_a = a.events_rx.recv().await.unwrap();
        let _ = b.events_rx.recv().await.unwrap();
        let PeerEvent::Nominated { endpoint, .. } = nominated_a else {
            panic!("expected nomination");
        };
        a.device
            .update_peer(crate::device::DevicePeer {
                public_key: key_b,
                allowed_ips: vec!["100.64.0.9/32".parse().unwrap()],
                endpoint: Some(endpoint),
                preshared_key: None,
                keepalive: Some(KEEPALIVE),
            })
            .await
            .unwrap();

        // a handshake far in the past trips the liveness window
        a.device.set_peer_stats(
            key_b,
            crate::device::PeerStats {
                last_handshake: Some(SystemTime::now() - Duration::from_secs(200)),
                rx_bytes: 1,
                tx_bytes: 1,
            },
        );

        let event = a.events_rx.recv().await.unwrap();
        assert!(matches!(event, PeerEvent::Disconnected { key } if key == key_b));
        conn_a.stop().await;
        conn_b.stop().await;
    }
}
