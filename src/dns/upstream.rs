//! Upstream resolvers and their liveness tracking.
//!
//! An upstream resolver forwards queries to its nameservers in order: the
//! first response wins, a timeout advances to the next server, any other
//! error fails the query immediately. Failures that happen sequentially are
//! counted; crossing the threshold deactivates the resolver's zones from the
//! host configuration until a probe gets an answer again.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use backoff::backoff::Backoff;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::service::response_from;

/// Sequential failures before a resolver deactivates itself.
const FAILS_TILL_DEACTIVATION: u32 = 5;

/// Cap of the probe backoff; also the advertised deactivation period.
const REACTIVATE_PERIOD: Duration = Duration::from_secs(30);

/// Hard timeout of a single upstream exchange.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(15);

/// The name probed to detect that upstreams answer again.
const PROBE_NAME: &str = "healthcheck.trellis.dev.";

/// Failure modes of one upstream exchange.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// The upstream did not answer in time; the next one is tried.
    #[error("upstream timed out")]
    Timeout,
    /// Any other failure; the query fails immediately.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One DNS round trip to an upstream server.
///
/// Injected so tests can script upstream behavior.
#[async_trait]
pub trait DnsExchange: Send + Sync + 'static {
    async fn exchange(&self, upstream: SocketAddr, query: &Message)
        -> Result<Message, ExchangeError>;
}

/// The production exchange: plain UDP with a hard timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpExchange;

#[async_trait]
impl DnsExchange for UdpExchange {
    async fn exchange(
        &self,
        upstream: SocketAddr,
        query: &Message,
    ) -> Result<Message, ExchangeError> {
        let bind: SocketAddr = if upstream.is_ipv4() {
            "0.0.0.0:0".parse().expect("valid addr")
        } else {
            "[::]:0".parse().expect("valid addr")
        };
        let socket = UdpSocket::bind(bind)
            .await
            .context("binding upstream socket")?;
        let wire = query.to_vec().context("encoding query")?;
        socket
            .send_to(&wire, upstream)
            .await
            .context("sending query")?;

        let mut buf = vec![0u8; 4096];
        let (len, _) = tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .map_err(|_| ExchangeError::Timeout)?
            .context("receiving response")?;
        let response = Message::from_vec(&buf[..len]).context("decoding response")?;
        Ok(response)
    }
}

/// Invoked when a resolver's liveness state flips.
///
/// The DNS server implements this to pull the affected zones out of the host
/// configuration and put them back; the host-fallback root resolver uses the
/// no-op implementation.
pub(crate) trait LivenessNotifier: Send + Sync + 'static {
    fn deactivate(&self);
    fn reactivate(&self);
}

pub(crate) struct NoopLiveness;

impl LivenessNotifier for NoopLiveness {
    fn deactivate(&self) {}
    fn reactivate(&self) {}
}

/// Forwards queries for one zone group to its nameservers.
#[derive(Clone)]
pub struct UpstreamResolver {
    upstreams: Vec<SocketAddr>,
    exchange: Arc<dyn DnsExchange>,
    fails: Arc<AtomicU32>,
    disabled: Arc<AtomicBool>,
    liveness: Arc<dyn LivenessNotifier>,
    /// Per-platform capability: whether liveness may deactivate zones.
    deactivation_enabled: bool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for UpstreamResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResolver")
            .field("upstreams", &self.upstreams)
            .field("disabled", &self.disabled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl UpstreamResolver {
    pub(crate) fn new(
        upstreams: Vec<SocketAddr>,
        exchange: Arc<dyn DnsExchange>,
        liveness: Arc<dyn LivenessNotifier>,
        deactivation_enabled: bool,
        parent: &CancellationToken,
    ) -> Self {
        UpstreamResolver {
            upstreams,
            exchange,
            fails: Arc::new(AtomicU32::new(0)),
            disabled: Arc::new(AtomicBool::new(false)),
            liveness,
            deactivation_enabled,
            cancel: parent.child_token(),
        }
    }

    pub(crate) fn upstreams(&self) -> &[SocketAddr] {
        &self.upstreams
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Stops serving and any running probe loop.
    pub(crate) fn stop(&self) {
        debug!(upstreams = ?self.upstreams, "stopping upstream resolver");
        self.cancel.cancel();
    }

    pub(crate) async fn handle(&self, query: &Message) -> Message {
        if self.cancel.is_cancelled() || self.is_disabled() {
            return response_from(query, ResponseCode::ServFail, Vec::new());
        }
        let response = self.forward(query).await;
        self.check_fails();
        response
    }

    async fn forward(&self, query: &Message) -> Message {
        for upstream in &self.upstreams {
            match self.exchange.exchange(*upstream, query).await {
                Ok(mut response) => {
                    trace!(%upstream, "upstream answered");
                    // count fails only when they happen sequentially
                    self.fails.store(0, Ordering::SeqCst);
                    response.set_id(query.id());
                    return response;
                }
                Err(ExchangeError::Timeout) => {
                    warn!(%upstream, "upstream timed out, trying next");
                    continue;
                }
                Err(err) => {
                    self.fails.fetch_add(1, Ordering::SeqCst);
                    warn!(%upstream, "upstream query failed: {err:#}");
                    return response_from(query, ResponseCode::ServFail, Vec::new());
                }
            }
        }
        self.fails.fetch_add(1, Ordering::SeqCst);
        error!("all queries to the upstream nameservers failed with timeout");
        response_from(query, ResponseCode::ServFail, Vec::new())
    }

    /// Counts fails and deactivates upstream resolving when the threshold is
    /// crossed. A probe loop then reactivates on the first response.
    fn check_fails(&self) {
        if self.fails.load(Ordering::SeqCst) < FAILS_TILL_DEACTIVATION {
            return;
        }
        if !self.deactivation_enabled || self.cancel.is_cancelled() {
            return;
        }

        // concurrent queries can cross the threshold together; flipping the
        // flag picks a single winner, so the hook fires and the probe loop
        // spawns exactly once per deactivation
        if self
            .disabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        warn!(
            upstreams = ?self.upstreams,
            "upstream resolving is disabled for {REACTIVATE_PERIOD:?}"
        );
        self.liveness.deactivate();

        let resolver = self.clone();
        tokio::spawn(async move { resolver.probe_until_response().await });
    }

    /// Probes the upstreams with exponential backoff until one answers, then
    /// reactivates.
    async fn probe_until_response(&self) {
        let mut backoff = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_multiplier(1.1)
            .with_max_interval(REACTIVATE_PERIOD)
            .with_max_elapsed_time(None)
            .build();

        let query = probe_query();
        loop {
            if self.cancel.is_cancelled() {
                debug!("probe loop cancelled");
                return;
            }
            for upstream in &self.upstreams {
                if self.exchange.exchange(*upstream, &query).await.is_ok() {
                    info!(
                        upstreams = ?self.upstreams,
                        "upstreams are responsive again, adding them back"
                    );
                    self.fails.store(0, Ordering::SeqCst);
                    self.liveness.reactivate();
                    self.disabled.store(false, Ordering::SeqCst);
                    return;
                }
            }
            let wait = backoff.next_backoff().unwrap_or(REACTIVATE_PERIOD);
            trace!("upstreams still unresponsive, retrying in {wait:?}");
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

/// The canary query sent by the probe loop.
fn probe_query() -> Message {
    let mut msg = Message::new();
    msg.set_id(rand::random());
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(
        Name::from_utf8(PROBE_NAME).expect("valid probe name"),
        RecordType::A,
    ));
    msg
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn resolver(
        exchange: Arc<ScriptedExchange>,
        liveness: Arc<RecordingLiveness>,
        deactivation: bool,
    ) -> UpstreamResolver {
        UpstreamResolver::new(
            vec!["10.0.0.2:53".parse().unwrap()],
            exchange,
            Arc::new(liveness),
            deactivation,
            &CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_answer_resets_fail_counter() {
        let exchange = ScriptedExchange::new(&[
            ScriptedResult::Error,
            ScriptedResult::Error,
            ScriptedResult::Answer,
        ]);
        let liveness = Arc::new(RecordingLiveness::default());
        let r = resolver(exchange, liveness.clone(), true);

        let q = probe_query();
        assert_eq!(
            r.handle(&q).await.response_code(),
            ResponseCode::ServFail
        );
        assert_eq!(r.handle(&q).await.response_code(), ResponseCode::ServFail);
        assert_eq!(r.handle(&q).await.response_code(), ResponseCode::NoError);
        assert_eq!(r.fails.load(Ordering::SeqCst), 0);
        assert!(!r.is_disabled());
        assert_eq!(liveness.deactivations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_five_sequential_failures_deactivate_once() {
        let exchange = ScriptedExchange::new(&[ScriptedResult::Timeout]);
        let liveness = Arc::new(RecordingLiveness::default());
        let r = resolver(exchange, liveness.clone(), true);

        let q = probe_query();
        for _ in 0..FAILS_TILL_DEACTIVATION {
            let resp = r.handle(&q).await;
            assert_eq!(resp.response_code(), ResponseCode::ServFail);
        }
        assert!(r.is_disabled());
        assert_eq!(liveness.deactivations.load(Ordering::SeqCst), 1);

        // further queries short-circuit and do not deactivate again
        let resp = r.handle(&q).await;
        assert_eq!(resp.response_code(), ResponseCode::ServFail);
        assert_eq!(liveness.deactivations.load(Ordering::SeqCst), 1);
        r.stop();
    }

    #[tokio::test]
    async fn test_probe_reactivates_on_first_answer() {
        let exchange = ScriptedExchange::new(&[ScriptedResult::Timeout]);
        let liveness = Arc::new(RecordingLiveness::default());
        let r = resolver(exchange.clone(), liveness.clone(), true);

        let q = probe_query();
        for _ in 0..FAILS_TILL_DEACTIVATION {
            r.handle(&q).await;
        }
        assert!(r.is_disabled());

        // upstream comes back; the probe loop notices within one backoff
        exchange.set_script(&[ScriptedResult::Answer]);
        tokio::time::timeout(Duration::from_secs(5), async {
            while r.is_disabled() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("resolver reactivates");

        assert_eq!(liveness.reactivations.load(Ordering::SeqCst), 1);
        assert_eq!(r.fails.load(Ordering::SeqCst), 0);
        r.stop();
    }

    #[tokio::test]
    async fn test_deactivation_disabled_by_capability_flag() {
        let exchange = ScriptedExchange::new(&[ScriptedResult::Timeout]);
        let liveness = Arc::new(RecordingLiveness::default());
        let r = resolver(exchange, liveness.clone(), false);

        let q = probe_query();
        for _ in 0..(FAILS_TILL_DEACTIVATION + 2) {
            r.handle(&q).await;
        }
        assert!(!r.is_disabled());
        assert_eq!(liveness.deactivations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_advances_to_next_upstream() {
        let exchange = ScriptedExchange::new(&[ScriptedResult::Timeout, ScriptedResult::Answer]);
        let r = UpstreamResolver::new(
            vec!["10.0.0.2:53".parse().unwrap(), "10.0.0.3:53".parse().unwrap()],
            exchange.clone(),
            Arc::new(Arc::new(RecordingLiveness::default())),
            true,
            &CancellationToken::new(),
        );

        let resp = r.handle(&probe_query()).await;
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 2);
    }
}
