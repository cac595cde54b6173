//! Client for the signal exchange service.
//!
//! Signal relays sealed envelopes between peers that cannot talk to each
//! other yet. An envelope carries sender and recipient public keys and a
//! body sealed with the shared secret of those two static keys; the relay
//! only ever sees ciphertext.
//!
//! The client keeps one duplex stream open, reconnecting with capped
//! exponential backoff. Inbound messages are dispatched to a per-peer
//! mailbox; messages for unknown peers are dropped. Nothing is replayed on
//! reconnect, the per-peer state machines re-drive their own exchange.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::candidate::Candidate;
use crate::key::{PublicKey, SecretKey};
use crate::status::ConnStateNotifier;

/// Capacity of each peer mailbox and of the outbound queue.
const QUEUE_DEPTH: usize = 64;

/// Cap of the reconnect backoff.
const RECONNECT_MAX_INTERVAL: Duration = Duration::from_secs(15);

/// A sealed message in flight between two peers.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: PublicKey,
    pub to: PublicKey,
    /// Sealed [`SignalPayload`].
    pub body: Vec<u8>,
}

/// Session negotiation material carried in offers and answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// The sender's current candidate set.
    pub candidates: Vec<Candidate>,
    /// Ephemeral session public key; tunnel keys are only installed after
    /// both sides have exchanged one.
    pub session_key: [u8; 32],
    /// Supplementary key-exchange material when post-quantum mode is on:
    /// the encapsulation key in an offer, the ciphertext in an answer.
    pub kem: Option<Vec<u8>>,
}

/// Decrypted body of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(Candidate),
    /// The peer is going away; tear down without waiting for liveness.
    GoAway,
}

/// A decrypted inbound message, as delivered to a peer mailbox.
#[derive(Debug, Clone)]
pub struct SignalMessage {
    pub from: PublicKey,
    pub payload: SignalPayload,
}

/// The duplex stream transport to the signal service.
///
/// The concrete RPC binding lives outside this crate; tests wire two clients
/// back-to-back with [`InMemorySignal`](self::testing::InMemorySignal).
#[async_trait]
pub trait SignalTransport: Send + Sync + 'static {
    /// Opens the stream. The sender half carries outbound envelopes, the
    /// receiver half delivers inbound ones. The stream is closed when the
    /// receiver yields `None`.
    async fn open(&self) -> Result<(mpsc::Sender<Envelope>, mpsc::Receiver<Envelope>)>;
}

type Mailboxes = Arc<Mutex<HashMap<PublicKey, mpsc::Sender<SignalMessage>>>>;

/// Client for the signal service.
///
/// Cheap to clone; all clones share the stream and the dispatch table.
#[derive(Clone)]
pub struct SignalClient {
    secret_key: Arc<SecretKey>,
    public_key: PublicKey,
    transport: Arc<dyn SignalTransport>,
    mailboxes: Mailboxes,
    outbound: mpsc::Sender<Envelope>,
    outbound_rx: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<Envelope>>>>,
    connected: watch::Sender<bool>,
}

impl std::fmt::Debug for SignalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalClient")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl SignalClient {
    pub fn new(secret_key: SecretKey, transport: Arc<dyn SignalTransport>) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let (connected, _) = watch::channel(false);
        let public_key = secret_key.public();
        SignalClient {
            secret_key: Arc::new(secret_key),
            public_key,
            transport,
            mailboxes: Default::default(),
            outbound,
            outbound_rx: Arc::new(tokio::sync::Mutex::new(Some(outbound_rx))),
            connected,
        }
    }

    /// Registers a mailbox for inbound messages from `remote`.
    ///
    /// A second registration for the same key replaces the first; the engine
    /// guarantees at most one peer connection per key.
    pub fn register(&self, remote: PublicKey) -> mpsc::Receiver<SignalMessage> {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        self.mailboxes.lock().unwrap().insert(remote, tx);
        rx
    }

    pub fn deregister(&self, remote: &PublicKey) {
        self.mailboxes.lock().unwrap().remove(remote);
    }

    /// Whether the stream is currently up.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Subscribe to stream up/down transitions.
    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Seals `payload` to `to` and queues it for sending.
    ///
    /// Fails when the stream is down or the queue is full; callers retry
    /// with their own backoff.
    pub async fn send(&self, to: PublicKey, payload: &SignalPayload) -> Result<()> {
        anyhow::ensure!(self.is_connected(), "signal stream is down");
        let cleartext = postcard::to_stdvec(payload).context("encoding signal payload")?;
        let body = self.secret_key.seal_to(&to, &cleartext);
        let envelope = Envelope {
            from: self.public_key,
            to,
            body,
        };
        self.outbound
            .try_send(envelope)
            .context("signal send queue full")?;
        Ok(())
    }

    /// Runs the stream until `cancel` fires, reconnecting on stream loss.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        notifier: Arc<dyn ConnStateNotifier>,
    ) -> Result<()> {
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .context("signal client is already running")?;

        let mut backoff = reconnect_backoff();
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let (tx, mut rx) = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.transport.open() => match res {
                    Ok(stream) => stream,
                    Err(err) => {
                        let wait = backoff
                            .next_backoff()
                            .unwrap_or(RECONNECT_MAX_INTERVAL);
                        warn!("signal connect failed, retrying in {wait:?}: {err:#}");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(wait) => continue,
                        }
                    }
                },
            };

            backoff.reset();
            self.connected.send_replace(true);
            notifier.on_connected();
            debug!("signal stream established");

            let disconnect_reason = loop {
                tokio::select! {
                    _ = cancel.cancelled() => break "cancelled",
                    outgoing = outbound_rx.recv() => match outgoing {
                        Some(envelope) => {
                            if tx.send(envelope).await.is_err() {
                                break "stream closed while sending";
                            }
                        }
                        None => break "client dropped",
                    },
                    incoming = rx.recv() => match incoming {
                        Some(envelope) => self.dispatch(envelope),
                        None => break "stream closed",
                    },
                }
            };

            self.connected.send_replace(false);
            notifier.on_disconnected();
            debug!("signal stream lost: {disconnect_reason}");
            if cancel.is_cancelled() {
                break;
            }
        }

        self.connected.send_replace(false);
        Ok(())
    }

    /// Spawns [`Self::run`] on the runtime.
    pub fn start(&self, cancel: CancellationToken, notifier: Arc<dyn ConnStateNotifier>) {
        let client = self.clone();
        tokio::spawn(
            async move {
                if let Err(err) = client.run(cancel, notifier).await {
                    warn!("signal client stopped: {err:#}");
                }
            }
            .instrument(info_span!("signal.client")),
        );
    }

    fn dispatch(&self, envelope: Envelope) {
        if envelope.to != self.public_key {
            warn!(
                to = %envelope.to.fmt_short(),
                "dropping envelope not addressed to us"
            );
            return;
        }

        let cleartext = match self.secret_key.open_from(&envelope.from, &envelope.body) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    from = %envelope.from.fmt_short(),
                    "dropping envelope that fails to open: {err:#}"
                );
                return;
            }
        };
        let payload: SignalPayload = match postcard::from_bytes(&cleartext) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    from = %envelope.from.fmt_short(),
                    "dropping undecodable payload: {err}"
                );
                return;
            }
        };

        let mailbox = self.mailboxes.lock().unwrap().get(&envelope.from).cloned();
        match mailbox {
            Some(mailbox) => {
                trace!(from = %envelope.from.fmt_short(), "dispatching signal message");
                if mailbox
                    .try_send(SignalMessage {
                        from: envelope.from,
                        payload,
                    })
                    .is_err()
                {
                    warn!(
                        from = %envelope.from.fmt_short(),
                        "peer mailbox full, dropping signal message"
                    );
                }
            }
            None => {
                warn!(
                    from = %envelope.from.fmt_short(),
                    "no mailbox for sender, dropping signal message"
                );
            }
        }
    }
}

fn reconnect_backoff() -> backoff::exponential::ExponentialBackoff<backoff::SystemClock> {
    backoff::exponential::ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(200))
        .with_max_interval(RECONNECT_MAX_INTERVAL)
        .with_max_elapsed_time(None)
        .build()
}

#[cfg(test)]
pub(crate) mod testing {
    //! An in-memory signal service for tests.

    use super::*;

    /// Routes envelopes between registered transports, like the real relay
    /// but in-process.
    #[derive(Default)]
    pub(crate) struct InMemorySignalService {
        routes: Mutex<HashMap<PublicKey, mpsc::Sender<Envelope>>>,
    }

    impl InMemorySignalService {
        pub(crate) fn transport(self: &Arc<Self>, key: PublicKey) -> Arc<InMemorySignal> {
            Arc::new(InMemorySignal {
                service: self.clone(),
                key,
                down: Mutex::new(false),
            })
        }

        fn deliver(&self, envelope: Envelope) {
            let target = self.routes.lock().unwrap().get(&envelope.to).cloned();
            if let Some(target) = target {
                target.try_send(envelope).ok();
            }
        }
    }

    pub(crate) struct InMemorySignal {
        service: Arc<InMemorySignalService>,
        key: PublicKey,
        down: Mutex<bool>,
    }

    impl InMemorySignal {
        /// Makes subsequent `open` calls fail, simulating an outage.
        #[allow(dead_code)]
        pub(crate) fn set_down(&self, down: bool) {
            *self.down.lock().unwrap() = down;
        }
    }

    #[async_trait]
    impl SignalTransport for InMemorySignal {
        async fn open(&self) -> Result<(mpsc::Sender<Envelope>, mpsc::Receiver<Envelope>)> {
            anyhow::ensure!(!*self.down.lock().unwrap(), "signal service unreachable");

            let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_DEPTH);
            self.service
                .routes
                .lock()
                .unwrap()
                .insert(self.key, inbound_tx);

            let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(QUEUE_DEPTH);
            let service = self.service.clone();
            tokio::spawn(async move {
                while let Some(envelope) = outbound_rx.recv().await {
                    service.deliver(envelope);
                }
            });

            Ok((outbound_tx, inbound_rx))
        }
    }

    pub(crate) struct NullNotifier;

    impl ConnStateNotifier for NullNotifier {
        fn on_connected(&self) {}
        fn on_disconnected(&self) {}
    }
}
