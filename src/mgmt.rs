//! Client for the management service.
//!
//! Management owns membership and policy. The client logs the peer in with
//! its machine metadata, then keeps a server-streamed sync open over which
//! management pushes [`NetworkMap`] updates until the stream is cancelled.
//!
//! The login request is sealed to the server's static key; the response
//! comes back sealed to ours.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::candidate::TurnServer;
use crate::key::{PublicKey, SecretKey};
use crate::netmap::{LocalPeerConfig, NetworkMap};
use crate::status::ConnStateNotifier;
use crate::sysinfo::SystemInfo;

/// Errors from the management surface, mirroring the transport status codes
/// the supervisor drives its retry policy from.
#[derive(Debug, thiserror::Error)]
pub enum MgmtError {
    /// The server rejected our key. Terminal; the user must log in again.
    #[error("permission denied")]
    PermissionDenied,
    /// The request cannot be served until setup changes; retried.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    /// I/O or stream failure; retried.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// What the peer sends at login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub system_info: SystemInfoWire,
    /// OpenSSH single-line public key.
    pub ssh_public_key: String,
}

/// Wire form of [`SystemInfo`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfoWire {
    pub client_version: String,
    pub os: String,
    pub os_version: String,
    pub kernel: String,
    pub hostname: String,
    pub arch: String,
    pub cpus: usize,
}

impl From<SystemInfo> for SystemInfoWire {
    fn from(info: SystemInfo) -> Self {
        SystemInfoWire {
            client_version: info.client_version,
            os: info.os,
            os_version: info.os_version,
            kernel: info.kernel,
            hostname: info.hostname,
            arch: info.arch,
            cpus: info.cpus,
        }
    }
}

/// The initial global config returned by a successful login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    /// Address and name management assigned to this peer.
    pub peer: LocalPeerConfig,
    /// Where to reach the signal service; TLS by URL scheme.
    pub signal_url: Url,
    /// STUN servers for candidate gathering.
    pub stun_servers: Vec<SocketAddr>,
    /// TURN servers, with credentials, for relay candidates.
    pub turn_servers: Vec<TurnServer>,
}

/// The transport under the management client.
///
/// The concrete RPC binding lives outside this crate; tests use
/// [`testing::InMemoryManagement`].
#[async_trait]
pub trait ManagementTransport: Send + Sync + 'static {
    /// The server's static key, used to seal the login request.
    async fn server_public_key(&self) -> Result<PublicKey, MgmtError>;

    /// Performs login. `sealed_request` is the [`LoginRequest`] sealed to
    /// the server key; the return value is the [`LoginResponse`] sealed to
    /// `public_key`.
    async fn login(
        &self,
        public_key: PublicKey,
        sealed_request: Vec<u8>,
    ) -> Result<Vec<u8>, MgmtError>;

    /// Opens the sync stream. The stream ends when the receiver yields
    /// `None`.
    async fn sync(&self, public_key: PublicKey) -> Result<mpsc::Receiver<NetworkMap>, MgmtError>;
}

/// Client for the management service.
#[derive(Clone)]
pub struct ManagementClient {
    secret_key: Arc<SecretKey>,
    public_key: PublicKey,
    transport: Arc<dyn ManagementTransport>,
    notifier: Arc<dyn ConnStateNotifier>,
}

impl std::fmt::Debug for ManagementClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementClient")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl ManagementClient {
    pub fn new(
        secret_key: SecretKey,
        transport: Arc<dyn ManagementTransport>,
        notifier: Arc<dyn ConnStateNotifier>,
    ) -> Self {
        let public_key = secret_key.public();
        ManagementClient {
            secret_key: Arc::new(secret_key),
            public_key,
            transport,
            notifier,
        }
    }

    /// Logs in, sending machine metadata and the SSH public key, and returns
    /// the initial global config.
    pub async fn login(
        &self,
        system_info: SystemInfo,
        ssh_public_key: String,
    ) -> Result<LoginResponse, MgmtError> {
        let server_key = self.transport.server_public_key().await?;

        let request = LoginRequest {
            system_info: system_info.into(),
            ssh_public_key,
        };
        let cleartext = postcard::to_stdvec(&request)
            .map_err(|e| MgmtError::Transport(anyhow::anyhow!("encoding login request: {e}")))?;
        let sealed = self.secret_key.seal_to(&server_key, &cleartext);

        let sealed_response = self.transport.login(self.public_key, sealed).await?;
        let cleartext = self
            .secret_key
            .open_from(&server_key, &sealed_response)
            .map_err(MgmtError::Transport)?;
        let response: LoginResponse = postcard::from_bytes(&cleartext)
            .map_err(|e| MgmtError::Transport(anyhow::anyhow!("decoding login response: {e}")))?;

        debug!(
            address = %response.peer.address,
            fqdn = %response.peer.fqdn,
            "logged in to management"
        );
        Ok(response)
    }

    /// Opens the sync stream and marks the management connection up.
    ///
    /// The engine consumes the receiver; the stream ending surfaces there as
    /// a transient error. [`Self::disconnected`] must be called when the
    /// consumer gives up on the stream.
    pub async fn sync(&self) -> Result<mpsc::Receiver<NetworkMap>, MgmtError> {
        let rx = self.transport.sync(self.public_key).await?;
        self.notifier.on_connected();
        Ok(rx)
    }

    /// Marks the management connection down.
    pub fn disconnected(&self) {
        self.notifier.on_disconnected();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! An in-memory management service for tests.

    use std::sync::Mutex;

    use super::*;

    pub(crate) struct InMemoryManagement {
        secret_key: SecretKey,
        login_response: Mutex<Result<LoginResponse, &'static str>>,
        subscribers: Mutex<Vec<mpsc::Sender<NetworkMap>>>,
    }

    impl InMemoryManagement {
        pub(crate) fn new(login_response: LoginResponse) -> Arc<Self> {
            Arc::new(InMemoryManagement {
                secret_key: SecretKey::generate(),
                login_response: Mutex::new(Ok(login_response)),
                subscribers: Mutex::new(Vec::new()),
            })
        }

        /// Makes every subsequent login fail with `PermissionDenied`.
        pub(crate) fn deny_logins(&self) {
            *self.login_response.lock().unwrap() = Err("denied");
        }

        /// Pushes a map to every open sync stream.
        pub(crate) fn push(&self, map: NetworkMap) {
            let subscribers = self.subscribers.lock().unwrap().clone();
            for tx in subscribers {
                tx.try_send(map.clone()).ok();
            }
        }

        /// Severs all open sync streams.
        pub(crate) fn sever_streams(&self) {
            self.subscribers.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl ManagementTransport for InMemoryManagement {
        async fn server_public_key(&self) -> Result<PublicKey, MgmtError> {
            Ok(self.secret_key.public())
        }

        async fn login(
            &self,
            public_key: PublicKey,
            sealed_request: Vec<u8>,
        ) -> Result<Vec<u8>, MgmtError> {
            // the request must open with the caller's advertised key
            let cleartext = self
                .secret_key
                .open_from(&public_key, &sealed_request)
                .map_err(MgmtError::Transport)?;
            let _request: LoginRequest = postcard::from_bytes(&cleartext)
                .map_err(|e| MgmtError::Transport(anyhow::anyhow!("bad login request: {e}")))?;

            let response = self
                .login_response
                .lock()
                .unwrap()
                .clone()
                .map_err(|_| MgmtError::PermissionDenied)?;
            let cleartext = postcard::to_stdvec(&response)
                .map_err(|e| MgmtError::Transport(anyhow::anyhow!("encoding response: {e}")))?;
            Ok(self.secret_key.seal_to(&public_key, &cleartext))
        }

        async fn sync(
            &self,
            _public_key: PublicKey,
        ) -> Result<mpsc::Receiver<NetworkMap>, MgmtError> {
            let (tx, rx) = mpsc::channel(16);
            self.subscribers.lock().unwrap().push(tx);
            Ok(rx)
        }
    }
}
