//! Client connection engine for an overlay mesh VPN.
//!
//! Every participating host runs this engine: given a peer roster and policy
//! delivered by a management service, it establishes NAT-traversed,
//! encrypted point-to-point tunnels to each remote peer and keeps a local
//! DNS resolver and route/firewall surface in sync with that roster.
//!
//! The engine is a library. External collaborators are injected as
//! capability objects: the management and signal transports, the tunnel
//! device, OS routes, the firewall, and host DNS configuration all arrive as
//! trait objects, so the engine itself stays portable and testable.
//!
//! The main entry point is [`supervisor::run_client`], which owns the whole
//! lifecycle: management login, signal connection, engine construction, and
//! restarts under exponential backoff.

pub mod candidate;
pub mod config;
pub mod device;
pub mod dns;
pub mod engine;
pub mod firewall;
pub mod key;
pub mod mgmt;
pub mod netmap;
pub mod peer;
pub mod routes;
pub mod signal;
pub mod status;
pub mod supervisor;
pub mod sysinfo;

mod util;

pub use crate::config::{ClientConfig, EngineConfig};
pub use crate::engine::{Engine, EngineOptions};
pub use crate::key::{PublicKey, SecretKey};
pub use crate::netmap::NetworkMap;
pub use crate::status::{DaemonState, Status};
pub use crate::supervisor::{run_client, ClientError, RunOptions};
