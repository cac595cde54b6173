//! Answers questions about the host we are running on.
//!
//! The summary is sent to management at login so the admin surface can show
//! what kind of machine each peer is.

const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Contains a summary of the host we are running on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemInfo {
    /// Version of this client.
    pub client_version: String,
    /// Operating system family, e.g. "linux".
    pub os: String,
    /// Version of the OS, if available.
    pub os_version: String,
    /// Kernel version string, if available.
    pub kernel: String,
    /// Name of the host the client runs on.
    pub hostname: String,
    /// The host's machine architecture.
    pub arch: String,
    /// Number of logical CPUs.
    pub cpus: usize,
}

impl Default for SystemInfo {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|s| s.into_string().ok())
            .unwrap_or_default();
        // grab the first label
        let hostname = hostname.split('.').next().unwrap_or_default().to_string();
        let info = os_info::get();

        SystemInfo {
            client_version: PKG_VERSION.to_string(),
            os: std::env::consts::OS.to_string(),
            os_version: info.version().to_string(),
            kernel: info.edition().unwrap_or_default().to_string(),
            hostname,
            arch: std::env::consts::ARCH.to_string(),
            cpus: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}
