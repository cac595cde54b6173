//! Small shared helpers.

/// Installs a test subscriber so `RUST_LOG` works inside tests.
#[cfg(test)]
pub(crate) fn setup_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Strips a trailing dot from a DNS name, if present.
pub(crate) fn trim_dot(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

/// Appends the trailing dot to a DNS name, if missing.
pub(crate) fn with_dot(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}
