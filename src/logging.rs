use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "VAULT_LOG";

/// Install the stderr subscriber. `VAULT_LOG` wins over `RUST_LOG`; both
/// fall back to `info`.
pub fn init() {
    let filter = std::env::var(LOG_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
