//! Tracing subscriber setup

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "segment_dl=info";

/// Install a fmt subscriber. Safe to call more than once; later calls are
/// no-ops.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
        tracing::info!("tracing initialized twice");
    }
}
