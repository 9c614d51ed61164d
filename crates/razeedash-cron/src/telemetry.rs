//! Structured logging setup for the job binaries.

/// Install JSON logging. `RUST_LOG` wins over `log_level` when set.
pub fn init(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .json()
        .init();
}
