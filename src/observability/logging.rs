//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the global tracing subscriber
//! - Pick the output format (pretty for development, JSON for production)
//! - Let `RUST_LOG` override the configured level

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, ObservabilityConfig};

/// Build the filter: `RUST_LOG` when set, otherwise the configured level for this crate.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tcp_balancer={level},warn")))
}

/// Install the global subscriber. Calling it twice is harmless; the second call is ignored.
pub fn init_logging(config: &ObservabilityConfig) {
    let registry = tracing_subscriber::registry().with(env_filter(&config.log_level));

    let result = match config.log_format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_thread_names(true))
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_thread_names(true),
            )
            .try_init(),
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_does_not_panic() {
        let config = ObservabilityConfig::default();
        init_logging(&config);
        init_logging(&config);
    }
}
