//! Console diagnostics for applications embedding the client

use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{IndiError, IndiResult};

/// Install a console `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Fails if a global subscriber is already set.
pub fn init_logging() -> IndiResult<()> {
    init_logging_with("info")
}

/// Same as [`init_logging`] with an explicit fallback filter.
pub fn init_logging_with(default_filter: &str) -> IndiResult<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let console_layer = fmt::layer().with_target(false).with_ansi(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .try_init()
        .map_err(|e| IndiError::LoggingInit(e.to_string()))?;

    tracing::info!("Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let _ = init_logging_with("debug");
        assert!(matches!(init_logging(), Err(IndiError::LoggingInit(_))));
    }
}
