use std::sync::Once;

/// Filter used when neither `RUST_LOG` nor the caller provides one.
pub const DEFAULT_FILTER: &str = "huddle_core=debug";

/// Install the global fmt subscriber. Only the first call has any effect.
pub fn init_logging(filter: Option<&str>) {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .or_else(|_| tracing_subscriber::EnvFilter::try_new(filter.unwrap_or(DEFAULT_FILTER)))
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(false)
            .try_init();
    });
}

/// Logger handed to embedders that want to write into the engine's log.
pub trait PublicLogger: Send + Sync {
    fn trace(&self, message: &str);
    fn debug(&self, message: &str);
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards to `tracing`, tagging each line with the caller's name.
#[derive(Debug, Clone)]
pub struct TracingLogger {
    caller: String,
}

impl PublicLogger for TracingLogger {
    fn trace(&self, message: &str) {
        tracing::trace!(caller = %self.caller, "{message}");
    }

    fn debug(&self, message: &str) {
        tracing::debug!(caller = %self.caller, "{message}");
    }

    fn info(&self, message: &str) {
        tracing::info!(caller = %self.caller, "{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!(caller = %self.caller, "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(caller = %self.caller, "{message}");
    }
}

pub fn new_logger(caller: &str) -> TracingLogger {
    TracingLogger {
        caller: caller.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(Some("huddle_core=trace"));
        init_logging(None);
        let logger = new_logger("tests");
        logger.info("logging ready");
        logger.error("still fine");
    }
}
