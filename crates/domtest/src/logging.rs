//! Structured logging setup.
//!
//! The filter comes from `RUST_LOG`, defaulting to `info`. Both initializers
//! are safe to call more than once; only the first installs a subscriber.

use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a human-readable subscriber.
///
/// Returns `false` when a global subscriber was already set.
pub fn init_logging() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(false)
        .try_init()
        .is_ok()
}

/// Install a JSON subscriber, one event per line.
///
/// Returns `false` when a global subscriber was already set.
pub fn init_json_logging() -> bool {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter())
        .with_current_span(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_a_no_op() {
        let first = init_logging();
        assert!(!init_json_logging() || !first);
        assert!(!init_logging());
    }
}
