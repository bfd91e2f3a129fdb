//! Tracing initialisation for the `codebox` binaries.
//!
//! Logs always go to stderr: `codeboxd` owns stdout for its response
//! stream. Filtering honours `CODEBOX_LOG`, then `RUST_LOG`, then the level
//! passed in.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter directive source checked before `RUST_LOG`.
pub const LOG_ENV: &str = "CODEBOX_LOG";

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Install the global subscriber. `json` selects newline-delimited JSON.
///
/// Only the first call in a process takes effect.
pub fn init_tracing(json: bool, level: Level) {
    let registry = tracing_subscriber::registry().with(env_filter(level));
    let base = fmt::layer().with_target(false).with_writer(std::io::stderr);

    if json {
        registry.with(base.json()).try_init().ok();
    } else {
        registry.with(base).try_init().ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing(false, Level::WARN);
        init_tracing(true, Level::DEBUG);
    }
}
