//! Structured logging setup shared by every binary in the crate.
//!
//! Every binary (`agen-broker`, `agen-orchestrator`, and agent binaries
//! built on [`crate::runtime`]) calls [`init_tracing`] once at startup.

use tracing_subscriber::EnvFilter;

/// Environment variable selecting the log output format. `json` for
/// structured output suitable for log aggregation, anything else (or
/// unset) for human-readable text.
pub const ENV_LOG_FORMAT: &str = "AGEN_LOG_FORMAT";

/// Installs the crate's tracing subscriber: an [`EnvFilter`] seeded from
/// `RUST_LOG` with `default_directive` as the fallback, formatted as JSON
/// or plain text per [`ENV_LOG_FORMAT`].
///
/// Panics if a global subscriber has already been installed in this
/// process, as with any `tracing_subscriber::fmt().init()` call.
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let json = std::env::var(ENV_LOG_FORMAT).map(|v| v.eq_ignore_ascii_case("json")).unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_log_format_constant_matches_documented_name() {
        assert_eq!(ENV_LOG_FORMAT, "AGEN_LOG_FORMAT");
    }
}
