//! Tracing setup.
//!
//! Hooks print machine-readable JSON on stdout, so all diagnostics go to
//! stderr. The filter comes from `ORK_LOG` (default `warn`) and
//! `ORK_LOG_FORMAT=json` switches to structured output.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

pub const LOG_ENV: &str = "ORK_LOG";
pub const LOG_FORMAT_ENV: &str = "ORK_LOG_FORMAT";

/// Guard returned by [`init`]. Held for the lifetime of `main`.
pub struct TelemetryGuard {
    _private: (),
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init() -> TelemetryGuard {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .without_time()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };
    // Already installed (e.g. in tests); keep the existing subscriber.
    let _ = result;

    TelemetryGuard { _private: () }
}
