//! Telemetry and Observability
//!
//! Sets up `tracing-subscriber` for structured logging. Session, step and
//! tool names travel as span/event fields, so JSON output can be filtered per
//! session.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber with the given log level from config.
///
/// Priority: `RUST_LOG` env var > `log_level` parameter > default "info"
///
/// Debug builds print to the terminal in pretty form; release builds emit
/// JSON with the current span attached. Logs go to stderr so stdout stays
/// free for command output.
pub fn init_telemetry_with_level(log_level: &str) {
    let default_filter = format!(
        "{},conduit_engine={},sqlx=warn,hyper=warn,reqwest=warn",
        log_level, log_level
    );

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_filter));

    #[cfg(debug_assertions)]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .ok();
    }

    #[cfg(not(debug_assertions))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .ok();
    }
}

