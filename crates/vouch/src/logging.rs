//! Tracing subscriber setup for pool hosts and worker binaries.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Level filter used when `RUST_LOG` is not set.
///
/// `VOUCH_LOG` picks the level for the `vouch` target only, so host
/// applications are not flooded with their dependencies' logs.
fn default_filter(vouch_log: Option<&str>) -> String {
    let level = match vouch_log {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("vouch={level}")
}

/// Install a global subscriber writing to stderr.
///
/// Stdout is reserved for the worker protocol, so this never logs there.
/// Calling it again, or after the host installed its own subscriber, does
/// nothing.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_filter(std::env::var("VOUCH_LOG").ok().as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
