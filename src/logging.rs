//! Logging and tracing setup.
//!
//! The engine only emits `tracing` events; embedding applications decide
//! whether to install one of these subscribers or their own. Graph builds
//! run inside a `build_call_graph` span whose close event carries the build
//! time, and worker thread ids tell rayon workers apart.

use std::sync::Once;
use tracing::debug;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

static INIT: Once = Once::new();

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    Pretty,
    /// One JSON object per event
    Json,
}

/// Install the global subscriber once. `RUST_LOG` wins over
/// `default_filter`. Later calls, and calls after a host application has
/// installed its own subscriber, do nothing.
pub fn init(format: LogFormat, default_filter: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));
        let registry = tracing_subscriber::registry().with(filter);
        let installed = match format {
            LogFormat::Pretty => registry
                .with(
                    fmt::layer()
                        .with_span_events(FmtSpan::CLOSE)
                        .with_thread_ids(true)
                        .with_target(false),
                )
                .try_init(),
            LogFormat::Json => registry
                .with(
                    fmt::layer()
                        .json()
                        .with_span_events(FmtSpan::CLOSE)
                        .with_thread_ids(true)
                        .with_current_span(true),
                )
                .try_init(),
        };
        if installed.is_ok() {
            debug!(?format, "xrefscan tracing initialized");
        }
    });
}

/// Human-readable output at `info` unless `RUST_LOG` says otherwise.
pub fn init_tracing() {
    init(LogFormat::Pretty, "info");
}

/// JSON output at `info` unless `RUST_LOG` says otherwise.
pub fn init_tracing_json() {
    init(LogFormat::Json, "info");
}
