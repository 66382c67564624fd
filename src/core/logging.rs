//! Tracing setup for applications that want the SDK's defaults.
//!
//! Entirely optional: the SDK only ever emits through `tracing` macros, so
//! embedders with their own subscriber can skip this module.

use std::io;
use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Output shape for [`init_logging`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Text,
    /// One JSON object per line, for log collectors.
    Json,
}

/// Install a global subscriber writing to stderr.
///
/// The filter comes from `RUST_LOG` when set, otherwise `info` with SDK
/// internals at `debug`. Calling this more than once, or after another
/// subscriber is installed, is a no-op.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,meridian_sdk=debug"));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .with_target(true);
        let installed = match format {
            LogFormat::Text => builder.try_init(),
            LogFormat::Json => builder.json().try_init(),
        };
        // A host application may already own the global subscriber.
        let _ = installed;
    });
}
