//! Client composition, configuration, errors, and logging.

pub mod client;
pub mod config;
pub mod error;
pub mod logging;

pub use client::MeridianClient;
pub use config::{ConfigError, PlatformConfig};
pub use error::{Error, Result};
pub use logging::{init_logging, LogFormat};
