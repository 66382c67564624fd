//! Transport and protocol plumbing for talking to the platform gateway.
//!
//! A [`Connector`] opens purpose-tagged [`PlatformLink`]s: one long-lived
//! control link for request/response traffic, an event link for job pushes,
//! and short-lived transfer links for chunked asset movement.

pub mod chunking;
pub mod dispatch;
pub mod events;
pub mod frame;
pub mod gateway;
#[cfg(any(test, feature = "test_utils"))]
pub mod testkit;
pub mod wire;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use frame::FrameError;
use wire::Frame;

pub use chunking::{TransferConfig, TransferError};
pub use dispatch::{DispatchError, RequestDispatcher, RetryConfig};
pub use events::{EventConfig, EventFeed, EventHub};
pub use gateway::{GatewayConfig, GatewayLink, TcpConnector};

/// Connection lifecycle states for a gateway link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// How a link re-establishes itself after a drop.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectPolicy {
    /// Fail immediately, no reconnection.
    None,
    FixedInterval {
        delay: Duration,
        max_attempts: Option<u32>,
    },
    ExponentialBackoff {
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        max_attempts: Option<u32>,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::ExponentialBackoff {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: Some(5),
        }
    }
}

/// Transport-level failures on a gateway link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("connection closed by peer")]
    Closed,

    #[error("not connected")]
    NotConnected,

    #[error("reconnection failed after {attempts} attempts: {detail}")]
    ReconnectExhausted { attempts: u32, detail: String },

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

pub type LinkResult<T> = Result<T, LinkError>;

/// A full-duplex frame pipe to the platform gateway.
///
/// Implementations mark themselves disconnected on send or receive failure so
/// the next operation can re-establish the connection.
#[async_trait]
pub trait PlatformLink: Send + Sync + fmt::Debug {
    /// Send a frame over the link.
    async fn send(&self, frame: Frame) -> LinkResult<()>;

    /// Receive the next frame from the link.
    async fn receive(&self) -> LinkResult<Frame>;

    /// Current connection state.
    async fn state(&self) -> LinkState;

    /// Connect or reconnect the link.
    async fn connect(&self) -> LinkResult<()>;

    /// Disconnect the link.
    async fn disconnect(&self) -> LinkResult<()>;
}

/// What a freshly opened link will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPurpose {
    Control,
    Events,
    Transfer,
}

impl fmt::Display for LinkPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Control => f.write_str("control"),
            Self::Events => f.write_str("events"),
            Self::Transfer => f.write_str("transfer"),
        }
    }
}

/// Opens gateway links on demand.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn open(&self, purpose: LinkPurpose) -> LinkResult<Box<dyn PlatformLink>>;
}
