//! TCP gateway link: framed, stateful, reconnecting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::frame::{self, EncodingFormat, MAX_FRAME_LEN};
use super::wire::Frame;
use super::{
    Connector, LinkError, LinkPurpose, LinkResult, LinkState, PlatformLink, ReconnectPolicy,
};

/// Configuration for a gateway connection.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway endpoint as `host:port`.
    pub addr: String,
    /// Ceiling on a single connection attempt.
    pub connect_timeout: Duration,
    pub reconnect_policy: ReconnectPolicy,
}

impl GatewayConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(5),
            reconnect_policy: ReconnectPolicy::default(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }
}

/// A framed TCP connection to the gateway.
///
/// The stream is held behind a mutex; callers alternate send and receive on
/// one task per link, which is how every link purpose uses it.
#[derive(Debug)]
pub struct GatewayLink {
    config: GatewayConfig,
    stream: Arc<Mutex<Option<TcpStream>>>,
    state: Arc<Mutex<LinkState>>,
    connect_attempts: Arc<Mutex<u32>>,
}

impl GatewayLink {
    /// Connect to the gateway, honoring the configured reconnect policy.
    pub async fn connect(config: GatewayConfig) -> LinkResult<Self> {
        let link = Self {
            config,
            stream: Arc::new(Mutex::new(None)),
            state: Arc::new(Mutex::new(LinkState::Disconnected)),
            connect_attempts: Arc::new(Mutex::new(0)),
        };
        link.establish().await?;
        Ok(link)
    }

    async fn establish(&self) -> LinkResult<()> {
        {
            let mut state = self.state.lock().await;
            *state = LinkState::Connecting;
        }
        let result = match self.config.reconnect_policy.clone() {
            ReconnectPolicy::None => self.try_connect().await,
            ReconnectPolicy::FixedInterval {
                delay,
                max_attempts,
            } => self.connect_fixed_interval(delay, max_attempts).await,
            ReconnectPolicy::ExponentialBackoff {
                initial_delay,
                max_delay,
                multiplier,
                max_attempts,
            } => {
                self.connect_exponential_backoff(initial_delay, max_delay, multiplier, max_attempts)
                    .await
            }
        };
        match result {
            Ok(stream) => {
                {
                    let mut guard = self.stream.lock().await;
                    *guard = Some(stream);
                }
                {
                    let mut state = self.state.lock().await;
                    *state = LinkState::Connected;
                }
                let mut attempts = self.connect_attempts.lock().await;
                *attempts += 1;
                debug!(addr = %self.config.addr, connects = *attempts, "gateway link connected");
                Ok(())
            }
            Err(err) => {
                let mut state = self.state.lock().await;
                *state = LinkState::Failed;
                error!(addr = %self.config.addr, error = %err, "gateway connection failed");
                Err(err)
            }
        }
    }

    async fn try_connect(&self) -> LinkResult<TcpStream> {
        let attempt = TcpStream::connect(&self.config.addr);
        match tokio::time::timeout(self.config.connect_timeout, attempt).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(LinkError::ConnectionFailed(format!(
                "{}: {err}",
                self.config.addr
            ))),
            Err(_) => Err(LinkError::ConnectTimeout(self.config.connect_timeout)),
        }
    }

    async fn connect_fixed_interval(
        &self,
        delay: Duration,
        max_attempts: Option<u32>,
    ) -> LinkResult<TcpStream> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.try_connect().await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    if let Some(max) = max_attempts {
                        if attempts >= max {
                            return Err(LinkError::ReconnectExhausted {
                                attempts,
                                detail: err.to_string(),
                            });
                        }
                    }
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "gateway connect failed, retrying at fixed interval"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn connect_exponential_backoff(
        &self,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        max_attempts: Option<u32>,
    ) -> LinkResult<TcpStream> {
        let mut attempts = 0u32;
        let mut delay = initial_delay;
        loop {
            attempts += 1;
            match self.try_connect().await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    if let Some(max) = max_attempts {
                        if attempts >= max {
                            return Err(LinkError::ReconnectExhausted {
                                attempts,
                                detail: err.to_string(),
                            });
                        }
                    }
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "gateway connect failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay.mul_f64(multiplier), max_delay);
                }
            }
        }
    }

    /// Send one frame, marking the link disconnected on any transport failure.
    async fn send_frame(&self, frame: &Frame) -> LinkResult<()> {
        let encoded = frame::encode_frame(frame)?;
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(LinkError::NotConnected)?;
        let result = async {
            stream.write_all(&encoded).await?;
            stream.flush().await?;
            Ok::<(), std::io::Error>(())
        }
        .await;
        if let Err(err) = result {
            *guard = None;
            drop(guard);
            let mut state = self.state.lock().await;
            *state = LinkState::Disconnected;
            return Err(LinkError::Io(err));
        }
        Ok(())
    }

    /// Receive one frame, marking the link disconnected on transport failure.
    /// A clean EOF from the peer surfaces as [`LinkError::Closed`].
    async fn receive_frame(&self) -> LinkResult<Frame> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(LinkError::NotConnected)?;
        let read = async {
            let mut len_bytes = [0u8; 4];
            stream.read_exact(&mut len_bytes).await?;
            let len = u32::from_be_bytes(len_bytes) as usize;
            if len > MAX_FRAME_LEN {
                // The stream cannot be re-aligned past an oversized frame.
                return Ok(Err(frame::FrameError::TooLarge { len }));
            }
            let mut format_byte = [0u8; 1];
            stream.read_exact(&mut format_byte).await?;
            let mut payload = vec![0u8; len];
            stream.read_exact(&mut payload).await?;
            Ok::<_, std::io::Error>(Ok((format_byte[0], payload)))
        }
        .await;
        match read {
            Ok(Ok((format_byte, payload))) => {
                drop(guard);
                let format = EncodingFormat::from_u8(format_byte)?;
                Ok(frame::decode_payload(format, &payload)?)
            }
            Ok(Err(frame_err)) => {
                *guard = None;
                drop(guard);
                let mut state = self.state.lock().await;
                *state = LinkState::Disconnected;
                Err(frame_err.into())
            }
            Err(err) => {
                *guard = None;
                drop(guard);
                let mut state = self.state.lock().await;
                *state = LinkState::Disconnected;
                if err.kind() == std::io::ErrorKind::UnexpectedEof {
                    info!(addr = %self.config.addr, "gateway closed the connection");
                    Err(LinkError::Closed)
                } else {
                    Err(LinkError::Io(err))
                }
            }
        }
    }

    async fn ensure_connected(&self) -> LinkResult<()> {
        let connected = {
            let guard = self.stream.lock().await;
            guard.is_some()
        };
        if connected {
            return Ok(());
        }
        debug!(addr = %self.config.addr, "gateway link down, reconnecting");
        self.establish().await
    }

    /// Send with one reconnect-and-retry on connection-class failures.
    async fn send_with_reconnect(&self, frame: &Frame) -> LinkResult<()> {
        self.ensure_connected().await?;
        match self.send_frame(frame).await {
            Ok(()) => Ok(()),
            Err(
                err @ (LinkError::ConnectionFailed(_)
                | LinkError::Closed
                | LinkError::NotConnected
                | LinkError::Io(_)),
            ) => {
                warn!(error = %err, "send failed, reconnecting once");
                self.establish().await?;
                self.send_frame(frame).await
            }
            Err(err) => Err(err),
        }
    }

    /// Receive with one reconnect-and-retry on connection-class failures.
    async fn receive_with_reconnect(&self) -> LinkResult<Frame> {
        self.ensure_connected().await?;
        match self.receive_frame().await {
            Ok(frame) => Ok(frame),
            Err(
                err @ (LinkError::ConnectionFailed(_)
                | LinkError::Closed
                | LinkError::NotConnected
                | LinkError::Io(_)),
            ) => {
                warn!(error = %err, "receive failed, reconnecting once");
                self.establish().await?;
                self.receive_frame().await
            }
            Err(err) => Err(err),
        }
    }

    async fn close(&self) -> LinkResult<()> {
        let mut guard = self.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            let _ = stream.shutdown().await;
        }
        drop(guard);
        let mut state = self.state.lock().await;
        *state = LinkState::Disconnected;
        debug!(addr = %self.config.addr, "gateway link closed");
        Ok(())
    }
}

#[async_trait]
impl PlatformLink for GatewayLink {
    async fn send(&self, frame: Frame) -> LinkResult<()> {
        self.send_with_reconnect(&frame).await
    }

    async fn receive(&self) -> LinkResult<Frame> {
        self.receive_with_reconnect().await
    }

    async fn state(&self) -> LinkState {
        *self.state.lock().await
    }

    async fn connect(&self) -> LinkResult<()> {
        self.establish().await
    }

    async fn disconnect(&self) -> LinkResult<()> {
        self.close().await
    }
}

impl Drop for GatewayLink {
    fn drop(&mut self) {
        debug!(addr = %self.config.addr, "gateway link dropped");
    }
}

/// Production [`Connector`]: opens one TCP link per purpose.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    config: GatewayConfig,
}

impl TcpConnector {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self, purpose: LinkPurpose) -> LinkResult<Box<dyn PlatformLink>> {
        debug!(%purpose, addr = %self.config.addr, "opening gateway link");
        let link = GatewayLink::connect(self.config.clone()).await?;
        Ok(Box::new(link))
    }
}
