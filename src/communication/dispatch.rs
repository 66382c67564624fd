//! Request/response dispatch over the control link.
//!
//! One exchange is in flight at a time. Transient failures (5xx, transport
//! drops, response timeouts) are retried with jittered exponential backoff;
//! authentication rejections and other 4xx outcomes are never retried. A
//! retry reuses the original `request_id`, which makes it idempotent on the
//! platform side and lets a late response for an earlier attempt satisfy the
//! current one.

use std::time::Duration;

use http::StatusCode;
use rand::Rng as _;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::wire::{ClientRequest, Frame, PlatformReply, WireRequest, WireResponse};
use super::{LinkError, PlatformLink};
use crate::security::credentials::Credential;

/// Retry behavior for transient control-path failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the delay randomized to avoid thundering herds.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }
}

/// Failures classified by the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("authentication rejected by the platform (status {status})")]
    AuthenticationFailed { status: u16 },

    #[error("request rejected by the platform (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("platform error (status {status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("platform unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: String },

    #[error("no response within {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("protocol violation: {detail}")]
    Protocol { detail: String },
}

impl DispatchError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Upstream { .. } | Self::Timeout { .. } | Self::Link(_)
        )
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::AuthenticationFailed { .. })
    }
}

/// Builds the error for a structurally valid reply of the wrong kind.
pub(crate) fn unexpected_reply(expected: &str, got: &PlatformReply) -> DispatchError {
    DispatchError::Protocol {
        detail: format!("expected {expected} reply, got {}", got.kind()),
    }
}

/// Serializes request/response exchanges over one control link.
#[derive(Debug)]
pub struct RequestDispatcher {
    link: Box<dyn PlatformLink>,
    credential: Credential,
    retry: RetryConfig,
    request_timeout: Duration,
    io_lock: Mutex<()>,
}

impl RequestDispatcher {
    pub fn new(
        link: Box<dyn PlatformLink>,
        credential: Credential,
        retry: RetryConfig,
        request_timeout: Duration,
    ) -> Self {
        Self {
            link,
            credential,
            retry,
            request_timeout,
            io_lock: Mutex::new(()),
        }
    }

    /// Issue one request and classify its outcome, retrying transient
    /// failures up to the configured attempt budget.
    pub async fn round_trip(&self, body: ClientRequest) -> Result<PlatformReply, DispatchError> {
        let request = WireRequest::new(&self.credential, body);
        let mut attempt = 0u32;
        let mut delay = self.retry.base_delay;
        loop {
            attempt += 1;
            match self.attempt(&request).await {
                Ok(reply) => {
                    if attempt > 1 {
                        debug!(request_id = %request.request_id, attempt, "request succeeded after retry");
                    }
                    return Ok(reply);
                }
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    warn!(
                        request_id = %request.request_id,
                        attempt,
                        error = %err,
                        "request attempt failed, backing off"
                    );
                    let jitter =
                        (rand::rng().random::<f64>() - 0.5) * 2.0 * self.retry.jitter_factor;
                    tokio::time::sleep(delay.mul_f64((1.0 + jitter).max(0.0))).await;
                    delay = std::cmp::min(
                        delay.mul_f64(self.retry.backoff_multiplier),
                        self.retry.max_delay,
                    );
                }
                Err(err) if err.is_transient() => {
                    return Err(DispatchError::Unavailable {
                        attempts: attempt,
                        last: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt(&self, request: &WireRequest) -> Result<PlatformReply, DispatchError> {
        // Hold the link for the whole exchange; backoff sleeps happen outside.
        let _guard = self.io_lock.lock().await;
        self.link.send(Frame::Request(request.clone())).await?;
        let response =
            tokio::time::timeout(self.request_timeout, self.await_response(request.request_id))
                .await
                .map_err(|_| DispatchError::Timeout {
                    elapsed: self.request_timeout,
                })??;
        classify(response)
    }

    async fn await_response(&self, request_id: Uuid) -> Result<WireResponse, DispatchError> {
        loop {
            match self.link.receive().await? {
                Frame::Response(response) if response.request_id == request_id => {
                    return Ok(response)
                }
                Frame::Response(stale) => {
                    // Leftover answer from a timed-out attempt of an earlier request.
                    debug!(request_id = %stale.request_id, "discarding stale response");
                }
                Frame::Heartbeat => {}
                other => {
                    return Err(DispatchError::Protocol {
                        detail: format!("unexpected {} frame on control link", other.kind()),
                    })
                }
            }
        }
    }
}

fn classify(response: WireResponse) -> Result<PlatformReply, DispatchError> {
    let status = StatusCode::from_u16(response.status).map_err(|_| DispatchError::Protocol {
        detail: format!("invalid status code {}", response.status),
    })?;
    let message = || response.message.clone().unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(DispatchError::AuthenticationFailed {
            status: status.as_u16(),
        });
    }
    if status.is_client_error() {
        return Err(DispatchError::Rejected {
            status: status.as_u16(),
            message: message(),
        });
    }
    if status.is_server_error() {
        return Err(DispatchError::Upstream {
            status: status.as_u16(),
            message: message(),
        });
    }
    if status.is_success() {
        return Ok(response.body.unwrap_or(PlatformReply::Accepted));
    }
    Err(DispatchError::Protocol {
        detail: format!("unhandled status {status}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::testkit::ScriptedLink;

    fn dispatcher(link: ScriptedLink) -> RequestDispatcher {
        RequestDispatcher::new(
            Box::new(link),
            Credential::new("secret"),
            RetryConfig::default()
                .with_base_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(5)),
            Duration::from_millis(500),
        )
    }

    #[tokio::test]
    async fn success_returns_reply_body() {
        let link = ScriptedLink::replying(|request| {
            WireResponse::ok(request.request_id, PlatformReply::Accepted)
        });
        let reply = dispatcher(link)
            .round_trip(ClientRequest::StartJob { job_id: Uuid::new_v4() })
            .await
            .unwrap();
        assert!(matches!(reply, PlatformReply::Accepted));
    }

    #[tokio::test]
    async fn auth_rejection_is_never_retried() {
        let link = ScriptedLink::replying(|request| {
            WireResponse::error(request.request_id, 401, "bad token")
        });
        let sent = link.sent_counter();
        let err = dispatcher(link)
            .round_trip(ClientRequest::Subscribe)
            .await
            .unwrap_err();
        assert!(err.is_authentication());
        assert_eq!(sent.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let link = ScriptedLink::replying(|request| {
            WireResponse::error(request.request_id, 404, "no such model")
        });
        let sent = link.sent_counter();
        let err = dispatcher(link)
            .round_trip(ClientRequest::DescribeModel { model_name: "nope".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Rejected { status: 404, .. }));
        assert_eq!(sent.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_errors_retry_with_stable_request_id() {
        let link = ScriptedLink::failing_then_ok(2, 503);
        let sent = link.sent_counter();
        let ids = link.seen_request_ids();
        let reply = dispatcher(link)
            .round_trip(ClientRequest::StartJob { job_id: Uuid::new_v4() })
            .await
            .unwrap();
        assert!(matches!(reply, PlatformReply::Accepted));
        assert_eq!(sent.load(std::sync::atomic::Ordering::SeqCst), 3);
        let ids = ids.lock().unwrap();
        assert!(ids.windows(2).all(|w| w[0] == w[1]), "request id changed across retries");
    }

    #[tokio::test]
    async fn exhausted_retries_surface_unavailable() {
        let link = ScriptedLink::replying(|request| {
            WireResponse::error(request.request_id, 503, "draining")
        });
        let err = dispatcher(link)
            .round_trip(ClientRequest::Subscribe)
            .await
            .unwrap_err();
        match err {
            DispatchError::Unavailable { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected unavailable, got {other:?}"),
        }
    }
}
