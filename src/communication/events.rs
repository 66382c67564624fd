//! Account-wide job event stream with polling fallback.
//!
//! One background task owns the event link. It subscribes, routes pushed
//! [`JobEvent`]s to per-job feeds, and on idle or drop tears the session down
//! and builds a new one. After repeated failures the hub flags itself
//! degraded; job drivers watch that flag and fall back to status polling
//! until the stream recovers. After every reconnect the hub re-queries all
//! tracked jobs, so a transition that fired while the link was down is
//! re-delivered rather than lost.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::dispatch::RequestDispatcher;
use super::wire::{ClientRequest, Frame, JobEvent, PlatformReply, WireRequest};
use super::{Connector, LinkPurpose};
use crate::security::credentials::Credential;

/// Tunables for the event stream.
#[derive(Debug, Clone)]
pub struct EventConfig {
    /// When false the hub never connects and drivers always poll.
    pub enabled: bool,
    /// Silence on the link beyond this triggers a reconnect.
    pub idle_timeout: Duration,
    /// Consecutive session failures before the hub degrades.
    pub max_reconnect_failures: u32,
    /// Pause between re-establishment attempts while degraded.
    pub degraded_retry_interval: Duration,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_timeout: Duration::from_secs(30),
            max_reconnect_failures: 3,
            degraded_retry_interval: Duration::from_secs(30),
        }
    }
}

impl EventConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_max_reconnect_failures(mut self, max: u32) -> Self {
        self.max_reconnect_failures = max;
        self
    }

    pub fn with_degraded_retry_interval(mut self, interval: Duration) -> Self {
        self.degraded_retry_interval = interval;
        self
    }
}

struct HubShared {
    routes: DashMap<Uuid, mpsc::UnboundedSender<JobEvent>>,
    /// True until a session is healthy, and again whenever one is not.
    degraded: watch::Sender<bool>,
    started: OnceCell<()>,
    connector: Arc<dyn Connector>,
    credential: Credential,
    dispatcher: Arc<RequestDispatcher>,
    config: EventConfig,
}

/// Routes platform job events to per-job subscribers.
pub struct EventHub {
    inner: Arc<HubShared>,
}

impl EventHub {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        credential: Credential,
        dispatcher: Arc<RequestDispatcher>,
        config: EventConfig,
    ) -> Self {
        let (degraded, _) = watch::channel(true);
        Self {
            inner: Arc::new(HubShared {
                routes: DashMap::new(),
                degraded,
                started: OnceCell::new(),
                connector,
                credential,
                dispatcher,
                config,
            }),
        }
    }

    /// Subscribe to events for one job. The subscription ends when the
    /// returned feed is dropped.
    pub(crate) fn track(&self, job_id: Uuid) -> EventFeed {
        self.ensure_listener();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.routes.insert(job_id, tx);
        EventFeed {
            events: rx,
            degraded: self.inner.degraded.subscribe(),
            job_id,
            hub: Arc::clone(&self.inner),
        }
    }

    fn ensure_listener(&self) {
        if !self.inner.config.enabled {
            return;
        }
        if self.inner.started.set(()).is_ok() {
            let hub = Arc::clone(&self.inner);
            tokio::spawn(listener(hub));
        }
    }
}

/// Per-job event subscription handed to a job driver.
pub struct EventFeed {
    events: mpsc::UnboundedReceiver<JobEvent>,
    degraded: watch::Receiver<bool>,
    job_id: Uuid,
    hub: Arc<HubShared>,
}

impl EventFeed {
    pub(crate) async fn next(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }

    /// Whether the driver should poll instead of trusting pushes.
    pub(crate) fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Watch handle for degradation flips, usable alongside [`next`](Self::next).
    pub(crate) fn degraded_watch(&self) -> watch::Receiver<bool> {
        self.degraded.clone()
    }
}

impl Drop for EventFeed {
    fn drop(&mut self) {
        self.hub.routes.remove(&self.job_id);
    }
}

enum SessionEnd {
    AuthRejected,
    Dropped { established: bool },
}

async fn listener(hub: Arc<HubShared>) {
    let mut failures = 0u32;
    loop {
        match stream_session(&hub).await {
            SessionEnd::AuthRejected => {
                error!("event subscription rejected, push updates disabled");
                let _ = hub.degraded.send(true);
                return;
            }
            SessionEnd::Dropped { established } => {
                failures = if established { 1 } else { failures + 1 };
                if failures >= hub.config.max_reconnect_failures {
                    if !*hub.degraded.borrow() {
                        warn!(failures, "event stream degraded, drivers fall back to polling");
                    }
                    let _ = hub.degraded.send(true);
                    tokio::time::sleep(hub.config.degraded_retry_interval).await;
                } else {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }
}

/// Run one event session to completion: open, subscribe, resync, route.
async fn stream_session(hub: &Arc<HubShared>) -> SessionEnd {
    let link = match hub.connector.open(LinkPurpose::Events).await {
        Ok(link) => link,
        Err(err) => {
            debug!(error = %err, "event link open failed");
            return SessionEnd::Dropped { established: false };
        }
    };

    let request = WireRequest::new(&hub.credential, ClientRequest::Subscribe);
    let request_id = request.request_id;
    if let Err(err) = link.send(Frame::Request(request)).await {
        debug!(error = %err, "subscribe send failed");
        return SessionEnd::Dropped { established: false };
    }
    let hello = tokio::time::timeout(hub.config.idle_timeout, async {
        loop {
            match link.receive().await {
                Ok(Frame::Response(response)) if response.request_id == request_id => {
                    return Some(response)
                }
                Ok(_) => {}
                Err(_) => return None,
            }
        }
    })
    .await;
    let response = match hello {
        Ok(Some(response)) => response,
        _ => {
            debug!("subscribe was not acknowledged");
            return SessionEnd::Dropped { established: false };
        }
    };
    if response.status == 401 || response.status == 403 {
        return SessionEnd::AuthRejected;
    }
    if !(200..300).contains(&response.status) {
        warn!(status = response.status, "subscribe refused");
        return SessionEnd::Dropped { established: false };
    }

    // Catch up on anything that transitioned while no session was up, then
    // let drivers trust pushes again.
    resync(hub).await;
    let _ = hub.degraded.send(false);
    info!("event stream established");

    loop {
        match tokio::time::timeout(hub.config.idle_timeout, link.receive()).await {
            Ok(Ok(Frame::Event(event))) => route(hub, event),
            Ok(Ok(Frame::Heartbeat)) => {}
            Ok(Ok(other)) => debug!(kind = other.kind(), "ignoring frame on event link"),
            Ok(Err(err)) => {
                warn!(error = %err, "event link dropped");
                let _ = hub.degraded.send(true);
                return SessionEnd::Dropped { established: true };
            }
            Err(_) => {
                warn!(idle = ?hub.config.idle_timeout, "event link idle too long, reconnecting");
                let _ = link.disconnect().await;
                let _ = hub.degraded.send(true);
                return SessionEnd::Dropped { established: true };
            }
        }
    }
}

async fn resync(hub: &Arc<HubShared>) {
    let jobs: Vec<Uuid> = hub.routes.iter().map(|entry| *entry.key()).collect();
    for job_id in jobs {
        match hub
            .dispatcher
            .round_trip(ClientRequest::JobStatus { job_id })
            .await
        {
            Ok(PlatformReply::StatusReport(event)) => route(hub, event),
            Ok(other) => debug!(job = %job_id, kind = other.kind(), "unexpected resync reply"),
            Err(err) => debug!(job = %job_id, error = %err, "resync status query failed"),
        }
    }
}

fn route(hub: &Arc<HubShared>, event: JobEvent) {
    let job_id = event.job_id;
    let receiver_gone = match hub.routes.get(&job_id) {
        Some(tx) => tx.send(event).is_err(),
        None => {
            trace!(job = %job_id, "event for untracked job");
            false
        }
    };
    if receiver_gone {
        hub.routes.remove(&job_id);
    }
}
