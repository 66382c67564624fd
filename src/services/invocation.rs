//! Invocation lifecycle: create, stage inputs, start, track, collect.
//!
//! [`InvocationService::submit`] performs the synchronous part of an
//! invocation and hands back a [`JobHandle`]; a spawned driver task follows
//! the job to a terminal state, preferring pushed events and falling back to
//! status polls whenever the event stream is degraded. The first terminal
//! state wins and is never left again, so repeated [`JobHandle::wait`] calls
//! all see the same verdict.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::communication::chunking::{ByteSource, ChunkTransport};
use crate::communication::dispatch::{unexpected_reply, DispatchError, RequestDispatcher};
use crate::communication::events::{EventFeed, EventHub};
use crate::communication::wire::{ClientRequest, JobRecord, PlatformReply, RemoteJobState};
use crate::core::config::PlatformConfig;
use crate::core::error::{Error, Result};
use crate::signature::transform::{
    self, InvocationOutputs, InvocationRequest, PayloadData, PayloadEntry, ResultPayload,
    TaggedBytes,
};
use crate::signature::{ModelSignature, ParameterName};

/// Client-side view of a job's lifecycle.
///
/// `TimedOut` exists only here: the platform keeps running a job the client
/// gave up on, so the timeout verdict is local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }
}

impl From<RemoteJobState> for JobState {
    fn from(state: RemoteJobState) -> Self {
        match state {
            RemoteJobState::Queued => Self::Submitted,
            RemoteJobState::Running => Self::Running,
            RemoteJobState::Succeeded => Self::Succeeded,
            RemoteJobState::Failed => Self::Failed,
            RemoteJobState::Cancelled => Self::Cancelled,
        }
    }
}

/// Terminal verdict of a job, set exactly once.
#[derive(Debug, Clone)]
enum Outcome {
    Succeeded(Arc<InvocationOutputs>),
    Failed { reason: String },
    TimedOut { ceiling: Duration },
    Cancelled,
    Retrieval { detail: String },
}

impl Outcome {
    fn into_result(self, job_id: Uuid) -> Result<InvocationOutputs> {
        match self {
            Self::Succeeded(outputs) => Ok((*outputs).clone()),
            Self::Failed { reason } => Err(Error::JobFailure { job_id, reason }),
            Self::TimedOut { ceiling } => Err(Error::TimedOut {
                subject: format!("job {job_id}"),
                ceiling,
            }),
            Self::Cancelled => Err(Error::Cancelled { job_id }),
            Self::Retrieval { detail } => Err(Error::ResultRetrieval { job_id, detail }),
        }
    }
}

#[derive(Debug)]
struct JobShared {
    job_id: Uuid,
    state: watch::Sender<JobState>,
    outcome: OnceCell<Outcome>,
}

impl JobShared {
    /// Record a non-terminal observation; terminal states are absorbing.
    fn observe(&self, state: JobState) {
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// Set the verdict, then flip the state so waiters wake to find it.
    fn finish(&self, outcome: Outcome, state: JobState) {
        let _ = self.outcome.set(outcome);
        self.state.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

/// Caller-facing handle to a submitted job.
///
/// Cheap to clone; every clone observes the same job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    shared: Arc<JobShared>,
    dispatcher: Arc<RequestDispatcher>,
    cancel_grace: Duration,
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.shared.job_id
    }

    /// Last known state, without blocking.
    pub fn state(&self) -> JobState {
        *self.shared.state.borrow()
    }

    /// Wait for the terminal verdict. Safe to call repeatedly and from
    /// multiple clones; every call returns the same verdict.
    pub async fn wait(&self) -> Result<InvocationOutputs> {
        let mut state = self.shared.state.subscribe();
        while !state.borrow_and_update().is_terminal() {
            if state.changed().await.is_err() {
                break;
            }
        }
        match self.shared.outcome.get() {
            Some(outcome) => outcome.clone().into_result(self.shared.job_id),
            None => Err(Error::ResultRetrieval {
                job_id: self.shared.job_id,
                detail: "job driver stopped without recording a verdict".into(),
            }),
        }
    }

    /// Ask the platform to stop the job, waiting at most the configured
    /// grace for the acknowledgment. The local state flips to `Cancelled`
    /// either way; an unacknowledged cancel is platform housekeeping.
    pub async fn cancel(&self) -> Result<()> {
        if self.state().is_terminal() {
            return Ok(());
        }
        let job_id = self.shared.job_id;
        info!(job = %job_id, "cancelling invocation");
        let ack = time::timeout(
            self.cancel_grace,
            self.dispatcher.round_trip(ClientRequest::CancelJob { job_id }),
        )
        .await;
        match ack {
            Ok(Ok(_)) => debug!(job = %job_id, "cancel acknowledged"),
            Ok(Err(err)) => warn!(job = %job_id, error = %err, "cancel request failed"),
            Err(_) => warn!(job = %job_id, grace = ?self.cancel_grace, "cancel not acknowledged in time"),
        }
        self.shared.finish(Outcome::Cancelled, JobState::Cancelled);
        Ok(())
    }
}

pub(crate) struct InvocationService {
    dispatcher: Arc<RequestDispatcher>,
    transport: Arc<ChunkTransport>,
    hub: EventHub,
    poll_interval: Duration,
    invoke_ceiling: Duration,
    cancel_grace: Duration,
    /// Inline submissions up to this size; larger values go chunked.
    inline_limit: usize,
}

impl InvocationService {
    pub(crate) fn new(
        dispatcher: Arc<RequestDispatcher>,
        transport: Arc<ChunkTransport>,
        hub: EventHub,
        config: &PlatformConfig,
    ) -> Self {
        Self {
            dispatcher,
            transport,
            hub,
            poll_interval: config.poll_interval,
            invoke_ceiling: config.invoke_ceiling,
            cancel_grace: config.cancel_grace,
            inline_limit: config.transfer.chunk_size,
        }
    }

    /// Run an invocation up to the point where the platform owns it, then
    /// spawn the driver that follows it to completion.
    pub(crate) async fn submit(
        &self,
        signature: Arc<ModelSignature>,
        request: &InvocationRequest,
    ) -> Result<JobHandle> {
        // Shape and validate the payload before any invocation exists, so a
        // bad request leaves nothing behind on the platform.
        let entries = transform::forward(&signature, request)?;

        let reply = self
            .dispatcher
            .round_trip(ClientRequest::CreateInvocation {
                model_name: request.model_name().to_string(),
            })
            .await?;
        let record = match reply {
            PlatformReply::InvocationCreated { job } => job,
            other => return Err(unexpected_reply("invocation_created", &other).into()),
        };
        let job_id = record.job_id;
        debug!(job = %job_id, model = request.model_name(), "invocation created");

        self.stage_inputs(job_id, &record, entries).await?;
        self.dispatcher
            .round_trip(ClientRequest::StartJob { job_id })
            .await?;
        info!(job = %job_id, model = request.model_name(), "job started");

        let (state, _) = watch::channel(JobState::Submitted);
        let shared = Arc::new(JobShared {
            job_id,
            state,
            outcome: OnceCell::new(),
        });
        let feed = self.hub.track(job_id);
        let ceiling = request.ceiling().unwrap_or(self.invoke_ceiling);
        let driver = JobDriver {
            shared: Arc::clone(&shared),
            dispatcher: Arc::clone(&self.dispatcher),
            transport: Arc::clone(&self.transport),
            signature,
            record,
            ceiling,
            poll_interval: self.poll_interval,
        };
        tokio::spawn(driver.run(feed, Instant::now() + ceiling));

        Ok(JobHandle {
            shared,
            dispatcher: Arc::clone(&self.dispatcher),
            cancel_grace: self.cancel_grace,
        })
    }

    async fn stage_inputs(
        &self,
        job_id: Uuid,
        record: &JobRecord,
        entries: Vec<PayloadEntry>,
    ) -> Result<()> {
        let slots: HashSet<&ParameterName> =
            record.input_slots.iter().map(|s| &s.parameter).collect();
        for entry in entries {
            if !slots.contains(&entry.parameter) {
                return Err(DispatchError::Protocol {
                    detail: format!(
                        "platform allocated no input slot for parameter {}",
                        entry.parameter
                    ),
                }
                .into());
            }
            match entry.data {
                PayloadData::Inline(data) if data.len() <= self.inline_limit => {
                    trace!(job = %job_id, parameter = %entry.parameter, bytes = data.len(), "submitting inline");
                    self.dispatcher
                        .round_trip(ClientRequest::SubmitInline {
                            job_id,
                            parameter: entry.parameter,
                            data_encoding: entry.data_encoding,
                            data,
                        })
                        .await?;
                }
                PayloadData::Inline(data) => {
                    self.upload(job_id, entry.parameter, entry.data_encoding, ByteSource::Memory(data))
                        .await?;
                }
                PayloadData::File { path, .. } => {
                    self.upload(job_id, entry.parameter, entry.data_encoding, ByteSource::File(path))
                        .await?;
                }
                PayloadData::Link(url) => {
                    self.dispatcher
                        .round_trip(ClientRequest::SubmitLink {
                            job_id,
                            parameter: entry.parameter,
                            link: url.to_string(),
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn upload(
        &self,
        job_id: Uuid,
        parameter: ParameterName,
        data_encoding: String,
        source: ByteSource,
    ) -> Result<()> {
        let (size, digest) = source.stage().await.map_err(Error::from)?;
        let reply = self
            .dispatcher
            .round_trip(ClientRequest::OpenInputUpload {
                job_id,
                parameter: parameter.clone(),
                data_encoding,
                size,
                digest: digest.clone(),
            })
            .await?;
        let transfer_id = match reply {
            PlatformReply::TransferOpened { transfer_id } => transfer_id,
            other => return Err(unexpected_reply("transfer_opened", &other).into()),
        };
        debug!(job = %job_id, parameter = %parameter, size, %transfer_id, "uploading input");
        self.transport.push(transfer_id, &source, &digest).await?;
        Ok(())
    }
}

/// Background task that follows one job to its terminal state.
struct JobDriver {
    shared: Arc<JobShared>,
    dispatcher: Arc<RequestDispatcher>,
    transport: Arc<ChunkTransport>,
    signature: Arc<ModelSignature>,
    record: JobRecord,
    ceiling: Duration,
    poll_interval: Duration,
}

impl JobDriver {
    async fn run(self, mut feed: EventFeed, deadline: Instant) {
        let job_id = self.shared.job_id;
        let mut poll = time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut degraded = feed.degraded_watch();
        let mut degraded_watch_alive = true;
        let mut state_rx = self.shared.state.subscribe();
        let mut events_done = false;

        loop {
            if self.shared.state.borrow().is_terminal() {
                return;
            }
            let polling = feed.is_degraded() || events_done;
            tokio::select! {
                _ = time::sleep_until(deadline) => {
                    warn!(job = %job_id, ceiling = ?self.ceiling, "invocation deadline reached");
                    self.shared.finish(
                        Outcome::TimedOut { ceiling: self.ceiling },
                        JobState::TimedOut,
                    );
                    // Tell the platform to stop burning compute on it.
                    let dispatcher = Arc::clone(&self.dispatcher);
                    tokio::spawn(async move {
                        let _ = dispatcher
                            .round_trip(ClientRequest::CancelJob { job_id })
                            .await;
                    });
                    return;
                }
                _ = state_rx.changed() => {
                    // External finish, e.g. JobHandle::cancel.
                }
                maybe = feed.next(), if !events_done => {
                    match maybe {
                        Some(event) => {
                            trace!(job = %job_id, state = ?event.state, "event received");
                            if self.apply_remote(event.state, event.reason).await {
                                return;
                            }
                        }
                        None => events_done = true,
                    }
                }
                changed = degraded.changed(), if degraded_watch_alive && !polling => {
                    // Wakes the loop so the polling guard is recomputed.
                    if changed.is_err() {
                        degraded_watch_alive = false;
                    }
                }
                _ = poll.tick(), if polling => {
                    match self
                        .dispatcher
                        .round_trip(ClientRequest::JobStatus { job_id })
                        .await
                    {
                        Ok(PlatformReply::StatusReport(event)) => {
                            if self.apply_remote(event.state, event.reason).await {
                                return;
                            }
                        }
                        Ok(other) => {
                            debug!(job = %job_id, kind = other.kind(), "unexpected status reply")
                        }
                        Err(err) => warn!(job = %job_id, error = %err, "status poll failed"),
                    }
                }
            }
        }
    }

    /// Apply a platform-reported state; returns true when the job is done.
    async fn apply_remote(&self, state: RemoteJobState, reason: Option<String>) -> bool {
        match state {
            RemoteJobState::Queued => {
                self.shared.observe(JobState::Submitted);
                false
            }
            RemoteJobState::Running => {
                self.shared.observe(JobState::Running);
                false
            }
            RemoteJobState::Succeeded => {
                let job_id = self.shared.job_id;
                match self.collect_outputs().await {
                    Ok(outputs) => {
                        info!(job = %job_id, outputs = outputs.len(), "job succeeded");
                        self.shared
                            .finish(Outcome::Succeeded(Arc::new(outputs)), JobState::Succeeded);
                    }
                    Err(err) => {
                        warn!(job = %job_id, error = %err, "job succeeded but results were not retrievable");
                        self.shared.finish(
                            Outcome::Retrieval {
                                detail: err.to_string(),
                            },
                            JobState::Succeeded,
                        );
                    }
                }
                true
            }
            RemoteJobState::Failed => {
                self.shared.finish(
                    Outcome::Failed {
                        reason: reason.unwrap_or_else(|| "unspecified failure".into()),
                    },
                    JobState::Failed,
                );
                true
            }
            RemoteJobState::Cancelled => {
                self.shared.finish(Outcome::Cancelled, JobState::Cancelled);
                true
            }
        }
    }

    /// Fetch every declared output slot and fold the raw payloads back into
    /// display-level outputs.
    async fn collect_outputs(&self) -> Result<InvocationOutputs> {
        let job_id = self.shared.job_id;
        let mut payload = ResultPayload::default();
        for slot in &self.record.output_slots {
            let reply = self
                .dispatcher
                .round_trip(ClientRequest::FetchOutput {
                    job_id,
                    parameter: slot.parameter.clone(),
                })
                .await?;
            let (parameter, data_encoding, data) = match reply {
                PlatformReply::OutputReady {
                    parameter,
                    data_encoding,
                    inline: Some(data),
                    ..
                } => (parameter, data_encoding, data),
                PlatformReply::OutputReady {
                    parameter,
                    data_encoding,
                    inline: None,
                    transfer_id: Some(transfer_id),
                } => {
                    trace!(job = %job_id, parameter = %parameter, %transfer_id, "pulling output");
                    let data = self.transport.pull(transfer_id).await?;
                    (parameter, data_encoding, data)
                }
                PlatformReply::OutputReady { parameter, .. } => {
                    return Err(DispatchError::Protocol {
                        detail: format!(
                            "output {parameter} carries neither inline data nor a transfer"
                        ),
                    }
                    .into())
                }
                other => return Err(unexpected_reply("output_ready", &other).into()),
            };
            payload.insert(parameter, TaggedBytes { data, data_encoding });
        }
        Ok(transform::reverse(&self.signature, &payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_recognized() {
        assert!(!JobState::Submitted.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::TimedOut.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn remote_states_map_onto_local_ones() {
        assert_eq!(JobState::from(RemoteJobState::Queued), JobState::Submitted);
        assert_eq!(
            JobState::from(RemoteJobState::Succeeded),
            JobState::Succeeded
        );
    }

    #[test]
    fn first_terminal_state_wins() {
        let (state, _) = watch::channel(JobState::Running);
        let shared = JobShared {
            job_id: Uuid::new_v4(),
            state,
            outcome: OnceCell::new(),
        };
        shared.finish(Outcome::Cancelled, JobState::Cancelled);
        shared.finish(
            Outcome::Failed {
                reason: "late".into(),
            },
            JobState::Failed,
        );
        shared.observe(JobState::Running);
        assert_eq!(*shared.state.borrow(), JobState::Cancelled);
        assert!(matches!(shared.outcome.get(), Some(Outcome::Cancelled)));
    }

    #[test]
    fn outcome_maps_to_the_public_error() {
        let job_id = Uuid::new_v4();
        assert!(matches!(
            Outcome::Cancelled.into_result(job_id),
            Err(Error::Cancelled { .. })
        ));
        assert!(matches!(
            Outcome::Failed { reason: "oom".into() }.into_result(job_id),
            Err(Error::JobFailure { .. })
        ));
        assert!(matches!(
            Outcome::TimedOut { ceiling: Duration::from_secs(1) }.into_result(job_id),
            Err(Error::TimedOut { .. })
        ));
        let outputs = Outcome::Succeeded(Arc::new(InvocationOutputs::default()))
            .into_result(job_id)
            .unwrap();
        assert!(outputs.is_empty());
    }
}
