//! In-memory platform double for tests.
//!
//! [`FakePlatform`] answers the full gateway protocol over loopback links:
//! control round trips, event pushes, and chunked transfers in both
//! directions. Behavior knobs simulate auth rejection, corrupted chunks,
//! digest mismatches, swallowed cancels, and storage failures; counters
//! expose what the client actually sent.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::trace;
use uuid::Uuid;

use super::chunking::sha256_hex;
use super::wire::{
    AssetRecord, AssetState, AssetStatus, ChunkAck, ChunkFrame, ClientRequest, Frame, JobEvent,
    JobRecord, ModelRecord, PlatformReply, RemoteJobState, SlotRecord, TransferSummary,
    WireRequest, WireResponse,
};
use super::{Connector, LinkError, LinkPurpose, LinkResult, LinkState, PlatformLink};
use crate::signature::{ModelSignature, ParameterName};

/// One end of an in-process frame pipe.
#[derive(Debug)]
pub struct LoopbackLink {
    tx: mpsc::UnboundedSender<Frame>,
    rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
    closed: AtomicBool,
}

/// Two cross-wired loopback links.
pub fn loopback_pair() -> (LoopbackLink, LoopbackLink) {
    let (left_tx, left_rx) = mpsc::unbounded_channel();
    let (right_tx, right_rx) = mpsc::unbounded_channel();
    (
        LoopbackLink {
            tx: left_tx,
            rx: Mutex::new(right_rx),
            closed: AtomicBool::new(false),
        },
        LoopbackLink {
            tx: right_tx,
            rx: Mutex::new(left_rx),
            closed: AtomicBool::new(false),
        },
    )
}

#[async_trait]
impl PlatformLink for LoopbackLink {
    async fn send(&self, frame: Frame) -> LinkResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        self.tx.send(frame).map_err(|_| LinkError::Closed)
    }

    async fn receive(&self) -> LinkResult<Frame> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        self.rx.lock().await.recv().await.ok_or(LinkError::Closed)
    }

    async fn state(&self) -> LinkState {
        if self.closed.load(Ordering::SeqCst) || self.tx.is_closed() {
            LinkState::Disconnected
        } else {
            LinkState::Connected
        }
    }

    async fn connect(&self) -> LinkResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(LinkError::ConnectionFailed(
                "loopback links cannot reconnect".into(),
            ))
        } else {
            Ok(())
        }
    }

    async fn disconnect(&self) -> LinkResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A link that answers every request through a closure. For dispatcher
/// tests that need exact control over statuses.
pub struct ScriptedLink {
    respond: Arc<dyn Fn(&WireRequest) -> WireResponse + Send + Sync>,
    replies_tx: mpsc::UnboundedSender<Frame>,
    replies_rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
    sent: Arc<AtomicU64>,
    request_ids: Arc<StdMutex<Vec<Uuid>>>,
}

impl fmt::Debug for ScriptedLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ScriptedLink")
    }
}

impl ScriptedLink {
    pub fn replying(
        respond: impl Fn(&WireRequest) -> WireResponse + Send + Sync + 'static,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            respond: Arc::new(respond),
            replies_tx: tx,
            replies_rx: Mutex::new(rx),
            sent: Arc::new(AtomicU64::new(0)),
            request_ids: Arc::default(),
        }
    }

    /// Answer the first `failures` requests with `status`, then accept.
    pub fn failing_then_ok(failures: u32, status: u16) -> Self {
        let count = AtomicU32::new(0);
        Self::replying(move |request| {
            if count.fetch_add(1, Ordering::SeqCst) < failures {
                WireResponse::error(request.request_id, status, "transient fault")
            } else {
                WireResponse::ok(request.request_id, PlatformReply::Accepted)
            }
        })
    }

    pub fn sent_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.sent)
    }

    pub fn seen_request_ids(&self) -> Arc<StdMutex<Vec<Uuid>>> {
        Arc::clone(&self.request_ids)
    }
}

#[async_trait]
impl PlatformLink for ScriptedLink {
    async fn send(&self, frame: Frame) -> LinkResult<()> {
        if let Frame::Request(request) = &frame {
            self.sent.fetch_add(1, Ordering::SeqCst);
            self.request_ids.lock().unwrap().push(request.request_id);
            let response = (self.respond)(request);
            let _ = self.replies_tx.send(Frame::Response(response));
        }
        Ok(())
    }

    async fn receive(&self) -> LinkResult<Frame> {
        self.replies_rx.lock().await.recv().await.ok_or(LinkError::Closed)
    }

    async fn state(&self) -> LinkState {
        LinkState::Connected
    }

    async fn connect(&self) -> LinkResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> LinkResult<()> {
        Ok(())
    }
}

/// Per-parameter bytes as the fake platform stages or produces them.
#[derive(Debug, Clone)]
pub struct StagedValue {
    pub data_encoding: String,
    pub data: Vec<u8>,
}

/// Closure mapping staged inputs (keyed by rendered parameter name) to
/// outputs (same keying).
pub type JobResponder =
    Arc<dyn Fn(&HashMap<String, StagedValue>) -> HashMap<String, StagedValue> + Send + Sync>;

/// What a seeded model does when a job starts.
#[derive(Clone)]
pub enum JobScript {
    /// Succeed after `delay`, producing outputs from the staged inputs.
    Complete { delay: Duration, respond: JobResponder },
    /// Fail after `delay` with a platform-reported reason.
    Fail { delay: Duration, reason: String },
    /// Stay running forever.
    Never,
}

impl JobScript {
    pub fn complete_with(
        delay: Duration,
        respond: impl Fn(&HashMap<String, StagedValue>) -> HashMap<String, StagedValue>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self::Complete {
            delay,
            respond: Arc::new(respond),
        }
    }

    pub fn fail_after(delay: Duration, reason: impl Into<String>) -> Self {
        Self::Fail {
            delay,
            reason: reason.into(),
        }
    }
}

impl fmt::Debug for JobScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete { delay, .. } => write!(f, "Complete(after {delay:?})"),
            Self::Fail { delay, reason } => write!(f, "Fail(after {delay:?}: {reason})"),
            Self::Never => f.write_str("Never"),
        }
    }
}

#[derive(Clone)]
struct FakeModel {
    record: ModelRecord,
    signature: ModelSignature,
    asset_states: HashMap<Uuid, (String, AssetState, Option<String>)>,
    ready: bool,
    script: JobScript,
}

struct FakeJob {
    model_id: Uuid,
    state: RemoteJobState,
    reason: Option<String>,
    staged: HashMap<ParameterName, StagedValue>,
    outputs: HashMap<ParameterName, StagedValue>,
}

#[derive(Clone)]
enum TransferTarget {
    JobInput {
        job_id: Uuid,
        parameter: ParameterName,
        data_encoding: String,
    },
    ModelAsset {
        model_id: Uuid,
        asset_id: Uuid,
    },
    Output {
        data: Vec<u8>,
        digest: String,
    },
}

#[derive(Default)]
struct Directory {
    by_name: HashMap<String, Uuid>,
    models: HashMap<Uuid, FakeModel>,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    invocations: AtomicU64,
    transfers_opened: AtomicU64,
    chunk_frames: AtomicU64,
    chunk_resends: AtomicU64,
    cancels: AtomicU64,
    uploads_skipped: AtomicU64,
}

struct Knobs {
    reject_auth: AtomicBool,
    swallow_cancels: AtomicBool,
    fail_push_digests: AtomicU32,
    fail_pull_digests: AtomicU32,
    corrupt_pull_chunk: StdMutex<Option<u64>>,
    pull_chunk_size: AtomicUsize,
    inline_limit: AtomicUsize,
    fail_assets: StdMutex<HashSet<String>>,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            reject_auth: AtomicBool::new(false),
            swallow_cancels: AtomicBool::new(false),
            fail_push_digests: AtomicU32::new(0),
            fail_pull_digests: AtomicU32::new(0),
            corrupt_pull_chunk: StdMutex::new(None),
            pull_chunk_size: AtomicUsize::new(64 * 1024),
            inline_limit: AtomicUsize::new(4096),
            fail_assets: StdMutex::new(HashSet::new()),
        }
    }
}

struct PlatformState {
    token: String,
    directory: StdMutex<Directory>,
    jobs: StdMutex<HashMap<Uuid, FakeJob>>,
    transfers: StdMutex<HashMap<Uuid, TransferTarget>>,
    stored_digests: StdMutex<HashSet<String>>,
    asset_blobs: StdMutex<HashMap<Uuid, Vec<u8>>>,
    events: broadcast::Sender<JobEvent>,
    counters: Counters,
    knobs: Knobs,
}

/// An in-memory platform reachable through [`FakePlatform::connector`].
pub struct FakePlatform {
    state: Arc<PlatformState>,
}

impl FakePlatform {
    pub fn new(token: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Arc::new(PlatformState {
                token: token.into(),
                directory: StdMutex::new(Directory::default()),
                jobs: StdMutex::new(HashMap::new()),
                transfers: StdMutex::new(HashMap::new()),
                stored_digests: StdMutex::new(HashSet::new()),
                asset_blobs: StdMutex::new(HashMap::new()),
                events,
                counters: Counters::default(),
                knobs: Knobs::default(),
            }),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            state: Arc::clone(&self.state),
        })
    }

    /// Publish a ready model with a scripted job behavior.
    pub fn seed_model(
        &self,
        name: impl Into<String>,
        signature: ModelSignature,
        script: JobScript,
    ) -> Uuid {
        let name = name.into();
        let model_id = Uuid::new_v4();
        let model = FakeModel {
            record: ModelRecord {
                model_id,
                model_name: name.clone(),
                version_label: "seeded".into(),
                assets: Vec::new(),
            },
            signature,
            asset_states: HashMap::new(),
            ready: true,
            script,
        };
        let mut directory = self.state.directory.lock().unwrap();
        directory.by_name.insert(name, model_id);
        directory.models.insert(model_id, model);
        model_id
    }

    pub fn emit_event(&self, event: JobEvent) {
        let _ = self.state.events.send(event);
    }

    pub fn reject_auth(&self, reject: bool) {
        self.state.knobs.reject_auth.store(reject, Ordering::SeqCst);
    }

    pub fn swallow_cancels(&self, swallow: bool) {
        self.state.knobs.swallow_cancels.store(swallow, Ordering::SeqCst);
    }

    /// Report a wrong digest for the next `times` pushed transfers.
    pub fn fail_push_digest(&self, times: u32) {
        self.state.knobs.fail_push_digests.store(times, Ordering::SeqCst);
    }

    /// Close the next `times` pulled transfers with a wrong digest.
    pub fn fail_pull_digest(&self, times: u32) {
        self.state.knobs.fail_pull_digests.store(times, Ordering::SeqCst);
    }

    /// Corrupt the bytes (but not the checksum) of one pulled chunk, once.
    pub fn corrupt_pull_chunk(&self, index: u64) {
        *self.state.knobs.corrupt_pull_chunk.lock().unwrap() = Some(index);
    }

    pub fn set_pull_chunk_size(&self, bytes: usize) {
        self.state.knobs.pull_chunk_size.store(bytes.max(1), Ordering::SeqCst);
    }

    /// Outputs at or under this size ride inline in the control response.
    pub fn set_inline_limit(&self, bytes: usize) {
        self.state.knobs.inline_limit.store(bytes, Ordering::SeqCst);
    }

    /// Make storage of a named asset fail at commit time.
    pub fn fail_asset(&self, asset_name: impl Into<String>) {
        self.state.knobs.fail_assets.lock().unwrap().insert(asset_name.into());
    }

    /// Pretend an asset with this digest is already stored platform-side.
    pub fn preload_digest(&self, digest: impl Into<String>) {
        self.state.stored_digests.lock().unwrap().insert(digest.into());
    }

    pub fn request_count(&self) -> u64 {
        self.state.counters.requests.load(Ordering::SeqCst)
    }

    pub fn invocation_count(&self) -> u64 {
        self.state.counters.invocations.load(Ordering::SeqCst)
    }

    pub fn transfer_count(&self) -> u64 {
        self.state.counters.transfers_opened.load(Ordering::SeqCst)
    }

    pub fn chunk_frame_count(&self) -> u64 {
        self.state.counters.chunk_frames.load(Ordering::SeqCst)
    }

    pub fn chunk_resend_count(&self) -> u64 {
        self.state.counters.chunk_resends.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> u64 {
        self.state.counters.cancels.load(Ordering::SeqCst)
    }

    pub fn skipped_upload_count(&self) -> u64 {
        self.state.counters.uploads_skipped.load(Ordering::SeqCst)
    }

    pub fn model_ready(&self, name: &str) -> bool {
        let directory = self.state.directory.lock().unwrap();
        directory
            .by_name
            .get(name)
            .and_then(|id| directory.models.get(id))
            .map(|m| m.ready)
            .unwrap_or(false)
    }

    pub fn job_state(&self, job_id: Uuid) -> Option<RemoteJobState> {
        self.state.jobs.lock().unwrap().get(&job_id).map(|j| j.state)
    }

    /// Bytes the client staged for one input parameter, by rendered name.
    pub fn staged_input(&self, job_id: Uuid, parameter: &str) -> Option<Vec<u8>> {
        let name = ParameterName::parse(parameter).ok()?;
        self.state
            .jobs
            .lock()
            .unwrap()
            .get(&job_id)
            .and_then(|j| j.staged.get(&name))
            .map(|v| v.data.clone())
    }

    /// Bytes stored for a registered asset.
    pub fn asset_bytes(&self, model_name: &str, asset_name: &str) -> Option<Vec<u8>> {
        let directory = self.state.directory.lock().unwrap();
        let model = directory
            .by_name
            .get(model_name)
            .and_then(|id| directory.models.get(id))?;
        let asset_id = model
            .record
            .assets
            .iter()
            .find(|a| a.asset_name == asset_name)
            .map(|a| a.asset_id)?;
        drop(directory);
        self.state.asset_blobs.lock().unwrap().get(&asset_id).cloned()
    }
}

struct FakeConnector {
    state: Arc<PlatformState>,
}

impl fmt::Debug for FakeConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FakeConnector")
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, purpose: LinkPurpose) -> LinkResult<Box<dyn PlatformLink>> {
        trace!(%purpose, "opening loopback link");
        let (client, server) = loopback_pair();
        tokio::spawn(serve_link(Arc::clone(&self.state), server, purpose));
        Ok(Box::new(client))
    }
}

async fn serve_link(state: Arc<PlatformState>, link: LoopbackLink, _purpose: LinkPurpose) {
    loop {
        let frame = match link.receive().await {
            Ok(frame) => frame,
            Err(_) => return,
        };
        match frame {
            Frame::Request(request) => {
                state.counters.requests.fetch_add(1, Ordering::SeqCst);
                let request_id = request.request_id;
                if state.knobs.reject_auth.load(Ordering::SeqCst)
                    || request.credential != state.token
                {
                    let _ = link
                        .send(Frame::Response(WireResponse::error(
                            request_id,
                            401,
                            "invalid credential",
                        )))
                        .await;
                    continue;
                }
                match request.body {
                    ClientRequest::Subscribe => {
                        let _ = link
                            .send(Frame::Response(WireResponse::ok(
                                request_id,
                                PlatformReply::Accepted,
                            )))
                            .await;
                        forward_events(&state, &link).await;
                        return;
                    }
                    ClientRequest::AttachTransfer { transfer_id } => {
                        let target = state.transfers.lock().unwrap().get(&transfer_id).cloned();
                        match target {
                            None => {
                                let _ = link
                                    .send(Frame::Response(WireResponse::error(
                                        request_id,
                                        404,
                                        "unknown transfer",
                                    )))
                                    .await;
                            }
                            Some(target) => {
                                let _ = link
                                    .send(Frame::Response(WireResponse::ok(
                                        request_id,
                                        PlatformReply::Accepted,
                                    )))
                                    .await;
                                match target {
                                    TransferTarget::Output { data, digest } => {
                                        serve_pull(&state, &link, transfer_id, data, digest).await;
                                    }
                                    push_target => {
                                        serve_push(&state, &link, transfer_id, push_target).await;
                                    }
                                }
                                return;
                            }
                        }
                    }
                    ClientRequest::CancelJob { job_id } => {
                        state.counters.cancels.fetch_add(1, Ordering::SeqCst);
                        if state.knobs.swallow_cancels.load(Ordering::SeqCst) {
                            continue;
                        }
                        let response = cancel_job(&state, request_id, job_id);
                        let _ = link.send(Frame::Response(response)).await;
                    }
                    body => {
                        let response = handle_control(&state, request_id, body);
                        let _ = link.send(Frame::Response(response)).await;
                    }
                }
            }
            Frame::Heartbeat => {}
            other => trace!(kind = other.kind(), "ignoring frame outside protocol"),
        }
    }
}

fn emit(state: &Arc<PlatformState>, job_id: Uuid, job_state: RemoteJobState, reason: Option<String>) {
    let _ = state.events.send(JobEvent {
        job_id,
        state: job_state,
        reason,
        at: Utc::now(),
    });
}

fn cancel_job(state: &Arc<PlatformState>, request_id: Uuid, job_id: Uuid) -> WireResponse {
    let mut jobs = state.jobs.lock().unwrap();
    match jobs.get_mut(&job_id) {
        Some(job) => {
            if matches!(job.state, RemoteJobState::Queued | RemoteJobState::Running) {
                job.state = RemoteJobState::Cancelled;
                drop(jobs);
                emit(state, job_id, RemoteJobState::Cancelled, None);
            }
            WireResponse::ok(request_id, PlatformReply::Accepted)
        }
        None => WireResponse::error(request_id, 404, "unknown job"),
    }
}

fn handle_control(state: &Arc<PlatformState>, request_id: Uuid, body: ClientRequest) -> WireResponse {
    match body {
        ClientRequest::DescribeModel { model_name } => {
            let directory = state.directory.lock().unwrap();
            match directory
                .by_name
                .get(&model_name)
                .and_then(|id| directory.models.get(id))
            {
                Some(model) => WireResponse::ok(
                    request_id,
                    PlatformReply::ModelDescribed {
                        model_id: model.record.model_id,
                        signature: model.signature.clone(),
                    },
                ),
                None => WireResponse::error(request_id, 404, "unknown model"),
            }
        }
        ClientRequest::CreateInvocation { model_name } => {
            let directory = state.directory.lock().unwrap();
            let Some(model) = directory
                .by_name
                .get(&model_name)
                .and_then(|id| directory.models.get(id))
            else {
                return WireResponse::error(request_id, 404, "unknown model");
            };
            state.counters.invocations.fetch_add(1, Ordering::SeqCst);
            let job_id = Uuid::new_v4();
            let slots = |side: &[crate::signature::ParameterSignature]| {
                side.iter()
                    .flat_map(|p| p.parameters.iter())
                    .map(|ip| SlotRecord {
                        parameter: ip.name.clone(),
                        data_encoding: ip.data_encoding.clone(),
                    })
                    .collect::<Vec<_>>()
            };
            let record = JobRecord {
                job_id,
                model_id: model.record.model_id,
                state: RemoteJobState::Queued,
                input_slots: slots(&model.signature.inputs),
                output_slots: slots(&model.signature.outputs),
                created_at: Utc::now(),
            };
            let model_id = model.record.model_id;
            drop(directory);
            state.jobs.lock().unwrap().insert(
                job_id,
                FakeJob {
                    model_id,
                    state: RemoteJobState::Queued,
                    reason: None,
                    staged: HashMap::new(),
                    outputs: HashMap::new(),
                },
            );
            WireResponse::ok(request_id, PlatformReply::InvocationCreated { job: record })
        }
        ClientRequest::SubmitInline {
            job_id,
            parameter,
            data_encoding,
            data,
        } => {
            let mut jobs = state.jobs.lock().unwrap();
            match jobs.get_mut(&job_id) {
                Some(job) => {
                    job.staged.insert(parameter, StagedValue { data_encoding, data });
                    WireResponse::ok(request_id, PlatformReply::Accepted)
                }
                None => WireResponse::error(request_id, 404, "unknown job"),
            }
        }
        ClientRequest::SubmitLink {
            job_id,
            parameter,
            link,
        } => {
            let mut jobs = state.jobs.lock().unwrap();
            match jobs.get_mut(&job_id) {
                Some(job) => {
                    job.staged.insert(
                        parameter,
                        StagedValue {
                            data_encoding: "link".into(),
                            data: link.into_bytes(),
                        },
                    );
                    WireResponse::ok(request_id, PlatformReply::Accepted)
                }
                None => WireResponse::error(request_id, 404, "unknown job"),
            }
        }
        ClientRequest::OpenInputUpload {
            job_id,
            parameter,
            data_encoding,
            ..
        } => {
            if !state.jobs.lock().unwrap().contains_key(&job_id) {
                return WireResponse::error(request_id, 404, "unknown job");
            }
            state.counters.transfers_opened.fetch_add(1, Ordering::SeqCst);
            let transfer_id = Uuid::new_v4();
            state.transfers.lock().unwrap().insert(
                transfer_id,
                TransferTarget::JobInput {
                    job_id,
                    parameter,
                    data_encoding,
                },
            );
            WireResponse::ok(request_id, PlatformReply::TransferOpened { transfer_id })
        }
        ClientRequest::StartJob { job_id } => {
            let script = {
                let mut jobs = state.jobs.lock().unwrap();
                let Some(job) = jobs.get_mut(&job_id) else {
                    return WireResponse::error(request_id, 404, "unknown job");
                };
                job.state = RemoteJobState::Running;
                let directory = state.directory.lock().unwrap();
                directory.models.get(&job.model_id).map(|m| m.script.clone())
            };
            emit(state, job_id, RemoteJobState::Running, None);
            if let Some(script) = script {
                run_script(state, job_id, script);
            }
            WireResponse::ok(request_id, PlatformReply::Accepted)
        }
        ClientRequest::JobStatus { job_id } => {
            let jobs = state.jobs.lock().unwrap();
            match jobs.get(&job_id) {
                Some(job) => WireResponse::ok(
                    request_id,
                    PlatformReply::StatusReport(JobEvent {
                        job_id,
                        state: job.state,
                        reason: job.reason.clone(),
                        at: Utc::now(),
                    }),
                ),
                None => WireResponse::error(request_id, 404, "unknown job"),
            }
        }
        ClientRequest::FetchOutput { job_id, parameter } => {
            let jobs = state.jobs.lock().unwrap();
            let Some(job) = jobs.get(&job_id) else {
                return WireResponse::error(request_id, 404, "unknown job");
            };
            let Some(value) = job.outputs.get(&parameter) else {
                return WireResponse::error(request_id, 404, "no output staged for parameter");
            };
            let inline_limit = state.knobs.inline_limit.load(Ordering::SeqCst);
            if value.data.len() <= inline_limit {
                WireResponse::ok(
                    request_id,
                    PlatformReply::OutputReady {
                        parameter,
                        data_encoding: value.data_encoding.clone(),
                        inline: Some(value.data.clone()),
                        transfer_id: None,
                    },
                )
            } else {
                let digest = sha256_hex(&value.data);
                let transfer_id = Uuid::new_v4();
                let data_encoding = value.data_encoding.clone();
                let data = value.data.clone();
                drop(jobs);
                state.counters.transfers_opened.fetch_add(1, Ordering::SeqCst);
                state
                    .transfers
                    .lock()
                    .unwrap()
                    .insert(transfer_id, TransferTarget::Output { data, digest });
                WireResponse::ok(
                    request_id,
                    PlatformReply::OutputReady {
                        parameter,
                        data_encoding,
                        inline: None,
                        transfer_id: Some(transfer_id),
                    },
                )
            }
        }
        ClientRequest::CreateModel { manifest } => {
            let model_id = Uuid::new_v4();
            let assets: Vec<AssetRecord> = manifest
                .assets
                .iter()
                .map(|name| AssetRecord {
                    asset_id: Uuid::new_v4(),
                    asset_name: name.clone(),
                })
                .collect();
            let asset_states = assets
                .iter()
                .map(|a| (a.asset_id, (a.asset_name.clone(), AssetState::Pending, None)))
                .collect();
            let record = ModelRecord {
                model_id,
                model_name: manifest.model_name.clone(),
                version_label: manifest.version_label.clone(),
                assets,
            };
            let model = FakeModel {
                record: record.clone(),
                signature: manifest.signature,
                asset_states,
                ready: false,
                script: JobScript::Never,
            };
            let mut directory = state.directory.lock().unwrap();
            directory.by_name.insert(manifest.model_name, model_id);
            directory.models.insert(model_id, model);
            WireResponse::ok(request_id, PlatformReply::ModelCreated { model: record })
        }
        ClientRequest::PrepareAsset {
            model_id,
            asset_id,
            digest,
            ..
        } => {
            let already = state.stored_digests.lock().unwrap().contains(&digest);
            if already {
                state.counters.uploads_skipped.fetch_add(1, Ordering::SeqCst);
                let mut directory = state.directory.lock().unwrap();
                if let Some(model) = directory.models.get_mut(&model_id) {
                    if let Some(entry) = model.asset_states.get_mut(&asset_id) {
                        entry.1 = AssetState::Stored;
                    }
                }
                WireResponse::ok(
                    request_id,
                    PlatformReply::AssetDisposition {
                        asset_id,
                        already_stored: true,
                        transfer_id: None,
                    },
                )
            } else {
                state.counters.transfers_opened.fetch_add(1, Ordering::SeqCst);
                let transfer_id = Uuid::new_v4();
                state
                    .transfers
                    .lock()
                    .unwrap()
                    .insert(transfer_id, TransferTarget::ModelAsset { model_id, asset_id });
                WireResponse::ok(
                    request_id,
                    PlatformReply::AssetDisposition {
                        asset_id,
                        already_stored: false,
                        transfer_id: Some(transfer_id),
                    },
                )
            }
        }
        ClientRequest::SubmitAssetLink {
            model_id, asset_id, ..
        } => {
            let mut directory = state.directory.lock().unwrap();
            match directory.models.get_mut(&model_id) {
                Some(model) => {
                    if let Some(entry) = model.asset_states.get_mut(&asset_id) {
                        entry.1 = AssetState::Stored;
                    }
                    WireResponse::ok(request_id, PlatformReply::Accepted)
                }
                None => WireResponse::error(request_id, 404, "unknown model"),
            }
        }
        ClientRequest::CommitModel { model_id } => {
            let failures = state.knobs.fail_assets.lock().unwrap().clone();
            let mut directory = state.directory.lock().unwrap();
            match directory.models.get_mut(&model_id) {
                Some(model) => {
                    for (name, asset_state, detail) in model.asset_states.values_mut() {
                        if failures.contains(name) {
                            *asset_state = AssetState::Failed;
                            *detail = Some("storage backend unavailable".into());
                        }
                    }
                    model.ready = model
                        .asset_states
                        .values()
                        .all(|(_, s, _)| *s == AssetState::Stored);
                    WireResponse::ok(request_id, PlatformReply::Accepted)
                }
                None => WireResponse::error(request_id, 404, "unknown model"),
            }
        }
        ClientRequest::ModelStatus { model_id } => {
            let directory = state.directory.lock().unwrap();
            match directory.models.get(&model_id) {
                Some(model) => {
                    let assets = model
                        .asset_states
                        .iter()
                        .map(|(asset_id, (name, asset_state, detail))| AssetStatus {
                            asset_id: *asset_id,
                            asset_name: name.clone(),
                            state: *asset_state,
                            detail: detail.clone(),
                        })
                        .collect();
                    WireResponse::ok(
                        request_id,
                        PlatformReply::ModelStatus {
                            model_id,
                            ready: model.ready,
                            assets,
                        },
                    )
                }
                None => WireResponse::error(request_id, 404, "unknown model"),
            }
        }
        // Subscribe, AttachTransfer and CancelJob are handled by the link loop.
        other => WireResponse::error(
            request_id,
            400,
            format!("operation not valid here: {other:?}"),
        ),
    }
}

fn run_script(state: &Arc<PlatformState>, job_id: Uuid, script: JobScript) {
    let state = Arc::clone(state);
    match script {
        JobScript::Never => {}
        JobScript::Complete { delay, respond } => {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let staged: HashMap<String, StagedValue> = {
                    let jobs = state.jobs.lock().unwrap();
                    let Some(job) = jobs.get(&job_id) else { return };
                    if job.state != RemoteJobState::Running {
                        return;
                    }
                    job.staged.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
                };
                let produced = respond(&staged);
                {
                    let mut jobs = state.jobs.lock().unwrap();
                    let Some(job) = jobs.get_mut(&job_id) else { return };
                    if job.state != RemoteJobState::Running {
                        return;
                    }
                    for (name, value) in produced {
                        if let Ok(parameter) = ParameterName::parse(&name) {
                            job.outputs.insert(parameter, value);
                        }
                    }
                    job.state = RemoteJobState::Succeeded;
                }
                emit(&state, job_id, RemoteJobState::Succeeded, None);
            });
        }
        JobScript::Fail { delay, reason } => {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                {
                    let mut jobs = state.jobs.lock().unwrap();
                    let Some(job) = jobs.get_mut(&job_id) else { return };
                    if job.state != RemoteJobState::Running {
                        return;
                    }
                    job.state = RemoteJobState::Failed;
                    job.reason = Some(reason.clone());
                }
                emit(&state, job_id, RemoteJobState::Failed, Some(reason));
            });
        }
    }
}

async fn forward_events(state: &Arc<PlatformState>, link: &LoopbackLink) {
    let mut rx = state.events.subscribe();
    let mut heartbeat = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if link.send(Frame::Heartbeat).await.is_err() {
                    return;
                }
            }
            event = rx.recv() => match event {
                Ok(event) => {
                    if link.send(Frame::Event(event)).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            },
            incoming = link.receive() => {
                if incoming.is_err() {
                    return;
                }
            }
        }
    }
}

async fn serve_push(
    state: &Arc<PlatformState>,
    link: &LoopbackLink,
    transfer_id: Uuid,
    target: TransferTarget,
) {
    let mut received: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
    loop {
        let frame = match link.receive().await {
            Ok(frame) => frame,
            Err(_) => return,
        };
        match frame {
            Frame::Chunk(chunk) if chunk.transfer_id == transfer_id => {
                state.counters.chunk_frames.fetch_add(1, Ordering::SeqCst);
                if chunk.verify() {
                    if received.insert(chunk.index, chunk.data).is_some() {
                        state.counters.chunk_resends.fetch_add(1, Ordering::SeqCst);
                    }
                    let _ = link
                        .send(Frame::ChunkAck(ChunkAck::ok(transfer_id, chunk.index)))
                        .await;
                } else {
                    let _ = link
                        .send(Frame::ChunkAck(ChunkAck::failed(
                            transfer_id,
                            chunk.index,
                            "checksum mismatch",
                        )))
                        .await;
                }
            }
            Frame::TransferDone(summary) if summary.transfer_id == transfer_id => {
                let assembled: Vec<u8> = received.into_values().flatten().collect();
                let computed = sha256_hex(&assembled);
                let lie = state
                    .knobs
                    .fail_push_digests
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                let (digest_ok, reported) = if lie {
                    (false, "0".repeat(64))
                } else {
                    (computed == summary.digest, computed)
                };
                if digest_ok {
                    finalize_push(state, &target, assembled, &summary.digest);
                }
                let _ = link
                    .send(Frame::Response(WireResponse::ok(
                        Uuid::new_v4(),
                        PlatformReply::TransferVerdict {
                            transfer_id,
                            digest_ok,
                            digest: reported,
                        },
                    )))
                    .await;
                return;
            }
            Frame::Heartbeat => {}
            _ => return,
        }
    }
}

fn finalize_push(state: &Arc<PlatformState>, target: &TransferTarget, data: Vec<u8>, digest: &str) {
    match target {
        TransferTarget::JobInput {
            job_id,
            parameter,
            data_encoding,
        } => {
            if let Some(job) = state.jobs.lock().unwrap().get_mut(job_id) {
                job.staged.insert(
                    parameter.clone(),
                    StagedValue {
                        data_encoding: data_encoding.clone(),
                        data,
                    },
                );
            }
        }
        TransferTarget::ModelAsset { model_id, asset_id } => {
            state.asset_blobs.lock().unwrap().insert(*asset_id, data);
            state.stored_digests.lock().unwrap().insert(digest.to_string());
            let mut directory = state.directory.lock().unwrap();
            if let Some(model) = directory.models.get_mut(model_id) {
                if let Some(entry) = model.asset_states.get_mut(asset_id) {
                    entry.1 = AssetState::Stored;
                }
            }
        }
        TransferTarget::Output { .. } => {}
    }
}

async fn serve_pull(
    state: &Arc<PlatformState>,
    link: &LoopbackLink,
    transfer_id: Uuid,
    data: Vec<u8>,
    digest: String,
) {
    let chunk_size = state.knobs.pull_chunk_size.load(Ordering::SeqCst).max(1);
    let total = (data.len().div_ceil(chunk_size)).max(1) as u64;
    let corrupt_at = state.knobs.corrupt_pull_chunk.lock().unwrap().take();
    let mut index = 0u64;
    while index < total {
        let start = (index as usize) * chunk_size;
        let end = (start + chunk_size).min(data.len());
        let mut frame = ChunkFrame::new(transfer_id, index, total, data[start..end].to_vec());
        if corrupt_at == Some(index) && !frame.data.is_empty() {
            // Flip a byte but keep the original checksum: the client must notice.
            frame.data[0] ^= 0xff;
        }
        if link.send(Frame::Chunk(frame)).await.is_err() {
            return;
        }
        state.counters.chunk_frames.fetch_add(1, Ordering::SeqCst);
        loop {
            match link.receive().await {
                Ok(Frame::ChunkAck(ack)) if ack.transfer_id == transfer_id && ack.index == index => {
                    if ack.success {
                        index += 1;
                        break;
                    }
                    state.counters.chunk_resends.fetch_add(1, Ordering::SeqCst);
                    let clean = ChunkFrame::new(transfer_id, index, total, data[start..end].to_vec());
                    if link.send(Frame::Chunk(clean)).await.is_err() {
                        return;
                    }
                    state.counters.chunk_frames.fetch_add(1, Ordering::SeqCst);
                }
                Ok(Frame::Heartbeat) => {}
                Ok(_) => return,
                Err(_) => return,
            }
        }
    }
    let lie = state
        .knobs
        .fail_pull_digests
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    let reported = if lie { "0".repeat(64) } else { digest };
    let _ = link
        .send(Frame::TransferDone(TransferSummary {
            transfer_id,
            total_chunks: total,
            digest: reported,
        }))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_links_cross_frames() {
        let (left, right) = loopback_pair();
        left.send(Frame::Heartbeat).await.unwrap();
        assert!(matches!(right.receive().await.unwrap(), Frame::Heartbeat));
        right.send(Frame::Heartbeat).await.unwrap();
        assert!(matches!(left.receive().await.unwrap(), Frame::Heartbeat));
    }

    #[tokio::test]
    async fn closed_loopback_link_rejects_io() {
        let (left, right) = loopback_pair();
        left.disconnect().await.unwrap();
        assert!(left.send(Frame::Heartbeat).await.is_err());
        drop(left);
        assert!(right.receive().await.is_err());
    }
}
