//! Typed wire model for the gateway protocol.
//!
//! Everything that crosses a gateway link is a [`Frame`]. Control traffic is
//! a request/response pair correlated by `request_id`; event links carry
//! [`JobEvent`] pushes; transfer links carry chunk frames and their acks.
//! Control requests are idempotent per `request_id`, so a retry after a lost
//! response reuses the original id and the platform replays its answer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::security::credentials::Credential;
use crate::signature::{ModelSignature, ParameterName};

/// One frame on a gateway connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Request(WireRequest),
    Response(WireResponse),
    Event(JobEvent),
    Heartbeat,
    Chunk(ChunkFrame),
    ChunkAck(ChunkAck),
    TransferDone(TransferSummary),
}

impl Frame {
    /// Short name for logs; never includes payload bytes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Event(_) => "event",
            Self::Heartbeat => "heartbeat",
            Self::Chunk(_) => "chunk",
            Self::ChunkAck(_) => "chunk_ack",
            Self::TransferDone(_) => "transfer_done",
        }
    }
}

/// Client-to-platform request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireRequest {
    pub request_id: Uuid,
    pub credential: String,
    /// SDK version, recorded by the platform for telemetry.
    pub client_version: String,
    pub body: ClientRequest,
}

impl WireRequest {
    pub fn new(credential: &Credential, body: ClientRequest) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            credential: credential.reveal().to_string(),
            client_version: crate::SDK_VERSION.to_string(),
            body,
        }
    }
}

/// Platform-to-client response envelope, correlated by `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireResponse {
    pub request_id: Uuid,
    /// HTTP-style status code.
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<PlatformReply>,
}

impl WireResponse {
    pub fn ok(request_id: Uuid, body: PlatformReply) -> Self {
        Self {
            request_id,
            status: 200,
            message: None,
            body: Some(body),
        }
    }

    pub fn error(request_id: Uuid, status: u16, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status,
            message: Some(message.into()),
            body: None,
        }
    }
}

/// Operations the SDK issues against the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientRequest {
    DescribeModel {
        model_name: String,
    },
    CreateInvocation {
        model_name: String,
    },
    /// Stage a small input value inline.
    SubmitInline {
        job_id: Uuid,
        parameter: ParameterName,
        data_encoding: String,
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    /// Stage an input the platform fetches from a remote location itself.
    SubmitLink {
        job_id: Uuid,
        parameter: ParameterName,
        link: String,
    },
    /// Open a chunked upload for one input slot.
    OpenInputUpload {
        job_id: Uuid,
        parameter: ParameterName,
        data_encoding: String,
        size: u64,
        digest: String,
    },
    StartJob {
        job_id: Uuid,
    },
    JobStatus {
        job_id: Uuid,
    },
    CancelJob {
        job_id: Uuid,
    },
    FetchOutput {
        job_id: Uuid,
        parameter: ParameterName,
    },
    /// Event-link hello: switch this connection to account-wide pushes.
    Subscribe,
    /// Transfer-link hello: bind this connection to one open transfer.
    AttachTransfer {
        transfer_id: Uuid,
    },
    CreateModel {
        manifest: ModelManifest,
    },
    /// Announce an asset upload; the platform may skip it by digest.
    PrepareAsset {
        model_id: Uuid,
        asset_id: Uuid,
        size: u64,
        digest: String,
    },
    SubmitAssetLink {
        model_id: Uuid,
        asset_id: Uuid,
        link: String,
    },
    CommitModel {
        model_id: Uuid,
    },
    ModelStatus {
        model_id: Uuid,
    },
}

/// Typed reply bodies carried inside a successful [`WireResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlatformReply {
    Accepted,
    ModelDescribed {
        model_id: Uuid,
        signature: ModelSignature,
    },
    InvocationCreated {
        job: JobRecord,
    },
    TransferOpened {
        transfer_id: Uuid,
    },
    AssetDisposition {
        asset_id: Uuid,
        already_stored: bool,
        transfer_id: Option<Uuid>,
    },
    StatusReport(JobEvent),
    OutputReady {
        parameter: ParameterName,
        data_encoding: String,
        #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
        inline: Option<Vec<u8>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transfer_id: Option<Uuid>,
    },
    ModelCreated {
        model: ModelRecord,
    },
    ModelStatus {
        model_id: Uuid,
        ready: bool,
        assets: Vec<AssetStatus>,
    },
    /// Platform-side digest check at the end of a pushed transfer.
    TransferVerdict {
        transfer_id: Uuid,
        digest_ok: bool,
        digest: String,
    },
}

impl PlatformReply {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::ModelDescribed { .. } => "model_described",
            Self::InvocationCreated { .. } => "invocation_created",
            Self::TransferOpened { .. } => "transfer_opened",
            Self::AssetDisposition { .. } => "asset_disposition",
            Self::StatusReport(_) => "status_report",
            Self::OutputReady { .. } => "output_ready",
            Self::ModelCreated { .. } => "model_created",
            Self::ModelStatus { .. } => "model_status",
            Self::TransferVerdict { .. } => "transfer_verdict",
        }
    }
}

/// Job lifecycle states as the platform reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteJobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// A state transition pushed over the event link or returned from a status
/// query. Events may repeat; consumers treat them idempotently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub state: RemoteJobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Server-side invocation record returned at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub model_id: Uuid,
    pub state: RemoteJobState,
    pub input_slots: Vec<SlotRecord>,
    pub output_slots: Vec<SlotRecord>,
    pub created_at: DateTime<Utc>,
}

/// One allocated input or output slot of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlotRecord {
    pub parameter: ParameterName,
    pub data_encoding: String,
}

/// One chunk of a transfer. Integrity is two-layered: a per-chunk CRC32
/// checked on receipt, and a whole-asset SHA-256 checked at completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkFrame {
    pub transfer_id: Uuid,
    pub index: u64,
    pub total: u64,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    pub crc32: u32,
    pub last: bool,
}

impl ChunkFrame {
    pub fn new(transfer_id: Uuid, index: u64, total: u64, data: Vec<u8>) -> Self {
        let crc32 = crc32fast::hash(&data);
        Self {
            transfer_id,
            index,
            total,
            data,
            crc32,
            last: index + 1 == total,
        }
    }

    /// Recompute the CRC over the carried bytes.
    pub fn verify(&self) -> bool {
        crc32fast::hash(&self.data) == self.crc32
    }
}

#[cfg(feature = "bincode_chunks")]
impl bincode::Encode for ChunkFrame {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> Result<(), bincode::error::EncodeError> {
        bincode::Encode::encode(self.transfer_id.as_bytes(), encoder)?;
        bincode::Encode::encode(&self.index, encoder)?;
        bincode::Encode::encode(&self.total, encoder)?;
        bincode::Encode::encode(&self.data, encoder)?;
        bincode::Encode::encode(&self.crc32, encoder)?;
        bincode::Encode::encode(&self.last, encoder)?;
        Ok(())
    }
}

#[cfg(feature = "bincode_chunks")]
impl bincode::Decode<()> for ChunkFrame {
    fn decode<D: bincode::de::Decoder<Context = ()>>(
        decoder: &mut D,
    ) -> Result<Self, bincode::error::DecodeError> {
        let id_bytes: [u8; 16] = bincode::Decode::decode(decoder)?;
        Ok(Self {
            transfer_id: Uuid::from_bytes(id_bytes),
            index: bincode::Decode::decode(decoder)?,
            total: bincode::Decode::decode(decoder)?,
            data: bincode::Decode::decode(decoder)?,
            crc32: bincode::Decode::decode(decoder)?,
            last: bincode::Decode::decode(decoder)?,
        })
    }
}

#[cfg(feature = "bincode_chunks")]
impl<'de> bincode::BorrowDecode<'de, ()> for ChunkFrame {
    fn borrow_decode<D: bincode::de::BorrowDecoder<'de, Context = ()>>(
        decoder: &mut D,
    ) -> Result<Self, bincode::error::DecodeError> {
        let id_bytes: [u8; 16] = bincode::BorrowDecode::borrow_decode(decoder)?;
        Ok(Self {
            transfer_id: Uuid::from_bytes(id_bytes),
            index: bincode::BorrowDecode::borrow_decode(decoder)?,
            total: bincode::BorrowDecode::borrow_decode(decoder)?,
            data: bincode::BorrowDecode::borrow_decode(decoder)?,
            crc32: bincode::BorrowDecode::borrow_decode(decoder)?,
            last: bincode::BorrowDecode::borrow_decode(decoder)?,
        })
    }
}

/// Receipt for one chunk; `success: false` asks the sender to retransmit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkAck {
    pub transfer_id: Uuid,
    pub index: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChunkAck {
    pub fn ok(transfer_id: Uuid, index: u64) -> Self {
        Self {
            transfer_id,
            index,
            success: true,
            error: None,
        }
    }

    pub fn failed(transfer_id: Uuid, index: u64, error: impl Into<String>) -> Self {
        Self {
            transfer_id,
            index,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// End-of-transfer marker carrying the whole-asset digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferSummary {
    pub transfer_id: Uuid,
    pub total_chunks: u64,
    /// Lowercase hex SHA-256 over the reassembled bytes.
    pub digest: String,
}

/// Declaration of a model to publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelManifest {
    pub model_name: String,
    pub version_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_description: Option<String>,
    pub signature: ModelSignature,
    /// Asset names; content arrives through prepare/upload or link submission.
    pub assets: Vec<String>,
}

/// Platform-side record of a created model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelRecord {
    pub model_id: Uuid,
    pub model_name: String,
    pub version_label: String,
    pub assets: Vec<AssetRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetRecord {
    pub asset_id: Uuid,
    pub asset_name: String,
}

/// Storage state of one asset during registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetState {
    Pending,
    Stored,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetStatus {
    pub asset_id: Uuid,
    pub asset_name: String,
    pub state: AssetState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod b64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|r| STANDARD.decode(r.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}
