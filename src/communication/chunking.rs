//! Chunked asset movement over dedicated transfer links.
//!
//! Large byte streams travel as fixed-size chunks under a bounded in-flight
//! window. Each chunk carries a CRC32 the receiver checks before acking; a
//! negative ack triggers a bounded per-chunk retransmit. When all chunks are
//! acked the sender closes with a whole-asset SHA-256, and a mismatch there
//! triggers exactly one full re-transfer.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::wire::{
    ChunkAck, ChunkFrame, ClientRequest, Frame, TransferSummary, WireRequest,
};
use super::{Connector, LinkError, LinkPurpose, PlatformLink};
use crate::security::credentials::Credential;

/// Tunables for chunked transfers.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Bytes per chunk.
    pub chunk_size: usize,
    /// Maximum unacknowledged chunks in flight.
    pub window: usize,
    /// How long to wait for an ack before retransmitting.
    pub ack_timeout: Duration,
    /// Per-chunk retransmit budget.
    pub max_chunk_retries: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512 * 1024,
            window: 10,
            ack_timeout: Duration::from_secs(30),
            max_chunk_retries: 3,
        }
    }
}

impl TransferConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("digest mismatch on transfer {transfer_id}: expected {expected}, got {actual}")]
    Integrity {
        transfer_id: Uuid,
        expected: String,
        actual: String,
    },

    #[error("chunk {index} of transfer {transfer_id} failed after {attempts} attempts")]
    ChunkRetriesExhausted {
        transfer_id: Uuid,
        index: u64,
        attempts: u32,
    },

    #[error("transfer {transfer_id} rejected: {detail}")]
    Rejected { transfer_id: Uuid, detail: String },

    #[error("protocol violation during transfer: {detail}")]
    Protocol { detail: String },

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("i/o failure on transfer source: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the bytes of an upload come from.
///
/// File sources are read in chunk-sized pieces so an asset never has to fit
/// in memory.
#[derive(Debug, Clone)]
pub(crate) enum ByteSource {
    Memory(Vec<u8>),
    File(PathBuf),
}

impl ByteSource {
    /// Measure the source: total size and whole-content SHA-256, streaming
    /// from disk for file sources.
    pub(crate) async fn stage(&self) -> Result<(u64, String), TransferError> {
        match self {
            Self::Memory(bytes) => Ok((bytes.len() as u64, sha256_hex(bytes))),
            Self::File(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                let mut hasher = Sha256::new();
                let mut buf = vec![0u8; 64 * 1024];
                let mut size = 0u64;
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    size += n as u64;
                }
                Ok((size, hex_digest(hasher)))
            }
        }
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

/// Sequential chunk producer over a source. An empty source still yields one
/// empty final chunk so the receiver sees a complete transfer.
struct ChunkReader<'a> {
    kind: ReaderKind<'a>,
    chunk_size: usize,
    total: u64,
    emitted: u64,
}

enum ReaderKind<'a> {
    Memory { bytes: &'a [u8], offset: usize },
    File(tokio::fs::File),
}

impl<'a> ChunkReader<'a> {
    async fn open(source: &'a ByteSource, chunk_size: usize) -> Result<ChunkReader<'a>, TransferError> {
        let (kind, size) = match source {
            ByteSource::Memory(bytes) => (
                ReaderKind::Memory { bytes, offset: 0 },
                bytes.len() as u64,
            ),
            ByteSource::File(path) => {
                let size = tokio::fs::metadata(path).await?.len();
                (ReaderKind::File(tokio::fs::File::open(path).await?), size)
            }
        };
        let total = size.div_ceil(chunk_size as u64).max(1);
        Ok(Self {
            kind,
            chunk_size,
            total,
            emitted: 0,
        })
    }

    fn total_chunks(&self) -> u64 {
        self.total
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TransferError> {
        if self.emitted >= self.total {
            return Ok(None);
        }
        let chunk = match &mut self.kind {
            ReaderKind::Memory { bytes, offset } => {
                let start = *offset;
                let end = (start + self.chunk_size).min(bytes.len());
                *offset = end;
                bytes[start..end].to_vec()
            }
            ReaderKind::File(file) => {
                let mut buf = vec![0u8; self.chunk_size];
                let mut filled = 0;
                while filled < buf.len() {
                    let n = file.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf.truncate(filled);
                buf
            }
        };
        self.emitted += 1;
        Ok(Some(chunk))
    }
}

/// Send-side flow control: bounds in-flight chunks and tracks ack coverage.
struct TransferWindow {
    max_window: usize,
    outstanding: HashMap<u64, (ChunkFrame, Instant)>,
    retries: HashMap<u64, u32>,
    acked: u64,
}

impl TransferWindow {
    fn new(max_window: usize) -> Self {
        Self {
            max_window,
            outstanding: HashMap::new(),
            retries: HashMap::new(),
            acked: 0,
        }
    }

    fn can_send(&self) -> bool {
        self.outstanding.len() < self.max_window
    }

    fn record_sent(&mut self, frame: ChunkFrame) {
        self.outstanding.insert(frame.index, (frame, Instant::now()));
    }

    /// Duplicate acks are ignored.
    fn record_ack(&mut self, index: u64) {
        if self.outstanding.remove(&index).is_some() {
            self.acked += 1;
        }
    }

    /// Charge one retransmit against the chunk's budget and hand back the
    /// frame to resend.
    fn take_for_resend(
        &mut self,
        index: u64,
        max_retries: u32,
        transfer_id: Uuid,
    ) -> Result<ChunkFrame, TransferError> {
        let attempts = self.retries.entry(index).or_insert(0);
        *attempts += 1;
        if *attempts > max_retries {
            return Err(TransferError::ChunkRetriesExhausted {
                transfer_id,
                index,
                attempts: *attempts,
            });
        }
        match self.outstanding.get_mut(&index) {
            Some((frame, sent_at)) => {
                *sent_at = Instant::now();
                Ok(frame.clone())
            }
            None => Err(TransferError::Protocol {
                detail: format!("retransmit requested for unknown chunk {index}"),
            }),
        }
    }

    fn timed_out(&self, timeout: Duration) -> Vec<u64> {
        self.outstanding
            .iter()
            .filter(|(_, (_, sent_at))| sent_at.elapsed() > timeout)
            .map(|(index, _)| *index)
            .collect()
    }

    fn is_complete(&self, total: u64) -> bool {
        self.outstanding.is_empty() && self.acked >= total
    }
}

/// Moves asset bytes to and from the platform over transfer links.
#[derive(Debug, Clone)]
pub(crate) struct ChunkTransport {
    connector: Arc<dyn Connector>,
    credential: Credential,
    config: TransferConfig,
}

impl ChunkTransport {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        credential: Credential,
        config: TransferConfig,
    ) -> Self {
        Self {
            connector,
            credential,
            config,
        }
    }

    /// Upload a source to an open transfer. The platform checks `digest`
    /// against what it reassembles; on mismatch the whole transfer is
    /// retried once before the failure surfaces.
    pub(crate) async fn push(
        &self,
        transfer_id: Uuid,
        source: &ByteSource,
        digest: &str,
    ) -> Result<(), TransferError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.push_once(transfer_id, source, digest).await {
                Err(TransferError::Integrity { .. }) if attempts == 1 => {
                    warn!(%transfer_id, "platform digest mismatch, re-transferring once");
                }
                result => return result,
            }
        }
    }

    async fn push_once(
        &self,
        transfer_id: Uuid,
        source: &ByteSource,
        digest: &str,
    ) -> Result<(), TransferError> {
        let link = self.connector.open(LinkPurpose::Transfer).await?;
        self.attach(link.as_ref(), transfer_id).await?;

        let mut reader = ChunkReader::open(source, self.config.chunk_size).await?;
        let total = reader.total_chunks();
        let mut window = TransferWindow::new(self.config.window);
        let mut next_index = 0u64;
        debug!(%transfer_id, total, "starting chunk upload");

        while !window.is_complete(total) {
            while window.can_send() && next_index < total {
                let data = reader.next_chunk().await?.ok_or_else(|| {
                    TransferError::Protocol {
                        detail: "source ended before the planned chunk count".into(),
                    }
                })?;
                let frame = ChunkFrame::new(transfer_id, next_index, total, data);
                link.send(Frame::Chunk(frame.clone())).await?;
                window.record_sent(frame);
                next_index += 1;
            }
            if window.is_complete(total) {
                break;
            }
            match tokio::time::timeout(self.config.ack_timeout, link.receive()).await {
                Ok(Ok(Frame::ChunkAck(ack))) if ack.transfer_id == transfer_id => {
                    if ack.success {
                        window.record_ack(ack.index);
                    } else {
                        warn!(
                            %transfer_id,
                            index = ack.index,
                            error = ack.error.as_deref().unwrap_or("unspecified"),
                            "chunk rejected, retransmitting"
                        );
                        let frame = window.take_for_resend(
                            ack.index,
                            self.config.max_chunk_retries,
                            transfer_id,
                        )?;
                        link.send(Frame::Chunk(frame)).await?;
                    }
                }
                Ok(Ok(Frame::Heartbeat)) => {}
                Ok(Ok(other)) => {
                    return Err(TransferError::Protocol {
                        detail: format!("unexpected {} frame during upload", other.kind()),
                    })
                }
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => {
                    for index in window.timed_out(self.config.ack_timeout) {
                        warn!(%transfer_id, index, "ack overdue, retransmitting");
                        let frame = window.take_for_resend(
                            index,
                            self.config.max_chunk_retries,
                            transfer_id,
                        )?;
                        link.send(Frame::Chunk(frame)).await?;
                    }
                }
            }
        }

        link.send(Frame::TransferDone(TransferSummary {
            transfer_id,
            total_chunks: total,
            digest: digest.to_string(),
        }))
        .await?;
        let verdict = self.await_verdict(link.as_ref(), transfer_id).await;
        let _ = link.disconnect().await;
        let (digest_ok, platform_digest) = verdict?;
        if digest_ok {
            info!(%transfer_id, chunks = total, "upload complete");
            Ok(())
        } else {
            Err(TransferError::Integrity {
                transfer_id,
                expected: digest.to_string(),
                actual: platform_digest,
            })
        }
    }

    async fn await_verdict(
        &self,
        link: &dyn PlatformLink,
        transfer_id: Uuid,
    ) -> Result<(bool, String), TransferError> {
        let waited = tokio::time::timeout(self.config.ack_timeout, async {
            loop {
                match link.receive().await? {
                    Frame::Response(response) => {
                        return match response.body {
                            Some(super::wire::PlatformReply::TransferVerdict {
                                digest_ok,
                                digest,
                                ..
                            }) => Ok((digest_ok, digest)),
                            _ => Err(TransferError::Protocol {
                                detail: "expected a transfer verdict".into(),
                            }),
                        };
                    }
                    Frame::Heartbeat | Frame::ChunkAck(_) => {}
                    other => {
                        return Err(TransferError::Protocol {
                            detail: format!("unexpected {} frame at transfer end", other.kind()),
                        })
                    }
                }
            }
        })
        .await;
        match waited {
            Ok(result) => result,
            Err(_) => Err(TransferError::Rejected {
                transfer_id,
                detail: "no verdict within the ack timeout".into(),
            }),
        }
    }

    /// Download an open transfer, verifying per-chunk CRCs and the final
    /// whole-asset digest. A digest mismatch is retried once end to end.
    pub(crate) async fn pull(&self, transfer_id: Uuid) -> Result<Vec<u8>, TransferError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.pull_once(transfer_id).await {
                Err(TransferError::Integrity { .. }) if attempts == 1 => {
                    warn!(%transfer_id, "local digest mismatch, re-pulling once");
                }
                result => return result,
            }
        }
    }

    async fn pull_once(&self, transfer_id: Uuid) -> Result<Vec<u8>, TransferError> {
        let link = self.connector.open(LinkPurpose::Transfer).await?;
        self.attach(link.as_ref(), transfer_id).await?;

        let mut received: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
        let mut nack_counts: HashMap<u64, u32> = HashMap::new();
        let summary = loop {
            let frame = tokio::time::timeout(self.config.ack_timeout, link.receive())
                .await
                .map_err(|_| TransferError::Rejected {
                    transfer_id,
                    detail: "no chunk within the ack timeout".into(),
                })??;
            match frame {
                Frame::Chunk(chunk) if chunk.transfer_id == transfer_id => {
                    if chunk.verify() {
                        link.send(Frame::ChunkAck(ChunkAck::ok(transfer_id, chunk.index)))
                            .await?;
                        received.insert(chunk.index, chunk.data);
                    } else {
                        let seen = nack_counts.entry(chunk.index).or_insert(0);
                        *seen += 1;
                        if *seen > self.config.max_chunk_retries {
                            return Err(TransferError::ChunkRetriesExhausted {
                                transfer_id,
                                index: chunk.index,
                                attempts: *seen,
                            });
                        }
                        warn!(%transfer_id, index = chunk.index, "chunk checksum mismatch, requesting retransmit");
                        link.send(Frame::ChunkAck(ChunkAck::failed(
                            transfer_id,
                            chunk.index,
                            "checksum mismatch",
                        )))
                        .await?;
                    }
                }
                Frame::TransferDone(summary) if summary.transfer_id == transfer_id => {
                    break summary;
                }
                Frame::Heartbeat => {}
                other => {
                    return Err(TransferError::Protocol {
                        detail: format!("unexpected {} frame during download", other.kind()),
                    })
                }
            }
        };
        let _ = link.disconnect().await;

        if received.len() as u64 != summary.total_chunks {
            return Err(TransferError::Protocol {
                detail: format!(
                    "transfer closed with {} of {} chunks",
                    received.len(),
                    summary.total_chunks
                ),
            });
        }
        // BTreeMap iteration reassembles in index order.
        let mut assembled = Vec::new();
        for (_, data) in received {
            assembled.extend(data);
        }
        let local = sha256_hex(&assembled);
        if local != summary.digest {
            return Err(TransferError::Integrity {
                transfer_id,
                expected: summary.digest,
                actual: local,
            });
        }
        debug!(%transfer_id, bytes = assembled.len(), "download complete");
        Ok(assembled)
    }

    /// Bind a fresh link to one open transfer.
    async fn attach(
        &self,
        link: &dyn PlatformLink,
        transfer_id: Uuid,
    ) -> Result<(), TransferError> {
        let request = WireRequest::new(
            &self.credential,
            ClientRequest::AttachTransfer { transfer_id },
        );
        let request_id = request.request_id;
        link.send(Frame::Request(request)).await?;
        let response = tokio::time::timeout(self.config.ack_timeout, async {
            loop {
                match link.receive().await? {
                    Frame::Response(response) if response.request_id == request_id => {
                        return Ok::<_, TransferError>(response)
                    }
                    Frame::Heartbeat => {}
                    other => {
                        return Err(TransferError::Protocol {
                            detail: format!("unexpected {} frame during attach", other.kind()),
                        })
                    }
                }
            }
        })
        .await
        .map_err(|_| TransferError::Rejected {
            transfer_id,
            detail: "attach timed out".into(),
        })??;
        if (200..300).contains(&response.status) {
            Ok(())
        } else {
            Err(TransferError::Rejected {
                transfer_id,
                detail: response
                    .message
                    .unwrap_or_else(|| format!("attach refused with status {}", response.status)),
            })
        }
    }
}
