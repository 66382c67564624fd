//! Model publication: declare a manifest, stage assets, commit, wait ready.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::communication::chunking::{ByteSource, ChunkTransport};
use crate::communication::dispatch::{unexpected_reply, DispatchError, RequestDispatcher};
use crate::communication::wire::{
    AssetState, AssetStatus, ClientRequest, ModelManifest, ModelRecord, PlatformReply,
};
use crate::core::config::PlatformConfig;
use crate::core::error::{Error, Result};
use crate::signature::{ModelSignature, SignatureError};

/// Rejected before anything reaches the platform.
#[derive(Debug, Error)]
pub enum ModelConfigError {
    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("model name must not be empty")]
    EmptyModelName,

    #[error("version label must not be empty")]
    EmptyVersionLabel,

    #[error("asset name must not be empty")]
    EmptyAssetName,

    #[error("duplicate asset name `{name}`")]
    DuplicateAssetName { name: String },

    #[error("asset `{name}` link is not an http(s) url: {link}")]
    InvalidAssetLink { name: String, link: String },
}

#[derive(Debug, Clone)]
pub(crate) enum AssetSource {
    File(PathBuf),
    Bytes(Vec<u8>),
    Link(String),
}

/// One named artifact a model needs at inference time.
#[derive(Debug, Clone)]
pub struct ModelAsset {
    name: String,
    source: AssetSource,
}

impl ModelAsset {
    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: AssetSource::File(path.into()),
        }
    }

    pub fn bytes(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            source: AssetSource::Bytes(bytes.into()),
        }
    }

    /// An asset the platform fetches itself from a public location.
    pub fn link(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: AssetSource::Link(url.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn source(&self) -> &AssetSource {
        &self.source
    }
}

/// Everything needed to publish one model version.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    model_name: String,
    version_label: String,
    short_description: Option<String>,
    long_description: Option<String>,
    signature: ModelSignature,
    assets: Vec<ModelAsset>,
}

impl ModelConfig {
    pub fn new(
        model_name: impl Into<String>,
        version_label: impl Into<String>,
        signature: ModelSignature,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            version_label: version_label.into(),
            short_description: None,
            long_description: None,
            signature,
            assets: Vec::new(),
        }
    }

    pub fn describe(mut self, short: impl Into<String>) -> Self {
        self.short_description = Some(short.into());
        self
    }

    pub fn describe_long(mut self, long: impl Into<String>) -> Self {
        self.long_description = Some(long.into());
        self
    }

    pub fn asset(mut self, asset: ModelAsset) -> Self {
        self.assets.push(asset);
        self
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn signature(&self) -> &ModelSignature {
        &self.signature
    }

    pub(crate) fn assets(&self) -> &[ModelAsset] {
        &self.assets
    }

    pub(crate) fn validate(&self) -> std::result::Result<(), ModelConfigError> {
        if self.model_name.trim().is_empty() {
            return Err(ModelConfigError::EmptyModelName);
        }
        if self.version_label.trim().is_empty() {
            return Err(ModelConfigError::EmptyVersionLabel);
        }
        self.signature.validate()?;
        let mut seen = HashSet::new();
        for asset in &self.assets {
            if asset.name.trim().is_empty() {
                return Err(ModelConfigError::EmptyAssetName);
            }
            if !seen.insert(asset.name.as_str()) {
                return Err(ModelConfigError::DuplicateAssetName {
                    name: asset.name.clone(),
                });
            }
            if let AssetSource::Link(raw) = &asset.source {
                let ok = Url::parse(raw)
                    .map(|url| matches!(url.scheme(), "http" | "https"))
                    .unwrap_or(false);
                if !ok {
                    return Err(ModelConfigError::InvalidAssetLink {
                        name: asset.name.clone(),
                        link: raw.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub(crate) fn manifest(&self) -> ModelManifest {
        ModelManifest {
            model_name: self.model_name.clone(),
            version_label: self.version_label.clone(),
            short_description: self.short_description.clone(),
            long_description: self.long_description.clone(),
            signature: self.signature.clone(),
            assets: self.assets.iter().map(|a| a.name.clone()).collect(),
        }
    }
}

/// Readiness snapshot of a registered model.
#[derive(Debug, Clone)]
pub struct ModelReadiness {
    pub model_id: Uuid,
    pub ready: bool,
    pub assets: Vec<AssetStatus>,
}

pub(crate) struct RegistrationService {
    dispatcher: Arc<RequestDispatcher>,
    transport: Arc<ChunkTransport>,
    poll_interval: Duration,
    ceiling: Duration,
}

impl RegistrationService {
    pub(crate) fn new(
        dispatcher: Arc<RequestDispatcher>,
        transport: Arc<ChunkTransport>,
        config: &PlatformConfig,
    ) -> Self {
        Self {
            dispatcher,
            transport,
            poll_interval: config.poll_interval,
            ceiling: config.registration_ceiling,
        }
    }

    /// Publish a model end to end: create, stage every asset, commit, then
    /// wait until the platform reports it ready.
    pub(crate) async fn register(&self, config: &ModelConfig) -> Result<ModelRecord> {
        config.validate().map_err(Error::from)?;
        let deadline = Instant::now() + self.ceiling;

        let reply = self
            .dispatcher
            .round_trip(ClientRequest::CreateModel {
                manifest: config.manifest(),
            })
            .await?;
        let record = match reply {
            PlatformReply::ModelCreated { model } => model,
            other => return Err(unexpected_reply("model_created", &other).into()),
        };
        info!(
            model = %record.model_name,
            id = %record.model_id,
            assets = record.assets.len(),
            "model created, staging assets"
        );

        let allocated: HashMap<&str, Uuid> = record
            .assets
            .iter()
            .map(|a| (a.asset_name.as_str(), a.asset_id))
            .collect();
        for asset in config.assets() {
            let asset_id = *allocated.get(asset.name()).ok_or_else(|| {
                DispatchError::Protocol {
                    detail: format!("platform allocated no id for asset {}", asset.name()),
                }
            })?;
            match asset.source() {
                AssetSource::Link(url) => {
                    self.dispatcher
                        .round_trip(ClientRequest::SubmitAssetLink {
                            model_id: record.model_id,
                            asset_id,
                            link: url.clone(),
                        })
                        .await?;
                }
                AssetSource::File(path) => {
                    self.upload_asset(
                        record.model_id,
                        asset_id,
                        asset.name(),
                        ByteSource::File(path.clone()),
                    )
                    .await?;
                }
                AssetSource::Bytes(bytes) => {
                    self.upload_asset(
                        record.model_id,
                        asset_id,
                        asset.name(),
                        ByteSource::Memory(bytes.clone()),
                    )
                    .await?;
                }
            }
        }

        self.dispatcher
            .round_trip(ClientRequest::CommitModel {
                model_id: record.model_id,
            })
            .await?;
        self.wait_ready(&record, deadline).await?;
        info!(model = %record.model_name, id = %record.model_id, "model ready");
        Ok(record)
    }

    async fn upload_asset(
        &self,
        model_id: Uuid,
        asset_id: Uuid,
        name: &str,
        source: ByteSource,
    ) -> Result<()> {
        let (size, digest) = source.stage().await.map_err(Error::from)?;
        let reply = self
            .dispatcher
            .round_trip(ClientRequest::PrepareAsset {
                model_id,
                asset_id,
                size,
                digest: digest.clone(),
            })
            .await?;
        match reply {
            PlatformReply::AssetDisposition {
                already_stored: true,
                ..
            } => {
                debug!(asset = name, "platform already stores these bytes, skipping upload");
                Ok(())
            }
            PlatformReply::AssetDisposition {
                transfer_id: Some(transfer_id),
                ..
            } => {
                debug!(asset = name, size, %transfer_id, "uploading asset");
                self.transport.push(transfer_id, &source, &digest).await?;
                Ok(())
            }
            PlatformReply::AssetDisposition { .. } => Err(DispatchError::Protocol {
                detail: format!("asset {name} was neither stored nor given a transfer"),
            }
            .into()),
            other => Err(unexpected_reply("asset_disposition", &other).into()),
        }
    }

    async fn wait_ready(&self, record: &ModelRecord, deadline: Instant) -> Result<()> {
        let mut poll = time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            if time::timeout_at(deadline, poll.tick()).await.is_err() {
                warn!(model = %record.model_name, "registration deadline reached");
                return Err(Error::TimedOut {
                    subject: format!("registration of model {}", record.model_name),
                    ceiling: self.ceiling,
                });
            }
            let readiness = self.status(record.model_id).await?;
            if let Some(bad) = readiness
                .assets
                .iter()
                .find(|a| a.state == AssetState::Failed)
            {
                return Err(Error::RegistrationIncomplete {
                    asset_name: bad.asset_name.clone(),
                    detail: bad
                        .detail
                        .clone()
                        .unwrap_or_else(|| "asset storage failed".into()),
                });
            }
            if readiness.ready {
                return Ok(());
            }
            debug!(model = %record.model_name, "model not ready yet");
        }
    }

    pub(crate) async fn status(&self, model_id: Uuid) -> Result<ModelReadiness> {
        let reply = self
            .dispatcher
            .round_trip(ClientRequest::ModelStatus { model_id })
            .await?;
        match reply {
            PlatformReply::ModelStatus {
                model_id,
                ready,
                assets,
            } => Ok(ModelReadiness {
                model_id,
                ready,
                assets,
            }),
            other => Err(unexpected_reply("model_status", &other).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::ParameterSignature;

    fn echo_signature() -> ModelSignature {
        ModelSignature::builder()
            .input(ParameterSignature::builder("Prompt", "utf8").build().unwrap())
            .output(ParameterSignature::builder("Answer", "utf8").build().unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn blank_names_are_rejected() {
        let config = ModelConfig::new("  ", "v1", echo_signature());
        assert!(matches!(
            config.validate(),
            Err(ModelConfigError::EmptyModelName)
        ));

        let config = ModelConfig::new("writer", "", echo_signature());
        assert!(matches!(
            config.validate(),
            Err(ModelConfigError::EmptyVersionLabel)
        ));
    }

    #[test]
    fn duplicate_asset_names_are_rejected() {
        let config = ModelConfig::new("writer", "v1", echo_signature())
            .asset(ModelAsset::bytes("weights", vec![1]))
            .asset(ModelAsset::bytes("weights", vec![2]));
        assert!(matches!(
            config.validate(),
            Err(ModelConfigError::DuplicateAssetName { name }) if name == "weights"
        ));
    }

    #[test]
    fn asset_links_must_be_http() {
        let config = ModelConfig::new("writer", "v1", echo_signature())
            .asset(ModelAsset::link("weights", "ftp://mirror.example/weights.bin"));
        assert!(matches!(
            config.validate(),
            Err(ModelConfigError::InvalidAssetLink { .. })
        ));

        let config = ModelConfig::new("writer", "v1", echo_signature())
            .asset(ModelAsset::link("weights", "https://mirror.example/weights.bin"));
        config.validate().unwrap();
    }

    #[test]
    fn manifest_lists_assets_in_declared_order() {
        let config = ModelConfig::new("writer", "v1", echo_signature())
            .describe("a writing model")
            .asset(ModelAsset::bytes("weights", vec![1]))
            .asset(ModelAsset::bytes("tokenizer", vec![2]));
        let manifest = config.manifest();
        assert_eq!(manifest.model_name, "writer");
        assert_eq!(manifest.assets, vec!["weights", "tokenizer"]);
        assert_eq!(manifest.short_description.as_deref(), Some("a writing model"));
    }

    #[test]
    fn signature_problems_surface_through_validation() {
        let broken = ModelSignature::new(vec![], vec![]);
        let config = ModelConfig::new("writer", "v1", broken);
        assert!(matches!(
            config.validate(),
            Err(ModelConfigError::Signature(_))
        ));
    }
}
