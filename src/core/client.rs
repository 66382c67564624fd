//! The SDK entry point: a connected client for invoking and publishing
//! models.
//!
//! One [`MeridianClient`] multiplexes every operation over a single control
//! link; event and transfer links are opened on demand by the layers that
//! need them. The client is `Send + Sync` and intended to be shared.

use std::fmt;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::communication::chunking::ChunkTransport;
use crate::communication::dispatch::{unexpected_reply, RequestDispatcher};
use crate::communication::events::EventHub;
use crate::communication::wire::{ClientRequest, JobEvent, ModelRecord, PlatformReply};
use crate::communication::{Connector, LinkPurpose, TcpConnector};
use crate::core::config::PlatformConfig;
use crate::core::error::Result;
use crate::security::credentials::Credential;
use crate::services::invocation::{InvocationService, JobHandle};
use crate::services::registration::{ModelConfig, ModelReadiness, RegistrationService};
use crate::signature::registry::SignatureCache;
use crate::signature::transform::{InvocationOutputs, InvocationRequest};
use crate::signature::ModelSignature;

pub struct MeridianClient {
    dispatcher: Arc<RequestDispatcher>,
    invocations: InvocationService,
    registration: RegistrationService,
    signatures: SignatureCache,
    config: PlatformConfig,
}

impl MeridianClient {
    /// Connect to the configured gateway over TCP.
    pub async fn connect(config: PlatformConfig, credential: Credential) -> Result<Self> {
        config.validate()?;
        let connector: Arc<dyn Connector> = Arc::new(TcpConnector::new(config.gateway_config()));
        Self::with_connector(config, credential, connector).await
    }

    /// Connect through an arbitrary [`Connector`]. This is how tests run
    /// against an in-memory platform, and how embedders supply their own
    /// transport.
    pub async fn with_connector(
        config: PlatformConfig,
        credential: Credential,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let control = connector.open(LinkPurpose::Control).await?;
        let dispatcher = Arc::new(RequestDispatcher::new(
            control,
            credential.clone(),
            config.retry.clone(),
            config.request_timeout,
        ));
        let transport = Arc::new(ChunkTransport::new(
            Arc::clone(&connector),
            credential.clone(),
            config.transfer.clone(),
        ));
        let hub = EventHub::new(
            Arc::clone(&connector),
            credential,
            Arc::clone(&dispatcher),
            config.events.clone(),
        );
        let invocations = InvocationService::new(
            Arc::clone(&dispatcher),
            Arc::clone(&transport),
            hub,
            &config,
        );
        let registration = RegistrationService::new(Arc::clone(&dispatcher), transport, &config);
        Ok(Self {
            dispatcher,
            invocations,
            registration,
            signatures: SignatureCache::new(),
            config,
        })
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    /// Resolve a model's signature, consulting the local cache first.
    pub async fn describe_model(&self, model_name: &str) -> Result<Arc<ModelSignature>> {
        if let Some(hit) = self.signatures.get(model_name) {
            return Ok(hit.signature);
        }
        let reply = self
            .dispatcher
            .round_trip(ClientRequest::DescribeModel {
                model_name: model_name.to_string(),
            })
            .await?;
        match reply {
            PlatformReply::ModelDescribed {
                model_id,
                signature,
            } => {
                // The wire is untrusted; a malformed signature fails here,
                // not deep inside an invocation.
                signature.validate()?;
                debug!(model = model_name, %model_id, "signature resolved");
                Ok(self
                    .signatures
                    .insert(model_name.to_string(), model_id, signature))
            }
            other => Err(unexpected_reply("model_described", &other).into()),
        }
    }

    /// Drop a cached signature so the next use refetches it.
    pub fn invalidate_signature(&self, model_name: &str) -> bool {
        self.signatures.invalidate(model_name)
    }

    /// Submit an invocation and return a handle to the running job.
    pub async fn submit(&self, request: InvocationRequest) -> Result<JobHandle> {
        let signature = self.describe_model(request.model_name()).await?;
        self.invocations.submit(signature, &request).await
    }

    /// Submit an invocation and wait for its outputs.
    pub async fn invoke(&self, request: InvocationRequest) -> Result<InvocationOutputs> {
        let handle = self.submit(request).await?;
        handle.wait().await
    }

    /// Publish a model and wait until the platform reports it ready.
    pub async fn register_model(&self, config: &ModelConfig) -> Result<ModelRecord> {
        let record = self.registration.register(config).await?;
        // The caller will usually invoke what it just registered.
        self.signatures.insert(
            record.model_name.clone(),
            record.model_id,
            config.signature().clone(),
        );
        Ok(record)
    }

    pub async fn model_status(&self, model_id: Uuid) -> Result<ModelReadiness> {
        self.registration.status(model_id).await
    }

    /// One-off status query for a job, with or without a live handle.
    pub async fn job_status(&self, job_id: Uuid) -> Result<JobEvent> {
        let reply = self
            .dispatcher
            .round_trip(ClientRequest::JobStatus { job_id })
            .await?;
        match reply {
            PlatformReply::StatusReport(event) => Ok(event),
            other => Err(unexpected_reply("status_report", &other).into()),
        }
    }

    /// Control-plane cancel for a job this process holds no handle to.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<()> {
        self.dispatcher
            .round_trip(ClientRequest::CancelJob { job_id })
            .await?;
        Ok(())
    }
}

impl fmt::Debug for MeridianClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeridianClient")
            .field("gateway", &self.config.gateway)
            .field("cached_signatures", &self.signatures.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::testkit::{FakePlatform, JobScript};
    use crate::signature::ParameterSignature;

    fn echo_signature() -> ModelSignature {
        ModelSignature::builder()
            .input(ParameterSignature::builder("Prompt", "utf8").build().unwrap())
            .output(ParameterSignature::builder("Answer", "utf8").build().unwrap())
            .build()
            .unwrap()
    }

    async fn client_for(platform: &FakePlatform) -> MeridianClient {
        MeridianClient::with_connector(
            PlatformConfig::default(),
            Credential::new("tok"),
            platform.connector(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn describe_hits_the_cache_on_repeat() {
        let platform = FakePlatform::new("tok");
        platform.seed_model("writer", echo_signature(), JobScript::Never);
        let client = client_for(&platform).await;

        let first = client.describe_model("writer").await.unwrap();
        let second = client.describe_model("writer").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(platform.request_count(), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_a_refetch() {
        let platform = FakePlatform::new("tok");
        platform.seed_model("writer", echo_signature(), JobScript::Never);
        let client = client_for(&platform).await;

        client.describe_model("writer").await.unwrap();
        assert!(client.invalidate_signature("writer"));
        client.describe_model("writer").await.unwrap();
        assert_eq!(platform.request_count(), 2);
    }

    #[tokio::test]
    async fn unknown_model_surfaces_the_rejection() {
        let platform = FakePlatform::new("tok");
        let client = client_for(&platform).await;
        let err = client.describe_model("nobody").await.unwrap_err();
        assert!(err.to_string().contains("unknown model"));
    }
}
