//! Client SDK for the Meridian model-serving platform.
//!
//! The SDK covers both sides of the platform: invoking models someone else
//! published, and publishing models of your own. A [`MeridianClient`] owns
//! one control link to the gateway and fans out to event and transfer links
//! as operations need them.
//!
//! ```no_run
//! use meridian_sdk::{Credential, InvocationRequest, MeridianClient, PlatformConfig};
//!
//! # async fn run() -> meridian_sdk::Result<()> {
//! let client = MeridianClient::connect(
//!     PlatformConfig::for_gateway("api.example.net:7700"),
//!     Credential::from_env()?,
//! )
//! .await?;
//!
//! let outputs = client
//!     .invoke(InvocationRequest::new("orbital-diffusion").input("Prompt", "a cat on Mars"))
//!     .await?;
//! println!("{:?}", outputs.get("Image"));
//! # Ok(())
//! # }
//! ```

pub mod communication;
pub mod core;
pub mod security;
pub mod services;
pub mod signature;

/// Version string reported to the platform with every request.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

// Client, config, errors, logging
pub use crate::core::client::MeridianClient;
pub use crate::core::config::{ConfigError, PlatformConfig};
pub use crate::core::error::{Error, Result};
pub use crate::core::logging::{init_logging, LogFormat};

// Credentials
pub use crate::security::credentials::{Credential, CredentialError, CREDENTIAL_ENV};

// Signatures and payload shaping
pub use crate::signature::transform::{
    InputValue, InvocationOutputs, InvocationRequest, OutputEntry, OutputValue, TransformError,
};
pub use crate::signature::{
    DataModality, ModelSignature, ParameterName, ParameterSignature, ParameterSignatureBuilder,
    ReceiveFormat, SignatureBuilder, SignatureError, SignatureSide,
};

// Invocation and registration services
pub use crate::services::invocation::{JobHandle, JobState};
pub use crate::services::registration::{
    ModelAsset, ModelConfig, ModelConfigError, ModelReadiness,
};

// Wire types that surface through the public API
pub use crate::communication::wire::{
    AssetRecord, AssetState, AssetStatus, JobEvent, ModelRecord, RemoteJobState,
};
pub use crate::communication::{
    Connector, DispatchError, EventConfig, GatewayConfig, LinkError, LinkPurpose, PlatformLink,
    ReconnectPolicy, RetryConfig, TransferConfig, TransferError,
};

/// One-stop imports for typical embedders:
/// `use meridian_sdk::prelude::*`.
pub mod prelude {
    pub use crate::core::client::MeridianClient;
    pub use crate::core::config::PlatformConfig;
    pub use crate::core::error::{Error, Result};
    pub use crate::security::credentials::Credential;
    pub use crate::services::invocation::{JobHandle, JobState};
    pub use crate::services::registration::{ModelAsset, ModelConfig};
    pub use crate::signature::transform::{
        InputValue, InvocationOutputs, InvocationRequest,
    };
    pub use crate::signature::{ModelSignature, ParameterSignature};
}
