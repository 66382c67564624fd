//! Top-level error type returned across the public API.
//!
//! Layer errors keep their own types ([`DispatchError`], [`TransferError`],
//! and friends) and convert losslessly into [`Error`] at the client surface,
//! so callers match on one enum while logs keep the precise cause.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::communication::{DispatchError, LinkError, TransferError};
use crate::core::config::ConfigError;
use crate::security::credentials::CredentialError;
use crate::services::registration::ModelConfigError;
use crate::signature::transform::TransformError;
use crate::signature::SignatureError;

pub type Result<T> = std::result::Result<T, Error>;

/// Any failure the SDK can surface to a caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    ModelConfig(#[from] ModelConfigError),

    /// The platform ran the job and reported failure.
    #[error("job {job_id} failed: {reason}")]
    JobFailure { job_id: Uuid, reason: String },

    /// A wait outlived its configured ceiling.
    #[error("{subject} did not finish within {ceiling:?}")]
    TimedOut { subject: String, ceiling: Duration },

    #[error("job {job_id} was cancelled")]
    Cancelled { job_id: Uuid },

    /// Registration committed but an asset never became usable.
    #[error("asset {asset_name} failed to register: {detail}")]
    RegistrationIncomplete { asset_name: String, detail: String },

    /// The job succeeded but its outputs could not be collected.
    #[error("could not retrieve results of job {job_id}: {detail}")]
    ResultRetrieval { job_id: Uuid, detail: String },
}

impl Error {
    /// True when the failure is an authentication rejection, which no retry
    /// will fix.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Self::Dispatch(DispatchError::AuthenticationFailed { .. })
        )
    }

    /// True when the underlying cause was connectivity, not semantics.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Dispatch(err) => err.is_transient(),
            Self::Link(_) => true,
            Self::Transfer(TransferError::Link(_)) => true,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_rejection_is_classified() {
        let err = Error::from(DispatchError::AuthenticationFailed { status: 401 });
        assert!(err.is_auth());
        assert!(!err.is_transient());
    }

    #[test]
    fn link_failures_are_transient() {
        let err = Error::from(LinkError::NotConnected);
        assert!(err.is_transient());
        assert!(!err.is_auth());
    }

    #[test]
    fn job_failure_formats_the_reason() {
        let job_id = Uuid::nil();
        let err = Error::JobFailure {
            job_id,
            reason: "out of memory".into(),
        };
        assert!(err.to_string().contains("out of memory"));
        assert!(!err.is_transient());
    }
}
