//! Credential handling for platform authentication.

pub mod credentials;

pub use credentials::{Credential, CredentialError, CREDENTIAL_ENV};
