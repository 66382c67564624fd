//! Account credential: the opaque bearer token presented on every request.

use std::env;
use std::fmt;
use std::path::Path;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

/// Environment variable consulted by [`Credential::from_env`].
pub const CREDENTIAL_ENV: &str = "MERIDIAN_API_TOKEN";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential is empty")]
    Empty,

    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    #[error("failed to read credential file {path}: {source}")]
    UnreadableFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Bearer token for a platform account.
///
/// The token lives in a [`SecretString`] so it never leaks through `Debug`
/// or log output; the wire layer is the only reader.
#[derive(Clone)]
pub struct Credential {
    token: SecretString,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }

    /// Read the token from [`CREDENTIAL_ENV`].
    pub fn from_env() -> Result<Self, CredentialError> {
        Self::from_env_var(CREDENTIAL_ENV)
    }

    pub fn from_env_var(name: &str) -> Result<Self, CredentialError> {
        match env::var(name) {
            Ok(value) if !value.trim().is_empty() => Ok(Self::new(value.trim().to_string())),
            Ok(_) => Err(CredentialError::Empty),
            Err(_) => Err(CredentialError::MissingEnv(name.to_string())),
        }
    }

    /// Read the token from a file, ignoring surrounding whitespace.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CredentialError> {
        let path = path.as_ref();
        let raw =
            std::fs::read_to_string(path).map_err(|source| CredentialError::UnreadableFile {
                path: path.display().to_string(),
                source,
            })?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CredentialError::Empty);
        }
        Ok(Self::new(trimmed.to_string()))
    }

    pub(crate) fn reveal(&self) -> &str {
        self.token.expose_secret()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

impl From<String> for Credential {
    fn from(token: String) -> Self {
        Self::new(token)
    }
}

impl From<&str> for Credential {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn debug_never_prints_the_token() {
        let credential = Credential::new("super-secret-token");
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("super-secret-token"));
        assert_eq!(credential.reveal(), "super-secret-token");
    }

    #[test]
    fn env_lookup_trims_and_validates() {
        env::set_var("MERIDIAN_TEST_TOKEN_A", "  tok-123  ");
        let credential = Credential::from_env_var("MERIDIAN_TEST_TOKEN_A").unwrap();
        assert_eq!(credential.reveal(), "tok-123");

        env::set_var("MERIDIAN_TEST_TOKEN_B", "   ");
        assert!(matches!(
            Credential::from_env_var("MERIDIAN_TEST_TOKEN_B"),
            Err(CredentialError::Empty)
        ));

        assert!(matches!(
            Credential::from_env_var("MERIDIAN_TEST_TOKEN_UNSET"),
            Err(CredentialError::MissingEnv(_))
        ));
    }

    #[test]
    fn file_source_reads_and_trims() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "tok-from-file").unwrap();
        let credential = Credential::from_file(file.path()).unwrap();
        assert_eq!(credential.reveal(), "tok-from-file");

        let empty = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            Credential::from_file(empty.path()),
            Err(CredentialError::Empty)
        ));

        assert!(matches!(
            Credential::from_file("/nonexistent/credential"),
            Err(CredentialError::UnreadableFile { .. })
        ));
    }
}
