//! Annotator login against a local YAML credentials file.
//!
//! ```yaml
//! credentials:
//!   usernames:
//!     maria:
//!       name: Maria Gomez
//!       password: $2b$12$...   # bcrypt hash
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to read credentials file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid credentials file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Username/password is incorrect.")]
    InvalidCredentials,
    #[error("failed to hash password: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    credentials: Credentials,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub usernames: BTreeMap<String, UserEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    pub name: String,
    /// bcrypt hash of the password (`$2a$`, `$2b$` or `$2y$`).
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl Credentials {
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        let raw = fs::read_to_string(path).map_err(|source| AuthError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let credentials = Self::from_yaml(&raw)?;
        info!("Loaded {} annotator accounts from {}", credentials.usernames.len(), path.display());
        Ok(credentials)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, AuthError> {
        let file: CredentialsFile = serde_yaml::from_str(raw)?;
        Ok(file.credentials)
    }

    /// Checks a login and returns the matching account.
    ///
    /// Unknown users and wrong passwords produce the same error.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<&UserEntry, AuthError> {
        let Some(entry) = self.usernames.get(username) else {
            warn!("Login attempt for unknown user {}", username);
            return Err(AuthError::InvalidCredentials);
        };
        match bcrypt::verify(password, entry.password.trim()) {
            Ok(true) => {
                info!("{} logged in", username);
                Ok(entry)
            }
            Ok(false) => {
                warn!("Wrong password for {}", username);
                Err(AuthError::InvalidCredentials)
            }
            Err(e) => {
                warn!("Stored password for {} is not a bcrypt hash: {}", username, e);
                Err(AuthError::InvalidCredentials)
            }
        }
    }
}

/// Hash to store in the credentials file for `password`, salted and at the
/// default bcrypt cost.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    Ok(bcrypt::hash(password, bcrypt::DEFAULT_COST)?)
}
