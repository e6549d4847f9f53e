//! API credential discovery: explicit values, environment variables, or
//! the `~/.ecmwfapirc` file.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::error::CredentialError;

pub const ENV_URL: &str = "ECMWF_API_URL";
pub const ENV_KEY: &str = "ECMWF_API_KEY";
pub const ENV_EMAIL: &str = "ECMWF_API_EMAIL";

/// Name of the credentials file looked up in the home directory. It holds
/// a JSON object with `url`, `key` and `email` keys.
pub const RC_FILE_NAME: &str = ".ecmwfapirc";

/// The `(url, key, email)` triple identifying an API user.
#[derive(Clone, Debug, Deserialize)]
pub struct Credentials {
    pub url: String,
    pub key: String,
    pub email: String,
}

impl Credentials {
    pub fn new(
        url: impl Into<String>,
        key: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            key: key.into(),
            email: email.into(),
        }
    }

    /// Looks the credentials up in the environment first, then in
    /// `~/.ecmwfapirc`.
    pub fn discover() -> Result<Self, CredentialError> {
        Self::from_env().or_else(|_| Self::from_rc_file())
    }

    pub fn from_env() -> Result<Self, CredentialError> {
        let read = |name| env::var(name).map_err(|_| CredentialError::Environment);
        Ok(Self {
            url: read(ENV_URL)?,
            key: read(ENV_KEY)?,
            email: read(ENV_EMAIL)?,
        })
    }

    pub fn from_rc_file() -> Result<Self, CredentialError> {
        let home = env::var_os("HOME").ok_or(CredentialError::NotFound)?;
        Self::from_rc_path(&PathBuf::from(home).join(RC_FILE_NAME))
    }

    pub fn from_rc_path(path: &Path) -> Result<Self, CredentialError> {
        let contents = fs::read_to_string(path).map_err(|source| {
            CredentialError::Read {
                path: path.display().to_string(),
                source,
            }
        })?;
        serde_json::from_str(&contents).map_err(|_| {
            CredentialError::Malformed {
                path: path.display().to_string(),
            }
        })
    }
}
