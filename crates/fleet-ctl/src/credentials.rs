//! Admin credential lookup for control requests.

use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use fleet_core::config::AuthConfig;

use crate::error::CredentialError;

/// Source of the basic-auth token sent with every control request.
pub trait CredentialStore: Send + Sync {
    /// Base64-encoded `user:password`.
    fn admin_credential(&self) -> Result<String, CredentialError>;
}

#[derive(Debug, Clone)]
enum PasswordSource {
    Inline(String),
    /// Read on every request so a rotated password is picked up.
    File(PathBuf),
}

/// Admin user plus a password held inline or in a file.
#[derive(Debug, Clone)]
pub struct BasicCredentials {
    user: String,
    password: PasswordSource,
}

impl BasicCredentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: PasswordSource::Inline(password.into()),
        }
    }

    pub fn from_password_file(user: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            password: PasswordSource::File(path.into()),
        }
    }

    /// Build from `[auth]`. A password file wins over an inline password.
    pub fn from_config(auth: &AuthConfig) -> Result<Self, CredentialError> {
        let user = auth.admin_user.clone().unwrap_or_else(|| "admin".to_string());
        match (&auth.admin_password_file, &auth.admin_password) {
            (Some(path), _) => Ok(Self::from_password_file(user, path.clone())),
            (None, Some(password)) => Ok(Self::new(user, password.clone())),
            (None, None) => Err(CredentialError::MissingPassword),
        }
    }

    fn password(&self) -> Result<String, CredentialError> {
        match &self.password {
            PasswordSource::Inline(p) => Ok(p.clone()),
            PasswordSource::File(path) => {
                let content =
                    std::fs::read_to_string(path).map_err(|source| CredentialError::Read {
                        path: path.clone(),
                        source,
                    })?;
                let password = content.trim_end_matches(['\r', '\n']).to_string();
                if password.is_empty() {
                    return Err(CredentialError::Empty(path.clone()));
                }
                Ok(password)
            }
        }
    }
}

impl CredentialStore for BasicCredentials {
    fn admin_credential(&self) -> Result<String, CredentialError> {
        let password = self.password()?;
        Ok(STANDARD.encode(format!("{}:{}", self.user, password)))
    }
}
