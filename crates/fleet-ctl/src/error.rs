use std::path::PathBuf;

use thiserror::Error;

/// Failures that abort a command instead of producing an error response.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("admin credential unavailable: {0}")]
    Credentials(#[from] CredentialError),

    #[error("socket error after {attempts} attempts: {reason}")]
    SocketExhausted { attempts: u32, reason: String },

    #[error("transport setup failed: {0}")]
    Setup(String),
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no admin password configured")]
    MissingPassword,

    #[error("failed to read admin password from {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("admin password file {0} is empty")]
    Empty(PathBuf),
}
