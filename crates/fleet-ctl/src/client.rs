//! Command client: issue one control command to a worker and decode the reply.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use fleet_core::config::{DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_DELAY, FleetConfig};

use crate::command::{Command, Endpoint};
use crate::credentials::{BasicCredentials, CredentialStore};
use crate::error::CommandError;
use crate::response::{CommandResponse, ErrorCode};
use crate::transport::{HyperTransport, Transport, TransportError};

/// Bounded retry for connect and socket failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Pause before retrying a connect failure. Socket failures retry at once.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Client for the worker control endpoint.
#[derive(Clone)]
pub struct CommandClient {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    host: String,
    retry: RetryPolicy,
}

impl CommandClient {
    pub fn new(transport: Arc<dyn Transport>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            transport,
            credentials,
            host: "localhost".to_string(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Build the production client from `[transport]` and `[auth]`.
    pub fn from_config(config: &FleetConfig) -> Result<Self, CommandError> {
        let transport = HyperTransport::from_config(&config.transport)?;
        let credentials = BasicCredentials::from_config(&config.auth)?;
        let delay = config
            .transport
            .retry_delay()
            .map_err(|e| CommandError::Setup(e.to_string()))?;

        Ok(Self::new(Arc::new(transport), Arc::new(credentials))
            .with_host(config.transport.host())
            .with_retry(RetryPolicy {
                max_attempts: config.transport.retry_attempts().max(1),
                delay,
            }))
    }

    pub fn endpoint(&self, command: Command, port: u16) -> Endpoint {
        Endpoint {
            scheme: self.transport.scheme(),
            host: self.host.clone(),
            port,
            command,
        }
    }

    /// Send `command` to the worker listening on `port`.
    ///
    /// Every failure the worker or the network can cause is returned as a
    /// failed [`CommandResponse`] carrying an [`ErrorCode`]. Only a missing
    /// credential and exhausted socket retries are returned as `Err`.
    pub async fn issue_request(
        &self,
        command: &str,
        port: u16,
    ) -> Result<CommandResponse, CommandError> {
        let cmd = match command.parse::<Command>() {
            Ok(cmd) => cmd,
            Err(msg) => {
                warn!(command, port, "{msg}");
                return Ok(CommandResponse::failure(
                    command,
                    ErrorCode::UnsupportedCommand,
                    msg,
                ));
            }
        };

        let credential = self.credentials.admin_credential()?;
        let endpoint = self.endpoint(cmd, port);
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(url = %endpoint, attempt, "issuing control request");

            let err = match self.transport.get(&endpoint, &credential).await {
                Ok(body) => {
                    return Ok(match CommandResponse::decode(&body) {
                        Ok(resp) => resp.with_default_cmd(cmd),
                        Err(e) => {
                            warn!(url = %endpoint, error = %e, "undecodable control response");
                            CommandResponse::failure(
                                command,
                                ErrorCode::MalformedResponse,
                                format!("malformed response body: {e}"),
                            )
                        }
                    });
                }
                Err(err) => err,
            };

            match err {
                TransportError::Status { .. } => {
                    warn!(url = %endpoint, error = %err, "control request rejected");
                    return Ok(CommandResponse::failure(
                        command,
                        ErrorCode::HttpError,
                        err.to_string(),
                    ));
                }
                TransportError::Connect { .. } => {
                    if attempt >= max_attempts {
                        warn!(url = %endpoint, attempts = attempt, error = %err, "worker unreachable");
                        return Ok(CommandResponse::failure(
                            command,
                            ErrorCode::Unreachable,
                            err.to_string(),
                        ));
                    }
                    warn!(url = %endpoint, attempt, error = %err, "connect failed, retrying");
                    tokio::time::sleep(self.retry.delay).await;
                }
                TransportError::Socket(reason) => {
                    if attempt >= max_attempts {
                        return Err(CommandError::SocketExhausted {
                            attempts: attempt,
                            reason,
                        });
                    }
                    warn!(url = %endpoint, attempt, %reason, "socket error, retrying");
                }
                TransportError::BadStatusLine(_) => {
                    warn!(url = %endpoint, error = %err, "malformed response head");
                    return Ok(CommandResponse::failure(
                        command,
                        ErrorCode::MalformedResponse,
                        err.to_string(),
                    ));
                }
                TransportError::Other(_) => {
                    warn!(url = %endpoint, error = %err, "control request failed");
                    return Ok(CommandResponse::failure(
                        command,
                        ErrorCode::Unexpected,
                        err.to_string(),
                    ));
                }
            }
        }
    }
}
