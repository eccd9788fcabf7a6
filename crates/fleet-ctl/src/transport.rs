//! Network transport for control requests.
//!
//! [`HyperTransport`] opens one connection per request (plain TCP or
//! rustls), sends a `GET` with the basic-auth header and collects the
//! body. Failures are sorted into the classes the retry policy in
//! [`crate::client`] distinguishes.

use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use fleet_core::config::TransportConfig;

use crate::command::{Endpoint, Scheme};
use crate::error::CommandError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Classified transport failure.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The worker answered with a non-2xx status.
    #[error("HTTP Error {status}: {reason}")]
    Status { status: u16, reason: String },

    /// No connection could be established (refused, unresolvable, TLS handshake).
    #[error("cannot reach {url}: {reason}")]
    Connect { url: String, reason: String },

    /// The connection failed after it was established.
    #[error("socket error: {0}")]
    Socket(String),

    /// The response head could not be parsed.
    #[error("bad status line: {0}")]
    BadStatusLine(String),

    #[error("{0}")]
    Other(String),
}

/// Performs one control request and returns the response body.
pub trait Transport: Send + Sync {
    fn get<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        credential: &'a str,
    ) -> BoxFuture<'a, Result<Bytes, TransportError>>;

    /// Scheme the endpoints handled by this transport use.
    fn scheme(&self) -> Scheme;
}

/// hyper 1.x transport with optional TLS.
#[derive(Clone)]
pub struct HyperTransport {
    timeout: Duration,
    tls: Option<TlsConnector>,
}

impl HyperTransport {
    /// Plain HTTP.
    pub fn http(timeout: Duration) -> Self {
        Self { timeout, tls: None }
    }

    /// HTTPS trusting the Mozilla roots plus any certificates in `ca_file`.
    pub fn https(timeout: Duration, ca_file: Option<&Path>) -> Result<Self, CommandError> {
        Ok(Self {
            timeout,
            tls: Some(tls_connector(ca_file)?),
        })
    }

    pub fn from_config(config: &TransportConfig) -> Result<Self, CommandError> {
        let timeout = config
            .connect_timeout()
            .map_err(|e| CommandError::Setup(e.to_string()))?;
        if config.https {
            Self::https(timeout, config.ca_file.as_deref())
        } else {
            Ok(Self::http(timeout))
        }
    }

    async fn fetch(&self, endpoint: &Endpoint, credential: &str) -> Result<Bytes, TransportError> {
        let url = endpoint.url();
        let connect_err = |reason: String| TransportError::Connect {
            url: url.clone(),
            reason,
        };

        let stream = match tokio::time::timeout(
            self.timeout,
            TcpStream::connect(endpoint.authority()),
        )
        .await
        {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(connect_err(e.to_string())),
            Err(_) => return Err(connect_err("connection timed out".to_string())),
        };

        match &self.tls {
            None => self.exchange(stream, endpoint, credential).await,
            Some(connector) => {
                let server_name =
                    rustls::pki_types::ServerName::try_from(endpoint.host.clone())
                        .map_err(|e| connect_err(format!("invalid server name: {e}")))?;
                let tls = match tokio::time::timeout(
                    self.timeout,
                    connector.connect(server_name, stream),
                )
                .await
                {
                    Ok(Ok(s)) => s,
                    Ok(Err(e)) => return Err(connect_err(format!("tls handshake failed: {e}"))),
                    Err(_) => return Err(connect_err("tls handshake timed out".to_string())),
                };
                self.exchange(tls, endpoint, credential).await
            }
        }
    }

    async fn exchange<S>(
        &self,
        io: S,
        endpoint: &Endpoint,
        credential: &str,
    ) -> Result<Bytes, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let work = async {
            let io = hyper_util::rt::TokioIo::new(io);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(classify)?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let req = http::Request::builder()
                .method("GET")
                .uri(endpoint.path())
                .header(http::header::HOST, endpoint.authority())
                .header(http::header::AUTHORIZATION, format!("Basic {credential}"))
                .header(http::header::USER_AGENT, "fleet-ctl/0.1")
                .body(Empty::<Bytes>::new())
                .map_err(|e| TransportError::Other(e.to_string()))?;

            let resp = sender.send_request(req).await.map_err(classify)?;
            let status = resp.status();
            if !status.is_success() {
                debug!(%status, url = %endpoint, "control request non-2xx");
                return Err(TransportError::Status {
                    status: status.as_u16(),
                    reason: status.canonical_reason().unwrap_or("unknown").to_string(),
                });
            }

            let body = resp.into_body().collect().await.map_err(classify)?;
            Ok(body.to_bytes())
        };

        match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Socket("timed out".to_string())),
        }
    }
}

impl Transport for HyperTransport {
    fn get<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        credential: &'a str,
    ) -> BoxFuture<'a, Result<Bytes, TransportError>> {
        Box::pin(self.fetch(endpoint, credential))
    }

    fn scheme(&self) -> Scheme {
        if self.tls.is_some() {
            Scheme::Https
        } else {
            Scheme::Http
        }
    }
}

/// Sort a hyper error into a transport error class.
fn classify(e: hyper::Error) -> TransportError {
    if e.is_parse() || e.is_parse_status() {
        return TransportError::BadStatusLine(e.to_string());
    }
    let io_source = std::error::Error::source(&e).is_some_and(|s| s.is::<std::io::Error>());
    if io_source
        || e.is_incomplete_message()
        || e.is_closed()
        || e.is_canceled()
        || e.is_timeout()
    {
        return TransportError::Socket(e.to_string());
    }
    TransportError::Other(e.to_string())
}

fn tls_connector(ca_file: Option<&Path>) -> Result<TlsConnector, CommandError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = ca_file {
        let file = File::open(path)
            .map_err(|e| CommandError::Setup(format!("open {}: {e}", path.display())))?;
        let mut reader = BufReader::new(file);
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert
                .map_err(|e| CommandError::Setup(format!("read {}: {e}", path.display())))?;
            roots
                .add(cert)
                .map_err(|e| CommandError::Setup(format!("bad certificate: {e}")))?;
        }
    }

    let config =
        rustls::ClientConfig::builder_with_provider(rustls::crypto::ring::default_provider().into())
            .with_safe_default_protocol_versions()
            .map_err(|e| CommandError::Setup(format!("tls protocol version error: {e}")))?
            .with_root_certificates(roots)
            .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}
