//! Control RPC client for worker processes.
//!
//! Every worker exposes a control endpoint (`/wctrl?cmd=<command>`). The
//! client validates the command, authenticates with the admin credential,
//! retries transient failures, and decodes the worker's JSON reply into a
//! [`CommandResponse`].
//!
//! # Error codes
//!
//! | code | meaning                                  | retried |
//! |------|------------------------------------------|---------|
//! | 100  | unsupported command, no network call     | no      |
//! | 120  | worker answered with an HTTP error       | no      |
//! | 121  | endpoint unreachable                     | yes     |
//! | 122  | malformed response (head or body)        | no      |
//! | 123  | anything else                            | no      |
//!
//! Socket failures after a connection was established are retried too,
//! but exhausting them is returned as [`CommandError::SocketExhausted`]
//! instead of an error response.

pub mod client;
pub mod command;
pub mod credentials;
pub mod error;
pub mod response;
pub mod transport;

pub use client::{CommandClient, RetryPolicy};
pub use command::{Command, Endpoint, Scheme};
pub use credentials::{BasicCredentials, CredentialStore};
pub use error::{CommandError, CredentialError};
pub use response::{CommandResponse, CommandStatus, ErrorCode};
pub use transport::{HyperTransport, Transport, TransportError};
