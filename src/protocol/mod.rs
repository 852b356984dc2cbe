//! Device command protocol: framing, error round-trips, recovery.
//!
//! Controllers speak newline-terminated ASCII over a character stream. Every
//! state-changing command is followed by the fixed error query ([`ERROR_QUERY`]),
//! whose single integer line is decoded through [`error_codes`]. The command,
//! its error query, and any homing recovery form one atomic unit under the
//! per-device lock, so interleaved callers can never corrupt the response
//! stream.
//!
//! Timeout semantics: each read has a short fixed deadline from configuration.
//! Reads are retried up to the configured budget before surfacing
//! [`ScopeError::Timeout`]. A command for which the device produces no output
//! is not an error by itself; [`CommandChannel::query_optional`] encodes the
//! "no output; must be done" convention for responses that may legitimately
//! never arrive.

pub mod error_codes;
pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::error::{AppResult, ScopeError};

pub use mock::MockTransport;
#[cfg(feature = "instrument_serial")]
pub use serial::SerialTransport;

/// Fixed command that makes the controller report its latest error code.
pub const ERROR_QUERY: &str = "TE?";

/// Transport-level failures, below the protocol's error-code layer.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Transport used before a connection was opened.
    #[error("transport not connected")]
    NotConnected,

    /// No delimiter arrived within the read deadline.
    #[error("read timed out after {elapsed:?}")]
    Timeout {
        /// Time spent waiting for the delimiter.
        elapsed: Duration,
    },

    /// The stream ended mid-response.
    #[error("unexpected EOF from device")]
    Eof,

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else the transport cannot express more precisely.
    #[error("{0}")]
    Failed(String),
}

impl From<TransportError> for ScopeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected => ScopeError::NotConnected,
            TransportError::Timeout { elapsed } => ScopeError::Timeout { elapsed },
            TransportError::Eof => ScopeError::Protocol("unexpected EOF from device".to_string()),
            TransportError::Io(e) => ScopeError::Io(e),
            TransportError::Failed(msg) => ScopeError::Protocol(msg),
        }
    }
}

/// A bidirectional character-stream link to one controller.
///
/// `send` writes a terminated command without waiting for output; `query`
/// writes and then reads one delimited response line.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write a command, appending the configured terminator.
    async fn send(&mut self, command: &str) -> Result<(), TransportError>;

    /// Write a command and read one response line, trimmed.
    async fn query(&mut self, command: &str) -> Result<String, TransportError>;
}

/// Serialized command access to a single controller.
///
/// Exactly one caller holds the transport lock at a time; a command plus its
/// error round-trip (plus homing recovery, when needed) executes atomically
/// under that lock. Clones share the same lock, so handlers for different axes
/// of one controller can share a channel safely.
#[derive(Clone)]
pub struct CommandChannel {
    transport: Arc<Mutex<Box<dyn Transport>>>,
    retries: u32,
}

impl CommandChannel {
    /// Wrap a transport. `retries` bounds re-reads after a timeout.
    pub fn new(transport: Box<dyn Transport>, retries: u32) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            retries,
        }
    }

    /// Issue a state-changing command and round-trip the error query.
    ///
    /// Code 0 is success. An operator-stop code is logged and swallowed. A
    /// homing-required code runs the recovery workflow when `home` names the
    /// axis homing command: home, then re-issue the original command once.
    /// Every other code raises [`ScopeError::Device`].
    pub async fn command(&self, command: &str, home: Option<&str>) -> AppResult<()> {
        let mut transport = self.transport.lock().await;
        transport.send(command).await.map_err(ScopeError::from)?;
        let code = self.read_error_code(&mut transport).await?;

        if error_codes::is_success(code) {
            return Ok(());
        }
        if error_codes::is_user_abort(code) {
            debug!("'{}': motion stopped by user; not an error", command);
            return Ok(());
        }
        if error_codes::needs_homing(code) {
            if let Some(home_command) = home {
                warn!(
                    "'{}' rejected (code {}: {}); homing and retrying",
                    command,
                    code,
                    error_codes::describe(code)
                );
                transport
                    .send(home_command)
                    .await
                    .map_err(ScopeError::from)?;
                let home_code = self.read_error_code(&mut transport).await?;
                if !error_codes::is_success(home_code) && !error_codes::is_user_abort(home_code) {
                    return Err(ScopeError::Device {
                        code: home_code,
                        description: error_codes::describe(home_code),
                    });
                }

                transport.send(command).await.map_err(ScopeError::from)?;
                let retry_code = self.read_error_code(&mut transport).await?;
                if error_codes::is_success(retry_code) || error_codes::is_user_abort(retry_code) {
                    return Ok(());
                }
                return Err(ScopeError::Device {
                    code: retry_code,
                    description: error_codes::describe(retry_code),
                });
            }
        }

        Err(ScopeError::Device {
            code,
            description: error_codes::describe(code),
        })
    }

    /// Issue a query and return its single response line.
    ///
    /// Timed-out reads are retried up to the configured budget, then surfaced
    /// as [`ScopeError::Timeout`]. No error round-trip is performed; queries
    /// carry their answer in-band.
    pub async fn query_value(&self, command: &str) -> AppResult<String> {
        let mut transport = self.transport.lock().await;
        self.query_with_retries(&mut transport, command).await
    }

    /// Issue a query whose response may legitimately never arrive.
    ///
    /// A timed-out read means "no output; must be done" and maps to `None`
    /// instead of an error.
    pub async fn query_optional(&self, command: &str) -> AppResult<Option<String>> {
        let mut transport = self.transport.lock().await;
        match transport.query(command).await {
            Ok(response) => Ok(Some(response)),
            Err(TransportError::Timeout { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn query_with_retries(
        &self,
        transport: &mut Box<dyn Transport>,
        command: &str,
    ) -> AppResult<String> {
        let mut attempt = 0;
        loop {
            match transport.query(command).await {
                Ok(response) => return Ok(response),
                Err(TransportError::Timeout { elapsed }) => {
                    if attempt >= self.retries {
                        return Err(ScopeError::Timeout { elapsed });
                    }
                    attempt += 1;
                    debug!(
                        "read timeout on '{}' (attempt {}/{}), retrying",
                        command, attempt, self.retries
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn read_error_code(&self, transport: &mut Box<dyn Transport>) -> AppResult<i32> {
        let line = self.query_with_retries(transport, ERROR_QUERY).await?;
        line.trim().parse::<i32>().map_err(|_| {
            ScopeError::Protocol(format!("malformed error-query response: '{}'", line))
        })
    }
}
