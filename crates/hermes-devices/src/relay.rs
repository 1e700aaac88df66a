/*!
 * HTTP relay to device command endpoints.
 *
 * A relay performs exactly one outbound POST per call, bounded by the
 * configured timeout, and normalizes every transport failure into a
 * [`RelayError`] that maps onto the client-facing error codes. Retrying is
 * left to the caller.
 */
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use hermes_core::config::RelayConfig;
use hermes_core::utils::{duration_to_millis, with_timeout};

use crate::protocol::ErrorCode;

/// Errors surfaced by a relay call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The URL is malformed or the device cannot be reached
    #[error("Invalid or unreachable device url: {0}")]
    InvalidUrl(String),

    /// The device did not answer within the timeout
    #[error("Device did not answer within {0:?}")]
    Timeout(Duration),

    /// The device answered with a body that is not JSON
    #[error("Invalid response JSON: {0}")]
    InvalidResponseJson(String),

    /// The device answered with more data than allowed
    #[error("Response of {actual} bytes exceeds the {limit} byte limit")]
    InvalidResponseLength {
        /// Configured ceiling
        limit: usize,
        /// Size of the received body
        actual: usize,
    },

    /// Any other transport failure
    #[error("Transport error: {0}")]
    Transport(String),
}

impl RelayError {
    /// The client-facing error code for this failure
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RelayError::InvalidUrl(_) | RelayError::Transport(_) => ErrorCode::InvalidUrl,
            RelayError::Timeout(_) => ErrorCode::HttpTimeout,
            RelayError::InvalidResponseJson(_) => ErrorCode::InvalidResponseJson,
            RelayError::InvalidResponseLength { .. } => ErrorCode::InvalidResponseLength,
        }
    }

    fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            RelayError::Timeout(timeout)
        } else if err.is_builder() || err.is_connect() || err.is_redirect() {
            RelayError::InvalidUrl(err.to_string())
        } else if err.is_body() || err.is_decode() {
            RelayError::InvalidResponseJson(err.to_string())
        } else {
            RelayError::Transport(err.to_string())
        }
    }
}

/// Outbound transport to device command endpoints
#[async_trait]
pub trait Relay: Send + Sync + Debug {
    /// POST `body` to `url` and return the device's JSON reply
    async fn post(&self, url: &str, body: &Value) -> Result<Value, RelayError>;
}

/// A shared handle to a relay
pub type SharedRelay = Arc<dyn Relay>;

/// Relay backed by a `reqwest` client
#[derive(Debug, Clone)]
pub struct HttpRelay {
    client: Client,
    timeout: Duration,
    max_response_bytes: usize,
}

impl HttpRelay {
    /// Create a relay from its configuration
    pub fn new(config: &RelayConfig) -> Result<Self, RelayError> {
        let timeout = config.request_timeout();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            timeout,
            max_response_bytes: config.max_response_bytes,
        })
    }

    /// The request timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn check_length(&self, actual: usize) -> Result<(), RelayError> {
        if actual > self.max_response_bytes {
            return Err(RelayError::InvalidResponseLength {
                limit: self.max_response_bytes,
                actual,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Relay for HttpRelay {
    async fn post(&self, url: &str, body: &Value) -> Result<Value, RelayError> {
        let target = Url::parse(url).map_err(|e| RelayError::InvalidUrl(format!("{}: {}", url, e)))?;
        debug!(url = %target, "Relaying device request");

        let exchange = async {
            let response = self.client.post(target).json(body).send().await?;
            if !response.status().is_success() {
                warn!(status = %response.status(), "Device answered with a non-success status");
            }
            if let Some(len) = response.content_length() {
                if let Err(e) = self.check_length(len as usize) {
                    return Ok(Err(e));
                }
            }
            let bytes = response.bytes().await?;
            Ok::<_, reqwest::Error>(Ok(bytes))
        };

        let bytes = match with_timeout(self.timeout, exchange).await {
            Err(_) => {
                warn!(
                    url,
                    timeout_ms = duration_to_millis(self.timeout),
                    "Device request timed out"
                );
                return Err(RelayError::Timeout(self.timeout));
            }
            Ok(Err(e)) => return Err(RelayError::from_reqwest(e, self.timeout)),
            Ok(Ok(result)) => result?,
        };

        self.check_length(bytes.len())?;

        serde_json::from_slice(&bytes).map_err(|e| RelayError::InvalidResponseJson(e.to_string()))
    }
}
