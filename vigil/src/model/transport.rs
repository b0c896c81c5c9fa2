//! Raw model transports.
//!
//! A transport turns one prompt into one completion and classifies
//! failures as transient or fatal. All retry, parsing, and repair logic
//! lives above in [`crate::model::StructuredClient`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ModelConfig;
use crate::errors::TransportError;

/// One-shot prompt-to-completion transport.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    /// Generates a completion for the prompt.
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String, TransportError>;

    /// Model identifier, for logging.
    fn model_id(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// HTTP transport speaking the local-inference generate protocol.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    model_id: String,
}

impl HttpTransport {
    /// Builds a transport from the model configuration.
    pub fn new(config: &ModelConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| TransportError::Fatal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model_id: config.model_id.clone(),
        })
    }

    fn classify_status(status: reqwest::StatusCode, body: &str) -> TransportError {
        let detail = format!("status {status}: {body}");
        if status.is_server_error()
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            TransportError::Transient(detail)
        } else {
            TransportError::Fatal(detail)
        }
    }
}

#[async_trait]
impl ModelTransport for HttpTransport {
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String, TransportError> {
        let request = GenerateRequest {
            model: &self.model_id,
            prompt,
            stream: false,
            options: GenerateOptions {
                num_predict: max_tokens,
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                // Connection and timeout failures are worth retrying.
                if e.is_timeout() || e.is_connect() {
                    TransportError::Transient(e.to_string())
                } else {
                    TransportError::Fatal(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Transient(format!("response body: {e}")))?;
        Ok(parsed.response)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttles_are_transient() {
        let transient = HttpTransport::classify_status(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            "slow down",
        );
        assert!(matches!(transient, TransportError::Transient(_)));

        let transient = HttpTransport::classify_status(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            "oops",
        );
        assert!(matches!(transient, TransportError::Transient(_)));
    }

    #[test]
    fn client_errors_are_fatal() {
        let fatal = HttpTransport::classify_status(reqwest::StatusCode::UNAUTHORIZED, "no key");
        assert!(matches!(fatal, TransportError::Fatal(_)));
    }
}
