//! Structured-response model client.
//!
//! Wraps a [`ModelTransport`] with the full call policy: render the
//! prompt, retry transient failures with capped exponential backoff and
//! jitter, strip markdown fences from the completion, parse it into the
//! caller's type, and give the model exactly one chance to repair a
//! malformed response. The client holds no per-call state and is shared
//! behind an `Arc` by every stage.

use rand::Rng;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::ModelConfig;
use crate::errors::{ModelError, TransportError};

use super::template::PromptTemplate;
use super::transport::ModelTransport;

/// Retry policy for transient transport failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    pub attempts: u32,
    /// Base backoff delay.
    pub base_delay: Duration,
    /// Backoff delay cap.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Backoff for the given attempt (1-based), with full jitter.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);
        let jittered = rand::thread_rng().gen_range(0..=raw.as_millis() as u64);
        Duration::from_millis(jittered)
    }
}

/// Instruction appended to the prompt for the single repair attempt
/// after a malformed response.
const REPAIR_SUFFIX: &str = "\n\nYour previous response was not valid JSON. \
Respond again with ONLY the JSON value described above. No prose, no \
markdown fences, no explanation.";

/// Model client returning typed, validated responses.
pub struct StructuredClient {
    transport: Arc<dyn ModelTransport>,
    retry: RetryPolicy,
    max_tokens: u32,
}

impl StructuredClient {
    /// Builds a client over the transport using the model configuration.
    #[must_use]
    pub fn new(transport: Arc<dyn ModelTransport>, config: &ModelConfig) -> Self {
        Self {
            transport,
            retry: RetryPolicy {
                attempts: config.retry_attempts.max(1),
                base_delay: Duration::from_millis(config.retry_base_delay_ms),
                max_delay: Duration::from_millis(config.retry_max_delay_ms),
            },
            max_tokens: config.max_tokens,
        }
    }

    /// Renders the template and submits it, parsing the completion into
    /// `T`.
    pub async fn submit<T: DeserializeOwned>(
        &self,
        template: &PromptTemplate,
        vars: &HashMap<&str, String>,
    ) -> Result<T, ModelError> {
        let prompt = template.render(vars)?;
        self.submit_text(template.name(), &prompt).await
    }

    /// Submits a fully rendered prompt, parsing the completion into `T`.
    /// A malformed completion triggers exactly one repair call before
    /// the error surfaces.
    pub async fn submit_text<T: DeserializeOwned>(
        &self,
        label: &str,
        prompt: &str,
    ) -> Result<T, ModelError> {
        let completion = self.call_with_retry(label, prompt).await?;
        match Self::parse_completion(&completion) {
            Ok(value) => Ok(value),
            Err(first_detail) => {
                warn!(call = label, detail = %first_detail, "malformed response, attempting repair");
                let repair_prompt = format!("{prompt}{REPAIR_SUFFIX}");
                let repaired = self.call_with_retry(label, &repair_prompt).await?;
                Self::parse_completion(&repaired).map_err(|detail| {
                    ModelError::MalformedResponse {
                        detail: format!("{detail} (after repair retry; first: {first_detail})"),
                    }
                })
            }
        }
    }

    /// Rough token count for accounting; the transport reports no usage.
    fn estimate_tokens(chars: usize) -> u64 {
        (chars as u64).div_ceil(4)
    }

    async fn call_with_retry(&self, label: &str, prompt: &str) -> Result<String, ModelError> {
        let mut last = String::new();
        for attempt in 1..=self.retry.attempts {
            let started = Instant::now();
            match self.transport.generate(prompt, self.max_tokens).await {
                Ok(completion) => {
                    debug!(
                        call = label,
                        model = self.transport.model_id(),
                        attempt,
                        latency_ms = started.elapsed().as_millis() as u64,
                        input_tokens = Self::estimate_tokens(prompt.len()),
                        output_tokens = Self::estimate_tokens(completion.len()),
                        "model call succeeded"
                    );
                    return Ok(completion);
                }
                Err(TransportError::Fatal(detail)) => {
                    return Err(ModelError::Fatal { detail });
                }
                Err(TransportError::Transient(detail)) => {
                    warn!(
                        call = label,
                        attempt,
                        attempts = self.retry.attempts,
                        latency_ms = started.elapsed().as_millis() as u64,
                        input_tokens = Self::estimate_tokens(prompt.len()),
                        error = %detail,
                        "transient model failure"
                    );
                    last = detail;
                    if attempt < self.retry.attempts {
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }
        Err(ModelError::Transient {
            attempts: self.retry.attempts,
            last,
        })
    }

    /// Extracts and parses a JSON value from a completion that may be
    /// wrapped in markdown fences or surrounded by prose.
    fn parse_completion<T: DeserializeOwned>(completion: &str) -> Result<T, String> {
        let candidate = Self::extract_json(completion);
        serde_json::from_str(candidate).map_err(|e| e.to_string())
    }

    fn extract_json(completion: &str) -> &str {
        let trimmed = completion.trim();

        // Fenced block first: ```json ... ``` or bare ``` ... ```.
        if let Some(start) = trimmed.find("```") {
            let after = &trimmed[start + 3..];
            let after = after.strip_prefix("json").unwrap_or(after);
            if let Some(end) = after.find("```") {
                return after[..end].trim();
            }
        }

        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            return trimmed;
        }

        // Last resort: the widest object or array substring.
        for (open, close) in [('{', '}'), ('[', ']')] {
            if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
                if start < end {
                    return &trimmed[start..=end];
                }
            }
        }
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Verdict {
        present: bool,
        evidence: String,
    }

    /// Transport that replays a scripted list of outcomes.
    struct Scripted {
        responses: Mutex<Vec<Result<String, TransportError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<String, TransportError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(0),
            }
        }

        fn call_count(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl ModelTransport for Scripted {
        async fn generate(&self, _prompt: &str, _max: u32) -> Result<String, TransportError> {
            *self.calls.lock() += 1;
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                Err(TransportError::Transient("script exhausted".to_string()))
            } else {
                responses.remove(0)
            }
        }

        fn model_id(&self) -> &str {
            "scripted"
        }
    }

    fn client_with(transport: Arc<Scripted>) -> StructuredClient {
        let config = ModelConfig {
            retry_attempts: 3,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 2,
            ..ModelConfig::default()
        };
        StructuredClient::new(transport, &config)
    }

    #[tokio::test]
    async fn parses_fenced_json() {
        let transport = Arc::new(Scripted::new(vec![Ok(
            "```json\n{\"present\": true, \"evidence\": \"self-certified\"}\n```".to_string(),
        )]));
        let client = client_with(Arc::clone(&transport));

        let verdict: Verdict = client.submit_text("score", "judge this").await.unwrap();
        assert!(verdict.present);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let transport = Arc::new(Scripted::new(vec![
            Err(TransportError::Transient("429".to_string())),
            Err(TransportError::Transient("timeout".to_string())),
            Ok(r#"{"present": false, "evidence": "none"}"#.to_string()),
        ]));
        let client = client_with(Arc::clone(&transport));

        let verdict: Verdict = client.submit_text("score", "judge").await.unwrap();
        assert!(!verdict.present);
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn transient_exhaustion_stops_at_attempt_cap() {
        let transport = Arc::new(Scripted::new(vec![
            Err(TransportError::Transient("503".to_string())),
            Err(TransportError::Transient("503".to_string())),
            Err(TransportError::Transient("503".to_string())),
            Ok(r#"{"present": true, "evidence": "late"}"#.to_string()),
        ]));
        let client = client_with(Arc::clone(&transport));

        let err = client
            .submit_text::<Verdict>("score", "judge")
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Transient { attempts: 3, .. }));
        // The fourth (would-succeed) response is never requested.
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn fatal_failure_is_not_retried() {
        let transport = Arc::new(Scripted::new(vec![
            Err(TransportError::Fatal("401".to_string())),
            Ok(r#"{"present": true, "evidence": "x"}"#.to_string()),
        ]));
        let client = client_with(Arc::clone(&transport));

        let err = client
            .submit_text::<Verdict>("score", "judge")
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Fatal { .. }));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn malformed_response_gets_one_repair_attempt() {
        let transport = Arc::new(Scripted::new(vec![
            Ok("I think the answer is yes.".to_string()),
            Ok(r#"{"present": true, "evidence": "repaired"}"#.to_string()),
        ]));
        let client = client_with(Arc::clone(&transport));

        let verdict: Verdict = client.submit_text("score", "judge").await.unwrap();
        assert_eq!(verdict.evidence, "repaired");
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn double_malformed_surfaces_error() {
        let transport = Arc::new(Scripted::new(vec![
            Ok("not json".to_string()),
            Ok("still not json".to_string()),
            Ok(r#"{"present": true, "evidence": "x"}"#.to_string()),
        ]));
        let client = client_with(Arc::clone(&transport));

        let err = client
            .submit_text::<Verdict>("score", "judge")
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::MalformedResponse { .. }));
        // Exactly one repair call; no endless repair loop.
        assert_eq!(transport.call_count(), 2);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(StructuredClient::estimate_tokens(0), 0);
        assert_eq!(StructuredClient::estimate_tokens(4), 1);
        assert_eq!(StructuredClient::estimate_tokens(9), 3);
    }

    #[test]
    fn extract_json_finds_embedded_object() {
        let raw = "Here is the result: {\"present\": true, \"evidence\": \"x\"} as requested.";
        assert_eq!(
            StructuredClient::extract_json(raw),
            r#"{"present": true, "evidence": "x"}"#
        );
    }

    #[test]
    fn extract_json_handles_bare_fence() {
        let raw = "```\n[1, 2, 3]\n```";
        assert_eq!(StructuredClient::extract_json(raw), "[1, 2, 3]");
    }
}
