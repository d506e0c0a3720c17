use super::budget::{output_budget, EXTENDED_OUTPUT_HEADER};
use super::models::{ApiErrorBody, ChatRequest, ChatResponse, Message};
use super::parse::interpret_response;
use super::throttle::{self, interval_for_rpm};
use patchmend_adapters::OracleSettings;
use patchmend_core::{CandidateFix, OracleError, RepairOracle, RepairRequest};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Maximum length for error content in error messages
const MAX_ERROR_CONTENT_LEN: usize = 200;

pub(crate) const INITIAL_BACKOFF_MS: u64 = 2000; // 2 seconds
pub(crate) const BACKOFF_MULTIPLIER: u64 = 2; // Exponential backoff

const REFERER: &str = "patchmend";
const TITLE: &str = "patchmend";

/// Sanitize API response content for error messages to prevent credential leakage.
pub(crate) fn sanitize_api_response(content: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "api_key",
        "apikey",
        "secret",
        "password",
        "credential",
        "bearer",
        "sk-", // OpenAI/OpenRouter key prefix
    ];

    let truncated = truncate_str(content, MAX_ERROR_CONTENT_LEN);

    let lower = truncated.to_lowercase();
    for pattern in SECRET_PATTERNS {
        if lower.contains(pattern) {
            return "(response details redacted - may contain sensitive data)".to_string();
        }
    }

    truncated.to_string()
}

/// Truncate a string for display (Unicode-safe)
pub(crate) fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}

/// Extract a retry-after hint ("retry after 12 seconds") from an error body.
pub(crate) fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    let pos = text_lower.find("retry")?;
    for word in text_lower[pos..].split_whitespace().skip(1).take(5) {
        if let Ok(secs) = word.trim_matches(|c: char| !c.is_numeric()).parse::<u64>() {
            if secs > 0 && secs < 300 {
                return Some(secs);
            }
        }
    }
    None
}

/// `base`, doubled for every retry after the first.
pub(crate) fn backoff_delay(base: Duration, retry_count: u32) -> Duration {
    let factor = BACKOFF_MULTIPLIER.saturating_pow(retry_count.saturating_sub(1));
    base.saturating_mul(u32::try_from(factor).unwrap_or(u32::MAX))
}

fn is_retryable_network_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn is_quota_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit") || lower.contains("quota") || lower.contains("too many requests")
}

fn map_transport_error(err: reqwest::Error) -> OracleError {
    if err.is_timeout() {
        OracleError::Transport("request timed out".to_string())
    } else if err.is_connect() {
        OracleError::Transport("could not connect to the oracle endpoint".to_string())
    } else {
        OracleError::Transport(sanitize_api_response(&err.to_string()))
    }
}

/// Create a configured HTTP client for oracle requests
pub(crate) fn create_http_client(timeout_secs: u64) -> Result<reqwest::Client, OracleError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| OracleError::Config(format!("failed to create HTTP client: {}", e)))
}

/// Why one HTTP round trip failed, before retry policy is applied.
enum Failure {
    Quota(String),
    Transient(String),
    Fatal(OracleError),
}

/// Chat-completions client for OpenRouter and compatible endpoints.
pub struct OracleClient {
    http: reqwest::Client,
    api_key: String,
    settings: OracleSettings,
    backoff_base: Duration,
}

impl OracleClient {
    pub fn new(settings: OracleSettings, api_key: impl Into<String>) -> Result<Self, OracleError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(OracleError::Config("no API key configured".to_string()));
        }
        Ok(Self {
            http: create_http_client(settings.request_timeout_secs)?,
            api_key,
            settings,
            backoff_base: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    /// Delay before the first retry; later retries double it.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    async fn complete(&self, request: &RepairRequest) -> Result<CandidateFix, OracleError> {
        let budget = output_budget(
            &self.settings,
            request.expected_files.len(),
            request.escalation,
        );
        let body = ChatRequest {
            model: self.settings.model.clone(),
            messages: vec![
                Message::system(request.system.clone()),
                Message::user(request.user.clone()),
            ],
            max_tokens: budget.max_tokens,
            temperature: 0.0,
            stream: false,
        };

        tracing::info!(
            model = %self.settings.model,
            files = request.expected_files.len(),
            max_tokens = budget.max_tokens,
            extended = budget.extended,
            escalation = request.escalation,
            "requesting patch repair"
        );

        let text = self.send_with_retry(&body, budget.extended).await?;
        let response: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            OracleError::Parse(format!(
                "unexpected response shape: {} ({})",
                e,
                sanitize_api_response(&text)
            ))
        })?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| OracleError::Parse("response carried no choices".to_string()))?;
        let content = match (choice.message.content, choice.message.refusal) {
            (Some(content), _) if !content.trim().is_empty() => content,
            (_, Some(refusal)) => {
                return Err(OracleError::Parse(format!(
                    "model refused: {}",
                    truncate_str(&refusal, MAX_ERROR_CONTENT_LEN)
                )))
            }
            _ => return Err(OracleError::Parse("empty response".to_string())),
        };

        tracing::debug!(
            finish_reason = choice.finish_reason.as_deref().unwrap_or("none"),
            completion_tokens = response.usage.and_then(|u| u.completion_tokens),
            "oracle responded"
        );

        interpret_response(
            &content,
            choice.finish_reason.as_deref(),
            response.usage,
            budget.max_tokens,
            &request.expected_files,
        )
    }

    /// Send a request with automatic retry on transient failures.
    ///
    /// Handles:
    /// - Network errors (timeout, connection failures)
    /// - Rate limits (429) and quota errors
    /// - Server errors (5xx)
    /// - OpenRouter's 200-with-error responses
    async fn send_with_retry(
        &self,
        body: &ChatRequest,
        extended: bool,
    ) -> Result<String, OracleError> {
        let max_retries = self.settings.max_quota_retries;
        let interval = interval_for_rpm(self.settings.requests_per_minute);
        let mut retry_count = 0u32;

        loop {
            throttle::global().wait(interval).await;

            let failure = match self.send_once(body, extended).await {
                Ok(text) => return Ok(text),
                Err(Failure::Fatal(err)) => return Err(err),
                Err(failure) => failure,
            };

            if retry_count >= max_retries {
                return Err(match failure {
                    Failure::Quota(message) => OracleError::Quota {
                        attempts: retry_count + 1,
                        message,
                    },
                    Failure::Transient(message) => OracleError::Transport(message),
                    Failure::Fatal(err) => err,
                });
            }

            retry_count += 1;
            let wait = match &failure {
                Failure::Quota(message) => parse_retry_after(message)
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| backoff_delay(self.backoff_base, retry_count)),
                _ => backoff_delay(self.backoff_base, retry_count),
            };
            tracing::warn!(
                retry = retry_count,
                max_retries,
                wait_ms = wait.as_millis() as u64,
                quota = matches!(failure, Failure::Quota(_)),
                "oracle request failed, backing off"
            );
            tokio::time::sleep(wait).await;
        }
    }

    async fn send_once(&self, body: &ChatRequest, extended: bool) -> Result<String, Failure> {
        let mut builder = self
            .http
            .post(&self.settings.endpoint)
            .header("Content-Type", "application/json")
            .header("HTTP-Referer", REFERER)
            .header("X-Title", TITLE)
            .header("Authorization", format!("Bearer {}", self.api_key));
        if extended {
            builder = builder.header(EXTENDED_OUTPUT_HEADER.0, EXTENDED_OUTPUT_HEADER.1);
        }

        let response = builder.json(body).send().await.map_err(|err| {
            if is_retryable_network_error(&err) {
                Failure::Transient(map_transport_error(err).to_string())
            } else {
                Failure::Fatal(map_transport_error(err))
            }
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|err| {
            if is_retryable_network_error(&err) {
                Failure::Transient(map_transport_error(err).to_string())
            } else {
                Failure::Fatal(map_transport_error(err))
            }
        })?;

        if status.is_success() {
            // OpenRouter sometimes returns errors with 200 status (upstream provider issues)
            if let Ok(err_resp) = serde_json::from_str::<ApiErrorBody>(&text) {
                return Err(classify_error(err_resp.error.code, &err_resp.error.message));
            }
            return Ok(text);
        }

        let message = serde_json::from_str::<ApiErrorBody>(&text)
            .map(|body| body.error.message)
            .unwrap_or(text);
        Err(classify_error(Some(i32::from(status.as_u16())), &message))
    }
}

fn classify_error(code: Option<i32>, message: &str) -> Failure {
    let sanitized = sanitize_api_response(message);
    match code {
        Some(429) => Failure::Quota(sanitized),
        Some(401) | Some(403) => Failure::Fatal(OracleError::Config(format!(
            "endpoint rejected the credentials: {}",
            sanitized
        ))),
        Some(404) => Failure::Fatal(OracleError::Config(format!(
            "endpoint or model not found: {}",
            sanitized
        ))),
        Some(c) if c >= 500 => Failure::Transient(format!("server error {}: {}", c, sanitized)),
        _ if is_quota_message(message) => Failure::Quota(sanitized),
        // Untyped 200-with-error bodies are upstream hiccups.
        None => Failure::Transient(sanitized),
        Some(c) => Failure::Fatal(OracleError::Transport(format!(
            "API error {}: {}",
            c, sanitized
        ))),
    }
}

impl RepairOracle for OracleClient {
    fn propose<'a>(
        &'a self,
        request: &'a RepairRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CandidateFix, OracleError>> + Send + 'a>> {
        Box::pin(self.complete(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(INITIAL_BACKOFF_MS);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_retry_after() {
        let hinted = "Rate limited, retry after 12 seconds";
        assert_eq!(parse_retry_after(hinted), Some(12));
        assert_eq!(parse_retry_after("please retry in 900s"), None);
        assert_eq!(parse_retry_after("rate limited"), None);
    }

    #[test]
    fn test_sanitize_redacts_secrets_and_truncates() {
        assert_eq!(
            sanitize_api_response("invalid key sk-or-123"),
            "(response details redacted - may contain sensitive data)"
        );
        let long = "x".repeat(500);
        assert_eq!(sanitize_api_response(&long).len(), MAX_ERROR_CONTENT_LEN);
    }

    #[test]
    fn test_truncate_str_is_char_safe() {
        assert_eq!(truncate_str("héllo", 2), "hé");
        assert_eq!(truncate_str("hi", 10), "hi");
    }

    #[test]
    fn test_classify_error() {
        assert!(matches!(
            classify_error(Some(429), "slow down"),
            Failure::Quota(_)
        ));
        assert!(matches!(
            classify_error(Some(401), "bad key"),
            Failure::Fatal(OracleError::Config(_))
        ));
        assert!(matches!(
            classify_error(Some(503), "down"),
            Failure::Transient(_)
        ));
        assert!(matches!(
            classify_error(Some(400), "quota exceeded for model"),
            Failure::Quota(_)
        ));
        assert!(matches!(
            classify_error(Some(400), "bad request"),
            Failure::Fatal(OracleError::Transport(_))
        ));
        assert!(matches!(
            classify_error(None, "upstream error"),
            Failure::Transient(_)
        ));
    }

    #[test]
    fn test_client_requires_api_key() {
        let err = OracleClient::new(OracleSettings::default(), "  ")
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }

    // ═══════════════════════════════════════════════════════════════════════
    // HTTP round trips against a local mock endpoint
    // ═══════════════════════════════════════════════════════════════════════

    use mockito::{Matcher, Server, ServerGuard};

    const PATH: &str = "/api/v1/chat/completions";

    fn settings_for(server: &ServerGuard, max_quota_retries: u32) -> OracleSettings {
        OracleSettings {
            endpoint: format!("{}{}", server.url(), PATH),
            model: "test/model".to_string(),
            requests_per_minute: 60_000,
            max_quota_retries,
            request_timeout_secs: 10,
            ..OracleSettings::default()
        }
    }

    fn client_for(settings: OracleSettings) -> OracleClient {
        OracleClient {
            http: reqwest::Client::builder().no_proxy().build().unwrap(),
            api_key: "test-key".to_string(),
            settings,
            backoff_base: Duration::from_millis(1),
        }
    }

    fn request_for(files: &[&str]) -> RepairRequest {
        RepairRequest {
            system: "system".to_string(),
            user: "user".to_string(),
            expected_files: files.iter().map(|f| f.to_string()).collect(),
            escalation: 1,
        }
    }

    fn diff_for(files: &[&str]) -> String {
        files
            .iter()
            .map(|f| format!("--- a/{f}\n+++ b/{f}\n@@ -1 +1 @@\n-old\n+new\n"))
            .collect()
    }

    fn completion_body(files: &[&str]) -> String {
        let content = format!("Renamed upstream.\n\n```diff\n{}```\n", diff_for(files));
        serde_json::json!({
            "choices": [{
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 900, "completion_tokens": 120}
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_completion_becomes_candidate() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", PATH)
            .match_header("authorization", "Bearer test-key")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "model": "test/model",
                "temperature": 0.0,
                "stream": false
            })))
            .with_status(200)
            .with_body(completion_body(&["src/a.c"]))
            .expect(1)
            .create_async()
            .await;

        let client = client_for(settings_for(&server, 2));
        let fix = client.propose(&request_for(&["src/a.c"])).await.unwrap();

        mock.assert_async().await;
        assert_eq!(fix.patch.file_paths(), vec!["src/a.c"]);
        assert_eq!(fix.rationale.as_deref(), Some("Renamed upstream."));
        let usage = fix.usage.unwrap();
        assert_eq!(usage.completion_tokens, Some(120));
    }

    #[tokio::test]
    async fn test_quota_retries_are_bounded() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", PATH)
            .with_status(429)
            .with_body(r#"{"error":{"message":"slow down","code":429}}"#)
            .expect(3)
            .create_async()
            .await;

        let client = client_for(settings_for(&server, 2));
        let request = request_for(&["src/a.c"]);
        let err = client.propose(&request).await.unwrap_err();

        mock.assert_async().await;
        match err {
            OracleError::Quota { attempts, message } => {
                assert_eq!(attempts, 3);
                assert!(message.contains("slow down"));
            }
            other => panic!("expected quota error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_quota_then_success() {
        let mut server = Server::new_async().await;
        let limited = server
            .mock("POST", PATH)
            .with_status(429)
            .with_body("rate limit exceeded")
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("POST", PATH)
            .with_status(200)
            .with_body(completion_body(&["src/a.c"]))
            .expect(1)
            .create_async()
            .await;

        let client = client_for(settings_for(&server, 2));
        let fix = client.propose(&request_for(&["src/a.c"])).await.unwrap();

        limited.assert_async().await;
        ok.assert_async().await;
        assert_eq!(fix.patch.file_paths(), vec!["src/a.c"]);
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_not_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", PATH)
            .with_status(401)
            .with_body(r#"{"error":{"message":"No auth provided","code":401}}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(settings_for(&server, 4));
        let request = request_for(&["src/a.c"]);
        let err = client.propose(&request).await.unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, OracleError::Config(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_error_body_with_ok_status_is_retried() {
        let mut server = Server::new_async().await;
        let upstream = server
            .mock("POST", PATH)
            .with_status(200)
            .with_body(r#"{"error":{"message":"upstream overloaded","code":502}}"#)
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("POST", PATH)
            .with_status(200)
            .with_body(completion_body(&["src/a.c"]))
            .expect(1)
            .create_async()
            .await;

        let client = client_for(settings_for(&server, 2));
        client.propose(&request_for(&["src/a.c"])).await.unwrap();

        upstream.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_body_with_ok_status_fails_once_retries_run_out() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", PATH)
            .with_status(200)
            .with_body(r#"{"error":{"message":"upstream overloaded","code":502}}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(settings_for(&server, 0));
        let request = request_for(&["src/a.c"]);
        let err = client.propose(&request).await.unwrap_err();

        mock.assert_async().await;
        match err {
            OracleError::Transport(message) => assert!(message.contains("upstream overloaded")),
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_extended_header_only_for_large_budgets() {
        let small = ["src/a.c"];
        let large = ["a.c", "b.c", "c.c", "d.c", "e.c", "f.c", "g.c"];

        let mut server = Server::new_async().await;
        let standard = server
            .mock("POST", PATH)
            .match_header(EXTENDED_OUTPUT_HEADER.0, Matcher::Missing)
            .with_status(200)
            .with_body(completion_body(&small))
            .expect(1)
            .create_async()
            .await;
        let client = client_for(settings_for(&server, 0));
        assert!(!output_budget(&client.settings, small.len(), 1).extended);
        client.propose(&request_for(&small)).await.unwrap();
        standard.assert_async().await;

        let mut server = Server::new_async().await;
        let extended = server
            .mock("POST", PATH)
            .match_header(EXTENDED_OUTPUT_HEADER.0, EXTENDED_OUTPUT_HEADER.1)
            .with_status(200)
            .with_body(completion_body(&large))
            .expect(1)
            .create_async()
            .await;
        let client = client_for(settings_for(&server, 0));
        assert!(output_budget(&client.settings, large.len(), 1).extended);
        let fix = client.propose(&request_for(&large)).await.unwrap();
        extended.assert_async().await;
        assert_eq!(fix.patch.file_paths().len(), large.len());
    }
}
