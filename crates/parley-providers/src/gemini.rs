use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde_json::{json, Value};

use parley_types::{ModelInfo, ProviderInfo};

use crate::retry::{is_auth_status, parse_retry_after, should_retry, RetryPolicy};
use crate::{truncate_for_error, Provider, ProviderError, GEMINI_PROVIDER_ID};

pub const DEFAULT_GEMINI_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";
const GEMINI_CONTEXT_WINDOW: usize = 1_048_576;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const KNOWN_MODELS: [&str; 2] = ["gemini-1.5-flash", "gemini-2.5-pro"];

/// Finish reasons that mean the candidate was withheld rather than empty.
const BLOCKING_FINISH_REASONS: [&str; 5] = [
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
];

pub struct GeminiProvider {
    base_url: String,
    api_key: String,
    default_model: String,
    retry: RetryPolicy,
    client: Client,
}

impl GeminiProvider {
    pub fn new(
        api_key: &str,
        url: Option<&str>,
        default_model: Option<&str>,
        retry: RetryPolicy,
    ) -> Self {
        let base_url = url
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(DEFAULT_GEMINI_URL)
            .trim_end_matches('/')
            .to_string();
        let default_model = match default_model.map(normalize_model) {
            Some(model) if is_valid_model_id(&model) => model,
            Some(model) if !model.is_empty() => {
                tracing::warn!(
                    model = %model,
                    "ignoring invalid Gemini default model; using {}",
                    DEFAULT_GEMINI_MODEL
                );
                DEFAULT_GEMINI_MODEL.to_string()
            }
            _ => DEFAULT_GEMINI_MODEL.to_string(),
        };
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url,
            api_key: api_key.trim().to_string(),
            default_model,
            retry,
            client,
        }
    }

    #[cfg(test)]
    fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", self.base_url, model)
    }

    async fn attempt(&self, url: &str, body: &Value) -> Attempt {
        let response = match self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                return Attempt::Retry {
                    error: ProviderError::Transport(err.to_string()),
                    retry_after_secs: None,
                }
            }
        };

        let status = response.status().as_u16();
        let retry_after_secs = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let text = match response.text().await {
            Ok(text) => text,
            Err(err) => {
                return Attempt::Retry {
                    error: ProviderError::Transport(err.to_string()),
                    retry_after_secs,
                }
            }
        };

        if (200..300).contains(&status) {
            let parsed = serde_json::from_str::<Value>(&text)
                .map_err(|err| ProviderError::InvalidResponse(err.to_string()))
                .and_then(|value| extract_reply(&value));
            return Attempt::Done(parsed);
        }

        let message = extract_gemini_error(&text).unwrap_or_else(|| {
            let preview = truncate_for_error(text.trim(), 500);
            if preview.is_empty() {
                format!("request failed with status {status}")
            } else {
                preview
            }
        });
        if is_auth_status(status) {
            return Attempt::Done(Err(ProviderError::Auth { status, message }));
        }
        let error = if status == 429 {
            ProviderError::RateLimited {
                message,
                retry_after_secs,
            }
        } else {
            ProviderError::Api { status, message }
        };
        if should_retry(status, &text) {
            Attempt::Retry {
                error,
                retry_after_secs,
            }
        } else {
            Attempt::Done(Err(error))
        }
    }
}

enum Attempt {
    Done(Result<String, ProviderError>),
    Retry {
        error: ProviderError,
        retry_after_secs: Option<u64>,
    },
}

#[async_trait]
impl Provider for GeminiProvider {
    fn info(&self) -> ProviderInfo {
        let mut model_ids = vec![self.default_model.clone()];
        for known in KNOWN_MODELS {
            if !model_ids.iter().any(|m| m == known) {
                model_ids.push(known.to_string());
            }
        }
        ProviderInfo {
            id: GEMINI_PROVIDER_ID.to_string(),
            name: "Google Gemini".to_string(),
            models: model_ids
                .into_iter()
                .map(|id| ModelInfo {
                    display_name: id.clone(),
                    id,
                    provider_id: GEMINI_PROVIDER_ID.to_string(),
                    context_window: GEMINI_CONTEXT_WINDOW,
                })
                .collect(),
        }
    }

    async fn complete(
        &self,
        prompt: &str,
        model_override: Option<&str>,
    ) -> Result<String, ProviderError> {
        let model = match model_override.map(normalize_model) {
            Some(model) if model.is_empty() => self.default_model.clone(),
            Some(model) if !is_valid_model_id(&model) => {
                return Err(ProviderError::InvalidModel(model));
            }
            Some(model) => model,
            None => self.default_model.clone(),
        };
        let url = self.endpoint(&model);
        let body = json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
        });

        let mut last_error = None;
        let mut retry_after_secs = None;
        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                let delay = self.retry.delay_for(attempt - 1, retry_after_secs);
                tracing::warn!(
                    model = %model,
                    attempt,
                    max_retries = self.retry.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error.as_ref().map(ToString::to_string).unwrap_or_default(),
                    "gemini request failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            match self.attempt(&url, &body).await {
                Attempt::Done(result) => return result,
                Attempt::Retry {
                    error,
                    retry_after_secs: hint,
                } => {
                    last_error = Some(error);
                    retry_after_secs = hint;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::Transport("no request attempted".to_string())))
    }
}

/// Accepts both `gemini-1.5-flash` and the API's own `models/gemini-1.5-flash`.
fn normalize_model(input: &str) -> String {
    let trimmed = input.trim();
    trimmed
        .strip_prefix("models/")
        .unwrap_or(trimmed)
        .to_string()
}

/// Model ids become a URL path segment, so only `[A-Za-z0-9._-]` is allowed
/// and a segment made only of dots is rejected.
pub fn is_valid_model_id(model: &str) -> bool {
    !model.is_empty()
        && model.len() <= 128
        && model
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        && !model.chars().all(|c| c == '.')
}

pub(crate) fn extract_reply(value: &Value) -> Result<String, ProviderError> {
    if let Some(reason) = value
        .pointer("/promptFeedback/blockReason")
        .and_then(|v| v.as_str())
    {
        return Err(ProviderError::Blocked(reason.to_string()));
    }

    let candidate = value.get("candidates").and_then(|v| v.get(0));
    let text = candidate
        .and_then(|c| c.pointer("/content/parts"))
        .and_then(|v| v.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(|v| v.as_str()))
                .collect::<String>()
        })
        .unwrap_or_default();
    if !text.trim().is_empty() {
        return Ok(text);
    }

    let finish_reason = candidate
        .and_then(|c| c.get("finishReason"))
        .and_then(|v| v.as_str());
    match finish_reason {
        Some(reason) if BLOCKING_FINISH_REASONS.contains(&reason) => {
            Err(ProviderError::Blocked(reason.to_string()))
        }
        Some(reason) => Err(ProviderError::EmptyResponse(reason.to_string())),
        None => Err(ProviderError::EmptyResponse("NO_CANDIDATES".to_string())),
    }
}

fn extract_gemini_error(body: &str) -> Option<String> {
    let value = serde_json::from_str::<Value>(body).ok()?;
    let error = value.get("error")?;
    let message = error.get("message").and_then(|v| v.as_str())?;
    match error.get("status").and_then(|v| v.as_str()) {
        Some(status) => Some(format!("{status}: {message}")),
        None => Some(message.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::http::{HeaderMap, StatusCode, Uri};
    use axum::Router;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    fn reply_body(text: &str) -> String {
        json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": text}]},
                "finishReason": "STOP"
            }]
        })
        .to_string()
    }

    struct MockGemini {
        base_url: String,
        hits: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<(String, Option<String>)>>>,
    }

    /// Serves `responses` in order, repeating the last one once exhausted.
    async fn spawn_mock(responses: Vec<(u16, String)>) -> MockGemini {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let responses = Arc::new(responses);
        let app = {
            let hits = hits.clone();
            let seen = seen.clone();
            Router::new().fallback(move |uri: Uri, headers: HeaderMap| {
                let hits = hits.clone();
                let seen = seen.clone();
                let responses = responses.clone();
                async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst);
                    let key = headers
                        .get("x-goog-api-key")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string());
                    seen.lock().expect("seen lock").push((uri.path().to_string(), key));
                    let (status, body) = responses[n.min(responses.len() - 1)].clone();
                    (
                        StatusCode::from_u16(status).expect("status"),
                        [("content-type", "application/json")],
                        body,
                    )
                }
            })
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock");
        let addr = listener.local_addr().expect("mock addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        MockGemini {
            base_url: format!("http://{addr}/v1beta"),
            hits,
            seen,
        }
    }

    #[test]
    fn extracts_concatenated_parts() {
        let value = json!({
            "candidates": [{"content": {"parts": [{"text": "Hello, "}, {"text": "world"}]}}]
        });
        assert_eq!(extract_reply(&value).expect("text"), "Hello, world");
    }

    #[test]
    fn blocked_prompt_is_an_error() {
        let value = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        let err = extract_reply(&value).expect_err("blocked");
        assert!(matches!(err, ProviderError::Blocked(ref r) if r == "SAFETY"));

        let withheld = json!({"candidates": [{"finishReason": "RECITATION"}]});
        assert!(matches!(
            extract_reply(&withheld),
            Err(ProviderError::Blocked(_))
        ));
    }

    #[test]
    fn empty_candidates_report_finish_reason() {
        let value = json!({"candidates": [{"content": {"parts": []}, "finishReason": "MAX_TOKENS"}]});
        let err = extract_reply(&value).expect_err("empty");
        assert!(err.to_string().contains("MAX_TOKENS"));
        let nothing = json!({});
        assert!(extract_reply(&nothing)
            .expect_err("empty")
            .to_string()
            .contains("NO_CANDIDATES"));
    }

    #[test]
    fn api_error_message_includes_status() {
        let body = r#"{"error":{"code":400,"message":"API key not valid.","status":"INVALID_ARGUMENT"}}"#;
        assert_eq!(
            extract_gemini_error(body).as_deref(),
            Some("INVALID_ARGUMENT: API key not valid.")
        );
        assert!(extract_gemini_error("<html>").is_none());
    }

    #[test]
    fn model_names_lose_the_models_prefix() {
        assert_eq!(normalize_model(" models/gemini-2.5-pro "), "gemini-2.5-pro");
        let provider = GeminiProvider::new("k", None, Some("models/gemini-2.5-pro"), fast_retry());
        assert_eq!(
            provider.endpoint("gemini-2.5-pro"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:generateContent"
        );
        let ids = provider
            .info()
            .models
            .into_iter()
            .map(|m| m.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["gemini-2.5-pro", "gemini-1.5-flash"]);
    }

    #[test]
    fn model_ids_are_single_safe_path_segments() {
        assert!(is_valid_model_id("gemini-1.5-flash"));
        assert!(is_valid_model_id("gemini-2.5-pro_exp.01"));
        for bad in ["", "..", "../cachedContents?x=", "a/b", "flash:streamGenerateContent", "x#y", "gemini flash"] {
            assert!(!is_valid_model_id(bad), "{bad:?} should be rejected");
        }
        let provider = GeminiProvider::new("k", None, Some("../files?"), fast_retry());
        assert_eq!(provider.default_model, DEFAULT_GEMINI_MODEL);
    }

    #[tokio::test]
    async fn path_escaping_model_override_never_reaches_the_network() {
        let mock = spawn_mock(vec![(200, reply_body("should not happen"))]).await;
        let provider = GeminiProvider::new("k", Some(&mock.base_url), None, fast_retry());
        let err = provider
            .complete("hello", Some("../cachedContents?x="))
            .await
            .expect_err("rejected");
        assert!(matches!(err, ProviderError::InvalidModel(ref m) if m == "../cachedContents?x="));
        assert_eq!(mock.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hung_upstream_times_out_through_the_retry_path() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(socket);
            }
        });
        let client = Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("client");
        let retry = RetryPolicy {
            max_retries: 1,
            initial_delay_ms: 1,
            max_delay_ms: 5,
        };
        let provider = GeminiProvider::new("k", Some(&format!("http://{addr}/v1beta")), None, retry)
            .with_client(client);

        let err = provider.complete("hello", None).await.expect_err("timeout");

        assert!(matches!(err, ProviderError::Transport(_)));
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let overloaded = json!({"error": {"code": 503, "message": "The model is overloaded.", "status": "UNAVAILABLE"}}).to_string();
        let mock = spawn_mock(vec![
            (503, overloaded.clone()),
            (503, overloaded),
            (200, reply_body("finally")),
        ])
        .await;
        let provider = GeminiProvider::new("test-key", Some(&mock.base_url), None, fast_retry());

        let reply = provider.complete("User: hi\nAssistant:", None).await.expect("reply");

        assert_eq!(reply, "finally");
        assert_eq!(mock.hits.load(Ordering::SeqCst), 3);
        let seen = mock.seen.lock().expect("seen lock");
        assert_eq!(seen[0].0, "/v1beta/models/gemini-1.5-flash:generateContent");
        assert_eq!(seen[0].1.as_deref(), Some("test-key"));
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let quota = json!({"error": {"code": 429, "message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED"}}).to_string();
        let mock = spawn_mock(vec![(429, quota)]).await;
        let provider = GeminiProvider::new("test-key", Some(&mock.base_url), None, fast_retry());

        let err = provider.complete("hello", None).await.expect_err("exhausted");

        assert!(matches!(err, ProviderError::RateLimited { .. }));
        assert_eq!(mock.hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn auth_and_bad_request_errors_are_not_retried() {
        let denied = json!({"error": {"code": 403, "message": "Permission denied", "status": "PERMISSION_DENIED"}}).to_string();
        let mock = spawn_mock(vec![(403, denied)]).await;
        let provider = GeminiProvider::new("bad-key", Some(&mock.base_url), None, fast_retry());
        let err = provider.complete("hello", None).await.expect_err("denied");
        assert!(matches!(err, ProviderError::Auth { status: 403, .. }));
        assert_eq!(mock.hits.load(Ordering::SeqCst), 1);

        let invalid = json!({"error": {"code": 400, "message": "Please try again with a shorter prompt", "status": "INVALID_ARGUMENT"}}).to_string();
        let mock = spawn_mock(vec![(400, invalid)]).await;
        let provider = GeminiProvider::new("key", Some(&mock.base_url), None, fast_retry());
        let err = provider.complete("hello", None).await.expect_err("invalid");
        assert!(matches!(err, ProviderError::Api { status: 400, .. }));
        assert_eq!(mock.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn model_override_changes_the_endpoint() {
        let mock = spawn_mock(vec![(200, reply_body("pro answer"))]).await;
        let provider = GeminiProvider::new("k", Some(&mock.base_url), None, fast_retry());
        let reply = provider
            .complete("hello", Some("models/gemini-2.5-pro"))
            .await
            .expect("reply");
        assert_eq!(reply, "pro answer");
        let seen = mock.seen.lock().expect("seen lock");
        assert_eq!(seen[0].0, "/v1beta/models/gemini-2.5-pro:generateContent");
    }
}
