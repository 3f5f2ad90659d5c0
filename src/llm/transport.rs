// ABOUTME: HTTP plumbing shared by provider adapters - header merging, abortable
// ABOUTME: request sending, and classification of non-2xx responses.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use serde::Deserialize;

use super::cancel::AbortSignal;
use super::options::StreamOptions;
use super::Model;
use crate::error::LlmError;

static RETRY_HINT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)retry after (\d+) seconds?").ok());

const UNKNOWN_RETRY: &str = "unknown";

/// Build request headers: model defaults, then per-request overrides, then
/// the bearer token when one is supplied.
pub(crate) fn merge_headers(
    model: &Model,
    options: &StreamOptions,
    token: &str,
) -> Result<HeaderMap, LlmError> {
    let mut merged: HashMap<&str, &str> = HashMap::new();
    for (name, value) in model.headers.iter().chain(options.headers.iter()) {
        merged.insert(name, value);
    }

    let mut headers = HeaderMap::new();
    for (name, value) in merged {
        let name = HeaderName::try_from(name)
            .map_err(|e| LlmError::Configuration(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::try_from(value)
            .map_err(|e| LlmError::Configuration(format!("invalid value for header '{name}': {e}")))?;
        headers.insert(name, value);
    }

    if !token.is_empty() {
        let value = HeaderValue::try_from(format!("Bearer {token}"))
            .map_err(|e| LlmError::Configuration(format!("invalid bearer token: {e}")))?;
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

/// Send a request, giving up as soon as `signal` fires.
pub(crate) async fn send(
    request: reqwest::RequestBuilder,
    signal: &AbortSignal,
) -> Result<reqwest::Response, LlmError> {
    tokio::select! {
        biased;
        () = signal.aborted() => Err(LlmError::Aborted),
        response = request.send() => Ok(response?),
    }
}

/// Pass 2xx responses through; turn anything else into an error.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();

    Err(classify_failure(
        status.as_u16(),
        status.canonical_reason().unwrap_or_default(),
        retry_after.as_deref(),
        &body,
    ))
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

/// Classify a failed response from its status, `Retry-After` header, and body.
pub(crate) fn classify_failure(
    status: u16,
    status_text: &str,
    retry_after_header: Option<&str>,
    body: &str,
) -> LlmError {
    let body = error_detail(body);

    if status == 429 {
        let retry_after = retry_after_header
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(with_seconds_suffix)
            .or_else(|| retry_hint(&body))
            .unwrap_or_else(|| UNKNOWN_RETRY.to_string());
        return LlmError::RateLimited { retry_after, body };
    }

    LlmError::Http {
        status,
        status_text: status_text.to_string(),
        body,
    }
}

/// The provider's structured error message when the body has one, the raw
/// text otherwise.
fn error_detail(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope {
            error: ErrorBody {
                message,
                code: Some(code),
            },
        }) => {
            let code = code.as_str().map(str::to_string).unwrap_or_else(|| code.to_string());
            format!("{code}: {message}")
        }
        Ok(envelope) => envelope.error.message,
        Err(_) => body.trim().to_string(),
    }
}

fn retry_hint(text: &str) -> Option<String> {
    let captures = RETRY_HINT.as_ref()?.captures(text)?;
    captures.get(1).map(|m| format!("{}s", m.as_str()))
}

fn with_seconds_suffix(value: &str) -> String {
    if value.chars().all(|c| c.is_ascii_digit()) {
        format!("{value}s")
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Api;

    #[test]
    fn test_rate_limit_prefers_header() {
        let err = classify_failure(
            429,
            "Too Many Requests",
            Some("17"),
            r#"{"error":{"message":"Please retry after 30 seconds."}}"#,
        );
        match err {
            LlmError::RateLimited { retry_after, body } => {
                assert_eq!(retry_after, "17s");
                assert_eq!(body, "Please retry after 30 seconds.");
            }
            other => panic!("Expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_rate_limit_hint_from_message() {
        let err = classify_failure(
            429,
            "Too Many Requests",
            None,
            r#"{"error":{"code":"429","message":"Rate limit reached. Please Retry After 1 second."}}"#,
        );
        assert!(err.is_rate_limit());
        match err {
            LlmError::RateLimited { retry_after, body } => {
                assert_eq!(retry_after, "1s");
                assert!(body.starts_with("429: Rate limit reached"));
            }
            other => panic!("Expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_rate_limit_unknown_hint() {
        let err = classify_failure(429, "Too Many Requests", Some("  "), "slow down");
        match &err {
            LlmError::RateLimited { retry_after, .. } => assert_eq!(retry_after, "unknown"),
            other => panic!("Expected RateLimited, got {:?}", other),
        }
        assert_eq!(err.status(), Some(429));
        assert!(err.to_string().contains("retry after: unknown"));
    }

    #[test]
    fn test_http_date_retry_after_kept_verbatim() {
        let err = classify_failure(429, "", Some("Wed, 21 Oct 2026 07:28:00 GMT"), "");
        match err {
            LlmError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, "Wed, 21 Oct 2026 07:28:00 GMT")
            }
            other => panic!("Expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_http_error_structured_and_raw() {
        let err = classify_failure(
            400,
            "Bad Request",
            None,
            r#"{"error":{"message":"Unsupported parameter: 'temperature'","type":"invalid_request_error"}}"#,
        );
        assert_eq!(
            err.to_string(),
            "HTTP error 400 Bad Request: Unsupported parameter: 'temperature'"
        );

        let err = classify_failure(502, "Bad Gateway", None, "<html>upstream down</html>\n");
        match err {
            LlmError::Http { status, body, .. } => {
                assert_eq!(status, 502);
                assert_eq!(body, "<html>upstream down</html>");
            }
            other => panic!("Expected Http, got {:?}", other),
        }
    }

    #[test]
    fn test_merge_headers_overrides_and_token() {
        let model = Model::new(Api::OpenaiCompletions, "openai", "gpt-4o", "http://x")
            .header("x-team", "model")
            .header("x-model-only", "1");
        let options = StreamOptions::new().header("x-team", "request");

        let headers = merge_headers(&model, &options, "tok").unwrap();
        assert_eq!(headers.get("x-team").unwrap(), "request");
        assert_eq!(headers.get("x-model-only").unwrap(), "1");
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer tok");

        let headers = merge_headers(&model, &options, "").unwrap();
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_merge_headers_rejects_invalid_name() {
        let options = StreamOptions::new().header("bad header", "v");
        let model = Model::new(Api::OpenaiCompletions, "openai", "gpt-4o", "http://x");
        assert!(matches!(
            merge_headers(&model, &options, ""),
            Err(LlmError::Configuration(_))
        ));
    }
}
