// ABOUTME: Per-request stream options - cancellation, sampling, reasoning
// ABOUTME: effort/summary, cache affinity, and the outbound payload hook.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::Model;
use super::cancel::AbortSignal;

/// How much deliberation a reasoning model should spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ReasoningEffort {
    /// Downgrade `xhigh` to `high` for models that do not accept it.
    pub fn clamp_for(self, model: &Model) -> Self {
        match self {
            ReasoningEffort::Xhigh if !supports_xhigh(model) => ReasoningEffort::High,
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Minimal => "minimal",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
            ReasoningEffort::Xhigh => "xhigh",
        }
    }
}

/// Whether the provider should return reasoning summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningSummary {
    Auto,
    Detailed,
    Concise,
    None,
}

/// True if the model accepts the `xhigh` reasoning effort.
pub fn supports_xhigh(model: &Model) -> bool {
    model.id.starts_with("gpt-5.2") || model.id.contains("codex-max")
}

/// Callback receiving the outbound request body before it is sent.
pub type PayloadHook = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Options recognized by every provider adapter.
///
/// Omitted fields take provider-specific defaults.
#[derive(Clone, Default)]
pub struct StreamOptions {
    pub signal: AbortSignal,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub reasoning_summary: Option<ReasoningSummary>,
    /// Cache-affinity hint forwarded as the prompt cache key.
    pub session_id: Option<String>,
    pub on_payload: Option<PayloadHook>,
    /// Extra headers, applied over the model's defaults.
    pub headers: HashMap<String, String>,
}

impl StreamOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cancellation signal.
    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = signal;
        self
    }

    /// Set temperature.
    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set max output tokens.
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set reasoning effort.
    pub fn reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }

    /// Set reasoning summary mode.
    pub fn reasoning_summary(mut self, summary: ReasoningSummary) -> Self {
        self.reasoning_summary = Some(summary);
        self
    }

    /// Set the session id used as a cache-affinity hint.
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Observe the request body before transmission.
    pub fn on_payload(mut self, hook: impl Fn(&serde_json::Value) + Send + Sync + 'static) -> Self {
        self.on_payload = Some(Arc::new(hook));
        self
    }

    /// Add a request header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Reasoning effort after clamping to what the model supports.
    pub fn effective_reasoning(&self, model: &Model) -> Option<ReasoningEffort> {
        self.reasoning_effort.map(|e| e.clamp_for(model))
    }
}

impl fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOptions")
            .field("signal", &self.signal)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("reasoning_effort", &self.reasoning_effort)
            .field("reasoning_summary", &self.reasoning_summary)
            .field("session_id", &self.session_id)
            .field("on_payload", &self.on_payload.is_some())
            .field("headers", &self.headers)
            .finish()
    }
}
