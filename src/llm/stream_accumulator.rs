// ABOUTME: State machine that folds provider-reported primitives into one
// ABOUTME: AssistantMessage, deciding which normalized events to emit.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::event_stream::AssistantMessageEvent;
use super::models::calculate_cost;
use super::{AssistantMessage, ContentBlock, Model, StopReason, ToolCall, Usage};
use crate::error::LlmError;

/// Which block, if any, is currently receiving deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorState {
    AwaitingChunk,
    OpenText { index: usize },
    OpenThinking { index: usize },
    AccumulatingToolCall,
}

/// How the message ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The provider finished the turn normally.
    Stop,
    /// The provider hit the output-token limit.
    Length,
    /// The caller cancelled the request.
    Aborted,
    /// Transport, auth, or provider-state failure.
    Failed(String),
}

impl Completion {
    /// A failure reported by the provider inside an otherwise healthy stream.
    pub fn provider_failure(message: impl Into<String>) -> Self {
        Completion::from(&LlmError::ProviderState(message.into()))
    }
}

impl From<&LlmError> for Completion {
    fn from(err: &LlmError) -> Self {
        match err {
            LlmError::Aborted => Completion::Aborted,
            other => Completion::Failed(other.to_string()),
        }
    }
}

/// One piece of a streamed tool call. Any field may be absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolCallFragment<'a> {
    pub id: Option<&'a str>,
    pub name: Option<&'a str>,
    pub arguments: Option<&'a str>,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Builds an [`AssistantMessage`] from provider primitives.
///
/// Every mutating call returns the events it produced, in order, for the
/// adapter to push. [`finish`](Self::finish) consumes the accumulator and
/// always returns exactly one terminal event as its last element.
pub struct StreamAccumulator {
    model: Model,
    message: AssistantMessage,
    state: AccumulatorState,
    pending: BTreeMap<u64, PendingToolCall>,
    tool_calls_emitted: usize,
}

impl StreamAccumulator {
    /// Create an accumulator with an empty message for `model`.
    pub fn new(model: &Model) -> Self {
        Self {
            model: model.clone(),
            message: AssistantMessage::empty(model),
            state: AccumulatorState::AwaitingChunk,
            pending: BTreeMap::new(),
            tool_calls_emitted: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> AccumulatorState {
        self.state
    }

    /// The message as built so far.
    pub fn message(&self) -> &AssistantMessage {
        &self.message
    }

    /// Number of tool calls emitted so far.
    pub fn tool_calls_emitted(&self) -> usize {
        self.tool_calls_emitted
    }

    /// The `start` event, carrying the empty message.
    pub fn start_event(&self) -> AssistantMessageEvent {
        AssistantMessageEvent::Start {
            partial: self.message.clone(),
        }
    }

    /// Append visible text, opening a text block if needed.
    pub fn text_delta(&mut self, delta: &str) -> Vec<AssistantMessageEvent> {
        if delta.is_empty() {
            return Vec::new();
        }
        let mut events = Vec::new();

        let index = match self.state {
            AccumulatorState::OpenText { index } => index,
            _ => {
                events.extend(self.close_open_block());
                let index = self.push_block(ContentBlock::text(""));
                self.state = AccumulatorState::OpenText { index };
                events.push(AssistantMessageEvent::TextStart {
                    block_index: index,
                    partial: self.message.clone(),
                });
                index
            }
        };

        if let Some(ContentBlock::Text { text, .. }) = self.message.content.get_mut(index) {
            text.push_str(delta);
        }
        events.push(AssistantMessageEvent::TextDelta {
            block_index: index,
            delta: delta.to_string(),
            partial: self.message.clone(),
        });
        events
    }

    /// Append reasoning text, opening a thinking block if needed.
    pub fn thinking_delta(&mut self, delta: &str) -> Vec<AssistantMessageEvent> {
        if delta.is_empty() {
            return Vec::new();
        }
        let mut events = Vec::new();

        let index = match self.state {
            AccumulatorState::OpenThinking { index } => index,
            _ => {
                events.extend(self.close_open_block());
                self.open_thinking(&mut events)
            }
        };

        if let Some(ContentBlock::Thinking { thinking, .. }) = self.message.content.get_mut(index)
        {
            thinking.push_str(delta);
        }
        events.push(AssistantMessageEvent::ThinkingDelta {
            block_index: index,
            delta: delta.to_string(),
            partial: self.message.clone(),
        });
        events
    }

    /// Close whichever text or thinking block is open.
    ///
    /// Called when the provider signals a content-type change.
    pub fn close_block(&mut self) -> Vec<AssistantMessageEvent> {
        self.close_open_block()
    }

    /// Close the open text block, attaching the provider's item id.
    pub fn close_text(&mut self, signature: Option<String>) -> Vec<AssistantMessageEvent> {
        if let AccumulatorState::OpenText { index } = self.state {
            if let Some(ContentBlock::Text { text_signature, .. }) =
                self.message.content.get_mut(index)
            {
                *text_signature = signature;
            }
            return self.close_open_block();
        }
        Vec::new()
    }

    /// Close the open thinking block, attaching the opaque reasoning payload.
    ///
    /// When no thinking block is open but a payload is supplied, an empty
    /// block is opened to carry it so it can be replayed on the next turn.
    pub fn close_thinking(&mut self, signature: Option<String>) -> Vec<AssistantMessageEvent> {
        let mut events = Vec::new();
        let index = match self.state {
            AccumulatorState::OpenThinking { index } => index,
            _ if signature.is_some() => {
                events.extend(self.close_open_block());
                self.open_thinking(&mut events)
            }
            _ => return events,
        };

        if let Some(ContentBlock::Thinking {
            thinking_signature, ..
        }) = self.message.content.get_mut(index)
        {
            *thinking_signature = signature;
        }
        events.extend(self.close_open_block());
        events
    }

    /// Record a fragment of a streamed tool call addressed by `ordinal`.
    ///
    /// Nothing is emitted for the call itself until
    /// [`complete_tool_call`](Self::complete_tool_call); an open text or
    /// thinking block is closed because a tool call has begun.
    ///
    /// A fragment carrying a different id than the call pending at the same
    /// ordinal starts a new call, so the pending one is completed first. A
    /// name fragment that repeats the name recorded so far replaces it.
    pub fn tool_call_fragment(
        &mut self,
        ordinal: u64,
        fragment: ToolCallFragment<'_>,
    ) -> Vec<AssistantMessageEvent> {
        let mut events = self.close_open_block();

        let id = fragment.id.filter(|id| !id.is_empty());
        let starts_new_call = match (self.pending.get(&ordinal), id) {
            (Some(pending), Some(id)) => !pending.id.is_empty() && pending.id != id,
            _ => false,
        };
        if starts_new_call {
            events.extend(self.complete_tool_call(ordinal, None));
        }
        self.state = AccumulatorState::AccumulatingToolCall;

        let pending = self.pending.entry(ordinal).or_default();
        if let Some(id) = id {
            pending.id = id.to_string();
        }
        if let Some(name) = fragment.name {
            if !pending.name.is_empty() && name.starts_with(pending.name.as_str()) {
                pending.name = name.to_string();
            } else {
                pending.name.push_str(name);
            }
        }
        if let Some(arguments) = fragment.arguments {
            pending.arguments.push_str(arguments);
        }
        events
    }

    /// True if fragments have been recorded for `ordinal`.
    pub fn has_pending_tool_call(&self, ordinal: u64) -> bool {
        self.pending.contains_key(&ordinal)
    }

    /// Finish the tool call at `ordinal` and emit it.
    ///
    /// `final_arguments`, when the provider supplies the complete argument
    /// string, replaces the concatenated fragments. Calls lacking an id or
    /// name are dropped.
    pub fn complete_tool_call(
        &mut self,
        ordinal: u64,
        final_arguments: Option<&str>,
    ) -> Vec<AssistantMessageEvent> {
        let Some(pending) = self.pending.remove(&ordinal) else {
            return Vec::new();
        };
        if self.pending.is_empty() && self.state == AccumulatorState::AccumulatingToolCall {
            self.state = AccumulatorState::AwaitingChunk;
        }

        if pending.id.is_empty() || pending.name.is_empty() {
            debug!(
                ordinal,
                id = %pending.id,
                name = %pending.name,
                "dropping incomplete tool call"
            );
            return Vec::new();
        }

        let arguments = final_arguments.unwrap_or(&pending.arguments);
        self.emit_tool_call(pending.id, pending.name, arguments)
    }

    /// Finish every pending tool call in ordinal order.
    pub fn complete_pending_tool_calls(&mut self) -> Vec<AssistantMessageEvent> {
        let ordinals: Vec<u64> = self.pending.keys().copied().collect();
        ordinals
            .into_iter()
            .flat_map(|ordinal| self.complete_tool_call(ordinal, None))
            .collect()
    }

    /// Emit a tool call that arrived already complete.
    pub fn tool_call(
        &mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: &str,
    ) -> Vec<AssistantMessageEvent> {
        let (id, name) = (id.into(), name.into());
        if id.is_empty() || name.is_empty() {
            debug!(id = %id, name = %name, "dropping incomplete tool call");
            return Vec::new();
        }
        self.emit_tool_call(id, name, arguments)
    }

    /// Replace usage with a cumulative provider report.
    pub fn set_usage(&mut self, usage: Usage) {
        self.message.usage = usage;
        self.refresh_usage();
    }

    /// Add an incremental provider report.
    pub fn add_usage(&mut self, delta: &Usage) {
        let mut delta = *delta;
        if delta.total_tokens == 0 {
            delta.total_tokens = delta.sum_tokens();
        }
        self.message.usage.add(&delta);
        self.refresh_usage();
    }

    /// Finalize the message and produce the closing events.
    ///
    /// Open blocks are closed without a trailing delta and unfinished tool
    /// calls are discarded. The last element is always the terminal event.
    pub fn finish(mut self, completion: Completion) -> Vec<AssistantMessageEvent> {
        let mut events = self.close_open_block();

        if !self.pending.is_empty() {
            debug!(
                count = self.pending.len(),
                "discarding unfinished tool calls"
            );
            self.pending.clear();
        }

        let reason = match completion {
            Completion::Stop if self.tool_calls_emitted > 0 => StopReason::ToolUse,
            Completion::Stop => StopReason::Stop,
            Completion::Length => StopReason::Length,
            Completion::Aborted => {
                self.message.error_message = Some(LlmError::Aborted.to_string());
                StopReason::Aborted
            }
            Completion::Failed(message) => {
                self.message.error_message = Some(message);
                StopReason::Error
            }
        };
        self.message.stop_reason = reason;

        let terminal = if reason.is_failure() {
            AssistantMessageEvent::Error {
                reason,
                error: self.message,
            }
        } else {
            AssistantMessageEvent::Done {
                reason,
                message: self.message,
            }
        };
        events.push(terminal);
        events
    }

    fn push_block(&mut self, block: ContentBlock) -> usize {
        self.message.content.push(block);
        self.message.content.len() - 1
    }

    fn open_thinking(&mut self, events: &mut Vec<AssistantMessageEvent>) -> usize {
        let index = self.push_block(ContentBlock::thinking(""));
        self.state = AccumulatorState::OpenThinking { index };
        events.push(AssistantMessageEvent::ThinkingStart {
            block_index: index,
            partial: self.message.clone(),
        });
        index
    }

    fn close_open_block(&mut self) -> Vec<AssistantMessageEvent> {
        let event = match self.state {
            AccumulatorState::OpenText { index } => {
                let content = match self.message.content.get(index) {
                    Some(ContentBlock::Text { text, .. }) => text.clone(),
                    _ => String::new(),
                };
                AssistantMessageEvent::TextEnd {
                    block_index: index,
                    content,
                    partial: self.message.clone(),
                }
            }
            AccumulatorState::OpenThinking { index } => {
                let content = match self.message.content.get(index) {
                    Some(ContentBlock::Thinking { thinking, .. }) => thinking.clone(),
                    _ => String::new(),
                };
                AssistantMessageEvent::ThinkingEnd {
                    block_index: index,
                    content,
                    partial: self.message.clone(),
                }
            }
            _ => return Vec::new(),
        };
        self.state = if self.pending.is_empty() {
            AccumulatorState::AwaitingChunk
        } else {
            AccumulatorState::AccumulatingToolCall
        };
        vec![event]
    }

    fn emit_tool_call(
        &mut self,
        id: String,
        name: String,
        arguments: &str,
    ) -> Vec<AssistantMessageEvent> {
        let mut events = self.close_open_block();

        let tool_call = ToolCall {
            arguments: parse_arguments(&name, arguments),
            id,
            name,
        };
        let index = self.push_block(ContentBlock::ToolCall(tool_call.clone()));
        self.tool_calls_emitted += 1;

        events.push(AssistantMessageEvent::ToolcallStart {
            block_index: index,
            partial: self.message.clone(),
        });
        events.push(AssistantMessageEvent::ToolcallEnd {
            block_index: index,
            tool_call,
            partial: self.message.clone(),
        });
        events
    }

    fn refresh_usage(&mut self) {
        let usage = &mut self.message.usage;
        if usage.total_tokens == 0 {
            usage.total_tokens = usage.sum_tokens();
        }
        calculate_cost(&self.model, usage);
    }
}

/// Parse a concatenated argument string into an object.
///
/// Anything that is not a JSON object becomes an empty object.
fn parse_arguments(tool: &str, raw: &str) -> serde_json::Map<String, serde_json::Value> {
    if raw.trim().is_empty() {
        return serde_json::Map::new();
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(other) => {
            warn!(tool, arguments = %other, "tool arguments are not an object");
            serde_json::Map::new()
        }
        Err(e) => {
            warn!(tool, arguments = raw, error = %e, "failed to parse tool arguments");
            serde_json::Map::new()
        }
    }
}
