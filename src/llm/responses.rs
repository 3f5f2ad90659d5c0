// ABOUTME: The "responses" wire format - typed server-sent events, input item
// ABOUTME: conversion, and the frame handler feeding the accumulator.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{trace, warn};

use super::driver::{Flow, WireFormat};
use super::event_stream::AssistantMessageEvent;
use super::options::{ReasoningEffort, ReasoningSummary, StreamOptions};
use super::stream_accumulator::{Completion, StreamAccumulator, ToolCallFragment};
use super::{AssistantMessage, ContentBlock, Context, Message, Model, Tool, Usage, UserContent};

/// Responses request body.
#[derive(Debug, Serialize)]
pub struct ResponsesRequest {
    pub model: String,
    pub input: Vec<Value>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_cache_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningParams>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct ReasoningParams {
    pub effort: ReasoningEffort,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<ReasoningSummary>,
}

/// Server-sent events this format understands. Anything else is `Other`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ResponsesEvent {
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded { output_index: u64, item: OutputItem },
    #[serde(rename = "response.output_item.done")]
    OutputItemDone { output_index: u64, item: OutputItem },
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta { delta: String },
    #[serde(rename = "response.refusal.delta")]
    RefusalDelta { delta: String },
    #[serde(rename = "response.reasoning_summary_text.delta")]
    ReasoningSummaryTextDelta { delta: String },
    #[serde(rename = "response.reasoning_summary_part.done")]
    ReasoningSummaryPartDone,
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta { output_index: u64, delta: String },
    #[serde(rename = "response.completed")]
    Completed { response: ResponseObject },
    #[serde(rename = "response.incomplete")]
    Incomplete { response: ResponseObject },
    #[serde(rename = "response.failed")]
    Failed { response: ResponseObject },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// An item in the response output list.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    Message {
        id: String,
    },
    Reasoning(ReasoningItem),
    FunctionCall {
        #[serde(default)]
        id: Option<String>,
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    #[serde(other)]
    Other,
}

/// A reasoning item, kept whole so it can be replayed on the next turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningItem {
    #[serde(rename = "type", default = "reasoning_type")]
    pub item_type: String,
    pub id: String,
    #[serde(default)]
    pub summary: Vec<SummaryText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_content: Option<String>,
}

fn reasoning_type() -> String {
    "reasoning".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryText {
    #[serde(rename = "type")]
    pub part_type: String,
    pub text: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResponseObject {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub usage: Option<ResponsesUsage>,
    #[serde(default)]
    pub error: Option<ResponseError>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResponsesUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub input_tokens_details: Option<InputTokensDetails>,
}

#[derive(Debug, Deserialize)]
pub struct InputTokensDetails {
    #[serde(default)]
    pub cached_tokens: u64,
}

impl From<&ResponsesUsage> for Usage {
    fn from(usage: &ResponsesUsage) -> Self {
        let cached = usage
            .input_tokens_details
            .as_ref()
            .map(|d| d.cached_tokens)
            .unwrap_or(0);
        Usage {
            input: usage.input_tokens.saturating_sub(cached),
            output: usage.output_tokens,
            cache_read: cached,
            cache_write: 0,
            total_tokens: usage.total_tokens,
            ..Default::default()
        }
    }
}

/// Split a canonical tool-call id into `(call_id, item_id)`.
fn split_call_id(id: &str) -> (&str, Option<&str>) {
    match id.split_once('|') {
        Some((call_id, item_id)) => (call_id, Some(item_id)),
        None => (id, None),
    }
}

fn convert_user_content(content: &[UserContent]) -> Vec<Value> {
    content
        .iter()
        .map(|part| match part {
            UserContent::Text { text } => json!({"type": "input_text", "text": text}),
            UserContent::Image { data, mime_type } => json!({
                "type": "input_image",
                "detail": "auto",
                "image_url": format!("data:{mime_type};base64,{data}"),
            }),
        })
        .collect()
}

fn convert_assistant(model: &Model, message: &AssistantMessage, input: &mut Vec<Value>) {
    // Signatures and item ids only mean something to the model that minted them.
    let native = message.provider == model.provider && message.model == model.id;

    for block in &message.content {
        match block {
            ContentBlock::Thinking {
                thinking_signature: Some(signature),
                ..
            } if native => match serde_json::from_str::<Value>(signature) {
                Ok(item) => input.push(item),
                Err(e) => warn!(error = %e, "dropping unreadable reasoning signature"),
            },
            ContentBlock::Thinking { .. } => {}
            ContentBlock::Text {
                text,
                text_signature,
            } => match text_signature {
                Some(id) if native => input.push(json!({
                    "type": "message",
                    "role": "assistant",
                    "id": id,
                    "status": "completed",
                    "content": [{"type": "output_text", "text": text, "annotations": []}],
                })),
                _ => input.push(json!({"role": "assistant", "content": text})),
            },
            ContentBlock::ToolCall(call) => {
                let (call_id, item_id) = split_call_id(&call.id);
                let mut item = json!({
                    "type": "function_call",
                    "call_id": call_id,
                    "name": call.name,
                    "arguments": Value::Object(call.arguments.clone()).to_string(),
                });
                if let (Some(item_id), true) = (item_id, native) {
                    item["id"] = json!(item_id);
                }
                input.push(item);
            }
        }
    }
}

/// Convert the conversation into responses input items.
pub fn convert_input(model: &Model, context: &Context) -> Vec<Value> {
    let mut input = Vec::new();

    if let Some(system) = &context.system_prompt {
        let role = if model.reasoning { "developer" } else { "system" };
        input.push(json!({"role": role, "content": system}));
    }

    for message in &context.messages {
        match message {
            Message::User(user) => input.push(json!({
                "role": "user",
                "content": convert_user_content(&user.content),
            })),
            Message::Assistant(assistant) => convert_assistant(model, assistant, &mut input),
            Message::ToolResult(result) => {
                let output = result
                    .content
                    .iter()
                    .filter_map(|part| match part {
                        UserContent::Text { text } => Some(text.as_str()),
                        UserContent::Image { .. } => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                input.push(json!({
                    "type": "function_call_output",
                    "call_id": split_call_id(&result.tool_call_id).0,
                    "output": output,
                }));
            }
        }
    }

    input
}

/// Convert tool declarations into responses function tools.
pub fn convert_tools(tools: &[Tool]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
            })
        })
        .collect()
}

/// Build a responses request addressed to `deployment`.
pub fn build_request(
    model: &Model,
    context: &Context,
    options: &StreamOptions,
    deployment: &str,
) -> ResponsesRequest {
    let mut request = ResponsesRequest {
        model: deployment.to_string(),
        input: convert_input(model, context),
        stream: true,
        prompt_cache_key: options.session_id.clone(),
        max_output_tokens: options.max_tokens,
        temperature: options.temperature,
        tools: convert_tools(&context.tools),
        reasoning: None,
        include: Vec::new(),
    };

    let wants_reasoning = options.reasoning_effort.is_some() || options.reasoning_summary.is_some();
    if model.reasoning && wants_reasoning {
        request.reasoning = Some(ReasoningParams {
            effort: options
                .effective_reasoning(model)
                .unwrap_or(ReasoningEffort::Medium),
            summary: match options.reasoning_summary {
                None => Some(ReasoningSummary::Auto),
                Some(ReasoningSummary::None) => None,
                Some(summary) => Some(summary),
            },
        });
        request.include = vec!["reasoning.encrypted_content"];
    }

    request
}

fn failure_message(code: Option<&str>, message: Option<&str>) -> String {
    match (code, message) {
        (Some(code), Some(message)) => format!("Error Code {code}: {message}"),
        (None, Some(message)) => message.to_string(),
        (Some(code), None) => format!("Error Code {code}"),
        (None, None) => "Unknown error".to_string(),
    }
}

/// Event handling for one responses stream.
#[derive(Debug, Default)]
pub(crate) struct ResponsesWire {
    summary_part_ended: bool,
}

impl ResponsesWire {
    fn finish_response(
        &self,
        response: &ResponseObject,
        acc: &mut StreamAccumulator,
    ) -> Completion {
        if let Some(usage) = &response.usage {
            acc.set_usage(Usage::from(usage));
        }
        match response.status.as_deref() {
            None | Some("completed") => Completion::Stop,
            Some("incomplete") => Completion::Length,
            Some(status) => {
                Completion::provider_failure(format!("Response ended with status {status}"))
            }
        }
    }
}

impl WireFormat for ResponsesWire {
    type Frame = ResponsesEvent;

    fn on_frame(
        &mut self,
        event: ResponsesEvent,
        acc: &mut StreamAccumulator,
    ) -> (Vec<AssistantMessageEvent>, Flow) {
        let events = match event {
            ResponsesEvent::OutputItemAdded {
                output_index,
                item:
                    OutputItem::FunctionCall {
                        id,
                        call_id,
                        name,
                        arguments,
                    },
            } => {
                let id = match id {
                    Some(item_id) => format!("{call_id}|{item_id}"),
                    None => call_id,
                };
                acc.tool_call_fragment(
                    output_index,
                    ToolCallFragment {
                        id: Some(&id),
                        name: Some(&name),
                        arguments: Some(&arguments),
                    },
                )
            }
            ResponsesEvent::OutputItemAdded { .. } => Vec::new(),
            ResponsesEvent::OutputTextDelta { delta } | ResponsesEvent::RefusalDelta { delta } => {
                acc.text_delta(&delta)
            }
            ResponsesEvent::ReasoningSummaryTextDelta { delta } => {
                let mut events = Vec::new();
                if std::mem::take(&mut self.summary_part_ended) {
                    events.extend(acc.thinking_delta("\n\n"));
                }
                events.extend(acc.thinking_delta(&delta));
                events
            }
            ResponsesEvent::ReasoningSummaryPartDone => {
                self.summary_part_ended = true;
                Vec::new()
            }
            ResponsesEvent::FunctionCallArgumentsDelta {
                output_index,
                delta,
            } => acc.tool_call_fragment(
                output_index,
                ToolCallFragment {
                    arguments: Some(&delta),
                    ..Default::default()
                },
            ),
            ResponsesEvent::OutputItemDone { output_index, item } => match item {
                OutputItem::Message { id } => acc.close_text(Some(id)),
                OutputItem::Reasoning(reasoning) => {
                    self.summary_part_ended = false;
                    let signature = serde_json::to_string(&reasoning).ok();
                    acc.close_thinking(signature)
                }
                OutputItem::FunctionCall {
                    id,
                    call_id,
                    name,
                    arguments,
                } => {
                    if acc.has_pending_tool_call(output_index) {
                        acc.complete_tool_call(output_index, Some(&arguments))
                    } else {
                        let id = match id {
                            Some(item_id) => format!("{call_id}|{item_id}"),
                            None => call_id,
                        };
                        acc.tool_call(id, name, &arguments)
                    }
                }
                OutputItem::Other => Vec::new(),
            },
            ResponsesEvent::Completed { response } | ResponsesEvent::Incomplete { response } => {
                let completion = self.finish_response(&response, acc);
                return (Vec::new(), Flow::Finished(completion));
            }
            ResponsesEvent::Failed { response } => {
                if let Some(usage) = &response.usage {
                    acc.set_usage(Usage::from(usage));
                }
                let message = match &response.error {
                    Some(error) => failure_message(error.code.as_deref(), error.message.as_deref()),
                    None => failure_message(None, None),
                };
                return (Vec::new(), Flow::Finished(Completion::provider_failure(message)));
            }
            ResponsesEvent::Error { code, message } => {
                let message = failure_message(code.as_deref(), message.as_deref());
                return (Vec::new(), Flow::Finished(Completion::provider_failure(message)));
            }
            ResponsesEvent::Other => {
                trace!("ignoring responses event");
                Vec::new()
            }
        };
        (events, Flow::Continue)
    }

    fn on_end(&mut self, _acc: &mut StreamAccumulator) -> (Vec<AssistantMessageEvent>, Completion) {
        (
            Vec::new(),
            Completion::provider_failure("stream ended without a completion event"),
        )
    }
}
