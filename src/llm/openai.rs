// ABOUTME: OpenAI chat-completions adapter.
// ABOUTME: Streams delta chunks, including fragmented tool calls, into canonical events.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::client::LlmClient;
use super::driver::{Flow, PreparedRequest, StreamRequest, WireFormat, spawn_stream};
use super::event_stream::{AssistantMessageEvent, EventStream};
use super::options::{ReasoningEffort, StreamOptions};
use super::stream_accumulator::{Completion, StreamAccumulator, ToolCallFragment};
use super::token::{StaticToken, TokenProvider};
use super::{Api, ContentBlock, Context, Message, Model, Tool, Usage, UserContent};
use crate::error::LlmError;

/// Chat-completions request body.
#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub stream_options: ChatStreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ChatTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_cache_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatStreamOptions {
    pub include_usage: bool,
}

/// A message in chat-completions format.
#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    System {
        content: String,
    },
    Developer {
        content: String,
    },
    User {
        content: ChatUserContent,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ChatToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

/// User content: a bare string, or parts when images are present.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ChatUserContent {
    Text(String),
    Parts(Vec<ChatContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatContentPart {
    Text { text: String },
    ImageUrl { image_url: ChatImageUrl },
}

#[derive(Debug, Serialize)]
pub struct ChatImageUrl {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct ChatToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: &'static str,
    pub function: ChatFunctionCall,
}

#[derive(Debug, Serialize)]
pub struct ChatFunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Serialize)]
pub struct ChatTool {
    #[serde(rename = "type")]
    pub tool_type: &'static str,
    pub function: ChatFunction,
}

#[derive(Debug, Serialize)]
pub struct ChatFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// One streamed chunk.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<ChunkUsage>,
    #[serde(default)]
    pub error: Option<ChunkError>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: u64,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: u64,
}

#[derive(Debug, Deserialize)]
pub struct ChunkError {
    pub message: String,
}

impl From<&ChunkUsage> for Usage {
    fn from(usage: &ChunkUsage) -> Self {
        let cached = usage
            .prompt_tokens_details
            .as_ref()
            .map(|d| d.cached_tokens)
            .unwrap_or(0);
        Usage {
            input: usage.prompt_tokens.saturating_sub(cached),
            output: usage.completion_tokens,
            cache_read: cached,
            cache_write: 0,
            total_tokens: usage.total_tokens,
            ..Default::default()
        }
    }
}

impl From<&Tool> for ChatTool {
    fn from(tool: &Tool) -> Self {
        ChatTool {
            tool_type: "function",
            function: ChatFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            },
        }
    }
}

/// Tool-call ids minted by the responses format carry an item suffix this
/// format rejects.
fn completions_call_id(id: &str) -> String {
    id.split('|').next().unwrap_or(id).to_string()
}

fn convert_user_content(content: &[UserContent]) -> ChatUserContent {
    if let [UserContent::Text { text }] = content {
        return ChatUserContent::Text(text.clone());
    }
    ChatUserContent::Parts(
        content
            .iter()
            .map(|part| match part {
                UserContent::Text { text } => ChatContentPart::Text { text: text.clone() },
                UserContent::Image { data, mime_type } => ChatContentPart::ImageUrl {
                    image_url: ChatImageUrl {
                        url: format!("data:{mime_type};base64,{data}"),
                    },
                },
            })
            .collect(),
    )
}

fn text_of(content: &[UserContent]) -> String {
    content
        .iter()
        .filter_map(|part| match part {
            UserContent::Text { text } => Some(text.as_str()),
            UserContent::Image { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Convert conversation messages to chat-completions format.
pub fn convert_messages(model: &Model, context: &Context) -> Vec<ChatMessage> {
    let mut messages = Vec::new();

    if let Some(system) = &context.system_prompt {
        let content = system.clone();
        messages.push(if model.reasoning {
            ChatMessage::Developer { content }
        } else {
            ChatMessage::System { content }
        });
    }

    for message in &context.messages {
        match message {
            Message::User(user) => messages.push(ChatMessage::User {
                content: convert_user_content(&user.content),
            }),
            Message::Assistant(assistant) => {
                let text = assistant.text();
                let tool_calls: Vec<ChatToolCall> = assistant
                    .content
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::ToolCall(call) => Some(ChatToolCall {
                            id: completions_call_id(&call.id),
                            call_type: "function",
                            function: ChatFunctionCall {
                                name: call.name.clone(),
                                arguments: serde_json::Value::Object(call.arguments.clone())
                                    .to_string(),
                            },
                        }),
                        _ => None,
                    })
                    .collect();

                if text.is_empty() && tool_calls.is_empty() {
                    continue;
                }
                messages.push(ChatMessage::Assistant {
                    content: (!text.is_empty()).then_some(text),
                    tool_calls,
                });
            }
            Message::ToolResult(result) => messages.push(ChatMessage::Tool {
                tool_call_id: completions_call_id(&result.tool_call_id),
                content: text_of(&result.content),
            }),
        }
    }

    messages
}

/// Build the request body for `model`.
pub fn build_request(
    model: &Model,
    context: &Context,
    options: &StreamOptions,
) -> ChatCompletionRequest {
    let tools: Vec<ChatTool> = context.tools.iter().map(ChatTool::from).collect();
    ChatCompletionRequest {
        model: model.id.clone(),
        messages: convert_messages(model, context),
        stream: true,
        stream_options: ChatStreamOptions {
            include_usage: true,
        },
        max_completion_tokens: options.max_tokens,
        temperature: options.temperature,
        tool_choice: (!tools.is_empty()).then_some("auto"),
        tools,
        reasoning_effort: if model.reasoning {
            options.effective_reasoning(model)
        } else {
            None
        },
        prompt_cache_key: options.session_id.clone(),
    }
}

fn map_finish_reason(reason: &str) -> Completion {
    match reason {
        "stop" | "tool_calls" | "function_call" => Completion::Stop,
        "length" => Completion::Length,
        other => Completion::provider_failure(format!("Provider finish_reason: {other}")),
    }
}

/// Chunk handling for one chat-completions response.
#[derive(Debug, Default)]
pub(crate) struct CompletionsWire {
    finish: Option<Completion>,
}

impl WireFormat for CompletionsWire {
    type Frame = ChatCompletionChunk;

    fn on_frame(
        &mut self,
        chunk: ChatCompletionChunk,
        acc: &mut StreamAccumulator,
    ) -> (Vec<AssistantMessageEvent>, Flow) {
        if let Some(error) = chunk.error {
            return (Vec::new(), Flow::Finished(Completion::provider_failure(error.message)));
        }

        let mut events = Vec::new();
        if let Some(usage) = &chunk.usage {
            acc.set_usage(Usage::from(usage));
        }

        for choice in chunk.choices {
            let delta = choice.delta;
            if let Some(reasoning) = &delta.reasoning_content {
                events.extend(acc.thinking_delta(reasoning));
            }
            if let Some(content) = &delta.content {
                events.extend(acc.text_delta(content));
            }
            for call in delta.tool_calls.iter().flatten() {
                let function = call.function.as_ref();
                events.extend(acc.tool_call_fragment(
                    call.index,
                    ToolCallFragment {
                        id: call.id.as_deref(),
                        name: function.and_then(|f| f.name.as_deref()),
                        arguments: function.and_then(|f| f.arguments.as_deref()),
                    },
                ));
            }

            // Usage arrives in a later chunk, so finishing waits for [DONE].
            if let Some(reason) = &choice.finish_reason {
                events.extend(acc.complete_pending_tool_calls());
                events.extend(acc.close_block());
                self.finish = Some(map_finish_reason(reason));
            }
        }

        (events, Flow::Continue)
    }

    fn on_end(&mut self, _acc: &mut StreamAccumulator) -> (Vec<AssistantMessageEvent>, Completion) {
        let completion = self.finish.take().unwrap_or_else(|| {
            Completion::provider_failure("stream ended without a finish reason")
        });
        (Vec::new(), completion)
    }
}

/// Client for OpenAI-compatible chat-completions endpoints.
#[derive(Clone)]
pub struct OpenAICompletionsClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    base_url: Option<String>,
}

impl OpenAICompletionsClient {
    /// Create a client authenticating through `tokens`.
    pub fn new(tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            tokens,
            base_url: None,
        }
    }

    /// Create a client with a fixed API key.
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self::new(Arc::new(StaticToken::new(api_key)))
    }

    /// Create a client from `OPENAI_API_KEY` and, if set, `OPENAI_BASE_URL`.
    pub fn from_env() -> Result<Self, LlmError> {
        let client = Self::new(Arc::new(StaticToken::from_env("OPENAI_API_KEY")?));
        Ok(match std::env::var("OPENAI_BASE_URL") {
            Ok(url) if !url.trim().is_empty() => client.with_base_url(url),
            _ => client,
        })
    }

    /// Override the base URL every model is sent to.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Use a preconfigured HTTP client.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    fn prepare(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<PreparedRequest, LlmError> {
        let base = self
            .base_url
            .as_deref()
            .unwrap_or(model.base_url.as_str())
            .trim()
            .trim_end_matches('/');
        if base.is_empty() {
            return Err(LlmError::Configuration(format!(
                "no base URL configured for model '{}'",
                model.id
            )));
        }

        let body = serde_json::to_value(build_request(model, context, options))
            .map_err(|e| LlmError::Configuration(format!("failed to encode request: {e}")))?;
        Ok(PreparedRequest {
            url: format!("{base}/chat/completions"),
            body,
        })
    }
}

impl LlmClient for OpenAICompletionsClient {
    fn api(&self) -> Api {
        Api::OpenaiCompletions
    }

    fn stream(&self, model: &Model, context: &Context, options: StreamOptions) -> EventStream {
        let prepared = self.prepare(model, context, &options);
        spawn_stream(
            StreamRequest {
                http: self.http.clone(),
                tokens: self.tokens.clone(),
                model: model.clone(),
                options,
                wire: CompletionsWire::default(),
            },
            prepared,
        )
    }
}

#[cfg(test)]
mod openai_test {
    use serde_json::json;

    use super::*;
    use crate::llm::{AssistantMessage, StopReason, ToolCall};

    fn model() -> Model {
        Model::new(Api::OpenaiCompletions, "openai", "gpt-4o", "https://api.example.com/v1/")
    }

    fn chunk(value: serde_json::Value) -> ChatCompletionChunk {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_request_serialization() {
        let context = Context::new()
            .system("Be helpful")
            .message(Message::user("Hello"))
            .tool(Tool::new(
                "get_weather",
                "Get the weather",
                json!({"type": "object", "properties": {"location": {"type": "string"}}}),
            ));
        let options = StreamOptions::new().max_tokens(100).session_id("s-1");

        let body = serde_json::to_value(build_request(&model(), &context, &options)).unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["max_completion_tokens"], 100);
        assert_eq!(body["prompt_cache_key"], "s-1");
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "get_weather");
        assert_eq!(body["messages"][0], json!({"role": "system", "content": "Be helpful"}));
        assert_eq!(body["messages"][1], json!({"role": "user", "content": "Hello"}));
        assert!(body.get("temperature").is_none());
        assert!(body.get("reasoning_effort").is_none());
    }

    #[test]
    fn test_reasoning_model_uses_developer_role() {
        let model = model().reasoning(true);
        let context = Context::new().system("sys").message(Message::user("hi"));
        let options = StreamOptions::new().reasoning_effort(ReasoningEffort::Xhigh);

        let body = serde_json::to_value(build_request(&model, &context, &options)).unwrap();
        assert_eq!(body["messages"][0]["role"], "developer");
        assert_eq!(body["reasoning_effort"], "high");
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn test_history_conversion() {
        let mut assistant = AssistantMessage::empty(&model());
        assistant.content = vec![
            ContentBlock::thinking("hidden"),
            ContentBlock::text("Checking."),
            ContentBlock::ToolCall(ToolCall {
                id: "call_1|fc_1".into(),
                name: "read".into(),
                arguments: json!({"path": "a.rs"}).as_object().cloned().unwrap(),
            }),
        ];
        let context = Context::new().messages([
            Message::user_parts(vec![
                UserContent::text("what is this"),
                UserContent::image("aGVsbG8=", "image/png"),
            ]),
            assistant.into(),
            Message::tool_result("call_1|fc_1", "read", "fn main() {}"),
        ]);

        let body = serde_json::to_value(convert_messages(&model(), &context)).unwrap();
        assert_eq!(body[0]["content"][0], json!({"type": "text", "text": "what is this"}));
        assert_eq!(
            body[0]["content"][1]["image_url"]["url"],
            "data:image/png;base64,aGVsbG8="
        );
        assert_eq!(body[1]["role"], "assistant");
        assert_eq!(body[1]["content"], "Checking.");
        assert_eq!(body[1]["tool_calls"][0]["id"], "call_1");
        assert_eq!(
            body[1]["tool_calls"][0]["function"]["arguments"],
            r#"{"path":"a.rs"}"#
        );
        assert_eq!(
            body[2],
            json!({"role": "tool", "tool_call_id": "call_1", "content": "fn main() {}"})
        );
    }

    #[test]
    fn test_chunks_to_events() {
        let model = model();
        let mut acc = StreamAccumulator::new(&model);
        let mut wire = CompletionsWire::default();
        let mut events = Vec::new();

        for value in [
            json!({"choices": [{"delta": {"role": "assistant", "content": ""}}]}),
            json!({"choices": [{"delta": {"reasoning_content": "think"}}]}),
            json!({"choices": [{"delta": {"content": "Hi"}}]}),
            json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "id": "c1", "function": {"name": "double_number", "arguments": ""}}]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": "{\"value\":"}}]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": "21}"}}]}}]}),
            json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 50, "completion_tokens": 7, "total_tokens": 57, "prompt_tokens_details": {"cached_tokens": 20}}}),
        ] {
            let (evs, flow) = wire.on_frame(chunk(value), &mut acc);
            assert_eq!(flow, Flow::Continue);
            events.extend(evs);
        }
        let (evs, completion) = wire.on_end(&mut acc);
        events.extend(evs);
        events.extend(acc.finish(completion));

        let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "thinking_start",
                "thinking_delta",
                "thinking_end",
                "text_start",
                "text_delta",
                "text_end",
                "toolcall_start",
                "toolcall_end",
                "done",
            ]
        );

        let message = events.last().unwrap().message();
        assert_eq!(message.stop_reason, StopReason::ToolUse);
        assert_eq!(message.usage.input, 30);
        assert_eq!(message.usage.cache_read, 20);
        assert_eq!(message.usage.output, 7);
        assert_eq!(message.usage.total_tokens, 57);
        assert_eq!(message.tool_calls()[0].arguments["value"], 21);
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason("stop"), Completion::Stop);
        assert_eq!(map_finish_reason("length"), Completion::Length);
        assert_eq!(map_finish_reason("tool_calls"), Completion::Stop);
        assert_eq!(
            map_finish_reason("content_filter"),
            Completion::Failed("Provider finish_reason: content_filter".into())
        );
    }

    #[test]
    fn test_missing_finish_reason_is_error() {
        let model = model();
        let mut acc = StreamAccumulator::new(&model);
        let mut wire = CompletionsWire::default();
        wire.on_frame(chunk(json!({"choices": [{"delta": {"content": "partial"}}]})), &mut acc);

        let (_, completion) = wire.on_end(&mut acc);
        assert!(matches!(completion, Completion::Failed(_)));
    }

    #[test]
    fn test_in_stream_error_chunk() {
        let model = model();
        let mut acc = StreamAccumulator::new(&model);
        let mut wire = CompletionsWire::default();
        let (_, flow) = wire.on_frame(
            chunk(json!({"error": {"message": "upstream overloaded"}})),
            &mut acc,
        );
        assert_eq!(
            flow,
            Flow::Finished(Completion::Failed("upstream overloaded".into()))
        );
    }

    #[test]
    fn test_prepare_requires_base_url() {
        let client = OpenAICompletionsClient::with_api_key("sk");
        let model = Model::new(Api::OpenaiCompletions, "openai", "gpt-4o", "");
        let err = client
            .prepare(&model, &Context::new(), &StreamOptions::new())
            .unwrap_err();
        assert!(matches!(err, LlmError::Configuration(_)));

        let prepared = client
            .prepare(&self::model(), &Context::new(), &StreamOptions::new())
            .unwrap();
        assert_eq!(prepared.url, "https://api.example.com/v1/chat/completions");
    }
}
