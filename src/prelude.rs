// ABOUTME: Prelude module - convenient imports for common use cases.
// ABOUTME: Use `use llm_relay::prelude::*;` to get started quickly.

pub use crate::error::{LlmError, RelayError, TokenError};
pub use crate::llm::{
    AbortController, AbortSignal, Api, AssistantMessage, AssistantMessageEvent,
    AzureResponsesClient, ContentBlock, Context, EventStream, LlmClient, Message, Model,
    OpenAICompletionsClient, ProviderRegistry, ReasoningEffort, ReasoningSummary, StaticToken,
    StopReason, StreamOptions, Tool, ToolCall, TokenProvider, Usage, UserContent, complete,
    get_model,
};
