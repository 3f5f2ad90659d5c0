// ABOUTME: LLM module - canonical message model, event stream, and the
// ABOUTME: provider adapters that normalize into it.

pub mod azure;
mod cancel;
mod client;
mod dispatch;
mod driver;
mod event_stream;
pub mod models;
pub mod openai;
mod options;
pub mod responses;
pub mod sse;
pub mod stream_accumulator;
pub mod token;
mod transport;
mod types;

pub use azure::{AzureConfig, AzureResponsesClient};
pub use cancel::*;
pub use client::*;
pub use dispatch::*;
pub use event_stream::*;
pub use models::{builtin_models, calculate_cost, get_model};
pub use openai::OpenAICompletionsClient;
pub use options::*;
pub use stream_accumulator::{AccumulatorState, Completion, StreamAccumulator};
pub use token::{EnvToken, StaticToken, TokenProvider};
pub use types::*;
