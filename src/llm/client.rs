// ABOUTME: Defines the LlmClient trait - the seam between callers and the
// ABOUTME: per-wire-format provider adapters.

use super::event_stream::EventStream;
use super::options::StreamOptions;
use super::{Api, Context, Model};

/// A provider adapter for one wire format.
///
/// `stream` returns immediately; the request runs on a spawned task and every
/// outcome, including configuration and transport failures, arrives as
/// events ending in exactly one `done` or `error`.
pub trait LlmClient: Send + Sync {
    /// The wire format this adapter speaks.
    fn api(&self) -> Api;

    /// Start streaming one assistant message.
    fn stream(&self, model: &Model, context: &Context, options: StreamOptions) -> EventStream;
}
