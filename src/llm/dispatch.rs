// ABOUTME: Resolves a stream to its final message and routes models to the
// ABOUTME: adapter registered for their wire format.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::warn;

use super::client::LlmClient;
use super::event_stream::{AssistantMessageEvent, EventStream, event_channel};
use super::options::StreamOptions;
use super::stream_accumulator::{Completion, StreamAccumulator};
use super::{Api, AssistantMessage, Context, Model, StopReason};
use crate::error::LlmError;

/// Drive `client` to completion and return the terminal message.
///
/// Failures resolve to a message with `stop_reason` `Error` or `Aborted`
/// rather than an `Err`.
pub async fn complete(
    client: &dyn LlmClient,
    model: &Model,
    context: &Context,
    options: StreamOptions,
) -> AssistantMessage {
    resolve(model, client.stream(model, context, options)).await
}

async fn resolve(model: &Model, stream: EventStream) -> AssistantMessage {
    match stream.result().await {
        Ok(message) => message,
        Err(err) => {
            warn!(model = %model.id, error = %err, "stream closed without a terminal event");
            let mut message = AssistantMessage::empty(model);
            message.stop_reason = StopReason::Error;
            message.error_message = Some(err.to_string());
            message
        }
    }
}

/// Maps each wire format to the adapter serving it.
#[derive(Default)]
pub struct ProviderRegistry {
    clients: RwLock<HashMap<Api, Arc<dyn LlmClient>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client` for its wire format, replacing any previous one.
    pub fn register(&self, client: Arc<dyn LlmClient>) {
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        clients.insert(client.api(), client);
    }

    /// The adapter registered for `api`.
    pub fn get(&self, api: Api) -> Option<Arc<dyn LlmClient>> {
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        clients.get(&api).cloned()
    }

    /// All registered wire formats.
    pub fn apis(&self) -> Vec<Api> {
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        clients.keys().copied().collect()
    }

    /// Stream through the adapter for `model.api`.
    ///
    /// With no adapter registered, the stream holds `start` then an `error`.
    pub fn stream(&self, model: &Model, context: &Context, options: StreamOptions) -> EventStream {
        match self.get(model.api) {
            Some(client) => client.stream(model, context, options),
            None => unsupported(model),
        }
    }

    /// Stream through the registry and return the terminal message.
    pub async fn complete(
        &self,
        model: &Model,
        context: &Context,
        options: StreamOptions,
    ) -> AssistantMessage {
        resolve(model, self.stream(model, context, options)).await
    }
}

fn unsupported(model: &Model) -> EventStream {
    let acc = StreamAccumulator::new(model);
    let err = LlmError::Configuration(format!("no provider registered for api '{}'", model.api));

    let mut events: Vec<AssistantMessageEvent> = vec![acc.start_event()];
    events.extend(acc.finish(Completion::from(&err)));

    let (mut sender, stream) = event_channel();
    tokio::spawn(async move {
        sender.push_all(events).await;
        sender.end();
    });
    stream
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replays a fixed list of events.
    struct ScriptedClient {
        api: Api,
        script: Vec<AssistantMessageEvent>,
    }

    impl LlmClient for ScriptedClient {
        fn api(&self) -> Api {
            self.api
        }

        fn stream(&self, _model: &Model, _context: &Context, _options: StreamOptions) -> EventStream {
            let events = self.script.clone();
            let (mut sender, stream) = event_channel();
            tokio::spawn(async move {
                sender.push_all(events).await;
                sender.end();
            });
            stream
        }
    }

    fn model() -> Model {
        Model::new(Api::OpenaiCompletions, "openai", "gpt-4o", "http://localhost")
    }

    fn scripted(script: Vec<AssistantMessageEvent>) -> ScriptedClient {
        ScriptedClient {
            api: Api::OpenaiCompletions,
            script,
        }
    }

    #[tokio::test]
    async fn test_complete_returns_done_message() {
        let model = model();
        let mut acc = StreamAccumulator::new(&model);
        let mut script = vec![acc.start_event()];
        script.extend(acc.text_delta("hello"));
        script.extend(acc.finish(Completion::Stop));

        let message = complete(&scripted(script), &model, &Context::new(), StreamOptions::new()).await;
        assert_eq!(message.stop_reason, StopReason::Stop);
        assert_eq!(message.text(), "hello");
    }

    #[tokio::test]
    async fn test_complete_resolves_error_as_value() {
        let model = model();
        let acc = StreamAccumulator::new(&model);
        let mut script = vec![acc.start_event()];
        script.extend(acc.finish(Completion::Failed("HTTP error 500".into())));

        let message = complete(&scripted(script), &model, &Context::new(), StreamOptions::new()).await;
        assert_eq!(message.stop_reason, StopReason::Error);
        assert_eq!(message.error_message.as_deref(), Some("HTTP error 500"));
    }

    #[tokio::test]
    async fn test_complete_synthesizes_error_without_terminal() {
        let model = model();
        let acc = StreamAccumulator::new(&model);
        let script = vec![acc.start_event()];

        let message = complete(&scripted(script), &model, &Context::new(), StreamOptions::new()).await;
        assert_eq!(message.stop_reason, StopReason::Error);
        assert_eq!(
            message.error_message.as_deref(),
            Some("Stream closed unexpectedly")
        );
    }

    #[tokio::test]
    async fn test_registry_routes_by_api() {
        let model = model();
        let mut acc = StreamAccumulator::new(&model);
        let mut script = vec![acc.start_event()];
        script.extend(acc.text_delta("routed"));
        script.extend(acc.finish(Completion::Stop));

        let registry = ProviderRegistry::new();
        assert!(registry.get(Api::OpenaiCompletions).is_none());
        registry.register(Arc::new(scripted(script)));
        assert_eq!(registry.apis(), vec![Api::OpenaiCompletions]);

        let message = registry
            .complete(&model, &Context::new(), StreamOptions::new())
            .await;
        assert_eq!(message.text(), "routed");
    }

    #[tokio::test]
    async fn test_registry_unsupported_api() {
        let registry = ProviderRegistry::new();
        let model = Model::new(Api::AzureOpenaiResponses, "azure-openai", "gpt-5.2", "");

        let mut kinds = Vec::new();
        let message = registry
            .stream(&model, &Context::new(), StreamOptions::new())
            .for_each_event(|e| kinds.push(e.kind()))
            .await
            .unwrap();
        assert_eq!(kinds, vec!["start", "error"]);
        assert_eq!(message.stop_reason, StopReason::Error);
        assert!(message
            .error_message
            .unwrap()
            .contains("no provider registered for api 'azure-openai-responses'"));
    }
}
