// ABOUTME: Azure OpenAI responses adapter - endpoint, api-version, and deployment
// ABOUTME: resolution over the shared responses wire format.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use super::client::LlmClient;
use super::driver::{PreparedRequest, StreamRequest, spawn_stream};
use super::event_stream::EventStream;
use super::options::StreamOptions;
use super::responses::{self, ResponsesRequest, ResponsesWire};
use super::token::TokenProvider;
use super::{Api, Context, Model};
use crate::error::LlmError;

const DEFAULT_API_VERSION: &str = "v1";

/// Parse `model=deployment,model=deployment`. Malformed entries are skipped.
pub fn parse_deployment_map(value: &str) -> HashMap<String, String> {
    value
        .split(',')
        .filter_map(|entry| {
            let (model, deployment) = entry.trim().split_once('=')?;
            let (model, deployment) = (model.trim(), deployment.trim());
            (!model.is_empty() && !deployment.is_empty())
                .then(|| (model.to_string(), deployment.to_string()))
        })
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Endpoint settings. Unset fields fall back to the model at request time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AzureConfig {
    pub base_url: Option<String>,
    pub resource_name: Option<String>,
    pub api_version: Option<String>,
    pub deployment: Option<String>,
    pub deployment_map: HashMap<String, String>,
}

impl AzureConfig {
    /// Read `AZURE_OPENAI_BASE_URL`, `AZURE_OPENAI_RESOURCE_NAME`,
    /// `AZURE_OPENAI_API_VERSION`, and `AZURE_OPENAI_DEPLOYMENT_NAME_MAP`.
    pub fn from_env() -> Self {
        let var = |name: &str| non_empty(std::env::var(name).ok());
        Self {
            base_url: var("AZURE_OPENAI_BASE_URL"),
            resource_name: var("AZURE_OPENAI_RESOURCE_NAME"),
            api_version: var("AZURE_OPENAI_API_VERSION"),
            deployment: None,
            deployment_map: var("AZURE_OPENAI_DEPLOYMENT_NAME_MAP")
                .map(|v| parse_deployment_map(&v))
                .unwrap_or_default(),
        }
    }

    /// Resolve the base URL: explicit URL, resource name, then the model's.
    pub fn resolve_base_url(&self, model: &Model) -> Result<String, LlmError> {
        let base = non_empty(self.base_url.clone())
            .or_else(|| {
                non_empty(self.resource_name.clone())
                    .map(|name| format!("https://{name}.openai.azure.com/openai/v1"))
            })
            .or_else(|| non_empty(Some(model.base_url.clone())))
            .ok_or_else(|| {
                LlmError::Configuration(
                    "Azure OpenAI base URL is required. Set AZURE_OPENAI_BASE_URL or \
                     AZURE_OPENAI_RESOURCE_NAME, or configure a base URL on the client or model."
                        .to_string(),
                )
            })?;
        Ok(base.trim_end_matches('/').to_string())
    }

    pub fn resolve_api_version(&self) -> &str {
        self.api_version.as_deref().unwrap_or(DEFAULT_API_VERSION)
    }

    /// Resolve the deployment: explicit name, mapped model id, then the id.
    pub fn resolve_deployment<'a>(&'a self, model: &'a Model) -> &'a str {
        self.deployment
            .as_deref()
            .or_else(|| self.deployment_map.get(&model.id).map(String::as_str))
            .unwrap_or(model.id.as_str())
    }
}

/// Client for Azure-hosted responses deployments.
#[derive(Clone)]
pub struct AzureResponsesClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    config: AzureConfig,
}

impl AzureResponsesClient {
    /// Create a client with an empty configuration.
    pub fn new(tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            tokens,
            config: AzureConfig::default(),
        }
    }

    /// Create a client configured from the environment.
    pub fn from_env(tokens: Arc<dyn TokenProvider>) -> Self {
        Self::new(tokens).with_config(AzureConfig::from_env())
    }

    pub fn with_config(mut self, config: AzureConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = Some(base_url.into());
        self
    }

    pub fn with_resource_name(mut self, resource_name: impl Into<String>) -> Self {
        self.config.resource_name = Some(resource_name.into());
        self
    }

    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.config.api_version = Some(api_version.into());
        self
    }

    /// Send every model to this deployment.
    pub fn with_deployment(mut self, deployment: impl Into<String>) -> Self {
        self.config.deployment = Some(deployment.into());
        self
    }

    /// Map model ids to deployment names.
    pub fn with_deployment_map(mut self, map: HashMap<String, String>) -> Self {
        self.config.deployment_map = map;
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn config(&self) -> &AzureConfig {
        &self.config
    }

    /// Build the request body, applying Azure's reasoning quirk.
    pub fn build_request(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> ResponsesRequest {
        let deployment = self.config.resolve_deployment(model);
        let mut request = responses::build_request(model, context, options, deployment);

        // gpt-5 models reason by default; this developer message turns it off
        // when the caller asked for no reasoning.
        let no_reasoning_requested =
            options.reasoning_effort.is_none() && options.reasoning_summary.is_none();
        if model.reasoning
            && no_reasoning_requested
            && model.name.to_lowercase().starts_with("gpt-5")
        {
            request.input.push(json!({
                "role": "developer",
                "content": [{"type": "input_text", "text": "# Juice: 0 !important"}],
            }));
        }
        request
    }

    fn prepare(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<PreparedRequest, LlmError> {
        let base_url = self.config.resolve_base_url(model)?;
        let api_version = self.config.resolve_api_version();
        debug!(
            base_url = %base_url,
            api_version,
            deployment = self.config.resolve_deployment(model),
            "resolved Azure endpoint"
        );

        let body = serde_json::to_value(self.build_request(model, context, options))
            .map_err(|e| LlmError::Configuration(format!("failed to encode request: {e}")))?;
        Ok(PreparedRequest {
            url: format!("{base_url}/responses?api-version={api_version}"),
            body,
        })
    }
}

impl LlmClient for AzureResponsesClient {
    fn api(&self) -> Api {
        Api::AzureOpenaiResponses
    }

    fn stream(&self, model: &Model, context: &Context, options: StreamOptions) -> EventStream {
        let prepared = self.prepare(model, context, &options);
        spawn_stream(
            StreamRequest {
                http: self.http.clone(),
                tokens: self.tokens.clone(),
                model: model.clone(),
                options,
                wire: ResponsesWire::default(),
            },
            prepared,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::token::StaticToken;
    use crate::llm::{Message, ReasoningEffort};

    fn model() -> Model {
        Model::new(Api::AzureOpenaiResponses, "azure-openai", "gpt-5.2", "").name("GPT-5.2")
    }

    fn client() -> AzureResponsesClient {
        AzureResponsesClient::new(Arc::new(StaticToken::none()))
    }

    #[test]
    fn test_parse_deployment_map() {
        let map = parse_deployment_map(" gpt-5.2 = gpt-5.2-chat ,broken,=x,y=, gpt-4o=prod-4o,");
        assert_eq!(map.len(), 2);
        assert_eq!(map["gpt-5.2"], "gpt-5.2-chat");
        assert_eq!(map["gpt-4o"], "prod-4o");
    }

    #[test]
    fn test_base_url_precedence() {
        let model = model();
        let with_model_url = Model {
            base_url: "https://model.example/openai/v1/".into(),
            ..model.clone()
        };

        let err = AzureConfig::default().resolve_base_url(&model).unwrap_err();
        assert!(matches!(err, LlmError::Configuration(_)));

        assert_eq!(
            AzureConfig::default().resolve_base_url(&with_model_url).unwrap(),
            "https://model.example/openai/v1"
        );

        let config = AzureConfig {
            resource_name: Some("contoso".into()),
            ..Default::default()
        };
        assert_eq!(
            config.resolve_base_url(&with_model_url).unwrap(),
            "https://contoso.openai.azure.com/openai/v1"
        );

        let config = AzureConfig {
            base_url: Some("https://explicit.example/openai///".into()),
            resource_name: Some("contoso".into()),
            ..Default::default()
        };
        assert_eq!(
            config.resolve_base_url(&with_model_url).unwrap(),
            "https://explicit.example/openai"
        );
    }

    #[test]
    fn test_deployment_precedence() {
        let model = model();
        let mut config = AzureConfig::default();
        assert_eq!(config.resolve_deployment(&model), "gpt-5.2");

        config.deployment_map = parse_deployment_map("gpt-5.2=gpt-5.2-chat");
        assert_eq!(config.resolve_deployment(&model), "gpt-5.2-chat");

        config.deployment = Some("pinned".into());
        assert_eq!(config.resolve_deployment(&model), "pinned");
    }

    #[test]
    fn test_prepare_url() {
        let prepared = client()
            .with_base_url("https://res.example/openai/v1/")
            .with_api_version("2025-03-01-preview")
            .prepare(&model(), &Context::new(), &StreamOptions::new())
            .unwrap();
        assert_eq!(
            prepared.url,
            "https://res.example/openai/v1/responses?api-version=2025-03-01-preview"
        );
        assert_eq!(prepared.body["model"], "gpt-5.2");

        let prepared = client()
            .with_resource_name("contoso")
            .prepare(&model(), &Context::new(), &StreamOptions::new())
            .unwrap();
        assert_eq!(
            prepared.url,
            "https://contoso.openai.azure.com/openai/v1/responses?api-version=v1"
        );
    }

    #[test]
    fn test_reasoning_off_developer_message() {
        let model = model().reasoning(true);
        let context = Context::new().message(Message::user("hi"));

        let request = client().build_request(&model, &context, &StreamOptions::new());
        let last = request.input.last().unwrap();
        assert_eq!(last["role"], "developer");
        assert_eq!(last["content"][0]["text"], "# Juice: 0 !important");

        let request = client().build_request(
            &model,
            &context,
            &StreamOptions::new().reasoning_effort(ReasoningEffort::Low),
        );
        assert_eq!(request.input.len(), 1);
        assert!(request.reasoning.is_some());

        let request = client().build_request(&model.clone().reasoning(false), &context, &StreamOptions::new());
        assert_eq!(request.input.len(), 1);

        let request = client().build_request(&model.name("o3"), &context, &StreamOptions::new());
        assert_eq!(request.input.len(), 1);
    }

    #[test]
    fn test_builtin_model_sends_plain_system_prompt() {
        let model = crate::llm::get_model("azure-openai", "gpt-5.2").unwrap();
        let context = Context::new().system("sys").message(Message::user("hi"));

        let request = client().build_request(&model, &context, &StreamOptions::new());
        assert_eq!(request.input.len(), 2);
        assert_eq!(request.input[0]["role"], "system");
        assert!(request.input.iter().all(|item| item["role"] != "developer"));
        assert!(request.reasoning.is_none());
    }
}
