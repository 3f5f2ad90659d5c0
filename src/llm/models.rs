// ABOUTME: Built-in model catalog and cost derivation from per-million-token
// ABOUTME: rates.

use super::{Api, Cost, Model, ModelCost, Usage};

/// Provider id for Azure-hosted models.
pub const AZURE_PROVIDER: &str = "azure-openai";
/// Provider id for OpenAI-hosted models.
pub const OPENAI_PROVIDER: &str = "openai";

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Every model this crate knows about out of the box.
///
/// Azure entries carry no base URL; it is resolved from the client
/// configuration or the environment at request time.
pub fn builtin_models() -> Vec<Model> {
    vec![
        Model::new(Api::AzureOpenaiResponses, AZURE_PROVIDER, "gpt-5.2", "").name("GPT-5.2"),
        Model::new(Api::OpenaiCompletions, OPENAI_PROVIDER, "gpt-4o", OPENAI_BASE_URL)
            .name("GPT-4o")
            .cost(ModelCost {
                input: 2.5,
                output: 10.0,
                cache_read: 1.25,
                cache_write: 0.0,
            }),
        Model::new(
            Api::OpenaiCompletions,
            OPENAI_PROVIDER,
            "gpt-4o-mini",
            OPENAI_BASE_URL,
        )
        .name("GPT-4o mini")
        .cost(ModelCost {
            input: 0.15,
            output: 0.6,
            cache_read: 0.075,
            cache_write: 0.0,
        }),
        Model::new(Api::OpenaiCompletions, OPENAI_PROVIDER, "o4-mini", OPENAI_BASE_URL)
            .name("o4-mini")
            .reasoning(true)
            .cost(ModelCost {
                input: 1.1,
                output: 4.4,
                cache_read: 0.275,
                cache_write: 0.0,
            }),
    ]
}

/// Look up a built-in model by provider and id.
pub fn get_model(provider: &str, id: &str) -> Option<Model> {
    builtin_models()
        .into_iter()
        .find(|m| m.provider == provider && m.id == id)
}

/// Recompute `usage.cost` from the model's rates and return it.
///
/// Each component is clamped to be non-negative.
pub fn calculate_cost(model: &Model, usage: &mut Usage) -> Cost {
    let per_token = |rate: f64, tokens: u64| (rate / 1_000_000.0 * tokens as f64).max(0.0);

    let mut cost = Cost {
        input: per_token(model.cost.input, usage.input),
        output: per_token(model.cost.output, usage.output),
        cache_read: per_token(model.cost.cache_read, usage.cache_read),
        cache_write: per_token(model.cost.cache_write, usage.cache_write),
        total: 0.0,
    };
    cost.total = cost.input + cost.output + cost.cache_read + cost.cache_write;

    usage.cost = cost;
    cost
}
