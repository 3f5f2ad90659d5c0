// ABOUTME: Interactive chat REPL streaming through llm-relay's adapters.
// ABOUTME: Prints text, thinking, and tool calls live; Ctrl-C aborts the turn.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use clap::{Parser, ValueEnum};
use futures::StreamExt;
use rustyline::DefaultEditor;
use serde_json::json;

use llm_relay::llm::token::EnvToken;
use llm_relay::prelude::*;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Provider {
    Openai,
    Azure,
}

#[derive(Debug, Parser)]
#[command(name = "relay-chat", about = "Chat with a model through llm-relay")]
struct Args {
    /// Which adapter to talk to.
    #[arg(long, env = "RELAY_PROVIDER", value_enum, default_value = "openai")]
    provider: Provider,

    /// Model id; defaults to the provider's built-in model.
    #[arg(long, env = "RELAY_MODEL")]
    model: Option<String>,

    #[arg(long)]
    system: Option<String>,

    #[arg(long, value_parser = parse_effort)]
    reasoning: Option<ReasoningEffort>,

    /// Hide reasoning output.
    #[arg(long)]
    quiet_thinking: bool,
}

fn parse_effort(value: &str) -> Result<ReasoningEffort, String> {
    serde_json::from_value(json!(value)).map_err(|_| format!("unknown reasoning effort: {value}"))
}

fn build(args: &Args) -> Result<(Arc<dyn LlmClient>, Model), RelayError> {
    match args.provider {
        Provider::Openai => {
            let id = args.model.as_deref().unwrap_or("gpt-4o-mini");
            let model = get_model("openai", id).unwrap_or_else(|| {
                Model::new(Api::OpenaiCompletions, "openai", id, "https://api.openai.com/v1")
            });
            Ok((Arc::new(OpenAICompletionsClient::from_env()?), model))
        }
        Provider::Azure => {
            let id = args.model.as_deref().unwrap_or("gpt-5.2");
            let model = get_model("azure-openai", id)
                .unwrap_or_else(|| Model::new(Api::AzureOpenaiResponses, "azure-openai", id, ""));
            let client = AzureResponsesClient::from_env(Arc::new(EnvToken::new("AZURE_OPENAI_API_KEY")));
            Ok((Arc::new(client), model))
        }
    }
}

fn double_number_tool() -> Tool {
    Tool::new(
        "double_number",
        "Double a number",
        json!({
            "type": "object",
            "properties": {"value": {"type": "number"}},
            "required": ["value"]
        }),
    )
}

fn run_tool(call: &ToolCall) -> Message {
    match call.name.as_str() {
        "double_number" => match call.arguments.get("value").and_then(|v| v.as_f64()) {
            Some(value) => Message::tool_result(&call.id, &call.name, (value * 2.0).to_string()),
            None => Message::tool_error(&call.id, &call.name, "missing numeric 'value'"),
        },
        other => Message::tool_error(&call.id, &call.name, format!("Tool not found: {other}")),
    }
}

/// Stream one assistant turn to stdout. Ctrl-C aborts it.
async fn stream_turn(
    client: &dyn LlmClient,
    model: &Model,
    context: &Context,
    args: &Args,
) -> Result<AssistantMessage> {
    let controller = AbortController::new();
    let mut options = StreamOptions::new().signal(controller.signal());
    if let Some(effort) = args.reasoning {
        options = options.reasoning_effort(effort);
    }

    let mut stream = client.stream(model, context, options);
    let mut stdout = std::io::stdout();
    let mut interrupted = false;

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                controller.abort();
                continue;
            }
            event = stream.next() => event,
        };
        let Some(event) = event else {
            return Err(anyhow!("stream ended without a result"));
        };

        match &event {
            AssistantMessageEvent::ThinkingStart { .. } if !args.quiet_thinking => {
                print!("\x1b[2m");
            }
            AssistantMessageEvent::ThinkingDelta { delta, .. } if !args.quiet_thinking => {
                print!("{delta}");
            }
            AssistantMessageEvent::ThinkingEnd { .. } if !args.quiet_thinking => {
                print!("\x1b[0m\n\n");
            }
            AssistantMessageEvent::TextDelta { delta, .. } => print!("{delta}"),
            AssistantMessageEvent::TextEnd { .. } => println!(),
            AssistantMessageEvent::ToolcallEnd { tool_call, .. } => {
                println!(
                    "[calling {}({})]",
                    tool_call.name,
                    serde_json::Value::Object(tool_call.arguments.clone())
                );
            }
            _ => {}
        }
        stdout.flush()?;

        if let Some(message) = event.into_terminal_message() {
            return Ok(message);
        }
    }
}

async fn run_repl(args: Args) -> Result<()> {
    let (client, model) = build(&args)?;
    let mut context = Context::new().tool(double_number_tool());
    if let Some(system) = &args.system {
        context = context.system(system.clone());
    }
    let mut rl = DefaultEditor::new()?;
    let mut total = Usage::default();

    println!("relay-chat - {} via {}. Type 'quit' to exit.\n", model.id, model.api);

    loop {
        let line = match rl.readline("> ") {
            Ok(line) => line,
            Err(_) => break,
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }

        let _ = rl.add_history_entry(line);
        context.messages.push(Message::user(line));

        // Keep going until the model stops asking for tools.
        loop {
            let message = stream_turn(client.as_ref(), &model, &context, &args).await?;
            total.add(&message.usage);
            total.cost.total += message.usage.cost.total;

            match message.stop_reason {
                StopReason::Aborted => println!("\n[aborted]"),
                StopReason::Error => println!(
                    "\n[error: {}]",
                    message.error_message.as_deref().unwrap_or("unknown")
                ),
                StopReason::Length => println!("\n[truncated at max tokens]"),
                _ => {}
            }

            let calls: Vec<ToolCall> = message.tool_calls().into_iter().cloned().collect();
            let wants_tools = message.stop_reason == StopReason::ToolUse;
            context.messages.push(message.into());
            if !wants_tools {
                break;
            }
            context.messages.extend(calls.iter().map(run_tool));
        }
    }

    println!(
        "\n{} tokens in, {} out, ${:.4}",
        total.input + total.cache_read,
        total.output,
        total.cost.total
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::debug!(?args, "starting relay-chat");
    run_repl(args).await
}
