//! Parley gateway binary: CLI parsing, tracing setup, and server bootstrap.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use parley_ai::{OpenAiClient, OpenAiConfig, DEFAULT_OPENAI_API_BASE};
use parley_gateway::{run_gateway_server, GatewayServerConfig, SaveQuizTool};
use parley_relay::{ToolRegistry, TurnConfig};
use parley_session::JsonlConversationStore;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "parley-gateway",
    about = "Streaming chat relay with tool-call dispatch",
    version
)]
struct Cli {
    #[arg(
        long,
        default_value = "127.0.0.1:8484",
        help = "Address the HTTP server binds to"
    )]
    bind: String,

    #[arg(
        long,
        env = "PARLEY_STATE_DIR",
        default_value = ".parley",
        help = "Directory holding conversations and saved quizzes"
    )]
    state_dir: PathBuf,

    #[arg(
        long,
        env = "PARLEY_MODEL",
        default_value = "gpt-4o-mini",
        help = "Upstream chat model"
    )]
    model: String,

    #[arg(
        long,
        env = "PARLEY_API_BASE",
        default_value = DEFAULT_OPENAI_API_BASE,
        help = "Base URL for the OpenAI-compatible API"
    )]
    api_base: String,

    #[arg(
        long,
        env = "OPENAI_API_KEY",
        hide_env_values = true,
        help = "API key for the upstream provider"
    )]
    api_key: String,

    #[arg(
        long,
        env = "PARLEY_SYSTEM_PROMPT",
        default_value = "",
        help = "System prompt prepended to every conversation"
    )]
    system_prompt: String,

    #[arg(long, help = "Sampling temperature forwarded to the provider")]
    temperature: Option<f32>,

    #[arg(long, help = "Completion token cap forwarded to the provider")]
    max_tokens: Option<u32>,

    #[arg(
        long,
        default_value_t = 30_000,
        help = "Per-read stall timeout for the upstream stream, in milliseconds"
    )]
    stream_read_timeout_ms: u64,

    #[arg(
        long,
        default_value_t = 120_000,
        help = "Per-tool execution timeout in milliseconds (0 disables it)"
    )]
    tool_timeout_ms: u64,

    #[arg(long, help = "Cap on the number of history turns seeded into each request")]
    history_limit: Option<usize>,
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let client = OpenAiClient::new(OpenAiConfig {
        api_base: cli.api_base,
        api_key: cli.api_key,
        ..OpenAiConfig::default()
    })?;

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(SaveQuizTool::new(&cli.state_dir)));

    let store = JsonlConversationStore::new(&cli.state_dir);

    let turn = TurnConfig {
        model: cli.model,
        system_prompt: cli.system_prompt,
        temperature: cli.temperature,
        max_tokens: cli.max_tokens,
        stream_read_timeout_ms: cli.stream_read_timeout_ms,
        tool_timeout_ms: (cli.tool_timeout_ms > 0).then_some(cli.tool_timeout_ms),
        history_limit: cli.history_limit,
    };

    run_gateway_server(GatewayServerConfig {
        client: Arc::new(client),
        registry: Arc::new(registry),
        store: Arc::new(store),
        turn,
        state_dir: cli.state_dir,
        bind: cli.bind,
    })
    .await
}
