//! Interactive chat REPL driving the tool loop.
//!
//! Usage:
//!   OPENAI_API_KEY=sk-... cargo run --example chat -- --model gpt-4o
//!   cargo run --example chat -- --base-url http://localhost:8000 --model qwen2.5
//!   GEMINI_API_KEY=... cargo run --example chat -- --provider gemini --model gemini-2.0-flash
//!
//! Conversations persist under `--store` per user and world. Ctrl-C cancels
//! the running turn; type "exit" / "quit" to leave.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use toolloop::{
    spawn_persister, AccessLevel, Caller, ConversationEngine, ConversationKey, EngineConfig,
    FileStore, GeminiProvider, InferenceProvider, OpenAiProvider, Permission, RegisterOptions,
    Tool, ToolRegistry, TurnEvent, TurnOptions, TurnStatus,
};

#[derive(Parser)]
#[command(name = "chat", about = "Chat with a tool-using model")]
struct Cli {
    /// Provider: "openai" or "gemini"
    #[arg(long, default_value = "openai")]
    provider: String,

    /// Model to use
    #[arg(long, default_value = "gpt-4o-mini")]
    model: String,

    /// System prompt
    #[arg(long, short = 's')]
    system: Option<String>,

    /// Max output tokens per request
    #[arg(long, default_value_t = 4096)]
    max_tokens: u32,

    /// Token budget for the conversation window
    #[arg(long, default_value_t = 32_000)]
    context_window: u32,

    /// API base URL (defaults depend on provider)
    #[arg(long)]
    base_url: Option<String>,

    /// Directory for saved conversations
    #[arg(long, default_value = ".toolloop")]
    store: String,

    #[arg(long, default_value = "local")]
    user: String,

    #[arg(long, default_value = "default")]
    world: String,
}

fn build_provider(cli: &Cli) -> Box<dyn InferenceProvider> {
    match cli.provider.as_str() {
        "openai" => {
            let base = cli
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".into());
            let mut p = OpenAiProvider::new(base);
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                p = p.with_api_key(key);
            }
            Box::new(p)
        }
        "gemini" => {
            let api_key = std::env::var("GEMINI_API_KEY").unwrap_or_else(|_| {
                eprintln!("error: GEMINI_API_KEY not set");
                std::process::exit(1);
            });
            let mut p = GeminiProvider::new(api_key);
            if let Some(ref url) = cli.base_url {
                p = p.with_base_url(url.clone());
            }
            Box::new(p)
        }
        other => {
            eprintln!("error: unknown provider '{other}'. Use 'openai' or 'gemini'.");
            std::process::exit(1);
        }
    }
}

// --- Sample tools ---

struct CurrentTime;

#[async_trait]
impl Tool for CurrentTime {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Current date and time in UTC"
    }

    async fn execute(&self, _args: &Value) -> Result<Value, String> {
        Ok(json!({ "utc": chrono::Utc::now().to_rfc3339() }))
    }
}

#[derive(Default)]
struct Notes {
    entries: Mutex<Vec<String>>,
}

#[async_trait]
impl Tool for Notes {
    fn name(&self) -> &str {
        "notes"
    }

    fn description(&self) -> &str {
        "Keep short notes. action \"add\" stores text, action \"list\" returns all notes."
    }

    fn schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "action": {"type": "string", "enum": ["add", "list"]},
                "text": {"type": "string"}
            },
            "required": ["action"]
        }))
    }

    async fn execute(&self, args: &Value) -> Result<Value, String> {
        let mut entries = self.entries.lock().await;
        match args["action"].as_str() {
            Some("add") => {
                let text = args["text"]
                    .as_str()
                    .filter(|t| !t.trim().is_empty())
                    .ok_or("text is required for add")?;
                entries.push(text.to_string());
                Ok(json!({ "stored": entries.len() }))
            }
            Some("list") => Ok(json!({ "notes": *entries })),
            other => Ok(json!({ "error": format!("unknown action {other:?}") })),
        }
    }
}

fn clip(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max).collect::<String>())
    } else {
        text.to_string()
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::new(&cli.model).with_max_output_tokens(cli.max_tokens);
    config.compaction = config.compaction.clone().with_max_tokens(cli.context_window);
    if let Some(ref sys) = cli.system {
        config = config.with_system_prompt(sys.clone());
    }
    // Persistence
    let store = Arc::new(FileStore::new(&cli.store));
    let key = ConversationKey::new(&cli.user, &cli.world);
    let mut engine =
        ConversationEngine::with_retries(build_provider(&cli), ToolRegistry::new(), config);

    let registered = engine
        .register_tool(CurrentTime, RegisterOptions::new().category("utility"))
        .and_then(|_| {
            engine.register_tool(
                Notes::default(),
                RegisterOptions::new()
                    .category("memory")
                    .requires(Permission::Write)
                    .tag("notes"),
            )
        });
    if let Err(e) = registered {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    match engine.load(store.as_ref(), &key).await {
        Ok(true) => eprintln!(
            "resumed {key} ({} messages)",
            engine.conversation().active_messages().len()
        ),
        Ok(false) => {}
        Err(e) => eprintln!("\x1b[1;31mwarning:\x1b[0m could not load {key}: {e}"),
    }
    let (hook, persister) = spawn_persister(store, key.clone());
    engine = engine.with_state_hook(hook);

    // Header
    eprintln!("toolloop chat");
    eprintln!("provider: {}", cli.provider);
    eprintln!("model: {}", cli.model);
    eprintln!("conversation: {key}");
    if let Some(ref sys) = cli.system {
        eprintln!("system: {sys}");
    }
    eprintln!("---");

    let caller = Caller::new(&cli.user, AccessLevel::Member);
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        eprint!("\x1b[1;36myou>\x1b[0m ");
        io::stderr().flush().ok();

        let line = match lines.next() {
            Some(Ok(line)) => line,
            _ => break,
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if matches!(trimmed, "exit" | "quit" | "/q") {
            break;
        }

        let (tx, mut rx) = tokio::sync::mpsc::channel::<TurnEvent>(64);

        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    TurnEvent::AssistantMessage { content } => {
                        eprint!("\x1b[1;32magent>\x1b[0m ");
                        println!("{content}");
                    }
                    TurnEvent::ToolCall { name, arguments, .. } => {
                        eprintln!("\x1b[33m  [tool: {name}]\x1b[0m {arguments}");
                    }
                    TurnEvent::ToolResult {
                        name,
                        output,
                        is_error,
                        ..
                    } => {
                        let tag = if is_error { "error" } else { "result" };
                        eprintln!("\x1b[33m  [{tag}: {name}]\x1b[0m {}", clip(&output, 200));
                    }
                    TurnEvent::Correction { reason } => {
                        eprintln!("\x1b[2m  [retrying: {reason}]\x1b[0m");
                    }
                    TurnEvent::Compacted {
                        pre_tokens,
                        post_tokens,
                    } => {
                        eprintln!(
                            "\x1b[35m  [compacted: {pre_tokens} -> {post_tokens} tokens]\x1b[0m"
                        );
                    }
                    TurnEvent::Finished { status, iterations } => {
                        if status != TurnStatus::Completed || iterations > 1 {
                            eprintln!("\x1b[2m  ({status:?}, {iterations} tool rounds)\x1b[0m");
                        }
                    }
                }
            }
        });

        let canceller = engine.canceller();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                canceller.cancel_current();
            }
        });

        let result = engine
            .process_turn(trimmed, TurnOptions::new(caller.clone()).with_events(tx))
            .await;
        interrupt.abort();
        printer.await.ok();

        match result {
            Ok(outcome) => {
                eprintln!(
                    "\x1b[2m  [{}in / {}out tokens, context {}]\x1b[0m",
                    outcome.usage.prompt_tokens,
                    outcome.usage.completion_tokens,
                    engine.conversation().session_tokens()
                );
            }
            Err(e) => eprintln!("\x1b[1;31merror:\x1b[0m {e}"),
        }
    }

    drop(engine);
    persister.await.ok();
    eprintln!("bye.");
}
