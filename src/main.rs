use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use flowchat_core::config::{AppConfig, ChatConfig, ModelConfig};
use flowchat_core::traits::{EmbeddingProvider, KnowledgeBase, Transport};
use flowchat_core::transport::{ChannelTransport, NullTransport};
use flowchat_core::types::{BillSource, ChatId, ChatMessage, StreamEvent};

use flowchat_flow::service::DONE_MARKER;
use flowchat_flow::{
    AppDefinition, BuiltinDeps, ChatRequest, ChatService, ExecutorRegistry, FlowDispatcher,
    ModuleDefinition,
};
use flowchat_store::{HttpEmbeddingProvider, SqliteStore};

/// Texts per embedding request during knowledge-base import.
const IMPORT_BATCH: usize = 32;

#[derive(Parser)]
#[command(name = "flowchat", version, about = "Run chat apps built from module flows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowchat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one chat turn through a flow
    Run {
        /// App or module-list JSON file
        #[arg(long)]
        flow: PathBuf,
        /// Chat to continue, or "new" to start one. Without it nothing is saved.
        #[arg(long)]
        chat: Option<String>,
        /// Flow variable as key=value (repeatable)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
        /// Stream the answer as it is generated
        #[arg(long)]
        stream: bool,
        /// The question (read from stdin when empty)
        #[arg(trailing_var_arg = true)]
        question: Vec<String>,
    },
    /// Print a stored chat transcript
    History {
        chat_id: String,
    },
    /// Manage knowledge bases
    Kb {
        #[command(subcommand)]
        action: KbAction,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum KbAction {
    /// Embed and store question/answer pairs from a JSON file
    Import {
        kb_id: String,
        /// JSON array of {q, a, source}
        file: PathBuf,
    },
}

/// Flow files hold either a full app or a bare module list.
#[derive(Deserialize)]
#[serde(untagged)]
enum FlowFile {
    App(AppDefinition),
    Modules(Vec<ModuleDefinition>),
}

#[derive(Deserialize)]
struct ImportItem {
    q: String,
    #[serde(default)]
    a: String,
    #[serde(default)]
    source: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowchat=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        // Completions need no config
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "flowchat", &mut io::stdout());
        }
        Commands::Config => {
            let config = load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config.redacted())?);
        }
        Commands::Run {
            flow,
            chat,
            vars,
            stream,
            question,
        } => {
            let question = if question.is_empty() {
                io::stdin()
                    .lock()
                    .lines()
                    .map_while(|l| l.ok())
                    .collect::<Vec<_>>()
                    .join("\n")
            } else {
                question.join(" ")
            };
            let config = load_config(&cli.config)?;
            run_chat(&config, &flow, chat, &vars, stream, question).await?;
        }
        Commands::History { chat_id } => {
            let config = load_config(&cli.config)?;
            let store = SqliteStore::open(&config.database_path())?;
            let records = store.chat_records(&ChatId::from_string(&chat_id))?;
            if records.is_empty() {
                bail!("No messages stored for chat {chat_id}");
            }
            for record in records {
                println!("[{}] {}", record.message.role.as_str(), record.message.content);
                for trace in &record.response_data {
                    println!(
                        "    · {} ({} tokens, {:.4})",
                        trace.module_name, trace.tokens, trace.price
                    );
                }
            }
        }
        Commands::Kb {
            action: KbAction::Import { kb_id, file },
        } => {
            let config = load_config(&cli.config)?;
            import_quotes(&config, &kb_id, &file).await?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }

    let home_config = dirs_home().map(|h| h.join(".flowchat").join("config.toml"));
    if let Some(path) = home_config.filter(|p| p.exists()) {
        info!(path = %path.display(), "Loading config from home directory");
        return Ok(AppConfig::load(&path)?);
    }

    eprintln!("Warning: No config file found. Set OPENAI_API_KEY or create flowchat.toml");
    Ok(create_env_config())
}

/// Minimal config from the environment, falling back to a local Ollama.
fn create_env_config() -> AppConfig {
    let api_key = std::env::var("OPENAI_API_KEY").ok();
    let (provider, model_id, base_url) = match api_key {
        Some(_) => ("openai", "gpt-4o-mini", std::env::var("OPENAI_BASE_URL").ok()),
        None => ("ollama", "llama3.2", Some("http://localhost:11434/v1".to_string())),
    };

    AppConfig {
        workspace: "~/.flowchat".to_string(),
        model: ModelConfig {
            provider: provider.to_string(),
            model_id: std::env::var("FLOWCHAT_MODEL").unwrap_or_else(|_| model_id.to_string()),
            api_key,
            base_url,
            max_tokens: 4000,
            temperature: 0.0,
            price_per_1k: 0.0,
        },
        embedding: None,
        chat: ChatConfig::default(),
    }
}

/// Parse `key=value` flags. Values that parse as JSON keep their type.
fn parse_vars(vars: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut map = Map::new();
    for var in vars {
        let Some((key, raw)) = var.split_once('=') else {
            bail!("Invalid --var {var:?}, expected KEY=VALUE");
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.trim().to_string(), value);
    }
    Ok(map)
}

fn read_app(path: &Path) -> anyhow::Result<AppDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read flow file {}", path.display()))?;
    let app = match serde_json::from_str(&content)
        .with_context(|| format!("Invalid flow file {}", path.display()))?
    {
        FlowFile::App(app) => app,
        FlowFile::Modules(modules) => {
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "flow".to_string());
            AppDefinition {
                id: name.clone(),
                name,
                modules,
            }
        }
    };
    Ok(app)
}

fn embedding_provider(config: &AppConfig) -> Option<Arc<dyn EmbeddingProvider>> {
    config
        .embedding
        .as_ref()
        .map(|e| Arc::new(HttpEmbeddingProvider::new(e)) as Arc<dyn EmbeddingProvider>)
}

async fn run_chat(
    config: &AppConfig,
    flow: &Path,
    chat: Option<String>,
    vars: &[String],
    stream: bool,
    question: String,
) -> anyhow::Result<()> {
    let app = read_app(flow)?;
    let variables = parse_vars(vars)?;
    let store = Arc::new(SqliteStore::open(&config.database_path())?);

    let registry = ExecutorRegistry::with_builtins(BuiltinDeps {
        llm: flowchat_llm::create_client(&config.model),
        model: config.model.clone(),
        embeddings: embedding_provider(config),
        knowledge_base: Some(store.clone() as Arc<dyn KnowledgeBase>),
        history_context: config.chat.default_history_context,
    });
    let service = ChatService::new(FlowDispatcher::new(Arc::new(registry)))
        .with_store(store.clone())
        .with_billing(store)
        .with_max_history(config.chat.max_history);

    let request = ChatRequest {
        chat_id: chat.map(|c| if c == "new" { String::new() } else { c }),
        app,
        messages: vec![ChatMessage::user(question)],
        variables,
        stream,
        source: BillSource::Api,
    };

    let (transport, printer) = if stream {
        let (transport, mut rx) = ChannelTransport::new();
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::Answer(text) if text == DONE_MARKER => println!(),
                    StreamEvent::Answer(text) => {
                        print!("{}", text);
                        io::stdout().flush().ok();
                    }
                    StreamEvent::AppStreamResponse(_) => {}
                    StreamEvent::Error(e) => eprintln!("\n[error: {}]", e),
                }
            }
        });
        (Arc::new(transport) as Arc<dyn Transport>, Some(printer))
    } else {
        (Arc::new(NullTransport) as Arc<dyn Transport>, None)
    };

    let result = service.complete(request, transport.clone()).await;

    // The printer ends once every sender is gone
    drop(transport);
    if let Some(printer) = printer {
        printer.await.ok();
    }

    let response = result?;
    if !stream {
        println!("{}", response.answer_text);
    }
    println!("{}", serde_json::to_string_pretty(&response.response_data)?);
    if let Some(chat_id) = &response.chat_id {
        eprintln!("chat: {}", chat_id);
    }

    Ok(())
}

async fn import_quotes(config: &AppConfig, kb_id: &str, file: &Path) -> anyhow::Result<()> {
    let Some(embeddings) = embedding_provider(config) else {
        bail!("No [embedding] section in config; it is required to import quotes");
    };
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let items: Vec<ImportItem> = serde_json::from_str(&content)
        .with_context(|| format!("Expected a JSON array of {{q, a, source}} in {}", file.display()))?;

    let store = SqliteStore::open(&config.database_path())?;
    let mut imported = 0usize;
    let mut tokens = 0u64;

    for batch in items.chunks(IMPORT_BATCH) {
        let texts = batch
            .iter()
            .map(|item| format!("{}\n{}", item.q, item.a).trim().to_string())
            .collect();
        let embedded = embeddings.embed(texts).await?;
        tokens += embedded.tokens;
        for (item, vector) in batch.iter().zip(&embedded.vectors) {
            store.add_quote(kb_id, &item.q, &item.a, &item.source, vector)?;
            imported += 1;
        }
    }

    info!(kb_id, imported, tokens, "Knowledge base import complete");
    println!(
        "Imported {} entries into {} ({} total)",
        imported,
        kb_id,
        store.quote_count(kb_id)?
    );
    Ok(())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
