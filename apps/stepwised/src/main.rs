use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use serde::Deserialize;
use stepwise_events::{EventJournal, EventStreamHub, FileEventStore, SessionEvent};
use stepwise_policy::{PermissionRules, RulePermissionGate};
use stepwise_protocol::{AgentEvent, QuestionAnswerer, SessionId, StopReason, WireProtocol};
use stepwise_providers::{HttpProvider, ProviderConfig};
use stepwise_runtime::{AgentLoop, QueryRequest, RuntimeConfig};
use stepwise_tools::ToolRegistry;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "stepwised")]
#[command(about = "Run one agent query against a session log")]
struct Cli {
    /// JSON file with `runtime`, `provider`, and `permissions` sections.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, env = "STEPWISE_ROOT", default_value = ".stepwise/sessions")]
    root: PathBuf,
    #[arg(long)]
    protocol: Option<WireProtocol>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long, env = "STEPWISE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    /// Continue this session instead of starting a new one.
    #[arg(long)]
    resume: Option<String>,
    #[arg(long)]
    max_steps: Option<u32>,
    #[arg(long)]
    no_stream: bool,
    prompt: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    runtime: RuntimeConfig,
    provider: ProviderConfig,
    permissions: PermissionRules,
}

impl FileConfig {
    async fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed reading config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing config {}", path.display()))
    }

    fn apply(&mut self, cli: &Cli) {
        if let Some(protocol) = cli.protocol {
            self.provider.protocol = protocol;
        }
        if let Some(model) = &cli.model {
            self.runtime.model = model.clone();
        }
        if let Some(base_url) = &cli.base_url {
            self.provider.base_url = Some(base_url.clone());
        }
        if let Some(api_key) = &cli.api_key {
            self.provider.api_key = Some(api_key.clone());
        }
        if let Some(max_steps) = cli.max_steps {
            self.runtime.max_steps = max_steps;
        }
        if cli.no_stream {
            self.runtime.stream = false;
            self.provider.streaming = false;
        }
    }
}

/// Asks permission questions on stderr and reads the reply from stdin.
struct StdinAnswerer;

#[async_trait]
impl QuestionAnswerer for StdinAnswerer {
    fn name(&self) -> &str {
        "stdin"
    }

    async fn ask(&self, _tool_use_id: &str, question: &str) -> Option<String> {
        eprint!("\n{question} ");
        let mut line = String::new();
        match BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
            Ok(0) => None,
            Ok(_) => Some(line.trim().to_owned()),
            Err(error) => {
                warn!(%error, "failed reading answer from stdin");
                None
            }
        }
    }
}

/// Print deltas as they arrive. Returns whether any text was printed.
async fn print_deltas(mut events: broadcast::Receiver<SessionEvent>, done: CancellationToken) -> bool {
    let mut printed = false;
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(SessionEvent { event: AgentEvent::AssistantDelta { text }, .. }) => {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                    printed = true;
                }
                Ok(SessionEvent { event: AgentEvent::Persisted(record), session_id }) => {
                    debug!(%session_id, seq = record.seq, kind = record.type_name(), "event.appended");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "live event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = done.cancelled() => break,
        }
    }
    printed
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let mut config = FileConfig::load(cli.config.as_deref()).await?;
    config.apply(&cli);

    let provider = HttpProvider::new(config.provider.clone())
        .context("failed building provider client")?;
    let store = Arc::new(FileEventStore::new(&cli.root));
    let journal = EventJournal::new(store, EventStreamHub::default());
    let agent = AgentLoop::builder(journal.clone(), Arc::new(provider))
        .config(config.runtime)
        .tools(Arc::new(ToolRegistry::with_core_tools()))
        .permission_gate(Arc::new(RulePermissionGate::new(config.permissions)))
        .answerer(Arc::new(StdinAnswerer))
        .build();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, cancelling query");
                cancel.cancel();
            }
        }
    });

    let done = CancellationToken::new();
    let printer = tokio::spawn(print_deltas(journal.subscribe(), done.clone()));

    let request = match cli.resume {
        Some(session_id) => QueryRequest::resume(SessionId::from(session_id.as_str()), cli.prompt),
        None => QueryRequest::new(cli.prompt),
    };
    let result = agent.run(request, cancel).await;

    done.cancel();
    let streamed = match printer.await {
        Ok(printed) => printed,
        Err(error) => {
            warn!(%error, "delta printer stopped");
            false
        }
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(stepwise_runtime::QueryError::Cancelled) => {
            eprintln!("\ncancelled");
            return Ok(ExitCode::from(130));
        }
        Err(error) => return Err(error).context("query failed"),
    };

    if streamed {
        println!();
    } else if !outcome.final_text.is_empty() {
        println!("{}", outcome.final_text);
    }
    info!(
        session_id = %outcome.session_id,
        stop_reason = outcome.stop_reason.as_str(),
        steps = outcome.steps,
        "query finished"
    );

    Ok(match outcome.stop_reason {
        StopReason::End => ExitCode::SUCCESS,
        StopReason::MaxSteps | StopReason::HookBlocked => ExitCode::from(2),
        StopReason::Error => ExitCode::FAILURE,
    })
}
