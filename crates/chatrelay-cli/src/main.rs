use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chatrelay_core::*;
use chatrelay_gateway::{spawn_worker, Gateway, InboundFilter};
use chatrelay_provider::{AssistantProfile, OpenAiAssistants};
use chatrelay_schema::{DeliveryStatus, InboundEvent, OutputFragment, ReplyTarget, SenderIdentity};
use clap::{CommandFactory, Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "chatrelay", version, about = "Relay chat conversations to an AI assistant backend")]
struct Cli {
    #[arg(long, short = 'c', default_value = "config.yaml", help = "Path to the YAML config file")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Chat from the console (stdin lines become inbound messages)")]
    Run {
        #[arg(long, default_value = "console", help = "Conversation id of the console chat")]
        conversation: String,
        #[arg(long, default_value = "console_user", help = "Sender handle")]
        handle: String,
        #[arg(long, default_value = "Console", help = "Sender display name")]
        name: String,
    },
    #[command(about = "Validate the config file and presets")]
    Validate,
    #[command(about = "List available presets")]
    Presets,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let config = RelayConfig::load(&cli.config)?;
    let _guard = init_logging(&config.log_dir)?;

    match command {
        Commands::Validate => {
            let presets = PresetLibrary::load_dir(&config.presets_dir, &config.default_preset)?;
            config.openai.resolve_api_key()?;
            println!(
                "Config valid. {} presets, {} group preset assignments, {} monitor watches.",
                presets.names().len(),
                config.group_presets.len(),
                config.monitor.watches.len()
            );
        }
        Commands::Presets => {
            let presets = PresetLibrary::load_dir(&config.presets_dir, &config.default_preset)?;
            println!("{:<20} DESCRIPTION", "NAME");
            println!("{}", "-".repeat(60));
            for preset in presets.iter() {
                let marker = if preset.name == presets.default_name() { " (default)" } else { "" };
                println!("{:<20} {}{marker}", preset.name, preset.description);
            }
        }
        Commands::Run {
            conversation,
            handle,
            name,
        } => {
            run_console(&config, conversation, SenderIdentity::new(handle, name)).await?;
        }
    }
    Ok(())
}

fn init_logging(log_dir: &Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log dir: {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "chatrelay.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();
    Ok(guard)
}

/// Prints fragments to stdout.
struct ConsoleTransport;

#[async_trait]
impl Transport for ConsoleTransport {
    async fn send(&self, target: &ReplyTarget, fragment: &OutputFragment) -> DeliveryStatus {
        let mut stdout = std::io::stdout().lock();
        match writeln!(stdout, "{}", render_fragment(target, fragment)) {
            Ok(()) => DeliveryStatus::DELIVERED,
            Err(_) => DeliveryStatus(-1),
        }
    }
}

fn render_fragment(target: &ReplyTarget, fragment: &OutputFragment) -> String {
    let mention = target
        .mention
        .as_deref()
        .map(|h| format!("@{h} "))
        .unwrap_or_default();
    if fragment.is_media() {
        format!("[{}] {mention}<{}: {}>", target.conversation_id, fragment.kind, fragment.payload)
    } else {
        format!("[{}] {mention}{}", target.conversation_id, fragment.payload)
    }
}

struct App {
    gateway: Arc<Gateway>,
    monitor: StatusMonitor,
}

fn bootstrap(config: &RelayConfig, emitter: ReplyEmitter) -> Result<App> {
    let backend = Arc::new(
        OpenAiAssistants::from_settings(config.openai.clone())
            .context("failed to create the AI backend client")?,
    );
    let presets = Arc::new(PresetLibrary::load_dir(&config.presets_dir, &config.default_preset)?);
    let scratch = ScratchDir::new(&config.scratch_dir);

    let tools = builtin_tools(
        &config.tools,
        &ToolDeps {
            backend: backend.clone(),
            media: backend.clone(),
            scratch: scratch.clone(),
            proxy: config.openai.proxy.clone(),
        },
    );
    let profile = AssistantProfile {
        name: config.assistant.name.clone(),
        description: config.assistant.description.clone(),
        model: config.openai.chat_model.clone(),
        instructions: Some(presets.default_preset().system_prompt.clone()),
        tools: Vec::new(),
    };
    let driver = RunDriver::new(backend.clone(), Arc::new(tools), profile, scratch)
        .with_poll_policy(config.run.poll_policy());
    let sessions = SessionRegistry::new(backend.clone()).with_presets(config.preset_assignments());

    let orchestrator = Arc::new(TurnOrchestrator::new(
        Arc::new(sessions),
        Arc::new(driver),
        presets,
        emitter.clone(),
    ));
    let gateway = Arc::new(
        Gateway::new(
            orchestrator,
            InboundFilter::new(config.bot.clone()),
            config.admin.clone(),
        )
        .with_transcriber(backend),
    );
    let monitor = StatusMonitor::from_config(&config.monitor, emitter)?;
    Ok(App { gateway, monitor })
}

async fn run_console(config: &RelayConfig, conversation: String, sender: SenderIdentity) -> Result<()> {
    let emitter = ReplyEmitter::new(ConsoleTransport);
    let app = bootstrap(config, emitter)?;

    let monitor = if app.monitor.is_empty() {
        None
    } else {
        Some(app.monitor.spawn())
    };
    let (tx, rx) = mpsc::channel::<InboundEvent>(32);
    let worker = spawn_worker(app.gateway.clone(), rx);

    println!("chatrelay console. Type 'quit' to exit, '/voice <file>' to send a voice message.");
    println!("---");

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                None
            }
        };
        let Some(line) = line else { break };
        let input = line.trim();
        if input == "quit" || input == "exit" {
            break;
        }
        if input.is_empty() {
            continue;
        }
        let event = console_event(&conversation, &sender, input);
        if tx.send(event).await.is_err() {
            tracing::error!("worker stopped unexpectedly");
            break;
        }
    }

    // let the worker finish the queued turns
    drop(tx);
    worker.await.context("turn worker panicked")?;
    if let Some(monitor) = monitor {
        monitor.abort();
    }
    Ok(())
}

fn console_event(conversation: &str, sender: &SenderIdentity, input: &str) -> InboundEvent {
    match input.strip_prefix("/voice ") {
        Some(path) => InboundEvent::voice(conversation, sender.clone(), path.trim()),
        None => InboundEvent::text(conversation, sender.clone(), input),
    }
}
