//! `piece` CLI: validate and run piece definitions against an agent command.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use piece_engine::core::types::{AgentResponse, PieceStatus};
use piece_engine::core::validate::validate_piece;
use piece_engine::io::command::CommandInvoker;
use piece_engine::io::config::load_config;
use piece_engine::io::invoker::AgentInvoker;
use piece_engine::io::judge::AgentJudge;
use piece_engine::io::piece_file::load_piece;
use piece_engine::io::prompt::PromptBuilder;
use piece_engine::{EngineHooks, EngineOptions, NoopHooks, PieceEngine, exit_codes, logging};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

const DEFAULT_CONFIG: &str = "piece.toml";

#[derive(Parser)]
#[command(
    name = "piece",
    version,
    about = "Run pieces: graphs of AI-agent movements"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse a piece file and check its movement graph.
    Validate {
        /// Path to the piece TOML file.
        piece: PathBuf,
    },
    /// Run a piece to completion, printing lifecycle events as JSON lines.
    Run {
        /// Path to the piece TOML file.
        piece: PathBuf,
        /// Task handed to every movement.
        #[arg(short, long)]
        task: String,
        /// Engine config (defaults to `piece.toml` in the working directory).
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Working directory for agent calls.
        #[arg(long, default_value = ".")]
        cwd: PathBuf,
        /// Ask on the terminal when a movement is blocked.
        #[arg(short, long)]
        interactive: bool,
    },
}

#[tokio::main]
async fn main() {
    logging::init();
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Validate { piece } => cmd_validate(&piece),
        Command::Run {
            piece,
            task,
            config,
            cwd,
            interactive,
        } => cmd_run(&piece, task, config, cwd, interactive).await,
    }
}

fn cmd_validate(path: &Path) -> Result<i32> {
    let piece = load_piece(path)?;
    validate_piece(&piece).with_context(|| format!("invalid piece {}", path.display()))?;
    println!(
        "ok: piece `{}` ({} movements, starts at `{}`)",
        piece.name,
        piece.movements.len(),
        piece.initial_movement
    );
    Ok(exit_codes::OK)
}

async fn cmd_run(
    path: &Path,
    task: String,
    config: Option<PathBuf>,
    cwd: PathBuf,
    interactive: bool,
) -> Result<i32> {
    let config_path = config.unwrap_or_else(|| cwd.join(DEFAULT_CONFIG));
    let cfg = load_config(&config_path)?;
    let piece = load_piece(path)?;

    let invoker: Arc<dyn AgentInvoker> = Arc::new(CommandInvoker::new(&cfg.agent)?);
    let judge = Arc::new(AgentJudge::new(
        Arc::clone(&invoker),
        cfg.judge_persona.as_str(),
        cwd.as_path(),
        Arc::new(PromptBuilder::new()),
    ));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => eprintln!("failed to serialize event: {err}"),
            }
        }
    });

    let hooks: Arc<dyn EngineHooks> = if interactive {
        Arc::new(TerminalHooks)
    } else {
        Arc::new(NoopHooks)
    };
    let options = EngineOptions {
        cwd,
        report_dir: cfg.report_dir.clone(),
        loop_thresholds: cfg.loop_detection,
        events: Some(tx),
        hooks,
        ..EngineOptions::default()
    };
    let mut engine = PieceEngine::new(piece, task, invoker, judge, options)
        .with_context(|| format!("invalid piece {}", path.display()))?;
    let outcome = engine.run().await.context("run piece")?;
    drop(engine);
    printer.await.context("join event printer")?;

    match outcome.status {
        PieceStatus::Completed => {
            eprintln!("completed after {} iterations", outcome.iterations);
            Ok(exit_codes::OK)
        }
        _ => {
            eprintln!(
                "aborted after {} iterations: {}",
                outcome.iterations,
                outcome.reason.as_deref().unwrap_or("unknown reason")
            );
            Ok(exit_codes::ABORTED)
        }
    }
}

/// Prompts on stderr and reads one line from stdin when a movement is blocked.
struct TerminalHooks;

#[async_trait]
impl EngineHooks for TerminalHooks {
    async fn on_user_input(&self, movement: &str, response: &AgentResponse) -> Option<String> {
        eprintln!("movement `{movement}` is blocked:\n{}\n> ", response.content.trim());
        let mut line = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        match stdin.read_line(&mut line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => {
                let input = line.trim();
                (!input.is_empty()).then(|| input.to_string())
            }
        }
    }
}
