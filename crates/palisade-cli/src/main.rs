//! Palisade CLI
//!
//! Usage:
//!   palisade check --kind shell "rm -rf /"             Print the verdict as JSON
//!   palisade run --kind shell --level moderate "ls"    Run through the full executor
//!   palisade --config palisade.toml run --yes "make"   Load settings, approve everything
//!
//! `run` asks on the terminal whenever the safety policy wants a human. The
//! process exits with the action's own exit code when it ran, and with a
//! fixed code otherwise (126 denied, 124 timed out, 130 cancelled, 125
//! sandbox failure).

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use palisade::{
    Action, ActionKind, AgenticExecutor, ApprovalGate, ApprovalResponse, AutoApprove, Config,
    ExecutionResult, ExecutionStatus, SafetyLevel, ValidationVerdict, Validator,
};

const AGENT: &str = "cli";

/// Palisade - screen and run agent actions in a throwaway sandbox
#[derive(Parser, Debug)]
#[command(name = "palisade")]
#[command(about = "Screen and run agent-proposed actions in an isolated sandbox")]
struct Args {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate an action without running it
    Check {
        #[command(flatten)]
        action: ActionArgs,
    },
    /// Validate, gate and run an action
    Run {
        #[command(flatten)]
        action: ActionArgs,
        /// Autonomy level for the session
        #[arg(long, default_value = "safe")]
        level: SafetyLevel,
        /// Approve every request without prompting
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

#[derive(clap::Args, Debug)]
struct ActionArgs {
    /// Action kind: shell, file_write, file_delete, network_fetch, package_install
    #[arg(long, default_value = "shell")]
    kind: ActionKind,
    /// Content for file writes
    #[arg(long)]
    content: Option<String>,
    /// Why the agent wants to do this
    #[arg(long, default_value = "")]
    rationale: String,
    /// Command, path, URL or package spec
    payload: String,
}

impl ActionArgs {
    fn to_action(&self) -> Action {
        let mut builder = Action::builder(AGENT, self.kind, self.payload.clone())
            .rationale(self.rationale.clone());
        if let Some(content) = &self.content {
            builder = builder.content(content.clone());
        }
        builder.build()
    }
}

/// Asks on the controlling terminal.
#[derive(Debug)]
struct TerminalGate;

#[async_trait]
impl ApprovalGate for TerminalGate {
    async fn request_approval(
        &self,
        action: &Action,
        verdict: &ValidationVerdict,
    ) -> ApprovalResponse {
        let prompt = format!(
            "\n{} action requested: {}\n{}approve? [y]es / [a]lways this session / [N]o: ",
            action.kind(),
            action.payload(),
            verdict
                .reasons
                .iter()
                .map(|r| format!("  ! {r}\n"))
                .collect::<String>(),
        );
        let answer = tokio::task::spawn_blocking(move || {
            let mut stderr = io::stderr();
            let _ = stderr.write_all(prompt.as_bytes());
            let _ = stderr.flush();
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;
        match answer {
            Ok(Ok(line)) => match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => ApprovalResponse::Approve,
                "a" | "always" => ApprovalResponse::ApproveForSession,
                _ => ApprovalResponse::Deny("declined at the terminal".to_string()),
            },
            Ok(Err(e)) => ApprovalResponse::Deny(format!("could not read answer: {e}")),
            Err(e) => ApprovalResponse::Deny(format!("prompt failed: {e}")),
        }
    }
}

fn exit_code(result: &ExecutionResult) -> i32 {
    match (result.status, result.exit_code) {
        (ExecutionStatus::Completed, Some(code)) => code,
        (ExecutionStatus::Completed, None) => 1,
        (ExecutionStatus::Denied, _) => 126,
        (ExecutionStatus::TimedOut, _) => 124,
        (ExecutionStatus::Cancelled, _) => 130,
        (ExecutionStatus::InfraFailure, _) => 125,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays valid JSON
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match args.command {
        Command::Check { action } => {
            let verdict = Validator::new(&config.network).check(&action.to_action());
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            std::process::exit(if verdict.is_deny() { 126 } else { 0 });
        }
        Command::Run { action, level, yes } => {
            let builder = AgenticExecutor::builder().config(config);
            let builder = if yes {
                builder.approval(AutoApprove)
            } else {
                builder.approval(TerminalGate)
            };
            let executor = builder.build().context("failed to start executor")?;
            executor.start_session(AGENT, Some(level))?;

            let result = executor.propose(action.to_action()).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            tracing::debug!(status = ?result.status, "Action finished");
            std::process::exit(exit_code(&result));
        }
    }
}
