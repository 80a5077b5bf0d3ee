//! tracecheck CLI: the main entry point.
//!
//! Commands:
//! - `direct` (default): one streamed chat request
//! - `agent`: one instruction driven through the agent and its tools

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracecheck::{Harness, HarnessOptions, exit_code};
use tracecheck_config::{Mode, Overrides};

#[derive(Parser)]
#[command(
    name = "tracecheck",
    about = "Verify that LLM requests reach the endpoint and their traces reach Langfuse",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    opts: RunOpts,
}

#[derive(Subcommand)]
enum Command {
    /// Send one streamed chat request (default)
    Direct,
    /// Drive one instruction through the agent and its tools
    Agent,
}

#[derive(Args)]
struct RunOpts {
    /// Provider prefix for <PROVIDER>_API_KEY and <PROVIDER>_BASE_URL
    #[arg(long, global = true)]
    provider: Option<String>,

    /// Model id, e.g. glm-4.7 or anthropic/glm-4.7
    #[arg(long, global = true)]
    model: Option<String>,

    #[arg(long, global = true)]
    session_id: Option<String>,

    /// Trace tag (repeatable)
    #[arg(long = "tag", global = true)]
    tags: Vec<String>,

    /// Telemetry exporter to enable (repeatable)
    #[arg(long = "exporter", global = true)]
    exporters: Vec<String>,

    /// Prompt (direct) or instruction (agent)
    #[arg(long, global = true)]
    prompt: Option<String>,

    /// TOML file with non-secret settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// .env file to load instead of the usual lookup
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Workspace directory for the agent's tools
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Exit non-zero when the request fails (1) or configuration is invalid (2)
    #[arg(long, global = true)]
    strict: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let opts = cli.opts;

    // Logs go to stderr so the report on stdout stays clean
    let filter = if opts.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mode = match cli.command {
        Some(Command::Agent) => Mode::Agent,
        Some(Command::Direct) | None => Mode::Direct,
    };

    let mut harness = Harness::new(HarnessOptions {
        mode,
        overrides: Overrides {
            provider: opts.provider,
            model: opts.model,
            session_id: opts.session_id,
            tags: opts.tags,
            exporters: opts.exporters,
            prompt: opts.prompt,
            workspace: opts.workspace,
        },
        config_file: opts.config,
        env_file: opts.env_file,
        env: None,
    });

    let mut stdout = std::io::stdout().lock();
    let result = harness.run(&mut stdout).await;
    if let Err(e) = &result {
        eprintln!("Error: {e}");
    }
    ExitCode::from(exit_code(&result, opts.strict))
}
