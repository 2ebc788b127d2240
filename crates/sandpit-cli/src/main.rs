//! sandpit CLI - command line interface for the execution engine

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use sandpit_core::client::Client;
use sandpit_core::config::default_socket_path;
use sandpit_core::protocol::ExecuteRequest;
use sandpit_core::runtime::DockerRuntime;
use sandpit_core::{EngineConfig, ExecutionEngine, ExecutionRequest, ExecutionResult};
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "sandpit")]
#[command(author, version, about = "Run untrusted code in disposable containers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute code through the daemon
    Exec {
        #[command(flatten)]
        submission: Submission,

        /// Socket path (defaults to SANDPIT_SOCKET env var or /run/sandpit/sandpit.sock)
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// Count live sandboxes on the daemon
    Status {
        /// Socket path (defaults to SANDPIT_SOCKET env var or /run/sandpit/sandpit.sock)
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// Reap every live sandbox on the daemon
    Cleanup {
        /// Socket path (defaults to SANDPIT_SOCKET env var or /run/sandpit/sandpit.sock)
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// Ping the daemon
    Ping {
        /// Socket path (defaults to SANDPIT_SOCKET env var or /run/sandpit/sandpit.sock)
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// Run code directly against the local Docker daemon (no sandpit daemon)
    Run {
        #[command(flatten)]
        submission: Submission,
    },
}

#[derive(Args)]
struct Submission {
    /// Code to execute (or - for stdin)
    code: String,

    /// Source language
    #[arg(short, long)]
    language: String,

    /// Data fed to the program's stdin
    #[arg(short, long)]
    input: Option<String>,

    /// Timeout in milliseconds (language default if omitted)
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// Memory limit, e.g. 64m
    #[arg(short, long)]
    memory: Option<String>,

    /// CPU share as a fraction of one core
    #[arg(long)]
    cpus: Option<f64>,
}

impl Submission {
    fn into_wire(self) -> Result<ExecuteRequest> {
        let code = if self.code == "-" {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("failed to read code from stdin")?;
            code
        } else {
            self.code
        };
        Ok(ExecuteRequest {
            code,
            language: self.language,
            input: self.input,
            timeout_ms: self.timeout_ms,
            memory_limit: self.memory,
            cpu_limit: self.cpus,
        })
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sandpit=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Exec { submission, socket } => {
            let mut client = connect(socket).await?;
            let response = client.execute(submission.into_wire()?).await?;
            if let Some(error) = response.error {
                bail!("{:?}: {}", error.kind, error.message);
            }
            let result = response
                .result
                .context("daemon returned neither a result nor an error")?;
            report(&result)
        }

        Commands::Status { socket } => {
            let active = connect(socket).await?.status().await?;
            println!("{}", serde_json::json!({ "active": active }));
            Ok(ExitCode::SUCCESS)
        }

        Commands::Cleanup { socket } => {
            let reaped = connect(socket).await?.cleanup().await?;
            println!("{}", serde_json::json!({ "reaped": reaped }));
            Ok(ExitCode::SUCCESS)
        }

        Commands::Ping { socket } => {
            connect(socket).await?.ping().await?;
            println!("pong");
            Ok(ExitCode::SUCCESS)
        }

        Commands::Run { submission } => {
            let request: ExecutionRequest = submission.into_wire()?.into_request()?;
            let runtime = DockerRuntime::connect().context("failed to connect to docker")?;
            let engine = ExecutionEngine::new(Arc::new(runtime), EngineConfig::default())?;
            let result = engine.execute_code(&request).await?;
            report(&result)
        }
    }
}

async fn connect(socket: Option<PathBuf>) -> Result<Client> {
    let socket = socket.unwrap_or_else(default_socket_path);
    Client::connect(&socket)
        .await
        .with_context(|| format!("failed to connect to {}", socket.display()))
}

/// Print the result and mirror the program's exit code.
fn report(result: &ExecutionResult) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(result)?);
    let code = u8::try_from(result.exit_code).unwrap_or(1);
    Ok(ExitCode::from(code))
}
