//! `jupyter-forward` — launch Jupyter Lab on a remote host and forward it to
//! the local machine over SSH.
//!
//! The `start` command authenticates against the remote host, starts a
//! notebook server inside the user's environment (conda-like or pixi,
//! optionally through a batch submission command), sets up local port
//! forwarding to the server, opens a browser, and tails the server log until
//! interrupted.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use console::style;
use tracing_subscriber::EnvFilter;

use jupyter_forward::auth::TerminalPrompter;
use jupyter_forward::errors::ForwardResult;
use jupyter_forward::output::{Reporter, Terminal};
use jupyter_forward::runner::{LaunchConfig, RemoteRunner};

/// Environment variable controlling diagnostic log verbosity.
const LOG_ENV: &str = "JUPYTER_FORWARD_LOG";

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "jupyter-forward",
    version,
    about = "Jupyter Lab runner and SSH port forwarder for remote resources"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start Jupyter Lab on a remote resource and forward it locally.
    Start(StartArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Remote target, as [user@]host[:port].
    host: String,

    /// Local port the notebook server is forwarded to.
    #[arg(long, default_value_t = 8888)]
    port: u16,

    /// Remote environment containing jupyter lab: a name, an absolute
    /// prefix path, or project[:environment] for pixi.
    #[arg(long)]
    conda_env: Option<String>,

    /// Environment manager to use (micromamba, mamba, conda, or pixi).
    /// Probed on the remote host when unset.
    #[arg(long)]
    env_manager: Option<String>,

    /// Absolute path of the environment manager executable on the remote
    /// host, skipping resolution via `which`.
    #[arg(long)]
    env_manager_path: Option<String>,

    /// Remote directory to serve notebooks from.
    #[arg(long, conflicts_with = "notebook")]
    notebook_dir: Option<String>,

    /// Notebook file to open on startup; implies its parent as the
    /// notebook directory.
    #[arg(long)]
    notebook: Option<String>,

    /// Forward the notebook server port to the local machine (default).
    #[arg(long, overrides_with = "no_port_forwarding")]
    port_forwarding: bool,

    /// Open the server's own URL instead of forwarding a local port.
    #[arg(long)]
    no_port_forwarding: bool,

    /// Identity (private key) file for public key authentication.
    #[arg(long, short = 'i')]
    identity: Option<PathBuf>,

    /// Custom launch prefix, e.g. a batch scheduler submission command; the
    /// composed server command is written to a script and passed to it.
    #[arg(long, short = 'c')]
    launch_command: Option<String>,

    /// Login shell on the remote host (name or absolute path). Probed via
    /// $SHELL when unset.
    #[arg(long)]
    shell: Option<String>,
}

impl StartArgs {
    fn into_config(self) -> LaunchConfig {
        let port_forwarding = self.port_forwarding || !self.no_port_forwarding;
        LaunchConfig {
            host: self.host,
            port: self.port,
            env_manager: self.env_manager,
            env_manager_path: self.env_manager_path,
            conda_env: self.conda_env,
            notebook_dir: self.notebook_dir,
            notebook: self.notebook,
            port_forwarding,
            launch_command: self.launch_command,
            identity: self.identity,
            shell: self.shell,
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let reporter = Terminal;

    let result = match cli.command {
        Command::Start(args) => run_start(args, &reporter).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", style("error:").red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run_start(args: StartArgs, reporter: &dyn Reporter) -> ForwardResult<()> {
    let config = args.into_config();
    let mut runner = RemoteRunner::connect(config, reporter, &TerminalPrompter).await?;
    runner.start().await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
