//! The remote session orchestrator.
//!
//! [`RemoteRunner`] owns the authenticated [`Session`] for the whole process
//! lifetime and drives the launch sequence: probe the login shell, resolve
//! the environment manager, pick a writable scratch directory, compose and
//! detach the notebook server command, poll its log for the readiness
//! marker, then either wire up local port forwarding or open the parsed URL
//! directly, tailing the log until interrupted.
//!
//! Two wrapping rules are load-bearing and preserved exactly:
//!
//! - command wrapping: C-shell family `<shell> -c "…"`, everything else
//!   `<shell> -lc "…"` (a login shell, so modules/env state are picked up)
//! - output redirection: C-shell family `>& <log>`, everything else
//!   `> <log> 2>&1`

use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;

use crate::auth::{self, AuthPrompter, HostSpec};
use crate::envmgr::{EnvManagerKind, EnvTemplate};
use crate::errors::{ForwardError, ForwardResult};
use crate::helpers::{is_port_available, open_browser, run_timestamp};
use crate::output::Reporter;
use crate::parser::{ServerInfo, parse_stdout};
use crate::session::{RunResult, Session};

/// Substring the notebook server prints once it is ready and has emitted its
/// connection URLs.
const READINESS_MARKER: &str = "is running at:";

/// Pause between log polls; the alternative is hammering the remote session.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Overall deadline for the server to report readiness.  The reference
/// behavior polls forever; a batch job stuck in a queue would hang the tool.
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Grace period between the tunnel coming up and the browser launch, so the
/// browser cannot connect before the forward is fully established.
const BROWSER_GRACE: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Everything the CLI collects for one `start` invocation.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub host: String,
    pub port: u16,
    pub env_manager: Option<String>,
    pub env_manager_path: Option<String>,
    pub conda_env: Option<String>,
    pub notebook_dir: Option<String>,
    pub notebook: Option<String>,
    pub port_forwarding: bool,
    pub launch_command: Option<String>,
    pub identity: Option<PathBuf>,
    pub shell: Option<String>,
}

impl LaunchConfig {
    /// Validate option combinations and normalize `notebook` into a
    /// directory plus file name.  Runs before any remote I/O.
    pub fn normalize(&mut self) -> ForwardResult<()> {
        if self.notebook_dir.is_some() && self.notebook.is_some() {
            return Err(ForwardError::ConflictingNotebookOptions);
        }
        if let Some(notebook) = self.notebook.take() {
            let (dir, name) = split_notebook(&notebook);
            self.notebook_dir = Some(dir);
            self.notebook = Some(name);
        }
        Ok(())
    }
}

/// Split a notebook path into its parent directory (`"."` when bare) and
/// file name.
fn split_notebook(path: &str) -> (String, String) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((dir, name)) => (dir.to_string(), name.to_string()),
        None => (".".to_string(), path.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Command execution options
// ---------------------------------------------------------------------------

/// Per-call behavior of [`RemoteRunner::run_command`].
#[derive(Debug, Clone, Copy)]
pub struct RunOpts {
    /// Treat a non-zero exit as fatal (`Err`) instead of returning the
    /// failure result to the caller.
    pub exit: bool,
    /// Surface the command text to the user before execution.
    pub echo: bool,
    /// Request a PTY for the exec channel.
    pub pty: bool,
}

impl Default for RunOpts {
    fn default() -> Self {
        Self {
            exit: true,
            echo: true,
            pty: true,
        }
    }
}

impl RunOpts {
    /// A probe: no exit-on-failure, no echo.
    fn probe() -> Self {
        Self {
            exit: false,
            echo: false,
            pty: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Launch state
// ---------------------------------------------------------------------------

/// Paths and the final command produced during orchestration.  Each field is
/// set exactly once.
#[derive(Debug, Clone)]
pub struct LaunchState {
    pub log_dir: String,
    pub log_file: String,
    pub script_path: Option<String>,
    pub command: String,
}

// ---------------------------------------------------------------------------
// RemoteRunner
// ---------------------------------------------------------------------------

/// Starts Jupyter Lab on a remote resource and port-forwards the session to
/// the local machine.
pub struct RemoteRunner<'a> {
    config: LaunchConfig,
    session: Session,
    shell: String,
    timestamp: String,
    reporter: &'a dyn Reporter,
}

impl<'a> RemoteRunner<'a> {
    /// Check local preconditions, establish the SSH session, and resolve the
    /// remote shell.
    pub async fn connect(
        mut config: LaunchConfig,
        reporter: &'a dyn Reporter,
        prompter: &dyn AuthPrompter,
    ) -> ForwardResult<Self> {
        config.normalize()?;

        // The local port is a system-wide resource; fail before any remote
        // work if it is taken.
        if config.port_forwarding && !is_port_available(config.port) {
            return Err(ForwardError::PortInUse(config.port));
        }

        let spec = HostSpec::parse(&config.host)?;
        let identity = auth::check_identity(config.identity.as_deref())?;
        let session = auth::connect(&spec, identity.as_deref(), prompter, reporter).await?;
        let shell = probe_shell(&session, config.shell.as_deref(), reporter).await?;

        Ok(Self {
            config,
            session,
            shell,
            timestamp: run_timestamp(),
            reporter,
        })
    }

    /// Run the whole launch sequence.  Whatever the outcome, the session is
    /// closed and a final status line is emitted before returning.
    pub async fn start(&mut self) -> ForwardResult<()> {
        let result = self.launch().await;
        if let Err(e) = &result {
            self.reporter.line(&format!("✗ {e}"));
        }
        self.session.close().await;
        self.reporter.rule(&format!(
            "Terminated the network connection to {}",
            self.session.host
        ));
        result
    }

    async fn launch(&mut self) -> ForwardResult<()> {
        let state = self.compose_launch().await?;

        self.reporter.rule("Launching Jupyter Lab");
        self.reporter.line(&state.command);
        let wrapped = wrap_command(&self.shell, &state.command);
        self.session.exec_detached(&wrapped).await?;

        let log_text = self.wait_for_server(&state.log_file).await?;
        let info = parse_stdout(&log_text);

        if self.config.port_forwarding {
            self.forward_and_tail(&info, &state.log_file).await
        } else {
            open_browser(
                None,
                None,
                info.url.as_deref(),
                self.config.notebook.as_deref(),
                self.reporter,
            )?;
            self.tail(&state.log_file).await
        }
    }

    // -----------------------------------------------------------------------
    // Remote command execution
    // -----------------------------------------------------------------------

    /// Run `command` wrapped in the resolved shell's invocation syntax.
    pub async fn run_command(&self, command: &str, opts: RunOpts) -> ForwardResult<RunResult> {
        let wrapped = wrap_command(&self.shell, command);
        if opts.echo {
            self.reporter.line(&wrapped);
        }
        let result = self.session.exec(&wrapped, opts.pty).await?;
        if opts.exit && result.failed() {
            return Err(ForwardError::CommandFailed {
                command: command.to_string(),
                exit_code: result.exit_code,
            });
        }
        Ok(result)
    }

    async fn command_exists(&self, command: &str) -> ForwardResult<bool> {
        let result = self
            .run_command(&format!("which {command}"), RunOpts::probe())
            .await?;
        Ok(result.success())
    }

    // -----------------------------------------------------------------------
    // Environment manager
    // -----------------------------------------------------------------------

    async fn resolve_env_manager(&self) -> ForwardResult<(EnvManagerKind, String)> {
        let kind = match &self.config.env_manager {
            Some(name) => EnvManagerKind::parse(name)?,
            None => {
                let mut found = None;
                for candidate in EnvManagerKind::CONDA_LIKE_PROBE_ORDER {
                    if self.command_exists(candidate.name()).await? {
                        found = Some(candidate);
                        break;
                    }
                }
                found.ok_or(ForwardError::EnvManagerNotFound)?
            }
        };

        let path = match &self.config.env_manager_path {
            Some(path) => path.clone(),
            None => {
                let result = self
                    .run_command(&format!("which {}", kind.name()), RunOpts::probe())
                    .await?;
                let path = result.stdout.trim().to_string();
                if result.failed() || path.is_empty() {
                    return Err(ForwardError::EnvManagerUnresolved(kind.name().to_string()));
                }
                path
            }
        };

        Ok((kind, path))
    }

    /// Resolve the environment wrapper and verify `jupyter` is reachable
    /// inside it.
    async fn build_env_template(&self) -> ForwardResult<EnvTemplate> {
        let (kind, path) = self.resolve_env_manager().await?;

        let template = match kind {
            EnvManagerKind::Micromamba | EnvManagerKind::Mamba | EnvManagerKind::Conda => {
                EnvTemplate::conda_like(&path, self.config.conda_env.as_deref())
            }
            EnvManagerKind::Pixi => EnvTemplate::pixi(&path, self.config.conda_env.as_deref())?,
        };

        self.reporter
            .rule(&format!("Running Jupyter sanity checks ({})", kind.name()));
        let check = self
            .run_command(
                &template.apply("which jupyter"),
                RunOpts {
                    exit: false,
                    ..RunOpts::default()
                },
            )
            .await?;
        if check.failed() {
            return Err(ForwardError::JupyterNotFound);
        }

        Ok(template)
    }

    // -----------------------------------------------------------------------
    // Scratch space
    // -----------------------------------------------------------------------

    /// Pick a writable base directory, create the log directory and an empty
    /// timestamped log file in it.
    pub async fn resolve_scratch(&self) -> ForwardResult<(String, String)> {
        self.reporter
            .rule(&format!("Creating log file on {}", self.session.host));

        let base = self.scratch_base().await?;
        let log_dir = format!("{base}/.jupyter_forward");
        self.run_command(&format!("mkdir -p {log_dir}"), RunOpts::default())
            .await?;
        self.reporter
            .line(&format!("Log directory is set to {log_dir}"));

        let log_file = format!("{log_dir}/log_{}.txt", self.timestamp);
        self.run_command(&format!("touch {log_file}"), RunOpts::default())
            .await?;
        self.reporter.line(&format!("Log file is set to {log_file}"));

        Ok((log_dir, log_file))
    }

    /// `$TMPDIR` when defined and writable, else `$HOME`.  An unwritable
    /// `$TMPDIR` falls through to `$HOME` before anything is fatal.
    async fn scratch_base(&self) -> ForwardResult<String> {
        let tmpdir = self
            .run_command("printenv TMPDIR", RunOpts::probe())
            .await?;
        if tmpdir.success() {
            match self.check_writable("$TMPDIR").await {
                Ok(dir) => return Ok(dir),
                Err(ForwardError::ScratchNotWritable(dir)) => {
                    tracing::debug!(%dir, "scratch candidate not writable; trying the next one");
                }
                Err(e) => return Err(e),
            }
        }

        let home = self.run_command("printenv HOME", RunOpts::probe()).await?;
        if home.success() {
            return self.check_writable("$HOME").await;
        }

        Err(ForwardError::ScratchUndetermined)
    }

    async fn check_writable(&self, dir: &str) -> ForwardResult<String> {
        let command = format!(
            "touch {dir}/foobar && rm -f {dir}/foobar \
             && echo '{dir} is WRITABLE' || echo '{dir} is NOT WRITABLE'"
        );
        let result = self
            .run_command(
                &command,
                RunOpts {
                    exit: false,
                    ..RunOpts::default()
                },
            )
            .await?;
        if confirms_writable(dir, &result) {
            Ok(dir.to_string())
        } else {
            Err(ForwardError::ScratchNotWritable(dir.to_string()))
        }
    }

    // -----------------------------------------------------------------------
    // Launch composition
    // -----------------------------------------------------------------------

    async fn compose_launch(&self) -> ForwardResult<LaunchState> {
        let (log_dir, log_file) = self.resolve_scratch().await?;

        let ip = self.server_ip().await?;
        let mut command = format!("jupyter lab --no-browser --ip={ip}");
        if let Some(dir) = &self.config.notebook_dir {
            command = format!("{command} --notebook-dir={dir}");
        }
        let command = redirect_command(&self.shell, &command, &log_file);

        let (command, script_path) = match &self.config.launch_command {
            Some(launcher) => {
                let script_path = self.prepare_batch_script(&log_dir, &command).await?;
                (format!("{launcher} {script_path}"), Some(script_path))
            }
            None => {
                let template = self.build_env_template().await?;
                (template.apply(&command), None)
            }
        };

        Ok(LaunchState {
            log_dir,
            log_file,
            script_path,
            command,
        })
    }

    /// The `--ip` value.  Under an external launch command the server may
    /// run on a different node than the one we are connected to, so the
    /// hostname must be evaluated remotely at launch time, not now.
    async fn server_ip(&self) -> ForwardResult<String> {
        if self.config.launch_command.is_some() {
            return Ok("$(hostname -f)".to_string());
        }
        let result = self.session.exec("hostname -f", true).await?;
        Ok(result.stdout.trim().to_string())
    }

    /// Write the wrapped command out as an executable batch job script on
    /// the remote host and return its path.
    async fn prepare_batch_script(&self, log_dir: &str, command: &str) -> ForwardResult<String> {
        self.reporter.rule("Preparing Batch Job script");

        let template = self.build_env_template().await?;
        let script = template.script(&self.shell, command);
        let script_path = format!("{log_dir}/batch_job_script_{}", self.timestamp);

        self.reporter.line(&script);
        self.session.put_file(&script_path, &script).await?;
        self.run_command(&format!("chmod +x {script_path}"), RunOpts::default())
            .await?;
        self.reporter
            .line(&format!("Batch Job script resides in {script_path}"));

        Ok(script_path)
    }

    // -----------------------------------------------------------------------
    // Readiness polling
    // -----------------------------------------------------------------------

    /// Poll the log file until it contains the readiness marker, with a
    /// backoff between attempts and an overall deadline.
    async fn wait_for_server(&self, log_file: &str) -> ForwardResult<String> {
        self.reporter.status(&format!(
            "Parsing {log_file} log file on {} for Jupyter information",
            self.session.host
        ));

        let deadline = Instant::now() + LAUNCH_TIMEOUT;
        loop {
            let result = self
                .run_command(&format!("cat {log_file}"), RunOpts::probe())
                .await?;
            if result.success() && result.stdout.contains(READINESS_MARKER) {
                return Ok(result.stdout);
            }
            if result.failed() && !is_transient_read_failure(&result) {
                tracing::warn!(
                    exit_code = result.exit_code,
                    stderr = %result.stderr.trim(),
                    "log file read failed; retrying"
                );
            }
            if Instant::now() >= deadline {
                return Err(ForwardError::LaunchTimeout(LAUNCH_TIMEOUT.as_secs()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    // -----------------------------------------------------------------------
    // Port forwarding and tailing
    // -----------------------------------------------------------------------

    async fn forward_and_tail(&self, info: &ServerInfo, log_file: &str) -> ForwardResult<()> {
        self.reporter.rule("Setting up port forwarding");

        // Fail fast rather than forward to an incomplete target.
        let (remote_host, remote_port) = info
            .forward_target()
            .ok_or(ForwardError::IncompleteServerInfo)?;
        self.reporter.line(&format!(
            "remote_host: {remote_host}, remote_port: {remote_port}, local_port: {}",
            self.config.port
        ));

        let tunnel = self
            .session
            .forward_local(self.config.port, remote_host, remote_port)
            .await?;

        // The browser must not connect before the forward is live.
        tokio::time::sleep(BROWSER_GRACE).await;
        open_browser(
            Some(tunnel.local_port()),
            info.token.as_deref(),
            None,
            self.config.notebook.as_deref(),
            self.reporter,
        )?;

        let result = self.tail(log_file).await;
        drop(tunnel);
        result
    }

    /// Follow the server log until the remote side closes or the user
    /// interrupts.
    async fn tail(&self, log_file: &str) -> ForwardResult<()> {
        let command = wrap_command(&self.shell, &format!("tail -f {log_file}"));
        tokio::select! {
            result = self.session.exec_streaming(&command, |chunk| {
                self.reporter.raw(&String::from_utf8_lossy(chunk));
            }) => {
                result?;
            }
            _ = tokio::signal::ctrl_c() => {
                self.reporter.line("interrupt received, shutting down");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shell probing and wrapping
// ---------------------------------------------------------------------------

/// Resolve the remote login shell.
///
/// Both probes run as bare (unwrapped) commands: the login-shell wrapping of
/// `run_command` is not available until the shell is known.
async fn probe_shell(
    session: &Session,
    requested: Option<&str>,
    reporter: &dyn Reporter,
) -> ForwardResult<String> {
    reporter.rule("Verifying shell location");

    let shell = match requested {
        Some(name) => {
            let result = session.exec(&format!("which {name}"), true).await?;
            let path = result.stdout.trim().to_string();
            if result.failed() || path.is_empty() {
                return Err(ForwardError::ShellUndetermined);
            }
            path
        }
        None => {
            let result = session.exec("echo $SHELL || echo $0", true).await?;
            let shell = result
                .stdout
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or_default()
                .to_string();
            if shell.is_empty() {
                return Err(ForwardError::ShellUndetermined);
            }
            shell
        }
    };

    reporter.line(&format!("Using shell: {shell}"));
    Ok(shell)
}

/// Wrap `command` in the shell's invocation syntax.  The `-l` on the
/// non-csh branch forces a login shell so the remote environment and module
/// state are picked up.
pub fn wrap_command(shell: &str, command: &str) -> String {
    if shell.contains("csh") {
        format!("{shell} -c \"{command}\"")
    } else {
        format!("{shell} -lc \"{command}\"")
    }
}

/// Append shell-appropriate stdout+stderr redirection into `log_file`.
pub fn redirect_command(shell: &str, command: &str, log_file: &str) -> String {
    if shell.contains("csh") {
        format!("{command} >& {log_file}")
    } else {
        format!("{command} > {log_file} 2>&1")
    }
}

/// Whether the writability probe confirmed `dir`.  Keyed on the sentinel
/// string in stdout rather than the exit status; some remote shells report
/// nonstandard exit codes for compound commands.
fn confirms_writable(dir: &str, result: &RunResult) -> bool {
    result.stdout.contains(&format!("{dir} is WRITABLE"))
}

/// Whether a failed log read just means the file is not there yet.
fn is_transient_read_failure(result: &RunResult) -> bool {
    let text = format!("{} {}", result.stdout, result.stderr).to_lowercase();
    text.contains("no such file") || text.contains("not found")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
