use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("config: {0}")]
    Config(String),

    #[error("config: `--notebook-dir` and `--notebook` are mutually exclusive")]
    ConflictingNotebookOptions,

    #[error("local port {0} is already in use on your machine; try a different --port")]
    PortInUse(u16),

    #[error("ssh: could not connect to {host}: {reason}")]
    ConnectionFailed { host: String, reason: String },

    #[error("ssh: authentication failed for {user}@{host}{}", .cause.as_ref().map(|c| format!(" ({c})")).unwrap_or_default())]
    AuthFailed {
        user: String,
        host: String,
        cause: Option<String>,
    },

    #[error("ssh: could not load identity file {path}: {reason}")]
    IdentityUnusable { path: PathBuf, reason: String },

    #[error("could not determine the remote shell; specify one using --shell")]
    ShellUndetermined,

    #[error(
        "no conda-like package manager found; ensure micromamba, mamba, or conda are installed"
    )]
    EnvManagerNotFound,

    #[error(
        "could not find `{0}`; make sure it is in PATH, or provide an absolute path using --env-manager-path"
    )]
    EnvManagerUnresolved(String),

    #[error("unknown environment manager `{0}`")]
    UnknownEnvManager(String),

    #[error(
        "checking for `jupyter` failed; make sure your environment exists and has `jupyter` installed"
    )]
    JupyterNotFound,

    #[error("remote command failed with exit code {exit_code}: {command}")]
    CommandFailed { command: String, exit_code: u32 },

    #[error("cannot determine a directory for the log file: $TMPDIR and $HOME are both undefined")]
    ScratchUndetermined,

    #[error("remote directory {0} is not writable")]
    ScratchNotWritable(String),

    #[error("timed out after {0}s waiting for the notebook server to report readiness")]
    LaunchTimeout(u64),

    #[error("server log contained no usable connection URL (hostname/port missing)")]
    IncompleteServerInfo,

    #[error("remote: {0}")]
    Remote(String),

    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ForwardResult<T> = Result<T, ForwardError>;
