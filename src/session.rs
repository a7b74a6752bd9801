//! An authenticated SSH session and the operations the orchestrator needs
//! from it: collected exec, detached exec, streamed exec, remote file write,
//! and local port forwarding.
//!
//! All remote behavior is expressed through exec channels on a single
//! [`russh::client::Handle`]; nothing above this module touches `russh`
//! types.

use std::sync::{Arc, Mutex};

use russh::client::{Handle, Handler, Msg};
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::io::copy_bidirectional;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};

use crate::errors::{ForwardError, ForwardResult};

// ---------------------------------------------------------------------------
// Client handler
// ---------------------------------------------------------------------------

/// Transport event handler.  Host keys are accepted without verification,
/// matching `ssh -o StrictHostKeyChecking=no`; key management stays with the
/// user's existing SSH setup.
pub struct ClientHandler;

impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// RunResult
// ---------------------------------------------------------------------------

/// Outcome of one remote command execution.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub exit_code: u32,
    pub stdout: String,
    pub stderr: String,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn failed(&self) -> bool {
        !self.success()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// An authenticated, open SSH connection to the remote host.
pub struct Session {
    handle: Arc<Handle<ClientHandler>>,
    pub user: String,
    pub host: String,
}

impl Session {
    pub fn new(handle: Handle<ClientHandler>, user: String, host: String) -> Self {
        Self {
            handle: Arc::new(handle),
            user,
            host,
        }
    }

    async fn open_channel(&self, pty: bool) -> ForwardResult<Channel<Msg>> {
        let mut channel = self.handle.channel_open_session().await?;
        if pty {
            channel
                .request_pty(false, "xterm", 80, 24, 0, 0, &[])
                .await?;
        }
        Ok(channel)
    }

    /// Execute `command` and collect its output until the channel closes.
    pub async fn exec(&self, command: &str, pty: bool) -> ForwardResult<RunResult> {
        tracing::debug!(command, "executing remote command");
        let mut channel = self.open_channel(pty).await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = 0u32;

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                    stderr.extend_from_slice(&data)
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = exit_status,
                Some(ChannelMsg::Eof) | None => break,
                Some(_) => {}
            }
        }

        let result = RunResult {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        };
        tracing::debug!(exit_code = result.exit_code, "remote command completed");
        Ok(result)
    }

    /// Execute `command` without waiting for it: the exec request is issued
    /// and the channel is drained by a background task.  Used for the
    /// long-running notebook server launch; its output goes to the remote
    /// log file, not this channel.
    pub async fn exec_detached(&self, command: &str) -> ForwardResult<()> {
        tracing::debug!(command, "executing remote command (detached)");
        let mut channel = self.open_channel(true).await?;
        channel.exec(true, command).await?;

        tokio::spawn(async move {
            while let Some(msg) = channel.wait().await {
                if let ChannelMsg::ExitStatus { exit_status } = msg {
                    tracing::debug!(exit_status, "detached remote command exited");
                }
            }
        });
        Ok(())
    }

    /// Execute `command`, feeding output chunks to `on_output` as they
    /// arrive, until the channel closes.  Returns the exit status.
    pub async fn exec_streaming(
        &self,
        command: &str,
        mut on_output: impl FnMut(&[u8]),
    ) -> ForwardResult<u32> {
        tracing::debug!(command, "executing remote command (streaming)");
        let mut channel = self.open_channel(true).await?;
        channel.exec(true, command).await?;

        let mut exit_code = 0u32;
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => on_output(&data),
                Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => on_output(&data),
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = exit_status,
                Some(ChannelMsg::Eof) | None => break,
                Some(_) => {}
            }
        }
        Ok(exit_code)
    }

    /// Write `content` to `remote_path` by streaming it into `cat` on the
    /// remote side.  No shell quoting of the content is involved, so
    /// arbitrary script bodies are safe.
    pub async fn put_file(&self, remote_path: &str, content: &str) -> ForwardResult<()> {
        tracing::debug!(remote_path, bytes = content.len(), "writing remote file");
        let mut channel = self.open_channel(false).await?;
        channel.exec(true, format!("cat > {remote_path}")).await?;
        channel.data(content.as_bytes()).await?;
        channel.eof().await?;

        let mut exit_code = 0u32;
        loop {
            match channel.wait().await {
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = exit_status,
                Some(_) => {}
                None => break,
            }
        }
        if exit_code != 0 {
            return Err(ForwardError::Remote(format!(
                "writing {remote_path} failed with exit code {exit_code}"
            )));
        }
        Ok(())
    }

    /// Open a local-to-remote forwarded port.
    ///
    /// Binds `127.0.0.1:<local_port>` and relays each accepted connection
    /// over a fresh direct-tcpip channel to `remote_host:remote_port`.  The
    /// returned [`Tunnel`] tears the listener down when dropped.
    pub async fn forward_local(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> ForwardResult<Tunnel> {
        let listener = TcpListener::bind(("127.0.0.1", local_port))
            .await
            .map_err(|_| ForwardError::PortInUse(local_port))?;

        let handle = Arc::clone(&self.handle);
        let remote_host = remote_host.to_string();
        let relays: Arc<Mutex<JoinSet<()>>> = Arc::new(Mutex::new(JoinSet::new()));
        let relay_set = Arc::clone(&relays);

        let task = tokio::spawn(async move {
            loop {
                let Ok((mut stream, peer)) = listener.accept().await else {
                    break;
                };
                tracing::debug!(%peer, "tunnel connection accepted");

                let handle = Arc::clone(&handle);
                let remote_host = remote_host.clone();
                let relay = async move {
                    match handle
                        .channel_open_direct_tcpip(&remote_host, remote_port.into(), "127.0.0.1", 0)
                        .await
                    {
                        Ok(channel) => {
                            let mut remote = channel.into_stream();
                            if let Err(e) = copy_bidirectional(&mut stream, &mut remote).await {
                                tracing::debug!(error = %e, "tunnel relay ended");
                            }
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "direct-tcpip channel failed");
                        }
                    }
                };
                if let Ok(mut set) = relay_set.lock() {
                    set.spawn(relay);
                }
            }
        });

        Ok(Tunnel {
            task,
            relays,
            local_port,
        })
    }

    /// Disconnect cleanly.  Errors are ignored; the transport may already be
    /// gone when this runs on a failure path.
    pub async fn close(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}

// ---------------------------------------------------------------------------
// Tunnel
// ---------------------------------------------------------------------------

/// A live local-to-remote port forward.  Dropping it stops the accept loop
/// and aborts every in-flight relay, whatever path execution left the owning
/// scope by.
#[derive(Debug)]
pub struct Tunnel {
    task: JoinHandle<()>,
    relays: Arc<Mutex<JoinSet<()>>>,
    local_port: u16,
}

impl Tunnel {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.task.abort();
        if let Ok(mut relays) = self.relays.lock() {
            relays.abort_all();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_result_success() {
        let result = RunResult {
            exit_code: 0,
            stdout: "ok".into(),
            stderr: String::new(),
        };
        assert!(result.success());
        assert!(!result.failed());
    }

    #[test]
    fn run_result_failure() {
        let result = RunResult {
            exit_code: 127,
            stdout: String::new(),
            stderr: "command not found".into(),
        };
        assert!(result.failed());
    }
}
