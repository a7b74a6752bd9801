//! SSH session establishment.
//!
//! Authentication runs as a chain: an explicit identity file when given,
//! otherwise passwordless methods (ssh-agent, then the default key files in
//! `~/.ssh`), and finally a bounded interactive loop — keyboard-interactive
//! with a multi-prompt handler, falling back to a single hidden password
//! prompt when the server does not offer it.
//!
//! Passwordless failures are suppressed (traced at debug level) so the chain
//! falls through; the last underlying cause is carried into the final
//! `AuthFailed` error instead of being masked by a generic message.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, AuthResult, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::{Algorithm, PrivateKeyWithHashAlg, load_secret_key};

use crate::errors::{ForwardError, ForwardResult};
use crate::output::Reporter;
use crate::session::{ClientHandler, Session};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const INTERACTIVE_ATTEMPTS: usize = 2;

// ---------------------------------------------------------------------------
// Host spec
// ---------------------------------------------------------------------------

/// A parsed `[user@]host[:port]` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl HostSpec {
    /// Parse a target string, defaulting the user to `$USER` and the port
    /// to 22.
    pub fn parse(raw: &str) -> ForwardResult<Self> {
        let (user, rest) = match raw.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (user.to_string(), rest),
            Some(_) => {
                return Err(ForwardError::Config(format!("invalid host spec: {raw}")));
            }
            None => (local_user()?, raw),
        };

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    ForwardError::Config(format!("invalid port in host spec: {raw}"))
                })?;
                (host, port)
            }
            None => (rest, 22),
        };

        if host.is_empty() {
            return Err(ForwardError::Config(format!("invalid host spec: {raw}")));
        }

        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }
}

fn local_user() -> ForwardResult<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .map_err(|_| {
            ForwardError::Config("could not determine the local user; use user@host".into())
        })
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into())
}

// ---------------------------------------------------------------------------
// Prompting seam
// ---------------------------------------------------------------------------

/// Interactive credential source, pluggable so tests can inject canned
/// responses.
pub trait AuthPrompter: Send + Sync {
    /// Answer a keyboard-interactive info request: one response per prompt,
    /// in order.  `echo` marks prompts whose input may be shown.
    fn interactive(
        &self,
        name: &str,
        instructions: &str,
        prompts: &[(String, bool)],
    ) -> ForwardResult<Vec<String>>;

    /// A single hidden secret (password fallback, key passphrase).
    fn secret(&self, prompt: &str) -> ForwardResult<String>;
}

/// Prompts on the controlling terminal.
pub struct TerminalPrompter;

impl AuthPrompter for TerminalPrompter {
    fn interactive(
        &self,
        name: &str,
        instructions: &str,
        prompts: &[(String, bool)],
    ) -> ForwardResult<Vec<String>> {
        if !name.is_empty() {
            eprintln!("{name}");
        }
        if !instructions.is_empty() {
            eprintln!("{instructions}");
        }
        prompts
            .iter()
            .map(|(prompt, _echo)| Ok(rpassword::prompt_password(prompt)?))
            .collect()
    }

    fn secret(&self, prompt: &str) -> ForwardResult<String> {
        Ok(rpassword::prompt_password(format!("{prompt}: "))?)
    }
}

// ---------------------------------------------------------------------------
// Connection + authentication chain
// ---------------------------------------------------------------------------

/// Connect to `spec` and authenticate, producing an open [`Session`].
pub async fn connect(
    spec: &HostSpec,
    identity: Option<&Path>,
    prompter: &dyn AuthPrompter,
    reporter: &dyn Reporter,
) -> ForwardResult<Session> {
    reporter.rule("Authenticating");
    reporter.line(&format!(
        "Authenticating user ({}) from client ({}) to remote host ({})",
        spec.user,
        local_hostname(),
        spec.host
    ));

    let config = client::Config {
        keepalive_interval: Some(Duration::from_secs(15)),
        keepalive_max: 3,
        ..Default::default()
    };

    let addr = format!("{}:{}", spec.host, spec.port);
    let mut handle = tokio::time::timeout(
        CONNECT_TIMEOUT,
        client::connect(Arc::new(config), addr, ClientHandler),
    )
    .await
    .map_err(|_| ForwardError::ConnectionFailed {
        host: spec.host.clone(),
        reason: "connection timed out".into(),
    })?
    .map_err(|e| ForwardError::ConnectionFailed {
        host: spec.host.clone(),
        reason: e.to_string(),
    })?;

    let mut last_cause: Option<String> = None;
    let mut authenticated = if let Some(identity) = identity {
        try_identity_file(&mut handle, &spec.user, identity, prompter).await?
    } else {
        match try_passwordless(&mut handle, &spec.user).await {
            Ok(ok) => ok,
            Err(e) => {
                // Fall through to interactive auth rather than propagating.
                tracing::debug!(error = %e, "passwordless authentication failed");
                last_cause = Some(e.to_string());
                false
            }
        }
    };

    if !authenticated {
        for attempt in 1..=INTERACTIVE_ATTEMPTS {
            match try_interactive(&mut handle, spec, prompter).await {
                Ok(true) => {
                    authenticated = true;
                    break;
                }
                Ok(false) => {
                    reporter.line("Failed to authenticate your connection");
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "interactive authentication errored");
                    last_cause = Some(e.to_string());
                    reporter.line("Failed to authenticate your connection");
                }
            }
        }
    }

    if !authenticated {
        return Err(ForwardError::AuthFailed {
            user: spec.user.clone(),
            host: spec.host.clone(),
            cause: last_cause,
        });
    }

    reporter.line("The client is authenticated successfully");
    Ok(Session::new(handle, spec.user.clone(), spec.host.clone()))
}

/// Key-based auth with an explicit identity file.  An unloadable or rejected
/// identity is an error, not a fallthrough: the user asked for this key.
async fn try_identity_file(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    identity: &Path,
    prompter: &dyn AuthPrompter,
) -> ForwardResult<bool> {
    let key = match load_secret_key(identity, None) {
        Ok(key) => key,
        Err(load_err) => {
            // Likely passphrase-protected; ask once.
            let passphrase =
                prompter.secret(&format!("Passphrase for key {}", identity.display()))?;
            load_secret_key(identity, Some(&passphrase)).map_err(|_| {
                ForwardError::IdentityUnusable {
                    path: identity.to_path_buf(),
                    reason: load_err.to_string(),
                }
            })?
        }
    };

    publickey_auth(handle, user, key).await
}

/// Agent identities, then the conventional key files in `~/.ssh`.
async fn try_passwordless(
    handle: &mut Handle<ClientHandler>,
    user: &str,
) -> ForwardResult<bool> {
    if try_agent(handle, user).await? {
        return Ok(true);
    }

    let Some(keys_dir) = dirs::home_dir().map(|home| home.join(".ssh")) else {
        return Ok(false);
    };

    for name in ["id_ed25519", "id_rsa", "id_ecdsa"] {
        let key_path = keys_dir.join(name);
        if !key_path.exists() {
            continue;
        }
        let key = match load_secret_key(&key_path, None) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(key = %key_path.display(), error = %e, "skipping unloadable key");
                continue;
            }
        };
        match publickey_auth(handle, user, key).await {
            Ok(true) => {
                tracing::debug!(key = %key_path.display(), "key accepted");
                return Ok(true);
            }
            Ok(false) => tracing::debug!(key = %key_path.display(), "key not accepted"),
            Err(e) => tracing::debug!(key = %key_path.display(), error = %e, "key auth errored"),
        }
    }

    Ok(false)
}

async fn try_agent(handle: &mut Handle<ClientHandler>, user: &str) -> ForwardResult<bool> {
    #[cfg(unix)]
    {
        use russh::keys::agent::client::AgentClient;

        let mut agent = match AgentClient::connect_env().await {
            Ok(agent) => agent,
            Err(e) => {
                tracing::debug!(error = %e, "no usable ssh-agent");
                return Ok(false);
            }
        };
        let identities = match agent.request_identities().await {
            Ok(identities) => identities,
            Err(e) => {
                tracing::debug!(error = %e, "ssh-agent identity listing failed");
                return Ok(false);
            }
        };

        for key in identities {
            match handle
                .authenticate_publickey_with(user, key, None, &mut agent)
                .await
            {
                Ok(result) if result.success() => return Ok(true),
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "ssh-agent key errored");
                    continue;
                }
            }
        }
        Ok(false)
    }

    #[cfg(not(unix))]
    {
        let _ = (handle, user);
        Ok(false)
    }
}

async fn publickey_auth(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    key: russh::keys::PrivateKey,
) -> ForwardResult<bool> {
    // RSA keys need the strongest hash the server supports; other key types
    // ignore the hint.
    let hash_alg = if matches!(key.algorithm(), Algorithm::Rsa { .. }) {
        handle.best_supported_rsa_hash().await?.flatten()
    } else {
        None
    };

    let result = handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
        .await?;
    Ok(matches!(result, AuthResult::Success))
}

/// One interactive attempt: drive keyboard-interactive prompts, or fall back
/// to a single password prompt when the method is unavailable.
async fn try_interactive(
    handle: &mut Handle<ClientHandler>,
    spec: &HostSpec,
    prompter: &dyn AuthPrompter,
) -> ForwardResult<bool> {
    let mut response = match handle
        .authenticate_keyboard_interactive_start(spec.user.as_str(), None)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(error = %e, "keyboard-interactive unavailable");
            return password_fallback(handle, spec, prompter).await;
        }
    };

    let mut answered_any = false;
    loop {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::Failure { .. } => {
                if answered_any {
                    // The server offered prompts and rejected the answers.
                    return Ok(false);
                }
                // Rejected outright: the method is effectively unsupported.
                return password_fallback(handle, spec, prompter).await;
            }
            KeyboardInteractiveAuthResponse::InfoRequest {
                ref name,
                ref instructions,
                ref prompts,
            } => {
                let prompts: Vec<(String, bool)> = prompts
                    .iter()
                    .map(|p| (p.prompt.clone(), p.echo))
                    .collect();
                let answers = prompter.interactive(name, instructions, &prompts)?;
                answered_any = answered_any || !prompts.is_empty();
                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await?;
            }
        }
    }
}

async fn password_fallback(
    handle: &mut Handle<ClientHandler>,
    spec: &HostSpec,
    prompter: &dyn AuthPrompter,
) -> ForwardResult<bool> {
    let password = prompter.secret(&format!("{}@{}'s password", spec.user, spec.host))?;
    let result = handle
        .authenticate_password(spec.user.as_str(), &password)
        .await?;
    Ok(matches!(result, AuthResult::Success))
}

/// Resolve the identity path, erroring early when it does not exist.
pub fn check_identity(identity: Option<&Path>) -> ForwardResult<Option<PathBuf>> {
    match identity {
        Some(path) if path.exists() => Ok(Some(path.to_path_buf())),
        Some(path) => Err(ForwardError::IdentityUnusable {
            path: path.to_path_buf(),
            reason: "file does not exist".into(),
        }),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_spec_full() {
        let spec = HostSpec::parse("alice@hpc.example.org:2222").unwrap();
        assert_eq!(
            spec,
            HostSpec {
                user: "alice".into(),
                host: "hpc.example.org".into(),
                port: 2222,
            }
        );
    }

    #[test]
    fn host_spec_defaults_port() {
        let spec = HostSpec::parse("alice@hpc.example.org").unwrap();
        assert_eq!(spec.port, 22);
    }

    #[test]
    fn host_spec_rejects_bad_port() {
        assert!(HostSpec::parse("alice@host:notaport").is_err());
    }

    #[test]
    fn host_spec_rejects_empty_user() {
        assert!(HostSpec::parse("@host").is_err());
    }

    #[test]
    fn host_spec_rejects_empty_host() {
        assert!(HostSpec::parse("alice@").is_err());
    }

    #[test]
    fn identity_check_missing_file() {
        let err = check_identity(Some(Path::new("/definitely/not/here"))).unwrap_err();
        assert!(matches!(err, ForwardError::IdentityUnusable { .. }));
    }

    #[test]
    fn identity_check_none_passes() {
        assert_eq!(check_identity(None).unwrap(), None);
    }

    #[test]
    fn identity_check_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_ed25519");
        std::fs::write(&path, "key material").unwrap();
        assert_eq!(check_identity(Some(&path)).unwrap(), Some(path));
    }
}
