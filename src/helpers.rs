//! Small local-side utilities: port availability, browser URL handling, and
//! the per-run timestamp.

use chrono::Local;

use crate::errors::{ForwardError, ForwardResult};
use crate::output::Reporter;

/// Whether `port` can still be bound on the local loopback interface.
///
/// Binding (rather than connecting) is the probe: if something is already
/// listening, the bind fails.
pub fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Timestamp used for remote log/script file names, captured once per run.
pub fn run_timestamp() -> String {
    Local::now().format("%Y-%m-%dT%H-%M-%S").to_string()
}

/// Build the URL the browser should open.
///
/// When `url` is given it is passed through unchanged.  Otherwise the URL is
/// assembled from the forwarded local `port`, the auth `token`, and an
/// optional notebook `path` (opened via `/lab/tree/`).
pub fn notebook_url(
    port: Option<u16>,
    token: Option<&str>,
    url: Option<&str>,
    path: Option<&str>,
) -> ForwardResult<String> {
    if let Some(url) = url {
        return Ok(url.to_string());
    }
    let port = port.ok_or_else(|| {
        ForwardError::Config("please specify a port number or a URL to open".into())
    })?;
    let mut url = format!("http://localhost:{port}");
    if let Some(token) = token {
        url = format!("{url}/?token={token}");
    }
    if let Some(path) = path {
        url = format!("{url}/lab/tree/{path}");
    }
    Ok(url)
}

/// Open the notebook interface in a browser window.
///
/// A failure to launch the browser is reported but not fatal: the URL is
/// printed either way, so the user can open it by hand.
pub fn open_browser(
    port: Option<u16>,
    token: Option<&str>,
    url: Option<&str>,
    path: Option<&str>,
    reporter: &dyn Reporter,
) -> ForwardResult<()> {
    let url = notebook_url(port, token, url, path)?;
    reporter.rule("Opening Jupyter Lab interface in a browser");
    reporter.line(&format!("Jupyter Lab URL: {url}"));
    if let Err(e) = webbrowser::open(&url) {
        tracing::debug!(error = %e, "browser launch failed");
        reporter.line("could not launch a browser; open the URL above manually");
    }
    Ok(())
}

/// Whether `value` looks like a filesystem path rather than a bare name.
pub fn is_path(value: &str) -> bool {
    value.contains('/') || value.contains('\\')
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_available_when_nothing_listens() {
        // Bind an ephemeral port, release it, then probe it.
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(is_port_available(port));
    }

    #[test]
    fn port_unavailable_when_listener_bound() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_available(port));
        drop(listener);
    }

    #[test]
    fn url_from_port_and_token() {
        let url = notebook_url(Some(9999), Some("ssh"), None, None).unwrap();
        assert_eq!(url, "http://localhost:9999/?token=ssh");
    }

    #[test]
    fn url_passthrough_unchanged() {
        let url = notebook_url(None, None, Some("http://localhost:9999"), None).unwrap();
        assert_eq!(url, "http://localhost:9999");
    }

    #[test]
    fn url_with_notebook_path() {
        let url = notebook_url(Some(8888), Some("abc"), None, Some("demo.ipynb")).unwrap();
        assert_eq!(url, "http://localhost:8888/?token=abc/lab/tree/demo.ipynb");
    }

    #[test]
    fn url_requires_port_or_url() {
        let err = notebook_url(None, None, None, None).unwrap_err();
        assert!(matches!(err, crate::errors::ForwardError::Config(_)));
    }

    #[test]
    fn timestamp_shape() {
        let ts = run_timestamp();
        // 2026-08-27T13-45-09
        assert_eq!(ts.len(), 19);
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], "T");
    }

    #[test]
    fn path_detection() {
        assert!(is_path("/scratch/envs/x"));
        assert!(is_path("envs\\x"));
        assert!(!is_path("myenv"));
    }
}
