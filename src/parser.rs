//! Extraction of connection parameters from the raw notebook server log.
//!
//! The server prints its access URLs as free text.  We collect every
//! `http(s)://…` substring, discard loopback-only URLs, and take the host,
//! port, and `token` query parameter from the first qualifying match.
//! Matches are kept in a sorted set so the pick is deterministic even when
//! the log contains several equivalent URLs.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"http[s]?://(?:[a-zA-Z]|[0-9]|[$-_@.&+]|[!*\(\),]|(?:%[0-9a-fA-F][0-9a-fA-F]))+")
        .expect("URL pattern is valid")
});

/// Connection parameters recovered from the server log.
///
/// All fields are `None` when the log contained no non-loopback URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub token: Option<String>,
    pub url: Option<String>,
}

impl ServerInfo {
    /// The forwarding target, available only when both hostname and port
    /// were recovered.
    pub fn forward_target(&self) -> Option<(&str, u16)> {
        match (&self.hostname, self.port) {
            (Some(host), Some(port)) => Some((host.as_str(), port)),
            _ => None,
        }
    }
}

/// Parse the captured log text into a [`ServerInfo`].
pub fn parse_stdout(stdout: &str) -> ServerInfo {
    let urls: BTreeSet<&str> = URL_RE.find_iter(stdout).map(|m| m.as_str()).collect();

    for raw in urls {
        let Ok(parsed) = Url::parse(raw) else {
            continue;
        };
        let Some(host) = parsed.host_str() else {
            continue;
        };
        if host == "127.0.0.1" {
            continue;
        }
        let Some(port) = parsed.port() else {
            continue;
        };

        let token = parsed
            .query_pairs()
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned());

        return ServerInfo {
            hostname: Some(host.to_string()),
            port: Some(port),
            token,
            url: Some(raw.to_string()),
        };
    }

    ServerInfo::default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_LOG: &str = r#"
[I 2021-09-28 14:12:23.424 ServerApp] jupyterlab | extension was successfully loaded.
[I 2021-09-28 14:12:24.883 ServerApp] Serving notebooks from local directory: /glade/u/home/dev
[I 2021-09-28 14:12:24.883 ServerApp] Jupyter Server 1.4.1 is running at:
[I 2021-09-28 14:12:24.883 ServerApp] http://eniac01:59628/?token=Loremipsumdolorsitamet
[I 2021-09-28 14:12:24.883 ServerApp]  or http://127.0.0.1:59628/?token=Loremipsumdolorsitamet
[I 2021-09-28 14:12:24.884 ServerApp] Use Control-C to stop this server
"#;

    #[test]
    fn no_urls_yields_all_none() {
        let info = parse_stdout("nothing to see here\njust plain log lines\n");
        assert_eq!(info, ServerInfo::default());
    }

    #[test]
    fn loopback_only_yields_all_none() {
        let info = parse_stdout("http://127.0.0.1:8888/?token=abcdef\n");
        assert_eq!(info, ServerInfo::default());
    }

    #[test]
    fn single_url_with_token() {
        let info = parse_stdout("serving at http://node42:8888/?token=secret\n");
        assert_eq!(info.hostname.as_deref(), Some("node42"));
        assert_eq!(info.port, Some(8888));
        assert_eq!(info.token.as_deref(), Some("secret"));
        assert_eq!(info.url.as_deref(), Some("http://node42:8888/?token=secret"));
    }

    #[test]
    fn url_without_token() {
        let info = parse_stdout("http://node42:8888/lab\n");
        assert_eq!(info.hostname.as_deref(), Some("node42"));
        assert_eq!(info.port, Some(8888));
        assert_eq!(info.token, None);
    }

    #[test]
    fn url_without_port_is_not_qualifying() {
        let info = parse_stdout("see https://jupyter.org/ for docs\n");
        assert_eq!(info, ServerInfo::default());
    }

    #[test]
    fn full_sample_log_prefers_non_loopback() {
        let info = parse_stdout(SAMPLE_LOG);
        assert_eq!(info.hostname.as_deref(), Some("eniac01"));
        assert_eq!(info.port, Some(59628));
        assert_eq!(info.token.as_deref(), Some("Loremipsumdolorsitamet"));
        assert_eq!(
            info.url.as_deref(),
            Some("http://eniac01:59628/?token=Loremipsumdolorsitamet")
        );
    }

    #[test]
    fn forward_target_requires_both_fields() {
        let mut info = parse_stdout(SAMPLE_LOG);
        assert_eq!(info.forward_target(), Some(("eniac01", 59628)));
        info.port = None;
        assert_eq!(info.forward_target(), None);
    }

    #[test]
    fn duplicate_urls_are_deduplicated() {
        let log = "http://node1:9000/?token=t\nhttp://node1:9000/?token=t\n";
        let info = parse_stdout(log);
        assert_eq!(info.hostname.as_deref(), Some("node1"));
        assert_eq!(info.port, Some(9000));
    }
}
