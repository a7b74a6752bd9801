//! User-facing progress output.
//!
//! Every component that talks to the user receives a [`Reporter`] rather
//! than writing to a process-wide console.  [`Terminal`] styles output for an
//! interactive run; [`Silent`] discards everything (tests).
//!
//! This is deliberately separate from `tracing`: the tracing layer carries
//! debug diagnostics, the reporter carries the progress narrative.

use console::style;

// ---------------------------------------------------------------------------
// Reporter trait
// ---------------------------------------------------------------------------

/// An output sink with the three shapes of message this tool emits.
pub trait Reporter: Send + Sync {
    /// A plain progress line.
    fn line(&self, msg: &str);

    /// A horizontal rule with a section title.
    fn rule(&self, title: &str);

    /// A transient status note (e.g. "waiting for the server log").
    fn status(&self, msg: &str);

    /// Raw output passed through verbatim (streamed remote output).
    fn raw(&self, chunk: &str);
}

// ---------------------------------------------------------------------------
// Terminal
// ---------------------------------------------------------------------------

/// Styled reporter writing to stderr, leaving stdout for streamed remote
/// output.
pub struct Terminal;

const RULE_WIDTH: usize = 72;

impl Reporter for Terminal {
    fn line(&self, msg: &str) {
        eprintln!("{msg}");
    }

    fn rule(&self, title: &str) {
        let title = format!(" {title} ");
        let pad = RULE_WIDTH.saturating_sub(title.len());
        let left = pad / 2;
        let right = pad - left;
        eprintln!(
            "{}{}{}",
            style("*".repeat(left)).green(),
            style(title).green().bold(),
            style("*".repeat(right)).green()
        );
    }

    fn status(&self, msg: &str) {
        eprintln!("{} {msg}", style("…").cyan());
    }

    fn raw(&self, chunk: &str) {
        print!("{chunk}");
    }
}

// ---------------------------------------------------------------------------
// Silent
// ---------------------------------------------------------------------------

/// A reporter that discards everything.
pub struct Silent;

impl Reporter for Silent {
    fn line(&self, _msg: &str) {}
    fn rule(&self, _title: &str) {}
    fn status(&self, _msg: &str) {}
    fn raw(&self, _chunk: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_reporter_accepts_all_shapes() {
        let reporter: &dyn Reporter = &Silent;
        reporter.line("line");
        reporter.rule("rule");
        reporter.status("status");
        reporter.raw("raw");
    }
}
