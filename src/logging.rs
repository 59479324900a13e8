//! Log output with bot credentials masked.
//!
//! Every formatted line passes through [`LogRedactor`] before it reaches
//! stderr. reqwest and teloxide errors quote request URLs, and Telegram puts
//! the bot token in the URL path, so redaction happens on the writer rather
//! than at individual call sites.

use regex::Regex;
use std::io::{self, Write};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Replacement text for a masked credential
pub const MASK: &str = "[TELEGRAM_TOKEN]";

/// Masks bot tokens in log text
pub struct LogRedactor {
    /// Pattern and replacement, applied in order
    rules: Vec<(Regex, String)>,
    /// Exact secrets known at startup
    secrets: Vec<String>,
}

impl LogRedactor {
    /// Redactor for Telegram bot tokens in any position
    ///
    /// # Errors
    ///
    /// Returns an error if a built-in pattern fails to compile.
    pub fn new() -> Result<Self, regex::Error> {
        let rules = vec![
            // `.../bot<id>:<secret>/method` and bare `bot<id>:<secret>`
            (
                Regex::new(r"(bot[0-9]{6,12}:)[A-Za-z0-9_-]{20,}")?,
                format!("${{1}}{MASK}"),
            ),
            // Token pasted on its own
            (
                Regex::new(r"\b[0-9]{8,10}:[A-Za-z0-9_-]{35}\b")?,
                MASK.to_string(),
            ),
        ];
        Ok(Self {
            rules,
            secrets: Vec::new(),
        })
    }

    /// Also mask `secret` verbatim; blank values are ignored
    #[must_use]
    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        if let Some(secret) = secret.map(|s| s.trim().to_string()) {
            if !secret.is_empty() {
                self.secrets.push(secret);
            }
        }
        self
    }

    /// Returns `input` with every known credential masked
    #[must_use]
    pub fn redact(&self, input: &str) -> String {
        let mut output = input.to_string();
        for secret in &self.secrets {
            if output.contains(secret.as_str()) {
                output = output.replace(secret.as_str(), MASK);
            }
        }
        for (pattern, replacement) in &self.rules {
            output = pattern
                .replace_all(&output, replacement.as_str())
                .into_owned();
        }
        output
    }
}

/// Writer that redacts each buffer before forwarding it
pub struct RedactingWriter<W: Write> {
    inner: W,
    redactor: Arc<LogRedactor>,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        self.inner
            .write_all(self.redactor.redact(&text).as_bytes())?;
        // The whole input buffer counts as written even though lengths differ
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// [`MakeWriter`] wrapping every writer produced by `make_inner`
pub struct RedactingMakeWriter<F> {
    make_inner: F,
    redactor: Arc<LogRedactor>,
}

impl<F> RedactingMakeWriter<F> {
    /// Wrap `make_inner` so its output is redacted
    pub fn new(make_inner: F, redactor: Arc<LogRedactor>) -> Self {
        Self {
            make_inner,
            redactor,
        }
    }
}

impl<'a, F, W> MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: (self.make_inner)(),
            redactor: self.redactor.clone(),
        }
    }
}

/// Install the global subscriber: `RUST_LOG` filter (default `info`) and
/// redacted stderr output
pub fn init(redactor: LogRedactor) {
    let make_writer = RedactingMakeWriter::new(io::stderr, Arc::new(redactor));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}
