use std::fmt;
use std::io::IsTerminal;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::types::LogFormat;

/// Console formatter for the pretty log format.
///
/// Events carrying an `accepted` field get an `[ALLOW]` or `[DENY]` tag, as
/// do the handful of forced-close messages. Usernames, passwords and commands
/// in log fields come straight from the peer, so control characters are
/// escaped before anything reaches the terminal.
pub struct VerdictFormatter<E> {
    inner: E,
    ansi: bool,
}

impl<E> VerdictFormatter<E> {
    pub fn new(inner: E, ansi: bool) -> Self {
        Self { inner, ansi }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Allow,
    Deny,
}

impl Verdict {
    fn tag(self, ansi: bool) -> &'static str {
        match (self, ansi) {
            (Verdict::Allow, true) => "\x1b[34m[ALLOW]\x1b[0m ",
            (Verdict::Allow, false) => "[ALLOW] ",
            (Verdict::Deny, true) => "\x1b[31m[DENY]\x1b[0m ",
            (Verdict::Deny, false) => "[DENY] ",
        }
    }
}

impl<S, N, E> FormatEvent<S, N> for VerdictFormatter<E>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    E: FormatEvent<S, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = VerdictVisitor::default();
        event.record(&mut visitor);
        if let Some(verdict) = visitor.verdict() {
            writer.write_str(verdict.tag(self.ansi))?;
        }

        let mut buf = String::new();
        self.inner.format_event(ctx, Writer::new(&mut buf), event)?;
        let line = escape_controls(&buf);
        if self.ansi {
            writer.write_str(&colorize_fields(&line))
        } else {
            writer.write_str(&line)
        }
    }
}

/// Picks up the message and an optional `accepted` flag from an event.
#[derive(Default)]
struct VerdictVisitor {
    message: String,
    accepted: Option<bool>,
}

impl VerdictVisitor {
    fn verdict(&self) -> Option<Verdict> {
        match self.accepted {
            Some(true) => Some(Verdict::Allow),
            Some(false) => Some(Verdict::Deny),
            None if is_forced_close(&self.message.to_lowercase()) => Some(Verdict::Deny),
            None => None,
        }
    }
}

impl Visit for VerdictVisitor {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "accepted" {
            self.accepted = Some(value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
}

/// Messages that mean we cut the peer off.
fn is_forced_close(msg: &str) -> bool {
    msg.contains("closing connection")
        || msg.contains("closing channel")
        || msg.contains("exceeded")
}

/// Render C0 controls (other than newline and tab), DEL and C1 controls as
/// `\xNN` so peer-supplied text cannot drive the terminal.
pub fn escape_controls(line: &str) -> String {
    if !line
        .chars()
        .any(|c| c.is_control() && c != '\n' && c != '\t')
    {
        return line.to_string();
    }
    let mut out = String::with_capacity(line.len() + 8);
    for c in line.chars() {
        if c.is_control() && c != '\n' && c != '\t' {
            out.push_str(&format!("\\x{:02x}", c as u32));
        } else {
            out.push(c);
        }
    }
    out
}

/// Field name → ANSI color. Peer-supplied values are yellow, addresses
/// magenta, correlation ids dim.
const FIELD_COLORS: &[(&str, &str)] = &[
    ("user", "36"),
    ("method", "36"),
    ("command", "33"),
    ("target", "33"),
    ("peer", "35"),
    ("ip", "35"),
    ("conn_id", "2"),
    ("channel", "2"),
    ("reason", "31"),
    ("error", "31"),
];

/// Colorize `name=` for known fields. Only matches at a field boundary so
/// `user=` inside a value such as `command=adduser=x` is left alone.
fn colorize_fields(line: &str) -> String {
    let mut out = String::with_capacity(line.len() + 32);
    let mut rest = line;
    let mut at_boundary = true;
    while let Some(c) = rest.chars().next() {
        if at_boundary {
            if let Some((field, color)) = FIELD_COLORS
                .iter()
                .find(|(field, _)| rest.starts_with(field) && rest[field.len()..].starts_with('='))
            {
                out.push_str(&format!("\x1b[{}m{}=\x1b[0m", color, field));
                rest = &rest[field.len() + 1..];
                at_boundary = false;
                continue;
            }
        }
        out.push(c);
        at_boundary = c == ' ' || c == '{';
        rest = &rest[c.len_utf8()..];
    }
    out
}

/// Initialize the global tracing subscriber.
///
/// JSON output is left to `tracing_subscriber`'s own formatter, which already
/// escapes string values.
pub fn setup_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_current_span(true)
                .with_env_filter(filter)
                .init();
        }
        LogFormat::Pretty => {
            let ansi = std::io::stdout().is_terminal();
            let default_format = tracing_subscriber::fmt::format::Format::default();
            tracing_subscriber::fmt()
                .event_format(VerdictFormatter::new(default_format, ansi))
                .with_env_filter(filter)
                .init();
        }
    }
}
