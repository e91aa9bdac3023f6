//! Log line layout for the heartbeat node.
//!
//! Every line carries the peer it concerns, so the interleaved output of many
//! monitored connections can be followed with a plain `grep <addr>`:
//!
//! ```text
//! 2026-10-19 10:06:22.534 WARN  dialer   127.0.0.1:9100        Connection declared broken
//! 2026-10-19 10:06:21.530 DEBUG session  127.0.0.1:9100        Sent probe (1 byte(s)) probe=2 max_probes=3
//! ```
//!
//! The role column comes from a `role` field, falling back to the crate
//! that emitted the event. `peer` fills the address column. Any other
//! structured field is appended as `key=value`.

use std::fmt::{self, Write as _};
use std::io::IsTerminal;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const ROLE_WIDTH: usize = 8;
/// Fits `255.255.255.255:65535`
const PEER_WIDTH: usize = 21;

/// Event formatter for `tracing_subscriber::fmt`
pub struct NodeLogFormatter {
    ansi: bool,
}

impl Default for NodeLogFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeLogFormatter {
    /// Colour the level token when stdout is an interactive terminal
    pub fn new() -> Self {
        let dumb = std::env::var("TERM").map(|t| t == "dumb").unwrap_or(false);
        Self {
            ansi: !dumb && std::io::stdout().is_terminal(),
        }
    }

    fn level_token(&self, level: &Level) -> String {
        let (name, color) = match *level {
            Level::ERROR => ("ERROR", "\x1b[91m"),
            Level::WARN => ("WARN", "\x1b[93m"),
            Level::INFO => ("INFO", "\x1b[32m"),
            Level::DEBUG => ("DEBUG", "\x1b[90m"),
            Level::TRACE => ("TRACE", "\x1b[90m"),
        };
        if self.ansi {
            format!("{}{:<5}\x1b[0m", color, name)
        } else {
            format!("{:<5}", name)
        }
    }

    fn render(&self, level: &Level, target: &str, fields: &EventFields) -> String {
        let role = fields
            .role
            .clone()
            .unwrap_or_else(|| short_target(target).to_string());
        let peer = fields.peer.as_deref().unwrap_or("-");

        let mut line = format!(
            "{} {:<role_w$} {:<peer_w$} {}",
            self.level_token(level),
            role,
            peer,
            fields.message,
            role_w = ROLE_WIDTH,
            peer_w = PEER_WIDTH,
        );
        for (key, value) in &fields.extra {
            let _ = write!(line, " {}={}", key, value);
        }
        line
    }
}

impl<S, N> FormatEvent<S, N> for NodeLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut fields = EventFields::default();
        event.record(&mut fields);

        let metadata = event.metadata();
        writeln!(
            writer,
            "{} {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            self.render(metadata.level(), metadata.target(), &fields)
        )
    }
}

/// `heartbeat_session::session` -> `session`, `redb_heartbeat` -> `node`
fn short_target(target: &str) -> &str {
    let krate = target.split("::").next().unwrap_or(target);
    match krate {
        "heartbeat_session" => "session",
        "redb_heartbeat" => "node",
        other => other,
    }
}

#[derive(Default)]
struct EventFields {
    message: String,
    role: Option<String>,
    peer: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl Visit for EventFields {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record_str(field, &format!("{:?}", value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "role" => self.role = Some(value.to_string()),
            "peer" => self.peer = Some(value.to_string()),
            name => self.extra.push((name, value.to_string())),
        }
    }
}
