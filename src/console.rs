//! Line-oriented operator console.
//!
//! Renders hub events as text (or JSON lines) and parses what the operator
//! types. The `cls` sentinel clears the view locally and never reaches an
//! agent.

use std::io::{self, Write};
use std::net::SocketAddr;

use crossterm::{cursor::MoveTo, execute, terminal::{Clear, ClearType}};

use crate::events::{self, HubEvent, Observer};
use crate::session::{DisconnectReason, SessionInfo};

/// One line of operator input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorInput {
    /// Blank line.
    Empty,
    /// `:list`: show connected agents with their positions.
    List,
    /// `:select N`: target the agent at position N.
    Select(usize),
    /// `cls`: clear the output view.
    Clear,
    /// `:quit`: shut the hub down.
    Quit,
    /// Anything else is sent to the selected agent.
    Command(String),
}

impl OperatorInput {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Empty);
        }
        if line == "cls" {
            return Ok(Self::Clear);
        }
        let Some(meta) = line.strip_prefix(':') else {
            return Ok(Self::Command(line.to_string()));
        };

        let mut parts = meta.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("list"), None, _) => Ok(Self::List),
            (Some("quit"), None, _) => Ok(Self::Quit),
            (Some("select"), Some(n), None) => n
                .parse()
                .map(Self::Select)
                .map_err(|_| format!("invalid position: {n}")),
            (Some("select"), _, _) => Err("usage: :select <position>".to_string()),
            _ => Err(format!("unknown console command: {line}")),
        }
    }
}

/// Writes hub events and console messages to `out`.
pub struct ConsoleObserver<W: Write> {
    out: W,
    json: bool,
}

impl<W: Write> ConsoleObserver<W> {
    pub fn new(out: W, json: bool) -> Self {
        Self { out, json }
    }

    /// Render one event, as a JSON line if requested.
    pub fn handle(&mut self, event: &HubEvent) {
        if self.json {
            match serde_json::to_string(event) {
                Ok(line) => self.write_line(&line),
                Err(e) => tracing::warn!(?e, "failed to serialize event"),
            }
        } else {
            events::deliver(self, event);
        }
    }

    /// Print the positional list of connected agents.
    pub fn show_sessions(&mut self, sessions: &[SessionInfo]) {
        if sessions.is_empty() {
            self.write_line("No agents connected");
            return;
        }
        for (position, s) in sessions.iter().enumerate() {
            self.write_line(&format!("{position:>3}  {}  [{}]", s.addr, s.identity));
        }
    }

    pub fn notice(&mut self, text: &str) {
        self.write_line(text);
    }

    /// Clear the output view.
    pub fn clear(&mut self) -> io::Result<()> {
        execute!(self.out, Clear(ClearType::All), MoveTo(0, 0))
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_line(&mut self, line: &str) {
        if let Err(e) = writeln!(self.out, "{line}").and_then(|_| self.out.flush()) {
            tracing::debug!(?e, "console write failed");
        }
    }
}

impl<W: Write> Observer for ConsoleObserver<W> {
    fn on_connected(&mut self, identity: &str, addr: SocketAddr) {
        self.write_line(&format!("A new connection from [{identity}]:{addr}!"));
    }

    fn on_disconnected(&mut self, identity: &str, addr: SocketAddr, reason: &DisconnectReason) {
        self.write_line(&reason.describe(identity, addr));
    }

    fn on_output(&mut self, identity: &str, addr: SocketAddr, text: &str) {
        let text = text.strip_suffix('\n').unwrap_or(text);
        self.write_line(&format!("[{identity}]:{addr}> {text}"));
    }
}
