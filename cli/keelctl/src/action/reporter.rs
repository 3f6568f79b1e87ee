//! Live progress rendering for multi-node actions.
//!
//! On a terminal the combined status redraws in place at a fixed refresh
//! rate; without one each node update prints as its own line.

use std::io::{IsTerminal, Write};

use colored::Colorize;

/// Status of one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Operation in flight.
    Running,

    /// Operation failed.
    Error,

    /// Operation finished.
    Succeeded,
}

/// One progress update.
#[derive(Debug, Clone)]
pub struct Update {
    /// Human-readable progress line.
    pub message: String,

    /// Status classification.
    pub status: Status,
}

/// A node-scoped update flowing to the reporter loop.
#[derive(Debug, Clone)]
pub struct NodeUpdate {
    /// Reporting node; empty for tracker-level messages.
    pub node: String,

    /// The update.
    pub update: Update,
}

/// In-place stderr renderer.
pub struct Reporter {
    rendered_lines: usize,
}

impl Reporter {
    /// New reporter; detects terminal capability on stderr.
    pub fn new() -> Self {
        Self { rendered_lines: 0 }
    }

    /// True when stderr is a terminal.
    pub fn is_terminal() -> bool {
        std::io::stderr().is_terminal()
    }

    /// Redraw the combined status block in place.
    pub fn report(&mut self, update: &Update) {
        let mut stderr = std::io::stderr().lock();

        // rewind over the previous frame
        if self.rendered_lines > 0 {
            let _ = write!(stderr, "\x1b[{}A\x1b[J", self.rendered_lines);
        }

        let colored = match update.status {
            Status::Running => update.message.yellow(),
            Status::Error => update.message.red(),
            Status::Succeeded => update.message.green(),
        };

        let _ = writeln!(stderr, "{colored}");

        self.rendered_lines = update.message.lines().count().max(1);
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}
