use std::fmt::{self, Display};

use chrono::{DateTime, Local};

use crate::cups_client::models::Printer;
use crate::jobs::models::JobOutcome;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connected { account: String },
}

/// What the user sees: connection, printers and the last job outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusBoard {
    pub connection: ConnectionState,
    pub printers: Vec<Printer>,
    pub printer_error: Option<String>,
    pub last_outcome: Option<JobOutcome>,
    pub last_poll: Option<DateTime<Local>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            printers: Vec::new(),
            printer_error: None,
            last_outcome: None,
            last_poll: None,
        }
    }
}

impl StatusBoard {
    pub fn connected(&mut self, account: &str) {
        self.connection = ConnectionState::Connected { account: account.to_string() };
    }

    pub fn disconnected(&mut self) {
        self.connection = ConnectionState::Disconnected;
    }

    pub fn set_printers(&mut self, printers: Vec<Printer>) {
        self.printers = printers;
        self.printer_error = None;
    }

    pub fn set_printer_error(&mut self, error: String) {
        self.printers.clear();
        self.printer_error = Some(error);
    }

    /// Keeps the most recent outcome, if any.
    pub fn record_outcomes(&mut self, outcomes: &[JobOutcome]) {
        if let Some(last) = outcomes.last() {
            self.last_outcome = Some(last.clone());
        }
    }

    pub fn polled(&mut self, at: DateTime<Local>) {
        self.last_poll = Some(at);
    }

    /// Rendering without the poll timestamp, for change detection.
    pub fn summary(&self) -> String {
        let mut board = self.clone();
        board.last_poll = None;
        board.to_string()
    }
}

impl Display for StatusBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.connection {
            ConnectionState::Disconnected => writeln!(f, "Status: Disconnected")?,
            ConnectionState::Connected { account } => writeln!(f, "Status: Connected ({account})")?,
        }

        match (&self.printer_error, self.printers.is_empty()) {
            (Some(error), _) => writeln!(f, "Printers: unavailable ({error})")?,
            (None, true) => writeln!(f, "Printers: none found")?,
            (None, false) => {
                writeln!(f, "Printers:")?;
                for printer in &self.printers {
                    writeln!(f, "  - {printer}")?;
                }
            }
        }

        match &self.last_outcome {
            Some(outcome) => writeln!(f, "Last job: {} ({})", outcome, outcome.at.with_timezone(&Local).format("%H:%M:%S"))?,
            None => writeln!(f, "Last job: none yet")?,
        }

        if let Some(at) = self.last_poll {
            writeln!(f, "Last poll: {}", at.format("%Y-%m-%d %H:%M:%S"))?;
        }
        Ok(())
    }
}
