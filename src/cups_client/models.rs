use std::fmt::{self, Display};

use ipp::model::PrinterState;
use snafu::Snafu;

/// A CUPS print queue as seen at the last refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct Printer {
    pub name: String,
    /// `printer-uri-supported`, falls back to the queue name.
    pub identifier: String,
    pub description: String,
    pub state: PrinterState,
    pub accepting_jobs: bool,
    pub is_default: bool,
}

impl Printer {
    pub fn state_label(&self) -> &'static str {
        match self.state {
            PrinterState::Idle => "idle",
            PrinterState::Processing => "processing",
            PrinterState::Stopped => "stopped",
        }
    }
}

impl Display for Printer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if self.is_default {
            write!(f, " (default)")?;
        }
        write!(f, " [{}]", self.state_label())?;
        if !self.accepting_jobs {
            write!(f, " not accepting jobs")?;
        }
        Ok(())
    }
}

/// Everything CUPS needs to print one document.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub printer: String,
    pub title: String,
    pub copies: u32,
    pub document: Vec<u8>,
}

// ////// //
// Errors //
// ////// //

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CupsError {
    #[snafu(display("invalid CUPS uri '{uri}': {message}"))]
    InvalidUri { uri: String, message: String },

    #[snafu(display("could not reach CUPS: {source}"))]
    Request { source: ipp::error::IppError },

    #[snafu(display("CUPS answered {operation} with {status}"))]
    Rejected { operation: &'static str, status: String },

    #[snafu(display("missing or malformed attribute '{attribute}'"))]
    Attribute { attribute: &'static str },
}
