use std::{fmt::{self, Display}, str::FromStr};

use chrono::{DateTime, Utc};

/// Lifecycle of a print job as stored in the remote queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Printing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Printing => "printing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Printing => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    /// Status only ever moves forward; completed and failed are final.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "printing" => Ok(JobStatus::Printing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// Where the PDF of a job lives.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentRef {
    Url(String),
    Inline(Vec<u8>),
}

impl Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentRef::Url(url) => f.write_str(url),
            DocumentRef::Inline(bytes) => write!(f, "<{} inline bytes>", bytes.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrintJob {
    pub id: String,
    /// Full resource name of the job document.
    pub name: String,
    pub document: Option<DocumentRef>,
    pub printer_name: Option<String>,
    pub title: Option<String>,
    pub copies: u32,
    pub status: JobStatus,
    pub created_at: Option<DateTime<Utc>>,
    /// Server revision the job was read at, used to guard the claim.
    pub revision: Option<String>,
}

impl PrintJob {
    pub fn title(&self) -> String {
        self.title.clone().unwrap_or_else(|| format!("printersync job {}", self.id))
    }
}

/// Fields written back to the queue when a job moves on.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub error: Option<String>,
    pub printed_on: Option<String>,
    pub cups_job_id: Option<i32>,
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn completed(printer: &str, cups_job_id: i32) -> Self {
        Self {
            status: JobStatus::Completed,
            error: None,
            printed_on: Some(printer.to_string()),
            cups_job_id: Some(cups_job_id),
            at: Utc::now(),
        }
    }

    pub fn failed(printer: Option<&str>, error: String) -> Self {
        Self {
            status: JobStatus::Failed,
            error: Some(error),
            printed_on: printer.map(str::to_string),
            cups_job_id: None,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeKind {
    Completed { cups_job_id: i32 },
    Failed { error: String },
    /// The job changed remotely before we could claim it.
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job_id: String,
    pub printer: Option<String>,
    pub kind: OutcomeKind,
    pub at: DateTime<Utc>,
    /// Set when the final status could not be written back to the queue.
    pub unrecorded: Option<String>,
}

impl Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let printer = self.printer.as_deref().unwrap_or("-");
        match &self.kind {
            OutcomeKind::Completed { cups_job_id } => write!(f, "job {} printed on {} (CUPS job {})", self.job_id, printer, cups_job_id)?,
            OutcomeKind::Failed { error } => write!(f, "job {} failed on {}: {}", self.job_id, printer, error)?,
            OutcomeKind::Skipped => write!(f, "job {} skipped, it changed before it could be claimed", self.job_id)?,
        }
        match &self.unrecorded {
            Some(error) => write!(f, ", status not saved: {}", error),
            None => Ok(()),
        }
    }
}
