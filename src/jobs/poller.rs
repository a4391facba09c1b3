use log::{debug, warn};
use snafu::{ResultExt, Snafu};

use crate::cups_client::{client::PrintSpooler, models::{CupsError, Printer}};
use crate::firebase::client::FirestoreError;

use super::dispatcher::{Dispatcher, JobQueue};
use super::documents::DocumentSource;
use super::models::JobOutcome;

/// What one polling cycle saw and did.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub printers: Vec<Printer>,
    pub pending: usize,
    pub outcomes: Vec<JobOutcome>,
}

/// Refresh printers, fetch pending jobs, dispatch them in poll order.
///
/// Errors are only returned before any job has been touched, so a failed
/// cycle can be retried as a whole.
pub fn poll_once<Q, S, D>(queue: &Q, spooler: &S, documents: &D, publish_printers: bool) -> Result<CycleReport, CycleError>
where
    Q: JobQueue,
    S: PrintSpooler,
    D: DocumentSource,
{
    let printers = spooler.printers().context(PrintersSnafu)?;
    debug!("CUPS reports {} printer(s)", printers.len());

    if publish_printers {
        if let Err(e) = queue.publish_printers(&printers) {
            warn!("Could not publish printer list: {}", e);
        }
    }

    let jobs = queue.pending_jobs().context(JobsSnafu)?;
    let outcomes = Dispatcher::new(queue, spooler, documents).dispatch_all(&jobs, &printers);

    Ok(CycleReport { printers, pending: jobs.len(), outcomes })
}

// ////// //
// Errors //
// ////// //

#[derive(Debug, Snafu)]
pub enum CycleError {
    #[snafu(display("could not list printers: {source}"))]
    Printers { source: CupsError },

    #[snafu(display("could not fetch pending jobs: {source}"))]
    Jobs { source: FirestoreError },
}

impl CycleError {
    pub fn is_transient(&self) -> bool {
        match self {
            CycleError::Printers { source } => !matches!(source, CupsError::InvalidUri { .. }),
            CycleError::Jobs { source } => source.is_transient(),
        }
    }
}
