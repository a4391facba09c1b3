use backon::{BlockingRetryable, ExponentialBuilder};
use chrono::Utc;
use log::{debug, error, info, warn};
use snafu::{ResultExt, Snafu};

use crate::cups_client::{client::PrintSpooler, models::{CupsError, Printer, SubmitRequest}};
use crate::firebase::client::FirestoreError;

use super::documents::{looks_like_pdf, DocumentSource, FetchError};
use super::models::{JobOutcome, JobStatus, OutcomeKind, PrintJob, StatusUpdate};

/// The remote side of the pipeline: where jobs come from and where their status goes.
#[cfg_attr(test, mockall::automock)]
pub trait JobQueue {
    fn pending_jobs(&self) -> Result<Vec<PrintJob>, FirestoreError>;

    /// Pending to printing, guarded by the revision the job was read at.
    fn claim(&self, job: &PrintJob) -> Result<bool, FirestoreError>;

    fn finish(&self, job: &PrintJob, update: &StatusUpdate) -> Result<(), FirestoreError>;

    /// Makes the local printers visible to whoever submits jobs.
    fn publish_printers(&self, printers: &[Printer]) -> Result<(), FirestoreError>;
}

/// Why a job could not be printed. The message ends up in the job's `error` field.
#[derive(Debug, Snafu)]
pub enum DispatchError {
    #[snafu(display("printer '{name}' not found"))]
    PrinterNotFound { name: String },

    #[snafu(display("no default printer configured"))]
    NoDefaultPrinter,

    #[snafu(display("job has no document reference"))]
    MissingDocument,

    #[snafu(display("could not fetch document: {source}"))]
    Fetch { source: FetchError },

    #[snafu(display("document is not a PDF"))]
    NotPdf,

    #[snafu(display("print submission failed: {source}"))]
    Submit { source: CupsError },
}

/// Explicit printer name if the job carries one, the default printer otherwise.
pub fn resolve_printer<'a>(job: &PrintJob, printers: &'a [Printer]) -> Result<&'a Printer, DispatchError> {
    match job.printer_name.as_deref() {
        Some(name) => printers.iter()
            .find(|p| p.name == name)
            .or_else(|| printers.iter().find(|p| p.name.eq_ignore_ascii_case(name)))
            .ok_or_else(|| DispatchError::PrinterNotFound { name: name.to_string() }),
        None => printers.iter().find(|p| p.is_default).ok_or(DispatchError::NoDefaultPrinter),
    }
}

pub struct Dispatcher<'a, Q, S, D> {
    queue: &'a Q,
    spooler: &'a S,
    documents: &'a D,
    backoff: ExponentialBuilder,
}

impl<'a, Q: JobQueue, S: PrintSpooler, D: DocumentSource> Dispatcher<'a, Q, S, D> {
    pub fn new(queue: &'a Q, spooler: &'a S, documents: &'a D) -> Self {
        Self {
            queue,
            spooler,
            documents,
            backoff: ExponentialBuilder::default().with_factor(4.0).with_max_times(3),
        }
    }

    /// Dispatches jobs one at a time in the order given.
    pub fn dispatch_all(&self, jobs: &[PrintJob], printers: &[Printer]) -> Vec<JobOutcome> {
        jobs.iter().filter_map(|job| self.dispatch(job, printers)).collect()
    }

    /// Runs a single job through claim, print and status update.
    /// Returns `None` when the job was not touched at all.
    pub fn dispatch(&self, job: &PrintJob, printers: &[Printer]) -> Option<JobOutcome> {
        if !job.status.can_advance_to(JobStatus::Printing) {
            warn!("Job {} is {}, not dispatching it", job.id, job.status);
            return None;
        }

        match self.queue.claim(job) {
            Ok(true) => {}
            Ok(false) => return Some(outcome(job, None, OutcomeKind::Skipped)),
            Err(e) => {
                error!("Could not claim job {}: {}", job.id, e);
                return None;
            }
        }

        info!("Printing job {}", job.id);
        let printer = resolve_printer(job, printers).ok().map(|p| p.name.clone());
        let (update, kind) = match self.print(job, printers) {
            Ok((printer, cups_job_id)) => (
                StatusUpdate::completed(&printer, cups_job_id),
                OutcomeKind::Completed { cups_job_id },
            ),
            Err(e) => {
                let message = e.to_string();
                error!("Job {} failed: {}", job.id, message);
                sentry::capture_message(&format!("Print job {} failed: {}", job.id, message), sentry::Level::Error);
                (StatusUpdate::failed(printer.as_deref(), message.clone()), OutcomeKind::Failed { error: message })
            }
        };

        let mut result = outcome(job, printer, kind);
        if let Err(e) = self.record(job, &update) {
            error!("Could not record {} for job {}: {}", update.status, job.id, e);
            sentry::capture_message(&format!("Status of print job {} not saved: {}", job.id, e), sentry::Level::Error);
            result.unrecorded = Some(e.to_string());
        }
        Some(result)
    }

    /// A job left in `printing` is never picked up again, so transient write failures are retried.
    fn record(&self, job: &PrintJob, update: &StatusUpdate) -> Result<(), FirestoreError> {
        (|| self.queue.finish(job, update))
            .retry(self.backoff)
            .when(FirestoreError::is_transient)
            .notify(|e, wait| warn!("Could not record {} for job {}, retrying in {:?}: {}", update.status, job.id, wait, e))
            .call()
    }

    fn print(&self, job: &PrintJob, printers: &[Printer]) -> Result<(String, i32), DispatchError> {
        let printer = resolve_printer(job, printers)?;
        if !printer.accepting_jobs {
            warn!("Printer {} is not accepting jobs, CUPS will hold job {}", printer.name, job.id);
        }

        let document = job.document.as_ref().ok_or(DispatchError::MissingDocument)?;
        debug!("Fetching {} for job {}", document, job.id);
        let bytes = self.documents.fetch(document).context(FetchSnafu)?;
        if !looks_like_pdf(&bytes) {
            return NotPdfSnafu.fail();
        }

        let request = SubmitRequest {
            printer: printer.name.clone(),
            title: job.title(),
            copies: job.copies,
            document: bytes,
        };
        let cups_job_id = self.spooler.submit(&request).context(SubmitSnafu)?;
        Ok((printer.name.clone(), cups_job_id))
    }
}

fn outcome(job: &PrintJob, printer: Option<String>, kind: OutcomeKind) -> JobOutcome {
    JobOutcome { job_id: job.id.clone(), printer, kind, at: Utc::now(), unrecorded: None }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use ipp::model::PrinterState;
    use mockall::{predicate::eq, Sequence};

    use crate::cups_client::client::MockPrintSpooler;
    use crate::jobs::documents::MockDocumentSource;
    use crate::jobs::models::DocumentRef;

    use super::*;

    pub(crate) fn printer(name: &str, is_default: bool) -> Printer {
        Printer {
            name: name.to_string(),
            identifier: format!("ipp://localhost:631/printers/{name}"),
            description: String::new(),
            state: PrinterState::Idle,
            accepting_jobs: true,
            is_default,
        }
    }

    pub(crate) fn job(id: &str, printer_name: Option<&str>) -> PrintJob {
        PrintJob {
            id: id.to_string(),
            name: format!("projects/p/databases/(default)/documents/accounts/a/print_jobs/{id}"),
            document: Some(DocumentRef::Url(format!("https://example.com/{id}.pdf"))),
            printer_name: printer_name.map(str::to_string),
            title: None,
            copies: 1,
            status: JobStatus::Pending,
            created_at: None,
            revision: Some("2025-03-01T10:00:05.123456Z".to_string()),
        }
    }

    fn pdf() -> Vec<u8> {
        b"%PDF-1.7\n%%EOF".to_vec()
    }

    fn unavailable() -> FirestoreError {
        FirestoreError::Api { action: "update job status", status: 503, code: "UNAVAILABLE".to_string(), message: String::new() }
    }

    fn quick<'a, Q: JobQueue, S: PrintSpooler, D: DocumentSource>(queue: &'a Q, spooler: &'a S, documents: &'a D) -> Dispatcher<'a, Q, S, D> {
        let mut dispatcher = Dispatcher::new(queue, spooler, documents);
        dispatcher.backoff = ExponentialBuilder::default().with_min_delay(Duration::from_millis(1)).with_max_times(3);
        dispatcher
    }

    #[test]
    fn explicit_printer_wins_over_default() {
        let printers = vec![printer("Office", true), printer("Label", false)];
        assert_eq!(resolve_printer(&job("1", Some("Label")), &printers).unwrap().name, "Label");
        assert_eq!(resolve_printer(&job("1", Some("label")), &printers).unwrap().name, "Label");
        assert_eq!(resolve_printer(&job("1", None), &printers).unwrap().name, "Office");
    }

    #[test]
    fn unresolvable_printers_are_errors() {
        let printers = vec![printer("Office", false)];
        assert!(matches!(resolve_printer(&job("1", Some("Garage")), &printers), Err(DispatchError::PrinterNotFound { .. })));
        assert!(matches!(resolve_printer(&job("1", None), &printers), Err(DispatchError::NoDefaultPrinter)));
    }

    #[test]
    fn successful_submission_completes_the_job() {
        let mut queue = MockJobQueue::new();
        let mut spooler = MockPrintSpooler::new();
        let mut documents = MockDocumentSource::new();

        queue.expect_claim().times(1).returning(|_| Ok(true));
        documents.expect_fetch().times(1).returning(|_| Ok(pdf()));
        spooler.expect_submit()
            .withf(|request| request.printer == "Office" && request.title == "printersync job 7" && request.copies == 1)
            .times(1)
            .returning(|_| Ok(31));
        queue.expect_finish()
            .withf(|job, update| job.id == "7"
                && update.status == JobStatus::Completed
                && update.cups_job_id == Some(31)
                && update.printed_on.as_deref() == Some("Office")
                && update.error.is_none())
            .times(1)
            .returning(|_, _| Ok(()));

        let dispatcher = Dispatcher::new(&queue, &spooler, &documents);
        let outcome = dispatcher.dispatch(&job("7", Some("Office")), &[printer("Office", false)]).unwrap();

        assert_eq!(outcome.kind, OutcomeKind::Completed { cups_job_id: 31 });
        assert_eq!(outcome.printer.as_deref(), Some("Office"));
    }

    #[test]
    fn missing_printer_fails_the_job_without_submitting() {
        let mut queue = MockJobQueue::new();
        let mut spooler = MockPrintSpooler::new();
        let documents = MockDocumentSource::new();

        queue.expect_claim().returning(|_| Ok(true));
        spooler.expect_submit().never();
        queue.expect_finish()
            .withf(|_, update| update.status == JobStatus::Failed
                && update.error.as_deref() == Some("printer 'Garage' not found"))
            .times(1)
            .returning(|_, _| Ok(()));

        let dispatcher = Dispatcher::new(&queue, &spooler, &documents);
        let outcome = dispatcher.dispatch(&job("8", Some("Garage")), &[printer("Office", true)]).unwrap();

        assert_eq!(outcome.kind, OutcomeKind::Failed { error: "printer 'Garage' not found".to_string() });
    }

    #[test]
    fn submission_error_is_recorded_with_a_message() {
        let mut queue = MockJobQueue::new();
        let mut spooler = MockPrintSpooler::new();
        let mut documents = MockDocumentSource::new();

        queue.expect_claim().returning(|_| Ok(true));
        documents.expect_fetch().returning(|_| Ok(pdf()));
        spooler.expect_submit().times(1).returning(|_| Err(CupsError::Rejected {
            operation: "Print-Job",
            status: "ClientErrorNotPossible".to_string(),
        }));
        queue.expect_finish()
            .withf(|_, update| update.status == JobStatus::Failed
                && update.error.as_deref().is_some_and(|e| e.starts_with("print submission failed:")))
            .times(1)
            .returning(|_, _| Ok(()));

        let dispatcher = Dispatcher::new(&queue, &spooler, &documents);
        let outcome = dispatcher.dispatch(&job("9", None), &[printer("Office", true)]).unwrap();

        match outcome.kind {
            OutcomeKind::Failed { error } => assert!(!error.is_empty()),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn non_pdf_payloads_are_not_sent_to_cups() {
        let mut queue = MockJobQueue::new();
        let mut spooler = MockPrintSpooler::new();
        let mut documents = MockDocumentSource::new();

        queue.expect_claim().returning(|_| Ok(true));
        documents.expect_fetch()
            .with(eq(DocumentRef::Url("https://example.com/10.pdf".to_string())))
            .returning(|_| Ok(b"<html>login</html>".to_vec()));
        spooler.expect_submit().never();
        queue.expect_finish()
            .withf(|_, update| update.error.as_deref() == Some("document is not a PDF"))
            .times(1)
            .returning(|_, _| Ok(()));

        let dispatcher = Dispatcher::new(&queue, &spooler, &documents);
        dispatcher.dispatch(&job("10", None), &[printer("Office", true)]);
    }

    #[test]
    fn job_that_changed_remotely_is_skipped() {
        let mut queue = MockJobQueue::new();
        let mut spooler = MockPrintSpooler::new();
        let mut documents = MockDocumentSource::new();

        queue.expect_claim().times(1).returning(|_| Ok(false));
        queue.expect_finish().never();
        documents.expect_fetch().never();
        spooler.expect_submit().never();

        let dispatcher = Dispatcher::new(&queue, &spooler, &documents);
        let outcome = dispatcher.dispatch(&job("11", None), &[printer("Office", true)]).unwrap();

        assert_eq!(outcome.kind, OutcomeKind::Skipped);
    }

    #[test]
    fn status_write_is_retried_after_a_transient_failure() {
        let mut queue = MockJobQueue::new();
        let mut spooler = MockPrintSpooler::new();
        let mut documents = MockDocumentSource::new();
        let mut seq = Sequence::new();

        queue.expect_claim().returning(|_| Ok(true));
        documents.expect_fetch().returning(|_| Ok(pdf()));
        spooler.expect_submit().times(1).returning(|_| Ok(5));
        queue.expect_finish().times(1).in_sequence(&mut seq).returning(|_, _| Err(unavailable()));
        queue.expect_finish()
            .withf(|_, update| update.status == JobStatus::Completed)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let dispatcher = quick(&queue, &spooler, &documents);
        let outcome = dispatcher.dispatch(&job("13", None), &[printer("Office", true)]).unwrap();

        assert_eq!(outcome.kind, OutcomeKind::Completed { cups_job_id: 5 });
        assert_eq!(outcome.unrecorded, None);
    }

    #[test]
    fn unsaved_status_shows_up_in_the_outcome() {
        let mut queue = MockJobQueue::new();
        let mut spooler = MockPrintSpooler::new();
        let mut documents = MockDocumentSource::new();

        queue.expect_claim().returning(|_| Ok(true));
        documents.expect_fetch().returning(|_| Ok(pdf()));
        spooler.expect_submit().times(1).returning(|_| Ok(6));
        queue.expect_finish().times(1).returning(|_, _| Err(FirestoreError::Api {
            action: "update job status",
            status: 403,
            code: "PERMISSION_DENIED".to_string(),
            message: "missing permission".to_string(),
        }));

        let dispatcher = quick(&queue, &spooler, &documents);
        let outcome = dispatcher.dispatch(&job("14", None), &[printer("Office", true)]).unwrap();

        assert_eq!(outcome.kind, OutcomeKind::Completed { cups_job_id: 6 });
        assert!(outcome.unrecorded.is_some_and(|e| e.contains("HTTP 403")));
    }

    #[test]
    fn jobs_past_pending_are_left_alone() {
        let mut queue = MockJobQueue::new();
        let spooler = MockPrintSpooler::new();
        let documents = MockDocumentSource::new();
        queue.expect_claim().never();

        let mut printing = job("12", None);
        printing.status = JobStatus::Printing;

        let dispatcher = Dispatcher::new(&queue, &spooler, &documents);
        assert!(dispatcher.dispatch(&printing, &[printer("Office", true)]).is_none());
    }
}
