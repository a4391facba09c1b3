use std::{collections::HashMap, io::Cursor};

use ipp::prelude::*;
use log::{debug, info};
use snafu::{OptionExt, ResultExt};
use url::Url;

use crate::config::models::Cups;

use super::models::*;

/// The seam between the dispatcher and the OS print spooler.
#[cfg_attr(test, mockall::automock)]
pub trait PrintSpooler {
    /// Every installed queue, with the default one flagged.
    fn printers(&self) -> Result<Vec<Printer>, CupsError>;

    /// Hands a document to the spooler and returns the CUPS job id.
    fn submit(&self, request: &SubmitRequest) -> Result<i32, CupsError>;
}

pub fn build_cups_url(cups_uri: &str, queue_id: Option<&str>) -> Result<String, CupsError> {
    let invalid = |message: String| CupsError::InvalidUri { uri: cups_uri.to_string(), message };

    let cups_url = Url::parse(cups_uri).map_err(|e| invalid(e.to_string()))?;
    let url = match queue_id {
        Some(queue_id) => cups_url
            .join("printers/")
            .and_then(|printers| printers.join(queue_id))
            .map_err(|e| invalid(e.to_string()))?,
        None => cups_url,
    };

    Ok(url.to_string())
}

pub struct CupsClient {
    uri: String,
    ignore_tls_errors: bool,
    username: String,
    password: String,
    requesting_user: String,
    default_printer: Option<String>,
}

impl CupsClient {
    pub fn new(cups_settings: &Cups) -> Self {
        Self {
            uri: cups_settings.uri.clone(),
            ignore_tls_errors: cups_settings.ignore_tls_errors,
            username: cups_settings.username.clone(),
            password: cups_settings.password.clone(),
            requesting_user: cups_settings.requesting_user.clone(),
            default_printer: cups_settings.default_printer().map(str::to_string),
        }
    }

    fn parse_uri(&self, uri: &str) -> Result<Uri, CupsError> {
        uri.parse::<Uri>().map_err(|e| CupsError::InvalidUri { uri: uri.to_string(), message: e.to_string() })
    }

    fn client(&self, uri: Uri) -> IppClient {
        let mut builder = IppClient::builder(uri).ignore_tls_errors(self.ignore_tls_errors);
        if !self.username.is_empty() && !self.password.is_empty() {
            builder = builder.basic_auth(&self.username, &self.password);
        }
        builder.build()
    }

    /// Send an IPP request to do `op` to the given `uri` and get the response.
    fn send_ipp_request(&self, uri: &str, op: Operation) -> Result<IppRequestResponse, CupsError> {
        let uri_p = self.parse_uri(uri)?;
        let req = IppRequestResponse::new(
            IppVersion::v1_1(),
            op,
            Some(uri_p.clone())
        );
        self.client(uri_p).send(req).context(RequestSnafu)
    }

    pub fn get_printers(&self) -> Result<Vec<Printer>, CupsError> {
        let uri = build_cups_url(&self.uri, None)?;
        let resp = self.send_ipp_request(&uri, Operation::CupsGetPrinters)?;
        let status = resp.header().status_code();

        // CUPS answers "not found" when there are no queues at all.
        if status == StatusCode::ClientErrorNotFound {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return RejectedSnafu { operation: "CUPS-Get-Printers", status: format!("{:?}", status) }.fail();
        }

        let default_printer = match &self.default_printer {
            Some(name) => Some(name.clone()),
            None => self.get_default_printer()?,
        };

        resp.attributes()
            .groups_of(DelimiterTag::PrinterAttributes)
            .map(|group| printer_from_attributes(group.attributes(), default_printer.as_deref()))
            .collect()
    }

    /// The server-wide default queue, `None` when CUPS has none.
    pub fn get_default_printer(&self) -> Result<Option<String>, CupsError> {
        let uri = build_cups_url(&self.uri, None)?;
        let resp = self.send_ipp_request(&uri, Operation::CupsGetDefault)?;
        let status = resp.header().status_code();

        if status == StatusCode::ClientErrorNotFound {
            return Ok(None);
        }
        if !status.is_success() {
            return RejectedSnafu { operation: "CUPS-Get-Default", status: format!("{:?}", status) }.fail();
        }

        let name = resp.attributes()
            .groups_of(DelimiterTag::PrinterAttributes)
            .next()
            .and_then(|group| attribute_string(group.attributes(), "printer-name"));
        Ok(name)
    }

    pub fn print_job(&self, request: &SubmitRequest) -> Result<i32, CupsError> {
        let uri = build_cups_url(&self.uri, Some(&request.printer))?;
        let uri_p = self.parse_uri(&uri)?;

        let payload = IppPayload::new(Cursor::new(request.document.clone()));
        let mut print_job = IppOperationBuilder::print_job(uri_p.clone(), payload).job_title(&request.title);
        if !self.requesting_user.is_empty() {
            print_job = print_job.user_name(&self.requesting_user);
        }
        if request.copies > 1 {
            print_job = print_job.attribute(IppAttribute::new("copies", IppValue::Integer(i32::try_from(request.copies).unwrap_or(i32::MAX))));
        }

        debug!("Submitting '{}' ({} bytes) to {}", request.title, request.document.len(), uri);
        let resp = self.client(uri_p).send(print_job.build()).context(RequestSnafu)?;
        let status = resp.header().status_code();
        if !status.is_success() {
            return RejectedSnafu { operation: "Print-Job", status: format!("{:?}", status) }.fail();
        }

        let job_id = resp.attributes()
            .groups_of(DelimiterTag::JobAttributes)
            .next()
            .and_then(|group| group.attributes().get(IppAttribute::JOB_ID))
            .and_then(|attribute| attribute.value().as_integer().copied())
            .context(AttributeSnafu { attribute: "job-id" })?;

        info!("CUPS accepted '{}' on {} as job {}", request.title, request.printer, job_id);
        Ok(job_id)
    }
}

impl PrintSpooler for CupsClient {
    fn printers(&self) -> Result<Vec<Printer>, CupsError> {
        self.get_printers()
    }

    fn submit(&self, request: &SubmitRequest) -> Result<i32, CupsError> {
        self.print_job(request)
    }
}

fn attribute_string(attributes: &HashMap<String, IppAttribute>, name: &str) -> Option<String> {
    attributes.get(name).map(|attribute| match attribute.value() {
        IppValue::Array(values) => values.first().map(|v| v.to_string()).unwrap_or_default(),
        value => value.to_string(),
    })
}

pub(crate) fn printer_from_attributes(attributes: &HashMap<String, IppAttribute>, default_printer: Option<&str>) -> Result<Printer, CupsError> {
    let name = attribute_string(attributes, "printer-name").context(AttributeSnafu { attribute: "printer-name" })?;
    let state = attributes.get("printer-state")
        .and_then(|a| a.value().as_enum())
        .and_then(|v| PrinterState::from_i32(*v))
        .context(AttributeSnafu { attribute: "printer-state" })?;
    let accepting_jobs = match attributes.get("printer-is-accepting-jobs").map(|a| a.value()) {
        Some(IppValue::Boolean(accepting)) => *accepting,
        _ => true,
    };

    Ok(Printer {
        identifier: attribute_string(attributes, "printer-uri-supported").unwrap_or_else(|| name.clone()),
        description: attribute_string(attributes, "printer-info").unwrap_or_default(),
        is_default: default_printer == Some(name.as_str()),
        name,
        state,
        accepting_jobs,
    })
}
