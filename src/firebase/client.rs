use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use reqwest::{blocking::{Client, RequestBuilder, Response}, StatusCode};
use serde_json::{json, Map, Value};
use snafu::{ResultExt, Snafu};
use url::Url;

use crate::config::models::Firebase;
use crate::cups_client::models::Printer;
use crate::jobs::dispatcher::JobQueue;
use crate::jobs::models::{PrintJob, StatusUpdate};

use super::auth::{AuthError, Authenticator};
use super::credentials::ConnectionToken;
use super::models::*;

/// Firestore REST client scoped to one account.
pub struct FirestoreClient {
    http: Client,
    auth: Authenticator,
    api_base: Url,
    account_path: String,
    jobs_collection: String,
    printers_collection: String,
    batch_size: u32,
}

impl FirestoreClient {
    pub fn new(settings: &Firebase, project_id: &str, auth: Authenticator, token: &ConnectionToken, timeout: Duration) -> Result<Self, FirestoreError> {
        let http = Client::builder().timeout(timeout).build().context(HttpSnafu { action: "build http client" })?;

        let mut api_base = settings.api_base.clone();
        if !api_base.ends_with('/') {
            api_base.push('/');
        }
        let api_base = Url::parse(&api_base).map_err(|e| FirestoreError::Malformed { message: format!("invalid api base '{}': {}", settings.api_base, e) })?;

        Ok(Self {
            http,
            auth,
            api_base,
            account_path: account_path(project_id, &settings.database, &settings.account_collection, token),
            jobs_collection: settings.jobs_collection.clone(),
            printers_collection: settings.printers_collection.clone(),
            batch_size: settings.batch_size.max(1),
        })
    }

    pub fn account_path(&self) -> &str {
        &self.account_path
    }

    /// Each `/`-separated part of `resource` becomes one percent-encoded path segment.
    fn url(&self, resource: &str) -> Result<Url, FirestoreError> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| FirestoreError::Malformed { message: format!("api base '{}' cannot carry a path", self.api_base) })?
            .pop_if_empty()
            .extend(resource.split('/'));
        Ok(url)
    }

    fn send(&self, action: &'static str, request: RequestBuilder) -> Result<Response, FirestoreError> {
        let authorization = self.auth.authorization().context(AuthSnafu)?;
        let response = request.header(reqwest::header::AUTHORIZATION, authorization).send().context(HttpSnafu { action })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            self.auth.invalidate();
        }

        let body = response.text().unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) => (parsed.error.status, parsed.error.message),
            Err(_) => (String::new(), body),
        };
        ApiSnafu { action, status: status.as_u16(), code, message }.fail()
    }

    /// Checks that the connection token points at an existing account.
    pub fn connect(&self) -> Result<(), FirestoreError> {
        let url = self.url(&self.account_path)?;
        match self.send("read account", self.http.get(url)) {
            Ok(_) => {
                info!("Connected to account {}", self.account_path);
                Ok(())
            }
            Err(FirestoreError::Api { status: 404, .. }) => InvalidTokenSnafu.fail(),
            Err(e) => Err(e),
        }
    }

    pub fn fetch_pending_jobs(&self) -> Result<Vec<PrintJob>, FirestoreError> {
        let url = self.url(&format!("{}:runQuery", self.account_path))?;
        let body = pending_jobs_query(&self.jobs_collection, self.batch_size);

        let items: Vec<RunQueryItem> = self.send("query pending jobs", self.http.post(url).json(&body))?
            .json()
            .context(HttpSnafu { action: "decode pending jobs" })?;

        let mut jobs: Vec<PrintJob> = items.into_iter()
            .filter_map(|item| item.document)
            .filter_map(|doc| match doc.to_print_job() {
                Ok(job) => Some(job),
                Err(reason) => {
                    warn!("Ignoring {}: {}", doc.name, reason);
                    None
                }
            })
            .collect();

        // Oldest first; jobs without a timestamp go last.
        jobs.sort_by_key(|job| (job.created_at.is_none(), job.created_at));
        debug!("Found {} pending job(s)", jobs.len());
        Ok(jobs)
    }

    fn patch(&self, action: &'static str, name: &str, fields: Map<String, Value>, precondition: (&str, &str)) -> Result<(), FirestoreError> {
        let url = self.url(name)?;
        let mask: Vec<String> = fields.keys().cloned().collect();
        let mut query: Vec<(&str, &str)> = mask.iter().map(|key| ("updateMask.fieldPaths", key.as_str())).collect();
        query.push(precondition);

        self.send(action, self.http.patch(url).query(&query).json(&json!({ "fields": fields })))?;
        Ok(())
    }

    /// Moves a job from pending to printing. `false` when the job changed since it was read.
    pub fn claim_job(&self, job: &PrintJob) -> Result<bool, FirestoreError> {
        let precondition = match job.revision.as_deref() {
            Some(revision) => ("currentDocument.updateTime", revision),
            None => ("currentDocument.exists", "true"),
        };

        match self.patch("claim job", &job.name, claim_fields(&Utc::now()), precondition) {
            Ok(()) => Ok(true),
            Err(e) if e.is_precondition_failure() => {
                debug!("Job {} changed before it could be claimed", job.id);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub fn finish_job(&self, job: &PrintJob, update: &StatusUpdate) -> Result<(), FirestoreError> {
        self.patch("update job status", &job.name, status_fields(update), ("currentDocument.exists", "true"))
    }

    fn printers_path(&self) -> String {
        format!("{}/{}", self.account_path, self.printers_collection)
    }

    fn list_published_printers(&self) -> Result<Vec<Document>, FirestoreError> {
        let url = self.url(&self.printers_path())?;
        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.http.get(url.clone()).query(&[("pageSize", PRINTER_PAGE_SIZE)]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }
            let page: ListDocumentsResponse = self.send("list published printers", request)?
                .json()
                .context(HttpSnafu { action: "decode published printers" })?;

            documents.extend(page.documents);
            match page.next_page_token.filter(|token| !token.is_empty()) {
                Some(token) => page_token = Some(token),
                None => return Ok(documents),
            }
        }
    }

    /// Mirrors the local printer list under the account so jobs can target them.
    /// Printers CUPS no longer reports are removed.
    pub fn publish_printer_list(&self, printers: &[Printer]) -> Result<(), FirestoreError> {
        let now = Utc::now();
        for printer in printers {
            let url = self.url(&format!("{}/{}", self.printers_path(), printer.name))?;
            self.send("publish printer", self.http.patch(url).json(&json!({ "fields": printer_fields(printer, &now) })))?;
        }

        let published = self.list_published_printers()?;
        for stale in stale_printers(&published, printers) {
            info!("Removing printer {} that CUPS no longer reports", stale.id());
            let url = self.url(&stale.name)?;
            self.send("remove printer", self.http.delete(url))?;
        }

        debug!("Published {} printer(s)", printers.len());
        Ok(())
    }
}

impl JobQueue for FirestoreClient {
    fn pending_jobs(&self) -> Result<Vec<PrintJob>, FirestoreError> {
        self.fetch_pending_jobs()
    }

    fn claim(&self, job: &PrintJob) -> Result<bool, FirestoreError> {
        self.claim_job(job)
    }

    fn finish(&self, job: &PrintJob, update: &StatusUpdate) -> Result<(), FirestoreError> {
        self.finish_job(job, update)
    }

    fn publish_printers(&self, printers: &[Printer]) -> Result<(), FirestoreError> {
        self.publish_printer_list(printers)
    }
}

const PRINTER_PAGE_SIZE: &str = "300";

/// Published printer documents with no matching printer in `current`.
fn stale_printers<'a>(published: &'a [Document], current: &[Printer]) -> Vec<&'a Document> {
    published.iter()
        .filter(|doc| !current.iter().any(|printer| printer.name == doc.id()))
        .collect()
}

pub fn account_path(project_id: &str, database: &str, account_collection: &str, token: &ConnectionToken) -> String {
    format!("projects/{}/databases/{}/documents/{}/{}", project_id, database, account_collection, token.as_str())
}

// ////// //
// Errors //
// ////// //

#[derive(Debug, Snafu)]
pub enum FirestoreError {
    #[snafu(display("could not {action}: {source}"))]
    Http { action: &'static str, source: reqwest::Error },

    #[snafu(display("could not {action}: HTTP {status} {code} {message}"))]
    Api { action: &'static str, status: u16, code: String, message: String },

    #[snafu(display("authentication failed: {source}"))]
    Auth { source: AuthError },

    #[snafu(display("connection token does not match any account"))]
    InvalidToken,

    #[snafu(display("{message}"))]
    Malformed { message: String },
}

impl FirestoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            FirestoreError::Http { .. } => true,
            FirestoreError::Api { status, .. } => *status >= 500 || *status == 429,
            FirestoreError::Auth { source } => source.is_transient(),
            FirestoreError::InvalidToken | FirestoreError::Malformed { .. } => false,
        }
    }

    fn is_precondition_failure(&self) -> bool {
        matches!(self, FirestoreError::Api { status: 409, .. })
            || matches!(self, FirestoreError::Api { code, .. } if code == "FAILED_PRECONDITION" || code == "ABORTED")
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{loading::build_config, models::Settings};
    use crate::jobs::dispatcher::tests::printer;

    use super::*;

    fn settings() -> Settings {
        let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        build_config(Some(file.path()), false).unwrap()
    }

    fn client() -> FirestoreClient {
        let token = ConnectionToken::new("acct-42").unwrap();
        FirestoreClient::new(&settings().firebase, "printersync-test", Authenticator::Emulator, &token, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn account_path_is_derived_from_the_token() {
        assert_eq!(client().account_path(), "projects/printersync-test/databases/(default)/documents/accounts/acct-42");
    }

    #[test]
    fn resource_urls_hang_off_the_api_base() {
        let client = client();
        let url = client.url(&format!("{}:runQuery", client.account_path())).unwrap();
        assert_eq!(url.host_str(), Some("firestore.googleapis.com"));
        assert!(url.path().starts_with("/v1/projects/printersync-test/databases/"));
        assert!(url.path().ends_with("/accounts/acct-42:runQuery"));
    }

    #[test]
    fn token_and_printer_names_cannot_escape_their_path_segment() {
        let client = client();

        let url = client.url(&format!("{}/printers/Office?x#y", client.account_path())).unwrap();
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
        assert!(url.path().ends_with("/accounts/acct-42/printers/Office%3Fx%23y"));

        let url = client.url(&format!("{}/printers/Front Desk", client.account_path())).unwrap();
        assert!(url.path().ends_with("/printers/Front%20Desk"));
    }

    #[test]
    fn printers_missing_from_cups_are_stale() {
        let doc = |id: &str| Document { name: format!("{}/printers/{}", client().account_path(), id), ..Default::default() };
        let published = vec![doc("Office"), doc("Label"), doc("Old")];
        let current = vec![printer("Office", true), printer("Label", false)];

        let stale: Vec<&str> = stale_printers(&published, &current).into_iter().map(Document::id).collect();

        assert_eq!(stale, vec!["Old"]);
        assert!(stale_printers(&published[..2], &current).is_empty());
    }

    #[test]
    fn error_classification() {
        let api = |status: u16, code: &str| FirestoreError::Api { action: "claim job", status, code: code.to_string(), message: String::new() };

        assert!(api(503, "UNAVAILABLE").is_transient());
        assert!(api(429, "RESOURCE_EXHAUSTED").is_transient());
        assert!(!api(403, "PERMISSION_DENIED").is_transient());
        assert!(!FirestoreError::InvalidToken.is_transient());

        assert!(api(400, "FAILED_PRECONDITION").is_precondition_failure());
        assert!(api(409, "").is_precondition_failure());
        assert!(!api(404, "NOT_FOUND").is_precondition_failure());
    }
}
