use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::cups_client::models::Printer;
use crate::jobs::models::{DocumentRef, JobStatus, PrintJob, StatusUpdate};

/// Upper bound for the requested number of copies.
pub const MAX_COPIES: u32 = 999;

// Field names of a job document.
pub const FIELD_STATUS: &str = "status";
pub const FIELD_DOCUMENT_URL: &str = "documentUrl";
pub const FIELD_DOCUMENT_DATA: &str = "documentData";
pub const FIELD_PRINTER_NAME: &str = "printerName";
pub const FIELD_TITLE: &str = "title";
pub const FIELD_COPIES: &str = "copies";
pub const FIELD_CREATED_AT: &str = "createdAt";
pub const FIELD_UPDATED_AT: &str = "updatedAt";
pub const FIELD_ERROR: &str = "error";
pub const FIELD_PRINTED_ON: &str = "printedOn";
pub const FIELD_CUPS_JOB_ID: &str = "cupsJobId";

/// A Firestore document as returned by the REST API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunQueryItem {
    pub document: Option<Document>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDocumentsResponse {
    #[serde(default)]
    pub documents: Vec<Document>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: String,
}

impl Document {
    /// Last segment of the resource name.
    pub fn id(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or_default()
    }

    fn typed(&self, field: &str, kind: &str) -> Option<&Value> {
        self.fields.get(field).and_then(|value| value.get(kind))
    }

    pub fn string(&self, field: &str) -> Option<&str> {
        self.typed(field, "stringValue")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    /// Firestore sends int64 values as strings.
    pub fn integer(&self, field: &str) -> Option<i64> {
        match self.typed(field, "integerValue")? {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn timestamp(&self, field: &str) -> Option<DateTime<Utc>> {
        let raw = self.typed(field, "timestampValue")?.as_str()?;
        DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc))
    }

    pub fn bytes(&self, field: &str) -> Option<Vec<u8>> {
        let raw = self.typed(field, "bytesValue")?.as_str()?;
        BASE64.decode(raw).ok()
    }

    /// Reads a job document. Returns the reason when the document cannot be a job.
    pub fn to_print_job(&self) -> Result<PrintJob, String> {
        let status = self.string(FIELD_STATUS)
            .ok_or_else(|| format!("job {} has no status", self.id()))?
            .parse::<JobStatus>()?;

        let document = match self.string(FIELD_DOCUMENT_URL) {
            Some(url) => Some(DocumentRef::Url(url.trim().to_string())),
            None => self.bytes(FIELD_DOCUMENT_DATA).map(DocumentRef::Inline),
        };

        let copies = self.integer(FIELD_COPIES)
            .map(|c| c.clamp(1, MAX_COPIES as i64) as u32)
            .unwrap_or(1);

        Ok(PrintJob {
            id: self.id().to_string(),
            name: self.name.clone(),
            document,
            printer_name: self.string(FIELD_PRINTER_NAME).map(|s| s.trim().to_string()),
            title: self.string(FIELD_TITLE).map(str::to_string),
            copies,
            status,
            created_at: self.timestamp(FIELD_CREATED_AT).or_else(|| parse_time(self.create_time.as_deref())),
            revision: self.update_time.clone(),
        })
    }
}

fn parse_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|raw| DateTime::parse_from_rfc3339(raw).ok()).map(|dt| dt.with_timezone(&Utc))
}

// //////// //
// Encoding //
// //////// //

pub fn string_value(value: &str) -> Value {
    json!({ "stringValue": value })
}

pub fn integer_value(value: i64) -> Value {
    json!({ "integerValue": value.to_string() })
}

pub fn boolean_value(value: bool) -> Value {
    json!({ "booleanValue": value })
}

pub fn null_value() -> Value {
    json!({ "nullValue": null })
}

pub fn timestamp_value(value: &DateTime<Utc>) -> Value {
    json!({ "timestampValue": value.to_rfc3339_opts(SecondsFormat::Micros, true) })
}

/// Fields written when a job is claimed.
pub fn claim_fields(at: &DateTime<Utc>) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(FIELD_STATUS.to_string(), string_value(JobStatus::Printing.as_str()));
    fields.insert(FIELD_UPDATED_AT.to_string(), timestamp_value(at));
    fields
}

/// Fields written when a job reaches a terminal status.
pub fn status_fields(update: &StatusUpdate) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(FIELD_STATUS.to_string(), string_value(update.status.as_str()));
    fields.insert(FIELD_UPDATED_AT.to_string(), timestamp_value(&update.at));
    fields.insert(FIELD_ERROR.to_string(), update.error.as_deref().map(string_value).unwrap_or_else(null_value));
    fields.insert(FIELD_PRINTED_ON.to_string(), update.printed_on.as_deref().map(string_value).unwrap_or_else(null_value));
    fields.insert(FIELD_CUPS_JOB_ID.to_string(), update.cups_job_id.map(|id| integer_value(id as i64)).unwrap_or_else(null_value));
    fields
}

pub fn printer_fields(printer: &Printer, at: &DateTime<Utc>) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("name".to_string(), string_value(&printer.name));
    fields.insert("identifier".to_string(), string_value(&printer.identifier));
    fields.insert("description".to_string(), string_value(&printer.description));
    fields.insert("state".to_string(), string_value(printer.state_label()));
    fields.insert("acceptingJobs".to_string(), boolean_value(printer.accepting_jobs));
    fields.insert("isDefault".to_string(), boolean_value(printer.is_default));
    fields.insert(FIELD_UPDATED_AT.to_string(), timestamp_value(at));
    fields
}

/// `runQuery` body selecting the oldest pending jobs of one account.
/// Needs a composite index on `status` and `createdAt`; jobs without `createdAt` are not returned.
pub fn pending_jobs_query(collection: &str, limit: u32) -> Value {
    json!({
        "structuredQuery": {
            "from": [{ "collectionId": collection }],
            "where": {
                "fieldFilter": {
                    "field": { "fieldPath": FIELD_STATUS },
                    "op": "EQUAL",
                    "value": string_value(JobStatus::Pending.as_str()),
                }
            },
            "orderBy": [{
                "field": { "fieldPath": FIELD_CREATED_AT },
                "direction": "ASCENDING",
            }],
            "limit": limit,
        }
    })
}
