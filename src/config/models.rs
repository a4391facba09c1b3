use std::{path::PathBuf, time::Duration};

use serde_derive::Deserialize;

use super::schedule::TimeSchedule;

// When changing anything here, make sure to add
// #[serde(alias = "ihavenounderscores")]
// where needed, so it can be read from the ENV vars.

#[derive(Debug, Deserialize)]
pub struct Firebase {
    #[serde(alias = "credentialsfile")]
    pub credentials_file: PathBuf,
    /// Overrides the project id found in the service account key.
    #[serde(alias = "projectid")]
    pub project_id: String,
    pub database: String,
    #[serde(alias = "apibase")]
    pub api_base: String,
    /// Talk to a local Firestore emulator, no service account needed.
    pub emulator: bool,
    #[serde(alias = "accountcollection")]
    pub account_collection: String,
    #[serde(alias = "jobscollection")]
    pub jobs_collection: String,
    #[serde(alias = "printerscollection")]
    pub printers_collection: String,
    #[serde(alias = "publishprinters")]
    pub publish_printers: bool,
    /// Connection token; prompted for when empty.
    pub token: String,
    #[serde(alias = "batchsize")]
    pub batch_size: u32,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
pub struct Cups {
    pub uri: String,
    #[serde(alias = "ignoretlserrors")]
    pub ignore_tls_errors: bool,
    pub username: String,
    pub password: String,
    #[serde(alias = "defaultprinter")]
    pub default_printer: String,
    #[serde(alias = "requestinguser")]
    pub requesting_user: String,
}

#[derive(Debug, Deserialize)]
pub struct Polling {
    pub schedule: TimeSchedule,
    #[serde(alias = "failurewait", with = "humantime_serde")]
    pub failure_wait: Duration,
}

#[derive(Debug, Deserialize)]
pub struct Documents {
    #[serde(alias = "maxbytes")]
    pub max_bytes: u64,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
pub struct Log {
    pub file: String,
    pub level: String,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub firebase: Firebase,
    pub cups: Cups,
    pub polling: Polling,
    pub documents: Documents,
    pub log: Log,
    #[serde(alias = "sentrydsn")]
    pub sentry_dsn: Option<String>,
}

impl Firebase {
    pub fn token(&self) -> Option<&str> {
        let token = self.token.trim();
        (!token.is_empty()).then_some(token)
    }
}

impl Cups {
    pub fn default_printer(&self) -> Option<&str> {
        (!self.default_printer.is_empty()).then_some(self.default_printer.as_str())
    }
}

impl Settings {
    pub fn sentry_dsn(&self) -> Option<&str> {
        self.sentry_dsn.as_deref().filter(|dsn| !dsn.is_empty())
    }
}
