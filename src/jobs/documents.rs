use std::{io::Read, path::PathBuf, time::Duration};

use log::debug;
use reqwest::blocking::Client;
use snafu::{ResultExt, Snafu};
use url::Url;

use super::models::DocumentRef;

#[cfg_attr(test, mockall::automock)]
pub trait DocumentSource {
    fn fetch(&self, document: &DocumentRef) -> Result<Vec<u8>, FetchError>;
}

/// Resolves `http(s)://` and `file://` references, inline bytes pass through.
pub struct HttpDocumentSource {
    http: Client,
    max_bytes: u64,
}

impl HttpDocumentSource {
    pub fn new(timeout: Duration, max_bytes: u64) -> Result<Self, FetchError> {
        let http = Client::builder().timeout(timeout).build().context(HttpSnafu)?;
        Ok(Self { http, max_bytes })
    }

    fn check_size(&self, size: u64) -> Result<(), FetchError> {
        if size > self.max_bytes {
            return TooLargeSnafu { size, limit: self.max_bytes }.fail();
        }
        Ok(())
    }

    fn download(&self, url: Url) -> Result<Vec<u8>, FetchError> {
        debug!("Downloading {}", url);
        let response = self.http.get(url).send().context(HttpSnafu)?;

        let status = response.status();
        if !status.is_success() {
            return StatusSnafu { status: status.as_u16() }.fail();
        }
        if let Some(length) = response.content_length() {
            self.check_size(length)?;
        }

        // Content-Length can be absent or wrong, so cap the read as well.
        let mut bytes = Vec::new();
        response.take(self.max_bytes + 1).read_to_end(&mut bytes).context(ReadSnafu)?;
        self.check_size(bytes.len() as u64)?;
        Ok(bytes)
    }

    fn read_file(&self, path: PathBuf) -> Result<Vec<u8>, FetchError> {
        let size = std::fs::metadata(&path).context(ReadSnafu)?.len();
        self.check_size(size)?;
        std::fs::read(&path).context(ReadSnafu)
    }
}

impl DocumentSource for HttpDocumentSource {
    fn fetch(&self, document: &DocumentRef) -> Result<Vec<u8>, FetchError> {
        let bytes = match document {
            DocumentRef::Inline(bytes) => {
                self.check_size(bytes.len() as u64)?;
                bytes.clone()
            }
            DocumentRef::Url(raw) => {
                let url = Url::parse(raw).map_err(|e| FetchError::InvalidUrl { url: raw.clone(), message: e.to_string() })?;
                match url.scheme() {
                    "http" | "https" => self.download(url)?,
                    "file" => {
                        let path = url.to_file_path().map_err(|_| FetchError::InvalidUrl { url: raw.clone(), message: "not a local path".to_string() })?;
                        self.read_file(path)?
                    }
                    scheme => return UnsupportedSchemeSnafu { scheme }.fail(),
                }
            }
        };

        if bytes.is_empty() {
            return EmptySnafu.fail();
        }
        Ok(bytes)
    }
}

/// PDF files start with `%PDF-`, possibly after some whitespace.
pub fn looks_like_pdf(bytes: &[u8]) -> bool {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    bytes[start..].starts_with(b"%PDF-")
}

// ////// //
// Errors //
// ////// //

#[derive(Debug, Snafu)]
pub enum FetchError {
    #[snafu(display("invalid document url '{url}': {message}"))]
    InvalidUrl { url: String, message: String },

    #[snafu(display("unsupported url scheme '{scheme}'"))]
    UnsupportedScheme { scheme: String },

    #[snafu(display("{source}"))]
    Http { source: reqwest::Error },

    #[snafu(display("server answered HTTP {status}"))]
    Status { status: u16 },

    #[snafu(display("{source}"))]
    Read { source: std::io::Error },

    #[snafu(display("document is {size} bytes, the limit is {limit}"))]
    TooLarge { size: u64, limit: u64 },

    #[snafu(display("document is empty"))]
    Empty,
}
