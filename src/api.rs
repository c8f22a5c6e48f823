use std::io::{Read, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::header::{COOKIE, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app::{ProgressEvent, ProgressSink};
use crate::config::Credentials;
use crate::error::KiraError;
use crate::fs_util::{persist, temp_file_beside};

pub const CSRF_HEADER: &str = "X-CSRFToken";

const PROGRESS_STEP_BYTES: u64 = 64 * 1024 * 1024;

/// One file of an analysis as reported by the listing endpoint. Links are
/// pre-signed and expire, so records are never cached between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadLinkRecord {
    pub file_name: String,
    #[serde(default)]
    pub download_link: Option<String>,
    #[serde(default)]
    pub currently_archived: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingMode {
    Normal,
    /// Never lets the listing kick off a restore on the server side.
    SuppressRestore,
}

impl ListingMode {
    fn auto_restore(&self) -> &'static str {
        match self {
            ListingMode::Normal => "true",
            ListingMode::SuppressRestore => "false",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreTicket {
    pub restore_estimation: Option<DateTime<Utc>>,
}

pub trait ArchiveClient: Send + Sync {
    fn list_files(
        &self,
        analysis_id: &str,
        mode: ListingMode,
    ) -> Result<Vec<DownloadLinkRecord>, KiraError>;
    fn request_restore(&self, analysis_id: &str, file_name: &str)
    -> Result<RestoreTicket, KiraError>;
    fn download(
        &self,
        url: &str,
        destination: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<u64, KiraError>;
}

#[derive(Clone)]
pub struct ArchiveHttpClient {
    client: Client,
    transfer: Client,
    base_url: String,
    credentials: Credentials,
}

impl ArchiveHttpClient {
    pub fn new(base_url: &str, credentials: Credentials) -> Result<Self, KiraError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-af/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| KiraError::Http(err.to_string()))?,
        );
        if let Some(session) = &credentials.session {
            headers.insert(
                COOKIE,
                HeaderValue::from_str(&format!("sessionid={session}"))
                    .map_err(|err| KiraError::Http(err.to_string()))?,
            );
        }

        let client = Client::builder()
            .default_headers(headers.clone())
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| KiraError::Http(err.to_string()))?;
        // Large transfers must not hit a whole-request timeout.
        let transfer = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(None)
            .build()
            .map_err(|err| KiraError::Http(err.to_string()))?;

        Ok(Self {
            client,
            transfer,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn files_url(&self, analysis_id: &str) -> String {
        format!("{}/analyses/{}/files", self.base_url, analysis_id)
    }

    fn restore_url(&self) -> String {
        format!("{}/analyses/restore", self.base_url)
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, KiraError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "archive request failed".to_string());
        Err(KiraError::ApiStatus { status, message })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, KiraError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tracing::debug!(status, attempt, delay_ms = delay, "retrying request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tracing::debug!(error = %err, attempt, delay_ms = delay, "retrying request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(KiraError::Http(err.to_string()));
                }
            }
        }
    }

    fn write_response_to_file(
        mut response: reqwest::blocking::Response,
        destination: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<u64, KiraError> {
        let mut temp = temp_file_beside(destination, ".kira-af-download")?;

        let total = response.content_length();
        let start = Instant::now();
        let mut written = 0u64;
        let mut next_report = PROGRESS_STEP_BYTES;
        let mut buffer = vec![0u8; 256 * 1024];
        loop {
            let read = response
                .read(&mut buffer)
                .map_err(|err| KiraError::Http(err.to_string()))?;
            if read == 0 {
                break;
            }
            temp.write_all(&buffer[..read])
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
            written += read as u64;
            if written >= next_report {
                sink.event(ProgressEvent {
                    message: progress_message(destination, written, total),
                    elapsed: Some(start.elapsed()),
                });
                next_report += PROGRESS_STEP_BYTES;
            }
        }
        persist(temp, destination)?;

        sink.event(ProgressEvent {
            message: progress_message(destination, written, total),
            elapsed: Some(start.elapsed()),
        });
        Ok(written)
    }
}

impl ArchiveClient for ArchiveHttpClient {
    fn list_files(
        &self,
        analysis_id: &str,
        mode: ListingMode,
    ) -> Result<Vec<DownloadLinkRecord>, KiraError> {
        let url = self.files_url(analysis_id);
        let response = self.send_with_retries(|| {
            self.client
                .get(&url)
                .query(&[("autoRestore", mode.auto_restore())])
        })?;
        let response = Self::handle_status(response)?;
        response
            .json::<Vec<DownloadLinkRecord>>()
            .map_err(|err| KiraError::Http(err.to_string()))
    }

    fn request_restore(
        &self,
        analysis_id: &str,
        file_name: &str,
    ) -> Result<RestoreTicket, KiraError> {
        let csrf = self.credentials.csrf_token.as_deref().ok_or_else(|| {
            KiraError::MissingCredentials(format!(
                "{} is required to request restores",
                crate::config::CSRF_TOKEN_ENV
            ))
        })?;
        let url = self.restore_url();
        let response = self.send_with_retries(|| {
            self.client.post(&url).header(CSRF_HEADER, csrf).form(&[
                ("analysisIds", analysis_id),
                ("disableArchive", "false"),
                ("fileNames", file_name),
            ])
        })?;
        let response = Self::handle_status(response)?;
        let body = response
            .text()
            .map_err(|err| KiraError::Http(err.to_string()))?;
        parse_restore_response(&body)
    }

    fn download(
        &self,
        url: &str,
        destination: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<u64, KiraError> {
        let response = self.send_with_retries(|| self.transfer.get(url))?;
        let response = Self::handle_status(response)?;
        Self::write_response_to_file(response, destination, sink)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestoreResponse {
    success: bool,
    #[serde(default)]
    response: Vec<RestoreResponseItem>,
    #[serde(default)]
    error_message_id: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestoreResponseItem {
    #[serde(default, deserialize_with = "crate::store::deserialize_estimation")]
    restore_estimation: Option<DateTime<Utc>>,
}

/// Reads the trigger endpoint body. `success=false` is a rejection; the
/// estimation comes from the first response element and may be absent.
pub fn parse_restore_response(body: &str) -> Result<RestoreTicket, KiraError> {
    let parsed: RestoreResponse =
        serde_json::from_str(body).map_err(|err| KiraError::Http(err.to_string()))?;
    if !parsed.success {
        let reason = match parsed.error_message_id {
            Some(Value::String(id)) => id,
            Some(other) => other.to_string(),
            None => "no error id".to_string(),
        };
        return Err(KiraError::RestoreRejected(reason));
    }
    Ok(RestoreTicket {
        restore_estimation: parsed
            .response
            .into_iter()
            .next()
            .and_then(|item| item.restore_estimation),
    })
}

fn progress_message(destination: &Path, written: u64, total: Option<u64>) -> String {
    let name = destination
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    match total {
        Some(total) if total > 0 => format!(
            "download {name} {} / {} MiB ({}%)",
            written / (1024 * 1024),
            total / (1024 * 1024),
            written.saturating_mul(100) / total
        ),
        _ => format!("download {name} {} MiB", written / (1024 * 1024)),
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
