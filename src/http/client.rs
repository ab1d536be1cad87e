//! Snapshot File Client
//!
//! Blocking HTTP client used inside clone tasks. Every remote step can be
//! wrapped in [`HttpClient::execute_with_retry`].

use reqwest::blocking::{Client, Response};
use reqwest::header::CONTENT_LENGTH;
use reqwest::Url;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use super::{read_batch_entry_header, BatchFileEntry, BATCH_DOWNLOAD_PATH, DOWNLOAD_PATH};
use crate::error::{Error, Result};
use crate::storage::fs;

/// Snapshot file endpoints of one source node
#[derive(Debug, Clone)]
pub struct SnapshotFileEndpoint {
    host: String,
    port: u16,
    token: String,
}

impl SnapshotFileEndpoint {
    pub fn new(host: impl Into<String>, port: u16, token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            token: token.into(),
        }
    }

    fn url(&self, path: &str, params: &[(&str, &str)]) -> Result<Url> {
        let base = format!("http://{}:{}{}", self.host, self.port, path);
        let mut all = vec![("token", self.token.as_str())];
        all.extend_from_slice(params);
        Url::parse_with_params(&base, &all)
            .map_err(|e| Error::InvalidArgument(format!("bad url {}: {}", base, e)))
    }

    /// Listing of a directory (ending in `/`) or one file
    pub fn download_url(&self, file: &str) -> Result<Url> {
        self.url(DOWNLOAD_PATH, &[("file", file)])
    }

    pub fn batch_check_url(&self) -> Result<Url> {
        self.url(BATCH_DOWNLOAD_PATH, &[("check", "true")])
    }

    pub fn batch_list_url(&self, dir: &str) -> Result<Url> {
        self.url(BATCH_DOWNLOAD_PATH, &[("dir", dir), ("list", "true")])
    }

    pub fn batch_download_url(&self, dir: &str) -> Result<Url> {
        self.url(BATCH_DOWNLOAD_PATH, &[("dir", dir)])
    }
}

/// Blocking HTTP client with fixed retries
pub struct HttpClient {
    client: Client,
    max_retry: u32,
    retry_interval: Duration,
}

impl HttpClient {
    pub fn new(max_retry: u32) -> Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            max_retry: max_retry.max(1),
            retry_interval: Duration::from_secs(1),
        })
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Run `op` up to `max_retry` times, pausing between attempts
    pub fn execute_with_retry<T, F>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_retry && !matches!(e, Error::ExceededLimit { .. }) => {
                    tracing::warn!(
                        attempt,
                        max_retry = self.max_retry,
                        error = %e,
                        "{} failed, retrying",
                        what
                    );
                    attempt += 1;
                    std::thread::sleep(self.retry_interval);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn check_status(url: &Url, resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().unwrap_or_default();
        Err(Error::Network(format!(
            "{} returned {}: {}",
            url.path(),
            status,
            body.trim()
        )))
    }

    /// Names listed in a remote snapshot directory, blanks skipped
    pub fn list_remote_files(&self, url: &Url, timeout: Duration) -> Result<Vec<String>> {
        self.execute_with_retry("list remote files", || {
            let resp = self.client.get(url.clone()).timeout(timeout).send()?;
            let text = Self::check_status(url, resp)?.text()?;
            Ok(text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect())
        })
    }

    /// Remote file length from a HEAD request
    pub fn get_length(&self, url: &Url, timeout: Duration) -> Result<u64> {
        self.execute_with_retry("get file length", || {
            let resp = self.client.head(url.clone()).timeout(timeout).send()?;
            let resp = Self::check_status(url, resp)?;
            resp.headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| Error::Network(format!("{} has no content length", url.path())))
        })
    }

    /// Download `url` into `local_path` once; returns bytes written
    pub fn download(&self, url: &Url, local_path: &Path, timeout: Duration) -> Result<u64> {
        let resp = self.client.get(url.clone()).timeout(timeout).send()?;
        let mut resp = Self::check_status(url, resp)?;
        let mut file = File::create(local_path).map_err(|e| Error::from_io(local_path, e))?;
        let written = resp.copy_to(&mut file)?;
        file.sync_all().map_err(|e| Error::from_io(local_path, e))?;
        Ok(written)
    }

    /// Whether the remote supports batched downloads; never retried
    pub fn supports_batch(&self, url: &Url, timeout: Duration) -> bool {
        match self.client.get(url.clone()).timeout(timeout).send() {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e.without_url(), "batch download support check failed");
                false
            }
        }
    }

    /// `(name, size)` listing of a remote snapshot directory
    pub fn list_batch(&self, url: &Url, timeout: Duration) -> Result<Vec<BatchFileEntry>> {
        self.execute_with_retry("list remote files in batch", || {
            let resp = self.client.get(url.clone()).timeout(timeout).send()?;
            Ok(Self::check_status(url, resp)?.json::<Vec<BatchFileEntry>>()?)
        })
    }

    /// Download `entries` with one request into `local_dir` once.
    ///
    /// Every received name and size must match the request.
    pub fn download_batch(
        &self,
        url: &Url,
        entries: &[BatchFileEntry],
        local_dir: &Path,
        timeout: Duration,
    ) -> Result<u64> {
        let body: String = entries.iter().map(|e| format!("{}\n", e.name)).collect();
        let resp = self
            .client
            .post(url.clone())
            .timeout(timeout)
            .body(body)
            .send()?;
        let mut resp = Self::check_status(url, resp)?;

        let mut total = 0;
        for expected in entries {
            let (name, size) = read_batch_entry_header(&mut resp)?.ok_or_else(|| {
                Error::Network(format!("batch payload ended before {}", expected.name))
            })?;
            if name != expected.name || size != expected.size {
                return Err(Error::Network(format!(
                    "batch entry mismatch: expected {} ({} bytes), got {} ({} bytes)",
                    expected.name, expected.size, name, size
                )));
            }

            let local_path = local_dir.join(&name);
            let mut file = File::create(&local_path).map_err(|e| Error::from_io(&local_path, e))?;
            let copied = std::io::copy(&mut (&mut resp).take(size), &mut file)
                .map_err(|e| Error::from_io(&local_path, e))?;
            if copied != size {
                return Err(Error::Network(format!(
                    "short batch entry {}: {} of {} bytes",
                    name, copied, size
                )));
            }
            file.sync_all().map_err(|e| Error::from_io(&local_path, e))?;
            fs::set_permission(&local_path, fs::PERMS_OWNER_RW)?;
            total += size;
        }
        Ok(total)
    }
}
