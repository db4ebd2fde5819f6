#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Concurrent download of imagery requests.
//!
//! [`dispatch`] sends every [`ImageRequest`] through an [`ImageryClient`]
//! with bounded concurrency. Each successful download lands in its own
//! directory under the target directory, named by
//! [`ImageRequest::folder_name`], holding the artifact and a
//! [`DownloadManifest`] describing the request that produced it.

pub mod progress;
pub mod retry;
pub mod sentinel_hub;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt as _};
use spill_chips_request_models::ImageRequest;
use spill_chips_request_models::manifest::{DownloadManifest, ManifestResponse, OutputLayout};
use thiserror::Error;

use crate::progress::ProgressCallback;

/// Default number of downloads in flight.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default output directory.
pub const DEFAULT_TARGET_DIR: &str = "./satelite_data";

/// Appended to the manifest file name while it is being written.
const PARTIAL_SUFFIX: &str = ".partial";

/// Errors from a single transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Credentials missing or rejected.
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    /// Writing the artifact or manifest failed.
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The manifest could not be serialized.
    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Errors from a whole dispatch run.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Concurrency must be at least 1")]
    InvalidConcurrency,

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Some requests still failed after retries. The rest were written.
    #[error("{failed} of {attempted} downloads failed")]
    Incomplete { failed: usize, attempted: usize },
}

/// A downloaded artifact as returned by an [`ImageryClient`].
#[derive(Debug, Clone)]
pub struct DownloadResponse {
    /// Raw artifact bytes.
    pub body: Vec<u8>,
    /// HTTP status of the final attempt.
    pub status: u16,
    /// Response headers worth recording in the manifest.
    pub headers: BTreeMap<String, String>,
    /// Time from first send to body received.
    pub elapsed: Duration,
}

/// Something that can fetch imagery for a request.
#[async_trait]
pub trait ImageryClient: Send + Sync {
    /// URL recorded in manifests as the request target.
    fn endpoint(&self) -> &str;

    /// Downloads the artifact for one request. Retries are the
    /// implementation's concern; an error here is final.
    async fn download(&self, request: &ImageRequest) -> Result<DownloadResponse, TransferError>;
}

/// Options for [`dispatch`].
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Maximum downloads in flight.
    pub concurrency: usize,
    /// Root directory for request folders.
    pub target_dir: PathBuf,
    /// Download again even when a folder already holds a manifest and an
    /// artifact.
    pub redownload: bool,
    /// File names inside each folder.
    pub layout: OutputLayout,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            target_dir: PathBuf::from(DEFAULT_TARGET_DIR),
            redownload: false,
            layout: OutputLayout::default(),
        }
    }
}

/// A request that could not be downloaded.
#[derive(Debug)]
pub struct DispatchFailure {
    /// Folder the download would have been written to.
    pub folder: String,
    pub error: TransferError,
}

/// Outcome of a dispatch run.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub attempted: usize,
    pub downloaded: usize,
    /// Requests whose folder was already complete.
    pub skipped: usize,
    pub failures: Vec<DispatchFailure>,
}

impl DispatchReport {
    /// Converts the report to an error if any request failed.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Incomplete`] if `failures` is non-empty.
    pub fn into_result(self) -> Result<Self, DispatchError> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(DispatchError::Incomplete {
                failed: self.failures.len(),
                attempted: self.attempted,
            })
        }
    }
}

enum Outcome {
    Downloaded,
    Skipped,
}

/// Downloads every request with at most `options.concurrency` in flight.
///
/// A failed request is recorded in the report and does not stop the
/// others. Completion order is unspecified.
///
/// # Errors
///
/// * [`DispatchError::InvalidConcurrency`] if `options.concurrency` is 0
/// * [`DispatchError::Io`] if the target directory cannot be created
pub async fn dispatch(
    client: &dyn ImageryClient,
    requests: &[ImageRequest],
    options: &DispatchOptions,
    progress: &Arc<dyn ProgressCallback>,
) -> Result<DispatchReport, DispatchError> {
    if options.concurrency == 0 {
        return Err(DispatchError::InvalidConcurrency);
    }

    let mut report = DispatchReport {
        attempted: requests.len(),
        ..DispatchReport::default()
    };
    if requests.is_empty() {
        log::info!("No requests to dispatch");
        return Ok(report);
    }

    tokio::fs::create_dir_all(&options.target_dir)
        .await
        .map_err(|source| DispatchError::Io {
            path: options.target_dir.clone(),
            source,
        })?;

    log::info!(
        "Dispatching {} requests to {} (concurrency={})",
        requests.len(),
        options.target_dir.display(),
        options.concurrency
    );
    progress.set_total(requests.len() as u64);

    let mut results = stream::iter(requests.iter().map(|request| async move {
        let folder = request.folder_name();
        progress.set_message(folder.clone());
        let result = fetch_one(client, request, &folder, options).await;
        (folder, result)
    }))
    .buffer_unordered(options.concurrency);

    while let Some((folder, result)) = results.next().await {
        match result {
            Ok(Outcome::Downloaded) => {
                log::debug!("Downloaded {folder}");
                report.downloaded += 1;
            }
            Ok(Outcome::Skipped) => {
                log::debug!("Skipping {folder}, already downloaded");
                report.skipped += 1;
            }
            Err(error) => {
                log::warn!("Download into {folder} failed: {error}");
                report.failures.push(DispatchFailure { folder, error });
            }
        }
        progress.inc(1);
    }

    progress.finish(format!(
        "{} downloaded, {} skipped, {} failed",
        report.downloaded,
        report.skipped,
        report.failures.len()
    ));
    log::info!(
        "Dispatch finished: {} downloaded, {} skipped, {} failed",
        report.downloaded,
        report.skipped,
        report.failures.len()
    );

    Ok(report)
}

async fn fetch_one(
    client: &dyn ImageryClient,
    request: &ImageRequest,
    folder: &str,
    options: &DispatchOptions,
) -> Result<Outcome, TransferError> {
    let dir = options.target_dir.join(folder);
    let manifest_path = dir.join(&options.layout.manifest_file);

    if !options.redownload && is_complete(&dir, &manifest_path, request.extension()).await {
        return Ok(Outcome::Skipped);
    }

    let response = client.download(request).await?;

    let manifest = DownloadManifest::for_request(
        client.endpoint(),
        request,
        ManifestResponse {
            status: response.status,
            headers: response.headers,
            elapsed: response.elapsed.as_secs_f64(),
        },
        chrono::Utc::now(),
    )?;
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;

    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|source| io_error(&dir, source))?;

    // Artifact first, so a folder with a manifest always has its artifact.
    let artifact_path = dir.join(options.layout.artifact_file(request.extension()));
    tokio::fs::write(&artifact_path, &response.body)
        .await
        .map_err(|source| io_error(&artifact_path, source))?;

    // The manifest only appears under its real name once fully written.
    let partial_path = dir.join(format!(
        "{}{PARTIAL_SUFFIX}",
        options.layout.manifest_file
    ));
    tokio::fs::write(&partial_path, &manifest_bytes)
        .await
        .map_err(|source| io_error(&partial_path, source))?;
    tokio::fs::rename(&partial_path, &manifest_path)
        .await
        .map_err(|source| io_error(&manifest_path, source))?;

    Ok(Outcome::Downloaded)
}

/// Whether `dir` holds a readable manifest and at least one file with
/// `extension`, whether still under the download name or already renamed.
async fn is_complete(dir: &Path, manifest_path: &Path, extension: &str) -> bool {
    let Ok(bytes) = tokio::fs::read(manifest_path).await else {
        return false;
    };
    if let Err(e) = DownloadManifest::from_slice(&bytes) {
        log::warn!(
            "Manifest {} is unreadable, downloading again: {e}",
            manifest_path.display()
        );
        return false;
    }
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return false;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.path().extension().is_some_and(|e| e == extension) {
            return true;
        }
    }
    false
}

fn io_error(path: &Path, source: std::io::Error) -> TransferError {
    TransferError::Io {
        path: path.to_path_buf(),
        source,
    }
}
