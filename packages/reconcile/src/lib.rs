#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Joins downloaded artifacts back to their records.
//!
//! After a dispatch run, every request folder holds a manifest and an
//! artifact named by the output layout (`response.png`). [`reconcile`]
//! walks the target directory, reads each manifest, resolves the record
//! identifier through the [`GeometryIdentifierMap`] built with the
//! requests, and renames the artifact to `{identifier}.{ext}`.
//!
//! Folders whose artifact was already renamed are not visited again, so
//! running reconciliation twice is harmless.

pub mod rename;

use std::path::{Path, PathBuf};

use serde::Deserialize;
use spill_chips_request::{GeometryIdentifierMap, MatchedBy};
use spill_chips_request_models::manifest::{DownloadManifest, OutputLayout};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;
use walkdir::WalkDir;

pub use rename::{
    ArtifactRenamer, FsRenamer, RenameContentionError, RenameError, RenameRetry,
    rename_with_retry,
};

/// What to do with artifacts whose manifest matches no record.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UnmatchedPolicy {
    /// Log and count them.
    #[default]
    Warn,
    /// Fail the run.
    Fail,
}

/// Options for [`reconcile`].
#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    pub layout: OutputLayout,
    pub retry: RenameRetry,
    pub unmatched: UnmatchedPolicy,
}

/// A manifest that could not be used.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("No manifest in {}", .dir.display())]
    Missing { dir: PathBuf },

    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed manifest {}: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Neither a correlation token nor a four-number bounding box.
    #[error("Manifest {} carries no request identity", .path.display())]
    NoIdentity { path: PathBuf },
}

/// Final verdict of a reconciliation run.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Target directory {} is not readable: {source}", .path.display())]
    TargetDir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Carries the whole report, including each [`RenameError`].
    #[error("{} artifact(s) could not be renamed", .report.rename_failures.len())]
    RenameFailed { report: Box<ReconcileReport> },

    #[error("{} artifact(s) matched no record", .report.unmatched.len())]
    Unmatched { report: Box<ReconcileReport> },
}

impl ReconcileError {
    /// The run's report, if the error came from [`ReconcileReport::check`].
    #[must_use]
    pub fn report(&self) -> Option<&ReconcileReport> {
        match self {
            Self::TargetDir { .. } => None,
            Self::RenameFailed { report } | Self::Unmatched { report } => Some(&**report),
        }
    }
}

/// An artifact renamed to its record identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamedArtifact {
    pub identifier: String,
    pub matched_by: MatchedBy,
    pub from: PathBuf,
    pub to: PathBuf,
}

/// Terminal state of one artifact.
///
/// An artifact starts pending, has its manifest read, and is then either
/// matched (and renamed or failed) or left unmatched. A manifest that
/// cannot be used ends it early.
#[derive(Debug)]
pub enum ArtifactOutcome {
    Renamed(RenamedArtifact),
    Unmatched { artifact: PathBuf },
    ManifestError(ManifestError),
    RenameFailed(RenameError),
}

/// Everything that happened during one run.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Artifacts found under the download name.
    pub visited: usize,
    pub renamed: Vec<RenamedArtifact>,
    pub unmatched: Vec<PathBuf>,
    pub manifest_errors: Vec<ManifestError>,
    pub rename_failures: Vec<RenameError>,
}

impl ReconcileReport {
    fn record(&mut self, outcome: ArtifactOutcome) {
        match outcome {
            ArtifactOutcome::Renamed(renamed) => self.renamed.push(renamed),
            ArtifactOutcome::Unmatched { artifact } => self.unmatched.push(artifact),
            ArtifactOutcome::ManifestError(e) => self.manifest_errors.push(e),
            ArtifactOutcome::RenameFailed(e) => self.rename_failures.push(e),
        }
    }

    /// Turns the report into the run's result.
    ///
    /// # Errors
    ///
    /// * [`ReconcileError::RenameFailed`] if any rename failed
    /// * [`ReconcileError::Unmatched`] if artifacts went unmatched and
    ///   `policy` is [`UnmatchedPolicy::Fail`]
    pub fn check(self, policy: UnmatchedPolicy) -> Result<Self, ReconcileError> {
        if !self.rename_failures.is_empty() {
            return Err(ReconcileError::RenameFailed {
                report: Box::new(self),
            });
        }
        if policy == UnmatchedPolicy::Fail && !self.unmatched.is_empty() {
            return Err(ReconcileError::Unmatched {
                report: Box::new(self),
            });
        }
        Ok(self)
    }
}

/// Renames every artifact under `target_dir` that can be matched to a
/// record.
///
/// Runs synchronously and sleeps between contended rename attempts; call
/// it from a blocking context.
///
/// # Errors
///
/// Returns [`ReconcileError::TargetDir`] if `target_dir` cannot be read.
/// Per-artifact problems are collected in the report instead; use
/// [`ReconcileReport::check`] to turn them into an error.
pub fn reconcile(
    target_dir: &Path,
    index: &GeometryIdentifierMap,
    options: &ReconcileOptions,
    renamer: &dyn ArtifactRenamer,
) -> Result<ReconcileReport, ReconcileError> {
    std::fs::read_dir(target_dir).map_err(|source| ReconcileError::TargetDir {
        path: target_dir.to_path_buf(),
        source,
    })?;

    log::info!("Reconciling artifacts under {}", target_dir.display());

    let mut report = ReconcileReport::default();

    for entry in WalkDir::new(target_dir).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Skipping unreadable entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_artifact(entry.path(), &options.layout) {
            continue;
        }

        report.visited += 1;
        let outcome = reconcile_artifact(entry.path(), index, options, renamer);
        match &outcome {
            ArtifactOutcome::Renamed(r) => log::debug!(
                "Renamed {} -> {} ({:?} match)",
                r.from.display(),
                r.to.display(),
                r.matched_by
            ),
            ArtifactOutcome::Unmatched { artifact } => {
                log::warn!("No record matches {}", artifact.display());
            }
            ArtifactOutcome::ManifestError(e) => log::warn!("Skipping artifact: {e}"),
            ArtifactOutcome::RenameFailed(e) => log::error!("{e}"),
        }
        report.record(outcome);
    }

    log::info!(
        "Reconciled {} artifact(s): {} renamed, {} unmatched, {} manifest error(s), {} rename failure(s)",
        report.visited,
        report.renamed.len(),
        report.unmatched.len(),
        report.manifest_errors.len(),
        report.rename_failures.len(),
    );

    Ok(report)
}

fn is_artifact(path: &Path, layout: &OutputLayout) -> bool {
    path.file_stem().is_some_and(|s| *s == *layout.artifact_stem)
        && path.extension().is_some()
        && path.file_name().is_some_and(|n| *n != *layout.manifest_file)
}

fn reconcile_artifact(
    artifact: &Path,
    index: &GeometryIdentifierMap,
    options: &ReconcileOptions,
    renamer: &dyn ArtifactRenamer,
) -> ArtifactOutcome {
    let Some(dir) = artifact.parent() else {
        return ArtifactOutcome::Unmatched {
            artifact: artifact.to_path_buf(),
        };
    };

    let manifest = match read_manifest(dir, &options.layout) {
        Ok(manifest) => manifest,
        Err(e) => return ArtifactOutcome::ManifestError(e),
    };

    let token = manifest.correlation_id.as_ref();
    let bbox = manifest.echoed_bbox();
    if token.is_none() && bbox.is_none() {
        return ArtifactOutcome::ManifestError(ManifestError::NoIdentity {
            path: dir.join(&options.layout.manifest_file),
        });
    }

    let Some(resolution) = index.resolve(token, bbox) else {
        return ArtifactOutcome::Unmatched {
            artifact: artifact.to_path_buf(),
        };
    };

    let mut file_name = resolution.identifier.to_string();
    if let Some(ext) = artifact.extension() {
        file_name.push('.');
        file_name.push_str(&ext.to_string_lossy());
    }
    let target = dir.join(file_name);

    match rename_with_retry(renamer, artifact, &target, options.retry) {
        Ok(()) => ArtifactOutcome::Renamed(RenamedArtifact {
            identifier: resolution.identifier.to_string(),
            matched_by: resolution.matched_by,
            from: artifact.to_path_buf(),
            to: target,
        }),
        Err(e) => ArtifactOutcome::RenameFailed(e),
    }
}

fn read_manifest(dir: &Path, layout: &OutputLayout) -> Result<DownloadManifest, ManifestError> {
    let path = dir.join(&layout.manifest_file);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ManifestError::Missing {
                dir: dir.to_path_buf(),
            });
        }
        Err(source) => return Err(ManifestError::Read { path, source }),
    };
    DownloadManifest::from_slice(&bytes).map_err(|source| ManifestError::Malformed { path, source })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use chrono::{TimeZone as _, Utc};
    use spill_chips_request::{RequestBuilder, RequestConfig, RequestPlan, build_plan};
    use spill_chips_request_models::manifest::ManifestResponse;
    use spill_chips_request_models::{DataCollection, ImageRequest, MimeType, MosaickingOrder};
    use spill_chips_spill_models::SpillRecord;
    use spill_chips_window::WindowParams;

    use super::*;
    use crate::rename::tests::FlakyRenamer;

    fn spec_layout() -> OutputLayout {
        OutputLayout {
            manifest_file: "manifest.json".to_string(),
            artifact_stem: "artifact".to_string(),
        }
    }

    fn options() -> ReconcileOptions {
        ReconcileOptions {
            retry: RenameRetry {
                attempts: 3,
                delay: Duration::ZERO,
            },
            ..ReconcileOptions::default()
        }
    }

    fn record(identifier: &str, latitude: f64, longitude: f64) -> SpillRecord {
        SpillRecord {
            identifier: identifier.to_string(),
            latitude,
            longitude,
            observed_at: Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap(),
        }
    }

    fn plan(records: &[SpillRecord]) -> RequestPlan {
        let builder = RequestBuilder::new(RequestConfig {
            evalscript: "//VERSION=3".to_string(),
            data_collection: Some(DataCollection::Sentinel2L1c),
            mosaicking_order: MosaickingOrder::LeastCloudCover,
            output_format: MimeType::Png,
            window: WindowParams::from_box_edge(5, 50, 100),
        })
        .unwrap();
        build_plan(&builder, records).unwrap()
    }

    /// Writes what the dispatcher would write for `request`.
    fn write_download(root: &Path, request: &ImageRequest, layout: &OutputLayout) -> PathBuf {
        let dir = root.join(request.folder_name());
        std::fs::create_dir_all(&dir).unwrap();
        let artifact = dir.join(layout.artifact_file(request.extension()));
        std::fs::write(&artifact, b"\x89PNG").unwrap();

        let manifest = DownloadManifest::for_request(
            "https://services.sentinel-hub.com/api/v1/process",
            request,
            ManifestResponse {
                status: 200,
                headers: BTreeMap::new(),
                elapsed: 0.5,
            },
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.join(&layout.manifest_file),
            serde_json::to_vec_pretty(&manifest).unwrap(),
        )
        .unwrap();
        artifact
    }

    #[test]
    fn renames_helcom_id_42_end_to_end() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = spec_layout();
        let plan = plan(&[record("HELCOM_ID_42", 59.3, 24.0)]);

        let request = &plan.requests[0];
        assert_eq!(
            request.time.start,
            Utc.with_ymd_and_hms(2020, 5, 27, 0, 0, 0).unwrap()
        );
        assert_eq!(
            request.time.end,
            Utc.with_ymd_and_hms(2020, 6, 6, 0, 0, 0).unwrap()
        );
        assert!((request.geo.min_lat() - 59.075).abs() < 1e-3);
        assert!((request.geo.max_lat() - 59.525).abs() < 1e-3);
        assert!((request.geo.min_lon() - 23.559).abs() < 1e-3);
        assert!((request.geo.max_lon() - 24.441).abs() < 1e-3);

        write_download(tmp.path(), request, &layout);

        let opts = ReconcileOptions {
            layout,
            ..options()
        };
        let report = reconcile(tmp.path(), &plan.index, &opts, &FsRenamer)
            .unwrap()
            .check(UnmatchedPolicy::Fail)
            .unwrap();

        assert_eq!(report.renamed.len(), 1);
        assert_eq!(report.renamed[0].identifier, "HELCOM_ID_42");
        assert_eq!(report.renamed[0].matched_by, MatchedBy::Token);
        let dir = tmp.path().join(request.folder_name());
        assert!(dir.join("HELCOM_ID_42.png").exists());
        assert!(!dir.join("artifact.png").exists());
        assert!(dir.join("manifest.json").exists());
    }

    #[test]
    fn second_run_changes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let plan = plan(&[record("HELCOM_ID_1", 59.3, 24.0), record("HELCOM_ID_2", 60.0, 25.0)]);
        for request in &plan.requests {
            write_download(tmp.path(), request, &OutputLayout::default());
        }

        let first = reconcile(tmp.path(), &plan.index, &options(), &FsRenamer).unwrap();
        assert_eq!(first.renamed.len(), 2);

        let second = reconcile(tmp.path(), &plan.index, &options(), &FsRenamer).unwrap();
        assert_eq!(second.visited, 0);
        assert!(second.renamed.is_empty());
        for request in &plan.requests {
            let dir = tmp.path().join(request.folder_name());
            assert_eq!(std::fs::read_dir(dir).unwrap().count(), 2);
        }
    }

    #[test]
    fn falls_back_to_bounds_without_token() {
        let tmp = tempfile::tempdir().unwrap();
        let plan = plan(&[record("HELCOM_ID_7", 55.0, 15.0)]);
        let request = &plan.requests[0];
        let artifact = write_download(tmp.path(), request, &OutputLayout::default());

        // Strip the token, as a manifest from another client would be.
        let manifest_path = artifact.with_file_name("request.json");
        let mut value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        value.as_object_mut().unwrap().remove("correlation_id");
        std::fs::write(&manifest_path, serde_json::to_vec(&value).unwrap()).unwrap();

        let report = reconcile(tmp.path(), &plan.index, &options(), &FsRenamer).unwrap();
        assert_eq!(report.renamed.len(), 1);
        assert_eq!(report.renamed[0].matched_by, MatchedBy::Bounds);
        assert!(artifact.with_file_name("HELCOM_ID_7.png").exists());
    }

    #[test]
    fn unmatched_is_counted_and_policy_decides() {
        let tmp = tempfile::tempdir().unwrap();
        let downloaded = plan(&[record("HELCOM_ID_9", 57.0, 20.0)]);
        write_download(tmp.path(), &downloaded.requests[0], &OutputLayout::default());

        let unrelated = plan(&[record("HELCOM_ID_10", 58.0, 21.0)]);

        let report = reconcile(tmp.path(), &unrelated.index, &options(), &FsRenamer).unwrap();
        assert_eq!(report.unmatched.len(), 1);
        assert!(report.renamed.is_empty());

        let report = report.check(UnmatchedPolicy::Warn).unwrap();
        let err = report.check(UnmatchedPolicy::Fail).unwrap_err();
        assert_eq!(err.to_string(), "1 artifact(s) matched no record");
        let ReconcileError::Unmatched { report } = err else {
            panic!("expected an unmatched error");
        };
        assert_eq!(report.unmatched.len(), 1);
    }

    #[test]
    fn malformed_and_missing_manifests_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let plan = plan(&[record("HELCOM_ID_1", 59.3, 24.0)]);
        let good = write_download(tmp.path(), &plan.requests[0], &OutputLayout::default());

        let broken = tmp.path().join("broken");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join("response.png"), b"png").unwrap();
        std::fs::write(broken.join("request.json"), b"{not json").unwrap();

        let interrupted = tmp.path().join("interrupted");
        std::fs::create_dir_all(&interrupted).unwrap();
        std::fs::write(interrupted.join("response.png"), b"png").unwrap();

        let report = reconcile(tmp.path(), &plan.index, &options(), &FsRenamer).unwrap();
        assert_eq!(report.visited, 3);
        assert_eq!(report.renamed.len(), 1);
        assert_eq!(report.manifest_errors.len(), 2);
        assert!(
            report
                .manifest_errors
                .iter()
                .any(|e| matches!(e, ManifestError::Malformed { .. }))
        );
        assert!(
            report
                .manifest_errors
                .iter()
                .any(|e| matches!(e, ManifestError::Missing { .. }))
        );
        assert!(good.with_file_name("HELCOM_ID_1.png").exists());
        assert!(broken.join("response.png").exists());
        assert!(report.check(UnmatchedPolicy::Fail).is_ok());
    }

    #[test]
    fn briefly_locked_artifact_is_renamed() {
        let tmp = tempfile::tempdir().unwrap();
        let plan = plan(&[record("HELCOM_ID_1", 59.3, 24.0)]);
        let artifact = write_download(tmp.path(), &plan.requests[0], &OutputLayout::default());

        let renamer = FlakyRenamer::default();
        renamer.fail(&artifact, 2, std::io::ErrorKind::PermissionDenied);

        let report = reconcile(tmp.path(), &plan.index, &options(), &renamer)
            .unwrap()
            .check(UnmatchedPolicy::Warn)
            .unwrap();
        assert_eq!(report.renamed.len(), 1);
        assert_eq!(renamer.calls_for(&artifact), 3);
    }

    #[test]
    fn locked_artifact_fails_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let plan = plan(&[
            record("HELCOM_ID_1", 59.3, 24.0),
            record("HELCOM_ID_2", 60.0, 25.0),
            record("HELCOM_ID_3", 58.0, 22.0),
        ]);
        let artifacts: Vec<_> = plan
            .requests
            .iter()
            .map(|r| write_download(tmp.path(), r, &OutputLayout::default()))
            .collect();

        let renamer = FlakyRenamer::default();
        renamer.fail(&artifacts[1], 3, std::io::ErrorKind::PermissionDenied);

        let report = reconcile(tmp.path(), &plan.index, &options(), &renamer).unwrap();
        assert_eq!(report.renamed.len(), 2);
        assert_eq!(report.rename_failures.len(), 1);
        assert_eq!(report.rename_failures[0].artifact(), artifacts[1].as_path());
        assert!(matches!(
            report.rename_failures[0],
            RenameError::Contention(RenameContentionError { attempts: 3, .. })
        ));
        assert!(artifacts[0].with_file_name("HELCOM_ID_1.png").exists());
        assert!(artifacts[1].exists());
        assert!(artifacts[2].with_file_name("HELCOM_ID_3.png").exists());

        let err = report.check(UnmatchedPolicy::Warn).unwrap_err();
        assert!(matches!(err, ReconcileError::RenameFailed { .. }));
        assert_eq!(err.to_string(), "1 artifact(s) could not be renamed");
        let report = err.report().unwrap();
        assert_eq!(report.renamed.len(), 2);
        assert_eq!(report.rename_failures[0].artifact(), artifacts[1].as_path());
        assert!(matches!(
            report.rename_failures[0],
            RenameError::Contention(RenameContentionError { attempts: 3, .. })
        ));
    }

    #[test]
    fn missing_target_dir_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let result = reconcile(
            &tmp.path().join("absent"),
            &GeometryIdentifierMap::default(),
            &options(),
            &FsRenamer,
        );
        assert!(matches!(result, Err(ReconcileError::TargetDir { .. })));
    }

    #[test]
    fn parses_policy_names() {
        assert_eq!("warn".parse::<UnmatchedPolicy>().unwrap(), UnmatchedPolicy::Warn);
        assert_eq!("fail".parse::<UnmatchedPolicy>().unwrap(), UnmatchedPolicy::Fail);
        assert_eq!(UnmatchedPolicy::Fail.to_string(), "fail");
    }
}
