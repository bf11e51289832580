//! Per-stage lineage records.
//!
//! Every execution (or skip) of a stage gets its own manifest version under
//! `manifests/<stage>/vNNNN.json`. A [`ManifestHandle`] persists the record
//! after each tracking call so a crash leaves a readable `running` manifest
//! behind, and [`ManifestHandle::finalize`] seals it. Older versions are
//! never rewritten.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ConfigValue;
use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::fsio;
use crate::predictor::{PredictionConfig, StageParams};
use crate::state_machine::{StageKind, StageStatus};

/// Path plus content hash of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    /// Relative to the work dir when the file lives inside it.
    pub path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
}

impl FileDescriptor {
    /// Hashes `path`; any failure to read it is `InputNotFound`.
    pub fn hash(path: &Path, work_dir: &Path) -> PipelineResult<Self> {
        let meta = fs::metadata(path).map_err(|e| PipelineError::input_not_found(path, e))?;
        if !meta.is_file() {
            return Err(PipelineError::input_not_found(path, "not a regular file"));
        }
        let sha256 = fsio::sha256_file(path).map_err(|e| PipelineError::input_not_found(path, e))?;
        let stored = path.strip_prefix(work_dir).unwrap_or(path).to_path_buf();
        Ok(Self {
            path: stored,
            sha256,
            size_bytes: meta.len(),
        })
    }

    pub fn absolute(&self, work_dir: &Path) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            work_dir.join(&self.path)
        }
    }

    /// Whether the file still exists with the recorded content.
    pub fn still_matches(&self, work_dir: &Path) -> bool {
        fsio::sha256_file(&self.absolute(work_dir))
            .map(|sha| sha == self.sha256)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    Retained,
    Transient,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntermediateDescriptor {
    pub path: PathBuf,
    pub retention: Retention,
    pub reason: String,
}

/// What the predictor proposed and whether it was used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionRecord {
    pub prediction_applied: bool,
    pub threshold: f64,
    pub predicted: PredictionConfig,
    /// Parameters actually passed to the stage.
    pub applied: StageParams,
}

/// Where a re-run moved the outputs of earlier versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputArchive {
    /// Latest version whose outputs lived in the moved directory.
    pub superseded_version: u32,
    /// Archive directory, relative to the work dir.
    pub dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PipelineError> for ErrorDetail {
    fn from(err: &PipelineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub id: String,
    pub stage: StageKind,
    pub version: u32,
    pub job_id: String,
    pub run_id: String,
    pub status: StageStatus,
    pub environment: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub verification_only: bool,
    pub inputs: Vec<FileDescriptor>,
    pub outputs: Vec<FileDescriptor>,
    pub config: BTreeMap<String, ConfigValue>,
    pub intermediates: Vec<IntermediateDescriptor>,
    pub prediction: Option<PredictionRecord>,
    pub resumed_from: Option<u32>,
    #[serde(default)]
    pub archived_outputs: Option<OutputArchive>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub log_path: Option<PathBuf>,
    pub error: Option<ErrorDetail>,
}

impl Manifest {
    /// Input hashes keyed by stored path, for resume comparison.
    pub fn input_hashes(&self) -> BTreeMap<&Path, &str> {
        self.inputs
            .iter()
            .map(|d| (d.path.as_path(), d.sha256.as_str()))
            .collect()
    }

    pub fn is_reusable(&self) -> bool {
        self.status.is_terminal_success()
    }

    fn validate_seal(&self) -> PipelineResult<()> {
        match self.status {
            StageStatus::Success | StageStatus::Skipped => {
                if self.outputs.is_empty() && !self.verification_only {
                    return Err(PipelineError::ManifestInvalidState(format!(
                        "{} v{}: {} manifest has no outputs",
                        self.stage, self.version, self.status
                    )));
                }
            }
            StageStatus::Failed => {
                let has_detail = self
                    .error
                    .as_ref()
                    .map(|e| !e.message.trim().is_empty())
                    .unwrap_or(false);
                if !has_detail {
                    return Err(PipelineError::ManifestInvalidState(format!(
                        "{} v{}: failed manifest has no error detail",
                        self.stage, self.version
                    )));
                }
            }
            StageStatus::Pending | StageStatus::Running => {
                return Err(PipelineError::ManifestInvalidState(format!(
                    "{} v{}: cannot seal with non-terminal status {}",
                    self.stage, self.version, self.status
                )));
            }
        }
        Ok(())
    }
}

/// Reads and creates manifests under one job's work dir.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    root: PathBuf,
    work_dir: PathBuf,
}

impl ManifestStore {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        Self {
            root: work_dir.join("manifests"),
            work_dir,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn stage_dir(&self, stage: StageKind) -> PathBuf {
        self.root.join(stage.name())
    }

    fn version_path(&self, stage: StageKind, version: u32) -> PathBuf {
        self.stage_dir(stage).join(format!("v{version:04}.json"))
    }

    /// Existing version numbers, ascending.
    pub fn versions(&self, stage: StageKind) -> PipelineResult<Vec<u32>> {
        let dir = self.stage_dir(stage);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut versions: Vec<u32> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| parse_version(&entry.file_name().to_string_lossy()))
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    /// Starts a new manifest version in `running` state.
    pub fn open(&self, stage: StageKind, job_id: &str, run_id: &str) -> PipelineResult<ManifestHandle> {
        fs::create_dir_all(self.stage_dir(stage))?;
        let mut version = self.versions(stage)?.last().copied().unwrap_or(0) + 1;
        // Reserve the slot so two openers never share a version.
        let path = loop {
            let candidate = self.version_path(stage, version);
            match OpenOptions::new().write(true).create_new(true).open(&candidate) {
                Ok(_) => break candidate,
                Err(err) if err.kind() == IoErrorKind::AlreadyExists => version += 1,
                Err(err) => return Err(err.into()),
            }
        };

        let manifest = Manifest {
            id: Uuid::new_v4().to_string(),
            stage,
            version,
            job_id: job_id.to_string(),
            run_id: run_id.to_string(),
            status: StageStatus::Running,
            environment: None,
            command: Vec::new(),
            verification_only: false,
            inputs: Vec::new(),
            outputs: Vec::new(),
            config: BTreeMap::new(),
            intermediates: Vec::new(),
            prediction: None,
            resumed_from: None,
            archived_outputs: None,
            started_at: Utc::now(),
            finished_at: None,
            exit_code: None,
            log_path: None,
            error: None,
        };
        let handle = ManifestHandle {
            path,
            manifest,
            sealed: false,
        };
        handle.persist()?;
        debug!(stage = %stage, version, "manifest opened");
        Ok(handle)
    }

    pub fn read_version(&self, stage: StageKind, version: u32) -> PipelineResult<Manifest> {
        let bytes = fs::read(self.version_path(stage, version))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Latest readable manifest for `stage`. Reads never take locks; a slot
    /// that is reserved but not yet written is passed over.
    pub fn get(&self, stage: StageKind) -> PipelineResult<Option<Manifest>> {
        for version in self.versions(stage)?.into_iter().rev() {
            match self.read_version(stage, version) {
                Ok(manifest) => return Ok(Some(manifest)),
                Err(err) => {
                    debug!(stage = %stage, version, error = %err, "skipping unreadable manifest");
                }
            }
        }
        Ok(None)
    }

    /// Latest manifest that finished, ignoring versions left `running` by an
    /// interrupted process.
    pub fn latest_finished(&self, stage: StageKind) -> PipelineResult<Option<Manifest>> {
        Ok(self
            .history(stage)?
            .into_iter()
            .rev()
            .find(|m| m.status.is_terminal()))
    }

    /// All readable versions, oldest first.
    pub fn history(&self, stage: StageKind) -> PipelineResult<Vec<Manifest>> {
        let mut manifests = Vec::new();
        for version in self.versions(stage)? {
            match self.read_version(stage, version) {
                Ok(manifest) => manifests.push(manifest),
                Err(err) => warn!(stage = %stage, version, error = %err, "unreadable manifest"),
            }
        }
        Ok(manifests)
    }
}

impl ManifestStore {
    /// Current location of `descriptor`, an output of `manifest`: the
    /// recorded path, or its place in the archive a later re-run of the
    /// stage moved it to.
    pub fn locate_output(&self, manifest: &Manifest, descriptor: &FileDescriptor) -> PipelineResult<PathBuf> {
        let recorded = descriptor.absolute(&self.work_dir);
        let live_dir = self.work_dir.join("stages").join(manifest.stage.name());
        let Ok(relative) = recorded.strip_prefix(&live_dir) else {
            return Ok(recorded);
        };
        let archive = self
            .history(manifest.stage)?
            .into_iter()
            .filter(|later| later.version > manifest.version)
            .find_map(|later| {
                later
                    .archived_outputs
                    .filter(|a| a.superseded_version >= manifest.version)
            });
        Ok(match archive {
            Some(archive) => self.work_dir.join(archive.dir).join(relative),
            None => recorded,
        })
    }
}

fn parse_version(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix('v')?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// Write access to one open manifest. Every mutation is persisted.
#[derive(Debug)]
pub struct ManifestHandle {
    path: PathBuf,
    manifest: Manifest,
    sealed: bool,
}

impl ManifestHandle {
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn version(&self) -> u32 {
        self.manifest.version
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    fn persist(&self) -> PipelineResult<()> {
        fsio::atomic_write_json(&self.path, &self.manifest)
    }

    fn update(&mut self, what: &str, f: impl FnOnce(&mut Manifest)) -> PipelineResult<()> {
        if self.sealed {
            return Err(PipelineError::ManifestInvalidState(format!(
                "{} v{}: {what} after finalize",
                self.manifest.stage, self.manifest.version
            )));
        }
        f(&mut self.manifest);
        self.persist()
    }

    pub fn track_input(&mut self, descriptor: FileDescriptor) -> PipelineResult<()> {
        self.update("track_input", |m| m.inputs.push(descriptor))
    }

    pub fn track_output(&mut self, descriptor: FileDescriptor) -> PipelineResult<()> {
        self.update("track_output", |m| m.outputs.push(descriptor))
    }

    pub fn track_intermediate(&mut self, descriptor: IntermediateDescriptor) -> PipelineResult<()> {
        self.update("track_intermediate", |m| m.intermediates.push(descriptor))
    }

    pub fn record_config(&mut self, snapshot: BTreeMap<String, ConfigValue>) -> PipelineResult<()> {
        self.update("record_config", |m| m.config = snapshot)
    }

    pub fn record_prediction(&mut self, record: PredictionRecord) -> PipelineResult<()> {
        self.update("record_prediction", |m| m.prediction = Some(record))
    }

    pub fn record_invocation(
        &mut self,
        environment: &str,
        command: Vec<String>,
        verification_only: bool,
        log_path: PathBuf,
    ) -> PipelineResult<()> {
        self.update("record_invocation", |m| {
            m.environment = Some(environment.to_string());
            m.command = command;
            m.verification_only = verification_only;
            m.log_path = Some(log_path);
        })
    }

    pub fn record_exit_code(&mut self, code: Option<i32>) -> PipelineResult<()> {
        self.update("record_exit_code", |m| m.exit_code = code)
    }

    pub fn record_archive(&mut self, archive: OutputArchive) -> PipelineResult<()> {
        self.update("record_archive", |m| m.archived_outputs = Some(archive))
    }

    /// Marks this version as a reuse of an earlier successful one.
    pub fn resume_from(&mut self, previous: &Manifest) -> PipelineResult<()> {
        self.update("resume_from", |m| {
            m.resumed_from = Some(previous.version);
            m.environment = previous.environment.clone();
            m.command = previous.command.clone();
            m.verification_only = previous.verification_only;
            m.outputs = previous.outputs.clone();
            m.intermediates = previous.intermediates.clone();
            m.prediction = previous.prediction.clone();
            m.log_path = previous.log_path.clone();
        })
    }

    /// Seals the manifest. The only way to set a terminal status.
    pub fn finalize(&mut self, status: StageStatus, error: Option<ErrorDetail>) -> PipelineResult<&Manifest> {
        if self.sealed {
            return Err(PipelineError::ManifestInvalidState(format!(
                "{} v{}: finalize called twice",
                self.manifest.stage, self.manifest.version
            )));
        }
        let mut sealed = self.manifest.clone();
        sealed.status = status;
        sealed.error = error;
        sealed.finished_at = Some(Utc::now());
        sealed.validate_seal()?;

        self.manifest = sealed;
        self.persist()?;
        self.sealed = true;
        debug!(
            stage = %self.manifest.stage,
            version = self.manifest.version,
            status = %status,
            "manifest sealed"
        );
        Ok(&self.manifest)
    }
}
