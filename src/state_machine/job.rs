use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stage::{StageKind, StageStatus};
use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::fsio;

/// File name of the job descriptor inside the work dir.
pub const JOB_DESCRIPTOR: &str = "job.json";

/// Resolve a workflow selector to its ordered stage list.
pub fn workflow_stages(workflow: &str) -> PipelineResult<Vec<StageKind>> {
    use StageKind::*;
    let stages = match workflow.trim().to_ascii_lowercase().as_str() {
        "audio" => vec![ExtractAudio],
        "transcribe" => vec![ExtractAudio, DetectVoice, Transcribe],
        "subtitle" => vec![ExtractAudio, DetectVoice, Transcribe, GenerateSubtitles],
        "translate" => vec![
            ExtractAudio,
            DetectVoice,
            Transcribe,
            Translate,
            GenerateSubtitles,
        ],
        other => {
            return Err(PipelineError::InvalidJob(format!(
                "unknown workflow `{other}` (expected audio, transcribe, subtitle or translate)"
            )));
        }
    };
    Ok(stages)
}

/// Check that a stage list can run in declared order.
pub fn validate_stage_order(stages: &[StageKind]) -> PipelineResult<()> {
    if stages.is_empty() {
        return Err(PipelineError::InvalidJob("stage list is empty".into()));
    }
    let mut seen = BTreeSet::new();
    for (idx, stage) in stages.iter().enumerate() {
        if !seen.insert(*stage) {
            return Err(PipelineError::InvalidJob(format!(
                "stage `{stage}` appears more than once"
            )));
        }
        let late = stage
            .upstream()
            .iter()
            .find(|up| stages[idx..].contains(*up));
        if let Some(up) = late {
            return Err(PipelineError::InvalidJob(format!(
                "stage `{stage}` consumes `{up}` but is declared before it"
            )));
        }
    }
    Ok(())
}

/// Overall outcome of one orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed,
    Interrupted,
}

/// What happened to one stage during one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    pub run_id: String,
    pub stage: StageKind,
    pub status: StageStatus,
    pub manifest_version: Option<u32>,
    pub dispatched: bool,
    pub elapsed_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

/// The first failing stage of a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageFailure {
    pub stage: StageKind,
    pub kind: ErrorKind,
    pub message: String,
    pub log_path: PathBuf,
}

/// One processing request and its working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub workflow: String,
    pub stages: Vec<StageKind>,
    pub inputs: Vec<PathBuf>,
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub results: Vec<StageReport>,
    #[serde(skip)]
    pub work_dir: PathBuf,
}

impl Job {
    pub fn new(
        work_dir: impl Into<PathBuf>,
        workflow: &str,
        inputs: Vec<PathBuf>,
        overrides: BTreeMap<String, String>,
    ) -> PipelineResult<Self> {
        let stages = workflow_stages(workflow)?;
        Self::with_stages(work_dir, workflow, stages, inputs, overrides)
    }

    /// Build a job from an explicit stage list instead of a named workflow.
    pub fn with_stages(
        work_dir: impl Into<PathBuf>,
        workflow: &str,
        stages: Vec<StageKind>,
        inputs: Vec<PathBuf>,
        overrides: BTreeMap<String, String>,
    ) -> PipelineResult<Self> {
        validate_stage_order(&stages)?;
        if inputs.is_empty() {
            return Err(PipelineError::InvalidJob("job has no input media".into()));
        }
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            workflow: workflow.to_string(),
            stages,
            inputs,
            overrides,
            created_at: Utc::now(),
            results: Vec::new(),
            work_dir: work_dir.into(),
        })
    }

    /// Materialize the descriptor and directory layout on disk.
    pub fn prepare(
        work_dir: impl Into<PathBuf>,
        workflow: &str,
        inputs: Vec<PathBuf>,
        overrides: BTreeMap<String, String>,
    ) -> PipelineResult<Self> {
        let job = Self::new(work_dir, workflow, inputs, overrides)?;
        job.create_layout()?;
        job.save()?;
        Ok(job)
    }

    pub fn load(work_dir: impl Into<PathBuf>) -> PipelineResult<Self> {
        let work_dir = work_dir.into();
        let path = work_dir.join(JOB_DESCRIPTOR);
        if !path.exists() {
            return Err(PipelineError::InvalidJob(format!(
                "no job descriptor at {}",
                path.display()
            )));
        }
        let bytes = std::fs::read(&path)?;
        let mut job: Job = serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::InvalidJob(format!("{}: {e}", path.display())))?;
        validate_stage_order(&job.stages)?;
        job.work_dir = work_dir;
        Ok(job)
    }

    pub fn save(&self) -> PipelineResult<()> {
        fsio::atomic_write_json(&self.work_dir.join(JOB_DESCRIPTOR), self)
    }

    pub fn create_layout(&self) -> PipelineResult<()> {
        for dir in [self.stages_root(), self.manifests_root(), self.logs_dir()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Only `results` changes after creation.
    pub fn append_result(&mut self, report: StageReport) -> PipelineResult<()> {
        self.results.push(report);
        self.save()
    }

    /// Job-level inputs, resolved against the work dir.
    pub fn input_paths(&self) -> Vec<PathBuf> {
        self.inputs.iter().map(|p| self.resolve_path(p)).collect()
    }

    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        }
    }

    pub fn stages_root(&self) -> PathBuf {
        self.work_dir.join("stages")
    }

    pub fn stage_dir(&self, stage: StageKind) -> PathBuf {
        self.stages_root().join(stage.name())
    }

    pub fn manifests_root(&self) -> PathBuf {
        self.work_dir.join("manifests")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.work_dir.join("logs")
    }

    pub fn stage_log(&self, stage: StageKind) -> PathBuf {
        self.logs_dir().join(format!("{}.log", stage.name()))
    }

    pub fn job_log(&self) -> PathBuf {
        self.logs_dir().join("job.log")
    }

    /// Upstream stages of `stage` that are part of this job and precede it.
    pub fn upstream_of(&self, stage: StageKind) -> Vec<StageKind> {
        let Some(idx) = self.stages.iter().position(|s| *s == stage) else {
            return Vec::new();
        };
        self.stages[..idx]
            .iter()
            .copied()
            .filter(|s| stage.upstream().contains(s))
            .collect()
    }
}

/// Structured record produced at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub job_id: String,
    pub run_id: String,
    pub status: JobStatus,
    pub stages: Vec<StageReport>,
    pub failure: Option<StageFailure>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl JobResult {
    pub fn report(&self, stage: StageKind) -> Option<&StageReport> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    pub fn dispatch_count(&self) -> usize {
        self.stages.iter().filter(|r| r.dispatched).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use StageKind::*;

    fn media() -> Vec<PathBuf> {
        vec![PathBuf::from("input.wav")]
    }

    #[test]
    fn workflows_resolve_to_ordered_stages() {
        assert_eq!(workflow_stages("audio").unwrap(), vec![ExtractAudio]);
        assert_eq!(
            workflow_stages("Transcribe").unwrap(),
            vec![ExtractAudio, DetectVoice, Transcribe]
        );
        let translate = workflow_stages("translate").unwrap();
        assert_eq!(translate.len(), 5);
        assert_eq!(translate.last(), Some(&GenerateSubtitles));
        assert!(workflow_stages("karaoke").is_err());
    }

    #[test]
    fn every_builtin_workflow_is_valid() {
        for name in ["audio", "transcribe", "subtitle", "translate"] {
            validate_stage_order(&workflow_stages(name).unwrap()).unwrap();
        }
    }

    #[test]
    fn out_of_order_stage_list_is_rejected() {
        let err = validate_stage_order(&[Transcribe, ExtractAudio]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidJob(_)));
        assert!(err.to_string().contains("declared before"));
    }

    #[test]
    fn duplicate_and_empty_stage_lists_are_rejected() {
        assert!(validate_stage_order(&[]).is_err());
        assert!(validate_stage_order(&[ExtractAudio, ExtractAudio]).is_err());
    }

    #[test]
    fn job_requires_input_media() {
        let err = Job::new("/tmp/x", "audio", vec![], BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("no input media"));
    }

    #[test]
    fn prepare_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut overrides = BTreeMap::new();
        overrides.insert("params.beam_size".to_string(), "2".to_string());
        let job = Job::prepare(dir.path(), "transcribe", media(), overrides).unwrap();

        assert!(dir.path().join(JOB_DESCRIPTOR).exists());
        assert!(job.manifests_root().is_dir());
        assert!(job.logs_dir().is_dir());

        let loaded = Job::load(dir.path()).unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.stages, job.stages);
        assert_eq!(loaded.overrides["params.beam_size"], "2");
        assert_eq!(loaded.work_dir, dir.path());
    }

    #[test]
    fn descriptor_uses_camel_case_fields() {
        let dir = tempfile::tempdir().unwrap();
        Job::prepare(dir.path(), "audio", media(), BTreeMap::new()).unwrap();
        let raw = std::fs::read_to_string(dir.path().join(JOB_DESCRIPTOR)).unwrap();
        assert!(raw.contains("\"createdAt\""));
        assert!(raw.contains("\"extract_audio\""));
        assert!(!raw.contains("workDir"));
    }

    #[test]
    fn load_missing_descriptor_is_invalid_job() {
        let dir = tempfile::tempdir().unwrap();
        let err = Job::load(dir.path()).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidJob(_)));
    }

    #[test]
    fn append_result_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = Job::prepare(dir.path(), "audio", media(), BTreeMap::new()).unwrap();
        job.append_result(StageReport {
            run_id: "r1".into(),
            stage: ExtractAudio,
            status: StageStatus::Success,
            manifest_version: Some(1),
            dispatched: true,
            elapsed_ms: 12,
            recorded_at: Utc::now(),
        })
        .unwrap();
        let loaded = Job::load(dir.path()).unwrap();
        assert_eq!(loaded.results.len(), 1);
        assert_eq!(loaded.results[0].status, StageStatus::Success);
    }

    #[test]
    fn upstream_of_only_includes_present_preceding_stages() {
        let job = Job::new("/w", "subtitle", media(), BTreeMap::new()).unwrap();
        assert_eq!(job.upstream_of(ExtractAudio), Vec::<StageKind>::new());
        assert_eq!(job.upstream_of(Transcribe), vec![ExtractAudio, DetectVoice]);
        // No translate stage in the subtitle workflow.
        assert_eq!(job.upstream_of(GenerateSubtitles), vec![Transcribe]);
    }

    #[test]
    fn relative_inputs_resolve_against_work_dir() {
        let job = Job::new("/w", "audio", media(), BTreeMap::new()).unwrap();
        assert_eq!(job.input_paths(), vec![PathBuf::from("/w/input.wav")]);
        assert_eq!(job.stage_log(Transcribe), PathBuf::from("/w/logs/transcribe.log"));
    }
}
