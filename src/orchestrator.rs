use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::CacheManager;
use crate::config::{ConfigValue, JobSettings, OutputPolicy, ResolvedConfig};
use crate::dispatcher::{DispatchRequest, EnvironmentDispatcher, ExecutionResult, StageExecutor};
use crate::error::{PipelineError, PipelineResult};
use crate::manifest::{
    ErrorDetail, FileDescriptor, Manifest, ManifestHandle, ManifestStore, OutputArchive,
    PredictionRecord,
};
use crate::predictor::{
    AdaptivePredictor, AudioFingerprint, FingerprintProbe, Outcome, ParameterPredictor,
    PredictionConfig, StageParams, WavProbe, cached_fingerprint,
};
use crate::registry::EnvironmentRegistry;
use crate::remote::{HttpFetcher, cached_artifact};
use crate::state_machine::{
    Job, JobResult, JobStatus, StageEvent, StageFailure, StageKind, StageReport, StageState,
    StageStatus, validate_stage_order,
};

/// How long downloaded model artifacts stay valid in the cache.
const MODEL_TTL: Duration = Duration::from_secs(180 * 24 * 3600);
const REMOTE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Which stages must execute even when a reusable manifest exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForceRerun {
    #[default]
    None,
    All,
    /// The named stage and everything after it.
    From(StageKind),
}

impl ForceRerun {
    pub fn covers(&self, stage: StageKind, stages: &[StageKind]) -> bool {
        match self {
            ForceRerun::None => false,
            ForceRerun::All => true,
            ForceRerun::From(first) => {
                let pos = |s: StageKind| stages.iter().position(|x| *x == s);
                match (pos(*first), pos(stage)) {
                    (Some(first), Some(current)) => current >= first,
                    _ => false,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub force: ForceRerun,
}

/// Cooperative cancellation, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn checkpoint(&self, next: StageKind) -> PipelineResult<()> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled(next.to_string()));
        }
        Ok(())
    }
}

/// Progress callbacks. Every method defaults to a no-op.
pub trait StageObserver {
    fn stage_started(&self, _stage: StageKind, _index: usize, _total: usize) {}
    fn stage_finished(&self, _report: &StageReport) {}
    fn stage_failed(&self, _report: &StageReport, _failure: &StageFailure) {}
    fn run_finished(&self, _result: &JobResult) {}
}

pub struct NoopObserver;

impl StageObserver for NoopObserver {}

/// Everything built once per job from the configuration chain.
pub struct JobContext {
    pub config: ResolvedConfig,
    pub settings: JobSettings,
    pub cache: Arc<CacheManager>,
    pub registry: Arc<EnvironmentRegistry>,
}

impl JobContext {
    pub fn load(job: &Job, system_defaults: &Path) -> PipelineResult<Self> {
        let config = ResolvedConfig::load(&job.overrides, &job.work_dir, system_defaults)?;
        Self::from_config(config, &job.work_dir)
    }

    pub fn from_config(config: ResolvedConfig, work_dir: &Path) -> PipelineResult<Self> {
        let settings = JobSettings::from_resolved(&config, work_dir)?;
        let registry = Arc::new(EnvironmentRegistry::from_config(&config)?);
        let cache = Arc::new(CacheManager::from_settings(&settings));
        Ok(Self {
            config,
            settings,
            cache,
            registry,
        })
    }

    pub fn dispatcher(&self) -> EnvironmentDispatcher {
        EnvironmentDispatcher::new(
            self.registry.clone(),
            self.cache.model_dir(),
            self.cache.intermediate_dir(),
        )
    }

    pub fn predictor(&self) -> AdaptivePredictor {
        AdaptivePredictor::new(
            self.cache.clone(),
            self.settings.predictor_min_samples,
            self.settings.history_ttl,
        )
    }
}

/// Parameters chosen for one dispatch, plus what the predictor saw.
struct ParamChoice {
    params: StageParams,
    record: Option<PredictionRecord>,
    fingerprint: Option<AudioFingerprint>,
}

enum StageOutcome {
    Done {
        report: StageReport,
        outputs: Vec<PathBuf>,
    },
    Failed {
        report: StageReport,
        failure: StageFailure,
    },
}

/// Per-run bookkeeping.
struct RunState {
    run_id: String,
    snapshot: BTreeMap<String, ConfigValue>,
    outputs: BTreeMap<StageKind, Vec<PathBuf>>,
    /// Set once any stage executes; later stages can no longer be skipped.
    executed: bool,
}

/// Walks a job's stages in order, resuming, dispatching and recording each.
pub struct StageOrchestrator<E, P> {
    context: JobContext,
    executor: E,
    predictor: P,
    probe: Box<dyn FingerprintProbe>,
    remote: Option<HttpFetcher>,
    observer: Box<dyn StageObserver>,
    cancel: CancellationToken,
}

impl StageOrchestrator<EnvironmentDispatcher, AdaptivePredictor> {
    /// Production wiring: subprocess dispatcher and history-backed predictor.
    pub fn for_job(job: &Job, system_defaults: &Path) -> PipelineResult<Self> {
        let context = JobContext::load(job, system_defaults)?;
        let executor = context.dispatcher();
        let predictor = context.predictor();
        Self::new(context, executor, predictor)
    }
}

impl<E: StageExecutor, P: ParameterPredictor> StageOrchestrator<E, P> {
    pub fn new(context: JobContext, executor: E, predictor: P) -> PipelineResult<Self> {
        let remote = match &context.settings.remote_base_url {
            Some(url) => Some(
                HttpFetcher::new(url.clone(), context.settings.remote_min_interval)?
                    .with_retries(context.settings.remote_max_retries, REMOTE_RETRY_DELAY),
            ),
            None => None,
        };
        Ok(Self {
            context,
            executor,
            predictor,
            probe: Box::new(WavProbe),
            remote,
            observer: Box::new(NoopObserver),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_probe(mut self, probe: Box<dyn FingerprintProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn StageObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn settings(&self) -> &JobSettings {
        &self.context.settings
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Runs every stage of `job` in declared order, stopping at the first
    /// failure. Stage failures are reported in the returned [`JobResult`];
    /// `Err` means the run itself could not proceed.
    pub async fn run(&self, job: &mut Job, options: &RunOptions) -> PipelineResult<JobResult> {
        validate_stage_order(&job.stages)?;
        job.create_layout()?;
        let started_at = Utc::now();
        let store = ManifestStore::new(&job.work_dir);
        let mut run = RunState {
            run_id: Uuid::new_v4().to_string(),
            snapshot: self.context.config.snapshot(),
            outputs: BTreeMap::new(),
            executed: false,
        };
        info!(job = %job.id, run = %run.run_id, stages = job.stages.len(), "run started");

        let mut reports = Vec::new();
        let mut failure = None;
        let mut status = JobStatus::Succeeded;
        let stages = job.stages.clone();
        let total = stages.len();

        for (index, stage) in stages.into_iter().enumerate() {
            if let Err(err) = self.cancel.checkpoint(stage) {
                warn!(job = %job.id, error = %err, "run interrupted");
                status = JobStatus::Interrupted;
                break;
            }
            self.observer.stage_started(stage, index, total);

            let outcome = match self.run_stage(job, &store, stage, &mut run, options).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    debug_assert!(
                        !matches!(err, PipelineError::ManifestInvalidState(_)),
                        "orchestrator misused a manifest: {err}"
                    );
                    error!(stage = %stage, error = %err, "run aborted");
                    return Err(err);
                }
            };

            match outcome {
                StageOutcome::Done { report, outputs } => {
                    self.observer.stage_finished(&report);
                    run.outputs.insert(stage, outputs);
                    job.append_result(report.clone())?;
                    reports.push(report);
                }
                StageOutcome::Failed {
                    report,
                    failure: stage_failure,
                } => {
                    self.observer.stage_failed(&report, &stage_failure);
                    job.append_result(report.clone())?;
                    reports.push(report);
                    failure = Some(stage_failure);
                    status = JobStatus::Failed;
                    break;
                }
            }
        }

        let completed_at = Utc::now();
        let result = JobResult {
            job_id: job.id.clone(),
            run_id: run.run_id,
            status,
            stages: reports,
            failure,
            started_at,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds(),
        };
        info!(
            job = %job.id,
            status = ?result.status,
            dispatched = result.dispatch_count(),
            "run finished"
        );
        self.observer.run_finished(&result);
        Ok(result)
    }

    async fn run_stage(
        &self,
        job: &Job,
        store: &ManifestStore,
        stage: StageKind,
        run: &mut RunState,
        options: &RunOptions,
    ) -> PipelineResult<StageOutcome> {
        let started = Instant::now();
        let work_dir = job.work_dir.as_path();
        let previous = store.latest_finished(stage)?;
        let forced = options.force.covers(stage, &job.stages);

        let mut state = StageState::new(stage);
        if forced {
            if let Some(prev) = &previous {
                state.status = prev.status;
                state.apply(StageEvent::ForceRerun)?;
                info!(stage = %stage, previous = prev.version, "forced re-run");
            }
        }

        let inputs = self.stage_inputs(job, stage, &run.outputs);
        let descriptors: PipelineResult<Vec<FileDescriptor>> = inputs
            .iter()
            .map(|path| FileDescriptor::hash(path, work_dir))
            .collect();

        let mut handle = match descriptors {
            Ok(descriptors) => {
                if !forced && !run.executed {
                    let reusable = previous
                        .as_ref()
                        .filter(|prev| is_reusable(prev, &descriptors, work_dir));
                    if let Some(prev) = reusable {
                        return self.skip_stage(job, store, stage, run, state, prev, descriptors, started);
                    }
                }
                let mut handle = store.open(stage, &job.id, &run.run_id)?;
                for descriptor in descriptors {
                    handle.track_input(descriptor)?;
                }
                handle
            }
            Err(err) => {
                // Nothing to dispatch; record the failure against a fresh version.
                run.executed = true;
                let mut handle = store.open(stage, &job.id, &run.run_id)?;
                handle.record_config(run.snapshot.clone())?;
                state.apply(StageEvent::Start)?;
                state.apply(StageEvent::Fail)?;
                return self.finish_failed(job, stage, run, &mut handle, state.status, err, started);
            }
        };

        run.executed = true;
        state.apply(StageEvent::Start)?;
        handle.record_config(run.snapshot.clone())?;
        let choice = self.choose_params(job, stage, &inputs, run).await;
        if let Some(record) = &choice.record {
            handle.record_prediction(record.clone())?;
        }

        let timeout = self.context.settings.timeout_for(stage);
        let log_path = job.stage_log(stage);
        let dispatched = self
            .dispatch(job, stage, run, &mut handle, &inputs, &choice.params, previous.as_ref(), timeout)
            .await;

        let result: PipelineResult<Vec<PathBuf>> = match dispatched {
            Ok(exec) => {
                handle.record_invocation(
                    &exec.environment,
                    exec.command.clone(),
                    exec.verification_only,
                    log_path.clone(),
                )?;
                handle.record_exit_code(exec.exit_code)?;
                for intermediate in &exec.intermediates {
                    handle.track_intermediate(intermediate.clone())?;
                }
                match exec.failure(stage, timeout) {
                    Some(err) => Err(err),
                    None => {
                        // An output that vanished or cannot be read fails the stage.
                        let hashed: PipelineResult<Vec<FileDescriptor>> = exec
                            .outputs
                            .iter()
                            .map(|output| FileDescriptor::hash(output, work_dir))
                            .collect();
                        match hashed {
                            Ok(descriptors) => {
                                for descriptor in descriptors {
                                    handle.track_output(descriptor)?;
                                }
                                Ok(exec.outputs)
                            }
                            Err(err) => Err(err),
                        }
                    }
                }
            }
            Err(err) => Err(err),
        };

        if let Some(fingerprint) = &choice.fingerprint {
            let outcome = Outcome {
                success: result.is_ok(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
            if let Err(err) = self.predictor.learn(stage, fingerprint, &choice.params, outcome) {
                warn!(stage = %stage, error = %err, "predictor could not record outcome");
            }
        }

        match result {
            Ok(outputs) => {
                state.apply(StageEvent::Succeed)?;
                let manifest = handle.finalize(StageStatus::Success, None)?;
                info!(
                    stage = %stage,
                    version = manifest.version,
                    outputs = outputs.len(),
                    "stage succeeded"
                );
                let report = stage_report(run, stage, state.status, Some(manifest.version), true, started);
                Ok(StageOutcome::Done { report, outputs })
            }
            Err(err) => {
                state.apply(StageEvent::Fail)?;
                self.finish_failed(job, stage, run, &mut handle, state.status, err, started)
            }
        }
    }

    /// Clears the output dir, resolves models, then hands the stage to the
    /// executor.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        job: &Job,
        stage: StageKind,
        run: &RunState,
        handle: &mut ManifestHandle,
        inputs: &[PathBuf],
        params: &StageParams,
        previous: Option<&Manifest>,
        timeout: Duration,
    ) -> PipelineResult<ExecutionResult> {
        let previous_version = previous.map(|m| m.version);
        let archived = prepare_output_dir(job, stage, previous_version, self.context.settings.output_policy)?;
        if let Some(dir) = archived {
            let dir = dir.strip_prefix(&job.work_dir).map(Path::to_path_buf).unwrap_or(dir);
            handle.record_archive(OutputArchive {
                superseded_version: previous_version.unwrap_or(0),
                dir,
            })?;
        }
        let extra_env = self.resolve_models(stage).await?;
        let request = DispatchRequest {
            stage,
            run_id: run.run_id.clone(),
            work_dir: job.work_dir.clone(),
            output_dir: job.stage_dir(stage),
            inputs: inputs.to_vec(),
            params: params.clone(),
            timeout,
            stage_log: job.stage_log(stage),
            job_log: job.job_log(),
            extra_env,
        };
        self.executor.execute(&request).await
    }

    #[allow(clippy::too_many_arguments)]
    fn skip_stage(
        &self,
        job: &Job,
        store: &ManifestStore,
        stage: StageKind,
        run: &RunState,
        mut state: StageState,
        previous: &Manifest,
        descriptors: Vec<FileDescriptor>,
        started: Instant,
    ) -> PipelineResult<StageOutcome> {
        let mut handle = store.open(stage, &job.id, &run.run_id)?;
        for descriptor in descriptors {
            handle.track_input(descriptor)?;
        }
        handle.record_config(run.snapshot.clone())?;
        handle.resume_from(previous)?;
        state.apply(StageEvent::Skip)?;
        let manifest = handle.finalize(StageStatus::Skipped, None)?;
        info!(stage = %stage, resumed_from = previous.version, "stage skipped");

        let outputs = manifest
            .outputs
            .iter()
            .map(|o| o.absolute(&job.work_dir))
            .collect();
        let report = stage_report(run, stage, state.status, Some(manifest.version), false, started);
        Ok(StageOutcome::Done { report, outputs })
    }

    /// Seals the manifest as failed. Errors outside the stage-failure
    /// taxonomy still abort the whole run.
    #[allow(clippy::too_many_arguments)]
    fn finish_failed(
        &self,
        job: &Job,
        stage: StageKind,
        run: &RunState,
        handle: &mut ManifestHandle,
        status: StageStatus,
        err: PipelineError,
        started: Instant,
    ) -> PipelineResult<StageOutcome> {
        let detail = ErrorDetail::from(&err);
        let sealed = handle.finalize(StageStatus::Failed, Some(detail.clone()));
        if !err.is_stage_failure() {
            if let Err(seal_err) = sealed {
                warn!(stage = %stage, error = %seal_err, "could not seal manifest");
            }
            return Err(err);
        }
        let version = sealed?.version;
        let log_path = job.stage_log(stage);
        warn!(stage = %stage, error = %err, log = %log_path.display(), "stage failed");

        let failure = StageFailure {
            stage,
            kind: detail.kind,
            message: detail.message,
            log_path,
        };
        let report = stage_report(run, stage, status, Some(version), true, started);
        Ok(StageOutcome::Failed { report, failure })
    }

    /// Upstream outputs, or the job inputs for a stage with no upstream in
    /// this job, plus any configured extras.
    fn stage_inputs(
        &self,
        job: &Job,
        stage: StageKind,
        outputs: &BTreeMap<StageKind, Vec<PathBuf>>,
    ) -> Vec<PathBuf> {
        let upstream = job.upstream_of(stage);
        let mut inputs: Vec<PathBuf> = if upstream.is_empty() {
            job.input_paths()
        } else {
            upstream
                .iter()
                .flat_map(|up| outputs.get(up).cloned().unwrap_or_default())
                .collect()
        };
        if let Some(extra) = self.context.settings.extra_inputs.get(&stage) {
            inputs.extend(extra.iter().cloned());
        }
        inputs
    }

    /// Applies the confidence gate. Never fails: any problem producing a
    /// prediction degrades to the job defaults.
    async fn choose_params(&self, job: &Job, stage: StageKind, inputs: &[PathBuf], run: &RunState) -> ParamChoice {
        let settings = &self.context.settings;
        let defaults = settings.default_params.clone();
        if !stage.is_adaptive() || !settings.predictor_enabled {
            return ParamChoice {
                params: defaults,
                record: None,
                fingerprint: None,
            };
        }

        let fingerprint = match fingerprint_source(job, inputs, run) {
            Some(media) => {
                cached_fingerprint(&self.context.cache, self.probe.as_ref(), &media, settings.fingerprint_ttl)
                    .await
            }
            None => Err(PipelineError::PredictorFailure(
                "no WAV input to fingerprint".into(),
            )),
        };
        let (prediction, fingerprint) = match fingerprint {
            Ok(fp) => match self.predictor.predict(stage, &fp) {
                Ok(prediction) => (prediction, Some(fp)),
                Err(err) => {
                    warn!(stage = %stage, error = %err, "predictor failed, using defaults");
                    (PredictionConfig::failed(&defaults, &err), Some(fp))
                }
            },
            Err(err) => {
                warn!(stage = %stage, error = %err, "fingerprint unavailable, using defaults");
                (PredictionConfig::failed(&defaults, &err), None)
            }
        };

        let applied = prediction.confidence >= settings.predictor_threshold;
        let params = if applied {
            prediction.params.clone()
        } else {
            defaults
        };
        info!(
            stage = %stage,
            confidence = prediction.confidence,
            threshold = settings.predictor_threshold,
            applied,
            "parameter prediction"
        );
        ParamChoice {
            record: Some(PredictionRecord {
                prediction_applied: applied,
                threshold: settings.predictor_threshold,
                predicted: prediction,
                applied: params.clone(),
            }),
            params,
            fingerprint,
        }
    }

    /// Makes the stage's declared model artifacts available locally and
    /// binds them as `MEDIAFLOW_MODEL_FILES`.
    async fn resolve_models(&self, stage: StageKind) -> PipelineResult<BTreeMap<String, String>> {
        let models = self
            .context
            .config
            .get_list(&format!("stages.{}.models", stage.name()));
        let mut env = BTreeMap::new();
        if models.is_empty() {
            return Ok(env);
        }
        let mut paths = Vec::with_capacity(models.len());
        for model in &models {
            let path = cached_artifact(&self.context.cache, self.remote.as_ref(), model, MODEL_TTL)
                .await
                .map_err(|e| PipelineError::EnvironmentUnavailable {
                    stage: stage.to_string(),
                    reason: format!("model artifact `{model}`: {e}"),
                })?;
            paths.push(path.display().to_string());
        }
        env.insert("MEDIAFLOW_MODEL_FILES".to_string(), paths.join("\n"));
        Ok(env)
    }
}

fn stage_report(
    run: &RunState,
    stage: StageKind,
    status: StageStatus,
    manifest_version: Option<u32>,
    dispatched: bool,
    started: Instant,
) -> StageReport {
    StageReport {
        run_id: run.run_id.clone(),
        stage,
        status,
        manifest_version,
        dispatched,
        elapsed_ms: started.elapsed().as_millis() as u64,
        recorded_at: Utc::now(),
    }
}

/// A finished manifest can be reused when it succeeded, saw exactly the
/// same inputs, and its outputs are still intact on disk.
fn is_reusable(previous: &Manifest, fresh: &[FileDescriptor], work_dir: &Path) -> bool {
    if !previous.is_reusable() {
        return false;
    }
    let fresh_hashes: BTreeMap<&Path, &str> = fresh
        .iter()
        .map(|d| (d.path.as_path(), d.sha256.as_str()))
        .collect();
    if previous.input_hashes() != fresh_hashes {
        return false;
    }
    previous.outputs.iter().all(|o| o.still_matches(work_dir))
}

/// The audio a prediction is about. Text stages downstream of transcription
/// are keyed on the run's extracted audio, or failing that a WAV job input.
fn fingerprint_source(job: &Job, inputs: &[PathBuf], run: &RunState) -> Option<PathBuf> {
    let extracted = run.outputs.get(&StageKind::ExtractAudio).into_iter().flatten();
    inputs
        .iter()
        .chain(extracted)
        .cloned()
        .chain(job.input_paths())
        .find(|p| is_wav(p))
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("wav"))
        .unwrap_or(false)
}

/// Clears a stage's output dir before it executes, per the re-run policy.
/// Returns the archive directory when old outputs were versioned.
fn prepare_output_dir(
    job: &Job,
    stage: StageKind,
    previous_version: Option<u32>,
    policy: OutputPolicy,
) -> PipelineResult<Option<PathBuf>> {
    let dir = job.stage_dir(stage);
    let occupied = dir.is_dir() && fs::read_dir(&dir)?.next().is_some();
    let mut archived = None;
    if occupied {
        match policy {
            OutputPolicy::Replace => {
                fs::remove_dir_all(&dir)?;
                info!(stage = %stage, "previous outputs removed");
            }
            OutputPolicy::Version => {
                let base = format!("{}.v{:04}", stage.name(), previous_version.unwrap_or(0));
                let mut target = job.stages_root().join(&base);
                let mut n = 1;
                while target.exists() {
                    target = job.stages_root().join(format!("{base}-{n}"));
                    n += 1;
                }
                fs::rename(&dir, &target)?;
                info!(stage = %stage, archived = %target.display(), "previous outputs versioned");
                archived = Some(target);
            }
        }
    }
    fs::create_dir_all(&dir)?;
    Ok(archived)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigLayer, ConfigTier};
    use crate::dispatcher::ExitReason;
    use crate::error::ErrorKind;
    use crate::predictor::fingerprint::tests::write_wav;
    use std::sync::Mutex;

    /// In-process stand-in for stage programs. Extract copies the first
    /// input to `audio.wav`; every other stage writes `<stage>.txt` whose
    /// content depends on its inputs.
    #[derive(Default)]
    struct FakeExecutor {
        calls: Mutex<Vec<DispatchRequest>>,
        fail: Option<StageKind>,
        cancel_after: Option<(StageKind, CancellationToken)>,
        /// Stage that reports an output file it never wrote.
        phantom_output: Option<StageKind>,
    }

    impl FakeExecutor {
        fn calls(&self) -> Vec<DispatchRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl StageExecutor for FakeExecutor {
        async fn execute(&self, request: &DispatchRequest) -> PipelineResult<ExecutionResult> {
            self.calls.lock().unwrap().push(request.clone());
            if let Some((stage, token)) = &self.cancel_after {
                if *stage == request.stage {
                    token.cancel();
                }
            }
            std::fs::create_dir_all(&request.output_dir).unwrap();
            let exit_code = if self.fail == Some(request.stage) {
                2
            } else if request.stage == StageKind::ExtractAudio {
                std::fs::copy(&request.inputs[0], request.output_dir.join("audio.wav")).unwrap();
                0
            } else {
                let mut body = request.stage.name().to_string();
                for input in &request.inputs {
                    body.push_str(&crate::fsio::sha256_file(input).unwrap());
                }
                std::fs::write(request.output_dir.join(format!("{}.txt", request.stage)), body)
                    .unwrap();
                0
            };
            let mut outputs = if exit_code == 0 {
                crate::fsio::list_files(&request.output_dir).unwrap()
            } else {
                Vec::new()
            };
            if self.phantom_output == Some(request.stage) {
                outputs.push(request.output_dir.join("never-written.txt"));
            }
            Ok(ExecutionResult {
                environment: "fake".into(),
                command: vec![request.stage.name().into()],
                exit_code: Some(exit_code),
                reason: ExitReason::Exited,
                outputs,
                intermediates: Vec::new(),
                verification_only: false,
                elapsed: Duration::ZERO,
            })
        }
    }

    struct FixedPredictor(PipelineResult<f64>);

    impl ParameterPredictor for FixedPredictor {
        fn predict(&self, _: StageKind, _fp: &AudioFingerprint) -> PipelineResult<PredictionConfig> {
            match &self.0 {
                Ok(confidence) => Ok(PredictionConfig {
                    params: StageParams {
                        model_size: "large".into(),
                        batch_size: 8,
                        beam_size: 5,
                    },
                    confidence: *confidence,
                    reasoning: "fixed".into(),
                }),
                Err(_) => Err(PipelineError::PredictorFailure("model file missing".into())),
            }
        }

        fn learn(&self, _: StageKind, _: &AudioFingerprint, _: &StageParams, _: Outcome) -> PipelineResult<()> {
            Ok(())
        }
    }

    fn job(dir: &Path, overrides: &[(&str, &str)]) -> Job {
        workflow_job(dir, "transcribe", overrides)
    }

    fn workflow_job(dir: &Path, workflow: &str, overrides: &[(&str, &str)]) -> Job {
        let media = dir.join("input.wav");
        if !media.exists() {
            write_wav(&media, 1, 1, 50);
        }
        let mut all: BTreeMap<String, String> = overrides
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        all.entry("cache.root".into())
            .or_insert_with(|| dir.join("cache").display().to_string());
        Job::prepare(dir, workflow, vec![media], all).unwrap()
    }

    fn context(job: &Job) -> JobContext {
        let config = ResolvedConfig::new(
            ConfigLayer::from_pairs(ConfigTier::JobOverrides, job.overrides.clone()),
            ConfigLayer::empty(ConfigTier::JobEnvFile),
            ConfigLayer::empty(ConfigTier::SystemDefaults),
            ConfigLayer::fallback(),
        );
        JobContext::from_config(config, &job.work_dir).unwrap()
    }

    fn orchestrator(
        job: &Job,
        executor: FakeExecutor,
        predictor: FixedPredictor,
    ) -> StageOrchestrator<FakeExecutor, FixedPredictor> {
        StageOrchestrator::new(context(job), executor, predictor).unwrap()
    }

    fn store(job: &Job) -> ManifestStore {
        ManifestStore::new(&job.work_dir)
    }

    #[tokio::test]
    async fn fresh_job_runs_every_stage_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path(), &[]);
        let orch = orchestrator(&job, FakeExecutor::default(), FixedPredictor(Ok(0.9)));

        let result = orch.run(&mut job, &RunOptions::default()).await.unwrap();
        assert_eq!(result.status, JobStatus::Succeeded);
        assert_eq!(result.dispatch_count(), 3);
        let order: Vec<StageKind> = orch.executor().calls().iter().map(|r| r.stage).collect();
        assert_eq!(order, job.stages);

        let store = store(&job);
        let extract = store.get(StageKind::ExtractAudio).unwrap().unwrap();
        let voice = store.get(StageKind::DetectVoice).unwrap().unwrap();
        assert_eq!(extract.status, StageStatus::Success);
        assert_eq!(voice.status, StageStatus::Success);
        // Outputs chain into the next stage's inputs.
        assert_eq!(voice.inputs[0].sha256, extract.outputs[0].sha256);
        assert_eq!(job.results.len(), 3);
    }

    #[tokio::test]
    async fn unchanged_rerun_skips_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path(), &[]);
        let first = orchestrator(&job, FakeExecutor::default(), FixedPredictor(Ok(0.9)));
        first.run(&mut job, &RunOptions::default()).await.unwrap();

        let second = orchestrator(&job, FakeExecutor::default(), FixedPredictor(Ok(0.9)));
        let result = second.run(&mut job, &RunOptions::default()).await.unwrap();
        assert_eq!(result.status, JobStatus::Succeeded);
        assert_eq!(result.dispatch_count(), 0);
        assert!(second.executor().calls().is_empty());
        assert!(result.stages.iter().all(|r| r.status == StageStatus::Skipped));

        let latest = store(&job).get(StageKind::Transcribe).unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.status, StageStatus::Skipped);
        assert_eq!(latest.resumed_from, Some(1));
    }

    #[tokio::test]
    async fn changed_upstream_output_reruns_downstream() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path(), &[]);
        orchestrator(&job, FakeExecutor::default(), FixedPredictor(Ok(0.9)))
            .run(&mut job, &RunOptions::default())
            .await
            .unwrap();

        // Tamper with detect_voice's output: its manifest is no longer reusable.
        std::fs::write(job.stage_dir(StageKind::DetectVoice).join("detect_voice.txt"), "edited").unwrap();

        let orch = orchestrator(&job, FakeExecutor::default(), FixedPredictor(Ok(0.9)));
        let result = orch.run(&mut job, &RunOptions::default()).await.unwrap();
        assert_eq!(result.report(StageKind::ExtractAudio).unwrap().status, StageStatus::Skipped);
        assert_eq!(result.report(StageKind::DetectVoice).unwrap().status, StageStatus::Success);
        assert_eq!(result.report(StageKind::Transcribe).unwrap().status, StageStatus::Success);
        assert_eq!(orch.executor().calls().len(), 2);
    }

    #[tokio::test]
    async fn failing_stage_halts_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path(), &[]);
        let executor = FakeExecutor {
            fail: Some(StageKind::DetectVoice),
            ..Default::default()
        };
        let orch = orchestrator(&job, executor, FixedPredictor(Ok(0.9)));
        let result = orch.run(&mut job, &RunOptions::default()).await.unwrap();

        assert_eq!(result.status, JobStatus::Failed);
        let failure = result.failure.as_ref().unwrap();
        assert_eq!(failure.stage, StageKind::DetectVoice);
        assert_eq!(failure.kind, ErrorKind::StageNonZeroExit);
        assert_eq!(failure.log_path, job.stage_log(StageKind::DetectVoice));
        assert!(result.report(StageKind::Transcribe).is_none());

        let manifest = store(&job).get(StageKind::DetectVoice).unwrap().unwrap();
        assert_eq!(manifest.status, StageStatus::Failed);
        assert!(!manifest.error.unwrap().message.is_empty());
        assert!(store(&job).get(StageKind::Transcribe).unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_input_fails_stage_with_input_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path(), &[]);
        std::fs::remove_file(dir.path().join("input.wav")).unwrap();
        let orch = orchestrator(&job, FakeExecutor::default(), FixedPredictor(Ok(0.9)));
        let result = orch.run(&mut job, &RunOptions::default()).await.unwrap();

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.failure.unwrap().kind, ErrorKind::InputNotFound);
        assert!(orch.executor().calls().is_empty());
    }

    #[tokio::test]
    async fn low_confidence_prediction_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path(), &[]);
        let orch = orchestrator(&job, FakeExecutor::default(), FixedPredictor(Ok(0.55)));
        orch.run(&mut job, &RunOptions::default()).await.unwrap();

        let calls = orch.executor().calls();
        let transcribe = calls.iter().find(|r| r.stage == StageKind::Transcribe).unwrap();
        assert_eq!(transcribe.params, orch.settings().default_params);

        let manifest = store(&job).get(StageKind::Transcribe).unwrap().unwrap();
        let record = manifest.prediction.unwrap();
        assert!(!record.prediction_applied);
        assert!((record.predicted.confidence - 0.55).abs() < 1e-9);
        assert_eq!(record.predicted.params.model_size, "large");
        assert_eq!(record.applied, orch.settings().default_params);
    }

    #[tokio::test]
    async fn confident_prediction_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path(), &[]);
        let orch = orchestrator(&job, FakeExecutor::default(), FixedPredictor(Ok(0.9)));
        orch.run(&mut job, &RunOptions::default()).await.unwrap();

        let calls = orch.executor().calls();
        let transcribe = calls.iter().find(|r| r.stage == StageKind::Transcribe).unwrap();
        assert_eq!(transcribe.params.model_size, "large");
        // Non-adaptive stages never consult the predictor.
        let extract = store(&job).get(StageKind::ExtractAudio).unwrap().unwrap();
        assert!(extract.prediction.is_none());
    }

    #[tokio::test]
    async fn predictor_failure_never_fails_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path(), &[]);
        let orch = orchestrator(
            &job,
            FakeExecutor::default(),
            FixedPredictor(Err(PipelineError::PredictorFailure("boom".into()))),
        );
        let result = orch.run(&mut job, &RunOptions::default()).await.unwrap();
        assert_eq!(result.status, JobStatus::Succeeded);

        let manifest = store(&job).get(StageKind::Transcribe).unwrap().unwrap();
        let record = manifest.prediction.unwrap();
        assert!(!record.prediction_applied);
        assert_eq!(record.predicted.confidence, 0.0);
        assert_eq!(record.predicted.reasoning, "predictor failure: model file missing");
    }

    #[tokio::test]
    async fn text_stages_are_predicted_from_the_extracted_audio() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = workflow_job(dir.path(), "translate", &[]);
        let orch = orchestrator(&job, FakeExecutor::default(), FixedPredictor(Ok(0.9)));
        let result = orch.run(&mut job, &RunOptions::default()).await.unwrap();
        assert_eq!(result.status, JobStatus::Succeeded, "{:?}", result.failure);
        assert_eq!(result.dispatch_count(), 5);

        let calls = orch.executor().calls();
        let translate = calls.iter().find(|r| r.stage == StageKind::Translate).unwrap();
        // Translate only sees transcript text, yet the prediction still applies.
        assert!(translate.inputs.iter().all(|p| !is_wav(p)));
        assert_eq!(translate.params.model_size, "large");
        let record = store(&job).get(StageKind::Translate).unwrap().unwrap().prediction.unwrap();
        assert!(record.prediction_applied);

        let subtitles = store(&job).get(StageKind::GenerateSubtitles).unwrap().unwrap();
        assert!(subtitles.prediction.is_none());
        let upstream: Vec<&str> = subtitles.inputs.iter().map(|d| d.sha256.as_str()).collect();
        let transcript = store(&job).get(StageKind::Transcribe).unwrap().unwrap();
        let translation = store(&job).get(StageKind::Translate).unwrap().unwrap();
        assert!(upstream.contains(&transcript.outputs[0].sha256.as_str()));
        assert!(upstream.contains(&translation.outputs[0].sha256.as_str()));
    }

    #[tokio::test]
    async fn unreadable_output_fails_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path(), &[]);
        let executor = FakeExecutor {
            phantom_output: Some(StageKind::DetectVoice),
            ..Default::default()
        };
        let orch = orchestrator(&job, executor, FixedPredictor(Ok(0.9)));
        let result = orch.run(&mut job, &RunOptions::default()).await.unwrap();

        assert_eq!(result.status, JobStatus::Failed);
        let failure = result.failure.unwrap();
        assert_eq!(failure.stage, StageKind::DetectVoice);
        assert_eq!(failure.kind, ErrorKind::InputNotFound);
        let manifest = store(&job).get(StageKind::DetectVoice).unwrap().unwrap();
        assert_eq!(manifest.status, StageStatus::Failed);
        assert!(manifest.error.unwrap().message.contains("never-written.txt"));
        assert_eq!(job.results.len(), 2);
    }

    #[tokio::test]
    async fn models_come_from_curated_dataset_while_remote_is_rate_limited() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .expect(0)
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let curated = dir.path().join("curated");
        std::fs::create_dir_all(curated.join("model")).unwrap();
        std::fs::write(curated.join("model/asr-small.bin"), b"weights").unwrap();

        let uri = server.uri();
        let curated_root = curated.display().to_string();
        let mut job = job(
            dir.path(),
            &[
                ("remote.base_url", uri.as_str()),
                ("cache.curated_root", curated_root.as_str()),
                ("stages.transcribe.models", "asr-small.bin"),
            ],
        );
        let orch = orchestrator(&job, FakeExecutor::default(), FixedPredictor(Ok(0.9)));
        let result = orch.run(&mut job, &RunOptions::default()).await.unwrap();
        assert_eq!(result.status, JobStatus::Succeeded, "{:?}", result.failure);

        let calls = orch.executor().calls();
        let transcribe = calls.iter().find(|r| r.stage == StageKind::Transcribe).unwrap();
        assert_eq!(
            transcribe.extra_env["MEDIAFLOW_MODEL_FILES"],
            curated.join("model/asr-small.bin").display().to_string()
        );
    }

    #[tokio::test]
    async fn rate_limited_remote_without_fallback_fails_after_retries() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .expect(2)
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let uri = server.uri();
        let mut job = job(
            dir.path(),
            &[
                ("remote.base_url", uri.as_str()),
                ("remote.min_interval_ms", "0"),
                ("remote.max_retries", "1"),
                ("stages.transcribe.models", "asr-small.bin"),
            ],
        );
        let orch = orchestrator(&job, FakeExecutor::default(), FixedPredictor(Ok(0.9)));
        let result = orch.run(&mut job, &RunOptions::default()).await.unwrap();

        assert_eq!(result.status, JobStatus::Failed);
        let failure = result.failure.unwrap();
        assert_eq!(failure.stage, StageKind::Transcribe);
        assert_eq!(failure.kind, ErrorKind::EnvironmentUnavailable);
        assert!(failure.message.contains("rate limited"));
    }

    #[tokio::test]
    async fn cancellation_stops_between_stages() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path(), &[]);
        let token = CancellationToken::new();
        let executor = FakeExecutor {
            cancel_after: Some((StageKind::ExtractAudio, token.clone())),
            ..Default::default()
        };
        let orch = orchestrator(&job, executor, FixedPredictor(Ok(0.9))).with_cancellation(token);
        let result = orch.run(&mut job, &RunOptions::default()).await.unwrap();

        assert_eq!(result.status, JobStatus::Interrupted);
        assert_eq!(result.stages.len(), 1);
        assert_eq!(orch.executor().calls().len(), 1);
    }

    #[tokio::test]
    async fn force_from_reruns_named_stage_and_versions_old_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path(), &[]);
        orchestrator(&job, FakeExecutor::default(), FixedPredictor(Ok(0.9)))
            .run(&mut job, &RunOptions::default())
            .await
            .unwrap();

        let orch = orchestrator(&job, FakeExecutor::default(), FixedPredictor(Ok(0.9)));
        let options = RunOptions {
            force: ForceRerun::From(StageKind::DetectVoice),
        };
        let result = orch.run(&mut job, &options).await.unwrap();
        assert_eq!(result.report(StageKind::ExtractAudio).unwrap().status, StageStatus::Skipped);
        assert_eq!(result.dispatch_count(), 2);
        assert!(job.stages_root().join("detect_voice.v0001/detect_voice.txt").exists());
        assert!(job.stage_dir(StageKind::DetectVoice).join("detect_voice.txt").exists());
        let history = store(&job).history(StageKind::DetectVoice).unwrap();
        assert_eq!(history.len(), 2);

        // The re-run records where the old outputs went, and the first
        // version's outputs resolve there.
        let archive = history[1].archived_outputs.clone().unwrap();
        assert_eq!(archive.superseded_version, 1);
        assert_eq!(archive.dir, PathBuf::from("stages/detect_voice.v0001"));
        let first = &history[0];
        let located = store(&job).locate_output(first, &first.outputs[0]).unwrap();
        assert_eq!(located, job.stages_root().join("detect_voice.v0001/detect_voice.txt"));
        assert_eq!(crate::fsio::sha256_file(&located).unwrap(), first.outputs[0].sha256);
    }

    #[tokio::test]
    async fn replace_policy_discards_old_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path(), &[("rerun.output_policy", "replace")]);
        orchestrator(&job, FakeExecutor::default(), FixedPredictor(Ok(0.9)))
            .run(&mut job, &RunOptions::default())
            .await
            .unwrap();
        let orch = orchestrator(&job, FakeExecutor::default(), FixedPredictor(Ok(0.9)));
        let options = RunOptions {
            force: ForceRerun::All,
        };
        orch.run(&mut job, &options).await.unwrap();
        assert_eq!(orch.executor().calls().len(), 3);
        assert!(!job.stages_root().join("extract_audio.v0001").exists());
    }

    #[test]
    fn force_rerun_scope() {
        let stages = [StageKind::ExtractAudio, StageKind::DetectVoice, StageKind::Transcribe];
        let from = ForceRerun::From(StageKind::DetectVoice);
        assert!(!from.covers(StageKind::ExtractAudio, &stages));
        assert!(from.covers(StageKind::DetectVoice, &stages));
        assert!(from.covers(StageKind::Transcribe, &stages));
        assert!(ForceRerun::All.covers(StageKind::ExtractAudio, &stages));
        assert!(!ForceRerun::None.covers(StageKind::Transcribe, &stages));
    }
}
