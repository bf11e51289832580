//! Process supervisor for stage programs.
//!
//! Each dispatch runs exactly one stage program inside the environment its
//! registry binding names. Output is streamed line by line to the stage log
//! and the job log as it arrives, so a killed stage still leaves its partial
//! output behind.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Deserialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::fsio;
use crate::manifest::{IntermediateDescriptor, Retention};
use crate::predictor::StageParams;
use crate::registry::{EnvironmentRegistry, resolve_program};
use crate::state_machine::StageKind;

/// Prefix a stage program prints on stdout to declare an intermediate file.
pub const INTERMEDIATE_DIRECTIVE: &str = "@@intermediate ";

/// How long readers may keep draining pipes after the child is gone.
const READER_GRACE: Duration = Duration::from_millis(250);

/// Everything one stage invocation needs.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub stage: StageKind,
    pub run_id: String,
    pub work_dir: PathBuf,
    /// Exclusive to this stage.
    pub output_dir: PathBuf,
    pub inputs: Vec<PathBuf>,
    pub params: StageParams,
    pub timeout: Duration,
    pub stage_log: PathBuf,
    pub job_log: PathBuf,
    /// Extra bindings added by the caller, e.g. resolved model files.
    pub extra_env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Exited,
    /// Terminated by a signal not sent by us.
    Signaled,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub environment: String,
    pub command: Vec<String>,
    pub exit_code: Option<i32>,
    pub reason: ExitReason,
    /// Files under the output dir, sorted, intermediates excluded.
    pub outputs: Vec<PathBuf>,
    pub intermediates: Vec<IntermediateDescriptor>,
    pub verification_only: bool,
    pub elapsed: Duration,
}

impl ExecutionResult {
    /// The stage failure this result represents, if any.
    pub fn failure(&self, stage: StageKind, timeout: Duration) -> Option<PipelineError> {
        match (self.reason, self.exit_code) {
            (ExitReason::Timeout, _) => Some(PipelineError::StageTimeout {
                stage: stage.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            (_, Some(0)) if self.outputs.is_empty() && !self.verification_only => {
                Some(PipelineError::MissingOutputs {
                    stage: stage.to_string(),
                })
            }
            (_, Some(0)) => None,
            (_, Some(code)) => Some(PipelineError::StageNonZeroExit {
                stage: stage.to_string(),
                code,
            }),
            (_, None) => Some(PipelineError::StageNonZeroExit {
                stage: stage.to_string(),
                code: -1,
            }),
        }
    }
}

/// Seam between the orchestrator and process execution.
#[allow(async_fn_in_trait)]
pub trait StageExecutor {
    async fn execute(&self, request: &DispatchRequest) -> PipelineResult<ExecutionResult>;
}

pub struct EnvironmentDispatcher {
    registry: Arc<EnvironmentRegistry>,
    model_cache: PathBuf,
    intermediate_cache: PathBuf,
}

impl EnvironmentDispatcher {
    pub fn new(
        registry: Arc<EnvironmentRegistry>,
        model_cache: impl Into<PathBuf>,
        intermediate_cache: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            model_cache: model_cache.into(),
            intermediate_cache: intermediate_cache.into(),
        }
    }

    pub fn registry(&self) -> &EnvironmentRegistry {
        &self.registry
    }

    /// Resolves the invocation for `request` without running it.
    pub fn build_command(&self, request: &DispatchRequest) -> PipelineResult<(Command, Vec<String>)> {
        let stage = request.stage;
        let binding = self.registry.binding(stage)?;
        let env = self.registry.environment_for(stage)?;
        let unavailable = |reason: String| PipelineError::EnvironmentUnavailable {
            stage: stage.to_string(),
            reason,
        };
        env.check_activation().map_err(unavailable)?;

        let args = binding.render_args(
            &request.output_dir,
            &request.work_dir,
            &request.inputs,
            &request.params,
        );
        let program = PathBuf::from(&binding.program);
        let mut argv: Vec<String> = Vec::with_capacity(args.len() + 2);
        match &env.interpreter {
            Some(interpreter) => {
                let interpreter = resolve_program(interpreter, env.bin_dir.as_deref())
                    .ok_or_else(|| unavailable(format!("interpreter {} not found", interpreter.display())))?;
                argv.push(interpreter.display().to_string());
                argv.push(binding.program.clone());
            }
            None => {
                let resolved = resolve_program(&program, env.bin_dir.as_deref())
                    .ok_or_else(|| unavailable(format!("program `{}` not found", binding.program)))?;
                argv.push(resolved.display().to_string());
            }
        }
        argv.extend(args);

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(&request.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(bin_dir) = &env.bin_dir {
            cmd.env("PATH", prepend_path(bin_dir));
        }
        for (key, value) in &env.vars {
            cmd.env(key, value);
        }
        let inputs = request
            .inputs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join("\n");
        let params = serde_json::to_string(&request.params.to_map())?;
        cmd.env("MEDIAFLOW_STAGE", stage.name())
            .env("MEDIAFLOW_RUN_ID", &request.run_id)
            .env("MEDIAFLOW_ENVIRONMENT", &env.name)
            .env("MEDIAFLOW_WORK_DIR", &request.work_dir)
            .env("MEDIAFLOW_OUTPUT_DIR", &request.output_dir)
            .env("MEDIAFLOW_INPUTS", inputs)
            .env("MEDIAFLOW_PARAMS", params)
            .env("MEDIAFLOW_MODEL_CACHE", &self.model_cache)
            .env("MEDIAFLOW_INTERMEDIATE_CACHE", &self.intermediate_cache)
            .env("HF_HOME", self.model_cache.join("huggingface"))
            .env("TORCH_HOME", self.model_cache.join("torch"))
            .env("XDG_CACHE_HOME", &self.model_cache);
        for (key, value) in &request.extra_env {
            cmd.env(key, value);
        }

        Ok((cmd, argv))
    }
}

fn prepend_path(bin_dir: &Path) -> OsString {
    let mut dirs = vec![bin_dir.to_path_buf()];
    if let Some(existing) = std::env::var_os("PATH") {
        dirs.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(dirs).unwrap_or_else(|_| bin_dir.as_os_str().to_owned())
}

#[derive(Debug, Deserialize)]
struct IntermediateDirective {
    path: PathBuf,
    #[serde(default)]
    retained: bool,
    #[serde(default)]
    reason: String,
}

/// Stage log and job log, written line by line.
struct LogSinks {
    stage: File,
    job: File,
    prefix: String,
}

impl LogSinks {
    async fn open(request: &DispatchRequest) -> PipelineResult<Self> {
        Ok(Self {
            stage: append(&request.stage_log).await?,
            job: append(&request.job_log).await?,
            prefix: format!("[{}] ", request.stage),
        })
    }

    async fn line(&mut self, line: &str) {
        let stage_line = format!("{line}\n");
        let job_line = format!("{}{line}\n", self.prefix);
        // A failing log write must not take the stage down with it.
        if let Err(err) = self.stage.write_all(stage_line.as_bytes()).await {
            warn!(error = %err, "stage log write failed");
        }
        if let Err(err) = self.job.write_all(job_line.as_bytes()).await {
            warn!(error = %err, "job log write failed");
        }
    }

    async fn flush(&mut self) {
        if let Err(err) = self.stage.flush().await {
            warn!(error = %err, "stage log flush failed");
        }
        if let Err(err) = self.job.flush().await {
            warn!(error = %err, "job log flush failed");
        }
    }
}

async fn append(path: &Path) -> PipelineResult<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path).await?)
}

fn spawn_reader<R>(
    pipe: R,
    sinks: Arc<Mutex<LogSinks>>,
    directives: Option<Arc<Mutex<Vec<IntermediateDirective>>>>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    if let Some(directives) = &directives {
                        if let Some(raw) = line.strip_prefix(INTERMEDIATE_DIRECTIVE) {
                            match serde_json::from_str::<IntermediateDirective>(raw) {
                                Ok(directive) => directives.lock().await.push(directive),
                                Err(err) => warn!(error = %err, "malformed intermediate directive"),
                            }
                        }
                    }
                    let mut sinks = sinks.lock().await;
                    sinks.line(line).await;
                    sinks.flush().await;
                }
                Err(err) => {
                    debug!(error = %err, "pipe read ended");
                    break;
                }
            }
        }
    })
}

impl StageExecutor for EnvironmentDispatcher {
    async fn execute(&self, request: &DispatchRequest) -> PipelineResult<ExecutionResult> {
        let stage = request.stage;
        let binding = self.registry.binding(stage)?;
        let (mut cmd, argv) = self.build_command(request)?;
        fs::create_dir_all(&request.output_dir).await?;
        fs::create_dir_all(&self.model_cache).await?;
        fs::create_dir_all(&self.intermediate_cache).await?;

        let sinks = Arc::new(Mutex::new(LogSinks::open(request).await?));
        {
            let mut sinks = sinks.lock().await;
            sinks
                .line(&format!(
                    "# {} {} run {} env {}: {}",
                    Utc::now().to_rfc3339(),
                    stage,
                    request.run_id,
                    binding.environment,
                    argv.join(" ")
                ))
                .await;
            sinks.flush().await;
        }

        info!(stage = %stage, env = %binding.environment, "dispatching stage");
        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| PipelineError::EnvironmentUnavailable {
            stage: stage.to_string(),
            reason: format!("failed to spawn {}: {e}", argv[0]),
        })?;

        let directives = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, sinks.clone(), Some(directives.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, sinks.clone(), None));
        }

        let (exit_code, reason) = match tokio::time::timeout(request.timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                match status.code() {
                    Some(code) => (Some(code), ExitReason::Exited),
                    None => (None, ExitReason::Signaled),
                }
            }
            Err(_) => {
                warn!(stage = %stage, timeout_ms = request.timeout.as_millis() as u64, "stage timed out, killing");
                if let Err(err) = child.kill().await {
                    warn!(stage = %stage, error = %err, "kill failed");
                }
                (None, ExitReason::Timeout)
            }
        };

        // Grandchildren may still hold the pipes open.
        let deadline = tokio::time::Instant::now() + READER_GRACE;
        for mut reader in readers {
            if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
                reader.abort();
            }
        }
        let elapsed = started.elapsed();

        {
            let mut sinks = sinks.lock().await;
            let summary = match reason {
                ExitReason::Timeout => format!(
                    "# killed after {}ms timeout",
                    request.timeout.as_millis()
                ),
                ExitReason::Signaled => "# terminated by signal".to_string(),
                ExitReason::Exited => format!(
                    "# exited with {} after {}ms",
                    exit_code.unwrap_or_default(),
                    elapsed.as_millis()
                ),
            };
            sinks.line(&summary).await;
            sinks.flush().await;
        }

        let intermediates: Vec<IntermediateDescriptor> = directives
            .lock()
            .await
            .drain(..)
            .map(|d| IntermediateDescriptor {
                path: if d.path.is_absolute() {
                    d.path
                } else {
                    request.output_dir.join(d.path)
                },
                retention: if d.retained {
                    Retention::Retained
                } else {
                    Retention::Transient
                },
                reason: d.reason,
            })
            .collect();

        let outputs = if reason == ExitReason::Exited && exit_code == Some(0) {
            fsio::list_files(&request.output_dir)?
                .into_iter()
                .filter(|p| !intermediates.iter().any(|i| &i.path == p))
                .collect()
        } else {
            Vec::new()
        };

        debug!(stage = %stage, ?exit_code, ?reason, outputs = outputs.len(), "dispatch finished");
        Ok(ExecutionResult {
            environment: binding.environment.clone(),
            command: argv,
            exit_code,
            reason,
            outputs,
            intermediates,
            verification_only: binding.verification_only,
            elapsed,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::registry::{EnvironmentSpec, StageBinding};

    /// Binds every stage to `/bin/sh <dir>/<stage>.sh`; stages without a
    /// script get one that writes a single output file.
    pub(crate) fn shell_registry(
        dir: &Path,
        scripts: &[(StageKind, &str)],
        envs: Vec<EnvironmentSpec>,
        env_of: impl Fn(StageKind) -> String,
    ) -> EnvironmentRegistry {
        let bindings: Vec<StageBinding> = StageKind::ALL
            .into_iter()
            .map(|kind| {
                let body = scripts
                    .iter()
                    .find(|(k, _)| *k == kind)
                    .map(|(_, b)| b.to_string())
                    .unwrap_or_else(|| {
                        "echo \"$MEDIAFLOW_STAGE\" > \"$MEDIAFLOW_OUTPUT_DIR/out.txt\"".into()
                    });
                let script = dir.join(format!("{}.sh", kind.name()));
                std::fs::write(&script, body).unwrap();
                StageBinding::new(kind, env_of(kind), script.display().to_string())
            })
            .collect();
        EnvironmentRegistry::new(envs, bindings).unwrap()
    }

    fn sh_env(name: &str) -> EnvironmentSpec {
        EnvironmentSpec::new(name).with_interpreter("/bin/sh")
    }

    fn request(dir: &Path, stage: StageKind, timeout: Duration) -> DispatchRequest {
        DispatchRequest {
            stage,
            run_id: "run-1".into(),
            work_dir: dir.to_path_buf(),
            output_dir: dir.join("stages").join(stage.name()),
            inputs: vec![dir.join("input.wav")],
            params: StageParams {
                model_size: "small".into(),
                batch_size: 24,
                beam_size: 3,
            },
            timeout,
            stage_log: dir.join("logs").join(format!("{}.log", stage.name())),
            job_log: dir.join("logs/job.log"),
            extra_env: BTreeMap::new(),
        }
    }

    fn dispatcher(dir: &Path, registry: EnvironmentRegistry) -> EnvironmentDispatcher {
        EnvironmentDispatcher::new(
            Arc::new(registry),
            dir.join("cache/model"),
            dir.join("cache/inference_result"),
        )
    }

    #[tokio::test]
    async fn successful_stage_reports_outputs_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let registry = shell_registry(
            dir.path(),
            &[(
                StageKind::ExtractAudio,
                "echo extracting; echo pcm > \"$MEDIAFLOW_OUTPUT_DIR/audio.wav\"",
            )],
            vec![sh_env("media")],
            |_| "media".into(),
        );
        let req = request(dir.path(), StageKind::ExtractAudio, Duration::from_secs(10));
        let result = dispatcher(dir.path(), registry).execute(&req).await.unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.reason, ExitReason::Exited);
        assert_eq!(result.outputs, vec![req.output_dir.join("audio.wav")]);
        assert!(result.failure(StageKind::ExtractAudio, req.timeout).is_none());
        assert_eq!(result.environment, "media");

        let stage_log = std::fs::read_to_string(&req.stage_log).unwrap();
        assert!(stage_log.contains("extracting"));
        let job_log = std::fs::read_to_string(&req.job_log).unwrap();
        assert!(job_log.contains("[extract_audio] extracting"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn unwritable_stage_log_does_not_fail_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let registry = shell_registry(
            dir.path(),
            &[(
                StageKind::ExtractAudio,
                "echo extracting; echo pcm > \"$MEDIAFLOW_OUTPUT_DIR/audio.wav\"",
            )],
            vec![sh_env("media")],
            |_| "media".into(),
        );
        let mut req = request(dir.path(), StageKind::ExtractAudio, Duration::from_secs(10));
        req.stage_log = PathBuf::from("/dev/full");
        let result = dispatcher(dir.path(), registry).execute(&req).await.unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert!(result.failure(StageKind::ExtractAudio, req.timeout).is_none());
        let job_log = std::fs::read_to_string(&req.job_log).unwrap();
        assert!(job_log.contains("[extract_audio] extracting"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_with_stderr_logged() {
        let dir = tempfile::tempdir().unwrap();
        let registry = shell_registry(
            dir.path(),
            &[(StageKind::Transcribe, "echo 'model exploded' >&2; exit 3")],
            vec![sh_env("asr")],
            |_| "asr".into(),
        );
        let req = request(dir.path(), StageKind::Transcribe, Duration::from_secs(10));
        let result = dispatcher(dir.path(), registry).execute(&req).await.unwrap();

        assert_eq!(result.exit_code, Some(3));
        assert!(result.outputs.is_empty());
        assert!(matches!(
            result.failure(StageKind::Transcribe, req.timeout),
            Some(PipelineError::StageNonZeroExit { code: 3, .. })
        ));
        let job_log = std::fs::read_to_string(&req.job_log).unwrap();
        assert!(job_log.contains("[transcribe] model exploded"));
    }

    #[tokio::test]
    async fn timeout_kills_child_and_keeps_partial_log() {
        let dir = tempfile::tempdir().unwrap();
        let registry = shell_registry(
            dir.path(),
            &[(StageKind::Transcribe, "echo 'segment 1 done'; exec sleep 30")],
            vec![sh_env("asr")],
            |_| "asr".into(),
        );
        let req = request(dir.path(), StageKind::Transcribe, Duration::from_millis(500));
        let started = Instant::now();
        let result = dispatcher(dir.path(), registry).execute(&req).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.reason, ExitReason::Timeout);
        assert!(matches!(
            result.failure(StageKind::Transcribe, req.timeout),
            Some(PipelineError::StageTimeout { timeout_ms: 500, .. })
        ));
        let stage_log = std::fs::read_to_string(&req.stage_log).unwrap();
        assert!(stage_log.contains("segment 1 done"));
        assert!(stage_log.contains("killed after 500ms timeout"));
    }

    #[tokio::test]
    async fn intermediates_are_declared_and_excluded_from_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"echo '@@intermediate {"path": "frames.bin", "retained": false, "reason": "vad frames"}'
echo x > "$MEDIAFLOW_OUTPUT_DIR/frames.bin"
echo y > "$MEDIAFLOW_OUTPUT_DIR/segments.json""#;
        let registry = shell_registry(
            dir.path(),
            &[(StageKind::DetectVoice, script)],
            vec![sh_env("vad")],
            |_| "vad".into(),
        );
        let req = request(dir.path(), StageKind::DetectVoice, Duration::from_secs(10));
        let result = dispatcher(dir.path(), registry).execute(&req).await.unwrap();

        assert_eq!(result.outputs, vec![req.output_dir.join("segments.json")]);
        assert_eq!(result.intermediates.len(), 1);
        assert_eq!(result.intermediates[0].path, req.output_dir.join("frames.bin"));
        assert_eq!(result.intermediates[0].retention, Retention::Transient);
        assert_eq!(result.intermediates[0].reason, "vad frames");
    }

    #[tokio::test]
    async fn cache_dirs_and_params_are_bound() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"printf '%s|%s|%s' "$MEDIAFLOW_STAGE" "$MEDIAFLOW_PARAMS" "$MEDIAFLOW_MODEL_CACHE" > "$MEDIAFLOW_OUTPUT_DIR/env.txt""#;
        let registry = shell_registry(
            dir.path(),
            &[(StageKind::Transcribe, script)],
            vec![sh_env("asr")],
            |_| "asr".into(),
        );
        let req = request(dir.path(), StageKind::Transcribe, Duration::from_secs(10));
        dispatcher(dir.path(), registry).execute(&req).await.unwrap();

        let seen = std::fs::read_to_string(req.output_dir.join("env.txt")).unwrap();
        let parts: Vec<&str> = seen.split('|').collect();
        assert_eq!(parts[0], "transcribe");
        let params: BTreeMap<String, String> = serde_json::from_str(parts[1]).unwrap();
        assert_eq!(params["model_size"], "small");
        assert_eq!(params["beam_size"], "3");
        assert_eq!(parts[2], dir.path().join("cache/model").display().to_string());
    }

    #[tokio::test]
    async fn stage_only_sees_its_own_environment() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"printf '%s %s' "${ASR_ONLY:-unset}" "${TR_ONLY:-unset}" > "$MEDIAFLOW_OUTPUT_DIR/env.txt""#;
        let registry = shell_registry(
            dir.path(),
            &[(StageKind::Translate, script), (StageKind::Transcribe, script)],
            vec![
                sh_env("asr").with_var("ASR_ONLY", "torch-2"),
                sh_env("translate").with_var("TR_ONLY", "torch-1"),
            ],
            |kind| {
                if kind == StageKind::Translate {
                    "translate".into()
                } else {
                    "asr".into()
                }
            },
        );
        let dispatcher = dispatcher(dir.path(), registry);

        let tr = request(dir.path(), StageKind::Translate, Duration::from_secs(10));
        let result = dispatcher.execute(&tr).await.unwrap();
        assert_eq!(result.environment, "translate");
        let seen = std::fs::read_to_string(tr.output_dir.join("env.txt")).unwrap();
        assert_eq!(seen, "unset torch-1");

        let asr = request(dir.path(), StageKind::Transcribe, Duration::from_secs(10));
        dispatcher.execute(&asr).await.unwrap();
        let seen = std::fs::read_to_string(asr.output_dir.join("env.txt")).unwrap();
        assert_eq!(seen, "torch-2 unset");
    }

    #[tokio::test]
    async fn missing_program_is_environment_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let bindings: Vec<StageBinding> = StageKind::ALL
            .into_iter()
            .map(|k| StageBinding::new(k, "bare", "mediaflow-definitely-not-installed"))
            .collect();
        let registry = EnvironmentRegistry::new([EnvironmentSpec::new("bare")], bindings).unwrap();
        let req = request(dir.path(), StageKind::ExtractAudio, Duration::from_secs(1));
        let err = dispatcher(dir.path(), registry).execute(&req).await.unwrap_err();
        assert!(matches!(err, PipelineError::EnvironmentUnavailable { .. }));
    }

    #[tokio::test]
    async fn missing_bin_dir_fails_activation() {
        let dir = tempfile::tempdir().unwrap();
        let registry = shell_registry(
            dir.path(),
            &[],
            vec![sh_env("asr").with_bin_dir(dir.path().join("no-such-venv/bin"))],
            |_| "asr".into(),
        );
        let req = request(dir.path(), StageKind::Transcribe, Duration::from_secs(1));
        let err = dispatcher(dir.path(), registry).execute(&req).await.unwrap_err();
        assert!(err.to_string().contains("no-such-venv"));
    }

    #[test]
    fn clean_exit_without_outputs_is_missing_outputs() {
        let result = ExecutionResult {
            environment: "asr".into(),
            command: vec![],
            exit_code: Some(0),
            reason: ExitReason::Exited,
            outputs: vec![],
            intermediates: vec![],
            verification_only: false,
            elapsed: Duration::ZERO,
        };
        assert!(matches!(
            result.failure(StageKind::Transcribe, Duration::from_secs(1)),
            Some(PipelineError::MissingOutputs { .. })
        ));
        let verify = ExecutionResult {
            verification_only: true,
            ..result
        };
        assert!(verify.failure(StageKind::Transcribe, Duration::from_secs(1)).is_none());
    }
}
