use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// The closed set of stages a media job can be made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    ExtractAudio,
    DetectVoice,
    Transcribe,
    Translate,
    GenerateSubtitles,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::ExtractAudio,
        StageKind::DetectVoice,
        StageKind::Transcribe,
        StageKind::Translate,
        StageKind::GenerateSubtitles,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageKind::ExtractAudio => "extract_audio",
            StageKind::DetectVoice => "detect_voice",
            StageKind::Transcribe => "transcribe",
            StageKind::Translate => "translate",
            StageKind::GenerateSubtitles => "generate_subtitles",
        }
    }

    /// Stages whose outputs feed this one, when they are part of the job.
    pub fn upstream(self) -> &'static [StageKind] {
        match self {
            StageKind::ExtractAudio => &[],
            StageKind::DetectVoice => &[StageKind::ExtractAudio],
            StageKind::Transcribe => &[StageKind::ExtractAudio, StageKind::DetectVoice],
            StageKind::Translate => &[StageKind::Transcribe],
            StageKind::GenerateSubtitles => &[StageKind::Transcribe, StageKind::Translate],
        }
    }

    /// Whether the parameter predictor is consulted before dispatch.
    pub fn is_adaptive(self) -> bool {
        matches!(
            self,
            StageKind::DetectVoice | StageKind::Transcribe | StageKind::Translate
        )
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        StageKind::ALL
            .into_iter()
            .find(|k| k.name() == wanted)
            .ok_or_else(|| PipelineError::InvalidJob(format!("unknown stage `{s}`")))
    }
}

/// Lifecycle status of one stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageStatus::Success | StageStatus::Failed | StageStatus::Skipped
        )
    }

    /// `Success` and `Skipped` both let downstream stages proceed.
    pub fn is_terminal_success(self) -> bool {
        matches!(self, StageStatus::Success | StageStatus::Skipped)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "PENDING"),
            StageStatus::Running => write!(f, "RUNNING"),
            StageStatus::Success => write!(f, "SUCCESS"),
            StageStatus::Failed => write!(f, "FAILED"),
            StageStatus::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// Inputs to the stage state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    Start,
    Succeed,
    Fail,
    Skip,
    /// Explicit caller request to leave a terminal state; the next execution
    /// gets a new manifest version.
    ForceRerun,
}

/// Tracks one stage through `pending -> running -> {success, failed, skipped}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageState {
    pub kind: StageKind,
    pub status: StageStatus,
    pub history: Vec<StageStatus>,
}

impl StageState {
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            status: StageStatus::Pending,
            history: Vec::new(),
        }
    }

    /// Applies `event`, recording the previous status in `history`.
    pub fn apply(&mut self, event: StageEvent) -> PipelineResult<StageStatus> {
        let next = StageStateMachine::next(self.status, event).map_err(|e| match e {
            PipelineError::ManifestInvalidState(msg) => {
                PipelineError::ManifestInvalidState(format!("stage {}: {msg}", self.kind))
            }
            other => other,
        })?;
        self.history.push(self.status);
        self.status = next;
        Ok(next)
    }
}

pub struct StageStateMachine;

impl StageStateMachine {
    /// Computes the status reached from `current` on `event`.
    ///
    /// - `Pending` may start or be skipped.
    /// - `Running` ends in `Success` or `Failed`.
    /// - Terminal states only move on `ForceRerun`, back to `Pending`.
    pub fn next(current: StageStatus, event: StageEvent) -> PipelineResult<StageStatus> {
        let next = match (current, event) {
            (StageStatus::Pending, StageEvent::Start) => StageStatus::Running,
            (StageStatus::Pending, StageEvent::Skip) => StageStatus::Skipped,
            (StageStatus::Running, StageEvent::Succeed) => StageStatus::Success,
            (StageStatus::Running, StageEvent::Fail) => StageStatus::Failed,
            (status, StageEvent::ForceRerun) if status.is_terminal() => StageStatus::Pending,
            (status, event) => {
                return Err(PipelineError::ManifestInvalidState(format!(
                    "illegal transition {event:?} from {status}"
                )));
            }
        };
        Ok(next)
    }
}
