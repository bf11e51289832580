mod job;
mod stage;

pub use job::{
    Job, JobResult, JobStatus, StageFailure, StageReport, JOB_DESCRIPTOR, validate_stage_order,
    workflow_stages,
};
pub use stage::{StageEvent, StageKind, StageState, StageStateMachine, StageStatus};
