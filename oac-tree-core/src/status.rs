use serde::{Deserialize, Serialize};

// ─── Instruction execution status ─────────────────────────────

/// Status of a single instruction node.
///
/// `Running` means the node is actively doing work this tick; `NotFinished`
/// means the tree is waiting but the scheduler may tick again immediately.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    #[default]
    NotStarted,
    NotFinished,
    Running,
    Success,
    Failure,
}

impl ExecutionStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::Failure)
    }

    pub fn needs_execute(&self) -> bool {
        !self.is_finished()
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ExecutionStatus::NotStarted => "Not started",
            ExecutionStatus::NotFinished => "Not finished",
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Success => "Success",
            ExecutionStatus::Failure => "Failure",
        };
        f.write_str(label)
    }
}

/// Wire unit of per-instruction status publication: execution status plus
/// whether a breakpoint is currently set on the instruction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionState {
    pub breakpoint_set: bool,
    pub status: ExecutionStatus,
}

// ─── Job state ────────────────────────────────────────────────

/// State of a running job as seen by external clients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    #[default]
    Initial,
    Paused,
    Stepping,
    Running,
    Succeeded,
    Failed,
    Halted,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Halted
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            JobState::Initial => "Initial",
            JobState::Paused => "Paused",
            JobState::Stepping => "Stepping",
            JobState::Running => "Running",
            JobState::Succeeded => "Success",
            JobState::Failed => "Failure",
            JobState::Halted => "Halted",
        };
        f.write_str(label)
    }
}

// ─── Job commands ─────────────────────────────────────────────

/// Control commands consumed by the job controller's worker.
///
/// Commands are totally ordered; a command with higher rank may pre-empt a
/// lower-ranked one already queued (see `JobCommandQueue::priority_push`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobCommand {
    Start,
    Step,
    Pause,
    Reset,
    Halt,
    Terminate,
}
