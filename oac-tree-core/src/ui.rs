use async_trait::async_trait;

use crate::input::{UserInputFuture, UserInputRequest};
use crate::log_severity::Severity;
use crate::status::{ExecutionStatus, InstructionState, JobState};
use crate::tree::NodeId;
use crate::value::AnyValue;

/// Interface the engine and its instructions talk to while ticking.
///
/// Implementations translate node ids to external indices and forward to
/// whatever front end is attached. All methods are called from the tick
/// worker; they must be short and non-blocking except for the futures
/// returned by `request_user_input`.
pub trait UserInterface: Send + Sync {
    /// An instruction's status changed.
    fn update_instruction_status(&self, node: NodeId, status: ExecutionStatus);

    /// A workspace variable changed value or connectivity.
    fn variable_updated(&self, name: &str, value: &AnyValue, connected: bool);

    /// Present a value to the user; false when the interface rejected it.
    fn put_value(&self, value: &AnyValue, description: &str) -> bool;

    /// Issue a user-input request; the default has no input support and
    /// returns an invalid future.
    fn request_user_input(&self, request: UserInputRequest) -> UserInputFuture {
        let _ = request;
        UserInputFuture::unsupported()
    }

    fn message(&self, text: &str);

    fn log(&self, severity: Severity, message: &str);
}

pub fn log_error(ui: &dyn UserInterface, message: &str) {
    ui.log(Severity::Error, message);
}

pub fn log_warning(ui: &dyn UserInterface, message: &str) {
    ui.log(Severity::Warning, message);
}

/// No-op interface for tests and headless runs.
#[derive(Default)]
pub struct DefaultUserInterface;

impl UserInterface for DefaultUserInterface {
    fn update_instruction_status(&self, _node: NodeId, _status: ExecutionStatus) {}

    fn variable_updated(&self, _name: &str, _value: &AnyValue, _connected: bool) {}

    fn put_value(&self, _value: &AnyValue, _description: &str) -> bool {
        false
    }

    fn message(&self, _text: &str) {}

    fn log(&self, _severity: Severity, _message: &str) {}
}

/// Observer of job-level progress, driven by the job controller.
pub trait JobStateMonitor: Send + Sync {
    fn on_state_change(&self, state: JobState);

    fn on_breakpoint_change(&self, node: NodeId, breakpoint_set: bool);

    /// Safe point after every tick: instruction state is quiescent until the
    /// callback returns.
    fn on_procedure_tick(&self, proc: &crate::procedure::Procedure);
}

/// No-op monitor.
#[derive(Default)]
pub struct DefaultJobStateMonitor;

impl JobStateMonitor for DefaultJobStateMonitor {
    fn on_state_change(&self, _state: JobState) {}

    fn on_breakpoint_change(&self, _node: NodeId, _breakpoint_set: bool) {}

    fn on_procedure_tick(&self, _proc: &crate::procedure::Procedure) {}
}

/// Observation surface an external front end implements to follow a job and
/// answer its input requests. Indices are the dense per-job instruction and
/// variable indices from the job map.
#[async_trait]
pub trait JobInfoIo: Send + Sync {
    fn init_number_of_instructions(&self, n_instr: u32) {
        let _ = n_instr;
    }

    fn instruction_state_updated(&self, instr_idx: u32, state: InstructionState) {
        let _ = (instr_idx, state);
    }

    fn variable_updated(&self, var_idx: u32, value: &AnyValue, connected: bool) {
        let _ = (var_idx, value, connected);
    }

    fn job_state_updated(&self, state: JobState) {
        let _ = state;
    }

    /// The set of leaves the engine would tick next changed.
    fn next_instructions_updated(&self, instr_indices: &[u32]) {
        let _ = instr_indices;
    }

    fn put_value(&self, value: &AnyValue, description: &str) -> bool {
        let _ = (value, description);
        false
    }

    /// Obtain a value of the same shape as `value` from the user; `None`
    /// means the request was rejected.
    async fn get_user_value(&self, id: u64, value: AnyValue, description: &str) -> Option<AnyValue> {
        let _ = (id, value, description);
        None
    }

    /// Let the user pick one of `options`; `None` means no valid choice.
    async fn get_user_choice(&self, id: u64, options: &[String], metadata: &AnyValue) -> Option<i32> {
        let _ = (id, options, metadata);
        None
    }

    /// Abort the pending input request with the given id.
    fn interrupt(&self, id: u64) {
        let _ = id;
    }

    fn message(&self, text: &str) {
        let _ = text;
    }

    fn log(&self, severity: Severity, message: &str) {
        let _ = (severity, message);
    }
}

/// `JobInfoIo` that drops everything; the daemon and tests override what they
/// need.
#[derive(Default)]
pub struct DefaultJobInfoIo;

#[async_trait]
impl JobInfoIo for DefaultJobInfoIo {}
