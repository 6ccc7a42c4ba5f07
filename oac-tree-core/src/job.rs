use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use crate::async_runner::AsyncRunner;
use crate::errors::EngineError;
use crate::info::{create_job_info, JobInfo, JobMap};
use crate::input::{
    AsyncInputAdapter, InputRequestKind, UserInputBackend, UserInputFuture, UserInputReply,
    UserInputRequest,
};
use crate::log_severity::Severity;
use crate::procedure::Procedure;
use crate::status::{ExecutionStatus, InstructionState, JobState};
use crate::tree::NodeId;
use crate::ui::{JobInfoIo, JobStateMonitor, UserInterface};
use crate::value::AnyValue;

/// Programmatic control surface of a running job.
pub trait Job: Send + Sync {
    fn info(&self) -> &JobInfo;

    fn set_breakpoint(&self, instr_idx: u32);

    fn remove_breakpoint(&self, instr_idx: u32);

    fn start(&self);

    fn step(&self);

    fn pause(&self);

    fn reset(&self);

    fn halt(&self);
}

// ─── Interface adapter ────────────────────────────────────────

/// Bridges the engine's interfaces to an external `JobInfoIo`: translates
/// node ids to the dense per-job indices, tracks per-instruction state
/// (status plus breakpoint flag) and funnels user-input requests through an
/// `AsyncInputAdapter`.
pub struct JobInterfaceAdapter {
    job_map: JobMap,
    states: Mutex<Vec<InstructionState>>,
    io: Arc<dyn JobInfoIo>,
    input: AsyncInputAdapter,
}

impl JobInterfaceAdapter {
    pub fn new(job_map: JobMap, io: Arc<dyn JobInfoIo>) -> Arc<Self> {
        let instruction_count = job_map.instructions().instruction_count();
        io.init_number_of_instructions(instruction_count);
        let input = AsyncInputAdapter::new(Arc::new(IoInputBackend { io: io.clone() }));
        Arc::new(JobInterfaceAdapter {
            job_map,
            states: Mutex::new(vec![
                InstructionState::default();
                instruction_count as usize
            ]),
            io,
            input,
        })
    }

    pub fn job_map(&self) -> &JobMap {
        &self.job_map
    }

    pub fn instruction_state(&self, instr_idx: u32) -> Option<InstructionState> {
        self.states.lock().unwrap().get(instr_idx as usize).copied()
    }

    fn node_at(&self, instr_idx: u32) -> Option<NodeId> {
        self.job_map.instructions().node_at(instr_idx)
    }

    fn log_unknown_index(&self, instr_idx: u32) {
        self.io.log(
            Severity::Warning,
            &format!("ignoring command for unknown instruction index {instr_idx}"),
        );
    }

    pub async fn shutdown_input(&self) {
        self.input.shutdown().await;
    }
}

impl UserInterface for JobInterfaceAdapter {
    fn update_instruction_status(&self, node: NodeId, status: ExecutionStatus) {
        let Ok(instr_idx) = self.job_map.instructions().index_of(node) else {
            return;
        };
        let state = {
            let mut states = self.states.lock().unwrap();
            states[instr_idx as usize].status = status;
            states[instr_idx as usize]
        };
        self.io.instruction_state_updated(instr_idx, state);
    }

    fn variable_updated(&self, name: &str, value: &AnyValue, connected: bool) {
        if let Ok(var_idx) = self.job_map.variables().index_of(name) {
            self.io.variable_updated(var_idx, value, connected);
        }
    }

    fn put_value(&self, value: &AnyValue, description: &str) -> bool {
        self.io.put_value(value, description)
    }

    fn request_user_input(&self, request: UserInputRequest) -> UserInputFuture {
        self.input.add_request(request)
    }

    fn message(&self, text: &str) {
        self.io.message(text);
    }

    fn log(&self, severity: Severity, message: &str) {
        self.io.log(severity, message);
    }
}

impl JobStateMonitor for JobInterfaceAdapter {
    fn on_state_change(&self, state: JobState) {
        self.io.job_state_updated(state);
    }

    fn on_breakpoint_change(&self, node: NodeId, breakpoint_set: bool) {
        let Ok(instr_idx) = self.job_map.instructions().index_of(node) else {
            return;
        };
        let state = {
            let mut states = self.states.lock().unwrap();
            states[instr_idx as usize].breakpoint_set = breakpoint_set;
            states[instr_idx as usize]
        };
        self.io.instruction_state_updated(instr_idx, state);
    }

    fn on_procedure_tick(&self, proc: &Procedure) {
        let indices: Vec<u32> = proc
            .next_leaves()
            .into_iter()
            .filter_map(|node| self.job_map.instructions().index_of(node).ok())
            .collect();
        self.io.next_instructions_updated(&indices);
    }
}

/// Input backend over `JobInfoIo`: unpacks requests, forwards them to the
/// front end and repacks the replies.
struct IoInputBackend {
    io: Arc<dyn JobInfoIo>,
}

#[async_trait]
impl UserInputBackend for IoInputBackend {
    async fn input(&self, request: UserInputRequest, id: u64) -> UserInputReply {
        match request.kind {
            InputRequestKind::UserValue => {
                let Some((value, description)) = request.parse_user_value() else {
                    return UserInputReply::user_value(false, AnyValue::Null);
                };
                match self.io.get_user_value(id, value, &description).await {
                    Some(value) => UserInputReply::user_value(true, value),
                    None => UserInputReply::user_value(false, AnyValue::Null),
                }
            }
            InputRequestKind::UserChoice => {
                let Some((options, metadata)) = request.parse_user_choice() else {
                    return UserInputReply::user_choice(false, -1);
                };
                match self.io.get_user_choice(id, &options, &metadata).await {
                    Some(choice) => UserInputReply::user_choice(true, choice),
                    None => UserInputReply::user_choice(false, -1),
                }
            }
            InputRequestKind::Invalid => UserInputReply::invalid(),
        }
    }

    fn interrupt(&self, id: u64) {
        self.io.interrupt(id);
    }
}

// ─── Local job ────────────────────────────────────────────────

/// In-process job: a procedure driven by an `AsyncRunner`, observed and
/// controlled through dense instruction and variable indices.
pub struct LocalJob {
    info: JobInfo,
    adapter: Arc<JobInterfaceAdapter>,
    runner: AsyncRunner,
}

impl std::fmt::Debug for LocalJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalJob").field("info", &self.info).finish_non_exhaustive()
    }
}

impl LocalJob {
    /// Build the index maps and info snapshot, wire the interface adapter and
    /// spawn the job controller. The procedure must not be set up yet; setup
    /// happens on the first Start or Step.
    pub fn new(procedure: Procedure, io: Arc<dyn JobInfoIo>) -> Result<Self, EngineError> {
        let job_id = Uuid::now_v7();
        let job_map = JobMap::new(&procedure)?;
        let info = create_job_info(job_id, &procedure, &job_map)?;
        let adapter = JobInterfaceAdapter::new(job_map, io);
        tracing::debug!(job_id = %job_id, file = %procedure.filename(), "starting local job controller");
        let runner = AsyncRunner::new(procedure, adapter.clone(), adapter.clone());
        Ok(LocalJob {
            info,
            adapter,
            runner,
        })
    }

    pub fn state(&self) -> JobState {
        self.runner.state()
    }

    pub fn state_receiver(&self) -> watch::Receiver<JobState> {
        self.runner.state_receiver()
    }

    pub async fn wait_for_finished(&self) -> JobState {
        self.runner.wait_for_finished().await
    }

    /// Terminate the controller and the input worker, joining both.
    pub async fn shutdown(&mut self) {
        self.runner.shutdown().await;
        self.adapter.shutdown_input().await;
    }
}

impl Job for LocalJob {
    fn info(&self) -> &JobInfo {
        &self.info
    }

    fn set_breakpoint(&self, instr_idx: u32) {
        match self.adapter.node_at(instr_idx) {
            Some(node) => self.runner.set_breakpoint(node),
            None => self.adapter.log_unknown_index(instr_idx),
        }
    }

    fn remove_breakpoint(&self, instr_idx: u32) {
        match self.adapter.node_at(instr_idx) {
            Some(node) => self.runner.remove_breakpoint(node),
            None => self.adapter.log_unknown_index(instr_idx),
        }
    }

    fn start(&self) {
        self.runner.start();
    }

    fn step(&self) {
        self.runner.step();
    }

    fn pause(&self) {
        self.runner.pause();
    }

    fn reset(&self) {
        self.runner.reset();
    }

    fn halt(&self) {
        self.runner.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::procedure_from_string;
    use crate::ui::DefaultJobInfoIo;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    /// `JobInfoIo` recording the observation stream.
    #[derive(Default)]
    struct RecordingIo {
        init: StdMutex<Option<u32>>,
        instruction_states: StdMutex<Vec<(u32, InstructionState)>>,
        variable_updates: StdMutex<Vec<(u32, AnyValue, bool)>>,
        job_states: StdMutex<Vec<JobState>>,
    }

    #[async_trait]
    impl JobInfoIo for RecordingIo {
        fn init_number_of_instructions(&self, n_instr: u32) {
            *self.init.lock().unwrap() = Some(n_instr);
        }

        fn instruction_state_updated(&self, instr_idx: u32, state: InstructionState) {
            self.instruction_states
                .lock()
                .unwrap()
                .push((instr_idx, state));
        }

        fn variable_updated(&self, var_idx: u32, value: &AnyValue, connected: bool) {
            self.variable_updates
                .lock()
                .unwrap()
                .push((var_idx, value.clone(), connected));
        }

        fn job_state_updated(&self, state: JobState) {
            self.job_states.lock().unwrap().push(state);
        }
    }

    const PROCEDURE: &str = r#"<Procedure>
  <Workspace>
    <Local name="x" type="int32" value="7"/>
    <Local name="y" type="int32" value="0"/>
  </Workspace>
  <Sequence>
    <Copy inputVar="x" outputVar="y"/>
    <Succeed/>
  </Sequence>
</Procedure>"#;

    #[tokio::test]
    async fn local_job_reports_structure_and_progress() {
        let io = Arc::new(RecordingIo::default());
        let procedure = procedure_from_string(PROCEDURE, "job.xml").unwrap();
        let mut job = LocalJob::new(procedure, io.clone()).unwrap();

        assert_eq!(*io.init.lock().unwrap(), Some(3));
        assert_eq!(job.info().workspace.variables.len(), 2);

        job.start();
        assert_eq!(job.wait_for_finished().await, JobState::Succeeded);

        let job_states = io.job_states.lock().unwrap().clone();
        assert_eq!(
            job_states,
            vec![JobState::Running, JobState::Succeeded]
        );
        // The copy wrote y = 7 and the update was published by index.
        assert!(io
            .variable_updates
            .lock()
            .unwrap()
            .iter()
            .any(|(idx, value, connected)| *idx == 1 && *value == json!(7) && *connected));
        // Every instruction ended successful.
        let states = io.instruction_states.lock().unwrap();
        for idx in 0..3 {
            assert!(states
                .iter()
                .any(|(i, s)| *i == idx && s.status == ExecutionStatus::Success));
        }
        job.shutdown().await;
    }

    #[tokio::test]
    async fn breakpoint_state_is_published_with_indices() {
        let io = Arc::new(RecordingIo::default());
        let procedure = procedure_from_string(PROCEDURE, "job.xml").unwrap();
        let mut job = LocalJob::new(procedure, io.clone()).unwrap();

        job.set_breakpoint(2);
        assert!(io
            .instruction_states
            .lock()
            .unwrap()
            .iter()
            .any(|(idx, state)| *idx == 2 && state.breakpoint_set));
        job.remove_breakpoint(2);
        // Unknown indices are ignored after logging.
        job.set_breakpoint(99);
        job.shutdown().await;
    }

    #[tokio::test]
    async fn job_without_root_is_an_invalid_operation() {
        let procedure = procedure_from_string("<Procedure/>", "empty.xml").unwrap();
        let err = LocalJob::new(procedure, Arc::new(DefaultJobInfoIo)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidOperation(_)));
    }
}
