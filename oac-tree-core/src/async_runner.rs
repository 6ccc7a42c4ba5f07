use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::constants::DEFAULT_SLEEP_TIME;
use crate::log_severity::Severity;
use crate::procedure::Procedure;
use crate::runner::{Breakpoint, BreakpointStatus, Runner, TickOutcome};
use crate::status::{ExecutionStatus, JobCommand, JobState};
use crate::tree::NodeId;
use crate::ui::{JobStateMonitor, UserInterface};

// ─── Command queue ────────────────────────────────────────────

/// Thread-safe FIFO of job commands with priority insertion at the front.
pub struct JobCommandQueue {
    queue: Mutex<VecDeque<JobCommand>>,
    notify: Notify,
}

impl JobCommandQueue {
    pub fn new() -> Self {
        JobCommandQueue {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, command: JobCommand) {
        self.queue.lock().unwrap().push_back(command);
        self.notify.notify_one();
    }

    /// Insert `command` at the front iff the current front has strictly lower
    /// rank, running `action` atomically with the insert. Returns whether the
    /// command was inserted.
    pub fn priority_push(&self, command: JobCommand, action: impl FnOnce()) -> bool {
        let mut queue = self.queue.lock().unwrap();
        if queue.front().is_some_and(|front| *front >= command) {
            return false;
        }
        action();
        queue.push_front(command);
        drop(queue);
        self.notify.notify_one();
        true
    }

    pub fn try_pop(&self) -> Option<JobCommand> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Park until a command can be popped.
    pub async fn wait_for_next(&self) -> JobCommand {
        loop {
            let notified = self.notify.notified();
            if let Some(command) = self.try_pop() {
                return command;
            }
            notified.await;
        }
    }
}

impl Default for JobCommandQueue {
    fn default() -> Self {
        JobCommandQueue::new()
    }
}

// ─── Async runner ─────────────────────────────────────────────

/// Asynchronous wrapper around `Runner`: consumes job commands on a worker
/// task (the only context that drives the procedure) and reports progress
/// through a `JobStateMonitor` and a state watch channel.
pub struct AsyncRunner {
    queue: Arc<JobCommandQueue>,
    halt_flag: Arc<AtomicBool>,
    breakpoints: Arc<Mutex<Vec<Breakpoint>>>,
    monitor: Arc<dyn JobStateMonitor>,
    state_rx: watch::Receiver<JobState>,
    worker: Option<JoinHandle<()>>,
}

impl AsyncRunner {
    /// Take ownership of a not-yet-set-up procedure; setup runs on the worker
    /// when the first Start or Step arrives.
    pub fn new(
        procedure: Procedure,
        ui: Arc<dyn UserInterface>,
        monitor: Arc<dyn JobStateMonitor>,
    ) -> Self {
        let runner = Runner::new(procedure, ui);
        let halt_flag = runner.halt_handle();
        let breakpoints = runner.breakpoint_handle();
        let queue = Arc::new(JobCommandQueue::new());
        let (state_tx, state_rx) = watch::channel(JobState::Initial);
        let worker = Worker {
            runner,
            monitor: monitor.clone(),
            queue: queue.clone(),
            halt_flag: halt_flag.clone(),
            state_tx,
            state: JobState::Initial,
            is_setup: false,
        };
        let handle = tokio::spawn(worker.run());
        AsyncRunner {
            queue,
            halt_flag,
            breakpoints,
            monitor,
            state_rx,
            worker: Some(handle),
        }
    }

    /// Run the procedure continuously if the current state allows it.
    pub fn start(&self) {
        self.queue.push(JobCommand::Start);
    }

    /// Execute a single step if the current state allows it.
    pub fn step(&self) {
        self.queue.push(JobCommand::Step);
    }

    /// Pause at the next tick boundary.
    pub fn pause(&self) {
        self.queue.push(JobCommand::Pause);
    }

    /// Reset the procedure to its initial state.
    pub fn reset(&self) {
        self.queue.push(JobCommand::Reset);
    }

    /// Halt the procedure. The halt flag is raised atomically with the
    /// queue insert so cooperatively blocking leaves unblock immediately.
    pub fn halt(&self) {
        let flag = self.halt_flag.clone();
        self.queue.priority_push(JobCommand::Halt, move || {
            flag.store(true, Ordering::SeqCst);
        });
    }

    /// Idempotently set a breakpoint on an instruction node.
    pub fn set_breakpoint(&self, instruction: NodeId) {
        let mut breakpoints = self.breakpoints.lock().unwrap();
        if breakpoints.iter().any(|b| b.instruction == instruction) {
            return;
        }
        breakpoints.push(Breakpoint {
            instruction,
            status: BreakpointStatus::Set,
        });
        drop(breakpoints);
        self.monitor.on_breakpoint_change(instruction, true);
    }

    pub fn remove_breakpoint(&self, instruction: NodeId) {
        let mut breakpoints = self.breakpoints.lock().unwrap();
        let before = breakpoints.len();
        breakpoints.retain(|b| b.instruction != instruction);
        let removed = breakpoints.len() != before;
        drop(breakpoints);
        if removed {
            self.monitor.on_breakpoint_change(instruction, false);
        }
    }

    pub fn state(&self) -> JobState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<JobState> {
        self.state_rx.clone()
    }

    /// Wait until the job reaches a finished state and return it.
    pub async fn wait_for_finished(&self) -> JobState {
        let mut receiver = self.state_rx.clone();
        loop {
            let state = *receiver.borrow_and_update();
            if state.is_finished() {
                return state;
            }
            if receiver.changed().await.is_err() {
                return *receiver.borrow();
            }
        }
    }

    /// Terminate the worker and join it. The runner is halted first so any
    /// in-progress tick unwinds promptly.
    pub async fn shutdown(&mut self) {
        let flag = self.halt_flag.clone();
        self.queue.priority_push(JobCommand::Terminate, move || {
            flag.store(true, Ordering::SeqCst);
        });
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl Drop for AsyncRunner {
    fn drop(&mut self) {
        // Cannot join from synchronous drop; the worker exits at its next
        // command poll.
        if self.worker.is_some() {
            let flag = self.halt_flag.clone();
            self.queue.priority_push(JobCommand::Terminate, move || {
                flag.store(true, Ordering::SeqCst);
            });
        }
    }
}

// ─── Worker ───────────────────────────────────────────────────

enum Action {
    Continue,
    Step,
    Run,
    Exit,
}

struct Worker {
    runner: Runner,
    monitor: Arc<dyn JobStateMonitor>,
    queue: Arc<JobCommandQueue>,
    halt_flag: Arc<AtomicBool>,
    state_tx: watch::Sender<JobState>,
    state: JobState,
    is_setup: bool,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let command = self.queue.wait_for_next().await;
            let action = match self.state {
                JobState::Initial => self.handle_initial(command),
                JobState::Paused => self.handle_paused(command),
                JobState::Succeeded | JobState::Failed | JobState::Halted => {
                    self.handle_finished(command)
                }
                // Running/Stepping are transient within the loops below;
                // a command seen here is handled like in the paused state.
                JobState::Running | JobState::Stepping => self.handle_paused(command),
            };
            match action {
                Action::Continue => {}
                Action::Exit => break,
                Action::Run => {
                    if let Action::Exit = self.run_procedure().await {
                        break;
                    }
                }
                Action::Step => self.step_procedure().await,
            }
        }
        self.runner.halt();
    }

    fn set_state(&mut self, state: JobState) {
        if state == self.state {
            return;
        }
        self.state = state;
        let _ = self.state_tx.send(state);
        self.monitor.on_state_change(state);
    }

    fn log_error(&self, message: &str) {
        self.runner.interface().log(Severity::Error, message);
    }

    fn ensure_setup(&mut self) -> bool {
        if self.is_setup {
            return true;
        }
        match self.runner.setup() {
            Ok(()) => {
                self.is_setup = true;
                true
            }
            Err(err) => {
                self.log_error(&format!("procedure setup failed: {err}"));
                self.set_state(JobState::Failed);
                false
            }
        }
    }

    fn halt_now(&mut self) {
        self.runner.halt();
        self.set_state(JobState::Halted);
    }

    fn handle_initial(&mut self, command: JobCommand) -> Action {
        match command {
            JobCommand::Start => {
                if !self.ensure_setup() {
                    return Action::Continue;
                }
                self.set_state(JobState::Running);
                Action::Run
            }
            JobCommand::Step => {
                if !self.ensure_setup() {
                    return Action::Continue;
                }
                self.set_state(JobState::Stepping);
                Action::Step
            }
            JobCommand::Halt => {
                self.halt_now();
                Action::Continue
            }
            JobCommand::Terminate => Action::Exit,
            JobCommand::Pause | JobCommand::Reset => Action::Continue,
        }
    }

    fn handle_paused(&mut self, command: JobCommand) -> Action {
        match command {
            JobCommand::Start => {
                self.set_state(JobState::Running);
                Action::Run
            }
            JobCommand::Step => {
                self.set_state(JobState::Stepping);
                Action::Step
            }
            JobCommand::Reset => {
                self.reset_procedure();
                Action::Continue
            }
            JobCommand::Halt => {
                self.halt_now();
                Action::Continue
            }
            JobCommand::Terminate => Action::Exit,
            JobCommand::Pause => Action::Continue,
        }
    }

    fn handle_finished(&mut self, command: JobCommand) -> Action {
        match command {
            JobCommand::Reset => {
                self.reset_procedure();
                Action::Continue
            }
            JobCommand::Terminate => Action::Exit,
            // Halt on an already finished job is a no-op.
            _ => Action::Continue,
        }
    }

    /// Tear the procedure down and back up, re-entering Initial.
    fn reset_procedure(&mut self) {
        self.halt_flag.store(false, Ordering::SeqCst);
        self.runner.reset();
        self.runner.teardown();
        self.is_setup = false;
        match self.runner.setup() {
            Ok(()) => {
                self.is_setup = true;
                self.set_state(JobState::Initial);
            }
            Err(err) => {
                self.log_error(&format!("procedure setup failed: {err}"));
                self.set_state(JobState::Failed);
            }
        }
    }

    fn finish_with(&mut self, status: ExecutionStatus) {
        if self.halt_flag.load(Ordering::SeqCst) {
            self.set_state(JobState::Halted);
        } else if status == ExecutionStatus::Success {
            self.set_state(JobState::Succeeded);
        } else {
            self.set_state(JobState::Failed);
        }
    }

    /// Continuous run loop: poll one command per tick boundary, tick, and
    /// give observers their safe point after every tick.
    async fn run_procedure(&mut self) -> Action {
        loop {
            if let Some(command) = self.queue.try_pop() {
                match command {
                    JobCommand::Pause => {
                        self.set_state(JobState::Paused);
                        return Action::Continue;
                    }
                    JobCommand::Halt => {
                        self.halt_now();
                        return Action::Continue;
                    }
                    JobCommand::Terminate => {
                        self.runner.halt();
                        self.set_state(JobState::Halted);
                        return Action::Exit;
                    }
                    // Reset stays queued until the job leaves the running
                    // state.
                    JobCommand::Reset => self.queue.push(JobCommand::Reset),
                    JobCommand::Start | JobCommand::Step => {}
                }
            }
            match self.runner.execute_single().await {
                TickOutcome::Finished(status) => {
                    self.monitor.on_procedure_tick(self.runner.procedure());
                    self.finish_with(status);
                    return Action::Continue;
                }
                TickOutcome::BreakpointHit => {
                    self.set_state(JobState::Paused);
                    return Action::Continue;
                }
                TickOutcome::Ticked(status) => {
                    self.monitor.on_procedure_tick(self.runner.procedure());
                    if status == ExecutionStatus::NotFinished {
                        // Avoid busy-spinning while the tree is waiting
                        // without any running leaf.
                        tokio::time::sleep(DEFAULT_SLEEP_TIME).await;
                    } else {
                        tokio::task::yield_now().await;
                    }
                }
            }
        }
    }

    /// Single-tick path. Set breakpoints on the next leaves are released
    /// first, so stepping crosses a held breakpoint exactly once.
    async fn step_procedure(&mut self) {
        self.runner.release_breakpoints_at_next();
        match self.runner.execute_single().await {
            TickOutcome::Finished(status) => {
                self.monitor.on_procedure_tick(self.runner.procedure());
                self.finish_with(status);
            }
            TickOutcome::BreakpointHit => {
                self.set_state(JobState::Paused);
            }
            TickOutcome::Ticked(_) => {
                self.monitor.on_procedure_tick(self.runner.procedure());
                if self.halt_flag.load(Ordering::SeqCst) {
                    self.set_state(JobState::Halted);
                } else {
                    self.set_state(JobState::Paused);
                }
            }
        }
    }
}
