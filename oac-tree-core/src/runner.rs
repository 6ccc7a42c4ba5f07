use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::constants::DEFAULT_SLEEP_TIME;
use crate::errors::EngineError;
use crate::procedure::Procedure;
use crate::status::ExecutionStatus;
use crate::tree::NodeId;
use crate::ui::UserInterface;

/// Marker preventing the next tick of an instruction.
///
/// `Released` is the transient single-shot-continue state: the next time the
/// engine reaches the instruction, the breakpoint is respected once and
/// transitioned back to `Set`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakpointStatus {
    Set,
    Released,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    pub instruction: NodeId,
    pub status: BreakpointStatus,
}

/// Outcome of one `Runner::execute_single` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// The root was ticked and is not finished yet.
    Ticked(ExecutionStatus),
    /// A set breakpoint on one of the next leaves prevented the tick.
    BreakpointHit,
    Finished(ExecutionStatus),
}

/// Synchronous driver of one procedure: ticks the tree until finished or
/// halted, enforcing breakpoints before every tick.
///
/// The breakpoint list and halt flag are shared handles so a controlling
/// thread can reach them while the tick loop runs.
pub struct Runner {
    procedure: Procedure,
    ui: Arc<dyn UserInterface>,
    breakpoints: Arc<Mutex<Vec<Breakpoint>>>,
    halt: Arc<AtomicBool>,
}

impl Runner {
    pub fn new(procedure: Procedure, ui: Arc<dyn UserInterface>) -> Self {
        Runner {
            procedure,
            ui,
            breakpoints: Arc::new(Mutex::new(Vec::new())),
            halt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn procedure(&self) -> &Procedure {
        &self.procedure
    }

    pub fn interface(&self) -> &Arc<dyn UserInterface> {
        &self.ui
    }

    /// Shared halt flag; the single source of truth for cancellation.
    pub fn halt_handle(&self) -> Arc<AtomicBool> {
        self.halt.clone()
    }

    pub fn breakpoint_handle(&self) -> Arc<Mutex<Vec<Breakpoint>>> {
        self.breakpoints.clone()
    }

    pub fn setup(&mut self) -> Result<(), EngineError> {
        self.procedure.setup(self.ui.clone())
    }

    pub fn teardown(&mut self) {
        self.procedure.teardown();
    }

    /// Request a cooperative halt of the running tree.
    pub fn halt(&self) {
        self.halt.store(true, Ordering::SeqCst);
    }

    pub fn is_halt_requested(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.procedure.is_finished()
    }

    /// Idempotently insert a breakpoint. If it coincides with one of the
    /// next leaves, execution stalls before their next tick.
    pub fn set_breakpoint(&self, instruction: NodeId) -> bool {
        let mut breakpoints = self.breakpoints.lock().unwrap();
        if breakpoints.iter().any(|b| b.instruction == instruction) {
            return false;
        }
        breakpoints.push(Breakpoint {
            instruction,
            status: BreakpointStatus::Set,
        });
        true
    }

    pub fn remove_breakpoint(&self, instruction: NodeId) -> bool {
        let mut breakpoints = self.breakpoints.lock().unwrap();
        let before = breakpoints.len();
        breakpoints.retain(|b| b.instruction != instruction);
        before != breakpoints.len()
    }

    /// Release any set breakpoints on the current next leaves, so the next
    /// tick proceeds exactly once past them (the stepping path).
    pub fn release_breakpoints_at_next(&self) {
        let next = self.procedure.next_leaves();
        let mut breakpoints = self.breakpoints.lock().unwrap();
        for breakpoint in breakpoints.iter_mut() {
            if next.contains(&breakpoint.instruction)
                && breakpoint.status == BreakpointStatus::Set
            {
                breakpoint.status = BreakpointStatus::Released;
            }
        }
    }

    /// Reset the tree to NotStarted and clear the halt flag.
    pub fn reset(&mut self) {
        self.procedure.reset_tree(self.ui.as_ref());
        self.halt.store(false, Ordering::SeqCst);
    }

    /// Tick the root once, honouring breakpoints on the next leaves.
    pub async fn execute_single(&mut self) -> TickOutcome {
        if self.procedure.is_finished() {
            return TickOutcome::Finished(self.procedure.root_status());
        }
        if self.hold_at_breakpoint() {
            return TickOutcome::BreakpointHit;
        }
        let status = self
            .procedure
            .execute_root(self.ui.as_ref(), &self.halt)
            .await;
        if status.is_finished() {
            TickOutcome::Finished(status)
        } else {
            TickOutcome::Ticked(status)
        }
    }

    /// True when a set breakpoint blocks the tick. Released breakpoints on
    /// the next leaves are re-armed and let the tick through once.
    fn hold_at_breakpoint(&self) -> bool {
        let next = self.procedure.next_leaves();
        let mut breakpoints = self.breakpoints.lock().unwrap();
        let held = breakpoints
            .iter()
            .any(|b| b.status == BreakpointStatus::Set && next.contains(&b.instruction));
        if held {
            return true;
        }
        for breakpoint in breakpoints.iter_mut() {
            if breakpoint.status == BreakpointStatus::Released
                && next.contains(&breakpoint.instruction)
            {
                breakpoint.status = BreakpointStatus::Set;
            }
        }
        false
    }

    /// Tick until the procedure finishes, a breakpoint holds or a halt is
    /// requested. Backs off between ticks when the tree is waiting without
    /// any running leaf.
    pub async fn execute_procedure(&mut self) {
        loop {
            if self.halt.load(Ordering::SeqCst) && self.procedure.is_finished() {
                return;
            }
            match self.execute_single().await {
                TickOutcome::Finished(_) | TickOutcome::BreakpointHit => return,
                TickOutcome::Ticked(status) => {
                    if self.halt.load(Ordering::SeqCst) {
                        continue;
                    }
                    if status == ExecutionStatus::NotFinished {
                        tokio::time::sleep(DEFAULT_SLEEP_TIME).await;
                    } else {
                        tokio::task::yield_now().await;
                    }
                }
            }
        }
    }
}
