pub mod actions;
pub mod compounds;
pub mod decorators;
mod registry;

pub use registry::{InstructionConstructor, InstructionRegistry};

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};

use crate::attributes::AttributeHandler;
use crate::errors::EngineError;
use crate::procedure::ProcedureContext;
use crate::status::ExecutionStatus;
use crate::tree::{InstructionTree, SubtreeSlice};
use crate::ui::UserInterface;
use crate::value::AnyValue;
use crate::workspace::Workspace;

/// Structural category of an instruction. An Action has no children, a
/// Decorator owns exactly one child and a Compound owns an ordered list;
/// arity is enforced during setup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Action,
    Decorator,
    Compound,
}

/// Context handed to `InstructionBehavior::setup`.
pub struct SetupContext<'a> {
    pub name: &'a str,
    pub type_name: &'a str,
    pub attributes: &'a mut AttributeHandler,
    pub child_count: usize,
    pub procedure: &'a ProcedureContext,
}

impl SetupContext<'_> {
    pub fn setup_error(&self, details: impl Into<String>) -> EngineError {
        EngineError::InstructionSetup {
            name: self.name.to_string(),
            instr_type: self.type_name.to_string(),
            details: details.into(),
        }
    }
}

/// Behaviour of one instruction kind.
///
/// The engine owns the surrounding state machine: it latches `init` on the
/// first tick of an activation, stores the status returned by `execute`,
/// publishes transitions to the user interface and recurses reset/halt over
/// children. Behaviours only implement what is specific to their kind.
#[async_trait]
pub trait InstructionBehavior: Send {
    fn category(&self) -> Category {
        Category::Action
    }

    /// Declare attribute definitions and constraints on the node's handler.
    fn declare_attributes(&self, handler: &mut AttributeHandler) {
        let _ = handler;
    }

    /// Validate configuration and latch parsed attributes. Runs once before
    /// the first tick and again after a procedure reset.
    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<(), EngineError> {
        let _ = ctx;
        Ok(())
    }

    /// Hook run once per activation, before the first `execute`. Returning
    /// false fails the instruction.
    fn init(&mut self, ctx: &mut ExecContext<'_, '_>) -> bool {
        let _ = ctx;
        true
    }

    /// Perform exactly one tick.
    async fn execute(&mut self, ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus;

    /// Extra cancellation behaviour; the engine has already latched the halt
    /// flags of the subtree.
    fn halt(&mut self) {}

    /// Drop transient per-activation state (deadlines, guards, counters).
    fn reset(&mut self) {}

    /// Which children would be ticked next, for breakpoint lookahead. The
    /// default is every unfinished child.
    fn next_children(&self, child_statuses: &[ExecutionStatus]) -> Vec<usize> {
        child_statuses
            .iter()
            .enumerate()
            .filter(|(_, status)| status.needs_execute())
            .map(|(idx, _)| idx)
            .collect()
    }
}

// ─── Execution context ────────────────────────────────────────

/// Window through which a behaviour reaches its own attributes, its children
/// and the ambient collaborators during one tick.
pub struct ExecContext<'s, 'e> {
    slice: &'s mut SubtreeSlice<'e>,
    ui: &'e dyn UserInterface,
    ws: &'e Workspace,
    halt: &'e AtomicBool,
}

impl<'s, 'e> ExecContext<'s, 'e> {
    pub fn type_name(&self) -> &str {
        &self.slice.nodes[0].type_name
    }

    pub fn instruction_name(&self) -> &str {
        &self.slice.nodes[0].name
    }

    pub fn attributes(&self) -> &AttributeHandler {
        &self.slice.nodes[0].attributes
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes().has_attribute(name)
    }

    pub fn ui(&self) -> &'e dyn UserInterface {
        self.ui
    }

    pub fn workspace(&self) -> &'e Workspace {
        self.ws
    }

    pub(crate) fn halt_flag(&self) -> &'e AtomicBool {
        self.halt
    }

    /// True when a global halt was requested or this subtree was halted.
    pub fn halt_requested(&self) -> bool {
        self.halt.load(Ordering::Relaxed) || self.slice.nodes[0].halted
    }

    pub fn child_count(&self) -> usize {
        self.slice.child_count()
    }

    pub fn child_status(&self, idx: usize) -> ExecutionStatus {
        self.slice.child_status(idx)
    }

    pub fn child_statuses(&self) -> Vec<ExecutionStatus> {
        self.slice.child_statuses()
    }

    /// Tick one child within the parent's workspace.
    pub async fn tick_child(&mut self, idx: usize) -> ExecutionStatus {
        tick_node(self.slice.child_slice(idx), self.ui, self.ws, self.halt).await
    }

    /// Tick the selected children concurrently, one task per child, joined
    /// before returning so failure thresholds are evaluated consistently.
    pub async fn tick_children(&mut self, indices: &[usize]) {
        let ui = self.ui;
        let ws = self.ws;
        let halt = self.halt;
        let mut futures = Vec::with_capacity(indices.len());
        for (idx, slice) in self.slice.child_slices().into_iter().enumerate() {
            if indices.contains(&idx) {
                futures.push(tick_node(slice, ui, ws, halt));
            }
        }
        join_all(futures).await;
    }

    pub fn reset_child(&mut self, idx: usize) {
        reset_node(self.slice.child_slice(idx), self.ui);
    }

    pub fn halt_child(&mut self, idx: usize) {
        halt_subtree(&mut self.slice.child_slice(idx));
    }

    pub fn halt_children(&mut self) {
        for idx in 0..self.child_count() {
            self.halt_child(idx);
        }
    }

    // ── Attribute indirection ──

    /// Resolve an attribute to a value: through the workspace for
    /// variable-name attributes (and `@`-prefixed `Both` values), by parsing
    /// the literal otherwise. Failures log a warning and yield `None`.
    pub fn attribute_value(&self, name: &str) -> Option<AnyValue> {
        let handler = self.attributes();
        let info = handler.value_info(name)?;
        if info.is_varname {
            match self.ws.get_value(&info.value) {
                Some(value) => Some(value),
                None => {
                    self.log_warning(&format!(
                        "could not read workspace variable '{}'",
                        info.value
                    ));
                    None
                }
            }
        } else {
            let kind = handler.definition(name)?.kind();
            match kind.parse_literal(&info.value) {
                Ok(value) => Some(value),
                Err(err) => {
                    self.log_warning(&format!("could not parse attribute '{name}': {err}"));
                    None
                }
            }
        }
    }

    pub fn attribute_as_f64(&self, name: &str) -> Option<f64> {
        let value = self.attribute_value(name)?;
        match value.as_f64() {
            Some(number) => Some(number),
            None => {
                self.log_warning(&format!("attribute '{name}' is not numeric"));
                None
            }
        }
    }

    pub fn attribute_as_string(&self, name: &str) -> Option<String> {
        let value = self.attribute_value(name)?;
        match value {
            AnyValue::String(text) => Some(text),
            other => Some(other.to_string()),
        }
    }

    pub fn attribute_as_bool(&self, name: &str) -> Option<bool> {
        let value = self.attribute_value(name)?;
        match value.as_bool() {
            Some(flag) => Some(flag),
            None => {
                self.log_warning(&format!("attribute '{name}' is not a boolean"));
                None
            }
        }
    }

    /// Raw variable address (name plus optional field path) of a
    /// variable-name attribute.
    pub fn attribute_variable_address(&self, name: &str) -> Option<String> {
        let info = self.attributes().value_info(name)?;
        info.is_varname.then_some(info.value)
    }

    /// Write `value` through an OUTPUT-style attribute. Requires variable
    /// indirection; failures log a warning.
    pub fn write_to_attribute_variable(&self, name: &str, value: AnyValue) -> bool {
        let Some(info) = self.attributes().value_info(name) else {
            self.log_warning(&format!("missing attribute '{name}'"));
            return false;
        };
        if !info.is_varname {
            self.log_warning(&format!("attribute '{name}' does not name a variable"));
            return false;
        }
        if !self.ws.set_value(&info.value, value) {
            self.log_warning(&format!(
                "could not write workspace variable '{}'",
                info.value
            ));
            return false;
        }
        true
    }

    // ── Logging ──

    fn prolog(&self) -> String {
        format!("{} '{}': ", self.type_name(), self.instruction_name())
    }

    pub fn log_error(&self, message: &str) {
        crate::ui::log_error(self.ui, &format!("{}{message}", self.prolog()));
    }

    pub fn log_warning(&self, message: &str) {
        crate::ui::log_warning(self.ui, &format!("{}{message}", self.prolog()));
    }
}

// ─── Engine walks ─────────────────────────────────────────────

/// Tick the subtree root: run the init hook on the first tick of an
/// activation, dispatch to the behaviour, store and publish the status.
pub(crate) fn tick_node<'a>(
    mut slice: SubtreeSlice<'a>,
    ui: &'a dyn UserInterface,
    ws: &'a Workspace,
    halt: &'a AtomicBool,
) -> BoxFuture<'a, ExecutionStatus> {
    Box::pin(async move {
        let previous = slice.nodes[0].status;
        if previous.is_finished() {
            return previous;
        }
        let Some(mut behavior) = slice.nodes[0].behavior.take() else {
            return previous;
        };
        let first_tick = !slice.nodes[0].started;
        slice.nodes[0].started = true;
        let status = {
            let mut ctx = ExecContext {
                slice: &mut slice,
                ui,
                ws,
                halt,
            };
            if first_tick && !behavior.init(&mut ctx) {
                ExecutionStatus::Failure
            } else {
                behavior.execute(&mut ctx).await
            }
        };
        let base = slice.base;
        let node = &mut slice.nodes[0];
        node.behavior = Some(behavior);
        if node.status != status {
            node.status = status;
            ui.update_instruction_status(base, status);
        }
        status
    })
}

/// Reset a subtree to `NotStarted`: children first, then the node itself.
/// Reset never propagates failures.
pub(crate) fn reset_node(mut slice: SubtreeSlice<'_>, ui: &dyn UserInterface) {
    for idx in 0..slice.child_count() {
        reset_node(slice.child_slice(idx), ui);
    }
    let base = slice.base;
    let node = &mut slice.nodes[0];
    if let Some(behavior) = node.behavior.as_mut() {
        behavior.reset();
    }
    node.started = false;
    node.halted = false;
    if node.status != ExecutionStatus::NotStarted {
        node.status = ExecutionStatus::NotStarted;
        ui.update_instruction_status(base, ExecutionStatus::NotStarted);
    }
}

/// Latch the halt flag on every node of a subtree and run halt hooks. Any
/// cooperatively blocking leaf will observe the flag within one polling
/// slice.
pub(crate) fn halt_subtree(slice: &mut SubtreeSlice<'_>) {
    for node in slice.nodes.iter_mut() {
        node.halted = true;
        if let Some(behavior) = node.behavior.as_mut() {
            behavior.halt();
        }
    }
}

/// Set up every node of a tree: arity checks by category, attribute
/// validation, then the behaviour's own setup, in depth-first order (parents
/// before children).
pub(crate) fn setup_tree(
    tree: &mut InstructionTree,
    context: &ProcedureContext,
) -> Result<(), EngineError> {
    for idx in 0..tree.nodes.len() {
        let node = &tree.nodes[idx];
        let arity_error = match node.category {
            Category::Compound if node.children.is_empty() => {
                Some("compound instruction requires at least one child instruction")
            }
            Category::Decorator if node.children.len() != 1 => {
                Some("decorator instruction requires exactly one child instruction")
            }
            Category::Action if !node.children.is_empty() => {
                Some("action instruction cannot have child instructions")
            }
            _ => None,
        };
        if let Some(details) = arity_error {
            return Err(EngineError::InstructionSetup {
                name: node.name.clone(),
                instr_type: node.type_name.clone(),
                details: details.into(),
            });
        }
        let node = &mut tree.nodes[idx];
        if !node.attributes.validate() {
            return Err(EngineError::instruction_setup(
                &node.name,
                &node.type_name,
                node.attributes.failed_constraints(),
            ));
        }
        let name = node.name.clone();
        let type_name = node.type_name.clone();
        let child_count = node.children.len();
        let mut behavior = node.behavior.take().ok_or_else(|| {
            EngineError::Runtime(format!("instruction '{name}' has no behaviour"))
        })?;
        let result = {
            let mut ctx = SetupContext {
                name: &name,
                type_name: &type_name,
                attributes: &mut tree.nodes[idx].attributes,
                child_count,
                procedure: context,
            };
            behavior.setup(&mut ctx)
        };
        tree.nodes[idx].behavior = Some(behavior);
        result?;
    }
    Ok(())
}
