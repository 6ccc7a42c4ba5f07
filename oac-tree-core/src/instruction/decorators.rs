use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::attributes::{AttributeCategory, AttributeHandler};
use crate::constants::{TIMING_ACCURACY, VARNAME_DELIMITERS};
use crate::instruction::{Category, ExecContext, InstructionBehavior, SetupContext};
use crate::errors::EngineError;
use crate::status::ExecutionStatus;
use crate::value::{AnyValue, ValueKind};
use crate::workspace::CallbackGuard;

// ─── Inverter ─────────────────────────────────────────────────

/// Ticks its child until finished and swaps Success and Failure.
#[derive(Default)]
pub struct Inverter;

impl Inverter {
    pub const TYPE: &'static str = "Inverter";
}

#[async_trait]
impl InstructionBehavior for Inverter {
    fn category(&self) -> Category {
        Category::Decorator
    }

    async fn execute(&mut self, ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        if ctx.child_status(0).needs_execute() {
            ctx.tick_child(0).await;
        }
        match ctx.child_status(0) {
            ExecutionStatus::Success => ExecutionStatus::Failure,
            ExecutionStatus::Failure => ExecutionStatus::Success,
            other => other,
        }
    }
}

// ─── ForceSuccess / ForceFailure ──────────────────────────────

/// Maps any finished child status to a fixed result.
pub struct ForceResult {
    result: ExecutionStatus,
}

impl ForceResult {
    pub const SUCCESS_TYPE: &'static str = "ForceSuccess";
    pub const FAILURE_TYPE: &'static str = "ForceFailure";

    pub fn success() -> Self {
        ForceResult {
            result: ExecutionStatus::Success,
        }
    }

    pub fn failure() -> Self {
        ForceResult {
            result: ExecutionStatus::Failure,
        }
    }
}

#[async_trait]
impl InstructionBehavior for ForceResult {
    fn category(&self) -> Category {
        Category::Decorator
    }

    async fn execute(&mut self, ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        if ctx.child_status(0).needs_execute() {
            ctx.tick_child(0).await;
        }
        let child_status = ctx.child_status(0);
        if child_status.is_finished() {
            self.result
        } else {
            child_status
        }
    }
}

// ─── Repeat ───────────────────────────────────────────────────

const MAX_COUNT_ATTRIBUTE: &str = "maxCount";

/// Re-ticks its child up to `maxCount` times, resetting between iterations.
/// Finishes on the first child failure, or on the n-th success. A negative
/// count repeats indefinitely; an absent attribute means a single pass.
pub struct Repeat {
    successes: i64,
    max_count: i64,
}

impl Repeat {
    pub const TYPE: &'static str = "Repeat";
}

impl Default for Repeat {
    fn default() -> Self {
        Repeat {
            successes: 0,
            max_count: 1,
        }
    }
}

#[async_trait]
impl InstructionBehavior for Repeat {
    fn category(&self) -> Category {
        Category::Decorator
    }

    fn declare_attributes(&self, handler: &mut AttributeHandler) {
        handler
            .add_definition(MAX_COUNT_ATTRIBUTE, ValueKind::Integer)
            .set_category(AttributeCategory::Both);
    }

    fn init(&mut self, ctx: &mut ExecContext<'_, '_>) -> bool {
        self.successes = 0;
        self.max_count = 1;
        if !ctx.has_attribute(MAX_COUNT_ATTRIBUTE) {
            return true;
        }
        match ctx.attribute_value(MAX_COUNT_ATTRIBUTE).and_then(|v| v.as_i64()) {
            Some(count) => {
                self.max_count = count;
                true
            }
            None => false,
        }
    }

    async fn execute(&mut self, ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        if self.max_count == 0 {
            return ExecutionStatus::Success;
        }
        if ctx.child_status(0).is_finished() {
            ctx.reset_child(0);
        }
        match ctx.tick_child(0).await {
            ExecutionStatus::Success => {
                self.successes += 1;
                if self.max_count >= 0 && self.successes >= self.max_count {
                    ExecutionStatus::Success
                } else {
                    ExecutionStatus::NotFinished
                }
            }
            ExecutionStatus::Failure => ExecutionStatus::Failure,
            other => other,
        }
    }

    fn reset(&mut self) {
        self.successes = 0;
    }
}

// ─── Listen ───────────────────────────────────────────────────

const VAR_NAMES_ATTRIBUTE: &str = "varNames";
const FORCE_SUCCESS_ATTRIBUTE: &str = "forceSuccess";

#[derive(Default)]
struct ListenState {
    changed: bool,
    cache: HashMap<String, AnyValue>,
}

/// Watches a set of workspace variables and runs its child once per observed
/// change. The child's Success (and, with `forceSuccess`, Failure) maps to
/// NotFinished so the decorator keeps listening; a halt breaks the wait.
pub struct Listen {
    var_names: Vec<String>,
    force_success: bool,
    state: Arc<Mutex<ListenState>>,
    guard: Option<CallbackGuard>,
}

impl Listen {
    pub const TYPE: &'static str = "Listen";
}

impl Default for Listen {
    fn default() -> Self {
        Listen {
            var_names: Vec::new(),
            force_success: false,
            state: Arc::new(Mutex::new(ListenState::default())),
            guard: None,
        }
    }
}

impl Listen {
    fn register_callbacks(&mut self, ctx: &ExecContext<'_, '_>) {
        let ws = ctx.workspace();
        {
            let mut state = self.state.lock().unwrap();
            state.changed = false;
            state.cache.clear();
            for name in &self.var_names {
                state
                    .cache
                    .insert(name.clone(), ws.get_value(name).unwrap_or(AnyValue::Null));
            }
        }
        let listener = ws.new_listener();
        for name in &self.var_names {
            let state = self.state.clone();
            let var_name = name.clone();
            ws.register_callback(
                name.clone(),
                move |value, _connected| {
                    let mut state = state.lock().unwrap();
                    if state.cache.get(&var_name) == Some(value) {
                        return;
                    }
                    state.cache.insert(var_name.clone(), value.clone());
                    state.changed = true;
                },
                listener,
            );
        }
        self.guard = Some(ws.callback_guard(listener));
    }

    fn take_change(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        std::mem::take(&mut state.changed)
    }
}

#[async_trait]
impl InstructionBehavior for Listen {
    fn category(&self) -> Category {
        Category::Decorator
    }

    fn declare_attributes(&self, handler: &mut AttributeHandler) {
        handler
            .add_definition(VAR_NAMES_ATTRIBUTE, ValueKind::String)
            .set_mandatory();
        handler.add_definition(FORCE_SUCCESS_ATTRIBUTE, ValueKind::Bool);
    }

    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<(), EngineError> {
        self.force_success = false;
        if let Some(raw) = ctx.attributes.attribute_string(FORCE_SUCCESS_ATTRIBUTE) {
            self.force_success = ValueKind::Bool
                .parse_literal(raw)
                .ok()
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
        }
        let raw_names = ctx
            .attributes
            .attribute_string(VAR_NAMES_ATTRIBUTE)
            .unwrap_or_default();
        self.var_names = raw_names
            .split(VARNAME_DELIMITERS.as_slice())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        if self.var_names.is_empty() {
            return Err(ctx.setup_error("attribute 'varNames' does not name any variable"));
        }
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        if self.guard.is_none() {
            self.register_callbacks(ctx);
        }
        let child_status = ctx.child_status(0);
        if child_status.is_finished() {
            ctx.reset_child(0);
        }
        if child_status.is_finished() || child_status == ExecutionStatus::NotStarted {
            // Wait for a change of one of the watched variables, at most one
            // polling slice per tick so sibling subtrees keep making
            // progress.
            if ctx.halt_requested() {
                self.guard = None;
                return ExecutionStatus::Failure;
            }
            if !self.take_change() {
                tokio::time::sleep(TIMING_ACCURACY).await;
                if ctx.halt_requested() {
                    self.guard = None;
                    return ExecutionStatus::Failure;
                }
                if !self.take_change() {
                    return ExecutionStatus::Running;
                }
            }
        }
        ctx.tick_child(0).await;
        let status = match ctx.child_status(0) {
            ExecutionStatus::Success => ExecutionStatus::NotFinished,
            ExecutionStatus::Failure if self.force_success => ExecutionStatus::NotFinished,
            other => other,
        };
        if status.is_finished() {
            self.guard = None;
        }
        status
    }

    fn halt(&mut self) {
        self.guard = None;
    }

    fn reset(&mut self) {
        self.guard = None;
        let mut state = self.state.lock().unwrap();
        state.changed = false;
        state.cache.clear();
    }
}
