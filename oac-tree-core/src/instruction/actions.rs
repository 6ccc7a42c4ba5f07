use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::attributes::{AttributeCategory, AttributeHandler};
use crate::constants::{
    DESCRIPTION_ATTRIBUTE, INPUT_VARIABLE_ATTRIBUTE, OUTPUT_VARIABLE_ATTRIBUTE, TIMEOUT_ATTRIBUTE,
    TIMING_ACCURACY, VARIABLE_NAME_ATTRIBUTE,
};
use crate::errors::EngineError;
use crate::input::UserInputRequest;
use crate::instruction::{ExecContext, InstructionBehavior, SetupContext};
use crate::log_severity::Severity;
use crate::status::ExecutionStatus;
use crate::value::{self, ValueKind};

fn timeout_duration(seconds: f64) -> Duration {
    Duration::from_secs_f64(seconds.max(0.0))
}

/// Latch the (possibly indirected) `timeout` attribute into a deadline.
/// An absent attribute means "no wait".
fn latch_deadline(ctx: &mut ExecContext<'_, '_>, deadline: &mut Option<Instant>) -> bool {
    if !ctx.has_attribute(TIMEOUT_ATTRIBUTE) {
        *deadline = Some(Instant::now());
        return true;
    }
    match ctx.attribute_as_f64(TIMEOUT_ATTRIBUTE) {
        Some(seconds) => {
            *deadline = Some(Instant::now() + timeout_duration(seconds));
            true
        }
        None => false,
    }
}

// ─── Wait ─────────────────────────────────────────────────────

/// Sleeps until its timeout elapses, in short slices so a halt lands within
/// one polling interval. Success immediately when the timeout is absent.
#[derive(Default)]
pub struct Wait {
    deadline: Option<Instant>,
}

impl Wait {
    pub const TYPE: &'static str = "Wait";
}

#[async_trait]
impl InstructionBehavior for Wait {
    fn declare_attributes(&self, handler: &mut AttributeHandler) {
        handler
            .add_definition(TIMEOUT_ATTRIBUTE, ValueKind::Float)
            .set_category(AttributeCategory::Both);
    }

    fn init(&mut self, ctx: &mut ExecContext<'_, '_>) -> bool {
        latch_deadline(ctx, &mut self.deadline)
    }

    async fn execute(&mut self, ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        let deadline = self.deadline.unwrap_or_else(Instant::now);
        loop {
            if ctx.halt_requested() {
                return ExecutionStatus::Failure;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return ExecutionStatus::Success;
            }
            tokio::time::sleep(remaining.min(TIMING_ACCURACY)).await;
        }
    }

    fn reset(&mut self) {
        self.deadline = None;
    }
}

// ─── AsyncWait ────────────────────────────────────────────────

/// Non-blocking variant of `Wait`: reports `Running` until the latched
/// deadline passes.
#[derive(Default)]
pub struct AsyncWait {
    deadline: Option<Instant>,
}

impl AsyncWait {
    pub const TYPE: &'static str = "AsyncWait";
}

#[async_trait]
impl InstructionBehavior for AsyncWait {
    fn declare_attributes(&self, handler: &mut AttributeHandler) {
        handler
            .add_definition(TIMEOUT_ATTRIBUTE, ValueKind::Float)
            .set_category(AttributeCategory::Both);
    }

    fn init(&mut self, ctx: &mut ExecContext<'_, '_>) -> bool {
        latch_deadline(ctx, &mut self.deadline)
    }

    async fn execute(&mut self, ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        if ctx.halt_requested() {
            return ExecutionStatus::Failure;
        }
        let deadline = self.deadline.unwrap_or_else(Instant::now);
        if Instant::now() < deadline {
            return ExecutionStatus::Running;
        }
        ExecutionStatus::Success
    }

    fn reset(&mut self) {
        self.deadline = None;
    }
}

// ─── Copy ─────────────────────────────────────────────────────

/// Copies the INPUT variable's value to the OUTPUT variable.
#[derive(Default)]
pub struct Copy;

impl Copy {
    pub const TYPE: &'static str = "Copy";
}

#[async_trait]
impl InstructionBehavior for Copy {
    fn declare_attributes(&self, handler: &mut AttributeHandler) {
        handler
            .add_definition(INPUT_VARIABLE_ATTRIBUTE, ValueKind::String)
            .set_category(AttributeCategory::VariableName)
            .set_mandatory();
        handler
            .add_definition(OUTPUT_VARIABLE_ATTRIBUTE, ValueKind::String)
            .set_category(AttributeCategory::VariableName)
            .set_mandatory();
    }

    async fn execute(&mut self, ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        let Some(value) = ctx.attribute_value(INPUT_VARIABLE_ATTRIBUTE) else {
            return ExecutionStatus::Failure;
        };
        if !ctx.write_to_attribute_variable(OUTPUT_VARIABLE_ATTRIBUTE, value) {
            return ExecutionStatus::Failure;
        }
        ExecutionStatus::Success
    }
}

// ─── Increment / Decrement ────────────────────────────────────

/// Adds a fixed delta to a numeric workspace variable.
pub struct AddToVariable {
    delta: i64,
}

impl AddToVariable {
    pub const INCREMENT_TYPE: &'static str = "Increment";
    pub const DECREMENT_TYPE: &'static str = "Decrement";

    pub fn increment() -> Self {
        AddToVariable { delta: 1 }
    }

    pub fn decrement() -> Self {
        AddToVariable { delta: -1 }
    }
}

#[async_trait]
impl InstructionBehavior for AddToVariable {
    fn declare_attributes(&self, handler: &mut AttributeHandler) {
        handler
            .add_definition(VARIABLE_NAME_ATTRIBUTE, ValueKind::String)
            .set_category(AttributeCategory::VariableName)
            .set_mandatory();
    }

    async fn execute(&mut self, ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        let Some(current) = ctx.attribute_value(VARIABLE_NAME_ATTRIBUTE) else {
            return ExecutionStatus::Failure;
        };
        let Some(updated) = value::add_delta(&current, self.delta) else {
            ctx.log_warning("variable does not hold a numeric value");
            return ExecutionStatus::Failure;
        };
        if !ctx.write_to_attribute_variable(VARIABLE_NAME_ATTRIBUTE, updated) {
            return ExecutionStatus::Failure;
        }
        ExecutionStatus::Success
    }
}

// ─── Equals / GreaterThan ─────────────────────────────────────

const LEFT_VARIABLE_ATTRIBUTE: &str = "leftVar";
const RIGHT_VARIABLE_ATTRIBUTE: &str = "rightVar";

fn declare_comparison_attributes(handler: &mut AttributeHandler) {
    handler
        .add_definition(LEFT_VARIABLE_ATTRIBUTE, ValueKind::String)
        .set_category(AttributeCategory::VariableName)
        .set_mandatory();
    handler
        .add_definition(RIGHT_VARIABLE_ATTRIBUTE, ValueKind::String)
        .set_category(AttributeCategory::VariableName)
        .set_mandatory();
}

/// Deep equality between two workspace values.
#[derive(Default)]
pub struct Equals;

impl Equals {
    pub const TYPE: &'static str = "Equals";
}

#[async_trait]
impl InstructionBehavior for Equals {
    fn declare_attributes(&self, handler: &mut AttributeHandler) {
        declare_comparison_attributes(handler);
    }

    async fn execute(&mut self, ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        let (Some(left), Some(right)) = (
            ctx.attribute_value(LEFT_VARIABLE_ATTRIBUTE),
            ctx.attribute_value(RIGHT_VARIABLE_ATTRIBUTE),
        ) else {
            return ExecutionStatus::Failure;
        };
        if left == right {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failure
        }
    }
}

/// Numeric strictly-greater comparison between two workspace values.
#[derive(Default)]
pub struct GreaterThan;

impl GreaterThan {
    pub const TYPE: &'static str = "GreaterThan";
}

#[async_trait]
impl InstructionBehavior for GreaterThan {
    fn declare_attributes(&self, handler: &mut AttributeHandler) {
        declare_comparison_attributes(handler);
    }

    async fn execute(&mut self, ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        let (Some(left), Some(right)) = (
            ctx.attribute_value(LEFT_VARIABLE_ATTRIBUTE),
            ctx.attribute_value(RIGHT_VARIABLE_ATTRIBUTE),
        ) else {
            return ExecutionStatus::Failure;
        };
        match value::numeric_greater(&left, &right) {
            Some(true) => ExecutionStatus::Success,
            Some(false) => ExecutionStatus::Failure,
            None => {
                ctx.log_warning("operands are not numeric");
                ExecutionStatus::Failure
            }
        }
    }
}

// ─── Output ───────────────────────────────────────────────────

const FROM_VARIABLE_ATTRIBUTE: &str = "fromVar";

/// Presents a workspace value through the user interface.
#[derive(Default)]
pub struct Output;

impl Output {
    pub const TYPE: &'static str = "Output";
}

#[async_trait]
impl InstructionBehavior for Output {
    fn declare_attributes(&self, handler: &mut AttributeHandler) {
        handler
            .add_definition(FROM_VARIABLE_ATTRIBUTE, ValueKind::String)
            .set_category(AttributeCategory::VariableName)
            .set_mandatory();
        handler
            .add_definition(DESCRIPTION_ATTRIBUTE, ValueKind::String)
            .set_category(AttributeCategory::Both);
    }

    async fn execute(&mut self, ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        let Some(value) = ctx.attribute_value(FROM_VARIABLE_ATTRIBUTE) else {
            return ExecutionStatus::Failure;
        };
        let description = match optional_description(ctx) {
            Ok(text) => text,
            Err(()) => return ExecutionStatus::Failure,
        };
        if ctx.ui().put_value(&value, &description) {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failure
        }
    }
}

fn optional_description(ctx: &ExecContext<'_, '_>) -> Result<String, ()> {
    if !ctx.has_attribute(DESCRIPTION_ATTRIBUTE) {
        return Ok(String::new());
    }
    ctx.attribute_as_string(DESCRIPTION_ATTRIBUTE).ok_or(())
}

// ─── Input ────────────────────────────────────────────────────

/// Requests a value from the user and stores the reply in the OUTPUT
/// variable. Polls the input future in short slices so it stays
/// halt-responsive; halting cancels the request.
#[derive(Default)]
pub struct Input;

impl Input {
    pub const TYPE: &'static str = "Input";
}

#[async_trait]
impl InstructionBehavior for Input {
    fn declare_attributes(&self, handler: &mut AttributeHandler) {
        handler
            .add_definition(OUTPUT_VARIABLE_ATTRIBUTE, ValueKind::String)
            .set_category(AttributeCategory::VariableName)
            .set_mandatory();
        handler
            .add_definition(DESCRIPTION_ATTRIBUTE, ValueKind::String)
            .set_category(AttributeCategory::Both);
    }

    async fn execute(&mut self, ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        let Some(prototype) = ctx.attribute_value(OUTPUT_VARIABLE_ATTRIBUTE) else {
            return ExecutionStatus::Failure;
        };
        let description = match optional_description(ctx) {
            Ok(text) => text,
            Err(()) => return ExecutionStatus::Failure,
        };
        let request = UserInputRequest::user_value(&prototype, &description);
        let future = ctx.ui().request_user_input(request);
        if !future.is_valid() {
            ctx.log_error("could not retrieve a valid future for user input");
            return ExecutionStatus::Failure;
        }
        while !ctx.halt_requested() && !future.is_ready() {
            tokio::time::sleep(TIMING_ACCURACY).await;
        }
        if ctx.halt_requested() {
            // Dropping the future cancels the outstanding request.
            return ExecutionStatus::Failure;
        }
        let reply = match future.value() {
            Ok(reply) => reply,
            Err(err) => {
                ctx.log_error(&format!("could not retrieve user input reply: {err}"));
                return ExecutionStatus::Failure;
            }
        };
        let compatible = reply.parse_user_value();
        let Some((true, value)) = compatible else {
            ctx.log_warning("did not receive a compatible user value");
            return ExecutionStatus::Failure;
        };
        if !ctx.write_to_attribute_variable(OUTPUT_VARIABLE_ATTRIBUTE, value) {
            return ExecutionStatus::Failure;
        }
        ExecutionStatus::Success
    }
}

// ─── Message ──────────────────────────────────────────────────

const TEXT_ATTRIBUTE: &str = "text";

/// Sends a fixed message to the user interface.
#[derive(Default)]
pub struct Message;

impl Message {
    pub const TYPE: &'static str = "Message";
}

#[async_trait]
impl InstructionBehavior for Message {
    fn declare_attributes(&self, handler: &mut AttributeHandler) {
        handler
            .add_definition(TEXT_ATTRIBUTE, ValueKind::String)
            .set_category(AttributeCategory::Both)
            .set_mandatory();
    }

    async fn execute(&mut self, ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        let Some(text) = ctx.attribute_as_string(TEXT_ATTRIBUTE) else {
            return ExecutionStatus::Failure;
        };
        ctx.ui().message(&text);
        ExecutionStatus::Success
    }
}

// ─── Log ──────────────────────────────────────────────────────

const MESSAGE_ATTRIBUTE: &str = "message";
const SEVERITY_ATTRIBUTE: &str = "severity";

/// Emits a log line through the user interface at a configurable severity.
pub struct LogInstruction {
    severity: Severity,
}

impl LogInstruction {
    pub const TYPE: &'static str = "Log";
}

impl Default for LogInstruction {
    fn default() -> Self {
        LogInstruction {
            severity: Severity::Info,
        }
    }
}

#[async_trait]
impl InstructionBehavior for LogInstruction {
    fn declare_attributes(&self, handler: &mut AttributeHandler) {
        handler
            .add_definition(MESSAGE_ATTRIBUTE, ValueKind::String)
            .set_category(AttributeCategory::Both)
            .set_mandatory();
        handler.add_definition(SEVERITY_ATTRIBUTE, ValueKind::String);
    }

    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<(), EngineError> {
        self.severity = Severity::Info;
        if let Some(name) = ctx.attributes.attribute_string(SEVERITY_ATTRIBUTE) {
            self.severity = Severity::from_name(name)
                .ok_or_else(|| ctx.setup_error(format!("unknown log severity '{name}'")))?;
        }
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        let Some(message) = ctx.attribute_as_string(MESSAGE_ATTRIBUTE) else {
            return ExecutionStatus::Failure;
        };
        ctx.ui().log(self.severity, &message);
        ExecutionStatus::Success
    }
}

// ─── Succeed / Fail ───────────────────────────────────────────

/// Constant success.
#[derive(Default)]
pub struct Succeed;

impl Succeed {
    pub const TYPE: &'static str = "Succeed";
}

#[async_trait]
impl InstructionBehavior for Succeed {
    async fn execute(&mut self, _ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        ExecutionStatus::Success
    }
}

/// Constant failure.
#[derive(Default)]
pub struct Fail;

impl Fail {
    pub const TYPE: &'static str = "Fail";
}

#[async_trait]
impl InstructionBehavior for Fail {
    async fn execute(&mut self, _ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        ExecutionStatus::Failure
    }
}

// ─── ResetVariable ────────────────────────────────────────────

/// Resets the named workspace variable and sets it up again from its
/// attributes.
#[derive(Default)]
pub struct ResetVariable;

impl ResetVariable {
    pub const TYPE: &'static str = "ResetVariable";
}

#[async_trait]
impl InstructionBehavior for ResetVariable {
    fn declare_attributes(&self, handler: &mut AttributeHandler) {
        handler
            .add_definition(VARIABLE_NAME_ATTRIBUTE, ValueKind::String)
            .set_category(AttributeCategory::VariableName)
            .set_mandatory();
    }

    async fn execute(&mut self, ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        let Some(address) = ctx.attribute_variable_address(VARIABLE_NAME_ATTRIBUTE) else {
            return ExecutionStatus::Failure;
        };
        let (name, _) = value::split_address(&address);
        if !ctx.workspace().reset_variable(name) {
            ctx.log_warning(&format!("could not reset variable '{name}'"));
            return ExecutionStatus::Failure;
        }
        ExecutionStatus::Success
    }
}

// ─── VarExists ────────────────────────────────────────────────

/// Succeeds iff the named workspace variable resolves.
#[derive(Default)]
pub struct VarExists;

impl VarExists {
    pub const TYPE: &'static str = "VarExists";
}

#[async_trait]
impl InstructionBehavior for VarExists {
    fn declare_attributes(&self, handler: &mut AttributeHandler) {
        handler
            .add_definition(VARIABLE_NAME_ATTRIBUTE, ValueKind::String)
            .set_mandatory();
    }

    async fn execute(&mut self, ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        let Some(name) = ctx.attribute_as_string(VARIABLE_NAME_ATTRIBUTE) else {
            return ExecutionStatus::Failure;
        };
        if ctx.workspace().has_variable(&name) {
            ExecutionStatus::Success
        } else {
            ctx.log_warning(&format!("no variable named '{name}' in workspace"));
            ExecutionStatus::Failure
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{run_once, run_to_completion, setup_tree_for_test, test_workspace, RecordingUi};
    use crate::tree::{InstructionDescription, InstructionTree};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn single(desc: InstructionDescription) -> InstructionTree {
        setup_tree_for_test(std::slice::from_ref(&desc))
    }

    #[tokio::test]
    async fn succeed_and_fail_are_constant() {
        let ui = RecordingUi::new();
        let ws = test_workspace(&[]);
        let mut tree = single(InstructionDescription::new("Succeed"));
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Success
        );
        let mut tree = single(InstructionDescription::new("Fail"));
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Failure
        );
    }

    #[tokio::test]
    async fn wait_without_timeout_succeeds_immediately() {
        let ui = RecordingUi::new();
        let ws = test_workspace(&[]);
        let mut tree = single(InstructionDescription::new("Wait"));
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Success
        );
    }

    #[tokio::test]
    async fn wait_fails_when_halted() {
        let ui = Arc::new(RecordingUi::new());
        let ws = Arc::new(test_workspace(&[]));
        let mut tree = setup_tree_for_test(
            &[InstructionDescription::new("Wait").with_attribute("timeout", "10.0")],
        );
        let halt = Arc::new(AtomicBool::new(false));
        let halt_for_trigger = halt.clone();
        let trigger = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(40)).await;
            halt_for_trigger.store(true, Ordering::Relaxed);
        });
        let started = Instant::now();
        let status = run_once(&mut tree, &ws, ui.as_ref(), &halt).await;
        trigger.await.unwrap();
        assert_eq!(status, ExecutionStatus::Failure);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn async_wait_reports_running_until_deadline() {
        let ui = RecordingUi::new();
        let ws = test_workspace(&[]);
        let mut tree = setup_tree_for_test(
            &[InstructionDescription::new("AsyncWait").with_attribute("timeout", "0.05")],
        );
        let halt = AtomicBool::new(false);
        assert_eq!(
            run_once(&mut tree, &ws, &ui, &halt).await,
            ExecutionStatus::Running
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(
            run_once(&mut tree, &ws, &ui, &halt).await,
            ExecutionStatus::Success
        );
    }

    #[tokio::test]
    async fn copy_moves_values_between_variables() {
        let ui = RecordingUi::new();
        let ws = test_workspace(&[
            ("x", &[("type", "int32"), ("value", "7")]),
            ("y", &[("type", "int32"), ("value", "0")]),
        ]);
        let desc = InstructionDescription::new("Copy")
            .with_attribute("inputVar", "x")
            .with_attribute("outputVar", "y");
        let mut tree = setup_tree_for_test(std::slice::from_ref(&desc));
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Success
        );
        assert_eq!(ws.get_value("y"), Some(json!(7)));
    }

    #[tokio::test]
    async fn copy_fails_on_missing_or_incompatible_variables() {
        let ui = RecordingUi::new();
        let ws = test_workspace(&[("x", &[("type", "int32"), ("value", "1")])]);
        let desc = InstructionDescription::new("Copy")
            .with_attribute("inputVar", "x")
            .with_attribute("outputVar", "missing");
        let mut tree = setup_tree_for_test(std::slice::from_ref(&desc));
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Failure
        );

        let ws = test_workspace(&[
            ("x", &[("type", "string"), ("value", "\"text\"")]),
            ("y", &[("type", "int32"), ("value", "0")]),
        ]);
        let desc = InstructionDescription::new("Copy")
            .with_attribute("inputVar", "x")
            .with_attribute("outputVar", "y");
        let mut tree = setup_tree_for_test(std::slice::from_ref(&desc));
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Failure
        );
    }

    #[tokio::test]
    async fn increment_and_decrement_update_in_place() {
        let ui = RecordingUi::new();
        let ws = test_workspace(&[("n", &[("type", "int32"), ("value", "5")])]);
        let inc = InstructionDescription::new("Increment").with_attribute("varName", "n");
        let mut tree = setup_tree_for_test(std::slice::from_ref(&inc));
        run_to_completion(&mut tree, &ws, &ui).await;
        assert_eq!(ws.get_value("n"), Some(json!(6)));

        let dec = InstructionDescription::new("Decrement").with_attribute("varName", "n");
        let mut tree = setup_tree_for_test(std::slice::from_ref(&dec));
        run_to_completion(&mut tree, &ws, &ui).await;
        assert_eq!(ws.get_value("n"), Some(json!(5)));
    }

    #[tokio::test]
    async fn comparisons_report_success_and_failure() {
        let ui = RecordingUi::new();
        let ws = test_workspace(&[
            ("a", &[("type", "int32"), ("value", "3")]),
            ("b", &[("type", "int32"), ("value", "3")]),
            ("c", &[("type", "int32"), ("value", "1")]),
        ]);
        let equals = |l: &str, r: &str| {
            InstructionDescription::new("Equals")
                .with_attribute("leftVar", l)
                .with_attribute("rightVar", r)
        };
        let mut tree = setup_tree_for_test(std::slice::from_ref(&equals("a", "b")));
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Success
        );
        let mut tree = setup_tree_for_test(std::slice::from_ref(&equals("a", "c")));
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Failure
        );

        let greater = InstructionDescription::new("GreaterThan")
            .with_attribute("leftVar", "a")
            .with_attribute("rightVar", "c");
        let mut tree = setup_tree_for_test(std::slice::from_ref(&greater));
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Success
        );
    }

    #[tokio::test]
    async fn output_forwards_value_and_description() {
        let ui = RecordingUi::accepting_output();
        let ws = test_workspace(&[("x", &[("type", "int32"), ("value", "7")])]);
        let desc = InstructionDescription::new("Output")
            .with_attribute("fromVar", "x")
            .with_attribute("description", "the value");
        let mut tree = setup_tree_for_test(std::slice::from_ref(&desc));
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Success
        );
        assert_eq!(
            *ui.put_values.lock().unwrap(),
            vec![(json!(7), "the value".to_string())]
        );
    }

    #[tokio::test]
    async fn output_fails_when_interface_rejects() {
        let ui = RecordingUi::new(); // rejects put_value
        let ws = test_workspace(&[("x", &[("type", "int32"), ("value", "7")])]);
        let desc = InstructionDescription::new("Output").with_attribute("fromVar", "x");
        let mut tree = setup_tree_for_test(std::slice::from_ref(&desc));
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Failure
        );
    }

    #[tokio::test]
    async fn message_and_log_reach_the_interface() {
        let ui = RecordingUi::new();
        let ws = test_workspace(&[]);
        let message = InstructionDescription::new("Message").with_attribute("text", "hello");
        let mut tree = setup_tree_for_test(std::slice::from_ref(&message));
        run_to_completion(&mut tree, &ws, &ui).await;
        assert_eq!(*ui.messages.lock().unwrap(), vec!["hello".to_string()]);

        let log = InstructionDescription::new("Log")
            .with_attribute("message", "careful")
            .with_attribute("severity", "NOTICE");
        let mut tree = setup_tree_for_test(std::slice::from_ref(&log));
        run_to_completion(&mut tree, &ws, &ui).await;
        assert!(ui
            .logs
            .lock()
            .unwrap()
            .iter()
            .any(|(sev, msg)| *sev == Severity::Notice && msg == "careful"));
    }

    #[tokio::test]
    async fn reset_variable_restores_initial_value() {
        let ui = RecordingUi::new();
        let ws = test_workspace(&[("x", &[("type", "int32"), ("value", "7")])]);
        ws.set_value("x", json!(99));
        let desc = InstructionDescription::new("ResetVariable").with_attribute("varName", "x");
        let mut tree = setup_tree_for_test(std::slice::from_ref(&desc));
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Success
        );
        assert_eq!(ws.get_value("x"), Some(json!(7)));
    }

    #[tokio::test]
    async fn var_exists_warns_on_absent_variable() {
        let ui = RecordingUi::new();
        let ws = test_workspace(&[("x", &[("type", "int32"), ("value", "0")])]);
        let exists = |name: &str| {
            InstructionDescription::new("VarExists").with_attribute("varName", name)
        };
        let mut tree = setup_tree_for_test(std::slice::from_ref(&exists("x")));
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Success
        );
        let mut tree = setup_tree_for_test(std::slice::from_ref(&exists("ghost")));
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Failure
        );
        assert!(ui
            .logs
            .lock()
            .unwrap()
            .iter()
            .any(|(sev, _)| *sev == Severity::Warning));
    }
}
