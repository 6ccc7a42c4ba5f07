use std::sync::Arc;

use async_trait::async_trait;

use crate::attributes::AttributeHandler;
use crate::errors::EngineError;
use crate::input::{UserInputFuture, UserInputRequest};
use crate::instruction::{setup_tree, tick_node, Category, ExecContext, InstructionBehavior, SetupContext};
use crate::log_severity::Severity;
use crate::status::ExecutionStatus;
use crate::tree::{InstructionTree, NodeId};
use crate::ui::UserInterface;
use crate::value::{AnyValue, ValueKind};
use crate::workspace::Workspace;

// ─── Sequence ─────────────────────────────────────────────────

/// Ticks its children in order; fails on the first child failure, succeeds
/// when all children have succeeded.
#[derive(Default)]
pub struct Sequence;

impl Sequence {
    pub const TYPE: &'static str = "Sequence";
}

fn sequence_like_status(
    child_statuses: &[ExecutionStatus],
    skipped: ExecutionStatus,
    all_skipped: ExecutionStatus,
) -> ExecutionStatus {
    for status in child_statuses {
        if *status == skipped {
            continue;
        }
        return match status {
            ExecutionStatus::NotStarted | ExecutionStatus::NotFinished => {
                ExecutionStatus::NotFinished
            }
            // Forward Running and the terminating status of the child.
            other => *other,
        };
    }
    all_skipped
}

fn sequence_like_next(child_statuses: &[ExecutionStatus], skipped: ExecutionStatus) -> Vec<usize> {
    for (idx, status) in child_statuses.iter().enumerate() {
        if *status == skipped {
            continue;
        }
        return if status.needs_execute() {
            vec![idx]
        } else {
            Vec::new()
        };
    }
    Vec::new()
}

async fn sequence_like_execute(
    ctx: &mut ExecContext<'_, '_>,
    skipped: ExecutionStatus,
    all_skipped: ExecutionStatus,
) -> ExecutionStatus {
    for idx in 0..ctx.child_count() {
        let status = ctx.child_status(idx);
        if status == skipped {
            continue;
        }
        if status.needs_execute() {
            ctx.tick_child(idx).await;
        } else {
            ctx.log_warning("ticked again while already finished");
        }
        break;
    }
    sequence_like_status(&ctx.child_statuses(), skipped, all_skipped)
}

#[async_trait]
impl InstructionBehavior for Sequence {
    fn category(&self) -> Category {
        Category::Compound
    }

    async fn execute(&mut self, ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        sequence_like_execute(ctx, ExecutionStatus::Success, ExecutionStatus::Success).await
    }

    fn next_children(&self, child_statuses: &[ExecutionStatus]) -> Vec<usize> {
        sequence_like_next(child_statuses, ExecutionStatus::Success)
    }
}

// ─── Fallback ─────────────────────────────────────────────────

/// Dual of `Sequence`: succeeds on the first child success, fails when all
/// children have failed.
#[derive(Default)]
pub struct Fallback;

impl Fallback {
    pub const TYPE: &'static str = "Fallback";
}

#[async_trait]
impl InstructionBehavior for Fallback {
    fn category(&self) -> Category {
        Category::Compound
    }

    async fn execute(&mut self, ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        sequence_like_execute(ctx, ExecutionStatus::Failure, ExecutionStatus::Failure).await
    }

    fn next_children(&self, child_statuses: &[ExecutionStatus]) -> Vec<usize> {
        sequence_like_next(child_statuses, ExecutionStatus::Failure)
    }
}

// ─── ParallelSequence ─────────────────────────────────────────

const SUCCESS_THRESHOLD_ATTRIBUTE: &str = "successThreshold";
const FAILURE_THRESHOLD_ATTRIBUTE: &str = "failureThreshold";

/// Ticks all unfinished children concurrently, one task per child, joined at
/// every tick boundary. Succeeds when at least `successThreshold` children
/// succeeded, fails when at least `failureThreshold` failed; laggards are
/// halted once either threshold resolves.
#[derive(Default)]
pub struct ParallelSequence {
    success_threshold: usize,
    failure_threshold: usize,
}

impl ParallelSequence {
    pub const TYPE: &'static str = "ParallelSequence";
}

#[async_trait]
impl InstructionBehavior for ParallelSequence {
    fn category(&self) -> Category {
        Category::Compound
    }

    fn declare_attributes(&self, handler: &mut AttributeHandler) {
        handler.add_definition(SUCCESS_THRESHOLD_ATTRIBUTE, ValueKind::UnsignedInteger);
        handler.add_definition(FAILURE_THRESHOLD_ATTRIBUTE, ValueKind::UnsignedInteger);
    }

    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<(), EngineError> {
        let children = ctx.child_count;
        self.success_threshold = children;
        self.failure_threshold = 1;

        let parse = |attributes: &AttributeHandler, name: &str| -> Result<Option<usize>, EngineError> {
            if !attributes.has_attribute(name) {
                return Ok(None);
            }
            let value = attributes.literal_value(name)?;
            Ok(Some(value.as_u64().unwrap_or_default() as usize))
        };

        let explicit_success = parse(ctx.attributes, SUCCESS_THRESHOLD_ATTRIBUTE)
            .map_err(|e| ctx.setup_error(format!("could not parse successThreshold: {e}")))?;
        if let Some(success) = explicit_success {
            self.success_threshold = success;
        }
        if let Some(failure) = parse(ctx.attributes, FAILURE_THRESHOLD_ATTRIBUTE)
            .map_err(|e| ctx.setup_error(format!("could not parse failureThreshold: {e}")))?
        {
            if explicit_success.is_some() {
                // Clamp so the two thresholds can always resolve.
                self.failure_threshold =
                    failure.min(children + 1 - self.success_threshold.min(children));
            } else {
                self.failure_threshold = failure;
                self.success_threshold = children + 1 - failure.min(children);
            }
        } else if explicit_success.is_some() {
            self.failure_threshold = children + 1 - self.success_threshold.min(children);
        }
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        let pending: Vec<usize> = ctx
            .child_statuses()
            .iter()
            .enumerate()
            .filter(|(_, status)| status.needs_execute())
            .map(|(idx, _)| idx)
            .collect();
        ctx.tick_children(&pending).await;

        let statuses = ctx.child_statuses();
        let successes = statuses
            .iter()
            .filter(|s| **s == ExecutionStatus::Success)
            .count();
        let failures = statuses
            .iter()
            .filter(|s| **s == ExecutionStatus::Failure)
            .count();
        let status = if successes >= self.success_threshold {
            ExecutionStatus::Success
        } else if failures >= self.failure_threshold {
            ExecutionStatus::Failure
        } else {
            ExecutionStatus::Running
        };
        if status != ExecutionStatus::Running {
            ctx.halt_children();
        }
        status
    }
}

// ─── Include ──────────────────────────────────────────────────

const FILE_ATTRIBUTE: &str = "file";
const PATH_ATTRIBUTE: &str = "path";

struct IncludeScope {
    tree: InstructionTree,
    workspace: Arc<Workspace>,
}

/// Delegates to a named instruction of another procedure (or of the current
/// one), instantiated as a private clone scoped to a subordinate workspace.
/// The clone is resolved and set up during setup so include cycles and
/// invalid references fail early.
#[derive(Default)]
pub struct Include {
    scope: Option<IncludeScope>,
}

impl Include {
    pub const TYPE: &'static str = "Include";
}

#[async_trait]
impl InstructionBehavior for Include {
    fn declare_attributes(&self, handler: &mut AttributeHandler) {
        handler.add_definition(FILE_ATTRIBUTE, ValueKind::String);
        handler
            .add_definition(PATH_ATTRIBUTE, ValueKind::String)
            .set_mandatory();
    }

    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<(), EngineError> {
        self.scope = None;
        let path = ctx
            .attributes
            .attribute_string(PATH_ATTRIBUTE)
            .unwrap_or_default()
            .to_string();
        let (template, sub_filename) = match ctx.attributes.attribute_string(FILE_ATTRIBUTE) {
            Some(file) => {
                let resolved = ctx.procedure.resolve_path(file);
                let template = ctx.procedure.store.load(&resolved)?;
                (template, resolved.to_string_lossy().into_owned())
            }
            None => (
                ctx.procedure.template.clone(),
                ctx.procedure.filename.clone(),
            ),
        };
        let description = template
            .find_instruction(&path)
            .ok_or_else(|| ctx.setup_error(format!("no instruction named '{path}' to include")))?
            .clone();
        let include_site = format!("{sub_filename}::{path}");
        ctx.procedure
            .store
            .record_include(&ctx.procedure.include_site, &include_site)?;
        let sub_context = ctx
            .procedure
            .subcontext(sub_filename, include_site, template);
        let mut tree = InstructionTree::build(
            std::slice::from_ref(&description),
            &sub_context.instruction_registry,
        )?;
        let workspace = Arc::new(crate::procedure::build_workspace(
            &sub_context.template,
            &sub_context.variable_registry,
        )?);
        workspace.setup()?;
        setup_tree(&mut tree, &sub_context)?;
        self.scope = Some(IncludeScope { tree, workspace });
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut ExecContext<'_, '_>) -> ExecutionStatus {
        let ui = ctx.ui();
        let halt = ctx.halt_flag();
        let halted_locally = ctx.halt_requested();
        let Some(scope) = self.scope.as_mut() else {
            ctx.log_error("include was not resolved during setup");
            return ExecutionStatus::Failure;
        };
        if halted_locally {
            scope.tree.halt_all();
        }
        let Some(root) = scope.tree.root() else {
            return ExecutionStatus::Failure;
        };
        let shim = SubordinateUi { inner: ui };
        tick_node(scope.tree.slice(root), &shim, &scope.workspace, halt).await
    }

    fn halt(&mut self) {
        if let Some(scope) = self.scope.as_mut() {
            scope.tree.halt_all();
        }
    }

    fn reset(&mut self) {
        if let Some(scope) = self.scope.as_mut() {
            scope.tree.reset_silent();
        }
    }
}

/// Interface wrapper for included subtrees: their node ids are not part of
/// the enclosing job's index space, so status updates stay internal while
/// everything else is forwarded.
struct SubordinateUi<'a> {
    inner: &'a dyn UserInterface,
}

impl UserInterface for SubordinateUi<'_> {
    fn update_instruction_status(&self, _node: NodeId, _status: ExecutionStatus) {}

    fn variable_updated(&self, name: &str, value: &AnyValue, connected: bool) {
        self.inner.variable_updated(name, value, connected);
    }

    fn put_value(&self, value: &AnyValue, description: &str) -> bool {
        self.inner.put_value(value, description)
    }

    fn request_user_input(&self, request: UserInputRequest) -> UserInputFuture {
        self.inner.request_user_input(request)
    }

    fn message(&self, text: &str) {
        self.inner.message(text)
    }

    fn log(&self, severity: Severity, message: &str) {
        self.inner.log(severity, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{run_once, run_to_completion, setup_tree_for_test, test_workspace, RecordingUi};
    use crate::tree::InstructionDescription;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    fn sequence(children: &[&str]) -> InstructionDescription {
        let mut desc = InstructionDescription::new("Sequence");
        for child in children {
            desc = desc.with_child(InstructionDescription::new(*child));
        }
        desc
    }

    #[tokio::test]
    async fn sequence_succeeds_when_all_children_succeed() {
        let ui = RecordingUi::new();
        let ws = test_workspace(&[]);
        let mut tree = setup_tree_for_test(&[sequence(&["Succeed", "Succeed"])]);
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Success
        );
        assert_eq!(tree.status_of(1), ExecutionStatus::Success);
        assert_eq!(tree.status_of(2), ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn sequence_stops_at_first_failure() {
        let ui = RecordingUi::new();
        let ws = test_workspace(&[]);
        let mut tree = setup_tree_for_test(&[sequence(&["Succeed", "Fail", "Succeed"])]);
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Failure
        );
        assert_eq!(tree.status_of(1), ExecutionStatus::Success);
        assert_eq!(tree.status_of(2), ExecutionStatus::Failure);
        assert_eq!(tree.status_of(3), ExecutionStatus::NotStarted);
    }

    #[tokio::test]
    async fn fallback_succeeds_on_first_success() {
        let ui = RecordingUi::new();
        let ws = test_workspace(&[]);
        let mut desc = InstructionDescription::new("Fallback");
        for child in ["Fail", "Succeed", "Fail"] {
            desc = desc.with_child(InstructionDescription::new(child));
        }
        let mut tree = setup_tree_for_test(std::slice::from_ref(&desc));
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Success
        );
        assert_eq!(tree.status_of(3), ExecutionStatus::NotStarted);
    }

    #[tokio::test]
    async fn fallback_fails_when_all_children_fail() {
        let ui = RecordingUi::new();
        let ws = test_workspace(&[]);
        let mut desc = InstructionDescription::new("Fallback");
        for _ in 0..2 {
            desc = desc.with_child(InstructionDescription::new("Fail"));
        }
        let mut tree = setup_tree_for_test(std::slice::from_ref(&desc));
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Failure
        );
    }

    #[tokio::test]
    async fn parallel_runs_children_concurrently() {
        let ui = RecordingUi::new();
        let ws = test_workspace(&[]);
        let mut desc = InstructionDescription::new("ParallelSequence");
        for _ in 0..3 {
            desc = desc
                .with_child(InstructionDescription::new("Wait").with_attribute("timeout", "0.05"));
        }
        let mut tree = setup_tree_for_test(std::slice::from_ref(&desc));
        let started = Instant::now();
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Success
        );
        // Three 50 ms waits ticked concurrently finish well under 150 ms.
        assert!(started.elapsed() < Duration::from_millis(120));
    }

    #[tokio::test]
    async fn parallel_default_thresholds_fail_on_any_failure() {
        let ui = RecordingUi::new();
        let ws = test_workspace(&[]);
        let mut desc = InstructionDescription::new("ParallelSequence");
        for child in ["Succeed", "Fail"] {
            desc = desc.with_child(InstructionDescription::new(child));
        }
        let mut tree = setup_tree_for_test(std::slice::from_ref(&desc));
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Failure
        );
    }

    #[tokio::test]
    async fn parallel_success_threshold_allows_failures() {
        let ui = RecordingUi::new();
        let ws = test_workspace(&[]);
        let mut desc =
            InstructionDescription::new("ParallelSequence").with_attribute("successThreshold", "1");
        for child in ["Fail", "Succeed"] {
            desc = desc.with_child(InstructionDescription::new(child));
        }
        let mut tree = setup_tree_for_test(std::slice::from_ref(&desc));
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Success
        );
    }

    #[tokio::test]
    async fn parallel_failure_threshold_derives_success_threshold() {
        // failureThreshold = 2 over three children implies successThreshold 2.
        let ui = RecordingUi::new();
        let ws = test_workspace(&[]);
        let mut desc =
            InstructionDescription::new("ParallelSequence").with_attribute("failureThreshold", "2");
        for child in ["Fail", "Succeed", "Succeed"] {
            desc = desc.with_child(InstructionDescription::new(child));
        }
        let mut tree = setup_tree_for_test(std::slice::from_ref(&desc));
        assert_eq!(
            run_to_completion(&mut tree, &ws, &ui).await,
            ExecutionStatus::Success
        );
    }

    #[tokio::test]
    async fn sequence_fallback_duality_holds() {
        // Fallback(children) == Inverter { Sequence(map Inverter children) }
        let ui = RecordingUi::new();
        let ws = test_workspace(&[]);
        for pattern in [["Fail", "Succeed"], ["Fail", "Fail"], ["Succeed", "Fail"]] {
            let mut fallback = InstructionDescription::new("Fallback");
            for child in pattern {
                fallback = fallback.with_child(InstructionDescription::new(child));
            }
            let mut inverted = InstructionDescription::new("Sequence");
            for child in pattern {
                inverted = inverted.with_child(
                    InstructionDescription::new("Inverter")
                        .with_child(InstructionDescription::new(child)),
                );
            }
            let dual = InstructionDescription::new("Inverter").with_child(inverted);

            let mut left = setup_tree_for_test(std::slice::from_ref(&fallback));
            let mut right = setup_tree_for_test(std::slice::from_ref(&dual));
            let left_status = run_to_completion(&mut left, &ws, &ui).await;
            let right_status = run_to_completion(&mut right, &ws, &ui).await;
            assert_eq!(left_status, right_status, "pattern {pattern:?}");
        }
    }

    #[tokio::test]
    async fn next_children_mirror_execution_order() {
        let ui = RecordingUi::new();
        let ws = test_workspace(&[]);
        let mut tree = setup_tree_for_test(&[sequence(&["Succeed", "Succeed"])]);
        assert_eq!(tree.next_leaves(0), vec![1]);
        let halt = AtomicBool::new(false);
        run_once(&mut tree, &ws, &ui, &halt).await;
        assert_eq!(tree.next_leaves(0), vec![2]);
    }
}
