//! Shared helpers for the unit tests of the execution engine.

use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

use crate::input::{AsyncInputAdapter, UserInputFuture, UserInputRequest};
use crate::instruction::{setup_tree, tick_node};
use crate::variable::Variable;
use crate::log_severity::Severity;
use crate::procedure::ProcedureContext;
use crate::status::ExecutionStatus;
use crate::tree::{InstructionDescription, InstructionTree, NodeId};
use crate::ui::UserInterface;
use crate::value::AnyValue;
use crate::variable::LocalVariable;
use crate::workspace::Workspace;

/// User interface that records everything it is handed.
pub(crate) struct RecordingUi {
    pub statuses: Mutex<Vec<(NodeId, ExecutionStatus)>>,
    pub variable_updates: Mutex<Vec<(String, AnyValue, bool)>>,
    pub put_values: Mutex<Vec<(AnyValue, String)>>,
    pub messages: Mutex<Vec<String>>,
    pub logs: Mutex<Vec<(Severity, String)>>,
    accept_output: bool,
    input: Option<AsyncInputAdapter>,
}

impl RecordingUi {
    pub fn new() -> Self {
        RecordingUi {
            statuses: Mutex::new(Vec::new()),
            variable_updates: Mutex::new(Vec::new()),
            put_values: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            logs: Mutex::new(Vec::new()),
            accept_output: false,
            input: None,
        }
    }

    pub fn accepting_output() -> Self {
        let mut ui = RecordingUi::new();
        ui.accept_output = true;
        ui
    }
}

impl UserInterface for RecordingUi {
    fn update_instruction_status(&self, node: NodeId, status: ExecutionStatus) {
        self.statuses.lock().unwrap().push((node, status));
    }

    fn variable_updated(&self, name: &str, value: &AnyValue, connected: bool) {
        self.variable_updates
            .lock()
            .unwrap()
            .push((name.to_string(), value.clone(), connected));
    }

    fn put_value(&self, value: &AnyValue, description: &str) -> bool {
        self.put_values
            .lock()
            .unwrap()
            .push((value.clone(), description.to_string()));
        self.accept_output
    }

    fn request_user_input(&self, request: UserInputRequest) -> UserInputFuture {
        match &self.input {
            Some(adapter) => adapter.add_request(request),
            None => UserInputFuture::unsupported(),
        }
    }

    fn message(&self, text: &str) {
        self.messages.lock().unwrap().push(text.to_string());
    }

    fn log(&self, severity: Severity, message: &str) {
        self.logs.lock().unwrap().push((severity, message.to_string()));
    }
}

/// Workspace with `Local` variables built from `(name, attributes)` pairs,
/// already set up.
pub(crate) fn test_workspace(variables: &[(&str, &[(&str, &str)])]) -> Workspace {
    let mut ws = Workspace::new();
    for (name, attrs) in variables {
        let mut var = LocalVariable::new();
        for (attr_name, attr_value) in *attrs {
            var.attributes_mut()
                .add_string_attribute(*attr_name, *attr_value);
        }
        ws.add_variable(*name, Box::new(var)).unwrap();
    }
    ws.setup().unwrap();
    ws
}

/// Build a tree from descriptions and run full setup against a standalone
/// procedure context.
pub(crate) fn setup_tree_for_test(descriptions: &[InstructionDescription]) -> InstructionTree {
    let context = ProcedureContext::standalone();
    let mut tree =
        InstructionTree::build(descriptions, &context.instruction_registry).expect("tree builds");
    setup_tree(&mut tree, &context).expect("tree sets up");
    tree
}

/// Tick the root once.
pub(crate) async fn run_once(
    tree: &mut InstructionTree,
    ws: &Workspace,
    ui: &dyn UserInterface,
    halt: &AtomicBool,
) -> ExecutionStatus {
    let root = tree.root().expect("tree has a root");
    tick_node(tree.slice(root), ui, ws, halt).await
}

/// Tick the root until it reports a finished status.
pub(crate) async fn run_to_completion(
    tree: &mut InstructionTree,
    ws: &Workspace,
    ui: &dyn UserInterface,
) -> ExecutionStatus {
    let halt = AtomicBool::new(false);
    loop {
        let status = run_once(tree, ws, ui, &halt).await;
        if status.is_finished() {
            return status;
        }
        tokio::task::yield_now().await;
    }
}
