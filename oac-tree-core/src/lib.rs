//! Execution engine for operational procedures expressed as behaviour trees.
//!
//! A procedure couples a tree of instructions (sequences, fallbacks,
//! parallel composition, decorators and primitive actions) with a workspace
//! of typed, reactively updated variables. The engine ticks the tree,
//! sequences Start/Step/Pause/Reset/Halt commands on a worker task, bridges
//! blocking user-input backends to a non-blocking future interface, and
//! publishes progress through dense instruction and variable indices.

pub mod async_runner;
pub mod attributes;
pub mod constants;
pub mod constraints;
pub mod errors;
pub mod info;
pub mod input;
pub mod instruction;
pub mod job;
pub mod log_severity;
pub mod parser;
pub mod procedure;
pub mod runner;
pub mod status;
pub mod tree;
pub mod ui;
pub mod value;
pub mod variable;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use async_runner::{AsyncRunner, JobCommandQueue};
pub use attributes::{AttributeCategory, AttributeDefinition, AttributeHandler};
pub use constraints::Constraint;
pub use errors::EngineError;
pub use info::{
    create_job_info, create_workspace_info, AttributeInfo, InstructionInfo, InstructionMap,
    JobInfo, JobMap, VariableInfo, VariableMap, WorkspaceInfo,
};
pub use input::{
    AsyncInputAdapter, InputRequestKind, UserInputBackend, UserInputFuture, UserInputReply,
    UserInputRequest,
};
pub use instruction::{Category, ExecContext, InstructionBehavior, InstructionRegistry, SetupContext};
pub use job::{Job, JobInterfaceAdapter, LocalJob};
pub use log_severity::Severity;
pub use parser::{procedure_from_file, procedure_from_string, template_from_file, template_from_string};
pub use procedure::{
    Procedure, ProcedureContext, ProcedurePreamble, ProcedureStore, ProcedureTemplate,
    TypeRegistration, TypeRegistrationMode, VariableDescription,
};
pub use runner::{Breakpoint, BreakpointStatus, Runner, TickOutcome};
pub use status::{ExecutionStatus, InstructionState, JobCommand, JobState};
pub use tree::{InstructionDescription, InstructionNode, InstructionTree, NodeId};
pub use ui::{
    DefaultJobInfoIo, DefaultJobStateMonitor, DefaultUserInterface, JobInfoIo, JobStateMonitor,
    UserInterface,
};
pub use value::{AnyValue, ValueKind};
pub use variable::{LocalVariable, Variable, VariableRegistry};
pub use workspace::{CallbackGuard, ListenerHandle, Workspace};
