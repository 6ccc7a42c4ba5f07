use thiserror::Error;

/// Error kinds surfaced by the engine.
///
/// Setup failures are surfaced to the client of `start` as a `Failed` job
/// state with a logged message. Runtime failures inside a leaf never reach
/// this type: they are converted to `ExecutionStatus::Failure` with an
/// ERROR-level log line.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Message(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("procedure setup failed: {0}")]
    ProcedureSetup(String),
    #[error("setup of instruction '{name}' ({instr_type}) failed: {details}")]
    InstructionSetup {
        name: String,
        instr_type: String,
        details: String,
    },
    #[error("setup of variable '{name}' failed: {details}")]
    VariableSetup { name: String, details: String },
}

impl EngineError {
    /// Setup error for an instruction, from its failed constraint list.
    pub fn instruction_setup(
        name: impl Into<String>,
        instr_type: impl Into<String>,
        failed_constraints: &[String],
    ) -> Self {
        EngineError::InstructionSetup {
            name: name.into(),
            instr_type: instr_type.into(),
            details: failed_constraints.join("; "),
        }
    }
}
