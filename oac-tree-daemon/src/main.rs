//! Command-line runner: loads a procedure file, parses it into an executable
//! behaviour tree and executes it to completion.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use oac_tree_core::{
    procedure_from_file, AnyValue, InstructionState, Job, JobInfoIo, JobState, LocalJob, Severity,
};

#[derive(Parser)]
#[command(
    name = "oac-tree-daemon",
    about = "Loads <filename>, parses it into an executable behaviour tree and executes it."
)]
struct Args {
    /// Procedure file to load, parse and execute.
    #[arg(short = 'f', long = "file")]
    file: PathBuf,

    /// Log verbosity (EMERGENCY..TRACE).
    #[arg(short = 'v', long = "verbose", default_value = "WARNING")]
    verbose: String,
}

/// Observation sink logging everything through tracing.
struct DaemonIo {
    max_severity: Severity,
}

impl DaemonIo {
    fn emit(&self, severity: Severity, message: &str) {
        if severity > self.max_severity {
            return;
        }
        match severity {
            Severity::Emergency | Severity::Alert | Severity::Critical | Severity::Error => {
                tracing::error!(severity = %severity, "{message}")
            }
            Severity::Warning => tracing::warn!("{message}"),
            Severity::Notice | Severity::Info => tracing::info!("{message}"),
            Severity::Debug => tracing::debug!("{message}"),
            Severity::Trace => tracing::trace!("{message}"),
        }
    }
}

#[async_trait]
impl JobInfoIo for DaemonIo {
    fn instruction_state_updated(&self, instr_idx: u32, state: InstructionState) {
        tracing::debug!(instr_idx, status = %state.status, "instruction state");
    }

    fn variable_updated(&self, var_idx: u32, value: &AnyValue, connected: bool) {
        tracing::debug!(var_idx, %value, connected, "variable updated");
    }

    fn job_state_updated(&self, state: JobState) {
        tracing::info!(state = %state, "job state changed");
    }

    fn put_value(&self, value: &AnyValue, description: &str) -> bool {
        if description.is_empty() {
            println!("{value}");
        } else {
            println!("{description}: {value}");
        }
        true
    }

    fn message(&self, text: &str) {
        println!("{text}");
    }

    fn log(&self, severity: Severity, message: &str) {
        self.emit(severity, message);
    }
}

fn tracing_filter(severity: Severity) -> &'static str {
    match severity {
        Severity::Emergency | Severity::Alert | Severity::Critical | Severity::Error => "error",
        Severity::Warning => "warn",
        Severity::Notice | Severity::Info => "info",
        Severity::Debug => "debug",
        Severity::Trace => "trace",
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let Some(severity) = Severity::from_name(&args.verbose) else {
        eprintln!("unknown severity '{}'", args.verbose);
        return ExitCode::from(1);
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(tracing_filter(severity))),
        )
        .init();

    let mut procedure = match procedure_from_file(&args.file) {
        Ok(procedure) => procedure,
        Err(err) => {
            tracing::error!("{err}");
            return ExitCode::from(1);
        }
    };

    // Validate setup eagerly so configuration errors exit non-zero; the job
    // controller sets the procedure up again on Start.
    if let Err(err) = procedure.setup(Arc::new(oac_tree_core::DefaultUserInterface)) {
        tracing::error!("{err}");
        return ExitCode::from(1);
    }
    procedure.teardown();

    let io = Arc::new(DaemonIo {
        max_severity: severity,
    });
    let mut job = match LocalJob::new(procedure, io) {
        Ok(job) => job,
        Err(err) => {
            tracing::error!("{err}");
            return ExitCode::from(1);
        }
    };

    job.start();
    let end_state = job.wait_for_finished().await;
    job.shutdown().await;
    tracing::info!("procedure ended with state: {end_state}");

    // The procedure's own Success/Failure does not affect the exit code.
    ExitCode::from(0)
}
