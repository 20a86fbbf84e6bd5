//! # Ownership arbitration
//!
//! Two contended resources move between the host and the guest: the CPU core
//! range ([cpu::CpuArbiter]) and the GPU ([gpu::GpuArbiter]). Both follow the
//! same discipline:
//!
//! - Handoffs are ordered multi-step sequences of external commands. A failed
//!   step stops the sequence immediately; the error carries the failed step
//!   and everything that already completed, so the operator can reconcile by
//!   hand. Nothing auto-retries and nothing rolls back, because reversing a
//!   half-completed driver rebind is not generally safe.
//! - Current ownership is never stored. It is inferred from live system state
//!   on every read, and an ambiguous readback reports [Ownership::Unknown]
//!   instead of guessing.
//!
//! Callers must serialize mutating calls per resource: at most one in-flight
//! handoff per arbiter at any time. Status reads are safe to run concurrently
//! with anything.

use tracing::{debug, info};

use crate::executor::{Execute, ExecuteError};
use crate::store::StoreError;

pub mod cpu;
pub mod gpu;

/// The side a handoff moves a resource to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipTarget {
    Host,
    Guest,
}

/// Inferred current owner of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    Host,
    Guest,
    /// The live readback failed or did not match any known shape, e.g. a
    /// transient state observed mid-handoff.
    Unknown,
}

#[derive(thiserror::Error, Debug)]
pub enum ArbiterError {
    #[error("Handoff aborted at step '{failed_step}' (completed: {completed_steps:?}): {stderr}")]
    SequenceAborted {
        failed_step: String,
        completed_steps: Vec<String>,
        stderr: String,
    },
    #[error("No display-class device found to arbitrate")]
    NoGpuFound,
    #[error(transparent)]
    Execute(#[from] ExecuteError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One named step of a handoff sequence.
#[derive(Debug, Clone)]
pub(crate) struct Step {
    pub(crate) name: &'static str,
    pub(crate) program: &'static str,
    pub(crate) args: Vec<String>,
}

/// Run the steps strictly in order. The first failure aborts the sequence and
/// reports the abort point; steps after it are never invoked.
pub(crate) async fn run_sequence<E: Execute>(
    executor: &E,
    steps: Vec<Step>,
) -> Result<(), ArbiterError> {
    let mut completed: Vec<String> = Vec::new();
    for step in steps {
        debug!("Handoff step '{}': {} {}", step.name, step.program, step.args.join(" "));
        let output = executor.run(step.program, &step.args).await?;
        if !output.success() {
            return Err(ArbiterError::SequenceAborted {
                failed_step: step.name.to_string(),
                completed_steps: completed,
                stderr: if output.stderr.trim().is_empty() {
                    output.stdout.trim().to_string()
                } else {
                    output.stderr.trim().to_string()
                },
            });
        }
        completed.push(step.name.to_string());
    }
    info!("Handoff sequence completed: {:?}", completed);
    Ok(())
}
