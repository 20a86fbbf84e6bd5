//! CPU-core ownership arbitration.
//!
//! The guest's vcpus are already pinned to their cores by the domain
//! descriptor; what has to move is everything *else* on the host competing
//! for those cores. Ownership is therefore implemented by restricting the
//! systemd workload slices, not the guest process: handing the cores to the
//! guest confines the slices to the reserved host range, handing them back
//! restores the full range.

use tracing::instrument;

use crate::arbiter::{run_sequence, ArbiterError, Ownership, OwnershipTarget, Step};
use crate::executor::Execute;
use crate::store::ConfigStore;

/// The workload slices whose CPU affinity is arbitrated, applied in this
/// order. `system.slice` doubles as the representative slice for readback.
const SLICES: [&str; 4] = [
    "background.slice",
    "session.slice",
    "system.slice",
    "user.slice",
];

const READBACK_SLICE: &str = "system.slice";

#[derive(Debug)]
pub struct CpuArbiter<E> {
    executor: E,
    store: ConfigStore,
}

impl<E: Execute> CpuArbiter<E> {
    pub fn new(executor: E, store: ConfigStore) -> CpuArbiter<E> {
        CpuArbiter { executor, store }
    }

    /// Move the guest-exclusive core range to the given side.
    ///
    /// Applies `AllowedCPUs` to every tracked slice in a fixed order. The
    /// underlying mechanism has no multi-object transaction; if one slice
    /// fails the sequence stops there and the error names the slice, so the
    /// operator knows exactly which slices were already restricted.
    #[instrument(skip(self))]
    pub async fn set_target(&self, target: OwnershipTarget) -> Result<(), ArbiterError> {
        let config = self.store.load()?;
        let range = match target {
            OwnershipTarget::Guest => cpu_range(config.host_threads),
            OwnershipTarget::Host => cpu_range(config.total_threads),
        };
        let steps = SLICES
            .iter()
            .map(|&slice| Step {
                name: slice,
                program: "systemctl",
                args: vec![
                    "set-property".to_string(),
                    "--runtime".to_string(),
                    slice.to_string(),
                    format!("AllowedCPUs={range}"),
                ],
            })
            .collect();
        run_sequence(&self.executor, steps).await
    }

    /// Infer the current owner from the live `AllowedCPUs` restriction on the
    /// representative slice.
    ///
    /// Heuristic, by design: an upper bound strictly below
    /// `total_threads - 1` reads as guest-owned, anything reaching the top
    /// thread reads as host-owned. A third-party restriction to some other
    /// partial range is indistinguishable from guest ownership; an
    /// unreadable or unparsable value reads as [Ownership::Unknown].
    pub async fn current_target(&self) -> Result<Ownership, ArbiterError> {
        let config = self.store.load()?;
        let output = self
            .executor
            .run(
                "systemctl",
                &[
                    "show".to_string(),
                    READBACK_SLICE.to_string(),
                    "-p".to_string(),
                    "AllowedCPUs".to_string(),
                ],
            )
            .await?;
        if !output.success() {
            return Ok(Ownership::Unknown);
        }
        let Some(upper) = parse_allowed_cpus_upper_bound(&output.stdout) else {
            return Ok(Ownership::Unknown);
        };
        // A hand-edited config can carry total_threads = 0; there is no top
        // thread to compare against, so the answer is Unknown rather than a
        // panic.
        let Some(top_thread) = config.total_threads.checked_sub(1) else {
            return Ok(Ownership::Unknown);
        };
        if upper < top_thread {
            Ok(Ownership::Guest)
        } else {
            Ok(Ownership::Host)
        }
    }

    /// Terminate the given user's login sessions so the next login starts
    /// under the current slice restriction.
    ///
    /// Existing session scopes keep the `AllowedCPUs` value they were spawned
    /// with; `set_target` only retunes the slices themselves. Tearing the
    /// sessions down is the blunt but reliable way to make them re-inherit.
    #[instrument(skip(self))]
    pub async fn terminate_user_sessions(&self, user: &str) -> Result<(), ArbiterError> {
        let output = self
            .executor
            .run(
                "loginctl",
                &["terminate-user".to_string(), user.to_string()],
            )
            .await?;
        output.require_success("loginctl terminate-user")?;
        Ok(())
    }
}

/// `AllowedCPUs` range expression for `[0, threads)`.
fn cpu_range(threads: u32) -> String {
    if threads > 1 {
        format!("0-{}", threads - 1)
    } else {
        "0".to_string()
    }
}

/// Extract the highest CPU id from a `AllowedCPUs=` readback line, e.g.
/// `AllowedCPUs=0-15` or `AllowedCPUs=0-1,4-7`.
fn parse_allowed_cpus_upper_bound(output: &str) -> Option<u32> {
    let line = output
        .lines()
        .find_map(|l| l.trim().strip_prefix("AllowedCPUs="))?;
    let expression = line.trim();
    if expression.is_empty() {
        return None;
    }
    let mut upper = None;
    for part in expression.split(',') {
        let high = match part.split_once('-') {
            Some((_, high)) => high.trim().parse::<u32>().ok()?,
            None => part.trim().parse::<u32>().ok()?,
        };
        upper = Some(upper.map_or(high, |u: u32| u.max(high)));
    }
    upper
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::fake::FakeExecutor;
    use crate::store::{ArbitrationConfig, ConfigStore};

    fn store_with(total: u32, host: u32) -> ConfigStore {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        store
            .save(&ArbitrationConfig {
                total_threads: total,
                host_threads: host,
                ..ArbitrationConfig::default()
            })
            .unwrap();
        // Leak the tempdir so the path outlives the test body.
        std::mem::forget(dir);
        store
    }

    #[test]
    fn range_expression_covers_the_single_thread_case() {
        assert_eq!(cpu_range(1), "0");
        assert_eq!(cpu_range(2), "0-1");
        assert_eq!(cpu_range(16), "0-15");
    }

    #[test]
    fn parses_upper_bound_of_range_expressions() {
        assert_eq!(parse_allowed_cpus_upper_bound("AllowedCPUs=0-15\n"), Some(15));
        assert_eq!(parse_allowed_cpus_upper_bound("AllowedCPUs=0-1"), Some(1));
        assert_eq!(parse_allowed_cpus_upper_bound("AllowedCPUs=0"), Some(0));
        assert_eq!(
            parse_allowed_cpus_upper_bound("AllowedCPUs=0-1,4-7"),
            Some(7)
        );
        assert_eq!(parse_allowed_cpus_upper_bound("AllowedCPUs="), None);
        assert_eq!(parse_allowed_cpus_upper_bound("nonsense"), None);
    }

    #[tokio::test]
    async fn guest_target_restricts_all_slices_to_the_host_range() {
        let executor = FakeExecutor::new(vec![
            FakeExecutor::ok(""),
            FakeExecutor::ok(""),
            FakeExecutor::ok(""),
            FakeExecutor::ok(""),
        ]);
        let arbiter = CpuArbiter::new(executor, store_with(16, 2));
        arbiter.set_target(OwnershipTarget::Guest).await.unwrap();
        let calls = arbiter.executor.recorded_calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(
            calls[0],
            "systemctl set-property --runtime background.slice AllowedCPUs=0-1"
        );
        assert_eq!(
            calls[3],
            "systemctl set-property --runtime user.slice AllowedCPUs=0-1"
        );
    }

    #[tokio::test]
    async fn host_target_restores_the_full_range() {
        let executor = FakeExecutor::new(vec![
            FakeExecutor::ok(""),
            FakeExecutor::ok(""),
            FakeExecutor::ok(""),
            FakeExecutor::ok(""),
        ]);
        let arbiter = CpuArbiter::new(executor, store_with(16, 2));
        arbiter.set_target(OwnershipTarget::Host).await.unwrap();
        for call in arbiter.executor.recorded_calls() {
            assert!(call.ends_with("AllowedCPUs=0-15"), "unexpected call: {call}");
        }
    }

    #[tokio::test]
    async fn failed_slice_aborts_and_names_the_slice() {
        let executor = FakeExecutor::new(vec![
            FakeExecutor::ok(""),
            FakeExecutor::ok(""),
            FakeExecutor::failed("Access denied"),
        ]);
        let arbiter = CpuArbiter::new(executor, store_with(16, 2));
        let err = arbiter
            .set_target(OwnershipTarget::Guest)
            .await
            .unwrap_err();
        match err {
            ArbiterError::SequenceAborted {
                failed_step,
                completed_steps,
                ..
            } => {
                assert_eq!(failed_step, "system.slice");
                assert_eq!(
                    completed_steps,
                    vec!["background.slice".to_string(), "session.slice".to_string()]
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // user.slice was never touched.
        assert_eq!(arbiter.executor.recorded_calls().len(), 3);
    }

    #[tokio::test]
    async fn restricted_readback_reads_as_guest() {
        let executor = FakeExecutor::new(vec![FakeExecutor::ok("AllowedCPUs=0-1\n")]);
        let arbiter = CpuArbiter::new(executor, store_with(16, 2));
        assert_eq!(arbiter.current_target().await.unwrap(), Ownership::Guest);
    }

    #[tokio::test]
    async fn full_range_readback_reads_as_host() {
        let executor = FakeExecutor::new(vec![FakeExecutor::ok("AllowedCPUs=0-15\n")]);
        let arbiter = CpuArbiter::new(executor, store_with(16, 2));
        assert_eq!(arbiter.current_target().await.unwrap(), Ownership::Host);
    }

    #[tokio::test]
    async fn third_party_partial_range_reads_as_guest() {
        // Documented misclassification: any partial range looks guest-owned.
        let executor = FakeExecutor::new(vec![FakeExecutor::ok("AllowedCPUs=0-7\n")]);
        let arbiter = CpuArbiter::new(executor, store_with(16, 2));
        assert_eq!(arbiter.current_target().await.unwrap(), Ownership::Guest);
    }

    #[tokio::test]
    async fn zero_thread_config_reads_as_unknown_instead_of_panicking() {
        // A corrupt but parseable config must not take down a status poll.
        let executor = FakeExecutor::new(vec![FakeExecutor::ok("AllowedCPUs=0-15\n")]);
        let arbiter = CpuArbiter::new(executor, store_with(0, 0));
        assert_eq!(arbiter.current_target().await.unwrap(), Ownership::Unknown);
    }

    #[tokio::test]
    async fn terminating_sessions_invokes_loginctl_for_the_user() {
        let executor = FakeExecutor::new(vec![FakeExecutor::ok("")]);
        let arbiter = CpuArbiter::new(executor, store_with(16, 2));
        arbiter.terminate_user_sessions("alice").await.unwrap();
        assert_eq!(
            arbiter.executor.recorded_calls(),
            vec!["loginctl terminate-user alice".to_string()]
        );
    }

    #[tokio::test]
    async fn failed_session_termination_surfaces_the_command_error() {
        let executor = FakeExecutor::new(vec![FakeExecutor::failed("Could not terminate")]);
        let arbiter = CpuArbiter::new(executor, store_with(16, 2));
        let err = arbiter
            .terminate_user_sessions("alice")
            .await
            .unwrap_err();
        assert!(matches!(err, ArbiterError::Execute(_)), "unexpected error: {err:?}");
    }

    #[tokio::test]
    async fn unreadable_restriction_reads_as_unknown() {
        let executor = FakeExecutor::new(vec![FakeExecutor::failed("No such unit")]);
        let arbiter = CpuArbiter::new(executor, store_with(16, 2));
        assert_eq!(arbiter.current_target().await.unwrap(), Ownership::Unknown);

        let executor = FakeExecutor::new(vec![FakeExecutor::ok("AllowedCPUs=\n")]);
        let arbiter = CpuArbiter::new(executor, store_with(16, 2));
        assert_eq!(arbiter.current_target().await.unwrap(), Ownership::Unknown);
    }
}
