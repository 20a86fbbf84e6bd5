//! # Command execution primitive
//!
//! Everything in this crate that touches the host does so through [Execute].
//! The trait runs one external command and captures its output; a nonzero exit
//! is part of the captured result, never an `Err`, because several callers
//! treat failure as information (a missing volume, a stopped domain). Callers
//! that do need a hard failure upgrade the output with
//! [CommandOutput::require_success].
//!
//! [HostExecutor] is the real implementation. Arbiters and the lifecycle
//! manager are generic over [Execute] so tests can script the host instead of
//! shelling out.

use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, error, trace};

#[derive(thiserror::Error, Debug)]
pub enum ExecuteError {
    #[error("Failed to launch '{command}', reason: {reason}")]
    Spawn { command: String, reason: String },
    #[error("Command '{command}' failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

/// Captured result of one external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Upgrade a nonzero exit into [ExecuteError::CommandFailed], carrying the
    /// command text and stderr so the operator sees exactly what failed.
    pub fn require_success(self, command: &str) -> Result<CommandOutput, ExecuteError> {
        if self.success() {
            Ok(self)
        } else {
            let stderr = if self.stderr.trim().is_empty() {
                self.stdout.trim().to_string()
            } else {
                self.stderr.trim().to_string()
            };
            Err(ExecuteError::CommandFailed {
                command: command.to_string(),
                stderr,
            })
        }
    }
}

/// Interface to run one external command on the host and capture its output.
pub trait Execute {
    fn run(
        &self,
        program: &str,
        args: &[String],
    ) -> impl std::future::Future<Output = Result<CommandOutput, ExecuteError>> + Send;
}

/// Runs commands directly on the host through [tokio::process::Command].
#[derive(Debug, Default, Clone)]
pub struct HostExecutor;

impl HostExecutor {
    pub fn new() -> HostExecutor {
        HostExecutor
    }
}

impl Execute for HostExecutor {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, ExecuteError> {
        debug!("Run command: {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ExecuteError::Spawn {
                command: format!("{} {}", program, args.join(" ")),
                reason: e.to_string(),
            })?;

        let captured = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code(),
        };
        trace!("Command exited with {:?}", captured.code);
        if !captured.success() {
            error!(
                "Command '{}' exited with {:?}: {}",
                program,
                captured.code,
                captured.stderr.trim()
            );
        }
        Ok(captured)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted executor for unit tests: responses are queued in call order
    //! and every invocation is recorded for assertion.

    use std::sync::Mutex;

    use super::{CommandOutput, Execute, ExecuteError};

    #[derive(Debug)]
    pub(crate) struct FakeExecutor {
        responses: Mutex<Vec<CommandOutput>>,
        pub(crate) calls: Mutex<Vec<String>>,
    }

    impl FakeExecutor {
        pub(crate) fn new(responses: Vec<CommandOutput>) -> FakeExecutor {
            FakeExecutor {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn ok(stdout: &str) -> CommandOutput {
            CommandOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                code: Some(0),
            }
        }

        pub(crate) fn failed(stderr: &str) -> CommandOutput {
            CommandOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                code: Some(1),
            }
        }

        pub(crate) fn recorded_calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Execute for FakeExecutor {
        async fn run(
            &self,
            program: &str,
            args: &[String],
        ) -> Result<CommandOutput, ExecuteError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{} {}", program, args.join(" ")));
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                panic!("FakeExecutor ran out of scripted responses for '{program}'");
            }
            Ok(responses.remove(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_of_successful_command() {
        let executor = HostExecutor::new();
        let output = executor
            .run("echo", &["hello".to_string()])
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_captured_not_raised() {
        let executor = HostExecutor::new();
        let output = executor
            .run("sh", &["-c".to_string(), "echo oops >&2; exit 3".to_string()])
            .await
            .unwrap();
        assert!(!output.success());
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let executor = HostExecutor::new();
        let result = executor.run("/nonexistent/definitely-not-here", &[]).await;
        assert!(matches!(result, Err(ExecuteError::Spawn { .. })));
    }

    #[test]
    fn require_success_carries_stderr() {
        let output = CommandOutput {
            stdout: String::new(),
            stderr: "permission denied\n".to_string(),
            code: Some(1),
        };
        let err = output.require_success("virsh define /tmp/x.xml").unwrap_err();
        match err {
            ExecuteError::CommandFailed { command, stderr } => {
                assert_eq!(command, "virsh define /tmp/x.xml");
                assert_eq!(stderr, "permission denied");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn require_success_falls_back_to_stdout() {
        let output = CommandOutput {
            stdout: "error printed on stdout".to_string(),
            stderr: String::new(),
            code: Some(2),
        };
        let err = output.require_success("qemu-img info").unwrap_err();
        match err {
            ExecuteError::CommandFailed { stderr, .. } => {
                assert_eq!(stderr, "error printed on stdout");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
