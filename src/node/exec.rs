//! External process execution
//!
//! Every side-effecting tool (package manager, modprobe, sysctl, kubeadm,
//! kubectl, systemctl, aws) is invoked through [`CommandRunner`] with an
//! explicit program and argument vector. Nothing goes through a shell.

use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::common::{Error, Result};

/// Timeout used when a command does not set its own
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// A program plus its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Program and arguments joined by spaces, for logs and matching
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn status_label(&self) -> String {
        match self.code {
            Some(code) => format!("exit {}", code),
            None => "killed by signal".to_string(),
        }
    }
}

/// Runs external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. Spawn failures and timeouts are errors; a non-zero
    /// exit is a normal [`CommandOutput`].
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput>;
}

/// Run and turn a non-zero exit into [`Error::CommandFailed`]
pub async fn run_checked(runner: &dyn CommandRunner, cmd: &CommandSpec) -> Result<CommandOutput> {
    let output = runner.run(cmd).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(Error::CommandFailed {
            program: cmd.command_line(),
            status: output.status_label(),
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// Real process runner on the tokio runtime
#[derive(Debug, Clone)]
pub struct TokioRunner {
    default_timeout: Duration,
}

impl TokioRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

impl Default for TokioRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl CommandRunner for TokioRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let timeout = cmd.timeout.unwrap_or(self.default_timeout);
        debug!(command = %cmd, timeout_secs = timeout.as_secs(), "Running command");

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true);

        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(Error::CommandFailed {
                    program: cmd.command_line(),
                    status: "spawn failed".to_string(),
                    stderr: e.to_string(),
                })
            }
            Err(_) => {
                return Err(Error::CommandFailed {
                    program: cmd.command_line(),
                    status: format!("timed out after {}s", timeout.as_secs()),
                    stderr: String::new(),
                })
            }
        };

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted runner for unit tests

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Answers commands by command-line prefix. The last queued answer for a
    /// prefix repeats; unmatched commands succeed with empty output.
    #[derive(Default)]
    pub struct ScriptedRunner {
        rules: Mutex<Vec<(String, VecDeque<CommandOutput>)>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(&self, prefix: &str, outputs: Vec<CommandOutput>) -> &Self {
            self.rules
                .lock()
                .unwrap()
                .push((prefix.to_string(), outputs.into()));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count(&self, prefix: &str) -> usize {
            self.calls()
                .iter()
                .filter(|c| c.starts_with(prefix))
                .count()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
            let line = cmd.command_line();
            self.calls.lock().unwrap().push(line.clone());

            let mut rules = self.rules.lock().unwrap();
            for (prefix, outputs) in rules.iter_mut().rev() {
                if line.starts_with(prefix.as_str()) {
                    let output = if outputs.len() > 1 {
                        outputs.pop_front()
                    } else {
                        outputs.front().cloned()
                    };
                    return Ok(output.unwrap_or_else(|| CommandOutput::ok("")));
                }
            }
            Ok(CommandOutput::ok(""))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedRunner;
    use super::*;

    #[test]
    fn test_command_line() {
        let cmd = CommandSpec::new("kubeadm")
            .arg("token")
            .args(["create", "--ttl", "24h"]);
        assert_eq!(cmd.command_line(), "kubeadm token create --ttl 24h");
    }

    #[tokio::test]
    async fn test_run_checked_maps_failure() {
        let runner = ScriptedRunner::new();
        runner.on("modprobe", vec![CommandOutput::failed(1, "module not found\n")]);

        let err = run_checked(&runner, &CommandSpec::new("modprobe").arg("overlay"))
            .await
            .unwrap_err();
        match err {
            Error::CommandFailed { program, status, stderr } => {
                assert_eq!(program, "modprobe overlay");
                assert_eq!(status, "exit 1");
                assert_eq!(stderr, "module not found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_scripted_runner_sequences() {
        let runner = ScriptedRunner::new();
        runner.on(
            "kubectl get nodes",
            vec![CommandOutput::failed(1, "refused"), CommandOutput::ok("cp-1 Ready")],
        );
        let cmd = CommandSpec::new("kubectl").args(["get", "nodes"]);
        assert!(!runner.run(&cmd).await.unwrap().success());
        assert!(runner.run(&cmd).await.unwrap().success());
        assert!(runner.run(&cmd).await.unwrap().success());
        assert_eq!(runner.count("kubectl get nodes"), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_runner_real_process() {
        let runner = TokioRunner::default();
        let output = runner
            .run(&CommandSpec::new("sh").args(["-c", "echo hello; exit 3"]))
            .await
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_tokio_runner_missing_program() {
        let runner = TokioRunner::default();
        let result = runner
            .run(&CommandSpec::new("definitely-not-a-real-binary-joinrelay"))
            .await;
        assert!(matches!(result, Err(Error::CommandFailed { .. })));
    }
}
