//! Local bootstrap steps
//!
//! Each step is one external command followed by an optional convergence
//! check. Required steps abort the run on failure; optional ones only warn.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::common::{Error, Phase, PhaseLog, Result};
use crate::node::exec::{run_checked, CommandRunner, CommandSpec};

/// One command in the bootstrap sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapStep {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<Check>,
    /// Failure is logged, the run continues
    #[serde(default)]
    pub optional: bool,
}

/// Convergence check run after a step's command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Check {
    /// Kernel module appears in `lsmod`
    ModuleLoaded { module: String },
    /// `sysctl -n key` prints `expected`
    Sysctl { key: String, expected: String },
    /// Arbitrary command exits 0
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// `systemctl is-active unit` succeeds
    ServiceActive { unit: String },
}

impl BootstrapStep {
    pub fn new(name: &str, program: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            check: None,
            optional: false,
        }
    }

    pub fn with_check(mut self, check: Check) -> Self {
        self.check = Some(check);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    fn command(&self, timeout: Duration) -> CommandSpec {
        CommandSpec::new(&self.program)
            .args(self.args.iter().cloned())
            .timeout(timeout)
    }
}

fn sysctl_step(key: &str) -> BootstrapStep {
    BootstrapStep::new(&format!("sysctl {}", key), "sysctl", &["-w", &format!("{}=1", key)])
        .with_check(Check::Sysctl {
            key: key.to_string(),
            expected: "1".to_string(),
        })
}

fn modprobe_step(module: &str) -> BootstrapStep {
    BootstrapStep::new(&format!("load {}", module), "modprobe", &[module]).with_check(
        Check::ModuleLoaded {
            module: module.to_string(),
        },
    )
}

/// Container runtime, kernel prerequisites and orchestrator binaries
pub fn default_steps() -> Vec<BootstrapStep> {
    vec![
        BootstrapStep::new("install container runtime", "dnf", &["install", "-y", "containerd"]),
        BootstrapStep::new(
            "enable container runtime",
            "systemctl",
            &["enable", "--now", "containerd"],
        )
        .with_check(Check::ServiceActive {
            unit: "containerd".to_string(),
        }),
        BootstrapStep::new("disable swap", "swapoff", &["-a"]).optional(),
        modprobe_step("overlay"),
        modprobe_step("br_netfilter"),
        sysctl_step("net.bridge.bridge-nf-call-iptables"),
        sysctl_step("net.bridge.bridge-nf-call-ip6tables"),
        sysctl_step("net.ipv4.ip_forward"),
        BootstrapStep::new(
            "install orchestrator binaries",
            "dnf",
            &[
                "install",
                "-y",
                "kubelet",
                "kubeadm",
                "kubectl",
                "--disableexcludes=kubernetes",
            ],
        ),
        BootstrapStep::new("enable cluster agent", "systemctl", &["enable", "kubelet"]),
    ]
}

/// Run every step in order
pub async fn run_bootstrap(
    runner: &dyn CommandRunner,
    steps: &[BootstrapStep],
    timeout: Duration,
    log: &PhaseLog,
) -> Result<()> {
    log.info(Phase::Bootstrap, &format!("Running {} bootstrap steps", steps.len()));

    for step in steps {
        let outcome = match run_checked(runner, &step.command(timeout)).await {
            Ok(_) => match &step.check {
                Some(check) => verify(runner, check, timeout).await,
                None => Ok(()),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => log.info(Phase::Bootstrap, &format!("✓ {}", step.name)),
            Err(e) if step.optional => {
                log.warn(
                    Phase::Bootstrap,
                    &format!("optional step '{}' failed: {}", step.name, e),
                );
            }
            Err(e) => {
                let err = Error::Precondition(format!("{}: {}", step.name, e));
                log.error(Phase::Bootstrap, &err.to_string());
                return Err(err);
            }
        }
    }

    log.success(Phase::Bootstrap, "Local prerequisites converged");
    Ok(())
}

async fn verify(runner: &dyn CommandRunner, check: &Check, timeout: Duration) -> Result<()> {
    match check {
        Check::ModuleLoaded { module } => {
            let output = run_checked(runner, &CommandSpec::new("lsmod").timeout(timeout)).await?;
            let loaded = output
                .stdout
                .lines()
                .filter_map(|line| line.split_whitespace().next())
                .any(|name| name == module);
            if loaded {
                Ok(())
            } else {
                Err(Error::Precondition(format!("module {} is not loaded", module)))
            }
        }
        Check::Sysctl { key, expected } => {
            let output = run_checked(
                runner,
                &CommandSpec::new("sysctl").args(["-n", key.as_str()]).timeout(timeout),
            )
            .await?;
            let actual = output.stdout.trim();
            if actual == expected {
                Ok(())
            } else {
                Err(Error::Precondition(format!(
                    "{} is {:?}, expected {:?}",
                    key, actual, expected
                )))
            }
        }
        Check::Command { program, args } => {
            run_checked(
                runner,
                &CommandSpec::new(program)
                    .args(args.iter().cloned())
                    .timeout(timeout),
            )
            .await
            .map(|_| ())
        }
        Check::ServiceActive { unit } => {
            run_checked(
                runner,
                &CommandSpec::new("systemctl")
                    .args(["is-active", unit.as_str()])
                    .timeout(timeout),
            )
            .await
            .map(|_| ())
        }
    }
}
