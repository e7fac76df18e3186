//! Joiner role
//!
//! Polls the shared key until a grammar-valid credential appears, joins the
//! cluster exactly once with it, then checks the cluster agent came up.

use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use crate::channel::{ChannelKey, CoordinationChannel};
use crate::common::{
    retry_until, Attempt, Config, Error, NodeRole, Phase, PhaseLog, Result, RetryPolicy,
};
use crate::credential::JoinCredential;
use crate::node::bootstrap::run_bootstrap;
use crate::node::exec::CommandRunner;
use crate::node::marker::BootstrapMarker;
use crate::node::{kubeadm, systemd};

/// Journal lines that show the node registered with the API server
pub const REGISTRATION_MARKERS: &[&str] = &["Successfully registered node", "node registered"];

/// Joiner progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPhase {
    Bootstrapping,
    RuntimeReady,
    AwaitingCredential,
    Joining,
    Joined,
    JoinFailed,
}

impl JoinPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinPhase::Bootstrapping => "bootstrapping",
            JoinPhase::RuntimeReady => "runtime-ready",
            JoinPhase::AwaitingCredential => "awaiting-credential",
            JoinPhase::Joining => "joining",
            JoinPhase::Joined => "joined",
            JoinPhase::JoinFailed => "join-failed",
        }
    }
}

impl std::fmt::Display for JoinPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of membership verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    /// The agent needed its one restart
    pub restarted: bool,
    /// A registration line was found in the journal
    pub registration_seen: bool,
}

pub struct Joiner {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    channel: Arc<dyn CoordinationChannel>,
    key: ChannelKey,
    log: PhaseLog,
    phase: JoinPhase,
}

impl Joiner {
    pub fn new(
        config: Config,
        runner: Arc<dyn CommandRunner>,
        channel: Arc<dyn CoordinationChannel>,
    ) -> Result<Self> {
        let key = ChannelKey::from_config(&config.channel)?;
        let log = PhaseLog::new(config.node_id.clone(), NodeRole::Joiner);
        Ok(Self {
            config,
            runner,
            channel,
            key,
            log,
            phase: JoinPhase::Bootstrapping,
        })
    }

    pub fn phase(&self) -> JoinPhase {
        self.phase
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    fn transition(&mut self, next: JoinPhase) {
        tracing::debug!(from = %self.phase, to = %next, "Joiner phase change");
        self.phase = next;
    }

    fn fail<T>(&self, phase: Phase, err: Error) -> Result<T> {
        self.log.error(phase, &err.to_string());
        Err(err)
    }

    pub async fn bootstrap_local(&mut self) -> Result<()> {
        self.transition(JoinPhase::Bootstrapping);
        run_bootstrap(
            self.runner.as_ref(),
            &self.config.bootstrap.steps,
            self.config.bootstrap.command_timeout,
            &self.log,
        )
        .await?;
        self.transition(JoinPhase::RuntimeReady);
        Ok(())
    }

    /// Poll the shared key until it holds a valid credential.
    ///
    /// Lookup errors, a missing key, the placeholder and malformed values all
    /// count as "not yet". Reads never modify the store.
    pub async fn await_join_credential(&mut self, policy: &RetryPolicy) -> Result<JoinCredential> {
        self.transition(JoinPhase::AwaitingCredential);
        self.log.info(
            Phase::AwaitCredential,
            &format!(
                "Waiting for join credential at {} via {} (up to {} attempts)",
                self.key,
                self.channel.describe(),
                policy.max_attempts
            ),
        );

        let channel = self.channel.as_ref();
        let key = &self.key;
        let placeholder = self.config.channel.placeholder.as_str();
        let found = retry_until(policy, "await-credential", |_| async move {
            match channel.read(key).await {
                Ok(Some(value)) => match JoinCredential::parse_with_sentinel(&value, placeholder) {
                    Ok(credential) => Attempt::Ready(credential),
                    Err(e) => Attempt::NotReady(e.to_string()),
                },
                Ok(None) => Attempt::NotReady(format!("{} not found", key)),
                Err(e) if e.is_retryable() => Attempt::NotReady(e.to_string()),
                Err(e) => Attempt::NotReady(format!("{} (will not clear without operator action)", e)),
            }
        })
        .await;

        match found {
            Ok(credential) => {
                self.log.success(
                    Phase::AwaitCredential,
                    &format!("Join credential found (token {:?})", credential.token()),
                );
                Ok(credential)
            }
            Err(e) => self.fail(Phase::AwaitCredential, e),
        }
    }

    /// Run the join action once
    pub async fn join(&mut self, credential: &JoinCredential) -> Result<()> {
        self.transition(JoinPhase::Joining);
        self.log.info(Phase::Join, "Joining cluster");

        let fallback = self.config.cluster.control_plane_endpoint.as_deref();
        match kubeadm::join(self.runner.as_ref(), credential, fallback).await {
            Ok(()) => {
                self.transition(JoinPhase::Joined);
                self.log.success(Phase::Join, "Joined cluster");
                Ok(())
            }
            Err(e) => {
                self.transition(JoinPhase::JoinFailed);
                self.fail(Phase::Join, e)
            }
        }
    }

    /// Check the cluster agent after a settle delay.
    ///
    /// An inactive agent gets exactly one restart. A missing registration
    /// line is only a warning.
    pub async fn verify_membership(&self, settle_time: Duration) -> Result<Membership> {
        let unit = self.config.cluster.kubelet_unit.as_str();
        let runner = self.runner.as_ref();

        self.log.info(
            Phase::Verify,
            &format!("Waiting {}s before checking {}", settle_time.as_secs(), unit),
        );
        tokio::time::sleep(settle_time).await;

        let mut restarted = false;
        if !self.agent_active(unit).await? {
            self.log
                .warn(Phase::Verify, &format!("{} is not active, restarting once", unit));
            if let Err(e) = systemd::restart(runner, unit).await {
                return self.fail(Phase::Verify, Error::Membership(e.to_string()));
            }
            restarted = true;

            if !self.agent_active(unit).await? {
                return self.fail(
                    Phase::Verify,
                    Error::Membership(format!("{} still inactive after restart", unit)),
                );
            }
        }

        let window = self.config.cluster.registration_window;
        let registration_seen = match systemd::journal(runner, unit, window).await {
            Ok(lines) => lines
                .lines()
                .any(|line| REGISTRATION_MARKERS.iter().any(|m| line.contains(m))),
            Err(e) => {
                let err = Error::Observation(format!("cannot read {} journal: {}", unit, e));
                self.log.warn(Phase::Verify, &err.to_string());
                false
            }
        };

        if registration_seen {
            self.log.success(Phase::Verify, "Node registration confirmed");
        } else {
            self.log.warn(
                Phase::Verify,
                "No registration line in the agent journal, verify from control plane instead",
            );
        }

        Ok(Membership {
            restarted,
            registration_seen,
        })
    }

    async fn agent_active(&self, unit: &str) -> Result<bool> {
        match systemd::is_active(self.runner.as_ref(), unit).await {
            Ok(active) => Ok(active),
            Err(e) => self.fail(Phase::Verify, Error::Membership(e.to_string())),
        }
    }

    /// Full joiner run; writes the marker on success
    pub async fn run(&mut self) -> Result<Membership> {
        let span = self.log.span();
        self.run_phases().instrument(span).await
    }

    async fn run_phases(&mut self) -> Result<Membership> {
        self.log.info(
            Phase::Bootstrap,
            &format!("Starting joiner for {} via {}", self.key, self.channel.describe()),
        );

        let retry = self.config.retry.clone();
        self.bootstrap_local().await?;
        let credential = self
            .await_join_credential(&RetryPolicy::from_settings(&retry.credential, &retry))
            .await?;
        self.join(&credential).await?;
        let membership = self.verify_membership(retry.settle_time).await?;

        let marker = BootstrapMarker::new(NodeRole::Joiner, self.log.node_id(), self.phase.as_str());
        if let Err(e) = marker.write(&self.config.paths.marker).await {
            return self.fail(Phase::Marker, e);
        }
        self.log.success(
            Phase::Marker,
            &format!("Bootstrap marker written to {}", self.config.paths.marker.display()),
        );

        Ok(membership)
    }
}
