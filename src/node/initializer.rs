//! Initializer role
//!
//! Brings up the control plane on this node and publishes the join
//! credential. Publication is the last step and only happens after the local
//! API server answers, so the shared key goes from the placeholder straight
//! to a usable credential.

use chrono::Utc;
use std::net::Ipv4Addr;
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
use crate::node::metadata::MetadataClient;
use crate::node::{kubeadm, kubectl};

/// Metadata lookups are a single round trip on the local link
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Initializer progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    Bootstrapping,
    RuntimeReady,
    ControlPlaneInitializing,
    ControlPlaneReady,
    CredentialPublished,
    /// Control plane is up; only the shared store write failed
    PublishFailed,
}

impl InitPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitPhase::Bootstrapping => "bootstrapping",
            InitPhase::RuntimeReady => "runtime-ready",
            InitPhase::ControlPlaneInitializing => "control-plane-initializing",
            InitPhase::ControlPlaneReady => "control-plane-ready",
            InitPhase::CredentialPublished => "credential-published",
            InitPhase::PublishFailed => "publish-failed",
        }
    }

    /// Local control plane is initialized and answering
    pub fn control_plane_ready(&self) -> bool {
        matches!(
            self,
            InitPhase::ControlPlaneReady | InitPhase::CredentialPublished | InitPhase::PublishFailed
        )
    }
}

impl std::fmt::Display for InitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Initializer {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    channel: Arc<dyn CoordinationChannel>,
    key: ChannelKey,
    log: PhaseLog,
    phase: InitPhase,
}

impl Initializer {
    pub fn new(
        config: Config,
        runner: Arc<dyn CommandRunner>,
        channel: Arc<dyn CoordinationChannel>,
    ) -> Result<Self> {
        let key = ChannelKey::from_config(&config.channel)?;
        let log = PhaseLog::new(config.node_id.clone(), NodeRole::Initializer);
        Ok(Self {
            config,
            runner,
            channel,
            key,
            log,
            phase: InitPhase::Bootstrapping,
        })
    }

    pub fn phase(&self) -> InitPhase {
        self.phase
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    fn transition(&mut self, next: InitPhase) {
        tracing::debug!(from = %self.phase, to = %next, "Initializer phase change");
        self.phase = next;
    }

    /// Fail with a logged error tagged with `phase`
    fn fail<T>(&self, phase: Phase, err: Error) -> Result<T> {
        self.log.error(phase, &err.to_string());
        Err(err)
    }

    /// Log a best-effort failure and keep going
    fn tolerate(&self, phase: Phase, err: Error) {
        debug_assert!(!err.is_fatal());
        self.log.warn(phase, &format!("{}, continuing", err));
    }

    pub async fn bootstrap_local(&mut self) -> Result<()> {
        self.transition(InitPhase::Bootstrapping);
        run_bootstrap(
            self.runner.as_ref(),
            &self.config.bootstrap.steps,
            self.config.bootstrap.command_timeout,
            &self.log,
        )
        .await?;
        self.transition(InitPhase::RuntimeReady);
        Ok(())
    }

    /// Configured address, or the private IPv4 from the metadata service
    pub async fn resolve_advertise_address(&self) -> Result<Ipv4Addr> {
        if let Some(address) = self.config.cluster.advertise_address {
            self.log.info(
                Phase::Metadata,
                &format!("Using configured advertise address {}", address),
            );
            return Ok(address);
        }

        let client = MetadataClient::new(&self.config.cluster.metadata_endpoint, METADATA_TIMEOUT)?;
        match client.local_ipv4().await {
            Ok(address) => {
                self.log
                    .success(Phase::Metadata, &format!("Private IPv4 is {}", address));
                Ok(address)
            }
            Err(e) => self.fail(Phase::Metadata, e),
        }
    }

    /// `kubeadm init`, then install the admin kubeconfig
    pub async fn initialize_control_plane(&mut self) -> Result<Ipv4Addr> {
        self.transition(InitPhase::ControlPlaneInitializing);
        let address = self.resolve_advertise_address().await?;

        self.log.info(
            Phase::ControlPlane,
            &format!(
                "Initializing control plane (advertise {}, pod network {})",
                address, self.config.cluster.pod_network_cidr
            ),
        );

        if let Err(e) = kubeadm::init(
            self.runner.as_ref(),
            &self.config.cluster.pod_network_cidr,
            address,
        )
        .await
        {
            return self.fail(Phase::ControlPlane, e);
        }

        if let Err(e) = kubeadm::install_admin_kubeconfig(
            &self.config.paths.admin_kubeconfig,
            &self.config.paths.kubeconfig,
        )
        .await
        {
            return self.fail(Phase::ControlPlane, e);
        }

        self.log.success(Phase::ControlPlane, "Control plane initialized");
        Ok(address)
    }

    /// Poll `kubectl get nodes` until the API server answers
    pub async fn await_local_api_ready(&mut self, policy: &RetryPolicy) -> Result<()> {
        self.log.info(
            Phase::ApiReady,
            &format!(
                "Waiting for API server (up to {} attempts)",
                policy.max_attempts
            ),
        );

        let runner = self.runner.as_ref();
        let kubeconfig = self.config.paths.admin_kubeconfig.as_path();
        let ready = retry_until(policy, "api-ready", |_| async move {
            Attempt::from(kubectl::get_nodes(runner, kubeconfig).await)
        })
        .await;

        match ready {
            Ok(_) => {
                self.transition(InitPhase::ControlPlaneReady);
                self.log.success(Phase::ApiReady, "API server is answering");
                Ok(())
            }
            Err(e) => self.fail(Phase::ApiReady, e),
        }
    }

    /// Apply the pod network manifest and wait for its pods. Never fatal.
    pub async fn install_network_overlay(&self, policy: &RetryPolicy) {
        let cluster = &self.config.cluster;
        let kubeconfig = self.config.paths.admin_kubeconfig.as_path();
        let runner = self.runner.as_ref();

        if let Err(e) = kubectl::apply(runner, kubeconfig, &cluster.overlay_manifest).await {
            self.tolerate(
                Phase::Overlay,
                Error::Observation(format!("network overlay apply failed: {}", e)),
            );
            return;
        }
        self.log.info(Phase::Overlay, "Network overlay manifest applied");

        let namespace = cluster.overlay_namespace.as_str();
        let selector = cluster.overlay_selector.as_str();
        let wanted = cluster.overlay_min_running;
        let ready = retry_until(policy, "overlay-ready", |_| async move {
            match kubectl::running_pods(runner, kubeconfig, namespace, selector).await {
                Ok(running) if running >= wanted => Attempt::Ready(running),
                Ok(running) => Attempt::NotReady(format!("{}/{} pods running", running, wanted)),
                Err(e) => Attempt::NotReady(e.to_string()),
            }
        })
        .await;

        match ready {
            Ok(running) => self.log.success(
                Phase::Overlay,
                &format!("Network overlay running ({} pods)", running),
            ),
            Err(e) => self.tolerate(
                Phase::Overlay,
                Error::Observation(format!("network overlay not confirmed: {}", e)),
            ),
        }
    }

    /// Mint a credential and write it to the shared key
    pub async fn publish_join_credential(&mut self, ttl: Duration) -> Result<JoinCredential> {
        if !self.phase.control_plane_ready() {
            return self.fail(
                Phase::Publish,
                Error::Precondition(format!(
                    "cannot publish before the control plane is ready (phase: {})",
                    self.phase
                )),
            );
        }

        let issued_at = Utc::now();
        let printed = match kubeadm::token_create(self.runner.as_ref(), ttl).await {
            Ok(printed) => printed,
            Err(e) => return self.fail(Phase::Publish, e),
        };

        let credential =
            match JoinCredential::parse_with_sentinel(&printed, &self.config.channel.placeholder) {
                Ok(credential) => credential.with_expiry(issued_at, ttl),
                Err(e) => return self.fail(Phase::Publish, e),
            };

        if self.config.cluster.refuse_overwrite {
            self.guard_single_initializer().await?;
        }

        if let Err(e) = self.channel.write(&self.key, &credential.to_string()).await {
            self.transition(InitPhase::PublishFailed);
            return self.fail(
                Phase::Publish,
                Error::Propagation {
                    key: self.key.to_string(),
                    reason: e.to_string(),
                },
            );
        }

        self.transition(InitPhase::CredentialPublished);
        self.log.success(
            Phase::Publish,
            &format!(
                "Join credential published to {} via {} (token {:?}, expires {})",
                self.key,
                self.channel.describe(),
                credential.token(),
                credential
                    .expires_at()
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string())
            ),
        );
        Ok(credential)
    }

    /// Refuse to replace a credential another initializer already published
    async fn guard_single_initializer(&mut self) -> Result<()> {
        let current = match self.channel.read(&self.key).await {
            Ok(current) => current,
            Err(e) => {
                self.transition(InitPhase::PublishFailed);
                return self.fail(
                    Phase::Publish,
                    Error::Propagation {
                        key: self.key.to_string(),
                        reason: e.to_string(),
                    },
                );
            }
        };

        let taken = current.is_some_and(|value| {
            JoinCredential::parse_with_sentinel(&value, &self.config.channel.placeholder).is_ok()
        });
        if taken {
            return self.fail(Phase::Publish, Error::AlreadyPublished(self.key.to_string()));
        }
        Ok(())
    }

    /// Full initializer run; writes the marker on success
    pub async fn run(&mut self) -> Result<JoinCredential> {
        let span = self.log.span();
        self.run_phases().instrument(span).await
    }

    async fn run_phases(&mut self) -> Result<JoinCredential> {
        self.log.info(
            Phase::Bootstrap,
            &format!("Starting initializer for {} via {}", self.key, self.channel.describe()),
        );

        let retry = self.config.retry.clone();
        self.bootstrap_local().await?;
        self.initialize_control_plane().await?;
        self.await_local_api_ready(&RetryPolicy::from_settings(&retry.api_ready, &retry))
            .await?;
        self.install_network_overlay(&RetryPolicy::from_settings(&retry.overlay_ready, &retry))
            .await;
        let credential = self
            .publish_join_credential(self.config.cluster.token_ttl)
            .await?;

        let marker = BootstrapMarker::new(NodeRole::Initializer, self.log.node_id(), self.phase.as_str());
        if let Err(e) = marker.write(&self.config.paths.marker).await {
            return self.fail(Phase::Marker, e);
        }
        self.log.success(
            Phase::Marker,
            &format!("Bootstrap marker written to {}", self.config.paths.marker.display()),
        );

        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{seed_placeholder, MemoryChannel, SENTINEL_PLACEHOLDER};
    use crate::node::exec::testing::ScriptedRunner;
    use crate::node::exec::CommandOutput;
    use async_trait::async_trait;
    use tempfile::TempDir;

    const PRINTED: &str = "kubeadm join 10.0.1.15:6443 --token abcdef.0123456789abcdef \
                           --discovery-token-ca-cert-hash sha256:9f86d081884c7d65";

    struct Fixture {
        dir: TempDir,
        runner: Arc<ScriptedRunner>,
        channel: Arc<MemoryChannel>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let runner = Arc::new(ScriptedRunner::new());
            runner.on("lsmod", vec![CommandOutput::ok("overlay 1 0\nbr_netfilter 1 0\n")]);
            runner.on("sysctl -n", vec![CommandOutput::ok("1")]);
            runner.on("kubectl --kubeconfig", vec![CommandOutput::ok("cp-1 Ready")]);
            runner.on(
                &format!("kubectl --kubeconfig {} get pods", dir.path().join("admin.conf").display()),
                vec![CommandOutput::ok("flannel-a 1/1 Running 0 1m\n")],
            );
            runner.on("kubeadm token create", vec![CommandOutput::ok(PRINTED)]);
            Self {
                dir,
                runner,
                channel: Arc::new(MemoryChannel::new()),
            }
        }

        fn config(&self) -> Config {
            let mut config = Config::default();
            config.node_id = "cp-1".to_string();
            config.cluster.advertise_address = Some(Ipv4Addr::new(10, 0, 1, 15));
            config.paths.admin_kubeconfig = self.dir.path().join("admin.conf");
            config.paths.kubeconfig = self.dir.path().join("kube/config");
            config.paths.marker = self.dir.path().join("bootstrap-complete");
            std::fs::write(&config.paths.admin_kubeconfig, "apiVersion: v1\n").unwrap();
            config
        }

        fn initializer(&self, config: Config) -> Initializer {
            Initializer::new(config, self.runner.clone(), self.channel.clone()).unwrap()
        }
    }

    fn ready_policy() -> RetryPolicy {
        RetryPolicy::fixed(3, Duration::from_secs(5))
    }

    async fn ready(init: &mut Initializer) {
        init.await_local_api_ready(&ready_policy()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_publishes_and_writes_marker() {
        let fx = Fixture::new();
        let config = fx.config();
        let marker_path = config.paths.marker.clone();
        let mut init = fx.initializer(config);

        seed_placeholder(fx.channel.as_ref(), init.key(), SENTINEL_PLACEHOLDER)
            .await
            .unwrap();
        init.run().await.unwrap();

        assert_eq!(init.phase(), InitPhase::CredentialPublished);
        let stored = fx.channel.read(init.key()).await.unwrap().unwrap();
        assert_eq!(JoinCredential::parse(&stored).unwrap(), JoinCredential::parse(PRINTED).unwrap());

        let marker = BootstrapMarker::read(&marker_path).await.unwrap().unwrap();
        assert_eq!(marker.role, NodeRole::Initializer);
        assert_eq!(marker.phase, "credential-published");

        let calls = fx.runner.calls();
        let init_at = calls.iter().position(|c| c.starts_with("kubeadm init")).unwrap();
        let token_at = calls
            .iter()
            .position(|c| c.starts_with("kubeadm token create"))
            .unwrap();
        assert!(init_at < token_at);
    }

    #[tokio::test]
    async fn test_publish_requires_ready_control_plane() {
        let fx = Fixture::new();
        let mut init = fx.initializer(fx.config());

        let err = init
            .publish_join_credential(Duration::from_secs(3600))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert_eq!(fx.runner.count("kubeadm token create"), 0);
        assert_eq!(fx.channel.writes(), 0);
    }

    #[tokio::test]
    async fn test_invalid_output_writes_nothing() {
        let fx = Fixture::new();
        fx.runner.on(
            "kubeadm token create",
            vec![CommandOutput::ok("W1018 some warning\nnot a join command")],
        );
        let mut init = fx.initializer(fx.config());
        ready(&mut init).await;

        let err = init
            .publish_join_credential(Duration::from_secs(3600))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCredential(_)));
        assert_eq!(fx.channel.writes(), 0);
        assert_eq!(init.phase(), InitPhase::ControlPlaneReady);
    }

    struct BrokenChannel;

    #[async_trait]
    impl CoordinationChannel for BrokenChannel {
        async fn read(&self, _key: &ChannelKey) -> Result<Option<String>> {
            Err(Error::Channel("store unreachable".into()))
        }

        async fn write(&self, _key: &ChannelKey, _value: &str) -> Result<()> {
            Err(Error::Channel("store unreachable".into()))
        }

        fn describe(&self) -> String {
            "broken".to_string()
        }
    }

    #[tokio::test]
    async fn test_propagation_failure_keeps_local_state() {
        let fx = Fixture::new();
        let mut init =
            Initializer::new(fx.config(), fx.runner.clone(), Arc::new(BrokenChannel)).unwrap();
        ready(&mut init).await;

        let err = init
            .publish_join_credential(Duration::from_secs(3600))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Propagation { .. }));
        assert_eq!(err.kind(), crate::common::ErrorKind::Propagation);
        assert_eq!(init.phase(), InitPhase::PublishFailed);
        assert!(init.phase().control_plane_ready());
    }

    #[tokio::test]
    async fn test_republish_overwrites_by_default() {
        let fx = Fixture::new();
        let mut init = fx.initializer(fx.config());
        ready(&mut init).await;

        init.publish_join_credential(Duration::from_secs(3600)).await.unwrap();
        let second = "kubeadm join 10.0.1.15:6443 --token zyxwvu.0123456789abcdef \
                      --discovery-token-ca-cert-hash sha256:9f86d081884c7d65";
        fx.runner.on("kubeadm token create", vec![CommandOutput::ok(second)]);
        init.publish_join_credential(Duration::from_secs(3600)).await.unwrap();

        let stored = fx.channel.read(init.key()).await.unwrap().unwrap();
        assert!(stored.contains("zyxwvu."));
        assert_eq!(fx.channel.writes(), 2);
    }

    #[tokio::test]
    async fn test_overwrite_guard() {
        let fx = Fixture::new();
        let mut config = fx.config();
        config.cluster.refuse_overwrite = true;
        let mut init = fx.initializer(config);
        ready(&mut init).await;

        // placeholder does not count as published
        seed_placeholder(fx.channel.as_ref(), init.key(), SENTINEL_PLACEHOLDER)
            .await
            .unwrap();
        init.publish_join_credential(Duration::from_secs(3600)).await.unwrap();

        let err = init
            .publish_join_credential(Duration::from_secs(3600))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyPublished(_)));
        assert_eq!(fx.channel.writes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_api_never_ready() {
        let fx = Fixture::new();
        fx.runner.on(
            "kubectl --kubeconfig",
            vec![CommandOutput::failed(1, "connection refused")],
        );
        let mut init = fx.initializer(fx.config());

        let err = init.await_local_api_ready(&ready_policy()).await.unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(fx.runner.count("kubectl"), 3);
        assert!(!init.phase().control_plane_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlay_failures_are_not_fatal() {
        let fx = Fixture::new();
        fx.runner.on(
            "kubectl --kubeconfig",
            vec![CommandOutput::failed(1, "unable to recognize manifest")],
        );
        let init = fx.initializer(fx.config());

        init.install_network_overlay(&RetryPolicy::fixed(2, Duration::from_secs(10)))
            .await;
        // apply failed, so no readiness polling
        assert_eq!(fx.runner.count("kubectl"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlay_waits_for_running_pods() {
        let fx = Fixture::new();
        fx.runner.on(
            "kubectl --kubeconfig",
            vec![CommandOutput::ok("")],
        );
        fx.runner.on(
            &format!(
                "kubectl --kubeconfig {} get pods",
                fx.dir.path().join("admin.conf").display()
            ),
            vec![
                CommandOutput::ok("flannel-a 0/1 Init:0/2 0 5s\n"),
                CommandOutput::ok("flannel-a 1/1 Running 0 15s\n"),
            ],
        );
        let init = fx.initializer(fx.config());

        init.install_network_overlay(&RetryPolicy::fixed(5, Duration::from_secs(10)))
            .await;
        assert_eq!(fx.runner.count("kubectl --kubeconfig"), 3);
    }

    #[tokio::test]
    async fn test_control_plane_init_failure() {
        let fx = Fixture::new();
        fx.runner.on("kubeadm init", vec![CommandOutput::failed(1, "port 6443 in use")]);
        let mut init = fx.initializer(fx.config());

        let err = init.initialize_control_plane().await.unwrap_err();
        assert!(matches!(err, Error::ControlPlaneInit(_)));
        assert_eq!(init.phase(), InitPhase::ControlPlaneInitializing);
    }
}
