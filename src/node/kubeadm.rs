//! Orchestrator init/join actions

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::common::{Error, Result};
use crate::credential::JoinCredential;
use crate::node::exec::{run_checked, CommandRunner, CommandSpec};

const KUBEADM: &str = "kubeadm";

/// `kubeadm init` can pull images for several minutes
const INIT_TIMEOUT: Duration = Duration::from_secs(900);
const JOIN_TIMEOUT: Duration = Duration::from_secs(600);

/// Initialize the control plane on this node
pub async fn init(runner: &dyn CommandRunner, pod_network_cidr: &str, advertise: Ipv4Addr) -> Result<()> {
    let cmd = CommandSpec::new(KUBEADM)
        .args([
            "init",
            "--pod-network-cidr",
            pod_network_cidr,
            "--apiserver-advertise-address",
        ])
        .arg(advertise.to_string())
        .timeout(INIT_TIMEOUT);

    run_checked(runner, &cmd)
        .await
        .map(|_| ())
        .map_err(|e| Error::ControlPlaneInit(e.to_string()))
}

/// Mint a join token and return the printed join command
pub async fn token_create(runner: &dyn CommandRunner, ttl: Duration) -> Result<String> {
    let cmd = CommandSpec::new(KUBEADM)
        .args(["token", "create", "--ttl"])
        .arg(ttl_arg(ttl))
        .arg("--print-join-command");

    let output = run_checked(runner, &cmd).await?;
    Ok(output.stdout.trim().to_string())
}

/// Go duration syntax; kubeadm has no day unit
fn ttl_arg(ttl: Duration) -> String {
    let secs = ttl.as_secs();
    if secs > 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Join this node using typed credential arguments
pub async fn join(
    runner: &dyn CommandRunner,
    credential: &JoinCredential,
    fallback_endpoint: Option<&str>,
) -> Result<()> {
    let failed = |reason: String| Error::JoinFailed {
        credential: credential.to_string(),
        reason,
    };

    let args = credential
        .join_args(fallback_endpoint)
        .map_err(|e| failed(e.to_string()))?;
    let cmd = CommandSpec::new(KUBEADM).args(args).timeout(JOIN_TIMEOUT);

    run_checked(runner, &cmd)
        .await
        .map(|_| ())
        .map_err(|e| failed(e.to_string()))
}

/// Copy the admin kubeconfig to where kubectl looks for it
pub async fn install_admin_kubeconfig(source: &Path, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(source, destination).await.map_err(|e| {
        Error::ControlPlaneInit(format!(
            "cannot copy {} to {}: {}",
            source.display(),
            destination.display(),
            e
        ))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::exec::testing::ScriptedRunner;
    use crate::node::exec::CommandOutput;

    const PRINTED: &str = "kubeadm join 10.0.1.15:6443 --token abcdef.0123456789abcdef \
                           --discovery-token-ca-cert-hash sha256:9f86d081884c7d65";

    #[tokio::test]
    async fn test_init_arguments() {
        let runner = ScriptedRunner::new();
        init(&runner, "10.244.0.0/16", Ipv4Addr::new(10, 0, 1, 15))
            .await
            .unwrap();
        assert_eq!(
            runner.calls(),
            ["kubeadm init --pod-network-cidr 10.244.0.0/16 --apiserver-advertise-address 10.0.1.15"]
        );
    }

    #[tokio::test]
    async fn test_init_failure() {
        let runner = ScriptedRunner::new();
        runner.on("kubeadm init", vec![CommandOutput::failed(1, "preflight errors")]);
        let err = init(&runner, "10.244.0.0/16", Ipv4Addr::LOCALHOST)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ControlPlaneInit(_)));
    }

    #[tokio::test]
    async fn test_token_create() {
        let runner = ScriptedRunner::new();
        runner.on("kubeadm token create", vec![CommandOutput::ok(format!("{}\n", PRINTED))]);

        let printed = token_create(&runner, Duration::from_secs(86400)).await.unwrap();
        assert_eq!(printed, PRINTED);
        assert_eq!(
            runner.calls(),
            ["kubeadm token create --ttl 24h --print-join-command"]
        );
    }

    #[test]
    fn test_ttl_arg() {
        assert_eq!(ttl_arg(Duration::from_secs(7 * 86400)), "168h");
        assert_eq!(ttl_arg(Duration::from_secs(90 * 60)), "90m");
        assert_eq!(ttl_arg(Duration::from_secs(45)), "45s");
        assert_eq!(ttl_arg(Duration::ZERO), "0s");
    }

    #[tokio::test]
    async fn test_join_uses_typed_arguments() {
        let runner = ScriptedRunner::new();
        let credential = JoinCredential::parse(PRINTED).unwrap();
        join(&runner, &credential, None).await.unwrap();

        assert_eq!(
            runner.calls(),
            ["kubeadm join 10.0.1.15:6443 --token abcdef.0123456789abcdef \
              --discovery-token-ca-cert-hash sha256:9f86d081884c7d65"]
        );
    }

    #[tokio::test]
    async fn test_join_failure_includes_credential() {
        let runner = ScriptedRunner::new();
        runner.on("kubeadm join", vec![CommandOutput::failed(1, "token expired")]);
        let credential = JoinCredential::parse(PRINTED).unwrap();

        match join(&runner, &credential, None).await.unwrap_err() {
            Error::JoinFailed { credential: shown, reason } => {
                assert!(shown.contains("--token abcdef.0123456789abcdef"));
                assert!(reason.contains("token expired"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_join_without_endpoint_uses_fallback() {
        let runner = ScriptedRunner::new();
        let credential = JoinCredential::parse(
            "join --token abcdef.0123456789abcdef --discovery-token-ca-cert-hash sha256:ab",
        )
        .unwrap();

        assert!(join(&runner, &credential, None).await.is_err());
        assert!(runner.calls().is_empty());

        join(&runner, &credential, Some("cp.internal:6443")).await.unwrap();
        assert!(runner.calls()[0].starts_with("kubeadm join cp.internal:6443 --token"));
    }

    #[tokio::test]
    async fn test_install_admin_kubeconfig() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("admin.conf");
        let destination = dir.path().join("home/.kube/config");
        std::fs::write(&source, "apiVersion: v1\n").unwrap();

        install_admin_kubeconfig(&source, &destination).await.unwrap();
        assert_eq!(std::fs::read_to_string(&destination).unwrap(), "apiVersion: v1\n");

        let missing = dir.path().join("missing.conf");
        assert!(install_admin_kubeconfig(&missing, &destination).await.is_err());
    }
}
