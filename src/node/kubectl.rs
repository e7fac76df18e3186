//! Cluster API probes and manifest application

use std::path::Path;
use std::time::Duration;

use crate::common::Result;
use crate::node::exec::{run_checked, CommandRunner, CommandSpec};

const KUBECTL: &str = "kubectl";
const KUBECTL_TIMEOUT: Duration = Duration::from_secs(60);

fn kubectl(kubeconfig: &Path) -> CommandSpec {
    CommandSpec::new(KUBECTL)
        .arg("--kubeconfig")
        .arg(kubeconfig.display().to_string())
        .timeout(KUBECTL_TIMEOUT)
}

/// `kubectl get nodes`; succeeds once the API server answers
pub async fn get_nodes(runner: &dyn CommandRunner, kubeconfig: &Path) -> Result<String> {
    let output = run_checked(runner, &kubectl(kubeconfig).args(["get", "nodes"])).await?;
    Ok(output.stdout)
}

pub async fn apply(runner: &dyn CommandRunner, kubeconfig: &Path, manifest: &str) -> Result<()> {
    run_checked(runner, &kubectl(kubeconfig).args(["apply", "-f", manifest]))
        .await
        .map(|_| ())
}

/// Number of pods in `Running` phase matching `selector`
pub async fn running_pods(
    runner: &dyn CommandRunner,
    kubeconfig: &Path,
    namespace: &str,
    selector: &str,
) -> Result<usize> {
    let cmd = kubectl(kubeconfig).args([
        "get",
        "pods",
        "-n",
        namespace,
        "-l",
        selector,
        "--no-headers",
    ]);
    let output = run_checked(runner, &cmd).await?;
    Ok(count_running(&output.stdout))
}

/// Count rows whose STATUS column is `Running`
fn count_running(table: &str) -> usize {
    table
        .lines()
        .filter(|line| line.split_whitespace().nth(2) == Some("Running"))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::exec::testing::ScriptedRunner;
    use crate::node::exec::CommandOutput;

    #[test]
    fn test_count_running() {
        let table = "\
kube-flannel-ds-7xk2p   1/1   Running             0     2m
kube-flannel-ds-9qv4d   0/1   Init:0/2            0     10s
kube-flannel-ds-zzt8c   0/1   CrashLoopBackOff    3     1m
";
        assert_eq!(count_running(table), 1);
        assert_eq!(count_running(""), 0);
        assert_eq!(count_running("No resources found in kube-flannel namespace."), 0);
    }

    #[tokio::test]
    async fn test_commands_carry_kubeconfig() {
        let runner = ScriptedRunner::new();
        runner.on(
            "kubectl --kubeconfig /etc/kubernetes/admin.conf get pods",
            vec![CommandOutput::ok("flannel-a 1/1 Running 0 1m\n")],
        );
        let kubeconfig = Path::new("/etc/kubernetes/admin.conf");

        get_nodes(&runner, kubeconfig).await.unwrap();
        apply(&runner, kubeconfig, "https://example.invalid/overlay.yml")
            .await
            .unwrap();
        let running = running_pods(&runner, kubeconfig, "kube-flannel", "app=flannel")
            .await
            .unwrap();

        assert_eq!(running, 1);
        assert_eq!(
            runner.calls(),
            [
                "kubectl --kubeconfig /etc/kubernetes/admin.conf get nodes",
                "kubectl --kubeconfig /etc/kubernetes/admin.conf apply -f https://example.invalid/overlay.yml",
                "kubectl --kubeconfig /etc/kubernetes/admin.conf get pods -n kube-flannel -l app=flannel --no-headers",
            ]
        );
    }

    #[tokio::test]
    async fn test_api_down() {
        let runner = ScriptedRunner::new();
        runner.on(
            "kubectl",
            vec![CommandOutput::failed(1, "connection refused")],
        );
        assert!(get_nodes(&runner, Path::new("/tmp/k")).await.is_err());
    }
}
