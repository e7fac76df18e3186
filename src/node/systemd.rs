//! systemd unit control and journal access

use std::time::Duration;

use crate::common::Result;
use crate::node::exec::{run_checked, CommandRunner, CommandSpec};

const SYSTEMD_TIMEOUT: Duration = Duration::from_secs(60);

/// `systemctl is-active`; a non-zero exit means inactive, not an error
pub async fn is_active(runner: &dyn CommandRunner, unit: &str) -> Result<bool> {
    let cmd = CommandSpec::new("systemctl")
        .args(["is-active", unit])
        .timeout(SYSTEMD_TIMEOUT);
    let output = runner.run(&cmd).await?;
    Ok(output.success() && output.stdout.trim() == "active")
}

pub async fn restart(runner: &dyn CommandRunner, unit: &str) -> Result<()> {
    let cmd = CommandSpec::new("systemctl")
        .args(["restart", unit])
        .timeout(SYSTEMD_TIMEOUT);
    run_checked(runner, &cmd).await.map(|_| ())
}

/// Journal lines for `unit` from the last `since`
pub async fn journal(runner: &dyn CommandRunner, unit: &str, since: Duration) -> Result<String> {
    let cmd = CommandSpec::new("journalctl")
        .args(["-u", unit, "--no-pager", "--since"])
        .arg(format!("{} seconds ago", since.as_secs()))
        .timeout(SYSTEMD_TIMEOUT);
    let output = run_checked(runner, &cmd).await?;
    Ok(output.stdout)
}
