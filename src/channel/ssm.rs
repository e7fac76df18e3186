//! AWS SSM Parameter Store channel, driven through the `aws` CLI
//!
//! Values are written as `SecureString` with `--overwrite`; reads request
//! decryption. The parameter value is always a single argv element.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{ChannelKey, CoordinationChannel};
use crate::common::{Error, Result};
use crate::node::exec::{CommandRunner, CommandSpec};

const NOT_FOUND_MARKER: &str = "ParameterNotFound";

pub struct SsmChannel {
    runner: Arc<dyn CommandRunner>,
    region: Option<String>,
    kms_key_id: Option<String>,
    timeout: Duration,
}

impl SsmChannel {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        region: Option<String>,
        kms_key_id: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            region,
            kms_key_id,
            timeout,
        }
    }

    fn base(&self, action: &str) -> CommandSpec {
        let mut cmd = CommandSpec::new("aws")
            .args(["ssm", action])
            .timeout(self.timeout);
        if let Some(region) = &self.region {
            cmd = cmd.args(["--region", region.as_str()]);
        }
        cmd
    }

    fn get_command(&self, key: &ChannelKey) -> CommandSpec {
        self.base("get-parameter").args([
            "--name".to_string(),
            key.to_string(),
            "--with-decryption".to_string(),
            "--query".to_string(),
            "Parameter.Value".to_string(),
            "--output".to_string(),
            "text".to_string(),
        ])
    }

    fn put_command(&self, key: &ChannelKey, value: &str) -> CommandSpec {
        let mut cmd = self.base("put-parameter").args([
            "--name".to_string(),
            key.to_string(),
            "--value".to_string(),
            value.to_string(),
            "--type".to_string(),
            "SecureString".to_string(),
            "--overwrite".to_string(),
        ]);
        if let Some(kms) = &self.kms_key_id {
            cmd = cmd.args(["--key-id", kms.as_str()]);
        }
        cmd
    }
}

#[async_trait]
impl CoordinationChannel for SsmChannel {
    async fn read(&self, key: &ChannelKey) -> Result<Option<String>> {
        let output = self.runner.run(&self.get_command(key)).await?;
        if output.success() {
            // the CLI appends a newline to text output
            return Ok(Some(output.stdout.trim_end_matches(['\n', '\r']).to_string()));
        }
        if output.stderr.contains(NOT_FOUND_MARKER) {
            return Ok(None);
        }
        Err(Error::Channel(format!(
            "aws ssm get-parameter {} failed: {}",
            key,
            output.stderr.trim()
        )))
    }

    async fn write(&self, key: &ChannelKey, value: &str) -> Result<()> {
        let output = self.runner.run(&self.put_command(key, value)).await?;
        if output.success() {
            Ok(())
        } else {
            Err(Error::Channel(format!(
                "aws ssm put-parameter {} failed: {}",
                key,
                output.stderr.trim()
            )))
        }
    }

    fn describe(&self) -> String {
        match &self.region {
            Some(region) => format!("ssm({})", region),
            None => "ssm".to_string(),
        }
    }
}
