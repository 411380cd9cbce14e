use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

/// Executes one read-only external query and returns its trimmed stdout.
pub trait CommandRunner: Send + Sync + 'static {
    fn run(&self, args: Vec<String>, timeout: Duration) -> BoxFuture<'static, CoreResult<String>>;
}

pub struct KubectlRunner {
    binary: String,
}

impl KubectlRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl CommandRunner for KubectlRunner {
    fn run(&self, args: Vec<String>, timeout: Duration) -> BoxFuture<'static, CoreResult<String>> {
        let binary = self.binary.clone();
        async move { run_with_timeout(&binary, &args, timeout).await }.boxed()
    }
}

/// Runs `binary args..` to completion. On timeout the output future is
/// dropped, which kills the child (`kill_on_drop`).
pub async fn run_with_timeout(
    binary: &str,
    args: &[String],
    timeout: Duration,
) -> CoreResult<String> {
    let command = format!("{} {}", binary, args.join(" "));
    debug!("executing: {}", command);

    let child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CoreError::ExternalExecution {
            command: command.clone(),
            stderr: e.to_string(),
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(CoreError::ExternalExecution {
                command,
                stderr: e.to_string(),
            });
        }
        Err(_) => {
            warn!("command timed out after {:?}: {}", timeout, command);
            return Err(CoreError::Timeout {
                command,
                timeout_ms: timeout.as_millis() as u64,
            });
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        warn!("command failed ({}): {}", output.status, command);
        return Err(CoreError::ExternalExecution { command, stderr });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
