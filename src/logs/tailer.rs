use std::io;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// Starts the long-running process whose output is one log stream.
///
/// The child must have piped stdout and stderr. It is killed when the stream
/// is torn down, so it should be spawned with `kill_on_drop`.
pub trait LogTailer: Send + Sync + 'static {
    fn spawn(&self, unit: &str) -> io::Result<Child>;
}

/// `kubectl logs -f <unit>`
pub struct KubectlLogTailer {
    binary: String,
}

impl KubectlLogTailer {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl LogTailer for KubectlLogTailer {
    fn spawn(&self, unit: &str) -> io::Result<Child> {
        debug!("tailing logs: {} logs -f {}", self.binary, unit);
        Command::new(&self.binary)
            .args(["logs", "-f", unit])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}
