//! Fire-and-forget provisioning phases.
//!
//! A phase is a configured shell command run in the working area of the
//! active cluster. Its only contract is to write progress to the phase log
//! and exit with a code; everything else happens when it exits.

use chrono::Utc;
use serde::Serialize;
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::coordinator::Coordinator;
use crate::error::{CoreError, CoreResult};
use crate::helpers::lock;
use crate::registry::record::{PhaseLogPointer, PhaseStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Launch {
    /// The status cache says this phase already finished; nothing was run.
    #[serde(rename_all = "camelCase")]
    AlreadyCompleted {
        cluster_tag: String,
        phase: String,
        status: PhaseStatus,
    },
    #[serde(rename_all = "camelCase")]
    Started {
        cluster_tag: String,
        phase: String,
        log: PhaseLogPointer,
        pid: Option<u32>,
    },
}

impl Coordinator {
    /// Starts `phase` against the active cluster and returns once the script
    /// is running. Unless `force` is set, a phase cached as completed is not
    /// run again.
    pub async fn launch_phase(self: &Arc<Self>, phase: &str, force: bool) -> CoreResult<Launch> {
        let script = self
            .config()
            .phase_script(phase)
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown phase {:?}", phase)))?
            .to_string();
        let tag = self
            .registry
            .get_active()
            .await
            .ok_or_else(|| CoreError::Conflict("no active cluster".to_string()))?;

        if !force {
            if let Some(status) = self.registry.read_phase_status(&tag, phase).await {
                if status.is_completed() {
                    info!("{} already completed for cluster {}", phase, tag);
                    return Ok(Launch::AlreadyCompleted {
                        cluster_tag: tag,
                        phase: phase.to_string(),
                        status,
                    });
                }
            }
        }

        let slot = (tag.clone(), phase.to_string());
        if !lock(&self.running).insert(slot.clone()) {
            return Err(CoreError::Conflict(format!(
                "{} is already running for cluster {}",
                phase, tag
            )));
        }

        let started = self.spawn_phase(&tag, phase, &script).await;
        let (child, log) = match started {
            Ok(s) => s,
            Err(e) => {
                lock(&self.running).remove(&slot);
                return Err(e);
            }
        };
        let pid = child.id();
        info!(
            "started {} for cluster {} (pid {:?}), logging to {}",
            phase,
            tag,
            pid,
            log.path.display()
        );

        let this = Arc::clone(self);
        let watched = phase.to_string();
        let cluster = tag.clone();
        tokio::spawn(async move { this.finish_phase(cluster, watched, child).await });

        Ok(Launch::Started {
            cluster_tag: tag,
            phase: phase.to_string(),
            log,
            pid,
        })
    }

    async fn spawn_phase(
        &self,
        tag: &str,
        phase: &str,
        script: &str,
    ) -> CoreResult<(Child, PhaseLogPointer)> {
        self.registry.clear_derived_cache(tag).await;
        let log = self.registry.create_phase_log(tag, phase).await?;

        let stdout = OpenOptions::new()
            .append(true)
            .open(&log.path)
            .await?
            .into_std()
            .await;
        let stderr = stdout.try_clone()?;

        let child = Command::new("sh")
            .args(["-c", script])
            .current_dir(self.registry.working_dir())
            .env("CLUSTER_TAG", tag)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| CoreError::ExternalExecution {
                command: script.to_string(),
                stderr: e.to_string(),
            })?;
        Ok((child, log))
    }

    async fn finish_phase(&self, tag: String, phase: String, mut child: Child) {
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("failed to wait for {} on cluster {}: {}", phase, tag, e);
                None
            }
        };
        info!("{} for cluster {} exited with {:?}", phase, tag, code);

        let saved = self.registry.backup_working_config(&tag, &phase).await;
        self.registry.clear_derived_cache(&tag).await;
        self.clear_cache(None);

        let status = PhaseStatus {
            status: if code == Some(0) { "completed" } else { "failed" }.to_string(),
            message: format!("exited with code {:?}, {} config files saved", code, saved),
            updated_at: Utc::now(),
            details: Some(serde_json::json!({ "exitCode": code })),
        };
        if let Err(e) = self.registry.write_phase_status(&tag, &phase, &status).await {
            warn!("failed to record {} status for {}: {}", phase, tag, e);
        }

        let removed = self
            .registry
            .cleanup_phase_logs(&tag, self.config().log_retention)
            .await;
        if removed > 0 {
            info!("removed {} old logs for cluster {}", removed, tag);
        }

        lock(&self.running).remove(&(tag, phase));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::coordinator::testing::coordinator;
    use crate::status::ResourceKind;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::fs;

    fn config(script: &str) -> Config {
        Config {
            phases: HashMap::from([("step1".to_string(), script.to_string())]),
            ..Config::default()
        }
    }

    async fn wait_for_status(coord: &Coordinator, tag: &str, phase: &str) -> PhaseStatus {
        for _ in 0..200 {
            if coord.running_phases().is_empty() {
                if let Some(status) = coord.registry.read_phase_status(tag, phase).await {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("{} never finished", phase);
    }

    #[tokio::test]
    async fn phase_logs_output_and_backs_up_generated_config() {
        let dir = TempDir::new().unwrap();
        let (coord, _runner) = coordinator(
            &dir,
            config("echo provisioning $CLUSTER_TAG; echo STACK=1 > stack_envs"),
        )
        .await;
        coord.registry.create_cluster_namespace("alpha").await.unwrap();
        coord.switch_cluster("alpha").await.unwrap();
        coord.app.get_pods(false).await.unwrap();

        let launch = coord.launch_phase("step1", false).await.unwrap();
        let Launch::Started { log, .. } = launch else {
            panic!("expected a started phase");
        };

        let status = wait_for_status(&coord, "alpha", "step1").await;
        assert!(status.is_completed());

        let output = fs::read_to_string(&log.path).await.unwrap();
        assert_eq!(output, "provisioning alpha\n");
        let backed_up = coord.registry.config_dir("alpha").join("stack_envs");
        assert_eq!(fs::read_to_string(backed_up).await.unwrap(), "STACK=1\n");
        assert!(!coord.cache_status()[&ResourceKind::Pods].cached);

        let chunk = coord.registry.read_phase_log("alpha", "step1", 0).await;
        assert_eq!(chunk.content, "provisioning alpha\n");

        assert!(matches!(
            coord.launch_phase("step1", false).await.unwrap(),
            Launch::AlreadyCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn failing_phase_is_recorded_and_can_rerun() {
        let dir = TempDir::new().unwrap();
        let (coord, _runner) = coordinator(&dir, config("echo nope >&2; exit 4")).await;
        coord.registry.create_cluster_namespace("alpha").await.unwrap();
        coord.switch_cluster("alpha").await.unwrap();

        coord.launch_phase("step1", false).await.unwrap();
        let status = wait_for_status(&coord, "alpha", "step1").await;
        assert_eq!(status.status, "failed");
        assert_eq!(coord.registry.read_phase_log("alpha", "step1", 0).await.content, "nope\n");

        assert!(matches!(
            coord.launch_phase("step1", false).await.unwrap(),
            Launch::Started { .. }
        ));
    }

    #[tokio::test]
    async fn launch_requires_known_phase_and_active_cluster() {
        let dir = TempDir::new().unwrap();
        let (coord, _runner) = coordinator(&dir, config("true")).await;

        assert!(matches!(
            coord.launch_phase("step1", false).await,
            Err(CoreError::Conflict(_))
        ));
        assert!(matches!(
            coord.launch_phase("step7", false).await,
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn same_phase_cannot_run_twice() {
        let dir = TempDir::new().unwrap();
        let (coord, _runner) = coordinator(&dir, config("sleep 1")).await;
        coord.registry.create_cluster_namespace("alpha").await.unwrap();
        coord.switch_cluster("alpha").await.unwrap();

        coord.launch_phase("step1", true).await.unwrap();
        assert!(matches!(
            coord.launch_phase("step1", true).await,
            Err(CoreError::Conflict(_))
        ));
        assert_eq!(
            coord.running_phases(),
            vec![("alpha".to_string(), "step1".to_string())]
        );
    }
}
