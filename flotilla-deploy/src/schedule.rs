//! Scheduled-job installer: cron-declared services become host scheduler
//! entries that launch a one-shot `--rm` container on the cadence.
//!
//! Entries are owned via a marker line so they can be enumerated and removed
//! later without touching anything else in the host's scheduler store.

use flotilla_core::cron;
use flotilla_core::error::{FlotillaError, FlotillaResult};
use flotilla_core::naming;
use flotilla_core::ops::CommandRunner;
use flotilla_core::paths::{self, TargetOs};
use flotilla_core::types::{RunMode, ServiceId, ServiceSpec};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Budget for each scheduler-store command.
const COMMAND_BUDGET: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerKind {
    UnixCron,
    WindowsTasks,
    None,
}

pub struct ScheduledJobInstaller {
    runner: Arc<dyn CommandRunner>,
    user: String,
}

impl ScheduledJobInstaller {
    pub fn new(runner: Arc<dyn CommandRunner>, user: &str) -> Self {
        Self {
            runner,
            user: user.to_string(),
        }
    }

    async fn run(&self, host: &str, command: &str) -> FlotillaResult<String> {
        tokio::time::timeout(COMMAND_BUDGET, self.runner.run(host, command))
            .await
            .map_err(|_| {
                FlotillaError::Internal(format!(
                    "scheduler command timed out after {:?}: {}",
                    COMMAND_BUDGET, command
                ))
            })?
    }

    /// Figure out which scheduler the host offers.
    pub async fn detect(&self, host: &str) -> SchedulerKind {
        if let Ok(uname) = self.run(host, "uname -s").await {
            let uname = uname.to_lowercase();
            if uname.contains("linux") || uname.contains("darwin") {
                let has_cron = self.run(host, "crontab -l").await.is_ok()
                    || self.run(host, "which crontab").await.is_ok();
                return if has_cron {
                    SchedulerKind::UnixCron
                } else {
                    SchedulerKind::None
                };
            }
        }
        if self.run(host, "schtasks /query").await.is_ok() {
            return SchedulerKind::WindowsTasks;
        }
        SchedulerKind::None
    }

    /// The complete launcher command a scheduler entry runs: a one-shot
    /// container with a unique timestamped name so overlapping runs never
    /// collide.
    pub fn launcher_command(
        &self,
        id: &ServiceId,
        spec: &ServiceSpec,
        image: &str,
        os: TargetOs,
    ) -> String {
        let container =
            naming::scheduled_container_name(&id.user, &id.project, &id.env, &id.service, os);

        let mut parts = vec![
            "docker".to_string(),
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container,
            "--network".to_string(),
            naming::network_name(&id.project, &id.env),
        ];
        for mount in paths::all_mounts(os, &id.user, &id.project, &id.env, &id.service) {
            parts.push("-v".to_string());
            parts.push(mount);
        }
        let mut env_keys: Vec<&String> = spec.env_vars.keys().collect();
        env_keys.sort();
        for key in env_keys {
            parts.push("-e".to_string());
            parts.push(format!("{}={}", key, spec.env_vars[key]));
        }
        parts.push(image.to_string());
        if let Some(command) = &spec.command {
            parts.extend(command.iter().cloned());
        }

        parts
            .iter()
            .map(|p| {
                if p.contains(' ') {
                    format!("\"{}\"", p)
                } else {
                    p.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn schedule_of(spec: &ServiceSpec) -> FlotillaResult<&str> {
        match &spec.run_mode {
            RunMode::Scheduled(schedule) => Ok(schedule),
            RunMode::LongRunning => Err(FlotillaError::Validation(
                "service has no schedule".to_string(),
            )),
        }
    }

    /// Install (or reinstall) the scheduler entry for a service on a host.
    pub async fn install(
        &self,
        id: &ServiceId,
        spec: &ServiceSpec,
        image: &str,
        host: &str,
    ) -> FlotillaResult<()> {
        let schedule = Self::schedule_of(spec)?;
        cron::validate(schedule)?;

        // stragglers from crashed one-shot runs accumulate; sweep first
        if let Err(e) = self.cleanup_stragglers(id, host).await {
            warn!("straggler cleanup for {} on {}: {}", id, host, e);
        }

        match self.detect(host).await {
            SchedulerKind::UnixCron => self.install_cron(id, spec, image, schedule, host).await,
            SchedulerKind::WindowsTasks => {
                self.install_schtasks(id, spec, image, schedule, host).await
            }
            SchedulerKind::None => Err(FlotillaError::Validation(format!(
                "no scheduler available on {} for {}",
                host, id
            ))),
        }
    }

    async fn install_cron(
        &self,
        id: &ServiceId,
        spec: &ServiceSpec,
        image: &str,
        schedule: &str,
        host: &str,
    ) -> FlotillaResult<()> {
        self.remove(id, host).await?;

        let marker = naming::schedule_marker(&id.project, &id.env, &id.service);
        let log = naming::schedule_log_path(&id.project, &id.env, &id.service);
        let launcher = self.launcher_command(id, spec, image, TargetOs::Linux);
        let entry = format!("{}\n{} {} >> {} 2>&1", marker, schedule, launcher, log);
        let escaped = entry.replace('\'', "'\\''");

        let tmp = format!("/tmp/cron_{}_{}_{}", id.project, id.env, id.service);
        let commands = [
            format!("crontab -l 2>/dev/null > {} || touch {}", tmp, tmp),
            format!("echo '{}' >> {}", escaped, tmp),
            format!("crontab {}", tmp),
            format!("rm -f {}", tmp),
        ];
        for command in &commands {
            self.run(host, command).await?;
        }

        info!("installed cron entry for {} on {}: {}", id, host, schedule);
        Ok(())
    }

    async fn install_schtasks(
        &self,
        id: &ServiceId,
        spec: &ServiceSpec,
        image: &str,
        schedule: &str,
        host: &str,
    ) -> FlotillaResult<()> {
        let windows = cron::to_windows_schedule(schedule)?;
        let task = format!("{}_{}_{}", id.project, id.env, id.service);
        let launcher = self.launcher_command(id, spec, image, TargetOs::Windows);

        let mut command = format!("schtasks /create /tn \"{}\" /tr \"{}\"", task, launcher);
        for arg in windows.schtasks_args() {
            command.push(' ');
            command.push_str(&arg);
        }
        command.push_str(" /f");

        self.run(host, &command).await?;
        info!("installed scheduled task {} on {}", task, host);
        Ok(())
    }

    /// Remove the entry owned by this system, leaving foreign entries alone.
    pub async fn remove(&self, id: &ServiceId, host: &str) -> FlotillaResult<()> {
        match self.detect(host).await {
            SchedulerKind::UnixCron => {
                let marker = naming::schedule_marker(&id.project, &id.env, &id.service);
                let tmp = format!("/tmp/cron_rm_{}_{}_{}", id.project, id.env, id.service);
                // drop the marker line and the entry line that follows it
                let commands = [
                    format!("crontab -l 2>/dev/null > {} || touch {}", tmp, tmp),
                    format!(
                        "sed '/^{}$/,+1d' {} > {}.out || touch {}.out",
                        marker, tmp, tmp, tmp
                    ),
                    format!("crontab {}.out", tmp),
                    format!("rm -f {} {}.out", tmp, tmp),
                ];
                for command in &commands {
                    self.run(host, command).await?;
                }
                Ok(())
            }
            SchedulerKind::WindowsTasks => {
                let task = format!("{}_{}_{}", id.project, id.env, id.service);
                let _ = self
                    .run(host, &format!("schtasks /delete /tn \"{}\" /f", task))
                    .await;
                Ok(())
            }
            SchedulerKind::None => Ok(()),
        }
    }

    /// Managed entries for a project environment.
    pub async fn list(&self, project: &str, env: &str, host: &str) -> FlotillaResult<Vec<String>> {
        match self.detect(host).await {
            SchedulerKind::UnixCron => {
                let content = self.run(host, "crontab -l").await.unwrap_or_default();
                let prefix = format!("# MANAGED_{}_{}", project, env);
                let lines: Vec<&str> = content.lines().collect();
                let mut managed = Vec::new();
                for (i, line) in lines.iter().enumerate() {
                    if line.starts_with(&prefix) {
                        if let Some(entry) = lines.get(i + 1) {
                            managed.push(entry.to_string());
                        }
                    }
                }
                Ok(managed)
            }
            SchedulerKind::WindowsTasks => {
                let content = self
                    .run(host, "schtasks /query /fo LIST")
                    .await
                    .unwrap_or_default();
                let prefix = format!("{}_{}_", project, env);
                Ok(content
                    .lines()
                    .filter(|l| l.contains("TaskName:") && l.contains(&prefix))
                    .map(|l| l.trim().to_string())
                    .collect())
            }
            SchedulerKind::None => Ok(Vec::new()),
        }
    }

    /// One-shot containers from previous runs that never removed themselves.
    async fn cleanup_stragglers(&self, id: &ServiceId, host: &str) -> FlotillaResult<()> {
        let prefix =
            naming::scheduled_container_prefix(&id.user, &id.project, &id.env, &id.service);
        let listing = self
            .run(
                host,
                &format!(
                    "docker ps -a --filter \"name={}\" --format \"{{{{.Names}}}}\"",
                    prefix
                ),
            )
            .await?;
        for name in listing.lines().filter(|l| !l.trim().is_empty()) {
            if let Err(e) = self.run(host, &format!("docker rm -f {}", name.trim())).await {
                warn!("could not remove straggler {}: {}", name, e);
            }
        }
        Ok(())
    }
}
