//! Deterministic names for every deployment artifact.
//!
//! Single source of truth: container names, image references, network names,
//! named volumes and scheduler markers are all derived here and nowhere else.

use crate::paths::TargetOs;

/// Container name: `{user}_{project}_{env}_{service}`.
pub fn container_name(user: &str, project: &str, env: &str, service: &str) -> String {
    format!("{}_{}_{}_{}", user, project, env, service)
}

/// Unique name for one launch of a scheduled service. The suffix is
/// expanded by the host scheduler at launch time, so overlapping runs never
/// collide.
pub fn scheduled_container_name(
    user: &str,
    project: &str,
    env: &str,
    service: &str,
    os: TargetOs,
) -> String {
    let base = container_name(user, project, env, service);
    match os {
        TargetOs::Linux => format!("{}_$(date +%Y%m%d_%H%M%S)", base),
        TargetOs::Windows => format!("{}_%RANDOM%", base),
    }
}

/// Filter prefix matching every one-shot container a scheduled service has
/// ever launched.
pub fn scheduled_container_prefix(user: &str, project: &str, env: &str, service: &str) -> String {
    format!("{}_", container_name(user, project, env, service))
}

/// Image reference: `{registry_account}/{project}-{env}-{service}:{version}`.
pub fn image_ref(
    registry_account: &str,
    project: &str,
    env: &str,
    service: &str,
    version: &str,
) -> String {
    format!(
        "{}/{}-{}-{}:{}",
        registry_account, project, env, service, version
    )
}

/// Registry repository name, without account or tag.
pub fn image_repository(project: &str, env: &str, service: &str) -> String {
    format!("{}-{}-{}", project, env, service)
}

/// Container network name: `{project}_{env}_network`.
pub fn network_name(project: &str, env: &str) -> String {
    format!("{}_{}_network", project, env)
}

/// Named volume identifier: `{user}_{project}_{env}_{kind}_{service}`.
/// Only `data`, `logs`, `backups` and `monitoring` use named volumes.
pub fn volume_name(user: &str, project: &str, env: &str, kind: &str, service: &str) -> String {
    format!("{}_{}_{}_{}_{}", user, project, env, kind, service)
}

/// Marker line preceding each scheduler entry owned by this system.
pub fn schedule_marker(project: &str, env: &str, service: &str) -> String {
    format!("# MANAGED_{}_{}_{}", project, env, service)
}

/// Log file a scheduled launch appends to.
pub fn schedule_log_path(project: &str, env: &str, service: &str) -> String {
    format!("/var/log/cron_{}_{}_{}.log", project, env, service)
}
