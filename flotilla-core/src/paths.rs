//! Host and container mount paths for every mount kind.
//!
//! Host paths follow `{base}/{user}/{project}/{env}/{kind}/{service}` where
//! the base depends on the target OS. Container paths use well-known
//! locations for the standard datastores and `/app/{kind}` otherwise.

use crate::naming;

/// Mount kinds a service may carry.
pub const MOUNT_KINDS: [&str; 7] = [
    "config",
    "secrets",
    "files",
    "data",
    "logs",
    "backups",
    "monitoring",
];

/// Kinds backed by named volumes rather than host directories.
pub const VOLUME_KINDS: [&str; 4] = ["data", "logs", "backups", "monitoring"];

/// Target OS of a node, as far as path layout is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetOs {
    Linux,
    Windows,
}

fn base_dir(os: TargetOs) -> &'static str {
    match os {
        TargetOs::Linux => "/local",
        TargetOs::Windows => "C:/local",
    }
}

/// Host path for one mount kind. Always forward slashes, Docker requires them.
pub fn host_path(
    os: TargetOs,
    user: &str,
    project: &str,
    env: &str,
    kind: &str,
    service: &str,
) -> String {
    format!(
        "{}/{}/{}/{}/{}/{}",
        base_dir(os),
        user,
        project,
        env,
        kind,
        service
    )
}

/// Root of the pushed payload tree for a project env on a node.
pub fn payload_root(os: TargetOs, user: &str, project: &str, env: &str) -> String {
    format!("{}/{}/{}/{}", base_dir(os), user, project, env)
}

/// In-container path for one mount kind.
///
/// Standard services get their conventional locations; everything else lands
/// under `/app`.
pub fn container_path(service: &str, kind: &str) -> String {
    match (service, kind) {
        ("postgres", "data") => "/var/lib/postgresql/data".to_string(),
        ("postgres", "config") => "/etc/postgresql".to_string(),
        ("postgres", "secrets") => "/run/secrets".to_string(),
        ("redis", "data") => "/data".to_string(),
        ("redis", "config") => "/usr/local/etc/redis".to_string(),
        ("redis", "secrets") => "/run/secrets".to_string(),
        ("nginx", "config") => "/etc/nginx".to_string(),
        ("nginx", "logs") => "/var/log/nginx".to_string(),
        ("nginx", "secrets") => "/etc/ssl/certs".to_string(),
        _ => format!("/app/{}", kind),
    }
}

/// All `-v` mount arguments for a service: named volumes for the volume
/// kinds, host binds for the rest.
pub fn all_mounts(
    os: TargetOs,
    user: &str,
    project: &str,
    env: &str,
    service: &str,
) -> Vec<String> {
    MOUNT_KINDS
        .iter()
        .map(|kind| {
            let source = if VOLUME_KINDS.contains(kind) {
                naming::volume_name(user, project, env, kind, service)
            } else {
                host_path(os, user, project, env, kind, service)
            };
            format!("{}:{}", source, container_path(service, kind))
        })
        .collect()
}

/// Named volumes a service needs to exist before start.
pub fn required_volumes(user: &str, project: &str, env: &str, service: &str) -> Vec<String> {
    VOLUME_KINDS
        .iter()
        .map(|kind| naming::volume_name(user, project, env, kind, service))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_paths_per_os() {
        assert_eq!(
            host_path(TargetOs::Linux, "u1", "shop", "prod", "config", "api"),
            "/local/u1/shop/prod/config/api"
        );
        assert_eq!(
            host_path(TargetOs::Windows, "u1", "shop", "prod", "config", "api"),
            "C:/local/u1/shop/prod/config/api"
        );
    }

    #[test]
    fn standard_service_container_paths() {
        assert_eq!(container_path("postgres", "data"), "/var/lib/postgresql/data");
        assert_eq!(container_path("redis", "data"), "/data");
        assert_eq!(container_path("nginx", "config"), "/etc/nginx");
        assert_eq!(container_path("api", "config"), "/app/config");
    }

    #[test]
    fn mounts_cover_every_kind() {
        let mounts = all_mounts(TargetOs::Linux, "u1", "shop", "prod", "api");
        assert_eq!(mounts.len(), MOUNT_KINDS.len());
        // data rides a named volume, config a host bind
        assert!(mounts.iter().any(|m| m == "u1_shop_prod_data_api:/app/data"));
        assert!(
            mounts
                .iter()
                .any(|m| m == "/local/u1/shop/prod/config/api:/app/config")
        );
    }

    #[test]
    fn required_volumes_are_the_volume_kinds() {
        let volumes = required_volumes("u1", "shop", "prod", "api");
        assert_eq!(volumes.len(), VOLUME_KINDS.len());
        assert!(volumes.contains(&"u1_shop_prod_backups_api".to_string()));
    }
}
