//! Security profile applied to every container and exec
//!
//! The profile is not overridable by callers; the only escape hatch is an
//! explicit, audited root grant on a per-exec basis.

use bollard::models::HostConfig;
use serde_json::json;
use tracing::warn;

use crate::audit::{self, AuditEvent};

/// Resource caps baked into every container.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub pids_limit: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpu_quota: 100_000,
            cpu_period: 100_000,
            pids_limit: 256,
        }
    }
}

/// Network attachment for workspace containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Bridge,
    None,
}

impl NetworkMode {
    fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::Bridge => "bridge",
            NetworkMode::None => "none",
        }
    }
}

/// Static producer of container hardening options.
#[derive(Debug, Clone)]
pub struct SecurityProfile {
    pub uid: u32,
    pub gid: u32,
    pub network: NetworkMode,
    pub limits: ResourceLimits,
}

impl Default for SecurityProfile {
    fn default() -> Self {
        Self {
            uid: 1000,
            gid: 1000,
            network: NetworkMode::Bridge,
            limits: ResourceLimits::default(),
        }
    }
}

impl SecurityProfile {
    /// User string applied at container creation.
    pub fn container_user(&self) -> String {
        format!("{}:{}", self.uid, self.gid)
    }

    /// User string for an exec. Root requires an explicit grant, which is
    /// audited before use.
    pub fn exec_user(&self, as_root: bool, container_id: &str) -> String {
        if as_root {
            warn!(
                container_id,
                "exec will run as root inside the container"
            );
            audit::record(
                AuditEvent::SecurityAsRoot,
                Some(container_id),
                json!({"granted": true}),
            );
            "0".to_string()
        } else {
            self.uid.to_string()
        }
    }

    /// Hardened host configuration merged into every created container.
    /// `mounts` carries the workspace volume binding.
    pub fn host_config(&self, mounts: Vec<bollard::models::Mount>) -> HostConfig {
        HostConfig {
            mounts: Some(mounts),

            // Resource limits
            memory: Some(self.limits.memory_bytes),
            cpu_quota: Some(self.limits.cpu_quota),
            cpu_period: Some(self.limits.cpu_period),
            pids_limit: Some(self.limits.pids_limit),

            // Hardening
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            cap_drop: Some(vec!["ALL".to_string()]),
            readonly_rootfs: Some(true),
            privileged: Some(false),

            network_mode: Some(self.network.as_str().to_string()),

            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_users() {
        let profile = SecurityProfile::default();
        assert_eq!(profile.container_user(), "1000:1000");
        assert_eq!(profile.exec_user(false, "c_1"), "1000");
        assert_eq!(profile.exec_user(true, "c_1"), "0");
    }

    #[test]
    fn test_host_config_is_hardened() {
        let profile = SecurityProfile::default();
        let config = profile.host_config(Vec::new());

        assert_eq!(config.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(
            config.security_opt,
            Some(vec!["no-new-privileges".to_string()])
        );
        assert_eq!(config.readonly_rootfs, Some(true));
        assert_eq!(config.privileged, Some(false));
        assert_eq!(config.memory, Some(512 * 1024 * 1024));
        assert_eq!(config.cpu_quota, Some(100_000));
        assert_eq!(config.cpu_period, Some(100_000));
        assert_eq!(config.pids_limit, Some(256));
        assert_eq!(config.network_mode.as_deref(), Some("bridge"));
    }

    #[test]
    fn test_network_none() {
        let profile = SecurityProfile {
            network: NetworkMode::None,
            ..Default::default()
        };
        let config = profile.host_config(Vec::new());
        assert_eq!(config.network_mode.as_deref(), Some("none"));
    }
}
