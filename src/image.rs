//! Image reference policy: normalization, registry allow-list, pull and
//! digest pinning

use std::collections::HashMap;

use base64::Engine;
use bollard::auth::DockerCredentials;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::docker::DockerService;
use crate::error::{is_docker_not_found, DaemonError, Result};

/// A validated, normalized image reference.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ResolvedImage {
    pub requested: String,
    pub resolved_ref: String,
    pub digest: Option<String>,
    pub registry: String,
}

/// Policy gate every image reference passes through before use.
pub struct ImagePolicy {
    docker: DockerService,
    allowed_registries: Vec<String>,
    auths: Option<HashMap<String, RegistryAuth>>,
    digest_cache: Mutex<HashMap<String, String>>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct RegistryAuth {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    /// base64("user:pass"), the docker config shorthand
    #[serde(default)]
    auth: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct DockerConfigJson {
    #[serde(default)]
    auths: HashMap<String, RegistryAuth>,
}

impl ImagePolicy {
    pub fn new(docker: DockerService, config: &Configuration) -> Self {
        let auths = config
            .docker_config_json
            .as_deref()
            .and_then(|raw| match serde_json::from_str::<DockerConfigJson>(raw) {
                Ok(parsed) => Some(parsed.auths),
                Err(e) => {
                    warn!("Failed to parse DOCKER_CONFIG_JSON: {}", e);
                    None
                }
            });

        Self {
            docker,
            allowed_registries: config.allowed_registries_list(),
            auths,
            digest_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve and validate an image reference, pulling it when absent.
    pub async fn resolve(&self, requested: &str, pin_digest: bool) -> Result<ResolvedImage> {
        let normalized = normalize_image_ref(requested);
        let registry = extract_registry(&normalized);

        if !self.allowed_registries.iter().any(|r| r == &registry) {
            return Err(DaemonError::ImagePolicy(format!(
                "registry '{}' is not in allow-list ({})",
                registry,
                self.allowed_registries.join(", ")
            )));
        }

        self.ensure_present(&normalized, &registry).await?;

        let digest = if pin_digest {
            self.image_digest(&normalized).await
        } else {
            None
        };

        let resolved_ref = match &digest {
            Some(digest) => {
                // Strip the tag, but never a registry port ("host:5000/x").
                let base = match normalized.rsplit_once(':') {
                    Some((base, tag)) if !tag.contains('/') => base,
                    _ => normalized.as_str(),
                };
                format!("{}@{}", base, digest)
            }
            None => normalized.clone(),
        };

        info!(
            requested,
            resolved = %resolved_ref,
            registry = %registry,
            "Image resolved"
        );

        Ok(ResolvedImage {
            requested: requested.to_string(),
            resolved_ref,
            digest,
            registry,
        })
    }

    /// Validate a reference against the allow-list without pulling.
    pub fn validate_ref(&self, requested: &str) -> bool {
        let registry = extract_registry(&normalize_image_ref(requested));
        self.allowed_registries.iter().any(|r| r == &registry)
    }

    pub fn clear_digest_cache(&self) {
        self.digest_cache.lock().clear();
    }

    async fn ensure_present(&self, image_ref: &str, registry: &str) -> Result<()> {
        match self.docker.inspect_image(image_ref).await {
            Ok(_) => {
                debug!("Image {} already present locally", image_ref);
                return Ok(());
            }
            Err(DaemonError::Docker(e)) if is_docker_not_found(&e) => {
                info!("Image {} not found locally, pulling", image_ref);
            }
            Err(e) => return Err(e),
        }

        let credentials = self.credentials_for(registry);
        self.docker
            .pull_image(image_ref, credentials)
            .await
            .map_err(|e| DaemonError::ImagePolicy(format!("failed to pull '{image_ref}': {e}")))
    }

    fn credentials_for(&self, registry: &str) -> Option<DockerCredentials> {
        let auth = self.auths.as_ref()?.get(registry)?;

        let (username, password) = match (&auth.username, &auth.password) {
            (Some(user), Some(pass)) => (user.clone(), pass.clone()),
            _ => {
                // Fall back to the base64 "auth" shorthand
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(auth.auth.as_deref()?)
                    .ok()?;
                let decoded = String::from_utf8(decoded).ok()?;
                let (user, pass) = decoded.split_once(':')?;
                (user.to_string(), pass.to_string())
            }
        };

        Some(DockerCredentials {
            username: Some(username),
            password: Some(password),
            serveraddress: Some(registry.to_string()),
            ..Default::default()
        })
    }

    async fn image_digest(&self, image_ref: &str) -> Option<String> {
        if let Some(cached) = self.digest_cache.lock().get(image_ref) {
            return Some(cached.clone());
        }

        let inspect = match self.docker.inspect_image(image_ref).await {
            Ok(inspect) => inspect,
            Err(e) => {
                warn!("Failed to inspect image {} for digest: {}", image_ref, e);
                return None;
            }
        };

        let digest = inspect
            .repo_digests
            .unwrap_or_default()
            .first()
            .and_then(|rd| rd.split_once('@').map(|(_, d)| d.to_string()));

        if let Some(digest) = &digest {
            self.digest_cache
                .lock()
                .insert(image_ref.to_string(), digest.clone());
        } else {
            debug!("No repo digest recorded for image {}", image_ref);
        }

        digest
    }
}

/// Normalize an image reference to a fully qualified one.
///
/// `python:3.11` becomes `docker.io/library/python:3.11` and `user/app`
/// becomes `docker.io/user/app`; anything already carrying a registry is
/// left intact.
pub fn normalize_image_ref(image_ref: &str) -> String {
    if !image_ref.contains('/') {
        return format!("docker.io/library/{image_ref}");
    }

    let first = image_ref.split('/').next().unwrap_or_default();
    if !first.contains('.') && !first.contains(':') {
        return format!("docker.io/{image_ref}");
    }

    image_ref.to_string()
}

/// Extract the registry host from a reference. The leading segment counts
/// as a registry only when it contains a dot or a port.
pub fn extract_registry(image_ref: &str) -> String {
    if let Some(first) = image_ref.split('/').next() {
        if image_ref.contains('/') && (first.contains('.') || first.contains(':')) {
            return first.to_string();
        }
    }
    "docker.io".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_bare_name() {
        assert_eq!(
            normalize_image_ref("python:3.11-slim"),
            "docker.io/library/python:3.11-slim"
        );
        assert_eq!(normalize_image_ref("alpine"), "docker.io/library/alpine");
    }

    #[test]
    fn test_normalize_namespaced_name() {
        assert_eq!(
            normalize_image_ref("someuser/app:v1"),
            "docker.io/someuser/app:v1"
        );
    }

    #[test]
    fn test_normalize_leaves_registry_refs_intact() {
        assert_eq!(
            normalize_image_ref("ghcr.io/org/app:latest"),
            "ghcr.io/org/app:latest"
        );
        assert_eq!(
            normalize_image_ref("localhost:5000/app"),
            "localhost:5000/app"
        );
    }

    #[test]
    fn test_extract_registry() {
        assert_eq!(extract_registry("docker.io/library/python:3.11"), "docker.io");
        assert_eq!(extract_registry("ghcr.io/org/app"), "ghcr.io");
        assert_eq!(extract_registry("localhost:5000/app"), "localhost:5000");
        assert_eq!(extract_registry("someuser/app"), "docker.io");
        assert_eq!(extract_registry("alpine"), "docker.io");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for raw in ["alpine", "user/app", "ghcr.io/org/app:v2", "localhost:5000/x"] {
            let once = normalize_image_ref(raw);
            assert_eq!(normalize_image_ref(&once), once);
        }
    }
}
