//! Warm container pool
//!
//! Keeps at most one pre-provisioned, started container of the default
//! image ready for immediate claim. The slot refills asynchronously after
//! a claim, and a periodic health check replaces a dead slot.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::containers::{ContainerManager, CreateRequest};
use crate::database::ContainerRecord;
use crate::docker::WORKSPACE_DIR;
use crate::error::Result;

/// Shell that clears visible and hidden workspace entries.
const SCRUB_COMMAND: &str =
    "rm -rf /workspace/* /workspace/.[!.]* /workspace/..?* 2>/dev/null || true";

pub struct WarmPool {
    containers: Arc<ContainerManager>,
    enabled: bool,
    default_image: String,
    health_interval: Duration,
    slot: Arc<Mutex<Option<ContainerRecord>>>,
    shutdown: CancellationToken,
}

impl WarmPool {
    pub fn new(
        containers: Arc<ContainerManager>,
        enabled: bool,
        default_image: String,
        health_interval_s: u64,
    ) -> Self {
        Self {
            containers,
            enabled,
            default_image,
            health_interval: Duration::from_secs(health_interval_s),
            slot: Arc::new(Mutex::new(None)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Provision the initial warm container and launch the health loop.
    pub async fn start(self: &Arc<Self>) {
        if !self.enabled {
            info!("Warm pool disabled");
            return;
        }

        self.ensure_warm().await;

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.health_loop().await;
        });

        info!(
            image = %self.default_image,
            interval_s = self.health_interval.as_secs(),
            "Warm pool started"
        );
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Atomically take the warm container, if one is parked.
    ///
    /// When an alias is requested it is assigned best-effort: a uniqueness
    /// conflict leaves the claim successful but aliasless.
    pub async fn claim(&self, alias: Option<&str>) -> Result<Option<ContainerRecord>> {
        if !self.enabled {
            return Ok(None);
        }

        let mut claimed = {
            let mut slot = self.slot.lock().await;
            match slot.take() {
                Some(container) => container,
                None => {
                    debug!("no warm container available");
                    return Ok(None);
                }
            }
        };

        if let Some(alias) = alias {
            let db = self.containers.database();
            let conn = db.conn().await;
            if db.containers.try_set_alias(&conn, &claimed.id, alias)? {
                claimed.alias = Some(alias.to_string());
            } else {
                warn!(
                    container_id = %claimed.id,
                    alias,
                    "requested alias already taken, claiming without it"
                );
            }
        }

        info!(container_id = %claimed.id, "warm container claimed");

        // Refill asynchronously; the claimer does not wait.
        let containers = Arc::clone(&self.containers);
        let pool_slot = Arc::clone(&self.slot);
        let image = self.default_image.clone();
        tokio::spawn(async move {
            Self::fill_slot(containers, pool_slot, image).await;
        });

        Ok(Some(claimed))
    }

    /// Container id currently parked in the pool, if any.
    pub async fn warm_container_id(&self) -> Option<String> {
        self.slot.lock().await.as_ref().map(|c| c.id.clone())
    }

    async fn ensure_warm(&self) {
        Self::fill_slot(
            Arc::clone(&self.containers),
            Arc::clone(&self.slot),
            self.default_image.clone(),
        )
        .await;
    }

    async fn fill_slot(
        containers: Arc<ContainerManager>,
        slot: Arc<Mutex<Option<ContainerRecord>>>,
        image: String,
    ) {
        let mut guard = slot.lock().await;
        if guard.is_some() {
            return;
        }

        match Self::provision(&containers, &image).await {
            Ok(container) => {
                info!(container_id = %container.id, "warm container ready");
                *guard = Some(container);
            }
            Err(e) => {
                error!("failed to provision warm container: {}", e);
            }
        }
    }

    async fn provision(
        containers: &ContainerManager,
        image: &str,
    ) -> Result<ContainerRecord> {
        let container = containers
            .create(CreateRequest {
                image: image.to_string(),
                ..Default::default()
            })
            .await?;

        containers.start(&container.id).await?;

        // A reclaimed image may ship with droppings; hand out an empty
        // workspace.
        let scrub = containers
            .docker()
            .exec_collect(
                &container.docker_id,
                vec!["sh".into(), "-c".into(), SCRUB_COMMAND.into()],
                WORKSPACE_DIR,
                None,
                "1000:1000",
            )
            .await;
        if let Err(e) = scrub {
            warn!(container_id = %container.id, "workspace scrub failed: {}", e);
        }

        Ok(container)
    }

    async fn health_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.health_interval);
        interval.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("warm pool health loop stopped");
                    return;
                }
                _ = interval.tick() => {}
            }

            let current = { self.slot.lock().await.clone() };

            match current {
                None => self.ensure_warm().await,
                Some(container) => {
                    if !self.is_healthy(&container).await {
                        warn!(
                            container_id = %container.id,
                            "warm container unhealthy, replacing"
                        );

                        {
                            let mut slot = self.slot.lock().await;
                            if slot.as_ref().map(|c| c.id.clone()) == Some(container.id.clone())
                            {
                                *slot = None;
                            }
                        }

                        if let Err(e) = self.containers.remove(&container.id, true).await {
                            error!(
                                container_id = %container.id,
                                "failed to remove unhealthy warm container: {}", e
                            );
                        }

                        self.ensure_warm().await;
                    }
                }
            }
        }
    }

    async fn is_healthy(&self, container: &ContainerRecord) -> bool {
        let status = match self
            .containers
            .docker()
            .container_status(&container.docker_id)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                warn!(container_id = %container.id, "health inspect failed: {}", e);
                return false;
            }
        };

        if status.as_deref() != Some("running") {
            return false;
        }

        match self
            .containers
            .docker()
            .exec_collect(
                &container.docker_id,
                vec!["echo".into(), "health_check".into()],
                WORKSPACE_DIR,
                None,
                "1000",
            )
            .await
        {
            Ok(output) => output.exit_code == 0,
            Err(e) => {
                warn!(container_id = %container.id, "health exec failed: {}", e);
                false
            }
        }
    }
}
