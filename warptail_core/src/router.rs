//! The router kernel: a keyed collection of services sharing one tailnet
//! node, reconciled against declarative configuration by controllers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::{slug, ServiceConfig};
use crate::error::RouterError;
use crate::route::HttpRoute;
use crate::service::{Service, ServiceStatus};
use crate::tailnet::{TailnetNode, TailnetPeer, TailnetStatus, TailscaleConfig};

/// Everything a controller needs to persist the router's declarative state.
/// Controllers own the persistence format.
#[derive(Debug, Clone)]
pub struct RouterSnapshot {
    pub tailscale: TailscaleConfig,
    pub services: Vec<ServiceConfig>,
}

/// External driver observing a configuration source and mutating the router
/// through its public operations.
///
/// `persist` is called after every mutating operation and must be idempotent;
/// implementations hand the snapshot to their own worker instead of blocking
/// the caller.
pub trait Controller: Send + Sync {
    fn persist(&self, snapshot: &RouterSnapshot);

    /// Begin external observation (file watcher, resource watcher).
    fn start(&self, router: Arc<Router>) {
        let _ = router;
    }
}

pub struct Router {
    services: RwLock<HashMap<String, Service>>,
    node: Arc<TailnetNode>,
    controllers: std::sync::RwLock<Vec<Arc<dyn Controller>>>,
}

impl Router {
    pub fn new(node: Arc<TailnetNode>) -> Router {
        Router {
            services: RwLock::new(HashMap::new()),
            node,
            controllers: std::sync::RwLock::new(Vec::new()),
        }
    }

    pub fn node(&self) -> &Arc<TailnetNode> {
        &self.node
    }

    pub fn add_controller(&self, controller: Arc<dyn Controller>) {
        match self.controllers.write() {
            Ok(mut x) => x.push(controller),
            Err(e) => e.into_inner().push(controller),
        }
    }

    /// Bring up the tailnet and create every configured service. Any failure
    /// here is fatal to startup.
    pub async fn init(
        &self,
        tailscale: &TailscaleConfig,
        services: Vec<ServiceConfig>,
    ) -> Result<(), RouterError> {
        self.update_tailnet(tailscale).await?;
        for config in services {
            self.create(config).await?;
        }
        Ok(())
    }

    /// Ensure the node runs with the given identity. A changed identity tears
    /// down all routes first; the node restart is the router-level critical
    /// section.
    pub async fn update_tailnet(&self, config: &TailscaleConfig) -> Result<TailnetStatus, RouterError> {
        if self.node.config().is_some() && !self.node.identity_matches(config) {
            log::info!("tailnet identity changed, restarting node");
            self.stop_all().await;
            self.node.reconfigure(config).await
        } else {
            self.node.bring_up(config).await
        }
    }

    pub async fn create(&self, config: ServiceConfig) -> Result<ServiceStatus, RouterError> {
        config.validate()?;
        let id = slug(&config.name);

        let mut services = self.services.write().await;
        if services.contains_key(&id) {
            return Err(RouterError::conflict(format!(
                "service `{}` already exists",
                id
            )));
        }
        let mut service = Service::new(config, &self.node);
        if service.enabled {
            service.start().await;
        }
        let status = service.status(false).await;
        services.insert(service.id.clone(), service);
        Ok(status)
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.services.read().await.contains_key(&slug(name))
    }

    pub async fn status_of(&self, id: &str, full: bool) -> Result<ServiceStatus, RouterError> {
        let services = self.services.read().await;
        match services.get(id) {
            Some(service) => Ok(service.status(full).await),
            None => Err(RouterError::not_found("service not found")),
        }
    }

    pub async fn statuses(&self, full: bool) -> Vec<ServiceStatus> {
        let services = self.services.read().await;
        let mut out = Vec::with_capacity(services.len());
        for service in services.values() {
            out.push(service.status(full).await);
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn update(&self, id: &str, config: ServiceConfig) -> Result<ServiceStatus, RouterError> {
        config.validate()?;
        let new_id = slug(&config.name);

        let mut services = self.services.write().await;
        if new_id != id && services.contains_key(&new_id) {
            return Err(RouterError::conflict(format!(
                "service `{}` already exists",
                new_id
            )));
        }
        let Some(mut service) = services.remove(id) else {
            return Err(RouterError::not_found("service not found"));
        };
        service.update(config, &self.node).await;
        let status = service.status(true).await;
        services.insert(service.id.clone(), service);
        Ok(status)
    }

    pub async fn start_service(&self, id: &str) -> Result<ServiceStatus, RouterError> {
        let mut services = self.services.write().await;
        let Some(service) = services.get_mut(id) else {
            return Err(RouterError::not_found("service not found"));
        };
        service.start().await;
        Ok(service.status(true).await)
    }

    pub async fn stop_service(&self, id: &str) -> Result<ServiceStatus, RouterError> {
        let mut services = self.services.write().await;
        let Some(service) = services.get_mut(id) else {
            return Err(RouterError::not_found("service not found"));
        };
        service.stop().await;
        Ok(service.status(true).await)
    }

    pub async fn remove(&self, id: &str) -> Result<(), RouterError> {
        let mut services = self.services.write().await;
        let Some(mut service) = services.remove(id) else {
            return Err(RouterError::not_found("service not found"));
        };
        service.stop().await;
        Ok(())
    }

    /// Declarative replace: create absent services, update present ones and
    /// stop + drop everything missing from the new config. Applying the same
    /// config twice is a no-op.
    pub async fn reload(&self, tailscale: &TailscaleConfig, configs: Vec<ServiceConfig>) {
        if let Err(e) = self.update_tailnet(tailscale).await {
            log::error!("tailnet reconfiguration failed during reload: {}", e);
        }

        let mut desired: Vec<String> = Vec::with_capacity(configs.len());
        for config in configs {
            let id = slug(&config.name);
            desired.push(id.clone());
            let result = if self.exists(&config.name).await {
                self.update(&id, config).await
            } else {
                self.create(config).await
            };
            if let Err(e) = result {
                log::error!("reload failed for service `{}`: {}", id, e);
            }
        }

        let stale: Vec<String> = {
            let services = self.services.read().await;
            services
                .keys()
                .filter(|id| !desired.contains(id))
                .cloned()
                .collect()
        };
        for id in stale {
            log::info!("removing service `{}` absent from config", id);
            if let Err(e) = self.remove(&id).await {
                log::error!("failed to remove service `{}`: {}", id, e);
            }
        }
    }

    /// Host lookup for the http ingress; the request hot-path.
    pub async fn get_http_route(&self, host: &str) -> Option<HttpRoute> {
        let services = self.services.read().await;
        for service in services.values() {
            for route in &service.routes {
                if let Some(http) = route.as_http() {
                    if http.config().domain == host {
                        return Some(http.clone());
                    }
                }
            }
        }
        None
    }

    /// Fan the current declarative state out to every controller.
    pub async fn save(&self) {
        let snapshot = self.snapshot().await;
        let controllers: Vec<Arc<dyn Controller>> = match self.controllers.read() {
            Ok(x) => x.clone(),
            Err(e) => e.into_inner().clone(),
        };
        for controller in controllers {
            controller.persist(&snapshot);
        }
    }

    pub async fn snapshot(&self) -> RouterSnapshot {
        let services = self.services.read().await;
        let mut configs: Vec<ServiceConfig> = services.values().map(|s| s.to_config()).collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        RouterSnapshot {
            tailscale: self.node.config().unwrap_or_default(),
            services: configs,
        }
    }

    /// Tailnet peers, deduplicated by `(hostname, ip)`.
    pub async fn get_peers(&self) -> Result<Vec<TailnetPeer>, RouterError> {
        let peers = self.node.peers().await?;
        let mut seen = std::collections::HashSet::new();
        Ok(peers
            .into_iter()
            .filter(|peer| seen.insert((peer.hostname.clone(), peer.ip)))
            .collect())
    }

    pub async fn start_all(&self) {
        let mut services = self.services.write().await;
        for service in services.values_mut() {
            service.start().await;
        }
    }

    pub async fn stop_all(&self) {
        let mut services = self.services.write().await;
        for service in services.values_mut() {
            service.stop().await;
        }
    }
}
