//! A service: an ordered bundle of routes sharing a name and enable flag.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{route_match, slug, RouteConfig, ServiceConfig};
use crate::route::{Route, RouterStatus};
use crate::tailnet::TailnetNode;
use crate::timeseries::{combine, TimeSeriesData};

pub struct Service {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteStatusInfo {
    #[serde(flatten)]
    pub config: RouteConfig,
    pub status: RouterStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub routes: Vec<RouteStatusInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<TimeSeriesData>,
}

impl Service {
    /// Build a service from config. Routes that fail to build are skipped
    /// and logged; the rest keep their declared order.
    pub fn new(config: ServiceConfig, node: &Arc<TailnetNode>) -> Service {
        let id = slug(&config.name);
        let mut routes = Vec::with_capacity(config.routes.len());
        for route_config in config.routes {
            match Route::build(route_config, node.clone()) {
                Ok(route) => routes.push(route),
                Err(e) => log::error!("skipping route for service `{}`: {}", config.name, e),
            }
        }
        Service {
            id,
            name: config.name,
            enabled: config.enabled,
            routes,
        }
    }

    pub async fn start(&mut self) {
        for route in &self.routes {
            if let Err(e) = route.start().await {
                log::error!("service `{}` failed to start route {}: {}", self.name, route.config().entrypoint(), e);
            }
        }
        self.enabled = true;
    }

    pub async fn stop(&mut self) {
        self.stop_routes().await;
        self.enabled = false;
    }

    async fn stop_routes(&self) {
        for route in &self.routes {
            if let Err(e) = route.stop().await {
                log::debug!("service `{}` route {}: {}", self.name, route.config().entrypoint(), e);
            }
        }
    }

    /// Apply a new config with minimal disruption: routes whose equality key
    /// survives are updated in place, removed routes are stopped, added
    /// routes are built and, if the service is enabled, started.
    pub async fn update(&mut self, config: ServiceConfig, node: &Arc<TailnetNode>) {
        if self.name != config.name {
            self.name = config.name.clone();
            self.id = slug(&config.name);
        }

        self.enabled = config.enabled;
        if !self.enabled {
            self.stop_routes().await;
        }

        let mut kept: Vec<Route> = Vec::with_capacity(config.routes.len());
        let mut added: Vec<RouteConfig> = Vec::new();
        for route_config in config.routes {
            match self
                .routes
                .iter()
                .find(|r| route_match(&r.config(), &route_config))
            {
                Some(route) => {
                    if let Err(e) = route.update(route_config).await {
                        log::error!("service `{}` failed to update route: {}", self.name, e);
                    }
                    kept.push(route.clone());
                }
                None => added.push(route_config),
            }
        }

        for route in &self.routes {
            let removed = !kept.iter().any(|k| route_match(&k.config(), &route.config()));
            if removed {
                if let Err(e) = route.stop().await {
                    log::debug!("service `{}` removed route: {}", self.name, e);
                }
            }
        }

        for route_config in added {
            match Route::build(route_config, node.clone()) {
                Ok(route) => {
                    if self.enabled {
                        if let Err(e) = route.start().await {
                            log::error!("service `{}` failed to start route: {}", self.name, e);
                        }
                    }
                    kept.push(route);
                }
                Err(e) => log::error!("skipping route for service `{}`: {}", self.name, e),
            }
        }
        self.routes = kept;

        if self.enabled {
            for route in &self.routes {
                if route.status() != RouterStatus::Running {
                    if let Err(e) = route.start().await {
                        log::error!("service `{}` failed to start route: {}", self.name, e);
                    }
                }
            }
        }
    }

    pub async fn status(&self, full: bool) -> ServiceStatus {
        let latency = if full { Some(self.heartbeat().await) } else { None };

        let mut stats = TimeSeriesData::default();
        let mut routes = Vec::with_capacity(self.routes.len());
        for route in &self.routes {
            routes.push(RouteStatusInfo {
                config: route.config(),
                status: route.status(),
                latency: full.then(|| route.ping()),
            });
            stats = combine(stats, route.stats());
        }

        ServiceStatus {
            id: self.id.clone(),
            name: self.name.clone(),
            enabled: self.enabled,
            routes,
            latency,
            stats: full.then_some(stats),
        }
    }

    /// Mean of route latencies, gathered concurrently.
    pub async fn heartbeat(&self) -> i64 {
        if self.routes.is_empty() {
            return 0;
        }
        let pings = futures::future::join_all(self.routes.iter().map(|route| async move { route.ping() })).await;
        let sum: i64 = pings.iter().sum();
        sum / self.routes.len() as i64
    }

    pub fn to_config(&self) -> ServiceConfig {
        ServiceConfig {
            name: self.name.clone(),
            enabled: self.enabled,
            routes: self.routes.iter().map(|r| r.config()).collect(),
        }
    }
}
