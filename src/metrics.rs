//! Prometheus gauges sampled from live router state.

use std::sync::Arc;
use std::time::Duration;

use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use tokio::task::JoinHandle;
use tokio::time::interval;

use warptail_core::service::ServiceStatus;
use warptail_core::{Router, RouterStatus};

const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

const SERVICE_LABELS: &[&str] = &["service_name"];
const ROUTE_LABELS: &[&str] = &["service_name", "route_type", "route_entrypoint", "tailscale_address"];

pub struct ServiceMetrics {
    registry: Registry,
    service_enabled: GaugeVec,
    service_latency: GaugeVec,
    total_sent: GaugeVec,
    total_received: GaugeVec,
    route_status: GaugeVec,
    route_latency: GaugeVec,
}

impl ServiceMetrics {
    pub fn new() -> Result<ServiceMetrics, prometheus::Error> {
        let registry = Registry::new();

        let service_enabled = GaugeVec::new(
            Opts::new("warptail_service_enabled", "Whether the service is enabled"),
            SERVICE_LABELS,
        )?;
        let service_latency = GaugeVec::new(
            Opts::new("warptail_service_latency", "Mean route latency of the service in ms"),
            SERVICE_LABELS,
        )?;
        let total_sent = GaugeVec::new(
            Opts::new("warptail_service_total_sent", "Bytes sent within the stats window"),
            SERVICE_LABELS,
        )?;
        let total_received = GaugeVec::new(
            Opts::new(
                "warptail_service_total_received",
                "Bytes received within the stats window",
            ),
            SERVICE_LABELS,
        )?;
        let route_status = GaugeVec::new(
            Opts::new("warptail_route_status", "1 when the route is running, else 0"),
            ROUTE_LABELS,
        )?;
        let route_latency = GaugeVec::new(
            Opts::new("warptail_service_route_latency", "Route heartbeat latency in ms"),
            ROUTE_LABELS,
        )?;

        registry.register(Box::new(service_enabled.clone()))?;
        registry.register(Box::new(service_latency.clone()))?;
        registry.register(Box::new(total_sent.clone()))?;
        registry.register(Box::new(total_received.clone()))?;
        registry.register(Box::new(route_status.clone()))?;
        registry.register(Box::new(route_latency.clone()))?;

        Ok(ServiceMetrics {
            registry,
            service_enabled,
            service_latency,
            total_sent,
            total_received,
            route_status,
            route_latency,
        })
    }

    pub fn update(&self, services: &[ServiceStatus]) {
        for service in services {
            let enabled = if service.enabled { 1.0 } else { 0.0 };
            self.service_enabled
                .with_label_values(&[&service.name])
                .set(enabled);
            self.service_latency
                .with_label_values(&[&service.name])
                .set(service.latency.unwrap_or(0) as f64);
            if let Some(stats) = &service.stats {
                self.total_sent
                    .with_label_values(&[&service.name])
                    .set(stats.total.sent as f64);
                self.total_received
                    .with_label_values(&[&service.name])
                    .set(stats.total.received as f64);
            }

            for route in &service.routes {
                let kind = route.config.kind.to_string();
                let entrypoint = route.config.entrypoint();
                let target = route.config.machine.to_string();
                let labels = [service.name.as_str(), kind.as_str(), entrypoint.as_str(), target.as_str()];

                let running = if route.status == RouterStatus::Running { 1.0 } else { 0.0 };
                self.route_status.with_label_values(&labels).set(running);
                self.route_latency
                    .with_label_values(&labels)
                    .set(route.latency.unwrap_or(0) as f64);
            }
        }
    }

    /// Exposition-format dump for `GET /metrics`.
    pub fn gather(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            log::error!("failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).to_string()
    }

    pub fn spawn_sampler(self: &Arc<Self>, router: Arc<Router>) -> JoinHandle<()> {
        let metrics = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(SAMPLE_INTERVAL);
            loop {
                ticker.tick().await;
                let statuses = router.statuses(true).await;
                metrics.update(&statuses);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warptail_core::config::{Machine, RouteConfig, RouteType};
    use warptail_core::service::RouteStatusInfo;
    use warptail_core::timeseries::{ProxyStats, TimeSeriesData};

    fn sample_status() -> ServiceStatus {
        ServiceStatus {
            id: "db".to_string(),
            name: "db".to_string(),
            enabled: true,
            routes: vec![RouteStatusInfo {
                config: RouteConfig {
                    kind: RouteType::Tcp,
                    private: false,
                    bot_protect: false,
                    domain: String::new(),
                    port: 15432,
                    machine: Machine {
                        node_name: String::new(),
                        address: "db.local".to_string(),
                        port: 5432,
                    },
                    proxy_settings: None,
                },
                status: RouterStatus::Running,
                latency: Some(4),
            }],
            latency: Some(4),
            stats: Some(TimeSeriesData {
                points: vec![],
                total: ProxyStats {
                    sent: 1024,
                    received: 2048,
                },
            }),
        }
    }

    #[test]
    fn exposes_service_and_route_gauges() {
        let metrics = ServiceMetrics::new().unwrap();
        metrics.update(&[sample_status()]);

        let output = metrics.gather();
        assert!(output.contains("warptail_service_enabled{service_name=\"db\"} 1"));
        assert!(output.contains("warptail_service_total_sent{service_name=\"db\"} 1024"));
        assert!(output.contains("warptail_service_total_received{service_name=\"db\"} 2048"));
        assert!(
            output.contains(
                "warptail_route_status{route_entrypoint=\"15432\",route_type=\"tcp\",service_name=\"db\",tailscale_address=\"db.local:5432\"} 1"
            ),
            "unexpected exposition:\n{}",
            output
        );
    }

    #[test]
    fn disabled_services_report_zero() {
        let metrics = ServiceMetrics::new().unwrap();
        let mut status = sample_status();
        status.enabled = false;
        status.routes[0].status = RouterStatus::Stopped;
        metrics.update(&[status]);

        let output = metrics.gather();
        assert!(output.contains("warptail_service_enabled{service_name=\"db\"} 0"));
        assert!(output.contains("tailscale_address=\"db.local:5432\"} 0"));
    }
}
