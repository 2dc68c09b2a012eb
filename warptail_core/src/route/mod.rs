//! Route handlers, polymorphic over tcp/udp/http ingress.
//!
//! Every handler owns its ingress, a byte-counter time series and a heartbeat
//! prober, and moves through the same state machine:
//! `Stopped -> Starting -> Running -> Stopping -> Stopped`.

mod http;
mod tcp;
mod udp;

pub use self::http::HttpRoute;
pub use self::tcp::TcpRoute;
pub use self::udp::UdpRoute;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{RouteConfig, RouteType};
use crate::error::RouterError;
use crate::tailnet::TailnetNode;
use crate::timeseries::TimeSeriesData;

pub(crate) const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(1);

/// Latency sentinel for an unreachable upstream, in milliseconds.
pub const LATENCY_UNREACHABLE: i64 = -1;

pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(x) => x,
        Err(e) => e.into_inner(),
    }
}

pub(crate) fn read<T>(lock: &std::sync::RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(x) => x,
        Err(e) => e.into_inner(),
    }
}

pub(crate) fn write<T>(lock: &std::sync::RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(x) => x,
        Err(e) => e.into_inner(),
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouterStatus {
    Starting,
    Running,
    Stopping,
    #[default]
    Stopped,
}

impl std::fmt::Display for RouterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RouterStatus::Starting => "Starting",
            RouterStatus::Running => "Running",
            RouterStatus::Stopping => "Stopping",
            RouterStatus::Stopped => "Stopped",
        };
        write!(f, "{}", s)
    }
}

/// One ingress -> target forwarder. The protocol set is small and fixed, so
/// this is a closed sum rather than a trait object.
#[derive(Clone)]
pub enum Route {
    Tcp(TcpRoute),
    Udp(UdpRoute),
    Http(HttpRoute),
}

impl Route {
    /// Build the handler for a config. Tcp/udp ingresses own a listener;
    /// http and https share the router's host-keyed ingress.
    pub fn build(config: RouteConfig, node: std::sync::Arc<TailnetNode>) -> Result<Route, RouterError> {
        config.validate()?;
        match config.kind {
            RouteType::Tcp => Ok(Route::Tcp(TcpRoute::new(config, node))),
            RouteType::Udp => Ok(Route::Udp(UdpRoute::new(config, node))),
            RouteType::Http | RouteType::Https => Ok(Route::Http(HttpRoute::new(config, node))),
        }
    }

    pub async fn start(&self) -> Result<(), RouterError> {
        match self {
            Route::Tcp(r) => r.start().await,
            Route::Udp(r) => r.start().await,
            Route::Http(r) => r.start().await,
        }
    }

    pub async fn stop(&self) -> Result<(), RouterError> {
        match self {
            Route::Tcp(r) => r.stop().await,
            Route::Udp(r) => r.stop().await,
            Route::Http(r) => r.stop().await,
        }
    }

    pub async fn update(&self, config: RouteConfig) -> Result<(), RouterError> {
        match self {
            Route::Tcp(r) => r.update(config).await,
            Route::Udp(r) => r.update(config).await,
            Route::Http(r) => r.update(config).await,
        }
    }

    pub fn config(&self) -> RouteConfig {
        match self {
            Route::Tcp(r) => r.config(),
            Route::Udp(r) => r.config(),
            Route::Http(r) => r.config(),
        }
    }

    pub fn status(&self) -> RouterStatus {
        match self {
            Route::Tcp(r) => r.status(),
            Route::Udp(r) => r.status(),
            Route::Http(r) => r.status(),
        }
    }

    pub fn stats(&self) -> TimeSeriesData {
        match self {
            Route::Tcp(r) => r.stats(),
            Route::Udp(r) => r.stats(),
            Route::Http(r) => r.stats(),
        }
    }

    /// Last heartbeat round-trip in milliseconds, [`LATENCY_UNREACHABLE`]
    /// when the upstream did not answer.
    pub fn ping(&self) -> i64 {
        match self {
            Route::Tcp(r) => r.ping(),
            Route::Udp(r) => r.ping(),
            Route::Http(r) => r.ping(),
        }
    }

    pub fn as_http(&self) -> Option<&HttpRoute> {
        match self {
            Route::Http(r) => Some(r),
            _ => None,
        }
    }
}
