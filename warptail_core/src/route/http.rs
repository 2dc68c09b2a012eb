//! HTTP/HTTPS routes: host-dispatched reverse proxy handlers.
//!
//! These routes own no listener. The router's ingress demultiplexer matches
//! the request Host against route domains and hands the request to
//! [`HttpRoute::handle`], which executes it upstream through the tailnet
//! node's http client. The https variant is identical here; TLS is terminated
//! in front by the certificate-manager collaborator.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use http::header::{HeaderName, HeaderValue, HOST};
use http::{HeaderMap, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant};

use super::{read, write, RouterStatus, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT, LATENCY_UNREACHABLE};
use crate::config::{route_match, ProxySettings, RouteConfig};
use crate::error::RouterError;
use crate::tailnet::{TailnetHttpClient, TailnetNode};
use crate::timeseries::{TimeSeries, TimeSeriesData};

#[derive(Clone)]
pub struct HttpRoute {
    inner: Arc<HttpInner>,
}

struct HttpInner {
    node: Arc<TailnetNode>,
    config: RwLock<RouteConfig>,
    status: RwLock<RouterStatus>,
    data: Arc<TimeSeries>,
    latency_ms: AtomicI64,
    client: RwLock<TailnetHttpClient>,
    runtime: tokio::sync::Mutex<Option<HttpRuntime>>,
}

struct HttpRuntime {
    quit: watch::Sender<bool>,
    heartbeat: JoinHandle<()>,
}

impl HttpRoute {
    pub fn new(config: RouteConfig, node: Arc<TailnetNode>) -> Self {
        let client = node.http_client();
        HttpRoute {
            inner: Arc::new(HttpInner {
                node,
                config: RwLock::new(config),
                status: RwLock::new(RouterStatus::Stopped),
                data: Arc::new(TimeSeries::default()),
                latency_ms: AtomicI64::new(0),
                client: RwLock::new(client),
                runtime: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub async fn start(&self) -> Result<(), RouterError> {
        if self.status() == RouterStatus::Running {
            return Ok(());
        }
        // Rebuild the client: the node may have learned its overlay address
        // since construction.
        *write(&self.inner.client) = self.inner.node.http_client();

        let (quit_tx, quit_rx) = watch::channel(false);
        let heartbeat = tokio::spawn(heartbeat_loop(self.inner.clone(), quit_rx));
        *self.inner.runtime.lock().await = Some(HttpRuntime {
            quit: quit_tx,
            heartbeat,
        });

        *write(&self.inner.status) = RouterStatus::Running;
        log::info!("http route serving {} -> {}", self.config().domain, self.config().machine);
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), RouterError> {
        let Some(runtime) = self.inner.runtime.lock().await.take() else {
            return Err(RouterError::bad_request("route not running"));
        };
        *write(&self.inner.status) = RouterStatus::Stopped;
        let _ = runtime.quit.send(true);
        let _ = runtime.heartbeat.await;
        self.inner.latency_ms.store(LATENCY_UNREACHABLE, Ordering::Relaxed);
        Ok(())
    }

    /// Domain and target changes restart the route; everything else
    /// (timeout, headers, rules) re-parameterizes in place.
    pub async fn update(&self, config: RouteConfig) -> Result<(), RouterError> {
        if route_match(&self.config(), &config) {
            *write(&self.inner.config) = config;
            return Ok(());
        }
        let was_running = self.status() == RouterStatus::Running;
        let _ = self.stop().await;
        *write(&self.inner.config) = config;
        if was_running {
            self.start().await?;
        }
        Ok(())
    }

    pub fn config(&self) -> RouteConfig {
        read(&self.inner.config).clone()
    }

    pub fn status(&self) -> RouterStatus {
        *read(&self.inner.status)
    }

    pub fn stats(&self) -> TimeSeriesData {
        self.inner.data.snapshot()
    }

    pub fn ping(&self) -> i64 {
        self.inner.latency_ms.load(Ordering::Relaxed)
    }

    /// Proxy one request to the route's target. Body is buffered on both
    /// legs so the transfer can be counted against the route's series.
    pub async fn handle(&self, req: axum::extract::Request) -> Response {
        if self.status() != RouterStatus::Running {
            return bad_gateway();
        }
        let config = self.config();
        let settings = config.proxy_settings.clone().unwrap_or_default();

        let (parts, body) = req.into_parts();
        let original_host = parts
            .headers
            .get(HOST)
            .cloned()
            .or_else(|| parts.uri.authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()));

        let path = parts.uri.path().to_string();
        let query = parts.uri.query().map(|q| format!("?{}", q)).unwrap_or_default();
        let (target_host, target_port, out_path) = resolve_target(&config, &settings, &path);

        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                log::error!("[http]{} failed to read request body: {}", config.domain, e);
                return bad_gateway();
            }
        };
        self.inner.data.log_sent(body_bytes.len() as u64);

        let uri = format!("http://{}:{}{}{}", target_host, target_port, out_path, query);
        let mut headers = parts.headers.clone();
        // The body is re-sent with a known length.
        headers.remove(http::header::TRANSFER_ENCODING);
        if let Some(custom) = &settings.custom_headers {
            apply_headers(&mut headers, custom);
        }
        let host_value = if settings.preserve_host {
            original_host
        } else {
            HeaderValue::from_str(&format!("{}:{}", target_host, target_port)).ok()
        };
        match host_value {
            Some(value) => {
                headers.insert(HOST, value);
            }
            None => {
                headers.remove(HOST);
            }
        }

        let mut upstream = match hyper::Request::builder()
            .method(parts.method.clone())
            .uri(uri.as_str())
            .body(Full::new(body_bytes))
        {
            Ok(req) => req,
            Err(e) => {
                log::error!("[http]{} invalid upstream request {}: {}", config.domain, uri, e);
                return bad_gateway();
            }
        };
        *upstream.headers_mut() = headers;

        let client = read(&self.inner.client).clone();
        let deadline = Duration::from_secs(settings.timeout_seconds.max(1));
        let response = match timeout(deadline, client.request(upstream)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                log::error!("[http]{} -> {} proxy error: {}", config.domain, uri, e);
                return bad_gateway();
            }
            Err(_) => {
                log::error!("[http]{} -> {} timed out after {:?}", config.domain, uri, deadline);
                return bad_gateway();
            }
        };

        let (mut response_parts, response_body) = response.into_parts();
        if let Some(custom) = &settings.custom_headers {
            apply_headers(&mut response_parts.headers, custom);
        }
        let response_bytes = match response_body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                log::error!("[http]{} failed to read response body: {}", config.domain, e);
                return bad_gateway();
            }
        };
        self.inner.data.log_received(response_bytes.len() as u64);

        Response::from_parts(response_parts, Body::from(response_bytes))
    }
}

/// First matching rule wins: strip the prefix (keeping a leading slash),
/// prepend the rewrite, divert to the rule's target when given.
fn resolve_target(
    config: &RouteConfig,
    settings: &ProxySettings,
    path: &str,
) -> (String, u16, String) {
    for rule in &settings.rules {
        if !path.starts_with(rule.path.as_str()) {
            continue;
        }
        let mut out = if rule.strip_path {
            let stripped = &path[rule.path.len()..];
            if stripped.starts_with('/') {
                stripped.to_string()
            } else {
                format!("/{}", stripped)
            }
        } else {
            path.to_string()
        };
        if let Some(rewrite) = &rule.rewrite {
            out = format!("{}{}", rewrite.trim_end_matches('/'), out);
        }
        let host = rule
            .target_host
            .clone()
            .unwrap_or_else(|| config.machine.address.clone());
        let port = rule.target_port.unwrap_or(config.machine.port);
        return (host, port, out);
    }
    (config.machine.address.clone(), config.machine.port, path.to_string())
}

/// `remove`, then `add` (only if absent), then `set`.
fn apply_headers(headers: &mut HeaderMap, custom: &crate::config::ProxyHeaders) {
    for name in &custom.remove {
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            headers.remove(&name);
        }
    }
    for (name, value) in &custom.add {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            log::warn!("[http]skipping invalid header `{}`", name);
            continue;
        };
        if !headers.contains_key(&name) {
            headers.insert(name, value);
        }
    }
    for (name, value) in &custom.set {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            log::warn!("[http]skipping invalid header `{}`", name);
            continue;
        };
        headers.insert(name, value);
    }
}

fn bad_gateway() -> Response {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(Body::empty())
        .unwrap_or_default()
}

async fn heartbeat_loop(inner: Arc<HttpInner>, mut quit: watch::Receiver<bool>) {
    let mut ticker = interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = quit.changed() => return,
            _ = ticker.tick() => {
                if matches!(*read(&inner.status), RouterStatus::Stopping | RouterStatus::Stopped) {
                    return;
                }
                let machine = read(&inner.config).machine.clone();
                let uri = format!("http://{}/", machine);
                let request = hyper::Request::builder()
                    .method(http::Method::GET)
                    .uri(uri.as_str())
                    .body(Full::new(Bytes::new()));
                let Ok(request) = request else {
                    inner.latency_ms.store(LATENCY_UNREACHABLE, Ordering::Relaxed);
                    continue;
                };

                let client = read(&inner.client).clone();
                let start = Instant::now();
                let latency = match timeout(HEARTBEAT_TIMEOUT, client.request(request)).await {
                    Ok(Ok(_)) => start.elapsed().as_millis() as i64,
                    _ => LATENCY_UNREACHABLE,
                };
                inner.latency_ms.store(latency, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Machine, ProxyHeaders, ProxyRule, RouteType};
    use axum::routing::any;
    use axum::Router;
    use std::net::SocketAddr;

    fn http_config(domain: &str, backend: SocketAddr) -> RouteConfig {
        RouteConfig {
            kind: RouteType::Http,
            private: false,
            bot_protect: false,
            domain: domain.to_string(),
            port: 0,
            machine: Machine {
                node_name: String::new(),
                address: backend.ip().to_string(),
                port: backend.port(),
            },
            proxy_settings: None,
        }
    }

    fn test_node() -> Arc<TailnetNode> {
        Arc::new(TailnetNode::new("/nonexistent/warptail-test.sock"))
    }

    /// Backend answering `host|method|uri|x-probe` for any request.
    async fn spawn_echo_backend() -> SocketAddr {
        async fn echo(req: axum::extract::Request) -> String {
            let host = req
                .headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let probe = req
                .headers()
                .get("x-probe")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            format!("{}|{}|{}|{}", host, req.method(), req.uri(), probe)
        }

        let app = Router::new().fallback(any(echo));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    fn proxied_request(path: &str, host: &str) -> axum::extract::Request {
        axum::extract::Request::builder()
            .method("GET")
            .uri(path)
            .header(HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8_lossy(&bytes).to_string()
    }

    #[test]
    fn rules_strip_and_rewrite_the_path() {
        let mut config = RouteConfig {
            kind: RouteType::Http,
            private: false,
            bot_protect: false,
            domain: "api.example.com".to_string(),
            port: 0,
            machine: Machine {
                node_name: String::new(),
                address: "app.local".to_string(),
                port: 8080,
            },
            proxy_settings: None,
        };
        let settings = ProxySettings {
            rules: vec![ProxyRule {
                path: "/v1/".to_string(),
                target_host: Some("api-v1".to_string()),
                target_port: Some(9090),
                rewrite: None,
                strip_path: true,
            }],
            ..ProxySettings::default()
        };
        config.proxy_settings = Some(settings.clone());

        let (host, port, path) = resolve_target(&config, &settings, "/v1/users");
        assert_eq!((host.as_str(), port, path.as_str()), ("api-v1", 9090, "/users"));

        // No rule match falls through to the default machine.
        let (host, port, path) = resolve_target(&config, &settings, "/other");
        assert_eq!((host.as_str(), port, path.as_str()), ("app.local", 8080, "/other"));

        let rewriting = ProxySettings {
            rules: vec![ProxyRule {
                path: "/grafana".to_string(),
                target_host: None,
                target_port: None,
                rewrite: Some("/dashboards".to_string()),
                strip_path: true,
            }],
            ..ProxySettings::default()
        };
        let (_, _, path) = resolve_target(&config, &rewriting, "/grafana/home");
        assert_eq!(path, "/dashboards/home");
    }

    #[test]
    fn header_pipeline_applies_remove_add_set_in_order() {
        let mut headers = HeaderMap::new();
        headers.insert("x-drop", HeaderValue::from_static("1"));
        headers.insert("x-keep", HeaderValue::from_static("original"));

        let custom = ProxyHeaders {
            add: [
                ("x-keep".to_string(), "ignored".to_string()),
                ("x-new".to_string(), "added".to_string()),
            ]
            .into_iter()
            .collect(),
            set: [("x-forced".to_string(), "forced".to_string())].into_iter().collect(),
            remove: vec!["x-drop".to_string()],
        };
        apply_headers(&mut headers, &custom);

        assert!(headers.get("x-drop").is_none());
        assert_eq!(headers.get("x-keep").unwrap(), "original");
        assert_eq!(headers.get("x-new").unwrap(), "added");
        assert_eq!(headers.get("x-forced").unwrap(), "forced");
    }

    #[tokio::test]
    async fn proxies_to_the_default_machine() {
        let backend = spawn_echo_backend().await;
        let route = HttpRoute::new(http_config("app.example.com", backend), test_node());
        route.start().await.unwrap();

        let response = route.handle(proxied_request("/status?q=1", "app.example.com")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("|GET|/status?q=1|"), "unexpected body: {}", body);
        // Target host is forwarded when preserve_host is off.
        assert!(body.starts_with(&backend.to_string()), "unexpected body: {}", body);

        let stats = route.stats();
        assert!(stats.total.received > 0);

        route.stop().await.unwrap();
    }

    #[tokio::test]
    async fn preserve_host_forwards_the_original_host() {
        let backend = spawn_echo_backend().await;
        let mut config = http_config("app.example.com", backend);
        config.proxy_settings = Some(ProxySettings {
            preserve_host: true,
            ..ProxySettings::default()
        });
        let route = HttpRoute::new(config, test_node());
        route.start().await.unwrap();

        let response = route.handle(proxied_request("/", "app.example.com")).await;
        let body = body_string(response).await;
        assert!(body.starts_with("app.example.com|"), "unexpected body: {}", body);

        route.stop().await.unwrap();
    }

    #[tokio::test]
    async fn rule_rewrites_reach_the_backend() {
        let backend = spawn_echo_backend().await;
        let mut config = http_config("api.example.com", backend);
        config.proxy_settings = Some(ProxySettings {
            rules: vec![ProxyRule {
                path: "/v1/".to_string(),
                target_host: None,
                target_port: None,
                rewrite: None,
                strip_path: true,
            }],
            ..ProxySettings::default()
        });
        let route = HttpRoute::new(config, test_node());
        route.start().await.unwrap();

        let response = route.handle(proxied_request("/v1/users", "api.example.com")).await;
        let body = body_string(response).await;
        assert!(body.contains("|GET|/users|"), "unexpected body: {}", body);

        route.stop().await.unwrap();
    }

    #[tokio::test]
    async fn custom_headers_are_sent_upstream() {
        let backend = spawn_echo_backend().await;
        let mut config = http_config("app.example.com", backend);
        config.proxy_settings = Some(ProxySettings {
            custom_headers: Some(ProxyHeaders {
                set: [("x-probe".to_string(), "injected".to_string())].into_iter().collect(),
                ..ProxyHeaders::default()
            }),
            ..ProxySettings::default()
        });
        let route = HttpRoute::new(config, test_node());
        route.start().await.unwrap();

        let response = route.handle(proxied_request("/", "app.example.com")).await;
        let body = body_string(response).await;
        assert!(body.ends_with("|injected"), "unexpected body: {}", body);

        route.stop().await.unwrap();
    }

    #[tokio::test]
    async fn responds_bad_gateway_when_stopped() {
        let backend = spawn_echo_backend().await;
        let route = HttpRoute::new(http_config("app.example.com", backend), test_node());

        let response = route.handle(proxied_request("/", "app.example.com")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn update_reparameterizes_without_restart() {
        let backend = spawn_echo_backend().await;
        let route = HttpRoute::new(http_config("app.example.com", backend), test_node());
        route.start().await.unwrap();

        let mut updated = route.config();
        updated.proxy_settings = Some(ProxySettings {
            timeout_seconds: 5,
            ..ProxySettings::default()
        });
        route.update(updated).await.unwrap();

        assert_eq!(route.status(), RouterStatus::Running);
        assert_eq!(
            route.config().proxy_settings.unwrap().timeout_seconds,
            5
        );

        route.stop().await.unwrap();
    }
}
