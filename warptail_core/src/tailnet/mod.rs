//! Tailnet node manager.
//!
//! Wraps the userspace mesh node running as a local daemon. The control plane
//! (bring-up, status, peers) goes over the daemon's unix socket; the data
//! plane enters the mesh by binding outgoing sockets to the node's overlay
//! address, so the kernel routes them through the mesh interface.

pub mod localapi;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::time::{sleep, timeout, Instant};

use crate::error::RouterError;
use localapi::{LocalApiClient, LocalApiRequest, LocalApiResponse};

pub const ENV_TAILNET_SOCKET: &str = "WARPTAIL_TAILNET_SOCKET";
pub const DEFAULT_TAILNET_SOCKET: &str = "/var/run/tailnetd.sock";

const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);
const READY_DEADLINE: Duration = Duration::from_secs(60);
const UDP_SOCKET_BUFFER: usize = 4 * 1024 * 1024;

/// Node identity as declared in configuration.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailscaleConfig {
    #[serde(default)]
    pub auth_key: String,
    #[serde(default)]
    pub hostname: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendState {
    #[default]
    NoState,
    Starting,
    Running,
    NeedsLogin,
    Stopped,
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendState::NoState => "NoState",
            BackendState::Starting => "Starting",
            BackendState::Running => "Running",
            BackendState::NeedsLogin => "NeedsLogin",
            BackendState::Stopped => "Stopped",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailnetPeer {
    pub name: String,
    pub hostname: String,
    pub ip: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub online: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TailnetStatus {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub backend_state: BackendState,
    #[serde(default)]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_expiry: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_ip: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
    #[serde(default)]
    pub peers: Vec<TailnetPeer>,
}

pub type TailnetHttpClient = Client<HttpConnector, Full<Bytes>>;

#[derive(Default)]
struct NodeState {
    config: Option<TailscaleConfig>,
    status: Option<TailnetStatus>,
}

/// The process-wide mesh node handle. Reconfiguration is serialized by the
/// router, which tears down all routes first.
pub struct TailnetNode {
    client: LocalApiClient,
    state: Mutex<NodeState>,
    ready_poll: Duration,
    ready_deadline: Duration,
}

impl TailnetNode {
    pub fn new(socket_path: impl AsRef<std::path::Path>) -> Self {
        TailnetNode {
            client: LocalApiClient::new(socket_path),
            state: Mutex::new(NodeState::default()),
            ready_poll: READY_POLL_INTERVAL,
            ready_deadline: READY_DEADLINE,
        }
    }

    pub fn from_env() -> Self {
        let path =
            std::env::var(ENV_TAILNET_SOCKET).unwrap_or_else(|_| DEFAULT_TAILNET_SOCKET.to_string());
        TailnetNode::new(path)
    }

    #[cfg(test)]
    fn with_timing(mut self, poll: Duration, deadline: Duration) -> Self {
        self.ready_poll = poll;
        self.ready_deadline = deadline;
        self
    }

    pub fn config(&self) -> Option<TailscaleConfig> {
        self.lock_state().config.clone()
    }

    pub fn identity_matches(&self, config: &TailscaleConfig) -> bool {
        match &self.lock_state().config {
            Some(current) => current == config,
            None => false,
        }
    }

    /// Bring the node up with the given identity and wait until the backend
    /// reports Running. Idempotent: an already-running node with the same
    /// identity returns its status immediately.
    pub async fn bring_up(&self, config: &TailscaleConfig) -> Result<TailnetStatus, RouterError> {
        if self.identity_matches(config) {
            if let Ok(status) = self.refresh_status().await {
                if status.backend_state == BackendState::Running {
                    return Ok(status);
                }
            }
        }
        self.send_up(config).await?;
        self.wait_ready().await
    }

    /// Replace the node identity: close the current session, start a new one
    /// and wait for it. The caller must have stopped all routes.
    pub async fn reconfigure(&self, config: &TailscaleConfig) -> Result<TailnetStatus, RouterError> {
        if let Err(e) = self.call(&LocalApiRequest::Down).await {
            log::warn!("tailnet down failed: {}", e);
        }
        self.send_up(config).await?;
        self.wait_ready().await
    }

    pub async fn status(&self) -> Result<TailnetStatus, RouterError> {
        self.refresh_status().await
    }

    pub fn cached_status(&self) -> Option<TailnetStatus> {
        self.lock_state().status.clone()
    }

    pub async fn peers(&self) -> Result<Vec<TailnetPeer>, RouterError> {
        match self.call(&LocalApiRequest::Peers).await? {
            LocalApiResponse::Peers { peers } => Ok(peers),
            LocalApiResponse::Error { message } => Err(RouterError::overlay_unavailable(message)),
            _ => Err(RouterError::overlay_unavailable("unexpected daemon response")),
        }
    }

    /// Open a tcp connection into the overlay. Without a known overlay
    /// address (node down, plain targets) this degrades to a direct connect.
    pub async fn dial(&self, host: &str, port: u16, deadline: Duration) -> io::Result<TcpStream> {
        let addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved"))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(ip) = self.overlay_ip() {
            if ip.is_ipv4() == addr.is_ipv4() {
                socket.bind(SocketAddr::new(ip, 0))?;
            }
        }

        match timeout(deadline, socket.connect(addr)).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {} timed out", addr),
            )),
        }
    }

    /// Bind a udp socket on the node's overlay address so replies from mesh
    /// targets come back with a stable source.
    pub async fn listen_packet(&self) -> io::Result<UdpSocket> {
        let bind_addr = match self.overlay_ip() {
            Some(ip) => SocketAddr::new(ip, 0),
            None => SocketAddr::new(IpAddr::from([0u8, 0, 0, 0]), 0),
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        set_udp_buffers(&socket)?;
        Ok(socket)
    }

    /// Client whose transport dials from the overlay address.
    pub fn http_client(&self) -> TailnetHttpClient {
        let mut connector = HttpConnector::new();
        connector.set_local_address(self.overlay_ip());
        Client::builder(TokioExecutor::new()).build(connector)
    }

    pub fn overlay_ip(&self) -> Option<IpAddr> {
        self.lock_state().status.as_ref().and_then(|s| s.self_ip)
    }

    async fn send_up(&self, config: &TailscaleConfig) -> Result<(), RouterError> {
        match self
            .call(&LocalApiRequest::Up {
                auth_key: config.auth_key.clone(),
                hostname: config.hostname.clone(),
            })
            .await?
        {
            LocalApiResponse::Error { message } => Err(RouterError::overlay_unavailable(message)),
            _ => {
                self.lock_state().config = Some(config.clone());
                Ok(())
            }
        }
    }

    async fn wait_ready(&self) -> Result<TailnetStatus, RouterError> {
        let deadline = Instant::now() + self.ready_deadline;
        let mut last: Option<TailnetStatus> = None;

        loop {
            match self.refresh_status().await {
                Ok(status) => {
                    match status.backend_state {
                        BackendState::Running => return Ok(status),
                        BackendState::NeedsLogin => log::warn!(
                            "tailnet needs login{}",
                            status
                                .auth_url
                                .as_deref()
                                .map(|u| format!(": {}", u))
                                .unwrap_or_default()
                        ),
                        state => log::info!("waiting for tailnet, backend state {}", state),
                    }
                    last = Some(status);
                }
                Err(e) => log::warn!("tailnet status poll failed: {}", e.message()),
            }

            if Instant::now() >= deadline {
                break;
            }
            sleep(self.ready_poll).await;
        }

        let message = match last {
            Some(status) if status.backend_state == BackendState::NeedsLogin => format!(
                "tailnet needs login{}",
                status
                    .auth_url
                    .as_deref()
                    .map(|u| format!(": {}", u))
                    .unwrap_or_default()
            ),
            Some(status) => format!(
                "tailnet not ready after {}s, backend state {}",
                self.ready_deadline.as_secs(),
                status.backend_state
            ),
            None => "tailnet daemon unreachable".to_string(),
        };
        Err(RouterError::overlay_unavailable(message))
    }

    async fn refresh_status(&self) -> Result<TailnetStatus, RouterError> {
        match self.call(&LocalApiRequest::Status).await? {
            LocalApiResponse::Status { status } => {
                self.lock_state().status = Some(status.clone());
                Ok(status)
            }
            LocalApiResponse::Error { message } => Err(RouterError::overlay_unavailable(message)),
            _ => Err(RouterError::overlay_unavailable("unexpected daemon response")),
        }
    }

    async fn call(&self, request: &LocalApiRequest) -> Result<LocalApiResponse, RouterError> {
        self.client.call(request).await.map_err(|e| {
            RouterError::overlay_unavailable(format!(
                "tailnet daemon unreachable at {}: {}",
                self.client.path().display(),
                e
            ))
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, NodeState> {
        match self.state.lock() {
            Ok(x) => x,
            Err(e) => e.into_inner(),
        }
    }
}

pub(crate) fn set_udp_buffers(socket: &UdpSocket) -> io::Result<()> {
    let sock = socket2::SockRef::from(socket);
    sock.set_recv_buffer_size(UDP_SOCKET_BUFFER)?;
    sock.set_send_buffer_size(UDP_SOCKET_BUFFER)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::UnixListener;

    static SOCKET_SEQ: AtomicUsize = AtomicUsize::new(0);

    fn socket_path() -> PathBuf {
        let seq = SOCKET_SEQ.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("warptail-tailnet-{}-{}.sock", std::process::id(), seq))
    }

    fn running_status() -> TailnetStatus {
        TailnetStatus {
            version: "1.80.0".to_string(),
            backend_state: BackendState::Running,
            hostname: "gateway".to_string(),
            self_ip: Some("127.0.0.1".parse().unwrap()),
            ..TailnetStatus::default()
        }
    }

    fn spawn_daemon<F>(path: PathBuf, respond: F)
    where
        F: Fn(LocalApiRequest) -> LocalApiResponse + Send + Sync + 'static,
    {
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).expect("bind daemon socket");
        let respond = Arc::new(respond);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let respond = respond.clone();
                tokio::spawn(async move {
                    if let Ok(request) = localapi::read_frame::<_, LocalApiRequest>(&mut stream).await {
                        let response = respond(request);
                        let _ = localapi::write_frame(&mut stream, &response).await;
                    }
                });
            }
        });
    }

    #[tokio::test]
    async fn bring_up_waits_for_running_backend() {
        let path = socket_path();
        spawn_daemon(path.clone(), |request| match request {
            LocalApiRequest::Up { .. } => LocalApiResponse::Ok,
            LocalApiRequest::Status => LocalApiResponse::Status {
                status: running_status(),
            },
            _ => LocalApiResponse::Ok,
        });

        let node = TailnetNode::new(&path)
            .with_timing(Duration::from_millis(50), Duration::from_millis(500));
        let config = TailscaleConfig {
            auth_key: "tskey-abc".to_string(),
            hostname: "gateway".to_string(),
        };

        let status = node.bring_up(&config).await.expect("bring up");
        assert_eq!(status.backend_state, BackendState::Running);
        assert!(node.identity_matches(&config));
        assert_eq!(node.overlay_ip(), Some("127.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn bring_up_reports_needs_login_on_deadline() {
        let path = socket_path();
        spawn_daemon(path.clone(), |request| match request {
            LocalApiRequest::Up { .. } => LocalApiResponse::Ok,
            LocalApiRequest::Status => LocalApiResponse::Status {
                status: TailnetStatus {
                    backend_state: BackendState::NeedsLogin,
                    auth_url: Some("https://login.example/a/b".to_string()),
                    ..TailnetStatus::default()
                },
            },
            _ => LocalApiResponse::Ok,
        });

        let node = TailnetNode::new(&path)
            .with_timing(Duration::from_millis(50), Duration::from_millis(200));
        let err = node
            .bring_up(&TailscaleConfig::default())
            .await
            .expect_err("deadline should expire");
        assert!(err.needs_login(), "unexpected error: {}", err);
        assert!(err.message().contains("https://login.example/a/b"));
    }

    #[tokio::test]
    async fn status_fails_when_daemon_is_missing() {
        let node = TailnetNode::new(socket_path());
        let err = node.status().await.expect_err("no daemon");
        assert_eq!(err.kind(), crate::error::ErrorKind::OverlayUnavailable);
    }

    #[tokio::test]
    async fn dial_falls_back_to_direct_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let node = TailnetNode::new(socket_path());
        let stream = node
            .dial("127.0.0.1", addr.port(), Duration::from_secs(1))
            .await
            .expect("direct dial");
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn peers_query_round_trips() {
        let path = socket_path();
        spawn_daemon(path.clone(), |request| match request {
            LocalApiRequest::Peers => LocalApiResponse::Peers {
                peers: vec![TailnetPeer {
                    name: "db".to_string(),
                    hostname: "db-host".to_string(),
                    ip: "100.64.0.7".parse().unwrap(),
                    last_seen: None,
                    online: true,
                    os: "linux".to_string(),
                    key_expiry: None,
                }],
            },
            _ => LocalApiResponse::Ok,
        });

        let node = TailnetNode::new(&path);
        let peers = node.peers().await.expect("peers");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].hostname, "db-host");
    }
}
