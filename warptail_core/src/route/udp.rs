//! UDP ingress: stateless datagrams with per-client flow identity.
//!
//! Datagrams have no connections, but upstream protocols (QUIC among them)
//! need a stable mapping from client to backend flow. The handler keeps a
//! session table keyed by client address: a public reader forwards client
//! packets to the backend through a socket on the tailnet node, a single
//! overlay reader fans replies back out to every recently-seen session, and a
//! janitor prunes idle sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};

use super::{lock, read, write, RouterStatus, HEARTBEAT_INTERVAL, LATENCY_UNREACHABLE};
use crate::config::{route_match, RouteConfig};
use crate::error::RouterError;
use crate::tailnet::{set_udp_buffers, TailnetNode};
use crate::timeseries::{TimeSeries, TimeSeriesData};

const UDP_BUFFER_SIZE: usize = 65535;
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const JANITOR_INTERVAL: Duration = Duration::from_secs(10);

struct UdpSession {
    client: SocketAddr,
    last_seen_ms: AtomicI64,
    closed: AtomicBool,
}

impl UdpSession {
    fn new(client: SocketAddr) -> Self {
        UdpSession {
            client,
            last_seen_ms: AtomicI64::new(now_ms()),
            closed: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        self.last_seen_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn idle_longer_than(&self, timeout: Duration) -> bool {
        let last = self.last_seen_ms.load(Ordering::Relaxed);
        now_ms().saturating_sub(last) > timeout.as_millis() as i64
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Clone)]
pub struct UdpRoute {
    inner: Arc<UdpInner>,
}

struct UdpInner {
    node: Arc<TailnetNode>,
    config: RwLock<RouteConfig>,
    status: RwLock<RouterStatus>,
    data: Arc<TimeSeries>,
    latency_ms: AtomicI64,
    sessions: Mutex<HashMap<String, Arc<UdpSession>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    runtime: tokio::sync::Mutex<Option<UdpRuntime>>,
}

struct UdpRuntime {
    quit: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpRoute {
    pub fn new(config: RouteConfig, node: Arc<TailnetNode>) -> Self {
        UdpRoute {
            inner: Arc::new(UdpInner {
                node,
                config: RwLock::new(config),
                status: RwLock::new(RouterStatus::Stopped),
                data: Arc::new(TimeSeries::default()),
                latency_ms: AtomicI64::new(0),
                sessions: Mutex::new(HashMap::new()),
                local_addr: Mutex::new(None),
                runtime: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub async fn start(&self) -> Result<(), RouterError> {
        if self.status() == RouterStatus::Running {
            let _ = self.stop().await;
        }
        self.inner.set_status(RouterStatus::Starting);

        let config = self.config();
        let backend = match tokio::net::lookup_host((config.machine.address.as_str(), config.machine.port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
        {
            Some(addr) => addr,
            None => {
                self.inner.set_status(RouterStatus::Stopped);
                return Err(RouterError::transient(format!(
                    "failed to resolve udp backend {}",
                    config.machine
                )));
            }
        };

        let public = match UdpSocket::bind(("0.0.0.0", config.port)).await {
            Ok(sock) => {
                if let Err(e) = set_udp_buffers(&sock) {
                    log::warn!("[udp]failed to size socket buffers: {}", e);
                }
                Arc::new(sock)
            }
            Err(e) => {
                self.inner.set_status(RouterStatus::Stopped);
                return Err(RouterError::transient(format!(
                    "failed to bind udp :{}: {}",
                    config.port, e
                )));
            }
        };
        let overlay = match self.inner.node.listen_packet().await {
            Ok(sock) => Arc::new(sock),
            Err(e) => {
                self.inner.set_status(RouterStatus::Stopped);
                return Err(RouterError::transient(format!(
                    "failed to open overlay socket: {}",
                    e
                )));
            }
        };
        *lock(&self.inner.local_addr) = public.local_addr().ok();

        let (quit_tx, quit_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(public_reader(
                self.inner.clone(),
                public.clone(),
                overlay.clone(),
                backend,
                quit_rx.clone(),
            )),
            tokio::spawn(overlay_reader(
                self.inner.clone(),
                overlay,
                public,
                quit_rx.clone(),
            )),
            tokio::spawn(janitor(self.inner.clone(), quit_rx.clone())),
            tokio::spawn(heartbeat_loop(self.inner.clone(), backend, quit_rx)),
        ];
        *self.inner.runtime.lock().await = Some(UdpRuntime { quit: quit_tx, tasks });

        self.inner.set_status(RouterStatus::Running);
        log::info!("udp route listening on :{} -> {}", config.port, config.machine);
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), RouterError> {
        let Some(runtime) = self.inner.runtime.lock().await.take() else {
            return Err(RouterError::bad_request("route not running"));
        };
        self.inner.set_status(RouterStatus::Stopping);

        let _ = runtime.quit.send(true);
        for task in runtime.tasks {
            let _ = task.await;
        }
        self.inner.close_all_sessions();

        *lock(&self.inner.local_addr) = None;
        self.inner.set_status(RouterStatus::Stopped);
        log::info!("stopped udp route on :{}", self.config().port);
        Ok(())
    }

    pub async fn update(&self, config: RouteConfig) -> Result<(), RouterError> {
        if route_match(&self.config(), &config) {
            *write(&self.inner.config) = config;
            return Ok(());
        }
        let _ = self.stop().await;
        *write(&self.inner.config) = config;
        self.start().await
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

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.local_addr)
    }

    /// Number of live sessions; bounded by the distinct client addresses seen
    /// within the idle window.
    pub fn session_count(&self) -> usize {
        lock(&self.inner.sessions).len()
    }
}

impl UdpInner {
    fn set_status(&self, status: RouterStatus) {
        *write(&self.status) = status;
    }

    fn touch_session(&self, client: SocketAddr) {
        let key = client.to_string();
        let mut sessions = lock(&self.sessions);
        match sessions.get(&key) {
            Some(session) if !session.closed.load(Ordering::Relaxed) => session.touch(),
            _ => {
                sessions.insert(key.clone(), Arc::new(UdpSession::new(client)));
                log::info!("[udp]new session {}", key);
            }
        }
    }

    fn live_clients(&self) -> Vec<SocketAddr> {
        lock(&self.sessions)
            .values()
            .filter(|s| !s.closed.load(Ordering::Relaxed) && !s.idle_longer_than(SESSION_IDLE_TIMEOUT))
            .map(|s| s.client)
            .collect()
    }

    fn prune_idle(&self) {
        let mut sessions = lock(&self.sessions);
        sessions.retain(|key, session| {
            if session.idle_longer_than(SESSION_IDLE_TIMEOUT) {
                session.closed.store(true, Ordering::Relaxed);
                log::info!("[udp]pruned idle session {}", key);
                false
            } else {
                true
            }
        });
    }

    fn close_all_sessions(&self) {
        let mut sessions = lock(&self.sessions);
        for session in sessions.values() {
            session.closed.store(true, Ordering::Relaxed);
        }
        sessions.clear();
    }
}

/// Reads client datagrams, upserts their session and forwards to the backend
/// through the overlay socket. Serial per socket, preserving per-client order.
async fn public_reader(
    inner: Arc<UdpInner>,
    public: Arc<UdpSocket>,
    overlay: Arc<UdpSocket>,
    backend: SocketAddr,
    mut quit: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = quit.changed() => return,
            res = public.recv_from(&mut buf) => match res {
                Ok((n, client)) => {
                    inner.touch_session(client);
                    match overlay.send_to(&buf[..n], backend).await {
                        Ok(sent) => inner.data.log_sent(sent as u64),
                        Err(e) => log::error!("[udp]forward to {} failed: {}", backend, e),
                    }
                }
                Err(e) => {
                    log::error!("[udp]read failed: {}", e);
                    continue;
                }
            }
        }
    }
}

/// Reads replies from the overlay socket and fans them out to every session
/// seen within the idle window.
async fn overlay_reader(
    inner: Arc<UdpInner>,
    overlay: Arc<UdpSocket>,
    public: Arc<UdpSocket>,
    mut quit: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = quit.changed() => return,
            res = overlay.recv_from(&mut buf) => match res {
                Ok((n, _)) => {
                    for client in inner.live_clients() {
                        match public.send_to(&buf[..n], client).await {
                            Ok(sent) => inner.data.log_received(sent as u64),
                            Err(e) => log::debug!("[udp]reply to {} failed: {}", client, e),
                        }
                    }
                }
                Err(e) => {
                    log::error!("[udp]overlay read failed: {}", e);
                    continue;
                }
            }
        }
    }
}

async fn janitor(inner: Arc<UdpInner>, mut quit: watch::Receiver<bool>) {
    let mut ticker = interval(JANITOR_INTERVAL);
    loop {
        tokio::select! {
            _ = quit.changed() => return,
            _ = ticker.tick() => inner.prune_idle(),
        }
    }
}

async fn heartbeat_loop(inner: Arc<UdpInner>, backend: SocketAddr, mut quit: watch::Receiver<bool>) {
    let mut ticker = interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = quit.changed() => return,
            _ = ticker.tick() => {
                if matches!(*read(&inner.status), RouterStatus::Stopping | RouterStatus::Stopped) {
                    return;
                }
                let start = Instant::now();
                let probe = async {
                    let sock = UdpSocket::bind("0.0.0.0:0").await?;
                    sock.connect(backend).await
                };
                let latency = match probe.await {
                    Ok(()) => start.elapsed().as_millis() as i64,
                    Err(_) => LATENCY_UNREACHABLE,
                };
                inner.latency_ms.store(latency, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Machine, RouteType};

    fn test_config(backend_port: u16) -> RouteConfig {
        RouteConfig {
            kind: RouteType::Udp,
            private: false,
            bot_protect: false,
            domain: String::new(),
            port: 0,
            machine: Machine {
                node_name: String::new(),
                address: "127.0.0.1".to_string(),
                port: backend_port,
            },
            proxy_settings: None,
        }
    }

    fn test_node() -> Arc<TailnetNode> {
        Arc::new(TailnetNode::new("/nonexistent/warptail-test.sock"))
    }

    async fn spawn_echo_backend() -> SocketAddr {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; UDP_BUFFER_SIZE];
            while let Ok((n, from)) = sock.recv_from(&mut buf).await {
                let _ = sock.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn datagrams_round_trip_to_the_same_client() {
        let backend = spawn_echo_backend().await;
        let route = UdpRoute::new(test_config(backend.port()), test_node());
        route.start().await.expect("start");

        let ingress = route.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(("127.0.0.1", ingress.port())).await.unwrap();

        for payload in [&b"alpha"[..], &b"bravo"[..]] {
            client.send(payload).await.unwrap();
            let mut buf = [0u8; 64];
            let n = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
                .await
                .expect("reply before timeout")
                .unwrap();
            assert_eq!(&buf[..n], payload);
        }

        assert_eq!(route.session_count(), 1);
        let stats = route.stats();
        assert_eq!(stats.total.sent, 10);
        assert!(stats.total.received >= 10);

        route.stop().await.expect("stop");
        assert_eq!(route.session_count(), 0);
        assert_eq!(route.status(), RouterStatus::Stopped);
    }

    #[tokio::test]
    async fn janitor_prunes_idle_sessions() {
        let route = UdpRoute::new(test_config(9), test_node());
        let client: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        route.inner.touch_session(client);
        assert_eq!(route.session_count(), 1);

        // Age the session past the idle window, then sweep.
        {
            let sessions = lock(&route.inner.sessions);
            let session = sessions.values().next().unwrap();
            session
                .last_seen_ms
                .store(now_ms() - SESSION_IDLE_TIMEOUT.as_millis() as i64 - 1000, Ordering::Relaxed);
        }
        route.inner.prune_idle();
        assert_eq!(route.session_count(), 0);
    }

    #[tokio::test]
    async fn idle_sessions_do_not_receive_fanout() {
        let route = UdpRoute::new(test_config(9), test_node());
        let fresh: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let stale: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        route.inner.touch_session(fresh);
        route.inner.touch_session(stale);
        {
            let sessions = lock(&route.inner.sessions);
            let session = sessions.get(&stale.to_string()).unwrap();
            session
                .last_seen_ms
                .store(now_ms() - SESSION_IDLE_TIMEOUT.as_millis() as i64 - 1000, Ordering::Relaxed);
        }

        let live = route.inner.live_clients();
        assert_eq!(live, vec![fresh]);
    }
}
