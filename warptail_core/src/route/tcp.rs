//! TCP ingress: accept on the public port, relay through the tailnet.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, Instant};

use super::{lock, read, write, RouterStatus, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT, LATENCY_UNREACHABLE};
use crate::config::{route_match, RouteConfig};
use crate::error::RouterError;
use crate::tailnet::TailnetNode;
use crate::timeseries::{TimeSeries, TimeSeriesData};

const TCP_BUFFER_SIZE: usize = 32 * 1024;
const TCP_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct TcpRoute {
    inner: Arc<TcpInner>,
}

struct TcpInner {
    node: Arc<TailnetNode>,
    config: RwLock<RouteConfig>,
    status: RwLock<RouterStatus>,
    data: Arc<TimeSeries>,
    latency_ms: AtomicI64,
    local_addr: Mutex<Option<SocketAddr>>,
    runtime: tokio::sync::Mutex<Option<TcpRuntime>>,
}

struct TcpRuntime {
    quit: watch::Sender<bool>,
    accept: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl TcpRoute {
    pub fn new(config: RouteConfig, node: Arc<TailnetNode>) -> Self {
        TcpRoute {
            inner: Arc::new(TcpInner {
                node,
                config: RwLock::new(config),
                status: RwLock::new(RouterStatus::Stopped),
                data: Arc::new(TimeSeries::default()),
                latency_ms: AtomicI64::new(0),
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

        let port = self.config().port;
        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(lis) => lis,
            Err(e) => {
                self.inner.set_status(RouterStatus::Stopped);
                return Err(RouterError::transient(format!(
                    "failed to bind tcp :{}: {}",
                    port, e
                )));
            }
        };
        *lock(&self.inner.local_addr) = listener.local_addr().ok();

        let (quit_tx, quit_rx) = watch::channel(false);
        let accept = tokio::spawn(accept_loop(self.inner.clone(), listener, quit_rx.clone()));
        let heartbeat = tokio::spawn(heartbeat_loop(self.inner.clone(), quit_rx));
        *self.inner.runtime.lock().await = Some(TcpRuntime {
            quit: quit_tx,
            accept,
            heartbeat,
        });

        self.inner.set_status(RouterStatus::Running);
        log::info!("tcp route listening on :{} -> {}", port, self.config().machine);
        Ok(())
    }

    /// Close the listener, force-close tracked connections and wait for the
    /// background tasks to drain.
    pub async fn stop(&self) -> Result<(), RouterError> {
        let Some(runtime) = self.inner.runtime.lock().await.take() else {
            return Err(RouterError::bad_request("route not running"));
        };
        self.inner.set_status(RouterStatus::Stopping);

        let _ = runtime.quit.send(true);
        let _ = runtime.accept.await;
        let _ = runtime.heartbeat.await;

        *lock(&self.inner.local_addr) = None;
        self.inner.set_status(RouterStatus::Stopped);
        log::info!("stopped tcp route on :{}", self.config().port);
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

    /// Bound ingress address while running; used by tests and diagnostics.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.local_addr)
    }
}

impl TcpInner {
    fn set_status(&self, status: RouterStatus) {
        *write(&self.status) = status;
    }

    fn backend(&self) -> (String, u16) {
        let config = read(&self.config);
        (config.machine.address.clone(), config.machine.port)
    }
}

async fn accept_loop(inner: Arc<TcpInner>, listener: TcpListener, mut quit: watch::Receiver<bool>) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            _ = quit.changed() => break,
            res = listener.accept() => match res {
                Ok((client, peer)) => {
                    let inner = inner.clone();
                    let quit = quit.clone();
                    sessions.spawn(relay_connection(inner, client, peer, quit));
                }
                Err(e) => {
                    log::warn!("[tcp]failed to accept: {}", e);
                    continue;
                }
            }
        }
    }

    // Release the port before draining, so a restart can rebind immediately.
    drop(listener);
    sessions.abort_all();
    while sessions.join_next().await.is_some() {}
}

async fn relay_connection(
    inner: Arc<TcpInner>,
    client: TcpStream,
    peer: SocketAddr,
    mut quit: watch::Receiver<bool>,
) {
    let (address, port) = inner.backend();
    let backend = tokio::select! {
        _ = quit.changed() => return,
        res = inner.node.dial(&address, port, TCP_DIAL_TIMEOUT) => match res {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("[tcp]{} => {}:{} connect failed: {}", peer, address, port, e);
                return;
            }
        }
    };

    let _ = client.set_nodelay(true);
    let (mut client_read, mut client_write) = client.into_split();
    let (mut backend_read, mut backend_write) = backend.into_split();

    let sent = inner.data.clone();
    let received = inner.data.clone();
    let upstream = copy_counted(&mut client_read, &mut backend_write, move |n| sent.log_sent(n));
    let downstream = copy_counted(&mut backend_read, &mut client_write, move |n| {
        received.log_received(n)
    });
    let _ = tokio::join!(upstream, downstream);

    log::debug!("[tcp]{} => {}:{} finished", peer, address, port);
}

async fn copy_counted<R, W, F>(reader: &mut R, writer: &mut W, count: F) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut buf = vec![0u8; TCP_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let _ = writer.shutdown().await;
                return Err(e);
            }
        };
        writer.write_all(&buf[..n]).await?;
        count(n as u64);
        total += n as u64;
    }
    let _ = writer.shutdown().await;
    Ok(total)
}

async fn heartbeat_loop(inner: Arc<TcpInner>, mut quit: watch::Receiver<bool>) {
    let mut ticker = interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = quit.changed() => return,
            _ = ticker.tick() => {
                if matches!(*read(&inner.status), RouterStatus::Stopping | RouterStatus::Stopped) {
                    return;
                }
                let (address, port) = inner.backend();
                let start = Instant::now();
                let latency = match inner.node.dial(&address, port, HEARTBEAT_TIMEOUT).await {
                    Ok(_) => start.elapsed().as_millis() as i64,
                    Err(_) => LATENCY_UNREACHABLE,
                };
                inner.latency_ms.store(latency, Ordering::Relaxed);
            }
        }
    }
}
