//! File controller: persists router state to the config document and reloads
//! the router when the file changes under an external editor.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use warptail_core::{Controller, Router, RouterSnapshot};

use crate::conf::{config_hash, load_config, Config};

pub struct FileController {
    path: PathBuf,
    last_hash: Arc<Mutex<Option<[u8; 32]>>>,
}

impl FileController {
    pub fn new(path: impl Into<PathBuf>) -> FileController {
        let path = path.into();
        let last_hash = Arc::new(Mutex::new(config_hash(&path).ok()));
        FileController { path, last_hash }
    }
}

impl Controller for FileController {
    /// Serialize the snapshot into the config document. The write happens on
    /// its own task so the router's critical section stays free of file io.
    fn persist(&self, snapshot: &RouterSnapshot) {
        let path = self.path.clone();
        let last_hash = self.last_hash.clone();
        let snapshot = snapshot.clone();
        tokio::spawn(async move {
            match write_snapshot(&path, &snapshot).await {
                Ok(()) => {
                    *lock(&last_hash) = config_hash(&path).ok();
                    log::debug!("saved config to {}", path.display());
                }
                Err(e) => log::error!("unable to save config to {}: {}", path.display(), e),
            }
        });
    }

    fn start(&self, router: Arc<Router>) {
        let path = self.path.clone();
        let last_hash = self.last_hash.clone();
        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel::<notify::Result<Event>>(16);
            let mut watcher: RecommendedWatcher =
                match notify::recommended_watcher(move |res: notify::Result<Event>| {
                    let _ = tx.blocking_send(res);
                }) {
                    Ok(w) => w,
                    Err(e) => {
                        log::error!("unable to create config watcher: {}", e);
                        return;
                    }
                };
            if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
                log::error!("unable to watch {}: {}", path.display(), e);
                return;
            }
            log::info!("watching {} for changes", path.display());

            while let Some(event) = rx.recv().await {
                match event {
                    Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                        handle_change(&path, &last_hash, &router).await;
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("config watcher error: {}", e),
                }
            }
        });
    }
}

/// Reload the router if the file content actually changed. Our own saves
/// update the stored hash first, so they do not bounce back into a reload.
async fn handle_change(path: &Path, last_hash: &Arc<Mutex<Option<[u8; 32]>>>, router: &Arc<Router>) {
    let current = match config_hash(path) {
        Ok(hash) => hash,
        Err(e) => {
            log::warn!("unable to hash {}: {}", path.display(), e);
            return;
        }
    };

    let changed = {
        let mut guard = lock(last_hash);
        if *guard == Some(current) {
            false
        } else {
            *guard = Some(current);
            true
        }
    };
    if !changed {
        return;
    }

    log::info!("config modified by an external source, reloading");
    match load_config(path) {
        Ok(config) => router.reload(&config.tailscale, config.services).await,
        Err(e) => log::error!("ignoring invalid config {}: {}", path.display(), e),
    }
}

/// Replace the services and tailscale sections of the existing document,
/// leaving every collaborator section intact, then swap the file atomically.
async fn write_snapshot(path: &Path, snapshot: &RouterSnapshot) -> std::io::Result<()> {
    let mut config = match tokio::fs::read_to_string(path).await {
        Ok(raw) => serde_yaml::from_str::<Config>(&raw).unwrap_or_default(),
        Err(_) => Config::default(),
    };
    config.tailscale = snapshot.tailscale.clone();
    config.services = snapshot.services.clone();

    let content = serde_yaml::to_string(&config)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let tmp = path.with_extension("yaml.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(x) => x,
        Err(e) => e.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use warptail_core::config::{Machine, RouteConfig, RouteType, ServiceConfig};
    use warptail_core::tailnet::{TailnetNode, TailscaleConfig};

    static FILE_SEQ: AtomicUsize = AtomicUsize::new(0);

    fn temp_path() -> PathBuf {
        let seq = FILE_SEQ.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("warptail-ctrl-{}-{}.yaml", std::process::id(), seq))
    }

    fn tcp_service(name: &str, port: u16) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            enabled: false,
            routes: vec![RouteConfig {
                kind: RouteType::Tcp,
                private: false,
                bot_protect: false,
                domain: String::new(),
                port,
                machine: Machine {
                    node_name: String::new(),
                    address: "db.local".to_string(),
                    port: 5432,
                },
                proxy_settings: None,
            }],
        }
    }

    fn test_router() -> Arc<Router> {
        Arc::new(Router::new(Arc::new(TailnetNode::new(
            "/nonexistent/warptail-test.sock",
        ))))
    }

    #[tokio::test]
    async fn write_snapshot_round_trips_through_the_loader() {
        let path = temp_path();
        std::fs::write(&path, "application:\n  port: 9090\n").unwrap();

        let snapshot = RouterSnapshot {
            tailscale: TailscaleConfig {
                auth_key: "tskey-abc".to_string(),
                hostname: "gateway".to_string(),
            },
            services: vec![tcp_service("db", 15432)],
        };
        write_snapshot(&path, &snapshot).await.unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.tailscale.hostname, "gateway");
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].name, "db");
        // Sections owned by collaborators survive the rewrite.
        assert_eq!(config.application.port, 9090);
    }

    #[tokio::test]
    async fn external_change_reloads_the_router() {
        let path = temp_path();
        std::fs::write(&path, "services: []\n").unwrap();
        let last_hash = Arc::new(Mutex::new(config_hash(&path).ok()));
        let router = test_router();

        let document = Config {
            services: vec![tcp_service("db", 15432)],
            ..Config::default()
        };
        std::fs::write(&path, serde_yaml::to_string(&document).unwrap()).unwrap();
        handle_change(&path, &last_hash, &router).await;

        let statuses = router.statuses(false).await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].id, "db");
    }

    #[tokio::test]
    async fn unchanged_content_does_not_reload() {
        let path = temp_path();
        std::fs::write(&path, "services: []\n").unwrap();
        let hash = config_hash(&path).unwrap();
        let last_hash = Arc::new(Mutex::new(Some(hash)));
        let router = test_router();

        // Same bytes: the change handler must not touch the router (a reload
        // with an empty tailscale config would log noisy bring-up failures).
        handle_change(&path, &last_hash, &router).await;
        assert_eq!(*lock(&last_hash), Some(hash));
        assert!(router.statuses(false).await.is_empty());
    }

    #[tokio::test]
    async fn persist_updates_the_stored_hash() {
        let path = temp_path();
        std::fs::write(&path, "services: []\n").unwrap();
        let controller = FileController::new(&path);
        let before = *lock(&controller.last_hash);

        let snapshot = RouterSnapshot {
            tailscale: TailscaleConfig::default(),
            services: vec![tcp_service("db", 15432)],
        };
        controller.persist(&snapshot);

        // persist hands the write to its own task.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if *lock(&controller.last_hash) != before {
                break;
            }
        }
        assert_ne!(*lock(&controller.last_hash), before);

        let config = load_config(&path).unwrap();
        assert_eq!(config.services[0].name, "db");
    }
}
