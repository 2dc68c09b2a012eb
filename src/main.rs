mod api;
mod conf;
mod controller;
mod metrics;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Arg, Command};

use warptail_core::{Controller, Router, TailnetNode};

use api::AppState;
use conf::{load_config, setup_logging, Config, DEFAULT_CONFIG_PATH, ENV_CONFIG_PATH};
use controller::FileController;
use metrics::ServiceMetrics;

fn config_path(matches: &clap::ArgMatches) -> PathBuf {
    matches
        .get_one::<String>("config")
        .cloned()
        .or_else(|| std::env::var(ENV_CONFIG_PATH).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
        .into()
}

#[tokio::main]
async fn main() {
    let matches = Command::new("warptail")
        .about("Publish tailnet services to the public internet, or vice versa")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .help("Path to the configuration document"),
        )
        .get_matches();

    let path = config_path(&matches);
    let config = match load_config(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("unable to load {}: {}", path.display(), e);
            std::process::exit(1);
        }
    };
    if let Err(e) = setup_logging(&config.logging) {
        eprintln!("unable to set up logging: {}", e);
        std::process::exit(1);
    }

    let node = Arc::new(TailnetNode::from_env());
    let router = Arc::new(Router::new(node));
    if let Err(e) = router.init(&config.tailscale, config.services.clone()).await {
        log::error!("unable to start router: {}", e);
        std::process::exit(1);
    }
    router.start_all().await;

    let file_controller = Arc::new(FileController::new(path));
    router.add_controller(file_controller.clone());
    file_controller.start(router.clone());

    let service_metrics = match ServiceMetrics::new() {
        Ok(m) => Arc::new(m),
        Err(e) => {
            log::error!("unable to register metrics: {}", e);
            std::process::exit(1);
        }
    };
    service_metrics.spawn_sampler(router.clone());

    let state = AppState::new(router.clone(), service_metrics);
    let app = api::build_app(state);

    spawn_ssl_ingress(&config, app.clone()).await;

    let addr = format!("0.0.0.0:{}", config.application.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("unable to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    log::info!("serving on {}", addr);

    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = serve.await {
        log::error!("server error: {}", e);
    }

    router.stop_all().await;
    log::info!("shut down cleanly");
}

/// With the certificate manager enabled, the same app also listens on the ssl
/// port; the manager's front terminates tls before traffic reaches us.
async fn spawn_ssl_ingress(config: &Config, app: axum::Router) {
    let Some(manager) = &config.certificate_manager else {
        return;
    };
    if !manager.enabled {
        return;
    }
    let addr = format!("0.0.0.0:{}", manager.ssl_port);
    match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => {
            log::info!("serving https ingress on {}", addr);
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    log::error!("https ingress error: {}", e);
                }
            });
        }
        Err(e) => log::error!("unable to bind https ingress {}: {}", addr, e),
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    log::info!("shutdown requested");
}
