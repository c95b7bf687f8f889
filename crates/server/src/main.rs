use std::path::Path;

use cadenza_server::config::{config_path_from_env, load_or_create_config, resolve_path};
use cadenza_server::scan::start_scan;
use cadenza_server::state::AppState;
use library::Catalog;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    } else {
        info!("Loaded config from {:?}", config_path);
    }

    let index_path = resolve_path(&config_path, &config.index_path);
    if let Some(parent) = index_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let catalog = Catalog::open(&index_path)?;
    info!("Opened catalog at {:?}", index_path);

    for folder in &config.music_folders {
        let path = resolve_path(&config_path, folder);
        match catalog.add_root_folder(Path::new(&path)) {
            Ok(folder) => info!("Music folder {}", folder.path),
            Err(err) => warn!("Skipping music folder {:?}: {}", path, err),
        }
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let scan_on_start = config.scan_on_start;
    let state = AppState::new(catalog, config_path, config);

    if scan_on_start {
        if let Err(err) = start_scan(&state) {
            warn!("Startup scan not started: {}", err);
        }
    }

    let app = cadenza_server::app(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to install terminate signal handler: {}", err);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", err);
        }
    }

    info!("Shutdown signal received.");
}
