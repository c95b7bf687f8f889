use std::sync::Arc;

use library::{scan_roots, LoftyTagReader};
use tracing::{error, info};

use crate::error::ApiError;
use crate::state::{AppState, ScanGuard};

/// Starts a scan and prune of every root folder in the background.
pub fn start_scan(state: &AppState) -> Result<(), ApiError> {
    let guard = state.try_begin_scan().ok_or(ApiError::ScanInProgress)?;
    let state = state.clone();
    tokio::spawn(async move {
        run_scan(state, guard).await;
    });
    Ok(())
}

async fn run_scan(state: AppState, guard: ScanGuard) {
    let catalog = state.catalog.clone();
    let options = state.config.read().scan_options();
    info!("Library scan started");

    let result = tokio::task::spawn_blocking(move || {
        let _guard = guard;
        scan_roots(&catalog, Arc::new(LoftyTagReader), options)
    })
    .await;

    match result {
        Ok(Ok(stats)) => {
            info!(
                "Library scan finished: +{} artists, +{} albums, +{} tracks, -{} artists, -{} albums, -{} tracks, -{} folders",
                stats.added_artists,
                stats.added_albums,
                stats.added_tracks,
                stats.deleted_artists,
                stats.deleted_albums,
                stats.deleted_tracks,
                stats.deleted_folders
            );
        }
        Ok(Err(err)) => error!("Library scan failed: {}", err),
        Err(err) => error!("Library scan task failed: {}", err),
    }
}
