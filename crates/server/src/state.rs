use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use library::Catalog;
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::{resolve_path, ServerConfig};
use crate::covers::CoverCache;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Catalog,
    pub config_path: PathBuf,
    pub config: Arc<RwLock<ServerConfig>>,
    scanning: Arc<AtomicBool>,
}

/// Held for the duration of a scan; dropping it lets the next scan start.
pub struct ScanGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl AppState {
    pub fn new(catalog: Catalog, config_path: PathBuf, config: ServerConfig) -> Self {
        Self {
            catalog,
            config_path,
            config: Arc::new(RwLock::new(config)),
            scanning: Arc::new(AtomicBool::new(false)),
        }
    }

    /// `None` when another scan is already running.
    pub fn try_begin_scan(&self) -> Option<ScanGuard> {
        self.scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ScanGuard {
                flag: Arc::clone(&self.scanning),
            })
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::Acquire)
    }

    pub fn cover_cache(&self) -> CoverCache {
        let dir = self.config.read().cache_dir.clone();
        CoverCache::new(resolve_path(&self.config_path, &dir))
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub scanning: bool,
}
