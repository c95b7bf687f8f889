use std::env;
use std::path::Path;
use std::sync::Arc;

use cadenza_server::auth::hash_password;
use cadenza_server::config::{config_path_from_env, load_or_create_config, resolve_path};
use library::{scan_roots, Catalog, LoftyTagReader};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: cadenza-admin <add-folder PATH | add-user NAME PASSWORD [--admin] | scan>";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let command = args.first().map(String::as_str).ok_or(USAGE)?;

    let config_path = config_path_from_env();
    let (config, _) = load_or_create_config(&config_path)?;
    let index_path = resolve_path(&config_path, &config.index_path);
    if let Some(parent) = index_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let catalog = Catalog::open(&index_path)?;

    match command {
        "add-folder" => {
            let path = args.get(1).ok_or(USAGE)?;
            let folder = catalog.add_root_folder(Path::new(path))?;
            println!("Added folder {} ({})", folder.path, folder.id);
        }
        "add-user" => {
            let name = args.get(1).ok_or(USAGE)?;
            let password = args.get(2).ok_or(USAGE)?;
            let admin = args.iter().skip(3).any(|arg| arg == "--admin");
            let hash = hash_password(password)?;
            let user = catalog.create_user(name, &hash, admin)?;
            println!(
                "Added {} {}",
                if user.admin { "admin" } else { "user" },
                user.name
            );
        }
        "scan" => {
            let stats = scan_roots(&catalog, Arc::new(LoftyTagReader), config.scan_options())?;
            println!(
                "Added: {} artists, {} albums, {} tracks",
                stats.added_artists, stats.added_albums, stats.added_tracks
            );
            println!(
                "Deleted: {} artists, {} albums, {} tracks, {} folders",
                stats.deleted_artists,
                stats.deleted_albums,
                stats.deleted_tracks,
                stats.deleted_folders
            );
        }
        _ => return Err(USAGE.into()),
    }

    Ok(())
}
