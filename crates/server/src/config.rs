use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use library::{ScanOptions, DEFAULT_FILETYPES};
use serde::{Deserialize, Serialize};

pub const CONFIG_ENV: &str = "CADENZA_CONFIG";
pub const DEFAULT_PORT: u16 = 4040;

pub const DEFAULT_DECODER: &str = "ffmpeg -v quiet -i %srcpath -f wav -";
pub const DEFAULT_ENCODER: &str = "ffmpeg -v quiet -f wav -i - -f %outfmt -b:a %outratek -";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub index_path: String,
    pub cache_dir: String,
    /// Directories registered as root folders at startup.
    pub music_folders: Vec<String>,
    /// Space separated; empty means no restriction beyond `filetypes`.
    pub scanner_extensions: String,
    /// Comma separated.
    pub filetypes: String,
    pub scan_on_start: bool,
    /// Command templates keyed `transcoder_<src>_<dst>`, `decoder_<src>`,
    /// `encoder_<dst>`, `decoder`, `encoder` or `transcoder`.
    pub transcoding: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mut transcoding = BTreeMap::new();
        transcoding.insert("decoder".to_string(), DEFAULT_DECODER.to_string());
        transcoding.insert("encoder".to_string(), DEFAULT_ENCODER.to_string());
        Self {
            port: DEFAULT_PORT,
            index_path: "cadenza.redb".to_string(),
            cache_dir: "cache".to_string(),
            music_folders: Vec::new(),
            scanner_extensions: String::new(),
            filetypes: DEFAULT_FILETYPES.to_string(),
            scan_on_start: false,
            transcoding,
        }
    }
}

impl ServerConfig {
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions::new(&self.filetypes, &self.scanner_extensions)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var(CONFIG_ENV) {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

/// Loads the config file, writing the defaults first if it does not exist.
/// The flag is true when the file was created.
pub fn load_or_create_config(path: &Path) -> Result<(ServerConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: ServerConfig = serde_yaml::from_str(&contents)?;
        if config.port == 0 {
            config.port = DEFAULT_PORT;
        }
        if config.index_path.trim().is_empty() {
            config.index_path = "cadenza.redb".to_string();
        }
        if config.cache_dir.trim().is_empty() {
            config.cache_dir = "cache".to_string();
        }
        if config.filetypes.trim().is_empty() {
            config.filetypes = DEFAULT_FILETYPES.to_string();
        }
        return Ok((config, false));
    }

    let config = ServerConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

/// Relative values resolve against the directory holding the config file.
pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value.trim());
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}
