use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A directory known to the catalog. Root folders are the ones an operator
/// registered; every other folder hangs off a parent by id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub path: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub root: bool,
    pub created: u64,
    pub last_scan: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artist {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Album {
    pub id: String,
    pub artist_id: String,
    pub name: String,
    pub year: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub path: String,
    pub folder_id: String,
    pub album_id: String,
    pub disc: Option<u16>,
    pub number: Option<u16>,
    pub title: String,
    pub year: Option<i32>,
    pub genre: Option<String>,
    pub artist: String,
    /// kbps
    pub bitrate: u32,
    /// seconds
    pub duration: u32,
    /// File mtime in whole seconds at the time tags were last read.
    pub last_modification: u64,
    pub created: u64,
    pub play_count: u64,
    pub last_play: Option<u64>,
}

impl Track {
    /// Lowercased file extension, used as the source format.
    pub fn suffix(&self) -> String {
        Path::new(&self.path)
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub track_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub password_hash: String,
    pub admin: bool,
    pub last_play_id: Option<String>,
    pub last_play_date: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPreference {
    pub user_id: String,
    pub client_name: String,
    pub format: Option<String>,
    /// kbps
    pub bitrate: Option<u32>,
}

impl ClientPreference {
    pub fn new(user_id: &str, client_name: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            client_name: client_name.to_string(),
            format: None,
            bitrate: None,
        }
    }
}

pub fn stable_id(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

pub fn folder_id(path: &str) -> String {
    stable_id(path)
}

pub fn track_id(path: &str) -> String {
    stable_id(path)
}

/// Artists dedupe on the lowercased, right-trimmed name.
pub fn artist_id(name: &str) -> String {
    stable_id(&artist_key(name))
}

pub fn artist_key(name: &str) -> String {
    name.trim_end().to_lowercase()
}

/// Albums are unique per (artist, exact name).
pub fn album_id(artist_id: &str, name: &str) -> String {
    let mut key = String::with_capacity(artist_id.len() + name.len() + 1);
    key.push_str(artist_id);
    key.push('\x1f');
    key.push_str(name);
    stable_id(&key)
}

pub fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

pub fn file_name_string(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path_to_string(path))
}

pub fn now_secs() -> u64 {
    system_time_secs(SystemTime::now())
}

pub fn system_time_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

/// File modification time truncated to whole seconds.
pub fn mtime_secs(meta: &Metadata) -> u64 {
    meta.modified().map(system_time_secs).unwrap_or(0)
}

/// Creation time where the filesystem records one, modification time otherwise.
pub fn created_secs(meta: &Metadata) -> u64 {
    meta.created()
        .or_else(|_| meta.modified())
        .map(system_time_secs)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::{album_id, artist_id, stable_id, Track};

    #[test]
    fn stable_id_is_deterministic() {
        let first = stable_id("/music/Artist/Album/Track.mp3");
        let second = stable_id("/music/Artist/Album/Track.mp3");
        assert_eq!(first, second);
        assert_ne!(first, stable_id("/music/Artist/Album/Track2.mp3"));
    }

    #[test]
    fn artist_id_ignores_case_and_trailing_space() {
        assert_eq!(artist_id("Boards of Canada"), artist_id("boards of canada  "));
        assert_ne!(artist_id("Boards of Canada"), artist_id(" Boards of Canada"));
    }

    #[test]
    fn album_id_is_scoped_to_artist() {
        let a = artist_id("A");
        let b = artist_id("B");
        assert_ne!(album_id(&a, "Greatest Hits"), album_id(&b, "Greatest Hits"));
        assert_ne!(album_id(&a, "greatest hits"), album_id(&a, "Greatest Hits"));
    }

    #[test]
    fn suffix_is_lowercased_extension() {
        let track = Track {
            id: String::new(),
            path: "/music/a/B.FLAC".to_string(),
            folder_id: String::new(),
            album_id: String::new(),
            disc: None,
            number: None,
            title: String::new(),
            year: None,
            genre: None,
            artist: String::new(),
            bitrate: 0,
            duration: 0,
            last_modification: 0,
            created: 0,
            play_count: 0,
            last_play: None,
        };
        assert_eq!(track.suffix(), "flac");
    }
}
