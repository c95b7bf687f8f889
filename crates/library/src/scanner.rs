use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{
    album_id, artist_id, artist_key, created_secs, file_name_string, folder_id, mtime_secs,
    now_secs, path_to_string, track_id, Album, Artist, Folder, Track,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::catalog::{Catalog, CatalogError, CatalogTxn};
use crate::tags::TagReader;

pub const DEFAULT_FILETYPES: &str = "mp3,flac,ogg,m4a,opus,wav";

const UNKNOWN_ARTIST: &str = "Unknown Artist";

/// Which files the walk hands to `scan_file`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanOptions {
    /// `filetypes`: comma separated extensions eligible for scanning.
    pub filetypes: Vec<String>,
    /// `scanner_extensions`: optional extra allow-list, empty means no restriction.
    pub extensions: Vec<String>,
}

impl ScanOptions {
    pub fn new(filetypes: &str, scanner_extensions: &str) -> Self {
        let filetypes = filetypes
            .split(',')
            .map(normalize_extension)
            .filter(|ext| !ext.is_empty())
            .collect();
        let extensions = scanner_extensions
            .split_whitespace()
            .map(normalize_extension)
            .filter(|ext| !ext.is_empty())
            .collect();
        Self {
            filetypes,
            extensions,
        }
    }

    pub fn accepts(&self, path: &Path) -> bool {
        let ext = match path.extension() {
            Some(ext) => ext.to_string_lossy().to_lowercase(),
            None => return false,
        };
        if !self.filetypes.iter().any(|allowed| allowed == &ext) {
            return false;
        }
        self.extensions.is_empty() || self.extensions.iter().any(|allowed| allowed == &ext)
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self::new(DEFAULT_FILETYPES, "")
    }
}

fn normalize_extension(value: &str) -> String {
    value.trim().trim_start_matches('.').to_lowercase()
}

/// Added and deleted entity counts of one scan/prune run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    pub added_artists: usize,
    pub added_albums: usize,
    pub added_tracks: usize,
    pub deleted_artists: usize,
    pub deleted_albums: usize,
    pub deleted_tracks: usize,
    pub deleted_folders: usize,
}

impl ScanStats {
    pub fn merge(&mut self, other: &ScanStats) {
        self.added_artists += other.added_artists;
        self.added_albums += other.added_albums;
        self.added_tracks += other.added_tracks;
        self.deleted_artists += other.deleted_artists;
        self.deleted_albums += other.deleted_albums;
        self.deleted_tracks += other.deleted_tracks;
        self.deleted_folders += other.deleted_folders;
    }

    pub fn is_empty(&self) -> bool {
        *self == ScanStats::default()
    }
}

/// What `scan_file` did with one path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileOutcome {
    /// Known track whose mtime has not advanced; tags were not read.
    Unchanged(Track),
    Updated(Track),
    Added(Track),
    /// Tags could not be read. A known track is left as it was.
    Unreadable,
}

#[derive(Debug)]
pub enum ScanError {
    RootUnreadable {
        path: String,
        source: std::io::Error,
    },
    Catalog(CatalogError),
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::RootUnreadable { path, source } => {
                write!(f, "cannot read root folder {}: {}", path, source)
            }
            ScanError::Catalog(err) => write!(f, "catalog error: {}", err),
        }
    }
}

impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScanError::RootUnreadable { source, .. } => Some(source),
            ScanError::Catalog(err) => Some(err),
        }
    }
}

impl From<CatalogError> for ScanError {
    fn from(err: CatalogError) -> Self {
        ScanError::Catalog(err)
    }
}

/// Reconciles folder trees into the catalog. Construction preloads the
/// track path, artist and folder lookups so the walk does not hit the store
/// for every existence check.
pub struct Scanner {
    catalog: Catalog,
    reader: Arc<dyn TagReader>,
    options: ScanOptions,
    tracks: HashMap<String, String>,
    artists: HashMap<String, Artist>,
    folders: HashMap<String, Folder>,
    // artist id -> album name -> album, filled on first use per artist
    albums: HashMap<String, HashMap<String, Album>>,
}

impl Scanner {
    pub fn new(
        catalog: Catalog,
        reader: Arc<dyn TagReader>,
        options: ScanOptions,
    ) -> Result<Self, ScanError> {
        debug!("Loading tracks");
        let tracks = catalog.track_paths()?;
        debug!("Loading artists");
        let artists = catalog
            .list_artists()?
            .into_iter()
            .map(|artist| (artist_key(&artist.name), artist))
            .collect();
        debug!("Loading folders");
        let folders = catalog
            .list_folders()?
            .into_iter()
            .map(|folder| (folder.path.clone(), folder))
            .collect();

        Ok(Self {
            catalog,
            reader,
            options,
            tracks,
            artists,
            folders,
            albums: HashMap::new(),
        })
    }

    /// Walks `root` children-first and writes every change as a single batch.
    pub fn scan(&mut self, root: &Folder) -> Result<ScanStats, ScanError> {
        let root_path = PathBuf::from(&root.path);
        if let Err(source) = fs::read_dir(&root_path) {
            return Err(ScanError::RootUnreadable {
                path: root.path.clone(),
                source,
            });
        }
        info!("Scanning {}", root.path);

        let catalog = self.catalog.clone();
        let txn = catalog.begin()?;
        let mut stats = ScanStats::default();

        let walker = WalkDir::new(&root_path)
            .follow_links(false)
            .contents_first(true)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
            .into_iter();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("Skipping unreadable directory entry: {}", err);
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            self.scan_directory(&txn, entry.path(), root, &mut stats)?;
        }

        let mut root_record = self
            .folders
            .get(&root.path)
            .cloned()
            .unwrap_or_else(|| root.clone());
        root_record.last_scan = now_secs();
        txn.put_folder(&root_record)?;
        self.folders.insert(root_record.path.clone(), root_record);

        txn.commit()?;
        info!(
            "Scan of {} done: +{} artists, +{} albums, +{} tracks",
            root.path, stats.added_artists, stats.added_albums, stats.added_tracks
        );
        Ok(stats)
    }

    fn scan_directory(
        &mut self,
        txn: &CatalogTxn<'_>,
        dir: &Path,
        root: &Folder,
        stats: &mut ScanStats,
    ) -> Result<(), ScanError> {
        let dir_str = path_to_string(dir);
        let meta = match fs::metadata(dir) {
            Ok(meta) => meta,
            Err(err) => {
                warn!("Cannot stat {}: {}", dir_str, err);
                return Ok(());
            }
        };

        let mut folder = match self.folders.get(&dir_str) {
            Some(folder) => {
                let modified = mtime_secs(&meta);
                if modified < folder.last_scan {
                    debug!("Folder {} not modified, skipping files", dir_str);
                    return Ok(());
                }
                folder.clone()
            }
            None => {
                debug!("Adding folder {}", dir_str);
                let is_root = dir_str == root.path;
                let parent_id = if is_root {
                    None
                } else {
                    dir.parent().map(|parent| folder_id(&path_to_string(parent)))
                };
                Folder {
                    id: folder_id(&dir_str),
                    path: dir_str.clone(),
                    name: file_name_string(dir),
                    parent_id,
                    root: is_root,
                    created: created_secs(&meta),
                    last_scan: 0,
                }
            }
        };

        let files = match audio_files_in_dir(dir, &self.options) {
            Ok(files) => files,
            Err(err) => {
                warn!("Cannot list {}: {}", dir_str, err);
                return Ok(());
            }
        };

        for file in files {
            match self.scan_file(txn, &file, &folder, stats)? {
                FileOutcome::Added(track) => debug!("Added {}", track.path),
                FileOutcome::Updated(track) => debug!("Updated {}", track.path),
                FileOutcome::Unchanged(_) | FileOutcome::Unreadable => {}
            }
        }

        folder.last_scan = now_secs();
        txn.put_folder(&folder)?;
        self.folders.insert(dir_str, folder);
        Ok(())
    }

    /// Brings one file's track record up to date. Tags are only read when
    /// the file is new or its mtime moved past the stored one.
    pub fn scan_file(
        &mut self,
        txn: &CatalogTxn<'_>,
        path: &Path,
        folder: &Folder,
        stats: &mut ScanStats,
    ) -> Result<FileOutcome, ScanError> {
        let path_str = path_to_string(path);
        let current_mtime = match fs::metadata(path) {
            Ok(meta) => mtime_secs(&meta),
            Err(err) => {
                warn!("Cannot stat {}: {}", path_str, err);
                return Ok(FileOutcome::Unreadable);
            }
        };

        let existing = match self.tracks.get(&path_str) {
            Some(id) => txn.get_track(id)?,
            None => None,
        };
        if let Some(track) = &existing {
            if track.last_modification >= current_mtime {
                debug!("File not modified: {}", path_str);
                return Ok(FileOutcome::Unchanged(track.clone()));
            }
        }

        let tags = match self.reader.read_tags(path) {
            Ok(tags) => tags,
            Err(err) => {
                warn!("Failed to read tags from {}: {}", path_str, err);
                return Ok(FileOutcome::Unreadable);
            }
        };

        let is_new = existing.is_none();
        let mut track = existing.unwrap_or_else(|| Track {
            id: track_id(&path_str),
            path: path_str.clone(),
            folder_id: folder.id.clone(),
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
            created: current_mtime,
            play_count: 0,
            last_play: None,
        });

        let album_artist = tags
            .album_artist
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| grandparent_name(path));
        let album_name = tags.album.clone().unwrap_or_else(|| folder.name.clone());

        track.folder_id = folder.id.clone();
        track.last_modification = current_mtime;
        track.disc = tags.disc;
        track.number = tags.track;
        track.title = tags.title.clone().unwrap_or_else(|| file_stem(path));
        track.year = tags.year;
        track.genre = tags.genre.clone();
        track.artist = tags.artist.clone().unwrap_or_else(|| album_artist.clone());
        track.bitrate = tags.bitrate / 1000;
        track.duration = tags.duration;

        let album = self.find_or_create_album(txn, &album_artist, &album_name, track.year, stats)?;
        track.album_id = album.id;

        txn.put_track(&track)?;
        self.tracks.insert(path_str, track.id.clone());

        if is_new {
            stats.added_tracks += 1;
            Ok(FileOutcome::Added(track))
        } else {
            Ok(FileOutcome::Updated(track))
        }
    }

    /// Resolves the album `album_name` of `artist_name`, creating either as
    /// needed. A new album takes the year of the track that created it.
    pub fn find_or_create_album(
        &mut self,
        txn: &CatalogTxn<'_>,
        artist_name: &str,
        album_name: &str,
        year: Option<i32>,
        stats: &mut ScanStats,
    ) -> Result<Album, ScanError> {
        let artist_name = artist_name.trim_end();
        let key = artist_key(artist_name);
        let artist = match self.artists.get(&key) {
            Some(artist) => artist.clone(),
            None => {
                let artist = Artist {
                    id: artist_id(artist_name),
                    name: artist_name.to_string(),
                };
                txn.put_artist(&artist)?;
                info!("New artist {}", artist.name);
                self.artists.insert(key, artist.clone());
                stats.added_artists += 1;
                artist
            }
        };

        let albums = match self.albums.entry(artist.id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let known = txn
                    .artist_albums(&artist.id)?
                    .into_iter()
                    .map(|album| (album.name.clone(), album))
                    .collect();
                entry.insert(known)
            }
        };
        if let Some(album) = albums.get(album_name) {
            return Ok(album.clone());
        }

        let album = Album {
            id: album_id(&artist.id, album_name),
            artist_id: artist.id.clone(),
            name: album_name.to_string(),
            year,
        };
        txn.put_album(&album)?;
        albums.insert(album.name.clone(), album.clone());
        stats.added_albums += 1;
        Ok(album)
    }

    /// Removes catalog entries under `root` that no longer exist on disk:
    /// tracks, then albums without tracks, then artists without albums, then
    /// vanished folders. Each class is committed on its own.
    pub fn prune(&mut self, root: &Folder) -> Result<ScanStats, ScanError> {
        let root_path = PathBuf::from(&root.path);
        let mut stats = ScanStats::default();

        let missing: Vec<(String, String)> = self
            .tracks
            .iter()
            .filter(|(path, _)| {
                let path = Path::new(path.as_str());
                path.starts_with(&root_path) && !path.is_file()
            })
            .map(|(path, id)| (path.clone(), id.clone()))
            .collect();
        let txn = self.catalog.begin()?;
        for (path, id) in &missing {
            if txn.delete_track(id)? {
                debug!("Removed track {}", path);
                stats.deleted_tracks += 1;
            }
        }
        txn.commit()?;
        for (path, _) in &missing {
            self.tracks.remove(path);
        }

        debug!("Checking for empty albums");
        let txn = self.catalog.begin()?;
        for album in txn.list_albums()? {
            if !txn.album_has_tracks(&album.id)? && txn.delete_album(&album.id)? {
                debug!("Removed album {}", album.name);
                stats.deleted_albums += 1;
            }
        }
        txn.commit()?;
        self.albums.clear();

        debug!("Checking for artists without albums");
        let txn = self.catalog.begin()?;
        let mut removed_artists = Vec::new();
        for artist in txn.list_artists()? {
            if !txn.artist_has_albums(&artist.id)? && txn.delete_artist(&artist.id)? {
                debug!("Removed artist {}", artist.name);
                stats.deleted_artists += 1;
                removed_artists.push(artist_key(&artist.name));
            }
        }
        txn.commit()?;
        for key in removed_artists {
            self.artists.remove(&key);
        }

        let txn = self.catalog.begin()?;
        let mut removed_folders = Vec::new();
        for folder in txn.list_folders()? {
            let path = Path::new(&folder.path);
            if folder.root || !path.starts_with(&root_path) || path.is_dir() {
                continue;
            }
            if !txn.folder_has_tracks(&folder.id)? && txn.delete_folder(&folder.id)? {
                debug!("Removed folder {}", folder.path);
                stats.deleted_folders += 1;
                removed_folders.push(folder.path);
            }
        }
        txn.commit()?;
        for path in removed_folders {
            self.folders.remove(&path);
        }

        info!(
            "Prune of {} done: -{} artists, -{} albums, -{} tracks, -{} folders",
            root.path,
            stats.deleted_artists,
            stats.deleted_albums,
            stats.deleted_tracks,
            stats.deleted_folders
        );
        Ok(stats)
    }
}

/// Scans then prunes every registered root folder.
pub fn scan_roots(
    catalog: &Catalog,
    reader: Arc<dyn TagReader>,
    options: ScanOptions,
) -> Result<ScanStats, ScanError> {
    let roots = catalog.root_folders()?;
    let mut scanner = Scanner::new(catalog.clone(), reader, options)?;
    let mut total = ScanStats::default();
    for root in &roots {
        let stats = scanner.scan(root)?;
        total.merge(&stats);
    }
    for root in &roots {
        let stats = scanner.prune(root)?;
        total.merge(&stats);
    }
    Ok(total)
}

fn audio_files_in_dir(dir: &Path, options: &ScanOptions) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && options.accepts(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Name of the directory two levels above the file, standing in for a
/// missing album artist in `artist/album/track` layouts.
fn grandparent_name(path: &Path) -> String {
    path.parent()
        .and_then(|parent| parent.parent())
        .and_then(|grandparent| grandparent.file_name())
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| UNKNOWN_ARTIST.to_string())
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Unknown Track".to_string())
}

#[cfg(test)]
mod tests {
    use super::{grandparent_name, ScanOptions, ScanStats};
    use std::path::Path;

    #[test]
    fn options_filter_on_both_lists() {
        let options = ScanOptions::new("mp3, FLAC,ogg", "");
        assert!(options.accepts(Path::new("/m/a.mp3")));
        assert!(options.accepts(Path::new("/m/a.Flac")));
        assert!(!options.accepts(Path::new("/m/a.wav")));
        assert!(!options.accepts(Path::new("/m/mp3")));

        let restricted = ScanOptions::new("mp3,flac,ogg", "flac .OGG");
        assert!(!restricted.accepts(Path::new("/m/a.mp3")));
        assert!(restricted.accepts(Path::new("/m/a.ogg")));
    }

    #[test]
    fn grandparent_stands_in_for_album_artist() {
        assert_eq!(
            grandparent_name(Path::new("/music/Various/Hits 1999/01.mp3")),
            "Various"
        );
        assert_eq!(grandparent_name(Path::new("01.mp3")), "Unknown Artist");
    }

    #[test]
    fn stats_merge_adds_counts() {
        let mut total = ScanStats {
            added_tracks: 2,
            ..ScanStats::default()
        };
        total.merge(&ScanStats {
            added_tracks: 1,
            deleted_albums: 3,
            ..ScanStats::default()
        });
        assert_eq!(total.added_tracks, 3);
        assert_eq!(total.deleted_albums, 3);
        assert!(!total.is_empty());
        assert!(ScanStats::default().is_empty());
    }
}
