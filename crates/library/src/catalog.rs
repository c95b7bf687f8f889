use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::{
    created_secs, file_name_string, folder_id, path_to_string, Album, Artist,
    ClientPreference, Folder, Playlist, Track, User,
};
use redb::{
    CommitError, Database, DatabaseError, ReadableTable, StorageError, TableDefinition, TableError,
    TransactionError, WriteTransaction,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

const KEY_SEP: char = '\x1f';
const MARKER: &[u8] = &[];

const FOLDERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("folders");
const FOLDERS_BY_PATH_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("folders_by_path");
const FOLDER_CHILDREN_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("folder_children");
const FOLDER_TRACKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("folder_tracks");
const ARTISTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("artists");
const ALBUMS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("albums");
const ARTIST_ALBUMS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("artist_albums");
const TRACKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tracks");
const TRACKS_BY_PATH_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tracks_by_path");
const ALBUM_TRACKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("album_tracks");
const PLAYLISTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("playlists");
const USERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("users");
const USERS_BY_NAME_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("users_by_name");
const CLIENT_PREFS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("client_prefs");

const ALL_TABLES: [TableDefinition<&str, &[u8]>; 14] = [
    FOLDERS_TABLE,
    FOLDERS_BY_PATH_TABLE,
    FOLDER_CHILDREN_TABLE,
    FOLDER_TRACKS_TABLE,
    ARTISTS_TABLE,
    ALBUMS_TABLE,
    ARTIST_ALBUMS_TABLE,
    TRACKS_TABLE,
    TRACKS_BY_PATH_TABLE,
    ALBUM_TRACKS_TABLE,
    PLAYLISTS_TABLE,
    USERS_TABLE,
    USERS_BY_NAME_TABLE,
    CLIENT_PREFS_TABLE,
];

/// Persisted library state. Entities are bincode blobs keyed by id; owning
/// collections (artist -> albums, album -> tracks, folder -> tracks/children)
/// live in index tables keyed `owner \x1f member`.
#[derive(Clone)]
pub struct Catalog {
    db: Arc<Database>,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        let db = open_or_create_db(path)?;
        info!("Opened catalog at {:?}", path);
        Self::with_db(Arc::new(db))
    }

    pub fn with_db(db: Arc<Database>) -> Result<Self, CatalogError> {
        let write_txn = db.begin_write()?;
        for table in ALL_TABLES {
            write_txn.open_table(table)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Starts a write batch. Nothing is visible to readers until `commit`.
    pub fn begin(&self) -> Result<CatalogTxn<'_>, CatalogError> {
        Ok(CatalogTxn {
            txn: self.db.begin_write()?,
        })
    }

    /// Registers `path` as a root folder, promoting an existing sub-folder
    /// record if the directory was already known.
    pub fn add_root_folder(&self, path: &Path) -> Result<Folder, CatalogError> {
        let meta = fs::metadata(path)?;
        if !meta.is_dir() {
            return Err(CatalogError::NotADirectory(path_to_string(path)));
        }
        let path_str = path_to_string(path);
        let txn = self.begin()?;
        let folder = match txn.folder_by_path(&path_str)? {
            Some(mut existing) => {
                existing.root = true;
                existing.parent_id = None;
                existing
            }
            None => Folder {
                id: folder_id(&path_str),
                path: path_str.clone(),
                name: file_name_string(path),
                parent_id: None,
                root: true,
                created: created_secs(&meta),
                last_scan: 0,
            },
        };
        txn.put_folder(&folder)?;
        txn.commit()?;
        info!("Registered root folder {}", folder.path);
        Ok(folder)
    }

    pub fn get_folder(&self, folder_id: &str) -> Result<Option<Folder>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FOLDERS_TABLE)?;
        get_entity(&table, folder_id)
    }

    pub fn folder_by_path(&self, path: &str) -> Result<Option<Folder>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let by_path = read_txn.open_table(FOLDERS_BY_PATH_TABLE)?;
        let folders = read_txn.open_table(FOLDERS_TABLE)?;
        match lookup_id(&by_path, path)? {
            Some(id) => get_entity(&folders, &id),
            None => Ok(None),
        }
    }

    pub fn list_folders(&self) -> Result<Vec<Folder>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FOLDERS_TABLE)?;
        list_entities(&table)
    }

    pub fn root_folders(&self) -> Result<Vec<Folder>, CatalogError> {
        let mut roots: Vec<Folder> = self
            .list_folders()?
            .into_iter()
            .filter(|folder| folder.root)
            .collect();
        roots.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(roots)
    }

    pub fn folder_children(&self, folder_id: &str) -> Result<Vec<Folder>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(FOLDER_CHILDREN_TABLE)?;
        let folders = read_txn.open_table(FOLDERS_TABLE)?;
        let mut children: Vec<Folder> = members(&index, &folders, folder_id)?;
        children.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(children)
    }

    /// Tracks directly inside a folder, ordered by path.
    pub fn folder_tracks(&self, folder_id: &str) -> Result<Vec<Track>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(FOLDER_TRACKS_TABLE)?;
        let tracks = read_txn.open_table(TRACKS_TABLE)?;
        let mut items: Vec<Track> = members(&index, &tracks, folder_id)?;
        items.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(items)
    }

    pub fn get_track(&self, track_id: &str) -> Result<Option<Track>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRACKS_TABLE)?;
        get_entity(&table, track_id)
    }

    pub fn track_by_path(&self, path: &str) -> Result<Option<Track>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let by_path = read_txn.open_table(TRACKS_BY_PATH_TABLE)?;
        let tracks = read_txn.open_table(TRACKS_TABLE)?;
        match lookup_id(&by_path, path)? {
            Some(id) => get_entity(&tracks, &id),
            None => Ok(None),
        }
    }

    pub fn list_tracks(&self) -> Result<Vec<Track>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRACKS_TABLE)?;
        list_entities(&table)
    }

    /// Every indexed track path mapped to its track id.
    pub fn track_paths(&self) -> Result<HashMap<String, String>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRACKS_BY_PATH_TABLE)?;
        let mut paths = HashMap::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            paths.insert(
                key.value().to_string(),
                String::from_utf8_lossy(value.value()).to_string(),
            );
        }
        Ok(paths)
    }

    pub fn get_album(&self, album_id: &str) -> Result<Option<Album>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ALBUMS_TABLE)?;
        get_entity(&table, album_id)
    }

    pub fn list_albums(&self) -> Result<Vec<Album>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ALBUMS_TABLE)?;
        list_entities(&table)
    }

    /// Album tracks ordered by disc, track number, then path.
    pub fn album_tracks(&self, album_id: &str) -> Result<Vec<Track>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(ALBUM_TRACKS_TABLE)?;
        let tracks = read_txn.open_table(TRACKS_TABLE)?;
        let mut items: Vec<Track> = members(&index, &tracks, album_id)?;
        items.sort_by(|a, b| {
            (a.disc.unwrap_or(0), a.number.unwrap_or(0), &a.path).cmp(&(
                b.disc.unwrap_or(0),
                b.number.unwrap_or(0),
                &b.path,
            ))
        });
        Ok(items)
    }

    pub fn get_artist(&self, artist_id: &str) -> Result<Option<Artist>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ARTISTS_TABLE)?;
        get_entity(&table, artist_id)
    }

    pub fn list_artists(&self) -> Result<Vec<Artist>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ARTISTS_TABLE)?;
        list_entities(&table)
    }

    pub fn artist_albums(&self, artist_id: &str) -> Result<Vec<Album>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(ARTIST_ALBUMS_TABLE)?;
        let albums = read_txn.open_table(ALBUMS_TABLE)?;
        members(&index, &albums, artist_id)
    }

    pub fn get_playlist(&self, playlist_id: &str) -> Result<Option<Playlist>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PLAYLISTS_TABLE)?;
        get_entity(&table, playlist_id)
    }

    pub fn create_playlist(
        &self,
        user_id: &str,
        name: &str,
        track_ids: Vec<String>,
    ) -> Result<Playlist, CatalogError> {
        let playlist = Playlist {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            track_ids,
        };
        let txn = self.begin()?;
        txn.put_playlist(&playlist)?;
        txn.commit()?;
        Ok(playlist)
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<User>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS_TABLE)?;
        get_entity(&table, user_id)
    }

    /// User names are matched case-insensitively.
    pub fn user_by_name(&self, name: &str) -> Result<Option<User>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let by_name = read_txn.open_table(USERS_BY_NAME_TABLE)?;
        let users = read_txn.open_table(USERS_TABLE)?;
        match lookup_id(&by_name, &name.to_lowercase())? {
            Some(id) => get_entity(&users, &id),
            None => Ok(None),
        }
    }

    pub fn create_user(
        &self,
        name: &str,
        password_hash: &str,
        admin: bool,
    ) -> Result<User, CatalogError> {
        if self.user_by_name(name)?.is_some() {
            return Err(CatalogError::UserExists(name.to_string()));
        }
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            password_hash: password_hash.to_string(),
            admin,
            last_play_id: None,
            last_play_date: None,
        };
        let txn = self.begin()?;
        txn.put_user(&user)?;
        txn.commit()?;
        info!("Created user {}", user.name);
        Ok(user)
    }

    pub fn client_preference(
        &self,
        user_id: &str,
        client_name: &str,
    ) -> Result<Option<ClientPreference>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CLIENT_PREFS_TABLE)?;
        get_entity(&table, &index_key(user_id, client_name))
    }

    /// Looks up the (user, client) preference row, creating an empty one the
    /// first time a client is seen. The flag is true when it was created.
    pub fn client_preference_or_create(
        &self,
        user_id: &str,
        client_name: &str,
    ) -> Result<(ClientPreference, bool), CatalogError> {
        if let Some(pref) = self.client_preference(user_id, client_name)? {
            return Ok((pref, false));
        }
        let txn = self.begin()?;
        let key = index_key(user_id, client_name);
        let existing: Option<ClientPreference> = {
            let table = txn.txn.open_table(CLIENT_PREFS_TABLE)?;
            get_entity(&table, &key)?
        };
        if let Some(pref) = existing {
            return Ok((pref, false));
        }
        let pref = ClientPreference::new(user_id, client_name);
        txn.put_client_preference(&pref)?;
        txn.commit()?;
        debug!("Created preferences for client {} of user {}", client_name, user_id);
        Ok((pref, true))
    }

    pub fn set_client_preference(&self, pref: &ClientPreference) -> Result<(), CatalogError> {
        let txn = self.begin()?;
        txn.put_client_preference(pref)?;
        txn.commit()
    }

    /// Bumps the play counter of a track and points the user's last play at
    /// it, in one transaction.
    pub fn record_play(&self, track_id: &str, user_id: &str, at: u64) -> Result<(), CatalogError> {
        let txn = self.begin()?;
        let mut track = txn
            .get_track(track_id)?
            .ok_or_else(|| CatalogError::NotFound(format!("track {}", track_id)))?;
        track.play_count += 1;
        track.last_play = Some(at);
        txn.put_track(&track)?;

        let user: Option<User> = {
            let table = txn.txn.open_table(USERS_TABLE)?;
            get_entity(&table, user_id)?
        };
        if let Some(mut user) = user {
            user.last_play_id = Some(track.id.clone());
            user.last_play_date = Some(at);
            txn.put_user(&user)?;
        }
        txn.commit()
    }
}

/// One write batch over the catalog. Dropping it without `commit` discards
/// every change made through it.
pub struct CatalogTxn<'db> {
    txn: WriteTransaction<'db>,
}

impl<'db> CatalogTxn<'db> {
    pub fn commit(self) -> Result<(), CatalogError> {
        self.txn.commit()?;
        Ok(())
    }

    pub fn get_folder(&self, folder_id: &str) -> Result<Option<Folder>, CatalogError> {
        let table = self.txn.open_table(FOLDERS_TABLE)?;
        get_entity(&table, folder_id)
    }

    pub fn folder_by_path(&self, path: &str) -> Result<Option<Folder>, CatalogError> {
        let id = {
            let by_path = self.txn.open_table(FOLDERS_BY_PATH_TABLE)?;
            lookup_id(&by_path, path)?
        };
        match id {
            Some(id) => self.get_folder(&id),
            None => Ok(None),
        }
    }

    pub fn list_folders(&self) -> Result<Vec<Folder>, CatalogError> {
        let table = self.txn.open_table(FOLDERS_TABLE)?;
        list_entities(&table)
    }

    pub fn get_track(&self, track_id: &str) -> Result<Option<Track>, CatalogError> {
        let table = self.txn.open_table(TRACKS_TABLE)?;
        get_entity(&table, track_id)
    }

    pub fn get_album(&self, album_id: &str) -> Result<Option<Album>, CatalogError> {
        let table = self.txn.open_table(ALBUMS_TABLE)?;
        get_entity(&table, album_id)
    }

    pub fn list_albums(&self) -> Result<Vec<Album>, CatalogError> {
        let table = self.txn.open_table(ALBUMS_TABLE)?;
        list_entities(&table)
    }

    pub fn list_artists(&self) -> Result<Vec<Artist>, CatalogError> {
        let table = self.txn.open_table(ARTISTS_TABLE)?;
        list_entities(&table)
    }

    pub fn artist_albums(&self, artist_id: &str) -> Result<Vec<Album>, CatalogError> {
        let index = self.txn.open_table(ARTIST_ALBUMS_TABLE)?;
        let albums = self.txn.open_table(ALBUMS_TABLE)?;
        members(&index, &albums, artist_id)
    }

    pub fn album_has_tracks(&self, album_id: &str) -> Result<bool, CatalogError> {
        let index = self.txn.open_table(ALBUM_TRACKS_TABLE)?;
        has_members(&index, album_id)
    }

    pub fn artist_has_albums(&self, artist_id: &str) -> Result<bool, CatalogError> {
        let index = self.txn.open_table(ARTIST_ALBUMS_TABLE)?;
        has_members(&index, artist_id)
    }

    pub fn folder_has_tracks(&self, folder_id: &str) -> Result<bool, CatalogError> {
        let index = self.txn.open_table(FOLDER_TRACKS_TABLE)?;
        has_members(&index, folder_id)
    }

    pub fn put_folder(&self, folder: &Folder) -> Result<(), CatalogError> {
        let previous = self.get_folder(&folder.id)?;
        let mut folders = self.txn.open_table(FOLDERS_TABLE)?;
        let mut by_path = self.txn.open_table(FOLDERS_BY_PATH_TABLE)?;
        let mut children = self.txn.open_table(FOLDER_CHILDREN_TABLE)?;

        if let Some(previous) = previous {
            if previous.path != folder.path {
                by_path.remove(previous.path.as_str())?;
            }
            if let Some(parent_id) = previous.parent_id.as_deref() {
                if folder.parent_id.as_deref() != Some(parent_id) {
                    children.remove(index_key(parent_id, &folder.id).as_str())?;
                }
            }
        }

        let encoded = encode_value(folder)?;
        folders.insert(folder.id.as_str(), encoded.as_slice())?;
        by_path.insert(folder.path.as_str(), folder.id.as_bytes())?;
        if let Some(parent_id) = folder.parent_id.as_deref() {
            children.insert(index_key(parent_id, &folder.id).as_str(), MARKER)?;
        }
        Ok(())
    }

    pub fn put_artist(&self, artist: &Artist) -> Result<(), CatalogError> {
        let mut artists = self.txn.open_table(ARTISTS_TABLE)?;
        let encoded = encode_value(artist)?;
        artists.insert(artist.id.as_str(), encoded.as_slice())?;
        Ok(())
    }

    pub fn put_album(&self, album: &Album) -> Result<(), CatalogError> {
        let previous = self.get_album(&album.id)?;
        let mut albums = self.txn.open_table(ALBUMS_TABLE)?;
        let mut artist_albums = self.txn.open_table(ARTIST_ALBUMS_TABLE)?;

        if let Some(previous) = previous {
            if previous.artist_id != album.artist_id {
                artist_albums.remove(index_key(&previous.artist_id, &album.id).as_str())?;
            }
        }

        let encoded = encode_value(album)?;
        albums.insert(album.id.as_str(), encoded.as_slice())?;
        artist_albums.insert(index_key(&album.artist_id, &album.id).as_str(), MARKER)?;
        Ok(())
    }

    /// Inserts or overwrites a track, moving its index entries when the
    /// owning album or folder changed.
    pub fn put_track(&self, track: &Track) -> Result<(), CatalogError> {
        let previous = self.get_track(&track.id)?;
        let mut tracks = self.txn.open_table(TRACKS_TABLE)?;
        let mut by_path = self.txn.open_table(TRACKS_BY_PATH_TABLE)?;
        let mut album_tracks = self.txn.open_table(ALBUM_TRACKS_TABLE)?;
        let mut folder_tracks = self.txn.open_table(FOLDER_TRACKS_TABLE)?;

        if let Some(previous) = previous {
            if previous.path != track.path {
                by_path.remove(previous.path.as_str())?;
            }
            if previous.album_id != track.album_id {
                album_tracks.remove(index_key(&previous.album_id, &track.id).as_str())?;
            }
            if previous.folder_id != track.folder_id {
                folder_tracks.remove(index_key(&previous.folder_id, &track.id).as_str())?;
            }
        }

        let encoded = encode_value(track)?;
        tracks.insert(track.id.as_str(), encoded.as_slice())?;
        by_path.insert(track.path.as_str(), track.id.as_bytes())?;
        album_tracks.insert(index_key(&track.album_id, &track.id).as_str(), MARKER)?;
        folder_tracks.insert(index_key(&track.folder_id, &track.id).as_str(), MARKER)?;
        Ok(())
    }

    pub fn put_playlist(&self, playlist: &Playlist) -> Result<(), CatalogError> {
        let mut playlists = self.txn.open_table(PLAYLISTS_TABLE)?;
        let encoded = encode_value(playlist)?;
        playlists.insert(playlist.id.as_str(), encoded.as_slice())?;
        Ok(())
    }

    pub fn put_user(&self, user: &User) -> Result<(), CatalogError> {
        let mut users = self.txn.open_table(USERS_TABLE)?;
        let mut by_name = self.txn.open_table(USERS_BY_NAME_TABLE)?;
        let encoded = encode_value(user)?;
        users.insert(user.id.as_str(), encoded.as_slice())?;
        by_name.insert(user.name.to_lowercase().as_str(), user.id.as_bytes())?;
        Ok(())
    }

    pub fn put_client_preference(&self, pref: &ClientPreference) -> Result<(), CatalogError> {
        let mut prefs = self.txn.open_table(CLIENT_PREFS_TABLE)?;
        let encoded = encode_value(pref)?;
        prefs.insert(
            index_key(&pref.user_id, &pref.client_name).as_str(),
            encoded.as_slice(),
        )?;
        Ok(())
    }

    /// Deletes a track after detaching it from its album, its folder and
    /// every playlist that references it.
    pub fn delete_track(&self, track_id: &str) -> Result<bool, CatalogError> {
        let track = match self.get_track(track_id)? {
            Some(track) => track,
            None => return Ok(false),
        };

        {
            let mut album_tracks = self.txn.open_table(ALBUM_TRACKS_TABLE)?;
            album_tracks.remove(index_key(&track.album_id, &track.id).as_str())?;
            let mut folder_tracks = self.txn.open_table(FOLDER_TRACKS_TABLE)?;
            folder_tracks.remove(index_key(&track.folder_id, &track.id).as_str())?;
        }

        let referencing: Vec<Playlist> = {
            let playlists = self.txn.open_table(PLAYLISTS_TABLE)?;
            list_entities::<Playlist, _>(&playlists)?
                .into_iter()
                .filter(|playlist| playlist.track_ids.iter().any(|id| id == &track.id))
                .collect()
        };
        for mut playlist in referencing {
            playlist.track_ids.retain(|id| id != &track.id);
            self.put_playlist(&playlist)?;
        }

        let mut by_path = self.txn.open_table(TRACKS_BY_PATH_TABLE)?;
        by_path.remove(track.path.as_str())?;
        let mut tracks = self.txn.open_table(TRACKS_TABLE)?;
        tracks.remove(track.id.as_str())?;
        Ok(true)
    }

    /// Deletes an album record and detaches it from its artist. Callers
    /// delete its tracks first.
    pub fn delete_album(&self, album_id: &str) -> Result<bool, CatalogError> {
        let album = match self.get_album(album_id)? {
            Some(album) => album,
            None => return Ok(false),
        };
        let mut artist_albums = self.txn.open_table(ARTIST_ALBUMS_TABLE)?;
        artist_albums.remove(index_key(&album.artist_id, &album.id).as_str())?;
        let mut albums = self.txn.open_table(ALBUMS_TABLE)?;
        albums.remove(album.id.as_str())?;
        Ok(true)
    }

    pub fn delete_artist(&self, artist_id: &str) -> Result<bool, CatalogError> {
        let mut artists = self.txn.open_table(ARTISTS_TABLE)?;
        let removed = artists.remove(artist_id)?.is_some();
        Ok(removed)
    }

    pub fn delete_folder(&self, folder_id: &str) -> Result<bool, CatalogError> {
        let folder = match self.get_folder(folder_id)? {
            Some(folder) => folder,
            None => return Ok(false),
        };
        let mut children = self.txn.open_table(FOLDER_CHILDREN_TABLE)?;
        if let Some(parent_id) = folder.parent_id.as_deref() {
            children.remove(index_key(parent_id, &folder.id).as_str())?;
        }
        let mut by_path = self.txn.open_table(FOLDERS_BY_PATH_TABLE)?;
        by_path.remove(folder.path.as_str())?;
        let mut folders = self.txn.open_table(FOLDERS_TABLE)?;
        folders.remove(folder.id.as_str())?;
        Ok(true)
    }
}

#[derive(Debug)]
pub enum CatalogError {
    Io(std::io::Error),
    Redb(redb::Error),
    Bincode(Box<bincode::ErrorKind>),
    KeyParse(String),
    NotFound(String),
    NotADirectory(String),
    UserExists(String),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Io(err) => write!(f, "io error: {}", err),
            CatalogError::Redb(err) => write!(f, "db error: {}", err),
            CatalogError::Bincode(err) => write!(f, "bincode error: {}", err),
            CatalogError::KeyParse(value) => write!(f, "key parse error: {}", value),
            CatalogError::NotFound(what) => write!(f, "{} not found", what),
            CatalogError::NotADirectory(path) => write!(f, "not a directory: {}", path),
            CatalogError::UserExists(name) => write!(f, "user already exists: {}", name),
        }
    }
}

impl std::error::Error for CatalogError {}

impl From<std::io::Error> for CatalogError {
    fn from(err: std::io::Error) -> Self {
        CatalogError::Io(err)
    }
}

impl From<redb::Error> for CatalogError {
    fn from(err: redb::Error) -> Self {
        CatalogError::Redb(err)
    }
}

impl From<DatabaseError> for CatalogError {
    fn from(err: DatabaseError) -> Self {
        CatalogError::Redb(err.into())
    }
}

impl From<TableError> for CatalogError {
    fn from(err: TableError) -> Self {
        CatalogError::Redb(err.into())
    }
}

impl From<TransactionError> for CatalogError {
    fn from(err: TransactionError) -> Self {
        CatalogError::Redb(err.into())
    }
}

impl From<StorageError> for CatalogError {
    fn from(err: StorageError) -> Self {
        CatalogError::Redb(err.into())
    }
}

impl From<CommitError> for CatalogError {
    fn from(err: CommitError) -> Self {
        CatalogError::Redb(err.into())
    }
}

impl From<Box<bincode::ErrorKind>> for CatalogError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        CatalogError::Bincode(err)
    }
}

fn open_or_create_db(path: &Path) -> Result<Database, CatalogError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        Ok(Database::open(path)?)
    } else {
        Ok(Database::create(path)?)
    }
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, CatalogError> {
    Ok(bincode::serialize(value)?)
}

fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CatalogError> {
    Ok(bincode::deserialize(bytes)?)
}

fn get_entity<T, R>(table: &R, key: &str) -> Result<Option<T>, CatalogError>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key)? {
        Some(value) => Ok(Some(decode_value(value.value())?)),
        None => Ok(None),
    }
}

fn list_entities<T, R>(table: &R) -> Result<Vec<T>, CatalogError>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut items = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        items.push(decode_value(value.value())?);
    }
    Ok(items)
}

/// Secondary-key tables store the target id as raw utf-8.
fn lookup_id<R>(table: &R, key: &str) -> Result<Option<String>, CatalogError>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    Ok(table
        .get(key)?
        .map(|value| String::from_utf8_lossy(value.value()).to_string()))
}

fn members<T, I, E>(index: &I, entities: &E, owner_id: &str) -> Result<Vec<T>, CatalogError>
where
    T: DeserializeOwned,
    I: ReadableTable<&'static str, &'static [u8]>,
    E: ReadableTable<&'static str, &'static [u8]>,
{
    let prefix = prefix_key(owner_id);
    let mut end = prefix.clone();
    end.push('\u{10ffff}');

    let mut items = Vec::new();
    for entry in index.range(prefix.as_str()..end.as_str())? {
        let (key, _) = entry?;
        let (_, member_id) = split_key_last(key.value())?;
        if let Some(item) = get_entity(entities, member_id)? {
            items.push(item);
        }
    }
    Ok(items)
}

fn has_members<I>(index: &I, owner_id: &str) -> Result<bool, CatalogError>
where
    I: ReadableTable<&'static str, &'static [u8]>,
{
    let prefix = prefix_key(owner_id);
    let mut end = prefix.clone();
    end.push('\u{10ffff}');
    let mut range = index.range(prefix.as_str()..end.as_str())?;
    match range.next() {
        Some(entry) => {
            entry?;
            Ok(true)
        }
        None => Ok(false),
    }
}

fn index_key(owner: &str, member: &str) -> String {
    let mut out = prefix_key(owner);
    out.push_str(member);
    out
}

fn prefix_key(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    out.push_str(prefix);
    out.push(KEY_SEP);
    out
}

fn split_key_last(value: &str) -> Result<(&str, &str), CatalogError> {
    let idx = value
        .rfind(KEY_SEP)
        .ok_or_else(|| CatalogError::KeyParse(value.to_string()))?;
    let next = idx + KEY_SEP.len_utf8();
    Ok((&value[..idx], &value[next..]))
}

#[cfg(test)]
mod tests {
    use super::{index_key, split_key_last, Catalog};
    use common::{album_id, artist_id, folder_id, track_id, Album, Artist, Folder, Track};

    fn temp_catalog() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = Catalog::open(&dir.path().join("catalog.redb")).expect("open");
        (dir, catalog)
    }

    fn track(path: &str, folder: &str, album: &str) -> Track {
        Track {
            id: track_id(path),
            path: path.to_string(),
            folder_id: folder.to_string(),
            album_id: album.to_string(),
            disc: None,
            number: None,
            title: "t".to_string(),
            year: None,
            genre: None,
            artist: "a".to_string(),
            bitrate: 128,
            duration: 10,
            last_modification: 1,
            created: 1,
            play_count: 0,
            last_play: None,
        }
    }

    #[test]
    fn index_keys_split_on_last_separator() {
        let key = index_key("owner", "member");
        assert_eq!(split_key_last(&key).unwrap(), ("owner", "member"));
        assert!(split_key_last("plain").is_err());
    }

    #[test]
    fn delete_track_detaches_from_album_folder_and_playlists() {
        let (_dir, catalog) = temp_catalog();
        let artist = Artist {
            id: artist_id("A"),
            name: "A".to_string(),
        };
        let album = Album {
            id: album_id(&artist.id, "X"),
            artist_id: artist.id.clone(),
            name: "X".to_string(),
            year: None,
        };
        let folder = Folder {
            id: folder_id("/m"),
            path: "/m".to_string(),
            name: "m".to_string(),
            parent_id: None,
            root: true,
            created: 0,
            last_scan: 0,
        };
        let first = track("/m/1.mp3", &folder.id, &album.id);
        let second = track("/m/2.mp3", &folder.id, &album.id);

        let txn = catalog.begin().unwrap();
        txn.put_folder(&folder).unwrap();
        txn.put_artist(&artist).unwrap();
        txn.put_album(&album).unwrap();
        txn.put_track(&first).unwrap();
        txn.put_track(&second).unwrap();
        txn.commit().unwrap();

        let playlist = catalog
            .create_playlist("u", "mix", vec![first.id.clone(), second.id.clone(), first.id.clone()])
            .unwrap();

        let txn = catalog.begin().unwrap();
        assert!(txn.delete_track(&first.id).unwrap());
        assert!(!txn.delete_track(&first.id).unwrap());
        txn.commit().unwrap();

        assert!(catalog.get_track(&first.id).unwrap().is_none());
        assert!(catalog.track_by_path("/m/1.mp3").unwrap().is_none());
        let remaining: Vec<String> = catalog
            .album_tracks(&album.id)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(remaining, vec![second.id.clone()]);
        assert_eq!(catalog.folder_tracks(&folder.id).unwrap().len(), 1);
        let playlist = catalog.get_playlist(&playlist.id).unwrap().unwrap();
        assert_eq!(playlist.track_ids, vec![second.id]);
    }

    #[test]
    fn uncommitted_batch_is_discarded() {
        let (_dir, catalog) = temp_catalog();
        let artist = Artist {
            id: artist_id("Gone"),
            name: "Gone".to_string(),
        };
        {
            let txn = catalog.begin().unwrap();
            txn.put_artist(&artist).unwrap();
        }
        assert!(catalog.get_artist(&artist.id).unwrap().is_none());
    }

    #[test]
    fn client_preference_is_created_once() {
        let (_dir, catalog) = temp_catalog();
        let (pref, created) = catalog.client_preference_or_create("u1", "DSub").unwrap();
        assert!(created);
        assert_eq!(pref.format, None);

        let mut updated = pref.clone();
        updated.format = Some("mp3".to_string());
        catalog.set_client_preference(&updated).unwrap();

        let (again, created) = catalog.client_preference_or_create("u1", "DSub").unwrap();
        assert!(!created);
        assert_eq!(again.format.as_deref(), Some("mp3"));
        assert!(catalog.client_preference("u2", "DSub").unwrap().is_none());
    }

    #[test]
    fn users_are_unique_by_name_ignoring_case() {
        let (_dir, catalog) = temp_catalog();
        let user = catalog.create_user("Alice", "hash", true).unwrap();
        assert_eq!(catalog.user_by_name("alice").unwrap().unwrap().id, user.id);
        assert!(catalog.create_user("ALICE", "other", false).is_err());
    }
}
