use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::catalog::{Catalog, CatalogError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Lyrics {
    pub artist: String,
    pub title: String,
    pub text: String,
}

#[derive(Debug)]
pub enum LyricsError {
    Io(std::io::Error),
    Catalog(CatalogError),
    Encoding(PathBuf),
}

impl std::fmt::Display for LyricsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LyricsError::Io(err) => write!(f, "io error: {}", err),
            LyricsError::Catalog(err) => write!(f, "catalog error: {}", err),
            LyricsError::Encoding(path) => write!(f, "unsupported encoding in {:?}", path),
        }
    }
}

impl std::error::Error for LyricsError {}

impl From<std::io::Error> for LyricsError {
    fn from(err: std::io::Error) -> Self {
        LyricsError::Io(err)
    }
}

impl From<CatalogError> for LyricsError {
    fn from(err: CatalogError) -> Self {
        LyricsError::Catalog(err)
    }
}

/// Looks for a `.txt` file next to any track matching `artist` and `title`
/// (case-insensitive). Candidates that cannot be decoded are skipped.
pub fn find_lyrics(
    catalog: &Catalog,
    artist: &str,
    title: &str,
) -> Result<Option<Lyrics>, LyricsError> {
    let artist = artist.trim().to_lowercase();
    let title = title.trim().to_lowercase();

    let mut candidates: Vec<_> = catalog
        .list_tracks()?
        .into_iter()
        .filter(|track| track.title.trim().to_lowercase() == title)
        .collect();
    candidates.sort_by(|a, b| a.path.cmp(&b.path));

    for track in candidates {
        let album_artist = catalog
            .get_album(&track.album_id)?
            .and_then(|album| catalog.get_artist(&album.artist_id).ok().flatten())
            .map(|artist| artist.name)
            .unwrap_or_default();
        let matches_artist = album_artist.trim().to_lowercase() == artist
            || track.artist.trim().to_lowercase() == artist;
        if !matches_artist {
            continue;
        }

        let sidecar = Path::new(&track.path).with_extension("txt");
        if !sidecar.is_file() {
            continue;
        }
        debug!("Found lyrics file {:?}", sidecar);

        let text = match read_text_file(&sidecar) {
            Ok(text) => text,
            Err(err) => {
                warn!("Skipping lyrics file {:?}: {}", sidecar, err);
                continue;
            }
        };
        return Ok(Some(Lyrics {
            artist: if album_artist.is_empty() {
                track.artist
            } else {
                album_artist
            },
            title: track.title,
            text,
        }));
    }

    Ok(None)
}

/// Reads a text file as UTF-8, falling back to Latin-1.
pub fn read_text_file(path: &Path) -> Result<String, LyricsError> {
    let bytes = fs::read(path)?;
    decode_text(&bytes).ok_or_else(|| LyricsError::Encoding(path.to_path_buf()))
}

fn decode_text(bytes: &[u8]) -> Option<String> {
    if bytes.contains(&0) {
        return None;
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => Some(text.trim_start_matches('\u{feff}').to_string()),
        Err(_) => Some(bytes.iter().map(|&b| char::from(b)).collect()),
    }
}
