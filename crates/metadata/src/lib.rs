use std::path::Path;

use lofty::error::LoftyError;
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};

/// The fixed set of fields the scanner consumes from a file's tags.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TagInfo {
    pub title: Option<String>,
    pub track: Option<u16>,
    pub disc: Option<u16>,
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub album: Option<String>,
    pub year: Option<i32>,
    pub genre: Option<String>,
    /// bits per second
    pub bitrate: u32,
    /// whole seconds
    pub duration: u32,
}

#[derive(Debug, Clone)]
pub struct CoverArt {
    pub data: Vec<u8>,
    pub mime: Option<String>,
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag error: {}", err),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

pub fn read_tags(path: &Path) -> Result<TagInfo, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;
    let properties = tagged_file.properties();

    let mut info = TagInfo::default();

    let duration = properties.duration().as_secs();
    info.duration = duration.min(u64::from(u32::MAX)) as u32;

    // lofty reports kbps
    let kbps = properties
        .audio_bitrate()
        .or(properties.overall_bitrate())
        .unwrap_or(0);
    info.bitrate = kbps.saturating_mul(1000);

    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        info.title = non_empty(tag.get_string(&ItemKey::TrackTitle));
        info.album = non_empty(tag.get_string(&ItemKey::AlbumTitle));
        info.artist = non_empty(tag.get_string(&ItemKey::TrackArtist));
        info.album_artist = non_empty(tag.get_string(&ItemKey::AlbumArtist));
        info.track = tag.get_string(&ItemKey::TrackNumber).and_then(parse_u16);
        info.disc = tag.get_string(&ItemKey::DiscNumber).and_then(parse_u16);
        info.year = tag
            .get_string(&ItemKey::Year)
            .or_else(|| tag.get_string(&ItemKey::RecordingDate))
            .and_then(parse_year);
        info.genre = non_empty(tag.get_string(&ItemKey::Genre));
    }

    Ok(info)
}

/// First embedded picture of the file, whatever its type.
pub fn read_cover(path: &Path) -> Result<Option<CoverArt>, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;
    for tag in tagged_file.tags() {
        if let Some(picture) = tag.pictures().first() {
            let data = picture.data().to_vec();
            let mime = guess_mime(&data);
            return Ok(Some(CoverArt { data, mime }));
        }
    }
    Ok(None)
}

/// Playback length in seconds as reported by the container.
pub fn probe_duration(path: &Path) -> Result<f64, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;
    Ok(tagged_file.properties().duration().as_secs_f64())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(|v| v.trim_matches('\0'))
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.to_string())
}

fn parse_u16(text: &str) -> Option<u16> {
    let head = text.split('/').next().unwrap_or(text).trim();
    head.parse().ok()
}

fn parse_year(text: &str) -> Option<i32> {
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            if digits.len() == 4 {
                break;
            }
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.len() != 4 {
        None
    } else {
        digits.parse().ok()
    }
}

pub fn guess_mime(bytes: &[u8]) -> Option<String> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg".to_string())
    } else if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        Some("image/png".to_string())
    } else if bytes.starts_with(b"GIF8") {
        Some("image/gif".to_string())
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp".to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{guess_mime, parse_u16, parse_year};

    #[test]
    fn parses_track_of_total() {
        assert_eq!(parse_u16("3/12"), Some(3));
        assert_eq!(parse_u16(" 7 "), Some(7));
        assert_eq!(parse_u16("A"), None);
    }

    #[test]
    fn parses_year_from_dates() {
        assert_eq!(parse_year("1997"), Some(1997));
        assert_eq!(parse_year("2004-05-17"), Some(2004));
        assert_eq!(parse_year("'97"), None);
    }

    #[test]
    fn sniffs_image_types() {
        assert_eq!(guess_mime(&[0xFF, 0xD8, 0xFF, 0xE0]).as_deref(), Some("image/jpeg"));
        assert_eq!(
            guess_mime(&[0x89, 0x50, 0x4E, 0x47, 0x0D]).as_deref(),
            Some("image/png")
        );
        assert_eq!(guess_mime(b"nope"), None);
    }
}
