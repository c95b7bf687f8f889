use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use common::Folder;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use library::{Catalog, CatalogError};
use tracing::{debug, info};

pub const DEFAULT_COVER_SIZE: u32 = 1000;
const JPEG_QUALITY: u8 = 90;

#[derive(Debug)]
pub enum CoverError {
    NotFound(String),
    Io(std::io::Error),
    Image(image::ImageError),
    Catalog(CatalogError),
}

impl std::fmt::Display for CoverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoverError::NotFound(what) => write!(f, "no cover art for {}", what),
            CoverError::Io(err) => write!(f, "io error: {}", err),
            CoverError::Image(err) => write!(f, "image error: {}", err),
            CoverError::Catalog(err) => write!(f, "catalog error: {}", err),
        }
    }
}

impl std::error::Error for CoverError {}

impl From<std::io::Error> for CoverError {
    fn from(err: std::io::Error) -> Self {
        CoverError::Io(err)
    }
}

impl From<image::ImageError> for CoverError {
    fn from(err: image::ImageError) -> Self {
        CoverError::Image(err)
    }
}

impl From<CatalogError> for CoverError {
    fn from(err: CatalogError) -> Self {
        CoverError::Catalog(err)
    }
}

#[derive(Debug, Clone)]
pub struct CoverOutcome {
    pub path: PathBuf,
    /// The file was already cached; nothing was read or written.
    pub cache_hit: bool,
    /// The source was larger than the requested size and got scaled down.
    pub resized: bool,
}

/// Resized folder artwork on disk, one file per (size, folder id).
///
/// Entries are never invalidated. The existence check and the write are not
/// atomic: two requests racing on the same key both write the same bytes.
#[derive(Debug, Clone)]
pub struct CoverCache {
    dir: PathBuf,
}

impl CoverCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn cached_path(&self, size: u32, folder_id: &str) -> PathBuf {
        self.dir.join(size.to_string()).join(folder_id)
    }

    pub fn cover(
        &self,
        catalog: &Catalog,
        folder: &Folder,
        size: u32,
    ) -> Result<CoverOutcome, CoverError> {
        let path = self.cached_path(size, &folder.id);
        if path.is_file() {
            debug!("Cover cache hit {:?}", path);
            return Ok(CoverOutcome {
                path,
                cache_hit: true,
                resized: false,
            });
        }

        let source = source_image(catalog, folder)?;
        let img = image::load_from_memory(&source)?;
        let resized = img.width() > size || img.height() > size;
        let bytes = if resized {
            encode_jpeg(&img.resize(size, size, FilterType::Lanczos3))?
        } else {
            source
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &bytes)?;
        info!(
            "Cached cover for folder {} at size {} (resized: {})",
            folder.id, size, resized
        );

        Ok(CoverOutcome {
            path,
            cache_hit: false,
            resized,
        })
    }
}

/// Image bytes for a folder: the first JPEG file by name, then the first
/// embedded picture among the folder's tracks.
fn source_image(catalog: &Catalog, folder: &Folder) -> Result<Vec<u8>, CoverError> {
    if let Some(file) = first_jpeg_in(Path::new(&folder.path))? {
        debug!("Using cover file {:?}", file);
        return Ok(fs::read(file)?);
    }

    for track in catalog.folder_tracks(&folder.id)? {
        match metadata::read_cover(Path::new(&track.path)) {
            Ok(Some(art)) => {
                debug!("Using embedded cover of {}", track.path);
                return Ok(art.data);
            }
            Ok(None) => {}
            Err(err) => debug!("No readable cover in {}: {}", track.path, err),
        }
    }

    Err(CoverError::NotFound(format!("folder {}", folder.id)))
}

fn first_jpeg_in(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let mut matches = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && is_jpeg_name(&entry.file_name().to_string_lossy()) {
            matches.push(path);
        }
    }
    matches.sort();
    Ok(matches.into_iter().next())
}

/// Matches `*.jp*g`, ignoring case.
fn is_jpeg_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    match lower.find(".jp") {
        Some(idx) => lower.len() > idx + 3 && lower.ends_with('g'),
        None => false,
    }
}

fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>, CoverError> {
    let mut buf = Cursor::new(Vec::new());
    let rgb = DynamicImage::from(img.to_rgb8());
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY))?;
    Ok(buf.into_inner())
}
