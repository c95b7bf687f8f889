use std::path::Path;

use metadata::{MetadataError, TagInfo};

/// Source of per-file tag data for the scanner.
pub trait TagReader: Send + Sync {
    fn read_tags(&self, path: &Path) -> Result<TagInfo, MetadataError>;
}

/// Reads tags straight from the file with lofty.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoftyTagReader;

impl TagReader for LoftyTagReader {
    fn read_tags(&self, path: &Path) -> Result<TagInfo, MetadataError> {
        metadata::read_tags(path)
    }
}
