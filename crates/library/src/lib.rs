mod catalog;
mod lyrics;
mod scanner;
mod tags;

pub use catalog::{Catalog, CatalogError, CatalogTxn};
pub use lyrics::{find_lyrics, read_text_file, Lyrics, LyricsError};
pub use scanner::{
    scan_roots, FileOutcome, ScanError, ScanOptions, ScanStats, Scanner, DEFAULT_FILETYPES,
};
pub use tags::{LoftyTagReader, TagReader};
