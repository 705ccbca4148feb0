mod checksum;
mod compressed;
mod endian;
mod error;
mod image;
#[cfg(feature = "ucl")]
mod nrv2b;
mod scan;
mod stream;

pub mod dirent;
pub mod extract;
pub mod header;
pub mod manifest;
pub mod script;

pub use checksum::{checksum, StoredChecksums};
pub use compressed::{ChunkDecompressor, ChunkError};
pub use dirent::{DirEntry, DirWalker, EntryData, EntryKind};
pub use endian::Endian;
pub use error::{EntryError, Error, Result, Severity};
pub use extract::{ExtractOptions, ExtractReport, Extractor, Selection};
pub use header::{BootstrapHeader, Compression, ImageHeader};
pub use image::{Entries, ImageFs, OpenOptions};
pub use stream::WorkingStream;
