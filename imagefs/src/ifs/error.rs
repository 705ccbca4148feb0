use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// How a problem affects the processing of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Processing of the whole image stops.
    Fatal,
    /// The problem is reported and processing continues with the next entry.
    Warning,
}

/// Structural failures. Every one of these stops processing of the image.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unable to find startup header")]
    StartupNotFound,

    #[error("unable to find image header")]
    ImageNotFound,

    #[error("early end reading {0}")]
    Truncated(&'static str),

    #[error("corrupt {0} header")]
    CorruptHeader(&'static str),

    #[error("{what} checksum mismatch (computed {computed:#x}, stored {stored:#x})")]
    ChecksumMismatch {
        what: &'static str,
        computed: u32,
        stored: u32,
    },

    #[error("unsupported compression type {0:#x}")]
    UnsupportedCompression(u8),

    #[error("decompression failure: {0}")]
    Decompression(String),

    #[error("invalid dir entry at {offset:#x} (size {size})")]
    CorruptDirectory { offset: u64, size: u16 },

    #[error("unknown dir entry type (mode {mode:#o}) at {offset:#x}")]
    UnknownEntryKind { offset: u64, mode: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn severity(&self) -> Severity {
        Severity::Fatal
    }

    /// Map an unexpected EOF onto `Truncated`, leave any other I/O error alone.
    pub(crate) fn eof_as(what: &'static str) -> impl Fn(io::Error) -> Error {
        move |e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::Truncated(what)
            } else {
                Error::Io(e)
            }
        }
    }
}

/// Per-entry problems met while reconstructing the tree. These never abort the walk.
#[derive(Error, Debug)]
pub enum EntryError {
    #[error("unable to create {path}: {source}")]
    Create { path: PathBuf, source: io::Error },

    #[error("unable to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("unable to restore {what} on {path}: {source}")]
    Restore {
        what: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    #[error("refusing to extract {0}: path leaves the destination")]
    UnsafePath(String),

    #[error("cannot create {path}: {reason}")]
    Unsupported { path: PathBuf, reason: &'static str },
}

impl EntryError {
    pub fn severity(&self) -> Severity {
        Severity::Warning
    }
}
