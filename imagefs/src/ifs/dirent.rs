use std::io::{Read, Seek, SeekFrom};

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::endian::Endian;
use super::error::{Error, Result};

/// Size of the attribute block shared by every directory record
pub const ATTR_SIZE: usize = 24;

// Records are read into a buffer of this size; longer records are skipped past by their declared
// size
const MAX_RECORD: usize = 1024;
const MIN_DECODE: usize = 32;

pub const S_IFMT: u32 = 0o170000;

bitflags! {
    /// Flags carried in the top bits of an inode number.
    pub struct InodeFlags: u32 {
        const PROCESSED_ELF = 0x8000_0000;
        const RUNONCE_ELF = 0x4000_0000;
        const BOOTSTRAP_EXE = 0x2000_0000;
    }
}

impl InodeFlags {
    /// The file `flags=` value a build description uses for these bits.
    pub fn build_flags(&self) -> u32 {
        let mut v = 0;
        if self.contains(InodeFlags::BOOTSTRAP_EXE) {
            v |= 0x01;
        }
        if self.contains(InodeFlags::PROCESSED_ELF) {
            v |= 0x10;
        }
        if self.contains(InodeFlags::RUNONCE_ELF) {
            v |= 0x40;
        }
        v
    }

    /// One letter per flag, as used in listings.
    pub fn letters(&self) -> String {
        let mut s = String::new();
        if self.contains(InodeFlags::BOOTSTRAP_EXE) {
            s.push('B');
        }
        if self.contains(InodeFlags::RUNONCE_ELF) {
            s.push('O');
        }
        if self.contains(InodeFlags::PROCESSED_ELF) {
            s.push('E');
        }
        s
    }
}

#[derive(Debug, IntoPrimitive, TryFromPrimitive, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EntryKind {
    Fifo = 0o010000,
    CharDevice = 0o020000,
    Dir = 0o040000,
    NamedDevice = 0o050000,
    BlockDevice = 0o060000,
    File = 0o100000,
    Symlink = 0o120000,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub size: u16,
    pub extattr_offset: u16,
    pub ino: u32,
    pub mode: u32,
    pub gid: u32,
    pub uid: u32,
    pub mtime: u32,
}

impl Attr {
    fn from_record(rec: &[u8], e: Endian) -> Attr {
        Attr {
            size: e.u16_at(rec, 0),
            extattr_offset: e.u16_at(rec, 2),
            ino: e.u32_at(rec, 4),
            mode: e.u32_at(rec, 8),
            gid: e.u32_at(rec, 12),
            uid: e.u32_at(rec, 16),
            mtime: e.u32_at(rec, 20),
        }
    }

    pub fn inode_flags(&self) -> InodeFlags {
        InodeFlags::from_bits_truncate(self.ino)
    }

    /// Mode without the file type bits
    pub fn perms(&self) -> u32 {
        self.mode & !S_IFMT
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryData {
    File { offset: u32, size: u32 },
    Dir,
    Symlink { target: String },
    Device { dev: u32, rdev: u32 },
}

/// One decoded directory record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Absolute position of the record in the working stream
    pub record_pos: u64,
    pub attr: Attr,
    pub kind: EntryKind,
    pub path: String,
    pub data: EntryData,
}

impl DirEntry {
    pub fn is_root(&self) -> bool {
        self.kind == EntryKind::Dir && self.path.is_empty()
    }

    pub fn file_name(&self) -> &str {
        basename(&self.path)
    }

    /// Offset (relative to the image header) and size of a file's data.
    pub fn file_extent(&self) -> Option<(u32, u32)> {
        match self.data {
            EntryData::File { offset, size } => Some((offset, size)),
            _ => None,
        }
    }

    fn decode(record_pos: u64, rec: &[u8], e: Endian) -> Result<DirEntry> {
        let attr = Attr::from_record(rec, e);
        let kind = EntryKind::try_from(attr.mode & S_IFMT)
            .map_err(|_| Error::UnknownEntryKind { offset: record_pos, mode: attr.mode })?;
        let (path_at, data) = match kind {
            EntryKind::File => (32, EntryData::File { offset: e.u32_at(rec, 24), size: e.u32_at(rec, 28) }),
            EntryKind::Dir => (24, EntryData::Dir),
            EntryKind::Symlink => {
                let off = e.u16_at(rec, 24) as usize;
                let len = e.u16_at(rec, 26) as usize;
                let area = &rec[28..];
                let start = off.min(area.len());
                let end = (off + len).min(area.len());
                (28, EntryData::Symlink { target: cstr(&area[start..end]) })
            }
            EntryKind::CharDevice | EntryKind::BlockDevice | EntryKind::Fifo | EntryKind::NamedDevice => {
                (32, EntryData::Device { dev: e.u32_at(rec, 24), rdev: e.u32_at(rec, 28) })
            }
        };
        Ok(DirEntry { record_pos, attr, kind, path: cstr(&rec[path_at..]), data })
    }
}

pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn cstr(b: &[u8]) -> String {
    let end = b.iter().position(|c| *c == 0).unwrap_or(b.len());
    String::from_utf8_lossy(&b[..end]).into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkState {
    ReadHeader,
    Dispatch(EntryKind),
    Done,
    /// A fatal error was returned; the walker yields nothing further.
    Failed,
}

/// Forward-only cursor over the packed directory. The walker does not own the stream, so the
/// caller may read file data between records.
#[derive(Debug, Clone)]
pub struct DirWalker {
    pos: u64,
    endian: Endian,
    state: WalkState,
    pending: Option<DirEntry>,
}

impl DirWalker {
    pub fn new(dir_pos: u64, endian: Endian) -> Self {
        DirWalker { pos: dir_pos, endian, state: WalkState::ReadHeader, pending: None }
    }

    pub fn state(&self) -> WalkState {
        self.state
    }

    /// Position of the next record
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn next_entry<R>(&mut self, r: &mut R) -> Result<Option<DirEntry>>
    where R: Read + Seek
    {
        loop {
            match self.state {
                WalkState::Done | WalkState::Failed => return Ok(None),
                WalkState::Dispatch(_) => {
                    self.state = WalkState::ReadHeader;
                    return Ok(self.pending.take());
                }
                WalkState::ReadHeader => match self.read_record(r) {
                    Ok(None) => self.state = WalkState::Done,
                    Ok(Some(entry)) => {
                        self.state = WalkState::Dispatch(entry.kind);
                        self.pending = Some(entry);
                    }
                    Err(e) => {
                        self.state = WalkState::Failed;
                        return Err(e);
                    }
                },
            }
        }
    }

    fn read_record<R>(&mut self, r: &mut R) -> Result<Option<DirEntry>>
    where R: Read + Seek
    {
        let record_pos = self.pos;
        r.seek(SeekFrom::Start(record_pos))?;

        let mut rec = [0u8; MAX_RECORD];
        r.read_exact(&mut rec[..2]).map_err(Error::eof_as("directory"))?;
        let size = self.endian.u16_at(&rec, 0);
        if size == 0 {
            return Ok(None);
        }
        if (size as usize) < ATTR_SIZE {
            return Err(Error::CorruptDirectory { offset: record_pos, size });
        }

        let len = (size as usize).min(MAX_RECORD);
        r.read_exact(&mut rec[2..len]).map_err(Error::eof_as("directory"))?;
        // Short records decode their missing tail fields as zero
        let entry = DirEntry::decode(record_pos, &rec[..len.max(MIN_DECODE)], self.endian)?;
        self.pos += size as u64;
        Ok(Some(entry))
    }
}
