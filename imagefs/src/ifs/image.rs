use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom, Take, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::checksum::{self, StoredChecksums};
use super::compressed;
use super::dirent::{DirEntry, DirWalker, EntryKind};
use super::endian::Endian;
use super::error::{Error, Result};
use super::header::{BootstrapHeader, Compression, ImageHeader, IMAGE_SIGNATURE};
use super::scan::{self, SearchLimit};
use super::script::{self, ScriptRecord};
use super::stream::{copy_exact, CopyError, WorkingStream};

/// Settings applied while an image is opened.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Skip startup signatures whose reserved words are not zero
    pub sentinel_check: bool,
    pub verify_checksums: bool,
    /// Rewrite the startup header of a decompressed image to describe it as uncompressed
    pub fixup_header: bool,
    /// Keep the decompressed image at this path instead of an anonymous temporary file
    pub uncompressed_copy: Option<PathBuf>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions { sentinel_check: true, verify_checksums: false, fixup_header: false, uncompressed_copy: None }
    }
}

/// The top-level interface to an image file system. Opening locates and decodes the headers,
/// inflating a compressed payload first if needed; the directory can then be walked and file
/// contents read.
#[derive(Debug)]
pub struct ImageFs<R> {
    stream: WorkingStream<R>,
    startup: Option<(u64, BootstrapHeader)>,
    compression: Compression,
    ipos: u64,
    image: ImageHeader,
}

impl ImageFs<BufReader<File>> {
    /// Open the contents of a filepath as an image file system, using a BufReader
    pub fn open<P>(path: P) -> Result<Self>
    where P: AsRef<Path>
    {
        Self::new(BufReader::new(File::open(path)?))
    }

    pub fn open_with<P>(path: P, opts: &OpenOptions) -> Result<Self>
    where P: AsRef<Path>
    {
        Self::with_options(BufReader::new(File::open(path)?), opts)
    }
}

impl<R: Read + Seek> ImageFs<R> {
    /// Create a new ImageFs from the provided Reader with default options
    pub fn new(r: R) -> Result<Self> {
        Self::with_options(r, &OpenOptions::default())
    }

    pub fn with_options(mut r: R, opts: &OpenOptions) -> Result<Self> {
        r.seek(SeekFrom::Start(0))?;

        let (mut stream, startup, compression) =
            if let Some(pos) = scan::find(&mut r, IMAGE_SIGNATURE, SearchLimit::Within(0))? {
                debug!(pos, "image without startup header");
                (WorkingStream::Source(r), None, Compression::None)
            } else {
                let (spos, hdr) = scan::locate_startup(&mut r, opts.sentinel_check)?;
                hdr.validate()?;
                if opts.verify_checksums {
                    checksum::verify_startup(&mut r, spos, &hdr)?;
                }
                let compression = hdr.compression()?;
                debug!(spos, ?compression, startup_size = hdr.startup_size, stored_size = hdr.stored_size, "startup header");

                let (mut stream, hdr) = match compression {
                    Compression::None => (WorkingStream::Source(r), hdr),
                    _ => {
                        let mut work = decompress_payload(r, spos, &hdr, compression, opts)?;
                        work.seek(SeekFrom::Start(spos))?;
                        let mut hdr = BootstrapHeader::read(&mut work).map_err(Error::eof_as("startup header"))?;
                        if opts.fixup_header {
                            checksum::fixup_startup(&mut work, spos, &mut hdr)?;
                        }
                        (WorkingStream::Decompressed(work), hdr)
                    }
                };

                stream.seek(SeekFrom::Start(hdr.payload_offset(spos)))?;
                (stream, Some((spos, hdr)), compression)
            };

        let ipos = match startup {
            None => 0,
            Some(_) => scan::find(&mut stream, IMAGE_SIGNATURE, SearchLimit::Unbounded)?.ok_or(Error::ImageNotFound)?,
        };
        stream.seek(SeekFrom::Start(ipos))?;
        let image = ImageHeader::read(&mut stream).map_err(Error::eof_as("image header"))?;
        image.validate()?;
        if opts.verify_checksums {
            checksum::verify_image(&mut stream, ipos, &image)?;
        }
        debug!(
            ipos,
            image_size = image.image_size,
            dir_offset = image.dir_offset,
            mountpoint = %image.mountpoint,
            "image header"
        );

        Ok(ImageFs { stream, startup, compression, ipos, image })
    }

    pub fn startup_header(&self) -> Option<&BootstrapHeader> {
        self.startup.as_ref().map(|(_, h)| h)
    }

    pub fn startup_pos(&self) -> Option<u64> {
        self.startup.as_ref().map(|(p, _)| *p)
    }

    pub fn image_header(&self) -> &ImageHeader {
        &self.image
    }

    pub fn image_pos(&self) -> u64 {
        self.ipos
    }

    /// Compression of the payload as found in the source, before any inflating
    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn endian(&self) -> Endian {
        self.image.endian()
    }

    pub fn is_decompressed(&self) -> bool {
        self.stream.is_decompressed()
    }

    pub fn dir_pos(&self) -> u64 {
        self.image.dir_pos(self.ipos)
    }

    /// A walker positioned at the first directory record
    pub fn walker(&self) -> DirWalker {
        DirWalker::new(self.dir_pos(), self.endian())
    }

    pub fn next_entry(&mut self, walker: &mut DirWalker) -> Result<Option<DirEntry>> {
        walker.next_entry(&mut self.stream)
    }

    /// Iterate over every directory record. The iterator stops after the first error.
    pub fn entries(&mut self) -> Entries<'_, R> {
        let walker = self.walker();
        Entries { ifs: self, walker }
    }

    /// Whether this entry holds the boot script
    pub fn is_script(&self, entry: &DirEntry) -> bool {
        entry.kind == EntryKind::File && entry.attr.ino == self.image.script_ino
    }

    /// Absolute position of a file's data in the working stream
    pub fn data_pos(&self, offset: u32) -> u64 {
        self.ipos + offset as u64
    }

    /// Copy all of a file's contents into `sink`. The image ending early is `Truncated`.
    pub fn copy_file<W>(&mut self, entry: &DirEntry, sink: &mut W) -> Result<u64>
    where W: Write + ?Sized
    {
        let (offset, size) = entry.file_extent().ok_or(Error::CorruptHeader("file entry"))?;
        self.stream.seek(SeekFrom::Start(self.data_pos(offset)))?;
        copy_exact(&mut self.stream, sink, size as u64).map_err(|e| match e {
            CopyError::Source(e) => Error::eof_as("file data")(e),
            CopyError::Destination(e) => Error::Io(e),
        })
    }

    /// Create a reader over the contents of a file entry
    pub fn file_reader(&mut self, entry: &DirEntry) -> Result<Take<&mut WorkingStream<R>>> {
        let (offset, size) = entry.file_extent().ok_or(Error::CorruptHeader("file entry"))?;
        self.stream.seek(SeekFrom::Start(self.data_pos(offset)))?;
        Ok((&mut self.stream).take(size as u64))
    }

    pub fn read_file(&mut self, entry: &DirEntry) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.copy_file(entry, &mut buf)?;
        Ok(buf)
    }

    /// Read and decode the script held by `entry`
    pub fn decode_script(&mut self, entry: &DirEntry) -> Result<Vec<ScriptRecord>> {
        let bytes = self.read_file(entry)?;
        Ok(script::decode(&bytes))
    }

    /// Copy `len` bytes starting at `offset` of the working stream into `sink`.
    pub fn copy_region<W>(&mut self, offset: u64, len: u64, sink: &mut W) -> Result<u64>
    where W: Write + ?Sized
    {
        self.stream.seek(SeekFrom::Start(offset))?;
        copy_exact(&mut self.stream, sink, len).map_err(|e| match e {
            CopyError::Source(e) => Error::eof_as("image region")(e),
            CopyError::Destination(e) => Error::Io(e),
        })
    }

    pub fn stored_checksums(&mut self) -> Result<StoredChecksums> {
        let startup = self.startup.as_ref().map(|(p, h)| (*p, h));
        checksum::stored_checksums(&mut self.stream, startup, self.ipos, &self.image)
    }

    pub fn into_inner(self) -> WorkingStream<R> {
        self.stream
    }
}

// Build the working copy of a compressed image: the bytes up to the end of the startup region
// verbatim, then the inflated payload. The source is consumed.
fn decompress_payload<R>(mut r: R, spos: u64, hdr: &BootstrapHeader, comp: Compression, opts: &OpenOptions) -> Result<File>
where R: Read + Seek
{
    let mut work = match &opts.uncompressed_copy {
        Some(path) => fs::OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?,
        None => tempfile::tempfile()?,
    };

    r.seek(SeekFrom::Start(0))?;
    let prefix = hdr.payload_offset(spos);
    copy_exact(&mut r, &mut work, prefix).map_err(|e| match e {
        CopyError::Source(e) => Error::eof_as("startup")(e),
        CopyError::Destination(e) => Error::Io(e),
    })?;

    let inflated = compressed::decompress(comp, &mut r, &mut work)?;
    work.flush()?;
    debug!(prefix, inflated, "working copy written");
    Ok(work)
}

/// Iterator over the records of an image's directory
pub struct Entries<'a, R> {
    ifs: &'a mut ImageFs<R>,
    walker: DirWalker,
}

impl<'a, R: Read + Seek> Iterator for Entries<'a, R> {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.ifs.next_entry(&mut self.walker).transpose()
    }
}
