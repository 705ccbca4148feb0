use std::cmp::min;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// The stream every decode stage reads from. It starts out as the caller's source; once a
/// compressed payload has been inflated, the source is dropped and all further reads address the
/// decompressed copy instead.
#[derive(Debug)]
pub enum WorkingStream<R> {
    Source(R),
    Decompressed(File),
}

impl<R> WorkingStream<R> {
    pub fn is_decompressed(&self) -> bool {
        matches!(self, WorkingStream::Decompressed(_))
    }
}

impl<R: Seek> WorkingStream<R> {
    /// Total length of the stream. The cursor is left where it was.
    pub fn stream_len(&mut self) -> io::Result<u64> {
        let pos = self.stream_position()?;
        let len = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(pos))?;
        Ok(len)
    }
}

impl<R: Read> Read for WorkingStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            WorkingStream::Source(r) => r.read(buf),
            WorkingStream::Decompressed(f) => f.read(buf),
        }
    }
}

impl<R: Seek> Seek for WorkingStream<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            WorkingStream::Source(r) => r.seek(pos),
            WorkingStream::Decompressed(f) => f.seek(pos),
        }
    }
}

/// Run a positioned operation and put the cursor back where it was afterwards, whether or not the
/// operation succeeded.
pub fn with_restored_position<S, T, E, F>(s: &mut S, f: F) -> Result<T, E>
where
    S: Seek,
    E: From<io::Error>,
    F: FnOnce(&mut S) -> Result<T, E>,
{
    let pos = s.stream_position()?;
    let out = f(s);
    let restored = s.seek(SeekFrom::Start(pos));
    let out = out?;
    restored?;
    Ok(out)
}

/// Which side of a copy gave up.
#[derive(Debug)]
pub enum CopyError {
    Source(io::Error),
    Destination(io::Error),
}

const COPY_BUF_SIZE: usize = 4096;

/// Copy exactly `len` bytes. A source that ends early is a `CopyError::Source` failure.
pub fn copy_exact<R, W>(src: &mut R, dst: &mut W, len: u64) -> Result<u64, CopyError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut left = len;
    while left > 0 {
        let n = min(buf.len() as u64, left) as usize;
        src.read_exact(&mut buf[..n]).map_err(CopyError::Source)?;
        dst.write_all(&buf[..n]).map_err(CopyError::Destination)?;
        left -= n as u64;
    }
    Ok(len)
}
