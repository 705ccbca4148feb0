use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt};
use thiserror::Error;
use tracing::debug;

#[cfg(feature = "zlib")]
use flate2::read::GzDecoder;

#[cfg(feature = "lzo")]
use rust_lzo::{LZOContext, LZOError};

use super::error::{Error, Result};
use super::header::Compression;

/// Chunks inflate into a scratch buffer of this size.
pub const CHUNK_SCRATCH_SIZE: usize = 0x10000;

#[derive(Error, Debug)]
#[error("{0}")]
pub struct ChunkError(pub String);

/// A codec that inflates one self-contained chunk at a time.
pub trait ChunkDecompressor {
    fn decompress_chunk(&mut self, input: &[u8], output: &mut [u8]) -> std::result::Result<usize, ChunkError>;
}

#[cfg(feature = "lzo")]
#[derive(Debug, Default)]
pub struct Lzo1x;

#[cfg(feature = "lzo")]
impl ChunkDecompressor for Lzo1x {
    fn decompress_chunk(&mut self, input: &[u8], output: &mut [u8]) -> std::result::Result<usize, ChunkError> {
        let (out, err) = LZOContext::decompress_to_slice(input, output);
        if !matches!(err, LZOError::OK) {
            return Err(ChunkError("lzo1x chunk failed to decompress".to_string()));
        }
        Ok(out.len())
    }
}

#[cfg(feature = "ucl")]
#[derive(Debug, Default)]
pub struct Nrv2b;

#[cfg(feature = "ucl")]
impl ChunkDecompressor for Nrv2b {
    fn decompress_chunk(&mut self, input: &[u8], output: &mut [u8]) -> std::result::Result<usize, ChunkError> {
        super::nrv2b::decompress(input, output).map_err(|e| ChunkError(format!("nrv2b chunk: {}", e)))
    }
}

/// Reader over a stream of chunks, each framed by a big-endian u16 length. A zero length ends the
/// stream.
pub struct ChunkedDecoder<R> {
    inner: R,
    codec: Box<dyn ChunkDecompressor>,
    input: Vec<u8>,
    scratch: Vec<u8>,
    pos: usize,
    len: usize,
    chunks: usize,
    done: bool,
}

impl<R: Read> ChunkedDecoder<R> {
    pub fn new(inner: R, codec: Box<dyn ChunkDecompressor>) -> Self {
        ChunkedDecoder {
            inner,
            codec,
            input: Vec::new(),
            scratch: vec![0; CHUNK_SCRATCH_SIZE],
            pos: 0,
            len: 0,
            chunks: 0,
            done: false,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    // Load the next chunk into the scratch buffer. Returns false at the terminator.
    fn next_chunk(&mut self) -> io::Result<bool> {
        let size = self.inner.read_u16::<BigEndian>()? as usize;
        if size == 0 {
            debug!(chunks = self.chunks, "end of chunked payload");
            return Ok(false);
        }
        self.input.resize(size, 0);
        self.inner.read_exact(&mut self.input)?;
        self.len = self
            .codec
            .decompress_chunk(&self.input, &mut self.scratch)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.pos = 0;
        self.chunks += 1;
        Ok(true)
    }
}

impl<R: Read> Read for ChunkedDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.len {
            if self.done || !self.next_chunk()? {
                self.done = true;
                return Ok(0);
            }
        }
        let n = buf.len().min(self.len - self.pos);
        buf[..n].copy_from_slice(&self.scratch[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// The payload following the startup region, seen through its codec.
pub enum PayloadDecoder<R>
where
    R: Read,
{
    Stored(R),
    #[cfg(feature = "zlib")]
    Zlib(GzDecoder<R>),
    Chunked(ChunkedDecoder<R>),
}

impl<R: Read> PayloadDecoder<R> {
    pub fn new(r: R, comp: Compression) -> Result<Self> {
        Ok(match comp {
            Compression::None => PayloadDecoder::Stored(r),
            #[cfg(feature = "zlib")]
            Compression::Zlib => PayloadDecoder::Zlib(GzDecoder::new(r)),
            #[cfg(feature = "lzo")]
            Compression::Lzo => PayloadDecoder::Chunked(ChunkedDecoder::new(r, Box::new(Lzo1x))),
            #[cfg(feature = "ucl")]
            Compression::Ucl => PayloadDecoder::Chunked(ChunkedDecoder::new(r, Box::new(Nrv2b))),
            #[allow(unreachable_patterns)]
            _ => return Err(Error::UnsupportedCompression(comp.into())),
        })
    }

    pub fn into_inner(self) -> R {
        match self {
            PayloadDecoder::Stored(r) => r,
            #[cfg(feature = "zlib")]
            PayloadDecoder::Zlib(r) => r.into_inner(),
            PayloadDecoder::Chunked(r) => r.into_inner(),
        }
    }
}

impl<R: Read> Read for PayloadDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            PayloadDecoder::Stored(r) => r.read(buf),
            #[cfg(feature = "zlib")]
            PayloadDecoder::Zlib(r) => r.read(buf),
            PayloadDecoder::Chunked(r) => r.read(buf),
        }
    }
}

/// Inflate everything from the source's current position into `sink`.
pub fn decompress<R, W>(comp: Compression, source: R, sink: &mut W) -> Result<u64>
where
    R: Read,
    W: Write + ?Sized,
{
    let mut dec = PayloadDecoder::new(source, comp)?;
    let n = io::copy(&mut dec, sink).map_err(codec_error)?;
    debug!(?comp, bytes = n, "payload decompressed");
    Ok(n)
}

fn codec_error(e: io::Error) -> Error {
    if e.get_ref().map_or(false, |inner| inner.is::<ChunkError>()) {
        return Error::Decompression(e.to_string());
    }
    match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::Truncated("compressed payload"),
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => Error::Decompression(e.to_string()),
        _ => Error::Io(e),
    }
}
