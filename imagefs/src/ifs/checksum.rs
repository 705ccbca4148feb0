use std::io::{self, Read, Seek, SeekFrom, Write};

use tracing::debug;

use super::endian::Endian;
use super::error::{Error, Result};
use super::header::{BootstrapHeader, ImageHeader, StartupFlags1, TRAILER_SIZE};
use super::stream::with_restored_position;

/// Additive checksum: the negated wrapping sum of the 4-byte words in `len` bytes, with the words
/// taken in the image's byte order. A trailing partial word is ignored.
pub fn checksum<R>(r: &mut R, len: u64, endian: Endian) -> io::Result<u32>
where R: Read
{
    let mut sum: u32 = 0;
    let mut buf = [0u8; 4096];
    let mut left = len & !3;
    while left > 0 {
        let n = left.min(buf.len() as u64) as usize;
        r.read_exact(&mut buf[..n])?;
        for word in buf[..n].chunks_exact(4) {
            sum = sum.wrapping_add(endian.u32_at(word, 0));
        }
        left -= n as u64;
    }
    Ok(sum.wrapping_neg())
}

/// Checksum of the region `[offset, offset + len)`. The cursor is left where it was.
pub fn checksum_at<R>(r: &mut R, offset: u64, len: u64, endian: Endian) -> Result<u32>
where R: Read + Seek
{
    with_restored_position(r, |r| {
        r.seek(SeekFrom::Start(offset))?;
        checksum(r, len, endian).map_err(Error::eof_as("checksummed region"))
    })
}

fn read_trailer<R>(r: &mut R, offset: u64, endian: Endian, what: &'static str) -> Result<u32>
where R: Read + Seek
{
    with_restored_position(r, |r| {
        r.seek(SeekFrom::Start(offset))?;
        endian.read_u32(r).map_err(Error::eof_as(what))
    })
}

pub fn verify_startup<R>(r: &mut R, spos: u64, hdr: &BootstrapHeader) -> Result<()>
where R: Read + Seek
{
    let len = (hdr.startup_size - TRAILER_SIZE) as u64;
    let computed = checksum_at(r, spos, len, hdr.endian())?;
    let stored = read_trailer(r, hdr.trailer_offset(spos), hdr.endian(), "startup trailer")?;
    if computed != stored {
        return Err(Error::ChecksumMismatch { what: "startup", computed, stored });
    }
    debug!(spos, cksum = stored, "startup checksum verified");
    Ok(())
}

pub fn verify_image<R>(r: &mut R, ipos: u64, hdr: &ImageHeader) -> Result<()>
where R: Read + Seek
{
    let len = (hdr.image_size - TRAILER_SIZE) as u64;
    let computed = checksum_at(r, ipos, len, hdr.endian())?;
    let stored = read_trailer(r, hdr.trailer_offset(ipos), hdr.endian(), "image trailer")?;
    if computed != stored {
        return Err(Error::ChecksumMismatch { what: "image", computed, stored });
    }
    debug!(ipos, cksum = stored, "image checksum verified");
    Ok(())
}

/// Trailer values as stored in the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredChecksums {
    pub image: u32,
    pub startup: Option<u32>,
}

pub fn stored_checksums<R>(
    r: &mut R,
    startup: Option<(u64, &BootstrapHeader)>,
    ipos: u64,
    image: &ImageHeader,
) -> Result<StoredChecksums>
where R: Read + Seek
{
    let image_cksum = read_trailer(r, image.trailer_offset(ipos), image.endian(), "image trailer")?;
    let startup_cksum = match startup {
        Some((spos, hdr)) => Some(read_trailer(r, hdr.trailer_offset(spos), hdr.endian(), "startup trailer")?),
        None => None,
    };
    Ok(StoredChecksums { image: image_cksum, startup: startup_cksum })
}

/// Rewrite the header of a decompressed working copy so it describes an uncompressed image:
/// clear the compression selector, set `stored_size` to the data now following `spos`, then
/// recompute the trailer checksum.
pub fn fixup_startup<S>(s: &mut S, spos: u64, hdr: &mut BootstrapHeader) -> Result<()>
where S: Read + Write + Seek
{
    hdr.flags1 &= !StartupFlags1::COMPRESS_MASK.bits();
    let len = s.seek(SeekFrom::End(0))?;
    hdr.stored_size = (len - spos) as u32;

    s.seek(SeekFrom::Start(spos))?;
    hdr.write(s)?;

    let cksum = checksum_at(s, spos, (hdr.startup_size - TRAILER_SIZE) as u64, hdr.endian())?;
    s.seek(SeekFrom::Start(hdr.trailer_offset(spos)))?;
    hdr.endian().write_u32(s, cksum)?;
    s.flush()?;
    s.seek(SeekFrom::Start(0))?;
    debug!(spos, stored_size = hdr.stored_size, cksum, "startup header fixed up");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn with_trailer(mut region: Vec<u8>, endian: Endian) -> Vec<u8> {
        let sum = checksum(&mut &region[..], region.len() as u64, endian).unwrap();
        region.extend_from_slice(&endian.u32_bytes(sum));
        region
    }

    #[test]
    fn test_checksum_words() -> io::Result<()> {
        let data = [1u8, 0, 0, 0, 2, 0, 0, 0];
        assert_eq!(checksum(&mut &data[..], 8, Endian::Little)?, 3u32.wrapping_neg());
        assert_eq!(checksum(&mut &data[..], 8, Endian::Big)?, 0x0300_0000u32.wrapping_neg());
        // leftover bytes are not part of any word
        assert_eq!(checksum(&mut &data[..], 7, Endian::Little)?, 1u32.wrapping_neg());
        Ok(())
    }

    #[test]
    fn test_checksum_detects_mutation() -> Result<()> {
        let region: Vec<u8> = (0..64u32).map(|v| (v * 7) as u8).collect();
        let base = checksum(&mut &region[..], 64, Endian::Little)?;
        for i in 0..region.len() {
            let mut m = region.clone();
            m[i] ^= 0x10;
            assert_ne!(checksum(&mut &m[..], 64, Endian::Little)?, base, "byte {}", i);
        }
        Ok(())
    }

    #[test]
    fn test_whole_region_sums_to_zero() -> io::Result<()> {
        let data = with_trailer((0..40u8).collect(), Endian::Big);
        assert_eq!(checksum(&mut &data[..], data.len() as u64, Endian::Big)?, 0);
        Ok(())
    }

    #[test]
    fn test_checksum_at_truncated() {
        let mut c = Cursor::new(vec![0u8; 10]);
        assert!(matches!(checksum_at(&mut c, 4, 16, Endian::Little), Err(Error::Truncated(_))));
        assert_eq!(c.position(), 0);
    }
}
