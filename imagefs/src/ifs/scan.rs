use std::io::{self, Read, Seek, SeekFrom};

use tracing::{debug, warn};

use super::endian::Endian;
use super::error::{Error, Result};
use super::header::{BootstrapHeader, STARTUP_SIGNATURE};

const SCAN_BUF_SIZE: usize = 8192;

/// How far `find` may look before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchLimit {
    /// Search the whole rest of the stream.
    Unbounded,
    /// Give up at the first mismatch once this many bytes have been consumed. `Within(0)` tests
    /// whether the stream continues with the pattern at the current position.
    Within(u64),
}

/// Search forward from the current position for `pattern`.
///
/// On a mismatch the current byte is re-tested as a possible start of the pattern, nothing more.
/// A pattern that repeats its own prefix can therefore be missed where a full KMP search would
/// find it. On success the cursor sits just past the match and the offset of its first byte is
/// returned.
pub fn find<R>(r: &mut R, pattern: &[u8], limit: SearchLimit) -> io::Result<Option<u64>>
where R: Read + Seek
{
    let start = r.stream_position()?;
    if pattern.is_empty() {
        return Ok(Some(start));
    }

    let mut buf = [0u8; SCAN_BUF_SIZE];
    let mut consumed: u64 = 0;
    let mut i = 0;
    loop {
        let n = match r.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        for &c in &buf[..n] {
            consumed += 1;
            if c == pattern[i] {
                i += 1;
                if i == pattern.len() {
                    let end = r.seek(SeekFrom::Start(start + consumed))?;
                    return Ok(Some(end - pattern.len() as u64));
                }
            } else {
                if let SearchLimit::Within(max) = limit {
                    if consumed >= max {
                        r.seek(SeekFrom::Start(start + consumed))?;
                        return Ok(None);
                    }
                }
                i = if c == pattern[0] { 1 } else { 0 };
            }
        }
    }
}

/// Where the search for a plausible startup header stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Candidate {
    Scanning,
    Found(u64),
    /// The signature at this offset failed the sentinel check; scanning resumes after it.
    RejectedRescan(u64),
    /// The signature at this offset failed the sentinel check, which is disabled.
    RejectedAcceptWithWarning(u64),
}

impl Candidate {
    pub fn assess(pos: u64, sentinel_ok: bool, sentinel_check: bool) -> Candidate {
        match (sentinel_ok, sentinel_check) {
            (true, _) => Candidate::Found(pos),
            (false, true) => Candidate::RejectedRescan(pos),
            (false, false) => Candidate::RejectedAcceptWithWarning(pos),
        }
    }
}

/// Locate the startup header: scan the whole stream for the signature in little-endian byte
/// order, then once more with the bytes reversed.
pub fn locate_startup<R>(r: &mut R, sentinel_check: bool) -> Result<(u64, BootstrapHeader)>
where R: Read + Seek
{
    for order in [Endian::Little, Endian::Big] {
        let sig = order.u32_bytes(STARTUP_SIGNATURE);
        r.seek(SeekFrom::Start(0))?;

        let mut state = Candidate::Scanning;
        let mut hdr = None;
        loop {
            state = match state {
                Candidate::Scanning => match find(r, &sig, SearchLimit::Unbounded)? {
                    None => break,
                    Some(pos) => {
                        r.seek(SeekFrom::Start(pos))?;
                        let h = BootstrapHeader::read(r).map_err(Error::eof_as("startup header"))?;
                        let next = Candidate::assess(pos, h.sentinel_ok(), sentinel_check);
                        hdr = Some(h);
                        next
                    }
                },
                Candidate::RejectedRescan(pos) => {
                    debug!(pos, "startup signature with non-zero sentinel, rescanning");
                    r.seek(SeekFrom::Start(pos + sig.len() as u64))?;
                    Candidate::Scanning
                }
                Candidate::RejectedAcceptWithWarning(pos) => {
                    warn!(pos, "non-zero data in startup header zero fields ignored");
                    Candidate::Found(pos)
                }
                Candidate::Found(pos) => match hdr.take() {
                    Some(h) => {
                        debug!(pos, ?order, "found startup header");
                        return Ok((pos, h));
                    }
                    None => break,
                },
            };
        }
    }
    Err(Error::StartupNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_find() -> io::Result<()> {
        let mut c = Cursor::new(b"xxxximagefsyyy".to_vec());
        assert_eq!(find(&mut c, b"imagefs", SearchLimit::Unbounded)?, Some(4));
        assert_eq!(c.position(), 11);
        assert_eq!(find(&mut c, b"imagefs", SearchLimit::Unbounded)?, None);
        Ok(())
    }

    #[test]
    fn test_find_restart_rule() -> io::Result<()> {
        // The mismatching byte is re-tested as a pattern start
        let mut c = Cursor::new(b"iimagefs".to_vec());
        assert_eq!(find(&mut c, b"imagefs", SearchLimit::Unbounded)?, Some(1));

        // but a partial match is not backtracked into
        let mut c = Cursor::new(b"aaab".to_vec());
        assert_eq!(find(&mut c, b"aab", SearchLimit::Unbounded)?, None);
        Ok(())
    }

    #[test]
    fn test_find_within() -> io::Result<()> {
        let mut c = Cursor::new(b"imagefs".to_vec());
        assert_eq!(find(&mut c, b"imagefs", SearchLimit::Within(0))?, Some(0));

        let mut c = Cursor::new(b"ximagefs".to_vec());
        assert_eq!(find(&mut c, b"imagefs", SearchLimit::Within(0))?, None);

        let mut c = Cursor::new(b"xximagefs".to_vec());
        assert_eq!(find(&mut c, b"imagefs", SearchLimit::Within(4))?, Some(2));

        let mut c = Cursor::new(b"xxxxximagefs".to_vec());
        assert_eq!(find(&mut c, b"imagefs", SearchLimit::Within(4))?, None);
        Ok(())
    }

    #[test]
    fn test_find_across_buffer() -> io::Result<()> {
        let mut data = vec![0u8; SCAN_BUF_SIZE - 3];
        data.extend_from_slice(b"imagefs");
        let mut c = Cursor::new(data);
        assert_eq!(find(&mut c, b"imagefs", SearchLimit::Unbounded)?, Some(SCAN_BUF_SIZE as u64 - 3));
        Ok(())
    }

    #[test]
    fn test_assess() {
        assert_eq!(Candidate::assess(8, true, true), Candidate::Found(8));
        assert_eq!(Candidate::assess(8, false, true), Candidate::RejectedRescan(8));
        assert_eq!(Candidate::assess(8, false, false), Candidate::RejectedAcceptWithWarning(8));
    }

    fn header_bytes(big: bool, zero: u32) -> Vec<u8> {
        let e = Endian::from_big_flag(big);
        let mut b = vec![0u8; 256];
        b[..4].copy_from_slice(&e.u32_bytes(STARTUP_SIGNATURE));
        b[6] = if big { 0x02 } else { 0 };
        b[32..36].copy_from_slice(&e.u32_bytes(0x200));
        b[52..56].copy_from_slice(&e.u32_bytes(zero));
        b
    }

    #[test]
    fn test_locate_startup() -> Result<()> {
        let mut data = vec![0x55u8; 16];
        data.extend(header_bytes(false, 0));
        let (pos, hdr) = locate_startup(&mut Cursor::new(data), true)?;
        assert_eq!(pos, 16);
        assert_eq!(hdr.startup_size, 0x200);
        Ok(())
    }

    #[test]
    fn test_locate_startup_big_endian() -> Result<()> {
        let mut data = vec![0u8; 4];
        data.extend(header_bytes(true, 0));
        let (pos, hdr) = locate_startup(&mut Cursor::new(data), true)?;
        assert_eq!(pos, 4);
        assert_eq!(hdr.startup_size, 0x200);
        Ok(())
    }

    #[test]
    fn test_locate_startup_sentinel() -> Result<()> {
        let mut data = header_bytes(false, 0xdead);
        data.extend(header_bytes(false, 0));
        let (pos, _) = locate_startup(&mut Cursor::new(data.clone()), true)?;
        assert_eq!(pos, 256);
        let (pos, hdr) = locate_startup(&mut Cursor::new(data), false)?;
        assert_eq!(pos, 0);
        assert_eq!(hdr.zero[0], 0xdead);

        let lone = header_bytes(false, 1);
        assert!(matches!(locate_startup(&mut Cursor::new(lone), true), Err(Error::StartupNotFound)));
        Ok(())
    }
}
