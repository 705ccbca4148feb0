//! Decoder for UCL NRV2B streams using the 8-bit bit buffer layout.
//!
//! Control bits are packed MSB-first into bytes that are interleaved with literal and offset
//! bytes in stream order: a control byte is fetched at the moment the previous one runs dry.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nrv2bError {
    #[error("input overrun")]
    InputOverrun,
    #[error("output overrun")]
    OutputOverrun,
    #[error("lookbehind overrun")]
    LookbehindOverrun,
    #[error("input not consumed")]
    InputNotConsumed,
}

const MAX_OFFSET_CODE: u32 = 0x00ff_ffff + 3;
const FAR_MATCH: u32 = 0xd00;
const END_OF_STREAM: u32 = 0xffff_ffff;

struct BitReader<'a> {
    src: &'a [u8],
    pos: usize,
    bb: u32,
}

impl<'a> BitReader<'a> {
    fn new(src: &'a [u8]) -> Self {
        BitReader { src, pos: 0, bb: 0 }
    }

    fn byte(&mut self) -> Result<u8, Nrv2bError> {
        let b = *self.src.get(self.pos).ok_or(Nrv2bError::InputOverrun)?;
        self.pos += 1;
        Ok(b)
    }

    fn bit(&mut self) -> Result<u32, Nrv2bError> {
        if self.bb & 0x7f != 0 {
            self.bb = (self.bb << 1) & 0x1ff;
        } else {
            self.bb = ((self.byte()? as u32) << 1) | 1;
        }
        Ok((self.bb >> 8) & 1)
    }

    /// Elias-gamma style number: data bits each followed by a stop bit.
    fn gamma(&mut self, limit: u32, err: Nrv2bError) -> Result<u32, Nrv2bError> {
        let mut v: u32 = 1;
        loop {
            v = v * 2 + self.bit()?;
            if v > limit {
                return Err(err);
            }
            if self.bit()? == 1 {
                return Ok(v);
            }
        }
    }
}

/// Decompress one chunk into `dst`, returning the number of bytes produced. The whole of `src`
/// must be consumed.
pub fn decompress(src: &[u8], dst: &mut [u8]) -> Result<usize, Nrv2bError> {
    let mut r = BitReader::new(src);
    let mut olen: usize = 0;
    let mut last_m_off: u32 = 1;

    loop {
        while r.bit()? == 1 {
            let b = r.byte()?;
            *dst.get_mut(olen).ok_or(Nrv2bError::OutputOverrun)? = b;
            olen += 1;
        }

        let mut m_off = r.gamma(MAX_OFFSET_CODE, Nrv2bError::LookbehindOverrun)?;
        if m_off == 2 {
            m_off = last_m_off;
        } else {
            m_off = (m_off - 3) * 256 + r.byte()? as u32;
            if m_off == END_OF_STREAM {
                break;
            }
            m_off += 1;
            last_m_off = m_off;
        }

        let mut m_len = r.bit()? * 2 + r.bit()?;
        if m_len == 0 {
            m_len = r.gamma(dst.len() as u32, Nrv2bError::OutputOverrun)? + 2;
        }
        if m_off > FAR_MATCH {
            m_len += 1;
        }

        let m_off = m_off as usize;
        let count = m_len as usize + 1;
        if m_off > olen {
            return Err(Nrv2bError::LookbehindOverrun);
        }
        if olen + count > dst.len() {
            return Err(Nrv2bError::OutputOverrun);
        }
        // Overlapping copies repeat the most recent output
        for _ in 0..count {
            dst[olen] = dst[olen - m_off];
            olen += 1;
        }
    }

    if r.pos < src.len() {
        return Err(Nrv2bError::InputNotConsumed);
    }
    Ok(olen)
}
