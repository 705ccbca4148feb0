use std::io::{self, Read, Write};

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

/// Byte order declared by an image. Every multi-byte field is decoded in this
/// order with its own width, so 16-bit fields are never swapped as part of a
/// neighbouring 32-bit word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn from_big_flag(big: bool) -> Self {
        if big { Endian::Big } else { Endian::Little }
    }

    pub fn is_big(self) -> bool {
        matches!(self, Endian::Big)
    }

    pub fn read_u16<R: Read>(self, r: &mut R) -> io::Result<u16> {
        match self {
            Endian::Little => r.read_u16::<LittleEndian>(),
            Endian::Big => r.read_u16::<BigEndian>(),
        }
    }

    pub fn read_u32<R: Read>(self, r: &mut R) -> io::Result<u32> {
        match self {
            Endian::Little => r.read_u32::<LittleEndian>(),
            Endian::Big => r.read_u32::<BigEndian>(),
        }
    }

    pub fn write_u16<W: Write>(self, w: &mut W, v: u16) -> io::Result<()> {
        match self {
            Endian::Little => w.write_u16::<LittleEndian>(v),
            Endian::Big => w.write_u16::<BigEndian>(v),
        }
    }

    pub fn write_u32<W: Write>(self, w: &mut W, v: u32) -> io::Result<()> {
        match self {
            Endian::Little => w.write_u32::<LittleEndian>(v),
            Endian::Big => w.write_u32::<BigEndian>(v),
        }
    }

    pub fn u16_at(self, buf: &[u8], offset: usize) -> u16 {
        match self {
            Endian::Little => LittleEndian::read_u16(&buf[offset..offset + 2]),
            Endian::Big => BigEndian::read_u16(&buf[offset..offset + 2]),
        }
    }

    pub fn u32_at(self, buf: &[u8], offset: usize) -> u32 {
        match self {
            Endian::Little => LittleEndian::read_u32(&buf[offset..offset + 4]),
            Endian::Big => BigEndian::read_u32(&buf[offset..offset + 4]),
        }
    }

    /// The in-image byte sequence of a 32-bit value.
    pub fn u32_bytes(self, v: u32) -> [u8; 4] {
        match self {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        }
    }
}
