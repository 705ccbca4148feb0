use std::io::{self, Read, Write};

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::endian::Endian;
use super::error::{Error, Result};

pub const STARTUP_SIGNATURE: u32 = 0x00ff7eeb;
pub const IMAGE_SIGNATURE: &[u8; 7] = b"imagefs";

pub const STARTUP_HEADER_SIZE: usize = 256;
pub const IMAGE_HEADER_SIZE: usize = 0x5c;
pub const TRAILER_SIZE: u32 = 4;

/// Offset of the inline mount point within the image header
pub const MOUNTPOINT_OFFSET: usize = 88;
const MOUNTPOINT_MAX: usize = 512;

const INFO_WORDS: usize = 48;

bitflags! {
    pub struct StartupFlags1: u8 {
        const VIRTUAL = 0x01;
        const BIGENDIAN = 0x02;
        const COMPRESS_MASK = 0x1c;
        const TRAILER_V2 = 0x20;
    }
}

bitflags! {
    pub struct ImageFlags: u8 {
        const BIGENDIAN = 0x01;
        const READONLY = 0x02;
        const INO_BITS = 0x04;
        const SORTED = 0x08;
        const TRAILER_V2 = 0x10;
    }
}

/// Payload compression selected by the startup header's `flags1` bits.
#[derive(Debug, IntoPrimitive, TryFromPrimitive, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Compression {
    None = 0x00,
    Zlib = 0x04,
    Lzo = 0x08,
    Ucl = 0x0c,
}

/// The bootstrap ("startup") header. Every field is held in host order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapHeader {
    pub signature: u32,
    pub version: u16,
    pub flags1: u8,
    pub flags2: u8,
    pub header_size: u16,
    pub machine: u16,
    pub startup_vaddr: u32,
    pub paddr_bias: u32,
    pub image_paddr: u32,
    pub ram_paddr: u32,
    pub ram_size: u32,
    pub startup_size: u32,
    pub stored_size: u32,
    pub imagefs_paddr: u32,
    pub imagefs_size: u32,
    pub preboot_size: u16,
    pub zero0: u16,
    pub zero: [u32; 3],
    pub info: [u32; INFO_WORDS],
}

impl BootstrapHeader {
    /// Read a whole header, signature included. The byte order is taken from the `flags1`
    /// BIGENDIAN bit, which is a single byte and so can be inspected before any other field.
    pub fn read<R>(r: &mut R) -> io::Result<BootstrapHeader>
    where R: Read
    {
        let mut buf = [0u8; STARTUP_HEADER_SIZE];
        r.read_exact(&mut buf)?;
        BootstrapHeader::from_bytes(&buf)
    }

    pub fn from_bytes(b: &[u8; STARTUP_HEADER_SIZE]) -> io::Result<BootstrapHeader> {
        let e = Endian::from_big_flag(b[6] & StartupFlags1::BIGENDIAN.bits() != 0);
        let r = &mut &b[..];
        let mut hdr = BootstrapHeader {
            signature: e.read_u32(r)?,
            version: e.read_u16(r)?,
            flags1: read_u8(r)?,
            flags2: read_u8(r)?,
            header_size: e.read_u16(r)?,
            machine: e.read_u16(r)?,
            startup_vaddr: e.read_u32(r)?,
            paddr_bias: e.read_u32(r)?,
            image_paddr: e.read_u32(r)?,
            ram_paddr: e.read_u32(r)?,
            ram_size: e.read_u32(r)?,
            startup_size: e.read_u32(r)?,
            stored_size: e.read_u32(r)?,
            imagefs_paddr: e.read_u32(r)?,
            imagefs_size: e.read_u32(r)?,
            // 16-bit fields sharing a word; each is corrected on its own
            preboot_size: e.read_u16(r)?,
            zero0: e.read_u16(r)?,
            zero: [0; 3],
            info: [0; INFO_WORDS],
        };
        for z in hdr.zero.iter_mut() {
            *z = e.read_u32(r)?;
        }
        for i in hdr.info.iter_mut() {
            *i = e.read_u32(r)?;
        }
        Ok(hdr)
    }

    /// Encode the header in its own byte order.
    pub fn write<W>(&self, w: &mut W) -> io::Result<()>
    where W: Write
    {
        let e = self.endian();
        e.write_u32(w, self.signature)?;
        e.write_u16(w, self.version)?;
        w.write_all(&[self.flags1, self.flags2])?;
        e.write_u16(w, self.header_size)?;
        e.write_u16(w, self.machine)?;
        for v in [
            self.startup_vaddr,
            self.paddr_bias,
            self.image_paddr,
            self.ram_paddr,
            self.ram_size,
            self.startup_size,
            self.stored_size,
            self.imagefs_paddr,
            self.imagefs_size,
        ] {
            e.write_u32(w, v)?;
        }
        e.write_u16(w, self.preboot_size)?;
        e.write_u16(w, self.zero0)?;
        for v in self.zero.iter().chain(self.info.iter()) {
            e.write_u32(w, *v)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(STARTUP_HEADER_SIZE);
        // Writing into a Vec cannot fail
        let _ = self.write(&mut v);
        v
    }

    pub fn flags(&self) -> StartupFlags1 {
        StartupFlags1::from_bits_truncate(self.flags1)
    }

    pub fn endian(&self) -> Endian {
        Endian::from_big_flag(self.flags().contains(StartupFlags1::BIGENDIAN))
    }

    /// The three reserved words must be zero in a genuine header.
    pub fn sentinel_ok(&self) -> bool {
        self.zero.iter().all(|z| *z == 0)
    }

    pub fn is_compressed(&self) -> bool {
        self.flags1 & StartupFlags1::COMPRESS_MASK.bits() != 0
    }

    pub fn compression(&self) -> Result<Compression> {
        let bits = self.flags1 & StartupFlags1::COMPRESS_MASK.bits();
        Compression::try_from(bits).map_err(|_| Error::UnsupportedCompression(bits))
    }

    pub fn validate(&self) -> Result<()> {
        if (self.startup_size as usize) < STARTUP_HEADER_SIZE + TRAILER_SIZE as usize {
            return Err(Error::CorruptHeader("startup"));
        }
        Ok(())
    }

    /// Absolute offset of the data following the bootstrap region.
    pub fn payload_offset(&self, spos: u64) -> u64 {
        spos + self.startup_size as u64
    }

    pub fn payload_len(&self) -> u64 {
        self.stored_size.saturating_sub(self.startup_size) as u64
    }

    pub fn trailer_offset(&self, spos: u64) -> u64 {
        spos + (self.startup_size - TRAILER_SIZE) as u64
    }
}

/// The image file system header that precedes the packed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub signature: [u8; 7],
    pub flags: u8,
    pub image_size: u32,
    pub hdr_dir_size: u32,
    pub dir_offset: u32,
    pub boot_ino: [u32; 4],
    pub script_ino: u32,
    pub chain_paddr: u32,
    pub spare: [u32; 10],
    pub mountflags: u32,
    pub mountpoint: String,
}

impl ImageHeader {
    /// Read the header, signature included, followed by the mount point string that runs from
    /// the end of the fixed fields up to the directory.
    pub fn read<R>(r: &mut R) -> io::Result<ImageHeader>
    where R: Read
    {
        let mut buf = [0u8; MOUNTPOINT_OFFSET];
        r.read_exact(&mut buf)?;
        let mut hdr = ImageHeader::from_bytes(&buf)?;

        let avail = (hdr.dir_offset as usize).saturating_sub(MOUNTPOINT_OFFSET).min(MOUNTPOINT_MAX);
        let mut mp = vec![0u8; avail];
        r.read_exact(&mut mp)?;
        let end = mp.iter().position(|b| *b == 0).unwrap_or(mp.len());
        hdr.mountpoint = String::from_utf8_lossy(&mp[..end]).into_owned();
        Ok(hdr)
    }

    /// Decode the fixed fields. The mount point is left empty.
    pub fn from_bytes(b: &[u8; MOUNTPOINT_OFFSET]) -> io::Result<ImageHeader> {
        let e = Endian::from_big_flag(b[7] & ImageFlags::BIGENDIAN.bits() != 0);
        let mut signature = [0u8; 7];
        signature.copy_from_slice(&b[..7]);
        let r = &mut &b[8..];
        let mut hdr = ImageHeader {
            signature,
            flags: b[7],
            image_size: e.read_u32(r)?,
            hdr_dir_size: e.read_u32(r)?,
            dir_offset: e.read_u32(r)?,
            boot_ino: [0; 4],
            script_ino: 0,
            chain_paddr: 0,
            spare: [0; 10],
            mountflags: 0,
            mountpoint: String::new(),
        };
        for v in hdr.boot_ino.iter_mut() {
            *v = e.read_u32(r)?;
        }
        hdr.script_ino = e.read_u32(r)?;
        hdr.chain_paddr = e.read_u32(r)?;
        for v in hdr.spare.iter_mut() {
            *v = e.read_u32(r)?;
        }
        hdr.mountflags = e.read_u32(r)?;
        Ok(hdr)
    }

    pub fn flags(&self) -> ImageFlags {
        ImageFlags::from_bits_truncate(self.flags)
    }

    pub fn endian(&self) -> Endian {
        Endian::from_big_flag(self.flags().contains(ImageFlags::BIGENDIAN))
    }

    pub fn validate(&self) -> Result<()> {
        if (self.dir_offset as usize) < MOUNTPOINT_OFFSET
            || self.hdr_dir_size < self.dir_offset
            || self.image_size < TRAILER_SIZE
        {
            return Err(Error::CorruptHeader("image"));
        }
        Ok(())
    }

    pub fn dir_pos(&self, ipos: u64) -> u64 {
        ipos + self.dir_offset as u64
    }

    pub fn dir_size(&self) -> u32 {
        self.hdr_dir_size - self.dir_offset
    }

    pub fn trailer_offset(&self, ipos: u64) -> u64 {
        ipos + (self.image_size - TRAILER_SIZE) as u64
    }
}

fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}
