//! Raw-mode artifacts. Alongside the extracted tree, raw mode writes the pieces of the image
//! that are not files (`binary.boot`, `startup`, `imagefs`) and a build description
//! (`buildfile.bld`, plus `bootstrap` for images with a startup header) from which an equivalent
//! image could be rebuilt.

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, Write};
use std::path::Path;

use tracing::debug;

use super::dirent::{DirEntry, EntryData, EntryKind, InodeFlags};
use super::error::Result;
use super::header::{Compression, STARTUP_HEADER_SIZE, TRAILER_SIZE};
use super::image::ImageFs;

pub const BOOT_FILE: &str = "binary.boot";
pub const STARTUP_FILE: &str = "startup";
pub const IMAGEFS_FILE: &str = "imagefs";
pub const BOOTSTRAP_FILE: &str = "bootstrap";
pub const BUILD_FILE: &str = "buildfile.bld";

/// Octal with a leading zero, except for zero itself.
pub fn octal(v: u32) -> String {
    if v == 0 {
        "0".to_string()
    } else {
        format!("{:#o}", v).replacen("0o", "0", 1)
    }
}

/// Hex with a `0x` prefix, except for zero itself.
pub fn hex(v: u32) -> String {
    if v == 0 {
        "0".to_string()
    } else {
        format!("{:#x}", v)
    }
}

/// Largest alignment the absolute data position satisfies.
pub fn phys_align(abs_offset: u64) -> &'static str {
    if abs_offset % 0x10_0000 == 0 {
        "1M"
    } else if abs_offset % 0x1_0000 == 0 {
        "64K"
    } else {
        "4K"
    }
}

pub fn image_line(image_paddr: u32, spos: u64) -> String {
    format!("[image=0x{:x}]", image_paddr.wrapping_sub(spos as u32))
}

pub fn virtual_line(compression: Compression) -> String {
    let compress = if compression == Compression::None { "" } else { " +compress" };
    format!("[virtual=binary{}] {}", compress, BOOTSTRAP_FILE)
}

pub fn bootstrap_line(machine: u16, startup_vaddr: u32) -> String {
    format!("[machine={} entry=0x{:x}] {}", machine, startup_vaddr, STARTUP_FILE)
}

/// The build description line for one entry, or `None` for entries that have none. `name` is
/// the name the entry was extracted under; `on_bootstrap` selects the bootstrap file form, which
/// leaves the source name off.
pub fn entry_line(entry: &DirEntry, name: &str, abs_offset: u64, is_script: bool, on_bootstrap: bool) -> Option<String> {
    let a = &entry.attr;
    let (gid, uid) = (a.gid as i32, a.uid as i32);
    let perms = octal(a.mode & 0o7777);
    match &entry.data {
        EntryData::Dir if entry.is_root() => None,
        EntryData::Dir => Some(format!(
            "[type=dir gid={} uid={} dperms={} mtime={}] {}",
            gid, uid, perms, a.mtime, entry.path
        )),
        EntryData::Symlink { target } => Some(format!(
            "[type=link gid={} uid={} perms={} mtime={} flags={}] {}={}",
            gid, uid, perms, a.mtime, a.inode_flags().build_flags(), entry.path, target
        )),
        EntryData::File { .. } if is_script => Some(format!(
            "[type=file gid={} uid={} perms={} mtime={} phys_align={} +script] {}={}",
            gid, uid, perms, a.mtime, phys_align(abs_offset), entry.path, name
        )),
        EntryData::File { .. } => {
            let head = format!(
                "[type=file gid={} uid={} perms={} mtime={} +raw flags={} phys_align={}] {}",
                gid, uid, perms, a.mtime, a.inode_flags().build_flags(), phys_align(abs_offset), entry.path
            );
            if on_bootstrap {
                Some(head)
            } else {
                Some(format!("{}={}", head, name))
            }
        }
        EntryData::Device { .. } => None,
    }
}

/// Open writers for the build description files of one extraction.
pub struct Manifest {
    bld: BufWriter<File>,
    bootstrap: Option<BufWriter<File>>,
    ipos: u64,
    lines: usize,
}

impl Manifest {
    /// Write the region artifacts into `dir` and start the build description files.
    pub fn create<R>(dir: &Path, ifs: &mut ImageFs<R>) -> Result<Manifest>
    where R: Read + Seek
    {
        let ipos = ifs.image_pos();
        let image_size = ifs.image_header().image_size as u64;
        let mountpoint = ifs.image_header().mountpoint.clone();

        let mut bld = BufWriter::new(File::create(dir.join(BUILD_FILE))?);
        let bootstrap = match ifs.startup_header().cloned().zip(ifs.startup_pos()) {
            Some((hdr, spos)) => {
                let mut boot = BufWriter::new(File::create(dir.join(BOOT_FILE))?);
                boot.write_all(b"boot")?;
                ifs.copy_region(0, spos, &mut boot)?;
                boot.flush()?;

                let mut startup = BufWriter::new(File::create(dir.join(STARTUP_FILE))?);
                let code_len = hdr.startup_size as u64 - STARTUP_HEADER_SIZE as u64 - TRAILER_SIZE as u64;
                ifs.copy_region(spos + STARTUP_HEADER_SIZE as u64, code_len, &mut startup)?;
                startup.flush()?;

                let mut bootstrap = BufWriter::new(File::create(dir.join(BOOTSTRAP_FILE))?);
                writeln!(bootstrap, "{}", bootstrap_line(hdr.machine, hdr.startup_vaddr))?;

                writeln!(bld, "{}", image_line(hdr.image_paddr, spos))?;
                writeln!(bld, "{}", virtual_line(ifs.compression()))?;
                Some(bootstrap)
            }
            None => None,
        };

        let mut image = BufWriter::new(File::create(dir.join(IMAGEFS_FILE))?);
        ifs.copy_region(ipos, image_size, &mut image)?;
        image.flush()?;

        writeln!(bld, "[+page_align]")?;
        writeln!(bld, "[prefix=\"\"]")?;
        writeln!(bld, "[mount=\"{}\"]", mountpoint)?;
        debug!(dir = %dir.display(), bootstrap = bootstrap.is_some(), "raw artifacts written");

        Ok(Manifest { bld, bootstrap, ipos, lines: 0 })
    }

    /// Add the build description line for an entry. Bootstrap executables go to the bootstrap
    /// file when there is one.
    pub fn record(&mut self, entry: &DirEntry, is_script: bool, name: &str) -> io::Result<()> {
        let abs = match entry.file_extent() {
            Some((offset, _)) => self.ipos + offset as u64,
            None => 0,
        };
        let on_bootstrap = entry.kind == EntryKind::File
            && !is_script
            && entry.attr.inode_flags().contains(InodeFlags::BOOTSTRAP_EXE)
            && self.bootstrap.is_some();
        let line = match entry_line(entry, name, abs, is_script, on_bootstrap) {
            Some(line) => line,
            None => return Ok(()),
        };
        match (&mut self.bootstrap, on_bootstrap) {
            (Some(w), true) => writeln!(w, "{}", line)?,
            _ => writeln!(self.bld, "{}", line)?,
        }
        self.lines += 1;
        Ok(())
    }

    pub fn finish(mut self) -> io::Result<()> {
        self.bld.flush()?;
        if let Some(w) = &mut self.bootstrap {
            w.flush()?;
        }
        debug!(lines = self.lines, "build description written");
        Ok(())
    }
}
