use std::fs::File;
use std::io::{self, BufReader, Cursor, IsTerminal, Read, Seek, Write};
use std::path::PathBuf;

use anyhow::{self, bail, Context};
use clap::{ArgAction, Parser};
use imagefs::ifs::dirent::Attr;
use imagefs::ifs::header::{IMAGE_HEADER_SIZE, STARTUP_HEADER_SIZE};
use imagefs::ifs::manifest::{hex, octal};
use imagefs::ifs::{DirEntry, EntryData, ExtractOptions, Extractor, ImageFs, OpenOptions, Selection};
use md5::{Digest, Md5};
use tracing::warn;
use tracing_subscriber::EnvFilter;

const INDENT: &str = "                       ";

/// Dump an image file system
#[derive(Parser, Debug)]
#[command(name = "dumpifs")]
struct Cli {
    /// The image file system to read, or - for standard input
    image: String,

    /// Only list or extract entries with these basenames
    files: Vec<String>,

    /// Extract to basenames of files
    #[arg(short = 'b')]
    basename: bool,

    /// Extract into this directory
    #[arg(short = 'd', value_name = "DIR")]
    dest: Option<PathBuf>,

    /// Extract named file (may be repeated)
    #[arg(short = 'f', value_name = "FILE")]
    extract_files: Vec<String>,

    /// Put a copy of the uncompressed image file here
    #[arg(short = 'u', value_name = "FILE")]
    uncompressed: Option<PathBuf>,

    /// Verbose (may be repeated)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Extract files
    #[arg(short = 'x')]
    extract: bool,

    /// Display MD5 checksum
    #[arg(short = 'm')]
    md5: bool,

    /// Disable the zero check while searching for the startup header
    #[arg(short = 'z')]
    no_zero_check: bool,

    /// Perform checksum checking
    #[arg(short = 'c')]
    checksums: bool,

    /// Fixup header of uncompressed file
    #[arg(short = 'e')]
    fixup: bool,

    /// Extract raw content
    #[arg(short = 'r')]
    raw: bool,
}

impl Cli {
    fn extracting(&self) -> bool {
        self.extract || self.dest.is_some() || !self.extract_files.is_empty()
    }

    fn display(&self) -> bool {
        !(self.extracting() || self.md5) || self.verbose > 1
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if cli.image == "-" {
        let mut stdin = io::stdin().lock();
        if stdin.is_terminal() {
            bail!("Must have an image file");
        }
        let mut data = Vec::new();
        stdin.read_to_end(&mut data).context("Unable to read standard input")?;
        dump(&cli, "-- stdin --", Cursor::new(data))
    } else {
        let f = File::open(&cli.image)
            .with_context(|| format!("Unable to open file {}", cli.image))?;
        dump(&cli, &cli.image, BufReader::new(f))
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn dump<R: Read + Seek>(cli: &Cli, name: &str, r: R) -> anyhow::Result<()> {
    let opts = OpenOptions {
        sentinel_check: !cli.no_zero_check,
        verify_checksums: cli.checksums,
        fixup_header: cli.fixup,
        uncompressed_copy: cli.uncompressed.clone(),
    };
    let mut ifs = ImageFs::with_options(r, &opts)
        .with_context(|| format!("Unable to process {}", name))?;

    let selection = Selection::new(cli.files.iter().cloned());
    let display = cli.display();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    let mut extractor = if cli.extracting() || cli.raw {
        let xopts = ExtractOptions {
            dest: cli.dest.clone().unwrap_or_else(|| PathBuf::from(".")),
            basename_only: cli.basename,
            inode_suffix: cli.raw,
            requested: cli.extract_files.clone(),
            selection: selection.clone(),
            raw: cli.raw,
            script_only: cli.raw && !cli.extracting(),
        };
        Some(Extractor::new(&mut ifs, xopts).context("Unable to prepare extraction")?)
    } else {
        None
    };

    if display {
        print_headers(&mut out, &ifs, &selection, cli.verbose)?;
    }

    let mut walker = ifs.walker();
    while !extractor.as_ref().map_or(false, |x| x.is_done()) {
        let entry = match ifs.next_entry(&mut walker).context("Unable to read directory")? {
            Some(entry) => entry,
            None => break,
        };
        if display || cli.md5 {
            print_entry(&mut out, &mut ifs, &entry, &selection, cli, display)?;
        }
        if let Some(x) = &mut extractor {
            x.extract_entry(&mut ifs, &entry)
                .with_context(|| format!("Unable to extract {}", entry.path))?;
        }
        if display && cli.verbose > 1 && ifs.is_script(&entry) {
            for record in ifs.decode_script(&entry)? {
                writeln!(out, "{}{}", INDENT, record)?;
            }
        }
    }

    if display {
        let sums = ifs.stored_checksums()?;
        write!(out, "Checksums: image={}", hex(sums.image))?;
        if let Some(startup) = sums.startup {
            write!(out, " startup={}", hex(startup))?;
        }
        writeln!(out)?;
    }
    out.flush()?;

    if let Some(x) = extractor {
        let report = x.finish()?;
        if !report.problems.is_empty() {
            warn!(problems = report.problems.len(), "some entries could not be fully extracted");
        }
    }
    Ok(())
}

fn print_headers<R, W>(out: &mut W, ifs: &ImageFs<R>, sel: &Selection, verbose: u8) -> io::Result<()>
where
    R: Read + Seek,
    W: Write,
{
    writeln!(out, "   Offset     Size  Name")?;
    if let (Some(spos), Some(h)) = (ifs.startup_pos(), ifs.startup_header()) {
        if spos != 0 && sel.accepts("*.boot") {
            writeln!(out, " {:8x} {:8x}  *.boot", 0, spos)?;
        }
        if sel.accepts("Startup-header") {
            writeln!(out, " {:8x} {:8x}  Startup-header flags1={} flags2={} paddr_bias={}",
                     spos, h.header_size, hex(h.flags1 as u32), hex(h.flags2 as u32), hex(h.paddr_bias))?;
            if verbose > 0 {
                writeln!(out, "{}preboot_size={}", INDENT, hex(h.preboot_size as u32))?;
                writeln!(out, "{}image_paddr={} stored_size={}", INDENT, hex(h.image_paddr), hex(h.stored_size))?;
                writeln!(out, "{}startup_size={} imagefs_size={}", INDENT, hex(h.startup_size), hex(h.imagefs_size))?;
                writeln!(out, "{}ram_paddr={} ram_size={}", INDENT, hex(h.ram_paddr), hex(h.ram_size))?;
                writeln!(out, "{}startup_vaddr={}", INDENT, hex(h.startup_vaddr))?;
            }
        }
        if sel.accepts("startup.*") {
            writeln!(out, " {:8x} {:8x}  startup.*",
                     spos + STARTUP_HEADER_SIZE as u64, h.startup_size as u64 - STARTUP_HEADER_SIZE as u64)?;
        }
    }

    let ih = ifs.image_header();
    if sel.accepts("Image-header") {
        write!(out, " {:8x} {:8x}  Image-header", ifs.image_pos(), IMAGE_HEADER_SIZE)?;
        if !ih.mountpoint.is_empty() {
            write!(out, " mountpoint={}", ih.mountpoint)?;
        }
        writeln!(out)?;
        if verbose > 0 {
            write!(out, "{}flags={}", INDENT, hex(ih.flags as u32))?;
            if ih.chain_paddr != 0 {
                write!(out, " chain={}", hex(ih.chain_paddr))?;
            }
            if ih.script_ino != 0 {
                write!(out, " script={:x}", ih.script_ino)?;
            }
            let boot: Vec<String> = ih.boot_ino.iter().filter(|i| **i != 0).map(|i| format!("{:x}", i)).collect();
            if !boot.is_empty() {
                write!(out, " boot={}", boot.join(","))?;
            }
            if ih.spare.iter().any(|s| *s != 0) {
                write!(out, " spare={}", hex(ih.spare[0]))?;
                for s in &ih.spare[1..] {
                    write!(out, ",{}", *s as i32)?;
                }
            }
            writeln!(out, " mntflg={}", hex(ih.mountflags))?;
        }
    }
    if sel.accepts("Image-directory") {
        writeln!(out, " {:8x} {:8x}  Image-directory", ifs.dir_pos(), ih.hdr_dir_size - ih.dir_offset)?;
    }
    Ok(())
}

fn print_attr<W: Write>(out: &mut W, attr: &Attr) -> io::Result<()> {
    writeln!(out, "{}gid={} uid={} mode={} mtime={:08x} ino={:08x} {}",
             INDENT, attr.gid as i32, attr.uid as i32, octal(attr.perms()), attr.mtime, attr.ino,
             attr.inode_flags().letters())
}

fn print_entry<R, W>(out: &mut W, ifs: &mut ImageFs<R>, entry: &DirEntry, sel: &Selection, cli: &Cli, display: bool) -> anyhow::Result<()>
where
    R: Read + Seek,
    W: Write,
{
    let shown = if entry.is_root() { "Root-dirent" } else { entry.path.as_str() };
    if !sel.accepts(shown) {
        return Ok(());
    }
    match &entry.data {
        EntryData::File { offset, size } => {
            write!(out, " {:8x} {:8x}  {} [file]", ifs.data_pos(*offset), size, entry.path)?;
            if cli.md5 {
                write!(out, " {}", md5_hex(ifs, entry)?)?;
            }
            writeln!(out)?;
        }
        _ if !display => return Ok(()),
        EntryData::Dir => writeln!(out, "     ----     ----  {} [dir]", shown)?,
        EntryData::Symlink { target } => {
            writeln!(out, "     ---- {:8x}  {} -> {} [symlink]", target.len(), entry.path, target)?
        }
        EntryData::Device { dev, rdev } => {
            writeln!(out, "     ----     ----  {} dev={} rdev={} [dev]", entry.path, *dev as i32, *rdev as i32)?
        }
    }
    if cli.verbose > 0 {
        print_attr(out, &entry.attr)?;
    }
    Ok(())
}

fn md5_hex<R: Read + Seek>(ifs: &mut ImageFs<R>, entry: &DirEntry) -> anyhow::Result<String> {
    let mut hasher = Md5::new();
    ifs.copy_file(entry, &mut hasher).with_context(|| format!("Unable to read {}", entry.path))?;
    Ok(hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect())
}
