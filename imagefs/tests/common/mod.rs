//! Synthetic image builder shared by the integration tests.
#![allow(dead_code)]

use imagefs::ifs::{BootstrapHeader, Compression};

pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;
pub const S_IFNAM: u32 = 0o050000;

pub const INO_BOOTSTRAP_EXE: u32 = 0x2000_0000;

pub const SCRIPT_PATH: &str = "proc/boot/.script";
pub const MTIME: u32 = 0x5f00_0000;

#[derive(Debug, Clone)]
pub enum Body {
    File(Vec<u8>),
    Dir,
    Symlink(String),
    Device { dev: u32, rdev: u32 },
    /// A complete record, size field included, written as is
    Raw(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub path: String,
    pub ino: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
    pub body: Body,
}

/// Where things ended up in a built image.
#[derive(Debug, Clone)]
pub struct Built {
    pub bytes: Vec<u8>,
    pub spos: Option<u64>,
    pub ipos: u64,
    /// The image file system region, as it is once decompressed
    pub imagefs: Vec<u8>,
    pub startup_size: u32,
    pub header: Option<BootstrapHeader>,
}

pub struct ImageBuilder {
    big: bool,
    bootstrap: bool,
    prefix: Vec<u8>,
    compression: Compression,
    mountpoint: String,
    script_ino: u32,
    startup_code: Vec<u8>,
    nodes: Vec<Node>,
    next_ino: u32,
    uid: u32,
    gid: u32,
}

impl ImageBuilder {
    pub fn new() -> Self {
        let mut b = ImageBuilder {
            big: false,
            bootstrap: true,
            prefix: Vec::new(),
            compression: Compression::None,
            mountpoint: "/".to_string(),
            script_ino: 0,
            startup_code: vec![0x90; 64],
            nodes: Vec::new(),
            next_ino: 1,
            uid: 0,
            gid: 0,
        };
        b.push("", S_IFDIR | 0o755, Body::Dir, 0);
        b
    }

    pub fn big_endian(mut self) -> Self {
        self.big = true;
        self
    }

    /// No bootstrap: the image starts with the file system header.
    pub fn bare(mut self) -> Self {
        self.bootstrap = false;
        self
    }

    pub fn prefix(mut self, bytes: &[u8]) -> Self {
        self.prefix = bytes.to_vec();
        self
    }

    pub fn compression(mut self, c: Compression) -> Self {
        self.compression = c;
        self
    }

    pub fn mountpoint(mut self, mp: &str) -> Self {
        self.mountpoint = mp.to_string();
        self
    }

    /// Owner given to every entry added after this call.
    pub fn owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    fn push(&mut self, path: &str, mode: u32, body: Body, flags: u32) -> u32 {
        let ino = self.next_ino | flags;
        self.next_ino += 1;
        self.nodes.push(Node { path: path.to_string(), ino, mode, uid: self.uid, gid: self.gid, mtime: MTIME, body });
        ino
    }

    pub fn dir(mut self, path: &str) -> Self {
        self.push(path, S_IFDIR | 0o755, Body::Dir, 0);
        self
    }

    pub fn file(mut self, path: &str, data: &[u8]) -> Self {
        self.push(path, S_IFREG | 0o644, Body::File(data.to_vec()), 0);
        self
    }

    pub fn file_with(mut self, path: &str, mode: u32, data: &[u8], flags: u32) -> Self {
        self.push(path, S_IFREG | mode, Body::File(data.to_vec()), flags);
        self
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        self.push(path, S_IFLNK | 0o777, Body::Symlink(target.to_string()), 0);
        self
    }

    pub fn device(mut self, path: &str, kind: u32, dev: u32, rdev: u32) -> Self {
        self.push(path, kind | 0o666, Body::Device { dev, rdev }, 0);
        self
    }

    pub fn raw_record(mut self, record: Vec<u8>) -> Self {
        self.push("", 0, Body::Raw(record), 0);
        self
    }

    pub fn script(mut self, script: Vec<u8>) -> Self {
        self.script_ino = self.push(SCRIPT_PATH, S_IFREG | 0o644, Body::File(script), 0);
        self
    }

    fn u16(&self, v: u16) -> [u8; 2] {
        if self.big { v.to_be_bytes() } else { v.to_le_bytes() }
    }

    fn u32(&self, v: u32) -> [u8; 4] {
        if self.big { v.to_be_bytes() } else { v.to_le_bytes() }
    }

    fn record(&self, n: &Node, offset: u32) -> Vec<u8> {
        let mut body = Vec::new();
        match &n.body {
            Body::Raw(bytes) => return bytes.clone(),
            Body::File(data) => {
                body.extend_from_slice(&self.u32(offset));
                body.extend_from_slice(&self.u32(data.len() as u32));
                push_cstr(&mut body, &n.path);
            }
            Body::Dir => push_cstr(&mut body, &n.path),
            Body::Symlink(target) => {
                body.extend_from_slice(&self.u16(n.path.len() as u16 + 1));
                body.extend_from_slice(&self.u16(target.len() as u16));
                push_cstr(&mut body, &n.path);
                push_cstr(&mut body, target);
            }
            Body::Device { dev, rdev } => {
                body.extend_from_slice(&self.u32(*dev));
                body.extend_from_slice(&self.u32(*rdev));
                push_cstr(&mut body, &n.path);
            }
        }
        let size = align4(24 + body.len());
        let mut rec = Vec::with_capacity(size);
        rec.extend_from_slice(&self.u16(size as u16));
        rec.extend_from_slice(&self.u16(0));
        for v in [n.ino, n.mode, n.gid, n.uid, n.mtime] {
            rec.extend_from_slice(&self.u32(v));
        }
        rec.extend_from_slice(&body);
        rec.resize(size, 0);
        rec
    }

    fn directory(&self, offsets: &[u32]) -> Vec<u8> {
        let mut dir = Vec::new();
        for (n, off) in self.nodes.iter().zip(offsets) {
            dir.extend_from_slice(&self.record(n, *off));
        }
        dir.extend_from_slice(&[0; 4]);
        dir
    }

    /// The file system region: header, mount point, directory, file data, trailer.
    pub fn build_imagefs(&self) -> Vec<u8> {
        let mut mp = self.mountpoint.as_bytes().to_vec();
        mp.push(0);
        let dir_offset = align4(88 + mp.len());

        let dir_len = self.directory(&vec![0; self.nodes.len()]).len();
        let hdr_dir_size = dir_offset + dir_len;
        let mut cursor = align4(hdr_dir_size);
        let mut offsets = Vec::new();
        for n in &self.nodes {
            match &n.body {
                Body::File(data) => {
                    offsets.push(cursor as u32);
                    cursor = align4(cursor + data.len());
                }
                _ => offsets.push(0),
            }
        }
        let image_size = cursor + 4;

        let mut img = Vec::with_capacity(image_size);
        img.extend_from_slice(b"imagefs");
        img.push((if self.big { 0x01 } else { 0 }) | 0x02);
        for v in [image_size as u32, hdr_dir_size as u32, dir_offset as u32] {
            img.extend_from_slice(&self.u32(v));
        }
        let boot = self.nodes.iter().find(|n| n.ino & INO_BOOTSTRAP_EXE != 0).map_or(0, |n| n.ino);
        for v in [boot, 0, 0, 0, self.script_ino, 0] {
            img.extend_from_slice(&self.u32(v));
        }
        for _ in 0..10 {
            img.extend_from_slice(&self.u32(0));
        }
        img.extend_from_slice(&self.u32(0));
        img.extend_from_slice(&mp);
        img.resize(dir_offset, 0);
        img.extend_from_slice(&self.directory(&offsets));
        for (n, off) in self.nodes.iter().zip(&offsets) {
            if let Body::File(data) = &n.body {
                img.resize(*off as usize, 0);
                img.extend_from_slice(data);
            }
        }
        img.resize(image_size - 4, 0);
        let sum = self.checksum(&img);
        img.extend_from_slice(&self.u32(sum));
        img
    }

    pub fn checksum(&self, data: &[u8]) -> u32 {
        let mut sum: u32 = 0;
        for w in data.chunks_exact(4) {
            let v = [w[0], w[1], w[2], w[3]];
            sum = sum.wrapping_add(if self.big { u32::from_be_bytes(v) } else { u32::from_le_bytes(v) });
        }
        sum.wrapping_neg()
    }

    pub fn build(&self) -> Built {
        let imagefs = self.build_imagefs();
        if !self.bootstrap {
            let mut bytes = self.prefix.clone();
            bytes.extend_from_slice(&imagefs);
            return Built { ipos: self.prefix.len() as u64, bytes, spos: None, imagefs, startup_size: 0, header: None };
        }

        let payload = compress(self.compression, &imagefs);
        let startup_size = (256 + self.startup_code.len() + 4) as u32;
        let spos = self.prefix.len() as u32;
        let hdr = BootstrapHeader {
            signature: 0x00ff7eeb,
            version: 1,
            flags1: (if self.big { 0x02 } else { 0 }) | u8::from(self.compression),
            flags2: 0,
            header_size: 256,
            machine: 3,
            startup_vaddr: 0x0010_1000,
            paddr_bias: 0,
            image_paddr: 0x0010_0000 + spos,
            ram_paddr: 0x0010_0000,
            ram_size: 0x0040_0000,
            startup_size,
            stored_size: startup_size + payload.len() as u32,
            imagefs_paddr: 0x0010_0000 + startup_size,
            imagefs_size: imagefs.len() as u32,
            preboot_size: 0,
            zero0: 0,
            zero: [0; 3],
            info: [0; 48],
        };

        let mut startup = hdr.to_bytes();
        startup.extend_from_slice(&self.startup_code);
        let sum = self.checksum(&startup);
        startup.extend_from_slice(&self.u32(sum));

        let mut bytes = self.prefix.clone();
        bytes.extend_from_slice(&startup);
        bytes.extend_from_slice(&payload);
        Built {
            bytes,
            spos: Some(spos as u64),
            ipos: (spos + startup_size) as u64,
            imagefs,
            startup_size,
            header: Some(hdr),
        }
    }
}

pub fn align4(v: usize) -> usize {
    (v + 3) & !3
}

fn push_cstr(v: &mut Vec<u8>, s: &str) {
    v.extend_from_slice(s.as_bytes());
    v.push(0);
}

pub fn compress(c: Compression, data: &[u8]) -> Vec<u8> {
    match c {
        Compression::None => data.to_vec(),
        Compression::Zlib => gzip(data),
        Compression::Lzo => framed(lzo_chunks(data)),
        Compression::Ucl => framed(data.chunks(0x4000).map(ucl_literals).collect()),
    }
}

#[cfg(feature = "zlib")]
fn gzip(data: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

#[cfg(not(feature = "zlib"))]
fn gzip(_data: &[u8]) -> Vec<u8> {
    panic!("zlib support disabled")
}

fn framed(chunks: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::new();
    for c in chunks {
        out.extend_from_slice(&(c.len() as u16).to_be_bytes());
        out.extend_from_slice(&c);
    }
    out.extend_from_slice(&[0, 0]);
    out
}

// LZO1X streams made of a single literal run each, 4 to 238 bytes long
fn lzo_chunks(data: &[u8]) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let n = match rest.len() {
            l if l <= 238 => l,
            l if l - 238 < 4 => 200,
            _ => 238,
        };
        let mut c = vec![17 + n as u8];
        c.extend_from_slice(&rest[..n]);
        c.extend_from_slice(&[0x11, 0, 0]);
        chunks.push(c);
        rest = &rest[n..];
    }
    chunks
}

// NRV2B stream holding only literals
fn ucl_literals(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut at = 0;
    let mut mask = 0u8;
    let mut bit = |out: &mut Vec<u8>, b: bool| {
        if mask == 0 {
            at = out.len();
            out.push(0);
            mask = 0x80;
        }
        if b {
            out[at] |= mask;
        }
        mask >>= 1;
    };
    for b in data {
        bit(&mut out, true);
        out.push(*b);
    }
    // end marker: a match whose offset code decodes to 0xffffffff
    bit(&mut out, false);
    let v: u32 = 0x0100_0002;
    let bits = 32 - v.leading_zeros();
    for i in (0..bits - 1).rev() {
        bit(&mut out, (v >> i) & 1 == 1);
        bit(&mut out, i == 0);
    }
    out.push(0xff);
    out
}

/// Script record encoders.
pub mod script {
    fn record(kind: u8, body: &[u8]) -> Vec<u8> {
        let size = super::align4(4 + body.len());
        let mut r = vec![(size & 0xff) as u8, (size >> 8) as u8, kind, 0];
        r.extend_from_slice(body);
        r.resize(size, 0);
        r
    }

    fn strings(v: &mut Vec<u8>, list: &[&str]) {
        for s in list {
            super::push_cstr(v, s);
        }
    }

    pub fn external(flags: u8, priority: u8, policy: u8, command: &str, argv: &[&str], envv: &[&str]) -> Vec<u8> {
        let mut b = vec![0, flags, 0, 0, policy, priority, argv.len() as u8, envv.len() as u8];
        strings(&mut b, &[command]);
        strings(&mut b, argv);
        strings(&mut b, envv);
        record(0, &b)
    }

    pub fn waitfor(path: &str, checks: u16) -> Vec<u8> {
        let mut b = checks.to_le_bytes().to_vec();
        strings(&mut b, &[path]);
        record(1, &b)
    }

    pub fn display_msg(msg: &str) -> Vec<u8> {
        let mut b = Vec::new();
        strings(&mut b, &[msg]);
        record(3, &b)
    }

    pub fn procmgr_symlink(src: &str, dst: &str) -> Vec<u8> {
        let mut b = Vec::new();
        strings(&mut b, &[src, dst]);
        record(4, &b)
    }

    pub fn sched_aps(id: u8, budget: u8, critical: u16, name: &str) -> Vec<u8> {
        let mut b = vec![id, 0, budget, (critical >> 8) as u8, (critical & 0xff) as u8];
        strings(&mut b, &[name]);
        record(5, &b)
    }

    pub fn script(records: &[Vec<u8>]) -> Vec<u8> {
        let mut s: Vec<u8> = records.concat();
        s.extend_from_slice(&[0; 4]);
        s
    }
}

/// A small tree exercising every entry kind.
pub fn sample() -> ImageBuilder {
    sample_owned(0, 0)
}

/// The sample tree with every entry but the root owned by `uid`/`gid`.
pub fn sample_owned(uid: u32, gid: u32) -> ImageBuilder {
    ImageBuilder::new()
        .owner(uid, gid)
        .dir("proc")
        .dir("proc/boot")
        .file_with("proc/boot/procnto", 0o755, b"\x7fELF kernel image", INO_BOOTSTRAP_EXE)
        .script(script::script(&[
            script::display_msg("Welcome\n"),
            script::external(0x20, 0, 0, "/proc/boot/devc-ser8250", &["devc-ser8250", "-e"], &[]),
            script::waitfor("/dev/ser1", 50),
        ]))
        .file("proc/boot/ls", b"ls binary contents")
        .dir("etc")
        .file("etc/passwd", b"root:x:0:0:Superuser:/root:/bin/sh\n")
        .symlink("usr/lib/ldqnx.so.2", "/proc/boot/libc.so")
        .device("dev/ser1", S_IFCHR, 1, 0x0401)
}
