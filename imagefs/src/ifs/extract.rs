use std::ffi::CString;
use std::fs::{self, File, FileTimes, Permissions};
use std::io::{self, Read, Seek, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{chown, fchown, lchown, symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use super::dirent::{basename, Attr, DirEntry, EntryData, EntryKind, InodeFlags};
use super::error::{EntryError, Error, Result};
use super::image::ImageFs;
use super::manifest::Manifest;
use super::script;
use super::stream::{copy_exact, CopyError};

/// Basenames picked out on the command line. An empty selection accepts everything.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    names: Vec<String>,
}

impl Selection {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Selection { names: names.into_iter().map(Into::into).collect() }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn accepts(&self, path: &str) -> bool {
        self.names.is_empty() || self.names.iter().any(|n| n == basename(path))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    pub dest: PathBuf,
    /// Drop directory components from every extracted name
    pub basename_only: bool,
    /// Append `_i<ino>` to names, except for bootstrap executables
    pub inode_suffix: bool,
    /// Only these names are extracted; each is taken once
    pub requested: Vec<String>,
    pub selection: Selection,
    /// Write the raw-mode artifacts and build description into `dest`
    pub raw: bool,
    /// Extract only the script inode. Used by raw mode without full extraction.
    pub script_only: bool,
}

/// Outcome of an extraction that ran to completion.
#[derive(Debug, Default)]
pub struct ExtractReport {
    pub extracted: Vec<PathBuf>,
    pub problems: Vec<EntryError>,
    /// Requested names that were never found
    pub unmatched: Vec<String>,
}

/// Rebuilds the image's tree under a destination directory, one directory record at a time.
pub struct Extractor {
    opts: ExtractOptions,
    pending: Vec<String>,
    dirs: Vec<(PathBuf, Attr)>,
    manifest: Option<Manifest>,
    report: ExtractReport,
}

impl Extractor {
    /// Prepare the destination. In raw mode this also writes the region artifacts.
    pub fn new<R>(ifs: &mut ImageFs<R>, opts: ExtractOptions) -> Result<Self>
    where R: Read + Seek
    {
        fs::create_dir_all(&opts.dest)?;
        let manifest = if opts.raw { Some(Manifest::create(&opts.dest, ifs)?) } else { None };
        Ok(Extractor {
            pending: opts.requested.clone(),
            opts,
            dirs: Vec::new(),
            manifest,
            report: ExtractReport::default(),
        })
    }

    /// The name an entry is written under, relative to the destination.
    pub fn resolve_name(&self, entry: &DirEntry) -> String {
        let mut name = entry.path.clone();
        if self.opts.inode_suffix && !entry.attr.inode_flags().contains(InodeFlags::BOOTSTRAP_EXE) {
            name = format!("{}_i{}", name, entry.attr.ino);
        }
        if self.opts.basename_only {
            name = basename(&name).to_string();
        }
        name
    }

    /// True once every requested name has been extracted.
    pub fn is_done(&self) -> bool {
        !self.opts.requested.is_empty() && self.pending.is_empty()
    }

    // Take the request that `name` satisfies. With no requests everything is wanted.
    fn claim(&mut self, name: &str) -> bool {
        if self.opts.requested.is_empty() {
            return true;
        }
        match self.pending.iter().position(|p| p == name || p == basename(name)) {
            Some(i) => {
                self.pending.swap_remove(i);
                true
            }
            None => false,
        }
    }

    fn target(&self, name: &str) -> std::result::Result<PathBuf, EntryError> {
        let rel = Path::new(name);
        if rel.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
            return Err(EntryError::UnsafePath(name.to_string()));
        }
        Ok(self.opts.dest.join(rel))
    }

    fn problem(&mut self, e: EntryError) {
        warn!("{}", e);
        self.report.problems.push(e);
    }

    /// Extract one entry. Per-entry problems are collected in the report; only failures of the
    /// image itself are returned.
    pub fn extract_entry<R>(&mut self, ifs: &mut ImageFs<R>, entry: &DirEntry) -> Result<()>
    where R: Read + Seek
    {
        let is_script = ifs.is_script(entry);
        let name = self.resolve_name(entry);
        // The build description covers the whole image, selected or not
        if let Some(m) = &mut self.manifest {
            m.record(entry, is_script, &name)?;
        }

        if !self.opts.selection.accepts(&entry.path) || entry.is_root() || (self.opts.script_only && !is_script) || !self.claim(&name) {
            return Ok(());
        }
        let path = match self.target(&name) {
            Ok(p) => p,
            Err(e) => {
                self.problem(e);
                return Ok(());
            }
        };

        match &entry.data {
            EntryData::Dir => {
                if !self.opts.basename_only {
                    self.make_dir(path, &entry.attr);
                }
                Ok(())
            }
            EntryData::File { .. } => self.write_file(ifs, entry, path, is_script),
            EntryData::Symlink { target } => {
                self.make_symlink(path, target, &entry.attr);
                Ok(())
            }
            EntryData::Device { rdev, .. } => {
                self.make_node(path, entry.kind, *rdev, &entry.attr);
                Ok(())
            }
        }
    }

    /// Walk the whole directory, stopping early once every requested name has been found.
    pub fn extract_all<R>(&mut self, ifs: &mut ImageFs<R>) -> Result<()>
    where R: Read + Seek
    {
        let mut walker = ifs.walker();
        while !self.is_done() {
            match ifs.next_entry(&mut walker)? {
                Some(entry) => self.extract_entry(ifs, &entry)?,
                None => break,
            }
        }
        Ok(())
    }

    /// Apply the deferred directory metadata and close the build description.
    pub fn finish(mut self) -> Result<ExtractReport> {
        let dirs = std::mem::take(&mut self.dirs);
        for (path, attr) in dirs.into_iter().rev() {
            let restored = File::open(&path)
                .map_err(|e| RestoreError("metadata", e))
                .and_then(|f| restore(&f, &attr));
            if let Err(e) = restored {
                self.problem(e.at(&path));
            }
        }
        if let Some(m) = self.manifest.take() {
            m.finish()?;
        }
        self.report.unmatched = std::mem::take(&mut self.pending);
        for name in &self.report.unmatched {
            warn!(name = %name, "requested file not found");
        }
        info!(extracted = self.report.extracted.len(), problems = self.report.problems.len(), "extraction finished");
        Ok(self.report)
    }

    fn ensure_parent(&mut self, path: &Path) -> bool {
        match path.parent() {
            Some(parent) => match fs::create_dir_all(parent) {
                Ok(()) => true,
                Err(source) => {
                    self.problem(EntryError::Create { path: parent.to_path_buf(), source });
                    false
                }
            },
            None => true,
        }
    }

    fn make_dir(&mut self, path: PathBuf, attr: &Attr) {
        if let Err(source) = fs::create_dir_all(&path) {
            self.problem(EntryError::Create { path, source });
            return;
        }
        debug!(path = %path.display(), "dir");
        self.dirs.push((path.clone(), *attr));
        self.report.extracted.push(path);
    }

    fn write_file<R>(&mut self, ifs: &mut ImageFs<R>, entry: &DirEntry, path: PathBuf, is_script: bool) -> Result<()>
    where R: Read + Seek
    {
        // Read the script before anything is created, so a short image leaves nothing behind
        let rendered = if is_script && self.opts.raw {
            Some(script::render(&ifs.decode_script(entry)?))
        } else {
            None
        };
        if !self.ensure_parent(&path) {
            return Ok(());
        }
        let mut f = match File::create(&path) {
            Ok(f) => f,
            Err(source) => {
                self.problem(EntryError::Create { path, source });
                return Ok(());
            }
        };

        if let Some(text) = rendered {
            if let Err(source) = f.write_all(text.as_bytes()) {
                drop(f);
                let _ = fs::remove_file(&path);
                self.problem(EntryError::Write { path, source });
                return Ok(());
            }
        } else {
            let size = entry.file_extent().map_or(0, |(_, s)| s as u64);
            let copied = match f.set_len(size) {
                Ok(()) => copy_exact(&mut ifs.file_reader(entry)?, &mut f, size),
                Err(e) => Err(CopyError::Destination(e)),
            };
            match copied {
                Ok(_) => {}
                Err(CopyError::Destination(source)) => {
                    drop(f);
                    let _ = fs::remove_file(&path);
                    self.problem(EntryError::Write { path, source });
                    return Ok(());
                }
                Err(CopyError::Source(e)) => {
                    drop(f);
                    let _ = fs::remove_file(&path);
                    return Err(Error::eof_as("file data")(e));
                }
            }
        }

        if let Err(e) = restore(&f, &entry.attr) {
            self.problem(e.at(&path));
        }
        info!(path = %path.display(), "extracted");
        self.report.extracted.push(path);
        Ok(())
    }

    fn make_symlink(&mut self, path: PathBuf, target: &str, attr: &Attr) {
        if !self.ensure_parent(&path) {
            return;
        }
        let mut made = symlink(target, &path);
        if matches!(&made, Err(e) if e.kind() == io::ErrorKind::AlreadyExists) {
            made = fs::remove_file(&path).and_then(|_| symlink(target, &path));
        }
        if let Err(source) = made {
            self.problem(EntryError::Create { path, source });
            return;
        }
        if let Some(source) = lchown(&path, Some(attr.uid), Some(attr.gid)).err().and_then(owner_failure) {
            self.problem(EntryError::Restore { what: "owner", path: path.clone(), source });
        }
        debug!(path = %path.display(), target, "symlink");
        self.report.extracted.push(path);
    }

    fn make_node(&mut self, path: PathBuf, kind: EntryKind, rdev: u32, attr: &Attr) {
        let node_type = match kind {
            EntryKind::CharDevice => libc::S_IFCHR,
            EntryKind::BlockDevice => libc::S_IFBLK,
            EntryKind::Fifo => libc::S_IFIFO,
            _ => {
                self.problem(EntryError::Unsupported { path, reason: "named special files have no host equivalent" });
                return;
            }
        };
        if !self.ensure_parent(&path) {
            return;
        }
        let cpath = match CString::new(path.as_os_str().as_bytes()) {
            Ok(c) => c,
            Err(_) => {
                self.problem(EntryError::Unsupported { path, reason: "name contains a NUL byte" });
                return;
            }
        };
        let perms = (attr.mode & 0o7777) as libc::mode_t;
        // SAFETY: cpath is a valid NUL-terminated string for the duration of the call
        let rc = unsafe {
            if node_type == libc::S_IFIFO {
                libc::mkfifo(cpath.as_ptr(), perms)
            } else {
                libc::mknod(cpath.as_ptr(), node_type | perms, rdev as libc::dev_t)
            }
        };
        if rc != 0 {
            self.problem(EntryError::Create { path, source: io::Error::last_os_error() });
            return;
        }
        let restored = fs::set_permissions(&path, Permissions::from_mode(attr.mode & 0o7777))
            .map_err(|e| RestoreError("mode", e))
            .and_then(|_| match chown(&path, Some(attr.uid), Some(attr.gid)) {
                Err(e) => owner_failure(e).map_or(Ok(()), |e| Err(RestoreError("owner", e))),
                Ok(()) => Ok(()),
            });
        if let Err(e) = restored {
            self.problem(e.at(&path));
        }
        debug!(path = %path.display(), rdev, "node");
        self.report.extracted.push(path);
    }
}

// A metadata step that failed, before the path is attached.
struct RestoreError(&'static str, io::Error);

impl RestoreError {
    fn at(self, path: &Path) -> EntryError {
        EntryError::Restore { what: self.0, path: path.to_path_buf(), source: self.1 }
    }
}

fn mtime(attr: &Attr) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(attr.mtime as u64)
}

// Changing ownership is expected to fail for unprivileged users; that alone is not reported.
fn owner_failure(e: io::Error) -> Option<io::Error> {
    if e.kind() == io::ErrorKind::PermissionDenied {
        debug!("ownership not restored: {}", e);
        None
    } else {
        Some(e)
    }
}

// Mode, then owner, then times (access time set to the modification time).
fn restore(f: &File, attr: &Attr) -> std::result::Result<(), RestoreError> {
    f.set_permissions(Permissions::from_mode(attr.mode & 0o7777))
        .map_err(|e| RestoreError("mode", e))?;
    if let Err(e) = fchown(f, Some(attr.uid), Some(attr.gid)) {
        if let Some(e) = owner_failure(e) {
            return Err(RestoreError("owner", e));
        }
    }
    let t = mtime(attr);
    f.set_times(FileTimes::new().set_accessed(t).set_modified(t))
        .map_err(|e| RestoreError("mtime", e))
}
