//! Imagefs decodes the boot-time ***image f***ile ***s***ystem: an optional bootstrap ("startup")
//! header and code, followed by a packed, read-only file system with a flat directory. The API
//! locates both headers, inflates compressed payloads, walks the directory, decodes the boot
//! script and rebuilds the tree on the host.
//!
//! ## Feature Flags
//! - `zlib` (default): gzip-compressed payloads
//! - `lzo` (default): LZO1X chunked payloads
//! - `ucl` (default): UCL NRV2B chunked payloads
//!
//! A payload whose codec has been disabled is rejected with `Error::UnsupportedCompression`.
//!
//! ## Usage Example
//! ```rust,no_run
//! use std::io;
//! use imagefs::ifs::{EntryData, ImageFs};
//! fn print_files_from_image() -> imagefs::ifs::Result<()> {
//!     // Open the image, inflating it if needed
//!     let mut ifs = ImageFs::open("boot.ifs")?;
//!
//!     // Walk the directory
//!     let entries = ifs.entries().collect::<Result<Vec<_>, _>>()?;
//!     for entry in &entries {
//!         println!("{}", entry.path);
//!     }
//!
//!     // Copy the contents of every file to stdout
//!     let mut stdout = io::stdout().lock();
//!     for entry in entries.iter().filter(|e| matches!(e.data, EntryData::File { .. })) {
//!         let mut file_reader = ifs.file_reader(entry)?;
//!         io::copy(&mut file_reader, &mut stdout)?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod ifs;
