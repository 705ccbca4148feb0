/// Running the dumpifs binary over synthetic images.
use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use md5::{Digest, Md5};

#[path = "../../imagefs/tests/common/mod.rs"]
mod common;
use common::{sample, ImageBuilder};

fn dumpifs(args: &[&str], image: &Path) -> std::io::Result<Output> {
    Command::new(env!("CARGO_BIN_EXE_dumpifs")).args(args).arg(image).output()
}

fn hex_digest(data: &[u8]) -> String {
    Md5::digest(data).iter().map(|b| format!("{:02x}", b)).collect()
}

#[test]
fn test_listing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let image = dir.path().join("boot.ifs");
    fs::write(&image, sample().build().bytes)?;

    let out = dumpifs(&[], &image)?;
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8(out.stdout)?;
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines[0], "   Offset     Size  Name");
    assert!(lines.iter().any(|l| l.ends_with("  etc/passwd [file]")));
    assert!(lines.iter().any(|l| l.ends_with("  usr/lib/ldqnx.so.2 -> /proc/boot/libc.so [symlink]")));
    assert!(lines.last().map_or(false, |l| l.starts_with("Checksums: image=")));
    Ok(())
}

#[test]
fn test_md5_column() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let image = dir.path().join("boot.ifs");
    fs::write(&image, sample().build().bytes)?;

    let out = dumpifs(&["-m"], &image)?;
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8(out.stdout)?;
    let want = format!("  etc/passwd [file] {}", hex_digest(b"root:x:0:0:Superuser:/root:/bin/sh\n"));
    assert!(stdout.lines().any(|l| l.ends_with(&want)), "{}", stdout);
    // MD5 alone lists files only
    assert!(!stdout.contains("[dir]"));
    Ok(())
}

#[test]
fn test_md5_of_short_file_fails() -> anyhow::Result<()> {
    let built = ImageBuilder::new().file("big", &[7u8; 10000]).build();
    let cut = built.bytes.len() - 5000;
    let dir = tempfile::tempdir()?;
    let image = dir.path().join("short.ifs");
    fs::write(&image, &built.bytes[..cut])?;

    let out = dumpifs(&["-m"], &image)?;
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Unable to read big"), "{}", stderr);
    assert!(stderr.contains("early end reading file data"), "{}", stderr);
    // No digest of the partial data is printed
    assert!(!String::from_utf8(out.stdout)?.contains("big [file] "));
    Ok(())
}
