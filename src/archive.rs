//! External cpio archiver.
//!
//! Ramdisk content packing is an external collaborator: the codec hands an
//! [`Archiver`] the compressed-then-decompressed archive bytes and keeps
//! going without one, leaving the ramdisk file in place.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::debug;

use crate::error::{Error, Result};

/// cpio pack/unpack as an opaque service.
pub trait Archiver {
    /// Extracts `archive` into `out_dir`, creating the directory if needed.
    fn unpack(&self, archive: &Path, out_dir: &Path) -> Result<()>;
    /// Packs the contents of `in_dir` into a newc cpio archive at `out_path`.
    fn pack(&self, in_dir: &Path, out_path: &Path) -> Result<()>;
}

/// Archiver backed by a `cpio` binary found on `PATH`.
pub struct CpioCommand {
    program: PathBuf,
}

impl CpioCommand {
    /// Probes for a working `cpio`; `None` when it is missing.
    pub fn discover() -> Option<Self> {
        let probe = Command::new("cpio")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match probe {
            Ok(status) if status.success() => Some(Self {
                program: PathBuf::from("cpio"),
            }),
            _ => None,
        }
    }

    fn map_spawn_err(err: std::io::Error) -> Error {
        if err.kind() == ErrorKind::NotFound {
            Error::ArchiverUnavailable
        } else {
            Error::Io(err)
        }
    }
}

/// Relative paths of every entry below `dir`, directories first.
pub(crate) fn walk_relative(dir: &Path) -> Result<Vec<PathBuf>> {
    fn visit(root: &Path, dir: &Path, entries: &mut Vec<PathBuf>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if let Ok(rel) = path.strip_prefix(root) {
                entries.push(rel.to_path_buf());
            }
            if path.is_dir() {
                visit(root, &path, entries)?;
            }
        }
        Ok(())
    }
    let mut entries = Vec::new();
    visit(dir, dir, &mut entries)?;
    Ok(entries)
}

impl Archiver for CpioCommand {
    fn unpack(&self, archive: &Path, out_dir: &Path) -> Result<()> {
        debug!("unpacking {} into {}", archive.display(), out_dir.display());
        fs::create_dir_all(out_dir)?;
        let output = Command::new(&self.program)
            .args(["-idu", "--quiet"])
            .current_dir(out_dir)
            .stdin(Stdio::from(File::open(archive)?))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(Self::map_spawn_err)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::ArchiverError(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    fn pack(&self, in_dir: &Path, out_path: &Path) -> Result<()> {
        debug!("packing {} into {}", in_dir.display(), out_path.display());
        let mut file_list = Vec::new();
        for rel in walk_relative(in_dir)? {
            file_list.extend_from_slice(rel.as_os_str().as_encoded_bytes());
            file_list.push(b'\n');
        }

        let mut child = Command::new(&self.program)
            .args(["-o", "-H", "newc", "--quiet"])
            .current_dir(in_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(File::create(out_path)?))
            .stderr(Stdio::piped())
            .spawn()
            .map_err(Self::map_spawn_err)?;
        if let Some(stdin) = child.stdin.take() {
            let mut stdin = stdin;
            stdin.write_all(&file_list)?;
        }
        let output = child.wait_with_output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::ArchiverError(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_lists_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a"), b"a").unwrap();
        fs::write(dir.path().join("sub/b"), b"b").unwrap();
        let mut entries = walk_relative(dir.path()).unwrap();
        entries.sort();
        assert_eq!(
            entries,
            vec![
                PathBuf::from("a"),
                PathBuf::from("sub"),
                PathBuf::from("sub/b")
            ]
        );
    }

    // Exercised only where a cpio binary exists; discovery itself is the
    // contract under test elsewhere.
    #[test]
    fn pack_unpack_round_trip() {
        let Some(archiver) = CpioCommand::discover() else {
            return;
        };
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("init"), b"#!/bin/sh\n").unwrap();
        fs::create_dir(src.path().join("etc")).unwrap();
        fs::write(src.path().join("etc/fstab"), b"none\n").unwrap();

        let work = tempfile::tempdir().unwrap();
        let archive = work.path().join("ramdisk.cpio");
        archiver.pack(src.path(), &archive).unwrap();
        assert!(archive.metadata().unwrap().len() > 0);

        let out = work.path().join("unpacked");
        archiver.unpack(&archive, &out).unwrap();
        assert_eq!(fs::read(out.join("init")).unwrap(), b"#!/bin/sh\n");
        assert_eq!(fs::read(out.join("etc/fstab")).unwrap(), b"none\n");
    }
}
