use std::io;
use std::path::PathBuf;

use log::warn;
use thiserror::Error;

/// Errors produced while unpacking or repacking a boot image.
///
/// Most conditions degrade to [`Warnings`] entries instead; only
/// [`Error::BadMagic`] (without force) and [`Error::LayoutCollision`]
/// abort an operation.
#[derive(Debug, Error)]
pub enum Error {
    /// The header does not start with `ANDROID!`.
    #[error("bad boot image magic {0:02x?}")]
    BadMagic([u8; 8]),
    /// The file is too small to hold even a truncated header.
    #[error("invalid boot image: file too small, got {0} bytes")]
    TooSmall(u64),
    /// Fewer bytes than requested were read.
    #[error("read {got} bytes for {name}, expected {expected}")]
    ShortRead {
        name: &'static str,
        expected: u64,
        got: u64,
    },
    /// A fixed-width header field could not be decoded.
    #[error("failed to parse header field {0}")]
    FieldParse(&'static str),
    /// A payload extends past the end of the file.
    #[error("invalid {name} offset/size: offset={offset}, size={size}, file_size={file_size}")]
    Overrun {
        name: &'static str,
        offset: u64,
        size: u64,
        file_size: u64,
    },
    /// The repack planner produced a payload offset behind the write cursor.
    #[error("layout collision: {name} target offset {target} is behind write position {position}")]
    LayoutCollision {
        name: &'static str,
        target: u64,
        position: u64,
    },
    /// A watchdog deadline expired and the phase was abandoned.
    #[error("{0} timed out")]
    TimedOut(&'static str),
    /// Renaming a temp file to its final name exhausted all retries.
    #[error("failed to rename {from} to {to} after {attempts} attempts")]
    RenameFailed {
        from: PathBuf,
        to: PathBuf,
        attempts: u32,
    },
    /// No cpio archiver is available on this system.
    #[error("archiver unavailable")]
    ArchiverUnavailable,
    /// The archiver ran but reported failure.
    #[error("archiver failed: {0}")]
    ArchiverError(String),
    /// The compression backend for this payload is not available.
    #[error("{0} codec unavailable")]
    CodecUnavailable(&'static str),
    /// The header could not be serialized.
    #[error("header codec: {0}")]
    HeaderCodec(#[from] binrw::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Warnings accumulated across an extraction or repack.
///
/// Every entry is also emitted through [`log::warn!`] at push time, so the
/// list exists for callers that want to inspect what was recovered from.
#[derive(Debug, Default)]
pub struct Warnings(Vec<String>);

impl Warnings {
    pub fn push(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        warn!("{msg}");
        self.0.push(msg);
    }
    /// Records a recoverable error.
    pub fn push_error(&mut self, err: &Error) {
        self.push(err.to_string());
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }
}
