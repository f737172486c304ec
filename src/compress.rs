//! Ramdisk compression detection and (de)compression streams.

use std::io::{self, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};

use crate::error::{Error, Result};

pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
pub const LZ4_MAGIC: [u8; 4] = [0x04, 0x22, 0x4d, 0x18];
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
pub const CPIO_NEWC_MAGIC: &[u8; 6] = b"070701";
pub const CPIO_CRC_MAGIC: &[u8; 6] = b"070702";

/// gzip and LZ4 streams are pumped in chunks of this size.
const STREAM_CHUNK: usize = 1024 * 1024;

/// Compression applied to a ramdisk payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionKind {
    Gzip,
    Lz4,
    Zstd,
    /// Uncompressed cpio archive.
    Cpio,
    /// Not yet detected.
    Unknown,
}

impl CompressionKind {
    /// Detects the compression of a buffer from its first bytes.
    ///
    /// Anything without a known compression magic, including a bare
    /// `070701`/`070702` cpio header, is reported as raw cpio.
    pub fn detect(prefix: &[u8]) -> Self {
        if prefix.starts_with(&GZIP_MAGIC) {
            Self::Gzip
        } else if prefix.starts_with(&LZ4_MAGIC) {
            Self::Lz4
        } else if prefix.starts_with(&ZSTD_MAGIC) {
            Self::Zstd
        } else {
            Self::Cpio
        }
    }

    /// File extension used for `ramdisk.cpio.<ext>` outputs.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Gzip => "gz",
            Self::Lz4 => "lz4",
            Self::Zstd => "zst",
            Self::Cpio | Self::Unknown => "cpio",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
            Self::Cpio => "cpio",
            Self::Unknown => "unknown",
        }
    }

    /// Whether this kind needs a decompression pass before the archiver.
    pub fn is_compressed(self) -> bool {
        matches!(self, Self::Gzip | Self::Lz4 | Self::Zstd)
    }
}

/// Compression backends available to this process.
///
/// Discovered once at startup and threaded through; a cleared flag makes the
/// detector still identify the magic while decompression is skipped with a
/// [`Error::CodecUnavailable`].
#[derive(Debug, Clone, Copy)]
pub struct Codecs {
    pub gzip: bool,
    pub lz4: bool,
    pub zstd: bool,
}

impl Default for Codecs {
    fn default() -> Self {
        Self {
            gzip: true,
            lz4: true,
            zstd: true,
        }
    }
}

impl Codecs {
    pub fn supports(&self, kind: CompressionKind) -> bool {
        match kind {
            CompressionKind::Gzip => self.gzip,
            CompressionKind::Lz4 => self.lz4,
            CompressionKind::Zstd => self.zstd,
            CompressionKind::Cpio | CompressionKind::Unknown => true,
        }
    }

    fn check(&self, kind: CompressionKind) -> Result<()> {
        if self.supports(kind) {
            Ok(())
        } else {
            Err(Error::CodecUnavailable(kind.name()))
        }
    }
}

fn copy_chunked(reader: &mut impl Read, writer: &mut impl Write) -> io::Result<u64> {
    let mut buf = vec![0u8; STREAM_CHUNK];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// Decompresses `input` into `output`.
///
/// gzip and LZ4 stream in chunks; ZSTD buffers the whole compressed input.
/// `Cpio`/`Unknown` inputs are copied through unchanged.
pub fn decompress_to(
    kind: CompressionKind,
    input: &mut impl Read,
    output: &mut impl Write,
    codecs: &Codecs,
) -> Result<u64> {
    codecs.check(kind)?;
    let written = match kind {
        CompressionKind::Gzip => copy_chunked(&mut GzDecoder::new(input), output)?,
        CompressionKind::Lz4 => copy_chunked(&mut FrameDecoder::new(input), output)?,
        CompressionKind::Zstd => {
            let data = zstd::stream::decode_all(input)?;
            output.write_all(&data)?;
            data.len() as u64
        }
        CompressionKind::Cpio | CompressionKind::Unknown => copy_chunked(input, output)?,
    };
    Ok(written)
}

/// Compresses `input` into `output` with the given kind.
///
/// `Cpio`/`Unknown` pass the bytes through unchanged.
pub fn compress_to(
    kind: CompressionKind,
    input: &mut impl Read,
    output: &mut impl Write,
    codecs: &Codecs,
) -> Result<u64> {
    codecs.check(kind)?;
    match kind {
        CompressionKind::Gzip => {
            let mut encoder = GzEncoder::new(output, Compression::default());
            let n = copy_chunked(input, &mut encoder)?;
            encoder.finish()?;
            Ok(n)
        }
        CompressionKind::Lz4 => {
            let mut encoder = FrameEncoder::new(output);
            let n = copy_chunked(input, &mut encoder)?;
            encoder
                .finish()
                .map_err(|e| Error::Io(io::Error::other(e)))?;
            Ok(n)
        }
        CompressionKind::Zstd => {
            let mut data = Vec::new();
            input.read_to_end(&mut data)?;
            let compressed = zstd::stream::encode_all(&data[..], 0)?;
            output.write_all(&compressed)?;
            Ok(data.len() as u64)
        }
        CompressionKind::Cpio | CompressionKind::Unknown => Ok(copy_chunked(input, output)?),
    }
}
