//! Heuristic signature scanning for images whose header metadata is
//! missing or unreliable.
//!
//! Each scan walks a bounded window of the file in 16 KiB chunks with a
//! 512-byte overlap, so a magic crossing a chunk boundary is still found.
//! A wall-clock deadline is checked at chunk boundaries; expiry abandons
//! the scan and reports "not found" instead of failing the extraction.

use std::io::{Read, Seek, SeekFrom};
use std::time::{Duration, Instant};

use log::debug;

use crate::compress::{
    CompressionKind, CPIO_CRC_MAGIC, CPIO_NEWC_MAGIC, GZIP_MAGIC, LZ4_MAGIC, ZSTD_MAGIC,
};
use crate::error::{Result, Warnings};
use crate::header::BOOT_MAGIC;

pub const SCAN_CHUNK_SIZE: usize = 16 * 1024;
pub const SCAN_OVERLAP: usize = 512;
/// Default wall-clock budget for a single scan.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(30);

/// Wall-clock watchdog for a long-running phase.
///
/// Checked cooperatively at chunk and I/O boundaries; there is no worker
/// thread to leak.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self(Instant::now() + budget)
    }
    pub fn expired(&self) -> bool {
        Instant::now() >= self.0
    }
}

/// Reads consecutive overlapping chunks of a bounded window of the file.
struct ChunkReader<'a, R> {
    reader: &'a mut R,
    pos: u64,
    end: u64,
    buf: Vec<u8>,
}

impl<'a, R: Read + Seek> ChunkReader<'a, R> {
    fn new(reader: &'a mut R, start: u64, end: u64) -> Self {
        Self {
            reader,
            pos: start,
            end,
            buf: vec![0; SCAN_CHUNK_SIZE],
        }
    }

    /// Returns the next chunk and its file offset, or `None` at the window
    /// end. Consecutive chunks share [`SCAN_OVERLAP`] bytes.
    fn next_chunk(&mut self) -> Result<Option<(u64, &[u8])>> {
        if self.pos >= self.end {
            return Ok(None);
        }
        let want = SCAN_CHUNK_SIZE.min((self.end - self.pos) as usize);
        self.reader.seek(SeekFrom::Start(self.pos))?;
        let mut filled = 0;
        while filled < want {
            let n = self.reader.read(&mut self.buf[filled..want])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        let offset = self.pos;
        if filled <= SCAN_OVERLAP {
            // Nothing new would be covered by another pass.
            self.pos = self.end;
        } else {
            self.pos = offset + (filled - SCAN_OVERLAP) as u64;
        }
        Ok(Some((offset, &self.buf[..filled])))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Device-tree magic found by [`scan_for_dtb`], in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtbMagic {
    /// Flattened device tree, `D0 0D FE ED`; carries a big-endian totalsize.
    Fdt,
    Dtb,
    Dhtb,
}

impl DtbMagic {
    pub fn bytes(self) -> &'static [u8] {
        match self {
            Self::Fdt => &[0xd0, 0x0d, 0xfe, 0xed],
            Self::Dtb => b"DTB",
            Self::Dhtb => b"DHTB",
        }
    }
}

/// A located device tree blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtbHit {
    pub offset: u64,
    pub size: u64,
    pub magic: DtbMagic,
}

/// `DTB`/`DHTB` containers carry no size field; report this much.
const BARE_DTB_SIZE: u64 = 1024;
const MAX_FDT_SIZE: u64 = 1024 * 1024;

/// Scans `[start, file_size)` for a device tree signature.
pub fn scan_for_dtb(
    reader: &mut (impl Read + Seek),
    start: u64,
    file_size: u64,
    deadline: Deadline,
    warnings: &mut Warnings,
) -> Result<Option<DtbHit>> {
    debug!("scanning for DTB/DTBO from offset {start}");
    let mut chunks = ChunkReader::new(reader, start, file_size);
    loop {
        if deadline.expired() {
            warnings.push("DTB scan timed out");
            return Ok(None);
        }
        let Some((chunk_offset, chunk)) = chunks.next_chunk()? else {
            return Ok(None);
        };
        let chunk = chunk.to_vec();
        for magic in [DtbMagic::Fdt, DtbMagic::Dtb, DtbMagic::Dhtb] {
            let Some(pos) = find(&chunk, magic.bytes()) else {
                continue;
            };
            let dtb_start = chunk_offset + pos as u64;
            if dtb_start + 8 > file_size {
                warnings.push(format!(
                    "DTB at {dtb_start} exceeds file size {file_size}"
                ));
                continue;
            }
            match magic {
                DtbMagic::Fdt => {
                    // totalsize is big-endian, unlike every header field.
                    let mut header = [0u8; 8];
                    chunks.reader.seek(SeekFrom::Start(dtb_start))?;
                    chunks.reader.read_exact(&mut header)?;
                    let totalsize =
                        u64::from(u32::from_be_bytes([header[4], header[5], header[6], header[7]]));
                    let max = MAX_FDT_SIZE.min(file_size - dtb_start);
                    if !(BARE_DTB_SIZE..=max).contains(&totalsize) {
                        warnings.push(format!("invalid DTB size {totalsize} at {dtb_start}"));
                        continue;
                    }
                    return Ok(Some(DtbHit {
                        offset: dtb_start,
                        size: totalsize,
                        magic,
                    }));
                }
                DtbMagic::Dtb | DtbMagic::Dhtb => {
                    return Ok(Some(DtbHit {
                        offset: dtb_start,
                        size: BARE_DTB_SIZE,
                        magic,
                    }));
                }
            }
        }
    }
}

/// A located AVB metadata block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvbHit {
    pub offset: u64,
    pub size: u64,
}

const AVB_MAGIC: &[u8] = b"AVB0";
const MIN_AVB_SIZE: u64 = 64;

/// Scans `[start, file_size)` for an `AVB0` block with a plausible size.
pub fn scan_for_avb(
    reader: &mut (impl Read + Seek),
    start: u64,
    file_size: u64,
    deadline: Deadline,
    warnings: &mut Warnings,
) -> Result<Option<AvbHit>> {
    debug!("scanning for AVB from offset {start}");
    let mut chunks = ChunkReader::new(reader, start, file_size);
    loop {
        if deadline.expired() {
            warnings.push("AVB scan timed out");
            return Ok(None);
        }
        let Some((chunk_offset, chunk)) = chunks.next_chunk()? else {
            return Ok(None);
        };
        let chunk = chunk.to_vec();
        let Some(pos) = find(&chunk, AVB_MAGIC) else {
            continue;
        };
        let avb_start = chunk_offset + pos as u64;
        if avb_start + 12 > file_size {
            continue;
        }
        let mut size_buf = [0u8; 8];
        chunks.reader.seek(SeekFrom::Start(avb_start + 4))?;
        chunks.reader.read_exact(&mut size_buf)?;
        let avb_size = u64::from_le_bytes(size_buf);
        if (MIN_AVB_SIZE..=file_size - avb_start).contains(&avb_size) {
            return Ok(Some(AvbHit {
                offset: avb_start,
                size: avb_size,
            }));
        }
    }
}

/// A located ramdisk payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RamdiskHit {
    pub offset: u64,
    pub size: u64,
    pub compression: CompressionKind,
}

const MIN_RAMDISK_SIZE: u64 = 1024;

const RAMDISK_MAGICS: [(&[u8], CompressionKind); 5] = [
    (&GZIP_MAGIC, CompressionKind::Gzip),
    (&LZ4_MAGIC, CompressionKind::Lz4),
    (&ZSTD_MAGIC, CompressionKind::Zstd),
    (CPIO_NEWC_MAGIC, CompressionKind::Cpio),
    (CPIO_CRC_MAGIC, CompressionKind::Cpio),
];

/// Scans `[start, file_size)` for a compressed or raw-cpio ramdisk.
///
/// The ramdisk's extent is taken to run up to the next ramdisk magic or
/// embedded `ANDROID!` header, or to end of file.
pub fn scan_for_ramdisk(
    reader: &mut (impl Read + Seek),
    start: u64,
    file_size: u64,
    deadline: Deadline,
    warnings: &mut Warnings,
) -> Result<Option<RamdiskHit>> {
    debug!("scanning for ramdisk from offset {start}");
    let mut chunks = ChunkReader::new(reader, start, file_size);
    loop {
        if deadline.expired() {
            warnings.push("ramdisk scan timed out");
            return Ok(None);
        }
        let Some((chunk_offset, chunk)) = chunks.next_chunk()? else {
            return Ok(None);
        };
        let chunk = chunk.to_vec();
        for (magic, compression) in RAMDISK_MAGICS {
            let Some(pos) = find(&chunk, magic) else {
                continue;
            };
            let ramdisk_start = chunk_offset + pos as u64;
            if ramdisk_start + 8 > file_size {
                warnings.push(format!(
                    "ramdisk at {ramdisk_start} exceeds file size {file_size}"
                ));
                continue;
            }
            // Bound the payload by the next signature after this one.
            chunks.reader.seek(SeekFrom::Start(ramdisk_start))?;
            let mut remaining = Vec::with_capacity((file_size - ramdisk_start) as usize);
            chunks
                .reader
                .by_ref()
                .take(file_size - ramdisk_start)
                .read_to_end(&mut remaining)?;
            let mut next_magic = file_size;
            for next_sig in RAMDISK_MAGICS
                .iter()
                .map(|(sig, _)| *sig)
                .chain(std::iter::once(BOOT_MAGIC))
            {
                if let Some(p) = find(&remaining[1..], next_sig) {
                    next_magic = next_magic.min(ramdisk_start + 1 + p as u64);
                }
            }
            let ramdisk_size = next_magic - ramdisk_start;
            if ramdisk_size < MIN_RAMDISK_SIZE {
                warnings.push(format!(
                    "invalid ramdisk size {ramdisk_size} at {ramdisk_start}"
                ));
                continue;
            }
            return Ok(Some(RamdiskHit {
                offset: ramdisk_start,
                size: ramdisk_size,
                compression,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn expired() -> Deadline {
        Deadline(Instant::now() - Duration::from_secs(1))
    }

    fn fresh() -> Deadline {
        Deadline::after(SCAN_TIMEOUT)
    }

    #[test]
    fn finds_fdt_with_valid_totalsize() {
        let mut image = vec![0u8; 8192];
        image[5000..5004].copy_from_slice(&[0xd0, 0x0d, 0xfe, 0xed]);
        image[5004..5008].copy_from_slice(&2048u32.to_be_bytes());
        let mut warnings = Warnings::default();
        let hit = scan_for_dtb(
            &mut Cursor::new(&image),
            4096,
            image.len() as u64,
            fresh(),
            &mut warnings,
        )
        .unwrap()
        .unwrap();
        assert_eq!(hit.offset, 5000);
        assert_eq!(hit.size, 2048);
        assert_eq!(hit.magic, DtbMagic::Fdt);
        // Scanner soundness: the reported prefix really is the magic.
        assert_eq!(&image[hit.offset as usize..][..4], hit.magic.bytes());
        assert!(hit.offset + hit.size <= image.len() as u64);
    }

    #[test]
    fn rejects_fdt_with_absurd_totalsize() {
        let mut image = vec![0u8; 8192];
        image[5000..5004].copy_from_slice(&[0xd0, 0x0d, 0xfe, 0xed]);
        image[5004..5008].copy_from_slice(&(8 * 1024 * 1024u32).to_be_bytes());
        let mut warnings = Warnings::default();
        let hit = scan_for_dtb(
            &mut Cursor::new(&image),
            4096,
            image.len() as u64,
            fresh(),
            &mut warnings,
        )
        .unwrap();
        assert!(hit.is_none());
        assert!(!warnings.is_empty());
    }

    #[test]
    fn ramdisk_bounded_by_next_android_magic() {
        let mut image = vec![0u8; 16384];
        image[4096] = 0x1f;
        image[4097] = 0x8b;
        image[8192..8200].copy_from_slice(b"ANDROID!");
        let mut warnings = Warnings::default();
        let hit = scan_for_ramdisk(
            &mut Cursor::new(&image),
            4096,
            image.len() as u64,
            fresh(),
            &mut warnings,
        )
        .unwrap()
        .unwrap();
        assert_eq!(hit.offset, 4096);
        assert_eq!(hit.size, 4096);
        assert_eq!(hit.compression, CompressionKind::Gzip);
    }

    #[test]
    fn ramdisk_runs_to_eof_without_boundary() {
        let mut image = vec![0u8; 8192];
        image[4096..4100].copy_from_slice(&ZSTD_MAGIC);
        let mut warnings = Warnings::default();
        let hit = scan_for_ramdisk(
            &mut Cursor::new(&image),
            4096,
            image.len() as u64,
            fresh(),
            &mut warnings,
        )
        .unwrap()
        .unwrap();
        assert_eq!(hit.size, 4096);
        assert_eq!(hit.compression, CompressionKind::Zstd);
    }

    #[test]
    fn avb_needs_plausible_size() {
        let mut image = vec![0u8; 8192];
        image[5000..5004].copy_from_slice(b"AVB0");
        image[5004..5012].copy_from_slice(&512u64.to_le_bytes());
        let mut warnings = Warnings::default();
        let hit = scan_for_avb(
            &mut Cursor::new(&image),
            4096,
            image.len() as u64,
            fresh(),
            &mut warnings,
        )
        .unwrap()
        .unwrap();
        assert_eq!(hit.offset, 5000);
        assert_eq!(hit.size, 512);
    }

    #[test]
    fn expired_deadline_reports_not_found() {
        let mut image = vec![0u8; 8192];
        image[4096] = 0x1f;
        image[4097] = 0x8b;
        let mut warnings = Warnings::default();
        let hit = scan_for_ramdisk(
            &mut Cursor::new(&image),
            4096,
            image.len() as u64,
            expired(),
            &mut warnings,
        )
        .unwrap();
        assert!(hit.is_none());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn magic_crossing_chunk_boundary_is_found() {
        let mut image = vec![0u8; SCAN_CHUNK_SIZE + 4096 + 1024];
        let boundary = 4096 + SCAN_CHUNK_SIZE - 2;
        image[boundary..boundary + 4].copy_from_slice(&[0xd0, 0x0d, 0xfe, 0xed]);
        image[boundary + 4..boundary + 8].copy_from_slice(&1024u32.to_be_bytes());
        let mut warnings = Warnings::default();
        let hit = scan_for_dtb(
            &mut Cursor::new(&image),
            4096,
            image.len() as u64,
            fresh(),
            &mut warnings,
        )
        .unwrap()
        .unwrap();
        assert_eq!(hit.offset, boundary as u64);
    }
}
