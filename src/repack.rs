//! Boot image repacking.
//!
//! A fresh image is assembled from the files in a components directory:
//! sizes are recomputed from the files, offsets planned, the header encoded
//! into its own page, and every payload written behind a zero-fill gap up
//! to its page-aligned offset. The writer verifies each gap is
//! non-negative; a negative gap means the planner went wrong and aborts
//! the repack.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};

use crate::archive::Archiver;
use crate::compress::{compress_to, Codecs, CompressionKind};
use crate::error::{Error, Result, Warnings};
use crate::header::RawHeader;
use crate::layout::{Layout, PayloadSizes, DEFAULT_PAGE_SIZE, VALID_PAGE_SIZES};
use crate::scan::Deadline;
use crate::BootImage;

/// Wall-clock budget for one repack.
pub const REPACK_TIMEOUT: Duration = Duration::from_secs(300);

/// Component file names tried for the ramdisk slot.
const RAMDISK_CANDIDATES: [&str; 4] = [
    "ramdisk.cpio.gz",
    "ramdisk.cpio.lz4",
    "ramdisk.cpio.zst",
    "ramdisk.cpio.cpio",
];

const VENDOR_RAMDISK_CANDIDATES: [&str; 4] = [
    "vendor_ramdisk.cpio.gz",
    "vendor_ramdisk.cpio.lz4",
    "vendor_ramdisk.cpio.zst",
    "vendor_ramdisk.cpio.cpio",
];

fn read_component(path: &Path) -> Result<Option<Vec<u8>>> {
    if path.exists() {
        Ok(Some(fs::read(path)?))
    } else {
        Ok(None)
    }
}

fn read_first(dir: &Path, candidates: &[&str]) -> Result<Option<Vec<u8>>> {
    for name in candidates {
        if let Some(data) = read_component(&dir.join(name))? {
            return Ok(Some(data));
        }
    }
    Ok(None)
}

fn size32(name: &'static str, len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::FieldParse(name))
}

/// Rebuilds a ramdisk archive from a directory tree and compresses it with
/// the given kind.
///
/// An unavailable codec degrades to emitting the raw cpio, with a warning.
pub fn repack_ramdisk(
    archiver: &dyn Archiver,
    codecs: &Codecs,
    ramdisk_dir: &Path,
    output: &Path,
    kind: CompressionKind,
    warnings: &mut Warnings,
) -> Result<()> {
    debug!("repacking ramdisk to {}", output.display());
    let mut temp_name = output.as_os_str().to_owned();
    temp_name.push(".temp");
    let temp_cpio = PathBuf::from(temp_name);

    let result = (|| -> Result<()> {
        archiver.pack(ramdisk_dir, &temp_cpio)?;
        if kind.is_compressed() && !codecs.supports(kind) {
            warnings.push_error(&Error::CodecUnavailable(kind.name()));
            warnings.push(format!(
                "compression {} not available, saving as raw",
                kind.name()
            ));
            fs::copy(&temp_cpio, output)?;
            return Ok(());
        }
        let mut input = File::open(&temp_cpio)?;
        let mut out = File::create(output)?;
        compress_to(kind, &mut input, &mut out, codecs)?;
        out.sync_all()?;
        Ok(())
    })();

    let _ = fs::remove_file(&temp_cpio);
    result
}

/// Assembles `new-boot.img` style output from the component files in
/// `components_dir`, using `image` for addresses and byte fields.
pub fn repack_boot_image(
    image: &BootImage,
    components_dir: &Path,
    output: &Path,
) -> Result<()> {
    let deadline = Deadline::after(REPACK_TIMEOUT);
    let page_size = if VALID_PAGE_SIZES.contains(&image.page_size) {
        image.page_size
    } else {
        warn!(
            "invalid page_size {}, assuming {}",
            image.page_size, DEFAULT_PAGE_SIZE
        );
        DEFAULT_PAGE_SIZE
    };

    let kernel = read_component(&components_dir.join("kernel"))?;
    let ramdisk = read_first(components_dir, &RAMDISK_CANDIDATES)?;
    let second = read_component(&components_dir.join("second"))?;
    let dtb = read_component(&components_dir.join("dtb"))?;
    let recovery_dtbo = read_component(&components_dir.join("recovery_dtbo"))?;
    let vendor_ramdisk = read_first(components_dir, &VENDOR_RAMDISK_CANDIDATES)?;

    let len = |c: &Option<Vec<u8>>| c.as_ref().map_or(0, |d| d.len() as u64);
    let sizes = PayloadSizes {
        kernel: len(&kernel),
        ramdisk: len(&ramdisk),
        second: len(&second),
        dtb: len(&dtb),
        recovery_dtbo: len(&recovery_dtbo),
        vendor_ramdisk: len(&vendor_ramdisk),
    };
    let layout = Layout::plan(page_size, &sizes);

    let header = RawHeader {
        magic: *b"ANDROID!",
        kernel_size: size32("kernel_size", sizes.kernel as usize)?,
        kernel_addr: image.kernel_addr,
        ramdisk_size: size32("ramdisk_size", sizes.ramdisk as usize)?,
        ramdisk_addr: image.ramdisk_addr,
        second_size: size32("second_size", sizes.second as usize)?,
        second_addr: image.second_addr,
        tags_addr: image.tags_addr,
        page_size,
        header_version: image.version,
        extra_field: if image.version <= 2 {
            size32("dtb_size", sizes.dtb as usize)?
        } else {
            0
        },
        os_version: image.os_version,
        cmdline: image.cmdline.clone(),
        id: image.id,
        extra_cmdline: image.extra_cmdline.clone(),
        board_name: image.board_name,
    };
    let header_page = header.encode_page(page_size)?;

    // Temp-and-rename so an abandoned repack never leaves a partial image.
    let mut temp_name = output.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp = PathBuf::from(temp_name);

    let result = (|| -> Result<()> {
        let mut writer = BufWriter::new(File::create(&temp)?);
        writer.write_all(&header_page)?;
        let mut position = u64::from(page_size);

        let payloads = [
            ("kernel", layout.kernel, &kernel),
            ("ramdisk", layout.ramdisk, &ramdisk),
            ("second", layout.second, &second),
            ("dtb", layout.dtb, &dtb),
            ("recovery_dtbo", layout.recovery_dtbo, &recovery_dtbo),
            ("vendor_ramdisk", layout.vendor_ramdisk, &vendor_ramdisk),
        ];
        for (name, target, data) in payloads {
            let Some(data) = data else { continue };
            if data.is_empty() {
                continue;
            }
            if deadline.expired() {
                return Err(Error::TimedOut("boot image repack"));
            }
            if target < position {
                return Err(Error::LayoutCollision {
                    name,
                    target,
                    position,
                });
            }
            write_zeros(&mut writer, target - position)?;
            writer.write_all(data)?;
            position = target + data.len() as u64;
            debug!("wrote {name} at offset {target} size {}", data.len());
        }

        let file = writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            fs::rename(&temp, output)?;
            debug!("new boot image created: {}", output.display());
            Ok(())
        }
        Err(err) => {
            let _ = fs::remove_file(&temp);
            Err(err)
        }
    }
}

fn write_zeros(writer: &mut impl Write, mut count: u64) -> Result<()> {
    let zeros = [0u8; 4096];
    while count > 0 {
        let n = count.min(zeros.len() as u64) as usize;
        writer.write_all(&zeros[..n])?;
        count -= n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(page_size: u32) -> BootImage {
        BootImage {
            page_size,
            kernel_addr: 0x1000_8000,
            ..BootImage::default()
        }
    }

    #[test]
    fn repacked_image_is_page_aligned() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("kernel"), vec![0xaa; 5000]).unwrap();
        fs::write(dir.path().join("ramdisk.cpio.gz"), vec![0xbb; 100]).unwrap();
        let out = dir.path().join("new-boot.img");
        repack_boot_image(&model(4096), dir.path(), &out).unwrap();

        let image = fs::read(&out).unwrap();
        assert_eq!(&image[..8], b"ANDROID!");
        assert_eq!(&image[8..12], &5000u32.to_le_bytes());
        assert_eq!(&image[12..16], &0x1000_8000u32.to_le_bytes());
        // kernel at one page, ramdisk at the next page boundary after it
        assert_eq!(image[4096], 0xaa);
        assert_eq!(image[4096 + 5000 - 1], 0xaa);
        assert_eq!(image[12288], 0xbb);
        assert_eq!(image.len(), 12288 + 100);
    }

    #[test]
    fn absent_components_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("kernel"), vec![1u8; 16]).unwrap();
        let out = dir.path().join("new-boot.img");
        repack_boot_image(&model(2048), dir.path(), &out).unwrap();
        let image = fs::read(&out).unwrap();
        assert_eq!(image.len(), 2048 + 16);
        assert_eq!(&image[16..20], &0u32.to_le_bytes()); // ramdisk_size
    }

    #[test]
    fn no_temp_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("kernel"), vec![1u8; 16]).unwrap();
        let out = dir.path().join("new-boot.img");
        repack_boot_image(&model(4096), dir.path(), &out).unwrap();
        assert!(out.exists());
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
