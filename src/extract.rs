//! Extraction orchestration.
//!
//! Phases run in order: header read, optional scans, layout planning,
//! payload writes, metadata emission. Every phase is fail-soft: problems
//! become [`Warnings`] entries and the extractor keeps going with whatever
//! it managed to compute. Only a bad magic without `force` (on a file big
//! enough to be a boot image at all) aborts.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::debug;

use crate::archive::{walk_relative, Archiver};
use crate::compress::{decompress_to, Codecs, CompressionKind};
use crate::error::{Error, Result, Warnings};
use crate::header::{latin1, trim_trailing_nul, ParsedHeader};
use crate::layout::{Layout, PayloadSizes};
use crate::scan::{self, Deadline, SCAN_TIMEOUT};
use crate::version::OsVersionPatch;
use crate::BootImage;

/// Wall-clock budget for one whole extraction.
pub const PARSE_TIMEOUT: Duration = Duration::from_secs(300);

const RENAME_RETRIES: u32 = 5;
const RENAME_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub struct ExtractOptions {
    pub skip_ramdisk: bool,
    pub skip_dtb: bool,
    /// AVB scanning is opt-in.
    pub skip_avb: bool,
    /// Continue past a bad magic and recover what the header still holds.
    pub force: bool,
    /// Log the file list of every unpacked cpio archive.
    pub debug_cpio: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            skip_ramdisk: false,
            skip_dtb: false,
            skip_avb: true,
            force: false,
            debug_cpio: false,
        }
    }
}

/// Everything one extraction produced.
#[derive(Debug)]
pub struct ExtractReport {
    pub image: BootImage,
    pub warnings: Warnings,
    pub ramdisk_path: Option<PathBuf>,
    pub vendor_ramdisk_path: Option<PathBuf>,
    pub ramdisk_dir: Option<PathBuf>,
    pub vendor_ramdisk_dir: Option<PathBuf>,
}

/// Orchestrates one extraction.
pub struct Extractor<'a> {
    options: ExtractOptions,
    codecs: Codecs,
    archiver: Option<&'a dyn Archiver>,
}

impl<'a> Extractor<'a> {
    pub fn new(options: ExtractOptions) -> Self {
        Self {
            options,
            codecs: Codecs::default(),
            archiver: None,
        }
    }

    pub fn codecs(mut self, codecs: Codecs) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn archiver(mut self, archiver: &'a dyn Archiver) -> Self {
        self.archiver = Some(archiver);
        self
    }

    /// Unpacks `boot_img` into `out_dir`.
    pub fn extract(&self, boot_img: &Path, out_dir: &Path) -> Result<ExtractReport> {
        let mut warnings = Warnings::default();
        probe_output_dir(out_dir)?;

        let file_size = fs::metadata(boot_img)?.len();
        debug!("boot image size: {file_size} bytes");
        let mut file = File::open(boot_img)?;

        let deadline = Deadline::after(PARSE_TIMEOUT);
        let header =
            ParsedHeader::parse(&mut file, file_size, self.options.force, &mut warnings)?;
        let page_size = header.raw.page_size;
        let page = u64::from(page_size);
        debug!(
            "parsed header: version={} page_size={} kernel_size={} ramdisk_size={} os={:?}",
            header.version,
            page_size,
            header.raw.kernel_size,
            header.raw.ramdisk_size,
            OsVersionPatch::from_field(&header.raw.os_version),
        );

        let mut sizes = header.payload_sizes();

        // DTB: header-driven when any dtb size is set, scanned otherwise.
        let mut dtb_offset_override =
            (header.dtb_size_v4 != 0).then_some(header.dtb_offset_v4);
        if !self.options.skip_dtb && sizes.dtb == 0 && !deadline.expired() {
            if let Some(hit) = scan::scan_for_dtb(
                &mut file,
                page,
                file_size,
                Deadline::after(SCAN_TIMEOUT),
                &mut warnings,
            )? {
                debug!(
                    "found DTB at offset {}, size {}, magic {:?}",
                    hit.offset, hit.size, hit.magic
                );
                sizes.dtb = hit.size;
                dtb_offset_override = Some(hit.offset);
            }
        }

        let mut avb = None;
        if !self.options.skip_avb && !deadline.expired() {
            avb = scan::scan_for_avb(
                &mut file,
                page,
                file_size,
                Deadline::after(SCAN_TIMEOUT),
                &mut warnings,
            )?;
            if let Some(hit) = avb {
                debug!("found AVB signature at offset {}, size {}", hit.offset, hit.size);
            }
        }

        let mut ramdisk_offset_override = None;
        let mut ramdisk_compression = CompressionKind::Unknown;
        if !self.options.skip_ramdisk && sizes.ramdisk == 0 && !deadline.expired() {
            warnings.push("ramdisk_size is 0, scanning for ramdisk signatures");
            match scan::scan_for_ramdisk(
                &mut file,
                page,
                file_size,
                Deadline::after(SCAN_TIMEOUT),
                &mut warnings,
            )? {
                Some(hit) => {
                    debug!(
                        "found ramdisk at offset {}, size {}, compression {}",
                        hit.offset,
                        hit.size,
                        hit.compression.name()
                    );
                    sizes.ramdisk = hit.size;
                    ramdisk_offset_override = Some(hit.offset);
                    ramdisk_compression = hit.compression;
                }
                None => debug!("no ramdisk found after scanning"),
            }
        }

        let mut layout = Layout::plan(page_size, &sizes);
        if let Some(offset) = ramdisk_offset_override {
            layout.ramdisk = offset;
        }
        if let Some(offset) = dtb_offset_override {
            layout.dtb = offset;
        }
        if header.recovery_dtbo_size != 0 && header.recovery_dtbo_offset != 0 {
            layout.recovery_dtbo = header.recovery_dtbo_offset;
        }

        for (name, offset, size) in layout.entries(&sizes) {
            if size != 0 && offset != 0 && offset + size > file_size {
                warnings.push_error(&Error::Overrun {
                    name,
                    offset,
                    size,
                    file_size,
                });
            }
        }

        let mut report = ExtractReport {
            image: BootImage {
                version: header.version,
                page_size,
                kernel_size: sizes.kernel as u32,
                kernel_addr: header.raw.kernel_addr,
                ramdisk_size: sizes.ramdisk as u32,
                ramdisk_addr: header.raw.ramdisk_addr,
                second_size: sizes.second as u32,
                second_addr: header.raw.second_addr,
                dtb_size: sizes.dtb as u32,
                recovery_dtbo_size: header.recovery_dtbo_size,
                recovery_dtbo_offset: if header.recovery_dtbo_size != 0 {
                    header.recovery_dtbo_offset
                } else {
                    0
                },
                vendor_ramdisk_size: header.vendor_ramdisk_size,
                tags_addr: header.raw.tags_addr,
                os_version: header.raw.os_version,
                cmdline: header.raw.cmdline.clone(),
                id: header.raw.id,
                extra_cmdline: header.raw.extra_cmdline.clone(),
                board_name: header.raw.board_name,
                ramdisk_compression,
            },
            warnings: Warnings::default(),
            ramdisk_path: None,
            vendor_ramdisk_path: None,
            ramdisk_dir: None,
            vendor_ramdisk_dir: None,
        };

        if deadline.expired() {
            warnings.push_error(&Error::TimedOut("boot image parse"));
        } else {
            self.write_payloads(
                &mut file,
                file_size,
                &layout,
                &sizes,
                avb,
                out_dir,
                deadline,
                &mut report,
                &mut warnings,
            )?;
        }

        write_metadata(out_dir, &report.image, &header.raw.magic, &mut warnings);

        report.warnings = warnings;
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_payloads(
        &self,
        file: &mut File,
        file_size: u64,
        layout: &Layout,
        sizes: &PayloadSizes,
        avb: Option<scan::AvbHit>,
        out_dir: &Path,
        deadline: Deadline,
        report: &mut ExtractReport,
        warnings: &mut Warnings,
    ) -> Result<()> {
        if sizes.kernel != 0 {
            extract_component(
                file,
                "kernel",
                layout.kernel,
                sizes.kernel,
                &out_dir.join("kernel"),
                warnings,
            )?;
        }

        if sizes.ramdisk != 0 && layout.ramdisk != 0 && !self.options.skip_ramdisk {
            let initial = out_dir.join(format!(
                "ramdisk.cpio.{}",
                report.image.ramdisk_compression.extension()
            ));
            if extract_component(
                file,
                "ramdisk",
                layout.ramdisk,
                sizes.ramdisk,
                &initial,
                warnings,
            )? {
                let (path, kind) = adopt_extension(out_dir, "ramdisk", initial, warnings);
                debug!("ramdisk detected as {}-compressed", kind.name());
                report.image.ramdisk_compression = kind;
                if deadline.expired() {
                    warnings.push_error(&Error::TimedOut("ramdisk extract"));
                } else {
                    report.ramdisk_dir =
                        self.unpack_ramdisk(&path, &out_dir.join("ramdisk"), kind, warnings);
                }
                report.ramdisk_path = Some(path);
            }
        }

        if sizes.second != 0 && layout.second != 0 {
            extract_component(
                file,
                "second",
                layout.second,
                sizes.second,
                &out_dir.join("second"),
                warnings,
            )?;
        }

        if sizes.dtb != 0 && layout.dtb != 0 && !self.options.skip_dtb {
            extract_component(
                file,
                "dtb",
                layout.dtb,
                sizes.dtb,
                &out_dir.join("dtb"),
                warnings,
            )?;
        }

        if sizes.recovery_dtbo != 0 && layout.recovery_dtbo != 0 {
            extract_component(
                file,
                "recovery_dtbo",
                layout.recovery_dtbo,
                sizes.recovery_dtbo,
                &out_dir.join("recovery_dtbo"),
                warnings,
            )?;
        }

        if sizes.vendor_ramdisk != 0 && layout.vendor_ramdisk != 0 && !self.options.skip_ramdisk
        {
            let initial = out_dir.join("vendor_ramdisk.cpio.gz");
            if extract_component(
                file,
                "vendor_ramdisk",
                layout.vendor_ramdisk,
                sizes.vendor_ramdisk,
                &initial,
                warnings,
            )? {
                let (path, kind) =
                    adopt_extension(out_dir, "vendor_ramdisk", initial, warnings);
                debug!("vendor ramdisk detected as {}-compressed", kind.name());
                if deadline.expired() {
                    warnings.push_error(&Error::TimedOut("vendor ramdisk extract"));
                } else {
                    report.vendor_ramdisk_dir = self.unpack_ramdisk(
                        &path,
                        &out_dir.join("vendor_ramdisk"),
                        kind,
                        warnings,
                    );
                }
                report.vendor_ramdisk_path = Some(path);
            }
        }

        if let Some(hit) = avb {
            if hit.offset + hit.size <= file_size {
                extract_component(
                    file,
                    "avb_signature",
                    hit.offset,
                    hit.size,
                    &out_dir.join("avb_signature.bin"),
                    warnings,
                )?;
            }
        }

        Ok(())
    }

    /// Decompresses and unpacks a ramdisk archive into `target_dir`.
    ///
    /// Tolerates a missing archiver or codec: the compressed file stays in
    /// place and the failure is recorded as a warning.
    fn unpack_ramdisk(
        &self,
        archive_path: &Path,
        target_dir: &Path,
        kind: CompressionKind,
        warnings: &mut Warnings,
    ) -> Option<PathBuf> {
        let Some(archiver) = self.archiver else {
            warnings.push_error(&Error::ArchiverUnavailable);
            return None;
        };

        let temp_cpio = archive_path.with_file_name("temp.cpio");
        let cpio_path = if kind.is_compressed() {
            if !self.codecs.supports(kind) {
                warnings.push_error(&Error::CodecUnavailable(kind.name()));
                return None;
            }
            debug!("decompressing {} ramdisk", kind.name());
            let result = (|| -> Result<()> {
                let mut input = File::open(archive_path)?;
                let mut output = File::create(&temp_cpio)?;
                decompress_to(kind, &mut input, &mut output, &self.codecs)?;
                output.sync_all()?;
                Ok(())
            })();
            if let Err(err) = result {
                warnings.push(format!("failed to decompress ramdisk: {err}"));
                let _ = fs::remove_file(&temp_cpio);
                return None;
            }
            temp_cpio.as_path()
        } else {
            archive_path
        };

        let unpacked = match archiver.unpack(cpio_path, target_dir) {
            Ok(()) => {
                debug!("extracted cpio to {}", target_dir.display());
                true
            }
            Err(err) => {
                warnings.push(format!("failed to extract ramdisk contents: {err}"));
                false
            }
        };

        if unpacked && self.options.debug_cpio {
            write_cpio_debug_log(archive_path, target_dir, warnings);
        }

        if cpio_path == temp_cpio {
            let _ = fs::remove_file(&temp_cpio);
        }
        unpacked.then(|| target_dir.to_path_buf())
    }
}

/// Reads only the header of `boot_img` and builds the model from it, with
/// no scanning and no payload writes.
///
/// This is what a standalone repack starts from.
pub fn read_model(boot_img: &Path, force: bool) -> Result<(BootImage, Warnings)> {
    let mut warnings = Warnings::default();
    let file_size = fs::metadata(boot_img)?.len();
    let mut file = File::open(boot_img)?;
    let header = ParsedHeader::parse(&mut file, file_size, force, &mut warnings)?;
    let sizes = header.payload_sizes();
    let image = BootImage {
        version: header.version,
        page_size: header.raw.page_size,
        kernel_size: header.raw.kernel_size,
        kernel_addr: header.raw.kernel_addr,
        ramdisk_size: header.raw.ramdisk_size,
        ramdisk_addr: header.raw.ramdisk_addr,
        second_size: header.raw.second_size,
        second_addr: header.raw.second_addr,
        dtb_size: sizes.dtb as u32,
        recovery_dtbo_size: header.recovery_dtbo_size,
        recovery_dtbo_offset: if header.recovery_dtbo_size != 0 {
            header.recovery_dtbo_offset
        } else {
            0
        },
        vendor_ramdisk_size: header.vendor_ramdisk_size,
        tags_addr: header.raw.tags_addr,
        os_version: header.raw.os_version,
        cmdline: header.raw.cmdline.clone(),
        id: header.raw.id,
        extra_cmdline: header.raw.extra_cmdline.clone(),
        board_name: header.raw.board_name,
        ramdisk_compression: CompressionKind::Unknown,
    };
    Ok((image, warnings))
}

fn probe_output_dir(out_dir: &Path) -> Result<()> {
    debug!("checking write access to {}", out_dir.display());
    fs::create_dir_all(out_dir)?;
    let probe = out_dir.join("test.txt");
    fs::write(&probe, b"test")?;
    fs::remove_file(&probe)?;
    Ok(())
}

/// Reads `size` bytes at `offset` and writes them to `dest` atomically:
/// temp sibling, fsync, rename with retries. A failed rename keeps the
/// temp file so the bytes are never lost.
///
/// Returns whether the full payload landed in `dest`.
fn extract_component(
    file: &mut File,
    name: &'static str,
    offset: u64,
    size: u64,
    dest: &Path,
    warnings: &mut Warnings,
) -> Result<bool> {
    if size == 0 || offset == 0 {
        return Ok(false);
    }
    debug!("extracting {name}");
    file.seek(SeekFrom::Start(offset))?;
    // Sized by what the file actually yields, not by the header's claim.
    let mut data = Vec::new();
    file.take(size).read_to_end(&mut data)?;
    let full = data.len() as u64 == size;
    if !full {
        warnings.push_error(&Error::ShortRead {
            name,
            expected: size,
            got: data.len() as u64,
        });
        if data.is_empty() {
            return Ok(false);
        }
    }

    let mut temp_name = dest.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp = PathBuf::from(temp_name);

    let written = (|| -> Result<()> {
        let mut out = File::create(&temp)?;
        out.write_all(&data)?;
        out.sync_all()?;
        Ok(())
    })();
    if let Err(err) = written {
        let _ = fs::remove_file(&temp);
        warnings.push(format!("failed to write {name}: {err}"));
        return Ok(false);
    }

    if safe_rename(&temp, dest, warnings) {
        debug!("extracted {name} to {}", dest.display());
    } else {
        warnings.push(format!(
            "using temporary file {} for {name} due to rename failure",
            temp.display()
        ));
    }
    Ok(full)
}

fn safe_rename(from: &Path, to: &Path, warnings: &mut Warnings) -> bool {
    for attempt in 1..=RENAME_RETRIES {
        match fs::rename(from, to) {
            Ok(()) => return true,
            Err(err) if attempt < RENAME_RETRIES => {
                warnings.push(format!(
                    "failed to rename {} to {}: {err}; retrying in {}ms",
                    from.display(),
                    to.display(),
                    RENAME_BACKOFF.as_millis()
                ));
                thread::sleep(RENAME_BACKOFF);
            }
            Err(_) => warnings.push_error(&Error::RenameFailed {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
                attempts: RENAME_RETRIES,
            }),
        }
    }
    false
}

/// Re-detects the compression of a freshly written ramdisk file and
/// renames it so the extension matches.
fn adopt_extension(
    out_dir: &Path,
    stem: &str,
    path: PathBuf,
    warnings: &mut Warnings,
) -> (PathBuf, CompressionKind) {
    let mut magic = [0u8; 4];
    let kind = match File::open(&path).and_then(|mut f| f.read(&mut magic)) {
        Ok(n) => CompressionKind::detect(&magic[..n]),
        Err(err) => {
            warnings.push(format!("failed to verify {stem} compression: {err}"));
            return (path, CompressionKind::Unknown);
        }
    };
    let desired = out_dir.join(format!("{stem}.cpio.{}", kind.extension()));
    if desired == path {
        return (path, kind);
    }
    if safe_rename(&path, &desired, warnings) {
        (desired, kind)
    } else {
        warnings.push(format!("continuing with {}", path.display()));
        (path, kind)
    }
}

fn write_cpio_debug_log(archive_path: &Path, target_dir: &Path, warnings: &mut Warnings) {
    let log_path = target_dir.with_file_name("cpio_debug.log");
    debug!("writing cpio debug log to {}", log_path.display());
    let result = (|| -> Result<()> {
        let entries = walk_relative(target_dir)?;
        let mut out = String::new();
        out.push_str(&format!("Extracted files from {}:\n", archive_path.display()));
        let mut count = 0usize;
        for rel in &entries {
            if !target_dir.join(rel).is_dir() {
                out.push_str(&format!("{}\n", rel.display()));
                count += 1;
            }
        }
        out.push_str(&format!("\nTotal files extracted: {count}\n"));
        fs::write(&log_path, out)?;
        Ok(())
    })();
    if let Err(err) = result {
        warnings.push(format!("failed to write cpio debug log: {err}"));
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Emits `bootimg_info.txt`, `cmdline.txt`, `id.bin` and, when non-empty,
/// `extra_cmdline.txt` next to the payloads.
fn write_metadata(out_dir: &Path, image: &BootImage, magic: &[u8; 8], warnings: &mut Warnings) {
    debug!("extracting metadata");
    let mut info = String::new();
    info.push_str(&format!("Magic: {}\n", hex(magic)));
    info.push_str(&format!("Kernel Size: {}\n", image.kernel_size));
    info.push_str(&format!("Ramdisk Size: {}\n", image.ramdisk_size));
    info.push_str(&format!("Second Size: {}\n", image.second_size));
    info.push_str(&format!("DTB Size: {}\n", image.dtb_size));
    info.push_str(&format!("Recovery DTBO Size: {}\n", image.recovery_dtbo_size));
    info.push_str(&format!("Vendor Ramdisk Size: {}\n", image.vendor_ramdisk_size));
    info.push_str(&format!("Page Size: {}\n", image.page_size));
    info.push_str(&format!("Header Version: {}\n", image.version));
    info.push_str(&format!(
        "Board Name: {}\n",
        latin1(trim_trailing_nul(&image.board_name))
    ));
    info.push_str(&format!(
        "Command Line: {}\n",
        latin1(trim_trailing_nul(&*image.cmdline))
    ));
    info.push_str(&format!("OS Version: {}\n", hex(&image.os_version)));
    if let Err(err) = fs::write(out_dir.join("bootimg_info.txt"), info) {
        warnings.push(format!("failed to write bootimg_info: {err}"));
    }

    if let Err(err) = fs::write(
        out_dir.join("cmdline.txt"),
        trim_trailing_nul(&*image.cmdline),
    ) {
        warnings.push(format!("failed to write cmdline: {err}"));
    }

    if let Err(err) = fs::write(out_dir.join("id.bin"), image.id) {
        warnings.push(format!("failed to write id: {err}"));
    }

    let extra = trim_trailing_nul(&*image.extra_cmdline);
    if !extra.is_empty() {
        if let Err(err) = fs::write(out_dir.join("extra_cmdline.txt"), extra) {
            warnings.push(format!("failed to write extra_cmdline: {err}"));
        }
    }
}
