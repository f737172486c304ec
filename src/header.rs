//! Boot image header codec.
//!
//! This codec uses the extended v0 field mapping seen on real devices:
//! `cmdline` occupies bytes `[64..576]`, `id` bytes `[576..608]`,
//! `extra_cmdline` bytes `[608..1104]` and `board_name` bytes
//! `[1104..1120]`. Version 3/4 extension fields overlay the start of the
//! cmdline window and are decoded separately. Byte fields round-trip
//! verbatim; only the metadata emission interprets them as text.

use std::io::{Cursor, Read};

use binrw::{binrw, BinRead, BinWrite};
use log::debug;

use crate::error::{Error, Result, Warnings};
use crate::layout::{PayloadSizes, DEFAULT_PAGE_SIZE, VALID_PAGE_SIZES};

pub const BOOT_MAGIC: &[u8] = b"ANDROID!";

/// Smallest file that can plausibly hold a header.
pub const MIN_IMAGE_LEN: u64 = 160;

/// How many bytes the parser probes; larger v2+ headers fit in here, and
/// shorter files are zero-filled up to it.
pub const HEADER_PROBE_LEN: usize = 1664;

/// Packed length of the extended v0 layout.
pub const HEADER_PACKED_LEN: usize = 1120;

/// The extended v0 header window, exactly as laid out on disk.
///
/// ## Section layout
///
/// ```text
/// ┌─────────────────────────┐
/// │boot image header        │
/// │+ padding to page size   │
/// ├─────────────────────────┤
/// │kernel                   │
/// │+ padding to page size   │
/// ├─────────────────────────┤
/// │ramdisk                  │
/// │+ padding to page size   │
/// ├─────────────────────────┤
/// │second stage bootloader  │
/// │+ padding to page size   │
/// ├─────────────────────────┤
/// │dtb                      │
/// │+ padding to page size   │
/// ├─────────────────────────┤
/// │recovery dtbo            │
/// │+ padding to page size   │
/// ├─────────────────────────┤
/// │vendor ramdisk           │
/// │+ padding to page size   │
/// └─────────────────────────┘
/// ```
#[binrw]
#[derive(Clone, Debug, PartialEq, Eq)]
#[brw(little)]
pub struct RawHeader {
    /// `ANDROID!` on well-formed images. Kept as data so `force` parsing
    /// can carry a bad magic through.
    pub magic: [u8; 8],
    /// Kernel size
    pub kernel_size: u32,
    /// Kernel physical load address
    pub kernel_addr: u32,
    /// Ramdisk size
    pub ramdisk_size: u32,
    /// Ramdisk physical load address
    pub ramdisk_addr: u32,
    /// Second bootloader size
    pub second_size: u32,
    /// Second bootloader physical load address
    pub second_addr: u32,
    /// Kernel tags physical load address
    pub tags_addr: u32,
    /// Page size in bytes
    pub page_size: u32,
    /// Header version
    pub header_version: u32,
    /// DTB size on v0-v2 layouts; meaning varies on later versions.
    pub extra_field: u32,
    /// OS version and patch level, plus 12 reserved bytes
    pub os_version: [u8; 16],
    /// Kernel command line
    pub cmdline: Box<[u8; 512]>,
    /// Hash digest
    pub id: [u8; 32],
    /// Kernel command line, part 2
    pub extra_cmdline: Box<[u8; 496]>,
    /// Board or product name
    pub board_name: [u8; 16],
}

impl Default for RawHeader {
    fn default() -> Self {
        Self {
            magic: [0; 8],
            kernel_size: 0,
            kernel_addr: 0,
            ramdisk_size: 0,
            ramdisk_addr: 0,
            second_size: 0,
            second_addr: 0,
            tags_addr: 0,
            page_size: 0,
            header_version: 0,
            extra_field: 0,
            os_version: [0; 16],
            cmdline: Box::new([0; 512]),
            id: [0; 32],
            extra_cmdline: Box::new([0; 496]),
            board_name: [0; 16],
        }
    }
}

impl RawHeader {
    /// Serializes the header into exactly one page: the packed layout
    /// followed by zero padding.
    ///
    /// Refuses to emit a header larger than the page.
    pub fn encode_page(&self, page_size: u32) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::with_capacity(page_size as usize));
        self.write(&mut cursor)?;
        let mut page = cursor.into_inner();
        if page.len() > page_size as usize {
            return Err(Error::LayoutCollision {
                name: "header",
                target: u64::from(page_size),
                position: page.len() as u64,
            });
        }
        page.resize(page_size as usize, 0);
        Ok(page)
    }
}

/// Header fields after permissive recovery.
///
/// `version` is clamped to 0-4; `page_size` to the valid set. The v3/v4
/// overlay fields are zero unless the header version and probe length
/// allowed reading them.
#[derive(Debug, Clone, Default)]
pub struct ParsedHeader {
    pub raw: RawHeader,
    pub version: u32,
    /// DTB size for v0-v2 layouts (`extra_field`).
    pub dtb_size: u32,
    pub recovery_dtbo_size: u32,
    pub recovery_dtbo_offset: u64,
    pub header_size: u32,
    pub vendor_ramdisk_size: u32,
    pub dtb_size_v4: u32,
    pub dtb_offset_v4: u64,
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(word)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(word)
}

impl ParsedHeader {
    /// Reads up to [`HEADER_PROBE_LEN`] bytes from `reader` and decodes
    /// them permissively.
    ///
    /// Without `force`, a magic other than `ANDROID!` is fatal; with it,
    /// decoding proceeds on whatever could be recovered and the problems
    /// are recorded in `warnings`. Files under [`MIN_IMAGE_LEN`] bytes are
    /// rejected outright.
    pub fn parse(
        reader: &mut impl Read,
        file_size: u64,
        force: bool,
        warnings: &mut Warnings,
    ) -> Result<Self> {
        if file_size < MIN_IMAGE_LEN {
            return Err(Error::TooSmall(file_size));
        }

        // Short reads are tolerated by zero-filling the tail of the probe.
        let mut buf = vec![0u8; HEADER_PROBE_LEN];
        let mut filled = 0;
        loop {
            let n = reader.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
            if filled == buf.len() {
                break;
            }
        }
        debug!("header probe: {filled} bytes");

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[..8]);
        if magic != *BOOT_MAGIC {
            if !force {
                return Err(Error::BadMagic(magic));
            }
            warnings.push_error(&Error::BadMagic(magic));
        }

        let raw = match RawHeader::read(&mut Cursor::new(&buf[..])) {
            Ok(raw) => raw,
            Err(_) if force => {
                warnings.push_error(&Error::FieldParse("header"));
                RawHeader {
                    magic,
                    ..RawHeader::default()
                }
            }
            Err(_) => return Err(Error::FieldParse("header")),
        };

        let mut parsed = Self {
            raw,
            ..Self::default()
        };

        parsed.version = parsed.raw.header_version;
        if parsed.version > 4 {
            if force {
                // Legacy interpretation: such images predate the version
                // field and carry a dtb size in that slot.
                warnings.push(format!(
                    "unsupported header version {}, treating as v0",
                    parsed.version
                ));
                parsed.version = 0;
                parsed.dtb_size = parsed.raw.extra_field;
            } else {
                warnings.push(format!(
                    "unsupported header version {}, treating as v0 (pass force to recover dtb_size)",
                    parsed.version
                ));
                parsed.version = 0;
            }
        } else if parsed.version <= 2 {
            parsed.dtb_size = parsed.raw.extra_field;
        }

        // v3/v4 extension fields overlay the start of the cmdline window.
        if parsed.version >= 3 && filled >= 80 {
            parsed.recovery_dtbo_size = read_u32(&buf, 64);
            parsed.recovery_dtbo_offset = read_u64(&buf, 68);
            parsed.header_size = read_u32(&buf, 76);
        }
        if parsed.version >= 4 && filled >= 96 {
            parsed.vendor_ramdisk_size = read_u32(&buf, 80);
            parsed.dtb_size_v4 = read_u32(&buf, 84);
            parsed.dtb_offset_v4 = read_u64(&buf, 88);
        }

        if !VALID_PAGE_SIZES.contains(&parsed.raw.page_size) {
            warnings.push(format!(
                "invalid page_size {}, assuming {}",
                parsed.raw.page_size, DEFAULT_PAGE_SIZE
            ));
            parsed.raw.page_size = DEFAULT_PAGE_SIZE;
        }

        Ok(parsed)
    }

    /// Effective DTB size: the v4 field wins when set.
    pub fn effective_dtb_size(&self) -> u64 {
        if self.dtb_size_v4 != 0 {
            u64::from(self.dtb_size_v4)
        } else {
            u64::from(self.dtb_size)
        }
    }

    /// Payload sizes for the layout planner.
    pub fn payload_sizes(&self) -> PayloadSizes {
        PayloadSizes {
            kernel: u64::from(self.raw.kernel_size),
            ramdisk: u64::from(self.raw.ramdisk_size),
            second: u64::from(self.raw.second_size),
            dtb: self.effective_dtb_size(),
            recovery_dtbo: u64::from(self.recovery_dtbo_size),
            vendor_ramdisk: u64::from(self.vendor_ramdisk_size),
        }
    }
}

/// Strips trailing NUL bytes. Interior NULs are preserved.
pub fn trim_trailing_nul(input: &[u8]) -> &[u8] {
    match input.iter().rposition(|b| *b != 0) {
        Some(last) => &input[..=last],
        None => &[],
    }
}

/// Decodes bytes as latin-1 for human-readable output. Lossless over the
/// full byte range, so nothing the header carries is dropped.
pub fn latin1(input: &[u8]) -> String {
    input.iter().map(|&b| b as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header_bytes() -> Vec<u8> {
        let header = RawHeader {
            magic: *b"ANDROID!",
            kernel_size: 16,
            kernel_addr: 0x1000_8000,
            ramdisk_size: 2048,
            ramdisk_addr: 0x1100_0000,
            page_size: 4096,
            header_version: 0,
            cmdline: {
                let mut c = Box::new([0u8; 512]);
                c[..15].copy_from_slice(b"console=ttyMSM0");
                c
            },
            id: [0xcd; 32],
            board_name: *b"sdm845\0\0\0\0\0\0\0\0\0\0",
            ..RawHeader::default()
        };
        header.encode_page(4096).unwrap()
    }

    #[test]
    fn parse_well_formed_v0() {
        let bytes = sample_header_bytes();
        let mut warnings = Warnings::default();
        let parsed =
            ParsedHeader::parse(&mut &bytes[..], 8192, false, &mut warnings).unwrap();
        assert_eq!(parsed.version, 0);
        assert_eq!(parsed.raw.kernel_size, 16);
        assert_eq!(parsed.raw.kernel_addr, 0x1000_8000);
        assert_eq!(parsed.raw.page_size, 4096);
        assert_eq!(
            trim_trailing_nul(&parsed.raw.board_name),
            b"sdm845"
        );
        assert!(warnings.is_empty());
    }

    #[test]
    fn bad_magic_is_fatal_without_force() {
        let mut bytes = sample_header_bytes();
        bytes[..8].copy_from_slice(b"GARBAGE!");
        let mut warnings = Warnings::default();
        let err = ParsedHeader::parse(&mut &bytes[..], 8192, false, &mut warnings).unwrap_err();
        assert!(matches!(err, Error::BadMagic(m) if &m == b"GARBAGE!"));
    }

    #[test]
    fn bad_magic_recovers_under_force() {
        let mut bytes = sample_header_bytes();
        bytes[..8].copy_from_slice(b"GARBAGE!");
        let mut warnings = Warnings::default();
        let parsed = ParsedHeader::parse(&mut &bytes[..], 8192, true, &mut warnings).unwrap();
        assert_eq!(parsed.raw.kernel_size, 16);
        assert_eq!(parsed.raw.magic, *b"GARBAGE!");
        assert!(!warnings.is_empty());
    }

    #[test]
    fn tiny_file_is_rejected() {
        let bytes = [0u8; 64];
        let mut warnings = Warnings::default();
        let err = ParsedHeader::parse(&mut &bytes[..], 64, true, &mut warnings).unwrap_err();
        assert!(matches!(err, Error::TooSmall(64)));
    }

    #[test]
    fn short_header_zero_fills_id() {
        // 200 bytes: past the fixed fields, short of the id window.
        let mut bytes = sample_header_bytes();
        bytes.truncate(200);
        let mut warnings = Warnings::default();
        let parsed =
            ParsedHeader::parse(&mut &bytes[..], 200, false, &mut warnings).unwrap();
        assert_eq!(parsed.raw.id, [0u8; 32]);
    }

    #[test]
    fn page_size_is_clamped() {
        let mut bytes = sample_header_bytes();
        bytes[36..40].copy_from_slice(&123u32.to_le_bytes());
        let mut warnings = Warnings::default();
        let parsed =
            ParsedHeader::parse(&mut &bytes[..], 8192, false, &mut warnings).unwrap();
        assert_eq!(parsed.raw.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn future_version_needs_force_to_recover_dtb_size() {
        let mut bytes = sample_header_bytes();
        bytes[40..44].copy_from_slice(&9u32.to_le_bytes());
        bytes[44..48].copy_from_slice(&2048u32.to_le_bytes());

        let mut warnings = Warnings::default();
        let parsed =
            ParsedHeader::parse(&mut &bytes[..], 8192, false, &mut warnings).unwrap();
        assert_eq!(parsed.version, 0);
        assert_eq!(parsed.dtb_size, 0);

        let mut warnings = Warnings::default();
        let parsed = ParsedHeader::parse(&mut &bytes[..], 8192, true, &mut warnings).unwrap();
        assert_eq!(parsed.version, 0);
        assert_eq!(parsed.dtb_size, 2048);
    }

    #[test]
    fn v4_overlay_fields() {
        let mut bytes = sample_header_bytes();
        bytes[40..44].copy_from_slice(&4u32.to_le_bytes());
        bytes[64..68].copy_from_slice(&512u32.to_le_bytes()); // recovery_dtbo_size
        bytes[68..76].copy_from_slice(&20480u64.to_le_bytes()); // recovery_dtbo_offset
        bytes[80..84].copy_from_slice(&4096u32.to_le_bytes()); // vendor_ramdisk_size
        bytes[84..88].copy_from_slice(&2048u32.to_le_bytes()); // dtb_size
        bytes[88..96].copy_from_slice(&16384u64.to_le_bytes()); // dtb_offset
        let mut warnings = Warnings::default();
        let parsed =
            ParsedHeader::parse(&mut &bytes[..], 65536, false, &mut warnings).unwrap();
        assert_eq!(parsed.version, 4);
        assert_eq!(parsed.recovery_dtbo_size, 512);
        assert_eq!(parsed.recovery_dtbo_offset, 20480);
        assert_eq!(parsed.vendor_ramdisk_size, 4096);
        assert_eq!(parsed.effective_dtb_size(), 2048);
        assert_eq!(parsed.dtb_offset_v4, 16384);
    }

    #[test]
    fn encode_round_trips() {
        let bytes = sample_header_bytes();
        assert_eq!(bytes.len(), 4096);
        assert_eq!(&bytes[..8], BOOT_MAGIC);
        assert_eq!(&bytes[8..12], &16u32.to_le_bytes());
        assert!(bytes[HEADER_PACKED_LEN..].iter().all(|b| *b == 0));

        let mut warnings = Warnings::default();
        let parsed =
            ParsedHeader::parse(&mut &bytes[..], 8192, false, &mut warnings).unwrap();
        assert_eq!(parsed.raw.encode_page(4096).unwrap(), bytes);
    }
}
