use std::fmt;

/// Packed OS version and security patch level.
///
/// For version `A.B.C` and patch level `Y-M`, the first little-endian word
/// of the header's 16-byte `os_version` field holds
/// `A[31:25] B[24:18] C[17:11] (Y-2000)[10:4] M[3:0]`. The remaining
/// twelve bytes have no defined interpretation and round-trip verbatim
/// through the header codec.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OsVersionPatch(u32);

/// Each version segment and the year offset occupy seven bits.
const SEGMENT_BITS: u32 = 0x7f;
const MONTH_BITS: u32 = 0xf;

impl OsVersionPatch {
    /// Packs a version triple and patch level into the header word.
    pub fn new(version: OsVersion, patch: OsPatch) -> Self {
        Self(
            (u32::from(version.major) & SEGMENT_BITS) << 25
                | (u32::from(version.minor) & SEGMENT_BITS) << 18
                | (u32::from(version.point) & SEGMENT_BITS) << 11
                | (u32::from(patch.year.saturating_sub(2000)) & SEGMENT_BITS) << 4
                | u32::from(patch.month) & MONTH_BITS,
        )
    }
    /// Interprets the leading little-endian word of a raw `os_version` field.
    pub fn from_field(os_version: &[u8; 16]) -> Self {
        let mut word = [0u8; 4];
        word.copy_from_slice(&os_version[..4]);
        Self(u32::from_le_bytes(word))
    }
    /// Returns the version triple.
    pub fn version(self) -> OsVersion {
        OsVersion {
            major: ((self.0 >> 25) & SEGMENT_BITS) as u8,
            minor: ((self.0 >> 18) & SEGMENT_BITS) as u8,
            point: ((self.0 >> 11) & SEGMENT_BITS) as u8,
        }
    }
    /// Returns the security patch level.
    pub fn patch(self) -> OsPatch {
        OsPatch {
            year: ((self.0 >> 4) & SEGMENT_BITS) as u16 + 2000,
            month: (self.0 & MONTH_BITS) as u8,
        }
    }
}

impl fmt::Debug for OsVersionPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OsVersionPatch({} {})", self.version(), self.patch())
    }
}

/// OS version triple `A.B.C`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OsVersion {
    pub major: u8,
    pub minor: u8,
    pub point: u8,
}

impl OsVersion {
    pub fn new(major: u8, minor: u8, point: u8) -> Self {
        Self {
            major,
            minor,
            point,
        }
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.point)
    }
}
impl fmt::Debug for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Security patch level `YYYY-MM`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OsPatch {
    pub year: u16,
    pub month: u8,
}

impl OsPatch {
    pub fn new(year: u16, month: u8) -> Self {
        Self { year, month }
    }
}

impl fmt::Display for OsPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}
impl fmt::Debug for OsPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_and_unpacks() {
        let vp = OsVersionPatch::new(OsVersion::new(13, 1, 2), OsPatch::new(2025, 3));
        assert_eq!(vp.version(), OsVersion::new(13, 1, 2));
        assert_eq!(vp.patch(), OsPatch::new(2025, 3));
        assert_eq!(vp.version().to_string(), "13.1.2");
        assert_eq!(vp.patch().to_string(), "2025-03");
        assert_eq!(format!("{vp:?}"), "OsVersionPatch(13.1.2 2025-03)");
    }

    #[test]
    fn reads_the_leading_header_word() {
        // A=13 B=1 C=2 Y=2025 M=3 laid out as
        // A[31:25] B[24:18] C[17:11] (Y-2000)[10:4] M[3:0].
        let word = (13u32 << 25) | (1 << 18) | (2 << 11) | (25 << 4) | 3;
        let mut field = [0u8; 16];
        field[..4].copy_from_slice(&word.to_le_bytes());
        let vp = OsVersionPatch::from_field(&field);
        assert_eq!(vp, OsVersionPatch::new(OsVersion::new(13, 1, 2), OsPatch::new(2025, 3)));
    }

    #[test]
    fn out_of_range_segments_are_masked() {
        let vp = OsVersionPatch::new(OsVersion::new(200, 0, 0), OsPatch::new(2025, 13));
        assert_eq!(vp.version().major, 200 & 0x7f);
        assert_eq!(vp.patch().month, 13);
    }
}
