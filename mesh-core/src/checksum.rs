//! Checksums: CRC32 and Fletcher-16 in a fixed 4-byte slot.

use serde::{Deserialize, Serialize};

/// Width of the checksum slot in every framed message.
pub const CHECKSUM_LEN: usize = 4;

/// Algorithm used when writing the checksum slot. Reading auto-detects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    #[default]
    Crc32,
    /// For memory-constrained transports. Occupies the low two slot bytes.
    Fletcher16,
}

impl std::str::FromStr for ChecksumKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "crc32" => Ok(ChecksumKind::Crc32),
            "fletcher16" => Ok(ChecksumKind::Fletcher16),
            other => Err(format!("unknown checksum algorithm: {other}")),
        }
    }
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

pub fn fletcher16(data: &[u8]) -> u16 {
    let mut sum1: u16 = 0;
    let mut sum2: u16 = 0;
    for &b in data {
        sum1 = (sum1 + b as u16) % 255;
        sum2 = (sum2 + sum1) % 255;
    }
    (sum2 << 8) | sum1
}

/// Compute the slot contents for `data` (little-endian; Fletcher-16 is zero padded).
pub fn compute(kind: ChecksumKind, data: &[u8]) -> [u8; CHECKSUM_LEN] {
    match kind {
        ChecksumKind::Crc32 => crc32(data).to_le_bytes(),
        ChecksumKind::Fletcher16 => {
            let f = fletcher16(data).to_le_bytes();
            [f[0], f[1], 0, 0]
        }
    }
}

/// Verify a slot against `data`. A slot whose upper two bytes are zero is also
/// accepted as a Fletcher-16 checksum.
pub fn verify(slot: &[u8; CHECKSUM_LEN], data: &[u8]) -> bool {
    if u32::from_le_bytes(*slot) == crc32(data) {
        return true;
    }
    slot[2] == 0 && slot[3] == 0 && u16::from_le_bytes([slot[0], slot[1]]) == fletcher16(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn fletcher16_known_vectors() {
        assert_eq!(fletcher16(b"abcde"), 0xC8F0);
        assert_eq!(fletcher16(b"abcdef"), 0x2057);
    }

    #[test]
    fn verify_detects_both_algorithms() {
        let data = b"hello transport";
        let crc = compute(ChecksumKind::Crc32, data);
        let fl = compute(ChecksumKind::Fletcher16, data);
        assert!(verify(&crc, data));
        assert!(verify(&fl, data));
        assert_eq!(&fl[2..], &[0, 0]);
    }

    #[test]
    fn verify_rejects_tampered() {
        let data = b"hello transport";
        let crc = compute(ChecksumKind::Crc32, data);
        let fl = compute(ChecksumKind::Fletcher16, data);
        assert!(!verify(&crc, b"hello transpork"));
        assert!(!verify(&fl, b"hello transpork"));
    }

    #[test]
    fn parse_kind_names() {
        assert_eq!("CRC32".parse::<ChecksumKind>().unwrap(), ChecksumKind::Crc32);
        assert_eq!(
            "fletcher16".parse::<ChecksumKind>().unwrap(),
            ChecksumKind::Fletcher16
        );
        assert!("md5".parse::<ChecksumKind>().is_err());
    }
}
