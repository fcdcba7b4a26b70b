//! Checksum primitives used by the packet framer.
//!
//! The bridge verifies two different checksums: a CRC-8 over pump command
//! payloads and an additive low-byte sum over whole packets. Neither is ever
//! checked on inbound data.

use crc::{Algorithm, CRC_8_LTE, Crc};

/// The generator the Contour Next Link uses: polynomial 0x9B, init 0,
/// unreflected, no final xor.
pub const BRIDGE_CRC: &Algorithm<u8> = &CRC_8_LTE;

/// CRC-8 calculator fixed to one algorithm for the lifetime of a session.
pub struct Crc8 {
    crc: Crc<u8>,
}

impl Crc8 {
    pub fn new(algorithm: &'static Algorithm<u8>) -> Self {
        Self {
            crc: Crc::<u8>::new(algorithm),
        }
    }

    pub fn checksum(&self, bytes: &[u8]) -> u8 {
        self.crc.checksum(bytes)
    }
}

impl Default for Crc8 {
    fn default() -> Self {
        Self::new(BRIDGE_CRC)
    }
}

/// Low 8 bits of the byte sum.
pub fn sum_lsb(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc8_known_vectors() {
        let crc = Crc8::default();
        // CRC-8/LTE check value
        assert_eq!(crc.checksum(b"123456789"), 0xEA);
        assert_eq!(crc.checksum(&[]), 0x00);
        assert_eq!(crc.checksum(&[0x00]), 0x00);
    }

    #[test]
    fn sum_lsb_wraps() {
        assert_eq!(sum_lsb(&[]), 0);
        assert_eq!(sum_lsb(&[0x01, 0x02, 0x03]), 0x06);
        assert_eq!(sum_lsb(&[0xFF, 0x02]), 0x01);
    }
}
