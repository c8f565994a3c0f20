//! Checksums used across the bootstrap link.
//!
//! The boot ROM confirms uploads with a plain 16 bit sum ([`sum16`]), the
//! flash loader protects each block with CRC-16/CCITT ([`crc16_ccitt`],
//! polynomial 0x1021, initial value 0, MSB first).

/// Low 8 bits of the arithmetic sum of `data`
pub fn sum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// 16 bit arithmetic sum of `data`, not complemented
pub fn sum16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
}

/// Shift one byte into a running CRC-16/CCITT value
pub fn crc16_update(mut crc: u16, byte: u8) -> u16 {
    let mut value = (byte as u16) << 8;

    for _ in 0..8 {
        if (crc ^ value) & 0x8000 != 0 {
            crc = (crc << 1) ^ 0x1021;
        } else {
            crc <<= 1;
        }
        value <<= 1;
    }

    crc
}

/// CRC-16/CCITT over `data`, starting from zero
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    data.iter().fold(0, |crc, &b| crc16_update(crc, b))
}
