//! CRC implementations
//!
//! CRC32 comes from `crc32fast`; the other widths are table-driven with
//! tables generated at compile time. Parameters follow the variants used for
//! verify headers on disk:
//!
//! | Variant | Poly | Reflected | Init | Xor-out | Check ("123456789") |
//! |---------|------|-----------|------|---------|---------------------|
//! | CRC7 (MMC) | 0x09 | no | 0 | 0 | 0x75 |
//! | CRC16 (ARC) | 0x8005 | yes | 0 | 0 | 0xBB3D |
//! | CRC32 (IEEE) | 0x04C11DB7 | yes | !0 | !0 | 0xCBF43926 |
//! | CRC64 (ECMA-182) | 0x42F0E1EBA9EA3693 | no | 0 | 0 | 0x6C40DF5F0B497347 |

const CRC7_TABLE: [u8; 256] = build_crc7_table();
const CRC16_TABLE: [u16; 256] = build_crc16_table();
const CRC64_TABLE: [u64; 256] = build_crc64_table();

// CRC7 is kept left-aligned in a u8 (poly 0x09 << 1) so the byte loop
// needs no extra shifting.
const fn build_crc7_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u8;
        let mut bit = 0;
        while bit < 8 {
            c = if c & 0x80 != 0 { (c << 1) ^ 0x12 } else { c << 1 };
            bit += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u16;
        let mut bit = 0;
        while bit < 8 {
            c = if c & 1 != 0 { (c >> 1) ^ 0xA001 } else { c >> 1 };
            bit += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

const fn build_crc64_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = (i as u64) << 56;
        let mut bit = 0;
        while bit < 8 {
            c = if c & (1 << 63) != 0 {
                (c << 1) ^ 0x42F0_E1EB_A9EA_3693
            } else {
                c << 1
            };
            bit += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

/// CRC7 as used by MMC/SD. Result occupies the low 7 bits.
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        crc = CRC7_TABLE[(crc ^ byte) as usize];
    }
    crc >> 1
}

/// CRC16 (ARC variant, reflected 0x8005, zero init)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        crc = (crc >> 8) ^ CRC16_TABLE[((crc ^ byte as u16) & 0xff) as usize];
    }
    crc
}

/// CRC32 (IEEE 802.3)
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// CRC64 (ECMA-182, MSB first, zero init)
pub fn crc64(data: &[u8]) -> u64 {
    let mut crc = 0u64;
    for &byte in data {
        crc = CRC64_TABLE[((crc >> 56) as u8 ^ byte) as usize] ^ (crc << 8);
    }
    crc
}
