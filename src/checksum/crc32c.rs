//! CRC32C (Castagnoli)
//!
//! Two backends produce identical output:
//!
//! - **Portable**: byte-wise table lookup, always available
//! - **Hardware**: the `crc32c` crate, which uses the SSE4.2 `crc32`
//!   instruction on x86_64 and the CRC extension on aarch64
//!
//! [`Crc32cBackend::detect`] picks hardware when the running CPU exposes it.

const CRC32C_TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut bit = 0;
        while bit < 8 {
            c = if c & 1 != 0 { (c >> 1) ^ 0x82F6_3B78 } else { c >> 1 };
            bit += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

/// Selected CRC32C implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crc32cBackend {
    Portable,
    Hardware,
}

impl Crc32cBackend {
    /// Pick the hardware backend if the CPU supports it
    pub fn detect() -> Self {
        if hardware_available() {
            Self::Hardware
        } else {
            Self::Portable
        }
    }

    pub fn checksum(self, data: &[u8]) -> u32 {
        match self {
            Self::Portable => crc32c_portable(data),
            Self::Hardware => crc32c_hardware(data),
        }
    }
}

/// Whether the running CPU has a CRC32C instruction
pub fn hardware_available() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        std::arch::is_x86_feature_detected!("sse4.2")
    }
    #[cfg(target_arch = "aarch64")]
    {
        std::arch::is_aarch64_feature_detected!("crc")
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        false
    }
}

/// Table-driven CRC32C
pub fn crc32c_portable(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        crc = (crc >> 8) ^ CRC32C_TABLE[((crc ^ byte as u32) & 0xff) as usize];
    }
    !crc
}

/// Accelerated CRC32C; the crate falls back to software on CPUs without
/// the instruction, so this is always safe to call.
#[inline]
pub fn crc32c_hardware(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}
