// Copyright 2026 the spi-nor developers
// Licensed under the Apache-2.0 and MIT licenses.

/// Byte order used when serializing an address onto the bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Endianness {
    /// Most significant address byte first: `0x012345` becomes
    /// `0x01 0x23 0x45`. This is what nearly every device expects.
    Big,
    /// Least significant address byte first: `0x012345` becomes
    /// `0x45 0x23 0x01`.
    Little,
}

/// Physical parameters and typical timings for one flash device.
///
/// All values come from the device data sheet. Setting a typical
/// duration to zero selects BUSY-pin mode for that operation: the driver
/// calls [`FlashHal::wait`](crate::FlashHal::wait) with 0 ms and relies
/// on the HAL to report when the pin indicates ready, skipping status
/// register polling entirely.
#[derive(Copy, Clone, Debug)]
pub struct FlashConfig {
    /// Total size of the flash in bytes.
    pub size: u32,
    /// Page size in bytes; must be a power of two. Program payloads are
    /// split so they never cross a page boundary.
    pub page_size: u32,
    /// Address width in bytes, 1 to 4. Typically 3.
    pub address_bytes: u8,
    /// Extra dummy bytes sent after the address on read, fast read,
    /// program and block erase commands. Typically 0. Fast read adds one
    /// further dummy byte on top of this.
    pub address_dummy_bytes: u8,
    /// Address byte order on the bus.
    pub endianness: Endianness,

    /// Typical status register write time in ms.
    pub sr_write_ms: u32,
    /// Typical page program time in ms.
    pub page_program_ms: u32,
    /// Typical page erase time in ms.
    pub page_erase_ms: u32,
    /// Typical 4 kB block erase time in ms.
    pub block_erase_4k_ms: u32,
    /// Typical 8 kB block erase time in ms.
    pub block_erase_8k_ms: u32,
    /// Typical 16 kB block erase time in ms.
    pub block_erase_16k_ms: u32,
    /// Typical 32 kB block erase time in ms.
    pub block_erase_32k_ms: u32,
    /// Typical 64 kB block erase time in ms.
    pub block_erase_64k_ms: u32,
    /// Typical chip erase time in ms.
    pub chip_erase_ms: u32,
}

impl FlashConfig {
    /// Serialize `addr` into the first `address_bytes` bytes of `out`.
    pub(crate) fn compose_address(&self, addr: u32, out: &mut [u8]) {
        let width = self.address_bytes as usize;
        for (i, byte) in out.iter_mut().take(width).enumerate() {
            let shift = match self.endianness {
                Endianness::Big => 8 * (width - 1 - i),
                Endianness::Little => 8 * i,
            };
            *byte = (addr >> shift) as u8;
        }
    }

    /// Number of bytes sent after the opcode for an addressed command.
    pub(crate) fn address_len(&self) -> usize {
        self.address_bytes as usize + self.address_dummy_bytes as usize
    }

    /// Typical erase time for an `area`-byte erase, 0 if unknown.
    pub(crate) fn erase_time_ms(&self, area: u32) -> u32 {
        if area == self.page_size {
            self.page_erase_ms
        } else {
            match area {
                0x1000 => self.block_erase_4k_ms,
                0x2000 => self.block_erase_8k_ms,
                0x4000 => self.block_erase_16k_ms,
                0x8000 => self.block_erase_32k_ms,
                0x1_0000 => self.block_erase_64k_ms,
                _ => 0,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endianness: Endianness, address_bytes: u8) -> FlashConfig {
        FlashConfig {
            size: 1 << 20,
            page_size: 256,
            address_bytes,
            address_dummy_bytes: 0,
            endianness,
            sr_write_ms: 10,
            page_program_ms: 1,
            page_erase_ms: 0,
            block_erase_4k_ms: 45,
            block_erase_8k_ms: 0,
            block_erase_16k_ms: 0,
            block_erase_32k_ms: 120,
            block_erase_64k_ms: 150,
            chip_erase_ms: 20_000,
        }
    }

    #[test]
    fn compose_address_big_endian() {
        let cfg = config(Endianness::Big, 3);
        let mut buf = [0u8; 4];
        cfg.compose_address(0x012345, &mut buf);
        assert_eq!(buf, [0x01, 0x23, 0x45, 0x00]);
    }

    #[test]
    fn compose_address_little_endian() {
        let cfg = config(Endianness::Little, 3);
        let mut buf = [0u8; 4];
        cfg.compose_address(0x012345, &mut buf);
        assert_eq!(buf, [0x45, 0x23, 0x01, 0x00]);
    }

    #[test]
    fn compose_address_four_bytes() {
        let cfg = config(Endianness::Big, 4);
        let mut buf = [0u8; 4];
        cfg.compose_address(0x0123_4567, &mut buf);
        assert_eq!(buf, [0x01, 0x23, 0x45, 0x67]);
    }

    #[test]
    fn erase_time_lookup() {
        let cfg = config(Endianness::Big, 3);
        assert_eq!(cfg.erase_time_ms(0x1000), 45);
        assert_eq!(cfg.erase_time_ms(0x8000), 120);
        assert_eq!(cfg.erase_time_ms(0x1_0000), 150);
        assert_eq!(cfg.erase_time_ms(0x2000), 0);
        // A page-sized area reports the page erase time.
        assert_eq!(cfg.erase_time_ms(256), 0);
    }
}
