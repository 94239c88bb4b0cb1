// Copyright 2026 the spi-nor developers
// Licensed under the Apache-2.0 and MIT licenses.

/// Standard SPI flash command opcodes.
///
/// These are the single-I/O opcodes shared by most 25-series memories.
/// They seed [`CommandTable::standard`]; devices with vendor-specific
/// opcodes get a hand-built table instead.
#[derive(Copy, Clone, Debug, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum Command {
    // Core instruction set.
    // These commands are almost universally available.
    WriteEnable = 0x06,
    WriteDisable = 0x04,
    PageProgram = 0x02,
    ReadData = 0x03,
    ReadStatusRegister = 0x05,
    WriteStatusRegister = 0x01,

    // Standard instruction set.
    // These commands are typically available.
    FastRead = 0x0B,
    ReadDeviceID = 0x90,
    ReadJEDECID = 0x9F,
    ChipErase = 0xC7,

    // Erase instructions.
    // Typical sizes are 4kB for sector erase, 32kB and 64kB for the two
    // block erases; page erase is a vendor extension.
    PageErase = 0x81,
    SectorErase = 0x20,
    BlockErase32 = 0x52,
    BlockErase64 = 0xD8,
}

/// Command table for one flash device.
///
/// Opcode values come from the device data sheet. An opcode of zero
/// means the device does not support that command; the driver then
/// either avoids it (erase sizes, fast read) or cannot perform the
/// operation at all.
#[derive(Copy, Clone, Debug)]
pub struct CommandTable {
    pub write_enable: u8,
    pub write_disable: u8,

    pub page_program: u8,
    pub page_erase: u8,
    pub read_data: u8,
    pub read_data_fast: u8,

    pub write_sr: u8,
    pub read_sr: u8,

    pub block_erase_4k: u8,
    pub block_erase_8k: u8,
    pub block_erase_16k: u8,
    pub block_erase_32k: u8,
    pub block_erase_64k: u8,
    pub chip_erase: u8,

    pub device_id: u8,
    pub jedec_id: u8,

    /// Mask selecting the busy flag within the status register.
    pub sr_busy_mask: u8,
}

impl CommandTable {
    /// The standard command set, as found on Winbond, Macronix, GigaDevice
    /// and many other 25-series memories. 8 kB and 16 kB block erases are
    /// not part of the standard set and are left unsupported.
    pub fn standard() -> Self {
        CommandTable {
            write_enable: Command::WriteEnable.into(),
            write_disable: Command::WriteDisable.into(),
            page_program: Command::PageProgram.into(),
            page_erase: Command::PageErase.into(),
            read_data: Command::ReadData.into(),
            read_data_fast: Command::FastRead.into(),
            write_sr: Command::WriteStatusRegister.into(),
            read_sr: Command::ReadStatusRegister.into(),
            block_erase_4k: Command::SectorErase.into(),
            block_erase_8k: 0,
            block_erase_16k: 0,
            block_erase_32k: Command::BlockErase32.into(),
            block_erase_64k: Command::BlockErase64.into(),
            chip_erase: Command::ChipErase.into(),
            device_id: Command::ReadDeviceID.into(),
            jedec_id: Command::ReadJEDECID.into(),
            sr_busy_mask: 0x01,
        }
    }

    /// Opcode for erasing `area` bytes, or `None` if unsupported.
    ///
    /// Page erase takes precedence when the area equals the page size,
    /// matching devices where the page-erase opcode shadows a same-sized
    /// block erase.
    pub(crate) fn erase_opcode(&self, page_size: u32, area: u32) -> Option<u8> {
        let opcode = if area == page_size && self.page_erase != 0 {
            self.page_erase
        } else {
            match area {
                0x1000 => self.block_erase_4k,
                0x2000 => self.block_erase_8k,
                0x4000 => self.block_erase_16k,
                0x8000 => self.block_erase_32k,
                0x1_0000 => self.block_erase_64k,
                _ => 0,
            }
        };
        if opcode == 0 {
            None
        } else {
            Some(opcode)
        }
    }
}
