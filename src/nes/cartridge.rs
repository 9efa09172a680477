use std::{fmt, fs, path::Path};

use anyhow::{Context, Result};

use super::mapper::Mirroring;

/// Why a ROM image was refused. Loading either succeeds completely or
/// leaves the console without a cartridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RomError {
    IllegalPointer,
    IllegalSize,
    InvalidSignature,
    UnsupportedMapper,
    IncompleteImage,
}

impl fmt::Display for RomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RomError::IllegalPointer => write!(f, "ROM image is empty"),
            RomError::IllegalSize => write!(f, "ROM is too small to contain an iNES header"),
            RomError::InvalidSignature => {
                write!(f, "invalid iNES header magic, expected NES<EOF>")
            }
            RomError::UnsupportedMapper => write!(f, "mapper is not supported (NROM only)"),
            RomError::IncompleteImage => {
                write!(f, "ROM truncated: file ends before the declared PRG/CHR data")
            }
        }
    }
}

impl std::error::Error for RomError {}

#[derive(Debug, Clone)]
pub struct Cartridge {
    pub mapper_id: u8,
    pub mirroring: Mirroring,
    pub has_battery_backed_ram: bool,
    pub prg_rom: Vec<u8>,
    pub chr_data: Vec<u8>,
    pub chr_is_ram: bool,
}

impl Cartridge {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read ROM: {}", path.display()))?;
        Ok(Self::from_bytes(&bytes)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RomError> {
        if bytes.is_empty() {
            return Err(RomError::IllegalPointer);
        }
        if bytes.len() < 16 {
            return Err(RomError::IllegalSize);
        }
        if &bytes[0..4] != b"NES\x1A" {
            return Err(RomError::InvalidSignature);
        }

        let flags6 = bytes[6];
        let flags7 = bytes[7];

        // Headers edited by the old DiskDude tool carry its signature in
        // bytes 7..16, clobbering the upper mapper nibble. Trust only the
        // lower nibble in that case.
        let dirty_header = &bytes[7..16] == b"DiskDude!";
        let mapper_id = if dirty_header {
            flags6 >> 4
        } else {
            (flags6 >> 4) | (flags7 & 0xF0)
        };
        if mapper_id != 0 {
            return Err(RomError::UnsupportedMapper);
        }

        let four_screen = (flags6 & 0x08) != 0;
        let mirroring = if four_screen {
            Mirroring::FourScreen
        } else if (flags6 & 0x01) != 0 {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        };

        let trainer_present = (flags6 & 0x04) != 0;
        let has_battery_backed_ram = (flags6 & 0x02) != 0;

        let prg_units = bytes[4] as usize;
        let chr_units = bytes[5] as usize;
        let prg_rom_size = prg_units * 16 * 1024;
        let chr_rom_size = chr_units * 8 * 1024;

        let mut cursor = 16usize;
        if trainer_present {
            cursor += 512;
        }

        // A cartridge with no PRG bank cannot hold the reset vector.
        if prg_units == 0 || bytes.len() < cursor + prg_rom_size + chr_rom_size {
            return Err(RomError::IncompleteImage);
        }

        let prg_rom = bytes[cursor..cursor + prg_rom_size].to_vec();
        cursor += prg_rom_size;

        let (chr_data, chr_is_ram) = if chr_rom_size == 0 {
            (vec![0; 8 * 1024], true)
        } else {
            (bytes[cursor..cursor + chr_rom_size].to_vec(), false)
        };

        Ok(Self {
            mapper_id,
            mirroring,
            has_battery_backed_ram,
            prg_rom,
            chr_data,
            chr_is_ram,
        })
    }
}
