use md5::{Digest, Md5};
use std::{fs, io, path::Path};
use thiserror::Error;

use crate::mapper::Mirroring;

pub const PRG_BLOCK: usize = 16 * 1024;
pub const CHR_BLOCK: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum RomError {
    #[error("not an iNES image (bad magic)")]
    BadMagic,
    #[error("iNES header truncated")]
    TruncatedHeader,
    #[error("ROM body truncated: expected {expected} bytes of {section}, found {found}")]
    TruncatedBody {
        section: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("mapper {0} is not supported")]
    UnsupportedMapper(u8),
    #[error("failed to read ROM file: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct Cartridge {
    pub mapper_id: u8,
    pub mirroring: Mirroring,
    pub has_battery: bool,
    pub prg_rom: Vec<u8>,
    pub chr: Vec<u8>,
    pub chr_is_ram: bool,
    pub prg_ram_size: usize,
    pub md5: [u8; 16],
}

impl Cartridge {
    pub fn from_file(path: &Path) -> Result<Self, RomError> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RomError> {
        if bytes.len() >= 4 && &bytes[0..4] != b"NES\x1A" {
            return Err(RomError::BadMagic);
        }
        if bytes.len() < 16 {
            return Err(RomError::TruncatedHeader);
        }

        let flags6 = bytes[6];
        let flags7 = bytes[7];
        let is_nes2 = (flags7 & 0x0C) == 0x08;

        let mapper_id = ((flags6 >> 4) | (flags7 & 0xF0)) as u8;
        let four_screen = (flags6 & 0x08) != 0;
        let mirroring = if four_screen {
            Mirroring::FourScreen
        } else if (flags6 & 0x01) != 0 {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        };
        let has_battery = (flags6 & 0x02) != 0;
        let trainer_present = (flags6 & 0x04) != 0;

        let (prg_blocks, chr_blocks, prg_ram_size) = if is_nes2 {
            let prg_units = (((bytes[9] & 0x0F) as usize) << 8) | bytes[4] as usize;
            let chr_units = (((bytes[9] >> 4) as usize) << 8) | bytes[5] as usize;
            let prg_ram_shift = bytes[10] & 0x0F;
            let prg_ram = if prg_ram_shift == 0 {
                8 * 1024
            } else {
                64usize << prg_ram_shift
            };
            (prg_units.max(1), chr_units, prg_ram)
        } else {
            let prg_ram_units = if bytes[8] == 0 { 1 } else { bytes[8] as usize };
            (
                (bytes[4] as usize).max(1),
                bytes[5] as usize,
                prg_ram_units * 8 * 1024,
            )
        };

        let mut cursor = 16usize;
        if trainer_present {
            cursor += 512;
        }

        let prg_size = prg_blocks * PRG_BLOCK;
        if bytes.len() < cursor + prg_size {
            return Err(RomError::TruncatedBody {
                section: "PRG",
                expected: prg_size,
                found: bytes.len().saturating_sub(cursor),
            });
        }
        let prg_rom = bytes[cursor..cursor + prg_size].to_vec();
        cursor += prg_size;

        let chr_size = chr_blocks * CHR_BLOCK;
        let (chr, chr_is_ram) = if chr_size == 0 {
            (vec![0; CHR_BLOCK], true)
        } else {
            if bytes.len() < cursor + chr_size {
                return Err(RomError::TruncatedBody {
                    section: "CHR",
                    expected: chr_size,
                    found: bytes.len().saturating_sub(cursor),
                });
            }
            (bytes[cursor..cursor + chr_size].to_vec(), false)
        };

        let md5 = Md5::digest(bytes).into();

        Ok(Self {
            mapper_id,
            mirroring,
            has_battery,
            prg_rom,
            chr,
            chr_is_ram,
            prg_ram_size,
            md5,
        })
    }

    pub fn prg_block_count(&self) -> usize {
        self.prg_rom.len() / PRG_BLOCK
    }

    pub fn chr_block_count(&self) -> usize {
        self.chr.len() / CHR_BLOCK
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn build_ines(
        mapper_id: u8,
        prg_blocks: u8,
        chr_blocks: u8,
        flags6_extra: u8,
    ) -> Vec<u8> {
        let mut image = Vec::new();
        image.extend_from_slice(b"NES\x1A");
        image.push(prg_blocks);
        image.push(chr_blocks);
        image.push(((mapper_id & 0x0F) << 4) | flags6_extra);
        image.push(mapper_id & 0xF0);
        image.extend_from_slice(&[0u8; 8]);
        for block in 0..prg_blocks as usize {
            image.extend(std::iter::repeat_n((block + 1) as u8, PRG_BLOCK));
        }
        for block in 0..chr_blocks as usize {
            image.extend(std::iter::repeat_n((block + 0x41) as u8, CHR_BLOCK));
        }
        image
    }

    #[test]
    fn rejects_bad_magic() {
        let image = vec![0x4D, 0x5A, 0x00, 0x00, 0x01, 0x01];
        assert!(matches!(
            Cartridge::from_bytes(&image),
            Err(RomError::BadMagic)
        ));
    }

    #[test]
    fn rejects_short_header() {
        assert!(matches!(
            Cartridge::from_bytes(b"NES\x1A\x01"),
            Err(RomError::TruncatedHeader)
        ));
    }

    #[test]
    fn rejects_truncated_prg() {
        let mut image = build_ines(0, 2, 1, 0);
        image.truncate(16 + PRG_BLOCK);
        assert!(matches!(
            Cartridge::from_bytes(&image),
            Err(RomError::TruncatedBody { section: "PRG", .. })
        ));
    }

    #[test]
    fn parses_header_fields() {
        let image = build_ines(9, 2, 2, 0x03);
        let cart = Cartridge::from_bytes(&image).unwrap();
        assert_eq!(cart.mapper_id, 9);
        assert_eq!(cart.mirroring, Mirroring::Vertical);
        assert!(cart.has_battery);
        assert_eq!(cart.prg_block_count(), 2);
        assert_eq!(cart.chr_block_count(), 2);
        assert!(!cart.chr_is_ram);
    }

    #[test]
    fn empty_chr_becomes_ram() {
        let image = build_ines(0, 1, 0, 0);
        let cart = Cartridge::from_bytes(&image).unwrap();
        assert!(cart.chr_is_ram);
        assert_eq!(cart.chr.len(), CHR_BLOCK);
    }

    #[test]
    fn md5_distinguishes_images() {
        let a = Cartridge::from_bytes(&build_ines(0, 1, 1, 0)).unwrap();
        let b = Cartridge::from_bytes(&build_ines(0, 1, 1, 1)).unwrap();
        assert_ne!(a.md5, b.md5);
    }
}
