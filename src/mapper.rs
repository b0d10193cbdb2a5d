use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::cartridge::{Cartridge, RomError};
use crate::save_state::SaveStateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mirroring {
    Horizontal,
    Vertical,
    OneScreenLower,
    OneScreenUpper,
    FourScreen,
}

// Announced through ppu_fetch immediately before the corresponding data
// read. Data marks non-rendering access via $2007.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PpuFetchKind {
    Nametable,
    Attribute,
    BackgroundPattern,
    SpritePattern,
    Data,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StepResult {
    pub irq: bool,
}

// Nametable storage lives on the mapper, so mirroring is entirely a mapper
// concern.
pub trait Mapper {
    fn cpu_read(&mut self, addr: u16) -> u8;
    fn cpu_write(&mut self, addr: u16, value: u8);
    fn ppu_read(&mut self, addr: u16) -> u8;
    fn ppu_write(&mut self, addr: u16, value: u8);
    fn nt_read(&mut self, addr: u16) -> u8;
    fn nt_write(&mut self, addr: u16, value: u8);
    fn mirroring(&self) -> Mirroring;

    fn has_extended_nametables(&self) -> bool {
        false
    }

    fn ppu_fetch(&mut self, _addr: u16, _kind: PpuFetchKind) {}

    // Mappers that return true get step once per PPU dot.
    fn has_step(&self) -> bool {
        false
    }

    fn step(&mut self, _scanline: i16, _dot: u16, _rendering: bool) -> StepResult {
        StepResult::default()
    }

    fn ctrl_written(&mut self, _value: u8) {}
    fn mask_written(&mut self, _value: u8) {}

    fn irq_pending(&self) -> bool {
        false
    }

    fn snapshot(&self) -> MapperState;
    fn restore(&mut self, state: &MapperState) -> Result<(), SaveStateError>;
}

pub fn mapper_name(mapper_id: u8) -> &'static str {
    match mapper_id {
        0 => "NROM",
        5 => "MMC5",
        9 => "MMC2",
        _ => "unsupported",
    }
}

pub fn create_mapper(cart: Cartridge) -> Result<Box<dyn Mapper>, RomError> {
    match cart.mapper_id {
        0 => Ok(Box::new(Nrom::new(cart))),
        5 => Ok(Box::new(Mmc5::new(cart))),
        9 => Ok(Box::new(Mmc2::new(cart))),
        id => Err(RomError::UnsupportedMapper(id)),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MapperState {
    Nrom(NromState),
    Mmc2(Mmc2State),
    Mmc5(Mmc5State),
}

fn check_len(buffer: &[u8], expected: usize) -> Result<(), SaveStateError> {
    if buffer.len() == expected {
        Ok(())
    } else {
        Err(SaveStateError::Corrupt)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NametableRam {
    ram: Vec<u8>,
}

impl NametableRam {
    fn new() -> Self {
        Self {
            ram: vec![0; 0x1000],
        }
    }

    fn index(addr: u16, mirroring: Mirroring) -> usize {
        let idx = (addr as usize).wrapping_sub(0x2000) & 0x0FFF;
        let table = idx / 0x400;
        let offset = idx % 0x400;
        let mapped = match mirroring {
            Mirroring::Horizontal => table >> 1,
            Mirroring::Vertical => table & 1,
            Mirroring::OneScreenLower => 0,
            Mirroring::OneScreenUpper => 1,
            Mirroring::FourScreen => table,
        };
        mapped * 0x400 + offset
    }

    fn read(&self, addr: u16, mirroring: Mirroring) -> u8 {
        self.ram[Self::index(addr, mirroring)]
    }

    fn write(&mut self, addr: u16, mirroring: Mirroring, value: u8) {
        self.ram[Self::index(addr, mirroring)] = value;
    }
}

// ---------------------------------------------------------------------------
// NROM (mapper 0)
// ---------------------------------------------------------------------------

pub struct Nrom {
    prg_rom: Vec<u8>,
    chr: Vec<u8>,
    chr_is_ram: bool,
    prg_ram: Vec<u8>,
    nametables: NametableRam,
    mirroring: Mirroring,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NromState {
    prg_ram: Vec<u8>,
    chr_ram: Vec<u8>,
    nametables: Vec<u8>,
    mirroring: Mirroring,
}

impl Nrom {
    fn new(cart: Cartridge) -> Self {
        Self {
            prg_rom: cart.prg_rom,
            chr: cart.chr,
            chr_is_ram: cart.chr_is_ram,
            prg_ram: vec![0; cart.prg_ram_size.max(8 * 1024)],
            nametables: NametableRam::new(),
            mirroring: cart.mirroring,
        }
    }
}

impl Mapper for Nrom {
    fn cpu_read(&mut self, addr: u16) -> u8 {
        match addr {
            0x6000..=0x7FFF => self.prg_ram[(addr as usize - 0x6000) % self.prg_ram.len()],
            0x8000..=0xFFFF => self.prg_rom[(addr as usize - 0x8000) % self.prg_rom.len()],
            _ => {
                debug!("NROM: unmapped CPU read ${addr:04X}");
                0
            }
        }
    }

    fn cpu_write(&mut self, addr: u16, value: u8) {
        match addr {
            0x6000..=0x7FFF => {
                let idx = (addr as usize - 0x6000) % self.prg_ram.len();
                self.prg_ram[idx] = value;
            }
            0x8000..=0xFFFF => {}
            _ => debug!("NROM: unmapped CPU write ${addr:04X} <- ${value:02X}"),
        }
    }

    fn ppu_read(&mut self, addr: u16) -> u8 {
        self.chr[(addr as usize) % self.chr.len()]
    }

    fn ppu_write(&mut self, addr: u16, value: u8) {
        if self.chr_is_ram {
            let idx = (addr as usize) % self.chr.len();
            self.chr[idx] = value;
        }
    }

    fn nt_read(&mut self, addr: u16) -> u8 {
        self.nametables.read(addr, self.mirroring)
    }

    fn nt_write(&mut self, addr: u16, value: u8) {
        self.nametables.write(addr, self.mirroring, value);
    }

    fn mirroring(&self) -> Mirroring {
        self.mirroring
    }

    fn snapshot(&self) -> MapperState {
        MapperState::Nrom(NromState {
            prg_ram: self.prg_ram.clone(),
            chr_ram: if self.chr_is_ram {
                self.chr.clone()
            } else {
                Vec::new()
            },
            nametables: self.nametables.ram.clone(),
            mirroring: self.mirroring,
        })
    }

    fn restore(&mut self, state: &MapperState) -> Result<(), SaveStateError> {
        let MapperState::Nrom(state) = state else {
            return Err(SaveStateError::Corrupt);
        };
        check_len(&state.prg_ram, self.prg_ram.len())?;
        check_len(&state.nametables, self.nametables.ram.len())?;
        if self.chr_is_ram {
            check_len(&state.chr_ram, self.chr.len())?;
            self.chr.copy_from_slice(&state.chr_ram);
        }
        self.prg_ram.copy_from_slice(&state.prg_ram);
        self.nametables.ram.copy_from_slice(&state.nametables);
        self.mirroring = state.mirroring;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MMC2 (mapper 9)
// ---------------------------------------------------------------------------
//
// Two 4 KiB CHR windows, each with an FD/FE candidate bank pair selected by a
// latch. The latches flip as a side effect of the PPU fetching the magic tile
// addresses, after the fetched byte has been served.

pub struct Mmc2 {
    prg_rom: Vec<u8>,
    chr: Vec<u8>,
    chr_is_ram: bool,
    prg_ram: Vec<u8>,
    nametables: NametableRam,
    mirroring: Mirroring,
    prg_bank: u8,
    chr_banks_low: [u8; 2],
    chr_banks_high: [u8; 2],
    latch_low: u8,
    latch_high: u8,
    bank_warned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mmc2State {
    prg_ram: Vec<u8>,
    chr_ram: Vec<u8>,
    nametables: Vec<u8>,
    mirroring: Mirroring,
    prg_bank: u8,
    chr_banks_low: [u8; 2],
    chr_banks_high: [u8; 2],
    latch_low: u8,
    latch_high: u8,
}

impl Mmc2 {
    fn new(cart: Cartridge) -> Self {
        Self {
            prg_rom: cart.prg_rom,
            chr: cart.chr,
            chr_is_ram: cart.chr_is_ram,
            prg_ram: vec![0; cart.prg_ram_size.max(8 * 1024)],
            nametables: NametableRam::new(),
            mirroring: cart.mirroring,
            prg_bank: 0,
            chr_banks_low: [0; 2],
            chr_banks_high: [0; 2],
            latch_low: 1,
            latch_high: 1,
            bank_warned: false,
        }
    }

    fn prg_bank_count_8k(&self) -> usize {
        (self.prg_rom.len() / 0x2000).max(1)
    }

    fn chr_bank_count_4k(&self) -> usize {
        (self.chr.len() / 0x1000).max(1)
    }

    fn read_prg_8k(&self, bank: usize, offset: usize) -> u8 {
        let bank = bank % self.prg_bank_count_8k();
        self.prg_rom[(bank * 0x2000 + offset) % self.prg_rom.len()]
    }

    fn mask_chr_bank(&mut self, bank: u8) -> usize {
        let count = self.chr_bank_count_4k();
        let bank = bank as usize;
        if bank >= count && !self.bank_warned {
            self.bank_warned = true;
            warn!("MMC2: CHR bank {bank} out of range ({count} banks), masking");
        }
        bank % count
    }

    fn map_chr(&mut self, addr: u16) -> usize {
        let bank = if addr < 0x1000 {
            self.chr_banks_low[self.latch_low as usize]
        } else {
            self.chr_banks_high[self.latch_high as usize]
        };
        let bank = self.mask_chr_bank(bank);
        (bank * 0x1000 + (addr as usize & 0x0FFF)) % self.chr.len()
    }

    fn update_latches(&mut self, addr: u16) {
        match addr & 0x1FFF {
            0x0FD8 => self.latch_low = 0,
            0x0FE8 => self.latch_low = 1,
            0x1FD8..=0x1FDF => self.latch_high = 0,
            0x1FE8..=0x1FEF => self.latch_high = 1,
            _ => {}
        }
    }
}

impl Mapper for Mmc2 {
    fn cpu_read(&mut self, addr: u16) -> u8 {
        match addr {
            0x6000..=0x7FFF => self.prg_ram[(addr as usize - 0x6000) % self.prg_ram.len()],
            0x8000..=0x9FFF => self.read_prg_8k(self.prg_bank as usize, addr as usize - 0x8000),
            0xA000..=0xBFFF => {
                let banks = self.prg_bank_count_8k();
                self.read_prg_8k(banks.saturating_sub(3), addr as usize - 0xA000)
            }
            0xC000..=0xDFFF => {
                let banks = self.prg_bank_count_8k();
                self.read_prg_8k(banks.saturating_sub(2), addr as usize - 0xC000)
            }
            0xE000..=0xFFFF => {
                let banks = self.prg_bank_count_8k();
                self.read_prg_8k(banks.saturating_sub(1), addr as usize - 0xE000)
            }
            _ => {
                debug!("MMC2: unmapped CPU read ${addr:04X}");
                0
            }
        }
    }

    fn cpu_write(&mut self, addr: u16, value: u8) {
        match addr {
            0x6000..=0x7FFF => {
                let idx = (addr as usize - 0x6000) % self.prg_ram.len();
                self.prg_ram[idx] = value;
            }
            0xA000..=0xAFFF => self.prg_bank = value & 0x0F,
            0xB000..=0xBFFF => self.chr_banks_low[0] = value & 0x1F,
            0xC000..=0xCFFF => self.chr_banks_low[1] = value & 0x1F,
            0xD000..=0xDFFF => self.chr_banks_high[0] = value & 0x1F,
            0xE000..=0xEFFF => self.chr_banks_high[1] = value & 0x1F,
            0xF000..=0xFFFF => {
                self.mirroring = if (value & 0x01) == 0 {
                    Mirroring::Vertical
                } else {
                    Mirroring::Horizontal
                };
            }
            _ => debug!("MMC2: unmapped CPU write ${addr:04X} <- ${value:02X}"),
        }
    }

    fn ppu_read(&mut self, addr: u16) -> u8 {
        let idx = self.map_chr(addr & 0x1FFF);
        let value = self.chr[idx];
        // Latch update takes effect only after this byte is served.
        self.update_latches(addr);
        value
    }

    fn ppu_write(&mut self, addr: u16, value: u8) {
        if self.chr_is_ram {
            let idx = self.map_chr(addr & 0x1FFF);
            self.chr[idx] = value;
        }
    }

    fn nt_read(&mut self, addr: u16) -> u8 {
        self.nametables.read(addr, self.mirroring)
    }

    fn nt_write(&mut self, addr: u16, value: u8) {
        self.nametables.write(addr, self.mirroring, value);
    }

    fn mirroring(&self) -> Mirroring {
        self.mirroring
    }

    fn snapshot(&self) -> MapperState {
        MapperState::Mmc2(Mmc2State {
            prg_ram: self.prg_ram.clone(),
            chr_ram: if self.chr_is_ram {
                self.chr.clone()
            } else {
                Vec::new()
            },
            nametables: self.nametables.ram.clone(),
            mirroring: self.mirroring,
            prg_bank: self.prg_bank,
            chr_banks_low: self.chr_banks_low,
            chr_banks_high: self.chr_banks_high,
            latch_low: self.latch_low,
            latch_high: self.latch_high,
        })
    }

    fn restore(&mut self, state: &MapperState) -> Result<(), SaveStateError> {
        let MapperState::Mmc2(state) = state else {
            return Err(SaveStateError::Corrupt);
        };
        check_len(&state.prg_ram, self.prg_ram.len())?;
        check_len(&state.nametables, self.nametables.ram.len())?;
        if self.chr_is_ram {
            check_len(&state.chr_ram, self.chr.len())?;
            self.chr.copy_from_slice(&state.chr_ram);
        }
        self.prg_ram.copy_from_slice(&state.prg_ram);
        self.nametables.ram.copy_from_slice(&state.nametables);
        self.mirroring = state.mirroring;
        self.prg_bank = state.prg_bank;
        self.chr_banks_low = state.chr_banks_low;
        self.chr_banks_high = state.chr_banks_high;
        self.latch_low = state.latch_low & 0x01;
        self.latch_high = state.latch_high & 0x01;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MMC5 (mapper 5)
// ---------------------------------------------------------------------------
//
// Closer to a co-processor than a bank switcher: four PRG modes, four CHR
// modes with separate sprite/background register sets in 8x16 sprite mode,
// per-quadrant nametable mapping backed by two onboard VRAM pages plus ExRAM
// and a fill mode, a vertical split, a scanline IRQ generator and a hardware
// multiplier.

const EXRAM_SIZE: usize = 0x400;
const MMC5_VRAM_SIZE: usize = 0x800;
const MMC5_SRAM_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrgTarget {
    Rom,
    Ram,
}

pub struct Mmc5 {
    prg_rom: Vec<u8>,
    chr: Vec<u8>,
    chr_is_ram: bool,
    prg_ram: Vec<u8>,
    vram: Vec<u8>,
    exram: Vec<u8>,

    prg_mode: u8,
    chr_mode: u8,
    exram_mode: u8,
    nametable_map: [u8; 4],
    fill_tile: u8,
    fill_color: u8,
    prg_ram_protect: [u8; 2],
    sram_bank: u8,
    prg_regs: [u8; 4],
    chr_regs_sprite: [u16; 8],
    chr_regs_bg: [u16; 4],
    chr_upper: u8,
    last_chr_set_bg: bool,

    split_enable: bool,
    split_right: bool,
    split_tile: u8,
    split_scroll: u8,
    split_bank: u8,

    irq_compare: u8,
    irq_enable: bool,
    irq_pending: bool,
    in_frame: bool,

    mul_a: u8,
    mul_b: u8,

    ppuctrl: u8,
    ppumask: u8,

    // Transient fetch-phase tracking fed by `step` and `ppu_fetch`.
    cur_scanline: i16,
    cur_dot: u16,
    rendering: bool,
    last_fetch: PpuFetchKind,
    fetches_this_scanline: u8,
    exattr_byte: u8,

    bank_warned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mmc5State {
    prg_ram: Vec<u8>,
    chr_ram: Vec<u8>,
    vram: Vec<u8>,
    exram: Vec<u8>,
    prg_mode: u8,
    chr_mode: u8,
    exram_mode: u8,
    nametable_map: [u8; 4],
    fill_tile: u8,
    fill_color: u8,
    prg_ram_protect: [u8; 2],
    sram_bank: u8,
    prg_regs: [u8; 4],
    chr_regs_sprite: [u16; 8],
    chr_regs_bg: [u16; 4],
    chr_upper: u8,
    last_chr_set_bg: bool,
    split_enable: bool,
    split_right: bool,
    split_tile: u8,
    split_scroll: u8,
    split_bank: u8,
    irq_compare: u8,
    irq_enable: bool,
    irq_pending: bool,
    in_frame: bool,
    mul_a: u8,
    mul_b: u8,
    ppuctrl: u8,
    ppumask: u8,
    fetches_this_scanline: u8,
}

impl Mmc5 {
    fn new(cart: Cartridge) -> Self {
        Self {
            prg_rom: cart.prg_rom,
            chr: cart.chr,
            chr_is_ram: cart.chr_is_ram,
            prg_ram: vec![0; MMC5_SRAM_SIZE],
            vram: vec![0; MMC5_VRAM_SIZE],
            exram: vec![0; EXRAM_SIZE],
            prg_mode: 3,
            chr_mode: 3,
            exram_mode: 0,
            nametable_map: [0, 1, 0, 1],
            fill_tile: 0,
            fill_color: 0,
            prg_ram_protect: [0; 2],
            sram_bank: 0,
            prg_regs: [0x80, 0x80, 0x80, 0xFF],
            chr_regs_sprite: [0, 1, 2, 3, 4, 5, 6, 7],
            chr_regs_bg: [0, 1, 2, 3],
            chr_upper: 0,
            last_chr_set_bg: false,
            split_enable: false,
            split_right: false,
            split_tile: 0,
            split_scroll: 0,
            split_bank: 0,
            irq_compare: 0,
            irq_enable: false,
            irq_pending: false,
            in_frame: false,
            mul_a: 0xFF,
            mul_b: 0xFF,
            ppuctrl: 0,
            ppumask: 0,
            cur_scanline: -1,
            cur_dot: 0,
            rendering: false,
            last_fetch: PpuFetchKind::Data,
            fetches_this_scanline: 0,
            exattr_byte: 0,
            bank_warned: false,
        }
    }

    fn prg_rom_bank_count_8k(&self) -> usize {
        (self.prg_rom.len() / 0x2000).max(1)
    }

    fn chr_bank_count_1k(&self) -> usize {
        (self.chr.len() / 0x0400).max(1)
    }

    fn prg_ram_write_enabled(&self) -> bool {
        (self.prg_ram_protect[0] & 0x03) == 0x02 && (self.prg_ram_protect[1] & 0x03) == 0x01
    }

    fn sprite_8x16_active(&self) -> bool {
        (self.ppuctrl & 0x20) != 0 && (self.ppumask & 0x18) != 0
    }

    fn mask_bank(&mut self, bank: usize, count: usize, what: &'static str) -> usize {
        if bank >= count && !self.bank_warned {
            self.bank_warned = true;
            warn!("MMC5: {what} bank {bank} out of range ({count} banks), masking");
        }
        bank % count
    }

    // $5114-$5117 address 8 KiB units; wider windows ignore the low
    // register bits and fold the CPU offset back in.
    fn window_bank(reg: u8, window_kb: u8, window_offset: usize) -> usize {
        match window_kb {
            8 => (reg & 0x7F) as usize,
            16 => ((reg & 0x7E) as usize) + ((window_offset >> 13) & 0x01),
            32 => ((reg & 0x7C) as usize) + ((window_offset >> 13) & 0x03),
            _ => 0,
        }
    }

    fn map_prg(&self, addr: u16) -> Option<(PrgTarget, usize, usize)> {
        if (0x6000..=0x7FFF).contains(&addr) {
            let bank = (self.sram_bank & 0x0F) as usize;
            return Some((PrgTarget::Ram, bank, addr as usize - 0x6000));
        }
        if addr < 0x8000 {
            return None;
        }

        let (reg, window_kb, window_offset, force_rom) = match self.prg_mode & 0x03 {
            0 => (self.prg_regs[3], 32, addr as usize - 0x8000, true),
            1 => {
                if addr < 0xC000 {
                    (self.prg_regs[1], 16, addr as usize - 0x8000, false)
                } else {
                    (self.prg_regs[3], 16, addr as usize - 0xC000, true)
                }
            }
            2 => {
                if addr < 0xC000 {
                    (self.prg_regs[1], 16, addr as usize - 0x8000, false)
                } else if addr < 0xE000 {
                    (self.prg_regs[2], 8, addr as usize - 0xC000, false)
                } else {
                    (self.prg_regs[3], 8, addr as usize - 0xE000, true)
                }
            }
            _ => {
                if addr < 0xA000 {
                    (self.prg_regs[0], 8, addr as usize - 0x8000, false)
                } else if addr < 0xC000 {
                    (self.prg_regs[1], 8, addr as usize - 0xA000, false)
                } else if addr < 0xE000 {
                    (self.prg_regs[2], 8, addr as usize - 0xC000, false)
                } else {
                    (self.prg_regs[3], 8, addr as usize - 0xE000, true)
                }
            }
        };

        let target = if force_rom || (reg & 0x80) != 0 {
            PrgTarget::Rom
        } else {
            PrgTarget::Ram
        };
        let bank = Self::window_bank(reg, window_kb, window_offset);
        Some((target, bank, window_offset & 0x1FFF))
    }

    fn read_prg(&mut self, addr: u16) -> u8 {
        match self.map_prg(addr) {
            Some((PrgTarget::Rom, bank, offset)) => {
                let bank = self.mask_bank(bank, self.prg_rom_bank_count_8k(), "PRG ROM");
                self.prg_rom[(bank * 0x2000 + offset) % self.prg_rom.len()]
            }
            Some((PrgTarget::Ram, bank, offset)) => {
                let idx = (bank * 0x2000 + offset) % self.prg_ram.len();
                self.prg_ram[idx]
            }
            None => {
                debug!("MMC5: unmapped CPU read ${addr:04X}");
                0
            }
        }
    }

    fn write_prg(&mut self, addr: u16, value: u8) {
        if !self.prg_ram_write_enabled() {
            return;
        }
        if let Some((PrgTarget::Ram, bank, offset)) = self.map_prg(addr) {
            let idx = (bank * 0x2000 + offset) % self.prg_ram.len();
            self.prg_ram[idx] = value;
        }
    }

    // The background register set only covers four slots and repeats over
    // both pattern halves.
    fn map_chr(&mut self, addr: u16, bg_set: bool) -> usize {
        let slot = ((addr as usize) & 0x1FFF) / 0x0400;
        let offset = (addr as usize) & 0x03FF;

        let bank_1k = if bg_set {
            match self.chr_mode & 0x03 {
                0 => self.chr_regs_bg[3] as usize * 8 + (slot & 0x07),
                1 => self.chr_regs_bg[3] as usize * 4 + (slot & 0x03),
                2 => {
                    let reg = if (slot & 0x03) < 2 {
                        self.chr_regs_bg[1]
                    } else {
                        self.chr_regs_bg[3]
                    };
                    reg as usize * 2 + (slot & 0x01)
                }
                _ => self.chr_regs_bg[slot & 0x03] as usize,
            }
        } else {
            match self.chr_mode & 0x03 {
                0 => self.chr_regs_sprite[7] as usize * 8 + slot,
                1 => {
                    let reg = if slot < 4 {
                        self.chr_regs_sprite[3]
                    } else {
                        self.chr_regs_sprite[7]
                    };
                    reg as usize * 4 + (slot & 0x03)
                }
                2 => {
                    let reg = match slot {
                        0 | 1 => self.chr_regs_sprite[1],
                        2 | 3 => self.chr_regs_sprite[3],
                        4 | 5 => self.chr_regs_sprite[5],
                        _ => self.chr_regs_sprite[7],
                    };
                    reg as usize * 2 + (slot & 0x01)
                }
                _ => self.chr_regs_sprite[slot] as usize,
            }
        };

        let bank = self.mask_bank(bank_1k, self.chr_bank_count_1k(), "CHR");
        bank * 0x0400 + offset
    }

    fn fill_attribute_byte(&self) -> u8 {
        let bits = self.fill_color & 0x03;
        bits | (bits << 2) | (bits << 4) | (bits << 6)
    }

    fn extended_attributes_active(&self) -> bool {
        self.exram_mode == 1 && self.rendering
    }

    // Dots 321-336 prefetch columns 0-1 of the next line; dots 1-256 fetch
    // columns 2-33.
    fn fetch_tile_column(&self) -> Option<u8> {
        match self.cur_dot {
            321..=336 => Some(((self.cur_dot - 321) / 8) as u8),
            1..=256 => Some(((self.cur_dot - 1) / 8) as u8 + 2),
            _ => None,
        }
    }

    fn split_active(&self) -> Option<(u8, u16)> {
        if !self.split_enable || self.exram_mode > 1 || !self.rendering {
            return None;
        }
        let column = self.fetch_tile_column()?;
        let inside = if self.split_right {
            column >= (self.split_tile & 0x1F)
        } else {
            column < (self.split_tile & 0x1F)
        };
        if !inside {
            return None;
        }
        // Dots 321+ prefetch the next scanline.
        let line = if self.cur_dot >= 321 {
            self.cur_scanline + 1
        } else {
            self.cur_scanline
        };
        let mut row = line + self.split_scroll as i16;
        if row >= 240 {
            row -= 240;
        }
        Some((column, row.clamp(0, 239) as u16))
    }

    fn chr_upper_base(&self) -> usize {
        ((self.chr_upper & 0x03) as usize) << 8
    }

    fn nametable_source_read(&mut self, addr: u16) -> u8 {
        let idx = (addr as usize).wrapping_sub(0x2000) & 0x0FFF;
        let quadrant = idx / 0x400;
        let offset = idx % 0x400;

        match self.nametable_map[quadrant] & 0x03 {
            page @ (0 | 1) => self.vram[(page as usize) * 0x400 + offset],
            2 => {
                if self.exram_mode <= 1 {
                    self.exram[offset]
                } else {
                    0
                }
            }
            _ => {
                if offset < 0x3C0 {
                    self.fill_tile
                } else {
                    self.fill_attribute_byte()
                }
            }
        }
    }
}

impl Mapper for Mmc5 {
    fn cpu_read(&mut self, addr: u16) -> u8 {
        // The NMI vector fetch is the fallback that tells the MMC5 the PPU
        // has stopped rendering this frame.
        if addr == 0xFFFA || addr == 0xFFFB {
            self.in_frame = false;
        }

        match addr {
            0x5203 => self.irq_compare,
            0x5204 => {
                let status = (u8::from(self.irq_pending) << 7) | (u8::from(self.in_frame) << 6);
                self.irq_pending = false;
                status
            }
            0x5205 => ((self.mul_a as u16 * self.mul_b as u16) & 0xFF) as u8,
            0x5206 => ((self.mul_a as u16 * self.mul_b as u16) >> 8) as u8,
            0x5C00..=0x5FFF => {
                if self.exram_mode >= 2 {
                    self.exram[(addr as usize) - 0x5C00]
                } else {
                    0
                }
            }
            0x6000..=0xFFFF => self.read_prg(addr),
            _ => {
                debug!("MMC5: unmapped CPU read ${addr:04X}");
                0
            }
        }
    }

    fn cpu_write(&mut self, addr: u16, value: u8) {
        match addr {
            // APU-like sound registers; not modeled.
            0x5000..=0x5015 => {}
            0x5100 => self.prg_mode = value & 0x03,
            0x5101 => self.chr_mode = value & 0x03,
            0x5102 => self.prg_ram_protect[0] = value & 0x03,
            0x5103 => self.prg_ram_protect[1] = value & 0x03,
            0x5104 => self.exram_mode = value & 0x03,
            0x5105 => {
                for (quadrant, slot) in self.nametable_map.iter_mut().enumerate() {
                    *slot = (value >> (quadrant * 2)) & 0x03;
                }
            }
            0x5106 => self.fill_tile = value,
            0x5107 => self.fill_color = value & 0x03,
            0x5113 => self.sram_bank = value & 0x0F,
            0x5114..=0x5117 => self.prg_regs[(addr - 0x5114) as usize] = value,
            0x5120..=0x5127 => {
                let reg = (addr - 0x5120) as usize;
                self.chr_regs_sprite[reg] = ((self.chr_upper_base()) | value as usize) as u16;
                self.last_chr_set_bg = false;
            }
            0x5128..=0x512B => {
                let reg = (addr - 0x5128) as usize;
                self.chr_regs_bg[reg] = ((self.chr_upper_base()) | value as usize) as u16;
                self.last_chr_set_bg = true;
            }
            0x5130 => self.chr_upper = value & 0x03,
            0x5200 => {
                self.split_enable = (value & 0x80) != 0;
                self.split_right = (value & 0x40) != 0;
                self.split_tile = value & 0x1F;
            }
            0x5201 => self.split_scroll = value,
            0x5202 => self.split_bank = value,
            0x5203 => self.irq_compare = value,
            0x5204 => self.irq_enable = (value & 0x80) != 0,
            0x5205 => self.mul_a = value,
            0x5206 => self.mul_b = value,
            0x5C00..=0x5FFF => {
                // Mode 3 is read-only ExRAM.
                if self.exram_mode != 3 {
                    self.exram[(addr as usize) - 0x5C00] = value;
                }
            }
            0x6000..=0xFFFF => self.write_prg(addr, value),
            _ => debug!("MMC5: unmapped CPU write ${addr:04X} <- ${value:02X}"),
        }
    }

    fn ppu_read(&mut self, addr: u16) -> u8 {
        let addr = addr & 0x1FFF;

        // Background fetches inside the vertical split ignore the normal
        // banking and read from the split bank with the split's own fine Y.
        if self.last_fetch == PpuFetchKind::BackgroundPattern
            && let Some((_, row)) = self.split_active()
        {
            let bank = self.mask_bank(
                (self.chr_upper_base() >> 2) | self.split_bank as usize,
                (self.chr.len() / 0x1000).max(1),
                "split CHR",
            );
            let pattern = (addr as usize & 0x0FF8) | (row as usize & 0x07);
            return self.chr[(bank * 0x1000 + pattern) % self.chr.len()];
        }

        // Extended attribute mode replaces the background bank with the one
        // named by the ExRAM byte latched at the nametable fetch.
        if self.last_fetch == PpuFetchKind::BackgroundPattern && self.extended_attributes_active() {
            let bank_4k = self.chr_upper_base() >> 2 | (self.exattr_byte & 0x3F) as usize;
            let bank = self.mask_bank(bank_4k, (self.chr.len() / 0x1000).max(1), "ExAttr CHR");
            return self.chr[(bank * 0x1000 + (addr as usize & 0x0FFF)) % self.chr.len()];
        }

        let bg_set = self.sprite_8x16_active()
            && match self.last_fetch {
                PpuFetchKind::BackgroundPattern => true,
                PpuFetchKind::SpritePattern => false,
                _ => self.last_chr_set_bg,
            };
        let idx = self.map_chr(addr, bg_set);
        self.chr[idx % self.chr.len()]
    }

    fn ppu_write(&mut self, addr: u16, value: u8) {
        if self.chr_is_ram {
            let idx = self.map_chr(addr & 0x1FFF, false) % self.chr.len();
            self.chr[idx] = value;
        }
    }

    fn nt_read(&mut self, addr: u16) -> u8 {
        let offset = (addr as usize).wrapping_sub(0x2000) & 0x03FF;

        if let Some((column, row)) = self.split_active() {
            let is_attribute = self.last_fetch == PpuFetchKind::Attribute || offset >= 0x3C0;
            let column = (column & 0x1F) as usize;
            let row = row as usize;
            return if is_attribute {
                self.exram[0x3C0 + (row / 32) * 8 + column / 4]
            } else {
                self.exram[(row / 8) * 32 + column]
            };
        }

        if self.extended_attributes_active() {
            match self.last_fetch {
                PpuFetchKind::Nametable => {
                    self.exattr_byte = self.exram[offset];
                }
                PpuFetchKind::Attribute => {
                    let bits = (self.exattr_byte >> 6) & 0x03;
                    return bits | (bits << 2) | (bits << 4) | (bits << 6);
                }
                _ => {}
            }
        }

        self.nametable_source_read(addr)
    }

    fn nt_write(&mut self, addr: u16, value: u8) {
        let idx = (addr as usize).wrapping_sub(0x2000) & 0x0FFF;
        let quadrant = idx / 0x400;
        let offset = idx % 0x400;

        match self.nametable_map[quadrant] & 0x03 {
            page @ (0 | 1) => self.vram[(page as usize) * 0x400 + offset] = value,
            2 => {
                if self.exram_mode <= 1 {
                    self.exram[offset] = value;
                }
            }
            // Fill mode has no backing storage.
            _ => {}
        }
    }

    fn mirroring(&self) -> Mirroring {
        Mirroring::FourScreen
    }

    fn has_extended_nametables(&self) -> bool {
        true
    }

    fn ppu_fetch(&mut self, _addr: u16, kind: PpuFetchKind) {
        self.last_fetch = kind;
        if kind == PpuFetchKind::Nametable {
            self.fetches_this_scanline = self.fetches_this_scanline.saturating_add(1);
        }
    }

    fn has_step(&self) -> bool {
        true
    }

    fn step(&mut self, scanline: i16, dot: u16, rendering: bool) -> StepResult {
        self.cur_scanline = scanline;
        self.cur_dot = dot;
        self.rendering = rendering;

        if dot == 0 {
            self.fetches_this_scanline = 0;
            self.in_frame = (0..=240).contains(&scanline);
            if self.irq_compare > 0 && scanline == self.irq_compare as i16 {
                self.irq_pending = true;
            }
        }

        StepResult {
            irq: self.irq_pending && self.irq_enable,
        }
    }

    fn ctrl_written(&mut self, value: u8) {
        self.ppuctrl = value;
    }

    fn mask_written(&mut self, value: u8) {
        self.ppumask = value;
    }

    fn irq_pending(&self) -> bool {
        self.irq_pending && self.irq_enable
    }

    fn snapshot(&self) -> MapperState {
        MapperState::Mmc5(Mmc5State {
            prg_ram: self.prg_ram.clone(),
            chr_ram: if self.chr_is_ram {
                self.chr.clone()
            } else {
                Vec::new()
            },
            vram: self.vram.clone(),
            exram: self.exram.clone(),
            prg_mode: self.prg_mode,
            chr_mode: self.chr_mode,
            exram_mode: self.exram_mode,
            nametable_map: self.nametable_map,
            fill_tile: self.fill_tile,
            fill_color: self.fill_color,
            prg_ram_protect: self.prg_ram_protect,
            sram_bank: self.sram_bank,
            prg_regs: self.prg_regs,
            chr_regs_sprite: self.chr_regs_sprite,
            chr_regs_bg: self.chr_regs_bg,
            chr_upper: self.chr_upper,
            last_chr_set_bg: self.last_chr_set_bg,
            split_enable: self.split_enable,
            split_right: self.split_right,
            split_tile: self.split_tile,
            split_scroll: self.split_scroll,
            split_bank: self.split_bank,
            irq_compare: self.irq_compare,
            irq_enable: self.irq_enable,
            irq_pending: self.irq_pending,
            in_frame: self.in_frame,
            mul_a: self.mul_a,
            mul_b: self.mul_b,
            ppuctrl: self.ppuctrl,
            ppumask: self.ppumask,
            fetches_this_scanline: self.fetches_this_scanline,
        })
    }

    fn restore(&mut self, state: &MapperState) -> Result<(), SaveStateError> {
        let MapperState::Mmc5(state) = state else {
            return Err(SaveStateError::Corrupt);
        };
        check_len(&state.prg_ram, self.prg_ram.len())?;
        check_len(&state.vram, self.vram.len())?;
        check_len(&state.exram, self.exram.len())?;
        if self.chr_is_ram {
            check_len(&state.chr_ram, self.chr.len())?;
            self.chr.copy_from_slice(&state.chr_ram);
        }
        self.prg_ram.copy_from_slice(&state.prg_ram);
        self.vram.copy_from_slice(&state.vram);
        self.exram.copy_from_slice(&state.exram);
        self.prg_mode = state.prg_mode;
        self.chr_mode = state.chr_mode;
        self.exram_mode = state.exram_mode;
        self.nametable_map = state.nametable_map;
        self.fill_tile = state.fill_tile;
        self.fill_color = state.fill_color;
        self.prg_ram_protect = state.prg_ram_protect;
        self.sram_bank = state.sram_bank;
        self.prg_regs = state.prg_regs;
        self.chr_regs_sprite = state.chr_regs_sprite;
        self.chr_regs_bg = state.chr_regs_bg;
        self.chr_upper = state.chr_upper;
        self.last_chr_set_bg = state.last_chr_set_bg;
        self.split_enable = state.split_enable;
        self.split_right = state.split_right;
        self.split_tile = state.split_tile;
        self.split_scroll = state.split_scroll;
        self.split_bank = state.split_bank;
        self.irq_compare = state.irq_compare;
        self.irq_enable = state.irq_enable;
        self.irq_pending = state.irq_pending;
        self.in_frame = state.in_frame;
        self.mul_a = state.mul_a;
        self.mul_b = state.mul_b;
        self.ppuctrl = state.ppuctrl;
        self.ppumask = state.ppumask;
        self.fetches_this_scanline = state.fetches_this_scanline;
        self.last_fetch = PpuFetchKind::Data;
        Ok(())
    }
}
