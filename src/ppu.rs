use serde::{Deserialize, Serialize};

use crate::mapper::{Mapper, PpuFetchKind};
use crate::palette::MASTER_PALETTE;
use crate::save_state::SaveStateError;

pub const FRAME_WIDTH: usize = 256;
pub const FRAME_HEIGHT: usize = 240;

pub const PRE_RENDER_SCANLINE: i16 = -1;
pub const VBLANK_SCANLINE: i16 = 241;
pub const LAST_SCANLINE: i16 = 260;
pub const DOTS_PER_SCANLINE: u16 = 341;

const CTRL_NMI_ENABLE: u8 = 0x80;
const CTRL_SPRITE_SIZE_16: u8 = 0x20;
const CTRL_BG_TABLE: u8 = 0x10;
const CTRL_SPRITE_TABLE: u8 = 0x08;
const CTRL_VRAM_INC_32: u8 = 0x04;

const MASK_SHOW_SPRITES: u8 = 0x10;
const MASK_SHOW_BG: u8 = 0x08;
const MASK_SHOW_SPRITE_LEFT: u8 = 0x04;
const MASK_SHOW_BG_LEFT: u8 = 0x02;

const STATUS_VBLANK: u8 = 0x80;
const STATUS_SPRITE_ZERO_HIT: u8 = 0x40;
const STATUS_SPRITE_OVERFLOW: u8 = 0x20;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct SpriteSlot {
    x: u8,
    attributes: u8,
    pattern_lo: u8,
    pattern_hi: u8,
    oam_index: u8,
}

pub struct Ppu {
    scanline: i16,
    dot: u16,
    odd_frame: bool,
    frame_complete: bool,

    ctrl: u8,
    mask: u8,
    status: u8,
    oam_addr: u8,

    v: u16,
    t: u16,
    fine_x: u8,
    write_toggle: bool,
    read_buffer: u8,
    open_bus: u8,

    oam: [u8; 256],
    secondary_oam: [u8; 32],
    palette_ram: [u8; 32],

    nt_latch: u8,
    at_latch: u8,
    pattern_lo_latch: u8,
    pattern_hi_latch: u8,
    bg_pattern_lo: u16,
    bg_pattern_hi: u16,
    bg_attr_lo: u16,
    bg_attr_hi: u16,

    sprites: [SpriteSlot; 8],
    sprite_count: u8,

    nmi_line: bool,
    nmi_pending: bool,

    frame_buffer: Vec<u32>,
}

// The framebuffer is reconstructed by rendering and is not part of the state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PpuState {
    scanline: i16,
    dot: u16,
    odd_frame: bool,
    ctrl: u8,
    mask: u8,
    status: u8,
    oam_addr: u8,
    v: u16,
    t: u16,
    fine_x: u8,
    write_toggle: bool,
    read_buffer: u8,
    open_bus: u8,
    oam: Vec<u8>,
    secondary_oam: Vec<u8>,
    palette_ram: Vec<u8>,
    nt_latch: u8,
    at_latch: u8,
    pattern_lo_latch: u8,
    pattern_hi_latch: u8,
    bg_pattern_lo: u16,
    bg_pattern_hi: u16,
    bg_attr_lo: u16,
    bg_attr_hi: u16,
    sprites: [SpriteSlot; 8],
    sprite_count: u8,
    nmi_line: bool,
    nmi_pending: bool,
}

impl Ppu {
    pub fn new() -> Self {
        Self {
            scanline: PRE_RENDER_SCANLINE,
            dot: 0,
            odd_frame: false,
            frame_complete: false,
            ctrl: 0,
            mask: 0,
            status: 0,
            oam_addr: 0,
            v: 0,
            t: 0,
            fine_x: 0,
            write_toggle: false,
            read_buffer: 0,
            open_bus: 0,
            oam: [0; 256],
            secondary_oam: [0; 32],
            palette_ram: [0x0F; 32],
            nt_latch: 0,
            at_latch: 0,
            pattern_lo_latch: 0,
            pattern_hi_latch: 0,
            bg_pattern_lo: 0,
            bg_pattern_hi: 0,
            bg_attr_lo: 0,
            bg_attr_hi: 0,
            sprites: [SpriteSlot::default(); 8],
            sprite_count: 0,
            nmi_line: false,
            nmi_pending: false,
            frame_buffer: vec![0xFF000000; FRAME_WIDTH * FRAME_HEIGHT],
        }
    }

    pub fn reset(&mut self) {
        let frame_buffer = std::mem::take(&mut self.frame_buffer);
        *self = Self::new();
        self.frame_buffer = frame_buffer;
        self.frame_buffer.fill(0xFF000000);
    }

    pub fn frame(&self) -> &[u32] {
        &self.frame_buffer
    }

    // The (scanline, dot) the next tick will process.
    pub fn position(&self) -> (i16, u16) {
        (self.scanline, self.dot)
    }

    pub fn rendering_enabled(&self) -> bool {
        (self.mask & (MASK_SHOW_BG | MASK_SHOW_SPRITES)) != 0
    }

    pub fn frame_complete(&self) -> bool {
        self.frame_complete
    }

    pub fn clear_frame_complete(&mut self) {
        self.frame_complete = false;
    }

    pub fn take_nmi(&mut self) -> bool {
        std::mem::take(&mut self.nmi_pending)
    }

    pub fn oam_dma(&mut self, bytes: &[u8; 256]) {
        for byte in bytes {
            self.oam[self.oam_addr as usize] = *byte;
            self.oam_addr = self.oam_addr.wrapping_add(1);
        }
    }

    pub fn read_register(&mut self, addr: u16, mapper: &mut dyn Mapper) -> u8 {
        let value = match addr & 0x0007 {
            2 => {
                let value = (self.status & 0xE0) | (self.open_bus & 0x1F);
                self.status &= !STATUS_VBLANK;
                self.write_toggle = false;
                self.update_nmi_line();
                value
            }
            4 => self.oam[self.oam_addr as usize],
            7 => {
                let ppu_addr = self.v & 0x3FFF;
                let value = self.bus_read(ppu_addr, PpuFetchKind::Data, mapper);
                let result = if ppu_addr >= 0x3F00 {
                    // Palette reads bypass the buffer but refill it from the
                    // nametable underneath.
                    self.read_buffer =
                        self.bus_read(ppu_addr - 0x1000, PpuFetchKind::Data, mapper);
                    value
                } else {
                    std::mem::replace(&mut self.read_buffer, value)
                };
                self.increment_vram_addr();
                result
            }
            _ => self.open_bus,
        };
        self.open_bus = value;
        value
    }

    pub fn write_register(&mut self, addr: u16, value: u8, mapper: &mut dyn Mapper) {
        self.open_bus = value;
        match addr & 0x0007 {
            0 => {
                self.ctrl = value;
                self.t = (self.t & !0x0C00) | (((value as u16) & 0x03) << 10);
                mapper.ctrl_written(value);
                self.update_nmi_line();
            }
            1 => {
                self.mask = value;
                mapper.mask_written(value);
            }
            3 => self.oam_addr = value,
            4 => {
                self.oam[self.oam_addr as usize] = value;
                self.oam_addr = self.oam_addr.wrapping_add(1);
            }
            5 => {
                if !self.write_toggle {
                    self.fine_x = value & 0x07;
                    self.t = (self.t & !0x001F) | ((value as u16) >> 3);
                } else {
                    self.t = (self.t & !0x03E0) | ((((value as u16) >> 3) & 0x001F) << 5);
                    self.t = (self.t & !0x7000) | (((value as u16) & 0x07) << 12);
                }
                self.write_toggle = !self.write_toggle;
            }
            6 => {
                if !self.write_toggle {
                    self.t = (self.t & 0x00FF) | (((value as u16) & 0x3F) << 8);
                } else {
                    self.t = (self.t & 0x7F00) | (value as u16);
                    self.v = self.t;
                }
                self.write_toggle = !self.write_toggle;
            }
            7 => {
                let ppu_addr = self.v & 0x3FFF;
                self.bus_write(ppu_addr, value, mapper);
                self.increment_vram_addr();
            }
            _ => {}
        }
    }

    pub fn tick(&mut self, mapper: &mut dyn Mapper) {
        let visible = (0..240).contains(&self.scanline);
        let pre_render = self.scanline == PRE_RENDER_SCANLINE;
        let rendering = self.rendering_enabled();

        if pre_render && self.dot == 1 {
            self.status &= !(STATUS_VBLANK | STATUS_SPRITE_ZERO_HIT | STATUS_SPRITE_OVERFLOW);
            self.update_nmi_line();
        }

        if self.scanline == VBLANK_SCANLINE && self.dot == 1 {
            self.status |= STATUS_VBLANK;
            self.frame_complete = true;
            self.update_nmi_line();
        }

        if visible && self.dot == 0 {
            self.evaluate_sprites(mapper);
        }

        if (visible || pre_render) && rendering {
            self.run_background_pipeline(mapper, pre_render);
        }

        if visible && (1..=256).contains(&self.dot) {
            self.output_pixel((self.dot - 1) as usize, self.scanline as usize);
        }

        // NTSC odd frames drop the last pre-render dot while rendering.
        if pre_render && rendering && self.odd_frame && self.dot == 339 {
            self.dot = 0;
            self.scanline = 0;
            self.odd_frame = false;
            return;
        }

        self.dot += 1;
        if self.dot >= DOTS_PER_SCANLINE {
            self.dot = 0;
            self.scanline += 1;
            if self.scanline > LAST_SCANLINE {
                self.scanline = PRE_RENDER_SCANLINE;
                self.odd_frame = !self.odd_frame;
            }
        }
    }

    fn run_background_pipeline(&mut self, mapper: &mut dyn Mapper, pre_render: bool) {
        if (1..=256).contains(&self.dot) || (321..=336).contains(&self.dot) {
            self.shift_background();

            match (self.dot - 1) & 0x07 {
                0 => {
                    self.reload_background_shifters();
                    let addr = 0x2000 | (self.v & 0x0FFF);
                    self.nt_latch = self.bus_read(addr, PpuFetchKind::Nametable, mapper);
                }
                2 => {
                    let addr = 0x23C0
                        | (self.v & 0x0C00)
                        | ((self.v >> 4) & 0x0038)
                        | ((self.v >> 2) & 0x0007);
                    let attr = self.bus_read(addr, PpuFetchKind::Attribute, mapper);
                    let shift = ((self.v >> 4) & 0x04) | (self.v & 0x02);
                    self.at_latch = (attr >> shift) & 0x03;
                }
                4 => {
                    let addr = self.bg_pattern_addr();
                    self.pattern_lo_latch =
                        self.bus_read(addr, PpuFetchKind::BackgroundPattern, mapper);
                }
                6 => {
                    let addr = self.bg_pattern_addr() + 8;
                    self.pattern_hi_latch =
                        self.bus_read(addr, PpuFetchKind::BackgroundPattern, mapper);
                }
                7 => self.increment_coarse_x(),
                _ => {}
            }
        }

        if self.dot == 256 {
            self.increment_y();
        }
        if self.dot == 257 {
            self.reload_background_shifters();
            self.copy_horizontal_bits();
        }
        if pre_render && (280..=304).contains(&self.dot) {
            self.copy_vertical_bits();
        }
        // Dummy nametable fetches at the end of the line.
        if self.dot == 338 || self.dot == 340 {
            let addr = 0x2000 | (self.v & 0x0FFF);
            self.nt_latch = self.bus_read(addr, PpuFetchKind::Nametable, mapper);
        }
    }

    fn bg_pattern_addr(&self) -> u16 {
        let table = if (self.ctrl & CTRL_BG_TABLE) != 0 {
            0x1000
        } else {
            0x0000
        };
        let fine_y = (self.v >> 12) & 0x07;
        table + (self.nt_latch as u16) * 16 + fine_y
    }

    fn shift_background(&mut self) {
        self.bg_pattern_lo <<= 1;
        self.bg_pattern_hi <<= 1;
        self.bg_attr_lo <<= 1;
        self.bg_attr_hi <<= 1;
    }

    fn reload_background_shifters(&mut self) {
        self.bg_pattern_lo = (self.bg_pattern_lo & 0xFF00) | self.pattern_lo_latch as u16;
        self.bg_pattern_hi = (self.bg_pattern_hi & 0xFF00) | self.pattern_hi_latch as u16;
        let lo = if (self.at_latch & 0x01) != 0 { 0xFF } else { 0 };
        let hi = if (self.at_latch & 0x02) != 0 { 0xFF } else { 0 };
        self.bg_attr_lo = (self.bg_attr_lo & 0xFF00) | lo;
        self.bg_attr_hi = (self.bg_attr_hi & 0xFF00) | hi;
    }

    fn increment_coarse_x(&mut self) {
        if (self.v & 0x001F) == 31 {
            self.v &= !0x001F;
            self.v ^= 0x0400;
        } else {
            self.v = self.v.wrapping_add(1);
        }
    }

    fn increment_y(&mut self) {
        if (self.v & 0x7000) != 0x7000 {
            self.v = self.v.wrapping_add(0x1000);
            return;
        }
        self.v &= !0x7000;
        let mut y = (self.v & 0x03E0) >> 5;
        if y == 29 {
            y = 0;
            self.v ^= 0x0800;
        } else if y == 31 {
            y = 0;
        } else {
            y += 1;
        }
        self.v = (self.v & !0x03E0) | (y << 5);
    }

    fn copy_horizontal_bits(&mut self) {
        self.v = (self.v & !0x041F) | (self.t & 0x041F);
    }

    fn copy_vertical_bits(&mut self) {
        self.v = (self.v & !0x7BE0) | (self.t & 0x7BE0);
    }

    fn update_nmi_line(&mut self) {
        let line = (self.ctrl & CTRL_NMI_ENABLE) != 0 && (self.status & STATUS_VBLANK) != 0;
        if line && !self.nmi_line {
            self.nmi_pending = true;
        }
        self.nmi_line = line;
    }

    fn sprite_height(&self) -> i16 {
        if (self.ctrl & CTRL_SPRITE_SIZE_16) != 0 {
            16
        } else {
            8
        }
    }

    // Pattern rows are announced as sprite fetches so MMC5-style mappers
    // pick the right CHR set.
    fn evaluate_sprites(&mut self, mapper: &mut dyn Mapper) {
        self.secondary_oam.fill(0xFF);
        self.sprite_count = 0;
        self.sprites = [SpriteSlot::default(); 8];

        if !self.rendering_enabled() {
            return;
        }

        let scanline = self.scanline;
        let height = self.sprite_height();
        let mut selected = [0usize; 8];
        let mut count = 0usize;

        for index in 0..64 {
            let y = self.oam[index * 4] as i16 + 1;
            let row = scanline - y;
            if row < 0 || row >= height {
                continue;
            }
            if count == 8 {
                self.status |= STATUS_SPRITE_OVERFLOW;
                break;
            }
            let base = index * 4;
            self.secondary_oam[count * 4..count * 4 + 4]
                .copy_from_slice(&self.oam[base..base + 4]);
            selected[count] = index;
            count += 1;
        }

        for slot in 0..count {
            let base = slot * 4;
            let y = self.secondary_oam[base] as i16 + 1;
            let tile = self.secondary_oam[base + 1];
            let attributes = self.secondary_oam[base + 2];
            let x = self.secondary_oam[base + 3];

            let mut row = (scanline - y) as u16;
            if (attributes & 0x80) != 0 {
                row = (height as u16 - 1) - row;
            }

            let addr = if height == 16 {
                let table = ((tile & 0x01) as u16) << 12;
                let tile = ((tile & 0xFE) as u16) + (row >> 3);
                table + tile * 16 + (row & 0x07)
            } else {
                let table = if (self.ctrl & CTRL_SPRITE_TABLE) != 0 {
                    0x1000
                } else {
                    0x0000
                };
                table + (tile as u16) * 16 + (row & 0x07)
            };

            let mut lo = self.bus_read(addr, PpuFetchKind::SpritePattern, mapper);
            let mut hi = self.bus_read(addr + 8, PpuFetchKind::SpritePattern, mapper);
            if (attributes & 0x40) != 0 {
                lo = lo.reverse_bits();
                hi = hi.reverse_bits();
            }

            self.sprites[slot] = SpriteSlot {
                x,
                attributes,
                pattern_lo: lo,
                pattern_hi: hi,
                oam_index: selected[slot] as u8,
            };
        }
        self.sprite_count = count as u8;
    }

    fn background_sample(&self, x: usize) -> (u8, u8) {
        if (self.mask & MASK_SHOW_BG) == 0 || (x < 8 && (self.mask & MASK_SHOW_BG_LEFT) == 0) {
            return (0, 0);
        }
        let bit = 0x8000u16 >> self.fine_x;
        let p0 = u8::from((self.bg_pattern_lo & bit) != 0);
        let p1 = u8::from((self.bg_pattern_hi & bit) != 0);
        let a0 = u8::from((self.bg_attr_lo & bit) != 0);
        let a1 = u8::from((self.bg_attr_hi & bit) != 0);
        ((p1 << 1) | p0, (a1 << 1) | a0)
    }

    fn sprite_sample(&self, x: usize) -> (u8, u8, bool, bool) {
        if (self.mask & MASK_SHOW_SPRITES) == 0
            || (x < 8 && (self.mask & MASK_SHOW_SPRITE_LEFT) == 0)
        {
            return (0, 0, false, false);
        }
        for slot in self.sprites.iter().take(self.sprite_count as usize) {
            let offset = x as i16 - slot.x as i16;
            if !(0..8).contains(&offset) {
                continue;
            }
            let bit = 7 - offset;
            let p0 = (slot.pattern_lo >> bit) & 0x01;
            let p1 = (slot.pattern_hi >> bit) & 0x01;
            let pixel = (p1 << 1) | p0;
            if pixel == 0 {
                continue;
            }
            return (
                pixel,
                slot.attributes & 0x03,
                (slot.attributes & 0x20) != 0,
                slot.oam_index == 0,
            );
        }
        (0, 0, false, false)
    }

    fn output_pixel(&mut self, x: usize, y: usize) {
        let (bg_pixel, bg_palette) = self.background_sample(x);
        let (spr_pixel, spr_palette, behind_bg, is_sprite0) = self.sprite_sample(x);

        if is_sprite0 && spr_pixel != 0 && bg_pixel != 0 && x < 255 {
            self.status |= STATUS_SPRITE_ZERO_HIT;
        }

        let palette_index = if bg_pixel != 0 {
            if spr_pixel != 0 && !behind_bg {
                0x10 | (spr_palette << 2) | spr_pixel
            } else {
                (bg_palette << 2) | bg_pixel
            }
        } else if spr_pixel != 0 {
            0x10 | (spr_palette << 2) | spr_pixel
        } else {
            0
        };

        let color = self.palette_ram[Self::palette_index(0x3F00 + palette_index as u16)] & 0x3F;
        self.frame_buffer[y * FRAME_WIDTH + x] = MASTER_PALETTE[color as usize];
    }

    fn increment_vram_addr(&mut self) {
        if (self.ctrl & CTRL_VRAM_INC_32) != 0 {
            self.v = self.v.wrapping_add(32);
        } else {
            self.v = self.v.wrapping_add(1);
        }
        self.v &= 0x7FFF;
    }

    // $3F10/$3F14/$3F18/$3F1C mirror the background slots.
    fn palette_index(addr: u16) -> usize {
        let mut index = ((addr - 0x3F00) % 0x20) as usize;
        if index >= 16 && (index & 0x03) == 0 {
            index -= 16;
        }
        index
    }

    fn bus_read(&mut self, addr: u16, kind: PpuFetchKind, mapper: &mut dyn Mapper) -> u8 {
        let addr = addr & 0x3FFF;
        mapper.ppu_fetch(addr, kind);
        match addr {
            0x0000..=0x1FFF => mapper.ppu_read(addr),
            0x2000..=0x3EFF => mapper.nt_read(0x2000 | (addr & 0x0FFF)),
            _ => self.palette_ram[Self::palette_index(addr)],
        }
    }

    fn bus_write(&mut self, addr: u16, value: u8, mapper: &mut dyn Mapper) {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => mapper.ppu_write(addr, value),
            0x2000..=0x3EFF => mapper.nt_write(0x2000 | (addr & 0x0FFF), value),
            _ => self.palette_ram[Self::palette_index(addr)] = value,
        }
    }

    pub fn snapshot(&self) -> PpuState {
        PpuState {
            scanline: self.scanline,
            dot: self.dot,
            odd_frame: self.odd_frame,
            ctrl: self.ctrl,
            mask: self.mask,
            status: self.status,
            oam_addr: self.oam_addr,
            v: self.v,
            t: self.t,
            fine_x: self.fine_x,
            write_toggle: self.write_toggle,
            read_buffer: self.read_buffer,
            open_bus: self.open_bus,
            oam: self.oam.to_vec(),
            secondary_oam: self.secondary_oam.to_vec(),
            palette_ram: self.palette_ram.to_vec(),
            nt_latch: self.nt_latch,
            at_latch: self.at_latch,
            pattern_lo_latch: self.pattern_lo_latch,
            pattern_hi_latch: self.pattern_hi_latch,
            bg_pattern_lo: self.bg_pattern_lo,
            bg_pattern_hi: self.bg_pattern_hi,
            bg_attr_lo: self.bg_attr_lo,
            bg_attr_hi: self.bg_attr_hi,
            sprites: self.sprites,
            sprite_count: self.sprite_count,
            nmi_line: self.nmi_line,
            nmi_pending: self.nmi_pending,
        }
    }

    pub fn restore(&mut self, state: &PpuState) -> Result<(), SaveStateError> {
        if state.oam.len() != 256 || state.secondary_oam.len() != 32 || state.palette_ram.len() != 32
        {
            return Err(SaveStateError::Corrupt);
        }
        self.scanline = state.scanline.clamp(PRE_RENDER_SCANLINE, LAST_SCANLINE);
        self.dot = state.dot.min(DOTS_PER_SCANLINE - 1);
        self.odd_frame = state.odd_frame;
        self.ctrl = state.ctrl;
        self.mask = state.mask;
        self.status = state.status;
        self.oam_addr = state.oam_addr;
        self.v = state.v & 0x7FFF;
        self.t = state.t & 0x7FFF;
        self.fine_x = state.fine_x & 0x07;
        self.write_toggle = state.write_toggle;
        self.read_buffer = state.read_buffer;
        self.open_bus = state.open_bus;
        self.oam.copy_from_slice(&state.oam);
        self.secondary_oam.copy_from_slice(&state.secondary_oam);
        self.palette_ram.copy_from_slice(&state.palette_ram);
        self.nt_latch = state.nt_latch;
        self.at_latch = state.at_latch;
        self.pattern_lo_latch = state.pattern_lo_latch;
        self.pattern_hi_latch = state.pattern_hi_latch;
        self.bg_pattern_lo = state.bg_pattern_lo;
        self.bg_pattern_hi = state.bg_pattern_hi;
        self.bg_attr_lo = state.bg_attr_lo;
        self.bg_attr_hi = state.bg_attr_hi;
        self.sprites = state.sprites;
        self.sprite_count = state.sprite_count.min(8);
        self.nmi_line = state.nmi_line;
        self.nmi_pending = state.nmi_pending;
        self.frame_complete = false;
        Ok(())
    }
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::Cartridge;
    use crate::mapper::{Mirroring, create_mapper};

    fn test_mapper() -> Box<dyn Mapper> {
        let cart = Cartridge {
            mapper_id: 0,
            mirroring: Mirroring::Horizontal,
            has_battery: false,
            prg_rom: vec![0; 0x8000],
            chr: vec![0; 0x2000],
            chr_is_ram: true,
            prg_ram_size: 8 * 1024,
            md5: [0; 16],
        };
        create_mapper(cart).unwrap()
    }

    fn tick_to(ppu: &mut Ppu, mapper: &mut dyn Mapper, scanline: i16, dot: u16) {
        while ppu.position() != (scanline, dot) {
            ppu.tick(mapper);
        }
    }

    #[test]
    fn vblank_flag_rises_at_scanline_241_dot_1() {
        let mut ppu = Ppu::new();
        let mut mapper = test_mapper();

        tick_to(&mut ppu, mapper.as_mut(), 241, 1);
        assert_eq!(ppu.status & STATUS_VBLANK, 0);
        ppu.tick(mapper.as_mut());
        assert_ne!(ppu.status & STATUS_VBLANK, 0);
        assert!(ppu.frame_complete());
    }

    #[test]
    fn nmi_pending_only_with_ctrl_enable() {
        let mut ppu = Ppu::new();
        let mut mapper = test_mapper();

        tick_to(&mut ppu, mapper.as_mut(), 241, 2);
        assert!(!ppu.take_nmi());

        // Enabling NMI while vblank is still set raises it immediately.
        ppu.write_register(0x2000, 0x80, mapper.as_mut());
        assert!(ppu.take_nmi());
    }

    #[test]
    fn vblank_clears_on_pre_render_line() {
        let mut ppu = Ppu::new();
        let mut mapper = test_mapper();

        tick_to(&mut ppu, mapper.as_mut(), 241, 2);
        assert_ne!(ppu.status & STATUS_VBLANK, 0);
        tick_to(&mut ppu, mapper.as_mut(), -1, 2);
        assert_eq!(ppu.status & STATUS_VBLANK, 0);
    }

    #[test]
    fn status_read_clears_vblank_and_write_toggle() {
        let mut ppu = Ppu::new();
        let mut mapper = test_mapper();

        tick_to(&mut ppu, mapper.as_mut(), 241, 2);
        ppu.write_register(0x2005, 0x10, mapper.as_mut());
        let status = ppu.read_register(0x2002, mapper.as_mut());
        assert_ne!(status & STATUS_VBLANK, 0);
        assert_eq!(ppu.status & STATUS_VBLANK, 0);
        assert!(!ppu.write_toggle);
    }

    #[test]
    fn ppudata_reads_are_buffered_except_palette() {
        let mut ppu = Ppu::new();
        let mut mapper = test_mapper();

        ppu.write_register(0x2006, 0x20, mapper.as_mut());
        ppu.write_register(0x2006, 0x00, mapper.as_mut());
        ppu.write_register(0x2007, 0xAB, mapper.as_mut());

        ppu.write_register(0x2006, 0x20, mapper.as_mut());
        ppu.write_register(0x2006, 0x00, mapper.as_mut());
        let stale = ppu.read_register(0x2007, mapper.as_mut());
        let fresh = ppu.read_register(0x2007, mapper.as_mut());
        assert_ne!(stale, 0xAB);
        assert_eq!(fresh, 0xAB);

        // Palette reads come back immediately.
        ppu.write_register(0x2006, 0x3F, mapper.as_mut());
        ppu.write_register(0x2006, 0x00, mapper.as_mut());
        ppu.write_register(0x2007, 0x21, mapper.as_mut());
        ppu.write_register(0x2006, 0x3F, mapper.as_mut());
        ppu.write_register(0x2006, 0x00, mapper.as_mut());
        assert_eq!(ppu.read_register(0x2007, mapper.as_mut()), 0x21);
    }

    #[test]
    fn sprite_palette_zero_mirrors_backdrop() {
        let mut ppu = Ppu::new();
        let mut mapper = test_mapper();

        ppu.write_register(0x2006, 0x3F, mapper.as_mut());
        ppu.write_register(0x2006, 0x10, mapper.as_mut());
        ppu.write_register(0x2007, 0x2C, mapper.as_mut());

        ppu.write_register(0x2006, 0x3F, mapper.as_mut());
        ppu.write_register(0x2006, 0x00, mapper.as_mut());
        assert_eq!(ppu.read_register(0x2007, mapper.as_mut()), 0x2C);
    }

    #[test]
    fn scroll_writes_assemble_t_register() {
        let mut ppu = Ppu::new();
        let mut mapper = test_mapper();

        ppu.write_register(0x2005, 0x7D, mapper.as_mut());
        assert_eq!(ppu.fine_x, 0x05);
        assert_eq!(ppu.t & 0x001F, 0x0F);
        ppu.write_register(0x2005, 0x5E, mapper.as_mut());
        assert_eq!((ppu.t >> 5) & 0x1F, 0x0B);
        assert_eq!((ppu.t >> 12) & 0x07, 0x06);
    }

    #[test]
    fn odd_frames_skip_one_pre_render_dot_while_rendering() {
        let mut ppu = Ppu::new();
        let mut mapper = test_mapper();
        ppu.write_register(0x2001, MASK_SHOW_BG, mapper.as_mut());

        // Frame 0 (even): full length.
        let mut even_dots = 0u32;
        loop {
            ppu.tick(mapper.as_mut());
            even_dots += 1;
            if ppu.position() == (-1, 0) {
                break;
            }
        }
        let mut odd_dots = 0u32;
        loop {
            ppu.tick(mapper.as_mut());
            odd_dots += 1;
            if ppu.position() == (-1, 0) {
                break;
            }
        }
        assert_eq!(even_dots, 262 * 341);
        assert_eq!(odd_dots, 262 * 341 - 1);
    }

    #[test]
    fn snapshot_round_trip_is_bitwise_stable() {
        let mut ppu = Ppu::new();
        let mut mapper = test_mapper();
        for _ in 0..100_000 {
            ppu.tick(mapper.as_mut());
        }
        ppu.write_register(0x2000, 0x90, mapper.as_mut());

        let first = ppu.snapshot();
        let mut other = Ppu::new();
        other.restore(&first).unwrap();
        let second = other.snapshot();
        assert_eq!(
            bincode::serialize(&first).unwrap(),
            bincode::serialize(&second).unwrap()
        );
    }
}
