use log::warn;

use crate::apu::{Apu, DEFAULT_SAMPLE_RATE};
use crate::cartridge::{Cartridge, RomError};
use crate::cpu::{Cpu, CpuBus};
use crate::mapper::{Mapper, create_mapper};
use crate::ppu::Ppu;
use crate::save_state::{SAVE_STATE_VERSION, SaveState, SaveStateError};

// 29780.5 CPU cycles per NTSC frame, rounded down.
pub const CPU_CYCLES_PER_FRAME: u64 = 29_780;

#[derive(Debug, Clone, Copy)]
pub struct ConsoleConfig {
    // 22_050 or 44_100.
    pub sample_rate: u32,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ControllerPort {
    buttons: u8,
    shift: u8,
}

pub(crate) struct Bus {
    pub(crate) ram: [u8; 2048],
    pub(crate) ppu: Ppu,
    pub(crate) apu: Apu,
    pub(crate) mapper: Box<dyn Mapper>,
    controllers: [ControllerPort; 2],
    strobe: bool,
    open_bus: u8,
    dma_stall: u32,
    mapper_irq: bool,
    cpu_cycles: u64,
}

impl Bus {
    fn new(mapper: Box<dyn Mapper>, sample_rate: u32) -> Self {
        Self {
            ram: [0; 2048],
            ppu: Ppu::new(),
            apu: Apu::new(sample_rate),
            mapper,
            controllers: [ControllerPort::default(); 2],
            strobe: false,
            open_bus: 0,
            dma_stall: 0,
            mapper_irq: false,
            cpu_cycles: 0,
        }
    }

    fn read_controller(&mut self, port: usize) -> u8 {
        let controller = &mut self.controllers[port];
        let bit = if self.strobe {
            controller.buttons & 0x01
        } else {
            let out = controller.shift & 0x01;
            controller.shift = (controller.shift >> 1) | 0x80;
            out
        };
        0x40 | bit
    }

    fn write_strobe(&mut self, value: u8) {
        self.strobe = (value & 0x01) != 0;
        if self.strobe {
            for controller in &mut self.controllers {
                controller.shift = controller.buttons;
            }
        }
    }

    fn oam_dma(&mut self, page: u8) {
        let base = (page as u16) << 8;
        let mut bytes = [0u8; 256];
        for (offset, slot) in bytes.iter_mut().enumerate() {
            *slot = self.read(base.wrapping_add(offset as u16));
        }
        self.ppu.oam_dma(&bytes);
        // 513 cycles, plus one on odd alignment.
        self.dma_stall += 513 + (self.cpu_cycles & 1) as u32;
    }
}

impl CpuBus for Bus {
    fn read(&mut self, addr: u16) -> u8 {
        let value = match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF],
            0x2000..=0x3FFF => {
                let reg = 0x2000 | (addr & 0x0007);
                self.ppu.read_register(reg, self.mapper.as_mut())
            }
            0x4015 => self.apu.read_status(),
            0x4016 => self.read_controller(0),
            0x4017 => self.read_controller(1),
            // Write-only APU/IO registers read back the bus capacitance.
            0x4000..=0x401F => self.open_bus,
            _ => self.mapper.cpu_read(addr),
        };
        self.open_bus = value;
        value
    }

    fn write(&mut self, addr: u16, value: u8) {
        self.open_bus = value;
        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF] = value,
            0x2000..=0x3FFF => {
                let reg = 0x2000 | (addr & 0x0007);
                self.ppu.write_register(reg, value, self.mapper.as_mut());
            }
            0x4014 => self.oam_dma(value),
            0x4000..=0x4013 | 0x4015 | 0x4017 => self.apu.write_register(addr, value),
            0x4016 => self.write_strobe(value),
            0x4018..=0x401F => {}
            _ => self.mapper.cpu_write(addr, value),
        }
    }
}

pub struct Console {
    cpu: Cpu,
    bus: Bus,
    rom_md5: [u8; 16],
}

impl Console {
    pub fn new(cart: Cartridge, config: ConsoleConfig) -> Result<Self, RomError> {
        let rom_md5 = cart.md5;
        let mapper = create_mapper(cart)?;
        let mut console = Self {
            cpu: Cpu::new(),
            bus: Bus::new(mapper, config.sample_rate),
            rom_md5,
        };
        console.cpu.reset(&mut console.bus);
        Ok(console)
    }

    pub fn reset(&mut self) {
        self.bus.ppu.reset();
        self.bus.apu.reset();
        self.bus.dma_stall = 0;
        self.bus.mapper_irq = false;
        self.cpu.reset(&mut self.bus);
    }

    pub fn frame(&self) -> &[u32] {
        self.bus.ppu.frame()
    }

    pub fn take_audio(&mut self) -> Vec<f32> {
        self.bus.apu.take_samples()
    }

    pub fn sample_rate(&self) -> u32 {
        self.bus.apu.sample_rate()
    }

    pub fn set_buttons(&mut self, port: usize, buttons: u8) {
        if port < 2 {
            self.bus.controllers[port].buttons = buttons;
            if self.bus.strobe {
                self.bus.controllers[port].shift = buttons;
            }
        }
    }

    pub fn cycles(&self) -> u64 {
        self.cpu.cycles
    }

    pub fn cpu_pc(&self) -> u16 {
        self.cpu.pc
    }

    pub fn ppu_position(&self) -> (i16, u16) {
        self.bus.ppu.position()
    }

    pub fn peek_ram(&self, addr: u16) -> u8 {
        self.bus.ram[(addr as usize) & 0x07FF]
    }

    pub fn run_cycles(&mut self, budget: u64) -> u64 {
        let start = self.cpu.cycles;
        while self.cpu.cycles.wrapping_sub(start) < budget {
            self.step_instruction();
        }
        self.cpu.cycles.wrapping_sub(start)
    }

    pub fn run_frame(&mut self) {
        self.bus.ppu.clear_frame_complete();
        let mut guard = 0u32;
        while !self.bus.ppu.frame_complete() {
            self.step_instruction();
            guard += 1;
            if guard > 1_000_000 {
                warn!("frame guard tripped; CPU is likely wedged");
                break;
            }
        }
    }

    // One instruction, then the machine catches up: 3 PPU dots and 1 APU
    // cycle per CPU cycle. Interrupts land at the next boundary.
    pub fn step_instruction(&mut self) -> u32 {
        self.bus.cpu_cycles = self.cpu.cycles;
        let mut cycles = self.cpu.step(&mut self.bus);

        // OAM DMA stalls the CPU while the PPU and APU keep running.
        let stall = std::mem::take(&mut self.bus.dma_stall);
        if stall > 0 {
            self.cpu.cycles += stall as u64;
            cycles += stall;
        }

        self.advance_hardware(cycles);

        // DMC sample fetches steal the bus between instructions.
        if let Some(addr) = self.bus.apu.dmc_dma_request() {
            let value = self.bus.read(addr);
            self.bus.apu.finish_dmc_dma(value);
            let stall = if (self.cpu.cycles & 1) == 0 { 4 } else { 3 };
            self.cpu.cycles += stall as u64;
            cycles += stall;
            self.advance_hardware(stall);
        }

        self.sync_interrupts();
        cycles
    }

    fn advance_hardware(&mut self, cpu_cycles: u32) {
        for _ in 0..cpu_cycles {
            for _ in 0..3 {
                self.bus.ppu.tick(self.bus.mapper.as_mut());
                if self.bus.mapper.has_step() {
                    let (scanline, dot) = self.bus.ppu.position();
                    let result =
                        self.bus
                            .mapper
                            .step(scanline, dot, self.bus.ppu.rendering_enabled());
                    self.bus.mapper_irq = result.irq;
                }
            }
            self.bus.apu.tick();
        }
    }

    fn sync_interrupts(&mut self) {
        if self.bus.ppu.take_nmi() {
            self.cpu.trigger_nmi();
        }
        let mapper_irq = if self.bus.mapper.has_step() {
            self.bus.mapper_irq
        } else {
            self.bus.mapper.irq_pending()
        };
        self.cpu.set_irq_line(self.bus.apu.irq_pending() || mapper_irq);
    }

    pub fn save_state(&self) -> SaveState {
        SaveState {
            version: SAVE_STATE_VERSION,
            rom_md5: self.rom_md5,
            cpu: self.cpu.snapshot(&self.bus.ram),
            ppu: self.bus.ppu.snapshot(),
            apu: self.bus.apu.snapshot(),
            mapper: self.bus.mapper.snapshot(),
        }
    }

    pub fn load_state(&mut self, state: &SaveState) -> Result<(), SaveStateError> {
        if state.version != SAVE_STATE_VERSION {
            return Err(SaveStateError::UnsupportedVersion(state.version));
        }
        if state.rom_md5 != self.rom_md5 {
            return Err(SaveStateError::MismatchedRom);
        }
        self.bus.mapper.restore(&state.mapper)?;
        self.cpu.restore(&state.cpu, &mut self.bus.ram)?;
        self.bus.ppu.restore(&state.ppu)?;
        self.bus.apu.restore(&state.apu)?;
        self.bus.mapper_irq = self.bus.mapper.irq_pending();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::{CHR_BLOCK, PRG_BLOCK};

    // Builds an iNES image with the program at $8000 and the given vectors.
    fn build_rom(
        mapper_id: u8,
        prg_blocks: u8,
        program: &[u8],
        reset: u16,
        nmi: u16,
        irq: u16,
    ) -> Cartridge {
        let mut image = Vec::new();
        image.extend_from_slice(b"NES\x1A");
        image.push(prg_blocks);
        image.push(1);
        image.push((mapper_id & 0x0F) << 4);
        image.push(mapper_id & 0xF0);
        image.extend_from_slice(&[0u8; 8]);

        let prg_size = prg_blocks as usize * PRG_BLOCK;
        let mut prg = vec![0xEAu8; prg_size];
        prg[..program.len()].copy_from_slice(program);
        prg[prg_size - 6] = (nmi & 0xFF) as u8;
        prg[prg_size - 5] = (nmi >> 8) as u8;
        prg[prg_size - 4] = (reset & 0xFF) as u8;
        prg[prg_size - 3] = (reset >> 8) as u8;
        prg[prg_size - 2] = (irq & 0xFF) as u8;
        prg[prg_size - 1] = (irq >> 8) as u8;
        image.extend_from_slice(&prg);
        image.extend(std::iter::repeat_n(0u8, CHR_BLOCK));

        Cartridge::from_bytes(&image).unwrap()
    }

    fn spin_rom() -> Cartridge {
        // JMP $8000
        build_rom(0, 1, &[0x4C, 0x00, 0x80], 0x8000, 0x8000, 0x8000)
    }

    #[test]
    fn ppu_advances_three_dots_per_cpu_cycle() {
        let cart = spin_rom();
        let mut console = Console::new(cart, ConsoleConfig::default()).unwrap();
        assert_eq!(console.ppu_position(), (-1, 0));

        let cycles = console.step_instruction();
        assert_eq!(cycles, 3); // JMP absolute
        assert_eq!(console.ppu_position(), (-1, 9));
        assert_eq!(console.cycles(), 3);
    }

    #[test]
    fn run_cycles_consumes_at_least_the_budget() {
        let cart = spin_rom();
        let mut console = Console::new(cart, ConsoleConfig::default()).unwrap();
        let consumed = console.run_cycles(1000);
        assert!(consumed >= 1000);
        assert!(consumed < 1010);
    }

    #[test]
    fn run_frame_spans_one_vblank() {
        let cart = spin_rom();
        let mut console = Console::new(cart, ConsoleConfig::default()).unwrap();
        console.run_frame();
        let (scanline, _) = console.ppu_position();
        assert_eq!(scanline, 241);
        // A frame is roughly 29780 CPU cycles.
        assert!((29_000..31_000).contains(&console.cycles()));
    }

    #[test]
    fn vblank_nmi_reaches_the_cpu() {
        // Spin at $8000; NMI handler spins at $8010.
        let mut program = vec![0xEAu8; 0x20];
        program[0x00] = 0x4C;
        program[0x01] = 0x00;
        program[0x02] = 0x80;
        program[0x10] = 0x4C;
        program[0x11] = 0x10;
        program[0x12] = 0x80;
        let cart = build_rom(0, 1, &program, 0x8000, 0x8010, 0x8000);
        let mut console = Console::new(cart, ConsoleConfig::default()).unwrap();

        console
            .bus
            .ppu
            .write_register(0x2000, 0x80, console.bus.mapper.as_mut());
        console.run_frame();
        console.run_cycles(30);
        assert_eq!(console.cpu_pc() & 0xFFF0, 0x8010);
    }

    #[test]
    fn oam_dma_stalls_cpu_and_ppu_keeps_pace() {
        // LDA #$02; STA $4014; JMP spin
        let program = [0xA9, 0x02, 0x8D, 0x14, 0x40, 0x4C, 0x05, 0x80];
        let cart = build_rom(0, 1, &program, 0x8000, 0x8000, 0x8000);
        let mut console = Console::new(cart, ConsoleConfig::default()).unwrap();

        let lda_cycles = console.step_instruction();
        assert_eq!(lda_cycles, 2);

        let before_dots = console.ppu_position();
        let sta_cycles = console.step_instruction();
        let stall = sta_cycles - 4;
        assert!(stall == 513 || stall == 514, "stall was {stall}");

        let after_dots = console.ppu_position();
        let dot_delta = (after_dots.0 as i64 - before_dots.0 as i64) * 341
            + (after_dots.1 as i64 - before_dots.1 as i64);
        assert_eq!(dot_delta, sta_cycles as i64 * 3);
    }

    #[test]
    fn controller_shift_register_reads_buttons_in_order() {
        let cart = spin_rom();
        let mut console = Console::new(cart, ConsoleConfig::default()).unwrap();

        console.set_buttons(0, crate::BUTTON_A | crate::BUTTON_START);
        console.bus.write(0x4016, 1);
        console.bus.write(0x4016, 0);

        let mut bits = [0u8; 8];
        for bit in bits.iter_mut() {
            *bit = console.bus.read(0x4016) & 0x01;
        }
        assert_eq!(bits, [1, 0, 0, 1, 0, 0, 0, 0]);
        // The shift register feeds 1s after all eight reads.
        assert_eq!(console.bus.read(0x4016) & 0x01, 1);
    }

    #[test]
    fn mmc5_scanline_irq_end_to_end() {
        // LDA #100; STA $5203; LDA #$80; STA $5204; CLI; spin.
        // IRQ handler at $8010 acknowledges via $5204 and spins at $8013.
        let mut program = vec![0xEAu8; 0x20];
        let setup = [
            0xA9, 0x64, 0x8D, 0x03, 0x52, // LDA #100 / STA $5203
            0xA9, 0x80, 0x8D, 0x04, 0x52, // LDA #$80 / STA $5204
            0x58, // CLI
            0x4C, 0x0B, 0x80, // JMP $800B
        ];
        program[..setup.len()].copy_from_slice(&setup);
        program[0x10] = 0xAD; // LDA $5204
        program[0x11] = 0x04;
        program[0x12] = 0x52;
        program[0x13] = 0x4C; // JMP $8013
        program[0x14] = 0x13;
        program[0x15] = 0x80;

        let cart = build_rom(5, 1, &program, 0x8000, 0x8000, 0x8010);
        let mut console = Console::new(cart, ConsoleConfig::default()).unwrap();

        // Run until the PPU passes scanline 100 dot 0.
        while console.ppu_position().0 < 100 {
            console.step_instruction();
        }
        console.run_cycles(40);

        assert!((0x8010..=0x8015).contains(&console.cpu_pc()));
        // The handler's $5204 read acknowledged the IRQ.
        assert!(!console.bus.mapper.irq_pending());
    }

    #[test]
    fn save_state_round_trip_is_bitwise_stable() {
        let cart = spin_rom();
        let mut console = Console::new(cart, ConsoleConfig::default()).unwrap();
        console
            .bus
            .ppu
            .write_register(0x2001, 0x08, console.bus.mapper.as_mut());
        for _ in 0..3 {
            console.run_frame();
        }

        let first = console.save_state();
        console.load_state(&first).unwrap();
        let second = console.save_state();
        assert_eq!(first.to_bytes().unwrap(), second.to_bytes().unwrap());
    }

    #[test]
    fn restored_console_replays_identically() {
        let cart = spin_rom();
        let mut console = Console::new(cart, ConsoleConfig::default()).unwrap();
        console
            .bus
            .ppu
            .write_register(0x2001, 0x08, console.bus.mapper.as_mut());
        for _ in 0..2 {
            console.run_frame();
        }

        let checkpoint = console.save_state();
        for _ in 0..3 {
            console.run_frame();
        }
        let expected_frame = console.frame().to_vec();
        let expected_cycles = console.cycles();

        console.load_state(&checkpoint).unwrap();
        for _ in 0..3 {
            console.run_frame();
        }
        assert_eq!(console.frame(), expected_frame.as_slice());
        assert_eq!(console.cycles(), expected_cycles);
    }

    #[test]
    fn load_state_refuses_foreign_rom_and_future_version() {
        let mut console = Console::new(spin_rom(), ConsoleConfig::default()).unwrap();
        let mut state = console.save_state();

        state.rom_md5[0] ^= 0xFF;
        assert!(matches!(
            console.load_state(&state),
            Err(SaveStateError::MismatchedRom)
        ));

        let mut state = console.save_state();
        state.version = SAVE_STATE_VERSION + 1;
        assert!(matches!(
            console.load_state(&state),
            Err(SaveStateError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn save_state_survives_serialization() {
        let mut console = Console::new(spin_rom(), ConsoleConfig::default()).unwrap();
        console.run_frame();
        let state = console.save_state();
        let bytes = state.to_bytes().unwrap();
        let decoded = SaveState::from_bytes(&bytes).unwrap();
        assert_eq!(bytes, decoded.to_bytes().unwrap());
        console.load_state(&decoded).unwrap();
    }

    #[test]
    fn audio_samples_accumulate_per_frame() {
        let mut console = Console::new(spin_rom(), ConsoleConfig { sample_rate: 44_100 }).unwrap();
        console.run_frame();
        let samples = console.take_audio();
        // One NTSC frame at 44.1 kHz is ~735 samples.
        assert!((700..=780).contains(&samples.len()), "{}", samples.len());
    }
}
