use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

use crate::save_state::SaveStateError;

pub const CPU_CLOCK_HZ: f64 = 1_789_772.727_272_727_3;
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

const LENGTH_TABLE: [u8; 32] = [
    10, 254, 20, 2, 40, 4, 80, 6, 160, 8, 60, 10, 14, 12, 26, 14, 12, 16, 24, 18, 48, 20, 96, 22,
    192, 24, 72, 26, 16, 28, 32, 30,
];

const DUTY_TABLE: [[u8; 8]; 4] = [
    [0, 1, 0, 0, 0, 0, 0, 0],
    [0, 1, 1, 0, 0, 0, 0, 0],
    [0, 1, 1, 1, 1, 0, 0, 0],
    [1, 0, 0, 1, 1, 1, 1, 1],
];

const TRIANGLE_SEQUENCE: [u8; 32] = [
    15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11,
    12, 13, 14, 15,
];

const NOISE_PERIODS: [u16; 16] = [
    4, 8, 16, 32, 64, 96, 128, 160, 202, 254, 380, 508, 762, 1016, 2034, 4068,
];

const DMC_RATES: [u16; 16] = [
    428, 380, 340, 320, 286, 254, 226, 214, 190, 160, 142, 128, 106, 84, 72, 54,
];

// Frame sequencer tap points in CPU cycles.
const SEQ_QUARTER_1: u32 = 7_457;
const SEQ_HALF_1: u32 = 14_913;
const SEQ_QUARTER_3: u32 = 22_371;
const SEQ_4STEP_END: u32 = 29_829;
const SEQ_4STEP_WRAP: u32 = 29_830;
const SEQ_5STEP_END: u32 = 37_281;
const SEQ_5STEP_WRAP: u32 = 37_282;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct Envelope {
    start: bool,
    period: u8,
    divider: u8,
    decay: u8,
}

impl Envelope {
    fn clock(&mut self, repeat: bool) {
        if self.start {
            self.start = false;
            self.decay = 15;
            self.divider = self.period;
            return;
        }
        if self.divider == 0 {
            self.divider = self.period;
            if self.decay > 0 {
                self.decay -= 1;
            } else if repeat {
                self.decay = 15;
            }
        } else {
            self.divider -= 1;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct Pulse {
    enabled: bool,
    first_channel: bool,
    duty: u8,
    duty_step: u8,
    timer_period: u16,
    timer: u16,
    length_counter: u8,
    length_halt: bool,
    constant_volume: bool,
    volume: u8,
    envelope: Envelope,
    sweep_enabled: bool,
    sweep_period: u8,
    sweep_negate: bool,
    sweep_shift: u8,
    sweep_reload: bool,
    sweep_divider: u8,
}

impl Pulse {
    fn new(first_channel: bool) -> Self {
        Self {
            first_channel,
            ..Self::default()
        }
    }

    fn write_control(&mut self, value: u8) {
        self.duty = (value >> 6) & 0x03;
        self.length_halt = (value & 0x20) != 0;
        self.constant_volume = (value & 0x10) != 0;
        self.volume = value & 0x0F;
        self.envelope.period = value & 0x0F;
        self.envelope.start = true;
    }

    fn write_sweep(&mut self, value: u8) {
        self.sweep_enabled = (value & 0x80) != 0;
        self.sweep_period = ((value >> 4) & 0x07) + 1;
        self.sweep_negate = (value & 0x08) != 0;
        self.sweep_shift = value & 0x07;
        self.sweep_reload = true;
    }

    fn write_timer_low(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0xFF00) | value as u16;
    }

    fn write_timer_high(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x00FF) | (((value & 0x07) as u16) << 8);
        if self.enabled {
            self.length_counter = LENGTH_TABLE[(value >> 3) as usize];
        }
        self.duty_step = 0;
        self.envelope.start = true;
    }

    fn clock_timer(&mut self) {
        if self.timer == 0 {
            self.timer = self.timer_period;
            self.duty_step = (self.duty_step + 1) & 0x07;
        } else {
            self.timer -= 1;
        }
    }

    fn clock_length_and_sweep(&mut self) {
        if !self.length_halt && self.length_counter > 0 {
            self.length_counter -= 1;
        }

        if self.sweep_reload {
            if self.sweep_enabled && self.sweep_divider == 0 {
                self.apply_sweep();
            }
            self.sweep_divider = self.sweep_period;
            self.sweep_reload = false;
        } else if self.sweep_divider == 0 {
            if self.sweep_enabled {
                self.apply_sweep();
            }
            self.sweep_divider = self.sweep_period;
        } else {
            self.sweep_divider -= 1;
        }
    }

    fn apply_sweep(&mut self) {
        if self.sweep_shift == 0 {
            return;
        }
        let target = self.sweep_target();
        if target <= 0x07FF {
            self.timer_period = target;
        }
    }

    fn sweep_target(&self) -> u16 {
        if self.sweep_shift == 0 {
            return self.timer_period;
        }
        let change = self.timer_period >> self.sweep_shift;
        if self.sweep_negate {
            // Pulse 1's adder leaves the extra one's-complement bit in.
            let extra = u16::from(self.first_channel);
            self.timer_period.wrapping_sub(change + extra)
        } else {
            self.timer_period.wrapping_add(change)
        }
    }

    fn output(&self) -> u8 {
        if !self.enabled
            || self.length_counter == 0
            || self.timer_period < 8
            || self.sweep_target() > 0x07FF
            || DUTY_TABLE[self.duty as usize][self.duty_step as usize] == 0
        {
            return 0;
        }
        if self.constant_volume {
            self.volume
        } else {
            self.envelope.decay
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct Triangle {
    enabled: bool,
    control_flag: bool,
    linear_reload_value: u8,
    linear_counter: u8,
    linear_reload: bool,
    timer_period: u16,
    timer: u16,
    length_counter: u8,
    sequence_step: u8,
}

impl Triangle {
    fn write_linear(&mut self, value: u8) {
        self.control_flag = (value & 0x80) != 0;
        self.linear_reload_value = value & 0x7F;
    }

    fn write_timer_low(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0xFF00) | value as u16;
    }

    fn write_timer_high(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x00FF) | (((value & 0x07) as u16) << 8);
        if self.enabled {
            self.length_counter = LENGTH_TABLE[(value >> 3) as usize];
        }
        self.linear_reload = true;
    }

    fn clock_linear(&mut self) {
        if self.linear_reload {
            self.linear_counter = self.linear_reload_value;
        } else if self.linear_counter > 0 {
            self.linear_counter -= 1;
        }
        if !self.control_flag {
            self.linear_reload = false;
        }
    }

    fn clock_length(&mut self) {
        if !self.control_flag && self.length_counter > 0 {
            self.length_counter -= 1;
        }
    }

    fn clock_timer(&mut self) {
        if self.timer == 0 {
            self.timer = self.timer_period;
            if self.length_counter > 0 && self.linear_counter > 0 && self.timer_period > 1 {
                self.sequence_step = (self.sequence_step + 1) & 0x1F;
            }
        } else {
            self.timer -= 1;
        }
    }

    fn output(&self) -> u8 {
        // Ultra-low periods are muted to avoid popping.
        if !self.enabled
            || self.length_counter == 0
            || self.linear_counter == 0
            || self.timer_period < 2
        {
            0
        } else {
            TRIANGLE_SEQUENCE[self.sequence_step as usize]
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Noise {
    enabled: bool,
    length_halt: bool,
    constant_volume: bool,
    volume: u8,
    envelope: Envelope,
    mode: bool,
    timer_period: u16,
    timer: u16,
    shift_register: u16,
    length_counter: u8,
}

impl Default for Noise {
    fn default() -> Self {
        Self {
            enabled: false,
            length_halt: false,
            constant_volume: false,
            volume: 0,
            envelope: Envelope::default(),
            mode: false,
            timer_period: NOISE_PERIODS[0],
            timer: 0,
            shift_register: 1,
            length_counter: 0,
        }
    }
}

impl Noise {
    fn write_control(&mut self, value: u8) {
        self.length_halt = (value & 0x20) != 0;
        self.constant_volume = (value & 0x10) != 0;
        self.volume = value & 0x0F;
        self.envelope.period = value & 0x0F;
        self.envelope.start = true;
    }

    fn write_period(&mut self, value: u8) {
        self.mode = (value & 0x80) != 0;
        self.timer_period = NOISE_PERIODS[(value & 0x0F) as usize];
    }

    fn write_length(&mut self, value: u8) {
        if self.enabled {
            self.length_counter = LENGTH_TABLE[(value >> 3) as usize];
        }
        self.envelope.start = true;
    }

    fn clock_timer(&mut self) {
        if self.timer == 0 {
            self.timer = self.timer_period;
            let tap = if self.mode { 6 } else { 1 };
            let feedback = (self.shift_register ^ (self.shift_register >> tap)) & 0x0001;
            self.shift_register = (self.shift_register >> 1) | (feedback << 14);
        } else {
            self.timer -= 1;
        }
    }

    fn clock_length(&mut self) {
        if !self.length_halt && self.length_counter > 0 {
            self.length_counter -= 1;
        }
    }

    fn output(&self) -> u8 {
        if !self.enabled || self.length_counter == 0 || (self.shift_register & 0x0001) != 0 {
            return 0;
        }
        if self.constant_volume {
            self.volume
        } else {
            self.envelope.decay
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Dmc {
    enabled: bool,
    irq_enabled: bool,
    irq_flag: bool,
    loop_flag: bool,
    timer_period: u16,
    timer: u16,
    output_level: u8,
    sample_addr_reg: u8,
    sample_length_reg: u8,
    current_addr: u16,
    bytes_remaining: u16,
    sample_buffer: Option<u8>,
    shift_register: u8,
    bits_remaining: u8,
    silence: bool,
    dma_wanted: bool,
}

impl Default for Dmc {
    fn default() -> Self {
        Self {
            enabled: false,
            irq_enabled: false,
            irq_flag: false,
            loop_flag: false,
            timer_period: DMC_RATES[0],
            timer: DMC_RATES[0],
            output_level: 0,
            sample_addr_reg: 0,
            sample_length_reg: 0,
            current_addr: 0xC000,
            bytes_remaining: 0,
            sample_buffer: None,
            shift_register: 0,
            bits_remaining: 8,
            silence: true,
            dma_wanted: false,
        }
    }
}

impl Dmc {
    fn write_control(&mut self, value: u8) {
        self.irq_enabled = (value & 0x80) != 0;
        if !self.irq_enabled {
            self.irq_flag = false;
        }
        self.loop_flag = (value & 0x40) != 0;
        self.timer_period = DMC_RATES[(value & 0x0F) as usize];
    }

    fn restart(&mut self) {
        self.current_addr = 0xC000 | ((self.sample_addr_reg as u16) << 6);
        self.bytes_remaining = ((self.sample_length_reg as u16) << 4) | 0x0001;
        self.request_dma();
    }

    fn request_dma(&mut self) {
        if self.enabled && self.sample_buffer.is_none() && self.bytes_remaining > 0 {
            self.dma_wanted = true;
        }
    }

    fn active(&self) -> bool {
        self.bytes_remaining > 0 || self.sample_buffer.is_some()
    }

    fn finish_dma(&mut self, value: u8) {
        self.dma_wanted = false;
        self.sample_buffer = Some(value);
        if self.bytes_remaining > 0 {
            self.current_addr = if self.current_addr == 0xFFFF {
                0x8000
            } else {
                self.current_addr + 1
            };
            self.bytes_remaining -= 1;
            if self.bytes_remaining == 0 {
                if self.loop_flag {
                    self.restart();
                } else if self.irq_enabled {
                    self.irq_flag = true;
                }
            }
        }
    }

    fn clock_timer(&mut self) {
        if self.timer == 0 {
            self.timer = self.timer_period;
        }
        self.timer -= 1;
        if self.timer == 0 {
            self.clock_output();
        }
    }

    fn clock_output(&mut self) {
        if !self.silence {
            if (self.shift_register & 0x01) != 0 {
                if self.output_level <= 125 {
                    self.output_level += 2;
                }
            } else if self.output_level >= 2 {
                self.output_level -= 2;
            }
        }
        self.shift_register >>= 1;
        self.bits_remaining = self.bits_remaining.saturating_sub(1);

        if self.bits_remaining == 0 {
            self.bits_remaining = 8;
            if let Some(byte) = self.sample_buffer.take() {
                self.shift_register = byte;
                self.silence = false;
                self.request_dma();
            } else {
                self.silence = true;
            }
        }
    }
}

pub struct Apu {
    pulse1: Pulse,
    pulse2: Pulse,
    triangle: Triangle,
    noise: Noise,
    dmc: Dmc,

    sequencer_cycle: u32,
    five_step_mode: bool,
    irq_inhibit: bool,
    frame_irq: bool,
    sequencer_write_value: u8,
    sequencer_write_delay: u8,

    cpu_cycle: u64,
    sample_rate: u32,
    sample_accumulator: f64,
    samples: Vec<f32>,

    hp_slow: FirstOrderFilter,
    hp_fast: FirstOrderFilter,
    lp: FirstOrderFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApuState {
    pulse1: Pulse,
    pulse2: Pulse,
    triangle: Triangle,
    noise: Noise,
    dmc: Dmc,
    sequencer_cycle: u32,
    five_step_mode: bool,
    irq_inhibit: bool,
    frame_irq: bool,
    sequencer_write_value: u8,
    sequencer_write_delay: u8,
    cpu_cycle: u64,
    sample_accumulator: f64,
}

#[derive(Debug, Clone, Copy)]
struct FirstOrderFilter {
    high_pass: bool,
    alpha: f32,
    prev_in: f32,
    prev_out: f32,
}

impl FirstOrderFilter {
    fn new(cutoff_hz: f32, sample_rate: u32, high_pass: bool) -> Self {
        let rc = 1.0 / (2.0 * PI * cutoff_hz);
        let dt = 1.0 / sample_rate as f32;
        let alpha = if high_pass { rc / (rc + dt) } else { dt / (rc + dt) };
        Self {
            high_pass,
            alpha,
            prev_in: 0.0,
            prev_out: 0.0,
        }
    }

    fn apply(&mut self, sample: f32) -> f32 {
        let out = if self.high_pass {
            self.alpha * (self.prev_out + sample - self.prev_in)
        } else {
            self.prev_out + self.alpha * (sample - self.prev_out)
        };
        self.prev_in = sample;
        self.prev_out = out;
        out
    }
}

impl Apu {
    pub fn new(sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(8_000);
        Self {
            pulse1: Pulse::new(true),
            pulse2: Pulse::new(false),
            triangle: Triangle::default(),
            noise: Noise::default(),
            dmc: Dmc::default(),
            sequencer_cycle: 0,
            five_step_mode: false,
            irq_inhibit: false,
            frame_irq: false,
            sequencer_write_value: 0,
            sequencer_write_delay: 0,
            cpu_cycle: 0,
            sample_rate,
            sample_accumulator: 0.0,
            samples: Vec::with_capacity(2048),
            hp_slow: FirstOrderFilter::new(90.0, sample_rate, true),
            hp_fast: FirstOrderFilter::new(440.0, sample_rate, true),
            lp: FirstOrderFilter::new(14_000.0, sample_rate, false),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.sample_rate);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn take_samples(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.samples)
    }

    pub fn irq_pending(&self) -> bool {
        self.frame_irq || self.dmc.irq_flag
    }

    // The console performs the fetch and hands the byte to finish_dmc_dma.
    pub fn dmc_dma_request(&self) -> Option<u16> {
        self.dmc.dma_wanted.then_some(self.dmc.current_addr)
    }

    pub fn finish_dmc_dma(&mut self, value: u8) {
        self.dmc.finish_dma(value);
    }

    pub fn read_status(&mut self) -> u8 {
        let mut status = 0u8;
        if self.pulse1.length_counter > 0 {
            status |= 0x01;
        }
        if self.pulse2.length_counter > 0 {
            status |= 0x02;
        }
        if self.triangle.length_counter > 0 {
            status |= 0x04;
        }
        if self.noise.length_counter > 0 {
            status |= 0x08;
        }
        if self.dmc.active() {
            status |= 0x10;
        }
        if self.frame_irq {
            status |= 0x40;
        }
        if self.dmc.irq_flag {
            status |= 0x80;
        }
        self.frame_irq = false;
        status
    }

    pub fn write_register(&mut self, addr: u16, value: u8) {
        match addr {
            0x4000 => self.pulse1.write_control(value),
            0x4001 => self.pulse1.write_sweep(value),
            0x4002 => self.pulse1.write_timer_low(value),
            0x4003 => self.pulse1.write_timer_high(value),
            0x4004 => self.pulse2.write_control(value),
            0x4005 => self.pulse2.write_sweep(value),
            0x4006 => self.pulse2.write_timer_low(value),
            0x4007 => self.pulse2.write_timer_high(value),
            0x4008 => self.triangle.write_linear(value),
            0x400A => self.triangle.write_timer_low(value),
            0x400B => self.triangle.write_timer_high(value),
            0x400C => self.noise.write_control(value),
            0x400E => self.noise.write_period(value),
            0x400F => self.noise.write_length(value),
            0x4010 => self.dmc.write_control(value),
            0x4011 => self.dmc.output_level = value & 0x7F,
            0x4012 => self.dmc.sample_addr_reg = value,
            0x4013 => self.dmc.sample_length_reg = value,
            0x4015 => self.write_status(value),
            0x4017 => {
                if (value & 0x40) != 0 {
                    self.frame_irq = false;
                }
                // The mode change lands 3-4 CPU cycles after the write.
                self.sequencer_write_value = value;
                self.sequencer_write_delay = if (self.cpu_cycle & 1) == 0 { 3 } else { 4 };
            }
            _ => {}
        }
    }

    fn write_status(&mut self, value: u8) {
        self.dmc.irq_flag = false;

        self.pulse1.enabled = (value & 0x01) != 0;
        if !self.pulse1.enabled {
            self.pulse1.length_counter = 0;
        }
        self.pulse2.enabled = (value & 0x02) != 0;
        if !self.pulse2.enabled {
            self.pulse2.length_counter = 0;
        }
        self.triangle.enabled = (value & 0x04) != 0;
        if !self.triangle.enabled {
            self.triangle.length_counter = 0;
        }
        self.noise.enabled = (value & 0x08) != 0;
        if !self.noise.enabled {
            self.noise.length_counter = 0;
        }

        self.dmc.enabled = (value & 0x10) != 0;
        if !self.dmc.enabled {
            self.dmc.bytes_remaining = 0;
            self.dmc.dma_wanted = false;
        } else if !self.dmc.active() {
            self.dmc.restart();
        }
    }

    pub fn tick(&mut self) {
        self.cpu_cycle = self.cpu_cycle.wrapping_add(1);

        if self.sequencer_write_delay > 0 {
            self.sequencer_write_delay -= 1;
            if self.sequencer_write_delay == 0 {
                self.apply_sequencer_write();
            }
        }

        if (self.cpu_cycle & 1) == 0 {
            self.pulse1.clock_timer();
            self.pulse2.clock_timer();
            self.noise.clock_timer();
        }
        self.triangle.clock_timer();
        self.dmc.clock_timer();

        self.clock_sequencer();

        // One output sample every CPU_CLOCK/sample_rate cycles, on average.
        self.sample_accumulator += self.sample_rate as f64;
        while self.sample_accumulator >= CPU_CLOCK_HZ {
            self.sample_accumulator -= CPU_CLOCK_HZ;
            let mixed = self.mix();
            let conditioned = self.lp.apply(self.hp_fast.apply(self.hp_slow.apply(mixed)));
            self.samples.push(conditioned.clamp(-1.0, 1.0));
        }
    }

    fn apply_sequencer_write(&mut self) {
        let value = self.sequencer_write_value;
        self.five_step_mode = (value & 0x80) != 0;
        self.irq_inhibit = (value & 0x40) != 0;
        if self.irq_inhibit {
            self.frame_irq = false;
        }
        self.sequencer_cycle = 0;
        if self.five_step_mode {
            self.clock_quarter_frame();
            self.clock_half_frame();
        }
    }

    fn clock_sequencer(&mut self) {
        self.sequencer_cycle = self.sequencer_cycle.wrapping_add(1);

        if self.five_step_mode {
            match self.sequencer_cycle {
                SEQ_QUARTER_1 | SEQ_QUARTER_3 => self.clock_quarter_frame(),
                SEQ_HALF_1 | SEQ_5STEP_END => {
                    self.clock_quarter_frame();
                    self.clock_half_frame();
                }
                SEQ_5STEP_WRAP => self.sequencer_cycle = 0,
                _ => {}
            }
        } else {
            match self.sequencer_cycle {
                SEQ_QUARTER_1 | SEQ_QUARTER_3 => self.clock_quarter_frame(),
                SEQ_HALF_1 => {
                    self.clock_quarter_frame();
                    self.clock_half_frame();
                }
                SEQ_4STEP_END => {
                    self.clock_quarter_frame();
                    self.clock_half_frame();
                    if !self.irq_inhibit {
                        self.frame_irq = true;
                    }
                }
                SEQ_4STEP_WRAP => {
                    if !self.irq_inhibit {
                        self.frame_irq = true;
                    }
                    self.sequencer_cycle = 0;
                }
                _ => {}
            }
        }
    }

    fn clock_quarter_frame(&mut self) {
        self.pulse1.envelope.clock(self.pulse1.length_halt);
        self.pulse2.envelope.clock(self.pulse2.length_halt);
        self.triangle.clock_linear();
        self.noise.envelope.clock(self.noise.length_halt);
    }

    fn clock_half_frame(&mut self) {
        self.pulse1.clock_length_and_sweep();
        self.pulse2.clock_length_and_sweep();
        self.triangle.clock_length();
        self.noise.clock_length();
    }

    fn mix(&self) -> f32 {
        let pulse_sum = (self.pulse1.output() + self.pulse2.output()) as f32;
        let pulse_out = if pulse_sum > 0.0 {
            95.88 / ((8128.0 / pulse_sum) + 100.0)
        } else {
            0.0
        };

        let tnd_in = (self.triangle.output() as f32 / 8227.0)
            + (self.noise.output() as f32 / 12241.0)
            + (self.dmc.output_level as f32 / 22638.0);
        let tnd_out = if tnd_in > 0.0 {
            159.79 / ((1.0 / tnd_in) + 100.0)
        } else {
            0.0
        };

        pulse_out + tnd_out
    }

    pub fn snapshot(&self) -> ApuState {
        ApuState {
            pulse1: self.pulse1,
            pulse2: self.pulse2,
            triangle: self.triangle,
            noise: self.noise,
            dmc: self.dmc,
            sequencer_cycle: self.sequencer_cycle,
            five_step_mode: self.five_step_mode,
            irq_inhibit: self.irq_inhibit,
            frame_irq: self.frame_irq,
            sequencer_write_value: self.sequencer_write_value,
            sequencer_write_delay: self.sequencer_write_delay,
            cpu_cycle: self.cpu_cycle,
            sample_accumulator: self.sample_accumulator,
        }
    }

    pub fn restore(&mut self, state: &ApuState) -> Result<(), SaveStateError> {
        if state.noise.shift_register == 0 {
            // A zeroed LFSR locks up; never accept one.
            return Err(SaveStateError::Corrupt);
        }
        self.pulse1 = state.pulse1;
        self.pulse2 = state.pulse2;
        self.triangle = state.triangle;
        self.noise = state.noise;
        self.dmc = state.dmc;
        self.sequencer_cycle = state.sequencer_cycle;
        self.five_step_mode = state.five_step_mode;
        self.irq_inhibit = state.irq_inhibit;
        self.frame_irq = state.frame_irq;
        self.sequencer_write_value = state.sequencer_write_value;
        self.sequencer_write_delay = state.sequencer_write_delay;
        self.cpu_cycle = state.cpu_cycle;
        self.sample_accumulator = state.sample_accumulator;
        self.samples.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_pacing_matches_host_rate() {
        for rate in [22_050u32, 44_100] {
            let mut apu = Apu::new(rate);
            for _ in 0..CPU_CLOCK_HZ as u64 {
                apu.tick();
            }
            let produced = apu.take_samples().len() as i64;
            assert!(
                (produced - rate as i64).abs() <= 1,
                "rate {rate}: produced {produced}"
            );
        }
    }

    #[test]
    fn length_counter_loads_only_while_enabled() {
        let mut apu = Apu::new(DEFAULT_SAMPLE_RATE);
        apu.write_register(0x4003, 0x08); // length index 1 = 254
        assert_eq!(apu.read_status() & 0x01, 0);

        apu.write_register(0x4015, 0x01);
        apu.write_register(0x4003, 0x08);
        assert_eq!(apu.read_status() & 0x01, 0x01);

        // Disabling clears the counter immediately.
        apu.write_register(0x4015, 0x00);
        assert_eq!(apu.read_status() & 0x01, 0);
    }

    #[test]
    fn four_step_sequencer_raises_frame_irq() {
        let mut apu = Apu::new(DEFAULT_SAMPLE_RATE);
        for _ in 0..SEQ_4STEP_WRAP {
            apu.tick();
        }
        assert!(apu.irq_pending());
        let status = apu.read_status();
        assert_ne!(status & 0x40, 0);
        assert!(!apu.irq_pending());
    }

    #[test]
    fn irq_inhibit_suppresses_frame_irq() {
        let mut apu = Apu::new(DEFAULT_SAMPLE_RATE);
        apu.write_register(0x4017, 0x40);
        for _ in 0..SEQ_4STEP_WRAP + 8 {
            apu.tick();
        }
        assert!(!apu.irq_pending());
    }

    #[test]
    fn five_step_mode_never_raises_irq() {
        let mut apu = Apu::new(DEFAULT_SAMPLE_RATE);
        apu.write_register(0x4017, 0x80);
        for _ in 0..SEQ_5STEP_WRAP + 8 {
            apu.tick();
        }
        assert!(!apu.irq_pending());
    }

    #[test]
    fn dmc_requests_dma_and_walks_addresses() {
        let mut apu = Apu::new(DEFAULT_SAMPLE_RATE);
        apu.write_register(0x4012, 0x01); // $C040
        apu.write_register(0x4013, 0x01); // 17 bytes
        apu.write_register(0x4015, 0x10);

        assert_eq!(apu.dmc_dma_request(), Some(0xC040));
        apu.finish_dmc_dma(0xFF);
        assert_eq!(apu.dmc_dma_request(), None);

        // Draining the shift register re-arms the fetch at the next address.
        for _ in 0..DMC_RATES[0] as u32 * 8 + 8 {
            apu.tick();
        }
        assert_eq!(apu.dmc_dma_request(), Some(0xC041));
    }

    #[test]
    fn dmc_sets_irq_at_end_of_sample() {
        let mut apu = Apu::new(DEFAULT_SAMPLE_RATE);
        apu.write_register(0x4010, 0x80); // IRQ on, no loop
        apu.write_register(0x4012, 0x00);
        apu.write_register(0x4013, 0x00); // 1 byte
        apu.write_register(0x4015, 0x10);

        assert_eq!(apu.dmc_dma_request(), Some(0xC000));
        apu.finish_dmc_dma(0xAA);
        assert!(apu.irq_pending());
        // Reading $4015 reports but does not clear the DMC IRQ; $4010 does.
        assert_ne!(apu.read_status() & 0x80, 0);
        apu.write_register(0x4010, 0x00);
        assert!(!apu.irq_pending());
    }

    #[test]
    fn triangle_is_silent_below_timer_two() {
        let mut apu = Apu::new(DEFAULT_SAMPLE_RATE);
        apu.write_register(0x4015, 0x04);
        apu.write_register(0x4008, 0x7F);
        apu.write_register(0x400A, 0x01);
        apu.write_register(0x400B, 0x08);
        apu.tick();
        assert_eq!(apu.triangle.output(), 0);

        apu.write_register(0x400A, 0x40);
        apu.write_register(0x400B, 0x08);
        // Clock the linear counter in via a quarter frame.
        apu.clock_quarter_frame();
        assert_ne!(apu.triangle.output(), 0);
    }

    #[test]
    fn snapshot_round_trip_preserves_sequencer_phase() {
        let mut apu = Apu::new(DEFAULT_SAMPLE_RATE);
        apu.write_register(0x4015, 0x0F);
        apu.write_register(0x4003, 0x10);
        for _ in 0..10_000 {
            apu.tick();
        }
        let state = apu.snapshot();
        let mut other = Apu::new(DEFAULT_SAMPLE_RATE);
        other.restore(&state).unwrap();
        assert_eq!(
            bincode::serialize(&other.snapshot()).unwrap(),
            bincode::serialize(&state).unwrap()
        );
    }
}
