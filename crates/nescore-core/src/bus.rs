//! NES System Bus Implementation.
//!
//! The bus connects the CPU to all other components:
//! - PPU registers ($2000-$2007, mirrored every 8 bytes to $3FFF)
//! - APU/IO registers ($4000-$4017)
//! - Cartridge space ($4020-$FFFF)
//! - Internal RAM ($0000-$07FF, mirrored to $1FFF)

use nescore_apu::Apu;
use nescore_cpu::Bus;
use nescore_mappers::Mapper;
use nescore_ppu::Ppu;

#[cfg(not(feature = "std"))]
use alloc::boxed::Box;

/// A single controller button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    /// A button.
    A,
    /// B button.
    B,
    /// Select button.
    Select,
    /// Start button.
    Start,
    /// D-pad up.
    Up,
    /// D-pad down.
    Down,
    /// D-pad left.
    Left,
    /// D-pad right.
    Right,
}

impl Button {
    const fn mask(self) -> u8 {
        match self {
            Self::A => ControllerState::A,
            Self::B => ControllerState::B,
            Self::Select => ControllerState::SELECT,
            Self::Start => ControllerState::START,
            Self::Up => ControllerState::UP,
            Self::Down => ControllerState::DOWN,
            Self::Left => ControllerState::LEFT,
            Self::Right => ControllerState::RIGHT,
        }
    }
}

/// Controller input state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControllerState {
    /// Button states: A, B, Select, Start, Up, Down, Left, Right
    pub buttons: u8,
}

impl ControllerState {
    /// A button mask.
    pub const A: u8 = 0x01;
    /// B button mask.
    pub const B: u8 = 0x02;
    /// Select button mask.
    pub const SELECT: u8 = 0x04;
    /// Start button mask.
    pub const START: u8 = 0x08;
    /// Up button mask.
    pub const UP: u8 = 0x10;
    /// Down button mask.
    pub const DOWN: u8 = 0x20;
    /// Left button mask.
    pub const LEFT: u8 = 0x40;
    /// Right button mask.
    pub const RIGHT: u8 = 0x80;

    /// Set or clear a single button.
    pub fn set_button(&mut self, button: Button, pressed: bool) {
        if pressed {
            self.buttons |= button.mask();
        } else {
            self.buttons &= !button.mask();
        }
    }
}

/// NES system bus connecting all components.
pub struct NesBus {
    /// Internal RAM (2KB, mirrored 4 times).
    pub ram: [u8; 2048],
    /// PPU (Picture Processing Unit).
    pub ppu: Ppu,
    /// APU (Audio Processing Unit).
    pub apu: Apu,
    /// Cartridge mapper.
    pub mapper: Box<dyn Mapper>,
    /// Controller 1 state.
    pub controller1: ControllerState,
    /// Controller 2 state.
    pub controller2: ControllerState,
    /// Controller 1 shift register.
    controller1_shift: u8,
    /// Controller 2 shift register.
    controller2_shift: u8,
    /// Controller strobe latch.
    controller_strobe: bool,
    /// OAM DMA page.
    oam_dma_page: Option<u8>,
    /// CPU cycle counter for DMA timing.
    cpu_cycles: u64,
    /// DMC DMA stall cycles.
    dmc_stall_cycles: u8,
    /// Last value on the data bus (for open bus behavior).
    last_bus_value: u8,
    /// NMI pending from PPU.
    nmi_pending: bool,
    /// Sample accumulator for downsampling.
    sample_count: u32,
    /// Sample sum for averaging.
    sample_sum: f32,
}

impl NesBus {
    /// CPU cycles per audio sample (at 44100 Hz).
    const CYCLES_PER_SAMPLE: u32 = nescore_apu::CPU_CLOCK_NTSC / 44100;

    /// Create a new NES bus with the given mapper.
    pub fn new(mapper: Box<dyn Mapper>) -> Self {
        let mirroring = mapper.mirroring();
        Self {
            ram: [0; 2048],
            ppu: Ppu::new(mirroring),
            apu: Apu::new(),
            mapper,
            controller1: ControllerState::default(),
            controller2: ControllerState::default(),
            controller1_shift: 0,
            controller2_shift: 0,
            controller_strobe: false,
            oam_dma_page: None,
            cpu_cycles: 0,
            dmc_stall_cycles: 0,
            last_bus_value: 0,
            nmi_pending: false,
            sample_count: 0,
            sample_sum: 0.0,
        }
    }

    /// Reset the bus and all components.
    pub fn reset(&mut self) {
        self.ram.fill(0);
        self.ppu.reset();
        self.ppu.set_mirroring(self.mapper.mirroring());
        self.apu.reset();
        self.mapper.reset();
        self.controller1_shift = 0;
        self.controller2_shift = 0;
        self.controller_strobe = false;
        self.oam_dma_page = None;
        self.cpu_cycles = 0;
        self.dmc_stall_cycles = 0;
        self.last_bus_value = 0;
        self.nmi_pending = false;
        self.sample_count = 0;
        self.sample_sum = 0.0;
    }

    /// Check if OAM DMA is pending.
    #[must_use]
    pub fn oam_dma_pending(&self) -> bool {
        self.oam_dma_page.is_some()
    }

    /// Execute OAM DMA transfer.
    ///
    /// Returns the number of CPU cycles consumed.
    pub fn execute_oam_dma(&mut self) -> u16 {
        if let Some(page) = self.oam_dma_page.take() {
            let base = u16::from(page) << 8;

            let mut data = [0u8; 256];
            for (i, slot) in data.iter_mut().enumerate() {
                let addr = base.wrapping_add(i as u16);
                *slot = self.cpu_read(addr);
            }
            self.ppu.oam_dma(&data);

            // DMA takes 513 or 514 cycles depending on CPU cycle parity
            let cycles: u16 = if self.cpu_cycles % 2 == 1 { 514 } else { 513 };
            self.cpu_cycles += u64::from(cycles);
            cycles
        } else {
            0
        }
    }

    /// Internal CPU read without updating bus state (for DMA).
    fn cpu_read(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.ram[(addr & 0x07FF) as usize],
            0x8000..=0xFFFF => self.mapper.read_prg(addr),
            _ => 0,
        }
    }

    /// Step the PPU by 3 dots (one CPU cycle worth).
    ///
    /// Returns `(nmi, frame_complete)`: `nmi` is true if NMI should be
    /// triggered, `frame_complete` is true the dot the PPU crosses into
    /// post-render (the real frame boundary, not a fixed cycle count).
    pub fn step_ppu(&mut self) -> (bool, bool) {
        let mut nmi = false;
        let mut frame_complete = false;

        for _ in 0..3 {
            let mapper = &self.mapper;
            let (frame_done, n) = self.ppu.step_with_chr(|addr| mapper.read_chr(addr));
            if frame_done {
                frame_complete = true;
            }
            if n {
                nmi = true;
            }

            // MMC3-style scanline IRQ counter: clocked once per visible
            // scanline. Accurate hardware clocks this from PPU A12 toggles;
            // this mirrors the mapper's own simplified scanline() hook.
            if self.ppu.dot() == 260 && self.ppu.scanline() < 240 {
                self.mapper.scanline();
            }
        }

        self.mapper.clock(1);

        if nmi {
            self.nmi_pending = true;
        }

        (nmi, frame_complete)
    }

    /// Step the APU by one CPU cycle.
    ///
    /// Returns audio sample if available.
    pub fn step_apu(&mut self) -> Option<f32> {
        self.apu.clock();

        // Handle DMC sample fetch
        if self.apu.dmc_needs_sample() {
            let addr = self.apu.dmc_sample_addr();
            let sample = self.mapper.read_prg(addr);
            self.apu.dmc_fill_sample(sample);
            // DMC DMA stalls CPU for 4 cycles
            self.dmc_stall_cycles = 4;
        }

        // Accumulate samples for downsampling
        self.sample_sum += self.apu.output();
        self.sample_count += 1;

        if self.sample_count >= Self::CYCLES_PER_SAMPLE {
            #[allow(clippy::cast_precision_loss)]
            let sample = self.sample_sum / self.sample_count as f32;
            self.sample_count = 0;
            self.sample_sum = 0.0;
            Some(sample)
        } else {
            None
        }
    }

    /// Check if NMI is pending.
    #[must_use]
    pub fn nmi_pending(&self) -> bool {
        self.nmi_pending
    }

    /// Acknowledge NMI.
    pub fn acknowledge_nmi(&mut self) {
        self.nmi_pending = false;
    }

    /// Check if IRQ is pending (from mapper or APU frame/DMC IRQ).
    #[must_use]
    pub fn irq_pending(&self) -> bool {
        self.mapper.irq_pending() || self.apu.irq_pending()
    }

    /// Acknowledge mapper IRQ.
    pub fn acknowledge_mapper_irq(&mut self) {
        self.mapper.irq_acknowledge();
    }

    /// Get the current CPU cycle count.
    #[must_use]
    pub fn cpu_cycles(&self) -> u64 {
        self.cpu_cycles
    }

    /// Increment CPU cycle count.
    pub fn add_cpu_cycles(&mut self, cycles: u8) {
        self.cpu_cycles += u64::from(cycles);
    }

    /// Read controller register.
    fn read_controller(&mut self, port: u8) -> u8 {
        // Open bus behavior: bits 5-7 come from last bus value
        let open_bus = self.last_bus_value & 0xE0;

        // While strobe is high the shift register is continuously
        // reloaded, so every read returns the live A button and never
        // shifts.
        if self.controller_strobe {
            let buttons = if port == 0 {
                self.controller1.buttons
            } else {
                self.controller2.buttons
            };
            return (buttons & 1) | open_bus;
        }

        let shift = if port == 0 {
            &mut self.controller1_shift
        } else {
            &mut self.controller2_shift
        };

        // Read bit 0 from shift register
        let data = (*shift & 1) | open_bus;
        *shift >>= 1;
        *shift |= 0x80; // Shift in 1s after all buttons read

        data
    }

    /// Write controller strobe.
    fn write_controller_strobe(&mut self, val: u8) {
        let new_strobe = val & 1 != 0;

        // On falling edge (strobe 1->0), latch controller state
        if self.controller_strobe && !new_strobe {
            self.controller1_shift = self.controller1.buttons;
            self.controller2_shift = self.controller2.buttons;
        }

        self.controller_strobe = new_strobe;

        // While strobe is high, continuously reload
        if self.controller_strobe {
            self.controller1_shift = self.controller1.buttons;
            self.controller2_shift = self.controller2.buttons;
        }
    }

    /// Check if DMC stall is active.
    #[must_use]
    pub fn dmc_stall_active(&self) -> bool {
        self.dmc_stall_cycles > 0
    }

    /// Decrement DMC stall counter.
    pub fn decrement_dmc_stall(&mut self) {
        if self.dmc_stall_cycles > 0 {
            self.dmc_stall_cycles -= 1;
        }
    }

    /// Peek at memory without side effects.
    ///
    /// This is useful for debugging/display purposes where we don't want
    /// to trigger PPU register side effects or mapper state changes.
    #[must_use]
    pub fn peek(&self, addr: u16) -> u8 {
        match addr {
            // Internal RAM (mirrored every 2KB)
            0x0000..=0x1FFF => self.ram[(addr & 0x07FF) as usize],

            // PPU registers - return last bus value to avoid side effects
            0x2000..=0x3FFF => self.last_bus_value,

            // APU and I/O registers
            0x4000..=0x4017 => match addr {
                0x4015 => self.apu.peek_status(),
                _ => self.last_bus_value,
            },

            // APU test mode
            0x4018..=0x401F => self.last_bus_value,

            // Cartridge space
            0x4020..=0xFFFF => self.mapper.read_prg(addr),
        }
    }
}

/// CPU bus implementation.
impl Bus for NesBus {
    fn read(&mut self, addr: u16) -> u8 {
        let value = match addr {
            // Internal RAM (mirrored every 2KB)
            0x0000..=0x1FFF => self.ram[(addr & 0x07FF) as usize],

            // PPU registers (mirrored every 8 bytes)
            0x2000..=0x3FFF => {
                let mapper = &self.mapper;
                self.ppu.read_register(addr, |a| mapper.read_chr(a))
            }

            // APU and I/O registers
            0x4000..=0x4017 => match addr {
                0x4015 => self.apu.read_status(),
                0x4016 => self.read_controller(0),
                0x4017 => self.read_controller(1),
                _ => self.last_bus_value, // Write-only registers
            },

            // APU test mode (normally disabled)
            0x4018..=0x401F => self.last_bus_value,

            // Cartridge space
            0x4020..=0xFFFF => self.mapper.read_prg(addr),
        };

        self.last_bus_value = value;
        value
    }

    fn write(&mut self, addr: u16, val: u8) {
        self.last_bus_value = val;

        match addr {
            // Internal RAM (mirrored every 2KB)
            0x0000..=0x1FFF => {
                self.ram[(addr & 0x07FF) as usize] = val;
            }

            // PPU registers (mirrored every 8 bytes)
            0x2000..=0x3FFF => {
                let mapper = &mut self.mapper;
                self.ppu
                    .write_register(addr, val, |a, v| mapper.write_chr(a, v));
            }

            // APU and I/O registers
            0x4000..=0x4017 => match addr {
                0x4000..=0x4013 | 0x4015 | 0x4017 => {
                    self.apu.write(addr, val);
                }
                0x4014 => {
                    // OAM DMA
                    self.oam_dma_page = Some(val);
                }
                0x4016 => {
                    self.write_controller_strobe(val);
                }
                _ => {}
            },

            // APU test mode (normally disabled)
            0x4018..=0x401F => {}

            // Cartridge space
            0x4020..=0xFFFF => {
                self.mapper.write_prg(addr, val);
                // Some mappers (e.g. MMC1, MMC3) change nametable mirroring
                // via PRG register writes; keep the PPU's view in sync.
                self.ppu.set_mirroring(self.mapper.mirroring());
            }
        }
    }
}
