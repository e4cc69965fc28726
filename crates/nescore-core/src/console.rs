//! NES Console Implementation.
//!
//! The Console struct provides the high-level emulation API, managing the
//! CPU, PPU, APU, and mapper integration with proper timing.

use crate::bus::{Button, ControllerState, NesBus};
use nescore_cpu::Cpu;
use nescore_mappers::{Mapper, Rom, RomError, create_mapper};

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, string::String, vec, vec::Vec};

/// NES emulation timing constants.
pub mod timing {
    /// Master clock frequency (NTSC).
    pub const MASTER_CLOCK_NTSC: u32 = 21_477_272;
    /// CPU clock frequency (NTSC). Matches the APU's own authoritative
    /// clock rate rather than a truncated `MASTER_CLOCK_NTSC / 12`.
    pub const CPU_CLOCK_NTSC: u32 = nescore_apu::CPU_CLOCK_NTSC;
    /// PPU clock frequency (NTSC).
    pub const PPU_CLOCK_NTSC: u32 = MASTER_CLOCK_NTSC / 4;
    /// CPU cycles per frame (NTSC).
    pub const CPU_CYCLES_PER_FRAME: u32 = 29_780;
    /// PPU dots per scanline.
    pub const PPU_DOTS_PER_SCANLINE: u16 = 341;
    /// Total scanlines (including vblank).
    pub const PPU_SCANLINES: u16 = 262;
    /// Target frame rate (NTSC).
    pub const FRAME_RATE_NTSC: f64 = 60.0988;
}

/// Console error type.
#[derive(Debug, Clone)]
pub enum ConsoleError {
    /// ROM loading error (bad header, truncated data, unsupported mapper).
    RomError(RomError),
    /// Invalid state.
    InvalidState(String),
}

impl From<RomError> for ConsoleError {
    fn from(err: RomError) -> Self {
        Self::RomError(err)
    }
}

impl core::fmt::Display for ConsoleError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::RomError(e) => write!(f, "ROM error: {e}"),
            Self::InvalidState(msg) => write!(f, "Invalid state: {msg}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ConsoleError {}

/// NES console emulator.
pub struct Console {
    /// 6502 CPU.
    cpu: Cpu,
    /// System bus (PPU, APU, mapper, RAM).
    bus: NesBus,
    /// Frame buffer (256x240 RGBA).
    framebuffer: Vec<u8>,
    /// Audio sample buffer.
    audio_buffer: Vec<f32>,
    /// Total CPU cycles executed.
    total_cycles: u64,
    /// Frame counter.
    frame_count: u64,
    /// Is emulation running?
    running: bool,
    /// Set when the PPU has crossed into post-render since the last
    /// `step_frame()` call began.
    frame_ready: bool,
}

impl Console {
    /// Load a ROM and build a console, wiring cartridge, mapper and buses
    /// and resetting CPU/PPU/APU to their power-on state.
    ///
    /// # Errors
    ///
    /// Returns an error if the ROM cannot be parsed or uses an unsupported
    /// mapper.
    pub fn load_rom(rom_data: &[u8]) -> Result<Self, ConsoleError> {
        Self::new(rom_data)
    }

    /// Create a new console with the given ROM.
    ///
    /// # Errors
    ///
    /// Returns an error if the ROM cannot be loaded or uses an unsupported mapper.
    pub fn new(rom_data: &[u8]) -> Result<Self, ConsoleError> {
        let rom = Rom::load(rom_data)?;
        let mapper = create_mapper(&rom)?;
        let mut console = Self::with_mapper(mapper)?;
        console.reset();
        Ok(console)
    }

    /// Create a new console from ROM bytes (alias for `new`).
    ///
    /// # Errors
    ///
    /// Returns an error if the ROM cannot be loaded or uses an unsupported mapper.
    pub fn from_rom_bytes(rom_data: &[u8]) -> Result<Self, ConsoleError> {
        Self::new(rom_data)
    }

    /// Create a new console from ROM bytes with sample rate configuration.
    ///
    /// Note: The sample rate is currently unused as the APU handles resampling internally.
    ///
    /// # Errors
    ///
    /// Returns an error if the ROM cannot be loaded or uses an unsupported mapper.
    pub fn from_rom_bytes_with_sample_rate(
        rom_data: &[u8],
        _sample_rate: u32,
    ) -> Result<Self, ConsoleError> {
        Self::new(rom_data)
    }

    /// Create a console with a pre-created mapper.
    ///
    /// # Errors
    ///
    /// Returns an error if the console cannot be initialized.
    pub fn with_mapper(mapper: Box<dyn Mapper>) -> Result<Self, ConsoleError> {
        let bus = NesBus::new(mapper);
        let cpu = Cpu::new();

        Ok(Self {
            cpu,
            bus,
            framebuffer: vec![0; 256 * 240 * 4],
            audio_buffer: Vec::with_capacity(2048),
            total_cycles: 0,
            frame_count: 0,
            running: true,
            frame_ready: false,
        })
    }

    /// Reset the console to initial state.
    pub fn reset(&mut self) {
        self.bus.reset();
        self.cpu.reset(&mut self.bus);
        self.total_cycles = 0;
        self.running = true;
    }

    /// Power on the console (cold boot).
    pub fn power_on(&mut self) {
        self.reset();
    }

    /// Run emulation for one CPU instruction.
    ///
    /// Returns the number of CPU cycles executed.
    pub fn step(&mut self) -> u8 {
        if !self.running {
            return 0;
        }

        // Handle DMC DMA stall
        if self.bus.dmc_stall_active() {
            self.bus.decrement_dmc_stall();
            self.step_components(1);
            return 1;
        }

        // Handle OAM DMA
        if self.bus.oam_dma_pending() {
            let dma_cycles = self.bus.execute_oam_dma();
            self.step_components(dma_cycles);
            self.total_cycles += u64::from(dma_cycles);
            // 513-514 cycles don't fit in u8; callers wanting the exact
            // count should read `total_cycles()` deltas instead.
            return dma_cycles.min(u16::from(u8::MAX)) as u8;
        }

        // NMI is edge-triggered: latch it the instant the PPU raises it.
        if self.bus.nmi_pending() {
            self.bus.acknowledge_nmi();
            self.cpu.raise_nmi();
        }
        // IRQ is level-triggered: the CPU samples this line every cycle
        // internally and applies its own one-instruction acknowledge delay.
        self.cpu.raise_irq(self.bus.irq_pending());

        // Execute one CPU instruction
        let cycles = self.cpu.step(&mut self.bus);
        self.step_components(u16::from(cycles));
        self.bus.add_cpu_cycles(cycles);
        self.total_cycles += u64::from(cycles);

        cycles
    }

    /// Step PPU and APU for the given number of CPU cycles.
    ///
    /// Latches `frame_ready` the dot the PPU crosses into post-render, so
    /// `step_frame()` can stop on the real frame boundary instead of a
    /// fixed cycle count.
    fn step_components(&mut self, cpu_cycles: u16) {
        for _ in 0..cpu_cycles {
            // Step PPU (3 dots per CPU cycle)
            let (_nmi, frame_complete) = self.bus.step_ppu();
            if frame_complete {
                self.frame_ready = true;
            }

            // Step APU (1:1 with CPU)
            if let Some(sample) = self.bus.step_apu() {
                self.audio_buffer.push(sample);
            }
        }
    }

    /// Run emulation until the PPU completes a frame (the odd-frame dot
    /// skip makes this 29,780 or 29,781 CPU cycles in alternation).
    ///
    /// Returns the current framebuffer (256x240 RGBA).
    pub fn run_frame(&mut self) -> &[u8] {
        self.step_frame();
        self.framebuffer()
    }

    /// Run emulation until the PPU completes a frame.
    ///
    /// Returns the actual number of CPU cycles executed.
    pub fn step_frame(&mut self) -> u64 {
        let start_cycles = self.total_cycles;
        self.frame_ready = false;

        while !self.frame_ready && self.running {
            self.step();
        }

        // Copy PPU framebuffer
        self.update_framebuffer();
        self.frame_count += 1;

        self.total_cycles - start_cycles
    }

    /// Run emulation for one frame with cycle-accurate timing.
    ///
    /// This is an alias for `step_frame()` for API compatibility.
    /// Returns the actual number of CPU cycles executed.
    pub fn step_frame_accurate(&mut self) -> u64 {
        self.step_frame()
    }

    /// Update the framebuffer from PPU output.
    fn update_framebuffer(&mut self) {
        let ppu_buffer = self.bus.ppu.frame_buffer();

        // Convert PPU palette indices to RGBA
        for (i, &palette_idx) in ppu_buffer.iter().enumerate() {
            let rgb = crate::palette::palette_to_rgb(palette_idx);
            let offset = i * 4;
            self.framebuffer[offset] = rgb.0; // R
            self.framebuffer[offset + 1] = rgb.1; // G
            self.framebuffer[offset + 2] = rgb.2; // B
            self.framebuffer[offset + 3] = 255; // A
        }
    }

    /// Get the current framebuffer (256x240 RGBA).
    #[must_use]
    pub fn framebuffer(&self) -> &[u8] {
        &self.framebuffer
    }

    /// Drain accumulated audio samples since the last call, converting
    /// from the APU's normalized `f32` output to signed 16-bit PCM.
    pub fn audio_drain(&mut self) -> Vec<i16> {
        self.take_audio()
            .into_iter()
            .map(|sample| (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16)
            .collect()
    }

    /// Take the audio buffer (drains accumulated samples).
    pub fn take_audio(&mut self) -> Vec<f32> {
        core::mem::take(&mut self.audio_buffer)
    }

    /// Get the audio buffer without draining.
    #[must_use]
    pub fn audio_buffer(&self) -> &[f32] {
        &self.audio_buffer
    }

    /// Get audio samples (alias for `audio_buffer`).
    #[must_use]
    pub fn audio_samples(&self) -> &[f32] {
        &self.audio_buffer
    }

    /// Clear the audio sample buffer.
    pub fn clear_audio_samples(&mut self) {
        self.audio_buffer.clear();
    }

    /// Update one button on one controller port (0 or 1).
    pub fn set_button(&mut self, port: u8, button: Button, pressed: bool) {
        let state = if port == 0 {
            &mut self.bus.controller1
        } else {
            &mut self.bus.controller2
        };
        state.set_button(button, pressed);
    }

    /// Set controller 1 state from button byte.
    pub fn set_controller_1(&mut self, buttons: u8) {
        self.bus.controller1 = ControllerState { buttons };
    }

    /// Set controller 2 state from button byte.
    pub fn set_controller_2(&mut self, buttons: u8) {
        self.bus.controller2 = ControllerState { buttons };
    }

    /// Set controller 1 state.
    pub fn set_controller1(&mut self, state: ControllerState) {
        self.bus.controller1 = state;
    }

    /// Set controller 2 state.
    pub fn set_controller2(&mut self, state: ControllerState) {
        self.bus.controller2 = state;
    }

    /// Get controller 1 state.
    #[must_use]
    pub fn controller1(&self) -> ControllerState {
        self.bus.controller1
    }

    /// Get controller 2 state.
    #[must_use]
    pub fn controller2(&self) -> ControllerState {
        self.bus.controller2
    }

    /// Get the total CPU cycles executed.
    #[must_use]
    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Get the frame count.
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Check if emulation is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Pause emulation.
    pub fn pause(&mut self) {
        self.running = false;
    }

    /// Resume emulation.
    pub fn resume(&mut self) {
        self.running = true;
    }

    /// Get a reference to the CPU for debugging.
    #[must_use]
    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    /// Get a reference to the PPU for debugging.
    #[must_use]
    pub fn ppu(&self) -> &nescore_ppu::Ppu {
        &self.bus.ppu
    }

    /// Get a reference to the APU for debugging.
    #[must_use]
    pub fn apu(&self) -> &nescore_apu::Apu {
        &self.bus.apu
    }

    /// Get the total CPU cycles (alias for `total_cycles`).
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Peek at memory without side effects.
    ///
    /// This is useful for debugging/display purposes where we don't want
    /// to trigger PPU register side effects or mapper state changes.
    #[must_use]
    pub fn peek_memory(&self, addr: u16) -> u8 {
        self.bus.peek(addr)
    }

    /// Get a reference to the bus for debugging.
    #[must_use]
    pub fn bus(&self) -> &NesBus {
        &self.bus
    }

    /// Get a mutable reference to the bus.
    pub fn bus_mut(&mut self) -> &mut NesBus {
        &mut self.bus
    }

    /// Get the mapper number.
    #[must_use]
    pub fn mapper_number(&self) -> u16 {
        self.bus.mapper.mapper_number()
    }

    /// Get the mapper name.
    #[must_use]
    pub fn mapper_name(&self) -> &'static str {
        self.bus.mapper.mapper_name()
    }

    /// Check if the ROM has battery-backed RAM.
    #[must_use]
    pub fn has_battery(&self) -> bool {
        self.bus.mapper.has_battery()
    }

    /// Get battery-backed RAM for saving.
    #[must_use]
    pub fn battery_ram(&self) -> Option<&[u8]> {
        self.bus.mapper.battery_ram()
    }

    /// Load battery-backed RAM.
    pub fn load_battery_ram(&mut self, data: &[u8]) {
        self.bus.mapper.set_battery_ram(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nescore_cpu::Bus;
    use nescore_mappers::{Mirroring, Nrom, RomHeader};

    #[cfg(not(feature = "std"))]
    use alloc::{boxed::Box, vec};

    fn create_test_console() -> Console {
        let rom = Rom {
            header: RomHeader {
                prg_rom_size: 32768,
                chr_rom_size: 8192,
                mapper_number: 0,
                submapper: 0,
                mirroring: Mirroring::Vertical,
                has_battery: false,
                has_trainer: false,
                nes2_format: false,
                prg_ram_size: 8192,
                prg_nvram_size: 0,
                chr_ram_size: 0,
                chr_nvram_size: 0,
            },
            // Simple program: NOP loop at $8000
            prg_rom: {
                let mut prg = vec![0xEA; 32768]; // Fill with NOPs
                // Reset vector at $FFFC points to $8000
                prg[0x7FFC] = 0x00;
                prg[0x7FFD] = 0x80;
                prg
            },
            chr_rom: vec![0; 8192],
            trainer: None,
        };
        Console::with_mapper(Box::new(Nrom::new(&rom))).unwrap()
    }

    #[test]
    fn test_console_creation() {
        let console = create_test_console();
        assert_eq!(console.mapper_number(), 0);
        assert_eq!(console.mapper_name(), "NROM");
    }

    #[test]
    fn test_console_step() {
        let mut console = create_test_console();
        console.reset();

        let cycles = console.step();
        assert!(cycles > 0);
        assert!(console.total_cycles() > 0);
    }

    #[test]
    fn test_console_framebuffer() {
        let console = create_test_console();
        let fb = console.framebuffer();
        assert_eq!(fb.len(), 256 * 240 * 4);
    }

    #[test]
    fn test_console_pause_resume() {
        let mut console = create_test_console();
        assert!(console.is_running());

        console.pause();
        assert!(!console.is_running());

        console.resume();
        assert!(console.is_running());
    }

    #[test]
    fn test_controller_state() {
        let mut console = create_test_console();

        let state = ControllerState {
            buttons: ControllerState::A | ControllerState::START,
        };
        console.set_controller1(state);

        assert_eq!(console.controller1().buttons, 0x09);
    }

    #[test]
    fn test_set_button() {
        let mut console = create_test_console();

        console.set_button(0, Button::A, true);
        console.set_button(0, Button::Start, true);
        assert_eq!(console.controller1().buttons, 0x09);

        console.set_button(0, Button::A, false);
        assert_eq!(console.controller1().buttons, 0x08);
    }

    #[test]
    fn test_console_reset() {
        let mut console = create_test_console();

        // Run some cycles
        for _ in 0..100 {
            console.step();
        }

        let cycles_before = console.total_cycles();
        assert!(cycles_before > 0);

        console.reset();
        assert_eq!(console.total_cycles(), 0);
    }

    #[test]
    fn test_smallest_legal_rom_reset_vector() {
        // Offset 0x0000 in PRG = 0xEA (NOP); reset vector at $FFFC/$FFFD -> $8000.
        let mut console = create_test_console();
        console.reset();

        assert_eq!(console.cpu().pc, 0x8000);

        let cycles = console.step();
        assert_eq!(cycles, 2);
        assert_eq!(console.cpu().pc, 0x8001);
    }

    fn console_with_program(program: &[u8]) -> Console {
        let mut rom_bytes = vec![0xEA; 32768];
        rom_bytes[..program.len()].copy_from_slice(program);
        // Reset vector -> $8000.
        rom_bytes[0x7FFC] = 0x00;
        rom_bytes[0x7FFD] = 0x80;

        let rom = Rom {
            header: RomHeader {
                prg_rom_size: 32768,
                chr_rom_size: 8192,
                mapper_number: 0,
                submapper: 0,
                mirroring: Mirroring::Vertical,
                has_battery: false,
                has_trainer: false,
                nes2_format: false,
                prg_ram_size: 8192,
                prg_nvram_size: 0,
                chr_ram_size: 0,
                chr_nvram_size: 0,
            },
            prg_rom: rom_bytes,
            chr_rom: vec![0; 8192],
            trainer: None,
        };
        let mut console = Console::with_mapper(Box::new(Nrom::new(&rom))).unwrap();
        console.reset();
        console
    }

    #[test]
    fn test_branch_sign_extension_loops_in_place() {
        // LDA #$00; BPL $-2; BRK -- BPL's target is itself, so once N is
        // clear the CPU loops at the branch forever.
        let mut console = console_with_program(&[0xA9, 0x00, 0x10, 0xFE, 0x00]);

        console.step(); // LDA #$00 -> PC = $8002, N clear
        assert_eq!(console.cpu().pc, 0x8002);

        for _ in 0..2 {
            console.step(); // BPL, taken, branches back to itself
            assert_eq!(console.cpu().pc, 0x8002);
        }
    }

    #[test]
    fn test_indirect_jmp_page_cross_bug() {
        // JMP ($02FF) must take its high byte from $0200, not $0300.
        let mut console = console_with_program(&[0x6C, 0xFF, 0x02]);
        {
            let bus = console.bus_mut();
            Bus::write(bus, 0x02FF, 0x34);
            Bus::write(bus, 0x0200, 0x12);
            Bus::write(bus, 0x0300, 0xFF); // a non-buggy JMP would read the high byte from here
        }

        console.step();
        assert_eq!(console.cpu().pc, 0x1234);
    }

    #[test]
    fn test_vblank_set_and_clear_on_read() {
        let mut console = create_test_console();
        console.reset();

        let bus = console.bus_mut();
        while !(bus.ppu.scanline() == 241 && bus.ppu.dot() == 1) {
            bus.step_ppu();
        }

        assert_eq!(Bus::read(bus, 0x2002) & 0x80, 0x80);
        assert_eq!(Bus::read(bus, 0x2002) & 0x80, 0x00);
    }

    fn console_with_chr_ram() -> Console {
        let mut prg = vec![0xEA; 32768];
        prg[0x7FFC] = 0x00;
        prg[0x7FFD] = 0x80;
        let rom = Rom {
            header: RomHeader {
                prg_rom_size: prg.len(),
                chr_rom_size: 0,
                mapper_number: 0,
                submapper: 0,
                mirroring: Mirroring::Vertical,
                has_battery: false,
                has_trainer: false,
                nes2_format: false,
                prg_ram_size: 0,
                prg_nvram_size: 0,
                chr_ram_size: 8192,
                chr_nvram_size: 0,
            },
            prg_rom: prg,
            chr_rom: Vec::new(),
            trainer: None,
        };
        let mut console = Console::with_mapper(Box::new(Nrom::new(&rom))).unwrap();
        console.reset();
        console
    }

    #[test]
    fn test_sprite_zero_hit_flag() {
        let mut console = console_with_chr_ram();

        {
            let bus = console.bus_mut();
            // Tile 1's pattern data: row 0 fully opaque (used by the
            // sprite, whose own row 0 lands on scanline 20) and row 4,
            // column 2 opaque (the background cell covering pixel (10, 20):
            // tile column 1, tile row 2, so pixel-local row 4, column 2).
            bus.mapper.write_chr(0x10, 0xFF); // tile 1, plane 0, row 0
            bus.mapper.write_chr(0x14, 0x20); // tile 1, plane 0, row 4, col 2

            Bus::write(bus, 0x2000, 0x00); // PPUCTRL: nametable 0, 8x8 sprites
            bus.ppu.write_register(0x2001, 0x18, |_, _| {}); // show bg + sprites

            // Place tile 1 at nametable cell (col 1, row 2), which covers
            // pixel (10, 20): $2000 + 2*32 + 1 = $2041.
            Bus::write(bus, 0x2006, 0x20);
            Bus::write(bus, 0x2006, 0x41);
            Bus::write(bus, 0x2007, 0x01);

            // Sprite 0 at (10, 20) using tile 1. OAM Y is the scanline
            // above the sprite's actual top row.
            bus.ppu.write_register(0x2003, 0x00, |_, _| {});
            bus.ppu.write_register(0x2004, 19, |_, _| {}); // Y
            bus.ppu.write_register(0x2004, 0x01, |_, _| {}); // tile index
            bus.ppu.write_register(0x2004, 0x00, |_, _| {}); // attributes
            bus.ppu.write_register(0x2004, 10, |_, _| {}); // X

            while !(bus.ppu.scanline() == 20 && bus.ppu.dot() == 0) {
                bus.step_ppu();
            }
            assert_eq!(Bus::read(bus, 0x2002) & 0x40, 0x00);

            while !(bus.ppu.scanline() == 20 && bus.ppu.dot() == 11) {
                bus.step_ppu();
            }
        }

        assert_eq!(Bus::read(console.bus_mut(), 0x2002) & 0x40, 0x40);
    }

    #[test]
    fn test_mmc3_irq_count_per_frame() {
        use nescore_mappers::Mmc3;

        let mut prg = vec![0xEA; 256 * 1024];
        prg[0x3FFFC] = 0x00;
        prg[0x3FFFD] = 0x80;
        let rom = Rom {
            header: RomHeader {
                prg_rom_size: prg.len(),
                chr_rom_size: 8192,
                mapper_number: 4,
                submapper: 0,
                mirroring: Mirroring::Vertical,
                has_battery: false,
                has_trainer: false,
                nes2_format: false,
                prg_ram_size: 0,
                prg_nvram_size: 0,
                chr_ram_size: 0,
                chr_nvram_size: 0,
            },
            prg_rom: prg,
            chr_rom: vec![0; 8192],
            trainer: None,
        };

        let mut console = Console::with_mapper(Box::new(Mmc3::new(&rom))).unwrap();
        console.reset();

        {
            let bus = console.bus_mut();
            // A latch of N fires every N+1 scanline clocks (the first clock
            // after a reload only reloads, it never fires) -- use 4 to get
            // a five-scanline period.
            bus.mapper.write_prg(0xC000, 4);
            bus.mapper.write_prg(0xC001, 0); // reload on next clock
            bus.mapper.write_prg(0xE001, 0); // enable IRQ
            bus.ppu.write_register(0x2001, 0x18, |_, _| {}); // enable rendering
        }

        let mut irq_count = 0u32;
        let target_cycles = console.total_cycles() + u64::from(timing::CPU_CYCLES_PER_FRAME);
        while console.total_cycles() < target_cycles {
            if console.bus_mut().mapper.irq_pending() {
                irq_count += 1;
                console.bus_mut().acknowledge_mapper_irq();
            }
            console.step();
        }

        // One IRQ per 5 rendered scanlines across 240 visible scanlines.
        assert_eq!(irq_count, 240 / 5);
    }
}
