pub mod cartridge;
pub mod cpu;
pub mod mapper;
pub mod ppu;

use anyhow::Result;
use std::{collections::VecDeque, path::Path};

use cartridge::{Cartridge, RomError};
use cpu::{Bus, Cpu, Interrupt};
use mapper::{Mapper, create_mapper, mapper_name};
use ppu::{Ppu, PpuDebugCounters, VideoSink};

pub const BUTTON_A: u8 = 0x01;
pub const BUTTON_B: u8 = 0x02;
pub const BUTTON_SELECT: u8 = 0x04;
pub const BUTTON_START: u8 = 0x08;
pub const BUTTON_UP: u8 = 0x10;
pub const BUTTON_DOWN: u8 = 0x20;
pub const BUTTON_LEFT: u8 = 0x40;
pub const BUTTON_RIGHT: u8 = 0x80;

/// Live controller supplier, polled on every strobe-register write. Low byte
/// is pad 1, high byte pad 2, `BUTTON_*` bits within each.
pub trait InputSource {
    fn poll(&mut self) -> u16;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NesDebugCounters {
    pub frame_count: u64,
    pub run_slices: u64,
    pub cpu_reads: u64,
    pub cpu_writes: u64,
    pub cpu_reads_ram: u64,
    pub cpu_reads_ppu_regs: u64,
    pub cpu_reads_io: u64,
    pub cpu_reads_cart: u64,
    pub cpu_writes_ram: u64,
    pub cpu_writes_ppu_regs: u64,
    pub cpu_writes_io: u64,
    pub cpu_writes_cart: u64,
    pub dma_transfers: u64,
    pub nmi_delivered: u64,
    pub last_cpu_read_addr: u16,
    pub last_cpu_write_addr: u16,
    pub last_cpu_write_value: u8,
}

/// Everything on the far side of the CPU pins: RAM, PPU registers, DMA and
/// controller ports, cartridge space. Owns the interrupt and stall lines the
/// core polls between instructions.
struct SystemBus {
    ram: [u8; 2048],
    ppu: Ppu,
    mapper: Option<Box<dyn Mapper>>,
    mapper_name: String,

    pad_states: u16,
    pad1_shift: u8,
    pad2_shift: u8,
    strobe: bool,
    input: Option<Box<dyn InputSource>>,

    stall: u64,
    pending: Option<Interrupt>,

    debug: NesDebugCounters,
    debug_events: VecDeque<String>,
}

impl SystemBus {
    fn new() -> Self {
        Self {
            ram: [0; 2048],
            ppu: Ppu::new(),
            mapper: None,
            mapper_name: "No ROM loaded".to_string(),
            pad_states: 0,
            pad1_shift: 0,
            pad2_shift: 0,
            strobe: false,
            input: None,
            stall: 0,
            pending: None,
            debug: NesDebugCounters::default(),
            debug_events: VecDeque::with_capacity(512),
        }
    }

    /// Catch the PPU up to the CPU clock, then collect any NMI edge it
    /// produced along the way.
    fn sync_ppu(&mut self, now: u64) {
        if let Some(mapper) = self.mapper.as_mut() {
            self.ppu.sync(now, mapper.as_mut());
        }
        self.collect_ppu_nmi();
    }

    fn collect_ppu_nmi(&mut self) {
        if self.ppu.take_nmi() {
            self.debug.nmi_delivered = self.debug.nmi_delivered.wrapping_add(1);
            let (scanline, cycle) = self.ppu.debug_scanline_cycle();
            self.push_debug_event(format!("PPU NMI edge near scanline {scanline} cycle {cycle}"));
            self.pending = Some(Interrupt::Nmi);
        }
    }

    fn cpu_read(&mut self, addr: u16, now: u64) -> u8 {
        self.debug.cpu_reads = self.debug.cpu_reads.wrapping_add(1);
        self.debug.last_cpu_read_addr = addr;
        match addr {
            0x0000..=0x1FFF => {
                self.debug.cpu_reads_ram = self.debug.cpu_reads_ram.wrapping_add(1);
                self.ram[addr as usize & 0x07FF]
            }
            0x2000..=0x3FFF => {
                self.debug.cpu_reads_ppu_regs = self.debug.cpu_reads_ppu_regs.wrapping_add(1);
                self.sync_ppu(now);
                let value = if let Some(mapper) = self.mapper.as_mut() {
                    self.ppu.cpu_read_register(addr, mapper.as_mut())
                } else {
                    0
                };
                self.collect_ppu_nmi();
                value
            }
            0x4016 => {
                self.debug.cpu_reads_io = self.debug.cpu_reads_io.wrapping_add(1);
                self.read_pad_1()
            }
            0x4017 => {
                self.debug.cpu_reads_io = self.debug.cpu_reads_io.wrapping_add(1);
                self.read_pad_2()
            }
            0x4000..=0x401F => {
                self.debug.cpu_reads_io = self.debug.cpu_reads_io.wrapping_add(1);
                0
            }
            0x6000..=0xFFFF => {
                self.debug.cpu_reads_cart = self.debug.cpu_reads_cart.wrapping_add(1);
                if let Some(mapper) = self.mapper.as_mut() {
                    mapper.cpu_read(addr)
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    fn cpu_write(&mut self, addr: u16, value: u8, now: u64) {
        self.debug.cpu_writes = self.debug.cpu_writes.wrapping_add(1);
        self.debug.last_cpu_write_addr = addr;
        self.debug.last_cpu_write_value = value;
        match addr {
            0x0000..=0x1FFF => {
                self.debug.cpu_writes_ram = self.debug.cpu_writes_ram.wrapping_add(1);
                self.ram[addr as usize & 0x07FF] = value;
            }
            0x2000..=0x3FFF => {
                self.debug.cpu_writes_ppu_regs = self.debug.cpu_writes_ppu_regs.wrapping_add(1);
                self.sync_ppu(now);
                if let Some(mapper) = self.mapper.as_mut() {
                    self.ppu.cpu_write_register(addr, value, mapper.as_mut());
                }
                // A control write during vblank can raise the NMI line.
                self.collect_ppu_nmi();
            }
            0x4014 => {
                self.debug.cpu_writes_io = self.debug.cpu_writes_io.wrapping_add(1);
                self.oam_dma(value, now);
            }
            0x4016 => {
                self.debug.cpu_writes_io = self.debug.cpu_writes_io.wrapping_add(1);
                self.write_strobe(value);
            }
            0x4000..=0x401F => {
                self.debug.cpu_writes_io = self.debug.cpu_writes_io.wrapping_add(1);
            }
            0x6000..=0xFFFF => {
                self.debug.cpu_writes_cart = self.debug.cpu_writes_cart.wrapping_add(1);
                if let Some(mapper) = self.mapper.as_mut() {
                    mapper.cpu_write(addr, value);
                }
            }
            _ => {}
        }
    }

    fn read_pad_1(&mut self) -> u8 {
        let bit = if self.strobe {
            (self.pad_states & 0x01) as u8
        } else {
            let out = self.pad1_shift & 0x01;
            self.pad1_shift = (self.pad1_shift >> 1) | 0x80;
            out
        };

        0x40 | bit
    }

    fn read_pad_2(&mut self) -> u8 {
        let bit = if self.strobe {
            ((self.pad_states >> 8) & 0x01) as u8
        } else {
            let out = self.pad2_shift & 0x01;
            self.pad2_shift = (self.pad2_shift >> 1) | 0x80;
            out
        };

        0x40 | bit
    }

    fn write_strobe(&mut self, value: u8) {
        if let Some(input) = self.input.as_mut() {
            self.pad_states = input.poll();
        }
        if self.strobe {
            // While strobe stays high the shift registers track the pads, so
            // the 1-to-0 write latches the freshest snapshot.
            self.reload_shift_registers();
        }
        self.strobe = value & 0x01 != 0;
        if self.strobe {
            self.reload_shift_registers();
        }
    }

    fn reload_shift_registers(&mut self) {
        self.pad1_shift = self.pad_states as u8;
        self.pad2_shift = (self.pad_states >> 8) as u8;
    }

    /// 256 dispatched reads from the source page into sprite memory, plus the
    /// stall the CPU pays for the stolen cycles.
    fn oam_dma(&mut self, page: u8, now: u64) {
        self.debug.dma_transfers = self.debug.dma_transfers.wrapping_add(1);
        let base = (page as u16) << 8;
        let mut bytes = [0u8; 256];
        for (i, slot) in bytes.iter_mut().enumerate() {
            *slot = self.cpu_read(base.wrapping_add(i as u16), now);
        }
        self.ppu.write_oam_dma(&bytes);

        // 513 cycles on an even CPU phase, 514 on odd.
        let extra = now & 0x01;
        self.stall += 513 + extra;
        self.push_debug_event(format!(
            "OAM DMA page=${:02X} stall_cycles={}",
            page,
            513 + extra
        ));
    }

    fn push_debug_event<S: Into<String>>(&mut self, event: S) {
        const MAX_DEBUG_EVENTS: usize = 512;
        if self.debug_events.len() >= MAX_DEBUG_EVENTS {
            self.debug_events.pop_front();
        }
        self.debug_events.push_back(event.into());
    }
}

impl Bus for SystemBus {
    fn read(&mut self, addr: u16, now: u64) -> u8 {
        self.cpu_read(addr, now)
    }

    fn write(&mut self, addr: u16, value: u8, now: u64) {
        self.cpu_write(addr, value, now)
    }

    fn take_stall(&mut self) -> u64 {
        std::mem::take(&mut self.stall)
    }

    fn take_interrupt(&mut self) -> Option<Interrupt> {
        self.pending.take()
    }
}

pub struct Nes {
    cpu: Cpu,
    bus: SystemBus,
}

impl Default for Nes {
    fn default() -> Self {
        Self::new()
    }
}

impl Nes {
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new(),
            bus: SystemBus::new(),
        }
    }

    pub fn mapper_name(&self) -> &str {
        &self.bus.mapper_name
    }

    pub fn has_rom(&self) -> bool {
        self.bus.mapper.is_some()
    }

    pub fn frame_buffer(&self) -> &[u8] {
        self.bus.ppu.frame_buffer()
    }

    pub fn set_video_sink(&mut self, sink: Box<dyn VideoSink>) {
        self.bus.ppu.set_video_sink(sink);
    }

    pub fn set_input_source(&mut self, source: Box<dyn InputSource>) {
        self.bus.input = Some(source);
    }

    /// Direct pad injection for hosts without a live input source. Low byte
    /// pad 1, high byte pad 2.
    pub fn set_pad_states(&mut self, states: u16) {
        self.bus.pad_states = states;
        if self.bus.strobe {
            self.bus.reload_shift_registers();
        }
    }

    pub fn load_rom_from_path(&mut self, path: &Path) -> Result<()> {
        let cart = Cartridge::from_file(path)?;
        self.load_cartridge(cart);
        Ok(())
    }

    /// Validate and install a ROM image. A rejected image leaves any
    /// previously loaded cartridge untouched.
    pub fn load_rom(&mut self, bytes: &[u8]) -> Result<(), RomError> {
        let cart = Cartridge::from_bytes(bytes)?;
        self.load_cartridge(cart);
        Ok(())
    }

    fn load_cartridge(&mut self, cart: Cartridge) {
        let mapper_id = cart.mapper_id;
        self.bus.mapper_name = format!("{} (mapper {mapper_id})", mapper_name(mapper_id));
        self.bus.mapper = Some(create_mapper(cart));
        self.reset();
        let name = self.bus.mapper_name.clone();
        self.bus.push_debug_event(format!("ROM loaded: {name}"));
    }

    /// Power-on state: cleared RAM, PPU parked before vblank, PC from the
    /// reset vector. Does nothing until a ROM is loaded.
    pub fn reset(&mut self) {
        if self.bus.mapper.is_none() {
            return;
        }

        self.bus.ram = [0; 2048];
        self.bus.ppu.reset();
        self.bus.pad1_shift = 0;
        self.bus.pad2_shift = 0;
        self.bus.strobe = false;
        self.bus.stall = 0;
        self.bus.pending = None;
        self.bus.debug = NesDebugCounters::default();
        self.bus.debug_events.clear();
        self.cpu.reset(&mut self.bus);
        let pc = self.cpu.pc;
        self.bus.push_debug_event(format!("CPU reset, PC=${pc:04X}"));
    }

    /// Run until the PPU delivers the next frame. Budgets each CPU slice by
    /// the distance to vblank so a frame normally takes one or two slices.
    pub fn run_frame(&mut self) {
        if self.bus.mapper.is_none() {
            return;
        }

        self.bus.ppu.clear_frame_complete();

        let mut guard: u32 = 0;
        loop {
            self.bus.sync_ppu(self.cpu.cycles());
            if self.bus.ppu.frame_complete() {
                break;
            }
            let budget = self.bus.ppu.cpu_cycles_to_vblank();
            self.cpu.run(&mut self.bus, budget);
            self.bus.debug.run_slices = self.bus.debug.run_slices.wrapping_add(1);

            guard += 1;
            if guard > 16 {
                self.bus
                    .push_debug_event("Frame guard tripped after 16 run slices".to_string());
                break;
            }
        }

        self.bus.debug.frame_count = self.bus.debug.frame_count.wrapping_add(1);
    }

    /// Execute one instruction and catch the PPU up to it. Returns the
    /// cycles consumed, 0 without a ROM.
    pub fn step(&mut self) -> u64 {
        if self.bus.mapper.is_none() {
            return 0;
        }
        let executed = self.cpu.run(&mut self.bus, 0);
        self.bus.sync_ppu(self.cpu.cycles());
        executed
    }

    pub fn debug_pc(&self) -> u16 {
        self.cpu.pc
    }

    pub fn debug_total_cycles(&self) -> u64 {
        self.cpu.cycles()
    }

    pub fn debug_cpu_regs(&self) -> (u8, u8, u8, u8, u8, u16) {
        (
            self.cpu.a,
            self.cpu.x,
            self.cpu.y,
            self.cpu.p,
            self.cpu.sp,
            self.cpu.pc,
        )
    }

    pub fn debug_ppu_regs(&self) -> (u8, u8, u8) {
        (
            self.bus.ppu.debug_ctrl(),
            self.bus.ppu.debug_mask(),
            self.bus.ppu.debug_status(),
        )
    }

    pub fn debug_ppu_scanline_cycle(&self) -> (u16, u16) {
        self.bus.ppu.debug_scanline_cycle()
    }

    pub fn debug_ppu_scroll_state(&self) -> (u16, u16, u8, bool) {
        self.bus.ppu.debug_scroll_state()
    }

    pub fn debug_interrupt_state(&self) -> (Option<Interrupt>, u64) {
        (self.bus.pending, self.bus.stall)
    }

    pub fn debug_peek_internal_ram(&self, addr: u16) -> u8 {
        self.bus.ram[addr as usize & 0x07FF]
    }

    /// Peek a CPU-visible address without bus side effects. PPU and I/O
    /// registers read as 0 because a live read would change their state.
    pub fn debug_peek_cpu_bus(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.bus.ram[addr as usize & 0x07FF],
            0x6000..=0xFFFF => {
                if let Some(mapper) = self.bus.mapper.as_ref() {
                    mapper.debug_peek_prg(addr)
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    pub fn debug_peek_vram(&self, index: usize) -> u8 {
        self.bus.ppu.debug_peek_vram(index)
    }

    pub fn debug_peek_palette(&self, index: usize) -> u8 {
        self.bus.ppu.debug_peek_palette(index)
    }

    pub fn debug_peek_oam(&self, index: usize) -> u8 {
        self.bus.ppu.debug_peek_oam(index)
    }

    pub fn debug_peek_chr(&self, addr: u16) -> u8 {
        if let Some(mapper) = self.bus.mapper.as_ref() {
            mapper.debug_peek_chr(addr)
        } else {
            0
        }
    }

    pub fn debug_counters(&self) -> NesDebugCounters {
        self.bus.debug
    }

    pub fn debug_ppu_counters(&self) -> PpuDebugCounters {
        self.bus.ppu.debug_counters()
    }

    pub fn debug_recent_events(&self, limit: usize) -> Vec<String> {
        if limit == 0 {
            return Vec::new();
        }

        self.bus
            .debug_events
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}
