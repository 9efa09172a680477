//! Picture processor. Runs as a state machine over (scanline 0-261, dot 0-340),
//! three dots per CPU cycle, and is only ever advanced lazily: callers invoke
//! `sync` with the CPU cycle counter before touching a register, so rendering
//! side effects stay ordered against CPU time without a second clock.

use std::mem;

use super::mapper::{Mapper, Mirroring};

pub const FRAME_WIDTH: usize = 256;
pub const FRAME_HEIGHT: usize = 240;

const DOTS_PER_SCANLINE: u64 = 341;
const SCANLINES_PER_FRAME: u64 = 262;

const CTRL_VRAM_INC_32: u8 = 0x04;
const CTRL_SPRITE_TABLE: u8 = 0x08;
const CTRL_BG_TABLE: u8 = 0x10;
const CTRL_SPRITE_SIZE_16: u8 = 0x20;
const CTRL_NMI_ENABLE: u8 = 0x80;

const MASK_SHOW_BG_LEFT: u8 = 0x02;
const MASK_SHOW_SPRITE_LEFT: u8 = 0x04;
const MASK_SHOW_BG: u8 = 0x08;
const MASK_SHOW_SPRITES: u8 = 0x10;

const STATUS_SPRITE_OVERFLOW: u8 = 0x20;
const STATUS_SPRITE_ZERO_HIT: u8 = 0x40;
const STATUS_VBLANK: u8 = 0x80;

/// Physical 1K table backing each 0x400 nametable quadrant, per mirroring
/// mode. Four-screen rows index past the internal 2K and are folded back by
/// the mask in `mirrored_vram_index`; extra cartridge RAM is a mapper concern
/// this core does not model.
const MIRROR_LOOKUP: [[usize; 4]; 5] = [
    [0, 0, 1, 1], // Horizontal
    [0, 1, 0, 1], // Vertical
    [0, 0, 0, 0], // OneScreenLower
    [1, 1, 1, 1], // OneScreenUpper
    [0, 1, 2, 3], // FourScreen
];

/// Receives every completed frame at vblank entry. One byte per pixel, each a
/// master palette index (0-63); mapping to RGB is the collaborator's job.
pub trait VideoSink {
    fn push_frame(&mut self, frame: &[u8; FRAME_WIDTH * FRAME_HEIGHT]);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PpuDebugCounters {
    pub ticks: u64,
    pub frames: u64,
    pub nmi_edges: u64,
    pub sprite_zero_hits: u64,
    pub sprite_overflows: u64,
    pub status_reads: u64,
    pub data_reads: u64,
    pub data_writes: u64,
    pub register_writes: u64,
}

pub struct Ppu {
    ctrl: u8,
    mask: u8,
    status: u8,
    // Last value written to any register. Feeds the low five status bits and
    // reads from write-only registers.
    latch: u8,
    oam_addr: u8,
    oam: [u8; 256],
    vram: [u8; 2048],
    palette_ram: [u8; 32],

    v: u16,
    t: u16,
    fine_x: u8,
    write_toggle: bool,
    read_buffer: u8,

    scanline: u16,
    cycle: u16,
    frame_parity: bool,
    frame_complete: bool,

    nmi_line: bool,
    nmi_pending: bool,

    // CPU cycle count this PPU has been advanced to. Never ahead of the CPU.
    last_synced: u64,

    nt_byte: u8,
    attr_bits: u8,
    tile_lo: u8,
    tile_hi: u8,
    tile_data: u64,

    // Sprites evaluated at dot 257, drawn on the following scanline.
    sprite_count: usize,
    sprite_patterns: [u32; 8],
    sprite_x: [u8; 8],
    sprite_priority: [u8; 8],
    sprite_index: [u8; 8],

    frame_buffer: [u8; FRAME_WIDTH * FRAME_HEIGHT],
    video: Option<Box<dyn VideoSink>>,
    debug: PpuDebugCounters,
}

impl Ppu {
    pub fn new() -> Self {
        let mut ppu = Self {
            ctrl: 0,
            mask: 0,
            status: 0,
            latch: 0,
            oam_addr: 0,
            oam: [0; 256],
            vram: [0; 2048],
            palette_ram: [0; 32],
            v: 0,
            t: 0,
            fine_x: 0,
            write_toggle: false,
            read_buffer: 0,
            scanline: 0,
            cycle: 0,
            frame_parity: false,
            frame_complete: false,
            nmi_line: false,
            nmi_pending: false,
            last_synced: 0,
            nt_byte: 0,
            attr_bits: 0,
            tile_lo: 0,
            tile_hi: 0,
            tile_data: 0,
            sprite_count: 0,
            sprite_patterns: [0; 8],
            sprite_x: [0; 8],
            sprite_priority: [0; 8],
            sprite_index: [0; 8],
            frame_buffer: [0; FRAME_WIDTH * FRAME_HEIGHT],
            video: None,
            debug: PpuDebugCounters::default(),
        };
        ppu.reset();
        ppu
    }

    /// Power-on state. Parks the clock one dot before the vblank scanline so
    /// the first catch-up call delivers a frame boundary almost immediately.
    pub fn reset(&mut self) {
        self.ctrl = 0;
        self.mask = 0;
        self.status = 0;
        self.latch = 0;
        self.oam_addr = 0;
        self.oam = [0; 256];
        self.vram = [0; 2048];
        self.palette_ram = [0; 32];
        self.v = 0;
        self.t = 0;
        self.fine_x = 0;
        self.write_toggle = false;
        self.read_buffer = 0;
        self.scanline = 240;
        self.cycle = 340;
        self.frame_parity = false;
        self.frame_complete = false;
        self.nmi_line = false;
        self.nmi_pending = false;
        self.last_synced = 0;
        self.nt_byte = 0;
        self.attr_bits = 0;
        self.tile_lo = 0;
        self.tile_hi = 0;
        self.tile_data = 0;
        self.sprite_count = 0;
        self.frame_buffer = [0; FRAME_WIDTH * FRAME_HEIGHT];
        self.debug = PpuDebugCounters::default();
    }

    pub fn set_video_sink(&mut self, sink: Box<dyn VideoSink>) {
        self.video = Some(sink);
    }

    /// Replay every dot between the last synchronized point and `cpu_cycles`.
    /// Must run before any register access so its side effects land in order.
    pub fn sync(&mut self, cpu_cycles: u64, mapper: &mut dyn Mapper) {
        if cpu_cycles <= self.last_synced {
            return;
        }
        let dots = (cpu_cycles - self.last_synced) * 3;
        for _ in 0..dots {
            self.tick(mapper);
        }
        self.last_synced = cpu_cycles;
    }

    /// CPU cycles until the next vblank entry, used to size run budgets so a
    /// whole frame takes a handful of catch-up calls instead of thousands.
    pub fn cpu_cycles_to_vblank(&self) -> u64 {
        // Scanline 241 maps to 0 here, so the elapsed count is dots since the
        // last vblank entry.
        let elapsed = ((self.scanline as u64 + 21) % SCANLINES_PER_FRAME) * DOTS_PER_SCANLINE
            + self.cycle as u64;
        (SCANLINES_PER_FRAME * DOTS_PER_SCANLINE - elapsed) / 3 + 1
    }

    pub fn frame_complete(&self) -> bool {
        self.frame_complete
    }

    pub fn clear_frame_complete(&mut self) {
        self.frame_complete = false;
    }

    pub fn frame_buffer(&self) -> &[u8] {
        &self.frame_buffer
    }

    /// Consume the pending NMI edge, if one fired since the last call.
    pub fn take_nmi(&mut self) -> bool {
        mem::take(&mut self.nmi_pending)
    }

    pub fn cpu_read_register(&mut self, addr: u16, mapper: &mut dyn Mapper) -> u8 {
        match 0x2000 + (addr & 0x0007) {
            0x2002 => {
                self.debug.status_reads = self.debug.status_reads.wrapping_add(1);
                let value = (self.status & 0xE0) | (self.latch & 0x1F);
                self.status &= !STATUS_VBLANK;
                self.update_nmi_line();
                self.write_toggle = false;
                value
            }
            0x2004 => self.oam[self.oam_addr as usize],
            0x2007 => {
                self.debug.data_reads = self.debug.data_reads.wrapping_add(1);
                let addr = self.v;
                let mut value = self.ppu_read(addr, mapper);
                if addr & 0x3FFF < 0x3F00 {
                    // Non-palette reads are delayed one access through the
                    // internal buffer.
                    mem::swap(&mut value, &mut self.read_buffer);
                } else {
                    self.read_buffer = self.ppu_read(addr.wrapping_sub(0x1000), mapper);
                }
                self.increment_vram_addr();
                value
            }
            _ => self.latch,
        }
    }

    pub fn cpu_write_register(&mut self, addr: u16, value: u8, mapper: &mut dyn Mapper) {
        self.debug.register_writes = self.debug.register_writes.wrapping_add(1);
        self.latch = value;
        match 0x2000 + (addr & 0x0007) {
            0x2000 => {
                self.ctrl = value;
                self.t = (self.t & 0xF3FF) | ((value as u16 & 0x03) << 10);
                self.update_nmi_line();
            }
            0x2001 => self.mask = value,
            0x2002 => {}
            0x2003 => self.oam_addr = value,
            0x2004 => {
                self.oam[self.oam_addr as usize] = value;
                self.oam_addr = self.oam_addr.wrapping_add(1);
            }
            0x2005 => {
                if self.write_toggle {
                    self.t = (self.t & 0x8FFF) | ((value as u16 & 0x07) << 12);
                    self.t = (self.t & 0xFC1F) | ((value as u16 & 0xF8) << 2);
                } else {
                    self.t = (self.t & 0xFFE0) | (value as u16 >> 3);
                    self.fine_x = value & 0x07;
                }
                self.write_toggle = !self.write_toggle;
            }
            0x2006 => {
                if self.write_toggle {
                    self.t = (self.t & 0xFF00) | value as u16;
                    self.v = self.t;
                } else {
                    self.t = (self.t & 0x80FF) | ((value as u16 & 0x3F) << 8);
                }
                self.write_toggle = !self.write_toggle;
            }
            _ => {
                self.debug.data_writes = self.debug.data_writes.wrapping_add(1);
                let addr = self.v;
                self.ppu_write(addr, value, mapper);
                self.increment_vram_addr();
            }
        }
    }

    /// DMA target. Copies a full page into sprite memory starting at the
    /// current cursor, wrapping.
    pub fn write_oam_dma(&mut self, page: &[u8; 256]) {
        let base = self.oam_addr as usize;
        for (i, &byte) in page.iter().enumerate() {
            self.oam[(base + i) & 0xFF] = byte;
        }
    }

    fn increment_vram_addr(&mut self) {
        let step = if self.ctrl & CTRL_VRAM_INC_32 != 0 { 32 } else { 1 };
        self.v = self.v.wrapping_add(step);
    }

    fn rendering_enabled(&self) -> bool {
        self.mask & (MASK_SHOW_BG | MASK_SHOW_SPRITES) != 0
    }

    /// The NMI line is level ctrl.7 AND status.7; only a rising edge arms a
    /// pending interrupt. Toggling NMI-enable mid-vblank therefore re-fires,
    /// and reading status right at vblank entry drops the frame's NMI.
    fn update_nmi_line(&mut self) {
        let line = self.ctrl & CTRL_NMI_ENABLE != 0 && self.status & STATUS_VBLANK != 0;
        if line && !self.nmi_line {
            self.nmi_pending = true;
            self.debug.nmi_edges = self.debug.nmi_edges.wrapping_add(1);
        }
        self.nmi_line = line;
    }

    fn tick(&mut self, mapper: &mut dyn Mapper) {
        self.debug.ticks = self.debug.ticks.wrapping_add(1);

        self.cycle += 1;
        if self.cycle > 340 {
            self.cycle = 0;
            self.scanline += 1;
            if self.scanline > 261 {
                self.scanline = 0;
                self.frame_parity = !self.frame_parity;
            }
        }

        let pre_line = self.scanline == 261;
        let visible_line = self.scanline < 240;
        let render_line = pre_line || visible_line;
        let prefetch_cycle = (321..=336).contains(&self.cycle);
        let visible_cycle = (1..=256).contains(&self.cycle);
        let fetch_cycle = prefetch_cycle || visible_cycle;

        if self.rendering_enabled() {
            if visible_line && visible_cycle {
                self.render_pixel();
            }
            if render_line && fetch_cycle {
                self.tile_data <<= 4;
                match self.cycle & 0x07 {
                    1 => self.fetch_nametable_byte(mapper),
                    3 => self.fetch_attribute_bits(mapper),
                    5 => self.fetch_pattern_low(mapper),
                    7 => self.fetch_pattern_high(mapper),
                    0 => self.load_tile_data(),
                    _ => {}
                }
            }
            if pre_line && (280..=304).contains(&self.cycle) {
                self.copy_vertical_bits();
            }
            if render_line {
                if fetch_cycle && self.cycle & 0x07 == 0 {
                    self.increment_coarse_x();
                }
                if self.cycle == 256 {
                    self.increment_y();
                }
                if self.cycle == 257 {
                    self.copy_horizontal_bits();
                }
            }
            if self.cycle == 257 {
                if visible_line {
                    self.evaluate_sprites(mapper);
                } else {
                    self.sprite_count = 0;
                }
            }
        }

        if self.scanline == 241 && self.cycle == 1 {
            self.enter_vblank();
        }
        if pre_line && self.cycle == 1 {
            self.status &= !(STATUS_VBLANK | STATUS_SPRITE_ZERO_HIT | STATUS_SPRITE_OVERFLOW);
            self.update_nmi_line();
        }
    }

    fn enter_vblank(&mut self) {
        self.status |= STATUS_VBLANK;
        self.frame_complete = true;
        self.debug.frames = self.debug.frames.wrapping_add(1);
        if let Some(sink) = self.video.as_mut() {
            sink.push_frame(&self.frame_buffer);
        }
        self.update_nmi_line();
    }

    fn render_pixel(&mut self) {
        let x = (self.cycle - 1) as usize;
        let y = self.scanline as usize;

        let mut background = self.background_pixel();
        let (sprite_slot, mut sprite) = self.sprite_pixel();

        if x < 8 && self.mask & MASK_SHOW_BG_LEFT == 0 {
            background = 0;
        }
        if x < 8 && self.mask & MASK_SHOW_SPRITE_LEFT == 0 {
            sprite = 0;
        }

        let bg_opaque = background & 0x03 != 0;
        let sprite_opaque = sprite & 0x03 != 0;

        let color = if !bg_opaque && !sprite_opaque {
            0
        } else if !bg_opaque {
            sprite | 0x10
        } else if !sprite_opaque {
            background
        } else {
            if self.sprite_index[sprite_slot] == 0 && x < 255 {
                if self.status & STATUS_SPRITE_ZERO_HIT == 0 {
                    self.debug.sprite_zero_hits = self.debug.sprite_zero_hits.wrapping_add(1);
                }
                self.status |= STATUS_SPRITE_ZERO_HIT;
            }
            if self.sprite_priority[sprite_slot] == 0 {
                sprite | 0x10
            } else {
                background
            }
        };

        self.frame_buffer[y * FRAME_WIDTH + x] =
            self.palette_ram[Self::palette_index(color as u16)] & 0x3F;
    }

    fn background_pixel(&self) -> u8 {
        if self.mask & MASK_SHOW_BG == 0 {
            return 0;
        }
        let data = (self.tile_data >> 32) as u32;
        ((data >> ((7 - self.fine_x as u32) * 4)) & 0x0F) as u8
    }

    /// First opaque sprite pixel in slot order wins; returns (slot, color).
    fn sprite_pixel(&self) -> (usize, u8) {
        if self.mask & MASK_SHOW_SPRITES == 0 {
            return (0, 0);
        }
        for slot in 0..self.sprite_count {
            let offset = (self.cycle as i16 - 1) - self.sprite_x[slot] as i16;
            if !(0..8).contains(&offset) {
                continue;
            }
            let shift = (7 - offset) as u32 * 4;
            let color = ((self.sprite_patterns[slot] >> shift) & 0x0F) as u8;
            if color & 0x03 == 0 {
                continue;
            }
            return (slot, color);
        }
        (0, 0)
    }

    fn fetch_nametable_byte(&mut self, mapper: &mut dyn Mapper) {
        let addr = 0x2000 | (self.v & 0x0FFF);
        self.nt_byte = self.ppu_read(addr, mapper);
    }

    fn fetch_attribute_bits(&mut self, mapper: &mut dyn Mapper) {
        let v = self.v;
        let addr = 0x23C0 | (v & 0x0C00) | ((v >> 4) & 0x38) | ((v >> 2) & 0x07);
        let shift = ((v >> 4) & 0x04) | (v & 0x02);
        self.attr_bits = ((self.ppu_read(addr, mapper) >> shift) & 0x03) << 2;
    }

    fn background_pattern_addr(&self) -> u16 {
        let fine_y = (self.v >> 12) & 0x07;
        let table = if self.ctrl & CTRL_BG_TABLE != 0 { 0x1000 } else { 0 };
        table + self.nt_byte as u16 * 16 + fine_y
    }

    fn fetch_pattern_low(&mut self, mapper: &mut dyn Mapper) {
        let addr = self.background_pattern_addr();
        self.tile_lo = self.ppu_read(addr, mapper);
    }

    fn fetch_pattern_high(&mut self, mapper: &mut dyn Mapper) {
        let addr = self.background_pattern_addr();
        self.tile_hi = self.ppu_read(addr + 8, mapper);
    }

    /// Fold the fetched tile row into the low half of the shift register,
    /// one 4-bit pixel (attribute | plane1 | plane0) per column.
    fn load_tile_data(&mut self) {
        let mut data: u32 = 0;
        let mut lo = self.tile_lo;
        let mut hi = self.tile_hi;
        for _ in 0..8 {
            let p0 = (lo & 0x80) >> 7;
            let p1 = (hi & 0x80) >> 6;
            lo <<= 1;
            hi <<= 1;
            data = (data << 4) | (self.attr_bits | p1 | p0) as u32;
        }
        self.tile_data |= data as u64;
    }

    fn increment_coarse_x(&mut self) {
        if self.v & 0x001F == 31 {
            self.v &= !0x001F;
            self.v ^= 0x0400;
        } else {
            self.v += 1;
        }
    }

    fn increment_y(&mut self) {
        if self.v & 0x7000 != 0x7000 {
            self.v += 0x1000;
        } else {
            self.v &= !0x7000;
            let mut coarse_y = (self.v & 0x03E0) >> 5;
            if coarse_y == 29 {
                coarse_y = 0;
                self.v ^= 0x0800;
            } else if coarse_y == 31 {
                // Writes through $2006 can park coarse Y in the attribute
                // rows; those wrap without switching nametables.
                coarse_y = 0;
            } else {
                coarse_y += 1;
            }
            self.v = (self.v & !0x03E0) | (coarse_y << 5);
        }
    }

    fn copy_horizontal_bits(&mut self) {
        self.v = (self.v & 0xFBE0) | (self.t & 0x041F);
    }

    fn copy_vertical_bits(&mut self) {
        self.v = (self.v & 0x841F) | (self.t & 0x7BE0);
    }

    /// Dot-257 evaluation for the next scanline: scan all 64 OAM entries in
    /// index order, keep the first eight in range, and flag overflow when more
    /// qualify.
    fn evaluate_sprites(&mut self, mapper: &mut dyn Mapper) {
        let height: i16 = if self.ctrl & CTRL_SPRITE_SIZE_16 != 0 { 16 } else { 8 };
        let mut count = 0;
        for index in 0..64 {
            let y = self.oam[index * 4];
            let attributes = self.oam[index * 4 + 2];
            let x = self.oam[index * 4 + 3];
            let row = self.scanline as i16 - y as i16;
            if row < 0 || row >= height {
                continue;
            }
            if count < 8 {
                self.sprite_patterns[count] = self.fetch_sprite_pattern(index, row as u16, mapper);
                self.sprite_x[count] = x;
                self.sprite_priority[count] = (attributes >> 5) & 0x01;
                self.sprite_index[count] = index as u8;
            }
            count += 1;
        }
        if count > 8 {
            count = 8;
            if self.status & STATUS_SPRITE_OVERFLOW == 0 {
                self.debug.sprite_overflows = self.debug.sprite_overflows.wrapping_add(1);
            }
            self.status |= STATUS_SPRITE_OVERFLOW;
        }
        self.sprite_count = count;
    }

    /// Pattern word for one sprite row, flips applied, in the same 4-bit
    /// per-pixel layout as the background shift register.
    fn fetch_sprite_pattern(&mut self, index: usize, mut row: u16, mapper: &mut dyn Mapper) -> u32 {
        let mut tile = self.oam[index * 4 + 1] as u16;
        let attributes = self.oam[index * 4 + 2];

        let addr = if self.ctrl & CTRL_SPRITE_SIZE_16 == 0 {
            if attributes & 0x80 != 0 {
                row = 7 - row;
            }
            let table = if self.ctrl & CTRL_SPRITE_TABLE != 0 { 0x1000 } else { 0 };
            table + tile * 16 + row
        } else {
            if attributes & 0x80 != 0 {
                row = 15 - row;
            }
            let table = (tile & 0x01) * 0x1000;
            tile &= 0xFE;
            if row > 7 {
                tile += 1;
                row -= 8;
            }
            table + tile * 16 + row
        };

        let palette_bits = (attributes & 0x03) << 2;
        let mut lo = self.ppu_read(addr, mapper);
        let mut hi = self.ppu_read(addr + 8, mapper);
        let mut data: u32 = 0;
        for _ in 0..8 {
            let (p0, p1);
            if attributes & 0x40 != 0 {
                p0 = lo & 0x01;
                p1 = (hi & 0x01) << 1;
                lo >>= 1;
                hi >>= 1;
            } else {
                p0 = (lo & 0x80) >> 7;
                p1 = (hi & 0x80) >> 6;
                lo <<= 1;
                hi <<= 1;
            }
            data = (data << 4) | (palette_bits | p1 | p0) as u32;
        }
        data
    }

    fn ppu_read(&self, addr: u16, mapper: &mut dyn Mapper) -> u8 {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => mapper.ppu_read(addr),
            0x2000..=0x3EFF => self.vram[Self::mirrored_vram_index(addr, mapper.mirroring())],
            _ => self.palette_ram[Self::palette_index(addr)],
        }
    }

    fn ppu_write(&mut self, addr: u16, value: u8, mapper: &mut dyn Mapper) {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => mapper.ppu_write(addr, value),
            0x2000..=0x3EFF => {
                self.vram[Self::mirrored_vram_index(addr, mapper.mirroring())] = value;
            }
            _ => self.palette_ram[Self::palette_index(addr)] = value,
        }
    }

    /// 32-entry palette index with the sprite-backdrop aliases ($3F10/14/18/1C
    /// map onto the background entries).
    fn palette_index(addr: u16) -> usize {
        let mut index = addr as usize & 0x1F;
        if index >= 16 && index & 0x03 == 0 {
            index -= 16;
        }
        index
    }

    fn mirrored_vram_index(addr: u16, mirroring: Mirroring) -> usize {
        let row = match mirroring {
            Mirroring::Horizontal => 0,
            Mirroring::Vertical => 1,
            Mirroring::OneScreenLower => 2,
            Mirroring::OneScreenUpper => 3,
            Mirroring::FourScreen => 4,
        };
        let offset = (addr as usize - 0x2000) & 0x0FFF;
        let table = offset / 0x0400;
        (MIRROR_LOOKUP[row][table] * 0x0400 + (offset & 0x03FF)) & 0x07FF
    }

    pub fn debug_ctrl(&self) -> u8 {
        self.ctrl
    }

    pub fn debug_mask(&self) -> u8 {
        self.mask
    }

    pub fn debug_status(&self) -> u8 {
        self.status
    }

    pub fn debug_scanline_cycle(&self) -> (u16, u16) {
        (self.scanline, self.cycle)
    }

    pub fn debug_scroll_state(&self) -> (u16, u16, u8, bool) {
        (self.v, self.t, self.fine_x, self.write_toggle)
    }

    pub fn debug_peek_vram(&self, index: usize) -> u8 {
        self.vram[index & 0x07FF]
    }

    pub fn debug_peek_palette(&self, index: usize) -> u8 {
        self.palette_ram[Self::palette_index(index as u16)]
    }

    pub fn debug_peek_oam(&self, index: usize) -> u8 {
        self.oam[index & 0xFF]
    }

    pub fn debug_counters(&self) -> PpuDebugCounters {
        self.debug
    }
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    struct RamMapper {
        chr: Vec<u8>,
        mirroring: Mirroring,
    }

    impl RamMapper {
        fn new(mirroring: Mirroring) -> Self {
            Self {
                chr: vec![0; 0x2000],
                mirroring,
            }
        }
    }

    impl Mapper for RamMapper {
        fn cpu_read(&mut self, _addr: u16) -> u8 {
            0
        }

        fn cpu_write(&mut self, _addr: u16, _value: u8) {}

        fn ppu_read(&mut self, addr: u16) -> u8 {
            self.chr[addr as usize & 0x1FFF]
        }

        fn ppu_write(&mut self, addr: u16, value: u8) {
            self.chr[addr as usize & 0x1FFF] = value;
        }

        fn mirroring(&self) -> Mirroring {
            self.mirroring
        }
    }

    fn setup(mirroring: Mirroring) -> (Ppu, RamMapper) {
        (Ppu::new(), RamMapper::new(mirroring))
    }

    fn set_addr(ppu: &mut Ppu, mapper: &mut RamMapper, addr: u16) {
        ppu.cpu_write_register(0x2006, (addr >> 8) as u8, mapper);
        ppu.cpu_write_register(0x2006, addr as u8, mapper);
    }

    /// Sets the address then performs the dummy read that primes the buffer.
    fn read_vram(ppu: &mut Ppu, mapper: &mut RamMapper, addr: u16) -> u8 {
        set_addr(ppu, mapper, addr);
        ppu.cpu_read_register(0x2007, mapper);
        ppu.cpu_read_register(0x2007, mapper)
    }

    fn write_vram(ppu: &mut Ppu, mapper: &mut RamMapper, addr: u16, value: u8) {
        set_addr(ppu, mapper, addr);
        ppu.cpu_write_register(0x2007, value, mapper);
    }

    #[test]
    fn address_register_two_step_write() {
        let (mut ppu, mut mapper) = setup(Mirroring::Vertical);
        ppu.cpu_write_register(0x2006, 0x21, &mut mapper);
        ppu.cpu_write_register(0x2006, 0x05, &mut mapper);
        let (v, t, _, toggle) = ppu.debug_scroll_state();
        assert_eq!(v, 0x2105);
        assert_eq!(t, 0x2105);
        assert!(!toggle);
    }

    #[test]
    fn scroll_register_two_step_write() {
        let (mut ppu, mut mapper) = setup(Mirroring::Vertical);
        ppu.cpu_write_register(0x2005, 0x7D, &mut mapper);
        ppu.cpu_write_register(0x2005, 0x5E, &mut mapper);
        let (_, t, fine_x, toggle) = ppu.debug_scroll_state();
        // coarse X=15, fine-x=5, coarse Y=11, fine Y=6.
        assert_eq!(t, 0x616F);
        assert_eq!(fine_x, 5);
        assert!(!toggle);
    }

    #[test]
    fn status_read_resets_the_write_toggle() {
        let (mut ppu, mut mapper) = setup(Mirroring::Vertical);
        ppu.cpu_write_register(0x2006, 0x3F, &mut mapper);
        ppu.cpu_read_register(0x2002, &mut mapper);
        // Without the reset this byte would land in the low half.
        ppu.cpu_write_register(0x2006, 0x21, &mut mapper);
        ppu.cpu_write_register(0x2006, 0x05, &mut mapper);
        let (v, _, _, _) = ppu.debug_scroll_state();
        assert_eq!(v, 0x2105);
    }

    #[test]
    fn registers_mirror_every_eight_bytes() {
        let (mut ppu, mut mapper) = setup(Mirroring::Vertical);
        ppu.cpu_write_register(0x3FF6, 0x21, &mut mapper);
        ppu.cpu_write_register(0x2EEE, 0x05, &mut mapper);
        let (v, _, _, _) = ppu.debug_scroll_state();
        assert_eq!(v, 0x2105);
    }

    #[test]
    fn data_port_reads_are_buffered() {
        let (mut ppu, mut mapper) = setup(Mirroring::Vertical);
        mapper.chr[0x10] = 0xAA;
        mapper.chr[0x11] = 0xBB;
        set_addr(&mut ppu, &mut mapper, 0x0010);
        assert_eq!(ppu.cpu_read_register(0x2007, &mut mapper), 0x00);
        assert_eq!(ppu.cpu_read_register(0x2007, &mut mapper), 0xAA);
        assert_eq!(ppu.cpu_read_register(0x2007, &mut mapper), 0xBB);
    }

    #[test]
    fn data_port_increment_steps_by_32_when_selected() {
        let (mut ppu, mut mapper) = setup(Mirroring::Vertical);
        ppu.cpu_write_register(0x2000, CTRL_VRAM_INC_32, &mut mapper);
        set_addr(&mut ppu, &mut mapper, 0x2000);
        ppu.cpu_write_register(0x2007, 0x11, &mut mapper);
        ppu.cpu_write_register(0x2007, 0x22, &mut mapper);
        assert_eq!(ppu.debug_peek_vram(0x000), 0x11);
        assert_eq!(ppu.debug_peek_vram(0x020), 0x22);
    }

    #[test]
    fn palette_reads_bypass_the_buffer() {
        let (mut ppu, mut mapper) = setup(Mirroring::Vertical);
        // Nametable byte underneath the palette window, then a palette entry.
        write_vram(&mut ppu, &mut mapper, 0x2F00, 0x5A);
        write_vram(&mut ppu, &mut mapper, 0x3F00, 0x21);

        set_addr(&mut ppu, &mut mapper, 0x3F00);
        assert_eq!(ppu.cpu_read_register(0x2007, &mut mapper), 0x21);

        // The buffer was refilled from v - 0x1000 during the palette read.
        set_addr(&mut ppu, &mut mapper, 0x0000);
        assert_eq!(ppu.cpu_read_register(0x2007, &mut mapper), 0x5A);
    }

    #[test]
    fn sprite_backdrop_palette_entries_alias_background() {
        let (mut ppu, mut mapper) = setup(Mirroring::Vertical);
        write_vram(&mut ppu, &mut mapper, 0x3F10, 0x2A);
        write_vram(&mut ppu, &mut mapper, 0x3F14, 0x0C);
        assert_eq!(read_vram(&mut ppu, &mut mapper, 0x3F00), 0x2A);
        assert_eq!(read_vram(&mut ppu, &mut mapper, 0x3F04), 0x0C);
        assert_eq!(ppu.debug_peek_palette(0x00), 0x2A);
        assert_eq!(ppu.debug_peek_palette(0x04), 0x0C);
    }

    #[test]
    fn nametable_mirroring_selects_physical_tables() {
        // Expected read-back per quadrant after writing 0x10..0x13 to the
        // four quadrant heads in order: quadrants sharing a physical table
        // see the last write.
        let cases = [
            (Mirroring::Horizontal, [0x11, 0x11, 0x13, 0x13]),
            (Mirroring::Vertical, [0x12, 0x13, 0x12, 0x13]),
            (Mirroring::OneScreenLower, [0x13, 0x13, 0x13, 0x13]),
            (Mirroring::OneScreenUpper, [0x13, 0x13, 0x13, 0x13]),
            // Four-screen folds onto the internal 2K, which leaves it
            // behaving like vertical here.
            (Mirroring::FourScreen, [0x12, 0x13, 0x12, 0x13]),
        ];
        for (mirroring, expected) in cases {
            let (mut ppu, mut mapper) = setup(mirroring);
            for quadrant in 0..4u16 {
                write_vram(
                    &mut ppu,
                    &mut mapper,
                    0x2000 + quadrant * 0x0400,
                    0x10 + quadrant as u8,
                );
            }
            for quadrant in 0..4u16 {
                assert_eq!(
                    read_vram(&mut ppu, &mut mapper, 0x2000 + quadrant * 0x0400),
                    expected[quadrant as usize],
                    "{mirroring:?} quadrant {quadrant}",
                );
            }
        }
    }

    #[test]
    fn vblank_sets_at_scanline_241_dot_1() {
        let (mut ppu, mut mapper) = setup(Mirroring::Vertical);
        assert_eq!(ppu.cpu_cycles_to_vblank(), 1);
        ppu.sync(1, &mut mapper);
        assert_ne!(ppu.debug_status() & STATUS_VBLANK, 0);
        assert!(ppu.frame_complete());
        assert_eq!(ppu.debug_counters().frames, 1);
        // Fresh full frame ahead once inside vblank.
        assert_eq!(ppu.cpu_cycles_to_vblank(), 29781);
    }

    #[test]
    fn status_read_clears_vblank() {
        let (mut ppu, mut mapper) = setup(Mirroring::Vertical);
        ppu.sync(1, &mut mapper);
        assert_ne!(ppu.cpu_read_register(0x2002, &mut mapper) & STATUS_VBLANK, 0);
        assert_eq!(ppu.cpu_read_register(0x2002, &mut mapper) & STATUS_VBLANK, 0);
    }

    #[test]
    fn status_carries_stale_low_bits_from_the_latch() {
        let (mut ppu, mut mapper) = setup(Mirroring::Vertical);
        ppu.cpu_write_register(0x2001, 0x1F, &mut mapper);
        ppu.sync(1, &mut mapper);
        assert_eq!(ppu.cpu_read_register(0x2002, &mut mapper), 0x9F);
    }

    #[test]
    fn write_only_registers_read_back_the_latch() {
        let (mut ppu, mut mapper) = setup(Mirroring::Vertical);
        ppu.cpu_write_register(0x2001, 0x5A, &mut mapper);
        assert_eq!(ppu.cpu_read_register(0x2000, &mut mapper), 0x5A);
        assert_eq!(ppu.cpu_read_register(0x2005, &mut mapper), 0x5A);
    }

    #[test]
    fn nmi_fires_only_on_a_rising_edge() {
        let (mut ppu, mut mapper) = setup(Mirroring::Vertical);
        ppu.cpu_write_register(0x2000, CTRL_NMI_ENABLE, &mut mapper);
        ppu.sync(1, &mut mapper);
        assert!(ppu.take_nmi());
        assert!(!ppu.take_nmi());

        // Toggling enable mid-vblank produces a second edge.
        ppu.cpu_write_register(0x2000, 0x00, &mut mapper);
        ppu.cpu_write_register(0x2000, CTRL_NMI_ENABLE, &mut mapper);
        assert!(ppu.take_nmi());

        // After status clears vblank, enabling produces no edge.
        ppu.cpu_write_register(0x2000, 0x00, &mut mapper);
        ppu.cpu_read_register(0x2002, &mut mapper);
        ppu.cpu_write_register(0x2000, CTRL_NMI_ENABLE, &mut mapper);
        assert!(!ppu.take_nmi());
    }

    #[test]
    fn status_flags_clear_on_the_pre_render_line() {
        let (mut ppu, mut mapper) = setup(Mirroring::Vertical);
        ppu.sync(1, &mut mapper);
        assert_ne!(ppu.debug_status() & STATUS_VBLANK, 0);
        // 20 vblank scanlines to the pre-render line.
        ppu.sync(1 + 20 * 341 / 3 + 1, &mut mapper);
        assert_eq!(ppu.debug_status() & STATUS_VBLANK, 0);
    }

    #[test]
    fn sprite_zero_hit_fires_once_per_frame() {
        let (mut ppu, mut mapper) = setup(Mirroring::Vertical);
        // Tile 0 solid on both planes: background and sprite pixels opaque.
        for byte in mapper.chr[0..16].iter_mut() {
            *byte = 0xFF;
        }
        // Sprite 0 at (16, 10): evaluated on scanline 10, drawn on 11.
        let mut page = [0u8; 256];
        page[0] = 10;
        page[1] = 0;
        page[2] = 0;
        page[3] = 16;
        ppu.write_oam_dma(&page);

        write_vram(&mut ppu, &mut mapper, 0x3F13, 0x2C);
        ppu.cpu_write_register(
            0x2001,
            MASK_SHOW_BG | MASK_SHOW_SPRITES | MASK_SHOW_BG_LEFT | MASK_SHOW_SPRITE_LEFT,
            &mut mapper,
        );

        // Through the pre-render line and down to visible scanline ~13.
        ppu.sync(4000, &mut mapper);
        assert_ne!(ppu.debug_status() & STATUS_SPRITE_ZERO_HIT, 0);
        assert_eq!(ppu.debug_counters().sprite_zero_hits, 1);
        // Sprite wins the priority tie, palette entry $13.
        assert_eq!(ppu.frame_buffer()[11 * FRAME_WIDTH + 16], 0x2C);
    }

    #[test]
    fn sprite_overflow_sets_when_more_than_eight_qualify() {
        let (mut ppu, mut mapper) = setup(Mirroring::Vertical);
        let mut page = [0u8; 256];
        for sprite in 0..10 {
            page[sprite * 4] = 10;
            page[sprite * 4 + 3] = (sprite * 8) as u8;
        }
        ppu.write_oam_dma(&page);
        ppu.cpu_write_register(0x2001, MASK_SHOW_BG | MASK_SHOW_SPRITES, &mut mapper);

        ppu.sync(4000, &mut mapper);
        assert_ne!(ppu.debug_status() & STATUS_SPRITE_OVERFLOW, 0);
        assert_eq!(ppu.debug_counters().sprite_overflows, 1);
    }

    #[test]
    fn oam_dma_copy_wraps_the_cursor() {
        let (mut ppu, mut mapper) = setup(Mirroring::Vertical);
        ppu.cpu_write_register(0x2003, 0xF8, &mut mapper);
        let mut page = [0u8; 256];
        for (i, byte) in page.iter_mut().enumerate() {
            *byte = i as u8;
        }
        ppu.write_oam_dma(&page);
        assert_eq!(ppu.debug_peek_oam(0xF8), 0x00);
        assert_eq!(ppu.debug_peek_oam(0xFF), 0x07);
        assert_eq!(ppu.debug_peek_oam(0x00), 0x08);
        assert_eq!(ppu.debug_peek_oam(0xF7), 0xFF);
    }

    #[test]
    fn oam_data_write_increments_the_cursor_but_read_does_not() {
        let (mut ppu, mut mapper) = setup(Mirroring::Vertical);
        ppu.cpu_write_register(0x2003, 0x05, &mut mapper);
        ppu.cpu_write_register(0x2004, 0xAA, &mut mapper);
        ppu.cpu_write_register(0x2004, 0xBB, &mut mapper);
        assert_eq!(ppu.debug_peek_oam(0x05), 0xAA);
        assert_eq!(ppu.debug_peek_oam(0x06), 0xBB);

        ppu.cpu_write_register(0x2003, 0x05, &mut mapper);
        assert_eq!(ppu.cpu_read_register(0x2004, &mut mapper), 0xAA);
        assert_eq!(ppu.cpu_read_register(0x2004, &mut mapper), 0xAA);
    }

    struct CountingSink(Rc<Cell<u32>>);

    impl VideoSink for CountingSink {
        fn push_frame(&mut self, _frame: &[u8; FRAME_WIDTH * FRAME_HEIGHT]) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn video_sink_receives_one_frame_per_vblank() {
        let (mut ppu, mut mapper) = setup(Mirroring::Vertical);
        let frames = Rc::new(Cell::new(0));
        ppu.set_video_sink(Box::new(CountingSink(Rc::clone(&frames))));
        ppu.sync(1, &mut mapper);
        assert_eq!(frames.get(), 1);
        ppu.sync(1 + 29781, &mut mapper);
        assert_eq!(frames.get(), 2);
    }
}
