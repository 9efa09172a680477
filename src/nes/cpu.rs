//! 6502 core. Instructions execute whole; devices observe time through
//! the cycle count passed to every bus access.

pub const FLAG_CARRY: u8 = 0x01;
pub const FLAG_ZERO: u8 = 0x02;
pub const FLAG_INTERRUPT: u8 = 0x04;
pub const FLAG_DECIMAL: u8 = 0x08;
pub const FLAG_BREAK: u8 = 0x10;
pub const FLAG_UNUSED: u8 = 0x20;
pub const FLAG_OVERFLOW: u8 = 0x40;
pub const FLAG_NEGATIVE: u8 = 0x80;

const NMI_VECTOR: u16 = 0xFFFA;
const RESET_VECTOR: u16 = 0xFFFC;
const IRQ_VECTOR: u16 = 0xFFFE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Nmi,
    Irq,
}

/// Everything the core can address. `now` is the CPU cycle count at the
/// start of the current instruction, so devices can catch themselves up
/// before answering.
pub trait Bus {
    fn read(&mut self, addr: u16, now: u64) -> u8;
    fn write(&mut self, addr: u16, value: u8, now: u64);

    /// Stall cycles queued by a device (OAM DMA) since the last poll.
    fn take_stall(&mut self) -> u64 {
        0
    }

    /// Interrupt edge latched by a device since the last poll.
    fn take_interrupt(&mut self) -> Option<Interrupt> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddrMode {
    Implied,
    Accumulator,
    Immediate,
    ZeroPage,
    ZeroPageX,
    ZeroPageY,
    Relative,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    Indirect,
    IndirectX,
    IndirectY,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Adc,
    And,
    Asl,
    Bcc,
    Bcs,
    Beq,
    Bit,
    Bmi,
    Bne,
    Bpl,
    Brk,
    Bvc,
    Bvs,
    Clc,
    Cld,
    Cli,
    Clv,
    Cmp,
    Cpx,
    Cpy,
    Dec,
    Dex,
    Dey,
    Eor,
    Inc,
    Inx,
    Iny,
    Jmp,
    Jsr,
    Lda,
    Ldx,
    Ldy,
    Lsr,
    Nop,
    Ora,
    Pha,
    Php,
    Pla,
    Plp,
    Rol,
    Ror,
    Rti,
    Rts,
    Sbc,
    Sec,
    Sed,
    Sei,
    Sta,
    Stx,
    Sty,
    Tax,
    Tay,
    Tsx,
    Txa,
    Txs,
    Tya,
    // Undocumented. Decoded with correct lengths and timing but executed
    // as no-ops, except 0xEB which behaves as SBC.
    Ahx,
    Alr,
    Anc,
    Arr,
    Axs,
    Dcp,
    Isc,
    Kil,
    Las,
    Lax,
    Rla,
    Rra,
    Sax,
    Shx,
    Shy,
    Slo,
    Sre,
    Tas,
    Xaa,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct OpcodeEntry {
    pub(crate) op: Op,
    pub(crate) mode: AddrMode,
    pub(crate) bytes: u8,
    pub(crate) cycles: u8,
    pub(crate) page_cycles: u8,
}

const fn e(op: Op, mode: AddrMode, bytes: u8, cycles: u8, page_cycles: u8) -> OpcodeEntry {
    OpcodeEntry {
        op,
        mode,
        bytes,
        cycles,
        page_cycles,
    }
}

pub(crate) static OPCODES: [OpcodeEntry; 256] = {
    use AddrMode::*;
    use Op::*;
    [
        e(Brk, Implied, 1, 7, 0),      // 00
        e(Ora, IndirectX, 2, 6, 0),    // 01
        e(Kil, Implied, 1, 2, 0),      // 02
        e(Slo, IndirectX, 2, 8, 0),    // 03
        e(Nop, ZeroPage, 2, 3, 0),     // 04
        e(Ora, ZeroPage, 2, 3, 0),     // 05
        e(Asl, ZeroPage, 2, 5, 0),     // 06
        e(Slo, ZeroPage, 2, 5, 0),     // 07
        e(Php, Implied, 1, 3, 0),      // 08
        e(Ora, Immediate, 2, 2, 0),    // 09
        e(Asl, Accumulator, 1, 2, 0),  // 0A
        e(Anc, Immediate, 2, 2, 0),    // 0B
        e(Nop, Absolute, 3, 4, 0),     // 0C
        e(Ora, Absolute, 3, 4, 0),     // 0D
        e(Asl, Absolute, 3, 6, 0),     // 0E
        e(Slo, Absolute, 3, 6, 0),     // 0F
        e(Bpl, Relative, 2, 2, 1),     // 10
        e(Ora, IndirectY, 2, 5, 1),    // 11
        e(Kil, Implied, 1, 2, 0),      // 12
        e(Slo, IndirectY, 2, 8, 0),    // 13
        e(Nop, ZeroPageX, 2, 4, 0),    // 14
        e(Ora, ZeroPageX, 2, 4, 0),    // 15
        e(Asl, ZeroPageX, 2, 6, 0),    // 16
        e(Slo, ZeroPageX, 2, 6, 0),    // 17
        e(Clc, Implied, 1, 2, 0),      // 18
        e(Ora, AbsoluteY, 3, 4, 1),    // 19
        e(Nop, Implied, 1, 2, 0),      // 1A
        e(Slo, AbsoluteY, 3, 7, 0),    // 1B
        e(Nop, AbsoluteX, 3, 4, 1),    // 1C
        e(Ora, AbsoluteX, 3, 4, 1),    // 1D
        e(Asl, AbsoluteX, 3, 7, 0),    // 1E
        e(Slo, AbsoluteX, 3, 7, 0),    // 1F
        e(Jsr, Absolute, 3, 6, 0),     // 20
        e(And, IndirectX, 2, 6, 0),    // 21
        e(Kil, Implied, 1, 2, 0),      // 22
        e(Rla, IndirectX, 2, 8, 0),    // 23
        e(Bit, ZeroPage, 2, 3, 0),     // 24
        e(And, ZeroPage, 2, 3, 0),     // 25
        e(Rol, ZeroPage, 2, 5, 0),     // 26
        e(Rla, ZeroPage, 2, 5, 0),     // 27
        e(Plp, Implied, 1, 4, 0),      // 28
        e(And, Immediate, 2, 2, 0),    // 29
        e(Rol, Accumulator, 1, 2, 0),  // 2A
        e(Anc, Immediate, 2, 2, 0),    // 2B
        e(Bit, Absolute, 3, 4, 0),     // 2C
        e(And, Absolute, 3, 4, 0),     // 2D
        e(Rol, Absolute, 3, 6, 0),     // 2E
        e(Rla, Absolute, 3, 6, 0),     // 2F
        e(Bmi, Relative, 2, 2, 1),     // 30
        e(And, IndirectY, 2, 5, 1),    // 31
        e(Kil, Implied, 1, 2, 0),      // 32
        e(Rla, IndirectY, 2, 8, 0),    // 33
        e(Nop, ZeroPageX, 2, 4, 0),    // 34
        e(And, ZeroPageX, 2, 4, 0),    // 35
        e(Rol, ZeroPageX, 2, 6, 0),    // 36
        e(Rla, ZeroPageX, 2, 6, 0),    // 37
        e(Sec, Implied, 1, 2, 0),      // 38
        e(And, AbsoluteY, 3, 4, 1),    // 39
        e(Nop, Implied, 1, 2, 0),      // 3A
        e(Rla, AbsoluteY, 3, 7, 0),    // 3B
        e(Nop, AbsoluteX, 3, 4, 1),    // 3C
        e(And, AbsoluteX, 3, 4, 1),    // 3D
        e(Rol, AbsoluteX, 3, 7, 0),    // 3E
        e(Rla, AbsoluteX, 3, 7, 0),    // 3F
        e(Rti, Implied, 1, 6, 0),      // 40
        e(Eor, IndirectX, 2, 6, 0),    // 41
        e(Kil, Implied, 1, 2, 0),      // 42
        e(Sre, IndirectX, 2, 8, 0),    // 43
        e(Nop, ZeroPage, 2, 3, 0),     // 44
        e(Eor, ZeroPage, 2, 3, 0),     // 45
        e(Lsr, ZeroPage, 2, 5, 0),     // 46
        e(Sre, ZeroPage, 2, 5, 0),     // 47
        e(Pha, Implied, 1, 3, 0),      // 48
        e(Eor, Immediate, 2, 2, 0),    // 49
        e(Lsr, Accumulator, 1, 2, 0),  // 4A
        e(Alr, Immediate, 2, 2, 0),    // 4B
        e(Jmp, Absolute, 3, 3, 0),     // 4C
        e(Eor, Absolute, 3, 4, 0),     // 4D
        e(Lsr, Absolute, 3, 6, 0),     // 4E
        e(Sre, Absolute, 3, 6, 0),     // 4F
        e(Bvc, Relative, 2, 2, 1),     // 50
        e(Eor, IndirectY, 2, 5, 1),    // 51
        e(Kil, Implied, 1, 2, 0),      // 52
        e(Sre, IndirectY, 2, 8, 0),    // 53
        e(Nop, ZeroPageX, 2, 4, 0),    // 54
        e(Eor, ZeroPageX, 2, 4, 0),    // 55
        e(Lsr, ZeroPageX, 2, 6, 0),    // 56
        e(Sre, ZeroPageX, 2, 6, 0),    // 57
        e(Cli, Implied, 1, 2, 0),      // 58
        e(Eor, AbsoluteY, 3, 4, 1),    // 59
        e(Nop, Implied, 1, 2, 0),      // 5A
        e(Sre, AbsoluteY, 3, 7, 0),    // 5B
        e(Nop, AbsoluteX, 3, 4, 1),    // 5C
        e(Eor, AbsoluteX, 3, 4, 1),    // 5D
        e(Lsr, AbsoluteX, 3, 7, 0),    // 5E
        e(Sre, AbsoluteX, 3, 7, 0),    // 5F
        e(Rts, Implied, 1, 6, 0),      // 60
        e(Adc, IndirectX, 2, 6, 0),    // 61
        e(Kil, Implied, 1, 2, 0),      // 62
        e(Rra, IndirectX, 2, 8, 0),    // 63
        e(Nop, ZeroPage, 2, 3, 0),     // 64
        e(Adc, ZeroPage, 2, 3, 0),     // 65
        e(Ror, ZeroPage, 2, 5, 0),     // 66
        e(Rra, ZeroPage, 2, 5, 0),     // 67
        e(Pla, Implied, 1, 4, 0),      // 68
        e(Adc, Immediate, 2, 2, 0),    // 69
        e(Ror, Accumulator, 1, 2, 0),  // 6A
        e(Arr, Immediate, 2, 2, 0),    // 6B
        e(Jmp, Indirect, 3, 5, 0),     // 6C
        e(Adc, Absolute, 3, 4, 0),     // 6D
        e(Ror, Absolute, 3, 6, 0),     // 6E
        e(Rra, Absolute, 3, 6, 0),     // 6F
        e(Bvs, Relative, 2, 2, 1),     // 70
        e(Adc, IndirectY, 2, 5, 1),    // 71
        e(Kil, Implied, 1, 2, 0),      // 72
        e(Rra, IndirectY, 2, 8, 0),    // 73
        e(Nop, ZeroPageX, 2, 4, 0),    // 74
        e(Adc, ZeroPageX, 2, 4, 0),    // 75
        e(Ror, ZeroPageX, 2, 6, 0),    // 76
        e(Rra, ZeroPageX, 2, 6, 0),    // 77
        e(Sei, Implied, 1, 2, 0),      // 78
        e(Adc, AbsoluteY, 3, 4, 1),    // 79
        e(Nop, Implied, 1, 2, 0),      // 7A
        e(Rra, AbsoluteY, 3, 7, 0),    // 7B
        e(Nop, AbsoluteX, 3, 4, 1),    // 7C
        e(Adc, AbsoluteX, 3, 4, 1),    // 7D
        e(Ror, AbsoluteX, 3, 7, 0),    // 7E
        e(Rra, AbsoluteX, 3, 7, 0),    // 7F
        e(Nop, Immediate, 2, 2, 0),    // 80
        e(Sta, IndirectX, 2, 6, 0),    // 81
        e(Nop, Immediate, 2, 2, 0),    // 82
        e(Sax, IndirectX, 2, 6, 0),    // 83
        e(Sty, ZeroPage, 2, 3, 0),     // 84
        e(Sta, ZeroPage, 2, 3, 0),     // 85
        e(Stx, ZeroPage, 2, 3, 0),     // 86
        e(Sax, ZeroPage, 2, 3, 0),     // 87
        e(Dey, Implied, 1, 2, 0),      // 88
        e(Nop, Immediate, 2, 2, 0),    // 89
        e(Txa, Implied, 1, 2, 0),      // 8A
        e(Xaa, Immediate, 2, 2, 0),    // 8B
        e(Sty, Absolute, 3, 4, 0),     // 8C
        e(Sta, Absolute, 3, 4, 0),     // 8D
        e(Stx, Absolute, 3, 4, 0),     // 8E
        e(Sax, Absolute, 3, 4, 0),     // 8F
        e(Bcc, Relative, 2, 2, 1),     // 90
        e(Sta, IndirectY, 2, 6, 0),    // 91
        e(Kil, Implied, 1, 2, 0),      // 92
        e(Ahx, IndirectY, 2, 6, 0),    // 93
        e(Sty, ZeroPageX, 2, 4, 0),    // 94
        e(Sta, ZeroPageX, 2, 4, 0),    // 95
        e(Stx, ZeroPageY, 2, 4, 0),    // 96
        e(Sax, ZeroPageY, 2, 4, 0),    // 97
        e(Tya, Implied, 1, 2, 0),      // 98
        e(Sta, AbsoluteY, 3, 5, 0),    // 99
        e(Txs, Implied, 1, 2, 0),      // 9A
        e(Tas, AbsoluteY, 3, 5, 0),    // 9B
        e(Shy, AbsoluteX, 3, 5, 0),    // 9C
        e(Sta, AbsoluteX, 3, 5, 0),    // 9D
        e(Shx, AbsoluteY, 3, 5, 0),    // 9E
        e(Ahx, AbsoluteY, 3, 5, 0),    // 9F
        e(Ldy, Immediate, 2, 2, 0),    // A0
        e(Lda, IndirectX, 2, 6, 0),    // A1
        e(Ldx, Immediate, 2, 2, 0),    // A2
        e(Lax, IndirectX, 2, 6, 0),    // A3
        e(Ldy, ZeroPage, 2, 3, 0),     // A4
        e(Lda, ZeroPage, 2, 3, 0),     // A5
        e(Ldx, ZeroPage, 2, 3, 0),     // A6
        e(Lax, ZeroPage, 2, 3, 0),     // A7
        e(Tay, Implied, 1, 2, 0),      // A8
        e(Lda, Immediate, 2, 2, 0),    // A9
        e(Tax, Implied, 1, 2, 0),      // AA
        e(Lax, Immediate, 2, 2, 0),    // AB
        e(Ldy, Absolute, 3, 4, 0),     // AC
        e(Lda, Absolute, 3, 4, 0),     // AD
        e(Ldx, Absolute, 3, 4, 0),     // AE
        e(Lax, Absolute, 3, 4, 0),     // AF
        e(Bcs, Relative, 2, 2, 1),     // B0
        e(Lda, IndirectY, 2, 5, 1),    // B1
        e(Kil, Implied, 1, 2, 0),      // B2
        e(Lax, IndirectY, 2, 5, 1),    // B3
        e(Ldy, ZeroPageX, 2, 4, 0),    // B4
        e(Lda, ZeroPageX, 2, 4, 0),    // B5
        e(Ldx, ZeroPageY, 2, 4, 0),    // B6
        e(Lax, ZeroPageY, 2, 4, 0),    // B7
        e(Clv, Implied, 1, 2, 0),      // B8
        e(Lda, AbsoluteY, 3, 4, 1),    // B9
        e(Tsx, Implied, 1, 2, 0),      // BA
        e(Las, AbsoluteY, 3, 4, 1),    // BB
        e(Ldy, AbsoluteX, 3, 4, 1),    // BC
        e(Lda, AbsoluteX, 3, 4, 1),    // BD
        e(Ldx, AbsoluteY, 3, 4, 1),    // BE
        e(Lax, AbsoluteY, 3, 4, 1),    // BF
        e(Cpy, Immediate, 2, 2, 0),    // C0
        e(Cmp, IndirectX, 2, 6, 0),    // C1
        e(Nop, Immediate, 2, 2, 0),    // C2
        e(Dcp, IndirectX, 2, 8, 0),    // C3
        e(Cpy, ZeroPage, 2, 3, 0),     // C4
        e(Cmp, ZeroPage, 2, 3, 0),     // C5
        e(Dec, ZeroPage, 2, 5, 0),     // C6
        e(Dcp, ZeroPage, 2, 5, 0),     // C7
        e(Iny, Implied, 1, 2, 0),      // C8
        e(Cmp, Immediate, 2, 2, 0),    // C9
        e(Dex, Implied, 1, 2, 0),      // CA
        e(Axs, Immediate, 2, 2, 0),    // CB
        e(Cpy, Absolute, 3, 4, 0),     // CC
        e(Cmp, Absolute, 3, 4, 0),     // CD
        e(Dec, Absolute, 3, 6, 0),     // CE
        e(Dcp, Absolute, 3, 6, 0),     // CF
        e(Bne, Relative, 2, 2, 1),     // D0
        e(Cmp, IndirectY, 2, 5, 1),    // D1
        e(Kil, Implied, 1, 2, 0),      // D2
        e(Dcp, IndirectY, 2, 8, 0),    // D3
        e(Nop, ZeroPageX, 2, 4, 0),    // D4
        e(Cmp, ZeroPageX, 2, 4, 0),    // D5
        e(Dec, ZeroPageX, 2, 6, 0),    // D6
        e(Dcp, ZeroPageX, 2, 6, 0),    // D7
        e(Cld, Implied, 1, 2, 0),      // D8
        e(Cmp, AbsoluteY, 3, 4, 1),    // D9
        e(Nop, Implied, 1, 2, 0),      // DA
        e(Dcp, AbsoluteY, 3, 7, 0),    // DB
        e(Nop, AbsoluteX, 3, 4, 1),    // DC
        e(Cmp, AbsoluteX, 3, 4, 1),    // DD
        e(Dec, AbsoluteX, 3, 7, 0),    // DE
        e(Dcp, AbsoluteX, 3, 7, 0),    // DF
        e(Cpx, Immediate, 2, 2, 0),    // E0
        e(Sbc, IndirectX, 2, 6, 0),    // E1
        e(Nop, Immediate, 2, 2, 0),    // E2
        e(Isc, IndirectX, 2, 8, 0),    // E3
        e(Cpx, ZeroPage, 2, 3, 0),     // E4
        e(Sbc, ZeroPage, 2, 3, 0),     // E5
        e(Inc, ZeroPage, 2, 5, 0),     // E6
        e(Isc, ZeroPage, 2, 5, 0),     // E7
        e(Inx, Implied, 1, 2, 0),      // E8
        e(Sbc, Immediate, 2, 2, 0),    // E9
        e(Nop, Implied, 1, 2, 0),      // EA
        e(Sbc, Immediate, 2, 2, 0),    // EB
        e(Cpx, Absolute, 3, 4, 0),     // EC
        e(Sbc, Absolute, 3, 4, 0),     // ED
        e(Inc, Absolute, 3, 6, 0),     // EE
        e(Isc, Absolute, 3, 6, 0),     // EF
        e(Beq, Relative, 2, 2, 1),     // F0
        e(Sbc, IndirectY, 2, 5, 1),    // F1
        e(Kil, Implied, 1, 2, 0),      // F2
        e(Isc, IndirectY, 2, 8, 0),    // F3
        e(Nop, ZeroPageX, 2, 4, 0),    // F4
        e(Sbc, ZeroPageX, 2, 4, 0),    // F5
        e(Inc, ZeroPageX, 2, 6, 0),    // F6
        e(Isc, ZeroPageX, 2, 6, 0),    // F7
        e(Sed, Implied, 1, 2, 0),      // F8
        e(Sbc, AbsoluteY, 3, 4, 1),    // F9
        e(Nop, Implied, 1, 2, 0),      // FA
        e(Isc, AbsoluteY, 3, 7, 0),    // FB
        e(Nop, AbsoluteX, 3, 4, 1),    // FC
        e(Sbc, AbsoluteX, 3, 4, 1),    // FD
        e(Inc, AbsoluteX, 3, 7, 0),    // FE
        e(Isc, AbsoluteX, 3, 7, 0),    // FF
    ]
};

/// Mnemonic and length for a raw opcode byte, for trace output.
pub fn describe_opcode(opcode: u8) -> (String, u8) {
    let entry = OPCODES[opcode as usize];
    (format!("{:?}", entry.op).to_uppercase(), entry.bytes)
}

fn page_differs(a: u16, b: u16) -> bool {
    (a & 0xFF00) != (b & 0xFF00)
}

pub struct Cpu {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub sp: u8,
    pub p: u8,
    pub pc: u16,
    cycles: u64,
    stall: u64,
    pending: Option<Interrupt>,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            sp: 0xFD,
            p: FLAG_UNUSED | FLAG_INTERRUPT,
            pc: 0,
            cycles: 0,
            stall: 0,
            pending: None,
        }
    }

    /// Total cycles executed since reset.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn reset<B: Bus>(&mut self, bus: &mut B) {
        self.a = 0;
        self.x = 0;
        self.y = 0;
        self.sp = 0xFD;
        self.p = FLAG_UNUSED | FLAG_INTERRUPT;
        self.cycles = 0;
        self.stall = 0;
        self.pending = None;
        self.pc = self.read_u16(bus, RESET_VECTOR);
    }

    /// Latch an interrupt request. NMI always wins; IRQ is dropped while
    /// the interrupt-disable flag is set.
    pub fn trigger(&mut self, kind: Interrupt) {
        match kind {
            Interrupt::Nmi => self.pending = Some(Interrupt::Nmi),
            Interrupt::Irq => {
                if !self.get_flag(FLAG_INTERRUPT) && self.pending.is_none() {
                    self.pending = Some(Interrupt::Irq);
                }
            }
        }
    }

    /// Run at least `cycle_budget` cycles and return the cycles actually
    /// executed. Instructions are never split; a budget of 0 still
    /// executes one instruction.
    pub fn run<B: Bus>(&mut self, bus: &mut B, cycle_budget: u64) -> u64 {
        let start = self.cycles;
        loop {
            let mut cycles_passed: u64 = 0;

            self.stall += bus.take_stall();
            if self.stall > 0 {
                cycles_passed += self.stall;
                self.stall = 0;
            }

            if let Some(kind) = bus.take_interrupt() {
                self.trigger(kind);
            }
            if let Some(kind) = self.pending.take() {
                self.service_interrupt(bus, kind);
                cycles_passed += 7;
            }

            let opcode = bus.read(self.pc, self.cycles);
            let entry = OPCODES[opcode as usize];

            let mut address: u16 = 0;
            match entry.mode {
                AddrMode::Implied | AddrMode::Accumulator => {
                    // The processor re-reads the byte after the opcode
                    // while it finishes internally.
                    let _ = bus.read(self.pc.wrapping_add(1), self.cycles);
                }
                AddrMode::Immediate => {
                    address = self.pc.wrapping_add(1);
                }
                AddrMode::ZeroPage => {
                    address = bus.read(self.pc.wrapping_add(1), self.cycles) as u16;
                }
                AddrMode::ZeroPageX => {
                    address = u16::from(
                        bus.read(self.pc.wrapping_add(1), self.cycles)
                            .wrapping_add(self.x),
                    );
                }
                AddrMode::ZeroPageY => {
                    address = u16::from(
                        bus.read(self.pc.wrapping_add(1), self.cycles)
                            .wrapping_add(self.y),
                    );
                }
                AddrMode::Relative => {
                    let offset = bus.read(self.pc.wrapping_add(1), self.cycles) as u16;
                    address = if offset < 0x80 {
                        self.pc.wrapping_add(2).wrapping_add(offset)
                    } else {
                        self.pc.wrapping_add(2).wrapping_add(offset).wrapping_sub(0x100)
                    };
                }
                AddrMode::Absolute => {
                    address = self.read_u16(bus, self.pc.wrapping_add(1));
                }
                AddrMode::AbsoluteX => {
                    let base = self.read_u16(bus, self.pc.wrapping_add(1));
                    address = base.wrapping_add(self.x as u16);
                    if page_differs(base, address) {
                        cycles_passed += entry.page_cycles as u64;
                        let _ = bus.read(address.wrapping_sub(0x100), self.cycles);
                    }
                }
                AddrMode::AbsoluteY => {
                    let base = self.read_u16(bus, self.pc.wrapping_add(1));
                    address = base.wrapping_add(self.y as u16);
                    if page_differs(base, address) {
                        cycles_passed += entry.page_cycles as u64;
                        let _ = bus.read(address.wrapping_sub(0x100), self.cycles);
                    }
                }
                AddrMode::Indirect => {
                    let ptr = self.read_u16(bus, self.pc.wrapping_add(1));
                    address = self.read_u16_bug(bus, ptr);
                }
                AddrMode::IndirectX => {
                    let ptr = u16::from(
                        bus.read(self.pc.wrapping_add(1), self.cycles)
                            .wrapping_add(self.x),
                    );
                    address = self.read_u16_bug(bus, ptr);
                }
                AddrMode::IndirectY => {
                    let ptr = bus.read(self.pc.wrapping_add(1), self.cycles) as u16;
                    let base = self.read_u16_bug(bus, ptr);
                    address = base.wrapping_add(self.y as u16);
                    if page_differs(base, address) {
                        cycles_passed += entry.page_cycles as u64;
                        let _ = bus.read(address.wrapping_sub(0x100), self.cycles);
                    }
                }
            }

            self.pc = self.pc.wrapping_add(entry.bytes as u16);
            cycles_passed += entry.cycles as u64;

            self.execute(bus, entry, address, &mut cycles_passed);

            // Committed only now, so every bus access above saw the count
            // from before this instruction.
            self.cycles += cycles_passed;

            if self.cycles - start >= cycle_budget {
                return self.cycles - start;
            }
        }
    }

    fn service_interrupt<B: Bus>(&mut self, bus: &mut B, kind: Interrupt) {
        self.push_u16(bus, self.pc);
        self.push(bus, self.p | FLAG_BREAK);
        self.set_flag(FLAG_INTERRUPT, true);
        let vector = match kind {
            Interrupt::Nmi => NMI_VECTOR,
            Interrupt::Irq => IRQ_VECTOR,
        };
        self.pc = self.read_u16(bus, vector);
    }

    fn execute<B: Bus>(
        &mut self,
        bus: &mut B,
        entry: OpcodeEntry,
        address: u16,
        cycles_passed: &mut u64,
    ) {
        match entry.op {
            Op::Adc => {
                let m = bus.read(address, self.cycles);
                let result = self.a as u16 + m as u16 + (self.p & FLAG_CARRY) as u16;
                self.set_flag(
                    FLAG_OVERFLOW,
                    (!(self.a ^ m) & (self.a ^ result as u8) & 0x80) != 0,
                );
                self.a = result as u8;
                self.set_flag(FLAG_CARRY, result > 0xFF);
                self.update_zn(self.a);
            }
            Op::Sbc => {
                let m = bus.read(address, self.cycles);
                let carry_in = (self.p & FLAG_CARRY) as u16;
                let result = (self.a as u16)
                    .wrapping_sub(m as u16)
                    .wrapping_sub(1 - carry_in);
                self.set_flag(
                    FLAG_OVERFLOW,
                    ((self.a ^ m) & (self.a ^ result as u8) & 0x80) != 0,
                );
                self.a = result as u8;
                self.set_flag(FLAG_CARRY, result < 0x100);
                self.update_zn(self.a);
            }
            Op::And => {
                self.a &= bus.read(address, self.cycles);
                self.update_zn(self.a);
            }
            Op::Ora => {
                self.a |= bus.read(address, self.cycles);
                self.update_zn(self.a);
            }
            Op::Eor => {
                self.a ^= bus.read(address, self.cycles);
                self.update_zn(self.a);
            }
            Op::Bit => {
                let m = bus.read(address, self.cycles);
                self.set_flag(FLAG_OVERFLOW, m & 0x40 != 0);
                self.set_flag(FLAG_ZERO, m & self.a == 0);
                self.set_flag(FLAG_NEGATIVE, m & 0x80 != 0);
            }
            Op::Cmp => {
                let m = bus.read(address, self.cycles);
                self.compare(self.a, m);
            }
            Op::Cpx => {
                let m = bus.read(address, self.cycles);
                self.compare(self.x, m);
            }
            Op::Cpy => {
                let m = bus.read(address, self.cycles);
                self.compare(self.y, m);
            }
            Op::Asl => {
                if entry.mode == AddrMode::Accumulator {
                    self.set_flag(FLAG_CARRY, self.a & 0x80 != 0);
                    self.a <<= 1;
                    self.update_zn(self.a);
                } else {
                    let m = bus.read(address, self.cycles);
                    self.set_flag(FLAG_CARRY, m & 0x80 != 0);
                    let m = m << 1;
                    bus.write(address, m, self.cycles);
                    self.update_zn(m);
                }
            }
            Op::Lsr => {
                if entry.mode == AddrMode::Accumulator {
                    self.set_flag(FLAG_CARRY, self.a & 0x01 != 0);
                    self.a >>= 1;
                    self.update_zn(self.a);
                } else {
                    let m = bus.read(address, self.cycles);
                    self.set_flag(FLAG_CARRY, m & 0x01 != 0);
                    let m = m >> 1;
                    bus.write(address, m, self.cycles);
                    self.update_zn(m);
                }
            }
            Op::Rol => {
                let carry_in = self.p & FLAG_CARRY;
                if entry.mode == AddrMode::Accumulator {
                    self.set_flag(FLAG_CARRY, self.a & 0x80 != 0);
                    self.a = (self.a << 1) | carry_in;
                    self.update_zn(self.a);
                } else {
                    let m = bus.read(address, self.cycles);
                    self.set_flag(FLAG_CARRY, m & 0x80 != 0);
                    let m = (m << 1) | carry_in;
                    bus.write(address, m, self.cycles);
                    self.update_zn(m);
                }
            }
            Op::Ror => {
                let carry_in = self.p & FLAG_CARRY;
                if entry.mode == AddrMode::Accumulator {
                    self.set_flag(FLAG_CARRY, self.a & 0x01 != 0);
                    self.a = (self.a >> 1) | (carry_in << 7);
                    self.update_zn(self.a);
                } else {
                    let m = bus.read(address, self.cycles);
                    self.set_flag(FLAG_CARRY, m & 0x01 != 0);
                    let m = (m >> 1) | (carry_in << 7);
                    bus.write(address, m, self.cycles);
                    self.update_zn(m);
                }
            }
            Op::Inc => {
                let m = bus.read(address, self.cycles).wrapping_add(1);
                bus.write(address, m, self.cycles);
                self.update_zn(m);
            }
            Op::Dec => {
                let m = bus.read(address, self.cycles).wrapping_sub(1);
                bus.write(address, m, self.cycles);
                self.update_zn(m);
            }
            Op::Inx => {
                self.x = self.x.wrapping_add(1);
                self.update_zn(self.x);
            }
            Op::Iny => {
                self.y = self.y.wrapping_add(1);
                self.update_zn(self.y);
            }
            Op::Dex => {
                self.x = self.x.wrapping_sub(1);
                self.update_zn(self.x);
            }
            Op::Dey => {
                self.y = self.y.wrapping_sub(1);
                self.update_zn(self.y);
            }
            Op::Lda => {
                self.a = bus.read(address, self.cycles);
                self.update_zn(self.a);
            }
            Op::Ldx => {
                self.x = bus.read(address, self.cycles);
                self.update_zn(self.x);
            }
            Op::Ldy => {
                self.y = bus.read(address, self.cycles);
                self.update_zn(self.y);
            }
            Op::Sta => bus.write(address, self.a, self.cycles),
            Op::Stx => bus.write(address, self.x, self.cycles),
            Op::Sty => bus.write(address, self.y, self.cycles),
            Op::Tax => {
                self.x = self.a;
                self.update_zn(self.x);
            }
            Op::Tay => {
                self.y = self.a;
                self.update_zn(self.y);
            }
            Op::Tsx => {
                self.x = self.sp;
                self.update_zn(self.x);
            }
            Op::Txa => {
                self.a = self.x;
                self.update_zn(self.a);
            }
            Op::Txs => self.sp = self.x,
            Op::Tya => {
                self.a = self.y;
                self.update_zn(self.a);
            }
            Op::Bcc => self.branch(address, !self.get_flag(FLAG_CARRY), cycles_passed),
            Op::Bcs => self.branch(address, self.get_flag(FLAG_CARRY), cycles_passed),
            Op::Beq => self.branch(address, self.get_flag(FLAG_ZERO), cycles_passed),
            Op::Bne => self.branch(address, !self.get_flag(FLAG_ZERO), cycles_passed),
            Op::Bmi => self.branch(address, self.get_flag(FLAG_NEGATIVE), cycles_passed),
            Op::Bpl => self.branch(address, !self.get_flag(FLAG_NEGATIVE), cycles_passed),
            Op::Bvc => self.branch(address, !self.get_flag(FLAG_OVERFLOW), cycles_passed),
            Op::Bvs => self.branch(address, self.get_flag(FLAG_OVERFLOW), cycles_passed),
            Op::Jmp => self.pc = address,
            Op::Jsr => {
                self.pc = self.pc.wrapping_sub(1);
                self.push_u16(bus, self.pc);
                self.pc = address;
            }
            Op::Rts => {
                self.pc = self.pop_u16(bus).wrapping_add(1);
            }
            Op::Rti => {
                self.p = (self.pop(bus) & !FLAG_BREAK) | FLAG_UNUSED;
                self.pc = self.pop_u16(bus);
            }
            Op::Brk => {
                self.pc = self.pc.wrapping_add(1);
                self.push_u16(bus, self.pc);
                self.push(bus, self.p | FLAG_BREAK);
                self.set_flag(FLAG_INTERRUPT, true);
                self.pc = self.read_u16(bus, IRQ_VECTOR);
            }
            Op::Pha => self.push(bus, self.a),
            Op::Php => self.push(bus, self.p | FLAG_BREAK),
            Op::Pla => {
                self.a = self.pop(bus);
                self.update_zn(self.a);
            }
            Op::Plp => {
                self.p = (self.pop(bus) & !FLAG_BREAK) | FLAG_UNUSED;
            }
            Op::Clc => self.set_flag(FLAG_CARRY, false),
            Op::Cld => self.set_flag(FLAG_DECIMAL, false),
            Op::Cli => self.set_flag(FLAG_INTERRUPT, false),
            Op::Clv => self.set_flag(FLAG_OVERFLOW, false),
            Op::Sec => self.set_flag(FLAG_CARRY, true),
            Op::Sed => self.set_flag(FLAG_DECIMAL, true),
            Op::Sei => self.set_flag(FLAG_INTERRUPT, true),
            Op::Nop => {}
            Op::Ahx
            | Op::Alr
            | Op::Anc
            | Op::Arr
            | Op::Axs
            | Op::Dcp
            | Op::Isc
            | Op::Kil
            | Op::Las
            | Op::Lax
            | Op::Rla
            | Op::Rra
            | Op::Sax
            | Op::Shx
            | Op::Shy
            | Op::Slo
            | Op::Sre
            | Op::Tas
            | Op::Xaa => {}
        }
    }

    fn branch(&mut self, address: u16, condition: bool, cycles_passed: &mut u64) {
        if condition {
            *cycles_passed += 1;
            if page_differs(self.pc, address) {
                *cycles_passed += 1;
            }
            self.pc = address;
        }
    }

    fn compare(&mut self, a: u8, b: u8) {
        self.update_zn(a.wrapping_sub(b));
        self.set_flag(FLAG_CARRY, a >= b);
    }

    fn get_flag(&self, flag: u8) -> bool {
        self.p & flag != 0
    }

    fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.p |= flag;
        } else {
            self.p &= !flag;
        }
    }

    fn update_zn(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, value == 0);
        self.set_flag(FLAG_NEGATIVE, value & 0x80 != 0);
    }

    fn read_u16<B: Bus>(&mut self, bus: &mut B, addr: u16) -> u16 {
        let lo = bus.read(addr, self.cycles) as u16;
        let hi = bus.read(addr.wrapping_add(1), self.cycles) as u16;
        (hi << 8) | lo
    }

    /// 16-bit read that wraps the high byte fetch within the same page,
    /// like the hardware does for indirect operands.
    fn read_u16_bug<B: Bus>(&mut self, bus: &mut B, addr: u16) -> u16 {
        let lo = bus.read(addr, self.cycles) as u16;
        let hi_addr = (addr & 0xFF00) | u16::from((addr as u8).wrapping_add(1));
        let hi = bus.read(hi_addr, self.cycles) as u16;
        (hi << 8) | lo
    }

    fn push<B: Bus>(&mut self, bus: &mut B, value: u8) {
        bus.write(0x0100 | self.sp as u16, value, self.cycles);
        self.sp = self.sp.wrapping_sub(1);
    }

    fn pop<B: Bus>(&mut self, bus: &mut B) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        bus.read(0x0100 | self.sp as u16, self.cycles)
    }

    fn push_u16<B: Bus>(&mut self, bus: &mut B, value: u16) {
        self.push(bus, (value >> 8) as u8);
        self.push(bus, value as u8);
    }

    fn pop_u16<B: Bus>(&mut self, bus: &mut B) -> u16 {
        let lo = self.pop(bus) as u16;
        let hi = self.pop(bus) as u16;
        (hi << 8) | lo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlatBus {
        mem: Vec<u8>,
        stall: u64,
        interrupt: Option<Interrupt>,
        reads: Vec<u16>,
    }

    impl FlatBus {
        fn new() -> Self {
            Self {
                mem: vec![0; 0x10000],
                stall: 0,
                interrupt: None,
                reads: Vec::new(),
            }
        }
    }

    impl Bus for FlatBus {
        fn read(&mut self, addr: u16, _now: u64) -> u8 {
            self.reads.push(addr);
            self.mem[addr as usize]
        }

        fn write(&mut self, addr: u16, value: u8, _now: u64) {
            self.mem[addr as usize] = value;
        }

        fn take_stall(&mut self) -> u64 {
            std::mem::take(&mut self.stall)
        }

        fn take_interrupt(&mut self) -> Option<Interrupt> {
            self.interrupt.take()
        }
    }

    fn setup(program: &[u8]) -> (Cpu, FlatBus) {
        let mut bus = FlatBus::new();
        bus.mem[0x8000..0x8000 + program.len()].copy_from_slice(program);
        bus.mem[0xFFFC] = 0x00;
        bus.mem[0xFFFD] = 0x80;
        let mut cpu = Cpu::new();
        cpu.reset(&mut bus);
        bus.reads.clear();
        (cpu, bus)
    }

    #[test]
    fn reset_loads_vector_and_power_on_state() {
        let (cpu, _bus) = setup(&[0xEA]);
        assert_eq!(cpu.pc, 0x8000);
        assert_eq!(cpu.sp, 0xFD);
        assert_eq!(cpu.p, 0x24);
        assert_eq!(cpu.cycles(), 0);
    }

    #[test]
    fn budget_zero_still_executes_one_instruction() {
        let (mut cpu, mut bus) = setup(&[0xEA, 0xEA]);
        let executed = cpu.run(&mut bus, 0);
        assert_eq!(executed, 2);
        assert_eq!(cpu.pc, 0x8001);
    }

    #[test]
    fn run_finishes_the_instruction_that_crosses_the_budget() {
        let (mut cpu, mut bus) = setup(&[0xEA, 0xEA, 0xEA, 0xEA]);
        let executed = cpu.run(&mut bus, 3);
        assert_eq!(executed, 4);
        assert_eq!(cpu.pc, 0x8002);
        assert_eq!(cpu.cycles(), 4);
    }

    #[test]
    fn opcode_table_lengths_follow_addressing_modes() {
        for (i, entry) in OPCODES.iter().enumerate() {
            let expected = match entry.mode {
                AddrMode::Implied | AddrMode::Accumulator => 1,
                AddrMode::Immediate
                | AddrMode::ZeroPage
                | AddrMode::ZeroPageX
                | AddrMode::ZeroPageY
                | AddrMode::Relative
                | AddrMode::IndirectX
                | AddrMode::IndirectY => 2,
                AddrMode::Absolute | AddrMode::AbsoluteX | AddrMode::AbsoluteY
                | AddrMode::Indirect => 3,
            };
            assert_eq!(entry.bytes, expected, "opcode {i:02X}");
            if entry.page_cycles != 0 {
                assert!(
                    matches!(
                        entry.mode,
                        AddrMode::AbsoluteX
                            | AddrMode::AbsoluteY
                            | AddrMode::IndirectY
                            | AddrMode::Relative
                    ),
                    "opcode {i:02X}"
                );
            }
        }
    }

    #[test]
    fn opcode_table_spot_checks() {
        assert_eq!(OPCODES[0xA9].op, Op::Lda);
        assert_eq!(OPCODES[0xA9].cycles, 2);
        assert_eq!(OPCODES[0x00].cycles, 7);
        assert_eq!(OPCODES[0xEB].op, Op::Sbc);
        assert_eq!(OPCODES[0xBD].page_cycles, 1);
        assert_eq!(OPCODES[0x9D].cycles, 5);
        assert_eq!(OPCODES[0x9D].page_cycles, 0);
    }

    #[test]
    fn lda_immediate_sets_zero_and_negative() {
        let (mut cpu, mut bus) = setup(&[0xA9, 0x00, 0xA9, 0x80]);
        cpu.run(&mut bus, 0);
        assert!(cpu.p & FLAG_ZERO != 0);
        assert!(cpu.p & FLAG_NEGATIVE == 0);
        cpu.run(&mut bus, 0);
        assert!(cpu.p & FLAG_ZERO == 0);
        assert!(cpu.p & FLAG_NEGATIVE != 0);
        assert_eq!(cpu.a, 0x80);
    }

    #[test]
    fn adc_overflow_and_carry_matrix() {
        let cases = [
            // (a, operand, expect_v, expect_c, result)
            (0x50u8, 0x10u8, false, false, 0x60u8),
            (0x50, 0x50, true, false, 0xA0),
            (0xD0, 0x90, true, true, 0x60),
            (0xD0, 0xD0, false, true, 0xA0),
        ];
        for (a, m, v, c, result) in cases {
            let (mut cpu, mut bus) = setup(&[0x69, m]);
            cpu.a = a;
            cpu.run(&mut bus, 0);
            assert_eq!(cpu.a, result, "ADC {a:02X}+{m:02X}");
            assert_eq!(cpu.p & FLAG_OVERFLOW != 0, v, "V for {a:02X}+{m:02X}");
            assert_eq!(cpu.p & FLAG_CARRY != 0, c, "C for {a:02X}+{m:02X}");
        }
    }

    #[test]
    fn sbc_borrow_and_overflow() {
        let (mut cpu, mut bus) = setup(&[0xE9, 0xB0]);
        cpu.a = 0x50;
        cpu.p |= FLAG_CARRY;
        cpu.run(&mut bus, 0);
        assert_eq!(cpu.a, 0xA0);
        assert!(cpu.p & FLAG_OVERFLOW != 0);
        assert!(cpu.p & FLAG_CARRY == 0);

        let (mut cpu, mut bus) = setup(&[0xE9, 0x10]);
        cpu.a = 0x50;
        cpu.p |= FLAG_CARRY;
        cpu.run(&mut bus, 0);
        assert_eq!(cpu.a, 0x40);
        assert!(cpu.p & FLAG_OVERFLOW == 0);
        assert!(cpu.p & FLAG_CARRY != 0);
    }

    #[test]
    fn compare_sets_carry_on_greater_or_equal() {
        let (mut cpu, mut bus) = setup(&[0xC9, 0x30, 0xC9, 0x40, 0xC9, 0x50]);
        cpu.a = 0x40;
        cpu.run(&mut bus, 0);
        assert!(cpu.p & FLAG_CARRY != 0);
        assert!(cpu.p & FLAG_ZERO == 0);
        cpu.run(&mut bus, 0);
        assert!(cpu.p & FLAG_CARRY != 0);
        assert!(cpu.p & FLAG_ZERO != 0);
        cpu.run(&mut bus, 0);
        assert!(cpu.p & FLAG_CARRY == 0);
    }

    #[test]
    fn zero_page_indexed_wraps_within_page() {
        // LDA $FF,X with X=2 reads $0001, not $0101.
        let (mut cpu, mut bus) = setup(&[0xB5, 0xFF]);
        cpu.x = 0x02;
        bus.mem[0x0001] = 0x77;
        bus.mem[0x0101] = 0x11;
        cpu.run(&mut bus, 0);
        assert_eq!(cpu.a, 0x77);
    }

    #[test]
    fn indexed_indirect_pointer_wraps_zero_page() {
        // LDA ($FF,X) with X=0: pointer bytes come from $FF and $00.
        let (mut cpu, mut bus) = setup(&[0xA1, 0xFF]);
        bus.mem[0x00FF] = 0x34;
        bus.mem[0x0000] = 0x12;
        bus.mem[0x1234] = 0x99;
        cpu.run(&mut bus, 0);
        assert_eq!(cpu.a, 0x99);
    }

    #[test]
    fn indirect_jmp_wraps_high_byte_within_page() {
        let (mut cpu, mut bus) = setup(&[0x6C, 0xFF, 0x30]);
        bus.mem[0x30FF] = 0x00;
        bus.mem[0x3000] = 0x40;
        bus.mem[0x3100] = 0x50;
        cpu.run(&mut bus, 0);
        assert_eq!(cpu.pc, 0x4000);
    }

    #[test]
    fn absolute_x_page_cross_costs_one_extra_cycle() {
        let (mut cpu, mut bus) = setup(&[0xBD, 0xFF, 0x80]);
        cpu.x = 0x01;
        let executed = cpu.run(&mut bus, 0);
        assert_eq!(executed, 5);

        let (mut cpu, mut bus) = setup(&[0xBD, 0x00, 0x81]);
        cpu.x = 0x01;
        let executed = cpu.run(&mut bus, 0);
        assert_eq!(executed, 4);
    }

    #[test]
    fn page_cross_issues_dummy_read_one_page_below() {
        let (mut cpu, mut bus) = setup(&[0xBD, 0xFF, 0x90]);
        cpu.x = 0x01;
        cpu.run(&mut bus, 0);
        // Effective address is $9100; the dummy fetch lands at $9000.
        assert!(bus.reads.contains(&0x9000));
        assert!(bus.reads.contains(&0x9100));
    }

    #[test]
    fn branch_cycle_accounting() {
        // Not taken: 2 cycles.
        let (mut cpu, mut bus) = setup(&[0xD0, 0x10]);
        cpu.p |= FLAG_ZERO;
        assert_eq!(cpu.run(&mut bus, 0), 2);

        // Taken, same page: 3 cycles.
        let (mut cpu, mut bus) = setup(&[0xD0, 0x10]);
        cpu.p &= !FLAG_ZERO;
        assert_eq!(cpu.run(&mut bus, 0), 3);
        assert_eq!(cpu.pc, 0x8012);

        // Taken, crossing into the previous page: 4 cycles.
        let (mut cpu, mut bus) = setup(&[0xD0, 0x80]);
        cpu.p &= !FLAG_ZERO;
        assert_eq!(cpu.run(&mut bus, 0), 4);
        assert_eq!(cpu.pc, 0x7F82);
    }

    #[test]
    fn jsr_rts_round_trip() {
        // JSR $8010 ... RTS at $8010 returns to $8003.
        let (mut cpu, mut bus) = setup(&[0x20, 0x10, 0x80]);
        bus.mem[0x8010] = 0x60;
        assert_eq!(cpu.run(&mut bus, 0), 6);
        assert_eq!(cpu.pc, 0x8010);
        // Return address on the stack is the last operand byte.
        assert_eq!(bus.mem[0x01FD], 0x80);
        assert_eq!(bus.mem[0x01FC], 0x02);
        assert_eq!(cpu.run(&mut bus, 0), 6);
        assert_eq!(cpu.pc, 0x8003);
    }

    #[test]
    fn brk_and_rti_round_trip() {
        let (mut cpu, mut bus) = setup(&[0x00, 0xEA]);
        bus.mem[0xFFFE] = 0x00;
        bus.mem[0xFFFF] = 0x90;
        bus.mem[0x9000] = 0x40; // RTI
        let p_before = cpu.p;

        assert_eq!(cpu.run(&mut bus, 0), 7);
        assert_eq!(cpu.pc, 0x9000);
        assert!(cpu.p & FLAG_INTERRUPT != 0);
        // Pushed copy carries the break bit; pushed PC is the byte after
        // the padding byte.
        assert_eq!(bus.mem[0x01FB], p_before | FLAG_BREAK);
        assert_eq!(bus.mem[0x01FD], 0x80);
        assert_eq!(bus.mem[0x01FC], 0x02);

        cpu.run(&mut bus, 0);
        assert_eq!(cpu.pc, 0x8002);
        assert_eq!(cpu.p, p_before | FLAG_UNUSED);
    }

    #[test]
    fn php_plp_mask_break_and_force_unused() {
        let (mut cpu, mut bus) = setup(&[0x08, 0x28]);
        cpu.p = FLAG_CARRY | FLAG_NEGATIVE;
        cpu.run(&mut bus, 0);
        assert_eq!(bus.mem[0x01FD], FLAG_CARRY | FLAG_NEGATIVE | FLAG_BREAK);
        cpu.run(&mut bus, 0);
        assert_eq!(cpu.p, FLAG_CARRY | FLAG_NEGATIVE | FLAG_UNUSED);
    }

    #[test]
    fn stall_is_consumed_with_the_next_instruction() {
        let (mut cpu, mut bus) = setup(&[0xEA, 0xEA]);
        bus.stall = 513;
        let executed = cpu.run(&mut bus, 1);
        assert_eq!(executed, 515);
        assert_eq!(cpu.pc, 0x8001);
    }

    #[test]
    fn nmi_is_serviced_before_the_next_instruction() {
        let (mut cpu, mut bus) = setup(&[0xEA, 0xEA]);
        bus.mem[0xFFFA] = 0x00;
        bus.mem[0xFFFB] = 0xA0;
        bus.mem[0xA000] = 0xEA;
        bus.interrupt = Some(Interrupt::Nmi);
        let executed = cpu.run(&mut bus, 0);
        assert_eq!(executed, 9); // 7 for entry + 2 for the NOP at the vector
        assert_eq!(cpu.pc, 0xA001);
        assert!(cpu.p & FLAG_INTERRUPT != 0);
    }

    #[test]
    fn irq_is_dropped_while_interrupt_flag_is_set() {
        let (mut cpu, mut bus) = setup(&[0xEA, 0xEA]);
        assert!(cpu.p & FLAG_INTERRUPT != 0);
        cpu.trigger(Interrupt::Irq);
        let executed = cpu.run(&mut bus, 0);
        assert_eq!(executed, 2);
        assert_eq!(cpu.pc, 0x8001);
    }

    #[test]
    fn nmi_displaces_a_pending_irq() {
        let mut cpu = Cpu::new();
        cpu.p &= !FLAG_INTERRUPT;
        cpu.trigger(Interrupt::Irq);
        cpu.trigger(Interrupt::Nmi);
        assert_eq!(cpu.pending, Some(Interrupt::Nmi));
        cpu.trigger(Interrupt::Irq);
        assert_eq!(cpu.pending, Some(Interrupt::Nmi));
    }

    #[test]
    fn undocumented_opcodes_advance_pc_and_burn_cycles() {
        // SLO ($03) decodes as indexed indirect, 2 bytes, 8 cycles.
        let (mut cpu, mut bus) = setup(&[0x03, 0x00]);
        let executed = cpu.run(&mut bus, 0);
        assert_eq!(executed, 8);
        assert_eq!(cpu.pc, 0x8002);

        // KIL ($02) is treated as a 1-byte no-op.
        let (mut cpu, mut bus) = setup(&[0x02]);
        let executed = cpu.run(&mut bus, 0);
        assert_eq!(executed, 2);
        assert_eq!(cpu.pc, 0x8001);
    }

    #[test]
    fn describe_opcode_reports_mnemonic_and_length() {
        assert_eq!(describe_opcode(0xA9), ("LDA".to_string(), 2));
        assert_eq!(describe_opcode(0x00), ("BRK".to_string(), 1));
        assert_eq!(describe_opcode(0x6C), ("JMP".to_string(), 3));
    }
}
