//! Instruction word decoding for the 32-bit segmented machine.
//!
//! A word carries a 4-bit opcode in bits 31-28. Opcodes 0-12 use three
//! 3-bit register fields (a in bits 8-6, b in 5-3, c in 2-0); opcode 13
//! uses a register field in bits 27-25 and a 25-bit unsigned immediate in
//! bits 24-0. Opcode 15 is an alias for halt and 14 is reserved.

/// One decoded instruction. The emitter consumes this with an exhaustive
/// match, so decode and codegen stay independently testable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instr {
    /// `if r[c] != 0 { r[a] = r[b] }`
    CondMove { a: u8, b: u8, c: u8 },
    /// `r[a] = segment[r[b]][r[c]]`
    Load { a: u8, b: u8, c: u8 },
    /// `segment[r[a]][r[b]] = r[c]`
    Store { a: u8, b: u8, c: u8 },
    /// `r[a] = r[b] + r[c] (mod 2^32)`
    Add { a: u8, b: u8, c: u8 },
    /// `r[a] = r[b] * r[c] (mod 2^32)`
    Mul { a: u8, b: u8, c: u8 },
    /// `r[a] = r[b] / r[c]` (unsigned; divisor of zero is a fault)
    Div { a: u8, b: u8, c: u8 },
    /// `r[a] = !(r[b] & r[c])`
    Nand { a: u8, b: u8, c: u8 },
    /// Stop execution.
    Halt,
    /// `r[b] = handle` of a fresh zero-filled segment of `r[c]` words.
    Map { b: u8, c: u8 },
    /// Free segment `r[c]`.
    Unmap { c: u8 },
    /// Write the low byte of `r[c]` to the output stream.
    Output { c: u8 },
    /// Read one byte into `r[c]`; end-of-stream yields `0xFFFF_FFFF`.
    Input { c: u8 },
    /// Duplicate segment `r[b]` into segment 0, resume at index `r[c]`.
    LoadProgram { b: u8, c: u8 },
    /// `r[a] = value` (25-bit unsigned immediate).
    LoadImm { a: u8, value: u32 },
    /// Opcode 14; compiled into a guard that stops the machine.
    Reserved { opcode: u8 },
}

pub const OP_COND_MOVE: u8 = 0;
pub const OP_LOAD: u8 = 1;
pub const OP_STORE: u8 = 2;
pub const OP_ADD: u8 = 3;
pub const OP_MUL: u8 = 4;
pub const OP_DIV: u8 = 5;
pub const OP_NAND: u8 = 6;
pub const OP_HALT: u8 = 7;
pub const OP_MAP: u8 = 8;
pub const OP_UNMAP: u8 = 9;
pub const OP_OUTPUT: u8 = 10;
pub const OP_INPUT: u8 = 11;
pub const OP_LOAD_PROGRAM: u8 = 12;
pub const OP_LOAD_IMM: u8 = 13;

/// Decode one instruction word. Total: every word decodes to something.
pub fn decode(word: u32) -> Instr {
    let opcode = (word >> 28) as u8;

    if opcode == OP_LOAD_IMM {
        let a = ((word >> 25) & 0x7) as u8;
        let value = word & 0x01FF_FFFF;
        return Instr::LoadImm { a, value };
    }

    let a = ((word >> 6) & 0x7) as u8;
    let b = ((word >> 3) & 0x7) as u8;
    let c = (word & 0x7) as u8;

    match opcode {
        OP_COND_MOVE => Instr::CondMove { a, b, c },
        OP_LOAD => Instr::Load { a, b, c },
        OP_STORE => Instr::Store { a, b, c },
        OP_ADD => Instr::Add { a, b, c },
        OP_MUL => Instr::Mul { a, b, c },
        OP_DIV => Instr::Div { a, b, c },
        OP_NAND => Instr::Nand { a, b, c },
        OP_HALT => Instr::Halt,
        OP_MAP => Instr::Map { b, c },
        OP_UNMAP => Instr::Unmap { c },
        OP_OUTPUT => Instr::Output { c },
        OP_INPUT => Instr::Input { c },
        OP_LOAD_PROGRAM => Instr::LoadProgram { b, c },
        15 => Instr::Halt,
        _ => Instr::Reserved { opcode },
    }
}

/// Encode a three-register instruction. Register fields above 7 and
/// opcodes above 15 are masked off.
pub fn encode_op(opcode: u8, a: u8, b: u8, c: u8) -> u32 {
    debug_assert!(opcode < 16);
    debug_assert!(a < 8 && b < 8 && c < 8);
    ((opcode as u32 & 0xF) << 28)
        | ((a as u32 & 0x7) << 6)
        | ((b as u32 & 0x7) << 3)
        | (c as u32 & 0x7)
}

/// Encode a load-immediate instruction. The value is masked to 25 bits.
pub fn encode_imm(a: u8, value: u32) -> u32 {
    debug_assert!(a < 8);
    debug_assert!(value <= 0x01FF_FFFF);
    ((OP_LOAD_IMM as u32) << 28) | ((a as u32 & 0x7) << 25) | (value & 0x01FF_FFFF)
}

impl Instr {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instr::CondMove { .. } => "cmove",
            Instr::Load { .. } => "load",
            Instr::Store { .. } => "store",
            Instr::Add { .. } => "add",
            Instr::Mul { .. } => "mul",
            Instr::Div { .. } => "div",
            Instr::Nand { .. } => "nand",
            Instr::Halt => "halt",
            Instr::Map { .. } => "map",
            Instr::Unmap { .. } => "unmap",
            Instr::Output { .. } => "output",
            Instr::Input { .. } => "input",
            Instr::LoadProgram { .. } => "loadprogram",
            Instr::LoadImm { .. } => "loadimm",
            Instr::Reserved { .. } => "reserved",
        }
    }
}
