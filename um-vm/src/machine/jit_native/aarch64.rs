//! aarch64 (AAPCS64) backend.
//!
//! Register pinning, identical in every compiled region:
//!
//! - abstract registers r0-r7 live in `w19`-`w26`
//! - `x27` holds the call-style trampoline, `x29` the tail-style one,
//!   `x28` the arena base; all callee-saved
//! - `x9`/`x10` are slot-local scratch, `w0`-`w2` carry the dispatcher
//!   tag and operands
//!
//! Every slot is five instruction words; shorter sequences are padded
//! with `nop` so slot addresses stay a fixed multiple of the index.

use crate::decode::{Instr, decode};

use super::{
    MachineError, MachineLayout, MachineResult, TAG_DIV_ZERO, TAG_HALT, TAG_INPUT,
    TAG_LOAD_PROGRAM, TAG_MAP, TAG_OUTPUT, TAG_RESERVED, TAG_UNMAP, TAG_ZERO_STORE,
};

/// Fixed native-code footprint of one bytecode instruction.
pub(super) const SLOT_SIZE: usize = 20;

const NOP: u32 = 0xD503_201F;
const RET: u32 = 0xD65F_03C0;
/// blr x27
const CALL_DISPATCH: u32 = 0xD63F_0360;
/// br x29
const TAIL_DISPATCH: u32 = 0xD61F_03A0;

/// Native register number backing abstract register `i`.
fn pin(i: u8) -> u32 {
    19 + i as u32
}

fn emit(code: &mut Vec<u8>, insn: u32) {
    code.extend_from_slice(&insn.to_le_bytes());
}

/// movz wD, #imm16
fn movz_w(d: u32, imm16: u32) -> u32 {
    0x5280_0000 | (imm16 << 5) | d
}

/// movk wD, #imm16, lsl #16
fn movk_w_hi(d: u32, imm16: u32) -> u32 {
    0x72A0_0000 | (imm16 << 5) | d
}

/// mov wD, wM (orr wD, wzr, wM)
fn mov_w(d: u32, m: u32) -> u32 {
    0x2A00_03E0 | (m << 16) | d
}

/// cbnz wT, forward by `insns` instruction words
fn cbnz_w(t: u32, insns: u32) -> u32 {
    0x3500_0000 | (insns << 5) | t
}

/// add x9, x28, xM
fn add_x9_arena(m: u32) -> u32 {
    0x8B00_0000 | (m << 16) | (28 << 5) | 9
}

/// Compile a segment: one slot per word plus a trailing guard slot.
pub(super) fn emit_segment(words: &[u32]) -> MachineResult<Vec<u8>> {
    let mut code = Vec::with_capacity((words.len() + 1) * SLOT_SIZE);
    for &word in words {
        emit_slot(&mut code, decode(word));
    }
    let start = code.len();
    emit(&mut code, movz_w(0, TAG_RESERVED));
    emit(&mut code, TAIL_DISPATCH);
    pad_slot(&mut code, start);
    Ok(code)
}

fn emit_slot(code: &mut Vec<u8>, instr: Instr) {
    let start = code.len();
    match instr {
        Instr::LoadImm { a, value } => {
            emit(code, movz_w(pin(a), value & 0xFFFF));
            emit(code, movk_w_hi(pin(a), value >> 16));
        }
        Instr::CondMove { a, b, c } => {
            // cmp wC, #0 ; csel wA, wB, wA, ne
            emit(code, 0x7100_001F | (pin(c) << 5));
            emit(
                code,
                0x1A80_0000 | (pin(a) << 16) | (0b0001 << 12) | (pin(b) << 5) | pin(a),
            );
        }
        Instr::Load { a, b, c } => {
            emit(code, add_x9_arena(pin(b)));
            // ldr wA, [x9, wC, uxtw #2]
            emit(code, 0xB860_5800 | (pin(c) << 16) | (9 << 5) | pin(a));
        }
        Instr::Store { a, b, c } => {
            emit(code, add_x9_arena(pin(a)));
            // str wC, [x9, wB, uxtw #2]
            emit(code, 0xB820_5800 | (pin(b) << 16) | (9 << 5) | pin(c));
            // A store into segment 0 invalidates its compiled code.
            emit(code, cbnz_w(pin(a), 3));
            emit(code, movz_w(0, TAG_ZERO_STORE));
            emit(code, CALL_DISPATCH);
        }
        Instr::Add { a, b, c } => {
            emit(code, 0x0B00_0000 | (pin(c) << 16) | (pin(b) << 5) | pin(a));
        }
        Instr::Mul { a, b, c } => {
            emit(code, 0x1B00_7C00 | (pin(c) << 16) | (pin(b) << 5) | pin(a));
        }
        Instr::Div { a, b, c } => {
            emit(code, cbnz_w(pin(c), 3));
            emit(code, movz_w(0, TAG_DIV_ZERO));
            emit(code, TAIL_DISPATCH);
            emit(code, 0x1AC0_0800 | (pin(c) << 16) | (pin(b) << 5) | pin(a));
        }
        Instr::Nand { a, b, c } => {
            // and w9, wB, wC ; mvn wA, w9
            emit(code, 0x0A00_0000 | (pin(c) << 16) | (pin(b) << 5) | 9);
            emit(code, 0x2A20_03E0 | (9 << 16) | pin(a));
        }
        Instr::Halt => {
            emit(code, movz_w(0, TAG_HALT));
            emit(code, TAIL_DISPATCH);
        }
        Instr::Map { b, c } => {
            emit(code, mov_w(1, pin(c)));
            emit(code, movz_w(0, TAG_MAP));
            emit(code, CALL_DISPATCH);
            emit(code, mov_w(pin(b), 0));
        }
        Instr::Unmap { c } => {
            emit(code, mov_w(1, pin(c)));
            emit(code, movz_w(0, TAG_UNMAP));
            emit(code, CALL_DISPATCH);
        }
        Instr::Output { c } => {
            emit(code, mov_w(1, pin(c)));
            emit(code, movz_w(0, TAG_OUTPUT));
            emit(code, CALL_DISPATCH);
        }
        Instr::Input { c } => {
            emit(code, movz_w(0, TAG_INPUT));
            emit(code, CALL_DISPATCH);
            emit(code, mov_w(pin(c), 0));
        }
        Instr::LoadProgram { b, c } => {
            emit(code, mov_w(1, pin(b)));
            emit(code, mov_w(2, pin(c)));
            emit(code, movz_w(0, TAG_LOAD_PROGRAM));
            emit(code, TAIL_DISPATCH);
        }
        Instr::Reserved { .. } => {
            emit(code, movz_w(0, TAG_RESERVED));
            emit(code, TAIL_DISPATCH);
        }
    }
    pad_slot(code, start);
}

fn pad_slot(code: &mut Vec<u8>, start: usize) {
    let used = code.len() - start;
    debug_assert!(used <= SLOT_SIZE, "slot overflow: {used} bytes");
    for _ in 0..(SLOT_SIZE - used) / 4 {
        emit(code, NOP);
    }
}

/// movz/movk sequence materializing a 64-bit constant into xD.
fn emit_mov_imm64(code: &mut Vec<u8>, d: u32, value: u64) {
    emit(code, 0xD280_0000 | (((value & 0xFFFF) as u32) << 5) | d);
    for hw in 1..4u32 {
        let imm16 = ((value >> (16 * hw)) & 0xFFFF) as u32;
        emit(code, 0xF280_0000 | (hw << 21) | (imm16 << 5) | d);
    }
}

/// stp xT1, xT2, [sp, #simm]! (pre-index)
fn stp_pre(t1: u32, t2: u32, simm: i32) -> u32 {
    0xA980_0000 | ((((simm / 8) & 0x7F) as u32) << 15) | (t2 << 10) | (31 << 5) | t1
}

/// stp xT1, xT2, [sp, #imm]
fn stp_off(t1: u32, t2: u32, imm: u32) -> u32 {
    0xA900_0000 | ((imm / 8) << 15) | (t2 << 10) | (31 << 5) | t1
}

/// ldp xT1, xT2, [sp, #imm]
fn ldp_off(t1: u32, t2: u32, imm: u32) -> u32 {
    0xA940_0000 | ((imm / 8) << 15) | (t2 << 10) | (31 << 5) | t1
}

/// ldp xT1, xT2, [sp], #imm (post-index)
fn ldp_post(t1: u32, t2: u32, imm: u32) -> u32 {
    0xA8C0_0000 | ((imm / 8) << 15) | (t2 << 10) | (31 << 5) | t1
}

fn scaled_offset(offset: i32, scale: i32, what: &str) -> MachineResult<u32> {
    if offset < 0 || offset % scale != 0 || offset / scale > 0xFFF {
        return Err(MachineError::JitNative(format!(
            "{what} displacement {offset} not encodable"
        )));
    }
    Ok((offset / scale) as u32)
}

fn reg_disp(layout_base: i32, index: u8) -> MachineResult<i32> {
    layout_base
        .checked_add(index as i32 * 4)
        .ok_or_else(|| MachineError::JitNative("register file displacement overflow".into()))
}

/// Entry thunk: `extern "C" fn(slot: *const u8, ctx: *mut Machine) -> u32`.
pub(super) fn emit_entry_thunk(
    call_tramp: u64,
    tail_tramp: u64,
    arena_base: u64,
    layout: MachineLayout,
) -> MachineResult<Vec<u8>> {
    let mut code = Vec::new();
    emit(&mut code, stp_pre(29, 30, -96));
    emit(&mut code, stp_off(19, 20, 16));
    emit(&mut code, stp_off(21, 22, 32));
    emit(&mut code, stp_off(23, 24, 48));
    emit(&mut code, stp_off(25, 26, 64));
    emit(&mut code, stp_off(27, 28, 80));
    // Record the frame so the exit stub can unwind straight back here.
    emit(&mut code, 0x9100_03E9); // mov x9, sp
    let saved = scaled_offset(layout.saved_stack, 8, "saved stack")?;
    emit(&mut code, 0xF900_0000 | (saved << 10) | (1 << 5) | 9); // str x9, [x1, ...]
    emit_mov_imm64(&mut code, 27, call_tramp);
    emit_mov_imm64(&mut code, 29, tail_tramp);
    emit_mov_imm64(&mut code, 28, arena_base);
    for i in 0..8u8 {
        let off = scaled_offset(reg_disp(layout.regs, i)?, 4, "register file")?;
        emit(&mut code, 0xB940_0000 | (off << 10) | (1 << 5) | pin(i)); // ldr wRi, [x1, ...]
    }
    emit(&mut code, 0xD61F_0000); // br x0
    Ok(code)
}

/// Call-style trampoline: invoke the dispatcher, return to the slot
/// unless the machine has faulted.
pub(super) fn emit_call_trampoline(
    ctx: u64,
    dispatch: u64,
    exit_stub: u64,
    layout: MachineLayout,
) -> MachineResult<Vec<u8>> {
    let mut code = Vec::new();
    emit(&mut code, stp_pre(29, 30, -16));
    emit_mov_imm64(&mut code, 3, ctx);
    emit_mov_imm64(&mut code, 4, dispatch);
    emit(&mut code, 0xD63F_0080); // blr x4
    emit(&mut code, ldp_post(29, 30, 16));
    emit_mov_imm64(&mut code, 9, ctx);
    let faulted = scaled_offset(layout.faulted, 1, "fault flag")?;
    emit(&mut code, 0x3940_0000 | (faulted << 10) | (9 << 5) | 10); // ldrb w10, [x9, ...]
    emit(&mut code, cbnz_w(10, 2));
    emit(&mut code, RET);
    emit_mov_imm64(&mut code, 9, exit_stub);
    emit(&mut code, 0xD61F_0120); // br x9
    Ok(code)
}

/// Tail-style trampoline: invoke the dispatcher, continue at whatever
/// address it returns.
pub(super) fn emit_tail_trampoline(ctx: u64, dispatch: u64) -> MachineResult<Vec<u8>> {
    let mut code = Vec::new();
    emit(&mut code, stp_pre(29, 30, -16));
    emit_mov_imm64(&mut code, 3, ctx);
    emit_mov_imm64(&mut code, 4, dispatch);
    emit(&mut code, 0xD63F_0080); // blr x4
    emit(&mut code, ldp_post(29, 30, 16));
    emit(&mut code, 0xD61F_0000); // br x0
    Ok(code)
}

/// Exit stub: write the register file back, unwind to the entry frame,
/// return the exit code.
pub(super) fn emit_exit_stub(ctx: u64, layout: MachineLayout) -> MachineResult<Vec<u8>> {
    let mut code = Vec::new();
    emit_mov_imm64(&mut code, 9, ctx);
    for i in 0..8u8 {
        let off = scaled_offset(reg_disp(layout.regs, i)?, 4, "register file")?;
        emit(&mut code, 0xB900_0000 | (off << 10) | (9 << 5) | pin(i)); // str wRi, [x9, ...]
    }
    let saved = scaled_offset(layout.saved_stack, 8, "saved stack")?;
    emit(&mut code, 0xF940_0000 | (saved << 10) | (9 << 5) | 10); // ldr x10, [x9, ...]
    emit(&mut code, 0x9100_015F); // mov sp, x10
    let exit = scaled_offset(layout.exit_code, 4, "exit code")?;
    emit(&mut code, 0xB940_0000 | (exit << 10) | (9 << 5)); // ldr w0, [x9, ...]
    emit(&mut code, ldp_off(19, 20, 16));
    emit(&mut code, ldp_off(21, 22, 32));
    emit(&mut code, ldp_off(23, 24, 48));
    emit(&mut code, ldp_off(25, 26, 64));
    emit(&mut code, ldp_off(27, 28, 80));
    emit(&mut code, ldp_post(29, 30, 96));
    emit(&mut code, RET);
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{OP_ADD, OP_DIV, OP_HALT, OP_NAND, encode_imm, encode_op};

    fn slot_words(word: u32) -> Vec<u32> {
        let code = emit_segment(&[word]).expect("emit");
        code[..SLOT_SIZE]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn every_slot_has_the_fixed_size() {
        let words: Vec<u32> = (0..16u32).map(|op| op << 28).collect();
        let code = emit_segment(&words).expect("emit");
        assert_eq!(code.len(), (words.len() + 1) * SLOT_SIZE);
    }

    #[test]
    fn arithmetic_slots_never_reach_the_dispatcher() {
        for word in [
            encode_op(OP_ADD, 1, 2, 3),
            encode_op(OP_NAND, 4, 4, 5),
            encode_imm(0, 123),
        ] {
            for insn in slot_words(word) {
                assert_ne!(insn, CALL_DISPATCH);
                assert_ne!(insn, TAIL_DISPATCH);
            }
        }
    }

    #[test]
    fn load_imm_splits_across_movz_and_movk() {
        let words = slot_words(encode_imm(2, 0x0012_3456));
        assert_eq!(words[0], movz_w(21, 0x3456));
        assert_eq!(words[1], movk_w_hi(21, 0x0012));
        assert_eq!(&words[2..], &[NOP, NOP, NOP]);
    }

    #[test]
    fn div_guards_against_a_zero_divisor() {
        let words = slot_words(encode_op(OP_DIV, 0, 1, 2));
        assert_eq!(words[0], cbnz_w(pin(2), 3));
        assert_eq!(words[1], movz_w(0, TAG_DIV_ZERO));
        assert_eq!(words[2], TAIL_DISPATCH);
    }

    #[test]
    fn halt_tail_jumps_with_its_tag() {
        let words = slot_words(encode_op(OP_HALT, 0, 0, 0));
        assert_eq!(words[0], movz_w(0, TAG_HALT));
        assert_eq!(words[1], TAIL_DISPATCH);
    }

    #[test]
    fn guard_slot_stops_the_machine() {
        let code = emit_segment(&[]).expect("emit");
        assert_eq!(code.len(), SLOT_SIZE);
        let insn = u32::from_le_bytes([code[0], code[1], code[2], code[3]]);
        assert_eq!(insn, movz_w(0, TAG_RESERVED));
    }
}
