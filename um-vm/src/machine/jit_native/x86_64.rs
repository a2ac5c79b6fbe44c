//! x86-64 (System V) backend.
//!
//! Register pinning, identical in every compiled region:
//!
//! - abstract registers r0-r7 live in `r8d`-`r15d`; 32-bit writes keep
//!   the upper halves zero, so 64-bit address arithmetic on them is safe
//! - `rbx` holds the call-style trampoline, `rbp` the tail-style one,
//!   `rcx` the arena base; all three are callee-saved, so the dispatcher
//!   cannot disturb them
//! - `rax`, `rdx`, `rsi`, `rdi` are slot-local scratch
//!
//! Heavy operations marshal operands into `esi`/`edx` and a tag into
//! `edi`, then either `call *%rbx` (result comes back in `eax`) or
//! `jmp *%rbp` (control resumes at the address the dispatcher returns).

use crate::decode::{Instr, decode};

use super::{
    MachineError, MachineLayout, MachineResult, TAG_DIV_ZERO, TAG_HALT, TAG_INPUT,
    TAG_LOAD_PROGRAM, TAG_MAP, TAG_OUTPUT, TAG_RESERVED, TAG_UNMAP, TAG_ZERO_STORE,
};

/// Fixed native-code footprint of one bytecode instruction.
pub(super) const SLOT_SIZE: usize = 24;

/// Compile a segment: one slot per word plus a trailing guard slot that
/// stops the machine when execution falls off the end.
pub(super) fn emit_segment(words: &[u32]) -> MachineResult<Vec<u8>> {
    let mut code = Vec::with_capacity((words.len() + 1) * SLOT_SIZE);
    for &word in words {
        emit_slot(&mut code, decode(word));
    }
    let start = code.len();
    emit_tail_dispatch(&mut code, TAG_RESERVED);
    pad_slot(&mut code, start);
    Ok(code)
}

fn emit_slot(code: &mut Vec<u8>, instr: Instr) {
    let start = code.len();
    match instr {
        Instr::LoadImm { a, value } => {
            // mov $value, %rAd
            code.extend_from_slice(&[0x41, 0xC7, 0xC0 | a]);
            code.extend_from_slice(&value.to_le_bytes());
        }
        Instr::CondMove { a, b, c } => {
            emit_test(code, c);
            // cmovne %rBd, %rAd
            code.extend_from_slice(&[0x45, 0x0F, 0x45, 0xC0 | (a << 3) | b]);
        }
        Instr::Load { a, b, c } => {
            // lea (%rcx,%rB), %rax ; mov (%rax,%rC,4), %rAd
            code.extend_from_slice(&[0x4A, 0x8D, 0x04, 0x01 | (b << 3)]);
            code.extend_from_slice(&[0x46, 0x8B, 0x04 | (a << 3), 0x80 | (c << 3)]);
        }
        Instr::Store { a, b, c } => {
            // A store into segment 0 invalidates its compiled code; the
            // dispatcher is told before the write lands.
            emit_test(code, a);
            code.extend_from_slice(&[0x75, 0x07]); // jnz past the notification
            emit_call_dispatch(code, TAG_ZERO_STORE);
            // lea (%rcx,%rA), %rax ; mov %rCd, (%rax,%rB,4)
            code.extend_from_slice(&[0x4A, 0x8D, 0x04, 0x01 | (a << 3)]);
            code.extend_from_slice(&[0x46, 0x89, 0x04 | (c << 3), 0x80 | (b << 3)]);
        }
        Instr::Add { a, b, c } => {
            code.extend_from_slice(&[0x44, 0x89, 0xC0 | (b << 3)]); // mov %rBd, %eax
            code.extend_from_slice(&[0x44, 0x01, 0xC0 | (c << 3)]); // add %rCd, %eax
            emit_mov_eax_to(code, a);
        }
        Instr::Mul { a, b, c } => {
            code.extend_from_slice(&[0x44, 0x89, 0xC0 | (b << 3)]); // mov %rBd, %eax
            code.extend_from_slice(&[0x41, 0xF7, 0xE0 | c]); // mul %rCd
            emit_mov_eax_to(code, a);
        }
        Instr::Div { a, b, c } => {
            emit_test(code, c);
            code.extend_from_slice(&[0x75, 0x07]); // jnz past the trap
            emit_tail_dispatch(code, TAG_DIV_ZERO);
            code.extend_from_slice(&[0x31, 0xD2]); // xor %edx, %edx
            code.extend_from_slice(&[0x44, 0x89, 0xC0 | (b << 3)]); // mov %rBd, %eax
            code.extend_from_slice(&[0x41, 0xF7, 0xF0 | c]); // div %rCd
            emit_mov_eax_to(code, a);
        }
        Instr::Nand { a, b, c } => {
            // The destination doubles as the accumulator; when it aliases
            // an operand, start from the other one.
            let (moved, kept) = if a == c { (c, b) } else { (b, c) };
            code.extend_from_slice(&[0x45, 0x8B, 0xC0 | (a << 3) | moved]); // mov
            code.extend_from_slice(&[0x45, 0x23, 0xC0 | (a << 3) | kept]); // and
            code.extend_from_slice(&[0x41, 0xF7, 0xD0 | a]); // not %rAd
        }
        Instr::Halt => emit_tail_dispatch(code, TAG_HALT),
        Instr::Map { b, c } => {
            emit_mov_to_esi(code, c);
            emit_call_dispatch(code, TAG_MAP);
            emit_mov_eax_to(code, b);
        }
        Instr::Unmap { c } => {
            emit_mov_to_esi(code, c);
            emit_call_dispatch(code, TAG_UNMAP);
        }
        Instr::Output { c } => {
            emit_mov_to_esi(code, c);
            emit_call_dispatch(code, TAG_OUTPUT);
        }
        Instr::Input { c } => {
            emit_call_dispatch(code, TAG_INPUT);
            emit_mov_eax_to(code, c);
        }
        Instr::LoadProgram { b, c } => {
            emit_mov_to_esi(code, b);
            emit_mov_to_edx(code, c);
            emit_tail_dispatch(code, TAG_LOAD_PROGRAM);
        }
        Instr::Reserved { .. } => emit_tail_dispatch(code, TAG_RESERVED),
    }
    pad_slot(code, start);
}

/// test %rXd, %rXd
fn emit_test(code: &mut Vec<u8>, x: u8) {
    code.extend_from_slice(&[0x45, 0x85, 0xC0 | (x << 3) | x]);
}

/// mov %rXd, %esi
fn emit_mov_to_esi(code: &mut Vec<u8>, x: u8) {
    code.extend_from_slice(&[0x44, 0x89, 0xC6 | (x << 3)]);
}

/// mov %rXd, %edx
fn emit_mov_to_edx(code: &mut Vec<u8>, x: u8) {
    code.extend_from_slice(&[0x44, 0x89, 0xC2 | (x << 3)]);
}

/// mov %eax, %rXd
fn emit_mov_eax_to(code: &mut Vec<u8>, x: u8) {
    code.extend_from_slice(&[0x41, 0x89, 0xC0 | x]);
}

/// mov $tag, %edi ; call *%rbx
fn emit_call_dispatch(code: &mut Vec<u8>, tag: u32) {
    code.push(0xBF);
    code.extend_from_slice(&tag.to_le_bytes());
    code.extend_from_slice(&[0xFF, 0xD3]);
}

/// mov $tag, %edi ; jmp *%rbp
fn emit_tail_dispatch(code: &mut Vec<u8>, tag: u32) {
    code.push(0xBF);
    code.extend_from_slice(&tag.to_le_bytes());
    code.extend_from_slice(&[0xFF, 0xE5]);
}

fn pad_slot(code: &mut Vec<u8>, start: usize) {
    let used = code.len() - start;
    debug_assert!(used <= SLOT_SIZE, "slot overflow: {used} bytes");
    let mut rem = SLOT_SIZE - used;
    while rem >= 3 {
        code.extend_from_slice(&[0x0F, 0x1F, 0x00]); // 3-byte nop
        rem -= 3;
    }
    if rem == 2 {
        code.extend_from_slice(&[0x66, 0x90]);
    } else if rem == 1 {
        code.push(0x90);
    }
}

/// movabs $imm, %reg (low 3 bits of the register number only; the
/// stubs never materialize into r8-r15)
fn emit_movabs(code: &mut Vec<u8>, reg: u8, imm: u64) {
    code.extend_from_slice(&[0x48, 0xB8 | reg]);
    code.extend_from_slice(&imm.to_le_bytes());
}

fn emit_i32(code: &mut Vec<u8>, value: i32) {
    code.extend_from_slice(&value.to_le_bytes());
}

fn reg_disp(layout_base: i32, index: u8) -> MachineResult<i32> {
    layout_base
        .checked_add(index as i32 * 4)
        .ok_or_else(|| MachineError::JitNative("register file displacement overflow".into()))
}

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RBP: u8 = 5;

/// Entry thunk: `extern "C" fn(slot: *const u8, ctx: *mut Machine) -> u32`.
///
/// Saves the callee-saved registers it is about to repurpose, records
/// the stack pointer in the context (the exit stub restores it, so
/// generated code never needs a return path), installs the pinned
/// registers and the register file, and jumps into the slot in `rdi`.
pub(super) fn emit_entry_thunk(
    call_tramp: u64,
    tail_tramp: u64,
    arena_base: u64,
    layout: MachineLayout,
) -> MachineResult<Vec<u8>> {
    let mut code = Vec::new();
    code.push(0x53); // push %rbx
    code.push(0x55); // push %rbp
    code.extend_from_slice(&[0x41, 0x54]); // push %r12
    code.extend_from_slice(&[0x41, 0x55]); // push %r13
    code.extend_from_slice(&[0x41, 0x56]); // push %r14
    code.extend_from_slice(&[0x41, 0x57]); // push %r15
    // Realign so slot code always runs with a 16-byte aligned stack.
    code.extend_from_slice(&[0x48, 0x83, 0xEC, 0x08]); // sub $8, %rsp
    code.extend_from_slice(&[0x48, 0x89, 0xA6]); // mov %rsp, saved(%rsi)
    emit_i32(&mut code, layout.saved_stack);
    emit_movabs(&mut code, RBX, call_tramp);
    emit_movabs(&mut code, RBP, tail_tramp);
    emit_movabs(&mut code, RCX, arena_base);
    for i in 0..8u8 {
        // mov regs+4i(%rsi), %r(8+i)d
        code.extend_from_slice(&[0x44, 0x8B, 0x86 | (i << 3)]);
        emit_i32(&mut code, reg_disp(layout.regs, i)?);
    }
    code.extend_from_slice(&[0xFF, 0xE7]); // jmp *%rdi
    Ok(code)
}

/// Call-style trampoline: preserves the caller-saved pinned registers,
/// invokes the dispatcher, and returns to the slot unless the machine
/// has faulted, in which case it diverts to the exit stub.
pub(super) fn emit_call_trampoline(
    ctx: u64,
    dispatch: u64,
    exit_stub: u64,
    layout: MachineLayout,
) -> MachineResult<Vec<u8>> {
    let mut code = Vec::new();
    code.push(0x51); // push %rcx
    code.extend_from_slice(&[0x41, 0x50]); // push %r8
    code.extend_from_slice(&[0x41, 0x51]); // push %r9
    code.extend_from_slice(&[0x41, 0x52]); // push %r10
    code.extend_from_slice(&[0x41, 0x53]); // push %r11
    emit_movabs(&mut code, RCX, ctx);
    emit_movabs(&mut code, RAX, dispatch);
    code.extend_from_slice(&[0xFF, 0xD0]); // call *%rax
    code.extend_from_slice(&[0x41, 0x5B]); // pop %r11
    code.extend_from_slice(&[0x41, 0x5A]); // pop %r10
    code.extend_from_slice(&[0x41, 0x59]); // pop %r9
    code.extend_from_slice(&[0x41, 0x58]); // pop %r8
    code.push(0x59); // pop %rcx
    emit_movabs(&mut code, RDX, ctx);
    code.extend_from_slice(&[0x80, 0xBA]); // cmpb $0, faulted(%rdx)
    emit_i32(&mut code, layout.faulted);
    code.push(0x00);
    code.extend_from_slice(&[0x75, 0x01]); // jne past the ret
    code.push(0xC3); // ret
    emit_movabs(&mut code, RAX, exit_stub);
    code.extend_from_slice(&[0xFF, 0xE0]); // jmp *%rax
    Ok(code)
}

/// Tail-style trampoline: same preservation, but control continues at
/// whatever address the dispatcher returns (a segment-0 slot or the
/// exit stub).
pub(super) fn emit_tail_trampoline(ctx: u64, dispatch: u64) -> MachineResult<Vec<u8>> {
    let mut code = Vec::new();
    code.push(0x51); // push %rcx
    code.extend_from_slice(&[0x41, 0x50]); // push %r8
    code.extend_from_slice(&[0x41, 0x51]); // push %r9
    code.extend_from_slice(&[0x41, 0x52]); // push %r10
    code.extend_from_slice(&[0x41, 0x53]); // push %r11
    // Entered by jmp, not call: realign for the dispatcher.
    code.extend_from_slice(&[0x48, 0x83, 0xEC, 0x08]); // sub $8, %rsp
    emit_movabs(&mut code, RCX, ctx);
    emit_movabs(&mut code, RAX, dispatch);
    code.extend_from_slice(&[0xFF, 0xD0]); // call *%rax
    code.extend_from_slice(&[0x48, 0x83, 0xC4, 0x08]); // add $8, %rsp
    code.extend_from_slice(&[0x41, 0x5B]); // pop %r11
    code.extend_from_slice(&[0x41, 0x5A]); // pop %r10
    code.extend_from_slice(&[0x41, 0x59]); // pop %r9
    code.extend_from_slice(&[0x41, 0x58]); // pop %r8
    code.push(0x59); // pop %rcx
    code.extend_from_slice(&[0xFF, 0xE0]); // jmp *%rax
    Ok(code)
}

/// Exit stub: writes the register file back into the context, restores
/// the stack pointer recorded by the entry thunk, pops the callee-saved
/// registers and returns the exit code.
pub(super) fn emit_exit_stub(ctx: u64, layout: MachineLayout) -> MachineResult<Vec<u8>> {
    let mut code = Vec::new();
    emit_movabs(&mut code, RAX, ctx);
    for i in 0..8u8 {
        // mov %r(8+i)d, regs+4i(%rax)
        code.extend_from_slice(&[0x44, 0x89, 0x80 | (i << 3)]);
        emit_i32(&mut code, reg_disp(layout.regs, i)?);
    }
    code.extend_from_slice(&[0x48, 0x8B, 0xA0]); // mov saved(%rax), %rsp
    emit_i32(&mut code, layout.saved_stack);
    code.extend_from_slice(&[0x8B, 0x88]); // mov exit_code(%rax), %ecx
    emit_i32(&mut code, layout.exit_code);
    code.extend_from_slice(&[0x48, 0x83, 0xC4, 0x08]); // add $8, %rsp
    code.extend_from_slice(&[0x41, 0x5F]); // pop %r15
    code.extend_from_slice(&[0x41, 0x5E]); // pop %r14
    code.extend_from_slice(&[0x41, 0x5D]); // pop %r13
    code.extend_from_slice(&[0x41, 0x5C]); // pop %r12
    code.push(0x5D); // pop %rbp
    code.push(0x5B); // pop %rbx
    code.extend_from_slice(&[0x89, 0xC8]); // mov %ecx, %eax
    code.push(0xC3); // ret
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{OP_ADD, OP_DIV, OP_HALT, OP_NAND, encode_imm, encode_op};

    fn slot_for(word: u32) -> Vec<u8> {
        let code = emit_segment(&[word]).expect("emit");
        code[..SLOT_SIZE].to_vec()
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
            let slot = slot_for(word);
            for pair in slot.windows(2) {
                assert_ne!(pair, &[0xFF, 0xD3], "unexpected call *%rbx");
                assert_ne!(pair, &[0xFF, 0xE5], "unexpected jmp *%rbp");
            }
        }
    }

    #[test]
    fn load_imm_encodes_the_value_little_endian() {
        let slot = slot_for(encode_imm(2, 0x0012_3456));
        assert_eq!(&slot[..7], &[0x41, 0xC7, 0xC2, 0x56, 0x34, 0x12, 0x00]);
    }

    #[test]
    fn div_guards_against_a_zero_divisor() {
        let slot = slot_for(encode_op(OP_DIV, 0, 1, 2));
        // test %r10d, %r10d ; jnz +7 ; mov $TAG_DIV_ZERO, %edi ; jmp *%rbp
        assert_eq!(&slot[..5], &[0x45, 0x85, 0xD2, 0x75, 0x07]);
        assert_eq!(slot[5], 0xBF);
        assert_eq!(&slot[10..12], &[0xFF, 0xE5]);
    }

    #[test]
    fn halt_tail_jumps_with_its_tag() {
        let slot = slot_for(encode_op(OP_HALT, 0, 0, 0));
        assert_eq!(&slot[..7], &[0xBF, 0x06, 0x00, 0x00, 0x00, 0xFF, 0xE5]);
    }

    #[test]
    fn guard_slot_stops_the_machine() {
        let code = emit_segment(&[]).expect("emit");
        assert_eq!(code.len(), SLOT_SIZE);
        assert_eq!(&code[..7], &[0xBF, 0x09, 0x00, 0x00, 0x00, 0xFF, 0xE5]);
    }
}
