//! End-to-end tests: assemble small programs, run them through the
//! native backend, and observe their output and register file.

use std::cell::RefCell;
use std::io::{Cursor, Write};
use std::rc::Rc;

use vm::decode::{
    OP_ADD, OP_COND_MOVE, OP_DIV, OP_HALT, OP_INPUT, OP_LOAD, OP_LOAD_PROGRAM, OP_MAP, OP_MUL,
    OP_NAND, OP_OUTPUT, OP_STORE, OP_UNMAP, encode_imm, encode_op,
};
use vm::{Machine, MachineError, MachineResult, native_jit_supported};

/// Output sink the test can still read after the machine consumed it.
#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run_program(words: &[u32], input: &[u8]) -> (MachineResult<u32>, Vec<u8>, [u32; 8]) {
    let sink = SharedBuf::default();
    let mut machine = Machine::with_io(
        words,
        Box::new(Cursor::new(input.to_vec())),
        Box::new(sink.clone()),
    )
    .expect("machine setup");
    let status = machine.run();
    let output = sink.0.borrow().clone();
    (status, output, machine.regs())
}

/// Materialize an arbitrary 32-bit constant into `dst` using only
/// 25-bit immediates: load the top byte, shift it up by doubling, add
/// the low 24 bits. Clobbers register 7.
fn emit_const(code: &mut Vec<u32>, dst: u8, value: u32) {
    code.push(encode_imm(dst, value >> 24));
    for _ in 0..24 {
        code.push(encode_op(OP_ADD, dst, dst, dst));
    }
    code.push(encode_imm(7, value & 0x00FF_FFFF));
    code.push(encode_op(OP_ADD, dst, dst, 7));
}

#[test]
fn outputs_two_bytes_and_halts() {
    if !native_jit_supported() {
        return;
    }
    let program = [
        encode_imm(1, 72),
        encode_op(OP_OUTPUT, 0, 0, 1),
        encode_imm(1, 10),
        encode_op(OP_OUTPUT, 0, 0, 1),
        encode_op(OP_HALT, 0, 0, 0),
    ];
    let (status, output, _) = run_program(&program, &[]);
    assert_eq!(status.expect("clean halt"), 0);
    assert_eq!(output, vec![72, 10]);
}

#[test]
fn nand_and_add_wrap_around() {
    if !native_jit_supported() {
        return;
    }
    let program = [
        encode_imm(1, 0),
        encode_op(OP_NAND, 2, 1, 1), // r2 = !(0 & 0) = 0xFFFFFFFF
        encode_op(OP_OUTPUT, 0, 0, 2),
        encode_imm(3, 1),
        encode_op(OP_ADD, 4, 2, 3), // r4 = 0xFFFFFFFF + 1 = 0
        encode_op(OP_OUTPUT, 0, 0, 4),
        encode_op(OP_HALT, 0, 0, 0),
    ];
    let (status, output, regs) = run_program(&program, &[]);
    assert_eq!(status.expect("clean halt"), 0);
    assert_eq!(output, vec![0xFF, 0x00]);
    assert_eq!(regs[2], u32::MAX);
    assert_eq!(regs[4], 0);
}

#[test]
fn mul_wraps_and_div_truncates() {
    if !native_jit_supported() {
        return;
    }
    let program = [
        encode_imm(1, 1 << 24),
        encode_imm(2, 256),
        encode_op(OP_MUL, 3, 1, 2), // 2^24 * 2^8 = 2^32 -> 0
        encode_op(OP_OUTPUT, 0, 0, 3),
        encode_imm(4, 7),
        encode_imm(5, 2),
        encode_op(OP_DIV, 6, 4, 5), // 7 / 2 = 3
        encode_op(OP_OUTPUT, 0, 0, 6),
        encode_op(OP_HALT, 0, 0, 0),
    ];
    let (status, output, regs) = run_program(&program, &[]);
    assert_eq!(status.expect("clean halt"), 0);
    assert_eq!(output, vec![0, 3]);
    assert_eq!(regs[3], 0);
}

#[test]
fn conditional_move_tests_the_condition_register() {
    if !native_jit_supported() {
        return;
    }
    let program = [
        encode_imm(1, 5),
        encode_imm(2, 9),
        encode_imm(3, 0),
        encode_op(OP_COND_MOVE, 1, 2, 3), // r3 == 0: no move
        encode_op(OP_OUTPUT, 0, 0, 1),
        encode_imm(3, 1),
        encode_op(OP_COND_MOVE, 1, 2, 3), // r3 != 0: r1 = r2
        encode_op(OP_OUTPUT, 0, 0, 1),
        encode_op(OP_HALT, 0, 0, 0),
    ];
    let (status, output, _) = run_program(&program, &[]);
    assert_eq!(status.expect("clean halt"), 0);
    assert_eq!(output, vec![5, 9]);
}

#[test]
fn map_store_load_round_trip() {
    if !native_jit_supported() {
        return;
    }
    let program = [
        encode_imm(1, 4),
        encode_op(OP_MAP, 0, 2, 1), // r2 = handle of 4 fresh words
        encode_imm(3, 2),
        encode_imm(4, 99),
        encode_op(OP_STORE, 2, 3, 4), // seg[r2][2] = 99
        encode_op(OP_LOAD, 5, 2, 3),  // r5 = seg[r2][2]
        encode_op(OP_OUTPUT, 0, 0, 5),
        encode_op(OP_HALT, 0, 0, 0),
    ];
    let (status, output, regs) = run_program(&program, &[]);
    assert_eq!(status.expect("clean halt"), 0);
    assert_eq!(output, vec![99]);
    assert_ne!(regs[2], 0, "mapped handle must not alias segment 0");
}

#[test]
fn unmapped_segment_comes_back_zeroed() {
    if !native_jit_supported() {
        return;
    }
    let program = [
        encode_imm(1, 4),
        encode_op(OP_MAP, 0, 2, 1),
        encode_imm(3, 2),
        encode_imm(4, 99),
        encode_op(OP_STORE, 2, 3, 4),
        encode_op(OP_UNMAP, 0, 0, 2),
        encode_op(OP_MAP, 0, 5, 1), // same size class: handle is recycled
        encode_op(OP_LOAD, 6, 5, 3),
        encode_op(OP_OUTPUT, 0, 0, 6),
        encode_op(OP_HALT, 0, 0, 0),
    ];
    let (status, output, regs) = run_program(&program, &[]);
    assert_eq!(status.expect("clean halt"), 0);
    assert_eq!(output, vec![0], "recycled segment must read back zero");
    assert_eq!(regs[2], regs[5], "freed handle is reused most-recently-first");
}

#[test]
fn input_reads_one_byte_at_a_time() {
    if !native_jit_supported() {
        return;
    }
    let program = [
        encode_op(OP_INPUT, 0, 0, 1),
        encode_op(OP_OUTPUT, 0, 0, 1),
        encode_op(OP_INPUT, 0, 0, 2),
        encode_op(OP_OUTPUT, 0, 0, 2),
        encode_op(OP_HALT, 0, 0, 0),
    ];
    let (status, output, _) = run_program(&program, b"AB");
    assert_eq!(status.expect("clean halt"), 0);
    assert_eq!(output, b"AB");
}

#[test]
fn end_of_input_yields_all_ones() {
    if !native_jit_supported() {
        return;
    }
    let program = [
        encode_op(OP_INPUT, 0, 0, 1),
        encode_op(OP_OUTPUT, 0, 0, 1),
        encode_op(OP_HALT, 0, 0, 0),
    ];
    let (status, output, regs) = run_program(&program, &[]);
    assert_eq!(status.expect("clean halt"), 0);
    assert_eq!(regs[1], u32::MAX);
    assert_eq!(output, vec![0xFF]);
}

#[test]
fn division_by_zero_is_a_fault() {
    if !native_jit_supported() {
        return;
    }
    let program = [
        encode_imm(1, 3),
        encode_imm(2, 0),
        encode_op(OP_DIV, 3, 1, 2),
        encode_op(OP_HALT, 0, 0, 0),
    ];
    let (status, output, _) = run_program(&program, &[]);
    assert!(matches!(status, Err(MachineError::DivisionByZero)));
    assert!(output.is_empty());
}

#[test]
fn running_off_the_end_halts_cleanly() {
    if !native_jit_supported() {
        return;
    }
    let program = [encode_imm(1, 65), encode_op(OP_OUTPUT, 0, 0, 1)];
    let (status, output, _) = run_program(&program, &[]);
    assert_eq!(status.expect("guard halt"), 0);
    assert_eq!(output, vec![65]);
}

#[test]
fn reserved_opcode_halts_cleanly() {
    if !native_jit_supported() {
        return;
    }
    let (status, output, _) = run_program(&[0xE000_0000], &[]);
    assert_eq!(status.expect("guard halt"), 0);
    assert!(output.is_empty());
}

#[test]
fn load_program_jumps_within_segment_zero() {
    if !native_jit_supported() {
        return;
    }
    let program = [
        encode_imm(1, 4),
        encode_op(OP_LOAD_PROGRAM, 0, 0, 1), // segment 0, resume at 4
        encode_imm(2, 66),
        encode_op(OP_OUTPUT, 0, 0, 2), // skipped
        encode_imm(2, 65),
        encode_op(OP_OUTPUT, 0, 0, 2),
        encode_op(OP_HALT, 0, 0, 0),
    ];
    let (status, output, _) = run_program(&program, &[]);
    assert_eq!(status.expect("clean halt"), 0);
    assert_eq!(output, vec![65]);
}

#[test]
fn jump_past_the_end_of_the_program_is_a_fault() {
    if !native_jit_supported() {
        return;
    }
    let program = [
        encode_imm(1, 100),
        encode_op(OP_LOAD_PROGRAM, 0, 0, 1),
        encode_op(OP_HALT, 0, 0, 0),
    ];
    let (status, _, _) = run_program(&program, &[]);
    assert!(matches!(status, Err(MachineError::JumpOutOfRange { target: 100, .. })));
}

#[test]
fn load_program_executes_a_mapped_segment() {
    if !native_jit_supported() {
        return;
    }
    // Child program, written word by word into a mapped segment:
    // print 'X' and halt.
    let child = [
        encode_imm(2, 88),
        encode_op(OP_OUTPUT, 0, 0, 2),
        encode_op(OP_HALT, 0, 0, 0),
    ];
    let mut program = vec![
        encode_imm(1, child.len() as u32),
        encode_op(OP_MAP, 0, 3, 1),
    ];
    for (i, &word) in child.iter().enumerate() {
        emit_const(&mut program, 4, word);
        program.push(encode_imm(5, i as u32));
        program.push(encode_op(OP_STORE, 3, 5, 4));
    }
    program.push(encode_op(OP_LOAD_PROGRAM, 0, 3, 0)); // r0 = 0: start at index 0
    // Never reached once control moves to the child.
    program.push(encode_imm(6, 90));
    program.push(encode_op(OP_OUTPUT, 0, 0, 6));
    program.push(encode_op(OP_HALT, 0, 0, 0));

    let (status, output, _) = run_program(&program, &[]);
    assert_eq!(status.expect("clean halt"), 0);
    assert_eq!(output, b"X");
}

#[test]
fn registers_survive_the_segment_switch() {
    if !native_jit_supported() {
        return;
    }
    // Child prints whatever the parent left in r1.
    let child = [encode_op(OP_OUTPUT, 0, 0, 1), encode_op(OP_HALT, 0, 0, 0)];
    let mut program = vec![
        encode_imm(1, 72),
        encode_imm(2, child.len() as u32),
        encode_op(OP_MAP, 0, 3, 2),
    ];
    for (i, &word) in child.iter().enumerate() {
        emit_const(&mut program, 4, word);
        program.push(encode_imm(5, i as u32));
        program.push(encode_op(OP_STORE, 3, 5, 4));
    }
    program.push(encode_op(OP_LOAD_PROGRAM, 0, 3, 0));

    let (status, output, _) = run_program(&program, &[]);
    assert_eq!(status.expect("clean halt"), 0);
    assert_eq!(output, b"H");
}

#[test]
fn stores_into_segment_zero_are_observed_on_the_next_jump() {
    if !native_jit_supported() {
        return;
    }
    // Overwrite a later instruction of the running program with halt,
    // then jump to it. Stale code would print a second byte.
    let mut program = vec![encode_imm(1, 65), encode_op(OP_OUTPUT, 0, 0, 1)];
    emit_const(&mut program, 4, encode_op(OP_HALT, 0, 0, 0));
    let target = (program.len() + 4) as u32;
    program.push(encode_imm(5, target));
    program.push(encode_op(OP_STORE, 0, 5, 4)); // patch segment 0
    program.push(encode_imm(6, target));
    program.push(encode_op(OP_LOAD_PROGRAM, 0, 0, 6));
    program.push(encode_op(OP_OUTPUT, 0, 0, 1)); // replaced by halt
    program.push(encode_op(OP_HALT, 0, 0, 0));
    assert_eq!(program[target as usize], encode_op(OP_OUTPUT, 0, 0, 1));

    let (status, output, _) = run_program(&program, &[]);
    assert_eq!(status.expect("clean halt"), 0);
    assert_eq!(output, b"A", "the patched instruction must take effect");
}
