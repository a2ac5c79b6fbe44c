//! Stub backend for targets without native code generation. The driver
//! refuses to run before any of these are reached.

use super::{MachineError, MachineLayout, MachineResult};

pub(super) const SLOT_SIZE: usize = 4;

fn unsupported<T>() -> MachineResult<T> {
    Err(MachineError::UnsupportedTarget)
}

pub(super) fn emit_segment(_words: &[u32]) -> MachineResult<Vec<u8>> {
    unsupported()
}

pub(super) fn emit_entry_thunk(
    _call_tramp: u64,
    _tail_tramp: u64,
    _arena_base: u64,
    _layout: MachineLayout,
) -> MachineResult<Vec<u8>> {
    unsupported()
}

pub(super) fn emit_call_trampoline(
    _ctx: u64,
    _dispatch: u64,
    _exit_stub: u64,
    _layout: MachineLayout,
) -> MachineResult<Vec<u8>> {
    unsupported()
}

pub(super) fn emit_tail_trampoline(_ctx: u64, _dispatch: u64) -> MachineResult<Vec<u8>> {
    unsupported()
}

pub(super) fn emit_exit_stub(_ctx: u64, _layout: MachineLayout) -> MachineResult<Vec<u8>> {
    unsupported()
}
