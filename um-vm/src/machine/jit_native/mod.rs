//! Native code generation and executable memory management.
//!
//! Each bytecode word compiles into one fixed-size slot of native code,
//! so a jump to instruction `i` of a segment is a jump to
//! `code_base + i * SLOT_SIZE` with no lookup table. Every compiled
//! region uses the same register pinning, which is what lets control
//! transfer between segments without saving or restoring anything.
//!
//! Operations the slots cannot express inline are funneled through two
//! pre-built trampolines into [`dispatch_bridge`](super::dispatch_bridge):
//! a call-style one for operations that return to the slot (map, unmap,
//! output, input, the segment-0 store notification) and a tail-style one
//! for operations that transfer control (halt, load-program, faults).
//! Only these stubs embed absolute addresses; segment code itself is
//! fully relocatable.

use std::mem::offset_of;

use super::{Machine, MachineError, MachineResult};

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
use x86_64 as active;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
use aarch64 as active;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
mod unsupported;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
use unsupported as active;

use active::SLOT_SIZE;

/// Dispatcher request tags, marshalled into the tag register by the
/// emitted slots.
pub(super) const TAG_MAP: u32 = 1;
pub(super) const TAG_UNMAP: u32 = 2;
pub(super) const TAG_OUTPUT: u32 = 3;
pub(super) const TAG_INPUT: u32 = 4;
pub(super) const TAG_LOAD_PROGRAM: u32 = 5;
pub(super) const TAG_HALT: u32 = 6;
/// A store hit segment 0; the compiled program may now be stale.
pub(super) const TAG_ZERO_STORE: u32 = 7;
pub(super) const TAG_DIV_ZERO: u32 = 8;
/// Reserved opcode or execution fell off the end of a segment.
pub(super) const TAG_RESERVED: u32 = 9;

/// Signature of the entry thunk: (slot address, machine context) ->
/// exit code.
pub(super) type EntryFn = unsafe extern "C" fn(*const u8, *mut Machine) -> u32;

/// True when this build can generate and execute native code.
pub fn native_jit_supported() -> bool {
    cfg!(unix) && cfg!(any(target_arch = "x86_64", target_arch = "aarch64"))
}

/// Byte displacements of the `Machine` fields the stubs touch.
#[derive(Clone, Copy)]
pub(super) struct MachineLayout {
    pub regs: i32,
    pub saved_stack: i32,
    pub exit_code: i32,
    pub faulted: i32,
}

fn field_offset(offset: usize) -> MachineResult<i32> {
    i32::try_from(offset)
        .map_err(|_| MachineError::JitNative("machine context field out of displacement range".into()))
}

pub(super) fn machine_layout() -> MachineResult<MachineLayout> {
    Ok(MachineLayout {
        regs: field_offset(offset_of!(Machine, regs))?,
        saved_stack: field_offset(offset_of!(Machine, saved_stack))?,
        exit_code: field_offset(offset_of!(Machine, exit_code))?,
        faulted: field_offset(offset_of!(Machine, faulted))?,
    })
}

/// A region of process memory holding generated code. Written while
/// mapped read-write, then flipped to read-execute before use.
pub(super) struct ExecutableMemory {
    ptr: *mut u8,
    len: usize,
}

impl ExecutableMemory {
    pub(super) fn from_code(code: &[u8]) -> MachineResult<Self> {
        if code.is_empty() {
            return Err(MachineError::JitNative("refusing to map an empty code region".into()));
        }
        let len = code.len();
        let ptr = alloc_code_region(len)?;
        let region = ExecutableMemory { ptr, len };
        region.write_code(code);
        region.finalize()?;
        Ok(region)
    }

    pub(super) fn ptr(&self) -> *const u8 {
        self.ptr
    }

    pub(super) fn addr(&self) -> u64 {
        self.ptr as u64
    }

    fn write_code(&self, code: &[u8]) {
        #[cfg(target_os = "macos")]
        unsafe {
            libc::pthread_jit_write_protect_np(0);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.ptr, code.len());
        }
        #[cfg(target_os = "macos")]
        unsafe {
            libc::pthread_jit_write_protect_np(1);
        }
    }

    fn finalize(&self) -> MachineResult<()> {
        let rc = unsafe {
            libc::mprotect(
                self.ptr as *mut libc::c_void,
                self.len,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(MachineError::JitNative(format!(
                "mprotect(PROT_EXEC) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        flush_icache(self.ptr, self.len);
        Ok(())
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

fn alloc_code_region(len: usize) -> MachineResult<*mut u8> {
    #[cfg(target_os = "macos")]
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_JIT;
    #[cfg(not(target_os = "macos"))]
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(MachineError::JitNative(format!(
            "mmap of {len} code bytes failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
fn flush_icache(ptr: *mut u8, len: usize) {
    unsafe {
        libc::sys_icache_invalidate(ptr as *mut libc::c_void, len);
    }
}

#[cfg(all(target_arch = "aarch64", not(target_os = "macos")))]
fn flush_icache(ptr: *mut u8, len: usize) {
    unsafe extern "C" {
        fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
    }
    unsafe {
        __clear_cache(ptr as *mut libc::c_char, ptr.add(len) as *mut libc::c_char);
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn flush_icache(_ptr: *mut u8, _len: usize) {}

/// Native code for one bytecode segment: `words + 1` slots, the last
/// being a guard that stops the machine if execution runs off the end.
pub(super) struct CompiledSegment {
    code: ExecutableMemory,
    words: u32,
}

impl CompiledSegment {
    pub(super) fn compile(words: &[u32]) -> MachineResult<Self> {
        let bytes = active::emit_segment(words)?;
        let code = ExecutableMemory::from_code(&bytes)?;
        Ok(CompiledSegment { code, words: words.len() as u32 })
    }

    pub(super) fn words(&self) -> u32 {
        self.words
    }

    pub(super) fn base_ptr(&self) -> *const u8 {
        self.code.ptr()
    }

    /// Native address of the slot for instruction `index`. The caller
    /// checks `index` against `words()`; the guard slot is not a valid
    /// jump target.
    pub(super) fn slot_addr(&self, index: u32) -> u64 {
        self.code.addr() + (index as u64) * (SLOT_SIZE as u64)
    }
}

/// The four fixed stubs generated once per run. These are the only code
/// regions that embed absolute addresses (the machine context, the
/// dispatcher, and each other).
pub(super) struct RuntimeStubs {
    exit: ExecutableMemory,
    tail: ExecutableMemory,
    call: ExecutableMemory,
    entry: ExecutableMemory,
}

impl RuntimeStubs {
    pub(super) fn install(machine: *mut Machine, arena_base: *mut u8) -> MachineResult<Self> {
        let layout = machine_layout()?;
        let ctx = machine as u64;
        let dispatch: extern "C" fn(u32, u32, u32, *mut Machine) -> u64 = super::dispatch_bridge;
        let dispatch = dispatch as usize as u64;

        let exit = ExecutableMemory::from_code(&active::emit_exit_stub(ctx, layout)?)?;
        let tail = ExecutableMemory::from_code(&active::emit_tail_trampoline(ctx, dispatch)?)?;
        let call = ExecutableMemory::from_code(&active::emit_call_trampoline(
            ctx,
            dispatch,
            exit.addr(),
            layout,
        )?)?;
        let entry = ExecutableMemory::from_code(&active::emit_entry_thunk(
            call.addr(),
            tail.addr(),
            arena_base as u64,
            layout,
        )?)?;

        let stubs = RuntimeStubs { exit, tail, call, entry };
        tracing::debug!(
            entry = stubs.entry.addr(),
            call = stubs.call.addr(),
            tail = stubs.tail.addr(),
            exit = stubs.exit.addr(),
            "installed runtime stubs"
        );
        Ok(stubs)
    }

    pub(super) fn exit_addr(&self) -> u64 {
        self.exit.addr()
    }

    pub(super) fn entry_fn(&self) -> EntryFn {
        unsafe { std::mem::transmute::<*const u8, EntryFn>(self.entry.ptr()) }
    }
}
