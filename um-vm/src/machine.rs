//! The execution driver.
//!
//! `Machine` owns the segmented allocator, the compiled form of segment
//! 0, the register file and the I/O streams. Running a program means
//! compiling segment 0 into native code, installing the runtime stubs,
//! and handing control to generated code through the entry thunk; Rust
//! is re-entered only through [`dispatch_bridge`], the single `extern
//! "C"` multiplexer behind the map/unmap/output/input/load-program/halt
//! instructions and the fault paths.
//!
//! Segment 0 is recompiled, never patched. A store into segment 0 sets
//! a dirty flag via the dispatcher; the next load-program observes the
//! flag and rebuilds the code buffer before jumping. Load-program is a
//! tail transfer, so no return address can point into the superseded
//! buffer when it is dropped.

use std::error::Error;
use std::fmt;
use std::io::{self, Read, Write};

use crate::memory::{MAX_SEGMENT_BYTES, MemoryError, SegmentAllocator};

mod jit_native;

pub use jit_native::native_jit_supported;

use jit_native::{
    CompiledSegment, RuntimeStubs, TAG_DIV_ZERO, TAG_HALT, TAG_INPUT, TAG_LOAD_PROGRAM, TAG_MAP,
    TAG_OUTPUT, TAG_RESERVED, TAG_UNMAP, TAG_ZERO_STORE,
};

#[derive(Debug)]
pub enum MachineError {
    Memory(MemoryError),
    DivisionByZero,
    /// Load-program target index past the end of segment 0.
    JumpOutOfRange { target: u32, words: u32 },
    Io(io::Error),
    /// Code generation or executable-memory failure.
    JitNative(String),
    UnsupportedTarget,
}

impl fmt::Display for MachineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineError::Memory(err) => write!(f, "memory fault: {err}"),
            MachineError::DivisionByZero => write!(f, "division by zero"),
            MachineError::JumpOutOfRange { target, words } => {
                write!(f, "jump target {target} out of range for program of {words} words")
            }
            MachineError::Io(err) => write!(f, "i/o error: {err}"),
            MachineError::JitNative(msg) => write!(f, "native code generation failed: {msg}"),
            MachineError::UnsupportedTarget => {
                write!(f, "native execution is not supported on this target")
            }
        }
    }
}

impl Error for MachineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MachineError::Memory(err) => Some(err),
            MachineError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<MemoryError> for MachineError {
    fn from(err: MemoryError) -> Self {
        MachineError::Memory(err)
    }
}

pub type MachineResult<T> = Result<T, MachineError>;

pub struct Machine {
    // Fields reached from generated code by displacement; the layout is
    // taken with offset_of, so field order is free to change.
    regs: [u32; 8],
    saved_stack: u64,
    exit_code: u32,
    /// Non-zero after a fault; checked by the call trampoline.
    faulted: u8,

    allocator: SegmentAllocator,
    zero_code: Option<CompiledSegment>,
    zero_dirty: bool,
    exit_stub_addr: u64,
    fault: Option<MachineError>,
    input: Box<dyn Read>,
    output: Box<dyn Write>,
}

impl Machine {
    /// Machine wired to stdin/stdout.
    pub fn new(program: &[u32]) -> MachineResult<Self> {
        Self::with_io(
            program,
            Box::new(io::stdin()),
            Box::new(io::BufWriter::new(io::stdout())),
        )
    }

    pub fn with_io(
        program: &[u32],
        input: Box<dyn Read>,
        output: Box<dyn Write>,
    ) -> MachineResult<Self> {
        let mut allocator = SegmentAllocator::new()?;
        allocator.load_zero(program)?;
        Ok(Machine {
            regs: [0; 8],
            saved_stack: 0,
            exit_code: 0,
            faulted: 0,
            allocator,
            zero_code: None,
            zero_dirty: false,
            exit_stub_addr: 0,
            fault: None,
            input,
            output,
        })
    }

    /// Register file snapshot; written back by the exit stub, so it is
    /// current after `run` returns.
    pub fn regs(&self) -> [u32; 8] {
        self.regs
    }

    /// Compile segment 0 and execute from instruction 0 until the
    /// program halts or faults. Returns the exit status.
    pub fn run(&mut self) -> MachineResult<u32> {
        if !native_jit_supported() {
            return Err(MachineError::UnsupportedTarget);
        }
        self.faulted = 0;
        self.fault = None;
        self.exit_code = 0;
        self.zero_dirty = false;

        self.compile_zero()?;
        let stubs = RuntimeStubs::install(self as *mut Machine, self.allocator.base_ptr())?;
        self.exit_stub_addr = stubs.exit_addr();

        let entry = stubs.entry_fn();
        let start = match &self.zero_code {
            Some(seg) => seg.base_ptr(),
            None => return Err(MachineError::JitNative("program segment not compiled".into())),
        };

        tracing::debug!(words = self.allocator.zero_segment().len(), "entering generated code");
        let status = unsafe { entry(start, self as *mut Machine) };

        if let Err(err) = self.output.flush() {
            if self.fault.is_none() {
                self.fault = Some(MachineError::Io(err));
            }
        }
        match self.fault.take() {
            Some(err) => Err(err),
            None => Ok(status),
        }
    }

    fn compile_zero(&mut self) -> MachineResult<()> {
        let seg = CompiledSegment::compile(self.allocator.zero_segment())?;
        tracing::debug!(words = seg.words(), "compiled program segment");
        self.zero_code = Some(seg);
        Ok(())
    }

    /// Record a fault on a call-style dispatch. The returned value is
    /// the operation's (now meaningless) result; the call trampoline
    /// sees the flag and diverts to the exit stub before the slot can
    /// use it.
    fn call_fault(&mut self, err: MachineError) -> u64 {
        tracing::error!(%err, "machine fault");
        self.fault = Some(err);
        self.faulted = 1;
        self.exit_code = 1;
        0
    }

    /// Record a fault on a tail-style dispatch: control goes straight
    /// to the exit stub.
    fn tail_fault(&mut self, err: MachineError) -> u64 {
        tracing::error!(%err, "machine fault");
        self.fault = Some(err);
        self.faulted = 1;
        self.exit_code = 1;
        self.exit_stub_addr
    }

    fn dispatch(&mut self, tag: u32, x: u32, y: u32) -> u64 {
        match tag {
            TAG_MAP => self.op_map(x),
            TAG_UNMAP => self.op_unmap(x),
            TAG_OUTPUT => self.op_output(x),
            TAG_INPUT => self.op_input(),
            TAG_LOAD_PROGRAM => self.op_load_program(x, y),
            TAG_HALT => {
                self.exit_code = 0;
                self.exit_stub_addr
            }
            TAG_ZERO_STORE => {
                self.zero_dirty = true;
                0
            }
            TAG_DIV_ZERO => self.tail_fault(MachineError::DivisionByZero),
            TAG_RESERVED => {
                tracing::warn!("reserved instruction or end of segment reached; halting");
                self.exit_code = 0;
                self.exit_stub_addr
            }
            other => {
                self.tail_fault(MachineError::JitNative(format!("unknown dispatch tag {other}")))
            }
        }
    }

    fn op_map(&mut self, words: u32) -> u64 {
        let bytes = words as u64 * 4;
        if bytes > MAX_SEGMENT_BYTES as u64 {
            return self.call_fault(MemoryError::AllocationFault { bytes }.into());
        }
        match self.allocator.allocate(bytes as u32) {
            Ok(handle) => {
                tracing::trace!(handle, words, "mapped segment");
                handle as u64
            }
            Err(err) => self.call_fault(err.into()),
        }
    }

    fn op_unmap(&mut self, handle: u32) -> u64 {
        match self.allocator.free(handle) {
            Ok(()) => {
                tracing::trace!(handle, "unmapped segment");
                0
            }
            Err(err) => self.call_fault(err.into()),
        }
    }

    fn op_output(&mut self, value: u32) -> u64 {
        match self.output.write_all(&[(value & 0xFF) as u8]) {
            Ok(()) => 0,
            Err(err) => self.call_fault(MachineError::Io(err)),
        }
    }

    fn op_input(&mut self) -> u64 {
        // Anything already printed must be visible before blocking.
        if let Err(err) = self.output.flush() {
            return self.call_fault(MachineError::Io(err));
        }
        let mut byte = [0u8; 1];
        loop {
            match self.input.read(&mut byte) {
                Ok(0) => return u64::from(u32::MAX),
                Ok(_) => return u64::from(byte[0]),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return self.call_fault(MachineError::Io(err)),
            }
        }
    }

    fn op_load_program(&mut self, handle: u32, target: u32) -> u64 {
        if handle != 0 {
            if let Err(err) = self.allocator.duplicate_into_zero(handle) {
                return self.tail_fault(err.into());
            }
            if let Err(err) = self.compile_zero() {
                return self.tail_fault(err);
            }
            self.zero_dirty = false;
        } else if self.zero_dirty {
            tracing::debug!("program segment modified in place; recompiling");
            if let Err(err) = self.compile_zero() {
                return self.tail_fault(err);
            }
            self.zero_dirty = false;
        }

        let (words, addr) = match &self.zero_code {
            Some(seg) => (seg.words(), seg.slot_addr(target)),
            None => {
                return self
                    .tail_fault(MachineError::JitNative("program segment not compiled".into()));
            }
        };
        if target >= words {
            return self.tail_fault(MachineError::JumpOutOfRange { target, words });
        }
        addr
    }
}

/// Sole re-entry point from generated code into Rust. The trampolines
/// pass the context pointer the stubs were built with, so the reference
/// is always valid for the duration of the call.
extern "C" fn dispatch_bridge(tag: u32, x: u32, y: u32, machine: *mut Machine) -> u64 {
    let machine = unsafe { &mut *machine };
    machine.dispatch(tag, x, y)
}
