//! A JIT runtime for a 32-bit segmented bytecode machine.
//!
//! Programs are streams of big-endian 32-bit instruction words operating
//! on eight registers and a set of dynamically mapped word-array
//! segments. Each instruction is translated into one fixed-size slot of
//! native code, so jump targets are plain address arithmetic; segments
//! live inside a single reserved arena, so memory addressing is too.

pub mod decode;
pub mod loader;
pub mod machine;
pub mod memory;

pub use decode::{Instr, decode, encode_imm, encode_op};
pub use loader::{ImageError, load_image, words_from_bytes};
pub use machine::{Machine, MachineError, MachineResult, native_jit_supported};
pub use memory::{MemoryError, SegmentAllocator};
