//! Segmented memory built on one large reserved arena.
//!
//! The whole 32-bit segment address space lives inside a single 4 GiB
//! anonymous mapping. A segment handle is the byte offset of its payload
//! within the arena, so resolving a handle is pure address arithmetic and
//! generated code can reach `arena_base + handle + 4*index` without any
//! table lookup.
//!
//! Layout:
//!
//! - `[0, 2^24 - 8)` is the reserved capacity of segment 0 (the program
//!   segment). Handle 0 is therefore always valid and never recycled.
//! - Fresh segments are bump-allocated from `2^24` upward in 32-byte
//!   blocks. Each carries an 8-byte header directly before the payload:
//!   `[capacity: u32, requested: u32]`, capacity = blocks*32 - 8.
//! - Freed handles go onto a per-size-class LIFO stack and are handed
//!   back, re-zeroed, to the next allocation of the same class.
//!
//! The mapping uses `MAP_NORESERVE`, so untouched pages cost nothing;
//! programs only pay for the segments they actually write.

use std::error::Error;
use std::fmt;
use std::ptr;
use std::slice;

#[cfg(not(target_pointer_width = "64"))]
compile_error!("the segmented arena reserves 4 GiB and requires a 64-bit host");

/// Full 32-bit segment address space.
const ARENA_BYTES: u64 = 1 << 32;
/// Allocation granularity of the bump region.
const BLOCK_BYTES: u32 = 32;
/// Header preceding every bump-allocated payload.
const HEADER_BYTES: u32 = 8;
/// First byte of the bump region; everything below belongs to segment 0.
const FIRST_BLOCK: u32 = 1 << 24;
/// Reserved capacity of segment 0, and the per-segment size cap.
pub const MAX_SEGMENT_BYTES: u32 = FIRST_BLOCK - HEADER_BYTES;

#[derive(Debug)]
pub enum MemoryError {
    /// The arena itself could not be reserved.
    ArenaInit(i32),
    /// Request exceeds the per-segment cap or the arena is exhausted.
    AllocationFault { bytes: u64 },
    /// Handle does not name a live bump-allocated segment.
    BadHandle { handle: u32 },
    /// Word index past the end of a segment.
    OutOfRange { handle: u32, index: u32, words: u32 },
    /// Program does not fit in segment 0's reserved capacity.
    ProgramTooLarge { words: usize },
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::ArenaInit(errno) => {
                write!(f, "failed to reserve the segment arena (errno {errno})")
            }
            MemoryError::AllocationFault { bytes } => {
                write!(f, "cannot allocate segment of {bytes} bytes")
            }
            MemoryError::BadHandle { handle } => {
                write!(f, "invalid segment handle {handle:#x}")
            }
            MemoryError::OutOfRange { handle, index, words } => {
                write!(
                    f,
                    "word index {index} out of range for segment {handle:#x} of {words} words"
                )
            }
            MemoryError::ProgramTooLarge { words } => {
                write!(f, "program of {words} words exceeds the program segment capacity")
            }
        }
    }
}

impl Error for MemoryError {}

/// Size class for a payload of `bytes` bytes: the number of 32-byte
/// blocks covering payload plus header. 24 bytes still fit class 1;
/// 25 bytes need class 2.
fn size_class(bytes: u32) -> u32 {
    (bytes + HEADER_BYTES + BLOCK_BYTES - 1) / BLOCK_BYTES
}

pub struct SegmentAllocator {
    base: *mut u8,
    /// Next unallocated byte of the bump region, always block-aligned.
    /// u64 because it legitimately reaches 2^32 when the arena fills.
    high_water: u64,
    /// LIFO stacks of freed handles, indexed by size class.
    recycler: Vec<Vec<u32>>,
    /// Length of segment 0 in words.
    zero_words: u32,
}

impl SegmentAllocator {
    /// Reserve the arena. Pages are not committed until touched.
    pub fn new() -> Result<Self, MemoryError> {
        #[cfg(target_os = "linux")]
        let extra = libc::MAP_NORESERVE;
        #[cfg(not(target_os = "linux"))]
        let extra = 0;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                ARENA_BYTES as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(MemoryError::ArenaInit(errno));
        }

        Ok(SegmentAllocator {
            base: base as *mut u8,
            high_water: FIRST_BLOCK as u64,
            recycler: Vec::new(),
            zero_words: 0,
        })
    }

    /// Base address of the arena, handed to the emitter as its one and
    /// only memory constant.
    pub fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    fn payload_ptr(&self, handle: u32) -> *mut u8 {
        // Handle arithmetic stays within the 4 GiB reservation for any
        // u32, so the add itself cannot leave the mapping.
        unsafe { self.base.add(handle as usize) }
    }

    fn header_capacity(&self, handle: u32) -> u32 {
        unsafe { (self.payload_ptr(handle - HEADER_BYTES) as *const u32).read() }
    }

    fn header_requested(&self, handle: u32) -> u32 {
        unsafe { (self.payload_ptr(handle - 4) as *const u32).read() }
    }

    fn write_header(&mut self, handle: u32, capacity: u32, requested: u32) {
        unsafe {
            (self.payload_ptr(handle - HEADER_BYTES) as *mut u32).write(capacity);
            (self.payload_ptr(handle - 4) as *mut u32).write(requested);
        }
    }

    /// True when `handle` lies inside the bump region at a position a
    /// header could occupy. Cheap plausibility check, not a liveness
    /// proof; freeing a handle twice is undefined, as documented.
    fn plausible_handle(&self, handle: u32) -> bool {
        handle >= FIRST_BLOCK + HEADER_BYTES
            && (handle as u64) < self.high_water
            && (handle - HEADER_BYTES) % BLOCK_BYTES == 0
    }

    /// Allocate a zero-filled segment of `bytes` bytes and return its
    /// handle. Recycled handles are reused LIFO within their exact size
    /// class; otherwise the high-water mark advances.
    pub fn allocate(&mut self, bytes: u32) -> Result<u32, MemoryError> {
        if bytes > MAX_SEGMENT_BYTES {
            return Err(MemoryError::AllocationFault { bytes: bytes as u64 });
        }
        let class = size_class(bytes);

        if let Some(handle) = self
            .recycler
            .get_mut(class as usize)
            .and_then(|stack| stack.pop())
        {
            let capacity = self.header_capacity(handle);
            self.write_header(handle, capacity, bytes);
            unsafe { ptr::write_bytes(self.payload_ptr(handle), 0, bytes as usize) };
            return Ok(handle);
        }

        let span = (class as u64) * (BLOCK_BYTES as u64);
        if self.high_water + span > ARENA_BYTES {
            return Err(MemoryError::AllocationFault { bytes: bytes as u64 });
        }
        let handle = self.high_water as u32 + HEADER_BYTES;
        self.high_water += span;
        // Fresh pages come back zeroed from the kernel; only the header
        // needs writing.
        self.write_header(handle, span as u32 - HEADER_BYTES, bytes);
        Ok(handle)
    }

    /// Release a segment. O(1): pushes the handle onto its class stack.
    pub fn free(&mut self, handle: u32) -> Result<(), MemoryError> {
        if !self.plausible_handle(handle) {
            return Err(MemoryError::BadHandle { handle });
        }
        let capacity = self.header_capacity(handle);
        let class = ((capacity + HEADER_BYTES) / BLOCK_BYTES) as usize;
        if self.recycler.len() <= class {
            self.recycler.resize_with(class + 1, Vec::new);
        }
        self.recycler[class].push(handle);
        Ok(())
    }

    /// Size of a segment in words.
    pub fn seg_words(&self, handle: u32) -> Result<u32, MemoryError> {
        if handle == 0 {
            return Ok(self.zero_words);
        }
        if !self.plausible_handle(handle) {
            return Err(MemoryError::BadHandle { handle });
        }
        Ok(self.header_requested(handle) / 4)
    }

    /// Bounds-checked word read.
    pub fn read(&self, handle: u32, index: u32) -> Result<u32, MemoryError> {
        let words = self.seg_words(handle)?;
        if index >= words {
            return Err(MemoryError::OutOfRange { handle, index, words });
        }
        Ok(unsafe { (self.payload_ptr(handle) as *const u32).add(index as usize).read() })
    }

    /// Bounds-checked word write.
    pub fn write(&mut self, handle: u32, index: u32, value: u32) -> Result<(), MemoryError> {
        let words = self.seg_words(handle)?;
        if index >= words {
            return Err(MemoryError::OutOfRange { handle, index, words });
        }
        unsafe { (self.payload_ptr(handle) as *mut u32).add(index as usize).write(value) };
        Ok(())
    }

    /// Install a program image as segment 0.
    pub fn load_zero(&mut self, words: &[u32]) -> Result<(), MemoryError> {
        let bytes = words.len().checked_mul(4).unwrap_or(usize::MAX);
        if bytes > MAX_SEGMENT_BYTES as usize {
            return Err(MemoryError::ProgramTooLarge { words: words.len() });
        }
        unsafe {
            ptr::copy_nonoverlapping(words.as_ptr(), self.base as *mut u32, words.len());
        }
        self.zero_words = words.len() as u32;
        Ok(())
    }

    /// Replace segment 0 with a copy of `handle`'s contents. A handle of
    /// zero leaves segment 0 untouched. Returns the new word count.
    pub fn duplicate_into_zero(&mut self, handle: u32) -> Result<u32, MemoryError> {
        if handle == 0 {
            return Ok(self.zero_words);
        }
        if !self.plausible_handle(handle) {
            return Err(MemoryError::BadHandle { handle });
        }
        let requested = self.header_requested(handle);
        // Segment capacity never exceeds segment 0's reserved region, so
        // the copy always fits. Source and destination are disjoint: the
        // source lives above FIRST_BLOCK.
        unsafe {
            ptr::copy_nonoverlapping(
                self.payload_ptr(handle),
                self.base,
                requested as usize,
            );
        }
        self.zero_words = requested / 4;
        Ok(self.zero_words)
    }

    /// Current contents of segment 0.
    pub fn zero_segment(&self) -> &[u32] {
        unsafe { slice::from_raw_parts(self.base as *const u32, self.zero_words as usize) }
    }

    /// Payload capacity in bytes recorded in a segment's header.
    pub fn capacity(&self, handle: u32) -> Result<u32, MemoryError> {
        if handle == 0 {
            return Ok(MAX_SEGMENT_BYTES);
        }
        if !self.plausible_handle(handle) {
            return Err(MemoryError::BadHandle { handle });
        }
        Ok(self.header_capacity(handle))
    }
}

impl Drop for SegmentAllocator {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, ARENA_BYTES as usize);
        }
    }
}

// The allocator owns its mapping exclusively; raw pointers are the only
// reason Send is not derived.
unsafe impl Send for SegmentAllocator {}
