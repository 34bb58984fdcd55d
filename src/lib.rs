#[cfg(not(target_pointer_width = "64"))]
compile_error!("tilealloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// bin substrate
pub use memory::bins::{BIN_SIZE, Bin, BinManager};

// small-object allocator
pub use memory::small::{
    GlobalSmallAllocator, MAX_SMALL_SIZE, SmallAllocator, SmallAllocatorConfig,
};

// errors
pub use memory::vm::VmError;
