use super::bins::{BIN_SIZE, Bin, BinManager, DEFAULT_RESERVATION_SIZE};
use super::vm::VmError;
use crate::sync::{Mutex, OnceLock};
use std::ptr::NonNull;

const MIN_BLOCK_SHIFT: usize = 4; // (2^4) 16-byte blocks
const MAX_BLOCK_SHIFT: usize = 9; // (2^9) 512-byte blocks
const MIN_BLOCK_SIZE: usize = 1 << MIN_BLOCK_SHIFT;

/// Number of size classes served by the small path.
pub(crate) const CLASS_COUNT: usize = MAX_BLOCK_SHIFT - MIN_BLOCK_SHIFT + 1;

/// Largest request the small path serves. Anything bigger belongs to an
/// external larger-object path and is rejected here.
pub const MAX_SMALL_SIZE: usize = 1 << MAX_BLOCK_SHIFT;

/// Size-class index for a request: the smallest class whose blocks hold
/// `size` bytes. Requests up to the minimum block size share class 0.
#[inline]
pub(crate) fn class_for(size: usize) -> usize {
    debug_assert!(size <= MAX_SMALL_SIZE);
    let width = usize::BITS - (size.saturating_sub(1) | (MIN_BLOCK_SIZE - 1)).leading_zeros();
    width as usize - MIN_BLOCK_SHIFT
}

#[inline]
pub(crate) fn block_size_of(class: usize) -> usize {
    MIN_BLOCK_SIZE << class
}

#[inline]
pub(crate) fn blocks_per_bin(class: usize) -> usize {
    BIN_SIZE / block_size_of(class)
}

/// Linkage written over the first two words of a freed block.
///
/// Payload and linkage share the same memory: a block carries linkage only
/// while it sits on a free list, never while the caller holds it.
#[repr(C)]
struct FreeBlock {
    next: *mut FreeBlock,
    prev: *mut FreeBlock,
}

/// Head state for one size class.
///
/// The head acts as a sentinel owning only `first`; a block whose `prev` is
/// null is the first list element. Nothing ever reinterprets the head as a
/// block.
struct ClassList {
    /// First free block, or null.
    first: *mut FreeBlock,
    /// Bin currently being carved into fresh blocks, or null.
    last_bin: *mut Bin,
    /// Blocks carved out of `last_bin` so far.
    formatted: usize,
}

// Safety: the raw pointers are only dereferenced under the owning Mutex.
unsafe impl Send for ClassList {}

/// Configuration for [`SmallAllocator`]. Set at construction time.
#[derive(Clone, Debug)]
pub struct SmallAllocatorConfig {
    /// Address-space reservation backing the bin manager. Default: 64 GiB.
    /// Tests (and the loom/miri VM mock) use much smaller values.
    pub reservation_size: usize,
}

impl Default for SmallAllocatorConfig {
    fn default() -> Self {
        Self {
            reservation_size: DEFAULT_RESERVATION_SIZE,
        }
    }
}

/// Size-class segregated allocator for objects up to [`MAX_SMALL_SIZE`] bytes.
///
/// Each class keeps a doubly-linked free list of blocks plus the bin it is
/// currently carving. Freed blocks are reused LIFO; fresh blocks are carved
/// lazily off the current bin; a bin whose use count drops to zero is handed
/// back to the [`BinManager`] whole.
///
/// Lock order: a size-class lock is always acquired before the bin manager's
/// lock (taken inside `new_bin`/`return_bin`). `get_bin_for` takes no lock.
pub struct SmallAllocator {
    bins: BinManager,
    classes: [Mutex<ClassList>; CLASS_COUNT],
}

impl SmallAllocator {
    /// Create an allocator with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the address-space reservation fails.
    pub fn new() -> Result<Self, VmError> {
        Self::with_config(SmallAllocatorConfig::default())
    }

    /// Create an allocator with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the reservation size is invalid or the OS denies
    /// the reservation.
    pub fn with_config(config: SmallAllocatorConfig) -> Result<Self, VmError> {
        Ok(Self {
            bins: BinManager::new(config.reservation_size)?,
            classes: std::array::from_fn(|_| {
                Mutex::new(ClassList {
                    first: std::ptr::null_mut(),
                    last_bin: std::ptr::null_mut(),
                    formatted: 0,
                })
            }),
        })
    }

    /// The bin substrate backing this allocator.
    #[must_use]
    pub fn bin_manager(&self) -> &BinManager {
        &self.bins
    }

    /// Allocate `size` bytes from the small path.
    ///
    /// The block is aligned to its size class's natural alignment and its
    /// contents are undefined. Requests up to the minimum block size round up
    /// to class 0.
    ///
    /// # Errors
    ///
    /// `RequestTooLarge` for sizes above [`MAX_SMALL_SIZE`] (the caller is
    /// expected to route those to a larger-object path), or the bin manager's
    /// error when address space or physical memory is exhausted.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, VmError> {
        if size > MAX_SMALL_SIZE {
            return Err(VmError::RequestTooLarge {
                size,
                max: MAX_SMALL_SIZE,
            });
        }
        let class = class_for(size);
        let block_size = block_size_of(class);

        let mut list = self.classes[class]
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if !list.first.is_null() {
            // Reuse path: pop the most recently freed block.
            let block = list.first;
            // Safety: blocks on the free list carry valid linkage in their
            // first two words; the class lock serialises list access.
            unsafe {
                let next = (*block).next;
                list.first = next;
                if let Some(next) = NonNull::new(next) {
                    (*next.as_ptr()).prev = std::ptr::null_mut();
                }
            }

            // Free blocks always lie inside the reservation, in a bin whose
            // index page is live.
            let bin = match self.bins.get_bin_for(block.cast_const().cast()) {
                Some(bin) => bin,
                None => {
                    debug_assert!(false, "free block {block:p} has no owning bin");
                    // Safety: list membership guarantees an owning bin.
                    unsafe { std::hint::unreachable_unchecked() }
                }
            };
            // Safety: the bin is loaned to this class; its use count is
            // guarded by the class lock we hold.
            unsafe { (*bin.as_ptr()).used += 1 };

            // Safety: list blocks are non-null.
            return Ok(unsafe { NonNull::new_unchecked(block.cast::<u8>()) });
        }

        if !list.last_bin.is_null() && list.formatted < blocks_per_bin(class) {
            // Carve the next fresh block off the current bin.
            let bin = list.last_bin;
            // Safety: last_bin is loaned to this class; its fields are
            // guarded by the class lock.
            let block = unsafe {
                let block = (*bin).memory.add(list.formatted * block_size);
                (*bin).used += 1;
                block
            };
            list.formatted += 1;
            // Safety: tile addresses are non-null.
            return Ok(unsafe { NonNull::new_unchecked(block) });
        }

        // Current bin exhausted (or none yet): take a fresh one. The bin
        // manager's lock nests inside the class lock held here.
        let bin = self.bins.new_bin()?;
        // Safety: a fresh bin is exclusively ours until it is published via
        // last_bin below.
        let block = unsafe {
            (*bin.as_ptr()).class = class;
            (*bin.as_ptr()).used = 1;
            (*bin.as_ptr()).memory
        };
        list.last_bin = bin.as_ptr();
        list.formatted = 1;
        // Safety: the committed tile base is non-null.
        Ok(unsafe { NonNull::new_unchecked(block) })
    }

    /// Return a block to its size class's free list.
    ///
    /// Null pointers and pointers outside the reservation are ignored, so the
    /// caller may pass anything it could legally pass to C `free`. When the
    /// owning bin's use count reaches zero the bin is scrubbed from the free
    /// list and handed back to the bin manager whole.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, outside this allocator's reservation, or a value
    /// previously returned by [`alloc`](Self::alloc) that has not been freed
    /// since.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let Some(bin) = self.bins.get_bin_for(ptr) else {
            return; // not ours
        };

        // The class is stable while the caller holds a live block from this
        // bin (the bin cannot be recycled with used > 0), so reading it
        // before taking the class lock is sound.
        // Safety: bin records live as long as the manager.
        let class = unsafe { (*bin.as_ptr()).class };

        let mut list = self.classes[class]
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let block = ptr.cast::<FreeBlock>();
        // Push at the front, repairing both directions.
        // Safety: the caller hands the block back; its first two words
        // become linkage now.
        unsafe {
            (*block).next = list.first;
            (*block).prev = std::ptr::null_mut();
            if let Some(old) = NonNull::new(list.first) {
                (*old.as_ptr()).prev = block;
            }
        }
        list.first = block;

        // Safety: the use count is guarded by the class lock.
        let used = unsafe {
            debug_assert!((*bin.as_ptr()).used > 0, "free with no live blocks");
            (*bin.as_ptr()).used -= 1;
            (*bin.as_ptr()).used
        };

        if used == 0 {
            // Bin is empty: vacate the fresh-carve role if it held it, scrub
            // the free list of every block in the tile, hand the bin back.
            let carved = if std::ptr::eq(list.last_bin, bin.as_ptr()) {
                let carved = list.formatted;
                list.last_bin = std::ptr::null_mut();
                list.formatted = 0;
                carved
            } else {
                blocks_per_bin(class)
            };
            // Safety: with used == 0 every carved block of this bin is on
            // the class free list we locked.
            unsafe { clean_bin(&mut list, bin, carved, block_size_of(class)) };
            // A failed reset leaves the bin loaned nowhere; nothing to
            // unwind (see error design in vm.rs).
            drop(self.bins.return_bin(bin));
        }
    }

    #[cfg(test)]
    pub(crate) fn class_free_len(&self, class: usize) -> usize {
        let list = self.classes[class]
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut len = 0;
        let mut prev: *mut FreeBlock = std::ptr::null_mut();
        let mut cur = list.first;
        while !cur.is_null() {
            // Safety: list nodes carry valid linkage under the class lock.
            unsafe {
                assert_eq!((*cur).prev, prev, "free list backlink broken");
                prev = cur;
                cur = (*cur).next;
            }
            len += 1;
            assert!(
                len <= blocks_per_bin(class) * 1024,
                "free list does not terminate"
            );
        }
        len
    }

    #[cfg(test)]
    pub(crate) fn class_carve_state(&self, class: usize) -> (bool, usize) {
        let list = self.classes[class]
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        (!list.last_bin.is_null(), list.formatted)
    }
}

/// Unlink every block of the bin's tile from the class free list.
///
/// Called with the bin empty: exactly the first `carved` blocks of the tile
/// exist as blocks, and every one of them is a list member. Afterwards no
/// free-list pointer refers into the tile.
///
/// # Safety
///
/// The caller holds the class lock, owns the bin, and guarantees
/// `(*bin).used == 0`.
unsafe fn clean_bin(list: &mut ClassList, bin: NonNull<Bin>, carved: usize, block_size: usize) {
    // Safety: the record outlives the call; memory is the committed tile.
    let memory = unsafe { (*bin.as_ptr()).memory };
    for i in 0..carved {
        // Safety: carved blocks lie within the tile.
        let block = unsafe { memory.add(i * block_size) }.cast::<FreeBlock>();
        // Safety: each carved block is a live list node until unlinked here.
        unsafe {
            let next = (*block).next;
            let prev = (*block).prev;
            if !next.is_null() {
                (*next).prev = prev;
            }
            if prev.is_null() {
                list.first = next;
            } else {
                (*prev).next = next;
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Process-wide front
// ----------------------------------------------------------------------------

static GLOBAL_SMALL_INSTANCE: OnceLock<Result<SmallAllocator, VmError>> = OnceLock::new();

/// Process-wide allocator front for the `malloc`/`free`-style shims.
///
/// The backing [`SmallAllocator`] is created lazily on first use so the
/// allocator is usable before general program initialisation completes. Its
/// reservation lives for the rest of the process; the OS reclaims it at
/// teardown (statics are never dropped).
pub struct GlobalSmallAllocator;

impl GlobalSmallAllocator {
    fn instance() -> Option<&'static SmallAllocator> {
        GLOBAL_SMALL_INSTANCE
            .get_or_init(SmallAllocator::new)
            .as_ref()
            .ok()
    }

    /// Allocate `size` bytes from the process-wide small path.
    ///
    /// Returns `None` for sizes above [`MAX_SMALL_SIZE`] (the shim routes
    /// those elsewhere), on OS exhaustion, or if the global reservation could
    /// not be created.
    #[must_use]
    pub fn allocate_bytes(size: usize) -> Option<NonNull<u8>> {
        Self::instance()?.alloc(size).ok()
    }

    /// Return a block to the process-wide allocator. Null pointers and
    /// pointers outside the reservation are no-ops.
    ///
    /// # Safety
    ///
    /// Same contract as [`SmallAllocator::free`].
    pub unsafe fn free_bytes(ptr: *mut u8) {
        if let Some(allocator) = Self::instance() {
            // Safety: forwarded caller contract.
            unsafe { allocator.free(ptr) };
        }
    }
}
