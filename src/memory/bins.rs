use super::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::Mutex;
use crate::sync::atomic::{AtomicPtr, Ordering};
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

/// Size of one bin tile. Every bin covers exactly this much of the
/// reservation, and the reservation is carved at this granularity.
pub const BIN_SIZE: usize = 64 * 1024;

/// Default address-space reservation: 64 GiB, carved on demand.
/// Reserving is cheap — no physical memory is touched until a bin commits.
pub(crate) const DEFAULT_RESERVATION_SIZE: usize = 64 * 1024 * 1024 * 1024;

/// Index pages are one bin-sized OS allocation each.
const INDEX_PAGE_SIZE: usize = BIN_SIZE;

/// Bin records per index page.
const BINS_PER_INDEX_PAGE: usize = INDEX_PAGE_SIZE / std::mem::size_of::<Bin>();

/// Free-list terminator for `Bin::next_free`.
pub(crate) const INVALID_BIN: usize = usize::MAX;

/// Metadata for one 64 KiB tile of the reservation.
///
/// A bin is in exactly one of two states: loaned to a size class (holding
/// `used` live blocks; `next_free` meaningless) or sitting on the manager's
/// free list (`used == 0`, tile reset, `next_free` linking the list).
/// `class` is stamped by the size class when the bin is loaned out and is
/// undefined while the bin is on the free list.
#[repr(C)]
pub struct Bin {
    pub(crate) memory: *mut u8,
    pub(crate) class: usize,
    pub(crate) used: usize,
    pub(crate) next_free: usize,
}

// Keep the record size a power of two so a whole number of records fills an
// index page and `BINS_PER_INDEX_PAGE` divides evenly.
const _: () = assert!(std::mem::size_of::<Bin>() == 32);
const _: () = assert!(INDEX_PAGE_SIZE % std::mem::size_of::<Bin>() == 0);

impl Bin {
    /// Base address of the bin's tile.
    #[must_use]
    pub fn memory(&self) -> *mut u8 {
        self.memory
    }

    /// Size-class index stamped when the bin was loaned out.
    /// Undefined while the bin is on the manager's free list.
    #[must_use]
    pub fn class(&self) -> usize {
        self.class
    }

    /// Number of live blocks drawn from this bin.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }
}

/// Mutable bookkeeping behind the manager's mutex.
struct BinDirectory {
    /// Bins handed out so far on the fresh-allocation path. The next fresh
    /// bin always takes index `in_use`.
    in_use: usize,
    /// Head of the free list of returned (reset) bins, or `INVALID_BIN`.
    free_head: usize,
    /// Which bin indices currently sit on the free list. Guards against a
    /// bin being returned twice or recycled while still loaned out.
    #[cfg(debug_assertions)]
    free_slots: FixedBitSet,
}

/// Owner of the global reservation and of every bin carved from it.
///
/// The reservation is contiguous and bin-aligned from its base, so mapping a
/// payload pointer back to its bin is pure address arithmetic — no hash table,
/// no search. Bin records live in separate lazily-created index pages; a slot
/// in `index_pages`, once published, is never unpublished, which lets
/// [`get_bin_for`](BinManager::get_bin_for) run without the lock.
pub struct BinManager {
    base: NonNull<u8>,
    reservation_size: usize,
    bin_count: usize,
    /// One slot per possible index page. Written under the mutex with a
    /// release store; read anywhere with an acquire load.
    index_pages: Vec<AtomicPtr<Bin>>,
    state: Mutex<BinDirectory>,
}

// Safety: the raw base pointer and the bin records are only mutated under the
// internal mutex; lock-free readers (`get_bin_for`) see index pages via
// acquire loads and never read record fields.
unsafe impl Send for BinManager {}
// Safety: see Send — all shared mutation is serialised by the mutex.
unsafe impl Sync for BinManager {}

impl BinManager {
    /// Reserve `reservation_size` bytes of address space and set up an empty
    /// directory. No physical memory is committed yet.
    ///
    /// # Errors
    ///
    /// Returns `VmError::InitializationFailed` if the size is zero or not a
    /// multiple of [`BIN_SIZE`], or `VmError::ReservationFailed` if the OS
    /// denies the reservation.
    pub fn new(reservation_size: usize) -> Result<Self, VmError> {
        if reservation_size == 0 || !reservation_size.is_multiple_of(BIN_SIZE) {
            return Err(VmError::InitializationFailed(format!(
                "reservation size {reservation_size} is not a non-zero multiple of {BIN_SIZE}"
            )));
        }

        let bin_count = reservation_size / BIN_SIZE;
        let index_page_count = bin_count.div_ceil(BINS_PER_INDEX_PAGE);

        // Safety: FFI call to reserve memory.
        let base = unsafe { PlatformVmOps::reserve(reservation_size)? };

        let mut index_pages = Vec::with_capacity(index_page_count);
        for _ in 0..index_page_count {
            index_pages.push(AtomicPtr::new(std::ptr::null_mut()));
        }

        Ok(Self {
            base,
            reservation_size,
            bin_count,
            index_pages,
            state: Mutex::new(BinDirectory {
                in_use: 0,
                free_head: INVALID_BIN,
                #[cfg(debug_assertions)]
                free_slots: FixedBitSet::with_capacity(bin_count),
            }),
        })
    }

    /// Hand out a bin backed by `BIN_SIZE` bytes of writable memory.
    ///
    /// Prefers recycling a returned bin (restoring its reset tile) over
    /// committing a fresh tile. The returned bin has `used == 0`; its `class`
    /// is undefined and must be stamped by the caller.
    ///
    /// # Errors
    ///
    /// `ReservationFailed` once all tiles of the reservation are handed out,
    /// or the commit/reset-undo error if the OS denies physical backing. On
    /// error no directory state changes: a failed fresh commit is retried at
    /// the same index by a later call, and a failed reset-undo leaves the bin
    /// on the free list.
    pub fn new_bin(&self) -> Result<NonNull<Bin>, VmError> {
        let mut dir = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if dir.free_head != INVALID_BIN {
            // Recycle path: pop the most recently returned bin.
            let index = dir.free_head;
            let bin = self.known_bin_record(index);
            // Safety: record fields are guarded by the directory mutex while
            // the bin is on the free list.
            let record = unsafe { &mut *bin.as_ptr() };

            // Safety: the tile was reset by return_bin and lies within the
            // reservation.
            unsafe {
                PlatformVmOps::reset_undo(NonNull::new_unchecked(record.memory), BIN_SIZE)?;
            }

            dir.free_head = record.next_free;
            record.next_free = INVALID_BIN;
            #[cfg(debug_assertions)]
            dir.free_slots.set(index, false);

            Ok(bin)
        } else {
            // Fresh path: carve the next tile off the reservation.
            let index = dir.in_use;
            if index >= self.bin_count {
                return Err(VmError::ReservationFailed(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    "bin reservation exhausted",
                )));
            }

            let page = index / BINS_PER_INDEX_PAGE;
            let pos = index % BINS_PER_INDEX_PAGE;

            let mut records = self.index_pages[page].load(Ordering::Acquire);
            if records.is_null() {
                // Safety: FFI call to allocate an index page.
                records = unsafe { PlatformVmOps::reserve_commit(INDEX_PAGE_SIZE)? }
                    .as_ptr()
                    .cast::<Bin>();
                // Publish only after the page is fully mapped; get_bin_for
                // reads this slot without the lock.
                self.index_pages[page].store(records, Ordering::Release);
            }

            // Safety: pos < BINS_PER_INDEX_PAGE keeps the record inside the
            // committed index page.
            let bin = unsafe { NonNull::new_unchecked(records.add(pos)) };
            // Safety: index < bin_count keeps the tile inside the reservation.
            let memory = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index * BIN_SIZE)) };

            // Safety: FFI call to commit the tile.
            unsafe { PlatformVmOps::commit(memory, BIN_SIZE)? };

            // Safety: the record slot is committed; any previous contents are
            // dead (zero on a fresh page, a stale record on a commit retry).
            unsafe {
                bin.as_ptr().write(Bin {
                    memory: memory.as_ptr(),
                    class: 0,
                    used: 0,
                    next_free: INVALID_BIN,
                });
            }

            dir.in_use = index + 1;
            Ok(bin)
        }
    }

    /// Take back an empty bin: reset its tile and push the slot onto the
    /// free list for cheap recycling.
    ///
    /// The caller attests `used == 0` and gives up ownership on success.
    ///
    /// # Errors
    ///
    /// The reset error if the OS denies it; the bin is then neither on the
    /// free list nor loaned out (its tile stays committed).
    pub fn return_bin(&self, bin: NonNull<Bin>) -> Result<(), VmError> {
        let mut dir = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // Safety: the caller owns the bin and no size class holds blocks in
        // it any more (used == 0).
        let record = unsafe { &mut *bin.as_ptr() };
        debug_assert_eq!(record.used, 0, "return_bin on a bin with live blocks");

        let index = (record.memory as usize - self.base.as_ptr() as usize) / BIN_SIZE;
        #[cfg(debug_assertions)]
        assert!(
            !dir.free_slots.contains(index),
            "bin {index} returned twice"
        );

        // Safety: the tile is committed and lies within the reservation.
        unsafe {
            PlatformVmOps::reset(NonNull::new_unchecked(record.memory), BIN_SIZE)?;
        }

        record.next_free = dir.free_head;
        dir.free_head = index;
        #[cfg(debug_assertions)]
        dir.free_slots.insert(index);

        Ok(())
    }

    /// Map any address to the bin whose tile contains it.
    ///
    /// Returns `None` for addresses outside the reservation and for tiles
    /// whose index page was never created — so this is safe to call on
    /// foreign pointers. Lock-free: reads only the immutable base and the
    /// published index-page slots.
    #[must_use]
    pub fn get_bin_for(&self, ptr: *const u8) -> Option<NonNull<Bin>> {
        let offset = (ptr as usize).checked_sub(self.base.as_ptr() as usize)?;
        if offset >= self.reservation_size {
            return None;
        }
        self.bin_record(offset / BIN_SIZE)
    }

    fn bin_record(&self, index: usize) -> Option<NonNull<Bin>> {
        let slot = self.index_pages.get(index / BINS_PER_INDEX_PAGE)?;
        let records = slot.load(Ordering::Acquire);
        if records.is_null() {
            return None;
        }
        // Safety: the page covers BINS_PER_INDEX_PAGE records and the
        // remainder is below that.
        Some(unsafe { NonNull::new_unchecked(records.add(index % BINS_PER_INDEX_PAGE)) })
    }

    /// Record lookup for an index known to have a live page (free-list
    /// members, freshly initialised bins).
    fn known_bin_record(&self, index: usize) -> NonNull<Bin> {
        match self.bin_record(index) {
            Some(bin) => bin,
            None => {
                debug_assert!(false, "bin {index} has no index page");
                // Safety: callers only pass indices whose page is published.
                unsafe { std::hint::unreachable_unchecked() }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn reservation_base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[cfg(test)]
    pub(crate) fn bins_in_use(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .in_use
    }

    #[cfg(test)]
    pub(crate) fn free_list_len(&self) -> usize {
        let dir = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut len = 0;
        let mut index = dir.free_head;
        while index != INVALID_BIN {
            len += 1;
            // Safety: free-list members always have a live index page; their
            // next_free field is guarded by the directory mutex we hold.
            index = unsafe { (*self.known_bin_record(index).as_ptr()).next_free };
        }
        len
    }
}

impl Drop for BinManager {
    fn drop(&mut self) {
        // Teardown: OS failures are ignored.
        for slot in &self.index_pages {
            if let Some(records) = NonNull::new(slot.load(Ordering::Acquire)) {
                // Safety: the page came from reserve_commit with this size.
                unsafe {
                    drop(PlatformVmOps::release(records.cast::<u8>(), INDEX_PAGE_SIZE));
                }
            }
        }
        // Safety: base came from reserve with this size.
        unsafe {
            drop(PlatformVmOps::release(self.base, self.reservation_size));
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn manager() -> BinManager {
        BinManager::new(64 * BIN_SIZE).unwrap()
    }

    #[test]
    fn test_new_bin_basic() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mgr = manager();

        let bin = mgr.new_bin().unwrap();
        // Safety: Test code.
        let record = unsafe { bin.as_ref() };
        assert_eq!(record.used(), 0);
        assert!(!record.memory().is_null());

        // The tile is bin-aligned within the reservation.
        let offset = record.memory() as usize - mgr.reservation_base() as usize;
        assert_eq!(offset % BIN_SIZE, 0);

        // The whole tile is writable.
        // Safety: Test code.
        unsafe {
            record.memory().write(0xAB);
            record.memory().add(BIN_SIZE - 1).write(0xCD);
            assert_eq!(record.memory().read(), 0xAB);
            assert_eq!(record.memory().add(BIN_SIZE - 1).read(), 0xCD);
        }
    }

    #[test]
    fn test_new_bin_distinct_tiles() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mgr = manager();

        let a = mgr.new_bin().unwrap();
        let b = mgr.new_bin().unwrap();
        // Safety: Test code.
        let (mem_a, mem_b) = unsafe { (a.as_ref().memory(), b.as_ref().memory()) };

        assert_eq!(mem_a, mgr.reservation_base());
        assert_eq!(mem_b as usize - mem_a as usize, BIN_SIZE);
        assert_eq!(mgr.bins_in_use(), 2);
    }

    #[test]
    fn test_get_bin_for_interior_pointers() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mgr = manager();

        let a = mgr.new_bin().unwrap();
        let b = mgr.new_bin().unwrap();
        // Safety: Test code.
        let mem_a = unsafe { a.as_ref().memory() };

        // First byte, interior byte, last byte — all resolve to bin A.
        for offset in [0, 1, 4096, BIN_SIZE - 1] {
            // Safety: Test code.
            let found = mgr.get_bin_for(unsafe { mem_a.add(offset) }).unwrap();
            assert_eq!(found.as_ptr(), a.as_ptr(), "offset {offset}");
        }

        // One past the tile is the next bin.
        // Safety: Test code.
        let found = mgr.get_bin_for(unsafe { mem_a.add(BIN_SIZE) }).unwrap();
        assert_eq!(found.as_ptr(), b.as_ptr());
    }

    #[test]
    fn test_get_bin_for_foreign_pointers() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mgr = manager();
        let _bin = mgr.new_bin().unwrap();

        assert!(mgr.get_bin_for(std::ptr::null()).is_none());

        let local = 0u64;
        assert!(mgr.get_bin_for(std::ptr::from_ref(&local).cast()).is_none());

        let heap = Box::new([0u8; 64]);
        assert!(mgr.get_bin_for(heap.as_ptr()).is_none());
    }

    #[test]
    fn test_get_bin_for_before_first_index_page() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mgr = manager();

        // No bin has been created, so no index page exists yet; even an
        // address inside the reservation has no bin.
        assert!(mgr.get_bin_for(mgr.reservation_base()).is_none());
    }

    #[test]
    fn test_return_and_recycle() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mgr = manager();

        let bin = mgr.new_bin().unwrap();
        // Safety: Test code.
        let mem = unsafe { bin.as_ref().memory() };

        mgr.return_bin(bin).unwrap();
        assert_eq!(mgr.free_list_len(), 1);

        // The recycled bin reuses the same slot and tile; no fresh index
        // advance happens.
        let again = mgr.new_bin().unwrap();
        assert_eq!(again.as_ptr(), bin.as_ptr());
        // Safety: Test code.
        assert_eq!(unsafe { again.as_ref().memory() }, mem);
        assert_eq!(mgr.free_list_len(), 0);
        assert_eq!(mgr.bins_in_use(), 1);

        // The tile is writable again after the reset/reset-undo cycle.
        // Safety: Test code.
        unsafe {
            mem.write(0x77);
            assert_eq!(mem.read(), 0x77);
        }
    }

    #[test]
    fn test_free_list_is_lifo() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mgr = manager();

        let a = mgr.new_bin().unwrap();
        let b = mgr.new_bin().unwrap();
        let c = mgr.new_bin().unwrap();

        mgr.return_bin(a).unwrap();
        mgr.return_bin(b).unwrap();
        mgr.return_bin(c).unwrap();
        assert_eq!(mgr.free_list_len(), 3);

        assert_eq!(mgr.new_bin().unwrap().as_ptr(), c.as_ptr());
        assert_eq!(mgr.new_bin().unwrap().as_ptr(), b.as_ptr());
        assert_eq!(mgr.new_bin().unwrap().as_ptr(), a.as_ptr());
    }

    #[test]
    fn test_reservation_exhaustion() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mgr = BinManager::new(2 * BIN_SIZE).unwrap();

        let a = mgr.new_bin().unwrap();
        let _b = mgr.new_bin().unwrap();

        // All tiles handed out: the next request fails but corrupts nothing.
        assert!(mgr.new_bin().is_err());
        assert_eq!(mgr.bins_in_use(), 2);

        // Returning a bin makes allocation possible again via recycling.
        mgr.return_bin(a).unwrap();
        let again = mgr.new_bin().unwrap();
        assert_eq!(again.as_ptr(), a.as_ptr());
    }

    #[cfg(not(miri))]
    #[test]
    fn test_index_page_boundary() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        // One index page holds BINS_PER_INDEX_PAGE records; bin number
        // BINS_PER_INDEX_PAGE must land on a second, lazily created page.
        let count = BINS_PER_INDEX_PAGE + 1;
        let mgr = BinManager::new(count * BIN_SIZE).unwrap();

        let mut last = None;
        for _ in 0..count {
            last = Some(mgr.new_bin().unwrap());
        }
        let last = last.unwrap();
        // Safety: Test code.
        let mem = unsafe { last.as_ref().memory() };
        assert_eq!(
            mem as usize - mgr.reservation_base() as usize,
            BINS_PER_INDEX_PAGE * BIN_SIZE
        );

        // Lookup across the page boundary still resolves.
        let found = mgr.get_bin_for(mem).unwrap();
        assert_eq!(found.as_ptr(), last.as_ptr());
    }

    #[test]
    fn test_invalid_reservation_size() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        assert!(BinManager::new(0).is_err());
        assert!(BinManager::new(BIN_SIZE + 1).is_err());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "returned twice")]
    fn test_double_return_caught() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mgr = manager();
        let bin = mgr.new_bin().unwrap();
        mgr.return_bin(bin).unwrap();
        drop(mgr.return_bin(bin));
    }
}
