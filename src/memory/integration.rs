#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::bins::BIN_SIZE;
    use crate::memory::small::{SmallAllocator, SmallAllocatorConfig, blocks_per_bin};
    use crate::sync::Arc;
    use crate::sync::thread;
    use std::collections::HashSet;

    fn allocator_with_bins(bins: usize) -> SmallAllocator {
        SmallAllocator::with_config(SmallAllocatorConfig {
            reservation_size: bins * BIN_SIZE,
        })
        .unwrap()
    }

    #[test]
    fn test_eight_thread_alloc_free_cycles() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        const ROUNDS: usize = if cfg!(miri) { 200 } else { 10_000 };
        let num_threads = 8usize;

        // 8 * 10_000 live 64-byte blocks need ceil(80_000 / 1024) = 79 bins;
        // give the reservation headroom beyond that.
        let allocator = Arc::new(allocator_with_bins(128));
        let barrier = Arc::new(crate::sync::barrier::Barrier::new(num_threads));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let alloc = allocator.clone();
                let b = barrier.clone();
                thread::spawn(move || {
                    let mut ptrs = Vec::with_capacity(ROUNDS);
                    b.wait(); // Synchronize start

                    for i in 0..ROUNDS {
                        let ptr = alloc.alloc(64).unwrap();
                        // Write a per-thread pattern
                        // Safety: Test code.
                        unsafe {
                            let val = (t as u8).wrapping_mul(31).wrapping_add(i as u8);
                            ptr.as_ptr().write(val);
                            ptr.as_ptr().add(63).write(val);
                        }
                        ptrs.push(ptr);
                    }

                    // Verify integrity before releasing anything
                    for (i, ptr) in ptrs.iter().enumerate() {
                        // Safety: Test code.
                        unsafe {
                            let expected = (t as u8).wrapping_mul(31).wrapping_add(i as u8);
                            assert_eq!(
                                ptr.as_ptr().read(),
                                expected,
                                "Contention caused corruption in thread {t}"
                            );
                            assert_eq!(ptr.as_ptr().add(63).read(), expected);
                        }
                    }

                    for ptr in ptrs {
                        // Safety: Test code.
                        unsafe { alloc.free(ptr.as_ptr()) };
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        // Quiescence: every loaned bin came back, the class free list is
        // clean, and bin consumption stayed within the expected bound.
        let class = 2; // 64-byte blocks
        assert_eq!(allocator.class_free_len(class), 0);
        assert_eq!(allocator.class_carve_state(class), (false, 0));
        let created = allocator.bin_manager().bins_in_use();
        assert_eq!(allocator.bin_manager().free_list_len(), created);
        let bound = (num_threads * ROUNDS).div_ceil(blocks_per_bin(class)) + 16;
        assert!(created <= bound, "created {created} bins, bound {bound}");
    }

    #[test]
    fn test_commit_exhaustion_recovery() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // Two-bin reservation: class 5 fits 2 * 128 blocks before the
        // address space runs out.
        let allocator = allocator_with_bins(2);
        let capacity = 2 * blocks_per_bin(5);

        let mut ptrs = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            ptrs.push(allocator.alloc(512).unwrap());
        }

        // The failing allocation reports the error without corrupting
        // anything.
        assert!(allocator.alloc(512).is_err());

        // Freed blocks make allocation succeed again via the reuse path.
        let recycled = ptrs.pop().unwrap();
        // Safety: Test code.
        unsafe { allocator.free(recycled.as_ptr()) };
        let again = allocator.alloc(512).unwrap();
        assert_eq!(again, recycled);
        ptrs.push(again);

        for ptr in ptrs {
            // Safety: Test code.
            unsafe { allocator.free(ptr.as_ptr()) };
        }
        assert_eq!(allocator.bin_manager().free_list_len(), 2);
    }

    #[test]
    fn test_interleaved_mixed_classes() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let allocator = allocator_with_bins(64);
        let sizes = [16usize, 24, 64, 100, 256, 512];

        let mut live: Vec<(std::ptr::NonNull<u8>, usize)> = Vec::new();
        let mut seen = HashSet::new();
        let mut rng: u64 = 0x2545_F491_4F6C_DD1D;

        for step in 0..4000u32 {
            rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1);
            let roll = (rng >> 33) as usize;

            if live.is_empty() || roll % 3 != 0 {
                let size = sizes[roll % sizes.len()];
                let ptr = allocator.alloc(size).unwrap();
                // Live blocks never alias each other.
                assert!(
                    seen.insert(ptr.as_ptr() as usize),
                    "aliased allocation at step {step}"
                );
                // Safety: Test code.
                unsafe { ptr.as_ptr().write(step as u8) };
                live.push((ptr, size));
            } else {
                let victim = roll % live.len();
                let (ptr, _) = live.swap_remove(victim);
                seen.remove(&(ptr.as_ptr() as usize));
                // Safety: Test code.
                unsafe { allocator.free(ptr.as_ptr()) };
            }
        }

        for (ptr, _) in live {
            // Safety: Test code.
            unsafe { allocator.free(ptr.as_ptr()) };
        }

        // Everything drained: all bins are back with the manager and every
        // class free list is empty and well-formed.
        for class in 0..crate::memory::small::CLASS_COUNT {
            assert_eq!(allocator.class_free_len(class), 0, "class {class}");
            assert_eq!(allocator.class_carve_state(class), (false, 0));
        }
        assert_eq!(
            allocator.bin_manager().free_list_len(),
            allocator.bin_manager().bins_in_use()
        );
    }

    #[test]
    fn test_cross_thread_free() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let allocator = Arc::new(allocator_with_bins(16));

        // Blocks allocated on one thread may be freed on another.
        let alloc = allocator.clone();
        let ptrs = thread::spawn(move || {
            (0..64)
                .map(|i| {
                    let ptr = alloc.alloc(128).unwrap();
                    // Safety: Test code.
                    unsafe { ptr.as_ptr().write(i as u8) };
                    ptr.as_ptr() as usize
                })
                .collect::<Vec<_>>()
        })
        .join()
        .unwrap();

        for (i, addr) in ptrs.into_iter().enumerate() {
            let ptr = addr as *mut u8;
            // Safety: Test code.
            unsafe {
                assert_eq!(ptr.read(), i as u8);
                allocator.free(ptr);
            }
        }

        assert_eq!(allocator.class_free_len(3), 0);
        assert_eq!(allocator.bin_manager().free_list_len(), 1);
    }

    #[cfg(not(miri))]
    #[test]
    fn test_global_thread_contention() {
        use crate::memory::small::GlobalSmallAllocator;

        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let num_threads = 8u8;
        let iters = 200u8;
        let barrier = Arc::new(crate::sync::barrier::Barrier::new(num_threads as usize));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let b = barrier.clone();
                thread::spawn(move || {
                    let mut ptrs = Vec::with_capacity(iters as usize);

                    b.wait(); // Synchronize start

                    for i in 0..iters {
                        let size = 16usize << (i % 4); // 16 to 128 bytes
                        let ptr = GlobalSmallAllocator::allocate_bytes(size).unwrap();

                        // Write unique pattern
                        // Safety: Test code.
                        unsafe {
                            let val = t.wrapping_mul(232).wrapping_add(i);
                            ptr.as_ptr().write(val);
                        }
                        ptrs.push(ptr);
                    }

                    // Verify integrity
                    for (i, ptr) in (0u8..).zip(ptrs.iter()) {
                        // Safety: Test code.
                        unsafe {
                            let expected = t.wrapping_mul(232).wrapping_add(i);
                            assert_eq!(
                                ptr.as_ptr().read(),
                                expected,
                                "Contention caused corruption in thread {t}"
                            );
                        }
                    }

                    // Clean up
                    for ptr in ptrs {
                        // Safety: Test code.
                        unsafe { GlobalSmallAllocator::free_bytes(ptr.as_ptr()) };
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }
}
