// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stack arena.
//!
//! Each scheduler owns a fixed, power-of-two number of stack slots at
//! fixed virtual addresses; coroutines are steered onto a slot by
//! `local_index & (slot_count - 1)` and evacuate the previous occupant
//! on conflict. Fixed addresses are what make evacuation sound: a
//! suspended coroutine's stack bytes are copied back to the exact same
//! range before it resumes, so interior pointers stay valid.
//!
//! Slots are mmap'd lazily with a `PROT_NONE` guard page below the
//! usable range, so an overflow faults instead of corrupting a
//! neighboring slot.

use std::io;
use std::ptr;

const GUARD_SIZE: usize = 4096;

/// One reusable coroutine stack. At most one coroutine occupies a slot
/// at any time; `owner` is its local index (0 = vacant).
pub(crate) struct StackSlot {
    /// Base of the mmap allocation (guard page). Null until first use.
    alloc: *mut u8,
    size: usize,
    pub owner: u32,
}

impl StackSlot {
    /// Bottom of the usable range.
    pub fn base(&self) -> *mut u8 {
        // SAFETY: alloc + GUARD_SIZE is within the allocation.
        unsafe { self.alloc.add(GUARD_SIZE) }
    }

    /// One past the top of the usable range. Stacks grow down from here.
    pub fn top(&self) -> *mut u8 {
        // SAFETY: one-past-the-end pointer, never dereferenced.
        unsafe { self.alloc.add(GUARD_SIZE + self.size) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_mapped(&self) -> bool {
        !self.alloc.is_null()
    }
}

pub(crate) struct StackArena {
    slots: Vec<StackSlot>,
    stack_size: usize,
}

impl StackArena {
    pub fn new(stack_num: u32, stack_size: usize) -> Self {
        debug_assert!(stack_num.is_power_of_two());
        let slots = (0..stack_num)
            .map(|_| StackSlot {
                alloc: ptr::null_mut(),
                size: stack_size,
                owner: 0,
            })
            .collect();
        Self { slots, stack_size }
    }

    /// Which slot the coroutine with this local index runs on.
    pub fn slot_index(&self, co_idx: u32) -> usize {
        co_idx as usize & (self.slots.len() - 1)
    }

    pub fn slot(&self, i: usize) -> &StackSlot {
        &self.slots[i]
    }

    pub fn slot_mut(&mut self, i: usize) -> &mut StackSlot {
        &mut self.slots[i]
    }

    /// Map the slot on first use.
    pub fn ensure_mapped(&mut self, i: usize) -> io::Result<()> {
        let slot = &mut self.slots[i];
        if slot.is_mapped() {
            return Ok(());
        }
        let total = GUARD_SIZE + self.stack_size;
        // SAFETY: anonymous private mapping; fd -1 / offset 0 is the
        // standard form for one.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: base..base+GUARD_SIZE lies inside the fresh mapping.
        let ret = unsafe { libc::mprotect(base, GUARD_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            // SAFETY: base/total match the mmap above.
            unsafe { libc::munmap(base, total) };
            return Err(err);
        }
        slot.alloc = base as *mut u8;
        Ok(())
    }
}

impl Drop for StackArena {
    fn drop(&mut self) {
        for slot in &self.slots {
            if slot.is_mapped() {
                // SAFETY: pointer and length match the original mmap.
                unsafe {
                    libc::munmap(slot.alloc as *mut libc::c_void, GUARD_SIZE + slot.size);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lazy_mapping_and_range() {
        let mut arena = StackArena::new(4, 64 * 1024);
        assert!(!arena.slot(0).is_mapped());
        arena.ensure_mapped(0).unwrap();
        let slot = arena.slot(0);
        assert!(slot.is_mapped());
        assert_eq!(slot.top() as usize - slot.base() as usize, 64 * 1024);
    }

    #[test]
    fn slot_steering_wraps() {
        let arena = StackArena::new(8, 64 * 1024);
        assert_eq!(arena.slot_index(1), 1);
        assert_eq!(arena.slot_index(9), 1);
        assert_eq!(arena.slot_index(8), 0);
    }

    #[test]
    fn stack_memory_is_writable() {
        let mut arena = StackArena::new(2, 64 * 1024);
        arena.ensure_mapped(1).unwrap();
        let slot = arena.slot(1);
        // SAFETY: base..top was just mapped read/write.
        unsafe {
            let p = slot.base();
            p.write(0xAB);
            slot.top().sub(1).write(0xCD);
            assert_eq!(p.read(), 0xAB);
            assert_eq!(slot.top().sub(1).read(), 0xCD);
        }
    }
}
