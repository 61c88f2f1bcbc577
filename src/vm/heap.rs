//! The VM-lifetime heap.
//!
//! Heap cells are handed out by the host allocator and reclaimed by its
//! conservative collector; the interpreter never frees. This stand-in
//! keeps every allocation alive in a bump arena until the VM drops, which
//! satisfies the same contract: a cell address stays valid for as long as
//! any reachable value may hold it.
//!
//! Every allocation is preceded by a hidden word recording its size, so
//! `pointer_realloc` can copy the old payload without allocator
//! cooperation.

use bumpalo::Bump;
use std::alloc::Layout;
use vesper_core::{CELL_HEADER_SIZE, TypeId, WORD_SIZE, align};

/// Bump-arena heap for class cells and `pointer_malloc` buffers.
pub struct Heap {
    arena: Bump,
}

impl Heap {
    pub fn new() -> Self {
        Self { arena: Bump::new() }
    }

    /// Bytes currently held by the arena.
    pub fn allocated_bytes(&self) -> usize {
        self.arena.allocated_bytes()
    }

    /// Allocate `size` zeroed bytes. Returns `None` when the host
    /// allocator is out of memory (raised as a catchable exception by the
    /// caller).
    pub fn malloc(&self, size: usize) -> Option<*mut u8> {
        let total = WORD_SIZE + align(size).max(WORD_SIZE);
        let layout = Layout::from_size_align(total, WORD_SIZE).ok()?;
        let base = self.arena.try_alloc_layout(layout).ok()?.as_ptr();
        unsafe {
            std::ptr::write_bytes(base, 0, total);
            (base as *mut u64).write(size as u64);
            Some(base.add(WORD_SIZE))
        }
    }

    /// Reallocate a buffer from [`Heap::malloc`], copying the smaller of
    /// the old and new sizes. The returned pointer may differ.
    ///
    /// # Safety
    /// `ptr` must have come from this heap's `malloc`/`realloc`.
    pub unsafe fn realloc(&self, ptr: *mut u8, new_size: usize) -> Option<*mut u8> {
        if ptr.is_null() {
            return self.malloc(new_size);
        }
        let old_size = unsafe { (ptr.sub(WORD_SIZE) as *const u64).read() } as usize;
        let new_ptr = self.malloc(new_size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size));
        }
        Some(new_ptr)
    }

    /// Allocate a zeroed class cell and write its type id at offset 0.
    pub fn allocate_class(&self, size: usize, type_id: TypeId) -> Option<*mut u8> {
        let cell = self.malloc(size.max(CELL_HEADER_SIZE))?;
        unsafe {
            (cell as *mut u32).write(type_id.index());
        }
        Some(cell)
    }

    /// Read the dynamic type id of a cell; the null reference yields the
    /// null id.
    pub fn cell_type_id(ptr: *const u8) -> TypeId {
        if ptr.is_null() {
            TypeId::NULL
        } else {
            TypeId::new(unsafe { (ptr as *const u32).read() })
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("allocated_bytes", &self.allocated_bytes())
            .finish()
    }
}
