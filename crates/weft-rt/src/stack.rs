// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber stack providers.
//!
//! The runtime only asks for "a region of `size` usable bytes" and hands it
//! back when the fiber is reclaimed. Placement policy lives behind
//! [`StackAllocator`].

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::FiberError;

/// Stacks grow down; both ends must stay 16-byte aligned for the ABI.
const STACK_ALIGN: usize = 16;

/// Smallest stack either provider accepts.
pub const MIN_STACK_SIZE: usize = 8 * 1024;

/// A raw stack region. `base` is the lowest usable address.
#[derive(Debug)]
pub struct StackMemory {
    base: NonNull<u8>,
    size: usize,
}

// The region is plain memory; ownership moves with the value.
unsafe impl Send for StackMemory {}

impl StackMemory {
    /// # Safety
    /// `base..base + size` must be writable memory owned by the caller.
    pub unsafe fn from_raw(base: NonNull<u8>, size: usize) -> Self {
        Self { base, size }
    }

    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Source of fiber stacks.
pub trait StackAllocator: Send + Sync {
    /// Reserve a stack with at least `size` usable bytes.
    fn allocate(&self, size: usize) -> Result<StackMemory, FiberError>;

    /// Return a region obtained from `allocate`.
    ///
    /// # Safety
    /// `memory` must come from this allocator and no execution may still be
    /// running on it.
    unsafe fn deallocate(&self, memory: StackMemory);

    fn min_size(&self) -> usize {
        MIN_STACK_SIZE
    }
}

fn check_size(size: usize, min: usize) -> Result<(), FiberError> {
    if size < min {
        return Err(FiberError::InvalidStackSize { size, min });
    }
    Ok(())
}

/// Plain heap stacks.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedSizeStack;

impl FixedSizeStack {
    fn layout(size: usize) -> Result<Layout, FiberError> {
        let rounded = size
            .checked_add(STACK_ALIGN - 1)
            .map(|s| s & !(STACK_ALIGN - 1))
            .ok_or(FiberError::StackAllocation { size })?;
        Layout::from_size_align(rounded, STACK_ALIGN)
            .map_err(|_| FiberError::StackAllocation { size })
    }
}

impl StackAllocator for FixedSizeStack {
    fn allocate(&self, size: usize) -> Result<StackMemory, FiberError> {
        check_size(size, self.min_size())?;
        let layout = Self::layout(size)?;
        // SAFETY: layout has non-zero size (checked above).
        let raw = unsafe { alloc::alloc(layout) };
        let base = NonNull::new(raw).ok_or(FiberError::StackAllocation { size })?;
        Ok(StackMemory {
            base,
            size: layout.size(),
        })
    }

    unsafe fn deallocate(&self, memory: StackMemory) {
        if let Ok(layout) = Layout::from_size_align(memory.size, STACK_ALIGN) {
            alloc::dealloc(memory.base.as_ptr(), layout);
        }
    }
}

/// `mmap` stacks with an inaccessible guard page below the usable region,
/// so an overflow faults instead of corrupting a neighbour.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtectedStack;

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

impl StackAllocator for ProtectedStack {
    fn allocate(&self, size: usize) -> Result<StackMemory, FiberError> {
        check_size(size, self.min_size())?;
        let page = page_size();
        let usable = size
            .checked_add(page - 1)
            .map(|s| s & !(page - 1))
            .ok_or(FiberError::StackAllocation { size })?;
        let total = usable + page;

        // SAFETY: anonymous private mapping, no file descriptor involved.
        let region = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if region == libc::MAP_FAILED {
            return Err(FiberError::StackAllocation { size });
        }
        // SAFETY: the first page belongs to the mapping created above.
        if unsafe { libc::mprotect(region, page, libc::PROT_NONE) } != 0 {
            unsafe { libc::munmap(region, total) };
            return Err(FiberError::StackAllocation { size });
        }

        let base = unsafe { (region as *mut u8).add(page) };
        Ok(StackMemory {
            // mmap never returns null on success.
            base: NonNull::new(base).ok_or(FiberError::StackAllocation { size })?,
            size: usable,
        })
    }

    unsafe fn deallocate(&self, memory: StackMemory) {
        let page = page_size();
        let region = memory.base.as_ptr().sub(page);
        libc::munmap(region as *mut libc::c_void, memory.size + page);
    }
}

/// A stack owned by one fiber. Returned to its allocator on drop.
pub(crate) struct Stack {
    memory: Option<StackMemory>,
    allocator: Arc<dyn StackAllocator>,
}

impl Stack {
    pub fn allocate(allocator: Arc<dyn StackAllocator>, size: usize) -> Result<Self, FiberError> {
        let memory = allocator.allocate(size)?;
        Ok(Self {
            memory: Some(memory),
            allocator,
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.memory
            .as_ref()
            .map_or(std::ptr::null_mut(), StackMemory::base)
    }

    pub fn size(&self) -> usize {
        self.memory.as_ref().map_or(0, StackMemory::size)
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.base())
            .field("size", &self.size())
            .finish()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if let Some(memory) = self.memory.take() {
            // SAFETY: the owning fiber has terminated or never ran, so
            // nothing executes on this region any more.
            unsafe { self.allocator.deallocate(memory) };
        }
    }
}

/// Provider selected by a [`Config`](crate::Config).
pub(crate) fn allocator_for(protected: bool) -> Arc<dyn StackAllocator> {
    if protected {
        Arc::new(ProtectedStack)
    } else {
        Arc::new(FixedSizeStack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_stack_is_aligned_and_writable() {
        let alloc: Arc<dyn StackAllocator> = Arc::new(FixedSizeStack);
        let stack = Stack::allocate(alloc, 16 * 1024 + 3).unwrap();
        assert_eq!(stack.base() as usize % STACK_ALIGN, 0);
        assert_eq!(stack.size() % STACK_ALIGN, 0);
        assert!(stack.size() >= 16 * 1024 + 3);
        unsafe {
            stack.base().write(0xAA);
            stack.base().add(stack.size() - 1).write(0xBB);
        }
    }

    #[test]
    fn protected_stack_rounds_to_pages() {
        let stack = Stack::allocate(Arc::new(ProtectedStack), 10_000).unwrap();
        assert_eq!(stack.size() % page_size(), 0);
        assert_eq!(stack.base() as usize % page_size(), 0);
        unsafe { stack.base().add(stack.size() - 1).write(1) };
    }

    #[test]
    fn undersized_request_is_rejected() {
        match FixedSizeStack.allocate(128) {
            Err(FiberError::InvalidStackSize { size: 128, min }) => assert_eq!(min, MIN_STACK_SIZE),
            other => panic!("expected InvalidStackSize, got {:?}", other),
        }
    }
}
