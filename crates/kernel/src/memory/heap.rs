//! The kernel heap.
//!
//! Small allocations come from a buddy-style allocator working over arenas of
//! physically contiguous frames addressed through the HHDM; when every arena
//! is full another one is taken from the frame allocator. Large or strongly
//! aligned allocations bypass the buddy blocks and go straight to the frame
//! allocator (the layout alone tells `dealloc` which route was taken).

use core::alloc::{GlobalAlloc, Layout};

use crate::{
    memory::{
        VirtAddr,
        frame_allocator::{self, AllocPolicy, Frame},
        paging::PAGE_SIZE,
    },
    utils::locks::Mutex,
};

/// 4 MiB per arena
const ARENA_PAGES: usize = 1024;
const MAX_ARENAS: usize = 32;
/// Allocations at or above this go straight to whole frames
const LARGE_ALLOCATION: usize = PAGE_SIZE;

#[derive(Debug, Clone)]
#[repr(C)]
struct Block {
    free: bool,
    size: usize,
}

const BLOCK_HEADER: usize = size_of::<Block>();
const MIN_BLOCK: usize = 64;

impl Block {
    /// the block immediately after this one
    /// # Safety
    /// there may be no next block; use [`Arena::next`] instead
    unsafe fn next<'b>(&self) -> &'b mut Block {
        unsafe {
            let end = (self as *const Self).byte_add(self.size);
            &mut *end.cast_mut()
        }
    }

    unsafe fn data(&mut self) -> *mut u8 {
        unsafe { (self as *mut Self).offset(1).cast() }
    }

    /// divides self into 2 buddies, returning the right one; both end up free
    fn divide<'b>(&mut self) -> &'b mut Block {
        self.free = true;
        self.size >>= 1;

        let buddy = unsafe { &mut *(self as *mut Self).byte_add(self.size) };
        buddy.free = true;
        buddy.size = self.size;

        buddy
    }

    /// divides self until its payload barely fits `size`
    fn split_to_fit(&mut self, size: usize) {
        while self.size / 2 >= size + BLOCK_HEADER && self.size / 2 >= MIN_BLOCK {
            self.divide();
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Arena {
    start: VirtAddr,
    end: VirtAddr,
}

impl Arena {
    /// builds an arena over freshly allocated contiguous frames
    fn create() -> Option<Self> {
        let first = frame_allocator::allocate_contiguous(AllocPolicy::AnyPages, ARENA_PAGES, 1)?;
        let start = first.virt_addr();
        let end = start + ARENA_PAGES * PAGE_SIZE;

        let root = start.into_ptr::<Block>();
        unsafe {
            *root = Block {
                free: true,
                size: ARENA_PAGES * PAGE_SIZE,
            };
        }

        Some(Self { start, end })
    }

    fn first(&self) -> &'static mut Block {
        unsafe { &mut *self.start.into_ptr::<Block>() }
    }

    fn next(&self, block: &Block) -> Option<&'static mut Block> {
        let end = VirtAddr::from_ptr(block as *const Block) + block.size;
        if end < self.end {
            Some(unsafe { block.next() })
        } else {
            None
        }
    }

    fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr < self.end
    }

    /// merges runs of adjacent free blocks; keeps fragmentation bounded
    /// without a full buddy bitmap
    fn coalesce(&self) {
        let mut block = self.first();
        loop {
            let Some(next) = self.next(block) else {
                break;
            };

            if block.free && next.free && block.size == next.size {
                block.size *= 2;
                continue;
            }

            block = self.next(block).unwrap();
        }
    }

    fn allocate(&self, size: usize) -> Option<*mut u8> {
        let mut block = Some(self.first());
        while let Some(current) = block {
            if current.free && current.size >= size + BLOCK_HEADER {
                current.split_to_fit(size);
                current.free = false;
                return Some(unsafe { current.data() });
            }
            block = self.next(current);
        }
        None
    }
}

#[derive(Debug)]
pub struct BuddyHeap {
    arenas: heapless::Vec<Arena, MAX_ARENAS>,
}

unsafe impl Send for BuddyHeap {}

impl BuddyHeap {
    const fn empty() -> Self {
        Self {
            arenas: heapless::Vec::new(),
        }
    }

    fn grow(&mut self) -> bool {
        let Some(arena) = Arena::create() else {
            return false;
        };
        self.arenas.push(arena).is_ok()
    }

    fn allocate(&mut self, size: usize) -> *mut u8 {
        for arena in &self.arenas {
            if let Some(ptr) = arena.allocate(size) {
                return ptr;
            }
        }

        // retry after coalescing before paying for a new arena
        for arena in &self.arenas {
            arena.coalesce();
            if let Some(ptr) = arena.allocate(size) {
                return ptr;
            }
        }

        if self.grow()
            && let Some(ptr) = self.arenas.last().unwrap().allocate(size)
        {
            return ptr;
        }

        core::ptr::null_mut()
    }

    fn deallocate(&mut self, ptr: *mut u8) {
        let addr = VirtAddr::from_ptr(ptr);
        for arena in &self.arenas {
            if arena.contains(addr) {
                let block = unsafe { &mut *(ptr.cast::<Block>()).offset(-1) };
                debug_assert!(!block.free, "double free in the kernel heap");
                block.free = true;
                return;
            }
        }
        panic!("deallocating a pointer the kernel heap does not own: {addr:?}");
    }
}

static HEAP: Mutex<BuddyHeap> = Mutex::new(BuddyHeap::empty());

fn is_large(layout: &Layout) -> bool {
    // buddy payloads are only 16-byte aligned (the header's size)
    layout.size() >= LARGE_ALLOCATION || layout.align() > BLOCK_HEADER
}

pub struct KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if is_large(&layout) {
            let pages = layout.size().div_ceil(PAGE_SIZE);
            return match frame_allocator::allocate_contiguous(AllocPolicy::AnyPages, pages, 1) {
                Some(frame) => frame.virt_addr().into_ptr(),
                None => core::ptr::null_mut(),
            };
        }

        HEAP.lock().allocate(layout.size().max(MIN_BLOCK - BLOCK_HEADER))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if is_large(&layout) {
            let pages = layout.size().div_ceil(PAGE_SIZE);
            let frame = Frame::containing_address(VirtAddr::from_ptr(ptr).into_phys());
            frame_allocator::deallocate_contiguous(frame, pages);
            return;
        }

        HEAP.lock().deallocate(ptr);
    }
}

#[global_allocator]
static ALLOCATOR: KernelHeap = KernelHeap;

/// Maps the first arena in so early boot allocations don't hit the grow path
pub fn init() {
    let mut heap = HEAP.lock();
    assert!(heap.grow(), "not enough contiguous memory for the kernel heap");
}

#[cfg(test)]
mod tests {
    use alloc::{boxed::Box, vec::Vec};

    use super::*;

    #[test_case]
    fn small_allocations() {
        let mut v: Vec<u64> = Vec::new();
        for i in 0..1000 {
            v.push(i);
        }
        for (i, item) in v.iter().enumerate() {
            assert_eq!(*item, i as u64);
        }
    }

    #[test_case]
    fn large_allocation_goes_to_frames() {
        let used_before = frame_allocator::mapped_frames();
        let b = Box::new([0u8; PAGE_SIZE * 2]);
        assert!(frame_allocator::mapped_frames() > used_before);
        drop(b);
        assert_eq!(frame_allocator::mapped_frames(), used_before);
    }

    #[test_case]
    fn reuse_after_free() {
        let a = Box::new(0xdeadbeefu64);
        let first = &*a as *const u64;
        drop(a);

        let b = Box::new(0xcafebabeu64);
        // freed block is the first fit again
        assert_eq!(first, &*b as *const u64);
    }
}
