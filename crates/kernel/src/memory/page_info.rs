//! Tracked-frame descriptors.
//!
//! A [`PageDescriptor`] is the reference-counted metadata of a frame that may
//! be shared between address spaces (anonymous pages, memory-object pages,
//! copy-on-write sources). A frame with a descriptor is marked `STRUCT_PAGE`
//! in every leaf entry pointing at it, and is returned to the frame allocator
//! only when the last reference is dropped.

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::sync::Arc;
use hashbrown::HashMap;
use lazy_static::lazy_static;

use crate::{
    memory::{
        PhysAddr,
        frame_allocator::{self, AllocPolicy, Frame},
    },
    utils::locks::RwLock,
};

/// Refcounted metadata for a frame shared across address spaces
#[derive(Debug)]
pub struct PageDescriptor {
    phys: PhysAddr,
    /// references held by leaf entries and memory objects, starts at 1
    refcount: AtomicUsize,
}

impl PageDescriptor {
    pub fn phys_addr(&self) -> PhysAddr {
        self.phys
    }

    pub fn frame(&self) -> Frame {
        Frame::containing_address(self.phys)
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Takes the raw physical address, transferring one reference into the
    /// caller's leaf entry (which must set `STRUCT_PAGE`)
    pub fn take_out_page(self: &Arc<Self>) -> PhysAddr {
        self.refcount.fetch_add(1, Ordering::AcqRel);
        self.phys
    }

    /// The inverse of [`Self::take_out_page`]: drops the reference a leaf
    /// entry held. Frees the frame when it was the last one.
    pub fn release_taken_out_page(self: &Arc<Self>) {
        release_reference(self);
    }
}

lazy_static! {
    static ref PAGE_STRUCTS: RwLock<HashMap<PhysAddr, Arc<PageDescriptor>>> =
        RwLock::new(HashMap::new());
}

/// Allocates a zeroed tracked frame; the returned descriptor holds the single
/// initial reference
pub fn alloc_tracked(policy: AllocPolicy) -> Option<Arc<PageDescriptor>> {
    let frame = frame_allocator::allocate_frame_with(policy)?;
    frame.zero();

    let descriptor = Arc::new(PageDescriptor {
        phys: frame.start_address(),
        refcount: AtomicUsize::new(1),
    });

    let previous = PAGE_STRUCTS
        .write()
        .insert(frame.start_address(), descriptor.clone());
    assert!(
        previous.is_none(),
        "frame {:?} was already tracked",
        frame.start_address()
    );

    Some(descriptor)
}

/// Returns the descriptor of a tracked frame; `None` for raw kernel or
/// untracked frames
pub fn find_page_struct(phys: PhysAddr) -> Option<Arc<PageDescriptor>> {
    PAGE_STRUCTS.read().get(&phys).cloned()
}

/// Drops one reference; removes the descriptor and frees the frame on zero
pub fn release_reference(descriptor: &Arc<PageDescriptor>) {
    if descriptor.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
        PAGE_STRUCTS.write().remove(&descriptor.phys);
        frame_allocator::deallocate_frame(descriptor.frame());
    }
}

/// Adds a sharing reference (copy-on-write, memory-object pin)
pub fn add_reference(descriptor: &Arc<PageDescriptor>) {
    descriptor.refcount.fetch_add(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn tracked_lifecycle() {
        let used_before = frame_allocator::mapped_frames();

        let descriptor = alloc_tracked(AllocPolicy::AnyPages).unwrap();
        let phys = descriptor.phys_addr();
        assert_eq!(descriptor.refcount(), 1);

        let found = find_page_struct(phys).expect("tracked frame has no descriptor");
        assert_eq!(found.phys_addr(), phys);

        // move the initial reference into a fake leaf entry and back
        let taken = descriptor.take_out_page();
        assert_eq!(taken, phys);
        assert_eq!(descriptor.refcount(), 2);
        descriptor.release_taken_out_page();

        release_reference(&descriptor);
        assert!(find_page_struct(phys).is_none());
        assert_eq!(frame_allocator::mapped_frames(), used_before);
    }

    #[test_case]
    fn untracked_frames_have_no_struct() {
        let frame = frame_allocator::allocate_frame().unwrap();
        assert!(find_page_struct(frame.start_address()).is_none());
        frame_allocator::deallocate_frame(frame);
    }
}
