//! Shared, pinned memory objects.
//!
//! A memory object is a page-granular sharing unit: address spaces that map
//! one keep it pinned, faults resolve against its page descriptors, and a
//! pager-backed object can leave pages absent until its pager supplies them
//! (which is what parks faulting tasks on the page list).

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::{boxed::Box, sync::Arc};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use slab::Slab;

use crate::{
    memory::{frame_allocator::AllocPolicy, page_info, page_info::PageDescriptor},
    task::Task,
    utils::locks::Mutex,
};

/// A generated memory-object id; different for every object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MemObjectId(pub u64);

pub struct MemObject {
    id: MemObjectId,
    /// absent entries of a pager-backed object must be supplied before a
    /// fault can resolve
    pages: Mutex<Box<[Option<Arc<PageDescriptor>>]>>,
    /// kernel-populated objects materialize pages on first fault instead
    pager_backed: bool,
    /// tasks parked until a page index gets supplied; a slab so parked
    /// entries keep stable keys while others come and go
    waiters: Mutex<Slab<(usize, Arc<Task>)>>,
}

impl MemObject {
    /// Allocates a new object of `pages_count` pages. A pager-backed object
    /// starts with every page absent; otherwise pages appear zeroed on
    /// first fault.
    pub fn allocate(pages_count: usize, pager_backed: bool) -> Result<Arc<Self>, ()> {
        let mut registry = MEM_OBJECTS.lock();

        let id = MemObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed));
        let object = Arc::new(Self {
            id,
            pages: Mutex::new(alloc::vec![None; pages_count].into_boxed_slice()),
            pager_backed,
            waiters: Mutex::new(Slab::new()),
        });

        registry.insert(id, Arc::downgrade(&object));
        Ok(object)
    }

    pub const fn id(&self) -> MemObjectId {
        self.id
    }

    pub fn pages_count(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn in_range(&self, index: usize) -> bool {
        index < self.pages_count()
    }

    pub const fn is_pager_backed(&self) -> bool {
        self.pager_backed
    }

    /// The descriptor backing `index`, materializing it for kernel-populated
    /// objects. `None` means the pager has not supplied the page yet (or the
    /// index is out of range).
    pub fn page_at(&self, index: usize) -> Option<Arc<PageDescriptor>> {
        let mut pages = self.pages.lock();
        let slot = pages.get_mut(index)?;

        if let Some(descriptor) = slot {
            return Some(descriptor.clone());
        }
        if self.pager_backed {
            return None;
        }

        let descriptor = page_info::alloc_tracked(AllocPolicy::AnyPages)?;
        *slot = Some(descriptor.clone());
        Some(descriptor)
    }

    /// Parks `task` until `index` is supplied; the fault path calls this
    /// after [`Self::page_at`] came back empty
    pub fn park_waiter(&self, index: usize, task: Arc<Task>) {
        self.waiters.lock().insert((index, task));
    }

    /// Drops a dying task from every object's wait list
    pub fn remove_waiter_everywhere(task: &Arc<Task>) {
        // upgrade outside the registry lock: dropping a final reference runs
        // the object's destructor, which takes that lock itself
        let objects: alloc::vec::Vec<Arc<MemObject>> = {
            let registry = MEM_OBJECTS.lock();
            registry.values().filter_map(|weak| weak.upgrade()).collect()
        };

        for object in objects {
            object
                .waiters
                .lock()
                .retain(|_, (_, waiter)| !Arc::ptr_eq(waiter, task));
        }
    }

    /// The pager's upcall: installs a descriptor for `index` and wakes every
    /// task that faulted on it
    pub fn supply_page(&self, index: usize, descriptor: Arc<PageDescriptor>) -> Result<(), ()> {
        {
            let mut pages = self.pages.lock();
            let slot = pages.get_mut(index).ok_or(())?;
            if slot.is_some() {
                return Err(());
            }
            *slot = Some(descriptor);
        }

        let woken: alloc::vec::Vec<Arc<Task>> = {
            let mut waiters = self.waiters.lock();
            let keys: alloc::vec::Vec<usize> = waiters
                .iter()
                .filter(|(_, (waiting_on, _))| *waiting_on == index)
                .map(|(key, _)| key)
                .collect();
            keys.into_iter()
                .map(|key| waiters.remove(key).1)
                .collect()
        };

        for task in woken {
            crate::scheduler::unblock(&task);
        }
        Ok(())
    }
}

impl Drop for MemObject {
    fn drop(&mut self) {
        MEM_OBJECTS.lock().remove(&self.id);
        // descriptors drop their object-held references here
        for slot in self.pages.get_mut().iter_mut() {
            if let Some(descriptor) = slot.take() {
                page_info::release_reference(&descriptor);
            }
        }
    }
}

impl core::fmt::Debug for MemObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemObject")
            .field("id", &self.id)
            .field("pager_backed", &self.pager_backed)
            .finish()
    }
}

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

lazy_static! {
    static ref MEM_OBJECTS: Mutex<HashMap<MemObjectId, alloc::sync::Weak<MemObject>>> =
        Mutex::new(HashMap::new());
}

/// Upgrades an id to the live object; a failed upgrade means the last pin
/// dropped and the object is gone
pub fn lookup(id: MemObjectId) -> Option<Arc<MemObject>> {
    let mut registry = MEM_OBJECTS.lock();
    match registry.get(&id) {
        Some(weak) => match weak.upgrade() {
            Some(object) => Some(object),
            None => {
                registry.remove(&id);
                None
            }
        },
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn kernel_object_materializes_pages() {
        let object = MemObject::allocate(2, false).unwrap();

        let first = object.page_at(0).expect("page 0 did not materialize");
        let again = object.page_at(0).unwrap();
        assert_eq!(first.phys_addr(), again.phys_addr());

        assert!(object.page_at(2).is_none());
        assert!(lookup(object.id()).is_some());

        let id = object.id();
        drop(again);
        drop(first);
        drop(object);
        assert!(lookup(id).is_none());
    }

    #[test_case]
    fn pager_object_waits_for_supply() {
        let object = MemObject::allocate(1, true).unwrap();
        assert!(object.page_at(0).is_none());

        let descriptor = page_info::alloc_tracked(AllocPolicy::AnyPages).unwrap();
        object.supply_page(0, descriptor.clone()).unwrap();
        assert_eq!(object.page_at(0).unwrap().phys_addr(), descriptor.phys_addr());

        // double supply is rejected
        let other = page_info::alloc_tracked(AllocPolicy::AnyPages).unwrap();
        assert!(object.supply_page(0, other.clone()).is_err());
        page_info::release_reference(&other);
    }
}
