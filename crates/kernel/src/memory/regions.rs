//! Memory regions: contiguous user ranges with a uniform access mask and a
//! backing policy. Regions own page-fault resolution; the page-table engine
//! below them only installs what a region decides.

use alloc::sync::Arc;
use bitflags::bitflags;
use portal_abi::errors::ErrorStatus;

use crate::{
    PhysAddr, VirtAddr,
    arch::paging as arch_paging,
    memory::{
        frame_allocator::AllocPolicy,
        mem_object::MemObject,
        page_info,
        paging::{CachePolicy, EntryFlags, MapArgs, MapToError, PAGE_SIZE, Page},
        temp_mapper,
    },
};

bitflags! {
    /// What a region lets user code do with its pages
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const READ  = 1;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

/// How a region resolves faults. Adding a policy is a typed extension here
/// plus one `match` arm below.
#[derive(Debug, Clone)]
pub enum RegionPolicy {
    /// faults allocate a zeroed tracked frame on first touch
    AnonymousLazy,
    /// backed by a fixed physical range (device memory); never freed
    PhysMapped { base: PhysAddr, cache: CachePolicy },
    /// backed by a shared, pinned memory object
    MemObject { object: Arc<MemObject>, offset: usize },
    /// pages shared read-only with another space; writes allocate privately
    CopyOnWrite,
}

/// What fault resolution tells the caller to do with the faulting task
#[derive(Debug)]
pub enum FaultResolution {
    /// the mapping exists now; retry the instruction
    Resolved,
    /// the backing object has to materialize the page first; park the task
    /// on it
    MustBlock {
        object: Arc<MemObject>,
        index: usize,
    },
    Fail(ErrorStatus),
}

#[derive(Debug, Clone)]
pub struct MemRegion {
    pub start: VirtAddr,
    pub size: usize,
    pub access: AccessFlags,
    pub policy: RegionPolicy,
}

impl MemRegion {
    pub fn new(start: VirtAddr, size: usize, access: AccessFlags, policy: RegionPolicy) -> Self {
        debug_assert!(start.is_page_aligned() && size % PAGE_SIZE == 0);
        Self {
            start,
            size,
            access,
            policy,
        }
    }

    #[inline]
    pub fn end(&self) -> VirtAddr {
        self.start + self.size
    }

    #[inline]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr < self.end()
    }

    /// entry flags every mapping of this region shares
    fn base_flags(&self) -> EntryFlags {
        let mut flags = EntryFlags::USER_ACCESSIBLE;
        if self.access.contains(AccessFlags::WRITE) {
            flags |= EntryFlags::WRITE;
        }
        if !self.access.contains(AccessFlags::EXEC) {
            flags |= EntryFlags::DISABLE_EXEC;
        }
        flags
    }

    /// Resolves a fault at `fault_va` (which must be inside the region)
    /// against `root`. Runs under the address-space lock.
    pub fn on_page_fault(
        &self,
        root: PhysAddr,
        requested: AccessFlags,
        fault_va: VirtAddr,
    ) -> FaultResolution {
        if !self.access.contains(requested) {
            return FaultResolution::Fail(ErrorStatus::PageNotAllocated);
        }

        let page = Page::containing_address(fault_va);
        match &self.policy {
            RegionPolicy::AnonymousLazy => self.fault_anonymous(root, page),
            RegionPolicy::PhysMapped { base, cache } => {
                let phys = *base + (page.virt_addr() - self.start);
                let args = MapArgs::with_cache(self.base_flags() | EntryFlags::NO_FREE, *cache);
                match arch_paging::map_page(root, page.virt_addr(), phys, args) {
                    Ok(()) | Err(MapToError::AlreadyMapped) => FaultResolution::Resolved,
                    Err(MapToError::FrameAllocationFailed) => {
                        FaultResolution::Fail(ErrorStatus::OutOfMemory)
                    }
                    Err(_) => FaultResolution::Fail(ErrorStatus::Generic),
                }
            }
            RegionPolicy::MemObject { object, offset } => {
                let index = (offset + (page.virt_addr() - self.start)) / PAGE_SIZE;
                match object.page_at(index) {
                    Some(descriptor) => {
                        let phys = descriptor.take_out_page();
                        let args = MapArgs::new(self.base_flags() | EntryFlags::STRUCT_PAGE);
                        match arch_paging::map_page(root, page.virt_addr(), phys, args) {
                            Ok(()) => FaultResolution::Resolved,
                            Err(err) => {
                                descriptor.release_taken_out_page();
                                match err {
                                    MapToError::AlreadyMapped => FaultResolution::Resolved,
                                    MapToError::FrameAllocationFailed => {
                                        FaultResolution::Fail(ErrorStatus::OutOfMemory)
                                    }
                                    _ => FaultResolution::Fail(ErrorStatus::Generic),
                                }
                            }
                        }
                    }
                    None if !object.in_range(index) => {
                        FaultResolution::Fail(ErrorStatus::PageNotAllocated)
                    }
                    None if object.is_pager_backed() => FaultResolution::MustBlock {
                        object: object.clone(),
                        index,
                    },
                    None => FaultResolution::Fail(ErrorStatus::OutOfMemory),
                }
            }
            RegionPolicy::CopyOnWrite => {
                if requested.contains(AccessFlags::WRITE) {
                    self.fault_cow_write(root, page)
                } else {
                    // reads on never-touched pages behave like anonymous ones
                    self.fault_anonymous(root, page)
                }
            }
        }
    }

    fn fault_anonymous(&self, root: PhysAddr, page: Page) -> FaultResolution {
        if arch_paging::get_page_info(root, page.virt_addr()).is_some() {
            // raced with another thread of the same space
            return FaultResolution::Resolved;
        }

        let Some(descriptor) = page_info::alloc_tracked(AllocPolicy::AnyPages) else {
            return FaultResolution::Fail(ErrorStatus::OutOfMemory);
        };

        let phys = descriptor.take_out_page();
        let args = MapArgs::new(self.base_flags() | EntryFlags::STRUCT_PAGE);

        match arch_paging::map_page(root, page.virt_addr(), phys, args) {
            Ok(()) => {
                // the entry keeps its reference; the construction one goes
                page_info::release_reference(&descriptor);
                FaultResolution::Resolved
            }
            err => {
                descriptor.release_taken_out_page();
                page_info::release_reference(&descriptor);
                match err {
                    Err(MapToError::AlreadyMapped) => FaultResolution::Resolved,
                    Err(MapToError::FrameAllocationFailed) => {
                        FaultResolution::Fail(ErrorStatus::OutOfMemory)
                    }
                    _ => FaultResolution::Fail(ErrorStatus::Generic),
                }
            }
        }
    }

    /// Copy-on-write: a write to a page whose frame may be shared. The sole
    /// owner keeps the frame and gets write access back; otherwise the
    /// contents move to a private frame.
    fn fault_cow_write(&self, root: PhysAddr, page: Page) -> FaultResolution {
        let Some(info) = arch_paging::get_page_info(root, page.virt_addr()) else {
            // writing a never-materialized page: plain anonymous fault
            return self.fault_anonymous(root, page);
        };
        if info.writable {
            return FaultResolution::Resolved;
        }

        debug_assert!(info.struct_page, "copy-on-write page without a descriptor");
        let Some(shared) = page_info::find_page_struct(info.page_addr) else {
            return FaultResolution::Fail(ErrorStatus::Generic);
        };

        let args = MapArgs::new(self.base_flags() | EntryFlags::STRUCT_PAGE);

        if shared.refcount() == 1 {
            // last sharer: upgrade in place
            if arch_paging::remap_page(root, page.virt_addr(), info.page_addr, args).is_err() {
                return FaultResolution::Fail(ErrorStatus::OutOfMemory);
            }
            arch_paging::invalidate_page(page.virt_addr());
            return FaultResolution::Resolved;
        }

        let Some(private) = page_info::alloc_tracked(AllocPolicy::AnyPages) else {
            return FaultResolution::Fail(ErrorStatus::OutOfMemory);
        };

        let src = temp_mapper::map(info.page_addr);
        let dst = temp_mapper::map(private.phys_addr());
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.ptr::<u8>().as_ptr(),
                dst.ptr::<u8>().as_ptr(),
                PAGE_SIZE,
            );
        }
        drop(dst);
        drop(src);

        let phys = private.take_out_page();
        if arch_paging::remap_page(root, page.virt_addr(), phys, args).is_err() {
            private.release_taken_out_page();
            page_info::release_reference(&private);
            return FaultResolution::Fail(ErrorStatus::OutOfMemory);
        }
        // construction reference moves out; the entry's reference stays
        page_info::release_reference(&private);
        // the old entry's reference to the shared frame goes away
        shared.release_taken_out_page();

        arch_paging::invalidate_page(page.virt_addr());
        FaultResolution::Resolved
    }
}
