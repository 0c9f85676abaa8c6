//! Address spaces: the identified page-table objects tasks live in.
//!
//! An address space carries its root table frame, the ordered region set,
//! the memory objects it keeps pinned and the bitmask of CPUs it is active
//! on. The `inner` lock is the page-table lock of the locking discipline:
//! it guards the region set, the pin set and every user-half PTE mutation.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::{collections::btree_map::BTreeMap, sync::Arc, sync::Weak, vec::Vec};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use portal_abi::errors::ErrorStatus;

use crate::{
    PhysAddr, VirtAddr, arch,
    arch::paging as arch_paging,
    memory::{
        mem_object::MemObject,
        page_info,
        paging::{EntryFlags, MapArgs, MapToError, PAGE_SIZE, Page},
        regions::{AccessFlags, FaultResolution, MemRegion, RegionPolicy},
        temp_mapper,
        tlb::ShootdownCtx,
    },
    utils::locks::{Mutex, MutexGuard, RwLock},
};

/// the kernel's own space; never destroyed, owns no regions
const KERNEL_SPACE_ID: u64 = 0;

/// where region allocation starts looking when the caller gives no address
const MMAP_BASE: VirtAddr = VirtAddr::from(0x10_0000_0000);

#[derive(Debug)]
struct SpaceInner {
    regions: BTreeMap<VirtAddr, MemRegion>,
    /// objects mapped somewhere in this space stay alive through these
    pins: Vec<Arc<MemObject>>,
}

#[derive(Debug)]
pub struct AddressSpace {
    id: u64,
    root: PhysAddr,
    /// kernel-half generation this root was last synced against
    kernel_gen: AtomicU64,
    /// bitmask of CPUs this space is currently active on
    active_cpus: AtomicU64,
    inner: Mutex<SpaceInner>,
}

static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(1);

lazy_static! {
    static ref SPACES: RwLock<HashMap<u64, Weak<AddressSpace>>> = RwLock::new(HashMap::new());
    static ref KERNEL_SPACE: Arc<AddressSpace> = Arc::new(AddressSpace {
        id: KERNEL_SPACE_ID,
        root: arch_paging::kernel_root(),
        kernel_gen: AtomicU64::new(0),
        active_cpus: AtomicU64::new(0),
        inner: Mutex::new(SpaceInner {
            regions: BTreeMap::new(),
            pins: Vec::new(),
        }),
    });
}

/// The address space kernel-only tasks run in
pub fn kernel_space() -> Arc<AddressSpace> {
    KERNEL_SPACE.clone()
}

pub fn lookup(id: u64) -> Option<Arc<AddressSpace>> {
    SPACES.read().get(&id).and_then(Weak::upgrade)
}

impl AddressSpace {
    /// A fresh empty space: cloned kernel half, no user mappings
    pub fn create() -> Result<Arc<Self>, ErrorStatus> {
        let root = arch_paging::new_user_root().map_err(|_| ErrorStatus::OutOfMemory)?;

        let space = Arc::new(Self {
            id: NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed),
            root,
            kernel_gen: AtomicU64::new(arch_paging::KERNEL_HALF_GENERATION.load(Ordering::Acquire)),
            active_cpus: AtomicU64::new(0),
            inner: Mutex::new(SpaceInner {
                regions: BTreeMap::new(),
                pins: Vec::new(),
            }),
        });

        SPACES.write().insert(space.id, Arc::downgrade(&space));
        Ok(space)
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn root(&self) -> PhysAddr {
        self.root
    }

    pub fn active_cpus(&self) -> u64 {
        self.active_cpus.load(Ordering::Acquire)
    }

    /// Makes this space the live one on `cpu`, refreshing a stale kernel
    /// half first. Called by the scheduler with interrupts off.
    pub fn activate_on(&self, cpu: usize) {
        let current_gen = arch_paging::KERNEL_HALF_GENERATION.load(Ordering::Acquire);
        if self.id != KERNEL_SPACE_ID && self.kernel_gen.swap(current_gen, Ordering::AcqRel) != current_gen
        {
            arch_paging::refresh_kernel_half(self.root);
        }

        self.active_cpus.fetch_or(1 << cpu, Ordering::AcqRel);
        unsafe {
            arch_paging::activate(self.root);
        }
    }

    pub fn deactivate_on(&self, cpu: usize) {
        self.active_cpus.fetch_and(!(1 << cpu), Ordering::AcqRel);
    }

    fn lock_inner(&self) -> MutexGuard<'_, SpaceInner> {
        self.inner.lock()
    }

    /// first gap of `size` bytes at or after `hint`
    fn find_free_range(inner: &SpaceInner, hint: VirtAddr, size: usize) -> Option<VirtAddr> {
        let mut candidate = if hint.is_null() { MMAP_BASE } else { hint };

        for region in inner.regions.values() {
            if region.end() <= candidate {
                continue;
            }
            if region.start >= candidate && region.start - candidate >= size {
                break;
            }
            candidate = region.end();
        }

        (candidate + size <= arch_paging::user_end()).then_some(candidate)
    }

    fn overlaps(inner: &SpaceInner, start: VirtAddr, size: usize) -> bool {
        let end = start + size;
        if let Some((_, before)) = inner.regions.range(..=start).next_back()
            && before.end() > start
        {
            return true;
        }
        if let Some((_, after)) = inner.regions.range(start..).next()
            && after.start < end
        {
            return true;
        }
        false
    }

    /// Installs a region. A null `start` means "pick an address"; a given
    /// one must be page aligned and free.
    pub fn add_region(
        &self,
        start: VirtAddr,
        size: usize,
        access: AccessFlags,
        policy: RegionPolicy,
    ) -> Result<VirtAddr, ErrorStatus> {
        if size == 0 || size % PAGE_SIZE != 0 || !start.is_page_aligned() {
            return Err(ErrorStatus::InvalidArgument);
        }

        let mut inner = self.lock_inner();

        let start = if start.is_null() {
            Self::find_free_range(&inner, VirtAddr::null(), size).ok_or(ErrorStatus::OutOfMemory)?
        } else {
            if start + size > arch_paging::user_end() {
                return Err(ErrorStatus::BadAddress);
            }
            if Self::overlaps(&inner, start, size) {
                return Err(ErrorStatus::AlreadyExists);
            }
            start
        };

        if let RegionPolicy::MemObject { object, offset } = &policy {
            if offset % PAGE_SIZE != 0 || (offset + size) / PAGE_SIZE > object.pages_count() {
                return Err(ErrorStatus::InvalidArgument);
            }
            inner.pins.push(object.clone());
        }

        inner
            .regions
            .insert(start, MemRegion::new(start, size, access, policy));
        Ok(start)
    }

    /// Removes every region intersecting `[start, start + size)`, unmapping
    /// and (optionally) freeing its pages through one shootdown
    pub fn unmap_range(&self, start: VirtAddr, size: usize, free: bool) -> Result<(), ErrorStatus> {
        if size == 0 {
            return Err(ErrorStatus::InvalidArgument);
        }
        let end = start + size;

        let mut inner = self.lock_inner();

        let victims: Vec<VirtAddr> = inner
            .regions
            .values()
            .filter(|region| region.start < end && region.end() > start)
            .map(|region| region.start)
            .collect();
        if victims.is_empty() {
            return Err(ErrorStatus::NotFound);
        }

        let mut ctx = ShootdownCtx::new(self.active_cpus());
        for key in victims {
            let region = inner.regions.remove(&key).unwrap();

            let pages = Page::iter_pages(
                Page::containing_address(region.start),
                Page::containing_address(region.end()),
            );
            for page in pages {
                if let Some(unmapped) = arch_paging::unmap_page(self.root, page.virt_addr()) {
                    ctx.enqueue(page.virt_addr(), unmapped, free);
                }
            }

            if let RegionPolicy::MemObject { object, .. } = &region.policy {
                // drop the pin this region held
                if let Some(position) = inner
                    .pins
                    .iter()
                    .position(|pinned| Arc::ptr_eq(pinned, object))
                {
                    inner.pins.swap_remove(position);
                }
            }
        }

        drop(inner);
        ctx.commit();
        Ok(())
    }

    /// O(pages) invalidation of an arbitrary range without touching the
    /// region set
    pub fn invalidate_range(&self, start: VirtAddr, size: usize, free: bool) {
        let inner = self.lock_inner();
        let mut ctx = ShootdownCtx::new(self.active_cpus());

        let pages = Page::iter_pages(
            Page::containing_address(start),
            Page::containing_address((start + size).to_next_page()),
        );
        for page in pages {
            if let Some(unmapped) = arch_paging::unmap_page(self.root, page.virt_addr()) {
                ctx.enqueue(page.virt_addr(), unmapped, free);
            }
        }

        drop(inner);
        ctx.commit();
    }

    /// Keeps `object` alive as long as this space (or until a region over it
    /// is unmapped); object-creation pins land here
    pub fn pin_object(&self, object: Arc<MemObject>) {
        self.lock_inner().pins.push(object);
    }

    pub fn is_mapped(&self, va: VirtAddr) -> bool {
        arch_paging::get_page_info(self.root, va).is_some()
    }

    pub fn resolve_phys(&self, va: VirtAddr) -> Option<PhysAddr> {
        arch_paging::resolve_phys(self.root, va)
    }

    /// does any region contain `va`?
    pub fn region_containing(&self, va: VirtAddr) -> Option<VirtAddr> {
        let inner = self.lock_inner();
        inner
            .regions
            .range(..=va)
            .next_back()
            .filter(|(_, region)| region.contains(va))
            .map(|(start, _)| *start)
    }

    /// Fault entry: find the region, let its policy resolve
    pub fn resolve_fault(&self, fault_va: VirtAddr, requested: AccessFlags) -> FaultResolution {
        let inner = self.lock_inner();
        self.resolve_fault_locked(&inner, fault_va, requested)
    }

    fn resolve_fault_locked(
        &self,
        inner: &SpaceInner,
        fault_va: VirtAddr,
        requested: AccessFlags,
    ) -> FaultResolution {
        if fault_va >= arch_paging::user_end() {
            return FaultResolution::Fail(ErrorStatus::PageNotAllocated);
        }

        let Some((_, region)) = inner
            .regions
            .range(..=fault_va)
            .next_back()
            .filter(|(_, region)| region.contains(fault_va))
        else {
            return FaultResolution::Fail(ErrorStatus::PageNotAllocated);
        };

        region.on_page_fault(self.root, requested, fault_va)
    }

    /// Clones this space: anonymous pages become copy-on-write shared with
    /// the clone, phys mappings are duplicated, object pins transfer.
    pub fn clone_space(self: &Arc<Self>) -> Result<Arc<Self>, ErrorStatus> {
        if !arch_paging::clone_supported() {
            return Err(ErrorStatus::NotSupported);
        }

        let clone = Self::create()?;
        let mut inner = self.lock_inner();
        let mut clone_inner = clone.lock_inner();
        let mut ctx = ShootdownCtx::new(self.active_cpus());

        let mut new_regions: BTreeMap<VirtAddr, MemRegion> = BTreeMap::new();

        for (start, region) in inner.regions.iter_mut() {
            let child_region = match &region.policy {
                RegionPolicy::AnonymousLazy | RegionPolicy::CopyOnWrite => {
                    Self::share_pages_cow(self.root, clone.root, region, &mut ctx)?;
                    region.policy = RegionPolicy::CopyOnWrite;
                    MemRegion::new(
                        region.start,
                        region.size,
                        region.access,
                        RegionPolicy::CopyOnWrite,
                    )
                }
                RegionPolicy::PhysMapped { .. } => {
                    // device windows are re-faulted on demand in the clone
                    region.clone()
                }
                RegionPolicy::MemObject { object, .. } => {
                    clone_inner.pins.push(object.clone());
                    region.clone()
                }
            };
            new_regions.insert(*start, child_region);
        }

        clone_inner.regions = new_regions;

        drop(clone_inner);
        drop(inner);
        ctx.commit();
        Ok(clone)
    }

    /// Shares every materialized page of `region` read-only between both
    /// roots, downgrading the parent's write access
    fn share_pages_cow(
        parent_root: PhysAddr,
        child_root: PhysAddr,
        region: &MemRegion,
        ctx: &mut ShootdownCtx,
    ) -> Result<(), ErrorStatus> {
        let pages = Page::iter_pages(
            Page::containing_address(region.start),
            Page::containing_address(region.end()),
        );

        let mut shared_flags = EntryFlags::USER_ACCESSIBLE | EntryFlags::STRUCT_PAGE;
        if !region.access.contains(AccessFlags::EXEC) {
            shared_flags |= EntryFlags::DISABLE_EXEC;
        }
        let shared_args = MapArgs::new(shared_flags);

        for page in pages {
            let va = page.virt_addr();
            let Some(info) = arch_paging::get_page_info(parent_root, va) else {
                continue;
            };

            let descriptor = page_info::find_page_struct(info.page_addr)
                .expect("anonymous page without a descriptor");

            // the child's entry takes a new reference
            let phys = descriptor.take_out_page();
            match arch_paging::map_page(child_root, va, phys, shared_args) {
                Ok(()) => {}
                Err(err) => {
                    descriptor.release_taken_out_page();
                    return Err(match err {
                        MapToError::FrameAllocationFailed => ErrorStatus::OutOfMemory,
                        _ => ErrorStatus::Generic,
                    });
                }
            }

            if info.writable {
                arch_paging::remap_page(parent_root, va, info.page_addr, shared_args)
                    .map_err(|_| ErrorStatus::OutOfMemory)?;
                ctx.enqueue_invalidation_only(va);
            }
        }

        Ok(())
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if self.id == KERNEL_SPACE_ID {
            return;
        }
        debug_assert_eq!(
            self.active_cpus(),
            0,
            "destroying an address space still active on a CPU"
        );

        SPACES.write().remove(&self.id);
        unsafe {
            arch_paging::free_user_root(self.root);
        }
    }
}

/// Errors of the failable user-memory paths
#[derive(Debug)]
pub enum UserAccessError {
    BadAddress,
    OutOfMemory,
    /// park the caller on this object page and restart the syscall
    MustBlock {
        object: Arc<MemObject>,
        index: usize,
    },
}

impl From<UserAccessError> for ErrorStatus {
    fn from(err: UserAccessError) -> Self {
        match err {
            UserAccessError::BadAddress => ErrorStatus::BadAddress,
            UserAccessError::OutOfMemory => ErrorStatus::OutOfMemory,
            UserAccessError::MustBlock { .. } => ErrorStatus::Retry,
        }
    }
}

impl AddressSpace {
    /// Validates `[va, va + len)` as user memory and faults every covered
    /// page in with `requested` access. The backbone of
    /// `prepare_user_buff_rd`/`prepare_user_buff_wr` and the copy helpers.
    fn prepare_user_range_locked(
        &self,
        inner: &SpaceInner,
        va: VirtAddr,
        len: usize,
        requested: AccessFlags,
    ) -> Result<(), UserAccessError> {
        if len == 0 {
            return Ok(());
        }
        if va + len > arch_paging::user_end() || va.is_null() {
            return Err(UserAccessError::BadAddress);
        }

        let pages = Page::iter_pages(
            Page::containing_address(va),
            Page::containing_address((va + len).to_next_page()),
        );

        for page in pages {
            let needs_fault = match arch_paging::get_page_info(self.root, page.virt_addr()) {
                Some(info) => requested.contains(AccessFlags::WRITE) && !info.writable,
                None => true,
            };
            if !needs_fault {
                continue;
            }

            match self.resolve_fault_locked(inner, page.virt_addr(), requested) {
                FaultResolution::Resolved => {}
                FaultResolution::MustBlock { object, index } => {
                    return Err(UserAccessError::MustBlock { object, index });
                }
                FaultResolution::Fail(ErrorStatus::OutOfMemory) => {
                    return Err(UserAccessError::OutOfMemory);
                }
                FaultResolution::Fail(_) => return Err(UserAccessError::BadAddress),
            }
        }

        Ok(())
    }

    pub fn prepare_user_buff_rd(&self, va: VirtAddr, len: usize) -> Result<(), UserAccessError> {
        let inner = self.lock_inner();
        self.prepare_user_range_locked(&inner, va, len, AccessFlags::READ)
    }

    pub fn prepare_user_buff_wr(&self, va: VirtAddr, len: usize) -> Result<(), UserAccessError> {
        let inner = self.lock_inner();
        self.prepare_user_range_locked(&inner, va, len, AccessFlags::READ | AccessFlags::WRITE)
    }

    /// Copies `bytes` into this space at `to`, faulting destination pages in
    /// as needed. Atomic with respect to the space's region set: the
    /// page-table lock is held from validation to the last byte. Runs
    /// through the temporary mapper, so the space does not have to be
    /// active.
    pub fn copy_to_user(&self, to: VirtAddr, bytes: &[u8]) -> Result<(), UserAccessError> {
        let inner = self.lock_inner();
        self.prepare_user_range_locked(
            &inner,
            to,
            bytes.len(),
            AccessFlags::READ | AccessFlags::WRITE,
        )?;

        let mut copied = 0;
        while copied < bytes.len() {
            let va = to + copied;
            let page_offset = va.into_raw() % PAGE_SIZE;
            let chunk = (PAGE_SIZE - page_offset).min(bytes.len() - copied);

            let phys = arch_paging::resolve_phys(self.root, va.to_previous_page())
                .expect("prepared page vanished under the page-table lock");

            temp_mapper::with_mapped(phys, |ptr| unsafe {
                core::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(copied),
                    ptr.as_ptr().add(page_offset),
                    chunk,
                );
            });

            copied += chunk;
        }

        drop(inner);
        Ok(())
    }

    /// The read direction of [`Self::copy_to_user`]
    pub fn copy_from_user(&self, from: VirtAddr, len: usize) -> Result<Vec<u8>, UserAccessError> {
        let inner = self.lock_inner();
        self.prepare_user_range_locked(&inner, from, len, AccessFlags::READ)?;

        let mut bytes = Vec::with_capacity(len);
        let mut copied = 0;
        while copied < len {
            let va = from + copied;
            let page_offset = va.into_raw() % PAGE_SIZE;
            let chunk = (PAGE_SIZE - page_offset).min(len - copied);

            let phys = arch_paging::resolve_phys(self.root, va.to_previous_page())
                .expect("prepared page vanished under the page-table lock");

            temp_mapper::with_mapped(phys, |ptr| unsafe {
                bytes.extend_from_slice(core::slice::from_raw_parts(
                    ptr.as_ptr().add(page_offset).cast_const(),
                    chunk,
                ));
            });

            copied += chunk;
        }

        drop(inner);
        Ok(bytes)
    }
}

/// The architecture fault handlers land here for user-mode faults
pub fn handle_user_fault(
    ctx: &mut arch::TrapContext,
    fault_va: VirtAddr,
    write: bool,
    exec: bool,
) {
    let task = crate::scheduler::current_task();
    let space = task.address_space();

    let mut requested = AccessFlags::READ;
    if write {
        requested |= AccessFlags::WRITE;
    }
    if exec {
        requested |= AccessFlags::EXEC;
    }

    match space.resolve_fault(fault_va, requested) {
        FaultResolution::Resolved => {}
        FaultResolution::MustBlock { object, index } => {
            crate::scheduler::block_current_on_page(ctx, object, index, fault_va);
        }
        FaultResolution::Fail(err) => {
            crate::error!(
                "task {} faulted at {:?} outside its regions ({err:?})",
                task.id(),
                fault_va
            );
            crate::scheduler::kill_current(ctx, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame_allocator;

    fn anon_region(space: &Arc<AddressSpace>, start: usize, pages: usize) -> VirtAddr {
        space
            .add_region(
                VirtAddr::from(start),
                pages * PAGE_SIZE,
                AccessFlags::READ | AccessFlags::WRITE,
                RegionPolicy::AnonymousLazy,
            )
            .unwrap()
    }

    #[test_case]
    fn regions_never_overlap() {
        let space = AddressSpace::create().unwrap();
        anon_region(&space, 0x1000_0000, 4);

        // overlapping at the head, the tail and inside all fail
        for (start, pages) in [(0x1000_0000, 1), (0x1000_3000, 2), (0x0FFF_F000, 2)] {
            assert_eq!(
                space.add_region(
                    VirtAddr::from(start),
                    pages * PAGE_SIZE,
                    AccessFlags::READ,
                    RegionPolicy::AnonymousLazy,
                ),
                Err(ErrorStatus::AlreadyExists)
            );
        }

        // adjacent is fine
        space
            .add_region(
                VirtAddr::from(0x1000_4000),
                PAGE_SIZE,
                AccessFlags::READ,
                RegionPolicy::AnonymousLazy,
            )
            .unwrap();
    }

    #[test_case]
    fn lazy_fault_allocates_only_touched_pages() {
        let space = AddressSpace::create().unwrap();
        let start = anon_region(&space, 0x2000_0000, 2);
        let used_before = frame_allocator::mapped_frames();

        // touch page 1 only, the way a write fault would
        let second_page = start + PAGE_SIZE;
        matches!(
            space.resolve_fault(second_page + 0x10, AccessFlags::WRITE),
            FaultResolution::Resolved
        )
        .then_some(())
        .unwrap();

        assert!(!space.is_mapped(start));
        assert!(space.is_mapped(second_page));

        // exactly one data frame (plus any intermediate tables)
        let phys = space.resolve_phys(second_page).unwrap();
        temp_mapper::with_mapped(phys, |ptr| unsafe {
            assert_eq!(ptr.as_ptr().read(), 0, "lazy page was not zeroed");
        });
        assert!(frame_allocator::mapped_frames() > used_before);

        space.unmap_range(start, 2 * PAGE_SIZE, true).unwrap();
        assert!(!space.is_mapped(second_page));
    }

    #[test_case]
    fn every_mapped_page_lies_in_exactly_one_region() {
        let space = AddressSpace::create().unwrap();
        let a = anon_region(&space, 0x3000_0000, 2);
        let b = anon_region(&space, 0x3001_0000, 2);

        for start in [a, b] {
            for page in 0..2usize {
                let va = start + page * PAGE_SIZE;
                matches!(
                    space.resolve_fault(va, AccessFlags::READ),
                    FaultResolution::Resolved
                )
                .then_some(())
                .unwrap();
                assert_eq!(space.region_containing(va), Some(start));
            }
        }

        // the gap belongs to no region and faults fatally
        let gap = VirtAddr::from(0x3000_8000);
        assert!(matches!(
            space.resolve_fault(gap, AccessFlags::READ),
            FaultResolution::Fail(ErrorStatus::PageNotAllocated)
        ));
    }

    #[test_case]
    fn copy_round_trips_through_user_memory() {
        let space = AddressSpace::create().unwrap();
        let start = anon_region(&space, 0x4000_0000, 2);

        // straddle the page boundary on purpose
        let target = start + PAGE_SIZE - 3;
        let payload = *b"boundary-crossing payload";

        space.copy_to_user(target, &payload).unwrap();
        let back = space.copy_from_user(target, payload.len()).unwrap();
        assert_eq!(&back, &payload);
    }

    #[test_case]
    fn user_boundary_is_exact() {
        let space = AddressSpace::create().unwrap();
        let end = arch_paging::user_end();

        // the last page maps; one past fails
        space
            .add_region(
                end - PAGE_SIZE,
                PAGE_SIZE,
                AccessFlags::READ | AccessFlags::WRITE,
                RegionPolicy::AnonymousLazy,
            )
            .unwrap();
        assert_eq!(
            space.add_region(
                end,
                PAGE_SIZE,
                AccessFlags::READ,
                RegionPolicy::AnonymousLazy
            ),
            Err(ErrorStatus::BadAddress)
        );

        assert!(space.prepare_user_buff_rd(end - 1, 2).is_err());
    }
}
