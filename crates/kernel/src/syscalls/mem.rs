//! SysMem syscalls implementation

use alloc::sync::Arc;
use macros::syscall_handler;
use portal_abi::{errors::ErrorStatus, mem};

use crate::{
    VirtAddr,
    memory::{
        mem_object::{self, MemObject, MemObjectId},
        paging::{CachePolicy, PAGE_SIZE},
        regions::{AccessFlags, RegionPolicy},
    },
    syscalls::ffi::{SyscallArgs, SyscallFFI},
};

fn access_from_raw(flags: u32) -> Result<AccessFlags, ErrorStatus> {
    let mut access = AccessFlags::empty();
    if flags & mem::REGION_READ != 0 {
        access |= AccessFlags::READ;
    }
    if flags & mem::REGION_WRITE != 0 {
        access |= AccessFlags::WRITE;
    }
    if flags & mem::REGION_EXEC != 0 {
        access |= AccessFlags::EXEC;
    }
    if access.is_empty() {
        return Err(ErrorStatus::InvalidArgument);
    }
    Ok(access)
}

#[syscall_handler]
fn sysmem_region_anon(
    addr_hint: VirtAddr,
    size: usize,
    flags: u32,
    out_addr: &mut VirtAddr,
) -> Result<(), ErrorStatus> {
    let access = access_from_raw(flags)?;
    let space = crate::scheduler::current_task().address_space();

    let policy = if flags & mem::REGION_COW != 0 {
        RegionPolicy::CopyOnWrite
    } else {
        RegionPolicy::AnonymousLazy
    };

    *out_addr = space.add_region(addr_hint, size, access, policy)?;
    Ok(())
}

#[syscall_handler]
fn sysmem_region_phys(
    addr_hint: VirtAddr,
    phys: usize,
    size: usize,
    flags_and_cache: usize,
    out_addr: &mut VirtAddr,
) -> Result<(), ErrorStatus> {
    if phys % PAGE_SIZE != 0 {
        return Err(ErrorStatus::InvalidArgument);
    }

    let flags = flags_and_cache as u32;
    let cache = match mem::RawCachePolicy::try_from((flags_and_cache >> 32) as u32) {
        Ok(mem::RawCachePolicy::Normal) => CachePolicy::Normal,
        Ok(mem::RawCachePolicy::MemoryNoCache) => CachePolicy::MemoryNoCache,
        Ok(mem::RawCachePolicy::IoNoCache) => CachePolicy::IoNoCache,
        Err(()) => return Err(ErrorStatus::InvalidArgument),
    };
    let access = access_from_raw(flags)?;

    let space = crate::scheduler::current_task().address_space();
    *out_addr = space.add_region(
        addr_hint,
        size,
        access,
        RegionPolicy::PhysMapped {
            base: crate::PhysAddr::from(phys),
            cache,
        },
    )?;
    Ok(())
}

#[syscall_handler]
fn sysmem_region_object(
    addr_hint: VirtAddr,
    object_id: u64,
    packed_offset_flags: usize,
    size: usize,
    out_addr: &mut VirtAddr,
) -> Result<(), ErrorStatus> {
    // offset rides in the upper bits, page-granular
    let offset = (packed_offset_flags >> 12) * PAGE_SIZE;
    let access = access_from_raw(packed_offset_flags as u32 & 0xFFF)?;

    let object: Arc<MemObject> =
        mem_object::lookup(MemObjectId(object_id)).ok_or(ErrorStatus::NotFound)?;

    let space = crate::scheduler::current_task().address_space();
    *out_addr = space.add_region(
        addr_hint,
        size,
        access,
        RegionPolicy::MemObject { object, offset },
    )?;
    Ok(())
}

#[syscall_handler]
fn sysmem_region_unmap(addr: VirtAddr, size: usize) -> Result<(), ErrorStatus> {
    let space = crate::scheduler::current_task().address_space();
    space.unmap_range(addr, size, true)
}

#[syscall_handler]
fn sysmem_object_create(
    pages: usize,
    pager_backed: usize,
    out_id: &mut u64,
) -> Result<(), ErrorStatus> {
    if pages == 0 {
        return Err(ErrorStatus::InvalidArgument);
    }

    let object =
        MemObject::allocate(pages, pager_backed != 0).map_err(|_| ErrorStatus::OutOfMemory)?;
    // the creator's space keeps the object pinned until it maps or drops it;
    // pin through a zero-length region would be a lie, so pin explicitly
    crate::scheduler::current_task()
        .address_space()
        .pin_object(object.clone());

    *out_id = object.id().0;
    Ok(())
}
