//! x86-64 4-level page tables.
//!
//! The kernel half (entries 256..512 of the root) is built once at boot and
//! shared by every address space through its level-3 tables. User-half walks
//! go through the per-CPU temporary mapper so the kernel never needs the
//! target address space to be active.

use core::{
    arch::asm,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use bitfield_struct::bitfield;

use crate::{
    PhysAddr, VirtAddr,
    memory::{
        frame_allocator::{self, Frame, FramePtr},
        page_info,
        paging::{CachePolicy, EntryFlags, MapArgs, MapToError, PAGE_SIZE, Page, PageInfo, UnmappedPage},
        temp_mapper::{self, TEMP_SLOTS},
    },
};

pub const ENTRY_COUNT: usize = 512;
pub const HIGHER_HALF_ENTRY: usize = 256;
const LEVELS: usize = 4;

/// Base of the per-CPU temporary-mapper windows (root index 416, deep in the
/// kernel half, far from the HHDM and the kernel image)
pub const TEMP_WINDOW_START: VirtAddr = VirtAddr::from(0xffff_d000_0000_0000);

/// The last user-addressable byte + 1 (the lower canonical half)
pub const USER_END: VirtAddr = VirtAddr::from(0x0000_8000_0000_0000);

const fn table_index(addr: VirtAddr, level: usize) -> usize {
    (addr.into_raw() >> (12 + 9 * (level - 1))) & 0x1FF
}

#[bitfield(u64)]
pub struct PageEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub huge: bool,
    pub global: bool,
    /// software: invalidation must not free the frame
    pub nofree: bool,
    /// software: the frame has a tracked page descriptor
    pub struct_page: bool,
    #[bits(1)]
    __: (),
    #[bits(40)]
    ppn: u64,
    #[bits(11)]
    __: (),
    pub no_exec: bool,
}

impl PageEntry {
    fn phys_addr(&self) -> PhysAddr {
        PhysAddr::from((self.ppn() as usize) << 12)
    }

    fn with_phys(self, phys: PhysAddr) -> Self {
        self.with_ppn((phys.into_raw() >> 12) as u64)
    }

    /// a leaf entry from a mapping request
    fn leaf(phys: PhysAddr, args: MapArgs) -> Self {
        let mut entry = Self::new()
            .with_present(true)
            .with_writable(args.flags.contains(EntryFlags::WRITE))
            .with_user(args.flags.contains(EntryFlags::USER_ACCESSIBLE))
            .with_global(args.flags.contains(EntryFlags::GLOBAL))
            .with_nofree(args.flags.contains(EntryFlags::NO_FREE))
            .with_struct_page(args.flags.contains(EntryFlags::STRUCT_PAGE))
            .with_phys(phys);

        // the CPU only gives us one knob: cache disable
        if args.cache != CachePolicy::Normal {
            entry.set_cache_disable(true);
            entry.set_write_through(args.cache == CachePolicy::IoNoCache);
        }

        if args.flags.contains(EntryFlags::DISABLE_EXEC) && nx_available() {
            entry.set_no_exec(true);
        }

        entry
    }

    /// an intermediate entry; user access propagates down the walk
    fn intermediate(phys: PhysAddr, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(user)
            .with_phys(phys)
    }
}

#[derive(Debug, Clone)]
#[repr(C)]
pub struct RawTable {
    entries: [PageEntry; ENTRY_COUNT],
}

impl RawTable {
    pub fn zeroize(&mut self) {
        self.entries.fill(PageEntry::new());
    }

    fn entry(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    fn set_entry(&mut self, index: usize, entry: PageEntry) {
        self.entries[index] = entry;
    }

    /// HHDM view of a table frame; used while building the kernel half and
    /// for the kernel root itself
    unsafe fn from_frame(frame: Frame) -> FramePtr<RawTable> {
        unsafe { frame.into_ptr() }
    }

    /// Kernel-half mapping used only during boot, before the temporary
    /// mapper exists. Walks through the HHDM, allocating intermediates.
    unsafe fn map_to(
        &mut self,
        page: Page,
        phys: PhysAddr,
        args: MapArgs,
    ) -> Result<(), MapToError> {
        let virt = page.virt_addr();
        let mut table = self;
        for level in (2..=LEVELS).rev() {
            let index = table_index(virt, level);
            let entry = table.entry(index);

            let next = if entry.present() {
                if entry.huge() {
                    return Err(MapToError::HugePageEncountered);
                }
                entry.phys_addr()
            } else {
                let frame =
                    frame_allocator::allocate_frame().ok_or(MapToError::FrameAllocationFailed)?;
                frame.zero();
                table.set_entry(index, PageEntry::intermediate(frame.start_address(), false));
                frame.start_address()
            };

            table = unsafe { &mut *next.into_virt().into_ptr::<RawTable>() };
        }

        let index = table_index(virt, 1);
        if table.entry(index).present() {
            return Err(MapToError::AlreadyMapped);
        }
        table.set_entry(index, PageEntry::leaf(phys, args));
        Ok(())
    }

    fn resolve(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let mut table = self;
        for level in (2..=LEVELS).rev() {
            let entry = table.entry(table_index(virt, level));
            if !entry.present() || entry.huge() {
                return None;
            }
            table = unsafe { &*entry.phys_addr().into_virt().into_ptr::<RawTable>() };
        }
        let entry = table.entry(table_index(virt, 1));
        entry.present().then(|| entry.phys_addr())
    }
}

static NX_AVAILABLE: AtomicBool = AtomicBool::new(false);
static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);
/// bumped whenever a new root-level kernel-half entry appears; address spaces
/// refresh their copy lazily on activation
pub static KERNEL_HALF_GENERATION: AtomicU64 = AtomicU64::new(0);

pub fn nx_available() -> bool {
    NX_AVAILABLE.load(Ordering::Relaxed)
}

pub fn kernel_root() -> PhysAddr {
    PhysAddr::from(KERNEL_ROOT.load(Ordering::Acquire) as usize)
}

/// one past the last user-addressable byte
pub fn user_end() -> VirtAddr {
    USER_END
}

pub const fn clone_supported() -> bool {
    true
}

/// detects NX and enables EFER.NXE before any leaf sets the bit
fn init_nx() {
    let edx: u32;
    unsafe {
        asm!(
            "push rbx",
            "mov eax, 0x80000001",
            "cpuid",
            "pop rbx",
            out("edx") edx,
            out("eax") _,
            out("ecx") _,
        );
    }

    if edx & (1 << 20) != 0 {
        const IA32_EFER: u32 = 0xC000_0080;
        unsafe {
            let (mut lo, hi): (u32, u32);
            asm!("rdmsr", in("ecx") IA32_EFER, out("eax") lo, out("edx") hi);
            lo |= 1 << 11; // NXE
            asm!("wrmsr", in("ecx") IA32_EFER, in("eax") lo, in("edx") hi);
        }
        NX_AVAILABLE.store(true, Ordering::Relaxed);
    }
}

/// Builds the canonical kernel root: the HHDM, the kernel image (top 2 GiB,
/// taken from the bootloader's tables) and then switches to it. Everything
/// the kernel half will ever contain at root level exists after this, so
/// cloned user roots stay in sync structurally.
pub fn init_kernel_root() {
    init_nx();

    let root_frame = frame_allocator::allocate_frame().expect("no frame for the kernel root");
    root_frame.zero();
    let mut root = unsafe { RawTable::from_frame(root_frame) };

    unsafe {
        map_hhdm(&mut root).expect("out of memory mapping the HHDM");
        map_devices(&mut root).expect("out of memory mapping device windows");
        copy_kernel_image(&mut root).expect("out of memory mapping the kernel image");
    }

    KERNEL_ROOT.store(root_frame.start_address().into_raw() as u64, Ordering::Release);

    let previous = current_root();
    unsafe {
        activate(root_frame.start_address());
    }
    // the bootloader's root frame is bootloader-reclaimable, not ours to free
    let _ = previous;
}

unsafe fn map_hhdm(root: &mut RawTable) -> Result<(), MapToError> {
    let args = MapArgs::new(EntryFlags::WRITE | EntryFlags::DISABLE_EXEC | EntryFlags::GLOBAL);

    for entry in crate::limine::mmap_request().entries() {
        use limine::memory_map::EntryType;
        if entry.entry_type == EntryType::BAD_MEMORY || entry.entry_type == EntryType::RESERVED {
            continue;
        }

        let start = PhysAddr::from(entry.base as usize);
        let end = (start + entry.length as usize).to_next_page();

        let mut phys = start;
        while phys < end {
            let page = Page::containing_address(phys.into_virt());
            unsafe {
                // distinct memory-map entries can share a boundary frame
                match root.map_to(page, phys, args) {
                    Ok(()) | Err(MapToError::AlreadyMapped) => {}
                    Err(err) => return Err(err),
                }
            }
            phys += PAGE_SIZE;
        }
    }

    Ok(())
}

/// The interrupt-controller windows live outside the memory map but are
/// reached through the HHDM like everything else
unsafe fn map_devices(root: &mut RawTable) -> Result<(), MapToError> {
    const LAPIC_BASE: usize = 0xFEE0_0000;
    const IOAPIC_BASE: usize = 0xFEC0_0000;

    let args = MapArgs::with_cache(
        EntryFlags::WRITE | EntryFlags::NO_FREE | EntryFlags::DISABLE_EXEC | EntryFlags::GLOBAL,
        CachePolicy::MemoryNoCache,
    );

    for base in [LAPIC_BASE, IOAPIC_BASE] {
        let phys = PhysAddr::from(base);
        let page = Page::containing_address(phys.into_virt());
        unsafe {
            match root.map_to(page, phys, args) {
                Ok(()) | Err(MapToError::AlreadyMapped) => {}
                Err(err) => return Err(err),
            }
        }
    }

    Ok(())
}

/// carries the kernel image mapping (top 2 GiB) over from the bootloader's
/// tables, 4 KiB at a time
unsafe fn copy_kernel_image(root: &mut RawTable) -> Result<(), MapToError> {
    let current = unsafe { RawTable::from_frame(Frame::containing_address(current_root())) };
    let args = MapArgs::new(EntryFlags::WRITE | EntryFlags::GLOBAL);

    let start = Page::containing_address(VirtAddr::from(0xffff_ffff_8000_0000));
    let end = Page::containing_address(VirtAddr::from(0xffff_ffff_ffff_f000));

    for page in Page::iter_pages(start, end) {
        let Some(phys) = current.resolve(page.virt_addr()) else {
            continue;
        };
        unsafe {
            root.map_to(page, phys, args)?;
        }
    }

    Ok(())
}

/// Wires one CPU's temporary-mapper window into the kernel root, returning
/// the window base and a pointer to its 16 consecutive leaf entries.
pub fn temp_window_wire(cpu: usize) -> Result<(VirtAddr, *mut u64), MapToError> {
    let base = TEMP_WINDOW_START + cpu * TEMP_SLOTS * PAGE_SIZE;
    // windows pack 32 per leaf table; never straddle one
    debug_assert!(table_index(base, 1) + TEMP_SLOTS <= ENTRY_COUNT);

    let root_frame = Frame::containing_address(kernel_root());
    let mut table = unsafe { RawTable::from_frame(root_frame) };

    let mut table_phys = root_frame.start_address();
    for level in (2..=LEVELS).rev() {
        let index = table_index(base, level);
        let entry = table.entry(index);

        let next = if entry.present() {
            entry.phys_addr()
        } else {
            let frame =
                frame_allocator::allocate_frame().ok_or(MapToError::FrameAllocationFailed)?;
            frame.zero();
            table.set_entry(index, PageEntry::intermediate(frame.start_address(), false));
            if level == LEVELS {
                KERNEL_HALF_GENERATION.fetch_add(1, Ordering::Release);
            }
            frame.start_address()
        };

        table_phys = next;
        table = unsafe { RawTable::from_frame(Frame::containing_address(next)) };
    }

    let leaf_virt = table_phys.into_virt();
    let first_slot = unsafe { leaf_virt.into_ptr::<u64>().add(table_index(base, 1)) };
    Ok((base, first_slot))
}

/// the PTE value a temporary-mapper slot installs
pub fn temp_kernel_pte(phys: PhysAddr) -> u64 {
    let mut entry = PageEntry::new()
        .with_present(true)
        .with_writable(true)
        .with_phys(phys);
    if nx_available() {
        entry.set_no_exec(true);
    }
    entry.into_bits()
}

#[inline(always)]
pub fn invalidate_page(va: VirtAddr) {
    unsafe {
        asm!("invlpg [{}]", in(reg) va.into_raw(), options(nostack, preserves_flags));
    }
}

/// flushes every non-global translation on this CPU
pub fn flush_all_local() {
    unsafe {
        let cr3: usize;
        asm!("mov {}, cr3", out(reg) cr3, options(nostack, preserves_flags));
        asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
    }
}

pub fn current_root() -> PhysAddr {
    let cr3: usize;
    unsafe {
        asm!("mov {}, cr3", out(reg) cr3, options(nostack, preserves_flags));
    }
    PhysAddr::from(cr3 & !0xFFF)
}

/// # Safety
/// `root` must be a live root table with the kernel half mapped
pub unsafe fn activate(root: PhysAddr) {
    unsafe {
        asm!("mov cr3, {}", in(reg) root.into_raw(), options(nostack, preserves_flags));
    }
}

/// A fresh root for a user address space: zeroed user half, kernel half
/// copied from the canonical root
pub fn new_user_root() -> Result<PhysAddr, MapToError> {
    let frame = frame_allocator::allocate_frame().ok_or(MapToError::FrameAllocationFailed)?;
    frame.zero();

    unsafe {
        let mut root = RawTable::from_frame(frame);
        let kernel = RawTable::from_frame(Frame::containing_address(kernel_root()));
        root.entries[HIGHER_HALF_ENTRY..ENTRY_COUNT]
            .clone_from_slice(&kernel.entries[HIGHER_HALF_ENTRY..ENTRY_COUNT]);
    }

    Ok(frame.start_address())
}

/// Re-copies the kernel half of `root` from the canonical root. Cheap, and
/// only ever needed when [`KERNEL_HALF_GENERATION`] moved.
pub fn refresh_kernel_half(root: PhysAddr) {
    unsafe {
        let mut table = RawTable::from_frame(Frame::containing_address(root));
        let kernel = RawTable::from_frame(Frame::containing_address(kernel_root()));
        table.entries[HIGHER_HALF_ENTRY..ENTRY_COUNT]
            .clone_from_slice(&kernel.entries[HIGHER_HALF_ENTRY..ENTRY_COUNT]);
    }
}

/// runs `f` on the table whose frame is `phys`, through the temporary mapper
fn with_table<T>(phys: PhysAddr, f: impl FnOnce(&mut RawTable) -> T) -> T {
    temp_mapper::with_mapped(phys, |ptr| f(unsafe { ptr.cast::<RawTable>().as_mut() }))
}

/// Descends from `root`, allocating and clearing each missing intermediate
/// and propagating user access. Returns the physical address of the leaf
/// table so the caller can install entries under one lock.
pub fn prepare_leaf_pt_for(
    root: PhysAddr,
    virt: VirtAddr,
    args: MapArgs,
) -> Result<PhysAddr, MapToError> {
    let user = args.flags.contains(EntryFlags::USER_ACCESSIBLE);

    let mut table_phys = root;
    for level in (2..=LEVELS).rev() {
        let index = table_index(virt, level);

        let next = with_table(table_phys, |table| {
            let entry = table.entry(index);
            if entry.present() {
                if entry.huge() {
                    return Err(MapToError::HugePageEncountered);
                }
                if user && !entry.user() {
                    table.set_entry(index, entry.with_user(true));
                }
                return Ok(entry.phys_addr());
            }

            let frame =
                frame_allocator::allocate_frame().ok_or(MapToError::FrameAllocationFailed)?;
            frame.zero();
            table.set_entry(index, PageEntry::intermediate(frame.start_address(), user));
            Ok(frame.start_address())
        })?;

        table_phys = next;
    }

    Ok(table_phys)
}

/// walks to the leaf table without allocating
fn leaf_table_of(root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
    let mut table_phys = root;
    for level in (2..=LEVELS).rev() {
        let index = table_index(virt, level);
        let entry = with_table(table_phys, |table| table.entry(index));
        if !entry.present() || entry.huge() {
            return None;
        }
        table_phys = entry.phys_addr();
    }
    Some(table_phys)
}

/// Maps one page. Fails with `AlreadyMapped` if the leaf is present.
pub fn map_page(
    root: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    args: MapArgs,
) -> Result<(), MapToError> {
    let leaf = prepare_leaf_pt_for(root, virt, args)?;
    let index = table_index(virt, 1);

    with_table(leaf, |table| {
        if table.entry(index).present() {
            return Err(MapToError::AlreadyMapped);
        }
        table.set_entry(index, PageEntry::leaf(phys, args));
        Ok(())
    })
}

/// Overwrites a leaf entry in place (copy-on-write resolution). The caller
/// holds the address-space lock and owns the shootdown.
pub fn remap_page(
    root: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    args: MapArgs,
) -> Result<(), MapToError> {
    let leaf = prepare_leaf_pt_for(root, virt, args)?;
    let index = table_index(virt, 1);

    with_table(leaf, |table| {
        table.set_entry(index, PageEntry::leaf(phys, args));
    });
    Ok(())
}

/// Clears a leaf entry, reporting what was there so the caller can free the
/// frame according to `NO_FREE`/`STRUCT_PAGE`. TLB invalidation is the
/// caller's job (through a shootdown context).
pub fn unmap_page(root: PhysAddr, virt: VirtAddr) -> Option<UnmappedPage> {
    let leaf = leaf_table_of(root, virt)?;
    let index = table_index(virt, 1);

    with_table(leaf, |table| {
        let entry = table.entry(index);
        if !entry.present() {
            return None;
        }
        table.set_entry(index, PageEntry::new());
        Some(UnmappedPage {
            phys: entry.phys_addr(),
            nofree: entry.nofree(),
            struct_page: entry.struct_page(),
        })
    })
}

pub fn get_page_info(root: PhysAddr, virt: VirtAddr) -> Option<PageInfo> {
    let leaf = leaf_table_of(root, virt)?;
    let entry = with_table(leaf, |table| table.entry(table_index(virt, 1)));

    entry.present().then(|| PageInfo {
        is_allocated: true,
        dirty: entry.dirty(),
        user: entry.user(),
        nofree: entry.nofree(),
        struct_page: entry.struct_page(),
        writable: entry.writable(),
        page_addr: entry.phys_addr(),
    })
}

pub fn resolve_phys(root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
    get_page_info(root, virt).map(|info| info.page_addr)
}

/// Frees the user half of a dying address space: every mapped frame goes
/// back to the allocator unless its entry says otherwise, then the
/// intermediate tables, then the root itself.
///
/// # Safety
/// `root` must not be active on any CPU.
pub unsafe fn free_user_root(root: PhysAddr) {
    unsafe fn free_table(phys: PhysAddr, level: usize, last_index: usize) {
        let table = unsafe { RawTable::from_frame(Frame::containing_address(phys)) };

        for index in 0..last_index {
            let entry = table.entry(index);
            if !entry.present() {
                continue;
            }

            if level > 1 {
                debug_assert!(!entry.huge(), "user half contains a huge page");
                unsafe { free_table(entry.phys_addr(), level - 1, ENTRY_COUNT) };
            } else if entry.struct_page() {
                if let Some(descriptor) = page_info::find_page_struct(entry.phys_addr()) {
                    descriptor.release_taken_out_page();
                }
            } else if !entry.nofree() {
                frame_allocator::deallocate_frame(Frame::containing_address(entry.phys_addr()));
            }
        }

        frame_allocator::deallocate_frame(Frame::containing_address(phys));
    }

    unsafe { free_table(root, LEVELS, HIGHER_HALF_ENTRY) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame_allocator;

    #[test_case]
    fn map_unmap_round_trip() {
        let root = new_user_root().unwrap();
        let virt = VirtAddr::from(0x40_0000_0000);
        let frame = frame_allocator::allocate_frame().unwrap();

        let args = MapArgs::new(EntryFlags::WRITE | EntryFlags::USER_ACCESSIBLE);
        map_page(root, virt, frame.start_address(), args).unwrap();

        assert_eq!(resolve_phys(root, virt), Some(frame.start_address()));
        assert_eq!(
            map_page(root, virt, frame.start_address(), args),
            Err(MapToError::AlreadyMapped)
        );

        let info = get_page_info(root, virt).unwrap();
        assert!(info.user && info.writable && !info.nofree);

        let unmapped = unmap_page(root, virt).expect("page was mapped");
        assert_eq!(unmapped.phys, frame.start_address());
        assert!(resolve_phys(root, virt).is_none());

        // a fresh map at the same address succeeds again
        map_page(root, virt, frame.start_address(), args).unwrap();
        unmap_page(root, virt).unwrap();

        frame_allocator::deallocate_frame(frame);
        unsafe { free_user_root(root) };
    }

    #[test_case]
    fn intermediates_propagate_user_access() {
        let root = new_user_root().unwrap();
        let virt = VirtAddr::from(0x1234_5000);

        // kernel-only first, then a user mapping under the same intermediates
        let kernel_args = MapArgs::new(EntryFlags::WRITE);
        let leaf = prepare_leaf_pt_for(root, virt, kernel_args).unwrap();

        let user_args = MapArgs::new(EntryFlags::USER_ACCESSIBLE);
        let leaf_again = prepare_leaf_pt_for(root, virt, user_args).unwrap();
        assert_eq!(leaf, leaf_again);

        unsafe { free_user_root(root) };
    }

    #[test_case]
    fn user_boundary() {
        let root = new_user_root().unwrap();
        let frame = frame_allocator::allocate_frame().unwrap();
        let args = MapArgs::new(EntryFlags::USER_ACCESSIBLE);

        // the last user page maps fine
        let last = VirtAddr::from(USER_END.into_raw() - PAGE_SIZE);
        map_page(root, last, frame.start_address(), args).unwrap();
        unmap_page(root, last).unwrap();

        frame_allocator::deallocate_frame(frame);
        unsafe { free_user_root(root) };
    }
}
