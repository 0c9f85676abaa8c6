//! RISC-V Sv39/Sv48/Sv57 page tables.
//!
//! The paging mode is whatever the bootloader enabled; the walk depth adapts
//! to it. The kernel half (root entries 256..512) is shared between address
//! spaces exactly as on x86-64. Address-space cloning is not implemented on
//! this architecture and reports `NotSupported` at the address-space layer.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

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

use super::registers::{read_satp, write_satp};

pub const ENTRY_COUNT: usize = 512;
pub const HIGHER_HALF_ENTRY: usize = 256;

/// Per-CPU temporary-mapper windows, 1 GiB below the kernel image mapping
pub const TEMP_WINDOW_START: VirtAddr = VirtAddr::from(0xffff_ffff_4000_0000);

const SATP_MODE_SV39: usize = 8;
const SATP_MODE_SV48: usize = 9;
const SATP_MODE_SV57: usize = 10;

/// walk depth for the live paging mode (3, 4 or 5)
static LEVELS: AtomicUsize = AtomicUsize::new(3);
/// whether the platform advertises Svpbmt; without it every request
/// degrades to PMA
static SVPBMT_AVAILABLE: AtomicBool = AtomicBool::new(false);

static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);
pub static KERNEL_HALF_GENERATION: AtomicU64 = AtomicU64::new(0);

fn levels() -> usize {
    LEVELS.load(Ordering::Relaxed)
}

const fn table_index(addr: VirtAddr, level: usize) -> usize {
    (addr.into_raw() >> (12 + 9 * (level - 1))) & 0x1FF
}

/// Svpbmt encodings
const PBMT_PMA: u64 = 0;
const PBMT_NC: u64 = 1;
const PBMT_IO: u64 = 2;

#[bitfield(u64)]
pub struct PageEntry {
    pub valid: bool,
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub user: bool,
    pub global: bool,
    pub accessed: bool,
    pub dirty: bool,
    /// software: invalidation must not free the frame
    pub nofree: bool,
    /// software: the frame has a tracked page descriptor
    pub struct_page: bool,
    #[bits(44)]
    ppn: u64,
    #[bits(7)]
    __: (),
    #[bits(2)]
    pbmt: u64,
    pub napot: bool,
}

impl PageEntry {
    fn phys_addr(&self) -> PhysAddr {
        PhysAddr::from((self.ppn() as usize) << 12)
    }

    fn with_phys(self, phys: PhysAddr) -> Self {
        self.with_ppn((phys.into_raw() >> 12) as u64)
    }

    /// a pointer entry: valid with R/W/X all clear
    fn is_table(&self) -> bool {
        self.valid() && !self.read() && !self.write() && !self.execute()
    }

    fn is_leaf(&self) -> bool {
        self.valid() && (self.read() || self.write() || self.execute())
    }

    fn leaf(phys: PhysAddr, args: MapArgs) -> Self {
        let mut entry = Self::new()
            .with_valid(true)
            .with_read(true)
            .with_write(args.flags.contains(EntryFlags::WRITE))
            .with_execute(!args.flags.contains(EntryFlags::DISABLE_EXEC))
            .with_user(args.flags.contains(EntryFlags::USER_ACCESSIBLE))
            .with_global(args.flags.contains(EntryFlags::GLOBAL))
            .with_accessed(true)
            .with_dirty(args.flags.contains(EntryFlags::WRITE))
            .with_nofree(args.flags.contains(EntryFlags::NO_FREE))
            .with_struct_page(args.flags.contains(EntryFlags::STRUCT_PAGE))
            .with_phys(phys);

        if svpbmt_available() {
            entry.set_pbmt(match args.cache {
                CachePolicy::Normal => PBMT_PMA,
                CachePolicy::MemoryNoCache => PBMT_NC,
                CachePolicy::IoNoCache => PBMT_IO,
            });
        }

        entry
    }

    fn intermediate(phys: PhysAddr) -> Self {
        Self::new().with_valid(true).with_phys(phys)
    }
}

#[derive(Debug, Clone)]
#[repr(C)]
pub struct RawTable {
    entries: [PageEntry; ENTRY_COUNT],
}

impl RawTable {
    fn entry(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    fn set_entry(&mut self, index: usize, entry: PageEntry) {
        self.entries[index] = entry;
    }

    unsafe fn from_frame(frame: Frame) -> FramePtr<RawTable> {
        unsafe { frame.into_ptr() }
    }

    /// boot-time kernel-half mapping through the HHDM
    unsafe fn map_to(
        &mut self,
        page: Page,
        phys: PhysAddr,
        args: MapArgs,
    ) -> Result<(), MapToError> {
        let virt = page.virt_addr();
        let mut table = self;
        for level in (2..=levels()).rev() {
            let index = table_index(virt, level);
            let entry = table.entry(index);

            let next = if entry.is_table() {
                entry.phys_addr()
            } else if entry.is_leaf() {
                return Err(MapToError::HugePageEncountered);
            } else {
                let frame =
                    frame_allocator::allocate_frame().ok_or(MapToError::FrameAllocationFailed)?;
                frame.zero();
                table.set_entry(index, PageEntry::intermediate(frame.start_address()));
                frame.start_address()
            };

            table = unsafe { &mut *next.into_virt().into_ptr::<RawTable>() };
        }

        let index = table_index(virt, 1);
        if table.entry(index).valid() {
            return Err(MapToError::AlreadyMapped);
        }
        table.set_entry(index, PageEntry::leaf(phys, args));
        Ok(())
    }

    fn resolve(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let mut table = self;
        for level in (2..=levels()).rev() {
            let entry = table.entry(table_index(virt, level));
            if !entry.is_table() {
                return None;
            }
            table = unsafe { &*entry.phys_addr().into_virt().into_ptr::<RawTable>() };
        }
        let entry = table.entry(table_index(virt, 1));
        entry.is_leaf().then(|| entry.phys_addr())
    }
}

pub fn svpbmt_available() -> bool {
    SVPBMT_AVAILABLE.load(Ordering::Relaxed)
}

/// Flipped once ISA-string discovery (device tree) reports `svpbmt`
pub fn set_svpbmt_available() {
    SVPBMT_AVAILABLE.store(true, Ordering::Relaxed);
}

pub fn kernel_root() -> PhysAddr {
    PhysAddr::from(KERNEL_ROOT.load(Ordering::Acquire) as usize)
}

/// one past the last user-addressable byte for the live paging mode
pub fn user_end() -> VirtAddr {
    match levels() {
        3 => VirtAddr::from(1 << 38),
        4 => VirtAddr::from(1 << 47),
        _ => VirtAddr::from(1 << 56),
    }
}

/// address-space cloning is not implemented on RISC-V
pub const fn clone_supported() -> bool {
    false
}

pub fn init_kernel_root() {
    let satp = read_satp();
    let mode = satp >> 60;
    LEVELS.store(
        match mode {
            SATP_MODE_SV39 => 3,
            SATP_MODE_SV48 => 4,
            SATP_MODE_SV57 => 5,
            _ => panic!("bootloader left paging off (satp mode {mode})"),
        },
        Ordering::Relaxed,
    );

    let root_frame = frame_allocator::allocate_frame().expect("no frame for the kernel root");
    root_frame.zero();
    let mut root = unsafe { RawTable::from_frame(root_frame) };

    unsafe {
        map_hhdm(&mut root).expect("out of memory mapping the HHDM");
        map_devices(&mut root).expect("out of memory mapping device windows");
        copy_kernel_image(&mut root).expect("out of memory mapping the kernel image");
    }

    KERNEL_ROOT.store(root_frame.start_address().into_raw() as u64, Ordering::Release);
    unsafe {
        activate(root_frame.start_address());
    }
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

/// The PLIC window lives outside the memory map but is reached through the
/// HHDM like everything else
unsafe fn map_devices(root: &mut RawTable) -> Result<(), MapToError> {
    const PLIC_BASE: usize = 0x0C00_0000;
    const PLIC_SIZE: usize = 0x40_0000;

    let args = MapArgs::with_cache(
        EntryFlags::WRITE | EntryFlags::NO_FREE | EntryFlags::DISABLE_EXEC | EntryFlags::GLOBAL,
        CachePolicy::IoNoCache,
    );

    let mut phys = PhysAddr::from(PLIC_BASE);
    let end = PhysAddr::from(PLIC_BASE + PLIC_SIZE);
    while phys < end {
        let page = Page::containing_address(phys.into_virt());
        unsafe {
            match root.map_to(page, phys, args) {
                Ok(()) | Err(MapToError::AlreadyMapped) => {}
                Err(err) => return Err(err),
            }
        }
        phys += PAGE_SIZE;
    }

    Ok(())
}

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

pub fn temp_window_wire(cpu: usize) -> Result<(VirtAddr, *mut u64), MapToError> {
    let base = TEMP_WINDOW_START + cpu * TEMP_SLOTS * PAGE_SIZE;
    debug_assert!(table_index(base, 1) + TEMP_SLOTS <= ENTRY_COUNT);

    let root_frame = Frame::containing_address(kernel_root());
    let mut table = unsafe { RawTable::from_frame(root_frame) };

    let mut table_phys = root_frame.start_address();
    for level in (2..=levels()).rev() {
        let index = table_index(base, level);
        let entry = table.entry(index);

        let next = if entry.is_table() {
            entry.phys_addr()
        } else {
            let frame =
                frame_allocator::allocate_frame().ok_or(MapToError::FrameAllocationFailed)?;
            frame.zero();
            table.set_entry(index, PageEntry::intermediate(frame.start_address()));
            if level == levels() {
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

pub fn temp_kernel_pte(phys: PhysAddr) -> u64 {
    PageEntry::new()
        .with_valid(true)
        .with_read(true)
        .with_write(true)
        .with_accessed(true)
        .with_dirty(true)
        .with_global(true)
        .with_phys(phys)
        .into_bits()
}

#[inline(always)]
pub fn invalidate_page(va: VirtAddr) {
    unsafe {
        core::arch::asm!("sfence.vma {}, zero", in(reg) va.into_raw(), options(nostack, preserves_flags));
    }
}

pub fn flush_all_local() {
    unsafe {
        core::arch::asm!("sfence.vma", options(nostack, preserves_flags));
    }
}

pub fn current_root() -> PhysAddr {
    let satp = read_satp();
    PhysAddr::from((satp & 0xFFF_FFFF_FFFF) << 12)
}

/// # Safety
/// `root` must be a live root table with the kernel half mapped
pub unsafe fn activate(root: PhysAddr) {
    let mode = read_satp() >> 60;
    let satp = (mode << 60) | (root.into_raw() >> 12);
    unsafe {
        write_satp(satp);
    }
    flush_all_local();
}

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

pub fn refresh_kernel_half(root: PhysAddr) {
    unsafe {
        let mut table = RawTable::from_frame(Frame::containing_address(root));
        let kernel = RawTable::from_frame(Frame::containing_address(kernel_root()));
        table.entries[HIGHER_HALF_ENTRY..ENTRY_COUNT]
            .clone_from_slice(&kernel.entries[HIGHER_HALF_ENTRY..ENTRY_COUNT]);
    }
}

fn with_table<T>(phys: PhysAddr, f: impl FnOnce(&mut RawTable) -> T) -> T {
    temp_mapper::with_mapped(phys, |ptr| f(unsafe { ptr.cast::<RawTable>().as_mut() }))
}

pub fn prepare_leaf_pt_for(
    root: PhysAddr,
    virt: VirtAddr,
    _args: MapArgs,
) -> Result<PhysAddr, MapToError> {
    let mut table_phys = root;
    for level in (2..=levels()).rev() {
        let index = table_index(virt, level);

        let next = with_table(table_phys, |table| {
            let entry = table.entry(index);
            if entry.is_table() {
                return Ok(entry.phys_addr());
            }
            if entry.is_leaf() {
                return Err(MapToError::HugePageEncountered);
            }

            let frame =
                frame_allocator::allocate_frame().ok_or(MapToError::FrameAllocationFailed)?;
            frame.zero();
            table.set_entry(index, PageEntry::intermediate(frame.start_address()));
            Ok(frame.start_address())
        })?;

        table_phys = next;
    }

    Ok(table_phys)
}

fn leaf_table_of(root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
    let mut table_phys = root;
    for level in (2..=levels()).rev() {
        let index = table_index(virt, level);
        let entry = with_table(table_phys, |table| table.entry(index));
        if !entry.is_table() {
            return None;
        }
        table_phys = entry.phys_addr();
    }
    Some(table_phys)
}

pub fn map_page(
    root: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    args: MapArgs,
) -> Result<(), MapToError> {
    let leaf = prepare_leaf_pt_for(root, virt, args)?;
    let index = table_index(virt, 1);

    with_table(leaf, |table| {
        if table.entry(index).valid() {
            return Err(MapToError::AlreadyMapped);
        }
        table.set_entry(index, PageEntry::leaf(phys, args));
        Ok(())
    })
}

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

pub fn unmap_page(root: PhysAddr, virt: VirtAddr) -> Option<UnmappedPage> {
    let leaf = leaf_table_of(root, virt)?;
    let index = table_index(virt, 1);

    with_table(leaf, |table| {
        let entry = table.entry(index);
        if !entry.is_leaf() {
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

    entry.is_leaf().then(|| PageInfo {
        is_allocated: true,
        dirty: entry.dirty(),
        user: entry.user(),
        nofree: entry.nofree(),
        struct_page: entry.struct_page(),
        writable: entry.write(),
        page_addr: entry.phys_addr(),
    })
}

pub fn resolve_phys(root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
    get_page_info(root, virt).map(|info| info.page_addr)
}

/// # Safety
/// `root` must not be active on any hart
pub unsafe fn free_user_root(root: PhysAddr) {
    unsafe fn free_table(phys: PhysAddr, level: usize, last_index: usize) {
        let table = unsafe { RawTable::from_frame(Frame::containing_address(phys)) };

        for index in 0..last_index {
            let entry = table.entry(index);
            if !entry.valid() {
                continue;
            }

            if entry.is_table() {
                unsafe { free_table(entry.phys_addr(), level - 1, ENTRY_COUNT) };
            } else if level > 1 {
                debug_assert!(false, "user half contains a huge page");
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

    unsafe { free_table(root, levels(), HIGHER_HALF_ENTRY) };
}
