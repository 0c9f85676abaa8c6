//! Architecture-neutral paging vocabulary shared by the arch page-table
//! engines and the address-space layer.

pub const PAGE_SIZE: usize = 4096;

use core::fmt::{Debug, LowerHex};

use bitflags::bitflags;
use thiserror::Error;

use super::{PhysAddr, VirtAddr, align_down};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Page {
    start_address: VirtAddr,
}

impl Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Page({:#x})", self.start_address)
    }
}

impl LowerHex for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.start_address)
    }
}

#[derive(Debug, Clone)]
pub struct IterPage {
    start: Page,
    end: Page,
}

impl Page {
    pub const fn containing_address(address: VirtAddr) -> Self {
        let aligned = align_down(address.into_raw(), PAGE_SIZE);
        Self {
            start_address: VirtAddr::from(aligned),
        }
    }

    pub const fn virt_addr(&self) -> VirtAddr {
        self.start_address
    }

    pub const fn next(&self) -> Self {
        Self {
            start_address: VirtAddr::from(self.start_address.into_raw() + PAGE_SIZE),
        }
    }

    /// creates an iterator'able struct
    /// requires that start.start_address is smaller then end.start_address
    pub fn iter_pages(start: Page, end: Page) -> IterPage {
        assert!(start.start_address <= end.start_address);
        IterPage { start, end }
    }
}

impl Iterator for IterPage {
    type Item = Page;
    fn next(&mut self) -> Option<Self::Item> {
        if self.start.start_address < self.end.start_address {
            let page = self.start;

            self.start.start_address += PAGE_SIZE;
            Some(page)
        } else {
            None
        }
    }
}

bitflags! {
    /// Access and bookkeeping bits a mapping request carries. Read access is
    /// implied by the entry being present.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const WRITE           = 1;
        const USER_ACCESSIBLE = 1 << 1;
        const DISABLE_EXEC    = 1 << 2;
        const GLOBAL          = 1 << 3;
        /// Invalidation must not return the frame to the frame allocator
        const NO_FREE         = 1 << 4;
        /// The frame has a tracked [`super::page_info::PageDescriptor`]
        const STRUCT_PAGE     = 1 << 5;
    }
}

/// Cache policy of a leaf mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    #[default]
    Normal,
    MemoryNoCache,
    IoNoCache,
}

/// Everything `map` needs to build a leaf entry
#[derive(Debug, Clone, Copy)]
pub struct MapArgs {
    pub flags: EntryFlags,
    pub cache: CachePolicy,
}

impl MapArgs {
    pub const fn new(flags: EntryFlags) -> Self {
        Self {
            flags,
            cache: CachePolicy::Normal,
        }
    }

    pub const fn with_cache(flags: EntryFlags, cache: CachePolicy) -> Self {
        Self { flags, cache }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapToError {
    #[error("frame allocator: out of memory")]
    FrameAllocationFailed,
    #[error("the page is already mapped")]
    AlreadyMapped,
    #[error("a large-page intermediate is in the way")]
    HugePageEncountered,
}

/// What `get_page_info` reports about a leaf entry
#[derive(Debug, Clone, Copy, Default)]
pub struct PageInfo {
    pub is_allocated: bool,
    pub dirty: bool,
    pub user: bool,
    pub nofree: bool,
    pub struct_page: bool,
    pub writable: bool,
    pub page_addr: PhysAddr,
}

/// What `unmap` hands back so the caller can free the frame correctly
#[derive(Debug, Clone, Copy)]
pub struct UnmappedPage {
    pub phys: PhysAddr,
    pub nofree: bool,
    pub struct_page: bool,
}
