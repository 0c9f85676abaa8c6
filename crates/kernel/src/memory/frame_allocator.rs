//! The physical memory manager.
//!
//! Free frames are kept in intrusive linked lists whose nodes live inside the
//! free frames themselves (reached through the HHDM). Frames are split into
//! three zones so allocation policies can be honored: ISA (< 1 MiB, for the
//! SMP trampoline and legacy device windows), low (< 4 GiB, for 32-bit DMA)
//! and high (everything else).

use core::{
    fmt::Debug,
    ops::{Deref, DerefMut},
};

use crate::utils::locks::Mutex;
use lazy_static::lazy_static;

use super::{PhysAddr, VirtAddr, align_down, paging::PAGE_SIZE};

/// End of the ISA DMA window
const ISA_END: usize = 0x10_0000;
/// End of 32-bit addressable memory
const LOW_END: usize = 0x1_0000_0000;

/// Where an allocation is allowed to come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocPolicy {
    #[default]
    AnyPages,
    Below4GiB,
    Isa,
}

/// A pointer to some data in a physical frame, reached through the HHDM
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FramePtr<T>(*mut T);
impl<T> FramePtr<T> {
    pub fn phys_addr(&self) -> PhysAddr {
        VirtAddr::from_ptr(self.as_ptr()).into_phys()
    }

    pub fn frame(&self) -> Frame {
        Frame(self.phys_addr())
    }

    pub const fn as_ptr(&self) -> *mut T {
        self.0
    }
}

impl<T> Deref for FramePtr<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.0 }
    }
}

impl<T> DerefMut for FramePtr<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.0 }
    }
}

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame(PhysAddr);

impl Frame {
    #[inline(always)]
    /// returns the frame that contains an address
    pub fn containing_address(address: PhysAddr) -> Self {
        let aligned = align_down(address.into_raw(), PAGE_SIZE);
        Self(PhysAddr::from(aligned))
    }

    #[inline]
    pub fn start_address(&self) -> PhysAddr {
        self.0
    }

    #[inline(always)]
    pub fn virt_addr(&self) -> VirtAddr {
        self.0.into_virt()
    }

    #[inline(always)]
    pub const fn page_num(&self) -> usize {
        self.0.into_raw() / PAGE_SIZE
    }

    pub fn iter_frames(start: Frame, end: Frame) -> FrameIter {
        debug_assert!(start.start_address() <= end.start_address());
        FrameIter { start, end }
    }

    /// Converts a frame into a pointer to some data in that frame
    /// # Safety
    /// the caller must ensure that the frame is valid and contains a [`T`]
    pub unsafe fn into_ptr<T>(self) -> FramePtr<T> {
        FramePtr(self.virt_addr().into_ptr::<T>())
    }

    /// Zeroes the whole frame through the HHDM
    pub fn zero(&self) {
        unsafe {
            core::ptr::write_bytes(self.virt_addr().into_ptr::<u8>(), 0, PAGE_SIZE);
        }
    }
}

pub struct FrameIter {
    start: Frame,
    end: Frame,
}

impl Iterator for FrameIter {
    type Item = Frame;
    fn next(&mut self) -> Option<Self::Item> {
        if self.start.start_address() < self.end.start_address() {
            let frame = self.start;

            self.start.0 += PAGE_SIZE;
            Some(frame)
        } else {
            None
        }
    }
}

impl Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Frame")
            .field(&format_args!("{:#x}", self.start_address()))
            .finish()
    }
}

#[derive(Debug)]
struct FreeNode {
    start_address: PhysAddr,
    next: Option<*mut FreeNode>,
    prev: Option<*mut FreeNode>,
}

impl FreeNode {
    /// writes a new node into the given frame
    /// # Safety
    /// the caller must ensure that the frame is not used anymore
    unsafe fn new_in(frame: Frame) -> *mut Self {
        let node = frame.virt_addr().into_ptr::<FreeNode>();
        unsafe {
            *node = FreeNode {
                start_address: frame.start_address(),
                next: None,
                prev: None,
            };
        }
        node
    }

    const fn page_num(&self) -> usize {
        self.start_address.into_raw() / PAGE_SIZE
    }
}

/// One zone's free list. `head` holds the most recently freed frame; during
/// boot frames are pushed in ascending address order, so walking `prev` from
/// `tail` visits ascending addresses (which is what the contiguous-run search
/// relies on).
#[derive(Debug, Default)]
struct FreeList {
    head: Option<*mut FreeNode>,
    tail: Option<*mut FreeNode>,
    free_frames: usize,
}

unsafe impl Send for FreeList {}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            free_frames: 0,
        }
    }

    fn push(&mut self, frame: Frame) {
        unsafe {
            let node = FreeNode::new_in(frame);
            if let Some(head) = self.head.take() {
                (*head).prev = Some(node);
                (*node).next = Some(head);
            }

            if self.tail.is_none() {
                self.tail = Some(node);
            }

            self.head = Some(node);
            self.free_frames += 1;
        }
    }

    fn pop(&mut self) -> Option<Frame> {
        let head = self.head.take()?;

        unsafe {
            self.head = (*head).next.take();
            if let Some(next) = self.head {
                (*next).prev = None;
            } else {
                self.tail = None;
            }
            self.free_frames -= 1;
            Some(Frame::containing_address((*head).start_address))
        }
    }

    /// Unlinks one node, fixing up head/tail
    unsafe fn unlink(&mut self, node: *mut FreeNode) {
        unsafe {
            let next = (*node).next.take();
            let prev = (*node).prev.take();

            match next {
                Some(next) => (*next).prev = prev,
                None => self.tail = prev,
            }
            match prev {
                Some(prev) => (*prev).next = next,
                None => self.head = next,
            }
            self.free_frames -= 1;
        }
    }

    /// Finds and unlinks a run of `count` physically consecutive frames whose
    /// start is aligned to `align_pages * PAGE_SIZE`. Walks ascending
    /// addresses from the tail, so boot-time runs are found in one pass.
    fn pop_run(&mut self, count: usize, align_pages: usize) -> Option<Frame> {
        assert!(count != 0);
        let alignment = align_pages.max(1) * PAGE_SIZE;

        let mut run_start: Option<*mut FreeNode> = None;
        let mut run_len = 0;
        let mut last_page_num = 0;

        let mut current = self.tail;
        while let Some(node) = current {
            unsafe {
                let node_ref = &*node;

                let extends_run = run_len != 0 && node_ref.page_num() == last_page_num + 1;
                if !extends_run {
                    run_start = None;
                    run_len = 0;
                }

                if run_len == 0 {
                    if node_ref.start_address.into_raw() % alignment == 0 {
                        run_start = Some(node);
                        run_len = 1;
                    }
                } else {
                    run_len += 1;
                }
                last_page_num = node_ref.page_num();

                if run_len == count
                    && let Some(start) = run_start
                {
                    let start_frame = Frame::containing_address((*start).start_address);
                    // the run's nodes sit between `start` (tail side) and
                    // `node` (head side); walking prev from start reaches node
                    let mut victim = start;
                    loop {
                        let next_victim = (*victim).prev;
                        self.unlink(victim);
                        if victim == node {
                            break;
                        }
                        victim = next_victim.expect("contiguous run ended before its last node");
                    }
                    return Some(start_frame);
                }

                current = node_ref.prev;
            }
        }

        None
    }

    /// Walks the whole list; used by the self tests to cross-check the O(1)
    /// counters
    #[cfg(test)]
    fn count_frames_expensive(&self) -> usize {
        let mut current = self.head;
        let mut n = 0;
        while let Some(node) = current {
            n += 1;
            current = unsafe { (*node).next };
        }
        n
    }
}

#[derive(Debug)]
pub struct FrameZones {
    isa: FreeList,
    low: FreeList,
    high: FreeList,
    // metadata
    allocations: usize,
    usable_frames: usize,
}

unsafe impl Send for FrameZones {}

impl FrameZones {
    fn zone_of(phys: PhysAddr) -> ZoneIndex {
        match phys.into_raw() {
            addr if addr < ISA_END => ZoneIndex::Isa,
            addr if addr < LOW_END => ZoneIndex::Low,
            _ => ZoneIndex::High,
        }
    }

    fn zone(&mut self, index: ZoneIndex) -> &mut FreeList {
        match index {
            ZoneIndex::Isa => &mut self.isa,
            ZoneIndex::Low => &mut self.low,
            ZoneIndex::High => &mut self.high,
        }
    }

    /// Zones a policy may be satisfied from, preferred first. `AnyPages`
    /// drains high memory before touching the scarcer low zones.
    const fn fallback_order(policy: AllocPolicy) -> &'static [ZoneIndex] {
        match policy {
            AllocPolicy::AnyPages => &[ZoneIndex::High, ZoneIndex::Low, ZoneIndex::Isa],
            AllocPolicy::Below4GiB => &[ZoneIndex::Low, ZoneIndex::Isa],
            AllocPolicy::Isa => &[ZoneIndex::Isa],
        }
    }

    pub fn allocate(&mut self, policy: AllocPolicy) -> Option<Frame> {
        for &zone in Self::fallback_order(policy) {
            if let Some(frame) = self.zone(zone).pop() {
                self.allocations += 1;
                return Some(frame);
            }
        }
        None
    }

    /// Allocates `count` physically contiguous frames aligned to
    /// `align_pages * PAGE_SIZE`, returning the first frame
    pub fn allocate_contiguous(
        &mut self,
        policy: AllocPolicy,
        count: usize,
        align_pages: usize,
    ) -> Option<Frame> {
        for &zone in Self::fallback_order(policy) {
            if let Some(frame) = self.zone(zone).pop_run(count, align_pages) {
                self.allocations += count;
                return Some(frame);
            }
        }
        None
    }

    pub fn deallocate(&mut self, frame: Frame) {
        let zone = Self::zone_of(frame.start_address());
        self.zone(zone).push(frame);
        self.allocations -= 1;
    }

    /// returns the number of frames handed out and not yet returned
    pub fn mapped_frames(&self) -> usize {
        self.allocations
    }

    /// returns the number of usable frames the bootloader reported
    pub fn usable_frames(&self) -> usize {
        self.usable_frames
    }

    /// seeds the zones from the memory map provided by the bootloader
    fn create() -> FrameZones {
        let mut zones = FrameZones {
            isa: FreeList::new(),
            low: FreeList::new(),
            high: FreeList::new(),
            allocations: 0,
            usable_frames: 0,
        };

        let mmap = crate::limine::mmap_request();

        for entry in mmap.entries() {
            if entry.entry_type != limine::memory_map::EntryType::USABLE {
                continue;
            }

            let start_addr = PhysAddr::from(entry.base as usize);
            let end_addr = start_addr + (entry.length as usize);

            let start = Frame::containing_address(start_addr);
            let end = Frame::containing_address(end_addr);

            for frame in Frame::iter_frames(start, end) {
                let zone = Self::zone_of(frame.start_address());
                zones.zone(zone).push(frame);
                zones.usable_frames += 1;
            }
        }

        zones
    }
}

#[derive(Debug, Clone, Copy)]
enum ZoneIndex {
    Isa,
    Low,
    High,
}

lazy_static! {
    pub static ref FRAME_ZONES: Mutex<FrameZones> = Mutex::new(FrameZones::create());
}

/// Forces the zones to be seeded; called once from [`super::init`] so the
/// first allocation doesn't pay for the memory-map walk at an awkward time
pub fn init() {
    let zones = FRAME_ZONES.lock();
    crate::debug!(
        FrameZones,
        "{} usable frames ({} MiB)",
        zones.usable_frames(),
        zones.usable_frames() * PAGE_SIZE / (1024 * 1024)
    );
}

#[inline(always)]
pub fn allocate_frame() -> Option<Frame> {
    FRAME_ZONES.lock().allocate(AllocPolicy::AnyPages)
}

#[inline(always)]
pub fn allocate_frame_with(policy: AllocPolicy) -> Option<Frame> {
    FRAME_ZONES.lock().allocate(policy)
}

#[inline(always)]
pub fn allocate_contiguous(policy: AllocPolicy, count: usize, align_pages: usize) -> Option<Frame> {
    FRAME_ZONES
        .lock()
        .allocate_contiguous(policy, count, align_pages)
}

#[inline(always)]
pub fn deallocate_frame(frame: Frame) {
    FRAME_ZONES.lock().deallocate(frame)
}

#[inline(always)]
pub fn deallocate_contiguous(start: Frame, count: usize) {
    let mut zones = FRAME_ZONES.lock();
    let end = Frame::containing_address(start.start_address() + count * PAGE_SIZE);
    for frame in Frame::iter_frames(start, end) {
        zones.deallocate(frame);
    }
}

/// returns the number of frames handed out and not yet returned
#[inline(always)]
pub fn mapped_frames() -> usize {
    FRAME_ZONES.lock().mapped_frames()
}

#[inline(always)]
pub fn usable_frames() -> usize {
    FRAME_ZONES.lock().usable_frames()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn allocate_many_test() {
        let mut frames = heapless::Vec::<_, 1024>::new();
        for _ in 0..frames.capacity() {
            frames.push(allocate_frame().unwrap()).unwrap();
        }

        for i in 1..frames.capacity() {
            assert_ne!(frames[i - 1].start_address(), frames[i].start_address());
        }

        let last_frame = frames[frames.len() - 1];
        for frame in frames.iter() {
            deallocate_frame(*frame);
        }
        // freed frames are pushed at the head, so the last freed is the first
        // handed back out
        let allocated = allocate_frame().unwrap();
        assert_eq!(allocated, last_frame);

        deallocate_frame(allocated);
    }

    #[test_case]
    fn policy_zones_test() {
        let below = allocate_frame_with(AllocPolicy::Below4GiB)
            .expect("no frame below 4 GiB in the memory map");
        assert!(below.start_address().into_raw() < LOW_END);
        deallocate_frame(below);

        if let Some(isa) = allocate_frame_with(AllocPolicy::Isa) {
            assert!(isa.start_address().into_raw() < ISA_END);
            deallocate_frame(isa);
        }
    }

    #[test_case]
    fn allocate_contiguous_test() {
        let used_before = mapped_frames();

        let start = allocate_contiguous(AllocPolicy::AnyPages, 16, 16)
            .expect("failed to allocate a contiguous run");
        assert!(start.start_address().into_raw() % (16 * PAGE_SIZE) == 0);
        assert_eq!(used_before + 16, mapped_frames());

        // the run really is consecutive: write a marker through each frame
        let end = Frame::containing_address(start.start_address() + 16 * PAGE_SIZE);
        for (i, frame) in Frame::iter_frames(start, end).enumerate() {
            assert_eq!(frame.page_num(), start.page_num() + i);
            frame.zero();
        }

        deallocate_contiguous(start, 16);
        assert_eq!(used_before, mapped_frames());
    }

    #[test_case]
    fn frame_count_verification_test() {
        let zones = FRAME_ZONES.lock();
        let counted = zones.isa.count_frames_expensive()
            + zones.low.count_frames_expensive()
            + zones.high.count_frames_expensive();
        assert_eq!(zones.usable_frames() - zones.mapped_frames(), counted);
    }
}
