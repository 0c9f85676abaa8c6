//! Cross-CPU TLB shootdown.
//!
//! A [`ShootdownCtx`] batches invalidations while the caller holds the
//! address-space lock. Committing flushes locally, IPIs every other CPU the
//! space is active on, and only releases the frames queued for freeing once
//! every target acknowledged, so no CPU can reach a recycled frame through a
//! stale translation. One shootdown runs at a time system-wide; a waiter
//! services incoming requests while it spins, which keeps two committing
//! CPUs from deadlocking on each other.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::{sync::Arc, vec::Vec};

use crate::{
    VirtAddr, arch,
    memory::{
        frame_allocator::{self, Frame},
        page_info::{self, PageDescriptor},
        paging::UnmappedPage,
    },
    utils::locks::{Mutex, SpinLock},
};

/// above this many pages a full flush beats page-by-page invalidation
const FULL_FLUSH_THRESHOLD: usize = 32;

/// how a frame goes back once every CPU acknowledged
enum FrameRelease {
    Raw(Frame),
    Tracked(Arc<PageDescriptor>),
}

pub struct ShootdownCtx {
    /// bitmask of CPUs the space was active on when the context was opened
    active_cpus: u64,
    pages: Vec<VirtAddr>,
    releases: Vec<FrameRelease>,
}

impl ShootdownCtx {
    /// `active_cpus` comes from the address space under its lock
    pub fn new(active_cpus: u64) -> Self {
        Self {
            active_cpus,
            pages: Vec::new(),
            releases: Vec::new(),
        }
    }

    /// Queues the invalidation of `va`. When `free` is set, the frame the
    /// entry pointed at goes back to the allocator after the flush, honoring
    /// its `NO_FREE`/`STRUCT_PAGE` bits.
    pub fn enqueue(&mut self, va: VirtAddr, unmapped: UnmappedPage, free: bool) {
        self.pages.push(va);

        if !free || unmapped.nofree {
            return;
        }

        if unmapped.struct_page {
            if let Some(descriptor) = page_info::find_page_struct(unmapped.phys) {
                self.releases.push(FrameRelease::Tracked(descriptor));
            }
        } else {
            self.releases
                .push(FrameRelease::Raw(Frame::containing_address(unmapped.phys)));
        }
    }

    /// an invalidation with no frame to free (permission downgrades)
    pub fn enqueue_invalidation_only(&mut self, va: VirtAddr) {
        self.pages.push(va);
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty() && self.releases.is_empty()
    }

    /// Flushes everywhere the space is active and then releases the queued
    /// frames. Every PTE mutation happened before this; a remote CPU
    /// observes the new entries no later than its acknowledgement.
    pub fn commit(self) {
        if self.is_empty() {
            return;
        }

        let this_cpu = arch::cpu_index();
        let this_bit = 1u64 << this_cpu;

        if self.active_cpus & this_bit != 0 || !arch::threading::cpu_locals_ready() {
            flush_pages_locally(&self.pages);
        }

        let remote = self.active_cpus & !this_bit;
        if remote != 0 && arch::threading::cpu_locals_ready() {
            broadcast(remote, &self.pages);
        }

        for release in self.releases {
            match release {
                FrameRelease::Raw(frame) => frame_allocator::deallocate_frame(frame),
                FrameRelease::Tracked(descriptor) => descriptor.release_taken_out_page(),
            }
        }
    }
}

fn flush_pages_locally(pages: &[VirtAddr]) {
    if pages.len() > FULL_FLUSH_THRESHOLD {
        arch::paging::flush_all_local();
    } else {
        for &va in pages {
            arch::paging::invalidate_page(va);
        }
    }
}

struct ShootdownRequest {
    pages: Vec<VirtAddr>,
    /// bits of CPUs that still have to acknowledge
    pending: &'static AtomicU64,
}

static PENDING_ACKS: AtomicU64 = AtomicU64::new(0);
static CURRENT_REQUEST: SpinLock<Option<ShootdownRequest>> = SpinLock::new(None);
/// serializes committers; the IPI handler never takes it
static SHOOTDOWN_OWNER: Mutex<()> = Mutex::new(());

fn broadcast(targets: u64, pages: &[VirtAddr]) {
    let _owner = SHOOTDOWN_OWNER.lock();

    *CURRENT_REQUEST.lock() = Some(ShootdownRequest {
        pages: pages.to_vec(),
        pending: &PENDING_ACKS,
    });
    PENDING_ACKS.store(targets, Ordering::Release);

    let cpu_count = arch::cpu_count();
    for cpu in 0..cpu_count {
        if targets & (1 << cpu) != 0 {
            arch::ipi::send_tlb_shootdown(cpu);
        }
    }

    while PENDING_ACKS.load(Ordering::Acquire) != 0 {
        // the targets may be waiting on us for something else; keep
        // servicing incoming requests instead of spinning blind
        handle_shootdown_ipi();
        core::hint::spin_loop();
    }

    *CURRENT_REQUEST.lock() = None;
}

/// The receiving side, called from the shootdown IPI vector (and from a
/// spinning committer). Invalidates and acknowledges.
pub fn handle_shootdown_ipi() {
    let this_bit = 1u64 << arch::cpu_index();
    if PENDING_ACKS.load(Ordering::Acquire) & this_bit == 0 {
        return;
    }

    if let Some(request) = CURRENT_REQUEST.lock().as_ref() {
        flush_pages_locally(&request.pages);
        request.pending.fetch_and(!this_bit, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PhysAddr;

    #[test_case]
    fn local_commit_releases_frames() {
        let used_before = frame_allocator::mapped_frames();
        let frame = frame_allocator::allocate_frame().unwrap();

        let mut ctx = ShootdownCtx::new(1 << arch::cpu_index());
        ctx.enqueue(
            VirtAddr::from(0x5000_0000),
            UnmappedPage {
                phys: frame.start_address(),
                nofree: false,
                struct_page: false,
            },
            true,
        );
        ctx.commit();

        assert_eq!(frame_allocator::mapped_frames(), used_before);
    }

    #[test_case]
    fn nofree_frames_stay_out() {
        let used_before = frame_allocator::mapped_frames();

        let mut ctx = ShootdownCtx::new(0);
        ctx.enqueue(
            VirtAddr::from(0x5000_0000),
            UnmappedPage {
                phys: PhysAddr::from(0xFEC0_0000),
                nofree: true,
                struct_page: false,
            },
            true,
        );
        ctx.commit();

        // device frames never re-enter the allocator
        assert_eq!(frame_allocator::mapped_frames(), used_before);
    }
}
