//! Physical Memory Manager: owns every physical page frame, hands out runs
//! of them, and reclaims them through RCU when released.
//!
//! Physical memory is covered by a sorted list of `PageArrayDescriptor`s, one
//! per contiguous range the loader reported as usable. A single `Reserved`
//! sentinel page brackets every descriptor so a run can never coalesce across
//! two physically disjoint arrays (scenario 4 in the test suite below).
//! Pages are identified by their index into the global page table, not by
//! pointer identity, matching the spec's "position in an array" model.

use alloc::vec::Vec;

use shared::memory::addr::{Length, PhysAddress, PhysExtent};
use shared::memory::page::PAGE_SIZE;
use spin::Mutex;

use super::error::{Error, Result};
use super::rcu::Rcu;

pub const MAX_ORDER: u32 = 20; // 2^20 pages = 4 GiB worth of frames in one run.

/// Identifies a page by its position in the global page table.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageId(u32);

impl PageId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Allocation policy, selecting which `PMMRegion` to search first.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Policy {
    /// Try the above-4GiB region first, falling back to below-4GiB.
    Normal,
    /// Only the below-4GiB region; never escalates.
    Below4GB,
}

#[derive(Clone, Copy)]
pub enum PageState {
    Free {
        size_pages: u32,
        list_prev: Option<PageId>,
        list_next: Option<PageId>,
    },
    Allocated {
        refcount: u32,
        /// Memory Object id this page is charged to, for anonymous pages
        /// that outlive every page-table mapping but not their owning
        /// object.
        owner: Option<u64>,
        anonymous: bool,
        next: Option<PageId>,
    },
    AllocatedPending {
        size_pages: u32,
        next: Option<PageId>,
    },
    PendingFree {
        pages_to_free: u32,
    },
    Reserved,
}

pub struct Page {
    state: PageState,
}

impl Page {
    const fn reserved() -> Self {
        Page {
            state: PageState::Reserved,
        }
    }

    pub fn state(&self) -> &PageState {
        &self.state
    }
}

/// One physically-contiguous array of pages, bracketed by `Reserved`
/// sentinels so coalescing never crosses into a disjoint range.
struct PageArrayDescriptor {
    base_phys: PhysAddress,
    /// Index of the first real (non-sentinel) page in the global table.
    first_index: u32,
    length_pages: u32,
    region: usize,
}

impl PageArrayDescriptor {
    fn contains(&self, phys: PhysAddress) -> bool {
        let start = self.base_phys;
        let end = start + Length::from_raw(self.length_pages as u64 * PAGE_SIZE.as_raw());
        phys >= start && phys < end
    }
}

/// A contiguous slice of the physical address space ("below 4GiB", "above
/// 4GiB") with its own per-order free lists.
struct PMMRegion {
    free_lists: [Option<PageId>; (MAX_ORDER + 1) as usize],
    non_empty_bitmap: u32,
}

impl PMMRegion {
    fn new() -> Self {
        PMMRegion {
            free_lists: [None; (MAX_ORDER + 1) as usize],
            non_empty_bitmap: 0,
        }
    }

    fn order_for(size_pages: u32) -> u32 {
        (32 - size_pages.leading_zeros() - 1).min(MAX_ORDER)
    }
}

pub struct Pmm {
    inner: Mutex<PmmInner>,
    rcu: Rcu,
}

struct PmmInner {
    pages: Vec<Page>,
    arrays: Vec<PageArrayDescriptor>,
    regions: Vec<PMMRegion>,
    pending_free: Vec<(u64, PageId)>,
}

const REGION_BELOW_4GB: usize = 0;
const REGION_ABOVE_4GB: usize = 1;
const BELOW_4GB_BOUNDARY: u64 = 4 * 1024 * 1024 * 1024;

impl Pmm {
    pub fn new() -> Self {
        Pmm {
            inner: Mutex::new(PmmInner {
                pages: Vec::new(),
                arrays: Vec::new(),
                regions: alloc::vec![PMMRegion::new(), PMMRegion::new()],
                pending_free: Vec::new(),
            }),
            rcu: Rcu::new(),
        }
    }

    pub fn rcu(&self) -> &Rcu {
        &self.rcu
    }

    /// Registers one physically-contiguous usable range with the PMM,
    /// appending `Reserved` sentinels on both sides and seeding its free
    /// list. `extent`'s address and length must already be page-aligned.
    ///
    /// Ranges must be added in increasing address order; this only happens
    /// once, during boot bring-up.
    pub fn add_range(&self, extent: PhysExtent) {
        assert!(extent.address.is_aligned_to(PAGE_SIZE.as_raw()));
        assert!(extent.length.is_aligned_to(PAGE_SIZE.as_raw()));
        let length_pages = (extent.length.as_raw() / PAGE_SIZE.as_raw()) as u32;
        if length_pages == 0 {
            return;
        }

        let region = if extent.address.as_raw() < BELOW_4GB_BOUNDARY {
            REGION_BELOW_4GB
        } else {
            REGION_ABOVE_4GB
        };

        let mut inner = self.inner.lock();

        // Leading sentinel.
        inner.pages.push(Page::reserved());
        let first_index = inner.pages.len() as u32;

        for _ in 0..length_pages {
            inner.pages.push(Page {
                state: PageState::Free {
                    size_pages: 0,
                    list_prev: None,
                    list_next: None,
                },
            });
        }
        // Trailing sentinel.
        inner.pages.push(Page::reserved());

        inner.arrays.push(PageArrayDescriptor {
            base_phys: extent.address,
            first_index,
            length_pages,
            region,
        });
        inner.arrays.sort_by_key(|d| d.base_phys.as_raw());

        Self::mark_run_free(&mut inner, PageId(first_index), length_pages, region);
    }

    /// Allocates a run of `count` contiguous pages. Returns the head, which
    /// is `AllocatedPending` and whose state records `count` so the caller
    /// can later free the whole run from just the head.
    pub fn alloc_pages(&self, count: u32, policy: Policy) -> Result<PageId> {
        assert!(count > 0);
        let order = PMMRegion::order_for(count.next_power_of_two());
        let mut inner = self.inner.lock();

        let try_regions: &[usize] = match policy {
            Policy::Normal => &[REGION_ABOVE_4GB, REGION_BELOW_4GB],
            Policy::Below4GB => &[REGION_BELOW_4GB],
        };

        for &region in try_regions {
            if let Some(head) = Self::alloc_from_region(&mut inner, region, count, order) {
                return Ok(head);
            }
        }

        Err(Error::OutOfMemory)
    }

    fn alloc_from_region(
        inner: &mut PmmInner,
        region: usize,
        count: u32,
        min_order: u32,
    ) -> Option<PageId> {
        let bucket_order = {
            let bitmap = inner.regions[region].non_empty_bitmap;
            let mask = !0u32 << min_order;
            let candidates = bitmap & mask;
            if candidates == 0 {
                return None;
            }
            candidates.trailing_zeros()
        };

        let head = inner.regions[region].free_lists[bucket_order as usize].unwrap();
        Self::unlink_free(inner, region, bucket_order, head);

        let run_len = match inner.pages[head.index()].state {
            PageState::Free { size_pages, .. } => size_pages,
            _ => unreachable!("free list pointed at a non-free page"),
        };

        if run_len > count {
            let remainder_index = head.0 + count;
            let remainder_len = run_len - count;
            Self::mark_run_free(inner, PageId(remainder_index), remainder_len, region);
        }

        Self::mark_run_allocated_pending(inner, head, count);
        Some(head)
    }

    /// Frees a run previously returned by `alloc_pages` (state
    /// `AllocatedPending`) or released through RCU (state `PendingFree`).
    /// Coalesces with `Free` neighbors and re-inserts into the appropriate
    /// bucket.
    pub fn free_page(&self, head: PageId) {
        let mut inner = self.inner.lock();

        let mut run_start = head;
        let mut run_len = match inner.pages[head.index()].state {
            PageState::AllocatedPending { size_pages, .. } => size_pages,
            PageState::PendingFree { pages_to_free, .. } => pages_to_free,
            _ => panic!("free_page called on a page that is neither AllocatedPending nor PendingFree"),
        };

        let region = Self::region_containing(inner.arrays.as_slice(), run_start);

        // Absorb a free predecessor run, if the page immediately before us is
        // the tail of one.
        if run_start.0 > 0 {
            if let PageState::Free {
                size_pages: pred_len,
                ..
            } = inner.pages[run_start.index() - 1].state
            {
                if pred_len > 0 {
                    let pred_head = PageId(run_start.0 - pred_len);
                    let bucket = PMMRegion::order_for(pred_len);
                    Self::unlink_free(&mut inner, region, bucket, pred_head);
                    run_start = pred_head;
                    run_len += pred_len;
                }
            }
        }

        // Absorb a free successor run.
        let successor = PageId(run_start.0 + run_len);
        if (successor.index()) < inner.pages.len() {
            if let PageState::Free {
                size_pages: succ_len,
                ..
            } = inner.pages[successor.index()].state
            {
                if succ_len > 0 {
                    let bucket = PMMRegion::order_for(succ_len);
                    Self::unlink_free(&mut inner, region, bucket, successor);
                    run_len += succ_len;
                }
            }
        }

        Self::mark_run_free(&mut inner, run_start, run_len, region);
    }

    /// Decrements an `Allocated` page's refcount; at zero, transitions it to
    /// `PendingFree` and records the generation it was freed in. The actual
    /// `free_page` only happens once `reclaim` observes that every CPU
    /// active at that generation has quiesced (see `rcu.rs`).
    pub fn release_page(&self, page: PageId) {
        let mut inner = self.inner.lock();
        let should_free = match &mut inner.pages[page.index()].state {
            PageState::Allocated { refcount, .. } => {
                *refcount -= 1;
                *refcount == 0
            }
            _ => panic!("release_page called on a page that is not Allocated"),
        };

        if !should_free {
            return;
        }

        inner.pages[page.index()].state = PageState::PendingFree { pages_to_free: 1 };
        let generation = self.rcu.current_generation();
        inner.pending_free.push((generation, page));
    }

    /// Moves every `PendingFree` page whose grace period has elapsed back
    /// into the free lists. Called from each CPU's quiescent point, after
    /// `RcuCpu::quiet`.
    pub fn reclaim(&self) {
        let mut inner = self.inner.lock();
        let generation = self.rcu.current_generation();
        let mut ready = Vec::new();
        inner.pending_free.retain(|&(gen, page)| {
            if gen < generation {
                ready.push(page);
                false
            } else {
                true
            }
        });
        for page in ready {
            drop(inner);
            self.free_page(page);
            inner = self.inner.lock();
        }
    }

    /// Bumps an `Allocated` page's refcount, producing a second owning
    /// handle to the same page. Used when a fault is resolved by sharing an
    /// existing page rather than allocating a new one.
    pub fn retain_page(&self, page: PageId) {
        let mut inner = self.inner.lock();
        match &mut inner.pages[page.index()].state {
            PageState::Allocated { refcount, .. } => *refcount += 1,
            other => panic!("retain_page called on a page that is not Allocated: {other:?}"),
        }
    }

    /// Marks a freshly allocated run as `Allocated` with the given initial
    /// refcount, transitioning it out of `AllocatedPending`. Called by
    /// higher layers once they've finished initializing the page's content.
    pub fn commit_allocation(&self, head: PageId, owner: Option<u64>, anonymous: bool) {
        let mut inner = self.inner.lock();
        match inner.pages[head.index()].state {
            PageState::AllocatedPending { next, .. } => {
                inner.pages[head.index()].state = PageState::Allocated {
                    refcount: 1,
                    owner,
                    anonymous,
                    next,
                };
            }
            other => panic!("commit_allocation called on non-pending page: {other:?}"),
        }
    }

    /// Kernel-only fast path: carves `count` contiguous pages and hands back
    /// their physical base directly, skipping the refcount bookkeeping
    /// `alloc_pages`+`commit_allocation` do for MemObject-owned pages. Used
    /// for kernel bookkeeping structures that don't have an owning object to
    /// charge the allocation to, e.g. the VMM's boundary tags and the direct
    /// map's own page tables.
    pub fn get_memory_for_kernel(&self, count: u32) -> Result<PhysAddress> {
        let head = self.alloc_pages(count, Policy::Normal)?;
        self.commit_allocation(head, None, false);
        Ok(self.phys_of(head))
    }

    /// Frees a run previously returned by `get_memory_for_kernel`. `count`
    /// must match the original allocation; unlike `release_page`, this does
    /// not go through RCU, since kernel bookkeeping pages are never read
    /// concurrently with this call the way a mapped MemObject page might be.
    pub fn free_memory_for_kernel(&self, phys: PhysAddress, count: u32) {
        let head = self
            .find_page(phys)
            .expect("free_memory_for_kernel: phys not in any registered array");
        {
            let mut inner = self.inner.lock();
            match inner.pages[head.index()].state {
                PageState::Allocated { refcount, .. } => assert_eq!(refcount, 1),
                ref other => panic!("free_memory_for_kernel called on a page that is not Allocated: {other:?}"),
            }
            Self::mark_run_allocated_pending(&mut inner, head, count);
        }
        self.free_page(head);
    }

    /// Physical address of the start of `page`.
    pub fn phys_of(&self, page: PageId) -> PhysAddress {
        let inner = self.inner.lock();
        let descriptor = inner
            .arrays
            .iter()
            .find(|d| page.0 >= d.first_index && page.0 < d.first_index + d.length_pages)
            .expect("phys_of called on a page that does not belong to any registered array");
        let offset_pages = (page.0 - descriptor.first_index) as u64;
        descriptor.base_phys + Length::from_raw(offset_pages * PAGE_SIZE.as_raw())
    }

    pub fn find_page(&self, phys: PhysAddress) -> Option<PageId> {
        let inner = self.inner.lock();
        let arrays = &inner.arrays;
        let idx = arrays
            .binary_search_by(|d| {
                if d.contains(phys) {
                    core::cmp::Ordering::Equal
                } else {
                    d.base_phys.as_raw().cmp(&phys.as_raw())
                }
            })
            .ok()?;
        let descriptor = &arrays[idx];
        let offset_pages =
            (phys.as_raw() - descriptor.base_phys.as_raw()) / PAGE_SIZE.as_raw();
        Some(PageId(descriptor.first_index + offset_pages as u32))
    }

    fn region_containing(arrays: &[PageArrayDescriptor], page: PageId) -> usize {
        for d in arrays {
            if page.0 >= d.first_index && page.0 < d.first_index + d.length_pages {
                return d.region;
            }
        }
        panic!("page {page:?} does not belong to any registered array");
    }

    fn mark_run_allocated_pending(inner: &mut PmmInner, head: PageId, count: u32) {
        for i in 0..count {
            let index = (head.0 + i) as usize;
            inner.pages[index].state = PageState::AllocatedPending {
                size_pages: count,
                next: if i == 0 { None } else { Some(PageId(head.0 + i - 1)) },
            };
        }
    }

    fn mark_run_free(inner: &mut PmmInner, head: PageId, len: u32, region: usize) {
        if len == 0 {
            return;
        }
        let tail = PageId(head.0 + len - 1);
        for i in head.0..=tail.0 {
            inner.pages[i as usize].state = PageState::Free {
                size_pages: len,
                list_prev: None,
                list_next: None,
            };
        }

        let order = PMMRegion::order_for(len);
        let list_head = inner.regions[region].free_lists[order as usize];
        if let Some(old_head) = list_head {
            if let PageState::Free { list_prev, .. } = &mut inner.pages[old_head.index()].state {
                *list_prev = Some(head);
            }
        }
        if let PageState::Free { list_next, .. } = &mut inner.pages[head.index()].state {
            *list_next = list_head;
        }
        if let PageState::Free { list_prev, .. } = &mut inner.pages[tail.index()].state {
            *list_prev = None;
        }
        inner.regions[region].free_lists[order as usize] = Some(head);
        inner.regions[region].non_empty_bitmap |= 1 << order;
    }

    fn unlink_free(inner: &mut PmmInner, region: usize, order: u32, page: PageId) {
        let (prev, next) = match inner.pages[page.index()].state {
            PageState::Free {
                list_prev,
                list_next,
                ..
            } => (list_prev, list_next),
            _ => panic!("unlink_free called on a non-free page"),
        };

        match prev {
            Some(p) => {
                if let PageState::Free { list_next, .. } = &mut inner.pages[p.index()].state {
                    *list_next = next;
                }
            }
            None => {
                inner.regions[region].free_lists[order as usize] = next;
                if next.is_none() {
                    inner.regions[region].non_empty_bitmap &= !(1 << order);
                }
            }
        }
        if let Some(n) = next {
            if let PageState::Free { list_prev, .. } = &mut inner.pages[n.index()].state {
                *list_prev = prev;
            }
        }
    }
}

impl Default for Pmm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(base: u64, pages: u64) -> PhysExtent {
        PhysExtent::new(
            PhysAddress::from_raw(base),
            Length::from_raw(pages * PAGE_SIZE.as_raw()),
        )
    }

    #[test]
    fn alloc_and_free_round_trips_to_same_bucket() {
        let pmm = Pmm::new();
        pmm.add_range(extent(0x10000, 16));

        let head = pmm.alloc_pages(4, Policy::Below4GB).unwrap();
        pmm.free_page(head);

        // The whole 16-page run should have recoalesced back into one Free
        // run at the original base.
        let base = PhysAddress::from_raw(0x10000);
        let id = pmm.find_page(base).unwrap();
        match pmm.inner.lock().pages[id.index()].state {
            PageState::Free { size_pages, .. } => assert_eq!(size_pages, 16),
            other => panic!("expected Free, got {other:?}"),
        }
    }

    #[test]
    fn disjoint_arrays_never_coalesce() {
        let pmm = Pmm::new();
        pmm.add_range(extent(0x0000, 4));
        pmm.add_range(extent(0x10000, 16));

        let a = pmm.alloc_pages(1, Policy::Below4GB).unwrap();
        pmm.free_page(a);

        let low_id = pmm.find_page(PhysAddress::from_raw(0x0000)).unwrap();
        match pmm.inner.lock().pages[low_id.index()].state {
            PageState::Free { size_pages, .. } => assert_eq!(size_pages, 4),
            other => panic!("expected Free, got {other:?}"),
        }
    }

    #[test]
    fn find_page_locates_interior_frame() {
        let pmm = Pmm::new();
        pmm.add_range(extent(0x10000, 16));
        let id = pmm
            .find_page(PhysAddress::from_raw(0x10000 + 3 * PAGE_SIZE.as_raw()))
            .unwrap();
        assert!(id.0 > 0);
    }

    #[test]
    fn out_of_memory_when_region_exhausted() {
        let pmm = Pmm::new();
        pmm.add_range(extent(0x10000, 4));
        assert_eq!(pmm.alloc_pages(5, Policy::Below4GB), Err(Error::OutOfMemory));
    }

    #[test]
    fn kernel_fast_path_round_trips_and_frees_immediately() {
        let pmm = Pmm::new();
        pmm.add_range(extent(0x10000, 16));

        let phys = pmm.get_memory_for_kernel(4).unwrap();
        assert_eq!(phys, PhysAddress::from_raw(0x10000));

        // Unlike release_page, this must not need an RCU grace period: the
        // run should be back in the free list the instant the call returns.
        pmm.free_memory_for_kernel(phys, 4);
        let id = pmm.find_page(phys).unwrap();
        match pmm.inner.lock().pages[id.index()].state {
            PageState::Free { size_pages, .. } => assert_eq!(size_pages, 16),
            other => panic!("expected Free, got {other:?}"),
        }
    }

    #[test]
    fn kernel_fast_path_out_of_memory_when_exhausted() {
        let pmm = Pmm::new();
        pmm.add_range(extent(0x1000, 2));
        assert_eq!(pmm.get_memory_for_kernel(4), Err(Error::OutOfMemory));
    }
}

impl core::fmt::Debug for PageState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PageState::Free { size_pages, .. } => {
                write!(f, "Free {{ size_pages: {size_pages} }}")
            }
            PageState::Allocated {
                refcount,
                anonymous,
                ..
            } => write!(
                f,
                "Allocated {{ refcount: {refcount}, anonymous: {anonymous} }}"
            ),
            PageState::AllocatedPending { size_pages, .. } => {
                write!(f, "AllocatedPending {{ size_pages: {size_pages} }}")
            }
            PageState::PendingFree { pages_to_free, .. } => {
                write!(f, "PendingFree {{ pages_to_free: {pages_to_free} }}")
            }
            PageState::Reserved => write!(f, "Reserved"),
        }
    }
}
