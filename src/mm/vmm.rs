//! Kernel virtual memory arena: a boundary-tag allocator over the kernel's
//! own address space, used to hand out virtual ranges before a page table
//! entry exists for them (the caller maps pages into the returned range
//! afterwards).
//!
//! Segments are tracked by `BoundaryTag`s kept in a single growable arena and
//! referenced by index rather than pointer, so the arena can be extended
//! (via `ensure_tags`) without invalidating any tag a caller currently holds.
//! Free tags are chained into per-order free lists; allocated tags are
//! chained into an open-addressing-by-chaining hash table keyed by base
//! address. Both chains and the address-ordered segment list reuse the same
//! `seg_prev`/`seg_next`/`list_next` index fields every C++ boundary-tag
//! allocator reuses for the same reason: one tag, three intrusive roles,
//! never all three used by an op at once.

use alloc::vec::Vec;

use shared::memory::addr::{Length, VirtAddress};
use shared::memory::page::PAGE_SIZE;
use spin::Mutex;

use super::error::{Error, Result};

pub const ORDER_COUNT: usize = 48;
const INITIAL_HASH_BUCKETS: usize = 16;
const TAG_REFILL_BATCH: usize = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Policy {
    InstantFit,
    BestFit,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TagState {
    Free,
    Allocated,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct TagId(u32);

impl TagId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

struct BoundaryTag {
    base: VirtAddress,
    size_pages: u64,
    state: TagState,
    seg_prev: Option<TagId>,
    seg_next: Option<TagId>,
    list_prev: Option<TagId>,
    list_next: Option<TagId>,
    hash_next: Option<TagId>,
}

impl BoundaryTag {
    fn end(&self) -> VirtAddress {
        self.base + Length::from_raw(self.size_pages * PAGE_SIZE.as_raw())
    }
}

fn order_for(size_pages: u64) -> usize {
    if size_pages == 0 {
        return 0;
    }
    ((63 - size_pages.leading_zeros()) as usize).min(ORDER_COUNT - 1)
}

/// Smallest order `k` such that every tag of that order (or larger) is
/// guaranteed to hold at least `size_pages` pages.
fn guaranteed_order(size_pages: u64) -> usize {
    order_for(size_pages.next_power_of_two())
}

pub struct Vmm {
    inner: Mutex<VmmInner>,
}

struct VmmInner {
    tags: Vec<BoundaryTag>,
    spare_tags: Vec<TagId>,
    free_lists: [Option<TagId>; ORDER_COUNT],
    non_empty_bitmap: u64,
    hash_buckets: Vec<Option<TagId>>,
    hash_count: usize,
}

impl Vmm {
    pub fn new() -> Self {
        Vmm {
            inner: Mutex::new(VmmInner {
                tags: Vec::new(),
                spare_tags: Vec::new(),
                free_lists: [None; ORDER_COUNT],
                non_empty_bitmap: 0,
                hash_buckets: alloc::vec![None; INITIAL_HASH_BUCKETS],
                hash_count: 0,
            }),
        }
    }

    /// Donates one contiguous range of virtual addresses to the arena. Used
    /// once at boot to hand the arena the span of kernel address space it is
    /// to manage.
    pub fn add_range(&self, base: VirtAddress, size_pages: u64) {
        if size_pages == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        Self::ensure_tags(&mut inner, 1);
        let id = Self::take_free_tag(&mut inner);
        inner.tags[id.index()] = BoundaryTag {
            base,
            size_pages,
            state: TagState::Free,
            seg_prev: None,
            seg_next: None,
            list_prev: None,
            list_next: None,
            hash_next: None,
        };
        Self::add_to_free_list(&mut inner, id);
    }

    /// Allocates `npages` contiguous pages of kernel virtual address space.
    /// Returns the base of the new segment; the caller is responsible for
    /// mapping physical pages into it.
    pub fn alloc(&self, npages: u64, policy: Policy) -> Result<VirtAddress> {
        assert!(npages > 0);
        let mut inner = self.inner.lock();
        Self::ensure_tags(&mut inner, 1);

        let chosen = match policy {
            Policy::BestFit => Self::best_fit_in_exact_bucket(&inner, npages)
                .or_else(|| Self::first_fit_from(&inner, guaranteed_order(npages))),
            Policy::InstantFit => Self::first_fit_from(&inner, guaranteed_order(npages)),
        };
        let tag_id = chosen.ok_or(Error::OutOfMemory)?;
        Self::unlink_free(&mut inner, tag_id);
        Ok(Self::carve_allocation(&mut inner, tag_id, npages))
    }

    /// Like `alloc`, but the returned base is aligned to `2^log2_align`
    /// pages. May split off a leading free remainder in addition to the
    /// usual trailing one, so up to two spare tags are needed.
    pub fn alloc_aligned(&self, npages: u64, log2_align: u32) -> Result<VirtAddress> {
        assert!(npages > 0);
        let mut inner = self.inner.lock();
        Self::ensure_tags(&mut inner, 2);

        let align_mask_pages = (1u64 << log2_align) - 1;
        let low_order = order_for(npages);
        let mut found = None;
        'search: for order in low_order..ORDER_COUNT {
            if inner.non_empty_bitmap & (1 << order) == 0 {
                continue;
            }
            let mut cursor = inner.free_lists[order];
            while let Some(id) = cursor {
                let tag = &inner.tags[id.index()];
                let base_pages = tag.base.as_raw() / PAGE_SIZE.as_raw();
                let aligned_base_pages = (base_pages + align_mask_pages) & !align_mask_pages;
                let aligned_base =
                    VirtAddress::from_raw(aligned_base_pages * PAGE_SIZE.as_raw());
                let needed_end =
                    aligned_base + Length::from_raw(npages * PAGE_SIZE.as_raw());
                if needed_end <= tag.end() {
                    found = Some((id, aligned_base));
                    break 'search;
                }
                cursor = tag.list_next;
            }
        }

        let (tag_id, aligned_base) = found.ok_or(Error::OutOfMemory)?;
        Self::unlink_free(&mut inner, tag_id);

        let old_base = inner.tags[tag_id.index()].base;
        let old_end = inner.tags[tag_id.index()].end();

        if aligned_base > old_base {
            // Misaligned leading remainder: split it off as its own free
            // segment before the allocation.
            let lead_pages = (aligned_base.as_raw() - old_base.as_raw()) / PAGE_SIZE.as_raw();
            let lead_id = Self::take_free_tag(&mut inner);
            inner.tags[lead_id.index()] = BoundaryTag {
                base: old_base,
                size_pages: lead_pages,
                state: TagState::Free,
                seg_prev: None,
                seg_next: None,
                list_prev: None,
                list_next: None,
                hash_next: None,
            };
            Self::splice_before(&mut inner, tag_id, lead_id);
            Self::add_to_free_list(&mut inner, lead_id);
        }

        inner.tags[tag_id.index()].base = aligned_base;
        let remaining_pages = (old_end.as_raw() - aligned_base.as_raw()) / PAGE_SIZE.as_raw();
        inner.tags[tag_id.index()].size_pages = remaining_pages;

        Ok(Self::carve_allocation(&mut inner, tag_id, npages))
    }

    /// Returns a segment previously handed out by `alloc`/`alloc_aligned`.
    /// `npages` must match what was allocated; mismatch is a contract
    /// violation, not a recoverable error.
    pub fn free(&self, virt: VirtAddress, npages: u64) {
        let mut inner = self.inner.lock();
        let tag_id = Self::find_hash(&inner, virt).expect("free: no such allocation");
        {
            let tag = &inner.tags[tag_id.index()];
            assert_eq!(tag.state, TagState::Allocated);
            assert_eq!(tag.size_pages, npages, "free: size does not match allocation");
        }
        Self::remove_hash(&mut inner, tag_id);
        inner.tags[tag_id.index()].state = TagState::Free;

        let head = tag_id;
        if let Some(prev) = inner.tags[tag_id.index()].seg_prev {
            if inner.tags[prev.index()].state == TagState::Free {
                Self::unlink_free(&mut inner, prev);
                let prev_size = inner.tags[prev.index()].size_pages;
                let prev_base = inner.tags[prev.index()].base;
                inner.tags[head.index()].base = prev_base;
                inner.tags[head.index()].size_pages += prev_size;
                Self::unsplice(&mut inner, prev);
                Self::return_tag(&mut inner, prev);
            }
        }
        if let Some(next) = inner.tags[head.index()].seg_next {
            if inner.tags[next.index()].state == TagState::Free {
                Self::unlink_free(&mut inner, next);
                let next_size = inner.tags[next.index()].size_pages;
                inner.tags[head.index()].size_pages += next_size;
                Self::unsplice(&mut inner, next);
                Self::return_tag(&mut inner, next);
            }
        }

        Self::add_to_free_list(&mut inner, head);
    }

    fn carve_allocation(inner: &mut VmmInner, tag_id: TagId, npages: u64) -> VirtAddress {
        let tag_size = inner.tags[tag_id.index()].size_pages;
        let base = inner.tags[tag_id.index()].base;

        if tag_size > npages {
            let remainder_id = Self::take_free_tag(inner);
            let remainder_base = base + Length::from_raw(npages * PAGE_SIZE.as_raw());
            inner.tags[remainder_id.index()] = BoundaryTag {
                base: remainder_base,
                size_pages: tag_size - npages,
                state: TagState::Free,
                seg_prev: None,
                seg_next: None,
                list_prev: None,
                list_next: None,
                hash_next: None,
            };
            Self::splice_after(inner, tag_id, remainder_id);
            Self::add_to_free_list(inner, remainder_id);
            inner.tags[tag_id.index()].size_pages = npages;
        }

        inner.tags[tag_id.index()].state = TagState::Allocated;
        Self::insert_hash(inner, tag_id);
        base
    }

    fn best_fit_in_exact_bucket(inner: &VmmInner, npages: u64) -> Option<TagId> {
        let order = order_for(npages);
        if inner.non_empty_bitmap & (1 << order) == 0 {
            return None;
        }
        let mut cursor = inner.free_lists[order];
        let mut best: Option<TagId> = None;
        while let Some(id) = cursor {
            let tag = &inner.tags[id.index()];
            if tag.size_pages >= npages {
                if tag.size_pages == npages {
                    return Some(id);
                }
                if best.map_or(true, |b| tag.size_pages < inner.tags[b.index()].size_pages) {
                    best = Some(id);
                }
            }
            cursor = tag.list_next;
        }
        best
    }

    fn first_fit_from(inner: &VmmInner, min_order: usize) -> Option<TagId> {
        let mask = !0u64 << min_order;
        let candidates = inner.non_empty_bitmap & mask;
        if candidates == 0 {
            return None;
        }
        let order = candidates.trailing_zeros() as usize;
        inner.free_lists[order]
    }

    fn ensure_tags(inner: &mut VmmInner, count: usize) {
        while inner.spare_tags.len() < count {
            let start = inner.tags.len();
            for _ in 0..TAG_REFILL_BATCH {
                inner.tags.push(BoundaryTag {
                    base: VirtAddress::zero(),
                    size_pages: 0,
                    state: TagState::Free,
                    seg_prev: None,
                    seg_next: None,
                    list_prev: None,
                    list_next: None,
                    hash_next: None,
                });
            }
            for i in 0..TAG_REFILL_BATCH {
                inner.spare_tags.push(TagId((start + i) as u32));
            }
        }
    }

    fn take_free_tag(inner: &mut VmmInner) -> TagId {
        inner
            .spare_tags
            .pop()
            .expect("ensure_tags should have been called before take_free_tag")
    }

    fn return_tag(inner: &mut VmmInner, id: TagId) {
        inner.spare_tags.push(id);
    }

    fn add_to_free_list(inner: &mut VmmInner, id: TagId) {
        let order = order_for(inner.tags[id.index()].size_pages);
        let old_head = inner.free_lists[order];
        inner.tags[id.index()].list_prev = None;
        inner.tags[id.index()].list_next = old_head;
        if let Some(head) = old_head {
            inner.tags[head.index()].list_prev = Some(id);
        }
        inner.free_lists[order] = Some(id);
        inner.non_empty_bitmap |= 1 << order;
    }

    fn unlink_free(inner: &mut VmmInner, id: TagId) {
        let order = order_for(inner.tags[id.index()].size_pages);
        let prev = inner.tags[id.index()].list_prev;
        let next = inner.tags[id.index()].list_next;
        match prev {
            Some(p) => inner.tags[p.index()].list_next = next,
            None => {
                inner.free_lists[order] = next;
                if next.is_none() {
                    inner.non_empty_bitmap &= !(1 << order);
                }
            }
        }
        if let Some(n) = next {
            inner.tags[n.index()].list_prev = prev;
        }
    }

    /// Splices `new_id` into the address-ordered segment chain immediately
    /// after `after_id`.
    fn splice_after(inner: &mut VmmInner, after_id: TagId, new_id: TagId) {
        let next = inner.tags[after_id.index()].seg_next;
        inner.tags[new_id.index()].seg_prev = Some(after_id);
        inner.tags[new_id.index()].seg_next = next;
        inner.tags[after_id.index()].seg_next = Some(new_id);
        if let Some(n) = next {
            inner.tags[n.index()].seg_prev = Some(new_id);
        }
    }

    /// Splices `new_id` into the address-ordered segment chain immediately
    /// before `before_id`.
    fn splice_before(inner: &mut VmmInner, before_id: TagId, new_id: TagId) {
        let prev = inner.tags[before_id.index()].seg_prev;
        inner.tags[new_id.index()].seg_next = Some(before_id);
        inner.tags[new_id.index()].seg_prev = prev;
        inner.tags[before_id.index()].seg_prev = Some(new_id);
        if let Some(p) = prev {
            inner.tags[p.index()].seg_next = Some(new_id);
        }
    }

    fn unsplice(inner: &mut VmmInner, id: TagId) {
        let prev = inner.tags[id.index()].seg_prev;
        let next = inner.tags[id.index()].seg_next;
        if let Some(p) = prev {
            inner.tags[p.index()].seg_next = next;
        }
        if let Some(n) = next {
            inner.tags[n.index()].seg_prev = prev;
        }
        inner.tags[id.index()].seg_prev = None;
        inner.tags[id.index()].seg_next = None;
    }

    fn hash_index(buckets_len: usize, base: VirtAddress) -> usize {
        ((base.as_raw() >> 12) as usize) & (buckets_len - 1)
    }

    fn insert_hash(inner: &mut VmmInner, id: TagId) {
        if (inner.hash_count + 1) * 4 > inner.hash_buckets.len() * 3 {
            Self::resize_hash(inner, inner.hash_buckets.len() * 2);
        }
        let idx = Self::hash_index(inner.hash_buckets.len(), inner.tags[id.index()].base);
        inner.tags[id.index()].hash_next = inner.hash_buckets[idx];
        inner.hash_buckets[idx] = Some(id);
        inner.hash_count += 1;
    }

    fn remove_hash(inner: &mut VmmInner, id: TagId) {
        let idx = Self::hash_index(inner.hash_buckets.len(), inner.tags[id.index()].base);
        let mut cursor = inner.hash_buckets[idx];
        let mut prev: Option<TagId> = None;
        while let Some(cur) = cursor {
            if cur == id {
                let next = inner.tags[cur.index()].hash_next;
                match prev {
                    Some(p) => inner.tags[p.index()].hash_next = next,
                    None => inner.hash_buckets[idx] = next,
                }
                inner.tags[cur.index()].hash_next = None;
                inner.hash_count -= 1;
                if inner.hash_buckets.len() > INITIAL_HASH_BUCKETS
                    && inner.hash_count * 4 < inner.hash_buckets.len()
                {
                    Self::resize_hash(inner, inner.hash_buckets.len() / 2);
                }
                return;
            }
            prev = Some(cur);
            cursor = inner.tags[cur.index()].hash_next;
        }
    }

    fn find_hash(inner: &VmmInner, base: VirtAddress) -> Option<TagId> {
        let idx = Self::hash_index(inner.hash_buckets.len(), base);
        let mut cursor = inner.hash_buckets[idx];
        while let Some(id) = cursor {
            if inner.tags[id.index()].base == base {
                return Some(id);
            }
            cursor = inner.tags[id.index()].hash_next;
        }
        None
    }

    fn resize_hash(inner: &mut VmmInner, new_len: usize) {
        let new_len = new_len.max(INITIAL_HASH_BUCKETS);
        let mut new_buckets: Vec<Option<TagId>> = alloc::vec![None; new_len];
        for bucket in inner.hash_buckets.iter() {
            let mut cursor = *bucket;
            while let Some(id) = cursor {
                let next = inner.tags[id.index()].hash_next;
                let idx = Self::hash_index(new_len, inner.tags[id.index()].base);
                inner.tags[id.index()].hash_next = new_buckets[idx];
                new_buckets[idx] = Some(id);
                cursor = next;
            }
        }
        inner.hash_buckets = new_buckets;
    }
}

impl Default for Vmm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(p: u64) -> VirtAddress {
        VirtAddress::from_raw(0xffff_8000_0000_0000 + p * PAGE_SIZE.as_raw())
    }

    #[test]
    fn alloc_and_free_round_trips_to_one_free_segment() {
        let vmm = Vmm::new();
        vmm.add_range(base(0), 64);

        let a = vmm.alloc(4, Policy::InstantFit).unwrap();
        assert_eq!(a, base(0));
        vmm.free(a, 4);

        // After freeing the only allocation, a fresh alloc of the whole
        // range should succeed, proving the segment recoalesced.
        let whole = vmm.alloc(64, Policy::InstantFit).unwrap();
        assert_eq!(whole, base(0));
    }

    #[test]
    fn split_leaves_remainder_allocatable() {
        let vmm = Vmm::new();
        vmm.add_range(base(0), 16);

        let a = vmm.alloc(4, Policy::InstantFit).unwrap();
        let b = vmm.alloc(4, Policy::InstantFit).unwrap();
        assert_ne!(a, b);
        assert_eq!(b, base(4));
    }

    #[test]
    fn alloc_aligned_respects_alignment() {
        let vmm = Vmm::new();
        vmm.add_range(base(1), 31); // deliberately offset so base(1) misaligns order-3.

        let virt = vmm.alloc_aligned(4, 2).unwrap(); // align to 4 pages
        let pages = (virt.as_raw() - base(0).as_raw()) / PAGE_SIZE.as_raw();
        assert_eq!(pages % 4, 0);
    }

    #[test]
    fn out_of_memory_when_arena_exhausted() {
        let vmm = Vmm::new();
        vmm.add_range(base(0), 4);
        assert_eq!(vmm.alloc(8, Policy::InstantFit), Err(Error::OutOfMemory));
    }

    #[test]
    fn best_fit_prefers_exact_match_over_larger_free_run() {
        let vmm = Vmm::new();
        vmm.add_range(base(0), 4);
        vmm.add_range(base(100), 64);

        let exact = vmm.alloc(4, Policy::BestFit).unwrap();
        assert_eq!(exact, base(0), "best fit should have consumed the exact-size run first");
    }

    #[test]
    fn tag_refill_survives_many_small_allocations() {
        // Enough 1-page allocations to force ensure_tags to refill its spare
        // pool several times over (TAG_REFILL_BATCH is 64): each alloc splits
        // a tag and frees a remainder, consuming two spares net one.
        let vmm = Vmm::new();
        vmm.add_range(base(0), 4096);

        let mut handles = Vec::new();
        for _ in 0..300 {
            handles.push(vmm.alloc(1, Policy::InstantFit).unwrap());
        }
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(*h, base(i as u64));
        }
        for h in handles {
            vmm.free(h, 1);
        }

        // Everything should have recoalesced back into the one original run.
        let whole = vmm.alloc(4096, Policy::InstantFit).unwrap();
        assert_eq!(whole, base(0));
    }
}
