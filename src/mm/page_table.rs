//! Page Table: one process's (or the kernel's) container of memory regions,
//! the hardware root those regions are realized into, and the set of CPUs
//! currently running with it. Resolves faults, installs and tears down
//! regions, and drives TLB shootdown when a change needs to be seen by other
//! CPUs before it returns.
//!
//! Walking and mutating the actual hardware tables is architecture-specific
//! and lives behind `ArchPageTableBackend`; this module only ever decides
//! *what* should be mapped, never *how*.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use shared::memory::addr::{Length, PhysAddress, VirtAddress};
use shared::memory::page::PAGE_SIZE;
use spin::Mutex;

use super::error::{Error, FaultOutcome, Result};
use super::mem_object::{MemObject, PinnedPageTable};
use super::pmm::Pmm;
use super::region::{Access, AllocOutcome, CowResolver, ExistingMapping, PageTableArgs, Region};
use super::shootdown::{ActiveCpus, ShootdownBackend, TlbShootdownContext};

/// What the arch backend reports about a virtual address's current hardware
/// mapping, enough for `handle_fault` to decide whether it's already
/// sufficient or needs routing through the owning region.
#[derive(Clone, Copy, Debug)]
pub struct HardwareMapping {
    pub access: Access,
    /// Set when the existing mapping is a private, writeable copy of a page
    /// still backed (read-only, shared) by the region's object — i.e. a COW
    /// page that hasn't been broken yet. Which object page it corresponds to
    /// is recomputed by the region from the fault address, not reported here.
    pub is_anonymous_cow: bool,
}

/// Collaborator providing the actual hardware page-table walk, map, unmap,
/// and local TLB invalidation. Implemented per architecture, outside this
/// subsystem.
pub trait ArchPageTableBackend: Send + Sync {
    fn map(&self, virt: VirtAddress, args: PageTableArgs) -> Result<()>;
    fn unmap(&self, virt: VirtAddress) -> Option<PhysAddress>;
    fn mapping(&self, virt: VirtAddress) -> Option<HardwareMapping>;
    fn invalidate_local(&self, virt: VirtAddress);
    fn user_addr_max(&self) -> VirtAddress;
}

struct PinnedObject {
    object: Arc<MemObject>,
    handle_count: u32,
}

struct PageTableInner {
    /// Keyed by `start_addr.as_raw()`; stands in for the red-black tree the
    /// original keeps, with the same "largest key not exceeding the fault
    /// address" lookup.
    regions: BTreeMap<u64, Region>,
    /// Object id -> region start addresses referencing it, so
    /// `atomic_shrink_regions` doesn't need to scan every region.
    object_regions: BTreeMap<u64, Vec<u64>>,
    mem_objects: BTreeMap<u64, PinnedObject>,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static TABLES: Mutex<BTreeMap<u64, Weak<PageTable>>> = Mutex::new(BTreeMap::new());
static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

pub struct PageTable {
    id: u64,
    inner: Mutex<PageTableInner>,
    active: ActiveCpus,
}

impl PageTable {
    pub fn new() -> Arc<PageTable> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let table = Arc::new(PageTable {
            id,
            inner: Mutex::new(PageTableInner {
                regions: BTreeMap::new(),
                object_regions: BTreeMap::new(),
                mem_objects: BTreeMap::new(),
            }),
            active: ActiveCpus::new(),
        });
        TABLES.lock().insert(id, Arc::downgrade(&table));
        table
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn get(id: u64) -> Option<Arc<PageTable>> {
        TABLES.lock().get(&id).and_then(Weak::upgrade)
    }

    pub fn apply_cpu(&self, cpu_id: usize) {
        self.active.apply_cpu(cpu_id);
    }

    pub fn unapply_cpu(&self, cpu_id: usize) {
        self.active.unapply_cpu(cpu_id);
    }

    /// Fault resolution entry point. Looks up the region covering `virt`,
    /// checks it against the hardware's current view, and either resolves
    /// directly (stale-but-adequate mapping) or delegates to the region.
    pub fn handle_fault(
        &self,
        backend: &dyn ArchPageTableBackend,
        pmm: &Pmm,
        resolver: &dyn CowResolver,
        virt: VirtAddress,
        access: Access,
    ) -> FaultOutcome {
        let mut inner = self.inner.lock();
        let Some(region) = Self::find_region_mut(&mut inner.regions, virt) else {
            return FaultOutcome::Fatal(Error::NotFound);
        };
        if !region.access().contains(access) {
            return FaultOutcome::Fatal(Error::Permission);
        }

        let hw = backend.mapping(virt);
        if let Some(hw) = hw {
            if hw.access.contains(access) {
                backend.invalidate_local(virt);
                return FaultOutcome::Ok;
            }
        }

        let existing = if hw.is_some_and(|h| h.is_anonymous_cow) {
            ExistingMapping::AnonymousCow
        } else {
            ExistingMapping::None
        };

        match region.alloc_page(pmm, resolver, virt, existing, access) {
            Ok(AllocOutcome::Ok(args)) => match backend.map(virt, args) {
                Ok(()) => FaultOutcome::Ok,
                Err(e) => FaultOutcome::Fatal(e),
            },
            Ok(AllocOutcome::Deferred) => FaultOutcome::Deferred,
            Err(e) => FaultOutcome::Fatal(e),
        }
    }

    /// Finds a spot of `size` honoring `hint` if it's free, erroring on
    /// `fixed` if not, else linearly scanning for the first large-enough gap
    /// below `user_addr_max`.
    pub fn find_region_spot(
        &self,
        backend: &dyn ArchPageTableBackend,
        hint: VirtAddress,
        size: Length,
        fixed: bool,
    ) -> Result<VirtAddress> {
        let inner = self.inner.lock();
        Self::find_region_spot_locked(&inner, backend.user_addr_max(), hint, size, fixed)
    }

    fn find_region_spot_locked(
        inner: &PageTableInner,
        user_addr_max: VirtAddress,
        hint: VirtAddress,
        size: Length,
        fixed: bool,
    ) -> Result<VirtAddress> {
        if hint.as_raw() != 0 && Self::range_is_free(inner, hint, size) {
            return Ok(hint);
        }
        if fixed {
            return Err(Error::Exists);
        }

        let mut candidate = VirtAddress::from_raw(PAGE_SIZE.as_raw());
        for (&start, region) in inner.regions.iter() {
            let region_start = VirtAddress::from_raw(start);
            if candidate + size <= region_start {
                return Ok(candidate);
            }
            let region_end = region_start + region.size();
            if region_end > candidate {
                candidate = region_end;
            }
        }
        if candidate + size <= user_addr_max {
            Ok(candidate)
        } else {
            Err(Error::OutOfMemory)
        }
    }

    fn range_is_free(inner: &PageTableInner, start: VirtAddress, size: Length) -> bool {
        let end = start + size;
        for (&other_start, region) in inner.regions.iter() {
            let other_start = VirtAddress::from_raw(other_start);
            let other_end = other_start + region.size();
            if start < other_end && other_start < end {
                return false;
            }
        }
        true
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_normal_region(
        &self,
        backend: &dyn ArchPageTableBackend,
        hint: VirtAddress,
        size: Length,
        access: Access,
        fixed: bool,
        dma: bool,
        name: String,
    ) -> Result<VirtAddress> {
        let mut inner = self.inner.lock();
        let start = Self::find_region_spot_locked(&inner, backend.user_addr_max(), hint, size, fixed)?;

        let size_pages = size.as_raw() / PAGE_SIZE.as_raw();
        let flags = super::mem_object::FLAG_ANONYMOUS | if dma { super::mem_object::FLAG_DMA } else { 0 };
        let object = MemObject::create(12, size_pages, flags);
        let region_id = NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed);
        let region = Region::new_object_ref(
            start,
            size,
            access,
            name,
            region_id,
            object.clone(),
            0,
            true,
            0,
            size.as_raw(),
        );

        Self::install_region(&mut inner, region, Some(object.id()));
        Self::pin_object_locked(&mut inner, object);
        Ok(start)
    }

    pub fn create_phys_region(
        &self,
        backend: &dyn ArchPageTableBackend,
        hint: VirtAddress,
        size: Length,
        access: Access,
        fixed: bool,
        name: String,
        phys_addr_start: PhysAddress,
        phys_addr_limit: PhysAddress,
    ) -> Result<VirtAddress> {
        if phys_addr_start + size > phys_addr_limit {
            return Err(Error::Invalid);
        }
        let mut inner = self.inner.lock();
        let start = Self::find_region_spot_locked(&inner, backend.user_addr_max(), hint, size, fixed)?;
        let region_id = NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed);
        let region = Region::new_phys_mapped(start, size, access, name, region_id, phys_addr_start);
        Self::install_region(&mut inner, region, None);
        Ok(start)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_mem_object_region(
        &self,
        backend: &dyn ArchPageTableBackend,
        hint: VirtAddress,
        size: Length,
        access: Access,
        fixed: bool,
        name: String,
        object: Arc<MemObject>,
        cow: bool,
        start_offset_bytes: u64,
        object_offset_bytes: u64,
        object_size_bytes: u64,
    ) -> Result<VirtAddress> {
        if !cow && (start_offset_bytes != 0 || object_size_bytes != size.as_raw()) {
            return Err(Error::Invalid);
        }
        let page_size = PAGE_SIZE.as_raw();
        if start_offset_bytes % page_size != 0 || object_offset_bytes % page_size != 0 {
            return Err(Error::Invalid);
        }

        let mut inner = self.inner.lock();
        let start = Self::find_region_spot_locked(&inner, backend.user_addr_max(), hint, size, fixed)?;
        let region_id = NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed);
        let object_id = object.id();
        let region = Region::new_object_ref(
            start,
            size,
            access,
            name,
            region_id,
            object.clone(),
            object_offset_bytes,
            cow,
            start_offset_bytes,
            object_size_bytes,
        );
        Self::install_region(&mut inner, region, Some(object_id));
        Self::pin_object_locked(&mut inner, object);
        Ok(start)
    }

    fn install_region(inner: &mut PageTableInner, region: Region, object_id: Option<u64>) {
        let start = region.start_addr().as_raw();
        inner.regions.insert(start, region);
        if let Some(object_id) = object_id {
            inner.object_regions.entry(object_id).or_default().push(start);
        }
    }

    fn pin_object_locked(inner: &mut PageTableInner, object: Arc<MemObject>) {
        let id = object.id();
        match inner.mem_objects.get_mut(&id) {
            Some(pinned) => pinned.handle_count += 1,
            None => {
                inner.mem_objects.insert(id, PinnedObject { object, handle_count: 1 });
            }
        }
    }

    pub fn atomic_pin_memory_object(self: &Arc<Self>, object: Arc<MemObject>) {
        let mut inner = self.inner.lock();
        Self::pin_object_locked(&mut inner, object.clone());
        let weak_self: Weak<dyn PinnedPageTable> = Arc::downgrade(self) as Weak<dyn PinnedPageTable>;
        object.register_pinned(weak_self);
    }

    pub fn atomic_unpin_memory_object(self: &Arc<Self>, object: &Arc<MemObject>) {
        let mut inner = self.inner.lock();
        let id = object.id();
        let drop_entirely = match inner.mem_objects.get_mut(&id) {
            Some(pinned) => {
                pinned.handle_count -= 1;
                pinned.handle_count == 0
            }
            None => false,
        };
        if drop_entirely {
            inner.mem_objects.remove(&id);
            drop(inner);
            let weak_self: Weak<dyn PinnedPageTable> = Arc::downgrade(self) as Weak<dyn PinnedPageTable>;
            object.unregister_pinned(&weak_self);
        }
    }

    /// Clears `[start, start+size)`, splitting or trimming every region that
    /// overlaps it and recording the necessary invalidations into a shootdown
    /// context that is finalized once, after all structural edits are done.
    pub fn release_in_range(
        self: &Arc<Self>,
        backend: &dyn ArchPageTableBackend,
        shootdown_backend: &dyn ShootdownBackend,
        self_cpu: usize,
        start: VirtAddress,
        size: Length,
    ) {
        let end = start + size;
        let mut ctx = TlbShootdownContext::new();
        let mut released_objects = Vec::new();
        let mut inner = self.inner.lock();

        let overlapping: Vec<u64> = inner
            .regions
            .iter()
            .filter(|(&s, r)| {
                let region_start = VirtAddress::from_raw(s);
                let region_end = region_start + r.size();
                region_start < end && start < region_end
            })
            .map(|(&s, _)| s)
            .collect();

        for key in overlapping {
            let mut region = inner.regions.remove(&key).unwrap();
            let region_start = region.start_addr();
            let region_end = region_start + region.size();

            let hole_start = start.max(region_start);
            let hole_end = end.min(region_end);

            if hole_start <= region_start && hole_end >= region_end {
                // Fully covered: drop the region entirely.
                if let Some(object) = Self::drop_region_reference(&mut inner, region_start, region.object_id()) {
                    released_objects.push(object);
                }
                Self::invalidate_region_range(&mut ctx, region_start, region_end);
                continue;
            }

            if hole_start > region_start && hole_end < region_end {
                // Hole strictly inside: split into two regions. The lower
                // piece keeps the region's existing object reference; the
                // upper piece, covering the same object, needs its own.
                let hole_size = hole_end.distance_from(hole_start);
                let object_id = region.object_id();
                match region.punch_hole(hole_start, hole_size) {
                    Ok(upper) => {
                        Self::invalidate_region_range(&mut ctx, hole_start, hole_end);
                        Self::install_region(&mut inner, region, object_id);
                        Self::install_region(&mut inner, upper, object_id);
                        if let Some(id) = object_id {
                            if let Some(pinned) = inner.mem_objects.get_mut(&id) {
                                pinned.handle_count += 1;
                            }
                        }
                    }
                    Err(_) => {
                        // Punch failed validation; put the region back
                        // unchanged rather than lose it.
                        Self::install_region(&mut inner, region, object_id);
                    }
                }
                continue;
            }

            // Overlaps only one edge: trim down to the surviving side.
            let object_id = region.object_id();
            if hole_start <= region_start {
                Self::invalidate_region_range(&mut ctx, region_start, hole_end);
                let new_size = region_end.distance_from(hole_end);
                region.trim(hole_end, new_size);
            } else {
                Self::invalidate_region_range(&mut ctx, hole_start, region_end);
                let new_size = hole_start.distance_from(region_start);
                region.trim(region_start, new_size);
            }
            Self::install_region(&mut inner, region, object_id);
        }

        drop(inner);
        for page in 0..(size.as_raw() / PAGE_SIZE.as_raw()) {
            if let Some(phys) = backend.unmap(start + Length::from_raw(page * PAGE_SIZE.as_raw())) {
                let _ = phys;
            }
        }
        for object in released_objects {
            let weak_self: Weak<dyn PinnedPageTable> = Arc::downgrade(self) as Weak<dyn PinnedPageTable>;
            object.unregister_pinned(&weak_self);
        }
        self.active.finalize(ctx, shootdown_backend, self_cpu);
    }

    /// Removes `region_start` from `object_id`'s tracked region list and
    /// drops one reference to it; returns the object if this was the last
    /// one, so the caller can unregister as a pinning table once the lock is
    /// released.
    fn drop_region_reference(
        inner: &mut PageTableInner,
        region_start: VirtAddress,
        object_id: Option<u64>,
    ) -> Option<Arc<MemObject>> {
        let id = object_id?;
        if let Some(starts) = inner.object_regions.get_mut(&id) {
            starts.retain(|&s| s != region_start.as_raw());
        }
        let drop_entirely = match inner.mem_objects.get_mut(&id) {
            Some(pinned) => {
                pinned.handle_count -= 1;
                pinned.handle_count == 0
            }
            None => false,
        };
        if drop_entirely {
            inner.mem_objects.remove(&id).map(|p| p.object)
        } else {
            None
        }
    }

    fn invalidate_region_range(ctx: &mut TlbShootdownContext, start: VirtAddress, end: VirtAddress) {
        let size = end.distance_from(start);
        let npages = size.as_raw() / PAGE_SIZE.as_raw();
        if npages <= 1 {
            ctx.record_page(start);
        } else {
            ctx.record_range(start, size);
        }
    }

    /// Called by `MemObject::resize` (through the `PinnedPageTable` trait)
    /// when an object this table references shrinks: trims or drops every
    /// region whose window now extends past the object's new bound.
    fn shrink_regions_impl(&self, object_id: u64, new_size_bytes: u64) {
        let mut inner = self.inner.lock();
        let Some(starts) = inner.object_regions.get(&object_id).cloned() else {
            return;
        };

        let mut survivors = Vec::new();
        for start in starts {
            let Some(mut region) = inner.regions.remove(&start) else {
                continue;
            };
            let region_start = region.start_addr();
            let region_size = region.size();
            if region_start.as_raw() + region_size.as_raw() <= new_size_bytes {
                inner.regions.insert(start, region);
                survivors.push(start);
                continue;
            }
            let keep_bytes = new_size_bytes.saturating_sub(region_start.as_raw());
            if keep_bytes == 0 {
                continue;
            }
            let new_size = Length::from_raw(keep_bytes.min(region_size.as_raw()));
            region.trim(region_start, new_size);
            let new_key = region.start_addr().as_raw();
            inner.regions.insert(new_key, region);
            survivors.push(new_key);
        }
        inner.object_regions.insert(object_id, survivors);
    }

    /// Region lookup by the "largest start address not exceeding the fault
    /// address" rule the spec's RB-tree lookup implements.
    fn find_region_mut(regions: &mut BTreeMap<u64, Region>, virt: VirtAddress) -> Option<&mut Region> {
        let key = *regions.range(..=virt.as_raw()).next_back()?.0;
        let region = regions.get_mut(&key)?;
        if region.is_in_range(virt) {
            Some(region)
        } else {
            None
        }
    }

    /// Duplicates the region starting at `orig` into `to`, near `prefer`,
    /// with a freshly allocated region id and `access`. Both regions end up
    /// referencing the same backing (the same `Arc<MemObject>`, or the same
    /// physical range) independently; releasing one has no effect on the
    /// other. Locks `self` and `to` in id order to stay safe against a
    /// concurrent clone the other way.
    pub fn clone_region(
        self: &Arc<Self>,
        to: &Arc<PageTable>,
        to_backend: &dyn ArchPageTableBackend,
        orig: VirtAddress,
        prefer: VirtAddress,
        access: Access,
        fixed: bool,
    ) -> Result<VirtAddress> {
        if Arc::ptr_eq(self, to) {
            return Err(Error::Invalid);
        }

        let mut self_inner;
        let mut to_inner;
        if self.id < to.id {
            self_inner = self.inner.lock();
            to_inner = to.inner.lock();
        } else {
            to_inner = to.inner.lock();
            self_inner = self.inner.lock();
        }

        let source = self_inner.regions.get(&orig.as_raw()).ok_or(Error::NotFound)?;
        let size = source.size();
        let object_id = source.object_id();
        let object = object_id.and_then(|id| self_inner.mem_objects.get(&id).map(|p| p.object.clone()));

        let dest = Self::find_region_spot_locked(&to_inner, to_backend.user_addr_max(), prefer, size, fixed)?;
        let region_id = NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed);
        let cloned = self_inner.regions[&orig.as_raw()].clone_to(dest, access, region_id);

        Self::install_region(&mut to_inner, cloned, object_id);
        if let Some(object) = object.clone() {
            Self::pin_object_locked(&mut to_inner, object);
        }

        drop(self_inner);
        drop(to_inner);

        if let Some(object) = object {
            let weak_to: Weak<dyn PinnedPageTable> = Arc::downgrade(to) as Weak<dyn PinnedPageTable>;
            object.register_pinned(weak_to);
        }

        Ok(dest)
    }

    /// Atomically moves the region starting at `orig` from this table to
    /// `to`, near `prefer`, with `access`. Existing hardware mappings in the
    /// old range are torn down; the destination re-populates them lazily
    /// through its own fault handling. On failure (no room in `to`), this
    /// table is left completely unchanged — the remove and the reinsertion
    /// happen under one acquisition of both locks.
    pub fn transfer_region(
        self: &Arc<Self>,
        to: &Arc<PageTable>,
        backend: &dyn ArchPageTableBackend,
        to_backend: &dyn ArchPageTableBackend,
        orig: VirtAddress,
        prefer: VirtAddress,
        access: Access,
        fixed: bool,
    ) -> Result<VirtAddress> {
        if Arc::ptr_eq(self, to) {
            return Err(Error::Invalid);
        }

        let mut self_inner;
        let mut to_inner;
        if self.id < to.id {
            self_inner = self.inner.lock();
            to_inner = to.inner.lock();
        } else {
            to_inner = to.inner.lock();
            self_inner = self.inner.lock();
        }

        let mut region = self_inner.regions.remove(&orig.as_raw()).ok_or(Error::NotFound)?;
        let size = region.size();
        let object_id = region.object_id();
        let object = object_id.and_then(|id| self_inner.mem_objects.get(&id).map(|p| p.object.clone()));

        let dest = match Self::find_region_spot_locked(&to_inner, to_backend.user_addr_max(), prefer, size, fixed) {
            Ok(dest) => dest,
            Err(e) => {
                // Source must be unchanged on failure.
                self_inner.regions.insert(orig.as_raw(), region);
                return Err(e);
            }
        };

        region.retarget(dest);
        region.set_access(access);

        let released = Self::drop_region_reference(&mut self_inner, orig, object_id);
        Self::install_region(&mut to_inner, region, object_id);
        if let Some(object) = object.clone() {
            Self::pin_object_locked(&mut to_inner, object);
        }

        drop(self_inner);
        drop(to_inner);

        for page in 0..(size.as_raw() / PAGE_SIZE.as_raw()) {
            backend.unmap(orig + Length::from_raw(page * PAGE_SIZE.as_raw()));
        }

        if let Some(object) = &object {
            let weak_to: Weak<dyn PinnedPageTable> = Arc::downgrade(to) as Weak<dyn PinnedPageTable>;
            object.register_pinned(weak_to);
        }
        if let Some(object) = released {
            let weak_self: Weak<dyn PinnedPageTable> = Arc::downgrade(self) as Weak<dyn PinnedPageTable>;
            object.unregister_pinned(&weak_self);
        }

        Ok(dest)
    }

    /// Copies `size` bytes from kernel memory at `from` to `to` in this
    /// table's user address space, faulting pages in (and temporarily
    /// mapping them into kernel space to write through) as needed.
    pub fn copy_to_user(
        &self,
        backend: &dyn ArchPageTableBackend,
        pmm: &Pmm,
        resolver: &dyn CowResolver,
        mapper: &dyn super::temp_mapper::TempMapper,
        to: VirtAddress,
        from: &[u8],
    ) -> Result<bool> {
        let page_size = PAGE_SIZE.as_raw();
        let mut copied = 0usize;
        while copied < from.len() {
            let virt = to + Length::from_raw(copied as u64);
            let page_base = VirtAddress::from_raw(virt.as_raw() & !(page_size - 1));
            let in_page = (virt.as_raw() - page_base.as_raw()) as usize;
            let chunk = (page_size as usize - in_page).min(from.len() - copied);

            match self.handle_fault(backend, pmm, resolver, virt, Access::WRITEABLE) {
                FaultOutcome::Ok => {}
                FaultOutcome::Deferred => return Ok(false),
                FaultOutcome::Fatal(e) => return Err(e),
            }

            let hw = backend.mapping(page_base).ok_or(Error::Fault)?;
            let _ = hw;
            let phys = backend.unmap(page_base).ok_or(Error::Fault)?;
            // Re-establish the mapping we just peeked at: `unmap` is only
            // used here to recover the physical address backing the page.
            backend.map(
                page_base,
                PageTableArgs {
                    phys,
                    access: Access::READABLE | Access::WRITEABLE,
                    user: true,
                    cache: super::region::CachePolicy::WriteBack,
                    anonymous_cow: false,
                },
            )?;

            // SAFETY: `phys` backs a page this table just faulted in for
            // writing; the temp mapping is released before the next
            // iteration via `TempMapping`'s drop.
            unsafe {
                let mapping = super::temp_mapper::TempMapping::new(mapper, phys)?;
                let dst = mapping.as_ptr::<u8>().add(in_page);
                core::ptr::copy_nonoverlapping(from[copied..].as_ptr(), dst, chunk);
            }

            copied += chunk;
        }
        Ok(true)
    }
}

impl PinnedPageTable for PageTable {
    fn shrink_regions(&self, object_id: u64, new_size_bytes: u64) {
        self.shrink_regions_impl(object_id, new_size_bytes);
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        TABLES.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::memory::addr::PhysExtent;
    use shared::memory::page::PAGE_SIZE;
    use std::sync::Mutex as StdMutex;

    struct MockBackend {
        mappings: StdMutex<BTreeMap<u64, (PhysAddress, HardwareMapping)>>,
    }

    impl MockBackend {
        fn new() -> Self {
            MockBackend {
                mappings: StdMutex::new(BTreeMap::new()),
            }
        }
    }

    impl ArchPageTableBackend for MockBackend {
        fn map(&self, virt: VirtAddress, args: PageTableArgs) -> Result<()> {
            let hw = HardwareMapping {
                access: args.access,
                is_anonymous_cow: args.anonymous_cow,
            };
            self.mappings.lock().unwrap().insert(virt.as_raw(), (args.phys, hw));
            Ok(())
        }

        fn unmap(&self, virt: VirtAddress) -> Option<PhysAddress> {
            self.mappings.lock().unwrap().remove(&virt.as_raw()).map(|(phys, _)| phys)
        }

        fn mapping(&self, virt: VirtAddress) -> Option<HardwareMapping> {
            self.mappings.lock().unwrap().get(&virt.as_raw()).map(|(_, hw)| *hw)
        }

        fn invalidate_local(&self, _virt: VirtAddress) {}

        fn user_addr_max(&self) -> VirtAddress {
            VirtAddress::from_raw(0x0000_7fff_ffff_f000)
        }
    }

    struct NoShootdown;
    impl ShootdownBackend for NoShootdown {
        fn send_shootdown_ipi(&self, _cpu_id: usize) {}
        fn invalidate_local_page(&self, _virt: VirtAddress) {}
        fn invalidate_local_range(&self, _virt: VirtAddress, _size: Length) {}
        fn invalidate_local_all(&self) {}
        fn online_cpu_count(&self) -> usize {
            1
        }
    }

    struct NoCow;
    impl CowResolver for NoCow {
        fn resolve_anonymous_page(
            &self,
            _object: &MemObject,
            _pmm: &Pmm,
            _object_offset_pages: u64,
        ) -> Result<PageTableArgs> {
            unreachable!("these tests never leave a stale anonymous-COW mapping behind")
        }
    }

    fn pmm_with_range() -> Pmm {
        let pmm = Pmm::new();
        pmm.add_range(PhysExtent::new(
            PhysAddress::from_raw(0x10_0000),
            Length::from_raw(64 * PAGE_SIZE.as_raw()),
        ));
        pmm
    }

    #[test]
    fn two_regions_never_overlap() {
        let table = PageTable::new();
        let backend = MockBackend::new();

        let size = Length::from_raw(4 * PAGE_SIZE.as_raw());
        let a = table
            .create_normal_region(
                &backend,
                VirtAddress::from_raw(0),
                size,
                Access::READABLE | Access::WRITEABLE,
                false,
                false,
                String::from("a"),
            )
            .unwrap();
        let b = table
            .create_normal_region(
                &backend,
                VirtAddress::from_raw(0),
                size,
                Access::READABLE | Access::WRITEABLE,
                false,
                false,
                String::from("b"),
            )
            .unwrap();

        assert!(b >= a + size || a >= b + size);
    }

    #[test]
    fn fixed_hint_colliding_with_existing_region_fails() {
        let table = PageTable::new();
        let backend = MockBackend::new();
        let size = Length::from_raw(4 * PAGE_SIZE.as_raw());
        let hint = VirtAddress::from_raw(PAGE_SIZE.as_raw());

        table
            .create_normal_region(
                &backend,
                hint,
                size,
                Access::READABLE | Access::WRITEABLE,
                true,
                false,
                String::from("a"),
            )
            .unwrap();

        let result = table.create_normal_region(
            &backend,
            hint,
            size,
            Access::READABLE | Access::WRITEABLE,
            true,
            false,
            String::from("b"),
        );
        assert!(matches!(result, Err(Error::Exists)));
    }

    #[test]
    fn fault_outside_every_region_segfaults() {
        let table = PageTable::new();
        let backend = MockBackend::new();
        let pmm = pmm_with_range();
        let resolver = NoCow;

        let outcome = table.handle_fault(
            &backend,
            &pmm,
            &resolver,
            VirtAddress::from_raw(0x1234_0000),
            Access::READABLE,
        );
        assert!(matches!(outcome, FaultOutcome::Fatal(Error::NotFound)));
    }

    #[test]
    fn fault_inside_anonymous_region_maps_a_page() {
        let table = PageTable::new();
        let backend = MockBackend::new();
        let pmm = pmm_with_range();
        let resolver = NoCow;

        let size = Length::from_raw(4 * PAGE_SIZE.as_raw());
        let start = table
            .create_normal_region(
                &backend,
                VirtAddress::from_raw(0),
                size,
                Access::READABLE | Access::WRITEABLE,
                false,
                false,
                String::from("heap"),
            )
            .unwrap();

        let outcome = table.handle_fault(&backend, &pmm, &resolver, start, Access::WRITEABLE);
        assert!(matches!(outcome, FaultOutcome::Ok));
        assert!(backend.mapping(start).is_some());
    }

    #[test]
    fn release_in_range_unmaps_and_drops_the_region() {
        let table = PageTable::new();
        let backend = MockBackend::new();
        let pmm = pmm_with_range();
        let resolver = NoCow;
        let shootdown = NoShootdown;

        let size = Length::from_raw(4 * PAGE_SIZE.as_raw());
        let start = table
            .create_normal_region(
                &backend,
                VirtAddress::from_raw(0),
                size,
                Access::READABLE | Access::WRITEABLE,
                false,
                false,
                String::from("heap"),
            )
            .unwrap();
        let _ = table.handle_fault(&backend, &pmm, &resolver, start, Access::WRITEABLE);
        assert!(backend.mapping(start).is_some());

        table.release_in_range(&backend, &shootdown, 0, start, size);

        assert!(backend.mapping(start).is_none());
        let outcome = table.handle_fault(&backend, &pmm, &resolver, start, Access::READABLE);
        assert!(matches!(outcome, FaultOutcome::Fatal(Error::NotFound)));
    }

    #[test]
    fn find_region_spot_skips_over_a_used_gap() {
        let table = PageTable::new();
        let backend = MockBackend::new();

        let size = Length::from_raw(PAGE_SIZE.as_raw());
        table
            .create_normal_region(
                &backend,
                VirtAddress::from_raw(PAGE_SIZE.as_raw()),
                size,
                Access::READABLE,
                true,
                false,
                String::from("a"),
            )
            .unwrap();

        let spot = table
            .find_region_spot(&backend, VirtAddress::from_raw(0), size, false)
            .unwrap();
        assert_ne!(spot, VirtAddress::from_raw(PAGE_SIZE.as_raw()));
    }

    #[test]
    fn clone_region_duplicates_backing_independently() {
        let from = PageTable::new();
        let to = PageTable::new();
        let from_backend = MockBackend::new();
        let to_backend = MockBackend::new();

        let size = Length::from_raw(4 * PAGE_SIZE.as_raw());
        let orig = from
            .create_phys_region(
                &from_backend,
                VirtAddress::from_raw(0),
                size,
                Access::READABLE | Access::WRITEABLE,
                false,
                String::from("fb"),
                PhysAddress::from_raw(0x10_0000),
                PhysAddress::from_raw(0x10_0000 + size.as_raw()),
            )
            .unwrap();

        let dest = from
            .clone_region(
                &to,
                &to_backend,
                orig,
                VirtAddress::from_raw(0),
                Access::READABLE,
                false,
            )
            .unwrap();

        // Both tables keep their own region at the expected spot, independent
        // of each other: releasing one must not disturb the other.
        let shootdown = NoShootdown;
        from.release_in_range(&from_backend, &shootdown, 0, orig, size);
        assert!(to.inner.lock().regions.contains_key(&dest.as_raw()));
    }

    #[test]
    fn transfer_region_moves_region_and_unmaps_source() {
        let from = PageTable::new();
        let to = PageTable::new();
        let from_backend = MockBackend::new();
        let to_backend = MockBackend::new();
        let pmm = pmm_with_range();
        let resolver = NoCow;

        let size = Length::from_raw(PAGE_SIZE.as_raw());
        let orig = from
            .create_normal_region(
                &from_backend,
                VirtAddress::from_raw(0),
                size,
                Access::READABLE | Access::WRITEABLE,
                false,
                false,
                String::from("heap"),
            )
            .unwrap();
        let _ = from.handle_fault(&from_backend, &pmm, &resolver, orig, Access::WRITEABLE);
        assert!(from_backend.mapping(orig).is_some());

        let dest = from
            .transfer_region(
                &to,
                &from_backend,
                &to_backend,
                orig,
                VirtAddress::from_raw(0),
                Access::READABLE | Access::WRITEABLE,
                false,
            )
            .unwrap();

        assert!(!from.inner.lock().regions.contains_key(&orig.as_raw()));
        assert!(from_backend.mapping(orig).is_none());
        assert!(to.inner.lock().regions.contains_key(&dest.as_raw()));
    }

    #[test]
    fn transfer_region_leaves_source_unchanged_when_destination_is_full() {
        let from = PageTable::new();
        let to = PageTable::new();
        let from_backend = MockBackend::new();
        let to_backend = MockBackend::new();

        let size = Length::from_raw(PAGE_SIZE.as_raw());
        let orig = from
            .create_phys_region(
                &from_backend,
                VirtAddress::from_raw(0),
                size,
                Access::READABLE,
                false,
                String::from("fb"),
                PhysAddress::from_raw(0x10_0000),
                PhysAddress::from_raw(0x10_0000 + size.as_raw()),
            )
            .unwrap();

        // Fill `to`'s entire address space (page 0 is always reserved as a
        // null-deref guard, so the spot search starts at one page in) so
        // `find_region_spot_locked` has nowhere left to place the move.
        let fill_start = VirtAddress::from_raw(PAGE_SIZE.as_raw());
        let fill_size = to_backend.user_addr_max() - fill_start;
        to.create_phys_region(
            &to_backend,
            fill_start,
            fill_size,
            Access::READABLE,
            true,
            String::from("filler"),
            PhysAddress::from_raw(0),
            PhysAddress::from_raw(fill_size.as_raw()),
        )
        .unwrap();

        let result = from.transfer_region(
            &to,
            &from_backend,
            &to_backend,
            orig,
            VirtAddress::from_raw(0),
            Access::READABLE,
            false,
        );
        assert!(matches!(result, Err(Error::OutOfMemory)));

        // Source must be completely unaffected by the failed move.
        assert!(from.inner.lock().regions.contains_key(&orig.as_raw()));
    }
}
