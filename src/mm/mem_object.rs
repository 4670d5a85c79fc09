//! Memory Object: an identity-carrying, resizable collection of pages that
//! page-table regions reference to resolve faults against. May be anonymous
//! (zero-filled on first touch) or backed by a pager for a user task to
//! service.
//!
//! Kept alive by a reference count (`Arc`) held by whoever has a handle, and
//! additionally by every page table that has registered itself as pinning
//! the object — an object survives as long as either kind of reference
//! exists, matching the original's "weak `pined_by` set, strong handles"
//! split described for cycle-breaking.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use shared::memory::addr::{Length, PhysAddress};
use shared::memory::page::PAGE_SIZE;
use spin::Mutex;

use super::error::{Error, Result};
use super::pmm::{PageId, Pmm, Policy};

pub const FLAG_ANONYMOUS: u32 = 1 << 0;
pub const FLAG_DMA: u32 = 1 << 1;

/// A page table pinning a Memory Object is notified here when the object
/// shrinks, so it can unmap the pages that fell outside the new bound before
/// they're freed. Implemented by `page_table::PageTable`.
pub trait PinnedPageTable: Send + Sync {
    fn shrink_regions(&self, object_id: u64, new_size_bytes: u64);
}

/// Where a user pager is asked to fill in a page this object doesn't have
/// yet. Implemented by whatever wraps the IPC port to the pager task; ports
/// and tasks are outside this subsystem.
pub trait PagerPort: Send + Sync {
    fn request_page(&self, object_id: u64, offset_pages: u64);
}

#[derive(Clone, Copy)]
enum Slot {
    /// A page is attached at this offset and already has real backing.
    Backed(PageId),
    /// A pager request for this offset is outstanding; faults on it defer.
    Placeholder,
}

pub enum RequestOutcome {
    Immediate(PageId),
    Deferred,
}

struct MemObjectState {
    pages: Vec<Option<Slot>>,
    pager: Option<Arc<dyn PagerPort>>,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub struct MemObject {
    id: u64,
    page_size_log: u8,
    max_user_access_perm: u32,
    flags: u32,
    state: Mutex<MemObjectState>,
    resize_lock: Mutex<()>,
    pinned_lock: Mutex<()>,
    pinned_by: Mutex<Vec<Weak<dyn PinnedPageTable>>>,
}

static OBJECTS: Mutex<BTreeMap<u64, Weak<MemObject>>> = Mutex::new(BTreeMap::new());

impl MemObject {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_anonymous(&self) -> bool {
        self.flags & FLAG_ANONYMOUS != 0
    }

    pub fn size_pages(&self) -> u64 {
        self.state.lock().pages.len() as u64
    }

    pub fn page_size_bytes(&self) -> u64 {
        1u64 << self.page_size_log
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_pages() * self.page_size_bytes()
    }

    /// Allocates an empty object of `size_pages` holes; pages are filled in
    /// lazily as faults request them.
    pub fn create(page_size_log: u8, size_pages: u64, flags: u32) -> Arc<MemObject> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let obj = Arc::new(MemObject {
            id,
            page_size_log,
            max_user_access_perm: 0,
            flags,
            state: Mutex::new(MemObjectState {
                pages: alloc::vec![None; size_pages as usize],
                pager: None,
            }),
            resize_lock: Mutex::new(()),
            pinned_lock: Mutex::new(()),
            pinned_by: Mutex::new(Vec::new()),
        });
        OBJECTS.lock().insert(id, Arc::downgrade(&obj));
        obj
    }

    /// Wraps a caller-owned physical range, e.g. a loader-staged module.
    /// Every page is immediately `Backed`: no fault is ever deferred for
    /// this object.
    pub fn create_from_phys(
        pmm: &Pmm,
        phys: PhysAddress,
        size_bytes: u64,
        max_user_access_perm: u32,
    ) -> Result<Arc<MemObject>> {
        let page_size = PAGE_SIZE.as_raw();
        let size_pages = size_bytes.div_ceil(page_size);
        let mut pages = Vec::with_capacity(size_pages as usize);
        for i in 0..size_pages {
            let page_phys = phys + Length::from_raw(i * page_size);
            let page_id = pmm.find_page(page_phys).ok_or(Error::Invalid)?;
            pages.push(Some(Slot::Backed(page_id)));
        }

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let obj = Arc::new(MemObject {
            id,
            page_size_log: 12,
            max_user_access_perm,
            flags: 0,
            state: Mutex::new(MemObjectState { pages, pager: None }),
            resize_lock: Mutex::new(()),
            pinned_lock: Mutex::new(()),
            pinned_by: Mutex::new(Vec::new()),
        });
        OBJECTS.lock().insert(id, Arc::downgrade(&obj));
        Ok(obj)
    }

    pub fn get(id: u64) -> Option<Arc<MemObject>> {
        OBJECTS.lock().get(&id).and_then(Weak::upgrade)
    }

    pub fn set_pager(&self, pager: Arc<dyn PagerPort>) {
        self.state.lock().pager = Some(pager);
    }

    pub fn register_pinned(&self, table: Weak<dyn PinnedPageTable>) {
        let _guard = self.pinned_lock.lock();
        self.pinned_by.lock().push(table);
    }

    pub fn unregister_pinned(&self, table: &Weak<dyn PinnedPageTable>) {
        let _guard = self.pinned_lock.lock();
        self.pinned_by
            .lock()
            .retain(|t| !core::ptr::addr_eq(t.as_ptr(), table.as_ptr()));
    }

    /// The fault-resolution primitive: find, allocate, or defer the page at
    /// `offset_pages`.
    pub fn request_page(&self, pmm: &Pmm, offset_pages: u64, _write: bool) -> Result<RequestOutcome> {
        let mut state = self.state.lock();
        let index = offset_pages as usize;
        let slot = *state.pages.get(index).ok_or(Error::Invalid)?;

        match slot {
            Some(Slot::Backed(page_id)) => {
                pmm.retain_page(page_id);
                Ok(RequestOutcome::Immediate(page_id))
            }
            Some(Slot::Placeholder) => Ok(RequestOutcome::Deferred),
            None => match &state.pager {
                None => {
                    let policy = if self.flags & FLAG_DMA != 0 {
                        Policy::Below4GB
                    } else {
                        Policy::Normal
                    };
                    let page_id = pmm.alloc_pages(1, policy)?;
                    pmm.commit_allocation(page_id, Some(self.id), self.is_anonymous());
                    state.pages[index] = Some(Slot::Backed(page_id));
                    Ok(RequestOutcome::Immediate(page_id))
                }
                Some(pager) => {
                    state.pages[index] = Some(Slot::Placeholder);
                    pager.request_page(self.id, offset_pages);
                    Ok(RequestOutcome::Deferred)
                }
            },
        }
    }

    /// Allocates a fresh page charged to this object but never attached to
    /// the offset-indexed slot list `request_page` serves shared lookups
    /// from. Used for private COW breaks and COW zero-fill, where the caller
    /// needs an exclusively-owned copy, not a handle two faulters could both
    /// be given.
    pub fn request_anonymous_page(&self, pmm: &Pmm) -> Result<PageId> {
        let policy = if self.flags & FLAG_DMA != 0 {
            Policy::Below4GB
        } else {
            Policy::Normal
        };
        let page_id = pmm.alloc_pages(1, policy)?;
        pmm.commit_allocation(page_id, Some(self.id), true);
        Ok(page_id)
    }

    /// Called once a pager's reply attaches real backing to a page that was
    /// `Placeholder`.
    pub fn fulfill_placeholder(&self, offset_pages: u64, page_id: PageId) -> Result<()> {
        let mut state = self.state.lock();
        let index = offset_pages as usize;
        match state.pages.get(index) {
            Some(Some(Slot::Placeholder)) => {
                state.pages[index] = Some(Slot::Backed(page_id));
                Ok(())
            }
            _ => Err(Error::Invalid),
        }
    }

    /// Two-phase resize: the new bound takes effect for fault rejection
    /// immediately; pages beyond it are excised and handed to RCU only
    /// after every pinning page table has shrunk its own view.
    pub fn resize(&self, pmm: &Pmm, new_size_pages: u64) {
        let _resize_guard = self.resize_lock.lock();

        let old_size_pages = {
            let mut state = self.state.lock();
            let old = state.pages.len() as u64;
            if new_size_pages > old {
                state.pages.resize(new_size_pages as usize, None);
            }
            old
        };

        if new_size_pages >= old_size_pages {
            return;
        }

        let new_size_bytes = new_size_pages * self.page_size_bytes();
        {
            let tables = self.pinned_by.lock();
            for table in tables.iter() {
                if let Some(table) = table.upgrade() {
                    table.shrink_regions(self.id, new_size_bytes);
                }
            }
        }

        let mut state = self.state.lock();
        for slot in state.pages.drain(new_size_pages as usize..) {
            if let Some(Slot::Backed(page_id)) = slot {
                pmm.release_page(page_id);
            }
        }
    }

    /// Faults in the pages covering `[offset, offset + size)` and copies
    /// them into `buf`. Returns `Ok(false)` if any page is deferred and the
    /// caller must retry once the pager replies.
    pub fn read_to_kernel(
        &self,
        pmm: &Pmm,
        mapper: &dyn super::temp_mapper::TempMapper,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<bool> {
        let page_size = self.page_size_bytes();
        let mut copied = 0usize;
        while copied < buf.len() {
            let byte_offset = offset + copied as u64;
            let page_index = byte_offset / page_size;
            let in_page_offset = (byte_offset % page_size) as usize;
            let chunk_len = (page_size as usize - in_page_offset).min(buf.len() - copied);

            let page_id = match self.request_page(pmm, page_index, false)? {
                RequestOutcome::Immediate(id) => id,
                RequestOutcome::Deferred => return Ok(false),
            };
            let phys = pmm.phys_of(page_id);

            // SAFETY: `phys` was just returned by the PMM for a page this
            // call holds a retained handle on; the mapping is released
            // before the next iteration via `TempMapping`'s drop.
            unsafe {
                let mapping = super::temp_mapper::TempMapping::new(mapper, phys)?;
                let src = mapping.as_ptr::<u8>().add(in_page_offset);
                core::ptr::copy_nonoverlapping(src, buf[copied..].as_mut_ptr(), chunk_len);
            }

            copied += chunk_len;
        }
        Ok(true)
    }

    /// Faults in the pages covering `[offset, offset + size)` and maps them,
    /// contiguously, into a fresh range of the kernel's virtual arena,
    /// returning its base. Unlike `read_to_kernel`, the mapping outlives the
    /// call; the caller is responsible for unmapping and `vmm.free`-ing it.
    pub fn map_to_kernel(
        &self,
        pmm: &Pmm,
        vmm: &super::vmm::Vmm,
        backend: &dyn super::page_table::ArchPageTableBackend,
        offset: u64,
        size: u64,
    ) -> Result<shared::memory::addr::VirtAddress> {
        use super::region::{Access, CachePolicy, PageTableArgs};

        let page_size = self.page_size_bytes();
        let size_pages = size.div_ceil(page_size);
        let base = vmm.alloc(size_pages, super::vmm::Policy::InstantFit)?;

        for i in 0..size_pages {
            let page_index = offset / page_size + i;
            let page_id = match self.request_page(pmm, page_index, false)? {
                RequestOutcome::Immediate(id) => id,
                RequestOutcome::Deferred => {
                    for j in 0..i {
                        backend.unmap(base + Length::from_raw(j * page_size));
                    }
                    vmm.free(base, size_pages);
                    return Err(Error::Again);
                }
            };
            let virt = base + Length::from_raw(i * page_size);
            if let Err(e) = backend.map(
                virt,
                PageTableArgs {
                    phys: pmm.phys_of(page_id),
                    access: Access::READABLE | Access::WRITEABLE,
                    user: false,
                    cache: CachePolicy::WriteBack,
                    anonymous_cow: false,
                },
            ) {
                for j in 0..i {
                    backend.unmap(base + Length::from_raw(j * page_size));
                }
                vmm.free(base, size_pages);
                return Err(e);
            }
        }
        Ok(base)
    }
}

/// Production `CowResolver`: breaks copy-on-write by allocating a fresh
/// private page and copying the shared page's content into it through a
/// temp mapping, the way `read_to_kernel` copies object content out.
pub struct CowCopyResolver<'a> {
    mapper: &'a dyn super::temp_mapper::TempMapper,
}

impl<'a> CowCopyResolver<'a> {
    pub fn new(mapper: &'a dyn super::temp_mapper::TempMapper) -> Self {
        CowCopyResolver { mapper }
    }
}

impl<'a> super::region::CowResolver for CowCopyResolver<'a> {
    fn resolve_anonymous_page(
        &self,
        object: &MemObject,
        pmm: &Pmm,
        object_offset_pages: u64,
    ) -> Result<super::region::PageTableArgs> {
        use super::region::{Access, CachePolicy, PageTableArgs};
        use super::temp_mapper::TempMapping;

        let source = match object.request_page(pmm, object_offset_pages, false)? {
            RequestOutcome::Immediate(id) => id,
            // A page flagged `anonymous_cow` always has real backing; a
            // pager-backed placeholder is never mapped that way.
            RequestOutcome::Deferred => return Err(Error::Fault),
        };
        let private = object.request_anonymous_page(pmm)?;

        // SAFETY: `source` and `private` are both PMM pages this call holds
        // a handle on; each temp mapping is released before the next is
        // created.
        unsafe {
            let src = TempMapping::new(self.mapper, pmm.phys_of(source))?;
            let dst = TempMapping::new(self.mapper, pmm.phys_of(private))?;
            core::ptr::copy_nonoverlapping(
                src.as_ptr::<u8>(),
                dst.as_ptr::<u8>(),
                PAGE_SIZE.as_raw() as usize,
            );
        }
        // `request_page` retained `source` on our behalf for the copy above;
        // the mapping we're replacing is not keeping a separate reference.
        pmm.release_page(source);

        Ok(PageTableArgs {
            phys: pmm.phys_of(private),
            access: Access::READABLE | Access::WRITEABLE,
            user: true,
            cache: CachePolicy::WriteBack,
            anonymous_cow: false,
        })
    }
}

impl Drop for MemObject {
    fn drop(&mut self) {
        OBJECTS.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::pmm::Pmm;
    use shared::memory::addr::PhysExtent;

    fn pmm_with_range() -> Pmm {
        let pmm = Pmm::new();
        pmm.add_range(PhysExtent::new(
            PhysAddress::from_raw(0x10000),
            Length::from_raw(16 * PAGE_SIZE.as_raw()),
        ));
        pmm
    }

    #[test]
    fn request_page_allocates_zero_fill_when_no_pager() {
        let pmm = pmm_with_range();
        let obj = MemObject::create(12, 4, FLAG_ANONYMOUS);

        match obj.request_page(&pmm, 0, true).unwrap() {
            RequestOutcome::Immediate(_) => {}
            RequestOutcome::Deferred => panic!("expected immediate allocation"),
        }
    }

    #[test]
    fn request_page_out_of_bounds_is_invalid() {
        let pmm = pmm_with_range();
        let obj = MemObject::create(12, 2, FLAG_ANONYMOUS);
        assert_eq!(obj.request_page(&pmm, 5, false), Err(Error::Invalid));
    }

    #[test]
    fn second_request_for_same_offset_bumps_refcount() {
        let pmm = pmm_with_range();
        let obj = MemObject::create(12, 1, FLAG_ANONYMOUS);

        let first = match obj.request_page(&pmm, 0, true).unwrap() {
            RequestOutcome::Immediate(id) => id,
            _ => panic!("expected immediate"),
        };
        let second = match obj.request_page(&pmm, 0, true).unwrap() {
            RequestOutcome::Immediate(id) => id,
            _ => panic!("expected immediate"),
        };
        assert_eq!(first, second, "same offset must return the same page");
    }

    #[test]
    fn resize_down_frees_excised_pages() {
        let pmm = pmm_with_range();
        let obj = MemObject::create(12, 4, FLAG_ANONYMOUS);
        for i in 0..4 {
            obj.request_page(&pmm, i, true).unwrap();
        }

        obj.resize(&pmm, 2);
        assert_eq!(obj.size_pages(), 2);
    }

    #[test]
    fn map_to_kernel_rolls_back_earlier_mappings_on_later_failure() {
        use super::super::page_table::{ArchPageTableBackend, HardwareMapping};
        use super::super::region::PageTableArgs;
        use super::super::vmm::{Policy as VmmPolicy, Vmm};
        use shared::memory::addr::VirtAddress;
        use std::sync::Mutex as StdMutex;

        struct FlakyBackend {
            // Fails the map call at this 0-based page index within a single
            // map_to_kernel run; every earlier page must come back unmapped.
            fail_at: u64,
            mapped: StdMutex<alloc::collections::BTreeSet<u64>>,
        }

        impl ArchPageTableBackend for FlakyBackend {
            fn map(&self, virt: VirtAddress, _args: PageTableArgs) -> Result<()> {
                let index = virt.as_raw() / PAGE_SIZE.as_raw();
                if index == self.fail_at {
                    return Err(Error::OutOfMemory);
                }
                self.mapped.lock().unwrap().insert(virt.as_raw());
                Ok(())
            }

            fn unmap(&self, virt: VirtAddress) -> Option<PhysAddress> {
                self.mapped.lock().unwrap().remove(&virt.as_raw());
                None
            }

            fn mapping(&self, _virt: VirtAddress) -> Option<HardwareMapping> {
                None
            }

            fn invalidate_local(&self, _virt: VirtAddress) {}

            fn user_addr_max(&self) -> VirtAddress {
                VirtAddress::from_raw(0x0000_7fff_ffff_f000)
            }
        }

        let pmm = pmm_with_range();
        let vmm = Vmm::new();
        vmm.add_range(VirtAddress::from_raw(0), 64);
        let backend = FlakyBackend {
            fail_at: 2,
            mapped: StdMutex::new(alloc::collections::BTreeSet::new()),
        };

        let obj = MemObject::create(12, 4, FLAG_ANONYMOUS);
        let result = obj.map_to_kernel(&pmm, &vmm, &backend, 0, 4 * PAGE_SIZE.as_raw());

        assert!(result.is_err());
        assert!(
            backend.mapped.lock().unwrap().is_empty(),
            "pages mapped before the failing one must be rolled back"
        );
        // The vmm range must be reusable: a whole-range allocation should
        // succeed and land back at the start.
        let reused = vmm.alloc(64, VmmPolicy::InstantFit).unwrap();
        assert_eq!(reused, VirtAddress::from_raw(0));
    }

    #[test]
    fn create_from_phys_maps_each_page_in_order() {
        let pmm = pmm_with_range();
        let obj = MemObject::create_from_phys(
            &pmm,
            PhysAddress::from_raw(0x10000),
            2 * PAGE_SIZE.as_raw(),
            0,
        )
        .unwrap();
        assert_eq!(obj.size_pages(), 2);

        let id = match obj.request_page(&pmm, 1, false).unwrap() {
            RequestOutcome::Immediate(id) => id,
            _ => panic!("expected immediate"),
        };
        assert_eq!(
            pmm.phys_of(id),
            PhysAddress::from_raw(0x10000) + Length::from_raw(PAGE_SIZE.as_raw())
        );
    }
}
