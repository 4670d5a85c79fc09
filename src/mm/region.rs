//! Memory Region: the unit a page table walks on a fault. Two flavors exist
//! — a direct physical mapping and a reference into a Memory Object — and
//! per the call to prefer a tagged enum over virtual dispatch, `Region` is
//! one type with a `Kind` payload rather than a trait object per variant.

use alloc::string::String;
use alloc::sync::Arc;

use shared::memory::addr::{Length, PhysAddress, VirtAddress};

use super::error::{Error, Result};
use super::mem_object::{MemObject, RequestOutcome};
use super::pmm::Pmm;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Access: u8 {
        const READABLE   = 0x01;
        const WRITEABLE  = 0x02;
        const EXECUTABLE = 0x04;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CachePolicy {
    WriteBack,
    IoNoCache,
}

/// The hardware-level bits a page table installs for one mapping.
#[derive(Clone, Copy, Debug)]
pub struct PageTableArgs {
    pub phys: PhysAddress,
    pub access: Access,
    pub user: bool,
    pub cache: CachePolicy,
    /// Flags this mapping as a still-shared anonymous COW source page, so a
    /// later write fault is routed through `CowResolver::resolve_anonymous_page`
    /// instead of writing through the shared page.
    pub anonymous_cow: bool,
}

/// What the page table already knows about `fault_addr` before delegating
/// to the region, gathered by walking the hardware tables. Lets
/// `ObjectRef::alloc_page` short-circuit a fault that's only stale, not
/// really missing.
#[derive(Clone, Copy, Debug)]
pub enum ExistingMapping {
    None,
    /// Present and already sufficient for the access that faulted; the
    /// region only needs to invalidate the local TLB.
    Sufficient,
    /// A present mapping that is an anonymous COW page backed by the same
    /// object this region references. The region recomputes which page of
    /// the object from the fault address itself; the hardware has no way to
    /// recover an arbitrary page offset from spare page-table-entry bits.
    AnonymousCow,
}

pub enum AllocOutcome {
    Ok(PageTableArgs),
    Deferred,
}

/// Collaborator the owning page table provides for the one step a region
/// cannot perform itself: copying a COW page in place in the live hardware
/// mapping.
pub trait CowResolver {
    fn resolve_anonymous_page(
        &self,
        object: &MemObject,
        pmm: &Pmm,
        object_offset_pages: u64,
    ) -> Result<PageTableArgs>;
}

struct Common {
    start_addr: VirtAddress,
    size: Length,
    access: Access,
    name: String,
    id: u64,
}

impl Common {
    fn end_addr(&self) -> VirtAddress {
        self.start_addr + self.size
    }

    fn is_in_range(&self, addr: VirtAddress) -> bool {
        addr >= self.start_addr && addr < self.end_addr()
    }
}

pub struct PhysMapped {
    common: Common,
    phys_addr_start: PhysAddress,
}

pub struct ObjectRef {
    common: Common,
    object: Arc<MemObject>,
    /// Offset in bytes from `start_addr` to where the object's window
    /// begins; before it, faults are zero-filled.
    start_offset_bytes: u64,
    /// Offset in bytes into the object where the window starts.
    object_offset_bytes: u64,
    /// Size in bytes copied from the object; past it, faults are
    /// zero-filled too.
    object_size_bytes: u64,
    cow: bool,
}

pub enum Region {
    PhysMapped(PhysMapped),
    ObjectRef(ObjectRef),
}

impl Region {
    pub fn new_phys_mapped(
        start_addr: VirtAddress,
        size: Length,
        access: Access,
        name: String,
        id: u64,
        phys_addr_start: PhysAddress,
    ) -> Self {
        assert!(start_addr.is_aligned_to(4096));
        assert!(phys_addr_start.is_aligned_to(4096));
        Region::PhysMapped(PhysMapped {
            common: Common {
                start_addr,
                size,
                access,
                name,
                id,
            },
            phys_addr_start,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_object_ref(
        start_addr: VirtAddress,
        size: Length,
        access: Access,
        name: String,
        id: u64,
        object: Arc<MemObject>,
        object_offset_bytes: u64,
        cow: bool,
        start_offset_bytes: u64,
        object_size_bytes: u64,
    ) -> Self {
        Region::ObjectRef(ObjectRef {
            common: Common {
                start_addr,
                size,
                access,
                name,
                id,
            },
            object,
            start_offset_bytes,
            object_offset_bytes,
            object_size_bytes,
            cow,
        })
    }

    fn common(&self) -> &Common {
        match self {
            Region::PhysMapped(r) => &r.common,
            Region::ObjectRef(r) => &r.common,
        }
    }

    fn common_mut(&mut self) -> &mut Common {
        match self {
            Region::PhysMapped(r) => &mut r.common,
            Region::ObjectRef(r) => &mut r.common,
        }
    }

    pub fn id(&self) -> u64 {
        self.common().id
    }

    pub fn start_addr(&self) -> VirtAddress {
        self.common().start_addr
    }

    pub fn size(&self) -> Length {
        self.common().size
    }

    pub fn access(&self) -> Access {
        self.common().access
    }

    pub fn is_in_range(&self, addr: VirtAddress) -> bool {
        self.common().is_in_range(addr)
    }

    /// The Memory Object this region references, if any.
    pub fn object_id(&self) -> Option<u64> {
        match self {
            Region::PhysMapped(_) => None,
            Region::ObjectRef(r) => Some(r.object.id()),
        }
    }

    pub fn craft_arguments(&self) -> PageTableArgs {
        match self {
            Region::PhysMapped(r) => PageTableArgs {
                phys: r.phys_addr_start,
                access: r.common.access,
                user: true,
                cache: CachePolicy::IoNoCache,
                anonymous_cow: false,
            },
            Region::ObjectRef(r) => PageTableArgs {
                phys: PhysAddress::zero(),
                access: r.common.access,
                user: true,
                cache: CachePolicy::WriteBack,
                anonymous_cow: false,
            },
        }
    }

    pub fn alloc_page(
        &self,
        pmm: &Pmm,
        resolver: &dyn CowResolver,
        fault_addr: VirtAddress,
        existing: ExistingMapping,
        access: Access,
    ) -> Result<AllocOutcome> {
        match self {
            Region::PhysMapped(r) => r.alloc_page(fault_addr),
            Region::ObjectRef(r) => r.alloc_page(pmm, resolver, fault_addr, existing, access),
        }
    }

    pub fn trim(&mut self, new_start: VirtAddress, new_size: Length) {
        match self {
            Region::PhysMapped(r) => r.trim(new_start, new_size),
            Region::ObjectRef(r) => r.trim(new_start, new_size),
        }
    }

    /// Relocates this region to `new_start`, leaving every offset into its
    /// backing (object window or physical base) unchanged. Unlike `trim`,
    /// this never shifts those offsets: the content at `new_start` is the
    /// same content that used to live at the old `start_addr`.
    pub fn retarget(&mut self, new_start: VirtAddress) {
        self.common_mut().start_addr = new_start;
    }

    pub fn set_access(&mut self, access: Access) {
        self.common_mut().access = access;
    }

    /// Duplicates this region's backing (the same `Arc<MemObject>`, or the
    /// same physical base) into a fresh region at `new_start` with a new id,
    /// for installing into a different page table via
    /// `PageTable::clone_region`.
    pub fn clone_to(&self, new_start: VirtAddress, access: Access, id: u64) -> Region {
        match self {
            Region::PhysMapped(r) => Region::PhysMapped(PhysMapped {
                common: Common {
                    start_addr: new_start,
                    size: r.common.size,
                    access,
                    name: r.common.name.clone(),
                    id,
                },
                phys_addr_start: r.phys_addr_start,
            }),
            Region::ObjectRef(r) => Region::ObjectRef(ObjectRef {
                common: Common {
                    start_addr: new_start,
                    size: r.common.size,
                    access,
                    name: r.common.name.clone(),
                    id,
                },
                object: r.object.clone(),
                start_offset_bytes: r.start_offset_bytes,
                object_offset_bytes: r.object_offset_bytes,
                object_size_bytes: r.object_size_bytes,
                cow: r.cow,
            }),
        }
    }

    /// Splits off the upper piece `[hole_start + hole_size, end)` as a new
    /// region and trims `self` down to `[start, hole_start)`. The caller is
    /// responsible for installing the returned region and for unmapping the
    /// hole itself.
    pub fn punch_hole(&mut self, hole_start: VirtAddress, hole_size: Length) -> Result<Region> {
        let region_start = self.common().start_addr;
        let region_end = self.common().end_addr();
        if hole_start <= region_start || hole_start + hole_size >= region_end {
            return Err(Error::Invalid);
        }

        let upper_start = hole_start + hole_size;
        let upper_size = region_end - upper_start;

        let upper = match self {
            Region::PhysMapped(r) => {
                let offset = upper_start.distance_from(r.common.start_addr);
                Region::PhysMapped(PhysMapped {
                    common: Common {
                        start_addr: upper_start,
                        size: upper_size,
                        access: r.common.access,
                        name: r.common.name.clone(),
                        id: r.common.id,
                    },
                    phys_addr_start: r.phys_addr_start + offset,
                })
            }
            Region::ObjectRef(r) => {
                let delta = upper_start.distance_from(r.common.start_addr).as_raw();
                let mut start_offset_bytes = r.start_offset_bytes;
                let mut object_offset_bytes = r.object_offset_bytes;
                let mut object_size_bytes = r.object_size_bytes;
                shift_object_window(
                    &mut start_offset_bytes,
                    &mut object_offset_bytes,
                    &mut object_size_bytes,
                    delta,
                );
                Region::ObjectRef(ObjectRef {
                    common: Common {
                        start_addr: upper_start,
                        size: upper_size,
                        access: r.common.access,
                        name: r.common.name.clone(),
                        id: r.common.id,
                    },
                    object: r.object.clone(),
                    start_offset_bytes,
                    object_offset_bytes,
                    object_size_bytes,
                    cow: r.cow,
                })
            }
        };

        let new_size = hole_start.distance_from(region_start);
        self.trim(region_start, new_size);
        Ok(upper)
    }
}

impl PhysMapped {
    /// `phys_base + (fault_addr - start_addr)`, mapped `IoNoCache`. Never
    /// touches PMM page accounting: this region doesn't own pages, just a
    /// window into physical memory.
    fn alloc_page(&self, fault_addr: VirtAddress) -> Result<AllocOutcome> {
        if !self.common.is_in_range(fault_addr) {
            return Err(Error::Invalid);
        }
        let delta = fault_addr.distance_from(self.common.start_addr);
        Ok(AllocOutcome::Ok(PageTableArgs {
            phys: self.phys_addr_start + delta,
            access: self.common.access,
            user: true,
            cache: CachePolicy::IoNoCache,
            anonymous_cow: false,
        }))
    }

    fn trim(&mut self, new_start: VirtAddress, new_size: Length) {
        if new_start != self.common.start_addr {
            let delta = new_start.distance_from(self.common.start_addr);
            self.phys_addr_start = self.phys_addr_start + delta;
        }
        self.common.start_addr = new_start;
        self.common.size = new_size;
    }
}

impl ObjectRef {
    /// Offset from `start_addr`, in bytes, one past the end of the
    /// object-backed window. Faults at or beyond this are zero-filled.
    fn window_end_bytes(&self) -> u64 {
        self.start_offset_bytes + self.object_size_bytes
    }

    fn alloc_page(
        &self,
        pmm: &Pmm,
        resolver: &dyn CowResolver,
        fault_addr: VirtAddress,
        existing: ExistingMapping,
        access: Access,
    ) -> Result<AllocOutcome> {
        if !self.common.is_in_range(fault_addr) {
            return Err(Error::Invalid);
        }

        if let ExistingMapping::Sufficient = existing {
            // Stale TLB entry for an already-adequate mapping; the page
            // table invalidates it, we have nothing further to do.
            return Ok(AllocOutcome::Ok(PageTableArgs {
                phys: PhysAddress::zero(),
                access,
                user: true,
                cache: CachePolicy::WriteBack,
                anonymous_cow: false,
            }));
        }

        let fault_offset = fault_addr.distance_from(self.common.start_addr).as_raw();

        if let ExistingMapping::AnonymousCow = existing {
            let object_offset_pages =
                object_window_page(fault_offset, self.start_offset_bytes, self.object_offset_bytes);
            let args = resolver.resolve_anonymous_page(&self.object, pmm, object_offset_pages)?;
            return Ok(AllocOutcome::Ok(args));
        }

        let in_window =
            fault_offset >= self.start_offset_bytes && fault_offset < self.window_end_bytes();

        let write_fault = access.contains(Access::WRITEABLE);

        if !in_window {
            if !self.cow {
                return Err(Error::Invalid);
            }
            // Outside the backed window of a COW region: zero-fill,
            // writeable, never shared.
            // TODO: alloc_page has no TempMapper available to zero this page
            // before mapping it; PMM pages are not zeroed on allocation.
            return self.request_anonymous(pmm);
        }

        let object_offset_pages = object_window_page(fault_offset, self.start_offset_bytes, self.object_offset_bytes);

        if write_fault && self.cow {
            // Break copy-on-write: the caller needs a private copy, never a
            // page shared through the object's offset-indexed slot list.
            return self.request_anonymous(pmm);
        }

        match self.object.request_page(pmm, object_offset_pages, write_fault)? {
            RequestOutcome::Immediate(page_id) => {
                let mut page_access = self.common.access;
                let mut anonymous_cow = false;
                if !self.object.is_anonymous() {
                    page_access.remove(Access::WRITEABLE);
                } else if self.cow {
                    // Shared anonymous page in a COW region: map read-only
                    // and flag it, so a later write fault routes through
                    // `resolve_anonymous_page` instead of writing through
                    // the page every other sharer still sees.
                    page_access.remove(Access::WRITEABLE);
                    anonymous_cow = true;
                }
                Ok(AllocOutcome::Ok(PageTableArgs {
                    phys: pmm.phys_of(page_id),
                    access: page_access,
                    user: true,
                    cache: CachePolicy::WriteBack,
                    anonymous_cow,
                }))
            }
            RequestOutcome::Deferred => Ok(AllocOutcome::Deferred),
        }
    }

    /// Allocates a private page for a COW break or COW zero-fill, via the
    /// object's never-shared anonymous-allocation primitive. Always
    /// immediate: unlike `request_page`, this never goes through a pager.
    fn request_anonymous(&self, pmm: &Pmm) -> Result<AllocOutcome> {
        let page_id = self.object.request_anonymous_page(pmm)?;
        Ok(AllocOutcome::Ok(PageTableArgs {
            phys: pmm.phys_of(page_id),
            access: self.common.access,
            user: true,
            cache: CachePolicy::WriteBack,
            anonymous_cow: false,
        }))
    }

    fn trim(&mut self, new_start: VirtAddress, new_size: Length) {
        if new_start != self.common.start_addr {
            let delta = new_start.distance_from(self.common.start_addr).as_raw();
            shift_object_window(
                &mut self.start_offset_bytes,
                &mut self.object_offset_bytes,
                &mut self.object_size_bytes,
                delta,
            );
        }
        self.common.start_addr = new_start;
        self.common.size = new_size;
    }
}

fn object_window_page(fault_offset: u64, start_offset_bytes: u64, object_offset_bytes: u64) -> u64 {
    let page_size = 4096u64;
    let within_window = fault_offset.saturating_sub(start_offset_bytes);
    (object_offset_bytes + within_window) / page_size
}

/// Advances a region's start edge by `delta` bytes, keeping the zero-fill
/// pre-window and the object-backed window consistent. While `delta` stays
/// within the pre-window, only `start_offset_bytes` shrinks; once it eats
/// into the backed window, the excess is pulled out of the front of that
/// window instead.
fn shift_object_window(
    start_offset_bytes: &mut u64,
    object_offset_bytes: &mut u64,
    object_size_bytes: &mut u64,
    delta: u64,
) {
    if delta <= *start_offset_bytes {
        *start_offset_bytes -= delta;
        return;
    }
    let excess = delta - *start_offset_bytes;
    *start_offset_bytes = 0;
    *object_offset_bytes += excess;
    *object_size_bytes = object_size_bytes.saturating_sub(excess);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::pmm::Pmm;
    use shared::memory::addr::PhysExtent;
    use shared::memory::page::PAGE_SIZE;

    fn pmm_with_range() -> Pmm {
        let pmm = Pmm::new();
        pmm.add_range(PhysExtent::new(
            PhysAddress::from_raw(0x100000),
            Length::from_raw(16 * PAGE_SIZE.as_raw()),
        ));
        pmm
    }

    struct NoCow;
    impl CowResolver for NoCow {
        fn resolve_anonymous_page(&self, _: &MemObject, _: &Pmm, _: u64) -> Result<PageTableArgs> {
            unreachable!("test regions never report an existing AnonymousCow mapping")
        }
    }

    #[test]
    fn phys_mapped_computes_offset_from_start() {
        let region = Region::new_phys_mapped(
            VirtAddress::from_raw(0x4000_0000),
            Length::from_raw(4 * PAGE_SIZE.as_raw()),
            Access::READABLE | Access::WRITEABLE,
            String::from("mmio"),
            1,
            PhysAddress::from_raw(0xfee0_0000),
        );

        let pmm = pmm_with_range();
        let resolver = NoCow;
        let fault = VirtAddress::from_raw(0x4000_0000 + 2 * PAGE_SIZE.as_raw());
        match region
            .alloc_page(&pmm, &resolver, fault, ExistingMapping::None, Access::READABLE)
            .unwrap()
        {
            AllocOutcome::Ok(args) => {
                assert_eq!(args.phys, PhysAddress::from_raw(0xfee0_0000 + 2 * PAGE_SIZE.as_raw()));
            }
            AllocOutcome::Deferred => panic!("phys-mapped regions never defer"),
        }
    }

    #[test]
    fn object_ref_non_cow_shares_read_only_for_non_anonymous() {
        let pmm = pmm_with_range();
        let object = MemObject::create_from_phys(
            &pmm,
            PhysAddress::from_raw(0x100000),
            2 * PAGE_SIZE.as_raw(),
            0,
        )
        .unwrap();

        let region = Region::new_object_ref(
            VirtAddress::from_raw(0x5000_0000),
            Length::from_raw(2 * PAGE_SIZE.as_raw()),
            Access::READABLE | Access::WRITEABLE,
            String::from("module"),
            2,
            object,
            0,
            false,
            0,
            2 * PAGE_SIZE.as_raw(),
        );

        let resolver = NoCow;
        let fault = VirtAddress::from_raw(0x5000_0000);
        match region
            .alloc_page(&pmm, &resolver, fault, ExistingMapping::None, Access::READABLE)
            .unwrap()
        {
            AllocOutcome::Ok(args) => assert!(!args.access.contains(Access::WRITEABLE)),
            AllocOutcome::Deferred => panic!("create_from_phys pages are never deferred"),
        }
    }

    #[test]
    fn object_ref_cow_write_fault_gets_writeable_private_page() {
        let pmm = pmm_with_range();
        let object = MemObject::create(12, 4, super::super::mem_object::FLAG_ANONYMOUS);

        let region = Region::new_object_ref(
            VirtAddress::from_raw(0x6000_0000),
            Length::from_raw(4 * PAGE_SIZE.as_raw()),
            Access::READABLE | Access::WRITEABLE,
            String::from("heap"),
            3,
            object,
            0,
            true,
            0,
            4 * PAGE_SIZE.as_raw(),
        );

        let resolver = NoCow;
        let fault = VirtAddress::from_raw(0x6000_0000);
        match region
            .alloc_page(&pmm, &resolver, fault, ExistingMapping::None, Access::WRITEABLE)
            .unwrap()
        {
            AllocOutcome::Ok(args) => assert!(args.access.contains(Access::WRITEABLE)),
            AllocOutcome::Deferred => panic!("no pager is attached, so this must resolve immediately"),
        }
    }
}
