//! x86_64 implementation of [`ArchPageTableBackend`]: walks and maintains a
//! real hardware page table through [`paging::Mapper`], using the kernel's
//! direct map to reach intermediate tables and the PMM to allocate frames for
//! them.
//!
//! One instance owns one root table. The kernel's own root and every user
//! page table's root each get one of these; `phys_of_root` is what a context
//! switch loads into `CR3` (or, for the kernel root, what `CR3` is
//! initialized to at boot).

use alloc::sync::Arc;

use shared::memory::addr::{PhysAddress, VirtAddress};
use shared::memory::page::{Frame, Page};
use spin::Mutex;
use x86_64::instructions::tlb;
use x86_64::structures::paging::PhysFrame;
use x86_64::{PhysAddr as X86PhysAddr, VirtAddr as X86VirtAddr};

use super::error::{Error, Result};
use super::page_table::{ArchPageTableBackend, HardwareMapping};
use super::paging::{self, PageTableFlags};
use super::pmm::{Pmm, Policy};
use super::region::{Access, CachePolicy, PageTableArgs};
use super::temp_mapper::{ArchTempMapperBackend, DirectMapper};

/// Software-defined bit (ignored by the MMU in every defined page table
/// format) marking an anonymous COW page's L1 entry, so `mapping()` can
/// report it back to the Page Table component without a side table.
const COW_BIT: u64 = 1 << 9;

/// Highest address a user-mode page table may place a region at on this
/// architecture: one page below the canonical-hole boundary for 4-level
/// paging.
pub const USER_ADDR_MAX: VirtAddress = VirtAddress::from_raw(0x0000_7fff_ffff_f000);

pub struct X86PageTableBackend {
    root: Mutex<paging::PageTable>,
    direct: DirectMapper,
    pmm: Arc<Pmm>,
}

impl X86PageTableBackend {
    pub fn new(direct: DirectMapper, pmm: Arc<Pmm>) -> Self {
        X86PageTableBackend {
            root: Mutex::new(paging::PageTable::zero()),
            direct,
            pmm,
        }
    }

    fn hhdm_base(&self) -> VirtAddress {
        self.direct.translate(PhysAddress::zero())
    }

    /// The physical address of this backend's root table, suitable for
    /// loading into `CR3`. The root lives in the direct map, so its
    /// physical address is just the inverse of `DirectMapper::translate`.
    pub fn phys_of_root(&self) -> PhysAddress {
        let root_virt = VirtAddress::from_ptr(&*self.root.lock() as *const paging::PageTable);
        PhysAddress::from_zero(root_virt - self.hhdm_base())
    }

    fn flags_for(args: &PageTableArgs) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT;
        if args.access.contains(Access::WRITEABLE) {
            flags |= PageTableFlags::WRITABLE;
        }
        if !args.access.contains(Access::EXECUTABLE) {
            flags |= PageTableFlags::EXECUTE_DISABLE;
        }
        if args.user {
            flags |= PageTableFlags::USER;
        }
        if args.cache == CachePolicy::IoNoCache {
            flags |= PageTableFlags::NO_CACHE | PageTableFlags::WRITE_THROUGH;
        }
        flags
    }
}

impl ArchPageTableBackend for X86PageTableBackend {
    fn map(&self, virt: VirtAddress, args: PageTableArgs) -> Result<()> {
        let page = Page::new(virt);
        let frame = Frame::new(args.phys);
        let mut flags = Self::flags_for(&args);
        if args.anonymous_cow {
            // SAFETY: `COW_BIT` is an MMU-ignored software bit; the bits
            // already present in `flags` remain exactly the ones `flags_for`
            // set.
            flags = unsafe { PageTableFlags::from_bits_unchecked(flags.bits() | COW_BIT) };
        }

        let mut root = self.root.lock();
        let translate = |phys: PhysAddress| Some(self.direct.translate(phys));
        let pmm = &self.pmm;
        let allocate = || pmm.alloc_pages(1, Policy::Normal).ok().map(|id| Frame::new(pmm.phys_of(id)));
        // SAFETY: `root` is this backend's own table, exclusively locked
        // here; `translate` reaches every frame this table or its
        // descendants reference through the HHDM; `allocate` hands out
        // pages this backend exclusively owns once allocated.
        let mut mapper = unsafe { paging::Mapper::new(&mut root, translate, allocate) };
        // An existing entry (e.g. a stale COW mapping) must be cleared
        // first: `Mapper::map` never overwrites one.
        let _ = mapper.unmap(page);
        unsafe { mapper.map(page, frame, flags) }.map_err(|_| Error::OutOfMemory)?;
        drop(mapper);
        drop(root);

        tlb::flush(X86VirtAddr::new(virt.as_raw()));
        Ok(())
    }

    fn unmap(&self, virt: VirtAddress) -> Option<PhysAddress> {
        let page = Page::new(virt);
        let mut root = self.root.lock();
        let translate = |phys: PhysAddress| Some(self.direct.translate(phys));
        let pmm = &self.pmm;
        let allocate = || pmm.alloc_pages(1, Policy::Normal).ok().map(|id| Frame::new(pmm.phys_of(id)));
        let mut mapper = unsafe { paging::Mapper::new(&mut root, translate, allocate) };
        let frame = mapper.unmap(page);
        drop(mapper);
        drop(root);

        if frame.is_some() {
            tlb::flush(X86VirtAddr::new(virt.as_raw()));
        }
        frame.map(Frame::start)
    }

    fn mapping(&self, virt: VirtAddress) -> Option<HardwareMapping> {
        let page = Page::new(virt);
        let mut root = self.root.lock();
        let translate = |phys: PhysAddress| Some(self.direct.translate(phys));
        let pmm = &self.pmm;
        let allocate = || pmm.alloc_pages(1, Policy::Normal).ok().map(|id| Frame::new(pmm.phys_of(id)));
        let mut mapper = unsafe { paging::Mapper::new(&mut root, translate, allocate) };
        let (_phys, flags) = mapper.translate(page)?;

        let mut access = Access::empty();
        if flags.contains(PageTableFlags::PRESENT) {
            access |= Access::READABLE;
        }
        if flags.contains(PageTableFlags::WRITABLE) {
            access |= Access::WRITEABLE;
        }
        if !flags.contains(PageTableFlags::EXECUTE_DISABLE) {
            access |= Access::EXECUTABLE;
        }
        let is_anonymous_cow = flags.bits() & COW_BIT != 0;
        Some(HardwareMapping { access, is_anonymous_cow })
    }

    fn invalidate_local(&self, virt: VirtAddress) {
        tlb::flush(X86VirtAddr::new(virt.as_raw()));
    }

    fn user_addr_max(&self) -> VirtAddress {
        USER_ADDR_MAX
    }
}

/// Dedicated run of virtual pages used by `ArchTempMapper` once the kernel's
/// own page table is installed. Sits above the direct map's worst-case span
/// and below the kernel arena, so neither can ever collide with it.
pub const TEMP_MAPPER_BASE: VirtAddress = VirtAddress::from_raw(0xffff_9000_0000_0000);

/// [`ArchTempMapperBackend`] that installs slots directly into the kernel's
/// own running page table via [`X86PageTableBackend::map`]/`unmap`.
pub struct KernelTempMapperBackend {
    table: Arc<X86PageTableBackend>,
}

impl KernelTempMapperBackend {
    pub fn new(table: Arc<X86PageTableBackend>) -> Self {
        KernelTempMapperBackend { table }
    }
}

impl ArchTempMapperBackend for KernelTempMapperBackend {
    const SLOT_COUNT: usize = 16;

    unsafe fn set_slot(&self, index: usize, phys: Option<PhysAddress>) {
        let virt = self.slot_virt_addr(index);
        match phys {
            Some(phys) => {
                let _ = self.table.map(
                    virt,
                    PageTableArgs {
                        phys,
                        access: Access::READABLE | Access::WRITEABLE,
                        user: false,
                        cache: CachePolicy::WriteBack,
                        anonymous_cow: false,
                    },
                );
            }
            None => {
                self.table.unmap(virt);
            }
        }
    }

    fn slot_virt_addr(&self, index: usize) -> VirtAddress {
        TEMP_MAPPER_BASE + shared::memory::addr::Length::from_raw(index as u64 * 4096)
    }
}

/// Installs `backend`'s root table as the active one. Used once at boot to
/// switch off the loader's page table, and on a context switch to swap to a
/// different address space.
///
/// # Safety
/// `backend`'s root table must already correctly map the kernel's own
/// address space and the currently executing code/stack.
pub unsafe fn install(backend: &X86PageTableBackend) {
    let phys = backend.phys_of_root();
    let frame = PhysFrame::from_start_address(X86PhysAddr::new(phys.as_raw()))
        .expect("page table root must be 4 KiB aligned");
    unsafe {
        x86_64::registers::control::Cr3::write(frame, x86_64::registers::control::Cr3Flags::empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(access: Access, cache: CachePolicy) -> PageTableArgs {
        PageTableArgs {
            phys: PhysAddress::from_raw(0x1000),
            access,
            user: true,
            cache,
            anonymous_cow: false,
        }
    }

    #[test]
    fn read_only_sets_execute_disable_and_no_writable() {
        let flags = X86PageTableBackend::flags_for(&args(Access::READABLE, CachePolicy::WriteBack));
        assert!(flags.contains(PageTableFlags::PRESENT));
        assert!(flags.contains(PageTableFlags::EXECUTE_DISABLE));
        assert!(!flags.contains(PageTableFlags::WRITABLE));
    }

    #[test]
    fn writeable_access_clears_nothing_but_sets_writable() {
        let flags = X86PageTableBackend::flags_for(&args(
            Access::READABLE | Access::WRITEABLE,
            CachePolicy::WriteBack,
        ));
        assert!(flags.contains(PageTableFlags::WRITABLE));
        assert!(flags.contains(PageTableFlags::EXECUTE_DISABLE));
    }

    #[test]
    fn executable_access_clears_execute_disable() {
        let flags = X86PageTableBackend::flags_for(&args(
            Access::READABLE | Access::EXECUTABLE,
            CachePolicy::WriteBack,
        ));
        assert!(!flags.contains(PageTableFlags::EXECUTE_DISABLE));
    }

    #[test]
    fn io_no_cache_sets_cache_disable_bits() {
        let flags = X86PageTableBackend::flags_for(&args(Access::READABLE, CachePolicy::IoNoCache));
        assert!(flags.contains(PageTableFlags::NO_CACHE));
        assert!(flags.contains(PageTableFlags::WRITE_THROUGH));
    }

    #[test]
    fn user_flag_follows_args() {
        let mut a = args(Access::READABLE, CachePolicy::WriteBack);
        a.user = false;
        assert!(!X86PageTableBackend::flags_for(&a).contains(PageTableFlags::USER));
        a.user = true;
        assert!(X86PageTableBackend::flags_for(&a).contains(PageTableFlags::USER));
    }
}
