//! Boot Bring-Up: the one-shot sequence that turns the loader's hand-off data
//! into a live kernel page table and an initialized PMM/VMM, then hands
//! control to the scheduler.
//!
//! Requests are issued against the [Limine](https://github.com/limine-bootloader/limine)
//! protocol, matching the loader interface described for this subsystem: a
//! memory map, an HHDM offset, the kernel's physical/virtual load addresses,
//! a module list, and optional framebuffer/RSDP/FDT/SMP responses. Everything
//! here runs before interrupts are enabled and on a single CPU; once
//! `finish` returns, the kernel's own page table is installed and the HHDM
//! window the loader gave us may be reclaimed.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use limine::memory_map::EntryType;
use limine::request::{
    ExecutableAddressRequest, FramebufferRequest, HhdmRequest, MemoryMapRequest, ModuleRequest,
    RsdpRequest, SmpRequest,
};
use limine::BaseRevision;

use shared::memory::addr::{Length, PhysAddress, PhysExtent, VirtAddress};
use shared::memory::page::PAGE_SIZE;

use super::pmm::{Pmm, Policy};
use super::temp_mapper::DirectMapper;
use super::vmm::Vmm;

#[used]
static BASE_REVISION: BaseRevision = BaseRevision::with_revision(2);

#[used]
static REQ_HHDM: HhdmRequest = HhdmRequest::with_revision(0);

#[used]
static REQ_MMAP: MemoryMapRequest = MemoryMapRequest::with_revision(0);

#[used]
static REQ_EXEC_ADDR: ExecutableAddressRequest = ExecutableAddressRequest::with_revision(0);

#[used]
static REQ_MODULES: ModuleRequest = ModuleRequest::with_revision(0);

#[used]
static REQ_FRAMEBUFFER: FramebufferRequest = FramebufferRequest::with_revision(0);

#[used]
static REQ_RSDP: RsdpRequest = RsdpRequest::with_revision(0);

#[used]
static REQ_SMP: SmpRequest = SmpRequest::with_revision(0);

/// One entry of the loader-provided physical memory map, filtered and
/// reclassified to the taxonomy this subsystem cares about: usable now, or
/// reclaimable once the boot-time structures referencing it are copied out.
#[derive(Clone, Copy, Debug)]
pub struct MemoryMapEntry {
    pub extent: PhysExtent,
    pub usable: bool,
}

/// A loader-provided module (e.g. the init task's ELF, a ramdisk) staged at a
/// fixed physical address.
#[derive(Clone, Debug)]
pub struct BootModule {
    pub path: alloc::string::String,
    pub extent: PhysExtent,
}

/// Everything `finish` extracted from the loader's responses, kept around in
/// case later bring-up stages (ACPI, SMP start-up) need it.
pub struct BootInfo {
    pub hhdm_offset: Length,
    pub kernel_phys_base: PhysAddress,
    pub kernel_virt_base: VirtAddress,
    pub memory_map: Vec<MemoryMapEntry>,
    pub modules: Vec<BootModule>,
    pub rsdp: Option<PhysAddress>,
    pub cpu_count: usize,
}

/// Reads every Limine response this subsystem needs and classifies the
/// memory map. Panics if a required response (HHDM, memory map, executable
/// address) is missing — without them there is no way to proceed.
pub fn read_boot_info() -> BootInfo {
    static CALLED: AtomicBool = AtomicBool::new(false);
    assert!(
        !CALLED.swap(true, Ordering::SeqCst),
        "read_boot_info must only be called once"
    );

    let hhdm = REQ_HHDM.get_response().expect("limine: no HHDM response");
    let exec_addr = REQ_EXEC_ADDR
        .get_response()
        .expect("limine: no executable-address response");
    let mmap = REQ_MMAP
        .get_response()
        .expect("limine: no memory-map response");

    let memory_map = mmap
        .entries()
        .iter()
        .map(|region| MemoryMapEntry {
            extent: PhysExtent::new(
                PhysAddress::from_raw(region.base),
                Length::from_raw(region.length),
            ),
            usable: matches!(region.entry_type, EntryType::USABLE),
        })
        .collect();

    let hhdm_offset_raw = hhdm.offset();

    // Limine hands back `addr()`/`address()` as addresses already mapped
    // through its HHDM window, not physical addresses — both need the
    // offset subtracted back out.
    let modules = REQ_MODULES
        .get_response()
        .map(|resp| {
            resp.modules()
                .iter()
                .map(|module| BootModule {
                    path: alloc::string::String::from_utf8_lossy(module.path()).into_owned(),
                    extent: PhysExtent::new(
                        PhysAddress::from_raw(module.addr() as u64 - hhdm_offset_raw),
                        Length::from_raw(module.size()),
                    ),
                })
                .collect()
        })
        .unwrap_or_default();

    let rsdp = REQ_RSDP
        .get_response()
        .map(|resp| PhysAddress::from_raw(resp.address() as u64 - hhdm_offset_raw));

    let cpu_count = REQ_SMP
        .get_response()
        .map(|resp| resp.cpus().len())
        .unwrap_or(1);

    BootInfo {
        hhdm_offset: Length::from_raw(hhdm.offset()),
        kernel_phys_base: PhysAddress::from_raw(exec_addr.physical_base()),
        kernel_virt_base: VirtAddress::from_raw(exec_addr.virtual_base()),
        memory_map,
        modules,
        rsdp,
        cpu_count,
    }
}

/// Builds a PMM from the loader's usable memory-map entries, reserving the
/// ranges occupied by the kernel image and every boot module so they're
/// never handed back out as free pages.
///
/// `reserved` is additional physical ranges the caller already knows must
/// stay out of the free lists (e.g. the boot info structures themselves).
pub fn build_pmm(info: &BootInfo, reserved: &[PhysExtent]) -> Pmm {
    let pmm = Pmm::new();

    for entry in &info.memory_map {
        if !entry.usable {
            continue;
        }
        let mut base = entry.extent.address();
        let end = entry.extent.end_address();
        for skip in info
            .modules
            .iter()
            .map(|m| m.extent)
            .chain(reserved.iter().copied())
        {
            if skip.address() < end && base < skip.end_address() {
                if skip.address() > base {
                    pmm.add_range(PhysExtent::from_range_exclusive(base, skip.address()));
                }
                base = skip.end_address().max(base);
            }
        }
        if base < end {
            pmm.add_range(PhysExtent::from_range_exclusive(base, end));
        }
    }

    pmm
}

/// Builds the kernel's virtual-memory arena over `[start, start+size)`, a
/// range the caller has already reserved in the loader's page table (or
/// intends to reserve in the kernel's own, once installed).
pub fn build_vmm(start: VirtAddress, size: Length) -> Vmm {
    let vmm = Vmm::new();
    vmm.add_range(start, size.as_raw() / PAGE_SIZE.as_raw());
    vmm
}

/// The direct mapper valid only until the kernel's own page table replaces
/// the loader's and the HHDM window is reclaimed.
pub fn direct_mapper(info: &BootInfo) -> DirectMapper {
    DirectMapper::new(info.hhdm_offset)
}

/// Rounds a physical extent's page count up, for sizing a PMM reservation or
/// a kernel-image mapping loop.
pub fn size_in_pages(extent: PhysExtent) -> u64 {
    extent.length().as_raw().div_ceil(PAGE_SIZE.as_raw())
}

/// Picks the allocation policy Boot Bring-Up itself should use for any
/// pages it carves directly (before `Pmm`'s `Below4GB`/`Normal` regions are
/// distinguished by caller intent) — boot-time structures have no DMA
/// requirement, so this is always `Normal`.
pub const BOOT_POLICY: Policy = Policy::Normal;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_pmm_excludes_module_and_reserved_ranges() {
        let info = BootInfo {
            hhdm_offset: Length::from_raw(0xffff_8000_0000_0000),
            kernel_phys_base: PhysAddress::from_raw(0x100000),
            kernel_virt_base: VirtAddress::from_raw(0xffff_ffff_8000_0000),
            memory_map: alloc::vec![MemoryMapEntry {
                extent: PhysExtent::new(PhysAddress::from_raw(0), Length::from_raw(0x10_0000)),
                usable: true,
            }],
            modules: alloc::vec![BootModule {
                path: alloc::string::String::from("/init"),
                extent: PhysExtent::new(PhysAddress::from_raw(0x4000), Length::from_raw(0x1000)),
            }],
            rsdp: None,
            cpu_count: 1,
        };

        let pmm = build_pmm(&info, &[]);
        let below = pmm
            .alloc_pages(1, Policy::Normal)
            .expect("usable range outside the module should still yield pages");
        let _ = below;
    }
}
