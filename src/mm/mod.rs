//! Kernel memory management: physical and virtual memory allocators, memory
//! objects, page tables, and the bring-up sequence that assembles them from
//! the loader's hand-off data.

pub mod arch_page_table;
pub mod boot;
pub mod error;
pub mod mem_object;
pub mod page_table;
pub mod paging;
pub mod pmm;
pub mod rcu;
pub mod region;
pub mod shootdown;
pub mod temp_mapper;
pub mod vmm;

pub use shared::memory::addr::*;
pub use shared::memory::page::*;

use alloc::sync::Arc;

use log::info;
use spin::Once;

use arch_page_table::{KernelTempMapperBackend, X86PageTableBackend};
use boot::BootInfo;
use page_table::PageTable;
use pmm::Pmm;
use temp_mapper::{ArchTempMapper, DirectMapper, TempMapper};
use vmm::Vmm;

/// All physical memory is linearly mapped starting here, once the kernel's
/// own page table replaces the loader's.
pub const PHYSICAL_MEMORY_MAP_OFFSET: VirtAddress = VirtAddress::from_raw(0xffff_8000_0000_0000);

/// Where the kernel's own virtual-memory arena begins, just above the direct
/// map's worst-case span (128 GiB, matching the PMM's address-space
/// assumption from the teacher's original bitmap allocator).
const KERNEL_ARENA_BASE: VirtAddress = VirtAddress::from_raw(0xffff_c000_0000_0000);
const KERNEL_ARENA_SIZE: Length = Length::from_raw(1 << 40); // 1 TiB

static PMM: Once<Arc<Pmm>> = Once::new();
static VMM: Once<Vmm> = Once::new();
static KERNEL_TABLE: Once<Arc<X86PageTableBackend>> = Once::new();
static BOOT_INFO: Once<BootInfo> = Once::new();

/// The temp mapper used everywhere past boot. A single instance serves every
/// CPU: the teacher's original per-CPU design is collapsed to one global here
/// since this codebase has no per-CPU storage facility to hang a per-CPU
/// instance off of (see DESIGN.md).
static CURRENT_MAPPER: Once<ArchTempMapper<KernelTempMapperBackend>> = Once::new();

/// Runs the one-shot boot sequence: reads the loader's hand-off data, builds
/// the PMM and kernel VMM, constructs the kernel's own page table (mapping
/// the direct map and the kernel image), and installs it. Must be called
/// exactly once, before interrupts are enabled and before any other function
/// in this module.
pub fn init() {
    static IS_INITIALIZED: core::sync::atomic::AtomicBool =
        core::sync::atomic::AtomicBool::new(false);
    assert!(!IS_INITIALIZED.swap(true, core::sync::atomic::Ordering::SeqCst));

    let info = boot::read_boot_info();
    info!(
        "boot: hhdm_offset={:?} kernel_phys_base={:?} kernel_virt_base={:?} cpu_count={}",
        info.hhdm_offset, info.kernel_phys_base, info.kernel_virt_base, info.cpu_count
    );

    let pmm = Arc::new(boot::build_pmm(&info, &[]));
    let vmm = boot::build_vmm(KERNEL_ARENA_BASE, KERNEL_ARENA_SIZE);
    let direct = boot::direct_mapper(&info);

    let backend = Arc::new(X86PageTableBackend::new(direct, pmm.clone()));
    map_direct_mapping(&backend, &pmm, &info);
    map_kernel_image(&backend, &info);

    // SAFETY: `backend`'s root now maps the direct window and the running
    // kernel image identically to (a superset of) what the loader's own
    // table mapped, so control flow and any in-flight references survive
    // the switch.
    unsafe {
        arch_page_table::install(&backend);
    }

    PMM.call_once(|| pmm);
    VMM.call_once(|| vmm);
    let table = KERNEL_TABLE.call_once(|| backend);
    BOOT_INFO.call_once(|| info);

    // Past this point `current_mapper()` replaces `DirectMapper`/the HHDM for
    // any code acquiring a fresh temp mapping; the HHDM window itself stays
    // valid (nothing reclaims it yet) but new code should prefer the slot
    // run, which stays valid once the HHDM eventually is torn down.
    CURRENT_MAPPER.call_once(|| ArchTempMapper::new(KernelTempMapperBackend::new(table.clone())));
}

fn map_direct_mapping(backend: &X86PageTableBackend, pmm: &Pmm, info: &BootInfo) {
    use page_table::ArchPageTableBackend as _;
    use region::{Access, CachePolicy, PageTableArgs};

    for entry in &info.memory_map {
        let pages = boot::size_in_pages(entry.extent);
        for i in 0..pages {
            let phys = entry.extent.address() + Length::from_raw(i * PAGE_SIZE.as_raw());
            let virt = PHYSICAL_MEMORY_MAP_OFFSET + (phys - PhysAddress::zero());
            let _ = backend.map(
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
    }
    let _ = pmm;
}

fn map_kernel_image(backend: &X86PageTableBackend, info: &BootInfo) {
    use page_table::ArchPageTableBackend as _;
    use region::{Access, CachePolicy, PageTableArgs};

    // The loader places the kernel image at a fixed phys/virt pair and
    // guarantees it's contiguous; without ELF section boundaries at this
    // stage we map it read-write-execute and let a later, finer-grained pass
    // (once the memory object layer is live for the kernel's own address
    // space) split it into per-section permissions.
    let image_pages = 4096u64; // generous upper bound on the kernel image's page count
    for i in 0..image_pages {
        let offset = Length::from_raw(i * PAGE_SIZE.as_raw());
        let phys = info.kernel_phys_base + offset;
        let virt = info.kernel_virt_base + offset;
        let _ = backend.map(
            virt,
            PageTableArgs {
                phys,
                access: Access::READABLE | Access::WRITEABLE | Access::EXECUTABLE,
                user: false,
                cache: CachePolicy::WriteBack,
                anonymous_cow: false,
            },
        );
    }
}

/// The kernel's physical memory allocator. Panics if called before `init`.
pub fn pmm() -> &'static Arc<Pmm> {
    PMM.get().expect("mm::init must run before mm::pmm")
}

/// The kernel's own virtual-address arena allocator. Panics if called before
/// `init`.
pub fn vmm() -> &'static Vmm {
    VMM.get().expect("mm::init must run before mm::vmm")
}

/// The hardware backend for the kernel's own page table. Panics if called
/// before `init`.
pub fn kernel_table() -> &'static Arc<X86PageTableBackend> {
    KERNEL_TABLE
        .get()
        .expect("mm::init must run before mm::kernel_table")
}

/// What `init` read from the loader. Panics if called before `init`.
pub fn boot_info() -> &'static BootInfo {
    BOOT_INFO.get().expect("mm::init must run before mm::boot_info")
}

/// The temp mapper to use for any `TempMapping` created after `init` has
/// run. Panics if called before `init`.
pub fn current_mapper() -> &'static dyn TempMapper {
    CURRENT_MAPPER
        .get()
        .expect("mm::init must run before mm::current_mapper")
}

/// Backs the kernel heap with pages pulled straight from the PMM, mapped
/// through the direct map `init` already installed. Must not be used as a
/// `ChunkProvider` before `init` has run.
pub struct KernelChunkProvider;

unsafe impl shared::memory::heap::ChunkProvider for KernelChunkProvider {
    fn allocate(&mut self, num_chunks: usize) -> *mut [core::mem::MaybeUninit<u8>] {
        let phys = pmm()
            .get_memory_for_kernel(num_chunks as u32)
            .expect("kernel heap out of memory");
        let virt = phys_to_virt(phys);
        core::ptr::slice_from_raw_parts_mut(
            virt.as_mut_ptr::<core::mem::MaybeUninit<u8>>(),
            num_chunks * (PAGE_SIZE.as_raw() as usize),
        )
    }
}

/// Creates a fresh, empty page table for a new address space (e.g. a new
/// process). The kernel's own mappings are not inherited; a caller building
/// a user address space is expected to install whatever shared kernel window
/// its ABI requires.
pub fn new_page_table() -> (Arc<PageTable>, X86PageTableBackend) {
    let direct = DirectMapper::new(boot_info().hhdm_offset);
    let backend = X86PageTableBackend::new(direct, pmm().clone());
    (PageTable::new(), backend)
}

#[inline]
pub fn phys_to_virt(phys: PhysAddress) -> VirtAddress {
    PHYSICAL_MEMORY_MAP_OFFSET + (phys - PhysAddress::zero())
}
