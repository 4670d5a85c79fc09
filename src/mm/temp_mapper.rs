//! Scratch virtual-address slots for mapping an arbitrary physical page into
//! kernel space for the duration of a scoped handle.
//!
//! Two back-ends exist. `DirectMapper` is a thin wrapper over the loader's
//! HHDM window and is used only during early bring-up. `ArchTempMapper` owns
//! a small, fixed run of virtual pages dedicated to this purpose and is used
//! from then on; installing a physical frame into one of its slots is
//! architecture-specific and lives behind the `ArchTempMapperBackend` trait,
//! not in this module.

use shared::memory::addr::{Length, PhysAddress, VirtAddress};
use spin::Mutex;

use super::error::{Error, Result};

/// Maps a physical frame into kernel virtual space and back out again.
///
/// Implementations must be safe to call from any CPU without coordinating
/// with other CPUs; each CPU either has its own instance or, for
/// `DirectMapper`, the mapping is globally valid and slot-free.
pub trait TempMapper {
    /// Install `phys` into a scratch slot, returning the virtual address it
    /// now appears at.
    ///
    /// # Safety
    /// `phys` must be a valid physical address. The returned address is only
    /// valid until the matching `return_map` call.
    unsafe fn kern_map(&self, phys: PhysAddress) -> Result<VirtAddress>;

    /// Release a mapping previously returned by `kern_map`, invalidating the
    /// local TLB entry for it.
    ///
    /// # Safety
    /// `virt` must be a value this mapper previously returned from
    /// `kern_map` and not yet released.
    unsafe fn return_map(&self, virt: VirtAddress);
}

/// Maps physical addresses by adding the loader-provided HHDM offset. Valid
/// only until the kernel's own page table is installed and the HHDM window
/// is reclaimed; has no slots to exhaust.
pub struct DirectMapper {
    hhdm_offset: Length,
}

impl DirectMapper {
    pub const fn new(hhdm_offset: Length) -> Self {
        DirectMapper { hhdm_offset }
    }

    /// The HHDM-relative virtual address of `phys`. Infallible and safe: the
    /// direct map covers every physical address the loader told us about, and
    /// unlike a slot-based mapper this never needs to be released.
    pub fn translate(&self, phys: PhysAddress) -> VirtAddress {
        VirtAddress::from_zero(self.hhdm_offset) + (phys - PhysAddress::zero())
    }
}

impl TempMapper for DirectMapper {
    unsafe fn kern_map(&self, phys: PhysAddress) -> Result<VirtAddress> {
        Ok(VirtAddress::from_zero(self.hhdm_offset) + (phys - PhysAddress::zero()))
    }

    unsafe fn return_map(&self, _virt: VirtAddress) {
        // No slot to release, and no architectural state to invalidate: the
        // HHDM mapping is never torn down by this mapper.
    }
}

/// Backend that can install or clear one physical frame in one of a
/// dedicated run of page-table slots. The run's length is `SLOT_COUNT`;
/// implementations are expected to map it into a single page-directory entry
/// of the kernel's page table so installing a slot never needs to allocate.
pub trait ArchTempMapperBackend {
    const SLOT_COUNT: usize;

    /// Point slot `index` at `phys`, or clear it if `phys` is `None`.
    ///
    /// # Safety
    /// `index` must be `< SLOT_COUNT`, and the slot must not be concurrently
    /// used by another mapping on this CPU.
    unsafe fn set_slot(&self, index: usize, phys: Option<PhysAddress>);

    /// The virtual address at which `index`'s mapping, once installed,
    /// appears.
    fn slot_virt_addr(&self, index: usize) -> VirtAddress;
}

/// Per-CPU temp mapper backed by a dedicated run of `>= 16` virtual pages.
/// Slot selection is lock-free: each CPU owns its own instance, so the only
/// shared state is the bitmap of this CPU's own free slots.
pub struct ArchTempMapper<B: ArchTempMapperBackend> {
    backend: B,
    free_slots: Mutex<u32>,
}

impl<B: ArchTempMapperBackend> ArchTempMapper<B> {
    pub fn new(backend: B) -> Self {
        assert!(B::SLOT_COUNT >= 16 && B::SLOT_COUNT <= 32);
        ArchTempMapper {
            backend,
            free_slots: Mutex::new((1u32 << B::SLOT_COUNT) - 1),
        }
    }

    fn acquire_slot(&self) -> Option<usize> {
        let mut free = self.free_slots.lock();
        if *free == 0 {
            return None;
        }
        let index = free.trailing_zeros() as usize;
        *free &= !(1 << index);
        Some(index)
    }

    fn release_slot(&self, index: usize) {
        let mut free = self.free_slots.lock();
        *free |= 1 << index;
    }
}

impl<B: ArchTempMapperBackend> TempMapper for ArchTempMapper<B> {
    unsafe fn kern_map(&self, phys: PhysAddress) -> Result<VirtAddress> {
        let index = self.acquire_slot().ok_or(Error::Busy)?;
        // SAFETY: `index` was just reserved and is not in use elsewhere.
        unsafe {
            self.backend.set_slot(index, Some(phys));
        }
        Ok(self.backend.slot_virt_addr(index))
    }

    unsafe fn return_map(&self, virt: VirtAddress) {
        for index in 0..B::SLOT_COUNT {
            if self.backend.slot_virt_addr(index) == virt {
                // SAFETY: this slot was holding `virt`'s mapping and the
                // caller is done with it.
                unsafe {
                    self.backend.set_slot(index, None);
                }
                self.release_slot(index);
                return;
            }
        }
        panic!("return_map: {virt:?} was not an outstanding temp mapping");
    }
}

/// RAII handle around a single `kern_map`/`return_map` pair: acquires a slot
/// on construction, releases it on every exit path including unwinding.
pub struct TempMapping<'a, M: TempMapper + ?Sized> {
    mapper: &'a M,
    virt: VirtAddress,
}

impl<'a, M: TempMapper + ?Sized> TempMapping<'a, M> {
    pub fn new(mapper: &'a M, phys: PhysAddress) -> Result<Self> {
        // SAFETY: `phys` is caller-supplied and assumed valid; the returned
        // address is only used through this handle's lifetime.
        let virt = unsafe { mapper.kern_map(phys)? };
        Ok(TempMapping { mapper, virt })
    }

    pub fn addr(&self) -> VirtAddress {
        self.virt
    }

    pub fn as_ptr<T>(&self) -> *mut T {
        self.virt.as_mut_ptr()
    }
}

impl<'a, M: TempMapper + ?Sized> Drop for TempMapping<'a, M> {
    fn drop(&mut self) {
        // SAFETY: `self.virt` was returned by `mapper.kern_map` in `new` and
        // has not been released yet, since that only happens here.
        unsafe {
            self.mapper.return_map(self.virt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct FakeBackend {
        slots: RefCell<[Option<PhysAddress>; 16]>,
        base: VirtAddress,
    }

    impl ArchTempMapperBackend for FakeBackend {
        const SLOT_COUNT: usize = 16;

        unsafe fn set_slot(&self, index: usize, phys: Option<PhysAddress>) {
            self.slots.borrow_mut()[index] = phys;
        }

        fn slot_virt_addr(&self, index: usize) -> VirtAddress {
            self.base + Length::from_raw(index as u64 * 4096)
        }
    }

    #[test]
    fn direct_mapper_adds_offset() {
        let mapper = DirectMapper::new(Length::from_raw(0xffff_8000_0000_0000));
        let virt = unsafe { mapper.kern_map(PhysAddress::from_raw(0x1000)).unwrap() };
        assert_eq!(virt, VirtAddress::from_raw(0xffff_8000_0000_1000));
        unsafe { mapper.return_map(virt) };
    }

    #[test]
    fn arch_mapper_recycles_slots() {
        let backend = FakeBackend {
            slots: RefCell::new([None; 16]),
            base: VirtAddress::from_raw(0xffff_ff00_0000_0000),
        };
        let mapper = ArchTempMapper::new(backend);

        let handle = TempMapping::new(&mapper, PhysAddress::from_raw(0x5000)).unwrap();
        let first_virt = handle.addr();
        drop(handle);

        let handle = TempMapping::new(&mapper, PhysAddress::from_raw(0x6000)).unwrap();
        assert_eq!(handle.addr(), first_virt, "freed slot should be reused");
    }

    #[test]
    fn arch_mapper_exhaustion_returns_busy() {
        let backend = FakeBackend {
            slots: RefCell::new([None; 16]),
            base: VirtAddress::from_raw(0xffff_ff00_0000_0000),
        };
        let mapper = ArchTempMapper::new(backend);

        let handles: std::vec::Vec<_> = (0..16)
            .map(|i| TempMapping::new(&mapper, PhysAddress::from_raw(i * 4096)).unwrap())
            .collect();

        assert_eq!(
            unsafe { mapper.kern_map(PhysAddress::from_raw(0x99000)) },
            Err(Error::Busy)
        );
        drop(handles);
    }
}
