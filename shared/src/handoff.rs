//! Boundary types for the loader hand-off and for the load tags published to
//! the first user task.
//!
//! Everything in this module is a *description* of an external interface;
//! the loader protocol that fills in `LoaderHandoff` and the user task that
//! consumes `LoadTag`s both live outside this crate.

use alloc::vec::Vec;

use crate::memory::{Length, Map, PhysAddress, VirtAddress};

/// Information the boot bring-up code extracts from the loader before it
/// builds the kernel's own page table and PMM/VMM state.
///
/// Populated once, by translating whatever the concrete loader protocol
/// reports into this loader-agnostic shape.
#[derive(Clone, Debug)]
pub struct LoaderHandoff {
    /// System-provided map of available and reserved memory.
    pub memory_map: Map,
    /// Offset added to a physical address to reach its HHDM mapping. Valid
    /// only until the kernel installs its own page table and discards the
    /// loader's HHDM window.
    pub hhdm_offset: Length,
    /// Range of physical memory where the kernel image was loaded.
    pub kernel_phys_base: PhysAddress,
    /// Virtual address the kernel was linked to run at.
    pub kernel_virt_base: VirtAddress,
    /// Loader-reported paging mode hint (e.g. 4-level vs. 5-level on x86_64).
    pub paging_mode: PagingMode,
    /// Modules the loader staged alongside the kernel (initrd-equivalents).
    pub modules: Vec<ModuleInfo>,
    pub framebuffer: Option<FramebufferInfo>,
    pub rsdp: Option<PhysAddress>,
    pub fdt: Option<PhysAddress>,
    pub smp: Option<SmpInfo>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PagingMode {
    FourLevel,
    FiveLevel,
}

#[derive(Clone, Debug)]
pub struct ModuleInfo {
    pub path: alloc::string::String,
    pub cmdline: alloc::string::String,
    pub phys_addr: PhysAddress,
    pub size: Length,
}

#[derive(Clone, Copy, Debug)]
pub struct FramebufferInfo {
    pub phys_addr: PhysAddress,
    pub pitch: u64,
    pub width: u64,
    pub height: u64,
    pub bpp: u16,
    pub red_mask_shift: u8,
    pub red_mask_size: u8,
    pub green_mask_shift: u8,
    pub green_mask_size: u8,
    pub blue_mask_shift: u8,
    pub blue_mask_size: u8,
}

#[derive(Clone, Debug)]
pub struct SmpInfo {
    pub bsp_id: u32,
    pub cpus: Vec<SmpCpuInfo>,
}

/// One entry of the loader's SMP descriptor: the id the loader used to
/// address this CPU (APIC id on x86_64, hart id on RISC-V), the address the
/// loader will jump to in order to start it, and an opaque argument passed
/// through untouched.
#[derive(Clone, Copy, Debug)]
pub struct SmpCpuInfo {
    pub processor_id: u32,
    pub goto_address: VirtAddress,
    pub extra_argument: u64,
}

/// A tagged, 8-byte-aligned, self-describing record in the buffer handed to
/// the first user task describing its initial address space.
///
/// Every tag starts with a `TagHeader`; `offset_to_next` lets a reader skip
/// tags it doesn't understand without knowing their payload layout.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct TagHeader {
    pub tag_id: TagId,
    pub flags: u32,
    /// Byte offset from the start of this header to the start of the next
    /// tag's header, or 0 if this is the last tag.
    pub offset_to_next: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum TagId {
    LoadModules = 1,
    Framebuffer = 2,
    Rsdp = 3,
    Fdt = 4,
}

/// One module entry within a `LoadModules` tag's array, referencing a memory
/// object rather than a raw physical range: by the time these tags are
/// published the loader's module has already been wrapped in a
/// `MemoryObject` so the user task can map it with the ordinary object-backed
/// region path.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct LoadModuleEntry {
    pub memory_object_id: u64,
    pub size: u64,
    /// Byte offset into the string heap following the `LoadModules` tag's
    /// entry array.
    pub path_offset: u32,
    pub cmdline_offset: u32,
}

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct RsdpTag {
    pub phys_addr: u64,
}

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct FdtTag {
    pub memory_object_id: u64,
    pub size: u64,
}

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct FramebufferTag {
    pub phys_addr: u64,
    pub pitch: u64,
    pub width: u64,
    pub height: u64,
    pub bpp: u16,
    pub _pad: u16,
}

/// Appends tags into a growable byte buffer, patching each `offset_to_next`
/// once the following tag's position is known.
pub struct LoadTagWriter {
    buf: Vec<u8>,
    last_header_offset: Option<usize>,
}

impl LoadTagWriter {
    pub fn new() -> Self {
        LoadTagWriter {
            buf: Vec::new(),
            last_header_offset: None,
        }
    }

    fn push_tag<T: Copy>(&mut self, tag_id: TagId, flags: u32, payload: &T) {
        if let Some(prev) = self.last_header_offset {
            let here = self.align_to_8();
            let delta = (here - prev) as u32;
            self.patch_offset_to_next(prev, delta);
        } else {
            self.align_to_8();
        }

        let header_offset = self.buf.len();
        let header = TagHeader {
            tag_id,
            flags,
            offset_to_next: 0,
        };
        self.push_pod(&header);
        self.push_pod(payload);
        self.last_header_offset = Some(header_offset);
    }

    pub fn push_load_modules(&mut self, entries: &[LoadModuleEntry], strings: &[u8]) {
        self.push_tag(TagId::LoadModules, 0, &(entries.len() as u64));
        for e in entries {
            self.push_pod(e);
        }
        self.buf.extend_from_slice(strings);
    }

    pub fn push_framebuffer(&mut self, fb: FramebufferTag) {
        self.push_tag(TagId::Framebuffer, 0, &fb);
    }

    pub fn push_rsdp(&mut self, rsdp: RsdpTag) {
        self.push_tag(TagId::Rsdp, 0, &rsdp);
    }

    pub fn push_fdt(&mut self, fdt: FdtTag) {
        self.push_tag(TagId::Fdt, 0, &fdt);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn align_to_8(&mut self) -> usize {
        while self.buf.len() % 8 != 0 {
            self.buf.push(0);
        }
        self.buf.len()
    }

    fn push_pod<T: Copy>(&mut self, value: &T) {
        let bytes = unsafe {
            core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>())
        };
        self.buf.extend_from_slice(bytes);
    }

    fn patch_offset_to_next(&mut self, header_offset: usize, delta: u32) {
        let field_offset = header_offset + core::mem::offset_of!(TagHeader, offset_to_next);
        self.buf[field_offset..field_offset + 4].copy_from_slice(&delta.to_ne_bytes());
    }
}

impl Default for LoadTagWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_chains_offsets() {
        let mut w = LoadTagWriter::new();
        w.push_rsdp(RsdpTag { phys_addr: 0x1000 });
        w.push_fdt(FdtTag {
            memory_object_id: 7,
            size: 4096,
        });
        let buf = w.finish();

        let first_header = unsafe { &*(buf.as_ptr() as *const TagHeader) };
        assert_eq!(first_header.tag_id, TagId::Rsdp);
        assert_ne!(first_header.offset_to_next, 0);

        let second = unsafe {
            &*(buf.as_ptr().add(first_header.offset_to_next as usize) as *const TagHeader)
        };
        assert_eq!(second.tag_id, TagId::Fdt);
        assert_eq!(second.offset_to_next, 0);
    }
}
