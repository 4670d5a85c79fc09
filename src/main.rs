#![deny(unsafe_op_in_unsafe_fn)]
#![feature(abi_x86_interrupt)]
#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]

extern crate alloc;

mod mm;

#[cfg(not(test))]
mod gdt;
#[cfg(not(test))]
mod idt;
#[cfg(not(test))]
mod kmain;
#[cfg(not(test))]
mod pic;
#[cfg(not(test))]
mod sched;

#[cfg(not(test))]
#[global_allocator]
static HEAP: shared::memory::heap::CheckedHeap<mm::KernelChunkProvider> =
    shared::memory::heap::CheckedHeap::new(shared::memory::heap::Heap::new(
        mm::KernelChunkProvider,
    ));

#[cfg(not(test))]
pub fn halt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}
