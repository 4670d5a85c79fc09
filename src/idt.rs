/// Routines to set up the x86_64 IDT.
///
/// The PIC driver and any future exception handlers both register their entry
/// points here; this module owns the one IDT and the bookkeeping needed to
/// hand a vector to a caller-supplied handler exactly once.
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame};

use spin::mutex::{SpinMutex, SpinMutexGuard};

static IDT: SpinMutex<InterruptDescriptorTable> = SpinMutex::new(InterruptDescriptorTable::new());

pub fn init() {
    static IS_INITIALIZED: core::sync::atomic::AtomicBool =
        core::sync::atomic::AtomicBool::new(false);
    assert!(!IS_INITIALIZED.swap(true, core::sync::atomic::Ordering::SeqCst));

    install_interrupt_handler(BREAKPOINT_VECTOR, Some(breakpoint_handler));

    let idt = SpinMutexGuard::leak(IDT.lock());
    idt.load();
}

pub type HandlerFunc = extern "x86-interrupt" fn(InterruptStackFrame);

/// Points the IDT entry for `vector` at `handler`, or resets it to the
/// default (unhandled) state if `handler` is `None`.
///
/// Panics if `vector` is one of the CPU exception vectors (0-31); those are
/// reserved and not meant to be reassigned through this path.
pub fn install_interrupt_handler(vector: u8, handler: Option<HandlerFunc>) {
    assert!(
        vector >= FIRST_USABLE_VECTOR,
        "vectors below {FIRST_USABLE_VECTOR} are reserved for CPU exceptions"
    );

    let mut idt = IDT.lock();
    let entry = &mut idt[vector];
    match handler {
        Some(f) => {
            entry.set_handler_fn(f);
        }
        None => {
            *entry = x86_64::structures::idt::Entry::missing();
        }
    }
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log::warn!("breakpoint exception: {stack_frame:#?}");
}

const BREAKPOINT_VECTOR: u8 = 3;
const FIRST_USABLE_VECTOR: u8 = 32;
