use super::*;

use core::fmt::Write;
use core::panic::PanicInfo;

use lazy_static::lazy_static;
use log::{error, info};
use x86_64::instructions::interrupts;
use x86_64::structures::idt::InterruptStackFrame;

const VMEM: *mut u8 = 0xB8000 as *mut u8;

/// The kernel's ELF entry point. Limine jumps here directly, in long mode,
/// with every feature this subsystem's boot requests asked for already
/// active; there is no hand-off argument to read, only the request/response
/// pairs in `mm::boot`.
#[no_mangle]
extern "C" fn _start() -> ! {
    init_logger();
    interrupts::disable();

    info!("in kernel, bringing up memory management");
    mm::init();

    gdt::init();
    info!("set up GDT");

    idt::init();
    info!("set up IDT");

    let boot_info = mm::boot_info();
    if let Some(init_module) = boot_info.modules.iter().find(|m| m.path == "/init") {
        info!("init module at {:?}", init_module.extent);
        let init_virt = mm::phys_to_virt(init_module.extent.address());
        let init_slice = unsafe {
            core::slice::from_raw_parts(
                init_virt.as_ptr::<u8>(),
                init_module.extent.length().as_raw() as usize,
            )
        };
        if let Ok(init_elf) = xmas_elf::ElfFile::new(init_slice) {
            info!("init sections:");
            for section in init_elf
                .section_iter()
                .flat_map(|s| s.get_name(&init_elf).ok())
            {
                info!("  {}", section);
            }
        }
    } else {
        info!("no /init module provided by the loader");
    }

    unsafe {
        sched::init_kernel_main_thread(kernel_main);
    }
}

pub extern "C" fn kernel_main() -> ! {
    info!("in kernel_main");

    // This should do nothing.
    sched::yield_current();

    unsafe {
        pic::init();
        interrupts::enable();
    }
    info!("set up PIC");

    pic::install_irq_handler(1, Some(keyboard_handler));

    sched::spawn_kthread(test_thread, 0);
    info!("kernel_main yield");
    sched::yield_current();
    info!("kernel_main yield");
    sched::yield_current();
    info!("kernel_main after yield");

    // Exercise the kernel heap now that it's backed by a live PMM.
    let vec: alloc::vec::Vec<u32> = (0..100).collect();
    let mut string = alloc::string::String::new();
    for i in vec.iter() {
        write!(&mut string, "{i} ").unwrap();
    }

    info!("{string}");

    halt_loop();
}

pub extern "C" fn test_thread(_context: usize) -> ! {
    info!("test thread before yield");
    sched::yield_current();
    info!("test thread after yield");
    sched::quit_current();
}

fn keyboard_handler(_: InterruptStackFrame) {
    panic!("keyboard interrupt received");
}

cfg_if::cfg_if! {
    if #[cfg(feature = "qemu_debugcon")] {
        use shared::log::{LogTee, LogSink, QemuDebugWriter};
        use shared::vga::VgaWriter;
        lazy_static! {
            static ref LOGGER: LogTee<LogSink<QemuDebugWriter>, LogSink<VgaWriter>> = unsafe { LogTee(LogSink::new(QemuDebugWriter::new()), LogSink::new(VgaWriter::new(VMEM))) };
        }
    } else {
        use shared::log::LogSink;
        use shared::vga::VgaWriter;
        lazy_static! {
            static ref LOGGER: LogSink<VgaWriter> = unsafe { LogSink::new(VgaWriter::new(VMEM)) };
        }
    }
}

fn init_logger() {
    log::set_logger(&*LOGGER).unwrap();
    log::set_max_level(log::LevelFilter::Info);
}

#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
    use shared::log::LogExt;

    // It is unlikely that we panicked while our LOGGER instance was locked, and
    // if we were, we'll likely triple fault anyway. Try to use the existing
    // LOGGER, and otherwise try to use a new VgaWriter.
    if !LOGGER.is_locked() {
        error!("{info}");
    } else {
        #[cfg(feature = "qemu_debugcon")]
        {
            let mut writer = unsafe { shared::log::QemuDebugWriter::new() };
            let _ = write!(&mut writer, "{info}");
        }

        let mut writer = unsafe { shared::vga::VgaWriter::new(VMEM) };
        let _ = write!(&mut writer, "{info}");
    }
    interrupts::disable();
    halt_loop();
}
