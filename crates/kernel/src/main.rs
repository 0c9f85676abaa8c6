#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(crate::test::test_runner)]
#![reexport_test_harness_main = "kernel_testmain"]
#![feature(sync_unsafe_cell)]

#[cfg(test)]
mod test;

mod arch;
mod interrupts;
mod ipc;
mod kmain;
mod limine;
mod logging;
mod memory;
mod scheduler;
mod syscalls;
mod task;
mod utils;

extern crate alloc;

pub use memory::PhysAddr;
pub use memory::VirtAddr;

use core::panic::PanicInfo;

#[macro_export]
macro_rules! serial {
    ($($arg:tt)*) => {
        $crate::arch::serial::_serial(format_args!($($arg)*))
    };
}

/// Returns the number of milliseconds since the boot CPU was started
#[macro_export]
macro_rules! time {
    (ms) => {
        $crate::arch::utils::time_ms()
    };
    (us) => {
        $crate::arch::utils::time_us()
    };
    () => {
        $crate::time!(ms)
    };
}

#[unsafe(no_mangle)]
pub fn khalt() -> ! {
    loop {
        unsafe { arch::hlt() }
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    unsafe {
        arch::disable_interrupts();
        arch::serial::SERIAL.force_unlock();
    }

    crate::panic_println!(
        "\x1B[38;2;255;0;0mkernel panic:\n{}, at {}\x1B[0m",
        info.message(),
        info.location().unwrap()
    );
    crate::panic_println!("{}", unsafe { logging::StackTrace::current() });

    arch::halt_all();
    #[cfg(test)]
    arch::power::shutdown();
    #[cfg(not(test))]
    khalt();
}

#[unsafe(no_mangle)]
extern "C" fn kstart() -> ! {
    arch::init_phase1();
    memory::init();
    logging::BOOTING.store(true, core::sync::atomic::Ordering::Relaxed);
    crate::info!("memory initialized");
    // interrupt controllers, per-CPU storage, the works
    arch::init_phase2();
    crate::info!("arch initialized");

    unsafe {
        crate::debug!(scheduler::Scheduler, "starting the root task...");
        logging::BOOTING.store(false, core::sync::atomic::Ordering::Relaxed);
        scheduler::init(kmain::main, "kmain");
    }
}
