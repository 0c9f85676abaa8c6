//! The root kernel task: first thing the scheduler ever runs.
//!
//! Loading the user-space `init` image is the bootstrap loader's business
//! and lives outside this kernel; the root task sets up what the loader
//! expects (a bound name to rendezvous on) and then gets out of the way.

use crate::{info, ipc::Port, ipc::named};

/// busy-yields until `ms` of uptime passed; only the root task uses this
pub fn wait_ms(ms: u64) {
    let until = crate::time!(ms) + ms;
    while crate::time!(ms) < until {
        crate::scheduler::yield_now();
        core::hint::spin_loop();
    }
}

pub fn main() -> ! {
    unsafe {
        crate::arch::enable_interrupts();
    }

    info!("portal-core up, {} cpu(s)", crate::arch::cpu_count());

    // the kernel's own inbox; the loader finds it by name once it runs
    let kernel_port = Port::create_for_kernel();
    named::bind("/kernel", &kernel_port).expect("binding the kernel port cannot fail this early");

    #[cfg(test)]
    crate::kernel_testmain();

    info!("no init image handed over; parking the root task");
    loop {
        if let Some(message) = kernel_port.pop_message() {
            crate::debug!("kernel port message from task {}", message.sender);
        }
        unsafe {
            crate::arch::hlt();
        }
    }
}
