//! SysInt syscalls implementation

use macros::syscall_handler;
use portal_abi::errors::ErrorStatus;

use crate::syscalls::ffi::{SyscallArgs, SyscallFFI};

#[syscall_handler]
fn sysint_set_handler(gsi: u32, port_id: u64) -> Result<(), ErrorStatus> {
    let task = crate::scheduler::current_task();
    let port = super::ipc::resolve_port(&task, port_id)?;
    crate::interrupts::install(gsi, &port, &task)
}

#[syscall_handler]
fn sysint_complete(gsi: u32) -> Result<(), ErrorStatus> {
    let task = crate::scheduler::current_task();
    crate::interrupts::complete(gsi, &task)
}
