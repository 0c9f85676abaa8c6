//! Limine boot-protocol requests.
//!
//! The core consumes exactly what the boundary contract allows: the higher
//! half direct map offset, the physical memory map, and the CPU list (plus
//! the device-tree blob on RISC-V, for interrupt-controller discovery).

use lazy_static::lazy_static;
use limine::BaseRevision;
use limine::request::HhdmRequest;
use limine::request::MemoryMapRequest;
use limine::request::MpRequest;
use limine::response::MemoryMapResponse;
use limine::response::MpResponse;

#[cfg(target_arch = "riscv64")]
use limine::request::DeviceTreeBlobRequest;

#[used]
#[unsafe(link_section = ".requests")]
static BASE_REVISION: BaseRevision = BaseRevision::with_revision(2);

#[used]
#[unsafe(link_section = ".requests")]
static MP_REQUEST: MpRequest = MpRequest::new();

lazy_static! {
    pub static ref MP_RESPONSE: &'static MpResponse = MP_REQUEST
        .get_response()
        .expect("no Limine MP Response");
}

#[used]
#[unsafe(link_section = ".requests")]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

lazy_static! {
    pub static ref HHDM: usize = get_phy_offset();
}

#[used]
#[unsafe(link_section = ".requests")]
static MMAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[cfg(target_arch = "riscv64")]
#[used]
#[unsafe(link_section = ".requests")]
static DEVICE_TREE_REQUEST: DeviceTreeBlobRequest = DeviceTreeBlobRequest::new();

#[cfg(target_arch = "riscv64")]
pub fn device_tree_addr() -> Option<*const ()> {
    DEVICE_TREE_REQUEST.get_response().map(|r| r.dtb_ptr())
}

pub fn get_phy_offset() -> usize {
    HHDM_REQUEST.get_response().unwrap().offset() as usize
}

pub fn mmap_request() -> &'static MemoryMapResponse {
    MMAP_REQUEST.get_response().unwrap()
}
