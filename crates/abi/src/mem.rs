//! Raw flag values for the memory-region syscalls.

/// The region is readable
pub const REGION_READ: u32 = 1 << 0;
/// The region is writable
pub const REGION_WRITE: u32 = 1 << 1;
/// The region is executable
pub const REGION_EXEC: u32 = 1 << 2;
/// Pages of the region share frames copy-on-write with the source
pub const REGION_COW: u32 = 1 << 3;

/// Cache policy selector for phys-mapped regions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RawCachePolicy {
    Normal = 0,
    MemoryNoCache = 1,
    IoNoCache = 2,
}

impl TryFrom<u32> for RawCachePolicy {
    type Error = ();
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Normal),
            1 => Ok(Self::MemoryNoCache),
            2 => Ok(Self::IoNoCache),
            _ => Err(()),
        }
    }
}
