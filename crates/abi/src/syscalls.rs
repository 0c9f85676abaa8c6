/// defines Syscall numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SyscallTable {
    SysTExit = 0,
    SysTYield = 1,
    SysTSleep = 2,
    /// Spawns a new task sharing the caller's address space, given an entry
    /// point and a stack pointer
    SysTSpawn = 3,
    SysTKill = 4,
    SysTSetPriority = 5,
    SysTSetAffinity = 6,

    /// Creates a new port owned by the calling task
    SysPortCreate = 7,
    /// Dequeues the first message of a port, optionally blocking with a
    /// deadline
    SysMsgReceive = 8,
    /// Sends a message through a right, optionally carrying rights and
    /// requesting a reply right
    SysMsgSendRight = 9,
    /// Creates a right to one of the caller's ports inside a task group
    SysRightCreate = 10,
    SysRightDuplicate = 11,
    SysRightDrop = 12,
    /// Binds an ASCII name to a port
    SysPortNameBind = 13,
    /// Requests a notification when a name is bound (or immediately if it is)
    SysPortNameRequest = 14,

    SysMemRegionAnon = 15,
    SysMemRegionPhys = 16,
    SysMemRegionObject = 17,
    SysMemRegionUnmap = 18,
    SysMemObjectCreate = 19,

    SysGroupCreate = 20,
    SysGroupAddTask = 21,
    SysGroupRemoveTask = 22,
    SysGroupSetNotifier = 23,

    /// Installs a user-space interrupt handler on a GSI, delivering to a port
    SysIntSetHandler = 24,
    /// Acknowledges an interrupt, re-enabling delivery
    SysIntComplete = 25,

    /// returns the Uptime of the system in milliseconds
    SysUptime = 26,

    /// Sends a bare message to a port by id (no rights ride along)
    SysMsgSendPort = 27,
}

impl SyscallTable {
    // update when a new Syscall Num is added
    const MAX: u16 = Self::SysMsgSendPort as u16;
}

impl TryFrom<u16> for SyscallTable {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        if value <= Self::MAX {
            Ok(unsafe { core::mem::transmute(value) })
        } else {
            Err(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_round_trip() {
        for raw in 0..=SyscallTable::MAX {
            assert_eq!(SyscallTable::try_from(raw).unwrap() as u16, raw);
        }
        assert!(SyscallTable::try_from(SyscallTable::MAX + 1).is_err());
    }
}
