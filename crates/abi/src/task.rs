//! Raw task-facing values shared with user-space.

/// Priority a task can request through `SysTSetPriority`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RawTaskPriority {
    Default = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    Background = 4,
}

impl TryFrom<u32> for RawTaskPriority {
    type Error = ();
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Default),
            1 => Ok(Self::High),
            2 => Ok(Self::Normal),
            3 => Ok(Self::Low),
            4 => Ok(Self::Background),
            _ => Err(()),
        }
    }
}

/// Notification selection mask for `SysGroupSetNotifier`
pub const NOTIFY_TASK_ADDED: u32 = 1 << 0;
pub const NOTIFY_TASK_REMOVED: u32 = 1 << 1;
pub const NOTIFY_GROUP_DESTROYED: u32 = 1 << 2;
/// Deliver retroactive `Added` events for tasks already in the group
pub const NOTIFY_FOR_EXISTING_TASKS: u32 = 1 << 31;
