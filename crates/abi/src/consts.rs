/// Maximum length in bytes of a task name or a named-port name
pub const MAX_NAME_LENGTH: usize = 64;

/// Port id 0 is reserved for "port zero", the task's default inbox
pub const PORT_ZERO: u64 = 0;

/// Maximum number of rights a single message may carry
pub const MESSAGE_RIGHTS_MAX: usize = 4;
