//! Serial logging with uptime timestamps.
//!
//! The kernel logs to the serial console only; there is no terminal or
//! framebuffer sink. Every macro here ends up in [`crate::serial!`].

use core::{fmt::Display, sync::atomic::AtomicBool};

use crate::{VirtAddr, arch::registers::StackFrame};

pub static BOOTING: AtomicBool = AtomicBool::new(false);

pub(crate) fn log_time_from_ms(ms: u64) -> (u32, u8, u8, u16) {
    let into_seconds = || (ms / 1000, ms % 1000);
    let into_minutes = || {
        let (seconds, ms) = into_seconds();
        (seconds / 60, seconds % 60, ms)
    };
    let into_hours = || {
        let (minutes, seconds, ms) = into_minutes();
        (minutes / 60, minutes % 60, seconds, ms)
    };

    match ms {
        ..1000 => (0, 0, 0, ms as u16),
        1000..60000 => {
            let (seconds, ms) = into_seconds();
            (0, 0, seconds as u8, ms as u16)
        }
        x if (1000 * 60..=1000 * 60 * 60).contains(&x) => {
            let (minutes, seconds, ms) = into_minutes();
            (0, minutes as u8, seconds as u8, ms as u16)
        }
        _ => {
            let (hours, minutes, seconds, ms) = into_hours();
            (hours as u32, minutes as u8, seconds as u8, ms as u16)
        }
    }
}

#[macro_export]
macro_rules! serial_log {
    ($($arg:tt)*) => {{
        let log_time = $crate::time!();
        let (hours, minutes, seconds, ms) = $crate::logging::log_time_from_ms(log_time);
        $crate::serial!("[{hours:02}:{minutes:02}:{seconds:02}.{ms:03}] {}\n", format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! logln {
    ($($arg:tt)*) => {
        $crate::serial_log!("{}", format_args!($($arg)*))
    };
}

/// prints without a timestamp, for the panic path where the timer may be the
/// thing that blew up
#[macro_export]
macro_rules! panic_println {
    ($($arg:tt)*) => {
        $crate::serial!("{}\n", format_args!($($arg)*))
    };
}

pub const MIN_LOG_TYPE_NAME_WIDTH: usize = 5;

#[macro_export]
macro_rules! logln_ext {
    ($name: literal, $name_color: literal, as $kind: expr, $($arg:tt)*) => {
        $crate::logln!("[  \x1B[{name_color}m{name:<width$}\x1B[0m  ]\x1b[90m {kind}:\x1B[0m {}", format_args!($($arg)*), name_color = $name_color, name = $name, kind = $kind, width = $crate::logging::MIN_LOG_TYPE_NAME_WIDTH)
    };

    ($name: literal, $name_color: literal, $($arg:tt)*) => {
        $crate::logln!("[  \x1B[{name_color}m{name:<width$}\x1B[0m  ]\x1b[90m:\x1B[0m {}", format_args!($($arg)*), name_color = $name_color, name = $name, width = $crate::logging::MIN_LOG_TYPE_NAME_WIDTH)
    };
}

/// runtime debug info, takes an optional $mod which must be a type
#[macro_export]
macro_rules! debug {
    ($mod: ty, $($arg:tt)*) => {{
        // makes sure $mod is a valid type
        let _ = core::marker::PhantomData::<$mod>;
        $crate::logln_ext!("debug", 91, as stringify!($mod), $($arg)*)
    }};
    ($($arg:tt)*) => {{
        $crate::logln_ext!("debug", 91, $($arg)*)
    }};
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => ($crate::logln_ext!("info", 92, $($arg)*));
}

#[macro_export]
macro_rules! warn {
    ($mod: ty, $($arg:tt)*) => {{
        let _ = core::marker::PhantomData::<$mod>;
        $crate::logln_ext!("warn", 93, as stringify!($mod), $($arg)*)
    }};
    ($($arg:tt)*) => ($crate::logln_ext!("warn", 93, $($arg)*));
}

#[macro_export]
macro_rules! error {
    ($mod: ty, $($arg:tt)*) => {{
        let _ = core::marker::PhantomData::<$mod>;
        $crate::logln_ext!("error", 91, as stringify!($mod), $($arg)*)
    }};
    ($($arg:tt)*) => ($crate::logln_ext!("error", 91, $($arg)*));
}

#[derive(Clone, Copy)]
pub struct StackTrace<'a>(&'a StackFrame);

impl<'a> StackTrace<'a> {
    /// Gets the current stack trace, unsafe because the frame chain may be corrupted
    #[inline(always)]
    pub unsafe fn current() -> Self {
        Self(unsafe { StackFrame::get_current() })
    }
}

impl<'a> Display for StackTrace<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        unsafe {
            let mut fp = self.0;
            writeln!(f, "\x1B[34mStack trace:")?;
            loop {
                let return_address = fp.return_ptr();
                if return_address.is_null() {
                    break;
                }
                writeln!(f, "  {:?}", VirtAddr::from_ptr(return_address))?;

                let Some(frame) = fp.prev() else {
                    break;
                };

                fp = frame;
            }
            write!(f, "\x1B[0m")?;
        }
        Ok(())
    }
}
