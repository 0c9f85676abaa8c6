//! Console output through the SBI debug console.

use core::fmt;

use crate::utils::locks::SpinLock;

use super::sbi;

pub struct Serial;

impl fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                sbi::console_write_byte(b'\r');
            }
            sbi::console_write_byte(byte);
        }
        Ok(())
    }
}

pub static SERIAL: SpinLock<Serial> = SpinLock::new(Serial);

pub fn init() {}

#[doc(hidden)]
pub fn _serial(args: fmt::Arguments) {
    use fmt::Write;
    crate::arch::without_interrupts(|| {
        SERIAL.lock().write_fmt(args).unwrap();
    });
}
