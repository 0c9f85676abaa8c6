use super::sbi;

pub fn shutdown() -> ! {
    sbi::system_reset(sbi::RESET_SHUTDOWN, 0)
}

pub fn reboot() -> ! {
    sbi::system_reset(sbi::RESET_COLD_REBOOT, 0)
}
