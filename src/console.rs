// Console output and trace logging. println! goes to the kernel console
// (the in-memory console on the hosted backend, the UART on the embedded
// one); trace lines go through the `log` facade with the subsystem tag as
// the log target, e.g. `[MEM] allocated page ...`.

use core::fmt;

pub fn _print(args: fmt::Arguments) {
    #[cfg(not(target_os = "none"))]
    crate::platform::hosted::console_print(args);

    #[cfg(all(target_arch = "riscv32", target_os = "none"))]
    crate::platform::riscv::console_print(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

pub struct Logger;

static LOGGER: Logger = Logger;

impl log::Log for Logger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        #[cfg(not(target_os = "none"))]
        {
            // Trace output goes to stderr so it never mixes into the
            // captured console stream.
            eprintln!("[{}] {}", record.target(), record.args());
        }

        #[cfg(all(target_arch = "riscv32", target_os = "none"))]
        {
            crate::platform::riscv::console_print(format_args!(
                "[{}] {}\n",
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

pub fn init(level: log::LevelFilter) {
    #[cfg(not(target_os = "none"))]
    {
        // Only the first boot in a process actually installs the logger.
        let _ = log::set_logger(&LOGGER);
    }

    #[cfg(all(target_arch = "riscv32", target_os = "none"))]
    unsafe {
        // Single-hart target; nothing races the one-time install.
        let _ = log::set_logger_racy(&LOGGER);
    }

    log::set_max_level(level);
}
