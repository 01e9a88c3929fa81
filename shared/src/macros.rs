//! Kernel print macros. Freestanding builds write to the serial port;
//! hosted builds (tests) forward to the standard streams.

#[doc(hidden)]
#[cfg(target_os = "none")]
pub fn _print(args: core::fmt::Arguments<'_>) {
    use core::fmt::Write;
    // SAFETY: the writer is only reached from one CPU; concurrent prints
    // would garble output but not corrupt state.
    unsafe {
        (*core::ptr::addr_of_mut!(crate::serial::SERIAL_WRITER))
            .write_fmt(args)
            .unwrap();
    }
}

#[doc(hidden)]
#[cfg(not(target_os = "none"))]
pub fn _print(args: core::fmt::Arguments<'_>) {
    std::print!("{args}");
}

#[doc(hidden)]
#[cfg(target_os = "none")]
pub fn _eprint(args: core::fmt::Arguments<'_>) {
    _print(args);
}

#[doc(hidden)]
#[cfg(not(target_os = "none"))]
pub fn _eprint(args: core::fmt::Arguments<'_>) {
    std::eprint!("{args}");
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::macros::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! eprint {
    ($($arg:tt)*) => {
        $crate::macros::_eprint(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! eprintln {
    () => {
        $crate::eprint!("\n")
    };
    ($($arg:tt)*) => {
        $crate::eprint!("{}\n", format_args!($($arg)*))
    };
}
