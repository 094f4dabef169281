// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal structured logging with severity levels
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (host ring)
//! PUBLIC API: log_* macros, emit(level,target,args), recent()/contains() on host builds
//! DEPENDS_ON: uart::KernelUart (OS), bounded ring (host)
//! INVARIANTS: Debug/Trace only in debug builds; single-line emission; the console
//!             lock is only taken with interrupts masked

use core::fmt::Arguments;

/// Logging severity used by the kernel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Level {
    const fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn enabled(self) -> bool {
        match self {
            Level::Debug | Level::Trace => cfg!(debug_assertions),
            _ => true,
        }
    }
}

/// Emits a structured log line if the level is enabled for the current build.
pub fn emit(level: Level, target: &'static str, args: Arguments<'_>) {
    if !level.enabled() {
        return;
    }
    sink::write_line(level.tag(), target, args);
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod sink {
    use core::fmt::{Arguments, Write};

    pub(super) fn write_line(tag: &str, target: &str, args: Arguments<'_>) {
        // Interrupt handlers log too; the console lock must not be held across one.
        crate::arch::riscv::without_interrupts(|| {
            let mut uart = crate::uart::KernelUart::lock();
            let writer = &mut *uart;
            let _ = write!(writer, "[{} {}] ", tag, target);
            let _ = writer.write_fmt(args);
            let _ = writer.write_char('\n');
        });
    }
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
mod sink {
    use alloc::{collections::VecDeque, string::String};
    use core::fmt::{Arguments, Write};
    use spin::Mutex;

    const RING_LINES: usize = 256;

    pub(super) static RING: Mutex<VecDeque<String>> = Mutex::new(VecDeque::new());

    pub(super) fn write_line(tag: &str, target: &str, args: Arguments<'_>) {
        let mut line = String::new();
        let _ = write!(line, "[{} {}] ", tag, target);
        let _ = line.write_fmt(args);
        let mut ring = RING.lock();
        if ring.len() == RING_LINES {
            ring.pop_front();
        }
        ring.push_back(line);
    }
}

/// Returns a copy of the most recent log lines (host builds only).
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn recent() -> alloc::vec::Vec<alloc::string::String> {
    sink::RING.lock().iter().cloned().collect()
}

/// Reports whether any retained log line contains `needle` (host builds only).
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn contains(needle: &str) -> bool {
    sink::RING.lock().iter().any(|line| line.contains(needle))
}

#[macro_export]
macro_rules! log_error {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_warn {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_info {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_debug {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_trace {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, module_path!(), format_args!($($arg)+));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_lines_reach_the_ring() {
        log_error!(target: "test", "ring marker {:#x}", 0xfeed_0001usize);
        assert!(contains("[ERROR test] ring marker 0xfeed0001"));
    }

    #[test]
    fn debug_lines_follow_build_profile() {
        log_debug!(target: "test", "debug marker {}", 77_123);
        assert_eq!(contains("debug marker 77123"), cfg!(debug_assertions));
    }
}
