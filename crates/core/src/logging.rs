//! Category-filtered logging for the core.
//!
//! The decode loop logs from hot paths, so every call site passes a closure
//! that is only evaluated when its category and level are enabled.
//!
//! # Architecture
//!
//! - **LogConfig**: process-wide levels stored in atomics, one per category
//!   plus a global fallback
//! - **LogCategory**: CPU, Memory, Io, Interrupts, Stubs
//! - **log()**: the single output path; file output is handed to a
//!   background writer thread so emulation never blocks on disk I/O
//!
//! A per-category rate limit (60 messages per second by default) keeps a
//! tight loop at Trace level from flooding the output; dropped messages are
//! summarized once per second.
//!
//! # Usage
//!
//! ```rust
//! use dos86_core::logging::{log, LogCategory, LogLevel};
//!
//! log(LogCategory::Interrupts, LogLevel::Debug, || {
//!     format!("Interrupts: INT {:02X}", 0x21)
//! });
//! ```

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Log level for controlling verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    /// Parse log level from string (case-insensitive)
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    fn from_u8(val: u8) -> Self {
        match val {
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            5 => LogLevel::Trace,
            _ => LogLevel::Off,
        }
    }
}

/// Subsystem a message comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    /// Decode loop: prefixes, halts, boot
    CPU,
    /// Accesses outside the memory buffer
    Memory,
    /// Port traffic
    Io,
    /// Software, hardware and exception interrupts
    Interrupts,
    /// Unserviced ports, skipped coprocessor escapes
    Stubs,
}

impl LogCategory {
    pub const ALL: [LogCategory; 5] = [
        LogCategory::CPU,
        LogCategory::Memory,
        LogCategory::Io,
        LogCategory::Interrupts,
        LogCategory::Stubs,
    ];

    const COUNT: usize = Self::ALL.len();

    #[inline]
    fn index(self) -> usize {
        self as usize
    }

    /// Parse a category name (case-insensitive)
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cpu" => Some(LogCategory::CPU),
            "memory" | "mem" => Some(LogCategory::Memory),
            "io" | "port" | "ports" => Some(LogCategory::Io),
            "interrupts" | "int" | "irq" => Some(LogCategory::Interrupts),
            "stubs" | "stub" => Some(LogCategory::Stubs),
            _ => None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sliding one-second window of one category
#[derive(Default)]
struct Window {
    stamps: VecDeque<Instant>,
    dropped: usize,
    last_report: Option<Instant>,
}

/// Per-category message rate limit
struct RateLimiter {
    max_per_second: AtomicUsize,
    windows: Mutex<[Window; LogCategory::COUNT]>,
}

impl RateLimiter {
    const SPAN: Duration = Duration::from_secs(1);

    fn new(max_per_second: usize) -> Self {
        Self {
            max_per_second: AtomicUsize::new(max_per_second),
            windows: Mutex::new(Default::default()),
        }
    }

    /// Returns whether the message may be written, plus a count of dropped
    /// messages when one is due to be reported
    fn should_allow(&self, category: LogCategory) -> (bool, Option<usize>) {
        let now = Instant::now();
        let mut windows = lock(&self.windows);
        let window = &mut windows[category.index()];

        while let Some(&front) = window.stamps.front() {
            if now.duration_since(front) > Self::SPAN {
                window.stamps.pop_front();
            } else {
                break;
            }
        }

        let allowed = window.stamps.len() < self.max_per_second.load(Ordering::Relaxed);
        if allowed {
            window.stamps.push_back(now);
        } else {
            window.dropped += 1;
        }

        let report_due = match window.last_report {
            None => true,
            Some(last) => now.duration_since(last) >= Self::SPAN,
        };
        if window.dropped > 0 && (allowed || report_due) {
            let dropped = std::mem::take(&mut window.dropped);
            window.last_report = Some(now);
            return (allowed, Some(dropped));
        }
        (allowed, None)
    }
}

/// Global logging configuration
pub struct LogConfig {
    /// Fallback for categories left at Off
    global_level: AtomicU8,
    levels: [AtomicU8; LogCategory::COUNT],
    /// Background writer, present while a log file is set
    file_sender: Mutex<Option<Sender<String>>>,
    file_enabled: AtomicBool,
    rate_limiter: RateLimiter,
}

impl LogConfig {
    fn new() -> Self {
        Self {
            global_level: AtomicU8::new(LogLevel::Off as u8),
            levels: Default::default(),
            file_sender: Mutex::new(None),
            file_enabled: AtomicBool::new(false),
            rate_limiter: RateLimiter::new(60),
        }
    }

    /// Process-wide instance
    pub fn global() -> &'static Self {
        static INSTANCE: OnceLock<LogConfig> = OnceLock::new();
        INSTANCE.get_or_init(LogConfig::new)
    }

    pub fn set_global_level(&self, level: LogLevel) {
        self.global_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn get_global_level(&self) -> LogLevel {
        LogLevel::from_u8(self.global_level.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, category: LogCategory, level: LogLevel) {
        self.levels[category.index()].store(level as u8, Ordering::Relaxed);
    }

    pub fn get_level(&self, category: LogCategory) -> LogLevel {
        LogLevel::from_u8(self.levels[category.index()].load(Ordering::Relaxed))
    }

    /// A category level other than Off wins; otherwise the global level
    /// decides
    pub fn should_log(&self, category: LogCategory, level: LogLevel) -> bool {
        let limit = match self.get_level(category) {
            LogLevel::Off => self.get_global_level(),
            category_level => category_level,
        };
        level != LogLevel::Off && level <= limit
    }

    /// Reset all logging to Off
    pub fn reset(&self) {
        self.set_global_level(LogLevel::Off);
        for category in LogCategory::ALL {
            self.set_level(category, LogLevel::Off);
        }
    }

    /// Maximum messages per second per category
    pub fn set_rate_limit(&self, max_per_second: usize) {
        self.rate_limiter
            .max_per_second
            .store(max_per_second, Ordering::Relaxed);
    }

    pub fn get_rate_limit(&self) -> usize {
        self.rate_limiter.max_per_second.load(Ordering::Relaxed)
    }

    /// Append log output to `path` from a background thread. Replaces any
    /// previously configured file.
    pub fn set_log_file(&self, path: PathBuf) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let (sender, receiver) = channel::<String>();

        thread::Builder::new()
            .name("log-writer".to_string())
            .spawn(move || {
                // Exits once every sender is dropped
                while let Ok(message) = receiver.recv() {
                    let _ = writeln!(file, "{}", message);
                    let _ = file.flush();
                }
            })?;

        *lock(&self.file_sender) = Some(sender);
        self.file_enabled.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Stop writing to the log file; output returns to stderr
    pub fn clear_log_file(&self) {
        *lock(&self.file_sender) = None;
        self.file_enabled.store(false, Ordering::Relaxed);
    }

    fn write_message(&self, message: String) {
        if self.file_enabled.load(Ordering::Relaxed) {
            if let Some(sender) = lock(&self.file_sender).as_ref() {
                if let Err(err) = sender.send(message) {
                    eprintln!("{}", err.0);
                }
                return;
            }
        }
        eprintln!("{}", message);
    }
}

/// Log a message in `category` at `level`
///
/// `message_fn` runs only when the category is enabled at `level` and the
/// category is under its rate limit.
///
/// ```rust
/// use dos86_core::logging::{log, LogCategory, LogLevel};
///
/// log(LogCategory::CPU, LogLevel::Trace, || {
///     format!("CPU: prefix at IP={:04X}", 0x0100)
/// });
/// ```
pub fn log<F>(category: LogCategory, level: LogLevel, message_fn: F)
where
    F: FnOnce() -> String,
{
    let config = LogConfig::global();
    if !config.should_log(category, level) {
        return;
    }

    let (allowed, dropped) = config.rate_limiter.should_allow(category);
    if let Some(count) = dropped {
        config.write_message(format!(
            "[{:?}] WARNING: Rate limit exceeded, {} log message(s) dropped in the last second",
            category, count
        ));
    }
    if allowed {
        config.write_message(message_fn());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::from_str("OFF"), Some(LogLevel::Off));
        assert_eq!(LogLevel::from_str("err"), Some(LogLevel::Error));
        assert_eq!(LogLevel::from_str("Warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("3"), Some(LogLevel::Info));
        assert_eq!(LogLevel::from_str("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_str("TRACE"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::from_str("verbose"), None);
    }

    #[test]
    fn test_category_parsing() {
        assert_eq!(LogCategory::from_str("CPU"), Some(LogCategory::CPU));
        assert_eq!(LogCategory::from_str("mem"), Some(LogCategory::Memory));
        assert_eq!(LogCategory::from_str("ports"), Some(LogCategory::Io));
        assert_eq!(LogCategory::from_str("irq"), Some(LogCategory::Interrupts));
        assert_eq!(LogCategory::from_str("stubs"), Some(LogCategory::Stubs));
        assert_eq!(LogCategory::from_str("vga"), None);
    }

    #[test]
    fn test_category_level_overrides_global() {
        let config = LogConfig::new();
        config.set_global_level(LogLevel::Error);
        config.set_level(LogCategory::Interrupts, LogLevel::Debug);

        assert!(config.should_log(LogCategory::Interrupts, LogLevel::Debug));
        assert!(!config.should_log(LogCategory::Interrupts, LogLevel::Trace));
        assert!(config.should_log(LogCategory::Memory, LogLevel::Error));
        assert!(!config.should_log(LogCategory::Memory, LogLevel::Warn));
    }

    #[test]
    fn test_everything_off_by_default() {
        let config = LogConfig::new();
        for category in LogCategory::ALL {
            assert_eq!(config.get_level(category), LogLevel::Off);
            assert!(!config.should_log(category, LogLevel::Error));
        }
    }

    #[test]
    fn test_reset() {
        let config = LogConfig::new();
        config.set_global_level(LogLevel::Trace);
        config.set_level(LogCategory::CPU, LogLevel::Debug);
        config.reset();
        assert_eq!(config.get_global_level(), LogLevel::Off);
        assert_eq!(config.get_level(LogCategory::CPU), LogLevel::Off);
    }

    #[test]
    fn test_rate_limiter_is_per_category() {
        let limiter = RateLimiter::new(3);
        for _ in 0..3 {
            assert!(limiter.should_allow(LogCategory::CPU).0);
        }
        assert!(!limiter.should_allow(LogCategory::CPU).0);
        assert!(limiter.should_allow(LogCategory::Io).0);
    }

    #[test]
    fn test_rate_limiter_reports_drops_after_window() {
        let limiter = RateLimiter::new(2);
        limiter.should_allow(LogCategory::Stubs);
        limiter.should_allow(LogCategory::Stubs);
        // First drop is reported immediately, the rest accumulate
        assert_eq!(limiter.should_allow(LogCategory::Stubs), (false, Some(1)));
        for _ in 0..4 {
            assert_eq!(limiter.should_allow(LogCategory::Stubs), (false, None));
        }

        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(limiter.should_allow(LogCategory::Stubs), (true, Some(4)));
    }
}
