//! Centralized logging configuration for the emulator.
//!
//! Every component logs through [`log`], which is gated by a process-wide
//! [`LogConfig`]. Levels can be set globally or per [`LogCategory`]; a
//! category level that is not `Off` takes precedence over the global one.
//!
//! - **LogConfig**: thread-safe global configuration using atomics
//! - **LogLevel**: `Off < Error < Warn < Info < Debug < Trace`
//! - **LogCategory**: CPU, Bus, Devices, Interrupts, Dos, Bios, Stubs
//! - **log()**: lazily formatted, rate limited output to stderr or a file
//!
//! File output is written by a background thread so a slow disk never
//! stalls the emulation thread.
//!
//! ```rust
//! use xtemu_core::logging::{log, LogCategory, LogLevel};
//!
//! log(LogCategory::Dos, LogLevel::Debug, || {
//!     format!("INT 21h AH={:02X}", 0x48)
//! });
//! ```

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

const CATEGORY_COUNT: usize = 7;

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

    fn label(self) -> &'static str {
        match self {
            LogLevel::Off => "OFF",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

/// Log category for the different machine components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    /// Instruction execution, decode faults, call tracing
    CPU,
    /// Memory and IO port accesses
    Bus,
    /// PIT, keyboard controller, VGA and the scheduler
    Devices,
    /// Hardware and software interrupt delivery
    Interrupts,
    /// DOS syscalls, allocator and loader
    Dos,
    /// BIOS services
    Bios,
    /// Unimplemented features
    Stubs,
}

impl LogCategory {
    pub const ALL: [LogCategory; CATEGORY_COUNT] = [
        LogCategory::CPU,
        LogCategory::Bus,
        LogCategory::Devices,
        LogCategory::Interrupts,
        LogCategory::Dos,
        LogCategory::Bios,
        LogCategory::Stubs,
    ];

    /// Parse a category name (case-insensitive)
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cpu" => Some(LogCategory::CPU),
            "bus" => Some(LogCategory::Bus),
            "devices" | "dev" => Some(LogCategory::Devices),
            "interrupts" | "int" => Some(LogCategory::Interrupts),
            "dos" => Some(LogCategory::Dos),
            "bios" => Some(LogCategory::Bios),
            "stubs" => Some(LogCategory::Stubs),
            _ => None,
        }
    }

    fn index(self) -> usize {
        match self {
            LogCategory::CPU => 0,
            LogCategory::Bus => 1,
            LogCategory::Devices => 2,
            LogCategory::Interrupts => 3,
            LogCategory::Dos => 4,
            LogCategory::Bios => 5,
            LogCategory::Stubs => 6,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while logging must not disable logging for every other thread.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sliding one-second window per category.
struct RateLimiter {
    max_logs_per_second: AtomicUsize,
    window_duration: Duration,
    state: Mutex<[RateWindow; CATEGORY_COUNT]>,
}

#[derive(Default)]
struct RateWindow {
    timestamps: VecDeque<Instant>,
    dropped: usize,
    last_drop_report: Option<Instant>,
}

impl RateLimiter {
    fn new(max_logs_per_second: usize) -> Self {
        Self {
            max_logs_per_second: AtomicUsize::new(max_logs_per_second),
            window_duration: Duration::from_secs(1),
            state: Mutex::new(Default::default()),
        }
    }

    /// Returns whether the message may be emitted, and the number of
    /// messages dropped since the last report when one is due.
    fn should_allow(&self, category: LogCategory) -> (bool, Option<usize>) {
        let now = Instant::now();
        let mut state = lock(&self.state);
        let window = &mut state[category.index()];

        while let Some(&front) = window.timestamps.front() {
            if now.duration_since(front) > self.window_duration {
                window.timestamps.pop_front();
            } else {
                break;
            }
        }

        let max_logs = self.max_logs_per_second.load(Ordering::Relaxed);
        if window.timestamps.len() < max_logs {
            window.timestamps.push_back(now);
            if window.dropped > 0 {
                let dropped = std::mem::take(&mut window.dropped);
                window.last_drop_report = Some(now);
                return (true, Some(dropped));
            }
            return (true, None);
        }

        window.dropped += 1;
        let report_due = match window.last_drop_report {
            None => true,
            Some(last) => now.duration_since(last) >= Duration::from_secs(1),
        };
        if report_due {
            window.last_drop_report = Some(now);
            (false, Some(std::mem::take(&mut window.dropped)))
        } else {
            (false, None)
        }
    }
}

/// Global logging configuration
pub struct LogConfig {
    global_level: AtomicU8,
    category_levels: [AtomicU8; CATEGORY_COUNT],
    log_sender: Mutex<Option<Sender<String>>>,
    file_logging_enabled: AtomicBool,
    rate_limiter: RateLimiter,
}

impl LogConfig {
    /// All logging disabled, 60 messages per second per category.
    fn new() -> Self {
        Self {
            global_level: AtomicU8::new(LogLevel::Off as u8),
            category_levels: Default::default(),
            log_sender: Mutex::new(None),
            file_logging_enabled: AtomicBool::new(false),
            rate_limiter: RateLimiter::new(60),
        }
    }

    /// Get the global singleton instance
    pub fn global() -> &'static Self {
        use std::sync::OnceLock;
        static INSTANCE: OnceLock<LogConfig> = OnceLock::new();
        INSTANCE.get_or_init(LogConfig::new)
    }

    pub fn set_global_level(&self, level: LogLevel) {
        self.global_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn get_global_level(&self) -> LogLevel {
        LogLevel::from_u8(self.global_level.load(Ordering::Relaxed))
    }

    /// Set log level for a specific category
    pub fn set_level(&self, category: LogCategory, level: LogLevel) {
        self.category_levels[category.index()].store(level as u8, Ordering::Relaxed);
    }

    pub fn get_level(&self, category: LogCategory) -> LogLevel {
        LogLevel::from_u8(self.category_levels[category.index()].load(Ordering::Relaxed))
    }

    /// Check if a message should be logged for the given category and level
    pub fn should_log(&self, category: LogCategory, level: LogLevel) -> bool {
        if level == LogLevel::Off {
            return false;
        }
        let category_level = self.get_level(category);
        if category_level != LogLevel::Off {
            level <= category_level
        } else {
            level <= self.get_global_level()
        }
    }

    /// Reset all logging to Off
    pub fn reset(&self) {
        self.set_global_level(LogLevel::Off);
        for category in LogCategory::ALL {
            self.set_level(category, LogLevel::Off);
        }
    }

    /// Set the maximum logs per second per category
    pub fn set_rate_limit(&self, max_logs_per_second: usize) {
        self.rate_limiter
            .max_logs_per_second
            .store(max_logs_per_second, Ordering::Relaxed);
    }

    pub fn get_rate_limit(&self) -> usize {
        self.rate_limiter.max_logs_per_second.load(Ordering::Relaxed)
    }

    /// Send all further output to `path` instead of stderr.
    ///
    /// The file is appended to by a dedicated `log-writer` thread. Calling
    /// this again replaces the previous writer.
    pub fn set_log_file(&self, path: PathBuf) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (sender, receiver) = channel::<String>();

        thread::Builder::new()
            .name("log-writer".to_string())
            .spawn(move || {
                let mut file = file;
                while let Ok(message) = receiver.recv() {
                    let _ = writeln!(file, "{}", message);
                    let _ = file.flush();
                }
            })?;

        *lock(&self.log_sender) = Some(sender);
        self.file_logging_enabled.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Stop logging to file; the writer thread exits once its channel closes.
    pub fn clear_log_file(&self) {
        *lock(&self.log_sender) = None;
        self.file_logging_enabled.store(false, Ordering::Relaxed);
    }

    fn write_message(&self, message: &str) {
        if self.file_logging_enabled.load(Ordering::Relaxed) {
            if let Some(sender) = lock(&self.log_sender).as_ref() {
                if sender.send(message.to_string()).is_ok() {
                    return;
                }
            }
        }
        eprintln!("{}", message);
    }
}

/// Log a message with the specified category and level.
///
/// `message_fn` only runs when the category/level is enabled and the rate
/// limiter lets the message through. Output lines look like
/// `[DEBUG] [Dos] INT 21h AH=48`.
pub fn log<F>(category: LogCategory, level: LogLevel, message_fn: F)
where
    F: FnOnce() -> String,
{
    let config = LogConfig::global();
    if !config.should_log(category, level) {
        return;
    }

    let (allowed, dropped_count) = config.rate_limiter.should_allow(category);
    if let Some(count) = dropped_count.filter(|&c| c > 0) {
        config.write_message(&format!(
            "[WARN] [{:?}] rate limit exceeded, {} message(s) dropped",
            category, count
        ));
    }

    if allowed {
        let message = message_fn();
        config.write_message(&format!("[{}] [{:?}] {}", level.label(), category, message));
    }
}
