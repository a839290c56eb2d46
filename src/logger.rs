//! Breadcrumb-flagged logging facility. The core calls into this for every
//! notable lifecycle and error event; where it ships those lines is the
//! embedder's decision, expressed by installing a sink closure.

use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::sync::Arc;

static LOGGER: Lazy<LogManager> = Lazy::new(LogManager::new);

pub fn warn(message: impl Into<String>) {
    LOGGER.log(LogLevel::Warn, message.into());
}

pub fn error(message: impl Into<String>) {
    LOGGER.log(LogLevel::Error, message.into());
}

pub fn info(message: impl Into<String>) {
    LOGGER.log(LogLevel::Info, message.into());
}

pub fn debug(message: impl Into<String>) {
    LOGGER.log(LogLevel::Debug, message.into());
}

pub fn breadcrumb(flag: BreadcrumbFlags, message: impl Into<String>) {
    LOGGER.breadcrumb(flag, message.into());
}

pub type Sink = dyn Fn(LogLevel, BreadcrumbFlags, &str) + Send + Sync;

pub fn install_sink(sink: Option<Arc<Sink>>, min_level: LogLevel, breadcrumbs: BreadcrumbFlags) {
    LOGGER.install_sink(sink, min_level, breadcrumbs);
}

pub fn set_breadcrumb_mask(mask: u32) {
    LOGGER.set_breadcrumb_mask(mask);
}

bitflags! {
    #[derive(Clone, Copy, Debug)]
    pub struct BreadcrumbFlags: u32 {
        const STACK    = 0b0000_0001;
        const TCP      = 0b0000_0010;
        const UDP      = 0b0000_0100;
        const TIMER    = 0b0000_1000;
        const REGISTRY = 0b0001_0000;
        const DEVICE   = 0b0010_0000;
        const ALL      = u32::MAX;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

struct SinkInner {
    callback: Arc<Sink>,
    breadcrumbs: BreadcrumbFlags,
    min_level: LogLevel,
}

struct LogManager {
    sink: Mutex<Option<SinkInner>>,
    prefix: String,
}

impl LogManager {
    fn new() -> Self {
        let pid = std::process::id();
        Self {
            sink: Mutex::new(None),
            prefix: format!("[tunbridge-p{pid}]"),
        }
    }

    fn install_sink(&self, sink: Option<Arc<Sink>>, min_level: LogLevel, breadcrumbs: BreadcrumbFlags) {
        let mut guard = self.sink.lock();
        *guard = sink.map(|callback| SinkInner {
            callback,
            breadcrumbs,
            min_level,
        });
    }

    fn set_breadcrumb_mask(&self, mask: u32) {
        if let Some(inner) = self.sink.lock().as_mut() {
            inner.breadcrumbs = BreadcrumbFlags::from_bits_truncate(mask);
        }
    }

    fn log(&self, level: LogLevel, message: String) {
        if message.is_empty() {
            return;
        }
        self.dispatch(level, BreadcrumbFlags::empty(), message);
    }

    fn breadcrumb(&self, flag: BreadcrumbFlags, message: String) {
        if message.is_empty() || flag.is_empty() {
            return;
        }
        self.dispatch(LogLevel::Debug, flag, message);
    }

    fn dispatch(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, message: String) {
        let guard = self.sink.lock();
        let Some(inner) = guard.as_ref() else { return };
        if level > inner.min_level && breadcrumbs.is_empty() {
            return;
        }
        if !breadcrumbs.is_empty() && !inner.breadcrumbs.intersects(breadcrumbs) {
            return;
        }

        let mut formatted = String::new();
        if breadcrumbs.is_empty() {
            let _ = write!(formatted, "{} {}", self.prefix, message);
        } else {
            let _ = write!(formatted, "{} [{}] {}", self.prefix, label_for(breadcrumbs), message);
        }
        (inner.callback)(level, breadcrumbs, &formatted);
        let _ = level.as_str();
    }
}

fn label_for(flags: BreadcrumbFlags) -> &'static str {
    if flags.contains(BreadcrumbFlags::TCP) {
        "TCP"
    } else if flags.contains(BreadcrumbFlags::UDP) {
        "UDP"
    } else if flags.contains(BreadcrumbFlags::STACK) {
        "STACK"
    } else if flags.contains(BreadcrumbFlags::TIMER) {
        "TIMER"
    } else if flags.contains(BreadcrumbFlags::REGISTRY) {
        "REGISTRY"
    } else if flags.contains(BreadcrumbFlags::DEVICE) {
        "DEVICE"
    } else {
        "LOG"
    }
}
