//! Logging handle passed to every component at construction.
//!
//! Components never reach for a process-wide logger on their own: they hold a
//! [`Logger`], which is either a view onto whatever the binary installed with
//! the `log` crate ([`Logger::global`]) or any other [`log::Log`]
//! implementation supplied by the caller.
//!
//! `log_debug!`, `log_info!`, `log_warn!` and `log_error!` take that handle
//! as their first argument. They are textually scoped, so `lib.rs` declares
//! this module first with `#[macro_use]`.

use log::{Level, Log, Metadata, Record};
use std::{fmt, sync::Arc};

#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn Log>,
    target: &'static str,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl Logger {
    pub fn new(sink: Arc<dyn Log>, target: &'static str) -> Self {
        Self { sink, target }
    }

    /// Forwards to the logger installed through `log::set_logger`.
    pub fn global(target: &'static str) -> Self {
        Self::new(Arc::new(GlobalLog), target)
    }

    /// Same sink, different target.
    #[must_use]
    pub fn with_target(&self, target: &'static str) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            target,
        }
    }

    pub const fn target(&self) -> &'static str {
        self.target
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        let metadata = Metadata::builder()
            .level(level)
            .target(self.target)
            .build();
        if self.sink.enabled(&metadata) {
            self.sink.log(
                &Record::builder()
                    .metadata(metadata)
                    .args(args)
                    .module_path_static(Some(module_path!()))
                    .build(),
            );
        }
    }
}

struct GlobalLog;

impl Log for GlobalLog {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level() && log::logger().enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        log::logger().log(record);
    }

    fn flush(&self) {
        log::logger().flush();
    }
}

macro_rules! log_at {
    ($logger:expr, $level:expr, $($arg:tt)+) => {
        $logger.log($level, format_args!($($arg)+))
    };
}

macro_rules! log_debug {
    ($logger:expr, $($arg:tt)+) => { log_at!($logger, log::Level::Debug, $($arg)+) };
}

macro_rules! log_info {
    ($logger:expr, $($arg:tt)+) => { log_at!($logger, log::Level::Info, $($arg)+) };
}

macro_rules! log_warn {
    ($logger:expr, $($arg:tt)+) => { log_at!($logger, log::Level::Warn, $($arg)+) };
}

macro_rules! log_error {
    ($logger:expr, $($arg:tt)+) => { log_at!($logger, log::Level::Error, $($arg)+) };
}
