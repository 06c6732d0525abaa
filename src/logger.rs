//! Structured logging façade, so the coordinator and engine can emit
//! diagnostics through a pluggable sink instead of calling `tracing` macros
//! directly everywhere.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

pub trait Logger: Send + Sync {
    fn log(&self, log_level: LogLevel, message: &str);
    fn clone_dyn(&self) -> Box<dyn Logger>;
}

impl Clone for Box<dyn Logger> {
    fn clone(&self) -> Self {
        self.clone_dyn()
    }
}

/// Dispatches to `tracing`'s leveled macros. The default sink for a binary
/// that has installed a `tracing_subscriber` subscriber.
#[derive(Clone, Default)]
pub struct StdIoLogger;

impl StdIoLogger {
    pub fn new() -> StdIoLogger {
        StdIoLogger
    }
}

impl Logger for StdIoLogger {
    fn log(&self, log_level: LogLevel, message: &str) {
        match log_level {
            LogLevel::Debug => debug!("{message}"),
            LogLevel::Info => info!("{message}"),
            LogLevel::Warning => warn!("{message}"),
            LogLevel::Error => error!("{message}"),
        }
    }

    fn clone_dyn(&self) -> Box<dyn Logger> {
        Box::new(self.clone())
    }
}
