use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::config::LoggingConfig;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Verbose = 5,
}

impl LogLevel {
    pub fn from_config_value(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "verbose" | "trace" => Some(Self::Verbose),
            _ => None,
        }
    }

    fn label(self, colored: bool) -> &'static str {
        match (self, colored) {
            (Self::Error, false) => "ERROR",
            (Self::Warn, false) => "WARN",
            (Self::Info, false) => "INFO",
            (Self::Debug, false) => "DEBUG",
            (Self::Verbose, false) => "VERBOSE",
            (Self::Error, true) => "\x1b[31mERROR\x1b[0m",
            (Self::Warn, true) => "\x1b[33mWARN\x1b[0m",
            (Self::Info, true) => "\x1b[32mINFO\x1b[0m",
            (Self::Debug, true) => "\x1b[36mDEBUG\x1b[0m",
            (Self::Verbose, true) => "\x1b[35mVERBOSE\x1b[0m",
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggerConfig {
    pub min_level: LogLevel,
    pub human_friendly: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            human_friendly: false,
        }
    }
}

impl LoggerConfig {
    pub fn from_logging_config(config: &LoggingConfig) -> Option<Self> {
        Some(Self {
            min_level: LogLevel::from_config_value(&config.level)?,
            human_friendly: config.human_friendly,
        })
    }
}

/// Destination for rendered log lines. Sinks are shared between threads.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

#[derive(Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write_line(&self, line: &str) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
    }
}

pub struct Logger {
    config: LoggerConfig,
    sink: Arc<dyn LogSink>,
}

impl Logger {
    pub fn new(config: LoggerConfig) -> Self {
        Self::with_sink(config, Arc::new(StdoutSink))
    }

    pub fn with_sink(config: LoggerConfig, sink: Arc<dyn LogSink>) -> Self {
        Self { config, sink }
    }

    pub fn error(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Error, context, message, None);
    }

    pub fn warn(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Warn, context, message, None);
    }

    pub fn info(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Info, context, message, None);
    }

    pub fn debug(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Debug, context, message, None);
    }

    pub fn log(&self, level: LogLevel, context: Option<&str>, message: &str, payload: Option<Value>) {
        if level > self.config.min_level {
            return;
        }

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut line = format!("{timestamp} [{}]", level.label(self.config.human_friendly));
        if let Some(ctx) = context.filter(|ctx| !ctx.is_empty()) {
            line.push_str(&format!(" [{ctx}]"));
        }
        line.push(' ');
        line.push_str(message);
        if let Some(payload) = payload {
            line.push_str(&format!(" payload={payload}"));
        }

        self.sink.write_line(&line);
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("config", &self.config)
            .field("sink", &"<dyn LogSink>")
            .finish()
    }
}
