//! 日志配置
//!
//! 日志按天滚动写入文件，聊天界面占用标准输出，所以控制台输出默认关闭。

use std::path::PathBuf;
use std::str::FromStr;
use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    filter::LevelFilter,
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

/// 日志文件前缀
const LOG_FILE_PREFIX: &str = "lchat";

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("未知的日志级别: {}", other)),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// 日志目录
    pub log_dir: PathBuf,
    /// 日志级别
    pub level: LogLevel,
    /// 是否同时输出到标准错误
    pub console_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            level: LogLevel::default(),
            console_output: false,
        }
    }
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置日志目录
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// 设置日志级别
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// 设置是否输出到标准错误
    pub fn with_console_output(mut self, output: bool) -> Self {
        self.console_output = output;
        self
    }

    /// 初始化日志系统
    ///
    /// 只能调用一次。返回的 guard 必须存活到程序退出，否则缓冲的日志会丢失。
    pub fn init(self) -> Result<WorkerGuard, Box<dyn std::error::Error>> {
        std::fs::create_dir_all(&self.log_dir)?;

        let file_appender = rolling::daily(&self.log_dir, LOG_FILE_PREFIX);
        let (non_blocking_file, guard) = non_blocking(file_appender);
        let filter = self.level.to_level_filter();

        let file_layer = fmt::layer()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true)
            .with_filter(filter);

        let console_layer = self.console_output.then(|| {
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(filter)
        });

        tracing_subscriber::registry()
            .with(file_layer)
            .with(console_layer)
            .try_init()?;

        Ok(guard)
    }
}
