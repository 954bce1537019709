//! log4rs setup for the binary and for tests that want to see pipeline output.
use crate::error::{NNIFError, Result};
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::Path;

const CONSOLE_PATTERN: &str = "{d(%H:%M:%S)} {h({l})} - {m}{n}";
const FILE_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} {l} {t} - {m}{n}";

/// Builds a config with a stderr appender and, if `log_file` is given, a file
/// appender receiving the same records.
///
/// # Errors
/// If the log file cannot be opened or the config is malformed.
pub fn logging_config(level: LevelFilter, log_file: Option<&Path>) -> Result<Config> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(CONSOLE_PATTERN)))
        .build();
    let mut builder = Config::builder().appender(Appender::builder().build("stderr", Box::new(stderr)));
    let mut root = Root::builder().appender("stderr");
    if let Some(path) = log_file {
        let logfile = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(FILE_PATTERN)))
            .build(path)?;
        builder = builder.appender(Appender::builder().build("logfile", Box::new(logfile)));
        root = root.appender("logfile");
    }
    builder
        .build(root.build(level))
        .map_err(|e| NNIFError::config(format!("invalid logging config: {}", e)))
}

/// Installs the global logger. Fails if one is already installed.
///
/// # Errors
pub fn init_logging(level: LevelFilter, log_file: Option<&Path>) -> Result<()> {
    let config = logging_config(level, log_file)?;
    log4rs::init_config(config)
        .map(|_handle| ())
        .map_err(|e| NNIFError::config(format!("logger already initialised: {}", e)))
}
