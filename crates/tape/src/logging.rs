use chrono::Local;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;

use crate::args::ArgError;
use crate::error::{self, TapeError};
use crate::request::RunRequest;

/// Log target of gridsearch progress, which stays at INFO while the runs
/// themselves are quieted.
pub const GRIDSEARCH_TARGET: &str = "gridsearch";

pub const LOG_FILE_NAME: &str = "log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn filter(self) -> LevelFilter {
        match self {
            Self::Debug => LevelFilter::Debug,
            Self::Info => LevelFilter::Info,
            Self::Warn => LevelFilter::Warn,
            Self::Error => LevelFilter::Error,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ArgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" | "10" => Ok(Self::Debug),
            "INFO" | "20" => Ok(Self::Info),
            "WARN" | "WARNING" | "30" => Ok(Self::Warn),
            "ERROR" | "40" => Ok(Self::Error),
            _ => Err(ArgError::InvalidLogLevel(s.to_string())),
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = ArgError;

    fn try_from(value: String) -> Result<Self, ArgError> {
        value.parse()
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        level.to_string()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// The level a request asks for: `log_level` (a name or a number), raised
/// to DEBUG by the `debug` flag. INFO when neither is set.
pub fn level_from_request(request: &RunRequest) -> error::Result<LogLevel> {
    if request.get_bool("debug") == Some(true) {
        return Ok(LogLevel::Debug);
    }
    let raw = match request.get("log_level") {
        None | Some(serde_json::Value::Null) => return Ok(LogLevel::default()),
        Some(serde_json::Value::String(name)) => name.clone(),
        Some(other) => other.to_string(),
    };
    raw.parse()
        .map_err(|err: ArgError| TapeError::config(err.to_string()))
}

/// Writes every record to stderr and to the run's log file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

/// Installs the process logger. The master process (local rank -1 or 0) logs
/// at `level`, every other rank at WARN. With a save path the master also
/// appends to `<save_path>/log`.
///
/// Only the first call in a process takes effect.
pub fn setup_logging(local_rank: i64, save_path: Option<&Path>, level: LogLevel) -> io::Result<()> {
    let is_master = local_rank == -1 || local_rank == 0;
    let filter = if is_master {
        level.filter()
    } else {
        LevelFilter::Warn
    };

    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(filter)
        .filter_module(GRIDSEARCH_TARGET, LevelFilter::Info)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {} -    {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        });

    if let (true, Some(dir)) = (is_master, save_path) {
        fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE_NAME))?;
        builder.target(env_logger::Target::Pipe(Box::new(Tee { file })));
    }

    if builder.try_init().is_err() {
        log::debug!("Logger already installed, keeping it");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_accept_names_and_numbers() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("40".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert!("LOUD".parse::<LogLevel>().is_err());
    }

    #[test]
    fn request_level_honours_debug_and_numbers() {
        let request = RunRequest::new().with("log_level", 30);
        assert_eq!(level_from_request(&request).unwrap(), LogLevel::Warn);
        let request = request.with("debug", true);
        assert_eq!(level_from_request(&request).unwrap(), LogLevel::Debug);
        assert_eq!(
            level_from_request(&RunRequest::new()).unwrap(),
            LogLevel::Info
        );
        let bad = RunRequest::new().with("log_level", "LOUD");
        assert!(matches!(level_from_request(&bad), Err(TapeError::Config(_))));
    }

    #[test]
    fn levels_serialize_by_name() {
        assert_eq!(
            serde_json::to_value(LogLevel::Warn).unwrap(),
            serde_json::json!("WARN")
        );
        let level: LogLevel = serde_json::from_value(serde_json::json!("20")).unwrap();
        assert_eq!(level, LogLevel::Info);
    }
}
