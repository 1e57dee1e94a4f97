//! Shared helpers for the command-line tool.
//!
//! This module contains:
//! - Logger initialization
//! - Output helpers that write JSON to a file or stdout

use std::error::Error;
use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use env_logger::fmt::Formatter;
use log::{LevelFilter, Record};
use serde::Serialize;

/// `--log-level` name to a filter. Unknown names yield `None`.
pub fn level_filter(name: &str) -> Option<LevelFilter> {
    name.trim().parse::<LevelFilter>().ok()
}

/// `2026-01-01T00:00:00.000Z INFO  aerosim::engine: message`
fn log_line(buf: &mut Formatter, record: &Record) -> std::io::Result<()> {
    writeln!(
        buf,
        "{} {:<5} {}: {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        record.level(),
        record.target(),
        record.args()
    )
}

/// Append to `path` when given, stderr otherwise.
fn log_target(path: Option<&Path>) -> Result<env_logger::Target, Box<dyn Error>> {
    let Some(path) = path else {
        return Ok(env_logger::Target::Stderr);
    };
    ensure_parent_dir(path)?;
    let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    Ok(env_logger::Target::Pipe(Box::new(file)))
}

/// Install the process-wide logger. An unknown level name falls back to info with a notice.
pub fn init_logger(log_level: &str, log_file: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let level = level_filter(log_level).unwrap_or_else(|| {
        eprintln!("unknown log level '{log_level}', using info");
        LevelFilter::Info
    });
    env_logger::Builder::new()
        .filter_level(level)
        .format(log_line)
        .target(log_target(log_file)?)
        .try_init()?;
    Ok(())
}

/// Create the parent directory of `path` if it has one.
pub fn ensure_parent_dir(path: &Path) -> Result<(), Box<dyn Error>> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Pretty JSON to `output`, or to stdout when no path is given.
pub fn emit_json<T: Serialize>(value: &T, output: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let text = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            ensure_parent_dir(path)?;
            fs::write(path, text)?;
        }
        None => println!("{text}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_parse_case_insensitively() {
        assert_eq!(level_filter("debug"), Some(LevelFilter::Debug));
        assert_eq!(level_filter(" WARN "), Some(LevelFilter::Warn));
        assert_eq!(level_filter("off"), Some(LevelFilter::Off));
        assert_eq!(level_filter("verbose"), None);
    }

    #[test]
    fn file_target_creates_missing_directories() {
        let dir = std::env::temp_dir().join(format!("aerosim-log-{}", std::process::id()));
        let path = dir.join("nested").join("run.log");
        let target = log_target(Some(&path)).unwrap();
        assert!(matches!(target, env_logger::Target::Pipe(_)));
        assert!(path.exists());
        assert!(matches!(log_target(None).unwrap(), env_logger::Target::Stderr));
        fs::remove_dir_all(&dir).unwrap();
    }
}
