use std::{fs::OpenOptions, io::Write, str::FromStr};

use anyhow::{Context, Result};
use chrono::Local;
use log::LevelFilter;

use crate::config::models::Log;

/// Colored terminal output via colog, or plain lines appended to `log.file`.
/// `RUST_LOG` overrides the configured level either way.
pub fn init(settings: &Log) -> Result<()> {
    let level = LevelFilter::from_str(&settings.level).unwrap_or(LevelFilter::Info);

    if settings.file.is_empty() {
        let mut builder = colog::default_builder();
        builder.filter_level(level).parse_default_env();
        return builder.try_init().context("Could not initialise logger");
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&settings.file)
        .with_context(|| format!("Could not open log file {}", settings.file))?;

    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(buf, "{} {:<5} {}: {}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"), record.level(), record.target(), record.args())
        })
        .target(env_logger::Target::Pipe(Box::new(file)))
        .try_init()
        .context("Could not initialise logger")
}
