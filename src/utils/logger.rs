//! Tracing setup and structured log macros for positions and legs

use crate::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Line format of the rolling log file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// Plain text lines
    #[default]
    Text,
    /// One JSON object per event, for log shippers
    Json,
}

/// Install the global subscriber: human-readable console output plus a daily
/// rolling file under the directory of `log_file`.
///
/// `RUST_LOG` overrides `log_level` when set. The returned guard flushes the
/// file writer on drop and must live as long as the process logs.
pub fn init<P: AsRef<Path>>(log_level: &str, log_file: P, format: LogFormat) -> Result<WorkerGuard> {
    let log_file = log_file.as_ref();
    let directory = match log_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(directory)?;
    let file_name = log_file
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("arbitrage.log"));

    let (writer, guard) = tracing_appender::non_blocking(RollingFileAppender::new(Rotation::DAILY, directory, file_name));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let console = fmt::layer().with_target(true).with_line_number(true);

    match format {
        LogFormat::Text => Registry::default()
            .with(filter)
            .with(console)
            .with(fmt::layer().with_ansi(false).with_thread_ids(true).with_writer(writer))
            .try_init()?,
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(console)
            .with(fmt::layer().json().with_current_span(false).with_writer(writer))
            .try_init()?,
    }

    Ok(guard)
}

/// Log one leg's order activity with structured fields
#[macro_export]
macro_rules! log_leg {
    ($level:ident, $position_id:expr, $leg:expr, $exchange:expr, $side:expr, $quantity:expr, $price:expr, $($field:tt)*) => {
        tracing::$level!(
            position_id = %$position_id,
            leg = %$leg,
            exchange = %$exchange,
            side = %$side,
            quantity = %$quantity,
            price = %$price,
            $($field)*
        );
    };
}

/// Log position lifecycle information with structured fields
#[macro_export]
macro_rules! log_position {
    ($level:ident, $position:expr, $($field:tt)*) => {
        tracing::$level!(
            position_id = %$position.position_id,
            symbol = %$position.symbol,
            status = %$position.status,
            part = $position.current_part,
            total_parts = $position.total_parts,
            $($field)*
        );
    };
}

/// Log risk information with structured fields
#[macro_export]
macro_rules! log_risk {
    ($level:ident, $risk_type:expr, $value:expr, $threshold:expr, $($field:tt)*) => {
        tracing::$level!(
            risk_type = %$risk_type,
            value = %$value,
            threshold = %$threshold,
            $($field)*
        );
    };
}
