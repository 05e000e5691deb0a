use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub mod formatter;
pub mod writer;

pub use formatter::*;
pub use writer::*;

use crate::configs::LoggingConfig;

static LOG_FILE: OnceLock<BoundedLogFile> = OnceLock::new();

/// `println!` that is mirrored into the log file once one is open.
#[macro_export]
macro_rules! log_println {
    () => {{
        std::println!();
        $crate::common::logger::append_raw("\n");
    }};
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        std::println!("{}", msg);
        $crate::common::logger::append_raw(&format!("{}\n", msg));
    }};
}

pub fn append_raw(msg: &str) {
    if let Some(mut file) = LOG_FILE.get().cloned() {
        use std::io::Write;
        let _ = file.write_all(strip_ansi_escapes(msg).as_bytes());
    }
}

/// Builds the filter directive string: `<level>,<filters>`.
pub fn filter_directives(config: &LoggingConfig) -> String {
    let level = config.level.as_deref().unwrap_or("info");
    match config.filters.as_deref().map(str::trim) {
        Some(filters) if !filters.is_empty() => format!("{level},{filters}"),
        _ => level.to_string(),
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(config: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let stdout_layer = fmt::layer()
        .event_format(NodeFormatter::new(true))
        .with_ansi(true);

    let file_layer = config.file.as_ref().and_then(|file| {
        match BoundedLogFile::open(&file.path, file.max_lines) {
            Ok(writer) => {
                let _ = LOG_FILE.set(writer.clone());
                Some(
                    fmt::layer()
                        .with_writer(writer)
                        .event_format(NodeFormatter::new(false))
                        .with_ansi(false),
                )
            }
            Err(e) => {
                eprintln!("failed to open log file {}: {e}", file.path);
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_append_filters_to_level() {
        let config = LoggingConfig {
            level: Some("debug".into()),
            filters: Some("hyper=warn,tokio_tungstenite=info".into()),
            file: None,
        };
        assert_eq!(
            filter_directives(&config),
            "debug,hyper=warn,tokio_tungstenite=info"
        );
        assert_eq!(filter_directives(&LoggingConfig::default()), "info");
    }
}
