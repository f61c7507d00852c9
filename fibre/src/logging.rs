//! Logger plumbing for all long-lived protocol objects. Every connection,
//! protocol instance and adapter carries a child of the process logger so
//! records can be filtered per component.

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::{Build, Config, LoggerConfig};

use crate::status::RichResult;

/// Builds the default terminal logger (debug level, stderr).
pub fn init() -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);
    builder.build().expect("failed to build terminal logger")
}

/// Builds a logger from a TOML logging configuration, e.g.
///
/// ```toml
/// type = "terminal"
/// level = "debug"
/// destination = "stderr"
/// ```
pub fn from_toml(toml: &str) -> RichResult<Logger> {
    let config: LoggerConfig = serdeconv::from_toml_str(toml)
        .map_err(|e| rich_err!("invalid logging config: {}", e))?;
    config
        .build_logger()
        .map_err(|e| rich_err!("failed to build logger: {}", e))
}

/// A logger that drops everything. Used by tests and by components that are
/// constructed without a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml() {
        let log = from_toml(
            r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
        )
        .unwrap();

        trace!(log, "logger built");
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        assert!(from_toml("type = \"no-such-logger\"").is_err());
    }
}
