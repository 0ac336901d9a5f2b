pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};
use std::path::Path;

/// Fallback configuration used when the process supplies no logging config
/// file of its own.
const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds the default terminal logger.
pub fn init() -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(DEFAULT_CONFIG).expect("Default logging configuration must parse");

    config.build_logger().expect("Default logger must build")
}

/// Builds a logger from the supplied TOML configuration file.
pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_file(path).expect("Error loading logging configuration file");

    config.build_logger().expect("Error building configured logger")
}
