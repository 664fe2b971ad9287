pub use slog::*;

use serdeconv;
use sloggers::{Config, LoggerConfig};

/// Builds the root terminal logger. Connection-scoped child loggers are derived from
/// this one with `logger.new(o!(...))`.
pub fn init() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Malformed logger config");

    config.build_logger().expect("Logger construction failed")
}
