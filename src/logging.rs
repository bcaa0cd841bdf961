use std::io::Write;
use std::str::FromStr;

use chrono::Local;
use log::LevelFilter;

/// Environment variable consulted when no level is given on the command line
pub const LOG_LEVEL_ENV: &str = "BLE_CENTRAL_LOGLEVEL";

const DEFAULT_LEVEL: LevelFilter = LevelFilter::Warn;

/// Picks the log level: explicit value, then the environment, then `warn`.
/// Unparseable values fall through to the next source.
pub fn resolve_level(explicit: Option<&str>, from_env: Option<&str>) -> LevelFilter {
    explicit
        .and_then(|level| LevelFilter::from_str(level.trim()).ok())
        .or_else(|| from_env.and_then(|level| LevelFilter::from_str(level.trim()).ok()))
        .unwrap_or(DEFAULT_LEVEL)
}

/// Installs the global logger. Calling it twice is harmless.
pub fn init_logging(explicit: Option<&str>) -> LevelFilter {
    let from_env = std::env::var(LOG_LEVEL_ENV).ok();
    let level = resolve_level(explicit, from_env.as_deref());

    let result = env_logger::Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} [{}] {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();
    if result.is_ok() {
        log::info!("Logging initialized at {}", level);
    }
    level
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_level_wins() {
        assert_eq!(resolve_level(Some("debug"), Some("error")), LevelFilter::Debug);
    }

    #[test]
    fn environment_is_the_fallback() {
        assert_eq!(resolve_level(None, Some("INFO")), LevelFilter::Info);
        assert_eq!(resolve_level(Some("loud"), Some("trace")), LevelFilter::Trace);
    }

    #[test]
    fn defaults_to_warn() {
        assert_eq!(resolve_level(None, None), LevelFilter::Warn);
    }
}
