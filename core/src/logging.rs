// SPDX-License-Identifier: LGPL-3.0-or-later

//! Logging setup (§6, §9 "Logging"). The core emits `tracing` events at the
//! levels the reference source's own message facility used; this module
//! just wires a subscriber for binaries that embed the library directly
//! rather than going through `dppctl-cli`.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Mirrors the reference source's own log-level tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    pub fn parse(value: &str) -> Result<Self, crate::error::Error> {
        match value.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            other => Err(crate::error::Error::LogLevel(other.to_string())),
        }
    }

    fn as_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warning => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
        }
    }
}

/// Installs a `tracing-subscriber` formatter at `level`, honoring
/// `RUST_LOG` if set so host applications can override per-module.
pub fn init_logging(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_tracing_level().to_string()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_known_levels_case_insensitively() {
        assert_eq!(LogLevel::parse("INFO").unwrap(), LogLevel::Info);
        assert_eq!(LogLevel::parse("warn").unwrap(), LogLevel::Warning);
        assert!(LogLevel::parse("bogus").is_err());
    }
}
