use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

/// `[log]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default = "Log::to_default")]
    pub to: To,
    #[serde(default = "Log::level_default")]
    pub level: Level,
    #[serde(default = "Log::dir_default")]
    pub dir: String,
    #[serde(default = "Log::file_default")]
    pub file: String,
}

impl Default for Log {
    #[inline]
    fn default() -> Self {
        Self { to: Self::to_default(), level: Self::level_default(), dir: Self::dir_default(), file: Self::file_default() }
    }
}

impl Log {
    #[inline]
    fn to_default() -> To {
        To::Console
    }
    #[inline]
    fn level_default() -> Level {
        Level(slog::Level::Info)
    }
    #[inline]
    fn dir_default() -> String {
        "/var/log/ramq".into()
    }
    #[inline]
    fn file_default() -> String {
        "ramq.log".into()
    }

    /// Full path of the log file, empty when no file is configured.
    #[inline]
    pub fn filename(&self) -> String {
        let file = &self.file;
        if file.is_empty() {
            return "".into();
        }
        if self.dir.is_empty() {
            return file.to_owned();
        }
        let dir = self.dir.trim_end_matches(['/', '\\']);
        format!("{dir}/{file}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }
    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }
    #[inline]
    pub fn off(&self) -> bool {
        matches!(self, To::Off)
    }
}

impl FromStr for To {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(To::Off),
            "file" => Ok(To::File),
            "console" => Ok(To::Console),
            "both" => Ok(To::Both),
            other => Err(format!("unknown log target '{other}', expected off, file, console or both")),
        }
    }
}

impl<'de> Deserialize<'de> for To {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        To::from_str(&String::deserialize(deserializer)?).map_err(de::Error::custom)
    }
}

/// Log level, parsed with the same names `slog` uses (`trace` .. `critical`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level(slog::Level);

impl Level {
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.0
    }

    #[inline]
    pub fn to_log_filter(&self) -> log::LevelFilter {
        match self.0 {
            slog::Level::Trace => log::LevelFilter::Trace,
            slog::Level::Debug => log::LevelFilter::Debug,
            slog::Level::Info => log::LevelFilter::Info,
            slog::Level::Warning => log::LevelFilter::Warn,
            slog::Level::Error | slog::Level::Critical => log::LevelFilter::Error,
        }
    }
}

impl From<slog::Level> for Level {
    fn from(l: slog::Level) -> Self {
        Level(l)
    }
}

impl<'de> Deserialize<'de> for Level {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = String::deserialize(deserializer)?;
        let level = slog::Level::from_str(&level).map_err(|_e| de::Error::custom(format!("invalid log level '{level}'")))?;
        Ok(Level(level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_log_section() {
        let log: Log = serde_json::from_str(r#"{"to":"Both","level":"warn","dir":"/tmp/x/","file":"a.log"}"#).unwrap();
        assert_eq!(log.to, To::Both);
        assert!(log.to.file() && log.to.console());
        assert_eq!(log.level.to_log_filter(), log::LevelFilter::Warn);
        assert_eq!(log.filename(), "/tmp/x/a.log");
    }

    #[test]
    fn unknown_target_is_an_error() {
        assert!(serde_json::from_str::<Log>(r#"{"to":"syslog"}"#).is_err());
        assert!(serde_json::from_str::<Log>(r#"{"level":"loud"}"#).is_err());
    }

    #[test]
    fn filename_without_dir() {
        let log = Log { dir: String::new(), ..Default::default() };
        assert_eq!(log.filename(), "ramq.log");
        let log = Log { file: String::new(), ..Default::default() };
        assert_eq!(log.filename(), "");
    }
}
