use crate::format::PlanFormat;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_SQLITE_EXTENSION: &str = ".plan";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    pub default_format: PlanFormat,
    pub sqlite: SqliteConfig,
    pub directory: DirectoryConfig,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            default_format: PlanFormat::Sqlite,
            sqlite: SqliteConfig::default(),
            directory: DirectoryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub extension: String,
    pub journal_mode: String,
    pub foreign_keys: bool,
    pub busy_timeout_ms: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            extension: DEFAULT_SQLITE_EXTENSION.to_string(),
            journal_mode: "WAL".to_string(),
            foreign_keys: true,
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub dir_mode: u32,
    pub file_mode: u32,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            dir_mode: 0o755,
            file_mode: 0o644,
        }
    }
}

impl PlanConfig {
    /// Missing files yield the defaults; unreadable or malformed files are errors.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|err| ConfigError::Parse {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        config.validated()
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|err| ConfigError::Parse {
            path: "<inline>".to_string(),
            reason: err.to_string(),
        })?;
        config.validated()
    }

    fn validated(mut self) -> Result<Self, ConfigError> {
        let extension = self.sqlite.extension.trim();
        if extension.is_empty() || extension == "." {
            return Err(ConfigError::Invalid(
                "sqlite.extension must not be empty".to_string(),
            ));
        }
        if !extension.starts_with('.') {
            self.sqlite.extension = format!(".{extension}");
        } else {
            self.sqlite.extension = extension.to_string();
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().expect("temp dir");
        let config = PlanConfig::load(&dir.path().join("absent.toml")).expect("load");
        assert_eq!(config, PlanConfig::default());
        assert_eq!(config.sqlite.extension, ".plan");
        assert_eq!(config.default_format, PlanFormat::Sqlite);
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let config = PlanConfig::from_toml_str(
            r#"
            default_format = "directory"

            [sqlite]
            extension = "db"
            "#,
        )
        .expect("parse");
        assert_eq!(config.default_format, PlanFormat::Directory);
        assert_eq!(config.sqlite.extension, ".db");
        assert_eq!(config.sqlite.journal_mode, "WAL");
        assert_eq!(config.directory.dir_mode, 0o755);
    }

    #[test]
    fn empty_extension_is_rejected() {
        let err = PlanConfig::from_toml_str("[sqlite]\nextension = \"\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("plan.toml");
        fs::write(&path, "default_format = [").expect("write");
        assert!(matches!(
            PlanConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
