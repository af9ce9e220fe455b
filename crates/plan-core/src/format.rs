use crate::config::PlanConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

pub const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";
pub const DIRECTORY_MARKERS: [&str; 3] = ["summary.md", "status.md", "idea.md"];
pub const DIRECTORY_PLAN_SUBDIR: &str = "plan";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PlanFormat {
    Sqlite,
    Directory,
}

impl PlanFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanFormat::Sqlite => "sqlite",
            PlanFormat::Directory => "directory",
        }
    }

    /// Only two formats exist, so the counterpart is a fixed toggle.
    pub fn opposite(&self) -> Self {
        match self {
            PlanFormat::Sqlite => PlanFormat::Directory,
            PlanFormat::Directory => PlanFormat::Sqlite,
        }
    }
}

impl fmt::Display for PlanFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanFormat {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "sqlite" | "db" | "database" => Ok(PlanFormat::Sqlite),
            "directory" | "dir" | "markdown" => Ok(PlanFormat::Directory),
            other => Err(format!("Unknown plan format: {other}")),
        }
    }
}

/// Classifies an existing path. `None` means the format could not be determined,
/// including files that carry the database extension but fail the header check.
pub fn detect_plan_format(path: &Path) -> Option<PlanFormat> {
    let metadata = std::fs::metadata(path).ok()?;
    if metadata.is_dir() {
        let has_marker = DIRECTORY_MARKERS
            .iter()
            .any(|marker| path.join(marker).is_file());
        if has_marker || path.join(DIRECTORY_PLAN_SUBDIR).is_dir() {
            return Some(PlanFormat::Directory);
        }
        return None;
    }
    if metadata.is_file() && has_sqlite_header(path) {
        return Some(PlanFormat::Sqlite);
    }
    None
}

pub fn has_sqlite_header(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut header = [0_u8; 16];
    match file.read_exact(&mut header) {
        Ok(()) => &header == SQLITE_HEADER,
        Err(_) => false,
    }
}

pub fn is_sqlite_path(path: &Path, config: &PlanConfig) -> bool {
    path.to_string_lossy().ends_with(&config.sqlite.extension)
}

pub fn is_directory_path(path: &Path) -> bool {
    if path.exists() {
        return path.is_dir();
    }
    !has_file_extension(&path.to_string_lossy())
}

/// An existing, recognizable plan is never reclassified by path shape.
pub fn infer_format_from_path(path: &Path, config: &PlanConfig) -> PlanFormat {
    if path.exists() {
        if let Some(format) = detect_plan_format(path) {
            return format;
        }
    }
    infer_format_from_shape(path, config)
}

pub fn infer_format_from_shape(path: &Path, config: &PlanConfig) -> PlanFormat {
    if is_sqlite_path(path, config) {
        PlanFormat::Sqlite
    } else if is_directory_path(path) {
        PlanFormat::Directory
    } else {
        config.default_format
    }
}

pub fn validate_plan_path(path: &str, format: PlanFormat, config: &PlanConfig) -> Result<(), String> {
    if path.trim().is_empty() {
        return Err("Plan path cannot be empty".to_string());
    }
    match format {
        PlanFormat::Sqlite => {
            if !path.ends_with(&config.sqlite.extension) {
                return Err(format!(
                    "SQLite plan path must end with {}: {path}",
                    config.sqlite.extension
                ));
            }
        }
        PlanFormat::Directory => {
            if has_file_extension(path) {
                return Err(format!(
                    "Directory plan path must not have a file extension: {path}"
                ));
            }
        }
    }
    Ok(())
}

pub fn format_extension(format: PlanFormat, config: &PlanConfig) -> &str {
    match format {
        PlanFormat::Sqlite => &config.sqlite.extension,
        PlanFormat::Directory => "",
    }
}

pub fn ensure_format_extension(path: &str, format: PlanFormat, config: &PlanConfig) -> String {
    match format {
        PlanFormat::Directory => path.to_string(),
        PlanFormat::Sqlite => {
            let extension = format_extension(format, config);
            if path.ends_with(extension) {
                path.to_string()
            } else {
                format!("{}{extension}", trim_trailing_separators(path))
            }
        }
    }
}

pub fn plan_name_from_path(path: &str, format: PlanFormat, config: &PlanConfig) -> String {
    let trimmed = trim_trailing_separators(path);
    let name = last_segment(trimmed);
    if format == PlanFormat::Sqlite {
        if let Some(stripped) = name.strip_suffix(config.sqlite.extension.as_str()) {
            return stripped.to_string();
        }
    }
    name.to_string()
}

pub fn trim_trailing_separators(path: &str) -> &str {
    let trimmed = path.trim_end_matches(['/', '\\']);
    if trimmed.is_empty() {
        path
    } else {
        trimmed
    }
}

fn last_segment(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// A bare trailing dot does not count as an extension.
fn has_file_extension(path: &str) -> bool {
    let segment = last_segment(trim_trailing_separators(path));
    Path::new(segment)
        .extension()
        .is_some_and(|extension| !extension.is_empty())
}
