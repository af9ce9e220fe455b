use crate::{SqliteProvider, StorageError, StorageProvider};
use plan_core::format::{detect_plan_format, ensure_format_extension, infer_format_from_shape};
use plan_core::{PlanConfig, PlanFormat};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Host-supplied constructor for the directory format.
pub type DirectoryProviderFn =
    dyn Fn(&Path, &PlanConfig) -> Result<Box<dyn StorageProvider>, StorageError>;

pub struct ProviderFactory {
    config: PlanConfig,
    directory: Option<Box<DirectoryProviderFn>>,
}

impl ProviderFactory {
    pub fn new(config: PlanConfig) -> Self {
        Self {
            config,
            directory: None,
        }
    }

    pub fn with_directory_provider<F>(mut self, constructor: F) -> Self
    where
        F: Fn(&Path, &PlanConfig) -> Result<Box<dyn StorageProvider>, StorageError> + 'static,
    {
        self.directory = Some(Box::new(constructor));
        self
    }

    pub fn config(&self) -> &PlanConfig {
        &self.config
    }

    pub fn supports(&self, format: PlanFormat) -> bool {
        match format {
            PlanFormat::Sqlite => true,
            PlanFormat::Directory => self.directory.is_some(),
        }
    }

    pub fn resolve_format(&self, path: &Path, forced: Option<PlanFormat>) -> PlanFormat {
        if let Some(format) = forced {
            return format;
        }
        if let Some(format) = detect_plan_format(path) {
            return format;
        }
        infer_format_from_shape(path, &self.config)
    }

    /// Existing paths are used as-is; new ones get the format's extension.
    pub fn resolve_path(&self, path: &Path, format: PlanFormat) -> PathBuf {
        if path.exists() {
            return path.to_path_buf();
        }
        PathBuf::from(ensure_format_extension(
            &path.to_string_lossy(),
            format,
            &self.config,
        ))
    }

    pub fn create_provider(
        &self,
        path: &Path,
        forced: Option<PlanFormat>,
    ) -> Result<Box<dyn StorageProvider>, StorageError> {
        if path.as_os_str().to_string_lossy().trim().is_empty() {
            return Err(StorageError::InvalidPath(
                "plan path cannot be empty".to_string(),
            ));
        }
        let format = self.resolve_format(path, forced);
        let resolved = self.resolve_path(path, format);
        debug!(
            event = "provider_resolved",
            requested = %path.display(),
            resolved = %resolved.display(),
            format = %format,
            forced = forced.is_some()
        );

        match format {
            PlanFormat::Sqlite => {
                if let Some(parent) = resolved.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent)?;
                    }
                }
                let provider = SqliteProvider::open(&resolved, &self.config.sqlite)?;
                Ok(Box::new(provider))
            }
            PlanFormat::Directory => match &self.directory {
                Some(constructor) => constructor(&resolved, &self.config),
                None => Err(StorageError::FormatUnavailable(PlanFormat::Directory)),
            },
        }
    }
}

impl Default for ProviderFactory {
    fn default() -> Self {
        Self::new(PlanConfig::default())
    }
}
