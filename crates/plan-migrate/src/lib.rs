pub mod migrator;
pub mod validator;

pub use migrator::{
    delete_plan_storage, generate_target_path, infer_target_format, same_store, MigrationError,
    MigrationOptions, MigrationPhase, MigrationProgress, MigrationResult, MigrationStats,
    Migrator, ProgressCallback,
};
pub use validator::{
    validate, ComparisonCounts, ValidationError, ValidationErrorKind, ValidationReport,
};
