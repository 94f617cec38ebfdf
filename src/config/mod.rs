//! Patch set and profile documents: schema, loading and build ranges.

pub mod loader;
pub mod schema;
pub mod version;

pub use loader::{
    load_from_path, load_from_str, load_profiles_from_path, load_profiles_from_str, ConfigError,
    DocumentKind,
};
pub use schema::{
    Metadata, PatchSetDocument, ProfileDefinition, ProfileDocument, ReplacementDefinition,
    RuleDefinition, ValidationError, ValidationIssue,
};
pub use version::{build_in_range, parse_build, VersionError};
