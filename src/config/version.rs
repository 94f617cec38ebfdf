//! Client build filtering using semver constraints
//!
//! Patch sets may declare `build_range = ">=0.450.0, <0.500.0"`; the engine
//! is told which client build it is patching and skips sets that do not
//! cover it.

use semver::{Version, VersionReq};
use std::fmt;

/// Errors parsing builds and build ranges
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// Invalid client build string (e.g., "2016L")
    InvalidBuild { value: String, source: String },
    /// Invalid build range (e.g., ">=bad")
    InvalidRange { value: String, source: String },
}

impl fmt::Display for VersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionError::InvalidBuild { value, source } => {
                write!(f, "invalid client build '{}': {}", value, source)
            }
            VersionError::InvalidRange { value, source } => {
                write!(f, "invalid build range '{}': {}", value, source)
            }
        }
    }
}

impl std::error::Error for VersionError {}

pub fn parse_build(build: &str) -> Result<Version, VersionError> {
    Version::parse(build.trim()).map_err(|e| VersionError::InvalidBuild {
        value: build.to_string(),
        source: e.to_string(),
    })
}

/// Parse a build range; blank means "every build".
pub fn parse_range(range: &str) -> Result<Option<VersionReq>, VersionError> {
    let range = range.trim();
    if range.is_empty() {
        return Ok(None);
    }
    VersionReq::parse(range)
        .map(Some)
        .map_err(|e| VersionError::InvalidRange {
            value: range.to_string(),
            source: e.to_string(),
        })
}

/// Check if a client build falls inside a range string
///
/// # Examples
///
/// ```
/// use sigpatcher::config::version::build_in_range;
///
/// assert!(build_in_range("0.450.3", Some(">=0.450.0")).unwrap());
/// assert!(!build_in_range("0.449.0", Some(">=0.450.0, <0.500.0")).unwrap());
///
/// // No range means "every build"
/// assert!(build_in_range("1.0.0", None).unwrap());
/// ```
pub fn build_in_range(build: &str, range: Option<&str>) -> Result<bool, VersionError> {
    let Some(req) = range.map(parse_range).transpose()?.flatten() else {
        return Ok(true);
    };
    Ok(req.matches(&parse_build(build)?))
}
