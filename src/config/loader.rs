//! Reading patch set and profile documents from TOML.

use crate::config::schema::{PatchSetDocument, ProfileDocument, ValidationError};
use crate::patch::PatchSet;
use crate::profile::VersionProfile;
use serde::de::DeserializeOwned;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Which kind of document failed to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    PatchSet,
    Profiles,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKind::PatchSet => write!(f, "patch set"),
            DocumentKind::Profiles => write!(f, "profile list"),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Toml {
        kind: DocumentKind,
        path: Option<PathBuf>,
        source: toml_edit::de::Error,
    },
    Validation {
        kind: DocumentKind,
        path: Option<PathBuf>,
        source: ValidationError,
    },
}

impl ConfigError {
    /// File the error came from, if known.
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigError::Io { path, .. } => Some(path),
            ConfigError::Toml { path, .. } | ConfigError::Validation { path, .. } => {
                path.as_deref()
            }
        }
    }

    fn with_path(mut self, file: &Path) -> Self {
        if let ConfigError::Toml { path, .. } | ConfigError::Validation { path, .. } = &mut self {
            path.get_or_insert_with(|| file.to_path_buf());
        }
        self
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let at = |path: &Option<PathBuf>| match path {
            Some(path) => format!(" ({})", path.display()),
            None => String::new(),
        };
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            ConfigError::Toml { kind, path, source } => {
                write!(f, "{kind}{} is not valid TOML: {source}", at(path))
            }
            ConfigError::Validation { kind, path, source } => {
                write!(f, "invalid {kind}{}:\n{source}", at(path))
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Toml { source, .. } => Some(source),
            ConfigError::Validation { source, .. } => Some(source),
        }
    }
}

fn parse<T: DeserializeOwned>(kind: DocumentKind, input: &str) -> Result<T, ConfigError> {
    toml_edit::de::from_str(input).map_err(|source| ConfigError::Toml {
        kind,
        path: None,
        source,
    })
}

fn read_then<T>(
    path: &Path,
    load: impl FnOnce(&str) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load(&contents).map_err(|error| error.with_path(path))
}

/// Parse, validate and compile a patch set document.
pub fn load_from_str(input: &str) -> Result<PatchSet, ConfigError> {
    let kind = DocumentKind::PatchSet;
    parse::<PatchSetDocument>(kind, input)?
        .compile()
        .map_err(|source| ConfigError::Validation {
            kind,
            path: None,
            source,
        })
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<PatchSet, ConfigError> {
    read_then(path.as_ref(), load_from_str)
}

pub fn load_profiles_from_str(input: &str) -> Result<Vec<VersionProfile>, ConfigError> {
    let kind = DocumentKind::Profiles;
    let document: ProfileDocument = parse(kind, input)?;
    if let Err(source) = document.validate() {
        return Err(ConfigError::Validation {
            kind,
            path: None,
            source,
        });
    }
    Ok(document.profiles.into_iter().map(VersionProfile::from).collect())
}

pub fn load_profiles_from_path(path: impl AsRef<Path>) -> Result<Vec<VersionProfile>, ConfigError> {
    read_then(path.as_ref(), load_profiles_from_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_document() {
        let err = load_from_str("[meta]\nname = \"empty\"\n").unwrap_err();
        assert!(err.to_string().starts_with("invalid patch set:\n"));

        let err = load_profiles_from_str("profiles = 3").unwrap_err();
        assert!(err.to_string().starts_with("profile list is not valid TOML"));
    }

    #[test]
    fn test_path_is_attached_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("broken.toml");
        fs::write(&file, "[meta\n").unwrap();

        let err = load_from_path(&file).unwrap_err();
        assert_eq!(err.path(), Some(file.as_path()));
        assert_eq!(err.with_path(Path::new("other.toml")).path(), Some(file.as_path()));
    }
}
