//! Identify which client build a file is.
//!
//! Known builds are matched by whole-file checksum. Anything else is probed
//! by dry-running the supplied patch sets against it.

use crate::checksum::Checksum;
use crate::config::schema::ProfileDefinition;
use crate::engine::PatchEngine;
use crate::patch::PatchSet;
use serde::Serialize;
use std::fmt;

/// A known client build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionProfile {
    pub name: String,
    pub checksum: Checksum,
    /// File length in bytes, when recorded.
    pub size: Option<u64>,
    pub client_build: Option<String>,
    /// Names of the patch sets authored for this build.
    pub patch_sets: Vec<String>,
}

impl VersionProfile {
    pub fn matches(&self, checksum: Checksum, len: usize) -> bool {
        self.checksum == checksum && self.size.map_or(true, |size| size == len as u64)
    }
}

impl From<ProfileDefinition> for VersionProfile {
    fn from(def: ProfileDefinition) -> Self {
        Self {
            name: def.name,
            checksum: def.checksum,
            size: def.size,
            client_build: def.client_build,
            patch_sets: def.patch_sets,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Unknown,
    /// At least one patch set resolves cleanly.
    Compatible,
    /// Whole-file checksum matches a known profile.
    Exact,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::Unknown => write!(f, "unknown"),
            Confidence::Compatible => write!(f, "compatible"),
            Confidence::Exact => write!(f, "exact"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FingerprintMatch {
    pub confidence: Confidence,
    pub checksum: Checksum,
    pub candidate_profiles: Vec<String>,
    pub compatible_sets: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: Vec<VersionProfile>,
}

impl ProfileRegistry {
    pub fn new(profiles: Vec<VersionProfile>) -> Self {
        Self { profiles }
    }

    pub fn profiles(&self) -> &[VersionProfile] {
        &self.profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&VersionProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Classify `buffer`.
    ///
    /// An exact profile hit reports that profile's patch sets. Otherwise
    /// every set in `sets` is checked in memory with `engine` and the sets
    /// that would apply cleanly are reported as compatible.
    pub fn identify(&self, engine: &PatchEngine, buffer: &[u8], sets: &[PatchSet]) -> FingerprintMatch {
        let checksum = Checksum::of(buffer);
        let exact: Vec<&VersionProfile> = self
            .profiles
            .iter()
            .filter(|p| p.matches(checksum, buffer.len()))
            .collect();

        if !exact.is_empty() {
            return FingerprintMatch {
                confidence: Confidence::Exact,
                checksum,
                candidate_profiles: exact.iter().map(|p| p.name.clone()).collect(),
                compatible_sets: exact
                    .iter()
                    .flat_map(|p| p.patch_sets.iter().cloned())
                    .collect(),
            };
        }

        let compatible_sets: Vec<String> = sets
            .iter()
            .filter(|set| engine.check(set, buffer).success)
            .map(|set| set.name().to_string())
            .collect();

        // Profiles that list a compatible set are the likely builds.
        let candidate_profiles = self
            .profiles
            .iter()
            .filter(|p| p.patch_sets.iter().any(|s| compatible_sets.contains(s)))
            .map(|p| p.name.clone())
            .collect();

        FingerprintMatch {
            confidence: if compatible_sets.is_empty() {
                Confidence::Unknown
            } else {
                Confidence::Compatible
            },
            checksum,
            candidate_profiles,
            compatible_sets,
        }
    }

    /// Profile entry for `buffer`, ready to paste into a profiles file.
    pub fn fingerprint(buffer: &[u8], name: &str) -> VersionProfile {
        VersionProfile {
            name: name.to_string(),
            checksum: Checksum::of(buffer),
            size: Some(buffer.len() as u64),
            client_build: None,
            patch_sets: Vec::new(),
        }
    }
}

impl fmt::Display for VersionProfile {
    /// Renders as a `[[profiles]]` TOML entry.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[[profiles]]")?;
        writeln!(f, "name = {:?}", self.name)?;
        writeln!(f, "checksum = \"{}\"", self.checksum)?;
        if let Some(size) = self.size {
            writeln!(f, "size = {size}")?;
        }
        if let Some(build) = &self.client_build {
            writeln!(f, "client_build = {build:?}")?;
        }
        let sets: Vec<String> = self.patch_sets.iter().map(|s| format!("{s:?}")).collect();
        write!(f, "patch_sets = [{}]", sets.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::load_profiles_from_str;
    use crate::engine::EngineConfig;
    use crate::patch::{PatchRule, Replacement};
    use crate::signature::Signature;

    fn set(name: &str, sig: &str) -> PatchSet {
        PatchSet::new(name).with_rule(PatchRule::new(
            "r",
            Signature::parse(sig).unwrap(),
            Replacement::Bytes(vec![0x90]),
        ))
    }

    fn engine() -> PatchEngine {
        PatchEngine::new(EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_exact_match() {
        let buffer = b"client build 463";
        let mut profile = ProfileRegistry::fingerprint(buffer, "v463");
        profile.patch_sets = vec!["core-463".into()];
        let registry = ProfileRegistry::new(vec![profile]);

        let found = registry.identify(&engine(), buffer, &[]);
        assert_eq!(found.confidence, Confidence::Exact);
        assert_eq!(found.candidate_profiles, vec!["v463".to_string()]);
        assert_eq!(found.compatible_sets, vec!["core-463".to_string()]);
    }

    #[test]
    fn test_size_mismatch_is_not_exact() {
        let buffer = b"abc";
        let mut profile = ProfileRegistry::fingerprint(buffer, "v1");
        profile.size = Some(4);
        let registry = ProfileRegistry::new(vec![profile]);
        assert_eq!(
            registry.identify(&engine(), buffer, &[]).confidence,
            Confidence::Unknown
        );
    }

    #[test]
    fn test_compatible_by_resolution() {
        let registry = ProfileRegistry::default();
        let sets = [set("has-cc", "CC"), set("has-dd", "DD")];
        let found = registry.identify(&engine(), &[0x00, 0xCC], &sets);
        assert_eq!(found.confidence, Confidence::Compatible);
        assert_eq!(found.compatible_sets, vec!["has-cc".to_string()]);
    }

    #[test]
    fn test_fingerprint_round_trips_through_loader() {
        let mut profile = ProfileRegistry::fingerprint(b"bytes", "local");
        profile.client_build = Some("0.463.0".into());
        let loaded = load_profiles_from_str(&profile.to_string()).unwrap();
        assert_eq!(loaded, vec![profile]);
    }
}
