use crate::checksum::Checksum;
use crate::config::version::{parse_build, parse_range};
use crate::patch::{
    Occurrence, PatchRule, PatchSet, PatchSetMeta, PostCondition, Replacement, RequiredCount,
};
use crate::signature::{parse_hex_bytes, Signature, SignatureError};
use crate::transform::{Transform, TransformError, TransformParams};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;

/// A patch set document as written on disk.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct PatchSetDocument {
    #[serde(default)]
    pub meta: Metadata,
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub build_range: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuleDefinition {
    pub id: String,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub signature_ascii: Option<String>,
    #[serde(default)]
    pub occurrence: OccurrenceField,
    #[serde(default)]
    pub offset_adjustment: i64,
    #[serde(default)]
    pub region_len: Option<usize>,
    pub replacement: ReplacementDefinition,
    #[serde(default)]
    pub required_count: CountField,
    #[serde(default)]
    pub resize_allowed: bool,
    #[serde(default)]
    pub post_conditions: Vec<PostConditionDefinition>,
}

/// `"first"`, `"all"` or `{ nth = k }`.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(untagged)]
pub enum OccurrenceField {
    Named(OccurrenceName),
    Nth { nth: usize },
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OccurrenceName {
    First,
    All,
}

impl Default for OccurrenceField {
    fn default() -> Self {
        OccurrenceField::Named(OccurrenceName::First)
    }
}

/// An exact count or `"any"`.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(untagged)]
pub enum CountField {
    Exact(usize),
    Keyword(CountKeyword),
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CountKeyword {
    Any,
}

impl Default for CountField {
    fn default() -> Self {
        CountField::Exact(1)
    }
}

/// Exactly one of `bytes`, `ascii` or `transform`.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct ReplacementDefinition {
    #[serde(default)]
    pub bytes: Option<String>,
    #[serde(default)]
    pub ascii: Option<String>,
    #[serde(default)]
    pub transform: Option<String>,
    #[serde(default)]
    pub params: TransformParams,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PostConditionDefinition {
    pub offset: i64,
    #[serde(default)]
    pub relative: bool,
    #[serde(default)]
    pub expected: Option<String>,
    #[serde(default)]
    pub expected_ascii: Option<String>,
}

impl PatchSetDocument {
    /// Validate the document and compile it into a [`PatchSet`].
    ///
    /// Every problem is collected so authors see them all at once.
    pub fn compile(&self) -> Result<PatchSet, ValidationError> {
        let mut issues = Vec::new();

        if self.meta.name.trim().is_empty() {
            issues.push(ValidationIssue::MissingField {
                rule_id: None,
                field: "meta.name",
            });
        }

        let build_range = match self.meta.build_range.as_deref().map(parse_range) {
            Some(Ok(range)) => range,
            Some(Err(e)) => {
                issues.push(ValidationIssue::Invalid {
                    rule_id: None,
                    field: "meta.build_range",
                    message: e.to_string(),
                });
                None
            }
            None => None,
        };

        if self.rules.is_empty() {
            issues.push(ValidationIssue::EmptyRuleList);
        }

        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            if !rule.id.trim().is_empty() && !seen.insert(rule.id.as_str()) {
                issues.push(ValidationIssue::DuplicateId(rule.id.clone()));
            }
            if let Some(compiled) = rule.compile(&mut issues) {
                rules.push(compiled);
            }
        }

        if !issues.is_empty() {
            return Err(ValidationError { issues });
        }

        Ok(PatchSet {
            meta: PatchSetMeta {
                name: self.meta.name.clone(),
                description: self.meta.description.clone(),
                target: self.meta.target.clone(),
                build_range,
            },
            rules,
        })
    }
}

impl RuleDefinition {
    fn compile(&self, issues: &mut Vec<ValidationIssue>) -> Option<PatchRule> {
        let start = issues.len();
        let rule_id = if self.id.trim().is_empty() {
            issues.push(ValidationIssue::MissingField {
                rule_id: None,
                field: "id",
            });
            None
        } else {
            Some(self.id.clone())
        };

        let signature = match (&self.signature, &self.signature_ascii) {
            (Some(hex), None) => Signature::parse(hex)
                .map_err(|source| ValidationIssue::Signature {
                    rule_id: rule_id.clone(),
                    source,
                })
                .map_err(|issue| issues.push(issue))
                .ok(),
            (None, Some(text)) => Signature::from_ascii(text)
                .map_err(|source| ValidationIssue::Signature {
                    rule_id: rule_id.clone(),
                    source,
                })
                .map_err(|issue| issues.push(issue))
                .ok(),
            (None, None) => {
                issues.push(ValidationIssue::MissingField {
                    rule_id: rule_id.clone(),
                    field: "signature",
                });
                None
            }
            (Some(_), Some(_)) => {
                issues.push(ValidationIssue::InvalidCombo {
                    rule_id: rule_id.clone(),
                    message: "signature and signature_ascii are mutually exclusive".to_string(),
                });
                None
            }
        };

        let replacement = self.replacement.compile(rule_id.as_ref(), issues);

        let required_count = match self.required_count {
            CountField::Exact(0) => {
                issues.push(ValidationIssue::Invalid {
                    rule_id: rule_id.clone(),
                    field: "required_count",
                    message: "a rule must expect at least one match".to_string(),
                });
                RequiredCount::default()
            }
            CountField::Exact(n) => RequiredCount::Exactly(n),
            CountField::Keyword(CountKeyword::Any) => RequiredCount::ANY,
        };

        let occurrence = match self.occurrence {
            OccurrenceField::Named(OccurrenceName::First) => Occurrence::First,
            OccurrenceField::Named(OccurrenceName::All) => Occurrence::All,
            OccurrenceField::Nth { nth } => Occurrence::Nth(nth),
        };

        if let (Occurrence::Nth(k), RequiredCount::Exactly(n)) = (occurrence, required_count) {
            if k >= n {
                issues.push(ValidationIssue::InvalidCombo {
                    rule_id: rule_id.clone(),
                    message: format!("occurrence nth({k}) can never be selected from exactly {n} match(es)"),
                });
            }
        }

        if self.region_len == Some(0) && !self.resize_allowed {
            issues.push(ValidationIssue::Invalid {
                rule_id: rule_id.clone(),
                field: "region_len",
                message: "zero-length regions are insertions and require resize_allowed".to_string(),
            });
        }

        let mut post_conditions = Vec::with_capacity(self.post_conditions.len());
        for condition in &self.post_conditions {
            let expected = match (&condition.expected, &condition.expected_ascii) {
                (Some(hex), None) => parse_hex_bytes(hex)
                    .map_err(|source| ValidationIssue::Signature {
                        rule_id: rule_id.clone(),
                        source,
                    })
                    .map_err(|issue| issues.push(issue))
                    .ok(),
                (None, Some(text)) if !text.is_empty() => Some(text.as_bytes().to_vec()),
                _ => {
                    issues.push(ValidationIssue::InvalidCombo {
                        rule_id: rule_id.clone(),
                        message: "post-condition needs exactly one non-empty expected or expected_ascii".to_string(),
                    });
                    None
                }
            };
            if !condition.relative && condition.offset < 0 {
                issues.push(ValidationIssue::Invalid {
                    rule_id: rule_id.clone(),
                    field: "post_conditions.offset",
                    message: "absolute offsets cannot be negative".to_string(),
                });
            }
            if let Some(expected) = expected {
                post_conditions.push(PostCondition {
                    offset: condition.offset,
                    relative: condition.relative,
                    expected,
                });
            }
        }

        let (Some(id), Some(signature), Some(replacement)) = (rule_id.clone(), signature, replacement)
        else {
            return None;
        };

        let rule = PatchRule {
            id,
            signature,
            occurrence,
            offset_adjustment: self.offset_adjustment,
            region_len: self.region_len,
            replacement,
            required_count,
            resize_allowed: self.resize_allowed,
            post_conditions,
        };

        if !rule.has_determinate_region() {
            issues.push(ValidationIssue::InvalidCombo {
                rule_id,
                message: "offset_adjustment with a width-less transform requires region_len"
                    .to_string(),
            });
        }

        (issues.len() == start).then_some(rule)
    }
}

impl ReplacementDefinition {
    fn compile(
        &self,
        rule_id: Option<&String>,
        issues: &mut Vec<ValidationIssue>,
    ) -> Option<Replacement> {
        let rule_id = rule_id.cloned();
        let given = [
            self.bytes.is_some(),
            self.ascii.is_some(),
            self.transform.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count();

        if given != 1 {
            issues.push(ValidationIssue::InvalidCombo {
                rule_id,
                message: "replacement needs exactly one of bytes, ascii or transform".to_string(),
            });
            return None;
        }
        if self.transform.is_none() && !self.params.is_empty() {
            issues.push(ValidationIssue::InvalidCombo {
                rule_id,
                message: "replacement params are only valid with a transform".to_string(),
            });
            return None;
        }

        if let Some(hex) = &self.bytes {
            // Empty bytes are a deletion, which only resize rules may do.
            if hex.trim().is_empty() {
                return Some(Replacement::Bytes(Vec::new()));
            }
            return parse_hex_bytes(hex)
                .map(Replacement::Bytes)
                .map_err(|source| issues.push(ValidationIssue::Signature { rule_id, source }))
                .ok();
        }
        if let Some(text) = &self.ascii {
            return Some(Replacement::Bytes(text.as_bytes().to_vec()));
        }

        let id = self.transform.as_deref().unwrap_or_default();
        Transform::from_params(id, &self.params)
            .map(Replacement::Transform)
            .map_err(|source| issues.push(ValidationIssue::Transform { rule_id, source }))
            .ok()
    }
}

/// Known client builds, matched by whole-file fingerprint.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct ProfileDocument {
    #[serde(default)]
    pub profiles: Vec<ProfileDefinition>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProfileDefinition {
    pub name: String,
    pub checksum: Checksum,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub client_build: Option<String>,
    #[serde(default)]
    pub patch_sets: Vec<String>,
}

impl ProfileDocument {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();
        let mut seen = HashSet::new();

        for profile in &self.profiles {
            if profile.name.trim().is_empty() {
                issues.push(ValidationIssue::MissingField {
                    rule_id: None,
                    field: "profiles.name",
                });
            } else if !seen.insert(profile.name.as_str()) {
                issues.push(ValidationIssue::DuplicateId(profile.name.clone()));
            }
            if let Some(build) = &profile.client_build {
                if let Err(e) = parse_build(build) {
                    issues.push(ValidationIssue::Invalid {
                        rule_id: Some(profile.name.clone()),
                        field: "profiles.client_build",
                        message: e.to_string(),
                    });
                }
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { issues })
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, issue) in self.issues.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone)]
pub enum ValidationIssue {
    EmptyRuleList,
    DuplicateId(String),
    MissingField {
        rule_id: Option<String>,
        field: &'static str,
    },
    Invalid {
        rule_id: Option<String>,
        field: &'static str,
        message: String,
    },
    InvalidCombo {
        rule_id: Option<String>,
        message: String,
    },
    Signature {
        rule_id: Option<String>,
        source: SignatureError,
    },
    Transform {
        rule_id: Option<String>,
        source: TransformError,
    },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::EmptyRuleList => write!(f, "patch set contains no rules"),
            ValidationIssue::DuplicateId(id) => write!(f, "duplicate id '{id}'"),
            ValidationIssue::MissingField { rule_id, field } => match rule_id {
                Some(id) => write!(f, "rule '{id}' missing required field '{field}'"),
                None => write!(f, "missing required field '{field}'"),
            },
            ValidationIssue::Invalid {
                rule_id,
                field,
                message,
            } => match rule_id {
                Some(id) => write!(f, "rule '{id}' has invalid '{field}': {message}"),
                None => write!(f, "invalid '{field}': {message}"),
            },
            ValidationIssue::InvalidCombo { rule_id, message } => match rule_id {
                Some(id) => write!(f, "rule '{id}' has invalid configuration: {message}"),
                None => write!(f, "invalid configuration: {message}"),
            },
            ValidationIssue::Signature { rule_id, source } => match rule_id {
                Some(id) => write!(f, "rule '{id}' has invalid bytes: {source}"),
                None => write!(f, "invalid bytes: {source}"),
            },
            ValidationIssue::Transform { rule_id, source } => match rule_id {
                Some(id) => write!(f, "rule '{id}': {source}"),
                None => write!(f, "{source}"),
            },
        }
    }
}
