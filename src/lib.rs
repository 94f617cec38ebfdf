//! Sigpatcher: signature-based binary patching for game clients
//!
//! Patches are declared as data: a [`PatchSet`] is an ordered list of
//! [`PatchRule`]s, each locating a byte [`Signature`] (with `??` wildcards)
//! and overwriting a region near every selected match. Rules survive client
//! updates that move code around, because they never hard-code offsets.
//!
//! # Architecture
//!
//! Every rule compiles down to one primitive: [`ByteEdit`], a verified
//! byte-span replacement on an in-memory [`WorkingBuffer`]. Intelligence
//! lives in span acquisition ([`PatternMatcher`], offset adjustments and
//! [`Transform`]s), not in the application logic.
//!
//! # Safety
//!
//! - A patch set applies completely or not at all
//! - Edits verify their before-bytes before writing
//! - Resizing rules are refused in safe mode
//! - Atomic file writes (tempfile + fsync + rename)
//! - Backups with checksummed sidecars, rollback on failure
//! - Idempotent operations
//!
//! # Example
//!
//! ```no_run
//! use sigpatcher::{load_from_path, ApplyRequest, EngineConfig, PatchEngine};
//! use std::path::Path;
//!
//! let set = load_from_path("patches/trust-check.toml")?;
//! let engine = PatchEngine::new(EngineConfig::default())?;
//!
//! let report = engine.apply_file(&set, &ApplyRequest::new(Path::new("client.exe")));
//! println!("{report}");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod buffer;
pub mod checksum;
pub mod config;
pub mod edit;
pub mod engine;
pub mod error;
pub mod guard;
pub mod matcher;
pub mod patch;
pub mod profile;
pub mod report;
pub mod signature;
pub mod transform;

// Re-exports
pub use buffer::WorkingBuffer;
pub use checksum::Checksum;
pub use config::{
    load_from_path, load_from_str, load_profiles_from_path, load_profiles_from_str, ConfigError,
    VersionError,
};
pub use edit::{ByteEdit, EditError, EditResult, EditVerification};
pub use engine::{ApplyRequest, CancelToken, EngineConfig, PatchEngine};
pub use error::{ErrorKind, PatchError};
pub use guard::{BackupRecord, IntegrityGuard, Invariants, Snapshot};
pub use matcher::PatternMatcher;
pub use patch::{Occurrence, PatchRule, PatchSet, PostCondition, Replacement, RequiredCount};
pub use profile::{Confidence, FingerprintMatch, ProfileRegistry, VersionProfile};
pub use report::{ApplicationReport, RuleReport, RuleStatus};
pub use signature::{ByteToken, Signature, SignatureError};
pub use transform::{Transform, TransformError};
