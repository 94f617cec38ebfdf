//! The bundled patch sets against a mock client image.

use sigpatcher::{
    load_from_path, ApplyRequest, EngineConfig, ErrorKind, PatchEngine, PatchSet,
    ProfileRegistry, RuleStatus,
};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn bundled(name: &str) -> PatchSet {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("patches")
        .join(name);
    load_from_path(&path).unwrap()
}

/// Mock client: a code section with the trust check branch and a data
/// section with URLs.
fn mock_client() -> Vec<u8> {
    let mut image = Vec::new();
    image.extend_from_slice(b"MZ\x90\x00");
    image.resize(0x40, 0xCC);
    // mov eax, [ebp-4]; test eax, eax; je +0x1A; push offset "trust check failed"
    image.extend_from_slice(&[0x8B, 0x45, 0xFC, 0x85, 0xC0, 0x74, 0x1A, 0x68, 0x00, 0x30, 0x40, 0x00]);
    image.resize(0x100, 0xCC);
    image.extend_from_slice(b"https://www.roblox.com/Login\0");
    image.extend_from_slice(b"http://assetgame.roblox.com/asset/?id=\0");
    image.extend_from_slice(b"\0https\0");
    image.extend_from_slice(b"trust check failed for %s\0");
    image
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn write(dir: &TempDir, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join("RobloxPlayerBeta.exe");
    fs::write(&path, bytes).unwrap();
    path
}

fn engine(build: &str) -> PatchEngine {
    PatchEngine::new(EngineConfig {
        client_build: Some(build.to_string()),
        ..EngineConfig::default()
    })
    .unwrap()
}

#[test]
fn test_revival_domain() {
    let dir = TempDir::new().unwrap();
    let target = write(&dir, &mock_client());

    let report = engine("0.463.0").apply_file(&bundled("revival-domain.toml"), &ApplyRequest::new(&target));
    assert!(report.success, "{report}");
    assert_eq!(report.rules[0].offsets.len(), 2);

    let patched = fs::read(&target).unwrap();
    assert!(find(&patched, b"roblox.com").is_none());
    assert!(find(&patched, b"https://www.revive.lan/Login").is_some());
    assert!(find(&patched, b"assetgame.revive.lan").is_some());
    assert_eq!(patched.len(), mock_client().len());
}

#[test]
fn test_trust_check_branch() {
    let dir = TempDir::new().unwrap();
    let target = write(&dir, &mock_client());

    let report = engine("0.463.0").apply_file(&bundled("trust-check.toml"), &ApplyRequest::new(&target));
    assert!(report.success, "{report}");
    assert_eq!(report.rules[0].offsets, vec![0x45]);

    let patched = fs::read(&target).unwrap();
    assert_eq!(&patched[0x43..0x47], &[0x85, 0xC0, 0xEB, 0x1A]);
}

#[test]
fn test_trust_check_outside_build_range() {
    let dir = TempDir::new().unwrap();
    let target = write(&dir, &mock_client());

    let report = engine("0.300.0").apply_file(&bundled("trust-check.toml"), &ApplyRequest::new(&target));
    assert_eq!(report.failure.unwrap().kind, ErrorKind::BuildExcluded);
    assert_eq!(fs::read(&target).unwrap(), mock_client());
}

#[test]
fn test_rcc_plain_http_is_idempotent_in_memory() {
    let engine = engine("0.463.0");
    let set = bundled("rcc-plain-http.toml");

    let first = engine.check(&set, &mock_client());
    assert!(first.success);
    assert_eq!(first.rules[0].status, RuleStatus::Applied);

    let mut patched = mock_client();
    let at = find(&patched, b"\0https\0").unwrap();
    patched[at..at + 7].copy_from_slice(b"\0http\0\0");

    let second = engine.check(&set, &patched);
    assert!(second.success);
    assert_eq!(second.rules[0].status, RuleStatus::AlreadyApplied);
    assert_eq!(second.rules[0].offsets, vec![at]);
}

#[test]
fn test_all_sets_stacked_then_restore() {
    let dir = TempDir::new().unwrap();
    let original = mock_client();
    let target = write(&dir, &original);
    let engine = engine("0.463.0");

    for name in ["revival-domain.toml", "rcc-plain-http.toml", "trust-check.toml"] {
        let report = engine.apply_file(&bundled(name), &ApplyRequest::new(&target));
        assert!(report.committed, "{report}");
    }

    let patched = fs::read(&target).unwrap();
    assert!(find(&patched, b"\0http\0\0").is_some());
    assert!(find(&patched, b"revive.lan").is_some());
    assert_eq!(patched[0x45], 0xEB);

    let record = engine.guard().read_record(&target).unwrap().unwrap();
    assert_eq!(
        record.patch_sets,
        vec!["revival-domain", "rcc-plain-http", "trust-check"]
    );

    // Re-applying any of them is refused
    let again = engine.apply_file(&bundled("rcc-plain-http.toml"), &ApplyRequest::new(&target));
    assert_eq!(again.failure.unwrap().kind, ErrorKind::AlreadyPatched);

    // The backup still holds the untouched original
    engine.guard().restore(&target).unwrap();
    assert_eq!(fs::read(&target).unwrap(), original);
}

#[test]
fn test_identify_mock_client() {
    let original = mock_client();
    let sets = [
        bundled("revival-domain.toml"),
        bundled("rcc-plain-http.toml"),
        bundled("trust-check.toml"),
    ];
    let engine = engine("0.463.0");

    let mut profile = ProfileRegistry::fingerprint(&original, "mock-463");
    profile.patch_sets = vec!["trust-check".into()];
    let registry = ProfileRegistry::new(vec![profile]);

    let exact = registry.identify(&engine, &original, &sets);
    assert_eq!(exact.confidence, sigpatcher::Confidence::Exact);

    let mut tweaked = original.clone();
    tweaked.push(0x00);
    let compatible = registry.identify(&engine, &tweaked, &sets);
    assert_eq!(compatible.confidence, sigpatcher::Confidence::Compatible);
    assert_eq!(compatible.compatible_sets.len(), 3);
    assert_eq!(compatible.candidate_profiles, vec!["mock-463".to_string()]);

    let unrelated = registry.identify(&engine, &[0u8; 64], &sets);
    assert_eq!(unrelated.confidence, sigpatcher::Confidence::Unknown);
}
