//! Backup, commit and rollback behaviour of the integrity guard

use filetime::FileTime;
use sigpatcher::guard::Invariants;
use sigpatcher::{BackupRecord, Checksum, IntegrityGuard, PatchError, WorkingBuffer};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_commit_then_rollback_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("client.exe");
    let original: Vec<u8> = (0..1500u32).map(|i| (i * 7 % 251) as u8).collect();
    fs::write(&target, &original).unwrap();
    let mtime = FileTime::from_unix_time(1_500_000_000, 0);
    filetime::set_file_mtime(&target, mtime).unwrap();

    let guard = IntegrityGuard::default();
    let snapshot = guard.snapshot(&target).unwrap();

    let mut patched = original.clone();
    patched[100] ^= 0xFF;
    patched.extend_from_slice(b"tail");
    guard
        .commit(&snapshot, &WorkingBuffer::new(patched.clone()), &target, "demo")
        .unwrap();
    assert_eq!(fs::read(&target).unwrap(), patched);

    guard.rollback(snapshot).unwrap();
    assert_eq!(fs::read(&target).unwrap(), original);
    let meta = fs::metadata(&target).unwrap();
    assert_eq!(FileTime::from_last_modification_time(&meta), mtime);

    // Rolled back, so a fresh run is not refused
    let record = guard.read_record(&target).unwrap().unwrap();
    assert_eq!(record.patched_checksum, None);
    assert!(guard.snapshot(&target).is_ok());
}

#[test]
fn test_sidecar_format() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("client.exe");
    fs::write(&target, b"abc").unwrap();

    let guard = IntegrityGuard::default();
    let _snapshot = guard.snapshot(&target).unwrap();

    let raw = fs::read_to_string(guard.record_path(&target)).unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(json["original_checksum"], Checksum::of(b"abc").to_string());
    assert_eq!(json["original_len"], 3);
    assert!(json["patched_checksum"].is_null());

    let record: BackupRecord = serde_json::from_str(&raw).unwrap();
    assert_eq!(record.original_len, 3);
}

#[test]
fn test_custom_suffix() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("client.exe");
    fs::write(&target, b"abc").unwrap();

    let guard = IntegrityGuard::new("orig");
    let _snapshot = guard.snapshot(&target).unwrap();
    assert!(dir.path().join("client.exe.orig").exists());
    assert!(dir.path().join("client.exe.orig.json").exists());
}

#[test]
fn test_restore_without_backup() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("client.exe");
    fs::write(&target, b"abc").unwrap();

    let err = IntegrityGuard::default().restore(&target).unwrap_err();
    assert!(matches!(err, PatchError::Io { .. }));
    assert_eq!(fs::read(&target).unwrap(), b"abc");
}

#[test]
fn test_restore_after_patch_session() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("client.exe");
    fs::write(&target, b"original").unwrap();

    let guard = IntegrityGuard::default();
    let snapshot = guard.snapshot(&target).unwrap();
    guard
        .commit(&snapshot, &WorkingBuffer::new(b"patched!".to_vec()), &target, "demo")
        .unwrap();
    drop(snapshot);

    // A later process only has the files on disk
    let restored = IntegrityGuard::default().restore(&target).unwrap();
    assert_eq!(restored, Checksum::of(b"original"));
    assert_eq!(fs::read(&target).unwrap(), b"original");
}

#[test]
fn test_changed_file_gets_fresh_backup() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("client.exe");
    fs::write(&target, b"build 1").unwrap();

    let guard = IntegrityGuard::default();
    let snapshot = guard.snapshot(&target).unwrap();
    guard
        .commit(&snapshot, &WorkingBuffer::new(b"build 1 patched".to_vec()), &target, "demo")
        .unwrap();

    // Client updated itself
    fs::write(&target, b"build 2").unwrap();
    let snapshot = guard.snapshot(&target).unwrap();
    assert_eq!(snapshot.bytes(), b"build 2");
    assert_eq!(fs::read(guard.backup_path(&target)).unwrap(), b"build 2");
}

#[test]
fn test_verify_invariants() {
    let guard = IntegrityGuard::default();
    let buffer = [0xEB, 0x05, 0x90];

    let ok = Invariants::default().with_region(0, vec![0xEB]);
    assert!(guard.verify(&buffer, &ok));

    let wrong = Invariants {
        checksum: Some(Checksum::of(b"other")),
        ..Invariants::default()
    };
    assert!(!guard.verify(&buffer, &wrong));
}
