//! Integration tests for checkpoint directory management.
//!
//! Every test runs against a private checkpoint root and tmpfs root inside a
//! temporary directory, so memory-backed entries never touch `/dev/shm`.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::PathBuf;

use cellar_checkpoint::commands::{self, CheckpointPaths};
use cellar_checkpoint::{CheckpointKind, CheckpointManager, RunKind};
use cellar_common::constants::{CONTAINER_IMAGE_PATH, CONTAINER_STATE_PATH, REAL_PATH_MARKER};
use cellar_common::error::CellarError;

struct Fixture {
    dir: tempfile::TempDir,
    manager: CheckpointManager,
    tmpfs: PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let tmpfs = dir.path().join("shm");
    let manager = CheckpointManager::new(dir.path().join("criu"), &tmpfs);
    Fixture {
        dir,
        manager,
        tmpfs,
    }
}

fn current_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

// ── Create / Get / Delete ────────────────────────────────────────────

#[test]
fn create_then_get_yields_the_created_kind() {
    let fx = fixture();
    for (name, kind) in [("on-disk", CheckpointKind::Disk), ("in-mem", CheckpointKind::Memory)] {
        let created = fx.manager.create(name, kind).expect("create");
        assert_eq!(created.kind(), kind);
        let fetched = fx.manager.get(name).expect("get");
        assert_eq!(fetched.kind(), kind);
        assert_eq!(fetched.name(), name);
    }
}

#[test]
fn create_existing_name_fails_already_exists() {
    let fx = fixture();
    let _ = fx.manager.create("dup", CheckpointKind::Disk).expect("create");
    let err = fx.manager.create("dup", CheckpointKind::Memory).unwrap_err();
    assert!(matches!(err, CellarError::AlreadyExists { .. }), "{err}");
    assert_eq!(fx.manager.get("dup").unwrap().kind(), CheckpointKind::Disk);
}

#[test]
fn get_and_delete_missing_name_fail_not_found() {
    let fx = fixture();
    assert!(fx.manager.get("ghost").unwrap_err().is_not_found());
    assert!(fx.manager.delete("ghost").unwrap_err().is_not_found());
}

#[test]
fn memory_checkpoint_lifecycle_cleans_backing_dir() {
    let fx = fixture();
    let entry = fx.manager.create("ckpt1", CheckpointKind::Memory).expect("create");

    let marker = std::fs::read_to_string(entry.image_dir().join(REAL_PATH_MARKER)).unwrap();
    let backing = PathBuf::from(marker);
    assert!(backing.starts_with(&fx.tmpfs));
    assert!(backing.is_dir());

    fx.manager.delete("ckpt1").expect("delete");
    assert!(!backing.exists());
    assert!(!entry.path().exists());
    assert!(fx.manager.get("ckpt1").unwrap_err().is_not_found());
}

#[test]
fn tampered_marker_never_removes_foreign_directories() {
    let fx = fixture();
    let entry = fx.manager.create("c", CheckpointKind::Memory).expect("create");
    let precious = fx.dir.path().join("precious");
    std::fs::create_dir(&precious).unwrap();
    std::fs::write(precious.join("data"), "keep").unwrap();
    std::fs::write(
        entry.image_dir().join(REAL_PATH_MARKER),
        precious.as_os_str().as_encoded_bytes(),
    )
    .unwrap();

    let tampered = fx.manager.get("c").expect("get");
    assert!(matches!(tampered.bind_paths(), Err(CellarError::Corrupt { .. })));
    assert!(matches!(
        fx.manager.config("c", CheckpointKind::Disk),
        Err(CellarError::Corrupt { .. })
    ));

    fx.manager.delete("c").expect("delete");
    assert!(!entry.path().exists());
    assert!(precious.join("data").is_file());
}

// ── Config / Sync ────────────────────────────────────────────────────

#[test]
fn config_same_kind_heals_removed_backing_dir() {
    let fx = fixture();
    let entry = fx.manager.create("heal", CheckpointKind::Memory).expect("create");
    let backing = entry.backing_dir().unwrap();
    std::fs::remove_dir_all(&backing).unwrap();

    let healed = fx.manager.config("heal", CheckpointKind::Memory).expect("config");
    assert_eq!(healed.kind(), CheckpointKind::Memory);
    assert!(backing.is_dir());
}

#[test]
fn config_same_kind_keeps_disk_images() {
    let fx = fixture();
    let entry = fx.manager.create("keep", CheckpointKind::Disk).expect("create");
    std::fs::write(entry.image_dir().join("pages-1.img"), b"pages").unwrap();

    let _ = fx.manager.config("keep", CheckpointKind::Disk).expect("config");
    assert!(entry.image_dir().join("pages-1.img").exists());
}

#[test]
fn config_switches_memory_to_disk_and_back() {
    let fx = fixture();
    let entry = fx.manager.create("flip", CheckpointKind::Memory).expect("create");
    let backing = entry.backing_dir().unwrap();

    let disk = fx.manager.config("flip", CheckpointKind::Disk).expect("to disk");
    assert_eq!(disk.kind(), CheckpointKind::Disk);
    assert!(!backing.exists());
    assert!(!disk.image_dir().join(REAL_PATH_MARKER).exists());

    let memory = fx.manager.config("flip", CheckpointKind::Memory).expect("to memory");
    assert_eq!(memory.kind(), CheckpointKind::Memory);
    assert!(memory.backing_dir().unwrap().is_dir());
    assert_eq!(fx.manager.get("flip").unwrap().kind(), CheckpointKind::Memory);
}

#[test]
fn config_on_missing_name_fails_not_found() {
    let fx = fixture();
    assert!(fx.manager.config("nope", CheckpointKind::Disk).unwrap_err().is_not_found());
}

// ── List ─────────────────────────────────────────────────────────────

#[test]
fn list_skips_corrupt_entries_and_plain_files() {
    let fx = fixture();
    let _ = fx.manager.create("good-a", CheckpointKind::Disk).unwrap();
    let _ = fx.manager.create("good-b", CheckpointKind::Memory).unwrap();
    std::fs::create_dir(fx.manager.root().join("partial")).unwrap();
    std::fs::write(fx.manager.root().join("stray.txt"), b"x").unwrap();

    let listed = fx.manager.list().expect("list");
    let names: Vec<_> = listed.iter().map(|e| (e.name(), e.kind())).collect();
    assert_eq!(
        names,
        vec![
            ("good-a".to_string(), CheckpointKind::Disk),
            ("good-b".to_string(), CheckpointKind::Memory),
        ]
    );
}

// ── Bind paths ───────────────────────────────────────────────────────

#[test]
fn disk_entry_binds_only_its_root() {
    let fx = fixture();
    let entry = fx.manager.create("binds-disk", CheckpointKind::Disk).unwrap();
    let binds = entry.bind_paths().unwrap();
    assert_eq!(binds.len(), 1);
    assert_eq!(binds[0].source, entry.path());
    assert_eq!(binds[0].destination, PathBuf::from(CONTAINER_STATE_PATH));
    assert!(!binds[0].is_readonly());
}

#[test]
fn memory_entry_binds_root_and_backing_dir() {
    let fx = fixture();
    let entry = fx.manager.create("binds-mem", CheckpointKind::Memory).unwrap();
    let binds = entry.bind_paths().unwrap();
    assert_eq!(binds.len(), 2);
    assert_eq!(binds[0].destination, PathBuf::from(CONTAINER_STATE_PATH));
    assert_eq!(binds[1].source, entry.backing_dir().unwrap());
    assert_eq!(binds[1].destination, PathBuf::from(CONTAINER_IMAGE_PATH));
}

#[test]
fn host_paths_point_dump_at_backing_dir() {
    let fx = fixture();
    let entry = fx.manager.create("dump-mem", CheckpointKind::Memory).unwrap();
    let paths = entry.host_paths().unwrap();
    let argv = commands::checkpoint_args(&paths, 99, true, None);
    let images = argv.iter().position(|a| a == "--images-dir").unwrap();
    assert_eq!(PathBuf::from(&argv[images + 1]), entry.backing_dir().unwrap());
    assert_ne!(paths, CheckpointPaths::container());
}

// ── Logs ─────────────────────────────────────────────────────────────

#[test]
fn rollback_between_cycles_preserves_previous_logs() {
    use std::io::Write;

    let fx = fixture();
    let entry = fx.manager.create("cycles", CheckpointKind::Disk).unwrap();

    let (mut out, mut err) = entry
        .open_log_files("app", RunKind::Launch, current_uid())
        .expect("open logs");
    out.write_all(b"first run stdout\n").unwrap();
    err.write_all(b"first run stderr\n").unwrap();
    drop((out, err));

    let paths = entry.log_paths("app", RunKind::Launch);
    let before_out = std::fs::read(&paths.stdout).unwrap();
    let before_err = std::fs::read(&paths.stderr).unwrap();

    entry.rollback_log_files("app");

    let (mut out, _err) = entry
        .open_log_files("app", RunKind::Launch, current_uid())
        .expect("reopen logs");
    out.write_all(b"second run stdout\n").unwrap();

    let back = |p: &PathBuf| {
        let mut s = p.clone().into_os_string();
        s.push(".back");
        std::fs::read(PathBuf::from(s)).unwrap()
    };
    assert_eq!(back(&paths.stdout), before_out);
    assert_eq!(back(&paths.stderr), before_err);
    assert!(std::fs::read_to_string(&paths.stdout).unwrap().contains("second run"));
}

#[test]
fn restore_logs_are_separate_from_launch_logs() {
    use std::io::Write;

    let fx = fixture();
    let entry = fx.manager.create("restore-logs", CheckpointKind::Disk).unwrap();
    let (mut launch, _) = entry.open_log_files("svc", RunKind::Launch, current_uid()).unwrap();
    let (mut restore, _) = entry.open_log_files("svc", RunKind::Restore, current_uid()).unwrap();
    launch.write_all(b"launch").unwrap();
    restore.write_all(b"restore").unwrap();

    let launch_paths = entry.log_paths("svc", RunKind::Launch);
    let restore_paths = entry.log_paths("svc", RunKind::Restore);
    assert_eq!(std::fs::read_to_string(launch_paths.stdout).unwrap(), "launch");
    assert_eq!(std::fs::read_to_string(restore_paths.stdout).unwrap(), "restore");
}
