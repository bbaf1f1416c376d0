#![cfg(feature = "storage-rocksdb")]

use assert_cmd::cargo_bin;
use std::io::Write;
use std::process::Command;
use tempfile::tempdir;

const CREATOR_A: &str = "0b6a0c1e-3c1d-4bb0-9f7e-2f1b0d6c9a11";

fn replay(db_path: &std::path::Path, buyer: &str) -> String {
    let mut script = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        script,
        r#"{{"op":"checkout","ref":"a","user_id":"{buyer}","photo_ids":["6f1c9a52-9a3e-4e43-8a59-5f0f5f4e2d02"]}}"#
    )
    .unwrap();
    writeln!(script, r#"{{"op":"webhook","ref":"a","status":"settlement"}}"#).unwrap();

    let mut cmd = Command::new(cargo_bin!("marketplace-settlement"));
    cmd.env_remove("GATEWAY_SERVER_KEY")
        .arg("replay")
        .arg(script.path())
        .arg("--catalog")
        .arg("tests/fixtures/catalog.csv")
        .arg("--db-path")
        .arg(db_path);

    let output = cmd.output().expect("Failed to execute command");
    assert!(output.status.success());
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn balance_of(stdout: &str, creator: &str) -> String {
    stdout
        .lines()
        .find(|line| line.starts_with(creator))
        .and_then(|line| line.rsplit(',').next())
        .unwrap_or_default()
        .to_string()
}

#[test]
fn test_rocksdb_persistence_recovery() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");

    // First run credits the creator once.
    let first = replay(&db_path, "3a7d9e21-5b6c-4f80-a1d2-e3f4a5b6c7d8");
    assert_eq!(balance_of(&first, CREATOR_A), "5000.00");

    // Second run reuses the stored wallet instead of seeding a new one.
    let second = replay(&db_path, "4b8e0f32-6c7d-4091-b2e3-f4a5b6c7d8e9");
    assert_eq!(balance_of(&second, CREATOR_A), "10000.00");
    assert_eq!(second.lines().filter(|line| line.starts_with(CREATOR_A)).count(), 1);
}
