// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use opfs_logging::{init_to_file, Level, LogFormat};

#[test]
fn file_logging_creates_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs/nested/opfs-stress.log");

    init_to_file("opfs-stress", Level::INFO, LogFormat::Plaintext, &path).unwrap();
    tracing::warn!(file = "file#3", "failed to release access handle lock");

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("failed to release access handle lock"), "{contents}");
    assert!(contents.contains("WARN"));
    assert!(!contents.contains('\u{1b}'), "file output must not carry ANSI escapes");
}
