//! Command-line tests for the `nodetree` binary.

mod common;

use std::process::Command;

use common::nodetree_exe;

fn write_nodes(contents: &str) -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), contents).unwrap();
    file
}

#[test]
fn test_validate_accepts_node_list() {
    let file = write_nodes(
        r#"[
            {"name": "manager", "cluster": {}},
            {"name": "worker-1", "interface": "eth0", "cpu_affinity": 2, "cluster": {}}
        ]"#,
    );

    let output = Command::new(nodetree_exe())
        .args(["validate", "--nodes"])
        .arg(file.path())
        .output()
        .unwrap();

    assert!(output.status.success(), "{:?}", output);
    let rendered: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(rendered.as_array().unwrap().len(), 2);
    assert_eq!(rendered[1]["interface"], "eth0");
}

#[test]
fn test_validate_rejects_duplicates() {
    let file = write_nodes(r#"[{"name": "w"}, {"name": "w"}]"#);

    let output = Command::new(nodetree_exe())
        .args(["validate", "--nodes"])
        .arg(file.path())
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("duplicate node name"), "{}", stderr);
}

#[test]
fn test_validate_rejects_unknown_fields() {
    let file = write_nodes(r#"[{"name": "w", "colour": "blue"}]"#);

    let output = Command::new(nodetree_exe())
        .args(["validate", "--nodes"])
        .arg(file.path())
        .output()
        .unwrap();

    assert!(!output.status.success());
}

#[test]
fn test_stem_rejects_bad_settings() {
    let output = Command::new(nodetree_exe())
        .args([
            "stem",
            "--read-fd",
            "0",
            "--write-fd",
            "1",
            "--parent-pid",
            "1",
            "--settings",
            "{}",
        ])
        .output()
        .unwrap();

    assert!(!output.status.success());
}
