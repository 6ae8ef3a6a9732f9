//! CLI integration tests
//!
//! Tests the `regen` binary end to end:
//! - Help and completions
//! - Layer printing
//! - Builds with text and JSON summaries
//! - Error exit codes

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::process::Command;
use tempfile::TempDir;

fn regen_cmd() -> Command {
    let mut cmd = Command::cargo_bin("regen").unwrap();
    cmd.env_remove("RUST_LOG")
        .env_remove("REGEN_JSON")
        .env_remove("REGEN_JOBS")
        .env_remove("REGEN_SOURCE_DIR")
        .env_remove("REGEN_OUTPUT_DIR");
    cmd
}

/// Create a project with a regen.toml at its root
fn create_project(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("regen.toml"), "[paths]\noutput = \"out\"\n").unwrap();
    for (name, content) in files {
        let path = dir.path().join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
    dir
}

const CONCAT_MAKEFILE: &str = "\
all: data/joined.bin
data/joined.bin: data/a.bin data/b.bin
\tcat $^ > $@
";

#[test]
fn test_help_lists_commands() {
    regen_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("layers"))
        .stdout(predicate::str::contains("completions"));
}

#[test]
fn test_completions_bash() {
    regen_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("regen"));
}

#[test]
fn test_layers_one_line_per_layer() {
    let project = create_project(&[("Makefile", CONCAT_MAKEFILE)]);

    regen_cmd()
        .current_dir(project.path())
        .args(["layers", "Makefile"])
        .assert()
        .success()
        .stdout("data/a.bin data/b.bin\ndata/joined.bin\nall\n");
}

#[test]
fn test_layers_json() {
    let project = create_project(&[("Makefile", CONCAT_MAKEFILE)]);

    let output = regen_cmd()
        .current_dir(project.path())
        .args(["layers", "Makefile", "--json"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let layers: Vec<Vec<String>> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(layers.len(), 3);
    assert_eq!(layers[2], vec!["all"]);
}

#[test]
fn test_layers_reports_cycle() {
    let project = create_project(&[("Makefile", "a: b\n\tcat b > a\nb: a\n\tcat a > b\n")]);

    regen_cmd()
        .current_dir(project.path())
        .args(["layers", "Makefile"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Circular dependency"));
}

#[test]
fn test_build_writes_to_output_root() {
    let project = create_project(&[
        ("Makefile", CONCAT_MAKEFILE),
        ("data/a.bin", "AA"),
        ("data/b.bin", "BB"),
    ]);

    regen_cmd()
        .current_dir(project.path())
        .args(["build", "Makefile", "-j", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Build succeeded"));

    let joined = fs::read(project.path().join("out/data/joined.bin")).unwrap();
    assert_eq!(joined, b"AABB");
    assert!(!project.path().join("data/joined.bin").exists());
}

#[test]
fn test_build_json_summary() {
    let project = create_project(&[
        ("Makefile", CONCAT_MAKEFILE),
        ("data/a.bin", "AA"),
        ("data/b.bin", "BB"),
    ]);

    let output = regen_cmd()
        .current_dir(project.path())
        .args(["build", "Makefile", "--json", "-q"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["stats"]["waves"]["built"], 1);
    assert_eq!(report["stats"]["waves"]["layers"], 3);
    assert!(report["stats"]["total_time"].is_f64());
}

#[test]
fn test_build_output_dir_flag() {
    let project = create_project(&[
        ("Makefile", CONCAT_MAKEFILE),
        ("data/a.bin", "1"),
        ("data/b.bin", "2"),
    ]);
    let elsewhere = TempDir::new().unwrap();

    regen_cmd()
        .current_dir(project.path())
        .arg("build")
        .arg("Makefile")
        .arg("--output-dir")
        .arg(elsewhere.path())
        .assert()
        .success();

    assert_eq!(
        fs::read(elsewhere.path().join("data/joined.bin")).unwrap(),
        b"12"
    );
}

#[test]
fn test_build_missing_source_fails() {
    let project = create_project(&[("Makefile", CONCAT_MAKEFILE), ("data/a.bin", "AA")]);

    regen_cmd()
        .current_dir(project.path())
        .args(["build", "Makefile"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("data/b.bin"));
}

#[test]
fn test_build_unknown_command_fails() {
    let project = create_project(&[("Makefile", "x.bin:\n\tperl gen.pl > x.bin\n")]);

    regen_cmd()
        .current_dir(project.path())
        .args(["build", "Makefile"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown command"));
}

#[test]
fn test_build_missing_makefile_fails() {
    let project = create_project(&[]);

    regen_cmd()
        .current_dir(project.path())
        .args(["build", "NoSuchMakefile"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("NoSuchMakefile"));
}

#[test]
fn test_zero_jobs_rejected() {
    let project = create_project(&[("Makefile", CONCAT_MAKEFILE)]);

    regen_cmd()
        .current_dir(project.path())
        .args(["build", "Makefile", "-j", "0"])
        .assert()
        .failure();
}
