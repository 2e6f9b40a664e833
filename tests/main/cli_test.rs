//! CLI contract tests.

use assert_cmd::Command;

#[test]
fn help_lists_primary_subcommands() {
    let mut cmd = Command::cargo_bin("waygate").expect("binary should build");
    let assert = cmd.arg("--help").assert().success();
    let output = assert.get_output().stdout.clone();
    let text = String::from_utf8(output).expect("help output should be UTF-8");
    assert!(text.contains("start"));
    assert!(text.contains("pair"));
    assert!(text.contains("session"));
}

#[test]
fn session_help_lists_admin_subcommands() {
    let mut cmd = Command::cargo_bin("waygate").expect("binary should build");
    let assert = cmd.args(["session", "--help"]).assert().success();
    let output = assert.get_output().stdout.clone();
    let text = String::from_utf8(output).expect("help output should be UTF-8");
    assert!(text.contains("reset"));
    assert!(text.contains("prune"));
    assert!(text.contains("clear"));
}

#[test]
fn pair_requires_a_number() {
    let mut cmd = Command::cargo_bin("waygate").expect("binary should build");
    cmd.arg("pair").assert().failure();
}

#[test]
fn session_clear_removes_configured_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sessions = dir.path().join("sessions");
    let role_dir = sessions.join("primary");
    std::fs::create_dir_all(&role_dir).expect("create role dir");
    std::fs::write(role_dir.join("creds.json"), "{}").expect("write creds");

    let config_path = dir.path().join("waygate.toml");
    std::fs::write(
        &config_path,
        format!("[session]\ndir = {:?}\n", sessions.display().to_string()),
    )
    .expect("write config");

    let mut cmd = Command::cargo_bin("waygate").expect("binary should build");
    cmd.env("WAYGATE_CONFIG_PATH", &config_path)
        .args(["session", "clear", "--role", "primary"])
        .assert()
        .success();

    assert!(!role_dir.exists());
}
