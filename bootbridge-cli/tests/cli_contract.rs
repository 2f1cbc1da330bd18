//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("bootbridge");
    cmd.env_remove("BOOTBRIDGE_PORT")
        .env_remove("BOOTBRIDGE_BAUD")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("bootbridge"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn short_help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("-h")
        .assert()
        .success()
        .stdout(predicate::str::contains("bootbridge"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("bootbridge"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn short_version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("-V")
        .assert()
        .success()
        .stdout(predicate::str::contains("bootbridge"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn list_ports_json_returns_valid_json() {
    let dir = tempdir().expect("tempdir should be created");
    let mut cmd = cli_cmd();
    let output = cmd
        .current_dir(dir.path())
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: serde_json::Value =
        serde_json::from_str(&stdout).expect("stdout should be JSON");
    assert!(parsed.is_array(), "should be a JSON array");
}

#[test]
fn crc_prints_checksum_of_image() {
    let dir = tempdir().expect("tempdir should be created");
    let image = dir.path().join("check.bin");
    fs::write(&image, b"123456789").expect("write image");

    let mut cmd = cli_cmd();
    cmd.arg("crc")
        .arg(image.as_os_str())
        .assert()
        .success()
        .stdout(predicate::str::contains("0xcbf43926").and(predicate::str::contains("  9  ")));
}

#[test]
fn crc_json_reports_size_and_checksum() {
    let dir = tempdir().expect("tempdir should be created");
    let image = dir.path().join("check.bin");
    fs::write(&image, b"123456789").expect("write image");

    let mut cmd = cli_cmd();
    let output = cmd
        .args(["crc", "--json"])
        .arg(image.as_os_str())
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(parsed["size"], 9);
    assert_eq!(parsed["written"], 256);
    assert_eq!(parsed["crc32"], 0xCBF4_3926_u32);
    assert_eq!(parsed["crc32_hex"], "0xcbf43926");
}

#[test]
fn crc_error_keeps_stdout_clean() {
    let dir = tempdir().expect("tempdir should be created");
    let nonexistent = dir.path().join("not_exists.bin");

    let mut cmd = cli_cmd();
    cmd.args(["crc", "--json"])
        .arg(nonexistent.as_os_str())
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"));
}

// ============================================================================
// Exit Code Tests
// ============================================================================

/// Exit code 2: usage error (unknown command, invalid arguments)
#[test]
fn exit_code_two_for_usage_error_unknown_command() {
    let mut cmd = cli_cmd();
    cmd.arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_usage_error_invalid_flag() {
    let mut cmd = cli_cmd();
    cmd.arg("--invalid-flag-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_flash_without_image() {
    let mut cmd = cli_cmd();
    cmd.arg("flash")
        .assert()
        .failure()
        .code(2);
}

/// Exit code 1: the image cannot be read
#[test]
fn exit_code_one_for_missing_image() {
    let dir = tempdir().expect("tempdir should be created");
    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["-p", "INVALID_PORT_NAME_XYZ", "flash", "missing.bin"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Failed to open image"));
}

/// Exit code 3: configuration error
#[test]
fn invalid_config_file_is_a_warning() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("bootbridge.toml"), "invalid toml [[[")
        .expect("write invalid config");

    let mut cmd = cli_cmd();
    let output = cmd
        .current_dir(dir.path())
        .arg("list-ports")
        .output()
        .expect("command should execute");
    assert!(
        output.status.success(),
        "command should succeed despite config warning"
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML");
}

#[test]
fn exit_code_three_for_bad_reset_line() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir.path().join("custom.toml");
    fs::write(&config, "[flash]\nreset_lines = true\nreset_line = \"cts\"\n")
        .expect("write config");
    let image = dir.path().join("app.bin");
    fs::write(&image, [0u8; 16]).expect("write image");

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .arg("--config")
        .arg(config.as_os_str())
        .args(["-p", "INVALID_PORT_NAME_XYZ", "flash"])
        .arg(image.as_os_str())
        .assert()
        .failure()
        .code(3);
}

#[test]
fn exit_code_three_for_shared_reset_line() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir.path().join("custom.toml");
    fs::write(
        &config,
        "[flash]\nreset_lines = true\nboot_select_line = \"rts\"\nreset_line = \"rts\"\n",
    )
    .expect("write config");

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .arg("--config")
        .arg(config.as_os_str())
        .args(["-p", "INVALID_PORT_NAME_XYZ", "sync"])
        .assert()
        .failure()
        .code(3);
}

/// Exit code 4: the serial device cannot be opened
#[test]
fn exit_code_four_for_invalid_port_on_flash() {
    let dir = tempdir().expect("tempdir should be created");
    let image = dir.path().join("app.bin");
    fs::write(&image, [0u8; 16]).expect("write image");
    let staging = dir.path().join("staging");

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["-p", "INVALID_PORT_NAME_XYZ", "flash"])
        .arg(image.as_os_str())
        .arg("--staging-dir")
        .arg(staging.as_os_str())
        .arg("--no-reset")
        .assert()
        .failure()
        .code(4)
        .stdout(predicate::str::is_empty());
}

#[test]
fn exit_code_four_for_invalid_port_on_sync() {
    let dir = tempdir().expect("tempdir should be created");
    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["-p", "INVALID_PORT_NAME_XYZ", "sync"])
        .assert()
        .failure()
        .code(4);
}

#[test]
fn exit_code_four_for_invalid_port_on_monitor() {
    let dir = tempdir().expect("tempdir should be created");
    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["-p", "INVALID_PORT_NAME_XYZ", "monitor"])
        .write_stdin("")
        .assert()
        .failure()
        .code(4)
        .stdout(predicate::str::is_empty());
}

#[test]
fn port_env_var_is_honoured() {
    let dir = tempdir().expect("tempdir should be created");
    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .env("BOOTBRIDGE_PORT", "INVALID_PORT_NAME_XYZ")
        .arg("sync")
        .assert()
        .failure()
        .code(4)
        .stderr(predicate::str::contains("INVALID_PORT_NAME_XYZ"));
}
