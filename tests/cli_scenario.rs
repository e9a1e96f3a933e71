use assert_cmd::prelude::*;
use color_eyre::Result;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn test_help_lists_subcommands() -> Result<()> {
    let output = Command::cargo_bin("nodeforge")?.arg("--help").output()?;
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage: nodeforge [OPTIONS] <COMMAND>"), "{}", stdout);
    assert!(stdout.contains("setup"));
    assert!(stdout.contains("teardown"));
    assert!(stdout.contains("--output"));
    Ok(())
}

#[test]
fn test_setup_help_lists_targets() -> Result<()> {
    let output = Command::cargo_bin("nodeforge")?
        .args(["setup", "--help"])
        .output()?;
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    for target in [
        "kernel-modules",
        "bind-mounts",
        "swap",
        "kubelet",
        "kubeadm",
        "alloy",
        "all",
    ] {
        assert!(stdout.contains(target), "missing {} in\n{}", target, stdout);
    }
    Ok(())
}

#[test]
fn test_unknown_target_is_rejected() -> Result<()> {
    Command::cargo_bin("nodeforge")?
        .args(["setup", "etcd"])
        .assert()
        .failure();
    Ok(())
}

#[test]
fn test_teardown_without_recorded_setup_is_skipped() -> Result<()> {
    let dir = tempdir()?;
    let config = dir.path().join("config.yaml");
    std::fs::write(
        &config,
        format!("state_dir: {}\n", dir.path().join("state").display()),
    )?;
    let report = dir.path().join("report.yaml");

    Command::cargo_bin("nodeforge")?
        .env_remove("NODEFORGE_CONFIG")
        .arg("teardown")
        .arg("kubelet")
        .arg("--config")
        .arg(&config)
        .arg("--output")
        .arg(&report)
        .assert()
        .success();

    let yaml = std::fs::read_to_string(&report)?;
    assert!(yaml.contains("id: setup-kubelet"), "{}", yaml);
    assert!(yaml.contains("status: skipped"), "{}", yaml);
    Ok(())
}

#[test]
fn test_unreadable_config_fails() -> Result<()> {
    let dir = tempdir()?;
    Command::cargo_bin("nodeforge")?
        .args(["teardown", "swap", "--config"])
        .arg(dir.path().join("missing.yaml"))
        .assert()
        .failure();
    Ok(())
}
