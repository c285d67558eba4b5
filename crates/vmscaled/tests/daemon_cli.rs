//! End-to-end tests of the vmscaled binary.
//!
//! Seeds a state store on disk, runs the binary against it, and checks
//! the printed report and the spool directory.

use std::path::{Path, PathBuf};
use std::process::Command;

use vmscale_state::*;

fn example_config() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("vmscale.example.toml")
}

fn vmscaled() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_vmscaled"));
    cmd.env("RUST_LOG", "warn");
    cmd
}

fn queued_job(job_id: &str, cores: u32, ram: u32) -> Job {
    Job {
        job_id: job_id.to_string(),
        cores,
        ram,
        state: JobState::Queued,
        vm_id: None,
        state_date: epoch_secs(),
    }
}

#[test]
fn check_config_lists_templates() {
    let output = vmscaled()
        .args(["check-config", "--config"])
        .arg(example_config())
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    for name in ["small", "medium", "large"] {
        assert!(stdout.contains(name), "missing {name} in:\n{stdout}");
    }
}

#[test]
fn check_config_rejects_bad_template() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(
        &path,
        "[templates.broken]\ncores = 0\nram = 4\nprofile = \"p\"\n",
    )
    .unwrap();

    let output = vmscaled()
        .args(["check-config", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn once_provisions_for_queued_demand() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    std::fs::create_dir_all(&data_dir).unwrap();

    // 4 cores, 16 GiB of queued work: only `medium` matches the ratio.
    {
        let store = StateStore::open(&data_dir.join("vmscale.redb")).unwrap();
        store.put_job(&queued_job("q1", 2, 8)).unwrap();
        store.put_job(&queued_job("q2", 2, 8)).unwrap();
    }

    let output = vmscaled()
        .args(["once", "--holder", "test-node", "--config"])
        .arg(example_config())
        .arg("--data-dir")
        .arg(&data_dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["demand"]["cores"], 4.0);
    assert_eq!(report["demand"]["ram"], 16.0);
    assert_eq!(report["provisioned"]["template"], "medium");
    assert_eq!(report["provisioned"]["profile"], "highmem-4");

    let vm_id = report["provisioned"]["vm_id"].as_str().unwrap();
    let spooled = data_dir.join("spool").join(format!("{vm_id}.json"));
    assert!(spooled.exists(), "no spool file at {}", spooled.display());

    // The NEW record is in the store.
    let store = StateStore::open(&data_dir.join("vmscale.redb")).unwrap();
    let vm = store.get_vm(vm_id).unwrap().unwrap();
    assert_eq!(vm.state, VmState::New);
    assert_eq!((vm.cores, vm.ram), (4, 16));
}

#[test]
fn once_with_idle_pool_reports_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");

    let output = vmscaled()
        .args(["once", "--config"])
        .arg(example_config())
        .arg("--data-dir")
        .arg(&data_dir)
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["marked_for_death"], serde_json::json!([]));
    assert!(report["provisioned"].is_null());
}
