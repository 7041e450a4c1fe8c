use std::process::Command;

fn zkul() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_zkul"));
    cmd.env("ZKUL_LOG", "warn");
    cmd
}

#[test]
fn demo_prints_handover_as_json() {
    let output = zkul().args(["demo"]).output().unwrap();
    assert!(output.status.success(), "{output:?}");

    let events: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let events = events.as_array().unwrap();
    assert_eq!(events.len(), 4);
    assert_eq!(events[0]["owner"], "A");
    assert_eq!(events[0]["action"], "locked");
    assert_eq!(events[0]["node"], "/critical/section0000000000");
    assert_eq!(events[2]["owner"], "B");
    assert_eq!(events[2]["node"], "/critical/section0000000001");
}

#[test]
fn demo_with_custom_lock() {
    let output = zkul().args(["demo", "--name", "/jobs/nightly"]).output().unwrap();
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("/jobs/nightly0000000000"));
}

#[test]
fn relative_lock_name_is_rejected() {
    let output = zkul().args(["demo", "--name", "critical"]).output().unwrap();
    assert!(!output.status.success());
}

#[test]
fn tree_walk_requires_roots() {
    let output = zkul().args(["ephemerals"]).output().unwrap();
    assert!(!output.status.success());
}
