use std::fs;
use std::process::Command;

fn nullflow() -> String {
    std::env::var("CARGO_BIN_EXE_nullflow").unwrap_or_else(|_| {
        let mut path = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("target");
        path.push("debug");
        path.push("nullflow");
        if cfg!(windows) {
            path.set_extension("exe");
        }
        path.to_string_lossy().to_string()
    })
}

#[test]
fn nullflow_exits_non_zero_on_missing_input() {
    let output = Command::new(nullflow())
        .arg("--input")
        .arg("missing.json")
        .arg("--quiet")
        .output()
        .expect("run nullflow");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("input not found"));
}

#[test]
fn nullflow_exits_non_zero_on_malformed_document() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let input = temp_dir.path().join("program.json");
    fs::write(
        &input,
        r#"{"methods": [{"id": {"owner": "p/A", "name": "run", "descriptor": "()V"},
            "cfg": {"blocks": [{"start_offset": 0, "instructions": [
                {"offset": 0, "kind": {"op": "return_void"}}]}],
                "edges": [{"from": 0, "to": 9, "kind": "jump"}]}}]}"#,
    )
    .expect("write input");

    let output = Command::new(nullflow())
        .arg("--input")
        .arg(&input)
        .arg("--quiet")
        .output()
        .expect("run nullflow");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("0 -> 9"));
}

#[test]
fn nullflow_exits_zero_on_empty_program() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let input = temp_dir.path().join("program.json");
    fs::write(&input, "{}").expect("write input");

    let output = Command::new(nullflow())
        .arg("--input")
        .arg(&input)
        .arg("--quiet")
        .output()
        .expect("run nullflow");

    assert!(output.status.success());
}
