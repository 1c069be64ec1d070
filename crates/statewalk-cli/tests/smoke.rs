use serde_json::Value;
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

const CHAIN: &str = r#"
digraph chain {
    default_only_vm1="qcow2"
    vm1 [type="object", name="vm1.qcow2.Fedora.33"]
    "0scan" [name="0scan"]
    a [name="quicktest.a", vms="vm1", set_state="s1", unset_mode="fi"]
    b [name="quicktest.b", vms="vm1", get_state="s1", set_state="s2", unset_mode="fi"]
    "0scan" -> a -> b
}
"#;

fn write_dot_file(path: &Path) {
    fs::write(path, CHAIN).expect("dot file should write");
}

fn run_cli(args: &[&str], cwd: &Path) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_statewalk"))
        .args(args)
        .current_dir(cwd)
        .env_remove("RUST_LOG")
        .output()
        .expect("cli process should start")
}

fn describe(output: &std::process::Output) -> String {
    format!(
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

#[test]
fn run_command_dot_file_event_json_expected_success_output() {
    let temp = TempDir::new().expect("tempdir should create");
    let dot_file = temp.path().join("chain.dot");
    write_dot_file(&dot_file);

    let output = run_cli(
        &[
            "run",
            "--dot-file",
            dot_file.to_str().expect("dot file path should be utf8"),
            "--event-json",
        ],
        temp.path(),
    );

    assert!(output.status.success(), "{}", describe(&output));
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    assert!(stdout.contains("\"category\":\"traversal\""));
    assert!(stdout.contains("run_id: chain-run"));
    assert!(stdout.contains("tags: completed"));
    assert!(stdout.contains("executed: 0scan, a, b, cb, ca"));
    assert!(stdout.contains("cleaned: cb, ca"));
}

#[test]
fn run_command_failing_command_expected_exit_code_two() {
    let temp = TempDir::new().expect("tempdir should create");
    let dot_file = temp.path().join("chain.dot");
    write_dot_file(&dot_file);

    let output = run_cli(
        &[
            "run",
            "--dot-file",
            dot_file.to_str().expect("dot file path should be utf8"),
            "--command",
            "test \"$STATEWALK_SHORTNAME\" != b",
            "--no-stream-events",
        ],
        temp.path(),
    );

    assert_eq!(output.status.code(), Some(2), "{}", describe(&output));
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    assert!(stdout.contains("tags: completed, tests_failed"));
    assert!(stdout.contains("failed: b"));
}

#[test]
fn run_command_param_tokens_expected_overrides_forwarded() {
    let temp = TempDir::new().expect("tempdir should create");
    let dot_file = temp.path().join("chain.dot");
    let seen = temp.path().join("seen");
    write_dot_file(&dot_file);
    let command = format!("cat >> '{}'; echo >> '{}'", seen.display(), seen.display());

    let output = run_cli(
        &[
            "run",
            "--dot-file",
            dot_file.to_str().expect("dot file path should be utf8"),
            "--param",
            "mem=4096",
            "--command",
            &command,
            "--no-stream-events",
        ],
        temp.path(),
    );

    assert!(output.status.success(), "{}", describe(&output));
    let payloads = fs::read_to_string(&seen).expect("payloads should be written");
    let unset = payloads
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str::<Value>(line).expect("payload should parse"))
        .find(|payload| payload.get("shortname").and_then(Value::as_str) == Some("cb"))
        .expect("unset of b should run");
    assert_eq!(
        unset
            .get("params")
            .and_then(|params| params.get("mem"))
            .and_then(Value::as_str),
        Some("4096")
    );
}

#[test]
fn run_command_internal_selection_expected_error() {
    let temp = TempDir::new().expect("tempdir should create");
    let source = r#"
        digraph internal {
            default_only_vm1="qcow2"
            vm1 [type="object"]
            "0scan" [name="0scan"]
            "0root" [name="nonleaves.internal.0root", vms="vm1"]
            "0scan" -> "0root"
        }
    "#;

    let output = run_cli(
        &[
            "run",
            "--dot-source",
            source,
            "--param",
            "only=nonleaves",
            "--param",
            "only=0root",
            "--no-stream-events",
        ],
        temp.path(),
    );

    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
    let stderr = String::from_utf8(output.stderr).expect("stderr should be utf8");
    assert!(stderr.contains("error: "));
    assert!(stderr.contains("internal tests"));
}

#[test]
fn run_command_without_graph_expected_error() {
    let temp = TempDir::new().expect("tempdir should create");

    let output = run_cli(&["run"], temp.path());

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8(output.stderr).expect("stderr should be utf8");
    assert!(stderr.contains("one of --dot-file or --dot-source is required"));
}

#[test]
fn visualize_command_expected_loadable_dot() {
    let temp = TempDir::new().expect("tempdir should create");

    let output = run_cli(&["visualize", "--dot-source", CHAIN], temp.path());

    assert!(output.status.success(), "{}", describe(&output));
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    assert!(stdout.starts_with("digraph"));
    statewalk::load_graph_dot(&stdout).expect("rendered graph should load");
}

#[test]
fn setup_list_commands_expected_written_and_inspected() {
    let temp = TempDir::new().expect("tempdir should create");
    let dot_file = temp.path().join("chain.dot");
    write_dot_file(&dot_file);
    let dot_path = dot_file.to_str().expect("dot file path should be utf8");
    let logs_root = temp.path().join("logs");

    let output = run_cli(
        &[
            "setup-list",
            "--dot-file",
            dot_path,
            "--logs-root",
            logs_root.to_str().expect("logs root should be utf8"),
        ],
        temp.path(),
    );
    assert!(output.status.success(), "{}", describe(&output));

    let setup_list = logs_root.join("setup_list");
    let output = run_cli(
        &[
            "inspect-setup-list",
            "--setup-list",
            setup_list.to_str().expect("setup list path should be utf8"),
            "--dot-file",
            dot_path,
            "--json",
        ],
        temp.path(),
    );
    assert!(output.status.success(), "{}", describe(&output));

    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    let value: Value = serde_json::from_str(&stdout).expect("json output should parse");
    let names: Vec<&str> = value
        .get("entries")
        .and_then(Value::as_array)
        .expect("entries should be an array")
        .iter()
        .filter_map(|entry| entry.get("name").and_then(Value::as_str))
        .collect();
    assert_eq!(names, vec!["0scan", "a", "b"]);
}

#[test]
fn run_command_two_roots_event_json_expected_failed_event_printed() {
    let temp = TempDir::new().expect("tempdir should create");
    let source = r#"
        digraph roots {
            r1 [name="0scan"]
            r2 [name="all.0scan"]
            a [name="quicktest.a"]
            r1 -> a
            r2 -> a
        }
    "#;

    let output = run_cli(
        &["run", "--dot-source", source, "--event-json"],
        temp.path(),
    );

    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    let kinds: Vec<String> = stdout
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).expect("event line should parse"))
        .filter_map(|event| {
            event
                .get("kind")
                .and_then(|kind| kind.get("kind"))
                .and_then(Value::as_str)
                .map(ToOwned::to_owned)
        })
        .collect();
    assert_eq!(kinds, vec!["started", "failed"]);
    let stderr = String::from_utf8(output.stderr).expect("stderr should be utf8");
    assert!(stderr.contains("error: invariant violation"));
}

#[test]
fn run_command_vms_selection_expected_ignored_warning() {
    let temp = TempDir::new().expect("tempdir should create");
    let dot_file = temp.path().join("chain.dot");
    write_dot_file(&dot_file);

    let output = run_cli(
        &[
            "run",
            "--dot-file",
            dot_file.to_str().expect("dot file path should be utf8"),
            "--param",
            "vms=vm1",
            "--no-stream-events",
        ],
        temp.path(),
    );

    assert!(output.status.success(), "{}", describe(&output));
    let stderr = String::from_utf8(output.stderr).expect("stderr should be utf8");
    assert!(stderr.contains("vms=vm1 is validated but ignored"));
}
