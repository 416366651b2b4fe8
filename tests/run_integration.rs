//! End-to-end runs of the built binary against generated configurations.
//! Sessions use the passthrough backend so no interpreter tooling is needed;
//! the venv-reuse test guards on a host python with the venv module.

mod common;

use common::{exit_code, report_json, run_tasklab, stderr, stdout, write_config};

#[test]
fn single_session_success_writes_report() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        r#"
        [[session]]
        name = "t"
        python = false
        [[session.steps]]
        run = ["echo", "ok"]
        "#,
    );
    let report = dir.path().join("report.json");
    let output = run_tasklab(dir.path(), &["--report", report.to_str().unwrap()]);
    assert_eq!(exit_code(&output), 0, "stderr: {}", stderr(&output));

    let value = report_json(&report);
    assert_eq!(value["result"], "success");
    assert_eq!(value["sessions"][0]["name"], "t");
    assert_eq!(value["sessions"][0]["status"], "success");
}

#[test]
fn list_json_emits_parametric_instances() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        r#"
        [[session]]
        name = "tests"
        description = "Run the test suite"
        python = false

        [[session.parametrize]]
        args = "d"
        values = ["1", "2"]
        ids = ["old", "new"]
        "#,
    );
    let output = run_tasklab(dir.path(), &["--list", "--json"]);
    assert_eq!(exit_code(&output), 0, "stderr: {}", stderr(&output));

    let entries: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(entries[0]["session"], "tests");
    assert_eq!(entries[0]["name"], "tests(old)");
    assert_eq!(entries[0]["description"], "Run the test suite");
    assert_eq!(entries[0]["call_spec"]["d"], "1");
    assert_eq!(entries[1]["name"], "tests(new)");
    assert_eq!(entries[1]["call_spec"]["d"], "2");
}

#[test]
fn plain_list_marks_selected_sessions() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        r#"
        [[session]]
        name = "a"
        python = false

        [[session]]
        name = "hidden"
        python = false
        default = false
        "#,
    );
    let output = run_tasklab(dir.path(), &["--list"]);
    assert_eq!(exit_code(&output), 0);
    let listing = stdout(&output);
    assert!(listing.contains("* a"), "listing was: {listing}");
    assert!(listing.contains("- hidden"), "listing was: {listing}");
}

#[test]
fn selection_order_is_preserved() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        r#"
        [[session]]
        name = "a"
        python = false
        [[session.steps]]
        run = ["echo", "a"]

        [[session]]
        name = "b"
        python = false
        [[session.steps]]
        run = ["echo", "b"]

        [[session]]
        name = "c"
        python = false
        [[session.steps]]
        run = ["echo", "c"]
        "#,
    );
    let report = dir.path().join("report.json");
    let output = run_tasklab(
        dir.path(),
        &["-s", "c", "a", "--report", report.to_str().unwrap()],
    );
    assert_eq!(exit_code(&output), 0, "stderr: {}", stderr(&output));
    let value = report_json(&report);
    let names: Vec<&str> = value["sessions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|session| session["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["c", "a"]);
}

#[test]
fn notify_enqueues_target_with_forwarded_posargs() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("out.txt");
    write_config(
        dir.path(),
        &format!(
            r#"
            [[session]]
            name = "a"
            python = false
            [[session.steps]]
            run = ["echo", "first"]
            [[session.steps]]
            notify = {{ target = "b", posargs = ["forwarded"] }}

            [[session]]
            name = "b"
            python = false
            default = false
            [[session.steps]]
            run = ["sh", "-c", "echo {{posargs}} > {marker}"]
            "#,
            marker = marker.display()
        ),
    );
    let report = dir.path().join("report.json");
    let output = run_tasklab(
        dir.path(),
        &["-s", "a", "--report", report.to_str().unwrap()],
    );
    assert_eq!(exit_code(&output), 0, "stderr: {}", stderr(&output));

    let value = report_json(&report);
    let names: Vec<&str> = value["sessions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|session| session["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["a", "b"]);
    let content = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(content.trim(), "forwarded");
}

#[test]
fn requires_run_before_their_dependents() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        r#"
        [[session]]
        name = "build"
        python = false
        default = false
        [[session.steps]]
        run = ["echo", "build"]

        [[session]]
        name = "deploy"
        python = false
        requires = ["build"]
        [[session.steps]]
        run = ["echo", "deploy"]
        "#,
    );
    let report = dir.path().join("report.json");
    let output = run_tasklab(
        dir.path(),
        &["-s", "deploy", "--report", report.to_str().unwrap()],
    );
    assert_eq!(exit_code(&output), 0, "stderr: {}", stderr(&output));
    let value = report_json(&report);
    let names: Vec<&str> = value["sessions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|session| session["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["build", "deploy"]);
}

#[test]
fn stop_on_first_error_aborts_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        r#"
        [[session]]
        name = "bad"
        python = false
        [[session.steps]]
        run = ["sh", "-c", "exit 1"]

        [[session]]
        name = "after"
        python = false
        [[session.steps]]
        run = ["echo", "never"]
        "#,
    );
    let report = dir.path().join("report.json");
    let output = run_tasklab(
        dir.path(),
        &["--stop-on-first-error", "--report", report.to_str().unwrap()],
    );
    assert_eq!(exit_code(&output), 1);
    let value = report_json(&report);
    assert_eq!(value["result"], "failed");
    assert_eq!(value["sessions"][0]["status"], "failed");
    assert_eq!(value["sessions"][1]["name"], "after");
    assert_eq!(value["sessions"][1]["status"], "aborted");
}

#[test]
fn failure_without_stop_still_runs_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        r#"
        [[session]]
        name = "bad"
        python = false
        [[session.steps]]
        run = ["sh", "-c", "exit 1"]

        [[session]]
        name = "after"
        python = false
        [[session.steps]]
        run = ["echo", "ran"]
        "#,
    );
    let report = dir.path().join("report.json");
    let output = run_tasklab(dir.path(), &["--report", report.to_str().unwrap()]);
    assert_eq!(exit_code(&output), 1);
    let value = report_json(&report);
    assert_eq!(value["sessions"][1]["status"], "success");
}

#[test]
fn missing_interpreter_skips_by_default_and_fails_on_ci() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        r#"
        [[session]]
        name = "t"
        python = "4.0"
        backend = "venv"
        [[session.steps]]
        run = ["echo", "unreachable"]
        "#,
    );
    let report = dir.path().join("report.json");
    let output = run_tasklab(dir.path(), &["--report", report.to_str().unwrap()]);
    assert_eq!(exit_code(&output), 0, "stderr: {}", stderr(&output));
    assert_eq!(report_json(&report)["sessions"][0]["status"], "skipped");

    // The CI heuristic flips the default to error.
    let output = std::process::Command::new(env!("CARGO_BIN_EXE_tasklab"))
        .args(["--report", report.to_str().unwrap()])
        .current_dir(dir.path())
        .env("CI", "1")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let value = report_json(&report);
    assert_eq!(value["sessions"][0]["status"], "failed");
    let reason = value["sessions"][0]["reason"].as_str().unwrap();
    assert!(reason.contains("not found"), "reason was: {reason}");
}

#[test]
fn unknown_session_selection_exits_3() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        r#"
        [[session]]
        name = "a"
        python = false
        "#,
    );
    let output = run_tasklab(dir.path(), &["-s", "nope"]);
    assert_eq!(exit_code(&output), 3);
}

#[test]
fn empty_config_selection_lists_and_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        r#"
        [options]
        sessions = []

        [[session]]
        name = "a"
        python = false
        [[session.steps]]
        run = ["sh", "-c", "exit 9"]
        "#,
    );
    let output = run_tasklab(dir.path(), &[]);
    assert_eq!(exit_code(&output), 0, "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("a"));
}

#[test]
fn missing_config_exits_3() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_tasklab(dir.path(), &[]);
    assert_eq!(exit_code(&output), 3);
}

#[test]
fn needs_version_gate_exits_3() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), "needs-version = \">=99.0\"\n");
    let output = run_tasklab(dir.path(), &[]);
    assert_eq!(exit_code(&output), 3);
}

#[test]
fn posargs_reach_sessions_after_double_dash() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("posargs.txt");
    write_config(
        dir.path(),
        &format!(
            r#"
            [[session]]
            name = "a"
            python = false
            [[session.steps]]
            run = ["sh", "-c", "echo {{posargs}} > {marker}"]
            "#,
            marker = marker.display()
        ),
    );
    let output = run_tasklab(dir.path(), &["-s", "a", "--", "hello", "world"]);
    assert_eq!(exit_code(&output), 0, "stderr: {}", stderr(&output));
    assert_eq!(
        std::fs::read_to_string(&marker).unwrap().trim(),
        "hello world"
    );
}

#[test]
fn keyword_and_tag_filters_select_sessions() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        r#"
        [[session]]
        name = "unit"
        python = false
        tags = ["fast"]
        [[session.steps]]
        run = ["echo", "unit"]

        [[session]]
        name = "integration"
        python = false
        tags = ["slow"]
        [[session.steps]]
        run = ["echo", "integration"]
        "#,
    );
    let report = dir.path().join("report.json");
    let output = run_tasklab(
        dir.path(),
        &["-k", "fast or nothing", "--report", report.to_str().unwrap()],
    );
    assert_eq!(exit_code(&output), 0, "stderr: {}", stderr(&output));
    let value = report_json(&report);
    assert_eq!(value["sessions"].as_array().unwrap().len(), 1);
    assert_eq!(value["sessions"][0]["name"], "unit");

    let output = run_tasklab(
        dir.path(),
        &["-t", "slow", "--report", report.to_str().unwrap()],
    );
    assert_eq!(exit_code(&output), 0);
    let value = report_json(&report);
    assert_eq!(value["sessions"][0]["name"], "integration");
}

#[test]
fn session_error_step_fails_the_session() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        r#"
        [[session]]
        name = "angry"
        python = false
        [[session.steps]]
        error = "nope"

        [[session]]
        name = "sleepy"
        python = false
        [[session.steps]]
        skip = "not today"
        "#,
    );
    let report = dir.path().join("report.json");
    let output = run_tasklab(dir.path(), &["--report", report.to_str().unwrap()]);
    assert_eq!(exit_code(&output), 1);
    let value = report_json(&report);
    assert_eq!(value["sessions"][0]["status"], "failed");
    assert_eq!(value["sessions"][0]["reason"], "nope");
    // Skips never fail the run on their own.
    assert_eq!(value["sessions"][1]["status"], "skipped");
    assert_eq!(value["sessions"][1]["reason"], "not today");
}
