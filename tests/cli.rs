//! Exercises the `stagehand` binary

use std::fs;
use std::process::{Command, Output};

const CONTRACT_VARS: [&str; 5] = ["PORT", "HOST", "WORKERS", "TIMEOUT", "MAX_REQUESTS"];

fn stagehand(root: &std::path::Path, args: &[&str], env: &[(&str, &str)]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_stagehand"));
    cmd.args(args).arg("--root").arg(root);
    for var in CONTRACT_VARS {
        cmd.env_remove(var);
    }
    cmd.envs(env.iter().copied());
    cmd.output().unwrap()
}

#[test]
fn test_plan_json() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("client")).unwrap();

    let output = stagehand(
        dir.path(),
        &["plan", "--json", "--profile", "full-stack", "--hosting", "container"],
        &[("PORT", "9000")],
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(plan["profile"], "full-stack");
    assert_eq!(plan["runtime"]["port"], 9000);
    assert_eq!(plan["runtime"]["worker_count"], 4);
    let names: Vec<&str> = plan["stages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        vec![
            "install-backend",
            "install-frontend",
            "build-frontend",
            "publish-static",
            "launch-backend"
        ]
    );
}

#[test]
fn test_invalid_env_exits_with_config_code() {
    let dir = tempfile::tempdir().unwrap();
    for (var, value) in [("WORKERS", "0"), ("PORT", "70000"), ("TIMEOUT", "soon")] {
        let output = stagehand(dir.path(), &["plan"], &[(var, value)]);
        assert_eq!(output.status.code(), Some(78), "{var}={value}");
    }
}

#[test]
fn test_full_stack_without_client_dir_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = stagehand(dir.path(), &["plan", "--profile", "full-stack"], &[]);
    assert_eq!(output.status.code(), Some(78));
}

#[test]
fn test_manifest_compose() {
    let dir = tempfile::tempdir().unwrap();
    let output = stagehand(dir.path(), &["manifest", "compose"], &[("PORT", "8080")]);
    assert!(output.status.success());

    let compose: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let web = &compose["services"]["web"];
    assert_eq!(web["ports"][0], "8080:8080");
    assert_eq!(web["environment"]["PORT"], "8080");
    assert_eq!(web["healthcheck"]["start_period"], "40s");
}

#[test]
fn test_manifest_nginx() {
    let dir = tempfile::tempdir().unwrap();
    let output = stagehand(dir.path(), &["manifest", "nginx", "--listen", "8081"], &[]);
    assert!(output.status.success());

    let conf = String::from_utf8(output.stdout).unwrap();
    assert!(conf.contains("listen 8081;"));
    assert!(conf.contains("proxy_pass http://127.0.0.1:8000;"));
}

#[test]
fn test_failing_stage_exit_code_propagates() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("stagehand.toml"),
        "[backend]\ninstall = \"sh -c 'exit 7'\"\n",
    )
    .unwrap();

    let output = stagehand(dir.path(), &["run"], &[]);
    assert_eq!(output.status.code(), Some(7));
}

#[test]
fn test_probe_unreachable_backend() {
    let dir = tempfile::tempdir().unwrap();
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let output = stagehand(dir.path(), &["probe"], &[("PORT", &port.to_string())]);
    assert_eq!(output.status.code(), Some(1));
}
