//! CLI integration tests

use mockito::{Matcher, Server};
use std::process::{Command, Output};

fn discoctl(api_url: &str, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_discoctl"))
        .arg("--api-url")
        .arg(api_url)
        .args(args)
        .env("NO_COLOR", "1")
        .output()
        .expect("Failed to execute command")
}

const TARGETS: &str = r#"[
  {"name":"pod/cache/redis-0","rule":"redis","plugin_type":"telegraf/redis",
   "config":{"family":"telegraf","plugins":["redis"],"discovered":"rule",
             "tags":{"namespace":"cache","pod":"redis-0"}}},
  {"name":"pod/default/web-0","rule":"annotation","plugin_type":"prometheus",
   "config":{"family":"prometheus","url":"http://10.0.1.4:9102/metrics","discovered":"annotation",
             "tags":{"namespace":"default","pod":"web-0"}}}
]"#;

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = Command::new(env!("CARGO_BIN_EXE_discoctl"))
        .arg("--help")
        .output()
        .expect("Failed to execute command");

    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    for command in ["targets", "rules", "status", "health"] {
        assert!(stdout.contains(command), "Should show {command} command");
    }
    assert!(stdout.contains("--api-url"), "Should show api-url option");
    assert!(stdout.contains("DISCOCTL_API_URL"), "Should show env var");
}

#[test]
fn test_targets_table() {
    let mut server = Server::new();
    server
        .mock("GET", "/api/v1/targets")
        .with_header("content-type", "application/json")
        .with_body(TARGETS)
        .create();

    let output = discoctl(&server.url(), &["targets"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("pod/cache/redis-0"));
    assert!(stdout.contains("http://10.0.1.4:9102/metrics"));
    assert!(stdout.contains("Total: 2 targets"));
}

#[test]
fn test_targets_filters_are_forwarded() {
    let mut server = Server::new();
    let mock = server
        .mock("GET", "/api/v1/targets")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("type".into(), "prometheus".into()),
            Matcher::UrlEncoded("namespace".into(), "default".into()),
        ]))
        .with_header("content-type", "application/json")
        .with_body("[]")
        .create();

    let output = discoctl(
        &server.url(),
        &["targets", "--type", "prometheus", "--namespace", "default"],
    );

    mock.assert();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("No targets discovered"));
}

#[test]
fn test_rules_json_output() {
    let mut server = Server::new();
    server
        .mock("GET", "/api/v1/rules")
        .with_header("content-type", "application/json")
        .with_body(r#"[{"name":"redis","plugin_type":"telegraf/redis","resource_type":"pod","targets":3}]"#)
        .create();

    let output = discoctl(&server.url(), &["--format", "json", "rules"]);
    assert!(output.status.success());

    let rules: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(rules[0]["name"], "redis");
    assert_eq!(rules[0]["targets"], 3);
}

#[test]
fn test_status_shows_leadership() {
    let mut server = Server::new();
    server
        .mock("GET", "/api/v1/status")
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"node_name":"node-2","daemon":true,"leading":false,"leader":"node-1",
            "rules":4,"targets":7,"runtime_sources":1,"registries":{"prometheus":5,"telegraf.redis":2}}"#,
        )
        .create();

    let output = discoctl(&server.url(), &["status"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("node-2"));
    assert!(stdout.contains("following"));
    assert!(stdout.contains("node-1"));
    assert!(stdout.contains("telegraf.redis:"));
}

#[test]
fn test_api_error_fails() {
    let mut server = Server::new();
    server
        .mock("GET", "/api/v1/status")
        .with_status(500)
        .with_body("internal error")
        .create();

    let output = discoctl(&server.url(), &["status"]);

    assert!(!output.status.success(), "API errors should fail the command");
    assert!(String::from_utf8_lossy(&output.stderr).contains("500"));
}

/// Test invalid command error handling
#[test]
fn test_invalid_command() {
    let output = Command::new(env!("CARGO_BIN_EXE_discoctl"))
        .arg("invalid-command")
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success(), "Invalid command should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("error") || stderr.contains("invalid"),
        "Should show error message"
    );
}
