#![cfg(unix)]

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    time::Duration,
};

use godap_delve::mock::MockDelveServer;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use crate::harness::{adapter_config, spawn_bridge};

/// Writes an executable stand-in for `dlv` that runs `body`.
fn fake_dlv(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("dlv");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[tokio::test]
async fn launch_spawns_backend_and_disconnect_kills_it() {
    let mock = MockDelveServer::spawn().await.unwrap();
    let tools = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    let program = project.path().join("main.go");
    std::fs::write(&program, "package main\n").unwrap();
    // Stands in for the binary `dlv debug` builds next to the program.
    let binary = project.path().join("__debug_bin");
    std::fs::write(&binary, b"").unwrap();

    let dlv = fake_dlv(
        tools.path(),
        "echo \"API server listening at: 127.0.0.1:$GODAP_TEST_PORT\"\necho warming up >&2\nexec sleep 30",
    );

    let (mut client, task) = spawn_bridge(adapter_config());
    client.success("initialize", json!({})).await;
    client
        .success(
            "launch",
            json!({
                "mode": "debug",
                "program": program.to_string_lossy(),
                "dlvToolPath": dlv.to_string_lossy(),
                "port": mock.addr().port(),
                "env": { "GODAP_TEST_PORT": mock.addr().port().to_string() },
            }),
        )
        .await;
    client.event("initialized").await;

    client.settle(Duration::from_millis(200)).await;
    assert!(client
        .output("stdout")
        .contains(&format!("API server listening at: 127.0.0.1:{}", mock.addr().port())));
    assert!(client.output("stderr").contains("warming up"));

    client.success("disconnect", json!({})).await;
    assert_eq!(mock.detach_requests().await, vec![true]);
    assert!(mock.commands().await.contains(&"halt".to_string()));
    assert!(!binary.exists());

    drop(client);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn backend_exiting_during_startup_fails_launch() {
    let tools = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    let program = project.path().join("main.go");
    std::fs::write(&program, "package main\n").unwrap();
    let dlv = fake_dlv(tools.path(), "echo 'could not launch process' >&2\nexit 1");

    let (mut client, _task) = spawn_bridge(adapter_config());
    client.success("initialize", json!({})).await;
    let response = client
        .request(
            "launch",
            json!({
                "mode": "debug",
                "program": program.to_string_lossy(),
                "dlvToolPath": dlv.to_string_lossy(),
            }),
        )
        .await;
    assert_eq!(response["success"], false);
    assert_eq!(response["body"]["error"]["id"], 3000);
    assert_eq!(
        response["message"],
        "Failed to continue: Check the debug console for details."
    );
}

#[tokio::test]
async fn exec_mode_rejects_directory() {
    let tools = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    let dlv = fake_dlv(tools.path(), "exit 0");

    let (mut client, _task) = spawn_bridge(adapter_config());
    client.success("initialize", json!({})).await;
    let response = client
        .request(
            "launch",
            json!({
                "mode": "exec",
                "program": project.path().to_string_lossy(),
                "dlvToolPath": dlv.to_string_lossy(),
            }),
        )
        .await;
    assert_eq!(response["success"], false);
    assert_eq!(
        response["message"],
        "Failed to continue: \"The program attribute must be an executable in exec mode\""
    );
}
