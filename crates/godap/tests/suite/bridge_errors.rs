use godap_delve::mock::{MockDelveServer, MockDelveServerConfig};
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::harness::{adapter_config, spawn_bridge};

#[tokio::test]
async fn requests_before_attach_fail_cleanly() {
    let (mut client, task) = spawn_bridge(adapter_config());
    client.success("initialize", json!({})).await;

    let unknown = client.request("restart", json!({})).await;
    assert_eq!(unknown["success"], false);
    assert_eq!(unknown["body"]["error"]["id"], 1014);

    let threads = client.request("threads", json!({})).await;
    assert_eq!(threads["success"], false);
    assert_eq!(threads["body"]["error"]["id"], 1000);

    let vars = client
        .request("variables", json!({ "variablesReference": 1000 }))
        .await;
    assert_eq!(vars["success"], false);

    let bad_args = client.request("stackTrace", json!({ "threadId": "one" })).await;
    assert_eq!(bad_args["success"], false);

    client.success("setExceptionBreakpoints", json!({ "filters": [] })).await;
    client.success("disconnect", json!({})).await;
    client.event("terminated").await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn launch_without_program_is_rejected() {
    let (mut client, _task) = spawn_bridge(adapter_config());
    client.success("initialize", json!({})).await;

    let response = client.request("launch", json!({ "mode": "debug" })).await;
    assert_eq!(response["success"], false);
    assert_eq!(response["body"]["error"]["id"], 3000);
    assert_eq!(
        response["message"],
        "Failed to continue: The program attribute is missing in the debug configuration in launch.json"
    );

    let again = client.request("launch", json!({ "mode": "debug" })).await;
    assert_eq!(again["success"], false);
}

#[tokio::test]
async fn remote_attach_requires_port() {
    let (mut client, _task) = spawn_bridge(adapter_config());
    client.success("initialize", json!({})).await;

    let response = client.request("attach", json!({ "mode": "remote" })).await;
    assert_eq!(response["success"], false);
    assert_eq!(response["body"]["error"]["id"], 3000);
}

#[tokio::test]
async fn api_version_mismatch_fails_attach() {
    let mock = MockDelveServer::spawn_with_config(MockDelveServerConfig {
        api_version: 1,
        ..MockDelveServerConfig::default()
    })
    .await
    .unwrap();
    let (mut client, _task) = spawn_bridge(adapter_config());
    client.success("initialize", json!({})).await;

    let response = client
        .request(
            "attach",
            json!({ "mode": "remote", "host": "127.0.0.1", "port": mock.addr().port() }),
        )
        .await;
    assert_eq!(response["success"], false);
    assert_eq!(response["body"]["error"]["id"], 3000);
    assert!(response["message"]
        .as_str()
        .unwrap()
        .contains("running on delve v1 API"));
}
