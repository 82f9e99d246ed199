use godap::{
    dap::transport::{DapReader, DapWriter},
    proxy::{ProxyAdapter, ProxyConfig, ProxyError},
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::{net::TcpListener, task::JoinHandle};

use crate::harness::{adapter_config, TestClient};

fn spawn_proxy(config: ProxyConfig) -> (TestClient, JoinHandle<Result<(), ProxyError>>) {
    let (client, proxy_stream) = tokio::io::duplex(256 * 1024);
    let (read, write) = tokio::io::split(proxy_stream);
    let task = tokio::spawn(async move {
        let mut proxy = ProxyAdapter::new(config, adapter_config());
        proxy.start(read, write).await
    });
    (TestClient::new(client), task)
}

fn external(port: u16) -> ProxyConfig {
    ProxyConfig {
        host: Some("127.0.0.1".to_string()),
        port: Some(port),
        ..ProxyConfig::default()
    }
}

#[tokio::test]
async fn first_message_must_be_initialize() {
    let (mut client, task) = spawn_proxy(external(1));

    let response = client.request("launch", json!({})).await;
    assert_eq!(response["success"], false);
    assert_eq!(response["body"]["error"]["id"], 3000);
    assert_eq!(
        response["message"],
        "Couldn't start dlv dap:\nthe first message must be an initialize request"
    );
    client.event("terminated").await;
    assert!(client
        .output("stderr")
        .contains("the first message must be an initialize request"));

    let later = client.request("threads", json!({})).await;
    assert_eq!(later["success"], false);
    assert_eq!(later["body"]["error"]["id"], 3000);

    drop(client);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn unreachable_server_rejects_session() {
    // Bind and drop to find a port nothing listens on.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let (mut client, _task) = spawn_proxy(external(port));

    let response = client.request("initialize", json!({ "adapterID": "go" })).await;
    assert_eq!(response["success"], false);
    let message = response["message"].as_str().unwrap();
    assert!(message.starts_with("Couldn't start dlv dap:\nfailed to connect to 127.0.0.1:"), "{message}");
    client.event("terminated").await;
}

#[tokio::test]
async fn proxy_can_only_start_once() {
    let mut proxy = ProxyAdapter::new(external(1), adapter_config());
    proxy.start(tokio::io::empty(), tokio::io::sink()).await.unwrap();

    let err = proxy
        .start(tokio::io::empty(), tokio::io::sink())
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::AlreadyStarted));
}

#[tokio::test]
async fn relays_messages_and_reports_server_exit() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, write) = stream.into_split();
        let mut reader = DapReader::new(read);
        let mut writer = DapWriter::new(write);
        let mut seen = Vec::new();
        let mut seq = 0;

        while let Some(message) = reader.next_message().await {
            let message = message.unwrap();
            let command = message["command"].as_str().unwrap_or_default().to_string();
            seen.push(format!("{}:{command}", message["type"].as_str().unwrap_or_default()));

            seq += 1;
            writer
                .write_value(&json!({
                    "seq": seq,
                    "type": "response",
                    "request_seq": message["seq"],
                    "command": command,
                    "success": true,
                }))
                .await
                .unwrap();

            match command.as_str() {
                "initialize" => {
                    seq += 1;
                    writer
                        .write_value(&json!({
                            "seq": seq,
                            "type": "request",
                            "command": "runInTerminal",
                            "arguments": { "args": ["dlv"] },
                        }))
                        .await
                        .unwrap();
                }
                "launch" => break,
                _ => {}
            }
        }
        seen
    });

    let (mut client, task) = spawn_proxy(external(port));
    client.success("initialize", json!({ "adapterID": "go" })).await;
    client
        .send_raw(json!({
            "seq": 100,
            "type": "response",
            "request_seq": 2,
            "command": "runInTerminal",
            "success": true,
        }))
        .await;
    client.success("launch", json!({ "program": "." })).await;

    assert_eq!(
        server.await.unwrap(),
        vec!["request:initialize".to_string(), "request:launch".to_string()]
    );
    client.event("terminated").await;
    let requests: Vec<&Value> = client
        .backlog()
        .iter()
        .filter(|msg| msg["type"] == "request")
        .collect();
    assert!(requests.is_empty(), "{requests:?}");

    drop(client);
    task.await.unwrap().unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn backend_exiting_before_listening_is_reported() {
    use std::os::unix::fs::PermissionsExt;

    let tools = tempfile::TempDir::new().unwrap();
    let dlv = tools.path().join("dlv");
    std::fs::write(&dlv, "#!/bin/sh\necho 'unknown flag' >&2\nexit 2\n").unwrap();
    std::fs::set_permissions(&dlv, std::fs::Permissions::from_mode(0o755)).unwrap();

    let (mut client, _task) = spawn_proxy(ProxyConfig {
        dlv_tool_path: Some(dlv.to_string_lossy().into_owned()),
        cwd: Some(tools.path().to_string_lossy().into_owned()),
        ..ProxyConfig::default()
    });

    let response = client.request("initialize", json!({})).await;
    assert_eq!(response["success"], false);
    assert_eq!(
        response["message"],
        "Couldn't start dlv dap:\ndlv dap exited before it started listening"
    );
    client.event("terminated").await;
}
