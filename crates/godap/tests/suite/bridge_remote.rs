use std::{path::Path, time::Duration};

use godap_delve::{
    mock::{DelayedReply, MockDelveServer, MockDelveServerConfig, MOCK_MAIN_FILE},
    types::{ReflectKind, Variable},
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::TempDir;

use crate::harness::{adapter_config, spawn_bridge, TestClient};

fn scalar(name: &str, kind: ReflectKind, type_: &str, value: &str) -> Variable {
    Variable {
        name: name.to_string(),
        kind: kind.as_raw(),
        type_: type_.to_string(),
        value: value.to_string(),
        len: if kind == ReflectKind::String { value.len() as i64 } else { 0 },
        ..Variable::default()
    }
}

fn point() -> Variable {
    Variable {
        name: "point".to_string(),
        kind: ReflectKind::Struct.as_raw(),
        type_: "main.Point".to_string(),
        addr: 0xc000_0100,
        len: 2,
        children: vec![
            scalar("X", ReflectKind::Int, "int", "1"),
            scalar("Y", ReflectKind::Int, "int", "2"),
        ],
        ..Variable::default()
    }
}

fn mock_config() -> MockDelveServerConfig {
    MockDelveServerConfig {
        sources: vec![MOCK_MAIN_FILE.to_string(), "<autogenerated>".to_string()],
        args: vec![scalar("n", ReflectKind::Int, "int", "1")],
        locals: vec![
            scalar("count", ReflectKind::Int, "int", "3"),
            scalar("name", ReflectKind::String, "string", "gopher"),
            point(),
        ],
        call_return_values: vec![scalar("~r0", ReflectKind::Int, "int", "4")],
        ..MockDelveServerConfig::default()
    }
}

/// A workspace holding the local copy of the mock program's `main.go`.
fn workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("main.go"), "package main\n").unwrap();
    dir
}

fn main_go(dir: &Path) -> String {
    dir.join("main.go").to_string_lossy().into_owned()
}

async fn attach(mock: &MockDelveServer, cwd: &Path, extra: Value) -> TestClient {
    let (mut client, _task) = spawn_bridge(adapter_config());
    let caps = client.success("initialize", json!({ "adapterID": "go" })).await;
    assert_eq!(caps["supportsConfigurationDoneRequest"], true);
    assert_eq!(caps["supportsSetVariable"], true);

    let mut args = json!({
        "mode": "remote",
        "host": "127.0.0.1",
        "port": mock.addr().port(),
        "cwd": cwd.to_string_lossy(),
    });
    if let (Some(args), Some(extra)) = (args.as_object_mut(), extra.as_object()) {
        args.extend(extra.clone());
    }
    client.success("attach", args).await;
    client.event("initialized").await;
    client
}

#[tokio::test]
async fn remote_attach_stops_at_breakpoint_and_inspects_state() {
    let mock = MockDelveServer::spawn_with_config(mock_config()).await.unwrap();
    let dir = workspace();
    let mut client = attach(&mock, dir.path(), json!({})).await;

    let body = client
        .success(
            "setBreakpoints",
            json!({
                "source": { "path": main_go(dir.path()) },
                "breakpoints": [{ "line": 10 }, { "line": 2000 }],
                "lines": [10, 2000],
            }),
        )
        .await;
    assert_eq!(
        body["breakpoints"],
        json!([
            { "verified": true, "line": 10 },
            { "verified": false, "line": 2000 },
        ])
    );
    let installed = mock.breakpoints().await;
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].file, MOCK_MAIN_FILE);

    client.success("configurationDone", json!({})).await;
    let stopped = client.event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "breakpoint");
    assert_eq!(stopped["body"]["threadId"], 1);

    let threads = client.success("threads", json!({})).await;
    assert_eq!(threads["threads"][0], json!({ "id": 1, "name": "main.main" }));
    assert_eq!(threads["threads"][1]["name"], "runtime.gopark");

    let stack = client.success("stackTrace", json!({ "threadId": 1 })).await;
    assert_eq!(stack["totalFrames"], 2);
    let top = &stack["stackFrames"][0];
    assert_eq!(top["name"], "main.main");
    assert_eq!(top["line"], 10);
    assert_eq!(top["source"]["path"], main_go(dir.path()));
    assert_eq!(top["source"]["name"], "main.go");
    let frame_id = top["id"].as_i64().unwrap();

    let paged = client
        .success("stackTrace", json!({ "threadId": 1, "startFrame": 1, "levels": 1 }))
        .await;
    assert_eq!(paged["totalFrames"], 2);
    assert_eq!(paged["stackFrames"].as_array().unwrap().len(), 1);
    assert_eq!(paged["stackFrames"][0]["name"], "runtime.main");

    let scopes = client.success("scopes", json!({ "frameId": frame_id })).await;
    assert_eq!(scopes["scopes"].as_array().unwrap().len(), 1);
    assert_eq!(scopes["scopes"][0]["name"], "Local");
    let locals_ref = scopes["scopes"][0]["variablesReference"].as_i64().unwrap();

    let vars = client
        .success("variables", json!({ "variablesReference": locals_ref }))
        .await;
    let vars = vars["variables"].as_array().unwrap().clone();
    let names: Vec<_> = vars.iter().map(|v| v["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["n", "count", "name", "point"]);
    assert_eq!(vars[1]["value"], "3");
    assert_eq!(vars[2]["value"], "\"gopher\"");
    assert_eq!(vars[3]["value"], "<main.Point>");
    let point_ref = vars[3]["variablesReference"].as_i64().unwrap();
    assert!(point_ref > 0);

    let fields = client
        .success("variables", json!({ "variablesReference": point_ref }))
        .await;
    assert_eq!(fields["variables"][0]["name"], "X");
    assert_eq!(fields["variables"][0]["value"], "1");
    assert_eq!(fields["variables"][0]["evaluateName"], "point.X");
    assert_eq!(fields["variables"][1]["value"], "2");

    let eval = client
        .success("evaluate", json!({ "expression": "count", "frameId": frame_id }))
        .await;
    assert_eq!(eval["result"], "3");
    assert_eq!(eval["variablesReference"], 0);

    let call = client
        .success("evaluate", json!({ "expression": "call double(2)", "frameId": frame_id }))
        .await;
    assert_eq!(call["result"], "4");
    assert!(mock.commands().await.contains(&"call".to_string()));

    let missing = client
        .request("evaluate", json!({ "expression": "nope", "frameId": frame_id }))
        .await;
    assert_eq!(missing["success"], false);
    assert_eq!(missing["body"]["error"]["id"], 2009);
    assert!(missing["message"]
        .as_str()
        .unwrap()
        .starts_with("Unable to eval expression: "));

    let set = client
        .success(
            "setVariable",
            json!({ "variablesReference": locals_ref, "name": "count", "value": "7" }),
        )
        .await;
    assert_eq!(set["value"], "7");
    assert_eq!(
        mock.set_requests().await,
        vec![("count".to_string(), "7".to_string())]
    );

    let cont = client.success("continue", json!({ "threadId": 1 })).await;
    assert_eq!(cont["allThreadsContinued"], true);
    client.event("terminated").await;

    client.success("disconnect", json!({})).await;
    assert!(mock.detach_requests().await.is_empty());
}

#[tokio::test]
async fn handles_from_an_earlier_stop_are_invalid() {
    let mock = MockDelveServer::spawn_with_config(mock_config()).await.unwrap();
    let dir = workspace();
    let mut client = attach(&mock, dir.path(), json!({ "stopOnEntry": true })).await;

    client.success("configurationDone", json!({})).await;
    let stopped = client.event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "entry");

    let stack = client.success("stackTrace", json!({ "threadId": 1 })).await;
    let first_frame = stack["stackFrames"][0]["id"].as_i64().unwrap();
    assert_eq!(stack["stackFrames"][0]["line"], 5);

    client.success("next", json!({ "threadId": 1 })).await;
    let continued = client.event("continued").await;
    assert_eq!(continued["body"]["allThreadsContinued"], true);
    let stopped = client.event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "step");

    let stale = client.request("scopes", json!({ "frameId": first_frame })).await;
    assert_eq!(stale["success"], false);

    let stack = client.success("stackTrace", json!({ "threadId": 1 })).await;
    let new_frame = stack["stackFrames"][0]["id"].as_i64().unwrap();
    assert!(new_frame > first_frame);
    assert_eq!(stack["stackFrames"][0]["line"], 6);

    client.success("disconnect", json!({})).await;
}

#[tokio::test]
async fn breakpoints_set_while_running_halt_and_resume() {
    let mock = MockDelveServer::spawn_with_config(MockDelveServerConfig {
        run_duration: Duration::from_millis(400),
        ..mock_config()
    })
    .await
    .unwrap();
    let dir = workspace();
    let mut client = attach(&mock, dir.path(), json!({})).await;

    client.success("configurationDone", json!({})).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(mock.is_running());

    let body = client
        .success(
            "setBreakpoints",
            json!({
                "source": { "path": main_go(dir.path()) },
                "breakpoints": [{ "line": 20 }],
            }),
        )
        .await;
    assert_eq!(body["breakpoints"][0]["verified"], true);

    let stopped = client.event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "breakpoint");
    let stack = client.success("stackTrace", json!({ "threadId": 1 })).await;
    assert_eq!(stack["stackFrames"][0]["line"], 20);

    assert_eq!(
        mock.commands().await,
        vec!["continue".to_string(), "halt".to_string(), "continue".to_string()]
    );
    client.success("disconnect", json!({})).await;
}

#[tokio::test]
async fn existing_breakpoint_is_reused() {
    let mock = MockDelveServer::spawn_with_config(mock_config()).await.unwrap();
    let dir = workspace();
    let mut client = attach(&mock, dir.path(), json!({})).await;

    let body = client
        .success(
            "setBreakpoints",
            json!({
                "source": { "path": main_go(dir.path()) },
                "breakpoints": [{ "line": 12 }, { "line": 12, "condition": "n > 1" }],
            }),
        )
        .await;
    assert_eq!(body["breakpoints"][0]["verified"], true);
    assert_eq!(body["breakpoints"][1]["verified"], true);
    assert_eq!(mock.breakpoints().await.len(), 1);

    // A second request clears the earlier breakpoints first.
    let body = client
        .success(
            "setBreakpoints",
            json!({
                "source": { "path": main_go(dir.path()) },
                "breakpoints": [{ "line": 14, "condition": "n > 1" }],
            }),
        )
        .await;
    assert_eq!(body["breakpoints"][0]["line"], 14);
    let installed = mock.breakpoints().await;
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].line, 14);
    assert_eq!(installed[0].cond, "n > 1");

    client.success("disconnect", json!({})).await;
}

#[tokio::test]
async fn pause_reports_pause_stop() {
    let mock = MockDelveServer::spawn_with_config(MockDelveServerConfig {
        run_duration: Duration::from_secs(5),
        ..mock_config()
    })
    .await
    .unwrap();
    let dir = workspace();
    let mut client = attach(&mock, dir.path(), json!({})).await;

    client.success("configurationDone", json!({})).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let threads = client.success("threads", json!({})).await;
    assert_eq!(threads["threads"], json!([{ "id": 1, "name": "Dummy" }]));
    let running = client.request("stackTrace", json!({ "threadId": 1 })).await;
    assert_eq!(running["body"]["error"]["id"], 2004);

    client.success("pause", json!({ "threadId": 1 })).await;
    let stopped = client.event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "pause");
    assert_eq!(stopped["body"]["threadId"], 1);

    client.settle(Duration::from_millis(200)).await;
    assert!(client.seen_events("stopped").is_empty());

    client.success("disconnect", json!({})).await;
}

#[tokio::test]
async fn superseded_continue_reply_leaves_current_stop_alone() {
    // The continue stops on goroutine 2 but its reply only arrives after a
    // pause and a step have already moved on.
    let mock = MockDelveServer::spawn_with_config(MockDelveServerConfig {
        breakpoint_goroutine: 2,
        late_replies: vec![DelayedReply {
            method: "Command.continue".to_string(),
            delay: Duration::from_millis(400),
        }],
        ..mock_config()
    })
    .await
    .unwrap();
    let dir = workspace();
    let mut client = attach(&mock, dir.path(), json!({})).await;

    client
        .success(
            "setBreakpoints",
            json!({
                "source": { "path": main_go(dir.path()) },
                "breakpoints": [{ "line": 8 }],
            }),
        )
        .await;
    client.success("configurationDone", json!({})).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    client.success("pause", json!({ "threadId": 1 })).await;
    let paused = client.event("stopped").await;
    assert_eq!(paused["body"]["reason"], "pause");
    assert_eq!(paused["body"]["threadId"], 2);

    client.success("next", json!({ "threadId": 2 })).await;
    let stepped = client.event("stopped").await;
    assert_eq!(stepped["body"]["reason"], "step");
    assert_eq!(stepped["body"]["threadId"], 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    client.settle(Duration::from_millis(100)).await;
    assert!(client.seen_events("stopped").is_empty());

    client
        .success("setVariable", json!({ "variablesReference": 1000, "name": "count", "value": "7" }))
        .await;
    assert_eq!(mock.set_goroutines().await, vec![1]);
    assert_eq!(
        mock.commands().await,
        vec!["continue".to_string(), "halt".to_string(), "next".to_string()]
    );

    client.success("disconnect", json!({})).await;
}

#[tokio::test]
async fn unrecovered_panic_is_reported() {
    let mock = MockDelveServer::spawn_with_config(MockDelveServerConfig {
        panic_before_exit: true,
        ..mock_config()
    })
    .await
    .unwrap();
    let dir = workspace();
    let mut client = attach(&mock, dir.path(), json!({})).await;

    client.success("configurationDone", json!({})).await;
    let stopped = client.event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "panic");

    client.success("continue", json!({})).await;
    client.event("terminated").await;
    client.success("disconnect", json!({})).await;
}

#[tokio::test]
async fn disconnect_resumes_halted_remote_target() {
    let mock = MockDelveServer::spawn_with_config(mock_config()).await.unwrap();
    let dir = workspace();
    let mut client = attach(&mock, dir.path(), json!({ "stopOnEntry": true })).await;

    client.success("configurationDone", json!({})).await;
    client.event("stopped").await;

    client.success("disconnect", json!({})).await;
    assert_eq!(mock.commands().await, vec!["continue".to_string()]);
    assert!(mock.detach_requests().await.is_empty());
}
