//! A scripted DAP client for driving the adapter over an in-memory stream.

use std::time::Duration;

use godap::{
    dap::transport::{DapReader, DapWriter},
    server::{self, ServerError},
};
use godap_config::AdapterConfig;
use serde_json::{json, Value};
use tokio::{
    io::{DuplexStream, ReadHalf, WriteHalf},
    task::JoinHandle,
};

/// Upper bound on any single wait in the suite.
pub const TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestClient {
    reader: DapReader<ReadHalf<DuplexStream>>,
    writer: DapWriter<WriteHalf<DuplexStream>>,
    seq: i64,
    /// Messages read while waiting for something else.
    backlog: Vec<Value>,
}

impl TestClient {
    pub fn new(stream: DuplexStream) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: DapReader::new(read),
            writer: DapWriter::new(write),
            seq: 0,
            backlog: Vec::new(),
        }
    }

    pub async fn send(&mut self, command: &str, arguments: Value) -> i64 {
        self.seq += 1;
        let seq = self.seq;
        self.send_raw(json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        }))
        .await;
        seq
    }

    pub async fn send_raw(&mut self, message: Value) {
        self.writer.write_value(&message).await.unwrap();
    }

    /// Next message from the adapter, or `None` once it closed the stream.
    pub async fn next_message(&mut self) -> Option<Value> {
        let next = tokio::time::timeout(TIMEOUT, self.reader.next_message())
            .await
            .expect("timed out waiting for a DAP message");
        next.map(|message| message.unwrap())
    }

    pub async fn response(&mut self, request_seq: i64) -> Value {
        let is_match = |msg: &Value| {
            msg["type"] == "response" && msg["request_seq"].as_i64() == Some(request_seq)
        };
        if let Some(index) = self.backlog.iter().position(is_match) {
            return self.backlog.remove(index);
        }
        loop {
            let msg = self
                .next_message()
                .await
                .unwrap_or_else(|| panic!("stream closed before response to {request_seq}"));
            if is_match(&msg) {
                return msg;
            }
            self.backlog.push(msg);
        }
    }

    /// Sends a request and waits for its response.
    pub async fn request(&mut self, command: &str, arguments: Value) -> Value {
        let seq = self.send(command, arguments).await;
        self.response(seq).await
    }

    /// Like [`TestClient::request`] but asserts success and returns the body.
    pub async fn success(&mut self, command: &str, arguments: Value) -> Value {
        let response = self.request(command, arguments).await;
        assert_eq!(
            response["success"], true,
            "{command} failed: {response}"
        );
        response.get("body").cloned().unwrap_or(Value::Null)
    }

    /// The first not yet consumed event called `name`.
    pub async fn event(&mut self, name: &str) -> Value {
        let is_match = |msg: &Value| msg["type"] == "event" && msg["event"] == name;
        if let Some(index) = self.backlog.iter().position(is_match) {
            return self.backlog.remove(index);
        }
        loop {
            let msg = self
                .next_message()
                .await
                .unwrap_or_else(|| panic!("stream closed before {name} event"));
            if is_match(&msg) {
                return msg;
            }
            self.backlog.push(msg);
        }
    }

    /// Reads everything that arrives within `quiet` into the backlog.
    pub async fn settle(&mut self, quiet: Duration) {
        while let Ok(Some(Ok(msg))) = tokio::time::timeout(quiet, self.reader.next_message()).await {
            self.backlog.push(msg);
        }
    }

    /// Messages read so far but not consumed.
    pub fn backlog(&self) -> &[Value] {
        &self.backlog
    }

    /// Backlogged events called `name`, in arrival order.
    pub fn seen_events(&self, name: &str) -> Vec<&Value> {
        self.backlog
            .iter()
            .filter(|msg| msg["type"] == "event" && msg["event"] == name)
            .collect()
    }

    /// Concatenated `output` text of one category seen so far.
    pub fn output(&self, category: &str) -> String {
        self.backlog
            .iter()
            .filter(|msg| msg["type"] == "event" && msg["event"] == "output")
            .filter(|msg| msg["body"]["category"] == category)
            .filter_map(|msg| msg["body"]["output"].as_str())
            .collect()
    }
}

pub fn adapter_config() -> AdapterConfig {
    AdapterConfig {
        dispose_grace_ms: 300,
        ..AdapterConfig::default()
    }
}

/// Starts the bridge adapter on an in-memory stream.
pub fn spawn_bridge(config: AdapterConfig) -> (TestClient, JoinHandle<Result<(), ServerError>>) {
    let (client, server_stream) = tokio::io::duplex(256 * 1024);
    let (server_read, server_write) = tokio::io::split(server_stream);
    let task = tokio::spawn(server::run(server_read, server_write, config));
    (TestClient::new(client), task)
}
