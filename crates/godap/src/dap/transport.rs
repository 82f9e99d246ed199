use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use serde_json::{json, Value};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use super::{
    codec::{decode_message, encode_frame, CodecError, FrameDecoder},
    messages::{Event, Request, Response},
};

pub struct DapReader<R> {
    reader: R,
    decoder: FrameDecoder,
    buf: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> DapReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            buf: vec![0u8; 16 * 1024],
            eof: false,
        }
    }

    /// Next decoded message. `None` at a clean end of stream.
    ///
    /// Malformed frames come back as recoverable errors; the reader can keep
    /// being polled afterwards.
    pub async fn next_message(&mut self) -> Option<Result<Value, CodecError>> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return Some(frame.and_then(|payload| decode_message(&payload)));
            }
            if self.eof {
                return None;
            }

            match self.reader.read(&mut self.buf).await {
                Ok(0) => {
                    self.eof = true;
                    if self.decoder.has_partial_frame() {
                        return Some(Err(CodecError::UnexpectedEof));
                    }
                    return None;
                }
                Ok(n) => self.decoder.push(&self.buf[..n]),
                Err(err) => {
                    self.eof = true;
                    return Some(Err(err.into()));
                }
            }
        }
    }
}

pub struct DapWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> DapWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_value(&mut self, value: &Value) -> Result<(), CodecError> {
        let frame = encode_frame(value);
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Sending half of an outgoing message stream.
///
/// All clones share one sequence counter so every synthesized message gets a
/// distinct, increasing `seq`.
#[derive(Clone, Debug)]
pub struct Outgoing {
    tx: mpsc::UnboundedSender<Value>,
    seq: Arc<AtomicI64>,
}

impl Outgoing {
    pub fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Queues `message` unchanged. Returns `false` once the writer is gone.
    pub fn send_raw(&self, message: Value) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn send_event(&self, event: &str, body: Option<Value>) {
        let evt = Event::new(self.next_seq(), event, body);
        let _ = self
            .tx
            .send(serde_json::to_value(evt).unwrap_or_else(|_| json!({})));
    }

    pub fn send_response(&self, request: &Request, body: Option<Value>) {
        let resp = Response::success(self.next_seq(), request, body);
        let _ = self
            .tx
            .send(serde_json::to_value(resp).unwrap_or_else(|_| json!({})));
    }

    pub fn send_error(&self, request: &Request, code: i64, message: impl Into<String>) {
        let resp = Response::error(self.next_seq(), request, code, message);
        let _ = self
            .tx
            .send(serde_json::to_value(resp).unwrap_or_else(|_| json!({})));
    }

    /// `output` event on the given category (`stdout`, `stderr`, `console`).
    pub fn send_output(&self, category: &str, output: impl Into<String>) {
        self.send_event(
            "output",
            Some(json!({ "category": category, "output": output.into() })),
        );
    }

    /// Sends a `request` (reverse request) and returns its `seq`.
    pub fn send_request(&self, command: &str, arguments: Value) -> i64 {
        let seq = self.next_seq();
        let _ = self.tx.send(json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        }));
        seq
    }
}

/// The task draining an [`Outgoing`] stream into a writer.
pub struct WriterTask {
    pub outgoing: Outgoing,
    /// Cancelled when a write fails. Messages queued afterwards are dropped.
    pub failed: CancellationToken,
    pub handle: JoinHandle<()>,
}

pub fn spawn_writer<W>(writer: W) -> WriterTask
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_with_seq(writer, Arc::new(AtomicI64::new(1)))
}

fn spawn_writer_with_seq<W>(writer: W, seq: Arc<AtomicI64>) -> WriterTask
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let failed = CancellationToken::new();
    let task_failed = failed.clone();

    let handle = tokio::spawn(async move {
        let mut writer = DapWriter::new(writer);
        while let Some(msg) = rx.recv().await {
            if let Err(err) = writer.write_value(&msg).await {
                tracing::debug!(target: "godap.dap", error = %err, "DAP write failed");
                task_failed.cancel();
                return;
            }
        }
    });

    WriterTask {
        outgoing: Outgoing { tx, seq },
        failed,
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn reader_reports_partial_frame_at_eof() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"Content-Length: 40\r\n\r\n{\"seq\"").await.unwrap();
        drop(client);

        let mut reader = DapReader::new(server);
        assert!(matches!(
            reader.next_message().await,
            Some(Err(CodecError::UnexpectedEof))
        ));
        assert!(reader.next_message().await.is_none());
    }

    #[tokio::test]
    async fn reader_recovers_after_malformed_frame() {
        let (mut client, server) = duplex(1024);
        client
            .write_all(b"Content-Length: 3\r\n\r\n{x}")
            .await
            .unwrap();
        client.write_all(&encode_frame(&json!({"seq": 2}))).await.unwrap();
        drop(client);

        let mut reader = DapReader::new(server);
        let first = reader.next_message().await.unwrap().unwrap_err();
        assert!(first.is_recoverable());
        let second = reader.next_message().await.unwrap().unwrap();
        assert_eq!(second["seq"], 2);
        assert!(reader.next_message().await.is_none());
    }

    #[tokio::test]
    async fn writer_task_assigns_increasing_seq() {
        let (client, server) = duplex(64 * 1024);
        let task = spawn_writer(client);
        task.outgoing.send_event("initialized", None);
        task.outgoing.send_output("stderr", "boom\n");
        drop(task.outgoing);
        task.handle.await.unwrap();

        let mut reader = DapReader::new(server);
        let first = reader.next_message().await.unwrap().unwrap();
        let second = reader.next_message().await.unwrap().unwrap();
        assert_eq!(first["event"], "initialized");
        assert_eq!(second["body"]["output"], "boom\n");
        assert!(second["seq"].as_i64() > first["seq"].as_i64());
    }

    #[tokio::test]
    async fn writer_failure_cancels_token() {
        let (client, server) = duplex(64);
        drop(server);
        let task = spawn_writer(client);
        task.outgoing.send_event("terminated", None);
        tokio::time::timeout(std::time::Duration::from_secs(1), task.failed.cancelled())
            .await
            .unwrap();
    }
}
