//! Bridge-mode DAP server loop: decodes editor requests and feeds them to a
//! [`Session`] running on its own task.

use godap_config::AdapterConfig;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};

use crate::{
    dap::{
        codec::CodecError,
        messages::{message_type, Request},
        transport::{spawn_writer, DapReader, WriterTask},
    },
    session::Session,
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Codec(#[from] CodecError),
}

type Result<T> = std::result::Result<T, ServerError>;

/// Runs the bridge adapter over stdio.
pub async fn run_stdio(config: AdapterConfig) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    run(stdin, stdout, config).await.map_err(anyhow::Error::from)
}

/// Serves one debug session over `reader`/`writer`. Returns once the session
/// has ended and every queued message has been written.
pub async fn run<R, W>(reader: R, writer: W, config: AdapterConfig) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let WriterTask {
        outgoing,
        failed,
        handle: writer_task,
    } = spawn_writer(writer);
    let (tx, rx) = mpsc::unbounded_channel::<Request>();
    let mut session_task = tokio::spawn(Session::new(outgoing.clone(), config).run(rx));
    let mut session_done = false;

    let mut reader = DapReader::new(reader);
    let mut outcome = Ok(());
    loop {
        tokio::select! {
            _ = failed.cancelled() => {
                tracing::debug!(target: "godap.server", "editor stream closed for writing");
                break;
            }
            _ = &mut session_task => {
                session_done = true;
                break;
            }
            message = reader.next_message() => match message {
                Some(Ok(value)) => {
                    if message_type(&value) != Some("request") {
                        tracing::debug!(target: "godap.server", "ignoring non-request message");
                        continue;
                    }
                    match serde_json::from_value::<Request>(value) {
                        Ok(request) => {
                            if tx.send(request).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(target: "godap.server", error = %err, "dropping invalid request");
                        }
                    }
                }
                Some(Err(err)) if err.is_recoverable() => {
                    tracing::warn!(target: "godap.server", error = %err, "dropping malformed DAP message");
                }
                Some(Err(err)) => {
                    tracing::debug!(target: "godap.server", error = %err, "editor stream failed");
                    outcome = Err(err.into());
                    break;
                }
                None => break,
            },
        }
    }

    drop(tx);
    if !session_done {
        if let Err(err) = session_task.await {
            tracing::error!(target: "godap.server", error = %err, "session task failed");
        }
    }
    drop(outgoing);
    let _ = writer_task.await;
    outcome
}
