//! Proxy mode: relays DAP messages unmodified between the editor and a
//! `dlv dap` server.
//!
//! The backend is brought up when the editor's first message, which must be
//! `initialize`, arrives. It is either an already running server (`port`),
//! one started by the editor through a `runInTerminal` reverse request that
//! dials back into a one-shot listener, or a `dlv dap` child spawned here.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use godap_config::AdapterConfig;
use godap_process::{interrupt, terminate_process_tree, ExitKind};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    process::Child,
    sync::mpsc,
};

use crate::{
    backend::{self, BackendEvent},
    dap::{
        messages::{message_command, message_type, Request},
        transport::{spawn_writer, DapReader, Outgoing, WriterTask},
    },
    launch::{free_port, DEFAULT_HOST},
};

/// Printed by `dlv dap` once it accepts connections.
const LISTENING_MARKER: &str = "DAP server listening at:";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy adapter was already started")]
    AlreadyStarted,

    #[error("the first message must be an initialize request")]
    NotInitialize,

    #[error("Cannot find Delve debugger. Install from https://github.com/go-delve/delve & ensure it is in your Go tools path, \"GOPATH/bin\" or \"PATH\".")]
    DelveNotFound,

    #[error("logDest must be an absolute path: {0}")]
    RelativeLogDest(String),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("dlv dap exited before it started listening")]
    BackendExited,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("no free port on {0}")]
    NoFreePort(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// The subset of a `dlv dap` launch configuration the proxy acts on.
/// Everything else is forwarded to the server untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    pub name: Option<String>,
    pub host: Option<String>,
    /// Port of an externally launched `dlv dap`.
    pub port: Option<u16>,
    /// `integratedTerminal` or `externalTerminal` run `dlv dap` in the
    /// editor's terminal.
    pub console: Option<String>,
    pub dlv_flags: Vec<String>,
    pub show_log: bool,
    pub log_output: Option<String>,
    pub log_dest: Option<String>,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub dlv_tool_path: Option<String>,
}

impl ProxyConfig {
    fn host(&self) -> &str {
        self.host
            .as_deref()
            .filter(|host| !host.is_empty())
            .unwrap_or(DEFAULT_HOST)
    }

    /// `integrated` or `external` when `dlv dap` runs in a terminal.
    fn terminal_kind(&self) -> Option<&'static str> {
        match self.console.as_deref() {
            Some("integratedTerminal") => Some("integrated"),
            Some("externalTerminal") => Some("external"),
            _ => None,
        }
    }

    fn cwd(&self) -> PathBuf {
        self.cwd.as_deref().map(PathBuf::from).unwrap_or_default()
    }

    /// `dap` followed by the flags shared by every start variant.
    fn dap_args(&self) -> Result<Vec<String>, ProxyError> {
        let mut args = vec!["dap".to_string()];
        args.extend(self.dlv_flags.iter().cloned());
        if self.show_log {
            args.push("--log=true".to_string());
            if let Some(output) = self.log_output.as_deref().filter(|o| !o.is_empty()) {
                args.push(format!("--log-output={output}"));
            }
        }
        if let Some(dest) = self.log_dest.as_deref().filter(|d| !d.is_empty()) {
            if !Path::new(dest).is_absolute() {
                return Err(ProxyError::RelativeLogDest(dest.to_string()));
            }
            args.push(format!("--log-dest={dest}"));
        }
        Ok(args)
    }
}

/// A connected `dlv dap` server and, when spawned here, its process.
struct Backend {
    stream: TcpStream,
    child: Option<Child>,
}

pub struct ProxyAdapter {
    config: ProxyConfig,
    adapter: AdapterConfig,
    started: bool,
}

impl ProxyAdapter {
    pub fn new(config: ProxyConfig, adapter: AdapterConfig) -> Self {
        Self {
            config,
            adapter,
            started: false,
        }
    }

    /// Relays between the editor (`reader`/`writer`) and the backend until
    /// the editor closes its side.
    pub async fn start<R, W>(&mut self, reader: R, writer: W) -> Result<(), ProxyError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if self.started {
            return Err(ProxyError::AlreadyStarted);
        }
        self.started = true;

        let WriterTask {
            outgoing: client,
            failed: client_failed,
            handle: client_writer,
        } = spawn_writer(writer);
        let mut client_reader = DapReader::new(reader);

        let first = loop {
            match client_reader.next_message().await {
                Some(Ok(message)) => break Some(message),
                Some(Err(err)) if err.is_recoverable() => {
                    tracing::warn!(target: "godap.proxy", error = %err, "dropping malformed DAP message");
                }
                Some(Err(err)) => {
                    tracing::debug!(target: "godap.proxy", error = %err, "editor stream failed");
                    break None;
                }
                None => break None,
            }
        };

        if let Some(first) = first {
            let is_initialize = message_type(&first) == Some("request")
                && message_command(&first) == Some("initialize");
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let started = if is_initialize {
                self.start_backend(&client, events_tx).await
            } else {
                Err(ProxyError::NotInitialize)
            };

            match started {
                Ok(backend) => {
                    relay(
                        first,
                        backend,
                        &client,
                        &client_failed,
                        &mut client_reader,
                        events_rx,
                        self.adapter.dispose_grace(),
                    )
                    .await;
                }
                Err(err) => {
                    tracing::error!(target: "godap.proxy", error = %err, "couldn't start dlv dap");
                    // Output the backend produced while failing to start.
                    let mut events_rx = events_rx;
                    while let Ok(event) = events_rx.try_recv() {
                        forward_backend_output(&client, event);
                    }
                    reject_all(first, &err, &client, &mut client_reader).await;
                }
            }
        }

        drop(client);
        let _ = client_writer.await;
        Ok(())
    }

    async fn start_backend(
        &self,
        client: &Outgoing,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Result<Backend, ProxyError> {
        let host = self.config.host().to_string();

        if let Some(port) = self.config.port {
            let address = format!("{host}:{port}");
            tracing::info!(target: "godap.proxy", %address, "connecting to external dlv dap");
            let stream = connect(&address, self.adapter.connect_timeout()).await?;
            return Ok(Backend {
                stream,
                child: None,
            });
        }

        let dlv = self.dlv_program()?;
        let mut args = self.config.dap_args()?;

        if let Some(kind) = self.config.terminal_kind() {
            let listener = TcpListener::bind((DEFAULT_HOST, 0)).await?;
            let port = listener.local_addr()?.port();
            args.push(format!("--client-addr=:{port}"));

            let mut terminal_args = vec![dlv.display().to_string()];
            terminal_args.extend(args);
            let name = self.config.name.as_deref().unwrap_or("Go");
            let seq = client.send_request(
                "runInTerminal",
                json!({
                    "kind": kind,
                    "title": format!("Go Debug Terminal ({name})"),
                    "cwd": self.config.cwd().display().to_string(),
                    "args": terminal_args,
                    "env": self.config.env,
                }),
            );
            tracing::info!(target: "godap.proxy", seq, port, "waiting for dlv dap to dial back");

            let (stream, peer) = tokio::time::timeout(self.adapter.startup_timeout(), listener.accept())
                .await
                .map_err(|_| ProxyError::Timeout("dlv dap to connect from the terminal"))??;
            tracing::debug!(target: "godap.proxy", %peer, "dlv dap connected");
            return Ok(Backend {
                stream,
                child: None,
            });
        }

        let port = free_port(&host).map_err(|_| ProxyError::NoFreePort(host.clone()))?;
        let address = format!("{host}:{port}");
        args.push(format!("--listen={address}"));

        let spawned = backend::spawn_process(
            &dlv,
            &args,
            &self.config.cwd(),
            &self.config.env,
            events,
            Some(LISTENING_MARKER),
        )
        .map_err(|source| ProxyError::Spawn {
            program: dlv.display().to_string(),
            source,
        })?;
        let mut child = spawned.child;

        let ready = match tokio::time::timeout(self.adapter.startup_timeout(), spawned.ready).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ProxyError::BackendExited),
            Err(_) => Err(ProxyError::Timeout("dlv dap to start listening")),
        };
        let stream = match ready {
            Ok(()) => connect(&address, self.adapter.connect_timeout()).await,
            Err(err) => Err(err),
        };
        match stream {
            Ok(stream) => Ok(Backend {
                stream,
                child: Some(child),
            }),
            Err(err) => {
                let _ = terminate_process_tree(&mut child, self.adapter.dispose_grace()).await;
                Err(err)
            }
        }
    }

    fn dlv_program(&self) -> Result<PathBuf, ProxyError> {
        match self.config.dlv_tool_path.as_deref().filter(|p| !p.is_empty()) {
            Some(path) => {
                let path = PathBuf::from(path);
                if path.exists() {
                    Ok(path)
                } else {
                    Err(ProxyError::DelveNotFound)
                }
            }
            None => backend::default_dlv(&self.adapter).ok_or(ProxyError::DelveNotFound),
        }
    }
}

async fn connect(address: &str, timeout: Duration) -> Result<TcpStream, ProxyError> {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ProxyError::Connect {
            address: address.to_string(),
            source,
        }),
        Err(_) => Err(ProxyError::Connect {
            address: address.to_string(),
            source: io::Error::new(io::ErrorKind::TimedOut, "connection timed out"),
        }),
    }
}

fn forward_backend_output(client: &Outgoing, event: BackendEvent) {
    match event {
        BackendEvent::Stdout(text) => client.send_output("stdout", text),
        BackendEvent::Stderr(text) => client.send_output("stderr", text),
    }
}

/// Answers `first` and every later request with the start failure.
async fn reject_all<R>(
    first: Value,
    err: &ProxyError,
    client: &Outgoing,
    client_reader: &mut DapReader<R>,
) where
    R: AsyncRead + Unpin,
{
    let message = format!("Couldn't start dlv dap:\n{err}");
    let reject = |message_value: Value| {
        if message_type(&message_value) != Some("request") {
            return;
        }
        match serde_json::from_value::<Request>(message_value) {
            Ok(request) => client.send_error(&request, 3000, message.clone()),
            Err(err) => tracing::debug!(target: "godap.proxy", error = %err, "dropping invalid request"),
        }
    };

    reject(first);
    client.send_output("stderr", format!("{message}\n"));
    client.send_event("terminated", None);

    while let Some(next) = client_reader.next_message().await {
        match next {
            Ok(value) => reject(value),
            Err(err) if err.is_recoverable() => {
                tracing::warn!(target: "godap.proxy", error = %err, "dropping malformed DAP message");
            }
            Err(_) => break,
        }
    }
}

async fn relay<R>(
    first: Value,
    backend: Backend,
    client: &Outgoing,
    client_failed: &tokio_util::sync::CancellationToken,
    client_reader: &mut DapReader<R>,
    mut events: mpsc::UnboundedReceiver<BackendEvent>,
    grace: Duration,
) where
    R: AsyncRead + Unpin,
{
    let Backend { stream, mut child } = backend;
    let (server_read, server_write) = stream.into_split();
    let WriterTask {
        outgoing: server,
        failed: server_failed,
        handle: server_writer,
    } = spawn_writer(server_write);
    let mut server_reader = DapReader::new(server_read);

    server.send_raw(first);

    let mut server_open = true;
    let mut terminated = false;
    let mut connection_lost = |reason: Option<String>| {
        if terminated {
            return;
        }
        terminated = true;
        if let Some(reason) = reason {
            tracing::warn!(target: "godap.proxy", %reason, "dlv dap connection lost");
            client.send_output("console", format!("connection error: {reason}\n"));
        }
        client.send_event("terminated", None);
    };

    loop {
        tokio::select! {
            message = client_reader.next_message() => match message {
                Some(Ok(message)) => {
                    if message_type(&message) == Some("response") {
                        tracing::debug!(
                            target: "godap.proxy",
                            command = message_command(&message).unwrap_or_default(),
                            "dropping response from editor"
                        );
                    } else if server_open {
                        server.send_raw(message);
                    }
                }
                Some(Err(err)) if err.is_recoverable() => {
                    tracing::warn!(target: "godap.proxy", error = %err, "dropping malformed DAP message");
                }
                Some(Err(err)) => {
                    tracing::debug!(target: "godap.proxy", error = %err, "editor stream failed");
                    break;
                }
                None => break,
            },
            message = server_reader.next_message(), if server_open => match message {
                Some(Ok(message)) => {
                    if message_type(&message) == Some("request") {
                        tracing::debug!(
                            target: "godap.proxy",
                            command = message_command(&message).unwrap_or_default(),
                            "dropping request from dlv dap"
                        );
                    } else {
                        client.send_raw(message);
                    }
                }
                Some(Err(err)) if err.is_recoverable() => {
                    tracing::warn!(target: "godap.proxy", error = %err, "dropping malformed DAP message from dlv dap");
                }
                Some(Err(err)) => {
                    server_open = false;
                    connection_lost(Some(err.to_string()));
                }
                None => {
                    server_open = false;
                    connection_lost(None);
                }
            },
            _ = server_failed.cancelled(), if server_open => {
                server_open = false;
                connection_lost(Some("write to dlv dap failed".to_string()));
            }
            Some(event) = events.recv() => forward_backend_output(client, event),
            _ = client_failed.cancelled() => break,
        }
    }

    drop(server);
    let _ = server_writer.await;
    if let Some(child) = child.as_mut() {
        dispose_backend(child, grace).await;
    }
}

/// Waits `grace` for `child` to exit on its own, then interrupts it, then
/// kills its process group.
async fn dispose_backend(child: &mut Child, grace: Duration) {
    let status = match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::debug!(target: "godap.proxy", "interrupting dlv dap");
            if let Err(err) = interrupt(child) {
                tracing::debug!(target: "godap.proxy", error = %err, "failed to interrupt dlv dap");
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => terminate_process_tree(child, grace).await,
            }
        }
    };
    match status {
        Ok(status) => {
            tracing::info!(target: "godap.proxy", exit = %ExitKind::from_status(status), "dlv dap exited");
        }
        Err(err) => tracing::warn!(target: "godap.proxy", error = %err, "failed to wait for dlv dap"),
    }
}

/// Runs the proxy over stdio.
pub async fn run_stdio(config: ProxyConfig, adapter: AdapterConfig) -> anyhow::Result<()> {
    let mut proxy = ProxyAdapter::new(config, adapter);
    proxy
        .start(tokio::io::stdin(), tokio::io::stdout())
        .await
        .map_err(anyhow::Error::from)
}
