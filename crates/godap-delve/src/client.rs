use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{oneshot, Mutex},
};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{decode_reply, encode_request, JsonStreamDecoder, RpcReply},
    types::{
        Breakpoint, ClearBreakpointIn, ClearBreakpointOut, CommandOut, CreateBreakpointIn,
        CreateBreakpointOut, DebuggerCommand, DebuggerState, DelveError, DetachIn, Empty, EvalIn,
        EvalOut, EvalScope, Goroutine, GoroutineId, ListBreakpointsIn, ListBreakpointsOut,
        ListFunctionArgsIn, ListFunctionArgsOut, ListGoroutinesIn, ListGoroutinesOut,
        ListLocalVarsIn, ListLocalVarsOut, ListPackageVarsIn, ListPackageVarsOut,
        ListPackagesBuildInfoIn, ListPackagesBuildInfoOut, ListSourcesIn, ListSourcesOut,
        LoadConfig, PackageBuildInfo, Result, SetIn, Stackframe, StacktraceIn, StacktraceOut,
        StateIn, StateOut, Variable, VersionInfo,
    },
};

#[derive(Debug, Clone)]
pub struct DelveClientConfig {
    pub connect_timeout: Duration,
    /// Applies to every call except the resume commands (`continue`, `next`,
    /// `step`, `stepOut`, `call`), which only return once the target stops.
    pub reply_timeout: Duration,
    pub pending_capacity: usize,
}

impl Default for DelveClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(30),
            pending_capacity: 64,
        }
    }
}

type PendingReply = oneshot::Sender<std::result::Result<RpcReply, DelveError>>;

#[derive(Debug)]
struct Inner {
    writer: Mutex<tokio::net::tcp::OwnedWriteHalf>,
    pending: Mutex<HashMap<u64, PendingReply>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    config: DelveClientConfig,
}

/// Handle to a Delve `RPCServer` connection.
///
/// Cloning is cheap; all clones share one connection. Calls may be issued
/// concurrently and are matched to replies by id, so a blocking `continue`
/// does not prevent a `halt` from being sent.
#[derive(Clone, Debug)]
pub struct DelveClient {
    inner: Arc<Inner>,
}

impl DelveClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with_config(addr, DelveClientConfig::default()).await
    }

    pub async fn connect_with_config(addr: SocketAddr, config: DelveClientConfig) -> Result<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| DelveError::Timeout)??;
        let _ = stream.set_nodelay(true);

        let (reader, writer) = stream.into_split();
        let inner = Arc::new(Inner {
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::with_capacity(config.pending_capacity)),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            config,
        });

        tokio::spawn(read_loop(reader, inner.clone()));
        tracing::debug!(target: "godap.delve", %addr, "connected to delve");

        Ok(Self { inner })
    }

    /// Closes the connection. In-flight calls fail with [`DelveError::Cancelled`].
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// A token that is cancelled when the connection closes, either through
    /// [`DelveClient::shutdown`] or because the server went away.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Calls `RPCServer.<method>` and waits at most the configured reply timeout.
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let value = self
            .send_request(method, params, Some(self.inner.config.reply_timeout))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Like [`DelveClient::call`] without a reply deadline.
    pub async fn call_blocking<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let value = self.send_request(method, params, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn send_request<P: Serialize>(
        &self,
        method: &str,
        params: &P,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if self.inner.shutdown.is_cancelled() {
            return Err(DelveError::ConnectionClosed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let packet = encode_request(id, method, params)?;
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(id, tx);
        }

        tracing::trace!(target: "godap.delve", id, method, "rpc call");
        let write_result = {
            let mut writer = self.inner.writer.lock().await;
            writer.write_all(&packet).await
        };
        if let Err(err) = write_result {
            self.remove_pending(id).await;
            return Err(DelveError::Io(err));
        }

        let wait = async {
            match timeout {
                Some(timeout) => tokio::time::timeout(timeout, rx).await.ok(),
                None => Some(rx.await),
            }
        };

        let reply = tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                self.remove_pending(id).await;
                return Err(DelveError::Cancelled);
            }
            res = wait => {
                match res {
                    Some(Ok(r)) => r,
                    Some(Err(_closed)) => return Err(DelveError::ConnectionClosed),
                    None => {
                        self.remove_pending(id).await;
                        tracing::warn!(target: "godap.delve", id, method, "rpc reply timed out");
                        return Err(DelveError::Timeout);
                    }
                }
            }
        }?;

        if let Some(message) = reply.error {
            tracing::debug!(target: "godap.delve", id, method, error = %message, "rpc call failed");
            return Err(DelveError::Rpc(message));
        }

        Ok(reply.result)
    }

    async fn remove_pending(&self, id: u64) {
        let mut pending = self.inner.pending.lock().await;
        pending.remove(&id);
    }

    pub async fn get_version(&self) -> Result<VersionInfo> {
        self.call("GetVersion", &Empty {}).await
    }

    /// `RPCServer.State`. With `non_blocking` the server answers even while
    /// the target is running.
    pub async fn state(&self, non_blocking: bool) -> Result<DebuggerState> {
        let out: StateOut = self.call("State", &StateIn { non_blocking }).await?;
        Ok(out.state)
    }

    /// Issues a resume command (`continue`, `next`, `step`, `stepOut`) and
    /// waits for the target to stop again.
    pub async fn resume(&self, name: &str) -> Result<DebuggerState> {
        let out: CommandOut = self
            .call_blocking("Command", &DebuggerCommand::named(name))
            .await?;
        Ok(out.state)
    }

    pub async fn halt(&self) -> Result<DebuggerState> {
        let out: CommandOut = self
            .call("Command", &DebuggerCommand::named("halt"))
            .await?;
        Ok(out.state)
    }

    /// Injects a function call on `goroutine_id` (`call <expr>`).
    pub async fn call_function(
        &self,
        goroutine_id: GoroutineId,
        expr: &str,
        return_cfg: LoadConfig,
    ) -> Result<DebuggerState> {
        let command = DebuggerCommand {
            name: "call".to_string(),
            goroutine_id: Some(goroutine_id),
            return_info_load_config: Some(return_cfg),
            expr: expr.to_string(),
            unsafe_call: false,
        };
        let out: CommandOut = self.call_blocking("Command", &command).await?;
        Ok(out.state)
    }

    pub async fn create_breakpoint(&self, breakpoint: Breakpoint) -> Result<Breakpoint> {
        let out: CreateBreakpointOut = self
            .call("CreateBreakpoint", &CreateBreakpointIn { breakpoint })
            .await?;
        Ok(out.breakpoint)
    }

    pub async fn clear_breakpoint(&self, id: i64) -> Result<Option<Breakpoint>> {
        let out: ClearBreakpointOut = self
            .call(
                "ClearBreakpoint",
                &ClearBreakpointIn {
                    id,
                    name: String::new(),
                },
            )
            .await?;
        Ok(out.breakpoint)
    }

    pub async fn list_breakpoints(&self) -> Result<Vec<Breakpoint>> {
        let out: ListBreakpointsOut = self
            .call("ListBreakpoints", &ListBreakpointsIn { all: false })
            .await?;
        Ok(out.breakpoints)
    }

    /// Lists goroutines; `count == 0` means no limit.
    pub async fn list_goroutines(&self, count: i64) -> Result<Vec<Goroutine>> {
        let out: ListGoroutinesOut = self
            .call("ListGoroutines", &ListGoroutinesIn { start: 0, count })
            .await?;
        Ok(out.goroutines)
    }

    pub async fn stacktrace(
        &self,
        goroutine_id: GoroutineId,
        depth: i64,
        cfg: LoadConfig,
    ) -> Result<Vec<Stackframe>> {
        let out: StacktraceOut = self
            .call(
                "Stacktrace",
                &StacktraceIn {
                    id: goroutine_id,
                    depth,
                    full: false,
                    cfg: Some(cfg),
                },
            )
            .await?;
        Ok(out.locations)
    }

    pub async fn list_local_vars(&self, scope: EvalScope, cfg: LoadConfig) -> Result<Vec<Variable>> {
        let out: ListLocalVarsOut = self
            .call("ListLocalVars", &ListLocalVarsIn { scope, cfg })
            .await?;
        Ok(out.variables)
    }

    pub async fn list_function_args(
        &self,
        scope: EvalScope,
        cfg: LoadConfig,
    ) -> Result<Vec<Variable>> {
        let out: ListFunctionArgsOut = self
            .call("ListFunctionArgs", &ListFunctionArgsIn { scope, cfg })
            .await?;
        Ok(out.args)
    }

    pub async fn list_package_vars(&self, filter: &str, cfg: LoadConfig) -> Result<Vec<Variable>> {
        let out: ListPackageVarsOut = self
            .call(
                "ListPackageVars",
                &ListPackageVarsIn {
                    filter: filter.to_string(),
                    cfg,
                },
            )
            .await?;
        Ok(out.variables)
    }

    pub async fn eval(
        &self,
        scope: EvalScope,
        expr: &str,
        cfg: Option<LoadConfig>,
    ) -> Result<Variable> {
        let out: EvalOut = self
            .call(
                "Eval",
                &EvalIn {
                    scope,
                    expr: expr.to_string(),
                    cfg,
                },
            )
            .await?;
        Ok(out.variable)
    }

    pub async fn set_variable(&self, scope: EvalScope, symbol: &str, value: &str) -> Result<()> {
        let _: Value = self
            .call(
                "Set",
                &SetIn {
                    scope,
                    symbol: symbol.to_string(),
                    value: value.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn list_packages_build_info(&self, include_files: bool) -> Result<Vec<PackageBuildInfo>> {
        let out: ListPackagesBuildInfoOut = self
            .call(
                "ListPackagesBuildInfo",
                &ListPackagesBuildInfoIn { include_files },
            )
            .await?;
        Ok(out.list)
    }

    pub async fn list_sources(&self) -> Result<Vec<String>> {
        let out: ListSourcesOut = self.call("ListSources", &ListSourcesIn::default()).await?;
        Ok(out.sources)
    }

    /// Detaches from the target, killing it when `kill` is set. The server
    /// exits afterwards, so the connection is shut down locally as well.
    pub async fn detach(&self, kill: bool) -> Result<()> {
        let result: Result<Value> = self.call("Detach", &DetachIn { kill }).await;
        self.shutdown();
        match result {
            Ok(_) => Ok(()),
            // The server may close the socket before the reply makes it out.
            Err(DelveError::ConnectionClosed | DelveError::Cancelled) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

async fn read_loop(mut reader: tokio::net::tcp::OwnedReadHalf, inner: Arc<Inner>) {
    let mut decoder = JsonStreamDecoder::new();
    let mut buf = vec![0u8; 16 * 1024];
    let mut terminated_with_error = false;

    'outer: loop {
        let n = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = reader.read(&mut buf) => match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    tracing::debug!(target: "godap.delve", error = %err, "delve read failed");
                    terminated_with_error = true;
                    break;
                }
            },
        };

        if let Err(err) = decoder.push(&buf[..n]) {
            tracing::error!(target: "godap.delve", error = %err, "dropping delve connection");
            terminated_with_error = true;
            break;
        }

        while let Some(value) = decoder.next_value() {
            let reply = match value.and_then(decode_reply) {
                Ok(reply) => reply,
                Err(err) => {
                    tracing::error!(target: "godap.delve", error = %err, "malformed delve reply");
                    terminated_with_error = true;
                    break 'outer;
                }
            };

            let tx = {
                let mut pending = inner.pending.lock().await;
                pending.remove(&reply.id)
            };
            match tx {
                Some(tx) => {
                    let _ = tx.send(Ok(reply));
                }
                None => {
                    tracing::debug!(target: "godap.delve", id = reply.id, "reply for unknown request");
                }
            }
        }
    }

    inner.shutdown.cancel();

    let pending = {
        let mut pending = inner.pending.lock().await;
        std::mem::take(&mut *pending)
    };
    if terminated_with_error || !pending.is_empty() {
        tracing::debug!(
            target: "godap.delve",
            pending = pending.len(),
            "delve connection closed"
        );
    }
    for (_id, tx) in pending {
        let _ = tx.send(Err(DelveError::ConnectionClosed));
    }
}
