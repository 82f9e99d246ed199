use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedWriteHalf, TcpListener},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::JsonStreamDecoder,
    types::{
        Breakpoint, ClearBreakpointIn, CreateBreakpointIn, DebuggerCommand, DebuggerState, DetachIn,
        EvalIn, Function, Goroutine, ListPackageVarsIn, Location, PackageBuildInfo, SetIn,
        Stackframe, StacktraceIn, Thread, Variable, FATAL_THROW_ID, UNRECOVERED_PANIC_ID,
    },
};

/// Source file the mock program is "compiled" from unless configured otherwise.
pub const MOCK_MAIN_FILE: &str = "/work/hello/main.go";

/// A small in-process stand-in for `dlv --headless`.
///
/// It speaks Delve's JSON-RPC framing and keeps just enough target state to
/// drive a debug session: breakpoints, a running flag that `halt` can
/// interrupt, and a current location that moves on stops and steps. Each
/// request is handled on its own task so a blocking `continue` can be halted
/// from the same connection.
pub struct MockDelveServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

#[derive(Clone, Debug)]
pub struct MockDelveServerConfig {
    pub api_version: i64,
    /// Reply delays keyed by RPC method name (without the `RPCServer.` prefix).
    pub delayed_replies: Vec<DelayedReply>,
    /// Reply delays applied after the call took effect, keyed by method name
    /// or `Command.<name>`.
    pub late_replies: Vec<DelayedReply>,
    /// How long `continue` runs before reaching the next breakpoint (or exiting).
    pub run_duration: Duration,
    pub step_duration: Duration,
    pub main_file: String,
    /// Line the target is parked on before the first resume.
    pub entry_line: i64,
    /// Lines above this fail to resolve, like a line past the end of the file.
    pub max_line: i64,
    /// Replaces the synthesized two-frame stack when non-empty.
    pub frames: Vec<Stackframe>,
    /// Replaces the synthesized goroutine list when non-empty.
    pub goroutines: Vec<Goroutine>,
    pub locals: Vec<Variable>,
    pub args: Vec<Variable>,
    pub package_vars: Vec<Variable>,
    /// Results for `Eval`, keyed by expression. Locals and arguments are also
    /// found by name.
    pub eval_results: HashMap<String, Variable>,
    pub call_return_values: Vec<Variable>,
    pub packages: Vec<PackageBuildInfo>,
    pub sources: Vec<String>,
    /// Methods (or `Command.<name>` for debugger commands) that always fail
    /// with the given message.
    pub fail_methods: HashMap<String, String>,
    /// Once every user breakpoint has been hit, stop on the unrecovered-panic
    /// breakpoint before exiting.
    pub panic_before_exit: bool,
    pub exit_status: i64,
    /// Goroutine reported as current when a user breakpoint stops the target.
    pub breakpoint_goroutine: i64,
}

impl Default for MockDelveServerConfig {
    fn default() -> Self {
        Self {
            api_version: 2,
            delayed_replies: Vec::new(),
            late_replies: Vec::new(),
            run_duration: Duration::from_millis(50),
            step_duration: Duration::from_millis(10),
            main_file: MOCK_MAIN_FILE.to_string(),
            entry_line: 5,
            max_line: 1000,
            frames: Vec::new(),
            goroutines: Vec::new(),
            locals: Vec::new(),
            args: Vec::new(),
            package_vars: Vec::new(),
            eval_results: HashMap::new(),
            call_return_values: Vec::new(),
            packages: Vec::new(),
            sources: Vec::new(),
            fail_methods: HashMap::new(),
            panic_before_exit: false,
            exit_status: 0,
            breakpoint_goroutine: 1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DelayedReply {
    pub method: String,
    pub delay: Duration,
}

impl MockDelveServer {
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(Default::default()).await
    }

    pub async fn spawn_with_config(config: MockDelveServerConfig) -> std::io::Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let state = Arc::new(State::new(config));
        let task_shutdown = shutdown.clone();
        let task_state = state.clone();

        tokio::spawn(async move {
            let _ = run(listener, task_state, task_shutdown).await;
        });

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn main_file(&self) -> &str {
        &self.state.config.main_file
    }

    /// Number of calls received for `method`.
    pub async fn calls(&self, method: &str) -> usize {
        self.state
            .calls
            .lock()
            .await
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    /// Names of every `Command` call in arrival order (`continue`, `halt`, ...).
    pub async fn commands(&self) -> Vec<String> {
        self.state.commands.lock().await.clone()
    }

    /// User breakpoints currently installed.
    pub async fn breakpoints(&self) -> Vec<Breakpoint> {
        self.state.breakpoints.lock().await.values().cloned().collect()
    }

    /// `Kill` flag of every `Detach` call.
    pub async fn detach_requests(&self) -> Vec<bool> {
        self.state.detach_requests.lock().await.clone()
    }

    /// `(symbol, value)` of every `Set` call.
    pub async fn set_requests(&self) -> Vec<(String, String)> {
        self.state
            .set_requests
            .lock()
            .await
            .iter()
            .map(|(_, symbol, value)| (symbol.clone(), value.clone()))
            .collect()
    }

    /// Scope goroutine of every `Set` call.
    pub async fn set_goroutines(&self) -> Vec<i64> {
        self.state
            .set_requests
            .lock()
            .await
            .iter()
            .map(|(goroutine, _, _)| *goroutine)
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }
}

impl Drop for MockDelveServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Debug, Clone)]
struct Position {
    file: String,
    line: i64,
    function: String,
}

struct State {
    config: MockDelveServerConfig,
    calls: Mutex<HashMap<String, usize>>,
    commands: Mutex<Vec<String>>,
    breakpoints: Mutex<BTreeMap<i64, Breakpoint>>,
    hit: Mutex<BTreeSet<i64>>,
    next_breakpoint_id: AtomicI64,
    running: AtomicBool,
    exited: AtomicBool,
    panicked: AtomicBool,
    /// Cancelled by `halt` to interrupt the current run.
    run_token: Mutex<Option<CancellationToken>>,
    position: Mutex<Position>,
    last_stop: Mutex<DebuggerState>,
    detach_requests: Mutex<Vec<bool>>,
    set_requests: Mutex<Vec<(i64, String, String)>>,
}

impl State {
    fn new(config: MockDelveServerConfig) -> Self {
        let position = Position {
            file: config.main_file.clone(),
            line: config.entry_line,
            function: "main.main".to_string(),
        };
        let last_stop = stopped_state(&position, None, None);
        Self {
            config,
            calls: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            breakpoints: Mutex::new(BTreeMap::new()),
            hit: Mutex::new(BTreeSet::new()),
            next_breakpoint_id: AtomicI64::new(1),
            running: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            panicked: AtomicBool::new(false),
            run_token: Mutex::new(None),
            position: Mutex::new(position),
            last_stop: Mutex::new(last_stop),
            detach_requests: Mutex::new(Vec::new()),
            set_requests: Mutex::new(Vec::new()),
        }
    }

    fn reply_delay(&self, method: &str) -> Option<Duration> {
        find_delay(&self.config.delayed_replies, method)
    }

    fn late_reply_delay(&self, method: &str, params: &Value) -> Option<Duration> {
        let command = params
            .get("name")
            .and_then(Value::as_str)
            .map(|name| format!("{method}.{name}"));
        command
            .and_then(|command| find_delay(&self.config.late_replies, &command))
            .or_else(|| find_delay(&self.config.late_replies, method))
    }

    async fn current_state(&self) -> DebuggerState {
        if self.exited.load(Ordering::SeqCst) {
            return self.exited_state();
        }
        if self.running.load(Ordering::SeqCst) {
            return DebuggerState {
                running: true,
                ..DebuggerState::default()
            };
        }
        self.last_stop.lock().await.clone()
    }

    fn exited_state(&self) -> DebuggerState {
        DebuggerState {
            exited: true,
            exit_status: self.config.exit_status,
            ..DebuggerState::default()
        }
    }

    async fn frames(&self) -> Vec<Stackframe> {
        if !self.config.frames.is_empty() {
            return self.config.frames.clone();
        }
        let position = self.position.lock().await.clone();
        vec![
            frame(&position.file, position.line, &position.function),
            frame("/usr/local/go/src/runtime/proc.go", 250, "runtime.main"),
        ]
    }

    async fn goroutines(&self) -> Vec<Goroutine> {
        if !self.config.goroutines.is_empty() {
            return self.config.goroutines.clone();
        }
        let position = self.position.lock().await.clone();
        let main = location(&position.file, position.line, &position.function);
        let parked = location("/usr/local/go/src/runtime/proc.go", 398, "runtime.gopark");
        vec![
            Goroutine {
                id: 1,
                current_loc: main.clone(),
                user_current_loc: main,
                thread_id: 1,
                ..Goroutine::default()
            },
            Goroutine {
                id: 2,
                current_loc: parked.clone(),
                user_current_loc: parked,
                ..Goroutine::default()
            },
        ]
    }

    async fn begin_run(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.run_token.lock().await = Some(token.clone());
        self.running.store(true, Ordering::SeqCst);
        token
    }

    async fn finish_run(&self, state: DebuggerState) -> DebuggerState {
        *self.run_token.lock().await = None;
        if state.exited {
            self.exited.store(true, Ordering::SeqCst);
        } else {
            *self.last_stop.lock().await = state.clone();
        }
        self.running.store(false, Ordering::SeqCst);
        state
    }

    async fn stop_at(&self, position: Position, breakpoint: Option<Breakpoint>) -> DebuggerState {
        *self.position.lock().await = position.clone();
        let mut state = stopped_state(&position, None, None);
        let user_breakpoint = breakpoint.as_ref().is_some_and(|bp| bp.id > 0);
        if let Some(thread) = state.current_thread.as_mut() {
            thread.breakpoint = breakpoint;
            if user_breakpoint {
                thread.goroutine_id = self.config.breakpoint_goroutine;
            }
        }
        if let Some(goroutine) = state.current_goroutine.as_mut().filter(|_| user_breakpoint) {
            goroutine.id = self.config.breakpoint_goroutine;
        }
        self.finish_run(state).await
    }

    async fn next_unhit_breakpoint(&self) -> Option<Breakpoint> {
        let breakpoints = self.breakpoints.lock().await;
        let mut hit = self.hit.lock().await;
        let bp = breakpoints.values().find(|bp| !hit.contains(&bp.id))?.clone();
        hit.insert(bp.id);
        Some(bp)
    }
}

fn location(file: &str, line: i64, function: &str) -> Location {
    Location {
        pc: 0x4a_0000 + line as u64,
        file: file.to_string(),
        line,
        function: Some(Function {
            name: function.to_string(),
            ..Function::default()
        }),
    }
}

fn frame(file: &str, line: i64, function: &str) -> Stackframe {
    Stackframe {
        location: location(file, line, function),
        ..Stackframe::default()
    }
}

fn stopped_state(
    position: &Position,
    breakpoint: Option<Breakpoint>,
    return_values: Option<Vec<Variable>>,
) -> DebuggerState {
    let loc = location(&position.file, position.line, &position.function);
    DebuggerState {
        running: false,
        current_thread: Some(Thread {
            id: 1,
            pc: loc.pc,
            file: loc.file.clone(),
            line: loc.line,
            function: loc.function.clone(),
            goroutine_id: 1,
            breakpoint,
            return_values,
        }),
        current_goroutine: Some(Goroutine {
            id: 1,
            current_loc: loc.clone(),
            user_current_loc: loc,
            thread_id: 1,
            ..Goroutine::default()
        }),
        ..DebuggerState::default()
    }
}

async fn run(
    listener: TcpListener,
    state: Arc<State>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let (socket, _) = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        accept = listener.accept() => accept?,
    };

    let (mut reader, writer) = socket.into_split();
    let writer = Arc::new(Mutex::new(writer));
    let mut decoder = JsonStreamDecoder::new();
    let mut buf = vec![0u8; 8 * 1024];

    loop {
        let n = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            res = reader.read(&mut buf) => res?,
        };
        if n == 0 {
            shutdown.cancel();
            return Ok(());
        }
        if decoder.push(&buf[..n]).is_err() {
            return Ok(());
        }

        while let Some(value) = decoder.next_value() {
            let Ok(request) = value else {
                return Ok(());
            };
            let writer = writer.clone();
            let state = state.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                handle_request(writer, state, request, shutdown).await;
            });
        }
    }
}

async fn handle_request(
    writer: Arc<Mutex<OwnedWriteHalf>>,
    state: Arc<State>,
    request: Value,
    shutdown: CancellationToken,
) {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let method = method.strip_prefix("RPCServer.").unwrap_or(method).to_string();
    let params = request
        .get("params")
        .and_then(|params| params.get(0))
        .cloned()
        .unwrap_or(Value::Null);

    *state.calls.lock().await.entry(method.clone()).or_default() += 1;

    if let Some(delay) = state.reply_delay(&method) {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let late = state.late_reply_delay(&method, &params);
    let outcome = tokio::select! {
        _ = shutdown.cancelled() => return,
        outcome = dispatch(&state, &method, params) => outcome,
    };
    if let Some(delay) = late {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let reply = match outcome {
        Ok(result) => json!({ "id": id, "result": result, "error": null }),
        Err(message) => json!({ "id": id, "result": null, "error": message }),
    };
    let mut bytes = match serde_json::to_vec(&reply) {
        Ok(bytes) => bytes,
        Err(_) => return,
    };
    bytes.push(b'\n');

    {
        let mut writer = writer.lock().await;
        if writer.write_all(&bytes).await.is_err() {
            shutdown.cancel();
            return;
        }
        let _ = writer.flush().await;
    }

    if method == "Detach" {
        // The real server exits after detaching.
        shutdown.cancel();
    }
}

fn find_delay(delays: &[DelayedReply], method: &str) -> Option<Duration> {
    delays
        .iter()
        .find(|entry| entry.method == method)
        .map(|entry| entry.delay)
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, String> {
    serde_json::from_value(params).map_err(|err| format!("invalid arguments: {err}"))
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|err| err.to_string())
}

async fn dispatch(state: &State, method: &str, params: Value) -> Result<Value, String> {
    if let Some(message) = state.config.fail_methods.get(method) {
        return Err(message.clone());
    }

    match method {
        "GetVersion" => Ok(json!({
            "DelveVersion": "Version: 1.22.1",
            "APIVersion": state.config.api_version,
        })),
        "State" => {
            let current = state.current_state().await;
            Ok(json!({ "State": to_value(current)? }))
        }
        "Command" => {
            let command: DebuggerCommand = parse(params)?;
            state.commands.lock().await.push(command.name.clone());
            if let Some(message) = state
                .config
                .fail_methods
                .get(&format!("Command.{}", command.name))
            {
                return Err(message.clone());
            }
            let result = run_command(state, command).await?;
            Ok(json!({ "State": to_value(result)? }))
        }
        "CreateBreakpoint" => {
            let args: CreateBreakpointIn = parse(params)?;
            let mut requested = args.breakpoint;
            if requested.line <= 0 || requested.line > state.config.max_line {
                return Err(format!(
                    "could not find statement at {}:{}, please use a line with a statement",
                    requested.file, requested.line
                ));
            }
            let mut breakpoints = state.breakpoints.lock().await;
            if let Some(existing) = breakpoints
                .values()
                .find(|bp| bp.file == requested.file && bp.line == requested.line)
            {
                return Err(format!(
                    "Breakpoint exists at {}:{} at {:x}",
                    existing.file, existing.line, existing.addr
                ));
            }
            requested.id = state.next_breakpoint_id.fetch_add(1, Ordering::SeqCst);
            requested.addr = 0x4a_0000 + requested.line as u64;
            breakpoints.insert(requested.id, requested.clone());
            Ok(json!({ "Breakpoint": to_value(requested)? }))
        }
        "ClearBreakpoint" => {
            let args: ClearBreakpointIn = parse(params)?;
            match state.breakpoints.lock().await.remove(&args.id) {
                Some(bp) => Ok(json!({ "Breakpoint": to_value(bp)? })),
                None => Err(format!("Breakpoint {} does not exist", args.id)),
            }
        }
        "ListBreakpoints" => {
            let mut list = vec![
                Breakpoint {
                    id: UNRECOVERED_PANIC_ID,
                    name: "unrecovered-panic".to_string(),
                    file: "/usr/local/go/src/runtime/panic.go".to_string(),
                    line: 1038,
                    function_name: "runtime.fatalpanic".to_string(),
                    ..Breakpoint::default()
                },
                Breakpoint {
                    id: FATAL_THROW_ID,
                    name: "runtime-fatal-throw".to_string(),
                    file: "/usr/local/go/src/runtime/panic.go".to_string(),
                    line: 1017,
                    function_name: "runtime.fatalthrow".to_string(),
                    ..Breakpoint::default()
                },
            ];
            list.extend(state.breakpoints.lock().await.values().cloned());
            Ok(json!({ "Breakpoints": to_value(list)? }))
        }
        "ListGoroutines" => {
            let goroutines = state.goroutines().await;
            Ok(json!({ "Goroutines": to_value(goroutines)?, "Nextg": -1 }))
        }
        "Stacktrace" => {
            let args: StacktraceIn = parse(params)?;
            let frames = state.frames().await;
            let depth = usize::try_from(args.depth.max(0)).unwrap_or(0) + 1;
            let frames: Vec<_> = frames.into_iter().take(depth).collect();
            Ok(json!({ "Locations": to_value(frames)? }))
        }
        "ListLocalVars" => Ok(json!({ "Variables": to_value(&state.config.locals)? })),
        "ListFunctionArgs" => Ok(json!({ "Args": to_value(&state.config.args)? })),
        "ListPackageVars" => {
            let args: ListPackageVarsIn = parse(params)?;
            // Only the anchored `^pkg\.` form is understood.
            let prefix = args.filter.trim_start_matches('^').replace("\\.", ".");
            let vars: Vec<_> = state
                .config
                .package_vars
                .iter()
                .filter(|var| var.name.starts_with(&prefix))
                .cloned()
                .collect();
            Ok(json!({ "Variables": to_value(vars)? }))
        }
        "Eval" => {
            let args: EvalIn = parse(params)?;
            let found = state.config.eval_results.get(&args.expr).cloned().or_else(|| {
                state
                    .config
                    .locals
                    .iter()
                    .chain(state.config.args.iter())
                    .find(|var| var.name == args.expr)
                    .cloned()
            });
            match found {
                Some(variable) => Ok(json!({ "Variable": to_value(variable)? })),
                None => Err(format!("could not find symbol value for {}", args.expr)),
            }
        }
        "Set" => {
            let args: SetIn = parse(params)?;
            state
                .set_requests
                .lock()
                .await
                .push((args.scope.goroutine_id, args.symbol, args.value));
            Ok(json!({}))
        }
        "Detach" => {
            let args: DetachIn = parse(params)?;
            state.detach_requests.lock().await.push(args.kill);
            Ok(json!({}))
        }
        "ListPackagesBuildInfo" => Ok(json!({ "List": to_value(&state.config.packages)? })),
        "ListSources" => Ok(json!({ "Sources": to_value(&state.config.sources)? })),
        other => Err(format!("rpc: can't find method RPCServer.{other}")),
    }
}

async fn run_command(state: &State, command: DebuggerCommand) -> Result<DebuggerState, String> {
    if command.name == "halt" {
        let token = state.run_token.lock().await.clone();
        let Some(token) = token else {
            return Ok(state.current_state().await);
        };
        token.cancel();
        for _ in 0..1000 {
            if !state.running.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        return Ok(state.current_state().await);
    }

    if state.exited.load(Ordering::SeqCst) {
        return Err(format!(
            "Process 4242 has exited with status {}",
            state.config.exit_status
        ));
    }
    if state.running.load(Ordering::SeqCst) {
        return Err("cannot resume: target is already running".to_string());
    }

    match command.name.as_str() {
        "continue" => {
            let token = state.begin_run().await;
            tokio::select! {
                _ = token.cancelled() => {
                    let position = state.position.lock().await.clone();
                    Ok(state.stop_at(position, None).await)
                }
                _ = tokio::time::sleep(state.config.run_duration) => {
                    if let Some(bp) = state.next_unhit_breakpoint().await {
                        let position = Position {
                            file: bp.file.clone(),
                            line: bp.line,
                            function: "main.main".to_string(),
                        };
                        return Ok(state.stop_at(position, Some(bp)).await);
                    }
                    if state.config.panic_before_exit && !state.panicked.swap(true, Ordering::SeqCst) {
                        let position = Position {
                            file: "/usr/local/go/src/runtime/panic.go".to_string(),
                            line: 1038,
                            function: "runtime.fatalpanic".to_string(),
                        };
                        let bp = Breakpoint {
                            id: UNRECOVERED_PANIC_ID,
                            name: "unrecovered-panic".to_string(),
                            ..Breakpoint::default()
                        };
                        return Ok(state.stop_at(position, Some(bp)).await);
                    }
                    let exited = state.exited_state();
                    Ok(state.finish_run(exited).await)
                }
            }
        }
        "next" | "step" | "stepOut" => {
            let token = state.begin_run().await;
            tokio::select! {
                _ = token.cancelled() => {
                    let position = state.position.lock().await.clone();
                    Ok(state.stop_at(position, None).await)
                }
                _ = tokio::time::sleep(state.config.step_duration) => {
                    let mut position = state.position.lock().await.clone();
                    position.line += 1;
                    Ok(state.stop_at(position, None).await)
                }
            }
        }
        "call" => {
            let position = state.position.lock().await.clone();
            let result = stopped_state(
                &position,
                None,
                Some(state.config.call_return_values.clone()),
            );
            Ok(result)
        }
        other => Err(format!("unknown command {other}")),
    }
}
