//! Bridge-mode debug session.
//!
//! A [`Session`] runs as a single task that owns the Delve connection, the
//! backend process, the path mapper and both handle tables. Requests arrive
//! over a channel and are answered in order. Resume commands block in Delve
//! until the target stops, so they run in a [`JoinSet`] and their completions
//! are fed back through [`SessionFsm`] while other requests keep being served.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    process::ExitStatus,
    sync::OnceLock,
    time::Duration,
};

use godap_config::AdapterConfig;
use godap_delve::{
    types::{
        Breakpoint, DebuggerState, EvalScope, GoroutineId, LoadConfig, Variable, UNRECOVERED_PANIC_ID,
    },
    DelveClient, DelveError,
};
use godap_process::{terminate_process_tree, ExitKind};
use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{process::Child, sync::mpsc, task::JoinSet};

use crate::{
    backend::{self, BackendEvent},
    dap::{messages::Request, transport::Outgoing},
    handles::HandleTable,
    launch::{
        BackendPlan, DebugConfiguration, LaunchError, RequestKind, SessionMode, CLIENT_API_VERSION,
    },
    paths::{
        base_name, derive_rules, expand_file_path_in_output, same_path_ignoring_separators,
        PathMapper,
    },
    state::{Effect, Input, ResumeClass, SessionFsm, SessionState},
    vars::{
        annotate_shadowed, child_variables, reload_requests, render, wrap_return_values, Rendered,
        VarNode,
    },
};

const GENERIC_ERROR: i64 = 1000;
const UNRECOGNIZED_REQUEST: i64 = 1014;

/// Thread reported while the target runs, or when it has no goroutines.
const DUMMY_THREAD_ID: i64 = 1;

/// Package variable Go emits to track initialization.
const INITDONE: &str = "initdone·";

const NEXT_CANCELLED_WARNING: &str =
    "Setting breakpoints during 'next', 'step in' or 'step out' halted delve and cancelled the next request";

/// Delve's text for a SIGSEGV it could not forward to the target (macOS).
const BAD_ACCESS: &str = "bad access";
const BAD_ACCESS_MESSAGE: &str = "runtime error: invalid memory address or nil pointer dereference [signal SIGSEGV: segmentation violation]\nUnable to propagate EXC_BAD_ACCESS signal to target process and panic (see https://github.com/go-delve/delve/issues/852)";

/// How long a remote disconnect waits for the resume it sends before closing.
const REMOTE_RESUME_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SessionError {
    /// A failure reported to the editor with a specific error id.
    #[error("{message}")]
    Request { code: i64, message: String },

    #[error("debug session is not connected to Delve")]
    NotConnected,

    #[error("debug session was already started")]
    AlreadyStarted,

    #[error("invalid arguments for {command}: {source}")]
    InvalidArguments {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown variables reference {0}")]
    UnknownReference(i64),

    #[error("unrecognized request \"{0}\"")]
    UnrecognizedRequest(String),
}

impl SessionError {
    fn request(code: i64, message: impl Into<String>) -> Self {
        Self::Request {
            code,
            message: message.into(),
        }
    }

    /// `<prefix>: "<error>"`, the form most backend failures are reported in.
    fn quoted(code: i64, prefix: &str, err: impl std::fmt::Display) -> Self {
        Self::request(code, format!("{prefix}: \"{err}\""))
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::Request { code, .. } => *code,
            Self::UnrecognizedRequest(_) => UNRECOGNIZED_REQUEST,
            _ => GENERIC_ERROR,
        }
    }
}

impl From<LaunchError> for SessionError {
    fn from(err: LaunchError) -> Self {
        let (code, message) = err.to_dap_error();
        Self::Request { code, message }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// Outcome of a resume command that ran in the background.
struct ResumeDone {
    class: ResumeClass,
    epoch: u64,
    command: &'static str,
    result: Result<DebuggerState, DelveError>,
}

pub struct Session {
    out: Outgoing,
    config: AdapterConfig,
    fsm: SessionFsm,
    plan: Option<BackendPlan>,
    client: Option<DelveClient>,
    backend: Option<Child>,
    events_tx: mpsc::UnboundedSender<BackendEvent>,
    events_rx: mpsc::UnboundedReceiver<BackendEvent>,
    paths: PathMapper,
    vars: HandleTable<VarNode>,
    frames: HandleTable<(GoroutineId, i64)>,
    /// Installed breakpoints keyed by the editor's path.
    breakpoints: HashMap<String, Vec<Breakpoint>>,
    /// Package of each local source directory, for the `Global` scope.
    packages: HashMap<PathBuf, String>,
    resumes: JoinSet<ResumeDone>,
    last_state: Option<DebuggerState>,
    load_config: LoadConfig,
    stack_depth: i64,
    show_globals: bool,
    stop_on_entry: bool,
}

impl Session {
    pub fn new(out: Outgoing, config: AdapterConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stack_depth = config.stack_trace_depth;
        Self {
            out,
            config,
            fsm: SessionFsm::new(),
            plan: None,
            client: None,
            backend: None,
            events_tx,
            events_rx,
            paths: PathMapper::passthrough(),
            vars: HandleTable::new(),
            frames: HandleTable::new(),
            breakpoints: HashMap::new(),
            packages: HashMap::new(),
            resumes: JoinSet::new(),
            last_state: None,
            load_config: LoadConfig::default(),
            stack_depth,
            show_globals: false,
            stop_on_entry: false,
        }
    }

    /// Serves `requests` until `disconnect` or until the stream closes.
    pub async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        loop {
            tokio::select! {
                request = requests.recv() => {
                    let Some(request) = request else {
                        tracing::debug!(target: "godap.session", "request stream closed");
                        let timeout = self.config.disconnect_timeout();
                        if tokio::time::timeout(timeout, self.shutdown_backend()).await.is_err() {
                            self.force_cleanup().await;
                        }
                        return;
                    };
                    if self.handle_request(request).await == Flow::Exit {
                        return;
                    }
                }
                Some(joined) = self.resumes.join_next(), if !self.resumes.is_empty() => {
                    match joined {
                        Ok(done) => self.on_resume_done(done).await,
                        Err(err) => tracing::warn!(target: "godap.session", error = %err, "resume task failed"),
                    }
                }
                Some(event) = self.events_rx.recv() => self.on_backend_output(event),
                status = wait_backend(&mut self.backend) => self.on_backend_exit(status).await,
                _ = connection_closed(self.client.as_ref()) => self.on_connection_lost().await,
            }
        }
    }

    async fn handle_request(&mut self, request: Request) -> Flow {
        tracing::debug!(
            target: "godap.session",
            command = %request.command,
            seq = request.seq,
            "request"
        );

        let result = match request.command.as_str() {
            "initialize" => self.initialize(&request),
            "launch" => self.launch(&request, RequestKind::Launch).await,
            "attach" => self.launch(&request, RequestKind::Attach).await,
            "configurationDone" => self.configuration_done(&request).await,
            "setBreakpoints" => self.set_breakpoints(&request).await,
            "setExceptionBreakpoints" => {
                self.out.send_response(&request, None);
                Ok(())
            }
            "threads" => self.threads(&request).await,
            "stackTrace" => self.stack_trace(&request).await,
            "scopes" => self.scopes(&request).await,
            "variables" => self.variables(&request).await,
            "continue" => self.continue_(&request).await,
            "next" => self.step(&request, "next").await,
            "stepIn" => self.step(&request, "step").await,
            "stepOut" => self.step(&request, "stepOut").await,
            "pause" => self.pause(&request).await,
            "evaluate" => self.evaluate(&request).await,
            "setVariable" => self.set_variable(&request).await,
            "disconnect" => {
                self.disconnect(&request).await;
                return Flow::Exit;
            }
            other => Err(SessionError::UnrecognizedRequest(other.to_string())),
        };

        if let Err(err) = result {
            tracing::warn!(
                target: "godap.session",
                command = %request.command,
                error = %err,
                "request failed"
            );
            self.out.send_error(&request, err.code(), err.to_string());
        }
        Flow::Continue
    }

    fn client(&self) -> Result<DelveClient, SessionError> {
        self.client.clone().ok_or(SessionError::NotConnected)
    }

    fn initialize(&mut self, request: &Request) -> Result<(), SessionError> {
        self.out.send_response(
            request,
            Some(json!({
                "supportsConditionalBreakpoints": true,
                "supportsConfigurationDoneRequest": true,
                "supportsSetVariable": true,
                "supportsEvaluateForHovers": true,
            })),
        );
        Ok(())
    }

    async fn launch(&mut self, request: &Request, kind: RequestKind) -> Result<(), SessionError> {
        if self.fsm.state() != SessionState::NotStarted {
            return Err(SessionError::AlreadyStarted);
        }
        let args: DebugConfiguration = parse_args(request)?;
        match kind {
            RequestKind::Launch => self.fsm.begin_launch(),
            RequestKind::Attach => self.fsm.begin_attach(),
        }

        let plan = args.plan(kind, backend::default_dlv(&self.config))?;
        self.load_config = args.load_config();
        self.stack_depth = args.stack_trace_depth.unwrap_or(self.config.stack_trace_depth);
        self.show_globals = args.show_global_variables;
        self.stop_on_entry = args.stop_on_entry;

        let roots = backend::go_roots(&plan.cwd, &plan.env).await;
        let (rules, remote_separator) = derive_rules(
            &plan.local_path,
            args.remote_path.as_deref().unwrap_or_default(),
            &args.substitute_path,
        );
        self.paths = PathMapper::new(rules, remote_separator, plan.cwd.clone(), roots)
            .with_inference(plan.mode.is_remote());

        if let Err(err) = self.start_backend(&plan).await {
            tracing::error!(target: "godap.session", error = %err, "failed to start debug session");
            self.flush_backend_output(&plan.cwd);
            self.plan = Some(plan);
            self.force_cleanup().await;
            return Err(err.into());
        }

        tracing::info!(
            target: "godap.session",
            mode = ?plan.mode,
            address = %plan.address(),
            "debug session started"
        );
        self.plan = Some(plan);
        self.fsm.apply(Input::Launched);
        self.out.send_event("initialized", None);
        self.out.send_response(request, None);
        Ok(())
    }

    async fn start_backend(&mut self, plan: &BackendPlan) -> Result<(), LaunchError> {
        if !plan.mode.is_remote() {
            let spawned = backend::spawn_backend(plan, self.events_tx.clone())?;
            self.backend = Some(spawned.child);
            backend::wait_until_ready(spawned.ready, self.config.startup_timeout()).await?;
        }

        let client = backend::connect(plan, &self.config).await?;
        let version = match client.get_version().await {
            Ok(version) => version,
            Err(err) => {
                client.shutdown();
                return Err(LaunchError::Version(err));
            }
        };
        if version.api_version != CLIENT_API_VERSION {
            client.shutdown();
            return Err(LaunchError::ApiVersionMismatch {
                remote: version.api_version,
            });
        }
        tracing::debug!(
            target: "godap.session",
            delve = %version.delve_version,
            api = version.api_version,
            "connected to delve"
        );
        self.client = Some(client);
        Ok(())
    }

    async fn configuration_done(&mut self, request: &Request) -> Result<(), SessionError> {
        self.client()?;
        if self.stop_on_entry {
            let effects = self.fsm.apply(Input::Halted("entry".to_string()));
            self.apply_effects(effects).await;
        } else if !self.debuggee_running().await {
            self.dispatch_resume(ResumeClass::Continue, "continue").await;
        }
        self.out.send_response(request, None);
        Ok(())
    }

    async fn set_breakpoints(&mut self, request: &Request) -> Result<(), SessionError> {
        #[derive(Debug, Default, Deserialize)]
        struct Source {
            #[serde(default)]
            path: Option<String>,
        }

        #[derive(Debug, Deserialize)]
        struct SourceBreakpoint {
            line: i64,
            #[serde(default)]
            condition: Option<String>,
        }

        #[derive(Debug, Deserialize)]
        struct Args {
            #[serde(default)]
            source: Source,
            #[serde(default)]
            breakpoints: Vec<SourceBreakpoint>,
            #[serde(default)]
            lines: Vec<i64>,
        }

        let args: Args = parse_args(request)?;
        let client = self.client()?;
        let file = args.source.path.unwrap_or_default();
        let requested: Vec<(i64, String)> = args
            .breakpoints
            .into_iter()
            .map(|bp| (bp.line, bp.condition.unwrap_or_default()))
            .collect();

        if !self.debuggee_running().await {
            let breakpoints = self
                .replace_breakpoints(&client, &file, &requested, &args.lines)
                .await?;
            self.out
                .send_response(request, Some(json!({ "breakpoints": breakpoints })));
            return Ok(());
        }

        let interrupted = self.fsm.prepare_breakpoint_halt();
        tracing::debug!(target: "godap.session", ?interrupted, "halting before setting breakpoints");
        if let Err(err) = client.halt().await {
            self.fsm.clear_pending();
            return Err(SessionError::quoted(
                2008,
                "Failed to halt delve before attempting to set breakpoint",
                err,
            ));
        }
        self.drain_resumes().await;

        match self
            .replace_breakpoints(&client, &file, &requested, &args.lines)
            .await
        {
            Ok(breakpoints) => self
                .out
                .send_response(request, Some(json!({ "breakpoints": breakpoints }))),
            Err(err) => self.out.send_error(request, err.code(), err.to_string()),
        }

        match interrupted {
            Some(ResumeClass::Step) => self.out.send_output("stderr", NEXT_CANCELLED_WARNING),
            _ => self.dispatch_resume(ResumeClass::Continue, "continue").await,
        }
        Ok(())
    }

    /// Clears every breakpoint previously set in `file` and creates the
    /// requested ones. Returns the DAP breakpoint list, one entry per request.
    async fn replace_breakpoints(
        &mut self,
        client: &DelveClient,
        file: &str,
        requested: &[(i64, String)],
        lines: &[i64],
    ) -> Result<Vec<Value>, SessionError> {
        if self.plan.as_ref().is_some_and(|plan| plan.mode.is_remote()) {
            self.ensure_remote_sources().await;
        }
        let remote_file = self.paths.to_backend_path(file);

        let existing = self.breakpoints.get(file).cloned().unwrap_or_default();
        for bp in &existing {
            tracing::debug!(target: "godap.session", id = bp.id, "clearing breakpoint");
            client
                .clear_breakpoint(bp.id)
                .await
                .map_err(|err| SessionError::quoted(2002, "Failed to set breakpoint", err))?;
        }

        let mut listed: Option<Vec<Breakpoint>> = None;
        let mut installed = Vec::new();
        let mut body = Vec::with_capacity(requested.len());
        for (index, (line, condition)) in requested.iter().enumerate() {
            let breakpoint = Breakpoint {
                file: remote_file.clone(),
                line: *line,
                cond: condition.clone(),
                load_args: Some(self.load_config),
                load_locals: Some(self.load_config),
                ..Breakpoint::default()
            };
            let created = match client.create_breakpoint(breakpoint).await {
                Ok(bp) => Some(bp),
                Err(err) if err.to_string().starts_with("Breakpoint exists at") => {
                    if listed.is_none() {
                        match client.list_breakpoints().await {
                            Ok(all) => listed = Some(all),
                            Err(err) => {
                                tracing::debug!(target: "godap.session", error = %err, "failed to list breakpoints");
                            }
                        }
                    }
                    listed.as_ref().and_then(|all| {
                        all.iter()
                            .find(|bp| {
                                bp.line == *line && same_path_ignoring_separators(&bp.file, &remote_file)
                            })
                            .cloned()
                    })
                }
                Err(err) => {
                    tracing::debug!(
                        target: "godap.session",
                        file = %remote_file,
                        line,
                        error = %err,
                        "failed to create breakpoint"
                    );
                    None
                }
            };

            match created {
                Some(bp) => {
                    body.push(json!({ "verified": true, "line": bp.line }));
                    if !installed.iter().any(|known: &Breakpoint| known.id == bp.id) {
                        installed.push(bp);
                    }
                }
                None => {
                    let line = lines.get(index).copied().unwrap_or(*line);
                    body.push(json!({ "verified": false, "line": line }));
                }
            }
        }

        self.breakpoints.insert(file.to_string(), installed);
        Ok(body)
    }

    async fn threads(&mut self, request: &Request) -> Result<(), SessionError> {
        let client = self.client()?;
        if self.debuggee_running().await {
            self.out.send_response(
                request,
                Some(json!({ "threads": [{ "id": DUMMY_THREAD_ID, "name": "Dummy" }] })),
            );
            return Ok(());
        }
        if self.has_exited() {
            self.out.send_response(request, Some(json!({ "threads": [] })));
            return Ok(());
        }

        let goroutines = match client.list_goroutines(0).await {
            Ok(goroutines) => goroutines,
            Err(_) if self.has_exited() => Vec::new(),
            Err(err) => return Err(SessionError::quoted(2003, "Unable to display threads", err)),
        };
        let mut threads: Vec<Value> = goroutines
            .iter()
            .map(|g| {
                let loc = &g.user_current_loc;
                let name = match loc.function_name() {
                    Some(name) => name.to_string(),
                    None => format!("{}@{}", loc.file, loc.line),
                };
                json!({ "id": g.id, "name": name })
            })
            .collect();
        if threads.is_empty() && !self.has_exited() {
            threads.push(json!({ "id": DUMMY_THREAD_ID, "name": "Dummy" }));
        }
        self.out.send_response(request, Some(json!({ "threads": threads })));
        Ok(())
    }

    async fn stack_trace(&mut self, request: &Request) -> Result<(), SessionError> {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            thread_id: GoroutineId,
            #[serde(default)]
            start_frame: Option<i64>,
            #[serde(default)]
            levels: Option<i64>,
        }

        let args: Args = parse_args(request)?;
        let client = self.client()?;
        if self.debuggee_running().await {
            return Err(SessionError::request(
                2004,
                "Unable to produce stack trace as the debugger is running",
            ));
        }

        let locations = client
            .stacktrace(args.thread_id, self.stack_depth, self.load_config)
            .await
            .map_err(|err| SessionError::quoted(2004, "Unable to produce stack trace", err))?;
        if self.plan.as_ref().is_some_and(|plan| plan.mode.is_remote()) {
            self.ensure_remote_sources().await;
        }

        let total = locations.len();
        let mut frames = Vec::with_capacity(total);
        for (index, frame) in locations.iter().enumerate() {
            let id = self.frames.create((args.thread_id, index as i64));
            let loc = &frame.location;
            let name = loc.function_name().unwrap_or("<unknown>");
            let mut value = json!({
                "id": id,
                "name": name,
                "line": loc.line,
                "column": 0,
            });
            if loc.file != "<autogenerated>" {
                let path = self.paths.to_local_path(&loc.file);
                value["source"] = json!({ "name": base_name(&loc.file), "path": path });
            }
            frames.push(value);
        }

        let start = usize::try_from(args.start_frame.unwrap_or(0).max(0)).unwrap_or(0);
        let mut frames: Vec<Value> = frames.into_iter().skip(start).collect();
        if let Some(levels) = args.levels.filter(|levels| *levels > 0) {
            frames.truncate(usize::try_from(levels).unwrap_or(usize::MAX));
        }

        self.out.send_response(
            request,
            Some(json!({ "stackFrames": frames, "totalFrames": total })),
        );
        Ok(())
    }

    async fn scopes(&mut self, request: &Request) -> Result<(), SessionError> {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            frame_id: i64,
        }

        let args: Args = parse_args(request)?;
        let client = self.client()?;
        let Some(&(goroutine_id, frame)) = self.frames.get(args.frame_id) else {
            return Err(SessionError::quoted(
                2005,
                "Unable to list locals",
                format!("unknown frame {}", args.frame_id),
            ));
        };
        let scope = EvalScope {
            goroutine_id,
            frame,
        };

        let locals = client
            .list_local_vars(scope, self.load_config)
            .await
            .map_err(|err| SessionError::quoted(2005, "Unable to list locals", err))?;
        let mut vars = client
            .list_function_args(scope, self.load_config)
            .await
            .map_err(|err| SessionError::quoted(2006, "Unable to list args", err))?;
        vars.extend(locals);
        annotate_shadowed(&mut vars);

        let local = self.vars.create(VarNode::container("Local", vars));
        let mut scopes = vec![json!({
            "name": "Local",
            "variablesReference": local,
            "expensive": false,
        })];

        if self.show_globals {
            if let Some(package) = self.current_package().await {
                let filter = format!("^{package}\\.");
                let globals = client
                    .list_package_vars(&filter, self.load_config)
                    .await
                    .map_err(|err| SessionError::quoted(2007, "Unable to list global vars", err))?;
                let globals = package_globals(&package, globals);
                let global = self.vars.create(VarNode::container("Global", globals));
                scopes.push(json!({
                    "name": "Global",
                    "variablesReference": global,
                    "expensive": false,
                }));
            }
        }

        self.out.send_response(request, Some(json!({ "scopes": scopes })));
        Ok(())
    }

    async fn variables(&mut self, request: &Request) -> Result<(), SessionError> {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            variables_reference: i64,
        }

        let args: Args = parse_args(request)?;
        let reference = args.variables_reference;
        let Some(mut node) = self.vars.get(reference).cloned() else {
            return Err(SessionError::UnknownReference(reference));
        };

        let reloads = reload_requests(&node);
        if !reloads.is_empty() {
            let client = self.client()?;
            let scope = EvalScope {
                goroutine_id: -1,
                frame: 0,
            };
            for (index, expr) in reloads {
                match client.eval(scope, &expr, Some(self.load_config)).await {
                    Ok(loaded) => {
                        if let Some(child) = node.variable.children.get_mut(index) {
                            child.children = loaded.children;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target: "godap.session", %expr, error = %err, "failed to evaluate expression");
                    }
                }
            }
            if let Some(slot) = self.vars.get_mut(reference) {
                *slot = node.clone();
            }
        }

        let variables = child_variables(&node, &mut self.vars);
        self.out
            .send_response(request, Some(json!({ "variables": variables })));
        Ok(())
    }

    async fn continue_(&mut self, request: &Request) -> Result<(), SessionError> {
        self.client()?;
        self.dispatch_resume(ResumeClass::Continue, "continue").await;
        self.out
            .send_response(request, Some(json!({ "allThreadsContinued": true })));
        Ok(())
    }

    async fn step(&mut self, request: &Request, command: &'static str) -> Result<(), SessionError> {
        self.client()?;
        self.dispatch_resume(ResumeClass::Step, command).await;
        self.out.send_response(request, None);
        Ok(())
    }

    async fn pause(&mut self, request: &Request) -> Result<(), SessionError> {
        let client = self.client()?;
        self.fsm.apply(Input::HaltRequested);
        let state = client
            .halt()
            .await
            .map_err(|err| SessionError::quoted(2010, "Unable to halt execution", err))?;
        self.last_state = Some(state);
        self.out.send_response(request, None);
        let effects = self.fsm.apply(Input::Halted("pause".to_string()));
        self.apply_effects(effects).await;
        Ok(())
    }

    async fn evaluate(&mut self, request: &Request) -> Result<(), SessionError> {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            expression: String,
            #[serde(default)]
            frame_id: Option<i64>,
        }

        let args: Args = parse_args(request)?;
        let client = self.client()?;
        let (goroutine_id, frame) = args
            .frame_id
            .filter(|id| *id != 0)
            .and_then(|id| self.frames.get(id).copied())
            .unwrap_or((-1, 0));

        let rendered = if let Some(expr) = call_expression(&args.expression) {
            let state = client
                .call_function(goroutine_id, expr, self.load_config)
                .await
                .map_err(|err| SessionError::quoted(2009, "Unable to complete call", err))?;
            let mut values = state
                .current_thread
                .and_then(|thread| thread.return_values)
                .unwrap_or_default();
            match values.len() {
                0 => Rendered {
                    value: String::new(),
                    variables_reference: 0,
                },
                1 => {
                    let value = values.remove(0);
                    render(&value, "", &[], &mut self.vars)
                }
                _ => {
                    let wrapped = wrap_return_values(values);
                    render(&wrapped, "", &[], &mut self.vars)
                }
            }
        } else {
            let scope = EvalScope {
                goroutine_id,
                frame,
            };
            let variable = client
                .eval(scope, &args.expression, Some(self.load_config))
                .await
                .map_err(|err| SessionError::quoted(2009, "Unable to eval expression", err))?;
            render(&variable, &variable.name, &[], &mut self.vars)
        };

        self.out.send_response(
            request,
            Some(json!({
                "result": rendered.value,
                "variablesReference": rendered.variables_reference,
            })),
        );
        Ok(())
    }

    async fn set_variable(&mut self, request: &Request) -> Result<(), SessionError> {
        #[derive(Debug, Deserialize)]
        struct Args {
            name: String,
            value: String,
        }

        let args: Args = parse_args(request)?;
        let client = self.client()?;
        let scope = EvalScope {
            goroutine_id: self.current_goroutine_id().unwrap_or(-1),
            frame: 0,
        };
        client
            .set_variable(scope, &args.name, &args.value)
            .await
            .map_err(|err| SessionError::request(2010, format!("Failed to set variable: {err}")))?;
        self.out
            .send_response(request, Some(json!({ "value": args.value })));
        Ok(())
    }

    async fn disconnect(&mut self, request: &Request) {
        let timeout = self.config.disconnect_timeout();
        if tokio::time::timeout(timeout, self.shutdown_backend())
            .await
            .is_err()
        {
            tracing::warn!(target: "godap.session", ?timeout, "disconnect timed out");
            self.force_cleanup().await;
        }
        self.out.send_response(request, None);
        let effects = self.fsm.apply(Input::Disconnect);
        self.apply_effects(effects).await;
    }

    /// Leaves a remote target running and closes the connection, or stops a
    /// local backend with `halt` + `Detach`.
    async fn shutdown_backend(&mut self) {
        let Some(client) = self.client.clone() else {
            self.force_cleanup().await;
            return;
        };
        let (remote, kill) = match self.plan.as_ref().map(|plan| &plan.mode) {
            Some(SessionMode::AttachRemote) => (true, false),
            Some(SessionMode::Launch { .. }) => (false, true),
            _ => (false, false),
        };

        if remote {
            if !self.debuggee_running().await {
                tracing::debug!(target: "godap.session", "resuming remote target before closing");
                match tokio::time::timeout(REMOTE_RESUME_WAIT, client.resume("continue")).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        tracing::warn!(target: "godap.session", error = %err, "failed to resume remote target");
                    }
                    Err(_) => {
                        tracing::debug!(target: "godap.session", "remote target still running at close");
                    }
                }
            }
            client.shutdown();
            return;
        }

        let halted = match tokio::time::timeout(self.config.halt_timeout(), client.halt()).await {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                tracing::debug!(target: "godap.session", error = %err, "failed to halt");
                err.to_string().contains("has exited with status")
            }
            Err(_) => {
                tracing::warn!(target: "godap.session", "could not halt delve in time");
                false
            }
        };
        if !halted && kill {
            client.shutdown();
            self.force_cleanup().await;
            return;
        }

        match client.detach(kill).await {
            Ok(()) => self.await_backend_exit().await,
            Err(err) => {
                tracing::error!(target: "godap.session", error = %err, "failed to detach");
                if kill {
                    self.force_cleanup().await;
                }
            }
        }
    }

    async fn await_backend_exit(&mut self) {
        let Some(child) = self.backend.as_mut() else {
            return;
        };
        match tokio::time::timeout(self.config.dispose_grace(), child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(target: "godap.session", exit = %ExitKind::from_status(status), "backend exited");
                self.backend = None;
            }
            Ok(Err(err)) => {
                tracing::warn!(target: "godap.session", error = %err, "failed to wait for backend");
                self.backend = None;
            }
            Err(_) => self.force_cleanup().await,
        }
    }

    /// Kills the backend process tree and removes the binary it built.
    async fn force_cleanup(&mut self) {
        if let Some(mut child) = self.backend.take() {
            tracing::info!(target: "godap.session", pid = ?child.id(), "killing backend");
            match terminate_process_tree(&mut child, self.config.dispose_grace()).await {
                Ok(status) => {
                    tracing::info!(target: "godap.session", exit = %ExitKind::from_status(status), "backend exited");
                }
                Err(err) => {
                    tracing::warn!(target: "godap.session", error = %err, "failed to kill backend");
                }
            }
        }
        let binary = self.plan.as_ref().and_then(|plan| plan.built_binary.clone());
        if let Some(binary) = binary {
            match std::fs::remove_file(&binary) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(target: "godap.session", path = %binary.display(), error = %err, "failed to remove debug binary");
                }
            }
        }
    }

    async fn dispatch_resume(&mut self, class: ResumeClass, command: &'static str) {
        let Some(client) = self.client.clone() else {
            return;
        };
        let effects = self.fsm.apply(Input::Dispatch(class));
        let epoch = self.fsm.epoch(class);
        tracing::debug!(target: "godap.session", command, epoch, "resuming");
        self.resumes.spawn(async move {
            let result = client.resume(command).await;
            ResumeDone {
                class,
                epoch,
                command,
                result,
            }
        });
        self.apply_effects(effects).await;
    }

    /// Feeds in-flight resume completions to the state machine after a halt.
    async fn drain_resumes(&mut self) {
        let timeout = self.config.halt_timeout();
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = self.resumes.join_next().await {
                match joined {
                    Ok(done) => self.on_resume_done(done).await,
                    Err(err) => {
                        tracing::warn!(target: "godap.session", error = %err, "resume task failed");
                    }
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(target: "godap.session", "resume still in flight after halt");
        }
    }

    async fn on_resume_done(&mut self, done: ResumeDone) {
        let ResumeDone {
            class,
            epoch,
            command,
            result,
        } = done;

        let current = self.fsm.state() == SessionState::Running { class, epoch };
        let input = match result {
            Ok(state) => {
                let exited = state.exited;
                let breakpoint_id = state.breakpoint_id();
                tracing::debug!(target: "godap.session", command, epoch, exited, ?breakpoint_id, "resume completed");
                if !current {
                    // Superseded by a halt or a newer resume.
                    return;
                }
                self.last_state = Some(state);
                Input::Completed {
                    class,
                    epoch,
                    exited,
                    breakpoint_id,
                }
            }
            Err(err) => {
                if !current || err.is_connection_error() {
                    tracing::debug!(target: "godap.session", command, epoch, error = %err, "resume failed");
                    return;
                }
                let message = describe_delve_error(&err);
                tracing::error!(target: "godap.session", command, error = %message, "resume failed");
                self.out.send_output(
                    "stderr",
                    format!("Failed to {} - {message}\n", command_label(command)),
                );

                let exited = message.contains("has exited with status");
                if exited {
                    self.last_state = Some(DebuggerState {
                        exited: true,
                        ..DebuggerState::default()
                    });
                }
                let breakpoint_id = (class == ResumeClass::Continue
                    && err.rpc_message() == Some(BAD_ACCESS))
                .then_some(UNRECOVERED_PANIC_ID);
                Input::Completed {
                    class,
                    epoch,
                    exited,
                    breakpoint_id,
                }
            }
        };

        let effects = self.fsm.apply(input);
        self.apply_effects(effects).await;
    }

    async fn apply_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::ResetHandles => {
                    self.vars.reset();
                    self.frames.reset();
                }
                Effect::EmitStopped { reason } => {
                    let thread_id = self.stopped_thread_id().await;
                    tracing::debug!(target: "godap.session", %reason, thread_id, "stopped");
                    self.out.send_event(
                        "stopped",
                        Some(json!({
                            "reason": reason,
                            "threadId": thread_id,
                            "allThreadsStopped": true,
                        })),
                    );
                }
                Effect::EmitContinued => self.out.send_event(
                    "continued",
                    Some(json!({ "threadId": DUMMY_THREAD_ID, "allThreadsContinued": true })),
                ),
                Effect::EmitTerminated => {
                    tracing::debug!(target: "godap.session", "terminated");
                    self.out.send_event("terminated", None);
                }
            }
        }
    }

    /// Goroutine to report a stop on: the current one, else the first one
    /// Delve lists.
    async fn stopped_thread_id(&mut self) -> GoroutineId {
        if let Some(id) = self.current_goroutine_id() {
            return id;
        }
        let Some(client) = self.client.clone() else {
            return DUMMY_THREAD_ID;
        };
        match client.list_goroutines(1).await {
            Ok(goroutines) => match goroutines.into_iter().next() {
                Some(goroutine) => {
                    let id = goroutine.id;
                    if let Some(state) = self.last_state.as_mut() {
                        state.current_goroutine = Some(goroutine);
                    }
                    id
                }
                None => DUMMY_THREAD_ID,
            },
            Err(err) => {
                tracing::warn!(target: "godap.session", error = %err, "failed to get threads");
                DUMMY_THREAD_ID
            }
        }
    }

    fn current_goroutine_id(&self) -> Option<GoroutineId> {
        self.last_state
            .as_ref()
            .and_then(|state| state.current_goroutine.as_ref())
            .map(|goroutine| goroutine.id)
    }

    fn has_exited(&self) -> bool {
        self.last_state.as_ref().is_some_and(|state| state.exited)
    }

    /// Asks Delve whether the target runs, falling back to the local state
    /// when it cannot answer.
    async fn debuggee_running(&mut self) -> bool {
        if self.fsm.is_terminated() || self.has_exited() {
            return false;
        }
        let Some(client) = self.client.clone() else {
            return false;
        };
        match client.state(true).await {
            Ok(state) => {
                let running = state.running;
                if !running || self.last_state.is_none() {
                    self.last_state = Some(state);
                } else if let Some(last) = self.last_state.as_mut() {
                    last.running = true;
                }
                running
            }
            Err(err) => {
                tracing::warn!(target: "godap.session", error = %err, "failed to get state");
                self.fsm.is_running()
            }
        }
    }

    async fn ensure_remote_sources(&mut self) {
        if !self.paths.needs_remote_sources() {
            return;
        }
        let Some(client) = self.client.clone() else {
            return;
        };
        let packages = client.list_packages_build_info(true).await;
        let sources = client.list_sources().await;
        match (packages, sources) {
            (Ok(packages), Ok(sources)) => {
                tracing::debug!(
                    target: "godap.session",
                    packages = packages.len(),
                    sources = sources.len(),
                    "loaded remote sources"
                );
                self.paths.set_remote_sources(packages, sources);
            }
            (Err(err), _) | (_, Err(err)) => {
                tracing::warn!(target: "godap.session", error = %err, "failed to load remote packages and sources");
                self.paths.set_remote_sources(Vec::new(), Vec::new());
            }
        }
    }

    /// Package of the file the current thread is stopped in.
    async fn current_package(&mut self) -> Option<String> {
        let file = self
            .last_state
            .as_ref()?
            .current_thread
            .as_ref()
            .map(|thread| thread.file.clone())
            .filter(|file| !file.is_empty())?;
        if self.plan.as_ref().is_some_and(|plan| plan.mode.is_remote()) {
            self.ensure_remote_sources().await;
        }
        let local = self.paths.to_local_path(&file);
        let dir = Path::new(&local).parent()?.to_path_buf();
        if let Some(package) = self.packages.get(&dir) {
            return Some(package.clone());
        }
        let package = backend::package_for_dir(&dir).await?;
        self.packages.insert(dir, package.clone());
        Some(package)
    }

    fn on_backend_output(&mut self, event: BackendEvent) {
        let cwd = self
            .plan
            .as_ref()
            .map(|plan| plan.cwd.clone())
            .unwrap_or_else(|| PathBuf::from("."));
        self.forward_output(event, &cwd);
    }

    fn forward_output(&self, event: BackendEvent, cwd: &Path) {
        match event {
            BackendEvent::Stdout(text) => self.out.send_output("stdout", text),
            BackendEvent::Stderr(text) => self
                .out
                .send_output("stderr", expand_file_path_in_output(&text, cwd)),
        }
    }

    /// Forwards output that is already queued, so a failed start reports the
    /// backend's diagnostics before the error response.
    fn flush_backend_output(&mut self, cwd: &Path) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.forward_output(event, cwd);
        }
    }

    async fn on_backend_exit(&mut self, status: io::Result<ExitStatus>) {
        self.backend = None;
        match status {
            Ok(status) => {
                tracing::info!(target: "godap.session", exit = %ExitKind::from_status(status), "backend exited");
            }
            Err(err) => {
                tracing::warn!(target: "godap.session", error = %err, "failed to wait for backend");
            }
        }
        let effects = self.fsm.apply(Input::ConnectionClosed);
        self.apply_effects(effects).await;
    }

    async fn on_connection_lost(&mut self) {
        self.client = None;
        if self.fsm.is_terminated() {
            return;
        }
        tracing::warn!(target: "godap.session", "connection to delve lost");
        self.out
            .send_output("console", "Connection to Delve was closed.\n");
        let effects = self.fsm.apply(Input::ConnectionClosed);
        self.apply_effects(effects).await;
    }
}

fn parse_args<T: DeserializeOwned>(request: &Request) -> Result<T, SessionError> {
    let arguments = if request.arguments.is_null() {
        json!({})
    } else {
        request.arguments.clone()
    };
    serde_json::from_value(arguments).map_err(|source| SessionError::InvalidArguments {
        command: request.command.clone(),
        source,
    })
}

async fn wait_backend(backend: &mut Option<Child>) -> io::Result<ExitStatus> {
    match backend {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

async fn connection_closed(client: Option<&DelveClient>) {
    match client {
        Some(client) => {
            let token = client.shutdown_token();
            token.cancelled().await;
        }
        None => std::future::pending().await,
    }
}

/// The expression of a `call <expr>` evaluation, if `expression` is one.
fn call_expression(expression: &str) -> Option<&str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^\s*call\s+\S+").expect("valid regex"));
    if !re.is_match(expression) {
        return None;
    }
    expression
        .trim_start()
        .strip_prefix("call")
        .map(str::trim_start)
}

fn describe_delve_error(err: &DelveError) -> String {
    match err.rpc_message() {
        Some(BAD_ACCESS) => BAD_ACCESS_MESSAGE.to_string(),
        _ => err.to_string(),
    }
}

fn command_label(command: &str) -> &str {
    match command {
        "step" => "step in",
        "stepOut" => "step out",
        other => other,
    }
}

/// Package variables with the `<package>.` prefix removed. The first
/// `initdone·` entry is dropped.
fn package_globals(package: &str, globals: Vec<Variable>) -> Vec<Variable> {
    let prefix = format!("{package}.");
    let mut seen_initdone = false;
    globals
        .into_iter()
        .filter_map(|mut var| {
            if let Some(name) = var.name.strip_prefix(&prefix) {
                var.name = name.to_string();
            }
            if !seen_initdone && var.name == INITDONE {
                seen_initdone = true;
                return None;
            }
            Some(var)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn call_expressions_are_recognized() {
        assert_eq!(call_expression("call f(1)"), Some("f(1)"));
        assert_eq!(call_expression("  call   pkg.Do()"), Some("pkg.Do()"));
        assert_eq!(call_expression("caller"), None);
        assert_eq!(call_expression("call"), None);
        assert_eq!(call_expression("x + 1"), None);
    }

    #[test]
    fn bad_access_is_reported_as_nil_dereference() {
        let err = DelveError::Rpc("bad access".to_string());
        assert!(describe_delve_error(&err).starts_with("runtime error: invalid memory address"));
        let err = DelveError::Rpc("could not find symbol".to_string());
        assert_eq!(describe_delve_error(&err), "could not find symbol");
    }

    #[test]
    fn package_globals_strip_prefix_and_initdone() {
        let var = |name: &str| Variable {
            name: name.to_string(),
            ..Variable::default()
        };
        let globals = package_globals(
            "main",
            vec![var("main.counter"), var("main.initdone·"), var("main.name")],
        );
        let names: Vec<_> = globals.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["counter", "name"]);
    }

    #[test]
    fn error_codes_follow_the_failure() {
        assert_eq!(SessionError::quoted(2003, "Unable to display threads", "boom").code(), 2003);
        assert_eq!(
            SessionError::quoted(2003, "Unable to display threads", "boom").to_string(),
            "Unable to display threads: \"boom\""
        );
        assert_eq!(SessionError::UnrecognizedRequest("restart".into()).code(), 1014);
        assert_eq!(SessionError::NotConnected.code(), 1000);
        let launch: SessionError = LaunchError::MissingProgram.into();
        assert_eq!(launch.code(), 3000);
    }

    #[test]
    fn resume_commands_have_readable_labels() {
        assert_eq!(command_label("continue"), "continue");
        assert_eq!(command_label("step"), "step in");
        assert_eq!(command_label("stepOut"), "step out");
    }
}
