//! Starting and reaching the Delve backend, plus the `go` tool queries the
//! session needs for path mapping and package-level variables.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use godap_config::AdapterConfig;
use godap_delve::{DelveClient, DelveClientConfig};
use godap_process::{configure_process_group, run_command_checked, CommandSpec, RunOptions};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    sync::{mpsc, oneshot},
};

use crate::{
    launch::{BackendPlan, LaunchError},
    paths::GoRoots,
};

/// Delve drops calls made right after the listener comes up.
pub const CONNECT_DELAY: Duration = Duration::from_millis(200);

const GO_TOOL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Stdout(String),
    Stderr(String),
}

pub struct SpawnedBackend {
    pub child: Child,
    /// Resolves on the first stdout output. Dropped without a value if stdout
    /// closes first.
    pub ready: oneshot::Receiver<()>,
}

/// `dlv` from the adapter configuration, else from `PATH`.
pub fn default_dlv(config: &AdapterConfig) -> Option<PathBuf> {
    match &config.dlv_path {
        Some(path) => Some(path.clone()),
        None => which::which("dlv").ok(),
    }
}

/// Spawns the backend described by `plan` in its own process group and
/// forwards its output to `events`. Any stdout output counts as ready.
pub fn spawn_backend(
    plan: &BackendPlan,
    events: mpsc::UnboundedSender<BackendEvent>,
) -> Result<SpawnedBackend, LaunchError> {
    spawn_process(&plan.program, &plan.args, &plan.cwd, &plan.env, events, None).map_err(
        |source| LaunchError::Spawn {
            program: plan.program.display().to_string(),
            source,
        },
    )
}

/// Spawns `program` with piped output. `ready` resolves once stdout contains
/// `marker`, or on the first stdout output when there is no marker.
pub fn spawn_process(
    program: &Path,
    args: &[String],
    cwd: &Path,
    env: &BTreeMap<String, String>,
    events: mpsc::UnboundedSender<BackendEvent>,
    marker: Option<&'static str>,
) -> std::io::Result<SpawnedBackend> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !cwd.as_os_str().is_empty() {
        cmd.current_dir(cwd);
    }
    configure_process_group(&mut cmd);

    tracing::info!(
        target: "godap.backend",
        program = %program.display(),
        ?args,
        cwd = %cwd.display(),
        "starting backend"
    );
    let mut child = cmd.spawn()?;

    let (ready_tx, ready) = oneshot::channel();
    if let Some(stdout) = child.stdout.take() {
        let readiness = Readiness {
            marker,
            seen: String::new(),
            tx: Some(ready_tx),
        };
        tokio::spawn(forward_output(stdout, events.clone(), BackendEvent::Stdout, Some(readiness)));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_output(stderr, events, BackendEvent::Stderr, None));
    }

    Ok(SpawnedBackend { child, ready })
}

struct Readiness {
    marker: Option<&'static str>,
    /// Stdout seen so far, kept only until the marker shows up.
    seen: String,
    tx: Option<oneshot::Sender<()>>,
}

impl Readiness {
    fn observe(&mut self, text: &str) {
        if self.tx.is_none() {
            return;
        }
        let found = match self.marker {
            None => true,
            Some(marker) => {
                self.seen.push_str(text);
                self.seen.contains(marker)
            }
        };
        if found {
            self.seen = String::new();
            if let Some(tx) = self.tx.take() {
                let _ = tx.send(());
            }
        }
    }
}

async fn forward_output<R>(
    mut reader: R,
    events: mpsc::UnboundedSender<BackendEvent>,
    wrap: fn(String) -> BackendEvent,
    mut ready: Option<Readiness>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
        if let Some(ready) = ready.as_mut() {
            ready.observe(&text);
        }
        if events.send(wrap(text)).is_err() {
            return;
        }
    }
}

/// Waits for the spawned backend to print something, which Delve does once
/// it is listening.
pub async fn wait_until_ready(
    ready: oneshot::Receiver<()>,
    timeout: Duration,
) -> Result<(), LaunchError> {
    match tokio::time::timeout(timeout, ready).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(LaunchError::BackendExited),
        Err(_) => Err(LaunchError::StartupTimeout),
    }
}

/// Connects to the backend's JSON-RPC listener.
pub async fn connect(plan: &BackendPlan, config: &AdapterConfig) -> Result<DelveClient, LaunchError> {
    let address = plan.address();
    let addr: SocketAddr = tokio::net::lookup_host(&address)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| LaunchError::InvalidAddress(address.clone()))?;

    tokio::time::sleep(CONNECT_DELAY).await;
    let client_config = DelveClientConfig {
        connect_timeout: config.connect_timeout(),
        reply_timeout: config.rpc_timeout(),
        ..DelveClientConfig::default()
    };
    DelveClient::connect_with_config(addr, client_config)
        .await
        .map_err(LaunchError::Connect)
}

/// Local `GOROOT` and first `GOPATH` entry. Values in `env` (then the
/// process environment) win over `go env`.
pub async fn go_roots(cwd: &Path, env: &BTreeMap<String, String>) -> GoRoots {
    let lookup = |key: &str| {
        env.get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
            .filter(|value| !value.is_empty())
    };
    let mut goroot = lookup("GOROOT");
    let mut gopath = lookup("GOPATH");

    if goroot.is_none() || gopath.is_none() {
        let dir = if cwd.as_os_str().is_empty() { Path::new(".") } else { cwd };
        let spec = CommandSpec::new(dir, "go", &["env", "GOROOT", "GOPATH"]);
        let opts = RunOptions {
            timeout: Some(GO_TOOL_TIMEOUT),
            env: env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            ..RunOptions::default()
        };
        match run_command_checked(&spec, opts).await {
            Ok(result) => {
                let (root, path) = parse_go_env(&result.output.stdout);
                goroot = goroot.or(root);
                gopath = gopath.or(path);
            }
            Err(err) => {
                tracing::debug!(target: "godap.backend", error = %err, "go env failed");
            }
        }
    }

    GoRoots {
        goroot: goroot.map(PathBuf::from),
        gopath: gopath.and_then(|path| std::env::split_paths(&path).next()),
    }
}

/// `go env GOROOT GOPATH` prints one value per line.
fn parse_go_env(stdout: &str) -> (Option<String>, Option<String>) {
    let mut lines = stdout
        .lines()
        .map(str::trim)
        .map(|line| (!line.is_empty()).then(|| line.to_string()));
    let goroot = lines.next().flatten();
    let gopath = lines.next().flatten();
    (goroot, gopath)
}

/// Package of the Go sources in `dir`, as used in package variable names:
/// `main` for commands, the import path otherwise.
pub async fn package_for_dir(dir: &Path) -> Option<String> {
    let spec = CommandSpec::new(dir, "go", &["list", "-f", "{{.Name}} {{.ImportPath}}"]);
    let opts = RunOptions {
        timeout: Some(GO_TOOL_TIMEOUT),
        ..RunOptions::default()
    };
    match run_command_checked(&spec, opts).await {
        Ok(result) => parse_package_line(&result.output.stdout),
        Err(err) => {
            tracing::debug!(target: "godap.backend", dir = %dir.display(), error = %err, "go list failed");
            None
        }
    }
}

fn parse_package_line(stdout: &str) -> Option<String> {
    let lines: Vec<&str> = stdout.lines().filter(|line| !line.trim().is_empty()).collect();
    let [line] = lines.as_slice() else {
        return None;
    };
    let (name, import_path) = line.trim().split_once(' ')?;
    if name == "main" {
        Some("main".to_string())
    } else {
        Some(import_path.to_string())
    }
}
