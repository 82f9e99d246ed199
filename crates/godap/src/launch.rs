//! `launch` / `attach` configuration and the backend command line derived
//! from it.

use std::{
    collections::BTreeMap,
    net::TcpListener,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use godap_delve::types::LoadConfig;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::paths::SubstitutePath;

pub const DEFAULT_HOST: &str = "127.0.0.1";
/// The only Delve JSON-RPC API version the adapter speaks.
pub const CLIENT_API_VERSION: i64 = 2;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("The program attribute is missing in the debug configuration in launch.json")]
    MissingProgram,
    #[error("the processId attribute is missing in the debug configuration in launch.json")]
    MissingProcessId,
    #[error("the port attribute is missing in the debug configuration in launch.json")]
    MissingPort,
    #[error("The program attribute must be an executable in exec mode")]
    ProgramIsDirectory,
    #[error("The program attribute must be a directory or .go file in debug mode")]
    NotGoSource,
    #[error("The program attribute must point to valid directory, .go file or executable.")]
    ProgramNotFound,
    #[error("failed to process 'envFile' and 'env' settings: {0}")]
    EnvFile(String),
    #[error("Cannot find Delve debugger. Install from https://github.com/go-delve/delve & ensure it is in your Go tools path, \"GOPATH/bin\" or \"PATH\".")]
    DelveNotFound,
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no free port on {0}")]
    NoFreePort(String),
    #[error("timed out waiting for the debugger to start")]
    StartupTimeout,
    /// The backend process went away before it accepted a connection.
    #[error("the debugger exited before it was ready")]
    BackendExited,
    #[error("invalid address {0}")]
    InvalidAddress(String),
    #[error("{0}")]
    Connect(#[source] godap_delve::DelveError),
    #[error("Failed to get remote server version: \"{0}\"")]
    Version(#[source] godap_delve::DelveError),
    #[error("The remote server is running on delve v{remote} API and the client is running v2 API. Change the version used on the client by using the property \"apiVersion\" in your launch.json file.")]
    ApiVersionMismatch { remote: i64 },
}

impl LaunchError {
    /// Error code and message of the failed `launch`/`attach` response.
    pub fn to_dap_error(&self) -> (i64, String) {
        match self {
            Self::MissingProgram | Self::MissingProcessId | Self::MissingPort => {
                (3000, format!("Failed to continue: {self}"))
            }
            Self::BackendExited => (
                3000,
                "Failed to continue: Check the debug console for details.".to_string(),
            ),
            Self::Version(_) => (2001, self.to_string()),
            Self::ApiVersionMismatch { .. } => (3000, self.to_string()),
            _ => (3000, format!("Failed to continue: \"{self}\"")),
        }
    }
}

/// `envFile` accepts one path or several.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvFiles {
    One(String),
    Many(Vec<String>),
}

impl EnvFiles {
    fn paths(&self) -> Vec<&str> {
        match self {
            Self::One(path) => vec![path.as_str()],
            Self::Many(paths) => paths.iter().map(String::as_str).collect(),
        }
    }
}

/// Arguments of a `launch` or `attach` request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DebugConfiguration {
    pub program: Option<String>,
    pub mode: Option<String>,
    pub process_id: Option<i64>,
    pub stop_on_entry: bool,
    pub dlv_flags: Vec<String>,
    pub args: Vec<String>,
    pub show_log: bool,
    pub log_output: Option<String>,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub env_file: Option<EnvFiles>,
    pub remote_path: Option<String>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub build_flags: Option<String>,
    pub backend: Option<String>,
    pub output: Option<String>,
    pub substitute_path: Vec<SubstitutePath>,
    pub dlv_load_config: Option<LoadConfig>,
    pub dlv_tool_path: Option<String>,
    pub stack_trace_depth: Option<i64>,
    pub show_global_variables: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Launch,
    Attach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Debug,
    Test,
    Exec,
}

impl LaunchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Test => "test",
            Self::Exec => "exec",
        }
    }
}

/// How the session reaches its backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMode {
    Launch {
        mode: LaunchMode,
        program: PathBuf,
        program_is_dir: bool,
    },
    AttachLocal {
        pid: i64,
    },
    AttachRemote,
}

impl SessionMode {
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::AttachRemote)
    }
}

/// Everything needed to start (or reach) the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendPlan {
    pub mode: SessionMode,
    pub host: String,
    pub port: u16,
    /// Local root used for path mapping and for expanding relative paths in
    /// backend output.
    pub local_path: String,
    /// `dlv` invocation; empty for remote sessions.
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Variables layered over the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Binary the backend builds; removed when the backend has to be killed.
    pub built_binary: Option<PathBuf>,
}

impl BackendPlan {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl DebugConfiguration {
    pub fn host(&self) -> String {
        self.host
            .clone()
            .filter(|host| !host.is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_string())
    }

    pub fn load_config(&self) -> LoadConfig {
        self.dlv_load_config.unwrap_or_default()
    }

    /// Checks the required attributes of the request before anything is
    /// touched on disk.
    pub fn check_required(&self, request: RequestKind) -> Result<(), LaunchError> {
        match request {
            RequestKind::Launch => {
                if self.program.as_deref().unwrap_or_default().is_empty() {
                    return Err(LaunchError::MissingProgram);
                }
            }
            RequestKind::Attach => match self.mode.as_deref() {
                Some("remote") if self.port.is_none() => return Err(LaunchError::MissingPort),
                Some("remote") => {}
                _ if self.process_id.unwrap_or_default() == 0 => {
                    return Err(LaunchError::MissingProcessId)
                }
                _ => {}
            },
        }
        Ok(())
    }

    /// Resolves the request into a [`BackendPlan`]. `dlv` is the Delve
    /// binary to use when the configuration does not name one.
    pub fn plan(&self, request: RequestKind, dlv: Option<PathBuf>) -> Result<BackendPlan, LaunchError> {
        self.check_required(request)?;
        let host = self.host();

        if self.mode.as_deref() == Some("remote") {
            let Some(port) = self.port else {
                return Err(LaunchError::MissingPort);
            };
            let local_path = match request {
                RequestKind::Launch => self.program.clone().unwrap_or_default(),
                RequestKind::Attach => self.cwd.clone().unwrap_or_default(),
            };
            return Ok(BackendPlan {
                mode: SessionMode::AttachRemote,
                host,
                port,
                cwd: PathBuf::from(&local_path),
                local_path,
                program: PathBuf::new(),
                args: Vec::new(),
                env: BTreeMap::new(),
                built_binary: None,
            });
        }

        let port = match self.port {
            Some(port) => port,
            None => free_port(&host)?,
        };
        let dlv = self.resolve_dlv(dlv)?;

        match request {
            RequestKind::Launch => self.plan_launch(host, port, dlv),
            RequestKind::Attach => self.plan_attach_local(host, port, dlv),
        }
    }

    fn resolve_dlv(&self, fallback: Option<PathBuf>) -> Result<PathBuf, LaunchError> {
        let dlv = self
            .dlv_tool_path
            .as_deref()
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
            .or(fallback)
            .ok_or(LaunchError::DelveNotFound)?;
        if dlv.exists() {
            Ok(dlv)
        } else {
            Err(LaunchError::DelveNotFound)
        }
    }

    fn plan_launch(&self, host: String, port: u16, dlv: PathBuf) -> Result<BackendPlan, LaunchError> {
        let program = PathBuf::from(self.program.as_deref().unwrap_or_default());
        let mode = match self.mode.as_deref() {
            Some("test") => LaunchMode::Test,
            Some("exec") => LaunchMode::Exec,
            Some("debug") => LaunchMode::Debug,
            _ if program.to_string_lossy().ends_with("_test.go") => LaunchMode::Test,
            _ => LaunchMode::Debug,
        };

        let metadata = std::fs::metadata(&program).map_err(|err| {
            tracing::error!(target: "godap.launch", program = %program.display(), error = %err, "program does not exist");
            LaunchError::ProgramNotFound
        })?;
        let program_is_dir = metadata.is_dir();
        if program_is_dir && mode == LaunchMode::Exec {
            return Err(LaunchError::ProgramIsDirectory);
        }
        if !program_is_dir
            && mode != LaunchMode::Exec
            && program.extension().and_then(|ext| ext.to_str()) != Some("go")
        {
            return Err(LaunchError::NotGoSource);
        }

        let cwd = if program_is_dir {
            program.clone()
        } else {
            program.parent().map(Path::to_path_buf).unwrap_or_default()
        };
        let env = self.merged_env()?;

        let mut args = vec![mode.as_str().to_string()];
        if mode == LaunchMode::Exec || (mode == LaunchMode::Debug && !program_is_dir) {
            args.push(program.to_string_lossy().into_owned());
        }
        args.extend(self.dlv_flags.iter().cloned());
        args.push("--headless=true".to_string());
        args.push(format!("--listen={host}:{port}"));
        args.push(format!("--api-version={CLIENT_API_VERSION}"));
        if self.show_log {
            args.push("--log=true".to_string());
            // Delve rejects --log-output without --log.
            if let Some(output) = &self.log_output {
                args.push(format!("--log-output={output}"));
            }
        }
        if let Some(wd) = &self.cwd {
            args.push(format!("--wd={wd}"));
        }
        if let Some(flags) = &self.build_flags {
            args.push(format!("--build-flags={flags}"));
        }
        if let Some(backend) = &self.backend {
            args.push(format!("--backend={backend}"));
        }
        let mut built_binary = None;
        if mode != LaunchMode::Exec {
            if let Some(output) = &self.output {
                args.push(format!("--output={output}"));
            }
            let output = self.output.as_deref().unwrap_or("__debug_bin");
            built_binary = Some(cwd.join(output));
        }
        if !self.args.is_empty() {
            args.push("--".to_string());
            args.extend(self.args.iter().cloned());
        }

        Ok(BackendPlan {
            mode: SessionMode::Launch {
                mode,
                program: program.clone(),
                program_is_dir,
            },
            host,
            port,
            local_path: program.to_string_lossy().into_owned(),
            program: dlv,
            args,
            cwd,
            env,
            built_binary,
        })
    }

    fn plan_attach_local(&self, host: String, port: u16, dlv: PathBuf) -> Result<BackendPlan, LaunchError> {
        let pid = self.process_id.ok_or(LaunchError::MissingProcessId)?;

        let mut args = vec!["attach".to_string(), pid.to_string()];
        args.extend(self.dlv_flags.iter().cloned());
        args.push("--headless=true".to_string());
        args.push(format!("--listen={host}:{port}"));
        args.push(format!("--api-version={CLIENT_API_VERSION}"));
        if self.show_log {
            args.push("--log=true".to_string());
        }
        if let Some(output) = &self.log_output {
            args.push(format!("--log-output={output}"));
        }
        if let Some(wd) = &self.cwd {
            args.push(format!("--wd={wd}"));
        }
        if let Some(backend) = &self.backend {
            args.push(format!("--backend={backend}"));
        }

        let local_path = self.cwd.clone().unwrap_or_default();
        let cwd = if local_path.is_empty() {
            std::env::current_dir().unwrap_or_default()
        } else {
            PathBuf::from(&local_path)
        };
        Ok(BackendPlan {
            mode: SessionMode::AttachLocal { pid },
            host,
            port,
            local_path,
            program: dlv,
            args,
            cwd,
            env: BTreeMap::new(),
            built_binary: None,
        })
    }

    /// `envFile` entries overlaid with `env`.
    pub fn merged_env(&self) -> Result<BTreeMap<String, String>, LaunchError> {
        let mut env = BTreeMap::new();
        if let Some(files) = &self.env_file {
            for path in files.paths() {
                let text = std::fs::read_to_string(path)
                    .map_err(|err| LaunchError::EnvFile(format!("{path}: {err}")))?;
                env.extend(parse_env_file(&text));
            }
        }
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(env)
    }
}

/// Parses `KEY=VALUE` lines. Blank lines and `#` comments are skipped;
/// values may be single- or double-quoted, and double-quoted values
/// understand `\n`.
pub fn parse_env_file(text: &str) -> Vec<(String, String)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^\s*(?:export\s+)?([\w.\-]+)\s*=\s*(.*?)\s*$").expect("valid regex")
    });

    text.lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| {
            let caps = re.captures(line)?;
            let key = caps.get(1)?.as_str().to_string();
            let raw = caps.get(2).map_or("", |m| m.as_str());
            let value = if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
                raw[1..raw.len() - 1].replace("\\n", "\n")
            } else if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
                raw[1..raw.len() - 1].to_string()
            } else {
                raw.to_string()
            };
            Some((key, value))
        })
        .collect()
}

/// A port on `host` that nothing is listening on right now.
pub fn free_port(host: &str) -> Result<u16, LaunchError> {
    TcpListener::bind((host, 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .map_err(|_| LaunchError::NoFreePort(host.to_string()))
}
