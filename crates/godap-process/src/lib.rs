//! Process helpers shared by the adapter.
//!
//! Debugger backends fork the program under test, so killing just the
//! immediate child leaves the debuggee (and any pipes it inherited) behind.
//! Everything spawned through this crate is placed in its own process group
//! and torn down as a group.
//!
//! Short-lived tool invocations (`go env`, `go list`) go through
//! [`run_command`], which bounds captured output and wall-clock time.

use std::{
    fmt,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
};

/// Captured stdout/stderr from a command, truncated to a maximum size.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundedOutput {
    pub stdout: String,
    pub stderr: String,
    /// Set when either stream had more bytes than were captured.
    pub truncated: bool,
}

impl BoundedOutput {
    #[cfg(test)]
    fn combined(&self) -> String {
        let mut s = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !s.is_empty() && !s.ends_with('\n') {
                s.push('\n');
            }
            s.push_str(&self.stderr);
        }
        s
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub timeout: Option<Duration>,
    /// Maximum bytes to capture per stream.
    pub max_bytes: usize,
    /// Delay between SIGTERM and SIGKILL when the command has to be stopped.
    pub kill_grace: Duration,
    /// Extra environment variables layered over the inherited environment.
    pub env: Vec<(String, String)>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            max_bytes: 1024 * 1024,
            kill_grace: Duration::from_millis(250),
            env: Vec::new(),
        }
    }
}

/// A full command invocation (cwd + program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub cwd: PathBuf,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(cwd: &Path, program: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
            program: program.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Human-readable only; not meant to be pasted back into a shell.
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub output: BoundedOutput,
    pub timed_out: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunCommandError {
    #[error("failed to run `{command}`: {source}")]
    Io {
        command: CommandSpec,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` {}{}", exit_reason(.result), stderr_suffix(.result))]
    Failed {
        command: CommandSpec,
        result: Box<CommandResult>,
    },
}

fn exit_reason(result: &CommandResult) -> String {
    if result.timed_out {
        "timed out".to_string()
    } else {
        ExitKind::from_status(result.status).to_string()
    }
}

fn stderr_suffix(result: &CommandResult) -> String {
    let stderr = result.output.stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Code(i32),
    Signal(i32),
    Unknown,
}

impl ExitKind {
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signal(signal);
            }
        }
        Self::Unknown
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exited with code {code}"),
            Self::Signal(signal) => write!(f, "was killed by signal {signal}"),
            Self::Unknown => f.write_str("terminated"),
        }
    }
}

/// Makes `cmd` start in a fresh process group led by the child.
pub fn configure_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            // SAFETY: `setpgid` is async-signal-safe and does not allocate.
            // This runs after `fork` in the child process.
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    #[cfg(not(unix))]
    let _ = cmd;
}

/// Runs `command` to completion, capturing at most `opts.max_bytes` of each
/// output stream.
///
/// A timeout stops the whole process group and is recorded in the result.
pub async fn run_command(command: &CommandSpec, opts: RunOptions) -> io::Result<CommandResult> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .current_dir(&command.cwd)
        .envs(opts.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    configure_process_group(&mut cmd);

    tracing::debug!(target: "godap.process", command = %command, "running command");
    let mut child = cmd.spawn()?;

    let Some(stdout) = child.stdout.take() else {
        return Err(io::Error::other("child stdout was not captured"));
    };
    let Some(stderr) = child.stderr.take() else {
        return Err(io::Error::other("child stderr was not captured"));
    };

    let max_bytes = opts.max_bytes;
    let stdout_task = tokio::spawn(read_bounded(stdout, max_bytes));
    let stderr_task = tokio::spawn(read_bounded(stderr, max_bytes));

    let deadline = async {
        match opts.timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };

    let mut timed_out = false;
    let status = tokio::select! {
        status = child.wait() => status?,
        _ = deadline => {
            timed_out = true;
            terminate_process_tree(&mut child, opts.kill_grace).await?
        }
    };

    let (stdout_bytes, stdout_truncated) = join_reader(stdout_task, "stdout").await?;
    let (stderr_bytes, stderr_truncated) = join_reader(stderr_task, "stderr").await?;

    Ok(CommandResult {
        status,
        output: BoundedOutput {
            stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
            truncated: stdout_truncated || stderr_truncated,
        },
        timed_out,
    })
}

/// Like [`run_command`], treating spawn failures, non-zero exits and
/// timeouts as errors.
pub async fn run_command_checked(
    command: &CommandSpec,
    opts: RunOptions,
) -> Result<CommandResult, RunCommandError> {
    let result = run_command(command, opts)
        .await
        .map_err(|source| RunCommandError::Io {
            command: command.clone(),
            source,
        })?;

    if !result.success() {
        return Err(RunCommandError::Failed {
            command: command.clone(),
            result: Box::new(result),
        });
    }
    Ok(result)
}

/// Stops the process group led by `child`: SIGTERM, then SIGKILL once
/// `grace` has elapsed. Returns the child's exit status.
pub async fn terminate_process_tree(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        let Some(pid) = child.id() else {
            // Already reaped.
            return child.wait().await;
        };
        let pid = pid as i32;
        // Negative pid targets the group created by `configure_process_group`.
        unsafe {
            let _ = libc::kill(-pid, libc::SIGTERM);
        }

        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }

        tracing::debug!(target: "godap.process", pid, "process group ignored SIGTERM; killing");
        unsafe {
            let _ = libc::kill(-pid, libc::SIGKILL);
        }
        child.wait().await
    }

    #[cfg(windows)]
    {
        let _ = grace;
        if let Some(pid) = child.id() {
            let pid = pid.to_string();
            let _ = Command::new("taskkill")
                .args(["/PID", &pid, "/T", "/F"])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
        }
        let _ = child.start_kill();
        child.wait().await
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = grace;
        let _ = child.start_kill();
        child.wait().await
    }
}

/// Sends SIGINT to `child` (not its group), asking it to shut down cleanly.
pub fn interrupt(child: &Child) -> io::Result<()> {
    #[cfg(unix)]
    {
        let Some(pid) = child.id() else {
            return Ok(());
        };
        let rc = unsafe { libc::kill(pid as i32, libc::SIGINT) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = child;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "interrupting a child process is only supported on unix",
        ))
    }
}

async fn join_reader(
    handle: tokio::task::JoinHandle<io::Result<(Vec<u8>, bool)>>,
    stream: &'static str,
) -> io::Result<(Vec<u8>, bool)> {
    handle
        .await
        .map_err(|_| io::Error::other(format!("{stream} reader task panicked")))?
}

async fn read_bounded(
    mut reader: impl AsyncRead + Unpin,
    max_bytes: usize,
) -> io::Result<(Vec<u8>, bool)> {
    let mut out = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8 * 1024];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        let remaining = max_bytes.saturating_sub(out.len());
        let to_store = remaining.min(n);
        out.extend_from_slice(&buf[..to_store]);
        if to_store < n {
            // Keep draining so the child never blocks on a full pipe.
            truncated = true;
        }
    }

    Ok((out, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_spec_display_quotes_whitespace() {
        let spec = CommandSpec::new(
            Path::new("/tmp"),
            "go",
            &["list", "-f", "{{.Name}} {{.ImportPath}}"],
        );
        assert_eq!(spec.to_string(), "go list -f \"{{.Name}} {{.ImportPath}}\"");
    }

    #[test]
    fn combined_output_joins_streams() {
        let output = BoundedOutput {
            stdout: "out".to_string(),
            stderr: "err\n".to_string(),
            truncated: false,
        };
        assert_eq!(output.combined(), "out\nerr\n");
    }

    #[cfg(unix)]
    #[test]
    fn exit_kind_describes_codes_and_signals() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(
            ExitKind::from_status(ExitStatus::from_raw(3 << 8)).to_string(),
            "exited with code 3"
        );
        assert_eq!(
            ExitKind::from_status(ExitStatus::from_raw(libc::SIGKILL)).to_string(),
            "was killed by signal 9"
        );
    }
}
