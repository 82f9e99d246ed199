use godap_process::{
    configure_process_group, interrupt, run_command, run_command_checked,
    terminate_process_tree, CommandSpec, ExitKind, RunCommandError,
    RunOptions,
};
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

fn helper() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_godap_process_test_helper"))
}

fn spec(args: &[&str]) -> CommandSpec {
    CommandSpec::new(Path::new("."), helper(), args)
}

#[tokio::test]
async fn captures_stdout_and_stderr() {
    let result = run_command(
        &spec(&["--print", "GOROOT=/usr/local/go", "--eprint", "warning"]),
        RunOptions::default(),
    )
    .await
    .unwrap();

    assert!(result.success());
    assert_eq!(result.output.stdout, "GOROOT=/usr/local/go\n");
    assert_eq!(result.output.stderr, "warning\n");
    assert!(!result.output.truncated);
}

#[tokio::test]
async fn truncates_large_stdout() {
    let opts = RunOptions {
        timeout: Some(Duration::from_secs(5)),
        max_bytes: 1024,
        ..RunOptions::default()
    };

    let result = run_command(&spec(&["--stdout-bytes", "1048576"]), opts)
        .await
        .unwrap();

    assert!(result.status.success());
    assert!(result.output.truncated);
    assert_eq!(result.output.stdout.len(), 1024);
}

#[tokio::test]
async fn timeout_kills_process_tree() {
    let opts = RunOptions {
        timeout: Some(Duration::from_millis(50)),
        ..RunOptions::default()
    };

    let start = Instant::now();
    let result = run_command(
        &spec(&["--spawn-child-sleep-ms", "5000", "--sleep-ms", "5000"]),
        opts,
    )
    .await
    .unwrap();

    assert!(result.timed_out);
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "expected timeout kill to return promptly, took {:?}",
        start.elapsed()
    );
}

#[tokio::test]
async fn checked_run_reports_exit_code() {
    let err = run_command_checked(&spec(&["--eprint", "no Go files", "--exit", "1"]), RunOptions::default())
        .await
        .unwrap_err();

    match &err {
        RunCommandError::Failed { result, .. } => {
            assert_eq!(ExitKind::from_status(result.status), ExitKind::Code(1));
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    let message = err.to_string();
    assert!(message.contains("exited with code 1"), "{message}");
    assert!(message.ends_with(": no Go files"), "{message}");
}

#[tokio::test]
async fn missing_program_is_io_error() {
    let command = CommandSpec::new(Path::new("."), "/definitely/not/a/real/program", &[]);
    let err = run_command_checked(&command, RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RunCommandError::Io { .. }), "{err:?}");
}

#[cfg(unix)]
#[tokio::test]
async fn terminate_process_tree_stops_grandchildren() {
    let mut cmd = tokio::process::Command::new(helper());
    cmd.args(["--spawn-child-sleep-ms", "5000", "--sleep-ms", "5000"])
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    configure_process_group(&mut cmd);
    let mut child = cmd.spawn().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let start = Instant::now();
    let status = terminate_process_tree(&mut child, Duration::from_millis(250))
        .await
        .unwrap();

    // SIGTERM
    assert_eq!(ExitKind::from_status(status), ExitKind::Signal(15));
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[cfg(unix)]
#[tokio::test]
async fn interrupt_delivers_sigint() {
    let mut cmd = tokio::process::Command::new(helper());
    cmd.args(["--sleep-ms", "5000"]);
    let mut child = cmd.spawn().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    interrupt(&child).unwrap();
    let status = tokio::time::timeout(Duration::from_secs(2), child.wait())
        .await
        .expect("child should exit after SIGINT")
        .unwrap();

    assert_eq!(ExitKind::from_status(status), ExitKind::Signal(2));
    assert_eq!(ExitKind::from_status(status).to_string(), "was killed by signal 2");
}
