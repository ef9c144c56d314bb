#![cfg(windows)]

use childproc::{
    ChildProcess, KILLED_EXIT_CODE, PosixSignal, ProcessError, ProcessHandle, ProcessStartOptions,
    RunningProcess, StdioMode, TextEncoding,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn cmd(script: &str) -> ProcessStartOptions {
    ProcessStartOptions::builder()
        .file_name("cmd.exe")
        .args(["/c", script])
        .build()
        .unwrap()
}

#[test]
fn test_capture_output() -> anyhow::Result<()> {
    let output = ChildProcess::capture_output(
        &cmd("echo out& echo err 1>&2& exit 3"),
        TextEncoding::default(),
        Some(Duration::from_secs(30)),
    )?;
    assert_eq!(output.stdout, "out\r\n");
    assert_eq!(output.stderr, "err \r\n");
    assert_eq!(output.status.exit_code, 3);
    assert_eq!(output.status.signal, None);
    Ok(())
}

#[test]
fn test_timeout_uses_killed_exit_code() -> anyhow::Result<()> {
    let status = ChildProcess::discard(
        &cmd("ping -n 30 127.0.0.1"),
        Some(Duration::from_millis(200)),
    )?;
    assert!(status.cancelled);
    assert_eq!(status.exit_code, KILLED_EXIT_CODE);
    Ok(())
}

#[test]
fn test_signals_other_than_sigkill_are_unsupported() -> anyhow::Result<()> {
    let mut process = RunningProcess::start(&cmd("ping -n 30 127.0.0.1"), StdioMode::Discard)?;
    assert!(matches!(
        process.send_signal(PosixSignal::SIGTERM, false),
        Err(ProcessError::PlatformNotSupported(_))
    ));
    process.send_signal(PosixSignal::SIGKILL, false)?;
    assert_eq!(process.wait(None)?.exit_code, KILLED_EXIT_CODE);
    Ok(())
}

#[test]
fn test_suspended_start() -> anyhow::Result<()> {
    let mut options = cmd("exit 4");
    options.create_suspended = true;
    options.kill_on_parent_death = true;

    let mut process = RunningProcess::start(&options, StdioMode::Discard)?;
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(process.handle_mut().try_get_exit_status()?, None);
    process.resume()?;
    assert_eq!(process.wait(None)?.exit_code, 4);
    Ok(())
}

#[tokio::test]
async fn test_async_cancellation() -> anyhow::Result<()> {
    let token = CancellationToken::new();
    token.cancel();
    let status = ChildProcess::discard_async(&cmd("ping -n 30 127.0.0.1"), token).await?;
    assert!(status.cancelled);
    Ok(())
}
