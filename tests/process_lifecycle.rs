//! End-to-end process lifecycle on both spawn paths
//!
//! The wrapped path runs the real `piperun-wrapper` binary built alongside these
//! tests.

#![cfg(unix)]

use piperun::{
    CommandSpec, EngineConfig, ExitStatus, Launcher, Process, ProcessError, ProcessInputStream,
    ProcessStatus, Reactor, SpawnMode, WrapperConfig,
};
use std::path::PathBuf;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(20);

fn launcher(mode: SpawnMode) -> Launcher {
    let config = EngineConfig {
        spawn_mode: mode,
        handshake_timeout_ms: 10_000,
        wrapper: WrapperConfig {
            program: Some(PathBuf::from(env!("CARGO_BIN_EXE_piperun-wrapper"))),
            args: Vec::new(),
        },
        ..EngineConfig::default()
    };
    Launcher::new(Reactor::from_current().unwrap(), config)
}

fn sh(script: &str) -> CommandSpec {
    CommandSpec::new("sh").arg("-c").arg(script)
}

async fn read_all(stream: &ProcessInputStream) -> Vec<u8> {
    let mut collected = Vec::new();
    while let Some(chunk) = tokio::time::timeout(WAIT, stream.read())
        .await
        .expect("read timed out")
        .expect("read failed")
    {
        collected.extend(chunk);
    }
    collected
}

async fn counts_to_three(mode: SpawnMode) {
    let process = launcher(mode)
        .start(&sh("echo 1; sleep 0.2; echo 2; sleep 0.2; echo 3; exit 42"))
        .await
        .unwrap();
    let stdout = process.stdout().unwrap();

    // Separated by sleeps, so each line arrives as its own chunk.
    for expected in ["1\n", "2\n", "3\n"] {
        let chunk = tokio::time::timeout(WAIT, stdout.read()).await.unwrap().unwrap();
        assert_eq!(chunk.as_deref(), Some(expected.as_bytes()));
    }
    assert_eq!(tokio::time::timeout(WAIT, stdout.read()).await.unwrap(), Ok(None));

    let status = tokio::time::timeout(WAIT, process.wait()).await.unwrap();
    assert_eq!(status, Ok(ExitStatus::Exited(42)));
    assert_eq!(process.status(), ProcessStatus::Ended);
}

#[tokio::test]
async fn test_direct_lifecycle() {
    counts_to_three(SpawnMode::Direct).await;
}

#[tokio::test]
async fn test_wrapped_lifecycle() {
    counts_to_three(SpawnMode::Wrapper).await;
}

#[tokio::test]
async fn test_wrapped_pid_is_the_target_not_the_wrapper() {
    let process = launcher(SpawnMode::Wrapper)
        .start(&sh("echo $$"))
        .await
        .unwrap();
    let pid = tokio::time::timeout(WAIT, process.started()).await.unwrap().unwrap();

    let output = read_all(process.stdout().unwrap()).await;
    let reported: u32 = String::from_utf8(output).unwrap().trim().parse().unwrap();
    assert_eq!(reported, pid);
    assert_ne!(process.wrapper_pid(), Some(pid));
    assert_eq!(process.pid(), Some(pid));
}

#[tokio::test]
async fn test_wrapped_streams_carry_stdin_and_stderr() {
    let process = launcher(SpawnMode::Wrapper)
        .start(&sh("cat; echo done >&2"))
        .await
        .unwrap();

    // Written before the handshake has necessarily finished.
    let stdin = process.stdin().unwrap();
    stdin.write(b"through the wrapper").await.unwrap();
    stdin.close().await;

    let (out, err) = tokio::join!(
        read_all(process.stdout().unwrap()),
        read_all(process.stderr().unwrap())
    );
    assert_eq!(out, b"through the wrapper");
    assert_eq!(err, b"done\n");
    assert_eq!(
        tokio::time::timeout(WAIT, process.wait()).await.unwrap(),
        Ok(ExitStatus::Exited(0))
    );
}

async fn running(mode: SpawnMode) -> Process {
    let process = launcher(mode).start(&sh("exec sleep 30")).await.unwrap();
    tokio::time::timeout(WAIT, process.started()).await.unwrap().unwrap();
    assert_eq!(process.status(), ProcessStatus::Running);
    process
}

#[tokio::test]
async fn test_signal_reaches_target_on_both_paths() {
    for mode in [SpawnMode::Direct, SpawnMode::Wrapper] {
        let process = running(mode).await;
        process.signal(15).unwrap();
        let status = tokio::time::timeout(WAIT, process.wait()).await.unwrap();
        assert_eq!(status, Ok(ExitStatus::Signaled(15)), "{mode:?}");
        assert_eq!(process.signal(15), Err(ProcessError::NotRunning), "{mode:?}");
    }
}

#[tokio::test]
async fn test_wrapped_kill() {
    let process = running(SpawnMode::Wrapper).await;
    process.kill().unwrap();
    assert_eq!(
        tokio::time::timeout(WAIT, process.wait()).await.unwrap(),
        Ok(ExitStatus::Signaled(9))
    );
}

#[tokio::test]
async fn test_wrapped_target_spawn_failure() {
    let process = launcher(SpawnMode::Wrapper)
        .start(&CommandSpec::new("/definitely/not/a/program"))
        .await
        .unwrap();

    let started = tokio::time::timeout(WAIT, process.started()).await.unwrap();
    assert!(
        matches!(started, Err(ProcessError::Spawn { .. })),
        "unexpected outcome: {started:?}"
    );
    assert_eq!(process.status(), ProcessStatus::Starting);
    assert!(process.stdout().unwrap().read().await.is_err());
}

#[tokio::test]
async fn test_unread_output_leaves_watcher_disabled() {
    let launcher = launcher(SpawnMode::Direct);
    let process = launcher
        .start(&sh("head -c 262144 /dev/zero; exit 0"))
        .await
        .unwrap();
    let stdout = process.stdout().unwrap();

    let first = tokio::time::timeout(WAIT, stdout.read()).await.unwrap().unwrap();
    assert!(first.is_some_and(|chunk| !chunk.is_empty() && chunk.len() <= stdout.chunk_size()));

    // No read outstanding: nothing pulls from the pipe and the writer blocks.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let watcher = stdout.watcher().expect("stream is backed");
    assert!(!launcher.reactor().is_enabled(watcher));
    assert!(process.try_wait().is_none());

    let rest = read_all(stdout).await;
    assert!(!rest.is_empty());
    assert_eq!(
        tokio::time::timeout(WAIT, process.wait()).await.unwrap(),
        Ok(ExitStatus::Exited(0))
    );
}

#[tokio::test]
async fn test_unreferenced_streams_do_not_keep_reactor_alive() {
    let launcher = launcher(SpawnMode::Direct);
    let process = launcher.start(&sh("exec sleep 30")).await.unwrap();
    let stdout = process.stdout().unwrap();
    let stderr = process.stderr().unwrap();

    let pending_out = stdout.read();
    let pending_err = stderr.read();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(launcher.reactor().keeps_alive());

    stdout.unreference().unwrap();
    stderr.unreference().unwrap();
    tokio::time::timeout(WAIT, launcher.reactor().idle()).await.unwrap();

    process.kill().unwrap();
    assert_eq!(tokio::time::timeout(WAIT, pending_out).await.unwrap(), Ok(None));
    assert_eq!(tokio::time::timeout(WAIT, pending_err).await.unwrap(), Ok(None));
}
