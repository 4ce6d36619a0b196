//! Descriptor hygiene: finishing a process releases every endpoint the engine
//! opened for it.

#![cfg(target_os = "linux")]

use piperun::{CommandSpec, EngineConfig, Launcher, Reactor, SpawnMode, WrapperConfig};
use serial_test::serial;
use std::path::PathBuf;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(20);

fn open_descriptors() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

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

async fn run_to_completion(launcher: &Launcher) {
    let spec = CommandSpec::new("sh").arg("-c").arg("echo out; echo err >&2");
    let process = launcher.start(&spec).await.unwrap();
    for stream in [process.stdout().unwrap(), process.stderr().unwrap()] {
        while tokio::time::timeout(WAIT, stream.read())
            .await
            .unwrap()
            .unwrap()
            .is_some()
        {}
    }
    tokio::time::timeout(WAIT, process.wait()).await.unwrap().unwrap();
}

async fn settles_back_to(baseline: usize) -> bool {
    for _ in 0..50 {
        if open_descriptors() <= baseline {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn assert_no_leak(mode: SpawnMode) {
    let launcher = launcher(mode);
    // The runtime opens its child-reaping machinery lazily on the first spawn.
    run_to_completion(&launcher).await;
    let baseline = open_descriptors();

    for _ in 0..5 {
        run_to_completion(&launcher).await;
    }
    assert!(
        settles_back_to(baseline).await,
        "{mode:?}: {} descriptors open, started with {baseline}",
        open_descriptors()
    );
    assert_eq!(launcher.reactor().watcher_count(), 0);
}

#[tokio::test]
#[serial]
async fn test_direct_spawn_releases_descriptors() {
    assert_no_leak(SpawnMode::Direct).await;
}

#[tokio::test]
#[serial]
async fn test_wrapped_spawn_releases_descriptors() {
    assert_no_leak(SpawnMode::Wrapper).await;
}

#[tokio::test]
#[serial]
async fn test_dropping_unread_process_releases_descriptors() {
    let launcher = launcher(SpawnMode::Direct);
    run_to_completion(&launcher).await;
    let baseline = open_descriptors();

    let process = launcher
        .start(&CommandSpec::new("sh").arg("-c").arg("exec sleep 30"))
        .await
        .unwrap();
    tokio::time::timeout(WAIT, process.started()).await.unwrap().unwrap();
    process.kill().unwrap();
    tokio::time::timeout(WAIT, process.wait()).await.unwrap().unwrap();
    drop(process);

    assert!(settles_back_to(baseline).await);
}
