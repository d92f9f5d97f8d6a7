// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Isolated manager against the real `corelink-helper` binary.

#![cfg(unix)]

mod common;

use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use common::{TestOwner, count_terminated, demo_rom, eventually, startup, write_rom};
use corelink::core::plugin::CorePluginInfo;
use corelink::{
    CoreError, CoreManager, CoreRegistry, IntSize, LifecycleState, ManagerConfig, ManagerStrategy,
    OwnerEvent, PatternCore, ProcessCoreManager, create_manager,
};
use serial_test::serial;

const WAIT: Duration = Duration::from_secs(10);

fn helper_config() -> ManagerConfig {
    ManagerConfig::default()
        .with_strategy(ManagerStrategy::Isolated)
        .with_helper_path(env!("CARGO_BIN_EXE_corelink-helper"))
        .with_helper_env("RUST_LOG", "debug")
}

fn isolated(config: ManagerConfig, owner: &TestOwner) -> ProcessCoreManager {
    ProcessCoreManager::new(
        config,
        &CoreRegistry::with_builtin_cores(),
        owner.weak(),
        tokio::runtime::Handle::current(),
    )
    .unwrap()
}

fn saved_field(path: &Path, field: &str) -> serde_json::Value {
    let state: serde_json::Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
    state[field].clone()
}

fn signal(pid: u32, signal: &str) {
    let status = Command::new("kill")
        .arg(format!("-{}", signal))
        .arg(pid.to_string())
        .status()
        .unwrap();
    assert!(status.success(), "kill -{} {} failed", signal, pid);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_isolated_core_runs_and_presents() {
    let dir = tempfile::tempdir().unwrap();
    let rom = write_rom(dir.path(), &demo_rom());
    let mut owner = TestOwner::new();
    let manager = isolated(helper_config(), &owner);

    let load = manager.load_rom(startup(&rom, "pattern"));
    let setup = manager.setup();
    load.await.unwrap();
    assert!(manager.helper_pid().is_some());
    let result = setup.await.unwrap();
    assert_eq!(result.screen_size, IntSize::new(64, 48));
    assert_eq!(manager.state(), LifecycleState::Ready);

    let Some(OwnerEvent::RenderContext(handle)) = owner
        .expect(WAIT, |e| matches!(e, OwnerEvent::RenderContext(_)))
        .await
    else {
        panic!("no render context published");
    };
    assert_eq!(handle.session(), manager.session_id());
    let layer = manager.bind_render_context(handle).unwrap();

    manager.start().await.unwrap();
    assert!(eventually(WAIT, || layer.latest_frame().is_some()).await);
    let image = manager.capture_output_image().await.unwrap();
    assert_eq!(image.size, IntSize::new(64, 48));

    let state = dir.path().join("isolated.state");
    manager.set_pause_emulation(true).await.unwrap();
    manager.save_state(state.clone()).await.unwrap();
    assert!(state.is_file());
    manager.set_pause_emulation(false).await.unwrap();

    manager.stop().await.unwrap();
    assert_eq!(manager.state(), LifecycleState::Stopped);
    assert!(matches!(manager.reset().await.unwrap_err(), CoreError::NotRunning));

    let events = owner.collect_for(Duration::from_millis(500)).await;
    assert_eq!(count_terminated(&events), 0);
    // The helper exits after stop and takes its surfaces with it.
    assert!(eventually(WAIT, || !layer.is_valid()).await);
    assert!(layer.latest_frame().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_handshake_timeout_kills_helper() {
    let dir = tempfile::tempdir().unwrap();
    let rom = write_rom(dir.path(), &demo_rom());
    let mut owner = TestOwner::new();
    let config = helper_config()
        .with_handshake_timeout(Duration::from_secs(2))
        .with_helper_arg("--debug-handshake-delay-ms")
        .with_helper_arg("5000");
    let manager = isolated(config, &owner);

    let started = Instant::now();
    let err = manager.load_rom(startup(&rom, "pattern")).await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.code(), Some(CoreError::CONNECTION_TIMED_OUT));
    assert!(elapsed >= Duration::from_secs(2), "gave up after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(4500), "took {:?}", elapsed);
    assert!(manager.helper_pid().is_none());
    assert!(eventually(WAIT, || manager.state() == LifecycleState::Failed).await);

    let events = owner.collect_for(Duration::from_millis(500)).await;
    assert!(
        !events.iter().any(|e| matches!(e, OwnerEvent::RenderContext(_))),
        "render context published without a connection: {:?}",
        events
    );
    assert_eq!(count_terminated(&events), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_missing_helper_cannot_start() {
    let dir = tempfile::tempdir().unwrap();
    let rom = write_rom(dir.path(), &demo_rom());
    let owner = TestOwner::new();
    let config = helper_config().with_helper_path(dir.path().join("no-such-helper"));
    let manager = isolated(config, &owner);

    let load = manager.load_rom(startup(&rom, "pattern"));
    let setup = manager.setup();
    let err = load.await.unwrap_err();
    assert_eq!(err.code(), Some(CoreError::HELPER_COULD_NOT_START_CONNECTION));
    assert!(matches!(setup.await.unwrap_err(), CoreError::NotRunning));
    assert_eq!(manager.state(), LifecycleState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_nil_root_proxy_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let rom = write_rom(dir.path(), &demo_rom());
    let owner = TestOwner::new();
    let config = helper_config().with_helper_arg("--debug-nil-root-proxy");
    let manager = isolated(config, &owner);

    let err = manager.load_rom(startup(&rom, "pattern")).await.unwrap_err();
    assert_eq!(err.code(), Some(CoreError::NIL_ROOT_PROXY));
    assert!(manager.helper_pid().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_invalid_rom_fails_in_helper() {
    let dir = tempfile::tempdir().unwrap();
    let rom = dir.path().join("broken.json");
    std::fs::write(&rom, b"[1, 2, 3]").unwrap();
    let mut owner = TestOwner::new();
    let manager = isolated(helper_config(), &owner);

    let load = manager.load_rom(startup(&rom, "pattern"));
    let setup = manager.setup();
    let err = load.await.unwrap_err();
    assert_eq!(err.code(), Some(CoreError::INCORRECT_FILE));
    assert!(matches!(setup.await.unwrap_err(), CoreError::NotRunning));
    assert!(eventually(WAIT, || manager.state() == LifecycleState::Failed).await);

    // The helper is disconnected, not crashed.
    let events = owner.collect_for(Duration::from_millis(500)).await;
    assert_eq!(count_terminated(&events), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_helper_death_fails_outstanding_commands() {
    let dir = tempfile::tempdir().unwrap();
    let rom = write_rom(dir.path(), &demo_rom());
    let mut owner = TestOwner::new();
    let manager = isolated(helper_config(), &owner);

    let load = manager.load_rom(startup(&rom, "pattern"));
    let setup = manager.setup();
    load.await.unwrap();
    setup.await.unwrap();
    let handle = match owner
        .expect(WAIT, |e| matches!(e, OwnerEvent::RenderContext(_)))
        .await
    {
        Some(OwnerEvent::RenderContext(handle)) => handle,
        other => panic!("expected a render context, got {:?}", other),
    };
    let layer = manager.bind_render_context(handle).unwrap();
    manager.start().await.unwrap();
    let pid = manager.helper_pid().unwrap();

    // Freeze the helper so the request is still outstanding when it dies.
    signal(pid, "STOP");
    let outstanding = manager.save_state(dir.path().join("never.state"));
    signal(pid, "KILL");

    let err = outstanding.await.unwrap_err();
    assert_eq!(err.code(), Some(CoreError::INVALID_HELPER_CONNECTION));
    assert!(eventually(WAIT, || manager.state() == LifecycleState::Crashed).await);
    assert!(eventually(WAIT, || !layer.is_valid()).await);

    let events = owner.collect_for(Duration::from_millis(500)).await;
    assert_eq!(count_terminated(&events), 1);

    let err = manager.reset().await.unwrap_err();
    assert!(matches!(err, CoreError::NotRunning));
    assert_eq!(err.code(), Some(CoreError::HELPER_NOT_RUNNING));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_create_manager_picks_isolated_strategy() {
    let dir = tempfile::tempdir().unwrap();
    let rom = write_rom(dir.path(), &demo_rom());
    let mut owner = TestOwner::new();
    let manager = create_manager(
        &helper_config(),
        CoreRegistry::with_builtin_cores(),
        owner.weak(),
    )
    .unwrap();

    let load = manager.load_rom(startup(&rom, "pattern"));
    let setup = manager.setup();
    load.await.unwrap();
    setup.await.unwrap();
    manager.shutdown();
    assert_eq!(manager.state(), LifecycleState::Stopped);

    let events = owner.collect_for(Duration::from_millis(500)).await;
    assert_eq!(count_terminated(&events), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_commands_held_across_handshake_replay_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let rom = write_rom(dir.path(), &demo_rom());
    let owner = TestOwner::new();
    let manager = isolated(helper_config(), &owner);

    let first = dir.path().join("first.state");
    let second = dir.path().join("second.state");

    let load = manager.load_rom(startup(&rom, "pattern"));
    let setup = manager.setup();
    assert_eq!(manager.state(), LifecycleState::Loading);

    // Held until the helper has accepted and the core is Ready.
    let wide = manager.change_display_mode("Wide");
    let save_first = manager.save_state(first.clone());
    let standard = manager.change_display_mode("Standard");
    let save_second = manager.save_state(second.clone());

    load.await.unwrap();
    let result = setup.await.unwrap();
    assert_eq!(result.screen_size, IntSize::new(64, 48));
    wide.await.unwrap();
    save_first.await.unwrap();
    standard.await.unwrap();
    save_second.await.unwrap();

    assert_eq!(saved_field(&first, "mode"), "Wide");
    assert_eq!(saved_field(&second, "mode"), "Standard");
    assert_eq!(manager.state(), LifecycleState::Ready);
    manager.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_host_registry_decides_isolated_cores() {
    let dir = tempfile::tempdir().unwrap();
    let rom = write_rom(dir.path(), &demo_rom());
    let owner = TestOwner::new();

    // The helper provides the pattern core, but this host never registered it.
    let manager = create_manager(&helper_config(), CoreRegistry::new(), owner.weak()).unwrap();
    let err = manager.load_rom(startup(&rom, "pattern")).await.unwrap_err();
    assert_eq!(err.code(), Some(CoreError::PLUGIN_INVALID));
    manager.shutdown();

    let mut retired = CoreRegistry::new();
    retired
        .register(CorePluginInfo::new("pattern", "0.1").out_of_support(), || {
            Box::new(PatternCore::new())
        })
        .unwrap();
    let manager = create_manager(&helper_config(), retired, owner.weak()).unwrap();
    let err = manager.load_rom(startup(&rom, "pattern")).await.unwrap_err();
    assert_eq!(err.code(), Some(CoreError::PLUGIN_OUT_OF_SUPPORT));
    manager.shutdown();
}
