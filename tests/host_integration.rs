//! End-to-end host tests against the real `loopback_module` binary:
//! spawn, register, migrate, call, crash, restart, and tear down.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Map, Value, json};

use deckhost::config::InstanceConfig;
use deckhost::host::supervisor::{ProcessStatus, RestartDelay, RestartPolicy};
use deckhost::host::{HostEvent, HostOptions, InstanceLifecycle, ModuleHost, ModuleInstance};
use module_plugin::message::{ConnectionStatus, ModuleKind};
use module_plugin::upgrades::MigrationRecord;

fn modules_dir() -> (PathBuf, String) {
    let exe = PathBuf::from(env!("CARGO_BIN_EXE_loopback_module"));
    let dir = exe.parent().expect("binary has a parent dir").to_path_buf();
    let name = exe
        .file_name()
        .expect("binary has a name")
        .to_string_lossy()
        .into_owned();
    (dir, name)
}

fn host_options() -> HostOptions {
    let (dir, _) = modules_dir();
    let mut options = HostOptions::new(dir);
    options.instance.restart_policy = RestartPolicy {
        delay: RestartDelay::Fixed(Duration::from_millis(50)),
        max_restarts: 5,
        kill_timeout: Some(Duration::from_secs(5)),
    };
    options
}

fn instance(id: &str) -> InstanceConfig {
    let (_, module_id) = modules_dir();
    InstanceConfig {
        id: id.into(),
        kind: ModuleKind::Connection,
        module_id,
        requested_version: None,
        config: json!({"host": "127.0.0.1", "port": 9910}),
        schema_version: None,
        actions: HashMap::new(),
        feedbacks: HashMap::new(),
        env: HashMap::new(),
    }
}

async fn wait_for_lifecycle(instance: &ModuleInstance, wanted: InstanceLifecycle) {
    let mut watch = instance.lifecycle_watch();
    tokio::time::timeout(Duration::from_secs(15), watch.wait_for(|lc| *lc == wanted))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"))
        .expect("lifecycle watch closed");
}

#[tokio::test]
async fn module_registers_serves_calls_and_stops() {
    let (host, mut events) = ModuleHost::new(host_options());
    let handle = host.add_instance(instance("loop-1")).expect("instance starts");
    wait_for_lifecycle(&handle, InstanceLifecycle::Ready).await;

    // the loopback module reports Ok as soon as init lands
    let status = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await.expect("event stream open") {
                HostEvent::Status {
                    instance_id,
                    status,
                    ..
                } if instance_id == "loop-1" => break status,
                _ => {}
            }
        }
    })
    .await
    .expect("status event arrives");
    assert_eq!(status, ConnectionStatus::Ok);

    // application call round-trip, payload preserved exactly
    let echoed = handle
        .execute_action("echo", json!({"take": 3}))
        .await
        .expect("echo works");
    assert_eq!(echoed, json!({"take": 3}));

    // capability-gated discovery
    let devices = handle.scan_devices().await.expect("scan works");
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, "loopback-0");

    // handler failures come back as call errors, not instance failures
    let err = handle.execute_action("fail", Value::Null).await.unwrap_err();
    assert!(err.to_string().contains("asked to fail"));
    assert_eq!(handle.lifecycle(), InstanceLifecycle::Ready);

    host.remove_instance("loop-1").await.expect("clean removal");
    assert!(host.diagnostics().is_empty());
}

#[tokio::test]
async fn persisted_records_migrate_during_init() {
    let (host, mut events) = ModuleHost::new(host_options());

    let mut config = instance("loop-migrate");
    let mut fields = Map::new();
    fields.insert("legacyOption".into(), json!(42));
    config
        .actions
        .insert("a1".into(), MigrationRecord::new(Some(-1), fields));

    let handle = host.add_instance(config).expect("instance starts");
    wait_for_lifecycle(&handle, InstanceLifecycle::Ready).await;

    let migrated = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let HostEvent::ConfigMigrated { upgrade_index, .. } =
                events.recv().await.expect("event stream open")
            {
                break upgrade_index;
            }
        }
    })
    .await
    .expect("migration event arrives");
    assert_eq!(migrated, 0);

    host.shutdown_all().await;
}

#[tokio::test]
async fn crashing_module_is_respawned_and_reregisters() {
    let (host, _events) = ModuleHost::new(host_options());
    let handle = host.add_instance(instance("loop-crash")).expect("instance starts");
    wait_for_lifecycle(&handle, InstanceLifecycle::Ready).await;

    // the crash action exits the worker before a response goes out
    let _ = handle.execute_action("crash", Value::Null).await;

    // supervisor notices, waits out the delay, respawns
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            if handle.diagnostics().process.crash_count >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("crash observed");

    // a successful echo proves the respawned worker re-registered; retry
    // until the fresh transport is in place
    let echoed = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            if handle.lifecycle() == InstanceLifecycle::Ready {
                if let Ok(value) = handle.execute_action("echo", json!("back")).await {
                    break value;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("works again after respawn");
    assert_eq!(echoed, json!("back"));

    host.shutdown_all().await;
}

#[tokio::test]
async fn version_mismatch_is_terminal_not_retried() {
    let (host, _events) = ModuleHost::new(host_options());

    let mut config = instance("loop-old");
    config
        .env
        .insert("DECKHOST_MOCK_VERSION".into(), "1.9.0".into());
    let handle = host.add_instance(config).expect("instance starts");

    wait_for_lifecycle(&handle, InstanceLifecycle::Incompatible).await;

    // the worker is brought down instead of crash-looping on re-register
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if handle.diagnostics().process.status == ProcessStatus::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("worker stopped");
    assert_eq!(handle.lifecycle(), InstanceLifecycle::Incompatible);

    // calls are refused while incompatible
    let err = handle.execute_action("echo", Value::Null).await.unwrap_err();
    assert!(err.to_string().contains("not ready"));

    host.shutdown_all().await;
}

#[tokio::test]
async fn future_version_is_rejected_too() {
    let (host, _events) = ModuleHost::new(host_options());

    let mut config = instance("loop-future");
    config
        .env
        .insert("DECKHOST_MOCK_VERSION".into(), "3.0.0".into());
    let handle = host.add_instance(config).expect("instance starts");

    wait_for_lifecycle(&handle, InstanceLifecycle::Incompatible).await;
    host.shutdown_all().await;
}
