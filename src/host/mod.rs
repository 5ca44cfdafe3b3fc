//! The host facade: owns every configured module instance and routes
//! application calls to the right worker.

pub mod instance;
pub mod registration;
pub mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::info;

use crate::config::InstanceConfig;
use crate::error::HostError;
pub use instance::{HostEvent, InstanceDiagnostics, InstanceLifecycle, InstanceOptions, ModuleInstance};
pub use registration::RegistrationGate;

#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Directory holding the module executables.
    pub modules_dir: PathBuf,
    pub instance: InstanceOptions,
}

impl HostOptions {
    pub fn new(modules_dir: impl Into<PathBuf>) -> Self {
        Self {
            modules_dir: modules_dir.into(),
            instance: InstanceOptions::default(),
        }
    }
}

/// Owns all module instances. Failures stay local to one instance; the
/// host only ever observes them through the event stream.
pub struct ModuleHost {
    options: HostOptions,
    gate: RegistrationGate,
    instances: DashMap<String, Arc<ModuleInstance>>,
    events: mpsc::UnboundedSender<HostEvent>,
}

impl ModuleHost {
    pub fn new(options: HostOptions) -> (Arc<Self>, mpsc::UnboundedReceiver<HostEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let host = Arc::new(Self {
            options,
            gate: RegistrationGate::new(),
            instances: DashMap::new(),
            events,
        });
        (host, events_rx)
    }

    /// Spawn a configured instance. Fails fast when the id is taken or
    /// the module binary is missing.
    pub fn add_instance(&self, config: InstanceConfig) -> Result<Arc<ModuleInstance>, HostError> {
        if self.instances.contains_key(&config.id) {
            return Err(HostError::DuplicateInstance(config.id));
        }
        let executable = self.resolve_module(&config.module_id, config.requested_version.as_deref())?;
        info!(
            "starting instance `{}` ({} from {})",
            config.id,
            config.module_id,
            executable.display()
        );

        let instance = ModuleInstance::launch(
            config,
            executable,
            self.gate.clone(),
            self.options.instance.clone(),
            self.events.clone(),
        );
        self.instances
            .insert(instance.id().to_string(), Arc::clone(&instance));
        Ok(instance)
    }

    /// Stop the worker and forget the instance.
    pub async fn remove_instance(&self, id: &str) -> Result<(), HostError> {
        let (_, instance) = self
            .instances
            .remove(id)
            .ok_or_else(|| HostError::UnknownInstance(id.to_string()))?;
        instance.stop().await;
        Ok(())
    }

    /// Manual restart path for `Crashed` and `Incompatible` instances.
    pub fn restart_instance(&self, id: &str) -> Result<(), HostError> {
        let instance = self.get(id)?;
        instance.restart();
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<ModuleInstance>, HostError> {
        self.instances
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| HostError::UnknownInstance(id.to_string()))
    }

    /// Instance id -> lifecycle and process snapshot, for status surfaces.
    pub fn diagnostics(&self) -> Vec<InstanceDiagnostics> {
        self.instances
            .iter()
            .map(|entry| entry.value().diagnostics())
            .collect()
    }

    /// Stop every instance concurrently and wait for all of them.
    pub async fn shutdown_all(&self) {
        let mut stops = JoinSet::new();
        for entry in self.instances.iter() {
            let instance = Arc::clone(entry.value());
            stops.spawn(async move { instance.stop().await });
        }
        self.instances.clear();
        while stops.join_next().await.is_some() {}
        info!("all module instances stopped");
    }

    /// A pinned version resolves to `<module_id>-<version>`, falling back
    /// to the unversioned binary name.
    fn resolve_module(&self, module_id: &str, version: Option<&str>) -> Result<PathBuf, HostError> {
        if let Some(version) = version {
            let versioned = self
                .options
                .modules_dir
                .join(format!("{module_id}-{version}"));
            if versioned.is_file() {
                return Ok(versioned);
            }
        }
        let plain = self.options.modules_dir.join(module_id);
        if plain.is_file() {
            return Ok(plain);
        }
        Err(HostError::ModuleNotFound {
            module: module_id.to_string(),
            dir: self.options.modules_dir.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use module_plugin::message::ModuleKind;

    fn config(id: &str, module_id: &str) -> InstanceConfig {
        InstanceConfig {
            id: id.into(),
            kind: ModuleKind::Connection,
            module_id: module_id.into(),
            requested_version: None,
            config: serde_json::Value::Null,
            schema_version: None,
            actions: Default::default(),
            feedbacks: Default::default(),
            env: Default::default(),
        }
    }

    #[tokio::test]
    async fn missing_module_binary_is_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let (host, _events) = ModuleHost::new(HostOptions::new(dir.path()));
        let err = host.add_instance(config("a", "no-such-module")).unwrap_err();
        assert!(matches!(err, HostError::ModuleNotFound { .. }));
        assert!(host.diagnostics().is_empty());
    }

    #[tokio::test]
    async fn versioned_binaries_win_over_plain_ones() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cam"), "").unwrap();
        std::fs::write(dir.path().join("cam-1.2.0"), "").unwrap();
        let (host, _events) = ModuleHost::new(HostOptions::new(dir.path()));

        let resolved = host.resolve_module("cam", Some("1.2.0")).unwrap();
        assert!(resolved.ends_with("cam-1.2.0"));
        // unknown pinned version falls back to the plain binary
        let resolved = host.resolve_module("cam", Some("9.9.9")).unwrap();
        assert!(resolved.ends_with("cam"));
    }
}
