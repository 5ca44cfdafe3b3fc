//! A scripted module for exercising the runtime without real hardware.
//!
//! `MockModule` is used by this crate's own tests, by the host's
//! integration tests (via the `loopback_module` binary) and as the
//! smallest possible example of a [`ModuleHandler`] implementation.

use std::collections::HashMap;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::message::{
    ConnectionStatus, DiscoveredDevice, ExecuteActionParams, LogLevel, ModuleCapabilities,
    ModuleKind, ModuleManifest, PROTOCOL_VERSION,
};
use crate::runtime::{ModuleContext, ModuleHandler};
use crate::upgrades::{UpgradeBatch, UpgradeChanges, UpgradeScript};

/// Loopback module: echoes actions, reports one fake device, and carries
/// a single upgrade script that renames the legacy `legacyOption` field.
pub struct MockModule {
    version: String,
    config: Value,
    initialized: bool,
}

impl MockModule {
    pub fn new() -> Self {
        Self::with_version(PROTOCOL_VERSION)
    }

    /// Override the declared protocol version, for compatibility-gate tests.
    pub fn with_version(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            config: Value::Null,
            initialized: false,
        }
    }
}

impl Default for MockModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModuleHandler for MockModule {
    fn manifest(&self) -> ModuleManifest {
        ModuleManifest {
            id: "loopback".into(),
            kind: ModuleKind::Connection,
            version: self.version.clone(),
        }
    }

    fn capabilities(&self) -> ModuleCapabilities {
        ModuleCapabilities {
            supports_scan: true,
            supports_feedbacks: false,
            supports_variables: true,
            config_fields: vec!["host".into(), "port".into()],
        }
    }

    fn upgrade_scripts(&self) -> Vec<UpgradeScript> {
        vec![Box::new(|batch: &UpgradeBatch| {
            let mut changes = UpgradeChanges::default();
            for (id, record) in &batch.actions {
                if let Some(value) = record.fields.get("legacyOption").cloned() {
                    let mut record = record.clone();
                    record.fields.remove("legacyOption");
                    record.fields.insert("option".into(), value);
                    changes.actions.insert(id.clone(), record);
                }
            }
            changes
        })]
    }

    async fn init(&mut self, ctx: ModuleContext, config: Value) -> Result<()> {
        self.config = config;
        self.initialized = true;
        ctx.log(LogLevel::Info, "loopback up");
        ctx.update_status(ConnectionStatus::Ok, None);
        ctx.set_variable_values(HashMap::from([("state".to_string(), json!("ready"))]));
        Ok(())
    }

    async fn destroy(&mut self) -> Result<()> {
        self.initialized = false;
        Ok(())
    }

    async fn config_updated(&mut self, _ctx: ModuleContext, config: Value) -> Result<()> {
        self.config = config;
        Ok(())
    }

    async fn execute_action(
        &mut self,
        ctx: ModuleContext,
        action: ExecuteActionParams,
    ) -> Result<Value> {
        match action.action_id.as_str() {
            // return the options untouched so callers can assert on them
            "echo" => Ok(action.options),
            "config" => Ok(json!({
                "config": self.config,
                "initialized": self.initialized,
            })),
            "fail" => bail!("loopback was asked to fail"),
            // hard exit, for supervisor crash/restart tests
            "crash" => std::process::exit(1),
            other => {
                ctx.log(LogLevel::Debug, format!("unhandled action `{other}`"));
                Ok(json!({ "actionId": other }))
            }
        }
    }

    async fn scan_devices(&mut self, _ctx: ModuleContext) -> Result<Vec<DiscoveredDevice>> {
        Ok(vec![DiscoveredDevice {
            id: "loopback-0".into(),
            description: "Loopback test device".into(),
        }])
    }
}
