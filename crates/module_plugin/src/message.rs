use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::upgrades::MigrationRecord;

/// Protocol version the host implements. A module's declared manifest
/// version is gated against this and [`PROTOCOL_FLOOR`] at registration.
pub const PROTOCOL_VERSION: &str = "2.5.0";

/// Oldest module protocol the host still accepts.
pub const PROTOCOL_FLOOR: &str = "2.0.0";

/// Env var carrying the per-spawn verification token the host hands to a
/// worker process. The module echoes it back in `register`.
pub const VERIFY_TOKEN_ENV: &str = "DECKHOST_VERIFY_TOKEN";

/// Env var carrying the instance id of the worker being spawned.
pub const INSTANCE_ID_ENV: &str = "DECKHOST_INSTANCE_ID";

// -----------------------------------------------------------------------------
// Method names, one closed enum per direction
// -----------------------------------------------------------------------------

/// Calls a module may send to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "camelCase")]
pub enum HostMethod {
    Register,
    UpdateStatus,
    LogMessage,
    SetVariableValues,
}

/// Calls the host may send to a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "camelCase")]
pub enum ModuleMethod {
    Init,
    Destroy,
    UpdateConfig,
    ExecuteAction,
    UpdateFeedbacks,
    ScanDevices,
}

// -----------------------------------------------------------------------------
// Registration handshake
// -----------------------------------------------------------------------------

/// What kind of integration a module instance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    /// A device or software connection driver.
    Connection,
    /// A physical control-surface driver.
    Surface,
}

/// Static facts a module declares about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleManifest {
    pub id: String,
    pub kind: ModuleKind,
    /// Protocol version the module was built against (semver).
    pub version: String,
}

/// Optional features a module declares at registration. The host refuses
/// to issue a call the declaring module did not opt into.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModuleCapabilities {
    /// Hardware discovery: `scanDevices` is legal to send.
    pub supports_scan: bool,
    pub supports_feedbacks: bool,
    pub supports_variables: bool,
    /// Config-field names the module understands; the host only forwards these.
    pub config_fields: Vec<String>,
}

/// First call on every new connection: `register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterParams {
    pub manifest_version: String,
    /// Token the host issued when spawning this exact process.
    pub verification_token: String,
    pub capabilities: ModuleCapabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResult {
    pub host_version: String,
}

// -----------------------------------------------------------------------------
// Module-bound calls
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitParams {
    #[serde(default)]
    pub config: Value,
    /// Persisted records awaiting migration, keyed by id.
    #[serde(default)]
    pub actions: HashMap<String, MigrationRecord>,
    #[serde(default)]
    pub feedbacks: HashMap<String, MigrationRecord>,
    /// Last upgrade step the persisted config passed, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_upgrade_index: Option<i64>,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

/// Migrated state handed back for the host to persist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_config: Option<Value>,
    #[serde(default)]
    pub updated_actions: HashMap<String, MigrationRecord>,
    #[serde(default)]
    pub updated_feedbacks: HashMap<String, MigrationRecord>,
    /// Index persisted state is now at.
    pub upgrade_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConfigParams {
    pub config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteActionParams {
    pub action_id: String,
    #[serde(default)]
    pub options: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFeedbacksParams {
    /// Feedback ids the host wants re-evaluated; empty means all.
    #[serde(default)]
    pub feedback_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    pub id: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanDevicesResult {
    pub devices: Vec<DiscoveredDevice>,
}

// -----------------------------------------------------------------------------
// Host-bound notifications
// -----------------------------------------------------------------------------

/// Connection health a module reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Ok,
    Connecting,
    Disconnected,
    BadConfig,
    UnknownError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusParams {
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessageParams {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVariableValuesParams {
    pub values: HashMap<String, Value>,
}
