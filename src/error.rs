use std::path::PathBuf;

use thiserror::Error;

use crate::host::instance::InstanceLifecycle;
use module_plugin::transport::CallError;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("instance `{0}` already exists")]
    DuplicateInstance(String),
    #[error("unknown instance `{0}`")]
    UnknownInstance(String),
    #[error("module `{module}` not found under {dir}")]
    ModuleNotFound { module: String, dir: PathBuf },
    #[error("instance `{id}` is not ready (lifecycle: {lifecycle:?})")]
    NotReady {
        id: String,
        lifecycle: InstanceLifecycle,
    },
    #[error("instance `{id}` does not support `{capability}`")]
    UnsupportedCapability { id: String, capability: &'static str },
    #[error("module sent a malformed reply: {0}")]
    BadReply(String),
    #[error("invalid host config: {0}")]
    Config(String),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
