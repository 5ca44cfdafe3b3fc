//! Async runtime that wires a worker process's **stdin / stdout** packet
//! traffic to a user-supplied [`ModuleHandler`] implementation.
//!
//! A module binary is just:
//! ```ignore
//! use module_plugin::runtime::serve;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     serve(MyModule::default()).await
//! }
//! ```
//!
//! `serve` registers with the host (echoing the verification token the
//! host placed in the environment at spawn time), runs any pending
//! upgrade scripts when `init` arrives, and then dispatches host calls
//! until the connection goes away.
//!
//! Never log to stdout from a module: stdout carries the packet stream.
//! Pass a `log_dir` in `init` and the runtime writes tracing output to a
//! rolling file instead.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::info;

use crate::message::{
    DiscoveredDevice, ExecuteActionParams, HostMethod, InitParams, InitResult, LogLevel,
    LogMessageParams, ModuleCapabilities, ModuleManifest, ModuleMethod, RegisterParams,
    RegisterResult, ConnectionStatus, SetVariableValuesParams, UpdateConfigParams,
    UpdateFeedbacksParams, UpdateStatusParams, VERIFY_TOKEN_ENV,
};
use crate::transport::{HandlerTable, IpcTransport, TransportOptions};
use crate::upgrades::{UpgradeScript, run_upgrades};
use crate::wire::ErrorPayload;

/// How long a module waits for the host to accept its registration.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

// -----------------------------------------------------------------------------
// ModuleHandler trait - implement this in your module
// -----------------------------------------------------------------------------

#[async_trait]
pub trait ModuleHandler: Send + 'static {
    /// Identity and protocol version this module was built against.
    fn manifest(&self) -> ModuleManifest;

    /// Optional features; the host never sends a call you did not declare.
    fn capabilities(&self) -> ModuleCapabilities {
        ModuleCapabilities::default()
    }

    /// Ordered migration steps for persisted actions/feedbacks/config.
    fn upgrade_scripts(&self) -> Vec<UpgradeScript> {
        Vec::new()
    }

    /// Bring the integration up with its (already migrated) config.
    async fn init(&mut self, ctx: ModuleContext, config: Value) -> Result<()>;

    /// Tear down before the process exits.
    async fn destroy(&mut self) -> Result<()> {
        Ok(())
    }

    async fn config_updated(&mut self, _ctx: ModuleContext, _config: Value) -> Result<()> {
        Ok(())
    }

    async fn execute_action(&mut self, ctx: ModuleContext, action: ExecuteActionParams)
    -> Result<Value>;

    async fn update_feedbacks(
        &mut self,
        _ctx: ModuleContext,
        _params: UpdateFeedbacksParams,
    ) -> Result<Value> {
        Ok(Value::Null)
    }

    async fn scan_devices(&mut self, _ctx: ModuleContext) -> Result<Vec<DiscoveredDevice>> {
        bail!("module does not support device discovery")
    }
}

// -----------------------------------------------------------------------------
// ModuleContext - the module's handle back to the host
// -----------------------------------------------------------------------------

/// Cloneable handle a handler uses to push notifications to the host.
#[derive(Clone)]
pub struct ModuleContext {
    transport: IpcTransport,
}

impl ModuleContext {
    fn new(transport: IpcTransport) -> Self {
        Self { transport }
    }

    pub fn update_status(&self, status: ConnectionStatus, message: Option<String>) {
        let params = UpdateStatusParams { status, message };
        let _ = self
            .transport
            .call_no_reply(HostMethod::UpdateStatus.as_ref(), json!(params));
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let params = LogMessageParams {
            level,
            message: message.into(),
        };
        let _ = self
            .transport
            .call_no_reply(HostMethod::LogMessage.as_ref(), json!(params));
    }

    pub fn set_variable_values(&self, values: std::collections::HashMap<String, Value>) {
        let params = SetVariableValuesParams { values };
        let _ = self
            .transport
            .call_no_reply(HostMethod::SetVariableValues.as_ref(), json!(params));
    }
}

// -----------------------------------------------------------------------------
// Serve loop
// -----------------------------------------------------------------------------

/// Run the module over the process's stdin/stdout until the host goes away.
pub async fn serve<H: ModuleHandler>(handler: H) -> Result<()> {
    let token = std::env::var(VERIFY_TOKEN_ENV).ok();
    serve_with_io(handler, tokio::io::stdin(), tokio::io::stdout(), token).await
}

/// IO-generic serve loop; tests drive it over in-memory pipes.
pub async fn serve_with_io<H, R, W>(
    handler: H,
    reader: R,
    writer: W,
    token: Option<String>,
) -> Result<()>
where
    H: ModuleHandler,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let manifest = handler.manifest();
    let capabilities = handler.capabilities();
    let scripts: Arc<Vec<UpgradeScript>> = Arc::new(handler.upgrade_scripts());
    let state = Arc::new(Mutex::new(handler));

    // Handlers are built before the transport exists, so the context they
    // hand to the module is filled in right after attach.
    let ctx_slot: Arc<OnceLock<ModuleContext>> = Arc::new(OnceLock::new());

    let handlers = module_handlers(Arc::clone(&state), Arc::clone(&ctx_slot), scripts);
    let transport = IpcTransport::attach(reader, writer, handlers, TransportOptions::default());
    let _ = ctx_slot.set(ModuleContext::new(transport.clone()));

    let params = RegisterParams {
        manifest_version: manifest.version.clone(),
        verification_token: token.unwrap_or_default(),
        capabilities,
    };
    let reply = transport
        .call_with_timeout(HostMethod::Register.as_ref(), json!(params), REGISTER_TIMEOUT)
        .await
        .with_context(|| format!("registration of module `{}` refused", manifest.id))?;
    let accepted: RegisterResult =
        serde_json::from_value(reply).context("malformed registration reply")?;
    info!(
        "module `{}` registered against host {}",
        manifest.id, accepted.host_version
    );

    // serve until EOF / host exit
    transport.closed().await;
    Ok(())
}

fn module_handlers<H: ModuleHandler>(
    state: Arc<Mutex<H>>,
    ctx_slot: Arc<OnceLock<ModuleContext>>,
    scripts: Arc<Vec<UpgradeScript>>,
) -> HandlerTable<ModuleMethod> {
    HandlerTable::new()
        .on(ModuleMethod::Init, {
            let state = Arc::clone(&state);
            let ctx_slot = Arc::clone(&ctx_slot);
            move |payload| {
                let state = Arc::clone(&state);
                let ctx_slot = Arc::clone(&ctx_slot);
                let scripts = Arc::clone(&scripts);
                async move {
                    let params: InitParams = parse_params(payload)?;
                    init_module_tracing(params.log_level, params.log_dir.as_deref());

                    let default_index = params.last_upgrade_index.unwrap_or(-1);
                    let outcome = run_upgrades(
                        params.actions,
                        params.feedbacks,
                        params.config.clone(),
                        default_index,
                        &scripts,
                    );
                    let config = outcome.config.clone().unwrap_or(params.config);

                    let ctx = context(&ctx_slot)?;
                    state.lock().await.init(ctx, config).await.map_err(ErrorPayload::from)?;

                    let result = InitResult {
                        updated_config: outcome.config,
                        updated_actions: outcome.actions,
                        updated_feedbacks: outcome.feedbacks,
                        upgrade_index: outcome.upgrade_index,
                    };
                    Ok(json!(result))
                }
            }
        })
        .on(ModuleMethod::Destroy, {
            let state = Arc::clone(&state);
            move |_| {
                let state = Arc::clone(&state);
                async move {
                    state.lock().await.destroy().await.map_err(ErrorPayload::from)?;
                    Ok(Value::Null)
                }
            }
        })
        .on(ModuleMethod::UpdateConfig, {
            let state = Arc::clone(&state);
            let ctx_slot = Arc::clone(&ctx_slot);
            move |payload| {
                let state = Arc::clone(&state);
                let ctx_slot = Arc::clone(&ctx_slot);
                async move {
                    let params: UpdateConfigParams = parse_params(payload)?;
                    let ctx = context(&ctx_slot)?;
                    state
                        .lock()
                        .await
                        .config_updated(ctx, params.config)
                        .await
                        .map_err(ErrorPayload::from)?;
                    Ok(Value::Null)
                }
            }
        })
        .on(ModuleMethod::ExecuteAction, {
            let state = Arc::clone(&state);
            let ctx_slot = Arc::clone(&ctx_slot);
            move |payload| {
                let state = Arc::clone(&state);
                let ctx_slot = Arc::clone(&ctx_slot);
                async move {
                    let params: ExecuteActionParams = parse_params(payload)?;
                    let ctx = context(&ctx_slot)?;
                    state
                        .lock()
                        .await
                        .execute_action(ctx, params)
                        .await
                        .map_err(ErrorPayload::from)
                }
            }
        })
        .on(ModuleMethod::UpdateFeedbacks, {
            let state = Arc::clone(&state);
            let ctx_slot = Arc::clone(&ctx_slot);
            move |payload| {
                let state = Arc::clone(&state);
                let ctx_slot = Arc::clone(&ctx_slot);
                async move {
                    let params: UpdateFeedbacksParams = parse_params(payload)?;
                    let ctx = context(&ctx_slot)?;
                    state
                        .lock()
                        .await
                        .update_feedbacks(ctx, params)
                        .await
                        .map_err(ErrorPayload::from)
                }
            }
        })
        .on(ModuleMethod::ScanDevices, {
            let state = Arc::clone(&state);
            let ctx_slot = Arc::clone(&ctx_slot);
            move |_| {
                let state = Arc::clone(&state);
                let ctx_slot = Arc::clone(&ctx_slot);
                async move {
                    let ctx = context(&ctx_slot)?;
                    let devices = state
                        .lock()
                        .await
                        .scan_devices(ctx)
                        .await
                        .map_err(ErrorPayload::from)?;
                    Ok(json!(crate::message::ScanDevicesResult { devices }))
                }
            }
        })
}

fn parse_params<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, ErrorPayload> {
    serde_json::from_value(payload).map_err(|err| ErrorPayload::new(format!("invalid params: {err}")))
}

fn context(slot: &OnceLock<ModuleContext>) -> Result<ModuleContext, ErrorPayload> {
    slot.get()
        .cloned()
        .ok_or_else(|| ErrorPayload::new("module is still attaching"))
}

/// File-only tracing. Stdout is the packet stream, so a console layer
/// would corrupt the protocol; without a log dir the module stays silent.
fn init_module_tracing(level: LogLevel, log_dir: Option<&std::path::Path>) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    static LOG_INIT: std::sync::Once = std::sync::Once::new();
    LOG_INIT.call_once(|| {
        let Some(dir) = log_dir else { return };
        if std::fs::create_dir_all(dir).is_err() {
            return;
        }
        let filter = match level {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        let appender = tracing_appender::rolling::daily(dir, "module.log");
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(filter))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(appender),
            )
            .try_init();
    });
}

// keep the anyhow error type available to modules without a direct dep
pub use anyhow::Error as ModuleError;
