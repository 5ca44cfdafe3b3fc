//! One configured module instance: a supervised worker process plus the
//! transport, registration state and application-call surface on top.
//!
//! The instance owns exactly one {Supervisor, IpcTransport} pair. Every
//! (re)spawn produces a fresh transport wired to the new child's stdio;
//! nothing from a previous process is ever reused. A driver task follows
//! the supervisor's events and the registration outcome and moves the
//! lifecycle machine:
//!
//! `Starting -> AwaitingRegistration -> {Ready | Incompatible}` with
//! crashes looping back through `Starting` until the supervisor gives up.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use module_plugin::message::{
    ConnectionStatus, DiscoveredDevice, INSTANCE_ID_ENV, InitParams, InitResult, HostMethod,
    LogLevel, LogMessageParams, ModuleCapabilities, ModuleKind, ModuleMethod, RegisterParams,
    RegisterResult, ScanDevicesResult, SetVariableValuesParams, UpdateConfigParams,
    UpdateStatusParams, VERIFY_TOKEN_ENV,
};
use module_plugin::transport::{HandlerTable, IpcTransport, TransportOptions};
use module_plugin::wire::ErrorPayload;

use crate::config::InstanceConfig;
use crate::error::HostError;
use crate::host::registration::RegistrationGate;
use crate::host::supervisor::{
    CommandFactory, ProcessSnapshot, RestartPolicy, SpawnedProcess, Supervisor, SupervisorEvent,
    kill_tree,
};

/// Modules get a little longer for `init`: they may be opening sockets
/// or enumerating hardware.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);
const DESTROY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceLifecycle {
    Starting,
    AwaitingRegistration,
    Ready,
    /// Registration failed on version grounds; retrying cannot help.
    Incompatible,
    /// The supervisor gave up restarting it.
    Crashed,
    Stopping,
    Stopped,
}

/// Host-visible happenings, one stream per [`crate::host::ModuleHost`].
#[derive(Debug, Clone)]
pub enum HostEvent {
    Lifecycle {
        instance_id: String,
        lifecycle: InstanceLifecycle,
    },
    Status {
        instance_id: String,
        status: ConnectionStatus,
        message: Option<String>,
    },
    Variables {
        instance_id: String,
        values: HashMap<String, Value>,
    },
    /// Upgrade scripts ran during init; the caller should persist this.
    ConfigMigrated {
        instance_id: String,
        config: Value,
        upgrade_index: i64,
    },
}

#[derive(Debug, Clone)]
pub struct InstanceOptions {
    pub call_timeout: Duration,
    /// How long a fresh process gets to send `register`.
    pub handshake_window: Duration,
    pub restart_policy: RestartPolicy,
    /// Directory modules write their own log files into.
    pub module_log_dir: Option<PathBuf>,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            handshake_window: Duration::from_secs(15),
            restart_policy: RestartPolicy::default(),
            module_log_dir: None,
        }
    }
}

enum RegistrationOutcome {
    Accepted {
        /// Process the register came in on; a crash-and-respawn between
        /// acceptance and delivery must not mark the new spawn ready.
        pid: u32,
        capabilities: ModuleCapabilities,
    },
    Incompatible {
        reason: String,
    },
}

struct Attached {
    transport: IpcTransport,
    capabilities: Option<ModuleCapabilities>,
    pid: u32,
}

pub struct ModuleInstance {
    id: String,
    config: Mutex<InstanceConfig>,
    lifecycle: watch::Sender<InstanceLifecycle>,
    supervisor: Supervisor,
    attached: Mutex<Option<Attached>>,
    events: mpsc::UnboundedSender<HostEvent>,
    gate: RegistrationGate,
    options: InstanceOptions,
    /// Verification token of the current spawn; regenerated per spawn by
    /// the command factory, checked by the register handler.
    token: Arc<Mutex<String>>,
}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance").field("id", &self.id).finish_non_exhaustive()
    }
}

impl ModuleInstance {
    /// Create the instance and start its worker.
    pub fn launch(
        config: InstanceConfig,
        executable: PathBuf,
        gate: RegistrationGate,
        options: InstanceOptions,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> Arc<Self> {
        let id = config.id.clone();
        let token = Arc::new(Mutex::new(String::new()));

        let factory: CommandFactory = {
            let token = Arc::clone(&token);
            let id = id.clone();
            let extra_env = config.env.clone();
            Box::new(move || {
                // fresh token per spawn: a register from any other process
                // (stray, duplicate, or a zombie of the previous spawn)
                // will not match
                let fresh = Uuid::new_v4().to_string();
                *token.lock().unwrap() = fresh.clone();

                let mut command = tokio::process::Command::new(&executable);
                command.env(VERIFY_TOKEN_ENV, &fresh).env(INSTANCE_ID_ENV, &id);
                for (key, value) in &extra_env {
                    command.env(key, value);
                }
                command
            })
        };

        let (supervisor, supervisor_events) =
            Supervisor::new(id.clone(), factory, options.restart_policy.clone());
        let (lifecycle, _) = watch::channel(InstanceLifecycle::Starting);

        let instance = Arc::new(Self {
            id,
            config: Mutex::new(config),
            lifecycle,
            supervisor,
            attached: Mutex::new(None),
            events,
            gate,
            options,
            token,
        });

        // the driver only holds a weak reference: when the last real
        // handle goes away the supervisor (and with it the worker) is
        // torn down and the driver ends
        tokio::spawn(Self::drive(Arc::downgrade(&instance), supervisor_events));
        instance.set_lifecycle(InstanceLifecycle::Starting);
        instance.supervisor.start();
        instance
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn lifecycle(&self) -> InstanceLifecycle {
        *self.lifecycle.borrow()
    }

    pub fn lifecycle_watch(&self) -> watch::Receiver<InstanceLifecycle> {
        self.lifecycle.subscribe()
    }

    pub fn diagnostics(&self) -> InstanceDiagnostics {
        let config = self.config.lock().unwrap();
        InstanceDiagnostics {
            id: self.id.clone(),
            module_id: config.module_id.clone(),
            kind: config.kind,
            lifecycle: self.lifecycle(),
            process: self.supervisor.snapshot(),
        }
    }

    /// Manual path out of `Crashed` or `Incompatible`.
    pub fn restart(&self) {
        info!("manual restart of instance `{}`", self.id);
        self.set_lifecycle(InstanceLifecycle::Starting);
        self.supervisor.start();
    }

    /// Stop the worker: polite `destroy`, then supervise the shutdown.
    pub async fn stop(&self) {
        self.set_lifecycle(InstanceLifecycle::Stopping);
        if let Some(transport) = self.current_transport() {
            let _ = transport
                .call_with_timeout(ModuleMethod::Destroy.as_ref(), Value::Null, DESTROY_TIMEOUT)
                .await;
        }
        self.supervisor.stop().await;
        self.set_lifecycle(InstanceLifecycle::Stopped);
    }

    // -------------------------------------------------------------------------
    // Application calls
    // -------------------------------------------------------------------------

    pub async fn execute_action(&self, action_id: &str, options: Value) -> Result<Value, HostError> {
        let (transport, _) = self.ready_transport()?;
        let params = json!(module_plugin::message::ExecuteActionParams {
            action_id: action_id.to_string(),
            options,
        });
        Ok(transport
            .call(ModuleMethod::ExecuteAction.as_ref(), params)
            .await?)
    }

    pub async fn update_config(&self, config: Value) -> Result<(), HostError> {
        let (transport, _) = self.ready_transport()?;
        transport
            .call(
                ModuleMethod::UpdateConfig.as_ref(),
                json!(UpdateConfigParams {
                    config: config.clone()
                }),
            )
            .await?;
        self.config.lock().unwrap().config = config;
        Ok(())
    }

    /// Capability-gated: never sent to a module that declared no scan
    /// support.
    pub async fn scan_devices(&self) -> Result<Vec<DiscoveredDevice>, HostError> {
        let (transport, capabilities) = self.ready_transport()?;
        if !capabilities.supports_scan {
            return Err(HostError::UnsupportedCapability {
                id: self.id.clone(),
                capability: "scanDevices",
            });
        }
        let reply = transport
            .call(ModuleMethod::ScanDevices.as_ref(), Value::Null)
            .await?;
        let result: ScanDevicesResult =
            serde_json::from_value(reply).map_err(|err| HostError::BadReply(err.to_string()))?;
        Ok(result.devices)
    }

    /// Raw passthrough for the action/feedback engine layered on top.
    pub async fn call_raw(&self, name: &str, payload: Value) -> Result<Value, HostError> {
        let (transport, _) = self.ready_transport()?;
        Ok(transport.call(name, payload).await?)
    }

    fn ready_transport(&self) -> Result<(IpcTransport, ModuleCapabilities), HostError> {
        let lifecycle = self.lifecycle();
        if lifecycle != InstanceLifecycle::Ready {
            return Err(HostError::NotReady {
                id: self.id.clone(),
                lifecycle,
            });
        }
        let attached = self.attached.lock().unwrap();
        match attached.as_ref() {
            Some(Attached {
                transport,
                capabilities: Some(capabilities),
                ..
            }) => Ok((transport.clone(), capabilities.clone())),
            _ => Err(HostError::NotReady {
                id: self.id.clone(),
                lifecycle,
            }),
        }
    }

    fn current_transport(&self) -> Option<IpcTransport> {
        self.attached
            .lock()
            .unwrap()
            .as_ref()
            .map(|a| a.transport.clone())
    }

    // -------------------------------------------------------------------------
    // Driver
    // -------------------------------------------------------------------------

    async fn drive(
        instance: Weak<Self>,
        mut supervisor_events: mpsc::UnboundedReceiver<SupervisorEvent>,
    ) {
        let (registration_tx, mut registration_rx) =
            mpsc::unbounded_channel::<RegistrationOutcome>();

        loop {
            tokio::select! {
                event = supervisor_events.recv() => {
                    let Some(this) = instance.upgrade() else { break };
                    match event {
                        Some(SupervisorEvent::Spawned(io)) => this.on_spawned(io, &registration_tx),
                        Some(SupervisorEvent::Exited { code, crash }) => this.on_exited(code, crash),
                        Some(SupervisorEvent::Sleeping { delay, attempt }) => {
                            debug!(
                                "instance `{}` respawn attempt {attempt} in {delay:?}",
                                this.id
                            );
                        }
                        Some(SupervisorEvent::Crashed) => {
                            warn!("instance `{}` abandoned after repeated crashes", this.id);
                            this.set_lifecycle(InstanceLifecycle::Crashed);
                        }
                        Some(SupervisorEvent::ForceKilled) => {
                            warn!("instance `{}` had to be force-killed", this.id);
                        }
                        Some(SupervisorEvent::Stopped) => {
                            if this.lifecycle() == InstanceLifecycle::Stopping {
                                this.set_lifecycle(InstanceLifecycle::Stopped);
                            }
                        }
                        None => break,
                    }
                },
                Some(outcome) = registration_rx.recv() => {
                    let Some(this) = instance.upgrade() else { break };
                    match outcome {
                        RegistrationOutcome::Accepted { pid, capabilities } => {
                            this.on_registered(pid, capabilities)
                        }
                        RegistrationOutcome::Incompatible { reason } => {
                            warn!("instance `{}` is incompatible: {reason}", this.id);
                            this.set_lifecycle(InstanceLifecycle::Incompatible);
                            // same version would fail the same way; stop
                            // instead of letting the restart policy spin
                            tokio::spawn(async move { this.supervisor.stop().await });
                        }
                    }
                },
            }
        }
    }

    fn on_spawned(
        self: &Arc<Self>,
        io: SpawnedProcess,
        registration_tx: &mpsc::UnboundedSender<RegistrationOutcome>,
    ) {
        let pid = io.pid;
        let handlers = self.host_handlers(registration_tx.clone(), pid);
        let transport = IpcTransport::attach(
            io.stdout,
            io.stdin,
            handlers,
            TransportOptions {
                default_timeout: self.options.call_timeout,
            },
        );
        *self.attached.lock().unwrap() = Some(Attached {
            transport: transport.clone(),
            capabilities: None,
            pid,
        });
        self.set_lifecycle(InstanceLifecycle::AwaitingRegistration);

        // handshake watchdog: a worker that never registers is killed and
        // goes through the ordinary crash path
        let instance = Arc::clone(self);
        let window = self.options.handshake_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let still_waiting = instance.lifecycle() == InstanceLifecycle::AwaitingRegistration
                && instance
                    .attached
                    .lock()
                    .unwrap()
                    .as_ref()
                    .is_some_and(|a| a.pid == pid);
            if still_waiting {
                warn!(
                    "instance `{}` did not register within {window:?}, killing it",
                    instance.id
                );
                kill_tree(pid, true).await;
            }
        });

        // transport watchdog: a lost or garbled stream while the process
        // lives counts as a crash
        let instance = Arc::clone(self);
        tokio::spawn(async move {
            transport.closed().await;
            let snapshot = instance.supervisor.snapshot();
            if snapshot.pid == Some(pid)
                && snapshot.status == crate::host::supervisor::ProcessStatus::Running
            {
                warn!(
                    "instance `{}` lost its transport while running, killing pid {pid}",
                    instance.id
                );
                kill_tree(pid, true).await;
            }
        });
    }

    fn on_exited(&self, code: Option<i32>, crash: bool) {
        // the old handle is dead; drop it so nothing can use it again
        *self.attached.lock().unwrap() = None;
        if crash {
            debug!("instance `{}` process exited (code {code:?})", self.id);
            let lifecycle = self.lifecycle();
            if !matches!(
                lifecycle,
                InstanceLifecycle::Stopping
                    | InstanceLifecycle::Stopped
                    | InstanceLifecycle::Incompatible
                    | InstanceLifecycle::Crashed
            ) {
                self.set_lifecycle(InstanceLifecycle::Starting);
            }
        }
    }

    fn on_registered(self: &Arc<Self>, pid: u32, capabilities: ModuleCapabilities) {
        {
            let mut attached = self.attached.lock().unwrap();
            match attached.as_mut() {
                Some(a) if a.pid == pid => a.capabilities = Some(capabilities),
                // the registering process already went away again
                _ => return,
            }
        }
        info!("instance `{}` registered and ready", self.id);
        self.set_lifecycle(InstanceLifecycle::Ready);

        let instance = Arc::clone(self);
        tokio::spawn(async move { instance.run_init().await });
    }

    /// First application call after registration: ship config and any
    /// persisted records through the module's upgrade scripts.
    async fn run_init(self: Arc<Self>) {
        let Some(transport) = self.current_transport() else {
            return;
        };
        let params = {
            let config = self.config.lock().unwrap();
            InitParams {
                config: config.config.clone(),
                actions: config.actions.clone(),
                feedbacks: config.feedbacks.clone(),
                last_upgrade_index: config.schema_version,
                log_level: LogLevel::Info,
                log_dir: self.options.module_log_dir.clone(),
            }
        };

        match transport
            .call_with_timeout(ModuleMethod::Init.as_ref(), json!(params), INIT_TIMEOUT)
            .await
        {
            Ok(reply) => match serde_json::from_value::<InitResult>(reply) {
                Ok(result) => self.on_init_result(result),
                Err(err) => warn!("instance `{}` sent a malformed init reply: {err}", self.id),
            },
            Err(err) => {
                warn!("init of instance `{}` failed: {err}", self.id);
                let _ = self.events.send(HostEvent::Status {
                    instance_id: self.id.clone(),
                    status: ConnectionStatus::UnknownError,
                    message: Some(format!("init failed: {err}")),
                });
            }
        }
    }

    fn on_init_result(&self, result: InitResult) {
        let migrated = result.updated_config.is_some()
            || !result.updated_actions.is_empty()
            || !result.updated_feedbacks.is_empty();
        let config_for_event = {
            let mut config = self.config.lock().unwrap();
            if let Some(updated) = result.updated_config {
                config.config = updated;
            }
            for (id, record) in result.updated_actions {
                config.actions.insert(id, record);
            }
            for (id, record) in result.updated_feedbacks {
                config.feedbacks.insert(id, record);
            }
            config.schema_version = Some(result.upgrade_index);
            config.config.clone()
        };
        if migrated {
            let _ = self.events.send(HostEvent::ConfigMigrated {
                instance_id: self.id.clone(),
                config: config_for_event,
                upgrade_index: result.upgrade_index,
            });
        }
    }

    // -------------------------------------------------------------------------
    // Inbound handlers
    // -------------------------------------------------------------------------

    fn host_handlers(
        &self,
        registration_tx: mpsc::UnboundedSender<RegistrationOutcome>,
        pid: u32,
    ) -> HandlerTable<HostMethod> {
        let instance_id = self.id.clone();
        let gate = self.gate.clone();
        let expected_token = Arc::clone(&self.token);
        let events = self.events.clone();

        HandlerTable::new()
            .on(HostMethod::Register, {
                let instance_id = instance_id.clone();
                move |payload| {
                    let gate = gate.clone();
                    let expected_token = Arc::clone(&expected_token);
                    let registration_tx = registration_tx.clone();
                    let instance_id = instance_id.clone();
                    async move {
                        let params: RegisterParams = serde_json::from_value(payload)
                            .map_err(|err| ErrorPayload::new(format!("invalid register: {err}")))?;

                        let expected = expected_token.lock().unwrap().clone();
                        if params.verification_token != expected {
                            warn!(
                                "instance `{instance_id}` got a register with a stale or \
                                 foreign token, rejecting"
                            );
                            return Err(ErrorPayload::new("verification token mismatch"));
                        }

                        match gate.check(&params.manifest_version) {
                            Ok(_) => {
                                let _ = registration_tx.send(RegistrationOutcome::Accepted {
                                    pid,
                                    capabilities: params.capabilities,
                                });
                                Ok(json!(RegisterResult {
                                    host_version: gate.host_version().to_string(),
                                }))
                            }
                            Err(err) => {
                                let reason = err.to_string();
                                let _ = registration_tx.send(RegistrationOutcome::Incompatible {
                                    reason: reason.clone(),
                                });
                                Err(ErrorPayload::new(reason))
                            }
                        }
                    }
                }
            })
            .on(HostMethod::UpdateStatus, {
                let instance_id = instance_id.clone();
                let events = events.clone();
                move |payload| {
                    let instance_id = instance_id.clone();
                    let events = events.clone();
                    async move {
                        let params: UpdateStatusParams = serde_json::from_value(payload)
                            .map_err(|err| ErrorPayload::new(format!("invalid status: {err}")))?;
                        let _ = events.send(HostEvent::Status {
                            instance_id,
                            status: params.status,
                            message: params.message,
                        });
                        Ok(Value::Null)
                    }
                }
            })
            .on(HostMethod::LogMessage, {
                let instance_id = instance_id.clone();
                move |payload| {
                    let instance_id = instance_id.clone();
                    async move {
                        let params: LogMessageParams = serde_json::from_value(payload)
                            .map_err(|err| ErrorPayload::new(format!("invalid log: {err}")))?;
                        match params.level {
                            LogLevel::Trace => debug!("[{instance_id}] {}", params.message),
                            LogLevel::Debug => debug!("[{instance_id}] {}", params.message),
                            LogLevel::Info => info!("[{instance_id}] {}", params.message),
                            LogLevel::Warn => warn!("[{instance_id}] {}", params.message),
                            LogLevel::Error => {
                                tracing::error!("[{instance_id}] {}", params.message)
                            }
                        }
                        Ok(Value::Null)
                    }
                }
            })
            .on(HostMethod::SetVariableValues, {
                move |payload| {
                    let instance_id = instance_id.clone();
                    let events = events.clone();
                    async move {
                        let params: SetVariableValuesParams = serde_json::from_value(payload)
                            .map_err(|err| {
                                ErrorPayload::new(format!("invalid variables: {err}"))
                            })?;
                        let _ = events.send(HostEvent::Variables {
                            instance_id,
                            values: params.values,
                        });
                        Ok(Value::Null)
                    }
                }
            })
    }

    fn set_lifecycle(&self, lifecycle: InstanceLifecycle) {
        let changed = self.lifecycle.send_if_modified(|current| {
            if *current == lifecycle {
                false
            } else {
                *current = lifecycle;
                true
            }
        });
        if changed {
            let _ = self.events.send(HostEvent::Lifecycle {
                instance_id: self.id.clone(),
                lifecycle,
            });
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstanceDiagnostics {
    pub id: String,
    pub module_id: String,
    pub kind: ModuleKind,
    pub lifecycle: InstanceLifecycle,
    pub process: ProcessSnapshot,
}
