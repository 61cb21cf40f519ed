//! Instance Manager (C1): boot, load, yield/resume, halt VM instances; set
//! and fire snapshot checkpoints. Specified as an external collaborator
//! (§6) — the dispatcher depends only on the [`InstanceManager`] trait.
//!
//! This module also ships the process-backed reference implementation
//! described in SPEC_FULL.md §10 ("Supplemented feature"): it is not a
//! production unikernel driver, it exists so C2-C7 can be driven end to end
//! in tests without a real hypervisor, the same role `faas-guest-agent`
//! plays for the teacher crate's container/VM execution paths.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::EngineError;
use crate::wire;

/// Handle to a post-init VM image produced at a checkpoint. Owned by the
/// snapshot cache; never mutated after first publish.
#[derive(Debug, Clone)]
pub struct Snapshot {
    id: Uuid,
    code: String,
}

impl Snapshot {
    #[cfg(test)]
    pub fn new_for_test(code: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: code.to_string(),
        }
    }
}

/// Handle to a live VM state created by C1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(Uuid);

impl InstanceId {
    #[cfg(test)]
    pub fn from_uuid_for_test(id: Uuid) -> Self {
        Self(id)
    }
}

/// A not-yet-loaded VM description: either the embedded base image or a
/// clone of a previously published snapshot.
pub enum Instance {
    Base,
    FromSnapshot(Snapshot),
}

/// Everything the dispatcher needs back from a successful `load`.
pub struct LoadedInstance {
    pub id: InstanceId,
    pub addr: SocketAddr,
}

/// The narrow boundary C6 depends on. A production implementation drives a
/// real unikernel hypervisor; see the module doc for the reference impl
/// shipped here.
#[async_trait]
pub trait InstanceManager: Send + Sync {
    async fn load(&self, instance: Instance) -> Result<LoadedInstance, EngineError>;
    async fn start(&self, id: InstanceId) -> Result<(), EngineError>;
    async fn yield_instance(&self, id: InstanceId) -> Result<(), EngineError>;
    async fn resume(&self, id: InstanceId) -> Result<(), EngineError>;
    async fn halt(&self, id: InstanceId) -> Result<(), EngineError>;
    /// Arms a checkpoint at the instance's initialization breakpoint and
    /// waits for it to fire, returning the resulting post-init snapshot.
    async fn set_checkpoint(&self, id: InstanceId) -> Result<Snapshot, EngineError>;
    fn clone_from(&self, snapshot: &Snapshot) -> Instance;
    fn base_instance(&self) -> Instance;
}

enum VmCommand {
    Halt,
}

struct RunningInstance {
    commands: Mutex<Option<tokio::sync::mpsc::Sender<VmCommand>>>,
    checkpoint_rx: Mutex<Option<oneshot::Receiver<Snapshot>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Spawns one loopback TCP listener per "instance", each speaking just
/// enough of the §6 `/init` + `/run` protocol to drive the dispatcher
/// through cold/warm/hot paths.
pub struct ProcessInstanceManager {
    next_port: AtomicU16,
    instances: Mutex<HashMap<InstanceId, Arc<RunningInstance>>>,
}

impl ProcessInstanceManager {
    pub fn new(base_port: u16) -> Self {
        Self {
            next_port: AtomicU16::new(base_port),
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn reserve_port(&self) -> u16 {
        self.next_port.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl InstanceManager for ProcessInstanceManager {
    #[instrument(skip(self, instance))]
    async fn load(&self, instance: Instance) -> Result<LoadedInstance, EngineError> {
        let initial_code = match instance {
            Instance::Base => None,
            Instance::FromSnapshot(snap) => Some(snap.code),
        };

        let port = self.reserve_port();
        let addr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| EngineError::InstanceManager(format!("bind {addr}: {e}")))?;

        let id = InstanceId(Uuid::new_v4());
        let (cmd_tx, cmd_rx) = tokio::sync::mpsc::channel(4);
        let (checkpoint_tx, checkpoint_rx) = oneshot::channel();

        let task = tokio::spawn(run_stub_vm(listener, initial_code, cmd_rx, checkpoint_tx));

        let running = Arc::new(RunningInstance {
            commands: Mutex::new(Some(cmd_tx)),
            checkpoint_rx: Mutex::new(Some(checkpoint_rx)),
            task: Mutex::new(Some(task)),
        });
        self.instances.lock().await.insert(id, running);
        debug!(?id, %addr, "instance loaded");
        Ok(LoadedInstance { id, addr })
    }

    async fn start(&self, id: InstanceId) -> Result<(), EngineError> {
        self.require_known(id).await
    }

    async fn yield_instance(&self, id: InstanceId) -> Result<(), EngineError> {
        self.require_known(id).await
    }

    async fn resume(&self, id: InstanceId) -> Result<(), EngineError> {
        self.require_known(id).await
    }

    #[instrument(skip(self))]
    async fn halt(&self, id: InstanceId) -> Result<(), EngineError> {
        let running = self.instances.lock().await.remove(&id);
        let Some(running) = running else {
            return Ok(());
        };
        if let Some(tx) = running.commands.lock().await.take() {
            let _ = tx.send(VmCommand::Halt).await;
        }
        if let Some(task) = running.task.lock().await.take() {
            task.abort();
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_checkpoint(&self, id: InstanceId) -> Result<Snapshot, EngineError> {
        let rx = {
            let instances = self.instances.lock().await;
            let running = instances
                .get(&id)
                .ok_or_else(|| EngineError::InstanceManager(format!("unknown instance {id:?}")))?;
            running
                .checkpoint_rx
                .lock()
                .await
                .take()
                .ok_or_else(|| {
                    EngineError::InstanceManager(
                        "checkpoint already armed or already fired".to_string(),
                    )
                })?
        };
        rx.await
            .map_err(|_| EngineError::InstanceManager("instance halted before checkpoint fired".to_string()))
    }

    fn clone_from(&self, snapshot: &Snapshot) -> Instance {
        Instance::FromSnapshot(snapshot.clone())
    }

    fn base_instance(&self) -> Instance {
        Instance::Base
    }
}

impl ProcessInstanceManager {
    async fn require_known(&self, id: InstanceId) -> Result<(), EngineError> {
        if self.instances.lock().await.contains_key(&id) {
            Ok(())
        } else {
            Err(EngineError::InstanceManager(format!("unknown instance {id:?}")))
        }
    }
}

/// Runs one simulated VM's HTTP loop: accepts a connection, serves
/// `/init` then `/run` on it (or `/run` alone for warm/hot paths), and
/// fires the checkpoint the first time `/init` completes successfully.
async fn run_stub_vm(
    listener: TcpListener,
    mut code: Option<String>,
    mut commands: tokio::sync::mpsc::Receiver<VmCommand>,
    checkpoint_tx: oneshot::Sender<Snapshot>,
) {
    let mut checkpoint_tx = Some(checkpoint_tx);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                handle_connection(stream, &mut code, &mut checkpoint_tx).await;
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(VmCommand::Halt) | None => break,
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    code: &mut Option<String>,
    checkpoint_tx: &mut Option<oneshot::Sender<Snapshot>>,
) {
    loop {
        let request = match wire::read_http_request(&mut stream).await {
            Ok(Some(req)) => req,
            _ => break,
        };
        match request.path.as_str() {
            "/init" => {
                let new_code = extract_code(&request.body);
                *code = Some(new_code.clone());
                let _ = stream_write(&mut stream, &wire::http_ok(r#"{"OK":true}"#)).await;
                if let Some(tx) = checkpoint_tx.take() {
                    let _ = tx.send(Snapshot {
                        id: Uuid::new_v4(),
                        code: new_code,
                    });
                }
                if !request.keep_alive {
                    break;
                }
            }
            "/run" => {
                let args = extract_value(&request.body);
                let response = run_stub_code(code.as_deref().unwrap_or(""), &args).await;
                let _ = stream_write(&mut stream, &response).await;
                break;
            }
            _ => {
                let _ = stream_write(&mut stream, &wire::http_error(r#"{"err":"unknown path"}"#)).await;
                break;
            }
        }
    }
}

async fn stream_write(stream: &mut TcpStream, data: &str) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    stream.write_all(data.as_bytes()).await
}

/// Toy interpreter for the fixture functions exercised by the integration
/// scenarios: recognizes `a.<field>` in the source and echoes that field of
/// `args` back as `{"x": <value>}`; recognizes a busy-loop marker to
/// simulate a hang past the invocation deadline; recognizes a forced-error
/// marker to simulate a backend fault.
async fn run_stub_code(code: &str, args: &serde_json::Value) -> String {
    if code.contains("while(true)") || code.contains("while (true)") {
        // Simulate an instance that never returns within any reasonable
        // deadline; the session's invocation timeout fires first.
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        return wire::http_ok("{}");
    }
    if code.contains("/*FAIL_RUN*/") {
        return wire::http_error(r#"{"err":"boom"}"#);
    }

    let field = extract_field_access(code);
    let value = field
        .and_then(|f| args.get(&f).cloned())
        .unwrap_or(serde_json::Value::Null);
    let body = serde_json::json!({ "x": value }).to_string();
    wire::http_ok(&body)
}

fn extract_field_access(code: &str) -> Option<String> {
    let idx = code.find("a.")?;
    let rest = &code[idx + 2..];
    let end = rest
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    let field = &rest[..end];
    if field.is_empty() {
        None
    } else {
        Some(field.to_string())
    }
}

fn extract_code(init_body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(init_body)
        .ok()
        .and_then(|v| v.get("value")?.get("code")?.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn extract_value(run_body: &str) -> serde_json::Value {
    serde_json::from_str::<serde_json::Value>(run_body)
        .ok()
        .and_then(|v| v.get("value").cloned())
        .unwrap_or(serde_json::Value::Null)
}
