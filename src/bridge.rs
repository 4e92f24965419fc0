//! Bridge multiplexer: a `type -> handler` table populated once
//! at startup, served over a single connection by three long-running tasks
//! — reader, worker pool, writer — connected by `tokio::sync::mpsc`
//! channels, the same reader/worker/writer shape `vcontrol::server_main`
//! drives its control socket with.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::io::{split, AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::{self, Frame, MessageType, NOTIFICATION_TYPE};
use crate::container;
use crate::error::ErrorKind;
use crate::oci;
use crate::process::{ProcessHandle, ProcessRemoveCallback};
use crate::protocol::*;
use crate::registry::Registry;

/// The highest protocol version this build speaks.
const SUPPORTED_PROTOCOL_VERSION: u32 = 4;
const WORKER_COUNT: usize = 4;

/// Per-connection negotiation latch ("a version-negotiation
/// handler ... latches the connection's protocol version").
#[derive(Default)]
struct ConnectionState {
    negotiated: AtomicBool,
    version: AtomicU32,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = (u32, Value)> + Send>>;
pub type Handler = Arc<dyn Fn(Arc<Registry>, Arc<ConnectionState>, Frame) -> HandlerFuture + Send + Sync>;

struct Outbound {
    msg_type: u32,
    id: u32,
    body: Value,
}

/// Owns the handler table and, while a connection is being served, the
/// outbound queue used for both responses and published notifications.
pub struct Bridge {
    registry: Arc<Registry>,
    handlers: RwLock<HashMap<MessageType, Handler>>,
    outbound: AsyncMutex<Option<mpsc::UnboundedSender<Outbound>>>,
}

impl Bridge {
    pub fn new(registry: Arc<Registry>) -> Arc<Bridge> {
        let bridge = Arc::new(Bridge {
            registry,
            handlers: RwLock::new(HashMap::new()),
            outbound: AsyncMutex::new(None),
        });
        bridge.register_default_handlers();
        bridge
    }

    /// Registers (or overwrites, logging a warning) a handler for `msg_type`
    /// ("registration is single-writer; overwriting a registered
    /// type logs a warning"). Only called from `register_default_handlers`
    /// before `serve` starts.
    fn register(&self, msg_type: MessageType, handler: Handler) {
        let mut table = self.handlers.write().unwrap();
        if table.insert(msg_type, handler).is_some() {
            warn!(?msg_type, "overwriting previously registered handler");
        }
    }

    fn register_default_handlers(&self) {
        self.register(MessageType::NegotiateProtocol, Arc::new(|r, c, f| Box::pin(handle_negotiate(r, c, f))));
        self.register(MessageType::Create, Arc::new(|r, c, f| Box::pin(handle_create(r, c, f))));
        self.register(MessageType::Start, Arc::new(|r, c, f| Box::pin(handle_start(r, c, f))));
        self.register(MessageType::ExecuteProcess, Arc::new(|r, c, f| Box::pin(handle_execute_process(r, c, f))));
        self.register(MessageType::ShutdownGraceful, Arc::new(|r, c, f| Box::pin(handle_shutdown(r, c, f, true))));
        self.register(MessageType::ShutdownForced, Arc::new(|r, c, f| Box::pin(handle_shutdown(r, c, f, false))));
        self.register(MessageType::SignalProcess, Arc::new(|r, c, f| Box::pin(handle_signal_process(r, c, f))));
        self.register(MessageType::GetProperties, Arc::new(|r, c, f| Box::pin(handle_get_properties(r, c, f))));
        self.register(MessageType::WaitForProcess, Arc::new(|r, c, f| Box::pin(handle_wait_for_process(r, c, f))));
        self.register(MessageType::ResizeConsole, Arc::new(|r, c, f| Box::pin(handle_resize_console(r, c, f))));
        self.register(MessageType::ModifySettings, Arc::new(|r, c, f| Box::pin(handle_modify_settings(r, c, f))));
        self.register(MessageType::Delete, Arc::new(|r, c, f| Box::pin(handle_delete(r, c, f))));
    }

    /// Publishes an unsolicited notification ("a public publish
    /// call enqueues a notification on the same writer queue with `id = 0`").
    /// A no-op, logged at `warn!`, when no connection is currently being
    /// served.
    pub async fn publish_container_exit(&self, container_id: String, exit_code: i32) {
        let body = serde_json::to_value(ContainerExitNotification { container_id: container_id.clone(), exit_code })
            .expect("notification is always serializable");
        let sender = self.outbound.lock().await.clone();
        match sender {
            Some(tx) => {
                if tx.send(Outbound { msg_type: NOTIFICATION_TYPE, id: 0, body }).is_err() {
                    warn!(container_id, "failed to enqueue exit notification, writer task is gone");
                }
            }
            None => warn!(container_id, "dropping exit notification, no connection is being served"),
        }
    }

    /// Serves a single connection until the peer disconnects or a framing
    /// error occurs. Returns once reader, workers, and writer have all shut
    /// down cleanly.
    pub async fn serve<S>(self: &Arc<Self>, stream: S) -> Result<(), ErrorKind>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut read_half, mut write_half) = split(stream);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Frame>(64);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let inbound_rx = Arc::new(AsyncMutex::new(inbound_rx));
        let conn = Arc::new(ConnectionState::default());

        *self.outbound.lock().await = Some(outbound_tx.clone());

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = codec::write_frame(&mut write_half, msg.msg_type, msg.id, &msg.body).await {
                    error!(error = %e, "writer task failed, closing connection");
                    break;
                }
            }
        });

        let mut workers = Vec::with_capacity(WORKER_COUNT);
        for _ in 0..WORKER_COUNT {
            let inbound_rx = Arc::clone(&inbound_rx);
            let registry = Arc::clone(&self.registry);
            let conn = Arc::clone(&conn);
            let bridge = Arc::clone(self);
            let outbound_tx = outbound_tx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let frame = {
                        let mut rx = inbound_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(frame) = frame else { break };
                    let request_id = frame.id;
                    let (msg_type, body) = bridge.dispatch(Arc::clone(&registry), Arc::clone(&conn), frame).await;
                    if outbound_tx.send(Outbound { msg_type, id: request_id, body }).is_err() {
                        break;
                    }
                }
            }));
        }

        let result = loop {
            match codec::read_frame(&mut read_half).await {
                Ok(frame) => {
                    if inbound_tx.send(frame).await.is_err() {
                        break Err(ErrorKind::Protocol(anyhow::anyhow!("worker pool gone")));
                    }
                }
                Err(e) => {
                    info!(error = %e, "bridge connection closed");
                    break Ok(());
                }
            }
        };

        drop(inbound_tx);
        for worker in workers {
            let _ = worker.await;
        }
        drop(outbound_tx);
        let _ = writer.await;
        *self.outbound.lock().await = None;
        result
    }

    async fn dispatch(&self, registry: Arc<Registry>, conn: Arc<ConnectionState>, frame: Frame) -> (u32, Value) {
        let activity_id = Uuid::new_v4();
        let Some(message_type) = MessageType::from_raw(frame.msg_type) else {
            let e = ErrorKind::NotImplemented(anyhow::anyhow!("unrecognized message type {:#x}", frame.msg_type));
            return err_response::<CreateContainerResponse>(frame.msg_type | codec::RESPONSE_BIT, activity_id, &e);
        };

        if message_type != MessageType::NegotiateProtocol && !conn.negotiated.load(Ordering::SeqCst) {
            let e = ErrorKind::BadProtocolVersion(anyhow::anyhow!("negotiate protocol before issuing other requests"));
            return err_response::<CreateContainerResponse>(message_type.response_type(), activity_id, &e);
        }

        let requires_policy = !matches!(
            message_type,
            MessageType::NegotiateProtocol | MessageType::ModifySettings | MessageType::GetProperties
        );
        if requires_policy && !registry.policy_ready() {
            let e = ErrorKind::policy("no security policy loaded yet, request refused");
            return err_response::<CreateContainerResponse>(message_type.response_type(), activity_id, &e);
        }

        let handler = self.handlers.read().unwrap().get(&message_type).cloned();
        match handler {
            Some(handler) => handler(registry, conn, frame).await,
            None => {
                let e = ErrorKind::UnknownMessage(anyhow::anyhow!("no handler registered for {message_type:?}"));
                err_response::<CreateContainerResponse>(message_type.response_type(), activity_id, &e)
            }
        }
    }
}

fn ok_response<T: serde::Serialize + Default>(resp_type: u32, activity_id: Uuid, payload: T) -> (u32, Value) {
    (resp_type, serde_json::to_value(ResponseEnvelope::ok(activity_id, payload)).expect("response envelope is always serializable"))
}

fn err_response<T: serde::Serialize + Default>(resp_type: u32, activity_id: Uuid, error: &ErrorKind) -> (u32, Value) {
    (resp_type, serde_json::to_value(ResponseEnvelope::<T>::err(activity_id, error)).expect("error envelope is always serializable"))
}

async fn handle_negotiate(_registry: Arc<Registry>, conn: Arc<ConnectionState>, frame: Frame) -> (u32, Value) {
    let activity_id = Uuid::new_v4();
    let resp_type = MessageType::NegotiateProtocol.response_type();
    let req: NegotiateProtocolRequest = match frame.decode_json() {
        Ok(r) => r,
        Err(e) => return err_response::<NegotiateProtocolResponse>(resp_type, activity_id, &e),
    };

    if req.min_version > SUPPORTED_PROTOCOL_VERSION || req.max_version < SUPPORTED_PROTOCOL_VERSION {
        let e = ErrorKind::BadProtocolVersion(anyhow::anyhow!(
            "host supports [{}, {}], gcs supports {}",
            req.min_version,
            req.max_version,
            SUPPORTED_PROTOCOL_VERSION
        ));
        return err_response::<NegotiateProtocolResponse>(resp_type, activity_id, &e);
    }

    conn.negotiated.store(true, Ordering::SeqCst);
    conn.version.store(SUPPORTED_PROTOCOL_VERSION, Ordering::SeqCst);
    debug!(version = SUPPORTED_PROTOCOL_VERSION, "protocol negotiated");
    ok_response(resp_type, activity_id, NegotiateProtocolResponse { version: SUPPORTED_PROTOCOL_VERSION })
}

async fn handle_create(registry: Arc<Registry>, _conn: Arc<ConnectionState>, frame: Frame) -> (u32, Value) {
    let activity_id = Uuid::new_v4();
    let resp_type = MessageType::Create.response_type();
    let req: CreateContainerRequest = match frame.decode_json() {
        Ok(r) => r,
        Err(e) => return err_response::<CreateContainerResponse>(resp_type, activity_id, &e),
    };

    debug!(container_id = %req.container_id, role = ?req.settings.role, "create container");
    match container::create(&registry, req.settings).await {
        Ok(()) => ok_response(resp_type, activity_id, CreateContainerResponse::default()),
        Err(e) => {
            warn!(container_id = %req.container_id, error = %e, "create container failed");
            err_response::<CreateContainerResponse>(resp_type, activity_id, &e)
        }
    }
}

async fn handle_start(registry: Arc<Registry>, _conn: Arc<ConnectionState>, frame: Frame) -> (u32, Value) {
    let activity_id = Uuid::new_v4();
    let resp_type = MessageType::Start.response_type();
    let req: StartContainerRequest = match frame.decode_json() {
        Ok(r) => r,
        Err(e) => return err_response::<StartContainerResponse>(resp_type, activity_id, &e),
    };

    let container = match registry.get_created(&req.container_id) {
        Ok(c) => c,
        Err(e) => return err_response::<StartContainerResponse>(resp_type, activity_id, &e),
    };

    match container::start(&registry, &container).await {
        Ok(()) => ok_response(resp_type, activity_id, StartContainerResponse::default()),
        Err(e) => {
            warn!(container_id = %req.container_id, error = %e, "start container failed");
            err_response::<StartContainerResponse>(resp_type, activity_id, &e)
        }
    }
}

async fn handle_execute_process(registry: Arc<Registry>, _conn: Arc<ConnectionState>, frame: Frame) -> (u32, Value) {
    let activity_id = Uuid::new_v4();
    let resp_type = MessageType::ExecuteProcess.response_type();
    let req: ExecuteProcessSettings = match frame.decode_json() {
        Ok(r) => r,
        Err(e) => return err_response::<ExecuteProcessResponse>(resp_type, activity_id, &e),
    };

    let result = if req.container_id == UVM_CONTAINER_ID {
        exec_external(&registry, req.process_parameters).await
    } else {
        match registry.get(&req.container_id) {
            Some(container) => container::exec(&registry, &container, req.process_parameters).await,
            None => Err(ErrorKind::not_found_system(anyhow::anyhow!("container {} not registered", req.container_id))),
        }
    };

    match result {
        Ok(handle) => ok_response(resp_type, activity_id, ExecuteProcessResponse { process_id: handle.pid }),
        Err(e) => err_response::<ExecuteProcessResponse>(resp_type, activity_id, &e),
    }
}

/// Spawns a process directly in the UVM rather than inside a container
/// ("external process").
async fn exec_external(registry: &Arc<Registry>, spec: oci::Process) -> Result<Arc<ProcessHandle>, ErrorKind> {
    registry.policy.enforce_exec_external(&spec)?;

    let Some((program, args)) = spec.args.split_first() else {
        return Err(ErrorKind::invalid_arg(anyhow::anyhow!("process has no argv[0]")));
    };

    let child = tokio::process::Command::new(program)
        .args(args)
        .current_dir(&spec.cwd)
        .envs(spec.env.iter().filter_map(|kv| kv.split_once('=')))
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("spawning {program}: {e}")))?;

    let on_remove = Arc::new(RemoveExternalProcess { registry: Arc::clone(registry) });
    let handle = ProcessHandle::spawn_external(child, spec, on_remove);
    registry.add_external_process(Arc::clone(&handle));
    Ok(handle)
}

struct RemoveExternalProcess {
    registry: Arc<Registry>,
}

impl ProcessRemoveCallback for RemoveExternalProcess {
    fn on_removed(&self, pid: u32) {
        self.registry.remove_external_process(pid);
    }
}

async fn handle_shutdown(
    registry: Arc<Registry>,
    _conn: Arc<ConnectionState>,
    frame: Frame,
    graceful: bool,
) -> (u32, Value) {
    let activity_id = Uuid::new_v4();
    let message_type = if graceful { MessageType::ShutdownGraceful } else { MessageType::ShutdownForced };
    let resp_type = message_type.response_type();
    let req: ShutdownContainerRequest = match frame.decode_json() {
        Ok(r) => r,
        Err(e) => return err_response::<ShutdownContainerResponse>(resp_type, activity_id, &e),
    };

    let container = match registry.get(&req.container_id) {
        Some(c) => c,
        None => {
            let e = ErrorKind::not_found_system(anyhow::anyhow!("container {} not registered", req.container_id));
            return err_response::<ShutdownContainerResponse>(resp_type, activity_id, &e);
        }
    };

    match container::kill(&registry, &container, graceful).await {
        Ok(()) => ok_response(resp_type, activity_id, ShutdownContainerResponse::default()),
        Err(e) => err_response::<ShutdownContainerResponse>(resp_type, activity_id, &e),
    }
}

async fn handle_signal_process(registry: Arc<Registry>, _conn: Arc<ConnectionState>, frame: Frame) -> (u32, Value) {
    let activity_id = Uuid::new_v4();
    let resp_type = MessageType::SignalProcess.response_type();
    let req: SignalProcessRequest = match frame.decode_json() {
        Ok(r) => r,
        Err(e) => return err_response::<SignalProcessResponse>(resp_type, activity_id, &e),
    };

    let process = find_process(&registry, req.process_id);
    let process = match process {
        Some(p) => p,
        None => {
            let e = ErrorKind::not_found(anyhow::anyhow!("no such process {}", req.process_id));
            return err_response::<SignalProcessResponse>(resp_type, activity_id, &e);
        }
    };

    match process.signal(req.signal) {
        Ok(()) => ok_response(resp_type, activity_id, SignalProcessResponse::default()),
        Err(e) => err_response::<SignalProcessResponse>(resp_type, activity_id, &e),
    }
}

async fn handle_wait_for_process(registry: Arc<Registry>, _conn: Arc<ConnectionState>, frame: Frame) -> (u32, Value) {
    let activity_id = Uuid::new_v4();
    let resp_type = MessageType::WaitForProcess.response_type();
    let req: WaitForProcessRequest = match frame.decode_json() {
        Ok(r) => r,
        Err(e) => return err_response::<WaitForProcessResponse>(resp_type, activity_id, &e),
    };

    let process = match find_process(&registry, req.process_id) {
        Some(p) => p,
        None => {
            let e = ErrorKind::not_found(anyhow::anyhow!("no such process {}", req.process_id));
            return err_response::<WaitForProcessResponse>(resp_type, activity_id, &e);
        }
    };

    let (code_rx, done_tx) = process.wait();
    let code = match req.timeout_in_ms {
        Some(ms) => match tokio::time::timeout(std::time::Duration::from_millis(ms), code_rx).await {
            Ok(Ok(code)) => Ok(code),
            Ok(Err(_)) => Err(ErrorKind::runtime(anyhow::anyhow!("process wait channel closed early"))),
            Err(_) => Err(ErrorKind::timeout(anyhow::anyhow!("wait for process {} timed out", req.process_id))),
        },
        None => code_rx.await.map_err(|_| ErrorKind::runtime(anyhow::anyhow!("process wait channel closed early"))),
    };
    let _ = done_tx.send(());

    match code {
        Ok(exit_code) => ok_response(resp_type, activity_id, WaitForProcessResponse { exit_code }),
        Err(e) => err_response::<WaitForProcessResponse>(resp_type, activity_id, &e),
    }
}

async fn handle_resize_console(registry: Arc<Registry>, _conn: Arc<ConnectionState>, frame: Frame) -> (u32, Value) {
    let activity_id = Uuid::new_v4();
    let resp_type = MessageType::ResizeConsole.response_type();
    let req: ResizeConsoleRequest = match frame.decode_json() {
        Ok(r) => r,
        Err(e) => return err_response::<ResizeConsoleResponse>(resp_type, activity_id, &e),
    };

    let process = match find_process(&registry, req.process_id) {
        Some(p) => p,
        None => {
            let e = ErrorKind::not_found(anyhow::anyhow!("no such process {}", req.process_id));
            return err_response::<ResizeConsoleResponse>(resp_type, activity_id, &e);
        }
    };

    match process.resize_console(req.width, req.height) {
        Ok(()) => ok_response(resp_type, activity_id, ResizeConsoleResponse::default()),
        Err(e) => err_response::<ResizeConsoleResponse>(resp_type, activity_id, &e),
    }
}

async fn handle_get_properties(registry: Arc<Registry>, _conn: Arc<ConnectionState>, frame: Frame) -> (u32, Value) {
    let activity_id = Uuid::new_v4();
    let resp_type = MessageType::GetProperties.response_type();
    let req: GetPropertiesRequest = match frame.decode_json() {
        Ok(r) => r,
        Err(e) => return err_response::<GetPropertiesResponse>(resp_type, activity_id, &e),
    };

    let container = match registry.get(&req.container_id) {
        Some(c) => c,
        None => {
            let e = ErrorKind::not_found_system(anyhow::anyhow!("container {} not registered", req.container_id));
            return err_response::<GetPropertiesResponse>(resp_type, activity_id, &e);
        }
    };

    if let Err(e) = registry.policy.enforce_get_properties(&req.container_id) {
        return err_response::<GetPropertiesResponse>(resp_type, activity_id, &e);
    }

    let process_list = container
        .processes
        .lock()
        .unwrap()
        .values()
        .map(|p| ProcessDetails { process_id: p.pid, is_init: p.is_init, exit_code: None })
        .collect();

    // `query` is the caller opting into cgroup metrics; an empty request
    // just wants the process list.
    let stats = req.query.is_some().then(|| container::stats(&container));

    ok_response(resp_type, activity_id, GetPropertiesResponse { process_list, stats })
}

async fn handle_modify_settings(registry: Arc<Registry>, _conn: Arc<ConnectionState>, frame: Frame) -> (u32, Value) {
    let activity_id = Uuid::new_v4();
    let resp_type = MessageType::ModifySettings.response_type();
    let req: ModifySettingsEnvelope = match frame.decode_json() {
        Ok(r) => r,
        Err(e) => return err_response::<ModifySettingsResponse>(resp_type, activity_id, &e),
    };

    match registry.modify_settings(&req.container_id, req.request).await {
        Ok(()) => ok_response(resp_type, activity_id, ModifySettingsResponse::default()),
        Err(e) => err_response::<ModifySettingsResponse>(resp_type, activity_id, &e),
    }
}

async fn handle_delete(registry: Arc<Registry>, _conn: Arc<ConnectionState>, frame: Frame) -> (u32, Value) {
    let activity_id = Uuid::new_v4();
    let resp_type = MessageType::Delete.response_type();
    let req: ShutdownContainerRequest = match frame.decode_json() {
        Ok(r) => r,
        Err(e) => return err_response::<ShutdownContainerResponse>(resp_type, activity_id, &e),
    };

    let container = match registry.get(&req.container_id) {
        Some(c) => c,
        None => {
            let e = ErrorKind::not_found_system(anyhow::anyhow!("container {} not registered", req.container_id));
            return err_response::<ShutdownContainerResponse>(resp_type, activity_id, &e);
        }
    };

    match container::delete(&registry, &container).await {
        Ok(()) => ok_response(resp_type, activity_id, ShutdownContainerResponse::default()),
        Err(e) => err_response::<ShutdownContainerResponse>(resp_type, activity_id, &e),
    }
}

fn find_process(registry: &Registry, pid: u32) -> Option<Arc<ProcessHandle>> {
    if let Some(handle) = registry.get_external_process(pid) {
        return Some(handle);
    }
    registry.find_container_process(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn unnegotiated_connection_rejects_state_changing_requests() {
        let registry = Arc::new(Registry::new(oci::Runtime::new("/bin/true")));
        let bridge = Bridge::new(registry);

        let (mut client, server) = duplex(4096);
        let serve = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.serve(server).await }
        });

        let req = StartContainerRequest { container_id: "c1".into() };
        codec::write_frame(&mut client, MessageType::Start.raw(), 1, &req).await.unwrap();

        let frame = codec::read_frame(&mut client).await.unwrap();
        let body: serde_json::Value = frame.decode_json().unwrap();
        assert_eq!(body["result"].as_i64().unwrap() as i32, crate::error::hresult::BAD_PROTOCOL_VERSION);

        drop(client);
        let _ = serve.await;
    }

    #[tokio::test]
    async fn negotiate_then_unknown_message_type_is_not_impl() {
        let registry = Arc::new(Registry::new(oci::Runtime::new("/bin/true")));
        let bridge = Bridge::new(registry);

        let (mut client, server) = duplex(4096);
        let serve = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.serve(server).await }
        });

        let negotiate = NegotiateProtocolRequest { min_version: 1, max_version: 10 };
        codec::write_frame(&mut client, MessageType::NegotiateProtocol.raw(), 1, &negotiate).await.unwrap();
        let frame = codec::read_frame(&mut client).await.unwrap();
        let body: serde_json::Value = frame.decode_json().unwrap();
        assert_eq!(body["result"].as_i64().unwrap(), 0);

        codec::write_frame(&mut client, 0xdead, 2, &serde_json::json!({})).await.unwrap();
        let frame = codec::read_frame(&mut client).await.unwrap();
        let body: serde_json::Value = frame.decode_json().unwrap();
        assert_eq!(body["result"].as_i64().unwrap() as i32, crate::error::hresult::NOT_IMPL);

        drop(client);
        let _ = serve.await;
    }

    #[tokio::test]
    async fn required_policy_blocks_mutating_requests_until_loaded() {
        let registry = Arc::new(Registry::new(oci::Runtime::new("/bin/true")));
        registry.set_require_policy(true);
        let bridge = Bridge::new(registry);

        let (mut client, server) = duplex(4096);
        let serve = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.serve(server).await }
        });

        let negotiate = NegotiateProtocolRequest { min_version: 1, max_version: 10 };
        codec::write_frame(&mut client, MessageType::NegotiateProtocol.raw(), 1, &negotiate).await.unwrap();
        let frame = codec::read_frame(&mut client).await.unwrap();
        let body: serde_json::Value = frame.decode_json().unwrap();
        assert_eq!(body["result"].as_i64().unwrap(), 0);

        let req = StartContainerRequest { container_id: "c1".into() };
        codec::write_frame(&mut client, MessageType::Start.raw(), 2, &req).await.unwrap();
        let frame = codec::read_frame(&mut client).await.unwrap();
        let body: serde_json::Value = frame.decode_json().unwrap();
        assert_eq!(body["result"].as_i64().unwrap() as i32, crate::error::hresult::FAIL);

        drop(client);
        let _ = serve.await;
    }
}
