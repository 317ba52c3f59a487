//! The application node and its ports.
//!
//! A single dispatcher task per node reads every transfer the transport
//! delivers, answers requests addressed to the local node through the
//! registered servers, and completes pending client calls. Subscribers keep
//! their own listener so that slow consumers do not stall the node.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::{Map, Value, json};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use yakut_common::constants::OUTPUT_TRANSFER_ID_MAP_MAX_AGE;
use yakut_common::types::{NodeId, Priority, ServiceId, SubjectId};
use yakut_dsdl::{Composite, DataType};
use yakut_transport::tid_map::TransferIdMap;
use yakut_transport::{DataSpecifier, OutgoingTransfer, Timestamp, Transfer, Transport};

use crate::error::{NodeError, Result};
use crate::info::NodeInfo;
use crate::register::Registry;
use crate::types::{self, message_schema, service_schemas};

/// Heartbeat health `NOMINAL`.
pub const HEALTH_NOMINAL: u8 = 0;
/// Heartbeat mode `OPERATIONAL`.
pub const MODE_OPERATIONAL: u8 = 0;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Heartbeat publication parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatSettings {
    /// Publication period; at most one second.
    pub period: Duration,
    /// Transfer priority.
    pub priority: Priority,
    /// Vendor-specific status code.
    pub vssc: u8,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            priority: Priority::Nominal,
            vssc: u8::try_from(std::process::id() % 100).unwrap_or(0),
        }
    }
}

impl HeartbeatSettings {
    /// Checks that the period is positive and does not exceed one second.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidHeartbeat`] otherwise.
    pub fn validate(&self) -> Result<()> {
        if self.period.is_zero() || self.period > Duration::from_secs(1) {
            return Err(NodeError::InvalidHeartbeat {
                message: format!("period {:?} is not within (0, 1] s", self.period),
            });
        }
        Ok(())
    }
}

/// Everything needed to construct a [`Node`] besides the transport and registry.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// Contents of the `GetInfo` response.
    pub info: NodeInfo,
    /// Heartbeat parameters.
    pub heartbeat: HeartbeatSettings,
    /// Whether an anonymous transport is acceptable.
    pub allow_anonymous: bool,
    /// Where output transfer-ID maps are persisted; `None` keeps them in memory.
    pub transfer_id_map_dir: Option<PathBuf>,
}

impl NodeSettings {
    /// Settings with default heartbeat and in-memory transfer-ID counters.
    #[must_use]
    pub fn new(info: NodeInfo) -> Self {
        Self {
            info,
            heartbeat: HeartbeatSettings::default(),
            allow_anonymous: false,
            transfer_id_map_dir: None,
        }
    }
}

/// Metadata of a received transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferMeta {
    /// Reception time.
    pub timestamp: Timestamp,
    /// Priority.
    pub priority: Priority,
    /// Transfer-ID.
    pub transfer_id: u64,
    /// Sender; `None` if anonymous.
    pub source_node_id: Option<NodeId>,
}

fn quantize_micro(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

impl TransferMeta {
    fn of(transfer: &Transfer) -> Self {
        Self {
            timestamp: transfer.timestamp,
            priority: transfer.priority,
            transfer_id: transfer.transfer_id,
            source_node_id: transfer.source,
        }
    }

    /// The `_meta_` object: timestamps quantized to microseconds, the priority
    /// name and the data type name when given.
    #[must_use]
    pub fn to_builtin(&self, dtype: Option<&DataType>) -> Map<String, Value> {
        let mut out = Map::new();
        let _ = out.insert("ts_system".into(), json!(quantize_micro(self.timestamp.system)));
        let _ = out.insert("ts_monotonic".into(), json!(quantize_micro(self.timestamp.monotonic)));
        let _ = out.insert("source_node_id".into(), json!(self.source_node_id.map(NodeId::get)));
        let _ = out.insert("transfer_id".into(), json!(self.transfer_id));
        let _ = out.insert("priority".into(), json!(self.priority.name()));
        if let Some(dt) = dtype {
            let _ = out.insert("dtype".into(), json!(dt.full_name()));
        }
        out
    }
}

/// A request handler: decoded request and its metadata in, response out.
/// Returning `None` leaves the request unanswered.
pub type Handler = Arc<dyn Fn(&Value, &TransferMeta) -> Option<Value> + Send + Sync>;

struct ServerEntry {
    request: Arc<Composite>,
    response: Arc<Composite>,
    handler: Handler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PendingKey {
    service: u16,
    server: NodeId,
    transfer_id: u64,
}

struct Shared {
    transport: Arc<dyn Transport>,
    info: NodeInfo,
    registry: Mutex<Registry>,
    tid_map: Mutex<TransferIdMap>,
    servers: Mutex<HashMap<u16, Arc<ServerEntry>>>,
    pending: Mutex<HashMap<PendingKey, oneshot::Sender<Arc<Transfer>>>>,
    health: AtomicU8,
    mode: AtomicU8,
    vssc: AtomicU8,
    started: Instant,
    closed: AtomicBool,
}

impl Shared {
    fn next_transfer_id(&self, specifier: &DataSpecifier) -> u64 {
        let modulo = self.transport.protocol_parameters().transfer_id_modulo;
        lock(&self.tid_map).next(specifier, modulo)
    }

    async fn emit(&self, priority: Priority, specifier: DataSpecifier, payload: Vec<u8>) -> Result<u64> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NodeError::Closed);
        }
        let transfer_id = self.next_transfer_id(&specifier);
        self.transport
            .send(OutgoingTransfer {
                priority,
                transfer_id,
                specifier,
                payload,
            })
            .await?;
        Ok(transfer_id)
    }

    async fn route(&self, transfer: Arc<Transfer>) {
        let local = self.transport.local_node_id();
        match transfer.specifier {
            DataSpecifier::Request { service, destination } if Some(destination) == local => {
                self.serve(service, &transfer).await;
            }
            DataSpecifier::Response { service, destination } if Some(destination) == local => {
                let Some(server) = transfer.source else {
                    return;
                };
                let key = PendingKey {
                    service: service.get(),
                    server,
                    transfer_id: transfer.transfer_id,
                };
                if let Some(tx) = lock(&self.pending).remove(&key) {
                    let _ = tx.send(transfer);
                } else {
                    tracing::trace!(service = %service, server = %server, "unexpected response dropped");
                }
            }
            _ => {}
        }
    }

    async fn serve(&self, service: ServiceId, transfer: &Transfer) {
        let Some(client) = transfer.source else {
            return;
        };
        let Some(entry) = lock(&self.servers).get(&service.get()).cloned() else {
            return;
        };
        let request = match yakut_dsdl::deserialize(&entry.request, &transfer.payload) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(service = %service, client = %client, error = %e, "malformed request dropped");
                return;
            }
        };
        let meta = TransferMeta::of(transfer);
        let Some(response) = (entry.handler)(&request, &meta) else {
            return;
        };
        let payload = match yakut_dsdl::serialize(&entry.response, &response) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(service = %service, error = %e, "server produced an invalid response");
                return;
            }
        };
        let outgoing = OutgoingTransfer {
            priority: transfer.priority,
            transfer_id: transfer.transfer_id,
            specifier: DataSpecifier::Response {
                service,
                destination: client,
            },
            payload,
        };
        if let Err(e) = self.transport.send(outgoing).await {
            tracing::warn!(service = %service, client = %client, error = %e, "response not sent");
        }
    }
}

/// A Cyphal application node.
pub struct Node {
    shared: Arc<Shared>,
    heartbeat: HeartbeatSettings,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("transport", &self.shared.transport.describe())
            .field("name", &self.shared.info.name)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Creates the node and starts its dispatcher. Non-anonymous nodes also
    /// start the heartbeat and serve `GetInfo` and the register services.
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if the transport is anonymous and `allow_anonymous` is not set,
    /// or if the heartbeat settings are invalid.
    pub fn new(transport: Arc<dyn Transport>, registry: Registry, settings: NodeSettings) -> Result<Self> {
        settings.heartbeat.validate()?;
        let local = transport.local_node_id();
        if local.is_none() && !settings.allow_anonymous {
            return Err(NodeError::Anonymous {
                purpose: "with this command".to_owned(),
            });
        }
        let tid_map = match (local, &settings.transfer_id_map_dir) {
            (Some(id), Some(dir)) => TransferIdMap::load(dir, id, OUTPUT_TRANSFER_ID_MAP_MAX_AGE),
            _ => TransferIdMap::ephemeral(),
        };
        let rx = transport.listen();
        let shared = Arc::new(Shared {
            transport,
            info: settings.info,
            registry: Mutex::new(registry),
            tid_map: Mutex::new(tid_map),
            servers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            health: AtomicU8::new(HEALTH_NOMINAL),
            mode: AtomicU8::new(MODE_OPERATIONAL),
            vssc: AtomicU8::new(settings.heartbeat.vssc),
            started: Instant::now(),
            closed: AtomicBool::new(false),
        });
        let node = Self {
            shared: Arc::clone(&shared),
            heartbeat: settings.heartbeat,
            tasks: Mutex::new(vec![tokio::spawn(dispatch(shared, rx))]),
        };
        if local.is_some() {
            node.start_standard_services()?;
        }
        tracing::debug!(node = ?node, node_id = ?local, "node constructed");
        Ok(node)
    }

    fn start_standard_services(&self) -> Result<()> {
        let info = self.shared.info.to_builtin();
        self.serve(&types::GET_INFO.load()?, None, Arc::new(move |_, _| Some(info.clone())))?;

        let weak = Arc::downgrade(&self.shared);
        self.serve(
            &types::REGISTER_ACCESS.load()?,
            None,
            Arc::new(move |request, _| {
                let shared = weak.upgrade()?;
                let response = lock(&shared.registry).handle_access(request);
                Some(response)
            }),
        )?;
        let weak = Arc::downgrade(&self.shared);
        self.serve(
            &types::REGISTER_LIST.load()?,
            None,
            Arc::new(move |request, _| {
                let shared = weak.upgrade()?;
                let response = lock(&shared.registry).handle_list(request);
                Some(response)
            }),
        )?;

        let schema = types::HEARTBEAT.message()?;
        let subject = SubjectId::new(types::HEARTBEAT.load()?.fixed_port_id().unwrap_or(7509))?;
        let shared = Arc::clone(&self.shared);
        let settings = self.heartbeat;
        lock(&self.tasks).push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(settings.period);
            loop {
                let _ = ticker.tick().await;
                let message = json!({
                    "uptime": shared.started.elapsed().as_secs().min(u64::from(u32::MAX)),
                    "health": {"value": shared.health.load(Ordering::Relaxed)},
                    "mode": {"value": shared.mode.load(Ordering::Relaxed)},
                    "vendor_specific_status_code": shared.vssc.load(Ordering::Relaxed),
                });
                let payload = match yakut_dsdl::serialize(&schema, &message) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::error!(error = %e, "heartbeat encoding failed");
                        break;
                    }
                };
                match shared.emit(settings.priority, DataSpecifier::Message(subject), payload).await {
                    Ok(_) => {}
                    Err(NodeError::Closed | NodeError::Transport(yakut_transport::TransportError::Closed)) => break,
                    Err(e) => tracing::warn!(error = %e, "heartbeat not published"),
                }
            }
        }));
        Ok(())
    }

    /// Local node-ID; `None` when anonymous.
    #[must_use]
    pub fn id(&self) -> Option<NodeId> {
        self.shared.transport.local_node_id()
    }

    /// Info served through `GetInfo`.
    #[must_use]
    pub fn info(&self) -> &NodeInfo {
        &self.shared.info
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.shared.transport
    }

    /// Time since construction.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.shared.started.elapsed()
    }

    /// Heartbeat parameters.
    #[must_use]
    pub const fn heartbeat_settings(&self) -> &HeartbeatSettings {
        &self.heartbeat
    }

    /// Sets the health reported in the heartbeat.
    pub fn set_health(&self, health: u8) {
        self.shared.health.store(health.min(3), Ordering::Relaxed);
    }

    /// Sets the mode reported in the heartbeat.
    pub fn set_mode(&self, mode: u8) {
        self.shared.mode.store(mode.min(7), Ordering::Relaxed);
    }

    /// Runs `f` with exclusive access to the local registry.
    pub fn with_registry<R>(&self, f: impl FnOnce(&mut Registry) -> R) -> R {
        f(&mut lock(&self.shared.registry))
    }

    fn subject_of(dtype: &DataType, subject_id: Option<u16>) -> Result<SubjectId> {
        let id = subject_id.or_else(|| dtype.fixed_port_id()).ok_or_else(|| {
            NodeError::resolution(format!("{} has no fixed port-ID; specify the subject-ID", dtype.full_name()))
        })?;
        Ok(SubjectId::new(id)?)
    }

    fn service_of(dtype: &DataType, service_id: Option<u16>) -> Result<ServiceId> {
        let id = service_id.or_else(|| dtype.fixed_port_id()).ok_or_else(|| {
            NodeError::resolution(format!("{} has no fixed port-ID; specify the service-ID", dtype.full_name()))
        })?;
        Ok(ServiceId::new(id)?)
    }

    /// A publisher of `dtype` on `subject_id`, or on its fixed subject-ID.
    ///
    /// # Errors
    ///
    /// Fails for service types, missing or invalid subject-IDs.
    pub fn make_publisher(&self, dtype: &Arc<DataType>, subject_id: Option<u16>) -> Result<Publisher> {
        Ok(Publisher {
            shared: Arc::clone(&self.shared),
            schema: message_schema(dtype)?,
            subject: Self::subject_of(dtype, subject_id)?,
            dtype: Arc::clone(dtype),
            priority: Priority::Nominal,
        })
    }

    /// A subscriber to `dtype` on `subject_id`, or on its fixed subject-ID.
    ///
    /// # Errors
    ///
    /// Fails for service types, missing or invalid subject-IDs.
    pub fn make_subscriber(&self, dtype: &Arc<DataType>, subject_id: Option<u16>) -> Result<Subscriber> {
        Ok(Subscriber {
            rx: self.shared.transport.listen(),
            schema: message_schema(dtype)?,
            subject: Self::subject_of(dtype, subject_id)?,
            dtype: Arc::clone(dtype),
            dropped: 0,
        })
    }

    /// A client of `dtype` talking to `server`.
    ///
    /// # Errors
    ///
    /// Fails for message types and missing or invalid service-IDs.
    pub fn make_client(&self, dtype: &Arc<DataType>, server: NodeId, service_id: Option<u16>) -> Result<Client> {
        let (request, response) = service_schemas(dtype)?;
        Ok(Client {
            shared: Arc::clone(&self.shared),
            service: Self::service_of(dtype, service_id)?,
            dtype: Arc::clone(dtype),
            request,
            response,
            server,
            priority: Priority::Nominal,
            timeout: Duration::from_secs_f64(yakut_common::constants::DEFAULT_SERVICE_REQUEST_TIMEOUT),
        })
    }

    /// Serves `dtype` with `handler`, replacing any previous server on that port.
    ///
    /// # Errors
    ///
    /// Fails for message types and missing or invalid service-IDs.
    pub fn serve(&self, dtype: &Arc<DataType>, service_id: Option<u16>, handler: Handler) -> Result<ServiceId> {
        let (request, response) = service_schemas(dtype)?;
        let service = Self::service_of(dtype, service_id)?;
        let entry = Arc::new(ServerEntry {
            request,
            response,
            handler,
        });
        if lock(&self.shared.servers).insert(service.get(), entry).is_some() {
            tracing::debug!(service = %service, "server replaced");
        }
        tracing::debug!(service = %service, dtype = %dtype, "serving");
        Ok(service)
    }

    /// Stops the node: background tasks end, transfer-ID counters are saved
    /// and the transport is closed.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        lock(&self.shared.pending).clear();
        if let Err(e) = lock(&self.shared.tid_map).save() {
            tracing::warn!(error = %e, "output transfer-ID map not saved");
        }
        self.shared.transport.close().await;
        tracing::debug!(name = %self.shared.info.name, "node closed");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

async fn dispatch(shared: Arc<Shared>, mut rx: broadcast::Receiver<Arc<Transfer>>) {
    loop {
        match rx.recv().await {
            Ok(transfer) => shared.route(transfer).await,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(lost = n, "node dispatcher lagged behind the transport");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Publishes messages of one type on one subject.
pub struct Publisher {
    shared: Arc<Shared>,
    dtype: Arc<DataType>,
    schema: Arc<Composite>,
    subject: SubjectId,
    /// Priority of emitted transfers.
    pub priority: Priority,
}

impl Publisher {
    /// Subject-ID.
    #[must_use]
    pub const fn subject_id(&self) -> SubjectId {
        self.subject
    }

    /// Data type.
    #[must_use]
    pub const fn dtype(&self) -> &Arc<DataType> {
        &self.dtype
    }

    /// Encodes and emits `message`. Returns `false` if the transport did not
    /// accept it within `timeout`.
    ///
    /// # Errors
    ///
    /// Fails if the value does not fit the type or the transport fails.
    pub async fn publish(&self, message: &Value, timeout: Duration) -> Result<bool> {
        let payload = yakut_dsdl::serialize(&self.schema, message)?;
        let emit = self
            .shared
            .emit(self.priority, DataSpecifier::Message(self.subject), payload);
        match tokio::time::timeout(timeout, emit).await {
            Ok(result) => result.map(|_| true),
            Err(_) => {
                tracing::warn!(subject = %self.subject, "publication timed out");
                Ok(false)
            }
        }
    }
}

/// Receives messages of one type on one subject.
pub struct Subscriber {
    rx: broadcast::Receiver<Arc<Transfer>>,
    dtype: Arc<DataType>,
    schema: Arc<Composite>,
    subject: SubjectId,
    dropped: u64,
}

impl Subscriber {
    /// Subject-ID.
    #[must_use]
    pub const fn subject_id(&self) -> SubjectId {
        self.subject
    }

    /// Data type.
    #[must_use]
    pub const fn dtype(&self) -> &Arc<DataType> {
        &self.dtype
    }

    /// Transfers lost to lag or failed to decode.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Waits for the next message. Returns `None` once the transport is gone.
    pub async fn receive(&mut self) -> Option<(Value, TransferMeta)> {
        loop {
            let transfer = match self.rx.recv().await {
                Ok(t) => t,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    tracing::warn!(subject = %self.subject, lost = n, "subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            };
            if transfer.specifier != DataSpecifier::Message(self.subject) {
                continue;
            }
            match yakut_dsdl::deserialize(&self.schema, &transfer.payload) {
                Ok(value) => return Some((value, TransferMeta::of(&transfer))),
                Err(e) => {
                    self.dropped += 1;
                    tracing::debug!(subject = %self.subject, error = %e, "undecodable message dropped");
                }
            }
        }
    }
}

/// Invokes one service on one server node.
pub struct Client {
    shared: Arc<Shared>,
    dtype: Arc<DataType>,
    request: Arc<Composite>,
    response: Arc<Composite>,
    service: ServiceId,
    server: NodeId,
    /// Priority of requests.
    pub priority: Priority,
    /// How long to wait for a response.
    pub timeout: Duration,
}

impl Client {
    /// Service-ID.
    #[must_use]
    pub const fn service_id(&self) -> ServiceId {
        self.service
    }

    /// Server node-ID.
    #[must_use]
    pub const fn server(&self) -> NodeId {
        self.server
    }

    /// Data type.
    #[must_use]
    pub const fn dtype(&self) -> &Arc<DataType> {
        &self.dtype
    }

    /// Sends `request` and waits for the response. Returns `None` on timeout.
    ///
    /// # Errors
    ///
    /// Fails if the local node is anonymous, the request does not fit the type,
    /// the response cannot be decoded or the transport fails.
    pub async fn call(&self, request: &Value) -> Result<Option<(Value, TransferMeta)>> {
        if self.shared.transport.local_node_id().is_none() {
            return Err(NodeError::Anonymous {
                purpose: "to send service requests".to_owned(),
            });
        }
        let payload = yakut_dsdl::serialize(&self.request, request)?;
        let specifier = DataSpecifier::Request {
            service: self.service,
            destination: self.server,
        };
        let transfer_id = self.shared.next_transfer_id(&specifier);
        let key = PendingKey {
            service: self.service.get(),
            server: self.server,
            transfer_id,
        };
        let (tx, rx) = oneshot::channel();
        let _ = lock(&self.shared.pending).insert(key, tx);
        let sent = self
            .shared
            .transport
            .send(OutgoingTransfer {
                priority: self.priority,
                transfer_id,
                specifier,
                payload,
            })
            .await;
        if let Err(e) = sent {
            let _ = lock(&self.shared.pending).remove(&key);
            return Err(e.into());
        }
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(transfer)) => {
                let value = yakut_dsdl::deserialize(&self.response, &transfer.payload)?;
                Ok(Some((value, TransferMeta::of(&transfer))))
            }
            Ok(Err(_)) | Err(_) => {
                let _ = lock(&self.shared.pending).remove(&key);
                tracing::debug!(service = %self.service, server = %self.server, "request timed out");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use yakut_transport::loopback::LoopbackTransport;

    use super::*;

    fn node(id: Option<u16>, bus: &str) -> Node {
        let transport = Arc::new(LoopbackTransport::new(id.map(NodeId::new), bus));
        let mut settings = NodeSettings::new(NodeInfo::for_command("test").expect("info"));
        settings.allow_anonymous = true;
        Node::new(transport, Registry::for_node(id.map(NodeId::new), Vec::new()), settings).expect("node")
    }

    #[tokio::test]
    async fn anonymous_node_requires_permission() {
        let transport = Arc::new(LoopbackTransport::new(None, "node-anon-check"));
        let settings = NodeSettings::new(NodeInfo::default());
        assert!(matches!(
            Node::new(transport, Registry::new(), settings),
            Err(NodeError::Anonymous { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_heartbeat_period_is_rejected() {
        let transport = Arc::new(LoopbackTransport::new(Some(NodeId::new(3)), "node-hb-check"));
        let mut settings = NodeSettings::new(NodeInfo::default());
        settings.heartbeat.period = Duration::from_secs(5);
        assert!(matches!(
            Node::new(transport, Registry::new(), settings),
            Err(NodeError::InvalidHeartbeat { .. })
        ));
    }

    #[tokio::test]
    async fn publisher_reaches_subscriber() {
        let a = node(Some(10), "node-pubsub");
        let b = node(None, "node-pubsub");
        let dtype = yakut_dsdl::Catalog::standard()
            .require("uavcan.primitive.scalar.Integer8", 1, 0)
            .expect("type");
        let mut sub = b.make_subscriber(&dtype, Some(1000)).expect("sub");
        let publisher = a.make_publisher(&dtype, Some(1000)).expect("pub");
        assert!(publisher.publish(&json!({"value": 50}), Duration::from_secs(1)).await.expect("publish"));
        let (msg, meta) = sub.receive().await.expect("message");
        assert_eq!(msg, json!({"value": 50}));
        assert_eq!(meta.source_node_id, Some(NodeId::new(10)));
    }

    #[tokio::test]
    async fn heartbeat_is_published_with_vssc() {
        let observer = node(None, "node-heartbeat");
        let mut sub = observer
            .make_subscriber(&types::HEARTBEAT.load().expect("type"), None)
            .expect("sub");
        let transport = Arc::new(LoopbackTransport::new(Some(NodeId::new(5)), "node-heartbeat"));
        let mut settings = NodeSettings::new(NodeInfo::default());
        settings.heartbeat.vssc = 77;
        let _beating = Node::new(transport, Registry::new(), settings).expect("node");
        let (msg, meta) = tokio::time::timeout(Duration::from_secs(3), sub.receive())
            .await
            .expect("in time")
            .expect("heartbeat");
        assert_eq!(meta.source_node_id, Some(NodeId::new(5)));
        assert_eq!(msg["vendor_specific_status_code"], json!(77));
        assert_eq!(msg["mode"]["value"], json!(0));
    }

    #[tokio::test]
    async fn get_info_is_served_automatically() {
        let server = node(Some(20), "node-getinfo");
        let client_node = node(Some(21), "node-getinfo");
        let client = client_node
            .make_client(&types::GET_INFO.load().expect("type"), NodeId::new(20), None)
            .expect("client");
        let (response, meta) = client.call(&json!({})).await.expect("call").expect("response");
        assert_eq!(meta.source_node_id, Some(NodeId::new(20)));
        let info = NodeInfo::from_builtin(&response).expect("info");
        assert_eq!(info.name, server.info().name);
        assert_eq!(info.unique_id, server.info().unique_id);
    }

    #[tokio::test]
    async fn call_to_absent_server_times_out() {
        let client_node = node(Some(30), "node-timeout");
        let mut client = client_node
            .make_client(&types::GET_INFO.load().expect("type"), NodeId::new(99), None)
            .expect("client");
        client.timeout = Duration::from_millis(100);
        assert!(client.call(&json!({})).await.expect("call").is_none());
    }

    #[tokio::test]
    async fn anonymous_client_cannot_call() {
        let anon = node(None, "node-anon-call");
        let client = anon
            .make_client(&types::GET_INFO.load().expect("type"), NodeId::new(1), None)
            .expect("client");
        assert!(matches!(client.call(&json!({})).await, Err(NodeError::Anonymous { .. })));
    }

    #[tokio::test]
    async fn custom_server_sees_request_metadata() {
        let server = node(Some(40), "node-custom");
        let client_node = node(Some(41), "node-custom");
        let dtype = types::EXECUTE_COMMAND.load().expect("type");
        let _ = server
            .serve(
                &dtype,
                None,
                Arc::new(|req, meta| {
                    let ok = req["command"] == json!(65529) && meta.source_node_id == Some(NodeId::new(41));
                    Some(json!({"status": u8::from(!ok)}))
                }),
            )
            .expect("serve");
        let client = client_node.make_client(&dtype, NodeId::new(40), None).expect("client");
        let (response, _) = client
            .call(&json!({"command": 65529, "parameter": ""}))
            .await
            .expect("call")
            .expect("response");
        assert_eq!(response["status"], json!(0));
    }

    #[tokio::test]
    async fn closed_node_refuses_to_publish() {
        let a = node(Some(50), "node-closed");
        let dtype = types::HEARTBEAT.load().expect("type");
        let publisher = a.make_publisher(&dtype, None).expect("pub");
        a.close().await;
        assert!(publisher.publish(&json!({}), Duration::from_secs(1)).await.is_err());
    }

    #[test]
    fn metadata_builtin_is_quantized() {
        let meta = TransferMeta {
            timestamp: Timestamp {
                system: 1.234_567_89,
                monotonic: 2.0,
            },
            priority: Priority::High,
            transfer_id: 9,
            source_node_id: None,
        };
        let dtype = types::HEARTBEAT.load().expect("type");
        let out = meta.to_builtin(Some(&dtype));
        assert_eq!(out["ts_system"], json!(1.234_568));
        assert_eq!(out["priority"], json!("high"));
        assert_eq!(out["source_node_id"], Value::Null);
        assert_eq!(out["dtype"], json!("uavcan.node.Heartbeat.1.0"));
    }
}
