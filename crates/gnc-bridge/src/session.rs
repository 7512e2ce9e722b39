//! [`BridgeSession`] – the single broker connection shared by every view.
//!
//! The session owns:
//!
//! 1. **Lifecycle** – `Disconnected -> Connecting -> Connected -> Disconnected`.
//!    Every transition out of `Connecting`/`Connected` emits a
//!    [`ConnectionEvent`] on the broadcast channel returned by
//!    [`BridgeSession::events`].
//!
//! 2. **A connection task** per live link that owns the socket.  Callers hand
//!    it frames through an unbounded queue; inbound frames are dispatched from
//!    the task to subscription callbacks and pending service calls.
//!
//! 3. **The subscription registry**, which survives reconnects: every topic
//!    that still has a live [`Subscription`] is re-announced to the broker
//!    when a new link comes up.
//!
//! Sessions are cheap to clone; all clones drive the same connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use gnc_types::{ConnectionEvent, ConnectionState, GncError, ServiceResponse};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{self, Inbound, Outbound};
use crate::subscription::{SubscriberSlot, Subscription};
use crate::transport::{Connector, Link, WsConnector, validate_endpoint};

/// Default rosbridge endpoint.
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:9090";

/// Lifecycle events buffered for slow listeners.
const EVENT_CAPACITY: usize = 64;

type PendingCall = oneshot::Sender<Result<ServiceResponse, GncError>>;

/// Lock a std mutex, recovering the data if a callback panicked while holding
/// it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct TopicEntry {
    msg_type: String,
    subscribe_id: String,
    slots: Vec<Arc<SubscriberSlot>>,
}

pub(crate) struct Shared {
    state: Mutex<ConnectionState>,
    connected: AtomicBool,
    /// Bumped on every `connect` and `close`; a link task only reports its
    /// end when its generation is still current.
    generation: AtomicU64,
    next_slot_id: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    topics: Mutex<HashMap<String, TopicEntry>>,
    pending: Mutex<HashMap<String, PendingCall>>,
    link_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Handle to the broker connection.
#[derive(Clone)]
pub struct BridgeSession {
    endpoint: String,
    connector: Arc<dyn Connector>,
    inner: Arc<Shared>,
}

impl std::fmt::Debug for BridgeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeSession")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl BridgeSession {
    /// Create a session that will connect to `endpoint` over WebSocket.
    ///
    /// Nothing is opened until [`connect`][Self::connect] is called.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_connector(endpoint, Arc::new(WsConnector))
    }

    /// Create a session that opens its links through `connector`.
    pub fn with_connector(endpoint: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            endpoint: endpoint.into(),
            connector,
            inner: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Disconnected),
                connected: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                next_slot_id: AtomicU64::new(1),
                outbound: Mutex::new(None),
                topics: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                link_task: Mutex::new(None),
                events,
            }),
        }
    }

    /// The configured broker endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether the transport is currently open.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    /// Register a lifecycle listener.
    ///
    /// Only events emitted after this call are observed.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Start opening the transport.
    ///
    /// Returns immediately.  The outcome arrives as a
    /// [`ConnectionEvent::Connection`] or [`ConnectionEvent::Error`] on
    /// [`events`][Self::events].  A no-op while already connecting or
    /// connected.
    ///
    /// # Errors
    ///
    /// * [`GncError::InvalidEndpoint`] when the endpoint is not a `ws://` or
    ///   `wss://` URL.
    /// * [`GncError::Transport`] when called outside a Tokio runtime.
    pub fn connect(&self) -> Result<(), GncError> {
        self.start_connect().map(|_| ())
    }

    /// [`connect`][Self::connect], reporting whether a new dial was started
    /// (`false` while already connecting or connected).
    pub(crate) fn start_connect(&self) -> Result<bool, GncError> {
        validate_endpoint(&self.endpoint)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| GncError::Transport(format!("no async runtime: {e}")))?;

        let mut state = lock(&self.inner.state);
        if *state != ConnectionState::Disconnected {
            return Ok(false);
        }
        *state = ConnectionState::Connecting;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        debug!(endpoint = %self.endpoint, generation, "opening bridge transport");
        // Spawned under the state lock so the task cannot report its end
        // before its handle is stored.
        let task = runtime.spawn(run_link(
            Arc::clone(&self.inner),
            Arc::clone(&self.connector),
            self.endpoint.clone(),
            generation,
        ));
        *lock(&self.inner.link_task) = Some(task);
        Ok(true)
    }

    /// Close the transport.
    ///
    /// Pending service calls fail with [`GncError::TransportClosed`].  Emits
    /// [`ConnectionEvent::Close`] unless the session was already
    /// disconnected.  Subscriptions stay registered and are re-announced on
    /// the next [`connect`][Self::connect].
    pub fn close(&self) {
        let mut state = lock(&self.inner.state);
        let previous = *state;
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        *state = ConnectionState::Disconnected;
        self.inner.connected.store(false, Ordering::SeqCst);

        // Dropping the queue lets a connected link task close the socket
        // gracefully; a task still dialling or announcing is aborted.
        lock(&self.inner.outbound).take();
        if let Some(task) = lock(&self.inner.link_task).take()
            && previous == ConnectionState::Connecting
        {
            task.abort();
        }

        self.inner.fail_pending();
        if previous != ConnectionState::Disconnected {
            info!(endpoint = %self.endpoint, "bridge transport closed by client");
            self.inner.emit(ConnectionEvent::Close);
        }
    }

    /// Invoke a remote service and wait for its reply.
    ///
    /// There is no timeout: if the broker never answers while the link stays
    /// up, the returned future never resolves.
    ///
    /// # Errors
    ///
    /// * [`GncError::NotConnected`] when the transport is down.
    /// * [`GncError::ServiceFailed`] when the broker reports `result: false`.
    /// * [`GncError::TransportClosed`] when the link drops before the reply.
    pub async fn call_service(
        &self,
        service: &str,
        args: Value,
    ) -> Result<ServiceResponse, GncError> {
        let id = format!("call_service:{service}:{}", Uuid::new_v4());
        let frame = protocol::encode(&Outbound::CallService {
            id: id.clone(),
            service: service.to_string(),
            args,
        })?;

        if !self.is_connected() {
            return Err(GncError::NotConnected);
        }
        let (tx, rx) = oneshot::channel();
        {
            let outbound = lock(&self.inner.outbound);
            let Some(queue) = outbound.as_ref() else {
                return Err(GncError::NotConnected);
            };
            lock(&self.inner.pending).insert(id.clone(), tx);
            if queue.send(frame).is_err() {
                lock(&self.inner.pending).remove(&id);
                return Err(GncError::NotConnected);
            }
        }
        debug!(service, id = %id, "service call sent");

        rx.await.unwrap_or(Err(GncError::TransportClosed))
    }

    /// Subscribe to `topic`, decoding every message into `T` before handing
    /// it to `on_message`.
    ///
    /// Messages that fail to decode are logged and skipped.  The broker is
    /// told about the topic once, when its first subscriber registers; later
    /// subscribers share that broker subscription but are otherwise
    /// independent.
    ///
    /// `on_message` runs on the connection task and must not unsubscribe its
    /// own [`Subscription`].
    pub fn subscribe_topic<T, F>(
        &self,
        topic: impl Into<String>,
        msg_type: impl Into<String>,
        mut on_message: F,
    ) -> Subscription
    where
        T: DeserializeOwned,
        F: FnMut(T) + Send + 'static,
    {
        let topic = topic.into();
        let msg_type = msg_type.into();
        let log_topic = topic.clone();
        let decode = move |msg: &Value| match serde_json::from_value::<T>(msg.clone()) {
            Ok(decoded) => on_message(decoded),
            Err(e) => warn!(topic = %log_topic, error = %e, "dropping undecodable message"),
        };

        let slot_id = self.inner.next_slot_id.fetch_add(1, Ordering::SeqCst);
        let slot = Arc::new(SubscriberSlot::new(slot_id, Box::new(decode)));

        let mut topics = lock(&self.inner.topics);
        let entry = topics.entry(topic.clone()).or_insert_with(|| TopicEntry {
            msg_type: msg_type.clone(),
            subscribe_id: format!("subscribe:{topic}:{}", Uuid::new_v4()),
            slots: Vec::new(),
        });
        if entry.msg_type != msg_type {
            warn!(
                topic = %topic,
                registered = %entry.msg_type,
                requested = %msg_type,
                "topic already subscribed with a different type"
            );
        }
        let first = entry.slots.is_empty();
        entry.slots.push(Arc::clone(&slot));
        if first {
            let frame = Outbound::Subscribe {
                id: entry.subscribe_id.clone(),
                topic: topic.clone(),
                msg_type: entry.msg_type.clone(),
            };
            // While disconnected the topic is announced on the next connect.
            let _ = self.inner.send(&frame);
        }
        drop(topics);

        debug!(topic = %topic, slot = slot_id, "subscription registered");
        Subscription::new(topic, slot, Arc::clone(&self.inner))
    }

    /// Publish `msg` on `topic`.
    ///
    /// # Errors
    ///
    /// [`GncError::NotConnected`] when the transport is down.
    pub fn publish(&self, topic: &str, msg: Value) -> Result<(), GncError> {
        if !self.is_connected() {
            return Err(GncError::NotConnected);
        }
        self.inner.send(&Outbound::Publish {
            topic: topic.to_string(),
            msg,
        })
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.inner.topics)
            .get(topic)
            .map_or(0, |entry| entry.slots.len())
    }
}

impl Shared {
    fn emit(&self, event: ConnectionEvent) {
        // No listeners is a normal condition.
        let _ = self.events.send(event);
    }

    fn send(&self, frame: &Outbound) -> Result<(), GncError> {
        let text = protocol::encode(frame)?;
        let outbound = lock(&self.outbound);
        let queue = outbound.as_ref().ok_or(GncError::NotConnected)?;
        queue.send(text).map_err(|_| GncError::NotConnected)
    }

    fn fail_pending(&self) {
        let drained: Vec<PendingCall> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        for tx in drained {
            let _ = tx.send(Err(GncError::TransportClosed));
        }
    }

    /// Remove one subscriber slot; tells the broker when the topic has no
    /// subscribers left.
    pub(crate) fn remove_slot(&self, topic: &str, slot_id: u64) {
        let mut topics = lock(&self.topics);
        let Some(entry) = topics.get_mut(topic) else {
            return;
        };
        entry.slots.retain(|slot| slot.id() != slot_id);
        if entry.slots.is_empty()
            && let Some(entry) = topics.remove(topic)
        {
            let _ = self.send(&Outbound::Unsubscribe {
                id: entry.subscribe_id,
                topic: topic.to_string(),
            });
        }
        debug!(topic, slot = slot_id, "subscription removed");
    }

    /// Install the queue of a freshly opened link.  Returns the subscribe
    /// frames to replay, or `None` when the link was superseded while
    /// dialling.
    ///
    /// The session stays `Connecting` until [`activate`][Self::activate];
    /// frames queued meanwhile go out after the replay.
    fn install(
        &self,
        generation: u64,
        queue: mpsc::UnboundedSender<String>,
    ) -> Option<Vec<String>> {
        let state = lock(&self.state);
        if self.generation.load(Ordering::SeqCst) != generation {
            return None;
        }
        let topics = lock(&self.topics);
        *lock(&self.outbound) = Some(queue);
        drop(state);

        let replay = topics
            .iter()
            .filter_map(|(topic, entry)| {
                protocol::encode(&Outbound::Subscribe {
                    id: entry.subscribe_id.clone(),
                    topic: topic.clone(),
                    msg_type: entry.msg_type.clone(),
                })
                .ok()
            })
            .collect();
        Some(replay)
    }

    /// Mark link `generation` connected once its replay went out.  Returns
    /// `false` when the session was closed in the meantime.
    ///
    /// Lifecycle events are emitted under the state lock so a later
    /// transition can never be observed before an earlier one.
    fn activate(&self, endpoint: &str, generation: u64) -> bool {
        let mut state = lock(&self.state);
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        *state = ConnectionState::Connected;
        self.connected.store(true, Ordering::SeqCst);
        info!(endpoint, "bridge transport connected");
        self.emit(ConnectionEvent::Connection);
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Record the end of link `generation`.  Ignored when the session has
    /// already moved on (closed or reconnected).
    fn finish(&self, endpoint: &str, generation: u64, failure: Option<String>) {
        let mut state = lock(&self.state);
        if !self.is_current(generation) {
            return;
        }
        *state = ConnectionState::Disconnected;
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.outbound).take();
        lock(&self.link_task).take();
        self.fail_pending();

        match failure {
            Some(reason) => {
                warn!(endpoint, error = %reason, "bridge transport error");
                self.emit(ConnectionEvent::Error(reason));
            }
            None => {
                info!(endpoint, "bridge transport closed");
                self.emit(ConnectionEvent::Close);
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match protocol::decode(text) {
            Ok(Inbound::Publish { topic, msg }) => {
                let slots: Vec<Arc<SubscriberSlot>> = lock(&self.topics)
                    .get(&topic)
                    .map(|entry| entry.slots.clone())
                    .unwrap_or_default();
                for slot in slots {
                    slot.deliver(&topic, &msg);
                }
            }
            Ok(Inbound::ServiceResponse { id, service, values, result }) => {
                let Some(id) = id else {
                    warn!(service = %service, "service response without id");
                    return;
                };
                let Some(tx) = lock(&self.pending).remove(&id) else {
                    debug!(id = %id, "unmatched service response");
                    return;
                };
                let outcome = if result {
                    Ok(ServiceResponse {
                        success: protocol::values_success(&values),
                        values,
                    })
                } else {
                    Err(GncError::ServiceFailed {
                        service,
                        message: protocol::failure_message(&values),
                    })
                };
                let _ = tx.send(outcome);
            }
            Ok(Inbound::Status { level, msg }) => {
                info!(level = level.as_deref().unwrap_or("info"), msg = %msg, "broker status");
            }
            Ok(Inbound::Unknown) => debug!("ignoring unsupported broker op"),
            Err(e) => warn!(error = %e, "undecodable broker frame"),
        }
    }
}

async fn run_link(
    inner: Arc<Shared>,
    connector: Arc<dyn Connector>,
    endpoint: String,
    generation: u64,
) {
    let mut link = match connector.open(&endpoint).await {
        Ok(link) => link,
        Err(e) => {
            inner.finish(&endpoint, generation, Some(e.to_string()));
            return;
        }
    };

    let (queue, mut frames) = mpsc::unbounded_channel::<String>();
    let Some(replay) = inner.install(generation, queue) else {
        link.close().await;
        return;
    };

    if let Err(e) = announce(link.as_mut(), replay).await {
        inner.finish(&endpoint, generation, Some(e.to_string()));
        return;
    }
    if !inner.activate(&endpoint, generation) {
        link.close().await;
        return;
    }

    let failure = pump(&inner, link.as_mut(), &mut frames, generation).await;
    inner.finish(&endpoint, generation, failure);
}

async fn announce(link: &mut dyn Link, replay: Vec<String>) -> Result<(), GncError> {
    for frame in replay {
        link.send(frame).await?;
    }
    Ok(())
}

/// Shuttle frames until the link ends.  Returns the failure reason, or `None`
/// for a clean close.
///
/// The outbound queue is polled first so a `close()` is noticed before any
/// further inbound frame is dispatched.
async fn pump(
    inner: &Shared,
    link: &mut dyn Link,
    frames: &mut mpsc::UnboundedReceiver<String>,
    generation: u64,
) -> Option<String> {
    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(text) => {
                    if let Err(e) = link.send(text).await {
                        return Some(e.to_string());
                    }
                }
                None => {
                    link.close().await;
                    return None;
                }
            },
            inbound = link.recv() => match inbound {
                Some(Ok(text)) if inner.is_current(generation) => inner.dispatch(&text),
                Some(Ok(_)) => {
                    link.close().await;
                    return None;
                }
                Some(Err(e)) => return Some(e.to_string()),
                None => return None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackBroker;
    use gnc_types::{Orientation, StringMsg};
    use serde_json::json;
    use std::time::Duration;

    const MODE_TOPIC: &str = "/gnc/control_mode";
    const STRING_TYPE: &str = "std_msgs/String";
    const ATTITUDE_TOPIC: &str = "/gnc/attitude";
    const QUATERNION_TYPE: &str = "geometry_msgs/Quaternion";

    fn make_session() -> (LoopbackBroker, BridgeSession) {
        let broker = LoopbackBroker::new();
        let session = BridgeSession::with_connector("ws://loopback:9090", Arc::new(broker.clone()));
        (broker, session)
    }

    async fn connected_session() -> (LoopbackBroker, BridgeSession) {
        let (broker, session) = make_session();
        let mut events = session.events();
        session.connect().unwrap();
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connection);
        (broker, session)
    }

    #[tokio::test]
    async fn connect_emits_connection_and_flips_flag() {
        let (_broker, session) = connected_session().await;
        assert!(session.is_connected());
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn invalid_endpoint_fails_synchronously() {
        let session = BridgeSession::with_connector("http://nope", Arc::new(LoopbackBroker::new()));
        assert!(matches!(session.connect(), Err(GncError::InvalidEndpoint { .. })));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn connect_outside_runtime_is_a_transport_error() {
        let broker = Arc::new(LoopbackBroker::new());
        let session = BridgeSession::with_connector("ws://loopback", broker);
        assert!(matches!(session.connect(), Err(GncError::Transport(_))));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn refused_connection_emits_error_and_stays_disconnected() {
        let (broker, session) = make_session();
        broker.set_refusing(true);
        let mut events = session.events();
        session.connect().unwrap();

        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::Error(_)));
        assert!(!session.is_connected());
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_while_connected_is_noop() {
        let (broker, session) = connected_session().await;
        session.connect().unwrap();
        session.connect().unwrap();
        tokio::task::yield_now().await;
        assert_eq!(broker.open_count(), 1);
    }

    #[tokio::test]
    async fn is_connected_tracks_most_recent_event() {
        let (broker, session) = make_session();
        let mut events = session.events();

        session.connect().unwrap();
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connection);
        assert!(session.is_connected());

        broker.fail_link("protocol error");
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Error("Bridge transport error: protocol error".to_string())
        );
        assert!(!session.is_connected());

        session.connect().unwrap();
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connection);
        assert!(session.is_connected());

        broker.drop_link();
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Close);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn call_service_resolves_with_matching_response() {
        let (broker, session) = connected_session().await;

        let responder = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker.answer_next_call(json!({ "success": true }), true).await
            })
        };
        let response = session
            .call_service("/gnc/set_mode", json!({ "mode": "Thruster" }))
            .await
            .unwrap();
        assert!(response.success);

        let request = responder.await.unwrap().unwrap();
        assert_eq!(request["service"], "/gnc/set_mode");
        assert_eq!(request["args"]["mode"], "Thruster");
    }

    #[tokio::test]
    async fn call_service_reports_values_success_false() {
        let (broker, session) = connected_session().await;
        let b = broker.clone();
        tokio::spawn(async move { b.answer_next_call(json!({ "success": false }), true).await });

        let response = session.call_service("/gnc/set_mode", json!({})).await.unwrap();
        assert!(!response.success);
    }

    #[tokio::test]
    async fn call_service_rejects_on_explicit_failure() {
        let (broker, session) = connected_session().await;
        let b = broker.clone();
        let failure = json!({ "message": "mode locked" });
        tokio::spawn(async move { b.answer_next_call(failure, false).await });

        let err = session.call_service("/gnc/set_mode", json!({})).await.unwrap_err();
        assert_eq!(
            err,
            GncError::ServiceFailed {
                service: "/gnc/set_mode".to_string(),
                message: "mode locked".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn call_service_while_disconnected_fails_fast() {
        let (_broker, session) = make_session();
        let err = session.call_service("/gnc/set_mode", json!({})).await.unwrap_err();
        assert_eq!(err, GncError::NotConnected);
    }

    #[tokio::test]
    async fn pending_call_fails_when_link_drops() {
        let (broker, session) = connected_session().await;
        let call = {
            let session = session.clone();
            tokio::spawn(async move { session.call_service("/gnc/set_mode", json!({})).await })
        };
        broker.next_frame_with_op("call_service").await.unwrap();
        broker.drop_link();

        assert_eq!(call.await.unwrap().unwrap_err(), GncError::TransportClosed);
    }

    #[tokio::test]
    async fn unanswered_call_stalls_while_connected() {
        let (_broker, session) = connected_session().await;
        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            session.call_service("/gnc/set_mode", json!({})),
        )
        .await;
        assert!(outcome.is_err(), "no timeout is enforced by the session");
    }

    #[tokio::test]
    async fn concurrent_calls_are_correlated_by_id() {
        let (broker, session) = connected_session().await;

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.call_service("/a", json!({})).await })
        };
        let a = broker.next_frame_with_op("call_service").await.unwrap();
        let second = {
            let session = session.clone();
            tokio::spawn(async move { session.call_service("/b", json!({})).await })
        };
        let b = broker.next_frame_with_op("call_service").await.unwrap();

        // Answer out of order.
        broker.respond(b["id"].as_str().unwrap(), "/b", json!({ "tag": "b" }), true);
        broker.respond(a["id"].as_str().unwrap(), "/a", json!({ "tag": "a" }), true);

        assert_eq!(first.await.unwrap().unwrap().values["tag"], "a");
        assert_eq!(second.await.unwrap().unwrap().values["tag"], "b");
    }

    #[tokio::test]
    async fn subscription_receives_decoded_messages_in_order() {
        let (broker, session) = connected_session().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = session.subscribe_topic(MODE_TOPIC, STRING_TYPE, move |m: StringMsg| {
            let _ = tx.send(m.data);
        });

        let subscribe = broker.next_frame_with_op("subscribe").await.unwrap();
        assert_eq!(subscribe["topic"], "/gnc/control_mode");
        assert_eq!(subscribe["type"], "std_msgs/String");

        broker.publish("/gnc/control_mode", json!({ "data": "CMG" }));
        broker.publish("/gnc/control_mode", json!({ "data": "Torque" }));
        assert_eq!(rx.recv().await.unwrap(), "CMG");
        assert_eq!(rx.recv().await.unwrap(), "Torque");
    }

    #[tokio::test]
    async fn multiple_subscriptions_on_one_topic_all_fire() {
        let (broker, session) = connected_session().await;
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let _a = session.subscribe_topic(ATTITUDE_TOPIC, QUATERNION_TYPE, move |q: Orientation| {
            let _ = tx1.send(q);
        });
        let _b = session.subscribe_topic(ATTITUDE_TOPIC, QUATERNION_TYPE, move |q: Orientation| {
            let _ = tx2.send(q);
        });
        assert_eq!(session.subscriber_count("/gnc/attitude"), 2);
        let subscribe = broker.next_frame_with_op("subscribe").await.unwrap();
        assert_eq!(subscribe["topic"], "/gnc/attitude");

        broker.publish("/gnc/attitude", json!({ "x": 0.0, "y": 0.0, "z": 0.0, "w": 1.0 }));
        assert_eq!(rx1.recv().await.unwrap().w, 1.0);
        assert_eq!(rx2.recv().await.unwrap().w, 1.0);

        // Only one broker-side subscribe for the shared topic.
        assert!(broker.drain_frames().await.iter().all(|f| f["op"] != "subscribe"));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_even_while_topic_is_live() {
        let (broker, session) = connected_session().await;
        let (tx_gone, mut rx_gone) = mpsc::unbounded_channel();
        let (tx_kept, mut rx_kept) = mpsc::unbounded_channel();
        let mut gone = session.subscribe_topic(MODE_TOPIC, STRING_TYPE, move |m: StringMsg| {
            let _ = tx_gone.send(m.data);
        });
        let _kept = session.subscribe_topic(MODE_TOPIC, STRING_TYPE, move |m: StringMsg| {
            let _ = tx_kept.send(m.data);
        });

        broker.publish("/gnc/control_mode", json!({ "data": "CMG" }));
        assert_eq!(rx_gone.recv().await.unwrap(), "CMG");
        assert_eq!(rx_kept.recv().await.unwrap(), "CMG");

        gone.unsubscribe();
        assert!(!gone.is_active());

        broker.publish("/gnc/control_mode", json!({ "data": "Torque" }));
        assert_eq!(rx_kept.recv().await.unwrap(), "Torque");
        assert!(rx_gone.try_recv().is_err(), "unsubscribed callback must not fire");
    }

    #[tokio::test]
    async fn last_unsubscribe_tells_the_broker() {
        let (broker, session) = connected_session().await;
        let sub = session.subscribe_topic(MODE_TOPIC, STRING_TYPE, |_: StringMsg| {});
        broker.next_frame_with_op("subscribe").await.unwrap();

        drop(sub);
        let frame = broker.next_frame_with_op("unsubscribe").await.unwrap();
        assert_eq!(frame["topic"], "/gnc/control_mode");
        assert_eq!(session.subscriber_count("/gnc/control_mode"), 0);
    }

    #[tokio::test]
    async fn subscriptions_are_replayed_after_reconnect() {
        let (broker, session) = make_session();
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Registered while disconnected.
        let _sub = session.subscribe_topic(MODE_TOPIC, STRING_TYPE, move |m: StringMsg| {
            let _ = tx.send(m.data);
        });

        let mut events = session.events();
        session.connect().unwrap();
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connection);
        let subscribe = broker.next_frame_with_op("subscribe").await.unwrap();
        assert_eq!(subscribe["topic"], MODE_TOPIC);

        broker.drop_link();
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Close);
        session.connect().unwrap();
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connection);
        let subscribe = broker.next_frame_with_op("subscribe").await.unwrap();
        assert_eq!(subscribe["topic"], MODE_TOPIC);

        broker.publish("/gnc/control_mode", json!({ "data": "Thruster" }));
        assert_eq!(rx.recv().await.unwrap(), "Thruster");
    }

    #[tokio::test]
    async fn undecodable_message_is_skipped() {
        let (broker, session) = connected_session().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = session.subscribe_topic(ATTITUDE_TOPIC, QUATERNION_TYPE, move |q: Orientation| {
            let _ = tx.send(q);
        });

        broker.publish("/gnc/attitude", json!({ "data": "not a quaternion" }));
        broker.inject("{garbage");
        broker.publish("/gnc/attitude", json!({ "x": 1.0, "y": 0.0, "z": 0.0, "w": 0.0 }));
        assert_eq!(rx.recv().await.unwrap().x, 1.0);
    }

    #[tokio::test]
    async fn close_emits_close_once_and_closes_link_gracefully() {
        let (broker, session) = connected_session().await;
        let mut events = session.events();

        session.close();
        session.close();
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Close);
        assert!(!session.is_connected());

        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.graceful_close_count() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("link must be closed gracefully");
        assert!(events.try_recv().is_err(), "stale link end must not emit a second event");
    }

    #[tokio::test]
    async fn publish_requires_connection() {
        let (broker, session) = make_session();
        assert_eq!(session.publish("/gnc/cmd", json!({ "data": 1 })), Err(GncError::NotConnected));

        let mut events = session.events();
        session.connect().unwrap();
        events.recv().await.unwrap();
        session.publish("/gnc/cmd", json!({ "data": 1 })).unwrap();
        let frame = broker.next_frame_with_op("publish").await.unwrap();
        assert_eq!(frame["topic"], "/gnc/cmd");
    }

    /// Opens links whose sends wait on `gate`, or fail outright.
    struct GatedConnector {
        gate: Arc<tokio::sync::Semaphore>,
        fail_sends: bool,
    }

    struct GatedLink {
        gate: Arc<tokio::sync::Semaphore>,
        fail_sends: bool,
    }

    #[async_trait::async_trait]
    impl Connector for GatedConnector {
        async fn open(&self, _endpoint: &str) -> Result<Box<dyn Link>, GncError> {
            Ok(Box::new(GatedLink {
                gate: Arc::clone(&self.gate),
                fail_sends: self.fail_sends,
            }))
        }
    }

    #[async_trait::async_trait]
    impl Link for GatedLink {
        async fn send(&mut self, _text: String) -> Result<(), GncError> {
            if self.fail_sends {
                return Err(GncError::Transport("write refused".to_string()));
            }
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<String, GncError>> {
            std::future::pending().await
        }

        async fn close(&mut self) {}
    }

    fn gated_session(fail_sends: bool) -> (Arc<tokio::sync::Semaphore>, BridgeSession) {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let connector = GatedConnector {
            gate: Arc::clone(&gate),
            fail_sends,
        };
        (gate, BridgeSession::with_connector("ws://gated:9090", Arc::new(connector)))
    }

    #[tokio::test]
    async fn close_during_replay_never_reports_connected() {
        let (gate, session) = gated_session(false);
        let _sub = session.subscribe_topic(MODE_TOPIC, STRING_TYPE, |_: StringMsg| {});
        let mut events = session.events();

        session.connect().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert!(!session.is_connected());

        session.close();
        gate.add_permits(8);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Close);
        assert!(events.try_recv().is_err(), "no Connection may follow Close");
        assert!(!session.is_connected());
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connected_only_after_replay_completes() {
        let (gate, session) = gated_session(false);
        let _sub = session.subscribe_topic(MODE_TOPIC, STRING_TYPE, |_: StringMsg| {});
        let mut events = session.events();

        session.connect().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!session.is_connected());
        assert_eq!(
            session.call_service("/gnc/set_mode", json!({})).await.unwrap_err(),
            GncError::NotConnected
        );

        gate.add_permits(1);
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connection);
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn failed_replay_emits_error_without_connection() {
        let (_gate, session) = gated_session(true);
        let _sub = session.subscribe_topic(MODE_TOPIC, STRING_TYPE, |_: StringMsg| {});
        let mut events = session.events();

        session.connect().unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Error("Bridge transport error: write refused".to_string())
        );
        assert!(events.try_recv().is_err());
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_kill_the_link() {
        let (broker, session) = connected_session().await;
        let _bad = session.subscribe_topic(MODE_TOPIC, STRING_TYPE, |_: StringMsg| {
            panic!("subscriber bug");
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _good = session.subscribe_topic(MODE_TOPIC, STRING_TYPE, move |m: StringMsg| {
            let _ = tx.send(m.data);
        });

        broker.publish("/gnc/control_mode", json!({ "data": "Torque" }));
        assert_eq!(rx.recv().await.unwrap(), "Torque");
        assert!(session.is_connected());

        let b = broker.clone();
        tokio::spawn(async move { b.answer_next_call(json!({ "success": true }), true).await });
        let response = session.call_service("/gnc/set_mode", json!({})).await.unwrap();
        assert!(response.success);
    }

    #[tokio::test]
    async fn messages_queued_before_close_are_not_delivered() {
        let (broker, session) = connected_session().await;
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        let _sub = session.subscribe_topic(MODE_TOPIC, STRING_TYPE, move |_: StringMsg| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for data in ["CMG", "Torque", "Thruster"] {
            broker.publish("/gnc/control_mode", json!({ "data": data }));
        }
        session.close();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
