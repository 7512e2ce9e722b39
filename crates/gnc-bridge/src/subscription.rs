//! Subscription handles.
//!
//! A [`Subscription`] is the caller's claim on one registration made with
//! [`BridgeSession::subscribe_topic`][crate::session::BridgeSession::subscribe_topic].
//! Releasing it (explicitly or by dropping it) removes the registration and
//! disarms the callback.  Once [`Subscription::unsubscribe`] has returned the
//! callback is never invoked again, even if the connection task is in the
//! middle of dispatching a message on the same topic.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::error;

use crate::session::{Shared, lock};

type Callback = Box<dyn FnMut(&Value) + Send>;

/// One registered callback, shared between the registry and its handle.
pub(crate) struct SubscriberSlot {
    id: u64,
    callback: Mutex<Option<Callback>>,
}

impl SubscriberSlot {
    pub(crate) fn new(id: u64, callback: Callback) -> Self {
        Self {
            id,
            callback: Mutex::new(Some(callback)),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Run the callback on `msg`.  A panicking callback loses that message
    /// only; the slot stays armed.
    pub(crate) fn deliver(&self, topic: &str, msg: &Value) {
        if let Some(callback) = lock(&self.callback).as_mut()
            && catch_unwind(AssertUnwindSafe(|| callback(msg))).is_err()
        {
            error!(topic, slot = self.id, "subscriber callback panicked; message dropped");
        }
    }

    /// Waits for an in-flight delivery to finish.
    fn disarm(&self) {
        lock(&self.callback).take();
    }
}

/// Live registration on a topic.  Dropping the handle unsubscribes.
pub struct Subscription {
    topic: String,
    slot: Arc<SubscriberSlot>,
    inner: Arc<Shared>,
    active: bool,
}

impl Subscription {
    pub(crate) fn new(topic: String, slot: Arc<SubscriberSlot>, inner: Arc<Shared>) -> Self {
        Self {
            topic,
            slot,
            inner,
            active: true,
        }
    }

    /// The subscribed topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// `false` once [`unsubscribe`][Self::unsubscribe] has run.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Remove the registration.  Idempotent.
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.inner.remove_slot(&self.topic, self.slot.id());
        self.slot.disarm();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("slot", &self.slot.id())
            .field("active", &self.active)
            .finish()
    }
}
