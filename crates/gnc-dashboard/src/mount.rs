//! [`ViewMount`] – everything one mounted dashboard view holds on the bridge.
//!
//! Mounting wires a [`BridgeSession`] to a [`DashboardStore`]:
//!
//! 1. a lifecycle listener mirrors `connection` / `error` / `close` events
//!    into the connection indicator,
//! 2. the control-mode and attitude topics feed the status panel,
//! 3. an initial connect is issued,
//! 4. a [`HealthMonitor`] re-issues `connect` whenever the link is down.
//!
//! Unmounting releases all of it exactly once.

use std::time::Duration;

use gnc_bridge::{BridgeSession, DEFAULT_HEALTH_INTERVAL, HealthMonitor, Subscription};
use gnc_types::{ConnectionEvent, GncError, Orientation, StringMsg};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::mode::ModeController;
use crate::state::{ActiveView, DashboardState, DashboardStore};

pub const MODE_TOPIC: &str = "/gnc/control_mode";
pub const MODE_MSG_TYPE: &str = "std_msgs/String";
pub const ATTITUDE_TOPIC: &str = "/gnc/attitude";
pub const ATTITUDE_MSG_TYPE: &str = "geometry_msgs/Quaternion";

/// Knobs for [`ViewMount::mount`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountConfig {
    /// Period of the reconnect health check.
    pub health_interval: Duration,
    pub mode_topic: String,
    pub attitude_topic: String,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            health_interval: DEFAULT_HEALTH_INTERVAL,
            mode_topic: MODE_TOPIC.to_string(),
            attitude_topic: ATTITUDE_TOPIC.to_string(),
        }
    }
}

/// A mounted dashboard view.  Dropping it unmounts.
pub struct ViewMount {
    session: BridgeSession,
    store: DashboardStore,
    controller: ModeController,
    monitor: Option<HealthMonitor>,
    subscriptions: Vec<Subscription>,
    listener: Option<JoinHandle<()>>,
}

impl ViewMount {
    /// Mount `view` on `session`, publishing derived state into `store`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// The synchronous failures of [`BridgeSession::connect`]: an invalid
    /// endpoint or a missing runtime.  Nothing is left running in that case.
    /// A broker that is merely unreachable is not an error; the health check
    /// keeps retrying.
    pub fn mount(
        session: BridgeSession,
        store: DashboardStore,
        view: ActiveView,
        config: &MountConfig,
    ) -> Result<Self, GncError> {
        store.update(|s| *s = DashboardState::new(view));

        // Registered before connecting so the first event is not missed.
        let events = session.events();
        session.connect()?;
        info!(endpoint = %session.endpoint(), view = %view, "dashboard view mounted");

        let listener = tokio::spawn(follow_lifecycle(events, session.clone(), store.clone()));

        let mode_store = store.clone();
        let mode = session.subscribe_topic(
            config.mode_topic.clone(),
            MODE_MSG_TYPE,
            move |msg: StringMsg| {
                debug!(mode = %msg.data, "control mode telemetry");
                mode_store.update(|s| s.apply_mode_message(&msg));
            },
        );
        let attitude_store = store.clone();
        let attitude = session.subscribe_topic(
            config.attitude_topic.clone(),
            ATTITUDE_MSG_TYPE,
            move |q: Orientation| attitude_store.update(|s| s.apply_orientation(q)),
        );

        let monitor = HealthMonitor::spawn(session.clone(), config.health_interval);

        Ok(Self {
            controller: ModeController::new(session.clone(), store.clone()),
            session,
            store,
            monitor: Some(monitor),
            subscriptions: vec![mode, attitude],
            listener: Some(listener),
        })
    }

    pub fn store(&self) -> &DashboardStore {
        &self.store
    }

    pub fn session(&self) -> &BridgeSession {
        &self.session
    }

    pub fn mode_controller(&self) -> &ModeController {
        &self.controller
    }

    /// Switch the 3D scene.  The bridge is unaffected.
    pub fn set_view(&self, view: ActiveView) {
        self.store.update(|s| s.view = view);
    }

    pub fn is_mounted(&self) -> bool {
        self.listener.is_some()
    }

    /// Stop the health check, drop both subscriptions and close the bridge.
    /// Returns `true` only for the call that actually released them.
    pub fn unmount(&mut self) -> bool {
        let Some(listener) = self.listener.take() else {
            return false;
        };
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop();
        }
        for mut subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        listener.abort();
        self.session.close();
        self.store.update(|s| {
            s.connected = false;
            s.transitioning = false;
        });
        info!(endpoint = %self.session.endpoint(), "dashboard view unmounted");
        true
    }
}

impl Drop for ViewMount {
    fn drop(&mut self) {
        self.unmount();
    }
}

async fn follow_lifecycle(
    mut events: broadcast::Receiver<ConnectionEvent>,
    session: BridgeSession,
    store: DashboardStore,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                match &event {
                    ConnectionEvent::Connection => info!("connected to bridge"),
                    ConnectionEvent::Error(reason) => error!(error = %reason, "bridge error"),
                    ConnectionEvent::Close => info!("bridge connection closed"),
                }
                store.update(|s| s.apply_connection_event(&event));
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "lifecycle listener lagged; resyncing");
                let connected = session.is_connected();
                store.update(|s| s.connected = connected);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
