//! [`ModeController`] – the control-mode toggle.
//!
//! A request raises the store's transition flag, calls
//! [`SET_MODE_SERVICE`] and only changes the displayed mode when the broker
//! confirms.  The flag is lowered on every exit path, including when the
//! request future is dropped mid-flight.

use gnc_bridge::BridgeSession;
use gnc_types::{ControlMode, GncError};
use serde_json::json;
use tracing::{info, warn};

use crate::state::DashboardStore;

/// Service that switches the attitude-control mode.
pub const SET_MODE_SERVICE: &str = "/gnc/set_mode";

/// What became of a mode request that reached the broker (or didn't need to).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeOutcome {
    /// The broker accepted the mode and the dashboard now shows it.
    Applied(ControlMode),
    /// The broker answered `success: false`; the displayed mode is unchanged.
    Rejected(ControlMode),
    /// Another request is still in flight; nothing was sent.
    Busy,
}

/// Issues mode changes for one dashboard.
#[derive(Clone)]
pub struct ModeController {
    session: BridgeSession,
    store: DashboardStore,
}

impl ModeController {
    pub fn new(session: BridgeSession, store: DashboardStore) -> Self {
        Self { session, store }
    }

    /// Ask the broker to switch to `mode`.
    ///
    /// # Errors
    ///
    /// Any [`GncError`] from the service call.  The displayed mode is left
    /// unchanged in that case.
    pub async fn request_mode(&self, mode: ControlMode) -> Result<ModeOutcome, GncError> {
        let started = self.store.update_if(|s| {
            if s.transitioning {
                false
            } else {
                s.transitioning = true;
                true
            }
        });
        if !started {
            return Ok(ModeOutcome::Busy);
        }
        let _transition = TransitionGuard(&self.store);

        let result = self
            .session
            .call_service(SET_MODE_SERVICE, json!({ "mode": mode.as_wire() }))
            .await;

        match result {
            Ok(response) if response.success => {
                info!(mode = %mode, "control mode changed");
                let applied = mode.clone();
                self.store.update(move |s| s.mode = applied);
                Ok(ModeOutcome::Applied(mode))
            }
            Ok(response) => {
                warn!(mode = %mode, values = %response.values, "mode change rejected");
                Ok(ModeOutcome::Rejected(mode))
            }
            Err(e) => {
                warn!(mode = %mode, error = %e, "mode change failed");
                Err(e)
            }
        }
    }

    /// Switch to the mode after the one currently displayed.
    pub async fn toggle(&self) -> Result<ModeOutcome, GncError> {
        let next = self.store.snapshot().mode.next();
        self.request_mode(next).await
    }
}

/// Lowers the transition flag when dropped.
struct TransitionGuard<'a>(&'a DashboardStore);

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        self.0.update(|s| s.transitioning = false);
    }
}
