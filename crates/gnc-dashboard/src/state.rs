//! Derived dashboard state.
//!
//! Nothing here is persisted: every field is recomputed from the latest
//! bridge message, service response or lifecycle event.  The
//! [`DashboardStore`] publishes each change on a [`tokio::sync::watch`]
//! channel so renderers can redraw when the state moves.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gnc_types::{ConnectionEvent, ControlMode, Orientation, StringMsg};
use tokio::sync::watch;

/// Quaternions whose norm strays further than this from 1 are flagged.
const UNIT_NORM_TOLERANCE: f64 = 1e-3;

/// Which 3D scene the rendering engine shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActiveView {
    #[default]
    EarthOrbit,
    SpaceStation,
}

impl ActiveView {
    /// Parse `earth` / `station` (and their long forms).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "earth" | "earth_orbit" | "orbit" => Some(ActiveView::EarthOrbit),
            "station" | "space_station" | "iss" => Some(ActiveView::SpaceStation),
            _ => None,
        }
    }

    /// Short config/CLI name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActiveView::EarthOrbit => "earth",
            ActiveView::SpaceStation => "station",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            ActiveView::EarthOrbit => "Earth Orbit View",
            ActiveView::SpaceStation => "Space Station View",
        }
    }
}

impl fmt::Display for ActiveView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Attitude health derived from the latest orientation sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttitudeStatus {
    /// No orientation received yet.
    #[default]
    Unknown,
    /// The orientation is a valid unit quaternion.
    Stable,
    /// The orientation is not normalised; the estimator output is suspect.
    Degraded,
}

impl AttitudeStatus {
    pub fn from_orientation(q: &Orientation) -> Self {
        let norm = q.norm();
        if norm.is_finite() && (norm - 1.0).abs() <= UNIT_NORM_TOLERANCE {
            AttitudeStatus::Stable
        } else {
            AttitudeStatus::Degraded
        }
    }
}

impl fmt::Display for AttitudeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AttitudeStatus::Unknown => "Unknown",
            AttitudeStatus::Stable => "Stable",
            AttitudeStatus::Degraded => "Degraded",
        })
    }
}

/// Rows of the subsystem panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    AttitudeControl,
    PowerSystem,
    Thermal,
}

impl Subsystem {
    pub const ALL: [Subsystem; 3] = [
        Subsystem::AttitudeControl,
        Subsystem::PowerSystem,
        Subsystem::Thermal,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Subsystem::AttitudeControl => "Attitude Control",
            Subsystem::PowerSystem => "Power System",
            Subsystem::Thermal => "Thermal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsystemHealth {
    Nominal,
    Degraded,
}

impl fmt::Display for SubsystemHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SubsystemHealth::Nominal => "Nominal",
            SubsystemHealth::Degraded => "Degraded",
        })
    }
}

/// Colour of the mode-toggle button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonStyle {
    Blue,
    Orange,
    Red,
}

impl ButtonStyle {
    pub fn for_mode(mode: &ControlMode) -> Self {
        match mode {
            ControlMode::Torque => ButtonStyle::Orange,
            ControlMode::Thruster => ButtonStyle::Red,
            ControlMode::Cmg | ControlMode::Other(_) => ButtonStyle::Blue,
        }
    }

    /// Stylesheet class used by the web front end.
    pub fn css_class(&self) -> &'static str {
        match self {
            ButtonStyle::Blue => "bg-blue-600 hover:bg-blue-700",
            ButtonStyle::Orange => "bg-orange-500 hover:bg-orange-600",
            ButtonStyle::Red => "bg-red-600 hover:bg-red-700",
        }
    }
}

/// Connection indicator light.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    Green,
    Red,
}

/// Everything the status panel and header render.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DashboardState {
    pub mode: ControlMode,
    pub attitude: AttitudeStatus,
    pub orientation: Option<Orientation>,
    pub connected: bool,
    pub view: ActiveView,
    /// A mode change has been requested and is awaiting the broker's reply.
    pub transitioning: bool,
    pub last_telemetry: Option<DateTime<Utc>>,
    /// Reason carried by the most recent transport error, cleared on connect.
    pub last_error: Option<String>,
}

impl DashboardState {
    pub fn new(view: ActiveView) -> Self {
        Self {
            view,
            ..Self::default()
        }
    }

    /// Apply a `/gnc/control_mode` message.
    pub fn apply_mode_message(&mut self, msg: &StringMsg) {
        self.mode = ControlMode::from_wire(&msg.data);
        self.last_telemetry = Some(Utc::now());
    }

    /// Apply a `/gnc/attitude` sample.
    pub fn apply_orientation(&mut self, q: Orientation) {
        self.attitude = AttitudeStatus::from_orientation(&q);
        self.orientation = Some(q);
        self.last_telemetry = Some(Utc::now());
    }

    /// Mirror the most recent lifecycle event.
    pub fn apply_connection_event(&mut self, event: &ConnectionEvent) {
        self.connected = event.is_connected();
        self.last_error = match event {
            ConnectionEvent::Error(reason) => Some(reason.clone()),
            ConnectionEvent::Connection => None,
            ConnectionEvent::Close => self.last_error.take(),
        };
    }

    /// The subsystem panel.  Power and thermal have no telemetry feed and
    /// always read nominal.
    pub fn subsystems(&self) -> [(Subsystem, SubsystemHealth); 3] {
        Subsystem::ALL.map(|subsystem| {
            let health = match (subsystem, self.attitude) {
                (Subsystem::AttitudeControl, AttitudeStatus::Degraded) => {
                    SubsystemHealth::Degraded
                }
                _ => SubsystemHealth::Nominal,
            };
            (subsystem, health)
        })
    }

    pub fn mode_label(&self) -> String {
        self.mode.label()
    }

    pub fn toggle_style(&self) -> ButtonStyle {
        ButtonStyle::for_mode(&self.mode)
    }

    pub fn indicator(&self) -> Indicator {
        if self.connected {
            Indicator::Green
        } else {
            Indicator::Red
        }
    }

    /// One-line header summary, e.g.
    /// `Attitude: Stable | Mode: Torque Control | Bridge: Connected`.
    pub fn status_line(&self) -> String {
        format!(
            "Attitude: {} | Mode: {}{} | Bridge: {}",
            self.attitude,
            self.mode_label(),
            if self.transitioning { " (switching)" } else { "" },
            if self.connected { "Connected" } else { "Disconnected" },
        )
    }
}

/// Shared, observable [`DashboardState`].  Clones share the same state.
#[derive(Clone)]
pub struct DashboardStore {
    tx: Arc<watch::Sender<DashboardState>>,
}

impl DashboardStore {
    pub fn new(initial: DashboardState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Current state.
    pub fn snapshot(&self) -> DashboardState {
        self.tx.borrow().clone()
    }

    /// Mutate the state and notify watchers.
    pub fn update(&self, f: impl FnOnce(&mut DashboardState)) {
        self.tx.send_modify(f);
    }

    /// Mutate the state; watchers are notified only when `f` returns `true`.
    pub fn update_if(&self, f: impl FnOnce(&mut DashboardState) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }

    /// A receiver that wakes on every change.
    pub fn watch(&self) -> watch::Receiver<DashboardState> {
        self.tx.subscribe()
    }
}

impl Default for DashboardStore {
    fn default() -> Self {
        Self::new(DashboardState::default())
    }
}
