use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Attitude-control mode reported on `/gnc/control_mode` and requested via
/// `/gnc/set_mode`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ControlMode {
    /// Control moment gyroscopes (the nominal mode).
    #[default]
    Cmg,
    /// Reaction-wheel / magnetorquer torque control.
    Torque,
    /// Reaction-control thrusters.
    Thruster,
    /// Any mode string the dashboard does not know about, kept verbatim.
    Other(String),
}

impl ControlMode {
    /// Parse the wire representation (case-insensitive).  Unknown strings are
    /// preserved as [`ControlMode::Other`].
    pub fn from_wire(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "cmg" => ControlMode::Cmg,
            "torque" => ControlMode::Torque,
            "thruster" => ControlMode::Thruster,
            _ => ControlMode::Other(trimmed.to_string()),
        }
    }

    /// The string sent to the broker in `/gnc/set_mode` requests.
    pub fn as_wire(&self) -> &str {
        match self {
            ControlMode::Cmg => "CMG",
            ControlMode::Torque => "Torque",
            ControlMode::Thruster => "Thruster",
            ControlMode::Other(raw) => raw,
        }
    }

    /// Human-readable label, e.g. `"Torque Control"`.
    pub fn label(&self) -> String {
        format!("{} Control", self.as_wire())
    }

    /// The mode the toggle button switches to: `CMG → Torque → Thruster → CMG`.
    /// Unknown modes fall back to CMG.
    pub fn next(&self) -> Self {
        match self {
            ControlMode::Cmg => ControlMode::Torque,
            ControlMode::Torque => ControlMode::Thruster,
            ControlMode::Thruster | ControlMode::Other(_) => ControlMode::Cmg,
        }
    }
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

impl Serialize for ControlMode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_wire())
    }
}

impl<'de> Deserialize<'de> for ControlMode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ControlMode::from_wire(&raw))
    }
}

/// `std_msgs/String` payload, e.g. `{"data": "Torque"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringMsg {
    pub data: String,
}

/// `geometry_msgs/Quaternion` payload: spacecraft attitude as a unit
/// quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Orientation {
    /// Euclidean norm of the quaternion.
    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z + self.w * self.w).sqrt()
    }

    /// Roll, pitch and yaw in degrees (ZYX convention).
    pub fn euler_degrees(&self) -> (f64, f64, f64) {
        let Orientation { x, y, z, w } = *self;
        let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
        let sin_pitch = (2.0 * (w * y - z * x)).clamp(-1.0, 1.0);
        let pitch = sin_pitch.asin();
        let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));
        (roll.to_degrees(), pitch.to_degrees(), yaw.to_degrees())
    }
}

/// Lifecycle state of the single broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Lifecycle notification emitted by the bridge session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "detail", rename_all = "lowercase")]
pub enum ConnectionEvent {
    /// The transport is open.
    Connection,
    /// The transport failed; the reason is informational only.
    Error(String),
    /// The transport closed.
    Close,
}

impl ConnectionEvent {
    /// Whether this event leaves the session connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionEvent::Connection)
    }
}

/// Reply to a service call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub success: bool,
    /// Service-specific response fields (`null` when the broker sent none).
    #[serde(default)]
    pub values: serde_json::Value,
}

/// Error type shared by the bridge, the dashboard and the CLI.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GncError {
    #[error("Invalid bridge endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Bridge is not connected")]
    NotConnected,

    #[error("Bridge transport closed before a reply arrived")]
    TransportClosed,

    #[error("Bridge transport error: {0}")]
    Transport(String),

    #[error("Service {service} failed: {message}")]
    ServiceFailed { service: String, message: String },

    #[error("Bridge Serialization Error: {0}")]
    Serialization(String),
}
