//! `gnc-dashboard` – the GNC status view, headless.
//!
//! Turns bridge traffic into the state a renderer draws: control mode and
//! its toggle colour, attitude health, the connection indicator and the
//! active 3D scene.
//!
//! # Modules
//!
//! - [`state`] – [`DashboardState`] and the observable [`DashboardStore`].
//! - [`mount`] – [`ViewMount`]: subscribes, connects and supervises the
//!   bridge for one mounted view, and releases it all on unmount.
//! - [`mode`] – [`ModeController`]: the `/gnc/set_mode` toggle.
//! - [`telemetry`] – [`init_tracing`]: log format and optional OTLP export.

pub mod mode;
pub mod mount;
pub mod state;
pub mod telemetry;

pub use mode::{ModeController, ModeOutcome, SET_MODE_SERVICE};
pub use mount::{ATTITUDE_TOPIC, MODE_TOPIC, MountConfig, ViewMount};
pub use state::{
    ActiveView, AttitudeStatus, ButtonStyle, DashboardState, DashboardStore, Indicator, Subsystem,
    SubsystemHealth,
};
pub use telemetry::{TracerProviderGuard, init_tracing};
