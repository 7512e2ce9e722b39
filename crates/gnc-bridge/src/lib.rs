//! `gnc-bridge` – the telemetry bridge adapter.
//!
//! Owns one transport connection to a rosbridge-compatible broker and gives
//! the dashboard a uniform call/subscribe interface over it, without caring
//! what the telemetry means.
//!
//! # Modules
//!
//! - [`session`] – [`BridgeSession`]: connection lifecycle, service calls,
//!   topic subscriptions and lifecycle events.
//! - [`subscription`] – [`Subscription`]: scoped handle that unsubscribes on
//!   release.
//! - [`health`] – [`HealthMonitor`]: fixed-interval reconnect loop.
//! - [`protocol`] – rosbridge v2 JSON envelopes.
//! - [`transport`] – the [`Connector`] / [`Link`] seam and the WebSocket
//!   implementation.
//! - [`loopback`] – [`LoopbackBroker`]: in-process broker for tests and demos.

pub mod health;
pub mod loopback;
pub mod protocol;
pub mod session;
pub mod subscription;
pub mod transport;

pub use health::{DEFAULT_HEALTH_INTERVAL, HealthCheck, HealthMonitor};
pub use loopback::LoopbackBroker;
pub use session::{BridgeSession, DEFAULT_ENDPOINT};
pub use subscription::Subscription;
pub use transport::{Connector, Link, WsConnector};
