//! dflow local controller core.
//!
//! Runs on every hypervisor next to the software switch and turns the
//! northbound intent model (logical switches, ports, security groups) into
//! flows on that one switch.
//!
//! ```text
//! [intent store] ──> [ControllerDaemon] ──> [Dispatcher] ──> apps ──> [FlowPipeline] ──> [switch]
//!                         │                                              ▲
//!                   settle timer ──────────────> [AgingApp] ─────────────┘
//! ```
//!
//! # Key Components
//!
//! - [`pipeline::FlowPipeline`]: the table layout, priority bands, cookie
//!   allocation and idempotent flow edits every app goes through
//! - [`dispatch::Dispatcher`]: derives per-port binding events and delivers
//!   them to apps through their static handler tables
//! - [`aging::AgingApp`]: generation-tagged cookies and the post-reconnect
//!   sweep of stale flows
//! - [`secgroup::SecGroupApp`]: stateful security groups over conntrack and
//!   conjunctive matches
//! - [`daemon::ControllerDaemon`]: the single worker that owns all of it

pub mod audit;
pub mod config;
pub mod model;
pub mod pipeline;
pub mod aging;
pub mod dispatch;
pub mod secgroup;
pub mod daemon;

pub use config::ControllerConfig;
pub use daemon::{Controller, ControllerDaemon, DaemonError, DaemonHandle, IntentEvent};
