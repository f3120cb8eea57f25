//! Aging of flows left behind by an earlier switch session.
//!
//! Every flow carries a one-bit generation in its cookie. On reconnect the
//! manager reads the previous generation back from a canary flow, flips it,
//! lets every module replay under the new bit and, once the session has
//! settled, deletes whatever still carries the old one.

mod app;
mod generation;

pub use app::{AgingApp, AgingStats};
pub use generation::{Generation, GenerationHandle, GenerationOwner};
