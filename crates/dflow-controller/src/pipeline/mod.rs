//! Flow pipeline contract: table layout, cookie allocation, the switch
//! session and the idempotent install/remove primitives.

mod contract;
mod cookies;
mod session;
mod tables;

pub use contract::{FlowPipeline, PipelineStats};
pub use cookies::{CookieRegistry, CookieSlot};
pub use session::{SessionState, SwitchSession};
pub use tables::{PriorityBand, Table};

use thiserror::Error;

/// Start-up configuration errors of the pipeline. All of them are fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("cookie slot {name} needs {requested} bits, only {available} left")]
    CookieBudgetExceeded { name: String, requested: u8, available: u8 },

    #[error("cookie slot {0} reserved twice")]
    DuplicateCookie(String),

    #[error("cookie slot {name} has invalid width {width}")]
    InvalidCookieWidth { name: String, width: u8 },

    #[error("value {value} does not fit in {width} cookie bits")]
    CookieValueOverflow { value: u64, width: u8 },
}
