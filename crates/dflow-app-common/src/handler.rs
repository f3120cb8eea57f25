//! Outcome of a single event handler invocation.

use dflow_ofproto::OfError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerStatus {
    /// The handler applied the event
    Applied,
    /// The event referenced something not known yet and compiled to nothing
    Deferred,
    /// The handler gave up on the event
    Failed,
}

impl HandlerStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, HandlerStatus::Applied | HandlerStatus::Deferred)
    }
}

#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// The object snapshot is unusable (bad address, out-of-range key)
    #[error("invalid object {object}: {message}")]
    InvalidObject { object: String, message: String },

    /// The switch rejected an edit
    #[error("southbound error: {0}")]
    Southbound(#[from] OfError),

    /// A referenced object is not known locally
    #[error("missing dependency: {dependency}")]
    MissingDependency { dependency: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl HandlerError {
    pub fn invalid_object(object: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerError::InvalidObject {
            object: object.into(),
            message: message.into(),
        }
    }

    pub fn missing(dependency: impl Into<String>) -> Self {
        HandlerError::MissingDependency {
            dependency: dependency.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        HandlerError::Internal {
            message: message.into(),
        }
    }

    pub fn to_status(&self) -> HandlerStatus {
        match self {
            HandlerError::MissingDependency { .. } => HandlerStatus::Deferred,
            HandlerError::InvalidObject { .. }
            | HandlerError::Southbound(_)
            | HandlerError::Internal { .. } => HandlerStatus::Failed,
        }
    }
}

pub type HandlerResult<T> = Result<T, HandlerError>;

pub trait HandlerResultExt {
    fn to_status(&self) -> HandlerStatus;
}

impl<T> HandlerResultExt for HandlerResult<T> {
    fn to_status(&self) -> HandlerStatus {
        match self {
            Ok(_) => HandlerStatus::Applied,
            Err(e) => e.to_status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dflow_ofproto::OfStatus;

    #[test]
    fn test_error_to_status() {
        assert_eq!(
            HandlerError::missing("secgroup sg1").to_status(),
            HandlerStatus::Deferred
        );
        assert_eq!(
            HandlerError::from(OfError::from_status(OfStatus::BadMatch)).to_status(),
            HandlerStatus::Failed
        );
        assert!(HandlerStatus::Deferred.is_success());
        assert!(!HandlerStatus::Failed.is_success());
    }

    #[test]
    fn test_result_ext() {
        let ok: HandlerResult<()> = Ok(());
        assert_eq!(ok.to_status(), HandlerStatus::Applied);
    }
}
