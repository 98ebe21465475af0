//! Error types for the settlement engine
//!
//! Every rejected precondition surfaces as a typed error carrying enough
//! context (ids, current state, expected-vs-actual amounts) for the caller
//! to correct its input or abandon the operation. Nothing is retried
//! internally and there is no silent failure path.

use thiserror::Error;

use crate::models::ServiceId;

/// Main error type for settlement operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Caller does not hold the role the operation requires
    #[error("not authorized: {operation} requires {required_role} (caller: {caller})")]
    NotAuthorized {
        operation: &'static str,
        required_role: &'static str,
        caller: String,
    },

    /// Operation is not valid for the entity's current status
    #[error("invalid state: {entity} is {current}, cannot {operation}")]
    InvalidState {
        entity: String,
        current: String,
        operation: &'static str,
    },

    /// Milestone sequencing violated
    #[error(
        "milestone {index} of service {service_id} cannot start: milestone {waiting_on} is not yet approved"
    )]
    OutOfOrder {
        service_id: ServiceId,
        index: usize,
        waiting_on: usize,
    },

    /// Amounts do not reconcile (milestone sum vs total, or allocation vs remainder)
    #[error("amount mismatch: expected {expected}, got {actual}")]
    AmountMismatch { expected: i64, actual: i64 },

    /// Account balance cannot cover the requested movement
    #[error("insufficient funds on {account}: required {required}, available {available}")]
    InsufficientFunds {
        account: String,
        required: i64,
        available: i64,
    },

    /// Milestone funds were already released
    #[error("milestone {index} of service {service_id} was already released")]
    AlreadyReleased { service_id: ServiceId, index: usize },

    /// A second review from the same reviewer for the same service
    #[error("duplicate review for service {service_id} by {reviewer}")]
    DuplicateReview {
        service_id: ServiceId,
        reviewer: String,
    },

    /// Contractor already holds a profile
    #[error("contractor {contractor} is already registered")]
    AlreadyRegistered { contractor: String },

    /// Unknown id
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Request-shape validation errors
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Create a not-authorized error
    pub fn not_authorized(
        operation: &'static str,
        required_role: &'static str,
        caller: impl Into<String>,
    ) -> Self {
        Self::NotAuthorized {
            operation,
            required_role,
            caller: caller.into(),
        }
    }

    /// Create an invalid-state error for a service
    pub fn invalid_service_state(
        service_id: ServiceId,
        current: impl std::fmt::Debug,
        operation: &'static str,
    ) -> Self {
        Self::InvalidState {
            entity: format!("service {}", service_id),
            current: format!("{:?}", current),
            operation,
        }
    }

    /// Create an invalid-state error for a milestone
    pub fn invalid_milestone_state(
        service_id: ServiceId,
        index: usize,
        current: impl std::fmt::Debug,
        operation: &'static str,
    ) -> Self {
        Self::InvalidState {
            entity: format!("milestone {} of service {}", index, service_id),
            current: format!("{:?}", current),
            operation,
        }
    }

    /// Create a not-found error
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_carry_context_in_display() {
        let err = EngineError::OutOfOrder {
            service_id: 7,
            index: 2,
            waiting_on: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("milestone 2"));
        assert!(msg.contains("service 7"));
        assert!(msg.contains("milestone 1"));

        let err = EngineError::InsufficientFunds {
            account: "alice".to_string(),
            required: 300,
            available: 100,
        };
        assert!(err.to_string().contains("required 300"));
    }
}
