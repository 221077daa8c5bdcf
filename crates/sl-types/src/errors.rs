use thiserror::Error;

use crate::graph::WorkerId;
use crate::token::Token;

/// Main error type for the Sluice system
#[derive(Error, Debug)]
pub enum SlError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Placement error: {0}")]
    Placement(#[from] PlacementError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Drain error: {0}")]
    Drain(#[from] DrainError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised while building, reading, or decoding configurations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid construction: {message}")]
    Construction { message: String },

    #[error("Parameter {name} is a {actual}, not a {expected}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Worker identifier {worker} is not in the given stream graph")]
    GraphMismatch { worker: WorkerId },

    #[error("Malformed document: {message}")]
    Document { message: String },

    #[error("No codec registered for class {class}")]
    UnknownDiscriminator { class: String },
}

/// Errors raised when a blob placement violates the partition invariants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    #[error("Machine {machine} out of range ({machines} machines)")]
    MachineOutOfRange { machine: usize, machines: usize },

    #[error("Allocating {requested} cores but only {available} available on machine {machine}")]
    InsufficientCores {
        machine: usize,
        requested: usize,
        available: usize,
    },

    #[error("All blobs must be assigned at least one core")]
    ZeroCores,

    #[error("Blob factory {factory} not in universe")]
    UnregisteredFactory { factory: String },

    #[error("Blob factory {factory} already added")]
    DuplicateFactory { factory: String },

    #[error("Worker {worker} already assigned to a blob")]
    WorkerAlreadyAssigned { worker: WorkerId },

    #[error("Uninitialized worker identifier: {worker}")]
    UnassignedWorkerIdentifier { worker: String },

    #[error("Blob contains no workers")]
    EmptyBlob,
}

/// Errors surfaced by boundary channels. Transient link failures never reach
/// callers; they are recovered by reconnecting.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Channel IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Channel {name} ended without a report")]
    Stopped { name: String },
}

/// Errors raised by the drain protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DrainError {
    #[error("Blob {blob} is not part of the active configuration")]
    UnknownBlob { blob: Token },

    #[error("No configuration is running")]
    NotRunning,

    #[error("Drain already in progress")]
    AlreadyDraining,

    #[error("Drain timed out with {} blob(s) pending: {pending:?}", pending.len())]
    Timeout { pending: Vec<Token> },

    #[error("Node {node} failed: {message}")]
    NodeFailed { node: usize, message: String },
}

/// Result type alias for Sluice operations
pub type SlResult<T> = Result<T, SlError>;

/// Macro for creating construction errors
#[macro_export]
macro_rules! construction_error {
    ($($arg:tt)*) => {
        $crate::ConfigError::Construction { message: format!($($arg)*) }
    };
}

/// Macro for creating document errors
#[macro_export]
macro_rules! document_error {
    ($($arg:tt)*) => {
        $crate::ConfigError::Document { message: format!($($arg)*) }
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::SlError::Internal(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = PlacementError::InsufficientCores {
            machine: 0,
            requested: 3,
            available: 2,
        };

        assert!(error.to_string().contains("3 cores"));
        assert!(error.to_string().contains("only 2 available"));
    }

    #[test]
    fn test_error_conversion() {
        let placement = PlacementError::WorkerAlreadyAssigned {
            worker: WorkerId(4),
        };
        let sl_error: SlError = placement.into();

        match sl_error {
            SlError::Placement(_) => (),
            _ => panic!("Expected Placement error"),
        }
    }

    #[test]
    fn test_timeout_lists_pending() {
        let error = DrainError::Timeout {
            pending: vec![Token::edge(WorkerId(1), WorkerId(2))],
        };
        assert!(error.to_string().contains("1 blob(s) pending"));
    }

    #[test]
    fn test_macros() {
        let construction = construction_error!("bad range {}..{}", 3, 1);
        assert!(matches!(construction, ConfigError::Construction { .. }));
        let _document = document_error!("missing field {}", "params");
        let _internal = internal_error!("Something went wrong");
    }
}
