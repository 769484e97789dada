//! Error types for coordinator lookup.

use thiserror::Error;

use crate::registry::FieldIdentity;

/// Errors raised while finding the coordinator for a field. Failures of the
/// bulk fetch itself are reported with the fetch's own error type.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The execution context carries no [`Registry`](crate::Registry) for
    /// the current operation.
    #[error("no batch registry in the execution context")]
    MissingRegistry,

    /// The field already has a coordinator, with different key, value or
    /// error types than the ones requested.
    #[error("field {identity} is already bound to a coordinator of a different type")]
    CoordinatorTypeMismatch { identity: FieldIdentity },
}

/// Result type for coordinator lookup.
pub type Result<T, E = Error> = std::result::Result<T, E>;
