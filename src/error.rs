use std::sync::Arc;

use thiserror::Error;

/// Errors raised by the engine.
///
/// Misuse errors (`Destroyed`, `Ambiguous`, `NotFound`, `InvalidRegistration`,
/// `Abstract`) are fatal to the operation that raised them. "Not ready yet" is
/// never an error: it is reported as [`Access::Pending`](crate::Access::Pending).
///
/// `Error` is `Clone` so a single failure can be handed to every awaiter of
/// the same [`Pending`](crate::Pending) marker.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Write to a property of an entity whose store is frozen.
    #[error("Tried to update {entity}.{key} but {entity} is destroyed.")]
    Destroyed { entity: Arc<str>, key: Arc<str> },

    /// Required lookup hit a type key bound to more than one entity.
    #[error("Did find {class} in context, but multiple were defined.")]
    Ambiguous { class: Arc<str> },

    /// Required lookup found no binding anywhere in the scope chain.
    #[error("Could not find {class} in context.")]
    NotFound { class: Arc<str> },

    /// A context was handed something that is neither an entity nor a class.
    #[error("Context may only include an entity or an entity class, but got {value} for key {key}.")]
    InvalidRegistration { key: Arc<str>, value: String },

    /// Attempt to instantiate an abstract class.
    #[error("Cannot create an instance of {class}; it is abstract.")]
    Abstract { class: Arc<str> },

    /// Write to a property that only defines a getter.
    #[error("{entity}.{key} is read-only.")]
    ReadOnly { entity: Arc<str>, key: Arc<str> },

    /// Method lookup failed along the whole class chain.
    #[error("{entity} has no method {name}.")]
    NoMethod { entity: Arc<str>, name: Arc<str> },

    /// The handle points at a record that has been released from the arena.
    #[error("entity handle is stale")]
    Stale,

    /// `run_until_idle` kept finding work after the configured tick budget.
    #[error("scheduler still busy after {ticks} ticks")]
    Runaway { ticks: usize },

    /// Failure reported by collaborator code (listeners, methods, tasks).
    #[error("{0}")]
    Failed(Arc<str>),
}

impl Error {
    /// Wrap an arbitrary message raised by collaborator code.
    pub fn failed(message: impl Into<String>) -> Self {
        Error::Failed(message.into().into())
    }
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_message_is_stable() {
        let err = Error::Ambiguous {
            class: "Example".into(),
        };
        assert_eq!(
            err.to_string(),
            "Did find Example in context, but multiple were defined."
        );
    }

    #[test]
    fn destroyed_message_names_entity_and_key() {
        let err = Error::Destroyed {
            entity: "Test-1".into(),
            key: "value".into(),
        };
        assert_eq!(
            err.to_string(),
            "Tried to update Test-1.value but Test-1 is destroyed."
        );
    }
}
