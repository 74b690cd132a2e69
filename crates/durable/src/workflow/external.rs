//! External events raised into running workflows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event raised from outside the engine
///
/// External events let API handlers and other collaborators hand data to a
/// running workflow. The event is recorded in the instance history when it is
/// raised; a pending wait for the same name receives it, otherwise it is
/// buffered until the workflow waits for it.
///
/// # Example
///
/// ```ignore
/// let event = ExternalEvent::new("solution_approved", json!({ "approved": true }));
/// client.raise_event("support-T1", event.name, event.payload).await?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalEvent {
    /// Event name waits are keyed by
    pub name: String,

    /// Event payload (JSON)
    pub payload: serde_json::Value,

    /// When the event was raised
    pub raised_at: DateTime<Utc>,
}

impl ExternalEvent {
    /// Create a new event stamped with the current time
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            raised_at: Utc::now(),
        }
    }

    /// Deserialize the payload into a typed value
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}
