//! Activity trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;

/// Error type for activity failures
///
/// This is the `ActivityFailure` surfaced to workflow code through
/// [`Workflow::on_activity_failed`](crate::Workflow::on_activity_failed) or as
/// the outcome of a race member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether this error is retryable
    ///
    /// Non-retryable errors fail the activity immediately regardless of the
    /// attempts left in its retry policy.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    /// Error type recorded when an attempt exceeds its start-to-close timeout
    pub const TIMEOUT: &'static str = "timeout";

    /// Error type recorded when no activity is registered for a task's type
    pub const UNREGISTERED: &'static str = "unregistered";

    /// Error type recorded when the input or output does not match the activity's types
    pub const SERIALIZATION: &'static str = "serialization";

    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// Attempt ran past its start-to-close timeout (retryable)
    pub fn timed_out(timeout: std::time::Duration) -> Self {
        Self::retryable(format!(
            "activity timed out after {}ms",
            timeout.as_millis()
        ))
        .with_type(Self::TIMEOUT)
    }

    /// No activity registered for the task's type (never retried)
    pub fn unregistered(activity_type: &str) -> Self {
        Self::non_retryable(format!("no activity registered for type: {activity_type}"))
            .with_type(Self::UNREGISTERED)
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

impl From<serde_json::Error> for ActivityError {
    fn from(err: serde_json::Error) -> Self {
        Self::non_retryable(err.to_string()).with_type(Self::SERIALIZATION)
    }
}

/// An activity is a side-effecting unit of work that may fail and be retried
///
/// Agents, tools and notification senders plug into the engine through this
/// trait. Activities:
/// - Are executed by the worker pool, never during replay
/// - Receive typed input and return typed output (JSON on the wire)
/// - Can fail and be retried
/// - May run more than once for the same scheduling, so they must be idempotent
///
/// # Example
///
/// ```ignore
/// use agentflow_durable::prelude::*;
///
/// struct SendEmailActivity;
///
/// #[async_trait]
/// impl Activity for SendEmailActivity {
///     const TYPE: &'static str = "send_email";
///     type Input = SendEmailInput;
///     type Output = SendEmailOutput;
///
///     async fn execute(
///         &self,
///         ctx: &ActivityContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, ActivityError> {
///         // Send email...
///         Ok(SendEmailOutput { message_id: "..." })
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Unique type identifier for this activity
    ///
    /// This is used to look up the activity in the registry.
    const TYPE: &'static str;

    /// Input type for the activity
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type for the activity
    type Output: Serialize + DeserializeOwned + Send;

    /// Execute the activity
    ///
    /// # Errors
    ///
    /// Return `ActivityError::retryable()` for transient failures that should be retried.
    /// Return `ActivityError::non_retryable()` for permanent failures.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_activity_error_retryable() {
        let error = ActivityError::retryable("timeout");
        assert!(error.retryable);
        assert_eq!(error.to_string(), "timeout");
    }

    #[test]
    fn test_activity_error_non_retryable() {
        let error = ActivityError::non_retryable("invalid input");
        assert!(!error.retryable);
    }

    #[test]
    fn test_timed_out_is_retryable() {
        let error = ActivityError::timed_out(Duration::from_millis(250));
        assert!(error.retryable);
        assert_eq!(error.error_type.as_deref(), Some(ActivityError::TIMEOUT));
        assert!(error.message.contains("250ms"));
    }

    #[test]
    fn test_unregistered_is_final() {
        let error = ActivityError::unregistered("triage");
        assert!(!error.retryable);
        assert_eq!(error.error_type.as_deref(), Some(ActivityError::UNREGISTERED));
    }

    #[test]
    fn test_serde_error_conversion() {
        let err = serde_json::from_str::<u32>("\"nope\"").unwrap_err();
        let error = ActivityError::from(err);
        assert!(!error.retryable);
        assert_eq!(error.error_type.as_deref(), Some(ActivityError::SERIALIZATION));
    }

    #[test]
    fn test_activity_error_serialization() {
        let error = ActivityError::retryable("test error")
            .with_type("TEST")
            .with_details(serde_json::json!({"key": "value"}));

        let json = serde_json::to_string(&error).unwrap();
        let parsed: ActivityError = serde_json::from_str(&json).unwrap();

        assert_eq!(error, parsed);
    }
}
