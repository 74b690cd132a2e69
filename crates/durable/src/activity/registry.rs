//! Activity registry for type-erased activity execution
//!
//! The worker pool looks activities up by the type name recorded on each task
//! and invokes them with JSON input, without knowing the concrete type.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{Activity, ActivityContext, ActivityError};

/// Type-erased activity interface
///
/// Input and output are JSON. Input that does not deserialize into the
/// activity's input type is a non-retryable failure.
#[async_trait]
pub trait AnyActivity: Send + Sync {
    /// Execute one attempt
    async fn execute(&self, ctx: Arc<ActivityContext>, input: Value)
        -> Result<Value, ActivityError>;
}

/// Wrapper to implement AnyActivity for any Activity
struct ActivityWrapper<A: Activity> {
    inner: A,
}

#[async_trait]
impl<A: Activity> AnyActivity for ActivityWrapper<A> {
    async fn execute(
        &self,
        ctx: Arc<ActivityContext>,
        input: Value,
    ) -> Result<Value, ActivityError> {
        let typed_input: A::Input = serde_json::from_value(input)?;
        let output = self.inner.execute(&ctx, typed_input).await?;
        Ok(serde_json::to_value(output)?)
    }
}

/// Wrapper for closure-based activities
struct FnActivity<F> {
    handler: F,
}

#[async_trait]
impl<F, Fut> AnyActivity for FnActivity<F>
where
    F: Fn(Arc<ActivityContext>, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
{
    async fn execute(
        &self,
        ctx: Arc<ActivityContext>,
        input: Value,
    ) -> Result<Value, ActivityError> {
        (self.handler)(ctx, input).await
    }
}

/// Registry of activity implementations, keyed by activity type
///
/// Built once at startup and shared with the worker pool.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    activities: HashMap<String, Arc<dyn AnyActivity>>,
}

impl ActivityRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed activity under its `TYPE`
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = ActivityRegistry::new();
    /// registry.register(SendEmailActivity::new(mailer));
    /// ```
    pub fn register<A: Activity>(&mut self, activity: A) -> &mut Self {
        self.activities.insert(
            A::TYPE.to_string(),
            Arc::new(ActivityWrapper { inner: activity }),
        );
        self
    }

    /// Register a closure as an untyped activity
    pub fn register_fn<F, Fut>(&mut self, activity_type: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Arc<ActivityContext>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        self.activities
            .insert(activity_type.into(), Arc::new(FnActivity { handler }));
        self
    }

    /// Look up an activity by type
    pub fn get(&self, activity_type: &str) -> Option<Arc<dyn AnyActivity>> {
        self.activities.get(activity_type).cloned()
    }

    /// Check if an activity type is registered
    pub fn contains(&self, activity_type: &str) -> bool {
        self.activities.contains_key(activity_type)
    }

    /// Get the number of registered activity types
    pub fn len(&self) -> usize {
        self.activities.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    /// Get all registered activity type names
    pub fn activity_types(&self) -> impl Iterator<Item = &str> {
        self.activities.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activity_types", &self.activities.keys().collect::<Vec<_>>())
            .finish()
    }
}
