//! Handler registry: maps a job's `class_id` to executable code.
//!
//! Registration is decoupled from submission on purpose. A job may be
//! submitted before its handler exists in this process (another process may
//! own that class); the lookup only matters at execution time, and a missing
//! handler is a job failure, not an engine failure.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;

use crate::job::{ExecutionError, Job, JobContext};

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), ExecutionError>> + Send>>;
type BoxedHandler = Arc<dyn Fn(serde_json::Value, JobContext) -> HandlerFuture + Send + Sync>;

/// Concurrent class-to-handler map shared by all workers of an engine.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, BoxedHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register a handler with typed arguments.
    ///
    /// The job's JSON payload is deserialized into `T` before the handler
    /// runs; a payload that does not fit is reported as a non-retryable
    /// execution error with code `arguments`.
    ///
    /// Re-registering a class replaces the previous handler.
    pub fn register<T, F, Fut>(&self, class_id: impl Into<String>, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ExecutionError>> + Send + 'static,
    {
        let wrapped: BoxedHandler = Arc::new(move |args, ctx| -> HandlerFuture {
            match serde_json::from_value::<T>(args) {
                Ok(parsed) => Box::pin(handler(parsed, ctx)),
                Err(error) => Box::pin(async move {
                    Err(ExecutionError::fatal(format!(
                        "argument deserialization failed: {error}"
                    ))
                    .with_code("arguments"))
                }),
            }
        });
        self.handlers.insert(class_id.into(), wrapped);
    }

    /// Register a handler that receives the raw JSON payload.
    pub fn register_raw<F, Fut>(&self, class_id: impl Into<String>, handler: F)
    where
        F: Fn(serde_json::Value, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ExecutionError>> + Send + 'static,
    {
        let wrapped: BoxedHandler =
            Arc::new(move |args, ctx| -> HandlerFuture { Box::pin(handler(args, ctx)) });
        self.handlers.insert(class_id.into(), wrapped);
    }

    /// Run the handler registered for `job`.
    pub async fn execute(&self, job: &Job, ctx: JobContext) -> Result<(), ExecutionError> {
        // Clone the handler out so no map guard is held across the await.
        let handler = match self.handlers.get(&job.class_id) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                return Err(ExecutionError::fatal(format!(
                    "no handler registered for class '{}'",
                    job.class_id
                ))
                .with_code("unregistered"))
            }
        };
        handler(job.arguments.clone(), ctx).await
    }

    pub fn contains(&self, class_id: &str) -> bool {
        self.handlers.contains_key(class_id)
    }

    /// Registered class ids, sorted for stable output.
    pub fn registered_classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self
            .handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        classes.sort();
        classes
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
