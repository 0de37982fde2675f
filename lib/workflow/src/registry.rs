//! Registered workflow bodies.

use crate::context::Context;
use crate::error::{RegistryError, WorkflowError};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// A type-erased workflow body.
pub type WorkflowFn = Arc<
    dyn Fn(Context, JsonValue) -> BoxFuture<'static, Result<JsonValue, WorkflowError>>
        + Send
        + Sync,
>;

/// Where a workflow body lives.
///
/// The workflow name is what run ids carry; the module path and function
/// name are what a worker loads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkflowDescriptor {
    pub name: String,
    pub module_path: String,
    pub function_name: String,
}

struct Entry {
    descriptor: WorkflowDescriptor,
    body: WorkflowFn,
}

/// Workflow bodies known to this process, by workflow name.
#[derive(Default)]
pub struct WorkflowRegistry {
    entries: HashMap<String, Entry>,
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflows", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl WorkflowRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `body` as `module_path::function_name`, known by
    /// `function_name`.
    ///
    /// Registering the same location again replaces its body.
    ///
    /// # Errors
    ///
    /// Run ids carry only the workflow name, so a name can belong to one
    /// location: registering `function_name` from a second module path
    /// fails and keeps the first registration.
    pub fn register<F, Fut, T>(
        &mut self,
        module_path: &str,
        function_name: &str,
        body: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Context, JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, WorkflowError>> + Send + 'static,
        T: Serialize,
    {
        if let Some(entry) = self.entries.get(function_name)
            && entry.descriptor.module_path != module_path
        {
            return Err(RegistryError {
                name: function_name.to_string(),
                existing: format!("{}::{}", entry.descriptor.module_path, function_name),
                rejected: format!("{module_path}::{function_name}"),
            });
        }
        let body: WorkflowFn = Arc::new(
            move |ctx: Context,
                  kwargs: JsonValue|
                  -> BoxFuture<'static, Result<JsonValue, WorkflowError>> {
                let fut = body(ctx, kwargs);
                Box::pin(async move {
                    let value = fut.await?;
                    serde_json::to_value(value).map_err(WorkflowError::from)
                })
            },
        );
        self.entries.insert(
            function_name.to_string(),
            Entry {
                descriptor: WorkflowDescriptor {
                    name: function_name.to_string(),
                    module_path: module_path.to_string(),
                    function_name: function_name.to_string(),
                },
                body,
            },
        );
        Ok(())
    }

    /// Where the workflow called `name` lives.
    #[must_use]
    pub fn descriptor(&self, name: &str) -> Option<&WorkflowDescriptor> {
        self.entries.get(name).map(|entry| &entry.descriptor)
    }

    /// Loads the body at `module_path::function_name`.
    #[must_use]
    pub fn get(&self, module_path: &str, function_name: &str) -> Option<WorkflowFn> {
        self.entries
            .get(function_name)
            .filter(|entry| entry.descriptor.module_path == module_path)
            .map(|entry| entry.body.clone())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Names of every registered workflow.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OperationEvent, Run};
    use chrono::Utc;
    use driftwood_core::{ManualClock, RunId};
    use serde_json::json;

    #[tokio::test]
    async fn registered_body_is_callable() {
        let mut registry = WorkflowRegistry::new();
        registry.register("demo", "double", |ctx: Context, _kwargs| async move {
            let n: i64 = ctx.kwargs_as()?;
            Ok::<_, WorkflowError>(n * 2)
        }).unwrap();

        assert!(registry.contains("double"));
        let descriptor = registry.descriptor("double").unwrap();
        assert_eq!(descriptor.module_path, "demo");

        let body = registry.get("demo", "double").unwrap();
        let mut run = Run::new(RunId::generate("double").unwrap());
        run.push(Utc::now(), OperationEvent::Start { kwargs: json!(21) });
        let ctx = Context::builder(run, Arc::new(ManualClock::default()))
            .build()
            .unwrap();
        let value = body(ctx, json!(21)).await.unwrap();
        assert_eq!(value, json!(42));
    }

    #[test]
    fn module_path_must_match() {
        let mut registry = WorkflowRegistry::new();
        registry
            .register("demo", "noop", |_ctx, _kwargs| async { Ok::<_, WorkflowError>(()) })
            .unwrap();
        assert!(registry.get("other", "noop").is_none());
        assert!(registry.get("demo", "missing").is_none());
    }

    #[tokio::test]
    async fn name_belongs_to_one_module() {
        let mut registry = WorkflowRegistry::new();
        registry
            .register("billing", "sync", |_ctx, _kwargs| async { Ok::<_, WorkflowError>(1) })
            .unwrap();
        let err = registry
            .register("crm", "sync", |_ctx, _kwargs| async { Ok::<_, WorkflowError>(2) })
            .unwrap_err();
        assert_eq!(err.name, "sync");
        assert_eq!(err.existing, "billing::sync");
        assert_eq!(registry.descriptor("sync").unwrap().module_path, "billing");
        assert!(registry.get("crm", "sync").is_none());

        registry
            .register("billing", "sync", |_ctx, _kwargs| async { Ok::<_, WorkflowError>(3) })
            .unwrap();
        let body = registry.get("billing", "sync").unwrap();
        let mut run = Run::new(RunId::generate("sync").unwrap());
        run.push(Utc::now(), OperationEvent::Start { kwargs: json!(null) });
        let ctx = Context::builder(run, Arc::new(ManualClock::default()))
            .build()
            .unwrap();
        assert_eq!(body(ctx, json!(null)).await.unwrap(), json!(3));
    }
}
