//! Workflows every daemon registers.

use driftwood_workflow::child::ChildWorkflowHandle;
use driftwood_workflow::{
    Context, RegistryError, RetryConfig, SaveOptions, WorkflowError, WorkflowRegistry,
};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct Operands {
    a: i64,
    b: i64,
}

#[derive(Debug, Deserialize)]
struct Nap {
    #[serde(default = "default_nap_seconds")]
    seconds: u64,
}

fn default_nap_seconds() -> u64 {
    5
}

/// The demo workflows, under module path `demo`.
///
/// # Errors
///
/// Fails if two demos claim the same workflow name.
pub fn registry() -> Result<WorkflowRegistry, RegistryError> {
    let mut registry = WorkflowRegistry::new();

    registry.register("demo", "add", |ctx: Context, _kwargs: JsonValue| async move {
        let Operands { a, b } = ctx.kwargs_as()?;
        Ok::<_, WorkflowError>(a + b)
    })?;

    registry.register("demo", "nap", |ctx: Context, _kwargs: JsonValue| async move {
        let Nap { seconds } = ctx.kwargs_as()?;
        ctx.info(json!({"sleeping": seconds}));
        ctx.sleep(Duration::from_secs(seconds))?;
        Ok::<_, WorkflowError>(seconds)
    })?;

    registry.register("demo", "greet", |ctx: Context, _kwargs: JsonValue| async move {
        let name: String = ctx.receive("name")?;
        let greeting = ctx
            .save_with(
                SaveOptions::default().with_retry(RetryConfig::new(3)),
                || async move { Ok::<_, String>(format!("hello {name}")) },
            )
            .await?;
        Ok::<_, WorkflowError>(greeting)
    })?;

    registry.register("demo", "sum_of_sums", |ctx: Context, kwargs: JsonValue| async move {
        let child: driftwood_core::RunId = ctx
            .save(|| ctx.start_child_workflow("add", kwargs.clone()))
            .await?;
        let handle = ChildWorkflowHandle {
            name: "add".to_string(),
            kwargs: JsonValue::Null,
            run_id: Some(child),
        };
        let stopped = handle.has_stopped(&ctx).await?;
        ctx.ensure(|| async move { stopped }).await?;
        let sum: i64 = handle.result(&ctx).await?;
        Ok::<_, WorkflowError>(sum * 2)
    })?;

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_every_demo() {
        let registry = registry().unwrap();
        for name in ["add", "nap", "greet", "sum_of_sums"] {
            let descriptor = registry.descriptor(name).unwrap();
            assert_eq!(descriptor.module_path, "demo");
        }
    }
}
