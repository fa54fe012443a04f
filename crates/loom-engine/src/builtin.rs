use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};

use loom_core::context::ExecutionContext;
use loom_core::error::{LoomError, Result};
use loom_core::traits::StepExecutor;

use crate::registry::ExecutorRegistry;

pub fn register_all(registry: &mut ExecutorRegistry) {
    registry.register(EchoTool);
    registry.register(MergeTool);
    registry.register(SharedSetTool);
    registry.register(SharedGetTool);
}

#[derive(Deserialize)]
struct KeyParams {
    key: String,
}

fn key_params(tool: &str, params: &Map<String, Value>) -> Result<KeyParams> {
    serde_json::from_value(Value::Object(params.clone()))
        .map_err(|e| LoomError::step(tool, format!("invalid params: {e}")))
}

// ── EchoTool ────────────────────────────────────────────────────

/// Returns its input unchanged.
pub struct EchoTool;

impl StepExecutor for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Return the step input unchanged."
    }
    fn execute<'a>(
        &'a self,
        _params: &'a Map<String, Value>,
        input: Value,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move { Ok(input) })
    }
}

// ── MergeTool ───────────────────────────────────────────────────

/// Shallow-merges the tool params into an object input. Params win on conflict.
pub struct MergeTool;

impl StepExecutor for MergeTool {
    fn name(&self) -> &str {
        "merge"
    }
    fn description(&self) -> &str {
        "Merge tool_params into the (object) step input."
    }
    fn execute<'a>(
        &'a self,
        params: &'a Map<String, Value>,
        input: Value,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let mut merged = match input {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                other => {
                    let mut map = Map::new();
                    map.insert("input".to_string(), other);
                    map
                }
            };
            for (k, v) in params {
                merged.insert(k.clone(), v.clone());
            }
            Ok(Value::Object(merged))
        })
    }
}

// ── SharedSetTool ───────────────────────────────────────────────

/// Stores the step input under `params.key` in the run's shared data.
pub struct SharedSetTool;

impl StepExecutor for SharedSetTool {
    fn name(&self) -> &str {
        "shared_set"
    }
    fn description(&self) -> &str {
        "Store the step input in shared data under `key` and pass it through."
    }
    fn execute<'a>(
        &'a self,
        params: &'a Map<String, Value>,
        input: Value,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let p = key_params(self.name(), params)?;
            ctx.set_shared(p.key, input.clone());
            Ok(input)
        })
    }
}

// ── SharedGetTool ───────────────────────────────────────────────

/// Reads `params.key` from shared data (null when absent).
pub struct SharedGetTool;

impl StepExecutor for SharedGetTool {
    fn name(&self) -> &str {
        "shared_get"
    }
    fn description(&self) -> &str {
        "Read `key` from shared data."
    }
    fn execute<'a>(
        &'a self,
        params: &'a Map<String, Value>,
        _input: Value,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let p = key_params(self.name(), params)?;
            Ok(ctx.get_shared(&p.key).unwrap_or(Value::Null))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn merge_overrides_input_fields() {
        let ctx = ExecutionContext::new();
        let out = MergeTool
            .execute(&params(json!({"b": 2, "a": 9})), json!({"a": 1}), &ctx)
            .await
            .unwrap();
        assert_eq!(out, json!({"a": 9, "b": 2}));
    }

    #[tokio::test]
    async fn shared_set_then_get() {
        let ctx = ExecutionContext::new();
        let p = params(json!({"key": "draft"}));
        SharedSetTool.execute(&p, json!("text"), &ctx).await.unwrap();
        let out = SharedGetTool.execute(&p, Value::Null, &ctx).await.unwrap();
        assert_eq!(out, json!("text"));
    }

    #[tokio::test]
    async fn shared_get_requires_key() {
        let ctx = ExecutionContext::new();
        let err = SharedGetTool.execute(&Map::new(), Value::Null, &ctx).await.unwrap_err();
        assert!(matches!(err, LoomError::StepExecution { .. }));
    }

    #[test]
    fn builtins_registered() {
        let reg = ExecutorRegistry::with_builtin_tools();
        assert_eq!(reg.list(), vec!["echo", "merge", "shared_get", "shared_set"]);
    }
}
