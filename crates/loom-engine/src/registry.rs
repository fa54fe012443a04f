use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{Map, Value};

use loom_core::context::ExecutionContext;
use loom_core::error::{panic_message, LoomError, Result};
use loom_core::traits::StepExecutor;

/// Registry of step executors, keyed by logical name.
///
/// The engine keeps one for agents and one for tools; `kind` only affects
/// error messages.
pub struct ExecutorRegistry {
    kind: &'static str,
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            executors: HashMap::new(),
        }
    }

    pub fn agents() -> Self {
        Self::new("agent")
    }

    pub fn tools() -> Self {
        Self::new("tool")
    }

    /// Tool registry preloaded with the built-in tools.
    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::tools();
        crate::builtin::register_all(&mut registry);
        registry
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Register an executor, replacing any previous one with the same name.
    pub fn register(&mut self, executor: impl StepExecutor) {
        self.register_arc(Arc::new(executor));
    }

    pub fn register_arc(&mut self, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(executor.name().to_string(), executor);
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.executors.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(name).cloned()
    }

    /// Like [`get`](Self::get) but an unknown name is a dependency-resolution error.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn StepExecutor>> {
        self.get(name)
            .ok_or_else(|| LoomError::DependencyResolution(format!("unknown {} `{}`", self.kind, name)))
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.executors.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// Resolve and run an executor, enforcing its own timeout if it declares one.
    pub async fn execute(
        &self,
        name: &str,
        params: &Map<String, Value>,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<Value> {
        let executor = self.resolve(name)?;
        // A panicking executor fails its step, not the caller's task.
        let run = AssertUnwindSafe(async {
            match executor.timeout_secs() {
                Some(secs) => {
                    match tokio::time::timeout(Duration::from_secs(secs), executor.execute(params, input, ctx)).await {
                        Ok(result) => result,
                        Err(_) => Err(LoomError::StepTimeout {
                            step: name.to_string(),
                            timeout_secs: secs,
                        }),
                    }
                }
                None => executor.execute(params, input, ctx).await,
            }
        });
        match run.catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(LoomError::step(
                name,
                format!("executor panicked: {}", panic_message(&*payload)),
            )),
        }
    }
}

type SyncFn = dyn Fn(&Map<String, Value>, Value, &ExecutionContext) -> Result<Value> + Send + Sync;
type AsyncFn = dyn Fn(Map<String, Value>, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync;

enum Body {
    Sync(Box<SyncFn>),
    Async(Box<AsyncFn>),
}

/// Adapts a closure into a [`StepExecutor`].
pub struct FnExecutor {
    name: String,
    description: String,
    timeout_secs: Option<u64>,
    body: Body,
}

impl FnExecutor {
    /// Synchronous body with access to the run context.
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Map<String, Value>, Value, &ExecutionContext) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            timeout_secs: None,
            body: Body::Sync(Box::new(f)),
        }
    }

    /// Asynchronous body; receives owned params and input.
    pub fn new_async<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Map<String, Value>, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            timeout_secs: None,
            body: Body::Async(Box::new(move |params, input| Box::pin(f(params, input)))),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

impl StepExecutor for FnExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn execute<'a>(
        &'a self,
        params: &'a Map<String, Value>,
        input: Value,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Value>> {
        match &self.body {
            Body::Sync(f) => {
                let out = f(params, input, ctx);
                Box::pin(async move { out })
            }
            Body::Async(f) => f(params.clone(), input),
        }
    }

    fn timeout_secs(&self) -> Option<u64> {
        self.timeout_secs
    }
}
