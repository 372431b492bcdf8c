//! Capability handler registry
//!
//! Maps tool names to host-supplied async handlers together with the
//! declaration advertised to the model.

use crate::protocol::FunctionDeclaration;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Result of a capability handler: a JSON-serializable value or an error message.
pub type HandlerResult = Result<Value, String>;

/// Boxed handler: `args -> future of result`.
pub type Handler = Arc<dyn Fn(Map<String, Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Timeout class for a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    /// Quick local queries (page inspection, highlighting)
    Fast,
    /// File I/O, code execution, navigation
    Slow,
    /// Handler-specific timeout
    Custom(Duration),
}

/// A registered capability.
#[derive(Clone)]
pub struct Capability {
    pub declaration: FunctionDeclaration,
    pub timeout: TimeoutClass,
    pub handler: Handler,
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.declaration.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Fixed mapping from tool name to handler, supplied by the host.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<String, Capability>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler taking the raw argument map. Replaces any handler with the same name.
    pub fn register<F, Fut>(
        &mut self,
        name: &str,
        description: &str,
        parameters: Value,
        timeout: TimeoutClass,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |args| -> BoxFuture<'static, HandlerResult> { Box::pin(handler(args)) });
        self.capabilities.insert(
            name.to_string(),
            Capability {
                declaration: FunctionDeclaration {
                    name: name.to_string(),
                    description: description.to_string(),
                    parameters,
                },
                timeout,
                handler,
            },
        );
        self
    }

    /// Register a handler whose arguments are deserialized into `A` first.
    /// Arguments that do not match yield an error result without calling the handler.
    pub fn register_typed<A, F, Fut>(
        &mut self,
        name: &str,
        description: &str,
        parameters: Value,
        timeout: TimeoutClass,
        handler: F,
    ) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let tool = name.to_string();
        self.register(name, description, parameters, timeout, move |args| {
            let handler = handler.clone();
            let tool = tool.clone();
            async move {
                let parsed: A = serde_json::from_value(Value::Object(args))
                    .map_err(|e| format!("Invalid arguments for {}: {}", tool, e))?;
                handler(parsed).await
            }
        })
    }

    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.capabilities.get(name)
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Declarations for the setup message, ordered by name.
    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.capabilities
            .values()
            .map(|c| c.declaration.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct EchoArgs {
        text: String,
    }

    fn registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry
            .register_typed(
                "echo",
                "Echo text back",
                json!({"type": "object", "properties": {"text": {"type": "string"}}}),
                TimeoutClass::Fast,
                |args: EchoArgs| async move { Ok(json!({ "text": args.text })) },
            )
            .register("always_fails", "Fails", json!({"type": "object"}), TimeoutClass::Slow, |_| async {
                Err("nope".to_string())
            });
        registry
    }

    #[tokio::test]
    async fn test_typed_handler_validates_arguments() {
        let registry = registry();
        let echo = registry.get("echo").unwrap();

        let mut args = Map::new();
        args.insert("text".into(), json!("hi"));
        assert_eq!((echo.handler)(args).await, Ok(json!({"text": "hi"})));

        let err = (echo.handler)(Map::new()).await.unwrap_err();
        assert!(err.contains("Invalid arguments for echo"));
    }

    #[test]
    fn test_declarations_sorted() {
        let registry = registry();
        let names: Vec<_> = registry.declarations().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["always_fails", "echo"]);
        assert_eq!(registry.len(), 2);
        assert!(registry.get("missing").is_none());
    }
}
