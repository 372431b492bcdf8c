//! Tool call dispatcher
//!
//! Runs every call of a batch concurrently against the registry, each under its
//! own timeout, and returns exactly one result per call in the order the calls
//! arrived. A failing, panicking, hung or unknown handler only affects its own
//! result.

use super::call::{ToolCall, ToolResult};
use super::registry::{CapabilityRegistry, TimeoutClass};
use crate::config::ToolTimeouts;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<CapabilityRegistry>,
    timeouts: ToolTimeouts,
}

impl Dispatcher {
    pub fn new(registry: Arc<CapabilityRegistry>, timeouts: ToolTimeouts) -> Self {
        Self { registry, timeouts }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    fn timeout_for(&self, class: TimeoutClass) -> Duration {
        match class {
            TimeoutClass::Fast => self.timeouts.fast,
            TimeoutClass::Slow => self.timeouts.slow,
            TimeoutClass::Custom(d) => d,
        }
    }

    /// Execute a batch of calls and return one result per call, in input order.
    pub async fn dispatch(&self, calls: Vec<ToolCall>) -> Vec<ToolResult> {
        info!("Dispatching {} tool call(s)", calls.len());
        let futures = calls.into_iter().map(|call| self.run_one(call));
        let results = join_all(futures).await;

        let failed = results.iter().filter(|r| r.is_error()).count();
        if failed > 0 {
            warn!("{} of {} tool call(s) failed", failed, results.len());
        }
        results
    }

    async fn run_one(&self, call: ToolCall) -> ToolResult {
        let ToolCall { id, name, args } = call;

        let Some(capability) = self.registry.get(&name) else {
            warn!("Model requested unknown tool {}", name);
            return ToolResult::failure(id, &name, format!("Unknown tool: {}", name));
        };

        let limit = self.timeout_for(capability.timeout);
        let handler = capability.handler.clone();
        debug!("Running tool {} ({}) with {:?} timeout", name, id, limit);

        // The handler is invoked inside the task so a panic while building the
        // future is caught by the join handle as well.
        let mut task = tokio::spawn(async move { handler(args).await });

        match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(Ok(value))) => ToolResult::success(id, name, value),
            Ok(Ok(Err(message))) => {
                warn!("Tool {} ({}) failed: {}", name, id, message);
                ToolResult::failure(id, name, message)
            }
            Ok(Err(join_error)) => {
                warn!("Tool {} ({}) panicked: {}", name, id, join_error);
                ToolResult::failure(id, &name, format!("Tool {} crashed", name))
            }
            Err(_) => {
                warn!("Tool {} ({}) timed out after {:?}", name, id, limit);
                task.abort();
                ToolResult::failure(id, name, format!("Tool timed out after {}ms", limit.as_millis()))
            }
        }
    }

    /// Error results for a batch whose response could not be delivered.
    pub fn fallback_results(calls: &[(String, String)], reason: &str) -> Vec<ToolResult> {
        calls
            .iter()
            .map(|(id, name)| ToolResult::failure(id, name, format!("Tool batch failed: {}", reason)))
            .collect()
    }
}
