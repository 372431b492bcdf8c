//! Page inspection capabilities backed by the host's DOM bridge.

use super::call::{PageCommand, ScrollDirection};
use super::registry::{CapabilityRegistry, HandlerResult, TimeoutClass};
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Bridge into the rendered page preview. Implemented by the host application.
pub trait PageBridge: Send + Sync + 'static {
    fn click(&self, number: u32) -> BoxFuture<'_, HandlerResult>;
    fn scroll(&self, direction: ScrollDirection, amount: Option<u32>) -> BoxFuture<'_, HandlerResult>;
    fn get_page_elements(&self) -> BoxFuture<'_, HandlerResult>;
    fn highlight_by_number(&self, number: u32) -> BoxFuture<'_, HandlerResult>;
    fn navigate(&self, url: &str) -> BoxFuture<'_, HandlerResult>;
}

/// Execute a validated command against the bridge.
pub async fn execute(bridge: &dyn PageBridge, command: PageCommand) -> HandlerResult {
    debug!("Executing page command {:?}", command);
    match command {
        PageCommand::Click { number } => bridge.click(number).await,
        PageCommand::Scroll { direction, amount } => bridge.scroll(direction, amount).await,
        PageCommand::GetPageElements => bridge.get_page_elements().await,
        PageCommand::HighlightByNumber { number } => bridge.highlight_by_number(number).await,
        PageCommand::Navigate { url } => bridge.navigate(&url).await,
        PageCommand::Unknown { name, .. } => Err(format!("Unsupported page command: {}", name)),
    }
}

fn number_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "number": { "type": "integer", "description": description }
        },
        "required": ["number"]
    })
}

/// Register the five page commands on `registry`, all routed through `bridge`.
pub fn register_page_capabilities(registry: &mut CapabilityRegistry, bridge: Arc<dyn PageBridge>) {
    let commands: [(&str, &str, Value, TimeoutClass); 5] = [
        (
            PageCommand::CLICK,
            "Click the page element labelled with the given number.",
            number_schema("Element number shown in the overlay"),
            TimeoutClass::Fast,
        ),
        (
            PageCommand::SCROLL,
            "Scroll the page up or down.",
            json!({
                "type": "object",
                "properties": {
                    "direction": { "type": "string", "enum": ["up", "down"] },
                    "amount": { "type": "integer", "description": "Pixels to scroll" }
                },
                "required": ["direction"]
            }),
            TimeoutClass::Fast,
        ),
        (
            PageCommand::GET_PAGE_ELEMENTS,
            "List the interactive elements on the page with their numbers.",
            json!({ "type": "object", "properties": {} }),
            TimeoutClass::Fast,
        ),
        (
            PageCommand::HIGHLIGHT_BY_NUMBER,
            "Highlight the element with the given number.",
            number_schema("Element number to highlight"),
            TimeoutClass::Fast,
        ),
        (
            PageCommand::NAVIGATE,
            "Navigate the preview to a URL.",
            json!({
                "type": "object",
                "properties": { "url": { "type": "string" } },
                "required": ["url"]
            }),
            TimeoutClass::Slow,
        ),
    ];

    for (name, description, schema, timeout) in commands {
        let bridge = bridge.clone();
        let tool = name.to_string();
        registry.register(name, description, schema, timeout, move |args| {
            let bridge = bridge.clone();
            let command = PageCommand::parse(&tool, &args);
            async move { execute(bridge.as_ref(), command?).await }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBridge {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingBridge {
        fn record(&self, entry: String) -> BoxFuture<'_, HandlerResult> {
            self.calls.lock().unwrap().push(entry.clone());
            Box::pin(async move { Ok(json!({ "done": entry })) })
        }
    }

    impl PageBridge for RecordingBridge {
        fn click(&self, number: u32) -> BoxFuture<'_, HandlerResult> {
            self.record(format!("click {}", number))
        }
        fn scroll(&self, direction: ScrollDirection, amount: Option<u32>) -> BoxFuture<'_, HandlerResult> {
            self.record(format!("scroll {:?} {:?}", direction, amount))
        }
        fn get_page_elements(&self) -> BoxFuture<'_, HandlerResult> {
            self.record("elements".to_string())
        }
        fn highlight_by_number(&self, number: u32) -> BoxFuture<'_, HandlerResult> {
            self.record(format!("highlight {}", number))
        }
        fn navigate(&self, url: &str) -> BoxFuture<'_, HandlerResult> {
            self.record(format!("navigate {}", url))
        }
    }

    #[tokio::test]
    async fn test_page_capabilities_route_to_bridge() {
        let bridge = Arc::new(RecordingBridge::default());
        let mut registry = CapabilityRegistry::new();
        register_page_capabilities(&mut registry, bridge.clone());
        assert_eq!(registry.len(), 5);
        assert_eq!(registry.get("navigate").unwrap().timeout, TimeoutClass::Slow);

        let mut args = Map::new();
        args.insert("number".into(), json!(7));
        let click = registry.get("click").unwrap();
        assert_eq!((click.handler)(args).await, Ok(json!({"done": "click 7"})));

        let err = (click.handler)(Map::new()).await.unwrap_err();
        assert!(err.contains("Invalid arguments for click"));

        assert_eq!(bridge.calls.lock().unwrap().as_slice(), ["click 7".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_command_is_rejected() {
        let bridge = RecordingBridge::default();
        let result = execute(
            &bridge,
            PageCommand::Unknown {
                name: "zoom".into(),
                args: Map::new(),
            },
        )
        .await;
        assert_eq!(result, Err("Unsupported page command: zoom".to_string()));
    }
}
