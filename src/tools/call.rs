//! Tool call and tool result types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A named capability invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlation token echoed back in the matching [`ToolResult`]
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        let args = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

/// `response` body of a function response. Exactly one field is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponsePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one [`ToolCall`], correlated by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub response: ToolResponsePayload,
}

impl ToolResult {
    pub fn success(id: impl Into<String>, name: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            response: ToolResponsePayload {
                result: Some(result),
                error: None,
            },
        }
    }

    pub fn failure(id: impl Into<String>, name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            response: ToolResponsePayload {
                result: None,
                error: Some(error.into()),
            },
        }
    }

    pub fn is_error(&self) -> bool {
        self.response.error.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

/// Typed form of the page inspection calls the host bridge understands.
///
/// Calls are validated against their argument shape here; names the core does
/// not recognise land in [`PageCommand::Unknown`].
#[derive(Debug, Clone, PartialEq)]
pub enum PageCommand {
    Click { number: u32 },
    Scroll { direction: ScrollDirection, amount: Option<u32> },
    GetPageElements,
    HighlightByNumber { number: u32 },
    Navigate { url: String },
    Unknown { name: String, args: Map<String, Value> },
}

#[derive(Deserialize)]
struct NumberArgs {
    number: u32,
}

#[derive(Deserialize)]
struct ScrollArgs {
    direction: ScrollDirection,
    #[serde(default)]
    amount: Option<u32>,
}

#[derive(Deserialize)]
struct NavigateArgs {
    url: String,
}

fn parse_args<T: serde::de::DeserializeOwned>(name: &str, args: &Map<String, Value>) -> Result<T, String> {
    serde_json::from_value(Value::Object(args.clone()))
        .map_err(|e| format!("Invalid arguments for {}: {}", name, e))
}

impl PageCommand {
    pub const CLICK: &'static str = "click";
    pub const SCROLL: &'static str = "scroll";
    pub const GET_PAGE_ELEMENTS: &'static str = "getPageElements";
    pub const HIGHLIGHT_BY_NUMBER: &'static str = "highlightByNumber";
    pub const NAVIGATE: &'static str = "navigate";

    /// Validate a call's arguments against the shape of its command.
    pub fn parse(name: &str, args: &Map<String, Value>) -> Result<Self, String> {
        let command = match name {
            Self::CLICK => {
                let a: NumberArgs = parse_args(name, args)?;
                PageCommand::Click { number: a.number }
            }
            Self::SCROLL => {
                let a: ScrollArgs = parse_args(name, args)?;
                PageCommand::Scroll {
                    direction: a.direction,
                    amount: a.amount,
                }
            }
            Self::GET_PAGE_ELEMENTS => PageCommand::GetPageElements,
            Self::HIGHLIGHT_BY_NUMBER => {
                let a: NumberArgs = parse_args(name, args)?;
                PageCommand::HighlightByNumber { number: a.number }
            }
            Self::NAVIGATE => {
                let a: NavigateArgs = parse_args(name, args)?;
                if a.url.trim().is_empty() {
                    return Err("Invalid arguments for navigate: url is empty".to_string());
                }
                PageCommand::Navigate { url: a.url }
            }
            other => PageCommand::Unknown {
                name: other.to_string(),
                args: args.clone(),
            },
        };
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_parse_known_commands() {
        assert_eq!(
            PageCommand::parse("click", &args(json!({"number": 4}))).unwrap(),
            PageCommand::Click { number: 4 }
        );
        assert_eq!(
            PageCommand::parse("scroll", &args(json!({"direction": "down"}))).unwrap(),
            PageCommand::Scroll {
                direction: ScrollDirection::Down,
                amount: None
            }
        );
        assert_eq!(
            PageCommand::parse("getPageElements", &Map::new()).unwrap(),
            PageCommand::GetPageElements
        );
        assert_eq!(
            PageCommand::parse("navigate", &args(json!({"url": "http://localhost:3000"}))).unwrap(),
            PageCommand::Navigate {
                url: "http://localhost:3000".into()
            }
        );
    }

    #[test]
    fn test_parse_rejects_bad_arguments() {
        let err = PageCommand::parse("click", &args(json!({"number": "four"}))).unwrap_err();
        assert!(err.starts_with("Invalid arguments for click"));

        assert!(PageCommand::parse("scroll", &args(json!({"direction": "left"}))).is_err());
        assert!(PageCommand::parse("navigate", &args(json!({"url": " "}))).is_err());
    }

    #[test]
    fn test_unknown_command_is_preserved() {
        let cmd = PageCommand::parse("zoom", &args(json!({"level": 2}))).unwrap();
        match cmd {
            PageCommand::Unknown { name, args } => {
                assert_eq!(name, "zoom");
                assert_eq!(args["level"], 2);
            }
            other => panic!("Unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_tool_call_new_drops_non_object_args() {
        let call = ToolCall::new("1", "click", json!([1, 2]));
        assert!(call.args.is_empty());
        assert!(ToolResult::failure("1", "click", "boom").is_error());
        assert!(!ToolResult::success("1", "click", json!(null)).is_error());
    }
}
