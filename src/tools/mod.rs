//! Tool calls: typed calls and results, the capability registry, page
//! capabilities and the concurrent dispatcher.

pub mod call;
pub mod dispatcher;
pub mod page;
pub mod registry;

pub use call::{PageCommand, ScrollDirection, ToolCall, ToolResponsePayload, ToolResult};
pub use dispatcher::Dispatcher;
pub use page::{register_page_capabilities, PageBridge};
pub use registry::{Capability, CapabilityRegistry, Handler, HandlerResult, TimeoutClass};
