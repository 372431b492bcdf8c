//! pagelive - real-time voice session core
//!
//! Streams microphone audio and sampled video frames to the Gemini Live API,
//! plays the synthesized reply back gaplessly, answers tool calls through a
//! host-supplied capability registry and keeps the session alive across
//! transient network failures.

#![forbid(unsafe_code)]

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod tools;
pub mod transport;
pub mod video;

pub use config::{ReconnectPolicy, SessionConfig, ToolTimeouts};
pub use error::{LiveError, Result};
pub use session::{MediaDevices, SessionEvent, SessionManager, SessionStatus};
pub use tools::{CapabilityRegistry, TimeoutClass, ToolCall, ToolResult};
pub use transport::{Connector, WebSocketConnector};
