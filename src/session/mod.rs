//! Session lifecycle: the connection state machine, the link pipelines use to
//! reach the current transport, and the manager actor tying them together.

pub mod fsm;
pub mod link;
pub mod manager;

pub use fsm::{ConnectionState, SessionStatus};
pub use link::{Offer, SessionLink};
pub use manager::{MediaDevices, SessionEvent, SessionManager};
