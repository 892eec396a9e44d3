//! # Inter-Agent Bus
//!
//! Message relay between named agent roles. No business logic: agents send,
//! respond and poll; the bus only keeps the log and the request/response links.
//!
//! ```text
//! reviewer ──clarification_request──▶ [bus] ◀──poll── planner
//! reviewer ◀──poll── [bus] ◀──clarification_response── planner
//! ```

pub mod message;
pub mod message_bus;

pub use message::{Message, MessageFilter, MessageKind};
pub use message_bus::MessageBus;
