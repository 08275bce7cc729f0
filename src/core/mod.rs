//! Core conversation components
//!
//! Persistence of message logs and the conversation index, the reveal
//! scheduler that types replies out chunk by chunk, and the engine that
//! ties them to a completion gateway.

pub mod analysis;
mod badges;
mod engine;
mod events;
mod index;
mod messages;
mod reveal;

pub use engine::{ConversationEngine, EngineConfig, EngineError, ScanReceipt, SendReceipt};
