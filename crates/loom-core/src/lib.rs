//! # loom-core
//!
//! Core types, traits, and primitives for the Loom task execution engine.
//! This crate defines the shared vocabulary used by every other crate in the workspace.

pub mod error;
pub mod event;
pub mod message;
pub mod task;
pub mod tool;
pub mod types;

pub use error::{ErrorEnvelope, LoomError, Result};
pub use event::{ExecutionEvent, StreamEvent, StreamPayload, ToolUsePhase};
pub use message::{Conversation, Message, MessageContent, Role};
pub use task::{Task, TaskMetadata, TaskStatus};
pub use tool::{Tool, ToolCall, ToolContext, ToolHandler, ToolOutcome, ToolOutput, ToolRegistry};
pub use types::*;
