//! Taskpilot core - domain model and contracts
//!
//! This crate carries everything the rest of the workspace agrees on:
//! - Domain types (`domain`): tasks, conversations, messages, tool-call
//!   records and the identifiers that tie them to one owning user.
//! - The consumed task capability (`capability`): the fixed set of task
//!   operations the orchestrator may perform, plus deterministic selector
//!   resolution (exact id or case-insensitive title substring).
//! - The conversation store contract (`store`).
//! - The error taxonomy (`errors`): which failures become conversation
//!   turns and which cross the service boundary.
//! - Layered configuration (`config`).
//!
//! No I/O happens here; adapters live in `taskpilot-db`, policy in
//! `taskpilot-agent`.

pub mod capability;
pub mod config;
pub mod domain;
pub mod errors;
pub mod store;

pub use capability::{
    resolve_selector, CapabilityError, CompletedTask, DeletedTask, Resolution, TaskCapability,
    TaskFields, TaskSelector,
};
pub use config::{AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat};
pub use domain::conversation::{
    derive_title, Conversation, ConversationId, ConversationSummary, Message, MessageId, Role,
    ToolCallRecord, MESSAGE_CEILING,
};
pub use domain::task::{StatusFilter, Task, TaskId, UserId};
pub use errors::{ChatError, StoreError, ToolFailure};
pub use store::ConversationStore;
