//! Taskpilot agent - intent resolution and orchestration
//!
//! This crate is the decision-making layer between a raw chat message and a
//! safe task mutation:
//! - **Tool registry** (`tools`) - the closed set of callable tools with
//!   schema validation in front of every execution
//! - **Intent resolution** (`resolver`, `llm`) - maps an utterance plus
//!   conversation context onto a tool proposal, a clarification question,
//!   or a plain reply
//! - **Admission control** (`limiter`) - per-user sliding-window rate limit
//! - **Orchestration loop** (`orchestrator`) - the state machine that ties
//!   admission, conversation loading, resolution, tool execution, and
//!   persistence together
//!
//! # Safety Principle
//!
//! The language model is strictly a translator. It proposes tool calls; it
//! never executes them. Every proposal passes the registry's validation
//! before it touches the task capability, every execution is scoped to the
//! conversation's owner, and ambiguity is always returned to the user
//! instead of guessed at.

pub mod limiter;
pub mod llm;
pub mod orchestrator;
pub mod reply;
pub mod resolver;
pub mod tools;

pub use limiter::{Admission, RateLimiter};
pub use orchestrator::{ChatRequest, EventSink, Orchestrator, TurnEvent, TurnOutcome};
pub use resolver::{HeuristicResolver, IntentResolver, LlmResolver, ResolverDecision};
pub use tools::{ToolInvocation, ToolName, ToolOutcome, ValidatedCall};
