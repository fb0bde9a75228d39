//! The orchestration loop: Idle -> Admitted -> Resolving ->
//! (Executing Tool)* -> Responding -> Idle.
//!
//! Every failure path still produces a persisted assistant message, so the
//! conversation stays coherent across errors; only rate limiting crosses
//! the boundary as a distinct error.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, info, warn};

use taskpilot_core::capability::TaskCapability;
use taskpilot_core::domain::conversation::{derive_title, Conversation, ConversationId, Message};
use taskpilot_core::domain::task::UserId;
use taskpilot_core::errors::{ChatError, StoreError, ToolFailure};
use taskpilot_core::store::ConversationStore;

use crate::limiter::{Admission, RateLimiter};
use crate::reply;
use crate::resolver::{IntentResolver, ResolverDecision, ResolverError, ToolObservation};
use crate::tools::{self, ToolInvocation};

/// At most this many tool executions per user turn. Multi-step intents are
/// rare; anything past the bound falls back to the last rendered outcome.
const MAX_TOOL_STEPS: usize = 3;

#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub user: UserId,
    pub message: String,
    pub conversation_id: Option<ConversationId>,
}

#[derive(Clone, Debug)]
pub struct TurnOutcome {
    pub conversation: Conversation,
    pub message: Message,
    /// True when the message ceiling forced a successor conversation.
    pub rolled_over: bool,
}

/// Streamed progress increments, emitted before the final message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnEvent {
    Resolving,
    ToolStarted { tool: String },
    ToolFinished { tool: String, ok: bool },
}

/// Best-effort event channel. A closed or absent receiver never fails the
/// turn.
#[derive(Clone)]
pub struct EventSink(Option<mpsc::Sender<TurnEvent>>);

impl EventSink {
    pub fn new(sender: mpsc::Sender<TurnEvent>) -> Self {
        Self(Some(sender))
    }

    pub fn disabled() -> Self {
        Self(None)
    }

    async fn emit(&self, event: TurnEvent) {
        if let Some(sender) = &self.0 {
            let _ = sender.send(event).await;
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn ConversationStore>,
    tasks: Arc<dyn TaskCapability>,
    resolver: Arc<dyn IntentResolver>,
    limiter: RateLimiter,
    step_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        tasks: Arc<dyn TaskCapability>,
        resolver: Arc<dyn IntentResolver>,
        limiter: RateLimiter,
        step_timeout: Duration,
    ) -> Self {
        Self { store, tasks, resolver, limiter, step_timeout }
    }

    /// Handle one user turn end to end. Returns the persisted assistant
    /// message; the only error callers see besides store lookup failures is
    /// `RateLimited`.
    pub async fn handle(
        &self,
        request: ChatRequest,
        events: &EventSink,
    ) -> Result<TurnOutcome, ChatError> {
        // Idle -> Admitted
        if let Admission::Rejected { retry_after_seconds } =
            self.limiter.admit(&request.user).await
        {
            info!(
                user_id = %request.user,
                retry_after_seconds,
                "request rejected by rate limiter"
            );
            return Err(ChatError::RateLimited { retry_after_seconds });
        }

        let text = request.message.trim().to_string();

        // Admitted -> Resolving: load or create the conversation.
        let (mut conversation, mut history) = match &request.conversation_id {
            Some(id) => self.store.load(id, &request.user).await?,
            None => {
                let conversation =
                    self.store.create(&request.user, &derive_title(&text)).await?;
                (conversation, Vec::new())
            }
        };

        let mut rolled_over = false;
        let user_message = Message::user(conversation.id.clone(), text.clone());
        if let Err(append_error) = self.store.append(&conversation.id, user_message).await {
            match append_error {
                StoreError::Full => {
                    // Rollover: the full conversation stays as read-only
                    // history; this and later turns land in a successor.
                    conversation = self.rollover(&request.user, &conversation.id, &text).await?;
                    history.clear();
                    rolled_over = true;
                }
                other => return Err(other.into()),
            }
        }

        events.emit(TurnEvent::Resolving).await;
        let (content, records) = self.run_turn(&request.user, &history, &text, events).await;

        let mut assistant = Message::assistant(conversation.id.clone(), content, records);
        if let Err(append_error) =
            self.store.append(&conversation.id, assistant.clone()).await
        {
            match append_error {
                StoreError::Full => {
                    let (successor, moved) = self
                        .rollover_for_message(&request.user, &conversation.id, &text, &assistant)
                        .await?;
                    conversation = successor;
                    assistant = moved;
                    rolled_over = true;
                }
                other => return Err(other.into()),
            }
        }

        Ok(TurnOutcome { conversation, message: assistant, rolled_over })
    }

    async fn rollover(
        &self,
        user: &UserId,
        full_conversation: &ConversationId,
        text: &str,
    ) -> Result<Conversation, ChatError> {
        info!(
            conversation_id = %full_conversation,
            "conversation reached its message ceiling, starting a successor"
        );
        let successor = self.store.create(user, &derive_title(text)).await?;
        let message = Message::user(successor.id.clone(), text);
        self.store.append(&successor.id, message).await?;
        Ok(successor)
    }

    /// Rollover when the ceiling is hit between the user append and the
    /// assistant append. The successor carries the whole turn: a copy of the
    /// user message, then the reply, and takes its title from the user's
    /// words.
    async fn rollover_for_message(
        &self,
        user: &UserId,
        full_conversation: &ConversationId,
        utterance: &str,
        message: &Message,
    ) -> Result<(Conversation, Message), ChatError> {
        info!(
            conversation_id = %full_conversation,
            "conversation filled mid-turn, moving the turn to a successor"
        );
        let successor = self.store.create(user, &derive_title(utterance)).await?;
        self.store
            .append(&successor.id, Message::user(successor.id.clone(), utterance))
            .await?;
        let mut moved = message.clone();
        moved.conversation_id = successor.id.clone();
        self.store.append(&successor.id, moved.clone()).await?;
        Ok((successor, moved))
    }

    /// Resolving -> (Executing Tool)* -> Responding. Never fails: every
    /// branch ends in assistant text plus the tool-call records to persist.
    async fn run_turn(
        &self,
        user: &UserId,
        history: &[Message],
        utterance: &str,
        events: &EventSink,
    ) -> (String, Vec<taskpilot_core::domain::conversation::ToolCallRecord>) {
        let mut observations: Vec<ToolObservation> = Vec::new();
        let mut records = Vec::new();

        loop {
            let decision = match self.resolve_with_retry(history, &observations, utterance).await
            {
                Ok(decision) => decision,
                Err(resolver_error) => {
                    error!(error = %resolver_error, "intent resolution failed");
                    return (fallback_text(&observations), records);
                }
            };

            let invocation = match decision {
                ResolverDecision::Reply(text) | ResolverDecision::Clarify(text) => {
                    return (text, records);
                }
                ResolverDecision::ToolCall(invocation) => invocation,
            };

            if observations.len() >= MAX_TOOL_STEPS {
                warn!(tool = %invocation.name, "tool step bound reached, responding with last outcome");
                return (fallback_text(&observations), records);
            }

            // Validation always precedes execution.
            let call = match tools::validate(&invocation) {
                Ok(call) => call,
                Err(failure) => {
                    records.push(tools::failure_record(&invocation, &failure));
                    let detail = match &failure {
                        ToolFailure::Validation(message) => message.clone(),
                        other => other.to_string(),
                    };
                    return (reply::render_invalid(&detail), records);
                }
            };

            events
                .emit(TurnEvent::ToolStarted { tool: invocation.name.as_str().to_string() })
                .await;

            match self.execute_with_retry(user, &call).await {
                Ok(outcome) => {
                    info!(user_id = %user, tool = %invocation.name, "tool executed");
                    records.push(tools::success_record(&invocation, &outcome));
                    events
                        .emit(TurnEvent::ToolFinished {
                            tool: invocation.name.as_str().to_string(),
                            ok: true,
                        })
                        .await;
                    observations.push(ToolObservation {
                        result: outcome.result_json(),
                        summary: reply::render_outcome(&outcome),
                        invocation,
                    });
                    // Back to Resolving with the result in context.
                    continue;
                }
                Err(failure) => {
                    records.push(tools::failure_record(&invocation, &failure));
                    events
                        .emit(TurnEvent::ToolFinished {
                            tool: invocation.name.as_str().to_string(),
                            ok: false,
                        })
                        .await;
                    let text = self.render_failure(user, &invocation, failure).await;
                    return (text, records);
                }
            }
        }
    }

    async fn render_failure(
        &self,
        user: &UserId,
        invocation: &ToolInvocation,
        failure: ToolFailure,
    ) -> String {
        match failure {
            // Ambiguity becomes a clarification turn; the partial intent is
            // discarded and the next message starts a fresh resolution pass.
            ToolFailure::Ambiguous { candidates } => reply::render_ambiguous(&candidates),
            ToolFailure::NotFound { selector } => {
                let current = self.tasks.list(user, None).await.unwrap_or_default();
                reply::render_not_found(&selector, &current)
            }
            ToolFailure::Validation(detail) => reply::render_invalid(&detail),
            ToolFailure::Upstream(detail) => {
                error!(tool = %invocation.name, error = %detail, "tool upstream failure");
                reply::APOLOGY.to_string()
            }
        }
    }

    async fn resolve_with_retry(
        &self,
        history: &[Message],
        observations: &[ToolObservation],
        utterance: &str,
    ) -> Result<ResolverDecision, ResolverError> {
        for attempt in 0..2 {
            match timeout(
                self.step_timeout,
                self.resolver.resolve(history, observations, utterance),
            )
            .await
            {
                Ok(Ok(decision)) => return Ok(decision),
                Ok(Err(resolver_error)) if attempt == 0 => {
                    warn!(error = %resolver_error, "resolver failed, retrying once");
                }
                Ok(Err(resolver_error)) => return Err(resolver_error),
                Err(_) if attempt == 0 => {
                    warn!("resolver timed out, retrying once");
                }
                Err(_) => {
                    return Err(ResolverError::Transport("resolution timed out".to_string()))
                }
            }
        }
        unreachable!("resolver retry loop always returns")
    }

    async fn execute_with_retry(
        &self,
        user: &UserId,
        call: &tools::ValidatedCall,
    ) -> Result<tools::ToolOutcome, ToolFailure> {
        for attempt in 0..2 {
            let result =
                timeout(self.step_timeout, tools::execute(user, call.clone(), &*self.tasks)).await;
            match result {
                Ok(Ok(outcome)) => return Ok(outcome),
                // Only upstream failures warrant a retry; not-found and
                // ambiguity are answers, not errors.
                Ok(Err(ToolFailure::Upstream(detail))) if attempt == 0 => {
                    warn!(error = %detail, "tool upstream failure, retrying once");
                }
                Ok(Err(failure)) => return Err(failure),
                Err(_) if attempt == 0 => {
                    warn!("tool execution timed out, retrying once");
                }
                Err(_) => {
                    return Err(ToolFailure::Upstream("tool execution timed out".to_string()))
                }
            }
        }
        unreachable!("execution retry loop always returns")
    }
}

fn fallback_text(observations: &[ToolObservation]) -> String {
    observations
        .last()
        .map(|observation| observation.summary.clone())
        .unwrap_or_else(|| reply::APOLOGY.to_string())
}
