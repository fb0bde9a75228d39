//! Intent resolution: mapping a user utterance plus conversation context
//! onto exactly one decision - a tool proposal, a clarification question,
//! or a plain reply. Resolvers only propose; the orchestrator validates and
//! executes.

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use taskpilot_core::domain::conversation::{Message, Role};

use crate::llm::{LlmChat, WireMessage};
use crate::tools::{self, ToolInvocation, ToolName};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResolverError {
    #[error("language model transport failure: {0}")]
    Transport(String),
    #[error("language model response could not be decoded: {0}")]
    Decode(String),
    #[error("language model returned no choices")]
    EmptyResponse,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolverDecision {
    /// Proposal for a single tool call. Validation and execution belong to
    /// the orchestration loop.
    ToolCall(ToolInvocation),
    /// Ask the user a question instead of acting.
    Clarify(String),
    /// Plain informational reply, no tool needed.
    Reply(String),
}

/// A tool already executed in the current turn, fed back into resolution so
/// the resolver can phrase the final reply.
#[derive(Clone, Debug)]
pub struct ToolObservation {
    pub invocation: ToolInvocation,
    pub result: Value,
    pub summary: String,
}

#[async_trait]
pub trait IntentResolver: Send + Sync {
    async fn resolve(
        &self,
        history: &[Message],
        observations: &[ToolObservation],
        utterance: &str,
    ) -> Result<ResolverDecision, ResolverError>;
}

const SYSTEM_PROMPT: &str = "You are Taskpilot, an assistant that manages the user's task list. \
Use the provided tools for every task mutation or query; never invent task ids or claim an \
action happened without a tool result. When a request is ambiguous or missing a required \
detail, ask a short clarifying question instead of guessing. Keep replies to one or two \
sentences.";

/// Resolver backed by a chat-completions model with tool definitions from
/// the registry.
pub struct LlmResolver<C> {
    chat: C,
}

impl<C> LlmResolver<C>
where
    C: LlmChat,
{
    pub fn new(chat: C) -> Self {
        Self { chat }
    }

    fn wire_context(
        history: &[Message],
        observations: &[ToolObservation],
        utterance: &str,
    ) -> Vec<WireMessage> {
        let mut messages = vec![WireMessage::text("system", SYSTEM_PROMPT)];
        for message in history {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => "system",
            };
            messages.push(WireMessage::text(role, message.content.clone()));
        }
        messages.push(WireMessage::text("user", utterance));

        for (index, observation) in observations.iter().enumerate() {
            let call_id = format!("call-{index}");
            messages.push(WireMessage {
                role: "assistant".to_string(),
                content: None,
                tool_calls: Some(vec![crate::llm::WireToolCall {
                    id: call_id.clone(),
                    kind: "function".to_string(),
                    function: crate::llm::WireFunction {
                        name: observation.invocation.name.as_str().to_string(),
                        arguments: observation.invocation.arguments.to_string(),
                    },
                }]),
                tool_call_id: None,
            });
            messages.push(WireMessage {
                role: "tool".to_string(),
                content: Some(observation.result.to_string()),
                tool_calls: None,
                tool_call_id: Some(call_id),
            });
        }

        messages
    }
}

#[async_trait]
impl<C> IntentResolver for LlmResolver<C>
where
    C: LlmChat,
{
    async fn resolve(
        &self,
        history: &[Message],
        observations: &[ToolObservation],
        utterance: &str,
    ) -> Result<ResolverDecision, ResolverError> {
        let messages = Self::wire_context(history, observations, utterance);
        let definitions = tools::definitions();
        let response = self.chat.chat(&messages, &definitions).await?;

        if let Some(calls) = response.tool_calls {
            let call = calls.into_iter().next().ok_or(ResolverError::EmptyResponse)?;
            let name: ToolName = call
                .function
                .name
                .parse()
                .map_err(|e: String| ResolverError::Decode(e))?;
            let arguments: Value = if call.function.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&call.function.arguments)
                    .map_err(|e| ResolverError::Decode(format!("tool arguments: {e}")))?
            };
            return Ok(ResolverDecision::ToolCall(ToolInvocation { name, arguments }));
        }

        match response.content {
            Some(content) if !content.trim().is_empty() => {
                Ok(ResolverDecision::Reply(content.trim().to_string()))
            }
            _ => Err(ResolverError::EmptyResponse),
        }
    }
}

const HELP_TEXT: &str = "I can manage your task list: try \"add buy milk\", \"show my tasks\", \
\"mark buy milk done\", \"rename buy milk to buy oat milk\", or \"delete buy milk\".";

const CLARIFY_FALLBACK: &str = "I didn't catch what you'd like me to do with your tasks. \
I can add, list, update, complete, or delete them.";

/// Deterministic keyword resolver. Used when no model is configured, and
/// throughout the test suite, so the orchestration loop stays fully
/// exercised without a network.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicResolver;

impl HeuristicResolver {
    pub fn new() -> Self {
        Self
    }

    fn parse(utterance: &str) -> ResolverDecision {
        let text = utterance.trim().trim_end_matches(['.', '!', '?']).trim();
        if text.is_empty() {
            return ResolverDecision::Clarify(CLARIFY_FALLBACK.to_string());
        }
        let lowered = text.to_lowercase();

        if is_greeting(&lowered) {
            return ResolverDecision::Reply(format!("Hello! {HELP_TEXT}"));
        }
        if lowered == "help" || lowered == "what can you do" {
            return ResolverDecision::Reply(HELP_TEXT.to_string());
        }

        for prefix in ["add ", "create ", "new task ", "remind me to "] {
            if let Some(rest) = strip_prefix_ci(text, prefix) {
                return tool(ToolName::AddTask, json!({ "title": rest }));
            }
        }

        for prefix in ["rename ", "change ", "update "] {
            if let Some(rest) = strip_prefix_ci(text, prefix) {
                let rest = strip_leading_task_word(&rest);
                return match split_once_ci(&rest, " to ") {
                    Some((target, new_title)) if !new_title.trim().is_empty() => tool(
                        ToolName::UpdateTask,
                        json!({ "task": target.trim(), "title": new_title.trim() }),
                    ),
                    _ => ResolverDecision::Clarify(format!(
                        "What should \"{}\" be changed to?",
                        rest.trim()
                    )),
                };
            }
        }

        for prefix in ["delete ", "remove ", "drop "] {
            if let Some(rest) = strip_prefix_ci(text, prefix) {
                let target = strip_leading_task_word(&rest);
                return tool(ToolName::DeleteTask, json!({ "task": target.trim() }));
            }
        }

        for prefix in ["complete ", "finish ", "mark ", "check off "] {
            if let Some(rest) = strip_prefix_ci(text, prefix) {
                let target = strip_completion_suffixes(&strip_leading_task_word(&rest));
                return tool(
                    ToolName::CompleteTask,
                    json!({ "task": target.trim(), "completed": true }),
                );
            }
        }

        for prefix in ["reopen ", "uncheck ", "unmark "] {
            if let Some(rest) = strip_prefix_ci(text, prefix) {
                let target = strip_completion_suffixes(&strip_leading_task_word(&rest));
                return tool(
                    ToolName::CompleteTask,
                    json!({ "task": target.trim(), "completed": false }),
                );
            }
        }

        if wants_listing(&lowered) {
            let arguments = if contains_any(&lowered, &["completed", "done", "finished"]) {
                json!({ "status": "completed" })
            } else if contains_any(&lowered, &["open", "remaining", "left", "pending", "incomplete"])
            {
                json!({ "status": "incomplete" })
            } else {
                json!({})
            };
            return tool(ToolName::ListTasks, arguments);
        }

        ResolverDecision::Clarify(CLARIFY_FALLBACK.to_string())
    }
}

fn tool(name: ToolName, arguments: Value) -> ResolverDecision {
    ResolverDecision::ToolCall(ToolInvocation { name, arguments })
}

fn is_greeting(lowered: &str) -> bool {
    let first = lowered.split_whitespace().next().unwrap_or("");
    matches!(first, "hi" | "hello" | "hey" | "howdy") && lowered.split_whitespace().count() <= 3
}

fn wants_listing(lowered: &str) -> bool {
    contains_any(
        lowered,
        &["list", "show", "what's on", "what is on", "my tasks", "to do", "todo", "what do i have"],
    )
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

fn strip_prefix_ci(text: &str, prefix: &str) -> Option<String> {
    if text.len() >= prefix.len()
        && text.is_char_boundary(prefix.len())
        && text[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(text[prefix.len()..].to_string())
    } else {
        None
    }
}

fn strip_leading_task_word(text: &str) -> String {
    let trimmed = text.trim();
    for prefix in ["task ", "the task ", "the "] {
        if let Some(rest) = strip_prefix_ci(trimmed, prefix) {
            return rest;
        }
    }
    trimmed.to_string()
}

fn strip_completion_suffixes(text: &str) -> String {
    let mut current = text.trim();
    for suffix in [" as done", " as complete", " as completed", " done", " complete", " completed"]
    {
        if current.len() >= suffix.len()
            && current.is_char_boundary(current.len() - suffix.len())
            && current[current.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
        {
            current = current[..current.len() - suffix.len()].trim_end();
        }
    }
    current.to_string()
}

fn split_once_ci<'a>(text: &'a str, separator: &str) -> Option<(&'a str, &'a str)> {
    // ASCII lowering keeps byte offsets stable for the slice below.
    let lowered = text.to_ascii_lowercase();
    let index = lowered.find(&separator.to_ascii_lowercase())?;
    Some((&text[..index], &text[index + separator.len()..]))
}

#[async_trait]
impl IntentResolver for HeuristicResolver {
    async fn resolve(
        &self,
        _history: &[Message],
        observations: &[ToolObservation],
        utterance: &str,
    ) -> Result<ResolverDecision, ResolverError> {
        // A tool already ran this turn: phrase its outcome as the reply.
        if let Some(observation) = observations.last() {
            return Ok(ResolverDecision::Reply(observation.summary.clone()));
        }
        Ok(Self::parse(utterance))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use taskpilot_core::domain::conversation::{ConversationId, Message};

    use crate::llm::{LlmChat, WireFunction, WireMessage, WireToolCall};
    use crate::tools::{ToolInvocation, ToolName};

    use super::{
        HeuristicResolver, IntentResolver, LlmResolver, ResolverDecision, ResolverError,
        ToolObservation,
    };

    /// Canned model response, so the resolver's decision mapping can be
    /// exercised without a network.
    struct ScriptedChat {
        response: WireMessage,
    }

    #[async_trait]
    impl LlmChat for ScriptedChat {
        async fn chat(
            &self,
            _messages: &[WireMessage],
            _tools: &[Value],
        ) -> Result<WireMessage, ResolverError> {
            Ok(self.response.clone())
        }
    }

    fn resolver_for(response: WireMessage) -> LlmResolver<ScriptedChat> {
        LlmResolver::new(ScriptedChat { response })
    }

    fn tool_call_response(name: &str, arguments: &str) -> WireMessage {
        WireMessage {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(vec![WireToolCall {
                id: "call-1".to_string(),
                kind: "function".to_string(),
                function: WireFunction {
                    name: name.to_string(),
                    arguments: arguments.to_string(),
                },
            }]),
            tool_call_id: None,
        }
    }

    #[tokio::test]
    async fn model_tool_call_becomes_a_tool_proposal() {
        let resolver = resolver_for(tool_call_response("add_task", r#"{"title":"buy milk"}"#));
        let decision =
            resolver.resolve(&[], &[], "add buy milk").await.expect("resolve");
        match decision {
            ResolverDecision::ToolCall(invocation) => {
                assert_eq!(invocation.name, ToolName::AddTask);
                assert_eq!(invocation.arguments, json!({ "title": "buy milk" }));
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_name_is_a_decode_error() {
        let resolver = resolver_for(tool_call_response("drop_table", "{}"));
        let result = resolver.resolve(&[], &[], "clean up").await;
        assert!(matches!(result, Err(ResolverError::Decode(_))));
    }

    #[tokio::test]
    async fn malformed_tool_arguments_are_a_decode_error() {
        let resolver = resolver_for(tool_call_response("add_task", "{not json"));
        let result = resolver.resolve(&[], &[], "add buy milk").await;
        assert!(matches!(result, Err(ResolverError::Decode(_))));
    }

    #[tokio::test]
    async fn blank_argument_string_defaults_to_an_empty_object() {
        let resolver = resolver_for(tool_call_response("list_tasks", "  "));
        let decision = resolver.resolve(&[], &[], "show my tasks").await.expect("resolve");
        match decision {
            ResolverDecision::ToolCall(invocation) => {
                assert_eq!(invocation.name, ToolName::ListTasks);
                assert_eq!(invocation.arguments, json!({}));
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn plain_content_becomes_a_trimmed_reply() {
        let resolver = resolver_for(WireMessage::text("assistant", "  All done.  "));
        let decision = resolver.resolve(&[], &[], "thanks").await.expect("resolve");
        assert_eq!(decision, ResolverDecision::Reply("All done.".to_string()));
    }

    #[tokio::test]
    async fn blank_content_without_tool_calls_is_an_empty_response() {
        let resolver = resolver_for(WireMessage {
            role: "assistant".to_string(),
            content: Some("   ".to_string()),
            tool_calls: None,
            tool_call_id: None,
        });
        let result = resolver.resolve(&[], &[], "thanks").await;
        assert_eq!(result, Err(ResolverError::EmptyResponse));
    }

    #[test]
    fn wire_context_orders_system_history_utterance_then_observations() {
        let conversation = ConversationId::generate();
        let history = vec![
            Message::user(conversation.clone(), "add buy milk"),
            Message::assistant(conversation.clone(), "Added \"buy milk\".", Vec::new()),
        ];
        let observation = ToolObservation {
            invocation: ToolInvocation { name: ToolName::ListTasks, arguments: json!({}) },
            result: json!({ "status": "ok", "tasks": [] }),
            summary: "Your task list is empty.".to_string(),
        };

        let messages = LlmResolver::<ScriptedChat>::wire_context(
            &history,
            &[observation],
            "show my tasks",
        );

        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user", "assistant", "tool"]);
        assert_eq!(messages[3].content.as_deref(), Some("show my tasks"));
        let calls = messages[4].tool_calls.as_ref().expect("tool call message");
        assert_eq!(calls[0].function.name, "list_tasks");
        assert_eq!(messages[5].tool_call_id.as_deref(), Some("call-0"));
    }

    fn parsed(text: &str) -> ResolverDecision {
        HeuristicResolver::parse(text)
    }

    fn expect_tool(decision: ResolverDecision) -> (ToolName, serde_json::Value) {
        match decision {
            ResolverDecision::ToolCall(invocation) => (invocation.name, invocation.arguments),
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn add_phrasings_extract_the_title() {
        let (name, args) = expect_tool(parsed("Add buy milk"));
        assert_eq!(name, ToolName::AddTask);
        assert_eq!(args, json!({ "title": "buy milk" }));

        let (name, args) = expect_tool(parsed("remind me to call the dentist"));
        assert_eq!(name, ToolName::AddTask);
        assert_eq!(args, json!({ "title": "call the dentist" }));
    }

    #[test]
    fn delete_phrasings_extract_the_selector() {
        let (name, args) = expect_tool(parsed("delete meeting"));
        assert_eq!(name, ToolName::DeleteTask);
        assert_eq!(args, json!({ "task": "meeting" }));

        let (name, args) = expect_tool(parsed("remove task 4"));
        assert_eq!(name, ToolName::DeleteTask);
        assert_eq!(args, json!({ "task": "4" }));
    }

    #[test]
    fn completion_phrasings_strip_done_suffixes() {
        let (name, args) = expect_tool(parsed("mark task 999 done"));
        assert_eq!(name, ToolName::CompleteTask);
        assert_eq!(args, json!({ "task": "999", "completed": true }));

        let (name, args) = expect_tool(parsed("mark buy milk as done"));
        assert_eq!(name, ToolName::CompleteTask);
        assert_eq!(args, json!({ "task": "buy milk", "completed": true }));

        let (name, args) = expect_tool(parsed("reopen buy milk"));
        assert_eq!(name, ToolName::CompleteTask);
        assert_eq!(args, json!({ "task": "buy milk", "completed": false }));
    }

    #[test]
    fn rename_needs_a_target_or_asks() {
        let (name, args) = expect_tool(parsed("rename buy milk to buy oat milk"));
        assert_eq!(name, ToolName::UpdateTask);
        assert_eq!(args, json!({ "task": "buy milk", "title": "buy oat milk" }));

        assert!(matches!(parsed("rename buy milk"), ResolverDecision::Clarify(_)));
    }

    #[test]
    fn listing_phrasings_pick_a_filter() {
        let (name, args) = expect_tool(parsed("show my tasks"));
        assert_eq!(name, ToolName::ListTasks);
        assert_eq!(args, json!({}));

        let (_, args) = expect_tool(parsed("list completed tasks"));
        assert_eq!(args, json!({ "status": "completed" }));

        let (_, args) = expect_tool(parsed("what's on my list that's still pending"));
        assert_eq!(args, json!({ "status": "incomplete" }));
    }

    #[test]
    fn greetings_and_help_reply_without_tools() {
        assert!(matches!(parsed("hey there"), ResolverDecision::Reply(_)));
        assert!(matches!(parsed("help"), ResolverDecision::Reply(_)));
    }

    #[test]
    fn unrecognized_text_asks_for_clarification() {
        assert!(matches!(parsed("the weather is nice"), ResolverDecision::Clarify(_)));
    }

    #[test]
    fn common_phrasings_all_resolve() {
        struct Case {
            text: &'static str,
            expect: ToolName,
        }

        let cases = vec![
            Case { text: "add water the plants", expect: ToolName::AddTask },
            Case { text: "create grocery run", expect: ToolName::AddTask },
            Case { text: "new task book flights", expect: ToolName::AddTask },
            Case { text: "remind me to stretch", expect: ToolName::AddTask },
            Case { text: "list my tasks", expect: ToolName::ListTasks },
            Case { text: "show me what's left", expect: ToolName::ListTasks },
            Case { text: "what do i have to do", expect: ToolName::ListTasks },
            Case { text: "delete the task water the plants", expect: ToolName::DeleteTask },
            Case { text: "remove grocery run", expect: ToolName::DeleteTask },
            Case { text: "drop task 12", expect: ToolName::DeleteTask },
            Case { text: "complete stretch", expect: ToolName::CompleteTask },
            Case { text: "finish task 3", expect: ToolName::CompleteTask },
            Case { text: "mark book flights as completed", expect: ToolName::CompleteTask },
            Case { text: "check off stretch", expect: ToolName::CompleteTask },
            Case { text: "rename task 3 to book trains", expect: ToolName::UpdateTask },
            Case { text: "change grocery run to weekly groceries", expect: ToolName::UpdateTask },
        ];

        for case in cases {
            let (name, _) = expect_tool(parsed(case.text));
            assert_eq!(name, case.expect, "case: {}", case.text);
        }
    }

    #[tokio::test]
    async fn observation_turns_into_the_final_reply() {
        let resolver = HeuristicResolver::new();
        let history: Vec<Message> = Vec::new();
        let observation = ToolObservation {
            invocation: ToolInvocation {
                name: ToolName::AddTask,
                arguments: json!({ "title": "buy milk" }),
            },
            result: json!({ "status": "created" }),
            summary: "Added \"buy milk\" to your list (task #1).".to_string(),
        };

        let decision =
            resolver.resolve(&history, &[observation], "Add buy milk").await.expect("resolve");
        match decision {
            ResolverDecision::Reply(text) => assert!(text.contains("buy milk")),
            other => panic!("expected reply, got {other:?}"),
        }
    }
}
