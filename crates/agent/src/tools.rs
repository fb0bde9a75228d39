//! The tool registry: the single authority for what the agent may do and
//! how arguments are checked before any mutation happens.
//!
//! Dispatch is a closed tagged enum, not trait objects: every tool's
//! argument schema is statically known and exhaustively validated.

use serde_json::{json, Value};

use taskpilot_core::capability::{TaskCapability, TaskFields, TaskSelector};
use taskpilot_core::domain::conversation::ToolCallRecord;
use taskpilot_core::domain::task::{StatusFilter, Task, UserId};
use taskpilot_core::errors::ToolFailure;
use uuid::Uuid;

pub const TITLE_MAX_CHARS: usize = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolName {
    AddTask,
    ListTasks,
    UpdateTask,
    DeleteTask,
    CompleteTask,
}

pub const ALL_TOOLS: &[ToolName] = &[
    ToolName::AddTask,
    ToolName::ListTasks,
    ToolName::UpdateTask,
    ToolName::DeleteTask,
    ToolName::CompleteTask,
];

impl ToolName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddTask => "add_task",
            Self::ListTasks => "list_tasks",
            Self::UpdateTask => "update_task",
            Self::DeleteTask => "delete_task",
            Self::CompleteTask => "complete_task",
        }
    }
}

impl std::str::FromStr for ToolName {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "add_task" => Ok(Self::AddTask),
            "list_tasks" => Ok(Self::ListTasks),
            "update_task" => Ok(Self::UpdateTask),
            "delete_task" => Ok(Self::DeleteTask),
            "complete_task" => Ok(Self::CompleteTask),
            other => Err(format!("unknown tool `{other}`")),
        }
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool call as proposed by the intent resolver. Not yet trusted:
/// arguments are raw JSON until [`validate`] has passed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolInvocation {
    pub name: ToolName,
    pub arguments: Value,
}

/// A schema-checked tool call, ready to execute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidatedCall {
    AddTask { title: String, description: Option<String> },
    ListTasks { filter: Option<StatusFilter> },
    UpdateTask { selector: TaskSelector, fields: TaskFields },
    DeleteTask { selector: TaskSelector },
    CompleteTask { selector: TaskSelector, completed: bool },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolOutcome {
    Added(Task),
    Listed { tasks: Vec<Task>, filter: Option<StatusFilter> },
    Updated(Task),
    Deleted { title: String, remaining: usize },
    Completed { task: Task, remaining_incomplete: usize },
}

impl ToolOutcome {
    pub fn result_json(&self) -> Value {
        match self {
            Self::Added(task) => json!({ "status": "created", "task": task }),
            Self::Listed { tasks, filter } => json!({
                "status": "ok",
                "filter": filter.map(|f| f.as_str()),
                "tasks": tasks,
            }),
            Self::Updated(task) => json!({ "status": "updated", "task": task }),
            Self::Deleted { title, remaining } => {
                json!({ "status": "deleted", "title": title, "remaining": remaining })
            }
            Self::Completed { task, remaining_incomplete } => json!({
                "status": "updated",
                "task": task,
                "remaining_incomplete": remaining_incomplete,
            }),
        }
    }
}

fn string_arg(arguments: &Value, key: &str) -> Result<Option<String>, ToolFailure> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(ToolFailure::Validation(format!(
            "argument `{key}` must be a string, got {other}"
        ))),
    }
}

fn bool_arg(arguments: &Value, key: &str) -> Result<Option<bool>, ToolFailure> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(ToolFailure::Validation(format!(
            "argument `{key}` must be a boolean, got {other}"
        ))),
    }
}

fn selector_arg(arguments: &Value) -> Result<TaskSelector, ToolFailure> {
    let raw = string_arg(arguments, "task")?
        .ok_or_else(|| ToolFailure::Validation("argument `task` is required".to_string()))?;
    if raw.trim().is_empty() {
        return Err(ToolFailure::Validation("argument `task` must not be empty".to_string()));
    }
    Ok(TaskSelector::parse(&raw))
}

/// Check a proposed invocation against its tool's schema. The orchestrator
/// never executes an invocation that has not passed through here.
pub fn validate(invocation: &ToolInvocation) -> Result<ValidatedCall, ToolFailure> {
    let arguments = &invocation.arguments;
    if !arguments.is_object() {
        return Err(ToolFailure::Validation("tool arguments must be an object".to_string()));
    }

    match invocation.name {
        ToolName::AddTask => {
            let title = string_arg(arguments, "title")?
                .map(|t| t.trim().to_string())
                .unwrap_or_default();
            if title.is_empty() {
                return Err(ToolFailure::Validation(
                    "a non-empty `title` is required".to_string(),
                ));
            }
            if title.chars().count() > TITLE_MAX_CHARS {
                return Err(ToolFailure::Validation(format!(
                    "`title` must be at most {TITLE_MAX_CHARS} characters"
                )));
            }
            let description = string_arg(arguments, "description")?;
            Ok(ValidatedCall::AddTask { title, description })
        }
        ToolName::ListTasks => {
            let filter = match string_arg(arguments, "status")? {
                Some(raw) => Some(
                    raw.parse::<StatusFilter>().map_err(ToolFailure::Validation)?,
                ),
                None => None,
            };
            Ok(ValidatedCall::ListTasks { filter })
        }
        ToolName::UpdateTask => {
            let selector = selector_arg(arguments)?;
            let title = match string_arg(arguments, "title")? {
                Some(t) => {
                    let trimmed = t.trim().to_string();
                    if trimmed.is_empty() {
                        return Err(ToolFailure::Validation(
                            "`title` must not be empty".to_string(),
                        ));
                    }
                    if trimmed.chars().count() > TITLE_MAX_CHARS {
                        return Err(ToolFailure::Validation(format!(
                            "`title` must be at most {TITLE_MAX_CHARS} characters"
                        )));
                    }
                    Some(trimmed)
                }
                None => None,
            };
            let description = string_arg(arguments, "description")?;
            let fields = TaskFields { title, description };
            if fields.is_empty() {
                return Err(ToolFailure::Validation(
                    "provide a new `title` or `description`".to_string(),
                ));
            }
            Ok(ValidatedCall::UpdateTask { selector, fields })
        }
        ToolName::DeleteTask => Ok(ValidatedCall::DeleteTask { selector: selector_arg(arguments)? }),
        ToolName::CompleteTask => {
            let selector = selector_arg(arguments)?;
            let completed = bool_arg(arguments, "completed")?.unwrap_or(true);
            Ok(ValidatedCall::CompleteTask { selector, completed })
        }
    }
}

/// Execute a validated call against the task capability, scoped to `user`.
pub async fn execute(
    user: &UserId,
    call: ValidatedCall,
    capability: &dyn TaskCapability,
) -> Result<ToolOutcome, ToolFailure> {
    match call {
        ValidatedCall::AddTask { title, description } => {
            let task = capability.add(user, &title, description.as_deref()).await?;
            Ok(ToolOutcome::Added(task))
        }
        ValidatedCall::ListTasks { filter } => {
            let tasks = capability.list(user, filter).await?;
            Ok(ToolOutcome::Listed { tasks, filter })
        }
        ValidatedCall::UpdateTask { selector, fields } => {
            let task = capability.update(user, &selector, fields).await?;
            Ok(ToolOutcome::Updated(task))
        }
        ValidatedCall::DeleteTask { selector } => {
            let deleted = capability.delete(user, &selector).await?;
            Ok(ToolOutcome::Deleted { title: deleted.title, remaining: deleted.remaining })
        }
        ValidatedCall::CompleteTask { selector, completed } => {
            let result = capability.set_completed(user, &selector, completed).await?;
            Ok(ToolOutcome::Completed {
                task: result.task,
                remaining_incomplete: result.remaining_incomplete,
            })
        }
    }
}

pub fn success_record(invocation: &ToolInvocation, outcome: &ToolOutcome) -> ToolCallRecord {
    ToolCallRecord {
        id: Uuid::new_v4().to_string(),
        tool_name: invocation.name.as_str().to_string(),
        arguments: invocation.arguments.clone(),
        result: outcome.result_json(),
    }
}

pub fn failure_record(invocation: &ToolInvocation, failure: &ToolFailure) -> ToolCallRecord {
    let result = match failure {
        ToolFailure::Validation(message) => {
            json!({ "status": "validation_error", "message": message })
        }
        ToolFailure::NotFound { selector } => {
            json!({ "status": "not_found", "selector": selector })
        }
        ToolFailure::Ambiguous { candidates } => json!({
            "status": "ambiguous",
            "candidates": candidates.iter().map(|t| &t.title).collect::<Vec<_>>(),
        }),
        ToolFailure::Upstream(_) => json!({ "status": "error" }),
    };
    ToolCallRecord {
        id: Uuid::new_v4().to_string(),
        tool_name: invocation.name.as_str().to_string(),
        arguments: invocation.arguments.clone(),
        result,
    }
}

/// JSON tool definitions in the chat-completions `tools` format, handed to
/// the language model so its proposals line up with the schemas validated
/// here.
pub fn definitions() -> Vec<Value> {
    let selector_property = json!({
        "type": "string",
        "description": "Task id (numeric) or a fragment of the task title",
    });

    vec![
        json!({
            "type": "function",
            "function": {
                "name": "add_task",
                "description": "Create a new task on the user's list",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "title": { "type": "string", "description": "Short task title, at most 200 characters" },
                        "description": { "type": "string", "description": "Optional longer detail" },
                    },
                    "required": ["title"],
                },
            },
        }),
        json!({
            "type": "function",
            "function": {
                "name": "list_tasks",
                "description": "List the user's tasks, optionally filtered by status",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "status": { "type": "string", "enum": ["incomplete", "completed"] },
                    },
                },
            },
        }),
        json!({
            "type": "function",
            "function": {
                "name": "update_task",
                "description": "Change a task's title or description",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "task": selector_property,
                        "title": { "type": "string" },
                        "description": { "type": "string" },
                    },
                    "required": ["task"],
                },
            },
        }),
        json!({
            "type": "function",
            "function": {
                "name": "delete_task",
                "description": "Delete a task from the user's list",
                "parameters": {
                    "type": "object",
                    "properties": { "task": selector_property },
                    "required": ["task"],
                },
            },
        }),
        json!({
            "type": "function",
            "function": {
                "name": "complete_task",
                "description": "Mark a task as done (or not done when `completed` is false)",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "task": selector_property,
                        "completed": { "type": "boolean", "default": true },
                    },
                    "required": ["task"],
                },
            },
        }),
    ]
}
