//! The consumed task capability: every mutation or query the orchestrator is
//! allowed to perform on a user's task list, scoped by caller identity.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::task::{StatusFilter, Task, UserId};

/// How a user referred to a task. Numeric input resolves by exact id,
/// anything else by case-insensitive substring match against titles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskSelector {
    Id(i64),
    Title(String),
}

impl TaskSelector {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<i64>() {
            Ok(id) => Self::Id(id),
            Err(_) => Self::Title(trimmed.to_string()),
        }
    }
}

impl std::fmt::Display for TaskSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "#{id}"),
            Self::Title(title) => write!(f, "\"{title}\""),
        }
    }
}

/// Outcome of resolving a selector against a user's tasks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    None,
    One(Task),
    Many(Vec<Task>),
}

/// Deterministic selector resolution shared by every capability adapter.
/// Zero matches never guesses, more than one never picks arbitrarily.
pub fn resolve_selector(tasks: &[Task], selector: &TaskSelector) -> Resolution {
    match selector {
        TaskSelector::Id(id) => match tasks.iter().find(|task| task.id.0 == *id) {
            Some(task) => Resolution::One(task.clone()),
            None => Resolution::None,
        },
        TaskSelector::Title(needle) => {
            let needle = needle.to_lowercase();
            let mut matches: Vec<Task> = tasks
                .iter()
                .filter(|task| task.title.to_lowercase().contains(&needle))
                .cloned()
                .collect();
            match matches.len() {
                0 => Resolution::None,
                1 => Resolution::One(matches.remove(0)),
                _ => Resolution::Many(matches),
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskFields {
    pub title: Option<String>,
    pub description: Option<String>,
}

impl TaskFields {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeletedTask {
    pub title: String,
    pub remaining: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedTask {
    pub task: Task,
    pub remaining_incomplete: usize,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("no task matched selector {selector}")]
    NotFound { selector: String },
    #[error("{} tasks matched the selector", candidates.len())]
    Ambiguous { candidates: Vec<Task> },
    #[error("task capability failure: {0}")]
    Internal(String),
}

/// The external task store, consumed as a capability. Every operation is
/// scoped to the supplied user; one user's tasks are invisible to another.
#[async_trait]
pub trait TaskCapability: Send + Sync {
    async fn add(
        &self,
        user: &UserId,
        title: &str,
        description: Option<&str>,
    ) -> Result<Task, CapabilityError>;

    async fn list(
        &self,
        user: &UserId,
        filter: Option<StatusFilter>,
    ) -> Result<Vec<Task>, CapabilityError>;

    async fn update(
        &self,
        user: &UserId,
        selector: &TaskSelector,
        fields: TaskFields,
    ) -> Result<Task, CapabilityError>;

    async fn delete(
        &self,
        user: &UserId,
        selector: &TaskSelector,
    ) -> Result<DeletedTask, CapabilityError>;

    async fn set_completed(
        &self,
        user: &UserId,
        selector: &TaskSelector,
        completed: bool,
    ) -> Result<CompletedTask, CapabilityError>;
}
