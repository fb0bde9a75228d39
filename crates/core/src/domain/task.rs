use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque caller identity, issued by the external auth collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub i64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of a task record as exposed by the task capability.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub user_id: UserId,
    pub title: String,
    pub description: Option<String>,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    Incomplete,
    Completed,
}

impl StatusFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::Completed => "completed",
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        match self {
            Self::Incomplete => !task.completed,
            Self::Completed => task.completed,
        }
    }
}

impl std::str::FromStr for StatusFilter {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "incomplete" | "pending" | "open" => Ok(Self::Incomplete),
            "completed" | "complete" | "done" => Ok(Self::Completed),
            other => Err(format!("unknown status filter `{other}`")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::StatusFilter;

    #[test]
    fn status_filter_parses_synonyms() {
        assert_eq!("done".parse::<StatusFilter>().unwrap(), StatusFilter::Completed);
        assert_eq!("pending".parse::<StatusFilter>().unwrap(), StatusFilter::Incomplete);
        assert!("archived".parse::<StatusFilter>().is_err());
    }
}
