//! Deterministic rendering of tool outcomes and failures into assistant
//! text. Keeping this out of the language model means a confirmation always
//! states what actually happened.

use taskpilot_core::domain::task::{StatusFilter, Task};

pub const APOLOGY: &str =
    "Sorry, something went wrong while handling that. Please try again in a moment.";

use crate::tools::ToolOutcome;

fn task_line(task: &Task) -> String {
    let mark = if task.completed { "x" } else { " " };
    format!("#{} [{mark}] {}", task.id, task.title)
}

fn task_block(tasks: &[Task]) -> String {
    tasks.iter().map(task_line).collect::<Vec<_>>().join("\n")
}

pub fn render_outcome(outcome: &ToolOutcome) -> String {
    match outcome {
        ToolOutcome::Added(task) => {
            format!("Added \"{}\" to your list (task #{}).", task.title, task.id)
        }
        ToolOutcome::Listed { tasks, filter } => {
            if tasks.is_empty() {
                return match filter {
                    Some(StatusFilter::Completed) => {
                        "You have no completed tasks yet.".to_string()
                    }
                    Some(StatusFilter::Incomplete) => {
                        "Nothing open - your task list is all done.".to_string()
                    }
                    None => "Your task list is empty.".to_string(),
                };
            }
            let label = match filter {
                Some(StatusFilter::Completed) => "completed task",
                Some(StatusFilter::Incomplete) => "open task",
                None => "task",
            };
            let plural = if tasks.len() == 1 { "" } else { "s" };
            format!("You have {} {label}{plural}:\n{}", tasks.len(), task_block(tasks))
        }
        ToolOutcome::Updated(task) => {
            format!("Updated task #{}: \"{}\".", task.id, task.title)
        }
        ToolOutcome::Deleted { title, remaining } => {
            let plural = if *remaining == 1 { "" } else { "s" };
            format!("Deleted \"{title}\". {remaining} task{plural} left.")
        }
        ToolOutcome::Completed { task, remaining_incomplete } => {
            if task.completed {
                let tail = match remaining_incomplete {
                    0 => "That was the last one - everything is done.".to_string(),
                    1 => "1 task still open.".to_string(),
                    n => format!("{n} tasks still open."),
                };
                format!("Marked \"{}\" as done. {tail}", task.title)
            } else {
                format!("Reopened \"{}\".", task.title)
            }
        }
    }
}

/// Clarification for an ambiguous match: list exactly the candidates, never
/// pick one.
pub fn render_ambiguous(candidates: &[Task]) -> String {
    let options = candidates
        .iter()
        .map(|task| format!("- {} (#{})", task.title, task.id))
        .collect::<Vec<_>>()
        .join("\n");
    format!("I found more than one matching task - which one did you mean?\n{options}")
}

/// Not-found reply that also shows the current list, so the user's next
/// attempt has enough context to succeed.
pub fn render_not_found(selector: &str, current_tasks: &[Task]) -> String {
    if current_tasks.is_empty() {
        format!("I couldn't find a task matching {selector}. Your task list is currently empty.")
    } else {
        format!(
            "I couldn't find a task matching {selector}. Here is your current list:\n{}",
            task_block(current_tasks)
        )
    }
}

pub fn render_invalid(detail: &str) -> String {
    format!("I need a bit more detail before I can do that: {detail}.")
}
