use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use taskpilot_core::capability::{
    resolve_selector, CapabilityError, CompletedTask, DeletedTask, Resolution, TaskCapability,
    TaskFields, TaskSelector,
};
use taskpilot_core::domain::task::{StatusFilter, Task, TaskId, UserId};

use crate::DbPool;

/// SQLite adapter for the consumed task capability. Deliberately thin: the
/// orchestrator only sees the trait, and every query is scoped by user id.
pub struct SqlTaskCapability {
    pool: DbPool,
}

impl SqlTaskCapability {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn all_for_user(&self, user: &UserId) -> Result<Vec<Task>, CapabilityError> {
        let rows = sqlx::query(
            "SELECT id, user_id, title, description, completed, created_at, updated_at
             FROM task WHERE user_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(&user.0)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;

        rows.iter().map(row_to_task).collect()
    }

    async fn resolve(
        &self,
        user: &UserId,
        selector: &TaskSelector,
    ) -> Result<Task, CapabilityError> {
        let tasks = self.all_for_user(user).await?;
        match resolve_selector(&tasks, selector) {
            Resolution::One(task) => Ok(task),
            Resolution::None => {
                Err(CapabilityError::NotFound { selector: selector.to_string() })
            }
            Resolution::Many(candidates) => Err(CapabilityError::Ambiguous { candidates }),
        }
    }
}

fn internal(error: sqlx::Error) -> CapabilityError {
    CapabilityError::Internal(error.to_string())
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<Task, CapabilityError> {
    let id: i64 = row.try_get("id").map_err(internal)?;
    let user_id: String = row.try_get("user_id").map_err(internal)?;
    let title: String = row.try_get("title").map_err(internal)?;
    let description: Option<String> = row.try_get("description").map_err(internal)?;
    let completed: i64 = row.try_get("completed").map_err(internal)?;
    let created_at: String = row.try_get("created_at").map_err(internal)?;
    let updated_at: String = row.try_get("updated_at").map_err(internal)?;

    Ok(Task {
        id: TaskId(id),
        user_id: UserId(user_id),
        title,
        description,
        completed: completed != 0,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

#[async_trait]
impl TaskCapability for SqlTaskCapability {
    async fn add(
        &self,
        user: &UserId,
        title: &str,
        description: Option<&str>,
    ) -> Result<Task, CapabilityError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO task (user_id, title, description, completed, created_at, updated_at)
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(&user.0)
        .bind(title)
        .bind(description)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        Ok(Task {
            id: TaskId(result.last_insert_rowid()),
            user_id: user.clone(),
            title: title.to_string(),
            description: description.map(str::to_string),
            completed: false,
            created_at: now,
            updated_at: now,
        })
    }

    async fn list(
        &self,
        user: &UserId,
        filter: Option<StatusFilter>,
    ) -> Result<Vec<Task>, CapabilityError> {
        let tasks = self.all_for_user(user).await?;
        Ok(match filter {
            Some(filter) => tasks.into_iter().filter(|task| filter.matches(task)).collect(),
            None => tasks,
        })
    }

    async fn update(
        &self,
        user: &UserId,
        selector: &TaskSelector,
        fields: TaskFields,
    ) -> Result<Task, CapabilityError> {
        let mut task = self.resolve(user, selector).await?;
        if let Some(title) = fields.title {
            task.title = title;
        }
        if let Some(description) = fields.description {
            task.description = Some(description);
        }
        task.updated_at = Utc::now();

        sqlx::query(
            "UPDATE task SET title = ?, description = ?, updated_at = ?
             WHERE id = ? AND user_id = ?",
        )
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.updated_at.to_rfc3339())
        .bind(task.id.0)
        .bind(&user.0)
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        Ok(task)
    }

    async fn delete(
        &self,
        user: &UserId,
        selector: &TaskSelector,
    ) -> Result<DeletedTask, CapabilityError> {
        let task = self.resolve(user, selector).await?;

        sqlx::query("DELETE FROM task WHERE id = ? AND user_id = ?")
            .bind(task.id.0)
            .bind(&user.0)
            .execute(&self.pool)
            .await
            .map_err(internal)?;

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task WHERE user_id = ?")
            .bind(&user.0)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)?;

        Ok(DeletedTask { title: task.title, remaining: remaining as usize })
    }

    async fn set_completed(
        &self,
        user: &UserId,
        selector: &TaskSelector,
        completed: bool,
    ) -> Result<CompletedTask, CapabilityError> {
        let mut task = self.resolve(user, selector).await?;
        task.completed = completed;
        task.updated_at = Utc::now();

        sqlx::query("UPDATE task SET completed = ?, updated_at = ? WHERE id = ? AND user_id = ?")
            .bind(task.completed as i64)
            .bind(task.updated_at.to_rfc3339())
            .bind(task.id.0)
            .bind(&user.0)
            .execute(&self.pool)
            .await
            .map_err(internal)?;

        let remaining_incomplete: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM task WHERE user_id = ? AND completed = 0",
        )
        .bind(&user.0)
        .fetch_one(&self.pool)
        .await
        .map_err(internal)?;

        Ok(CompletedTask { task, remaining_incomplete: remaining_incomplete as usize })
    }
}

#[cfg(test)]
mod tests {
    use taskpilot_core::capability::{CapabilityError, TaskCapability, TaskFields, TaskSelector};
    use taskpilot_core::domain::task::{StatusFilter, UserId};

    use super::SqlTaskCapability;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> SqlTaskCapability {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlTaskCapability::new(pool)
    }

    fn user(id: &str) -> UserId {
        UserId(id.to_string())
    }

    #[tokio::test]
    async fn added_task_is_listed_for_owner_only() {
        let capability = setup().await;
        let owner = user("u-1");
        let other = user("u-2");

        let task = capability.add(&owner, "buy milk", None).await.expect("add");
        assert!(!task.completed);

        let mine = capability.list(&owner, None).await.expect("list");
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].title, "buy milk");

        let theirs = capability.list(&other, None).await.expect("list other");
        assert!(theirs.is_empty());
    }

    #[tokio::test]
    async fn status_filter_narrows_listing() {
        let capability = setup().await;
        let owner = user("u-1");
        capability.add(&owner, "buy milk", None).await.expect("add");
        let done = capability.add(&owner, "call dentist", None).await.expect("add");
        capability
            .set_completed(&owner, &TaskSelector::Id(done.id.0), true)
            .await
            .expect("complete");

        let open = capability.list(&owner, Some(StatusFilter::Incomplete)).await.expect("open");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].title, "buy milk");

        let completed =
            capability.list(&owner, Some(StatusFilter::Completed)).await.expect("completed");
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].title, "call dentist");
    }

    #[tokio::test]
    async fn ambiguous_title_lists_every_candidate() {
        let capability = setup().await;
        let owner = user("u-1");
        capability.add(&owner, "Team meeting", None).await.expect("add");
        capability.add(&owner, "Client meeting", None).await.expect("add");

        let result = capability
            .delete(&owner, &TaskSelector::Title("meeting".to_string()))
            .await;
        match result {
            Err(CapabilityError::Ambiguous { candidates }) => {
                let titles: Vec<&str> = candidates.iter().map(|t| t.title.as_str()).collect();
                assert_eq!(titles, vec!["Team meeting", "Client meeting"]);
            }
            other => panic!("expected ambiguous, got {other:?}"),
        }

        // Nothing was deleted.
        assert_eq!(capability.list(&owner, None).await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let capability = setup().await;
        let owner = user("u-1");
        let result = capability.set_completed(&owner, &TaskSelector::Id(999), true).await;
        assert!(matches!(result, Err(CapabilityError::NotFound { .. })));
    }

    #[tokio::test]
    async fn update_rewrites_title_and_description() {
        let capability = setup().await;
        let owner = user("u-1");
        capability.add(&owner, "buy milk", None).await.expect("add");

        let updated = capability
            .update(
                &owner,
                &TaskSelector::Title("milk".to_string()),
                TaskFields {
                    title: Some("buy oat milk".to_string()),
                    description: Some("the barista kind".to_string()),
                },
            )
            .await
            .expect("update");
        assert_eq!(updated.title, "buy oat milk");
        assert_eq!(updated.description.as_deref(), Some("the barista kind"));
    }

    #[tokio::test]
    async fn delete_reports_prior_title_and_remaining_count() {
        let capability = setup().await;
        let owner = user("u-1");
        capability.add(&owner, "buy milk", None).await.expect("add");
        capability.add(&owner, "call dentist", None).await.expect("add");

        let deleted = capability
            .delete(&owner, &TaskSelector::Title("dentist".to_string()))
            .await
            .expect("delete");
        assert_eq!(deleted.title, "call dentist");
        assert_eq!(deleted.remaining, 1);
    }

    #[tokio::test]
    async fn completion_reports_remaining_incomplete() {
        let capability = setup().await;
        let owner = user("u-1");
        capability.add(&owner, "buy milk", None).await.expect("add");
        capability.add(&owner, "call dentist", None).await.expect("add");

        let completed = capability
            .set_completed(&owner, &TaskSelector::Title("milk".to_string()), true)
            .await
            .expect("complete");
        assert!(completed.task.completed);
        assert_eq!(completed.remaining_incomplete, 1);
    }
}
