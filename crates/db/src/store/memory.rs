use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use taskpilot_core::capability::{
    resolve_selector, CapabilityError, CompletedTask, DeletedTask, Resolution, TaskCapability,
    TaskFields, TaskSelector,
};
use taskpilot_core::domain::conversation::{
    Conversation, ConversationId, ConversationSummary, Message, MESSAGE_CEILING,
};
use taskpilot_core::domain::task::{StatusFilter, Task, TaskId, UserId};
use taskpilot_core::errors::StoreError;
use taskpilot_core::store::ConversationStore;

/// In-memory conversation store. The single write lock serializes appends,
/// which is exactly the per-conversation ordering guarantee the contract
/// asks for.
pub struct InMemoryConversationStore {
    ceiling: usize,
    inner: RwLock<HashMap<String, (Conversation, Vec<Message>)>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::with_ceiling(MESSAGE_CEILING)
    }

    pub fn with_ceiling(ceiling: usize) -> Self {
        Self { ceiling, inner: RwLock::new(HashMap::new()) }
    }
}

impl Default for InMemoryConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create(&self, user: &UserId, title: &str) -> Result<Conversation, StoreError> {
        let conversation = Conversation::new(user.clone(), title);
        let mut inner = self.inner.write().await;
        inner.insert(conversation.id.0.clone(), (conversation.clone(), Vec::new()));
        Ok(conversation)
    }

    async fn append(
        &self,
        conversation_id: &ConversationId,
        message: Message,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let (conversation, messages) =
            inner.get_mut(&conversation_id.0).ok_or(StoreError::NotFound)?;
        if messages.len() >= self.ceiling {
            return Err(StoreError::Full);
        }
        messages.push(message);
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn load(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
    ) -> Result<(Conversation, Vec<Message>), StoreError> {
        let inner = self.inner.read().await;
        let (conversation, messages) =
            inner.get(&conversation_id.0).ok_or(StoreError::NotFound)?;
        if &conversation.user_id != user {
            return Err(StoreError::Forbidden);
        }
        Ok((conversation.clone(), messages.clone()))
    }

    async fn load_latest(&self, user: &UserId) -> Result<Option<Conversation>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .values()
            .filter(|(conversation, _)| &conversation.user_id == user)
            .max_by_key(|(conversation, _)| conversation.updated_at)
            .map(|(conversation, _)| conversation.clone()))
    }

    async fn list(&self, user: &UserId) -> Result<Vec<ConversationSummary>, StoreError> {
        let inner = self.inner.read().await;
        let mut summaries: Vec<ConversationSummary> = inner
            .values()
            .filter(|(conversation, _)| &conversation.user_id == user)
            .map(|(conversation, messages)| ConversationSummary {
                id: conversation.id.clone(),
                title: conversation.title.clone(),
                created_at: conversation.created_at,
                updated_at: conversation.updated_at,
                message_count: messages.len(),
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn message_count(&self, conversation_id: &ConversationId) -> Result<usize, StoreError> {
        let inner = self.inner.read().await;
        let (_, messages) = inner.get(&conversation_id.0).ok_or(StoreError::NotFound)?;
        Ok(messages.len())
    }
}

/// In-memory task capability, used by tests and by offline runs where no
/// external task store is wired up.
#[derive(Default)]
pub struct InMemoryTaskCapability {
    next_id: AtomicI64,
    tasks: RwLock<HashMap<String, Vec<Task>>>,
}

impl InMemoryTaskCapability {
    pub fn new() -> Self {
        Self { next_id: AtomicI64::new(1), tasks: RwLock::new(HashMap::new()) }
    }
}

#[async_trait]
impl TaskCapability for InMemoryTaskCapability {
    async fn add(
        &self,
        user: &UserId,
        title: &str,
        description: Option<&str>,
    ) -> Result<Task, CapabilityError> {
        let now = Utc::now();
        let task = Task {
            id: TaskId(self.next_id.fetch_add(1, Ordering::SeqCst).max(1)),
            user_id: user.clone(),
            title: title.to_string(),
            description: description.map(str::to_string),
            completed: false,
            created_at: now,
            updated_at: now,
        };
        let mut tasks = self.tasks.write().await;
        tasks.entry(user.0.clone()).or_default().push(task.clone());
        Ok(task)
    }

    async fn list(
        &self,
        user: &UserId,
        filter: Option<StatusFilter>,
    ) -> Result<Vec<Task>, CapabilityError> {
        let tasks = self.tasks.read().await;
        let mine = tasks.get(&user.0).cloned().unwrap_or_default();
        Ok(match filter {
            Some(filter) => mine.into_iter().filter(|task| filter.matches(task)).collect(),
            None => mine,
        })
    }

    async fn update(
        &self,
        user: &UserId,
        selector: &TaskSelector,
        fields: TaskFields,
    ) -> Result<Task, CapabilityError> {
        let mut tasks = self.tasks.write().await;
        let mine = tasks.entry(user.0.clone()).or_default();
        let id = match resolve_selector(mine, selector) {
            Resolution::One(task) => task.id,
            Resolution::None => {
                return Err(CapabilityError::NotFound { selector: selector.to_string() })
            }
            Resolution::Many(candidates) => {
                return Err(CapabilityError::Ambiguous { candidates })
            }
        };

        let task = mine
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or_else(|| CapabilityError::Internal("resolved task vanished".to_string()))?;
        if let Some(title) = fields.title {
            task.title = title;
        }
        if let Some(description) = fields.description {
            task.description = Some(description);
        }
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn delete(
        &self,
        user: &UserId,
        selector: &TaskSelector,
    ) -> Result<DeletedTask, CapabilityError> {
        let mut tasks = self.tasks.write().await;
        let mine = tasks.entry(user.0.clone()).or_default();
        let id = match resolve_selector(mine, selector) {
            Resolution::One(task) => task.id,
            Resolution::None => {
                return Err(CapabilityError::NotFound { selector: selector.to_string() })
            }
            Resolution::Many(candidates) => {
                return Err(CapabilityError::Ambiguous { candidates })
            }
        };

        let index = mine
            .iter()
            .position(|task| task.id == id)
            .ok_or_else(|| CapabilityError::Internal("resolved task vanished".to_string()))?;
        let removed = mine.remove(index);
        Ok(DeletedTask { title: removed.title, remaining: mine.len() })
    }

    async fn set_completed(
        &self,
        user: &UserId,
        selector: &TaskSelector,
        completed: bool,
    ) -> Result<CompletedTask, CapabilityError> {
        let mut tasks = self.tasks.write().await;
        let mine = tasks.entry(user.0.clone()).or_default();
        let id = match resolve_selector(mine, selector) {
            Resolution::One(task) => task.id,
            Resolution::None => {
                return Err(CapabilityError::NotFound { selector: selector.to_string() })
            }
            Resolution::Many(candidates) => {
                return Err(CapabilityError::Ambiguous { candidates })
            }
        };

        let task = mine
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or_else(|| CapabilityError::Internal("resolved task vanished".to_string()))?;
        task.completed = completed;
        task.updated_at = Utc::now();
        let snapshot = task.clone();
        let remaining_incomplete = mine.iter().filter(|task| !task.completed).count();
        Ok(CompletedTask { task: snapshot, remaining_incomplete })
    }
}

#[cfg(test)]
mod tests {
    use taskpilot_core::capability::{CapabilityError, TaskCapability, TaskSelector};
    use taskpilot_core::domain::conversation::Message;
    use taskpilot_core::domain::task::UserId;
    use taskpilot_core::errors::StoreError;
    use taskpilot_core::store::ConversationStore;

    use super::{InMemoryConversationStore, InMemoryTaskCapability};

    fn user(id: &str) -> UserId {
        UserId(id.to_string())
    }

    #[tokio::test]
    async fn conversation_round_trip() {
        let store = InMemoryConversationStore::new();
        let owner = user("u-1");
        let conversation = store.create(&owner, "Test").await.expect("create");
        store
            .append(&conversation.id, Message::user(conversation.id.clone(), "hello"))
            .await
            .expect("append");

        let (_, messages) = store.load(&conversation.id, &owner).await.expect("load");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");

        assert_eq!(
            store.load(&conversation.id, &user("u-2")).await.unwrap_err(),
            StoreError::Forbidden
        );
    }

    #[tokio::test]
    async fn ceiling_is_enforced() {
        let store = InMemoryConversationStore::with_ceiling(2);
        let owner = user("u-1");
        let conversation = store.create(&owner, "Tiny").await.expect("create");

        for i in 0..2 {
            store
                .append(&conversation.id, Message::user(conversation.id.clone(), format!("m{i}")))
                .await
                .expect("append");
        }
        let overflow =
            store.append(&conversation.id, Message::user(conversation.id.clone(), "m2")).await;
        assert_eq!(overflow.unwrap_err(), StoreError::Full);
    }

    #[tokio::test]
    async fn task_capability_scopes_by_user() {
        let capability = InMemoryTaskCapability::new();
        capability.add(&user("u-1"), "buy milk", None).await.expect("add");

        assert_eq!(capability.list(&user("u-1"), None).await.expect("list").len(), 1);
        assert!(capability.list(&user("u-2"), None).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn ambiguous_match_returns_candidates_in_order() {
        let capability = InMemoryTaskCapability::new();
        let owner = user("u-1");
        capability.add(&owner, "Team meeting", None).await.expect("add");
        capability.add(&owner, "Client meeting", None).await.expect("add");

        let result = capability
            .set_completed(&owner, &TaskSelector::Title("meeting".to_string()), true)
            .await;
        match result {
            Err(CapabilityError::Ambiguous { candidates }) => assert_eq!(candidates.len(), 2),
            other => panic!("expected ambiguous, got {other:?}"),
        }
    }
}
