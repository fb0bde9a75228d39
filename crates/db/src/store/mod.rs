pub mod conversation;
pub mod memory;
pub mod task;

pub use conversation::SqlConversationStore;
pub use memory::{InMemoryConversationStore, InMemoryTaskCapability};
pub use task::SqlTaskCapability;
