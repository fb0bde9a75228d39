pub mod conversation;
pub mod task;
