//! The conversation store the compactor reads from and replaces.

use crate::Message;
use std::sync::Mutex;

/// Owner of the conversation's message list.
///
/// The host agent and the compactor are the only writers, and the compactor
/// only ever replaces the whole list.
pub trait ConversationStore: Send + Sync {
    fn messages(&self) -> Vec<Message>;

    fn set_messages(&self, messages: Vec<Message>);

    fn message_count(&self) -> usize {
        self.messages().len()
    }
}

/// A [`ConversationStore`] held in memory.
#[derive(Debug, Default)]
pub struct InMemoryConversation {
    messages: Mutex<Vec<Message>>,
}

impl InMemoryConversation {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages: Mutex::new(messages),
        }
    }

    /// Append one message, as the host does after each turn.
    pub fn push(&self, message: Message) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }
}

impl ConversationStore for InMemoryConversation {
    fn messages(&self) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_messages(&self, messages: Vec<Message>) {
        *self.messages.lock().unwrap_or_else(|e| e.into_inner()) = messages;
    }

    fn message_count(&self) -> usize {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
