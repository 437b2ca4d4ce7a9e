use conclave_core::BaseMessage;

/// Ordered message history of one agent.
/// Bounded memories drop the oldest messages first.
#[derive(Debug, Clone, Default)]
pub struct ConversationMemory {
    messages: Vec<BaseMessage>,
    max_messages: Option<usize>,
}

impl ConversationMemory {
    /// Unbounded memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Memory keeping the newest `max_messages` messages.
    pub fn bounded(max_messages: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_messages: Some(max_messages),
        }
    }

    /// Appends a message, dropping the oldest ones past the bound.
    pub fn push(&mut self, message: BaseMessage) {
        self.messages.push(message);
        self.truncate();
    }

    /// Stored messages, oldest first.
    pub fn messages(&self) -> &[BaseMessage] {
        &self.messages
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    fn truncate(&mut self) {
        if let Some(max) = self.max_messages {
            if self.messages.len() > max {
                let excess = self.messages.len() - max;
                self.messages.drain(..excess);
            }
        }
    }

    /// Rough token estimation (4 chars ≈ 1 token).
    pub fn estimated_tokens(&self) -> usize {
        self.messages.iter().map(|m| m.content.len() / 4).sum()
    }
}
