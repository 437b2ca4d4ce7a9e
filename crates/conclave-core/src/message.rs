use serde::{Deserialize, Serialize};

/// The role of the participant that authored a [`BaseMessage`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// A human end-user or the orchestrator speaking on its behalf.
    User,
    /// An agent's reply.
    Assistant,
    /// A system-level instruction.
    System,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// A single chat message, optionally attributed to a named speaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseMessage {
    /// The role of the message author.
    pub role: MessageRole,
    /// The textual content of the message.
    pub content: String,
    /// Name of the speaker (agent or orchestrator), if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl BaseMessage {
    /// Creates a new message with the given role and content.
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }

    /// Creates a new message with [`MessageRole::User`].
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Creates a new message with [`MessageRole::Assistant`].
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Creates a new message with [`MessageRole::System`].
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Attributes the message to a speaker.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A response message from an agent after completing a task.
///
/// Same shape as [`BaseMessage`] but travels under its own event type so
/// orchestrators can subscribe to results without also receiving chatter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTaskResponse {
    /// Always [`MessageRole::Assistant`] for responses built with [`AgentTaskResponse::new`].
    pub role: MessageRole,
    /// The agent's answer.
    pub content: String,
    /// The responding agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl AgentTaskResponse {
    /// Builds a response attributed to `agent`.
    pub fn new(agent: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            name: Some(agent.into()),
        }
    }
}

impl From<AgentTaskResponse> for BaseMessage {
    fn from(resp: AgentTaskResponse) -> Self {
        Self {
            role: resp.role,
            content: resp.content,
            name: resp.name,
        }
    }
}

/// A message used to trigger an agent's activity within a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TriggerAction {
    /// The specific task to execute. When absent the agent acts on its memory.
    #[serde(default)]
    pub task: Option<String>,
    /// The current iteration of the workflow loop.
    #[serde(default)]
    pub iteration: u32,
    /// The workflow instance the trigger belongs to, echoed back on the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_instance_id: Option<String>,
}

impl TriggerAction {
    /// A trigger carrying an explicit task.
    pub fn with_task(task: impl Into<String>, iteration: u32) -> Self {
        Self {
            task: Some(task.into()),
            iteration,
            workflow_instance_id: None,
        }
    }

    /// Ties the trigger to a workflow instance.
    pub fn for_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.workflow_instance_id = Some(instance_id.into());
        self
    }
}
