use crate::llm::LlmClient;
use crate::memory::ConversationMemory;
use conclave_core::{BaseMessage, ConclaveError, ConclaveResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Persona of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique name; also the topic the agent listens on by default.
    pub name: String,
    /// Role in the team, e.g. "Hobbit".
    #[serde(default = "default_role")]
    pub role: String,
    /// What the agent is trying to achieve.
    #[serde(default)]
    pub goal: String,
    /// Extra rules, rendered as a numbered list in the system prompt.
    #[serde(default)]
    pub instructions: Vec<String>,
    /// Maximum number of remembered messages. Unbounded when absent.
    #[serde(default)]
    pub max_memory: Option<usize>,
}

fn default_role() -> String {
    "Assistant".to_string()
}

impl AgentConfig {
    /// Persona with only a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: default_role(),
            goal: String::new(),
            instructions: Vec::new(),
            max_memory: None,
        }
    }

    /// Sets the role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Sets the goal.
    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = goal.into();
        self
    }

    /// Appends one instruction.
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instructions.push(instruction.into());
        self
    }
}

/// An LLM-backed participant with its own conversation memory.
///
/// The memory lock is never held across an LLM call, so an agent can be
/// shared behind an `Arc` between its task loop and its HTTP handlers.
pub struct Agent {
    config: AgentConfig,
    llm: LlmClient,
    memory: Mutex<ConversationMemory>,
}

impl Agent {
    /// Creates an agent with empty memory, bounded when `max_memory` is set.
    pub fn new(config: AgentConfig, llm: LlmClient) -> Self {
        let memory = match config.max_memory {
            Some(max) => ConversationMemory::bounded(max),
            None => ConversationMemory::new(),
        };
        Self {
            config,
            llm,
            memory: Mutex::new(memory),
        }
    }

    /// Agent name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Agent role.
    pub fn role(&self) -> &str {
        &self.config.role
    }

    /// Agent goal.
    pub fn goal(&self) -> &str {
        &self.config.goal
    }

    /// Persona the agent was built from.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Renders the persona sent as the system prompt of every call.
    pub fn system_prompt(&self) -> String {
        let mut prompt = format!(
            "# Name\nYour name is {}.\n\n# Role\n{}\n",
            self.config.name, self.config.role
        );
        if !self.config.goal.is_empty() {
            prompt.push_str(&format!("\n# Goal\n{}\n", self.config.goal));
        }
        if !self.config.instructions.is_empty() {
            prompt.push_str("\n# Instructions\n");
            for (i, instruction) in self.config.instructions.iter().enumerate() {
                prompt.push_str(&format!("{}. {instruction}\n", i + 1));
            }
        }
        prompt
    }

    /// Answers `task`, or continues the conversation in memory when no task
    /// is given. The reply is stored in memory and returned.
    pub async fn run(&self, task: Option<&str>) -> ConclaveResult<String> {
        let context = {
            let mut memory = self.memory.lock();
            if let Some(task) = task {
                memory.push(BaseMessage::user(task));
            }
            if memory.is_empty() {
                return Err(ConclaveError::Agent(format!(
                    "{} has no task and no conversation to act on",
                    self.config.name
                )));
            }
            memory.messages().to_vec()
        };

        info!(agent = %self.config.name, context = context.len(), "Running task");
        let system = self.system_prompt();
        let response = self.llm.chat(Some(&system), &context).await?;
        debug!(
            agent = %self.config.name,
            tokens = response.tokens_used,
            "Task completed"
        );

        self.memory.lock().push(
            BaseMessage::assistant(response.content.clone()).with_name(&self.config.name),
        );
        Ok(response.content)
    }

    /// Stores a message in memory without calling the model.
    pub fn add_message(&self, message: BaseMessage) {
        self.memory.lock().push(message);
    }

    /// Copy of the memory, oldest first.
    pub fn messages(&self) -> Vec<BaseMessage> {
        self.memory.lock().messages().to_vec()
    }

    /// Forgets every message.
    pub fn reset_memory(&self) {
        self.memory.lock().clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backends::ScriptedBackend;
    use std::sync::Arc;

    fn frodo() -> AgentConfig {
        AgentConfig::new("Frodo")
            .with_role("Hobbit")
            .with_goal("Carry the ring to Mordor")
            .with_instruction("Speak briefly")
            .with_instruction("Never put on the ring")
    }

    #[test]
    fn test_system_prompt_renders_persona() {
        let agent = Agent::new(
            frodo(),
            LlmClient::from_backend(Box::new(ScriptedBackend::new(Vec::<String>::new()))),
        );
        let prompt = agent.system_prompt();
        assert!(prompt.contains("Your name is Frodo."));
        assert!(prompt.contains("# Role\nHobbit"));
        assert!(prompt.contains("# Goal\nCarry the ring to Mordor"));
        assert!(prompt.contains("2. Never put on the ring"));
    }

    #[tokio::test]
    async fn test_run_stores_task_and_reply() {
        let backend = Arc::new(ScriptedBackend::new(["We go east."]));
        let agent = Agent::new(frodo(), LlmClient::from_backend(Box::new(backend.clone())));

        let reply = agent.run(Some("Which way?")).await.unwrap();
        assert_eq!(reply, "We go east.");

        let memory = agent.messages();
        assert_eq!(memory.len(), 2);
        assert_eq!(memory[1].name.as_deref(), Some("Frodo"));

        let call = &backend.calls()[0];
        assert!(call.system_prompt.as_deref().unwrap().contains("Frodo"));
        assert_eq!(call.messages[0].content, "Which way?");
    }

    #[tokio::test]
    async fn test_run_without_task_uses_memory() {
        let agent = Agent::new(
            frodo(),
            LlmClient::from_backend(Box::new(ScriptedBackend::new(["Onward."]))),
        );
        assert!(agent.run(None).await.is_err());

        agent.add_message(BaseMessage::user("Sam says hello").with_name("Sam"));
        assert_eq!(agent.run(None).await.unwrap(), "Onward.");

        agent.reset_memory();
        assert!(agent.messages().is_empty());
    }
}
