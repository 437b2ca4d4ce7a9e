use crate::state::{StateStore, WriteCondition};
use conclave_core::{ConclaveError, ConclaveResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const MAX_WRITE_ATTEMPTS: u32 = 5;
/// Upper bound of the random pause before retrying a conflicting write.
const CONFLICT_JITTER_MS: u64 = 50;

/// What an agent advertises to the rest of the team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetadata {
    /// Unique agent name.
    pub name: String,
    /// Role the agent plays (e.g. "Wizard").
    pub role: String,
    /// What the agent is trying to achieve.
    #[serde(default)]
    pub goal: String,
    /// Topic the agent listens on for triggers.
    pub topic_name: String,
    /// Bus the topic lives on.
    pub pubsub_name: String,
    /// Whether this entry belongs to an orchestrator.
    #[serde(default)]
    pub orchestrator: bool,
}

/// Directory of agents, stored as one `name -> metadata` map under a single key.
#[derive(Clone)]
pub struct AgentRegistry {
    store: Arc<dyn StateStore>,
    key: String,
}

impl AgentRegistry {
    /// Registry backed by `store` at `key`.
    pub fn new(store: Arc<dyn StateStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// Key the registry map lives under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Adds or replaces an entry.
    pub async fn register(&self, metadata: AgentMetadata) -> ConclaveResult<()> {
        let name = metadata.name.clone();
        self.update(|agents| {
            agents.insert(metadata.name.clone(), metadata.clone());
        })
        .await?;
        info!(agent = %name, key = %self.key, "Registered agent metadata");
        Ok(())
    }

    /// Removes an entry. Unknown names are ignored.
    pub async fn deregister(&self, name: &str) -> ConclaveResult<()> {
        self.update(|agents| {
            agents.remove(name);
        })
        .await?;
        info!(agent = %name, key = %self.key, "Deregistered agent metadata");
        Ok(())
    }

    /// Every registered entry. Store failures are logged and read as empty.
    pub async fn agents(&self) -> BTreeMap<String, AgentMetadata> {
        match self.read().await {
            Ok((agents, _)) => agents,
            Err(e) => {
                error!(error = %e, key = %self.key, "Failed to retrieve agents metadata");
                BTreeMap::new()
            }
        }
    }

    /// Agents other than `name`, excluding orchestrators.
    pub async fn agents_excluding(&self, name: &str) -> BTreeMap<String, AgentMetadata> {
        self.agents()
            .await
            .into_iter()
            .filter(|(n, meta)| n != name && !meta.orchestrator)
            .collect()
    }

    /// Looks up one agent.
    pub async fn get(&self, name: &str) -> Option<AgentMetadata> {
        self.agents().await.remove(name)
    }

    async fn read(&self) -> ConclaveResult<(BTreeMap<String, AgentMetadata>, Option<String>)> {
        match self.store.get(&self.key).await? {
            Some(item) => {
                let agents = serde_json::from_value(item.value).map_err(|e| {
                    ConclaveError::Registry(format!("corrupt registry under '{}': {e}", self.key))
                })?;
                Ok((agents, Some(item.etag)))
            }
            None => Ok((BTreeMap::new(), None)),
        }
    }

    async fn update<F>(&self, mut mutate: F) -> ConclaveResult<()>
    where
        F: FnMut(&mut BTreeMap<String, AgentMetadata>) + Send,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let (mut agents, etag) = self.read().await?;
            mutate(&mut agents);
            let condition = match &etag {
                Some(tag) => WriteCondition::Etag(tag),
                None => WriteCondition::Missing,
            };
            match self
                .store
                .save(&self.key, serde_json::to_value(&agents)?, condition)
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if e.is_etag_mismatch() => {
                    warn!(attempt, key = %self.key, "Registry write conflict, retrying");
                    let pause = rand::thread_rng().gen_range(0..=CONFLICT_JITTER_MS * u64::from(attempt));
                    tokio::time::sleep(Duration::from_millis(pause)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(ConclaveError::Registry(format!(
            "gave up updating '{}' after {MAX_WRITE_ATTEMPTS} conflicting writes",
            self.key
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::state::{InMemoryStateStore, SqliteStateStore};

    fn meta(name: &str, orchestrator: bool) -> AgentMetadata {
        AgentMetadata {
            name: name.to_string(),
            role: "Role".to_string(),
            goal: String::new(),
            topic_name: name.to_string(),
            pubsub_name: "messagepubsub".to_string(),
            orchestrator,
        }
    }

    fn registry() -> AgentRegistry {
        AgentRegistry::new(
            Arc::new(InMemoryStateStore::new("agentsregistrystore")),
            "agents_registry",
        )
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let reg = registry();
        reg.register(meta("Gandalf", false)).await.unwrap();
        reg.register(meta("Gimli", false)).await.unwrap();

        assert_eq!(reg.agents().await.len(), 2);
        assert_eq!(reg.get("Gimli").await.unwrap().topic_name, "Gimli");
        assert!(reg.get("Sauron").await.is_none());
    }

    #[tokio::test]
    async fn test_excludes_self_and_orchestrators() {
        let reg = registry();
        reg.register(meta("Orchestrator", true)).await.unwrap();
        reg.register(meta("Gandalf", false)).await.unwrap();
        reg.register(meta("Gimli", false)).await.unwrap();

        let others = reg.agents_excluding("Gandalf").await;
        assert_eq!(others.keys().collect::<Vec<_>>(), vec!["Gimli"]);

        let for_orchestrator = reg.agents_excluding("Orchestrator").await;
        assert_eq!(for_orchestrator.len(), 2);
    }

    #[tokio::test]
    async fn test_deregister() {
        let reg = registry();
        reg.register(meta("Frodo", false)).await.unwrap();
        reg.deregister("Frodo").await.unwrap();
        reg.deregister("Frodo").await.unwrap();
        assert!(reg.agents().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_registrations_keep_every_entry() {
        let reg = registry();
        let mut handles = Vec::new();
        for i in 0..4 {
            let reg = reg.clone();
            handles.push(tokio::spawn(async move {
                reg.register(meta(&format!("agent-{i}"), false)).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(reg.agents().await.len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_registrations_from_separate_stores_keep_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut handles = Vec::new();
        for i in 0..8 {
            // One store per registrant, as separate processes would open
            let store = SqliteStateStore::new(dir.path(), "agentsregistrystore")
                .await
                .unwrap();
            let reg = AgentRegistry::new(Arc::new(store), "agents_registry");
            let name = format!("agent-{i}");
            handles.push(tokio::spawn(async move {
                reg.register(meta(&name, false)).await.map(|()| name)
            }));
        }
        let mut registered = Vec::new();
        for h in handles {
            if let Ok(name) = h.await.unwrap() {
                registered.push(name);
            }
        }

        let store = SqliteStateStore::new(dir.path(), "agentsregistrystore")
            .await
            .unwrap();
        let held = AgentRegistry::new(Arc::new(store), "agents_registry")
            .agents()
            .await;
        assert!(!registered.is_empty());
        for name in &registered {
            assert!(held.contains_key(name), "{name} was acknowledged but lost");
        }
        assert_eq!(held.len(), registered.len());
    }

    #[tokio::test]
    async fn test_corrupt_registry_reads_empty() {
        let store = Arc::new(InMemoryStateStore::new("s"));
        store
            .save("agents_registry", serde_json::json!([1, 2]), WriteCondition::Any)
            .await
            .unwrap();
        let reg = AgentRegistry::new(store, "agents_registry");
        assert!(reg.agents().await.is_empty());
        assert!(reg.register(meta("x", false)).await.is_err());
    }
}
