//! The session coordinator.
//!
//! Owns a set of agents sharing one tool executor: the coordinator agent
//! (thread id equal to the session id) plus any delegate agents spawned
//! under it. Persists the session record, wires the `delegate` tool, and
//! routes messages and stop requests by agent id.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use weft_domain::{
    CancelMap, CancelToken, Error, EventPayload, Result, Session, SessionStatus, Thread,
    ThreadEvent, ThreadId, ThreadMetadata,
};
use weft_providers::{Provider, ProviderRegistry};
use weft_store::{EventStore, ThreadManager};
use weft_tools::{ApprovalGate, Tool, ToolExecutor};

use crate::agent::{Agent, AgentShared};
use crate::delegate::DelegateTool;
use crate::turn::{TurnConfig, TurnOutcome};

pub struct SessionCoordinator {
    store: Arc<EventStore>,
    threads: Arc<ThreadManager>,
    provider: Arc<dyn Provider>,
    executor: Arc<ToolExecutor>,
    gate: Arc<dyn ApprovalGate>,
    model: String,
    config: TurnConfig,
    session_id: String,
    agents: RwLock<HashMap<ThreadId, Arc<Agent>>>,
    cancel_map: CancelMap,
}

impl SessionCoordinator {
    /// Create a session resolving the provider through the registry.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        store: Arc<EventStore>,
        threads: Arc<ThreadManager>,
        registry: &ProviderRegistry,
        name: &str,
        provider_instance: &str,
        model: Option<&str>,
        project_id: Option<String>,
        gate: Arc<dyn ApprovalGate>,
        config: TurnConfig,
        tools: Vec<Arc<dyn Tool>>,
    ) -> Result<Arc<Self>> {
        let (provider, model) = registry.create_provider(provider_instance, model)?;
        let configuration = serde_json::json!({
            "providerInstance": provider_instance,
            "model": model,
        });
        Self::build(
            store,
            threads,
            provider,
            model,
            name,
            project_id,
            configuration,
            gate,
            config,
            tools,
        )
    }

    /// Create a session with an already-constructed provider handle.
    #[allow(clippy::too_many_arguments)]
    pub fn with_provider(
        store: Arc<EventStore>,
        threads: Arc<ThreadManager>,
        provider: Arc<dyn Provider>,
        model: &str,
        name: &str,
        gate: Arc<dyn ApprovalGate>,
        config: TurnConfig,
        tools: Vec<Arc<dyn Tool>>,
    ) -> Result<Arc<Self>> {
        let configuration = serde_json::json!({"model": model});
        Self::build(
            store,
            threads,
            provider,
            model.to_owned(),
            name,
            None,
            configuration,
            gate,
            config,
            tools,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        store: Arc<EventStore>,
        threads: Arc<ThreadManager>,
        provider: Arc<dyn Provider>,
        model: String,
        name: &str,
        project_id: Option<String>,
        configuration: serde_json::Value,
        gate: Arc<dyn ApprovalGate>,
        config: TurnConfig,
        tools: Vec<Arc<dyn Tool>>,
    ) -> Result<Arc<Self>> {
        let session_id = format!("s-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let now = Utc::now();

        store.create_session(&Session {
            id: session_id.clone(),
            project_id,
            name: name.to_owned(),
            configuration,
            status: SessionStatus::Active,
            input_tokens: 0,
            output_tokens: 0,
            created_at: now,
            updated_at: now,
        })?;

        // The coordinator agent's thread id is the session id.
        let coordinator_id = ThreadId::new(session_id.clone());
        store.create_thread(&Thread {
            id: coordinator_id.clone(),
            parent_id: None,
            created_at: now,
            metadata: ThreadMetadata {
                name: Some(name.to_owned()),
                is_session: true,
                is_agent: true,
                ..Default::default()
            },
            is_shadow: false,
        })?;

        // The prompt in effect is recorded for the log; replay skips it.
        if let Some(system) = &config.system_prompt {
            store.append(ThreadEvent::new(
                coordinator_id.clone(),
                EventPayload::SystemPrompt {
                    text: system.clone(),
                },
            ))?;
        }

        // Shared executor: built-in delegate tool plus the caller's set.
        let executor = Arc::new(ToolExecutor::new());
        for tool in tools {
            executor.register(tool)?;
        }
        executor.register(Arc::new(DelegateTool::new(
            store.clone(),
            threads.clone(),
            provider.clone(),
            Arc::downgrade(&executor),
            gate.clone(),
            model.clone(),
            config.clone(),
        )))?;

        let coordinator = Agent::new(AgentShared {
            store: store.clone(),
            threads: threads.clone(),
            provider: provider.clone(),
            executor: executor.clone(),
            gate: gate.clone(),
            model: model.clone(),
            config: config.clone(),
            thread_id: coordinator_id.clone(),
        });

        let mut agents = HashMap::new();
        agents.insert(coordinator_id, coordinator);

        tracing::info!(session = %session_id, name, "session created");

        Ok(Arc::new(Self {
            store,
            threads,
            provider,
            executor,
            gate,
            model,
            config,
            session_id,
            agents: RwLock::new(agents),
            cancel_map: CancelMap::new(),
        }))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn coordinator_id(&self) -> ThreadId {
        ThreadId::new(self.session_id.clone())
    }

    /// The persisted session record.
    pub fn session(&self) -> Result<Session> {
        self.store
            .get_session(&self.session_id)?
            .ok_or_else(|| Error::config_bare(format!("session '{}' not found", self.session_id)))
    }

    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.executor
    }

    pub fn agent(&self, id: &ThreadId) -> Option<Arc<Agent>> {
        self.agents.read().get(id).cloned()
    }

    pub fn list_agents(&self) -> Vec<ThreadId> {
        let mut ids: Vec<ThreadId> = self.agents.read().keys().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    /// Allocate a child thread and construct a new agent sharing the
    /// session's executor and provider.
    pub fn spawn_agent(&self, name: &str) -> Result<ThreadId> {
        let child_id = self
            .threads
            .next_delegate_id(&self.coordinator_id(), Some(name))?;
        let agent = Agent::new(AgentShared {
            store: self.store.clone(),
            threads: self.threads.clone(),
            provider: self.provider.clone(),
            executor: self.executor.clone(),
            gate: self.gate.clone(),
            model: self.model.clone(),
            config: self.config.clone(),
            thread_id: child_id.clone(),
        });
        self.agents.write().insert(child_id.clone(), agent);
        tracing::info!(session = %self.session_id, agent = %child_id, name, "agent spawned");
        Ok(child_id)
    }

    /// Route a message to the named agent and run its turn.
    pub async fn send_message(
        &self,
        agent_id: &ThreadId,
        text: impl Into<String>,
        cancel: CancelToken,
    ) -> Result<TurnOutcome> {
        let agent = self
            .agent(agent_id)
            .ok_or_else(|| Error::config_bare(format!("agent '{agent_id}' not found")))?;

        // Track the token so stop_agent / destroy can fire it, and
        // cascade session-wide cancellation to this turn.
        let key = agent_id.to_string();
        self.cancel_map.insert(&key, cancel.clone());
        self.cancel_map.add_to_group(&self.session_id, &key);

        let result = agent.send_message(text, &cancel).await;

        self.cancel_map.remove(&key);
        self.cancel_map.remove_from_group(&self.session_id, &key);
        let bookkeeping = match &result {
            Ok(outcome) => self.store.record_session_usage(
                &self.session_id,
                outcome.usage.prompt_tokens as u64,
                outcome.usage.completion_tokens as u64,
            ),
            Err(_) => self.store.touch_session(&self.session_id),
        };
        if let Err(e) = bookkeeping {
            tracing::warn!(session = %self.session_id, error = %e, "session bookkeeping failed");
        }
        result
    }

    /// Re-enable a stopped agent. Idempotent.
    pub fn start_agent(&self, agent_id: &ThreadId) -> Result<()> {
        let agent = self
            .agent(agent_id)
            .ok_or_else(|| Error::config_bare(format!("agent '{agent_id}' not found")))?;
        agent.set_active(true);
        Ok(())
    }

    /// Stop an agent: cancel its running turn (if any) and refuse new
    /// messages. Idempotent; returns whether a turn was interrupted.
    pub fn stop_agent(&self, agent_id: &ThreadId) -> bool {
        if let Some(agent) = self.agent(agent_id) {
            agent.set_active(false);
        }
        self.cancel_map.cancel(&agent_id.to_string())
    }

    /// Stop all delegate agents, then the coordinator, and archive the
    /// session.
    pub fn destroy(&self) -> Result<()> {
        let coordinator_id = self.coordinator_id();
        let ids = self.list_agents();
        for id in ids.iter().filter(|id| **id != coordinator_id) {
            self.stop_agent(id);
        }
        self.stop_agent(&coordinator_id);
        self.agents.write().clear();
        self.store.archive_session(&self.session_id)?;
        tracing::info!(session = %self.session_id, "session destroyed");
        Ok(())
    }
}
