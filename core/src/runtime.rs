//! `AgentRuntime`: the facade exposed to an agent integrator (§6 "Surface
//! exposed to agent integrator"). Wires every component together and owns
//! the per-session serialization lock and the executor's lifecycle.
//!
//! Grounded in the teacher's `agent::session::session::Session` as the
//! per-session owner of conversation state, generalized to hold a keyed
//! lock per session instead of a single in-process session object.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::agent_state::{AgentSessionState, RoutingDecision};
use crate::approval::ApprovalManager;
use crate::config::RuntimeConfig;
use crate::contracts::{Classifier, LlmClient, LlmMessage, LlmOptions, ToolBody, TriggerDetector};
use crate::error::CoreResult;
use crate::executor::ScheduleExecutor;
use crate::model::{InteractionType, Message, MessageRole, SessionId};
use crate::orchestrator::Orchestrator;
use crate::persistence::PersistenceStore;
use crate::registry::ToolRegistry;
use crate::schedule_manager::ScheduleManager;
use crate::tool_state::ToolStateManager;

pub struct AgentRuntime {
    store: Arc<dyn PersistenceStore>,
    orchestrator: Arc<Orchestrator>,
    executor: Arc<ScheduleExecutor>,
    llm: Arc<dyn LlmClient>,
    trigger_detector: Arc<dyn TriggerDetector>,
    classifier: Arc<dyn Classifier>,
    config: RuntimeConfig,
    sessions: Mutex<HashMap<SessionId, AgentSessionState>>,
    session_locks: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
}

impl AgentRuntime {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        mut registry: ToolRegistry,
        tools: Vec<Arc<dyn ToolBody>>,
        llm: Arc<dyn LlmClient>,
        trigger_detector: Arc<dyn TriggerDetector>,
        classifier: Arc<dyn Classifier>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        for tool in tools {
            registry.register(tool);
        }
        let registry = Arc::new(registry);
        let tool_state = Arc::new(ToolStateManager::new(store.clone()));
        let approval_manager = Arc::new(ApprovalManager::new(store.clone()));
        let schedule_manager = Arc::new(ScheduleManager::new(store.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            registry.clone(),
            tool_state.clone(),
            approval_manager.clone(),
            schedule_manager.clone(),
            config.clone(),
        ));
        let executor = ScheduleExecutor::new(
            store.clone(),
            registry.clone(),
            tool_state.clone(),
            schedule_manager.clone(),
            config.clone(),
        );

        Arc::new(Self {
            store,
            orchestrator,
            executor,
            llm,
            trigger_detector,
            classifier,
            config,
            sessions: Mutex::new(HashMap::new()),
            session_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Starts the background schedule executor. Call once after construction.
    pub async fn start(self: &Arc<Self>) {
        self.executor.start().await;
        info!("agent runtime started");
    }

    pub async fn start_new_session(&self, session_id: SessionId) -> CoreResult<String> {
        self.sessions.lock().await.insert(session_id, AgentSessionState::default());
        let welcome = "Hi! What would you like to do?".to_string();
        self.store
            .insert_message(Message::new(session_id, MessageRole::System, &welcome, InteractionType::SystemNotice))
            .await?;
        Ok(welcome)
    }

    pub async fn get_history(&self, session_id: SessionId) -> CoreResult<Vec<Message>> {
        self.store.list_session_messages(session_id, usize::MAX).await
    }

    /// Processes one inbound message end to end: logs it, routes it
    /// through the Agent State Manager, dispatches to the Orchestrator or
    /// answers with a plain LLM reply, and returns the text to show the
    /// user.
    pub async fn get_response(
        &self,
        session_id: SessionId,
        message: &str,
        role: MessageRole,
        interaction_type: InteractionType,
    ) -> CoreResult<String> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        self.store
            .insert_message(Message::new(session_id, role, message, interaction_type))
            .await?;

        let mut sessions = self.sessions.lock().await;
        let session_state = sessions.entry(session_id).or_default();
        let decision = session_state.route(message, self.trigger_detector.as_ref());

        let response = match decision {
            RoutingDecision::NormalReply => {
                let history = self.store.list_session_messages(session_id, 20).await?;
                self.plain_reply(&history).await?
            }
            RoutingDecision::Dispatch { tool_type } => {
                drop(sessions);
                let envelope = self
                    .orchestrator
                    .handle_message(session_id, &tool_type, message, self.classifier.as_ref())
                    .await?;
                let mut sessions = self.sessions.lock().await;
                if let Some(state) = sessions.get_mut(&session_id) {
                    state.apply_outcome(envelope.status.to_agent_status());
                }
                envelope.response
            }
        };

        self.store
            .insert_message(Message::new(session_id, MessageRole::Assistant, &response, InteractionType::Chat))
            .await?;
        Ok(response)
    }

    /// Tears down the executor. In-process caches drop with the runtime
    /// `Arc`; no upstream client owns resources this crate must release.
    pub async fn cleanup(&self) {
        self.executor.stop().await;
    }

    async fn session_lock(&self, session_id: SessionId) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks.entry(session_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    async fn plain_reply(&self, history: &[Message]) -> CoreResult<String> {
        let messages: Vec<LlmMessage> = history
            .iter()
            .map(|m| LlmMessage {
                role: format!("{:?}", m.role).to_lowercase(),
                content: m.content.clone(),
            })
            .collect();
        match self
            .llm
            .complete(&messages, &self.config.llm_default_model, LlmOptions::default())
            .await
        {
            Ok(text) => Ok(text),
            Err(_) => Ok("Sorry, I couldn't come up with a reply just now.".to_string()),
        }
    }
}
