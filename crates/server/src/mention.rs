use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use mentionbot_agent::{
    builtin_registry, prompt::agent_instructions, Agent, AgentOutput, AgentSettings, LlmClient,
    SessionCache, ToolRegistry, ToolServerConnector, ToolServerGroup,
};
use mentionbot_core::{
    config::{AgentConfig, AppConfig, ToolServerConfig},
    ApplicationError, DataStore, ReplyMode,
};
use mentionbot_slack::{
    normalize_mention, EventContext, EventHandlerError, MentionEvent, MentionService,
};
use tracing::info;

pub const ACK_REPLY: &str = "--- done ---";

/// Runs the thread's agent for each mention, with tool servers opened for
/// the duration of the run.
pub struct AgentMentionService {
    tool_servers: BTreeMap<String, ToolServerConfig>,
    default_timeout: Duration,
    agent: AgentConfig,
    bot_user_id: String,
    model: String,
    store: Arc<dyn DataStore>,
    tools: Arc<ToolRegistry>,
    llm: Arc<dyn LlmClient>,
    connector: Arc<dyn ToolServerConnector>,
    sessions: SessionCache<Agent>,
}

impl AgentMentionService {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn DataStore>,
        llm: Arc<dyn LlmClient>,
        connector: Arc<dyn ToolServerConnector>,
    ) -> Self {
        let tools = builtin_registry(Arc::clone(&store), &config.logging);
        Self {
            tool_servers: config.tool_servers.clone(),
            default_timeout: Duration::from_secs(config.agent.tool_server_timeout_secs),
            agent: config.agent.clone(),
            bot_user_id: config.slack.admin_user_id.clone(),
            model: config.llm.model.clone(),
            store,
            tools: Arc::new(tools),
            llm,
            connector,
            sessions: SessionCache::new(config.sessions.capacity, config.sessions.ttl()),
        }
    }

    async fn respond(
        &self,
        event: &MentionEvent,
        thread_key: &str,
    ) -> Result<Option<String>, ApplicationError> {
        let servers =
            ToolServerGroup::open(self.connector.as_ref(), &self.tool_servers, self.default_timeout)
                .await
                .map_err(|error| ApplicationError::Integration(error.to_string()))?;

        let outcome = self.run_agent(event, thread_key, &servers).await;
        servers.close().await;

        let output = outcome?;
        Ok(reply_text(self.agent.reply_mode, &output.final_text))
    }

    async fn run_agent(
        &self,
        event: &MentionEvent,
        thread_key: &str,
        servers: &ToolServerGroup,
    ) -> Result<AgentOutput, ApplicationError> {
        let (agent, created) = self.sessions.get_or_create(thread_key, || self.build_agent()).await;
        if created {
            info!(
                event_name = "agent.session.created",
                thread_id = thread_key,
                "created agent for thread"
            );
        }

        let mut agent = agent.lock().await;
        agent
            .run(&normalize_mention(event), servers)
            .await
            .map_err(|error| ApplicationError::Agent(error.to_string()))
    }

    async fn build_agent(&self) -> Agent {
        let schema = self.store.schema().await;
        let settings = AgentSettings {
            name: self.agent.name.clone(),
            instructions: agent_instructions(
                &self.bot_user_id,
                &self.model,
                &self.agent.persona,
                &schema,
            ),
            max_turns: self.agent.max_turns,
            max_history: self.agent.max_history,
        };
        Agent::new(settings, Arc::clone(&self.llm), Arc::clone(&self.tools))
    }
}

fn reply_text(mode: ReplyMode, final_text: &str) -> Option<String> {
    if final_text.trim().is_empty() {
        return None;
    }
    match mode {
        ReplyMode::Ack => Some(ACK_REPLY.to_owned()),
        ReplyMode::Full => Some(final_text.to_owned()),
    }
}

#[async_trait]
impl MentionService for AgentMentionService {
    async fn handle_mention(
        &self,
        event: &MentionEvent,
        thread_key: &str,
        _ctx: &EventContext,
    ) -> Result<Option<String>, EventHandlerError> {
        self.respond(event, thread_key)
            .await
            .map_err(|error| EventHandlerError::Mention(error.to_string()))
    }
}
