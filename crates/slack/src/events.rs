use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::socket::TransportError;

#[derive(Clone, Debug, PartialEq)]
pub struct SlackEnvelope {
    pub envelope_id: String,
    pub event: SlackEvent,
}

impl SlackEnvelope {
    /// Builds an envelope from the `payload` of an `events_api` frame.
    pub fn from_events_api(envelope_id: impl Into<String>, payload: &Value) -> Self {
        let event = payload.get("event").cloned().unwrap_or(Value::Null);
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or("unknown").to_owned();

        let typed = match event_type.as_str() {
            "app_mention" => serde_json::from_value(event).map(SlackEvent::AppMention).ok(),
            "message" => serde_json::from_value(event).map(SlackEvent::Message).ok(),
            _ => None,
        };
        let event = typed.unwrap_or(SlackEvent::Unsupported { event_type });

        Self { envelope_id: envelope_id.into(), event }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SlackEvent {
    AppMention(MentionEvent),
    Message(MessageEvent),
    Unsupported { event_type: String },
}

impl SlackEvent {
    pub fn event_type(&self) -> SlackEventType {
        match self {
            Self::AppMention(_) => SlackEventType::AppMention,
            Self::Message(_) => SlackEventType::Message,
            Self::Unsupported { .. } => SlackEventType::Unsupported,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SlackEventType {
    AppMention,
    Message,
    Unsupported,
}

/// An `app_mention` event. Fields Slack may omit stay optional.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct MentionEvent {
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub blocks: Vec<Value>,
}

impl MentionEvent {
    /// Conversation key: the thread root, or the message itself when the
    /// mention starts a new thread.
    pub fn thread_key(&self) -> Option<&str> {
        self.thread_ts.as_deref().or(self.ts.as_deref()).filter(|key| !key.is_empty())
    }

    /// User ids from `user` items of rich text sections, in order of appearance.
    pub fn mentioned_user_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for block in self.blocks.iter().filter(|block| block["type"] == "rich_text") {
            let sections = block["elements"].as_array().map(Vec::as_slice).unwrap_or_default();
            for section in sections.iter().filter(|section| section["type"] == "rich_text_section")
            {
                let items = section["elements"].as_array().map(Vec::as_slice).unwrap_or_default();
                ids.extend(
                    items
                        .iter()
                        .filter(|item| item["type"] == "user")
                        .filter_map(|item| item["user_id"].as_str())
                        .map(str::to_owned),
                );
            }
        }
        ids
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct MessageEvent {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

/// Renders a mention as the plain-text block the agent receives as input.
pub fn normalize_mention(event: &MentionEvent) -> String {
    let field = |value: &Option<String>| value.clone().unwrap_or_else(|| "unknown".to_owned());
    let mentioned = event.mentioned_user_ids();
    let mentioned = if mentioned.is_empty() { "none".to_owned() } else { mentioned.join(", ") };

    format!(
        "\nslack message event:\n\
         -----------------\n\
         event type: {}\n\
         timestamp: {}\n\
         sender user id: {}\n\
         channle id: {}\n\
         message raw text: {}\n\
         mentioned user: {mentioned}\n\
         -----------------\n",
        field(&event.event_type),
        field(&event.ts),
        field(&event.user),
        field(&event.channel),
        event.text.as_deref().unwrap_or_default(),
    )
}

/// A reply addressed to a thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub channel: String,
    pub thread_ts: String,
    pub text: String,
}

#[async_trait]
pub trait MessagePoster: Send + Sync {
    async fn post_message(&self, message: &OutboundMessage) -> Result<(), TransportError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventContext {
    pub correlation_id: String,
}

impl Default for EventContext {
    fn default() -> Self {
        Self { correlation_id: "unknown-correlation-id".to_owned() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerResult {
    Responded(OutboundMessage),
    Processed,
    Ignored,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventHandlerError {
    #[error("{0}")]
    Mention(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Handler(#[from] EventHandlerError),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn event_type(&self) -> SlackEventType;
    async fn handle(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError>;
}

#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<SlackEventType, Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.handlers.insert(handler.event_type(), Arc::new(handler));
    }

    pub async fn dispatch(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, DispatchError> {
        let Some(handler) = self.handlers.get(&envelope.event.event_type()) else {
            return Ok(HandlerResult::Ignored);
        };

        handler.handle(envelope, ctx).await.map_err(DispatchError::from)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

/// Mentions go to `service`; plain messages are only logged.
pub fn mention_dispatcher<S>(service: S) -> EventDispatcher
where
    S: MentionService + 'static,
{
    let mut dispatcher = EventDispatcher::new();
    dispatcher.register(AppMentionHandler::new(service));
    dispatcher.register(MessageLogHandler);
    dispatcher
}

#[async_trait]
pub trait MentionService: Send + Sync {
    /// Returns the reply text for the thread, or `None` for no reply.
    async fn handle_mention(
        &self,
        event: &MentionEvent,
        thread_key: &str,
        ctx: &EventContext,
    ) -> Result<Option<String>, EventHandlerError>;
}

pub struct AppMentionHandler<S> {
    service: S,
}

impl<S> AppMentionHandler<S>
where
    S: MentionService,
{
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<S> EventHandler for AppMentionHandler<S>
where
    S: MentionService + 'static,
{
    fn event_type(&self) -> SlackEventType {
        SlackEventType::AppMention
    }

    async fn handle(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        let SlackEvent::AppMention(event) = &envelope.event else {
            return Ok(HandlerResult::Ignored);
        };
        let (Some(thread_key), Some(channel)) = (event.thread_key(), event.channel.as_deref())
        else {
            warn!(
                event_name = "ingress.slack.mention_unaddressable",
                correlation_id = %ctx.correlation_id,
                "mention without channel or timestamp; nothing to reply to"
            );
            return Ok(HandlerResult::Processed);
        };

        let text = match self.service.handle_mention(event, thread_key, ctx).await {
            Ok(Some(text)) => text,
            Ok(None) => return Ok(HandlerResult::Processed),
            Err(error) => {
                warn!(
                    event_name = "agent.run.failed",
                    correlation_id = %ctx.correlation_id,
                    thread_id = thread_key,
                    error = %error,
                    "mention handling failed; replying with error"
                );
                format!("[ERROR] {error}")
            }
        };

        Ok(HandlerResult::Responded(OutboundMessage {
            channel: channel.to_owned(),
            thread_ts: thread_key.to_owned(),
            text,
        }))
    }
}

pub struct MessageLogHandler;

#[async_trait]
impl EventHandler for MessageLogHandler {
    fn event_type(&self) -> SlackEventType {
        SlackEventType::Message
    }

    async fn handle(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        let SlackEvent::Message(event) = &envelope.event else {
            return Ok(HandlerResult::Ignored);
        };

        info!(
            event_name = "ingress.slack.message_observed",
            correlation_id = %ctx.correlation_id,
            channel = event.channel.as_deref().unwrap_or("unknown"),
            user = event.user.as_deref().unwrap_or("unknown"),
            subtype = event.subtype.as_deref().unwrap_or("none"),
            ts = event.ts.as_deref().unwrap_or("unknown"),
            "message event"
        );
        Ok(HandlerResult::Processed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::{
        mention_dispatcher, normalize_mention, EventContext, EventDispatcher, EventHandlerError,
        HandlerResult, MentionEvent, MentionService, OutboundMessage, SlackEnvelope, SlackEvent,
    };

    #[derive(Default)]
    struct RecordingService {
        calls: Mutex<Vec<(String, String)>>,
        fail_with: Option<&'static str>,
        reply: Option<&'static str>,
    }

    #[async_trait]
    impl MentionService for RecordingService {
        async fn handle_mention(
            &self,
            event: &MentionEvent,
            thread_key: &str,
            _ctx: &EventContext,
        ) -> Result<Option<String>, EventHandlerError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((thread_key.to_owned(), normalize_mention(event)));
            if let Some(message) = self.fail_with {
                return Err(EventHandlerError::Mention(message.to_owned()));
            }
            Ok(self.reply.map(str::to_owned))
        }
    }

    fn mention_payload() -> serde_json::Value {
        json!({
            "event": {
                "type": "app_mention",
                "ts": "100.1",
                "user": "U1",
                "channel": "C1",
                "text": "<@UBOT> hello <@U2>",
                "blocks": [{
                    "type": "rich_text",
                    "elements": [{
                        "type": "rich_text_section",
                        "elements": [
                            { "type": "user", "user_id": "UBOT" },
                            { "type": "text", "text": " hello " },
                            { "type": "user", "user_id": "U2" }
                        ]
                    }]
                }]
            }
        })
    }

    #[test]
    fn events_api_payload_becomes_typed_event() {
        let envelope = SlackEnvelope::from_events_api("env-1", &mention_payload());
        let SlackEvent::AppMention(event) = &envelope.event else {
            panic!("expected app mention, got {:?}", envelope.event);
        };

        assert_eq!(event.thread_key(), Some("100.1"));
        assert_eq!(event.mentioned_user_ids(), vec!["UBOT", "U2"]);

        let other = SlackEnvelope::from_events_api("env-2", &json!({ "event": { "type": "reaction_added" } }));
        assert_eq!(other.event, SlackEvent::Unsupported { event_type: "reaction_added".to_owned() });
    }

    #[test]
    fn thread_key_prefers_thread_root() {
        let event = MentionEvent {
            ts: Some("200.5".to_owned()),
            thread_ts: Some("200.1".to_owned()),
            ..MentionEvent::default()
        };
        assert_eq!(event.thread_key(), Some("200.1"));
        assert_eq!(MentionEvent::default().thread_key(), None);
    }

    #[test]
    fn normalized_text_has_fixed_layout() {
        let envelope = SlackEnvelope::from_events_api("env-1", &mention_payload());
        let SlackEvent::AppMention(event) = &envelope.event else {
            panic!("expected app mention");
        };

        assert_eq!(
            normalize_mention(event),
            "\nslack message event:\n-----------------\nevent type: app_mention\ntimestamp: 100.1\nsender user id: U1\nchannle id: C1\nmessage raw text: <@UBOT> hello <@U2>\nmentioned user: UBOT, U2\n-----------------\n"
        );
    }

    #[test]
    fn normalized_text_marks_missing_fields() {
        let text = normalize_mention(&MentionEvent::default());

        assert!(text.contains("event type: unknown\n"));
        assert!(text.contains("sender user id: unknown\n"));
        assert!(text.contains("message raw text: \n"));
        assert!(text.contains("mentioned user: none\n"));
    }

    #[tokio::test]
    async fn mention_reply_is_addressed_to_thread() {
        let dispatcher = mention_dispatcher(RecordingService {
            reply: Some("--- done ---"),
            ..RecordingService::default()
        });
        let envelope = SlackEnvelope::from_events_api("env-1", &mention_payload());

        let result = dispatcher.dispatch(&envelope, &EventContext::default()).await.expect("dispatch");

        assert_eq!(
            result,
            HandlerResult::Responded(OutboundMessage {
                channel: "C1".to_owned(),
                thread_ts: "100.1".to_owned(),
                text: "--- done ---".to_owned(),
            })
        );
    }

    #[tokio::test]
    async fn service_errors_become_error_replies() {
        let dispatcher = mention_dispatcher(RecordingService {
            fail_with: Some("tool server `slack` failed"),
            ..RecordingService::default()
        });
        let envelope = SlackEnvelope::from_events_api("env-1", &mention_payload());

        let result = dispatcher.dispatch(&envelope, &EventContext::default()).await.expect("dispatch");

        let HandlerResult::Responded(message) = result else {
            panic!("expected an error reply");
        };
        assert_eq!(message.text, "[ERROR] tool server `slack` failed");
        assert_eq!(message.thread_ts, "100.1");
    }

    #[tokio::test]
    async fn silent_runs_and_plain_messages_are_processed_without_reply() {
        let dispatcher = mention_dispatcher(RecordingService::default());
        assert_eq!(dispatcher.handler_count(), 2);

        let mention = SlackEnvelope::from_events_api("env-1", &mention_payload());
        let result = dispatcher.dispatch(&mention, &EventContext::default()).await.expect("dispatch");
        assert_eq!(result, HandlerResult::Processed);

        let message = SlackEnvelope::from_events_api(
            "env-2",
            &json!({ "event": { "type": "message", "channel": "C1", "user": "U1", "ts": "1.0", "text": "hi" } }),
        );
        let result = dispatcher.dispatch(&message, &EventContext::default()).await.expect("dispatch");
        assert_eq!(result, HandlerResult::Processed);
    }

    #[tokio::test]
    async fn dispatcher_returns_ignored_when_no_handler_registered() {
        let dispatcher = EventDispatcher::new();
        let envelope = SlackEnvelope {
            envelope_id: "env-3".to_owned(),
            event: SlackEvent::Unsupported { event_type: "team_join".to_owned() },
        };

        let result = dispatcher.dispatch(&envelope, &EventContext::default()).await.expect("dispatch");

        assert_eq!(result, HandlerResult::Ignored);
    }
}
