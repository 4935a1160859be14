use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::events::{
    EventContext, EventDispatcher, HandlerResult, MessagePoster, SlackEnvelope, SlackEvent,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport failed to connect: {0}")]
    Connect(String),
    #[error("transport read failed: {0}")]
    Receive(String),
    #[error("transport ack failed: {0}")]
    Acknowledge(String),
    #[error("transport disconnect failed: {0}")]
    Disconnect(String),
    #[error("message post failed: {0}")]
    Post(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Open a new connection when Slack closes the current one.
    pub reconnect_on_close: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_retries: 5, base_delay_ms: 250, max_delay_ms: 5_000, reconnect_on_close: true }
    }
}

impl ReconnectPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

#[async_trait]
pub trait SocketTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    /// `Ok(None)` means the server closed the connection.
    async fn next_envelope(&self) -> Result<Option<SlackEnvelope>, TransportError>;
    async fn acknowledge(&self, envelope_id: &str) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
}

enum SessionError {
    NotConnected(TransportError),
    Interrupted(TransportError),
}

pub struct SocketModeRunner {
    transport: Arc<dyn SocketTransport>,
    dispatcher: Arc<EventDispatcher>,
    poster: Arc<dyn MessagePoster>,
    reconnect_policy: ReconnectPolicy,
}

impl SocketModeRunner {
    pub fn new(
        transport: Arc<dyn SocketTransport>,
        dispatcher: EventDispatcher,
        poster: Arc<dyn MessagePoster>,
        reconnect_policy: ReconnectPolicy,
    ) -> Self {
        Self { transport, dispatcher: Arc::new(dispatcher), poster, reconnect_policy }
    }

    /// Runs until reconnect attempts are exhausted (or, without
    /// `reconnect_on_close`, until the first clean close). In-flight handlers
    /// are awaited before returning.
    pub async fn start(&self) -> Result<()> {
        let mut in_flight = JoinSet::new();
        let mut failures = 0_u32;

        loop {
            match self.connect_and_pump(failures, &mut in_flight).await {
                Ok(()) => {
                    failures = 0;
                    if !self.reconnect_policy.reconnect_on_close {
                        break;
                    }
                    info!(event_name = "ingress.slack.reconnecting", "socket closed by server; reconnecting");
                }
                Err(SessionError::Interrupted(transport_error)) => {
                    warn!(
                        error = %transport_error,
                        "socket mode connection interrupted; reconnecting"
                    );
                    failures = 0;
                    let _ = self.transport.disconnect().await;
                    let delay = self.reconnect_policy.backoff(0);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(SessionError::NotConnected(transport_error)) => {
                    warn!(
                        attempt = failures,
                        max_retries = self.reconnect_policy.max_retries,
                        error = %transport_error,
                        "socket mode transport failed"
                    );

                    if failures >= self.reconnect_policy.max_retries {
                        warn!(
                            max_retries = self.reconnect_policy.max_retries,
                            "socket mode retries exhausted; continuing process without crash"
                        );
                        break;
                    }

                    let delay = self.reconnect_policy.backoff(failures);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    failures += 1;
                }
            }
        }

        while in_flight.join_next().await.is_some() {}
        Ok(())
    }

    async fn connect_and_pump(
        &self,
        attempt: u32,
        in_flight: &mut JoinSet<()>,
    ) -> Result<(), SessionError> {
        info!(attempt, "opening socket mode transport connection");
        self.transport.connect().await.map_err(SessionError::NotConnected)?;
        info!(attempt, "socket mode transport connected");

        loop {
            let next = self.transport.next_envelope().await.map_err(SessionError::Interrupted)?;
            let Some(envelope) = next else {
                info!(attempt, "socket mode transport stream closed");
                self.transport.disconnect().await.map_err(SessionError::Interrupted)?;
                return Ok(());
            };
            let thread_id = thread_field(&envelope);

            info!(
                event_name = "ingress.slack.envelope_received",
                envelope_id = %envelope.envelope_id,
                event_type = ?envelope.event.event_type(),
                correlation_id = %envelope.envelope_id,
                thread_id = thread_id.as_deref().unwrap_or("unknown"),
                "received slack envelope"
            );

            if let Err(error) = self.transport.acknowledge(&envelope.envelope_id).await {
                warn!(
                    event_name = "ingress.slack.ack_sent",
                    envelope_id = %envelope.envelope_id,
                    correlation_id = %envelope.envelope_id,
                    thread_id = thread_id.as_deref().unwrap_or("unknown"),
                    error = %error,
                    "failed to acknowledge slack envelope"
                );
            } else {
                debug!(
                    event_name = "ingress.slack.ack_sent",
                    envelope_id = %envelope.envelope_id,
                    correlation_id = %envelope.envelope_id,
                    thread_id = thread_id.as_deref().unwrap_or("unknown"),
                    "acknowledged slack envelope"
                );
            }

            while in_flight.try_join_next().is_some() {}
            in_flight.spawn(dispatch_envelope(
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.poster),
                envelope,
                thread_id,
            ));
        }
    }
}

async fn dispatch_envelope(
    dispatcher: Arc<EventDispatcher>,
    poster: Arc<dyn MessagePoster>,
    envelope: SlackEnvelope,
    thread_id: Option<String>,
) {
    let context = EventContext { correlation_id: envelope.envelope_id.clone() };
    let thread_id = thread_id.as_deref().unwrap_or("unknown");

    match dispatcher.dispatch(&envelope, &context).await {
        Ok(HandlerResult::Responded(message)) => {
            if let Err(error) = poster.post_message(&message).await {
                warn!(
                    event_name = "egress.slack.reply_failed",
                    correlation_id = %context.correlation_id,
                    thread_id,
                    error = %error,
                    "failed to post reply"
                );
            } else {
                info!(
                    event_name = "egress.slack.reply_sent",
                    correlation_id = %context.correlation_id,
                    thread_id,
                    "reply posted"
                );
            }
        }
        Ok(_) => {}
        Err(error) => {
            warn!(
                envelope_id = %envelope.envelope_id,
                correlation_id = %context.correlation_id,
                thread_id,
                error = %error,
                "event dispatch failed; continuing socket loop"
            );
        }
    }
}

fn thread_field(envelope: &SlackEnvelope) -> Option<String> {
    match &envelope.event {
        SlackEvent::AppMention(event) => event.thread_key().map(str::to_owned),
        SlackEvent::Message(event) => event.thread_ts.clone().or_else(|| event.ts.clone()),
        SlackEvent::Unsupported { .. } => None,
    }
}
