use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use mentionbot_core::config::SlackConfig;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{net::TcpStream, sync::Mutex};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info};

use crate::events::{MessagePoster, OutboundMessage, SlackEnvelope, SlackEvent};
use crate::socket::{SocketTransport, TransportError};

type SlackSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct SlackApiResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

impl SlackApiResponse {
    fn into_result(self, method: &str) -> Result<Self, String> {
        if self.ok {
            Ok(self)
        } else {
            Err(format!("{method} returned {}", self.error.as_deref().unwrap_or("unknown_error")))
        }
    }
}

/// A decoded Socket Mode frame.
#[derive(Debug, PartialEq)]
pub enum SocketFrame {
    Hello,
    Disconnect { reason: Option<String> },
    Envelope(SlackEnvelope),
    Other,
}

pub fn parse_frame(text: &str) -> Result<SocketFrame, TransportError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|error| TransportError::Receive(format!("malformed socket frame: {error}")))?;
    let frame_type = value.get("type").and_then(Value::as_str).unwrap_or_default();
    let envelope_id = value.get("envelope_id").and_then(Value::as_str);

    let frame = match (frame_type, envelope_id) {
        ("hello", _) => SocketFrame::Hello,
        ("disconnect", _) => SocketFrame::Disconnect {
            reason: value.get("reason").and_then(Value::as_str).map(str::to_owned),
        },
        ("events_api", Some(id)) => SocketFrame::Envelope(SlackEnvelope::from_events_api(
            id,
            value.get("payload").unwrap_or(&Value::Null),
        )),
        // Interactive and slash-command frames still need an ack.
        (other, Some(id)) => SocketFrame::Envelope(SlackEnvelope {
            envelope_id: id.to_owned(),
            event: SlackEvent::Unsupported { event_type: other.to_owned() },
        }),
        _ => SocketFrame::Other,
    };
    Ok(frame)
}

fn http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()
}

pub struct SlackSocketTransport {
    http: reqwest::Client,
    api_base_url: String,
    app_token: SecretString,
    socket: Mutex<Option<SlackSocket>>,
}

impl SlackSocketTransport {
    pub fn from_config(config: &SlackConfig) -> Result<Self, TransportError> {
        let http = http_client().map_err(|error| TransportError::Connect(error.to_string()))?;
        Ok(Self {
            http,
            api_base_url: config.api_base_url.trim_end_matches('/').to_owned(),
            app_token: config.app_token.clone(),
            socket: Mutex::new(None),
        })
    }

    async fn open_connection_url(&self) -> Result<String, TransportError> {
        let response = self
            .http
            .post(format!("{}/apps.connections.open", self.api_base_url))
            .bearer_auth(self.app_token.expose_secret())
            .send()
            .await
            .map_err(|error| TransportError::Connect(error.to_string()))?
            .json::<SlackApiResponse>()
            .await
            .map_err(|error| TransportError::Connect(error.to_string()))?
            .into_result("apps.connections.open")
            .map_err(TransportError::Connect)?;

        response
            .url
            .ok_or_else(|| TransportError::Connect("apps.connections.open returned no url".to_owned()))
    }
}

#[async_trait]
impl SocketTransport for SlackSocketTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let url = self.open_connection_url().await?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|error| TransportError::Connect(error.to_string()))?;
        *self.socket.lock().await = Some(stream);
        Ok(())
    }

    async fn next_envelope(&self) -> Result<Option<SlackEnvelope>, TransportError> {
        let mut guard = self.socket.lock().await;
        let Some(socket) = guard.as_mut() else {
            return Ok(None);
        };

        loop {
            let Some(message) = socket.next().await else {
                *guard = None;
                return Ok(None);
            };
            let message = message.map_err(|error| TransportError::Receive(error.to_string()))?;

            let text = match message {
                Message::Text(text) => text.to_string(),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Message::Close(_) => {
                    *guard = None;
                    return Ok(None);
                }
                _ => continue,
            };

            match parse_frame(&text)? {
                SocketFrame::Hello => debug!("socket mode hello received"),
                SocketFrame::Disconnect { reason } => {
                    info!(reason = reason.as_deref().unwrap_or("unspecified"), "slack requested disconnect");
                    if let Some(mut socket) = guard.take() {
                        let _ = socket.close(None).await;
                    }
                    return Ok(None);
                }
                SocketFrame::Envelope(envelope) => return Ok(Some(envelope)),
                SocketFrame::Other => {}
            }
        }
    }

    async fn acknowledge(&self, envelope_id: &str) -> Result<(), TransportError> {
        let mut guard = self.socket.lock().await;
        let socket = guard
            .as_mut()
            .ok_or_else(|| TransportError::Acknowledge("socket is not connected".to_owned()))?;
        let ack = json!({ "envelope_id": envelope_id }).to_string();
        socket
            .send(Message::Text(ack.into()))
            .await
            .map_err(|error| TransportError::Acknowledge(error.to_string()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(mut socket) = self.socket.lock().await.take() else {
            return Ok(());
        };
        socket.close(None).await.map_err(|error| TransportError::Disconnect(error.to_string()))
    }
}

/// Web API client for the bot token.
pub struct SlackWebClient {
    http: reqwest::Client,
    api_base_url: String,
    bot_token: SecretString,
}

impl SlackWebClient {
    pub fn from_config(config: &SlackConfig) -> Result<Self, TransportError> {
        let http = http_client().map_err(|error| TransportError::Connect(error.to_string()))?;
        Ok(Self {
            http,
            api_base_url: config.api_base_url.trim_end_matches('/').to_owned(),
            bot_token: config.bot_token.clone(),
        })
    }

    async fn call(&self, method: &str, body: &Value) -> Result<SlackApiResponse, String> {
        self.http
            .post(format!("{}/{method}", self.api_base_url))
            .bearer_auth(self.bot_token.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|error| error.to_string())?
            .json::<SlackApiResponse>()
            .await
            .map_err(|error| error.to_string())?
            .into_result(method)
    }
}

#[async_trait]
impl MessagePoster for SlackWebClient {
    async fn post_message(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let body = json!({
            "channel": message.channel,
            "thread_ts": message.thread_ts,
            "text": message.text,
        });
        self.call("chat.postMessage", &body).await.map(|_| ()).map_err(TransportError::Post)
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_frame, SlackApiResponse, SocketFrame};
    use crate::events::SlackEvent;

    #[test]
    fn hello_and_disconnect_frames_are_recognized() {
        assert_eq!(parse_frame(r#"{"type":"hello","num_connections":1}"#), Ok(SocketFrame::Hello));
        assert_eq!(
            parse_frame(r#"{"type":"disconnect","reason":"refresh_requested"}"#),
            Ok(SocketFrame::Disconnect { reason: Some("refresh_requested".to_owned()) })
        );
    }

    #[test]
    fn events_api_frame_becomes_mention_envelope() {
        let frame = parse_frame(
            r#"{"type":"events_api","envelope_id":"e-1","payload":{"event":{"type":"app_mention","ts":"100.1","user":"U1","channel":"C1","text":"<@UBOT> hi"}}}"#,
        )
        .expect("frame");

        let SocketFrame::Envelope(envelope) = frame else {
            panic!("expected envelope, got {frame:?}");
        };
        assert_eq!(envelope.envelope_id, "e-1");
        let SlackEvent::AppMention(mention) = envelope.event else {
            panic!("expected app mention");
        };
        assert_eq!(mention.thread_key(), Some("100.1"));
        assert_eq!(mention.channel.as_deref(), Some("C1"));
    }

    #[test]
    fn other_enveloped_frames_are_still_acknowledgeable() {
        let frame = parse_frame(r#"{"type":"slash_commands","envelope_id":"e-2","payload":{}}"#)
            .expect("frame");
        assert!(matches!(
            frame,
            SocketFrame::Envelope(ref envelope)
                if envelope.envelope_id == "e-2"
                    && envelope.event == SlackEvent::Unsupported { event_type: "slash_commands".to_owned() }
        ));
    }

    #[test]
    fn malformed_frames_are_receive_errors() {
        assert!(parse_frame("not json").is_err());
        assert_eq!(parse_frame(r#"{"type":"ping"}"#), Ok(SocketFrame::Other));
    }

    #[test]
    fn api_errors_surface_the_slack_error_code() {
        let response: SlackApiResponse =
            serde_json::from_str(r#"{"ok":false,"error":"invalid_auth"}"#).expect("json");
        assert_eq!(
            response.into_result("chat.postMessage").map(|_| ()),
            Err("chat.postMessage returned invalid_auth".to_owned())
        );
    }
}
