//! Slack Socket Mode interface
//!
//! - **Events** (`events`) - envelope parsing, mention normalization, dispatch
//! - **Socket Mode** (`socket`) - ack-then-dispatch loop with reconnection
//! - **Transport** (`transport`) - websocket connection and Web API posting
//!
//! # Getting Started
//!
//! 1. Create a Slack app at https://api.slack.com/apps
//! 2. Enable Socket Mode and subscribe to the `app_mention` event
//! 3. Set env vars: `SLACK_APP_TOKEN` (`xapp-`), `SLACK_BOT_TOKEN` (`xoxb-`)
//!
//! # Architecture
//!
//! ```text
//! Socket frame → ack → EventDispatcher → MentionService → chat.postMessage
//! ```

pub mod events;
pub mod socket;
pub mod transport;

pub use events::{
    mention_dispatcher, normalize_mention, EventContext, EventDispatcher, EventHandlerError,
    MentionEvent, MentionService, MessagePoster, OutboundMessage, SlackEnvelope, SlackEvent,
};
pub use socket::{ReconnectPolicy, SocketModeRunner, SocketTransport, TransportError};
pub use transport::{SlackSocketTransport, SlackWebClient};
