//! Push delivery bridged into axum.
//!
//! A push subscription POSTs a JSON [`PushEnvelope`] to an HTTP endpoint and
//! treats any 2xx answer as an ack. [`push_route`] turns a [`PushHandler`]
//! into such an endpoint:
//!
//! - malformed body: `400 Bad Request` (nack)
//! - handler `Ok`: `204 No Content` (ack)
//! - handler `Err`: the rejection's status, `503` by default (nack, redeliver)
//!
//! ```no_run
//! use pubsub_testkit::push::{handler_fn, push_route, PushEnvelope, PushRejection};
//!
//! let app: axum::Router = push_route(
//!     "/pubsub/push",
//!     handler_fn(|envelope: PushEnvelope| async move {
//!         println!("got {}", envelope.message.message_id);
//!         Ok::<(), PushRejection>(())
//!     }),
//! );
//! ```

pub mod endpoint;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::pubsub::types::base64_bytes;
use crate::types::Message;

pub use endpoint::{PushEndpoint, RecordingHandler};

/// Body of a push request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEnvelope {
    /// The pushed message.
    pub message: PushMessage,
    /// Full name of the subscription that pushed it.
    pub subscription: String,
    /// 1-based delivery attempt, when the sender tracks it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_attempt: Option<u32>,
}

impl PushEnvelope {
    /// Envelope for one delivery of `message` from `subscription`.
    pub fn new(message: &Message, subscription: impl Into<String>, delivery_attempt: u32) -> Self {
        Self {
            message: PushMessage::from(message),
            subscription: subscription.into(),
            delivery_attempt: Some(delivery_attempt),
        }
    }
}

/// Message inside a [`PushEnvelope`].
///
/// Both emulators send `messageId`/`publishTime` together with the
/// `message_id`/`publish_time` spellings; either is accepted, and both are
/// written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "WirePushMessage", into = "WirePushMessage")]
pub struct PushMessage {
    /// Decoded payload.
    pub data: Vec<u8>,
    /// Message attributes.
    pub attributes: HashMap<String, String>,
    /// Server-assigned message id.
    pub message_id: String,
    /// RFC 3339 publish time.
    pub publish_time: Option<String>,
    /// Ordering key, if the publisher set one.
    pub ordering_key: Option<String>,
}

impl PushMessage {
    /// Payload as UTF-8, if it is.
    pub fn data_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Look up an attribute.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

impl From<&Message> for PushMessage {
    fn from(message: &Message) -> Self {
        Self {
            data: message.data.clone(),
            attributes: message.attributes.clone(),
            message_id: message.id.0.clone(),
            publish_time: Some(message.publish_time.to_rfc3339()),
            ordering_key: message.ordering_key.clone(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WirePushMessage {
    #[serde(with = "base64_bytes", default)]
    data: Vec<u8>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    attributes: HashMap<String, String>,
    #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
    message_id_camel: Option<String>,
    #[serde(rename = "message_id", default, skip_serializing_if = "Option::is_none")]
    message_id_snake: Option<String>,
    #[serde(rename = "publishTime", default, skip_serializing_if = "Option::is_none")]
    publish_time_camel: Option<String>,
    #[serde(rename = "publish_time", default, skip_serializing_if = "Option::is_none")]
    publish_time_snake: Option<String>,
    #[serde(rename = "orderingKey", default, skip_serializing_if = "Option::is_none")]
    ordering_key: Option<String>,
}

impl From<WirePushMessage> for PushMessage {
    fn from(wire: WirePushMessage) -> Self {
        Self {
            data: wire.data,
            attributes: wire.attributes,
            message_id: wire
                .message_id_camel
                .or(wire.message_id_snake)
                .unwrap_or_default(),
            publish_time: wire.publish_time_camel.or(wire.publish_time_snake),
            ordering_key: wire.ordering_key.filter(|k| !k.is_empty()),
        }
    }
}

impl From<PushMessage> for WirePushMessage {
    fn from(message: PushMessage) -> Self {
        Self {
            data: message.data,
            attributes: message.attributes,
            message_id_camel: Some(message.message_id.clone()),
            message_id_snake: Some(message.message_id),
            publish_time_camel: message.publish_time.clone(),
            publish_time_snake: message.publish_time,
            ordering_key: message.ordering_key,
        }
    }
}

/// A handler's refusal of a pushed message; the sender will redeliver it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRejection {
    /// Status returned to the sender. Should be non-2xx.
    pub status: StatusCode,
    /// Reason, logged at debug level.
    pub reason: String,
}

impl PushRejection {
    /// Reject with `503 Service Unavailable`.
    pub fn new(reason: impl Into<String>) -> Self {
        Self::with_status(StatusCode::SERVICE_UNAVAILABLE, reason)
    }

    /// Reject with a specific status.
    pub fn with_status(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for PushRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.reason, self.status)
    }
}

impl From<crate::Error> for PushRejection {
    fn from(err: crate::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Application logic behind a push endpoint.
#[async_trait]
pub trait PushHandler: Send + Sync + 'static {
    /// Process one pushed message. `Ok` acks it, `Err` asks for redelivery.
    async fn handle(&self, envelope: PushEnvelope) -> Result<(), PushRejection>;
}

#[async_trait]
impl<H: PushHandler + ?Sized> PushHandler for Arc<H> {
    async fn handle(&self, envelope: PushEnvelope) -> Result<(), PushRejection> {
        (**self).handle(envelope).await
    }
}

/// [`PushHandler`] backed by an async closure; see [`handler_fn`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure as a [`PushHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(PushEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), PushRejection>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> PushHandler for HandlerFn<F>
where
    F: Fn(PushEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), PushRejection>> + Send + 'static,
{
    async fn handle(&self, envelope: PushEnvelope) -> Result<(), PushRejection> {
        (self.f)(envelope).await
    }
}

/// Router serving `handler` at `POST path`.
///
/// Merge it into an application router or serve it alone.
pub fn push_route<H: PushHandler>(path: &str, handler: H) -> Router {
    let handler: Arc<dyn PushHandler> = Arc::new(handler);
    Router::new()
        .route(path, post(receive_push))
        .with_state(handler)
}

async fn receive_push(State(handler): State<Arc<dyn PushHandler>>, body: Bytes) -> StatusCode {
    let envelope: PushEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Rejecting malformed push envelope: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };

    let message_id = envelope.message.message_id.clone();
    let subscription = envelope.subscription.clone();
    match handler.handle(envelope).await {
        Ok(()) => {
            debug!(subscription = %subscription, message_id = %message_id, "Push message acked");
            StatusCode::NO_CONTENT
        }
        Err(rejection) => {
            debug!(
                subscription = %subscription,
                message_id = %message_id,
                reason = %rejection.reason,
                "Push message rejected"
            );
            rejection.status
        }
    }
}
