//! Ack id generation and parsing.
//!
//! An ack id identifies one delivery of one message on one subscription.
//! A redelivery gets a new ack id, so a stale id can never ack the newer copy.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::MessageId;
use crate::{Error, Result};

/// Data encoded in an ack id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckIdData {
    /// Full subscription name.
    #[serde(rename = "s")]
    pub subscription: String,
    /// Message ID.
    #[serde(rename = "m")]
    pub message_id: MessageId,
    /// Per-delivery nonce.
    #[serde(rename = "n")]
    pub nonce: String,
}

/// Generate an ack id for a delivery of `message_id` on `subscription`.
pub fn generate_ack_id(subscription: &str, message_id: &MessageId) -> String {
    let data = AckIdData {
        subscription: subscription.to_string(),
        message_id: message_id.clone(),
        nonce: Uuid::new_v4().simple().to_string(),
    };

    // Serializing plain strings cannot fail.
    let json = serde_json::to_vec(&data).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

/// Parse an ack id and extract the data.
pub fn parse_ack_id(ack_id: &str) -> Result<AckIdData> {
    let invalid = || Error::InvalidAckId(ack_id.to_string());

    let decoded = URL_SAFE_NO_PAD.decode(ack_id).map_err(|_| invalid())?;
    serde_json::from_slice(&decoded).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_id_carries_subscription_and_message() {
        let message_id = MessageId::new();
        let ack_id = generate_ack_id("projects/p/subscriptions/s", &message_id);

        let parsed = parse_ack_id(&ack_id).unwrap();
        assert_eq!(parsed.subscription, "projects/p/subscriptions/s");
        assert_eq!(parsed.message_id, message_id);
        assert!(!parsed.nonce.is_empty());
    }

    #[test]
    fn test_each_delivery_gets_a_distinct_ack_id() {
        let message_id = MessageId::new();
        let first = generate_ack_id("projects/p/subscriptions/s", &message_id);
        let second = generate_ack_id("projects/p/subscriptions/s", &message_id);
        assert_ne!(first, second);
    }

    #[test]
    fn test_parse_invalid_ack_id() {
        assert!(matches!(parse_ack_id("not base64!"), Err(Error::InvalidAckId(_))));
        assert!(parse_ack_id("").is_err());
        assert!(parse_ack_id(&URL_SAFE_NO_PAD.encode(b"{}")).is_err());
    }
}
