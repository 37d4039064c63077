//! Resource names and validation of IDs, messages and deadlines.

use std::fmt;

use crate::error::ValidationError;
use crate::types::MessageAttributes;
use crate::{Error, Result};

/// Pub/Sub maximum message size (10 MB).
pub const MAX_MESSAGE_SIZE: usize = 10_485_760;

/// Minimum ack deadline accepted on a subscription.
pub const MIN_ACK_DEADLINE_SECONDS: u32 = 10;

/// Maximum ack deadline.
pub const MAX_ACK_DEADLINE_SECONDS: u32 = 600;

/// A parsed Pub/Sub resource name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceName {
    /// `projects/{project}/topics/{topic}`
    Topic {
        /// The project ID
        project: String,
        /// The topic ID
        topic: String,
    },
    /// `projects/{project}/subscriptions/{subscription}`
    Subscription {
        /// The project ID
        project: String,
        /// The subscription ID
        subscription: String,
    },
}

impl ResourceName {
    /// Parse a resource name string.
    pub fn parse(name: &str) -> Result<Self> {
        let parts: Vec<&str> = name.split('/').collect();

        if parts.len() != 4 || parts[0] != "projects" || parts[1].is_empty() || parts[3].is_empty() {
            return Err(ValidationError::InvalidResourceName(name.to_string()).into());
        }

        let project = parts[1].to_string();
        let resource_id = parts[3].to_string();

        match parts[2] {
            "topics" => Ok(ResourceName::Topic {
                project,
                topic: resource_id,
            }),
            "subscriptions" => Ok(ResourceName::Subscription {
                project,
                subscription: resource_id,
            }),
            other => Err(ValidationError::InvalidParameter {
                name: "resource_type".to_string(),
                reason: format!("Unknown resource type: {}", other),
            }
            .into()),
        }
    }

    /// Parse a name that must be a topic.
    pub fn parse_topic(name: &str) -> Result<Self> {
        match Self::parse(name)? {
            topic @ ResourceName::Topic { .. } => Ok(topic),
            _ => Err(ValidationError::InvalidResourceName(format!("not a topic: {}", name)).into()),
        }
    }

    /// Get the project ID.
    pub fn project(&self) -> &str {
        match self {
            ResourceName::Topic { project, .. } => project,
            ResourceName::Subscription { project, .. } => project,
        }
    }

    /// Get the topic or subscription ID.
    pub fn resource_id(&self) -> &str {
        match self {
            ResourceName::Topic { topic, .. } => topic,
            ResourceName::Subscription { subscription, .. } => subscription,
        }
    }

    /// Format a topic resource name.
    pub fn topic(project: impl AsRef<str>, topic: impl AsRef<str>) -> String {
        format!("projects/{}/topics/{}", project.as_ref(), topic.as_ref())
    }

    /// Format a subscription resource name.
    pub fn subscription(project: impl AsRef<str>, subscription: impl AsRef<str>) -> String {
        format!(
            "projects/{}/subscriptions/{}",
            project.as_ref(),
            subscription.as_ref()
        )
    }

    /// Expand a bare ID to a full topic name; full names pass through.
    pub fn qualify_topic(project: &str, topic: &str) -> String {
        if topic.starts_with("projects/") {
            topic.to_string()
        } else {
            Self::topic(project, topic)
        }
    }

    /// Expand a bare ID to a full subscription name; full names pass through.
    pub fn qualify_subscription(project: &str, subscription: &str) -> String {
        if subscription.starts_with("projects/") {
            subscription.to_string()
        } else {
            Self::subscription(project, subscription)
        }
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceName::Topic { project, topic } => {
                write!(f, "projects/{}/topics/{}", project, topic)
            }
            ResourceName::Subscription {
                project,
                subscription,
            } => {
                write!(f, "projects/{}/subscriptions/{}", project, subscription)
            }
        }
    }
}

/// Shared rules for topic and subscription IDs.
fn check_resource_id(id: &str) -> std::result::Result<(), String> {
    if id.len() < 3 || id.len() > 255 {
        return Err(format!("must be 3-255 characters, got {}", id.len()));
    }

    if !id.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err("must start with a letter".to_string());
    }

    if id.starts_with("goog") {
        return Err("must not start with \"goog\"".to_string());
    }

    if let Some(ch) = id
        .chars()
        .find(|ch| !matches!(ch, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '~' | '+' | '%'))
    {
        return Err(format!("contains invalid character: '{}'", ch));
    }

    Ok(())
}

/// Validates a topic ID: 3-255 characters, starts with a letter,
/// letters, digits and `-_.~+%` only.
pub fn validate_topic_id(topic_id: &str) -> Result<()> {
    check_resource_id(topic_id)
        .map_err(|reason| ValidationError::InvalidTopicId(format!("{}: {}", topic_id, reason)).into())
}

/// Validates a subscription ID; same rules as topic IDs.
pub fn validate_subscription_id(subscription_id: &str) -> Result<()> {
    check_resource_id(subscription_id).map_err(|reason| {
        ValidationError::InvalidSubscriptionId(format!("{}: {}", subscription_id, reason)).into()
    })
}

/// Validates a project ID.
///
/// Project IDs must:
/// - Be 6-30 characters
/// - Start with a lowercase letter
/// - Contain only lowercase letters, numbers, and hyphens
/// - Not end with a hyphen
pub fn validate_project_id(project_id: &str) -> Result<()> {
    let invalid = |reason: &str| -> Error {
        ValidationError::InvalidProjectId(format!("{}: {}", project_id, reason)).into()
    };

    if project_id.len() < 6 || project_id.len() > 30 {
        return Err(invalid("must be 6-30 characters"));
    }
    if !project_id.starts_with(|c: char| c.is_ascii_lowercase()) {
        return Err(invalid("must start with a lowercase letter"));
    }
    if project_id.ends_with('-') {
        return Err(invalid("must not end with a hyphen"));
    }
    if project_id
        .chars()
        .any(|ch| !matches!(ch, 'a'..='z' | '0'..='9' | '-'))
    {
        return Err(invalid("contains invalid character"));
    }

    Ok(())
}

/// Validates a message before publishing.
pub fn validate_message(data: &[u8], attributes: &MessageAttributes) -> Result<()> {
    if data.is_empty() && attributes.is_empty() {
        return Err(ValidationError::EmptyMessage.into());
    }

    let size = data.len()
        + attributes
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum::<usize>();
    if size > MAX_MESSAGE_SIZE {
        return Err(ValidationError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        }
        .into());
    }

    Ok(())
}

/// Validates an ack deadline. Zero is only meaningful on modifyAckDeadline (nack).
pub fn validate_ack_deadline(seconds: i64, allow_zero: bool) -> Result<u32> {
    let min = if allow_zero { 0 } else { i64::from(MIN_ACK_DEADLINE_SECONDS) };
    if seconds < min || seconds > i64::from(MAX_ACK_DEADLINE_SECONDS) {
        return Err(ValidationError::InvalidParameter {
            name: "ack_deadline_seconds".to_string(),
            reason: format!(
                "must be between {} and {}, got {}",
                min, MAX_ACK_DEADLINE_SECONDS, seconds
            ),
        }
        .into());
    }
    Ok(seconds as u32)
}

/// Validates max delivery attempts on a dead-letter policy (5-100).
pub fn validate_max_delivery_attempts(attempts: u32) -> Result<()> {
    if !(5..=100).contains(&attempts) {
        return Err(ValidationError::InvalidParameter {
            name: "max_delivery_attempts".to_string(),
            reason: format!("must be between 5 and 100, got {}", attempts),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_name_parsing() {
        let parsed = ResourceName::parse("projects/test-project/topics/test-topic").unwrap();
        assert_eq!(parsed.project(), "test-project");
        assert_eq!(parsed.resource_id(), "test-topic");

        let parsed = ResourceName::parse("projects/test-project/subscriptions/test-sub").unwrap();
        assert_eq!(parsed.project(), "test-project");
        assert_eq!(parsed.resource_id(), "test-sub");

        assert!(ResourceName::parse("projects/test-project/snapshots/s").is_err());
        assert!(ResourceName::parse("topics/test-topic").is_err());
        assert!(ResourceName::parse("projects//topics/t").is_err());
        assert!(ResourceName::parse_topic("projects/p/subscriptions/s").is_err());
    }

    #[test]
    fn test_resource_name_formatting() {
        assert_eq!(
            ResourceName::topic("test-project", "test-topic"),
            "projects/test-project/topics/test-topic"
        );
        assert_eq!(
            ResourceName::subscription("test-project", "test-sub"),
            "projects/test-project/subscriptions/test-sub"
        );

        let sub = ResourceName::Subscription {
            project: "test-project".to_string(),
            subscription: "test-sub".to_string(),
        };
        assert_eq!(sub.to_string(), "projects/test-project/subscriptions/test-sub");
    }

    #[test]
    fn test_qualify_names() {
        assert_eq!(
            ResourceName::qualify_topic("proj-one", "orders"),
            "projects/proj-one/topics/orders"
        );
        assert_eq!(
            ResourceName::qualify_topic("proj-one", "projects/other/topics/orders"),
            "projects/other/topics/orders"
        );
        assert_eq!(
            ResourceName::qualify_subscription("proj-one", "orders-sub"),
            "projects/proj-one/subscriptions/orders-sub"
        );
    }

    #[test]
    fn test_topic_id_validation() {
        assert!(validate_topic_id("valid-topic").is_ok());
        assert!(validate_topic_id("a.b~c+d%e_f").is_ok());
        assert!(validate_topic_id("t").is_err());
        assert!(validate_topic_id(&"a".repeat(256)).is_err());
        assert!(validate_topic_id("123topic").is_err());
        assert!(validate_topic_id("topic@invalid").is_err());
        assert!(validate_topic_id("google-topic").is_err());
    }

    #[test]
    fn test_subscription_id_invalid_character() {
        match validate_subscription_id("sub@invalid") {
            Err(Error::Validation(ValidationError::InvalidSubscriptionId(msg))) => {
                assert!(msg.contains("invalid character"));
            }
            other => panic!("Expected InvalidSubscriptionId error, got {:?}", other),
        }
    }

    #[test]
    fn test_project_id_validation() {
        assert!(validate_project_id("test-project").is_ok());
        assert!(validate_project_id("short").is_err());
        assert!(validate_project_id("TestProject").is_err());
        assert!(validate_project_id("project-").is_err());
        assert!(validate_project_id("project@invalid").is_err());
    }

    #[test]
    fn test_message_validation() {
        let attrs = MessageAttributes::new();
        assert!(validate_message(b"hello", &attrs).is_ok());
        assert!(matches!(
            validate_message(b"", &attrs),
            Err(Error::Validation(ValidationError::EmptyMessage))
        ));

        let mut with_attr = MessageAttributes::new();
        with_attr.insert("k".to_string(), "v".to_string());
        assert!(validate_message(b"", &with_attr).is_ok());

        let large = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(validate_message(&large, &attrs).is_err());
    }

    #[test]
    fn test_ack_deadline_validation() {
        assert_eq!(validate_ack_deadline(10, false).unwrap(), 10);
        assert_eq!(validate_ack_deadline(600, false).unwrap(), 600);
        assert!(validate_ack_deadline(0, false).is_err());
        assert_eq!(validate_ack_deadline(0, true).unwrap(), 0);
        assert!(validate_ack_deadline(601, true).is_err());
        assert!(validate_ack_deadline(-1, true).is_err());
    }

    #[test]
    fn test_max_delivery_attempts_validation() {
        assert!(validate_max_delivery_attempts(5).is_ok());
        assert!(validate_max_delivery_attempts(100).is_ok());
        assert!(validate_max_delivery_attempts(4).is_err());
        assert!(validate_max_delivery_attempts(101).is_err());
    }
}
