//! Chat message types and per-endpoint message combination
//!
//! Endpoints can be configured with prefix messages that are prepended to the
//! caller's conversation before an attempt is dispatched. Combination must
//! preserve a valid role sequence.

use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};

/// Message role in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    role: Role,
    content: String,
}

impl ChatMessage {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Convenience constructor for a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Convenience constructor for a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Convenience constructor for an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Get the role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Get the content
    pub fn content(&self) -> &str {
        &self.content
    }
}

/// Combine endpoint prefix messages with the caller's messages
///
/// The system slot is filled by the first system message among the endpoint's
/// prefix messages; the caller's own system message is used only when the
/// endpoint has none. Non-system prefix messages come next, then the caller's
/// non-system messages, all in their original order.
///
/// The combined sequence is validated before it is returned.
pub fn combine(prefix: &[ChatMessage], user: &[ChatMessage]) -> RelayResult<Vec<ChatMessage>> {
    let mut combined = Vec::with_capacity(prefix.len() + user.len());

    let prefix_system = prefix.iter().find(|m| m.role() == Role::System);
    let system = prefix_system.or_else(|| user.iter().find(|m| m.role() == Role::System));
    if let Some(system) = system {
        combined.push(system.clone());
    }

    combined.extend(prefix.iter().filter(|m| m.role() != Role::System).cloned());
    combined.extend(user.iter().filter(|m| m.role() != Role::System).cloned());

    validate_sequence(&combined)?;
    Ok(combined)
}

/// Validate the message sequence invariant
///
/// The sequence must contain at most one system message which, if present,
/// is first, and must never start with an assistant message.
pub fn validate_sequence(messages: &[ChatMessage]) -> RelayResult<()> {
    let system_count = messages.iter().filter(|m| m.role() == Role::System).count();
    if system_count > 1 {
        return Err(RelayError::InvalidMessageSequence(format!(
            "found {} system messages, at most one is allowed",
            system_count
        )));
    }

    match messages.first() {
        Some(first) if first.role() == Role::Assistant => {
            return Err(RelayError::InvalidMessageSequence(
                "conversation cannot start with an assistant message".to_string(),
            ));
        }
        Some(_) | None => {}
    }

    if system_count == 1 && messages[0].role() != Role::System {
        return Err(RelayError::InvalidMessageSequence(
            "system message must be first in the conversation".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_empty_prefix_is_identity() {
        let user = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        let combined = combine(&[], &user).expect("should combine");
        assert_eq!(combined, user);
    }

    #[test]
    fn test_combine_empty_prefix_preserves_user_system() {
        let user = vec![ChatMessage::system("be brief"), ChatMessage::user("hi")];
        let combined = combine(&[], &user).expect("should combine");
        assert_eq!(combined, user);
    }

    #[test]
    fn test_combine_prefix_system_wins() {
        let prefix = vec![ChatMessage::system("endpoint persona")];
        let user = vec![ChatMessage::system("user persona"), ChatMessage::user("hi")];

        let combined = combine(&prefix, &user).expect("should combine");

        assert_eq!(combined.len(), 2);
        assert_eq!(combined[0].role(), Role::System);
        assert_eq!(combined[0].content(), "endpoint persona");
        assert_eq!(combined[1].content(), "hi");
    }

    #[test]
    fn test_combine_orders_prefix_before_user() {
        let prefix = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("example question"),
            ChatMessage::assistant("example answer"),
        ];
        let user = vec![ChatMessage::user("real question")];

        let combined = combine(&prefix, &user).expect("should combine");

        let contents: Vec<&str> = combined.iter().map(|m| m.content()).collect();
        assert_eq!(
            contents,
            vec!["sys", "example question", "example answer", "real question"]
        );
    }

    #[test]
    fn test_combine_rejects_leading_assistant() {
        let prefix = vec![ChatMessage::assistant("I speak first")];
        let user = vec![ChatMessage::user("hi")];

        let err = combine(&prefix, &user).unwrap_err();
        assert!(matches!(err, RelayError::InvalidMessageSequence(_)));
    }

    #[test]
    fn test_validate_rejects_multiple_system() {
        let messages = vec![
            ChatMessage::system("a"),
            ChatMessage::user("hi"),
            ChatMessage::system("b"),
        ];
        assert!(validate_sequence(&messages).is_err());
    }

    #[test]
    fn test_validate_rejects_misplaced_system() {
        let messages = vec![ChatMessage::user("hi"), ChatMessage::system("late")];
        assert!(validate_sequence(&messages).is_err());
    }

    #[test]
    fn test_validate_accepts_empty() {
        assert!(validate_sequence(&[]).is_ok());
    }

    #[test]
    fn test_roles_serialize_lowercase() {
        let msg = ChatMessage::user("hi");
        let json = serde_json::to_string(&msg).expect("should serialize");
        assert_eq!(json, r#"{"role":"user","content":"hi"}"#);
    }
}
