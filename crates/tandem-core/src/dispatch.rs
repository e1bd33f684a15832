use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationMessage {
    pub id: String,
    pub role: Role,
}

impl ConversationMessage {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ActiveTask,
    EmptyConversation,
    NoNewMessages,
    NoUserMessages,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::ActiveTask => "active-task",
            SkipReason::EmptyConversation => "empty-conversation",
            SkipReason::NoNewMessages => "no-new-messages",
            SkipReason::NoUserMessages => "no-user-messages",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchDecision {
    Dispatch {
        last_user_message: ConversationMessage,
        /// Index of `last_user_message` in the full conversation.
        index: usize,
    },
    Skip(SkipReason),
}

/// Decides whether a new agent run should start for a conversation.
///
/// Rules are checked in order and the first match wins. The latest user
/// message in the unprocessed tail triggers dispatch even when assistant
/// messages follow it. Deduplicating repeated dispatch of the same turn is
/// left to the caller.
pub fn evaluate(
    conversation: &[ConversationMessage],
    last_processed_index: i64,
    is_task_active: bool,
) -> DispatchDecision {
    if is_task_active {
        return DispatchDecision::Skip(SkipReason::ActiveTask);
    }
    if conversation.is_empty() {
        return DispatchDecision::Skip(SkipReason::EmptyConversation);
    }
    let Ok(start) = usize::try_from(last_processed_index) else {
        return DispatchDecision::Skip(SkipReason::NoNewMessages);
    };
    if conversation.len() <= start {
        return DispatchDecision::Skip(SkipReason::NoNewMessages);
    }

    let tail = &conversation[start..];
    match tail.iter().rposition(|message| message.role == Role::User) {
        Some(offset) => DispatchDecision::Dispatch {
            last_user_message: tail[offset].clone(),
            index: start + offset,
        },
        None => DispatchDecision::Skip(SkipReason::NoUserMessages),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> ConversationMessage {
        ConversationMessage::new(id, Role::User)
    }

    fn assistant(id: &str) -> ConversationMessage {
        ConversationMessage::new(id, Role::Assistant)
    }

    #[test]
    fn single_user_message_dispatches() {
        let conversation = vec![user("A")];
        assert_eq!(
            evaluate(&conversation, 0, false),
            DispatchDecision::Dispatch {
                last_user_message: user("A"),
                index: 0,
            }
        );
    }

    #[test]
    fn empty_conversation_skips() {
        assert_eq!(
            evaluate(&[], 0, false),
            DispatchDecision::Skip(SkipReason::EmptyConversation)
        );
    }

    #[test]
    fn fully_processed_conversation_skips() {
        let conversation = vec![user("A"), assistant("B")];
        assert_eq!(
            evaluate(&conversation, 2, false),
            DispatchDecision::Skip(SkipReason::NoNewMessages)
        );
        assert_eq!(
            evaluate(&conversation, 7, false),
            DispatchDecision::Skip(SkipReason::NoNewMessages)
        );
    }

    #[test]
    fn assistant_only_tail_skips() {
        let conversation = vec![user("A"), assistant("B"), assistant("C")];
        assert_eq!(
            evaluate(&conversation, 1, false),
            DispatchDecision::Skip(SkipReason::NoUserMessages)
        );
    }

    #[test]
    fn trailing_stale_assistant_does_not_block() {
        let conversation = vec![user("A"), assistant("B"), user("C"), assistant("D")];
        assert_eq!(
            evaluate(&conversation, 2, false),
            DispatchDecision::Dispatch {
                last_user_message: user("C"),
                index: 2,
            }
        );
    }

    #[test]
    fn latest_user_message_in_tail_wins() {
        let conversation = vec![user("A"), user("B"), assistant("C"), user("D")];
        let decision = evaluate(&conversation, 0, false);
        assert_eq!(
            decision,
            DispatchDecision::Dispatch {
                last_user_message: user("D"),
                index: 3,
            }
        );
    }

    #[test]
    fn active_task_always_skips() {
        let cases: Vec<(Vec<ConversationMessage>, i64)> = vec![
            (vec![], 0),
            (vec![user("A")], 0),
            (vec![user("A"), assistant("B")], 2),
            (vec![assistant("A")], -4),
        ];
        for (conversation, index) in cases {
            assert_eq!(
                evaluate(&conversation, index, true),
                DispatchDecision::Skip(SkipReason::ActiveTask)
            );
        }
    }

    #[test]
    fn negative_index_is_no_new_messages() {
        let conversation = vec![user("A")];
        assert_eq!(
            evaluate(&conversation, -1, false),
            DispatchDecision::Skip(SkipReason::NoNewMessages)
        );
    }

    #[test]
    fn reasons_render_as_wire_strings() {
        assert_eq!(SkipReason::ActiveTask.to_string(), "active-task");
        assert_eq!(SkipReason::EmptyConversation.as_str(), "empty-conversation");
        assert_eq!(SkipReason::NoNewMessages.as_str(), "no-new-messages");
        assert_eq!(SkipReason::NoUserMessages.as_str(), "no-user-messages");
    }
}
