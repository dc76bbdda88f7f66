//! Append-only, totally ordered record of a dialogue.
//!
//! Messages are ordered by `(round, turn rank, sender id)`. Reviewers (and
//! writers) speak before the arbiter (or code reviewer) within a round, and
//! same-rank agents speak in id order no matter when their calls finished.

use serde::{Deserialize, Serialize};

use crate::agent::{AgentId, AgentRole};
use crate::dialogue::arbiter::ArbiterRuling;
use crate::errors::TranscriptError;

/// Reviewer question identifier, `{session}/r{round}-{agent id}`.
///
/// The session prefix keeps ids unique across sessions that share one
/// reference set (outline and polish).
pub type QuestionId = String;

pub fn question_id(session: &str, round: u32, agent: AgentId) -> QuestionId {
    format!("{}/r{}-{}", session, round, agent)
}

/// Qualify an id the arbiter echoed without its session prefix.
pub fn qualify_question_id(session: &str, id: &str) -> QuestionId {
    let id = id.trim();
    if id.contains('/') {
        id.to_string()
    } else {
        format!("{}/{}", session, id)
    }
}

/// Structured content attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Question { id: QuestionId, text: String },
    Critique { id: QuestionId, text: String },
    Ruling(ArbiterRuling),
    Code { source: String },
    Verdict { approved: bool, feedback: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: AgentId,
    pub sender_name: String,
    pub role: AgentRole,
    pub round: u32,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    /// Set when the sender's invocation failed and this message is a no-op.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    pub fn text(
        sender: AgentId,
        sender_name: impl Into<String>,
        role: AgentRole,
        round: u32,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sender,
            sender_name: sender_name.into(),
            role,
            round,
            content: content.into(),
            payload: None,
            error: None,
        }
    }

    /// Placeholder for a failed invocation: empty content, error recorded.
    pub fn empty(
        sender: AgentId,
        sender_name: impl Into<String>,
        role: AgentRole,
        round: u32,
        error: impl Into<String>,
    ) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::text(sender, sender_name, role, round, "")
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.payload.is_none()
    }

    fn order_key(&self) -> (u32, u8, AgentId) {
        (self.round, self.role.turn_rank(), self.sender)
    }
}

/// Append-only message log owned by one session or loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    session: String,
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            messages: Vec::new(),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Append a message. Its order key must sort strictly after the last one.
    pub fn push(&mut self, message: Message) -> Result<(), TranscriptError> {
        if let Some(last) = self.messages.last()
            && message.order_key() <= last.order_key()
        {
            return Err(TranscriptError::OutOfOrder {
                sender: message.sender_name,
                round: message.round,
            });
        }
        self.messages.push(message);
        Ok(())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn round(&self, round: u32) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(move |m| m.round == round)
    }

    /// Arbiter rulings in round order.
    pub fn rulings(&self) -> impl Iterator<Item = (u32, &ArbiterRuling)> {
        self.messages.iter().filter_map(|m| match &m.payload {
            Some(Payload::Ruling(ruling)) => Some((m.round, ruling)),
            _ => None,
        })
    }

    /// Number of distinct rounds in which `role` authored at least one message.
    pub fn rounds_authored_by(&self, role: AgentRole) -> usize {
        let mut rounds: Vec<u32> = self
            .messages
            .iter()
            .filter(|m| m.role == role)
            .map(|m| m.round)
            .collect();
        rounds.dedup();
        rounds.len()
    }

    /// Questions and critiques raised by reviewers, in transcript order.
    pub fn questions(&self) -> impl Iterator<Item = (&QuestionId, &str)> {
        self.messages.iter().filter_map(|m| match &m.payload {
            Some(Payload::Question { id, text }) | Some(Payload::Critique { id, text }) => {
                Some((id, text.as_str()))
            }
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reviewer(id: u32, round: u32, text: &str) -> Message {
        Message::text(AgentId(id), format!("reviewer-{id}"), AgentRole::Reviewer, round, text)
    }

    fn arbiter(round: u32) -> Message {
        Message::text(AgentId(u32::MAX), "arbiter", AgentRole::Arbiter, round, "ok")
            .with_payload(Payload::Ruling(ArbiterRuling::default()))
    }

    #[test]
    fn test_push_in_order() {
        let mut t = Transcript::new("outline");
        t.push(reviewer(1, 0, "a")).unwrap();
        t.push(reviewer(2, 0, "b")).unwrap();
        t.push(arbiter(0)).unwrap();
        t.push(reviewer(1, 1, "c")).unwrap();
        assert_eq!(t.len(), 4);
        assert_eq!(t.round(0).count(), 3);
    }

    #[test]
    fn test_push_rejects_out_of_order() {
        let mut t = Transcript::new("outline");
        t.push(reviewer(2, 0, "b")).unwrap();
        let err = t.push(reviewer(1, 0, "a")).unwrap_err();
        assert_eq!(
            err,
            TranscriptError::OutOfOrder {
                sender: "reviewer-1".to_string(),
                round: 0
            }
        );
        // Reviewer after the arbiter in the same round is also rejected.
        t.push(arbiter(0)).unwrap();
        assert!(t.push(reviewer(3, 0, "late")).is_err());
        // Duplicate key.
        assert!(t.push(arbiter(0)).is_err());
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_rounds_authored_by() {
        let mut t = Transcript::new("s");
        t.push(reviewer(1, 0, "a")).unwrap();
        t.push(reviewer(2, 0, "b")).unwrap();
        t.push(arbiter(0)).unwrap();
        t.push(arbiter(1)).unwrap();
        assert_eq!(t.rounds_authored_by(AgentRole::Reviewer), 1);
        assert_eq!(t.rounds_authored_by(AgentRole::Arbiter), 2);
        assert_eq!(t.rulings().map(|(r, _)| r).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_empty_message_keeps_slot() {
        let m = Message::empty(AgentId(4), "reviewer-4", AgentRole::Reviewer, 2, "timeout");
        assert!(m.is_empty());
        assert_eq!(m.error.as_deref(), Some("timeout"));
        assert_eq!(m.round, 2);
    }

    #[test]
    fn test_question_id_format() {
        assert_eq!(question_id("outline", 1, AgentId(3)), "outline/r1-03");
    }

    #[test]
    fn test_qualify_question_id() {
        assert_eq!(qualify_question_id("polish", "r0-01"), "polish/r0-01");
        assert_eq!(qualify_question_id("polish", " outline/r0-01 "), "outline/r0-01");
    }

    #[test]
    fn test_questions_iterates_payloads() {
        let mut t = Transcript::new("s");
        t.push(reviewer(1, 0, "Why?").with_payload(Payload::Question {
            id: question_id("s", 0, AgentId(1)),
            text: "Why?".into(),
        }))
        .unwrap();
        t.push(reviewer(2, 0, "Weak.").with_payload(Payload::Critique {
            id: question_id("s", 0, AgentId(2)),
            text: "Weak.".into(),
        }))
        .unwrap();
        let ids: Vec<_> = t.questions().map(|(id, _)| id.clone()).collect();
        assert_eq!(ids, vec!["s/r0-01", "s/r0-02"]);
    }

    #[test]
    fn test_transcript_serde_roundtrip_keeps_payload() {
        let mut t = Transcript::new("polish");
        t.push(arbiter(0)).unwrap();
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("\"type\":\"ruling\""));
        let back: Transcript = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}
