//! Live captions for both sides of the conversation.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub role: Role,
    pub text: String,
    pub complete: bool,
    pub started_at: OffsetDateTime,
}

/// Ordered utterances. Streaming deltas extend the last open utterance of the
/// same role; anything else opens a new one.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    utterances: Vec<Utterance>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_delta(&mut self, role: Role, delta: &str) {
        if delta.is_empty() {
            return;
        }
        match self.utterances.last_mut() {
            Some(last) if last.role == role && !last.complete => last.text.push_str(delta),
            _ => self.utterances.push(Utterance {
                role,
                text: delta.to_string(),
                complete: false,
                started_at: OffsetDateTime::now_utc(),
            }),
        }
    }

    /// Record a finished utterance in one piece.
    ///
    /// When an open utterance of the same role exists, its text is replaced
    /// by the final version and it is closed.
    pub fn push_final(&mut self, role: Role, text: &str) {
        match self.utterances.last_mut() {
            Some(last) if last.role == role && !last.complete => {
                if !text.is_empty() {
                    last.text = text.to_string();
                }
                last.complete = true;
            }
            _ if text.is_empty() => {}
            _ => self.utterances.push(Utterance {
                role,
                text: text.to_string(),
                complete: true,
                started_at: OffsetDateTime::now_utc(),
            }),
        }
    }

    /// Close the last utterance, if open.
    pub fn mark_last_complete(&mut self) {
        if let Some(last) = self.utterances.last_mut() {
            last.complete = true;
        }
    }

    /// Close the most recent utterance of `role`, if it is still open.
    pub fn close_open(&mut self, role: Role) {
        if let Some(last) = self.utterances.iter_mut().rev().find(|u| u.role == role) {
            last.complete = true;
        }
    }

    pub fn utterances(&self) -> &[Utterance] {
        &self.utterances
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }

    pub fn clear(&mut self) {
        self.utterances.clear();
    }
}

impl std::fmt::Display for Transcript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for u in &self.utterances {
            writeln!(f, "[{}] {}", u.role, u.text)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deltas_merge_into_open_utterance() {
        let mut t = Transcript::new();
        t.append_delta(Role::Assistant, "Hel");
        t.append_delta(Role::Assistant, "lo");
        assert_eq!(t.len(), 1);
        assert_eq!(t.utterances()[0].text, "Hello");

        t.mark_last_complete();
        t.append_delta(Role::Assistant, "Again");
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_role_switch_opens_new_utterance() {
        let mut t = Transcript::new();
        t.append_delta(Role::Assistant, "Hi");
        t.push_final(Role::User, "hello there");
        t.append_delta(Role::Assistant, "Sure");
        let roles: Vec<Role> = t.utterances().iter().map(|u| u.role).collect();
        assert_eq!(roles, vec![Role::Assistant, Role::User, Role::Assistant]);
        assert!(t.utterances()[1].complete);
    }

    #[test]
    fn test_push_final_replaces_open_text() {
        let mut t = Transcript::new();
        t.append_delta(Role::Assistant, "Hel");
        t.push_final(Role::Assistant, "Hello.");
        assert_eq!(t.len(), 1);
        assert_eq!(t.utterances()[0].text, "Hello.");
        assert!(t.utterances()[0].complete);
        assert_eq!(t.to_string(), "[assistant] Hello.\n");
    }

    #[test]
    fn test_close_open_only_touches_that_role() {
        let mut t = Transcript::new();
        t.append_delta(Role::Assistant, "Hello, I am");
        t.append_delta(Role::User, "wait");
        t.close_open(Role::Assistant);
        assert!(t.utterances()[0].complete);
        assert!(!t.utterances()[1].complete);

        t.close_open(Role::User);
        t.append_delta(Role::Assistant, "Sure.");
        assert_eq!(t.len(), 3);
        assert_eq!(t.utterances()[2].text, "Sure.");
    }
}
