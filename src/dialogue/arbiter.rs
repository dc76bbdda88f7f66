//! Arbiter configuration, prompts and ruling parser.
//!
//! Each round the arbiter reads the reviewers' questions and answers with a
//! JSON ruling:
//!
//! ```json
//! {
//!   "sections": [{"name": "Methods", "body": "..."}],
//!   "resolved": [{"question": "r0-01", "query": "soil ph liming meta-analysis"}],
//!   "dropped": ["r0-02"],
//!   "notes": "why"
//! }
//! ```
//!
//! Question ids may be echoed with or without their session prefix
//! (`outline/r0-01` or `r0-01`); the session qualifies bare ids.

use serde::{Deserialize, Deserializer, Serialize};

use crate::draft::DraftArtifact;
use crate::transcript::QuestionId;
use crate::util::extract_json;

const DEFAULT_PERSONA: &str = "You are the lead author and arbiter of a multi-reviewer discussion. \
You decide which reviewer questions are in scope, which need literature support, \
and how the document's sections should change.";

/// How the session's arbiter behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbiterConfig {
    pub persona: String,
    /// Whether rulings may trigger literature searches. Off for polish sessions.
    pub allow_search: bool,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            persona: DEFAULT_PERSONA.to_string(),
            allow_search: true,
        }
    }
}

impl ArbiterConfig {
    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }

    pub fn with_search(mut self, allow: bool) -> Self {
        self.allow_search = allow;
        self
    }

    /// Arbiter for a session whose citations are frozen.
    pub fn frozen() -> Self {
        Self::default().with_search(false)
    }
}

/// Insert or replace a named section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionEdit {
    pub name: String,
    pub body: String,
}

/// A reviewer question the arbiter resolves with a literature query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub question: QuestionId,
    #[serde(default)]
    pub query: String,
}

/// One round's decision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterRuling {
    #[serde(deserialize_with = "sections_list_or_map")]
    pub sections: Vec<SectionEdit>,
    pub resolved: Vec<Resolution>,
    pub dropped: Vec<QuestionId>,
    pub notes: String,
}

/// Accept `[{"name", "body"}]` or `{"name": "body"}`.
fn sections_list_or_map<'de, D>(deserializer: D) -> Result<Vec<SectionEdit>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Sections {
        List(Vec<SectionEdit>),
        Map(std::collections::BTreeMap<String, String>),
    }

    Ok(match Sections::deserialize(deserializer)? {
        Sections::List(list) => list,
        Sections::Map(map) => map
            .into_iter()
            .map(|(name, body)| SectionEdit { name, body })
            .collect(),
    })
}

impl ArbiterRuling {
    pub fn is_noop(&self) -> bool {
        self.sections.is_empty() && self.resolved.is_empty() && self.dropped.is_empty()
    }

    /// One-line summary for transcript content and logs.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.sections.is_empty() {
            let names: Vec<_> = self.sections.iter().map(|s| s.name.as_str()).collect();
            parts.push(format!("edited: {}", names.join(", ")));
        }
        if !self.resolved.is_empty() {
            let ids: Vec<_> = self.resolved.iter().map(|r| r.question.as_str()).collect();
            parts.push(format!("resolving: {}", ids.join(", ")));
        }
        if !self.dropped.is_empty() {
            parts.push(format!("dropped: {}", self.dropped.join(", ")));
        }
        if parts.is_empty() {
            parts.push("no changes".to_string());
        }
        if !self.notes.trim().is_empty() {
            parts.push(self.notes.trim().to_string());
        }
        parts.join("; ")
    }
}

/// A reviewer question as shown to the arbiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenQuestion {
    pub id: QuestionId,
    pub reviewer: String,
    pub text: String,
}

/// Prompt for rounds 0..N-1.
pub fn build_round_prompt(
    topic: &str,
    round: u32,
    draft: &DraftArtifact,
    questions: &[OpenQuestion],
    allow_search: bool,
) -> String {
    let questions_section = if questions.is_empty() {
        "(no reviewer raised a question this round)".to_string()
    } else {
        questions
            .iter()
            .map(|q| format!("- [{}] ({}) {}", q.id, q.reviewer, q.text.trim()))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let search_rule = if allow_search {
        "For each in-scope question that needs supporting literature, add an entry to \"resolved\" \
         with the question id and a short search query."
    } else {
        "Citations are frozen for this session. Leave \"resolved\" empty."
    };

    format!(
        r#"# Arbiter Round {round}

Topic: {topic}

## Current draft
{draft}
## Reviewer questions
{questions_section}

## Instructions
1. Decide which questions are out of scope for this document and list their ids in "dropped".
2. {search_rule}
3. Add or rewrite sections in "sections" where the questions show the draft should change.

Respond with ONLY a JSON object in this exact format:

```json
{{
  "sections": [{{"name": "Section name", "body": "Full section text"}}],
  "resolved": [{{"question": "r0-01", "query": "search query"}}],
  "dropped": ["r0-02"],
  "notes": "Brief reasoning"
}}
```
"#,
        round = round,
        topic = topic,
        draft = draft.render(),
        questions_section = questions_section,
        search_rule = search_rule,
    )
}

/// Prompt for the final convergence round.
pub fn build_convergence_prompt(topic: &str, round: u32, draft: &DraftArtifact, unresolved: &[OpenQuestion]) -> String {
    let pending = if unresolved.is_empty() {
        "(none)".to_string()
    } else {
        unresolved
            .iter()
            .map(|q| format!("- [{}] {}", q.id, q.text.trim()))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"# Convergence (round {round})

Topic: {topic}

The discussion is over. Produce the final section edits that fold the debate into the document.

## Draft after all rounds
{draft}
## Questions still open
{pending}

Respond with ONLY a JSON object with "sections", "dropped" and "notes" (same format as before;
"resolved" must be empty).
"#,
        round = round,
        topic = topic,
        draft = draft.render(),
        pending = pending,
    )
}

/// Parse a ruling from a model response. `None` when no JSON object is present
/// or it does not match the ruling shape.
pub fn parse_ruling(response: &str) -> Option<ArbiterRuling> {
    let json_str = extract_json(response)?;
    let value: serde_json::Value = serde_json::from_str(&json_str).ok()?;
    if !value.is_object() {
        return None;
    }
    let mut ruling: ArbiterRuling = serde_json::from_value(value).ok()?;
    ruling.sections.retain(|s| !s.name.trim().is_empty());
    Some(ruling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::Section;

    // =========================================
    // Parsing
    // =========================================

    #[test]
    fn test_parse_full_ruling() {
        let response = r#"Here you go:
```json
{
  "sections": [{"name": "Methods", "body": "Use pH meters."}],
  "resolved": [{"question": "r0-01", "query": "soil ph meters"}],
  "dropped": ["r0-02"],
  "notes": "Q2 is off-topic"
}
```"#;
        let ruling = parse_ruling(response).unwrap();
        assert_eq!(ruling.sections[0].name, "Methods");
        assert_eq!(ruling.resolved[0].query, "soil ph meters");
        assert_eq!(ruling.dropped, vec!["r0-02"]);
        assert_eq!(ruling.notes, "Q2 is off-topic");
    }

    #[test]
    fn test_parse_sections_as_map() {
        let ruling = parse_ruling(r#"{"sections": {"Intro": "a", "Abstract": "b"}}"#).unwrap();
        let names: Vec<_> = ruling.sections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Abstract", "Intro"]);
    }

    #[test]
    fn test_parse_missing_fields_default() {
        let ruling = parse_ruling(r#"{"notes": "nothing to do"}"#).unwrap();
        assert!(ruling.is_noop());
        assert_eq!(ruling.summary(), "no changes; nothing to do");
    }

    #[test]
    fn test_parse_resolution_without_query() {
        let ruling = parse_ruling(r#"{"resolved": [{"question": "r1-02"}]}"#).unwrap();
        assert_eq!(ruling.resolved[0].query, "");
    }

    #[test]
    fn test_parse_rejects_prose_and_bad_shapes() {
        assert!(parse_ruling("I think the outline is fine.").is_none());
        assert!(parse_ruling(r#"{"sections": 42}"#).is_none());
        assert!(parse_ruling(r#"{"dropped": "r0-01"}"#).is_none());
    }

    #[test]
    fn test_parse_drops_unnamed_sections() {
        let ruling = parse_ruling(r#"{"sections": [{"name": " ", "body": "x"}]}"#).unwrap();
        assert!(ruling.sections.is_empty());
    }

    // =========================================
    // Prompts
    // =========================================

    #[test]
    fn test_round_prompt_lists_questions() {
        let draft = DraftArtifact::seed("Soil", vec![Section::new("Intro", "x")]);
        let questions = vec![OpenQuestion {
            id: "r0-01".into(),
            reviewer: "reviewer-01-theoretical".into(),
            text: "What is pH?".into(),
        }];
        let prompt = build_round_prompt("soil acidity", 0, &draft, &questions, true);
        assert!(prompt.contains("# Arbiter Round 0"));
        assert!(prompt.contains("- [r0-01] (reviewer-01-theoretical) What is pH?"));
        assert!(prompt.contains("## Intro"));
        assert!(prompt.contains("short search query"));
    }

    #[test]
    fn test_round_prompt_frozen_citations() {
        let draft = DraftArtifact::seed("Soil", vec![]);
        let prompt = build_round_prompt("t", 1, &draft, &[], false);
        assert!(prompt.contains("Citations are frozen"));
        assert!(prompt.contains("no reviewer raised a question"));
    }

    #[test]
    fn test_convergence_prompt() {
        let draft = DraftArtifact::seed("Soil", vec![]);
        let prompt = build_convergence_prompt("t", 2, &draft, &[]);
        assert!(prompt.contains("Convergence (round 2)"));
        assert!(prompt.contains("(none)"));
    }

    #[test]
    fn test_frozen_config() {
        assert!(ArbiterConfig::default().allow_search);
        assert!(!ArbiterConfig::frozen().allow_search);
        let cfg = ArbiterConfig::default().with_persona("p");
        assert_eq!(cfg.persona, "p");
    }
}
