//! Seed drafting: one expert call that proposes the first outline and the
//! reviewer perspectives.

use serde::Deserialize;

use crate::agent::{Agent, AgentId, AgentRole, Perspective, PerspectiveKind, fill_perspectives};
use crate::capability::LanguageModel;
use crate::draft::{DraftArtifact, Section};
use crate::errors::StageError;
use crate::util::extract_json;

const EXPERT_PERSONA: &str = "You are a senior researcher planning a paper. You propose a clear section \
outline and the distinct expert perspectives that should review it.";

/// Seed outline plus the perspectives for the reviewer agents.
#[derive(Debug, Clone)]
pub struct SeedDraft {
    pub draft: DraftArtifact,
    pub perspectives: Vec<Perspective>,
}

#[derive(Debug, Deserialize)]
struct SeedJson {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    sections: Vec<SeedSection>,
    #[serde(default)]
    perspectives: Vec<SeedPerspective>,
}

#[derive(Debug, Deserialize)]
struct SeedSection {
    name: String,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct SeedPerspective {
    label: String,
    #[serde(default)]
    description: String,
}

pub fn build_seed_prompt(topic: &str, context: Option<&str>, count: usize) -> String {
    let context_section = context
        .map(|ctx| format!("\n## Background material\n{}\n", ctx))
        .unwrap_or_default();

    format!(
        r#"# Seed Outline

Topic: {topic}
{context_section}
Propose a draft outline for a paper on this topic, with a short description of what each
section should cover, and {count} distinct expert perspectives (for example theoretical,
methodological, empirical) that should question the outline.

Respond with ONLY a JSON object in this exact format:

```json
{{
  "title": "Working title",
  "sections": [{{"name": "Introduction", "body": "What this section covers"}}],
  "perspectives": [{{"label": "Methodological", "description": "What this reviewer focuses on"}}]
}}
```
"#,
        topic = topic,
        context_section = context_section,
        count = count,
    )
}

/// Parse the expert's reply into a seed draft and its proposed perspectives.
pub fn parse_seed(topic: &str, response: &str) -> Result<(DraftArtifact, Vec<Perspective>), StageError> {
    let json = extract_json(response).ok_or_else(|| StageError::SeedParse("no JSON object found".to_string()))?;
    let seed: SeedJson = serde_json::from_str(&json).map_err(|e| StageError::SeedParse(e.to_string()))?;

    let sections: Vec<Section> = seed
        .sections
        .into_iter()
        .filter(|s| !s.name.trim().is_empty())
        .map(|s| Section::new(s.name.trim(), s.body))
        .collect();
    if sections.is_empty() {
        return Err(StageError::SeedParse("outline has no sections".to_string()));
    }

    let title = seed
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| topic.to_string());
    let perspectives = seed
        .perspectives
        .into_iter()
        .filter(|p| !p.label.trim().is_empty())
        .map(|p| Perspective::new(p.label.trim(), p.description))
        .collect();

    Ok((DraftArtifact::seed(title, sections), perspectives))
}

/// Resolve the final perspective list.
///
/// Configured labels win over generated ones; a generated perspective with
/// the same label lends its description. The result is padded from the
/// built-in catalogue or truncated to `count`.
pub fn choose_perspectives(generated: Vec<Perspective>, labels: &[String], count: usize) -> Vec<Perspective> {
    let chosen = if labels.is_empty() {
        generated
    } else {
        labels
            .iter()
            .map(|label| {
                generated
                    .iter()
                    .find(|p| p.label().eq_ignore_ascii_case(label.trim()))
                    .cloned()
                    .unwrap_or_else(|| {
                        let kind: PerspectiveKind = label.parse().unwrap_or(PerspectiveKind::Custom(label.clone()));
                        Perspective::from_kind(&kind)
                    })
            })
            .collect()
    };
    fill_perspectives(chosen, count)
}

pub async fn draft_seed(
    model: &dyn LanguageModel,
    topic: &str,
    context: Option<&str>,
    count: usize,
    labels: &[String],
) -> Result<SeedDraft, StageError> {
    let expert = Agent::new(AgentId(0), AgentRole::Arbiter, "expert", EXPERT_PERSONA);
    let response = expert
        .invoke(model, build_seed_prompt(topic, context, count))
        .await
        .map_err(StageError::SeedDraft)?;

    let (draft, generated) = parse_seed(topic, &response)?;
    let perspectives = choose_perspectives(generated, labels, count);
    tracing::info!(
        sections = draft.sections.len(),
        perspectives = perspectives.len(),
        "seed outline drafted"
    );
    Ok(SeedDraft { draft, perspectives })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seed() {
        let response = r#"```json
{"title": "Soil pH", "sections": [{"name": "Intro", "body": "why"}, {"name": "", "body": "x"}],
 "perspectives": [{"label": "Agronomy", "description": "farm practice"}]}
```"#;
        let (draft, perspectives) = parse_seed("topic", response).unwrap();
        assert_eq!(draft.title, "Soil pH");
        assert_eq!(draft.sections.len(), 1);
        assert_eq!(draft.version, 1);
        assert_eq!(perspectives[0].label(), "Agronomy");
    }

    #[test]
    fn test_parse_seed_defaults_title_to_topic() {
        let (draft, perspectives) = parse_seed("soil", r#"{"sections": [{"name": "Intro"}]}"#).unwrap();
        assert_eq!(draft.title, "soil");
        assert!(perspectives.is_empty());
    }

    #[test]
    fn test_parse_seed_errors() {
        assert!(matches!(parse_seed("t", "no json"), Err(StageError::SeedParse(_))));
        assert!(matches!(parse_seed("t", r#"{"sections": []}"#), Err(StageError::SeedParse(_))));
    }

    #[test]
    fn test_choose_perspectives_pads_generated() {
        let generated = vec![Perspective::new("Agronomy", "farms")];
        let chosen = choose_perspectives(generated, &[], 3);
        assert_eq!(chosen.len(), 3);
        assert_eq!(chosen[0].label(), "Agronomy");
        assert_eq!(chosen[1].label(), "Theoretical");
    }

    #[test]
    fn test_choose_perspectives_labels_override() {
        let generated = vec![
            Perspective::new("Agronomy", "farms"),
            Perspective::new("Economics", "costs"),
        ];
        let labels = vec!["economics".to_string(), "methods".to_string()];
        let chosen = choose_perspectives(generated, &labels, 2);
        assert_eq!(chosen[0].label(), "Economics");
        assert_eq!(chosen[0].description(), "costs");
        assert_eq!(chosen[1].label(), "Methodological");
    }

    #[test]
    fn test_seed_prompt_mentions_count_and_context() {
        let prompt = build_seed_prompt("soil", Some("notes here"), 4);
        assert!(prompt.contains("and 4 distinct expert perspectives"));
        assert!(prompt.contains("## Background material\nnotes here"));
    }
}
