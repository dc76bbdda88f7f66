//! Convergence: fold a dialogue transcript into one finished draft.
//!
//! Pure and deterministic. The same transcript, seed draft and reference set
//! always produce the same artifact, so a session can be replayed from its
//! archived transcript.

use std::collections::HashSet;

use crate::draft::DraftArtifact;
use crate::references::ReferenceSet;
use crate::transcript::Transcript;

/// Merge every arbiter ruling in `transcript` into a new version of `seed`.
///
/// - Section edits apply in round order, so when two rounds touch the same
///   section the later one wins.
/// - A question resolved in any round is cited with its papers from
///   `references`, unless it was also dropped.
/// - Dropped questions leave nothing in the artifact. They stay in the
///   transcript for audit.
pub fn resolve(transcript: &Transcript, seed: &DraftArtifact, references: &ReferenceSet) -> DraftArtifact {
    let mut draft = seed.next_version();

    let dropped: HashSet<&str> = transcript
        .rulings()
        .flat_map(|(_, ruling)| ruling.dropped.iter().map(String::as_str))
        .collect();

    for (_round, ruling) in transcript.rulings() {
        for edit in &ruling.sections {
            draft.upsert_section(&edit.name, edit.body.clone());
        }
        for resolution in &ruling.resolved {
            if dropped.contains(resolution.question.as_str()) {
                continue;
            }
            draft.cite(
                resolution.question.clone(),
                references.papers_for(&resolution.question),
            );
        }
    }

    draft
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentId, AgentRole};
    use crate::dialogue::arbiter::{ArbiterRuling, Resolution, SectionEdit};
    use crate::draft::Section;
    use crate::references::PaperRecord;
    use crate::transcript::{Message, Payload};

    fn ruling_message(round: u32, ruling: ArbiterRuling) -> Message {
        Message::text(AgentId(u32::MAX), "arbiter", AgentRole::Arbiter, round, ruling.summary())
            .with_payload(Payload::Ruling(ruling))
    }

    fn edit(name: &str, body: &str) -> SectionEdit {
        SectionEdit {
            name: name.into(),
            body: body.into(),
        }
    }

    fn seed() -> DraftArtifact {
        DraftArtifact::seed("Soil", vec![Section::new("Intro", "seed intro")])
    }

    #[test]
    fn test_later_round_wins_same_section() {
        let mut t = Transcript::new("outline");
        t.push(ruling_message(0, ArbiterRuling {
            sections: vec![edit("Methods", "first version")],
            ..Default::default()
        }))
        .unwrap();
        t.push(ruling_message(1, ArbiterRuling {
            sections: vec![edit("methods", "second version")],
            ..Default::default()
        }))
        .unwrap();

        let out = resolve(&t, &seed(), &ReferenceSet::new());
        let rendered = out.render();
        assert!(rendered.contains("second version"));
        assert!(!rendered.contains("first version"));
        assert_eq!(out.sections.len(), 2);
    }

    #[test]
    fn test_resolution_cites_papers_and_drop_removes() {
        let mut refs = ReferenceSet::new();
        refs.resolve("r0-01", vec![PaperRecord::new("p1", "Liming", vec![], "")]);
        refs.resolve("r0-02", vec![PaperRecord::new("p2", "Off topic", vec![], "")]);

        let mut t = Transcript::new("outline");
        t.push(ruling_message(0, ArbiterRuling {
            resolved: vec![
                Resolution { question: "r0-01".into(), query: "liming".into() },
                Resolution { question: "r0-02".into(), query: "x".into() },
            ],
            ..Default::default()
        }))
        .unwrap();
        t.push(ruling_message(1, ArbiterRuling {
            dropped: vec!["r0-02".into()],
            ..Default::default()
        }))
        .unwrap();

        let out = resolve(&t, &seed(), &refs);
        assert_eq!(out.citations.len(), 1);
        assert_eq!(out.citations[0].question, "r0-01");
        assert!(!out.render().contains("Off topic"));
    }

    #[test]
    fn test_unresolved_question_not_cited() {
        let mut t = Transcript::new("outline");
        t.push(ruling_message(0, ArbiterRuling {
            resolved: vec![Resolution { question: "r0-01".into(), query: "q".into() }],
            ..Default::default()
        }))
        .unwrap();
        let out = resolve(&t, &seed(), &ReferenceSet::new());
        assert!(out.citations.is_empty());
    }

    #[test]
    fn test_resolve_is_deterministic_and_versioned() {
        let mut t = Transcript::new("outline");
        t.push(ruling_message(0, ArbiterRuling {
            sections: vec![edit("Intro", "new intro"), edit("Results", "r")],
            ..Default::default()
        }))
        .unwrap();
        let seed = seed();
        let refs = ReferenceSet::new();
        let a = resolve(&t, &seed, &refs);
        let b = resolve(&t, &seed, &refs);
        assert_eq!(a, b);
        assert_eq!(a.render().as_bytes(), b.render().as_bytes());
        assert_eq!(a.parent, Some(seed.version));
        assert_eq!(seed.section("Intro").unwrap().body, "seed intro");
    }

    #[test]
    fn test_empty_transcript_yields_next_version_of_seed() {
        let seed = seed();
        let out = resolve(&Transcript::new("s"), &seed, &ReferenceSet::new());
        assert_eq!(out.sections, seed.sections);
        assert_eq!(out.version, seed.version + 1);
    }
}
