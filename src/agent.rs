//! Agents and the perspectives that shape them.
//!
//! An [`Agent`] is a stateful role wrapper around the language model: it owns
//! a persona and the ordered messages it has seen or sent. Agents are created
//! by a dialogue session or code loop and dropped when it ends.
//!
//! ## Perspectives
//!
//! Each reviewer agent is assigned one [`Perspective`]. The built-in catalogue
//! ([`PerspectiveKind`]) is used to fill in perspectives the seed draft did not
//! supply; any other label becomes [`PerspectiveKind::Custom`].
//!
//! ```
//! use colloquy::agent::{Perspective, PerspectiveKind};
//!
//! let p = Perspective::from_kind(&PerspectiveKind::Methodological);
//! assert_eq!(p.label(), "Methodological");
//! assert!(p.description().contains("study design"));
//!
//! let kind: PerspectiveKind = "ethics".parse().unwrap();
//! assert_eq!(kind, PerspectiveKind::Custom("ethics".to_string()));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::capability::{HistoryTurn, LanguageModel, ModelRequest};
use crate::errors::CapabilityError;
use crate::transcript::Message;

/// Built-in perspective types for reviewer agents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerspectiveKind {
    /// Conceptual framing, prior theory and definitions.
    Theoretical,
    /// Study design, data collection and analysis choices.
    Methodological,
    /// Evidence, datasets and reproducibility.
    Empirical,
    /// Practical applications and stakeholders.
    Applied,
    /// Limitations, threats to validity and counter-arguments.
    Critical,
    /// Any other label.
    Custom(String),
}

impl PerspectiveKind {
    pub fn display_name(&self) -> &str {
        match self {
            Self::Theoretical => "Theoretical",
            Self::Methodological => "Methodological",
            Self::Empirical => "Empirical",
            Self::Applied => "Applied",
            Self::Critical => "Critical",
            Self::Custom(name) => name,
        }
    }

    /// Default questioning angle for the built-in kinds. Custom kinds have none.
    pub fn focus_areas(&self) -> Vec<&'static str> {
        match self {
            Self::Theoretical => vec![
                "core definitions and terminology",
                "competing theoretical frameworks",
                "how the contribution relates to prior theory",
            ],
            Self::Methodological => vec![
                "study design and its justification",
                "data collection and sampling",
                "choice of analysis methods",
                "qualitative versus quantitative trade-offs",
            ],
            Self::Empirical => vec![
                "supporting evidence for each claim",
                "datasets and benchmarks",
                "reproducibility of results",
            ],
            Self::Applied => vec![
                "real-world applications",
                "stakeholders and impact",
                "deployment constraints",
            ],
            Self::Critical => vec![
                "limitations and threats to validity",
                "counter-arguments and alternative explanations",
                "open research gaps and future work",
            ],
            Self::Custom(_) => vec![],
        }
    }

    /// All built-in kinds in catalogue order.
    pub fn all_builtins() -> Vec<Self> {
        vec![
            Self::Theoretical,
            Self::Methodological,
            Self::Empirical,
            Self::Applied,
            Self::Critical,
        ]
    }
}

impl fmt::Display for PerspectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl FromStr for PerspectiveKind {
    type Err = std::convert::Infallible;

    /// Recognizes common aliases; anything else becomes `Custom`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "theoretical" | "theory" => Self::Theoretical,
            "methodological" | "methodology" | "methods" => Self::Methodological,
            "empirical" | "evidence" => Self::Empirical,
            "applied" | "application" | "applications" | "practical" => Self::Applied,
            "critical" | "critique" | "limitations" => Self::Critical,
            _ => Self::Custom(s.trim().to_string()),
        })
    }
}

/// A named viewpoint assigned to one reviewer agent. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Perspective {
    label: String,
    description: String,
}

impl Perspective {
    pub fn new(label: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            description: description.into(),
        }
    }

    /// Build a perspective from a catalogue kind, describing it by its focus areas.
    pub fn from_kind(kind: &PerspectiveKind) -> Self {
        let areas = kind.focus_areas();
        let description = if areas.is_empty() {
            format!("Review the work from the {} perspective.", kind.display_name())
        } else {
            format!("Question the work on {}.", areas.join(", "))
        };
        Self::new(kind.display_name(), description)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Lowercase, hyphenated label for agent names.
    pub fn slug(&self) -> String {
        self.label
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("-")
    }
}

/// Pad `perspectives` to `count` entries from the built-in catalogue, skipping
/// labels already present, then truncate to `count`.
pub fn fill_perspectives(mut perspectives: Vec<Perspective>, count: usize) -> Vec<Perspective> {
    let mut catalogue = PerspectiveKind::all_builtins().into_iter().cycle().enumerate();
    while perspectives.len() < count {
        let Some((i, kind)) = catalogue.next() else {
            break;
        };
        let candidate = Perspective::from_kind(&kind);
        let taken = perspectives
            .iter()
            .any(|p| p.label().eq_ignore_ascii_case(candidate.label()));
        if !taken {
            perspectives.push(candidate);
        } else if i >= PerspectiveKind::all_builtins().len() {
            // Catalogue exhausted: number the repeats so labels stay distinct.
            let n = perspectives.len() + 1;
            perspectives.push(Perspective::new(
                format!("{} {}", candidate.label(), n),
                candidate.description().to_string(),
            ));
        }
    }
    perspectives.truncate(count);
    perspectives
}

/// Role an agent plays in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Reviewer,
    Arbiter,
    Writer,
    CodeReviewer,
}

impl AgentRole {
    /// Position within a round: reviewers and writers speak first.
    pub fn turn_rank(self) -> u8 {
        match self {
            Self::Reviewer | Self::Writer => 0,
            Self::CodeReviewer => 1,
            Self::Arbiter => 2,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Reviewer => "reviewer",
            Self::Arbiter => "arbiter",
            Self::Writer => "writer",
            Self::CodeReviewer => "code-reviewer",
        };
        write!(f, "{}", s)
    }
}

/// Stable agent identifier. Reviewer ids define the per-round speaking order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub u32);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

/// A role wrapper around the language model with its own memory.
#[derive(Debug, Clone)]
pub struct Agent {
    id: AgentId,
    name: String,
    role: AgentRole,
    persona: String,
    history: Vec<Message>,
}

impl Agent {
    pub fn new(id: AgentId, role: AgentRole, name: impl Into<String>, persona: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            role,
            persona: persona.into(),
            history: Vec::new(),
        }
    }

    /// Reviewer whose persona is derived from its perspective.
    pub fn reviewer(id: AgentId, perspective: &Perspective) -> Self {
        let persona = format!(
            "You are a reviewer focusing on the {label} perspective. {desc}\n\
             Analyse the current draft from this angle only. Each turn, raise exactly one \
             concrete question or critique that would most improve the document.",
            label = perspective.label(),
            desc = perspective.description(),
        );
        Self::new(
            id,
            AgentRole::Reviewer,
            format!("reviewer-{}-{}", id, perspective.slug()),
            persona,
        )
    }

    /// The session's arbiter. Its id sorts after any reviewer id.
    pub fn arbiter(persona: impl Into<String>) -> Self {
        Self::new(AgentId(u32::MAX), AgentRole::Arbiter, "arbiter", persona)
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn persona(&self) -> &str {
        &self.persona
    }

    /// Messages this agent has seen or sent, in arrival order.
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Add a message to this agent's memory.
    pub fn observe(&mut self, message: &Message) {
        self.history.push(message.clone());
    }

    /// Seed shared context as an initial observation.
    pub fn prime(&mut self, context: Message) {
        self.history.push(context);
    }

    /// Build the structured request for one turn.
    pub fn request(&self, instruction: impl Into<String>) -> ModelRequest {
        ModelRequest {
            agent: self.name.clone(),
            role: self.role,
            system: self.persona.clone(),
            history: self
                .history
                .iter()
                .map(|m| HistoryTurn {
                    speaker: m.sender_name.clone(),
                    content: m.content.clone(),
                })
                .collect(),
            instruction: instruction.into(),
        }
    }

    /// Ask the model for this agent's next turn.
    pub async fn invoke(
        &self,
        model: &dyn LanguageModel,
        instruction: impl Into<String>,
    ) -> Result<String, CapabilityError> {
        let request = self.request(instruction);
        tracing::debug!(agent = %self.name, turns = request.history.len(), "invoking model");
        model.generate(&request).await.map(|r| r.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perspective_kind_aliases() {
        assert_eq!("theory".parse::<PerspectiveKind>().unwrap(), PerspectiveKind::Theoretical);
        assert_eq!("Methods".parse::<PerspectiveKind>().unwrap(), PerspectiveKind::Methodological);
        assert_eq!("limitations".parse::<PerspectiveKind>().unwrap(), PerspectiveKind::Critical);
        assert_eq!(
            " Quantum Hardware ".parse::<PerspectiveKind>().unwrap(),
            PerspectiveKind::Custom("Quantum Hardware".to_string())
        );
    }

    #[test]
    fn test_custom_kind_has_no_focus_areas() {
        let kind = PerspectiveKind::Custom("Ethics".to_string());
        assert!(kind.focus_areas().is_empty());
        let p = Perspective::from_kind(&kind);
        assert_eq!(p.label(), "Ethics");
        assert!(p.description().contains("Ethics perspective"));
    }

    #[test]
    fn test_perspective_slug() {
        let p = Perspective::new("Human-Computer Interaction (HCI)", "");
        assert_eq!(p.slug(), "human-computer-interaction-hci");
    }

    #[test]
    fn test_fill_perspectives_pads_from_catalogue() {
        let given = vec![Perspective::new("Theoretical", "mine")];
        let filled = fill_perspectives(given, 3);
        assert_eq!(filled.len(), 3);
        assert_eq!(filled[0].description(), "mine");
        assert_eq!(filled[1].label(), "Methodological");
        assert_eq!(filled[2].label(), "Empirical");
    }

    #[test]
    fn test_fill_perspectives_beyond_catalogue_stays_distinct() {
        let filled = fill_perspectives(Vec::new(), 7);
        assert_eq!(filled.len(), 7);
        let mut labels: Vec<_> = filled.iter().map(|p| p.label().to_string()).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), 7);
    }

    #[test]
    fn test_fill_perspectives_truncates() {
        let given = (0..5).map(|i| Perspective::new(format!("p{i}"), "")).collect();
        assert_eq!(fill_perspectives(given, 2).len(), 2);
        assert!(fill_perspectives(Vec::new(), 0).is_empty());
    }

    #[test]
    fn test_reviewer_agent_name_and_persona() {
        let p = Perspective::from_kind(&PerspectiveKind::Empirical);
        let agent = Agent::reviewer(AgentId(3), &p);
        assert_eq!(agent.name(), "reviewer-03-empirical");
        assert_eq!(agent.role(), AgentRole::Reviewer);
        assert!(agent.persona().contains("Empirical"));
    }

    #[test]
    fn test_arbiter_sorts_after_reviewers() {
        let arbiter = Agent::arbiter("lead");
        assert!(arbiter.id() > AgentId(1_000));
        assert!(AgentRole::Arbiter.turn_rank() > AgentRole::Reviewer.turn_rank());
    }

    #[test]
    fn test_request_includes_history() {
        let mut agent = Agent::new(AgentId(1), AgentRole::Writer, "writer", "You write code.");
        agent.observe(&Message::text(AgentId(0), "task", AgentRole::Arbiter, 0, "plot it"));
        let req = agent.request("Write the code.");
        assert_eq!(req.system, "You write code.");
        assert_eq!(req.history.len(), 1);
        assert_eq!(req.history[0].speaker, "task");
        assert_eq!(req.instruction, "Write the code.");
    }
}
