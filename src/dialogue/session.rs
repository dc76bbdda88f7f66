//! Bounded multi-reviewer dialogue with a single arbiter.
//!
//! A session with `rounds = N` runs N question rounds followed by one
//! convergence round:
//!
//! ```text
//! round r < N:  reviewers (concurrent, recorded in id order) -> arbiter ruling -> searches
//! round N:      arbiter convergence ruling
//! ```
//!
//! Only the arbiter step writes to the reference set. A reviewer failure
//! becomes an empty message for that round; an arbiter failure ends the
//! session with [`ConvergenceFailure`].

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::arbiter::{
    ArbiterConfig, ArbiterRuling, OpenQuestion, build_convergence_prompt, build_round_prompt, parse_ruling,
};
use crate::agent::{Agent, AgentId, AgentRole, Perspective};
use crate::capability::{LanguageModel, LiteratureSearch};
use crate::convergence;
use crate::draft::DraftArtifact;
use crate::errors::{AgentInvocationError, ConvergenceFailure};
use crate::pipeline::{PipelineEvent, emit};
use crate::references::ReferenceSet;
use crate::transcript::{Message, Payload, QuestionId, Transcript, qualify_question_id, question_id};

/// Result of a finished (or cancelled) session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub transcript: Transcript,
    pub artifact: DraftArtifact,
    pub references: ReferenceSet,
    /// `references.len()` after each arbiter round.
    pub reference_sizes: Vec<usize>,
    /// Reviewer turns that failed and were recorded as empty messages.
    pub failed_turns: Vec<AgentInvocationError>,
    /// True when cancellation stopped the session before its final round.
    pub cancelled: bool,
}

pub struct DialogueSession {
    name: String,
    topic: String,
    rounds: u32,
    context: Option<String>,
    reviewers: Vec<Agent>,
    arbiter: Agent,
    arbiter_config: ArbiterConfig,
    model: Arc<dyn LanguageModel>,
    search: Arc<dyn LiteratureSearch>,
    references: ReferenceSet,
    cancel: CancellationToken,
    event_tx: Option<mpsc::Sender<PipelineEvent>>,
}

impl DialogueSession {
    /// One reviewer per perspective (ids 1..=N in the given order) plus the arbiter.
    pub fn new(
        name: impl Into<String>,
        topic: impl Into<String>,
        perspectives: &[Perspective],
        arbiter_config: ArbiterConfig,
        rounds: u32,
        model: Arc<dyn LanguageModel>,
        search: Arc<dyn LiteratureSearch>,
    ) -> Self {
        let reviewers = perspectives
            .iter()
            .enumerate()
            .map(|(i, p)| Agent::reviewer(AgentId(i as u32 + 1), p))
            .collect();
        let arbiter = Agent::arbiter(arbiter_config.persona.clone());

        Self {
            name: name.into(),
            topic: topic.into(),
            rounds,
            context: None,
            reviewers,
            arbiter,
            arbiter_config,
            model,
            search,
            references: ReferenceSet::new(),
            cancel: CancellationToken::new(),
            event_tx: None,
        }
    }

    /// Extra shared context (input notes, data summaries) for every agent.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Start from an existing reference set. It only grows during the session.
    pub fn with_references(mut self, references: ReferenceSet) -> Self {
        self.references = references;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn reviewer_count(&self) -> usize {
        self.reviewers.len()
    }

    /// Run all rounds and converge on a new version of `seed`.
    pub async fn run(mut self, seed: &DraftArtifact) -> Result<SessionOutcome, ConvergenceFailure> {
        let mut transcript = Transcript::new(&self.name);
        let mut reference_sizes = Vec::new();
        let mut failed_turns = Vec::new();
        let mut cancelled = false;

        self.share_initial_context(seed);
        tracing::info!(
            session = %self.name,
            reviewers = self.reviewers.len(),
            rounds = self.rounds,
            "dialogue session started"
        );

        for round in 0..self.rounds {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let draft = convergence::resolve(&transcript, seed, &self.references);
            let failures = self.reviewer_round(round, &draft, &mut transcript).await?;
            let failed_count = failures.len();
            failed_turns.extend(failures);

            let questions = open_questions(&transcript, round);
            let prompt = build_round_prompt(
                &self.topic,
                round,
                &draft,
                &questions,
                self.arbiter_config.allow_search,
            );
            let mut ruling = self.arbiter_ruling(round, prompt, &transcript).await?;
            self.sanitize(&mut ruling, &transcript, round);
            self.resolve_questions(round, &ruling, &transcript).await;
            self.record_ruling(round, ruling, &mut transcript)?;

            reference_sizes.push(self.references.len());
            emit(
                &self.event_tx,
                PipelineEvent::RoundCompleted {
                    session: self.name.clone(),
                    round,
                    rounds_total: self.rounds + 1,
                    failed_agents: failed_count,
                    references: self.references.len(),
                },
            )
            .await;
        }

        if !cancelled && self.cancel.is_cancelled() {
            cancelled = true;
        }

        if !cancelled {
            let round = self.rounds;
            let draft = convergence::resolve(&transcript, seed, &self.references);
            let pending = self.unresolved_questions(&transcript);
            let prompt = build_convergence_prompt(&self.topic, round, &draft, &pending);
            let mut ruling = self.arbiter_ruling(round, prompt, &transcript).await?;
            // Citations are settled before convergence.
            ruling.resolved.clear();
            self.sanitize(&mut ruling, &transcript, round);
            self.record_ruling(round, ruling, &mut transcript)?;

            reference_sizes.push(self.references.len());
            emit(
                &self.event_tx,
                PipelineEvent::RoundCompleted {
                    session: self.name.clone(),
                    round,
                    rounds_total: self.rounds + 1,
                    failed_agents: 0,
                    references: self.references.len(),
                },
            )
            .await;
        } else {
            tracing::warn!(session = %self.name, "session cancelled, converging on partial transcript");
        }

        let artifact = convergence::resolve(&transcript, seed, &self.references);
        tracing::info!(
            session = %self.name,
            version = artifact.version,
            messages = transcript.len(),
            references = self.references.len(),
            cancelled,
            "dialogue session finished"
        );

        Ok(SessionOutcome {
            transcript,
            artifact,
            references: self.references,
            reference_sizes,
            failed_turns,
            cancelled,
        })
    }

    fn share_initial_context(&mut self, seed: &DraftArtifact) {
        let mut content = format!("Topic: {}\n\nSeed draft:\n\n{}", self.topic, seed.render());
        if let Some(context) = &self.context {
            content.push_str("\n\nBackground material:\n\n");
            content.push_str(context);
        }
        let message = Message::text(AgentId(0), "context", AgentRole::Arbiter, 0, content);
        for agent in self.reviewers.iter_mut() {
            agent.prime(message.clone());
        }
        self.arbiter.prime(message);
    }

    /// Invoke every reviewer concurrently and record their messages in id order.
    async fn reviewer_round(
        &mut self,
        round: u32,
        draft: &DraftArtifact,
        transcript: &mut Transcript,
    ) -> Result<Vec<AgentInvocationError>, ConvergenceFailure> {
        let instruction = format!(
            "Round {round}. Current draft:\n\n{draft}\n\
             Raise exactly one question or critique from your perspective. \
             Start with \"Question:\" or \"Critique:\".",
            round = round,
            draft = draft.render(),
        );

        let model = self.model.as_ref();
        let replies = join_all(
            self.reviewers
                .iter()
                .map(|agent| agent.invoke(model, instruction.clone())),
        )
        .await;

        let mut failures = Vec::new();
        let mut messages = Vec::with_capacity(replies.len());
        for (agent, reply) in self.reviewers.iter().zip(replies) {
            let message = match reply {
                Ok(text) => reviewer_message(&self.name, agent, round, &text),
                Err(source) => {
                    let err = AgentInvocationError {
                        agent: agent.name().to_string(),
                        round,
                        source,
                    };
                    tracing::warn!(session = %self.name, round, agent = %agent.name(), error = %err, "reviewer turn failed");
                    let message = Message::empty(agent.id(), agent.name(), agent.role(), round, err.to_string());
                    failures.push(err);
                    message
                }
            };
            messages.push(message);
        }

        for message in messages {
            self.record(message, transcript)?;
        }
        Ok(failures)
    }

    async fn arbiter_ruling(
        &self,
        round: u32,
        prompt: String,
        transcript: &Transcript,
    ) -> Result<ArbiterRuling, ConvergenceFailure> {
        let response = self
            .arbiter
            .invoke(self.model.as_ref(), prompt)
            .await
            .map_err(|source| {
                let err = AgentInvocationError {
                    agent: self.arbiter.name().to_string(),
                    round,
                    source,
                };
                self.failure(round, err.to_string(), transcript)
            })?;

        parse_ruling(&response)
            .ok_or_else(|| self.failure(round, "arbiter response did not contain a ruling".to_string(), transcript))
    }

    /// Keep only references to questions raised so far and honour the search policy.
    fn sanitize(&self, ruling: &mut ArbiterRuling, transcript: &Transcript, round: u32) {
        for id in ruling.dropped.iter_mut() {
            *id = qualify_question_id(&self.name, id);
        }
        for resolution in ruling.resolved.iter_mut() {
            resolution.question = qualify_question_id(&self.name, &resolution.question);
        }
        let known: HashSet<&QuestionId> = transcript.questions().map(|(id, _)| id).collect();
        ruling.dropped.retain(|id| known.contains(id));
        let dropped: HashSet<QuestionId> = ruling.dropped.iter().cloned().collect();
        ruling
            .resolved
            .retain(|r| known.contains(&r.question) && !dropped.contains(&r.question));
        if !self.arbiter_config.allow_search && !ruling.resolved.is_empty() {
            tracing::debug!(session = %self.name, round, "ignoring resolutions, citations are frozen");
            ruling.resolved.clear();
        }
    }

    /// Run the ruling's searches one at a time and grow the reference set.
    async fn resolve_questions(&mut self, round: u32, ruling: &ArbiterRuling, transcript: &Transcript) {
        for resolution in &ruling.resolved {
            let query = if resolution.query.trim().is_empty() {
                transcript
                    .questions()
                    .find(|(id, _)| **id == resolution.question)
                    .map(|(_, text)| text.to_string())
                    .unwrap_or_default()
            } else {
                resolution.query.clone()
            };
            if query.trim().is_empty() {
                continue;
            }

            match self.search.search(&query).await {
                Ok(papers) => {
                    let found = papers.len();
                    let added = self.references.resolve(&resolution.question, papers);
                    tracing::debug!(session = %self.name, round, question = %resolution.question, found, added, "search");
                }
                Err(e) => {
                    tracing::warn!(session = %self.name, round, question = %resolution.question, error = %e, "search failed, question stays open");
                }
            }
        }
    }

    fn record_ruling(
        &mut self,
        round: u32,
        ruling: ArbiterRuling,
        transcript: &mut Transcript,
    ) -> Result<(), ConvergenceFailure> {
        let message = Message::text(
            self.arbiter.id(),
            self.arbiter.name(),
            AgentRole::Arbiter,
            round,
            ruling.summary(),
        )
        .with_payload(Payload::Ruling(ruling));
        self.record(message, transcript)
    }

    /// Append to the transcript and let every agent observe the message.
    fn record(&mut self, message: Message, transcript: &mut Transcript) -> Result<(), ConvergenceFailure> {
        let round = message.round;
        if let Err(e) = transcript.push(message.clone()) {
            return Err(self.failure(round, e.to_string(), transcript));
        }
        for agent in self.reviewers.iter_mut() {
            agent.observe(&message);
        }
        self.arbiter.observe(&message);
        Ok(())
    }

    fn unresolved_questions(&self, transcript: &Transcript) -> Vec<OpenQuestion> {
        let dropped: HashSet<&QuestionId> = transcript
            .rulings()
            .flat_map(|(_, ruling)| ruling.dropped.iter())
            .collect();
        transcript
            .messages()
            .iter()
            .filter_map(as_open_question)
            .filter(|q| !dropped.contains(&q.id) && !self.references.is_resolved(&q.id))
            .collect()
    }

    fn failure(&self, round: u32, reason: String, transcript: &Transcript) -> ConvergenceFailure {
        tracing::error!(session = %self.name, round, %reason, "convergence failed");
        ConvergenceFailure {
            session: self.name.clone(),
            round,
            reason,
            transcript: transcript.clone(),
        }
    }
}

fn reviewer_message(session: &str, agent: &Agent, round: u32, text: &str) -> Message {
    let text = text.trim();
    let message = Message::text(agent.id(), agent.name(), agent.role(), round, text);
    if text.is_empty() {
        return message;
    }

    let id = question_id(session, round, agent.id());
    let payload = if let Some(rest) = strip_prefix_ignore_case(text, "critique:") {
        Payload::Critique {
            id,
            text: rest.trim().to_string(),
        }
    } else if let Some(rest) = strip_prefix_ignore_case(text, "question:") {
        Payload::Question {
            id,
            text: rest.trim().to_string(),
        }
    } else {
        Payload::Question {
            id,
            text: text.to_string(),
        }
    };
    message.with_payload(payload)
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &text[prefix.len()..])
}

fn as_open_question(message: &Message) -> Option<OpenQuestion> {
    match &message.payload {
        Some(Payload::Question { id, text }) | Some(Payload::Critique { id, text }) => Some(OpenQuestion {
            id: id.clone(),
            reviewer: message.sender_name.clone(),
            text: text.clone(),
        }),
        _ => None,
    }
}

fn open_questions(transcript: &Transcript, round: u32) -> Vec<OpenQuestion> {
    transcript.round(round).filter_map(as_open_question).collect()
}
