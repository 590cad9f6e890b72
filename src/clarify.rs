//! Bounded, turn-limited clarification dialogue
//!
//! Invoked when synthesis detects ambiguity. The dialogue is a persisted
//! finite-state machine: every turn is a stateless request/response pair
//! against the stored `ClarificationSession`, so no in-process coroutine
//! outlives a turn. Replies are interpreted deterministically against the
//! known candidate set: exact names, quick-reply indexes, fuzzy words,
//! quantity phrases, and cancellation words.

use crate::identify::DishCandidate;
use crate::reference::normalize_dish_name;
use crate::synthesis::{ConfirmedDish, SourceSet};
use crate::record::SynthesizedNutritionRecord;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

/// Default turn budget before forced abandonment
pub const DEFAULT_MAX_TURNS: usize = 4;

const COMBINED_OPTION: &str = "all of them";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClarificationState {
    Created,
    AwaitingUserResponse,
    Resolved,
    Abandoned,
}

/// One question/reply pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationTurn {
    pub question: String,
    pub user_reply: Option<String>,
}

/// Outcome of processing one user reply
#[derive(Debug, Clone, PartialEq)]
pub enum TurnResult {
    /// The reply fixed one dish (and possibly a quantity); synthesis
    /// re-enters deterministically with the confirmation applied
    Resolved(ConfirmedDish),
    /// Another turn is needed; the new question to present
    Ask(String),
    /// Turn budget exhausted or the user cancelled
    Abandoned,
}

/// The persisted dialogue state. All state a turn needs lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationSession {
    pub id: Uuid,
    pub capture_id: Uuid,
    pub state: ClarificationState,
    pub turns: Vec<ClarificationTurn>,
    pub max_turns: usize,
    pub candidates: Vec<DishCandidate>,
    pub quick_replies: Vec<String>,
    /// Source snapshot for deterministic re-entry into synthesis
    pub sources: SourceSet,
    /// Lowest-risk fallback persisted on abandonment
    pub fallback: SynthesizedNutritionRecord,
    pub created_at: DateTime<Utc>,
}

impl ClarificationSession {
    /// Open a dialogue for an ambiguous capture: builds the quick replies
    /// from the known candidates, emits the first question, and moves to
    /// awaiting the user.
    pub fn open(
        capture_id: Uuid,
        candidates: Vec<DishCandidate>,
        sources: SourceSet,
        fallback: SynthesizedNutritionRecord,
        ambiguity_reason: &str,
        max_turns: usize,
    ) -> Self {
        let mut quick_replies: Vec<String> = candidates.iter().map(|c| c.name.clone()).collect();
        if candidates.len() >= 2 {
            quick_replies.push(COMBINED_OPTION.to_string());
        }

        let mut session = Self {
            id: Uuid::new_v4(),
            capture_id,
            state: ClarificationState::Created,
            turns: Vec::new(),
            max_turns: max_turns.max(1),
            candidates,
            quick_replies,
            sources,
            fallback,
            created_at: Utc::now(),
        };
        let question = session.initial_question(ambiguity_reason);
        session.turns.push(ClarificationTurn {
            question,
            user_reply: None,
        });
        session.state = ClarificationState::AwaitingUserResponse;
        session
    }

    /// The question currently awaiting an answer
    pub fn current_question(&self) -> Option<&str> {
        if self.state != ClarificationState::AwaitingUserResponse {
            return None;
        }
        self.turns.last().map(|t| t.question.as_str())
    }

    pub fn is_open(&self) -> bool {
        self.state == ClarificationState::AwaitingUserResponse
    }

    fn initial_question(&self, ambiguity_reason: &str) -> String {
        format!(
            "I'm not confident enough to log this yet ({}). Which should I log? {} \
             You can also add a quantity, e.g. \"{}, 2 servings\", or say \"cancel\".",
            ambiguity_reason,
            numbered_options(&self.quick_replies),
            self.candidates
                .first()
                .map(|c| c.name.as_str())
                .unwrap_or("apple")
        )
    }

    fn follow_up_question(&self) -> String {
        format!(
            "Sorry, I didn't catch that. Please answer with one of: {}",
            numbered_options(&self.quick_replies)
        )
    }

    /// Process one user reply. Fills the open turn, then either resolves,
    /// asks again (bounded by `max_turns`), or abandons.
    pub fn record_reply(&mut self, reply: &str) -> TurnResult {
        if self.state != ClarificationState::AwaitingUserResponse {
            return TurnResult::Abandoned;
        }
        if let Some(turn) = self.turns.last_mut() {
            turn.user_reply = Some(reply.to_string());
        }

        if is_cancellation(reply) {
            self.state = ClarificationState::Abandoned;
            return TurnResult::Abandoned;
        }

        if let Some(confirmed) = self.interpret(reply) {
            self.state = ClarificationState::Resolved;
            return TurnResult::Resolved(confirmed);
        }

        if self.turns.len() >= self.max_turns {
            self.state = ClarificationState::Abandoned;
            return TurnResult::Abandoned;
        }

        let question = self.follow_up_question();
        self.turns.push(ClarificationTurn {
            question: question.clone(),
            user_reply: None,
        });
        TurnResult::Ask(question)
    }

    /// Interpret a reply against the candidate set and free text
    fn interpret(&self, reply: &str) -> Option<ConfirmedDish> {
        let normalized = normalize_reply(reply);
        if normalized.is_empty() {
            return None;
        }
        let quantity = extract_quantity(&normalized);

        // A bare number is an option index when it fits the option list;
        // the number selects, it is not a quantity
        if let Some(index) = option_index(&normalized, self.quick_replies.len()) {
            let name = self.quick_replies[index - 1].clone();
            return Some(self.confirm(name, None));
        }

        // Affirmation confirms the primary candidate
        if is_affirmation(&normalized) {
            let primary = self.candidates.first()?;
            return Some(ConfirmedDish {
                name: primary.name.clone(),
                quantity,
            });
        }

        // "all of them" / "both" confirms the combined plate
        if self.candidates.len() >= 2 && mentions_all(&normalized) {
            return Some(ConfirmedDish {
                name: self.combined_name(),
                quantity,
            });
        }

        // Candidate name match: containment first, then fuzzy words
        if let Some(candidate) = self.match_candidate(&normalized) {
            return Some(ConfirmedDish {
                name: candidate.name.clone(),
                quantity,
            });
        }

        // A standalone quantity confirms the primary candidate
        if quantity.is_some() && is_quantity_only(&normalized) {
            let primary = self.candidates.first()?;
            return Some(ConfirmedDish {
                name: primary.name.clone(),
                quantity,
            });
        }

        None
    }

    fn confirm(&self, option: String, quantity: Option<f64>) -> ConfirmedDish {
        let name = if option == COMBINED_OPTION {
            self.combined_name()
        } else {
            option
        };
        ConfirmedDish { name, quantity }
    }

    fn combined_name(&self) -> String {
        self.candidates
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(" with ")
    }

    fn match_candidate(&self, normalized_reply: &str) -> Option<&DishCandidate> {
        // Candidates are ordered by confidence; the first match wins
        self.candidates.iter().find(|candidate| {
            let name = normalize_dish_name(&candidate.name);
            if name.is_empty() {
                return false;
            }
            if normalized_reply.contains(&name) {
                return true;
            }
            normalized_reply.split_whitespace().any(|word| {
                word.len() >= 4
                    && (name.contains(word)
                        || strsim::normalized_levenshtein(word, &name) >= 0.8)
            })
        })
    }
}

fn numbered_options(options: &[String]) -> String {
    options
        .iter()
        .enumerate()
        .map(|(i, option)| format!("{}) {}", i + 1, option))
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalize_reply(reply: &str) -> String {
    reply.trim().to_lowercase()
}

fn is_cancellation(reply: &str) -> bool {
    const CANCEL_WORDS: &[&str] = &["cancel", "skip", "stop", "quit", "nevermind", "never mind", "forget it"];
    let normalized = normalize_reply(reply);
    CANCEL_WORDS.iter().any(|w| normalized == *w || normalized.starts_with(&format!("{} ", w)))
}

fn is_affirmation(normalized: &str) -> bool {
    const YES_WORDS: &[&str] = &["yes", "yep", "yeah", "correct", "right", "that's right", "ok", "okay"];
    YES_WORDS.iter().any(|w| normalized == *w)
}

fn mentions_all(normalized: &str) -> bool {
    const ALL_WORDS: &[&str] = &["all", "both", "everything"];
    normalized.contains("all of them")
        || normalized.contains("whole plate")
        || normalized
            .split_whitespace()
            .any(|word| ALL_WORDS.contains(&word))
}

fn quantity_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d+(?:\.\d+)?)\s*(?:x\b|servings?\b|portions?\b|pieces?\b)?").unwrap()
    })
}

/// Pull a serving quantity out of free text ("2 servings", "1.5x", "half")
fn extract_quantity(normalized: &str) -> Option<f64> {
    if normalized.contains("half") {
        return Some(0.5);
    }
    if normalized.contains("double") {
        return Some(2.0);
    }
    let captures = quantity_regex().captures(normalized)?;
    let value: f64 = captures.get(1)?.as_str().parse().ok()?;
    (value > 0.0 && value <= 20.0).then_some(value)
}

/// A reply that is nothing but a number (optionally with a unit word)
fn is_quantity_only(normalized: &str) -> bool {
    quantity_regex()
        .find(normalized)
        .map(|m| m.start() == 0 && m.end() == normalized.len())
        .unwrap_or(false)
}

/// A bare integer within the option list selects that option
fn option_index(normalized: &str, option_count: usize) -> Option<usize> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^(?:option\s*)?(\d+)$").unwrap());
    let index: usize = re.captures(normalized)?.get(1)?.as_str().parse().ok()?;
    (index >= 1 && index <= option_count).then_some(index)
}
