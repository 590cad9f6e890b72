//! Deterministic priority-and-confidence merge of the available sources
//!
//! The priority order (barcode > label > reference database > AI vision)
//! is fixed and never violated by relative confidence scores. Every step,
//! taken or skipped, lands in the provenance list with a reason, so each
//! decision is auditable and testable. An ambiguous result (a
//! low-confidence choice, or two candidates too close to call) defers to
//! the clarification dialogue instead of finalizing.

use crate::barcode::BarcodeLookupResult;
use crate::error::{EngineError, Result};
use crate::identify::DishCandidate;
use crate::label::NutritionLabelExtraction;
use crate::portion::NutritionEstimate;
use crate::record::{NutritionFacts, ProvenanceEntry, SourceKind, SynthesizedNutritionRecord};
use crate::reference::{ReferenceMatch, SIMILARITY_THRESHOLD};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Label extractions below this completeness are unusable
pub const LABEL_COMPLETENESS_GATE: f64 = 0.7;

/// Barcode data is near-authoritative
const BARCODE_CONFIDENCE: f64 = 0.99;

/// Portion multipliers implied by the vision estimate are snapped to half
/// servings and bounded to stay plausible
const MULTIPLIER_STEP: f64 = 0.5;
const MULTIPLIER_MIN: f64 = 0.5;
const MULTIPLIER_MAX: f64 = 4.0;

/// Whichever sources resolved for the session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceSet {
    pub barcode: Option<BarcodeLookupResult>,
    pub label: Option<NutritionLabelExtraction>,
    pub reference: Option<ReferenceMatch>,
    pub estimate: Option<NutritionEstimate>,
}

impl SourceSet {
    pub fn is_empty(&self) -> bool {
        self.barcode.is_none()
            && self.label.is_none()
            && self.reference.is_none()
            && self.estimate.is_none()
    }
}

/// Thresholds governing the ambiguity deferral
#[derive(Debug, Clone, Copy)]
pub struct SynthesisSettings {
    /// Records below this confidence need confirmation (default 0.75)
    pub low_confidence_threshold: f64,
    /// Candidate confidence gaps below this are ambiguous (default 0.15)
    pub ambiguity_gap: f64,
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            low_confidence_threshold: 0.75,
            ambiguity_gap: 0.15,
        }
    }
}

/// A dish identity fixed by the user through clarification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedDish {
    pub name: String,
    /// Serving count stated by the user, when they gave one
    pub quantity: Option<f64>,
}

/// Result of one synthesis pass
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisOutcome {
    Record(SynthesizedNutritionRecord),
    /// Evidence is ambiguous; the provisional record is the fallback the
    /// clarification dialogue persists on abandonment
    Ambiguous {
        reason: String,
        provisional: SynthesizedNutritionRecord,
    },
}

struct Chosen {
    source: SourceKind,
    nutrition: NutritionFacts,
    confidence: f64,
    dish_name: String,
    serving_description: String,
}

/// Portion multiplier implied by the vision estimate against a source's
/// per-serving calories, snapped to half servings within [0.5, 4].
fn implied_multiplier(estimate: Option<&NutritionEstimate>, per_serving_calories: f64) -> f64 {
    match estimate {
        Some(e) if per_serving_calories > 0.0 && e.nutrition.calories > 0.0 => {
            let ratio = e.nutrition.calories / per_serving_calories;
            ((ratio / MULTIPLIER_STEP).round() * MULTIPLIER_STEP)
                .clamp(MULTIPLIER_MIN, MULTIPLIER_MAX)
        }
        _ => 1.0,
    }
}

fn servings_text(multiplier: f64) -> String {
    if multiplier == 1.0 {
        "1 serving".to_string()
    } else {
        format!("{} servings", multiplier)
    }
}

/// Merge the available sources into one record, or report ambiguity.
///
/// `confirmed` carries a user-confirmed dish identity from the
/// clarification dialogue; it fixes the dish name, optionally overrides
/// the portion multiplier, and suppresses the ambiguity deferral.
pub fn synthesize(
    candidates: &[DishCandidate],
    sources: &SourceSet,
    settings: &SynthesisSettings,
    confirmed: Option<&ConfirmedDish>,
) -> Result<SynthesisOutcome> {
    let mut provenance: Vec<ProvenanceEntry> = Vec::new();
    let estimate = sources.estimate.as_ref();
    let primary_name = confirmed
        .map(|c| c.name.clone())
        .or_else(|| {
            candidates
                .iter()
                .find(|c| c.is_primary)
                .or_else(|| candidates.first())
                .map(|c| c.name.clone())
        });

    let multiplier_for = |per_serving_calories: f64| -> f64 {
        confirmed
            .and_then(|c| c.quantity)
            .unwrap_or_else(|| implied_multiplier(estimate, per_serving_calories))
    };

    let mut chosen: Option<Chosen> = None;

    // 1. Barcode: highest priority, used verbatim per serving whenever present
    match &sources.barcode {
        Some(barcode) => {
            let multiplier = multiplier_for(barcode.nutrition_per_serving.calories);
            provenance.push(ProvenanceEntry::used(
                SourceKind::Barcode,
                format!(
                    "product '{}' resolved from {} for barcode {}, {}",
                    barcode.product_name,
                    barcode.origin.label(),
                    barcode.barcode,
                    servings_text(multiplier)
                ),
            ));
            chosen = Some(Chosen {
                source: SourceKind::Barcode,
                nutrition: barcode.nutrition_per_serving.scaled(multiplier),
                confidence: BARCODE_CONFIDENCE,
                dish_name: barcode.product_name.clone(),
                serving_description: servings_text(multiplier),
            });
        }
        None => provenance.push(ProvenanceEntry::skipped(
            SourceKind::Barcode,
            "no barcode lookup result",
        )),
    }

    // 2. Nutrition label: gated on completeness
    match &sources.label {
        Some(_) if chosen.is_some() => provenance.push(ProvenanceEntry::skipped(
            SourceKind::NutritionLabel,
            "superseded by barcode",
        )),
        Some(label) if label.completeness >= LABEL_COMPLETENESS_GATE => {
            let multiplier = multiplier_for(label.calories);
            provenance.push(ProvenanceEntry::used(
                SourceKind::NutritionLabel,
                format!(
                    "label extraction at completeness {:.2}, {}",
                    label.completeness,
                    servings_text(multiplier)
                ),
            ));
            chosen = Some(Chosen {
                source: SourceKind::NutritionLabel,
                nutrition: label.facts().scaled(multiplier),
                confidence: label.completeness,
                dish_name: primary_name
                    .clone()
                    .unwrap_or_else(|| "packaged food".to_string()),
                serving_description: if label.serving_size.is_empty() {
                    servings_text(multiplier)
                } else if multiplier == 1.0 {
                    label.serving_size.clone()
                } else {
                    format!("{} x {}", multiplier, label.serving_size)
                },
            });
        }
        Some(label) => provenance.push(ProvenanceEntry::skipped(
            SourceKind::NutritionLabel,
            format!(
                "completeness {:.2} < {:.2} threshold",
                label.completeness, LABEL_COMPLETENESS_GATE
            ),
        )),
        None => provenance.push(ProvenanceEntry::skipped(
            SourceKind::NutritionLabel,
            "no label extraction available",
        )),
    }

    // 3. Reference database: scaled per-serving values
    match &sources.reference {
        Some(_) if chosen.is_some() => provenance.push(ProvenanceEntry::skipped(
            SourceKind::ReferenceDatabase,
            "superseded by a higher-priority source",
        )),
        Some(reference) if reference.match_confidence >= SIMILARITY_THRESHOLD => {
            let multiplier = multiplier_for(reference.nutrition_per_serving.calories);
            let portion_confidence = estimate.map(|e| e.confidence).unwrap_or(1.0);
            provenance.push(ProvenanceEntry::used(
                SourceKind::ReferenceDatabase,
                format!(
                    "matched '{}' at confidence {:.2}, {}",
                    reference.name,
                    reference.match_confidence,
                    servings_text(multiplier)
                ),
            ));
            chosen = Some(Chosen {
                source: SourceKind::ReferenceDatabase,
                nutrition: reference.nutrition_per_serving.scaled(multiplier),
                confidence: reference.match_confidence * portion_confidence,
                dish_name: primary_name
                    .clone()
                    .unwrap_or_else(|| reference.name.clone()),
                serving_description: estimate
                    .map(|e| e.serving_description.clone())
                    .unwrap_or_else(|| servings_text(multiplier)),
            });
        }
        Some(reference) => provenance.push(ProvenanceEntry::skipped(
            SourceKind::ReferenceDatabase,
            format!(
                "match confidence {:.2} < {:.2} threshold",
                reference.match_confidence, SIMILARITY_THRESHOLD
            ),
        )),
        None => provenance.push(ProvenanceEntry::skipped(
            SourceKind::ReferenceDatabase,
            "no reference database match",
        )),
    }

    // 4. AI vision estimate: the floor of the priority ladder
    match estimate {
        Some(_) if chosen.is_some() => provenance.push(ProvenanceEntry::skipped(
            SourceKind::AiVision,
            "superseded by a higher-priority source (portion multiplier may still apply)",
        )),
        Some(estimate) => {
            let quantity = confirmed.and_then(|c| c.quantity).unwrap_or(1.0);
            provenance.push(ProvenanceEntry::used(
                SourceKind::AiVision,
                format!("vision estimate used directly at confidence {:.2}", estimate.confidence),
            ));
            chosen = Some(Chosen {
                source: SourceKind::AiVision,
                nutrition: estimate.nutrition.scaled(quantity),
                confidence: estimate.confidence,
                dish_name: primary_name
                    .clone()
                    .unwrap_or_else(|| "unidentified dish".to_string()),
                serving_description: estimate.serving_description.clone(),
            });
        }
        None => provenance.push(ProvenanceEntry::skipped(
            SourceKind::AiVision,
            "no vision estimate available",
        )),
    }

    let Some(chosen) = chosen else {
        return Err(EngineError::NoSourceAvailable);
    };

    let confidence = chosen.confidence.clamp(0.0, 1.0);
    let record = SynthesizedNutritionRecord {
        dish_name: chosen.dish_name,
        serving_description: chosen.serving_description,
        nutrition: chosen.nutrition,
        confidence,
        source: chosen.source,
        provenance,
        needs_user_confirmation: confidence < settings.low_confidence_threshold,
    };

    debug!(
        source = record.source.label(),
        confidence = record.confidence,
        dish = %record.dish_name,
        "synthesis complete"
    );

    // A user-confirmed dish is never deferred again
    if confirmed.is_none() {
        let mut reasons = Vec::new();
        if confidence < settings.low_confidence_threshold {
            reasons.push(format!(
                "confidence {:.2} below threshold {:.2}",
                confidence, settings.low_confidence_threshold
            ));
        }
        if let (Some(first), Some(second)) = (candidates.first(), candidates.get(1)) {
            let gap = (first.confidence - second.confidence).abs();
            if gap < settings.ambiguity_gap {
                reasons.push(format!(
                    "candidates '{}' and '{}' within {:.2} confidence of each other",
                    first.name, second.name, gap
                ));
            }
        }
        if !reasons.is_empty() {
            return Ok(SynthesisOutcome::Ambiguous {
                reason: reasons.join("; "),
                provisional: record,
            });
        }
    }

    Ok(SynthesisOutcome::Record(record))
}
