//! The synthesized nutrition record and its provenance model
//!
//! The record is the sole externally persisted artifact of a capture
//! session. It deliberately carries no random ids or timestamps: identical
//! inputs with a warm cache produce a `PartialEq`-identical record.

use serde::{Deserialize, Serialize};

/// Macro-level nutrition values, per portion unless stated otherwise
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NutritionFacts {
    pub calories: f64,
    pub protein_g: f64,
    pub carbs_g: f64,
    pub fat_g: f64,
    pub fiber_g: f64,
}

impl NutritionFacts {
    pub const fn new(calories: f64, protein_g: f64, carbs_g: f64, fat_g: f64, fiber_g: f64) -> Self {
        Self {
            calories,
            protein_g,
            carbs_g,
            fat_g,
            fiber_g,
        }
    }

    /// Scale every field by a portion multiplier
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            calories: self.calories * factor,
            protein_g: self.protein_g * factor,
            carbs_g: self.carbs_g * factor,
            fat_g: self.fat_g * factor,
            fiber_g: self.fiber_g * factor,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calories == 0.0
            && self.protein_g == 0.0
            && self.carbs_g == 0.0
            && self.fat_g == 0.0
            && self.fiber_g == 0.0
    }
}

/// Which data source supplied the final values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Scanned barcode resolved against a product database
    Barcode,
    /// OCR extraction from a nutrition-label photo
    NutritionLabel,
    /// Verified reference nutrition database
    ReferenceDatabase,
    /// AI vision estimate from the food photo
    AiVision,
}

impl SourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::Barcode => "barcode",
            SourceKind::NutritionLabel => "nutrition_label",
            SourceKind::ReferenceDatabase => "reference_database",
            SourceKind::AiVision => "ai_vision",
        }
    }

    /// All sources in synthesis priority order
    pub fn priority_order() -> [SourceKind; 4] {
        [
            SourceKind::Barcode,
            SourceKind::NutritionLabel,
            SourceKind::ReferenceDatabase,
            SourceKind::AiVision,
        ]
    }
}

/// One consulted source, in priority order, with the reason it was used or skipped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub source: SourceKind,
    pub used: bool,
    pub reason: String,
}

impl ProvenanceEntry {
    pub fn used(source: SourceKind, reason: impl Into<String>) -> Self {
        Self {
            source,
            used: true,
            reason: reason.into(),
        }
    }

    pub fn skipped(source: SourceKind, reason: impl Into<String>) -> Self {
        Self {
            source,
            used: false,
            reason: format!("skipped: {}", reason.into()),
        }
    }
}

/// The final, provenance-tagged nutrition record for one capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizedNutritionRecord {
    pub dish_name: String,
    pub serving_description: String,
    pub nutrition: NutritionFacts,
    /// Always concrete, never null; in [0, 1]
    pub confidence: f64,
    pub source: SourceKind,
    /// Every source consulted, in priority order
    pub provenance: Vec<ProvenanceEntry>,
    /// Set whenever confidence falls below the configured threshold
    pub needs_user_confirmation: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled_multiplies_every_field() {
        let facts = NutritionFacts::new(110.0, 4.0, 20.0, 2.0, 1.0);
        let doubled = facts.scaled(2.0);
        assert_eq!(doubled.calories, 220.0);
        assert_eq!(doubled.protein_g, 8.0);
        assert_eq!(doubled.fiber_g, 2.0);
    }

    #[test]
    fn test_priority_order_is_fixed() {
        assert_eq!(
            SourceKind::priority_order(),
            [
                SourceKind::Barcode,
                SourceKind::NutritionLabel,
                SourceKind::ReferenceDatabase,
                SourceKind::AiVision,
            ]
        );
    }

    #[test]
    fn test_skipped_entry_reason_prefix() {
        let entry = ProvenanceEntry::skipped(SourceKind::NutritionLabel, "low completeness");
        assert!(!entry.used);
        assert_eq!(entry.reason, "skipped: low completeness");
    }
}
