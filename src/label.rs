//! Nutrition-label OCR extraction
//!
//! One vision call per session, no corrective loop beyond `RetryPolicy`'s
//! default. Fields the label does not show are zero-filled rather than
//! omitted; completeness (populated fields over total expected) is the
//! usability gate the synthesis engine applies.

use crate::cache::{self, ResponseCache};
use crate::error::Result;
use crate::record::NutritionFacts;
use crate::retry::RetryPolicy;
use crate::vision::parse::parse_stage_json;
use crate::vision::prompts::{LABEL_SYSTEM, LABEL_USER};
use crate::vision::{VisionApi, VisionRequest};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const STAGE: &str = "label_extraction";

/// Expected field count: nine numeric values plus the serving-size text
const EXPECTED_FIELDS: usize = 10;

/// Structured nutrition-facts payload read off a label photo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutritionLabelExtraction {
    pub calories: f64,
    pub protein_g: f64,
    pub carbs_g: f64,
    pub fat_g: f64,
    pub fiber_g: f64,
    pub sugar_g: f64,
    pub sodium_mg: f64,
    pub saturated_fat_g: f64,
    pub cholesterol_mg: f64,
    pub serving_size: String,
    /// populated fields / total expected fields
    pub completeness: f64,
}

impl NutritionLabelExtraction {
    /// Macro subset used by synthesis
    pub fn facts(&self) -> NutritionFacts {
        NutritionFacts {
            calories: self.calories,
            protein_g: self.protein_g,
            carbs_g: self.carbs_g,
            fat_g: self.fat_g,
            fiber_g: self.fiber_g,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct LabelJson {
    #[serde(default)]
    calories: f64,
    #[serde(default)]
    protein_g: f64,
    #[serde(default)]
    carbs_g: f64,
    #[serde(default)]
    fat_g: f64,
    #[serde(default)]
    fiber_g: f64,
    #[serde(default)]
    sugar_g: f64,
    #[serde(default)]
    sodium_mg: f64,
    #[serde(default)]
    saturated_fat_g: f64,
    #[serde(default)]
    cholesterol_mg: f64,
    #[serde(default)]
    serving_size: String,
}

fn completeness_of(raw: &LabelJson) -> f64 {
    let numeric = [
        raw.calories,
        raw.protein_g,
        raw.carbs_g,
        raw.fat_g,
        raw.fiber_g,
        raw.sugar_g,
        raw.sodium_mg,
        raw.saturated_fat_g,
        raw.cholesterol_mg,
    ];
    let mut populated = numeric.iter().filter(|v| **v > 0.0).count();
    if !raw.serving_size.trim().is_empty() {
        populated += 1;
    }
    populated as f64 / EXPECTED_FIELDS as f64
}

fn from_raw(raw: LabelJson) -> NutritionLabelExtraction {
    let completeness = completeness_of(&raw);
    NutritionLabelExtraction {
        calories: raw.calories.max(0.0),
        protein_g: raw.protein_g.max(0.0),
        carbs_g: raw.carbs_g.max(0.0),
        fat_g: raw.fat_g.max(0.0),
        fiber_g: raw.fiber_g.max(0.0),
        sugar_g: raw.sugar_g.max(0.0),
        sodium_mg: raw.sodium_mg.max(0.0),
        saturated_fat_g: raw.saturated_fat_g.max(0.0),
        cholesterol_mg: raw.cholesterol_mg.max(0.0),
        serving_size: raw.serving_size.trim().to_string(),
        completeness,
    }
}

/// Extract a structured nutrition-facts payload from a label photo
pub async fn extract_label(
    vision: &dyn VisionApi,
    cache_store: &dyn ResponseCache,
    retry: &RetryPolicy,
    label_photo: &[u8],
    ttl: Duration,
) -> Result<NutritionLabelExtraction> {
    let key = cache::cache_key(STAGE, label_photo, &[]);
    if let Some(cached) = cache::get_json::<NutritionLabelExtraction>(cache_store, &key) {
        return Ok(cached);
    }

    let request = VisionRequest::new(LABEL_SYSTEM, LABEL_USER, label_photo);
    let response = retry.run(|_| vision.complete(&request)).await?;
    let extraction = from_raw(parse_stage_json::<LabelJson>(STAGE, &response.content)?);

    debug!(
        completeness = extraction.completeness,
        calories = extraction.calories,
        "label extraction complete"
    );
    cache::set_json(cache_store, &key, &extraction, ttl);
    Ok(extraction)
}
