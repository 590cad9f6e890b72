//! Stage 2: portion and macro estimation for the primary dish
//!
//! Scoped to the primary dish only: sibling candidates are named in the
//! prompt as explicit exclusions, which keeps side dishes out of the
//! estimate. A typical-portion table keyed by coarse dish category clamps
//! implausible outputs into a ±50% band around the table value, bounding
//! both drastic under-counting (a full dish scored as one ingredient) and
//! over-counting (sides folded in).

use crate::cache::{self, ResponseCache};
use crate::error::Result;
use crate::record::NutritionFacts;
use crate::retry::RetryPolicy;
use crate::vision::parse::parse_stage_json;
use crate::vision::prompts::{portion_user, PORTION_CORRECTIVE, PORTION_SYSTEM};
use crate::vision::{VisionApi, VisionRequest};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const STAGE: &str = "portion_estimation";

/// Source tag carried by every vision estimate
pub const AI_VISION_SOURCE: &str = "ai_vision";

/// Band half-width around the typical-portion value
const CLAMP_BAND: f64 = 0.5;

/// AI vision estimate for the primary dish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutritionEstimate {
    pub nutrition: NutritionFacts,
    pub confidence: f64,
    pub serving_description: String,
    /// Always `"ai_vision"`
    pub source: String,
}

#[derive(Deserialize)]
struct PortionJson {
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
    confidence: f64,
    #[serde(default)]
    serving_description: String,
}

/// Typical single-portion nutrition for a coarse dish category
struct TypicalPortion {
    keywords: &'static [&'static str],
    nutrition: NutritionFacts,
}

/// Sanity bounds for common dish categories, per typical restaurant portion
const TYPICAL_PORTIONS: &[TypicalPortion] = &[
    TypicalPortion {
        keywords: &["burger", "cheeseburger"],
        nutrition: NutritionFacts::new(550.0, 28.0, 42.0, 30.0, 2.5),
    },
    TypicalPortion {
        keywords: &["pizza"],
        nutrition: NutritionFacts::new(570.0, 24.0, 62.0, 24.0, 4.0),
    },
    TypicalPortion {
        keywords: &["fries", "chips"],
        nutrition: NutritionFacts::new(365.0, 4.0, 48.0, 17.0, 4.5),
    },
    TypicalPortion {
        keywords: &["salad"],
        nutrition: NutritionFacts::new(250.0, 8.0, 14.0, 18.0, 4.0),
    },
    TypicalPortion {
        keywords: &["pasta", "spaghetti", "lasagna", "noodle", "ramen", "pad thai"],
        nutrition: NutritionFacts::new(480.0, 18.0, 62.0, 16.0, 4.0),
    },
    TypicalPortion {
        keywords: &["sandwich", "wrap", "sub"],
        nutrition: NutritionFacts::new(400.0, 20.0, 42.0, 16.0, 3.0),
    },
    TypicalPortion {
        keywords: &["soup", "stew", "chowder"],
        nutrition: NutritionFacts::new(200.0, 10.0, 20.0, 8.0, 3.0),
    },
    TypicalPortion {
        keywords: &["curry", "tikka", "masala"],
        nutrition: NutritionFacts::new(450.0, 22.0, 34.0, 24.0, 5.0),
    },
    TypicalPortion {
        keywords: &["sushi", "maki", "nigiri"],
        nutrition: NutritionFacts::new(350.0, 14.0, 58.0, 6.0, 2.0),
    },
    TypicalPortion {
        keywords: &["taco", "burrito", "quesadilla"],
        nutrition: NutritionFacts::new(480.0, 22.0, 48.0, 22.0, 6.0),
    },
    TypicalPortion {
        keywords: &["steak", "chop", "roast"],
        nutrition: NutritionFacts::new(450.0, 42.0, 2.0, 30.0, 0.0),
    },
    TypicalPortion {
        keywords: &["apple", "banana", "orange", "pear", "fruit"],
        nutrition: NutritionFacts::new(95.0, 0.5, 25.0, 0.3, 4.0),
    },
    TypicalPortion {
        keywords: &["cake", "brownie", "pie", "dessert", "cookie"],
        nutrition: NutritionFacts::new(370.0, 4.0, 50.0, 17.0, 1.5),
    },
    TypicalPortion {
        keywords: &["omelette", "scrambled egg", "eggs", "frittata"],
        nutrition: NutritionFacts::new(220.0, 14.0, 2.0, 17.0, 0.0),
    },
    TypicalPortion {
        keywords: &["oatmeal", "porridge", "cereal", "granola"],
        nutrition: NutritionFacts::new(220.0, 7.0, 38.0, 4.0, 5.0),
    },
];

fn typical_portion_for(dish: &str) -> Option<&'static TypicalPortion> {
    let normalized = dish.to_lowercase();
    TYPICAL_PORTIONS
        .iter()
        .find(|portion| portion.keywords.iter().any(|k| normalized.contains(k)))
}

fn clamp_field(value: f64, reference: f64) -> f64 {
    if reference <= 0.0 {
        return value.max(0.0);
    }
    value.clamp(reference * (1.0 - CLAMP_BAND), reference * (1.0 + CLAMP_BAND))
}

/// Clamp an estimate into the ±50% band around the category's typical
/// portion. Dishes with no category pass through unclamped (negatives
/// still zeroed). Returns the facts and whether any field was clamped.
pub fn clamp_to_typical(dish: &str, facts: NutritionFacts) -> (NutritionFacts, bool) {
    let Some(typical) = typical_portion_for(dish) else {
        let sanitized = NutritionFacts {
            calories: facts.calories.max(0.0),
            protein_g: facts.protein_g.max(0.0),
            carbs_g: facts.carbs_g.max(0.0),
            fat_g: facts.fat_g.max(0.0),
            fiber_g: facts.fiber_g.max(0.0),
        };
        return (sanitized, false);
    };

    let clamped = NutritionFacts {
        calories: clamp_field(facts.calories, typical.nutrition.calories),
        protein_g: clamp_field(facts.protein_g, typical.nutrition.protein_g),
        carbs_g: clamp_field(facts.carbs_g, typical.nutrition.carbs_g),
        fat_g: clamp_field(facts.fat_g, typical.nutrition.fat_g),
        fiber_g: clamp_field(facts.fiber_g, typical.nutrition.fiber_g),
    };
    let was_clamped = clamped != facts;
    (clamped, was_clamped)
}

/// Estimate the nutrition of the primary dish, excluding the named
/// siblings. Low confidence is not a failure here: it is a signal the
/// synthesis and clarification layers consume.
pub async fn estimate_portion(
    vision: &dyn VisionApi,
    cache_store: &dyn ResponseCache,
    retry: &RetryPolicy,
    photo: &[u8],
    primary: &str,
    siblings: &[String],
    ttl: Duration,
) -> Result<NutritionEstimate> {
    // Sibling exclusions change the estimate, so they are part of the key
    let mut context: Vec<&str> = vec![primary];
    context.extend(siblings.iter().map(|s| s.as_str()));
    let key = cache::cache_key(STAGE, photo, &context);
    if let Some(cached) = cache::get_json::<NutritionEstimate>(cache_store, &key) {
        return Ok(cached);
    }

    let request = VisionRequest::new(PORTION_SYSTEM, portion_user(primary, siblings), photo);
    let response = retry.run(|_| vision.complete(&request)).await?;

    let raw = match parse_stage_json::<PortionJson>(STAGE, &response.content) {
        Ok(raw) => raw,
        Err(_) => {
            let corrective = request.with_corrective_suffix(PORTION_CORRECTIVE);
            let response = retry.run(|_| vision.complete(&corrective)).await?;
            parse_stage_json::<PortionJson>(STAGE, &response.content)?
        }
    };

    let facts = NutritionFacts {
        calories: raw.calories,
        protein_g: raw.protein_g,
        carbs_g: raw.carbs_g,
        fat_g: raw.fat_g,
        fiber_g: raw.fiber_g,
    };
    let (clamped, was_clamped) = clamp_to_typical(primary, facts);
    if was_clamped {
        debug!(
            dish = primary,
            raw_calories = facts.calories,
            clamped_calories = clamped.calories,
            "portion estimate clamped to typical-portion band"
        );
    }

    let estimate = NutritionEstimate {
        nutrition: clamped,
        confidence: raw.confidence.clamp(0.0, 1.0),
        serving_description: if raw.serving_description.trim().is_empty() {
            "1 serving".to_string()
        } else {
            raw.serving_description.trim().to_string()
        },
        source: AI_VISION_SOURCE.to_string(),
    };

    cache::set_json(cache_store, &key, &estimate, ttl);
    Ok(estimate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryResponseCache;
    use crate::testing::ScriptedVision;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_undercounted_burger_is_clamped_up() {
        // A burger scored as if it were a single ingredient
        let (clamped, was_clamped) =
            clamp_to_typical("hamburger", NutritionFacts::new(120.0, 5.0, 10.0, 4.0, 0.5));
        assert!(was_clamped);
        assert_eq!(clamped.calories, 550.0 * 0.5);
    }

    #[test]
    fn test_overcounted_burger_is_clamped_down() {
        let (clamped, was_clamped) =
            clamp_to_typical("hamburger", NutritionFacts::new(1400.0, 60.0, 90.0, 80.0, 6.0));
        assert!(was_clamped);
        assert_eq!(clamped.calories, 550.0 * 1.5);
    }

    #[test]
    fn test_plausible_estimate_passes_through() {
        let facts = NutritionFacts::new(540.0, 26.0, 40.0, 28.0, 2.0);
        let (clamped, was_clamped) = clamp_to_typical("hamburger", facts);
        assert!(!was_clamped);
        assert_eq!(clamped, facts);
    }

    #[test]
    fn test_unknown_category_is_not_clamped() {
        let facts = NutritionFacts::new(9000.0, 1.0, 1.0, 1.0, 0.0);
        let (clamped, was_clamped) = clamp_to_typical("mystery dish", facts);
        assert!(!was_clamped);
        assert_eq!(clamped.calories, 9000.0);
    }

    #[tokio::test]
    async fn test_estimate_parses_and_caches() {
        let reply = r#"{"calories": 540, "protein_g": 26, "carbs_g": 40, "fat_g": 28,
            "fiber_g": 2, "confidence": 0.8, "serving_description": "1 burger (~220g)"}"#;
        let vision = ScriptedVision::replies(&[reply]);
        let cache_store = MemoryResponseCache::new();
        let siblings = vec!["french fries".to_string()];

        let estimate = estimate_portion(
            &vision,
            &cache_store,
            &fast_retry(),
            b"photo",
            "hamburger",
            &siblings,
            cache::VISION_TTL,
        )
        .await
        .unwrap();
        assert_eq!(estimate.nutrition.calories, 540.0);
        assert_eq!(estimate.source, AI_VISION_SOURCE);

        let again = estimate_portion(
            &vision,
            &cache_store,
            &fast_retry(),
            b"photo",
            "hamburger",
            &siblings,
            cache::VISION_TTL,
        )
        .await
        .unwrap();
        assert_eq!(again, estimate);
        assert_eq!(vision.calls(), 1);
    }

    #[tokio::test]
    async fn test_sibling_set_changes_cache_key() {
        let reply = r#"{"calories": 540, "protein_g": 26, "carbs_g": 40, "fat_g": 28,
            "fiber_g": 2, "confidence": 0.8, "serving_description": "1 burger"}"#;
        let vision = ScriptedVision::replies(&[reply, reply]);
        let cache_store = MemoryResponseCache::new();

        estimate_portion(
            &vision,
            &cache_store,
            &fast_retry(),
            b"photo",
            "hamburger",
            &[],
            cache::VISION_TTL,
        )
        .await
        .unwrap();
        estimate_portion(
            &vision,
            &cache_store,
            &fast_retry(),
            b"photo",
            "hamburger",
            &["french fries".to_string()],
            cache::VISION_TTL,
        )
        .await
        .unwrap();
        assert_eq!(vision.calls(), 2);
    }

    #[tokio::test]
    async fn test_low_confidence_is_not_an_error() {
        let reply = r#"{"calories": 300, "protein_g": 10, "carbs_g": 30, "fat_g": 12,
            "fiber_g": 2, "confidence": 0.3, "serving_description": "1 bowl"}"#;
        let vision = ScriptedVision::replies(&[reply]);
        let cache_store = MemoryResponseCache::new();

        let estimate = estimate_portion(
            &vision,
            &cache_store,
            &fast_retry(),
            b"photo",
            "mystery dish",
            &[],
            cache::VISION_TTL,
        )
        .await
        .unwrap();
        assert_eq!(estimate.confidence, 0.3);
    }
}
