//! Stage 1: dish identification
//!
//! Lists the menu-level dishes present in a photo and flags the primary
//! one. The dish-level naming contract is enforced twice: in the prompt,
//! and structurally on the parsed response: a candidate list with no
//! discernible dish granularity is rejected and retried once with a
//! corrective instruction before surfacing `MalformedResponse`.

use crate::cache::{self, ResponseCache};
use crate::error::{EngineError, Result};
use crate::retry::RetryPolicy;
use crate::vision::parse::parse_stage_json;
use crate::vision::prompts::{identify_user, IDENTIFY_CORRECTIVE, IDENTIFY_SYSTEM};
use crate::vision::{VisionApi, VisionRequest};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const STAGE: &str = "dish_identification";

/// One menu-level dish candidate. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DishCandidate {
    pub name: String,
    pub confidence: f64,
    pub is_primary: bool,
}

impl DishCandidate {
    pub fn new(name: impl Into<String>, confidence: f64, is_primary: bool) -> Self {
        Self {
            name: name.into(),
            confidence,
            is_primary,
        }
    }
}

#[derive(Deserialize)]
struct IdentifyJson {
    candidates: Vec<CandidateJson>,
}

#[derive(Deserialize)]
struct CandidateJson {
    name: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    is_primary: bool,
}

/// Ingredient-level words the model sometimes returns instead of dishes.
/// A response whose candidates all sit in this vocabulary has no dish
/// granularity and fails structural validation.
const INGREDIENT_WORDS: &[&str] = &[
    "bun", "patty", "lettuce", "tomato", "onion", "cheese", "pickle", "bread", "dough", "flour",
    "butter", "sugar", "salt", "pepper", "oil", "sauce", "mayonnaise", "ketchup", "mustard",
    "noodle", "noodles", "rice", "beans", "egg", "garlic", "herbs", "cream", "milk", "meat",
    "beef", "pork", "chicken breast raw", "broth", "seasoning", "spices", "croutons",
];

fn is_ingredient_level(name: &str) -> bool {
    let normalized = name.trim().to_lowercase();
    INGREDIENT_WORDS.contains(&normalized.as_str())
}

/// True when the candidate list carries no dish-level name at all
fn lacks_dish_granularity(candidates: &[CandidateJson]) -> bool {
    candidates.is_empty() || candidates.iter().all(|c| is_ingredient_level(&c.name))
}

/// Normalize a parsed candidate list: clamp confidences, order by
/// confidence, enforce exactly one primary (the strongest candidate),
/// and drop the overflow beyond `max_candidates`.
fn normalize_candidates(raw: Vec<CandidateJson>, max_candidates: usize) -> Vec<DishCandidate> {
    let mut candidates: Vec<DishCandidate> = raw
        .into_iter()
        .filter(|c| !c.name.trim().is_empty() && !is_ingredient_level(&c.name))
        .map(|c| DishCandidate {
            name: c.name.trim().to_lowercase(),
            confidence: c.confidence.clamp(0.0, 1.0),
            is_primary: c.is_primary,
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(max_candidates.max(1));

    // Exactly one primary: the model's flag is advisory, the strongest
    // candidate wins when it is missing or duplicated.
    let primary_idx = candidates
        .iter()
        .position(|c| c.is_primary)
        .filter(|_| candidates.iter().filter(|c| c.is_primary).count() == 1)
        .unwrap_or(0);
    for (i, candidate) in candidates.iter_mut().enumerate() {
        candidate.is_primary = i == primary_idx;
    }

    candidates
}

fn validate_and_normalize(
    raw: IdentifyJson,
    max_candidates: usize,
) -> Result<Vec<DishCandidate>> {
    if lacks_dish_granularity(&raw.candidates) {
        return Err(EngineError::malformed(
            STAGE,
            "candidate list has no dish-level names",
        ));
    }
    let candidates = normalize_candidates(raw.candidates, max_candidates);
    if candidates.is_empty() {
        return Err(EngineError::malformed(STAGE, "no usable candidates"));
    }
    Ok(candidates)
}

/// Identify the dishes in a photo, returning an ordered candidate list
/// with exactly one primary. Served through the response cache; transient
/// upstream failures surface as `EngineError::Upstream` after retries.
pub async fn identify_dishes(
    vision: &dyn VisionApi,
    cache_store: &dyn ResponseCache,
    retry: &RetryPolicy,
    photo: &[u8],
    max_candidates: usize,
    ttl: Duration,
) -> Result<Vec<DishCandidate>> {
    let key = cache::cache_key(STAGE, photo, &[&max_candidates.to_string()]);
    if let Some(cached) = cache::get_json::<Vec<DishCandidate>>(cache_store, &key) {
        return Ok(cached);
    }

    let request = VisionRequest::new(IDENTIFY_SYSTEM, identify_user(max_candidates), photo);
    let response = retry.run(|_| vision.complete(&request)).await?;

    let candidates = match parse_stage_json::<IdentifyJson>(STAGE, &response.content)
        .and_then(|raw| validate_and_normalize(raw, max_candidates))
    {
        Ok(candidates) => candidates,
        Err(first_failure) => {
            // One corrective retry with a stronger instruction
            warn!(error = %first_failure, "dish identification failed validation, retrying once");
            let corrective = request.with_corrective_suffix(IDENTIFY_CORRECTIVE);
            let response = retry.run(|_| vision.complete(&corrective)).await?;
            parse_stage_json::<IdentifyJson>(STAGE, &response.content)
                .and_then(|raw| validate_and_normalize(raw, max_candidates))?
        }
    };

    debug!(
        count = candidates.len(),
        primary = %candidates.first().map(|c| c.name.as_str()).unwrap_or(""),
        "dish identification complete"
    );
    cache::set_json(cache_store, &key, &candidates, ttl);
    Ok(candidates)
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

    const BURGER_JSON: &str = r#"{"candidates":[
        {"name":"hamburger","confidence":0.92,"is_primary":true},
        {"name":"french fries","confidence":0.85,"is_primary":false}
    ]}"#;

    #[tokio::test]
    async fn test_identifies_and_caches() {
        let vision = ScriptedVision::replies(&[BURGER_JSON]);
        let cache_store = MemoryResponseCache::new();
        let photo = b"burger-photo";

        let candidates =
            identify_dishes(&vision, &cache_store, &fast_retry(), photo, 5, cache::VISION_TTL)
                .await
                .unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].name, "hamburger");
        assert!(candidates[0].is_primary);
        assert!(!candidates[1].is_primary);

        // Second call is a cache hit: the scripted vision has no replies left
        let again =
            identify_dishes(&vision, &cache_store, &fast_retry(), photo, 5, cache::VISION_TTL)
                .await
                .unwrap();
        assert_eq!(again, candidates);
        assert_eq!(vision.calls(), 1);
    }

    #[tokio::test]
    async fn test_ingredient_only_list_triggers_corrective_retry() {
        let ingredients = r#"{"candidates":[
            {"name":"bun","confidence":0.9,"is_primary":true},
            {"name":"patty","confidence":0.8,"is_primary":false}
        ]}"#;
        let vision = ScriptedVision::replies(&[ingredients, BURGER_JSON]);
        let cache_store = MemoryResponseCache::new();

        let candidates =
            identify_dishes(&vision, &cache_store, &fast_retry(), b"p", 5, cache::VISION_TTL)
                .await
                .unwrap();
        assert_eq!(candidates[0].name, "hamburger");
        assert_eq!(vision.calls(), 2);
    }

    #[tokio::test]
    async fn test_malformed_after_corrective_retry_surfaces() {
        let vision = ScriptedVision::replies(&["not json at all", "still not json"]);
        let cache_store = MemoryResponseCache::new();

        let err =
            identify_dishes(&vision, &cache_store, &fast_retry(), b"p", 5, cache::VISION_TTL)
                .await
                .unwrap_err();
        assert!(matches!(err, EngineError::MalformedResponse { .. }));
        assert_eq!(vision.calls(), 2);
    }

    #[tokio::test]
    async fn test_mixed_list_keeps_only_dishes() {
        let mixed = r#"{"candidates":[
            {"name":"Hamburger","confidence":0.9,"is_primary":false},
            {"name":"lettuce","confidence":0.95,"is_primary":true}
        ]}"#;
        let vision = ScriptedVision::replies(&[mixed]);
        let cache_store = MemoryResponseCache::new();

        let candidates =
            identify_dishes(&vision, &cache_store, &fast_retry(), b"p", 5, cache::VISION_TTL)
                .await
                .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "hamburger");
        assert!(candidates[0].is_primary);
    }

    #[test]
    fn test_normalize_enforces_single_primary() {
        let raw = vec![
            CandidateJson {
                name: "ramen".to_string(),
                confidence: 0.7,
                is_primary: true,
            },
            CandidateJson {
                name: "gyoza".to_string(),
                confidence: 0.9,
                is_primary: true,
            },
        ];
        let candidates = normalize_candidates(raw, 5);
        // Duplicate primary flags: the strongest candidate wins
        assert_eq!(candidates[0].name, "gyoza");
        assert!(candidates[0].is_primary);
        assert_eq!(candidates.iter().filter(|c| c.is_primary).count(), 1);
    }
}
