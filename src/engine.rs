//! Pipeline orchestration: from raw capture to synthesized record
//!
//! Barcode resolution and label extraction run concurrently with dish
//! identification; portion estimation waits on the primary dish. Synthesis
//! runs once every requested source has completed or fallen past the
//! per-session deadline: a slow source reads as absent, never as a hard
//! failure, so one slow upstream cannot abort a resolvable session.

use crate::barcode::{resolve_barcode, BarcodeCache, ProductDatabase};
use crate::cache::ResponseCache;
use crate::capture::{FoodCapture, FoodCaptureSession, SessionStatus};
use crate::clarify::{ClarificationSession, TurnResult};
use crate::error::{EngineError, Result};
use crate::identify::identify_dishes;
use crate::label::extract_label;
use crate::portion::estimate_portion;
use crate::record::{ProvenanceEntry, SynthesizedNutritionRecord};
use crate::reference::match_reference;
use crate::retry::RetryPolicy;
use crate::synthesis::{synthesize, ConfirmedDish, SourceSet, SynthesisOutcome, SynthesisSettings};
use crate::vision::VisionApi;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

/// Tuning knobs for one engine instance
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Maximum dish candidates requested from identification
    pub max_candidates: usize,
    /// Overall per-session deadline across all sources and retries
    pub session_deadline: Duration,
    /// TTL for cached vision-stage results
    pub vision_ttl: Duration,
    /// Clarification turn budget
    pub max_clarification_turns: usize,
    pub synthesis: SynthesisSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_candidates: 5,
            session_deadline: Duration::from_secs(10),
            vision_ttl: crate::cache::VISION_TTL,
            max_clarification_turns: crate::clarify::DEFAULT_MAX_TURNS,
            synthesis: SynthesisSettings::default(),
        }
    }
}

/// What the entry points hand back: a finalized record, or an open
/// clarification the conversational surface must answer.
#[derive(Debug, Clone)]
pub enum AnalysisOutcome {
    Record(SynthesizedNutritionRecord),
    Clarification(ClarificationPrompt),
}

/// The conversational surface's view of an open clarification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationPrompt {
    pub session_id: Uuid,
    pub question: String,
    pub quick_replies: Vec<String>,
}

impl From<&ClarificationSession> for ClarificationPrompt {
    fn from(session: &ClarificationSession) -> Self {
        Self {
            session_id: session.id,
            question: session.current_question().unwrap_or_default().to_string(),
            quick_replies: session.quick_replies.clone(),
        }
    }
}

/// Persistence collaborator: receives the final record for the food diary
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn persist(
        &self,
        capture_id: Uuid,
        record: &SynthesizedNutritionRecord,
    ) -> anyhow::Result<()>;
}

/// In-memory store, used by tests and embedders that persist elsewhere
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<Vec<(Uuid, SynthesizedNutritionRecord)>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SynthesizedNutritionRecord> {
        self.records
            .read()
            .map(|r| r.iter().map(|(_, record)| record.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn persist(
        &self,
        capture_id: Uuid,
        record: &SynthesizedNutritionRecord,
    ) -> anyhow::Result<()> {
        self.records
            .write()
            .map_err(|_| anyhow::anyhow!("record store lock poisoned"))?
            .push((capture_id, record.clone()));
        Ok(())
    }
}

/// Append-only JSONL store, the default persistence for the CLI
pub struct JsonlRecordStore {
    path: PathBuf,
}

impl JsonlRecordStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl RecordStore for JsonlRecordStore {
    async fn persist(
        &self,
        capture_id: Uuid,
        record: &SynthesizedNutritionRecord,
    ) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::json!({
            "capture_id": capture_id,
            "recorded_at": Utc::now(),
            "record": record,
        });
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

/// Per-source completion state inside the deadline window
enum SourceOutcome<T> {
    Ready(T),
    NotRequested,
    /// Failed transiently or definitively missed; reads as absent
    Unavailable,
    /// Missed the session deadline; reads as absent
    TimedOut,
    /// Non-recoverable error that must surface to the caller
    Failed(EngineError),
}

impl<T> SourceOutcome<T> {
    fn timed_out(&self) -> bool {
        matches!(self, SourceOutcome::TimedOut)
    }

    fn into_option(self) -> Result<Option<T>> {
        match self {
            SourceOutcome::Ready(value) => Ok(Some(value)),
            SourceOutcome::Failed(err) => Err(err),
            _ => Ok(None),
        }
    }
}

/// The multimodal food-recognition and nutrition-synthesis engine
pub struct NutritionEngine {
    vision: Arc<dyn VisionApi>,
    products: Arc<dyn ProductDatabase>,
    cache: Arc<dyn ResponseCache>,
    store: Arc<dyn RecordStore>,
    barcode_cache: BarcodeCache,
    clarifications: RwLock<HashMap<Uuid, ClarificationSession>>,
    retry: RetryPolicy,
    settings: EngineSettings,
}

impl NutritionEngine {
    pub fn new(
        vision: Arc<dyn VisionApi>,
        products: Arc<dyn ProductDatabase>,
        cache: Arc<dyn ResponseCache>,
        store: Arc<dyn RecordStore>,
        barcode_cache: BarcodeCache,
        settings: EngineSettings,
    ) -> Self {
        Self {
            vision,
            products,
            cache,
            store,
            barcode_cache,
            clarifications: RwLock::new(HashMap::new()),
            retry: RetryPolicy::default(),
            settings,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Analyze one capture. Returns the finalized record directly when the
    /// evidence is unambiguous, otherwise an open clarification prompt.
    pub async fn analyze_food_capture(&self, capture: FoodCapture) -> Result<AnalysisOutcome> {
        let mut session = FoodCaptureSession::new(capture);
        info!(
            session_id = %session.id,
            has_barcode = session.capture.barcode.is_some(),
            has_label = session.capture.label_photo.is_some(),
            "analyzing food capture"
        );

        let deadline = self.settings.session_deadline;
        let started = Instant::now();

        // Barcode and label are independent of dish identification and run
        // concurrently with it; each source is bounded by the shared deadline.
        let barcode_task = async {
            match session.capture.barcode.as_deref() {
                None => SourceOutcome::NotRequested,
                Some(code) => {
                    let lookup = resolve_barcode(
                        self.products.as_ref(),
                        &self.barcode_cache,
                        &self.retry,
                        code,
                    );
                    match timeout(deadline, lookup).await {
                        Ok(Some(result)) => SourceOutcome::Ready(result),
                        Ok(None) => SourceOutcome::Unavailable,
                        Err(_) => SourceOutcome::TimedOut,
                    }
                }
            }
        };

        let label_task = async {
            match session.capture.label_photo.as_deref() {
                None => SourceOutcome::NotRequested,
                Some(photo) => {
                    let extraction = extract_label(
                        self.vision.as_ref(),
                        self.cache.as_ref(),
                        &self.retry,
                        photo,
                        self.settings.vision_ttl,
                    );
                    match timeout(deadline, extraction).await {
                        Ok(Ok(extraction)) => SourceOutcome::Ready(extraction),
                        Ok(Err(EngineError::Upstream(err))) => {
                            warn!(error = %err, "label extraction unavailable");
                            SourceOutcome::Unavailable
                        }
                        Ok(Err(other)) => SourceOutcome::Failed(other),
                        Err(_) => SourceOutcome::TimedOut,
                    }
                }
            }
        };

        let dishes_task = async {
            let identification = identify_dishes(
                self.vision.as_ref(),
                self.cache.as_ref(),
                &self.retry,
                &session.capture.photo,
                self.settings.max_candidates,
                self.settings.vision_ttl,
            );
            match timeout(deadline, identification).await {
                Ok(Ok(candidates)) => SourceOutcome::Ready(candidates),
                Ok(Err(EngineError::Upstream(err))) => {
                    warn!(error = %err, "dish identification unavailable");
                    SourceOutcome::Unavailable
                }
                Ok(Err(other)) => SourceOutcome::Failed(other),
                Err(_) => SourceOutcome::TimedOut,
            }
        };

        let (barcode, label, dishes) = tokio::join!(barcode_task, label_task, dishes_task);

        let mut timed_out = barcode.timed_out() || label.timed_out() || dishes.timed_out();
        let barcode = barcode.into_option()?;
        let label = label.into_option()?;
        let candidates = dishes.into_option()?.unwrap_or_default();

        // Stage 2 is scoped to the primary dish and waits for identification
        let estimate = match candidates.iter().find(|c| c.is_primary) {
            None => None,
            Some(primary) => {
                let siblings: Vec<String> = candidates
                    .iter()
                    .filter(|c| !c.is_primary)
                    .map(|c| c.name.clone())
                    .collect();
                let remaining = deadline.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    timed_out = true;
                    None
                } else {
                    let estimation = estimate_portion(
                        self.vision.as_ref(),
                        self.cache.as_ref(),
                        &self.retry,
                        &session.capture.photo,
                        &primary.name,
                        &siblings,
                        self.settings.vision_ttl,
                    );
                    match timeout(remaining, estimation).await {
                        Ok(Ok(estimate)) => Some(estimate),
                        Ok(Err(EngineError::Upstream(err))) => {
                            warn!(error = %err, "portion estimation unavailable");
                            None
                        }
                        Ok(Err(other)) => return Err(other),
                        Err(_) => {
                            timed_out = true;
                            None
                        }
                    }
                }
            }
        };

        let reference = candidates
            .iter()
            .find(|c| c.is_primary)
            .and_then(|primary| match_reference(&primary.name));

        let sources = SourceSet {
            barcode,
            label,
            reference,
            estimate,
        };

        if sources.is_empty() {
            session.status = SessionStatus::Failed;
            if timed_out {
                return Err(EngineError::SessionTimeout {
                    deadline_secs: deadline.as_secs(),
                });
            }
            return Err(EngineError::NoSourceAvailable);
        }

        match synthesize(&candidates, &sources, &self.settings.synthesis, None)? {
            SynthesisOutcome::Record(record) => {
                session.status = SessionStatus::Resolved;
                info!(
                    session_id = %session.id,
                    status = ?session.status,
                    source = record.source.label(),
                    "capture session resolved"
                );
                self.persist(session.id, &record).await;
                Ok(AnalysisOutcome::Record(record))
            }
            SynthesisOutcome::Ambiguous {
                reason,
                provisional,
            } => {
                info!(session_id = %session.id, reason = %reason, "deferring to clarification");
                let dialogue = ClarificationSession::open(
                    session.id,
                    candidates,
                    sources,
                    provisional,
                    &reason,
                    self.settings.max_clarification_turns,
                );
                let prompt = ClarificationPrompt::from(&dialogue);
                if let Ok(mut sessions) = self.clarifications.write() {
                    sessions.insert(dialogue.id, dialogue);
                }
                Ok(AnalysisOutcome::Clarification(prompt))
            }
        }
    }

    /// Advance an open clarification by one turn. Abandonment is a soft
    /// outcome: the lowest-risk fallback is persisted flagged for
    /// confirmation rather than surfaced as an error.
    pub async fn respond_to_clarification(
        &self,
        session_id: Uuid,
        user_reply: &str,
    ) -> Result<AnalysisOutcome> {
        enum Step {
            Ask(ClarificationPrompt),
            Resolved(Box<ClarificationSession>, ConfirmedDish),
            Abandoned(Box<ClarificationSession>),
        }

        // All dialogue state lives in the stored session; mutate it under
        // the lock and drop the lock before any await.
        let step = {
            let mut sessions = self
                .clarifications
                .write()
                .map_err(|_| EngineError::UnknownClarification(session_id))?;
            let dialogue = sessions
                .get_mut(&session_id)
                .filter(|d| d.is_open())
                .ok_or(EngineError::UnknownClarification(session_id))?;

            match dialogue.record_reply(user_reply) {
                TurnResult::Ask(_) => Step::Ask(ClarificationPrompt::from(&*dialogue)),
                TurnResult::Resolved(confirmed) => {
                    let owned = sessions
                        .remove(&session_id)
                        .ok_or(EngineError::UnknownClarification(session_id))?;
                    Step::Resolved(Box::new(owned), confirmed)
                }
                TurnResult::Abandoned => {
                    let owned = sessions
                        .remove(&session_id)
                        .ok_or(EngineError::UnknownClarification(session_id))?;
                    Step::Abandoned(Box::new(owned))
                }
            }
        };

        match step {
            Step::Ask(prompt) => Ok(AnalysisOutcome::Clarification(prompt)),
            Step::Resolved(dialogue, confirmed) => {
                info!(
                    session_id = %session_id,
                    dish = %confirmed.name,
                    "clarification resolved, re-entering synthesis"
                );
                // Re-enter synthesis deterministically with the confirmed
                // dish fixed; the reference match follows the confirmation.
                let mut sources = dialogue.sources.clone();
                sources.reference = match_reference(&confirmed.name);
                let record = match synthesize(
                    &dialogue.candidates,
                    &sources,
                    &self.settings.synthesis,
                    Some(&confirmed),
                )? {
                    SynthesisOutcome::Record(record) => record,
                    SynthesisOutcome::Ambiguous { provisional, .. } => provisional,
                };
                self.persist(dialogue.capture_id, &record).await;
                Ok(AnalysisOutcome::Record(record))
            }
            Step::Abandoned(dialogue) => {
                info!(session_id = %session_id, "clarification abandoned, persisting fallback");
                let mut record = dialogue.fallback.clone();
                record.needs_user_confirmation = true;
                record.provenance.push(ProvenanceEntry::used(
                    record.source,
                    format!(
                        "clarification abandoned after {} turn(s); primary-candidate fallback persisted pending confirmation",
                        dialogue.turns.len()
                    ),
                ));
                self.persist(dialogue.capture_id, &record).await;
                Ok(AnalysisOutcome::Record(record))
            }
        }
    }

    /// Best-effort persistence: a failed store write is logged, not fatal -
    /// the caller still receives the record.
    async fn persist(&self, capture_id: Uuid, record: &SynthesizedNutritionRecord) {
        if let Err(err) = self.store.persist(capture_id, record).await {
            warn!(capture_id = %capture_id, error = %err, "failed to persist nutrition record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barcode::ProductRecord;
    use crate::cache::MemoryResponseCache;
    use crate::error::UpstreamKind;
    use crate::record::{NutritionFacts, SourceKind};
    use crate::testing::{FailingVision, RoutedVision, SlowVision, StaticProducts};
    use tempfile::TempDir;

    const APPLE_IDENTIFY: &str =
        r#"{"candidates":[{"name":"apple","confidence":0.97,"is_primary":true}]}"#;
    const APPLE_PORTION: &str = r#"{"calories": 95, "protein_g": 0.5, "carbs_g": 25,
        "fat_g": 0.3, "fiber_g": 4.4, "confidence": 0.92, "serving_description": "1 medium apple"}"#;
    const BURGER_IDENTIFY: &str = r#"{"candidates":[
        {"name":"hamburger","confidence":0.90,"is_primary":true},
        {"name":"french fries","confidence":0.85,"is_primary":false}
    ]}"#;
    const BURGER_PORTION: &str = r#"{"calories": 540, "protein_g": 25, "carbs_g": 40,
        "fat_g": 29, "fiber_g": 2, "confidence": 0.85, "serving_description": "1 burger"}"#;

    struct Harness {
        engine: NutritionEngine,
        store: Arc<MemoryRecordStore>,
        _dir: TempDir,
    }

    fn harness(vision: Arc<dyn VisionApi>, products: Arc<dyn ProductDatabase>) -> Harness {
        harness_with_settings(vision, products, EngineSettings::default())
    }

    fn harness_with_settings(
        vision: Arc<dyn VisionApi>,
        products: Arc<dyn ProductDatabase>,
        settings: EngineSettings,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryRecordStore::new());
        let engine = NutritionEngine::new(
            vision,
            products,
            Arc::new(MemoryResponseCache::new()),
            store.clone(),
            BarcodeCache::open(dir.path(), 30),
            settings,
        )
        .with_retry(RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        });
        Harness {
            engine,
            store,
            _dir: dir,
        }
    }

    fn expect_record(outcome: AnalysisOutcome) -> SynthesizedNutritionRecord {
        match outcome {
            AnalysisOutcome::Record(record) => record,
            AnalysisOutcome::Clarification(prompt) => {
                panic!("expected record, got clarification: {}", prompt.question)
            }
        }
    }

    fn expect_clarification(outcome: AnalysisOutcome) -> ClarificationPrompt {
        match outcome {
            AnalysisOutcome::Clarification(prompt) => prompt,
            AnalysisOutcome::Record(record) => {
                panic!("expected clarification, got record for {}", record.dish_name)
            }
        }
    }

    #[tokio::test]
    async fn test_scenario_a_single_apple() {
        let vision = Arc::new(RoutedVision::new());
        vision.push_identify(APPLE_IDENTIFY);
        vision.push_portion(APPLE_PORTION);
        let h = harness(vision, Arc::new(StaticProducts::default()));

        let outcome = h
            .engine
            .analyze_food_capture(FoodCapture::new(b"apple-photo".to_vec()))
            .await
            .unwrap();
        let record = expect_record(outcome);
        assert_eq!(record.dish_name, "apple");
        assert!(record.nutrition.calories >= 80.0 && record.nutrition.calories <= 110.0);
        assert!(record.confidence >= 0.9);
        assert_eq!(record.source, SourceKind::ReferenceDatabase);
        assert!(!record.provenance.is_empty());
        assert_eq!(h.store.records().len(), 1);
    }

    #[tokio::test]
    async fn test_scenario_b_barcode_with_two_servings() {
        let vision = Arc::new(RoutedVision::new());
        vision.push_identify(r#"{"candidates":[{"name":"granola","confidence":0.9,"is_primary":true}]}"#);
        vision.push_portion(r#"{"calories": 220, "protein_g": 8, "carbs_g": 46, "fat_g": 2,
            "fiber_g": 6, "confidence": 0.9, "serving_description": "1 bowl"}"#);
        let products = Arc::new(StaticProducts::with(
            "0123456789012",
            ProductRecord {
                name: "Granola Crunch".to_string(),
                nutrition_per_serving: NutritionFacts::new(110.0, 4.0, 23.0, 1.0, 3.0),
            },
        ));
        let h = harness(vision, products);

        let capture = FoodCapture::new(b"granola-photo".to_vec()).with_barcode("0123456789012");
        let record = expect_record(h.engine.analyze_food_capture(capture).await.unwrap());
        assert_eq!(record.source, SourceKind::Barcode);
        assert_eq!(record.nutrition.calories, 220.0);
        assert_eq!(record.confidence, 0.99);
    }

    #[tokio::test]
    async fn test_scenario_c_ambiguous_plate_then_confirmation() {
        let vision = Arc::new(RoutedVision::new());
        vision.push_identify(BURGER_IDENTIFY);
        vision.push_portion(BURGER_PORTION);
        let h = harness(vision, Arc::new(StaticProducts::default()));

        let prompt = expect_clarification(
            h.engine
                .analyze_food_capture(FoodCapture::new(b"plate-photo".to_vec()))
                .await
                .unwrap(),
        );
        assert!(prompt.question.contains("french fries"));
        assert!(prompt.quick_replies.contains(&"hamburger".to_string()));
        // Nothing persisted while the clarification is open
        assert!(h.store.records().is_empty());

        let record = expect_record(
            h.engine
                .respond_to_clarification(prompt.session_id, "the hamburger")
                .await
                .unwrap(),
        );
        assert_eq!(record.dish_name, "hamburger");
        assert!(!record.needs_user_confirmation);
        assert_eq!(h.store.records().len(), 1);
    }

    #[tokio::test]
    async fn test_complete_label_outranks_vision_estimate() {
        let vision = Arc::new(RoutedVision::new());
        vision.push_identify(
            r#"{"candidates":[{"name":"granola bar","confidence":0.9,"is_primary":true}]}"#,
        );
        vision.push_portion(r#"{"calories": 230, "protein_g": 9, "carbs_g": 40, "fat_g": 5,
            "fiber_g": 5, "confidence": 0.8, "serving_description": "1 bar"}"#);
        vision.push_label(r#"{"calories": 110, "protein_g": 4, "carbs_g": 23, "fat_g": 1,
            "fiber_g": 3, "sugar_g": 6, "sodium_mg": 160, "saturated_fat_g": 0.5,
            "cholesterol_mg": 5, "serving_size": "1 bar (40g)"}"#);
        let h = harness(vision, Arc::new(StaticProducts::default()));

        let capture =
            FoodCapture::new(b"bar-photo".to_vec()).with_label_photo(b"label-photo".to_vec());
        let record = expect_record(h.engine.analyze_food_capture(capture).await.unwrap());
        assert_eq!(record.source, SourceKind::NutritionLabel);
        assert_eq!(record.confidence, 1.0);
        // 230 kcal estimate against a 110 kcal serving reads as two servings
        assert_eq!(record.nutrition.calories, 220.0);
    }

    #[tokio::test]
    async fn test_malformed_label_response_surfaces() {
        let vision = Arc::new(RoutedVision::new());
        vision.push_identify(APPLE_IDENTIFY);
        vision.push_portion(APPLE_PORTION);
        vision.push_label("completely unusable reply");
        let h = harness(vision, Arc::new(StaticProducts::default()));

        let capture =
            FoodCapture::new(b"apple-photo".to_vec()).with_label_photo(b"blurry-label".to_vec());
        let err = h.engine.analyze_food_capture(capture).await.unwrap_err();
        assert!(matches!(err, EngineError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn test_scenario_e_vision_outage_surfaces_no_source() {
        let vision = Arc::new(FailingVision::new(UpstreamKind::ServerError));
        let h = harness(vision.clone(), Arc::new(StaticProducts::default()));

        let err = h
            .engine
            .analyze_food_capture(FoodCapture::new(b"photo".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoSourceAvailable));
        // Retried the full budget before giving up
        assert_eq!(vision.calls(), 3);
        assert!(h.store.records().is_empty());
    }

    #[tokio::test]
    async fn test_idempotent_with_warm_cache() {
        let vision = Arc::new(RoutedVision::new());
        vision.push_identify(APPLE_IDENTIFY);
        vision.push_portion(APPLE_PORTION);
        let h = harness(vision.clone(), Arc::new(StaticProducts::default()));

        let first = expect_record(
            h.engine
                .analyze_food_capture(FoodCapture::new(b"apple-photo".to_vec()))
                .await
                .unwrap(),
        );
        let second = expect_record(
            h.engine
                .analyze_food_capture(FoodCapture::new(b"apple-photo".to_vec()))
                .await
                .unwrap(),
        );
        assert_eq!(first, second);
        // Both vision stages served from cache on the second run
        assert_eq!(vision.calls(), 2);
    }

    #[tokio::test]
    async fn test_abandonment_persists_flagged_fallback() {
        let vision = Arc::new(RoutedVision::new());
        vision.push_identify(BURGER_IDENTIFY);
        vision.push_portion(BURGER_PORTION);
        let h = harness(vision, Arc::new(StaticProducts::default()));

        let prompt = expect_clarification(
            h.engine
                .analyze_food_capture(FoodCapture::new(b"plate-photo".to_vec()))
                .await
                .unwrap(),
        );
        let record = expect_record(
            h.engine
                .respond_to_clarification(prompt.session_id, "cancel")
                .await
                .unwrap(),
        );
        assert!(record.needs_user_confirmation);
        assert_eq!(record.dish_name, "hamburger");
        assert_eq!(h.store.records().len(), 1);

        // The session is closed now
        let err = h
            .engine
            .respond_to_clarification(prompt.session_id, "hamburger")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownClarification(_)));
    }

    #[tokio::test]
    async fn test_unclear_reply_keeps_dialogue_open() {
        let vision = Arc::new(RoutedVision::new());
        vision.push_identify(BURGER_IDENTIFY);
        vision.push_portion(BURGER_PORTION);
        let h = harness(vision, Arc::new(StaticProducts::default()));

        let prompt = expect_clarification(
            h.engine
                .analyze_food_capture(FoodCapture::new(b"plate-photo".to_vec()))
                .await
                .unwrap(),
        );
        let next = h
            .engine
            .respond_to_clarification(prompt.session_id, "um, not sure")
            .await
            .unwrap();
        let next_prompt = expect_clarification(next);
        assert_eq!(next_prompt.session_id, prompt.session_id);

        let record = expect_record(
            h.engine
                .respond_to_clarification(prompt.session_id, "1")
                .await
                .unwrap(),
        );
        assert_eq!(record.dish_name, "hamburger");
    }

    #[tokio::test]
    async fn test_unknown_clarification_session() {
        let vision = Arc::new(RoutedVision::new());
        let h = harness(vision, Arc::new(StaticProducts::default()));
        let err = h
            .engine
            .respond_to_clarification(Uuid::new_v4(), "hamburger")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownClarification(_)));
    }

    #[tokio::test]
    async fn test_deadline_expiry_with_no_sources_is_timeout() {
        let vision = Arc::new(SlowVision {
            delay: Duration::from_millis(200),
            reply: APPLE_IDENTIFY.to_string(),
        });
        let settings = EngineSettings {
            session_deadline: Duration::from_millis(20),
            ..EngineSettings::default()
        };
        let h = harness_with_settings(vision, Arc::new(StaticProducts::default()), settings);

        let err = h
            .engine
            .analyze_food_capture(FoodCapture::new(b"photo".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionTimeout { .. }));
    }

    #[tokio::test]
    async fn test_slow_vision_does_not_block_barcode_resolution() {
        // Vision misses the deadline, but the barcode still resolves the session
        let vision = Arc::new(SlowVision {
            delay: Duration::from_millis(200),
            reply: APPLE_IDENTIFY.to_string(),
        });
        let products = Arc::new(StaticProducts::with(
            "555",
            ProductRecord {
                name: "Protein Bar".to_string(),
                nutrition_per_serving: NutritionFacts::new(200.0, 20.0, 18.0, 7.0, 1.0),
            },
        ));
        let settings = EngineSettings {
            session_deadline: Duration::from_millis(50),
            ..EngineSettings::default()
        };
        let h = harness_with_settings(vision, products, settings);

        let capture = FoodCapture::new(b"bar-photo".to_vec()).with_barcode("555");
        let record = expect_record(h.engine.analyze_food_capture(capture).await.unwrap());
        assert_eq!(record.source, SourceKind::Barcode);
        assert_eq!(record.dish_name, "Protein Bar");
    }

    #[tokio::test]
    async fn test_jsonl_store_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        let store = JsonlRecordStore::new(path.clone());
        let record = SynthesizedNutritionRecord {
            dish_name: "apple".to_string(),
            serving_description: "1 medium apple".to_string(),
            nutrition: NutritionFacts::new(95.0, 0.5, 25.0, 0.3, 4.4),
            confidence: 0.92,
            source: SourceKind::ReferenceDatabase,
            provenance: vec![ProvenanceEntry::used(
                SourceKind::ReferenceDatabase,
                "matched 'apple'",
            )],
            needs_user_confirmation: false,
        };

        store.persist(Uuid::new_v4(), &record).await.unwrap();
        store.persist(Uuid::new_v4(), &record).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("\"dish_name\":\"apple\""));
    }
}
