//! Capture sessions: the unit of work for one food photo
//!
//! A session owns the raw inputs and every intermediate artifact produced
//! while resolving them; only the synthesized record outlives it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raw inputs for one analysis request
#[derive(Debug, Clone, Default)]
pub struct FoodCapture {
    /// The food photograph
    pub photo: Vec<u8>,
    /// Optional scanned barcode
    pub barcode: Option<String>,
    /// Optional photograph of the product's nutrition label
    pub label_photo: Option<Vec<u8>>,
}

impl FoodCapture {
    pub fn new(photo: Vec<u8>) -> Self {
        Self {
            photo,
            ..Self::default()
        }
    }

    pub fn with_barcode(mut self, barcode: impl Into<String>) -> Self {
        self.barcode = Some(barcode.into());
        self
    }

    pub fn with_label_photo(mut self, label_photo: Vec<u8>) -> Self {
        self.label_photo = Some(label_photo);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Resolved,
    Failed,
    Abandoned,
}

/// One in-flight capture, from photo to persisted record
#[derive(Debug)]
pub struct FoodCaptureSession {
    pub id: Uuid,
    pub capture: FoodCapture,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
}

impl FoodCaptureSession {
    pub fn new(capture: FoodCapture) -> Self {
        Self {
            id: Uuid::new_v4(),
            capture,
            created_at: Utc::now(),
            status: SessionStatus::InProgress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_starts_in_progress() {
        let session = FoodCaptureSession::new(FoodCapture::new(vec![1, 2, 3]));
        assert_eq!(session.status, SessionStatus::InProgress);
        assert!(session.capture.barcode.is_none());
    }

    #[test]
    fn test_capture_builders() {
        let capture = FoodCapture::new(vec![1])
            .with_barcode("0123456789012")
            .with_label_photo(vec![2]);
        assert_eq!(capture.barcode.as_deref(), Some("0123456789012"));
        assert!(capture.label_photo.is_some());
    }
}
