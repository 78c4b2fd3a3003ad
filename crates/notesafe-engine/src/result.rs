//! Per-call processing results

use crate::classify::ErrorKind;
use crate::session::SessionId;
use notesafe_integrity::ImageReference;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

/// Outcome of one protected note mutation
///
/// Produced exactly once per call. `success == false` always means every
/// image listed in `preserved_images` was left (or restored) byte-identical
/// to its pre-call content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    /// Whether the mutation was committed
    pub success: bool,
    /// Note the call targeted (canonical when it could be resolved)
    pub note_path: PathBuf,
    /// Images protected for the duration of the call
    pub preserved_images: Vec<ImageReference>,
    /// Wall time of the whole call, serialized as seconds
    #[serde(with = "secs_f64")]
    pub processing_time: Duration,
    /// Session that protected the call; `None` if it failed before one existed
    pub backup_session_id: Option<SessionId>,
    /// Human-readable failure reason
    pub error_message: Option<String>,
    /// Failure category
    pub error_type: Option<ErrorKind>,
    /// Payload reported by a workflow callback
    pub workflow_payload: Option<Value>,
}

impl ProcessingResult {
    /// Number of images that were protected
    #[inline]
    #[must_use]
    pub fn image_count(&self) -> usize {
        self.preserved_images.len()
    }
}

mod secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
