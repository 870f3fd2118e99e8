use serde::Deserialize;

use narration_core::{EmotionalDirective, SegmentPlan, SegmentSpec};

use crate::error::ApiError;

/// Maximum number of segments in one narration
const MAX_SEGMENTS: usize = 64;
/// Maximum text length per segment, in characters
const MAX_TEXT_LENGTH: usize = 5000;
/// Maximum emotion tag length
const MAX_EMOTION_LENGTH: usize = 32;
/// Used when the planner gives no duration estimate
const ESTIMATED_MS_PER_CHAR: u64 = 80;
const MIN_ESTIMATED_MS: u64 = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct NarrationRequest {
    /// Emotion tag driving background-music selection, e.g. "anxiety".
    pub emotion: String,
    pub segments: Vec<SegmentRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentRequest {
    pub text: String,
    pub style: Option<String>,
    pub pacing: Option<String>,
    pub breathing: Option<String>,
    pub arc_position: Option<f32>,
    pub estimated_duration_ms: Option<u64>,
}

/// Validate a narration request and turn it into a segment plan.
pub fn validate_narration_request(req: &NarrationRequest) -> Result<SegmentPlan, ApiError> {
    validate_emotion(&req.emotion)?;

    if req.segments.is_empty() {
        return Err(ApiError::InvalidInput("At least one segment is required".to_string()));
    }
    if req.segments.len() > MAX_SEGMENTS {
        return Err(ApiError::InvalidInput(format!(
            "Too many segments (max {})",
            MAX_SEGMENTS
        )));
    }

    let total = req.segments.len();
    let mut specs = Vec::with_capacity(total);
    for (i, seg) in req.segments.iter().enumerate() {
        let index = i + 1;
        let chars = seg.text.trim().chars().count();
        if chars == 0 {
            return Err(ApiError::InvalidInput(format!("Segment {index} text cannot be empty")));
        }
        if chars > MAX_TEXT_LENGTH {
            return Err(ApiError::InvalidInput(format!(
                "Segment {index} text too long (max {} characters)",
                MAX_TEXT_LENGTH
            )));
        }

        let defaults = EmotionalDirective::default();
        let arc_position = seg.arc_position.unwrap_or(if total > 1 {
            i as f32 / (total - 1) as f32
        } else {
            0.0
        });
        specs.push(SegmentSpec {
            index,
            text: seg.text.trim().to_string(),
            directive: EmotionalDirective {
                style: seg.style.clone().unwrap_or(defaults.style),
                pacing: seg.pacing.clone().unwrap_or(defaults.pacing),
                breathing: seg.breathing.clone().unwrap_or(defaults.breathing),
                arc_position,
            },
            estimated_duration_ms: seg
                .estimated_duration_ms
                .unwrap_or((chars as u64 * ESTIMATED_MS_PER_CHAR).max(MIN_ESTIMATED_MS)),
        });
    }

    SegmentPlan::new(specs).map_err(|e| ApiError::InvalidInput(e.to_string()))
}

/// Emotion tags are short lowercase words: letters, '_' or '-'.
fn validate_emotion(emotion: &str) -> Result<(), ApiError> {
    let valid = !emotion.is_empty()
        && emotion.len() <= MAX_EMOTION_LENGTH
        && emotion
            .chars()
            .all(|c| c.is_ascii_lowercase() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ApiError::InvalidInput(format!(
            "Invalid emotion tag: {}. Expected lowercase letters, '_' or '-' (e.g., anxiety)",
            emotion
        )))
    }
}
