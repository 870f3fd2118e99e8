//! Segment specifications handed over by the upstream script planner.

use serde::{Deserialize, Serialize};

/// Per-segment guidance steering the synthesized tone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionalDirective {
    pub style: String,
    pub pacing: String,
    /// Breathing cue, e.g. "slow inhale before the first sentence".
    #[serde(default)]
    pub breathing: String,
    /// Position on the narration's emotional arc, 0.0 (opening) to 1.0 (closing).
    pub arc_position: f32,
}

impl Default for EmotionalDirective {
    fn default() -> Self {
        Self {
            style: "warm, empathetic, sincere".to_string(),
            pacing: "slow and steady".to_string(),
            breathing: "natural breathing pauses".to_string(),
            arc_position: 0.0,
        }
    }
}

/// One independently synthesized slice of narration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSpec {
    /// 1-based position in the narration.
    pub index: usize,
    pub text: String,
    pub directive: EmotionalDirective,
    pub estimated_duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    #[error("a narration needs at least one segment")]
    Empty,
    #[error("segment at position {position} has index {found}, expected {expected}")]
    NonContiguous { position: usize, expected: usize, found: usize },
    #[error("segment {0} has no text")]
    EmptyText(usize),
    #[error("segment {0} has a zero estimated duration")]
    ZeroDuration(usize),
    #[error("segment {index} arc position {value} is outside [0, 1]")]
    ArcPosition { index: usize, value: f32 },
}

/// Ordered, validated segment list for one job. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentPlan {
    segments: Vec<SegmentSpec>,
}

impl SegmentPlan {
    pub fn new(segments: Vec<SegmentSpec>) -> Result<Self, PlanError> {
        if segments.is_empty() {
            return Err(PlanError::Empty);
        }
        for (position, spec) in segments.iter().enumerate() {
            let expected = position + 1;
            if spec.index != expected {
                return Err(PlanError::NonContiguous {
                    position,
                    expected,
                    found: spec.index,
                });
            }
            if spec.text.trim().is_empty() {
                return Err(PlanError::EmptyText(spec.index));
            }
            if spec.estimated_duration_ms == 0 {
                return Err(PlanError::ZeroDuration(spec.index));
            }
            let arc = spec.directive.arc_position;
            if !(0.0..=1.0).contains(&arc) {
                return Err(PlanError::ArcPosition { index: spec.index, value: arc });
            }
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[SegmentSpec] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SegmentSpec> {
        index.checked_sub(1).and_then(|i| self.segments.get(i))
    }

    pub fn estimated_total_ms(&self, gap_ms: u64) -> u64 {
        let voice: u64 = self.segments.iter().map(|s| s.estimated_duration_ms).sum();
        voice + gap_ms * (self.segments.len() as u64 - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(index: usize) -> SegmentSpec {
        SegmentSpec {
            index,
            text: format!("part {index}"),
            directive: EmotionalDirective::default(),
            estimated_duration_ms: 1_000,
        }
    }

    #[test]
    fn test_plan_accepts_contiguous_indices() {
        let plan = SegmentPlan::new(vec![spec(1), spec(2), spec(3)]).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.get(2).unwrap().index, 2);
        assert!(plan.get(0).is_none());
        assert_eq!(plan.estimated_total_ms(800), 3_000 + 1_600);
    }

    #[test]
    fn test_plan_rejects_gaps_and_zero_start() {
        assert_eq!(
            SegmentPlan::new(vec![spec(1), spec(3)]).unwrap_err(),
            PlanError::NonContiguous { position: 1, expected: 2, found: 3 }
        );
        assert!(matches!(
            SegmentPlan::new(vec![spec(0)]),
            Err(PlanError::NonContiguous { .. })
        ));
    }

    #[test]
    fn test_plan_rejects_bad_fields() {
        assert_eq!(SegmentPlan::new(vec![]).unwrap_err(), PlanError::Empty);

        let mut blank = spec(1);
        blank.text = "   ".into();
        assert_eq!(SegmentPlan::new(vec![blank]).unwrap_err(), PlanError::EmptyText(1));

        let mut zero = spec(1);
        zero.estimated_duration_ms = 0;
        assert_eq!(SegmentPlan::new(vec![zero]).unwrap_err(), PlanError::ZeroDuration(1));

        let mut arc = spec(1);
        arc.directive.arc_position = 1.5;
        assert!(matches!(SegmentPlan::new(vec![arc]), Err(PlanError::ArcPosition { .. })));
    }
}
