//! Completion and score arithmetic
//!
//! Every number that reaches storage goes through [`format_precision`], so
//! two computations over the same inputs compare equal once persisted.

use serde::{Deserialize, Serialize};

use crate::models::{Score, ScoreReason};

/// Decimal digits kept on persisted values
pub const SCORE_PRECISION: i32 = 5;

/// Sum deltas with a running total that never stays below zero
///
/// A negative running value is reset to exactly 0 before the next delta is
/// added, so earlier debt is forgotten rather than dug out of.
pub fn clamp_fold<I>(deltas: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    deltas
        .into_iter()
        .fold(0.0_f64, |acc, delta| acc.max(0.0) + delta)
        .max(0.0)
}

/// Round half away from zero to [`SCORE_PRECISION`] decimals
pub fn format_precision(value: f64) -> f64 {
    if !value.is_finite() {
        return value;
    }
    let factor = 10_f64.powi(SCORE_PRECISION);
    let scaled = value * factor;
    if !scaled.is_finite() {
        // too large to carry any fractional digits
        return value;
    }
    let rounded = scaled.round() / factor;
    if rounded == 0.0 {
        // drop the sign of -0.0
        0.0
    } else {
        rounded
    }
}

/// Completion estimate of one element
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub value: f64,
    pub confidence: f64,
}

impl Completion {
    /// Slot of a child with no progress row yet
    pub const NOT_ATTEMPTED: Completion = Completion {
        value: 0.0,
        confidence: 0.0,
    };

    /// Leaf completion carried by an evaluation score
    pub fn from_score(score: &Score) -> Self {
        Self {
            value: format_precision(score.value.unwrap_or(0.0).clamp(0.0, 1.0)),
            confidence: score.completion_confidence(),
        }
    }
}

/// Result of aggregating a container's children
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    /// `None` when no child carries any weight
    pub value: Option<f64>,
    pub confidence: f64,
    pub child_values: Vec<f64>,
    pub child_confidences: Vec<f64>,
}

/// Confidence-weighted mean of child completions
///
/// Zero-confidence children add no weight; if no child has weight the
/// result is `None`, not 0.
pub fn weighted_completion(children: &[Completion]) -> Option<f64> {
    let weight: f64 = children.iter().map(|c| c.confidence.max(0.0)).sum();
    if weight <= 0.0 {
        return None;
    }
    let mean: f64 = children
        .iter()
        .map(|c| c.value.max(0.0) * c.confidence.max(0.0) / weight)
        .sum();
    Some(format_precision(mean.min(1.0)))
}

/// Aggregate children in tree order into the parent's completion
///
/// The parent's confidence is the mean child confidence, with unattempted
/// children counting as 0.
pub fn aggregate(children: &[Completion]) -> Aggregate {
    let confidence = if children.is_empty() {
        0.0
    } else {
        let total: f64 = children.iter().map(|c| c.confidence.max(0.0)).sum();
        format_precision(total / children.len() as f64)
    };

    Aggregate {
        value: weighted_completion(children),
        confidence,
        child_values: children.iter().map(|c| format_precision(c.value)).collect(),
        child_confidences: children.iter().map(|c| format_precision(c.confidence)).collect(),
    }
}

/// Roll child scores up into a parent score
///
/// Scored children contribute through [`clamp_fold`]; missing children and
/// explicit NOT_ATTEMPTED rows count as unattempted.
pub fn rollup_score(children: &[Option<Score>]) -> Score {
    let attempted: Vec<&Score> = children
        .iter()
        .flatten()
        .filter(|s| s.reason != ScoreReason::NotAttempted)
        .collect();

    if attempted.is_empty() {
        return Score::not_attempted();
    }

    let scored: Vec<f64> = attempted
        .iter()
        .filter(|s| s.reason.is_scored())
        .filter_map(|s| s.value)
        .collect();
    let value = if scored.is_empty() {
        None
    } else {
        Some(format_precision(clamp_fold(scored.iter().copied())))
    };

    let reason = if attempted.len() < children.len() {
        ScoreReason::IncompleteAttempt
    } else if value.is_some() {
        ScoreReason::Scored
    } else {
        ScoreReason::Unscored
    };

    Score { value, reason }
}
