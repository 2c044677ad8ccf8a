//! Pure, stateless progress classification functions.
//!
//! No I/O, no `self` state — these are plain functions over numeric
//! inputs, grounded on the teacher's `risk.rs` style of small pure
//! calculators (`KellyCalculator::raw_fraction`, `VaRCalculator`)
//! generalized from position-sizing math to progress-delta math.

use serde::{Deserialize, Serialize};

pub const COMPLETION_EPSILON: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub threshold: f64,
    pub time_remaining_tolerance_secs: f64,
    pub pages_remaining_tolerance: f64,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            threshold: 95.0,
            time_remaining_tolerance_secs: 60.0,
            pages_remaining_tolerance: 1.0,
        }
    }
}

/// Minimal view of ABS progress fields needed for validation/completion,
/// decoupled from the HTTP adapter's wire representation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbsProgressInput {
    pub progress_percentage: Option<f64>,
    pub is_finished: bool,
    pub current_time_secs: Option<f64>,
    pub duration_secs: Option<f64>,
    pub current_page: Option<f64>,
    pub total_pages: Option<f64>,
}

/// Rejects NaN/infinite input; clamps only for sub-epsilon float noise
/// (e.g. 100.00000003 -> 100.0), otherwise returns the value unchanged.
/// Returns `None` when `allow_null` is true and no progress is present.
pub fn get_validated_progress(input: &AbsProgressInput, allow_null: bool) -> Option<f64> {
    let raw = match input.progress_percentage {
        Some(v) => v,
        None => {
            return if allow_null { None } else { Some(0.0) };
        }
    };

    if !raw.is_finite() {
        return if allow_null { None } else { Some(0.0) };
    }

    let clamped = if raw > 100.0 && raw - 100.0 < 1e-6 {
        100.0
    } else if raw < 0.0 && raw > -1e-6 {
        0.0
    } else {
        raw
    };

    if !(0.0..=100.0).contains(&clamped) {
        return if allow_null { None } else { Some(0.0) };
    }
    Some(clamped)
}

pub fn is_complete(progress: f64, abs: &AbsProgressInput, opts: &CompletionOptions) -> bool {
    if abs.is_finished {
        return true;
    }
    if progress >= opts.threshold {
        return true;
    }
    if let (Some(current), Some(duration)) = (abs.current_time_secs, abs.duration_secs) {
        if duration > 0.0 && (duration - current) <= opts.time_remaining_tolerance_secs {
            return true;
        }
    }
    if let (Some(current_page), Some(total_pages)) = (abs.current_page, abs.total_pages) {
        if total_pages > 0.0 && (total_pages - current_page) <= opts.pages_remaining_tolerance {
            return true;
        }
    }
    false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeDirection {
    None,
    Increase,
    Decrease,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressChange {
    pub has_change: bool,
    pub direction: ChangeDirection,
    pub absolute_change: f64,
}

pub fn detect_progress_change(prev: f64, curr: f64) -> ProgressChange {
    let delta = curr - prev;
    let absolute_change = delta.abs();
    if absolute_change <= COMPLETION_EPSILON {
        return ProgressChange {
            has_change: false,
            direction: ChangeDirection::None,
            absolute_change,
        };
    }
    ProgressChange {
        has_change: true,
        direction: if delta > 0.0 {
            ChangeDirection::Increase
        } else {
            ChangeDirection::Decrease
        },
        absolute_change,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionVerdict {
    Block,
    NewSession,
    Warn,
    Ok,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RereadThresholds {
    pub high_progress_threshold: f64,
    pub reread_threshold: f64,
    pub regression_block_threshold: f64,
    pub regression_warn_threshold: f64,
}

impl Default for RereadThresholds {
    fn default() -> Self {
        Self {
            high_progress_threshold: 85.0,
            reread_threshold: 30.0,
            regression_block_threshold: 50.0,
            regression_warn_threshold: 15.0,
        }
    }
}

/// Classifies a progress transition for reread/regression handling.
/// Branch order matches the spec exactly: block takes priority over
/// new_session, which takes priority over warn.
pub fn classify_progress_transition(
    prev: f64,
    curr: f64,
    is_completed: bool,
    thresholds: &RereadThresholds,
) -> TransitionVerdict {
    let regression = prev - curr;

    if is_completed && curr < thresholds.high_progress_threshold {
        return TransitionVerdict::Block;
    }
    if prev >= thresholds.high_progress_threshold && regression > thresholds.regression_block_threshold {
        return TransitionVerdict::Block;
    }
    if prev >= thresholds.high_progress_threshold && curr <= thresholds.reread_threshold {
        return TransitionVerdict::NewSession;
    }
    if prev >= thresholds.high_progress_threshold && regression > thresholds.regression_warn_threshold {
        return TransitionVerdict::Warn;
    }
    TransitionVerdict::Ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn b1_completion_boundary() {
        let opts = CompletionOptions::default();
        let input = AbsProgressInput::default();
        assert!(!is_complete(94.99, &input, &opts));
        assert!(is_complete(95.0, &input, &opts));
    }

    #[test]
    fn p6_small_deltas_report_no_change() {
        let c = detect_progress_change(50.0, 50.005);
        assert!(!c.has_change);
        let c2 = detect_progress_change(50.0, 50.011);
        assert!(c2.has_change);
    }

    #[test]
    fn rejects_nan_and_infinite() {
        let mut input = AbsProgressInput::default();
        input.progress_percentage = Some(f64::NAN);
        assert_eq!(get_validated_progress(&input, true), None);
        input.progress_percentage = Some(f64::INFINITY);
        assert_eq!(get_validated_progress(&input, true), None);
    }

    #[test]
    fn clamps_sub_epsilon_float_noise() {
        let mut input = AbsProgressInput::default();
        input.progress_percentage = Some(100.0000001);
        assert_eq!(get_validated_progress(&input, false), Some(100.0));
    }

    #[test]
    fn reread_classification_scenarios() {
        let t = RereadThresholds::default();
        // S3: completed at 97, now at 5 -> reread as new session.
        assert_eq!(classify_progress_transition(97.0, 5.0, false, &t), TransitionVerdict::NewSession);
        // Moderate regression, above the warn threshold but below block.
        assert_eq!(classify_progress_transition(90.0, 60.0, false, &t), TransitionVerdict::Warn);
        // Drop in the warn band.
        assert_eq!(classify_progress_transition(90.0, 72.0, false, &t), TransitionVerdict::Warn);
        // Completion flagged while progress itself regressed below high bar.
        assert_eq!(classify_progress_transition(90.0, 40.0, true, &t), TransitionVerdict::Block);
        // Ordinary forward progress.
        assert_eq!(classify_progress_transition(40.0, 45.0, false, &t), TransitionVerdict::Ok);
    }
}
