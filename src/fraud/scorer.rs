//! Fraud Scoring Heuristic
//!
//! `score_move` is a pure function of a move plus the author's recent history
//! window; each component is independently bounded and the sum is clamped to
//! 100. The engine consumes the tiered decision policy: scores above the
//! forfeit threshold disqualify the author on the spot, scores in the review
//! band emit an alert for asynchronous enforcement, everything else passes
//! silently.
//!
//! All arithmetic is integer-only so the same history always produces the
//! same score.

use serde::{Deserialize, Serialize};

use crate::core::ids::{MatchId, UserId};
use crate::game::moves::MovePayload;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Physical plausibility bounds, tighter than the protocol payload bounds.
///
/// Unset bounds mean the plausibility component always passes.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PhysicalBounds {
    /// Maximum physically plausible force.
    pub max_force: u8,
    /// Maximum physically plausible angle in deci-degrees.
    pub max_angle_deci: u16,
}

/// Scoring thresholds and component weights.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FraudConfig {
    /// Trailing history window length.
    pub window: usize,
    /// Minimum inter-move interval samples before timing contributes.
    pub min_timing_samples: usize,
    /// Interval variance below this (ms^2) counts as machine-regular.
    pub variance_threshold_ms2: u64,
    /// Mean interval below this (ms) is suspicious when regular.
    pub fast_mean_ms: u64,
    /// Mean interval below this (ms) is suspicious on its own.
    pub very_fast_mean_ms: u64,
    /// Weight for the regular-and-fast timing pattern.
    pub regular_timing_weight: u8,
    /// Weight for the very-fast timing pattern (supersedes the regular one).
    pub very_fast_weight: u8,
    /// Minimum results before accuracy contributes.
    pub min_accuracy_samples: usize,
    /// Success percentage above which the high accuracy weight applies.
    pub high_accuracy_pct: u8,
    /// Weight for success rate above `high_accuracy_pct`.
    pub high_accuracy_weight: u8,
    /// Success percentage above which the elevated accuracy weight applies.
    pub elevated_accuracy_pct: u8,
    /// Weight for success rate above `elevated_accuracy_pct`.
    pub elevated_accuracy_weight: u8,
    /// Penalty for a physically implausible payload.
    pub implausible_weight: u8,
    /// Physical bounds; `None` disables the plausibility component.
    pub physical_bounds: Option<PhysicalBounds>,
    /// Scores strictly above this forfeit the author (HIGH).
    pub forfeit_threshold: u8,
    /// Scores strictly above this (up to the forfeit threshold) emit a
    /// MEDIUM alert.
    pub review_threshold: u8,
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            window: 20,
            min_timing_samples: 3,
            variance_threshold_ms2: 10_000,
            fast_mean_ms: 2_000,
            very_fast_mean_ms: 500,
            regular_timing_weight: 40,
            very_fast_weight: 60,
            min_accuracy_samples: 10,
            high_accuracy_pct: 95,
            high_accuracy_weight: 50,
            elevated_accuracy_pct: 85,
            elevated_accuracy_weight: 30,
            implausible_weight: 80,
            physical_bounds: None,
            forfeit_threshold: 75,
            review_threshold: 50,
        }
    }
}

// =============================================================================
// INPUT & OUTPUT TYPES
// =============================================================================

/// Minimal view of a prior move used for scoring.
#[derive(Clone, Copy, Debug)]
pub struct MoveSample {
    /// Wall-clock timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// Whether the strike pocketed.
    pub success: bool,
}

/// Alert severity tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Immediate forfeit territory.
    High,
    /// Accepted, queued for asynchronous review.
    Medium,
}

/// Policy consumed by the match engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FraudAction {
    /// Forfeit the author and raise a HIGH alert.
    Forfeit,
    /// Accept the move but raise a MEDIUM alert.
    Review,
    /// Accept silently.
    Accept,
}

/// Append-only alert record consumed by external enforcement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FraudAlert {
    /// Move author.
    pub user: UserId,
    /// Match the move belongs to.
    pub match_id: MatchId,
    /// Computed score.
    pub score: u8,
    /// Severity tier.
    pub severity: Severity,
    /// Wall-clock timestamp in milliseconds.
    pub timestamp_ms: u64,
}

// =============================================================================
// SCORING
// =============================================================================

/// Score a move against the author's trailing history.
///
/// `history` holds the author's prior moves in this match, oldest first,
/// already trimmed to the config window. `behavioral` is an optional external
/// consistency signal, added verbatim.
pub fn score_move(
    payload: &MovePayload,
    timestamp_ms: u64,
    history: &[MoveSample],
    behavioral: Option<u8>,
    config: &FraudConfig,
) -> u8 {
    let window = trailing_window(history, config.window);

    let mut total = timing_component(&window, timestamp_ms, config) as u32;
    total += accuracy_component(&window, config) as u32;
    total += plausibility_component(payload, config) as u32;
    total += behavioral.unwrap_or(0) as u32;

    total.min(100) as u8
}

/// Apply the tiered decision policy to a score.
pub fn decide(score: u8, config: &FraudConfig) -> FraudAction {
    if score > config.forfeit_threshold {
        FraudAction::Forfeit
    } else if score > config.review_threshold {
        FraudAction::Review
    } else {
        FraudAction::Accept
    }
}

fn trailing_window(history: &[MoveSample], window: usize) -> Vec<MoveSample> {
    let start = history.len().saturating_sub(window);
    history[start..].to_vec()
}

/// Timing regularity over inter-move intervals, including the incoming move.
fn timing_component(window: &[MoveSample], timestamp_ms: u64, config: &FraudConfig) -> u8 {
    let mut times: Vec<u64> = window.iter().map(|s| s.timestamp_ms).collect();
    times.push(timestamp_ms);

    let intervals: Vec<u64> = times.windows(2).map(|w| w[1].saturating_sub(w[0])).collect();
    if intervals.len() < config.min_timing_samples {
        return 0;
    }

    let n = intervals.len() as u128;
    let sum: u128 = intervals.iter().map(|&i| i as u128).sum();
    let mean = (sum / n) as u64;

    // Population variance in ms^2, integer math.
    let var_sum: u128 = intervals
        .iter()
        .map(|&i| {
            let d = (i as i128 - mean as i128).unsigned_abs();
            d * d
        })
        .sum();
    let variance = (var_sum / n) as u64;

    if mean < config.very_fast_mean_ms {
        config.very_fast_weight
    } else if variance < config.variance_threshold_ms2 && mean < config.fast_mean_ms {
        config.regular_timing_weight
    } else {
        0
    }
}

/// Accuracy anomaly over the trailing results.
fn accuracy_component(window: &[MoveSample], config: &FraudConfig) -> u8 {
    let total = window.len();
    if total < config.min_accuracy_samples {
        return 0;
    }
    let successes = window.iter().filter(|s| s.success).count();

    // rate > pct/100, integer-exact
    if successes * 100 > total * config.high_accuracy_pct as usize {
        config.high_accuracy_weight
    } else if successes * 100 > total * config.elevated_accuracy_pct as usize {
        config.elevated_accuracy_weight
    } else {
        0
    }
}

/// Physical plausibility of the payload against configured bounds.
fn plausibility_component(payload: &MovePayload, config: &FraudConfig) -> u8 {
    match config.physical_bounds {
        Some(bounds)
            if payload.force > bounds.max_force
                || payload.angle_deci > bounds.max_angle_deci =>
        {
            config.implausible_weight
        }
        _ => 0,
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> MovePayload {
        MovePayload {
            force: 50,
            angle_deci: 900,
            aim_x: 0,
            aim_y: 0,
        }
    }

    /// Samples at a fixed cadence, alternating success to stay under the
    /// accuracy thresholds.
    fn cadence(count: usize, interval_ms: u64) -> Vec<MoveSample> {
        (0..count)
            .map(|i| MoveSample {
                timestamp_ms: 10_000 + i as u64 * interval_ms,
                success: i % 2 == 0,
            })
            .collect()
    }

    #[test]
    fn test_too_few_samples_scores_zero() {
        let config = FraudConfig::default();
        let history = cadence(2, 300); // only 2 intervals with the new move
        let score = score_move(&payload(), 10_600, &history, None, &config);
        assert_eq!(score, 0);
    }

    #[test]
    fn test_metronome_burst_scores_at_least_forty() {
        // Scenario: 15 moves at a constant 300ms cadence, variance near 0.
        let config = FraudConfig::default();
        let history = cadence(15, 300);
        let next_ts = 10_000 + 15 * 300;

        let score = score_move(&payload(), next_ts, &history, None, &config);
        assert!(score >= 40, "score {} should be >= 40", score);
    }

    #[test]
    fn test_very_fast_supersedes_regular() {
        let config = FraudConfig::default();

        // 300ms mean < 500ms: very-fast weight alone, not 40 + 60.
        let history = cadence(10, 300);
        let score = score_move(&payload(), 10_000 + 10 * 300, &history, None, &config);
        assert_eq!(score, config.very_fast_weight);

        // 1000ms mean with zero variance: regular weight.
        let history = cadence(10, 1_000);
        let score = score_move(&payload(), 10_000 + 10 * 1_000, &history, None, &config);
        assert_eq!(score, config.regular_timing_weight);
    }

    #[test]
    fn test_irregular_human_timing_scores_zero() {
        let config = FraudConfig::default();
        let mut history = Vec::new();
        let mut ts = 10_000u64;
        for i in 0..12 {
            // Wildly varying intervals, all above the fast threshold.
            ts += 2_500 + (i % 5) * 1_700;
            history.push(MoveSample {
                timestamp_ms: ts,
                success: i % 2 == 0,
            });
        }
        let score = score_move(&payload(), ts + 4_000, &history, None, &config);
        assert_eq!(score, 0);
    }

    #[test]
    fn test_accuracy_anomaly_tiers() {
        let config = FraudConfig::default();

        // 20 samples, all pockets, slow irregular timing: accuracy only.
        let all_hits: Vec<MoveSample> = (0..20)
            .map(|i| MoveSample {
                timestamp_ms: 10_000 + i as u64 * (3_000 + i as u64 * 311),
                success: true,
            })
            .collect();
        let score = score_move(&payload(), 200_000, &all_hits, None, &config);
        assert_eq!(score, config.high_accuracy_weight);

        // 9 of 10 = 90% > 85% but not > 95%.
        let mostly: Vec<MoveSample> = (0..10)
            .map(|i| MoveSample {
                timestamp_ms: 10_000 + i as u64 * (3_000 + i as u64 * 311),
                success: i != 0,
            })
            .collect();
        let score = score_move(&payload(), 200_000, &mostly, None, &config);
        assert_eq!(score, config.elevated_accuracy_weight);
    }

    #[test]
    fn test_accuracy_needs_ten_samples() {
        let config = FraudConfig::default();
        let nine: Vec<MoveSample> = (0..9)
            .map(|i| MoveSample {
                timestamp_ms: 10_000 + i as u64 * (3_000 + i as u64 * 311),
                success: true,
            })
            .collect();
        let score = score_move(&payload(), 200_000, &nine, None, &config);
        assert_eq!(score, 0);
    }

    #[test]
    fn test_implausible_payload_penalty() {
        let mut config = FraudConfig::default();
        config.physical_bounds = Some(PhysicalBounds {
            max_force: 80,
            max_angle_deci: 3600,
        });

        let hard = MovePayload {
            force: 95,
            ..payload()
        };
        let score = score_move(&hard, 10_000, &[], None, &config);
        assert_eq!(score, config.implausible_weight);

        // Unconfigured bounds always pass.
        config.physical_bounds = None;
        assert_eq!(score_move(&hard, 10_000, &[], None, &config), 0);
    }

    #[test]
    fn test_behavioral_signal_added_verbatim() {
        let config = FraudConfig::default();
        let score = score_move(&payload(), 10_000, &[], Some(35), &config);
        assert_eq!(score, 35);
    }

    #[test]
    fn test_components_sum_and_clamp() {
        // Fast cadence + perfect accuracy + behavioral pushes past 100.
        let config = FraudConfig::default();
        let history: Vec<MoveSample> = (0..15)
            .map(|i| MoveSample {
                timestamp_ms: 10_000 + i as u64 * 300,
                success: true,
            })
            .collect();
        let score = score_move(&payload(), 10_000 + 15 * 300, &history, Some(40), &config);
        assert_eq!(score, 100);
    }

    #[test]
    fn test_decision_policy_boundaries() {
        let config = FraudConfig::default();

        assert_eq!(decide(50, &config), FraudAction::Accept);
        assert_eq!(decide(51, &config), FraudAction::Review);
        assert_eq!(decide(75, &config), FraudAction::Review);
        assert_eq!(decide(76, &config), FraudAction::Forfeit);
        assert_eq!(decide(100, &config), FraudAction::Forfeit);
        assert_eq!(decide(0, &config), FraudAction::Accept);
    }

    #[test]
    fn test_window_trims_to_trailing_twenty() {
        let config = FraudConfig::default();

        // 40 old slow samples followed by 20 fast ones; only the trailing
        // window should count.
        let mut history = Vec::new();
        for i in 0..40 {
            history.push(MoveSample {
                timestamp_ms: i as u64 * 60_000,
                success: false,
            });
        }
        let base = 40 * 60_000;
        for i in 0..20 {
            history.push(MoveSample {
                timestamp_ms: base + i as u64 * 300,
                success: false,
            });
        }

        let score = score_move(&payload(), base + 20 * 300, &history, None, &config);
        assert_eq!(score, config.very_fast_weight);
    }
}
