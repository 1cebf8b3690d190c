//! # Interaction Liveness
//!
//! Quantifies whether two agents' current trajectories will resolve a
//! potential conflict on their own or are drifting toward a symmetric
//! deadlock. The evaluator is a pure function of the two current states; the
//! score formula is deliberately isolated here so it can be swapped without
//! touching the optimizer or the learned controller.
//!
//! The canonical score is `PI - angle(pos_diff, vel_diff)`: a pair on a
//! perfect mutual collision course has its relative velocity exactly opposing
//! its relative position (angle PI, score 0), while offset or diverging
//! motion scores high. The score is symmetric under relabeling because both
//! difference vectors negate together, leaving the angle unchanged.

use crate::config::SimConfig;
use crate::structs::{AgentState, Vector2D};

const EPSILON: f64 = 1e-9;

/// Per-step liveness metrics for one agent pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessReport {
    /// Liveness score, `0 <= score <= PI`. Zero means a perfect collision
    /// course (or degenerate relative motion, pinned to the "not live"
    /// boundary).
    pub score: f64,
    /// Time-to-collision estimate under constant velocity;
    /// `f64::INFINITY` when the pair is not closing.
    pub ttc: f64,
    pub pos_diff: Vector2D,
    pub vel_diff: Vector2D,
    /// Whether the straight-line projected paths cross within the lookahead.
    pub intersects: bool,
}

impl LivenessReport {
    /// A pair counts as live when the score clears the threshold or the
    /// projected paths never meet.
    pub fn is_live(&self, threshold: f64) -> bool {
        self.score > threshold || !self.intersects
    }
}

/// Evaluates the liveness of the pair `(a, b)`.
pub fn evaluate(a: &AgentState, b: &AgentState, config: &SimConfig) -> LivenessReport {
    let pos_diff = b.position() - a.position();
    let vel_diff = b.velocity_vector() - a.velocity_vector();

    let separation = pos_diff.magnitude();
    let rel_speed = vel_diff.magnitude();

    let intersects = paths_intersect(a, b, config.liveness_lookahead);

    // Degenerate relative motion: no information to score on. Pinned to the
    // "not live" boundary value; callers decide via `is_live` policy.
    if separation < EPSILON || rel_speed < EPSILON {
        return LivenessReport {
            score: 0.0,
            ttc: f64::INFINITY,
            pos_diff,
            vel_diff,
            intersects,
        };
    }

    let cos_angle = (pos_diff.dot(&vel_diff) / (separation * rel_speed)).clamp(-1.0, 1.0);
    let score = std::f64::consts::PI - cos_angle.acos();

    // Closing rate: positive when the separation is shrinking.
    let closing = -pos_diff.dot(&vel_diff) / separation;
    let ttc = if closing <= EPSILON {
        f64::INFINITY
    } else {
        ((separation - config.agent_clearance()) / closing).max(0.0)
    };

    LivenessReport {
        score,
        ttc,
        pos_diff,
        vel_diff,
        intersects,
    }
}

/// Segment/segment test over each agent's constant-velocity projection.
fn paths_intersect(a: &AgentState, b: &AgentState, lookahead: f64) -> bool {
    let a0 = a.position();
    let a1 = a0 + a.velocity_vector() * lookahead;
    let b0 = b.position();
    let b1 = b0 + b.velocity_vector() * lookahead;
    segments_intersect(a0, a1, b0, b1)
}

fn orientation(p: Vector2D, q: Vector2D, r: Vector2D) -> i32 {
    let cross = (q - p).cross(&(r - p));
    if cross.abs() < EPSILON {
        0
    } else if cross > 0.0 {
        1
    } else {
        -1
    }
}

fn on_segment(p: Vector2D, q: Vector2D, r: Vector2D) -> bool {
    q.x <= p.x.max(r.x) + EPSILON
        && q.x >= p.x.min(r.x) - EPSILON
        && q.y <= p.y.max(r.y) + EPSILON
        && q.y >= p.y.min(r.y) - EPSILON
}

fn segments_intersect(p1: Vector2D, q1: Vector2D, p2: Vector2D, q2: Vector2D) -> bool {
    let o1 = orientation(p1, q1, p2);
    let o2 = orientation(p1, q1, q2);
    let o3 = orientation(p2, q2, p1);
    let o4 = orientation(p2, q2, q1);

    if o1 != o2 && o3 != o4 {
        return true;
    }

    // Collinear overlap matters here: the head-on case projects both agents
    // onto the same line.
    (o1 == 0 && on_segment(p1, p2, q1))
        || (o2 == 0 && on_segment(p1, q2, q1))
        || (o3 == 0 && on_segment(p2, p1, q2))
        || (o4 == 0 && on_segment(p2, q1, q2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    fn config() -> SimConfig {
        SimConfig::default()
    }

    #[test]
    fn test_head_on_score_is_zero() {
        // Perfect mutual collision course along the x-axis.
        let a = AgentState::new(0.0, 0.0, 0.0, 1.0);
        let b = AgentState::new(3.0, 0.0, PI, 1.0);
        let report = evaluate(&a, &b, &config());
        assert_relative_eq!(report.score, 0.0, epsilon = 1e-9);
        assert!(report.intersects, "head-on projections must intersect");
        assert!(!report.is_live(config().liveness_threshold));
    }

    #[test]
    fn test_head_on_ttc() {
        let cfg = config();
        let a = AgentState::new(0.0, 0.0, 0.0, 1.0);
        let b = AgentState::new(3.0, 0.0, PI, 1.0);
        let report = evaluate(&a, &b, &cfg);
        // Closing at 2 m/s over (3 - clearance) m.
        let expected = (3.0 - cfg.agent_clearance()) / 2.0;
        assert_relative_eq!(report.ttc, expected, epsilon = 1e-9);
    }

    #[test]
    fn test_offset_crossing_is_live() {
        // Crossing paths with a timing offset: no collision course.
        let a = AgentState::new(0.0, 0.0, 0.0, 1.0);
        let b = AgentState::new(2.5, -1.0, std::f64::consts::FRAC_PI_2, 1.0);
        let report = evaluate(&a, &b, &config());
        assert!(
            report.score > config().liveness_threshold,
            "offset crossing should score live, got {}",
            report.score
        );
    }

    #[test]
    fn test_score_symmetric_under_relabeling() {
        let cfg = config();
        let a = AgentState::new(0.1, -0.4, 0.3, 0.8);
        let b = AgentState::new(2.0, 0.5, -2.6, 0.6);
        let ab = evaluate(&a, &b, &cfg);
        let ba = evaluate(&b, &a, &cfg);
        assert_relative_eq!(ab.score, ba.score, epsilon = 1e-12);
        assert_relative_eq!(ab.ttc, ba.ttc, epsilon = 1e-12);
        assert_eq!(ab.intersects, ba.intersects);
        assert_eq!(ab.pos_diff, -ba.pos_diff);
        assert_eq!(ab.vel_diff, -ba.vel_diff);
    }

    #[test]
    fn test_zero_relative_velocity_boundary() {
        // Same velocity vector: relative motion carries no information.
        let a = AgentState::new(0.0, 0.0, 0.0, 1.0);
        let b = AgentState::new(2.0, 0.0, 0.0, 1.0);
        let report = evaluate(&a, &b, &config());
        assert_eq!(report.score, 0.0);
        assert_eq!(report.ttc, f64::INFINITY);
        // Not live by score alone; caller policy may override via intersects.
        assert!(report.score <= config().liveness_threshold);
    }

    #[test]
    fn test_ttc_sentinel_when_diverging() {
        let a = AgentState::new(0.0, 0.0, PI, 1.0);
        let b = AgentState::new(3.0, 0.0, 0.0, 1.0);
        let report = evaluate(&a, &b, &config());
        assert_eq!(report.ttc, f64::INFINITY);
        assert!(report.is_live(config().liveness_threshold));
    }

    #[test]
    fn test_ttc_monotone_in_closing_speed() {
        // Fixed separation, increasing closing speed: ttc never increases.
        let cfg = config();
        let a = AgentState::new(0.0, 0.0, 0.0, 0.0);
        let mut last = f64::INFINITY;
        for speed in [0.2, 0.5, 1.0, 2.0, 4.0] {
            let b = AgentState::new(3.0, 0.0, PI, speed);
            let report = evaluate(&a, &b, &cfg);
            assert!(
                report.ttc <= last,
                "ttc must not increase with closing speed: {} -> {}",
                last,
                report.ttc
            );
            last = report.ttc;
        }
    }

    #[test]
    fn test_ttc_clamped_inside_clearance() {
        // Already inside the combined clearance: estimate clamps at zero
        // rather than going negative.
        let cfg = config();
        let a = AgentState::new(0.0, 0.0, 0.0, 1.0);
        let b = AgentState::new(0.4, 0.0, PI, 1.0);
        let report = evaluate(&a, &b, &cfg);
        assert_eq!(report.ttc, 0.0);
    }

    #[test]
    fn test_parallel_paths_do_not_intersect() {
        let a = AgentState::new(0.0, 0.0, 0.0, 1.0);
        let b = AgentState::new(0.0, 2.0, 0.0, 1.0);
        let report = evaluate(&a, &b, &config());
        assert!(!report.intersects);
        assert!(report.is_live(config().liveness_threshold));
    }

    #[test]
    fn test_crossing_paths_intersect() {
        let a = AgentState::new(0.0, 0.0, 0.0, 1.0);
        let b = AgentState::new(1.0, -1.0, std::f64::consts::FRAC_PI_2, 1.0);
        let report = evaluate(&a, &b, &config());
        assert!(report.intersects);
    }

    #[test]
    fn test_stationary_pair_does_not_intersect() {
        let a = AgentState::new(0.0, 0.0, 0.0, 0.0);
        let b = AgentState::new(2.0, 0.0, PI, 0.0);
        let report = evaluate(&a, &b, &config());
        // Zero-length projections: two distinct points never cross.
        assert!(!report.intersects);
        assert!(report.is_live(config().liveness_threshold));
    }
}
