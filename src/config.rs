//! Run configuration.
//!
//! Every tunable that the original experiment scripts mutated at module scope
//! lives here as an explicit struct, passed by value into each component's
//! constructor. Serde-derived so a run can load it from a structured record.

use crate::structs::DynamicsModel;
use serde::{Deserialize, Serialize};

/// Per-source barrier aggressiveness weights.
///
/// A larger gamma lets the barrier value decay faster toward the safety
/// margin (more aggressive); a smaller gamma enforces earlier, more
/// conservative avoidance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GammaConfig {
    /// Weight for the opponent-as-moving-obstacle constraint.
    pub opp_gamma: f64,
    /// Weight for static-obstacle constraints.
    pub obs_gamma: f64,
    /// Weight gating the liveness feedback terms. Zero disables them.
    pub live_gamma: f64,
}

impl Default for GammaConfig {
    fn default() -> Self {
        GammaConfig {
            opp_gamma: 0.5,
            obs_gamma: 0.3,
            live_gamma: 0.3,
        }
    }
}

/// Shared configuration for controllers and the simulation driver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub dynamics: DynamicsModel,
    /// Timestep in seconds.
    pub dt: f64,
    pub agent_radius: f64,
    /// Extra margin added on top of combined radii.
    pub safety_dist: f64,
    /// Forward speed bound (speed is non-negative for the differential drive).
    pub v_max: f64,
    pub a_max: f64,
    pub omega_max: f64,
    pub gammas: GammaConfig,
    /// Liveness score below which an intersecting pair counts as non-live.
    pub liveness_threshold: f64,
    /// Target speed ratio imposed on the yielding agent of a non-live pair.
    pub zeta: f64,
    /// Constant-velocity projection horizon (seconds) for the
    /// trajectory-intersection test.
    pub liveness_lookahead: f64,
    /// MPC horizon length (steps).
    pub horizon: usize,
    /// Relinearization passes per MPC solve.
    pub linearization_passes: usize,
    /// OSQP iteration cap per solve.
    pub solver_max_iter: u32,
    /// Position tolerance for counting an agent as arrived.
    pub goal_tolerance: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            dynamics: DynamicsModel::DifferentialDrive,
            dt: 0.1,
            agent_radius: 0.25,
            safety_dist: 0.03,
            v_max: 1.0,
            a_max: 1.0,
            omega_max: 2.0,
            gammas: GammaConfig::default(),
            liveness_threshold: 0.3,
            zeta: 0.3,
            liveness_lookahead: 3.0,
            horizon: 8,
            linearization_passes: 2,
            solver_max_iter: 4000,
            goal_tolerance: 0.12,
        }
    }
}

impl SimConfig {
    /// Combined collision radius of an agent pair, margin included.
    pub fn agent_clearance(&self) -> f64 {
        2.0 * self.agent_radius + self.safety_dist
    }

    /// Combined collision radius against a static obstacle, margin included.
    pub fn obstacle_clearance(&self, obstacle_radius: f64) -> f64 {
        self.agent_radius + obstacle_radius + self.safety_dist
    }
}
