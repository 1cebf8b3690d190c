//! # Barrier Constraint Builder
//!
//! Turns the world around one agent (static circles plus opponents treated as
//! moving circles) into discrete-time CBF constraint material. The safety
//! function for a circular obstacle is the signed clearance
//! `h(x) = |pos - center| - r_combined`, and every constraint encodes the
//! decay bound `h(x_next) - h(x) >= -gamma * h(x)`.
//!
//! Assembly happens once, in two stages, so both solver backends consume the
//! same definitions:
//!
//! - [`BarrierBuilder::survey`] resolves the constraint *material*: one
//!   [`ObstacleView`] per obstacle with its liveness-modulated gamma, plus
//!   the symmetry-breaking terms for a non-live pair. The receding-horizon
//!   optimizer lifts these views over its horizon with its own control
//!   sensitivities.
//! - [`BarrierBuilder::one_step_rows`] flattens a survey into affine rows
//!   `a . u <= b` in the instantaneous control, the form the learned
//!   controller's safety QP consumes directly.
//!
//! Liveness feedback enters here: a non-live pair tightens the effective
//! opponent gamma and, gated by `live_gamma`, injects two symmetry-breaking
//! terms so mirrored agents stop computing mirrored solutions: a right-hand
//! steering bias for both, and a speed-ordering bound for the agent without
//! priority.

use crate::config::SimConfig;
use crate::liveness::LivenessReport;
use crate::structs::{AgentState, DynamicsModel, StaticObstacle, Vector2D};
use osqp::CscMatrix;

/// Fraction of the relevant actuation bound used as the full-deficit
/// steering-bias magnitude.
const RIGHT_BIAS_FRACTION: f64 = 0.5;

const EPSILON: f64 = 1e-9;

/// Where a constraint came from. Indexes refer to the slices passed to
/// [`BarrierBuilder::survey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintSource {
    Opponent(usize),
    Static(usize),
    /// Liveness symmetry breaking: steer to the right-hand side.
    SteeringBias,
    /// Liveness symmetry breaking: the yielding agent tracks a fraction of
    /// the opponent's speed.
    SpeedOrdering,
}

/// One circular obstacle as seen at the linearization point, with the gamma
/// that applies to it this step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObstacleView {
    pub center: Vector2D,
    /// Constant-velocity prediction used for the obstacle's own motion.
    pub velocity: Vector2D,
    /// Combined radius plus safety margin.
    pub clearance: f64,
    pub gamma: f64,
    pub source: ConstraintSource,
    /// Barrier value at the survey state (diagnostic).
    pub h: f64,
}

impl ObstacleView {
    /// Signed clearance of `position` against this obstacle, with the center
    /// propagated `steps_ahead` timesteps at constant velocity.
    pub fn barrier_value(&self, position: Vector2D, steps_ahead: usize, dt: f64) -> f64 {
        let center = self.center + self.velocity * (steps_ahead as f64 * dt);
        position.distance(&center) - self.clearance
    }
}

/// The constraint material for one optimization step.
#[derive(Debug, Clone, Default)]
pub struct WorldView {
    pub obstacles: Vec<ObstacleView>,
    /// Minimum right-hand turn-rate (differential drive) or rightward lateral
    /// velocity (single integrator) demanded by the liveness feedback.
    pub steering_bias: Option<f64>,
    /// Speed the yielding agent must come down to.
    pub speed_cap: Option<f64>,
    /// Sources whose barrier value was already non-positive at survey time.
    /// Their constraints are still emitted (they demand recovery at the gamma
    /// rate rather than being trivially infeasible), but the condition is
    /// reportable.
    pub violations: Vec<ConstraintSource>,
}

/// One affine inequality `a . u <= b` in the instantaneous control.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BarrierConstraint {
    pub a: [f64; 2],
    pub b: f64,
    pub source: ConstraintSource,
    /// Barrier value at the linearization point (bias rows carry zero).
    pub h: f64,
}

impl BarrierConstraint {
    /// Whether a control satisfies this row (with a small slack for solver
    /// tolerances).
    pub fn satisfied_by(&self, u1: f64, u2: f64, tol: f64) -> bool {
        self.a[0] * u1 + self.a[1] * u2 <= self.b + tol
    }
}

/// The one-step constraint set consumed by the safety-QP layer.
#[derive(Debug, Clone, Default)]
pub struct ConstraintSet {
    pub constraints: Vec<BarrierConstraint>,
    pub violations: Vec<ConstraintSource>,
}

impl ConstraintSet {
    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }
}

/// Builds CBF constraint material for one agent.
#[derive(Debug, Clone)]
pub struct BarrierBuilder {
    config: SimConfig,
    /// Priority agents keep their pace under the liveness speed-ordering
    /// rule; non-priority agents yield.
    has_priority: bool,
}

impl BarrierBuilder {
    pub fn new(config: SimConfig, has_priority: bool) -> Self {
        BarrierBuilder {
            config,
            has_priority,
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Resolves the constraint material for `state` against all obstacles.
    ///
    /// `liveness` is the current report for the interacting pair (against the
    /// nearest opponent); `None` skips all liveness feedback, leaving the
    /// plain CBF material with the configured gammas.
    pub fn survey(
        &self,
        state: &AgentState,
        opponents: &[AgentState],
        static_obstacles: &[StaticObstacle],
        liveness: Option<&LivenessReport>,
    ) -> WorldView {
        let cfg = &self.config;
        let mut view = WorldView::default();

        let threshold = cfg.liveness_threshold;
        // All liveness feedback is gated by a nonzero live_gamma; zero
        // reproduces plain CBF avoidance exactly.
        let feedback = cfg.gammas.live_gamma > 0.0;
        let not_live =
            feedback && liveness.map_or(false, |report| !report.is_live(threshold));

        // A non-live pair tightens opponent avoidance in proportion to the
        // liveness deficit.
        let opp_gamma = match liveness {
            Some(report) if not_live => {
                cfg.gammas.opp_gamma * (report.score / threshold).clamp(0.0, 1.0)
            }
            _ => cfg.gammas.opp_gamma,
        };

        for (idx, opp) in opponents.iter().enumerate() {
            let source = ConstraintSource::Opponent(idx);
            let h = state.position().distance(&opp.position()) - cfg.agent_clearance();
            if h <= 0.0 {
                view.violations.push(source);
            }
            view.obstacles.push(ObstacleView {
                center: opp.position(),
                velocity: opp.velocity_vector(),
                clearance: cfg.agent_clearance(),
                gamma: opp_gamma,
                source,
                h,
            });
        }

        for (idx, obs) in static_obstacles.iter().enumerate() {
            let source = ConstraintSource::Static(idx);
            let h = state.position().distance(&obs.center()) - cfg.obstacle_clearance(obs.radius);
            if h <= 0.0 {
                view.violations.push(source);
            }
            view.obstacles.push(ObstacleView {
                center: obs.center(),
                velocity: Vector2D::zero(),
                clearance: cfg.obstacle_clearance(obs.radius),
                gamma: cfg.gammas.obs_gamma,
                source,
                h,
            });
        }

        if not_live && !opponents.is_empty() {
            let report = liveness.expect("not_live implies a report");
            let deficit = ((threshold - report.score) / threshold).clamp(0.0, 1.0);
            let bound = match cfg.dynamics {
                DynamicsModel::DifferentialDrive => cfg.omega_max,
                DynamicsModel::SingleIntegrator => cfg.v_max,
            };
            view.steering_bias = Some(cfg.gammas.live_gamma * deficit * RIGHT_BIAS_FRACTION * bound);

            if !self.has_priority {
                let nearest = opponents
                    .iter()
                    .min_by(|p, q| {
                        state
                            .distance_to(p)
                            .partial_cmp(&state.distance_to(q))
                            .expect("finite distances")
                    })
                    .expect("opponents is non-empty");
                view.speed_cap = Some(cfg.zeta * nearest.v.abs());
            }
        }

        view
    }

    /// Flattens a survey into one-step affine rows in the instantaneous
    /// control at `state`, the form the safety-QP layer consumes.
    pub fn one_step_rows(&self, state: &AgentState, view: &WorldView) -> ConstraintSet {
        let mut set = ConstraintSet {
            constraints: Vec::with_capacity(view.obstacles.len() + 2),
            violations: view.violations.clone(),
        };

        for obstacle in &view.obstacles {
            set.constraints.push(self.cbf_row(state, obstacle));
        }
        if let Some(bias) = view.steering_bias {
            set.constraints.push(self.steering_bias_row(state, bias));
        }
        if let Some(cap) = view.speed_cap {
            set.constraints.push(self.speed_ordering_row(state, cap));
        }

        set
    }

    /// One discrete CBF row for a circular obstacle moving at constant
    /// velocity.
    ///
    /// With `n` the unit vector from the obstacle center to the agent, the
    /// one-step clearance change under the semi-implicit Euler update is
    ///
    /// ```text
    ///   h_next - h ~= dt * n.v_rel + dt^2 * (accel * n.e + omega * v * n.e_perp)
    /// ```
    ///
    /// for the differential drive (`e` the heading vector), and
    /// `dt * n.(u - v_obs)` for the single integrator. Rearranging the decay
    /// bound `h_next - h >= -gamma * h` into `a . u <= b` gives the row.
    fn cbf_row(&self, state: &AgentState, obstacle: &ObstacleView) -> BarrierConstraint {
        let cfg = &self.config;
        let dt = cfg.dt;
        let offset = state.position() - obstacle.center;
        let distance = offset.magnitude();
        let h = distance - obstacle.clearance;
        // Exact overlap leaves no direction to push along; fall back to the
        // reverse of the heading so the row reads as a braking demand.
        let n = if distance > EPSILON {
            offset.normalize()
        } else {
            -state.heading_vector()
        };

        match cfg.dynamics {
            DynamicsModel::DifferentialDrive => {
                let heading = state.heading_vector();
                let lateral = heading.perpendicular();
                let drift = dt * n.dot(&(state.velocity_vector() - obstacle.velocity));
                BarrierConstraint {
                    a: [
                        -dt * dt * n.dot(&heading),
                        -dt * dt * state.v * n.dot(&lateral),
                    ],
                    b: obstacle.gamma * h + drift,
                    source: obstacle.source,
                    h,
                }
            }
            DynamicsModel::SingleIntegrator => BarrierConstraint {
                a: [-dt * n.x, -dt * n.y],
                b: obstacle.gamma * h - dt * n.dot(&obstacle.velocity),
                source: obstacle.source,
                h,
            },
        }
    }

    /// Right-hand steering bias. Both agents of a mirrored pair steer to
    /// their own right, which breaks the mirror into complementary maneuvers.
    fn steering_bias_row(&self, state: &AgentState, bias: f64) -> BarrierConstraint {
        match self.config.dynamics {
            // A right turn is a negative turn rate.
            DynamicsModel::DifferentialDrive => BarrierConstraint {
                a: [0.0, 1.0],
                b: -bias,
                source: ConstraintSource::SteeringBias,
                h: 0.0,
            },
            // Lateral velocity to the right of the current heading.
            DynamicsModel::SingleIntegrator => {
                let lateral = state.heading_vector().perpendicular();
                BarrierConstraint {
                    a: [lateral.x, lateral.y],
                    b: -bias,
                    source: ConstraintSource::SteeringBias,
                    h: 0.0,
                }
            }
        }
    }

    /// Bounds the yielding agent's next-step speed at the surveyed cap.
    fn speed_ordering_row(&self, state: &AgentState, cap: f64) -> BarrierConstraint {
        let cfg = &self.config;
        match cfg.dynamics {
            // v + accel*dt <= cap
            DynamicsModel::DifferentialDrive => BarrierConstraint {
                a: [1.0, 0.0],
                b: (cap - state.v) / cfg.dt,
                source: ConstraintSource::SpeedOrdering,
                h: 0.0,
            },
            DynamicsModel::SingleIntegrator => {
                let heading = state.heading_vector();
                BarrierConstraint {
                    a: [heading.x, heading.y],
                    b: cap,
                    source: ConstraintSource::SpeedOrdering,
                    h: 0.0,
                }
            }
        }
    }
}

/// Converts a row-major dense matrix into the owned CSC form OSQP consumes.
/// Structural zeros are dropped, matching how the solver expects sparsity.
pub(crate) fn dense_to_csc(rows: &[Vec<f64>]) -> CscMatrix<'static> {
    let nrows = rows.len();
    let ncols = rows.first().map_or(0, |row| row.len());
    let mut data = Vec::new();
    let mut indices = Vec::new();
    let mut indptr = vec![0];

    for col in 0..ncols {
        for (row_idx, row) in rows.iter().enumerate() {
            if row[col] != 0.0 {
                data.push(row[col]);
                indices.push(row_idx);
            }
        }
        indptr.push(data.len());
    }

    CscMatrix {
        nrows,
        ncols,
        indptr: std::borrow::Cow::Owned(indptr),
        indices: std::borrow::Cow::Owned(indices),
        data: std::borrow::Cow::Owned(data),
    }
}

/// Upper-triangular variant for the quadratic cost matrix (OSQP requires
/// only the upper triangle of P).
pub(crate) fn dense_to_csc_upper(rows: &[Vec<f64>]) -> CscMatrix<'static> {
    let nrows = rows.len();
    let ncols = rows.first().map_or(0, |row| row.len());
    let mut data = Vec::new();
    let mut indices = Vec::new();
    let mut indptr = vec![0];

    for col in 0..ncols {
        for (row_idx, row) in rows.iter().enumerate().take(col + 1) {
            if row[col] != 0.0 {
                data.push(row[col]);
                indices.push(row_idx);
            }
        }
        indptr.push(data.len());
    }

    CscMatrix {
        nrows,
        ncols,
        indptr: std::borrow::Cow::Owned(indptr),
        indices: std::borrow::Cow::Owned(indices),
        data: std::borrow::Cow::Owned(data),
    }
}
