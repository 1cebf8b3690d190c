//! # MPC-CBF Optimizer
//!
//! Receding-horizon controller: each call condenses a finite-horizon
//! optimization over the stacked control sequence into a QP and executes only
//! the first control of the optimized sequence.
//!
//! The QP is built around a nominal rollout from the warm start:
//!
//! - first-order position sensitivities are chained through the motion
//!   model's Jacobians, so every horizon position is affine in the control
//!   deltas;
//! - the cost tracks the goal over the horizon plus control-effort and
//!   smoothness penalties;
//! - actuation and speed bounds are hard rows;
//! - the barrier material from [`crate::barrier`] is lifted to every horizon
//!   step (opponents propagated at constant velocity) and softened by a
//!   single shared penetration slack, so the program stays well-posed even
//!   when an agent starts inside a safety margin.
//!
//! A couple of relinearization passes tighten the approximation. Solver
//! breakdown is recoverable per step: the controller applies a braking
//! fallback, logs it, and reports the condition through `solve_failed`.

use crate::barrier::{dense_to_csc, dense_to_csc_upper, BarrierBuilder, ObstacleView, WorldView};
use crate::config::SimConfig;
use crate::liveness;
use crate::sim::Controller;
use crate::structs::{AgentState, Control, DynamicsModel, StaticObstacle, Vector2D};
use log::{debug, warn};
use nalgebra::{DMatrix, DVector, Matrix2, RowVector2, SMatrix};
use osqp::{Problem, Settings, Status};

const Q_STAGE: f64 = 1.0;
const Q_TERMINAL: f64 = 8.0;
const R_ACCEL: f64 = 0.08;
const R_OMEGA: f64 = 0.04;
const W_SMOOTH: f64 = 0.02;
/// Terminal-speed penalty: the horizon should end near rest when the goal is
/// close, which settles the receding-horizon loop instead of orbiting.
const W_TERMINAL_SPEED: f64 = 0.4;
/// Quadratic penalty on the shared barrier penetration slack. Large enough
/// that buying progress through a safety margin is never the cheaper option.
const W_SLACK: f64 = 1.0e4;
/// Sides of the polygonal speed bound for the single-integrator model.
const SPEED_POLYGON_SIDES: usize = 16;

type Sensitivity = SMatrix<f64, 4, 2>;

/// Receding-horizon MPC-CBF controller for one agent.
pub struct MpcController {
    agent_idx: usize,
    goal: Vector2D,
    static_obstacles: Vec<StaticObstacle>,
    builder: BarrierBuilder,
    config: SimConfig,
    warm_start: Vec<Control>,
    prev_control: Control,
    solve_failed: bool,
}

impl MpcController {
    pub fn new(
        agent_idx: usize,
        goal: [f64; 3],
        static_obstacles: Vec<StaticObstacle>,
        config: SimConfig,
        has_priority: bool,
    ) -> Self {
        MpcController {
            agent_idx,
            goal: Vector2D::new(goal[0], goal[1]),
            static_obstacles,
            builder: BarrierBuilder::new(config, has_priority),
            config,
            warm_start: vec![Control::zero(); config.horizon],
            prev_control: Control::zero(),
            solve_failed: false,
        }
    }

    /// Documented fallback when the solver cannot produce a usable iterate:
    /// brake to a stop without turning.
    fn fallback_control(&self, state: &AgentState) -> Control {
        match self.config.dynamics {
            DynamicsModel::DifferentialDrive => Control::new(
                (-state.v / self.config.dt).clamp(-self.config.a_max, self.config.a_max),
                0.0,
            ),
            DynamicsModel::SingleIntegrator => Control::zero(),
        }
    }

    /// One-step Jacobians of the motion model at `(state, control)`.
    fn jacobians(&self, state: &AgentState, control: &Control) -> (SMatrix<f64, 4, 4>, Sensitivity) {
        let dt = self.config.dt;
        match self.config.dynamics {
            DynamicsModel::DifferentialDrive => {
                // Semi-implicit update: v' and theta' move first.
                let v_next = state.v + control.u1 * dt;
                let theta_next = state.theta + control.u2 * dt;
                let (sin, cos) = theta_next.sin_cos();

                let mut a = SMatrix::<f64, 4, 4>::identity();
                a[(0, 2)] = -v_next * sin * dt;
                a[(0, 3)] = cos * dt;
                a[(1, 2)] = v_next * cos * dt;
                a[(1, 3)] = sin * dt;

                let mut b = Sensitivity::zeros();
                b[(0, 0)] = cos * dt * dt;
                b[(0, 1)] = -v_next * sin * dt * dt;
                b[(1, 0)] = sin * dt * dt;
                b[(1, 1)] = v_next * cos * dt * dt;
                b[(2, 1)] = dt;
                b[(3, 0)] = dt;
                (a, b)
            }
            DynamicsModel::SingleIntegrator => {
                // Positions are exactly linear in the commanded velocity; the
                // bookkeeping heading/speed entries carry no sensitivity the
                // cost or constraints consume.
                let mut a = SMatrix::<f64, 4, 4>::zeros();
                a[(0, 0)] = 1.0;
                a[(1, 1)] = 1.0;
                let mut b = Sensitivity::zeros();
                b[(0, 0)] = dt;
                b[(1, 1)] = dt;
                (a, b)
            }
        }
    }

    /// Condenses and solves one linearized QP around `nominal`. Returns the
    /// improved control sequence, or `None` when the solver breaks down.
    fn solve_qp(
        &self,
        state: &AgentState,
        view: &WorldView,
        nominal: &[Control],
    ) -> Option<Vec<Control>> {
        let cfg = &self.config;
        let n = nominal.len();
        let dim = 2 * n + 1; // control deltas + shared barrier slack
        let slack = 2 * n;
        let dt = cfg.dt;

        // Nominal rollout and position sensitivities sens[j][k] = d x_j / d u_k.
        let mut states = Vec::with_capacity(n + 1);
        states.push(*state);
        for control in nominal {
            let next = states.last().unwrap().apply(*control, cfg.dynamics, dt);
            states.push(next);
        }

        let mut sens: Vec<Vec<Sensitivity>> = vec![vec![Sensitivity::zeros(); n]; n + 1];
        for k in 0..n {
            let (_, b) = self.jacobians(&states[k], &nominal[k]);
            sens[k + 1][k] = b;
            for j in k + 1..n {
                let (a, _) = self.jacobians(&states[j], &nominal[j]);
                sens[j + 1][k] = a * sens[j][k];
            }
        }
        let pos_sens = |j: usize, k: usize| -> Matrix2<f64> {
            sens[j][k].fixed_rows::<2>(0).into_owned()
        };

        // ---- Quadratic cost over the deltas ----
        let mut p = DMatrix::<f64>::zeros(dim, dim);
        let mut q = DVector::<f64>::zeros(dim);

        // Goal tracking at every horizon position.
        for j in 1..=n {
            let weight = if j == n { Q_TERMINAL } else { Q_STAGE };
            let err = states[j].position() - self.goal;
            for k in 0..j {
                let gk = pos_sens(j, k);
                for l in 0..j {
                    let gl = pos_sens(j, l);
                    let block = gk.transpose() * gl * (2.0 * weight);
                    for r in 0..2 {
                        for c in 0..2 {
                            p[(2 * k + r, 2 * l + c)] += block[(r, c)];
                        }
                    }
                }
                let lin = gk.transpose() * nalgebra::Vector2::new(err.x, err.y) * (2.0 * weight);
                q[2 * k] += lin[0];
                q[2 * k + 1] += lin[1];
            }
        }

        // Control effort on the absolute controls.
        let (r1, r2) = match cfg.dynamics {
            DynamicsModel::DifferentialDrive => (R_ACCEL, R_OMEGA),
            DynamicsModel::SingleIntegrator => (R_ACCEL, R_ACCEL),
        };
        for k in 0..n {
            p[(2 * k, 2 * k)] += 2.0 * r1;
            p[(2 * k + 1, 2 * k + 1)] += 2.0 * r2;
            q[2 * k] += 2.0 * r1 * nominal[k].u1;
            q[2 * k + 1] += 2.0 * r2 * nominal[k].u2;
        }

        // Smoothness between consecutive controls (the previously applied
        // control anchors the first difference).
        for k in 0..n {
            let (prev_u1, prev_u2) = if k == 0 {
                (self.prev_control.u1, self.prev_control.u2)
            } else {
                (nominal[k - 1].u1, nominal[k - 1].u2)
            };
            let d1 = nominal[k].u1 - prev_u1;
            let d2 = nominal[k].u2 - prev_u2;
            for (var, diff) in [(0usize, d1), (1usize, d2)] {
                let i = 2 * k + var;
                p[(i, i)] += 2.0 * W_SMOOTH;
                q[i] += 2.0 * W_SMOOTH * diff;
                if k > 0 {
                    let ip = 2 * (k - 1) + var;
                    p[(ip, ip)] += 2.0 * W_SMOOTH;
                    p[(i, ip)] -= 2.0 * W_SMOOTH;
                    p[(ip, i)] -= 2.0 * W_SMOOTH;
                    q[ip] -= 2.0 * W_SMOOTH * diff;
                }
            }
        }

        // Terminal speed (differential drive): v_N is affine in the
        // acceleration deltas.
        if cfg.dynamics == DynamicsModel::DifferentialDrive {
            let terminal_speed = states[n].v;
            for k in 0..n {
                for l in 0..n {
                    p[(2 * k, 2 * l)] += 2.0 * W_TERMINAL_SPEED * dt * dt;
                }
                q[2 * k] += 2.0 * W_TERMINAL_SPEED * terminal_speed * dt;
            }
        }

        p[(slack, slack)] = 2.0 * W_SLACK;

        // ---- Linear constraint rows: l <= A w <= u ----
        let mut rows: Vec<Vec<f64>> = Vec::new();
        let mut lower: Vec<f64> = Vec::new();
        let mut upper: Vec<f64> = Vec::new();

        // Actuation box per control variable.
        let (b1, b2) = match cfg.dynamics {
            DynamicsModel::DifferentialDrive => (cfg.a_max, cfg.omega_max),
            DynamicsModel::SingleIntegrator => (cfg.v_max, cfg.v_max),
        };
        for k in 0..n {
            let mut row = vec![0.0; dim];
            row[2 * k] = 1.0;
            rows.push(row);
            lower.push(-b1 - nominal[k].u1);
            upper.push(b1 - nominal[k].u1);

            let mut row = vec![0.0; dim];
            row[2 * k + 1] = 1.0;
            rows.push(row);
            lower.push(-b2 - nominal[k].u2);
            upper.push(b2 - nominal[k].u2);
        }

        // Non-negative slack.
        let mut row = vec![0.0; dim];
        row[slack] = 1.0;
        rows.push(row);
        lower.push(0.0);
        upper.push(f64::INFINITY);

        if cfg.dynamics == DynamicsModel::DifferentialDrive {
            // Forward-speed corridor 0 <= v_j <= v_max.
            for j in 1..=n {
                let mut row = vec![0.0; dim];
                let mut nominal_speed = state.v;
                for (k, u) in nominal.iter().enumerate().take(j) {
                    row[2 * k] = dt;
                    nominal_speed += u.u1 * dt;
                }
                rows.push(row);
                lower.push(-nominal_speed);
                upper.push(cfg.v_max - nominal_speed);
            }
        } else {
            // Polygonal speed bound on each commanded velocity.
            for k in 0..n {
                for side in 0..SPEED_POLYGON_SIDES {
                    let angle =
                        side as f64 / SPEED_POLYGON_SIDES as f64 * 2.0 * std::f64::consts::PI;
                    let dir = Vector2D::new(angle.cos(), angle.sin());
                    let mut row = vec![0.0; dim];
                    row[2 * k] = dir.x;
                    row[2 * k + 1] = dir.y;
                    rows.push(row);
                    lower.push(f64::NEG_INFINITY);
                    upper.push(cfg.v_max - (dir.x * nominal[k].u1 + dir.y * nominal[k].u2));
                }
            }
        }

        // Barrier decay rows per obstacle per horizon step, softened by the
        // shared slack.
        for obstacle in &view.obstacles {
            self.push_barrier_rows(
                obstacle, &states, &pos_sens, dim, slack, &mut rows, &mut lower, &mut upper,
            );
        }

        // Liveness steering bias: right-hand turn rate (or lateral velocity)
        // at every horizon step.
        if let Some(bias) = view.steering_bias {
            for k in 0..n {
                let mut row = vec![0.0; dim];
                let bound = match cfg.dynamics {
                    DynamicsModel::DifferentialDrive => {
                        row[2 * k + 1] = 1.0;
                        -bias - nominal[k].u2
                    }
                    DynamicsModel::SingleIntegrator => {
                        let lateral = states[k].heading_vector().perpendicular();
                        row[2 * k] = lateral.x;
                        row[2 * k + 1] = lateral.y;
                        -bias - (lateral.x * nominal[k].u1 + lateral.y * nominal[k].u2)
                    }
                };
                rows.push(row);
                lower.push(f64::NEG_INFINITY);
                upper.push(bound);
            }
        }

        // Liveness speed ordering for the yielding agent, ramped so the cap
        // is always reachable under the acceleration bound.
        if let Some(cap) = view.speed_cap {
            match cfg.dynamics {
                DynamicsModel::DifferentialDrive => {
                    for j in 1..=n {
                        let reachable = (state.v - cfg.a_max * dt * j as f64).max(cap);
                        let mut row = vec![0.0; dim];
                        let mut nominal_speed = state.v;
                        for (k, u) in nominal.iter().enumerate().take(j) {
                            row[2 * k] = dt;
                            nominal_speed += u.u1 * dt;
                        }
                        rows.push(row);
                        lower.push(f64::NEG_INFINITY);
                        upper.push(reachable - nominal_speed);
                    }
                }
                DynamicsModel::SingleIntegrator => {
                    for k in 0..n {
                        let heading = states[k].heading_vector();
                        let mut row = vec![0.0; dim];
                        row[2 * k] = heading.x;
                        row[2 * k + 1] = heading.y;
                        rows.push(row);
                        lower.push(f64::NEG_INFINITY);
                        upper.push(cap - (heading.x * nominal[k].u1 + heading.y * nominal[k].u2));
                    }
                }
            }
        }

        // ---- Solve ----
        let p_rows: Vec<Vec<f64>> = (0..dim)
            .map(|r| (0..dim).map(|c| p[(r, c)]).collect())
            .collect();
        let p_csc = dense_to_csc_upper(&p_rows);
        let a_csc = dense_to_csc(&rows);
        let q_slice: Vec<f64> = q.iter().copied().collect();

        let settings = Settings::default()
            .verbose(false)
            .eps_abs(1e-5)
            .eps_rel(1e-5)
            .max_iter(cfg.solver_max_iter)
            .polishing(true);

        let mut problem =
            match Problem::new(p_csc, &q_slice, a_csc, &lower, &upper, &settings) {
                Ok(problem) => problem,
                Err(err) => {
                    warn!("agent {}: QP setup failed: {}", self.agent_idx, err);
                    return None;
                }
            };

        let result = problem.solve();
        let solution = match &result {
            Status::Solved(sol) => Some(sol.x()),
            Status::SolvedInaccurate(sol) => Some(sol.x()),
            Status::MaxIterationsReached(sol) => Some(sol.x()),
            _ => None,
        }?;

        let mut controls = Vec::with_capacity(n);
        for (k, u) in nominal.iter().enumerate() {
            let u1 = (u.u1 + solution[2 * k]).clamp(-b1, b1);
            let u2 = (u.u2 + solution[2 * k + 1]).clamp(-b2, b2);
            controls.push(Control::new(u1, u2));
        }
        Some(controls)
    }

    /// Lifts one obstacle's decay bound `h_j >= (1 - gamma) h_{j-1}` over the
    /// horizon, with the obstacle center propagated at constant velocity and
    /// both barrier values affine in the control deltas.
    #[allow(clippy::too_many_arguments)]
    fn push_barrier_rows(
        &self,
        obstacle: &ObstacleView,
        states: &[AgentState],
        pos_sens: &dyn Fn(usize, usize) -> Matrix2<f64>,
        dim: usize,
        slack: usize,
        rows: &mut Vec<Vec<f64>>,
        lower: &mut Vec<f64>,
        upper: &mut Vec<f64>,
    ) {
        let dt = self.config.dt;
        let n = states.len() - 1;
        let decay = 1.0 - obstacle.gamma;

        // Gradient rows n_j^T G_j and nominal barrier values per step.
        let mut h_nom = Vec::with_capacity(n + 1);
        let mut normals = Vec::with_capacity(n + 1);
        for (j, state_j) in states.iter().enumerate() {
            let center = obstacle.center + obstacle.velocity * (j as f64 * dt);
            let offset = state_j.position() - center;
            let distance = offset.magnitude();
            h_nom.push(distance - obstacle.clearance);
            normals.push(if distance > 1e-9 {
                offset.normalize()
            } else {
                -state_j.heading_vector()
            });
        }

        for j in 1..=n {
            let mut row = vec![0.0; dim];
            let nj = RowVector2::new(normals[j].x, normals[j].y);
            for k in 0..j {
                let grad = nj * pos_sens(j, k);
                row[2 * k] += grad[0];
                row[2 * k + 1] += grad[1];
            }
            if j > 1 {
                let nprev = RowVector2::new(normals[j - 1].x, normals[j - 1].y);
                for k in 0..j - 1 {
                    let grad = nprev * pos_sens(j - 1, k);
                    row[2 * k] -= decay * grad[0];
                    row[2 * k + 1] -= decay * grad[1];
                }
            }
            row[slack] = 1.0;
            rows.push(row);
            lower.push(decay * h_nom[j - 1] - h_nom[j]);
            upper.push(f64::INFINITY);
        }
    }
}

impl Controller for MpcController {
    fn reset(&mut self, _initial_state: &AgentState, _opponents: &[AgentState]) {
        self.warm_start = vec![Control::zero(); self.config.horizon];
        self.prev_control = Control::zero();
        self.solve_failed = false;
    }

    fn step(&mut self, timestamp: f64, state: &AgentState, opponents: &[AgentState]) -> Control {
        let cfg = self.config;

        // Liveness runs before constraint construction every step; it is
        // evaluated against the nearest opponent.
        let report = opponents
            .iter()
            .min_by(|p, q| {
                state
                    .distance_to(p)
                    .partial_cmp(&state.distance_to(q))
                    .expect("finite distances")
            })
            .map(|nearest| liveness::evaluate(state, nearest, &cfg));

        let view = self
            .builder
            .survey(state, opponents, &self.static_obstacles, report.as_ref());
        if !view.violations.is_empty() {
            warn!(
                "agent {}: {} safety margin(s) already violated at t = {:.2}",
                self.agent_idx,
                view.violations.len(),
                timestamp
            );
        }

        let mut controls = self.warm_start.clone();
        let mut solved = false;
        for pass in 0..cfg.linearization_passes.max(1) {
            match self.solve_qp(state, &view, &controls) {
                Some(improved) => {
                    controls = improved;
                    solved = true;
                }
                None => {
                    debug!(
                        "agent {}: solver breakdown on pass {} at t = {:.2}",
                        self.agent_idx, pass, timestamp
                    );
                    break;
                }
            }
        }

        if !solved {
            self.solve_failed = true;
            let fallback = self.fallback_control(state);
            warn!(
                "agent {}: applying braking fallback at t = {:.2}",
                self.agent_idx, timestamp
            );
            self.warm_start = vec![Control::zero(); cfg.horizon];
            self.prev_control = fallback;
            return fallback;
        }

        self.solve_failed = false;
        let first = controls[0];
        // Shift the solution one step for the next warm start.
        self.warm_start = controls[1..].to_vec();
        self.warm_start.push(*controls.last().unwrap());
        self.prev_control = first;
        first
    }

    fn solve_failed(&self) -> bool {
        self.solve_failed
    }
}
