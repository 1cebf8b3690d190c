//! # Learned Safety Controller
//!
//! Inference-time implementation of the learned controller variant: a dense
//! ReLU network whose output stage can be a safety QP over the same barrier
//! constraint family the optimizer enforces, so the returned control is
//! constraint-admissible even though the upstream network was only trained.
//!
//! The controller is described by a [`ModelDefinition`] record (JSON) plus a
//! weights artifact (JSON layer list). Both are immutable after load; many
//! controller instances may share one definition while owning their own
//! parameter snapshot.
//!
//! Strictly inference: loss definitions, optimizers and data collection live
//! elsewhere.

use crate::barrier::BarrierBuilder;
use crate::config::SimConfig;
use crate::liveness;
use crate::sim::Controller;
use crate::structs::{AgentState, Control, DynamicsModel, StaticObstacle, Vector2D};
use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use osqp::{Problem, Settings, Status};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Fatal load-time failures. Weights and normalization cannot be defaulted,
/// so anything malformed or missing stops the load with a named cause.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed model record {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("model definition does not reference a weights file")]
    MissingWeights,
    #[error("hidden layer sizes must be non-empty and positive")]
    BadArchitecture,
    #[error("layer {layer} has shape {got_rows}x{got_cols}, expected {expected_rows}x{expected_cols}")]
    LayerShape {
        layer: usize,
        got_rows: usize,
        got_cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },
    #[error("normalization vector `{name}` has length {got}, expected {expected}")]
    NormalizationShape {
        name: &'static str,
        got: usize,
        expected: usize,
    },
    #[error("assembled feature vector has length {got}, expected {expected} per the normalization stats")]
    InputWidth { got: usize, expected: usize },
}

fn default_n_opponents() -> usize {
    1
}

/// Static description of a learned controller: architecture sizing, barrier
/// flag, normalization statistics and the input feature flags.
///
/// Backward compatibility rule: any flag absent from a loaded record defaults
/// to `false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub is_barriernet: bool,
    /// Weights artifact, relative to the definition file's directory.
    pub weights_path: Option<String>,
    pub hidden_sizes: Vec<usize>,
    pub input_mean: Vec<f64>,
    pub input_std: Vec<f64>,
    pub label_mean: Vec<f64>,
    pub label_std: Vec<f64>,
    #[serde(default)]
    pub include_goal: bool,
    #[serde(default)]
    pub add_control_limits: bool,
    #[serde(default)]
    pub add_liveness_filter: bool,
    #[serde(default)]
    pub separate_penalty_for_opp: bool,
    #[serde(default)]
    pub x_is_d_goal: bool,
    #[serde(default)]
    pub add_liveness_as_input: bool,
    #[serde(default)]
    pub fixed_liveness_input: bool,
    #[serde(default)]
    pub ego_frame_inputs: bool,
    #[serde(default)]
    pub static_obs_xy_only: bool,
    #[serde(default)]
    pub add_dist_to_static_obs: bool,
    #[serde(default = "default_n_opponents")]
    pub n_opponents: usize,
}

impl ModelDefinition {
    pub fn from_json_file(path: &Path) -> Result<Self, ModelError> {
        let text = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ModelError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let text = serde_json::to_string_pretty(self).expect("definition serializes");
        std::fs::write(path, text).map_err(|source| ModelError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Number of inputs the normalization statistics were fitted for.
    pub fn num_inputs(&self) -> usize {
        self.input_mean.len()
    }

    /// Raw network outputs: two control channels plus the barrier penalty
    /// head when present.
    pub fn num_outputs(&self) -> usize {
        2 + self.num_penalty_outputs()
    }

    fn num_penalty_outputs(&self) -> usize {
        if self.is_barriernet {
            if self.separate_penalty_for_opp {
                2
            } else {
                1
            }
        } else {
            0
        }
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.hidden_sizes.is_empty() || self.hidden_sizes.iter().any(|&size| size == 0) {
            return Err(ModelError::BadArchitecture);
        }
        if self.input_std.len() != self.input_mean.len() {
            return Err(ModelError::NormalizationShape {
                name: "input_std",
                got: self.input_std.len(),
                expected: self.input_mean.len(),
            });
        }
        for (name, vec) in [("label_mean", &self.label_mean), ("label_std", &self.label_std)] {
            if vec.len() != 2 {
                return Err(ModelError::NormalizationShape {
                    name,
                    got: vec.len(),
                    expected: 2,
                });
            }
        }
        Ok(())
    }
}

/// One dense layer of the weights artifact, row-major.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerRecord {
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
}

/// The weights artifact referenced by a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightsRecord {
    pub layers: Vec<LayerRecord>,
}

impl WeightsRecord {
    pub fn from_json_file(path: &Path) -> Result<Self, ModelError> {
        let text = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ModelError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// `(x - mean) / std` with the degenerate non-finite ratio mapped to zero so
/// NaN never enters the network.
fn normalize(value: f64, mean: f64, std: f64) -> f64 {
    let z = (value - mean) / std;
    if z.is_finite() {
        z
    } else {
        0.0
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Learned controller instance bound to one agent.
#[derive(Debug)]
pub struct ModelController {
    definition: Arc<ModelDefinition>,
    layers: Vec<(DMatrix<f64>, DVector<f64>)>,
    goal: Vector2D,
    static_obstacles: Vec<StaticObstacle>,
    builder: BarrierBuilder,
    config: SimConfig,
    solve_failed: bool,
}

impl ModelController {
    /// Loads a definition record and its weights artifact from disk. The
    /// weights path resolves relative to the definition's directory.
    pub fn load(
        definition_path: &Path,
        goal: [f64; 3],
        static_obstacles: Vec<StaticObstacle>,
        config: SimConfig,
        has_priority: bool,
    ) -> Result<Self, ModelError> {
        let definition = ModelDefinition::from_json_file(definition_path)?;
        let weights_rel = definition
            .weights_path
            .as_deref()
            .ok_or(ModelError::MissingWeights)?;
        let weights_path: PathBuf = definition_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(weights_rel);
        let weights = WeightsRecord::from_json_file(&weights_path)?;
        info!(
            "loaded model definition {} (barriernet: {})",
            definition_path.display(),
            definition.is_barriernet
        );
        Self::from_parts(
            Arc::new(definition),
            weights,
            goal,
            static_obstacles,
            config,
            has_priority,
        )
    }

    /// Builds a controller from an in-memory definition and weights record,
    /// validating the layer chain against the definition's sizing.
    pub fn from_parts(
        definition: Arc<ModelDefinition>,
        weights: WeightsRecord,
        goal: [f64; 3],
        static_obstacles: Vec<StaticObstacle>,
        config: SimConfig,
        has_priority: bool,
    ) -> Result<Self, ModelError> {
        definition.validate()?;

        let mut expected_dims = Vec::with_capacity(definition.hidden_sizes.len() + 2);
        expected_dims.push(definition.num_inputs());
        expected_dims.extend_from_slice(&definition.hidden_sizes);
        expected_dims.push(definition.num_outputs());

        if weights.layers.len() != expected_dims.len() - 1 {
            return Err(ModelError::LayerShape {
                layer: weights.layers.len(),
                got_rows: 0,
                got_cols: 0,
                expected_rows: expected_dims.len() - 1,
                expected_cols: 0,
            });
        }

        let mut layers = Vec::with_capacity(weights.layers.len());
        for (idx, record) in weights.layers.iter().enumerate() {
            let expected_rows = expected_dims[idx + 1];
            let expected_cols = expected_dims[idx];
            let got_rows = record.weights.len();
            let got_cols = record.weights.first().map_or(0, |row| row.len());
            if got_rows != expected_rows
                || got_cols != expected_cols
                || record.bias.len() != expected_rows
                || record.weights.iter().any(|row| row.len() != got_cols)
            {
                return Err(ModelError::LayerShape {
                    layer: idx,
                    got_rows,
                    got_cols,
                    expected_rows,
                    expected_cols,
                });
            }
            let matrix = DMatrix::from_fn(got_rows, got_cols, |r, c| record.weights[r][c]);
            let bias = DVector::from_column_slice(&record.bias);
            layers.push((matrix, bias));
        }

        let controller = ModelController {
            definition,
            layers,
            goal: Vector2D::new(goal[0], goal[1]),
            static_obstacles,
            builder: BarrierBuilder::new(config, has_priority),
            config,
            solve_failed: false,
        };

        // The flag combination must produce exactly the feature width the
        // normalization statistics were fitted for; a mismatch would silently
        // scramble every input, so it is fatal here.
        let probe = AgentState::new(0.0, 0.0, 0.0, 0.0);
        let opponents = vec![probe; controller.definition.n_opponents];
        let width = controller.assemble_features(&probe, &opponents).len();
        if width != controller.definition.num_inputs() {
            return Err(ModelError::InputWidth {
                got: width,
                expected: controller.definition.num_inputs(),
            });
        }
        Ok(controller)
    }

    pub fn definition(&self) -> &ModelDefinition {
        &self.definition
    }

    /// Builds the input feature vector per the definition's flags.
    ///
    /// Layout: own block, opponent blocks (padded with zeros up to
    /// `n_opponents`), optional goal, static-obstacle blocks, optional
    /// obstacle distances, optional liveness feature.
    fn assemble_features(&self, state: &AgentState, opponents: &[AgentState]) -> Vec<f64> {
        let def = &self.definition;
        let mut features = Vec::with_capacity(def.num_inputs());

        // Ego-frame transform: positions translate/rotate so the agent sits
        // at the origin heading +x.
        let (sin, cos) = state.theta.sin_cos();
        let to_frame = |p: Vector2D| -> Vector2D {
            if def.ego_frame_inputs {
                let d = p - state.position();
                Vector2D::new(d.x * cos + d.y * sin, -d.x * sin + d.y * cos)
            } else {
                p
            }
        };

        // Own block.
        let own_theta = if def.ego_frame_inputs { 0.0 } else { state.theta };
        if def.x_is_d_goal {
            let d = to_frame(self.goal)
                - if def.ego_frame_inputs {
                    Vector2D::zero()
                } else {
                    state.position()
                };
            features.extend_from_slice(&[d.x, d.y, own_theta, state.v]);
        } else {
            let own = to_frame(state.position());
            features.extend_from_slice(&[own.x, own.y, own_theta, state.v]);
        }

        // Opponent blocks.
        for idx in 0..def.n_opponents {
            match opponents.get(idx) {
                Some(opp) => {
                    let p = to_frame(opp.position());
                    let theta = if def.ego_frame_inputs {
                        opp.theta - state.theta
                    } else {
                        opp.theta
                    };
                    features.extend_from_slice(&[p.x, p.y, theta, opp.v]);
                }
                None => features.extend_from_slice(&[0.0; 4]),
            }
        }

        if def.include_goal {
            let g = to_frame(self.goal);
            features.extend_from_slice(&[g.x, g.y]);
        }

        for obs in &self.static_obstacles {
            let p = to_frame(obs.center());
            if def.static_obs_xy_only {
                features.extend_from_slice(&[p.x, p.y]);
            } else {
                features.extend_from_slice(&[p.x, p.y, obs.radius]);
            }
        }
        if def.add_dist_to_static_obs {
            for obs in &self.static_obstacles {
                features.push(state.position().distance(&obs.center()));
            }
        }

        if def.add_liveness_as_input {
            if def.fixed_liveness_input {
                features.push(self.config.liveness_threshold);
            } else {
                let score = opponents
                    .first()
                    .map(|opp| liveness::evaluate(state, opp, &self.config).score)
                    .unwrap_or(0.0);
                features.push(score);
            }
        }

        features
    }

    /// Dense forward pass: ReLU on every layer except the head.
    fn forward(&self, features: &[f64]) -> DVector<f64> {
        let def = &self.definition;
        let mut activation = DVector::from_fn(features.len(), |i, _| {
            normalize(features[i], def.input_mean[i], def.input_std[i])
        });
        let last = self.layers.len() - 1;
        for (idx, (weights, bias)) in self.layers.iter().enumerate() {
            activation = weights * activation + bias;
            if idx != last {
                activation.apply(|x| *x = x.max(0.0));
            }
        }
        activation
    }

    /// Solves the safety QP `min |u - u_ref|^2` subject to the one-step
    /// barrier rows (and control limits when configured).
    fn safety_qp(
        &self,
        state: &AgentState,
        opponents: &[AgentState],
        u_ref: Control,
        penalties: &[f64],
    ) -> Option<Control> {
        let cfg = &self.config;
        let def = &self.definition;

        let report = opponents
            .first()
            .map(|opp| liveness::evaluate(state, opp, cfg));
        let mut view =
            self.builder
                .survey(state, opponents, &self.static_obstacles, report.as_ref());

        // BarrierNet head: the penalty outputs modulate the per-class decay
        // rates, neutral at zero pre-activation.
        if !penalties.is_empty() {
            let opp_scale = 2.0 * sigmoid(penalties[0]);
            let static_scale = if def.separate_penalty_for_opp {
                2.0 * sigmoid(penalties[1])
            } else {
                opp_scale
            };
            for obstacle in &mut view.obstacles {
                let scale = match obstacle.source {
                    crate::barrier::ConstraintSource::Opponent(_) => opp_scale,
                    _ => static_scale,
                };
                obstacle.gamma = (obstacle.gamma * scale).clamp(0.0, 1.0);
            }
        }

        let set = self.builder.one_step_rows(state, &view);
        if !set.violations.is_empty() {
            warn!(
                "model controller: {} safety margin(s) violated at inference",
                set.violations.len()
            );
        }

        let mut rows: Vec<Vec<f64>> = Vec::new();
        let mut lower = Vec::new();
        let mut upper = Vec::new();
        for row in &set.constraints {
            rows.push(vec![row.a[0], row.a[1]]);
            lower.push(f64::NEG_INFINITY);
            upper.push(row.b);
        }
        if def.add_control_limits {
            let (b1, b2) = match cfg.dynamics {
                DynamicsModel::DifferentialDrive => (cfg.a_max, cfg.omega_max),
                DynamicsModel::SingleIntegrator => (cfg.v_max, cfg.v_max),
            };
            rows.push(vec![1.0, 0.0]);
            lower.push(-b1);
            upper.push(b1);
            rows.push(vec![0.0, 1.0]);
            lower.push(-b2);
            upper.push(b2);
        }

        if rows.is_empty() {
            return Some(u_ref);
        }

        let p = crate::barrier::dense_to_csc_upper(&[vec![2.0, 0.0], vec![0.0, 2.0]]);
        let a = crate::barrier::dense_to_csc(&rows);
        let q = [-2.0 * u_ref.u1, -2.0 * u_ref.u2];

        let settings = Settings::default()
            .verbose(false)
            .eps_abs(1e-6)
            .eps_rel(1e-6)
            .max_iter(cfg.solver_max_iter)
            .polishing(true);

        let mut problem = match Problem::new(p, &q, a, &lower, &upper, &settings) {
            Ok(problem) => problem,
            Err(err) => {
                warn!("model controller: safety QP setup failed: {}", err);
                return None;
            }
        };

        let result = problem.solve();
        match &result {
            Status::Solved(sol) => Some(Control::new(sol.x()[0], sol.x()[1])),
            Status::SolvedInaccurate(sol) => Some(Control::new(sol.x()[0], sol.x()[1])),
            Status::MaxIterationsReached(sol) => Some(Control::new(sol.x()[0], sol.x()[1])),
            _ => None,
        }
    }

    fn brake(&self, state: &AgentState) -> Control {
        match self.config.dynamics {
            DynamicsModel::DifferentialDrive => Control::new(
                (-state.v / self.config.dt).clamp(-self.config.a_max, self.config.a_max),
                0.0,
            ),
            DynamicsModel::SingleIntegrator => Control::zero(),
        }
    }

    /// Full inference pipeline: features, normalization, forward pass,
    /// optional safety QP, label de-normalization.
    fn infer(&mut self, state: &AgentState, opponents: &[AgentState]) -> Control {
        let def = Arc::clone(&self.definition);
        let features = self.assemble_features(state, opponents);
        let raw = self.forward(&features);

        // De-normalize the control channels before any QP: the safety layer
        // operates in real actuation units.
        let u_ref = Control::new(
            raw[0] * def.label_std[0] + def.label_mean[0],
            raw[1] * def.label_std[1] + def.label_mean[1],
        );

        if !def.is_barriernet {
            self.solve_failed = false;
            return u_ref;
        }

        let penalties: Vec<f64> = (2..def.num_outputs()).map(|i| raw[i]).collect();
        match self.safety_qp(state, opponents, u_ref, &penalties) {
            Some(control) => {
                self.solve_failed = false;
                control
            }
            None => {
                self.solve_failed = true;
                warn!("model controller: applying braking fallback");
                self.brake(state)
            }
        }
    }
}

impl Controller for ModelController {
    fn reset(&mut self, _initial_state: &AgentState, _opponents: &[AgentState]) {
        self.solve_failed = false;
    }

    fn step(&mut self, _timestamp: f64, state: &AgentState, opponents: &[AgentState]) -> Control {
        self.infer(state, opponents)
    }

    fn solve_failed(&self) -> bool {
        self.solve_failed
    }
}
