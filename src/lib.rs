//! # LiveNet Core
//!
//! A game-theoretic motion-planning engine for differential-drive mobile
//! robots: receding-horizon MPC with discrete-time Control Barrier Function
//! (CBF) safety constraints, an interaction-liveness feedback loop that
//! breaks symmetric deadlocks, and a learned controller variant whose output
//! stage is a safety QP over the same constraint family.
//!
//! ## Components
//!
//! - **liveness**: scores whether two agents' current trajectories resolve a
//!   conflict on their own or drift toward a mirrored standoff.
//! - **barrier**: builds the discrete CBF constraint material (static
//!   circles, opponents as moving circles, liveness symmetry-breaking terms)
//!   consumed by both solver backends.
//! - **mpc**: the optimization-based controller, a condensed horizon QP via
//!   OSQP, solve-then-execute-first-action.
//! - **model**: the learned controller, a dense network plus a safety-QP
//!   output stage, loaded from a structured definition record.
//! - **sim**: the lock-step simulation driver binding controllers through a
//!   single contract.
//!
//! ## Usage
//!
//! The outer experiment layer (scenario layout, plotting, dataset capture)
//! lives outside this crate and drives it either natively or through the
//! optional Python bindings (`python-bindings` feature).

pub mod barrier;
pub mod config;
pub mod liveness;
pub mod model;
pub mod mpc;
pub mod sim;
pub mod structs;

#[cfg(feature = "python-bindings")]
mod python;

pub use barrier::{
    BarrierBuilder, BarrierConstraint, ConstraintSet, ConstraintSource, ObstacleView, WorldView,
};
pub use config::{GammaConfig, SimConfig};
pub use liveness::{evaluate as evaluate_liveness, LivenessReport};
pub use model::{LayerRecord, ModelController, ModelDefinition, ModelError, WeightsRecord};
pub use mpc::MpcController;
pub use sim::{run_simulation, BlankController, BlankSink, Controller, RecordSink, SimHistory};
pub use structs::{AgentState, Control, DynamicsModel, StaticObstacle, Vector2D};
