//! Python bindings.
//!
//! The outer experiment scripts (scenario layout, plotting, replay) are
//! Python; this module exposes the engine's entry points over plain lists so
//! those scripts can drive it without any Rust-side glue. Compiled only with
//! the `python-bindings` feature.

use crate::config::SimConfig;
use crate::liveness;
use crate::model::ModelController;
use crate::mpc::MpcController;
use crate::sim::{run_simulation, BlankSink, Controller};
use crate::structs::{AgentState, StaticObstacle};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use std::path::Path;

fn parse_config(config_json: Option<&str>) -> PyResult<SimConfig> {
    match config_json {
        Some(text) => serde_json::from_str(text)
            .map_err(|err| PyValueError::new_err(format!("bad config record: {}", err))),
        None => Ok(SimConfig::default()),
    }
}

fn parse_state(raw: &[f64]) -> PyResult<AgentState> {
    match raw {
        [x, y, theta] => Ok(AgentState::new(*x, *y, *theta, 0.0)),
        [x, y, theta, v] => Ok(AgentState::new(*x, *y, *theta, *v)),
        _ => Err(PyValueError::new_err(
            "agent state must be [x, y, theta] or [x, y, theta, v]",
        )),
    }
}

fn parse_goal(raw: &[f64]) -> PyResult<[f64; 3]> {
    if raw.len() < 2 {
        return Err(PyValueError::new_err("goal must be [x, y(, theta)]"));
    }
    Ok([raw[0], raw[1], raw.get(2).copied().unwrap_or(0.0)])
}

/// Liveness metrics of a state pair: `(score, ttc, intersects)`.
#[pyfunction]
#[pyo3(signature = (state_a, state_b, config_json=None))]
fn evaluate_liveness_py(
    state_a: Vec<f64>,
    state_b: Vec<f64>,
    config_json: Option<String>,
) -> PyResult<(f64, f64, bool)> {
    let config = parse_config(config_json.as_deref())?;
    let a = parse_state(&state_a)?;
    let b = parse_state(&state_b)?;
    let report = liveness::evaluate(&a, &b, &config);
    Ok((report.score, report.ttc, report.intersects))
}

/// Runs the lock-step simulation with one MPC-CBF controller per agent.
///
/// Returns `(state_trajectories, control_trajectories, completed,
/// collision_steps)`.
#[pyfunction]
#[pyo3(signature = (initial_states, goals, obstacles, max_steps, config_json=None))]
fn run_mpc_simulation_py(
    initial_states: Vec<Vec<f64>>,
    goals: Vec<Vec<f64>>,
    obstacles: Vec<(f64, f64, f64)>,
    max_steps: usize,
    config_json: Option<String>,
) -> PyResult<(Vec<Vec<Vec<f64>>>, Vec<Vec<Vec<f64>>>, bool, Vec<usize>)> {
    let config = parse_config(config_json.as_deref())?;
    let states: Vec<AgentState> = initial_states
        .iter()
        .map(|raw| parse_state(raw))
        .collect::<PyResult<_>>()?;
    let goals: Vec<[f64; 3]> = goals
        .iter()
        .map(|raw| parse_goal(raw))
        .collect::<PyResult<_>>()?;
    let statics: Vec<StaticObstacle> = obstacles
        .iter()
        .map(|(x, y, r)| StaticObstacle::new(*x, *y, *r))
        .collect();

    let mut controllers: Vec<Box<dyn Controller>> = goals
        .iter()
        .enumerate()
        .map(|(idx, goal)| {
            // The lowest-index agent keeps priority under the liveness
            // speed-ordering rule.
            Box::new(MpcController::new(
                idx,
                *goal,
                statics.clone(),
                config,
                idx == 0,
            )) as Box<dyn Controller>
        })
        .collect();

    let history = run_simulation(
        &states,
        &goals,
        &statics,
        &mut controllers,
        &config,
        max_steps,
        &mut BlankSink,
    );

    let state_series = history
        .states
        .iter()
        .map(|series| {
            series
                .iter()
                .map(|s| vec![s.x, s.y, s.theta, s.v])
                .collect()
        })
        .collect();
    let control_series = history
        .controls
        .iter()
        .map(|series| series.iter().map(|u| vec![u.u1, u.u2]).collect())
        .collect();
    Ok((
        state_series,
        control_series,
        history.completed,
        history.collisions,
    ))
}

/// Single inference call against a stored model definition.
#[pyfunction]
#[pyo3(signature = (definition_path, state, opponents, goal, obstacles, config_json=None))]
fn model_infer_py(
    definition_path: String,
    state: Vec<f64>,
    opponents: Vec<Vec<f64>>,
    goal: Vec<f64>,
    obstacles: Vec<(f64, f64, f64)>,
    config_json: Option<String>,
) -> PyResult<(f64, f64)> {
    let config = parse_config(config_json.as_deref())?;
    let statics: Vec<StaticObstacle> = obstacles
        .iter()
        .map(|(x, y, r)| StaticObstacle::new(*x, *y, *r))
        .collect();
    let mut controller = ModelController::load(
        Path::new(&definition_path),
        parse_goal(&goal)?,
        statics,
        config,
        true,
    )
    .map_err(|err| PyValueError::new_err(err.to_string()))?;

    let own = parse_state(&state)?;
    let opponents: Vec<AgentState> = opponents
        .iter()
        .map(|raw| parse_state(raw))
        .collect::<PyResult<_>>()?;
    let control = controller.step(0.0, &own, &opponents);
    Ok((control.u1, control.u2))
}

#[pymodule]
fn livenet_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(evaluate_liveness_py, m)?)?;
    m.add_function(wrap_pyfunction!(run_mpc_simulation_py, m)?)?;
    m.add_function(wrap_pyfunction!(model_infer_py, m)?)?;
    Ok(())
}
