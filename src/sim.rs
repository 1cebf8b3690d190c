//! # Simulation Driver
//!
//! Advances N agents in lock step: all controller queries of a timestep see
//! the same snapshot of the world, and no agent observes another agent's
//! same-step update (snapshot-then-update discipline, which keeps results
//! independent of agent ordering).
//!
//! Controllers are bound through the single [`Controller`] contract;
//! [`BlankController`] holds an agent stationary as a pure obstacle. The
//! [`RecordSink`] collaborator receives the stacked input vector and the
//! resulting control each step for dataset capture; [`BlankSink`] discards
//! them.

use crate::config::SimConfig;
use crate::liveness::{self, LivenessReport};
use crate::structs::{AgentState, Control, StaticObstacle, Vector2D};
use log::{debug, info};

/// The contract every controller variant implements. Behavior differs only
/// in how the control is computed, not in the surrounding protocol.
pub trait Controller {
    fn reset(&mut self, initial_state: &AgentState, opponents: &[AgentState]);

    /// Computes this step's control from the agent's own state and the
    /// opponents' snapshot states.
    fn step(&mut self, timestamp: f64, state: &AgentState, opponents: &[AgentState]) -> Control;

    /// Whether the last `step` had to fall back because the underlying solve
    /// failed. Diagnostic only.
    fn solve_failed(&self) -> bool {
        false
    }
}

/// Holds an agent stationary; useful as a pure moving-obstacle placeholder.
pub struct BlankController;

impl Controller for BlankController {
    fn reset(&mut self, _initial_state: &AgentState, _opponents: &[AgentState]) {}

    fn step(&mut self, _timestamp: f64, _state: &AgentState, _opponents: &[AgentState]) -> Control {
        Control::zero()
    }
}

/// Dataset-capture collaborator: receives the stacked input features and the
/// control an agent produced this step.
pub trait RecordSink {
    fn record(&mut self, timestamp: f64, agent_idx: usize, features: &[f64], control: &Control);
}

/// No-op sink.
pub struct BlankSink;

impl RecordSink for BlankSink {
    fn record(&mut self, _timestamp: f64, _agent_idx: usize, _features: &[f64], _control: &Control) {
    }
}

/// Full run history, exposed for inspection, plotting and metrics.
#[derive(Debug, Clone, Default)]
pub struct SimHistory {
    /// Per agent: state time series (index 0 is the initial state).
    pub states: Vec<Vec<AgentState>>,
    /// Per agent: control applied at each step.
    pub controls: Vec<Vec<Control>>,
    /// Liveness report of the pair (0, 1) per step, when at least two agents
    /// run.
    pub liveness: Vec<LivenessReport>,
    /// Per agent: whether the controller fell back on a failed solve at each
    /// step.
    pub solve_failures: Vec<Vec<bool>>,
    /// Timestep indices where any physical collision was recorded (agents in
    /// contact, or an agent touching a static circle).
    pub collisions: Vec<usize>,
    /// Smallest inter-agent center distance seen across the run.
    pub min_agent_separation: f64,
    /// Whether every agent ended within the goal tolerance.
    pub completed: bool,
    pub steps: usize,
}

impl SimHistory {
    fn new(agent_count: usize) -> Self {
        SimHistory {
            states: vec![Vec::new(); agent_count],
            controls: vec![Vec::new(); agent_count],
            liveness: Vec::new(),
            solve_failures: vec![Vec::new(); agent_count],
            collisions: Vec::new(),
            min_agent_separation: f64::INFINITY,
            completed: false,
            steps: 0,
        }
    }
}

fn all_arrived(states: &[AgentState], goals: &[[f64; 3]], tolerance: f64) -> bool {
    states.iter().zip(goals).all(|(state, goal)| {
        state.position().distance(&Vector2D::new(goal[0], goal[1])) <= tolerance
    })
}

/// Physical contact check: actual overlap, not the (larger) safety margin the
/// barrier constraints defend.
fn any_collision(
    states: &[AgentState],
    static_obstacles: &[StaticObstacle],
    config: &SimConfig,
) -> bool {
    for i in 0..states.len() {
        for j in i + 1..states.len() {
            if states[i].distance_to(&states[j]) < 2.0 * config.agent_radius {
                return true;
            }
        }
        for obs in static_obstacles {
            if states[i].position().distance(&obs.center()) < config.agent_radius + obs.radius {
                return true;
            }
        }
    }
    false
}

/// Runs the lock-step simulation until every agent is within the goal
/// tolerance or the iteration budget is exhausted.
pub fn run_simulation(
    initial_states: &[AgentState],
    goals: &[[f64; 3]],
    static_obstacles: &[StaticObstacle],
    controllers: &mut [Box<dyn Controller>],
    config: &SimConfig,
    max_steps: usize,
    sink: &mut dyn RecordSink,
) -> SimHistory {
    assert_eq!(
        initial_states.len(),
        controllers.len(),
        "one controller per agent"
    );
    assert_eq!(initial_states.len(), goals.len(), "one goal per agent");

    let agent_count = initial_states.len();
    let mut history = SimHistory::new(agent_count);
    let mut states: Vec<AgentState> = initial_states.to_vec();

    for (idx, controller) in controllers.iter_mut().enumerate() {
        let opponents: Vec<AgentState> = snapshot_without(&states, idx);
        controller.reset(&states[idx], &opponents);
        history.states[idx].push(states[idx]);
    }

    loop {
        if all_arrived(&states, goals, config.goal_tolerance) {
            history.completed = true;
            info!("all agents arrived after {} steps", history.steps);
            break;
        }
        if history.steps >= max_steps {
            debug!("iteration budget of {} steps exhausted", max_steps);
            break;
        }

        let timestamp = history.steps as f64 * config.dt;
        // Snapshot before any update: every agent decides against the same
        // world.
        let snapshot = states.clone();

        if agent_count >= 2 {
            history
                .liveness
                .push(liveness::evaluate(&snapshot[0], &snapshot[1], config));
        }

        for (idx, controller) in controllers.iter_mut().enumerate() {
            let opponents = snapshot_without(&snapshot, idx);

            let mut features: Vec<f64> = Vec::with_capacity(4 * agent_count);
            for state in std::iter::once(&snapshot[idx]).chain(opponents.iter()) {
                features.extend_from_slice(&[state.x, state.y, state.theta, state.v]);
            }

            let control = controller.step(timestamp, &snapshot[idx], &opponents);
            sink.record(timestamp, idx, &features, &control);

            states[idx] = snapshot[idx].apply(control, config.dynamics, config.dt);
            history.controls[idx].push(control);
            history.solve_failures[idx].push(controller.solve_failed());
            history.states[idx].push(states[idx]);
        }

        for i in 0..agent_count {
            for j in i + 1..agent_count {
                history.min_agent_separation =
                    history.min_agent_separation.min(states[i].distance_to(&states[j]));
            }
        }
        if any_collision(&states, static_obstacles, config) {
            history.collisions.push(history.steps);
        }

        history.steps += 1;
    }

    history
}

fn snapshot_without(states: &[AgentState], idx: usize) -> Vec<AgentState> {
    states
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != idx)
        .map(|(_, state)| *state)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GammaConfig;
    use crate::mpc::MpcController;
    use std::cell::RefCell;
    use std::f64::consts::PI;
    use std::rc::Rc;

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Scripted controller driving a constant control; logs the opponent
    /// states it observed into a shared buffer for the snapshot-discipline
    /// test.
    struct ScriptedController {
        control: Control,
        seen: Rc<RefCell<Vec<Vec<AgentState>>>>,
    }

    impl ScriptedController {
        fn new(control: Control) -> Self {
            ScriptedController {
                control,
                seen: Rc::new(RefCell::new(Vec::new())),
            }
        }

        fn with_log(control: Control, seen: Rc<RefCell<Vec<Vec<AgentState>>>>) -> Self {
            ScriptedController { control, seen }
        }
    }

    impl Controller for ScriptedController {
        fn reset(&mut self, _initial_state: &AgentState, _opponents: &[AgentState]) {}

        fn step(
            &mut self,
            _timestamp: f64,
            _state: &AgentState,
            opponents: &[AgentState],
        ) -> Control {
            self.seen.borrow_mut().push(opponents.to_vec());
            self.control
        }
    }

    struct CountingSink {
        records: Vec<(f64, usize, usize)>,
    }

    impl RecordSink for CountingSink {
        fn record(
            &mut self,
            timestamp: f64,
            agent_idx: usize,
            features: &[f64],
            _control: &Control,
        ) {
            self.records.push((timestamp, agent_idx, features.len()));
        }
    }

    #[test]
    fn test_blank_controller_holds_agent() {
        init_logs();
        let cfg = SimConfig::default();
        let initial = [
            AgentState::new(0.0, 0.0, 0.0, 0.0),
            AgentState::new(5.0, 5.0, 0.0, 0.0),
        ];
        let goals = [[9.0, 9.0, 0.0], [9.0, 9.0, 0.0]];
        let mut controllers: Vec<Box<dyn Controller>> =
            vec![Box::new(BlankController), Box::new(BlankController)];
        let history = run_simulation(
            &initial,
            &goals,
            &[],
            &mut controllers,
            &cfg,
            10,
            &mut BlankSink,
        );

        assert_eq!(history.steps, 10);
        assert!(!history.completed);
        for state in &history.states[0] {
            assert_eq!(state.position(), Vector2D::zero());
        }
    }

    #[test]
    fn test_snapshot_discipline() {
        // Agent 1 must see agent 0's pre-update state in every step, even
        // though agent 0 moves first within the timestep.
        init_logs();
        let cfg = SimConfig {
            dynamics: crate::structs::DynamicsModel::SingleIntegrator,
            ..SimConfig::default()
        };
        let initial = [
            AgentState::new(0.0, 0.0, 0.0, 0.0),
            AgentState::new(10.0, 0.0, 0.0, 0.0),
        ];
        let goals = [[50.0, 0.0, 0.0], [50.0, 0.0, 0.0]];
        let seen_by_1: Rc<RefCell<Vec<Vec<AgentState>>>> = Rc::new(RefCell::new(Vec::new()));
        let mut controllers: Vec<Box<dyn Controller>> = vec![
            Box::new(ScriptedController::new(Control::new(1.0, 0.0))),
            Box::new(ScriptedController::with_log(
                Control::zero(),
                Rc::clone(&seen_by_1),
            )),
        ];
        let history = run_simulation(
            &initial,
            &goals,
            &[],
            &mut controllers,
            &cfg,
            3,
            &mut BlankSink,
        );
        assert_eq!(history.steps, 3);
        assert_eq!(history.states[0][1].x, 0.1);

        // Agent 0 moves first within each timestep, yet agent 1 always saw
        // the pre-update snapshot: x = 0.0, 0.1, 0.2, never the same-step
        // future state.
        let seen = seen_by_1.borrow();
        assert_eq!(seen.len(), 3);
        for (step, opponents) in seen.iter().enumerate() {
            assert_eq!(opponents.len(), 1);
            let expected = step as f64 * 0.1;
            assert!(
                (opponents[0].x - expected).abs() < 1e-12,
                "step {}: saw x = {}, expected snapshot x = {}",
                step,
                opponents[0].x,
                expected
            );
        }
    }

    #[test]
    fn test_terminates_at_goal_tolerance() {
        init_logs();
        let cfg = SimConfig::default();
        let initial = [AgentState::new(1.0, 1.0, 0.0, 0.0)];
        let goals = [[1.0, 1.05, 0.0]];
        let mut controllers: Vec<Box<dyn Controller>> = vec![Box::new(BlankController)];
        let history = run_simulation(
            &initial,
            &goals,
            &[],
            &mut controllers,
            &cfg,
            50,
            &mut BlankSink,
        );
        assert!(history.completed);
        assert_eq!(history.steps, 0, "already within tolerance");
    }

    #[test]
    fn test_collision_bookkeeping() {
        init_logs();
        let cfg = SimConfig::default();
        // Two stationary agents in contact.
        let initial = [
            AgentState::new(0.0, 0.0, 0.0, 0.0),
            AgentState::new(0.3, 0.0, 0.0, 0.0),
        ];
        let goals = [[5.0, 0.0, 0.0], [6.0, 0.0, 0.0]];
        let mut controllers: Vec<Box<dyn Controller>> =
            vec![Box::new(BlankController), Box::new(BlankController)];
        let history = run_simulation(
            &initial,
            &goals,
            &[],
            &mut controllers,
            &cfg,
            4,
            &mut BlankSink,
        );
        assert_eq!(history.collisions, vec![0, 1, 2, 3]);
        assert!(history.min_agent_separation < 2.0 * cfg.agent_radius);
    }

    #[test]
    fn test_sink_receives_stacked_features() {
        init_logs();
        let cfg = SimConfig::default();
        let initial = [
            AgentState::new(0.0, 0.0, 0.0, 0.0),
            AgentState::new(2.0, 0.0, 0.0, 0.0),
        ];
        let goals = [[5.0, 0.0, 0.0], [6.0, 0.0, 0.0]];
        let mut controllers: Vec<Box<dyn Controller>> =
            vec![Box::new(BlankController), Box::new(BlankController)];
        let mut sink = CountingSink {
            records: Vec::new(),
        };
        run_simulation(&initial, &goals, &[], &mut controllers, &cfg, 2, &mut sink);

        assert_eq!(sink.records.len(), 4);
        // Own state stacked with one opponent: 8 features.
        assert!(sink.records.iter().all(|(_, _, len)| *len == 8));
        assert_eq!(sink.records[0].1, 0);
        assert_eq!(sink.records[1].1, 1);
    }

    #[test]
    fn test_liveness_series_recorded() {
        init_logs();
        let cfg = SimConfig::default();
        let initial = [
            AgentState::new(0.0, 0.0, 0.0, 0.5),
            AgentState::new(3.0, 0.0, PI, 0.5),
        ];
        let goals = [[9.0, 0.0, 0.0], [-9.0, 0.0, 0.0]];
        let mut controllers: Vec<Box<dyn Controller>> =
            vec![Box::new(BlankController), Box::new(BlankController)];
        let history = run_simulation(
            &initial,
            &goals,
            &[],
            &mut controllers,
            &cfg,
            5,
            &mut BlankSink,
        );
        assert_eq!(history.liveness.len(), 5);
        assert!(history.liveness[0].score < cfg.liveness_threshold);
    }

    // ==================== End-to-end scenarios ====================

    fn head_on_setup(live_gamma: f64) -> (SimConfig, [AgentState; 2], [[f64; 3]; 2]) {
        let cfg = SimConfig {
            gammas: GammaConfig {
                live_gamma,
                ..GammaConfig::default()
            },
            ..SimConfig::default()
        };
        let initial = [
            AgentState::new(-1.5, 0.0, 0.0, 0.5),
            AgentState::new(1.5, 0.0, PI, 0.5),
        ];
        let goals = [[1.5, 0.0, 0.0], [-1.5, 0.0, PI]];
        (cfg, initial, goals)
    }

    #[test]
    fn test_symmetric_head_on_stalls_without_liveness() {
        // The motivating failure mode: a perfectly mirrored pair with the
        // liveness weighting disabled brakes into a standoff instead of
        // resolving.
        init_logs();
        let (cfg, initial, goals) = head_on_setup(0.0);
        let mut controllers: Vec<Box<dyn Controller>> = vec![
            Box::new(MpcController::new(0, goals[0], vec![], cfg, true)),
            Box::new(MpcController::new(1, goals[1], vec![], cfg, false)),
        ];
        let history = run_simulation(
            &initial,
            &goals,
            &[],
            &mut controllers,
            &cfg,
            120,
            &mut BlankSink,
        );

        assert!(!history.completed, "mirrored pair must not both get through");
        assert!(history.collisions.is_empty(), "stall must still be safe");
        for (idx, goal) in goals.iter().enumerate() {
            let last = history.states[idx].last().unwrap();
            let gap = last.position().distance(&Vector2D::new(goal[0], goal[1]));
            assert!(
                gap > 1.0,
                "agent {} should be stuck far from its goal, gap = {:.2}",
                idx,
                gap
            );
        }
    }

    #[test]
    fn test_liveness_resolves_symmetric_head_on() {
        // Same scenario with the liveness weighting enabled: the pair must
        // order itself and both agents reach their goals without contact.
        init_logs();
        let (cfg, initial, goals) = head_on_setup(0.3);
        let mut controllers: Vec<Box<dyn Controller>> = vec![
            Box::new(MpcController::new(0, goals[0], vec![], cfg, true)),
            Box::new(MpcController::new(1, goals[1], vec![], cfg, false)),
        ];
        let history = run_simulation(
            &initial,
            &goals,
            &[],
            &mut controllers,
            &cfg,
            400,
            &mut BlankSink,
        );

        assert!(
            history.completed,
            "liveness must resolve the standoff within the budget, steps = {}",
            history.steps
        );
        assert!(history.collisions.is_empty());
        assert!(history.min_agent_separation >= 2.0 * cfg.agent_radius);
    }

    #[test]
    fn test_doorway_crossing_end_to_end() {
        // Two agents funnel through a doorway gap toward crossed goals under
        // the default gamma configuration: both must arrive, with zero
        // recorded collisions.
        init_logs();
        let cfg = SimConfig::default();
        let walls = vec![
            StaticObstacle::new(1.0, 0.8, 0.3),
            StaticObstacle::new(1.0, -0.8, 0.3),
        ];
        let initial = [
            AgentState::new(-1.0, 0.4, 0.0, 0.3),
            AgentState::new(-1.0, -0.4, 0.0, 0.3),
        ];
        // Crossed goals: both desired paths meet ahead of the gap, and the
        // gap itself is too narrow for side-by-side passage, so the pair must
        // order itself through the doorway.
        let goals = [[2.0, -0.5, 0.0], [2.0, 0.5, 0.0]];
        let mut controllers: Vec<Box<dyn Controller>> = vec![
            Box::new(MpcController::new(0, goals[0], walls.clone(), cfg, true)),
            Box::new(MpcController::new(1, goals[1], walls.clone(), cfg, false)),
        ];
        let history = run_simulation(
            &initial,
            &goals,
            &walls,
            &mut controllers,
            &cfg,
            500,
            &mut BlankSink,
        );

        assert!(
            history.completed,
            "both agents must clear the doorway, steps = {}",
            history.steps
        );
        assert!(
            history.collisions.is_empty(),
            "collisions recorded at steps {:?}",
            history.collisions
        );
    }
}
