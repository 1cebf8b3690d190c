//! # Core Data Structures
//!
//! This module defines the fundamental data types used throughout the library:
//!
//! - **Vector2D**: 2D position/velocity vector with arithmetic operations
//! - **AgentState**: unicycle state of an agent (x, y, heading, speed)
//! - **Control**: actuation vector, interpreted per dynamics model
//! - **DynamicsModel**: differential-drive vs. single-integrator motion
//! - **StaticObstacle**: circular obstacle fixed for the duration of a run

use serde::{Deserialize, Serialize};
use std::ops::{Add, Mul, Neg, Sub};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vector2D {
    pub x: f64,
    pub y: f64,
}

impl Vector2D {
    pub fn new(x: f64, y: f64) -> Self {
        Vector2D { x, y }
    }

    pub fn zero() -> Self {
        Vector2D { x: 0.0, y: 0.0 }
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    pub fn normalize(&self) -> Vector2D {
        let mag = self.magnitude();
        if mag > 0.0 {
            Vector2D {
                x: self.x / mag,
                y: self.y / mag,
            }
        } else {
            Vector2D { x: 0.0, y: 0.0 }
        }
    }

    pub fn dot(&self, other: &Vector2D) -> f64 {
        self.x * other.x + self.y * other.y
    }

    /// Z-component of the 2D cross product.
    pub fn cross(&self, other: &Vector2D) -> f64 {
        self.x * other.y - self.y * other.x
    }

    pub fn perpendicular(&self) -> Vector2D {
        Vector2D {
            x: -self.y,
            y: self.x,
        }
    }

    pub fn distance(&self, other: &Vector2D) -> f64 {
        (*self - *other).magnitude()
    }
}

impl Add for Vector2D {
    type Output = Vector2D;

    fn add(self, other: Vector2D) -> Vector2D {
        Vector2D {
            x: self.x + other.x,
            y: self.y + other.y,
        }
    }
}

impl Sub for Vector2D {
    type Output = Vector2D;

    fn sub(self, other: Vector2D) -> Vector2D {
        Vector2D {
            x: self.x - other.x,
            y: self.y - other.y,
        }
    }
}

impl Mul<f64> for Vector2D {
    type Output = Vector2D;

    fn mul(self, scalar: f64) -> Vector2D {
        Vector2D {
            x: self.x * scalar,
            y: self.y * scalar,
        }
    }
}

impl Neg for Vector2D {
    type Output = Vector2D;

    fn neg(self) -> Vector2D {
        Vector2D {
            x: -self.x,
            y: -self.y,
        }
    }
}

/// Motion model selecting how a [`Control`] is interpreted and integrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DynamicsModel {
    /// State `[x, y, theta, v]`, control `(accel, omega)`.
    DifferentialDrive,
    /// State `[x, y, theta, v]` with theta/v tracking the commanded motion,
    /// control `(vx, vy)`.
    SingleIntegrator,
}

/// Actuation vector. Interpretation depends on the dynamics model:
/// `(u1, u2) = (accel, omega)` for a differential drive, `(vx, vy)` for a
/// single integrator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Control {
    pub u1: f64,
    pub u2: f64,
}

impl Control {
    pub fn new(u1: f64, u2: f64) -> Self {
        Control { u1, u2 }
    }

    pub fn zero() -> Self {
        Control { u1: 0.0, u2: 0.0 }
    }
}

/// Unicycle state of one agent: position, heading and forward speed.
///
/// For the single-integrator model `theta` and `v` track the direction and
/// magnitude of the last commanded velocity so that downstream consumers
/// (liveness, constraint linearization) see one uniform state layout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub v: f64,
}

impl AgentState {
    pub fn new(x: f64, y: f64, theta: f64, v: f64) -> Self {
        AgentState { x, y, theta, v }
    }

    pub fn position(&self) -> Vector2D {
        Vector2D::new(self.x, self.y)
    }

    /// World-frame velocity vector implied by heading and speed.
    pub fn velocity_vector(&self) -> Vector2D {
        Vector2D::new(self.v * self.theta.cos(), self.v * self.theta.sin())
    }

    pub fn heading_vector(&self) -> Vector2D {
        Vector2D::new(self.theta.cos(), self.theta.sin())
    }

    pub fn distance_to(&self, other: &AgentState) -> f64 {
        self.position().distance(&other.position())
    }

    /// Advances the state one step under the given motion model.
    ///
    /// The differential drive integrates semi-implicitly (speed and heading
    /// update first, then position), so a control applied at step k already
    /// moves the position at step k+1. The one-step barrier conditions in
    /// `barrier` are linearized against exactly this update rule.
    pub fn apply(&self, control: Control, model: DynamicsModel, dt: f64) -> AgentState {
        match model {
            DynamicsModel::DifferentialDrive => {
                let v = self.v + control.u1 * dt;
                let theta = self.theta + control.u2 * dt;
                AgentState {
                    x: self.x + v * theta.cos() * dt,
                    y: self.y + v * theta.sin() * dt,
                    theta,
                    v,
                }
            }
            DynamicsModel::SingleIntegrator => {
                let vel = Vector2D::new(control.u1, control.u2);
                let speed = vel.magnitude();
                let theta = if speed > 1e-9 {
                    vel.y.atan2(vel.x)
                } else {
                    self.theta
                };
                AgentState {
                    x: self.x + control.u1 * dt,
                    y: self.y + control.u2 * dt,
                    theta,
                    v: speed,
                }
            }
        }
    }
}

/// Circular static obstacle `(x, y, radius)`, immutable for the run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StaticObstacle {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
}

impl StaticObstacle {
    pub fn new(x: f64, y: f64, radius: f64) -> Self {
        StaticObstacle { x, y, radius }
    }

    pub fn center(&self) -> Vector2D {
        Vector2D::new(self.x, self.y)
    }
}
