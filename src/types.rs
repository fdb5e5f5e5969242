use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Mul, Sub};
use std::str::FromStr;

/// Labels for the patch pipette state graph.
///
/// Each label names one stage of the automated patch procedure. Transition
/// edges are the labels returned by a stage's control loop; the sequencing
/// manager instantiates the next stage from the label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchStateId {
    Out,
    Approach,
    Attached,
    WholeCell,
    Broken,
    Fouled,
    Bath,
    CellDetect,
    Seal,
    BreakIn,
    Clean,
}

impl PatchStateId {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchStateId::Out => "out",
            PatchStateId::Approach => "approach",
            PatchStateId::Attached => "attached",
            PatchStateId::WholeCell => "whole cell",
            PatchStateId::Broken => "broken",
            PatchStateId::Fouled => "fouled",
            PatchStateId::Bath => "bath",
            PatchStateId::CellDetect => "cell detect",
            PatchStateId::Seal => "seal",
            PatchStateId::BreakIn => "break in",
            PatchStateId::Clean => "clean",
        }
    }
}

impl fmt::Display for PatchStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatchStateId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "out" => Ok(PatchStateId::Out),
            "approach" => Ok(PatchStateId::Approach),
            "attached" => Ok(PatchStateId::Attached),
            "whole cell" | "whole_cell" => Ok(PatchStateId::WholeCell),
            "broken" => Ok(PatchStateId::Broken),
            "fouled" => Ok(PatchStateId::Fouled),
            "bath" => Ok(PatchStateId::Bath),
            "cell detect" | "cell_detect" => Ok(PatchStateId::CellDetect),
            "seal" => Ok(PatchStateId::Seal),
            "break in" | "break_in" => Ok(PatchStateId::BreakIn),
            "clean" => Ok(PatchStateId::Clean),
            other => Err(format!("unknown patch state: {other:?}")),
        }
    }
}

/// Pressure routing at the pipette back end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureSource {
    /// Vented to ambient.
    Atmosphere,
    /// Manually controlled by the operator.
    User,
    /// Closed-loop regulator tracking a numeric set-point.
    Regulator,
}

impl fmt::Display for PressureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PressureSource::Atmosphere => f.write_str("atmosphere"),
            PressureSource::User => f.write_str("user"),
            PressureSource::Regulator => f.write_str("regulator"),
        }
    }
}

/// Amplifier clamp mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClampMode {
    /// Voltage clamp.
    Vc,
    /// Current clamp.
    Ic,
    /// Current clamp with zero holding current.
    I0,
}

/// Speed selector for motorized moves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MoveSpeed {
    /// Device-defined fast traversal speed.
    Fast,
    MetersPerSecond(f64),
}

/// One test-pulse measurement delivered by the sensor producer.
///
/// Immutable record: a timestamp (epoch seconds) and the steady-state
/// resistance derived from the pulse response plateau.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestPulse {
    pub start_time: f64,
    pub steady_state_resistance: f64,
}

impl TestPulse {
    pub fn new(start_time: f64, steady_state_resistance: f64) -> Self {
        Self {
            start_time,
            steady_state_resistance,
        }
    }
}

/// Global position of the pipette tip in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn distance_to(&self, other: &Position3) -> f64 {
        (*self - *other).norm()
    }

    pub fn with_z_offset(&self, dz: f64) -> Position3 {
        Position3 {
            z: self.z + dz,
            ..*self
        }
    }
}

impl Add for Position3 {
    type Output = Position3;

    fn add(self, rhs: Position3) -> Position3 {
        Position3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Position3 {
    type Output = Position3;

    fn sub(self, rhs: Position3) -> Position3 {
        Position3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for Position3 {
    type Output = Position3;

    fn mul(self, rhs: f64) -> Position3 {
        Position3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Final outcome of a state task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    /// True when the task did not run to a normal return: stop request,
    /// failure, or expected negative outcome.
    pub interrupted: bool,
    /// Failure message, absent for clean completions and stop requests.
    pub error: Option<String>,
}

impl Completion {
    pub fn success() -> Self {
        Self {
            interrupted: false,
            error: None,
        }
    }

    pub fn stopped() -> Self {
        Self {
            interrupted: true,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            interrupted: true,
            error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        !self.interrupted && self.error.is_none()
    }
}

/// Updates published to the observer channel while a task runs.
#[derive(Debug, Clone)]
pub enum StateEvent {
    /// Human-readable progress text.
    Status {
        state: PatchStateId,
        message: String,
    },
    /// The single completion event of a task.
    Finished {
        state: PatchStateId,
        completion: Completion,
        next_state: Option<PatchStateId>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_id_round_trip() {
        let ids = [
            PatchStateId::Out,
            PatchStateId::WholeCell,
            PatchStateId::CellDetect,
            PatchStateId::BreakIn,
            PatchStateId::Clean,
        ];
        for id in ids {
            let parsed: PatchStateId = id.as_str().parse().unwrap();
            assert_eq!(parsed, id);
        }
    }

    #[test]
    fn test_state_id_accepts_snake_case() {
        assert_eq!(
            "cell_detect".parse::<PatchStateId>().unwrap(),
            PatchStateId::CellDetect
        );
        assert_eq!(
            "whole_cell".parse::<PatchStateId>().unwrap(),
            PatchStateId::WholeCell
        );
    }

    #[test]
    fn test_state_id_rejects_unknown() {
        assert!("sealing".parse::<PatchStateId>().is_err());
    }

    #[test]
    fn test_position_distance() {
        let a = Position3::new(0.0, 0.0, 0.0);
        let b = Position3::new(3e-6, 0.0, 4e-6);
        assert!((a.distance_to(&b) - 5e-6).abs() < 1e-12);
    }

    #[test]
    fn test_completion_predicates() {
        assert!(Completion::success().is_success());
        assert!(!Completion::stopped().is_success());
        let failed = Completion::failed("boom");
        assert!(failed.interrupted);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }
}
