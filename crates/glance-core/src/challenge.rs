//! Head-pose challenge state machine.
//!
//! Phase order: NO_FACE → ALIGN_CENTER → STABILIZING → plan steps → DONE.
//! The machine is pure: it reads the current phase, the hold tracker and
//! one frame's horizontal offset, and reports what should happen. Timers,
//! scoring and resets belong to the session.
//!
//! Sign convention: landmarks arrive in unmirrored sensor coordinates, so a
//! subject turning to their own left moves the nose toward larger `x` and
//! produces a positive offset.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LivenessConfig;

pub const NO_FACE_TEXT: &str = "No face detected";
pub const ALIGN_TEXT: &str = "Align your face to the center";
pub const STABILIZING_TEXT: &str = "Face aligned. Hold still...";
pub const DONE_TEXT: &str = "Liveness verified";
pub const BLOCKED_TEXT: &str = "Image detected. Camera closed.";
pub const MULTIPLE_FACES_TEXT: &str = "Multiple faces detected";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("challenge plan has no steps")]
    Empty,
    #[error("unknown challenge plan: {0}")]
    Unknown(String),
}

/// A head pose the subject is asked to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pose {
    Left,
    Center,
    Right,
}

impl Pose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Left => "LEFT",
            Self::Center => "CENTER",
            Self::Right => "RIGHT",
        }
    }

    /// Whether `offset` satisfies this pose under the given tolerances.
    pub fn is_held(&self, offset: f32, center_tolerance: f32, turn_tolerance: f32) -> bool {
        match self {
            Self::Left => offset > turn_tolerance,
            Self::Center => offset.abs() < center_tolerance,
            Self::Right => offset < -turn_tolerance,
        }
    }
}

/// Ordered challenge steps performed after alignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Pose>", into = "Vec<Pose>")]
pub struct ChallengePlan {
    steps: Vec<Pose>,
}

impl ChallengePlan {
    pub fn new(steps: Vec<Pose>) -> Result<Self, PlanError> {
        if steps.is_empty() {
            return Err(PlanError::Empty);
        }
        Ok(Self { steps })
    }

    /// Turn left, come back to center, turn right. Gates attendance marking.
    pub fn attendance() -> Self {
        Self {
            steps: vec![Pose::Left, Pose::Center, Pose::Right],
        }
    }

    /// Hold still facing the camera. Gates a quick identity lookup.
    pub fn presence() -> Self {
        Self {
            steps: vec![Pose::Center],
        }
    }

    /// Resolve a plan by name; empty selects the default.
    pub fn from_name(name: &str) -> Result<Self, PlanError> {
        match name {
            "" | "attendance" => Ok(Self::attendance()),
            "presence" => Ok(Self::presence()),
            other => Err(PlanError::Unknown(other.to_string())),
        }
    }

    pub fn steps(&self) -> &[Pose] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<Pose> {
        self.steps.get(index).copied()
    }

    pub fn first(&self) -> Pose {
        self.steps[0]
    }
}

impl Default for ChallengePlan {
    fn default() -> Self {
        Self::attendance()
    }
}

impl TryFrom<Vec<Pose>> for ChallengePlan {
    type Error = PlanError;

    fn try_from(steps: Vec<Pose>) -> Result<Self, Self::Error> {
        Self::new(steps)
    }
}

impl From<ChallengePlan> for Vec<Pose> {
    fn from(plan: ChallengePlan) -> Self {
        plan.steps
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    #[default]
    NoFace,
    AlignCenter,
    Stabilizing,
    Challenge {
        step: usize,
        pose: Pose,
    },
    Done,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NoFace => "NO_FACE",
            Self::AlignCenter => "ALIGN_CENTER",
            Self::Stabilizing => "STABILIZING",
            Self::Challenge { pose, .. } => pose.as_str(),
            Self::Done => "DONE",
        }
    }

    /// User-facing instruction on entering this phase.
    pub fn instruction(&self) -> &'static str {
        match self {
            Self::NoFace => NO_FACE_TEXT,
            Self::AlignCenter => ALIGN_TEXT,
            Self::Stabilizing => STABILIZING_TEXT,
            Self::Challenge { step: 0, pose: Pose::Center } => "Look straight at the camera and hold",
            Self::Challenge { pose: Pose::Center, .. } => "Return to CENTER and hold",
            Self::Challenge { pose: Pose::Left, .. } => "Turn LEFT and hold",
            Self::Challenge { pose: Pose::Right, .. } => "Turn RIGHT and hold",
            Self::Done => DONE_TEXT,
        }
    }

    /// Phases in which the flat-image scorer runs.
    pub fn is_challenge(&self) -> bool {
        matches!(self, Self::Challenge { .. })
    }

    /// Face loss resets every phase except these.
    pub fn ignores_face_loss(&self) -> bool {
        matches!(self, Self::Stabilizing | Self::Done)
    }
}

/// Tracks how long the current step's condition has held without a break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HoldTracker {
    started_at_ms: Option<u64>,
}

impl HoldTracker {
    /// Record one frame. Returns true once the condition has held for
    /// `hold_ms` since the first qualifying frame of the current streak.
    /// A non-qualifying frame ends the streak.
    pub fn observe(&mut self, held: bool, now_ms: u64, hold_ms: u64) -> bool {
        if !held {
            self.started_at_ms = None;
            return false;
        }
        let start = *self.started_at_ms.get_or_insert(now_ms);
        now_ms.saturating_sub(start) >= hold_ms
    }

    pub fn clear(&mut self) {
        self.started_at_ms = None;
    }

    pub fn started_at_ms(&self) -> Option<u64> {
        self.started_at_ms
    }
}

/// What the machine decided for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Stay,
    /// Enter a new phase with no side effects beyond the instruction.
    Enter(Phase),
    /// Alignment reached: enter STABILIZING and arm the deadline.
    Aligned,
    /// Final step held: enter DONE.
    Completed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeMachine {
    plan: ChallengePlan,
    center_tolerance: f32,
    turn_tolerance: f32,
    hold_ms: u64,
}

impl ChallengeMachine {
    pub fn new(plan: ChallengePlan, config: &LivenessConfig) -> Self {
        Self {
            plan,
            center_tolerance: config.center_tolerance,
            turn_tolerance: config.turn_tolerance,
            hold_ms: config.hold_ms,
        }
    }

    pub fn plan(&self) -> &ChallengePlan {
        &self.plan
    }

    /// Phase entered when the stabilization deadline fires.
    pub fn first_step(&self) -> Phase {
        Phase::Challenge {
            step: 0,
            pose: self.plan.first(),
        }
    }

    /// Evaluate one single-face frame.
    pub fn on_face(
        &self,
        phase: Phase,
        hold: &mut HoldTracker,
        offset: f32,
        now_ms: u64,
    ) -> Transition {
        match phase {
            Phase::NoFace => Transition::Enter(Phase::AlignCenter),
            Phase::AlignCenter => {
                if offset.abs() < self.center_tolerance {
                    Transition::Aligned
                } else {
                    Transition::Stay
                }
            }
            Phase::Stabilizing | Phase::Done => Transition::Stay,
            Phase::Challenge { step, pose } => {
                let held = pose.is_held(offset, self.center_tolerance, self.turn_tolerance);
                if !hold.observe(held, now_ms, self.hold_ms) {
                    return Transition::Stay;
                }
                hold.clear();
                match self.plan.step(step + 1) {
                    Some(next) => Transition::Enter(Phase::Challenge {
                        step: step + 1,
                        pose: next,
                    }),
                    None => Transition::Completed,
                }
            }
        }
    }
}
