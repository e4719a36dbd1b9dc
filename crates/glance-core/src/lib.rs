//! glance-core — Active liveness challenge engine.
//!
//! Consumes per-frame facial landmarks from an external provider and decides
//! whether a live person is in front of the camera: the subject aligns,
//! then holds a sequence of head poses while a scorer watches for the flat
//! motion of a photo or screen being panned.

pub mod challenge;
pub mod config;
pub mod landmarks;
pub mod liveness;
pub mod pose;
pub mod session;

pub use challenge::{ChallengePlan, Phase, PlanError, Pose};
pub use config::{ConfigError, LivenessConfig, MultiFacePolicy};
pub use landmarks::{FaceObservation, FramePayload, LandmarkFrame, LandmarkScheme, Point};
pub use liveness::{SuspicionScorer, YawHistory};
pub use pose::{PoseError, PoseSignal};
pub use session::{
    Deadline, Directive, Outcome, ResumeError, SavedSession, Session, SessionEvent, SessionState,
    Snapshot,
};
