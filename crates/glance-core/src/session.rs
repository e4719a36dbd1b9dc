//! One liveness verification attempt.
//!
//! [`Session`] owns every piece of mutable state for an attempt and applies
//! events to it one at a time: frames through [`Session::on_frame`], the
//! stabilization deadline through [`Session::fire_stabilize`] or
//! [`Session::poll_deadline`], and caller restarts through
//! [`Session::reset`]. It never reads a clock or spawns a timer; the driver
//! supplies frame timestamps and executes the returned [`Directive`]s.
//!
//! Each armed deadline carries a fresh epoch. Firing with any epoch other
//! than the one currently pending is a no-op, so a timer that outlives a
//! reset cannot move a session out of NO_FACE.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::challenge::{
    ChallengeMachine, ChallengePlan, HoldTracker, Phase, Transition, BLOCKED_TEXT,
    MULTIPLE_FACES_TEXT,
};
use crate::config::{ConfigError, LivenessConfig, MultiFacePolicy};
use crate::landmarks::{FaceObservation, LandmarkFrame};
use crate::liveness::{SuspicionScorer, YawHistory};
use crate::pose;

/// A pending stabilization deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deadline {
    pub epoch: u64,
    pub due_at_ms: u64,
}

/// Timer work the driver must perform after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Call [`Session::fire_stabilize`] with `epoch` after `delay`.
    ScheduleStabilize { epoch: u64, delay: Duration },
    /// The deadline for `epoch` is void; its timer may be dropped.
    CancelStabilize { epoch: u64 },
}

/// Something a presentation layer or post-DONE continuation may react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Entered(Phase),
    /// Face lost mid-challenge; the session is back at NO_FACE.
    FaceLost,
    /// Final challenge step held. The session is ready to submit.
    Completed,
    /// Flat-image motion detected. Terminal until reset.
    Blocked { score: u32 },
    Reset,
}

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Outcome {
    pub event: Option<SessionEvent>,
    pub directive: Option<Directive>,
}

impl Outcome {
    fn event(event: SessionEvent) -> Self {
        Self {
            event: Some(event),
            directive: None,
        }
    }
}

/// Mutable state of an attempt. Serializable so a paused view can resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    phase: Phase,
    hold: HoldTracker,
    suspicion: u32,
    yaw_history: YawHistory,
    stabilize: Option<Deadline>,
    next_epoch: u64,
    done: bool,
    blocked: bool,
    multiple_faces: bool,
    malformed_streak: u32,
    instruction: String,
}

impl SessionState {
    fn fresh(yaw_window: usize, next_epoch: u64) -> Self {
        Self {
            phase: Phase::NoFace,
            hold: HoldTracker::default(),
            suspicion: 0,
            yaw_history: YawHistory::new(yaw_window),
            stabilize: None,
            next_epoch,
            done: false,
            blocked: false,
            multiple_faces: false,
            malformed_streak: 0,
            instruction: Phase::NoFace.instruction().to_string(),
        }
    }
}

/// Read-only view for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub phase: String,
    pub instruction: String,
    pub done: bool,
    pub blocked: bool,
    pub ready_to_submit: bool,
    pub suspicion_score: u32,
    pub multiple_faces: bool,
}

/// Why a saved session could not be resumed.
#[derive(Error, Debug)]
pub enum ResumeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("inconsistent saved session: {0}")]
    Inconsistent(&'static str),
}

/// Everything needed to resume a session elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedSession {
    pub config: LivenessConfig,
    pub plan: ChallengePlan,
    pub state: SessionState,
}

#[derive(Debug, Clone)]
pub struct Session {
    config: LivenessConfig,
    machine: ChallengeMachine,
    scorer: SuspicionScorer,
    state: SessionState,
}

impl Session {
    pub fn new(config: LivenessConfig, plan: ChallengePlan) -> Result<Self, ConfigError> {
        config.validate()?;
        let state = SessionState::fresh(config.yaw_window, 0);
        Ok(Self::assemble(config, plan, state))
    }

    /// Rebuild a session from [`Session::save`] output. The state must agree
    /// with the saved config and plan.
    pub fn resume(saved: SavedSession) -> Result<Self, ResumeError> {
        saved.config.validate()?;
        check_state(&saved.state, &saved.config, &saved.plan)?;
        Ok(Self::assemble(saved.config, saved.plan, saved.state))
    }

    pub fn save(&self) -> SavedSession {
        SavedSession {
            config: self.config.clone(),
            plan: self.machine.plan().clone(),
            state: self.state.clone(),
        }
    }

    fn assemble(config: LivenessConfig, plan: ChallengePlan, state: SessionState) -> Self {
        Self {
            machine: ChallengeMachine::new(plan, &config),
            scorer: SuspicionScorer::from_config(&config),
            config,
            state,
        }
    }

    /// Process one frame observed at `now_ms`.
    ///
    /// Order: pose estimate, yaw history, suspicion score, challenge
    /// machine. Ignored entirely once the session is blocked or done.
    pub fn on_frame(&mut self, observation: FaceObservation, now_ms: u64) -> Outcome {
        if self.state.blocked || self.state.done {
            return Outcome::default();
        }

        match observation {
            FaceObservation::None => self.face_lost(),
            FaceObservation::Single(frame) => self.on_face(&frame, now_ms),
            FaceObservation::Multiple(faces) => match self.config.multi_face {
                MultiFacePolicy::FirstFace => match faces.first() {
                    Some(frame) => self.on_face(frame, now_ms),
                    None => self.face_lost(),
                },
                MultiFacePolicy::Suppress => {
                    self.state.hold.clear();
                    if !self.state.multiple_faces {
                        tracing::debug!(faces = faces.len(), "multiple faces, progress suspended");
                    }
                    self.state.multiple_faces = true;
                    self.state.instruction = MULTIPLE_FACES_TEXT.to_string();
                    Outcome::default()
                }
            },
        }
    }

    /// Apply the stabilization deadline armed under `epoch`.
    pub fn fire_stabilize(&mut self, epoch: u64) -> Outcome {
        let pending = self.state.stabilize.map(|d| d.epoch);
        if pending != Some(epoch) || self.state.phase != Phase::Stabilizing {
            tracing::debug!(epoch, ?pending, "stale stabilize deadline ignored");
            return Outcome::default();
        }
        self.state.stabilize = None;
        let first = self.machine.first_step();
        self.enter(first);
        Outcome::event(SessionEvent::Entered(first))
    }

    /// Fire the pending deadline if it is due at `now_ms`. For drivers that
    /// poll with their own clock instead of scheduling timers.
    pub fn poll_deadline(&mut self, now_ms: u64) -> Outcome {
        match self.state.stabilize {
            Some(deadline) if now_ms >= deadline.due_at_ms => self.fire_stabilize(deadline.epoch),
            _ => Outcome::default(),
        }
    }

    /// Return to NO_FACE with cleared history, score, hold and flags.
    /// Idempotent.
    pub fn reset(&mut self) -> Outcome {
        let directive = self.cancel_deadline();
        self.state = SessionState::fresh(self.config.yaw_window, self.state.next_epoch);
        Outcome {
            event: Some(SessionEvent::Reset),
            directive,
        }
    }

    fn face_lost(&mut self) -> Outcome {
        if self.state.phase.ignores_face_loss() {
            return Outcome::default();
        }
        let was_tracking = self.state.phase != Phase::NoFace;
        let directive = self.cancel_deadline();
        self.state = SessionState::fresh(self.config.yaw_window, self.state.next_epoch);
        if was_tracking {
            tracing::debug!("face lost, session reset");
        }
        Outcome {
            event: was_tracking.then_some(SessionEvent::FaceLost),
            directive,
        }
    }

    fn on_face(&mut self, frame: &LandmarkFrame, now_ms: u64) -> Outcome {
        let signal = match pose::estimate(frame, &self.config.scheme) {
            Ok(signal) => signal,
            Err(err) => return self.on_malformed(&err),
        };
        self.state.malformed_streak = 0;

        if self.state.multiple_faces {
            self.state.multiple_faces = false;
            self.state.instruction = self.state.phase.instruction().to_string();
        }

        self.state.yaw_history.push(signal.yaw_proxy);

        if self.state.phase.is_challenge() {
            let update = self.scorer.update(
                self.state.suspicion,
                signal.horizontal_offset,
                &self.state.yaw_history,
            );
            self.state.suspicion = update.score;
            if update.flat_motion {
                tracing::trace!(
                    score = update.score,
                    yaw_range = ?update.yaw_range,
                    offset = signal.horizontal_offset,
                    "flat motion"
                );
            }
            if self.scorer.should_block(update.score) {
                return self.block();
            }
        }

        let phase = self.state.phase;
        match self
            .machine
            .on_face(phase, &mut self.state.hold, signal.horizontal_offset, now_ms)
        {
            Transition::Stay => Outcome::default(),
            Transition::Enter(next) => {
                self.enter(next);
                Outcome::event(SessionEvent::Entered(next))
            }
            Transition::Aligned => {
                self.enter(Phase::Stabilizing);
                let delay = Duration::from_millis(self.config.stabilize_delay_ms);
                let epoch = self.state.next_epoch;
                self.state.next_epoch += 1;
                self.state.stabilize = Some(Deadline {
                    epoch,
                    due_at_ms: now_ms.saturating_add(self.config.stabilize_delay_ms),
                });
                Outcome {
                    event: Some(SessionEvent::Entered(Phase::Stabilizing)),
                    directive: Some(Directive::ScheduleStabilize { epoch, delay }),
                }
            }
            Transition::Completed => {
                self.enter(Phase::Done);
                self.state.done = true;
                tracing::info!(plan = ?self.machine.plan().steps(), "liveness challenge completed");
                Outcome::event(SessionEvent::Completed)
            }
        }
    }

    fn on_malformed(&mut self, err: &pose::PoseError) -> Outcome {
        self.state.malformed_streak = self.state.malformed_streak.saturating_add(1);
        let limit = self.config.max_consecutive_malformed;
        tracing::debug!(error = %err, streak = self.state.malformed_streak, "skipping malformed frame");
        if limit > 0 && self.state.malformed_streak >= limit {
            tracing::info!(streak = self.state.malformed_streak, "persistent malformed frames, treating as face loss");
            return self.face_lost();
        }
        Outcome::default()
    }

    fn block(&mut self) -> Outcome {
        let directive = self.cancel_deadline();
        self.state.blocked = true;
        self.state.hold.clear();
        self.state.instruction = BLOCKED_TEXT.to_string();
        tracing::warn!(
            score = self.state.suspicion,
            phase = self.state.phase.name(),
            "flat-image motion detected, session blocked"
        );
        Outcome {
            event: Some(SessionEvent::Blocked {
                score: self.state.suspicion,
            }),
            directive,
        }
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!(from = self.state.phase.name(), to = phase.name(), "phase transition");
        self.state.phase = phase;
        self.state.hold.clear();
        self.state.instruction = phase.instruction().to_string();
    }

    fn cancel_deadline(&mut self) -> Option<Directive> {
        self.state
            .stabilize
            .take()
            .map(|d| Directive::CancelStabilize { epoch: d.epoch })
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            phase: self.state.phase.name().to_string(),
            instruction: self.state.instruction.clone(),
            done: self.state.done,
            blocked: self.state.blocked,
            ready_to_submit: self.ready_to_submit(),
            suspicion_score: self.state.suspicion,
            multiple_faces: self.state.multiple_faces,
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn instruction(&self) -> &str {
        &self.state.instruction
    }

    pub fn is_done(&self) -> bool {
        self.state.done
    }

    pub fn is_blocked(&self) -> bool {
        self.state.blocked
    }

    /// Stable signal for the submission step.
    pub fn ready_to_submit(&self) -> bool {
        self.state.done && !self.state.blocked
    }

    pub fn suspicion_score(&self) -> u32 {
        self.state.suspicion
    }

    pub fn yaw_history(&self) -> &YawHistory {
        &self.state.yaw_history
    }

    pub fn hold_started_at_ms(&self) -> Option<u64> {
        self.state.hold.started_at_ms()
    }

    pub fn pending_deadline(&self) -> Option<Deadline> {
        self.state.stabilize
    }

    pub fn plan(&self) -> &ChallengePlan {
        self.machine.plan()
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }
}

impl Default for Session {
    fn default() -> Self {
        let config = LivenessConfig::default();
        let state = SessionState::fresh(config.yaw_window, 0);
        Self::assemble(config, ChallengePlan::default(), state)
    }
}

fn check_state(
    state: &SessionState,
    config: &LivenessConfig,
    plan: &ChallengePlan,
) -> Result<(), ResumeError> {
    let history = &state.yaw_history;
    if history.capacity() != config.yaw_window {
        return Err(ResumeError::Inconsistent("yaw history capacity differs from yaw_window"));
    }
    if history.len() > history.capacity() {
        return Err(ResumeError::Inconsistent("yaw history exceeds its capacity"));
    }
    if (state.phase == Phase::Stabilizing) != state.stabilize.is_some() {
        return Err(ResumeError::Inconsistent("stabilization deadline does not match phase"));
    }
    if state.stabilize.is_some_and(|d| d.epoch >= state.next_epoch) {
        return Err(ResumeError::Inconsistent("deadline epoch was never issued"));
    }
    if let Phase::Challenge { step, pose } = state.phase {
        if plan.step(step) != Some(pose) {
            return Err(ResumeError::Inconsistent("challenge step is not in the plan"));
        }
    }
    if state.done != (state.phase == Phase::Done) {
        return Err(ResumeError::Inconsistent("done flag does not match phase"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::{Pose, DONE_TEXT, NO_FACE_TEXT};
    use crate::landmarks::Point;
    use crate::pose::testing::frame_with;

    const FRAME_MS: u64 = 100;

    fn face(offset: f32, yaw: f32) -> FaceObservation {
        FaceObservation::Single(frame_with(0.5, offset, yaw))
    }

    /// Yaw with per-frame jitter, as a real head produces.
    fn live(offset: f32, i: u64) -> FaceObservation {
        let jitter = if i % 2 == 0 { 0.003 } else { -0.003 };
        face(offset, 0.12 - offset.abs() * 0.5 + jitter)
    }

    fn session(hold_ms: u64) -> Session {
        let config = LivenessConfig {
            hold_ms,
            ..LivenessConfig::default()
        };
        Session::new(config, ChallengePlan::attendance()).unwrap()
    }

    /// Face appears, aligns, deadline fires. Returns the next free timestamp.
    fn drive_to_first_step(s: &mut Session, yaw: f32) -> u64 {
        s.on_frame(face(0.0, yaw), 0);
        let outcome = s.on_frame(face(0.0, yaw), FRAME_MS);
        let Some(Directive::ScheduleStabilize { epoch, .. }) = outcome.directive else {
            panic!("alignment did not arm the deadline: {outcome:?}");
        };
        s.fire_stabilize(epoch);
        2 * FRAME_MS + 2000
    }

    /// Hold `offset` with live jitter until the phase changes.
    fn hold_pose(s: &mut Session, offset: f32, mut t: u64) -> u64 {
        let start = s.phase();
        let mut i = 0;
        while s.phase() == start {
            s.on_frame(live(offset, i), t);
            t += FRAME_MS;
            i += 1;
            assert!(i < 100, "pose {offset} never accepted in {}", start.name());
        }
        t
    }

    #[test]
    fn test_initial_state() {
        let s = Session::default();
        assert_eq!(s.phase(), Phase::NoFace);
        assert_eq!(s.instruction(), NO_FACE_TEXT);
        assert!(!s.is_done());
        assert!(!s.is_blocked());
        assert_eq!(s.pending_deadline(), None);
    }

    #[test]
    fn test_zero_face_frames_stay_in_no_face() {
        let mut s = Session::default();
        for t in 0..50 {
            let outcome = s.on_frame(FaceObservation::None, t * FRAME_MS);
            assert_eq!(outcome, Outcome::default());
            assert_eq!(s.phase(), Phase::NoFace);
            assert_eq!(s.instruction(), NO_FACE_TEXT);
        }
    }

    #[test]
    fn test_first_face_only_enters_align() {
        // The transition frame is consumed even if already centred
        let mut s = Session::default();
        let outcome = s.on_frame(face(0.0, 0.12), 0);
        assert_eq!(outcome.event, Some(SessionEvent::Entered(Phase::AlignCenter)));
        assert_eq!(s.phase(), Phase::AlignCenter);
        assert_eq!(s.instruction(), "Align your face to the center");
    }

    #[test]
    fn test_alignment_arms_deadline() {
        let mut s = Session::default();
        s.on_frame(face(0.0, 0.12), 0);
        s.on_frame(face(0.03, 0.12), 100);
        assert_eq!(s.phase(), Phase::AlignCenter);
        let outcome = s.on_frame(face(0.01, 0.12), 200);
        assert_eq!(s.phase(), Phase::Stabilizing);
        assert_eq!(
            outcome.directive,
            Some(Directive::ScheduleStabilize {
                epoch: 0,
                delay: Duration::from_millis(2000)
            })
        );
        assert_eq!(
            s.pending_deadline(),
            Some(Deadline {
                epoch: 0,
                due_at_ms: 2200
            })
        );
    }

    #[test]
    fn test_stabilizing_ignores_frames_and_face_loss() {
        let mut s = Session::default();
        s.on_frame(face(0.0, 0.12), 0);
        s.on_frame(face(0.0, 0.12), 100);
        for (i, t) in (200..2000).step_by(100).enumerate() {
            let obs = if i % 3 == 0 {
                FaceObservation::None
            } else {
                face(0.08, 0.12)
            };
            assert_eq!(s.on_frame(obs, t), Outcome::default());
            assert_eq!(s.phase(), Phase::Stabilizing);
        }
        assert!(s.pending_deadline().is_some());
    }

    #[test]
    fn test_poll_deadline_fires_when_due() {
        let mut s = Session::default();
        s.on_frame(face(0.0, 0.12), 0);
        s.on_frame(face(0.0, 0.12), 100);
        assert_eq!(s.poll_deadline(2099), Outcome::default());
        assert_eq!(s.phase(), Phase::Stabilizing);
        let outcome = s.poll_deadline(2100);
        assert_eq!(
            outcome.event,
            Some(SessionEvent::Entered(Phase::Challenge {
                step: 0,
                pose: Pose::Left
            }))
        );
        assert_eq!(s.instruction(), "Turn LEFT and hold");
        assert_eq!(s.pending_deadline(), None);
        assert_eq!(s.hold_started_at_ms(), None);
    }

    #[test]
    fn test_stale_deadline_after_reset_is_noop() {
        let mut s = Session::default();
        s.on_frame(face(0.0, 0.12), 0);
        s.on_frame(face(0.0, 0.12), 100);
        let outcome = s.reset();
        assert_eq!(outcome.directive, Some(Directive::CancelStabilize { epoch: 0 }));

        assert_eq!(s.fire_stabilize(0), Outcome::default());
        assert_eq!(s.phase(), Phase::NoFace);

        // A new alignment gets a new epoch; the old one stays dead
        s.on_frame(face(0.0, 0.12), 200);
        let outcome = s.on_frame(face(0.0, 0.12), 300);
        assert!(matches!(
            outcome.directive,
            Some(Directive::ScheduleStabilize { epoch: 1, .. })
        ));
        assert_eq!(s.fire_stabilize(0), Outcome::default());
        assert_eq!(s.phase(), Phase::Stabilizing);
        s.fire_stabilize(1);
        assert_eq!(s.phase().name(), "LEFT");
    }

    #[test]
    fn test_deadline_fires_only_once() {
        let mut s = Session::default();
        drive_to_first_step(&mut s, 0.12);
        assert_eq!(s.phase().name(), "LEFT");
        assert_eq!(s.fire_stabilize(0), Outcome::default());
        assert_eq!(s.phase().name(), "LEFT");
    }

    #[test]
    fn test_left_hold_scenario() {
        // Offsets [0.05; 4] at 100ms spacing, HOLD=300: CENTER on the 4th frame
        let mut s = session(300);
        let t0 = drive_to_first_step(&mut s, 0.12);
        for i in 0..3 {
            s.on_frame(live(0.05, i), t0 + i * 100);
            assert_eq!(s.phase().name(), "LEFT", "transitioned early at frame {}", i + 1);
        }
        let outcome = s.on_frame(live(0.05, 3), t0 + 300);
        assert_eq!(s.phase().name(), "CENTER");
        assert_eq!(
            outcome.event,
            Some(SessionEvent::Entered(Phase::Challenge {
                step: 1,
                pose: Pose::Center
            }))
        );
        assert_eq!(s.hold_started_at_ms(), None);
    }

    #[test]
    fn test_interrupted_hold_restarts_from_zero() {
        let mut s = session(300);
        let t0 = drive_to_first_step(&mut s, 0.12);
        s.on_frame(live(0.05, 0), t0);
        s.on_frame(live(0.05, 1), t0 + 200);
        s.on_frame(live(0.0, 2), t0 + 250);
        assert_eq!(s.hold_started_at_ms(), None);
        s.on_frame(live(0.05, 3), t0 + 300);
        s.on_frame(live(0.05, 4), t0 + 500);
        assert_eq!(s.phase().name(), "LEFT");
        s.on_frame(live(0.05, 5), t0 + 600);
        assert_eq!(s.phase().name(), "CENTER");
    }

    #[test]
    fn test_full_attendance_walkthrough() {
        let mut s = session(400);
        let mut t = drive_to_first_step(&mut s, 0.12);
        t = hold_pose(&mut s, 0.06, t);
        assert_eq!(s.phase().name(), "CENTER");
        t = hold_pose(&mut s, 0.0, t);
        assert_eq!(s.phase().name(), "RIGHT");
        assert_eq!(s.instruction(), "Turn RIGHT and hold");
        assert!(!s.ready_to_submit());

        let mut i = 0;
        let outcome = loop {
            let outcome = s.on_frame(live(-0.06, i), t);
            if outcome.event.is_some() {
                break outcome;
            }
            t += FRAME_MS;
            i += 1;
        };
        assert_eq!(outcome.event, Some(SessionEvent::Completed));
        assert_eq!(s.phase(), Phase::Done);
        assert_eq!(s.instruction(), DONE_TEXT);
        assert!(s.is_done());
        assert!(s.ready_to_submit());
        assert!(!s.is_blocked());
        assert_eq!(s.suspicion_score(), 0);
    }

    #[test]
    fn test_done_ignores_frames_until_reset() {
        let mut s = session(0);
        let t = drive_to_first_step(&mut s, 0.12);
        s.on_frame(live(0.06, 0), t);
        s.on_frame(live(0.0, 1), t + 100);
        s.on_frame(live(-0.06, 2), t + 200);
        assert!(s.is_done());

        assert_eq!(s.on_frame(FaceObservation::None, t + 300), Outcome::default());
        assert!(s.ready_to_submit());

        s.reset();
        assert!(!s.is_done());
        assert_eq!(s.phase(), Phase::NoFace);
    }

    #[test]
    fn test_panned_photo_blocks_and_freezes() {
        // Constant yaw 0.10 with offset 0.03 in LEFT. Two alignment frames
        // are already in the window, so scoring starts on the 8th frame.
        let mut s = Session::default();
        let mut t = drive_to_first_step(&mut s, 0.10);
        let mut scores = Vec::new();
        let mut blocked_at = None;
        for k in 1..=30u32 {
            let outcome = s.on_frame(face(0.03, 0.10), t);
            t += FRAME_MS;
            scores.push(s.suspicion_score());
            if let Some(SessionEvent::Blocked { score }) = outcome.event {
                assert_eq!(score, 22);
                blocked_at = Some(k);
                break;
            }
        }
        assert_eq!(&scores[6..10], &[0, 2, 4, 6]);
        assert_eq!(blocked_at, Some(18));
        assert!(s.is_blocked());
        assert!(!s.ready_to_submit());
        assert_eq!(s.instruction(), BLOCKED_TEXT);

        // A genuine left hold would now pass; it is ignored
        let frozen = s.state().clone();
        for i in 0..20 {
            assert_eq!(s.on_frame(live(0.08, i), t), Outcome::default());
            t += FRAME_MS;
        }
        assert_eq!(s.state(), &frozen);
        assert_eq!(s.phase().name(), "LEFT");
    }

    #[test]
    fn test_block_requires_reset() {
        let mut s = Session::default();
        let mut t = drive_to_first_step(&mut s, 0.10);
        while !s.is_blocked() {
            s.on_frame(face(-0.03, 0.10), t);
            t += FRAME_MS;
        }
        s.on_frame(FaceObservation::None, t);
        assert!(s.is_blocked());
        s.reset();
        assert!(!s.is_blocked());
        assert_eq!(s.suspicion_score(), 0);
        assert_eq!(s.instruction(), NO_FACE_TEXT);
    }

    #[test]
    fn test_live_turns_do_not_accumulate_suspicion() {
        let mut s = session(400);
        let t = drive_to_first_step(&mut s, 0.12);
        let t = hold_pose(&mut s, 0.06, t);
        hold_pose(&mut s, 0.0, t);
        assert_eq!(s.phase().name(), "RIGHT");
        assert_eq!(s.suspicion_score(), 0);
    }

    #[test]
    fn test_face_loss_in_right_resets_everything() {
        let mut s = session(400);
        let mut t = drive_to_first_step(&mut s, 0.12);
        t = hold_pose(&mut s, 0.06, t);
        t = hold_pose(&mut s, 0.0, t);
        assert_eq!(s.phase().name(), "RIGHT");

        // Flatten the window short of the right turn so suspicion rises
        for _ in 0..16 {
            s.on_frame(face(-0.03, 0.1), t);
            t += FRAME_MS;
        }
        s.on_frame(face(-0.05, 0.1), t);
        assert!(s.suspicion_score() > 0);
        assert!(s.hold_started_at_ms().is_some());
        assert!(!s.yaw_history().is_empty());

        let outcome = s.on_frame(FaceObservation::None, t + FRAME_MS);
        assert_eq!(outcome.event, Some(SessionEvent::FaceLost));
        assert_eq!(s.phase(), Phase::NoFace);
        assert_eq!(s.hold_started_at_ms(), None);
        assert_eq!(s.suspicion_score(), 0);
        assert!(s.yaw_history().is_empty());
        assert_eq!(s.instruction(), NO_FACE_TEXT);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut s = Session::default();
        let t = drive_to_first_step(&mut s, 0.12);
        s.on_frame(live(0.05, 0), t);

        s.reset();
        let once = s.state().clone();
        s.reset();
        assert_eq!(s.state(), &once);
        assert_eq!(s.reset().directive, None);
    }

    #[test]
    fn test_multiple_faces_suppress_progress() {
        let mut s = session(300);
        let t0 = drive_to_first_step(&mut s, 0.12);
        s.on_frame(live(0.05, 0), t0);
        assert!(s.hold_started_at_ms().is_some());
        let history_len = s.yaw_history().len();

        let two = FaceObservation::Multiple(vec![
            frame_with(0.3, 0.05, 0.1),
            frame_with(0.7, 0.05, 0.1),
        ]);
        for i in 1..10 {
            assert_eq!(s.on_frame(two.clone(), t0 + i * 100), Outcome::default());
        }
        assert_eq!(s.phase().name(), "LEFT");
        assert_eq!(s.instruction(), MULTIPLE_FACES_TEXT);
        assert!(s.snapshot().multiple_faces);
        assert_eq!(s.hold_started_at_ms(), None);
        assert_eq!(s.yaw_history().len(), history_len);

        // Back to one face: instruction restored, hold starts over
        s.on_frame(live(0.05, 1), t0 + 1000);
        assert_eq!(s.instruction(), "Turn LEFT and hold");
        assert_eq!(s.hold_started_at_ms(), Some(t0 + 1000));
    }

    #[test]
    fn test_multiple_faces_first_face_policy() {
        let config = LivenessConfig {
            multi_face: MultiFacePolicy::FirstFace,
            ..LivenessConfig::default()
        };
        let mut s = Session::new(config, ChallengePlan::attendance()).unwrap();
        let two = FaceObservation::Multiple(vec![
            frame_with(0.3, 0.0, 0.1),
            frame_with(0.7, 0.08, 0.1),
        ]);
        s.on_frame(two.clone(), 0);
        s.on_frame(two, 100);
        assert_eq!(s.phase(), Phase::Stabilizing);
    }

    #[test]
    fn test_malformed_frame_is_skipped() {
        let mut s = session(300);
        let t0 = drive_to_first_step(&mut s, 0.12);
        s.on_frame(live(0.05, 0), t0);
        let before = s.yaw_history().clone();

        let broken = FaceObservation::Single(LandmarkFrame::new(vec![Point::new(0.5, 0.5); 5]));
        assert_eq!(s.on_frame(broken, t0 + 100), Outcome::default());
        assert_eq!(s.yaw_history(), &before);
        assert_eq!(s.phase().name(), "LEFT");
        // The hold streak survives a skipped frame
        assert_eq!(s.hold_started_at_ms(), Some(t0));
    }

    #[test]
    fn test_persistent_malformed_frames_reset() {
        let config = LivenessConfig {
            max_consecutive_malformed: 3,
            ..LivenessConfig::default()
        };
        let mut s = Session::new(config, ChallengePlan::attendance()).unwrap();
        let t0 = drive_to_first_step(&mut s, 0.12);
        let broken = || FaceObservation::Single(LandmarkFrame::new(Vec::new()));
        s.on_frame(broken(), t0);
        s.on_frame(broken(), t0 + 100);
        assert_eq!(s.phase().name(), "LEFT");
        let outcome = s.on_frame(broken(), t0 + 200);
        assert_eq!(outcome.event, Some(SessionEvent::FaceLost));
        assert_eq!(s.phase(), Phase::NoFace);
    }

    #[test]
    fn test_good_frame_clears_malformed_streak() {
        let config = LivenessConfig {
            max_consecutive_malformed: 2,
            ..LivenessConfig::default()
        };
        let mut s = Session::new(config, ChallengePlan::attendance()).unwrap();
        let t0 = drive_to_first_step(&mut s, 0.12);
        let broken = || FaceObservation::Single(LandmarkFrame::new(Vec::new()));
        for i in 0..5 {
            s.on_frame(broken(), t0 + i * 200);
            s.on_frame(live(0.0, i), t0 + i * 200 + 100);
        }
        assert_eq!(s.phase().name(), "LEFT");
    }

    #[test]
    fn test_save_resume_reproduces_transitions() {
        let mut original = session(300);
        let mut t = drive_to_first_step(&mut original, 0.12);
        t = hold_pose(&mut original, 0.06, t);
        original.on_frame(live(0.0, 0), t);
        t += FRAME_MS;

        let json = serde_json::to_string(&original.save()).unwrap();
        let saved: SavedSession = serde_json::from_str(&json).unwrap();
        let mut resumed = Session::resume(saved).unwrap();
        assert_eq!(resumed.state(), original.state());

        let script: Vec<FaceObservation> = (0..30)
            .map(|i| match i {
                5 => FaceObservation::None,
                _ if i < 12 => live(0.0, i),
                _ => live(-0.06, i),
            })
            .collect();
        for obs in script {
            let a = original.on_frame(obs.clone(), t);
            let b = resumed.on_frame(obs, t);
            assert_eq!(a, b);
            assert_eq!(original.snapshot(), resumed.snapshot());
            t += FRAME_MS;
        }
        assert_eq!(original.state(), resumed.state());
    }

    #[test]
    fn test_resume_rejects_invalid_config() {
        let mut saved = Session::default().save();
        saved.config.yaw_window = 0;
        assert!(Session::resume(saved).is_err());
    }

    fn tampered(s: &Session, edit: impl FnOnce(&mut serde_json::Value)) -> SavedSession {
        let mut value = serde_json::to_value(s.save()).unwrap();
        edit(&mut value["state"]);
        serde_json::from_value(value).unwrap()
    }

    fn assert_inconsistent(saved: SavedSession) {
        assert!(matches!(
            Session::resume(saved),
            Err(ResumeError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_resume_rejects_inconsistent_state() {
        let fresh = Session::default();
        assert_inconsistent(tampered(&fresh, |st| st["yaw_history"]["capacity"] = 0.into()));
        assert_inconsistent(tampered(&fresh, |st| {
            st["yaw_history"]["samples"] = serde_json::json!(vec![0.1; 40]);
        }));
        assert_inconsistent(tampered(&fresh, |st| st["done"] = true.into()));

        let mut stabilizing = Session::default();
        stabilizing.on_frame(face(0.0, 0.12), 0);
        stabilizing.on_frame(face(0.0, 0.12), FRAME_MS);
        assert_eq!(stabilizing.phase(), Phase::Stabilizing);
        assert!(Session::resume(stabilizing.save()).is_ok());
        assert_inconsistent(tampered(&stabilizing, |st| st["stabilize"] = serde_json::Value::Null));
        assert_inconsistent(tampered(&stabilizing, |st| st["stabilize"]["epoch"] = 7.into()));

        let mut challenge = session(300);
        drive_to_first_step(&mut challenge, 0.12);
        assert!(Session::resume(challenge.save()).is_ok());
        assert_inconsistent(tampered(&challenge, |st| st["phase"]["step"] = 5.into()));
        assert_inconsistent(tampered(&challenge, |st| st["phase"]["pose"] = "right".into()));
        assert_inconsistent(tampered(&challenge, |st| {
            st["stabilize"] = serde_json::json!({ "epoch": 0, "due_at_ms": 2100 });
        }));
    }

    #[test]
    fn test_resumed_history_stays_bounded() {
        let mut s = session(300);
        drive_to_first_step(&mut s, 0.12);
        let mut resumed = Session::resume(s.save()).unwrap();
        for i in 0..100 {
            resumed.on_frame(live(0.0, i), 3000 + i * FRAME_MS);
        }
        assert_eq!(resumed.yaw_history().len(), resumed.config().yaw_window);
    }

    #[test]
    fn test_presence_plan_completes_after_one_hold() {
        let mut s = Session::new(LivenessConfig::default(), ChallengePlan::presence()).unwrap();
        let t = drive_to_first_step(&mut s, 0.12);
        assert_eq!(s.instruction(), "Look straight at the camera and hold");
        s.on_frame(live(0.0, 0), t);
        let outcome = s.on_frame(live(0.0, 1), t + 400);
        assert_eq!(outcome.event, Some(SessionEvent::Completed));
        assert!(s.ready_to_submit());
    }

    #[test]
    fn test_snapshot_fields() {
        let mut s = Session::default();
        s.on_frame(face(0.0, 0.12), 0);
        let snap = s.snapshot();
        assert_eq!(snap.phase, "ALIGN_CENTER");
        assert_eq!(snap.instruction, "Align your face to the center");
        assert!(!snap.done);
        assert!(!snap.blocked);
        assert!(!snap.ready_to_submit);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["phase"], "ALIGN_CENTER");
    }
}
