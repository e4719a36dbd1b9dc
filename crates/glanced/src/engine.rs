use std::sync::Arc;
use std::time::Duration;

use glance_core::{Directive, FaceObservation, Outcome, Session, SessionEvent, Snapshot};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("session actor exited")]
    ChannelClosed,
}

/// Called from the session actor when a session completes or blocks.
pub type SessionHook = Arc<dyn Fn(Uuid, SessionEvent) + Send + Sync>;

/// Result of submitting one frame.
#[derive(Debug, Clone)]
pub struct FrameReply {
    pub snapshot: Snapshot,
    pub event: Option<SessionEvent>,
}

/// Messages processed by a session actor, strictly one at a time.
enum SessionRequest {
    Frame {
        observation: FaceObservation,
        timestamp_ms: Option<u64>,
        reply: oneshot::Sender<FrameReply>,
    },
    /// Sent by the actor's own stabilization timer.
    StabilizeDeadline { epoch: u64 },
    Reset {
        reply: oneshot::Sender<Snapshot>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    Shutdown,
}

/// Clone-safe handle to one session actor.
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    tx: mpsc::Sender<SessionRequest>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the actor has exited (shutdown or idle timeout).
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Feed one frame. Without a timestamp the actor stamps it from its
    /// own monotonic clock.
    pub async fn submit_frame(
        &self,
        observation: FaceObservation,
        timestamp_ms: Option<u64>,
    ) -> Result<FrameReply, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionRequest::Frame {
                observation,
                timestamp_ms,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Restart the attempt from NO_FACE, cancelling any pending timer.
    pub async fn reset(&self) -> Result<Snapshot, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionRequest::Reset { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn snapshot(&self) -> Result<Snapshot, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionRequest::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Stop the actor. Any pending timer is aborted.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.tx
            .send(SessionRequest::Shutdown)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }
}

struct PendingTimer {
    epoch: u64,
    task: JoinHandle<()>,
}

/// Owns one [`Session`]. Frames, timer fires and resets all arrive on the
/// same channel, so they can never interleave.
struct SessionActor {
    id: Uuid,
    session: Session,
    clock: Instant,
    self_tx: mpsc::WeakSender<SessionRequest>,
    timer: Option<PendingTimer>,
    hook: Option<SessionHook>,
    idle_timeout: Duration,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::Receiver<SessionRequest>) {
        tracing::debug!(session = %self.id, "session actor started");
        loop {
            let req = match tokio::time::timeout(self.idle_timeout, rx.recv()).await {
                Ok(Some(req)) => req,
                Ok(None) => break,
                Err(_) => {
                    tracing::info!(
                        session = %self.id,
                        idle_secs = self.idle_timeout.as_secs(),
                        "session idle, closing"
                    );
                    break;
                }
            };
            match req {
                SessionRequest::Frame {
                    observation,
                    timestamp_ms,
                    reply,
                } => {
                    let now = timestamp_ms.unwrap_or_else(|| self.clock.elapsed().as_millis() as u64);
                    let outcome = self.session.on_frame(observation, now);
                    self.apply(outcome);
                    let _ = reply.send(FrameReply {
                        snapshot: self.session.snapshot(),
                        event: outcome.event,
                    });
                }
                SessionRequest::StabilizeDeadline { epoch } => {
                    if self.timer.as_ref().is_some_and(|t| t.epoch == epoch) {
                        self.timer = None;
                    }
                    let outcome = self.session.fire_stabilize(epoch);
                    self.apply(outcome);
                }
                SessionRequest::Reset { reply } => {
                    let outcome = self.session.reset();
                    self.apply(outcome);
                    tracing::info!(session = %self.id, "session reset");
                    let _ = reply.send(self.session.snapshot());
                }
                SessionRequest::Snapshot { reply } => {
                    let _ = reply.send(self.session.snapshot());
                }
                SessionRequest::Shutdown => break,
            }
        }
        if let Some(timer) = self.timer.take() {
            timer.task.abort();
        }
        tracing::debug!(session = %self.id, "session actor exiting");
    }

    fn apply(&mut self, outcome: Outcome) {
        match outcome.directive {
            Some(Directive::ScheduleStabilize { epoch, delay }) => {
                if let Some(old) = self.timer.take() {
                    old.task.abort();
                }
                // Upgrade fails only when every handle is gone.
                if let Some(tx) = self.self_tx.upgrade() {
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(SessionRequest::StabilizeDeadline { epoch }).await;
                    });
                    self.timer = Some(PendingTimer { epoch, task });
                }
            }
            Some(Directive::CancelStabilize { epoch }) => {
                if self.timer.as_ref().is_some_and(|t| t.epoch == epoch) {
                    if let Some(timer) = self.timer.take() {
                        timer.task.abort();
                    }
                }
            }
            None => {}
        }

        match outcome.event {
            Some(event @ SessionEvent::Completed) => {
                tracing::info!(session = %self.id, "liveness verified, ready to submit");
                self.notify(event);
            }
            Some(event @ SessionEvent::Blocked { score }) => {
                tracing::warn!(session = %self.id, score, "session blocked on suspected image spoof");
                self.notify(event);
            }
            Some(SessionEvent::Entered(phase)) => {
                tracing::debug!(session = %self.id, phase = phase.name(), "phase entered");
            }
            Some(SessionEvent::FaceLost) => {
                tracing::debug!(session = %self.id, "face lost");
            }
            Some(SessionEvent::Reset) | None => {}
        }
    }

    fn notify(&self, event: SessionEvent) {
        if let Some(hook) = &self.hook {
            hook(self.id, event);
        }
    }
}

/// Spawn an actor owning `session` on the current tokio runtime.
///
/// `hook` is the caller's continuation for terminal outcomes: it runs on the
/// actor task after a session completes or blocks, before the frame reply
/// is sent. The actor exits once no request arrives for `idle_timeout`.
pub fn spawn_session(
    id: Uuid,
    session: Session,
    hook: Option<SessionHook>,
    idle_timeout: Duration,
) -> SessionHandle {
    let (tx, rx) = mpsc::channel::<SessionRequest>(8);

    let actor = SessionActor {
        id,
        session,
        clock: Instant::now(),
        self_tx: tx.downgrade(),
        timer: None,
        hook,
        idle_timeout,
    };
    tokio::spawn(actor.run(rx));

    SessionHandle { id, tx }
}
