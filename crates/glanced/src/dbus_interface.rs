use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use glance_core::{ChallengePlan, FramePayload, Session, SessionEvent, Snapshot};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;
use zbus::interface;
use zbus::object_server::SignalEmitter;

use crate::config::Config;
use crate::engine::{spawn_session, SessionHandle, SessionHook};
use crate::lockout::SpoofLockout;

pub const BUS_NAME: &str = "org.freedesktop.Glance1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Glance1";

/// Terminal outcome reported by a session actor.
#[derive(Debug, Clone, Copy)]
pub struct Notice {
    pub session: Uuid,
    pub owner_uid: u32,
    pub event: SessionEvent,
}

pub struct SessionEntry {
    pub handle: SessionHandle,
    pub owner_uid: u32,
    pub plan: String,
    pub created_at: DateTime<Utc>,
}

/// Public listing of an open session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub plan: String,
    pub owner_uid: u32,
    pub created_at: String,
}

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub sessions: HashMap<Uuid, SessionEntry>,
    /// Shared with session hooks so outcomes are counted on the actor task.
    pub lockout: Arc<std::sync::Mutex<SpoofLockout>>,
    notices: mpsc::UnboundedSender<Notice>,
}

/// Count a terminal session outcome against its owner.
pub fn record_outcome(lockout: &std::sync::Mutex<SpoofLockout>, uid: u32, event: SessionEvent) {
    let mut lockout = lockout.lock().unwrap_or_else(|e| e.into_inner());
    match event {
        SessionEvent::Completed => lockout.record_success(uid),
        SessionEvent::Blocked { .. } => lockout.record_block(uid),
        _ => {}
    }
}

impl AppState {
    pub fn new(config: Config, notices: mpsc::UnboundedSender<Notice>) -> Self {
        let lockout = SpoofLockout::new(
            config.lockout_max_blocks,
            config.lockout_window(),
            config.lockout_duration(),
        );
        Self {
            config,
            sessions: HashMap::new(),
            lockout: Arc::new(std::sync::Mutex::new(lockout)),
            notices,
        }
    }

    fn check_lockout(&self, uid: u32) -> zbus::fdo::Result<()> {
        self.lockout
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .check(uid)
            .map_err(zbus::fdo::Error::AccessDenied)
    }

    /// Drop sessions whose actor has exited. Returns how many were removed.
    pub fn reap_closed(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|id, entry| {
            let open = !entry.handle.is_closed();
            if !open {
                tracing::info!(session = %id, owner_uid = entry.owner_uid, "reaped closed session");
            }
            open
        });
        before - self.sessions.len()
    }

    /// Create a session actor owned by `owner_uid`.
    pub fn open_session(&mut self, owner_uid: u32, plan_name: &str) -> zbus::fdo::Result<Uuid> {
        self.check_lockout(owner_uid)?;
        self.reap_closed();

        if self.sessions.len() >= self.config.max_sessions {
            return Err(zbus::fdo::Error::LimitsExceeded(format!(
                "session limit reached ({})",
                self.config.max_sessions
            )));
        }

        let plan = ChallengePlan::from_name(plan_name)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
        let plan_label = if plan_name.is_empty() {
            "attendance".to_string()
        } else {
            plan_name.to_string()
        };
        let session = Session::new(self.config.liveness.clone(), plan)
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

        let notices = self.notices.clone();
        let lockout = Arc::clone(&self.lockout);
        let hook: SessionHook = Arc::new(move |session, event| {
            record_outcome(&lockout, owner_uid, event);
            let _ = notices.send(Notice {
                session,
                owner_uid,
                event,
            });
        });

        let id = Uuid::new_v4();
        let handle = spawn_session(id, session, Some(hook), self.config.session_idle());
        self.sessions.insert(
            id,
            SessionEntry {
                handle,
                owner_uid,
                plan: plan_label,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    fn entry(&self, session: &str, caller_uid: u32) -> zbus::fdo::Result<&SessionEntry> {
        let id = parse_session_id(session)?;
        let entry = self
            .sessions
            .get(&id)
            .ok_or_else(|| zbus::fdo::Error::Failed(format!("unknown session '{session}'")))?;
        if entry.handle.is_closed() {
            return Err(zbus::fdo::Error::Failed(format!("session '{session}' expired")));
        }
        if !self.config.session_bus && caller_uid != 0 && caller_uid != entry.owner_uid {
            tracing::warn!(
                session,
                caller_uid,
                owner_uid = entry.owner_uid,
                "caller does not own session"
            );
            return Err(zbus::fdo::Error::AccessDenied(format!(
                "caller is not permitted to use session '{session}'"
            )));
        }
        Ok(entry)
    }

    /// Resolve `session` and check that `caller_uid` may drive it.
    ///
    /// Root may drive any session. On the session bus ownership is not enforced.
    pub fn lookup(&self, session: &str, caller_uid: u32) -> zbus::fdo::Result<SessionHandle> {
        self.entry(session, caller_uid).map(|e| e.handle.clone())
    }

    /// Like [`AppState::lookup`], but a reset is a fresh attempt, so it is
    /// refused while the session's owner is locked out.
    pub fn lookup_for_reset(
        &self,
        session: &str,
        caller_uid: u32,
    ) -> zbus::fdo::Result<SessionHandle> {
        let entry = self.entry(session, caller_uid)?;
        self.check_lockout(entry.owner_uid)?;
        Ok(entry.handle.clone())
    }

    pub fn list_for(&self, caller_uid: u32) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .iter()
            .filter(|(_, e)| !e.handle.is_closed())
            .filter(|(_, e)| self.config.session_bus || caller_uid == 0 || e.owner_uid == caller_uid)
            .map(|(id, e)| SessionInfo {
                id: id.to_string(),
                plan: e.plan.clone(),
                owner_uid: e.owner_uid,
                created_at: e.created_at.to_rfc3339(),
            })
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Stop every session actor.
    pub async fn shutdown_all(&mut self) {
        for (id, entry) in self.sessions.drain() {
            if entry.handle.shutdown().await.is_err() {
                tracing::debug!(session = %id, "session actor already gone");
            }
        }
    }
}

fn parse_session_id(session: &str) -> zbus::fdo::Result<Uuid> {
    Uuid::parse_str(session)
        .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("malformed session id '{session}'")))
}

fn snapshot_json(snapshot: &Snapshot) -> zbus::fdo::Result<String> {
    serde_json::to_string(snapshot).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

/// D-Bus interface for the Glance liveness daemon.
///
/// Bus name: org.freedesktop.Glance1
/// Object path: /org/freedesktop/Glance1
pub struct LivenessService {
    pub state: Arc<Mutex<AppState>>,
}

/// Retrieve the UID of the D-Bus peer that sent `header`.
async fn get_caller_uid(
    header: &zbus::message::Header<'_>,
    conn: &zbus::Connection,
) -> zbus::fdo::Result<u32> {
    let sender = header
        .sender()
        .ok_or_else(|| zbus::fdo::Error::Failed("no sender in message".to_string()))?;
    let dbus_proxy = zbus::fdo::DBusProxy::new(conn)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    let bus_name = zbus::names::BusName::try_from(sender.as_str())
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    dbus_proxy
        .get_connection_unix_user(bus_name)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.freedesktop.Glance1")]
impl LivenessService {
    /// Start a liveness session with the named challenge plan
    /// (`attendance`, `presence`, or empty for the default).
    ///
    /// Returns the session UUID.
    async fn start_session(
        &self,
        plan: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        let caller_uid = get_caller_uid(&header, conn).await?;
        let id = self
            .state
            .lock()
            .await
            .open_session(caller_uid, plan)
            .map_err(|e| {
                tracing::warn!(caller_uid, plan, error = %e, "start_session refused");
                e
            })?;
        tracing::info!(session = %id, caller_uid, plan, "session started");
        Ok(id.to_string())
    }

    /// Submit one landmark frame. Returns the session snapshot as JSON.
    async fn submit_frame(
        &self,
        session: &str,
        frame_json: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        let caller_uid = get_caller_uid(&header, conn).await?;
        let payload = FramePayload::from_json(frame_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("malformed frame: {e}")))?;

        // Copy the handle while holding the lock, then release
        let handle = self.state.lock().await.lookup(session, caller_uid)?;

        let timestamp_ms = payload.timestamp_ms;
        let reply = handle
            .submit_frame(payload.into_observation(), timestamp_ms)
            .await
            .map_err(|e| {
                tracing::error!(session, error = %e, "submit_frame failed");
                zbus::fdo::Error::Failed(e.to_string())
            })?;
        if let Some(event) = reply.event {
            tracing::debug!(session, ?event, "frame produced session event");
        }
        snapshot_json(&reply.snapshot)
    }

    /// Current snapshot of a session as JSON.
    async fn snapshot(
        &self,
        session: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        let caller_uid = get_caller_uid(&header, conn).await?;
        let handle = self.state.lock().await.lookup(session, caller_uid)?;
        let snapshot = handle
            .snapshot()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        snapshot_json(&snapshot)
    }

    /// Restart a session from NO_FACE, e.g. after a submission attempt.
    async fn reset_session(
        &self,
        session: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        let caller_uid = get_caller_uid(&header, conn).await?;
        let handle = self
            .state
            .lock()
            .await
            .lookup_for_reset(session, caller_uid)
            .map_err(|e| {
                tracing::warn!(session, caller_uid, error = %e, "reset_session refused");
                e
            })?;
        let snapshot = handle
            .reset()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        snapshot_json(&snapshot)
    }

    /// End a session and release its actor. Returns false if it was unknown.
    async fn end_session(
        &self,
        session: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<bool> {
        let caller_uid = get_caller_uid(&header, conn).await?;
        let id = parse_session_id(session)?;
        let entry = {
            let mut state = self.state.lock().await;
            if !state.sessions.contains_key(&id) {
                tracing::warn!(session, "end_session: unknown session");
                return Ok(false);
            }
            state.lookup(session, caller_uid)?;
            state.sessions.remove(&id)
        };
        if let Some(entry) = entry {
            let _ = entry.handle.shutdown().await;
            tracing::info!(session = %entry.handle.id(), owner_uid = entry.owner_uid, "session ended");
        }
        Ok(true)
    }

    /// List the caller's open sessions as JSON.
    async fn list_sessions(
        &self,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        let caller_uid = get_caller_uid(&header, conn).await?;
        let infos = self.state.lock().await.list_for(caller_uid);
        serde_json::to_string(&infos).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let mut state = self.state.lock().await;
        state.reap_closed();
        let liveness = &state.config.liveness;

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "sessions": state.sessions.len(),
            "max_sessions": state.config.max_sessions,
            "session_bus": state.config.session_bus,
            "config_file": state.config.liveness_path.as_ref().map(|p| p.display().to_string()),
            "hold_ms": liveness.hold_ms,
            "stabilize_delay_ms": liveness.stabilize_delay_ms,
            "suspicion_block_threshold": liveness.suspicion_block_threshold,
        })
        .to_string())
    }

    /// Emitted when a session completes its challenge plan.
    #[zbus(signal)]
    async fn completed(emitter: &SignalEmitter<'_>, session: &str) -> zbus::Result<()>;

    /// Emitted when a session is blocked on suspected image spoofing.
    #[zbus(signal)]
    async fn blocked(emitter: &SignalEmitter<'_>, session: &str) -> zbus::Result<()>;
}

/// Broadcast session notices as D-Bus signals.
pub async fn forward_notices(conn: zbus::Connection, mut rx: mpsc::UnboundedReceiver<Notice>) {
    while let Some(notice) = rx.recv().await {
        let emitter = match SignalEmitter::new(&conn, OBJECT_PATH) {
            Ok(emitter) => emitter,
            Err(e) => {
                tracing::error!(error = %e, "failed to build signal emitter");
                continue;
            }
        };
        let session = notice.session.to_string();
        let sent = match notice.event {
            SessionEvent::Completed => LivenessService::completed(&emitter, &session).await,
            SessionEvent::Blocked { .. } => LivenessService::blocked(&emitter, &session).await,
            _ => Ok(()),
        };
        match sent {
            Ok(()) => tracing::debug!(session, owner_uid = notice.owner_uid, event = ?notice.event, "session signal emitted"),
            Err(e) => tracing::error!(session, error = %e, "failed to emit session signal"),
        }
    }
}
