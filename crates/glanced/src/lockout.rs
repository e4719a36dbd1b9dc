use std::collections::HashMap;
use std::time::{Duration, Instant};

struct CallerRecord {
    blocks: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

impl CallerRecord {
    fn fresh(now: Instant) -> Self {
        Self {
            blocks: 0,
            window_start: now,
            locked_until: None,
        }
    }
}

/// Per-caller lockout after repeated spoof blocks.
///
/// After `max_blocks` sessions owned by the same caller end in a suspicion
/// block within `window`, that caller may not start new sessions for
/// `lockout`. Face loss, resets and engine errors are never counted; only a
/// blocked session increments the counter. A completed session clears it.
pub struct SpoofLockout {
    records: HashMap<u32, CallerRecord>,
    max_blocks: u32,
    window: Duration,
    lockout: Duration,
}

impl SpoofLockout {
    pub fn new(max_blocks: u32, window: Duration, lockout: Duration) -> Self {
        Self {
            records: HashMap::new(),
            max_blocks: max_blocks.max(1),
            window,
            lockout,
        }
    }

    /// Return `Ok(())` if the caller may start a session.
    /// Return `Err(message)` while the caller is locked out.
    pub fn check(&mut self, uid: u32) -> Result<(), String> {
        self.check_at(uid, Instant::now())
    }

    fn check_at(&mut self, uid: u32, now: Instant) -> Result<(), String> {
        let Some(record) = self.records.get(&uid) else {
            return Ok(());
        };

        if let Some(locked_until) = record.locked_until {
            if now < locked_until {
                let remaining = locked_until.duration_since(now).as_secs();
                return Err(format!(
                    "too many spoof-blocked sessions; try again in {remaining}s"
                ));
            }
            // Lockout expired
            self.records.remove(&uid);
        } else if now.duration_since(record.window_start) >= self.window {
            self.records.remove(&uid);
        }

        Ok(())
    }

    /// Record a blocked session. May trigger a lockout.
    pub fn record_block(&mut self, uid: u32) {
        self.record_block_at(uid, Instant::now());
    }

    fn record_block_at(&mut self, uid: u32, now: Instant) {
        let record = self
            .records
            .entry(uid)
            .or_insert_with(|| CallerRecord::fresh(now));

        if record.locked_until.is_none() && now.duration_since(record.window_start) >= self.window {
            *record = CallerRecord::fresh(now);
        }

        record.blocks += 1;
        if record.blocks >= self.max_blocks {
            record.locked_until = Some(now + self.lockout);
            tracing::warn!(
                uid,
                blocks = record.blocks,
                lockout_secs = self.lockout.as_secs(),
                "spoof lockout triggered"
            );
        } else {
            tracing::debug!(
                uid,
                blocks = record.blocks,
                max = self.max_blocks,
                "session blocked, incrementing caller counter"
            );
        }
    }

    /// Record a completed session and clear the caller's counter.
    pub fn record_success(&mut self, uid: u32) {
        self.records.remove(&uid);
    }
}
