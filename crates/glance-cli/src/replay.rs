//! `glance replay` — drive a session offline from a recorded landmark trace.
//!
//! A trace is JSON Lines: one [`FramePayload`] per line, each with a
//! mandatory `timestamp_ms`. Blank lines and lines starting with `#` are
//! skipped. The stabilization deadline is polled against the trace clock
//! before every frame, so replays are deterministic.

use std::io::BufRead;
use std::path::Path;

use anyhow::{bail, Context, Result};
use glance_core::{ChallengePlan, FramePayload, LivenessConfig, Session, SessionEvent, Snapshot};
use serde::Serialize;

/// A point in the trace where the phase or instruction changed, or the
/// session reported an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayStep {
    pub line: usize,
    pub timestamp_ms: u64,
    pub phase: String,
    pub instruction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayReport {
    pub frames: usize,
    pub steps: Vec<ReplayStep>,
    pub result: Snapshot,
}

/// Load a liveness config for replay, or the defaults when `path` is `None`.
pub fn load_config(path: Option<&Path>) -> Result<LivenessConfig> {
    match path {
        Some(path) => LivenessConfig::from_file(path)
            .with_context(|| format!("invalid --config {}", path.display())),
        None => Ok(LivenessConfig::default()),
    }
}

fn event_label(event: SessionEvent) -> Option<&'static str> {
    match event {
        SessionEvent::Entered(_) => None,
        SessionEvent::FaceLost => Some("face_lost"),
        SessionEvent::Completed => Some("completed"),
        SessionEvent::Blocked { .. } => Some("blocked"),
        SessionEvent::Reset => Some("reset"),
    }
}

/// Replay every frame in `reader` through a fresh session.
pub fn replay<R: BufRead>(
    reader: R,
    config: LivenessConfig,
    plan: ChallengePlan,
) -> Result<ReplayReport> {
    let mut session = Session::new(config, plan).context("invalid liveness config")?;
    let mut steps = Vec::new();
    let mut frames = 0;
    let mut last_ts: Option<u64> = None;
    let mut last_seen = (session.phase().name(), session.instruction().to_string());

    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.with_context(|| format!("failed to read trace line {line_no}"))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let payload = FramePayload::from_json(trimmed)
            .with_context(|| format!("malformed frame on line {line_no}"))?;
        let Some(ts) = payload.timestamp_ms else {
            bail!("frame on line {line_no} has no timestamp_ms");
        };
        if last_ts.is_some_and(|prev| ts < prev) {
            bail!("timestamp on line {line_no} goes backwards ({ts}ms)");
        }
        last_ts = Some(ts);
        frames += 1;

        let fired = session.poll_deadline(ts);
        let outcome = session.on_frame(payload.into_observation(), ts);

        for event in [fired.event, outcome.event].into_iter().flatten() {
            if let Some(label) = event_label(event) {
                steps.push(ReplayStep {
                    line: line_no,
                    timestamp_ms: ts,
                    phase: session.phase().name().to_string(),
                    instruction: session.instruction().to_string(),
                    event: Some(label),
                });
            }
        }

        let seen = (session.phase().name(), session.instruction().to_string());
        if seen != last_seen {
            steps.push(ReplayStep {
                line: line_no,
                timestamp_ms: ts,
                phase: seen.0.to_string(),
                instruction: seen.1.clone(),
                event: None,
            });
            last_seen = seen;
        }
    }

    tracing::debug!(frames, steps = steps.len(), "replay finished");

    Ok(ReplayReport {
        frames,
        steps,
        result: session.snapshot(),
    })
}

/// Human-readable rendering of a report.
pub fn render(report: &ReplayReport) -> String {
    let mut out = String::new();
    for step in &report.steps {
        match step.event {
            Some(event) => out.push_str(&format!(
                "{:>8}ms  line {:<5} [{}]\n",
                step.timestamp_ms, step.line, event
            )),
            None => out.push_str(&format!(
                "{:>8}ms  line {:<5} {:<14} {}\n",
                step.timestamp_ms, step.line, step.phase, step.instruction
            )),
        }
    }
    let result = &report.result;
    out.push_str(&format!(
        "\n{} frames replayed\nphase:      {}\ndone:       {}\nblocked:    {}\nsuspicion:  {}\nready:      {}\n",
        report.frames,
        result.phase,
        result.done,
        result.blocked,
        result.suspicion_score,
        result.ready_to_submit,
    ));
    out
}
