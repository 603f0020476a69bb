//! Latency history for monitored destinations and the chart view over it.
//!
//! Everything that depends on the current time has an `_at` variant taking
//! `now` explicitly; the plain methods read the wall clock.

use crate::traceroute::TraceHop;
use serde::Serialize;
use std::collections::VecDeque;
use time::{Duration, OffsetDateTime};

/// Samples older than this are dropped.
pub const RETENTION: Duration = Duration::hours(2);
/// A pan this close to now snaps back to live.
pub const LIVE_SNAP: Duration = Duration::seconds(5);
pub const DEFAULT_WINDOW_MINUTES: u32 = 1;
/// Latency recorded for an unanswered probe.
pub const TIMEOUT_LATENCY: f64 = -1.0;

const LATENCY_AXIS_FLOOR: f64 = 100.0;
const SECONDS_LABEL_MAX_WINDOW: u32 = 10;

/// Wall clock in the local offset, UTC when the offset can't be determined.
pub fn local_now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct LatencySample {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub latency_ms: f64,
}

impl LatencySample {
    pub fn is_timeout(&self) -> bool {
        self.latency_ms < 0.0
    }
}

/// Chart axis labels for the visible window.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AxisLabels {
    pub start: String,
    pub mid: String,
    pub end: String,
}

/// Bounded latency history plus a windowed view over it.
///
/// The view ends either at "now" (live) or at a pinned instant (panned).
/// The filtered slice is recomputed whenever the history, window or
/// anchor changes, unless the view is paused.
#[derive(Debug, Clone)]
pub struct LatencyTimeSeries {
    history: VecDeque<LatencySample>,
    window_minutes: u32,
    pinned_end: Option<OffsetDateTime>,
    paused: bool,
    filtered: Vec<LatencySample>,
}

impl Default for LatencyTimeSeries {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyTimeSeries {
    pub fn new() -> Self {
        Self {
            history: VecDeque::new(),
            window_minutes: DEFAULT_WINDOW_MINUTES,
            pinned_end: None,
            paused: false,
            filtered: Vec::new(),
        }
    }

    pub fn add_sample(&mut self, latency_ms: f64) {
        self.add_sample_at(local_now(), latency_ms);
    }

    /// Append a sample taken at `at` and drop everything older than
    /// [`RETENTION`] relative to it. Negative latencies are stored as
    /// [`TIMEOUT_LATENCY`].
    pub fn add_sample_at(&mut self, at: OffsetDateTime, latency_ms: f64) {
        let latency_ms = if latency_ms >= 0.0 {
            latency_ms
        } else {
            TIMEOUT_LATENCY
        };
        self.history.push_back(LatencySample { at, latency_ms });

        let horizon = at - RETENTION;
        while self.history.front().is_some_and(|s| s.at < horizon) {
            self.history.pop_front();
        }
        self.refresh_at(at);
    }

    pub fn window_minutes(&self) -> u32 {
        self.window_minutes
    }

    pub fn set_window_minutes(&mut self, minutes: u32) {
        self.set_window_minutes_at(minutes, local_now());
    }

    pub fn set_window_minutes_at(&mut self, minutes: u32, now: OffsetDateTime) {
        self.window_minutes = minutes.max(1);
        self.refresh_at(now);
    }

    fn window(&self) -> Duration {
        Duration::minutes(i64::from(self.window_minutes))
    }

    pub fn pan_to(&mut self, end: OffsetDateTime) {
        self.pan_to_at(end, local_now());
    }

    /// Pin the view end to `end`.
    ///
    /// Requests within [`LIVE_SNAP`] of `now` (or later) return to live
    /// mode. Otherwise the end is clamped so the window never starts before
    /// the oldest sample and never ends after `now`.
    pub fn pan_to_at(&mut self, end: OffsetDateTime, now: OffsetDateTime) {
        if now - end < LIVE_SNAP {
            self.reset_to_live_at(now);
            return;
        }
        let mut end = end;
        if let Some(oldest) = self.history.front() {
            let earliest_end = oldest.at + self.window();
            if end < earliest_end {
                end = earliest_end;
            }
        }
        if end > now {
            end = now;
        }
        self.pinned_end = Some(end);
        self.refresh_at(now);
    }

    pub fn reset_to_live(&mut self) {
        self.reset_to_live_at(local_now());
    }

    pub fn reset_to_live_at(&mut self, now: OffsetDateTime) {
        self.pinned_end = None;
        self.refresh_at(now);
    }

    pub fn is_live(&self) -> bool {
        self.pinned_end.is_none()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Freeze the filtered slice. Unpausing recomputes it.
    pub fn set_paused_at(&mut self, paused: bool, now: OffsetDateTime) {
        self.paused = paused;
        if !paused {
            self.refresh_at(now);
        }
    }

    pub fn view_end_at(&self, now: OffsetDateTime) -> OffsetDateTime {
        self.pinned_end.unwrap_or(now)
    }

    pub fn view_start_at(&self, now: OffsetDateTime) -> OffsetDateTime {
        self.view_end_at(now) - self.window()
    }

    /// Recompute the visible slice `[view_end - window, view_end]`.
    pub fn refresh_at(&mut self, now: OffsetDateTime) {
        if self.paused {
            return;
        }
        let end = self.view_end_at(now);
        let start = end - self.window();
        self.filtered = self
            .history
            .iter()
            .filter(|s| s.at >= start && s.at <= end)
            .copied()
            .collect();
    }

    pub fn history(&self) -> impl Iterator<Item = &LatencySample> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn filtered(&self) -> &[LatencySample] {
        &self.filtered
    }

    /// Upper bound for the latency axis, never below 100 ms.
    pub fn max_latency(&self) -> f64 {
        self.filtered
            .iter()
            .map(|s| s.latency_ms)
            .fold(LATENCY_AXIS_FLOOR, f64::max)
    }

    /// Mean of the answered samples in view, 0 when there are none.
    pub fn average_latency(&self) -> f64 {
        let answered: Vec<f64> = self
            .filtered
            .iter()
            .filter(|s| !s.is_timeout())
            .map(|s| s.latency_ms)
            .collect();
        if answered.is_empty() {
            return 0.0;
        }
        answered.iter().sum::<f64>() / answered.len() as f64
    }

    /// Percentage of samples in view that timed out.
    pub fn packet_loss(&self) -> f64 {
        if self.filtered.is_empty() {
            return 0.0;
        }
        let lost = self.filtered.iter().filter(|s| s.is_timeout()).count();
        lost as f64 / self.filtered.len() as f64 * 100.0
    }

    /// Start / middle / end labels of the visible window. Windows of up to
    /// ten minutes show seconds.
    pub fn axis_labels_at(&self, now: OffsetDateTime) -> AxisLabels {
        let end = self.view_end_at(now);
        let start = end - self.window();
        let mid = start + self.window() / 2_i32;
        let with_seconds = self.window_minutes <= SECONDS_LABEL_MAX_WINDOW;
        AxisLabels {
            start: clock_label(start, with_seconds),
            mid: clock_label(mid, with_seconds),
            end: clock_label(end, with_seconds),
        }
    }
}

fn clock_label(t: OffsetDateTime, with_seconds: bool) -> String {
    if with_seconds {
        format!("{:02}:{:02}:{:02}", t.hour(), t.minute(), t.second())
    } else {
        format!("{:02}:{:02}", t.hour(), t.minute())
    }
}

/// `HH:MM:SS`, hours not wrapping at 24.
pub fn format_elapsed(d: Duration) -> String {
    let secs = d.whole_seconds().max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Stopped,
    Running,
}

/// One monitored destination: its hop list and latency history.
#[derive(Debug, Clone)]
pub struct TraceSession {
    pub destination: String,
    state: SessionState,
    started_at: Option<OffsetDateTime>,
    elapsed: Duration,
    pub hops: Vec<TraceHop>,
    pub series: LatencyTimeSeries,
}

impl TraceSession {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            state: SessionState::Stopped,
            started_at: None,
            elapsed: Duration::ZERO,
            hops: Vec::new(),
            series: LatencyTimeSeries::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    pub fn started_at(&self) -> Option<OffsetDateTime> {
        self.started_at
    }

    /// Enter the running state. The elapsed clock restarts from zero.
    pub fn mark_started(&mut self, now: OffsetDateTime) {
        self.state = SessionState::Running;
        self.started_at = Some(now);
        self.elapsed = Duration::ZERO;
        self.series.set_paused_at(false, now);
    }

    pub fn mark_stopped(&mut self, now: OffsetDateTime) {
        if self.is_running() {
            self.tick(now);
        }
        self.state = SessionState::Stopped;
    }

    /// Advance the elapsed clock while running; frozen once stopped.
    pub fn tick(&mut self, now: OffsetDateTime) -> Duration {
        if let (SessionState::Running, Some(start)) = (self.state, self.started_at) {
            self.elapsed = now - start;
        }
        self.elapsed
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn elapsed_display(&self) -> String {
        format_elapsed(self.elapsed)
    }

    /// Serializable snapshot of the session as seen at `now`.
    pub fn view_at(&self, now: OffsetDateTime) -> SessionView {
        let s = &self.series;
        SessionView {
            destination: self.destination.clone(),
            state: self.state,
            elapsed: self.elapsed_display(),
            live: s.is_live(),
            paused: s.is_paused(),
            window_minutes: s.window_minutes(),
            view_start: s.view_start_at(now),
            view_end: s.view_end_at(now),
            axis: s.axis_labels_at(now),
            max_latency: s.max_latency(),
            average_latency: s.average_latency(),
            packet_loss: s.packet_loss(),
            hops: self.hops.clone(),
            samples: s.filtered().to_vec(),
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct SessionView {
    pub destination: String,
    pub state: SessionState,
    pub elapsed: String,
    pub live: bool,
    pub paused: bool,
    pub window_minutes: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub view_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub view_end: OffsetDateTime,
    pub axis: AxisLabels,
    pub max_latency: f64,
    pub average_latency: f64,
    pub packet_loss: f64,
    pub hops: Vec<TraceHop>,
    pub samples: Vec<LatencySample>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn t0() -> OffsetDateTime {
        datetime!(2024-05-01 12:00:00 UTC)
    }

    #[test]
    fn retention_prunes_old_samples() {
        let mut ts = LatencyTimeSeries::new();
        ts.add_sample_at(t0(), 10.0);
        ts.add_sample_at(t0() + Duration::minutes(90), 11.0);
        ts.add_sample_at(t0() + Duration::minutes(121), 12.0);
        let kept: Vec<f64> = ts.history().map(|s| s.latency_ms).collect();
        assert_eq!(kept, vec![11.0, 12.0]);
    }

    #[test]
    fn stats_over_filtered_slice() {
        let mut ts = LatencyTimeSeries::new();
        ts.add_sample_at(t0(), 20.0);
        ts.add_sample_at(t0() + Duration::seconds(1), -7.0);
        ts.add_sample_at(t0() + Duration::seconds(2), 40.0);
        ts.add_sample_at(t0() + Duration::seconds(3), -1.0);
        assert_eq!(ts.filtered().len(), 4);
        assert_eq!(ts.filtered()[1].latency_ms, TIMEOUT_LATENCY);
        assert_eq!(ts.average_latency(), 30.0);
        assert_eq!(ts.packet_loss(), 50.0);
        assert_eq!(ts.max_latency(), 100.0);
        ts.add_sample_at(t0() + Duration::seconds(4), 250.0);
        assert_eq!(ts.max_latency(), 250.0);
    }

    #[test]
    fn empty_view_stats() {
        let ts = LatencyTimeSeries::new();
        assert_eq!(ts.average_latency(), 0.0);
        assert_eq!(ts.packet_loss(), 0.0);
        assert_eq!(ts.max_latency(), 100.0);
    }

    #[test]
    fn pan_clamps_to_history_and_now() {
        let mut ts = LatencyTimeSeries::new();
        for s in [0, 60, 120, 180, 240, 300] {
            ts.add_sample_at(t0() + Duration::seconds(s), 5.0);
        }
        let now = t0() + Duration::seconds(300);

        ts.pan_to_at(t0() - Duration::minutes(10), now);
        assert!(!ts.is_live());
        assert_eq!(ts.view_end_at(now), t0() + Duration::minutes(1));

        ts.pan_to_at(t0() + Duration::seconds(180), now);
        assert_eq!(ts.view_end_at(now), t0() + Duration::seconds(180));
        assert_eq!(ts.filtered().len(), 2);
    }

    #[test]
    fn pause_freezes_view() {
        let mut ts = LatencyTimeSeries::new();
        ts.add_sample_at(t0(), 5.0);
        ts.set_paused_at(true, t0());
        ts.add_sample_at(t0() + Duration::seconds(1), 6.0);
        assert_eq!(ts.filtered().len(), 1);
        assert_eq!(ts.len(), 2);
        ts.set_paused_at(false, t0() + Duration::seconds(1));
        assert_eq!(ts.filtered().len(), 2);
    }

    #[test]
    fn axis_label_format_follows_window() {
        let mut ts = LatencyTimeSeries::new();
        let now = datetime!(2024-05-01 12:10:30 UTC);
        ts.set_window_minutes_at(10, now);
        let labels = ts.axis_labels_at(now);
        assert_eq!(labels.start, "12:00:30");
        assert_eq!(labels.mid, "12:05:30");
        assert_eq!(labels.end, "12:10:30");

        ts.set_window_minutes_at(60, now);
        let labels = ts.axis_labels_at(now);
        assert_eq!(labels.start, "11:10");
        assert_eq!(labels.mid, "11:40");
        assert_eq!(labels.end, "12:10");
    }

    #[test]
    fn elapsed_clock() {
        let mut session = TraceSession::new("example.org");
        assert_eq!(session.elapsed_display(), "00:00:00");
        session.mark_started(t0());
        session.tick(t0() + Duration::seconds(3_725));
        assert_eq!(session.elapsed_display(), "01:02:05");
        session.mark_stopped(t0() + Duration::seconds(3_726));
        session.tick(t0() + Duration::hours(5));
        assert_eq!(session.elapsed_display(), "01:02:06");
        assert_eq!(format_elapsed(Duration::hours(26)), "26:00:00");
    }
}
