use lan_monitor_rs::timeseries::{LatencyTimeSeries, SessionState, TraceSession};
use lan_monitor_rs::traceroute::TraceHop;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

fn t0() -> OffsetDateTime {
    datetime!(2024-06-01 08:00:00 UTC)
}

fn series_every_10s(count: i64) -> LatencyTimeSeries {
    let mut ts = LatencyTimeSeries::new();
    for i in 0..count {
        ts.add_sample_at(t0() + Duration::seconds(i * 10), (i + 1) as f64);
    }
    ts
}

#[test]
fn live_view_tracks_window() {
    // 30 samples over 290 s; the default one minute window sees 60 s of them.
    let mut ts = series_every_10s(30);
    let now = t0() + Duration::seconds(290);
    ts.refresh_at(now);
    assert!(ts.is_live());
    assert_eq!(ts.filtered().len(), 7);

    ts.set_window_minutes_at(5, now);
    assert_eq!(ts.filtered().len(), 30);
    ts.set_window_minutes_at(0, now);
    assert_eq!(ts.window_minutes(), 1);
}

#[test]
fn pan_near_now_snaps_to_live() {
    let mut ts = series_every_10s(30);
    let now = t0() + Duration::seconds(290);

    ts.pan_to_at(now - Duration::seconds(120), now);
    assert!(!ts.is_live());
    assert_eq!(ts.view_end_at(now), now - Duration::seconds(120));

    ts.pan_to_at(now - Duration::seconds(3), now);
    assert!(ts.is_live());
    assert_eq!(ts.view_end_at(now), now);

    ts.pan_to_at(now - Duration::seconds(120), now);
    ts.reset_to_live_at(now);
    assert!(ts.is_live());
}

#[test]
fn filtered_samples_stay_in_window_and_ordered() {
    let mut ts = series_every_10s(30);
    let now = t0() + Duration::seconds(290);
    ts.pan_to_at(t0() + Duration::seconds(150), now);
    let start = ts.view_start_at(now);
    let end = ts.view_end_at(now);
    let view = ts.filtered();
    assert!(!view.is_empty());
    assert!(view.iter().all(|s| s.at >= start && s.at <= end));
    assert!(view.windows(2).all(|w| w[0].at <= w[1].at));
}

#[test]
fn session_view_serializes() {
    let mut session = TraceSession::new("gateway.lan");
    session.hops.push(TraceHop::new(1));
    session.mark_started(t0());
    session.series.add_sample_at(t0() + Duration::seconds(1), 12.0);
    session.series.add_sample_at(t0() + Duration::seconds(2), -1.0);
    session.tick(t0() + Duration::seconds(65));

    let view = session.view_at(t0() + Duration::seconds(65));
    assert_eq!(view.state, SessionState::Running);
    assert_eq!(view.elapsed, "00:01:05");
    assert_eq!(view.packet_loss, 50.0);

    let json = serde_json::to_value(&view).unwrap();
    assert_eq!(json["destination"], "gateway.lan");
    assert_eq!(json["state"], "running");
    assert_eq!(json["window_minutes"], 1);
    assert_eq!(json["samples"].as_array().map(Vec::len), Some(2));
    assert_eq!(json["hops"][0]["hop"], 1);
    assert_eq!(json["view_end"], "2024-06-01T08:01:05Z");
}

#[test]
fn restart_resets_elapsed_but_keeps_history() {
    let mut session = TraceSession::new("10.0.0.1");
    session.mark_started(t0());
    session.series.add_sample_at(t0() + Duration::seconds(1), 3.0);
    session.mark_stopped(t0() + Duration::seconds(30));
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(session.elapsed(), Duration::seconds(30));

    session.mark_started(t0() + Duration::seconds(40));
    assert_eq!(session.elapsed(), Duration::ZERO);
    assert_eq!(session.series.len(), 1);
}

#[test]
fn pinned_window_selects_exact_samples() {
    let mut ts = LatencyTimeSeries::new();
    for s in [0, 30, 90, 150] {
        ts.add_sample_at(t0() + Duration::seconds(s), s as f64 + 1.0);
    }
    let now = t0() + Duration::seconds(300);
    ts.pan_to_at(t0() + Duration::seconds(150), now);
    let at: Vec<OffsetDateTime> = ts.filtered().iter().map(|s| s.at).collect();
    assert_eq!(
        at,
        vec![t0() + Duration::seconds(90), t0() + Duration::seconds(150)]
    );
}

#[test]
fn pan_within_five_seconds_is_live() {
    let mut ts = series_every_10s(10);
    let now = t0() + Duration::seconds(95);
    for back in [0, 1, 4] {
        ts.pan_to_at(now - Duration::seconds(back), now);
        assert!(ts.is_live(), "{back}s back");
    }
    ts.pan_to_at(now + Duration::minutes(3), now);
    assert!(ts.is_live());
}
