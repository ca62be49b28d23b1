//! Scenario tests for the monitor, driven through the public API with a manual clock

use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use volwatch::{
    Baseline, Instrument, Intensity, ManualClock, Monitor, MonitorBuilder, RuleRequest,
    RuleToggles, SymbolSnapshot, Tick, WindowConfig,
};

const TOKEN: &str = "101";

fn scenario_baseline() -> Baseline {
    Baseline {
        daily_mean: Some(1_000_000.0),
        daily_std_dev: Some(100_000.0),
        prev_day_volume: Some(2_000_000.0),
        weekly_avg_volume: Some(1_800_000.0),
        monthly_avg_volume: Some(1_500_000.0),
        ..Default::default()
    }
}

/// Monitor for symbol X over a 09:15-10:15 window, clock at `hh:mm` on 2024-03-04
fn monitor_at(hour: u32, minute: u32) -> (Monitor, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at((2024, 3, 4), (hour, minute, 0)));
    let monitor = MonitorBuilder::new()
        .clock(clock.clone())
        .window(WindowConfig::parse("09:15", "10:15").unwrap())
        .instruments(vec![
            Instrument::new("X", TOKEN, "NSECM"),
            Instrument::new("Y", "202", "NSECM"),
        ])
        .baselines(HashMap::from([("X".to_string(), scenario_baseline())]))
        .build()
        .unwrap();
    (monitor, clock)
}

fn tick(monitor: &Monitor, clock: &ManualClock, hour: u32, minute: u32, cumulative: u64) {
    clock.set_time(hour, minute, 0);
    monitor.process_tick(&Tick::new(TOKEN, cumulative)).unwrap();
}

fn snapshot_of(monitor: &Monitor, symbol: &str) -> SymbolSnapshot {
    monitor
        .snapshot()
        .into_iter()
        .find(|s| s.symbol == symbol)
        .unwrap()
}

fn count_logs(monitor: &Monitor, needle: &str) -> usize {
    monitor
        .logs()
        .iter()
        .filter(|e| e.message.contains(needle))
        .count()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ACCUMULATION
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[test]
fn test_window_volume_sums_in_window_deltas() {
    let (monitor, clock) = monitor_at(9, 0);

    tick(&monitor, &clock, 9, 5, 1_000); // pre-open, first tick
    tick(&monitor, &clock, 9, 10, 1_200); // before window: delta not counted
    tick(&monitor, &clock, 9, 20, 1_500); // +300
    tick(&monitor, &clock, 9, 40, 1_500); // +0
    tick(&monitor, &clock, 10, 15, 2_000); // +500, end is inclusive
    tick(&monitor, &clock, 10, 30, 9_000); // after window

    let x = snapshot_of(&monitor, "X");
    assert_eq!(x.live_volume, 9_000);
    assert_eq!(x.window_volume, 800);
}

#[test]
fn test_reset_to_lower_contributes_nothing() {
    let (monitor, clock) = monitor_at(9, 20);

    tick(&monitor, &clock, 9, 20, 50_000);
    tick(&monitor, &clock, 9, 21, 60_000);

    clock.set_time(9, 22, 0);
    let outcome = monitor.process_tick(&Tick::new(TOKEN, 100)).unwrap();
    assert_eq!(outcome.delta, 0);
    assert_eq!(outcome.window_volume, 10_000);

    clock.set_time(9, 23, 0);
    let outcome = monitor.process_tick(&Tick::new(TOKEN, 400)).unwrap();
    assert_eq!(outcome.delta, 300);
    assert_eq!(outcome.window_volume, 10_300);
    assert_eq!(monitor.ingest_stats().discontinuities, 1);
}

#[test]
fn test_unknown_token_leaves_others_alone() {
    let (monitor, clock) = monitor_at(9, 20);
    tick(&monitor, &clock, 9, 20, 10);

    assert!(monitor.process_tick(&Tick::new("999", 5_000)).is_err());

    let x = snapshot_of(&monitor, "X");
    assert_eq!(x.live_volume, 10);
    assert_eq!(monitor.ingest_stats().unknown_tokens, 1);
    assert_eq!(monitor.ingest_stats().ticks_applied, 1);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SPIKE DETECTION
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[test]
fn test_z_one_and_a_half_is_high_without_alert() {
    let (monitor, clock) = monitor_at(9, 15);

    tick(&monitor, &clock, 9, 15, 3_000_000);
    tick(&monitor, &clock, 9, 45, 3_650_000);

    let x = snapshot_of(&monitor, "X");
    assert_eq!(x.window_volume, 650_000);
    assert_eq!(x.z_score, Some(1.5));
    assert_eq!(x.intensity, Intensity::High);
    assert!(!x.auto_alert_fired);
    assert_eq!(count_logs(&monitor, "UNUSUAL VOLUME"), 0);
}

#[test]
fn test_spike_fires_once_per_window() {
    let (monitor, clock) = monitor_at(9, 15);

    tick(&monitor, &clock, 9, 15, 3_000_000);
    tick(&monitor, &clock, 9, 45, 3_850_000);

    let x = snapshot_of(&monitor, "X");
    assert_eq!(x.z_score, Some(3.5));
    assert_eq!(x.intensity, Intensity::VeryHigh);
    assert!(x.auto_alert_fired);
    assert_eq!(x.status, "ALERT");

    tick(&monitor, &clock, 9, 46, 3_900_000);
    let x = snapshot_of(&monitor, "X");
    assert!(x.z_score.unwrap() > 3.8);

    assert_eq!(count_logs(&monitor, "UNUSUAL VOLUME"), 1);
    assert_eq!(monitor.ingest_stats().alerts_emitted, 1);
}

#[test]
fn test_concurrent_ticks_fire_spike_once() {
    for _ in 0..20 {
        let (monitor, clock) = monitor_at(9, 45);
        let monitor = Arc::new(monitor);
        tick(&monitor, &clock, 9, 45, 0);

        // every delta above the reference pushes z far past the alert threshold
        let workers: Vec<_> = (0..8u64)
            .map(|t| {
                let monitor = monitor.clone();
                std::thread::spawn(move || {
                    for i in 0..200u64 {
                        let cumulative = 1_000_000 + i * 1_000 + t;
                        monitor.process_tick(&Tick::new(TOKEN, cumulative)).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(snapshot_of(&monitor, "X").auto_alert_fired);
        assert_eq!(count_logs(&monitor, "UNUSUAL VOLUME"), 1);
        assert_eq!(monitor.ingest_stats().alerts_emitted, 1);
    }
}

#[test]
fn test_unusable_baseline_returns_to_waiting() {
    let (monitor, clock) = monitor_at(9, 15);
    tick(&monitor, &clock, 9, 15, 0);
    tick(&monitor, &clock, 9, 45, 650_000);
    assert_eq!(snapshot_of(&monitor, "X").intensity, Intensity::High);

    assert!(monitor.set_baseline(
        "X",
        Baseline {
            daily_mean: None,
            ..scenario_baseline()
        }
    ));
    tick(&monitor, &clock, 9, 46, 660_000);

    let x = snapshot_of(&monitor, "X");
    assert_eq!(x.z_score, None);
    assert_eq!(x.intensity, Intensity::Waiting);
}

#[test]
fn test_waiting_before_window_opens() {
    let (monitor, clock) = monitor_at(9, 0);
    tick(&monitor, &clock, 9, 1, 3_000_000);

    let x = snapshot_of(&monitor, "X");
    assert_eq!(x.intensity, Intensity::Waiting);
    assert_eq!(x.z_score, None);
}

#[test]
fn test_missing_baseline_stays_unscored() {
    let (monitor, clock) = monitor_at(9, 20);
    clock.set_time(9, 30, 0);
    monitor.process_tick(&Tick::new("202", 1)).unwrap();
    monitor.process_tick(&Tick::new("202", 90_000_000)).unwrap();

    let y = snapshot_of(&monitor, "Y");
    assert_eq!(y.z_score, None);
    assert_eq!(y.status, "BELOW AVERAGES");
    assert!(!y.auto_alert_fired);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// USER RULES
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[test]
fn test_prev_day_rule_triggers_exactly_once() {
    let (monitor, clock) = monitor_at(11, 0);
    monitor
        .add_rule(RuleRequest::new("X", ">", "PREV_DAY", None))
        .unwrap();

    tick(&monitor, &clock, 11, 0, 2_000_000);
    assert_eq!(count_logs(&monitor, "USER ALERT TRIGGERED"), 0);

    tick(&monitor, &clock, 11, 1, 2_000_001);
    tick(&monitor, &clock, 11, 2, 2_500_000);
    tick(&monitor, &clock, 11, 3, 3_000_000);

    assert_eq!(count_logs(&monitor, "USER ALERT TRIGGERED"), 1);
    let rules = monitor.list_rules();
    assert!(rules[0].triggered);
    assert!(snapshot_of(&monitor, "X").user_alert_active);
}

#[test]
fn test_readding_rule_allows_retrigger() {
    let (monitor, clock) = monitor_at(11, 0);
    let id = monitor
        .add_rule(RuleRequest::new("X", ">", "FIXED", Some(1_000.0)))
        .unwrap();

    tick(&monitor, &clock, 11, 0, 500);
    tick(&monitor, &clock, 11, 1, 1_500);
    // feed reset, then back above the threshold
    tick(&monitor, &clock, 11, 2, 400);
    tick(&monitor, &clock, 11, 3, 1_600);
    assert_eq!(count_logs(&monitor, "USER ALERT TRIGGERED"), 1);

    assert!(monitor.remove_rule(id));
    assert!(!snapshot_of(&monitor, "X").user_alert_active);

    monitor
        .add_rule(RuleRequest::new("X", ">", "FIXED", Some(1_000.0)))
        .unwrap();
    assert_eq!(count_logs(&monitor, "USER ALERT TRIGGERED"), 2);
}

#[test]
fn test_toggles_suppress_without_consuming() {
    let (monitor, clock) = monitor_at(11, 0);
    monitor.set_toggles(RuleToggles {
        above_weekly_avg: false,
        ..Default::default()
    });
    monitor
        .add_rule(RuleRequest::new("X", ">=", "MULTIPLIER_WEEKLY", Some(1.0)))
        .unwrap();

    tick(&monitor, &clock, 11, 0, 1_900_000);
    assert_eq!(count_logs(&monitor, "USER ALERT TRIGGERED"), 0);
    assert!(!monitor.list_rules()[0].triggered);

    monitor.set_toggles(RuleToggles::default());
    tick(&monitor, &clock, 11, 1, 1_900_001);
    assert_eq!(count_logs(&monitor, "USER ALERT TRIGGERED"), 1);
}

#[test]
fn test_invalid_rule_requests() {
    let (monitor, _) = monitor_at(11, 0);
    assert!(monitor.add_rule(RuleRequest::new("X", "<", "FIXED", Some(1.0))).is_err());
    assert!(monitor.add_rule(RuleRequest::new("X", ">", "FIXED", None)).is_err());
    assert!(monitor.add_rule(RuleRequest::new("X", ">", "YEARLY", None)).is_err());
    assert!(monitor.add_rule(RuleRequest::new("NOPE", ">", "PREV_DAY", None)).is_err());
    assert!(monitor.list_rules().is_empty());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WINDOW & SESSION
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[test]
fn test_window_reset_at_market_open_zeroes_volume() {
    let (monitor, clock) = monitor_at(9, 0);
    tick(&monitor, &clock, 9, 5, 1_000);
    tick(&monitor, &clock, 9, 20, 50_000);
    tick(&monitor, &clock, 9, 30, 90_000);
    assert_eq!(snapshot_of(&monitor, "X").window_volume, 89_000);

    clock.set_time(9, 40, 0);
    monitor.set_window_str("09:15", "10:15").unwrap();

    for snapshot in monitor.snapshot() {
        assert_eq!(snapshot.window_volume, 0);
        assert!(!snapshot.auto_alert_fired);
    }
    assert_eq!(count_logs(&monitor, "TIME WINDOW SET: 09:15 → 10:15"), 1);
}

#[test]
fn test_narrowed_window_keeps_accrued_volume() {
    let (monitor, clock) = monitor_at(9, 15);
    tick(&monitor, &clock, 9, 15, 10_000);
    tick(&monitor, &clock, 9, 19, 12_000);
    tick(&monitor, &clock, 9, 30, 20_000);

    clock.set_time(9, 40, 0);
    monitor.set_window_str("09:20", "10:20").unwrap();
    // everything after the 09:19 sample
    assert_eq!(snapshot_of(&monitor, "X").window_volume, 8_000);

    tick(&monitor, &clock, 9, 41, 21_000);
    assert_eq!(snapshot_of(&monitor, "X").window_volume, 9_000);
}

#[test]
fn test_day_rollover_clears_session_fields_only() {
    let (monitor, clock) = monitor_at(9, 15);
    monitor
        .add_rule(RuleRequest::new("X", ">", "FIXED", Some(10.0)))
        .unwrap();
    tick(&monitor, &clock, 9, 15, 3_000_000);
    tick(&monitor, &clock, 9, 45, 3_850_000);
    assert!(snapshot_of(&monitor, "X").auto_alert_fired);

    clock.advance(Duration::days(1));
    clock.set_time(9, 10, 0);
    assert!(monitor.check_session());
    assert!(!monitor.check_session());

    let x = snapshot_of(&monitor, "X");
    assert_eq!(x.window_volume, 0);
    assert_eq!(x.z_score, None);
    assert!(!x.auto_alert_fired);
    assert_eq!(x.baseline, Some(scenario_baseline()));
    assert!(x.user_alert_active);
    assert_eq!(monitor.list_rules().len(), 1);
    assert_eq!(count_logs(&monitor, "NEW SESSION: 2024-03-05"), 1);

    // a fresh session starts from the next cumulative value
    tick(&monitor, &clock, 9, 15, 40_000);
    tick(&monitor, &clock, 9, 16, 41_000);
    assert_eq!(snapshot_of(&monitor, "X").window_volume, 1_000);
}

#[test]
fn test_rollover_detected_lazily_on_tick() {
    let (monitor, clock) = monitor_at(9, 15);
    tick(&monitor, &clock, 9, 15, 100);
    tick(&monitor, &clock, 9, 20, 700);

    clock.advance(Duration::days(1));
    clock.set_time(9, 16, 0);
    let outcome = monitor.process_tick(&Tick::new(TOKEN, 50)).unwrap();
    assert_eq!(outcome.delta, 0);
    assert_eq!(outcome.window_volume, 0);
}

#[test]
fn test_stale_flag_inside_window() {
    let (monitor, clock) = monitor_at(9, 20);
    tick(&monitor, &clock, 9, 20, 100);

    clock.set_time(9, 21, 0);
    assert!(!snapshot_of(&monitor, "X").stale);
    clock.set_time(9, 23, 0);
    assert!(snapshot_of(&monitor, "X").stale);
    // never ticked
    assert!(snapshot_of(&monitor, "Y").stale);

    clock.set_time(11, 0, 0);
    assert!(!snapshot_of(&monitor, "X").stale);
}

#[test]
fn test_log_is_bounded() {
    let clock = Arc::new(ManualClock::at((2024, 3, 4), (9, 20, 0)));
    let monitor = MonitorBuilder::new()
        .clock(clock)
        .log_capacity(3)
        .instruments(vec![Instrument::new("X", TOKEN, "NSECM")])
        .build()
        .unwrap();

    for minute in 20..30 {
        monitor
            .set_window_str(&format!("09:{}", minute), "10:00")
            .unwrap();
    }
    let logs = monitor.logs();
    assert_eq!(logs.len(), 3);
    assert_eq!(logs[2].message, "TIME WINDOW SET: 09:29 → 10:00");
}
