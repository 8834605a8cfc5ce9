//! Integration tests for auto-sequence matching.

use chrono::{DateTime, Duration, TimeZone, Utc};
use machine_timeline_core::autosequence::trim;
use machine_timeline_core::timeline::ReasonAttrs;
use machine_timeline_core::{
    AutoSequence, AutoSequenceMatcher, AutoSequencePeriod, Config, Database, Machine, Scheduler,
    TimeRange,
};
use tokio_util::sync::CancellationToken;

fn t(hours: f64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2015, 11, 13, 0, 0, 0).unwrap()
        + Duration::minutes((hours * 60.0).round() as i64)
}

fn r(begin: f64, end: f64) -> TimeRange {
    TimeRange::new(t(begin), t(end)).unwrap()
}

fn active(begin: f64, end: f64) -> AutoSequencePeriod {
    AutoSequencePeriod::new(r(begin, end), true)
}

fn inactive(begin: f64, end: f64) -> AutoSequencePeriod {
    AutoSequencePeriod::new(r(begin, end), false)
}

fn auto_sequence(id: i64, begin: f64, end: f64) -> AutoSequence {
    AutoSequence {
        id,
        machine_id: 1,
        module_id: 1,
        range: r(begin, end),
        sequence: "auto".into(),
    }
}

#[test]
fn test_trim_scenarios() {
    assert!(trim(&[]).is_empty());
    assert!(trim(&[inactive(1.0, 2.0), inactive(3.0, 4.0)]).is_empty());
    assert_eq!(trim(&[active(1.0, 2.0), active(3.0, 4.0)]).len(), 2);
    assert_eq!(
        trim(&[
            inactive(1.0, 2.0),
            active(2.0, 4.0),
            active(4.0, 5.0),
            inactive(7.0, 8.0),
        ])
        .len(),
        2
    );
}

#[test]
fn test_matcher_walks_the_day() {
    let periods = vec![
        inactive(1.1, 1.2),
        active(2.0, 4.0),
        inactive(4.0, 5.0),
        active(5.0, 6.0),
        active(7.0, 8.0),
        inactive(8.0, 8.5),
        inactive(8.5, 9.0),
        active(9.0, 11.0),
        active(12.0, 13.0),
        active(14.0, 19.0),
    ];
    let auto_sequences = vec![
        auto_sequence(1, 1.0, 3.0),
        auto_sequence(2, 10.0, 15.0),
        auto_sequence(3, 16.0, 17.0),
        auto_sequence(4, 18.0, 20.0),
    ];
    let mut matcher = AutoSequenceMatcher::new(r(2.0, 19.0), periods, auto_sequences, None);

    // (periods, begin, end, eligible, matching ids)
    let expected: [(usize, f64, f64, bool, Vec<i64>); 6] = [
        (1, 1.1, 1.2, false, vec![]),
        (1, 2.0, 4.0, true, vec![1]),
        (1, 4.0, 5.0, false, vec![]),
        (2, 5.0, 8.0, true, vec![]),
        (2, 8.0, 9.0, false, vec![]),
        (3, 9.0, 19.0, true, vec![2, 3, 4]),
    ];
    for (i, (count, begin, end, eligible, ids)) in expected.into_iter().enumerate() {
        let step = matcher.next_periods().unwrap_or_else(|| panic!("step {i} missing"));
        assert_eq!(step.periods.len(), count, "step {i}");
        assert_eq!(step.range(), Some(r(begin, end)), "step {i}");
        assert_eq!(step.auto_sequence(), eligible, "step {i}");
        let matching: Vec<i64> = step.matching.iter().map(|a| a.id).collect();
        assert_eq!(matching, ids, "step {i}");
    }

    assert!(matcher.next_periods().is_none());
    assert!(matcher.next_periods().is_none());
}

#[test]
fn test_pass_tags_reason_slots_with_their_sequence() {
    let db = Database::open_memory().unwrap();
    db.upsert_machine(&Machine {
        id: 1,
        name: "mill".into(),
    })
    .unwrap();
    // Mode 2 supports auto-sequences, mode 1 does not.
    db.insert_fact(1, &r(8.0, 9.0), 2).unwrap();
    db.insert_fact(1, &r(9.0, 10.0), 1).unwrap();
    db.insert_fact(1, &r(10.0, 11.0), 2).unwrap();
    db.insert_auto_sequence(1, 1, &r(8.5, 9.5), "roughing")
        .unwrap();

    let scheduler = Scheduler::open(db, &Config::default()).unwrap();
    scheduler.run_machine(1, &CancellationToken::new());

    assert_eq!(
        reason_tags(&scheduler),
        vec![
            (r(8.0, 8.5), None),
            (r(8.5, 9.0), Some("roughing".to_string())),
            (r(9.0, 10.0), None),
            (r(10.0, 11.0), None),
        ]
    );
}

fn reason_tags(scheduler: &Scheduler) -> Vec<(TimeRange, Option<String>)> {
    let db = scheduler.database().lock().unwrap();
    db.load_slots::<ReasonAttrs>(1)
        .unwrap()
        .into_iter()
        .map(|slot| (slot.range, slot.attrs.input.auto_sequence))
        .collect()
}

#[test]
fn test_auto_sequence_recorded_after_its_facts_is_still_tagged() {
    let db = Database::open_memory().unwrap();
    db.upsert_machine(&Machine {
        id: 1,
        name: "mill".into(),
    })
    .unwrap();
    db.insert_fact(1, &r(8.0, 9.0), 2).unwrap();

    let scheduler = Scheduler::open(db, &Config::default()).unwrap();
    scheduler.run_machine(1, &CancellationToken::new());
    assert_eq!(reason_tags(&scheduler), vec![(r(8.0, 9.0), None)]);

    {
        let db = scheduler.database().lock().unwrap();
        assert_eq!(db.auto_sequence_watermark(1).unwrap(), Some(t(8.0)));
        db.insert_auto_sequence(1, 1, &r(8.0, 9.0), "O1").unwrap();
        db.insert_fact(1, &r(9.0, 10.0), 1).unwrap();
    }
    let report = scheduler.run_machine(1, &CancellationToken::new());
    assert_eq!(report.auto_sequence_tags, 1);

    assert_eq!(
        reason_tags(&scheduler),
        vec![(r(8.0, 9.0), Some("O1".to_string())), (r(9.0, 10.0), None)]
    );
    let db = scheduler.database().lock().unwrap();
    assert_eq!(db.auto_sequence_watermark(1).unwrap(), Some(t(10.0)));
}
