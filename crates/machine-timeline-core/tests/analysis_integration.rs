//! End-to-end analysis scenarios: operation run-times and day summaries.

use chrono::{DateTime, TimeZone, Utc};
use machine_timeline_core::timeline::{OperationAttrs, ReasonAttrs};
use machine_timeline_core::{
    Config, Database, Machine, MachineRunStatus, ModificationKind, ModificationStatus,
    NewModification, Scheduler, SummaryKey, TimeRange,
};
use tokio_util::sync::CancellationToken;

const RUNNING: i64 = 2;
const STOPPED: i64 = 4;

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 12, h, m, 0).unwrap()
}

fn range(begin: DateTime<Utc>, end: DateTime<Utc>) -> TimeRange {
    TimeRange::new(begin, end).unwrap()
}

fn scheduler(config: &Config) -> Scheduler {
    let db = Database::open_memory().unwrap();
    db.upsert_machine(&Machine {
        id: 1,
        name: "lathe".into(),
    })
    .unwrap();
    let facts = [
        (at(9, 0), at(9, 5), RUNNING),
        (at(9, 5), at(10, 20), STOPPED),
        (at(10, 20), at(10, 27), RUNNING),
        (at(10, 27), at(10, 29), STOPPED),
        (at(10, 29), at(10, 36), RUNNING),
    ];
    for (begin, end, mode) in facts {
        db.insert_fact(1, &range(begin, end), mode).unwrap();
    }
    Scheduler::open(db, config).unwrap()
}

fn operation(begin: DateTime<Utc>, end: DateTime<Utc>, name: &str) -> NewModification {
    NewModification::for_machine(
        1,
        ModificationKind::Operation {
            range: range(begin, end),
            operation: name.into(),
            work_order: None,
        },
    )
}

#[test]
fn test_operation_run_times_after_one_pass() {
    let scheduler = scheduler(&Config::default());
    let ids: Vec<i64> = {
        let db = scheduler.database().lock().unwrap();
        [
            operation(at(9, 0), at(10, 27), "OP-10"),
            operation(at(10, 28), at(10, 36), "OP-20"),
        ]
        .iter()
        .map(|new| db.insert_modification(new).unwrap())
        .collect()
    };

    let report = scheduler.run_machine(1, &CancellationToken::new());
    assert_eq!(report.status, MachineRunStatus::Completed);
    assert_eq!(report.modifications, 2);

    let db = scheduler.database().lock().unwrap();
    for id in ids {
        assert_eq!(
            db.get_modification(id).unwrap().unwrap().status,
            ModificationStatus::Done
        );
    }
    let slots = db.load_slots::<OperationAttrs>(1).unwrap();
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0].range, range(at(9, 0), at(10, 27)));
    assert_eq!(slots[0].attrs.run_time_secs, Some(12 * 60));
    assert_eq!(slots[1].range, range(at(10, 28), at(10, 36)));
    assert_eq!(slots[1].attrs.run_time_secs, Some(7 * 60));
}

#[test]
fn test_operation_declared_before_facts_gets_its_run_time_later() {
    let db = Database::open_memory().unwrap();
    db.upsert_machine(&Machine {
        id: 1,
        name: "lathe".into(),
    })
    .unwrap();
    db.insert_modification(&operation(at(9, 0), at(10, 0), "OP-10"))
        .unwrap();
    let scheduler = Scheduler::open(db, &Config::default()).unwrap();
    scheduler.run_machine(1, &CancellationToken::new());
    {
        let db = scheduler.database().lock().unwrap();
        let slots = db.load_slots::<OperationAttrs>(1).unwrap();
        assert_eq!(slots[0].attrs.run_time_secs, Some(0));
        db.insert_fact(1, &range(at(9, 30), at(9, 45)), RUNNING)
            .unwrap();
    }
    scheduler.run_machine(1, &CancellationToken::new());

    let db = scheduler.database().lock().unwrap();
    let slots = db.load_slots::<OperationAttrs>(1).unwrap();
    assert_eq!(slots[0].attrs.run_time_secs, Some(15 * 60));
}

fn covered_secs(db: &Database) -> i64 {
    db.load_slots::<ReasonAttrs>(1)
        .unwrap()
        .iter()
        .filter_map(|s| s.range.duration())
        .map(|d| d.num_seconds())
        .sum()
}

#[test]
fn test_summaries_cover_the_partition_for_any_cutoff() {
    for cutoff in ["00:00", "10:00", "10:25", "22:00"] {
        let mut config = Config::default();
        config.summary.day_cutoff = cutoff.into();
        let scheduler = scheduler(&config);
        let report = scheduler.run_machine(1, &CancellationToken::new());
        assert_eq!(report.status, MachineRunStatus::Completed);

        let db = scheduler.database().lock().unwrap();
        let covered = covered_secs(&db);
        assert_eq!(covered, 96 * 60);

        let activity: i64 = db
            .activity_summary(Some(1))
            .unwrap()
            .iter()
            .map(|row| row.duration_secs)
            .sum();
        assert_eq!(activity, covered, "cutoff {cutoff}");

        let reasons: i64 = db
            .reason_summary(Some(1))
            .unwrap()
            .iter()
            .map(|row| row.duration_secs)
            .sum();
        assert_eq!(reasons, covered, "cutoff {cutoff}");
    }
}

#[test]
fn test_cutoff_in_the_afternoon_moves_evening_to_the_next_day() {
    let mut config = Config::default();
    config.summary.day_cutoff = "22:00".into();
    let db = Database::open_memory().unwrap();
    db.upsert_machine(&Machine {
        id: 1,
        name: "lathe".into(),
    })
    .unwrap();
    db.insert_fact(1, &range(at(21, 0), at(23, 0)), RUNNING)
        .unwrap();
    let scheduler = Scheduler::open(db, &config).unwrap();
    scheduler.run_machine(1, &CancellationToken::new());

    let db = scheduler.database().lock().unwrap();
    let rows = db.activity_summary(Some(1)).unwrap();
    let days: Vec<_> = rows
        .iter()
        .map(|row| match &row.key {
            SummaryKey::Activity { day, .. } => (*day, row.duration_secs),
            SummaryKey::Reason { day, .. } => (*day, row.duration_secs),
        })
        .collect();
    let date = |d| chrono::NaiveDate::from_ymd_opt(2024, 2, d).unwrap();
    assert_eq!(days, vec![(date(12), 3600), (date(13), 3600)]);
}

#[test]
fn test_observation_change_moves_summary_rows() {
    let scheduler = scheduler(&Config::default());
    scheduler.run_machine(1, &CancellationToken::new());
    {
        let db = scheduler.database().lock().unwrap();
        db.insert_modification(&NewModification::for_machine(
            1,
            ModificationKind::ObservationState {
                range: range(at(9, 0), at(10, 0)),
                observation_state: "Unemployed".into(),
                shift: None,
                machine_state_template: None,
            },
        ))
        .unwrap();
    }
    scheduler.run_machine(1, &CancellationToken::new());

    let db = scheduler.database().lock().unwrap();
    let unemployed: i64 = db
        .reason_summary(Some(1))
        .unwrap()
        .iter()
        .filter(|row| {
            matches!(&row.key, SummaryKey::Reason { reason, .. } if reason == "Unemployed")
        })
        .map(|row| row.duration_secs)
        .sum();
    assert_eq!(unemployed, 3600);

    let total: i64 = db
        .reason_summary(Some(1))
        .unwrap()
        .iter()
        .map(|row| row.duration_secs)
        .sum();
    assert_eq!(total, covered_secs(&db));
}
