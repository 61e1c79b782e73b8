// Copyright (c) The suite-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Behavioral tests for the suite runner.

use pretty_assertions::assert_eq;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};
use suite_runner::{
    capture::OutputCapture,
    reporter::{ReportSink, TestEvent, TestPath, UnitContext},
    runner::{Parallelism, RunStats, RunnerOpts},
    test_list::{FixtureFn, Namespace, TestList, TestUnit},
};

fn collecting_sink() -> (Arc<Mutex<Vec<TestEvent>>>, ReportSink) {
    let events: Arc<Mutex<Vec<TestEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_events = Arc::clone(&events);
    let sink: ReportSink = Box::new(move |event| {
        sink_events.lock().expect("events lock").push(event.clone());
    });
    (events, sink)
}

fn passing_unit(namespace: &Arc<Namespace>, name: &str) -> TestUnit {
    TestUnit::new(
        namespace,
        name,
        Arc::new(|ctx: &UnitContext<'_>| ctx.pass()),
    )
}

fn failing_unit(namespace: &Arc<Namespace>, name: &str) -> TestUnit {
    TestUnit::new(
        namespace,
        name,
        Arc::new(|ctx: &UnitContext<'_>| ctx.fail("assertion failed")),
    )
}

fn opts(parallelism: Parallelism) -> RunnerOpts {
    RunnerOpts {
        parallelism,
        threads: Some(4),
        ..RunnerOpts::default()
    }
}

fn count_events(events: &[TestEvent], matches: impl Fn(&TestEvent) -> bool) -> usize {
    events.iter().filter(|&event| matches(event)).count()
}

#[test]
fn serial_suite_counts_everything() {
    let mut units = Vec::new();
    for namespace in ["alpha", "beta", "gamma"] {
        let namespace = Arc::new(Namespace::new(namespace));
        units.push(passing_unit(&namespace, "first"));
        units.push(passing_unit(&namespace, "second"));
    }
    let list = TestList::new(units);

    let runner = opts(Parallelism::None).build().expect("runner built");
    let (events, sink) = collecting_sink();
    let summary = runner.run_with(&list, sink).expect("run succeeds");

    assert_eq!(
        summary.stats,
        RunStats {
            tests: 6,
            passed: 6,
            failed: 0,
            errored: 0,
        }
    );
    assert!(summary.is_success());

    let events = events.lock().expect("events lock");
    assert_eq!(events[0], TestEvent::RunStarted { test_count: 6 });
    assert!(matches!(
        events.last(),
        Some(TestEvent::RunFinished { stats, .. }) if *stats == summary.stats
    ));
    assert_eq!(
        count_events(&events, |e| matches!(e, TestEvent::NamespaceStarted { .. })),
        3
    );
    assert_eq!(
        count_events(&events, |e| matches!(e, TestEvent::NamespaceFinished { .. })),
        3
    );
    assert_eq!(
        count_events(&events, |e| matches!(e, TestEvent::TestPassed { .. })),
        6
    );
}

#[test]
fn all_policies_agree_on_counters() {
    let mut units = Vec::new();
    for namespace in ["alpha", "beta", "gamma"] {
        let namespace = Arc::new(Namespace::new(namespace));
        for name in ["one", "two", "three"] {
            units.push(passing_unit(&namespace, name));
        }
        units.push(failing_unit(&namespace, "broken"));
    }
    let list = TestList::new(units);

    let expected = RunStats {
        tests: 12,
        passed: 9,
        failed: 3,
        errored: 0,
    };
    for parallelism in [
        Parallelism::None,
        Parallelism::Namespaces,
        Parallelism::Units,
        Parallelism::All,
    ] {
        let runner = opts(parallelism).build().expect("runner built");
        let (_events, sink) = collecting_sink();
        let summary = runner.run_with(&list, sink).expect("run succeeds");
        assert_eq!(summary.stats, expected, "policy: {}", parallelism);
    }
}

#[test]
fn fixtures_wrap_in_order() {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let once: FixtureFn = {
        let log = Arc::clone(&log);
        Arc::new(move |body: &mut dyn FnMut()| {
            log.lock().expect("log lock").push("once-setup".to_owned());
            body();
            log.lock().expect("log lock").push("once-teardown".to_owned());
        })
    };
    let each: FixtureFn = {
        let log = Arc::clone(&log);
        Arc::new(move |body: &mut dyn FnMut()| {
            log.lock().expect("log lock").push("each-setup".to_owned());
            body();
            log.lock().expect("log lock").push("each-teardown".to_owned());
        })
    };
    let namespace = Arc::new(
        Namespace::new("ordered")
            .with_once_fixture(once)
            .with_each_fixture(each),
    );

    let mut units = Vec::new();
    for name in ["a", "b"] {
        let log = Arc::clone(&log);
        units.push(TestUnit::new(
            &namespace,
            name,
            Arc::new(move |ctx: &UnitContext<'_>| {
                log.lock().expect("log lock").push(format!("unit:{}", ctx.path()));
                ctx.pass();
            }),
        ));
    }
    let list = TestList::new(units);

    let runner = opts(Parallelism::None).build().expect("runner built");
    let (_events, sink) = collecting_sink();
    let summary = runner.run_with(&list, sink).expect("run succeeds");
    assert_eq!(summary.stats.tests, 2);

    let log = log.lock().expect("log lock");
    assert_eq!(
        *log,
        vec![
            "once-setup".to_owned(),
            "each-setup".to_owned(),
            "unit:ordered::a".to_owned(),
            "each-teardown".to_owned(),
            "each-setup".to_owned(),
            "unit:ordered::b".to_owned(),
            "each-teardown".to_owned(),
            "once-teardown".to_owned(),
        ]
    );
}

#[test]
fn each_fixture_teardown_fault_becomes_one_error() {
    let each: FixtureFn = Arc::new(|body: &mut dyn FnMut()| {
        body();
        panic!("teardown boom");
    });
    let namespace = Arc::new(Namespace::new("flaky").with_each_fixture(each));
    let list = TestList::new(vec![passing_unit(&namespace, "passes_then_faults")]);

    let runner = opts(Parallelism::None).build().expect("runner built");
    let (events, sink) = collecting_sink();
    let summary = runner.run_with(&list, sink).expect("run still returns");

    assert_eq!(
        summary.stats,
        RunStats {
            tests: 1,
            passed: 1,
            failed: 0,
            errored: 1,
        }
    );

    let events = events.lock().expect("events lock");
    let errors: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            TestEvent::TestErrored { path, message } => Some((path, message)),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1);
    let (path, message) = &errors[0];
    assert_eq!(
        **path,
        TestPath::test("flaky", "passes_then_faults")
    );
    let message = message.as_deref().expect("fault message present");
    assert!(message.contains("uncaught exception during fixture initialization"));
    assert!(message.contains("teardown boom"));
}

#[test]
fn once_fixture_fault_spares_sibling_namespaces() {
    let broken: FixtureFn = Arc::new(|_body: &mut dyn FnMut()| panic!("setup boom"));
    let bad = Arc::new(Namespace::new("bad").with_once_fixture(broken));
    let good = Arc::new(Namespace::new("good"));

    let list = TestList::new(vec![
        passing_unit(&bad, "never_runs"),
        passing_unit(&bad, "never_runs_either"),
        passing_unit(&good, "runs"),
        passing_unit(&good, "runs_too"),
    ]);

    let runner = opts(Parallelism::None).build().expect("runner built");
    let (events, sink) = collecting_sink();
    let summary = runner.run_with(&list, sink).expect("run still returns");

    // Only the healthy namespace's units ran; the fault shows up once.
    assert_eq!(
        summary.stats,
        RunStats {
            tests: 2,
            passed: 2,
            failed: 0,
            errored: 1,
        }
    );

    let events = events.lock().expect("events lock");
    let errors: Vec<_> = events
        .iter()
        .filter(|event| matches!(event, TestEvent::TestErrored { .. }))
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors[0],
        TestEvent::TestErrored { path, .. } if *path == TestPath::namespace("bad")
    ));
}

#[test]
fn fail_fast_stops_dispatching() {
    let namespace = Arc::new(Namespace::new("solo"));
    let list = TestList::new(vec![
        failing_unit(&namespace, "first_fails"),
        passing_unit(&namespace, "skipped"),
        passing_unit(&namespace, "also_skipped"),
    ]);

    let runner = RunnerOpts {
        parallelism: Parallelism::None,
        threads: Some(2),
        fail_fast: true,
        ..RunnerOpts::default()
    }
    .build()
    .expect("runner built");
    let (_events, sink) = collecting_sink();
    let summary = runner.run_with(&list, sink).expect("run succeeds");

    assert_eq!(
        summary.stats,
        RunStats {
            tests: 1,
            passed: 0,
            failed: 1,
            errored: 0,
        }
    );
}

#[test]
fn slow_tests_reported_unless_known_slow() {
    let namespace = Arc::new(Namespace::new("timing"));
    let sleepy = |ctx: &UnitContext<'_>| {
        thread::sleep(Duration::from_millis(100));
        ctx.pass();
    };
    let list = TestList::new(vec![
        TestUnit::new(&namespace, "slow", Arc::new(sleepy)),
        TestUnit::new(&namespace, "slow_by_design", Arc::new(sleepy)).with_known_slow(true),
        passing_unit(&namespace, "fast"),
    ]);

    let runner = RunnerOpts {
        parallelism: Parallelism::None,
        threads: Some(2),
        test_warn_time: Some(Duration::from_millis(50)),
        ..RunnerOpts::default()
    }
    .build()
    .expect("runner built");
    let (events, sink) = collecting_sink();
    let summary = runner.run_with(&list, sink).expect("run succeeds");
    assert_eq!(summary.stats.tests, 3);
    assert_eq!(summary.stats.passed, 3);

    let events = events.lock().expect("events lock");
    let slow: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            TestEvent::SlowTest { path, elapsed } => Some((path.clone(), *elapsed)),
            _ => None,
        })
        .collect();
    assert_eq!(slow.len(), 1);
    assert_eq!(slow[0].0, TestPath::test("timing", "slow"));
    assert!(slow[0].1 >= Duration::from_millis(50));
}

fn synchronized_unit(
    namespace: &Arc<Namespace>,
    name: &str,
    active: &Arc<AtomicUsize>,
    overlapped: &Arc<AtomicBool>,
) -> TestUnit {
    let active = Arc::clone(active);
    let overlapped = Arc::clone(overlapped);
    TestUnit::new(
        namespace,
        name,
        Arc::new(move |ctx: &UnitContext<'_>| {
            if active.fetch_add(1, Ordering::SeqCst) > 0 {
                overlapped.store(true, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(5));
            active.fetch_sub(1, Ordering::SeqCst);
            ctx.pass();
        }),
    )
    .with_synchronized(true)
}

#[test]
fn synchronized_units_never_overlap() {
    let active = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));

    let mut units = Vec::new();
    for namespace in ["left", "right"] {
        let namespace = Arc::new(Namespace::new(namespace));
        for name in ["s1", "s2", "s3"] {
            units.push(synchronized_unit(&namespace, name, &active, &overlapped));
        }
        for name in ["free1", "free2"] {
            units.push(passing_unit(&namespace, name));
        }
    }
    let list = TestList::new(units);
    assert_eq!(list.sync_count(), 6);

    let runner = RunnerOpts {
        parallelism: Parallelism::All,
        threads: Some(8),
        ..RunnerOpts::default()
    }
    .build()
    .expect("runner built");
    let (_events, sink) = collecting_sink();
    let summary = runner.run_with(&list, sink).expect("run succeeds");

    assert_eq!(summary.stats.tests, 10);
    assert_eq!(summary.stats.passed, 10);
    assert!(
        !overlapped.load(Ordering::SeqCst),
        "two synchronized units were observed running concurrently"
    );
}

#[test]
fn empty_list_reports_nothing() {
    let runner = opts(Parallelism::All).build().expect("runner built");
    let (events, sink) = collecting_sink();
    let summary = runner
        .run_with(&TestList::new(Vec::<TestUnit>::new()), sink)
        .expect("run succeeds");

    assert_eq!(summary.stats, RunStats::default());
    assert_eq!(summary.elapsed, Duration::ZERO);
    assert!(events.lock().expect("events lock").is_empty());
}

#[derive(Debug, Default)]
struct RecordingCapture {
    runs: AtomicUsize,
    units: AtomicUsize,
}

impl OutputCapture for RecordingCapture {
    fn with_capture(&self, body: &mut dyn FnMut()) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        body()
    }

    fn with_unit_buffer(&self, body: &mut dyn FnMut()) {
        self.units.fetch_add(1, Ordering::SeqCst);
        body()
    }
}

#[test]
fn capture_scopes_wrap_run_and_units() {
    let namespace = Arc::new(Namespace::new("captured"));
    let list = TestList::new(vec![
        passing_unit(&namespace, "a"),
        passing_unit(&namespace, "b"),
        passing_unit(&namespace, "c"),
    ]);

    let capture = Arc::new(RecordingCapture::default());
    let runner = RunnerOpts {
        parallelism: Parallelism::None,
        threads: Some(2),
        ..RunnerOpts::default()
    }
    .with_capture(Arc::clone(&capture) as Arc<dyn OutputCapture>)
    .build()
    .expect("runner built");
    let (_events, sink) = collecting_sink();
    runner.run_with(&list, sink).expect("run succeeds");

    assert_eq!(capture.runs.load(Ordering::SeqCst), 1);
    assert_eq!(capture.units.load(Ordering::SeqCst), 3);
}

#[test]
fn capture_scopes_skipped_when_disabled() {
    let namespace = Arc::new(Namespace::new("plain"));
    let list = TestList::new(vec![passing_unit(&namespace, "a")]);

    let capture = Arc::new(RecordingCapture::default());
    let runner = RunnerOpts {
        parallelism: Parallelism::None,
        threads: Some(2),
        capture_output: false,
        ..RunnerOpts::default()
    }
    .with_capture(Arc::clone(&capture) as Arc<dyn OutputCapture>)
    .build()
    .expect("runner built");
    let (_events, sink) = collecting_sink();
    runner.run_with(&list, sink).expect("run succeeds");

    assert_eq!(capture.runs.load(Ordering::SeqCst), 0);
    assert_eq!(capture.units.load(Ordering::SeqCst), 0);
}
