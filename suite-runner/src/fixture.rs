// Copyright (c) The suite-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    reporter::{emit, CounterSet, SerializedSink, TestEvent, TestPath, UnitContext},
    runner::{RunContext, RunnerOpts},
    test_list::{FixtureFn, NamespaceGroup, TestInstance},
};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    time::Instant,
};
use tracing::{debug, warn};

/// Message prefix for faults escaping fixture setup or teardown.
const FIXTURE_FAULT: &str = "uncaught exception during fixture initialization";

/// Applies an optional fixture around `body`, converting any fault escaping
/// the fixture into a single error event attributed to `path`.
///
/// The same guard wraps both granularities: the once-fixture around a
/// namespace's unit dispatch, and the each-fixture around a single unit.
/// Faults inside the unit body itself are the unit executable's concern and
/// arrive here already converted into report events.
pub(crate) fn guarded_fixture(
    fixture: Option<&FixtureFn>,
    path: &TestPath,
    counters: &CounterSet,
    ctx: &RunContext,
    sink: &SerializedSink,
    body: &mut dyn FnMut(),
) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match fixture {
        Some(fixture) => (**fixture)(body),
        None => body(),
    }));
    if let Err(payload) = outcome {
        let message = format!("{}: {}", FIXTURE_FAULT, panic_message(payload.as_ref()));
        warn!(path = %path, "{}", message);
        emit(
            counters,
            ctx,
            sink,
            TestEvent::TestErrored {
                path: path.clone(),
                message: Some(message),
            },
        );
    }
}

/// Dispatches one unit: fail-fast gate, synchronized-unit exclusion,
/// each-fixture, optional per-unit output buffer, then the timed executable.
pub(crate) fn run_unit(
    group: &NamespaceGroup,
    instance: &TestInstance,
    counters: &CounterSet,
    ctx: &RunContext,
    sink: &SerializedSink,
    opts: &RunnerOpts,
) {
    if opts.fail_fast && ctx.has_failures() {
        debug!(
            namespace = %group.namespace.name,
            test = %instance.unit.name,
            "fail-fast: skipping unit dispatch"
        );
        return;
    }

    // Synchronized units never overlap, within or across namespaces.
    let _guard = instance.synchronized.then(|| ctx.synchronized_guard());

    let path = instance.path();
    guarded_fixture(
        group.namespace.each_fixture.as_deref(),
        &path,
        counters,
        ctx,
        sink,
        &mut || {
            let mut body = || execute_unit(instance, &path, counters, ctx, sink, opts);
            if opts.capture_output {
                opts.capture.with_unit_buffer(&mut body);
            } else {
                body();
            }
        },
    );
}

/// Invokes the unit executable with the bound context, measuring wall-clock
/// duration and emitting a slow-test event when the threshold is met.
fn execute_unit(
    instance: &TestInstance,
    path: &TestPath,
    counters: &CounterSet,
    ctx: &RunContext,
    sink: &SerializedSink,
    opts: &RunnerOpts,
) {
    counters.begin_test();
    let unit_ctx = UnitContext {
        path: path.clone(),
        counters,
        sink,
        run: ctx,
    };

    let start = Instant::now();
    instance.unit.execute(&unit_ctx);
    let elapsed = start.elapsed();

    if let Some(threshold) = opts.test_warn_time {
        if !instance.known_slow && elapsed >= threshold {
            sink.report(&TestEvent::SlowTest {
                path: path.clone(),
                elapsed,
            });
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}
