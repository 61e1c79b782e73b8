// Copyright (c) The suite-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::runner::{RunContext, RunStats};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::{
    fmt, io,
    io::Write,
    str::FromStr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};
use termcolor::{BufferWriter, ColorChoice, ColorSpec, WriteColor};
use tracing::warn;

/// Identifies the scope an event is attributed to: a namespace, or a single
/// test within one.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestPath {
    /// The enclosing namespace.
    pub namespace: String,

    /// The test name, if the scope is a single unit.
    pub test: Option<String>,
}

impl TestPath {
    /// A path naming a whole namespace.
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            test: None,
        }
    }

    /// A path naming one test within a namespace.
    pub fn test(namespace: impl Into<String>, test: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            test: Some(test.into()),
        }
    }
}

impl fmt::Display for TestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.test {
            Some(test) => write!(f, "{}::{}", self.namespace, test),
            None => write!(f, "{}", self.namespace),
        }
    }
}

/// An event emitted over the course of a run.
///
/// Unit-level pass/fail/error events come from the unit executable through
/// its [`UnitContext`]; the engine itself emits the rest.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestEvent {
    /// The run started with this many units.
    RunStarted {
        /// Number of units that will be dispatched.
        test_count: usize,
    },

    /// A namespace is about to run its units.
    NamespaceStarted {
        /// The namespace name.
        namespace: String,
    },

    /// A namespace finished, once-fixture teardown included.
    NamespaceFinished {
        /// The namespace name.
        namespace: String,
    },

    /// A unit passed.
    TestPassed {
        /// The unit's testing path.
        path: TestPath,
    },

    /// A unit failed an assertion.
    TestFailed {
        /// The unit's testing path.
        path: TestPath,
        /// Failure detail, if the unit supplied any.
        message: Option<String>,
    },

    /// A unit (or a fixture around it) raised an uncaught fault.
    TestErrored {
        /// The scope the fault is attributed to.
        path: TestPath,
        /// Fault detail, if available.
        message: Option<String>,
    },

    /// A unit exceeded the configured slow-test threshold.
    SlowTest {
        /// The unit's testing path.
        path: TestPath,
        /// Measured wall-clock duration.
        elapsed: Duration,
    },

    /// The run finished.
    RunFinished {
        /// Aggregated counters for the whole run.
        stats: RunStats,
        /// Total wall-clock duration.
        elapsed: Duration,
    },
}

/// A report-sink callable. Sinks may have side effects (console output,
/// progress state) and are never required to return anything.
pub type ReportSink = Box<dyn FnMut(&TestEvent) + Send>;

/// Wraps a report sink so concurrent callers never interleave events
/// mid-emission.
///
/// Mutual exclusion is the only guarantee: events reported concurrently may
/// appear in any order relative to each other.
pub struct SerializedSink {
    inner: Mutex<ReportSink>,
}

impl SerializedSink {
    /// Wraps `sink` in a single mutual-exclusion lock.
    pub fn new(sink: ReportSink) -> Self {
        Self {
            inner: Mutex::new(sink),
        }
    }

    /// Reports one event through the underlying sink.
    pub fn report(&self, event: &TestEvent) {
        // A sink that panicked mid-event must not wedge every later report.
        let mut sink = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        sink(event);
    }
}

impl fmt::Debug for SerializedSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializedSink")
            .field("inner", &"Mutex { .. }")
            .finish()
    }
}

/// Per-namespace result counters, updated from whichever threads run the
/// namespace's units.
#[derive(Debug, Default)]
pub(crate) struct CounterSet {
    tests: AtomicUsize,
    passed: AtomicUsize,
    failed: AtomicUsize,
    errored: AtomicUsize,
}

impl CounterSet {
    /// Records that a unit's executable is about to be invoked.
    pub(crate) fn begin_test(&self) {
        self.tests.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, event: &TestEvent) {
        match event {
            TestEvent::TestPassed { .. } => {
                self.passed.fetch_add(1, Ordering::Relaxed);
            }
            TestEvent::TestFailed { .. } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            TestEvent::TestErrored { .. } => {
                self.errored.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Snapshots the counters. Only meaningful once all contributing units
    /// have joined.
    pub(crate) fn snapshot(&self) -> RunStats {
        RunStats {
            tests: self.tests.load(Ordering::Relaxed),
            passed: self.passed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
        }
    }
}

/// Counts the event, records failures on the run context, and forwards to
/// the serialized sink.
pub(crate) fn emit(counters: &CounterSet, run: &RunContext, sink: &SerializedSink, event: TestEvent) {
    counters.record(&event);
    if matches!(
        event,
        TestEvent::TestFailed { .. } | TestEvent::TestErrored { .. }
    ) {
        run.record_failure();
    }
    sink.report(&event);
}

/// The report sink and testing-path scope bound around one unit execution.
///
/// The unit executable emits its outcome through this context; events are
/// counted against the enclosing namespace and funneled through the run's
/// serialized sink.
#[derive(Debug)]
pub struct UnitContext<'a> {
    pub(crate) path: TestPath,
    pub(crate) counters: &'a CounterSet,
    pub(crate) sink: &'a SerializedSink,
    pub(crate) run: &'a RunContext,
}

impl UnitContext<'_> {
    /// The testing path of the unit under execution.
    pub fn path(&self) -> &TestPath {
        &self.path
    }

    /// Reports an arbitrary event through the bound sink.
    pub fn report(&self, event: TestEvent) {
        emit(self.counters, self.run, self.sink, event);
    }

    /// Reports that the unit passed.
    pub fn pass(&self) {
        self.report(TestEvent::TestPassed {
            path: self.path.clone(),
        });
    }

    /// Reports an assertion failure.
    pub fn fail(&self, message: impl Into<String>) {
        self.report(TestEvent::TestFailed {
            path: self.path.clone(),
            message: Some(message.into()),
        });
    }

    /// Reports an uncaught fault in the unit body.
    pub fn error(&self, message: impl Into<String>) {
        self.report(TestEvent::TestErrored {
            path: self.path.clone(),
            message: Some(message.into()),
        });
    }
}

/// When to color console output.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Color {
    /// Color even when stdout is not a terminal.
    Always,
    /// Color when stdout is a terminal.
    Auto,
    /// Never color.
    Never,
}

impl Color {
    /// The accepted string forms.
    pub fn variants() -> [&'static str; 3] {
        ["always", "auto", "never"]
    }

    pub(crate) fn color_choice(self, stream: atty::Stream) -> ColorChoice {
        // https://docs.rs/termcolor/1.1.2/termcolor/index.html#detecting-presence-of-a-terminal
        match self {
            Color::Always => ColorChoice::Always,
            Color::Auto => {
                if atty::is(stream) {
                    ColorChoice::Auto
                } else {
                    ColorChoice::Never
                }
            }
            Color::Never => ColorChoice::Never,
        }
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::Auto
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Color::Always => write!(f, "always"),
            Color::Auto => write!(f, "auto"),
            Color::Never => write!(f, "never"),
        }
    }
}

impl FromStr for Color {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let val = match s {
            "always" => Color::Always,
            "auto" => Color::Auto,
            "never" => Color::Never,
            other => bail!("unrecognized value for color: {}", other),
        };
        Ok(val)
    }
}

/// The default progress reporter: colored per-event lines on stdout.
pub struct TestReporter {
    stdout: BufferWriter,
}

impl TestReporter {
    /// Creates a new instance with the given color choice.
    pub fn new(color: Color) -> Self {
        Self {
            stdout: BufferWriter::stdout(color.color_choice(atty::Stream::Stdout)),
        }
    }

    /// Report a test event.
    pub fn report_event(&self, event: &TestEvent) -> Result<()> {
        let mut buffer = self.stdout.buffer();
        self.write_event(event, &mut buffer)?;
        self.stdout.print(&buffer).context("error writing output")
    }

    /// Converts this reporter into a report sink. Write errors are logged,
    /// never propagated into the run.
    pub fn into_sink(self) -> ReportSink {
        Box::new(move |event| {
            if let Err(error) = self.report_event(event) {
                warn!("failed to write report event: {}", error);
            }
        })
    }

    // ---
    // Helper methods
    // ---

    fn write_event(&self, event: &TestEvent, mut writer: impl WriteColor) -> io::Result<()> {
        match event {
            TestEvent::RunStarted { test_count } => {
                writer.set_color(&Self::pass_spec())?;
                write!(writer, "{:>12} ", "Starting")?;
                writer.reset()?;

                writer.set_color(&Self::count_spec())?;
                write!(writer, "{}", test_count)?;
                writer.reset()?;
                writeln!(writer, " tests")?;
            }
            TestEvent::NamespaceStarted { .. } | TestEvent::NamespaceFinished { .. } => {}
            TestEvent::TestPassed { path } => {
                writer.set_color(&Self::pass_spec())?;
                write!(writer, "{:>12} ", "PASS")?;
                writer.reset()?;
                writeln!(writer, "{}", path)?;
            }
            TestEvent::TestFailed { path, message } => {
                writer.set_color(&Self::fail_spec())?;
                write!(writer, "{:>12} ", "FAIL")?;
                writer.reset()?;
                writeln!(writer, "{}", path)?;
                self.write_message(message.as_deref(), &mut writer)?;
            }
            TestEvent::TestErrored { path, message } => {
                writer.set_color(&Self::fail_spec())?;
                write!(writer, "{:>12} ", "ERROR")?;
                writer.reset()?;
                writeln!(writer, "{}", path)?;
                self.write_message(message.as_deref(), &mut writer)?;
            }
            TestEvent::SlowTest { path, elapsed } => {
                writer.set_color(&Self::slow_spec())?;
                write!(writer, "{:>12} ", "SLOW")?;
                writer.reset()?;
                write!(writer, "[{:>8.3?}s] ", elapsed.as_secs_f64())?;
                writeln!(writer, "{}", path)?;
            }
            TestEvent::RunFinished { stats, elapsed } => {
                let summary_spec = if stats.is_success() {
                    Self::pass_spec()
                } else {
                    Self::fail_spec()
                };
                writer.set_color(&summary_spec)?;
                write!(writer, "{:>12} ", "Summary")?;
                writer.reset()?;

                write!(writer, "[{:>8.3?}s] ", elapsed.as_secs_f64())?;

                let count_spec = Self::count_spec();

                writer.set_color(&count_spec)?;
                write!(writer, "{}", stats.tests)?;
                writer.reset()?;
                write!(writer, " tests run: ")?;

                writer.set_color(&count_spec)?;
                write!(writer, "{}", stats.passed)?;
                writer.set_color(&Self::pass_spec())?;
                write!(writer, " passed")?;
                writer.reset()?;

                if stats.failed > 0 {
                    write!(writer, ", ")?;
                    writer.set_color(&count_spec)?;
                    write!(writer, "{}", stats.failed)?;
                    writer.set_color(&Self::fail_spec())?;
                    write!(writer, " failed")?;
                    writer.reset()?;
                }

                if stats.errored > 0 {
                    write!(writer, ", ")?;
                    writer.set_color(&count_spec)?;
                    write!(writer, "{}", stats.errored)?;
                    writer.set_color(&Self::fail_spec())?;
                    write!(writer, " errored")?;
                    writer.reset()?;
                }

                writeln!(writer)?;
            }
        }
        Ok(())
    }

    fn write_message(&self, message: Option<&str>, mut writer: impl WriteColor) -> io::Result<()> {
        if let Some(message) = message {
            writer.set_color(&Self::fail_output_spec())?;
            for line in message.lines() {
                writeln!(writer, "    {}", line)?;
            }
            writer.reset()?;
        }
        Ok(())
    }

    fn count_spec() -> ColorSpec {
        let mut color_spec = ColorSpec::new();
        color_spec.set_bold(true);
        color_spec
    }

    fn pass_spec() -> ColorSpec {
        let mut color_spec = ColorSpec::new();
        color_spec
            .set_fg(Some(termcolor::Color::Green))
            .set_bold(true);
        color_spec
    }

    fn fail_spec() -> ColorSpec {
        let mut color_spec = ColorSpec::new();
        color_spec
            .set_fg(Some(termcolor::Color::Red))
            .set_bold(true);
        color_spec
    }

    fn fail_output_spec() -> ColorSpec {
        let mut color_spec = ColorSpec::new();
        color_spec.set_fg(Some(termcolor::Color::Red));
        color_spec
    }

    fn slow_spec() -> ColorSpec {
        let mut color_spec = ColorSpec::new();
        color_spec
            .set_fg(Some(termcolor::Color::Yellow))
            .set_bold(true);
        color_spec
    }
}

impl fmt::Debug for TestReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestReporter")
            .field("stdout", &"BufferWriter { .. }")
            .finish()
    }
}
