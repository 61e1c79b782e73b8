// Copyright (c) The suite-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    capture::{NoCapture, OutputCapture},
    fixture::{guarded_fixture, run_unit},
    pool::TaskPool,
    reporter::{Color, CounterSet, ReportSink, SerializedSink, TestEvent, TestPath, TestReporter},
    test_list::{NamespaceGroup, TestInstance, TestList, TestUnit},
};
use anyhow::{bail, Result};
use debug_ignore::DebugIgnore;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};
use tracing::debug;

/// Which level(s) of the suite run on the worker pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Parallelism {
    /// Namespaces run concurrently, and units within each namespace do too.
    All,

    /// Namespaces run concurrently; units within a namespace run serially.
    Namespaces,

    /// Namespaces run serially; units within each namespace run
    /// concurrently.
    Units,

    /// Everything runs serially on the calling thread.
    None,
}

impl Parallelism {
    /// The accepted string forms.
    pub fn variants() -> [&'static str; 4] {
        ["all", "namespaces", "units", "none"]
    }

    pub(crate) fn namespaces_parallel(self) -> bool {
        matches!(self, Parallelism::All | Parallelism::Namespaces)
    }

    pub(crate) fn units_parallel(self) -> bool {
        matches!(self, Parallelism::All | Parallelism::Units)
    }
}

impl Default for Parallelism {
    fn default() -> Self {
        Parallelism::All
    }
}

impl fmt::Display for Parallelism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parallelism::All => write!(f, "all"),
            Parallelism::Namespaces => write!(f, "namespaces"),
            Parallelism::Units => write!(f, "units"),
            Parallelism::None => write!(f, "none"),
        }
    }
}

impl FromStr for Parallelism {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let val = match s {
            "all" => Parallelism::All,
            "namespaces" => Parallelism::Namespaces,
            "units" => Parallelism::Units,
            "none" => Parallelism::None,
            other => bail!("unrecognized value for parallelism: {}", other),
        };
        Ok(val)
    }
}

/// Result counters for a run or any slice of one.
///
/// Combination is field-wise addition, so per-namespace counters can be
/// merged in any order.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunStats {
    /// The number of units whose executable was invoked.
    pub tests: usize,

    /// The number of units that passed.
    pub passed: usize,

    /// The number of units that failed.
    pub failed: usize,

    /// The number of uncaught faults, in unit bodies or fixtures.
    pub errored: usize,
}

impl RunStats {
    /// Field-wise sum of two counter sets.
    pub fn combine(self, other: RunStats) -> RunStats {
        RunStats {
            tests: self.tests + other.tests,
            passed: self.passed + other.passed,
            failed: self.failed + other.failed,
            errored: self.errored + other.errored,
        }
    }

    /// Returns true if no failures or faults were recorded.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.errored == 0
    }
}

impl std::iter::Sum for RunStats {
    fn sum<I: Iterator<Item = RunStats>>(iter: I) -> Self {
        iter.fold(RunStats::default(), RunStats::combine)
    }
}

/// What one call to the run entry point produced.
#[derive(Copy, Clone, Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunSummary {
    /// Aggregated counters across every namespace.
    pub stats: RunStats,

    /// Total wall-clock duration of the run.
    pub elapsed: Duration,
}

impl RunSummary {
    /// Returns true if no failures or faults were recorded.
    pub fn is_success(&self) -> bool {
        self.stats.is_success()
    }
}

/// Shared mutable state scoped to one run: the failure flag read by
/// fail-fast checks, and the lock that keeps synchronized units from
/// overlapping. Created at entry, discarded at exit, never a singleton.
#[derive(Debug, Default)]
pub(crate) struct RunContext {
    failed: AtomicBool,
    sync_lock: Mutex<()>,
}

impl RunContext {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_failure(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub(crate) fn has_failures(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn synchronized_guard(&self) -> MutexGuard<'_, ()> {
        self.sync_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Suite runner options.
#[derive(Clone, Debug)]
pub struct RunnerOpts {
    /// Which levels of the suite run concurrently.
    pub parallelism: Parallelism,

    /// Worker pool size [default: available parallelism + 2].
    pub threads: Option<usize>,

    /// Stop dispatching new units after the first failure or fault.
    pub fail_fast: bool,

    /// Wrap the run and each unit in the capture collaborator's scopes.
    pub capture_output: bool,

    /// Threshold above which a unit not flagged `known_slow` is reported
    /// as slow.
    pub test_warn_time: Option<Duration>,

    /// The output-capture collaborator.
    pub capture: DebugIgnore<Arc<dyn OutputCapture>>,
}

impl Default for RunnerOpts {
    fn default() -> Self {
        Self {
            parallelism: Parallelism::default(),
            threads: None,
            fail_fast: false,
            capture_output: true,
            test_warn_time: None,
            capture: DebugIgnore(Arc::new(NoCapture)),
        }
    }
}

impl RunnerOpts {
    /// Replaces the output-capture collaborator.
    pub fn with_capture(mut self, capture: Arc<dyn OutputCapture>) -> Self {
        self.capture = DebugIgnore(capture);
        self
    }

    /// Creates a new suite runner, building its worker pool.
    pub fn build(self) -> Result<SuiteRunner> {
        let threads = self.threads.unwrap_or_else(|| num_cpus::get() + 2);
        let pool = TaskPool::new(threads)?;
        Ok(SuiteRunner { opts: self, pool })
    }
}

/// Executes grouped test lists under the configured policy.
pub struct SuiteRunner {
    opts: RunnerOpts,
    pool: TaskPool,
}

impl SuiteRunner {
    /// The options this runner was built with.
    pub fn opts(&self) -> &RunnerOpts {
        &self.opts
    }

    /// Runs the list, reporting through the default progress reporter.
    pub fn run(&self, list: &TestList) -> Result<RunSummary> {
        self.run_with(list, TestReporter::new(Color::Auto).into_sink())
    }

    /// Runs the list, reporting through the given sink.
    ///
    /// The sink is wrapped in the serializing lock regardless of policy, so
    /// events emitted from worker threads never interleave mid-emission.
    pub fn run_with(&self, list: &TestList, sink: ReportSink) -> Result<RunSummary> {
        if list.is_empty() {
            println!("No tests found.");
            return Ok(RunSummary {
                stats: RunStats::default(),
                elapsed: Duration::ZERO,
            });
        }

        let ctx = RunContext::new();
        let sink = SerializedSink::new(sink);
        debug!(
            test_count = list.test_count(),
            namespaces = list.namespace_count(),
            parallelism = %self.opts.parallelism,
            "starting test run"
        );

        let start = Instant::now();
        sink.report(&TestEvent::RunStarted {
            test_count: list.test_count(),
        });

        let stats = if self.opts.capture_output {
            let mut stats: Result<RunStats> = Ok(RunStats::default());
            self.opts
                .capture
                .with_capture(&mut || stats = self.run_namespaces(list, &ctx, &sink));
            stats?
        } else {
            self.run_namespaces(list, &ctx, &sink)?
        };

        let elapsed = start.elapsed();
        sink.report(&TestEvent::RunFinished { stats, elapsed });
        Ok(RunSummary { stats, elapsed })
    }

    // ---
    // Helper methods
    // ---

    fn run_namespaces(
        &self,
        list: &TestList,
        ctx: &RunContext,
        sink: &SerializedSink,
    ) -> Result<RunStats> {
        let per_namespace = if self.opts.parallelism.namespaces_parallel() {
            let tasks: Vec<_> = list
                .iter()
                .map(|group| move || self.run_namespace(group, ctx, sink))
                .collect();
            self.pool.run_all(tasks)?
        } else {
            let mut per_namespace = Vec::with_capacity(list.namespace_count());
            for group in list.iter() {
                per_namespace.push(self.run_namespace(group, ctx, sink)?);
            }
            per_namespace
        };
        Ok(per_namespace.into_iter().sum())
    }

    /// Runs one namespace: begin event, once-fixture around all unit
    /// dispatch, end event, then the namespace's counters.
    fn run_namespace(
        &self,
        group: &NamespaceGroup,
        ctx: &RunContext,
        sink: &SerializedSink,
    ) -> Result<RunStats> {
        let namespace = group.namespace.name.clone();
        debug!(namespace = %namespace, units = group.instances.len(), "running namespace");
        sink.report(&TestEvent::NamespaceStarted {
            namespace: namespace.clone(),
        });

        let counters = CounterSet::default();
        let path = TestPath::namespace(&group.namespace.name);
        let mut dispatched: Result<()> = Ok(());
        guarded_fixture(
            group.namespace.once_fixture.as_deref(),
            &path,
            &counters,
            ctx,
            sink,
            &mut || dispatched = self.dispatch_units(group, &counters, ctx, sink),
        );
        dispatched?;

        sink.report(&TestEvent::NamespaceFinished { namespace });
        Ok(counters.snapshot())
    }

    fn dispatch_units(
        &self,
        group: &NamespaceGroup,
        counters: &CounterSet,
        ctx: &RunContext,
        sink: &SerializedSink,
    ) -> Result<()> {
        if self.opts.parallelism.units_parallel() {
            let (synchronized, concurrent): (Vec<&TestInstance>, Vec<&TestInstance>) = group
                .instances
                .iter()
                .partition(|instance| instance.synchronized);

            // Synchronized units first, serially and in grouping order.
            for instance in synchronized {
                run_unit(group, instance, counters, ctx, sink, &self.opts);
            }

            let tasks: Vec<_> = concurrent
                .into_iter()
                .map(|instance| {
                    move || -> Result<()> {
                        run_unit(group, instance, counters, ctx, sink, &self.opts);
                        Ok(())
                    }
                })
                .collect();
            self.pool.run_all(tasks)?;
        } else {
            for instance in &group.instances {
                run_unit(group, instance, counters, ctx, sink, &self.opts);
            }
        }
        Ok(())
    }
}

/// Groups `units` by namespace and runs them with the given options,
/// reporting through the default progress reporter.
pub fn run_tests(units: impl IntoIterator<Item = TestUnit>, opts: RunnerOpts) -> Result<RunSummary> {
    let list = TestList::new(units);
    opts.build()?.run(&list)
}
