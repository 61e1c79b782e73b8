// Copyright (c) The suite-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use anyhow::{bail, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::atomic::{AtomicBool, Ordering},
    thread::Result as ThreadResult,
};
use tracing::debug;

/// Fixed-size worker pool for dispatching batches of tasks.
///
/// Batches are submitted all at once and awaited in submission order; the
/// first failure cancels every queued-but-unstarted sibling before
/// propagating. Tasks already running when a sibling fails run to
/// completion, so cancellation is best-effort, not a guarantee of no wasted
/// work.
pub(crate) struct TaskPool {
    pool: ThreadPool,
}

impl TaskPool {
    /// Builds a pool with `threads` task workers.
    pub(crate) fn new(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            // The scope driving a batch occupies a worker of its own.
            .num_threads(threads + 1)
            .thread_name(|idx| format!("suite-run-{}", idx))
            .build()?;
        Ok(Self { pool })
    }

    /// Runs every task, returning their results in submission order.
    ///
    /// All tasks are submitted immediately. If any task returns an error,
    /// queued tasks that haven't started are abandoned and the earliest
    /// failure (in submission order) is returned once the batch has joined.
    /// A panicking task is resumed on the caller the same way. Workers are
    /// always joined before this returns, on every exit path.
    pub(crate) fn run_all<T, F>(&self, tasks: Vec<F>) -> Result<Vec<T>>
    where
        T: Send,
        F: FnOnce() -> Result<T> + Send,
    {
        let task_count = tasks.len();
        debug!(task_count, "dispatching batch to worker pool");

        let canceled = AtomicBool::new(false);
        let canceled_ref = &canceled;
        let (sender, receiver) = crossbeam_channel::unbounded();

        self.pool.scope(move |scope| {
            for (index, task) in tasks.into_iter().enumerate() {
                let sender = sender.clone();
                scope.spawn(move |_| {
                    if canceled_ref.load(Ordering::Acquire) {
                        // Check for batch cancellation.
                        return;
                    }

                    let outcome = panic::catch_unwind(AssertUnwindSafe(task));
                    if !matches!(outcome, Ok(Ok(_))) {
                        canceled_ref.store(true, Ordering::Release);
                    }
                    // Failure to send means the receiver was dropped.
                    let _ = sender.send((index, outcome));
                });
            }
        });

        let mut slots: Vec<Option<ThreadResult<Result<T>>>> = Vec::with_capacity(task_count);
        slots.resize_with(task_count, || None);
        for (index, outcome) in receiver {
            slots[index] = Some(outcome);
        }

        // Fan-in in submission order. Canceled tasks never report a result,
        // so a missing slot is only legal when some task failed.
        let mut results = Vec::with_capacity(task_count);
        let mut missing = 0usize;
        for slot in slots {
            match slot {
                Some(Ok(Ok(value))) => results.push(value),
                Some(Ok(Err(error))) => return Err(error),
                Some(Err(payload)) => panic::resume_unwind(payload),
                None => missing += 1,
            }
        }
        if missing > 0 {
            bail!(
                "{} of {} pool tasks vanished without a reported failure",
                missing,
                task_count
            );
        }
        Ok(results)
    }
}
