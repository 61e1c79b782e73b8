// Copyright (c) The suite-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Concurrent, fixture-aware execution engine for namespaced test suites.
//!
//! Units are grouped into a [`test_list::TestList`] by namespace, then
//! dispatched by a [`runner::SuiteRunner`] under one of four
//! [`runner::Parallelism`] policies. Once- and each-fixtures wrap execution
//! at namespace and unit granularity, report events funnel through a
//! serialized sink, and per-namespace counters fold into a final
//! [`runner::RunSummary`].

pub mod capture;
mod fixture;
mod pool;
pub mod reporter;
pub mod runner;
pub mod test_list;
