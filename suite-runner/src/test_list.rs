// Copyright (c) The suite-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::reporter::{TestPath, UnitContext};
use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use debug_ignore::DebugIgnore;
use once_cell::sync::OnceCell;
use std::{collections::BTreeMap, sync::Arc};

/// A test executable.
///
/// Runs one unit and emits pass/fail/error events through the context's
/// bound report sink. The engine never inspects what the unit returns, only
/// the events it emits.
pub type UnitFn = Arc<dyn Fn(&UnitContext<'_>) + Send + Sync>;

/// A composed setup/teardown wrapper supplied by the collaborator.
///
/// The fixture must invoke the body it is given exactly once, with any
/// setup before and any teardown after.
pub type FixtureFn = Arc<dyn Fn(&mut dyn FnMut()) + Send + Sync>;

/// A namespace of tests: shared identity, fixtures, and the attribute
/// defaults its units inherit.
#[derive(Clone, Debug)]
pub struct Namespace {
    /// The namespace name, e.g. `db.migrations`.
    pub name: String,

    /// Fixture applied once around all of this namespace's units.
    pub once_fixture: Option<DebugIgnore<FixtureFn>>,

    /// Fixture applied around each individual unit.
    pub each_fixture: Option<DebugIgnore<FixtureFn>>,

    /// Default for units that don't set their own `synchronized` flag.
    pub synchronized: bool,

    /// Default for units that don't set their own `known_slow` flag.
    pub known_slow: bool,
}

impl Namespace {
    /// Creates a namespace with no fixtures and default flags.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            once_fixture: None,
            each_fixture: None,
            synchronized: false,
            known_slow: false,
        }
    }

    /// Attaches the composed once-per-namespace fixture.
    pub fn with_once_fixture(mut self, fixture: FixtureFn) -> Self {
        self.once_fixture = Some(DebugIgnore(fixture));
        self
    }

    /// Attaches the composed once-per-unit fixture.
    pub fn with_each_fixture(mut self, fixture: FixtureFn) -> Self {
        self.each_fixture = Some(DebugIgnore(fixture));
        self
    }

    /// Sets the namespace-level `synchronized` default.
    pub fn with_synchronized(mut self, synchronized: bool) -> Self {
        self.synchronized = synchronized;
        self
    }

    /// Sets the namespace-level `known_slow` default.
    pub fn with_known_slow(mut self, known_slow: bool) -> Self {
        self.known_slow = known_slow;
        self
    }
}

/// A single test unit: identity, attribute overrides, and its executable.
///
/// Immutable for the duration of a run.
#[derive(Clone, Debug)]
pub struct TestUnit {
    /// The namespace this unit belongs to.
    pub namespace: Arc<Namespace>,

    /// The unit name within its namespace.
    pub name: String,

    /// Whether this unit must never run concurrently with other
    /// synchronized units. `None` inherits the namespace default.
    pub synchronized: Option<bool>,

    /// Whether this unit is expected to be slow, suppressing slow-test
    /// warnings. `None` inherits the namespace default.
    pub known_slow: Option<bool>,

    exec: DebugIgnore<UnitFn>,
}

impl TestUnit {
    /// Creates a unit owned by `namespace`.
    pub fn new(namespace: &Arc<Namespace>, name: impl Into<String>, exec: UnitFn) -> Self {
        Self {
            namespace: Arc::clone(namespace),
            name: name.into(),
            synchronized: None,
            known_slow: None,
            exec: DebugIgnore(exec),
        }
    }

    /// Overrides the inherited `synchronized` flag.
    pub fn with_synchronized(mut self, synchronized: bool) -> Self {
        self.synchronized = Some(synchronized);
        self
    }

    /// Overrides the inherited `known_slow` flag.
    pub fn with_known_slow(mut self, known_slow: bool) -> Self {
        self.known_slow = Some(known_slow);
        self
    }

    /// Invokes the unit executable with the given bound context.
    pub fn execute(&self, ctx: &UnitContext<'_>) {
        let exec: &UnitFn = &self.exec;
        (**exec)(ctx)
    }
}

/// A unit with its inherited attributes resolved to plain values, ready to
/// dispatch. Resolution happens once at grouping time so downstream
/// components never re-query the namespace.
#[derive(Clone, Debug)]
pub struct TestInstance {
    /// The underlying unit.
    pub unit: Arc<TestUnit>,

    /// Effective `synchronized` flag.
    pub synchronized: bool,

    /// Effective `known_slow` flag.
    pub known_slow: bool,
}

impl TestInstance {
    fn new(unit: TestUnit) -> Self {
        let synchronized = unit.synchronized.unwrap_or(unit.namespace.synchronized);
        let known_slow = unit.known_slow.unwrap_or(unit.namespace.known_slow);
        Self {
            unit: Arc::new(unit),
            synchronized,
            known_slow,
        }
    }

    /// The testing path for this instance.
    pub fn path(&self) -> TestPath {
        TestPath::test(&self.unit.namespace.name, &self.unit.name)
    }
}

/// A namespace together with the instances that will run under it.
#[derive(Clone, Debug)]
pub struct NamespaceGroup {
    /// The namespace identity and fixtures.
    pub namespace: Arc<Namespace>,

    /// The instances belonging to this namespace, in grouping order.
    pub instances: Vec<TestInstance>,
}

/// The full set of units for one run, grouped by namespace.
///
/// Namespaces iterate in name order. Two units naming the same namespace
/// land in the same group; the group keeps the first unit's `Namespace`
/// value, so fixtures should be attached consistently.
#[derive(Clone, Debug)]
pub struct TestList {
    groups: BTreeMap<String, NamespaceGroup>,
    test_count: usize,
    // Computed on first access.
    sync_count: OnceCell<usize>,
}

impl TestList {
    /// Groups the given units by namespace, resolving inherited attributes.
    pub fn new(units: impl IntoIterator<Item = TestUnit>) -> Self {
        let mut groups: BTreeMap<String, NamespaceGroup> = BTreeMap::new();
        let mut test_count = 0;
        for unit in units {
            let namespace = Arc::clone(&unit.namespace);
            groups
                .entry(namespace.name.clone())
                .or_insert_with(|| NamespaceGroup {
                    namespace,
                    instances: Vec::new(),
                })
                .instances
                .push(TestInstance::new(unit));
            test_count += 1;
        }
        Self {
            groups,
            test_count,
            sync_count: OnceCell::new(),
        }
    }

    /// Resolves the given sources through the discovery collaborator and
    /// groups everything they expand to.
    pub fn from_sources(
        sources: impl IntoIterator<Item = TestSource>,
        discovery: &dyn TestDiscovery,
    ) -> Result<Self> {
        let mut units = Vec::new();
        for source in sources {
            source.resolve_into(discovery, &mut units)?;
        }
        Ok(Self::new(units))
    }

    /// Total number of units across all namespaces.
    pub fn test_count(&self) -> usize {
        self.test_count
    }

    /// Number of namespaces with at least one unit.
    pub fn namespace_count(&self) -> usize {
        self.groups.len()
    }

    /// Number of units whose effective `synchronized` flag is set.
    pub fn sync_count(&self) -> usize {
        *self.sync_count.get_or_init(|| {
            self.iter_instances()
                .filter(|instance| instance.synchronized)
                .count()
        })
    }

    /// Returns true if the list holds no units.
    pub fn is_empty(&self) -> bool {
        self.test_count == 0
    }

    /// Returns the group for a namespace, if present.
    pub fn get(&self, namespace: &str) -> Option<&NamespaceGroup> {
        self.groups.get(namespace)
    }

    /// Iterates over namespace groups in name order.
    pub fn iter(&self) -> impl Iterator<Item = &NamespaceGroup> + '_ {
        self.groups.values()
    }

    /// Iterates over every instance across all groups.
    pub fn iter_instances(&self) -> impl Iterator<Item = &TestInstance> + '_ {
        self.groups.values().flat_map(|group| group.instances.iter())
    }
}

/// Something that describes test units: a single unit, a whole namespace, a
/// named reference, a path to discover, or any nested collection of these.
#[derive(Clone, Debug)]
pub enum TestSource {
    /// One unit, taken as-is.
    Unit(TestUnit),

    /// A namespace, expanded to all of its tagged units.
    Namespace(Arc<Namespace>),

    /// A named reference, resolved through the discovery collaborator and
    /// then expanded recursively.
    Name(String),

    /// A directory or file path; namespaces discovered under it are
    /// expanded.
    Path(Utf8PathBuf),

    /// A nested collection, flattened in order.
    Group(Vec<TestSource>),
}

/// Discovery collaborator: turns namespaces, names, and paths into units.
pub trait TestDiscovery {
    /// All tagged units belonging to the namespace.
    fn units_in(&self, namespace: &Arc<Namespace>) -> Result<Vec<TestUnit>>;

    /// Resolves a named reference to another source.
    fn resolve_name(&self, name: &str) -> Result<TestSource>;

    /// Discovers and loads the namespaces under a path.
    fn discover_path(&self, path: &Utf8Path) -> Result<Vec<Arc<Namespace>>>;
}

impl TestSource {
    /// Expands this source to a flat unit list.
    pub fn resolve(self, discovery: &dyn TestDiscovery) -> Result<Vec<TestUnit>> {
        let mut units = Vec::new();
        self.resolve_into(discovery, &mut units)?;
        Ok(units)
    }

    fn resolve_into(self, discovery: &dyn TestDiscovery, out: &mut Vec<TestUnit>) -> Result<()> {
        match self {
            TestSource::Unit(unit) => out.push(unit),
            TestSource::Namespace(namespace) => out.extend(discovery.units_in(&namespace)?),
            TestSource::Name(name) => {
                discovery.resolve_name(&name)?.resolve_into(discovery, out)?;
            }
            TestSource::Path(path) => {
                for namespace in discovery.discover_path(&path)? {
                    out.extend(discovery.units_in(&namespace)?);
                }
            }
            TestSource::Group(sources) => {
                for source in sources {
                    source.resolve_into(discovery, out)?;
                }
            }
        }
        Ok(())
    }
}
