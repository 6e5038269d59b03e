//! Build groups.
//!
//! A group is the set of translation units, include directories, and
//! libraries contributed by one project. Groups `use` the groups of their
//! dependency projects: exported includes, libraries, and auxiliary objects
//! flow transitively to dependents, private includes do not.

use crate::path::AbsPath;
use std::collections::BTreeMap;

pub type GroupId = usize;

#[derive(Debug, Clone, Default)]
pub struct GroupData {
    /// Translation units; the flag marks main units (each linked into its
    /// own executable).
    pub units: BTreeMap<AbsPath, bool>,
    /// Include directories; the flag marks exported ones.
    pub includes: BTreeMap<AbsPath, bool>,
    /// Libraries; dynamic libraries carry the runtime location they must be
    /// copied to, static libraries carry `None`.
    pub libraries: BTreeMap<AbsPath, Option<AbsPath>>,
    /// Groups this group uses.
    pub deps: Vec<GroupId>,
}

/// The transitive view of a group, memoized per group by the composer.
#[derive(Debug, Clone, Default)]
pub struct GroupAggregate {
    /// Every include directory visible to this group's units: its own plus
    /// the exported closure of its dependencies, deterministically ordered.
    pub includes: Vec<AbsPath>,
    /// The subset of `includes` that dependents inherit.
    pub exported_includes: Vec<AbsPath>,
    /// All libraries, own and inherited.
    pub libraries: BTreeMap<AbsPath, Option<AbsPath>>,
    /// Auxiliary (non-main) unit sources, own and inherited; these are
    /// compiled once and linked into every dependent executable.
    pub objects: Vec<AbsPath>,
}

/// Walk the dependency graph of `gid`, merging exported items. `memo` makes
/// the walk linear in the number of groups.
pub fn aggregate(
    groups: &[GroupData],
    gid: GroupId,
    memo: &mut BTreeMap<GroupId, GroupAggregate>,
) -> GroupAggregate {
    if let Some(done) = memo.get(&gid) {
        return done.clone();
    }

    let data = &groups[gid];
    let mut includes: BTreeMap<AbsPath, ()> =
        data.includes.keys().map(|p| (p.clone(), ())).collect();
    let mut exported: BTreeMap<AbsPath, ()> = data
        .includes
        .iter()
        .filter(|(_, is_exported)| **is_exported)
        .map(|(p, _)| (p.clone(), ()))
        .collect();
    let mut libraries = data.libraries.clone();
    let mut objects: BTreeMap<AbsPath, ()> = data
        .units
        .iter()
        .filter(|(_, is_main)| !**is_main)
        .map(|(p, _)| (p.clone(), ()))
        .collect();

    for dep in data.deps.clone() {
        let inherited = aggregate(groups, dep, memo);
        for include in inherited.exported_includes {
            includes.insert(include.clone(), ());
            exported.insert(include, ());
        }
        libraries.extend(inherited.libraries);
        for object in inherited.objects {
            objects.insert(object, ());
        }
    }

    let result = GroupAggregate {
        includes: includes.into_keys().collect(),
        exported_includes: exported.into_keys().collect(),
        libraries,
        objects: objects.into_keys().collect(),
    };
    memo.insert(gid, result.clone());
    result
}
