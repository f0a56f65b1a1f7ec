//! Query criteria for selecting groups and instances.

use std::collections::HashSet;
use std::path::PathBuf;

use super::record::{Instance, InstanceGroup};

/// AND-combined selection criteria. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Matches a group containing an instance with this id, or an instance
    /// by exact id.
    pub instance_id: Option<u32>,
    /// Matches a group by exact name.
    pub group_name: Option<String>,
    /// When filtering groups: the group's instance-name set must contain
    /// all of these. When filtering a single instance, at most one name may
    /// be given.
    pub instance_names: HashSet<String>,
    /// Matches a group by exact home directory.
    pub home: Option<PathBuf>,
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        self.instance_id.is_none()
            && self.group_name.is_none()
            && self.instance_names.is_empty()
            && self.home.is_none()
    }
}

/// Whether the filter matches the group, including whether the group holds
/// instances satisfying the instance-related fields.
pub(crate) fn group_matches(group: &InstanceGroup, filter: &Filter) -> bool {
    if let Some(home) = &filter.home
        && *home != group.home_dir
    {
        return false;
    }
    if let Some(name) = &filter.group_name
        && *name != group.name
    {
        return false;
    }
    if let Some(id) = filter.instance_id
        && !group.instances.iter().any(|i| i.id == id)
    {
        return false;
    }
    let names: HashSet<&str> = group.instances.iter().map(|i| i.name.as_str()).collect();
    filter
        .instance_names
        .iter()
        .all(|n| names.contains(n.as_str()))
}

/// Whether the instance-level fields match. Assumes the owning group was
/// already checked with [`group_matches`].
pub(crate) fn instance_matches(instance: &Instance, filter: &Filter) -> bool {
    (filter.instance_id.is_none() || filter.instance_id == Some(instance.id))
        && (filter.instance_names.is_empty() || filter.instance_names.contains(&instance.name))
}
