//! Domain API over the data viewer.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;

use crate::errors::{DbError, DbResult};
use crate::viewer::DataViewer;

use super::filter::{Filter, group_matches, instance_matches};
use super::record::{
    Instance, InstanceGroup, PersistentData, UNSET_INSTANCE_ID, is_valid_group_name,
    is_valid_instance_name,
};

/// Prefix for generated group names when the caller leaves the name empty.
const GENERATED_GROUP_PREFIX: &str = "group";

/// Database of instance groups shared by every process operating on the same
/// backing file.
///
/// All operations run as transactions of the underlying [`DataViewer`]:
/// queries under a shared lock, mutations under an exclusive lock with the
/// record's invariants re-checked after the value is loaded, so concurrent
/// mutations from uncoordinated processes cannot both succeed in violating
/// them.
pub struct InstanceDatabase {
    viewer: DataViewer,
}

impl InstanceDatabase {
    pub fn new(backing_file: impl Into<PathBuf>) -> Self {
        InstanceDatabase {
            viewer: DataViewer::new(backing_file),
        }
    }

    /// Whether the record contains zero groups.
    pub fn is_empty(&self) -> DbResult<bool> {
        self.viewer
            .with_shared_lock(|data| Ok(data.instance_groups.is_empty()))
    }

    /// Adds a new group, failing if its name or home directory is already
    /// taken, or if any of its instances has a taken id or an invalid name.
    ///
    /// An empty group name is replaced with a generated unique one. Returns
    /// the group as stored (generated name filled in, instance `group_name`
    /// fields normalized).
    pub fn add_instance_group(&self, group: InstanceGroup) -> DbResult<InstanceGroup> {
        validate_group_names(&group)?;
        self.viewer
            .with_exclusive_lock(move |data| insert_group(data, group))
    }

    /// Replaces the existing group with the same name.
    ///
    /// Groups are keyed by name; renaming a group is not expressible through
    /// this call. Fails if no group with the name exists or if the update
    /// would claim another group's home directory or instance ids.
    pub fn update_instance_group(&self, group: InstanceGroup) -> DbResult<()> {
        validate_group_names(&group)?;
        self.viewer.with_exclusive_lock(move |data| {
            let Some(index) = data
                .instance_groups
                .iter()
                .position(|g| g.name == group.name)
            else {
                return Err(DbError::InvariantViolation(format!(
                    "group not found (name = \"{}\")",
                    group.name
                )));
            };
            if let Some(other) = data
                .instance_groups
                .iter()
                .enumerate()
                .find(|(i, g)| *i != index && g.home_dir == group.home_dir)
                .map(|(_, g)| g)
            {
                return Err(DbError::InvariantViolation(format!(
                    "home directory {} is already taken by group \"{}\"",
                    group.home_dir.display(),
                    other.name
                )));
            }
            check_instance_ids(data, &group, Some(&group.name))?;
            let mut group = group;
            normalize_instances(&mut group);
            data.instance_groups[index] = group;
            Ok(())
        })
    }

    /// Replaces an existing instance in place, matched by instance id within
    /// the named group. Fails if either the group or the instance is missing,
    /// or if the new name collides inside the group.
    pub fn update_instance(&self, group_name: &str, instance: Instance) -> DbResult<()> {
        if !is_valid_instance_name(&instance.name) {
            return Err(DbError::InvariantViolation(format!(
                "instance name \"{}\" is invalid",
                instance.name
            )));
        }
        let group_name = group_name.to_string();
        self.viewer.with_exclusive_lock(move |data| {
            let Some(group) = data
                .instance_groups
                .iter_mut()
                .find(|g| g.name == group_name)
            else {
                return Err(DbError::InvariantViolation(format!(
                    "group not found (name = \"{group_name}\")"
                )));
            };
            let Some(index) = group.instances.iter().position(|i| i.id == instance.id) else {
                return Err(DbError::InvariantViolation(format!(
                    "instance not found (id = {}) in group \"{group_name}\"",
                    instance.id
                )));
            };
            if group
                .instances
                .iter()
                .any(|i| i.id != instance.id && i.name == instance.name)
            {
                return Err(DbError::InvariantViolation(format!(
                    "instance name \"{}\" is already taken in group \"{group_name}\"",
                    instance.name
                )));
            }
            let mut instance = instance;
            instance.group_name = group.name.clone();
            group.instances[index] = instance;
            Ok(())
        })
    }

    /// Returns a copy of all groups.
    pub fn instance_groups(&self) -> DbResult<Vec<InstanceGroup>> {
        self.viewer
            .with_shared_lock(|data| Ok(data.instance_groups.clone()))
    }

    /// Removes the named group. Returns whether a group was removed; a
    /// missing group is not an error.
    pub fn remove_instance_group(&self, group_name: &str) -> DbResult<bool> {
        self.viewer.with_exclusive_lock(|data| {
            let before = data.instance_groups.len();
            data.instance_groups.retain(|g| g.name != group_name);
            let removed = data.instance_groups.len() != before;
            if removed {
                tracing::debug!(group = group_name, "instance group removed");
            }
            Ok(removed)
        })
    }

    /// Removes every group, returning the groups that were present.
    pub fn clear(&self) -> DbResult<Vec<InstanceGroup>> {
        self.viewer
            .with_exclusive_lock(|data| Ok(std::mem::take(&mut data.instance_groups)))
    }

    /// Returns all groups satisfying the filter.
    pub fn find_groups(&self, filter: &Filter) -> DbResult<Vec<InstanceGroup>> {
        self.viewer
            .with_shared_lock(|data| Ok(find_groups_in(data, filter)))
    }

    /// Returns the single group satisfying the filter, erroring when zero or
    /// several match.
    pub fn find_group(&self, filter: &Filter) -> DbResult<InstanceGroup> {
        let mut groups = self.find_groups(filter)?;
        match groups.len() {
            0 => Err(DbError::NotFound(
                "no instance group matches the filter".into(),
            )),
            1 => Ok(groups.swap_remove(0)),
            n => Err(DbError::Ambiguous(format!(
                "{n} instance groups match the filter"
            ))),
        }
    }

    /// Returns the unique (instance, group) pair satisfying the filter,
    /// erroring when zero or several match.
    pub fn find_instance_with_group(
        &self,
        filter: &Filter,
    ) -> DbResult<(Instance, InstanceGroup)> {
        if filter.instance_names.len() > 1 {
            return Err(DbError::Ambiguous(format!(
                "can't find a single instance when {} instance names are specified",
                filter.instance_names.len()
            )));
        }
        self.viewer.with_shared_lock(|data| {
            let mut found: Option<(Instance, InstanceGroup)> = None;
            for group in &data.instance_groups {
                if !group_matches(group, filter) {
                    continue;
                }
                for instance in &group.instances {
                    if !instance_matches(instance, filter) {
                        continue;
                    }
                    if found.is_some() {
                        return Err(DbError::Ambiguous(
                            "found more than one matching instance".into(),
                        ));
                    }
                    found = Some((instance.clone(), group.clone()));
                }
            }
            found.ok_or_else(|| DbError::NotFound("found no matching instance".into()))
        })
    }

    /// Appends pre-built groups inside a single exclusive transaction, with
    /// the same checks as [`add_instance_group`](Self::add_instance_group).
    /// Either all groups are added or the file is unchanged.
    pub fn load_groups(&self, groups: Vec<InstanceGroup>) -> DbResult<()> {
        for group in &groups {
            validate_group_names(group)?;
        }
        self.viewer.with_exclusive_lock(move |data| {
            for group in groups {
                insert_group(data, group)?;
            }
            Ok(())
        })
    }

    pub fn set_translator_optout(&self, optout: bool) -> DbResult<()> {
        self.viewer.with_exclusive_lock(|data| {
            data.translator_optout = optout;
            Ok(())
        })
    }

    pub fn translator_optout(&self) -> DbResult<bool> {
        self.viewer
            .with_shared_lock(|data| Ok(data.translator_optout))
    }
}

fn find_groups_in(data: &PersistentData, filter: &Filter) -> Vec<InstanceGroup> {
    data.instance_groups
        .iter()
        .filter(|g| group_matches(g, filter))
        .cloned()
        .collect()
}

/// Name checks that don't need the record; run before taking the lock.
fn validate_group_names(group: &InstanceGroup) -> DbResult<()> {
    if !group.name.is_empty() && !is_valid_group_name(&group.name) {
        return Err(DbError::InvariantViolation(format!(
            "group name \"{}\" is ill-formed",
            group.name
        )));
    }
    let mut seen = HashSet::new();
    for instance in &group.instances {
        if !is_valid_instance_name(&instance.name) {
            return Err(DbError::InvariantViolation(format!(
                "instance name \"{}\" is invalid",
                instance.name
            )));
        }
        if !seen.insert(instance.name.as_str()) {
            return Err(DbError::InvariantViolation(format!(
                "duplicate instance name \"{}\" within the group",
                instance.name
            )));
        }
    }
    Ok(())
}

/// Uniqueness checks against the loaded record plus the insertion itself.
/// Shared by `add_instance_group` and `load_groups`.
fn insert_group(data: &mut PersistentData, mut group: InstanceGroup) -> DbResult<InstanceGroup> {
    if group.name.is_empty() {
        group.name = generate_group_name(data);
    }
    if data.group_by_name(&group.name).is_some() {
        return Err(DbError::InvariantViolation(format!(
            "an instance group already exists with name \"{}\"",
            group.name
        )));
    }
    if let Some(other) = data
        .instance_groups
        .iter()
        .find(|g| g.home_dir == group.home_dir)
    {
        return Err(DbError::InvariantViolation(format!(
            "home directory {} is already taken by group \"{}\"",
            group.home_dir.display(),
            other.name
        )));
    }
    check_instance_ids(data, &group, None)?;
    normalize_instances(&mut group);
    tracing::debug!(group = %group.name, instances = group.instances.len(), "instance group added");
    data.instance_groups.push(group.clone());
    Ok(group)
}

/// Verifies that no instance id of `group` (unset ids aside) is taken by any
/// other group. `skip_group` exempts the group being replaced.
fn check_instance_ids(
    data: &PersistentData,
    group: &InstanceGroup,
    skip_group: Option<&str>,
) -> DbResult<()> {
    let mut taken: HashMap<u32, (&str, &str)> = HashMap::new();
    for existing in &data.instance_groups {
        if skip_group == Some(existing.name.as_str()) {
            continue;
        }
        for instance in &existing.instances {
            if instance.id != UNSET_INSTANCE_ID {
                taken.insert(instance.id, (existing.name.as_str(), instance.name.as_str()));
            }
        }
    }
    let mut within = HashSet::new();
    for instance in &group.instances {
        if instance.id == UNSET_INSTANCE_ID {
            continue;
        }
        if let Some((owner_group, owner_instance)) = taken.get(&instance.id) {
            return Err(DbError::InvariantViolation(format!(
                "instance id {} is already taken by {owner_group}/{owner_instance}",
                instance.id
            )));
        }
        if !within.insert(instance.id) {
            return Err(DbError::InvariantViolation(format!(
                "duplicate instance id {} within the group",
                instance.id
            )));
        }
    }
    Ok(())
}

/// Stamps every instance with its owning group's name.
fn normalize_instances(group: &mut InstanceGroup) {
    for instance in &mut group.instances {
        instance.group_name = group.name.clone();
    }
}

/// Picks the first `group_<n>` not present in the record.
fn generate_group_name(data: &PersistentData) -> String {
    let names: HashSet<&str> = data
        .instance_groups
        .iter()
        .map(|g| g.name.as_str())
        .collect();
    let mut i = 1usize;
    loop {
        let candidate = format!("{GENERATED_GROUP_PREFIX}_{i}");
        if !names.contains(candidate.as_str()) {
            return candidate;
        }
        i += 1;
    }
}
