//! Persisted record types.
//!
//! The backing file holds one serialized [`PersistentData`] value. Every
//! record carries a flattened map of unknown fields so that data written by
//! newer versions round-trips unchanged through older ones.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Instance id value meaning "not yet assigned". Unset ids are exempt from
/// the cross-group id-uniqueness check.
pub const UNSET_INSTANCE_ID: u32 = 0;

/// Root record stored in the backing file.
///
/// The default value is what an empty or absent backing file deserializes to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistentData {
    #[serde(default)]
    pub instance_groups: Vec<InstanceGroup>,

    /// Opt-out flag for the legacy CLI translator.
    #[serde(default)]
    pub translator_optout: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PersistentData {
    pub fn group_by_name(&self, name: &str) -> Option<&InstanceGroup> {
        self.instance_groups.iter().find(|g| g.name == name)
    }
}

/// A named collection of instances plus the host paths they run from.
///
/// Group names and home directories are unique across the whole record;
/// both are re-checked inside every mutating transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceGroup {
    pub name: String,
    pub home_dir: PathBuf,
    /// Where the host tools for this group live. Validated by the caller
    /// before insertion.
    pub host_artifacts_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InstanceGroup {
    pub fn new(
        name: impl Into<String>,
        home_dir: impl Into<PathBuf>,
        host_artifacts_path: impl Into<PathBuf>,
    ) -> Self {
        InstanceGroup {
            name: name.into(),
            home_dir: home_dir.into(),
            host_artifacts_path: host_artifacts_path.into(),
            start_time: Some(Utc::now()),
            instances: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn with_instances(mut self, instances: Vec<Instance>) -> Self {
        self.instances = instances;
        self
    }

    pub fn instance_by_id(&self, id: u32) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }
}

/// A single virtual-device record.
///
/// Ids are unique across all groups (0 meaning unset); names are unique
/// within their group. `group_name` always matches the owning group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub group_name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Instance {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Instance {
            id,
            name: name.into(),
            group_name: String::new(),
            extra: Map::new(),
        }
    }
}

fn is_valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Group names must start with a letter or underscore and contain only
/// `[A-Za-z0-9_-]`, so they stay usable as directory components and never
/// parse as instance ids.
pub fn is_valid_group_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(is_valid_name_char)
}

/// Instance names are non-empty `[A-Za-z0-9_-]` strings.
pub fn is_valid_instance_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(is_valid_name_char)
}
