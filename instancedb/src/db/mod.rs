//! The instance group database and its persisted record types.

mod database;
mod filter;
mod record;

pub use database::InstanceDatabase;
pub use filter::Filter;
pub use record::{
    Instance, InstanceGroup, PersistentData, UNSET_INSTANCE_ID, is_valid_group_name,
    is_valid_instance_name,
};
