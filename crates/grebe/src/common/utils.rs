use crate::{PartitionName, RmId};

pub const DEFAULT_PARTITION: &str = "default";

/// Qualify a per-RM partition name so it is unique across resource managers.
///
/// An empty name maps to the default partition.
pub fn normalized_partition_name(name: &str, rm_id: &str) -> PartitionName {
    let name = if name.is_empty() {
        DEFAULT_PARTITION
    } else {
        name
    };
    format!("[{rm_id}]{name}")
}

/// Extract the owning RM id from a normalized partition name.
pub fn rm_id_from_partition_name(partition_name: &str) -> RmId {
    partition_name
        .strip_prefix('[')
        .and_then(|rest| rest.split_once(']'))
        .map(|(rm_id, _)| rm_id.to_string())
        .unwrap_or_default()
}

/// The per-RM partition name without the RM qualifier.
pub fn partition_name_without_rm_id(partition_name: &str) -> &str {
    partition_name
        .strip_prefix('[')
        .and_then(|rest| rest.split_once(']'))
        .map(|(_, name)| name)
        .unwrap_or(partition_name)
}
