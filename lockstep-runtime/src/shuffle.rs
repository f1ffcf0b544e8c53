use lockstep_common::error::{LockstepError, LockstepResult};
use lockstep_common::types::PartitionId;
use std::collections::HashMap;

/// A vertex belongs to partition `hash(id) mod P`.
pub fn partition_of(vertex_id: &str, partitions: usize) -> PartitionId {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::Hasher;
    let mut h = DefaultHasher::new();
    h.write(vertex_id.as_bytes());
    ((h.finish() as usize) % partitions.max(1)) as PartitionId
}

/// Resolve the partition and owning worker for a vertex id.
pub fn owner_of<'a>(
    partition_map: &'a HashMap<PartitionId, String>,
    vertex_id: &str,
) -> LockstepResult<(PartitionId, &'a str)> {
    let p = partition_of(vertex_id, partition_map.len());
    partition_map
        .get(&p)
        .map(|hp| (p, hp.as_str()))
        .ok_or_else(|| LockstepError::Internal(format!("partition {p} has no owner")))
}
