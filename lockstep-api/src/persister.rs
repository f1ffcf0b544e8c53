use std::collections::HashMap;

use lockstep_common::error::LockstepResult;
use lockstep_common::types::{PartitionId, PartitionSnapshot, VertexState};

/// Checkpoint and result sink. The contract is round-trip fidelity:
/// whatever is persisted for a superstep loads back identically.
pub trait Persister: Send + Sync {
    fn persist_master(
        &self,
        superstep: u64,
        partition_map: &HashMap<PartitionId, String>,
    ) -> LockstepResult<()>;

    fn load_master(&self, superstep: u64) -> LockstepResult<HashMap<PartitionId, String>>;

    fn persist_partition(
        &self,
        superstep: u64,
        partition: PartitionId,
        snapshot: &PartitionSnapshot,
    ) -> LockstepResult<()>;

    fn load_partition(
        &self,
        superstep: u64,
        partition: PartitionId,
    ) -> LockstepResult<PartitionSnapshot>;

    /// Final-state sink for the WRITE_RESULTS phase.
    fn write_results(
        &self,
        partition: PartitionId,
        vertices: &[VertexState],
    ) -> LockstepResult<()>;
}
