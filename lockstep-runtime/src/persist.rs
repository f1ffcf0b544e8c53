use lockstep_api::Persister;
use lockstep_common::error::{LockstepError, LockstepResult};
use lockstep_common::types::{PartitionId, PartitionSnapshot, VertexState};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// File-backed checkpoint store and result sink. Layout under the base
/// directory: `step_<s>/partition_map.json`, `step_<s>/part_<pid>.bin`,
/// and `results/part_<pid>.csv`. Point every process of a job at the
/// same base so reassigned partitions stay loadable.
pub struct FsPersister {
    base: PathBuf,
}

impl FsPersister {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn step_dir(&self, superstep: u64) -> PathBuf {
        self.base.join(format!("step_{superstep}"))
    }

    fn results_dir(&self) -> PathBuf {
        self.base.join("results")
    }

    fn write_file(path: &Path, bytes: &[u8]) -> LockstepResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(LockstepError::Io)?;
        }
        std::fs::write(path, bytes).map_err(LockstepError::Io)
    }
}

impl Persister for FsPersister {
    fn persist_master(
        &self,
        superstep: u64,
        partition_map: &HashMap<PartitionId, String>,
    ) -> LockstepResult<()> {
        let text = serde_json::to_string_pretty(partition_map)
            .map_err(|e| LockstepError::Internal(format!("encode partition map: {e}")))?;
        Self::write_file(
            &self.step_dir(superstep).join("partition_map.json"),
            text.as_bytes(),
        )
    }

    fn load_master(&self, superstep: u64) -> LockstepResult<HashMap<PartitionId, String>> {
        let path = self.step_dir(superstep).join("partition_map.json");
        let text = std::fs::read_to_string(&path).map_err(LockstepError::Io)?;
        serde_json::from_str(&text)
            .map_err(|e| LockstepError::Internal(format!("decode partition map: {e}")))
    }

    fn persist_partition(
        &self,
        superstep: u64,
        partition: PartitionId,
        snapshot: &PartitionSnapshot,
    ) -> LockstepResult<()> {
        let bytes = bincode::serialize(snapshot)
            .map_err(|e| LockstepError::Internal(format!("encode partition snapshot: {e}")))?;
        Self::write_file(
            &self.step_dir(superstep).join(format!("part_{partition}.bin")),
            &bytes,
        )
    }

    fn load_partition(
        &self,
        superstep: u64,
        partition: PartitionId,
    ) -> LockstepResult<PartitionSnapshot> {
        let path = self.step_dir(superstep).join(format!("part_{partition}.bin"));
        let bytes = std::fs::read(&path).map_err(LockstepError::Io)?;
        bincode::deserialize(&bytes)
            .map_err(|e| LockstepError::Internal(format!("decode partition snapshot: {e}")))
    }

    fn write_results(
        &self,
        partition: PartitionId,
        vertices: &[VertexState],
    ) -> LockstepResult<()> {
        let dir = self.results_dir();
        std::fs::create_dir_all(&dir).map_err(LockstepError::Io)?;
        let path = dir.join(format!("part_{partition}.csv"));
        let mut wtr = csv::Writer::from_path(&path)
            .map_err(|e| LockstepError::Internal(format!("open results: {e}")))?;
        for v in vertices {
            let value: u64 = bincode::deserialize(&v.value).map_err(|e| {
                LockstepError::InvalidArgument(format!("vertex {} value decode: {e}", v.id))
            })?;
            let value = value.to_string();
            wtr.write_record([v.id.as_str(), value.as_str()])
                .map_err(|e| LockstepError::Internal(format!("write results: {e}")))?;
        }
        wtr.flush().map_err(LockstepError::Io)?;
        Ok(())
    }
}
