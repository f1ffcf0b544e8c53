use lockstep_api::Loader;
use lockstep_common::error::{LockstepError, LockstepResult};
use lockstep_common::types::{EdgeState, VertexState};
use std::collections::HashMap;

/// Line-based graph source: `id,value,target,target,...` with a u64
/// value column (defaulting to 0 when absent) and bare edge targets.
pub struct TextLoader;

impl Loader for TextLoader {
    fn assign_load(
        &self,
        workers: &[String],
        paths: &[String],
    ) -> LockstepResult<HashMap<String, Vec<String>>> {
        if workers.is_empty() {
            return Err(LockstepError::NoWorkersLeft);
        }
        let mut assignments: HashMap<String, Vec<String>> = HashMap::new();
        for (i, path) in paths.iter().enumerate() {
            assignments
                .entry(workers[i % workers.len()].clone())
                .or_default()
                .push(path.clone());
        }
        Ok(assignments)
    }

    fn load(&self, path: &str) -> LockstepResult<Vec<VertexState>> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .map_err(|e| LockstepError::Internal(format!("open {path}: {e}")))?;

        let mut out = Vec::new();
        for rec in rdr.records() {
            let rec = rec.map_err(|e| LockstepError::Internal(format!("csv read: {e}")))?;
            let id = rec
                .get(0)
                .ok_or_else(|| LockstepError::InvalidArgument("vertex id missing".to_string()))?
                .trim()
                .to_string();
            if id.is_empty() {
                continue;
            }
            let value: u64 = rec
                .get(1)
                .map(|s| s.trim().parse())
                .transpose()
                .map_err(|e| {
                    LockstepError::InvalidArgument(format!("vertex value parse: {e}"))
                })?
                .unwrap_or(0);
            let value = bincode::serialize(&value)
                .map_err(|e| LockstepError::Internal(format!("encode vertex value: {e}")))?;
            let mut vertex = VertexState::new(id, value);
            for field in rec.iter().skip(2) {
                let target = field.trim();
                if !target.is_empty() {
                    vertex.add_out_edge(EdgeState::new(target, Vec::new()));
                }
            }
            out.push(vertex);
        }
        Ok(out)
    }
}
