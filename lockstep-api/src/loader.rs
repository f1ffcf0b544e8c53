use std::collections::HashMap;

use lockstep_common::error::LockstepResult;
use lockstep_common::types::VertexState;

/// Maps input sources to workers and reads them into vertices.
pub trait Loader: Send + Sync {
    /// Split `paths` over the registered workers, keyed by worker
    /// host:port. Workers absent from the result load nothing.
    fn assign_load(
        &self,
        workers: &[String],
        paths: &[String],
    ) -> LockstepResult<HashMap<String, Vec<String>>>;

    fn load(&self, path: &str) -> LockstepResult<Vec<VertexState>>;
}
