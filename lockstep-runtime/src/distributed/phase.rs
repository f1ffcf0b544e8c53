use serde::{Deserialize, Serialize};
use std::fmt;

/// The control steps the master drives under a global barrier.
/// Registration precedes them and is not barrier-driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhaseId {
    PushTopology,
    LoadData,
    LoadPersisted,
    DistributeVertices,
    Recover,
    StepPrepare,
    Superstep,
    WriteResults,
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PhaseId::PushTopology => "push_topology",
            PhaseId::LoadData => "load_data",
            PhaseId::LoadPersisted => "load_persisted",
            PhaseId::DistributeVertices => "distribute_vertices",
            PhaseId::Recover => "recover",
            PhaseId::StepPrepare => "step_prepare",
            PhaseId::Superstep => "superstep",
            PhaseId::WriteResults => "write_results",
        };
        f.write_str(name)
    }
}
