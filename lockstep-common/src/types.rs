use serde::{Deserialize, Serialize};

pub type PartitionId = u32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeState {
    pub target: String,
    pub value: Vec<u8>,
}

impl EdgeState {
    pub fn new(target: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            target: target.into(),
            value,
        }
    }
}

/// A vertex as held by its owning partition. The value is opaque to the
/// engine; programs interpret it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VertexState {
    pub id: String,
    pub value: Vec<u8>,
    pub active: bool,
    pub edges: Vec<EdgeState>,
}

impl VertexState {
    pub fn new(id: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            value,
            active: true,
            edges: Vec::new(),
        }
    }

    pub fn vertex_id(&self) -> &str {
        &self.id
    }

    pub fn out_edges(&self) -> &[EdgeState] {
        &self.edges
    }

    pub fn add_out_edge(&mut self, edge: EdgeState) {
        self.edges.push(edge);
    }

    pub fn remove_out_edge(&mut self, target: &str) {
        self.edges.retain(|e| e.target != target);
    }

    pub fn vote_to_halt(&mut self) {
        self.active = false;
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// A vertex-to-vertex message. Produced in superstep `s`, delivered at the
/// start of `s + 1`, discarded after.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub dest: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(dest: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            dest: dest.into(),
            payload,
        }
    }

    pub fn dest_vert_id(&self) -> &str {
        &self.dest
    }

    pub fn set_dest_vert_id(&mut self, dest: impl Into<String>) {
        self.dest = dest.into();
    }
}

/// A graph mutation, addressed to the owner of the mutated vertex and
/// applied between supersteps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Mutation {
    AddVertex(VertexState),
    RemoveVertex { id: String },
    AddEdge { source: String, edge: EdgeState },
    RemoveEdge { source: String, target: String },
}

impl Mutation {
    /// The vertex id whose owner must apply this mutation.
    pub fn dest_vert_id(&self) -> &str {
        match self {
            Mutation::AddVertex(v) => &v.id,
            Mutation::RemoveVertex { id } => id,
            Mutation::AddEdge { source, .. } => source,
            Mutation::RemoveEdge { source, .. } => source,
        }
    }
}

/// One partition's checkpoint unit: vertex state plus the messages and
/// mutations its vertices produced in the checkpointed superstep.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PartitionSnapshot {
    pub vertices: Vec<VertexState>,
    pub pending: Vec<Message>,
    pub mutations: Vec<Mutation>,
}
