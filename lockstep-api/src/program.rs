use lockstep_common::error::LockstepResult;
use lockstep_common::types::{EdgeState, Message, VertexState};

/// Capabilities available to a vertex program during one superstep.
/// Messages and mutations issued here are delivered before the next
/// superstep; nothing takes effect mid-step.
pub trait Context {
    fn superstep(&self) -> u64;

    /// Total vertex count as of the last committed phase.
    fn num_verts(&self) -> u64;

    fn send_to(&mut self, dest: &str, payload: Vec<u8>);

    fn add_vertex(&mut self, vertex: VertexState);

    fn remove_vertex(&mut self, id: &str);

    fn add_edge(&mut self, source: &str, edge: EdgeState);

    fn remove_edge(&mut self, source: &str, target: &str);
}

/// The user-supplied compute function, invoked once per superstep for
/// every local vertex that is active or has inbound messages.
pub trait Program: Send + Sync {
    fn compute(
        &self,
        vertex: &mut VertexState,
        messages: &[Message],
        ctx: &mut dyn Context,
    ) -> LockstepResult<()>;
}
