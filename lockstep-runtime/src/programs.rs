use lockstep_api::{Context, Program};
use lockstep_common::error::{LockstepError, LockstepResult};
use lockstep_common::types::{Message, VertexState};

fn decode_u64(bytes: &[u8]) -> LockstepResult<u64> {
    bincode::deserialize(bytes).map_err(|e| LockstepError::Internal(format!("decode u64: {e}")))
}

fn encode_u64(value: u64) -> LockstepResult<Vec<u8>> {
    bincode::serialize(&value).map_err(|e| LockstepError::Internal(format!("encode u64: {e}")))
}

/// Flood-max: every vertex adopts the largest value it has seen and
/// forwards improvements downstream. Converges when no value changes.
pub struct MaxValueProgram;

impl Program for MaxValueProgram {
    fn compute(
        &self,
        vertex: &mut VertexState,
        messages: &[Message],
        ctx: &mut dyn Context,
    ) -> LockstepResult<()> {
        let current = decode_u64(&vertex.value)?;
        let mut best = current;
        for m in messages {
            best = best.max(decode_u64(&m.payload)?);
        }

        if ctx.superstep() == 0 || best > current {
            vertex.value = encode_u64(best)?;
            let targets: Vec<String> =
                vertex.out_edges().iter().map(|e| e.target.clone()).collect();
            for target in targets {
                ctx.send_to(&target, encode_u64(best)?);
            }
        }
        vertex.vote_to_halt();
        Ok(())
    }
}

/// Passes a token down the out edges: the origin emits it in the first
/// superstep, every recipient forwards it once, and everyone halts each
/// step until the token falls off the end of the graph.
pub struct TokenForwardProgram {
    pub origin: String,
}

impl Program for TokenForwardProgram {
    fn compute(
        &self,
        vertex: &mut VertexState,
        messages: &[Message],
        ctx: &mut dyn Context,
    ) -> LockstepResult<()> {
        if ctx.superstep() == 0 && vertex.id == self.origin {
            for e in vertex.out_edges().to_vec() {
                ctx.send_to(&e.target, vertex.value.clone());
            }
        }
        for m in messages {
            for e in vertex.out_edges().to_vec() {
                ctx.send_to(&e.target, m.payload.clone());
            }
        }
        vertex.vote_to_halt();
        Ok(())
    }
}
