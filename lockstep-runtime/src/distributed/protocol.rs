use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use lockstep_common::error::{LockstepError, LockstepResult};
use lockstep_common::types::{Message, Mutation, PartitionId, VertexState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::distributed::phase::PhaseId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseExec {
    pub phase: PhaseId,
    pub job_id: String,
    pub superstep: u64,
    pub num_verts: u64,
    pub checkpoint: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub worker_id: String,
    pub job_id: String,
    pub phase: PhaseId,
    pub active_verts: u64,
    pub num_verts: u64,
    pub sent_msgs: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyInfo {
    pub job_id: String,
    pub partition_map: HashMap<PartitionId, String>,
    pub load_assignments: HashMap<String, Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum MasterRequest {
    Register { host: String, port: u16 },
    EnterBarrier(PhaseSummary),
}

#[derive(Debug, Serialize, Deserialize)]
pub enum MasterResponse {
    Registered { job_id: String },
    Ack,
    Error { message: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum WorkerRequest {
    PushTopology(TopologyInfo),
    ExecutePhase(PhaseExec),
    DeliverVertices {
        job_id: String,
        vertices: Vec<VertexState>,
    },
    DeliverMessages {
        job_id: String,
        superstep: u64,
        messages: Vec<Message>,
        mutations: Vec<Mutation>,
    },
    Shutdown,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum WorkerResponse {
    Ack,
    Error { message: String },
}

pub type RpcFramed = Framed<TcpStream, LengthDelimitedCodec>;

pub fn framed(stream: TcpStream) -> RpcFramed {
    Framed::new(stream, LengthDelimitedCodec::new())
}

pub async fn send_msg<T: Serialize>(framed: &mut RpcFramed, msg: &T) -> LockstepResult<()> {
    let bytes = bincode::serialize(msg)
        .map_err(|e| LockstepError::Internal(format!("bincode encode: {e}")))?;
    framed
        .send(Bytes::from(bytes))
        .await
        .map_err(|e| LockstepError::Internal(format!("send failed: {e}")))?;
    Ok(())
}

pub async fn recv_msg<T: for<'de> Deserialize<'de>>(framed: &mut RpcFramed) -> LockstepResult<T> {
    let bytes = framed
        .next()
        .await
        .ok_or_else(|| LockstepError::Internal("connection closed".to_string()))?
        .map_err(|e| LockstepError::Internal(format!("recv failed: {e}")))?;
    bincode::deserialize::<T>(&bytes)
        .map_err(|e| LockstepError::Internal(format!("bincode decode: {e}")))
}

/// One-shot RPC: dial, send the request, await a single response.
pub async fn request<Req, Resp>(addr: &str, req: &Req) -> LockstepResult<Resp>
where
    Req: Serialize,
    Resp: for<'de> Deserialize<'de>,
{
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| LockstepError::Internal(format!("connect {addr}: {e}")))?;
    let mut framed = framed(stream);
    send_msg(&mut framed, req).await?;
    recv_msg(&mut framed).await
}
