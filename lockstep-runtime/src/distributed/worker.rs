use lockstep_api::{Context, Loader, Persister, Program};
use lockstep_common::error::{LockstepError, LockstepResult};
use lockstep_common::types::{
    EdgeState, Message, Mutation, PartitionId, PartitionSnapshot, VertexState,
};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::distributed::phase::PhaseId;
use crate::distributed::protocol::{
    framed, recv_msg, request, send_msg, MasterRequest, MasterResponse, PhaseExec, PhaseSummary,
    TopologyInfo, WorkerRequest, WorkerResponse,
};
use crate::shuffle;

const REGISTER_RETRY: Duration = Duration::from_millis(200);

pub struct WorkerConfig {
    pub listen_addr: SocketAddr,
    pub master_addr: SocketAddr,
}

#[derive(Default)]
struct Partition {
    vertices: BTreeMap<String, VertexState>,
}

struct WorkerState {
    job_id: String,
    host_port: String,
    superstep: u64,
    topology: Option<TopologyInfo>,
    partitions: BTreeMap<PartitionId, Partition>,
    /// Vertices loaded locally but owned elsewhere, shipped out at the
    /// end of the load phase.
    foreign: Vec<VertexState>,
    /// Messages delivered to vertices this superstep, keyed by vertex id.
    inboxes: HashMap<String, Vec<Message>>,
    /// Messages and mutations produced this superstep, tagged with the
    /// producing partition so checkpoints can bucket them.
    outgoing: Vec<(PartitionId, Message)>,
    out_mutations: Vec<(PartitionId, Mutation)>,
    /// Arrivals for the next superstep, promoted at STEP_PREPARE.
    postbox: Vec<Message>,
    pending_mutations: Vec<Mutation>,
}

#[derive(Clone)]
struct Worker {
    master_addr: String,
    program: Arc<dyn Program>,
    loader: Arc<dyn Loader>,
    persister: Arc<dyn Persister>,
    state: Arc<Mutex<WorkerState>>,
    shutdown_tx: watch::Sender<bool>,
}

struct StepContext<'a> {
    superstep: u64,
    num_verts: u64,
    partition: PartitionId,
    sends: &'a mut Vec<(PartitionId, Message)>,
    mutations: &'a mut Vec<(PartitionId, Mutation)>,
}

impl Context for StepContext<'_> {
    fn superstep(&self) -> u64 {
        self.superstep
    }

    fn num_verts(&self) -> u64 {
        self.num_verts
    }

    fn send_to(&mut self, dest: &str, payload: Vec<u8>) {
        self.sends.push((self.partition, Message::new(dest, payload)));
    }

    fn add_vertex(&mut self, vertex: VertexState) {
        self.mutations
            .push((self.partition, Mutation::AddVertex(vertex)));
    }

    fn remove_vertex(&mut self, id: &str) {
        self.mutations.push((
            self.partition,
            Mutation::RemoveVertex { id: id.to_string() },
        ));
    }

    fn add_edge(&mut self, source: &str, edge: EdgeState) {
        self.mutations.push((
            self.partition,
            Mutation::AddEdge {
                source: source.to_string(),
                edge,
            },
        ));
    }

    fn remove_edge(&mut self, source: &str, target: &str) {
        self.mutations.push((
            self.partition,
            Mutation::RemoveEdge {
                source: source.to_string(),
                target: target.to_string(),
            },
        ));
    }
}

/// Run a worker until the master shuts the job down. Registers with the
/// master (retrying until it is reachable), then serves topology pushes,
/// phase executions, and peer deliveries.
pub async fn run_worker(
    config: WorkerConfig,
    program: Arc<dyn Program>,
    loader: Arc<dyn Loader>,
    persister: Arc<dyn Persister>,
) -> LockstepResult<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .map_err(|e| LockstepError::Internal(format!("bind worker: {e}")))?;
    let host = config.listen_addr.ip().to_string();
    let port = listener.local_addr().map_err(LockstepError::Io)?.port();
    let host_port = format!("{host}:{port}");
    let master_addr = config.master_addr.to_string();

    let job_id = register(&master_addr, &host, port).await?;
    info!(worker = %host_port, job = %job_id, "joined job");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let worker = Worker {
        master_addr,
        program,
        loader,
        persister,
        state: Arc::new(Mutex::new(WorkerState {
            job_id,
            host_port,
            superstep: 0,
            topology: None,
            partitions: BTreeMap::new(),
            foreign: Vec::new(),
            inboxes: HashMap::new(),
            outgoing: Vec::new(),
            out_mutations: Vec::new(),
            postbox: Vec::new(),
            pending_mutations: Vec::new(),
        })),
        shutdown_tx,
    };

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(conn) => conn,
                    Err(_) => continue,
                };
                let worker = worker.clone();
                tokio::spawn(async move {
                    let _ = worker.handle_connection(stream).await;
                });
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn register(master_addr: &str, host: &str, port: u16) -> LockstepResult<String> {
    loop {
        let req = MasterRequest::Register {
            host: host.to_string(),
            port,
        };
        match request::<_, MasterResponse>(master_addr, &req).await {
            Ok(MasterResponse::Registered { job_id }) => return Ok(job_id),
            Ok(MasterResponse::Error { message }) => return Err(LockstepError::Worker(message)),
            Ok(_) => {
                return Err(LockstepError::Protocol(
                    "unexpected registration response".to_string(),
                ))
            }
            Err(_) => sleep(REGISTER_RETRY).await,
        }
    }
}

impl Worker {
    async fn handle_connection(&self, stream: TcpStream) -> LockstepResult<()> {
        let mut framed = framed(stream);
        loop {
            let req: WorkerRequest = recv_msg(&mut framed).await?;
            match req {
                WorkerRequest::PushTopology(top) => {
                    let resp = self.install_topology(top).await;
                    send_msg(&mut framed, &resp).await?;
                }
                WorkerRequest::ExecutePhase(exec) => {
                    // Execution is asynchronous; the summary reaches the
                    // master through EnterBarrier, not this connection.
                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.run_phase(exec).await;
                    });
                    send_msg(&mut framed, &WorkerResponse::Ack).await?;
                }
                WorkerRequest::DeliverVertices { job_id, vertices } => {
                    let resp = self.accept_vertices(job_id, vertices).await;
                    send_msg(&mut framed, &resp).await?;
                }
                WorkerRequest::DeliverMessages {
                    job_id,
                    messages,
                    mutations,
                    ..
                } => {
                    let resp = self.accept_messages(job_id, messages, mutations).await;
                    send_msg(&mut framed, &resp).await?;
                }
                WorkerRequest::Shutdown => {
                    send_msg(&mut framed, &WorkerResponse::Ack).await?;
                    info!("shutdown requested");
                    let _ = self.shutdown_tx.send(true);
                    return Ok(());
                }
            }
        }
    }

    async fn install_topology(&self, top: TopologyInfo) -> WorkerResponse {
        let mut st = self.state.lock().await;
        if top.job_id != st.job_id {
            return WorkerResponse::Error {
                message: format!("job id mismatch: {}", top.job_id),
            };
        }
        let host_port = st.host_port.clone();
        let owned: Vec<PartitionId> = top
            .partition_map
            .iter()
            .filter(|(_, owner)| **owner == host_port)
            .map(|(pid, _)| *pid)
            .collect();
        st.partitions.retain(|pid, _| owned.contains(pid));
        for pid in owned {
            st.partitions.entry(pid).or_default();
        }
        debug!(
            partitions = st.partitions.len(),
            total = top.partition_map.len(),
            "installed topology"
        );
        st.topology = Some(top);
        WorkerResponse::Ack
    }

    async fn accept_vertices(&self, job_id: String, vertices: Vec<VertexState>) -> WorkerResponse {
        let mut st = self.state.lock().await;
        if job_id != st.job_id {
            return WorkerResponse::Error {
                message: format!("job id mismatch: {job_id}"),
            };
        }
        let partitions = match st.topology.as_ref() {
            Some(top) => top.partition_map.len(),
            None => {
                return WorkerResponse::Error {
                    message: "no topology installed".to_string(),
                }
            }
        };
        for v in vertices {
            let pid = shuffle::partition_of(&v.id, partitions);
            st.partitions
                .entry(pid)
                .or_default()
                .vertices
                .insert(v.id.clone(), v);
        }
        WorkerResponse::Ack
    }

    async fn accept_messages(
        &self,
        job_id: String,
        messages: Vec<Message>,
        mutations: Vec<Mutation>,
    ) -> WorkerResponse {
        let mut st = self.state.lock().await;
        if job_id != st.job_id {
            return WorkerResponse::Error {
                message: format!("job id mismatch: {job_id}"),
            };
        }
        st.postbox.extend(messages);
        st.pending_mutations.extend(mutations);
        WorkerResponse::Ack
    }

    async fn run_phase(&self, exec: PhaseExec) {
        let start = Instant::now();
        let (mut summary, outbound) = {
            let mut st = self.state.lock().await;
            match self.run_phase_locked(&mut st, &exec) {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(phase = %exec.phase, error = %e, "phase execution failed");
                    let mut summary = base_summary(&st, &exec);
                    summary.errors.push(e.to_string());
                    (summary, Vec::new())
                }
            }
        };

        // Deliveries happen outside the state lock so peer handlers can
        // make progress against us at the same time.
        for (peer, req) in outbound {
            match request::<_, WorkerResponse>(&peer, &req).await {
                Ok(WorkerResponse::Ack) => {}
                Ok(WorkerResponse::Error { message }) => {
                    summary.errors.push(format!("deliver to {peer}: {message}"));
                }
                Err(e) => {
                    summary.errors.push(format!("deliver to {peer}: {e}"));
                }
            }
        }

        if exec.phase == PhaseId::Superstep {
            metrics::counter!("lockstep_worker_superstep_sent_total")
                .increment(summary.sent_msgs);
            metrics::histogram!("lockstep_worker_superstep_duration_ms")
                .record(start.elapsed().as_secs_f64() * 1000.0);
        }

        if let Err(e) = request::<_, MasterResponse>(
            &self.master_addr,
            &MasterRequest::EnterBarrier(summary),
        )
        .await
        {
            warn!(phase = %exec.phase, error = %e, "failed to enter barrier");
        }
    }

    fn run_phase_locked(
        &self,
        st: &mut WorkerState,
        exec: &PhaseExec,
    ) -> LockstepResult<(PhaseSummary, Vec<(String, WorkerRequest)>)> {
        if exec.job_id != st.job_id {
            return Err(LockstepError::Protocol(format!(
                "job id mismatch: {}",
                exec.job_id
            )));
        }

        let mut sent: u64 = 0;
        let mut outbound = Vec::new();
        match exec.phase {
            PhaseId::PushTopology => {}
            PhaseId::LoadData => {
                self.phase_load_data(st)?;
                outbound = route_pending(st, &mut sent)?;
            }
            PhaseId::LoadPersisted => {
                sent = self.phase_load_persisted(st, exec.superstep)?;
            }
            PhaseId::DistributeVertices => {
                outbound = route_pending(st, &mut sent)?;
            }
            PhaseId::Recover => {
                st.superstep = exec.superstep;
                sent = (st.postbox.len() + st.pending_mutations.len()) as u64;
            }
            PhaseId::StepPrepare => {
                phase_step_prepare(st)?;
            }
            PhaseId::Superstep => {
                self.phase_superstep(st, exec)?;
                if exec.checkpoint {
                    self.checkpoint_partitions(st, exec.superstep)?;
                }
                outbound = route_pending(st, &mut sent)?;
            }
            PhaseId::WriteResults => {
                self.phase_write_results(st)?;
            }
        }

        let mut summary = base_summary(st, exec);
        summary.sent_msgs = sent;
        Ok((summary, outbound))
    }

    fn phase_load_data(&self, st: &mut WorkerState) -> LockstepResult<()> {
        let top = st
            .topology
            .clone()
            .ok_or_else(|| LockstepError::Internal("no topology installed".to_string()))?;
        reset_graph_state(st, &top);
        let paths = top
            .load_assignments
            .get(&st.host_port)
            .cloned()
            .unwrap_or_default();
        for path in &paths {
            let vertices = self.loader.load(path)?;
            debug!(%path, count = vertices.len(), "loaded vertices");
            for v in vertices {
                let (pid, owner) = shuffle::owner_of(&top.partition_map, &v.id)?;
                if owner == st.host_port {
                    st.partitions
                        .entry(pid)
                        .or_default()
                        .vertices
                        .insert(v.id.clone(), v);
                } else {
                    st.foreign.push(v);
                }
            }
        }
        Ok(())
    }

    fn phase_load_persisted(&self, st: &mut WorkerState, superstep: u64) -> LockstepResult<u64> {
        let top = st
            .topology
            .clone()
            .ok_or_else(|| LockstepError::Internal("no topology installed".to_string()))?;
        reset_graph_state(st, &top);
        let mut owned: Vec<PartitionId> = top
            .partition_map
            .iter()
            .filter(|(_, owner)| **owner == st.host_port)
            .map(|(pid, _)| *pid)
            .collect();
        owned.sort_unstable();

        let mut pending: u64 = 0;
        for pid in owned {
            let snapshot = self.persister.load_partition(superstep, pid)?;
            let part = st.partitions.entry(pid).or_default();
            for v in snapshot.vertices {
                part.vertices.insert(v.id.clone(), v);
            }
            pending += (snapshot.pending.len() + snapshot.mutations.len()) as u64;
            st.outgoing
                .extend(snapshot.pending.into_iter().map(|m| (pid, m)));
            st.out_mutations
                .extend(snapshot.mutations.into_iter().map(|m| (pid, m)));
        }
        debug!(superstep, pending, "loaded persisted partitions");
        Ok(pending)
    }

    fn phase_superstep(&self, st: &mut WorkerState, exec: &PhaseExec) -> LockstepResult<()> {
        st.superstep = exec.superstep;
        {
            let WorkerState {
                partitions,
                inboxes,
                outgoing,
                out_mutations,
                ..
            } = st;
            for (pid, part) in partitions.iter_mut() {
                for vertex in part.vertices.values_mut() {
                    let msgs = inboxes.remove(vertex.id.as_str());
                    if !vertex.is_active() && msgs.is_none() {
                        continue;
                    }
                    let msgs = msgs.unwrap_or_default();
                    let mut ctx = StepContext {
                        superstep: exec.superstep,
                        num_verts: exec.num_verts,
                        partition: *pid,
                        sends: &mut *outgoing,
                        mutations: &mut *out_mutations,
                    };
                    self.program.compute(vertex, &msgs, &mut ctx)?;
                }
            }
        }
        st.inboxes.clear();
        Ok(())
    }

    fn checkpoint_partitions(&self, st: &WorkerState, superstep: u64) -> LockstepResult<()> {
        for (pid, part) in &st.partitions {
            let snapshot = PartitionSnapshot {
                vertices: part.vertices.values().cloned().collect(),
                pending: st
                    .outgoing
                    .iter()
                    .filter(|(p, _)| p == pid)
                    .map(|(_, m)| m.clone())
                    .collect(),
                mutations: st
                    .out_mutations
                    .iter()
                    .filter(|(p, _)| p == pid)
                    .map(|(_, m)| m.clone())
                    .collect(),
            };
            self.persister
                .persist_partition(superstep, *pid, &snapshot)?;
        }
        debug!(superstep, "persisted local partitions");
        Ok(())
    }

    fn phase_write_results(&self, st: &WorkerState) -> LockstepResult<()> {
        for (pid, part) in &st.partitions {
            let vertices: Vec<VertexState> = part.vertices.values().cloned().collect();
            self.persister.write_results(*pid, &vertices)?;
        }
        Ok(())
    }
}

/// Promote queues for the next superstep: apply pending mutations, then
/// move the postbox into per-vertex inboxes. Receipt of a message
/// reactivates the vertex.
fn phase_step_prepare(st: &mut WorkerState) -> LockstepResult<()> {
    let top = st
        .topology
        .clone()
        .ok_or_else(|| LockstepError::Internal("no topology installed".to_string()))?;
    let partitions = top.partition_map.len();

    for mutation in std::mem::take(&mut st.pending_mutations) {
        apply_mutation(st, partitions, mutation);
    }

    st.inboxes.clear();
    for msg in std::mem::take(&mut st.postbox) {
        let pid = shuffle::partition_of(msg.dest_vert_id(), partitions);
        let delivered = st
            .partitions
            .get_mut(&pid)
            .and_then(|part| part.vertices.get_mut(msg.dest_vert_id()))
            .map(|vertex| vertex.set_active(true))
            .is_some();
        if delivered {
            st.inboxes.entry(msg.dest.clone()).or_default().push(msg);
        } else {
            debug!(dest = %msg.dest, "dropping message for unknown vertex");
        }
    }
    Ok(())
}

fn apply_mutation(st: &mut WorkerState, partitions: usize, mutation: Mutation) {
    match mutation {
        Mutation::AddVertex(v) => {
            let pid = shuffle::partition_of(&v.id, partitions);
            st.partitions
                .entry(pid)
                .or_default()
                .vertices
                .insert(v.id.clone(), v);
        }
        Mutation::RemoveVertex { id } => {
            let pid = shuffle::partition_of(&id, partitions);
            if let Some(part) = st.partitions.get_mut(&pid) {
                part.vertices.remove(&id);
            }
        }
        Mutation::AddEdge { source, edge } => {
            let pid = shuffle::partition_of(&source, partitions);
            match st
                .partitions
                .get_mut(&pid)
                .and_then(|part| part.vertices.get_mut(&source))
            {
                Some(vertex) => vertex.add_out_edge(edge),
                None => debug!(%source, "dropping edge-add for unknown vertex"),
            }
        }
        Mutation::RemoveEdge { source, target } => {
            match st
                .partitions
                .get_mut(&shuffle::partition_of(&source, partitions))
                .and_then(|part| part.vertices.get_mut(&source))
            {
                Some(vertex) => vertex.remove_out_edge(&target),
                None => debug!(%source, "dropping edge-remove for unknown vertex"),
            }
        }
    }
}

/// Route everything buffered for other owners: foreign vertices, produced
/// messages, produced mutations. Locally owned traffic short-circuits
/// into the postbox and pending-mutation queues. `sent` counts messages
/// and mutations (not vertices), producer side.
fn route_pending(
    st: &mut WorkerState,
    sent: &mut u64,
) -> LockstepResult<Vec<(String, WorkerRequest)>> {
    let top = st
        .topology
        .clone()
        .ok_or_else(|| LockstepError::Internal("no topology installed".to_string()))?;

    let mut vertex_batches: HashMap<String, Vec<VertexState>> = HashMap::new();
    for v in std::mem::take(&mut st.foreign) {
        let (pid, owner) = shuffle::owner_of(&top.partition_map, &v.id)?;
        if owner == st.host_port {
            st.partitions
                .entry(pid)
                .or_default()
                .vertices
                .insert(v.id.clone(), v);
        } else {
            vertex_batches.entry(owner.to_string()).or_default().push(v);
        }
    }

    let mut message_batches: HashMap<String, Vec<Message>> = HashMap::new();
    for (_, msg) in std::mem::take(&mut st.outgoing) {
        *sent += 1;
        let (_, owner) = shuffle::owner_of(&top.partition_map, msg.dest_vert_id())?;
        if owner == st.host_port {
            st.postbox.push(msg);
        } else {
            message_batches
                .entry(owner.to_string())
                .or_default()
                .push(msg);
        }
    }

    let mut mutation_batches: HashMap<String, Vec<Mutation>> = HashMap::new();
    for (_, mutation) in std::mem::take(&mut st.out_mutations) {
        *sent += 1;
        let (_, owner) = shuffle::owner_of(&top.partition_map, mutation.dest_vert_id())?;
        if owner == st.host_port {
            st.pending_mutations.push(mutation);
        } else {
            mutation_batches
                .entry(owner.to_string())
                .or_default()
                .push(mutation);
        }
    }

    let mut outbound = Vec::new();
    for (peer, vertices) in vertex_batches {
        outbound.push((
            peer,
            WorkerRequest::DeliverVertices {
                job_id: st.job_id.clone(),
                vertices,
            },
        ));
    }
    let mut peers: Vec<String> = message_batches
        .keys()
        .chain(mutation_batches.keys())
        .cloned()
        .collect();
    peers.sort();
    peers.dedup();
    for peer in peers {
        outbound.push((
            peer.clone(),
            WorkerRequest::DeliverMessages {
                job_id: st.job_id.clone(),
                superstep: st.superstep,
                messages: message_batches.remove(&peer).unwrap_or_default(),
                mutations: mutation_batches.remove(&peer).unwrap_or_default(),
            },
        ));
    }
    Ok(outbound)
}

fn reset_graph_state(st: &mut WorkerState, top: &TopologyInfo) {
    st.partitions.clear();
    st.foreign.clear();
    st.inboxes.clear();
    st.outgoing.clear();
    st.out_mutations.clear();
    st.postbox.clear();
    st.pending_mutations.clear();
    for (pid, owner) in &top.partition_map {
        if *owner == st.host_port {
            st.partitions.insert(*pid, Partition::default());
        }
    }
}

fn base_summary(st: &WorkerState, exec: &PhaseExec) -> PhaseSummary {
    let num_verts: u64 = st
        .partitions
        .values()
        .map(|p| p.vertices.len() as u64)
        .sum();
    let active_verts: u64 = st
        .partitions
        .values()
        .flat_map(|p| p.vertices.values())
        .filter(|v| v.is_active())
        .count() as u64;
    PhaseSummary {
        worker_id: st.host_port.clone(),
        job_id: st.job_id.clone(),
        phase: exec.phase,
        active_verts,
        num_verts,
        sent_msgs: 0,
        errors: Vec::new(),
    }
}
